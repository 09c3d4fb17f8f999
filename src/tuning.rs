//! Auto-tuning module
//!
//! Detects hardware capabilities and calculates optimal configuration values.
//! Reserves resources for the backing MariaDB servers while sizing the
//! routing worker pool.

use sysinfo::System;

/// Tuned configuration values based on hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Number of routing workers (the main worker is extra)
    pub routing_workers: usize,
    /// Per-worker command queue depth
    pub worker_queue_depth: usize,
    /// Per-connection read buffer size in bytes
    pub read_buffer_size: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            routing_workers: 2,
            worker_queue_depth: 10000,
            read_buffer_size: 64 * 1024,
            detected_cores: 4,
            detected_ram_mb: 8192,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / 1024 / 1024
}

/// Auto-tune configuration based on detected hardware
///
/// Allocation strategy:
/// - one routing worker per core, capped at 8, leaving headroom for any
///   co-located database server
/// - read buffers scale with RAM, between 16 KiB and 64 KiB
pub fn auto_tune() -> TunedConfig {
    let cores = detect_cpu_cores();
    let ram_mb = detect_ram_mb();

    let routing_workers = cores.saturating_sub(1).clamp(1, 8);

    // Queue depth: enough for a burst of cross-worker posts per connection
    let worker_queue_depth = 10000;

    let read_buffer_size = if ram_mb >= 4096 {
        64 * 1024
    } else {
        16 * 1024
    };

    let config = TunedConfig {
        routing_workers,
        worker_queue_depth,
        read_buffer_size,
        detected_cores: cores,
        detected_ram_mb: ram_mb,
    };

    tracing::info!(
        cores = cores,
        ram_mb = ram_mb,
        routing_workers = config.routing_workers,
        read_buffer_size = config.read_buffer_size,
        "Auto-tuned configuration based on hardware"
    );

    config
}

/// Get a human-readable summary of the tuned configuration
pub fn tuning_summary(config: &TunedConfig) -> String {
    format!(
        "Detected: {} cores, {} MB RAM\n\
         WolfRelay: {} routing workers + 1 main worker\n\
         Buffers: read_buffer_size={}, worker_queue_depth={}",
        config.detected_cores,
        config.detected_ram_mb,
        config.routing_workers,
        config.read_buffer_size,
        config.worker_queue_depth,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tune_returns_sensible_values() {
        let config = auto_tune();

        assert!(config.routing_workers >= 1);
        assert!(config.routing_workers <= 8);

        assert!(config.read_buffer_size >= 16 * 1024);
        assert!(config.worker_queue_depth >= config.routing_workers);
    }

    #[test]
    fn test_detection_returns_positive_values() {
        let cores = detect_cpu_cores();
        let ram = detect_ram_mb();

        assert!(cores >= 1);
        assert!(ram > 0);
    }
}
