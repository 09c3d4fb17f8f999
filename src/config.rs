//! WolfRelay Configuration
//!
//! This module provides configuration structures for the WolfRelay
//! protocol proxy and binlog relay.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfRelay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfRelayConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Client listener configuration
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Backend server definitions
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,

    /// Cluster monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Binlog router configuration
    #[serde(default)]
    pub binlog: BinlogConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Performance auto-tuning configuration
    #[serde(default)]
    pub performance: PerformanceConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data directory for binlogs, journals and state storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Client listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Enable the MySQL client listener
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listener bind address
    #[serde(default = "default_listen_address")]
    pub bind_address: String,

    /// Enable SSL/TLS for client connections
    #[serde(default)]
    pub ssl_enabled: bool,

    /// Path to SSL certificate file (PEM format)
    #[serde(default)]
    pub ssl_cert: Option<PathBuf>,

    /// Path to SSL private key file (PEM format)
    #[serde(default)]
    pub ssl_key: Option<PathBuf>,

    /// Require SSL from clients (reject non-SSL connections)
    #[serde(default)]
    pub ssl_required: bool,

    /// User for backend connections opened on behalf of clients
    #[serde(default)]
    pub backend_user: String,

    /// Password for backend connections
    #[serde(default)]
    pub backend_password: String,

    /// Write-queue length (bytes) above which reads on the peer are paused
    #[serde(default = "default_high_water")]
    pub high_water: usize,

    /// Write-queue length (bytes) below which paused reads resume
    #[serde(default = "default_low_water")]
    pub low_water: usize,

    /// Maximum bytes read from one socket in a single event-loop turn
    #[serde(default = "default_max_read_amount")]
    pub max_read_amount: usize,
}

/// A monitored backend server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name
    pub name: String,

    /// Server address (hostname or IP), mutually exclusive with `socket`
    #[serde(default)]
    pub address: String,

    /// Unix socket path, mutually exclusive with `address`
    #[serde(default)]
    pub socket: Option<PathBuf>,

    /// Server port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Per-server monitor user override
    #[serde(default)]
    pub monitor_user: Option<String>,

    /// Per-server monitor password override
    #[serde(default)]
    pub monitor_password: Option<String>,

    /// Enable TLS towards this server
    #[serde(default)]
    pub ssl_enabled: bool,

    /// CA certificate for server TLS
    #[serde(default)]
    pub ssl_ca: Option<PathBuf>,

    /// Disk space limits, e.g. "/data:80" (path:max-used-percentage)
    #[serde(default)]
    pub disk_space_threshold: Option<String>,
}

/// Cluster monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Monitor name
    #[serde(default = "default_monitor_name")]
    pub name: String,

    /// Enable the monitor
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Names of the servers this monitor owns
    #[serde(default)]
    pub servers: Vec<String>,

    /// Monitor user
    #[serde(default)]
    pub user: String,

    /// Monitor password
    #[serde(default)]
    pub password: String,

    /// Tick interval in milliseconds
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Read timeout in seconds
    #[serde(default = "default_rw_timeout")]
    pub read_timeout_secs: u64,

    /// Write timeout in seconds
    #[serde(default = "default_rw_timeout")]
    pub write_timeout_secs: u64,

    /// Connection attempts per probe
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Maximum journal age in seconds before it is discarded on startup
    #[serde(default = "default_journal_max_age")]
    pub journal_max_age_secs: u64,

    /// Script launched on state-change events
    #[serde(default)]
    pub script: Option<String>,

    /// Script execution timeout in seconds
    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,

    /// Event names the script subscribes to (empty = all)
    #[serde(default)]
    pub events: Vec<String>,
}

/// Binlog router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogConfig {
    /// Enable the binlog router
    #[serde(default)]
    pub enabled: bool,

    /// Listener address for downstream replicas
    #[serde(default = "default_binlog_listen_address")]
    pub listen_address: String,

    /// Server ID this relay registers with upstream
    #[serde(default = "default_binlog_server_id")]
    pub server_id: u32,

    /// Binlog file stem, e.g. "mariadb-bin"
    #[serde(default = "default_fileroot")]
    pub fileroot: String,

    /// Directory for binlog files (defaults under node data_dir)
    #[serde(default)]
    pub binlog_dir: Option<PathBuf>,

    /// Only advance the advertised position on transaction boundaries
    #[serde(default = "default_true")]
    pub trx_safe: bool,

    /// Master heartbeat period in seconds (0 disables)
    #[serde(default = "default_master_heartbeat")]
    pub heartbeat_secs: u64,

    /// Send periodic heartbeat events to idle replicas
    #[serde(default)]
    pub send_slave_heartbeat: bool,

    /// Maximum events per catch-up burst
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Maximum bytes per catch-up burst
    #[serde(default = "default_burst_size")]
    pub burst_size: u64,

    /// Negotiate semi-sync replication with the master
    #[serde(default)]
    pub semi_sync: bool,

    /// Request MariaDB 10 GTID registration with the master
    #[serde(default = "default_true")]
    pub mariadb10_master_gtid: bool,

    /// Reject replicas whose requested GTID is absent from the index
    #[serde(default)]
    pub master_strict_gtid: bool,

    /// Refuse replicas that do not announce MariaDB 10 capabilities
    #[serde(default)]
    pub mariadb10_slave_only: bool,

    /// Verify CRC32 checksums on ingested events
    #[serde(default = "default_true")]
    pub checksums: bool,

    /// Encrypt binlog files at rest
    #[serde(default)]
    pub encrypt_binlog: bool,

    /// Encryption cipher: "aes_cbc" or "aes_ctr"
    #[serde(default = "default_encryption_algorithm")]
    pub encryption_algorithm: String,

    /// Path to the binlog encryption key file (hex-encoded key)
    #[serde(default)]
    pub encryption_key_file: Option<PathBuf>,

    /// Seconds between master reconnect attempts (scaled by backoff)
    #[serde(default = "default_connect_retry")]
    pub connect_retry_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

/// Performance auto-tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Enable automatic hardware detection and tuning
    #[serde(default = "default_true")]
    pub auto_tune: bool,

    /// Override: manually set routing worker count (0 = auto-detect)
    #[serde(default)]
    pub routing_workers: usize,

    /// Override: manually set per-worker command queue depth (0 = auto-detect)
    #[serde(default)]
    pub worker_queue_depth: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            auto_tune: true,
            routing_workers: 0,
            worker_queue_depth: 0,
        }
    }
}

fn default_db_port() -> u16 {
    3306
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_rw_timeout() -> u64 {
    10
}

fn default_connect_attempts() -> u32 {
    1
}

fn default_monitor_interval_ms() -> u64 {
    2000
}

fn default_monitor_name() -> String {
    "cluster-monitor".to_string()
}

fn default_journal_max_age() -> u64 {
    28800
}

fn default_script_timeout() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0:4006".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfrelay")
}

fn default_binlog_server_id() -> u32 {
    1001
}

fn default_binlog_listen_address() -> String {
    "0.0.0.0:4007".to_string()
}

fn default_fileroot() -> String {
    "mariadb-bin".to_string()
}

fn default_master_heartbeat() -> u64 {
    300
}

fn default_burst() -> u32 {
    1500
}

fn default_burst_size() -> u64 {
    1024 * 1024
}

fn default_encryption_algorithm() -> String {
    "aes_cbc".to_string()
}

fn default_connect_retry() -> u64 {
    60
}

/// High watermark default: 16 MiB of queued writes
fn default_high_water() -> usize {
    16 * 1024 * 1024
}

/// Low watermark default: 8 MiB of queued writes
fn default_low_water() -> usize {
    8 * 1024 * 1024
}

fn default_max_read_amount() -> usize {
    10 * 1024 * 1024
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_listen_address(),
            ssl_enabled: false,
            ssl_cert: None,
            ssl_key: None,
            ssl_required: false,
            backend_user: String::new(),
            backend_password: String::new(),
            high_water: default_high_water(),
            low_water: default_low_water(),
            max_read_amount: default_max_read_amount(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            name: default_monitor_name(),
            enabled: true,
            servers: Vec::new(),
            user: String::new(),
            password: String::new(),
            interval_ms: default_monitor_interval_ms(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_rw_timeout(),
            write_timeout_secs: default_rw_timeout(),
            connect_attempts: default_connect_attempts(),
            journal_max_age_secs: default_journal_max_age(),
            script: None,
            script_timeout_secs: default_script_timeout(),
            events: Vec::new(),
        }
    }
}

impl Default for BinlogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: default_binlog_listen_address(),
            server_id: default_binlog_server_id(),
            fileroot: default_fileroot(),
            binlog_dir: None,
            trx_safe: true,
            heartbeat_secs: default_master_heartbeat(),
            send_slave_heartbeat: false,
            burst: default_burst(),
            burst_size: default_burst_size(),
            semi_sync: false,
            mariadb10_master_gtid: true,
            master_strict_gtid: false,
            mariadb10_slave_only: false,
            checksums: true,
            encrypt_binlog: false,
            encryption_algorithm: default_encryption_algorithm(),
            encryption_key_file: None,
            connect_retry_secs: default_connect_retry(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl WolfRelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfRelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfRelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.listener.low_water >= self.listener.high_water {
            return Err(crate::Error::Config(
                "listener.low_water must be below listener.high_water".into(),
            ));
        }

        for server in &self.servers {
            if server.name.is_empty() {
                return Err(crate::Error::Config("server.name cannot be empty".into()));
            }
            if server.address.is_empty() && server.socket.is_none() {
                return Err(crate::Error::Config(format!(
                    "server '{}' needs either address or socket",
                    server.name
                )));
            }
        }

        for name in &self.monitor.servers {
            if !self.servers.iter().any(|s| &s.name == name) {
                return Err(crate::Error::Config(format!(
                    "monitor references unknown server '{}'",
                    name
                )));
            }
        }

        if self.binlog.enabled {
            match self.binlog.encryption_algorithm.as_str() {
                "aes_cbc" | "aes_ctr" => {}
                other => {
                    return Err(crate::Error::Config(format!(
                        "unknown binlog encryption algorithm '{}'",
                        other
                    )));
                }
            }
            if self.binlog.encrypt_binlog && self.binlog.encryption_key_file.is_none() {
                return Err(crate::Error::Config(
                    "binlog.encrypt_binlog requires binlog.encryption_key_file".into(),
                ));
            }
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the binlog directory path
    pub fn binlog_dir(&self) -> PathBuf {
        self.binlog
            .binlog_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("binlogs"))
    }

    /// Get the monitor journal file path
    pub fn journal_path(&self) -> PathBuf {
        self.node
            .data_dir
            .join(format!("{}_journal.json", self.monitor.name))
    }

    /// Get the monitor tick interval as Duration
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.interval_ms)
    }

    /// Get the master heartbeat period as Duration
    pub fn master_heartbeat(&self) -> Duration {
        Duration::from_secs(self.binlog.heartbeat_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [node]
        id = "relay-1"

        [[server]]
        name = "db1"
        address = "10.0.0.1"

        [monitor]
        servers = ["db1"]
        user = "monitor"
        password = "monitor"
    "#;

    #[test]
    fn test_minimal_config() {
        let config = WolfRelayConfig::from_str(MINIMAL).unwrap();
        assert_eq!(config.node.id, "relay-1");
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].port, 3306);
        assert_eq!(config.monitor.interval_ms, 2000);
        assert!(config.binlog.trx_safe);
    }

    #[test]
    fn test_monitor_unknown_server_rejected() {
        let bad = r#"
            [node]
            id = "relay-1"

            [monitor]
            servers = ["ghost"]
        "#;
        assert!(WolfRelayConfig::from_str(bad).is_err());
    }

    #[test]
    fn test_watermark_ordering_enforced() {
        let bad = r#"
            [node]
            id = "relay-1"

            [listener]
            high_water = 1024
            low_water = 2048
        "#;
        assert!(WolfRelayConfig::from_str(bad).is_err());
    }

    #[test]
    fn test_encryption_requires_key() {
        let bad = r#"
            [node]
            id = "relay-1"

            [binlog]
            enabled = true
            encrypt_binlog = true
        "#;
        assert!(WolfRelayConfig::from_str(bad).is_err());
    }
}
