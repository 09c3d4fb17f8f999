//! Monitor Recovery Journal
//!
//! The monitor persists the last published server statuses to a JSON file
//! so a restart can pick up where it left off instead of reporting every
//! server as down until the first tick completes. A journal is only loaded
//! when it was written by the same module and relay version, is younger
//! than the configured maximum age, and describes exactly the same set of
//! servers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::server::status;

/// One server's persisted state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalServer {
    pub name: String,
    pub status: u64,
}

/// The on-disk journal document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    /// Relay version that wrote the journal
    pub relay_version: String,
    /// Monitor module name
    pub module: String,
    /// Write time, epoch seconds
    pub timestamp: i64,
    pub servers: Vec<JournalServer>,
}

impl Journal {
    pub fn new(module: &str, servers: Vec<JournalServer>) -> Self {
        Self {
            relay_version: env!("CARGO_PKG_VERSION").to_string(),
            module: module.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            servers,
        }
    }

    /// Age relative to now; zero when the clock went backwards
    pub fn age(&self) -> Duration {
        let age = chrono::Utc::now().timestamp() - self.timestamp;
        Duration::from_secs(age.max(0) as u64)
    }

    /// Persist atomically: write a temp file, then rename over the target
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Monitor(format!("journal serialization failed: {}", e)))?;
        let tmp: PathBuf = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "monitor journal saved");
        Ok(())
    }

    /// Load a journal without validating it
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Monitor(format!("journal parse failed: {}", e)))
    }

    /// Load a journal and check it against the running configuration.
    /// Returns None (discarding it) on any mismatch.
    pub fn load_valid(
        path: &Path,
        module: &str,
        max_age: Duration,
        expected_servers: &[String],
    ) -> Option<Self> {
        let journal = match Self::load(path) {
            Ok(journal) => journal,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no usable journal");
                return None;
            }
        };

        if journal.module != module {
            tracing::warn!(
                found = journal.module,
                expected = module,
                "journal written by a different module, discarding"
            );
            return None;
        }
        if journal.relay_version != env!("CARGO_PKG_VERSION") {
            tracing::warn!(
                found = journal.relay_version,
                "journal written by a different relay version, discarding"
            );
            return None;
        }
        if journal.age() > max_age {
            tracing::warn!(age_secs = journal.age().as_secs(), "journal too old, discarding");
            return None;
        }

        let mut found: Vec<&str> = journal.servers.iter().map(|s| s.name.as_str()).collect();
        let mut expected: Vec<&str> = expected_servers.iter().map(String::as_str).collect();
        found.sort_unstable();
        expected.sort_unstable();
        if found != expected {
            tracing::warn!("journal server list does not match configuration, discarding");
            return None;
        }

        Some(journal)
    }

    /// Status to republish on load: transient error bits do not survive a
    /// restart.
    pub fn restored_status(&self, name: &str) -> Option<u64> {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.status & !(status::AUTH_ERROR | status::NEED_DNS))
    }
}

/// Save cadence: the journal is rewritten when dirty or older than this
pub fn max_save_interval(journal_max_age: Duration) -> Duration {
    Duration::from_secs(300).min(journal_max_age / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Journal {
        Journal::new(
            "mariadbmon",
            vec![
                JournalServer {
                    name: "db1".into(),
                    status: status::RUNNING | status::MASTER,
                },
                JournalServer {
                    name: "db2".into(),
                    status: status::RUNNING | status::SLAVE | status::AUTH_ERROR,
                },
            ],
        )
    }

    #[test]
    fn test_save_load_round_trip_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor_journal.json");

        let journal = sample();
        journal.save(&path).unwrap();
        let loaded = Journal::load(&path).unwrap();
        assert_eq!(loaded.servers, journal.servers);

        // Saving the loaded journal reproduces the same document body.
        loaded.save(&path).unwrap();
        let again = Journal::load(&path).unwrap();
        assert_eq!(again.servers, loaded.servers);
        assert_eq!(again.module, loaded.module);
    }

    #[test]
    fn test_validation_rejects_wrong_module() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.json");
        sample().save(&path).unwrap();

        let loaded = Journal::load_valid(
            &path,
            "galeramon",
            Duration::from_secs(3600),
            &["db1".into(), "db2".into()],
        );
        assert!(loaded.is_none());
    }

    #[test]
    fn test_validation_rejects_changed_server_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.json");
        sample().save(&path).unwrap();

        let loaded = Journal::load_valid(
            &path,
            "mariadbmon",
            Duration::from_secs(3600),
            &["db1".into(), "db3".into()],
        );
        assert!(loaded.is_none());
    }

    #[test]
    fn test_validation_rejects_stale_journal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.json");
        let mut journal = sample();
        journal.timestamp -= 7200;
        journal.save(&path).unwrap();

        let loaded = Journal::load_valid(
            &path,
            "mariadbmon",
            Duration::from_secs(3600),
            &["db1".into(), "db2".into()],
        );
        assert!(loaded.is_none());
    }

    #[test]
    fn test_restored_status_clears_transient_bits() {
        let journal = sample();
        let restored = journal.restored_status("db2").unwrap();
        assert_eq!(restored & status::AUTH_ERROR, 0);
        assert_ne!(restored & status::SLAVE, 0);
    }

    #[test]
    fn test_max_save_interval() {
        assert_eq!(
            max_save_interval(Duration::from_secs(28800)),
            Duration::from_secs(300)
        );
        assert_eq!(
            max_save_interval(Duration::from_secs(120)),
            Duration::from_secs(60)
        );
    }
}
