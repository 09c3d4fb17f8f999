//! master.ini Persistence
//!
//! The binlog router's upstream configuration survives restarts in a small
//! text file in the binlog directory. It is rewritten atomically after a
//! successful CHANGE MASTER TO; a failed change restores the previous
//! in-memory configuration untouched.

use std::path::Path;

use crate::error::{Error, Result};

/// File name inside the binlog directory
pub const MASTER_INI: &str = "master.ini";

/// Upstream master connection settings
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub binlog_file: String,
    pub binlog_pos: u64,
    pub ssl_enabled: bool,
    pub ssl_ca: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_version: Option<String>,
}

impl MasterConfig {
    /// Render the ini document
    pub fn to_ini(&self) -> String {
        let mut out = String::new();
        out.push_str("[binlog_configuration]\n");
        out.push_str(&format!("master_host={}\n", self.host));
        out.push_str(&format!("master_port={}\n", self.port));
        out.push_str(&format!("master_user={}\n", self.user));
        out.push_str(&format!("master_password={}\n", self.password));
        out.push_str(&format!("filestem={}\n", self.binlog_file));
        out.push_str(&format!("position={}\n", self.binlog_pos));
        if self.ssl_enabled {
            out.push_str("master_ssl=1\n");
            if let Some(ca) = &self.ssl_ca {
                out.push_str(&format!("master_ssl_ca={}\n", ca));
            }
            if let Some(cert) = &self.ssl_cert {
                out.push_str(&format!("master_ssl_cert={}\n", cert));
            }
            if let Some(key) = &self.ssl_key {
                out.push_str(&format!("master_ssl_key={}\n", key));
            }
            if let Some(version) = &self.ssl_version {
                out.push_str(&format!("master_tls_version={}\n", version));
            }
        }
        out
    }

    /// Parse an ini document written by [`to_ini`]
    ///
    /// [`to_ini`]: MasterConfig::to_ini
    pub fn from_ini(content: &str) -> Result<Self> {
        let mut config = MasterConfig::default();
        let mut in_section = false;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                in_section = line == "[binlog_configuration]";
                continue;
            }
            if !in_section {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Config(format!("malformed master.ini line '{}'", line)));
            };
            let value = value.trim();
            match key.trim() {
                "master_host" => config.host = value.to_string(),
                "master_port" => {
                    config.port = value
                        .parse()
                        .map_err(|_| Error::Config(format!("bad master_port '{}'", value)))?
                }
                "master_user" => config.user = value.to_string(),
                "master_password" => config.password = value.to_string(),
                "filestem" => config.binlog_file = value.to_string(),
                "position" => {
                    config.binlog_pos = value
                        .parse()
                        .map_err(|_| Error::Config(format!("bad position '{}'", value)))?
                }
                "master_ssl" => config.ssl_enabled = value == "1" || value.eq_ignore_ascii_case("on"),
                "master_ssl_ca" => config.ssl_ca = Some(value.to_string()),
                "master_ssl_cert" => config.ssl_cert = Some(value.to_string()),
                "master_ssl_key" => config.ssl_key = Some(value.to_string()),
                "master_tls_version" => config.ssl_version = Some(value.to_string()),
                other => {
                    tracing::warn!(key = other, "unknown master.ini key ignored");
                }
            }
        }

        if config.host.is_empty() {
            return Err(Error::Config("master.ini has no master_host".into()));
        }
        Ok(config)
    }

    /// Load from `<dir>/master.ini`; None when no file exists yet
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MASTER_INI);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(Self::from_ini(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite `<dir>/master.ini` atomically: temp file, then rename
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MASTER_INI);
        let tmp = dir.join(format!("{}.tmp", MASTER_INI));
        std::fs::write(&tmp, self.to_ini())?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(path = %path.display(), "master.ini written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> MasterConfig {
        MasterConfig {
            host: "10.0.0.5".into(),
            port: 3306,
            user: "repl".into(),
            password: "replpw".into(),
            binlog_file: "mariadb-bin.000007".into(),
            binlog_pos: 4711,
            ssl_enabled: false,
            ssl_ca: None,
            ssl_cert: None,
            ssl_key: None,
            ssl_version: None,
        }
    }

    #[test]
    fn test_round_trip() {
        let config = sample();
        let parsed = MasterConfig::from_ini(&config.to_ini()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_round_trip_with_ssl() {
        let mut config = sample();
        config.ssl_enabled = true;
        config.ssl_ca = Some("/certs/ca.pem".into());
        config.ssl_cert = Some("/certs/client.pem".into());
        config.ssl_key = Some("/certs/client.key".into());
        config.ssl_version = Some("TLSv1.3".into());

        let parsed = MasterConfig::from_ini(&config.to_ini()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let config = sample();
        config.save(dir.path()).unwrap();

        let loaded = MasterConfig::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, config);

        // No stray temp file left behind.
        assert!(!dir.path().join(format!("{}.tmp", MASTER_INI)).exists());
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        assert!(MasterConfig::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_missing_host_rejected() {
        assert!(MasterConfig::from_ini("[binlog_configuration]\nmaster_port=3306\n").is_err());
    }
}
