//! MariaDB Monitor Backend
//!
//! Probes each server over a cached connection, measures ping, reads the
//! version and replication state, and classifies the server as master or
//! slave. Connection failures are mapped onto the framework's
//! [`ConnectResult`] kinds; access denied sets AUTH_ERROR and is logged
//! once per transition.
//!
//! [`ConnectResult`]: super::ConnectResult

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::mysql::MySqlConnectOptions;
use sqlx::{ConnectOptions, Connection, Row};

use super::{ConnectResult, MonitorBackend, MonitorServer, MonitorSettings};
use crate::server::status;

/// Session variables refreshed after every new connection
const TRACKED_VARIABLES: &[&str] = &[
    "version",
    "version_comment",
    "gtid_current_pos",
    "read_only",
    "server_id",
];

/// MariaDB replication monitor
#[derive(Default)]
pub struct MariadbMonitor {
    /// Set when a probe saw a topology change worth reacting to quickly
    immediate_tick: bool,
}

impl MariadbMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Establish or reuse the probe connection, measuring ping
    async fn connect(
        &self,
        ms: &mut MonitorServer,
        settings: &MonitorSettings,
    ) -> ConnectResult {
        // A cached connection that still answers ping is good as-is.
        if let Some(conn) = ms.connection.as_mut() {
            let started = Instant::now();
            if conn.ping().await.is_ok() {
                ms.server.set_ping(started.elapsed());
                return ConnectResult::OldConnOk;
            }
            ms.connection = None;
        }

        let user = ms
            .server
            .monitor_user()
            .unwrap_or_else(|| settings.user.clone());
        let password = ms
            .server
            .monitor_password()
            .unwrap_or_else(|| settings.password.clone());

        let mut options = MySqlConnectOptions::new()
            .host(&ms.server.address())
            .port(ms.server.port())
            .username(&user)
            .password(&password);
        if let Some(socket) = ms.server.socket() {
            options = options.socket(socket);
        }

        let mut result = ConnectResult::Refused;
        for attempt in 0..settings.connect_attempts.max(1) {
            let started = Instant::now();
            match tokio::time::timeout(settings.connect_timeout, options.clone().connect()).await {
                Ok(Ok(conn)) => {
                    ms.server.set_ping(started.elapsed());
                    ms.connection = Some(conn);
                    return ConnectResult::NewConnOk;
                }
                Ok(Err(e)) => {
                    result = classify_connect_error(&e);
                    if result == ConnectResult::AccessDenied {
                        // Credentials will not get better by retrying.
                        ms.last_auth_error.get_or_insert_with(|| e.to_string());
                        break;
                    }
                    tracing::debug!(
                        server = ms.server.name(),
                        attempt = attempt + 1,
                        error = %e,
                        "monitor connect failed"
                    );
                }
                Err(_) => {
                    result = ConnectResult::Timeout;
                }
            }
        }
        result
    }

    /// Read version, replication state and tracked variables
    async fn probe(&mut self, ms: &mut MonitorServer) -> sqlx::Result<()> {
        let conn = ms.connection.as_mut().expect("probe without connection");

        let row = sqlx::query("SELECT VERSION()").fetch_one(&mut *conn).await?;
        let version: String = row.try_get(0)?;
        ms.server.set_version(&version);

        // Tracked variables in one round trip.
        let query = format!(
            "SHOW GLOBAL VARIABLES WHERE Variable_name IN ({})",
            TRACKED_VARIABLES
                .iter()
                .map(|v| format!("'{}'", v))
                .collect::<Vec<_>>()
                .join(",")
        );
        let rows = sqlx::query(query.as_str()).fetch_all(&mut *conn).await?;
        let mut variables = HashMap::new();
        for row in rows {
            let name: String = row.try_get(0)?;
            let value: String = row.try_get(1)?;
            variables.insert(name, value);
        }

        let read_only = variables
            .get("read_only")
            .map(|v| v.eq_ignore_ascii_case("on") || v == "1")
            .unwrap_or(false);

        if let Some(gtid) = variables.get("gtid_current_pos") {
            for triple in gtid.split(',') {
                if let Some(domain) = triple.split('-').next().and_then(|d| d.parse().ok()) {
                    ms.server.set_gtid_position(domain, triple.to_string());
                }
            }
        }
        ms.server.set_variables(variables);

        // Replication role: a slave has its IO and SQL threads running.
        let slave_row = sqlx::query("SHOW SLAVE STATUS")
            .fetch_optional(&mut *conn)
            .await?;
        let mut is_slave = false;
        if let Some(row) = slave_row {
            let io_running: String = row.try_get("Slave_IO_Running").unwrap_or_default();
            let sql_running: String = row.try_get("Slave_SQL_Running").unwrap_or_default();
            is_slave = io_running == "Yes" && sql_running == "Yes";

            let lag: Option<i64> = row
                .try_get::<Option<i64>, _>("Seconds_Behind_Master")
                .ok()
                .flatten();
            ms.server
                .set_replication_lag(lag.map(|l| Duration::from_secs(l.max(0) as u64)));
        } else {
            ms.server.set_replication_lag(None);
        }

        ms.clear_pending(status::MASTER | status::SLAVE | status::RELAY);
        if is_slave {
            ms.set_pending(status::SLAVE);
        } else if !read_only {
            ms.set_pending(status::MASTER);
        }
        Ok(())
    }
}

/// Map a connect error onto the monitor's result kinds
fn classify_connect_error(error: &sqlx::Error) -> ConnectResult {
    match error {
        sqlx::Error::Database(db) => {
            // 1045: access denied for user
            if db.code().as_deref() == Some("28000") || db.message().contains("Access denied") {
                ConnectResult::AccessDenied
            } else {
                ConnectResult::Refused
            }
        }
        sqlx::Error::PoolTimedOut => ConnectResult::Timeout,
        sqlx::Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ConnectResult::Timeout,
        _ => ConnectResult::Refused,
    }
}

#[async_trait]
impl MonitorBackend for MariadbMonitor {
    fn module(&self) -> &'static str {
        "mariadbmon"
    }

    async fn update_server_status(
        &mut self,
        ms: &mut MonitorServer,
        settings: &MonitorSettings,
    ) {
        let result = self.connect(ms, settings).await;

        match result {
            ConnectResult::OldConnOk | ConnectResult::NewConnOk => {
                let had_auth_error = ms.pending_status & status::AUTH_ERROR != 0;
                ms.set_pending(status::RUNNING);
                ms.clear_pending(status::AUTH_ERROR);
                if had_auth_error {
                    ms.last_auth_error = None;
                }
                ms.consecutive_errors = 0;

                if result == ConnectResult::NewConnOk {
                    // Fresh connection: re-read permissions and variables.
                    self.immediate_tick = true;
                }

                if let Err(e) = self.probe(ms).await {
                    tracing::warn!(
                        server = ms.server.name(),
                        error = %e,
                        "probe query failed, dropping connection"
                    );
                    ms.connection = None;
                    ms.consecutive_errors += 1;
                }
            }
            ConnectResult::AccessDenied => {
                let first_transition = ms.pending_status & status::AUTH_ERROR == 0;
                ms.clear_pending(status::RUNNING | status::MASTER | status::SLAVE);
                ms.set_pending(status::AUTH_ERROR);
                ms.consecutive_errors += 1;
                if first_transition {
                    tracing::error!(
                        server = ms.server.name(),
                        error = ms.last_auth_error.as_deref().unwrap_or("access denied"),
                        "monitor credentials rejected"
                    );
                }
            }
            ConnectResult::Refused | ConnectResult::Timeout => {
                ms.clear_pending(status::RUNNING | status::MASTER | status::SLAVE);
                ms.consecutive_errors += 1;
                tracing::debug!(
                    server = ms.server.name(),
                    result = ?result,
                    errors = ms.consecutive_errors,
                    "server unreachable"
                );
            }
        }
    }

    fn immediate_tick_required(&mut self) -> bool {
        std::mem::take(&mut self.immediate_tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_classification() {
        let timeout = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        ));
        assert_eq!(classify_connect_error(&timeout), ConnectResult::Timeout);

        let refused = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(classify_connect_error(&refused), ConnectResult::Refused);
    }

    #[test]
    fn test_connect_result_ok() {
        assert!(ConnectResult::OldConnOk.is_ok());
        assert!(ConnectResult::NewConnOk.is_ok());
        assert!(!ConnectResult::Refused.is_ok());
        assert!(!ConnectResult::AccessDenied.is_ok());
    }
}
