//! Cluster Monitor Framework
//!
//! A monitor exclusively owns a set of servers, probes them on a periodic
//! tick, classifies their replication role, publishes status bits, runs a
//! script on state transitions and persists a recovery journal. The role
//! classification itself is supplied by a backend implementation (see
//! [`mariadb`]); this module owns the control loop and the rules around it.
//!
//! While a server is monitored only its monitor may change its status; the
//! admin stages MAINT/DRAIN requests which the next tick applies.

pub mod journal;
pub mod mariadb;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::server::{status, Server};
use journal::{Journal, JournalServer};

/// Scheduling granularity of the tick loop
const BASE_INTERVAL: Duration = Duration::from_millis(100);

/// Role bits that participate in event classification
const ROLE_BITS: u64 = status::MASTER | status::SLAVE | status::JOINED | status::RELAY | status::BLR;

/// Pending admin status change on one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusRequest {
    #[default]
    NoChange,
    MaintOn,
    MaintOff,
    DrainOn,
    DrainOff,
    DnsDone,
}

/// Result of one connection attempt to a monitored server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    /// The cached connection is still good
    OldConnOk,
    /// A fresh connection succeeded
    NewConnOk,
    Refused,
    Timeout,
    AccessDenied,
}

impl ConnectResult {
    pub fn is_ok(self) -> bool {
        matches!(self, ConnectResult::OldConnOk | ConnectResult::NewConnOk)
    }
}

/// State-change events a monitor can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    MasterUp,
    SlaveUp,
    SyncedUp,
    RelayUp,
    BlrUp,
    ServerUp,
    MasterDown,
    SlaveDown,
    SyncedDown,
    RelayDown,
    BlrDown,
    ServerDown,
    NewMaster,
    NewSlave,
    NewSynced,
    NewRelay,
    NewBlr,
    LostMaster,
    LostSlave,
    LostSynced,
    LostRelay,
    LostBlr,
}

impl MonitorEvent {
    /// Name used for the `$EVENT` substitution and the `events` filter
    pub fn name(self) -> &'static str {
        match self {
            MonitorEvent::MasterUp => "master_up",
            MonitorEvent::SlaveUp => "slave_up",
            MonitorEvent::SyncedUp => "synced_up",
            MonitorEvent::RelayUp => "relay_up",
            MonitorEvent::BlrUp => "blr_up",
            MonitorEvent::ServerUp => "server_up",
            MonitorEvent::MasterDown => "master_down",
            MonitorEvent::SlaveDown => "slave_down",
            MonitorEvent::SyncedDown => "synced_down",
            MonitorEvent::RelayDown => "relay_down",
            MonitorEvent::BlrDown => "blr_down",
            MonitorEvent::ServerDown => "server_down",
            MonitorEvent::NewMaster => "new_master",
            MonitorEvent::NewSlave => "new_slave",
            MonitorEvent::NewSynced => "new_synced",
            MonitorEvent::NewRelay => "new_relay",
            MonitorEvent::NewBlr => "new_blr",
            MonitorEvent::LostMaster => "lost_master",
            MonitorEvent::LostSlave => "lost_slave",
            MonitorEvent::LostSynced => "lost_synced",
            MonitorEvent::LostRelay => "lost_relay",
            MonitorEvent::LostBlr => "lost_blr",
        }
    }
}

/// Classify a status transition into an event
pub fn classify_event(before: u64, after: u64) -> Option<MonitorEvent> {
    let was_running = before & status::RUNNING != 0;
    let is_running = after & status::RUNNING != 0;

    if !was_running && is_running {
        return Some(up_event(after));
    }
    if was_running && !is_running {
        return Some(down_event(before));
    }
    if was_running && is_running {
        let before_roles = before & ROLE_BITS;
        let after_roles = after & ROLE_BITS;
        if before_roles != after_roles {
            let gained = after_roles & !before_roles;
            let lost = before_roles & !after_roles;
            if gained != 0 {
                return Some(new_event(gained));
            }
            if lost != 0 {
                return Some(lost_event(lost));
            }
        }
    }
    None
}

fn up_event(bits: u64) -> MonitorEvent {
    if bits & status::MASTER != 0 {
        MonitorEvent::MasterUp
    } else if bits & status::SLAVE != 0 {
        MonitorEvent::SlaveUp
    } else if bits & status::JOINED != 0 {
        MonitorEvent::SyncedUp
    } else if bits & status::RELAY != 0 {
        MonitorEvent::RelayUp
    } else if bits & status::BLR != 0 {
        MonitorEvent::BlrUp
    } else {
        MonitorEvent::ServerUp
    }
}

fn down_event(bits: u64) -> MonitorEvent {
    if bits & status::MASTER != 0 {
        MonitorEvent::MasterDown
    } else if bits & status::SLAVE != 0 {
        MonitorEvent::SlaveDown
    } else if bits & status::JOINED != 0 {
        MonitorEvent::SyncedDown
    } else if bits & status::RELAY != 0 {
        MonitorEvent::RelayDown
    } else if bits & status::BLR != 0 {
        MonitorEvent::BlrDown
    } else {
        MonitorEvent::ServerDown
    }
}

fn new_event(gained: u64) -> MonitorEvent {
    if gained & status::MASTER != 0 {
        MonitorEvent::NewMaster
    } else if gained & status::SLAVE != 0 {
        MonitorEvent::NewSlave
    } else if gained & status::JOINED != 0 {
        MonitorEvent::NewSynced
    } else if gained & status::RELAY != 0 {
        MonitorEvent::NewRelay
    } else {
        MonitorEvent::NewBlr
    }
}

fn lost_event(lost: u64) -> MonitorEvent {
    if lost & status::MASTER != 0 {
        MonitorEvent::LostMaster
    } else if lost & status::SLAVE != 0 {
        MonitorEvent::LostSlave
    } else if lost & status::JOINED != 0 {
        MonitorEvent::LostSynced
    } else if lost & status::RELAY != 0 {
        MonitorEvent::LostRelay
    } else {
        MonitorEvent::LostBlr
    }
}

/// Exclusive server ownership registry. A server belongs to at most one
/// monitor at any time.
#[derive(Default)]
pub struct ServerClaims {
    claims: Mutex<HashMap<String, String>>,
}

impl ServerClaims {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim every name for `monitor`, atomically. On conflict nothing is
    /// claimed and the error names the existing owner.
    pub fn claim_all(&self, monitor: &str, servers: &[String]) -> Result<()> {
        let mut claims = self.claims.lock().unwrap();
        for name in servers {
            if let Some(owner) = claims.get(name) {
                if owner != monitor {
                    return Err(Error::ServerClaimed {
                        server: name.clone(),
                        owner: owner.clone(),
                    });
                }
            }
        }
        for name in servers {
            claims.insert(name.clone(), monitor.to_string());
        }
        Ok(())
    }

    /// Release every claim held by `monitor`
    pub fn release_all(&self, monitor: &str) {
        self.claims.lock().unwrap().retain(|_, owner| owner != monitor);
    }

    pub fn owner_of(&self, server: &str) -> Option<String> {
        self.claims.lock().unwrap().get(server).cloned()
    }
}

/// The monitor's per-server record
pub struct MonitorServer {
    pub server: Arc<Server>,
    /// Status published after the previous tick
    pub prev_status: u64,
    /// Status being assembled during the current tick
    pub pending_status: u64,
    /// Staged admin request, consumed by the next tick
    pub status_request: StatusRequest,
    pub consecutive_errors: u32,
    pub last_event: Option<(MonitorEvent, Instant)>,
    /// First authentication error since the last good connection
    pub last_auth_error: Option<String>,
    pub can_check_disk_space: bool,
    /// Cached probe connection; None forces a fresh connect
    pub connection: Option<sqlx::MySqlConnection>,
}

impl MonitorServer {
    pub fn new(server: Arc<Server>) -> Self {
        let prev_status = server.status_bits();
        Self {
            server,
            prev_status,
            pending_status: prev_status,
            status_request: StatusRequest::NoChange,
            consecutive_errors: 0,
            last_event: None,
            last_auth_error: None,
            can_check_disk_space: true,
            connection: None,
        }
    }

    pub fn set_pending(&mut self, bits: u64) {
        self.pending_status |= bits;
    }

    pub fn clear_pending(&mut self, bits: u64) {
        self.pending_status &= !bits;
    }

    /// Journal view of this server
    fn journal_entry(&self) -> JournalServer {
        JournalServer {
            name: self.server.name().to_string(),
            status: self.server.status_bits(),
        }
    }
}

/// Settings shared with the probe backend
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub connect_attempts: u32,
}

impl MonitorSettings {
    fn from_config(config: &MonitorConfig) -> Self {
        Self {
            user: config.user.clone(),
            password: config.password.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            connect_attempts: config.connect_attempts,
        }
    }
}

/// Probe backend: classification logic supplied per cluster flavour
#[async_trait]
pub trait MonitorBackend: Send + Sync {
    /// Module name recorded in the journal
    fn module(&self) -> &'static str;

    /// Probe one server and assemble its pending status bits
    async fn update_server_status(&mut self, server: &mut MonitorServer, settings: &MonitorSettings);

    async fn pre_tick(&mut self, _servers: &mut [MonitorServer]) {}

    async fn post_tick(&mut self, _servers: &mut [MonitorServer]) {}

    /// Request an out-of-schedule tick
    fn immediate_tick_required(&mut self) -> bool {
        false
    }

    /// Whether the admin may stop this monitor
    fn can_be_disabled(&self) -> bool {
        true
    }
}

enum AdminMsg {
    Status {
        server: String,
        request: StatusRequest,
    },
    Shutdown,
}

/// Handle to a running monitor
pub struct Monitor {
    name: String,
    server_names: Vec<String>,
    servers: Vec<Arc<Server>>,
    tick_count: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    admin_tx: mpsc::UnboundedSender<AdminMsg>,
    claims: Arc<ServerClaims>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("name", &self.name)
            .field("server_names", &self.server_names)
            .finish()
    }
}

impl Monitor {
    /// Claim the servers, load the journal and start the tick loop
    pub fn start(
        config: &MonitorConfig,
        servers: Vec<Arc<Server>>,
        backend: Box<dyn MonitorBackend>,
        claims: Arc<ServerClaims>,
        journal_path: PathBuf,
    ) -> Result<Self> {
        let server_names: Vec<String> = servers.iter().map(|s| s.name().to_string()).collect();
        claims.claim_all(&config.name, &server_names)?;

        let journal_max_age = Duration::from_secs(config.journal_max_age_secs);
        let mut monitor_servers: Vec<MonitorServer> =
            servers.iter().cloned().map(MonitorServer::new).collect();

        // Resume from the journal when it is trustworthy.
        if let Some(journal) =
            Journal::load_valid(&journal_path, backend.module(), journal_max_age, &server_names)
        {
            for ms in &mut monitor_servers {
                if let Some(bits) = journal.restored_status(ms.server.name()) {
                    ms.server.assign_status(bits);
                    ms.prev_status = bits;
                    ms.pending_status = bits;
                }
            }
            tracing::info!(monitor = config.name, "restored server states from journal");
        }

        let tick_count = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let (admin_tx, admin_rx) = mpsc::unbounded_channel();

        let runner = MonitorRunner {
            name: config.name.clone(),
            settings: MonitorSettings::from_config(config),
            interval: Duration::from_millis(config.interval_ms),
            script: config.script.clone(),
            script_timeout: Duration::from_secs(config.script_timeout_secs),
            events_filter: config.events.clone(),
            journal_path,
            journal_max_age,
            servers: monitor_servers,
            backend,
            tick_count: tick_count.clone(),
            running: running.clone(),
            claims: claims.clone(),
            journal_dirty: true,
            last_journal_save: Instant::now(),
        };
        tokio::spawn(runner.run(admin_rx));

        Ok(Self {
            name: config.name.clone(),
            server_names,
            servers,
            tick_count,
            running,
            admin_tx,
            claims,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn ticks(&self) -> u64 {
        self.tick_count.load(Ordering::Acquire)
    }

    /// Set a status bit on a monitored server.
    ///
    /// While the monitor runs only MAINT and DRAINING may be set; the
    /// request is staged and this call returns once a tick consumed it.
    pub async fn set_server_status(&self, server: &str, bit: u64) -> Result<()> {
        let request = match bit {
            b if b == status::MAINT => StatusRequest::MaintOn,
            b if b == status::DRAINING => StatusRequest::DrainOn,
            _ => {
                return Err(Error::StatusChangeDenied(format!(
                    "only maintenance and drain may be set while '{}' is monitored",
                    self.name
                )))
            }
        };
        self.submit_status_request(server, bit, request, true).await
    }

    /// Clear a status bit on a monitored server
    pub async fn clear_server_status(&self, server: &str, bit: u64) -> Result<()> {
        let request = match bit {
            b if b == status::MAINT => StatusRequest::MaintOff,
            b if b == status::DRAINING => StatusRequest::DrainOff,
            b if b == status::NEED_DNS => StatusRequest::DnsDone,
            _ => {
                return Err(Error::StatusChangeDenied(format!(
                    "only maintenance, drain and DNS flags may be cleared while '{}' is monitored",
                    self.name
                )))
            }
        };
        self.submit_status_request(server, bit, request, false).await
    }

    async fn submit_status_request(
        &self,
        server: &str,
        bit: u64,
        request: StatusRequest,
        set: bool,
    ) -> Result<()> {
        if !self.server_names.iter().any(|n| n == server) {
            return Err(Error::UnknownServer(server.to_string()));
        }

        if !self.is_running() {
            // Unmonitored servers may be modified directly.
            let target = self
                .servers
                .iter()
                .find(|s| s.name() == server)
                .ok_or_else(|| Error::UnknownServer(server.to_string()))?;
            if set {
                target.set_status(bit);
            } else {
                target.clear_status(bit);
            }
            return Ok(());
        }

        let staged_at = self.ticks();
        self.admin_tx
            .send(AdminMsg::Status {
                server: server.to_string(),
                request,
            })
            .map_err(|_| Error::Monitor("monitor loop is gone".into()))?;

        // Wait for the next tick to consume the request.
        while self.ticks() <= staged_at {
            if !self.is_running() {
                return Err(Error::Monitor("monitor stopped while waiting".into()));
            }
            tokio::time::sleep(BASE_INTERVAL).await;
        }
        Ok(())
    }

    /// Stop the tick loop, persist the journal and release the claims
    pub fn stop(&self) {
        let _ = self.admin_tx.send(AdminMsg::Shutdown);
    }

    pub fn claims(&self) -> &Arc<ServerClaims> {
        &self.claims
    }
}

struct MonitorRunner {
    name: String,
    settings: MonitorSettings,
    interval: Duration,
    script: Option<String>,
    script_timeout: Duration,
    events_filter: Vec<String>,
    journal_path: PathBuf,
    journal_max_age: Duration,
    servers: Vec<MonitorServer>,
    backend: Box<dyn MonitorBackend>,
    tick_count: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    claims: Arc<ServerClaims>,
    journal_dirty: bool,
    last_journal_save: Instant,
}

impl MonitorRunner {
    async fn run(mut self, mut admin_rx: mpsc::UnboundedReceiver<AdminMsg>) {
        tracing::info!(monitor = self.name, "monitor started");
        let mut last_tick = Instant::now() - self.interval;

        loop {
            // Collect admin requests until the next scheduling point.
            let wait = self
                .interval
                .saturating_sub(last_tick.elapsed())
                .min(BASE_INTERVAL);
            let mut shutdown = false;
            let mut pending_request = self
                .servers
                .iter()
                .any(|s| s.status_request != StatusRequest::NoChange);

            tokio::select! {
                msg = admin_rx.recv() => match msg {
                    Some(AdminMsg::Status { server, request }) => {
                        if let Some(ms) = self.servers.iter_mut().find(|s| s.server.name() == server) {
                            ms.status_request = request;
                            pending_request = true;
                        }
                    }
                    Some(AdminMsg::Shutdown) | None => shutdown = true,
                },
                _ = tokio::time::sleep(wait) => {}
            }

            if shutdown {
                break;
            }

            let due = last_tick.elapsed() >= self.interval
                || pending_request
                || self.backend.immediate_tick_required();
            if due {
                self.run_one_tick().await;
                last_tick = Instant::now();
                self.tick_count.fetch_add(1, Ordering::AcqRel);
            }
        }

        self.save_journal();
        self.claims.release_all(&self.name);
        self.running.store(false, Ordering::Release);
        tracing::info!(monitor = self.name, "monitor stopped");
    }

    async fn run_one_tick(&mut self) {
        // Stash the published status as this tick's starting point.
        for ms in &mut self.servers {
            ms.pending_status = ms.server.status_bits();
        }

        self.backend.pre_tick(&mut self.servers).await;

        for ms in &mut self.servers {
            self.backend.update_server_status(ms, &self.settings).await;
        }

        self.apply_status_requests();

        self.backend.post_tick(&mut self.servers).await;

        // Flush pending -> published, then classify transitions.
        let mut events = Vec::new();
        for ms in &mut self.servers {
            let before = ms.server.status_bits();
            if before != ms.pending_status {
                ms.server.assign_status(ms.pending_status);
                self.journal_dirty = true;
            }
            ms.prev_status = before;

            if let Some(event) = classify_event(before, ms.pending_status) {
                ms.last_event = Some((event, Instant::now()));
                tracing::info!(
                    monitor = self.name,
                    server = ms.server.name(),
                    event = event.name(),
                    status = ms.server.status_string(),
                    "server state changed"
                );
                events.push((ms.server.clone(), event));
            }
        }

        for (server, event) in events {
            if server.status_bits() & status::RUNNING == 0 {
                // Connections to a dead server are torn down right away.
                server.clear_gtid_positions();
                tracing::info!(
                    monitor = self.name,
                    server = server.name(),
                    "hanging up pooled connections to failed server"
                );
            }
            if self.event_selected(event) {
                if let Some(script) = self.script.clone() {
                    self.launch_script(&script, &server, event).await;
                }
            }
        }

        if self.journal_dirty
            || self.last_journal_save.elapsed() > journal::max_save_interval(self.journal_max_age)
        {
            self.save_journal();
        }
    }

    /// Apply staged admin requests to the pending status
    fn apply_status_requests(&mut self) {
        for ms in &mut self.servers {
            match std::mem::take(&mut ms.status_request) {
                StatusRequest::NoChange => {}
                StatusRequest::MaintOn => ms.set_pending(status::MAINT),
                StatusRequest::MaintOff => ms.clear_pending(status::MAINT),
                StatusRequest::DrainOn => ms.set_pending(status::DRAINING),
                StatusRequest::DrainOff => ms.clear_pending(status::DRAINING),
                StatusRequest::DnsDone => ms.clear_pending(status::NEED_DNS),
            }
        }
    }

    /// Empty filter selects everything
    fn event_selected(&self, event: MonitorEvent) -> bool {
        self.events_filter.is_empty()
            || self.events_filter.iter().any(|e| e == event.name())
    }

    async fn launch_script(&self, script: &str, initiator: &Arc<Server>, event: MonitorEvent) {
        let command = self.substitute_script(script, initiator, event);
        tracing::info!(monitor = self.name, command = %command, "launching monitor script");

        let result = tokio::time::timeout(
            self.script_timeout,
            tokio::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(&command)
                .status(),
        )
        .await;

        match result {
            Ok(Ok(exit)) if exit.success() => {
                tracing::debug!(monitor = self.name, "monitor script succeeded");
            }
            Ok(Ok(exit)) => {
                tracing::error!(
                    monitor = self.name,
                    code = exit.code().unwrap_or(-1),
                    "monitor script reported failure"
                );
            }
            Ok(Err(e)) => {
                tracing::error!(monitor = self.name, error = %e, "monitor script could not run");
            }
            Err(_) => {
                tracing::error!(
                    monitor = self.name,
                    timeout_secs = self.script_timeout.as_secs(),
                    "monitor script timed out"
                );
            }
        }
    }

    fn substitute_script(&self, script: &str, initiator: &Arc<Server>, event: MonitorEvent) -> String {
        let address_of = |s: &Arc<Server>| format!("[{}]:{}", s.address(), s.port());
        let join = |servers: Vec<&MonitorServer>| {
            servers
                .iter()
                .map(|ms| address_of(&ms.server))
                .collect::<Vec<_>>()
                .join(",")
        };

        let all = join(self.servers.iter().collect());
        let nodes = join(self.servers.iter().filter(|ms| ms.server.is_running()).collect());
        let masters = join(self.servers.iter().filter(|ms| ms.server.is_master()).collect());
        let slaves = join(self.servers.iter().filter(|ms| ms.server.is_slave()).collect());
        let synced = join(self.servers.iter().filter(|ms| ms.server.is_joined()).collect());

        let parent = self
            .servers
            .iter()
            .find(|ms| ms.server.is_master())
            .map(|ms| address_of(&ms.server))
            .unwrap_or_default();

        script
            .replace("$INITIATOR", &address_of(initiator))
            .replace("$PARENT", &parent)
            .replace("$CHILDREN", &slaves)
            .replace("$EVENT", event.name())
            .replace(
                "$CREDENTIALS",
                &format!("--user={} --password={}", self.settings.user, self.settings.password),
            )
            .replace("$LIST", &all)
            .replace("$NODELIST", &nodes)
            .replace("$MASTERLIST", &masters)
            .replace("$SLAVELIST", &slaves)
            .replace("$SYNCEDLIST", &synced)
    }

    fn save_journal(&mut self) {
        let entries = self.servers.iter().map(|ms| ms.journal_entry()).collect();
        let journal = Journal::new(self.backend.module(), entries);
        if let Err(e) = journal.save(&self.journal_path) {
            tracing::error!(monitor = self.name, error = %e, "failed to save journal");
        } else {
            self.journal_dirty = false;
            self.last_journal_save = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tempfile::tempdir;

    fn make_server(name: &str) -> Arc<Server> {
        Server::new(&ServerConfig {
            name: name.into(),
            address: "127.0.0.1".into(),
            socket: None,
            port: 3306,
            monitor_user: None,
            monitor_password: None,
            ssl_enabled: false,
            ssl_ca: None,
            disk_space_threshold: None,
        })
    }

    /// Backend that marks every server running and master
    struct StaticBackend;

    #[async_trait]
    impl MonitorBackend for StaticBackend {
        fn module(&self) -> &'static str {
            "staticmon"
        }

        async fn update_server_status(
            &mut self,
            server: &mut MonitorServer,
            _settings: &MonitorSettings,
        ) {
            // Probe outcome only; admin bits in the stash stay intact.
            server.set_pending(status::RUNNING | status::MASTER);
        }
    }

    fn test_config(name: &str) -> MonitorConfig {
        MonitorConfig {
            name: name.into(),
            interval_ms: 50,
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn test_event_classification() {
        // Down -> up as master
        assert_eq!(
            classify_event(0, status::RUNNING | status::MASTER),
            Some(MonitorEvent::MasterUp)
        );
        // Master went away entirely
        assert_eq!(
            classify_event(status::RUNNING | status::MASTER, 0),
            Some(MonitorEvent::MasterDown)
        );
        // Promotion while running
        assert_eq!(
            classify_event(
                status::RUNNING | status::SLAVE,
                status::RUNNING | status::MASTER | status::SLAVE
            ),
            Some(MonitorEvent::NewMaster)
        );
        // Demotion while running
        assert_eq!(
            classify_event(
                status::RUNNING | status::SLAVE,
                status::RUNNING
            ),
            Some(MonitorEvent::LostSlave)
        );
        // No change
        assert_eq!(classify_event(status::RUNNING, status::RUNNING), None);
        // Plain server up
        assert_eq!(classify_event(0, status::RUNNING), Some(MonitorEvent::ServerUp));
    }

    #[test]
    fn test_claims_are_exclusive() {
        let claims = ServerClaims::new();
        claims
            .claim_all("m1", &["db1".into(), "db2".into()])
            .unwrap();

        // Second monitor must fail, naming the owner, changing nothing.
        let err = claims
            .claim_all("m2", &["db3".into(), "db1".into()])
            .unwrap_err();
        match err {
            Error::ServerClaimed { server, owner } => {
                assert_eq!(server, "db1");
                assert_eq!(owner, "m1");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(claims.owner_of("db3").is_none());

        claims.release_all("m1");
        claims.claim_all("m2", &["db1".into()]).unwrap();
        assert_eq!(claims.owner_of("db1").unwrap(), "m2");
    }

    #[tokio::test]
    async fn test_monitor_publishes_status() {
        let dir = tempdir().unwrap();
        let server = make_server("db1");
        let claims = ServerClaims::new();

        let monitor = Monitor::start(
            &test_config("test-monitor"),
            vec![server.clone()],
            Box::new(StaticBackend),
            claims,
            dir.path().join("journal.json"),
        )
        .unwrap();

        // Wait for a couple of ticks.
        tokio::time::timeout(Duration::from_secs(2), async {
            while monitor.ticks() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert!(server.is_master());
        monitor.stop();
    }

    #[tokio::test]
    async fn test_maintenance_request_applied_on_tick() {
        let dir = tempdir().unwrap();
        let server = make_server("db1");
        let claims = ServerClaims::new();

        let monitor = Monitor::start(
            &test_config("maint-monitor"),
            vec![server.clone()],
            Box::new(StaticBackend),
            claims,
            dir.path().join("journal.json"),
        )
        .unwrap();

        monitor
            .set_server_status("db1", status::MAINT)
            .await
            .unwrap();
        assert!(server.is_in_maintenance());

        monitor
            .clear_server_status("db1", status::MAINT)
            .await
            .unwrap();
        assert!(!server.is_in_maintenance());
        monitor.stop();
    }

    #[tokio::test]
    async fn test_only_maint_and_drain_while_running() {
        let dir = tempdir().unwrap();
        let server = make_server("db1");
        let claims = ServerClaims::new();

        let monitor = Monitor::start(
            &test_config("strict-monitor"),
            vec![server.clone()],
            Box::new(StaticBackend),
            claims,
            dir.path().join("journal.json"),
        )
        .unwrap();

        let err = monitor
            .set_server_status("db1", status::MASTER)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StatusChangeDenied(_)));

        let err = monitor
            .set_server_status("ghost", status::MAINT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownServer(_)));
        monitor.stop();
    }

    #[tokio::test]
    async fn test_second_monitor_cannot_claim_same_server() {
        let dir = tempdir().unwrap();
        let server = make_server("db1");
        let claims = ServerClaims::new();

        let monitor = Monitor::start(
            &test_config("m1"),
            vec![server.clone()],
            Box::new(StaticBackend),
            claims.clone(),
            dir.path().join("m1_journal.json"),
        )
        .unwrap();

        let err = Monitor::start(
            &test_config("m2"),
            vec![server.clone()],
            Box::new(StaticBackend),
            claims.clone(),
            dir.path().join("m2_journal.json"),
        )
        .unwrap_err();

        match err {
            Error::ServerClaimed { server, owner } => {
                assert_eq!(server, "db1");
                assert_eq!(owner, "m1");
            }
            other => panic!("unexpected error: {}", other),
        }
        monitor.stop();
    }
}
