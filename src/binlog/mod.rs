//! Binlog Router
//!
//! The binlog router registers with an upstream MariaDB master as if it
//! were a replica, ingests and stores the binlog stream, and serves any
//! number of downstream replicas from the stored files. The master side
//! lives in [`master`], the replica-facing side in [`slave`]; they share
//! the [`Router`] instance and compose only through it.

pub mod encryption;
pub mod file;
pub mod gtid;
pub mod master;
pub mod master_ini;
pub mod slave;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::BinlogConfig;
use crate::error::{Error, Result};

use encryption::{BinlogCipher, EncryptionContext};
use file::{BinlogPositions, BinlogWriter};
use gtid::GtidStore;
use master_ini::MasterConfig;
use slave::SlaveInfo;

/// Master-side replication states. Registration walks them in order; an
/// ERR reply in any state but `GtidMode` stops the slave side of the
/// relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Unconnected,
    Connecting,
    Authenticated,
    Timestamp,
    ServerId,
    HbPeriod,
    Chksum1,
    Chksum2,
    Mariadb10,
    GtidMode,
    MasterUuid,
    SlaveUuid,
    Latin1,
    Utf8,
    Select1,
    SelectVer,
    SelectVerCom,
    SelectHostname,
    Map,
    Register,
    CheckSemiSync,
    RequestSemiSync,
    RequestBinlogDump,
    BinlogDump,
    SlaveStopped,
}

impl MasterState {
    pub fn name(self) -> &'static str {
        match self {
            MasterState::Unconnected => "Unconnected",
            MasterState::Connecting => "Connecting",
            MasterState::Authenticated => "Authenticated",
            MasterState::Timestamp => "Timestamp retrieval",
            MasterState::ServerId => "Server id retrieval",
            MasterState::HbPeriod => "Heartbeat registration",
            MasterState::Chksum1 => "Checksum handling",
            MasterState::Chksum2 => "Checksum retrieval",
            MasterState::Mariadb10 => "MariaDB 10 capability",
            MasterState::GtidMode => "GTID mode retrieval",
            MasterState::MasterUuid => "Master UUID retrieval",
            MasterState::SlaveUuid => "Slave UUID registration",
            MasterState::Latin1 => "Latin1 charset",
            MasterState::Utf8 => "UTF-8 charset",
            MasterState::Select1 => "SELECT 1",
            MasterState::SelectVer => "Version retrieval",
            MasterState::SelectVerCom => "Version comment retrieval",
            MasterState::SelectHostname => "Hostname retrieval",
            MasterState::Map => "Max packet retrieval",
            MasterState::Register => "Slave registration",
            MasterState::CheckSemiSync => "Semi-sync check",
            MasterState::RequestSemiSync => "Semi-sync request",
            MasterState::RequestBinlogDump => "Binlog dump request",
            MasterState::BinlogDump => "Binlog dump",
            MasterState::SlaveStopped => "Slave stopped",
        }
    }
}

/// Keys for master responses cached during registration and replayed to
/// replicas during their own handshakes.
pub mod saved_response {
    pub const SERVER_ID: &str = "server_id";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const CHKSUM: &str = "binlog_checksum";
    pub const GTID_MODE: &str = "gtid_mode";
    pub const UUID: &str = "uuid";
    pub const VERSION: &str = "version";
    pub const VERSION_COMMENT: &str = "version_comment";
    pub const HOSTNAME: &str = "hostname";
    pub const MAX_PACKET: &str = "max_allowed_packet";
    pub const SELECT1: &str = "select1";
}

/// Router settings derived from the binlog configuration
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub server_id: u32,
    pub fileroot: String,
    pub binlog_dir: PathBuf,
    pub trx_safe: bool,
    pub heartbeat_secs: u64,
    pub send_slave_heartbeat: bool,
    pub burst: u32,
    pub burst_size: u64,
    pub semi_sync: bool,
    pub mariadb10_master_gtid: bool,
    pub master_strict_gtid: bool,
    pub mariadb10_slave_only: bool,
    pub checksums: bool,
    pub connect_retry_secs: u64,
    pub encryption_setup: Option<(BinlogCipher, [u8; 32])>,
}

impl RouterSettings {
    pub fn from_config(config: &BinlogConfig, binlog_dir: PathBuf) -> Result<Self> {
        let encryption_setup = if config.encrypt_binlog {
            let cipher = BinlogCipher::from_name(&config.encryption_algorithm).ok_or_else(|| {
                Error::Config(format!(
                    "unknown binlog cipher '{}'",
                    config.encryption_algorithm
                ))
            })?;
            let key_file = config
                .encryption_key_file
                .as_ref()
                .ok_or_else(|| Error::Config("binlog encryption needs a key file".into()))?;
            let content = std::fs::read_to_string(key_file)?;
            Some((cipher, EncryptionContext::load_key(&content)?))
        } else {
            None
        };

        Ok(Self {
            server_id: config.server_id,
            fileroot: config.fileroot.clone(),
            binlog_dir,
            trx_safe: config.trx_safe,
            heartbeat_secs: config.heartbeat_secs,
            send_slave_heartbeat: config.send_slave_heartbeat,
            burst: config.burst,
            burst_size: config.burst_size,
            semi_sync: config.semi_sync,
            mariadb10_master_gtid: config.mariadb10_master_gtid,
            master_strict_gtid: config.master_strict_gtid,
            mariadb10_slave_only: config.mariadb10_slave_only,
            checksums: config.checksums,
            connect_retry_secs: config.connect_retry_secs,
            encryption_setup,
        })
    }
}

/// Live master-side status surfaced through SHOW SLAVE STATUS
#[derive(Debug, Clone)]
pub struct MasterStatus {
    pub state: MasterState,
    /// First error since the connection last worked; kept until reset
    pub error: Option<(u16, String)>,
    pub last_event_type: u8,
    pub last_event_timestamp: u32,
    pub connected_at: Option<Instant>,
}

impl Default for MasterStatus {
    fn default() -> Self {
        Self {
            state: MasterState::Unconnected,
            error: None,
            last_event_type: 0,
            last_event_timestamp: 0,
            connected_at: None,
        }
    }
}

/// The shared binlog router instance
pub struct Router {
    pub settings: RouterSettings,
    /// Upstream configuration; None until CHANGE MASTER TO or master.ini
    master_config: Mutex<Option<MasterConfig>>,
    status: Mutex<MasterStatus>,
    writer: Mutex<BinlogWriter>,
    pub gtid_store: GtidStore,
    /// Subscribed replicas; the mutex guards the list, event dispatch
    /// itself happens on each replica's owning worker
    slaves: Mutex<Vec<Arc<SlaveInfo>>>,
    /// Per-event-type ingest counters
    event_counters: Mutex<HashMap<u8, u64>>,
    saved_responses: Mutex<HashMap<&'static str, Vec<u8>>>,
    semi_sync_negotiated: AtomicBool,
    /// Wall-clock of the last packet from the master, for the watchdog
    last_master_traffic: Mutex<Instant>,
    /// Admin control over the master connection: STOP/START SLAVE
    master_run: tokio::sync::watch::Sender<bool>,
}

impl Router {
    pub fn new(settings: RouterSettings) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&settings.binlog_dir)?;
        let writer = BinlogWriter::create_or_resume(
            &settings.binlog_dir,
            &settings.fileroot,
            settings.encryption_setup,
        )?;
        let gtid_store = GtidStore::open(&settings.binlog_dir.join("gtid_maps.db"))?;
        let master_config = MasterConfig::load(&settings.binlog_dir)?;

        Ok(Arc::new(Self {
            settings,
            master_config: Mutex::new(master_config),
            status: Mutex::new(MasterStatus::default()),
            writer: Mutex::new(writer),
            gtid_store,
            slaves: Mutex::new(Vec::new()),
            event_counters: Mutex::new(HashMap::new()),
            saved_responses: Mutex::new(HashMap::new()),
            semi_sync_negotiated: AtomicBool::new(false),
            last_master_traffic: Mutex::new(Instant::now()),
            master_run: tokio::sync::watch::channel(true).0,
        }))
    }

    // ------------------------------------------------------------------
    // Master connection control
    // ------------------------------------------------------------------

    /// Receiver the master connection task watches for STOP/START SLAVE
    pub fn subscribe_master_run(&self) -> tokio::sync::watch::Receiver<bool> {
        self.master_run.subscribe()
    }

    pub fn master_should_run(&self) -> bool {
        *self.master_run.borrow()
    }

    pub fn request_master_stop(&self) {
        let _ = self.master_run.send(false);
    }

    pub fn request_master_start(&self) {
        let _ = self.master_run.send(true);
    }

    // ------------------------------------------------------------------
    // Master configuration
    // ------------------------------------------------------------------

    pub fn master_config(&self) -> Option<MasterConfig> {
        self.master_config.lock().unwrap().clone()
    }

    pub fn set_master_config(&self, config: Option<MasterConfig>) {
        *self.master_config.lock().unwrap() = config;
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn status(&self) -> MasterStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn set_state(&self, state: MasterState) {
        let mut status = self.status.lock().unwrap();
        tracing::debug!(from = status.state.name(), to = state.name(), "master state");
        status.state = state;
        if state == MasterState::BinlogDump {
            status.connected_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> MasterState {
        self.status.lock().unwrap().state
    }

    /// Record an error; only the first since the last reset survives
    pub fn record_error(&self, code: u16, message: &str) {
        let mut status = self.status.lock().unwrap();
        if status.error.is_none() {
            status.error = Some((code, message.to_string()));
        }
    }

    pub fn clear_error(&self) {
        self.status.lock().unwrap().error = None;
    }

    pub fn note_event(&self, event_type: u8, timestamp: u32) {
        let mut status = self.status.lock().unwrap();
        status.last_event_type = event_type;
        status.last_event_timestamp = timestamp;
        drop(status);
        *self
            .event_counters
            .lock()
            .unwrap()
            .entry(event_type)
            .or_insert(0) += 1;
        *self.last_master_traffic.lock().unwrap() = Instant::now();
    }

    pub fn event_counters(&self) -> HashMap<u8, u64> {
        self.event_counters.lock().unwrap().clone()
    }

    pub fn last_master_traffic(&self) -> Instant {
        *self.last_master_traffic.lock().unwrap()
    }

    pub fn touch_master_traffic(&self) {
        *self.last_master_traffic.lock().unwrap() = Instant::now();
    }

    // ------------------------------------------------------------------
    // Saved handshake responses
    // ------------------------------------------------------------------

    pub fn save_response(&self, key: &'static str, response: Vec<u8>) {
        self.saved_responses.lock().unwrap().insert(key, response);
    }

    pub fn saved_response(&self, key: &str) -> Option<Vec<u8>> {
        self.saved_responses.lock().unwrap().get(key).cloned()
    }

    // ------------------------------------------------------------------
    // Semi-sync
    // ------------------------------------------------------------------

    pub fn set_semi_sync_negotiated(&self, negotiated: bool) {
        self.semi_sync_negotiated.store(negotiated, Ordering::Release);
    }

    pub fn semi_sync_negotiated(&self) -> bool {
        self.semi_sync_negotiated.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Writer access
    // ------------------------------------------------------------------

    pub fn with_writer<T>(&self, f: impl FnOnce(&mut BinlogWriter) -> T) -> T {
        f(&mut self.writer.lock().unwrap())
    }

    pub fn positions(&self) -> BinlogPositions {
        self.writer.lock().unwrap().positions()
    }

    pub fn binlog_name(&self) -> String {
        self.writer.lock().unwrap().binlog_name().to_string()
    }

    pub fn file_encryption(&self) -> Option<EncryptionContext> {
        self.writer.lock().unwrap().encryption().cloned()
    }

    // ------------------------------------------------------------------
    // Slave list
    // ------------------------------------------------------------------

    pub fn add_slave(&self, slave: Arc<SlaveInfo>) {
        self.slaves.lock().unwrap().push(slave);
    }

    pub fn remove_slave(&self, server_id: u32) {
        self.slaves.lock().unwrap().retain(|s| s.server_id() != server_id);
    }

    pub fn slaves(&self) -> Vec<Arc<SlaveInfo>> {
        self.slaves.lock().unwrap().clone()
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.lock().unwrap().len()
    }

    /// Wake every dumping replica: new safe data is available. The nudge
    /// is an injected write event on the replica's owning worker; the
    /// catch-up path itself runs there.
    pub fn notify_slaves(&self) {
        for slave in self.slaves() {
            slave.nudge();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings(dir: &std::path::Path) -> RouterSettings {
        RouterSettings {
            server_id: 1001,
            fileroot: "bin".into(),
            binlog_dir: dir.to_path_buf(),
            trx_safe: true,
            heartbeat_secs: 300,
            send_slave_heartbeat: false,
            burst: 1500,
            burst_size: 1 << 20,
            semi_sync: false,
            mariadb10_master_gtid: true,
            master_strict_gtid: false,
            mariadb10_slave_only: false,
            checksums: true,
            connect_retry_secs: 60,
            encryption_setup: None,
        }
    }

    #[test]
    fn test_router_initial_state() {
        let dir = tempdir().unwrap();
        let router = Router::new(settings(dir.path())).unwrap();
        assert_eq!(router.state(), MasterState::Unconnected);
        assert_eq!(router.binlog_name(), "bin.000001");
        assert!(router.master_config().is_none());
        assert_eq!(router.slave_count(), 0);
    }

    #[test]
    fn test_first_error_survives() {
        let dir = tempdir().unwrap();
        let router = Router::new(settings(dir.path())).unwrap();

        router.record_error(1236, "first");
        router.record_error(1045, "second");
        let status = router.status();
        assert_eq!(status.error, Some((1236, "first".to_string())));

        router.clear_error();
        router.record_error(1045, "third");
        assert_eq!(router.status().error, Some((1045, "third".to_string())));
    }

    #[test]
    fn test_event_counters() {
        let dir = tempdir().unwrap();
        let router = Router::new(settings(dir.path())).unwrap();
        router.note_event(2, 100);
        router.note_event(2, 101);
        router.note_event(16, 102);

        let counters = router.event_counters();
        assert_eq!(counters.get(&2), Some(&2));
        assert_eq!(counters.get(&16), Some(&1));
        assert_eq!(router.status().last_event_type, 16);
    }

    #[test]
    fn test_saved_responses() {
        let dir = tempdir().unwrap();
        let router = Router::new(settings(dir.path())).unwrap();
        router.save_response(saved_response::VERSION, vec![1, 2, 3]);
        assert_eq!(
            router.saved_response(saved_response::VERSION),
            Some(vec![1, 2, 3])
        );
        assert!(router.saved_response(saved_response::HOSTNAME).is_none());
    }
}
