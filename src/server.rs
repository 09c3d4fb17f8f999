//! Backend Server Model
//!
//! A [`Server`] is the process-global description of one backend: identity,
//! live status bits, measured health and version. Servers are created at
//! configuration time and never destroyed; routers and monitors share them
//! by `Arc`. Status is a single atomic word so workers read it lock-free
//! while the owning monitor (or, unmonitored, the admin) writes it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::ServerConfig;

/// Server status bits
pub mod status {
    /// Server is reachable and accepting connections
    pub const RUNNING: u64 = 1 << 0;
    /// Put into maintenance by the admin
    pub const MAINT: u64 = 1 << 1;
    /// Replication master
    pub const MASTER: u64 = 1 << 2;
    /// Replication slave
    pub const SLAVE: u64 = 1 << 3;
    /// Synced member of a multi-master cluster
    pub const JOINED: u64 = 1 << 4;
    /// Intermediate relay master
    pub const RELAY: u64 = 1 << 5;
    /// Binlog relay service
    pub const BLR: u64 = 1 << 6;
    /// Draining: no new connections, existing ones finish
    pub const DRAINING: u64 = 1 << 7;
    /// Monitor credentials were rejected
    pub const AUTH_ERROR: u64 = 1 << 8;
    /// Hostname needs another DNS resolution
    pub const NEED_DNS: u64 = 1 << 9;
    /// Disk space limit exceeded
    pub const DISK_SPACE_EXHAUSTED: u64 = 1 << 10;

    /// Bits an admin may flip while the server is monitored
    pub const ADMIN_MUTABLE: u64 = MAINT | DRAINING | NEED_DNS;

    /// Render a status word the way SHOW SERVERS does
    pub fn to_string(bits: u64) -> String {
        let mut parts = Vec::new();
        if bits & MAINT != 0 {
            parts.push("Maintenance");
        }
        if bits & DRAINING != 0 {
            parts.push("Draining");
        }
        if bits & MASTER != 0 {
            parts.push("Master");
        }
        if bits & RELAY != 0 {
            parts.push("Relay Master");
        }
        if bits & SLAVE != 0 {
            parts.push("Slave");
        }
        if bits & JOINED != 0 {
            parts.push("Synced");
        }
        if bits & BLR != 0 {
            parts.push("Binlog Relay");
        }
        if bits & AUTH_ERROR != 0 {
            parts.push("Auth Error");
        }
        if bits & DISK_SPACE_EXHAUSTED != 0 {
            parts.push("Disk Space Exhausted");
        }
        if bits & RUNNING != 0 {
            parts.push("Running");
        } else {
            parts.push("Down");
        }
        parts.join(", ")
    }
}

/// Backend flavour inferred from the version string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Unknown,
    MariaDb,
    MySql,
    Clustrix,
    /// Another binlog relay
    Blr,
}

impl ServerType {
    fn from_u64(value: u64) -> Self {
        match value {
            1 => ServerType::MariaDb,
            2 => ServerType::MySql,
            3 => ServerType::Clustrix,
            4 => ServerType::Blr,
            _ => ServerType::Unknown,
        }
    }

    fn as_u64(self) -> u64 {
        match self {
            ServerType::Unknown => 0,
            ServerType::MariaDb => 1,
            ServerType::MySql => 2,
            ServerType::Clustrix => 3,
            ServerType::Blr => 4,
        }
    }
}

/// Parsed server version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Encoded as major*10000 + minor*100 + patch
    pub fn total(&self) -> u32 {
        self.major * 10000 + self.minor * 100 + self.patch
    }

    fn from_total(total: u32) -> Self {
        Self {
            major: total / 10000,
            minor: (total / 100) % 100,
            patch: total % 100,
        }
    }
}

/// Classify a version string. Substring matches are checked in a fixed
/// order because MariaDB-derived products embed "mariadb" in theirs too.
pub fn parse_version_string(version: &str) -> (Version, ServerType) {
    let mut numbers = [0u32; 3];
    let mut index = 0;
    let mut current = 0u32;
    let mut in_number = false;

    for c in version.chars() {
        if let Some(digit) = c.to_digit(10) {
            current = current * 10 + digit;
            in_number = true;
        } else if in_number {
            numbers[index] = current;
            current = 0;
            in_number = false;
            index += 1;
            if index == 3 || c != '.' {
                break;
            }
        }
    }
    if in_number && index < 3 {
        numbers[index] = current;
    }

    let lower = version.to_lowercase();
    let server_type = if lower.contains("clustrix") {
        ServerType::Clustrix
    } else if lower.contains("binlogrouter") {
        ServerType::Blr
    } else if lower.contains("mariadb") {
        ServerType::MariaDb
    } else {
        ServerType::MySql
    };

    (
        Version {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
        },
        server_type,
    )
}

/// Disk space limit: path plus maximum used percentage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpaceLimit {
    pub path: PathBuf,
    pub max_percentage: u8,
}

/// Parse "path:pct[,path:pct...]" disk space thresholds
pub fn parse_disk_space_threshold(spec: &str) -> Option<Vec<DiskSpaceLimit>> {
    let mut limits = Vec::new();
    for part in spec.split(',') {
        let (path, pct) = part.rsplit_once(':')?;
        let max_percentage: u8 = pct.trim().parse().ok()?;
        if max_percentage > 100 || path.is_empty() {
            return None;
        }
        limits.push(DiskSpaceLimit {
            path: PathBuf::from(path.trim()),
            max_percentage,
        });
    }
    Some(limits)
}

/// Response time histogram buckets, exponential from 100µs
const HISTOGRAM_BUCKETS: usize = 16;

/// Per-worker response time distribution, split read vs write
#[derive(Debug, Default, Clone)]
pub struct ResponseDistribution {
    pub read: [u64; HISTOGRAM_BUCKETS],
    pub write: [u64; HISTOGRAM_BUCKETS],
}

impl ResponseDistribution {
    fn bucket(duration: Duration) -> usize {
        let micros = duration.as_micros().max(1) as u64;
        let mut bucket = 0usize;
        let mut limit = 100u64;
        while micros > limit && bucket < HISTOGRAM_BUCKETS - 1 {
            limit *= 2;
            bucket += 1;
        }
        bucket
    }

    pub fn record_read(&mut self, duration: Duration) {
        self.read[Self::bucket(duration)] += 1;
    }

    pub fn record_write(&mut self, duration: Duration) {
        self.write[Self::bucket(duration)] += 1;
    }

    fn merge(&mut self, other: &ResponseDistribution) {
        for i in 0..HISTOGRAM_BUCKETS {
            self.read[i] += other.read[i];
            self.write[i] += other.write[i];
        }
    }
}

/// Process-global backend server object
pub struct Server {
    /// Immutable identity
    name: String,
    port: u16,
    socket: Option<PathBuf>,

    /// Mutable identity: hostname may be re-resolved, credentials rotated.
    /// Swapped whole under the lock so readers never see a torn value.
    address: RwLock<String>,
    monitor_user: RwLock<Option<String>>,
    monitor_password: RwLock<Option<String>>,

    /// Status bitmask; transitions are single atomic stores
    status: AtomicU64,
    /// Replication lag in seconds, negative when unknown
    lag_secs: AtomicI64,
    /// Last measured ping in microseconds, negative when unknown
    ping_us: AtomicI64,
    /// Version encoded as total; 0 until first probe
    version_total: AtomicU64,
    server_type: AtomicU64,
    version_string: RwLock<String>,

    /// Open connection count, for pool bookkeeping
    connections: AtomicUsize,

    /// Per-worker response time distributions, merged on demand
    response_times: RwLock<HashMap<usize, ResponseDistribution>>,

    /// Tracked session variables from the last probe
    variables: RwLock<HashMap<String, String>>,

    /// Per-domain GTID positions, domain id -> "domain-server-seq"
    gtid_positions: RwLock<HashMap<u32, String>>,

    /// Disk space limits parsed from configuration
    disk_space_limits: Vec<DiskSpaceLimit>,

    /// TLS client config towards this server
    tls: RwLock<Option<Arc<rustls::ClientConfig>>>,
}

impl Server {
    /// Build a server from its configuration. Servers are never destroyed.
    pub fn new(config: &ServerConfig) -> Arc<Self> {
        let disk_space_limits = config
            .disk_space_threshold
            .as_deref()
            .and_then(parse_disk_space_threshold)
            .unwrap_or_default();

        Arc::new(Self {
            name: config.name.clone(),
            port: config.port,
            socket: config.socket.clone(),
            address: RwLock::new(config.address.clone()),
            monitor_user: RwLock::new(config.monitor_user.clone()),
            monitor_password: RwLock::new(config.monitor_password.clone()),
            status: AtomicU64::new(0),
            lag_secs: AtomicI64::new(-1),
            ping_us: AtomicI64::new(-1),
            version_total: AtomicU64::new(0),
            server_type: AtomicU64::new(ServerType::Unknown.as_u64()),
            version_string: RwLock::new(String::new()),
            connections: AtomicUsize::new(0),
            response_times: RwLock::new(HashMap::new()),
            variables: RwLock::new(HashMap::new()),
            gtid_positions: RwLock::new(HashMap::new()),
            disk_space_limits,
            tls: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket(&self) -> Option<&PathBuf> {
        self.socket.as_ref()
    }

    pub fn address(&self) -> String {
        self.address.read().unwrap().clone()
    }

    /// Overwrite the address. The whole value swaps at once; a concurrent
    /// reader sees either the old or the new string, never a hybrid.
    pub fn set_address(&self, address: &str) {
        *self.address.write().unwrap() = address.to_string();
    }

    pub fn monitor_user(&self) -> Option<String> {
        self.monitor_user.read().unwrap().clone()
    }

    pub fn set_monitor_user(&self, user: Option<&str>) {
        *self.monitor_user.write().unwrap() = user.map(str::to_string);
    }

    pub fn monitor_password(&self) -> Option<String> {
        self.monitor_password.read().unwrap().clone()
    }

    pub fn set_monitor_password(&self, password: Option<&str>) {
        *self.monitor_password.write().unwrap() = password.map(str::to_string);
    }

    /// "host:port" for TCP servers, the socket path otherwise
    pub fn endpoint_address(&self) -> String {
        match &self.socket {
            Some(path) => path.display().to_string(),
            None => format!("{}:{}", self.address(), self.port),
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn status_bits(&self) -> u64 {
        self.status.load(Ordering::Acquire)
    }

    /// Replace the whole status word in one atomic store
    pub fn assign_status(&self, bits: u64) {
        self.status.store(bits, Ordering::Release);
    }

    pub fn set_status(&self, bits: u64) {
        self.status.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_status(&self, bits: u64) {
        self.status.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn status_string(&self) -> String {
        status::to_string(self.status_bits())
    }

    pub fn is_running(&self) -> bool {
        self.status_bits() & status::RUNNING != 0
    }

    pub fn is_master(&self) -> bool {
        let bits = self.status_bits();
        bits & status::RUNNING != 0 && bits & status::MASTER != 0 && bits & status::MAINT == 0
    }

    pub fn is_slave(&self) -> bool {
        let bits = self.status_bits();
        bits & status::RUNNING != 0 && bits & status::SLAVE != 0 && bits & status::MAINT == 0
    }

    pub fn is_joined(&self) -> bool {
        let bits = self.status_bits();
        bits & status::RUNNING != 0 && bits & status::JOINED != 0 && bits & status::MAINT == 0
    }

    pub fn is_relay(&self) -> bool {
        let bits = self.status_bits();
        bits & status::RUNNING != 0 && bits & status::RELAY != 0
    }

    pub fn is_in_maintenance(&self) -> bool {
        self.status_bits() & status::MAINT != 0
    }

    pub fn is_draining(&self) -> bool {
        self.status_bits() & status::DRAINING != 0
    }

    /// Eligible for new connections
    pub fn is_usable(&self) -> bool {
        let bits = self.status_bits();
        bits & status::RUNNING != 0 && bits & (status::MAINT | status::DRAINING) == 0
    }

    // ------------------------------------------------------------------
    // Health measurements
    // ------------------------------------------------------------------

    pub fn replication_lag(&self) -> Option<Duration> {
        let lag = self.lag_secs.load(Ordering::Relaxed);
        (lag >= 0).then(|| Duration::from_secs(lag as u64))
    }

    pub fn set_replication_lag(&self, lag: Option<Duration>) {
        self.lag_secs.store(
            lag.map(|d| d.as_secs() as i64).unwrap_or(-1),
            Ordering::Relaxed,
        );
    }

    pub fn ping(&self) -> Option<Duration> {
        let ping = self.ping_us.load(Ordering::Relaxed);
        (ping >= 0).then(|| Duration::from_micros(ping as u64))
    }

    pub fn set_ping(&self, ping: Duration) {
        self.ping_us
            .store(ping.as_micros() as i64, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Version
    // ------------------------------------------------------------------

    /// Record the version string reported by the server
    pub fn set_version(&self, version_string: &str) {
        let (version, server_type) = parse_version_string(version_string);
        self.version_total
            .store(version.total() as u64, Ordering::Release);
        self.server_type
            .store(server_type.as_u64(), Ordering::Release);
        *self.version_string.write().unwrap() = version_string.to_string();
    }

    pub fn version(&self) -> Version {
        Version::from_total(self.version_total.load(Ordering::Acquire) as u32)
    }

    pub fn version_string(&self) -> String {
        self.version_string.read().unwrap().clone()
    }

    pub fn server_type(&self) -> ServerType {
        ServerType::from_u64(self.server_type.load(Ordering::Acquire))
    }

    /// True for types that answer SQL queries
    pub fn is_database(&self) -> bool {
        matches!(
            self.server_type(),
            ServerType::MariaDb | ServerType::MySql | ServerType::Clustrix
        )
    }

    // ------------------------------------------------------------------
    // Connections and statistics
    // ------------------------------------------------------------------

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a response time observed by one worker
    pub fn record_response_time(&self, worker_id: usize, is_read: bool, duration: Duration) {
        let mut map = self.response_times.write().unwrap();
        let dist = map.entry(worker_id).or_default();
        if is_read {
            dist.record_read(duration);
        } else {
            dist.record_write(duration);
        }
    }

    /// Merge all per-worker distributions into one
    pub fn response_distribution(&self) -> ResponseDistribution {
        let map = self.response_times.read().unwrap();
        let mut merged = ResponseDistribution::default();
        for dist in map.values() {
            merged.merge(dist);
        }
        merged
    }

    // ------------------------------------------------------------------
    // Variables and GTID positions
    // ------------------------------------------------------------------

    pub fn set_variables(&self, variables: HashMap<String, String>) {
        *self.variables.write().unwrap() = variables;
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        self.variables.read().unwrap().get(name).cloned()
    }

    pub fn set_gtid_position(&self, domain: u32, gtid: String) {
        self.gtid_positions.write().unwrap().insert(domain, gtid);
    }

    pub fn gtid_position(&self, domain: u32) -> Option<String> {
        self.gtid_positions.read().unwrap().get(&domain).cloned()
    }

    pub fn clear_gtid_positions(&self) {
        self.gtid_positions.write().unwrap().clear();
    }

    pub fn disk_space_limits(&self) -> &[DiskSpaceLimit] {
        &self.disk_space_limits
    }

    // ------------------------------------------------------------------
    // TLS
    // ------------------------------------------------------------------

    pub fn set_tls_config(&self, config: Option<Arc<rustls::ClientConfig>>) {
        *self.tls.write().unwrap() = config;
    }

    pub fn tls_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        self.tls.read().unwrap().clone()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("address", &self.address())
            .field("port", &self.port)
            .field("status", &self.status_string())
            .finish()
    }
}

/// The process-wide set of configured servers
#[derive(Default)]
pub struct ServerSet {
    servers: Vec<Arc<Server>>,
}

impl ServerSet {
    pub fn from_config(configs: &[ServerConfig]) -> Self {
        Self {
            servers: configs.iter().map(Server::new).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.iter().find(|s| s.name() == name).cloned()
    }

    pub fn all(&self) -> &[Arc<Server>] {
        &self.servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> Arc<Server> {
        Server::new(&ServerConfig {
            name: "db1".into(),
            address: "10.0.0.1".into(),
            socket: None,
            port: 3306,
            monitor_user: None,
            monitor_password: None,
            ssl_enabled: false,
            ssl_ca: None,
            disk_space_threshold: None,
        })
    }

    #[test]
    fn test_version_parsing() {
        let (v, t) = parse_version_string("10.5.8-MariaDB-log");
        assert_eq!(v, Version { major: 10, minor: 5, patch: 8 });
        assert_eq!(v.total(), 100508);
        assert_eq!(t, ServerType::MariaDb);

        let (v, t) = parse_version_string("8.0.32");
        assert_eq!(v.total(), 80032);
        assert_eq!(t, ServerType::MySql);

        let (_, t) = parse_version_string("5.0.45-clustrix-9.1");
        assert_eq!(t, ServerType::Clustrix);

        let (_, t) = parse_version_string("10.4.12 binlogrouter");
        assert_eq!(t, ServerType::Blr);
    }

    #[test]
    fn test_type_inference_order() {
        // Clustrix wins even when the string also says mariadb.
        let (_, t) = parse_version_string("10.0-mariadb-clustrix");
        assert_eq!(t, ServerType::Clustrix);
    }

    #[test]
    fn test_status_bits() {
        let server = test_server();
        assert!(!server.is_running());

        server.set_status(status::RUNNING | status::MASTER);
        assert!(server.is_running());
        assert!(server.is_master());
        assert!(!server.is_slave());

        server.set_status(status::MAINT);
        assert!(!server.is_master());
        assert!(server.is_in_maintenance());
        assert!(!server.is_usable());

        server.clear_status(status::MAINT | status::MASTER);
        server.set_status(status::SLAVE);
        assert!(server.is_slave());
    }

    #[test]
    fn test_assign_status_replaces_word() {
        let server = test_server();
        server.set_status(status::RUNNING | status::SLAVE);
        server.assign_status(status::RUNNING | status::MASTER);
        assert!(server.is_master());
        assert!(!server.is_slave());
    }

    #[test]
    fn test_disk_space_threshold_parsing() {
        let limits = parse_disk_space_threshold("/data:80,/logs:90").unwrap();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].path, PathBuf::from("/data"));
        assert_eq!(limits[0].max_percentage, 80);

        assert!(parse_disk_space_threshold("/data:101").is_none());
        assert!(parse_disk_space_threshold("nonsense").is_none());
    }

    #[test]
    fn test_response_time_histogram_merge() {
        let server = test_server();
        server.record_response_time(0, true, Duration::from_micros(50));
        server.record_response_time(1, true, Duration::from_micros(50));
        server.record_response_time(1, false, Duration::from_millis(5));

        let merged = server.response_distribution();
        assert_eq!(merged.read[0], 2);
        assert_eq!(merged.write.iter().sum::<u64>(), 1);
    }

    #[test]
    fn test_gtid_positions_per_domain() {
        let server = test_server();
        server.set_gtid_position(0, "0-1-100".into());
        server.set_gtid_position(1, "1-1-55".into());
        assert_eq!(server.gtid_position(0).unwrap(), "0-1-100");
        assert_eq!(server.gtid_position(1).unwrap(), "1-1-55");
        assert!(server.gtid_position(2).is_none());
    }

    #[test]
    fn test_status_string() {
        let server = test_server();
        server.assign_status(status::RUNNING | status::MASTER);
        assert_eq!(server.status_string(), "Master, Running");
        server.assign_status(0);
        assert_eq!(server.status_string(), "Down");
    }
}
