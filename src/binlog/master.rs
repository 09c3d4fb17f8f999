//! Binlog Master Connection
//!
//! Connects upstream as a replica, walks the registration state machine
//! one query at a time while caching every response for replay to our own
//! replicas, then ingests the binlog dump: reassembling events split
//! across packets, verifying checksums, tracking transaction boundaries
//! so replicas only ever see committed data, writing events to disk and
//! answering semi-sync ACKs. A heartbeat watchdog tears the connection
//! down and reconnects with growing backoff when the master goes quiet.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};
use crate::proxy::protocol::{
    self, command, event_type, gtid_flags, verify_event_crc, MySqlPacket, RepHeader,
    EVENT_HEADER_LEN, MAX_PACKET_LEN, SEMI_SYNC_ACK_REQ, SEMI_SYNC_INDICATOR,
};

use super::gtid::Gtid;
use super::master_ini::MasterConfig;
use super::{saved_response, MasterState, Router};

/// Backoff increment between reconnect attempts
const MASTER_BACKOFF_TIME: Duration = Duration::from_secs(10);
/// Longest wait between reconnect attempts
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Artificial events are generated for the stream, not stored in a file
const LOG_EVENT_ARTIFICIAL_F: u16 = 0x0020;

/// Reconnect wait after `attempt` consecutive failures
fn backoff(attempt: u32) -> Duration {
    (MASTER_BACKOFF_TIME * attempt.max(1)).min(MAX_BACKOFF)
}

/// Multi-packet event reassembly states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblyState {
    /// Not inside a split event
    Done,
    /// First maximal packet seen
    Started,
    /// Continuation packets being accumulated
    Ongoing,
}

/// Reassembles events transmitted as multiple MySQL packets. The first
/// packet's OK byte (and semi-sync bytes) must already be stripped; the
/// whole payload of continuation packets is event data.
struct PacketAssembler {
    state: AssemblyState,
    buffer: Vec<u8>,
}

impl PacketAssembler {
    fn new() -> Self {
        Self {
            state: AssemblyState::Done,
            buffer: Vec::new(),
        }
    }

    fn in_progress(&self) -> bool {
        self.state != AssemblyState::Done
    }

    /// Feed one packet's event bytes; `packet_len` is the wire payload
    /// length including any stripped prefix bytes. Returns the complete
    /// event once the final packet arrives.
    fn push(&mut self, fragment: &[u8], packet_len: usize) -> Option<Vec<u8>> {
        let more = packet_len == MAX_PACKET_LEN;
        match self.state {
            AssemblyState::Done => {
                if more {
                    self.state = AssemblyState::Started;
                    self.buffer = fragment.to_vec();
                    None
                } else {
                    Some(fragment.to_vec())
                }
            }
            AssemblyState::Started | AssemblyState::Ongoing => {
                self.buffer.extend_from_slice(fragment);
                if more {
                    self.state = AssemblyState::Ongoing;
                    None
                } else {
                    self.state = AssemblyState::Done;
                    Some(std::mem::take(&mut self.buffer))
                }
            }
        }
    }
}

/// Transaction boundary outcome for one ingested event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrxOutcome {
    None,
    Opened,
    Committed,
}

/// Tracks open transactions so the advertised safe position only moves
/// on commit boundaries.
struct TrxTracker {
    trx_safe: bool,
    open: bool,
    start_pos: u64,
    /// GTID of the open transaction, recorded at commit
    pending_gtid: Option<Gtid>,
}

impl TrxTracker {
    fn new(trx_safe: bool) -> Self {
        Self {
            trx_safe,
            open: false,
            start_pos: 0,
            pending_gtid: None,
        }
    }

    fn in_transaction(&self) -> bool {
        self.open
    }

    fn pending_gtid(&self) -> Option<Gtid> {
        self.pending_gtid
    }

    fn start_pos(&self) -> u64 {
        self.start_pos
    }

    fn on_event(&mut self, header: &RepHeader, event: &[u8], offset: u64) -> TrxOutcome {
        if !self.trx_safe {
            return TrxOutcome::None;
        }
        match header.event_type {
            event_type::MARIADB_GTID_EVENT => {
                let flags = event
                    .get(EVENT_HEADER_LEN + 12)
                    .copied()
                    .unwrap_or(gtid_flags::FL_STANDALONE);
                let gtid = parse_gtid_event(header, event);
                if flags & (gtid_flags::FL_DDL | gtid_flags::FL_STANDALONE) == 0 {
                    self.open = true;
                    self.start_pos = offset;
                    self.pending_gtid = gtid;
                    TrxOutcome::Opened
                } else {
                    // Standalone transactions commit with this one event.
                    self.start_pos = offset;
                    self.pending_gtid = gtid;
                    TrxOutcome::Committed
                }
            }
            event_type::QUERY_EVENT => {
                let statement = query_statement(event).unwrap_or_default();
                let upper = statement.trim_start().to_uppercase();
                if upper.starts_with("BEGIN") {
                    if !self.open {
                        self.open = true;
                        self.start_pos = offset;
                        // Non-GTID stream; nothing to index at commit.
                        self.pending_gtid = None;
                    }
                    TrxOutcome::Opened
                } else if upper.starts_with("COMMIT") {
                    self.open = false;
                    TrxOutcome::Committed
                } else {
                    TrxOutcome::None
                }
            }
            event_type::XID_EVENT => {
                self.open = false;
                TrxOutcome::Committed
            }
            _ => TrxOutcome::None,
        }
    }
}

/// Extract the GTID triple from a MariaDB GTID event
fn parse_gtid_event(header: &RepHeader, event: &[u8]) -> Option<Gtid> {
    let body = event.get(EVENT_HEADER_LEN..)?;
    if body.len() < 12 {
        return None;
    }
    let sequence = u64::from_le_bytes(body[0..8].try_into().ok()?);
    let domain = u32::from_le_bytes(body[8..12].try_into().ok()?);
    Some(Gtid::new(domain, header.server_id, sequence))
}

/// Extract the SQL statement of a QUERY_EVENT
fn query_statement(event: &[u8]) -> Option<String> {
    // Post-header: thread_id(4) exec_time(4) db_len(1) error(2) status_len(2)
    let body = event.get(EVENT_HEADER_LEN..)?;
    if body.len() < 13 {
        return None;
    }
    let db_len = body[8] as usize;
    let status_len = u16::from_le_bytes([body[11], body[12]]) as usize;
    let statement_start = 13 + status_len + db_len + 1;
    // The trailing 4 bytes are the checksum.
    let statement_end = body.len().saturating_sub(4);
    if statement_start >= statement_end {
        return None;
    }
    Some(String::from_utf8_lossy(&body[statement_start..statement_end]).into_owned())
}

/// Parse a rotate event payload into (position, file name)
fn parse_rotate_event(event: &[u8], checksums: bool) -> Option<(u64, String)> {
    let body = event.get(EVENT_HEADER_LEN..)?;
    if body.len() < 9 {
        return None;
    }
    let position = u64::from_le_bytes(body[0..8].try_into().ok()?);
    let name_end = if checksums {
        body.len().saturating_sub(4)
    } else {
        body.len()
    };
    let name = String::from_utf8_lossy(&body[8..name_end]).into_owned();
    Some((position, name))
}

/// Build the semi-sync ACK payload for `(file, pos)`
fn build_semi_sync_ack(binlog_file: &str, position: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9 + binlog_file.len());
    payload.push(SEMI_SYNC_INDICATOR);
    payload.extend_from_slice(&position.to_le_bytes());
    payload.extend_from_slice(binlog_file.as_bytes());
    payload
}

/// Whether an ERR reply in `state` stops replication. The master simply
/// lacking GTID mode is tolerated.
fn err_is_fatal(state: MasterState) -> bool {
    state != MasterState::GtidMode
}

/// Registration step: a query to send and, optionally, where to cache
/// the verbatim response for replica handshakes.
struct RegistrationStep {
    state: MasterState,
    query: String,
    save_as: Option<&'static str>,
}

/// The upstream master connection task
pub struct MasterConnection {
    router: Arc<Router>,
}

impl MasterConnection {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Run until shutdown: connect, register, stream, and on any failure
    /// reconnect with exponential backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        let mut run_rx = self.router.subscribe_master_run();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !*run_rx.borrow() {
                // STOP SLAVE holds the connection down until START SLAVE.
                self.router.set_state(MasterState::SlaveStopped);
                tokio::select! {
                    _ = run_rx.changed() => continue,
                    _ = shutdown.changed() => break,
                }
            }
            let Some(config) = self.router.master_config() else {
                // Nothing to connect to until CHANGE MASTER TO arrives.
                self.router.set_state(MasterState::Unconnected);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    _ = shutdown.changed() => break,
                }
            };

            match self.connect_and_stream(&config, &mut shutdown).await {
                Ok(()) => {
                    // Clean stop (admin request or fatal master error).
                    if self.router.state() == MasterState::SlaveStopped {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {},
                            _ = shutdown.changed() => break,
                        }
                        continue;
                    }
                    attempt = 0;
                }
                Err(e) => {
                    attempt += 1;
                    let wait = backoff(attempt);
                    self.router.record_error(2003, &e.to_string());
                    self.router.set_state(MasterState::Unconnected);
                    tracing::error!(
                        error = %e,
                        attempt,
                        wait_secs = wait.as_secs(),
                        "master connection failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {},
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        tracing::info!("master connection task stopped");
    }

    async fn connect_and_stream(
        &self,
        config: &MasterConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let address = format!("{}:{}", config.host, config.port);
        self.router.set_state(MasterState::Connecting);
        tracing::info!(address = %address, ssl = config.ssl_enabled, "connecting to master");

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        if config.ssl_enabled {
            let connector = build_master_tls(config)?;
            let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
                .map_err(|_| Error::Tls(format!("bad TLS server name '{}'", config.host)))?;
            let mut stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| Error::TlsHandshake(e.to_string()))?;
            self.drive(&mut stream, config, shutdown).await
        } else {
            let mut stream = stream;
            self.drive(&mut stream, config, shutdown).await
        }
    }

    /// Authenticate, register and stream on an established transport
    async fn drive<S>(
        &self,
        stream: &mut S,
        config: &MasterConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.authenticate(stream, config).await?;
        self.router.set_state(MasterState::Authenticated);
        self.router.clear_error();

        if !self.register(stream, config).await? {
            return Ok(()); // stopped by a fatal ERR reply
        }

        self.router.set_state(MasterState::BinlogDump);
        tracing::info!(
            file = self.router.binlog_name(),
            position = self.router.positions().binlog_position,
            "binlog dump started"
        );
        self.stream_events(stream, shutdown).await
    }

    /// Perform the MySQL handshake with the replication credentials
    async fn authenticate<S>(&self, stream: &mut S, config: &MasterConfig) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (_, handshake) = read_packet(stream).await?;
        if handshake.first() == Some(&0xff) {
            let packet = MySqlPacket::new(0, handshake);
            let (code, message) = packet.error().unwrap_or((0, "unknown".into()));
            return Err(Error::MySql { code, message });
        }
        if handshake.len() < 2 {
            return Err(Error::Protocol("short master handshake".into()));
        }

        let version_end = handshake[1..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("unterminated version".into()))?
            + 1;
        let auth_start = version_end + 1 + 4;
        if handshake.len() < auth_start + 8 {
            return Err(Error::Protocol("master handshake lacks scramble".into()));
        }
        let mut seed = handshake[auth_start..auth_start + 8].to_vec();
        let part2_start = auth_start + 8 + 1 + 2 + 1 + 2 + 2 + 1 + 10;
        if handshake.len() >= part2_start + 12 {
            seed.extend_from_slice(&handshake[part2_start..part2_start + 12]);
        }

        let scramble = protocol::scramble_password(&config.password, &seed);
        let mut response = Vec::new();
        let capabilities: u32 = 0x000f_a68d;
        response.extend_from_slice(&capabilities.to_le_bytes());
        response.extend_from_slice(&16_777_216u32.to_le_bytes());
        response.push(33);
        response.extend_from_slice(&[0u8; 23]);
        response.extend_from_slice(config.user.as_bytes());
        response.push(0);
        response.push(scramble.len() as u8);
        response.extend_from_slice(&scramble);

        write_packet(stream, 1, &response).await?;

        let (_, reply) = read_packet(stream).await?;
        if reply.first() == Some(&0xff) {
            let packet = MySqlPacket::new(0, reply);
            let (code, message) = packet.error().unwrap_or((0, "auth failed".into()));
            return Err(Error::MySql { code, message });
        }
        tracing::debug!("authenticated with master");
        Ok(())
    }

    fn registration_steps(&self) -> Vec<RegistrationStep> {
        let settings = &self.router.settings;
        let heartbeat_ns = settings.heartbeat_secs * 1_000_000_000;
        let slave_uuid = uuid::Uuid::new_v4();

        let mut steps = vec![
            RegistrationStep {
                state: MasterState::Timestamp,
                query: "SELECT UNIX_TIMESTAMP()".into(),
                save_as: None,
            },
            RegistrationStep {
                state: MasterState::ServerId,
                query: "SELECT @@GLOBAL.server_id".into(),
                save_as: Some(saved_response::SERVER_ID),
            },
            RegistrationStep {
                state: MasterState::HbPeriod,
                query: format!("SET @master_heartbeat_period = {}", heartbeat_ns),
                save_as: Some(saved_response::HEARTBEAT),
            },
            RegistrationStep {
                state: MasterState::Chksum1,
                query: "SET @master_binlog_checksum = @@global.binlog_checksum".into(),
                save_as: None,
            },
            RegistrationStep {
                state: MasterState::Chksum2,
                query: "SELECT @@GLOBAL.binlog_checksum".into(),
                save_as: Some(saved_response::CHKSUM),
            },
            RegistrationStep {
                state: MasterState::Mariadb10,
                query: "SET @mariadb_slave_capability=4".into(),
                save_as: None,
            },
            RegistrationStep {
                state: MasterState::GtidMode,
                query: "SELECT @@GLOBAL.gtid_mode".into(),
                save_as: Some(saved_response::GTID_MODE),
            },
            RegistrationStep {
                state: MasterState::MasterUuid,
                query: "SHOW VARIABLES LIKE 'server_uuid'".into(),
                save_as: Some(saved_response::UUID),
            },
            RegistrationStep {
                state: MasterState::SlaveUuid,
                query: format!("SET @slave_uuid='{}'", slave_uuid),
                save_as: None,
            },
            RegistrationStep {
                state: MasterState::Latin1,
                query: "SET NAMES latin1".into(),
                save_as: None,
            },
            RegistrationStep {
                state: MasterState::Utf8,
                query: "SET NAMES utf8".into(),
                save_as: None,
            },
            RegistrationStep {
                state: MasterState::Select1,
                query: "SELECT 1".into(),
                save_as: Some(saved_response::SELECT1),
            },
            RegistrationStep {
                state: MasterState::SelectVer,
                query: "SELECT VERSION()".into(),
                save_as: Some(saved_response::VERSION),
            },
            RegistrationStep {
                state: MasterState::SelectVerCom,
                query: "SELECT @@version_comment limit 1".into(),
                save_as: Some(saved_response::VERSION_COMMENT),
            },
            RegistrationStep {
                state: MasterState::SelectHostname,
                query: "SELECT @@hostname".into(),
                save_as: Some(saved_response::HOSTNAME),
            },
            RegistrationStep {
                state: MasterState::Map,
                query: "SELECT @@max_allowed_packet".into(),
                save_as: Some(saved_response::MAX_PACKET),
            },
        ];

        if settings.mariadb10_master_gtid {
            let connect_state = self.router.gtid_store.current_pos().unwrap_or_default();
            steps.push(RegistrationStep {
                state: MasterState::GtidMode,
                query: format!("SET @slave_connect_state='{}'", connect_state),
                save_as: None,
            });
            steps.push(RegistrationStep {
                state: MasterState::GtidMode,
                query: "SET @slave_gtid_strict_mode=1".into(),
                save_as: None,
            });
            steps.push(RegistrationStep {
                state: MasterState::GtidMode,
                query: "SET @slave_gtid_ignore_duplicates=1".into(),
                save_as: None,
            });
        }
        steps
    }

    /// Walk the registration sequence; false means a fatal ERR moved the
    /// router to SlaveStopped.
    async fn register<S>(&self, stream: &mut S, config: &MasterConfig) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        for step in self.registration_steps() {
            self.router.set_state(step.state);
            let packet = protocol::build_query_packet(&step.query);
            stream.write_all(&packet.to_bytes()).await?;

            let response = read_response(stream).await?;
            if response_is_err(&response) {
                let (code, message) = parse_response_error(&response);
                if err_is_fatal(step.state) {
                    tracing::error!(
                        state = step.state.name(),
                        code,
                        message = %message,
                        "master rejected registration query"
                    );
                    self.router.record_error(code, &message);
                    self.router.set_state(MasterState::SlaveStopped);
                    return Ok(false);
                }
                tracing::info!("master has no GTID mode, continuing without it");
                continue;
            }
            if let Some(key) = step.save_as {
                self.router.save_response(key, response);
            }
        }

        // COM_REGISTER_SLAVE
        self.router.set_state(MasterState::Register);
        let mut payload = Vec::new();
        payload.push(command::COM_REGISTER_SLAVE);
        payload.extend_from_slice(&self.router.settings.server_id.to_le_bytes());
        payload.push(0); // hostname
        payload.push(0); // user
        payload.push(0); // password
        payload.extend_from_slice(&0u16.to_le_bytes()); // port
        payload.extend_from_slice(&0u32.to_le_bytes()); // rank
        payload.extend_from_slice(&0u32.to_le_bytes()); // master id
        write_packet(stream, 0, &payload).await?;
        let response = read_response(stream).await?;
        if response_is_err(&response) {
            let (code, message) = parse_response_error(&response);
            self.router.record_error(code, &message);
            self.router.set_state(MasterState::SlaveStopped);
            return Ok(false);
        }

        // Optional semi-sync negotiation
        self.router.set_semi_sync_negotiated(false);
        if self.router.settings.semi_sync {
            self.router.set_state(MasterState::CheckSemiSync);
            let query = protocol::build_query_packet(
                "SHOW VARIABLES LIKE 'rpl_semi_sync_master_enabled'",
            );
            stream.write_all(&query.to_bytes()).await?;
            let response = read_response(stream).await?;
            let enabled = !response_is_err(&response)
                && String::from_utf8_lossy(&response).contains("ON");

            if enabled {
                self.router.set_state(MasterState::RequestSemiSync);
                let query = protocol::build_query_packet("SET @rpl_semi_sync_slave = 1");
                stream.write_all(&query.to_bytes()).await?;
                let response = read_response(stream).await?;
                if !response_is_err(&response) {
                    self.router.set_semi_sync_negotiated(true);
                    tracing::info!("semi-sync replication negotiated");
                }
            } else {
                tracing::info!("master has semi-sync disabled");
            }
        }

        // COM_BINLOG_DUMP from the safe resume position
        self.router.set_state(MasterState::RequestBinlogDump);
        let file = if config.binlog_file.is_empty() {
            self.router.binlog_name()
        } else {
            config.binlog_file.clone()
        };
        let position = self.router.positions().binlog_position.max(4);

        let mut payload = Vec::new();
        payload.push(command::COM_BINLOG_DUMP);
        payload.extend_from_slice(&(position as u32).to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes()); // flags
        payload.extend_from_slice(&self.router.settings.server_id.to_le_bytes());
        payload.extend_from_slice(file.as_bytes());
        write_packet(stream, 0, &payload).await?;
        Ok(true)
    }

    /// Steady-state ingest loop
    async fn stream_events<S>(
        &self,
        stream: &mut S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let settings = self.router.settings.clone();
        let watchdog = Duration::from_secs(settings.heartbeat_secs + 1);
        let mut assembler = PacketAssembler::new();
        let mut tracker = TrxTracker::new(settings.trx_safe);
        let mut run_rx = self.router.subscribe_master_run();

        loop {
            let packet = tokio::select! {
                result = tokio::time::timeout(watchdog, read_packet(stream)) => match result {
                    Ok(Ok(packet)) => packet,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(Error::MasterLost(format!(
                            "no events from master within {} seconds",
                            watchdog.as_secs()
                        )));
                    }
                },
                _ = run_rx.changed() => {
                    if !*run_rx.borrow() {
                        self.router.set_state(MasterState::SlaveStopped);
                        return Ok(());
                    }
                    continue;
                }
                _ = shutdown.changed() => {
                    self.router.set_state(MasterState::Unconnected);
                    return Ok(());
                }
            };
            let (packet_len, payload) = packet;
            self.router.touch_master_traffic();

            if payload.is_empty() {
                continue;
            }

            let (fragment, ack_req) = if assembler.in_progress() {
                // Continuation packets carry raw event bytes.
                (&payload[..], false)
            } else {
                match payload[0] {
                    0x00 => {
                        let mut start = 1;
                        let mut ack = false;
                        if self.router.semi_sync_negotiated()
                            && payload.len() > 2
                            && payload[1] == SEMI_SYNC_INDICATOR
                        {
                            ack = payload[2] & SEMI_SYNC_ACK_REQ != 0;
                            start = 3;
                        }
                        (&payload[start..], ack)
                    }
                    0xff => {
                        let packet = MySqlPacket::new(0, payload.clone());
                        let (code, message) =
                            packet.error().unwrap_or((0, "master error".into()));
                        tracing::error!(code, message = %message, "master terminated replication");
                        self.router.record_error(code, &message);
                        self.router.set_state(MasterState::SlaveStopped);
                        return Ok(());
                    }
                    _ => {
                        tracing::debug!(first = payload[0], "non-event packet dropped");
                        continue;
                    }
                }
            };

            let Some(event) = assembler.push(fragment, packet_len) else {
                continue;
            };

            if event.len() < EVENT_HEADER_LEN {
                tracing::warn!(len = event.len(), "undersized replication message dropped");
                continue;
            }

            self.process_event(stream, &mut tracker, event, ack_req).await?;
        }
    }

    async fn process_event<S>(
        &self,
        stream: &mut S,
        tracker: &mut TrxTracker,
        event: Vec<u8>,
        ack_req: bool,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let settings = &self.router.settings;
        let header = RepHeader::parse(&event)
            .map_err(|e| Error::MalformedPacket(e.to_string()))?;

        if header.event_type > event_type::MAX_EVENT_TYPE_MARIADB10 {
            return Err(Error::Binlog(format!(
                "unknown event type {} from master",
                header.event_type
            )));
        }
        if header.event_size as usize != event.len() {
            return Err(Error::MalformedPacket(format!(
                "event size {} but {} bytes on the wire",
                header.event_size,
                event.len()
            )));
        }

        if settings.checksums
            && header.event_type != event_type::FORMAT_DESCRIPTION_EVENT
            && !verify_event_crc(&event)
        {
            let file = self.router.binlog_name();
            let pos = self.router.positions().current_pos;
            self.router.record_error(
                protocol::error_code::MASTER_FATAL_READING_BINLOG,
                &format!("checksum mismatch at {}:{}", file, pos),
            );
            return Err(Error::ChecksumMismatch { file, pos });
        }

        self.router.note_event(header.event_type, header.timestamp);
        let artificial = header.flags & LOG_EVENT_ARTIFICIAL_F != 0;

        match header.event_type {
            event_type::HEARTBEAT_EVENT => {
                // Keeps the watchdog quiet; never stored.
                return Ok(());
            }
            event_type::ROTATE_EVENT => {
                let (position, next_file) = parse_rotate_event(&event, settings.checksums)
                    .ok_or_else(|| Error::MalformedPacket("bad rotate event".into()))?;
                if artificial {
                    tracing::debug!(file = next_file, position, "stream position announced");
                } else {
                    self.router.with_writer(|writer| -> Result<()> {
                        writer.write_event(&header, &event)?;
                        writer.rotate(&next_file)
                    })?;
                    self.router.notify_slaves();
                }
                return Ok(());
            }
            event_type::FORMAT_DESCRIPTION_EVENT => {
                if header.next_pos == 0 {
                    // Stream descriptor at dump start, not file content.
                    return Ok(());
                }
                self.router
                    .with_writer(|writer| writer.write_event(&header, &event))?;
                return Ok(());
            }
            _ => {}
        }

        // Ordinary event: track the transaction, then persist.
        let offset = self.router.positions().current_pos;
        let outcome = tracker.on_event(&header, &event, offset);

        self.router
            .with_writer(|writer| writer.write_event(&header, &event))?;

        match outcome {
            TrxOutcome::Committed => {
                let end_pos = self.router.positions().current_pos;
                if let Some(gtid) = tracker.pending_gtid() {
                    let start = if tracker.start_pos() > 0 {
                        tracker.start_pos()
                    } else {
                        offset
                    };
                    self.router.gtid_store.record(
                        gtid,
                        &self.router.binlog_name(),
                        start,
                        end_pos,
                    )?;
                }
                self.router.with_writer(|writer| {
                    writer.commit_transaction();
                    writer.set_current_safe_event(offset);
                });
                self.router.notify_slaves();
            }
            TrxOutcome::Opened => {
                // Events stay unadvertised until the transaction closes.
            }
            TrxOutcome::None => {
                if !tracker.in_transaction() {
                    self.router.with_writer(|writer| {
                        writer.advance_binlog_position();
                        writer.set_current_safe_event(offset);
                    });
                    self.router.notify_slaves();
                }
            }
        }

        if ack_req {
            let positions = self.router.positions();
            let ack = build_semi_sync_ack(&self.router.binlog_name(), positions.current_pos);
            write_packet(stream, 0, &ack).await?;
        }
        Ok(())
    }
}

/// Build the TLS connector for an SSL-enabled master
fn build_master_tls(config: &MasterConfig) -> Result<TlsConnector> {
    let ca_path = config
        .ssl_ca
        .as_ref()
        .ok_or_else(|| Error::Tls("MASTER_SSL requires MASTER_SSL_CA".into()))?;

    let mut roots = rustls::RootCertStore::empty();
    let ca_file = std::fs::File::open(ca_path)?;
    for cert in rustls_pemfile::certs(&mut std::io::BufReader::new(ca_file)) {
        roots
            .add(cert?)
            .map_err(|e| Error::Tls(format!("bad CA certificate: {}", e)))?;
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let client_config = match (&config.ssl_cert, &config.ssl_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert_file = std::fs::File::open(cert_path)?;
            let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
                .collect::<std::io::Result<Vec<_>>>()?;
            let key_file = std::fs::File::open(key_path)?;
            let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))?
                .ok_or_else(|| Error::Tls(format!("no private key in {}", key_path)))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Tls(e.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Read one MySQL packet: (payload_len, payload)
async fn read_packet<S>(stream: &mut S) -> Result<(usize, Vec<u8>)>
where
    S: AsyncRead + Unpin + Send,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((len, payload))
}

async fn write_packet<S>(stream: &mut S, seqno: u8, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    let mut packet = Vec::with_capacity(4 + payload.len());
    packet.push((payload.len() & 0xff) as u8);
    packet.push(((payload.len() >> 8) & 0xff) as u8);
    packet.push(((payload.len() >> 16) & 0xff) as u8);
    packet.push(seqno);
    packet.extend_from_slice(payload);
    stream.write_all(&packet).await?;
    Ok(())
}

/// Read a complete query response: a single OK/ERR packet, or a resultset
/// up to its terminating EOF. Returned verbatim (all packets) for caching.
async fn read_response<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin + Send,
{
    let mut response = Vec::new();
    let mut eof_count = 0;
    let mut is_resultset = false;

    loop {
        let (len, payload) = read_packet(stream).await?;
        response.push((len & 0xff) as u8);
        response.push(((len >> 8) & 0xff) as u8);
        response.push(((len >> 16) & 0xff) as u8);
        response.push(0); // seqno rewritten on replay
        response.extend_from_slice(&payload);

        match payload.first() {
            Some(&0x00) if !is_resultset => return Ok(response),
            Some(&0xff) => return Ok(response),
            Some(&0xfe) if payload.len() < 9 => {
                eof_count += 1;
                if eof_count == 2 {
                    return Ok(response);
                }
            }
            _ => {
                is_resultset = true;
            }
        }
    }
}

/// First packet of a cached response is an ERR
fn response_is_err(response: &[u8]) -> bool {
    response.get(4) == Some(&0xff)
}

fn parse_response_error(response: &[u8]) -> (u16, String) {
    match MySqlPacket::read(response) {
        Ok((packet, _)) => packet.error().unwrap_or((0, "unknown error".into())),
        Err(_) => (0, "unparseable error".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event(event_type: u8, payload: &[u8], offset: u32) -> Vec<u8> {
        let event_size = (EVENT_HEADER_LEN + payload.len() + 4) as u32;
        let header = RepHeader {
            timestamp: 1_700_000_000,
            event_type,
            server_id: 7,
            event_size,
            next_pos: offset + event_size,
            flags: 0,
        };
        let mut event = vec![0u8; event_size as usize];
        header.write(&mut event);
        event[EVENT_HEADER_LEN..EVENT_HEADER_LEN + payload.len()].copy_from_slice(payload);
        protocol::restamp_event_crc(&mut event);
        event
    }

    fn make_gtid_event(sequence: u64, domain: u32, flags: u8) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&sequence.to_le_bytes());
        payload.extend_from_slice(&domain.to_le_bytes());
        payload.push(flags);
        make_event(event_type::MARIADB_GTID_EVENT, &payload, 4)
    }

    fn make_query_event(statement: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_le_bytes()); // thread id
        payload.extend_from_slice(&0u32.to_le_bytes()); // exec time
        payload.push(4); // db name length: "test"
        payload.extend_from_slice(&0u16.to_le_bytes()); // error code
        payload.extend_from_slice(&0u16.to_le_bytes()); // status vars len
        payload.extend_from_slice(b"test\0");
        payload.extend_from_slice(statement.as_bytes());
        make_event(event_type::QUERY_EVENT, &payload, 4)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(10));
        assert_eq!(backoff(3), Duration::from_secs(30));
        assert_eq!(backoff(10), Duration::from_secs(60));
        assert_eq!(backoff(100), Duration::from_secs(60));
    }

    #[test]
    fn test_assembler_passthrough() {
        let mut assembler = PacketAssembler::new();
        let event = vec![1u8; 100];
        let out = assembler.push(&event, 101).unwrap();
        assert_eq!(out, event);
        assert!(!assembler.in_progress());
    }

    #[test]
    fn test_assembler_two_packet_event() {
        let mut assembler = PacketAssembler::new();
        let first = vec![1u8; MAX_PACKET_LEN - 1];
        assert!(assembler.push(&first, MAX_PACKET_LEN).is_none());
        assert!(assembler.in_progress());

        let rest = vec![2u8; 500];
        let out = assembler.push(&rest, 500).unwrap();
        assert_eq!(out.len(), MAX_PACKET_LEN - 1 + 500);
        assert_eq!(out[MAX_PACKET_LEN - 1], 2);
    }

    #[test]
    fn test_assembler_exact_boundary_with_empty_tail() {
        let mut assembler = PacketAssembler::new();
        let first = vec![1u8; MAX_PACKET_LEN - 1];
        assert!(assembler.push(&first, MAX_PACKET_LEN).is_none());
        // The empty terminator completes the event.
        let out = assembler.push(&[], 0).unwrap();
        assert_eq!(out.len(), MAX_PACKET_LEN - 1);
    }

    #[test]
    fn test_trx_tracking_gtid_then_xid() {
        let mut tracker = TrxTracker::new(true);

        let gtid = make_gtid_event(100, 0, 0);
        let header = RepHeader::parse(&gtid).unwrap();
        assert_eq!(tracker.on_event(&header, &gtid, 4), TrxOutcome::Opened);
        assert!(tracker.in_transaction());
        assert_eq!(tracker.pending_gtid(), Some(Gtid::new(0, 7, 100)));

        let xid = make_event(event_type::XID_EVENT, &42u64.to_le_bytes(), 200);
        let header = RepHeader::parse(&xid).unwrap();
        assert_eq!(tracker.on_event(&header, &xid, 200), TrxOutcome::Committed);
        assert!(!tracker.in_transaction());
    }

    #[test]
    fn test_trx_tracking_standalone_gtid_never_opens() {
        let mut tracker = TrxTracker::new(true);
        let gtid = make_gtid_event(5, 0, gtid_flags::FL_STANDALONE);
        let header = RepHeader::parse(&gtid).unwrap();
        assert_eq!(tracker.on_event(&header, &gtid, 4), TrxOutcome::Committed);
        assert!(!tracker.in_transaction());
    }

    #[test]
    fn test_trx_tracking_begin_commit_queries() {
        let mut tracker = TrxTracker::new(true);

        let begin = make_query_event("BEGIN");
        let header = RepHeader::parse(&begin).unwrap();
        assert_eq!(tracker.on_event(&header, &begin, 4), TrxOutcome::Opened);

        let insert = make_query_event("INSERT INTO t VALUES (1)");
        let header = RepHeader::parse(&insert).unwrap();
        assert_eq!(tracker.on_event(&header, &insert, 50), TrxOutcome::None);
        assert!(tracker.in_transaction());

        let commit = make_query_event("COMMIT");
        let header = RepHeader::parse(&commit).unwrap();
        assert_eq!(tracker.on_event(&header, &commit, 90), TrxOutcome::Committed);
        assert!(!tracker.in_transaction());
    }

    #[test]
    fn test_trx_tracking_disabled() {
        let mut tracker = TrxTracker::new(false);
        let begin = make_query_event("BEGIN");
        let header = RepHeader::parse(&begin).unwrap();
        assert_eq!(tracker.on_event(&header, &begin, 4), TrxOutcome::None);
        assert!(!tracker.in_transaction());
    }

    #[test]
    fn test_query_statement_extraction() {
        let event = make_query_event("INSERT INTO t VALUES (1)");
        assert_eq!(
            query_statement(&event).unwrap(),
            "INSERT INTO t VALUES (1)"
        );
    }

    #[test]
    fn test_rotate_event_parsing() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u64.to_le_bytes());
        payload.extend_from_slice(b"bin.000002");
        let event = make_event(event_type::ROTATE_EVENT, &payload, 4);

        let (position, name) = parse_rotate_event(&event, true).unwrap();
        assert_eq!(position, 4);
        assert_eq!(name, "bin.000002");
    }

    #[test]
    fn test_semi_sync_ack_layout() {
        let ack = build_semi_sync_ack("bin.000001", 1234);
        assert_eq!(ack[0], SEMI_SYNC_INDICATOR);
        assert_eq!(u64::from_le_bytes(ack[1..9].try_into().unwrap()), 1234);
        assert_eq!(&ack[9..], b"bin.000001");
    }

    #[test]
    fn test_gtid_mode_error_tolerated() {
        assert!(!err_is_fatal(MasterState::GtidMode));
        assert!(err_is_fatal(MasterState::ServerId));
        assert!(err_is_fatal(MasterState::Register));
    }

    #[test]
    fn test_gtid_event_parse() {
        let event = make_gtid_event(987, 3, 0);
        let header = RepHeader::parse(&event).unwrap();
        assert_eq!(parse_gtid_event(&header, &event), Some(Gtid::new(3, 7, 987)));
    }
}
