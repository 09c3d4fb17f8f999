//! Binlog Slave Service
//!
//! Serves downstream replicas: accepts their connections, answers the
//! registration handshake (largely by replaying cached master responses),
//! places them in the stored binlog stream and feeds them events in
//! bounded bursts, pacing on the connection's write-queue watermarks. The
//! same connection doubles as the limited administration surface (CHANGE
//! MASTER TO, SHOW SLAVE STATUS and friends).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::buffer::Buffer;
use crate::dcb::{CallbackReason, Dcb, DcbHandler, DcbLimits, DcbRole};
use crate::error::{Error, Result};
use crate::proxy::protocol::{
    self, build_error_packet, build_ok_packet, build_resultset, error_code, event_type,
    frame_event, MySqlPacket, RepHeader, EVENT_HEADER_LEN, LOG_EVENT_IGNORABLE_F,
};
use crate::worker::{DcbRemote, WorkerPool};

use super::file::{self, BinlogReader, BINLOG_HEADER_LEN};
use super::gtid::Gtid;
use super::{saved_response, MasterState, Router};

/// Artificial event flag on fake rotates and heartbeats
const LOG_EVENT_ARTIFICIAL_F: u16 = 0x0020;

/// Replica connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    Created,
    Unregistered,
    Registered,
    Dumping,
    Errored,
}

/// Last event handed to a replica, with the worker that sent it
#[derive(Debug, Clone, PartialEq, Eq)]
struct LastSent {
    file: String,
    pos: u64,
    sender: usize,
}

/// Shared record of one subscribed replica
pub struct SlaveInfo {
    dcb: DcbRemote,
    server_id: u32,
    hostname: String,
    state: Mutex<SlaveState>,
    /// Current dump position (file, next event offset)
    position: Mutex<(String, u64)>,
    last_sent: Mutex<Option<LastSent>>,
    last_event_at: Mutex<Instant>,
    /// Set by the heartbeat task; consumed by the handler on its worker
    heartbeat_due: AtomicBool,
}

impl SlaveInfo {
    fn new(dcb: DcbRemote, server_id: u32, hostname: String) -> Arc<Self> {
        Arc::new(Self {
            dcb,
            server_id,
            hostname,
            state: Mutex::new(SlaveState::Registered),
            position: Mutex::new((String::new(), 0)),
            last_sent: Mutex::new(None),
            last_event_at: Mutex::new(Instant::now()),
            heartbeat_due: AtomicBool::new(false),
        })
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state(&self) -> SlaveState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SlaveState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn position(&self) -> (String, u64) {
        self.position.lock().unwrap().clone()
    }

    fn set_position(&self, file: String, pos: u64) {
        *self.position.lock().unwrap() = (file, pos);
    }

    pub fn seconds_idle(&self) -> u64 {
        self.last_event_at.lock().unwrap().elapsed().as_secs()
    }

    fn touch(&self) {
        *self.last_event_at.lock().unwrap() = Instant::now();
    }

    /// Wake this replica's catch-up on its owning worker
    pub fn nudge(&self) {
        if self.state() == SlaveState::Dumping {
            self.dcb.trigger_write_event();
        }
    }

    fn request_heartbeat(&self) {
        self.heartbeat_due.store(true, Ordering::Release);
        self.dcb.trigger_write_event();
    }

    fn take_heartbeat_due(&self) -> bool {
        self.heartbeat_due.swap(false, Ordering::AcqRel)
    }

    /// Dedup guard: true when `(file, pos)` was already sent. The racing
    /// sender's worker id goes into the log line.
    fn check_and_mark_sent(&self, file: &str, pos: u64, sender: usize) -> bool {
        let mut last = self.last_sent.lock().unwrap();
        if let Some(prev) = last.as_ref() {
            if prev.file == file && prev.pos == pos {
                tracing::error!(
                    server_id = self.server_id,
                    file,
                    pos,
                    first_sender = prev.sender,
                    second_sender = sender,
                    "duplicate event send rejected"
                );
                return false;
            }
        }
        *last = Some(LastSent {
            file: file.to_string(),
            pos,
            sender,
        });
        true
    }
}

/// Build the artificial rotate event that opens every dump
fn build_fake_rotate(server_id: u32, binlog_file: &str, position: u64) -> Vec<u8> {
    let payload_len = 8 + binlog_file.len();
    let event_size = (EVENT_HEADER_LEN + payload_len + 4) as u32;
    let mut event = vec![0u8; event_size as usize];
    let header = RepHeader {
        timestamp: 0,
        event_type: event_type::ROTATE_EVENT,
        server_id,
        event_size,
        next_pos: 0,
        flags: LOG_EVENT_ARTIFICIAL_F,
    };
    header.write(&mut event);
    event[EVENT_HEADER_LEN..EVENT_HEADER_LEN + 8].copy_from_slice(&position.to_le_bytes());
    event[EVENT_HEADER_LEN + 8..EVENT_HEADER_LEN + payload_len]
        .copy_from_slice(binlog_file.as_bytes());
    protocol::restamp_event_crc(&mut event);
    event
}

/// Build an artificial GTID list event from the current per-domain GTIDs
fn build_fake_gtid_list(server_id: u32, gtids: &[Gtid], next_pos: u32) -> Vec<u8> {
    let payload_len = 4 + gtids.len() * 16;
    let event_size = (EVENT_HEADER_LEN + payload_len + 4) as u32;
    let mut event = vec![0u8; event_size as usize];
    let header = RepHeader {
        timestamp: 0,
        event_type: event_type::MARIADB_GTID_LIST_EVENT,
        server_id,
        event_size,
        next_pos,
        flags: LOG_EVENT_ARTIFICIAL_F,
    };
    header.write(&mut event);
    let body = &mut event[EVENT_HEADER_LEN..];
    body[0..4].copy_from_slice(&(gtids.len() as u32).to_le_bytes());
    for (i, gtid) in gtids.iter().enumerate() {
        let at = 4 + i * 16;
        body[at..at + 4].copy_from_slice(&gtid.domain.to_le_bytes());
        body[at + 4..at + 8].copy_from_slice(&gtid.server_id.to_le_bytes());
        body[at + 8..at + 16].copy_from_slice(&gtid.sequence.to_le_bytes());
    }
    protocol::restamp_event_crc(&mut event);
    event
}

/// Build an artificial heartbeat event naming the current file
fn build_heartbeat_event(server_id: u32, binlog_file: &str, position: u64) -> Vec<u8> {
    let payload_len = binlog_file.len();
    let event_size = (EVENT_HEADER_LEN + payload_len + 4) as u32;
    let mut event = vec![0u8; event_size as usize];
    let header = RepHeader {
        timestamp: 0,
        event_type: event_type::HEARTBEAT_EVENT,
        server_id,
        event_size,
        next_pos: position as u32,
        flags: LOG_EVENT_ARTIFICIAL_F,
    };
    header.write(&mut event);
    event[EVENT_HEADER_LEN..EVENT_HEADER_LEN + payload_len]
        .copy_from_slice(binlog_file.as_bytes());
    protocol::restamp_event_crc(&mut event);
    event
}

/// Parse the option list of CHANGE MASTER TO into key/value pairs
fn parse_change_master(statement: &str) -> Result<HashMap<String, String>> {
    let upper = statement.to_uppercase();
    let at = upper
        .find("CHANGE MASTER")
        .and_then(|_| upper.find(" TO"))
        .ok_or_else(|| Error::Protocol("not a CHANGE MASTER TO statement".into()))?;
    let options = &statement[at + 3..];

    let mut result = HashMap::new();
    for part in split_top_level(options) {
        let part = part.trim().trim_end_matches(';');
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| Error::Protocol(format!("malformed option '{}'", part)))?;
        let key = key.trim().to_uppercase();
        let value = value.trim().trim_matches('\'').trim_matches('"').to_string();
        result.insert(key, value);
    }
    Ok(result)
}

/// Split on commas that are not inside quotes
fn split_top_level(options: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in options.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ',' => {
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn epoch_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Protocol handler for one replica connection
pub struct SlaveHandler {
    router: Arc<Router>,
    state: SlaveState,
    info: Option<Arc<SlaveInfo>>,
    remote: DcbRemote,
    /// Partial packet bytes carried between reads
    pending: Vec<u8>,
    seqno: u8,
    /// Capabilities announced by the replica through SET statements
    mariadb10_capable: bool,
    requested_gtid: Option<String>,
    reader: Option<BinlogReader>,
    server_id: u32,
    hostname: String,
}

impl SlaveHandler {
    pub fn new(router: Arc<Router>, remote: DcbRemote) -> Self {
        Self {
            router,
            state: SlaveState::Created,
            info: None,
            remote,
            pending: Vec::new(),
            seqno: 0,
            mariadb10_capable: false,
            requested_gtid: None,
            reader: None,
            server_id: 0,
            hostname: String::new(),
        }
    }

    /// Send the server handshake; called right after registration
    pub fn send_handshake(&mut self, dcb: &mut Dcb) {
        let scramble = [0x5au8; 20];
        let handshake =
            protocol::build_handshake_packet("10.5.0-wolfrelay-binlog", &scramble);
        dcb.writeq_append(Buffer::from_vec(handshake.to_bytes()));
        self.state = SlaveState::Unregistered;
    }

    fn reply(&mut self, dcb: &mut Dcb, bytes: Vec<u8>) {
        dcb.writeq_append(Buffer::from_vec(bytes));
    }

    fn reply_ok(&mut self, dcb: &mut Dcb, seqno: u8) {
        let ok = build_ok_packet(seqno, 0, 0);
        self.reply(dcb, ok.to_bytes());
    }

    fn reply_error(&mut self, dcb: &mut Dcb, seqno: u8, code: u16, message: &str) {
        let err = build_error_packet(seqno, code, "HY000", message);
        self.reply(dcb, err.to_bytes());
    }

    /// Replay a cached master response, renumbering the packets
    fn replay_saved(&mut self, dcb: &mut Dcb, key: &str, fallback: &str, column: &str) {
        match self.router.saved_response(key) {
            Some(mut response) => {
                renumber_packets(&mut response);
                self.reply(dcb, response);
            }
            None => {
                let body = build_resultset(&[column], &[vec![fallback.to_string()]], 1);
                self.reply(dcb, body);
            }
        }
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    fn handle_packet(&mut self, dcb: &mut Dcb, packet: MySqlPacket) -> Result<()> {
        if self.state == SlaveState::Unregistered && packet.header.sequence_id != 0 {
            // Handshake response; authentication providers are external,
            // the relay accepts and records the user.
            tracing::debug!(uid = dcb.uid(), "replica completed handshake");
            self.reply_ok(dcb, packet.header.sequence_id.wrapping_add(1));
            return Ok(());
        }

        match packet.command() {
            Some(protocol::PacketType::RegisterSlave) => self.register_slave(dcb, &packet),
            Some(protocol::PacketType::BinlogDump) => self.binlog_dump(dcb, &packet),
            Some(protocol::PacketType::Query) => {
                let query = packet.query_string().unwrap_or_default();
                self.admin_statement(dcb, &query)
            }
            Some(protocol::PacketType::Ping) => {
                self.reply_ok(dcb, 1);
                Ok(())
            }
            Some(protocol::PacketType::Quit) => {
                dcb.close();
                Ok(())
            }
            _ => {
                self.reply_error(dcb, 1, error_code::UNKNOWN_COM, "Unknown command");
                Ok(())
            }
        }
    }

    fn register_slave(&mut self, dcb: &mut Dcb, packet: &MySqlPacket) -> Result<()> {
        let payload = &packet.payload;
        if payload.len() < 18 {
            self.reply_error(dcb, 1, error_code::PARSE_ERROR, "Malformed COM_REGISTER_SLAVE");
            return Ok(());
        }
        self.server_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let host_len = payload[5] as usize;
        self.hostname = String::from_utf8_lossy(&payload[6..6 + host_len.min(payload.len() - 6)])
            .into_owned();

        if self.router.settings.mariadb10_slave_only && !self.mariadb10_capable {
            self.reply_error(
                dcb,
                1,
                error_code::MASTER_FATAL_READING_BINLOG,
                "Only MariaDB 10 replicas are accepted",
            );
            self.state = SlaveState::Errored;
            return Ok(());
        }

        tracing::info!(
            server_id = self.server_id,
            hostname = self.hostname,
            "replica registered"
        );
        self.state = SlaveState::Registered;
        self.reply_ok(dcb, 1);
        Ok(())
    }

    fn binlog_dump(&mut self, dcb: &mut Dcb, packet: &MySqlPacket) -> Result<()> {
        if self.state != SlaveState::Registered {
            self.reply_error(
                dcb,
                1,
                error_code::MASTER_FATAL_READING_BINLOG,
                "COM_BINLOG_DUMP before registration",
            );
            return Ok(());
        }
        let payload = &packet.payload;
        if payload.len() < 11 {
            self.reply_error(dcb, 1, error_code::PARSE_ERROR, "Malformed COM_BINLOG_DUMP");
            return Ok(());
        }
        let requested_pos =
            u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]) as u64;
        let requested_file = String::from_utf8_lossy(&payload[11..]).into_owned();

        let settings = self.router.settings.clone();
        if settings.mariadb10_master_gtid
            && settings.master_strict_gtid
            && self.requested_gtid.as_deref().map_or(true, str::is_empty)
            && requested_file.is_empty()
        {
            self.reply_error(
                dcb,
                1,
                error_code::MASTER_FATAL_READING_BINLOG,
                "GTID-mode master requires @slave_connect_state",
            );
            self.state = SlaveState::Errored;
            return Ok(());
        }

        // Place the replica in the stream.
        let (mut start_file, mut start_pos) = match self.resolve_start(requested_file, requested_pos)
        {
            Ok(start) => start,
            Err(message) => {
                self.reply_error(dcb, 1, error_code::MASTER_FATAL_READING_BINLOG, &message);
                self.state = SlaveState::Errored;
                return Ok(());
            }
        };

        // Never leave a replica staring at a file with no events.
        let active = self.router.binlog_name();
        while start_file != active
            && file::is_empty_binlog(&settings.binlog_dir.join(&start_file))
        {
            match file::next_file_name(&start_file) {
                Some(next) => {
                    tracing::debug!(skipped = start_file, "skipping empty binlog file");
                    start_file = next;
                    start_pos = BINLOG_HEADER_LEN;
                }
                None => break,
            }
        }

        self.seqno = 1;

        // Fake rotate naming the chosen file, then the on-disk FDE with a
        // zeroed timestamp and recomputed CRC.
        let rotate = build_fake_rotate(settings.server_id, &start_file, start_pos);
        let framed = frame_event(&rotate, &mut self.seqno);
        self.reply(dcb, framed);

        let path = settings.binlog_dir.join(&start_file);
        let mut reader = BinlogReader::open(&path, BINLOG_HEADER_LEN, settings.encryption_setup)?;
        match reader.read_event()? {
            Some(mut fde) if fde.header.event_type == event_type::FORMAT_DESCRIPTION_EVENT => {
                fde.data[0..4].copy_from_slice(&0u32.to_le_bytes());
                protocol::restamp_event_crc(&mut fde.data);
                let framed = frame_event(&fde.data, &mut self.seqno);
                self.reply(dcb, framed);
            }
            _ => {
                self.reply_error(
                    dcb,
                    1,
                    error_code::MASTER_FATAL_READING_BINLOG,
                    &format!("{} has no format description event", start_file),
                );
                self.state = SlaveState::Errored;
                return Ok(());
            }
        }

        // A replica joining past the Start-Encryption event still needs
        // its file context; reading forward to the start position picks
        // it up.
        if settings.encryption_setup.is_some() {
            while reader.position() < start_pos {
                match reader.read_event()? {
                    Some(event)
                        if event.header.event_type
                            == event_type::MARIADB_START_ENCRYPTION_EVENT =>
                    {
                        break;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }

        // Optional GTID list so GTID replicas know the starting state.
        if settings.mariadb10_master_gtid && self.requested_gtid.is_some() {
            let gtids: Vec<Gtid> = self
                .router
                .gtid_store
                .current_pos()
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.is_empty())
                .filter_map(|s| Gtid::parse(s).ok())
                .collect();
            let list = build_fake_gtid_list(settings.server_id, &gtids, start_pos as u32);
            let framed = frame_event(&list, &mut self.seqno);
            self.reply(dcb, framed);
        }

        reader.seek_to(start_pos);
        self.reader = Some(reader);

        let info = SlaveInfo::new(self.remote.clone(), self.server_id, self.hostname.clone());
        info.set_state(SlaveState::Dumping);
        info.set_position(start_file.clone(), start_pos);
        self.router.add_slave(info.clone());
        self.info = Some(info);
        self.state = SlaveState::Dumping;

        tracing::info!(
            server_id = self.server_id,
            file = start_file,
            position = start_pos,
            "replica dump started"
        );

        // First burst right away; the low-water callback keeps it going.
        self.catchup(dcb)
    }

    /// Choose the starting (file, position) for a dump request
    fn resolve_start(
        &mut self,
        requested_file: String,
        requested_pos: u64,
    ) -> std::result::Result<(String, u64), String> {
        let settings = &self.router.settings;

        if let Some(gtid_text) = self.requested_gtid.clone().filter(|g| !g.is_empty()) {
            // Resolve through the GTID index; one registered GTID is
            // enough to place the replica.
            for part in gtid_text.split(',') {
                let Ok(gtid) = Gtid::parse(part) else {
                    continue;
                };
                match self.router.gtid_store.lookup(gtid) {
                    Ok(Some(position)) => {
                        return Ok((position.binlog_file, position.end_pos));
                    }
                    Ok(None) => {}
                    Err(e) => return Err(e.to_string()),
                }
            }
            if settings.master_strict_gtid {
                return Err(format!(
                    "requested GTID '{}' is not in the binlog index",
                    gtid_text
                ));
            }
            // Lenient mode falls back to the live stream.
            let positions = self.router.positions();
            return Ok((self.router.binlog_name(), positions.current_safe_event.max(4)));
        }

        if requested_file.is_empty() {
            let positions = self.router.positions();
            return Ok((self.router.binlog_name(), positions.current_safe_event.max(4)));
        }
        Ok((requested_file, requested_pos.max(BINLOG_HEADER_LEN)))
    }

    // ------------------------------------------------------------------
    // Catch-up
    // ------------------------------------------------------------------

    /// Send up to a burst of events from the on-disk files. Returns with
    /// more work pending when the burst or the watermark cuts it short;
    /// the next nudge or low-water callback resumes it.
    fn catchup(&mut self, dcb: &mut Dcb) -> Result<()> {
        let settings = self.router.settings.clone();
        let Some(info) = self.info.clone() else {
            return Ok(());
        };
        let sender = dcb.owner().unwrap_or(usize::MAX);

        let mut events_sent: u32 = 0;
        let mut bytes_sent: u64 = 0;

        loop {
            if events_sent >= settings.burst || bytes_sent >= settings.burst_size {
                // Burst exhausted. The wakeup goes through the worker's
                // command queue so other connections get their turn
                // before the next burst.
                self.remote.trigger_write_event();
                break;
            }
            if dcb.high_water_reached() {
                // The watermark callback resumes us after the drain.
                break;
            }

            let active = self.router.binlog_name();
            let positions = self.router.positions();

            // Read one event with the reader borrow contained, so the
            // send path below can use the handler freely.
            let (reader_file, read_result) = {
                let reader = self.reader.as_mut().expect("catchup without reader");
                let reader_file = reader
                    .path()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                // In the active file, stop at the last safe position so
                // open transactions stay invisible.
                if reader_file == active && reader.position() >= positions.binlog_position {
                    break;
                }
                match reader.read_event()? {
                    Some(event) => {
                        let after = reader.position();
                        (reader_file, Some((event, after)))
                    }
                    None => (reader_file, None),
                }
            };

            match read_result {
                Some((event, position_after)) => {
                    let header = event.header;
                    let offset = event.offset;

                    // Consumed but never forwarded.
                    if header.event_type == event_type::MARIADB_START_ENCRYPTION_EVENT
                        || header.event_type == event_type::IGNORABLE_EVENT
                        || header.flags & LOG_EVENT_IGNORABLE_F != 0
                    {
                        continue;
                    }

                    if !info.check_and_mark_sent(&reader_file, offset, sender) {
                        continue;
                    }

                    let framed = frame_event(&event.data, &mut self.seqno);
                    bytes_sent += framed.len() as u64;
                    events_sent += 1;
                    self.reply(dcb, framed);
                    info.set_position(reader_file.clone(), position_after);
                    info.touch();

                    if header.event_type == event_type::ROTATE_EVENT
                        && header.flags & LOG_EVENT_ARTIFICIAL_F == 0
                    {
                        // The stored rotate closes this file; follow it.
                        self.open_next_file(&reader_file)?;
                    }
                }
                None => {
                    if reader_file != active {
                        // Mid-sequence end of file without a stored
                        // rotate; synthesise one.
                        let next = file::next_file_name(&reader_file).ok_or_else(|| {
                            Error::Binlog(format!("no successor for {}", reader_file))
                        })?;
                        let rotate = build_fake_rotate(
                            settings.server_id,
                            &next,
                            BINLOG_HEADER_LEN,
                        );
                        let framed = frame_event(&rotate, &mut self.seqno);
                        self.reply(dcb, framed);
                        self.open_next_file(&reader_file)?;
                    } else {
                        // Fully caught up; wait for master-side notify.
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn open_next_file(&mut self, current: &str) -> Result<()> {
        let next = file::next_file_name(current)
            .ok_or_else(|| Error::Binlog(format!("no successor for {}", current)))?;
        let path = self.router.settings.binlog_dir.join(&next);
        let reader = BinlogReader::open(
            &path,
            BINLOG_HEADER_LEN,
            self.router.settings.encryption_setup,
        )?;
        tracing::debug!(from = current, to = next, "replica reader rotated");
        self.reader = Some(reader);
        if let Some(info) = &self.info {
            info.set_position(next, BINLOG_HEADER_LEN);
        }
        Ok(())
    }

    fn send_heartbeat(&mut self, dcb: &mut Dcb) {
        let (file, _) = self
            .info
            .as_ref()
            .map(|i| i.position())
            .unwrap_or_default();
        let positions = self.router.positions();
        let heartbeat =
            build_heartbeat_event(self.router.settings.server_id, &file, positions.binlog_position);
        let framed = frame_event(&heartbeat, &mut self.seqno);
        self.reply(dcb, framed);
        if let Some(info) = &self.info {
            info.touch();
        }
        tracing::debug!(server_id = self.server_id, "heartbeat sent to replica");
    }

    // ------------------------------------------------------------------
    // Admin statements
    // ------------------------------------------------------------------

    fn admin_statement(&mut self, dcb: &mut Dcb, query: &str) -> Result<()> {
        let trimmed = query.trim().trim_end_matches(';').trim();
        let upper = trimmed.to_uppercase();
        let normalized = upper.split_whitespace().collect::<Vec<_>>().join(" ");

        match normalized.as_str() {
            "SELECT 1" => {
                self.replay_saved(dcb, saved_response::SELECT1, "1", "1");
            }
            "SELECT VERSION()" => {
                self.replay_saved(dcb, saved_response::VERSION, "10.5.0-wolfrelay", "VERSION()");
            }
            "SELECT @@VERSION_COMMENT LIMIT 1" | "SELECT @@VERSION_COMMENT" => {
                self.replay_saved(
                    dcb,
                    saved_response::VERSION_COMMENT,
                    "binlog relay",
                    "@@version_comment",
                );
            }
            "SELECT @@HOSTNAME" => {
                self.replay_saved(dcb, saved_response::HOSTNAME, "wolfrelay", "@@hostname");
            }
            "SELECT @@MAX_ALLOWED_PACKET" => {
                self.replay_saved(
                    dcb,
                    saved_response::MAX_PACKET,
                    "16777216",
                    "@@max_allowed_packet",
                );
            }
            "SELECT @@SERVER_ID" => {
                self.replay_saved(
                    dcb,
                    saved_response::SERVER_ID,
                    &self.router.settings.server_id.to_string(),
                    "@@server_id",
                );
            }
            "SELECT @@GTID_CURRENT_POS" | "SELECT @@GLOBAL.GTID_CURRENT_POS" => {
                let pos = self.router.gtid_store.current_pos().unwrap_or_default();
                let body = build_resultset(&["@@gtid_current_pos"], &[vec![pos]], 1);
                self.reply(dcb, body);
            }
            "SELECT @MASTER_BINLOG_CHECKSUM" | "SELECT @@GLOBAL.BINLOG_CHECKSUM" => {
                self.replay_saved(
                    dcb,
                    saved_response::CHKSUM,
                    "CRC32",
                    "@@global.binlog_checksum",
                );
            }
            "SELECT @@GLOBAL.SERVER_ID" => {
                self.replay_saved(
                    dcb,
                    saved_response::SERVER_ID,
                    &self.router.settings.server_id.to_string(),
                    "@@global.server_id",
                );
            }
            "SELECT @@GLOBAL.GTID_MODE" => {
                self.replay_saved(dcb, saved_response::GTID_MODE, "ON", "@@global.gtid_mode");
            }
            "SELECT UNIX_TIMESTAMP()" => {
                let body = build_resultset(
                    &["UNIX_TIMESTAMP()"],
                    &[vec![epoch_now().to_string()]],
                    1,
                );
                self.reply(dcb, body);
            }
            "SHOW MASTER STATUS" => self.show_master_status(dcb),
            "SHOW SLAVE STATUS" => self.show_slave_status(dcb),
            "SHOW BINARY LOGS" => self.show_binary_logs(dcb)?,
            "STOP SLAVE" => self.stop_slave(dcb),
            "START SLAVE" => self.start_slave(dcb),
            "RESET SLAVE" => self.reset_slave(dcb),
            _ => {
                if normalized.starts_with("CHANGE MASTER") {
                    self.change_master(dcb, trimmed)?;
                } else if normalized.starts_with("PURGE BINARY LOGS TO") {
                    self.purge_binary_logs(dcb, trimmed)?;
                } else if normalized.starts_with("SET @SLAVE_CONNECT_STATE") {
                    self.requested_gtid = trimmed
                        .split_once('=')
                        .map(|(_, v)| v.trim().trim_matches('\'').to_string());
                    self.reply_ok(dcb, 1);
                } else if normalized.starts_with("SET @MARIADB_SLAVE_CAPABILITY") {
                    self.mariadb10_capable = true;
                    self.reply_ok(dcb, 1);
                } else if normalized.starts_with("SET @MASTER_HEARTBEAT_PERIOD")
                    || normalized.starts_with("SET @MASTER_BINLOG_CHECKSUM")
                    || normalized.starts_with("SET @SLAVE_UUID")
                    || normalized.starts_with("SET @SLAVE_GTID_STRICT_MODE")
                    || normalized.starts_with("SET @SLAVE_GTID_IGNORE_DUPLICATES")
                    || normalized.starts_with("SET NAMES")
                {
                    self.reply_ok(dcb, 1);
                } else if normalized.starts_with("SHOW VARIABLES LIKE 'SERVER_ID'") {
                    self.replay_saved(
                        dcb,
                        saved_response::SERVER_ID,
                        &self.router.settings.server_id.to_string(),
                        "Value",
                    );
                } else if normalized.starts_with("SHOW VARIABLES LIKE 'SERVER_UUID'") {
                    self.replay_saved(dcb, saved_response::UUID, "", "Value");
                } else if normalized.starts_with("SET ") {
                    // Session settings a replica may push that the relay
                    // has no use for.
                    self.reply_ok(dcb, 1);
                } else {
                    self.reply_error(
                        dcb,
                        1,
                        error_code::PARSE_ERROR,
                        &format!("Unsupported statement: {}", trimmed),
                    );
                }
            }
        }
        Ok(())
    }

    fn show_master_status(&mut self, dcb: &mut Dcb) {
        let positions = self.router.positions();
        let body = build_resultset(
            &["File", "Position", "Binlog_Do_DB", "Binlog_Ignore_DB"],
            &[vec![
                self.router.binlog_name(),
                positions.binlog_position.to_string(),
                String::new(),
                String::new(),
            ]],
            1,
        );
        self.reply(dcb, body);
    }

    fn show_slave_status(&mut self, dcb: &mut Dcb) {
        let status = self.router.status();
        let config = self.router.master_config().unwrap_or_default();
        let positions = self.router.positions();
        let (errno, error) = status
            .error
            .clone()
            .map(|(code, message)| (code.to_string(), message))
            .unwrap_or_else(|| ("0".into(), String::new()));

        let io_running = match status.state {
            MasterState::BinlogDump => "Yes",
            MasterState::SlaveStopped | MasterState::Unconnected => "No",
            _ => "Connecting",
        };

        let body = build_resultset(
            &[
                "Slave_IO_State",
                "Master_Host",
                "Master_User",
                "Master_Port",
                "Master_Log_File",
                "Read_Master_Log_Pos",
                "Slave_IO_Running",
                "Slave_SQL_Running",
                "Exec_Master_Log_Pos",
                "Last_Errno",
                "Last_Error",
                "Slave_Heartbeat_Period",
                "Using_Gtid",
                "Gtid_IO_Pos",
            ],
            &[vec![
                status.state.name().to_string(),
                config.host.clone(),
                config.user.clone(),
                config.port.to_string(),
                self.router.binlog_name(),
                positions.current_pos.to_string(),
                io_running.to_string(),
                "Yes".to_string(),
                positions.binlog_position.to_string(),
                errno,
                error,
                self.router.settings.heartbeat_secs.to_string(),
                if self.router.settings.mariadb10_master_gtid {
                    "Slave_Pos".to_string()
                } else {
                    "No".to_string()
                },
                self.router.gtid_store.current_pos().unwrap_or_default(),
            ]],
            1,
        );
        self.reply(dcb, body);
    }

    fn show_binary_logs(&mut self, dcb: &mut Dcb) -> Result<()> {
        let dir = &self.router.settings.binlog_dir;
        let files = file::list_binlog_files(dir, &self.router.settings.fileroot)?;
        let rows: Vec<Vec<String>> = files
            .iter()
            .map(|name| {
                let size = std::fs::metadata(dir.join(name))
                    .map(|m| m.len())
                    .unwrap_or(0);
                vec![name.clone(), size.to_string()]
            })
            .collect();
        let body = build_resultset(&["Log_name", "File_size"], &rows, 1);
        self.reply(dcb, body);
        Ok(())
    }

    fn stop_slave(&mut self, dcb: &mut Dcb) {
        if self.router.state() == MasterState::SlaveStopped {
            self.reply_error(dcb, 1, error_code::SLAVE_MUST_STOP, "Slave is already stopped");
            return;
        }
        self.router.request_master_stop();
        tracing::info!("STOP SLAVE requested");
        self.reply_ok(dcb, 1);
    }

    fn start_slave(&mut self, dcb: &mut Dcb) {
        if self.router.master_config().is_none() {
            self.reply_error(
                dcb,
                1,
                error_code::MASTER_FATAL_READING_BINLOG,
                "No master configured; use CHANGE MASTER TO first",
            );
            return;
        }
        self.router.clear_error();
        self.router.request_master_start();
        tracing::info!("START SLAVE requested");
        self.reply_ok(dcb, 1);
    }

    fn reset_slave(&mut self, dcb: &mut Dcb) {
        match self.router.state() {
            MasterState::SlaveStopped | MasterState::Unconnected => {
                self.router.set_master_config(None);
                self.router.clear_error();
                self.reply_ok(dcb, 1);
                tracing::info!("RESET SLAVE: master configuration cleared");
            }
            _ => {
                self.reply_error(
                    dcb,
                    1,
                    error_code::SLAVE_MUST_STOP,
                    "This operation cannot be performed while the slave is running; run STOP SLAVE first",
                );
            }
        }
    }

    fn change_master(&mut self, dcb: &mut Dcb, statement: &str) -> Result<()> {
        // Only acceptable before any configuration or while stopped.
        let state = self.router.state();
        let configured = self.router.master_config().is_some();
        if configured && state != MasterState::SlaveStopped && state != MasterState::Unconnected {
            self.reply_error(
                dcb,
                1,
                error_code::SLAVE_MUST_STOP,
                "This operation cannot be performed while the slave is running; run STOP SLAVE first",
            );
            return Ok(());
        }

        let options = match parse_change_master(statement) {
            Ok(options) => options,
            Err(e) => {
                self.reply_error(dcb, 1, error_code::PARSE_ERROR, &e.to_string());
                return Ok(());
            }
        };

        let previous = self.router.master_config();
        let mut config = previous.clone().unwrap_or_default();
        if config.port == 0 {
            config.port = 3306;
        }

        for (key, value) in &options {
            match key.as_str() {
                "MASTER_HOST" => config.host = value.clone(),
                "MASTER_PORT" => match value.parse() {
                    Ok(port) => config.port = port,
                    Err(_) => {
                        self.reply_error(dcb, 1, error_code::PARSE_ERROR, "Bad MASTER_PORT");
                        return Ok(());
                    }
                },
                "MASTER_USER" => config.user = value.clone(),
                "MASTER_PASSWORD" => config.password = value.clone(),
                "MASTER_LOG_FILE" => config.binlog_file = value.clone(),
                "MASTER_LOG_POS" => match value.parse() {
                    Ok(pos) => config.binlog_pos = pos,
                    Err(_) => {
                        self.reply_error(dcb, 1, error_code::PARSE_ERROR, "Bad MASTER_LOG_POS");
                        return Ok(());
                    }
                },
                "MASTER_SSL" => config.ssl_enabled = value == "1",
                "MASTER_SSL_CA" => config.ssl_ca = Some(value.clone()),
                "MASTER_SSL_CERT" => config.ssl_cert = Some(value.clone()),
                "MASTER_SSL_KEY" => config.ssl_key = Some(value.clone()),
                "MASTER_TLS_VERSION" => config.ssl_version = Some(value.clone()),
                "MASTER_USE_GTID" => {}
                other => {
                    self.reply_error(
                        dcb,
                        1,
                        error_code::PARSE_ERROR,
                        &format!("Unsupported CHANGE MASTER TO option {}", other),
                    );
                    return Ok(());
                }
            }
        }

        if config.host.is_empty() {
            self.reply_error(dcb, 1, error_code::PARSE_ERROR, "MASTER_HOST is required");
            return Ok(());
        }

        // The requested position must be the current safe position, or 4
        // when moving to the start of a (next) file.
        if options.contains_key("MASTER_LOG_POS") {
            let positions = self.router.positions();
            let pos = config.binlog_pos;
            if pos != positions.binlog_position && pos != 4 {
                self.reply_error(
                    dcb,
                    1,
                    error_code::MASTER_FATAL_READING_BINLOG,
                    &format!(
                        "MASTER_LOG_POS must be 4 or the current position {}",
                        positions.binlog_position
                    ),
                );
                return Ok(());
            }
        }
        if config.binlog_file.is_empty() {
            config.binlog_file = self.router.binlog_name();
            config.binlog_pos = self.router.positions().binlog_position;
        }

        // Swap in the new configuration, persisting it; a failed persist
        // restores the previous configuration untouched.
        self.router.set_master_config(Some(config.clone()));
        if let Err(e) = config.save(&self.router.settings.binlog_dir) {
            self.router.set_master_config(previous);
            self.reply_error(
                dcb,
                1,
                error_code::UNKNOWN,
                &format!("Failed to persist master.ini: {}", e),
            );
            return Ok(());
        }

        tracing::info!(
            host = config.host,
            port = config.port,
            file = config.binlog_file,
            position = config.binlog_pos,
            "CHANGE MASTER TO applied"
        );
        self.reply_ok(dcb, 1);
        Ok(())
    }

    fn purge_binary_logs(&mut self, dcb: &mut Dcb, statement: &str) -> Result<()> {
        let target = statement
            .rsplit_once("TO")
            .map(|(_, v)| v.trim().trim_matches('\'').to_string())
            .unwrap_or_default();
        let Some(limit) = file::parse_sequence(&target) else {
            self.reply_error(dcb, 1, error_code::PARSE_ERROR, "Bad PURGE BINARY LOGS TO target");
            return Ok(());
        };

        let dir = self.router.settings.binlog_dir.clone();
        let files = file::list_binlog_files(&dir, &self.router.settings.fileroot)?;
        let mut purged = 0u64;
        for name in files {
            let Some(seq) = file::parse_sequence(&name) else {
                continue;
            };
            if seq < limit {
                std::fs::remove_file(dir.join(&name))?;
                self.router.gtid_store.purge_file(&name)?;
                purged += 1;
            }
        }
        tracing::info!(purged, to = target, "binary logs purged");
        self.reply_ok(dcb, 1);
        Ok(())
    }
}

/// Rewrite packet sequence numbers of a cached multi-packet response so
/// it follows the current exchange.
fn renumber_packets(response: &mut [u8]) {
    let mut at = 0usize;
    let mut seq = 1u8;
    while at + 4 <= response.len() {
        let len = (response[at] as usize)
            | ((response[at + 1] as usize) << 8)
            | ((response[at + 2] as usize) << 16);
        response[at + 3] = seq;
        seq = seq.wrapping_add(1);
        at += 4 + len;
    }
}

impl DcbHandler for SlaveHandler {
    fn ready_for_reading(&mut self, dcb: &mut Dcb) -> Result<()> {
        let Some(buf) = dcb.read(0, 0)? else {
            return Ok(());
        };
        self.pending.extend_from_slice(&buf.to_vec());

        // Dispatch every complete packet; keep the tail for later.
        loop {
            match MySqlPacket::read(&self.pending) {
                Ok((packet, consumed)) => {
                    self.pending.drain(..consumed);
                    self.handle_packet(dcb, packet)?;
                    if !dcb.is_open() {
                        return Ok(());
                    }
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn write_ready(&mut self, dcb: &mut Dcb) -> Result<()> {
        dcb.writeq_drain()?;
        if self.state == SlaveState::Dumping {
            if let Some(info) = self.info.clone() {
                if info.take_heartbeat_due() {
                    self.send_heartbeat(dcb);
                }
            }
            if !dcb.high_water_reached() {
                self.catchup(dcb)?;
            }
        }
        Ok(())
    }

    fn hangup(&mut self, dcb: &mut Dcb) -> Result<()> {
        tracing::info!(server_id = self.server_id, "replica disconnected");
        dcb.close();
        Ok(())
    }

    fn finish_connection(&mut self, _dcb: &mut Dcb) {
        if let Some(info) = &self.info {
            info.set_state(SlaveState::Errored);
            self.router.remove_slave(info.server_id());
        }
    }
}

/// Accept loop for replica connections
pub async fn run_listener(
    router: Arc<Router>,
    pool: Arc<WorkerPool>,
    bind_address: String,
    limits: DcbLimits,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "binlog listener ready for replicas");

    loop {
        let (socket, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => break,
        };
        tracing::info!(peer = %addr, "replica connection accepted");

        let worker = pool.least_loaded();
        let mut dcb = Dcb::new(DcbRole::Client, socket, limits.clone());
        let uid = dcb.uid();

        // Low-water resume: more catch-up as soon as the queue drains.
        let worker_for_cb = worker.clone();
        dcb.add_callback(
            CallbackReason::LowWater,
            Box::new(move |_| {
                worker_for_cb.post(crate::worker::WorkerCommand::FakeEvent {
                    uid,
                    mask: crate::dcb::event::WRITE,
                });
            }),
        );

        // The handler needs its own remote before registration.
        let remote = DcbRemote::for_registration(uid, worker.clone());
        let mut handler = SlaveHandler::new(router.clone(), remote);
        handler.send_handshake(&mut dcb);
        worker.register_dcb(dcb, Box::new(handler));
    }
    Ok(())
}

/// Periodic heartbeat task: nudges idle replicas so their connections do
/// not look dead during quiet spells.
pub async fn run_slave_heartbeat(router: Arc<Router>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(router.settings.heartbeat_secs.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = shutdown.changed() => break,
        }
        if !router.settings.send_slave_heartbeat {
            continue;
        }
        for slave in router.slaves() {
            if slave.state() == SlaveState::Dumping
                && slave.seconds_idle() >= period.as_secs()
            {
                slave.request_heartbeat();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_rotate_layout() {
        let event = build_fake_rotate(1001, "bin.000007", 4);
        let header = RepHeader::parse(&event).unwrap();
        assert_eq!(header.event_type, event_type::ROTATE_EVENT);
        assert_eq!(header.flags & LOG_EVENT_ARTIFICIAL_F, LOG_EVENT_ARTIFICIAL_F);
        assert_eq!(header.next_pos, 0);

        let position = u64::from_le_bytes(
            event[EVENT_HEADER_LEN..EVENT_HEADER_LEN + 8].try_into().unwrap(),
        );
        assert_eq!(position, 4);
        let name = &event[EVENT_HEADER_LEN + 8..event.len() - 4];
        assert_eq!(name, b"bin.000007");
        assert!(protocol::verify_event_crc(&event));
    }

    #[test]
    fn test_fake_gtid_list_layout() {
        let gtids = vec![Gtid::new(0, 1, 100), Gtid::new(1, 2, 7)];
        let event = build_fake_gtid_list(1001, &gtids, 4);
        let header = RepHeader::parse(&event).unwrap();
        assert_eq!(header.event_type, event_type::MARIADB_GTID_LIST_EVENT);

        let body = &event[EVENT_HEADER_LEN..];
        let count = u32::from_le_bytes(body[0..4].try_into().unwrap());
        assert_eq!(count, 2);
        let domain = u32::from_le_bytes(body[4..8].try_into().unwrap());
        assert_eq!(domain, 0);
        let sequence = u64::from_le_bytes(body[12..20].try_into().unwrap());
        assert_eq!(sequence, 100);
    }

    #[test]
    fn test_heartbeat_event_layout() {
        let event = build_heartbeat_event(1001, "bin.000003", 4096);
        let header = RepHeader::parse(&event).unwrap();
        assert_eq!(header.event_type, event_type::HEARTBEAT_EVENT);
        assert_eq!(header.next_pos, 4096);
        assert_eq!(&event[EVENT_HEADER_LEN..event.len() - 4], b"bin.000003");
    }

    #[test]
    fn test_parse_change_master_basic() {
        let options = parse_change_master(
            "CHANGE MASTER TO MASTER_HOST='10.0.0.5', MASTER_PORT=3307, \
             MASTER_USER='repl', MASTER_PASSWORD='secret,with,commas', \
             MASTER_LOG_FILE='bin.000004', MASTER_LOG_POS=4",
        )
        .unwrap();
        assert_eq!(options.get("MASTER_HOST").unwrap(), "10.0.0.5");
        assert_eq!(options.get("MASTER_PORT").unwrap(), "3307");
        assert_eq!(options.get("MASTER_PASSWORD").unwrap(), "secret,with,commas");
        assert_eq!(options.get("MASTER_LOG_POS").unwrap(), "4");
    }

    #[test]
    fn test_parse_change_master_with_ssl() {
        let options = parse_change_master(
            "CHANGE MASTER TO MASTER_HOST='h', MASTER_SSL=1, \
             MASTER_SSL_CA='/ca.pem', MASTER_SSL_CERT='/c.pem', MASTER_SSL_KEY='/k.pem'",
        )
        .unwrap();
        assert_eq!(options.get("MASTER_SSL").unwrap(), "1");
        assert_eq!(options.get("MASTER_SSL_CA").unwrap(), "/ca.pem");
    }

    #[test]
    fn test_parse_change_master_rejects_garbage() {
        assert!(parse_change_master("SELECT 1").is_err());
        assert!(parse_change_master("CHANGE MASTER TO NONSENSE").is_err());
    }

    #[test]
    fn test_renumber_packets() {
        // Two packets: 2-byte and 1-byte payloads.
        let mut response = vec![2, 0, 0, 99, 0xaa, 0xbb, 1, 0, 0, 99, 0xcc];
        renumber_packets(&mut response);
        assert_eq!(response[3], 1);
        assert_eq!(response[9], 2);
    }

    #[test]
    fn test_split_top_level_respects_quotes() {
        let parts = split_top_level("A='x,y', B=2");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].trim(), "A='x,y'");
        assert_eq!(parts[1].trim(), "B=2");
    }
}
