//! MySQL Wire Protocol Implementation
//!
//! Handles parsing and building MySQL protocol packets, including the
//! replication stream framing used by the binlog router.

use std::io;

use byteorder::{ByteOrder, LittleEndian};

/// Maximum payload of one MySQL packet. An event payload of exactly this
/// size continues in the next packet; the sender terminates with an empty
/// packet when the split lands on the boundary.
pub const MAX_PACKET_LEN: usize = 0x00ff_ffff;

/// Size of the binlog event header inside the replication stream
pub const EVENT_HEADER_LEN: usize = 19;

/// MySQL command bytes
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_PING: u8 = 0x0e;
    pub const COM_BINLOG_DUMP: u8 = 0x12;
    pub const COM_REGISTER_SLAVE: u8 = 0x15;
}

/// MySQL server error codes the relay produces
pub mod error_code {
    /// ER_MASTER_FATAL_ERROR_READING_BINLOG
    pub const MASTER_FATAL_READING_BINLOG: u16 = 1236;
    /// ER_SLAVE_MUST_STOP
    pub const SLAVE_MUST_STOP: u16 = 1198;
    /// ER_PARSE_ERROR
    pub const PARSE_ERROR: u16 = 1064;
    /// ER_UNKNOWN_COM_ERROR
    pub const UNKNOWN_COM: u16 = 1047;
    /// ER_UNKNOWN_ERROR
    pub const UNKNOWN: u16 = 1105;
}

/// Binlog event type codes (MariaDB/MySQL)
#[allow(dead_code)]
pub mod event_type {
    pub const UNKNOWN_EVENT: u8 = 0;
    pub const START_EVENT_V3: u8 = 1;
    pub const QUERY_EVENT: u8 = 2;
    pub const STOP_EVENT: u8 = 3;
    pub const ROTATE_EVENT: u8 = 4;
    pub const INTVAR_EVENT: u8 = 5;
    pub const RAND_EVENT: u8 = 13;
    pub const USER_VAR_EVENT: u8 = 14;
    pub const FORMAT_DESCRIPTION_EVENT: u8 = 15;
    pub const XID_EVENT: u8 = 16;
    pub const TABLE_MAP_EVENT: u8 = 19;
    pub const WRITE_ROWS_EVENT_V1: u8 = 23;
    pub const UPDATE_ROWS_EVENT_V1: u8 = 24;
    pub const DELETE_ROWS_EVENT_V1: u8 = 25;
    pub const HEARTBEAT_EVENT: u8 = 27;
    pub const IGNORABLE_EVENT: u8 = 28;
    pub const WRITE_ROWS_EVENT: u8 = 30;
    pub const UPDATE_ROWS_EVENT: u8 = 31;
    pub const DELETE_ROWS_EVENT: u8 = 32;
    pub const GTID_LOG_EVENT: u8 = 33;

    // MariaDB specific
    pub const MARIADB_ANNOTATE_ROWS_EVENT: u8 = 160;
    pub const MARIADB_BINLOG_CHECKPOINT_EVENT: u8 = 161;
    pub const MARIADB_GTID_EVENT: u8 = 162;
    pub const MARIADB_GTID_LIST_EVENT: u8 = 163;
    pub const MARIADB_START_ENCRYPTION_EVENT: u8 = 164;

    /// Highest event type the relay accepts from a MariaDB 10 master
    pub const MAX_EVENT_TYPE_MARIADB10: u8 = MARIADB_START_ENCRYPTION_EVENT;
}

/// MariaDB GTID event flags
pub mod gtid_flags {
    /// Transaction contains DDL
    pub const FL_DDL: u8 = 32;
    /// Single-statement transaction, no terminating COMMIT/XID
    pub const FL_STANDALONE: u8 = 1;
}

/// LOG_EVENT_IGNORABLE_F: unknown events carrying this flag are skipped
pub const LOG_EVENT_IGNORABLE_F: u16 = 0x0080;

/// Semi-sync indicator byte preceding an event payload when negotiated
pub const SEMI_SYNC_INDICATOR: u8 = 0xef;
/// Semi-sync flag requesting an ACK for this event
pub const SEMI_SYNC_ACK_REQ: u8 = 0x01;

/// MySQL packet types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PacketType {
    /// COM_QUIT (0x01)
    Quit,
    /// COM_QUERY (0x03)
    Query,
    /// COM_PING (0x0e)
    Ping,
    /// COM_BINLOG_DUMP (0x12)
    BinlogDump,
    /// COM_REGISTER_SLAVE (0x15)
    RegisterSlave,
    /// Unknown command
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(cmd: u8) -> Self {
        match cmd {
            command::COM_QUIT => PacketType::Quit,
            command::COM_QUERY => PacketType::Query,
            command::COM_PING => PacketType::Ping,
            command::COM_BINLOG_DUMP => PacketType::BinlogDump,
            command::COM_REGISTER_SLAVE => PacketType::RegisterSlave,
            _ => PacketType::Unknown(cmd),
        }
    }
}

/// MySQL packet header (4 bytes)
#[derive(Debug, Clone)]
pub struct PacketHeader {
    /// Payload length (3 bytes)
    pub length: u32,
    /// Sequence ID (1 byte)
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn read(data: &[u8]) -> io::Result<Self> {
        if data.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Not enough data for header",
            ));
        }

        let length = (data[0] as u32) | ((data[1] as u32) << 8) | ((data[2] as u32) << 16);
        let sequence_id = data[3];

        Ok(Self { length, sequence_id })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push((self.length & 0xff) as u8);
        buf.push(((self.length >> 8) & 0xff) as u8);
        buf.push(((self.length >> 16) & 0xff) as u8);
        buf.push(self.sequence_id);
    }
}

/// MySQL packet
#[derive(Debug, Clone)]
pub struct MySqlPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl MySqlPacket {
    /// Create a new packet
    pub fn new(sequence_id: u8, payload: Vec<u8>) -> Self {
        Self {
            header: PacketHeader {
                length: payload.len() as u32,
                sequence_id,
            },
            payload,
        }
    }

    /// Read a packet from a buffer, returning the packet and bytes consumed
    pub fn read(data: &[u8]) -> io::Result<(Self, usize)> {
        let header = PacketHeader::read(data)?;
        let total_len = 4 + header.length as usize;

        if data.len() < total_len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Not enough data for packet",
            ));
        }

        let payload = data[4..total_len].to_vec();

        Ok((Self { header, payload }, total_len))
    }

    /// Write packet to buffer
    pub fn write(&self, buf: &mut Vec<u8>) {
        self.header.write(buf);
        buf.extend_from_slice(&self.payload);
    }

    /// Serialize into a fresh byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        self.write(&mut buf);
        buf
    }

    /// Get command type (first byte of payload for command packets)
    pub fn command(&self) -> Option<PacketType> {
        self.payload.first().map(|&b| PacketType::from(b))
    }

    /// Get query string (for COM_QUERY packets)
    pub fn query_string(&self) -> Option<String> {
        if self.payload.len() > 1 && self.payload[0] == command::COM_QUERY {
            String::from_utf8(self.payload[1..].to_vec()).ok()
        } else {
            None
        }
    }

    /// True when the payload is an OK response
    pub fn is_ok(&self) -> bool {
        self.payload.first() == Some(&0x00)
    }

    /// True when the payload is an ERR response
    pub fn is_err(&self) -> bool {
        self.payload.first() == Some(&0xff)
    }

    /// True when the payload is an EOF marker
    pub fn is_eof(&self) -> bool {
        self.payload.first() == Some(&0xfe) && self.payload.len() < 9
    }

    /// Extract the error code and message from an ERR payload
    pub fn error(&self) -> Option<(u16, String)> {
        if !self.is_err() || self.payload.len() < 3 {
            return None;
        }
        let code = u16::from_le_bytes([self.payload[1], self.payload[2]]);
        // Skip the '#' + 5-byte SQL state marker when present
        let msg_start = if self.payload.get(3) == Some(&b'#') && self.payload.len() >= 9 {
            9
        } else {
            3
        };
        let message = String::from_utf8_lossy(&self.payload[msg_start..]).into_owned();
        Some((code, message))
    }
}

/// Fixed replication event header, common to every binlog event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepHeader {
    /// Event creation time (epoch seconds)
    pub timestamp: u32,
    /// Event type code
    pub event_type: u8,
    /// Originating server id
    pub server_id: u32,
    /// Total event size including this header
    pub event_size: u32,
    /// Offset of the next event in the binlog file
    pub next_pos: u32,
    /// Event flags
    pub flags: u16,
}

impl RepHeader {
    /// Parse a header from the first 19 bytes of an event body
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        if data.len() < EVENT_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Not enough data for event header",
            ));
        }
        Ok(Self {
            timestamp: LittleEndian::read_u32(&data[0..4]),
            event_type: data[4],
            server_id: LittleEndian::read_u32(&data[5..9]),
            event_size: LittleEndian::read_u32(&data[9..13]),
            next_pos: LittleEndian::read_u32(&data[13..17]),
            flags: LittleEndian::read_u16(&data[17..19]),
        })
    }

    /// Write this header over the first 19 bytes of an event body
    pub fn write(&self, data: &mut [u8]) {
        LittleEndian::write_u32(&mut data[0..4], self.timestamp);
        data[4] = self.event_type;
        LittleEndian::write_u32(&mut data[5..9], self.server_id);
        LittleEndian::write_u32(&mut data[9..13], self.event_size);
        LittleEndian::write_u32(&mut data[13..17], self.next_pos);
        LittleEndian::write_u16(&mut data[17..19], self.flags);
    }
}

/// Recompute and store the trailing CRC32 of an event body
pub fn restamp_event_crc(event: &mut [u8]) {
    let body_len = event.len() - 4;
    let crc = crc32fast::hash(&event[..body_len]);
    event[body_len..].copy_from_slice(&crc.to_le_bytes());
}

/// Verify the trailing CRC32 of an event body
pub fn verify_event_crc(event: &[u8]) -> bool {
    if event.len() < 4 {
        return false;
    }
    let body_len = event.len() - 4;
    let stored = u32::from_le_bytes([
        event[body_len],
        event[body_len + 1],
        event[body_len + 2],
        event[body_len + 3],
    ]);
    crc32fast::hash(&event[..body_len]) == stored
}

/// Build an OK packet
pub fn build_ok_packet(sequence_id: u8, affected_rows: u64, last_insert_id: u64) -> MySqlPacket {
    let mut payload = Vec::new();
    payload.push(0x00); // OK header
    write_lenenc_int(&mut payload, affected_rows);
    write_lenenc_int(&mut payload, last_insert_id);
    payload.push(0x02); // status flags (2 bytes): autocommit
    payload.push(0x00);
    payload.push(0x00); // warnings (2 bytes)
    payload.push(0x00);

    MySqlPacket::new(sequence_id, payload)
}

/// Build an error packet
pub fn build_error_packet(
    sequence_id: u8,
    error_code: u16,
    sql_state: &str,
    message: &str,
) -> MySqlPacket {
    let mut payload = Vec::new();
    payload.push(0xff); // Error header
    payload.push((error_code & 0xff) as u8);
    payload.push(((error_code >> 8) & 0xff) as u8);
    payload.push(b'#'); // SQL state marker
    payload.extend_from_slice(sql_state.as_bytes());
    payload.extend_from_slice(message.as_bytes());

    MySqlPacket::new(sequence_id, payload)
}

/// Build an EOF packet
pub fn build_eof_packet(sequence_id: u8) -> MySqlPacket {
    MySqlPacket::new(sequence_id, vec![0xfe, 0x00, 0x00, 0x02, 0x00])
}

/// Build initial handshake packet (server -> client)
pub fn build_handshake_packet(server_version: &str, scramble: &[u8; 20]) -> MySqlPacket {
    let mut payload = Vec::new();

    // Protocol version
    payload.push(10);

    // Server version (null-terminated)
    payload.extend_from_slice(server_version.as_bytes());
    payload.push(0);

    // Connection ID (4 bytes)
    payload.extend_from_slice(&[1, 0, 0, 0]);

    // Auth plugin data part 1 (8 bytes)
    payload.extend_from_slice(&scramble[..8]);

    // Filler
    payload.push(0);

    // Capability flags lower 2 bytes
    let capabilities: u32 = 0x0000_a20f;
    payload.push((capabilities & 0xff) as u8);
    payload.push(((capabilities >> 8) & 0xff) as u8);

    // Character set (utf8mb4)
    payload.push(45);

    // Status flags
    payload.push(0x02);
    payload.push(0x00);

    // Capability flags upper 2 bytes
    payload.push(((capabilities >> 16) & 0xff) as u8);
    payload.push(((capabilities >> 24) & 0xff) as u8);

    // Auth plugin data length
    payload.push(21);

    // Reserved (10 bytes)
    payload.extend_from_slice(&[0u8; 10]);

    // Auth plugin data part 2 (12 bytes + null)
    payload.extend_from_slice(&scramble[8..]);
    payload.push(0);

    // Auth plugin name
    payload.extend_from_slice(b"mysql_native_password");
    payload.push(0);

    MySqlPacket::new(0, payload)
}

/// Build a COM_QUERY packet
pub fn build_query_packet(query: &str) -> MySqlPacket {
    let mut payload = Vec::with_capacity(query.len() + 1);
    payload.push(command::COM_QUERY);
    payload.extend_from_slice(query.as_bytes());
    MySqlPacket::new(0, payload)
}

/// mysql_native_password scramble:
/// SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
pub fn scramble_password(password: &str, seed: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};

    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1 = hasher.finalize_reset();

    hasher.update(stage1);
    let stage2 = hasher.finalize_reset();

    hasher.update(seed);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Frame one binlog event into MySQL packets for the replication stream.
///
/// The first packet carries the OK byte before the event body; continuation
/// packets carry raw payload. A packet of exactly `MAX_PACKET_LEN` bytes is
/// followed by the next packet, empty if nothing remains.
pub fn frame_event(event: &[u8], seqno: &mut u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(event.len() + 16);
    let mut remaining = event;
    let mut first = true;

    loop {
        // First packet holds the OK byte plus payload.
        let budget = if first { MAX_PACKET_LEN - 1 } else { MAX_PACKET_LEN };
        let take = remaining.len().min(budget);
        let payload_len = take + usize::from(first);

        out.push((payload_len & 0xff) as u8);
        out.push(((payload_len >> 8) & 0xff) as u8);
        out.push(((payload_len >> 16) & 0xff) as u8);
        out.push(*seqno);
        *seqno = seqno.wrapping_add(1);
        if first {
            out.push(0x00);
        }
        out.extend_from_slice(&remaining[..take]);
        remaining = &remaining[take..];

        if payload_len < MAX_PACKET_LEN {
            break;
        }
        first = false;
        // A maximal packet demands a follow-up even when empty.
        if remaining.is_empty() {
            out.push(0);
            out.push(0);
            out.push(0);
            out.push(*seqno);
            *seqno = seqno.wrapping_add(1);
            break;
        }
    }
    out
}

/// Write a length-encoded integer
pub fn write_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 251 {
        buf.push(value as u8);
    } else if value < 65536 {
        buf.push(0xfc);
        buf.push((value & 0xff) as u8);
        buf.push(((value >> 8) & 0xff) as u8);
    } else if value < 16777216 {
        buf.push(0xfd);
        buf.push((value & 0xff) as u8);
        buf.push(((value >> 8) & 0xff) as u8);
        buf.push(((value >> 16) & 0xff) as u8);
    } else {
        buf.push(0xfe);
        for i in 0..8 {
            buf.push(((value >> (i * 8)) & 0xff) as u8);
        }
    }
}

/// Write a length-encoded string
pub fn write_lenenc_str(buf: &mut Vec<u8>, value: &str) {
    write_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

/// Build a single-column text resultset (column header, row, EOF)
pub fn build_single_value_resultset(column: &str, value: &str, seqno_start: u8) -> Vec<u8> {
    build_resultset(&[column], &[vec![value.to_string()]], seqno_start)
}

/// Build a text-protocol resultset from column names and string rows
pub fn build_resultset(columns: &[&str], rows: &[Vec<String>], seqno_start: u8) -> Vec<u8> {
    let mut out = Vec::new();
    let mut seq = seqno_start;

    // Column count
    let mut payload = Vec::new();
    write_lenenc_int(&mut payload, columns.len() as u64);
    MySqlPacket::new(seq, payload).write(&mut out);
    seq = seq.wrapping_add(1);

    // Column definitions
    for column in columns {
        let mut def = Vec::new();
        write_lenenc_str(&mut def, "def"); // catalog
        write_lenenc_str(&mut def, ""); // schema
        write_lenenc_str(&mut def, ""); // table
        write_lenenc_str(&mut def, ""); // org_table
        write_lenenc_str(&mut def, column); // name
        write_lenenc_str(&mut def, column); // org_name
        def.push(0x0c); // fixed-length fields
        def.extend_from_slice(&33u16.to_le_bytes()); // charset utf8
        def.extend_from_slice(&255u32.to_le_bytes()); // column length
        def.push(0x0f); // type: VARCHAR
        def.extend_from_slice(&0u16.to_le_bytes()); // flags
        def.push(0); // decimals
        def.extend_from_slice(&0u16.to_le_bytes()); // filler
        MySqlPacket::new(seq, def).write(&mut out);
        seq = seq.wrapping_add(1);
    }

    // EOF after column definitions
    build_eof_packet(seq).write(&mut out);
    seq = seq.wrapping_add(1);

    // Rows
    for row in rows {
        let mut data = Vec::new();
        for value in row {
            write_lenenc_str(&mut data, value);
        }
        MySqlPacket::new(seq, data).write(&mut out);
        seq = seq.wrapping_add(1);
    }

    // Terminating EOF
    build_eof_packet(seq).write(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header() {
        let data = [0x05, 0x00, 0x00, 0x01]; // length=5, seq=1
        let header = PacketHeader::read(&data).unwrap();
        assert_eq!(header.length, 5);
        assert_eq!(header.sequence_id, 1);
    }

    #[test]
    fn test_rep_header_round_trip() {
        let header = RepHeader {
            timestamp: 1700000000,
            event_type: event_type::QUERY_EVENT,
            server_id: 12345,
            event_size: 87,
            next_pos: 1024,
            flags: 0x0001,
        };
        let mut buf = [0u8; EVENT_HEADER_LEN];
        header.write(&mut buf);
        assert_eq!(RepHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn test_error_packet_parse() {
        let packet = build_error_packet(1, error_code::MASTER_FATAL_READING_BINLOG, "HY000", "boom");
        let (code, message) = packet.error().unwrap();
        assert_eq!(code, 1236);
        assert_eq!(message, "boom");
    }

    #[test]
    fn test_event_crc_restamp_and_verify() {
        let mut event = vec![0u8; 40];
        event[4] = event_type::XID_EVENT;
        restamp_event_crc(&mut event);
        assert!(verify_event_crc(&event));
        event[0] ^= 0xff;
        assert!(!verify_event_crc(&event));
    }

    #[test]
    fn test_frame_small_event() {
        let event = vec![0xaa; 100];
        let mut seq = 1;
        let framed = frame_event(&event, &mut seq);
        // 4-byte header, OK byte, body
        assert_eq!(framed.len(), 4 + 1 + 100);
        assert_eq!(framed[3], 1); // seqno
        assert_eq!(framed[4], 0x00); // OK byte
        assert_eq!(seq, 2);
    }

    #[test]
    fn test_frame_event_spanning_two_packets() {
        // One byte more than fits in the first packet (with its OK byte)
        let event = vec![0x55; MAX_PACKET_LEN];
        let mut seq = 0;
        let framed = frame_event(&event, &mut seq);

        let first_len =
            (framed[0] as usize) | ((framed[1] as usize) << 8) | ((framed[2] as usize) << 16);
        assert_eq!(first_len, MAX_PACKET_LEN);
        let second_at = 4 + first_len;
        let second_len = (framed[second_at] as usize)
            | ((framed[second_at + 1] as usize) << 8)
            | ((framed[second_at + 2] as usize) << 16);
        assert_eq!(second_len, 1);
        assert_eq!(seq, 2);
    }

    #[test]
    fn test_frame_exact_boundary_appends_empty_packet() {
        // Payload exactly MAX_PACKET_LEN including the OK byte
        let event = vec![0x77; MAX_PACKET_LEN - 1];
        let mut seq = 0;
        let framed = frame_event(&event, &mut seq);

        let tail_at = framed.len() - 4;
        assert_eq!(&framed[tail_at..tail_at + 3], &[0, 0, 0]);
        assert_eq!(seq, 2);
    }

    #[test]
    fn test_scramble_password() {
        let seed = [0x41u8; 20];
        let scrambled = scramble_password("secret", &seed);
        assert_eq!(scrambled.len(), 20);
        // Empty passwords send no auth response.
        assert!(scramble_password("", &seed).is_empty());
    }

    #[test]
    fn test_lenenc_int_boundaries() {
        let mut buf = Vec::new();
        write_lenenc_int(&mut buf, 250);
        assert_eq!(buf, [250]);

        buf.clear();
        write_lenenc_int(&mut buf, 251);
        assert_eq!(buf, [0xfc, 251, 0]);

        buf.clear();
        write_lenenc_int(&mut buf, 70000);
        assert_eq!(buf, [0xfd, 0x70, 0x11, 0x01]);
    }
}
