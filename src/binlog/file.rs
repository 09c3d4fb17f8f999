//! Binlog Files
//!
//! On-disk binlog files follow the MySQL layout: a 4-byte magic, then a
//! Format Description event at offset 4, then the event stream. Files are
//! named `<fileroot>.NNNNNN`. The writer belongs to the master-side state
//! machine; catch-up readers open their own descriptors and use positional
//! reads, so the writer and any number of readers never contend.
//!
//! Four positions are tracked and deliberately kept distinct:
//! `last_written` (bytes flushed), `current_pos` (past the last appended
//! event, possibly inside an open transaction), `binlog_position` (end of
//! the last committed transaction, the safe resume point) and
//! `current_safe_event` (start of the latest event safe to stream).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::proxy::protocol::{event_type, RepHeader, EVENT_HEADER_LEN};

use super::encryption::{BinlogCipher, EncryptionContext, NONCE_LEN};

/// File magic at offset 0
pub const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e];

/// Offset of the first event in every binlog file
pub const BINLOG_HEADER_LEN: u64 = 4;

/// Compose a binlog file name from its stem and sequence number
pub fn binlog_name(fileroot: &str, sequence: u32) -> String {
    format!("{}.{:06}", fileroot, sequence)
}

/// Extract the sequence number from a binlog file name
pub fn parse_sequence(name: &str) -> Option<u32> {
    let (_, suffix) = name.rsplit_once('.')?;
    suffix.parse().ok()
}

/// Name of the file following `name` in the sequence
pub fn next_file_name(name: &str) -> Option<String> {
    let (stem, _) = name.rsplit_once('.')?;
    Some(binlog_name(stem, parse_sequence(name)? + 1))
}

/// All binlog files for a stem, in sequence order
pub fn list_binlog_files(dir: &Path, fileroot: &str) -> Result<Vec<String>> {
    let prefix = format!("{}.", fileroot);
    let mut files: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(&prefix) && parse_sequence(name).is_some())
        .collect();
    files.sort_by_key(|name| parse_sequence(name).unwrap_or(0));
    Ok(files)
}

/// A file that holds nothing beyond its magic
pub fn is_empty_binlog(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.len() <= BINLOG_HEADER_LEN)
        .unwrap_or(true)
}

/// One event read off a binlog file: the raw bytes with a parsed header
#[derive(Debug, Clone)]
pub struct BinlogEvent {
    pub header: RepHeader,
    /// Complete decrypted event: 19-byte header, payload, CRC
    pub data: Vec<u8>,
    /// File offset this event was read from
    pub offset: u64,
}

/// Build a synthetic Format Description event
pub fn build_format_description_event(server_id: u32, timestamp: u32) -> Vec<u8> {
    // binlog version, 50-byte server version, create time, header length,
    // post-header length table, checksum algorithm, CRC.
    const POST_HEADER_TABLE: usize = 39;
    let payload_len = 2 + 50 + 4 + 1 + POST_HEADER_TABLE + 1;
    let event_size = (EVENT_HEADER_LEN + payload_len + 4) as u32;
    let mut event = vec![0u8; event_size as usize];

    let header = RepHeader {
        timestamp,
        event_type: event_type::FORMAT_DESCRIPTION_EVENT,
        server_id,
        event_size,
        next_pos: BINLOG_HEADER_LEN as u32 + event_size,
        flags: 0,
    };
    header.write(&mut event);

    let body = &mut event[EVENT_HEADER_LEN..];
    body[0..2].copy_from_slice(&4u16.to_le_bytes());
    let version = b"10.5.0-wolfrelay";
    body[2..2 + version.len()].copy_from_slice(version);
    body[52..56].copy_from_slice(&timestamp.to_le_bytes());
    body[56] = EVENT_HEADER_LEN as u8;
    // Post-header table left zeroed; checksum algorithm byte: CRC32.
    body[57 + POST_HEADER_TABLE] = 1;
    crate::proxy::protocol::restamp_event_crc(&mut event);
    event
}

/// The four writer positions, snapshotted together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinlogPositions {
    pub last_written: u64,
    pub binlog_position: u64,
    pub current_pos: u64,
    pub current_safe_event: u64,
}

/// Appender for the active binlog file
pub struct BinlogWriter {
    dir: PathBuf,
    binlog_name: String,
    file: File,
    last_written: u64,
    binlog_position: u64,
    current_pos: u64,
    current_safe_event: u64,
    /// Cipher and key to use when encryption is on
    encryption_setup: Option<(BinlogCipher, [u8; 32])>,
    /// Context of the file being written, once established
    encryption: Option<EncryptionContext>,
    key_version: u32,
}

impl BinlogWriter {
    /// Resume the highest existing file, or create `<fileroot>.000001`
    pub fn create_or_resume(
        dir: &Path,
        fileroot: &str,
        encryption_setup: Option<(BinlogCipher, [u8; 32])>,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let existing = list_binlog_files(dir, fileroot)?;

        if let Some(name) = existing.last() {
            let path = dir.join(name);
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            let mut magic = [0u8; 4];
            file.read_exact(&mut magic)?;
            if magic != BINLOG_MAGIC {
                return Err(Error::Binlog(format!("{} has a bad magic", name)));
            }
            let len = file.seek(SeekFrom::End(0))?;

            let mut writer = Self {
                dir: dir.to_path_buf(),
                binlog_name: name.clone(),
                file,
                last_written: len,
                binlog_position: len,
                current_pos: len,
                current_safe_event: len,
                encryption_setup,
                encryption: None,
                key_version: 1,
            };
            writer.load_encryption_context(&path)?;
            tracing::info!(file = name, position = len, "resuming binlog file");
            Ok(writer)
        } else {
            let name = binlog_name(fileroot, 1);
            let file = create_binlog_file(&dir.join(&name))?;
            tracing::info!(file = name, "created initial binlog file");
            Ok(Self {
                dir: dir.to_path_buf(),
                binlog_name: name,
                file,
                last_written: BINLOG_HEADER_LEN,
                binlog_position: BINLOG_HEADER_LEN,
                current_pos: BINLOG_HEADER_LEN,
                current_safe_event: BINLOG_HEADER_LEN,
                encryption_setup,
                encryption: None,
                key_version: 1,
            })
        }
    }

    /// Pick up the Start-Encryption event of a resumed file, if any
    fn load_encryption_context(&mut self, path: &Path) -> Result<()> {
        let Some((cipher, key)) = self.encryption_setup else {
            return Ok(());
        };
        let mut reader = BinlogReader::open(path, BINLOG_HEADER_LEN, Some((cipher, key)))?;
        while let Some(event) = reader.read_event()? {
            if event.header.event_type == event_type::MARIADB_START_ENCRYPTION_EVENT {
                self.encryption = reader.take_encryption();
                return Ok(());
            }
            if event.header.event_type != event_type::FORMAT_DESCRIPTION_EVENT {
                break;
            }
        }
        Ok(())
    }

    pub fn binlog_name(&self) -> &str {
        &self.binlog_name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn positions(&self) -> BinlogPositions {
        BinlogPositions {
            last_written: self.last_written,
            binlog_position: self.binlog_position,
            current_pos: self.current_pos,
            current_safe_event: self.current_safe_event,
        }
    }

    pub fn encryption(&self) -> Option<&EncryptionContext> {
        self.encryption.as_ref()
    }

    /// Append one complete event (19-byte header + payload + CRC).
    ///
    /// Appends are strictly monotonic: writing at an offset below
    /// `last_written` is a corruption bug, not a retry, and is refused.
    pub fn write_event(&mut self, header: &RepHeader, event: &[u8]) -> Result<u64> {
        let offset = self.current_pos;
        if offset < self.last_written {
            return Err(Error::Binlog(format!(
                "refusing duplicate write at {}:{} (last written {})",
                self.binlog_name, offset, self.last_written
            )));
        }
        if event.len() != header.event_size as usize {
            return Err(Error::Binlog(format!(
                "event size {} does not match header {}",
                event.len(),
                header.event_size
            )));
        }

        let mut stored = event.to_vec();
        if let Some(ctx) = &self.encryption {
            // The 19-byte header stays in clear so readers can frame the
            // stream; payload and CRC are encrypted.
            ctx.encrypt_event(offset as u32, &mut stored[EVENT_HEADER_LEN..])?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&stored)?;
        self.last_written = offset + stored.len() as u64;

        self.current_pos = if header.next_pos as u64 > offset {
            header.next_pos as u64
        } else {
            offset + stored.len() as u64
        };

        // Once the format description is on disk, an encrypted file gets
        // its Start-Encryption event before any further traffic.
        if header.event_type == event_type::FORMAT_DESCRIPTION_EVENT {
            self.current_safe_event = offset;
            if self.encryption.is_none() && self.encryption_setup.is_some() {
                self.write_start_encryption(header.server_id, header.timestamp)?;
            }
        }
        Ok(offset)
    }

    fn write_start_encryption(&mut self, server_id: u32, timestamp: u32) -> Result<()> {
        let (cipher, key) = self.encryption_setup.expect("encryption configured");
        let mut nonce = [0u8; NONCE_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut nonce[..]);
        let ctx = EncryptionContext::new(cipher, self.key_version, nonce, key);

        let offset = self.current_pos;
        let event_len = (EVENT_HEADER_LEN + 1 + 4 + NONCE_LEN + 4) as u32;
        let next = offset as u32 + event_len;
        let event = ctx.start_encryption_event(server_id, next, timestamp);
        debug_assert_eq!(event.len() as u32, event_len);

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&event)?;
        self.last_written = offset + event.len() as u64;
        self.current_pos = next as u64;
        self.encryption = Some(ctx);
        tracing::info!(file = self.binlog_name, "binlog encryption started");
        Ok(())
    }

    /// Open the next file named by a rotate event. The new file holds just
    /// its magic until the master's format description arrives.
    pub fn rotate(&mut self, next_name: &str) -> Result<()> {
        self.file.sync_data()?;
        let path = self.dir.join(next_name);
        self.file = create_binlog_file(&path)?;
        tracing::info!(from = self.binlog_name, to = next_name, "binlog rotate");
        self.binlog_name = next_name.to_string();
        self.last_written = BINLOG_HEADER_LEN;
        self.binlog_position = BINLOG_HEADER_LEN;
        self.current_pos = BINLOG_HEADER_LEN;
        self.current_safe_event = BINLOG_HEADER_LEN;
        // Each file negotiates a fresh nonce.
        self.encryption = None;
        Ok(())
    }

    /// Mark the event at `offset` safe to stream to replicas
    pub fn set_current_safe_event(&mut self, offset: u64) {
        self.current_safe_event = offset;
    }

    /// A transaction committed: everything up to `current_pos` is safe
    pub fn commit_transaction(&mut self) {
        self.binlog_position = self.current_pos;
    }

    /// Outside transactions the safe position simply follows the stream
    pub fn advance_binlog_position(&mut self) {
        self.binlog_position = self.current_pos;
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn create_binlog_file(path: &Path) -> Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&BINLOG_MAGIC)?;
    Ok(file)
}

/// Positional reader over one binlog file. Each reader owns its own file
/// descriptor and never touches the writer's.
pub struct BinlogReader {
    path: PathBuf,
    file: File,
    pos: u64,
    /// Cipher and key available for picking up a Start-Encryption event
    encryption_setup: Option<(BinlogCipher, [u8; 32])>,
    encryption: Option<EncryptionContext>,
}

impl BinlogReader {
    pub fn open(
        path: &Path,
        pos: u64,
        encryption_setup: Option<(BinlogCipher, [u8; 32])>,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != BINLOG_MAGIC {
            return Err(Error::Binlog(format!(
                "{} is not a binlog file",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            pos: pos.max(BINLOG_HEADER_LEN),
            encryption_setup,
            encryption: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek_to(&mut self, pos: u64) {
        self.pos = pos.max(BINLOG_HEADER_LEN);
    }

    pub fn encryption(&self) -> Option<&EncryptionContext> {
        self.encryption.as_ref()
    }

    pub fn take_encryption(&mut self) -> Option<EncryptionContext> {
        self.encryption.take()
    }

    pub fn set_encryption(&mut self, ctx: Option<EncryptionContext>) {
        self.encryption = ctx;
    }

    /// Read the event at the current position; None at end of file.
    ///
    /// A Start-Encryption event flips this reader into decrypting mode
    /// when a key is available, and errors out otherwise.
    pub fn read_event(&mut self) -> Result<Option<BinlogEvent>> {
        let offset = self.pos;
        let mut header_bytes = [0u8; EVENT_HEADER_LEN];
        match read_exact_at(&mut self.file, offset, &mut header_bytes)? {
            true => {}
            false => return Ok(None),
        }

        let header = RepHeader::parse(&header_bytes)
            .map_err(|e| Error::Binlog(format!("bad event header: {}", e)))?;
        if (header.event_size as usize) < EVENT_HEADER_LEN {
            return Err(Error::BinlogCorrupted {
                file: self.path.display().to_string(),
                pos: offset,
                reason: format!("event size {} below header size", header.event_size),
            });
        }

        let mut data = vec![0u8; header.event_size as usize];
        data[..EVENT_HEADER_LEN].copy_from_slice(&header_bytes);
        if !read_exact_at(
            &mut self.file,
            offset + EVENT_HEADER_LEN as u64,
            &mut data[EVENT_HEADER_LEN..],
        )? {
            // Torn tail: the writer has not finished this event yet.
            return Ok(None);
        }

        if let Some(ctx) = &self.encryption {
            ctx.decrypt_event(offset as u32, &mut data[EVENT_HEADER_LEN..])?;
        }

        if header.event_type == event_type::MARIADB_START_ENCRYPTION_EVENT {
            match self.encryption_setup {
                Some((cipher, key)) => {
                    let payload = &data[EVENT_HEADER_LEN..data.len() - 4];
                    self.encryption =
                        Some(EncryptionContext::from_start_encryption(payload, cipher, key)?);
                }
                None => {
                    return Err(Error::Encryption(format!(
                        "{} is encrypted and no key is configured",
                        self.path.display()
                    )));
                }
            }
        }

        self.pos = if header.next_pos as u64 > offset {
            header.next_pos as u64
        } else {
            offset + header.event_size as u64
        };

        Ok(Some(BinlogEvent {
            header,
            data,
            offset,
        }))
    }
}

/// Positional read helper; false when the file ends before `buf` fills
fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<bool> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_event(event_type: u8, payload_len: usize, offset: u64) -> (RepHeader, Vec<u8>) {
        let event_size = (EVENT_HEADER_LEN + payload_len + 4) as u32;
        let header = RepHeader {
            timestamp: 1_700_000_000,
            event_type,
            server_id: 1,
            event_size,
            next_pos: offset as u32 + event_size,
            flags: 0,
        };
        let mut event = vec![0u8; event_size as usize];
        header.write(&mut event);
        for (i, byte) in event[EVENT_HEADER_LEN..EVENT_HEADER_LEN + payload_len]
            .iter_mut()
            .enumerate()
        {
            *byte = i as u8;
        }
        crate::proxy::protocol::restamp_event_crc(&mut event);
        (header, event)
    }

    #[test]
    fn test_file_name_sequencing() {
        assert_eq!(binlog_name("mariadb-bin", 1), "mariadb-bin.000001");
        assert_eq!(parse_sequence("mariadb-bin.000042"), Some(42));
        assert_eq!(
            next_file_name("mariadb-bin.000042").unwrap(),
            "mariadb-bin.000043"
        );
        assert_eq!(parse_sequence("garbage"), None);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let mut writer = BinlogWriter::create_or_resume(dir.path(), "bin", None).unwrap();

        let fde = build_format_description_event(1, 1_700_000_000);
        let fde_header = RepHeader::parse(&fde).unwrap();
        writer.write_event(&fde_header, &fde).unwrap();

        let offset = writer.positions().current_pos;
        let (header, event) = make_event(event_type::QUERY_EVENT, 40, offset);
        writer.write_event(&header, &event).unwrap();

        let mut reader =
            BinlogReader::open(&dir.path().join("bin.000001"), BINLOG_HEADER_LEN, None).unwrap();
        let read_fde = reader.read_event().unwrap().unwrap();
        assert_eq!(
            read_fde.header.event_type,
            event_type::FORMAT_DESCRIPTION_EVENT
        );
        let read_query = reader.read_event().unwrap().unwrap();
        assert_eq!(read_query.header.event_type, event_type::QUERY_EVENT);
        assert_eq!(read_query.data, event);
        assert!(reader.read_event().unwrap().is_none());
    }

    #[test]
    fn test_duplicate_write_at_same_offset_refused() {
        let dir = tempdir().unwrap();
        let mut writer = BinlogWriter::create_or_resume(dir.path(), "bin", None).unwrap();

        let (header, event) = make_event(event_type::QUERY_EVENT, 10, BINLOG_HEADER_LEN);
        writer.write_event(&header, &event).unwrap();
        let advanced = writer.positions().last_written;

        // Rewind current_pos behind last_written: the writer must refuse.
        writer.current_pos = BINLOG_HEADER_LEN;
        assert!(writer.write_event(&header, &event).is_err());
        assert_eq!(writer.positions().last_written, advanced);
    }

    #[test]
    fn test_rotate_resets_positions() {
        let dir = tempdir().unwrap();
        let mut writer = BinlogWriter::create_or_resume(dir.path(), "bin", None).unwrap();

        let (header, event) = make_event(event_type::QUERY_EVENT, 10, BINLOG_HEADER_LEN);
        writer.write_event(&header, &event).unwrap();
        writer.commit_transaction();

        writer.rotate("bin.000002").unwrap();
        assert_eq!(writer.binlog_name(), "bin.000002");
        let positions = writer.positions();
        assert_eq!(positions.current_pos, BINLOG_HEADER_LEN);
        assert_eq!(positions.binlog_position, BINLOG_HEADER_LEN);
        assert!(dir.path().join("bin.000002").exists());
        assert!(is_empty_binlog(&dir.path().join("bin.000002")));
    }

    #[test]
    fn test_transaction_positions() {
        let dir = tempdir().unwrap();
        let mut writer = BinlogWriter::create_or_resume(dir.path(), "bin", None).unwrap();

        let offset = writer.positions().current_pos;
        let (header, event) = make_event(event_type::QUERY_EVENT, 20, offset);
        writer.write_event(&header, &event).unwrap();

        // Inside a transaction the safe position trails current_pos.
        let positions = writer.positions();
        assert!(positions.binlog_position < positions.current_pos);

        writer.commit_transaction();
        let positions = writer.positions();
        assert_eq!(positions.binlog_position, positions.current_pos);
    }

    #[test]
    fn test_encrypted_round_trip() {
        let dir = tempdir().unwrap();
        let key = [9u8; 32];
        let setup = Some((BinlogCipher::AesCtr, key));
        let mut writer = BinlogWriter::create_or_resume(dir.path(), "bin", setup).unwrap();

        // FDE in clear, then Start-Encryption is appended automatically.
        let fde = build_format_description_event(1, 1_700_000_000);
        let fde_header = RepHeader::parse(&fde).unwrap();
        writer.write_event(&fde_header, &fde).unwrap();
        assert!(writer.encryption().is_some());

        let offset = writer.positions().current_pos;
        let (header, event) = make_event(event_type::QUERY_EVENT, 33, offset);
        writer.write_event(&header, &event).unwrap();

        // A keyless reader must refuse the file.
        let mut blind =
            BinlogReader::open(&dir.path().join("bin.000001"), BINLOG_HEADER_LEN, None).unwrap();
        blind.read_event().unwrap(); // FDE is in clear
        assert!(blind.read_event().is_err());

        // A keyed reader decrypts transparently.
        let mut reader =
            BinlogReader::open(&dir.path().join("bin.000001"), BINLOG_HEADER_LEN, setup).unwrap();
        let fde_read = reader.read_event().unwrap().unwrap();
        assert_eq!(
            fde_read.header.event_type,
            event_type::FORMAT_DESCRIPTION_EVENT
        );
        let start_enc = reader.read_event().unwrap().unwrap();
        assert_eq!(
            start_enc.header.event_type,
            event_type::MARIADB_START_ENCRYPTION_EVENT
        );
        let query = reader.read_event().unwrap().unwrap();
        assert_eq!(query.data, event);
    }

    #[test]
    fn test_resume_picks_highest_file() {
        let dir = tempdir().unwrap();
        {
            let mut writer = BinlogWriter::create_or_resume(dir.path(), "bin", None).unwrap();
            writer.rotate("bin.000002").unwrap();
            writer.rotate("bin.000003").unwrap();
        }
        let writer = BinlogWriter::create_or_resume(dir.path(), "bin", None).unwrap();
        assert_eq!(writer.binlog_name(), "bin.000003");

        let files = list_binlog_files(dir.path(), "bin").unwrap();
        assert_eq!(files, vec!["bin.000001", "bin.000002", "bin.000003"]);
    }
}
