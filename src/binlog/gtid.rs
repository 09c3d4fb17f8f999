//! GTID Index
//!
//! Maps every GTID seen by the master-side writer to the binlog file and
//! byte range holding its transaction, so a replica that connects with a
//! GTID instead of a file and position can be placed in the stream. Backed
//! by an embedded SQLite database in the binlog directory; rows are only
//! ever inserted, in increasing id, and lookups take the most recent row
//! for the requested GTID.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::error::{Error, Result};

/// A MariaDB global transaction id: domain-server_id-sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gtid {
    pub domain: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl Gtid {
    pub fn new(domain: u32, server_id: u32, sequence: u64) -> Self {
        Self {
            domain,
            server_id,
            sequence,
        }
    }

    /// Parse "0-1-100" style text
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.trim().splitn(3, '-');
        let domain = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::Binlog(format!("malformed GTID '{}'", text)))?;
        let server_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::Binlog(format!("malformed GTID '{}'", text)))?;
        let sequence = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::Binlog(format!("malformed GTID '{}'", text)))?;
        Ok(Self {
            domain,
            server_id,
            sequence,
        })
    }
}

impl std::fmt::Display for Gtid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.sequence)
    }
}

/// Where a GTID's transaction lives on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidPosition {
    pub gtid: Gtid,
    pub binlog_file: String,
    pub start_pos: u64,
    pub end_pos: u64,
}

/// Persistent GTID index
pub struct GtidStore {
    conn: Mutex<Connection>,
}

impl GtidStore {
    /// Create or open the index database
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::GtidStore(format!("cannot open {}: {}", path.display(), e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS gtid_maps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rep_domain INTEGER NOT NULL,
                server_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                binlog_file TEXT NOT NULL,
                start_pos INTEGER NOT NULL,
                end_pos INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_gtid_maps_gtid
                ON gtid_maps(rep_domain, server_id, sequence);

            CREATE INDEX IF NOT EXISTS idx_gtid_maps_file
                ON gtid_maps(binlog_file);
            "#,
        )
        .map_err(|e| Error::GtidStore(format!("schema setup failed: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory index for tests and ephemeral relays
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::GtidStore(format!("cannot open in-memory store: {}", e)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS gtid_maps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rep_domain INTEGER NOT NULL,
                server_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                binlog_file TEXT NOT NULL,
                start_pos INTEGER NOT NULL,
                end_pos INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_gtid_maps_gtid
                ON gtid_maps(rep_domain, server_id, sequence);
            "#,
        )
        .map_err(|e| Error::GtidStore(format!("schema setup failed: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record where a GTID's transaction was written
    pub fn record(&self, gtid: Gtid, binlog_file: &str, start_pos: u64, end_pos: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO gtid_maps (rep_domain, server_id, sequence, binlog_file, start_pos, end_pos)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                gtid.domain,
                gtid.server_id,
                gtid.sequence as i64,
                binlog_file,
                start_pos as i64,
                end_pos as i64
            ],
        )
        .map_err(|e| Error::GtidStore(format!("insert failed: {}", e)))?;
        Ok(())
    }

    /// Find the most recent row for exactly this GTID
    pub fn lookup(&self, gtid: Gtid) -> Result<Option<GtidPosition>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT binlog_file, start_pos, end_pos FROM gtid_maps
                WHERE rep_domain = ?1 AND server_id = ?2 AND sequence = ?3
                ORDER BY id DESC LIMIT 1
                "#,
            )
            .map_err(|e| Error::GtidStore(e.to_string()))?;

        let row = stmt
            .query_row(params![gtid.domain, gtid.server_id, gtid.sequence as i64], |row| {
                Ok(GtidPosition {
                    gtid,
                    binlog_file: row.get(0)?,
                    start_pos: row.get::<_, i64>(1)? as u64,
                    end_pos: row.get::<_, i64>(2)? as u64,
                })
            });

        match row {
            Ok(position) => Ok(Some(position)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::GtidStore(format!("lookup failed: {}", e))),
        }
    }

    /// Latest GTID recorded for each domain, rendered the way
    /// `@@gtid_current_pos` reports it.
    pub fn current_pos(&self) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT rep_domain, server_id, sequence FROM gtid_maps
                WHERE id IN (SELECT MAX(id) FROM gtid_maps GROUP BY rep_domain)
                ORDER BY rep_domain
                "#,
            )
            .map_err(|e| Error::GtidStore(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(Gtid {
                    domain: row.get(0)?,
                    server_id: row.get(1)?,
                    sequence: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(|e| Error::GtidStore(e.to_string()))?;

        let mut parts = Vec::new();
        for gtid in rows {
            let gtid = gtid.map_err(|e| Error::GtidStore(e.to_string()))?;
            parts.push(gtid.to_string());
        }
        Ok(parts.join(","))
    }

    /// Drop rows for files purged from disk
    pub fn purge_file(&self, binlog_file: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute(
                "DELETE FROM gtid_maps WHERE binlog_file = ?1",
                params![binlog_file],
            )
            .map_err(|e| Error::GtidStore(format!("purge failed: {}", e)))?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gtid_parse_and_display() {
        let gtid = Gtid::parse("0-1-100").unwrap();
        assert_eq!(gtid, Gtid::new(0, 1, 100));
        assert_eq!(gtid.to_string(), "0-1-100");

        assert!(Gtid::parse("").is_err());
        assert!(Gtid::parse("1-2").is_err());
        assert!(Gtid::parse("a-b-c").is_err());
    }

    #[test]
    fn test_record_and_lookup() {
        let store = GtidStore::open_in_memory().unwrap();
        let gtid = Gtid::new(0, 1, 5);
        store.record(gtid, "bin.000001", 4, 350).unwrap();

        let found = store.lookup(gtid).unwrap().unwrap();
        assert_eq!(found.binlog_file, "bin.000001");
        assert_eq!(found.start_pos, 4);
        assert_eq!(found.end_pos, 350);

        assert!(store.lookup(Gtid::new(0, 1, 6)).unwrap().is_none());
    }

    #[test]
    fn test_lookup_prefers_most_recent_row() {
        let store = GtidStore::open_in_memory().unwrap();
        let gtid = Gtid::new(0, 1, 5);
        store.record(gtid, "bin.000001", 4, 350).unwrap();
        // The same GTID re-recorded after a reconnect wins.
        store.record(gtid, "bin.000002", 4, 290).unwrap();

        let found = store.lookup(gtid).unwrap().unwrap();
        assert_eq!(found.binlog_file, "bin.000002");
        assert_eq!(found.end_pos, 290);
    }

    #[test]
    fn test_current_pos_per_domain() {
        let store = GtidStore::open_in_memory().unwrap();
        store.record(Gtid::new(0, 1, 10), "bin.000001", 4, 100).unwrap();
        store.record(Gtid::new(0, 1, 11), "bin.000001", 100, 200).unwrap();
        store.record(Gtid::new(1, 2, 7), "bin.000001", 200, 300).unwrap();

        assert_eq!(store.current_pos().unwrap(), "0-1-11,1-2-7");
    }

    #[test]
    fn test_purge_file() {
        let store = GtidStore::open_in_memory().unwrap();
        store.record(Gtid::new(0, 1, 1), "bin.000001", 4, 100).unwrap();
        store.record(Gtid::new(0, 1, 2), "bin.000002", 4, 100).unwrap();

        assert_eq!(store.purge_file("bin.000001").unwrap(), 1);
        assert!(store.lookup(Gtid::new(0, 1, 1)).unwrap().is_none());
        assert!(store.lookup(Gtid::new(0, 1, 2)).unwrap().is_some());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gtid_maps.db");
        {
            let store = GtidStore::open(&path).unwrap();
            store.record(Gtid::new(0, 1, 42), "bin.000001", 4, 99).unwrap();
        }
        let store = GtidStore::open(&path).unwrap();
        let found = store.lookup(Gtid::new(0, 1, 42)).unwrap().unwrap();
        assert_eq!(found.end_pos, 99);
    }
}
