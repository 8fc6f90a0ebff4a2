//! Audit storage backends.
//!
//! The [`AuditBackend`] trait abstracts the persistence layer under the
//! chain. The sqlite backend (WAL mode) is the durable default; the memory
//! backend backs tests. A replicated deployment plugs a consensus-backed
//! implementation in here; replication itself is out of scope.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]
// SQLite returns i64 for row IDs and counts, but they're always
// non-negative in this schema.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags, params};
use thiserror::Error;

use super::entry::{AuditEntry, AuditWriter};
use super::kind::EventKind;
use crate::capsule::CapsuleId;
use crate::clock::Tick;
use crate::crypto::ContentHash;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from audit storage and chain operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A row held data that does not decode to an entry.
    #[error("corrupt entry at seq {seq}: {details}")]
    CorruptEntry {
        /// Sequence number of the corrupt row.
        seq: u64,
        /// What failed to decode.
        details: String,
    },

    /// Entry not found.
    #[error("audit entry not found: seq={seq}")]
    EntryNotFound {
        /// The missing sequence number.
        seq: u64,
    },

    /// The committer could not durably append an entry.
    #[error("audit append failed: {details}")]
    AppendFailed {
        /// What went wrong.
        details: String,
    },

    /// The committer's intake queue is full.
    #[error("audit committer overloaded")]
    Overloaded,

    /// The committer task has stopped.
    #[error("audit committer is not running")]
    CommitterStopped,
}

/// Storage abstraction under the audit chain.
///
/// Implementations persist sealed entries exactly as given; sequencing,
/// hashing, and signing happen in the chain above. Contract:
///
/// - entries are immutable once inserted
/// - `read_range` returns entries in ascending sequence order
/// - `head_entry` returns the entry with the highest sequence number
pub trait AuditBackend: Send + Sync {
    /// Persists a sealed entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be durably stored.
    fn insert(&self, entry: &AuditEntry) -> Result<(), AuditError>;

    /// Reads the entry with the given sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::EntryNotFound`] if absent.
    fn read_one(&self, seq: u64) -> Result<AuditEntry, AuditError>;

    /// Reads entries with `from <= seq <= to` in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn read_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>, AuditError>;

    /// Returns the entry with the highest sequence number, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn head_entry(&self) -> Result<Option<AuditEntry>, AuditError>;

    /// Reads entries concerning a capsule, ascending, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn query_capsule(&self, id: CapsuleId, limit: u64) -> Result<Vec<AuditEntry>, AuditError>;

    /// Reads entries with a given tag, ascending, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn query_kind(&self, kind: EventKind, limit: u64) -> Result<Vec<AuditEntry>, AuditError>;

    /// Reads entries with `from <= tick <= to`, ascending, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn query_tick_range(
        &self,
        from: Tick,
        to: Tick,
        limit: u64,
    ) -> Result<Vec<AuditEntry>, AuditError>;
}

/// In-memory backend for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryAuditBackend {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditBackend {
    /// Creates an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditBackend for MemoryAuditBackend {
    fn insert(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }

    fn read_one(&self, seq: u64) -> Result<AuditEntry, AuditError> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.seq == seq)
            .cloned()
            .ok_or(AuditError::EntryNotFound { seq })
    }

    fn read_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.seq >= from && e.seq <= to)
            .cloned()
            .collect())
    }

    fn head_entry(&self) -> Result<Option<AuditEntry>, AuditError> {
        Ok(self.entries.lock().unwrap().last().cloned())
    }

    fn query_capsule(&self, id: CapsuleId, limit: u64) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.capsule_id == Some(id))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn query_kind(&self, kind: EventKind, limit: u64) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn query_tick_range(
        &self,
        from: Tick,
        to: Tick,
        limit: u64,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.tick >= from && e.tick <= to)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/// `SQLite`-backed durable audit storage.
///
/// WAL mode allows committed entries to be read while the committer writes.
pub struct SqliteAuditBackend {
    conn: Mutex<Connection>,
}

impl SqliteAuditBackend {
    /// Opens or creates the audit database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    const SELECT_COLUMNS: &'static str =
        "seq, kind, tick, writer, capsule_id, payload, prev_hash, content_hash, signature";

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            seq: row.get::<_, i64>(0)? as u64,
            kind: row.get(1)?,
            tick: row.get::<_, i64>(2)? as u64,
            writer: row.get(3)?,
            capsule_id: row.get(4)?,
            payload: row.get(5)?,
            prev_hash: row.get(6)?,
            content_hash: row.get(7)?,
            signature: row.get(8)?,
        })
    }

    fn decode(raw: RawRow) -> Result<AuditEntry, AuditError> {
        let seq = raw.seq;
        let corrupt = |details: &str| AuditError::CorruptEntry {
            seq,
            details: details.to_string(),
        };

        let kind = EventKind::parse(&raw.kind).ok_or_else(|| corrupt("unknown event kind"))?;
        let writer = AuditWriter::parse(&raw.writer).ok_or_else(|| corrupt("unparseable writer"))?;
        let capsule_id = match raw.capsule_id {
            Some(s) => Some(s.parse().map_err(|_| corrupt("unparseable capsule id"))?),
            None => None,
        };
        let prev_hash =
            ContentHash::from_slice(&raw.prev_hash).ok_or_else(|| corrupt("bad prev hash"))?;
        let content_hash =
            ContentHash::from_slice(&raw.content_hash).ok_or_else(|| corrupt("bad content hash"))?;

        Ok(AuditEntry {
            seq,
            prev_hash,
            kind,
            tick: Tick::new(raw.tick),
            writer,
            capsule_id,
            payload: raw.payload,
            content_hash,
            signature: raw.signature,
        })
    }

    fn collect(
        rows: Vec<rusqlite::Result<RawRow>>,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        rows.into_iter()
            .map(|row| Self::decode(row?))
            .collect::<Result<Vec<_>, _>>()
    }
}

struct RawRow {
    seq: u64,
    kind: String,
    tick: u64,
    writer: String,
    capsule_id: Option<String>,
    payload: Vec<u8>,
    prev_hash: Vec<u8>,
    content_hash: Vec<u8>,
    signature: Option<Vec<u8>>,
}

impl AuditBackend for SqliteAuditBackend {
    fn insert(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_entries (seq, kind, tick, writer, capsule_id, payload, prev_hash, content_hash, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.seq as i64,
                entry.kind.as_str(),
                entry.tick.value() as i64,
                entry.writer.as_wire(),
                entry.capsule_id.map(|id| id.as_string()),
                entry.payload,
                entry.prev_hash.to_vec(),
                entry.content_hash.to_vec(),
                entry.signature,
            ],
        )?;
        Ok(())
    }

    fn read_one(&self, seq: u64) -> Result<AuditEntry, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_entries WHERE seq = ?1",
            Self::SELECT_COLUMNS
        ))?;
        let raw = stmt
            .query_row(params![seq as i64], Self::row_to_entry)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => AuditError::EntryNotFound { seq },
                other => AuditError::Database(other),
            })?;
        Self::decode(raw)
    }

    fn read_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_entries WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq ASC",
            Self::SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![from as i64, to as i64], Self::row_to_entry)?
            .collect::<Vec<_>>();
        Self::collect(rows)
    }

    fn head_entry(&self) -> Result<Option<AuditEntry>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_entries ORDER BY seq DESC LIMIT 1",
            Self::SELECT_COLUMNS
        ))?;
        let mut rows = stmt.query_map([], Self::row_to_entry)?.collect::<Vec<_>>();
        match rows.pop() {
            Some(raw) => Ok(Some(Self::decode(raw?)?)),
            None => Ok(None),
        }
    }

    fn query_capsule(&self, id: CapsuleId, limit: u64) -> Result<Vec<AuditEntry>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_entries WHERE capsule_id = ?1 ORDER BY seq ASC LIMIT ?2",
            Self::SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![id.as_string(), limit as i64], Self::row_to_entry)?
            .collect::<Vec<_>>();
        Self::collect(rows)
    }

    fn query_kind(&self, kind: EventKind, limit: u64) -> Result<Vec<AuditEntry>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_entries WHERE kind = ?1 ORDER BY seq ASC LIMIT ?2",
            Self::SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![kind.as_str(), limit as i64], Self::row_to_entry)?
            .collect::<Vec<_>>();
        Self::collect(rows)
    }

    fn query_tick_range(
        &self,
        from: Tick,
        to: Tick,
        limit: u64,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_entries WHERE tick >= ?1 AND tick <= ?2 ORDER BY seq ASC LIMIT ?3",
            Self::SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![from.value() as i64, to.value() as i64, limit as i64],
                Self::row_to_entry,
            )?
            .collect::<Vec<_>>();
        Self::collect(rows)
    }
}
