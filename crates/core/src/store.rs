//! Persisted transactional key-value store.
//!
//! SQLite-backed store with hierarchical keys and atomic multi-key
//! transactions. Both the sigchain (append-only log under a node-scoped
//! prefix) and the gestalt graph (vertices, matrix edges, action sets) live
//! in the same table.
//!
//! # Key encoding
//!
//! A [`KeyPath`] is a sequence of segments. Each segment is encoded with a
//! type tag so that the byte order of encoded keys equals the segment order:
//! - string/bytes: `0x01`, bytes with `0x00` escaped as `0x00 0xFF`, then `0x00`
//! - u64: `0x02`, eight big-endian bytes
//!
//! An encoded prefix path is always a byte prefix of every key below it,
//! which is what range scans rely on.
//!
//! # Guarantees
//!
//! - Transactions are serialized: one connection behind a mutex, each
//!   transaction opened `IMMEDIATE`
//! - A closure returning `Err` rolls back every write it made
//! - WAL journal for crash recovery

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

const TAG_BYTES: u8 = 0x01;
const TAG_U64: u8 = 0x02;

/// A single key path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Bytes(Vec<u8>),
    U64(u64),
}

impl Segment {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Segment::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            Segment::U64(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Segment::U64(value) => Some(*value),
            Segment::Bytes(_) => None,
        }
    }
}

/// Hierarchical store key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPath {
    segments: Vec<Segment>,
}

impl KeyPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a path from string segments.
    pub fn of(segments: &[&str]) -> Self {
        segments
            .iter()
            .fold(Self::new(), |path, segment| path.push(*segment))
    }

    pub fn push(mut self, segment: impl AsRef<str>) -> Self {
        self.segments
            .push(Segment::Bytes(segment.as_ref().as_bytes().to_vec()));
        self
    }

    pub fn push_bytes(mut self, segment: &[u8]) -> Self {
        self.segments.push(Segment::Bytes(segment.to_vec()));
        self
    }

    pub fn push_u64(mut self, segment: u64) -> Self {
        self.segments.push(Segment::U64(segment));
        self
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Bytes(bytes) => {
                    out.push(TAG_BYTES);
                    for byte in bytes {
                        out.push(*byte);
                        if *byte == 0x00 {
                            out.push(0xFF);
                        }
                    }
                    out.push(0x00);
                }
                Segment::U64(value) => {
                    out.push(TAG_U64);
                    out.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
        out
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let mut segments = Vec::new();
        while let Some((tag, rest)) = bytes.split_first() {
            match *tag {
                TAG_BYTES => {
                    let mut segment = Vec::new();
                    let mut i = 0;
                    loop {
                        match rest.get(i) {
                            Some(0x00) if rest.get(i + 1) == Some(&0xFF) => {
                                segment.push(0x00);
                                i += 2;
                            }
                            Some(0x00) => {
                                i += 1;
                                break;
                            }
                            Some(byte) => {
                                segment.push(*byte);
                                i += 1;
                            }
                            None => {
                                return Err(StoreError::InvalidKey(
                                    "unterminated key segment".to_string(),
                                ))
                            }
                        }
                    }
                    segments.push(Segment::Bytes(segment));
                    bytes = &rest[i..];
                }
                TAG_U64 => {
                    let raw: [u8; 8] = rest
                        .get(..8)
                        .and_then(|s| s.try_into().ok())
                        .ok_or_else(|| {
                            StoreError::InvalidKey("truncated integer segment".to_string())
                        })?;
                    segments.push(Segment::U64(u64::from_be_bytes(raw)));
                    bytes = &rest[8..];
                }
                other => {
                    return Err(StoreError::InvalidKey(format!(
                        "unknown segment tag {:#04x}",
                        other
                    )))
                }
            }
        }
        Ok(Self { segments })
    }
}

/// Smallest byte string greater than every string starting with `prefix`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// SQLite-backed transactional store.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Create or open a store at the specified path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        info!(path = %path.display(), "Opening store");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID;
            "#,
        )?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside one atomic transaction.
    ///
    /// Commits when `f` returns `Ok`; any `Err` rolls back every write made
    /// through the transaction handle.
    pub fn transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&StoreTx<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let store_tx = StoreTx { tx };
        match f(&store_tx) {
            Ok(value) => {
                store_tx.tx.commit().map_err(StoreError::from)?;
                Ok(value)
            }
            Err(e) => {
                debug!("Rolling back store transaction");
                // Dropping the transaction rolls it back.
                drop(store_tx);
                Err(e)
            }
        }
    }
}

/// Handle to an open transaction.
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl StoreTx<'_> {
    pub fn get(&self, key: &KeyPath) -> Result<Option<Vec<u8>>> {
        let value = self
            .tx
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key.encode()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn exists(&self, key: &KeyPath) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&self, key: &KeyPath, value: &[u8]) -> Result<()> {
        self.tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key.encode(), value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &KeyPath) -> Result<()> {
        self.tx
            .execute("DELETE FROM kv WHERE key = ?1", params![key.encode()])?;
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &KeyPath) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &KeyPath, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, &bytes)
    }

    /// Ordered scan of keys strictly below `prefix`.
    ///
    /// When `after` is given the scan resumes after that key, which makes
    /// paged iteration restartable from any previously returned key.
    pub fn scan(
        &self,
        prefix: &KeyPath,
        after: Option<&KeyPath>,
        limit: usize,
    ) -> Result<Vec<(KeyPath, Vec<u8>)>> {
        let start = prefix.encode();
        let (lower, inclusive) = match after {
            Some(after) => (after.encode(), false),
            None => (start.clone(), true),
        };
        let lower_op = if inclusive { ">=" } else { ">" };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows: Vec<(Vec<u8>, Vec<u8>)> = match prefix_successor(&start) {
            Some(upper) => {
                let sql = format!(
                    "SELECT key, value FROM kv WHERE key {} ?1 AND key < ?2 ORDER BY key ASC LIMIT ?3",
                    lower_op
                );
                let mut stmt = self.tx.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![lower, upper, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT key, value FROM kv WHERE key {} ?1 ORDER BY key ASC LIMIT ?2",
                    lower_op
                );
                let mut stmt = self.tx.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![lower, limit], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };

        rows.into_iter()
            .filter(|(key, _)| key.len() > start.len())
            .map(|(key, value)| Ok((KeyPath::decode(&key)?, value)))
            .collect()
    }

    pub fn scan_all(&self, prefix: &KeyPath) -> Result<Vec<(KeyPath, Vec<u8>)>> {
        self.scan(prefix, None, usize::MAX)
    }

    /// Delete every key below `prefix`. Returns the number of removed keys.
    pub fn delete_prefix(&self, prefix: &KeyPath) -> Result<usize> {
        let start = prefix.encode();
        let removed = match prefix_successor(&start) {
            Some(upper) => self.tx.execute(
                "DELETE FROM kv WHERE key > ?1 AND key < ?2",
                params![start, upper],
            )?,
            None => self.tx.execute("DELETE FROM kv", [])?,
        };
        Ok(removed)
    }
}
