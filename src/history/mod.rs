//! # Request History
//!
//! Records a summary of every executed request. History writes are
//! fire-and-forget from the execution pipeline: a failed write is logged and
//! the run continues.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::StoreError;
use crate::http::method::HttpMethod;

/// Maximum number of history entries to retain.
const MAX_HISTORY_ENTRIES: usize = 100;

/// A single history entry recording a past request and its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: u64,
    pub method: HttpMethod,
    pub url: String,
    /// `"200 OK"` style; `None` when the transport failed.
    pub status: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Accepts one resolved-request/response summary per executed request.
pub trait HistorySink: Send + Sync {
    fn record(&self, entry: HistoryEntry) -> Result<(), StoreError>;
}

/// In-memory history list, most recent first, capped at
/// [`MAX_HISTORY_ENTRIES`].
#[derive(Debug, Default)]
pub struct MemoryHistory {
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, most recent first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl HistorySink for MemoryHistory {
    fn record(&self, entry: HistoryEntry) -> Result<(), StoreError> {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= MAX_HISTORY_ENTRIES {
                entries.pop_back();
            }
            entries.push_front(entry);
        }
        Ok(())
    }
}

/// Durable history in a sqlite database, same cap as the in-memory list.
pub struct SqliteHistory {
    conn: Mutex<Connection>,
}

impl SqliteHistory {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                status TEXT,
                duration_ms INTEGER
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let conn = match self.conn.lock() {
            Ok(conn) => conn,
            Err(_) => return Ok(0),
        };
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl HistorySink for SqliteHistory {
    fn record(&self, entry: HistoryEntry) -> Result<(), StoreError> {
        let conn = match self.conn.lock() {
            Ok(conn) => conn,
            Err(_) => return Ok(()),
        };
        conn.execute(
            "INSERT INTO history (timestamp, method, url, status, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                i64::try_from(entry.timestamp).unwrap_or(i64::MAX),
                entry.method.to_string(),
                entry.url,
                entry.status,
                entry.duration_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)),
            ],
        )?;
        // Evict the oldest rows beyond the cap.
        conn.execute(
            "DELETE FROM history WHERE id NOT IN
             (SELECT id FROM history ORDER BY id DESC LIMIT ?1)",
            rusqlite::params![i64::try_from(MAX_HISTORY_ENTRIES).unwrap_or(i64::MAX)],
        )?;
        Ok(())
    }
}
