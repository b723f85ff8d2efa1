//! # Persistence Gateway
//!
//! Durable key/value storage shared by the history store and the scheduler.
//!
//! The gateway is the only channel between the foreground and background
//! execution contexts. Its contract:
//! - string lists (one serialized sample per element) under [`keys::LOCATION_HISTORY`]
//! - integers under [`keys::LAST_TRACKING_TIME`] and [`keys::CONSECUTIVE_BG_UPDATES`]
//! - a boolean under [`keys::WAS_TRACKING`]
//!
//! Every `set_*` call is all-or-nothing and durable before it returns. A list
//! write replaces the whole list; readers never observe a partial list.
//!
//! Two implementations ship with the crate:
//! - [`MemoryGateway`]: process-local, for tests and hosts with their own storage
//! - `SqliteGateway` (feature `persistence`): SQLite file, one transaction per write

use std::collections::HashMap;
use std::sync::Mutex;

#[cfg(feature = "persistence")]
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, TrackerError};

/// Well-known keys used by the tracker.
pub mod keys {
    /// Serialized accepted samples, oldest first
    pub const LOCATION_HISTORY: &str = "location_history";
    /// Capture time (ms) of the most recent accepted sample
    pub const LAST_TRACKING_TIME: &str = "last_tracking_time";
    /// Consecutive successful background runs
    pub const CONSECUTIVE_BG_UPDATES: &str = "consecutive_bg_updates";
    /// Whether the user left tracking switched on
    pub const WAS_TRACKING: &str = "was_tracking";
}

/// Durable key/value storage consumed by the tracker.
pub trait PersistenceGateway: Send + Sync {
    /// Read a string list; `None` when the key was never written.
    fn get_string_list(&self, key: &str) -> Result<Option<Vec<String>>>;

    /// Replace the whole list stored under `key`.
    fn set_string_list(&self, key: &str, values: &[String]) -> Result<()>;

    fn get_int(&self, key: &str) -> Result<Option<i64>>;

    fn set_int(&self, key: &str, value: i64) -> Result<()>;

    fn get_bool(&self, key: &str) -> Result<Option<bool>>;

    fn set_bool(&self, key: &str, value: bool) -> Result<()>;

    /// Remove a key of any type. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

// ============================================================================
// In-memory gateway
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum StoredValue {
    List(Vec<String>),
    Int(i64),
    Bool(bool),
}

/// Process-local gateway backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, StoredValue>) -> R) -> Result<R> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| TrackerError::persistence("memory gateway lock poisoned"))?;
        Ok(f(&mut guard))
    }

    fn type_mismatch(key: &str, expected: &str) -> TrackerError {
        TrackerError::persistence(format!("key '{}' does not hold a {}", key, expected))
    }
}

impl PersistenceGateway for MemoryGateway {
    fn get_string_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(StoredValue::List(values)) => Ok(Some(values.clone())),
            Some(_) => Err(Self::type_mismatch(key, "string list")),
        })?
    }

    fn set_string_list(&self, key: &str, values: &[String]) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), StoredValue::List(values.to_vec()));
        })
    }

    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(StoredValue::Int(value)) => Ok(Some(*value)),
            Some(_) => Err(Self::type_mismatch(key, "integer")),
        })?
    }

    fn set_int(&self, key: &str, value: i64) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), StoredValue::Int(value));
        })
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(StoredValue::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(Self::type_mismatch(key, "boolean")),
        })?
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), StoredValue::Bool(value));
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }
}

// ============================================================================
// SQLite gateway
// ============================================================================

/// SQLite-backed gateway.
///
/// Scalars live in `kv_scalars`; lists live in `kv_lists` (one row per
/// element) with their presence recorded in `kv_list_keys`. A list write is a
/// single transaction: delete old rows, insert new rows, commit.
#[cfg(feature = "persistence")]
pub struct SqliteGateway {
    db: Mutex<Connection>,
    db_path: String,
}

#[cfg(feature = "persistence")]
impl SqliteGateway {
    /// Open (or create) a gateway database at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            log::warn!("[SqliteGateway] Failed to enable WAL mode: {}", err);
        }
        Self::init_schema(&conn)?;
        log::info!("[SqliteGateway] Opened {}", db_path);

        Ok(Self {
            db: Mutex::new(conn),
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            -- Integer and boolean values
            CREATE TABLE IF NOT EXISTS kv_scalars (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            -- Which list keys exist (distinguishes empty from missing)
            CREATE TABLE IF NOT EXISTS kv_list_keys (
                key TEXT PRIMARY KEY,
                length INTEGER NOT NULL
            );

            -- List elements, ordered by position
            CREATE TABLE IF NOT EXISTS kv_lists (
                key TEXT NOT NULL,
                position INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, position)
            );
        "#,
        )
    }

    fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
        let mut guard = self
            .db
            .lock()
            .map_err(|_| TrackerError::persistence("sqlite gateway lock poisoned"))?;
        f(&mut guard)
    }

    fn get_scalar(&self, key: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv_scalars WHERE key = ?",
                    params![key],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    fn set_scalar(&self, key: &str, value: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv_scalars (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }
}

#[cfg(feature = "persistence")]
impl PersistenceGateway for SqliteGateway {
    fn get_string_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        self.with_conn(|conn| {
            let length = conn
                .query_row(
                    "SELECT length FROM kv_list_keys WHERE key = ?",
                    params![key],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            let Some(length) = length else {
                return Ok(None);
            };

            let mut stmt =
                conn.prepare("SELECT value FROM kv_lists WHERE key = ? ORDER BY position ASC")?;
            let values: Vec<String> = stmt
                .query_map(params![key], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<_>>()?;

            if values.len() as i64 != length {
                log::warn!(
                    "[SqliteGateway] List '{}' has {} rows, expected {}",
                    key,
                    values.len(),
                    length
                );
            }
            Ok(Some(values))
        })
    }

    fn set_string_list(&self, key: &str, values: &[String]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM kv_lists WHERE key = ?", params![key])?;
            {
                let mut stmt =
                    tx.prepare("INSERT INTO kv_lists (key, position, value) VALUES (?1, ?2, ?3)")?;
                for (position, value) in values.iter().enumerate() {
                    stmt.execute(params![key, position as i64, value])?;
                }
            }
            tx.execute(
                "INSERT INTO kv_list_keys (key, length) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET length = excluded.length",
                params![key, values.len() as i64],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        self.get_scalar(key)
    }

    fn set_int(&self, key: &str, value: i64) -> Result<()> {
        self.set_scalar(key, value)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.get_scalar(key)?.map(|v| v != 0))
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set_scalar(key, i64::from(value))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM kv_scalars WHERE key = ?", params![key])?;
            tx.execute("DELETE FROM kv_lists WHERE key = ?", params![key])?;
            tx.execute("DELETE FROM kv_list_keys WHERE key = ?", params![key])?;
            tx.commit()?;
            Ok(())
        })
    }
}


// ============================================================================
// Tests
// ============================================================================
