//! Local cache for inbox messages, query state, and persisted session
//! records.
//!
//! One typed interface, two backends: [`MemoryCache`] for tests and
//! short-lived processes, [`SqliteCache`] for clients that resume streams
//! across restarts. The layout follows the protocol's persisted-state
//! contract: store `m` holds labeled messages keyed by
//! `enc(endpoint):enc(id)`, store `q` holds per-query
//! `{cursor, version, message_ids, wait_til}` records keyed by the hashed
//! request, and a small `kv` store holds the session-manager records.
//!
//! Writers hold the per-query advisory lock (see [`crate::inbox`]), so each
//! key is single-writer; readers outside the lock observe a monotonically
//! growing prefix of `message_ids`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::protocol::LabeledMessage;

/// File stem of the persistent cache database.
pub const CACHE_DB_NAME: &str = "graffiti-inbox-cache";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum CacheError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    Corrupt(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            CacheError::Serde(e) => write!(f, "serialization error: {e}"),
            CacheError::Corrupt(msg) => write!(f, "corrupt cache entry: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Sqlite(e)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-query stream state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Server-side cursor for the next page, once the first page returned.
    pub cursor: Option<String>,
    /// Rotated whenever the server-side cursor invalidates; serialized
    /// client cursors embed it and mismatch means the resume is stale.
    pub version: u64,
    /// Ids of every message this query has yielded, in server order.
    pub message_ids: Vec<String>,
    /// Unix-millisecond timestamp before which no request may be issued,
    /// derived from an honored `Retry-After`.
    pub wait_til: Option<u64>,
}

/// Cache key for a labeled message: `enc(endpoint):enc(id)`.
pub fn message_key(endpoint: &str, id: &str) -> String {
    format!(
        "{}:{}",
        codec::escape_component(endpoint),
        codec::escape_component(id)
    )
}

// ---------------------------------------------------------------------------
// Store interface
// ---------------------------------------------------------------------------

/// Typed cache interface shared by both backends. All methods are cheap and
/// synchronous; callers in async contexts hold them only briefly.
pub trait CacheStore: Send + Sync {
    fn get_message(&self, key: &str) -> Result<Option<LabeledMessage>, CacheError>;
    fn put_message(&self, key: &str, message: &LabeledMessage) -> Result<(), CacheError>;

    fn get_query(&self, key: &str) -> Result<Option<QueryRecord>, CacheError>;
    fn put_query(&self, key: &str, record: &QueryRecord) -> Result<(), CacheError>;
    fn delete_query(&self, key: &str) -> Result<(), CacheError>;

    fn get_kv(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn put_kv(&self, key: &str, value: &str) -> Result<(), CacheError>;
    fn delete_kv(&self, key: &str) -> Result<(), CacheError>;
}

fn message_to_blob(message: &LabeledMessage) -> Result<Vec<u8>, CacheError> {
    message
        .to_bytes()
        .map_err(|e| CacheError::Corrupt(format!("encode message: {e}")))
}

fn message_from_blob(blob: &[u8]) -> Result<LabeledMessage, CacheError> {
    LabeledMessage::from_bytes(blob)
        .map_err(|e| CacheError::Corrupt(format!("decode message: {e}")))
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Process-local cache backend.
#[derive(Default)]
pub struct MemoryCache {
    messages: Mutex<HashMap<String, Vec<u8>>>,
    queries: Mutex<HashMap<String, QueryRecord>>,
    kv: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache::default()
    }
}

impl CacheStore for MemoryCache {
    fn get_message(&self, key: &str) -> Result<Option<LabeledMessage>, CacheError> {
        match self.messages.lock().unwrap().get(key) {
            Some(blob) => Ok(Some(message_from_blob(blob)?)),
            None => Ok(None),
        }
    }

    fn put_message(&self, key: &str, message: &LabeledMessage) -> Result<(), CacheError> {
        let blob = message_to_blob(message)?;
        self.messages.lock().unwrap().insert(key.to_string(), blob);
        Ok(())
    }

    fn get_query(&self, key: &str) -> Result<Option<QueryRecord>, CacheError> {
        Ok(self.queries.lock().unwrap().get(key).cloned())
    }

    fn put_query(&self, key: &str, record: &QueryRecord) -> Result<(), CacheError> {
        self.queries
            .lock()
            .unwrap()
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    fn delete_query(&self, key: &str) -> Result<(), CacheError> {
        self.queries.lock().unwrap().remove(key);
        Ok(())
    }

    fn get_kv(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }

    fn put_kv(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.kv
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_kv(&self, key: &str) -> Result<(), CacheError> {
        self.kv.lock().unwrap().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

/// Persistent cache backend.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Open (or create) the cache database under `dir`.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(dir.join(format!("{CACHE_DB_NAME}.db")))?;
        Self::init(conn)
    }

    /// An in-memory database with the same schema, for tests.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS m (key TEXT PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE IF NOT EXISTS q (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )?;
        Ok(SqliteCache {
            conn: Mutex::new(conn),
        })
    }
}

impl CacheStore for SqliteCache {
    fn get_message(&self, key: &str) -> Result<Option<LabeledMessage>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let blob: Option<Vec<u8>> = conn
            .query_row("SELECT value FROM m WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        match blob {
            Some(blob) => Ok(Some(message_from_blob(&blob)?)),
            None => Ok(None),
        }
    }

    fn put_message(&self, key: &str, message: &LabeledMessage) -> Result<(), CacheError> {
        let blob = message_to_blob(message)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO m (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, blob],
        )?;
        Ok(())
    }

    fn get_query(&self, key: &str) -> Result<Option<QueryRecord>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let text: Option<String> = conn
            .query_row("SELECT value FROM q WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn put_query(&self, key: &str, record: &QueryRecord) -> Result<(), CacheError> {
        let text = serde_json::to_string(record)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO q (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, text],
        )?;
        Ok(())
    }

    fn delete_query(&self, key: &str) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM q WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn get_kv(&self, key: &str) -> Result<Option<String>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let text: Option<String> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(text)
    }

    fn put_kv(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_kv(&self, key: &str) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Label, Message, MessageMeta, MetaBase, Object};
    use serde_json::json;

    fn sample_message(id: &str) -> LabeledMessage {
        let message = Message::new(
            vec![b"tag".to_vec()],
            Object {
                url: "graffiti:did!web!a.test:uEiA".into(),
                actor: "did:web:a.test".into(),
                value: json!({"m": "hi"}),
                channels: vec![],
                allowed: None,
            },
            &MessageMeta::Shared {
                base: MetaBase {
                    bucket_key: "bkey".into(),
                    tombstone_of: None,
                },
            },
        )
        .unwrap();
        LabeledMessage {
            id: id.to_string(),
            message,
            label: Label::Unlabeled,
        }
    }

    fn exercise(store: &dyn CacheStore) {
        let key = message_key("https://in.test", "m-1");
        assert!(store.get_message(&key).unwrap().is_none());
        let message = sample_message("m-1");
        store.put_message(&key, &message).unwrap();
        assert_eq!(store.get_message(&key).unwrap().unwrap(), message);

        // Overwrite with a new label, as `label()` does after relabeling.
        let mut relabeled = message.clone();
        relabeled.label = Label::Valid;
        store.put_message(&key, &relabeled).unwrap();
        assert_eq!(store.get_message(&key).unwrap().unwrap().label, Label::Valid);

        let record = QueryRecord {
            cursor: Some("srv-1".into()),
            version: 7,
            message_ids: vec!["m-1".into()],
            wait_til: Some(12345),
        };
        store.put_query("qkey", &record).unwrap();
        assert_eq!(store.get_query("qkey").unwrap().unwrap(), record);
        store.delete_query("qkey").unwrap();
        assert!(store.get_query("qkey").unwrap().is_none());

        store.put_kv("graffiti-sessions-logged-in", "[]").unwrap();
        assert_eq!(
            store.get_kv("graffiti-sessions-logged-in").unwrap().unwrap(),
            "[]"
        );
        store.delete_kv("graffiti-sessions-logged-in").unwrap();
        assert!(store.get_kv("graffiti-sessions-logged-in").unwrap().is_none());
    }

    #[test]
    fn memory_cache_round_trips() {
        exercise(&MemoryCache::new());
    }

    #[test]
    fn sqlite_cache_round_trips() {
        exercise(&SqliteCache::open_in_memory().unwrap());
    }

    #[test]
    fn sqlite_cache_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let store = SqliteCache::open(tmp.path()).unwrap();
            store
                .put_query(
                    "qkey",
                    &QueryRecord {
                        cursor: Some("srv-9".into()),
                        version: 2,
                        message_ids: vec!["a".into(), "b".into()],
                        wait_til: None,
                    },
                )
                .unwrap();
        }
        let store = SqliteCache::open(tmp.path()).unwrap();
        let record = store.get_query("qkey").unwrap().unwrap();
        assert_eq!(record.cursor.as_deref(), Some("srv-9"));
        assert_eq!(record.message_ids, vec!["a", "b"]);
    }
}
