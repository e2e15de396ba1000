//! SQLite cache for RPC responses that can never change (raw blocks by hash, raw
//! transactions by txid).

use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Content-addressed response store. Key = SHA-256 of the normalized request.
pub struct Cache {
    conn: Mutex<Connection>,
}

impl Cache {
    /// Open or create cache at `path`. Creates parent dirs if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rpc_cache (
                key TEXT PRIMARY KEY,
                method TEXT NOT NULL,
                value BLOB NOT NULL,
                created_utc INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn key_for(request: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let mut stmt = conn.prepare("SELECT value FROM rpc_cache WHERE key = ?1")?;
        let row = stmt
            .query_row([key], |r| r.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(row)
    }

    /// Insert or replace the response stored under `key`. `method` is kept for inspection only.
    pub fn set(&self, key: &str, method: &str, value: &[u8]) -> Result<(), CacheError> {
        let created = time::OffsetDateTime::now_utc().unix_timestamp();
        let conn = self
            .conn
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO rpc_cache (key, method, value, created_utc) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![key, method, value, created],
        )?;
        Ok(())
    }

    /// Cached JSON body; None if the key is missing or the bytes are not UTF-8.
    pub fn get_json(&self, key: &str) -> Result<Option<String>, CacheError> {
        let raw = self.get(key)?;
        Ok(raw.and_then(|b| String::from_utf8(b).ok()))
    }

    pub fn set_json(&self, key: &str, method: &str, json: &str) -> Result<(), CacheError> {
        self.set(key, method, json.as_bytes())
    }

    /// Number of cached responses.
    pub fn len(&self) -> Result<u64, CacheError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM rpc_cache", [], |r| r.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}
