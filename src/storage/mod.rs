//! Durable storage for captured transactions
//!
//! One table, one row per transaction. The table is created on startup if it does
//! not exist yet; rows are only ever inserted.

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture::record::TransactionRecord;

pub use sqlite::SqliteStore;

/// A transaction read back from storage, with its surrogate key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub id: i64,
    #[serde(flatten)]
    pub record: TransactionRecord,
}

/// Storage backend for finished transactions
///
/// Implementations acquire whatever connection they need per call and release it
/// before returning, on success and on error alike.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert one record, returning the key assigned to it
    async fn insert(&self, record: &TransactionRecord) -> Result<i64, StorageError>;

    /// Fetch a single transaction by key
    async fn get(&self, id: i64) -> Result<Option<StoredTransaction>, StorageError>;

    /// Most recent transactions first
    async fn recent(&self, limit: usize) -> Result<Vec<StoredTransaction>, StorageError>;
}

/// Storage operation errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database connection or query error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Gave up waiting for another writer's lock
    #[error("Database busy: {0}")]
    Busy(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Blocking task failed to complete
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                StorageError::Busy(err.to_string())
            }
            _ => StorageError::DatabaseError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::InternalError(format!("Task join error: {}", err))
    }
}

/// Create the `capture` table if it does not exist.
///
/// Configures WAL mode so the inspection commands can read while the proxy writes.
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), StorageError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS capture (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            static_resource INTEGER NOT NULL DEFAULT 0,
            origin TEXT,
            method TEXT,
            status_code INTEGER,
            content_type TEXT,
            content_length INTEGER,
            host TEXT,
            port TEXT,
            url TEXT,
            scheme TEXT,
            path TEXT,
            header TEXT,
            content BLOB,
            request_header TEXT,
            request_content BLOB,
            date_start TEXT,
            date_end TEXT,
            elapsed_ms INTEGER,
            extension TEXT
        )",
        [],
    )?;

    Ok(())
}
