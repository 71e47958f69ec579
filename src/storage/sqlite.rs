//! SQLite-backed transaction store

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{initialize_schema, StorageError, StoredTransaction, TransactionStore};
use crate::capture::record::{HeaderList, TransactionRecord};

const SELECT_COLUMNS: &str = "id, static_resource, origin, method, status_code, content_type, \
     content_length, host, port, url, scheme, path, header, content, request_header, \
     request_content, date_start, date_end, elapsed_ms, extension";

/// Opens a fresh connection for every operation and closes it when the operation ends
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Open the store, creating the database file and table if needed
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let db_path = db_path.into();
        {
            let conn = Connection::open(&db_path)?;
            initialize_schema(&conn)?;
        }

        Ok(Self {
            db_path,
            busy_timeout: Duration::from_secs(5),
        })
    }

    /// How long a write waits for another writer's lock before failing with `Busy`
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn insert_blocking(&self, record: &TransactionRecord) -> Result<i64, StorageError> {
        let conn = self.connect()?;
        let header = serde_json::to_string(&record.response_headers)?;
        let request_header = serde_json::to_string(&record.request_headers)?;
        let content: Option<&[u8]> = if record.is_static && record.response_body.is_empty() {
            None
        } else {
            Some(&record.response_body[..])
        };

        let mut stmt = conn.prepare(
            "INSERT INTO capture (static_resource, origin, method, status_code, content_type,
                content_length, host, port, url, scheme, path, header, content, request_header,
                request_content, date_start, date_end, elapsed_ms, extension)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        )?;
        stmt.execute(params![
            record.is_static as i64,
            &record.origin,
            &record.method,
            record.status,
            &record.content_type,
            i64::try_from(record.content_length).unwrap_or(i64::MAX),
            &record.host,
            &record.port,
            &record.url,
            &record.scheme,
            &record.path,
            &header,
            content,
            &request_header,
            &record.request_body[..],
            record.started_at.to_rfc3339(),
            record.ended_at.to_rfc3339(),
            record.elapsed_ms,
            &record.extension,
        ])?;

        Ok(conn.last_insert_rowid())
    }

    fn get_blocking(&self, id: i64) -> Result<Option<StoredTransaction>, StorageError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM capture WHERE id = ?1"))?;

        match stmt.query_row([id], row_to_transaction) {
            Ok(stored) => Ok(Some(stored)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn recent_blocking(&self, limit: usize) -> Result<Vec<StoredTransaction>, StorageError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM capture ORDER BY id DESC LIMIT ?1"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = stmt
            .query_map([limit], row_to_transaction)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl TransactionStore for SqliteStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<i64, StorageError> {
        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.insert_blocking(&record)).await?
    }

    async fn get(&self, id: i64) -> Result<Option<StoredTransaction>, StorageError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.get_blocking(id)).await?
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredTransaction>, StorageError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.recent_blocking(limit)).await?
    }
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<StoredTransaction> {
    let content: Option<Vec<u8>> = row.get(13)?;
    let request_content: Option<Vec<u8>> = row.get(15)?;
    let content_length: i64 = row.get(6)?;

    Ok(StoredTransaction {
        id: row.get(0)?,
        record: TransactionRecord {
            is_static: row.get::<_, i64>(1)? != 0,
            origin: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            method: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            status: row.get::<_, Option<u16>>(4)?.unwrap_or_default(),
            content_type: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            content_length: u64::try_from(content_length).unwrap_or_default(),
            host: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            port: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            url: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            scheme: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            path: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
            response_headers: headers_column(row, 12)?,
            response_body: content.map(Bytes::from).unwrap_or_default(),
            request_headers: headers_column(row, 14)?,
            request_body: request_content.map(Bytes::from).unwrap_or_default(),
            started_at: timestamp_column(row, 16)?,
            ended_at: timestamp_column(row, 17)?,
            elapsed_ms: row.get::<_, Option<i64>>(18)?.unwrap_or_default(),
            extension: row.get::<_, Option<String>>(19)?.unwrap_or_default(),
        },
    })
}

fn headers_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<HeaderList> {
    match row.get::<_, Option<String>>(idx)? {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(HeaderList::new()),
    }
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
