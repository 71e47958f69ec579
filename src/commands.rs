use serde::Serialize;
use std::io::Write;
use tracing::info;

use crate::capture::record::HeaderList;
use crate::config::Config;
use crate::error::Result;
use crate::proxy::TlsHandler;
use crate::storage::{SqliteStore, StoredTransaction, TransactionStore};

/// A stored transaction without its bodies, one per output line
#[derive(Debug, Serialize)]
pub struct TransactionSummary<'a> {
    pub id: i64,
    pub date_start: String,
    pub method: &'a str,
    pub url: &'a str,
    pub status: u16,
    pub content_type: &'a str,
    pub content_length: u64,
    pub is_static: bool,
    pub elapsed_ms: i64,
    pub origin: &'a str,
    pub request_bytes: usize,
    pub response_bytes: usize,
    pub response_headers: &'a HeaderList,
}

impl<'a> From<&'a StoredTransaction> for TransactionSummary<'a> {
    fn from(stored: &'a StoredTransaction) -> Self {
        let record = &stored.record;
        Self {
            id: stored.id,
            date_start: record.started_at.to_rfc3339(),
            method: &record.method,
            url: &record.url,
            status: record.status,
            content_type: &record.content_type,
            content_length: record.content_length,
            is_static: record.is_static,
            elapsed_ms: record.elapsed_ms,
            origin: &record.origin,
            request_bytes: record.request_body.len(),
            response_bytes: record.response_body.len(),
            response_headers: &record.response_headers,
        }
    }
}

/// Print the most recent transactions as JSON lines, newest first
pub async fn print_recent(config: &Config, limit: usize, out: &mut impl Write) -> Result<()> {
    let store = SqliteStore::open(&config.database)?;
    let rows = store.recent(limit).await?;

    for stored in &rows {
        serde_json::to_writer(&mut *out, &TransactionSummary::from(stored))?;
        writeln!(out)?;
    }
    Ok(())
}

/// Print the root CA certificate so it can be installed in a trust store
pub fn print_ca(config: &Config, out: &mut impl Write) -> Result<()> {
    let tls = TlsHandler::new(config.tls.ca_dir.clone())?;
    info!(path = %tls.ca_cert_path().display(), "Root CA certificate");
    out.write_all(tls.ca_cert_pem().as_bytes())?;
    Ok(())
}

/// Validate the configuration and make sure the database is usable
pub async fn run_config_check(config: &Config) -> Result<()> {
    info!("Checking configuration...");
    crate::config::validate(config)?;
    info!(listen = %config.listen_addr()?, "Configuration is valid");

    let store = SqliteStore::open(&config.database)?;
    let recent = store.recent(1).await?;
    info!(
        database = %store.path().display(),
        last_id = ?recent.first().map(|t| t.id),
        "Database is reachable"
    );

    if config.tls.mitm {
        let tls = TlsHandler::new(config.tls.ca_dir.clone())?;
        info!(path = %tls.ca_cert_path().display(), "CA certificate is available");
    }

    info!("All checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::record::TransactionRecord;
    use bytes::Bytes;
    use chrono::Utc;
    use tempfile::TempDir;

    fn config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.database = temp_dir
            .path()
            .join("capture.db")
            .to_string_lossy()
            .into_owned();
        config.tls.ca_dir = Some(temp_dir.path().join("ca"));
        config
    }

    #[tokio::test]
    async fn test_print_recent_omits_bodies() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = config(&temp_dir);
        let store = SqliteStore::open(&config.database).unwrap();

        let now = Utc::now();
        let record = TransactionRecord {
            origin: "127.0.0.1:1".to_string(),
            method: "POST".to_string(),
            status: 201,
            content_type: "application/json".to_string(),
            content_length: 2,
            host: "example.com".to_string(),
            port: "80".to_string(),
            url: "http://example.com/items".to_string(),
            scheme: "http".to_string(),
            path: "/items".to_string(),
            extension: String::new(),
            response_headers: HeaderList::new(),
            response_body: Bytes::from_static(b"{}"),
            request_headers: HeaderList::new(),
            request_body: Bytes::from_static(b"secret-payload"),
            started_at: now,
            ended_at: now,
            elapsed_ms: 0,
            is_static: false,
        };
        store.insert(&record).await.unwrap();

        let mut out = Vec::new();
        print_recent(&config, 10, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("\"status\":201"));
        assert!(text.contains("\"request_bytes\":14"));
        assert!(!text.contains("secret-payload"));
    }

    #[test]
    fn test_print_ca() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut out = Vec::new();
        print_ca(&config(&temp_dir), &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn test_config_check() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        assert!(run_config_check(&config(&temp_dir)).await.is_ok());
    }
}
