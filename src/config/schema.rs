use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::capture::classify::{MEDIA_FAMILIES, STATIC_CONTENT_TYPES, STATIC_EXTENSIONS};
use crate::capture::record::ContentLengthPolicy;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Proxy listen address; `:8080` binds every interface
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Log every proxied request
    #[serde(default)]
    pub verbose: bool,
    /// SQLite database file holding captured transactions
    #[serde(default = "default_database")]
    pub database: String,
    /// Whole-exchange timeout for upstream requests
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_ms: u64,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// Store static resources (without their body); when false they are skipped
    #[serde(default = "default_true")]
    pub record_static: bool,
    #[serde(default)]
    pub content_length_policy: ContentLengthPolicy,
    #[serde(default = "default_static_extensions")]
    pub static_extensions: Vec<String>,
    #[serde(default = "default_static_content_types")]
    pub static_content_types: Vec<String>,
    #[serde(default = "default_media_families")]
    pub media_families: Vec<String>,
    /// Request bodies still waiting for a response after this long are dropped
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    /// Writer tasks, and so the maximum number of open database connections
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Records waiting for a writer; further records are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long a write waits for the database lock before the record is dropped
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Intercept CONNECT tunnels; when false they are relayed without capture
    #[serde(default = "default_true")]
    pub mitm: bool,
    /// Directory holding ca.crt and ca.key (defaults to ~/.httptap)
    #[serde(default)]
    pub ca_dir: Option<PathBuf>,
}

fn default_listen() -> String {
    ":8080".to_string()
}

fn default_database() -> String {
    "httptap.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_static_extensions() -> Vec<String> {
    STATIC_EXTENSIONS.iter().map(|s| s.to_string()).collect()
}

fn default_static_content_types() -> Vec<String> {
    STATIC_CONTENT_TYPES.iter().map(|s| s.to_string()).collect()
}

fn default_media_families() -> Vec<String> {
    MEDIA_FAMILIES.iter().map(|s| s.to_string()).collect()
}

fn default_pending_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_workers() -> usize {
    num_cpus::get().clamp(2, 8)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_write_timeout() -> u64 {
    30000
}

fn default_upstream_timeout() -> u64 {
    60000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            verbose: false,
            database: default_database(),
            upstream_timeout_ms: default_upstream_timeout(),
            capture: CaptureConfig::default(),
            persistence: PersistenceConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            record_static: true,
            content_length_policy: ContentLengthPolicy::default(),
            static_extensions: default_static_extensions(),
            static_content_types: default_static_content_types(),
            media_families: default_media_families(),
            pending_ttl_secs: default_pending_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mitm: true,
            ca_dir: None,
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let listen = if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        };
        listen.parse().map_err(|e| {
            ConfigError::Validation(format!("Invalid listen address '{}': {}", self.listen, e))
                .into()
        })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}

impl CaptureConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl PersistenceConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
