//! Observability for the capture pipeline
//!
//! Nothing in the pipeline is allowed to fail the proxied exchange, so every problem
//! it runs into ends up here instead of in a return value.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

use crate::capture::body::{BodyError, BodySide};
use crate::capture::record::TransactionRecord;
use crate::proxy::SessionId;

/// Why a finished record never reached storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    QueueFull,
    StorageFailed,
    Timeout,
    Shutdown,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue_full",
            DropReason::StorageFailed => "storage_failed",
            DropReason::Timeout => "timeout",
            DropReason::Shutdown => "shutdown",
        }
    }
}

/// Receives pipeline events. Every method defaults to doing nothing.
pub trait CaptureObserver: Send + Sync {
    fn body_read_failed(&self, _session: SessionId, _side: BodySide, _error: &BodyError) {}

    fn correlation_miss(&self, _session: SessionId) {}

    fn correlation_overwritten(&self, _session: SessionId) {}

    fn record_captured(&self, _record: &TransactionRecord) {}

    /// Static record skipped because static recording is turned off
    fn record_skipped(&self, _record: &TransactionRecord) {}

    fn record_persisted(&self, _id: i64, _record: &TransactionRecord, _write_time: Duration) {}

    fn record_dropped(&self, _reason: DropReason, _url: &str, _detail: &str) {}
}

/// Point-in-time copy of the counters, for logging and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub captured: u64,
    pub static_records: u64,
    pub skipped: u64,
    pub persisted: u64,
    pub dropped: u64,
    pub correlation_misses: u64,
    pub correlation_overwrites: u64,
    pub body_read_failures: u64,
}

/// Observer backed by a prometheus registry, logging each event through `tracing`
pub struct MetricsObserver {
    registry: Registry,
    captured: IntCounter,
    static_records: IntCounter,
    skipped: IntCounter,
    persisted: IntCounter,
    dropped: IntCounterVec,
    correlation_misses: IntCounter,
    correlation_overwrites: IntCounter,
    body_read_failures: IntCounterVec,
    last_record_id: IntGauge,
    write_duration: Histogram,
}

impl Default for MetricsObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsObserver {
    pub fn new() -> Self {
        let registry = Registry::new();

        let captured = IntCounter::new(
            "httptap_transactions_captured_total",
            "Transactions assembled from a request/response pair",
        )
        .expect("metric creation failed");
        let static_records = IntCounter::new(
            "httptap_static_transactions_total",
            "Transactions classified as static resources",
        )
        .expect("metric creation failed");
        let skipped = IntCounter::new(
            "httptap_transactions_skipped_total",
            "Static transactions not recorded",
        )
        .expect("metric creation failed");
        let persisted = IntCounter::new(
            "httptap_transactions_persisted_total",
            "Transactions written to storage",
        )
        .expect("metric creation failed");
        let dropped = IntCounterVec::new(
            Opts::new(
                "httptap_transactions_dropped_total",
                "Transactions that never reached storage",
            ),
            &["reason"],
        )
        .expect("metric creation failed");
        let correlation_misses = IntCounter::new(
            "httptap_correlation_misses_total",
            "Responses without a captured request body",
        )
        .expect("metric creation failed");
        let correlation_overwrites = IntCounter::new(
            "httptap_correlation_overwrites_total",
            "Request bodies displaced before their response arrived",
        )
        .expect("metric creation failed");
        let body_read_failures = IntCounterVec::new(
            Opts::new("httptap_body_read_failures_total", "Bodies that failed to read"),
            &["side"],
        )
        .expect("metric creation failed");
        let last_record_id = IntGauge::new(
            "httptap_last_record_id",
            "Storage key of the most recently written transaction",
        )
        .expect("metric creation failed");
        let write_duration = Histogram::with_opts(HistogramOpts::new(
            "httptap_write_duration_seconds",
            "Time spent writing one transaction",
        ))
        .expect("metric creation failed");

        registry
            .register(Box::new(captured.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(static_records.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(skipped.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(persisted.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(dropped.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(correlation_misses.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(correlation_overwrites.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(body_read_failures.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(last_record_id.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(write_duration.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            captured,
            static_records,
            skipped,
            persisted,
            dropped,
            correlation_misses,
            correlation_overwrites,
            body_read_failures,
            last_record_id,
            write_duration,
        }
    }

    /// Prometheus text exposition of every metric
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn snapshot(&self) -> CaptureStats {
        let dropped = [
            DropReason::QueueFull,
            DropReason::StorageFailed,
            DropReason::Timeout,
            DropReason::Shutdown,
        ]
        .iter()
        .map(|r| self.dropped.with_label_values(&[r.as_str()]).get())
        .sum();
        let body_read_failures = [BodySide::Request, BodySide::Response]
            .iter()
            .map(|s| self.body_read_failures.with_label_values(&[s.as_str()]).get())
            .sum();

        CaptureStats {
            captured: self.captured.get(),
            static_records: self.static_records.get(),
            skipped: self.skipped.get(),
            persisted: self.persisted.get(),
            dropped,
            correlation_misses: self.correlation_misses.get(),
            correlation_overwrites: self.correlation_overwrites.get(),
            body_read_failures,
        }
    }
}

impl CaptureObserver for MetricsObserver {
    fn body_read_failed(&self, session: SessionId, side: BodySide, error: &BodyError) {
        self.body_read_failures
            .with_label_values(&[side.as_str()])
            .inc();
        tracing::warn!(%session, side = side.as_str(), error = %error, "Body read failed, capturing empty body");
    }

    fn correlation_miss(&self, session: SessionId) {
        self.correlation_misses.inc();
        tracing::debug!(%session, "No captured request body for response");
    }

    fn correlation_overwritten(&self, session: SessionId) {
        self.correlation_overwrites.inc();
        tracing::warn!(%session, "Pending request body replaced before its response arrived");
    }

    fn record_captured(&self, record: &TransactionRecord) {
        self.captured.inc();
        if record.is_static {
            self.static_records.inc();
        }
        tracing::debug!(
            method = %record.method,
            url = %record.url,
            status = record.status,
            content_length = record.content_length,
            is_static = record.is_static,
            elapsed_ms = record.elapsed_ms,
            "Captured transaction"
        );
    }

    fn record_skipped(&self, record: &TransactionRecord) {
        self.skipped.inc();
        tracing::trace!(url = %record.url, "Skipped static transaction");
    }

    fn record_persisted(&self, id: i64, record: &TransactionRecord, write_time: Duration) {
        self.persisted.inc();
        self.last_record_id.set(id);
        self.write_duration.observe(write_time.as_secs_f64());
        tracing::trace!(id, url = %record.url, write_ms = write_time.as_millis() as u64, "Stored transaction");
    }

    fn record_dropped(&self, reason: DropReason, url: &str, detail: &str) {
        self.dropped.with_label_values(&[reason.as_str()]).inc();
        tracing::warn!(reason = reason.as_str(), url, detail, "Dropped transaction");
    }
}
