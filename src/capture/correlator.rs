//! Request/response correlation by session identifier
//!
//! The request hook and the response hook of one exchange run as two separate calls.
//! The correlator parks the request body under the session identifier in between.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::proxy::SessionId;

/// A captured request body waiting for its response
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub session: SessionId,
    pub body: Bytes,
    pub started_at: DateTime<Utc>,
}

impl PendingRequest {
    /// Stand-in used when a response shows up with nothing parked for it
    pub fn empty(session: SessionId) -> Self {
        Self {
            session,
            body: Bytes::new(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TransactionCorrelator {
    pending: DashMap<SessionId, PendingRequest>,
}

impl TransactionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `body` for `session`, returning whatever entry it displaced.
    pub fn put(&self, session: SessionId, body: Bytes) -> Option<PendingRequest> {
        self.pending.insert(
            session,
            PendingRequest {
                session,
                body,
                started_at: Utc::now(),
            },
        )
    }

    /// Remove and return the entry for `session`.
    pub fn take(&self, session: SessionId) -> Option<PendingRequest> {
        self.pending.remove(&session).map(|(_, pending)| pending)
    }

    /// Remove and return the parked body for `session`; empty when nothing is parked.
    pub fn take_and_remove(&self, session: SessionId) -> Bytes {
        self.take(session).map(|p| p.body).unwrap_or_default()
    }

    /// Drop the entry of a session whose connection went away.
    pub fn abandon(&self, session: SessionId) -> Option<PendingRequest> {
        self.take(session)
    }

    /// Drop every entry created before `cutoff`, returning how many were removed.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.started_at >= cutoff);
        before.saturating_sub(self.pending.len())
    }

    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        match cutoff {
            Some(cutoff) => self.evict_older_than(cutoff),
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Periodically evict entries whose response never arrived.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        ttl: Duration,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = correlator.evict_expired(ttl);
                        if evicted > 0 {
                            tracing::warn!(
                                evicted,
                                ttl_secs = ttl.as_secs(),
                                remaining = correlator.len(),
                                "Evicted pending requests without a response"
                            );
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
