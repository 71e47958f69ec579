//! Hands finished records to a fixed pool of writer tasks
//!
//! The queue is bounded and `persist` never waits on it: when every slot is taken the
//! record is dropped and reported, so a slow database cannot stall proxied traffic.
//!
//! The write deadline is the store's own busy timeout, so a write that gives up has
//! rolled back and released its connection before the worker takes the next record.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capture::observer::{CaptureObserver, DropReason};
use crate::capture::record::TransactionRecord;
use crate::config::PersistenceConfig;
use crate::storage::{StorageError, TransactionStore};

type SharedReceiver = Arc<Mutex<mpsc::Receiver<TransactionRecord>>>;

pub struct PersistenceSink {
    sender: mpsc::Sender<TransactionRecord>,
    record_static: bool,
    observer: Arc<dyn CaptureObserver>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistenceSink {
    /// Spawn the writer pool. Must be called inside a tokio runtime.
    pub fn start(
        config: &PersistenceConfig,
        record_static: bool,
        store: Arc<dyn TransactionStore>,
        observer: Arc<dyn CaptureObserver>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver: SharedReceiver = Arc::new(Mutex::new(receiver));
        let cancel = CancellationToken::new();

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(write_loop(
                    worker,
                    receiver.clone(),
                    store.clone(),
                    observer.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            record_static,
            "Persistence sink started"
        );

        Self {
            sender,
            record_static,
            observer,
            cancel,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a record for storage and return immediately.
    ///
    /// Static records lose their response body first, or are skipped entirely when
    /// static recording is off.
    pub fn persist(&self, mut record: TransactionRecord) {
        if record.is_static {
            if !self.record_static {
                self.observer.record_skipped(&record);
                return;
            }
            record.response_body = Bytes::new();
        }

        if let Err(e) = self.sender.try_send(record) {
            let (reason, record) = match e {
                mpsc::error::TrySendError::Full(record) => (DropReason::QueueFull, record),
                mpsc::error::TrySendError::Closed(record) => (DropReason::Shutdown, record),
            };
            self.observer
                .record_dropped(reason, &record.url, "persistence queue unavailable");
        }
    }

    /// Records waiting for a writer
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Stop accepting records, let the writers drain what is queued, and wait for them
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Persistence worker panicked");
            }
        }
        info!("Persistence sink stopped");
    }
}

async fn write_loop(
    worker: usize,
    receiver: SharedReceiver,
    store: Arc<dyn TransactionStore>,
    observer: Arc<dyn CaptureObserver>,
    cancel: CancellationToken,
) {
    debug!(worker, "Persistence worker started");

    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                record = rx.recv() => record,
                _ = cancel.cancelled() => {
                    rx.close();
                    rx.recv().await
                }
            }
        };

        let Some(record) = next else { break };

        let started = Instant::now();
        match store.insert(&record).await {
            Ok(id) => observer.record_persisted(id, &record, started.elapsed()),
            Err(e @ StorageError::Busy(_)) => {
                observer.record_dropped(DropReason::Timeout, &record.url, &e.to_string())
            }
            Err(e) => {
                observer.record_dropped(DropReason::StorageFailed, &record.url, &e.to_string())
            }
        }
    }

    debug!(worker, "Persistence worker stopped");
}
