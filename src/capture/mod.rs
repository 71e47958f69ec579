//! Traffic capture
//!
//! Turns each request/response pair seen by the proxy into a [`TransactionRecord`]
//! and stores it asynchronously:
//!
//! - [`body`] drains a body while handing an identical one back to the forwarder
//! - [`correlator`] parks request bodies until the matching response arrives
//! - [`record`] assembles the record, [`classify`] flags static resources
//! - [`sink`] queues records for a pool of storage writers
//! - [`observer`] receives every event that does not affect the proxied traffic

pub mod body;
pub mod classify;
pub mod correlator;
pub mod observer;
pub mod pipeline;
pub mod record;
pub mod sink;

pub use classify::ResourceClassifier;
pub use correlator::TransactionCorrelator;
pub use observer::{CaptureObserver, CaptureStats, DropReason, MetricsObserver};
pub use pipeline::CapturePipeline;
pub use record::{ContentLengthPolicy, TransactionBuilder, TransactionRecord};
pub use sink::PersistenceSink;
