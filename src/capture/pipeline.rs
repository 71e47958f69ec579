//! The capture pipeline wired into the proxy engine's hooks

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use std::sync::Arc;
use tracing::debug;

use crate::capture::body::{read_body, BodySide};
use crate::capture::classify::ResourceClassifier;
use crate::capture::correlator::{PendingRequest, TransactionCorrelator};
use crate::capture::observer::CaptureObserver;
use crate::capture::record::TransactionBuilder;
use crate::capture::sink::PersistenceSink;
use crate::config::CaptureConfig;
use crate::proxy::{ProxyBody, ProxyHooks, RequestAction, RequestHead, SessionId};

/// Records every request/response pair that passes through the proxy.
///
/// Capture never changes what the client or the upstream sees: bodies are read and
/// replayed, and every failure is reported to the observer rather than returned.
pub struct CapturePipeline {
    correlator: Arc<TransactionCorrelator>,
    builder: TransactionBuilder,
    classifier: ResourceClassifier,
    sink: Arc<PersistenceSink>,
    observer: Arc<dyn CaptureObserver>,
}

impl CapturePipeline {
    pub fn new(
        config: &CaptureConfig,
        correlator: Arc<TransactionCorrelator>,
        sink: Arc<PersistenceSink>,
        observer: Arc<dyn CaptureObserver>,
    ) -> Self {
        Self {
            correlator,
            builder: TransactionBuilder::new(config.content_length_policy),
            classifier: ResourceClassifier::from_config(config),
            sink,
            observer,
        }
    }

    pub fn correlator(&self) -> &Arc<TransactionCorrelator> {
        &self.correlator
    }

    async fn capture_body(
        &self,
        session: SessionId,
        side: BodySide,
        body: &mut ProxyBody,
    ) -> Bytes {
        match read_body(body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.observer.body_read_failed(session, side, &e);
                Bytes::new()
            }
        }
    }
}

#[async_trait]
impl ProxyHooks for CapturePipeline {
    async fn on_request(
        &self,
        session: SessionId,
        mut request: Request<ProxyBody>,
    ) -> RequestAction {
        let body = self
            .capture_body(session, BodySide::Request, request.body_mut())
            .await;

        if self.correlator.put(session, body).is_some() {
            self.observer.correlation_overwritten(session);
        }

        RequestAction::Forward(request)
    }

    async fn on_response(
        &self,
        session: SessionId,
        request: &RequestHead,
        mut response: Response<ProxyBody>,
    ) -> Response<ProxyBody> {
        let response_body = self
            .capture_body(session, BodySide::Response, response.body_mut())
            .await;

        let pending = self.correlator.take(session).unwrap_or_else(|| {
            self.observer.correlation_miss(session);
            PendingRequest::empty(session)
        });

        let mut record = self.builder.build(
            request,
            &response,
            pending.body,
            response_body,
            pending.started_at,
        );
        record.is_static = self.classifier.classify(&record.extension, &record.content_type);

        self.observer.record_captured(&record);
        self.sink.persist(record);

        response
    }

    async fn on_upstream_failed(&self, session: SessionId, request: &RequestHead) {
        if self.correlator.take(session).is_some() {
            debug!(%session, uri = %request.uri, "Discarded request body of failed exchange");
        }
    }

    async fn on_session_closed(&self, session: SessionId) {
        if self.correlator.abandon(session).is_some() {
            debug!(%session, "Dropped pending request of closed connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::body::BodyError;
    use crate::config::PersistenceConfig;
    use crate::proxy::{full_body, BoxError};
    use crate::storage::MockTransactionStore;
    use futures::stream;
    use http_body_util::{BodyExt, StreamBody};
    use hyper::body::Frame;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct MissCounter {
        misses: AtomicU64,
        overwrites: AtomicU64,
        read_failures: AtomicU64,
    }

    impl CaptureObserver for MissCounter {
        fn body_read_failed(&self, _session: SessionId, _side: BodySide, _error: &BodyError) {
            self.read_failures.fetch_add(1, Ordering::SeqCst);
        }

        fn correlation_miss(&self, _session: SessionId) {
            self.misses.fetch_add(1, Ordering::SeqCst);
        }

        fn correlation_overwritten(&self, _session: SessionId) {
            self.overwrites.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pipeline(store: MockTransactionStore, observer: Arc<MissCounter>) -> CapturePipeline {
        let persistence = PersistenceConfig {
            workers: 1,
            queue_capacity: 16,
            write_timeout_ms: 1000,
        };
        let sink = Arc::new(PersistenceSink::start(
            &persistence,
            true,
            Arc::new(store),
            observer.clone(),
        ));
        CapturePipeline::new(
            &CaptureConfig::default(),
            Arc::new(TransactionCorrelator::new()),
            sink,
            observer,
        )
    }

    fn head(uri: &str) -> RequestHead {
        let request = Request::post(uri).body(()).unwrap();
        RequestHead::from_request(&request, "127.0.0.1:40000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_request_body_is_forwarded_unchanged() {
        let observer = Arc::new(MissCounter::default());
        let pipeline = pipeline(MockTransactionStore::new(), observer);

        let request = Request::post("http://example.com/login")
            .body(full_body("user=a&pass=b"))
            .unwrap();

        let forwarded = match pipeline.on_request(SessionId(1), request).await {
            RequestAction::Forward(request) => request,
            RequestAction::Respond(_) => panic!("capture must not answer requests"),
        };
        let body = forwarded.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"user=a&pass=b");
        assert_eq!(pipeline.correlator().len(), 1);
    }

    #[tokio::test]
    async fn test_response_pairs_with_request_body() {
        let mut store = MockTransactionStore::new();
        store
            .expect_insert()
            .withf(|record| {
                &record.request_body[..] == b"q=1"
                    && &record.response_body[..] == b"{\"ok\":true}"
                    && record.content_type == "application/json"
                    && !record.is_static
            })
            .times(1)
            .returning(|_| Ok(1));

        let observer = Arc::new(MissCounter::default());
        let pipeline = pipeline(store, observer.clone());
        let session = SessionId(3);

        let request = Request::post("http://api.example.com/search")
            .body(full_body("q=1"))
            .unwrap();
        let _ = pipeline.on_request(session, request).await;

        let response = Response::builder()
            .header("content-type", "application/json; charset=utf-8")
            .body(full_body("{\"ok\":true}"))
            .unwrap();
        let response = pipeline
            .on_response(session, &head("http://api.example.com/search"), response)
            .await;

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{\"ok\":true}");
        assert!(pipeline.correlator().is_empty());
        assert_eq!(observer.misses.load(Ordering::SeqCst), 0);

        pipeline.sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_response_without_request_is_still_recorded() {
        let mut store = MockTransactionStore::new();
        store
            .expect_insert()
            .withf(|record| record.request_body.is_empty())
            .times(1)
            .returning(|_| Ok(1));

        let observer = Arc::new(MissCounter::default());
        let pipeline = pipeline(store, observer.clone());

        let response = Response::new(full_body("late"));
        let _ = pipeline
            .on_response(SessionId(9), &head("http://example.com/"), response)
            .await;

        assert_eq!(observer.misses.load(Ordering::SeqCst), 1);
        pipeline.sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_request_overwrites_pending() {
        let observer = Arc::new(MissCounter::default());
        let pipeline = pipeline(MockTransactionStore::new(), observer.clone());

        for body in ["first", "second"] {
            let request = Request::post("http://example.com/")
                .body(full_body(body))
                .unwrap();
            let _ = pipeline.on_request(SessionId(5), request).await;
        }

        assert_eq!(observer.overwrites.load(Ordering::SeqCst), 1);
        let pending = pipeline.correlator().take(SessionId(5)).unwrap();
        assert_eq!(&pending.body[..], b"second");
    }

    #[tokio::test]
    async fn test_closed_session_discards_pending() {
        let observer = Arc::new(MissCounter::default());
        let pipeline = pipeline(MockTransactionStore::new(), observer);

        let request = Request::get("http://example.com/")
            .body(full_body(""))
            .unwrap();
        let _ = pipeline.on_request(SessionId(8), request).await;
        pipeline.on_session_closed(SessionId(8)).await;

        assert!(pipeline.correlator().is_empty());
    }

    fn broken_body(partial: &'static [u8]) -> ProxyBody {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(partial))),
            Err("connection reset by peer".into()),
        ];
        StreamBody::new(stream::iter(frames)).boxed_unsync()
    }

    #[tokio::test]
    async fn test_broken_bodies_are_recorded_empty_and_still_forwarded() {
        let mut store = MockTransactionStore::new();
        store
            .expect_insert()
            .withf(|record| {
                record.request_body.is_empty()
                    && record.response_body.is_empty()
                    && record.path == "/upload"
            })
            .times(1)
            .returning(|_| Ok(1));

        let observer = Arc::new(MissCounter::default());
        let pipeline = pipeline(store, observer.clone());
        let session = SessionId(12);

        let request = Request::post("http://example.com/upload")
            .body(broken_body(b"half-a-form"))
            .unwrap();
        let mut forwarded = match pipeline.on_request(session, request).await {
            RequestAction::Forward(request) => request,
            RequestAction::Respond(_) => panic!("capture must not answer requests"),
        };

        // The forwarder still sees the partial bytes and then the failure
        let body = forwarded.body_mut();
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().ok(), Some(Bytes::from_static(b"half-a-form")));
        assert!(body.frame().await.unwrap().is_err());

        let response = Response::builder()
            .header("content-type", "text/plain")
            .body(broken_body(b"trunc"))
            .unwrap();
        let mut response = pipeline
            .on_response(session, &head("http://example.com/upload"), response)
            .await;

        let body = response.body_mut();
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().ok(), Some(Bytes::from_static(b"trunc")));
        assert!(body.frame().await.unwrap().is_err());

        assert_eq!(observer.read_failures.load(Ordering::SeqCst), 2);
        assert_eq!(observer.misses.load(Ordering::SeqCst), 0);
        pipeline.sink.shutdown().await;
    }
}
