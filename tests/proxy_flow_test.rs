//! End-to-end tests through a running proxy
//!
//! A local origin server, the proxy and a SQLite file in a temp directory; requests go
//! through the proxy and the stored rows are checked afterwards.

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use httptap::capture::{
    CaptureObserver, CapturePipeline, MetricsObserver, PersistenceSink, TransactionCorrelator,
};
use httptap::config::Config;
use httptap::proxy::{ProxyServer, TlsHandler, Upstream};
use httptap::storage::{SqliteStore, TransactionStore};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const SCRIPT_LEN: usize = 120;

async fn origin(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = request.uri().path().to_string();
    let response = match path.as_str() {
        "/app.js" => Response::builder()
            .header("content-type", "application/javascript")
            .body(Full::new(Bytes::from(vec![b'x'; SCRIPT_LEN]))),
        _ => {
            let body = request.into_body().collect().await.unwrap().to_bytes();
            Response::builder()
                .status(201)
                .header("content-type", "application/json; charset=utf-8")
                .header("x-echo-len", body.len().to_string())
                .body(Full::new(Bytes::from(format!("{{\"path\":\"{path}\"}}"))))
        }
    };
    Ok(response.unwrap())
}

async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(origin))
                    .await;
            });
        }
    });
    addr
}

struct Harness {
    _temp_dir: TempDir,
    store: SqliteStore,
    metrics: Arc<MetricsObserver>,
    sink: Arc<PersistenceSink>,
    proxy_addr: SocketAddr,
    ca_pem: Option<String>,
    shutdown: broadcast::Sender<()>,
    server: JoinHandle<httptap::error::Result<()>>,
}

impl Harness {
    async fn start(mitm: bool) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.persistence.workers = 2;
        config.persistence.queue_capacity = 64;

        let store = SqliteStore::open(temp_dir.path().join("capture.db")).unwrap();
        let metrics = Arc::new(MetricsObserver::new());
        let observer: Arc<dyn CaptureObserver> = metrics.clone();
        let sink = Arc::new(PersistenceSink::start(
            &config.persistence,
            config.capture.record_static,
            Arc::new(store.clone()),
            observer.clone(),
        ));
        let pipeline = Arc::new(CapturePipeline::new(
            &config.capture,
            Arc::new(TransactionCorrelator::new()),
            sink.clone(),
            observer,
        ));

        let tls = if mitm {
            Some(Arc::new(
                TlsHandler::new(Some(temp_dir.path().join("ca"))).unwrap(),
            ))
        } else {
            None
        };
        let ca_pem = tls.as_ref().map(|tls| tls.ca_cert_pem().to_string());

        let upstream = Upstream::new(Duration::from_secs(5)).unwrap();
        let server = Arc::new(ProxyServer::new(pipeline, upstream, tls, true));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(server.serve(listener, shutdown_rx));

        Self {
            _temp_dir: temp_dir,
            store,
            metrics,
            sink,
            proxy_addr,
            ca_pem,
            shutdown,
            server,
        }
    }

    fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://{}", self.proxy_addr)).unwrap())
            .pool_max_idle_per_host(0)
            .build()
            .unwrap()
    }

    async fn stop(self) -> (TempDir, SqliteStore, Arc<MetricsObserver>) {
        let _ = self.shutdown.send(());
        self.server.await.unwrap().unwrap();
        self.sink.shutdown().await;
        (self._temp_dir, self.store, self.metrics)
    }
}

#[tokio::test]
async fn test_static_resource_recorded_without_body() {
    let origin = spawn_origin().await;
    let harness = Harness::start(false).await;

    let response = harness
        .client()
        .get(format!("http://{origin}/app.js"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().len(), SCRIPT_LEN);

    let (_dir, store, metrics) = harness.stop().await;
    let rows = store.recent(10).await.unwrap();
    assert_eq!(rows.len(), 1);

    let record = &rows[0].record;
    assert!(record.is_static);
    assert_eq!(record.extension, "js");
    assert_eq!(record.content_type, "application/javascript");
    assert_eq!(record.content_length, SCRIPT_LEN as u64);
    assert!(record.response_body.is_empty());
    assert_eq!(record.method, "GET");
    assert_eq!(record.host, "127.0.0.1");
    assert_eq!(record.port, origin.port().to_string());
    assert_eq!(record.url, format!("http://{origin}/app.js"));
    assert_eq!(metrics.snapshot().persisted, 1);
}

#[tokio::test]
async fn test_request_and_response_bodies_recorded() {
    let origin = spawn_origin().await;
    let harness = Harness::start(false).await;

    let response = harness
        .client()
        .post(format!("http://{origin}/api/items?page=2"))
        .body("name=widget")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.headers()["x-echo-len"], "11");
    let body = response.bytes().await.unwrap();

    let (_dir, store, _) = harness.stop().await;
    let rows = store.recent(10).await.unwrap();
    assert_eq!(rows.len(), 1);

    let record = &rows[0].record;
    assert!(!record.is_static);
    assert_eq!(record.status, 201);
    assert_eq!(record.path, "/api/items");
    assert_eq!(record.content_type, "application/json");
    assert_eq!(&record.request_body[..], b"name=widget");
    assert_eq!(record.response_body, body);
    assert_eq!(record.response_headers["x-echo-len"], vec!["11".to_string()]);
    assert!(record.ended_at >= record.started_at);
}

#[tokio::test]
async fn test_unreachable_upstream_returns_bad_gateway() {
    // Bind and drop to get a port nothing listens on
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let harness = Harness::start(false).await;

    let response = harness
        .client()
        .get(format!("http://{closed}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    let (_dir, store, metrics) = harness.stop().await;
    assert!(store.recent(10).await.unwrap().is_empty());
    assert_eq!(metrics.snapshot().captured, 0);
}

#[tokio::test]
async fn test_origin_form_request_rejected() {
    let harness = Harness::start(false).await;

    let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 400"));

    harness.stop().await;
}

#[tokio::test]
async fn test_connect_without_mitm_is_tunneled() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
    });

    let harness = Harness::start(false).await;
    let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut head = vec![0u8; 256];
    let n = stream.read(&mut head).await.unwrap();
    assert!(String::from_utf8_lossy(&head[..n]).starts_with("HTTP/1.1 200"));

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    drop(stream);

    let (_dir, store, _) = harness.stop().await;
    assert!(store.recent(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_with_mitm_terminates_tls() {
    let harness = Harness::start(true).await;
    let ca_pem = harness.ca_pem.clone().unwrap();

    let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    stream
        .write_all(b"CONNECT unreachable.invalid:443 HTTP/1.1\r\nHost: unreachable.invalid:443\r\n\r\n")
        .await
        .unwrap();
    let mut head = vec![0u8; 256];
    let n = stream.read(&mut head).await.unwrap();
    assert!(String::from_utf8_lossy(&head[..n]).starts_with("HTTP/1.1 200"));

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let server_name = rustls::pki_types::ServerName::try_from("unreachable.invalid").unwrap();

    // The handshake only succeeds if the proxy presents a certificate signed by its CA
    let mut tls = connector.connect(server_name, stream).await.unwrap();
    tls.write_all(
        b"GET /secure HTTP/1.1\r\nHost: unreachable.invalid\r\nConnection: close\r\n\r\n",
    )
    .await
    .unwrap();

    let mut reply = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), tls.read_to_end(&mut reply)).await;
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 502"));

    drop(tls);
    let (_dir, store, _) = harness.stop().await;
    assert!(store.recent(10).await.unwrap().is_empty());
}
