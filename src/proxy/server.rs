//! HTTP/1.1 forward proxy with optional CONNECT interception

use http::uri::Authority;
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::tls::TlsHandler;
use super::upstream::{error_response, Upstream};
use super::{
    empty_body, BoxError, ProxyBody, ProxyHooks, RequestAction, RequestHead, SessionId,
};
use crate::error::{ProxyError, Result};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProxyServer {
    hooks: Arc<dyn ProxyHooks>,
    upstream: Upstream,
    /// Present when CONNECT tunnels are intercepted
    tls: Option<Arc<TlsHandler>>,
    verbose: bool,
    next_session: AtomicU64,
    active_connections: AtomicUsize,
}

impl ProxyServer {
    pub fn new(
        hooks: Arc<dyn ProxyHooks>,
        upstream: Upstream,
        tls: Option<Arc<TlsHandler>>,
        verbose: bool,
    ) -> Self {
        Self {
            hooks,
            upstream,
            tls,
            verbose,
            next_session: AtomicU64::new(1),
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Bind `addr` and serve until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections from an already bound listener until `shutdown` fires
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            mitm = self.tls.is_some(),
            "Proxy listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!(%client_addr, error = %e, "Failed to set TCP_NODELAY");
                            }
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.serve_connection(stream, client_addr).await;
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Proxy received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        let drain_start = Instant::now();
        while self.active_connections.load(Ordering::Relaxed) > 0
            && drain_start.elapsed() < DRAIN_TIMEOUT
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.active_connections.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!(remaining, "Proxy stopped with connections still open");
        }

        info!("Proxy stopped");
        Ok(())
    }

    fn next_session(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, client_addr: SocketAddr) {
        let session = self.next_session();
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        debug!(%session, %client_addr, "Client connected");

        let server = Arc::clone(&self);
        let service = service_fn(move |request: Request<Incoming>| {
            let server = Arc::clone(&server);
            async move { Ok::<_, Infallible>(server.dispatch(session, client_addr, request).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!(%session, %client_addr, error = %e, "Client connection ended with error");
        }

        self.hooks.on_session_closed(session).await;
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    async fn dispatch(
        self: Arc<Self>,
        session: SessionId,
        client_addr: SocketAddr,
        request: Request<Incoming>,
    ) -> Response<ProxyBody> {
        if request.method() == Method::CONNECT {
            return self.connect(client_addr, request);
        }

        if request.uri().scheme().is_none() || request.uri().authority().is_none() {
            return error_response(
                StatusCode::BAD_REQUEST,
                "This is a proxy; requests must use an absolute URI",
            );
        }

        self.exchange(session, client_addr, boxed(request)).await
    }

    /// One request/response exchange through the hooks and the upstream
    async fn exchange(
        &self,
        session: SessionId,
        client_addr: SocketAddr,
        request: Request<ProxyBody>,
    ) -> Response<ProxyBody> {
        if self.verbose {
            info!(
                %session,
                %client_addr,
                method = %request.method(),
                uri = %request.uri(),
                "Proxying request"
            );
        }

        let request = match self.hooks.on_request(session, request).await {
            RequestAction::Forward(request) => request,
            RequestAction::Respond(response) => return response,
        };
        let head = RequestHead::from_request(&request, client_addr);

        match self.upstream.forward(request).await {
            Ok(response) => self.hooks.on_response(session, &head, response).await,
            Err(e) => {
                warn!(%session, uri = %head.uri, error = %e, "Upstream request failed");
                self.hooks.on_upstream_failed(session, &head).await;
                error_response(StatusCode::BAD_GATEWAY, &e.to_string())
            }
        }
    }

    fn connect(self: Arc<Self>, client_addr: SocketAddr, request: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = request.uri().authority().cloned() else {
            return error_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
        };

        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(request).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(%authority, error = %e, "CONNECT upgrade failed");
                    return;
                }
            };

            let result = match self.tls.clone() {
                Some(tls) => self.intercept(tls, upgraded, authority.clone(), client_addr).await,
                None => tunnel(upgraded, &authority).await,
            };
            if let Err(e) = result {
                debug!(%authority, %client_addr, error = %e, "CONNECT tunnel closed with error");
            }
        });

        Response::new(empty_body())
    }

    /// Terminate TLS on the upgraded connection and serve the inner requests as
    /// `https://` exchanges
    async fn intercept(
        self: Arc<Self>,
        tls: Arc<TlsHandler>,
        upgraded: Upgraded,
        authority: Authority,
        client_addr: SocketAddr,
    ) -> Result<()> {
        let acceptor = TlsAcceptor::from(tls.get_server_config(authority.host())?);
        let stream = acceptor.accept(TokioIo::new(upgraded)).await?;

        let session = self.next_session();
        debug!(
            %session,
            %authority,
            cached_certs = tls.cached_hosts(),
            "Intercepting TLS tunnel"
        );

        let server = Arc::clone(&self);
        let service = service_fn(move |request: Request<Incoming>| {
            let server = Arc::clone(&server);
            let authority = authority.clone();
            async move {
                let mut request = boxed(request);
                match intercepted_uri(&authority, request.uri()) {
                    Ok(uri) => *request.uri_mut() = uri,
                    Err(e) => {
                        return Ok::<_, Infallible>(error_response(
                            StatusCode::BAD_REQUEST,
                            &e.to_string(),
                        ))
                    }
                }
                Ok(server.exchange(session, client_addr, request).await)
            }
        });

        let served = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await;
        self.hooks.on_session_closed(session).await;

        served.map_err(|e| ProxyError::Server(e.to_string()))
    }
}

async fn tunnel(upgraded: Upgraded, authority: &Authority) -> Result<()> {
    let target = match authority.port_u16() {
        Some(_) => authority.as_str().to_string(),
        None => format!("{}:443", authority.host()),
    };
    let mut origin = TcpStream::connect(target).await?;
    let mut client = TokioIo::new(upgraded);

    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut origin).await?;
    debug!(%authority, sent, received, "Tunnel closed");
    Ok(())
}

fn boxed(request: Request<Incoming>) -> Request<ProxyBody> {
    request.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed_unsync())
}

/// Absolute `https://` URI for a request received inside an intercepted tunnel
pub fn intercepted_uri(authority: &Authority, uri: &Uri) -> std::result::Result<Uri, http::Error> {
    let host = match authority.port_u16() {
        Some(443) | None => authority.host().to_string(),
        Some(port) => format!("{}:{}", authority.host(), port),
    };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Uri::builder()
        .scheme("https")
        .authority(host)
        .path_and_query(path_and_query)
        .build()
}
