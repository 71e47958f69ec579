//! Forward proxy engine and the hook boundary the capture pipeline plugs into
//!
//! The engine owns connections, TLS interception and upstream forwarding. Everything
//! it knows about capture goes through [`ProxyHooks`]: one call before a request is
//! forwarded, one call after the upstream response arrives, both carrying the same
//! [`SessionId`].

pub mod server;
pub mod tls;
pub mod upstream;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};
use std::fmt;
use std::net::SocketAddr;

pub use server::ProxyServer;
pub use tls::TlsHandler;
pub use upstream::Upstream;

/// Error type carried by proxied bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the hooks, in both directions
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Opaque identifier of one client connection
///
/// HTTP/1.1 exchanges on a connection are sequential, so the identifier names a
/// single in-flight exchange at any instant and is reused by the next one once the
/// previous response has been handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of the request line and headers, kept by the engine so the response
/// hook can see what was asked for.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_addr: SocketAddr,
}

impl RequestHead {
    pub fn from_request<B>(request: &Request<B>, client_addr: SocketAddr) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            client_addr,
        }
    }
}

/// Outcome of the request hook
pub enum RequestAction {
    /// Forward the (possibly modified) request upstream
    Forward(Request<ProxyBody>),
    /// Answer the client directly without contacting the upstream
    Respond(Response<ProxyBody>),
}

/// Extension points exposed by the proxy engine
#[async_trait]
pub trait ProxyHooks: Send + Sync {
    /// Called with every request before it is forwarded
    async fn on_request(&self, session: SessionId, request: Request<ProxyBody>) -> RequestAction;

    /// Called with every upstream response before it is returned to the client
    async fn on_response(
        &self,
        session: SessionId,
        request: &RequestHead,
        response: Response<ProxyBody>,
    ) -> Response<ProxyBody>;

    /// Called instead of `on_response` when the upstream could not be reached; the
    /// client receives `502 Bad Gateway`
    async fn on_upstream_failed(&self, _session: SessionId, _request: &RequestHead) {}

    /// Called once the client connection behind `session` is gone
    async fn on_session_closed(&self, _session: SessionId) {}
}
