//! Transaction records and how they are assembled from a finished exchange

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::capture::classify::strip_params;
use crate::proxy::RequestHead;

/// Header name -> every value sent under that name, in arrival order
pub type HeaderList = BTreeMap<String, Vec<String>>;

/// One complete request/response exchange, as written to storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub origin: String,
    pub method: String,
    pub status: u16,
    pub content_type: String,
    pub content_length: u64,
    pub host: String,
    pub port: String,
    pub url: String,
    pub scheme: String,
    pub path: String,
    pub extension: String,
    pub response_headers: HeaderList,
    pub response_body: Bytes,
    pub request_headers: HeaderList,
    pub request_body: Bytes,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    pub is_static: bool,
}

impl TransactionRecord {
    pub fn elapsed(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}

/// Where `content_length` comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentLengthPolicy {
    /// The `Content-Length` header only; 0 when absent or malformed
    #[default]
    Header,
    /// The header when usable, otherwise the number of body bytes captured
    HeaderOrBody,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionBuilder {
    content_length_policy: ContentLengthPolicy,
}

impl TransactionBuilder {
    pub fn new(content_length_policy: ContentLengthPolicy) -> Self {
        Self {
            content_length_policy,
        }
    }

    /// Assemble the record for a finished exchange. The end timestamp is taken now.
    pub fn build<B>(
        &self,
        request: &RequestHead,
        response: &Response<B>,
        request_body: Bytes,
        response_body: Bytes,
        started_at: DateTime<Utc>,
    ) -> TransactionRecord {
        let ended_at = Utc::now();
        let scheme = request.uri.scheme_str().unwrap_or("http").to_string();
        let authority = request
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                request
                    .headers
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let (host, port) = host_and_port(&authority, &scheme);
        let path = request.uri.path().to_string();

        let content_length = match (
            content_length_of(response.headers()),
            self.content_length_policy,
        ) {
            (Some(len), _) => len,
            (None, ContentLengthPolicy::HeaderOrBody) => response_body.len() as u64,
            (None, ContentLengthPolicy::Header) => 0,
        };

        TransactionRecord {
            origin: request.client_addr.to_string(),
            method: request.method.to_string(),
            status: response.status().as_u16(),
            content_type: content_type_of(response.headers()),
            content_length,
            host,
            port,
            url: request.uri.to_string(),
            scheme,
            extension: extension_of(&path),
            path,
            response_headers: header_list(response.headers()),
            response_body,
            request_headers: header_list(&request.headers),
            request_body,
            started_at,
            ended_at,
            elapsed_ms: (ended_at - started_at).num_milliseconds(),
            is_static: false,
        }
    }
}

/// Split an authority into host and port, defaulting the port from the scheme.
pub fn host_and_port(authority: &str, scheme: &str) -> (String, String) {
    let authority = authority
        .rsplit_once('@')
        .map(|(_, rest)| rest)
        .unwrap_or(authority);

    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (host.to_string(), port.to_string())
        }
        _ => {
            let port = if scheme.eq_ignore_ascii_case("https") {
                "443"
            } else {
                "80"
            };
            (authority.to_string(), port.to_string())
        }
    }
}

/// Extension of the last path segment, without the dot; empty when there is none.
pub fn extension_of(path: &str) -> String {
    let segment = path.rsplit('/').next().unwrap_or_default();
    segment
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_string())
        .unwrap_or_default()
}

/// First `Content-Type` value with its parameters stripped.
pub fn content_type_of(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .map(|v| strip_params(&String::from_utf8_lossy(v.as_bytes())).to_string())
        .unwrap_or_default()
}

pub fn content_length_of(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

pub fn header_list(headers: &HeaderMap) -> HeaderList {
    let mut list = HeaderList::new();
    for (name, value) in headers {
        list.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    list
}
