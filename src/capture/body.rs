//! Draining a streaming body without taking it away from the forwarder

use bytes::{Bytes, BytesMut};
use futures::stream;
use http::HeaderMap;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use thiserror::Error;

use crate::proxy::{empty_body, full_body, BoxError, ProxyBody};

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("body read failed after {read} bytes: {message}")]
    Read { read: usize, message: String },
}

/// Which half of an exchange a body belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySide {
    Request,
    Response,
}

impl BodySide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BodySide::Request => "request",
            BodySide::Response => "response",
        }
    }
}

/// Read `body` to the end and put an equivalent body back in its place.
///
/// The replacement yields the same bytes (and trailers, if any) in the same order, so
/// the single downstream consumer sees the stream as if it had never been touched.
/// When the underlying stream fails, the replacement yields the bytes read so far and
/// then the original error.
pub async fn read_body(body: &mut ProxyBody) -> Result<Bytes, BodyError> {
    let mut inner = std::mem::replace(body, empty_body());
    let mut data = BytesMut::new();
    let mut trailers: Option<HeaderMap> = None;

    while let Some(frame) = inner.frame().await {
        match frame {
            Ok(frame) => match frame.into_data() {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers.get_or_insert_with(HeaderMap::new).extend(map);
                    }
                }
            },
            Err(err) => {
                let read = data.len();
                let message = err.to_string();
                *body = replay(data.freeze(), trailers, Some(err));
                return Err(BodyError::Read { read, message });
            }
        }
    }

    let bytes = data.freeze();
    *body = match trailers {
        None => full_body(bytes.clone()),
        Some(trailers) => replay(bytes.clone(), Some(trailers), None),
    };
    Ok(bytes)
}

fn replay(data: Bytes, trailers: Option<HeaderMap>, error: Option<BoxError>) -> ProxyBody {
    let mut frames: Vec<Result<Frame<Bytes>, BoxError>> = Vec::with_capacity(3);
    if !data.is_empty() {
        frames.push(Ok(Frame::data(data)));
    }
    if let Some(trailers) = trailers {
        frames.push(Ok(Frame::trailers(trailers)));
    }
    if let Some(error) = error {
        frames.push(Err(error));
    }
    StreamBody::new(stream::iter(frames)).boxed_unsync()
}
