//! Relay pipeline
//!
//! Each relayed request runs through the same stages:
//!
//! ```text
//! resolve target -> forward upstream -> sanitize headers -> rewrite HTML -> respond
//! ```
//!
//! A resolution failure answers `400` before anything is sent upstream. A
//! forwarding failure answers `502` and skips the later stages. Nothing is
//! kept between requests.

pub mod error;
pub mod forward;
pub mod rewrite;
pub mod sanitize;
pub mod target;

pub use error::{ForwardError, ResolveError, RewriteError};
pub use forward::{Forwarder, ForwarderOptions, UpstreamResponse};
pub use target::{RELAY_PREFIX, Resolution, Scheme, Target};

use std::io;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::time::timeout;

use crate::config::Config;
use crate::http::request::{Method, Request};
use crate::http::response::{Body, BodyStream, Response, ResponseBuilder};

/// Default cap on HTML bodies buffered for rewriting.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 8 * 1024 * 1024;

/// Outcome of buffering an upstream body for rewriting.
enum Buffered {
    /// The whole body fit under the limit.
    Complete(Bytes),
    /// The limit was hit; `prefix` was read, `rest` is still pending.
    Overflow { prefix: Bytes, rest: BodyStream },
}

/// Routes relay requests through the pipeline.
pub struct Relay {
    forwarder: Forwarder,
    max_buffered_bytes: usize,
}

impl Relay {
    pub fn new(forwarder: Forwarder, max_buffered_bytes: usize) -> Self {
        Self {
            forwarder,
            max_buffered_bytes,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let forwarder = Forwarder::new(ForwarderOptions::from(&config.upstream))?;
        Ok(Self::new(forwarder, config.rewrite.max_buffered_bytes))
    }

    /// Whether `path` belongs to the relay. Other paths are left to the
    /// rest of the server.
    pub fn accepts(path: &str) -> bool {
        target::is_relay_path(path)
    }

    /// Runs one request through the pipeline.
    ///
    /// `body` streams the client's request body, `None` when it has none.
    /// Every failure becomes an error response; this never panics or
    /// returns an error to the caller.
    pub async fn handle(&self, request: &Request, body: Option<reqwest::Body>) -> Response {
        let resolution = match target::resolve(request.path(), request.query()) {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::warn!(path = request.path(), error = %e, "Rejecting relay request");
                return Response::bad_request(format!("Invalid URL format: {e}\n"));
            }
        };

        let target = match resolution {
            Resolution::Explicit(target) => target,
            Resolution::Opaque(target) => {
                let location = target.relay_uri();
                tracing::debug!(from = request.path(), to = %location, "Redirecting to canonical relay path");
                return Response::found(location);
            }
        };

        tracing::info!(method = request.method.as_str(), target = %target, "Relaying request");

        let upstream = match self
            .forwarder
            .forward(&target, &request.method, &request.headers, body)
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(method = request.method.as_str(), target = %target, error = %e, "Relay failed");
                return Response::bad_gateway(format!("Proxy error: {e}\n"));
            }
        };

        self.respond(&target, request.method == Method::HEAD, upstream)
            .await
    }

    async fn respond(&self, target: &Target, head_only: bool, upstream: UpstreamResponse) -> Response {
        let UpstreamResponse {
            status,
            headers,
            url,
            body,
        } = upstream;
        let mut headers = sanitize::sanitize(headers);

        let content_type = headers.get("Content-Type").unwrap_or("").to_string();
        let rewritable = rewrite::is_html(&content_type) && !head_only && !status.forbids_body();
        if !rewritable {
            return ResponseBuilder::new(status)
                .headers(headers)
                .body(Body::Stream(body))
                .build();
        }

        let declared = headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.max_buffered_bytes) {
            tracing::warn!(target = %target, "HTML body over rewrite limit, relaying unmodified");
            return ResponseBuilder::new(status)
                .headers(headers)
                .body(Body::Stream(body))
                .build();
        }

        // The whole body must arrive within the response timeout
        let buffered = timeout(
            self.forwarder.response_timeout(),
            buffer_body(body, self.max_buffered_bytes),
        )
        .await
        .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()));

        match buffered {
            Ok(Buffered::Complete(bytes)) => {
                // Links on a redirected page are relative to where it ended up
                let page = Target::from_url(&url).unwrap_or_else(|_| target.clone());
                let rewritten = rewrite::rewrite(bytes, &content_type, &page);
                headers.remove("Content-Length");
                ResponseBuilder::new(status)
                    .headers(headers)
                    .body(rewritten)
                    .build()
            }
            Ok(Buffered::Overflow { prefix, rest }) => {
                tracing::warn!(target = %target, "HTML body over rewrite limit, relaying unmodified");
                let body = futures::stream::once(async move { Ok(prefix) })
                    .chain(rest)
                    .boxed();
                ResponseBuilder::new(status)
                    .headers(headers)
                    .body(Body::Stream(body))
                    .build()
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                let e = ForwardError::Timeout;
                tracing::error!(target = %target, error = %e, "Upstream body stalled");
                Response::bad_gateway(format!("Proxy error: {e}\n"))
            }
            Err(e) => {
                tracing::error!(target = %target, error = %e, "Upstream body failed");
                Response::bad_gateway(format!("Proxy error: upstream body failed: {e}\n"))
            }
        }
    }
}

/// Reads `body` into memory until it ends or exceeds `limit` bytes.
async fn buffer_body(mut body: BodyStream, limit: usize) -> io::Result<Buffered> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
        if buf.len() > limit {
            return Ok(Buffered::Overflow {
                prefix: buf.freeze(),
                rest: body,
            });
        }
    }
    Ok(Buffered::Complete(buf.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static str]) -> BodyStream {
        let items: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect();
        futures::stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn buffering_completes_under_limit() {
        match buffer_body(chunks(&["ab", "cd"]), 10).await.unwrap() {
            Buffered::Complete(bytes) => assert_eq!(&bytes[..], b"abcd"),
            Buffered::Overflow { .. } => panic!("unexpected overflow"),
        }
    }

    #[tokio::test]
    async fn buffering_overflow_keeps_remaining_stream() {
        match buffer_body(chunks(&["abc", "def", "gh"]), 4).await.unwrap() {
            Buffered::Overflow { prefix, rest } => {
                assert_eq!(&prefix[..], b"abcdef");
                let tail: Vec<Bytes> = rest.map(|c| c.unwrap()).collect().await;
                assert_eq!(tail, vec![Bytes::from_static(b"gh")]);
            }
            Buffered::Complete(_) => panic!("expected overflow"),
        }
    }
}
