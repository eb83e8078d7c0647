//! Upstream connection and request forwarding
//!
//! This module issues the relayed request to the target origin and hands
//! back the upstream response with its body still streaming.

use std::error::Error as _;
use std::io;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use tokio::time::timeout;
use url::Url;

use crate::config::UpstreamConfig;
use crate::http::headers::Headers;
use crate::http::request::Method;
use crate::http::response::{BodyStream, StatusCode};
use crate::relay::error::ForwardError;
use crate::relay::target::Target;

/// Headers that describe a single transport hop and are never relayed.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Connection and redirect settings for the upstream client.
#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    pub connect_timeout: Duration,
    /// Bound on waiting for the upstream response head, on each body read,
    /// and on buffering an HTML body for rewriting.
    pub response_timeout: Duration,
    /// `None` disables redirect following.
    pub max_redirects: Option<usize>,
}

impl From<&UpstreamConfig> for ForwarderOptions {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
            max_redirects: config.follow_redirects.then_some(config.max_redirects),
        }
    }
}

/// A response received from the upstream server.
pub struct UpstreamResponse {
    pub status: StatusCode,
    /// Response headers minus hop-by-hop headers.
    pub headers: Headers,
    /// The URL that produced this response, after any redirects.
    pub url: Url,
    pub body: BodyStream,
}

/// Forwards relay requests to upstream origins.
///
/// One instance is shared by every connection. The underlying client pools
/// upstream connections but carries no per-request state.
pub struct Forwarder {
    client: reqwest::Client,
    response_timeout: Duration,
}

impl Forwarder {
    /// Create a new forwarder
    pub fn new(options: ForwarderOptions) -> anyhow::Result<Self> {
        let redirect = match options.max_redirects {
            Some(max) => Policy::limited(max),
            None => Policy::none(),
        };

        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.response_timeout)
            .redirect(redirect)
            .build()?;

        Ok(Self {
            client,
            response_timeout: options.response_timeout,
        })
    }

    /// Forward a request to `target` and wait for the response head.
    ///
    /// The request body, if any, is streamed upstream as it arrives. The
    /// response body is left unread in the returned value. Dropping the
    /// returned future or body aborts the upstream exchange.
    pub async fn forward(
        &self,
        target: &Target,
        method: &Method,
        headers: &Headers,
        body: Option<reqwest::Body>,
    ) -> Result<UpstreamResponse, ForwardError> {
        let request = self.build_request(target, method, headers, body)?;

        tracing::debug!(
            method = method.as_str(),
            url = %request.url(),
            "Forwarding request upstream"
        );

        let response = timeout(self.response_timeout, self.client.execute(request))
            .await
            .map_err(|_| ForwardError::Timeout)?
            .map_err(classify)?;

        tracing::debug!(
            status = response.status().as_u16(),
            url = %response.url(),
            "Upstream responded"
        );

        Ok(UpstreamResponse {
            status: StatusCode::from_u16(response.status().as_u16()),
            headers: downstream_headers(response.headers()),
            url: response.url().clone(),
            body: response.bytes_stream().map_err(body_error).boxed(),
        })
    }

    /// Bound on waiting for the response head, and on each read of the body.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Build the upstream request without sending it.
    ///
    /// The `Host` header is derived from the target URL by the client.
    pub fn build_request(
        &self,
        target: &Target,
        method: &Method,
        headers: &Headers,
        body: Option<reqwest::Body>,
    ) -> Result<reqwest::Request, ForwardError> {
        let url = target
            .url()
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;

        let mut builder = self
            .client
            .request(method, url)
            .headers(upstream_headers(headers));
        if let Some(body) = body {
            builder = builder.body(body);
        }

        builder
            .build()
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))
    }
}

/// A stalled body read surfaces as `TimedOut`.
fn body_error(e: reqwest::Error) -> io::Error {
    if e.is_timeout() {
        io::Error::new(io::ErrorKind::TimedOut, e)
    } else {
        io::Error::other(e)
    }
}

/// Converts client request headers into the set sent upstream.
///
/// Drops `Host` (replaced by the target's authority), hop-by-hop headers
/// plus any listed in `Connection`, and `Accept-Encoding`, which the client
/// negotiates itself so bodies arrive decoded.
pub fn upstream_headers(headers: &Headers) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect();

    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.to_ascii_lowercase();
        if lower == "host"
            || lower == "accept-encoding"
            || HOP_BY_HOP.contains(&lower.as_str())
            || listed.contains(&lower)
        {
            continue;
        }

        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => tracing::debug!(header = name, "Dropping header that cannot be forwarded"),
        }
    }
    map
}

/// Converts upstream response headers into relay headers.
pub fn downstream_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn classify(error: reqwest::Error) -> ForwardError {
    if error.is_timeout() {
        ForwardError::Timeout
    } else if error.is_redirect() {
        ForwardError::TooManyRedirects
    } else {
        ForwardError::Unreachable(describe(&error))
    }
}

/// Renders an error with its source chain, which is where reqwest keeps the
/// useful part (DNS failure, connection refused, ...).
fn describe(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
