use thiserror::Error;

/// Errors turning a relay-prefixed path into an upstream target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The path does not start with the relay prefix.
    #[error("path is not a relay path")]
    NotRelayPath,

    /// The encoded target is not a usable http(s) URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Errors forwarding a request to the upstream server.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Connection, DNS or protocol failure talking to the upstream.
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    /// Connect or response timeout elapsed.
    #[error("upstream timed out")]
    Timeout,

    /// The redirect chain exceeded the configured bound.
    #[error("too many redirects")]
    TooManyRedirects,

    /// The target or method cannot be expressed as an upstream request.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

/// Errors rewriting a response body. Never surfaced to clients.
#[derive(Debug, Clone, Error)]
pub enum RewriteError {
    #[error("rewrite rules unavailable: {0}")]
    Rules(String),
}
