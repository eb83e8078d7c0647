//! Target resolution
//!
//! Decodes relay-prefixed request paths into the upstream resource they
//! name. Two encodings are understood:
//!
//! ```text
//! /relay/{scheme}/{host}/{rest...}   explicit form, scheme is http or https
//! /relay/{url}                       opaque form, scheme defaults to https
//! ```

use std::fmt;

use url::{Position, Url};

use crate::relay::error::ResolveError;

/// Reserved path prefix for relayed requests.
pub const RELAY_PREFIX: &str = "/relay/";

/// Upstream URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Parses the exact lowercase literals `http` and `https`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The upstream resource a relay request points at.
///
/// `host` is an authority (`hostname[:port]`), `path` always starts with `/`
/// and `query` excludes the leading `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub path: String,
    pub query: String,
}

/// A resolved target together with the encoding it arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// `/relay/{scheme}/{host}/...`, already canonical.
    Explicit(Target),
    /// `/relay/{url}`, should be redirected to the explicit form.
    Opaque(Target),
}

/// Whether `path` is handled by the relay at all.
pub fn is_relay_path(path: &str) -> bool {
    path.starts_with(RELAY_PREFIX)
}

/// Resolves a request path and query into an upstream target.
///
/// No DNS lookups or connectivity checks happen here.
pub fn resolve(path: &str, query: &str) -> Result<Resolution, ResolveError> {
    let rest = path
        .strip_prefix(RELAY_PREFIX)
        .ok_or(ResolveError::NotRelayPath)?;

    let (first, remainder) = match rest.split_once('/') {
        Some((first, remainder)) => (first, Some(remainder)),
        None => (rest, None),
    };

    match (Scheme::parse(first), remainder) {
        (Some(scheme), Some(remainder)) => {
            let (host, tail) = remainder.split_once('/').unwrap_or((remainder, ""));
            let target = Target::new(scheme, host, format!("/{tail}"), query)?;
            Ok(Resolution::Explicit(target))
        }
        (Some(_), None) => Err(ResolveError::InvalidUrl(format!(
            "missing host after scheme in {path}"
        ))),
        (None, _) => resolve_opaque(rest, query).map(Resolution::Opaque),
    }
}

fn resolve_opaque(raw: &str, query: &str) -> Result<Target, ResolveError> {
    if raw.is_empty() {
        return Err(ResolveError::InvalidUrl("empty URL".to_string()));
    }

    let mut candidate = repair_collapsed_scheme(raw);
    if !candidate.contains("://") {
        candidate.insert_str(0, "https://");
    }
    if !query.is_empty() {
        candidate.push('?');
        candidate.push_str(query);
    }

    let url = Url::parse(&candidate)
        .map_err(|e| ResolveError::InvalidUrl(format!("{candidate}: {e}")))?;
    Target::from_url(&url)
}

/// Restores `scheme://` when an intermediary merged the slashes into one.
fn repair_collapsed_scheme(raw: &str) -> String {
    for scheme in ["https:/", "http:/"] {
        if let Some(rest) = raw.strip_prefix(scheme) {
            if !rest.starts_with('/') {
                return format!("{scheme}/{rest}");
            }
        }
    }
    raw.to_string()
}

impl Target {
    /// Builds a target after checking that `host` is a plain authority.
    pub fn new(
        scheme: Scheme,
        host: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
    ) -> Result<Self, ResolveError> {
        let host = host.into();
        let mut path = path.into();

        validate_host(scheme, &host)?;
        if !path.starts_with('/') {
            path.insert(0, '/');
        }

        Ok(Self {
            scheme,
            host,
            path,
            query: query.into(),
        })
    }

    /// Decomposes an absolute http(s) URL.
    pub fn from_url(url: &Url) -> Result<Self, ResolveError> {
        let scheme = Scheme::parse(url.scheme()).ok_or_else(|| {
            ResolveError::InvalidUrl(format!("unsupported scheme {}", url.scheme()))
        })?;
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ResolveError::InvalidUrl(
                "credentials in URL are not supported".to_string(),
            ));
        }
        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(ResolveError::InvalidUrl(format!("{url}: empty host"))),
        }

        Ok(Self {
            scheme,
            host: url[Position::BeforeHost..Position::AfterPort].to_string(),
            path: url.path().to_string(),
            query: url.query().unwrap_or("").to_string(),
        })
    }

    /// The upstream URL this target names.
    pub fn url(&self) -> Result<Url, ResolveError> {
        Url::parse(&self.to_string())
            .map_err(|e| ResolveError::InvalidUrl(format!("{self}: {e}")))
    }

    /// The canonical relay path, without the query.
    pub fn relay_path(&self) -> String {
        format!("{RELAY_PREFIX}{}/{}{}", self.scheme, self.host, self.path)
    }

    /// The canonical relay path including `?query` when present.
    pub fn relay_uri(&self) -> String {
        if self.query.is_empty() {
            self.relay_path()
        } else {
            format!("{}?{}", self.relay_path(), self.query)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        Ok(())
    }
}

fn validate_host(scheme: Scheme, host: &str) -> Result<(), ResolveError> {
    if host.is_empty() {
        return Err(ResolveError::InvalidUrl("empty host".to_string()));
    }
    if host.contains(['@', '?', '#', '\\']) {
        return Err(ResolveError::InvalidUrl(format!("invalid host {host}")));
    }

    let url = Url::parse(&format!("{scheme}://{host}/"))
        .map_err(|e| ResolveError::InvalidUrl(format!("invalid host {host}: {e}")))?;
    match url.host_str() {
        Some(parsed) if !parsed.is_empty() => Ok(()),
        _ => Err(ResolveError::InvalidUrl(format!("invalid host {host}"))),
    }
}
