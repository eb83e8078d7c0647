//! HTML link rewriting
//!
//! Rewrites URLs in `href=`, `src=`, `action=` and CSS `url(...)` so that
//! following them lands back on the relay. Rules run in a fixed order:
//!
//! 1. absolute `http(s)://host/...`  ->  `/relay/http(s)/host/...`
//! 2. protocol-relative `//host/...` ->  `/relay/{page scheme}/host/...`
//! 3. root-relative `/...`           ->  `/relay/{page scheme}/{page host}/...`
//!
//! Values already under `/relay/` are never touched, so rewriting a
//! rewritten body is a no-op. Matching works on raw bytes and needs no
//! particular charset beyond ASCII compatibility.

use std::sync::LazyLock;

use bytes::Bytes;
use regex::bytes::{Captures, Regex};

use crate::relay::error::RewriteError;
use crate::relay::target::{RELAY_PREFIX, Target};

/// Attribute or `url(` opener, any spacing, optional quote.
///
/// An attribute name must follow whitespace, a quote or `<`, so `src=`
/// inside a query string is not an attribute.
const CONTEXT: &str = r#"(?i-u)((?:(?:^|[\s<"'])(?:href|src|action)\s*=|\burl\()\s*["']?)"#;

static RULES: LazyLock<Result<RewriteRuleSet, regex::Error>> =
    LazyLock::new(RewriteRuleSet::compile);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UrlForm {
    Absolute,
    ProtocolRelative,
    RootRelative,
}

#[derive(Debug)]
struct RewriteRule {
    form: UrlForm,
    pattern: Regex,
}

/// The ordered rewrite rules. Built once and shared read-only.
#[derive(Debug)]
pub struct RewriteRuleSet {
    rules: Vec<RewriteRule>,
}

impl RewriteRuleSet {
    fn compile() -> Result<Self, regex::Error> {
        let rule = |form, url: &str| -> Result<RewriteRule, regex::Error> {
            Ok(RewriteRule {
                form,
                pattern: Regex::new(&format!("{CONTEXT}{url}"))?,
            })
        };

        Ok(Self {
            rules: vec![
                rule(UrlForm::Absolute, "(https?)://")?,
                rule(UrlForm::ProtocolRelative, "//")?,
                rule(UrlForm::RootRelative, "/")?,
            ],
        })
    }

    /// The process-wide rule set.
    pub fn global() -> Result<&'static Self, RewriteError> {
        RULES
            .as_ref()
            .map_err(|e| RewriteError::Rules(e.to_string()))
    }

    /// Applies every rule in order, resolving relative forms against `page`.
    pub fn apply(&self, body: &[u8], page: &Target) -> Vec<u8> {
        let mut out = body.to_vec();
        for rule in &self.rules {
            out = rule.apply(&out, page);
        }
        out
    }
}

impl RewriteRule {
    fn apply(&self, input: &[u8], page: &Target) -> Vec<u8> {
        self.pattern
            .replace_all(input, |caps: &Captures| self.replace(input, caps, page))
            .into_owned()
    }

    fn replace(&self, input: &[u8], caps: &Captures, page: &Target) -> Vec<u8> {
        let whole = &caps[0];
        let context = &caps[1];

        let tail = match self.form {
            UrlForm::Absolute => {
                format!("{RELAY_PREFIX}{}/", String::from_utf8_lossy(&caps[2]).to_ascii_lowercase())
            }
            UrlForm::ProtocolRelative => format!("{RELAY_PREFIX}{}/", page.scheme),
            UrlForm::RootRelative => {
                let end = caps.get(0).map_or(input.len(), |m| m.end());
                if input[end..].starts_with(&RELAY_PREFIX.as_bytes()[1..]) {
                    return whole.to_vec();
                }
                format!("{RELAY_PREFIX}{}/{}/", page.scheme, page.host)
            }
        };

        let mut replaced = context.to_vec();
        replaced.extend_from_slice(tail.as_bytes());
        replaced
    }
}

/// Whether a Content-Type value denotes HTML.
pub fn is_html(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/html")
}

/// Rewrites links in an HTML body so they route through the relay.
///
/// Non-HTML bodies are returned unchanged. If rewriting fails for any
/// reason the original body is returned.
pub fn rewrite(body: Bytes, content_type: &str, page: &Target) -> Bytes {
    if !is_html(content_type) {
        return body;
    }

    match try_rewrite(&body, page) {
        Ok(rewritten) => Bytes::from(rewritten),
        Err(e) => {
            tracing::warn!(error = %e, page = %page, "Rewrite failed, relaying original body");
            body
        }
    }
}

/// Rewrites `body` with the global rule set.
pub fn try_rewrite(body: &[u8], page: &Target) -> Result<Vec<u8>, RewriteError> {
    Ok(RewriteRuleSet::global()?.apply(body, page))
}
