//! Response header sanitizing
//!
//! Removes headers that stop a relayed page from loading inside a frame on
//! the relay's origin, and opens the response to cross-origin reads.

use crate::http::headers::Headers;

/// Headers that forbid framing. Matched case-insensitively.
const FRAME_BLOCKING: [&str; 2] = ["X-Frame-Options", "Content-Security-Policy"];

/// Strips framing restrictions and sets `Access-Control-Allow-Origin: *`.
///
/// All other headers, `Set-Cookie` included, pass through untouched.
pub fn sanitize(mut headers: Headers) -> Headers {
    for name in FRAME_BLOCKING {
        headers.remove(name);
    }
    headers.insert("Access-Control-Allow-Origin", "*");
    headers
}
