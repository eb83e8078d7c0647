use ferry::http::request::{Method, Request};

fn request(target: &str, version: &str, headers: &[(&str, &str)]) -> Request {
    Request {
        method: Method::GET,
        target: target.to_string(),
        version: version.to_string(),
        headers: headers.iter().copied().collect(),
    }
}

#[test]
fn test_request_header_retrieval() {
    let req = request(
        "/",
        "HTTP/1.1",
        &[("Host", "example.com"), ("Content-Type", "application/json")],
    );

    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.header("content-type"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_path_and_query_split() {
    let req = request("/relay/https/example.com/foo?q=1&r=2", "HTTP/1.1", &[]);

    assert_eq!(req.path(), "/relay/https/example.com/foo");
    assert_eq!(req.query(), "q=1&r=2");
}

#[test]
fn test_request_without_query() {
    let req = request("/relay/https/example.com", "HTTP/1.1", &[]);

    assert_eq!(req.path(), "/relay/https/example.com");
    assert_eq!(req.query(), "");
}

#[test]
fn test_request_content_length_parsing() {
    let req = request("/api", "HTTP/1.1", &[("Content-Length", "42")]);
    assert_eq!(req.content_length(), 42);
}

#[test]
fn test_request_content_length_missing() {
    let req = request("/", "HTTP/1.1", &[]);
    assert_eq!(req.content_length(), 0);
}

#[test]
fn test_request_content_length_invalid() {
    let req = request("/api", "HTTP/1.1", &[("Content-Length", "not-a-number")]);
    assert_eq!(req.content_length(), 0);
}

#[test]
fn test_request_keep_alive_http11_default() {
    // HTTP/1.1 defaults to keep-alive
    let req = request("/", "HTTP/1.1", &[]);
    assert!(req.keep_alive());
}

#[test]
fn test_request_keep_alive_http10_default() {
    let req = request("/", "HTTP/1.0", &[]);
    assert!(!req.keep_alive());
}

#[test]
fn test_request_keep_alive_explicit_header() {
    let req = request("/", "HTTP/1.0", &[("Connection", "keep-alive")]);
    assert!(req.keep_alive());
}

#[test]
fn test_request_keep_alive_close() {
    let req = request("/", "HTTP/1.1", &[("Connection", "close")]);
    assert!(!req.keep_alive());
}

#[test]
fn test_request_keep_alive_case_insensitive() {
    let req = request("/", "HTTP/1.1", &[("connection", "Upgrade, Keep-Alive")]);
    assert!(req.keep_alive());
}

#[test]
fn test_request_method_from_string() {
    assert_eq!(Method::from_str("GET"), Some(Method::GET));
    assert_eq!(Method::from_str("POST"), Some(Method::POST));
    assert_eq!(Method::from_str("G@T"), None);
    assert_eq!(Method::from_str(""), None);
}

#[test]
fn test_request_extension_methods_are_kept_verbatim() {
    let propfind = Method::from_str("PROPFIND").unwrap();
    assert_eq!(propfind, Method::Other("PROPFIND".to_string()));
    assert_eq!(propfind.as_str(), "PROPFIND");

    // Case-sensitive: lowercase is a different, extension method
    let lower = Method::from_str("get").unwrap();
    assert_ne!(lower, Method::GET);
    assert_eq!(lower.as_str(), "get");
}
