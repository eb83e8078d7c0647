use bytes::Bytes;
use ferry::relay::rewrite::{is_html, rewrite};
use ferry::relay::target::{Scheme, Target};

const HTML: &str = "text/html; charset=utf-8";

fn page() -> Target {
    Target::new(Scheme::Https, "example.com", "/index.html", "").unwrap()
}

fn run(body: &str) -> String {
    let out = rewrite(Bytes::from(body.to_string()), HTML, &page());
    String::from_utf8(out.to_vec()).unwrap()
}

#[test]
fn test_root_relative_link_uses_page_origin() {
    assert_eq!(
        run(r#"<a href="/bar">"#),
        r#"<a href="/relay/https/example.com/bar">"#
    );
}

#[test]
fn test_absolute_link_uses_linked_origin() {
    assert_eq!(
        run(r#"<img src="https://cdn.example.com/x.png">"#),
        r#"<img src="/relay/https/cdn.example.com/x.png">"#
    );
    assert_eq!(
        run(r#"<script src="http://static.example.net/app.js"></script>"#),
        r#"<script src="/relay/http/static.example.net/app.js"></script>"#
    );
}

#[test]
fn test_form_action_rewritten() {
    assert_eq!(
        run(r#"<form action="/search" method="get">"#),
        r#"<form action="/relay/https/example.com/search" method="get">"#
    );
    assert_eq!(
        run(r#"<form action="https://login.example.org/post">"#),
        r#"<form action="/relay/https/login.example.org/post">"#
    );
}

#[test]
fn test_css_url_in_all_quoting_styles() {
    let input = "a{background:url(https://a.com/1.png)}\
                 b{background:url('https://b.com/2.png')}\
                 c{background:url(\"http://c.com/3.png\")}\
                 d{background:url(/4.png)}\
                 e{background:url('/5.png')}\
                 f{background:url(\"/6.png\")}";
    let expected = "a{background:url(/relay/https/a.com/1.png)}\
                    b{background:url('/relay/https/b.com/2.png')}\
                    c{background:url(\"/relay/http/c.com/3.png\")}\
                    d{background:url(/relay/https/example.com/4.png)}\
                    e{background:url('/relay/https/example.com/5.png')}\
                    f{background:url(\"/relay/https/example.com/6.png\")}";

    assert_eq!(run(input), expected);
}

#[test]
fn test_attribute_quoting_and_case_variants() {
    assert_eq!(
        run("<a HREF='/x'><a href=/y><img SRC = \"HTTPS://Img.example.com/z\">"),
        "<a HREF='/relay/https/example.com/x'><a href=/relay/https/example.com/y>\
         <img SRC = \"/relay/https/Img.example.com/z\">"
    );
}

#[test]
fn test_protocol_relative_link_uses_page_scheme() {
    assert_eq!(
        run(r#"<script src="//cdn.example.com/lib.js"></script>"#),
        r#"<script src="/relay/https/cdn.example.com/lib.js"></script>"#
    );
}

#[test]
fn test_existing_relay_paths_untouched() {
    let input = r#"<a href="/relay/https/other.com/page">x</a>"#;
    assert_eq!(run(input), input);
}

#[test]
fn test_relative_and_special_links_untouched() {
    let input = "<a href=\"page2.html\"></a><a href=\"#top\"></a>\
                 <a href=\"mailto:a@b.c\"></a><a href=\"javascript:void(0)\"></a>";
    assert_eq!(run(input), input);
}

#[test]
fn test_attribute_names_inside_urls_untouched() {
    assert_eq!(
        run(r#"<a href="https://a.com/?src=/foo&action=/bar">"#),
        r#"<a href="/relay/https/a.com/?src=/foo&action=/bar">"#
    );
    assert_eq!(
        run("<a href=\"page?href=/x\">"),
        "<a href=\"page?href=/x\">"
    );
}

#[test]
fn test_attribute_after_newline_or_tag_start() {
    assert_eq!(
        run("<img\n\tsrc='/a.png'><a title=\"t\"href=\"/b\">"),
        "<img\n\tsrc='/relay/https/example.com/a.png'><a title=\"t\"href=\"/relay/https/example.com/b\">"
    );
}

#[test]
fn test_rewrite_is_idempotent() {
    let input = r#"<html><head>
        <link rel="stylesheet" href="/style.css">
        <style>body{background:url('https://img.example.com/bg.png')}</style>
        <script src="//cdn.example.com/a.js"></script>
        </head><body>
        <a href="https://example.com/about">About</a>
        <a href="/relay/http/legacy.example.com/">Legacy</a>
        <img src="/logo.png"><form action="/login"></form>
        </body></html>"#;

    let once = rewrite(Bytes::from(input), HTML, &page());
    let twice = rewrite(once.clone(), HTML, &page());

    assert_ne!(once, Bytes::from(input));
    assert_eq!(once, twice);
}

#[test]
fn test_non_html_body_unchanged() {
    let body = Bytes::from_static(br#"{"href":"/api","src":"https://x.com"}"#);
    let out = rewrite(body.clone(), "application/json", &page());
    assert_eq!(out, body);

    let css = Bytes::from_static(b"a{background:url(/x.png)}");
    assert_eq!(rewrite(css.clone(), "text/css", &page()), css);
}

#[test]
fn test_html_detection() {
    assert!(is_html("text/html"));
    assert!(is_html("Text/HTML; charset=ISO-8859-1"));
    assert!(!is_html("application/xhtml+xml"));
    assert!(!is_html("text/plain"));
    assert!(!is_html(""));
}

#[test]
fn test_http_page_scheme_used_for_relative_forms() {
    let page = Target::new(Scheme::Http, "localhost:8000", "/", "").unwrap();
    let out = rewrite(
        Bytes::from_static(br#"<a href="/a"><img src="//img.test/b">"#),
        "text/html",
        &page,
    );

    assert_eq!(
        out,
        Bytes::from_static(br#"<a href="/relay/http/localhost:8000/a"><img src="/relay/http/img.test/b">"#)
    );
}
