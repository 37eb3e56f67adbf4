// tests/response.rs

use portico::{status_line, BodyFraming, Response};
use std::time::Duration;

fn to_string(res: &Response, keep_alive: u64) -> String {
    String::from_utf8(res.to_bytes(Duration::from_secs(keep_alive))).unwrap()
}

fn head_and_body(serialized: &str) -> (&str, &str) {
    serialized
        .split_once("\r\n\r\n")
        .expect("header/body separator")
}

#[test]
fn status_lines() {
    assert_eq!(status_line(200), "200 OK");
    assert_eq!(status_line(405), "405 Method Not Allowed");
    assert_eq!(status_line(416), "416 Requested Range Not Satisfiable");
    assert_eq!(status_line(207), "500 Internal Server Error");
}

#[test]
fn keep_alive_advertisement() {
    let res = Response::new(200);
    let s = to_string(&res, 10);
    let (head, body) = head_and_body(&s);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("\r\nContent-Length: 0"), "{head}");
    assert!(head.contains("\r\nKeep-Alive: timeout=10"), "{head}");
    assert!(head.contains("\r\nConnection: keep-alive"), "{head}");
    assert!(body.is_empty());
}

#[test]
fn zero_keep_alive_closes() {
    let s = to_string(&Response::new(200), 0);
    let (head, _) = head_and_body(&s);
    assert!(head.contains("\r\nConnection: close"), "{head}");
    assert!(!head.contains("Keep-Alive"), "{head}");
}

#[test]
fn response_keep_alive_override_wins() {
    let res = Response::new(200).with_keep_alive(Duration::from_secs(30));
    let s = to_string(&res, 10);
    assert!(s.contains("\r\nKeep-Alive: timeout=30"), "{s}");

    let res = Response::new(200).with_keep_alive(Duration::ZERO);
    let s = to_string(&res, 10);
    assert!(s.contains("\r\nConnection: close"), "{s}");
}

#[test]
fn body_sets_content_length() {
    let res = Response::new(200).with_body("hello");
    assert_eq!(res.framing(), BodyFraming::Length(5));
    let s = to_string(&res, 0);
    let (head, body) = head_and_body(&s);
    assert!(head.contains("\r\nContent-Length: 5"), "{head}");
    assert_eq!(body, "hello");
}

#[test]
fn explicit_content_length_clears_body() {
    let res = Response::new(200).with_body("hello").with_content_length(100);
    assert_eq!(res.framing(), BodyFraming::Length(100));
    let s = to_string(&res, 0);
    let (head, body) = head_and_body(&s);
    assert!(head.contains("\r\nContent-Length: 100"), "{head}");
    assert!(body.is_empty());
}

#[test]
fn chunked_framing_line() {
    let res = Response::new(200).with_chunked_body();
    let s = to_string(&res, 0);
    let (head, _) = head_and_body(&s);
    assert!(head.contains("\r\nTransfer-Encoding: chunked"), "{head}");
    assert!(!head.contains("Content-Length"), "{head}");
}

#[test]
fn custom_headers_are_serialized() {
    let res = Response::new(403)
        .with_header("ErrorKey1", "Value1")
        .with_header("ErrorKey2", "Value2")
        .with_body("Only secured connections allowed");
    let s = to_string(&res, 0);
    let (head, body) = head_and_body(&s);
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{head}");
    assert!(head.contains("\r\nErrorKey1: Value1"), "{head}");
    assert!(head.contains("\r\nErrorKey2: Value2"), "{head}");
    assert_eq!(body, "Only secured connections allowed");
}

#[test]
fn unset_status_serializes_as_500() {
    let res = Response::new(0);
    let s = to_string(&res, 0);
    assert!(s.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{s}");

    let default = Response::default();
    assert_eq!(default.status(), 500);
}

#[test]
fn unknown_status_maps_to_500_line() {
    let s = to_string(&Response::new(999), 0);
    assert!(s.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{s}");
}
