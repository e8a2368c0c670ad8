use edge_http_server::http::{HttpParser, Method, Status};
use edge_http_server::response::Response;
use edge_http_server::ServerError;
use std::io::Cursor;

#[test]
fn test_http_parser_simple_get() {
    let mut parser = HttpParser::new(8192);
    let request_data = b"GET /index.html?lang=en HTTP/1.1\r\nHost: example.com\r\n\r\n";

    assert!(parser.parse(request_data).unwrap());
    assert!(parser.is_complete());

    let (head, prefix) = parser.take().unwrap();
    assert_eq!(head.method, Method::Get);
    assert_eq!(head.uri, "/index.html?lang=en");
    assert_eq!(head.path(), "/index.html");
    assert_eq!(head.query(), "lang=en");
    assert_eq!(head.headers.get("HOST"), Some("example.com"));
    assert!(prefix.is_empty());
}

#[test]
fn test_http_parser_leaves_body_for_request() {
    let mut parser = HttpParser::new(8192);
    let request_data =
        b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Type: application/json\r\nContent-Length: 15\r\n\r\n{\"name\":\"test\"}";

    assert!(parser.parse(request_data).unwrap());
    let (head, prefix) = parser.take().unwrap();
    assert_eq!(head.method, Method::Post);
    assert_eq!(head.content_length(), 15);
    assert_eq!(prefix, b"{\"name\":\"test\"}");
}

#[test]
fn test_http_parser_incremental() {
    let mut parser = HttpParser::new(8192);
    assert!(!parser.parse(b"GET /api/data HTTP/1.1\r\nHost: exa").unwrap());
    assert!(!parser.parse(b"mple.com\r\nCookie: a=1\r\nCookie: b=2\r\n").unwrap());
    assert!(parser.parse(b"\r\n").unwrap());

    let (head, _) = parser.take().unwrap();
    assert_eq!(head.headers.get("host"), Some("example.com"));
    let cookies: Vec<&str> = head.headers.get_all("cookie").collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);

    // Parser is ready for the next request on the connection
    assert!(!parser.is_complete());
}

#[test]
fn test_http_parser_rejects_oversized_head() {
    let mut parser = HttpParser::new(64);
    let long = format!("GET / HTTP/1.1\r\nX-Filler: {}\r\n", "a".repeat(100));
    assert!(matches!(parser.parse(long.as_bytes()), Err(ServerError::ResourceLimit(_))));
}

#[test]
fn test_http_parser_rejects_bad_request_line() {
    let mut parser = HttpParser::new(8192);
    assert!(matches!(parser.parse(b"BREW /pot\r\n\r\n"), Err(ServerError::HttpParse(_))));
}

#[test]
fn test_response_serialization() {
    let mut out = Vec::new();
    {
        let mut response = Response::new(&mut out);
        response.set_content_type("application/json");
        response.add_header("X-Custom", "one");
        response.add_header("X-Custom", "two");
        response.set_content(b"{\"ok\":true}");
        response.send().unwrap();
    }
    let text = String::from_utf8(out).unwrap();

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Type: application/json\r\n"));
    assert!(text.contains("X-Custom: one\r\nX-Custom: two\r\n"));
    assert!(text.contains("Content-Length: 11\r\n"));
    assert!(text.ends_with("\r\n\r\n{\"ok\":true}"));
}

#[test]
fn test_response_cookie_and_redirect() {
    let mut out = Vec::new();
    {
        let mut response = Response::new(&mut out);
        response.set_cookie("session", "abc", 60).unwrap();
        response.redirect("/login").unwrap();
    }
    let text = String::from_utf8(out).unwrap();

    assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(text.contains("Set-Cookie: session=abc; Max-Age=60; Path=/\r\n"));
    assert!(text.contains("Location: /login\r\n"));
}

#[test]
fn test_response_unknown_length_stream_is_chunked() {
    let mut out = Vec::new();
    {
        let mut response = Response::new(&mut out).with_chunk_size(4);
        response.set_stream(Box::new(Cursor::new(b"abcdefghij".to_vec())), None);
        response.send().unwrap();
    }
    let text = String::from_utf8(out).unwrap();

    assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(!text.contains("Content-Length"));
    assert!(text.ends_with("\r\n\r\n4\r\nabcd\r\n4\r\nefgh\r\n2\r\nij\r\n0\r\n\r\n"));
}

#[test]
fn test_response_status_codes() {
    assert_eq!(Status::PayloadTooLarge.code(), 413);
    assert_eq!(Status::NotModified.to_string(), "304 Not Modified");
    assert!(Status::NotModified.is_bodyless());
    assert!(!Status::NotFound.is_bodyless());
}
