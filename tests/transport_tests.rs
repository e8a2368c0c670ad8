use edge_http_server::{Method, Server, ServerConfig, Status, TcpTransport};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Harness {
    transport: Arc<TcpTransport>,
    addr: SocketAddr,
    secret_hits: Arc<AtomicUsize>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.transport.running().store(false, Ordering::Release);
    }
}

fn start() -> Harness {
    let secret_hits = Arc::new(AtomicUsize::new(0));
    let hits = secret_hits.clone();

    let config = ServerConfig::default()
        .with_address("127.0.0.1", 0)
        .with_worker_threads(2)
        .with_connection_timeout(Duration::from_secs(10))
        .with_max_upload_size(1024);
    let mut server = Server::new(config);
    server.on("/echo", Method::Post).on_request(|req, res| {
        let body = req.body().to_vec();
        res.reply(Status::Ok, "text/plain", &String::from_utf8_lossy(&body))
    });
    server.on("/secret", Method::Get).on_request(move |_, res| {
        hits.fetch_add(1, Ordering::SeqCst);
        res.reply(Status::Ok, "text/plain", "secret")
    });
    server.on("/ok", Method::Get).on_request(|_, res| res.reply(Status::Ok, "text/plain", "ok"));
    server.on("/upload", Method::Post).on_upload(|_, _| Ok(()));

    let transport = Arc::new(TcpTransport::bind(server.start().unwrap()).unwrap());
    let addr = transport.local_addr().unwrap();
    let runner = transport.clone();
    thread::spawn(move || runner.run());

    Harness {
        transport,
        addr,
        secret_hits,
    }
}

/// Everything the server writes until it closes the connection. Panics if the
/// server is still holding the socket open when the read timeout fires.
fn read_until_closed(stream: &mut TcpStream) -> String {
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => break,
            Err(e) => panic!("server kept the connection open: {}", e),
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

fn send(harness: &Harness, raw: &[u8]) -> TcpStream {
    let mut stream = TcpStream::connect(harness.addr).unwrap();
    stream.write_all(raw).unwrap();
    stream
}

#[test]
fn test_malformed_content_length_cannot_smuggle_a_request() {
    let harness = start();
    let mut stream = send(
        &harness,
        b"POST /echo HTTP/1.1\r\nHost: device\r\nContent-Length: 43x\r\n\r\n\
          GET /secret HTTP/1.1\r\nHost: device\r\n\r\n",
    );

    let replies = read_until_closed(&mut stream);
    assert!(replies.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(replies.matches("HTTP/1.1 ").count(), 1);
    assert_eq!(harness.secret_hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_conflicting_and_negative_lengths_are_rejected() {
    let harness = start();
    for raw in [
        &b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 30\r\n\r\nabc"[..],
        &b"POST /echo HTTP/1.1\r\nContent-Length: -5\r\n\r\n"[..],
    ] {
        let mut stream = send(&harness, raw);
        assert!(read_until_closed(&mut stream).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}

#[test]
fn test_transfer_encoding_is_not_implemented() {
    let harness = start();
    let mut stream = send(
        &harness,
        b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
          0\r\n\r\nGET /secret HTTP/1.1\r\n\r\n",
    );

    let replies = read_until_closed(&mut stream);
    assert!(replies.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
    assert_eq!(harness.secret_hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_oversized_upload_closes_without_reading_the_body() {
    let harness = start();
    let started = Instant::now();
    let mut stream = send(
        &harness,
        b"POST /upload HTTP/1.1\r\nHost: device\r\nContent-Length: 104857600\r\n\r\nabc",
    );

    let reply = read_until_closed(&mut stream);
    assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_malformed_pipelined_request_gets_a_reply() {
    let harness = start();
    let mut stream = send(
        &harness,
        b"GET /ok HTTP/1.1\r\nHost: device\r\n\r\nNONSENSE\r\n\r\n",
    );

    let replies = read_until_closed(&mut stream);
    assert!(replies.starts_with("HTTP/1.1 200 OK\r\n"));
    let second = replies.find("HTTP/1.1 400 Bad Request\r\n");
    assert!(second.is_some(), "no reply to the malformed request: {:?}", replies);
}

#[test]
fn test_pipelined_requests_with_bodies() {
    let harness = start();
    let mut stream = send(
        &harness,
        b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nfirstPOST /echo HTTP/1.1\r\n\
          Content-Length: 6\r\nConnection: close\r\n\r\nsecond",
    );

    let replies = read_until_closed(&mut stream);
    let first = replies.find("first").unwrap();
    let second = replies.find("second").unwrap();
    assert!(first < second);
    assert_eq!(replies.matches("HTTP/1.1 200 OK\r\n").count(), 2);
}
