//! Blocking TCP transport for [`Server`].
//!
//! One accept loop hands sockets to a fixed pool of worker threads over a
//! bounded channel. A worker owns a connection until it closes: it parses
//! request heads, lets the server dispatch them, and after an upgrade runs
//! the WebSocket loop that drains the connection's send queue.

use crate::error::{ServerError, ServerResult};
use crate::http::{HttpParser, Status};
use crate::response::Response;
use crate::server::{Dispatched, Server};
use crate::session::ConnectionId;
use crate::websocket::{Frame, FrameReceiver, Opcode, WebSocketConnection};
use crossbeam::channel;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Cursor, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tungstenite::protocol::Role;
use tungstenite::{Message, WebSocket};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const WS_POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_BUFFER_SIZE: usize = 4096;

pub struct TcpTransport {
    listener: TcpListener,
    server: Arc<Server>,
    next_id: AtomicUsize,
    running: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Bind to the address in the server's configuration
    pub fn bind(server: Arc<Server>) -> ServerResult<Self> {
        let address = server.config().socket_address();
        let socket_addr = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ServerError::Config(format!("No socket addresses found for {}", address)))?;

        let socket = Self::create_socket(&socket_addr, server.config().backlog_size)?;
        Ok(Self {
            listener: socket.into(),
            server,
            next_id: AtomicUsize::new(0),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    fn create_socket(addr: &SocketAddr, backlog: u32) -> io::Result<Socket> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        socket.set_reuse_address(true)?;
        // Polled so the accept loop notices shutdown
        socket.set_nonblocking(true)?;
        socket.bind(&(*addr).into())?;
        socket.listen(backlog as i32)?;
        Ok(socket)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Clearing this flag stops `run` after in-flight connections finish
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Accept connections until the running flag is cleared
    pub fn run(&self) -> ServerResult<()> {
        let workers = self.server.config().worker_threads.max(1);
        let (sender, receiver) = channel::bounded::<(TcpStream, ConnectionId)>(workers * 4);

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let receiver = receiver.clone();
            let server = self.server.clone();
            handles.push(thread::spawn(move || {
                for (stream, id) in receiver.iter() {
                    if let Err(e) = serve_connection(&server, stream, id) {
                        log::warn!("Worker {}: connection {} ended with error: {}", worker, id, e);
                    }
                }
            }));
        }

        log::info!("Listening on {} with {} workers", self.local_addr()?, workers);
        while self.running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                    metrics::increment_counter!("connections_accepted_total");
                    log::debug!("Accepted connection {} from {}", id, addr);
                    if sender.send((stream, id)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) => log::error!("Accept failed: {}", e),
            }
        }

        log::info!("Shutting down");
        drop(sender);
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn serve_connection(server: &Server, stream: TcpStream, id: ConnectionId) -> ServerResult<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(server.config().connection_timeout))?;

    server.open_connection(id)?;
    let result = serve_http(server, stream, id);
    let closed = server.close_connection(id);
    result.and(closed)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn serve_http(server: &Server, stream: TcpStream, id: ConnectionId) -> ServerResult<()> {
    let config = server.config();
    let mut parser = HttpParser::new(config.max_header_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let mut complete = false;
        if !pending.is_empty() {
            complete = match parser.parse(&std::mem::take(&mut pending)) {
                Ok(complete) => complete,
                Err(e) => return reject(&stream, e),
            };
        }
        while !complete {
            let n = match (&stream).read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => {
                    log::debug!("Connection {} idle, closing", id);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            complete = match parser.parse(&buf[..n]) {
                Ok(complete) => complete,
                Err(e) => return reject(&stream, e),
            };
        }

        let (head, mut prefix) = parser.take()?;
        let length = head.content_length();
        let keep_alive = config.keep_alive && head.keep_alive();
        // Pipelined bytes past this body belong to the next request
        if prefix.len() > length {
            pending = prefix.split_off(length);
        }

        let mut body = Cursor::new(prefix).chain(&stream).take(length as u64);
        let mut output = &stream;
        let dispatched = server.dispatch(id, head, &mut body, &mut output)?;

        match dispatched {
            Dispatched::Responded(status) => {
                // An oversized body is never read; the connection closes instead
                if !keep_alive || status == Status::PayloadTooLarge {
                    return Ok(());
                }
                // Skip whatever the handler left unread
                io::copy(&mut body, &mut io::sink())?;
            }
            Dispatched::Upgraded { connection, frames } => {
                drop(body);
                return serve_websocket(server, stream, std::mem::take(&mut pending), connection, frames);
            }
        }
    }
}

/// Answer a request whose head or framing could not be parsed, then close
fn reject(stream: &TcpStream, error: ServerError) -> ServerResult<()> {
    log::warn!("Rejecting malformed request: {}", error);
    let mut output = stream;
    let mut response = Response::new(&mut output);
    response.reply_status(error.status())
}

fn to_message(frame: Frame) -> Message {
    match frame.opcode {
        Opcode::Text => Message::text(String::from_utf8_lossy(&frame.payload).into_owned()),
        Opcode::Binary | Opcode::Continuation => Message::binary(frame.payload),
        Opcode::Ping => Message::Ping(frame.payload),
        Opcode::Pong => Message::Pong(frame.payload),
        Opcode::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<Frame> {
    let opcode = match &message {
        Message::Text(_) => Opcode::Text,
        Message::Binary(_) => Opcode::Binary,
        Message::Ping(_) => Opcode::Ping,
        Message::Pong(_) => Opcode::Pong,
        Message::Close(_) => Opcode::Close,
        Message::Frame(_) => return None,
    };
    Some(Frame::new(opcode, message.into_data()))
}

fn serve_websocket(
    server: &Server,
    stream: TcpStream,
    pending: Vec<u8>,
    connection: WebSocketConnection,
    frames: FrameReceiver,
) -> ServerResult<()> {
    let id = connection.id();
    stream.set_read_timeout(Some(WS_POLL_INTERVAL))?;
    let mut socket = WebSocket::from_partially_read(stream, pending, Role::Server, None);
    let protocol = |e: tungstenite::Error| ServerError::Protocol(e.to_string());

    while connection.is_open() {
        while let Ok(frame) = frames.try_recv() {
            let closing = frame.opcode == Opcode::Close;
            socket.send(to_message(frame)).map_err(protocol)?;
            if closing {
                return Ok(());
            }
        }

        match socket.read() {
            Ok(message) => {
                let Some(frame) = from_message(message) else {
                    continue;
                };
                let closing = frame.opcode == Opcode::Close;
                if let Err(e) = server.handle_frame(id, &frame) {
                    log::warn!("Frame handler on connection {} failed: {}", id, e);
                }
                if closing {
                    // Lets tungstenite finish the close handshake
                    let _ = socket.flush();
                    return Ok(());
                }
            }
            Err(tungstenite::Error::Io(e)) if is_timeout(&e) => continue,
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => return Ok(()),
            Err(e) => return Err(protocol(e)),
        }
    }
    Ok(())
}
