//! The server façade: registration before `start()`, dispatch afterwards.
//!
//! A transport parses the request head and hands it to [`Server::dispatch`]
//! together with a reader positioned at the body and a writer for the reply.
//! Everything after that (endpoint lookup, body handling, static content,
//! WebSocket upgrades) happens here, independent of how bytes arrive.

use crate::auth::ChallengeStore;
use crate::config::ServerConfig;
use crate::endpoint::{Endpoint, EndpointHandler, RequestHandler, TransactionKind, UploadChunk, UploadHandler, WebSocketConnectHandler};
use crate::error::{ServerError, ServerResult};
use crate::http::{Method, RequestHead, Status};
use crate::multipart::{self, MultipartReader};
use crate::request::{Request, RequestContext};
use crate::response::Response;
use crate::session::{ConnectionId, SessionStore};
use crate::static_files::{FileSystem, StaticFileHandler};
use crate::websocket::{Frame, FrameReceiver, WebSocketConnection, WebSocketRegistry};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Called by the transport when a connection opens or closes
pub type ConnectionCallback = Arc<dyn Fn(&Server, ConnectionId) -> ServerResult<()> + Send + Sync>;

/// How a transaction ended
#[derive(Debug)]
pub enum Dispatched {
    /// A response with this status was written
    Responded(Status),
    /// The connection switched to WebSocket. The transport writes frames
    /// arriving on `frames` and feeds received frames to `handle_frame`.
    Upgraded {
        connection: WebSocketConnection,
        frames: FrameReceiver,
    },
}

pub struct Server {
    config: ServerConfig,
    endpoints: Vec<Endpoint>,
    static_handlers: Vec<StaticFileHandler>,
    not_found: RequestHandler,
    on_open: Option<ConnectionCallback>,
    on_close: Option<ConnectionCallback>,
    sessions: SessionStore,
    challenges: ChallengeStore,
    registry: WebSocketRegistry,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("endpoints", &self.endpoints)
            .field("static_handlers", &self.static_handlers.len())
            .field("sessions", &self.sessions.len())
            .field("websockets", &self.registry.len())
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let not_found: RequestHandler = Arc::new(|req: &mut Request<'_>, res: &mut Response<'_>| {
            res.reply(Status::NotFound, "text/plain", &format!("Not Found: {}", req.path()))
        });

        Self {
            registry: WebSocketRegistry::new(config.ws_queue_capacity),
            config,
            endpoints: Vec::new(),
            static_handlers: Vec::new(),
            not_found,
            on_open: None,
            on_close: None,
            sessions: SessionStore::new(),
            challenges: ChallengeStore::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Endpoint for `method` on exactly `uri`, created on first use
    pub fn on(&mut self, uri: &str, method: Method) -> &mut Endpoint {
        let index = match self.endpoints.iter().position(|e| e.matches(method, uri)) {
            Some(index) => index,
            None => {
                self.endpoints.push(Endpoint::new(method, uri));
                self.endpoints.len() - 1
            }
        };
        &mut self.endpoints[index]
    }

    /// WebSocket endpoint on `uri`; attach `on_connect` / `on_frame` to it
    pub fn websocket(&mut self, uri: &str) -> &mut Endpoint {
        let endpoint = self.on(uri, Method::Get);
        endpoint.make_websocket();
        endpoint
    }

    /// Serve files under `root` for request paths starting with `uri`
    pub fn serve_static(
        &mut self,
        uri: &str,
        fs: Arc<dyn FileSystem>,
        root: impl Into<PathBuf>,
    ) -> &mut StaticFileHandler {
        self.static_handlers.push(StaticFileHandler::new(uri, fs, root));
        let last = self.static_handlers.len() - 1;
        &mut self.static_handlers[last]
    }

    /// Replace the handler used when nothing else matches
    pub fn on_not_found<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut Request<'_>, &mut Response<'_>) -> ServerResult<()> + Send + Sync + 'static,
    {
        self.not_found = Arc::new(handler);
        self
    }

    pub fn on_open<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Server, ConnectionId) -> ServerResult<()> + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(callback));
        self
    }

    pub fn on_close<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Server, ConnectionId) -> ServerResult<()> + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(callback));
        self
    }

    /// Freeze registration. Every endpoint must have a handler by now.
    pub fn start(self) -> ServerResult<Arc<Server>> {
        self.config.validate()?;
        if let Some(endpoint) = self.endpoints.iter().find(|e| e.handler().is_none()) {
            return Err(ServerError::Config(format!(
                "Endpoint {} {} has no handler",
                endpoint.method().as_str(),
                endpoint.uri()
            )));
        }

        log::info!(
            "Server started with {} endpoints and {} static handlers",
            self.endpoints.len(),
            self.static_handlers.len()
        );
        Ok(Arc::new(self))
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn registry(&self) -> &WebSocketRegistry {
        &self.registry
    }

    /// Run the open callback for a new transport connection
    pub fn open_connection(&self, id: ConnectionId) -> ServerResult<()> {
        log::debug!("Connection {} opened", id);
        match &self.on_open {
            Some(callback) => (callback)(self, id),
            None => Ok(()),
        }
    }

    /// Run the close callback, then drop the connection's session and
    /// WebSocket registration
    pub fn close_connection(&self, id: ConnectionId) -> ServerResult<()> {
        let result = match &self.on_close {
            Some(callback) => (callback)(self, id),
            None => Ok(()),
        };
        self.registry.remove(id);
        self.sessions.remove(id);
        log::debug!("Connection {} closed", id);
        result
    }

    /// Queue a frame for one upgraded connection
    pub fn queue_message(&self, id: ConnectionId, frame: Frame) -> ServerResult<()> {
        self.registry.queue_message(id, frame)
    }

    /// Queue a frame on every upgraded connection; returns how many took it
    pub fn send_all(&self, frame: &Frame) -> usize {
        self.registry.send_all(frame)
    }

    /// Pass a frame received on connection `id` to its endpoint
    pub fn handle_frame(&self, id: ConnectionId, frame: &Frame) -> ServerResult<()> {
        let (index, connection) = self
            .registry
            .endpoint_of(id)
            .ok_or_else(|| ServerError::NotFound(format!("WebSocket connection {}", id)))?;

        match self.endpoints.get(index).and_then(|e| e.handler()) {
            Some(EndpointHandler::WebSocket { on_frame: Some(on_frame), .. }) => (on_frame)(&connection, frame),
            _ => Ok(()),
        }
    }

    fn find_endpoint(&self, method: Method, path: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e.matches(method, path))
    }

    fn static_handler_for(&self, path: &str) -> Option<&StaticFileHandler> {
        self.static_handlers
            .iter()
            .filter_map(|h| h.match_len(path).map(|len| (len, h)))
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h)
    }

    /// Handle one transaction. `body` yields exactly the request body;
    /// the response goes to `output`.
    pub fn dispatch<'a>(
        &'a self,
        connection_id: ConnectionId,
        head: RequestHead,
        body: &'a mut dyn Read,
        output: &'a mut dyn Write,
    ) -> ServerResult<Dispatched> {
        let kind = TransactionKind::detect(&head);
        metrics::increment_counter!("transactions_total", "kind" => kind.as_str());
        log::debug!(
            "{} {} ({}) on connection {}",
            head.method.as_str(),
            head.uri,
            kind.as_str(),
            connection_id
        );

        let head_only = head.method == Method::Head;
        let ctx = RequestContext {
            connection_id,
            sessions: &self.sessions,
            challenges: &self.challenges,
            max_body_size: self.config.max_request_body_size,
        };
        let mut request = Request::new(head, body, ctx);
        let mut response = Response::new(output)
            .with_chunk_size(self.config.file_chunk_size)
            .with_max_cookie_size(self.config.max_cookie_size)
            .with_head_only(head_only);

        if let Err(e) = request.head().body_length() {
            return self.finish(Err(e), &mut response).map(Dispatched::Responded);
        }

        if let Some(index) = self.find_endpoint(request.method(), request.path()) {
            return self.run_endpoint(index, kind, &mut request, &mut response);
        }

        let is_get = matches!(request.method(), Method::Get | Method::Head);
        if is_get && kind != TransactionKind::WebSocket {
            if let Some(handler) = self.static_handler_for(request.path()) {
                if let Some(file) = handler.resolve(request.head()) {
                    let result = handler.serve(request.head(), &file, &mut response);
                    return self.finish(result, &mut response).map(Dispatched::Responded);
                }
            }
        }

        let result = (self.not_found)(&mut request, &mut response);
        self.finish(result, &mut response).map(Dispatched::Responded)
    }

    fn run_endpoint(
        &self,
        index: usize,
        kind: TransactionKind,
        request: &mut Request<'_>,
        response: &mut Response<'_>,
    ) -> ServerResult<Dispatched> {
        let endpoint = &self.endpoints[index];
        let handler = match endpoint.handler() {
            Some(handler) if handler.accepts(kind) => handler,
            Some(_) => {
                let error = ServerError::Client(format!(
                    "{} transaction not accepted by {} {}",
                    kind.as_str(),
                    endpoint.method().as_str(),
                    endpoint.uri()
                ));
                return self.finish(Err(error), response).map(Dispatched::Responded);
            }
            None => {
                let error = ServerError::Handler(format!("No handler for {}", endpoint.uri()));
                return self.finish(Err(error), response).map(Dispatched::Responded);
            }
        };

        let result = match handler {
            EndpointHandler::Request(handler) => {
                let loaded = match kind {
                    TransactionKind::Raw | TransactionKind::Multipart => request.load_body(),
                    _ => Ok(()),
                };
                loaded.and_then(|()| (handler)(request, response))
            }
            EndpointHandler::Upload { on_chunk, on_complete } => self
                .stream_upload(request, on_chunk)
                .and_then(|()| complete_upload(on_complete.as_ref(), request, response)),
            EndpointHandler::Multipart { on_chunk, on_complete } => self
                .stream_multipart(request, on_chunk)
                .and_then(|()| complete_upload(on_complete.as_ref(), request, response)),
            EndpointHandler::WebSocket { on_connect, .. } => {
                return match self.upgrade(index, request, response, on_connect.as_ref()) {
                    Ok(upgraded) => Ok(upgraded),
                    Err(e) => {
                        self.registry.remove(request.connection_id());
                        self.finish(Err(e), response).map(Dispatched::Responded)
                    }
                };
            }
        };

        self.finish(result, response).map(Dispatched::Responded)
    }

    /// Send whatever the handler left unsent, or an error status in its place
    fn finish(&self, result: ServerResult<()>, response: &mut Response<'_>) -> ServerResult<Status> {
        match result {
            Ok(()) => {
                if !response.is_sent() {
                    response.send()?;
                }
                Ok(response.status())
            }
            Err(e) if !response.is_sent() => {
                let status = e.status();
                metrics::increment_counter!("handler_errors_total");
                log::warn!("Request failed with {}: {}", status.code(), e);
                response.reset();
                response.reply_status(status)?;
                Ok(status)
            }
            // Reported by `send` itself; the response on the wire is intact
            Err(ServerError::AlreadySent) => Ok(response.status()),
            Err(e) => {
                log::error!("Failure after the response was sent: {}", e);
                Err(e)
            }
        }
    }

    fn check_upload_size(&self, length: usize) -> ServerResult<()> {
        if length > self.config.max_upload_size {
            return Err(ServerError::ResourceLimit(format!(
                "Upload of {} bytes exceeds the {} byte limit",
                length, self.config.max_upload_size
            )));
        }
        Ok(())
    }

    fn stream_upload(&self, request: &mut Request<'_>, on_chunk: &UploadHandler) -> ServerResult<()> {
        let length = request.content_length();
        self.check_upload_size(length)?;

        let filename = request
            .get_param("_filename")
            .unwrap_or_else(|| request.path().rsplit('/').next().unwrap_or_default().to_string());
        let content_type = request.content_type().map(str::to_string);

        if length == 0 {
            let empty = UploadChunk {
                filename: &filename,
                field: None,
                content_type: content_type.as_deref(),
                index: 0,
                data: &[],
                is_final: true,
            };
            return (on_chunk)(request, &empty);
        }

        let reader = request
            .take_body_reader()
            .ok_or_else(|| ServerError::Client("Request body unavailable".to_string()))?;
        let mut buf = vec![0u8; self.config.file_chunk_size.clamp(1, length)];
        let mut index = 0u64;
        let mut remaining = length;

        while remaining > 0 {
            let want = remaining.min(buf.len());
            reader.read_exact(&mut buf[..want]).map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => {
                    ServerError::Client(format!("Upload ended after {} of {} bytes", index, length))
                }
                _ => ServerError::Io(e),
            })?;
            remaining -= want;

            let piece = UploadChunk {
                filename: &filename,
                field: None,
                content_type: content_type.as_deref(),
                index,
                data: &buf[..want],
                is_final: remaining == 0,
            };
            (on_chunk)(request, &piece)?;
            index += want as u64;
        }
        Ok(())
    }

    fn stream_multipart(&self, request: &mut Request<'_>, on_chunk: &UploadHandler) -> ServerResult<()> {
        let length = request.content_length();
        self.check_upload_size(length)?;

        let boundary = request
            .content_type()
            .and_then(multipart::boundary_from)
            .ok_or_else(|| ServerError::Client("Multipart body without boundary".to_string()))?;
        let reader = request
            .take_body_reader()
            .ok_or_else(|| ServerError::Client("Request body unavailable".to_string()))?;
        let mut limited = reader.take(length as u64);

        let parts = MultipartReader::new(&mut limited, &boundary, self.config.file_chunk_size).for_each_chunk(
            |part, offset, data, last| {
                let piece = UploadChunk {
                    filename: part.filename.as_deref().unwrap_or_default(),
                    field: Some(part.name.as_str()),
                    content_type: part.content_type.as_deref(),
                    index: offset,
                    data,
                    is_final: last,
                };
                (on_chunk)(request, &piece)
            },
        )?;
        log::debug!("Multipart upload with {} parts", parts);
        Ok(())
    }

    fn upgrade(
        &self,
        index: usize,
        request: &mut Request<'_>,
        response: &mut Response<'_>,
        on_connect: Option<&WebSocketConnectHandler>,
    ) -> ServerResult<Dispatched> {
        let key = request
            .header("sec-websocket-key")
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ServerError::Client("Missing Sec-WebSocket-Key".to_string()))?;
        let accept = tungstenite::handshake::derive_accept_key(key.as_bytes());

        response.set_code(Status::SwitchingProtocols);
        response.add_header("Upgrade", "websocket");
        response.add_header("Connection", "Upgrade");
        response.add_header("Sec-WebSocket-Accept", &accept);
        response.send()?;

        let (connection, frames) = self.registry.register(request.connection_id(), index);
        metrics::increment_counter!("ws_upgrades_total");
        if let Some(on_connect) = on_connect {
            (on_connect)(request, &connection)?;
        }
        Ok(Dispatched::Upgraded { connection, frames })
    }
}

fn complete_upload(
    on_complete: Option<&RequestHandler>,
    request: &mut Request<'_>,
    response: &mut Response<'_>,
) -> ServerResult<()> {
    match on_complete {
        Some(handler) => (handler)(request, response),
        None => response.reply(Status::Ok, "text/plain", "Upload Successful"),
    }
}
