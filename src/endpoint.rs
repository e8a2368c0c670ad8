use crate::error::ServerResult;
use crate::http::{Method, RequestHead};
use crate::request::Request;
use crate::response::Response;
use crate::websocket::{Frame, WebSocketConnection};
use std::fmt;
use std::sync::Arc;

/// Handles a whole request whose body, if any, is already loaded
pub type RequestHandler = Arc<dyn Fn(&mut Request<'_>, &mut Response<'_>) -> ServerResult<()> + Send + Sync>;

/// Receives an upload one bounded chunk at a time
pub type UploadHandler = Arc<dyn Fn(&mut Request<'_>, &UploadChunk<'_>) -> ServerResult<()> + Send + Sync>;

/// Runs once when a client completes a WebSocket upgrade
pub type WebSocketConnectHandler =
    Arc<dyn Fn(&mut Request<'_>, &WebSocketConnection) -> ServerResult<()> + Send + Sync>;

/// Runs for every frame received on an upgraded connection
pub type WebSocketFrameHandler = Arc<dyn Fn(&WebSocketConnection, &Frame) -> ServerResult<()> + Send + Sync>;

/// One piece of an uploaded file
#[derive(Debug, Clone, Copy)]
pub struct UploadChunk<'a> {
    pub filename: &'a str,
    /// Form field name, for multipart parts
    pub field: Option<&'a str>,
    pub content_type: Option<&'a str>,
    /// Offset of `data` within the file
    pub index: u64,
    pub data: &'a [u8],
    pub is_final: bool,
}

/// What kind of transaction arrived, judged from its headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    WebSocket,
    Multipart,
    Raw,
    Plain,
}

impl TransactionKind {
    pub fn detect(head: &RequestHead) -> Self {
        if head.is_websocket_upgrade() {
            return TransactionKind::WebSocket;
        }
        let multipart = head
            .headers
            .get("content-type")
            .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
            .unwrap_or(false);
        if multipart {
            TransactionKind::Multipart
        } else if head.content_length() > 0 {
            TransactionKind::Raw
        } else {
            TransactionKind::Plain
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::WebSocket => "websocket",
            TransactionKind::Multipart => "multipart",
            TransactionKind::Raw => "raw",
            TransactionKind::Plain => "plain",
        }
    }
}

/// The one kind of handler an endpoint runs
#[derive(Clone)]
pub enum EndpointHandler {
    Request(RequestHandler),
    Upload {
        on_chunk: UploadHandler,
        on_complete: Option<RequestHandler>,
    },
    Multipart {
        on_chunk: UploadHandler,
        on_complete: Option<RequestHandler>,
    },
    WebSocket {
        on_connect: Option<WebSocketConnectHandler>,
        on_frame: Option<WebSocketFrameHandler>,
    },
}

impl EndpointHandler {
    fn name(&self) -> &'static str {
        match self {
            EndpointHandler::Request(_) => "request",
            EndpointHandler::Upload { .. } => "upload",
            EndpointHandler::Multipart { .. } => "multipart",
            EndpointHandler::WebSocket { .. } => "websocket",
        }
    }

    /// Whether this handler takes transactions of `kind`
    pub fn accepts(&self, kind: TransactionKind) -> bool {
        match self {
            EndpointHandler::Request(_) | EndpointHandler::Upload { .. } => kind != TransactionKind::WebSocket,
            EndpointHandler::Multipart { .. } => kind == TransactionKind::Multipart,
            EndpointHandler::WebSocket { .. } => kind == TransactionKind::WebSocket,
        }
    }
}

impl fmt::Debug for EndpointHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointHandler::{}(<function>)", self.name())
    }
}

/// A route (method + exact path) and its handler
#[derive(Clone)]
pub struct Endpoint {
    method: Method,
    uri: String,
    handler: Option<EndpointHandler>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("handler", &self.handler)
            .finish()
    }
}

impl Endpoint {
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            handler: None,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn handler(&self) -> Option<&EndpointHandler> {
        self.handler.as_ref()
    }

    /// Exact method and path match
    pub fn matches(&self, method: Method, path: &str) -> bool {
        self.method == method && self.uri == path
    }

    fn replace(&mut self, handler: EndpointHandler) {
        if let Some(previous) = &self.handler {
            log::warn!(
                "{} {}: {} handler replaced by {} handler",
                self.method.as_str(),
                self.uri,
                previous.name(),
                handler.name()
            );
        }
        self.handler = Some(handler);
    }

    /// Handle plain requests. On an upload or multipart endpoint this instead
    /// sets the handler that answers once the upload has been consumed.
    pub fn on_request<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut Request<'_>, &mut Response<'_>) -> ServerResult<()> + Send + Sync + 'static,
    {
        let handler: RequestHandler = Arc::new(handler);
        match &mut self.handler {
            Some(EndpointHandler::Upload { on_complete, .. })
            | Some(EndpointHandler::Multipart { on_complete, .. }) => *on_complete = Some(handler),
            _ => self.replace(EndpointHandler::Request(handler)),
        }
        self
    }

    /// Stream request bodies to `handler` as raw chunks
    pub fn on_upload<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut Request<'_>, &UploadChunk<'_>) -> ServerResult<()> + Send + Sync + 'static,
    {
        let on_complete = self.take_completion();
        self.replace(EndpointHandler::Upload {
            on_chunk: Arc::new(handler),
            on_complete,
        });
        self
    }

    /// Decode `multipart/form-data` bodies and stream each part to `handler`
    pub fn on_multipart<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut Request<'_>, &UploadChunk<'_>) -> ServerResult<()> + Send + Sync + 'static,
    {
        let on_complete = self.take_completion();
        self.replace(EndpointHandler::Multipart {
            on_chunk: Arc::new(handler),
            on_complete,
        });
        self
    }

    /// Run `handler` when a client upgrades on this endpoint
    pub fn on_connect<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut Request<'_>, &WebSocketConnection) -> ServerResult<()> + Send + Sync + 'static,
    {
        match &mut self.handler {
            Some(EndpointHandler::WebSocket { on_connect, .. }) => *on_connect = Some(Arc::new(handler)),
            _ => self.replace(EndpointHandler::WebSocket {
                on_connect: Some(Arc::new(handler)),
                on_frame: None,
            }),
        }
        self
    }

    /// Run `handler` for each frame received on this endpoint's connections
    pub fn on_frame<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&WebSocketConnection, &Frame) -> ServerResult<()> + Send + Sync + 'static,
    {
        match &mut self.handler {
            Some(EndpointHandler::WebSocket { on_frame, .. }) => *on_frame = Some(Arc::new(handler)),
            _ => self.replace(EndpointHandler::WebSocket {
                on_connect: None,
                on_frame: Some(Arc::new(handler)),
            }),
        }
        self
    }

    /// Mark the endpoint as a WebSocket endpoint before any handler is set
    pub(crate) fn make_websocket(&mut self) {
        if self.handler.is_none() {
            self.handler = Some(EndpointHandler::WebSocket {
                on_connect: None,
                on_frame: None,
            });
        }
    }

    fn take_completion(&mut self) -> Option<RequestHandler> {
        match self.handler.take() {
            Some(EndpointHandler::Upload { on_complete, .. })
            | Some(EndpointHandler::Multipart { on_complete, .. }) => on_complete,
            other => {
                self.handler = other;
                None
            }
        }
    }
}
