pub mod auth;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod multipart;
pub mod request;
pub mod response;
pub mod server;
pub mod session;
pub mod static_files;
pub mod tcp;
pub mod websocket;

/// Re-exports of common components for easier access
pub use auth::AuthMethod;
pub use config::ServerConfig;
pub use endpoint::{Endpoint, EndpointHandler, TransactionKind, UploadChunk};
pub use error::{ServerError, ServerResult};
pub use http::{Headers, HttpParser, Method, RequestHead, Status};
pub use request::Request;
pub use response::{Content, Response};
pub use server::{Dispatched, Server};
pub use session::{ConnectionId, Session, SessionStore};
pub use static_files::{DiskFileSystem, FileSystem, StaticFileHandler};
pub use tcp::TcpTransport;
pub use websocket::{Frame, Opcode, WebSocketConnection, WebSocketRegistry};
