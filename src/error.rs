use crate::http::Status;
use std::io;
use thiserror::Error;

/// Main error type for the server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP parsing error: {0}")]
    HttpParse(String),

    /// Malformed or missing request data, or a transaction the endpoint cannot take
    #[error("Bad request: {0}")]
    Client(String),

    /// A request feature this server does not implement, e.g. chunked request bodies
    #[error("Not implemented: {0}")]
    Unsupported(String),

    #[error("Authentication required")]
    AuthRequired,

    /// Unmatched route, missing file, or a path escaping the static root
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Handler error: {0}")]
    Handler(String),

    /// Local WebSocket failure, e.g. a full or disconnected send queue
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Response already sent")]
    AlreadySent,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    /// The status a dispatch reports when a handler fails with this error
    pub fn status(&self) -> Status {
        match self {
            ServerError::HttpParse(_) | ServerError::Client(_) => Status::BadRequest,
            ServerError::AuthRequired => Status::Unauthorized,
            ServerError::NotFound(_) => Status::NotFound,
            ServerError::ResourceLimit(_) => Status::PayloadTooLarge,
            ServerError::Unsupported(_) => Status::NotImplemented,
            _ => Status::InternalServerError,
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
