use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // Network configuration
    pub listen_address: String,
    pub port: u16,
    pub backlog_size: u32,

    // Connection settings
    pub connection_timeout: Duration,
    pub keep_alive: bool,

    // Thread configuration
    pub worker_threads: usize,

    // Limits
    pub max_header_size: usize,
    pub max_upload_size: usize,
    pub max_request_body_size: usize,
    pub max_cookie_size: usize,
    pub file_chunk_size: usize,

    // WebSocket settings
    pub ws_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 80,
            backlog_size: 128,

            connection_timeout: Duration::from_secs(30),
            keep_alive: true,

            worker_threads: num_cpus::get(),

            max_header_size: 8 * 1024,          // 8 KB
            max_upload_size: 200 * 1024,        // 200 KB
            max_request_body_size: 16 * 1024,   // 16 KB
            max_cookie_size: 256,
            file_chunk_size: 8 * 1024,          // 8 KB

            ws_queue_capacity: 32,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address and port to listen on
    pub fn with_address(mut self, address: &str, port: u16) -> Self {
        self.listen_address = address.to_string();
        self.port = port;
        self
    }

    /// Set the connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the number of worker threads
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the largest accepted upload, in bytes
    pub fn with_max_upload_size(mut self, size: usize) -> Self {
        self.max_upload_size = size;
        self
    }

    /// Set the largest request body loaded into memory, in bytes
    pub fn with_max_request_body_size(mut self, size: usize) -> Self {
        self.max_request_body_size = size;
        self
    }

    /// Set the chunk size used for uploads and file streaming
    pub fn with_file_chunk_size(mut self, size: usize) -> Self {
        self.file_chunk_size = size;
        self
    }

    /// Set how many frames may wait in a WebSocket connection's send queue
    pub fn with_ws_queue_capacity(mut self, capacity: usize) -> Self {
        self.ws_queue_capacity = capacity;
        self
    }

    /// Get the full address string (address:port)
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    /// Check the values that would make the server misbehave at runtime
    pub fn validate(&self) -> ServerResult<()> {
        if self.file_chunk_size == 0 {
            return Err(ServerError::Config("file_chunk_size must be non-zero".to_string()));
        }
        if self.worker_threads == 0 {
            return Err(ServerError::Config("worker_threads must be non-zero".to_string()));
        }
        if self.ws_queue_capacity == 0 {
            return Err(ServerError::Config("ws_queue_capacity must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_json_file<P: AsRef<Path>>(&self, path: P) -> ServerResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
