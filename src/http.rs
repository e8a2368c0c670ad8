use crate::error::{ServerError, ServerResult};
use std::fmt;
use std::str::{self, FromStr};

/// HTTP Status Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Continue = 100,
    SwitchingProtocols = 101,

    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,

    MovedPermanently = 301,
    Found = 302,
    NotModified = 304,

    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    RequestTimeout = 408,
    PayloadTooLarge = 413,
    UnsupportedMediaType = 415,

    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
}

impl Status {
    /// Get the text description for this status code
    pub fn as_str(&self) -> &'static str {
        match *self {
            Status::Continue => "Continue",
            Status::SwitchingProtocols => "Switching Protocols",

            Status::Ok => "OK",
            Status::Created => "Created",
            Status::Accepted => "Accepted",
            Status::NoContent => "No Content",

            Status::MovedPermanently => "Moved Permanently",
            Status::Found => "Found",
            Status::NotModified => "Not Modified",

            Status::BadRequest => "Bad Request",
            Status::Unauthorized => "Unauthorized",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::RequestTimeout => "Request Timeout",
            Status::PayloadTooLarge => "Payload Too Large",
            Status::UnsupportedMediaType => "Unsupported Media Type",

            Status::InternalServerError => "Internal Server Error",
            Status::NotImplemented => "Not Implemented",
            Status::BadGateway => "Bad Gateway",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }

    /// Numeric status code
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Statuses that never carry a body
    pub fn is_bodyless(&self) -> bool {
        matches!(
            self,
            Status::Continue | Status::SwitchingProtocols | Status::NoContent | Status::NotModified
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.as_str())
    }
}

/// HTTP Methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
    Patch,
}

impl Method {
    /// Convert the method to a string
    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
        }
    }
}

impl FromStr for Method {
    type Err = ServerError;

    fn from_str(s: &str) -> ServerResult<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "CONNECT" => Ok(Method::Connect),
            "PATCH" => Ok(Method::Patch),
            _ => Err(ServerError::HttpParse(format!("Invalid method: {}", s))),
        }
    }
}

/// Ordered header fields. Names keep their original case, lookups ignore it,
/// and a field may appear more than once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, keeping any earlier field with the same name
    pub fn append(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_string(), value.to_string()));
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value for `name`, in arrival order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Already-parsed fields of an inbound transaction
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target as received, query string included
    pub uri: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
        }
    }

    /// Builder-style header append, mostly for transports and tests
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Path part of the URI
    pub fn path(&self) -> &str {
        match self.uri.find('?') {
            Some(pos) => &self.uri[..pos],
            None => &self.uri,
        }
    }

    /// Query part of the URI, without the `?`
    pub fn query(&self) -> &str {
        match self.uri.find('?') {
            Some(pos) => &self.uri[pos + 1..],
            None => "",
        }
    }

    /// Declared body length, zero when absent. Heads from [`HttpParser`] have
    /// already passed [`RequestHead::body_length`].
    pub fn content_length(&self) -> usize {
        self.body_length().unwrap_or(0)
    }

    /// Validated body framing. Only `Content-Length` bodies are accepted: the
    /// value must be plain digits and repeated fields must agree.
    pub fn body_length(&self) -> ServerResult<usize> {
        if self.headers.contains("transfer-encoding") {
            return Err(ServerError::Unsupported("Transfer-Encoding request bodies".to_string()));
        }

        let mut length = None;
        for value in self.headers.get_all("content-length") {
            let value = value.trim();
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ServerError::HttpParse(format!("Invalid Content-Length: {}", value)));
            }
            let parsed: usize = value
                .parse()
                .map_err(|_| ServerError::HttpParse(format!("Content-Length out of range: {}", value)))?;
            match length {
                Some(previous) if previous != parsed => {
                    return Err(ServerError::HttpParse("Conflicting Content-Length fields".to_string()));
                }
                _ => length = Some(parsed),
            }
        }
        Ok(length.unwrap_or(0))
    }

    /// Whether the client asked for a WebSocket upgrade
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Whether the client wants the connection kept open after this exchange
    pub fn keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(value) if value.eq_ignore_ascii_case("close") => false,
            Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version != "HTTP/1.0",
        }
    }
}

/// HTTP Parser State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpParserState {
    Head,
    Complete,
}

/// Incremental parser for the request line and header block. The body is left
/// on the wire for the request to pull on demand.
pub struct HttpParser {
    pub state: HttpParserState,
    buffer: Vec<u8>,
    max_head_size: usize,
    head: Option<RequestHead>,
    body_prefix: Vec<u8>,
}

impl HttpParser {
    /// Create a new HTTP parser
    pub fn new(max_head_size: usize) -> Self {
        Self {
            state: HttpParserState::Head,
            buffer: Vec::new(),
            max_head_size,
            head: None,
            body_prefix: Vec::new(),
        }
    }

    /// Feed bytes from the wire. Returns true once the header block is complete.
    pub fn parse(&mut self, data: &[u8]) -> ServerResult<bool> {
        if self.state == HttpParserState::Complete {
            self.body_prefix.extend_from_slice(data);
            return Ok(true);
        }

        self.buffer.extend_from_slice(data);

        let headers_end = match find_subsequence(&self.buffer, b"\r\n\r\n") {
            Some(pos) => pos,
            None => {
                if self.buffer.len() > self.max_head_size {
                    return Err(ServerError::ResourceLimit("Request header too large".to_string()));
                }
                return Ok(false);
            }
        };
        if headers_end > self.max_head_size {
            return Err(ServerError::ResourceLimit("Request header too large".to_string()));
        }

        let head_str = str::from_utf8(&self.buffer[..headers_end])
            .map_err(|_| ServerError::HttpParse("Invalid UTF-8".to_string()))?;

        let mut lines = head_str.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| ServerError::HttpParse("Missing request line".to_string()))?;
        let mut head = Self::parse_request_line(request_line)?;

        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = Self::parse_header(line)?;
            head.headers.append(name, value);
        }
        head.body_length()?;

        self.body_prefix = self.buffer[headers_end + 4..].to_vec();
        self.buffer.clear();
        self.head = Some(head);
        self.state = HttpParserState::Complete;
        Ok(true)
    }

    /// Parse a request line
    fn parse_request_line(line: &str) -> ServerResult<RequestHead> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(ServerError::HttpParse("Invalid request line".to_string()));
        }

        let mut head = RequestHead::new(parts[0].parse()?, parts[1]);
        head.version = parts[2].to_string();
        Ok(head)
    }

    /// Parse a header line
    fn parse_header(line: &str) -> ServerResult<(&str, &str)> {
        match line.find(':') {
            Some(colon_idx) => Ok((line[..colon_idx].trim(), line[colon_idx + 1..].trim())),
            None => Err(ServerError::HttpParse("Invalid header".to_string())),
        }
    }

    /// Check if the parser has completed the header block
    pub fn is_complete(&self) -> bool {
        self.state == HttpParserState::Complete
    }

    /// Take the parsed head and any body bytes that arrived with it, resetting
    /// the parser for the next request on the connection.
    pub fn take(&mut self) -> ServerResult<(RequestHead, Vec<u8>)> {
        let head = self
            .head
            .take()
            .ok_or_else(|| ServerError::HttpParse("Request not complete".to_string()))?;
        let prefix = std::mem::take(&mut self.body_prefix);
        self.state = HttpParserState::Head;
        Ok((head, prefix))
    }
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
