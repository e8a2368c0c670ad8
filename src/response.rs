use crate::error::{ServerError, ServerResult};
use crate::http::{Headers, Status};
use crate::static_files::{content_type_for, FileSystem};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;

const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
const DEFAULT_MAX_COOKIE_SIZE: usize = 256;
const DEFAULT_COOKIE_MAX_AGE: u64 = 60 * 60 * 24 * 30;

/// Body of an outgoing response
pub enum Content {
    Empty,
    Fixed(Vec<u8>),
    /// Pulled in bounded chunks at send time. Without a length the body is
    /// sent with chunked transfer encoding.
    Stream {
        reader: Box<dyn Read + Send>,
        length: Option<u64>,
    },
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::Empty => f.write_str("Empty"),
            Content::Fixed(body) => f.debug_tuple("Fixed").field(&body.len()).finish(),
            Content::Stream { length, .. } => {
                f.debug_struct("Stream").field("length", length).finish()
            }
        }
    }
}

/// Outgoing half of a transaction. Built up by a handler, then written out
/// exactly once.
pub struct Response<'a> {
    output: &'a mut dyn Write,
    status: Status,
    content_type: Option<String>,
    headers: Headers,
    content: Content,
    chunk_size: usize,
    max_cookie_size: usize,
    head_only: bool,
    sent: bool,
}

impl<'a> Response<'a> {
    /// Create a new response writing to `output`
    pub fn new(output: &'a mut dyn Write) -> Self {
        Self {
            output,
            status: Status::Ok,
            content_type: None,
            headers: Headers::new(),
            content: Content::Empty,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_cookie_size: DEFAULT_MAX_COOKIE_SIZE,
            head_only: false,
            sent: false,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_cookie_size(mut self, size: usize) -> Self {
        self.max_cookie_size = size;
        self
    }

    /// Send headers only, as for a HEAD request
    pub fn with_head_only(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    pub fn set_code(&mut self, status: Status) {
        self.status = status;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_string());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Append a header; earlier headers with the same name are kept
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.append(name, value);
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Queue a `Set-Cookie` header
    pub fn set_cookie(&mut self, key: &str, value: &str, max_age: u64) -> ServerResult<()> {
        let cookie = format!("{}={}; Max-Age={}; Path=/", key, value, max_age);
        if cookie.len() > self.max_cookie_size {
            return Err(ServerError::ResourceLimit(format!(
                "Cookie {} exceeds {} bytes",
                key, self.max_cookie_size
            )));
        }
        self.add_header("Set-Cookie", &cookie);
        Ok(())
    }

    /// `set_cookie` with a thirty day lifetime
    pub fn set_session_cookie(&mut self, key: &str, value: &str) -> ServerResult<()> {
        self.set_cookie(key, value, DEFAULT_COOKIE_MAX_AGE)
    }

    /// Set a fixed body; its length becomes the content length
    pub fn set_content(&mut self, content: &[u8]) {
        self.content = Content::Fixed(content.to_vec());
    }

    /// Stream the body from `reader`
    pub fn set_stream(&mut self, reader: Box<dyn Read + Send>, length: Option<u64>) {
        self.content = Content::Stream { reader, length };
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Length that will be announced, if known before sending
    pub fn content_length(&self) -> Option<u64> {
        match &self.content {
            Content::Empty => Some(0),
            Content::Fixed(body) => Some(body.len() as u64),
            Content::Stream { length, .. } => *length,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Drop everything a handler set so an error status can be sent instead
    pub(crate) fn reset(&mut self) {
        self.status = Status::Ok;
        self.content_type = None;
        self.headers = Headers::new();
        self.content = Content::Empty;
    }

    /// Set status, type and body, then send
    pub fn reply(&mut self, status: Status, content_type: &str, body: &str) -> ServerResult<()> {
        self.set_code(status);
        self.set_content_type(content_type);
        self.set_content(body.as_bytes());
        self.send()
    }

    /// Send a bare status with its reason phrase as the body
    pub fn reply_status(&mut self, status: Status) -> ServerResult<()> {
        self.reply(status, "text/plain", status.as_str())
    }

    /// 302 to `url`
    pub fn redirect(&mut self, url: &str) -> ServerResult<()> {
        self.set_code(Status::Found);
        self.add_header("Location", url);
        self.content = Content::Empty;
        self.send()
    }

    /// Stream a file from `fs`. The content type follows the extension; with
    /// `download` the client is told to save it rather than display it.
    pub fn send_file(&mut self, fs: &dyn FileSystem, path: &Path, download: bool) -> ServerResult<()> {
        let stat = match fs.stat(path) {
            Ok(stat) if !stat.is_dir => stat,
            _ => return Err(ServerError::NotFound(path.display().to_string())),
        };
        let file = fs.open(path)?;

        self.set_content_type(content_type_for(path));
        if download {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("download");
            self.add_header("Content-Disposition", &format!("attachment; filename=\"{}\"", name));
        }
        self.set_stream(file, Some(stat.len));
        self.send()
    }

    /// Write status line, headers and body. May only be called once.
    pub fn send(&mut self) -> ServerResult<()> {
        if self.sent {
            log::error!("Response {} sent twice", self.status.code());
            return Err(ServerError::AlreadySent);
        }
        self.sent = true;

        let content = std::mem::replace(&mut self.content, Content::Empty);
        let bodyless = self.status.is_bodyless();

        let mut head = Vec::with_capacity(256);
        write!(head, "HTTP/1.1 {} {}\r\n", self.status.code(), self.status.as_str())?;
        if let Some(content_type) = &self.content_type {
            if !bodyless {
                write!(head, "Content-Type: {}\r\n", content_type)?;
            }
        }
        for (name, value) in self.headers.iter() {
            write!(head, "{}: {}\r\n", name, value)?;
        }

        let chunked = matches!(content, Content::Stream { length: None, .. });
        if !bodyless {
            match self.content_length_of(&content) {
                Some(length) => write!(head, "Content-Length: {}\r\n", length)?,
                None => write!(head, "Transfer-Encoding: chunked\r\n")?,
            }
        }
        head.extend_from_slice(b"\r\n");
        self.output.write_all(&head)?;

        if bodyless || self.head_only {
            self.output.flush()?;
            return Ok(());
        }

        match content {
            Content::Empty => {}
            Content::Fixed(body) => self.output.write_all(&body)?,
            Content::Stream { reader, length } => {
                if chunked {
                    self.write_chunked(reader)?;
                } else {
                    self.write_sized(reader, length.unwrap_or(0))?;
                }
            }
        }

        self.output.flush()?;
        Ok(())
    }

    fn content_length_of(&self, content: &Content) -> Option<u64> {
        match content {
            Content::Empty => Some(0),
            Content::Fixed(body) => Some(body.len() as u64),
            Content::Stream { length, .. } => *length,
        }
    }

    fn write_sized(&mut self, reader: Box<dyn Read + Send>, length: u64) -> ServerResult<()> {
        let mut reader = reader.take(length);
        let mut buf = vec![0u8; self.chunk_size];
        let mut written = 0u64;

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Read failed after {} of {} bytes: {}", written, length, e);
                    return Err(ServerError::Io(e));
                }
            };
            self.output.write_all(&buf[..n])?;
            written += n as u64;
        }

        if written < length {
            log::error!("Body ended after {} of {} bytes", written, length);
            return Err(ServerError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "content shorter than announced length",
            )));
        }
        Ok(())
    }

    fn write_chunked(&mut self, mut reader: Box<dyn Read + Send>) -> ServerResult<()> {
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Read failed during chunked send: {}", e);
                    return Err(ServerError::Io(e));
                }
            };
            write!(self.output, "{:X}\r\n", n)?;
            self.output.write_all(&buf[..n])?;
            self.output.write_all(b"\r\n")?;
        }

        self.output.write_all(b"0\r\n\r\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sent(response_fn: impl FnOnce(&mut Response<'_>)) -> String {
        let mut out = Vec::new();
        {
            let mut response = Response::new(&mut out).with_chunk_size(4);
            response_fn(&mut response);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_fixed_content() {
        let text = sent(|r| {
            r.set_content_type("text/plain");
            r.set_content(b"Hello, World!");
            r.send().unwrap();
        });
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.ends_with("\r\n\r\nHello, World!"));
    }

    #[test]
    fn test_duplicate_headers_preserved_in_order() {
        let text = sent(|r| {
            r.add_header("X-Trace", "one");
            r.add_header("X-Other", "mid");
            r.add_header("X-Trace", "two");
            r.send().unwrap();
        });
        let first = text.find("X-Trace: one").unwrap();
        let mid = text.find("X-Other: mid").unwrap();
        let second = text.find("X-Trace: two").unwrap();
        assert!(first < mid && mid < second);
    }

    #[test]
    fn test_cookie_format_and_limit() {
        let text = sent(|r| {
            r.set_cookie("session", "abc", 3600).unwrap();
            let long = "x".repeat(300);
            assert!(matches!(r.set_cookie("big", &long, 1), Err(ServerError::ResourceLimit(_))));
            r.send().unwrap();
        });
        assert!(text.contains("Set-Cookie: session=abc; Max-Age=3600; Path=/\r\n"));
        assert!(!text.contains("big="));
    }

    #[test]
    fn test_chunked_stream_with_terminator() {
        let text = sent(|r| {
            r.set_stream(Box::new(Cursor::new(b"abcdefghij".to_vec())), None);
            r.send().unwrap();
        });
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n4\r\nabcd\r\n4\r\nefgh\r\n2\r\nij\r\n0\r\n\r\n"));
    }

    #[test]
    fn test_sized_stream_short_read_fails() {
        let mut out = Vec::new();
        let mut response = Response::new(&mut out);
        response.set_stream(Box::new(Cursor::new(b"abc".to_vec())), Some(10));
        assert!(matches!(response.send(), Err(ServerError::Io(_))));
    }

    #[test]
    fn test_second_send_reported() {
        let mut out = Vec::new();
        let mut response = Response::new(&mut out);
        response.reply_status(Status::NoContent).unwrap();
        assert!(response.is_sent());
        assert!(matches!(response.send(), Err(ServerError::AlreadySent)));
    }

    #[test]
    fn test_not_modified_has_no_body_or_length() {
        let text = sent(|r| {
            r.set_code(Status::NotModified);
            r.set_content(b"ignored");
            r.send().unwrap();
        });
        assert_eq!(text, "HTTP/1.1 304 Not Modified\r\n\r\n");
    }

    #[test]
    fn test_redirect() {
        let text = sent(|r| r.redirect("/login").unwrap());
        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(text.contains("Location: /login\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }
}
