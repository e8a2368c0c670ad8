use crate::auth::{self, AuthMethod, ChallengeStore};
use crate::error::{ServerError, ServerResult};
use crate::http::{Headers, Method, RequestHead, Status};
use crate::response::Response;
use crate::session::{ConnectionId, Session, SessionStore};
use std::fmt;
use std::io::Read;
use std::sync::Arc;

const DEFAULT_REALM: &str = "Login Required";

/// Server state a request needs beyond its own fields
#[derive(Clone, Copy)]
pub struct RequestContext<'a> {
    pub connection_id: ConnectionId,
    pub sessions: &'a SessionStore,
    pub challenges: &'a ChallengeStore,
    pub max_body_size: usize,
}

enum Body {
    Pending,
    Loaded(Vec<u8>),
    /// Handed to an upload handler chunk by chunk
    Streamed,
    Failed,
}

/// Incoming half of a transaction
pub struct Request<'a> {
    head: RequestHead,
    reader: Option<&'a mut dyn Read>,
    body: Body,
    ctx: RequestContext<'a>,
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .field("connection_id", &self.ctx.connection_id)
            .finish()
    }
}

impl<'a> Request<'a> {
    pub fn new(head: RequestHead, reader: &'a mut dyn Read, ctx: RequestContext<'a>) -> Self {
        Self {
            head,
            reader: Some(reader),
            body: Body::Pending,
            ctx,
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn method(&self) -> Method {
        self.head.method
    }

    pub fn method_str(&self) -> &'static str {
        self.head.method.as_str()
    }

    /// Request target, query string included
    pub fn uri(&self) -> &str {
        &self.head.uri
    }

    pub fn path(&self) -> &str {
        self.head.path()
    }

    pub fn query_string(&self) -> &str {
        self.head.query()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.ctx.connection_id
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.head.headers.contains(name)
    }

    /// Every value of a repeated header, in arrival order
    pub fn header_values<'h>(&'h self, name: &'h str) -> impl Iterator<Item = &'h str> + 'h {
        self.head.headers.get_all(name)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn content_length(&self) -> usize {
        self.head.content_length()
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type()
            .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
            .unwrap_or(false)
    }

    fn is_form_encoded(&self) -> bool {
        self.content_type()
            .map(|ct| {
                ct.trim_start()
                    .to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            })
            .unwrap_or(false)
    }

    /// Value of cookie `key` from the `Cookie` header
    pub fn get_cookie(&self, key: &str) -> Option<String> {
        self.head.headers.get_all("cookie").find_map(|header| {
            header.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name.trim() == key).then(|| value.trim().to_string())
            })
        })
    }

    pub fn has_cookie(&self, key: &str) -> bool {
        self.get_cookie(key).is_some()
    }

    /// Read the whole body into memory. Fails without reading when the
    /// declared length is over the configured maximum. Runs at most once.
    pub fn load_body(&mut self) -> ServerResult<()> {
        match self.body {
            Body::Loaded(_) => return Ok(()),
            Body::Streamed => {
                return Err(ServerError::Client("Request body was already streamed".to_string()))
            }
            Body::Failed => return Err(ServerError::Client("Request body could not be loaded".to_string())),
            Body::Pending => {}
        }

        let length = self.content_length();
        if length > self.ctx.max_body_size {
            self.body = Body::Failed;
            return Err(ServerError::ResourceLimit(format!(
                "Body of {} bytes exceeds the {} byte limit",
                length, self.ctx.max_body_size
            )));
        }

        let mut body = Vec::with_capacity(length);
        if length > 0 {
            let reader = match self.reader.take() {
                Some(reader) => reader,
                None => {
                    self.body = Body::Failed;
                    return Err(ServerError::Client("Request body unavailable".to_string()));
                }
            };
            if let Err(e) = reader.take(length as u64).read_to_end(&mut body) {
                self.body = Body::Failed;
                return Err(ServerError::Io(e));
            }
            if body.len() < length {
                self.body = Body::Failed;
                return Err(ServerError::Client(format!(
                    "Body ended after {} of {} bytes",
                    body.len(),
                    length
                )));
            }
        }

        self.body = Body::Loaded(body);
        Ok(())
    }

    /// Loaded body; empty until `load_body` succeeds
    pub fn body(&self) -> &[u8] {
        match &self.body {
            Body::Loaded(body) => body,
            _ => &[],
        }
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(self.body()).ok()
    }

    /// Hand the unread body over to a streaming consumer
    pub(crate) fn take_body_reader(&mut self) -> Option<&'a mut dyn Read> {
        match self.body {
            Body::Pending => {
                self.body = Body::Streamed;
                self.reader.take()
            }
            _ => None,
        }
    }

    /// Query parameter `name`, falling back to a form-encoded body once loaded
    pub fn get_param(&self, name: &str) -> Option<String> {
        let from_query = url::form_urlencoded::parse(self.query_string().as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned());
        if from_query.is_some() {
            return from_query;
        }

        if self.is_form_encoded() {
            if let Body::Loaded(body) = &self.body {
                return url::form_urlencoded::parse(body)
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value.into_owned());
            }
        }
        None
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.get_param(name).is_some()
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.ctx.sessions.get(self.ctx.connection_id)?.upgrade()
    }

    pub fn has_session_key(&self, key: &str) -> bool {
        self.session().map(|s| s.contains(key)).unwrap_or(false)
    }

    pub fn get_session_key(&self, key: &str) -> Option<String> {
        self.session()?.get(key)
    }

    /// Store a value in this connection's session, creating it if needed
    pub fn set_session_key(&self, key: &str, value: &str) {
        if let Some(session) = self.ctx.sessions.get_or_create(self.ctx.connection_id).upgrade() {
            session.set(key, value);
        }
    }

    /// Check the `Authorization` header against the given credentials
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let Some(authorization) = self.header("authorization") else {
            return false;
        };
        let authorization = authorization.trim();

        if let Some(credentials) = authorization.strip_prefix("Basic ") {
            auth::check_basic(credentials, username, password)
        } else if let Some(params) = authorization.strip_prefix("Digest ") {
            auth::check_digest(
                params,
                username,
                password,
                self.method(),
                self.uri(),
                self.ctx.challenges,
            )
        } else {
            false
        }
    }

    /// Send a 401 carrying a fresh challenge
    pub fn request_authentication(
        &self,
        response: &mut Response<'_>,
        mode: AuthMethod,
        realm: &str,
        fail_message: &str,
    ) -> ServerResult<()> {
        let realm = if realm.is_empty() { DEFAULT_REALM } else { realm };

        response.set_code(Status::Unauthorized);
        match mode {
            AuthMethod::Basic => {
                response.add_header("WWW-Authenticate", &format!("Basic realm=\"{}\"", realm));
            }
            AuthMethod::Digest => {
                let challenge = self.ctx.challenges.issue(realm);
                response.add_header("WWW-Authenticate", &challenge.header_value());
            }
        }

        let message = if fail_message.is_empty() {
            Status::Unauthorized.as_str()
        } else {
            fail_message
        };
        response.set_content_type("text/plain");
        response.set_content(message.as_bytes());
        response.send()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{digest_response, extract_param};
    use std::io::{Cursor, Read};

    struct Fixture {
        sessions: SessionStore,
        challenges: ChallengeStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                sessions: SessionStore::new(),
                challenges: ChallengeStore::new(),
            }
        }

        fn ctx(&self, connection_id: ConnectionId) -> RequestContext<'_> {
            RequestContext {
                connection_id,
                sessions: &self.sessions,
                challenges: &self.challenges,
                max_body_size: 16,
            }
        }
    }

    /// Reader that fails the test if anything pulls from it
    struct Untouched;

    impl Read for Untouched {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            panic!("body must not be read");
        }
    }

    #[test]
    fn test_cookies() {
        let fx = Fixture::new();
        let head = RequestHead::new(Method::Get, "/")
            .with_header("Cookie", "theme=dark;  session = abc123 ; Empty=");
        let mut body = Cursor::new(Vec::new());
        let request = Request::new(head, &mut body, fx.ctx(1));

        assert_eq!(request.get_cookie("session").as_deref(), Some("abc123"));
        assert_eq!(request.get_cookie("theme").as_deref(), Some("dark"));
        assert_eq!(request.get_cookie("Empty").as_deref(), Some(""));
        assert!(!request.has_cookie("THEME"));
    }

    #[test]
    fn test_params_from_query_and_form_body() {
        let fx = Fixture::new();
        let head = RequestHead::new(Method::Post, "/save?name=J%C3%BCrgen&flag")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_header("Content-Length", "13");
        let mut body = Cursor::new(b"color=dark+ed".to_vec());
        let mut request = Request::new(head, &mut body, fx.ctx(1));

        assert_eq!(request.get_param("name").as_deref(), Some("Jürgen"));
        assert!(request.has_param("flag"));
        assert!(!request.has_param("color"));

        request.load_body().unwrap();
        assert_eq!(request.get_param("color").as_deref(), Some("dark ed"));
    }

    #[test]
    fn test_load_body_once() {
        let fx = Fixture::new();
        let head = RequestHead::new(Method::Post, "/").with_header("Content-Length", "5");
        let mut body = Cursor::new(b"hello".to_vec());
        let mut request = Request::new(head, &mut body, fx.ctx(1));

        request.load_body().unwrap();
        request.load_body().unwrap();
        assert_eq!(request.body(), b"hello");
        assert_eq!(request.body_str(), Some("hello"));
    }

    #[test]
    fn test_oversized_body_rejected_before_reading() {
        let fx = Fixture::new();
        let head = RequestHead::new(Method::Post, "/").with_header("Content-Length", "1048576");
        let mut body = Untouched;
        let mut request = Request::new(head, &mut body, fx.ctx(1));

        assert!(matches!(request.load_body(), Err(ServerError::ResourceLimit(_))));
        assert!(request.body().is_empty());
        assert!(matches!(request.load_body(), Err(ServerError::Client(_))));
    }

    #[test]
    fn test_short_body_is_client_error() {
        let fx = Fixture::new();
        let head = RequestHead::new(Method::Post, "/").with_header("Content-Length", "10");
        let mut body = Cursor::new(b"abc".to_vec());
        let mut request = Request::new(head, &mut body, fx.ctx(1));
        assert!(matches!(request.load_body(), Err(ServerError::Client(_))));
    }

    #[test]
    fn test_session_scoped_to_connection() {
        let fx = Fixture::new();
        let mut body = Cursor::new(Vec::new());
        let first = Request::new(RequestHead::new(Method::Get, "/"), &mut body, fx.ctx(1));
        assert!(!first.has_session_key("a"));
        first.set_session_key("a", "1");
        assert_eq!(first.get_session_key("a").as_deref(), Some("1"));

        let mut body = Cursor::new(Vec::new());
        let other = Request::new(RequestHead::new(Method::Get, "/"), &mut body, fx.ctx(2));
        assert!(!other.has_session_key("a"));
    }

    #[test]
    fn test_basic_authentication() {
        let fx = Fixture::new();
        let header = format!("Basic {}", base64::encode("admin:password"));
        let head = RequestHead::new(Method::Get, "/").with_header("Authorization", &header);
        let mut body = Cursor::new(Vec::new());
        let request = Request::new(head, &mut body, fx.ctx(1));

        assert!(request.authenticate("admin", "password"));
        assert!(!request.authenticate("admin", "nope"));
    }

    #[test]
    fn test_digest_challenge_and_response() {
        let fx = Fixture::new();

        // Challenge
        let mut out = Vec::new();
        let mut body = Cursor::new(Vec::new());
        let request = Request::new(RequestHead::new(Method::Get, "/secure"), &mut body, fx.ctx(1));
        {
            let mut response = Response::new(&mut out);
            request
                .request_authentication(&mut response, AuthMethod::Digest, "device", "")
                .unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        let challenge_line = text
            .lines()
            .find(|l| l.starts_with("WWW-Authenticate: Digest "))
            .unwrap();
        let nonce = extract_param(challenge_line, "nonce").unwrap();
        let opaque = extract_param(challenge_line, "opaque").unwrap();
        assert_eq!(extract_param(challenge_line, "realm").as_deref(), Some("device"));

        let authorization = |password: &str| {
            let response = digest_response(
                "admin",
                "device",
                password,
                Method::Get,
                "/secure",
                &nonce,
                Some(("auth", "00000001", "c0ffee")),
            );
            format!(
                "Digest username=\"admin\", realm=\"device\", nonce=\"{}\", uri=\"/secure\", \
                 qop=auth, nc=00000001, cnonce=\"c0ffee\", response=\"{}\", opaque=\"{}\"",
                nonce, response, opaque
            )
        };

        let head = RequestHead::new(Method::Get, "/secure")
            .with_header("Authorization", &authorization("letmein"));
        let mut body = Cursor::new(Vec::new());
        let request = Request::new(head, &mut body, fx.ctx(1));
        assert!(request.authenticate("admin", "letmein"));
        assert!(!request.authenticate("admin", "wrong"));

        // Response computed with the wrong password
        let head = RequestHead::new(Method::Get, "/secure")
            .with_header("Authorization", &authorization("guess"));
        let mut body = Cursor::new(Vec::new());
        let request = Request::new(head, &mut body, fx.ctx(1));
        assert!(!request.authenticate("admin", "letmein"));

        // A second challenge carries a different nonce
        let mut out = Vec::new();
        {
            let mut response = Response::new(&mut out);
            request
                .request_authentication(&mut response, AuthMethod::Digest, "device", "Denied")
                .unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        let line = text.lines().find(|l| l.starts_with("WWW-Authenticate")).unwrap();
        assert_ne!(extract_param(line, "nonce").unwrap(), nonce);
        assert!(text.ends_with("Denied"));
    }

    #[test]
    fn test_digest_with_unknown_nonce_fails() {
        let fx = Fixture::new();
        let response = digest_response("admin", "device", "pw", Method::Get, "/", "forged", None);
        let header = format!(
            "Digest username=\"admin\", realm=\"device\", nonce=\"forged\", uri=\"/\", response=\"{}\", opaque=\"x\"",
            response
        );
        let head = RequestHead::new(Method::Get, "/").with_header("Authorization", &header);
        let mut body = Cursor::new(Vec::new());
        let request = Request::new(head, &mut body, fx.ctx(1));
        assert!(!request.authenticate("admin", "pw"));
    }
}
