use crate::error::{ServerError, ServerResult};
use crate::http::{RequestHead, Status};
use crate::response::Response;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Get the content type for a file based on its extension
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "text/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/x-gzip",
        "wasm" => "application/wasm",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "ttf" => "application/x-font-ttf",
        "otf" => "application/x-font-opentype",
        "woff" => "application/font-woff",
        "woff2" => "application/font-woff2",
        "eot" => "font/eot",
        _ => "application/octet-stream",
    }
}

/// Format a timestamp as an HTTP-date
pub fn http_date(time: SystemTime) -> String {
    let time: DateTime<Utc> = time.into();
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Result of a stat on the filesystem collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub len: u64,
}

/// Filesystem access the static handler and `Response::send_file` rely on
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
    fn stat(&self, path: &Path) -> io::Result<FileStat>;
}

/// The host filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFileSystem;

impl FileSystem for DiskFileSystem {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = fs::metadata(path)?;
        Ok(FileStat {
            is_dir: meta.is_dir(),
            len: meta.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
}

/// Which variants of a file exist on disk. Both may.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodingSet {
    identity: bool,
    gzip: bool,
}

impl EncodingSet {
    pub fn insert(&mut self, encoding: Encoding) {
        match encoding {
            Encoding::Identity => self.identity = true,
            Encoding::Gzip => self.gzip = true,
        }
    }

    pub fn contains(&self, encoding: Encoding) -> bool {
        match encoding {
            Encoding::Identity => self.identity,
            Encoding::Gzip => self.gzip,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.identity && !self.gzip
    }
}

/// A file the handler decided to serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    /// Path of the uncompressed file, whether or not it exists
    pub path: PathBuf,
    pub available: EncodingSet,
    pub encoding: Encoding,
    pub len: u64,
}

impl ResolvedFile {
    /// Path of the variant actually served
    pub fn served_path(&self) -> PathBuf {
        match self.encoding {
            Encoding::Identity => self.path.clone(),
            Encoding::Gzip => gzip_sibling(&self.path),
        }
    }
}

fn gzip_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

/// Whether `Accept-Encoding` admits gzip
fn accepts_gzip(head: &RequestHead) -> bool {
    head.headers.get_all("accept-encoding").any(|value| {
        value.split(',').any(|item| {
            let mut parts = item.split(';');
            let coding = parts.next().unwrap_or("").trim();
            let refused = parts.any(|p| {
                let p = p.trim();
                p == "q=0" || p == "q=0.0" || p == "q=0.00" || p == "q=0.000"
            });
            (coding.eq_ignore_ascii_case("gzip") || coding == "*") && !refused
        })
    })
}

/// Serves a filesystem subtree under a URI prefix
pub struct StaticFileHandler {
    uri: String,
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
    default_file: Option<String>,
    cache_control: Option<String>,
    last_modified: Option<String>,
    gzip_first: bool,
}

impl StaticFileHandler {
    pub fn new(uri: &str, fs: Arc<dyn FileSystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            uri: uri.trim_end_matches('/').to_string(),
            fs,
            root: root.into(),
            default_file: Some("index.html".to_string()),
            cache_control: None,
            last_modified: None,
            gzip_first: true,
        }
    }

    /// File served for directory requests; `None` disables it
    pub fn set_default_file(&mut self, filename: Option<&str>) -> &mut Self {
        self.default_file = filename.map(str::to_string);
        self
    }

    pub fn set_cache_control(&mut self, cache_control: &str) -> &mut Self {
        self.cache_control = Some(cache_control.to_string());
        self
    }

    /// Stored as given and compared byte for byte against `If-Modified-Since`
    pub fn set_last_modified(&mut self, last_modified: &str) -> &mut Self {
        self.last_modified = Some(last_modified.to_string());
        self
    }

    pub fn set_last_modified_time(&mut self, time: SystemTime) -> &mut Self {
        self.last_modified = Some(http_date(time));
        self
    }

    /// Prefer `<file>.gz` over `<file>` when the client accepts both
    pub fn set_gzip_first(&mut self, gzip_first: bool) -> &mut Self {
        self.gzip_first = gzip_first;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Length of the prefix this handler claims for `path`, if any
    pub fn match_len(&self, path: &str) -> Option<usize> {
        if !path.starts_with(&self.uri) {
            return None;
        }
        match path.as_bytes().get(self.uri.len()) {
            None | Some(b'/') => Some(self.uri.len()),
            Some(_) if self.uri.is_empty() => Some(0),
            Some(_) => None,
        }
    }

    /// Map the request onto a file, if there is one to serve
    pub fn resolve(&self, head: &RequestHead) -> Option<ResolvedFile> {
        let path = head.path();
        let prefix_len = self.match_len(path)?;
        let relative = urlencoding::decode(&path[prefix_len..]).ok()?;

        let mut candidate = self.root.clone();
        for segment in relative.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    // Never walk above the root
                    if candidate == self.root || !candidate.pop() {
                        log::debug!("Rejected path escaping static root: {}", path);
                        return None;
                    }
                }
                s if s.contains('\\') || s.contains('\0') => return None,
                s => candidate.push(s),
            }
        }

        let wants_dir = relative.is_empty() || relative.ends_with('/');
        let gzip_ok = accepts_gzip(head);

        if !wants_dir {
            if let Some(resolved) = self.pick_variant(&candidate, gzip_ok) {
                return Some(resolved);
            }
        }

        let default_file = self.default_file.as_ref()?;
        self.pick_variant(&candidate.join(default_file), gzip_ok)
    }

    fn probe(&self, path: &Path) -> Option<u64> {
        match self.fs.stat(path) {
            Ok(stat) if !stat.is_dir => Some(stat.len),
            _ => None,
        }
    }

    fn pick_variant(&self, path: &Path, gzip_ok: bool) -> Option<ResolvedFile> {
        let plain_len = self.probe(path);
        let gzip_len = self.probe(&gzip_sibling(path));

        let mut available = EncodingSet::default();
        if plain_len.is_some() {
            available.insert(Encoding::Identity);
        }
        if gzip_len.is_some() {
            available.insert(Encoding::Gzip);
        }

        let (encoding, len) = match (plain_len, gzip_len) {
            (Some(_), Some(gz)) if gzip_ok && self.gzip_first => (Encoding::Gzip, gz),
            (Some(plain), _) => (Encoding::Identity, plain),
            (None, Some(gz)) if gzip_ok => (Encoding::Gzip, gz),
            _ => return None,
        };

        Some(ResolvedFile {
            path: path.to_path_buf(),
            available,
            encoding,
            len,
        })
    }

    /// Send `file`, or a 304 when the client's copy is current
    pub fn serve(&self, head: &RequestHead, file: &ResolvedFile, response: &mut Response<'_>) -> ServerResult<()> {
        if let Some(last_modified) = &self.last_modified {
            if head.headers.get("if-modified-since") == Some(last_modified.as_str()) {
                metrics::increment_counter!("static_not_modified_total");
                response.set_code(Status::NotModified);
                return response.send();
            }
        }

        let reader = self
            .fs
            .open(&file.served_path())
            .map_err(|_| ServerError::NotFound(head.path().to_string()))?;

        response.set_code(Status::Ok);
        response.set_content_type(content_type_for(&file.path));
        if let Some(cache_control) = &self.cache_control {
            response.add_header("Cache-Control", cache_control);
        }
        if let Some(last_modified) = &self.last_modified {
            response.add_header("Last-Modified", last_modified);
        }
        if file.encoding == Encoding::Gzip {
            response.add_header("Content-Encoding", "gzip");
        }
        if file.available.contains(Encoding::Gzip) && file.available.contains(Encoding::Identity) {
            response.add_header("Vary", "Accept-Encoding");
        }
        response.set_stream(reader, Some(file.len));

        metrics::increment_counter!("static_files_served_total");
        response.send()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn fixture() -> (tempfile::TempDir, StaticFileHandler) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("www/docs")).unwrap();
        fs::write(dir.path().join("secret.txt"), b"top secret").unwrap();
        fs::write(dir.path().join("www/index.html"), b"<h1>home</h1>").unwrap();
        fs::write(dir.path().join("www/app.js"), b"console.log(1)").unwrap();
        fs::write(dir.path().join("www/app.js.gz"), b"gz").unwrap();
        fs::write(dir.path().join("www/only.css.gz"), b"gz").unwrap();
        let handler = StaticFileHandler::new("/", Arc::new(DiskFileSystem), dir.path().join("www"));
        (dir, handler)
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("a/style.css")), "text/css");
        assert_eq!(content_type_for(Path::new("INDEX.HTML")), "text/html");
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn test_prefix_matching_respects_segments() {
        let handler = StaticFileHandler::new("/static", Arc::new(DiskFileSystem), "www");
        assert_eq!(handler.match_len("/static"), Some(7));
        assert_eq!(handler.match_len("/static/app.js"), Some(7));
        assert_eq!(handler.match_len("/staticfoo"), None);
        assert_eq!(handler.match_len("/other"), None);

        let root = StaticFileHandler::new("/", Arc::new(DiskFileSystem), "www");
        assert_eq!(root.match_len("/anything"), Some(0));
    }

    #[test]
    fn test_directory_resolves_default_file() {
        let (_dir, handler) = fixture();
        let file = handler.resolve(&RequestHead::new(Method::Get, "/")).unwrap();
        assert!(file.path.ends_with("index.html"));
        assert_eq!(file.encoding, Encoding::Identity);

        // Directory whose default file is missing
        assert!(handler.resolve(&RequestHead::new(Method::Get, "/docs/")).is_none());
    }

    #[test]
    fn test_traversal_is_not_found() {
        let (_dir, handler) = fixture();
        assert!(handler.resolve(&RequestHead::new(Method::Get, "/../secret.txt")).is_none());
        assert!(handler.resolve(&RequestHead::new(Method::Get, "/docs/../../secret.txt")).is_none());
        assert!(handler.resolve(&RequestHead::new(Method::Get, "/%2e%2e/secret.txt")).is_none());
        assert!(handler.resolve(&RequestHead::new(Method::Get, "/docs/../app.js")).is_some());
    }

    #[test]
    fn test_gzip_negotiation() {
        let (_dir, mut handler) = fixture();
        let gzip = RequestHead::new(Method::Get, "/app.js").with_header("Accept-Encoding", "gzip, deflate");
        let plain = RequestHead::new(Method::Get, "/app.js");

        let file = handler.resolve(&gzip).unwrap();
        assert_eq!(file.encoding, Encoding::Gzip);
        assert!(file.available.contains(Encoding::Identity));
        assert!(file.available.contains(Encoding::Gzip));

        assert_eq!(handler.resolve(&plain).unwrap().encoding, Encoding::Identity);

        handler.set_gzip_first(false);
        assert_eq!(handler.resolve(&gzip).unwrap().encoding, Encoding::Identity);

        // Only the compressed variant exists
        let only = RequestHead::new(Method::Get, "/only.css").with_header("Accept-Encoding", "gzip");
        assert_eq!(handler.resolve(&only).unwrap().encoding, Encoding::Gzip);
        assert!(handler.resolve(&RequestHead::new(Method::Get, "/only.css")).is_none());
    }

    #[test]
    fn test_refused_gzip() {
        let head = RequestHead::new(Method::Get, "/").with_header("Accept-Encoding", "gzip;q=0, br");
        assert!(!accepts_gzip(&head));
    }

    #[test]
    fn test_http_date_format() {
        let epoch = SystemTime::UNIX_EPOCH;
        assert_eq!(http_date(epoch), "Thu, 01 Jan 1970 00:00:00 GMT");
    }
}
