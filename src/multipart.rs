//! Streaming `multipart/form-data` decoding.
//!
//! Parts are handed out in chunks no larger than the read size, so memory use
//! stays bounded no matter how large an uploaded file is.

use crate::error::{ServerError, ServerResult};
use crate::http::find_subsequence;
use std::io::{self, Read};

const MAX_PART_HEADER_SIZE: usize = 2048;

/// Headers of one part
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartInfo {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Boundary parameter of a `multipart/form-data` content type
pub fn boundary_from(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let kind = params.next()?.trim();
    if !kind.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

fn disposition_param(line: &str, name: &str) -> Option<String> {
    line.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn parse_part_headers(block: &str) -> PartInfo {
    let mut info = PartInfo::default();
    for line in block.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-disposition") {
            info.name = disposition_param(value, "name").unwrap_or_default();
            info.filename = disposition_param(value, "filename");
        } else if name.eq_ignore_ascii_case("content-type") {
            info.content_type = Some(value.trim().to_string());
        }
    }
    info
}

enum State {
    Preamble,
    AfterBoundary,
    Headers,
    Body(PartInfo, u64),
    Done,
}

/// Pulls a multipart body from `reader` in bounded chunks
pub struct MultipartReader<'r> {
    reader: &'r mut dyn Read,
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    scratch: Vec<u8>,
    eof: bool,
}

impl<'r> MultipartReader<'r> {
    pub fn new(reader: &'r mut dyn Read, boundary: &str, chunk_size: usize) -> Self {
        Self {
            reader,
            delimiter: format!("\r\n--{}", boundary).into_bytes(),
            // The first boundary has no leading CRLF; pretend it does
            buf: b"\r\n".to_vec(),
            scratch: vec![0u8; chunk_size.max(1)],
            eof: false,
        }
    }

    fn fill(&mut self) -> ServerResult<()> {
        loop {
            match self.reader.read(&mut self.scratch) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&self.scratch[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Io(e)),
            }
        }
    }

    fn truncated() -> ServerError {
        ServerError::Client("Truncated multipart body".to_string())
    }

    /// Decode every part, calling `on_chunk(part, offset, data, is_last)` for
    /// each piece of each part. Returns the number of parts seen.
    pub fn for_each_chunk<F>(mut self, mut on_chunk: F) -> ServerResult<usize>
    where
        F: FnMut(&PartInfo, u64, &[u8], bool) -> ServerResult<()>,
    {
        let keep = self.delimiter.len() - 1;
        let mut parts = 0;
        let mut state = State::Preamble;

        loop {
            state = match state {
                State::Preamble => match find_subsequence(&self.buf, &self.delimiter) {
                    Some(pos) => {
                        self.buf.drain(..pos + self.delimiter.len());
                        State::AfterBoundary
                    }
                    None => {
                        if self.eof {
                            return Err(ServerError::Client("Multipart boundary not found".to_string()));
                        }
                        if self.buf.len() > keep {
                            let excess = self.buf.len() - keep;
                            self.buf.drain(..excess);
                        }
                        self.fill()?;
                        State::Preamble
                    }
                },
                State::AfterBoundary => {
                    if self.buf.len() < 2 {
                        if self.eof {
                            return Err(Self::truncated());
                        }
                        self.fill()?;
                        State::AfterBoundary
                    } else if self.buf.starts_with(b"--") {
                        State::Done
                    } else if self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                        State::Headers
                    } else {
                        return Err(ServerError::Client("Malformed multipart boundary".to_string()));
                    }
                }
                State::Headers => {
                    if self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                        parts += 1;
                        State::Body(PartInfo::default(), 0)
                    } else if let Some(pos) = find_subsequence(&self.buf, b"\r\n\r\n") {
                        let block = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
                        self.buf.drain(..pos + 4);
                        parts += 1;
                        State::Body(parse_part_headers(&block), 0)
                    } else if self.buf.len() > MAX_PART_HEADER_SIZE {
                        return Err(ServerError::ResourceLimit("Multipart part header too large".to_string()));
                    } else if self.eof {
                        return Err(Self::truncated());
                    } else {
                        self.fill()?;
                        State::Headers
                    }
                }
                State::Body(info, offset) => match find_subsequence(&self.buf, &self.delimiter) {
                    Some(pos) => {
                        on_chunk(&info, offset, &self.buf[..pos], true)?;
                        self.buf.drain(..pos + self.delimiter.len());
                        State::AfterBoundary
                    }
                    None => {
                        if self.eof {
                            return Err(Self::truncated());
                        }
                        let mut offset = offset;
                        if self.buf.len() > keep {
                            let ready = self.buf.len() - keep;
                            on_chunk(&info, offset, &self.buf[..ready], false)?;
                            self.buf.drain(..ready);
                            offset += ready as u64;
                        }
                        self.fill()?;
                        State::Body(info, offset)
                    }
                },
                State::Done => return Ok(parts),
            };
        }
    }
}
