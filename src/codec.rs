// src/codec.rs
//
// Incremental HTTP/1.1 request decoder. Fed arbitrary byte slices, it
// advances the bound Request deterministically and reports how many bytes
// it consumed; the caller keeps any unconsumed tail for the next feed.

use crate::error::{Error, Result};
use crate::http::{Method, Request, State};
use memchr::memchr;

const MAX_LINE: usize = 8192;
const MAX_HEADERS: usize = 100;

enum Phase {
    RequestLine,
    Headers,
    BodyLength { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Done,
}

pub(crate) struct Decoder {
    phase: Phase,
    version_minor: u8,
    header_count: usize,
    delivered: u64,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            phase: Phase::RequestLine,
            version_minor: 1,
            header_count: 0,
            delivered: 0,
        }
    }

    /// Consumes as much of `buf` as possible, advancing `req`. Returns the
    /// number of consumed bytes. Stops consuming once the headers complete
    /// (so the caller can install a body consumer first) and once the
    /// message completes.
    pub fn advance(&mut self, req: &mut Request, buf: &[u8]) -> Result<usize> {
        let mut pos = 0;
        loop {
            match self.phase {
                Phase::RequestLine => {
                    if req.state() == State::Uninitialized && pos < buf.len() {
                        req.set_state(State::ProcessingUrl);
                    }
                    let Some((line, next)) = take_line(buf, pos, MAX_LINE)? else {
                        return Ok(pos);
                    };
                    self.parse_request_line(req, line)?;
                    req.set_state(State::ProcessingHeader);
                    pos = next;
                    self.phase = Phase::Headers;
                }
                Phase::Headers => {
                    let Some((line, next)) = take_line(buf, pos, MAX_LINE)? else {
                        return Ok(pos);
                    };
                    pos = next;
                    if line.is_empty() {
                        self.headers_complete(req)?;
                        return Ok(pos);
                    }
                    self.header_count += 1;
                    if self.header_count > MAX_HEADERS {
                        return Err(Error::TooLarge(431));
                    }
                    let (name, value) = parse_header_line(line)?;
                    req.insert_header(name, value);
                }
                Phase::BodyLength { remaining } => {
                    if pos == buf.len() {
                        return Ok(pos);
                    }
                    let take = usize::min(remaining as usize, buf.len() - pos);
                    self.deliver(req, &buf[pos..pos + take])?;
                    pos += take;
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.phase = Phase::Done;
                        req.set_state(State::Completed);
                        return Ok(pos);
                    }
                    self.phase = Phase::BodyLength { remaining };
                }
                Phase::ChunkSize => {
                    let Some((line, next)) = take_line(buf, pos, MAX_LINE)? else {
                        return Ok(pos);
                    };
                    pos = next;
                    let size = parse_chunk_size(line)?;
                    if size == 0 {
                        self.phase = Phase::Trailers;
                    } else {
                        self.phase = Phase::ChunkData { remaining: size };
                    }
                }
                Phase::ChunkData { remaining } => {
                    if pos == buf.len() {
                        return Ok(pos);
                    }
                    let take = usize::min(remaining as usize, buf.len() - pos);
                    self.deliver(req, &buf[pos..pos + take])?;
                    pos += take;
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.phase = Phase::ChunkDataEnd;
                    } else {
                        self.phase = Phase::ChunkData { remaining };
                    }
                }
                Phase::ChunkDataEnd => {
                    let Some((line, next)) = take_line(buf, pos, MAX_LINE)? else {
                        return Ok(pos);
                    };
                    if !line.is_empty() {
                        return Err(Error::BadMessage);
                    }
                    pos = next;
                    self.phase = Phase::ChunkSize;
                }
                Phase::Trailers => {
                    let Some((line, next)) = take_line(buf, pos, MAX_LINE)? else {
                        return Ok(pos);
                    };
                    pos = next;
                    if line.is_empty() {
                        self.phase = Phase::Done;
                        req.set_state(State::Completed);
                        return Ok(pos);
                    }
                }
                Phase::Done => return Ok(pos),
            }
        }
    }

    fn deliver(&mut self, req: &mut Request, chunk: &[u8]) -> Result<()> {
        req.set_state(State::ProcessingBody);
        self.delivered += chunk.len() as u64;
        if req.has_body_callback() && self.delivered > req.max_body_size() {
            return Err(Error::TooLarge(413));
        }
        req.deliver_body(chunk)
    }

    fn parse_request_line(&mut self, req: &mut Request, line: &[u8]) -> Result<()> {
        let sp1 = memchr(b' ', line).ok_or(Error::BadMessage)?;
        let method = &line[..sp1];
        if method.is_empty() || !method.iter().all(u8::is_ascii_alphabetic) {
            return Err(Error::BadMessage);
        }
        let rest = &line[sp1 + 1..];
        let sp2 = memchr(b' ', rest).ok_or(Error::BadMessage)?;
        let url = &rest[..sp2];
        if url.is_empty() || !url.iter().copied().all(is_valid_uri_byte) {
            return Err(Error::BadMessage);
        }
        self.version_minor = match &rest[sp2 + 1..] {
            b"HTTP/1.1" => 1,
            b"HTTP/1.0" => 0,
            _ => return Err(Error::BadMessage),
        };

        // both slices were validated as ASCII subsets above
        req.set_method(Method::from(std::str::from_utf8(method).unwrap_or("GET")));
        req.set_url(String::from_utf8_lossy(url).into_owned());
        Ok(())
    }

    fn headers_complete(&mut self, req: &mut Request) -> Result<()> {
        req.set_state(State::HeadersCompleted);
        req.set_keep_alive(derive_keep_alive(req, self.version_minor));

        if header_has_token(req, "Transfer-Encoding", "chunked") {
            self.phase = Phase::ChunkSize;
            return Ok(());
        }
        match framing_content_length(req)? {
            Some(0) | None => {
                self.phase = Phase::Done;
                req.set_state(State::Completed);
            }
            Some(n) => self.phase = Phase::BodyLength { remaining: n },
        }
        Ok(())
    }
}

/// Returns the next CRLF-terminated line (without its CRLF) and the index
/// just past it, or `None` when the buffer holds no complete line yet.
fn take_line(buf: &[u8], pos: usize, max: usize) -> Result<Option<(&[u8], usize)>> {
    let rest = &buf[pos..];
    match memchr(b'\n', rest) {
        Some(nl) => {
            if nl == 0 || rest[nl - 1] != b'\r' {
                return Err(Error::BadMessage);
            }
            Ok(Some((&rest[..nl - 1], pos + nl + 1)))
        }
        None => {
            if rest.len() > max {
                return Err(Error::TooLarge(431));
            }
            Ok(None)
        }
    }
}

fn parse_header_line(line: &[u8]) -> Result<(String, String)> {
    let colon = memchr(b':', line).ok_or(Error::BadMessage)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().copied().all(is_valid_header_field_byte) {
        return Err(Error::BadMessage);
    }
    let value = trim_ows(&line[colon + 1..]);
    Ok((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    // chunk extensions after ';' are ignored
    let digits = match memchr(b';', line) {
        Some(semi) => &line[..semi],
        None => line,
    };
    if digits.is_empty() {
        return Err(Error::BadMessage);
    }
    let mut size: u64 = 0;
    for &b in digits {
        let v = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => 10 + b - b'a',
            b'A'..=b'F' => 10 + b - b'A',
            _ => return Err(Error::BadMessage),
        };
        size = size.checked_mul(16).ok_or(Error::BadMessage)? + u64::from(v);
    }
    Ok(size)
}

/// Default keep-alive on 1.1 unless `Connection: close`; default close on
/// 1.0 unless `Connection: keep-alive`.
fn derive_keep_alive(req: &Request, version_minor: u8) -> bool {
    if version_minor == 1 {
        !header_has_token(req, "Connection", "close")
    } else {
        header_has_token(req, "Connection", "keep-alive")
    }
}

fn header_has_token(req: &Request, name: &str, token: &str) -> bool {
    req.headers()
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(name))
        .any(|(_, v)| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
}

/// Body framing length, resolved case-insensitively. A present but
/// malformed Content-Length is a protocol error.
fn framing_content_length(req: &Request) -> Result<Option<u64>> {
    let value = req
        .headers()
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, v)| v.as_str());
    match value {
        None => Ok(None),
        Some(v) if !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()) => {
            v.parse::<u64>().map(Some).map_err(|_| Error::BadMessage)
        }
        Some(_) => Err(Error::BadMessage),
    }
}

const fn make_uri_byte_mask() -> [bool; 256] {
    let mut mask = [false; 256];
    let valid =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~:/?#[]@!$&'()*+,;=%";
    let mut i = 0;
    while i < valid.len() {
        mask[valid[i] as usize] = true;
        i += 1;
    }
    mask
}

static URI_BYTE_MASK: [bool; 256] = make_uri_byte_mask();

#[inline(always)]
fn is_valid_uri_byte(b: u8) -> bool {
    URI_BYTE_MASK[b as usize]
}

const fn make_header_field_byte_mask() -> [bool; 256] {
    let mut mask = [false; 256];
    let valid = b"!#$%&'*+-.^_`|~ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut i = 0;
    while i < valid.len() {
        mask[valid[i] as usize] = true;
        i += 1;
    }
    mask
}

static HEADER_FIELD_BYTE_MASK: [bool; 256] = make_header_field_byte_mask();

#[inline(always)]
fn is_valid_header_field_byte(b: u8) -> bool {
    HEADER_FIELD_BYTE_MASK[b as usize]
}


impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            Phase::RequestLine => "request-line",
            Phase::Headers => "headers",
            Phase::BodyLength { .. } => "body",
            Phase::ChunkSize | Phase::ChunkData { .. } | Phase::ChunkDataEnd => "chunked-body",
            Phase::Trailers => "trailers",
            Phase::Done => "done",
        };
        f.debug_struct("Decoder").field("phase", &phase).finish()
    }
}
