use super::{status_line, BodyFraming, CRLF};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

/// One HTTP response. Built by handlers (or raised as an error payload)
/// and serialized to wire bytes by [`to_bytes`](Self::to_bytes).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    framing: BodyFraming,
    // None means "inherit the session's keep-alive"
    keep_alive: Option<Duration>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(500)
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
            framing: BodyFraming::Length(0),
            keep_alive: None,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.set_body(body);
        self
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        self.framing = BodyFraming::Length(self.body.len() as u64);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Announces an explicit content length without an in-memory body;
    /// the handler writes the payload itself afterwards.
    pub fn with_content_length(mut self, length: u64) -> Self {
        self.body.clear();
        self.framing = BodyFraming::Length(length);
        self
    }

    /// Switches the response to chunked transfer framing.
    pub fn with_chunked_body(mut self) -> Self {
        self.body.clear();
        self.framing = BodyFraming::Chunked;
        self
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    /// Serializes status line, headers, framing line, the keep-alive or
    /// close advertisement and the in-memory body. `session_keep_alive`
    /// applies unless the response carries its own override.
    pub fn to_bytes(&self, session_keep_alive: Duration) -> Vec<u8> {
        let keep_alive = self.keep_alive.unwrap_or(session_keep_alive);
        let status = if self.status == 0 { 500 } else { self.status };

        let mut head = String::with_capacity(128 + self.headers.len() * 32);
        let _ = write!(head, "HTTP/1.1 {}{CRLF}", status_line(status));
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}{CRLF}");
        }
        match self.framing {
            BodyFraming::Length(n) => {
                let _ = write!(head, "Content-Length: {n}{CRLF}");
            }
            BodyFraming::Chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
        }
        if keep_alive.as_secs() > 0 {
            let _ = write!(head, "Keep-Alive: timeout={}{CRLF}", keep_alive.as_secs());
            head.push_str("Connection: keep-alive\r\n");
        } else {
            head.push_str("Connection: close\r\n");
        }
        head.push_str(CRLF);

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

impl From<u16> for Response {
    fn from(status: u16) -> Self {
        Response::new(status)
    }
}
