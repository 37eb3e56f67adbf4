use super::{BodyFraming, Method, Response};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;

/// Parse progress of a request. Advances monotonically, never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Uninitialized,
    ProcessingUrl,
    ProcessingHeader,
    HeadersCompleted,
    ProcessingBody,
    Completed,
}

pub type BodyCallback = Box<dyn FnMut(&[u8]) -> Result<()> + Send>;

/// One HTTP request, mutated in place by the protocol decoder. A fresh
/// instance is created for every keep-alive iteration on a connection.
pub struct Request {
    state: State,
    method: Method,
    url: String,
    headers: HashMap<String, String>,
    keep_alive: bool,
    body_callback: Option<BodyCallback>,
    max_body_size: u64,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            state: State::Uninitialized,
            method: Method::Get,
            url: String::new(),
            headers: HashMap::new(),
            keep_alive: false,
            body_callback: None,
            max_body_size: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: State) {
        debug_assert!(state >= self.state);
        self.state = state;
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Raw path plus optional query string, exactly as received.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn set_url(&mut self, url: String) {
        self.url = url;
    }

    /// Exact-key lookup; the header map is case-sensitive and keeps the
    /// last value seen for a repeated key.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub(crate) fn insert_header(&mut self, name: String, value: String) {
        self.headers.insert(name, value);
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub(crate) fn set_keep_alive(&mut self, keep: bool) {
        self.keep_alive = keep;
    }

    /// Installs the consumer the decoder feeds body chunks to, with an
    /// upper bound on the total body size.
    pub fn set_body_callback_with_max<F>(&mut self, callback: F, max_size: u64)
    where
        F: FnMut(&[u8]) -> Result<()> + Send + 'static,
    {
        self.max_body_size = max_size;
        self.body_callback = Some(Box::new(callback));
    }

    pub fn set_body_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&[u8]) -> Result<()> + Send + 'static,
    {
        self.set_body_callback_with_max(callback, u64::MAX - 1);
    }

    pub fn has_body_callback(&self) -> bool {
        self.body_callback.is_some()
    }

    pub fn max_body_size(&self) -> u64 {
        self.max_body_size
    }

    /// A body for a request nobody asked to read is a protocol error.
    pub(crate) fn deliver_body(&mut self, chunk: &[u8]) -> Result<()> {
        match &mut self.body_callback {
            Some(callback) => callback(chunk),
            None => Err(Error::ErrorResponse(
                Response::new(400).with_body("unexpected body"),
            )),
        }
    }

    /// Strict Content-Length: ASCII digits only, fully consumed. Anything
    /// else (including a leading `+` or whitespace) yields the chunked
    /// sentinel.
    pub fn content_length(&self) -> BodyFraming {
        if let Some(value) = self.header("Content-Length") {
            if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(len) = value.parse::<u64>() {
                    return BodyFraming::Length(len);
                }
            }
        }
        BodyFraming::Chunked
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("state", &self.state)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}
