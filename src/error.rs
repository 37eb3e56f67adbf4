use crate::http::Response;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can abort a session flow. Handlers use the
/// [`Status`](Error::Status) and [`ErrorResponse`](Error::ErrorResponse)
/// variants as control flow; the rest originate in the core.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol violation; the connection is dropped after a best-effort 400.
    #[error("bad message")]
    BadMessage,

    /// Header or body exceeded a limit; carries 413 or 431.
    #[error("too large ({0})")]
    TooLarge(u16),

    /// Expect/Content-Length precondition failed.
    #[error("expectation failed")]
    ExpectationFailed,

    /// No plugin claimed the request.
    #[error("no handler for request")]
    NoHandler,

    /// The router knew the path but not the verb.
    #[error("method not allowed, allowed: {allow}")]
    MethodNotAllowed { allow: String },

    /// The reactor's deadline for this session expired.
    #[error("timed out")]
    TimedOut,

    /// The session was destroyed while the flow was still suspended.
    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Handler-signalled bare status code.
    #[error("status {0}")]
    Status(u16),

    /// Handler-signalled full response payload.
    #[error("response status {}", .0.status())]
    ErrorResponse(Response),

    /// Any other signalled condition.
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// The best-effort error response for this kind, or `None` when the
    /// session should just close (transport-level failures).
    pub(crate) fn to_response(&self) -> Option<Response> {
        match self {
            Error::BadMessage => Some(Response::new(400)),
            Error::TooLarge(status) => Some(Response::new(*status)),
            Error::ExpectationFailed => Some(Response::new(417)),
            Error::NoHandler => Some(Response::new(503)),
            Error::MethodNotAllowed { allow } => {
                Some(Response::new(405).with_header("Allow", allow.clone()))
            }
            Error::Status(code) => {
                let code = if (1..=999).contains(code) { *code } else { 500 };
                Some(Response::new(code))
            }
            Error::ErrorResponse(res) => Some(res.clone()),
            Error::Unknown(_) => Some(Response::new(500)),
            Error::TimedOut | Error::Cancelled | Error::Io(_) => None,
        }
    }

    pub(crate) fn is_cancellation(&self) -> bool {
        matches!(self, Error::TimedOut | Error::Cancelled)
    }
}

impl From<u16> for Error {
    fn from(status: u16) -> Self {
        Error::Status(status)
    }
}

impl From<Response> for Error {
    fn from(res: Response) -> Self {
        Error::ErrorResponse(res)
    }
}
