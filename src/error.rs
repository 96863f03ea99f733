use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Status(#[from] Status),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outward-facing status code of a finished call.
///
/// These are the only outcomes the streaming components ever report to the
/// dispatch layer; peer disconnects are folded into `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Cancelled,
    DeadlineExceeded,
    InvalidArgument,
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Cancelled => "cancelled",
            Code::DeadlineExceeded => "deadline exceeded",
            Code::InvalidArgument => "invalid argument",
            Code::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Status of a failed call, as reported to the client.
///
/// An internal status keeps the transport error that caused it as its
/// [`std::error::Error::source`].
#[derive(Error, Debug)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
    #[source]
    source: Option<io::Error>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// Creates an internal status carrying the transport error as context.
    pub fn internal(message: impl Into<String>, cause: io::Error) -> Self {
        let message = format!("{}: {}", message.into(), cause);
        Self {
            code: Code::Internal,
            message,
            source: Some(cause),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` for the cancellation-flavoured codes.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.code, Code::Cancelled | Code::DeadlineExceeded)
    }
}

/// Reports whether a transport error means the remote peer went away.
///
/// Writing into a reset connection, a broken pipe or an already closed stream
/// is the normal way an unbounded download ends.
pub fn is_peer_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_internal_status_keeps_cause() {
        let cause = io::Error::new(io::ErrorKind::InvalidData, "bad frame");
        let status = Status::internal("failed to write download data", cause);

        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("bad frame"));
        let source = status.source().expect("internal status has a source");
        assert_eq!(source.to_string(), "bad frame");
    }

    #[test]
    fn test_status_display() {
        let status = Status::cancelled("client disconnected during download");
        assert_eq!(
            status.to_string(),
            "cancelled: client disconnected during download"
        );
        assert!(status.is_cancellation());
        assert!(!Status::invalid_argument("x").is_cancellation());
    }

    #[test]
    fn test_peer_disconnect_classification() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::NotConnected,
        ] {
            assert!(is_peer_disconnect(&io::Error::from(kind)), "{:?}", kind);
        }

        assert!(!is_peer_disconnect(&io::Error::from(
            io::ErrorKind::InvalidData
        )));
        assert!(!is_peer_disconnect(&io::Error::new(
            io::ErrorKind::Other,
            "boom"
        )));
    }

    #[test]
    fn test_code_serializes_snake_case() {
        let json = serde_json::to_string(&Code::DeadlineExceeded).unwrap();
        assert_eq!(json, "\"deadline_exceeded\"");
    }
}
