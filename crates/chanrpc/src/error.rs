//! # Error Definitions
//!
//! What a caller sees when a call or subscription fails, and how callee errors
//! are classified into wire error kinds.

use chanwire::ErrorKind;

/// Failures surfaced by channels and connections.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Unknown channel, command or event name.
    NotImplemented(String),
    /// The callee failed; carries its error message.
    Remote(String),
    /// The call was cancelled, locally or by the peer.
    Canceled,
    /// The connection closed while the call was outstanding.
    ConnectionClosed,
    /// An inbound frame for this call could not be decoded.
    CorruptFrame(chanwire::Error),
    /// An outbound frame could not be encoded.
    Encode(chanwire::Error),
    /// A reply did not have the shape the caller asked for.
    Decode(chanpack::Error),
}

impl Error {
    /// Cancellation is expected control flow, not a failure to report.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// The wire kind this error travels as when returned by a callee.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Canceled => ErrorKind::Canceled,
            Error::NotImplemented(_) => ErrorKind::NotImplemented,
            _ => ErrorKind::Failure,
        }
    }

    /// Rebuilds the caller-side error from a `CallErr` frame.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Failure => Error::Remote(message),
            ErrorKind::Canceled => Error::Canceled,
            ErrorKind::NotImplemented => Error::NotImplemented(message),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Remote messages pass through untouched so callers see the callee's text.
            Self::Remote(msg) => f.write_str(msg),
            Self::NotImplemented(what) => write!(f, "Not implemented: {}", what),
            Self::Canceled => write!(f, "Canceled"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::CorruptFrame(e) => write!(f, "Corrupt frame: {}", e),
            Self::Encode(e) => write!(f, "Encode error: {}", e),
            Self::Decode(e) => write!(f, "Decode error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CorruptFrame(e) | Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classifies a callee's error into a wire kind and message.
pub(crate) fn classify(err: &anyhow::Error) -> (ErrorKind, String) {
    match err.downcast_ref::<Error>() {
        Some(Error::NotImplemented(what)) => (ErrorKind::NotImplemented, what.clone()),
        Some(e) => (e.kind(), e.to_string()),
        None => (ErrorKind::Failure, err.to_string()),
    }
}
