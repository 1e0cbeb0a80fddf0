//! # Error Definitions
//!
//! Frame-level failures, and the error kinds a failed call carries on the wire.

use chanpack::Error as PackError;

/// Failures while encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The underlying chanpack serialization failed.
    Codec(PackError),
    /// The frame had the right envelope but a missing or malformed field.
    ProtocolViolation(String),
    /// An unknown frame kind or error kind was encountered.
    UnknownVariant(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Codec(e) => write!(f, "codec error: {}", e),
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Error::UnknownVariant(msg) => write!(f, "unknown variant: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self { Self::Codec(e) }
}

/// A specialized Result type for frame operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a call failed, as seen by the caller.
///
/// Only these kinds are structural; the accompanying message is opaque text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The callee returned an error.
    Failure,
    /// The call was cancelled before it completed.
    Canceled,
    /// No such channel, command or event.
    NotImplemented,
}

impl ErrorKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ErrorKind::Failure => "Failure",
            ErrorKind::Canceled => "Canceled",
            ErrorKind::NotImplemented => "NotImplemented",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "Failure" => Ok(ErrorKind::Failure),
            "Canceled" => Ok(ErrorKind::Canceled),
            "NotImplemented" => Ok(ErrorKind::NotImplemented),
            _ => Err(Error::UnknownVariant(format!("ErrorKind: {}", tag))),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}
