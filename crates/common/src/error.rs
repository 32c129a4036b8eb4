//! Error handling helpers and primitives.
//!
//! Every fallible operation in the workspace resolves to one of the kinds
//! below. Low-level code returns a kind and never logs; the engine logs once
//! at the point of decision and propagates.

use std::io;
use strum::{AsRefStr, Display, EnumIter};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(AsRefStr, Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
/// The failure classes surfaced by this workspace.
pub enum ErrorKind {
    /// Bad arguments, malformed JSON, unsupported option combination.
    Invalid,
    /// Missing rootfs, missing UtilityVM, absent file.
    NotFound,
    /// A distinct artifact already occupies a path.
    Exists,
    /// Permission or mandatory-integrity refusal.
    Denied,
    /// Filesystem, HTTP transport or agent RPC failure.
    Io,
    /// Allocation failure.
    Oom,
    /// A deadline expired.
    Timeout,
    /// Malformed or unexpected payload over RPC or HTTP.
    Protocol,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("exists: {0}")]
    Exists(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("io: {0}")]
    Io(String),

    #[error("out of memory")]
    Oom,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("protocol: {0}")]
    Protocol(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Invalid(_) => ErrorKind::Invalid,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Exists(_) => ErrorKind::Exists,
            Error::Denied(_) => ErrorKind::Denied,
            Error::Io(_) => ErrorKind::Io,
            Error::Oom => ErrorKind::Oom,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Build an error of the provided kind with a message.
    pub fn with_kind<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Invalid => Error::Invalid(message),
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::Exists => Error::Exists(message),
            ErrorKind::Denied => Error::Denied(message),
            ErrorKind::Io => Error::Io(message),
            ErrorKind::Oom => Error::Oom,
            ErrorKind::Timeout => Error::Timeout(message),
            ErrorKind::Protocol => Error::Protocol(message),
        }
    }

    /// Map an I/O error to a kind, attaching the provided context.
    pub fn from_io<S: AsRef<str>>(context: S, err: io::Error) -> Self {
        let message = format!("{}: {}", context.as_ref(), err);
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(message),
            io::ErrorKind::AlreadyExists => Error::Exists(message),
            io::ErrorKind::PermissionDenied => Error::Denied(message),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Error::Invalid(message),
            io::ErrorKind::TimedOut => Error::Timeout(message),
            io::ErrorKind::OutOfMemory => Error::Oom,
            _ => Error::Io(message),
        }
    }

    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Error::Invalid(message.into())
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Error::NotFound(message.into())
    }

    pub fn denied<S: Into<String>>(message: S) -> Self {
        Error::Denied(message.into())
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        Error::Io(message.into())
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Error::Timeout(message.into())
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Error::Protocol(message.into())
    }
}

// Builders configured with `build_fn(error = "common::Error")` funnel their
// missing-field failures here.
impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        Error::Invalid(err.to_string())
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Invalid(message)
    }
}

/// Chain creates a string from an error stack.
pub fn chain(res: anyhow::Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn chain() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = super::chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }

    #[test]
    fn io_mapping() {
        let err = Error::from_io(
            "open rootfs",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::from_io(
            "write config",
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(err.kind(), ErrorKind::Denied);

        let err = Error::from_io("copy", io::Error::new(io::ErrorKind::Other, "disk"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn kind_roundtrip() {
        let err = Error::with_kind(ErrorKind::Protocol, "bad line");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.to_string(), "protocol: bad line");
    }
}
