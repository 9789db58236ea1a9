//! Error taxonomy shared by every engine, the router and the wire protocol.
//!
//! Library code returns [`Error`]; results carry the serializable
//! [`ErrorPayload`] form so that a peer's failure survives a relay hop with
//! its kind intact.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by query resolution, the engines and the transport
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("unresolvable backend: {0}")]
    UnresolvableBackend(String),

    #[error("repo unavailable: {0}")]
    RepoUnavailable(String),

    #[error("no repo found: {0}")]
    NoRepoFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by a peer node, kept with its original kind
    #[error("{0}")]
    Remote(ErrorPayload),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::UnresolvableBackend(_) => ErrorKind::UnresolvableBackend,
            Error::RepoUnavailable(_) => ErrorKind::RepoUnavailable,
            Error::NoRepoFound(_) => ErrorKind::NoRepoFound,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Internal(_) | Error::Io(_) => ErrorKind::Internal,
            Error::Remote(payload) => payload.kind,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        match self {
            Error::Remote(payload) => payload.clone(),
            other => ErrorPayload::new(other.kind(), other.to_string()),
        }
    }
}

/// Error categories, each with a distinct HTTP status and wire name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NoRepoFound,
    RepoUnavailable,
    UnresolvableBackend,
    Transport,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NoRepoFound => 404,
            ErrorKind::RepoUnavailable => 409,
            ErrorKind::UnresolvableBackend => 502,
            ErrorKind::Transport => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NoRepoFound => "no_repo_found",
            ErrorKind::RepoUnavailable => "repo_unavailable",
            ErrorKind::UnresolvableBackend => "unresolvable_backend",
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured `{type, message}` error carried inside result payloads.
///
/// Ordered so that merging two results holding different errors for the
/// same key picks the same winner regardless of arrival order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<&Error> for ErrorPayload {
    fn from(e: &Error) -> Self {
        e.payload()
    }
}

impl From<Error> for ErrorPayload {
    fn from(e: Error) -> Self {
        e.payload()
    }
}

impl From<ErrorPayload> for Error {
    fn from(payload: ErrorPayload) -> Self {
        Error::Remote(payload)
    }
}
