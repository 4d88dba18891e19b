//! Error types for the launcher core.
//!
//! [`Error`] is the owned, non-cloneable error returned from every fallible
//! operation. Per-instance failures are also recorded inside status batches;
//! since a status must be cloneable and comparable, those carry a
//! [`StatusError`] snapshot built with [`Error::to_status`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the launcher core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Item not found (instance record, installed service, spec file).
    #[error("not found: {0}")]
    NotFound(String),

    /// Item already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// A bounded collection would exceed its declared capacity.
    #[error("no memory: {what} exceeds capacity {capacity}")]
    NoMemory { what: String, capacity: usize },

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Malformed or duplicate entry in a desired-set submission.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed image or runtime spec.
    #[error("invalid spec at {path}: {reason}")]
    InvalidSpec { path: PathBuf, reason: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Blocking collaborator call exceeded its deadline.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Error reported by an external collaborator (runner, service manager,
    /// status sink) that does not map onto a more specific kind.
    #[error("{component} failed: {reason}")]
    Collaborator { component: String, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Error {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NoMemory { .. } => ErrorKind::NoMemory,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidSpec { .. } => ErrorKind::InvalidSpec,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Collaborator { .. } => ErrorKind::Failed,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Internal(_) => ErrorKind::Failed,
        }
    }

    /// Returns true for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Snapshots this error for inclusion in a status record.
    ///
    /// The message omits the category prefix; [`StatusError`] displays its
    /// kind separately.
    pub fn to_status(&self) -> StatusError {
        StatusError {
            kind: self.kind(),
            message: self.detail(),
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::NotFound(item)
            | Self::AlreadyExists(item)
            | Self::InvalidArgument(item)
            | Self::Serialization(item) => item.clone(),
            Self::NoMemory { what, capacity } => format!("{what} exceeds capacity {capacity}"),
            Self::InvalidSpec { path, reason } => format!("{}: {reason}", path.display()),
            Self::Timeout { operation, duration } => format!("{operation} exceeded {duration:?}"),
            Self::Collaborator { .. } | Self::Internal(_) => self.to_string(),
            Self::Io(e) => e.to_string(),
        }
    }

    /// Shorthand for a collaborator failure.
    pub fn collaborator(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Collaborator {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

/// Error category, stable across the crate and safe to report remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NoMemory,
    InvalidArgument,
    InvalidSpec,
    Timeout,
    Io,
    Serialization,
    /// Any other failure.
    Failed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::NoMemory => "no memory",
            Self::InvalidArgument => "invalid argument",
            Self::InvalidSpec => "invalid spec",
            Self::Timeout => "timeout",
            Self::Io => "io",
            Self::Serialization => "serialization",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Cloneable error snapshot carried in run and instance statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl StatusError {
    /// Creates a status error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
