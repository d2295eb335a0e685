use std::fmt;

use thiserror::Error;

/// Classification of a failed call against an external system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// The addressed principal or entity does not exist.
    NotFound,
    /// The target refused the operation for this entity.
    Forbidden,
    /// The target asked us to slow down.
    RateLimited,
    /// Any other unexpected status code.
    Status(u16),
    /// The response could not be decoded.
    Decode,
    /// The request never produced a response.
    Transport,
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamErrorKind::NotFound => write!(f, "not found"),
            UpstreamErrorKind::Forbidden => write!(f, "forbidden"),
            UpstreamErrorKind::RateLimited => write!(f, "rate limited"),
            UpstreamErrorKind::Status(code) => write!(f, "unexpected status {}", code),
            UpstreamErrorKind::Decode => write!(f, "decode failure"),
            UpstreamErrorKind::Transport => write!(f, "transport failure"),
        }
    }
}

/// Error returned by an external system client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{system} {kind}: {message}")]
pub struct UpstreamError {
    pub system: &'static str,
    pub kind: UpstreamErrorKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(system: &'static str, kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            system,
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(system: &'static str, message: impl Into<String>) -> Self {
        Self::new(system, UpstreamErrorKind::NotFound, message)
    }

    pub fn forbidden(system: &'static str, message: impl Into<String>) -> Self {
        Self::new(system, UpstreamErrorKind::Forbidden, message)
    }

    pub fn rate_limited(system: &'static str, message: impl Into<String>) -> Self {
        Self::new(system, UpstreamErrorKind::RateLimited, message)
    }

    /// Per-item failures that a reconciliation loop logs and skips.
    pub fn is_soft(&self) -> bool {
        matches!(
            self.kind,
            UpstreamErrorKind::NotFound | UpstreamErrorKind::Forbidden
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == UpstreamErrorKind::RateLimited
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Invalid boolean for {key}: {value:?}")]
    InvalidBool { key: String, value: String },

    #[error("Invalid number for {key}: {value:?}")]
    InvalidNumber { key: String, value: String },

    #[error("Job already registered: {0}")]
    DuplicateJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// The run observed cancellation and stopped early. Not a failure.
    #[error("Cancelled")]
    Cancelled,

    #[error("Routine for job {0} panicked")]
    RoutinePanicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Errors that must stop the process during startup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidDuration { .. }
                | SyncError::InvalidBool { .. }
                | SyncError::InvalidNumber { .. }
                | SyncError::DuplicateJob(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
