//! Error types for the client.

use std::fmt;
use tandem_transform::StepError;
use thiserror::Error;

/// A failed request to the collaboration server.
///
/// `status` is `None` when no response arrived at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestError {
    pub status: Option<u16>,
    pub message: String,
}

impl RequestError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// The server moved past the version we submitted against.
    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }

    /// The steps we asked for are no longer retained.
    pub fn is_gone(&self) -> bool {
        self.status == Some(410)
    }

    /// The server does not know our version at all.
    pub fn is_bad_version(&self) -> bool {
        self.status == Some(400) && self.message.to_lowercase().contains("invalid version")
    }

    /// Errors the client caused. Retrying will not help.
    pub fn is_client_error(&self) -> bool {
        matches!(self.status, Some(status) if status < 500)
    }

    /// Network failures and server errors, worth retrying.
    pub fn is_transient(&self) -> bool {
        !self.is_client_error()
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) if self.message.is_empty() => write!(f, "Request failed: {}", status),
            Some(status) => write!(f, "Request failed: {}\n\n{}", status, self.message),
            None => write!(f, "Network error: {}", self.message),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => RequestError::new(status.as_u16(), err.to_string()),
            None => RequestError::network(err.to_string()),
        }
    }
}

/// Errors from client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Step could not be applied: {0}")]
    Step(#[from] StepError),

    #[error("Invalid comment range {from}..{to}")]
    InvalidComment { from: usize, to: usize },

    #[error("Invalid server URL: {0}")]
    Url(String),

    #[error("Commit your changes first")]
    UncommittedChanges,

    #[error("No commit with index {0}")]
    NoSuchCommit(usize),

    #[error("Document not loaded yet")]
    NotLoaded,

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RequestError::new(409, "Version not current").is_conflict());
        assert!(RequestError::new(410, "History no longer available").is_gone());
        assert!(RequestError::new(400, "Invalid version 12").is_bad_version());
        assert!(RequestError::new(400, "Invalid version 3 for comments").is_bad_version());
        assert!(!RequestError::new(400, "Not a non-negative integer: x").is_bad_version());
        assert!(!RequestError::new(500, "Invalid version 1").is_bad_version());
    }

    #[test]
    fn test_transient() {
        assert!(RequestError::network("connection refused").is_transient());
        assert!(RequestError::new(502, "").is_transient());
        assert!(RequestError::new(404, "").is_client_error());
        assert!(!RequestError::new(404, "").is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RequestError::new(409, "Version not current").to_string(),
            "Request failed: 409\n\nVersion not current"
        );
        assert_eq!(RequestError::new(503, "").to_string(), "Request failed: 503");
    }
}
