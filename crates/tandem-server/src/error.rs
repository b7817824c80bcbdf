//! Error types for the server.

use std::net::SocketAddr;
use std::path::PathBuf;
use tandem_transform::StepError;
use thiserror::Error;

/// Errors raised by instance operations.
///
/// A version conflict and truncated history are not errors: they are
/// reported through the `Option` results of `add_events` / `get_events`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstanceError {
    #[error("Invalid version {0}")]
    InvalidVersion(u64),

    #[error("Invalid version {0} for comments")]
    InvalidCommentVersion(u64),

    #[error("Invalid comment range {from}..{to}")]
    InvalidComment { from: usize, to: usize },

    #[error("Step could not be applied: {0}")]
    Step(#[from] StepError),
}

impl InstanceError {
    /// The HTTP status this error is reported with.
    pub fn status_code(&self) -> u16 {
        400
    }
}

/// Errors from the durable store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored state is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that stop the HTTP server.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind to {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address {0}")]
    Address(String),

    #[error("server terminated unexpectedly")]
    Serve {
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, InstanceError>;
