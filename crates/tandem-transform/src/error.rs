//! Error types for applying steps.

use thiserror::Error;

/// Errors that can occur when a step is applied to a document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("Position {pos} out of range (document size: {size})")]
    OutOfRange { pos: usize, size: usize },

    #[error("Invalid range: {from} > {to}")]
    InvertedRange { from: usize, to: usize },
}

pub type Result<T> = std::result::Result<T, StepError>;
