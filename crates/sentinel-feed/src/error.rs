//! Feed error types.

use sentinel_core::FaultKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeedError {
    /// A bad update is dropped; the next one supersedes it.
    pub fn kind(&self) -> FaultKind {
        FaultKind::Retryable
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
