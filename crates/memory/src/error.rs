//! Error taxonomy for the reconciliation pipeline.
//!
//! Errors raised before any mutation (validation, extraction, embedding,
//! search) abort an `add` call.  Errors raised while applying one mutation
//! intent never abort the batch; [`MemoryError::is_skippable`] marks the
//! ones that are expected outcomes of an advisory decision (logged at
//! `warn`) as opposed to infrastructure failures (logged at `error`).

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    #[error("fact extraction failed: {0}")]
    Extraction(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("vector store write failed: {0}")]
    StoreWrite(String),
    #[error("vector store read failed: {0}")]
    StoreRead(String),
    #[error("unsupported payload value for `{key}`: {reason}")]
    Codec { key: String, reason: String },
    #[error("local reference {index} is out of range (only {len} candidates)")]
    Reference { index: usize, len: usize },
    #[error("memory {0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("history journal error: {0}")]
    History(String),
    #[error("reconciliation decision failed: {0}")]
    Decision(String),
    #[error("malformed mutation intent: {0}")]
    MalformedIntent(String),
}

impl MemoryError {
    pub fn codec(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Codec {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// `true` for errors that only invalidate a single mutation intent.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::Reference { .. }
                | Self::NotFound(_)
                | Self::History(_)
                | Self::MalformedIntent(_)
        )
    }
}
