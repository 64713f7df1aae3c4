//! Error types for store operations.

use thiserror::Error;

/// Errors raised by structural writes against a [`Store`](crate::Store).
///
/// Reads and subscriptions never return these; they log the failure, append it
/// to the store's error log and fall back to an inert result instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key was empty.
    #[error("invalid key: keys must be non-empty strings")]
    InvalidKey,

    /// A mutation targeted a frozen key.
    #[error("key '{0}' is frozen")]
    FrozenKey(String),

    /// `update` was asked to merge into (or with) something that is not a mapping.
    #[error("value under key '{0}' is not an object")]
    NotAnObject(String),

    /// A typed slice could not be converted to or from its JSON form.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
