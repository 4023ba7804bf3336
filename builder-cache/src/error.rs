//! Cache error taxonomy (§4.3, §7).

use thiserror::Error;

/// Errors the action/target cache can raise.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An entry's recorded digest did not match its re-hashed content; the entry was
    /// auto-invalidated and the probe reports a miss.
    #[error("cache corruption detected for key {0}")]
    Corruption(String),

    /// The cache is at its configured size/entry/age budget and eviction could not free
    /// enough space for an insert.
    #[error("cache full: {0}")]
    Full(String),

    /// A digest string failed to parse.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Underlying filesystem I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote transport failure; callers treat this as a local miss per the remote-cache
    /// contract, never fatal.
    #[error("remote cache transport error: {0}")]
    Remote(String),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
