//! Error types for zstor
//!
//! A single error type crosses crate boundaries. Component-local errors
//! (erasure coding, metadata persistence) convert into it.

use thiserror::Error;

/// Common result type for zstor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for zstor
#[derive(Debug, Error)]
pub enum Error {
    // Input validation errors
    #[error("no key given")]
    MissingKey,

    #[error("no previous key given")]
    MissingPrevKey,

    #[error("no key or previous key given")]
    MissingKeys,

    #[error("no reader given")]
    MissingReader,

    #[error("no start key given")]
    MissingStartKey,

    #[error("invalid epoch range: [{start}, {end}]")]
    InvalidEpochRange { start: i64, end: i64 },

    #[error("no listed shard addresses given")]
    NoShards,

    #[error("no namespace label given")]
    NoLabel,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Shard (datastor) errors
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    #[error("object data is corrupted: {key}")]
    ObjectCorrupted { key: String },

    #[error("JWT token does not permit requested action")]
    PermissionDenied,

    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("one or multiple shards failed to close ({failed} of {total})")]
    ShardClose { failed: usize, total: usize },

    #[error("invalid shard response: {0}")]
    InvalidResponse(String),

    // Metadata store errors
    #[error("metadata not found: {key}")]
    MetadataNotFound { key: String },

    #[error("metadata already exists: {key}")]
    MetadataExists { key: String },

    #[error("metadata store error: {0}")]
    MetaStore(String),

    #[error("linked metadata loops back to {key}")]
    LinkCycle { key: String },

    // Pipeline errors
    #[error("chunk {key} is unrecoverable: have {available} pieces, need {required}")]
    Unrecoverable {
        key: String,
        available: usize,
        required: usize,
    },

    #[error("erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Iterator misuse
    #[error("iterator is not positioned: call next first")]
    NotPositioned,

    // Network/RPC errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a metadata store error
    pub fn meta_store(msg: impl Into<String>) -> Self {
        Self::MetaStore(msg.into())
    }

    /// Check if this error was raised by input validation, before any I/O
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingKey
                | Self::MissingPrevKey
                | Self::MissingKeys
                | Self::MissingReader
                | Self::MissingStartKey
                | Self::InvalidEpochRange { .. }
                | Self::NoShards
                | Self::NoLabel
                | Self::InvalidArgument(_)
                | Self::Configuration(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::KeyNotFound { .. } | Self::MetadataNotFound { .. }
        )
    }

    /// Check if this error signals a loss of connectivity
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Timeout | Self::ServiceUnavailable(_)
        )
    }

    /// Check if this is a transient error that a transport may retry
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_network()
    }

    /// Check if this error reports data that can no longer be reconstructed
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. })
    }
}
