//! Sync engine error types.

use thiserror::Error;

/// Sync engine error type.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("event {0} is wrapped and cannot be published on its own")]
    Unpublishable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("closed: {0}")]
    Closed(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("unwrap error: {0}")]
    Unwrap(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] nostr::Error),

    #[error("invalid relay URL: {0}")]
    InvalidRelayUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Sync engine result type.
pub type Result<T> = std::result::Result<T, SyncError>;
