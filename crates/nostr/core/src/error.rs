use thiserror::Error;

/// Protocol primitive error types.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("not a repost: kind {0}")]
    NotARepost(u16),

    #[error("empty repost content")]
    EmptyRepost,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
