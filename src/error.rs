//! Crate-level error type for fallible storage and engine-creation paths.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Durable storage failed to open, read or write.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A persisted value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The media engine factory refused to produce an engine for a URI.
    #[error("failed to create media engine: {0}")]
    EngineCreate(String),
}

pub type Result<T> = std::result::Result<T, Error>;
