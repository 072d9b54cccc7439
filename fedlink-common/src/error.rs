//! Error types for fedlink

use thiserror::Error;

/// Error types for the fedlink library.
#[derive(Debug, Error)]
pub enum Error {
    /// Network I/O errors.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Wire message encoding/decoding errors.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
