//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering malformed or unencodable wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A text frame looked like a control message but its `type` is unknown.
    #[error("unknown control message type: {0}")]
    UnknownMessageType(String),

    /// A resize request carried a zero dimension.
    #[error("invalid window size: {rows} rows x {cols} cols")]
    InvalidWindowSize {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
