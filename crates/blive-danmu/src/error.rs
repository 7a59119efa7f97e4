//! Error types for the danmu client.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, BliveError>;

/// Errors that can occur while resolving, connecting to or consuming a live room.
#[derive(Error, Debug)]
pub enum BliveError {
    /// Socket connect/send/receive failures.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The gateway rejected the AUTH frame.
    #[error("Authentication failed with code {code}")]
    Authentication { code: i64 },

    /// A signed REST call was rejected because the WBI key is stale.
    #[error("Stale WBI signature (code {code})")]
    StaleSignature { code: i64 },

    /// Room resolution or key retrieval failed.
    #[error("Resolver error: {0}")]
    Resolver(String),

    /// Malformed frame, failed decompression or unparseable payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A second start was requested while a session is live.
    #[error("Session is already running")]
    AlreadyRunning,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BliveError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a resolver error.
    pub fn resolver(msg: impl Into<String>) -> Self {
        Self::Resolver(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error ends a running session.
    ///
    /// Decode problems are contained inside the receive loop and never unwind it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Authentication { .. } | Self::Io(_)
        )
    }
}
