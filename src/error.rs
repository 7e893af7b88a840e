//! Error types for knc-dispatch.

use thiserror::Error;

/// Main error type for all dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// I/O error while loading configuration or talking to a bus device node.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The bus exchange itself failed.
    #[error("Bus transport error: {0}")]
    Transport(String),

    /// The bus exchange returned a buffer of the wrong size.
    #[error("Short bus transfer: expected {expected} bytes, got {actual}")]
    ShortBuffer {
        /// Configured transaction size.
        expected: usize,
        /// Size actually returned.
        actual: usize,
    },

    /// A device identifier is still live in the in-flight registry.
    #[error("Device identifier 0x{0:04x} is already in flight")]
    IdentifierCollision(u16),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The async device loop has stopped.
    #[error("Device loop closed")]
    DeviceLoopClosed,

    /// A blocking poll task panicked or was cancelled.
    #[error("Poll task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DispatchError {
    /// Whether the error aborts only the current poll cycle.
    ///
    /// Transport level failures self-correct on the next exchange.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::Transport(_) | DispatchError::ShortBuffer { .. }
        )
    }
}

/// Result type alias using DispatchError.
pub type Result<T> = std::result::Result<T, DispatchError>;
