//! Error types for the cluster transport.

use {
    crate::{address::Address, config::ConfigError},
    thiserror::Error,
};

/// Errors that can occur in the cluster transport.
#[derive(Error, Debug)]
pub enum ClusterNetError {
    /// Socket-level failure while connecting, sending or receiving.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// A send was attempted on a connection whose socket already failed.
    #[error("connection to {0} is broken")]
    ConnectionBroken(Address),

    /// The peer answered the handshake with a different version cookie.
    #[error("version mismatch with peer {peer}")]
    VersionMismatch {
        /// Remote endpoint that sent the foreign cookie.
        peer: String,
    },

    /// A frame was truncated or internally inconsistent.
    #[error("framing error: {0}")]
    Framing(String),

    /// A frame exceeded the configured maximum.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Failed to serialize or deserialize a wire structure.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// The outbound queue was closed while a sender or producer used it.
    #[error("send queue closed")]
    QueueClosed,

    /// The per-peer outbound queue reached its capacity.
    #[error("send queue for {peer} is full ({capacity} messages)")]
    QueueFull {
        /// Destination whose queue overflowed.
        peer: Address,
        /// Configured capacity.
        capacity: usize,
    },

    /// No answer arrived before the deadline.
    #[error("request timeout after {0}ms")]
    RequestTimeout(u64),

    /// The application request handler failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// The supplied configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The connection table has not been started.
    #[error("connection table not started")]
    NotStarted,

    /// Dialing or handshaking with a peer failed.
    #[error("connection failed to {0}: {1}")]
    ConnectionFailed(Address, String),
}

/// Convenience result type for cluster transport operations.
pub type Result<T> = std::result::Result<T, ClusterNetError>;
