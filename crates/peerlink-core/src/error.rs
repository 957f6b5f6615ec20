//! Engine error types

use thiserror::Error;

/// Engine-level errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from the network layer
    #[error("network error: {0}")]
    Net(#[from] peerlink_net::NetError),

    /// Signalling channel failure
    #[error("signalling error: {0}")]
    Signaling(String),

    /// Configuration did not validate
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Initialization step failed
    #[error("initialization failed: {0}")]
    Init(String),

    /// Peer address from the rendezvous service did not parse
    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),
}

/// Result type for engine operations
pub type CoreResult<T> = Result<T, CoreError>;
