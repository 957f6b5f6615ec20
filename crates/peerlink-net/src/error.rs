//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Virtual network device error
    #[error("device error: {0}")]
    Device(String),

    /// UDP transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol violation (bad magic, bad version, truncated frame)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// STUN probe failure
    #[error("STUN error: {0}")]
    Stun(String),

    /// Host name resolution failure
    #[error("failed to resolve '{0}'")]
    Resolve(String),

    /// OS configuration command rejected
    #[error("configuration error: {0}")]
    Config(String),

    /// Component started twice
    #[error("already running")]
    AlreadyRunning,

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;
