//! PeerLink engine
//!
//! Orchestrates the connection lifecycle: public-address discovery via
//! STUN, rendezvous signalling over WebSocket, UDP hole punching, and
//! bidirectional IPv4 frame forwarding between the virtual interface and
//! the tunnel.

pub mod config;
pub mod engine;
pub mod error;
pub mod signaling;

pub use config::EngineConfig;
pub use engine::{Engine, StatusSnapshot};
pub use error::{CoreError, CoreResult};
pub use signaling::SignalingClient;
