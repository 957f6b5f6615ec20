//! PeerLink network layer
//!
//! Provides the building blocks of the peer-to-peer tunnel:
//! - STUN probe for reflexive address discovery (the socket is reused
//!   for the tunnel to preserve the NAT binding)
//! - UDP transport with custom framing, hole punching, keep-alive and
//!   timeout detection
//! - Virtual TUN interface carrying raw IPv4 frames
//! - OS route/firewall configuration keyed by the adapter alias

pub mod error;
pub mod netcfg;
pub mod packet;
pub mod peer;
pub mod ratelimit;
pub mod state;
pub mod stun;
pub mod transport;
pub mod tun;

pub use error::{NetError, NetResult};
pub use netcfg::{ConnectionConfig, NetworkConfigurator, RouteApproach};
pub use packet::{PacketType, HEADER_LEN, MAX_DATAGRAM, MAX_PAYLOAD};
pub use peer::PeerRecord;
pub use ratelimit::TrafficLogLimiter;
pub use state::{NetworkEvent, NetworkEventData, StateManager, SystemState};
pub use stun::{StunProbe, DEFAULT_STUN_PORT, DEFAULT_STUN_SERVER};
pub use transport::{TransportConfig, UdpTransport};
pub use tun::{TunDevice, VirtualNic};
