//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rendezvous service WebSocket URL
    pub server_url: String,

    /// Username registered with the rendezvous service
    pub username: String,

    /// Local UDP port for the tunnel (0 = any)
    pub listen_port: u16,

    /// STUN server host
    pub stun_server: String,

    /// STUN server port
    pub stun_port: u16,

    /// Virtual adapter name
    pub tun_name: String,

    /// Keep-alive period (NAT refresh + timeout check)
    pub keepalive_interval: Duration,

    /// Peer silence threshold while connected
    pub peer_timeout: Duration,

    /// Pause between event-queue drains in the monitor loop
    pub monitor_interval: Duration,

    /// Traffic-log token bucket capacity
    pub traffic_log_capacity: u32,

    /// Traffic-log refill rate in logs per second
    pub traffic_log_rate: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://rendezvous.peerlink.dev".to_string(),
            username: String::new(),
            listen_port: 0,
            stun_server: peerlink_net::DEFAULT_STUN_SERVER.to_string(),
            stun_port: peerlink_net::DEFAULT_STUN_PORT,
            tun_name: default_tun_name(),
            keepalive_interval: Duration::from_secs(3),
            peer_timeout: Duration::from_secs(20),
            monitor_interval: Duration::from_millis(250),
            traffic_log_capacity: 20,
            traffic_log_rate: 10,
        }
    }
}

fn default_tun_name() -> String {
    #[cfg(windows)]
    {
        "PeerLink".to_string()
    }
    #[cfg(not(windows))]
    {
        "peerlink0".to_string()
    }
}

impl EngineConfig {
    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.username.is_empty() {
            return Err(CoreError::InvalidConfig("username must not be empty".into()));
        }
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(CoreError::InvalidConfig(format!(
                "server url must be a WebSocket url: {}",
                self.server_url
            )));
        }
        if self.tun_name.is_empty() {
            return Err(CoreError::InvalidConfig("adapter name must not be empty".into()));
        }
        if self.peer_timeout <= self.keepalive_interval {
            return Err(CoreError::InvalidConfig(
                "peer timeout must exceed the keep-alive interval".into(),
            ));
        }
        if self.traffic_log_rate == 0 {
            return Err(CoreError::InvalidConfig(
                "traffic log rate must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        EngineConfig {
            username: "alice".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_validates_with_username() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_empty_username_rejected() {
        assert!(EngineConfig::default().validate().is_err());
    }

    #[test]
    fn test_non_websocket_url_rejected() {
        let config = EngineConfig {
            server_url: "https://example.com".into(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_must_exceed_keepalive() {
        let config = EngineConfig {
            peer_timeout: Duration::from_secs(2),
            ..valid()
        };
        assert!(config.validate().is_err());
    }
}
