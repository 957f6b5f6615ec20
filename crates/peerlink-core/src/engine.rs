//! Connection lifecycle engine
//!
//! Wires the STUN probe, rendezvous signalling, virtual NIC and UDP
//! transport together, forwards frames in both directions with
//! destination filtering, and drives the lifecycle from the network
//! event queue. The engine is the single consumer of that queue; all
//! cross-component calls are mediated here.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use peerlink_net::netcfg::{ConnectionConfig, NetworkConfigurator, SUBNET_BROADCAST};
use peerlink_net::transport::TransportConfig;
use peerlink_net::tun::ip;
use peerlink_net::{
    NetworkEvent, NetworkEventData, PeerRecord, StateManager, StunProbe, SystemState,
    TrafficLogLimiter, UdpTransport, VirtualNic,
};

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::signaling::SignalingClient;

/// Virtual address index taken by the side that accepted the connection
const HOST_INDEX: u8 = 1;

/// Virtual address index taken by the initiating side
const CLIENT_INDEX: u8 = 2;

/// Snapshot of the engine for the status surface
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: SystemState,
    pub connected: bool,
    pub is_host: bool,
    pub public_endpoint: Option<SocketAddr>,
    pub peer_endpoint: Option<SocketAddr>,
    pub local_virtual_ip: Option<Ipv4Addr>,
    pub peer_virtual_ip: Option<Ipv4Addr>,
    pub pending_acks: usize,
}

/// The P2P engine owning all subcomponents
pub struct Engine {
    config: EngineConfig,
    state: Arc<StateManager>,
    peer: Arc<PeerRecord>,
    traffic_log: Arc<TrafficLogLimiter>,
    signaling: Arc<SignalingClient>,
    netcfg: tokio::sync::Mutex<NetworkConfigurator>,

    transport: RwLock<Option<Arc<UdpTransport>>>,
    nic: RwLock<Option<Arc<VirtualNic>>>,

    running: AtomicBool,
    is_host: AtomicBool,
    public_endpoint: RwLock<Option<SocketAddr>>,
    peer_username: RwLock<Option<String>>,
    pending_request: RwLock<Option<String>>,
    local_vip: RwLock<Option<Ipv4Addr>>,
    peer_vip: RwLock<Option<Ipv4Addr>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let traffic_log = Arc::new(TrafficLogLimiter::new(
            config.traffic_log_capacity,
            config.traffic_log_rate,
        ));

        Arc::new(Self {
            config,
            state: Arc::new(StateManager::new()),
            peer: Arc::new(PeerRecord::new()),
            traffic_log,
            signaling: SignalingClient::new(),
            netcfg: tokio::sync::Mutex::new(NetworkConfigurator::new()),
            transport: RwLock::new(None),
            nic: RwLock::new(None),
            running: AtomicBool::new(false),
            is_host: AtomicBool::new(false),
            public_endpoint: RwLock::new(None),
            peer_username: RwLock::new(None),
            pending_request: RwLock::new(None),
            local_vip: RwLock::new(None),
            peer_vip: RwLock::new(None),
            monitor_task: Mutex::new(None),
        })
    }

    /// Bring the system up: STUN, signalling registration, virtual
    /// device, transport, and the monitor loop. Any failure tears down
    /// what was already acquired and is returned to the caller.
    pub async fn initialize(self: &Arc<Self>) -> CoreResult<()> {
        self.config.validate()?;
        self.running.store(true, Ordering::SeqCst);

        // STUN first: the probe socket becomes the tunnel socket, so the
        // NAT binding it creates is the one we advertise.
        let mut probe = StunProbe::new(&self.config.stun_server, self.config.stun_port)
            .with_local_port(self.config.listen_port);
        let public = probe.discover().await.map_err(|e| {
            error!("failed to discover public address via STUN: {}", e);
            CoreError::from(e)
        })?;
        *self.public_endpoint.write().expect("lock poisoned") = Some(public);

        self.install_signaling_callbacks();
        if let Err(e) = self.signaling.connect(&self.config.server_url).await {
            error!("failed to connect to rendezvous service: {}", e);
            return Err(e);
        }
        self.signaling
            .register_user(&self.config.username, &public.ip().to_string(), public.port());

        // Virtual device, ingress side
        let nic = match VirtualNic::open(&self.config.tun_name) {
            Ok(nic) => Arc::new(nic),
            Err(e) => {
                error!("failed to initialize virtual interface: {}", e);
                self.signaling.disconnect();
                return Err(e.into());
            }
        };
        {
            let weak = Arc::downgrade(self);
            nic.set_packet_callback(move |frame| {
                if let Some(engine) = weak.upgrade() {
                    engine.handle_frame_from_nic(frame);
                }
            });
        }
        self.netcfg.lock().await.set_alias(nic.alias());
        *self.nic.write().expect("lock poisoned") = Some(Arc::clone(&nic));

        // Transport takes over the STUN socket to keep the NAT binding
        let socket = probe
            .take_socket()
            .ok_or_else(|| CoreError::Init("STUN probe did not yield a socket".into()))?;
        let transport = UdpTransport::with_config(
            socket,
            Arc::clone(&self.state),
            Arc::clone(&self.peer),
            Arc::clone(&self.traffic_log),
            TransportConfig {
                keepalive_interval: self.config.keepalive_interval,
                peer_timeout: self.config.peer_timeout,
            },
        );
        {
            let weak = Arc::downgrade(self);
            transport.set_frame_callback(move |frame| {
                if let Some(engine) = weak.upgrade() {
                    engine.handle_frame_from_peer(frame);
                }
            });
        }
        if let Err(e) = transport.start_listening() {
            error!("failed to start UDP transport: {}", e);
            nic.close();
            self.signaling.disconnect();
            return Err(e.into());
        }
        *self.transport.write().expect("lock poisoned") = Some(transport);

        self.spawn_monitor();

        info!("system initialized, public endpoint {}", public);
        Ok(())
    }

    fn install_signaling_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.signaling.set_connect_callback({
            let weak = Weak::clone(&weak);
            move |connected| {
                if connected {
                    if let Some(engine) = weak.upgrade() {
                        engine.signaling.send_greeting();
                    }
                }
            }
        });
        self.signaling.set_chat_request_callback({
            let weak = Weak::clone(&weak);
            move |from| {
                if let Some(engine) = weak.upgrade() {
                    engine.handle_connection_request(from);
                }
            }
        });
        self.signaling.set_peer_info_callback({
            let weak = Weak::clone(&weak);
            move |username, ip, port| {
                if let Some(engine) = weak.upgrade() {
                    engine.handle_peer_info(&username, &ip, port);
                }
            }
        });
        self.signaling.set_chat_init_callback(move |username, ip, port| {
            if let Some(engine) = weak.upgrade() {
                engine.handle_connection_init(&username, &ip, port);
            }
        });
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let interval = self.config.monitor_interval;

        let handle = tokio::spawn(async move {
            while engine.running.load(Ordering::SeqCst)
                && !engine.state.is_in_state(SystemState::ShuttingDown)
            {
                while let Some(event) = engine.state.next_event() {
                    engine.handle_network_event(event).await;
                }
                sleep(interval).await;
            }
            debug!("monitor loop stopped");
        });

        *self.monitor_task.lock().expect("lock poisoned") = Some(handle);
    }

    async fn handle_network_event(self: &Arc<Self>, event: NetworkEventData) {
        let current = self.state.get_state();

        match event.event {
            NetworkEvent::PeerConnected => {
                if current == SystemState::Connecting {
                    if !self.start_network_interface().await {
                        error!("failed to start network interface");
                        self.stop_connection().await;
                        return;
                    }
                    self.state.set_state(SystemState::Connected);
                    info!(
                        "peer connected at {}",
                        event.endpoint.as_deref().unwrap_or("<unknown>")
                    );
                }
            }
            NetworkEvent::AllPeersDisconnected => {
                if current == SystemState::Connected {
                    warn!("all peers disconnected");
                    self.stop_connection().await;
                }
            }
            NetworkEvent::ShutdownRequested => {
                info!("shutdown requested via event");
                self.shutdown().await;
            }
        }
    }

    /// Ask the rendezvous service to broker a connection to `username`
    pub fn connect_to_peer(&self, username: &str) -> bool {
        if self.is_connected() {
            warn!("attempted to connect while already connected to a peer");
            return false;
        }

        *self.peer_username.write().expect("lock poisoned") = Some(username.to_string());
        self.is_host.store(false, Ordering::SeqCst);
        self.state.set_state(SystemState::Connecting);

        self.signaling.request_peer_info(username);
        self.signaling.send_chat_request(username);

        info!("sent connection request to {}", username);
        true
    }

    /// Accept a pending incoming connection request; we become the host
    pub fn accept_incoming_request(&self) {
        let Some(from) = self.pending_request.write().expect("lock poisoned").take() else {
            info!("no pending connection request");
            return;
        };

        self.is_host.store(true, Ordering::SeqCst);
        self.signaling.accept_chat_request();
        *self.peer_username.write().expect("lock poisoned") = Some(from.clone());
        info!("accepted connection request from {}", from);
    }

    /// Reject a pending incoming connection request
    pub fn reject_incoming_request(&self) {
        let Some(from) = self.pending_request.write().expect("lock poisoned").take() else {
            info!("no pending connection request");
            return;
        };

        self.signaling.decline_chat_request();
        info!("rejected connection request from {}", from);
    }

    fn handle_connection_request(&self, from: String) {
        info!("incoming connection request from {} (/accept or /reject)", from);
        *self.pending_request.write().expect("lock poisoned") = Some(from);
    }

    fn handle_peer_info(&self, username: &str, ip: &str, port: u16) {
        let expecting = self.peer_username.read().expect("lock poisoned").clone();
        if expecting.as_deref() != Some(username) {
            return;
        }
        info!("got peer info: {} at {}:{}", username, ip, port);
    }

    /// The rendezvous go-ahead: both sides know each other's public
    /// endpoint, start punching.
    fn handle_connection_init(&self, username: &str, ip: &str, port: u16) {
        if let Err(e) = self.begin_connection(username, ip, port) {
            error!("failed to start connection with {}: {}", username, e);
            self.state.set_state(SystemState::Idle);
        }
    }

    fn begin_connection(&self, username: &str, ip: &str, port: u16) -> CoreResult<()> {
        let ip = ip
            .parse::<Ipv4Addr>()
            .map_err(|_| CoreError::InvalidPeerAddress(format!("{}:{}", ip, port)))?;
        let addr = SocketAddr::new(IpAddr::V4(ip), port);

        *self.peer_username.write().expect("lock poisoned") = Some(username.to_string());
        info!("connection initialized with {}, connecting...", username);

        self.assign_virtual_ips();

        let transport = self
            .transport()
            .ok_or_else(|| CoreError::Init("transport not initialized".into()))?;
        if !transport.connect_to_peer(addr) {
            return Err(peerlink_net::NetError::Transport(
                "failed to initiate UDP hole punching".into(),
            )
            .into());
        }
        Ok(())
    }

    /// The accepted side takes 10.0.0.1, the initiator 10.0.0.2;
    /// fixed for the session.
    fn assign_virtual_ips(&self) {
        let (local, peer) = if self.is_host.load(Ordering::SeqCst) {
            (HOST_INDEX, CLIENT_INDEX)
        } else {
            (CLIENT_INDEX, HOST_INDEX)
        };

        *self.local_vip.write().expect("lock poisoned") =
            Some(peerlink_net::netcfg::virtual_ip(local));
        *self.peer_vip.write().expect("lock poisoned") =
            Some(peerlink_net::netcfg::virtual_ip(peer));
    }

    /// Configure the adapter and start the NIC workers.
    ///
    /// Requires an established peer while CONNECTING. On configuration
    /// failure whatever was installed is removed and `false` is
    /// returned.
    async fn start_network_interface(&self) -> bool {
        if !self.is_connected() || !self.state.is_in_state(SystemState::Connecting) {
            warn!("cannot configure interface, not connecting to a peer");
            return false;
        }

        let Some(peer_vip) = *self.peer_vip.read().expect("lock poisoned") else {
            warn!("cannot configure interface, no virtual addresses assigned");
            return false;
        };
        let self_index = if self.is_host.load(Ordering::SeqCst) {
            HOST_INDEX
        } else {
            CLIENT_INDEX
        };

        let connection = ConnectionConfig {
            self_index,
            peer_virtual_ip: peer_vip,
        };

        let mut netcfg = self.netcfg.lock().await;
        if netcfg.configure(&connection).await.is_err() {
            // configure already removed any partially installed state
            return false;
        }

        let Some(nic) = self.nic() else {
            netcfg.reset(peer_vip).await;
            return false;
        };
        if let Err(e) = nic.start() {
            error!("failed to start packet processing: {}", e);
            netcfg.reset(peer_vip).await;
            return false;
        }

        info!(
            "network interface started with IP {}",
            peerlink_net::netcfg::virtual_ip(self_index)
        );
        info!("peer has IP {}", peer_vip);
        true
    }

    async fn stop_network_interface(&self) {
        let Some(nic) = self.nic() else {
            return;
        };
        if !nic.is_running() {
            return;
        }

        nic.stop();
        let peer_vip = *self.peer_vip.read().expect("lock poisoned");
        if let Some(peer_vip) = peer_vip {
            self.netcfg.lock().await.reset(peer_vip).await;
        }
        info!("network interface stopped and configuration reset");
    }

    /// Egress: frame read from the local device, bound for the tunnel
    fn handle_frame_from_nic(&self, frame: Vec<u8>) {
        if !ip::is_ipv4(&frame) {
            return;
        }
        let Some(peer_vip) = *self.peer_vip.read().expect("lock poisoned") else {
            return;
        };
        if !frame_allowed(&frame, peer_vip) {
            return;
        }

        if self.traffic_log.allow() {
            trace!(
                "forwarding {} byte frame to peer (dst {:?})",
                frame.len(),
                ip::destination(&frame)
            );
        }

        if let Some(transport) = self.transport() {
            transport.send_message(&frame);
        }
    }

    /// Ingress: frame received over the tunnel, bound for the device
    fn handle_frame_from_peer(&self, frame: Vec<u8>) {
        if !ip::is_ipv4(&frame) {
            return;
        }
        let Some(local_vip) = *self.local_vip.read().expect("lock poisoned") else {
            return;
        };
        if !frame_allowed(&frame, local_vip) {
            return;
        }

        if self.traffic_log.allow() {
            trace!(
                "injecting {} byte frame (src {:?})",
                frame.len(),
                ip::source(&frame)
            );
        }

        if let Some(nic) = self.nic() {
            nic.send(frame);
        }
    }

    /// Tear down the active connection, keep the system ready for a new
    /// one. Idempotent.
    pub async fn stop_connection(&self) {
        if let Some(transport) = self.transport() {
            transport.stop_connection().await;
        }

        self.stop_network_interface().await;

        *self.peer_username.write().expect("lock poisoned") = None;
        *self.local_vip.write().expect("lock poisoned") = None;
        *self.peer_vip.write().expect("lock poisoned") = None;

        self.state.set_state(SystemState::Idle);
        info!("connection stopped, ready for new connections");
    }

    /// Full system shutdown. Safe to call more than once and safe after
    /// `stop_connection`.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // One teardown path: stops the transport connection, the
        // interface workers and the OS configuration, and clears the
        // peer info.
        self.stop_connection().await;

        self.state.set_state(SystemState::ShuttingDown);

        if let Some(transport) = self.transport() {
            transport.shutdown().await;
        }
        if let Some(nic) = self.nic() {
            nic.close();
        }
        self.signaling.disconnect();

        // Release the OS handles: dropping the transport closes the
        // socket, dropping the NIC releases the device session.
        *self.transport.write().expect("lock poisoned") = None;
        *self.nic.write().expect("lock poisoned") = None;

        if let Some(task) = self.monitor_task.lock().expect("lock poisoned").take() {
            task.abort();
        }

        info!("system shut down");
    }

    /// Whether the tunnel peer is currently connected
    pub fn is_connected(&self) -> bool {
        self.transport().map(|t| t.is_connected()).unwrap_or(false)
    }

    /// Whether the system is running (initialize succeeded, no shutdown)
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flip per-frame traffic logging, returning the new setting
    pub fn toggle_traffic_logging(&self) -> bool {
        self.traffic_log.toggle()
    }

    /// Current status for the CLI surface
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state.get_state(),
            connected: self.is_connected(),
            is_host: self.is_host.load(Ordering::SeqCst),
            public_endpoint: *self.public_endpoint.read().expect("lock poisoned"),
            peer_endpoint: self.transport().and_then(|t| t.peer_endpoint()),
            local_virtual_ip: *self.local_vip.read().expect("lock poisoned"),
            peer_virtual_ip: *self.peer_vip.read().expect("lock poisoned"),
            pending_acks: self.transport().map(|t| t.pending_ack_count()).unwrap_or(0),
        }
    }

    fn transport(&self) -> Option<Arc<UdpTransport>> {
        self.transport.read().expect("lock poisoned").clone()
    }

    fn nic(&self) -> Option<Arc<VirtualNic>> {
        self.nic.read().expect("lock poisoned").clone()
    }
}

/// Whether a tunnelled IPv4 frame may be forwarded toward `target_vip`.
///
/// Accepts frames addressed to the target itself, to the subnet or
/// limited broadcast address, or to any multicast group (224.0.0.0/4),
/// so LAN discovery keeps working across the tunnel.
fn frame_allowed(frame: &[u8], target_vip: Ipv4Addr) -> bool {
    let Some(dst) = ip::destination(frame) else {
        return false;
    };

    dst == target_vip
        || dst == SUBNET_BROADCAST
        || dst == Ipv4Addr::BROADCAST
        || dst.is_multicast()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_frame(dst: [u8; 4]) -> Vec<u8> {
        let mut frame = vec![0u8; 84];
        frame[0] = 0x45;
        frame[12..16].copy_from_slice(&[10, 0, 0, 2]);
        frame[16..20].copy_from_slice(&dst);
        frame
    }

    #[test]
    fn test_frame_for_peer_is_forwarded() {
        let peer = Ipv4Addr::new(10, 0, 0, 1);
        assert!(frame_allowed(&ipv4_frame([10, 0, 0, 1]), peer));
    }

    #[test]
    fn test_broadcast_frames_are_forwarded() {
        let peer = Ipv4Addr::new(10, 0, 0, 1);
        assert!(frame_allowed(&ipv4_frame([10, 0, 0, 255]), peer));
        assert!(frame_allowed(&ipv4_frame([255, 255, 255, 255]), peer));
    }

    #[test]
    fn test_multicast_frames_are_forwarded() {
        let peer = Ipv4Addr::new(10, 0, 0, 1);
        assert!(frame_allowed(&ipv4_frame([224, 0, 2, 60]), peer));
        assert!(frame_allowed(&ipv4_frame([239, 255, 255, 250]), peer));
    }

    #[test]
    fn test_foreign_destination_is_dropped() {
        let peer = Ipv4Addr::new(10, 0, 0, 1);
        assert!(!frame_allowed(&ipv4_frame([8, 8, 8, 8]), peer));
        assert!(!frame_allowed(&ipv4_frame([10, 0, 0, 7]), peer));
        assert!(!frame_allowed(&ipv4_frame([192, 168, 1, 1]), peer));
    }

    #[test]
    fn test_truncated_frame_is_dropped() {
        let peer = Ipv4Addr::new(10, 0, 0, 1);
        assert!(!frame_allowed(&[0x45, 0, 0], peer));
    }

    fn test_engine() -> Arc<Engine> {
        Engine::new(EngineConfig {
            username: "alice".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_vip_assignment_by_role() {
        let engine = test_engine();

        engine.is_host.store(true, Ordering::SeqCst);
        engine.assign_virtual_ips();
        let status = engine.status();
        assert_eq!(status.local_virtual_ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(status.peer_virtual_ip, Some(Ipv4Addr::new(10, 0, 0, 2)));

        engine.is_host.store(false, Ordering::SeqCst);
        engine.assign_virtual_ips();
        let status = engine.status();
        assert_eq!(status.local_virtual_ip, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(status.peer_virtual_ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_pending_request_accept_cycle() {
        let engine = test_engine();

        engine.handle_connection_request("bob".into());
        engine.accept_incoming_request();

        assert!(engine.is_host.load(Ordering::SeqCst));
        assert_eq!(
            engine.peer_username.read().unwrap().as_deref(),
            Some("bob")
        );
        assert!(engine.pending_request.read().unwrap().is_none());

        // A second accept with nothing pending is a no-op
        engine.accept_incoming_request();
    }

    #[test]
    fn test_pending_request_reject_clears() {
        let engine = test_engine();

        engine.handle_connection_request("bob".into());
        engine.reject_incoming_request();

        assert!(engine.pending_request.read().unwrap().is_none());
        assert!(engine.peer_username.read().unwrap().is_none());
    }

    #[test]
    fn test_initial_status() {
        let engine = test_engine();
        let status = engine.status();

        assert_eq!(status.state, SystemState::Idle);
        assert!(!status.connected);
        assert!(status.public_endpoint.is_none());
        assert_eq!(status.pending_acks, 0);
    }

    #[test]
    fn test_frames_dropped_without_vips() {
        // Before a connection no VIPs are assigned; nothing may pass
        let engine = test_engine();
        engine.handle_frame_from_nic(ipv4_frame([10, 0, 0, 1]));
        engine.handle_frame_from_peer(ipv4_frame([10, 0, 0, 2]));
    }
}
