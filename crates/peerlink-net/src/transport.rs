//! UDP tunnel transport
//!
//! Owns the socket handed off by the STUN probe. Provides hole punching,
//! keep-alive with silence detection, acknowledgement tracking, and
//! best-effort delivery of tunnelled IPv4 frames. The receive pump is a
//! single tokio task; a connection is only considered established once
//! the first valid inbound datagram proves the path works in both
//! directions through both NATs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::packet::{
    control_frame, message_frame, Header, PacketType, HEADER_LEN, MAX_DATAGRAM, MAX_PAYLOAD,
};
use crate::peer::PeerRecord;
use crate::ratelimit::TrafficLogLimiter;
use crate::state::{NetworkEvent, NetworkEventData, StateManager, SystemState};
use crate::error::{NetError, NetResult};

/// Kernel socket buffer size requested at startup (4 MiB)
const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Number of hole-punch datagrams in the initial burst
const HOLE_PUNCH_BURST: u32 = 5;

/// Spacing between hole-punch datagrams in the burst
const HOLE_PUNCH_SPACING: Duration = Duration::from_millis(100);

/// Number of disconnect notifications sent on graceful teardown
const DISCONNECT_REPEATS: u32 = 3;

/// Spacing between disconnect notifications
const DISCONNECT_SPACING: Duration = Duration::from_millis(50);

/// Transport timing knobs; defaults match production behavior, tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Keep-alive period (hole punch + timeout check)
    pub keepalive_interval: Duration,

    /// Peer silence threshold while connected
    pub peer_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(3),
            peer_timeout: Duration::from_secs(20),
        }
    }
}

/// Callback receiving the payload of each valid inbound `Message` frame
pub type FrameCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// UDP transport for the point-to-point tunnel
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    state: Arc<StateManager>,
    peer: Arc<PeerRecord>,
    traffic_log: Arc<TrafficLogLimiter>,
    config: TransportConfig,

    running: AtomicBool,
    next_seq: AtomicU32,
    peer_endpoint: Mutex<Option<SocketAddr>>,
    pending_acks: Mutex<HashMap<u32, Instant>>,
    on_frame: Mutex<Option<FrameCallback>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Wrap a bound socket (normally the one yielded by the STUN probe)
    pub fn new(
        socket: UdpSocket,
        state: Arc<StateManager>,
        peer: Arc<PeerRecord>,
        traffic_log: Arc<TrafficLogLimiter>,
    ) -> Arc<Self> {
        Self::with_config(socket, state, peer, traffic_log, TransportConfig::default())
    }

    /// Wrap a bound socket with explicit timing configuration
    pub fn with_config(
        socket: UdpSocket,
        state: Arc<StateManager>,
        peer: Arc<PeerRecord>,
        traffic_log: Arc<TrafficLogLimiter>,
        config: TransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket: Arc::new(socket),
            state,
            peer,
            traffic_log,
            config,
            running: AtomicBool::new(false),
            next_seq: AtomicU32::new(0),
            peer_endpoint: Mutex::new(None),
            pending_acks: Mutex::new(HashMap::new()),
            on_frame: Mutex::new(None),
            recv_task: Mutex::new(None),
            keepalive_task: Mutex::new(None),
        })
    }

    /// Local socket address
    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.socket.local_addr().map_err(NetError::Io)
    }

    /// Register the sink for inbound tunnelled frames
    pub fn set_frame_callback(&self, callback: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        *self.on_frame.lock().expect("callback mutex poisoned") = Some(Arc::new(callback));
    }

    /// Endpoint of the current peer, if one is known
    pub fn peer_endpoint(&self) -> Option<SocketAddr> {
        *self.peer_endpoint.lock().expect("endpoint mutex poisoned")
    }

    /// Whether the peer is marked connected
    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }

    /// Number of sent messages still awaiting acknowledgement
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().expect("ack mutex poisoned").len()
    }

    /// Grow kernel buffers and start the receive pump.
    ///
    /// Buffer resizing failures are logged and ignored; some platforms
    /// clamp or refuse the request.
    pub fn start_listening(self: &Arc<Self>) -> NetResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyRunning);
        }

        let sock_ref = socket2::SockRef::from(&*self.socket);
        if let Err(e) = sock_ref.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
            warn!("failed to set send buffer size: {}", e);
        }
        if let Err(e) = sock_ref.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            warn!("failed to set receive buffer size: {}", e);
        }

        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move {
            transport.receive_loop().await;
        });
        *self.recv_task.lock().expect("task mutex poisoned") = Some(handle);

        info!("listening on UDP {}", self.local_addr()?);
        Ok(())
    }

    /// Begin hole punching toward the peer's public endpoint.
    ///
    /// Sends the initial burst and arms the keep-alive. The peer is not
    /// marked connected here; only the first valid inbound datagram
    /// confirms the path.
    pub fn connect_to_peer(self: &Arc<Self>, addr: SocketAddr) -> bool {
        if self.peer.is_connected() {
            warn!("already connected to a peer");
            return false;
        }

        *self.peer_endpoint.lock().expect("endpoint mutex poisoned") = Some(addr);
        self.running.store(true, Ordering::SeqCst);
        self.state.set_state(SystemState::Connecting);

        info!("starting UDP hole punching to {}", addr);

        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move {
            for _ in 0..HOLE_PUNCH_BURST {
                if !transport.running.load(Ordering::SeqCst) {
                    return;
                }
                transport.send_hole_punch().await;
                sleep(HOLE_PUNCH_SPACING).await;
            }
            transport.keepalive_loop().await;
        });

        let old = self
            .keepalive_task
            .lock()
            .expect("task mutex poisoned")
            .replace(handle);
        if let Some(old) = old {
            old.abort();
        }

        true
    }

    /// Tunnel one IPv4 frame to the peer.
    ///
    /// Returns `false` without touching the socket when the transport is
    /// not running or the payload exceeds [`MAX_PAYLOAD`]. A full send
    /// buffer drops the datagram (no retransmission); any other socket
    /// error tears the connection down.
    pub fn send_message(&self, payload: &[u8]) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            debug!("cannot send: transport not running");
            return false;
        }
        if payload.len() > MAX_PAYLOAD {
            error!(
                "message too large: {} bytes (max {})",
                payload.len(),
                MAX_PAYLOAD
            );
            return false;
        }

        let Some(endpoint) = self.peer_endpoint() else {
            debug!("cannot send: no peer endpoint");
            return false;
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let frame = message_frame(seq, payload);

        self.pending_acks
            .lock()
            .expect("ack mutex poisoned")
            .insert(seq, Instant::now());

        match self.socket.try_send_to(&frame, endpoint) {
            Ok(_) => {
                if self.traffic_log.allow() {
                    trace!("sent message seq={} len={}", seq, payload.len());
                }
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Send buffer full: drop the packet and forget the sequence
                debug!("send buffer full, dropping packet seq={}", seq);
                self.pending_acks
                    .lock()
                    .expect("ack mutex poisoned")
                    .remove(&seq);
                true
            }
            Err(e) => {
                error!("send error: {}", e);
                self.pending_acks
                    .lock()
                    .expect("ack mutex poisoned")
                    .remove(&seq);
                self.handle_disconnect();
                false
            }
        }
    }

    /// Fire three disconnect notifications 50 ms apart to raise the odds
    /// at least one survives packet loss. Errors are ignored; we are
    /// leaving anyway.
    pub async fn send_disconnect_notification(&self) {
        if !self.peer.is_connected() {
            return;
        }
        let Some(endpoint) = self.peer_endpoint() else {
            return;
        };

        info!("sending disconnect notification to peer");
        for _ in 0..DISCONNECT_REPEATS {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let frame = control_frame(PacketType::Disconnect, seq);
            let _ = self.socket.send_to(&frame, endpoint).await;
            sleep(DISCONNECT_SPACING).await;
        }
    }

    /// Stop the active peer connection, keeping the socket open.
    ///
    /// Notifies the peer, cancels the keep-alive (running=false is
    /// terminal for the timer), marks the peer disconnected and returns
    /// the lifecycle to IDLE. Safe to call twice.
    pub async fn stop_connection(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        self.send_disconnect_notification().await;

        self.peer.set_connected(false);
        self.running.store(false, Ordering::SeqCst);
        self.stop_keepalive();

        self.state.set_state(SystemState::Idle);
        info!("stopped connection to peer");
    }

    /// Full transport shutdown: stop the connection, cancel the receive
    /// pump and release the socket. Safe after `stop_connection`.
    pub async fn shutdown(&self) {
        if self.peer.is_connected() {
            self.stop_connection().await;
        }

        self.running.store(false, Ordering::SeqCst);
        self.peer.set_connected(false);
        self.state.set_state(SystemState::ShuttingDown);

        self.stop_keepalive();

        if let Some(task) = self.recv_task.lock().expect("task mutex poisoned").take() {
            task.abort();
        }

        info!("transport shut down");
    }

    async fn receive_loop(self: Arc<Self>) {
        debug!("receive pump started");
        loop {
            // A fresh buffer per receive so concurrent completions can
            // never clobber each other's data.
            let mut buf = vec![0u8; MAX_DATAGRAM];

            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    buf.truncate(len);
                    self.process_datagram(&buf, from);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    error!("fatal receive error: {}, disconnecting", e);
                    self.handle_disconnect();
                }
            }
        }
        debug!("receive pump stopped");
    }

    fn process_datagram(&self, data: &[u8], from: SocketAddr) {
        if data.len() < HEADER_LEN {
            debug!("received datagram too small: {} bytes", data.len());
            return;
        }

        let header = match Header::parse(data) {
            Ok(h) => h,
            Err(e) => {
                warn!("dropping datagram from {}: {}", from, e);
                return;
            }
        };

        // Any datagram that passes the magic/version gate counts as
        // peer activity, even one with an unknown type byte.
        self.peer.update_activity();

        let packet_type = header.packet_type();

        if !matches!(packet_type, Ok(PacketType::Disconnect)) {
            // Consume stray packets arriving after stop
            if !self.running.load(Ordering::SeqCst) {
                debug!("dropping packet received while not running");
                return;
            }

            if !self.peer.is_connected() {
                info!("first valid packet from {}, peer path confirmed", from);
                *self.peer_endpoint.lock().expect("endpoint mutex poisoned") = Some(from);
                self.peer.set_connected(true);
                self.state.queue_event(NetworkEventData::with_endpoint(
                    NetworkEvent::PeerConnected,
                    from.to_string(),
                ));
            }
        }

        match packet_type {
            Ok(PacketType::HolePunch) | Ok(PacketType::Heartbeat) => {
                if self.traffic_log.allow() {
                    trace!("received keep-alive from {}", from);
                }
            }
            Ok(PacketType::Disconnect) => {
                info!("received disconnect notification from peer");
                self.handle_disconnect();
            }
            Ok(PacketType::Message) => {
                self.process_message(&header, data, from);
            }
            Ok(PacketType::Ack) => {
                self.pending_acks
                    .lock()
                    .expect("ack mutex poisoned")
                    .remove(&header.seq);
            }
            Err(_) => {
                warn!("unknown packet type 0x{:02x} from {}", header.type_byte, from);
            }
        }
    }

    fn process_message(&self, header: &Header, data: &[u8], from: SocketAddr) {
        let payload_len = header.payload_len as usize;
        if HEADER_LEN + payload_len > data.len() {
            warn!(
                "message length {} exceeds datagram size {}",
                payload_len,
                data.len()
            );
            return;
        }

        // Acknowledge by echoing the message's sequence
        let ack = control_frame(PacketType::Ack, header.seq);
        if let Err(e) = self.socket.try_send_to(&ack, from) {
            if e.kind() != std::io::ErrorKind::WouldBlock {
                warn!("error sending ack: {}", e);
            }
        }

        if self.traffic_log.allow() {
            trace!("received message seq={} len={}", header.seq, payload_len);
        }

        let callback = self.on_frame.lock().expect("callback mutex poisoned").clone();
        if let Some(callback) = callback {
            callback(data[HEADER_LEN..HEADER_LEN + payload_len].to_vec());
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        loop {
            sleep(self.config.keepalive_interval).await;
            if !self.running.load(Ordering::SeqCst) {
                debug!("keep-alive cancelled");
                return;
            }

            self.send_hole_punch().await;
            if self.peer.is_connected() {
                self.check_timeouts();
            }
        }
    }

    async fn send_hole_punch(&self) {
        let Some(endpoint) = self.peer_endpoint() else {
            return;
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let frame = control_frame(PacketType::HolePunch, seq);
        if let Err(e) = self.socket.send_to(&frame, endpoint).await {
            if e.kind() != std::io::ErrorKind::WouldBlock {
                warn!("error sending hole-punch packet: {}", e);
            }
        }
    }

    fn check_timeouts(&self) {
        if self.peer.has_timed_out(self.config.peer_timeout) {
            error!(
                "connection timeout: no packets received for {:?} (threshold {:?})",
                self.peer.idle_time(),
                self.config.peer_timeout
            );
            self.peer.set_connected(false);
            self.state
                .queue_event(NetworkEventData::new(NetworkEvent::AllPeersDisconnected));
        }
    }

    fn handle_disconnect(&self) {
        if !self.peer.is_connected() {
            return;
        }
        self.peer.set_connected(false);
        self.state
            .queue_event(NetworkEventData::new(NetworkEvent::AllPeersDisconnected));
    }

    fn stop_keepalive(&self) {
        if let Some(task) = self
            .keepalive_task
            .lock()
            .expect("task mutex poisoned")
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.recv_task.lock().expect("task mutex poisoned").take() {
            task.abort();
        }
        if let Some(task) = self
            .keepalive_task
            .lock()
            .expect("task mutex poisoned")
            .take()
        {
            task.abort();
        }
    }
}
