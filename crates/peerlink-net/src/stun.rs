//! STUN probe for NAT discovery
//!
//! Performs a single RFC 5389 Binding Request and decodes the
//! XOR-MAPPED-ADDRESS attribute to learn the reflexive (public) address
//! of the local socket. The socket is then handed off to the UDP
//! transport with [`StunProbe::take_socket`] so the tunnel reuses the
//! exact NAT binding the STUN server observed.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{NetError, NetResult};

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com";

/// Default STUN port
pub const DEFAULT_STUN_PORT: u16 = 19302;

/// STUN message types (RFC 5389)
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

/// XOR-MAPPED-ADDRESS attribute type
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// How long to wait for the binding response
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One-shot STUN client that yields its socket after discovery
pub struct StunProbe {
    server: String,
    server_port: u16,
    local_port: u16,
    socket: Option<UdpSocket>,
}

impl StunProbe {
    /// Create a probe against the given STUN server
    pub fn new(server: impl Into<String>, server_port: u16) -> Self {
        Self {
            server: server.into(),
            server_port,
            local_port: 0,
            socket: None,
        }
    }

    /// Bind the probe socket to a specific local port (0 = ephemeral)
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Discover the reflexive transport address of the local socket.
    ///
    /// Binds a fresh IPv4 UDP socket, sends one Binding Request and waits
    /// up to five seconds for a Binding Success carrying an
    /// XOR-MAPPED-ADDRESS attribute.
    pub async fn discover(&mut self) -> NetResult<SocketAddr> {
        info!("discovering public address via {}:{}", self.server, self.server_port);

        let server_addr = self.resolve_server().await?;

        let bind_addr: SocketAddr = format!("0.0.0.0:{}", self.local_port)
            .parse()
            .expect("static bind address");
        let socket = UdpSocket::bind(bind_addr).await?;

        let mut transaction_id = [0u8; 12];
        getrandom::getrandom(&mut transaction_id)
            .map_err(|e| NetError::Stun(format!("failed to generate transaction id: {}", e)))?;

        let request = build_binding_request(&transaction_id);
        socket.send_to(&request, server_addr).await?;
        debug!("sent binding request to {}", server_addr);

        let mut response = [0u8; 576];
        let (len, from) = timeout(RESPONSE_TIMEOUT, socket.recv_from(&mut response))
            .await
            .map_err(|_| NetError::Timeout)??;

        debug!("received {} byte response from {}", len, from);

        let mapped = parse_binding_response(&response[..len], &transaction_id)?;

        self.socket = Some(socket);
        info!("public address: {}", mapped);
        Ok(mapped)
    }

    /// Local address of the probe socket, once bound
    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.socket
            .as_ref()
            .ok_or_else(|| NetError::Stun("probe socket not bound".into()))?
            .local_addr()
            .map_err(NetError::Io)
    }

    /// Transfer ownership of the probe socket to the caller.
    ///
    /// Returns `None` on the second and later calls; the socket moves
    /// exactly once.
    pub fn take_socket(&mut self) -> Option<UdpSocket> {
        self.socket.take()
    }

    async fn resolve_server(&self) -> NetResult<SocketAddr> {
        let target = format!("{}:{}", self.server, self.server_port);

        // Accept a literal address without touching the resolver
        if let Ok(addr) = target.parse::<SocketAddr>() {
            return Ok(addr);
        }

        let mut hosts = lookup_host(&target).await.map_err(|e| {
            warn!("failed to resolve STUN server '{}': {}", target, e);
            NetError::Resolve(target.clone())
        })?;
        let found = hosts.find(SocketAddr::is_ipv4);
        drop(hosts);
        found.ok_or_else(|| NetError::Resolve(target))
    }
}

/// Build a 20-byte RFC 5389 Binding Request
fn build_binding_request(transaction_id: &[u8; 12]) -> [u8; 20] {
    let mut request = [0u8; 20];
    request[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // bytes 2..4: message length, zero for a bare request
    request[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    request[8..20].copy_from_slice(transaction_id);
    request
}

/// Validate a binding response and extract the XOR-MAPPED-ADDRESS
fn parse_binding_response(data: &[u8], expected_txn_id: &[u8; 12]) -> NetResult<SocketAddr> {
    if data.len() < 20 {
        return Err(NetError::Stun("response too short".into()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;

    if 20 + msg_len > data.len() {
        return Err(NetError::Stun("declared length exceeds datagram".into()));
    }
    if msg_type != BINDING_SUCCESS {
        return Err(NetError::Stun(format!(
            "not a binding success response: 0x{:04x}",
            msg_type
        )));
    }
    if &data[8..20] != expected_txn_id {
        return Err(NetError::Stun("transaction id mismatch".into()));
    }

    // Walk TLV attributes; values are padded to 4-byte boundaries
    let mut pos = 20;
    while pos + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        if pos + attr_len > data.len() {
            break;
        }

        if attr_type == ATTR_XOR_MAPPED_ADDRESS && attr_len >= 8 && data[pos + 1] == 0x01 {
            let xport = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
            let xip = u32::from_be_bytes([
                data[pos + 4],
                data[pos + 5],
                data[pos + 6],
                data[pos + 7],
            ]);

            let port = xport ^ (MAGIC_COOKIE >> 16) as u16;
            let ip = std::net::Ipv4Addr::from(xip ^ MAGIC_COOKIE);

            return Ok(SocketAddr::new(ip.into(), port));
        }

        pos += (attr_len + 3) & !3;
    }

    Err(NetError::Stun("no XOR-MAPPED-ADDRESS in response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_request_layout() {
        let txn_id = [7u8; 12];
        let request = build_binding_request(&txn_id);

        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..20], &txn_id);
    }

    /// Build a fake binding success response mapping to `ip:port`
    fn fake_response(txn_id: &[u8; 12], ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut resp = Vec::new();
        resp.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        resp.extend_from_slice(&12u16.to_be_bytes()); // one 8-byte attribute + TLV header
        resp.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(txn_id);

        resp.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        resp.extend_from_slice(&8u16.to_be_bytes());
        resp.push(0); // reserved
        resp.push(0x01); // IPv4
        resp.extend_from_slice(&(port ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        let xip = u32::from_be_bytes(ip) ^ MAGIC_COOKIE;
        resp.extend_from_slice(&xip.to_be_bytes());
        resp
    }

    #[test]
    fn test_parse_xor_mapped_address() {
        let txn_id = [3u8; 12];
        let resp = fake_response(&txn_id, [203, 0, 113, 7], 54_321);

        let addr = parse_binding_response(&resp, &txn_id).unwrap();
        assert_eq!(addr.to_string(), "203.0.113.7:54321");
    }

    #[test]
    fn test_parse_rejects_short_response() {
        let txn_id = [0u8; 12];
        assert!(parse_binding_response(&[0u8; 10], &txn_id).is_err());
    }

    #[test]
    fn test_parse_rejects_wrong_type() {
        let txn_id = [1u8; 12];
        let mut resp = fake_response(&txn_id, [1, 2, 3, 4], 80);
        resp[0..2].copy_from_slice(&0x0111u16.to_be_bytes()); // binding error
        assert!(parse_binding_response(&resp, &txn_id).is_err());
    }

    #[test]
    fn test_parse_rejects_txn_mismatch() {
        let txn_id = [1u8; 12];
        let resp = fake_response(&txn_id, [1, 2, 3, 4], 80);
        assert!(parse_binding_response(&resp, &[9u8; 12]).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_length() {
        let txn_id = [1u8; 12];
        let mut resp = fake_response(&txn_id, [1, 2, 3, 4], 80);
        // Declare more content than the datagram holds
        resp[2..4].copy_from_slice(&200u16.to_be_bytes());
        assert!(parse_binding_response(&resp, &txn_id).is_err());
    }

    #[tokio::test]
    async fn test_socket_moves_exactly_once() {
        let mut probe = StunProbe::new("127.0.0.1", 1);
        probe.socket = Some(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        assert!(probe.take_socket().is_some());
        assert!(probe.take_socket().is_none());
        assert!(probe.local_addr().is_err());
    }

    #[tokio::test]
    async fn test_discover_against_local_responder() {
        // Fake STUN server on loopback
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 576];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 20);

            let mut txn_id = [0u8; 12];
            txn_id.copy_from_slice(&buf[8..20]);
            let resp = fake_response(&txn_id, [198, 51, 100, 9], from.port());
            server.send_to(&resp, from).await.unwrap();
        });

        let mut probe = StunProbe::new("127.0.0.1", server_addr.port());
        let mapped = probe.discover().await.unwrap();

        assert_eq!(mapped.ip().to_string(), "198.51.100.9");
        responder.await.unwrap();

        // The socket is now available for the transport
        assert!(probe.take_socket().is_some());
    }
}
