//! Tunnel frame definitions
//!
//! Wire format (all fields big-endian):
//! ```text
//! [Magic: 4][Version: 2][Type: 1][Reserved: 1][Sequence: 4][Payload length: 4][Payload: N]
//! ```
//! The payload is a raw IPv4 frame and is only present for `Message` packets.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{NetError, NetResult};

/// Magic number opening every tunnel datagram
pub const MAGIC: u32 = 0x1234_5678;

/// Protocol version
pub const VERSION: u16 = 1;

/// Fixed header size in bytes
pub const HEADER_LEN: usize = 16;

/// Largest UDP datagram we will send or accept
pub const MAX_DATAGRAM: usize = 65_507;

/// Largest payload that fits behind the header
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

/// Packet type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// NAT traversal probe, doubles as keep-alive
    HolePunch = 0x01,

    /// Liveness probe
    Heartbeat = 0x02,

    /// Tunnelled IPv4 frame
    Message = 0x03,

    /// Acknowledgement echoing a `Message` sequence
    Ack = 0x04,

    /// Graceful disconnect notification
    Disconnect = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, NetError> {
        match value {
            0x01 => Ok(Self::HolePunch),
            0x02 => Ok(Self::Heartbeat),
            0x03 => Ok(Self::Message),
            0x04 => Ok(Self::Ack),
            0x05 => Ok(Self::Disconnect),
            _ => Err(NetError::Protocol(format!(
                "unknown packet type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// Parsed tunnel header.
///
/// The type is kept as the raw byte: a datagram with valid magic and
/// version but an unknown type still counts as peer activity, so type
/// decoding is deferred to the dispatch site.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// Raw packet type byte
    pub type_byte: u8,

    /// Sender sequence number (for `Ack`, the sequence being acknowledged)
    pub seq: u32,

    /// Declared payload length in bytes
    pub payload_len: u32,
}

impl Header {
    /// Parse and validate the fixed header of a datagram.
    ///
    /// Fails on truncated input, wrong magic, or wrong version.
    pub fn parse(data: &[u8]) -> NetResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(NetError::Protocol(format!(
                "datagram too short: {} bytes",
                data.len()
            )));
        }

        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MAGIC {
            return Err(NetError::Protocol(format!(
                "invalid magic number: 0x{:08x}",
                magic
            )));
        }

        let version = u16::from_be_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(NetError::Protocol(format!(
                "unsupported protocol version: {}",
                version
            )));
        }

        let type_byte = data[6];
        let seq = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let payload_len = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);

        Ok(Self {
            type_byte,
            seq,
            payload_len,
        })
    }

    /// Decode the packet type byte
    pub fn packet_type(&self) -> NetResult<PacketType> {
        PacketType::try_from(self.type_byte)
    }
}

/// Write a tunnel header into `buf`
fn put_header(buf: &mut BytesMut, packet_type: PacketType, seq: u32, payload_len: u32) {
    buf.put_u32(MAGIC);
    buf.put_u16(VERSION);
    buf.put_u8(packet_type as u8);
    buf.put_u8(0); // reserved
    buf.put_u32(seq);
    buf.put_u32(payload_len);
}

/// Build a 16-byte control frame (no payload)
pub fn control_frame(packet_type: PacketType, seq: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    put_header(&mut buf, packet_type, seq, 0);
    buf.freeze()
}

/// Build a `Message` frame carrying an IPv4 payload.
///
/// The caller is responsible for enforcing [`MAX_PAYLOAD`].
pub fn message_frame(seq: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    put_header(&mut buf, PacketType::Message, seq, payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let frame = message_frame(42, &[1, 2, 3, 4, 5]);
        assert_eq!(frame.len(), HEADER_LEN + 5);

        let header = Header::parse(&frame).unwrap();
        assert_eq!(header.packet_type().unwrap(), PacketType::Message);
        assert_eq!(header.seq, 42);
        assert_eq!(header.payload_len, 5);
        assert_eq!(&frame[HEADER_LEN..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_control_frame_layout() {
        let frame = control_frame(PacketType::HolePunch, 7);
        assert_eq!(frame.len(), HEADER_LEN);
        assert_eq!(&frame[0..4], &MAGIC.to_be_bytes());
        assert_eq!(&frame[4..6], &VERSION.to_be_bytes());
        assert_eq!(frame[6], 0x01);
        assert_eq!(frame[7], 0);
        assert_eq!(&frame[8..12], &7u32.to_be_bytes());
        assert_eq!(&frame[12..16], &0u32.to_be_bytes());
    }

    #[test]
    fn test_all_types_roundtrip() {
        let types = [
            PacketType::HolePunch,
            PacketType::Heartbeat,
            PacketType::Message,
            PacketType::Ack,
            PacketType::Disconnect,
        ];

        for pt in types {
            let frame = control_frame(pt, 0);
            let header = Header::parse(&frame).unwrap();
            assert_eq!(header.packet_type().unwrap(), pt);
        }
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let frame = message_frame(1, &[]);
        let header = Header::parse(&frame).unwrap();
        assert_eq!(header.packet_type().unwrap(), PacketType::Message);
        assert_eq!(header.payload_len, 0);
        assert_eq!(frame.len(), HEADER_LEN);
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let frame = control_frame(PacketType::Heartbeat, 1);
        assert!(Header::parse(&frame[..HEADER_LEN - 1]).is_err());
        assert!(Header::parse(&[]).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut frame = control_frame(PacketType::Heartbeat, 1).to_vec();
        frame[0] = 0xFF;
        assert!(Header::parse(&frame).is_err());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut frame = control_frame(PacketType::Heartbeat, 1).to_vec();
        frame[5] = 9;
        assert!(Header::parse(&frame).is_err());
    }

    #[test]
    fn test_unknown_type_parses_but_does_not_decode() {
        let mut frame = control_frame(PacketType::Heartbeat, 3).to_vec();
        frame[6] = 0x7F;

        let header = Header::parse(&frame).unwrap();
        assert_eq!(header.seq, 3);
        assert!(header.packet_type().is_err());
    }

    #[test]
    fn test_size_limits() {
        assert_eq!(MAX_PAYLOAD, 65_491);
        assert_eq!(MAX_DATAGRAM, MAX_PAYLOAD + HEADER_LEN);
    }
}
