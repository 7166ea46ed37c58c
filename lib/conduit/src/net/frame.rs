//! Wire framing: the 4-byte big-endian message header and the 2-byte
//! connection intent frame exchanged once per socket.

use crate::net::support::{ConnectionRole, ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};
use solder::device::PeerRole;

/// Message header length on the wire.
pub const HEADER_SIZE: usize = 4;
/// Intent frame length on the wire.
pub const INTENT_SIZE: usize = 2;
/// Largest payload a receiver will accept. Headers above this are a protocol
/// violation even though the field can encode larger values.
pub const MAX_PAYLOAD_SIZE: u32 = i32::max_value() as u32;

/// Encodes a payload length into a message header.
#[inline]
pub fn encode_header(payload_size: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    BigEndian::write_u32(&mut header, payload_size);
    header
}

/// Decodes a message header. The caller must supply exactly `HEADER_SIZE`
/// bytes; the full u32 range is parsed and the cap is enforced by the
/// connection.
#[inline]
pub fn parse_header(data: &[u8]) -> u32 {
    BigEndian::read_u32(&data[..HEADER_SIZE])
}

/// The opening record of every connection: the initiator declares its peer
/// role and the connection role it expects to use.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IntentFrame {
    pub peer_role: PeerRole,
    pub connection_role: ConnectionRole,
}

impl IntentFrame {
    #[inline]
    pub fn new(peer_role: PeerRole, connection_role: ConnectionRole) -> IntentFrame {
        IntentFrame {
            peer_role,
            connection_role,
        }
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; INTENT_SIZE] {
        [self.peer_role.code(), self.connection_role.code()]
    }

    /// Parses an intent frame; any unknown byte value fails the handshake.
    #[inline]
    pub fn from_bytes(data: &[u8]) -> NetworkResult<IntentFrame> {
        if data.len() != INTENT_SIZE {
            return Err(NetworkError::Fatal(ErrorType::IncorrectIntent));
        }

        let peer_role =
            PeerRole::from_code(data[0]).ok_or(NetworkError::Fatal(ErrorType::IncorrectIntent))?;
        let connection_role =
            ConnectionRole::from_code(data[1]).ok_or(NetworkError::Fatal(ErrorType::IncorrectIntent))?;

        Ok(IntentFrame {
            peer_role,
            connection_role,
        })
    }
}
