//! Device collaborator types. Persistent storage of device records lives
//! outside the workspace; the networking core consumes the `DeviceDirectory`
//! capability.

use crate::crypto::KeyExchange;
use crate::encoding::base64;
use serde::{de, Deserialize, Deserializer};
use serde_derive::Serialize;
use std::fmt;

/// Stable device identifier, generated once per peer.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct DeviceId(#[serde(serialize_with = "base64::serialize")] [u8; 16]);

impl DeviceId {
    pub const SIZE: usize = 16;

    #[inline]
    pub fn new(raw: [u8; 16]) -> DeviceId {
        DeviceId(raw)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Builds a device id from a slice; fails unless exactly 16 bytes long.
    #[inline]
    pub fn from_slice(raw: &[u8]) -> Option<DeviceId> {
        if raw.len() != Self::SIZE {
            return None;
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(raw);
        Some(DeviceId(id))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceId({})", self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<DeviceId, D::Error> {
        let raw = base64::deserialize(deserializer)?;
        DeviceId::from_slice(&raw).ok_or_else(|| de::Error::custom("device id must be 16 bytes"))
    }
}

/// Peer role in higher-level semantics, carried in the connection intent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Client,
    Server,
}

impl PeerRole {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            PeerRole::Client => b'C',
            PeerRole::Server => b'S',
        }
    }

    #[inline]
    pub fn from_code(code: u8) -> Option<PeerRole> {
        match code {
            b'C' => Some(PeerRole::Client),
            b'S' => Some(PeerRole::Server),
            _ => None,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerRole::Client => f.write_str("client"),
            PeerRole::Server => f.write_str("server"),
        }
    }
}

/// Listening endpoints advertised by a device, one per connection role.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceIpSettings {
    pub command_address: String,
    pub command_port: u16,
    pub data_address: String,
    pub data_port: u16,
    pub init_address: String,
    pub init_port: u16,
}

/// Device record as held by the persistent store.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub peer_role: PeerRole,
    /// Raw public key of the device, captured during the initial setup.
    #[serde(with = "base64")]
    pub public_key: Vec<u8>,
    /// Local private half of the per-peer agreement key pair.
    #[serde(with = "base64")]
    pub agreement_private_key: Vec<u8>,
    /// Remote public half of the per-peer agreement key pair.
    #[serde(with = "base64")]
    pub agreement_public_key: Vec<u8>,
    /// Raw authentication secret shared with the device.
    #[serde(with = "base64")]
    pub password: Vec<u8>,
    pub expected_key_exchange: KeyExchange,
    pub ip_settings: DeviceIpSettings,
}

/// Authentication data for the local peer, as registered with a remote
/// server during initial setup.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LocalPeerAuthEntry {
    pub password: String,
    pub created: u64,
}

/// Device lookup and registration capability.
pub trait DeviceDirectory: Send + Sync {
    /// Retrieves the record for a known device.
    fn lookup_device(&self, id: &DeviceId) -> Option<DeviceRecord>;

    /// Appends authentication data generated for a remote server peer.
    fn add_local_peer_auth(&self, id: DeviceId, entry: LocalPeerAuthEntry);

    /// Returns true if the supplied password is already assigned to a peer.
    /// Used to retry random password generation on collision.
    fn local_peer_password_exists(&self, _password: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::new([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }

    #[test]
    fn test_device_id_from_slice() {
        assert!(DeviceId::from_slice(&[1u8; 16]).is_some());
        assert!(DeviceId::from_slice(&[1u8; 15]).is_none());
        assert!(DeviceId::from_slice(&[1u8; 17]).is_none());
    }

    #[test]
    fn test_peer_role_codes() {
        assert_eq!(PeerRole::from_code(b'C'), Some(PeerRole::Client));
        assert_eq!(PeerRole::from_code(b'S'), Some(PeerRole::Server));
        assert_eq!(PeerRole::from_code(b'D'), None);
    }
}
