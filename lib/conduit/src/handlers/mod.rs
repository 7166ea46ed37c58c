//! The three protocol state machines that bring an anonymous socket to an
//! authenticated, keyed channel: INIT (bootstrap), COMMAND (control) and
//! DATA (bulk transfer).

pub mod command;
pub mod data;
pub mod init;
pub mod packets;

use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use solder::crypto::KeyExchange;
use solder::device::{DeviceIpSettings, PeerRole};

/// Connection parameters for a newly bootstrapped peer, emitted when an INIT
/// setup completes.
#[derive(Debug, Clone)]
pub struct NewDeviceParams {
    pub ip_settings: DeviceIpSettings,
    pub raw_password: String,
    pub public_key: Vec<u8>,
    pub expected_key_exchange: KeyExchange,
    pub peer_role: PeerRole,
}

/// Reassembles streamed message chunks into complete messages, enforcing a
/// size cap. Handlers need whole messages for decryption.
pub(crate) struct MessageAssembler {
    partial: Vec<u8>,
    max_size: usize,
}

impl MessageAssembler {
    pub fn new(max_size: usize) -> MessageAssembler {
        MessageAssembler {
            partial: Vec::new(),
            max_size,
        }
    }

    /// Feeds one received chunk. Returns the complete message once
    /// `remaining` reaches zero.
    pub fn push(&mut self, data: Vec<u8>, remaining: u64) -> NetworkResult<Option<Vec<u8>>> {
        if self.partial.len() + data.len() > self.max_size {
            self.partial.clear();
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        if self.partial.is_empty() && remaining == 0 {
            return Ok(Some(data));
        }

        self.partial.extend_from_slice(&data);

        if remaining == 0 {
            Ok(Some(std::mem::replace(&mut self.partial, Vec::new())))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_whole_message() {
        let mut assembler = MessageAssembler::new(1024);
        let result = assembler.push(vec![1, 2, 3], 0).unwrap();
        assert_eq!(result, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_assembler_chunked_message() {
        let mut assembler = MessageAssembler::new(1024);

        assert_eq!(assembler.push(vec![1, 2], 3).unwrap(), None);
        assert_eq!(assembler.push(vec![3, 4], 1).unwrap(), None);
        assert_eq!(assembler.push(vec![5], 0).unwrap(), Some(vec![1, 2, 3, 4, 5]));

        // State resets for the next message.
        assert_eq!(assembler.push(vec![9], 0).unwrap(), Some(vec![9]));
    }

    #[test]
    fn test_assembler_enforces_cap() {
        let mut assembler = MessageAssembler::new(4);

        assert_eq!(assembler.push(vec![1, 2, 3], 2).unwrap(), None);
        assert_eq!(
            assembler.push(vec![4, 5], 0),
            Err(NetworkError::Fatal(ErrorType::PayloadTooLarge))
        );
    }
}
