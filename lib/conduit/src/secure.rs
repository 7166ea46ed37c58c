//! Symmetric session crypto with the rolling-IV convention: every sealed
//! message carries the IV for the next one appended past the AEAD output, so
//! both endpoints stay in lock-step without a separate rekey message.

use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use solder::crypto::{CipherMode, CryptoProvider, SymmetricCipher};
use std::sync::{Arc, Mutex};

/// Negotiated symmetric state for one connection. The IV advances on every
/// seal and open; a message sealed with a stale IV fails authentication on
/// the receiving side.
pub struct SymmetricCrypto {
    provider: Arc<dyn CryptoProvider>,
    cipher: SymmetricCipher,
    mode: CipherMode,
    key: Vec<u8>,
    iv: Mutex<Vec<u8>>,
}

impl SymmetricCrypto {
    pub fn new(
        provider: Arc<dyn CryptoProvider>,
        cipher: SymmetricCipher,
        mode: CipherMode,
        key: Vec<u8>,
        iv: Vec<u8>,
    ) -> SymmetricCrypto {
        SymmetricCrypto {
            provider,
            cipher,
            mode,
            key,
            iv: Mutex::new(iv),
        }
    }

    #[inline]
    pub fn cipher(&self) -> SymmetricCipher {
        self.cipher
    }

    #[inline]
    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    #[inline]
    pub fn iv_size(&self) -> usize {
        self.provider.iv_size(self.cipher, self.mode)
    }

    /// The current IV. Exposed for state inspection only.
    pub fn current_iv(&self) -> Vec<u8> {
        self.iv.lock().expect("IV lock poisoned").clone()
    }

    /// Seals a message: `ciphertext_and_tag || iv_for_next`. The freshly
    /// generated trailing IV becomes the handle's state.
    pub fn seal_message(&self, plain: &[u8]) -> NetworkResult<Vec<u8>> {
        let mut iv = self.iv.lock().expect("IV lock poisoned");

        let mut next_iv = vec![0u8; iv.len()];
        self.provider.random_bytes(&mut next_iv);

        let mut sealed = self
            .provider
            .seal(self.cipher, self.mode, &self.key, &iv, plain)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

        sealed.extend_from_slice(&next_iv);
        *iv = next_iv;

        Ok(sealed)
    }

    /// Opens a message sealed by `seal_message`: authenticates against the
    /// current IV, then installs the trailing IV for future traffic.
    pub fn open_message(&self, sealed: &[u8]) -> NetworkResult<Vec<u8>> {
        let mut iv = self.iv.lock().expect("IV lock poisoned");

        if sealed.len() <= iv.len() {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        let (body, next_iv) = sealed.split_at(sealed.len() - iv.len());

        let plain = self
            .provider
            .open(self.cipher, self.mode, &self.key, &iv, body)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

        iv.copy_from_slice(next_iv);

        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::mock_provider;

    fn pair() -> (SymmetricCrypto, SymmetricCrypto) {
        let provider = mock_provider(1);
        let key = vec![7u8; 32];
        let iv = vec![9u8; 12];

        let alice = SymmetricCrypto::new(
            provider.clone(),
            SymmetricCipher::Aes,
            CipherMode::Gcm,
            key.clone(),
            iv.clone(),
        );
        let bob = SymmetricCrypto::new(provider, SymmetricCipher::Aes, CipherMode::Gcm, key, iv);

        (alice, bob)
    }

    #[test]
    fn test_roll_roundtrip() {
        let (alice, bob) = pair();

        let sealed = alice.seal_message(b"ping").unwrap();
        assert_eq!(bob.open_message(&sealed).unwrap(), b"ping");

        // Both sides advanced to the same IV.
        assert_eq!(alice.current_iv(), bob.current_iv());

        let reply = bob.seal_message(b"pong").unwrap();
        assert_eq!(alice.open_message(&reply).unwrap(), b"pong");
        assert_eq!(alice.current_iv(), bob.current_iv());
    }

    #[test]
    fn test_iv_never_reused() {
        let (alice, bob) = pair();

        let first_iv = alice.current_iv();
        let sealed = alice.seal_message(b"one").unwrap();
        let second_iv = alice.current_iv();

        assert_ne!(first_iv, second_iv);

        bob.open_message(&sealed).unwrap();
        let reply = bob.seal_message(b"two").unwrap();
        let third_iv = bob.current_iv();

        assert_ne!(second_iv, third_iv);
        assert_ne!(first_iv, third_iv);
        alice.open_message(&reply).unwrap();
    }

    #[test]
    fn test_replay_fails_authentication() {
        let (alice, bob) = pair();

        let sealed = alice.seal_message(b"once").unwrap();
        bob.open_message(&sealed).unwrap();

        // The receiver installed the new IV, so a replay cannot verify.
        assert_eq!(
            bob.open_message(&sealed),
            Err(NetworkError::Fatal(ErrorType::Crypto))
        );
    }

    #[test]
    fn test_out_of_order_fails_authentication() {
        let (alice, bob) = pair();

        let first = alice.seal_message(b"first").unwrap();
        let second = alice.seal_message(b"second").unwrap();

        assert_eq!(
            bob.open_message(&second),
            Err(NetworkError::Fatal(ErrorType::Crypto))
        );

        drop(first);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let (alice, bob) = pair();

        let sealed = alice.seal_message(b"data").unwrap();
        assert_eq!(
            bob.open_message(&sealed[..10]),
            Err(NetworkError::Fatal(ErrorType::Crypto))
        );
    }
}
