//! Cryptographic capability surface consumed by the networking core.
//!
//! The concrete primitives live outside this workspace; everything here is
//! expressed against the `CryptoProvider` trait. Cipher and mode selection is
//! tag-dispatched and providers fail closed on combinations they do not
//! support.

use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Symmetric cipher selection, as negotiated during connection setup.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymmetricCipher {
    Aes,
    Serpent,
    Twofish,
}

impl SymmetricCipher {
    /// Single-byte wire code for the cipher.
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            SymmetricCipher::Aes => b'A',
            SymmetricCipher::Serpent => b'S',
            SymmetricCipher::Twofish => b'T',
        }
    }

    /// Parses the single-byte wire code.
    #[inline]
    pub fn from_code(code: u8) -> Option<SymmetricCipher> {
        match code {
            b'A' => Some(SymmetricCipher::Aes),
            b'S' => Some(SymmetricCipher::Serpent),
            b'T' => Some(SymmetricCipher::Twofish),
            _ => None,
        }
    }
}

impl fmt::Display for SymmetricCipher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SymmetricCipher::Aes => "aes",
            SymmetricCipher::Serpent => "serpent",
            SymmetricCipher::Twofish => "twofish",
        };
        f.write_str(name)
    }
}

/// Authenticated cipher mode selection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherMode {
    Gcm,
    Ccm,
    Eax,
}

impl CipherMode {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            CipherMode::Gcm => b'G',
            CipherMode::Ccm => b'C',
            CipherMode::Eax => b'E',
        }
    }

    #[inline]
    pub fn from_code(code: u8) -> Option<CipherMode> {
        match code {
            b'G' => Some(CipherMode::Gcm),
            b'C' => Some(CipherMode::Ccm),
            b'E' => Some(CipherMode::Eax),
            _ => None,
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CipherMode::Gcm => "gcm",
            CipherMode::Ccm => "ccm",
            CipherMode::Eax => "eax",
        };
        f.write_str(name)
    }
}

/// Password-based key derivation variant. Only the SHA-2 variants are
/// supported; the SHA-3 variants are declared for wire compatibility and
/// rejected by providers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PbkdfVariant {
    Sha256,
    Sha512,
    Sha3_256,
    Sha3_512,
}

impl PbkdfVariant {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            PbkdfVariant::Sha256 => 1,
            PbkdfVariant::Sha512 => 2,
            PbkdfVariant::Sha3_256 => 3,
            PbkdfVariant::Sha3_512 => 4,
        }
    }

    #[inline]
    pub fn from_code(code: u8) -> Option<PbkdfVariant> {
        match code {
            1 => Some(PbkdfVariant::Sha256),
            2 => Some(PbkdfVariant::Sha512),
            3 => Some(PbkdfVariant::Sha3_256),
            4 => Some(PbkdfVariant::Sha3_512),
            _ => None,
        }
    }

    /// Returns true for the variants providers are required to implement.
    #[inline]
    pub fn is_supported(self) -> bool {
        match self {
            PbkdfVariant::Sha256 | PbkdfVariant::Sha512 => true,
            PbkdfVariant::Sha3_256 | PbkdfVariant::Sha3_512 => false,
        }
    }
}

/// Session key agreement mechanism for authenticated connections.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyExchange {
    Rsa,
    Ecdh,
}

impl KeyExchange {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            KeyExchange::Rsa => b'R',
            KeyExchange::Ecdh => b'E',
        }
    }

    #[inline]
    pub fn from_code(code: u8) -> Option<KeyExchange> {
        match code {
            b'R' => Some(KeyExchange::Rsa),
            b'E' => Some(KeyExchange::Ecdh),
            _ => None,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum CryptoError {
    /// The requested cipher/mode/derivation combination is not available.
    Unsupported,
    /// Authentication failed on an AEAD open.
    AuthFailed,
    /// A signature did not verify against the supplied public key.
    BadSignature,
    /// Key material could not be used (wrong size, malformed blob).
    InvalidKey,
    /// Key or random data generation failed.
    Generation,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CryptoError::Unsupported => f.write_str("unsupported crypto variant"),
            CryptoError::AuthFailed => f.write_str("authentication failed"),
            CryptoError::BadSignature => f.write_str("signature verification failed"),
            CryptoError::InvalidKey => f.write_str("invalid key material"),
            CryptoError::Generation => f.write_str("generation failure"),
        }
    }
}

/// Cryptographic provider capability.
///
/// The provider owns the local asymmetric identity (used by `sign` and
/// `asym_decrypt`); remote public keys are passed in explicitly. All methods
/// must be callable from any thread.
pub trait CryptoProvider: Send + Sync {
    /// Fills the buffer with cryptographically secure random bytes.
    fn random_bytes(&self, out: &mut [u8]);

    /// Key size in bytes for the given cipher.
    fn key_size(&self, cipher: SymmetricCipher) -> usize;

    /// IV size in bytes for the given cipher/mode combination.
    fn iv_size(&self, cipher: SymmetricCipher, mode: CipherMode) -> usize;

    /// The smallest iteration count the provider accepts for key derivation.
    fn min_pbkdf_iterations(&self) -> u32;

    /// Derives `size` bytes of key material from a password and salt.
    fn derive_key(
        &self,
        variant: PbkdfVariant,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        size: usize,
    ) -> Result<Vec<u8>, CryptoError>;

    /// AEAD-seals the plaintext; output is ciphertext plus authentication tag.
    fn seal(
        &self,
        cipher: SymmetricCipher,
        mode: CipherMode,
        key: &[u8],
        iv: &[u8],
        plain: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Opens an AEAD-sealed message, verifying its tag.
    fn open(
        &self,
        cipher: SymmetricCipher,
        mode: CipherMode,
        key: &[u8],
        iv: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Encrypts for the holder of the supplied public key.
    fn asym_encrypt(&self, public_key: &[u8], plain: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypts with the local private key.
    fn asym_decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Signs with the local private key.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verifies a signature against the supplied public key.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<(), CryptoError>;

    /// Computes the shared secret between a local private key and a remote
    /// public key.
    fn agree(&self, local_private: &[u8], remote_public: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// The local public key, as shared with remote peers.
    fn local_public_key(&self) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_codes_roundtrip() {
        for cipher in &[SymmetricCipher::Aes, SymmetricCipher::Serpent, SymmetricCipher::Twofish] {
            assert_eq!(SymmetricCipher::from_code(cipher.code()), Some(*cipher));
        }
        assert_eq!(SymmetricCipher::from_code(b'X'), None);
    }

    #[test]
    fn test_mode_codes_roundtrip() {
        for mode in &[CipherMode::Gcm, CipherMode::Ccm, CipherMode::Eax] {
            assert_eq!(CipherMode::from_code(mode.code()), Some(*mode));
        }
        assert_eq!(CipherMode::from_code(0), None);
    }

    #[test]
    fn test_pbkdf_support() {
        assert!(PbkdfVariant::Sha256.is_supported());
        assert!(PbkdfVariant::Sha512.is_supported());
        assert!(!PbkdfVariant::Sha3_256.is_supported());
        assert!(!PbkdfVariant::Sha3_512.is_supported());
    }

    #[test]
    fn test_key_exchange_codes() {
        assert_eq!(KeyExchange::from_code(b'R'), Some(KeyExchange::Rsa));
        assert_eq!(KeyExchange::from_code(b'E'), Some(KeyExchange::Ecdh));
        assert_eq!(KeyExchange::from_code(b'Q'), None);
    }
}
