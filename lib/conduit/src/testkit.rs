//! Test doubles shared by the crate's test modules: a recording event sink,
//! deterministic crypto/compression providers and in-memory collaborator
//! implementations.

use crate::net::connection::{ConnectionEvents, SharedConnection};
use crate::net::support::{ConnectionId, ConnectionInitiation, ConnectionManagerId};
use hashbrown::HashMap;
use solder::crypto::{
    CipherMode, CryptoError, CryptoProvider, PbkdfVariant, SymmetricCipher,
};
use solder::device::{DeviceDirectory, DeviceId, DeviceRecord, LocalPeerAuthEntry};
use solder::compress::{CompressionError, Compressor};
use solder::session::{SessionAccess, SessionError, SessionId, SessionType};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum RecordedEvent {
    Connect(ConnectionId),
    Disconnect(ConnectionId),
    Data(ConnectionId, Vec<u8>, u64),
    WriteResult(ConnectionId, bool),
    Destroy(ConnectionId),
    InitiationFailed(SocketAddr),
}

/// Event sink that records everything it sees, for assertions and
/// synchronization in tests.
pub struct RecordingSink {
    events: Mutex<Vec<RecordedEvent>>,
    connections: Mutex<Vec<SharedConnection>>,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink {
            events: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, event: RecordedEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains<F: Fn(&RecordedEvent) -> bool>(&self, pred: F) -> bool {
        self.events.lock().unwrap().iter().any(|event| pred(event))
    }

    pub fn count<F: Fn(&RecordedEvent) -> bool>(&self, pred: F) -> usize {
        self.events.lock().unwrap().iter().filter(|event| pred(event)).count()
    }

    /// Polls until the predicate holds over the recorded events or the
    /// timeout expires.
    pub fn wait_for<F: Fn(&[RecordedEvent]) -> bool>(&self, timeout: Duration, pred: F) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if pred(&self.events.lock().unwrap()) {
                return true;
            }

            if Instant::now() >= deadline {
                return false;
            }

            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// All data chunks recorded for a connection, in delivery order.
    pub fn data_chunks(&self, conn_id: ConnectionId) -> Vec<(Vec<u8>, u64)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::Data(id, data, remaining) if *id == conn_id => {
                    Some((data.clone(), *remaining))
                }
                _ => None,
            })
            .collect()
    }

    /// The first connection that fired `Connect`.
    pub fn first_connection(&self) -> Option<SharedConnection> {
        self.connections.lock().unwrap().first().cloned()
    }
}

impl ConnectionEvents for RecordingSink {
    fn on_connect(&self, conn: &SharedConnection) {
        self.connections.lock().unwrap().push(conn.clone());
        self.record(RecordedEvent::Connect(conn.id()));
    }

    fn on_disconnect(&self, conn: &SharedConnection) {
        self.record(RecordedEvent::Disconnect(conn.id()));
    }

    fn on_data_received(&self, conn: &SharedConnection, data: Vec<u8>, remaining: u64) {
        self.record(RecordedEvent::Data(conn.id(), data, remaining));
    }

    fn on_write_result(&self, conn: &SharedConnection, sent: bool) {
        self.record(RecordedEvent::WriteResult(conn.id(), sent));
    }

    fn on_can_be_destroyed(&self, conn: &SharedConnection, _initiation: ConnectionInitiation) {
        self.record(RecordedEvent::Destroy(conn.id()));
    }

    fn on_initiation_failed(&self, _manager: ConnectionManagerId, addr: SocketAddr, _kind: io::ErrorKind) {
        self.record(RecordedEvent::InitiationFailed(addr));
    }
}

#[inline]
fn fnv64(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[inline]
fn xorshift(state: &mut u64) -> u64 {
    let mut value = *state;
    value ^= value << 13;
    value ^= value >> 7;
    value ^= value << 17;
    *state = value;
    value
}

/// Expands a seed into `size` deterministic bytes.
fn expand(seed: u64, size: usize) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(size);

    while out.len() < size {
        let word = xorshift(&mut state);
        out.extend_from_slice(&word.to_be_bytes());
    }

    out.truncate(size);
    out
}

const MOCK_KEY_SIZE: usize = 32;
const MOCK_IV_SIZE: usize = 12;
const MOCK_TAG_SIZE: usize = 8;
const MOCK_MIN_ITERATIONS: u32 = 1000;

/// Deterministic crypto provider: xor keystreams with additive tags. Both
/// sides of a test derive identical state from identical inputs, so the
/// protocol logic can be exercised end to end without real primitives.
///
/// Mock asymmetric keys are symmetric pairs: the public and private halves
/// are the same bytes, which also makes the mock agreement commutative.
pub struct MockCryptoProvider {
    rng_state: AtomicU64,
    identity: Vec<u8>,
}

impl MockCryptoProvider {
    pub fn new(identity: u64) -> MockCryptoProvider {
        MockCryptoProvider {
            rng_state: AtomicU64::new(identity.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1),
            identity: expand(identity, MOCK_KEY_SIZE),
        }
    }

    /// The identity key pair as stored in device records (public == private
    /// for the mock).
    pub fn identity_key(&self) -> Vec<u8> {
        self.identity.clone()
    }

    fn keystream(key: &[u8], iv: &[u8], size: usize) -> Vec<u8> {
        let mut seed_input = Vec::with_capacity(key.len() + iv.len());
        seed_input.extend_from_slice(key);
        seed_input.extend_from_slice(iv);
        expand(fnv64(&seed_input), size)
    }

    fn tag(key: &[u8], iv: &[u8], plain: &[u8]) -> [u8; MOCK_TAG_SIZE] {
        let mut input = Vec::with_capacity(key.len() + iv.len() + plain.len());
        input.extend_from_slice(key);
        input.extend_from_slice(iv);
        input.extend_from_slice(plain);
        fnv64(&input).to_be_bytes()
    }
}

impl CryptoProvider for MockCryptoProvider {
    fn random_bytes(&self, out: &mut [u8]) {
        let mut state = self.rng_state.fetch_add(0x1234_5678_9abc_def1, Ordering::Relaxed) | 1;
        for chunk in out.chunks_mut(8) {
            let word = xorshift(&mut state).to_be_bytes();
            let len = chunk.len();
            chunk.copy_from_slice(&word[..len]);
        }
    }

    fn key_size(&self, _cipher: SymmetricCipher) -> usize {
        MOCK_KEY_SIZE
    }

    fn iv_size(&self, _cipher: SymmetricCipher, _mode: CipherMode) -> usize {
        MOCK_IV_SIZE
    }

    fn min_pbkdf_iterations(&self) -> u32 {
        MOCK_MIN_ITERATIONS
    }

    fn derive_key(
        &self,
        variant: PbkdfVariant,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        size: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        if !variant.is_supported() {
            return Err(CryptoError::Unsupported);
        }

        if iterations < MOCK_MIN_ITERATIONS {
            return Err(CryptoError::InvalidKey);
        }

        let mut input = Vec::new();
        input.push(variant.code());
        input.extend_from_slice(password);
        input.extend_from_slice(salt);
        input.extend_from_slice(&iterations.to_be_bytes());

        Ok(expand(fnv64(&input), size))
    }

    fn seal(
        &self,
        _cipher: SymmetricCipher,
        _mode: CipherMode,
        key: &[u8],
        iv: &[u8],
        plain: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let keystream = Self::keystream(key, iv, plain.len());
        let mut out: Vec<u8> = plain
            .iter()
            .zip(keystream.iter())
            .map(|(data, mask)| data ^ mask)
            .collect();
        out.extend_from_slice(&Self::tag(key, iv, plain));
        Ok(out)
    }

    fn open(
        &self,
        _cipher: SymmetricCipher,
        _mode: CipherMode,
        key: &[u8],
        iv: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < MOCK_TAG_SIZE {
            return Err(CryptoError::AuthFailed);
        }

        let (cipher_text, tag) = sealed.split_at(sealed.len() - MOCK_TAG_SIZE);
        let keystream = Self::keystream(key, iv, cipher_text.len());
        let plain: Vec<u8> = cipher_text
            .iter()
            .zip(keystream.iter())
            .map(|(data, mask)| data ^ mask)
            .collect();

        if Self::tag(key, iv, &plain)[..] != tag[..] {
            return Err(CryptoError::AuthFailed);
        }

        Ok(plain)
    }

    fn asym_encrypt(&self, public_key: &[u8], plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv = [0u8; 1];
        let keystream = Self::keystream(public_key, &iv, plain.len());
        let mut out: Vec<u8> = plain
            .iter()
            .zip(keystream.iter())
            .map(|(data, mask)| data ^ mask)
            .collect();
        out.extend_from_slice(&Self::tag(public_key, &iv, plain));
        Ok(out)
    }

    fn asym_decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < MOCK_TAG_SIZE {
            return Err(CryptoError::AuthFailed);
        }

        let iv = [0u8; 1];
        let (cipher_text, tag) = sealed.split_at(sealed.len() - MOCK_TAG_SIZE);
        let keystream = Self::keystream(&self.identity, &iv, cipher_text.len());
        let plain: Vec<u8> = cipher_text
            .iter()
            .zip(keystream.iter())
            .map(|(data, mask)| data ^ mask)
            .collect();

        if Self::tag(&self.identity, &iv, &plain)[..] != tag[..] {
            return Err(CryptoError::AuthFailed);
        }

        Ok(plain)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut input = self.identity.clone();
        input.extend_from_slice(data);
        Ok(fnv64(&input).to_be_bytes().to_vec())
    }

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let mut input = public_key.to_vec();
        input.extend_from_slice(data);

        if fnv64(&input).to_be_bytes()[..] != signature[..] {
            return Err(CryptoError::BadSignature);
        }

        Ok(())
    }

    fn agree(&self, local_private: &[u8], remote_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Order-independent mixing keeps the mock agreement commutative.
        let (first, second) = if local_private <= remote_public {
            (local_private, remote_public)
        } else {
            (remote_public, local_private)
        };

        let mut input = first.to_vec();
        input.extend_from_slice(second);
        Ok(expand(fnv64(&input), MOCK_KEY_SIZE))
    }

    fn local_public_key(&self) -> Vec<u8> {
        self.identity.clone()
    }
}

/// Run-length compressor standing in for LZ4 in tests.
pub struct MockCompressor;

impl Compressor for MockCompressor {
    fn compress(&self, data: &[u8], _acceleration: i32) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::new();
        let mut iter = data.iter().peekable();

        while let Some(&byte) = iter.next() {
            let mut run = 1u8;
            while run < u8::max_value() && iter.peek() == Some(&&byte) {
                iter.next();
                run += 1;
            }
            out.push(run);
            out.push(byte);
        }

        Ok(out)
    }

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, CompressionError> {
        if data.len() % 2 != 0 {
            return Err(CompressionError::Decompress);
        }

        let mut out = Vec::with_capacity(uncompressed_size);
        for pair in data.chunks(2) {
            for _ in 0..pair[0] {
                out.push(pair[1]);
            }
        }

        if out.len() != uncompressed_size {
            return Err(CompressionError::Decompress);
        }

        Ok(out)
    }
}

/// In-memory device directory.
pub struct MemoryDirectory {
    records: Mutex<HashMap<DeviceId, DeviceRecord>>,
    auth_entries: Mutex<Vec<(DeviceId, LocalPeerAuthEntry)>>,
}

impl MemoryDirectory {
    pub fn new() -> MemoryDirectory {
        MemoryDirectory {
            records: Mutex::new(HashMap::new()),
            auth_entries: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, record: DeviceRecord) {
        self.records.lock().unwrap().insert(record.id, record);
    }

    pub fn auth_entries(&self) -> Vec<(DeviceId, LocalPeerAuthEntry)> {
        self.auth_entries.lock().unwrap().clone()
    }
}

impl DeviceDirectory for MemoryDirectory {
    fn lookup_device(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    fn add_local_peer_auth(&self, id: DeviceId, entry: LocalPeerAuthEntry) {
        self.auth_entries.lock().unwrap().push((id, entry));
    }

    fn local_peer_password_exists(&self, password: &str) -> bool {
        self.auth_entries
            .lock()
            .unwrap()
            .iter()
            .any(|(_, entry)| entry.password == password)
    }
}

/// In-memory session issuer with per-device expected passwords.
pub struct MemorySessions {
    passwords: Mutex<HashMap<DeviceId, Vec<u8>>>,
    next_id: AtomicU64,
    opened: Mutex<Vec<(DeviceId, SessionType, SessionId)>>,
}

impl MemorySessions {
    pub fn new() -> MemorySessions {
        MemorySessions {
            passwords: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn expect_password(&self, device: DeviceId, password: Vec<u8>) {
        self.passwords.lock().unwrap().insert(device, password);
    }

    pub fn opened_sessions(&self) -> Vec<(DeviceId, SessionType, SessionId)> {
        self.opened.lock().unwrap().clone()
    }
}

impl SessionAccess for MemorySessions {
    fn open_session(
        &self,
        device: &DeviceId,
        raw_password: &[u8],
        kind: SessionType,
    ) -> Result<SessionId, SessionError> {
        if let Some(expected) = self.passwords.lock().unwrap().get(device) {
            if expected[..] != raw_password[..] {
                return Err(SessionError::AuthenticationFailed);
            }
        }

        let session = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.opened.lock().unwrap().push((*device, kind, session));
        Ok(session)
    }
}

pub fn mock_provider(identity: u64) -> Arc<MockCryptoProvider> {
    Arc::new(MockCryptoProvider::new(identity))
}

/// Polls a predicate until it holds or the timeout expires.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, pred: F) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        if pred() {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_seal_open_roundtrip() {
        let provider = MockCryptoProvider::new(1);
        let key = expand(42, MOCK_KEY_SIZE);
        let iv = expand(43, MOCK_IV_SIZE);

        let sealed = provider
            .seal(SymmetricCipher::Aes, CipherMode::Gcm, &key, &iv, b"payload")
            .unwrap();
        assert_ne!(&sealed[..7], b"payload");

        let opened = provider
            .open(SymmetricCipher::Aes, CipherMode::Gcm, &key, &iv, &sealed)
            .unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn test_mock_open_rejects_wrong_iv() {
        let provider = MockCryptoProvider::new(1);
        let key = expand(42, MOCK_KEY_SIZE);
        let iv = expand(43, MOCK_IV_SIZE);
        let other_iv = expand(44, MOCK_IV_SIZE);

        let sealed = provider
            .seal(SymmetricCipher::Aes, CipherMode::Gcm, &key, &iv, b"payload")
            .unwrap();

        assert_eq!(
            provider.open(SymmetricCipher::Aes, CipherMode::Gcm, &key, &other_iv, &sealed),
            Err(CryptoError::AuthFailed)
        );
    }

    #[test]
    fn test_mock_asym_roundtrip_and_signatures() {
        let alice = MockCryptoProvider::new(10);
        let bob = MockCryptoProvider::new(20);

        let sealed = alice.asym_encrypt(&bob.identity_key(), b"for bob").unwrap();
        assert_eq!(bob.asym_decrypt(&sealed).unwrap(), b"for bob");
        assert!(alice.asym_decrypt(&sealed).is_err());

        let signature = alice.sign(b"message").unwrap();
        assert!(bob.verify(&alice.identity_key(), b"message", &signature).is_ok());
        assert!(bob.verify(&alice.identity_key(), b"other", &signature).is_err());
        assert!(bob.verify(&bob.identity_key(), b"message", &signature).is_err());
    }

    #[test]
    fn test_mock_agreement_is_commutative() {
        let alice = MockCryptoProvider::new(10);
        let bob = MockCryptoProvider::new(20);

        let from_alice = alice.agree(&alice.identity_key(), &bob.identity_key()).unwrap();
        let from_bob = bob.agree(&bob.identity_key(), &alice.identity_key()).unwrap();

        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn test_mock_derive_rejects_sha3() {
        let provider = MockCryptoProvider::new(1);

        assert_eq!(
            provider.derive_key(PbkdfVariant::Sha3_256, b"pw", b"salt", 10_000, 44),
            Err(CryptoError::Unsupported)
        );

        let derived = provider
            .derive_key(PbkdfVariant::Sha256, b"pw", b"salt", 10_000, 44)
            .unwrap();
        assert_eq!(derived.len(), 44);

        // Deterministic across providers.
        let other = MockCryptoProvider::new(99);
        assert_eq!(
            other.derive_key(PbkdfVariant::Sha256, b"pw", b"salt", 10_000, 44).unwrap(),
            derived
        );
    }

    #[test]
    fn test_mock_compressor_roundtrip() {
        let compressor = MockCompressor;
        let data = b"aaaabbbcccccccccccccccccccccccccccd".to_vec();

        let compressed = compressor.compress(&data, 1).unwrap();
        assert!(compressed.len() < data.len());

        let decompressed = compressor.decompress(&compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);

        assert!(compressor.decompress(&compressed, data.len() + 1).is_err());
    }
}
