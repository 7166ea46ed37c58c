//! Configuration of the networking core. The structs deserialize from TOML
//! (via `serdeconv`) or any other serde source; validation happens at
//! construction and a rejected configuration refuses to start.

use crate::net::buffer::BUF_SIZE_INCREMENT;
use crate::net::support::{ConnectionRole, ErrorType, NetworkError, NetworkResult};
use hashbrown::HashSet;
use serde_derive::Deserialize;
use solder::crypto::{CipherMode, KeyExchange, PbkdfVariant, SymmetricCipher};
use solder::device::{DeviceId, DeviceIpSettings, PeerRole};

fn default_network_threads() -> usize {
    4
}

fn default_instruction_threads() -> usize {
    2
}

fn default_setup_timeout() -> u64 {
    30
}

fn default_init_setup_timeout() -> u64 {
    60
}

fn default_command_inactivity() -> u64 {
    300
}

fn default_data_inactivity() -> u64 {
    120
}

fn default_discard_timeout() -> u64 {
    120
}

fn default_expected_data_timeout() -> u64 {
    60
}

fn default_expected_init_timeout() -> u64 {
    120
}

fn default_instruction_timeout() -> u64 {
    60
}

fn default_signature_size() -> usize {
    32
}

fn default_key_exchange() -> KeyExchange {
    KeyExchange::Rsa
}

fn default_password_size() -> usize {
    32
}

fn default_password_attempts() -> usize {
    5
}

fn default_compression_acceleration() -> i32 {
    1
}

fn default_max_data_size() -> usize {
    16 * 1024 * 1024
}

fn default_pbkdf_variant() -> PbkdfVariant {
    PbkdfVariant::Sha256
}

fn default_pbkdf_iterations() -> u32 {
    10_000
}

fn default_pbkdf_salt_size() -> usize {
    16
}

fn default_cipher() -> SymmetricCipher {
    SymmetricCipher::Aes
}

fn default_cipher_mode() -> CipherMode {
    CipherMode::Gcm
}

fn default_request_timeout() -> u64 {
    30
}

fn default_read_buffer_size() -> usize {
    65536
}

fn default_write_buffer_size() -> usize {
    8 * 65536
}

fn default_initial_threads() -> usize {
    1
}

/// Identity of this peer, as shared with remote peers.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalPeerConfig {
    pub device_id: DeviceId,
    pub peer_role: PeerRole,
    pub ip_settings: DeviceIpSettings,
}

/// Per-listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    pub role: ConnectionRole,
    pub bind_addr: String,
    pub bind_port: u16,
    /// `0` means unbounded.
    #[serde(default)]
    pub max_active_connections: usize,
    #[serde(default = "default_initial_threads")]
    pub initial_thread_pool_size: usize,
    /// Seconds an inbound connection has to deliver its intent frame;
    /// `0` disables the deadline.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_read_buffer_size")]
    pub default_read_buffer_size: usize,
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkCoreConfig {
    pub local_peer: LocalPeerConfig,

    #[serde(default = "default_network_threads")]
    pub network_thread_pool_size: usize,
    #[serde(default = "default_instruction_threads")]
    pub instructions_thread_pool_size: usize,

    #[serde(default = "default_setup_timeout")]
    pub command_connection_setup_timeout: u64,
    #[serde(default = "default_setup_timeout")]
    pub data_connection_setup_timeout: u64,
    #[serde(default = "default_init_setup_timeout")]
    pub init_connection_setup_timeout: u64,
    #[serde(default = "default_command_inactivity")]
    pub command_connection_inactivity_timeout: u64,
    #[serde(default = "default_data_inactivity")]
    pub data_connection_inactivity_timeout: u64,
    #[serde(default = "default_discard_timeout")]
    pub pending_connection_data_discard_timeout: u64,
    #[serde(default = "default_expected_data_timeout")]
    pub expected_data_connection_timeout: u64,
    #[serde(default = "default_expected_init_timeout")]
    pub expected_init_connection_timeout: u64,
    #[serde(default = "default_instruction_timeout")]
    pub pending_instruction_discard_timeout: u64,

    #[serde(default = "default_signature_size")]
    pub request_signature_size: usize,
    #[serde(default = "default_key_exchange")]
    pub key_exchange_default: KeyExchange,
    #[serde(default = "default_password_size")]
    pub default_random_password_size: usize,
    #[serde(default = "default_password_attempts")]
    pub max_random_password_attempts: usize,

    #[serde(default = "default_compression_acceleration")]
    pub compression_acceleration_level: i32,
    #[serde(default = "default_max_data_size")]
    pub max_data_size: usize,

    #[serde(default = "default_pbkdf_variant")]
    pub pbkdf_variant: PbkdfVariant,
    #[serde(default = "default_pbkdf_iterations")]
    pub pbkdf_iterations: u32,
    #[serde(default = "default_pbkdf_salt_size")]
    pub pbkdf_salt_size: usize,
    #[serde(default = "default_cipher")]
    pub default_cipher: SymmetricCipher,
    #[serde(default = "default_cipher_mode")]
    pub default_cipher_mode: CipherMode,

    pub managers: Vec<ManagerConfig>,
}

impl NetworkCoreConfig {
    /// Validates the configuration. A failing configuration must not be
    /// used to construct the core.
    pub fn validate(&self) -> NetworkResult<()> {
        if self.network_thread_pool_size == 0 || self.instructions_thread_pool_size == 0 {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        if self.request_signature_size < 8 {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        // Only the SHA-2 derivation variants are supported.
        if !self.pbkdf_variant.is_supported() {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        if self.pbkdf_iterations == 0 || self.pbkdf_salt_size < 8 {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        if self.default_random_password_size == 0 || self.max_random_password_attempts == 0 {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        if self.max_data_size == 0 {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        if self.managers.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        // Every listener owns one I/O loop thread; the pool must cover them.
        if self.network_thread_pool_size < self.managers.len() {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        let mut endpoints = HashSet::new();

        for manager in &self.managers {
            if manager.initial_thread_pool_size == 0 {
                return Err(NetworkError::Fatal(ErrorType::Config));
            }

            if manager.default_read_buffer_size == 0
                || manager.default_read_buffer_size % BUF_SIZE_INCREMENT != 0
            {
                return Err(NetworkError::Fatal(ErrorType::Config));
            }

            if manager.write_buffer_size < manager.default_read_buffer_size
                || manager.write_buffer_size % BUF_SIZE_INCREMENT != 0
            {
                return Err(NetworkError::Fatal(ErrorType::Config));
            }

            // A bound port may only serve one listener, except port 0 which
            // the system resolves per bind.
            if manager.bind_port != 0
                && !endpoints.insert((manager.bind_addr.clone(), manager.bind_port))
            {
                return Err(NetworkError::Fatal(ErrorType::Config));
            }
        }

        Ok(())
    }

    /// Managers configured for a given role.
    pub fn managers_of(&self, role: ConnectionRole) -> impl Iterator<Item = &ManagerConfig> {
        self.managers.iter().filter(move |manager| manager.role == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_TOML: &str = r#"
[local_peer]
device_id = "AAAAAAAAAAAAAAAAAAAAAA=="
peer_role = "server"

[local_peer.ip_settings]
command_address = "127.0.0.1"
command_port = 9001
data_address = "127.0.0.1"
data_port = 9002
init_address = "127.0.0.1"
init_port = 9003

[[managers]]
role = "command"
bind_addr = "127.0.0.1"
bind_port = 9001

[[managers]]
role = "data"
bind_addr = "127.0.0.1"
bind_port = 9002

[[managers]]
role = "init"
bind_addr = "127.0.0.1"
bind_port = 9003
"#;

    fn parse(toml: &str) -> NetworkCoreConfig {
        serdeconv::from_toml_str(toml).expect("Configuration must parse")
    }

    #[test]
    fn test_parse_with_defaults() {
        let config = parse(CONFIG_TOML);

        assert_eq!(config.network_thread_pool_size, 4);
        assert_eq!(config.command_connection_setup_timeout, 30);
        assert_eq!(config.init_connection_setup_timeout, 60);
        assert_eq!(config.request_signature_size, 32);
        assert_eq!(config.key_exchange_default, KeyExchange::Rsa);
        assert_eq!(config.pbkdf_variant, PbkdfVariant::Sha256);
        assert_eq!(config.default_cipher, SymmetricCipher::Aes);
        assert_eq!(config.default_cipher_mode, CipherMode::Gcm);
        assert_eq!(config.managers.len(), 3);

        config.validate().unwrap();
    }

    #[test]
    fn test_managers_of() {
        let config = parse(CONFIG_TOML);

        assert_eq!(config.managers_of(ConnectionRole::Command).count(), 1);
        assert_eq!(config.managers_of(ConnectionRole::Data).count(), 1);
        assert_eq!(config.managers_of(ConnectionRole::Init).count(), 1);
    }

    #[test]
    fn test_rejects_sha3_pbkdf() {
        let mut config = parse(CONFIG_TOML);
        config.pbkdf_variant = PbkdfVariant::Sha3_256;

        assert_eq!(
            config.validate(),
            Err(NetworkError::Fatal(ErrorType::Config))
        );
    }

    #[test]
    fn test_rejects_zero_pools_and_empty_managers() {
        let mut config = parse(CONFIG_TOML);
        config.network_thread_pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = parse(CONFIG_TOML);
        config.managers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_buffer_sizes() {
        let mut config = parse(CONFIG_TOML);
        config.managers[0].default_read_buffer_size = 1000;
        assert!(config.validate().is_err());

        let mut config = parse(CONFIG_TOML);
        config.managers[0].write_buffer_size = BUF_SIZE_INCREMENT;
        config.managers[0].default_read_buffer_size = BUF_SIZE_INCREMENT * 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_undersized_network_pool() {
        let mut config = parse(CONFIG_TOML);
        config.network_thread_pool_size = 2;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_endpoints() {
        let mut config = parse(CONFIG_TOML);
        config.managers[1].bind_port = config.managers[0].bind_port;

        assert!(config.validate().is_err());
    }
}
