//! Dual-indexed tables of pending per-role connection parameters. Handlers
//! consult the store on the first message from an unknown peer to match the
//! incoming socket to the expected setup.

use crate::net::support::{ErrorType, NetworkError, NetworkResult, TransientConnectionId};
use hashbrown::HashMap;
use solder::crypto::{CipherMode, SymmetricCipher};
use solder::device::{DeviceId, DeviceRecord, PeerRole};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Address key: remote IP (as text) and port.
pub type AddrKey = (String, u16);

/// Parameters for a COMMAND connection expected to or from a known device.
pub struct PendingCommandConfig {
    pub device: DeviceRecord,
    pub address: String,
    pub port: u16,
}

/// Parameters for a DATA connection, pre-registered by the open instruction.
pub struct PendingDataConfig {
    pub transient_id: TransientConnectionId,
    pub device: DeviceRecord,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub cipher: SymmetricCipher,
    pub mode: CipherMode,
    pub encrypt: bool,
    pub compress: bool,
    pub address: String,
    pub port: u16,
}

/// Parameters for an INIT connection: the out-of-band shared secret and the
/// locally generated id for the new peer.
pub struct PendingInitConfig {
    pub transient_id: TransientConnectionId,
    pub init_password: String,
    pub remote_peer_role: PeerRole,
    pub new_peer_id: DeviceId,
    pub address: String,
    pub port: u16,
}

struct Entry<T> {
    config: Arc<T>,
    created: Instant,
    /// True when the entry awaits an inbound connection rather than
    /// parameterizing an outbound one.
    expected: bool,
}

struct CommandTable {
    by_id: HashMap<DeviceId, Entry<PendingCommandConfig>>,
    by_addr: HashMap<AddrKey, DeviceId>,
}

struct DataTable {
    by_id: HashMap<(DeviceId, TransientConnectionId), Entry<PendingDataConfig>>,
    by_addr: HashMap<AddrKey, Vec<(DeviceId, TransientConnectionId)>>,
}

struct InitTable {
    by_id: HashMap<TransientConnectionId, Entry<PendingInitConfig>>,
    by_addr: HashMap<AddrKey, TransientConnectionId>,
}

/// Number of entries discarded per table by an expiry sweep.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct StoreSweep {
    pub command: usize,
    pub data: usize,
    pub init: usize,
}

/// The three pending-parameter tables, each behind its own mutex. No
/// operation takes more than one table lock.
pub struct ConnectionDataStore {
    command: Mutex<CommandTable>,
    data: Mutex<DataTable>,
    init: Mutex<InitTable>,
}

impl ConnectionDataStore {
    pub fn new() -> ConnectionDataStore {
        ConnectionDataStore {
            command: Mutex::new(CommandTable {
                by_id: HashMap::new(),
                by_addr: HashMap::new(),
            }),
            data: Mutex::new(DataTable {
                by_id: HashMap::new(),
                by_addr: HashMap::new(),
            }),
            init: Mutex::new(InitTable {
                by_id: HashMap::new(),
                by_addr: HashMap::new(),
            }),
        }
    }
}

impl ConnectionDataStore {
    /// Registers pending COMMAND parameters; both the device id and the
    /// address must be unused.
    pub fn add_command(&self, config: PendingCommandConfig, expected: bool) -> NetworkResult<()> {
        let mut table = self.command.lock().expect("Command table lock poisoned");
        let addr_key = (config.address.clone(), config.port);

        if table.by_id.contains_key(&config.device.id) || table.by_addr.contains_key(&addr_key) {
            return Err(NetworkError::Fatal(ErrorType::Duplicate));
        }

        let device_id = config.device.id;
        table.by_addr.insert(addr_key, device_id);
        table.by_id.insert(
            device_id,
            Entry {
                config: Arc::new(config),
                created: Instant::now(),
                expected,
            },
        );

        Ok(())
    }

    pub fn command_by_device(&self, device: &DeviceId) -> Option<Arc<PendingCommandConfig>> {
        self.command
            .lock()
            .expect("Command table lock poisoned")
            .by_id
            .get(device)
            .map(|entry| entry.config.clone())
    }

    pub fn command_by_addr(&self, address: &str, port: u16) -> Option<Arc<PendingCommandConfig>> {
        let table = self.command.lock().expect("Command table lock poisoned");
        let device = table.by_addr.get(&(address.to_string(), port))?;
        table.by_id.get(device).map(|entry| entry.config.clone())
    }

    pub fn has_command(&self, device: &DeviceId) -> bool {
        self.command
            .lock()
            .expect("Command table lock poisoned")
            .by_id
            .contains_key(device)
    }

    pub fn discard_command(&self, device: &DeviceId) -> Option<Arc<PendingCommandConfig>> {
        let mut table = self.command.lock().expect("Command table lock poisoned");
        let entry = table.by_id.remove(device)?;
        table
            .by_addr
            .remove(&(entry.config.address.clone(), entry.config.port));
        Some(entry.config)
    }

    pub fn discard_command_by_addr(&self, address: &str, port: u16) -> Option<Arc<PendingCommandConfig>> {
        let device = {
            let table = self.command.lock().expect("Command table lock poisoned");
            table.by_addr.get(&(address.to_string(), port)).copied()?
        };
        self.discard_command(&device)
    }
}

impl ConnectionDataStore {
    /// Registers pending DATA parameters; the `(device, transient)` pair must
    /// be unused. Multiple entries may share an address.
    pub fn add_data(&self, config: PendingDataConfig, expected: bool) -> NetworkResult<()> {
        let mut table = self.data.lock().expect("Data table lock poisoned");
        let id_key = (config.device.id, config.transient_id);

        if table.by_id.contains_key(&id_key) {
            return Err(NetworkError::Fatal(ErrorType::Duplicate));
        }

        let addr_key = (config.address.clone(), config.port);
        table.by_addr.entry(addr_key).or_insert_with(Vec::new).push(id_key);
        table.by_id.insert(
            id_key,
            Entry {
                config: Arc::new(config),
                created: Instant::now(),
                expected,
            },
        );

        Ok(())
    }

    pub fn data_by_id(
        &self,
        device: &DeviceId,
        transient: TransientConnectionId,
    ) -> Option<Arc<PendingDataConfig>> {
        self.data
            .lock()
            .expect("Data table lock poisoned")
            .by_id
            .get(&(*device, transient))
            .map(|entry| entry.config.clone())
    }

    /// All pending DATA entries registered for an address. The caller
    /// disambiguates by the transient id from the first message.
    pub fn data_by_addr(&self, address: &str, port: u16) -> Vec<Arc<PendingDataConfig>> {
        let table = self.data.lock().expect("Data table lock poisoned");

        table
            .by_addr
            .get(&(address.to_string(), port))
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| table.by_id.get(key))
                    .map(|entry| entry.config.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_data(&self, device: &DeviceId, transient: TransientConnectionId) -> bool {
        self.data
            .lock()
            .expect("Data table lock poisoned")
            .by_id
            .contains_key(&(*device, transient))
    }

    pub fn discard_data(
        &self,
        device: &DeviceId,
        transient: TransientConnectionId,
    ) -> Option<Arc<PendingDataConfig>> {
        let mut table = self.data.lock().expect("Data table lock poisoned");
        let id_key = (*device, transient);
        let entry = table.by_id.remove(&id_key)?;

        let addr_key = (entry.config.address.clone(), entry.config.port);
        if let Some(keys) = table.by_addr.get_mut(&addr_key) {
            keys.retain(|key| *key != id_key);
            if keys.is_empty() {
                table.by_addr.remove(&addr_key);
            }
        }

        Some(entry.config)
    }

    /// Discards every pending DATA entry registered for an address.
    pub fn discard_data_by_addr(&self, address: &str, port: u16) -> Vec<Arc<PendingDataConfig>> {
        let keys: Vec<(DeviceId, TransientConnectionId)> = {
            let table = self.data.lock().expect("Data table lock poisoned");
            table
                .by_addr
                .get(&(address.to_string(), port))
                .cloned()
                .unwrap_or_default()
        };

        keys.iter()
            .filter_map(|(device, transient)| self.discard_data(device, *transient))
            .collect()
    }
}

impl ConnectionDataStore {
    /// Registers pending INIT parameters; both the transient id and the
    /// address must be unused.
    pub fn add_init(&self, config: PendingInitConfig, expected: bool) -> NetworkResult<()> {
        let mut table = self.init.lock().expect("Init table lock poisoned");
        let addr_key = (config.address.clone(), config.port);

        if table.by_id.contains_key(&config.transient_id) || table.by_addr.contains_key(&addr_key) {
            return Err(NetworkError::Fatal(ErrorType::Duplicate));
        }

        let transient = config.transient_id;
        table.by_addr.insert(addr_key, transient);
        table.by_id.insert(
            transient,
            Entry {
                config: Arc::new(config),
                created: Instant::now(),
                expected,
            },
        );

        Ok(())
    }

    pub fn init_by_transient(&self, transient: TransientConnectionId) -> Option<Arc<PendingInitConfig>> {
        self.init
            .lock()
            .expect("Init table lock poisoned")
            .by_id
            .get(&transient)
            .map(|entry| entry.config.clone())
    }

    pub fn init_by_addr(&self, address: &str, port: u16) -> Option<Arc<PendingInitConfig>> {
        let table = self.init.lock().expect("Init table lock poisoned");
        let transient = table.by_addr.get(&(address.to_string(), port))?;
        table.by_id.get(transient).map(|entry| entry.config.clone())
    }

    pub fn has_init(&self, transient: TransientConnectionId) -> bool {
        self.init
            .lock()
            .expect("Init table lock poisoned")
            .by_id
            .contains_key(&transient)
    }

    pub fn discard_init(&self, transient: TransientConnectionId) -> Option<Arc<PendingInitConfig>> {
        let mut table = self.init.lock().expect("Init table lock poisoned");
        let entry = table.by_id.remove(&transient)?;
        table
            .by_addr
            .remove(&(entry.config.address.clone(), entry.config.port));
        Some(entry.config)
    }

    pub fn discard_init_by_addr(&self, address: &str, port: u16) -> Option<Arc<PendingInitConfig>> {
        let transient = {
            let table = self.init.lock().expect("Init table lock poisoned");
            table.by_addr.get(&(address.to_string(), port)).copied()?
        };
        self.discard_init(transient)
    }
}

impl ConnectionDataStore {
    /// Discards entries that outlived their deadline. Outbound-parameter
    /// entries use the discard timeout; expectation entries use the
    /// per-role expected-connection timeouts.
    pub fn sweep_expired(
        &self,
        discard_after: Duration,
        expected_data_after: Duration,
        expected_init_after: Duration,
    ) -> StoreSweep {
        let now = Instant::now();
        let mut sweep = StoreSweep::default();

        {
            let mut table = self.command.lock().expect("Command table lock poisoned");
            let expired: Vec<DeviceId> = table
                .by_id
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.created) >= discard_after)
                .map(|(device, _)| *device)
                .collect();

            for device in expired {
                if let Some(entry) = table.by_id.remove(&device) {
                    table
                        .by_addr
                        .remove(&(entry.config.address.clone(), entry.config.port));
                    sweep.command += 1;
                }
            }
        }

        {
            let mut table = self.data.lock().expect("Data table lock poisoned");
            let expired: Vec<(DeviceId, TransientConnectionId)> = table
                .by_id
                .iter()
                .filter(|(_, entry)| {
                    let deadline = if entry.expected {
                        expected_data_after
                    } else {
                        discard_after
                    };
                    now.duration_since(entry.created) >= deadline
                })
                .map(|(key, _)| *key)
                .collect();

            for id_key in expired {
                if let Some(entry) = table.by_id.remove(&id_key) {
                    let addr_key = (entry.config.address.clone(), entry.config.port);
                    if let Some(keys) = table.by_addr.get_mut(&addr_key) {
                        keys.retain(|key| *key != id_key);
                        if keys.is_empty() {
                            table.by_addr.remove(&addr_key);
                        }
                    }
                    sweep.data += 1;
                }
            }
        }

        {
            let mut table = self.init.lock().expect("Init table lock poisoned");
            let expired: Vec<TransientConnectionId> = table
                .by_id
                .iter()
                .filter(|(_, entry)| {
                    let deadline = if entry.expected {
                        expected_init_after
                    } else {
                        discard_after
                    };
                    now.duration_since(entry.created) >= deadline
                })
                .map(|(transient, _)| *transient)
                .collect();

            for transient in expired {
                if let Some(entry) = table.by_id.remove(&transient) {
                    table
                        .by_addr
                        .remove(&(entry.config.address.clone(), entry.config.port));
                    sweep.init += 1;
                }
            }
        }

        sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::mock_provider;
    use solder::crypto::{CryptoProvider, KeyExchange};
    use solder::device::DeviceIpSettings;

    fn device_record(id_byte: u8) -> DeviceRecord {
        let provider = mock_provider(u64::from(id_byte));
        DeviceRecord {
            id: DeviceId::new([id_byte; 16]),
            peer_role: PeerRole::Client,
            public_key: provider.local_public_key(),
            agreement_private_key: vec![id_byte; 32],
            agreement_public_key: vec![id_byte; 32],
            password: vec![1, 2, 3],
            expected_key_exchange: KeyExchange::Rsa,
            ip_settings: DeviceIpSettings {
                command_address: "127.0.0.1".to_string(),
                command_port: 10,
                data_address: "127.0.0.1".to_string(),
                data_port: 11,
                init_address: "127.0.0.1".to_string(),
                init_port: 12,
            },
        }
    }

    fn command_config(id_byte: u8, port: u16) -> PendingCommandConfig {
        PendingCommandConfig {
            device: device_record(id_byte),
            address: "10.0.0.1".to_string(),
            port,
        }
    }

    fn data_config(id_byte: u8, transient: TransientConnectionId, port: u16) -> PendingDataConfig {
        PendingDataConfig {
            transient_id: transient,
            device: device_record(id_byte),
            key: vec![0u8; 32],
            iv: vec![0u8; 12],
            cipher: SymmetricCipher::Aes,
            mode: CipherMode::Gcm,
            encrypt: true,
            compress: false,
            address: "10.0.0.2".to_string(),
            port,
        }
    }

    fn init_config(transient: TransientConnectionId, port: u16) -> PendingInitConfig {
        PendingInitConfig {
            transient_id: transient,
            init_password: "secret".to_string(),
            remote_peer_role: PeerRole::Server,
            new_peer_id: DeviceId::new([transient as u8; 16]),
            address: "10.0.0.3".to_string(),
            port,
        }
    }

    #[test]
    fn test_command_indexing() {
        let store = ConnectionDataStore::new();
        let config = command_config(1, 100);
        let device = config.device.id;

        store.add_command(config, false).unwrap();

        assert!(store.has_command(&device));
        assert!(store.command_by_device(&device).is_some());
        assert!(store.command_by_addr("10.0.0.1", 100).is_some());
        assert!(store.command_by_addr("10.0.0.1", 101).is_none());

        // Same device id again is a duplicate.
        assert_eq!(
            store.add_command(command_config(1, 200), false),
            Err(NetworkError::Fatal(ErrorType::Duplicate))
        );
        // Same address again is a duplicate too.
        assert_eq!(
            store.add_command(command_config(2, 100), false),
            Err(NetworkError::Fatal(ErrorType::Duplicate))
        );

        let discarded = store.discard_command(&device).unwrap();
        assert_eq!(discarded.port, 100);
        assert!(!store.has_command(&device));
        assert!(store.command_by_addr("10.0.0.1", 100).is_none());
    }

    #[test]
    fn test_data_secondary_key_not_unique() {
        let store = ConnectionDataStore::new();

        store.add_data(data_config(1, 10, 300), false).unwrap();
        store.add_data(data_config(2, 20, 300), false).unwrap();

        let matches = store.data_by_addr("10.0.0.2", 300);
        assert_eq!(matches.len(), 2);

        // Primary key is unique.
        assert_eq!(
            store.add_data(data_config(1, 10, 301), false),
            Err(NetworkError::Fatal(ErrorType::Duplicate))
        );

        let device = DeviceId::new([1; 16]);
        store.discard_data(&device, 10).unwrap();
        assert_eq!(store.data_by_addr("10.0.0.2", 300).len(), 1);
        assert!(!store.has_data(&device, 10));
    }

    #[test]
    fn test_init_indexing() {
        let store = ConnectionDataStore::new();
        store.add_init(init_config(42, 400), true).unwrap();

        assert!(store.has_init(42));
        assert!(store.init_by_transient(42).is_some());
        assert!(store.init_by_addr("10.0.0.3", 400).is_some());
        assert!(store.init_by_addr("10.0.0.4", 400).is_none());

        assert_eq!(
            store.add_init(init_config(42, 500), true),
            Err(NetworkError::Fatal(ErrorType::Duplicate))
        );

        store.discard_init(42).unwrap();
        assert!(store.init_by_transient(42).is_none());
        assert!(store.init_by_addr("10.0.0.3", 400).is_none());
    }

    #[test]
    fn test_sweep_expired() {
        let store = ConnectionDataStore::new();

        store.add_command(command_config(1, 100), false).unwrap();
        store.add_data(data_config(2, 20, 300), true).unwrap();
        store.add_init(init_config(42, 400), true).unwrap();

        // Nothing expires with generous deadlines.
        let sweep = store.sweep_expired(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert_eq!(sweep, StoreSweep::default());

        // Zero deadlines expire everything.
        let sweep = store.sweep_expired(
            Duration::from_secs(0),
            Duration::from_secs(0),
            Duration::from_secs(0),
        );
        assert_eq!(
            sweep,
            StoreSweep {
                command: 1,
                data: 1,
                init: 1
            }
        );

        assert!(!store.has_command(&DeviceId::new([1; 16])));
        assert!(!store.has_data(&DeviceId::new([2; 16]), 20));
        assert!(!store.has_init(42));
    }
}
