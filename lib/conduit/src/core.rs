//! The networking core facade: owns one connection manager per configured
//! endpoint and the three protocol handlers, routes accepted connections to
//! the matching handler by role, arms the timeout sweeps and exposes the
//! instruction surface and callback events to upper layers.

use crate::config::{ManagerConfig, NetworkCoreConfig};
use crate::handlers::command::{CommandEvents, CommandHandler, CommandHandlerConfig};
use crate::handlers::data::{DataEvents, DataHandler, DataHandlerConfig};
use crate::handlers::init::{InitEvents, InitHandler, InitHandlerConfig};
use crate::handlers::NewDeviceParams;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::net::connection::{ConnectionEvents, SharedConnection};
use crate::net::manager::{ConnectionManager, ManagerSettings};
use crate::net::support::{
    CommandId, ConnectionId, ConnectionInitiation, ConnectionManagerId, ConnectionRole, ErrorType,
    NetworkError, NetworkResult, TransientConnectionId,
};
use crate::store::{ConnectionDataStore, PendingCommandConfig, PendingDataConfig, PendingInitConfig};
use crate::workers::WorkerPool;
use solder::compress::Compressor;
use solder::crypto::{CipherMode, CryptoProvider, SymmetricCipher};
use solder::device::{DeviceDirectory, DeviceId, PeerRole};
use solder::logging;
use solder::session::SessionAccess;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Callback surface of the networking core. All methods default to no-ops so
/// consumers implement only what they need.
pub trait NetworkCoreEvents: Send + Sync {
    fn on_init_completed(
        &self,
        _conn: ConnectionId,
        _device: DeviceId,
        _transient: TransientConnectionId,
        _params: &NewDeviceParams,
    ) {
    }

    fn on_init_failed(&self, _conn: ConnectionId, _transient: TransientConnectionId) {}

    fn on_command_established(&self, _device: DeviceId, _conn: ConnectionId) {}

    fn on_command_failed(&self, _device: DeviceId, _conn: ConnectionId) {}

    fn on_command_message(&self, _device: DeviceId, _command: CommandId, _plaintext: Vec<u8>) {}

    fn on_command_closed(&self, _device: DeviceId, _conn: ConnectionId) {}

    fn on_command_response(&self, _device: DeviceId, _command: CommandId, _payload: Vec<u8>) {}

    fn on_command_response_failed(&self, _device: DeviceId, _command: CommandId) {}

    fn on_data_established(
        &self,
        _device: DeviceId,
        _conn: ConnectionId,
        _transient: TransientConnectionId,
    ) {
    }

    fn on_data_failed(
        &self,
        _device: DeviceId,
        _conn: ConnectionId,
        _transient: TransientConnectionId,
    ) {
    }

    fn on_data_message(&self, _device: DeviceId, _conn: ConnectionId, _plaintext: Vec<u8>) {}

    fn on_data_closed(&self, _device: DeviceId, _conn: ConnectionId) {}

    fn on_connection_initiation_failed(
        &self,
        _manager: ConnectionManagerId,
        _addr: SocketAddr,
        _kind: io::ErrorKind,
    ) {
    }
}

/// Instruction: bootstrap a new peer by dialing its INIT endpoint.
pub struct OpenInitConnection {
    pub manager: Option<ConnectionManagerId>,
    pub address: String,
    pub port: u16,
    pub transient_id: TransientConnectionId,
    pub init_password: String,
    pub remote_peer_role: PeerRole,
    pub new_peer_id: DeviceId,
}

/// Instruction: await an inbound INIT connection from a peer.
pub struct ExpectInitConnection {
    pub address: String,
    pub transient_id: TransientConnectionId,
    pub init_password: String,
    pub remote_peer_role: PeerRole,
    pub new_peer_id: DeviceId,
}

/// Instruction: open a bulk-data channel with pre-negotiated parameters.
pub struct OpenDataConnection {
    pub manager: Option<ConnectionManagerId>,
    pub device: DeviceId,
    pub transient_id: TransientConnectionId,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub cipher: SymmetricCipher,
    pub mode: CipherMode,
    pub encrypt: bool,
    pub compress: bool,
}

/// Instruction: await an inbound bulk-data channel.
pub struct ExpectDataConnection {
    pub device: DeviceId,
    pub transient_id: TransientConnectionId,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub cipher: SymmetricCipher,
    pub mode: CipherMode,
    pub encrypt: bool,
    pub compress: bool,
}

/// Instructions accepted by the asynchronous `submit` entry point.
pub enum Instruction {
    OpenInitConnection(OpenInitConnection),
    ExpectInitConnection(ExpectInitConnection),
    OpenCommandConnection(DeviceId),
    OpenDataConnection(OpenDataConnection),
    ExpectDataConnection(ExpectDataConnection),
    SendInstruction(DeviceId, Vec<u8>),
    SendInstructionResponse(DeviceId, CommandId, Vec<u8>),
    SendData(DeviceId, ConnectionId, Vec<u8>),
    CloseCommandConnection(DeviceId),
    CloseDataConnection(DeviceId, ConnectionId),
}

struct ManagerEntry {
    id: ConnectionManagerId,
    role: ConnectionRole,
    manager: ConnectionManager,
}

struct CoreShared {
    config: NetworkCoreConfig,
    events: Arc<dyn NetworkCoreEvents>,
    directory: Arc<dyn DeviceDirectory>,
    store: Arc<ConnectionDataStore>,
    init: InitHandler,
    command: CommandHandler,
    data: DataHandler,
    managers: Vec<ManagerEntry>,
    metrics: Arc<Metrics>,
    workers: WorkerPool,
    transient_ids: AtomicU32,
    provider: Arc<dyn CryptoProvider>,
    stop: AtomicBool,
    log: logging::Logger,
}

/// Routes transport and handler events: connection completions land here and
/// are resolved by connection role; handler events are forwarded to the
/// consumer-facing callback surface.
struct Relay {
    core: RwLock<Weak<CoreShared>>,
}

impl Relay {
    fn core(&self) -> Option<Arc<CoreShared>> {
        self.core.read().expect("Relay lock poisoned").upgrade()
    }
}

impl ConnectionEvents for Relay {
    fn on_connect(&self, conn: &SharedConnection) {
        if let Some(core) = self.core() {
            match conn.initiation() {
                ConnectionInitiation::Local => Metrics::bump(&core.metrics.connections_initiated),
                ConnectionInitiation::Remote => Metrics::bump(&core.metrics.connections_received),
            }

            core.route_connection(conn);
        }
    }

    fn on_disconnect(&self, conn: &SharedConnection) {
        if let Some(core) = self.core() {
            match conn.role() {
                ConnectionRole::Init => core.init.handle_disconnect(conn),
                ConnectionRole::Command => core.command.handle_disconnect(conn),
                ConnectionRole::Data => core.data.handle_disconnect(conn),
            }
        }
    }

    fn on_data_received(&self, conn: &SharedConnection, data: Vec<u8>, remaining: u64) {
        if let Some(core) = self.core() {
            match conn.role() {
                ConnectionRole::Init => core.init.handle_data(conn, data, remaining),
                ConnectionRole::Command => core.command.handle_data(conn, data, remaining),
                ConnectionRole::Data => core.data.handle_data(conn, data, remaining),
            }
        }
    }

    fn on_write_result(&self, conn: &SharedConnection, sent: bool) {
        if let Some(core) = self.core() {
            match conn.role() {
                ConnectionRole::Init => core.init.handle_write_result(conn, sent),
                ConnectionRole::Command => core.command.handle_write_result(conn, sent),
                ConnectionRole::Data => core.data.handle_write_result(conn, sent),
            }
        }
    }

    fn on_can_be_destroyed(&self, _conn: &SharedConnection, _initiation: ConnectionInitiation) {
        // The owning manager observes the closed connection and reaps it.
    }

    fn on_initiation_failed(&self, manager: ConnectionManagerId, addr: SocketAddr, kind: io::ErrorKind) {
        if let Some(core) = self.core() {
            core.dial_failed(manager, addr, kind);
        }
    }
}

impl InitEvents for Relay {
    fn on_setup_completed(
        &self,
        conn: ConnectionId,
        device: DeviceId,
        transient: TransientConnectionId,
        params: &NewDeviceParams,
    ) {
        if let Some(core) = self.core() {
            core.events.on_init_completed(conn, device, transient, params);
        }
    }

    fn on_setup_failed(&self, conn: ConnectionId, transient: TransientConnectionId) {
        if let Some(core) = self.core() {
            core.events.on_init_failed(conn, transient);
        }
    }
}

impl CommandEvents for Relay {
    fn on_connection_established(&self, device: DeviceId, conn: ConnectionId) {
        if let Some(core) = self.core() {
            core.events.on_command_established(device, conn);
        }
    }

    fn on_connection_failed(&self, device: DeviceId, conn: ConnectionId) {
        if let Some(core) = self.core() {
            core.events.on_command_failed(device, conn);
        }
    }

    fn on_message_received(&self, device: DeviceId, command: CommandId, plaintext: Vec<u8>) {
        if let Some(core) = self.core() {
            core.events.on_command_message(device, command, plaintext);
        }
    }

    fn on_connection_closed(&self, device: DeviceId, conn: ConnectionId) {
        if let Some(core) = self.core() {
            core.events.on_command_closed(device, conn);
        }
    }

    fn on_instruction_response(&self, device: DeviceId, command: CommandId, payload: Vec<u8>) {
        if let Some(core) = self.core() {
            core.events.on_command_response(device, command, payload);
        }
    }

    fn on_instruction_failed(&self, device: DeviceId, command: CommandId) {
        if let Some(core) = self.core() {
            core.events.on_command_response_failed(device, command);
        }
    }
}

impl DataEvents for Relay {
    fn on_connection_established(
        &self,
        device: DeviceId,
        conn: ConnectionId,
        transient: TransientConnectionId,
    ) {
        if let Some(core) = self.core() {
            core.events.on_data_established(device, conn, transient);
        }
    }

    fn on_connection_failed(
        &self,
        device: DeviceId,
        conn: ConnectionId,
        transient: TransientConnectionId,
    ) {
        if let Some(core) = self.core() {
            core.events.on_data_failed(device, conn, transient);
        }
    }

    fn on_data_received(&self, device: DeviceId, conn: ConnectionId, plaintext: Vec<u8>) {
        if let Some(core) = self.core() {
            core.events.on_data_message(device, conn, plaintext);
        }
    }

    fn on_connection_closed(&self, device: DeviceId, conn: ConnectionId) {
        if let Some(core) = self.core() {
            core.events.on_data_closed(device, conn);
        }
    }
}

impl CoreShared {
    fn manager_entry(
        &self,
        role: ConnectionRole,
        id: Option<ConnectionManagerId>,
    ) -> Option<&ManagerEntry> {
        match id {
            Some(id) => self.managers.iter().find(|entry| entry.id == id && entry.role == role),
            None => self.managers.iter().find(|entry| entry.role == role),
        }
    }

    fn manager_role(&self, id: ConnectionManagerId) -> Option<ConnectionRole> {
        self.managers
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.role)
    }

    /// Hands a freshly established connection to its protocol handler,
    /// matching outbound connections to their pending parameters by address.
    fn route_connection(&self, conn: &SharedConnection) {
        let addr = conn.remote_addr();
        let ip = addr.ip().to_string();
        let port = addr.port();

        match conn.initiation() {
            ConnectionInitiation::Local => match conn.role() {
                ConnectionRole::Command => {
                    match self.store.discard_command_by_addr(&ip, port) {
                        Some(config) => self.command.manage_local(conn, config.device.clone()),
                        None => self.drop_unmatched(conn),
                    }
                }
                ConnectionRole::Data => {
                    let config = self
                        .store
                        .data_by_addr(&ip, port)
                        .into_iter()
                        .next()
                        .and_then(|config| {
                            self.store.discard_data(&config.device.id, config.transient_id)
                        });

                    match config {
                        Some(config) => self.data.manage_local(conn, config),
                        None => self.drop_unmatched(conn),
                    }
                }
                ConnectionRole::Init => match self.store.discard_init_by_addr(&ip, port) {
                    Some(config) => self.init.manage_local(conn, config),
                    None => self.drop_unmatched(conn),
                },
            },
            ConnectionInitiation::Remote => match conn.role() {
                ConnectionRole::Command => self.command.manage_remote(conn),
                ConnectionRole::Data => self.data.manage_remote(conn),
                ConnectionRole::Init => self.init.manage_remote(conn),
            },
        }
    }

    fn drop_unmatched(&self, conn: &SharedConnection) {
        logging::warn!(self.log, "no pending parameters for outbound connection";
                       "connection_id" => conn.id(),
                       "role" => %conn.role(),
                       "remote" => %conn.remote_addr());
        conn.fail(ErrorType::NotFound);
    }

    /// A dial failed before any connection existed: discard the pending
    /// parameters registered for the target address and surface the error.
    fn dial_failed(&self, manager: ConnectionManagerId, addr: SocketAddr, kind: io::ErrorKind) {
        let ip = addr.ip().to_string();
        let port = addr.port();

        match self.manager_role(manager) {
            Some(ConnectionRole::Command) => {
                self.store.discard_command_by_addr(&ip, port);
            }
            Some(ConnectionRole::Data) => {
                self.store.discard_data_by_addr(&ip, port);
            }
            Some(ConnectionRole::Init) => {
                self.store.discard_init_by_addr(&ip, port);
            }
            None => {}
        }

        logging::debug!(self.log, "connection initiation failed";
                        "manager" => manager,
                        "remote" => %addr,
                        "error" => ?kind);

        self.events.on_connection_initiation_failed(manager, addr, kind);
    }

    fn open_init_connection(&self, instruction: OpenInitConnection) -> NetworkResult<()> {
        let entry = self
            .manager_entry(ConnectionRole::Init, instruction.manager)
            .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

        self.store.add_init(
            PendingInitConfig {
                transient_id: instruction.transient_id,
                init_password: instruction.init_password,
                remote_peer_role: instruction.remote_peer_role,
                new_peer_id: instruction.new_peer_id,
                address: instruction.address.clone(),
                port: instruction.port,
            },
            false,
        )?;

        let addr: SocketAddr = format!("{}:{}", instruction.address, instruction.port).parse()?;

        if let Err(err) = entry.manager.dial(addr) {
            self.store.discard_init(instruction.transient_id);
            return Err(err);
        }

        Ok(())
    }

    fn expect_init_connection(&self, instruction: ExpectInitConnection) -> NetworkResult<()> {
        self.store.add_init(
            PendingInitConfig {
                transient_id: instruction.transient_id,
                init_password: instruction.init_password,
                remote_peer_role: instruction.remote_peer_role,
                new_peer_id: instruction.new_peer_id,
                address: instruction.address,
                port: 0,
            },
            true,
        )
    }

    fn open_command_connection(&self, device: DeviceId) -> NetworkResult<()> {
        let record = self
            .directory
            .lookup_device(&device)
            .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

        let entry = self
            .manager_entry(ConnectionRole::Command, None)
            .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

        let address = record.ip_settings.command_address.clone();
        let port = record.ip_settings.command_port;

        self.store.add_command(
            PendingCommandConfig {
                device: record,
                address: address.clone(),
                port,
            },
            false,
        )?;

        let addr: SocketAddr = format!("{}:{}", address, port).parse()?;

        if let Err(err) = entry.manager.dial(addr) {
            self.store.discard_command(&device);
            return Err(err);
        }

        Ok(())
    }

    fn open_data_connection(&self, instruction: OpenDataConnection) -> NetworkResult<()> {
        let record = self
            .directory
            .lookup_device(&instruction.device)
            .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

        let entry = self
            .manager_entry(ConnectionRole::Data, instruction.manager)
            .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

        let address = record.ip_settings.data_address.clone();
        let port = record.ip_settings.data_port;
        let device = instruction.device;
        let transient = instruction.transient_id;

        self.store.add_data(
            PendingDataConfig {
                transient_id: instruction.transient_id,
                device: record,
                key: instruction.key,
                iv: instruction.iv,
                cipher: instruction.cipher,
                mode: instruction.mode,
                encrypt: instruction.encrypt,
                compress: instruction.compress,
                address: address.clone(),
                port,
            },
            false,
        )?;

        let addr: SocketAddr = format!("{}:{}", address, port).parse()?;

        if let Err(err) = entry.manager.dial(addr) {
            self.store.discard_data(&device, transient);
            return Err(err);
        }

        Ok(())
    }

    fn expect_data_connection(&self, instruction: ExpectDataConnection) -> NetworkResult<()> {
        let record = self
            .directory
            .lookup_device(&instruction.device)
            .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

        let address = record.ip_settings.data_address.clone();
        let port = record.ip_settings.data_port;

        self.store.add_data(
            PendingDataConfig {
                transient_id: instruction.transient_id,
                device: record,
                key: instruction.key,
                iv: instruction.iv,
                cipher: instruction.cipher,
                mode: instruction.mode,
                encrypt: instruction.encrypt,
                compress: instruction.compress,
                address,
                port,
            },
            true,
        )
    }

    fn process_instruction(&self, instruction: Instruction) {
        if self.stop.load(Ordering::Acquire) {
            return;
        }

        Metrics::bump(&self.metrics.instructions_processed);

        let result = match instruction {
            Instruction::OpenInitConnection(params) => self.open_init_connection(params),
            Instruction::ExpectInitConnection(params) => self.expect_init_connection(params),
            Instruction::OpenCommandConnection(device) => self.open_command_connection(device),
            Instruction::OpenDataConnection(params) => self.open_data_connection(params),
            Instruction::ExpectDataConnection(params) => self.expect_data_connection(params),
            Instruction::SendInstruction(device, payload) => self
                .command
                .send_instruction(&device, &payload)
                .map(|_| ()),
            Instruction::SendInstructionResponse(device, command, payload) => {
                self.command.send_response(&device, command, &payload)
            }
            Instruction::SendData(device, conn, payload) => {
                self.data.send_data(&device, conn, &payload)
            }
            Instruction::CloseCommandConnection(device) => self.command.close_connection(&device),
            Instruction::CloseDataConnection(device, conn) => {
                self.data.close_connection(&device, conn)
            }
        };

        if let Err(err) = result {
            logging::debug!(self.log, "instruction failed"; "error" => %err);
        }
    }

    fn housekeeping_pass(&self) {
        let config = &self.config;

        self.init
            .sweep_pending(Duration::from_secs(config.init_connection_setup_timeout));
        self.command
            .sweep_pending(Duration::from_secs(config.command_connection_setup_timeout));
        self.data
            .sweep_pending(Duration::from_secs(config.data_connection_setup_timeout));

        self.command
            .sweep_idle(Duration::from_secs(config.command_connection_inactivity_timeout));
        self.data
            .sweep_idle(Duration::from_secs(config.data_connection_inactivity_timeout));

        self.command
            .sweep_instructions(Duration::from_secs(config.pending_instruction_discard_timeout));

        let swept = self.store.sweep_expired(
            Duration::from_secs(config.pending_connection_data_discard_timeout),
            Duration::from_secs(config.expected_data_connection_timeout),
            Duration::from_secs(config.expected_init_connection_timeout),
        );

        if swept.command + swept.data + swept.init > 0 {
            logging::debug!(self.log, "discarded expired pending connection data";
                            "command" => swept.command,
                            "data" => swept.data,
                            "init" => swept.init);
        }
    }
}

/// The secure peer-to-peer networking core.
pub struct NetworkCore {
    shared: Arc<CoreShared>,
    housekeeping: Mutex<Option<thread::JoinHandle<()>>>,
}

impl NetworkCore {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: NetworkCoreConfig,
        provider: Arc<dyn CryptoProvider>,
        compressor: Arc<dyn Compressor>,
        directory: Arc<dyn DeviceDirectory>,
        sessions: Arc<dyn SessionAccess>,
        events: Arc<dyn NetworkCoreEvents>,
        log: L,
    ) -> NetworkResult<NetworkCore> {
        config.validate()?;

        let log = logging::child(log);
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(ConnectionDataStore::new());

        let relay = Arc::new(Relay {
            core: RwLock::new(Weak::new()),
        });

        let init = {
            let store = store.clone();
            InitHandler::new(
                InitHandlerConfig {
                    request_signature_size: config.request_signature_size,
                    key_exchange: config.key_exchange_default,
                    default_random_password_size: config.default_random_password_size,
                    max_random_password_attempts: config.max_random_password_attempts,
                    pbkdf: config.pbkdf_variant,
                    pbkdf_iterations: config.pbkdf_iterations,
                    pbkdf_salt_size: config.pbkdf_salt_size,
                    cipher: config.default_cipher,
                    mode: config.default_cipher_mode,
                    local_peer_id: config.local_peer.device_id,
                    local_peer_role: config.local_peer.peer_role,
                    local_ip_settings: config.local_peer.ip_settings.clone(),
                    max_message_size: config.max_data_size,
                },
                provider.clone(),
                directory.clone(),
                relay.clone(),
                Box::new(move |transient| store.discard_init(transient)),
                metrics.clone(),
                &log,
            )?
        };

        let command = CommandHandler::new(
            CommandHandlerConfig {
                request_signature_size: config.request_signature_size,
                local_peer_id: config.local_peer.device_id,
                cipher: config.default_cipher,
                mode: config.default_cipher_mode,
                max_message_size: config.max_data_size,
            },
            provider.clone(),
            directory.clone(),
            sessions,
            relay.clone(),
            metrics.clone(),
            &log,
        )?;

        let data = {
            let store = store.clone();
            DataHandler::new(
                DataHandlerConfig {
                    request_signature_size: config.request_signature_size,
                    local_peer_id: config.local_peer.device_id,
                    max_data_size: config.max_data_size,
                    compression_acceleration: config.compression_acceleration_level,
                },
                provider.clone(),
                compressor,
                relay.clone(),
                Box::new(move |device, transient| store.discard_data(device, transient)),
                metrics.clone(),
                &log,
            )?
        };

        let connection_ids = Arc::new(AtomicU64::new(1));
        let mut managers = Vec::with_capacity(config.managers.len());

        for (index, manager_config) in config.managers.iter().enumerate() {
            let id = (index + 1) as ConnectionManagerId;
            let manager = Self::build_manager(
                id,
                manager_config,
                &config,
                relay.clone(),
                connection_ids.clone(),
                &log,
            )?;

            managers.push(ManagerEntry {
                id,
                role: manager_config.role,
                manager,
            });
        }

        let workers = WorkerPool::new(config.instructions_thread_pool_size, &log);

        let shared = Arc::new(CoreShared {
            config,
            events,
            directory,
            store,
            init,
            command,
            data,
            managers,
            metrics,
            workers,
            transient_ids: AtomicU32::new(1),
            provider,
            stop: AtomicBool::new(false),
            log,
        });

        *relay.core.write().expect("Relay lock poisoned") = Arc::downgrade(&shared);

        Ok(NetworkCore {
            shared,
            housekeeping: Mutex::new(None),
        })
    }

    fn build_manager(
        id: ConnectionManagerId,
        manager_config: &ManagerConfig,
        config: &NetworkCoreConfig,
        relay: Arc<Relay>,
        connection_ids: Arc<AtomicU64>,
        log: &logging::Logger,
    ) -> NetworkResult<ConnectionManager> {
        ConnectionManager::new(
            ManagerSettings {
                id,
                role: manager_config.role,
                local_peer_role: config.local_peer.peer_role,
                bind_addr: manager_config.bind_addr.clone(),
                bind_port: manager_config.bind_port,
                max_active_connections: manager_config.max_active_connections,
                request_timeout_secs: manager_config.request_timeout,
                read_buffer_size: manager_config.default_read_buffer_size,
                write_buffer_size: manager_config.write_buffer_size,
            },
            relay,
            connection_ids,
            log,
        )
    }

    /// Starts all managers and the housekeeping sweeps.
    pub fn start(&self) -> NetworkResult<()> {
        for entry in &self.shared.managers {
            entry.manager.start()?;
        }

        let mut housekeeping = self.housekeeping.lock().expect("Housekeeping lock poisoned");

        if housekeeping.is_none() {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name("conduit-housekeeping".to_string())
                .spawn(move || {
                    while !shared.stop.load(Ordering::Acquire) {
                        thread::sleep(HOUSEKEEPING_INTERVAL);

                        if shared.stop.load(Ordering::Acquire) {
                            break;
                        }

                        shared.housekeeping_pass();
                    }
                })
                .map_err(|err| NetworkError::Fatal(ErrorType::Io(err.kind())))?;

            *housekeeping = Some(handle);
        }

        logging::info!(self.shared.log, "network core started";
                       "managers" => self.shared.managers.len());

        Ok(())
    }

    /// Stops the core: managers first, then the handlers and the worker
    /// pool. Pending setups surface their failure callbacks.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);

        if let Some(handle) = self
            .housekeeping
            .lock()
            .expect("Housekeeping lock poisoned")
            .take()
        {
            drop(handle.join());
        }

        for entry in &self.shared.managers {
            entry.manager.stop();
        }

        self.shared.init.clear();
        self.shared.command.clear();
        self.shared.data.clear();
        self.shared.workers.stop();

        logging::info!(self.shared.log, "network core stopped");
    }

    /// Enqueues an instruction for asynchronous processing.
    pub fn submit(&self, instruction: Instruction) {
        let shared = self.shared.clone();
        self.shared
            .workers
            .execute(move || shared.process_instruction(instruction));
    }

    pub fn open_init_connection(&self, instruction: OpenInitConnection) -> NetworkResult<()> {
        Metrics::bump(&self.shared.metrics.instructions_processed);
        self.shared.open_init_connection(instruction)
    }

    pub fn expect_init_connection(&self, instruction: ExpectInitConnection) -> NetworkResult<()> {
        Metrics::bump(&self.shared.metrics.instructions_processed);
        self.shared.expect_init_connection(instruction)
    }

    pub fn open_command_connection(&self, device: DeviceId) -> NetworkResult<()> {
        Metrics::bump(&self.shared.metrics.instructions_processed);
        self.shared.open_command_connection(device)
    }

    pub fn open_data_connection(&self, instruction: OpenDataConnection) -> NetworkResult<()> {
        Metrics::bump(&self.shared.metrics.instructions_processed);
        self.shared.open_data_connection(instruction)
    }

    pub fn expect_data_connection(&self, instruction: ExpectDataConnection) -> NetworkResult<()> {
        Metrics::bump(&self.shared.metrics.instructions_processed);
        self.shared.expect_data_connection(instruction)
    }

    /// Sends an instruction on an established COMMAND connection. The
    /// response arrives through `on_command_response`.
    pub fn send_instruction(&self, device: &DeviceId, payload: &[u8]) -> NetworkResult<CommandId> {
        Metrics::bump(&self.shared.metrics.instructions_processed);
        self.shared.command.send_instruction(device, payload)
    }

    /// Answers an instruction previously received through
    /// `on_command_message`.
    pub fn send_instruction_response(
        &self,
        device: &DeviceId,
        command: CommandId,
        payload: &[u8],
    ) -> NetworkResult<()> {
        self.shared.command.send_response(device, command, payload)
    }

    /// Sends a payload on an established DATA connection. Bulk transfer is
    /// offered on DATA connections only.
    pub fn send_data(
        &self,
        device: &DeviceId,
        conn: ConnectionId,
        payload: &[u8],
    ) -> NetworkResult<()> {
        self.shared.data.send_data(device, conn, payload)
    }

    pub fn close_command_connection(&self, device: &DeviceId) -> NetworkResult<()> {
        self.shared.command.close_connection(device)
    }

    pub fn close_data_connection(&self, device: &DeviceId, conn: ConnectionId) -> NetworkResult<()> {
        self.shared.data.close_connection(device, conn)
    }

    /// Allocates a transient id for a new INIT/DATA correlation.
    pub fn next_transient_id(&self) -> TransientConnectionId {
        self.shared.transient_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Generates a fresh device id for a peer being bootstrapped.
    pub fn generate_device_id(&self) -> DeviceId {
        let mut raw = [0u8; 16];
        self.shared.provider.random_bytes(&mut raw);
        DeviceId::new(raw)
    }

    /// The bound address of the first manager with the given role.
    pub fn manager_addr(&self, role: ConnectionRole) -> Option<SocketAddr> {
        self.shared
            .manager_entry(role, None)
            .map(|entry| entry.manager.local_addr())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for NetworkCore {
    fn drop(&mut self) {
        if !self.shared.stop.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MemoryDirectory, MemorySessions, MockCompressor, MockCryptoProvider};
    use solder::crypto::KeyExchange;
    use solder::device::{DeviceIpSettings, DeviceRecord};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    #[derive(Debug, Clone)]
    enum CoreEvent {
        InitCompleted(ConnectionId, DeviceId, TransientConnectionId, NewDeviceParams),
        InitFailed(ConnectionId, TransientConnectionId),
        CommandEstablished(DeviceId, ConnectionId),
        CommandFailed(DeviceId, ConnectionId),
        CommandMessage(DeviceId, CommandId, Vec<u8>),
        CommandClosed(DeviceId, ConnectionId),
        CommandResponse(DeviceId, CommandId, Vec<u8>),
        DataEstablished(DeviceId, ConnectionId, TransientConnectionId),
        DataFailed(DeviceId, ConnectionId, TransientConnectionId),
        DataMessage(DeviceId, ConnectionId, Vec<u8>),
        DataClosed(DeviceId, ConnectionId),
        InitiationFailed(SocketAddr),
    }

    struct CoreRecorder {
        events: Mutex<Vec<CoreEvent>>,
    }

    impl CoreRecorder {
        fn new() -> CoreRecorder {
            CoreRecorder {
                events: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, event: CoreEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn wait_for<F: Fn(&[CoreEvent]) -> bool>(&self, pred: F) -> bool {
            let deadline = std::time::Instant::now() + WAIT;

            loop {
                if pred(&self.events.lock().unwrap()) {
                    return true;
                }

                if std::time::Instant::now() >= deadline {
                    return false;
                }

                thread::sleep(Duration::from_millis(10));
            }
        }

        fn find<T, F: Fn(&CoreEvent) -> Option<T>>(&self, map: F) -> Option<T> {
            self.events.lock().unwrap().iter().filter_map(|event| map(event)).next()
        }

        fn contains<F: Fn(&CoreEvent) -> bool>(&self, pred: F) -> bool {
            self.events.lock().unwrap().iter().any(|event| pred(event))
        }
    }

    impl NetworkCoreEvents for CoreRecorder {
        fn on_init_completed(
            &self,
            conn: ConnectionId,
            device: DeviceId,
            transient: TransientConnectionId,
            params: &NewDeviceParams,
        ) {
            self.record(CoreEvent::InitCompleted(conn, device, transient, params.clone()));
        }

        fn on_init_failed(&self, conn: ConnectionId, transient: TransientConnectionId) {
            self.record(CoreEvent::InitFailed(conn, transient));
        }

        fn on_command_established(&self, device: DeviceId, conn: ConnectionId) {
            self.record(CoreEvent::CommandEstablished(device, conn));
        }

        fn on_command_failed(&self, device: DeviceId, conn: ConnectionId) {
            self.record(CoreEvent::CommandFailed(device, conn));
        }

        fn on_command_message(&self, device: DeviceId, command: CommandId, plaintext: Vec<u8>) {
            self.record(CoreEvent::CommandMessage(device, command, plaintext));
        }

        fn on_command_closed(&self, device: DeviceId, conn: ConnectionId) {
            self.record(CoreEvent::CommandClosed(device, conn));
        }

        fn on_command_response(&self, device: DeviceId, command: CommandId, payload: Vec<u8>) {
            self.record(CoreEvent::CommandResponse(device, command, payload));
        }

        fn on_data_established(
            &self,
            device: DeviceId,
            conn: ConnectionId,
            transient: TransientConnectionId,
        ) {
            self.record(CoreEvent::DataEstablished(device, conn, transient));
        }

        fn on_data_failed(
            &self,
            device: DeviceId,
            conn: ConnectionId,
            transient: TransientConnectionId,
        ) {
            self.record(CoreEvent::DataFailed(device, conn, transient));
        }

        fn on_data_message(&self, device: DeviceId, conn: ConnectionId, plaintext: Vec<u8>) {
            self.record(CoreEvent::DataMessage(device, conn, plaintext));
        }

        fn on_data_closed(&self, device: DeviceId, conn: ConnectionId) {
            self.record(CoreEvent::DataClosed(device, conn));
        }

        fn on_connection_initiation_failed(
            &self,
            _manager: ConnectionManagerId,
            addr: SocketAddr,
            _kind: io::ErrorKind,
        ) {
            self.record(CoreEvent::InitiationFailed(addr));
        }
    }

    struct TestNode {
        core: NetworkCore,
        recorder: Arc<CoreRecorder>,
        directory: Arc<MemoryDirectory>,
        sessions: Arc<MemorySessions>,
        provider: Arc<MockCryptoProvider>,
        device_id: DeviceId,
        agreement_key: Vec<u8>,
    }

    fn node(identity: u64, peer_role: PeerRole) -> TestNode {
        let device_id = DeviceId::new([identity as u8; 16]);
        let provider = Arc::new(MockCryptoProvider::new(identity));
        let directory = Arc::new(MemoryDirectory::new());
        let sessions = Arc::new(MemorySessions::new());
        let recorder = Arc::new(CoreRecorder::new());

        let manager = |role: &str| -> ManagerConfig {
            serdeconv::from_toml_str(&format!(
                r#"
role = "{}"
bind_addr = "127.0.0.1"
bind_port = 0
"#,
                role
            ))
            .unwrap()
        };

        let config = NetworkCoreConfig {
            local_peer: crate::config::LocalPeerConfig {
                device_id,
                peer_role,
                ip_settings: DeviceIpSettings {
                    command_address: "127.0.0.1".to_string(),
                    command_port: 0,
                    data_address: "127.0.0.1".to_string(),
                    data_port: 0,
                    init_address: "127.0.0.1".to_string(),
                    init_port: 0,
                },
            },
            network_thread_pool_size: 4,
            instructions_thread_pool_size: 2,
            command_connection_setup_timeout: 30,
            data_connection_setup_timeout: 30,
            init_connection_setup_timeout: 30,
            command_connection_inactivity_timeout: 300,
            data_connection_inactivity_timeout: 300,
            pending_connection_data_discard_timeout: 300,
            expected_data_connection_timeout: 300,
            expected_init_connection_timeout: 300,
            pending_instruction_discard_timeout: 300,
            request_signature_size: 32,
            key_exchange_default: KeyExchange::Rsa,
            default_random_password_size: 24,
            max_random_password_attempts: 5,
            compression_acceleration_level: 1,
            max_data_size: 4096,
            pbkdf_variant: solder::crypto::PbkdfVariant::Sha256,
            pbkdf_iterations: 10_000,
            pbkdf_salt_size: 16,
            default_cipher: SymmetricCipher::Aes,
            default_cipher_mode: CipherMode::Gcm,
            managers: vec![manager("command"), manager("data"), manager("init")],
        };

        let core = NetworkCore::new(
            config,
            provider.clone(),
            Arc::new(MockCompressor),
            directory.clone(),
            sessions.clone(),
            recorder.clone(),
            None,
        )
        .unwrap();
        core.start().unwrap();

        TestNode {
            core,
            recorder,
            directory,
            sessions,
            provider,
            device_id,
            agreement_key: vec![identity as u8 + 100; 32],
        }
    }

    /// Builds the record describing `peer` as stored in `owner`'s directory.
    fn record_of(owner: &TestNode, peer: &TestNode, exchange: KeyExchange) -> DeviceRecord {
        let command = peer.core.manager_addr(ConnectionRole::Command).unwrap();
        let data = peer.core.manager_addr(ConnectionRole::Data).unwrap();
        let init = peer.core.manager_addr(ConnectionRole::Init).unwrap();

        DeviceRecord {
            id: peer.device_id,
            peer_role: PeerRole::Server,
            public_key: peer.provider.identity_key(),
            agreement_private_key: owner.agreement_key.clone(),
            agreement_public_key: peer.agreement_key.clone(),
            password: format!("pw-{}", peer.device_id).into_bytes(),
            expected_key_exchange: exchange,
            ip_settings: DeviceIpSettings {
                command_address: "127.0.0.1".to_string(),
                command_port: command.port(),
                data_address: "127.0.0.1".to_string(),
                data_port: data.port(),
                init_address: "127.0.0.1".to_string(),
                init_port: init.port(),
            },
        }
    }

    /// Wires two nodes so each holds the other's record and accepts the
    /// other's session password.
    fn introduce(a: &TestNode, b: &TestNode, exchange: KeyExchange) {
        a.directory.insert(record_of(a, b, exchange));
        b.directory.insert(record_of(b, a, exchange));

        // The responder authenticates the initiator with the password from
        // its own record of that peer.
        a.sessions
            .expect_password(b.device_id, format!("pw-{}", b.device_id).into_bytes());
        b.sessions
            .expect_password(a.device_id, format!("pw-{}", a.device_id).into_bytes());
    }

    #[test]
    fn test_init_setup_happy_path() {
        let client = node(1, PeerRole::Client);
        let server = node(2, PeerRole::Server);

        let server_init = server.core.manager_addr(ConnectionRole::Init).unwrap();
        let transient = 42;

        server
            .core
            .expect_init_connection(ExpectInitConnection {
                address: "127.0.0.1".to_string(),
                transient_id: transient,
                init_password: "test".to_string(),
                remote_peer_role: PeerRole::Client,
                new_peer_id: server.core.generate_device_id(),
            })
            .unwrap();

        client
            .core
            .open_init_connection(OpenInitConnection {
                manager: None,
                address: "127.0.0.1".to_string(),
                port: server_init.port(),
                transient_id: transient,
                init_password: "test".to_string(),
                remote_peer_role: PeerRole::Server,
                new_peer_id: client.core.generate_device_id(),
            })
            .unwrap();

        assert!(client.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::InitCompleted(_, _, 42, _)))
        }));
        assert!(server.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::InitCompleted(_, _, 42, _)))
        }));

        // Each side reports the other peer's device id.
        let client_view = client
            .recorder
            .find(|event| match event {
                CoreEvent::InitCompleted(_, device, _, params) => {
                    Some((*device, params.clone()))
                }
                _ => None,
            })
            .unwrap();
        let server_view = server
            .recorder
            .find(|event| match event {
                CoreEvent::InitCompleted(_, device, _, params) => {
                    Some((*device, params.clone()))
                }
                _ => None,
            })
            .unwrap();

        assert_eq!(client_view.0, server.device_id);
        assert_eq!(server_view.0, client.device_id);

        // The server peer got a generated password, identical on both sides
        // and registered with both directories.
        assert!(!client_view.1.raw_password.is_empty());
        assert_eq!(client_view.1.raw_password, server_view.1.raw_password);

        let client_auth = client.directory.auth_entries();
        assert_eq!(client_auth.len(), 1);
        assert_eq!(client_auth[0].0, server.device_id);
        assert_eq!(client_auth[0].1.password, client_view.1.raw_password);

        let server_auth = server.directory.auth_entries();
        assert_eq!(server_auth.len(), 1);
        assert_eq!(server_auth[0].0, client.device_id);
        assert_eq!(server_auth[0].1.password, client_view.1.raw_password);

        client.core.stop();
        server.core.stop();
    }

    #[test]
    fn test_init_setup_wrong_password_fails() {
        let client = node(3, PeerRole::Client);
        let server = node(4, PeerRole::Server);

        let server_init = server.core.manager_addr(ConnectionRole::Init).unwrap();

        server
            .core
            .expect_init_connection(ExpectInitConnection {
                address: "127.0.0.1".to_string(),
                transient_id: 9,
                init_password: "right".to_string(),
                remote_peer_role: PeerRole::Client,
                new_peer_id: server.core.generate_device_id(),
            })
            .unwrap();

        client
            .core
            .open_init_connection(OpenInitConnection {
                manager: None,
                address: "127.0.0.1".to_string(),
                port: server_init.port(),
                transient_id: 9,
                init_password: "wrong".to_string(),
                remote_peer_role: PeerRole::Server,
                new_peer_id: client.core.generate_device_id(),
            })
            .unwrap();

        assert!(server.recorder.wait_for(|events| {
            events.iter().any(|event| matches!(event, CoreEvent::InitFailed(_, 9)))
        }));
        assert!(client.recorder.wait_for(|events| {
            events.iter().any(|event| matches!(event, CoreEvent::InitFailed(_, _)))
        }));

        assert!(!client
            .recorder
            .contains(|event| matches!(event, CoreEvent::InitCompleted(..))));
        assert!(!server
            .recorder
            .contains(|event| matches!(event, CoreEvent::InitCompleted(..))));

        client.core.stop();
        server.core.stop();
    }

    #[test]
    fn test_command_connection_rsa_ping_pong() {
        let alice = node(5, PeerRole::Client);
        let bob = node(6, PeerRole::Server);

        introduce(&alice, &bob, KeyExchange::Rsa);

        alice.core.open_command_connection(bob.device_id).unwrap();

        assert!(alice.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::CommandEstablished(..)))
        }));
        assert!(bob.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::CommandEstablished(..)))
        }));

        // A session was opened for the initiator.
        assert_eq!(bob.sessions.opened_sessions().len(), 1);

        // ping: instruction request from alice, answered by bob.
        let command_id = alice.core.send_instruction(&bob.device_id, b"ping").unwrap();

        assert!(bob.recorder.wait_for(|events| {
            events.iter().any(
                |event| matches!(event, CoreEvent::CommandMessage(_, _, payload) if payload == b"ping"),
            )
        }));

        let received = bob
            .recorder
            .find(|event| match event {
                CoreEvent::CommandMessage(device, command, payload) if payload == b"ping" => {
                    Some((*device, *command))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(received.0, alice.device_id);

        bob.core
            .send_instruction_response(&alice.device_id, received.1, b"pong")
            .unwrap();

        assert!(alice.recorder.wait_for(|events| {
            events.iter().any(|event| {
                matches!(event, CoreEvent::CommandResponse(_, id, payload)
                         if *id == command_id && payload == b"pong")
            })
        }));

        alice.core.stop();
        bob.core.stop();
    }

    #[test]
    fn test_command_connection_ecdh() {
        let alice = node(7, PeerRole::Client);
        let bob = node(8, PeerRole::Server);

        introduce(&alice, &bob, KeyExchange::Ecdh);

        alice.core.open_command_connection(bob.device_id).unwrap();

        assert!(alice.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::CommandEstablished(..)))
        }));
        assert!(bob.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::CommandEstablished(..)))
        }));

        alice.core.send_instruction(&bob.device_id, b"over ecdh").unwrap();

        assert!(bob.recorder.wait_for(|events| {
            events.iter().any(
                |event| matches!(event, CoreEvent::CommandMessage(_, _, payload) if payload == b"over ecdh"),
            )
        }));

        alice.core.stop();
        bob.core.stop();
    }

    #[test]
    fn test_command_connection_unknown_device() {
        let alice = node(9, PeerRole::Client);

        let unknown = DeviceId::new([99; 16]);
        assert_eq!(
            alice.core.open_command_connection(unknown),
            Err(NetworkError::Fatal(ErrorType::NotFound))
        );

        alice.core.stop();
    }

    #[test]
    fn test_command_session_refused_fails_connection() {
        let alice = node(10, PeerRole::Client);
        let bob = node(11, PeerRole::Server);

        introduce(&alice, &bob, KeyExchange::Rsa);

        // Bob refuses alice's password.
        bob.sessions.expect_password(alice.device_id, b"something else".to_vec());

        alice.core.open_command_connection(bob.device_id).unwrap();

        assert!(alice.recorder.wait_for(|events| {
            events.iter().any(|event| {
                matches!(event, CoreEvent::CommandFailed(..))
                    || matches!(event, CoreEvent::CommandClosed(..))
            })
        }));

        assert!(!alice
            .recorder
            .contains(|event| matches!(event, CoreEvent::CommandEstablished(..))));
        assert!(!bob
            .recorder
            .contains(|event| matches!(event, CoreEvent::CommandEstablished(..))));

        alice.core.stop();
        bob.core.stop();
    }

    #[test]
    fn test_data_connection_encrypted_compressed_roundtrip() {
        let alice = node(12, PeerRole::Client);
        let bob = node(13, PeerRole::Server);

        introduce(&alice, &bob, KeyExchange::Rsa);

        let transient = alice.core.next_transient_id();
        let key = vec![21u8; 32];
        let iv = vec![22u8; 12];

        bob.core
            .expect_data_connection(ExpectDataConnection {
                device: alice.device_id,
                transient_id: transient,
                key: key.clone(),
                iv: iv.clone(),
                cipher: SymmetricCipher::Aes,
                mode: CipherMode::Gcm,
                encrypt: true,
                compress: true,
            })
            .unwrap();

        alice
            .core
            .open_data_connection(OpenDataConnection {
                manager: None,
                device: bob.device_id,
                transient_id: transient,
                key,
                iv,
                cipher: SymmetricCipher::Aes,
                mode: CipherMode::Gcm,
                encrypt: true,
                compress: true,
            })
            .unwrap();

        assert!(alice.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::DataEstablished(..)))
        }));
        assert!(bob.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::DataEstablished(..)))
        }));

        let alice_conn = alice
            .recorder
            .find(|event| match event {
                CoreEvent::DataEstablished(_, conn, t) if *t == transient => Some(*conn),
                _ => None,
            })
            .unwrap();
        let bob_conn = bob
            .recorder
            .find(|event| match event {
                CoreEvent::DataEstablished(_, conn, t) if *t == transient => Some(*conn),
                _ => None,
            })
            .unwrap();

        // Payload with long runs so the mock compressor shrinks it.
        let payload = vec![7u8; 2048];
        alice.core.send_data(&bob.device_id, alice_conn, &payload).unwrap();

        assert!(bob.recorder.wait_for(|events| {
            events.iter().any(
                |event| matches!(event, CoreEvent::DataMessage(_, _, received) if received == &payload),
            )
        }));

        // And back the other way on the same channel.
        let reply = vec![9u8; 1024];
        bob.core.send_data(&alice.device_id, bob_conn, &reply).unwrap();

        assert!(alice.recorder.wait_for(|events| {
            events.iter().any(
                |event| matches!(event, CoreEvent::DataMessage(_, _, received) if received == &reply),
            )
        }));

        alice.core.stop();
        bob.core.stop();
    }

    #[test]
    fn test_data_oversize_payload_rejected_locally() {
        let alice = node(14, PeerRole::Client);
        let bob = node(15, PeerRole::Server);

        introduce(&alice, &bob, KeyExchange::Rsa);

        let transient = alice.core.next_transient_id();
        let key = vec![1u8; 32];
        let iv = vec![2u8; 12];

        bob.core
            .expect_data_connection(ExpectDataConnection {
                device: alice.device_id,
                transient_id: transient,
                key: key.clone(),
                iv: iv.clone(),
                cipher: SymmetricCipher::Aes,
                mode: CipherMode::Gcm,
                encrypt: true,
                compress: false,
            })
            .unwrap();

        alice
            .core
            .open_data_connection(OpenDataConnection {
                manager: None,
                device: bob.device_id,
                transient_id: transient,
                key,
                iv,
                cipher: SymmetricCipher::Aes,
                mode: CipherMode::Gcm,
                encrypt: true,
                compress: false,
            })
            .unwrap();

        assert!(alice.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::DataEstablished(..)))
        }));

        let conn = alice
            .recorder
            .find(|event| match event {
                CoreEvent::DataEstablished(_, conn, _) => Some(*conn),
                _ => None,
            })
            .unwrap();

        // The configured max_data_size is 4096.
        let oversize = vec![0u8; 5000];
        assert_eq!(
            alice.core.send_data(&bob.device_id, conn, &oversize),
            Err(NetworkError::Fatal(ErrorType::PayloadTooLarge))
        );

        alice.core.stop();
        bob.core.stop();
    }

    #[test]
    fn test_dial_unreachable_reports_initiation_failure() {
        let alice = node(16, PeerRole::Client);

        // A record pointing at a closed port.
        let record = DeviceRecord {
            id: DeviceId::new([77; 16]),
            peer_role: PeerRole::Server,
            public_key: vec![1; 32],
            agreement_private_key: vec![2; 32],
            agreement_public_key: vec![3; 32],
            password: b"pw".to_vec(),
            expected_key_exchange: KeyExchange::Rsa,
            ip_settings: DeviceIpSettings {
                command_address: "127.0.0.1".to_string(),
                command_port: 1,
                data_address: "127.0.0.1".to_string(),
                data_port: 1,
                init_address: "127.0.0.1".to_string(),
                init_port: 1,
            },
        };
        alice.directory.insert(record);

        alice.core.open_command_connection(DeviceId::new([77; 16])).unwrap();

        assert!(alice.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::InitiationFailed(_)))
        }));

        assert!(!alice
            .recorder
            .contains(|event| matches!(event, CoreEvent::CommandEstablished(..))));

        alice.core.stop();
    }

    #[test]
    fn test_metrics_track_activity() {
        let alice = node(17, PeerRole::Client);
        let bob = node(18, PeerRole::Server);

        introduce(&alice, &bob, KeyExchange::Rsa);

        alice.core.open_command_connection(bob.device_id).unwrap();

        assert!(alice.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::CommandEstablished(..)))
        }));

        alice.core.send_instruction(&bob.device_id, b"hello").unwrap();

        assert!(bob.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::CommandMessage(..)))
        }));

        let alice_metrics = alice.core.metrics();
        assert_eq!(alice_metrics.connections_initiated, 1);
        assert_eq!(alice_metrics.setups_completed, 1);
        assert_eq!(alice_metrics.commands_sent, 1);
        assert!(alice_metrics.instructions_processed >= 2);

        let bob_metrics = bob.core.metrics();
        assert_eq!(bob_metrics.connections_received, 1);
        assert_eq!(bob_metrics.setups_completed, 1);
        assert_eq!(bob_metrics.commands_received, 1);

        alice.core.stop();
        bob.core.stop();
    }

    #[test]
    fn test_submit_processes_instructions_asynchronously() {
        let alice = node(19, PeerRole::Client);
        let bob = node(20, PeerRole::Server);

        introduce(&alice, &bob, KeyExchange::Rsa);

        alice.core.submit(Instruction::OpenCommandConnection(bob.device_id));

        assert!(alice.recorder.wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, CoreEvent::CommandEstablished(..)))
        }));

        alice.core.submit(Instruction::SendInstruction(bob.device_id, b"queued".to_vec()));

        assert!(bob.recorder.wait_for(|events| {
            events.iter().any(
                |event| matches!(event, CoreEvent::CommandMessage(_, _, payload) if payload == b"queued"),
            )
        }));

        alice.core.stop();
        bob.core.stop();
    }
}
