//! DATA-role protocol: short-lived bulk channels parameterised at open time
//! by per-connection encryption and compression flags. The two-message
//! handshake is keyed with the instruction-supplied key/IV and signed with
//! the peer's asymmetric key; compression is never applied during setup.

use crate::handlers::packets::{self, DataRequestSecret, DataSetupRequest, DataSetupResponse};
use crate::handlers::MessageAssembler;
use crate::metrics::Metrics;
use crate::net::connection::{Connection, SharedConnection};
use crate::net::support::{
    ConnectionId, ErrorType, NetworkError, NetworkResult, SetupState, TransientConnectionId,
};
use crate::secure::SymmetricCrypto;
use crate::store::PendingDataConfig;
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use solder::compress::Compressor;
use solder::crypto::CryptoProvider;
use solder::device::DeviceId;
use solder::logging;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Width of the uncompressed-size suffix appended to compressed payloads.
const SIZE_SUFFIX: usize = 8;

/// Upward events of the DATA handler.
pub trait DataEvents: Send + Sync {
    fn on_connection_established(
        &self,
        device: DeviceId,
        conn: ConnectionId,
        transient: TransientConnectionId,
    );
    fn on_connection_failed(
        &self,
        device: DeviceId,
        conn: ConnectionId,
        transient: TransientConnectionId,
    );
    fn on_data_received(&self, device: DeviceId, conn: ConnectionId, plaintext: Vec<u8>);
    fn on_connection_closed(&self, device: DeviceId, conn: ConnectionId);
}

#[derive(Clone)]
pub struct DataHandlerConfig {
    pub request_signature_size: usize,
    pub local_peer_id: DeviceId,
    pub max_data_size: usize,
    pub compression_acceleration: i32,
}

struct PendingSetup {
    state: SetupState,
    config: Arc<PendingDataConfig>,
    crypto: Arc<SymmetricCrypto>,
    nonce: Vec<u8>,
    conn: Weak<Connection>,
    assembler: MessageAssembler,
    created: Instant,
}

struct UnidentifiedSetup {
    conn: Weak<Connection>,
    assembler: MessageAssembler,
    created: Instant,
}

struct ActiveConnection {
    config: Arc<PendingDataConfig>,
    crypto: Arc<SymmetricCrypto>,
    conn: Weak<Connection>,
    assembler: MessageAssembler,
    last_events_count: u64,
    last_activity: Instant,
}

struct Tables {
    /// Setups in progress, keyed by connection id (both directions).
    pending: HashMap<ConnectionId, PendingSetup>,
    /// Inbound connections whose first message has not arrived yet.
    unidentified: HashMap<ConnectionId, UnidentifiedSetup>,
    /// Established connections per device; several per device are allowed.
    active: HashMap<DeviceId, HashMap<ConnectionId, ActiveConnection>>,
    active_index: HashMap<ConnectionId, DeviceId>,
}

enum Emit {
    Established(DeviceId, ConnectionId, TransientConnectionId),
    Failed(DeviceId, ConnectionId, TransientConnectionId),
    Received(DeviceId, ConnectionId, Vec<u8>),
    Closed(DeviceId, ConnectionId),
}

enum Outcome {
    None,
    Send(Vec<u8>),
    Fail(ErrorType),
}

type ConfigTake =
    Box<dyn Fn(&DeviceId, TransientConnectionId) -> Option<Arc<PendingDataConfig>> + Send + Sync>;

/// Manages data connections: setup, per-message AEAD and optional
/// compression framing.
pub struct DataHandler {
    config: DataHandlerConfig,
    provider: Arc<dyn CryptoProvider>,
    compressor: Arc<dyn Compressor>,
    events: Arc<dyn DataEvents>,
    config_take: ConfigTake,
    tables: Mutex<Tables>,
    metrics: Arc<Metrics>,
    log: logging::Logger,
}

impl DataHandler {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: DataHandlerConfig,
        provider: Arc<dyn CryptoProvider>,
        compressor: Arc<dyn Compressor>,
        events: Arc<dyn DataEvents>,
        config_take: ConfigTake,
        metrics: Arc<Metrics>,
        log: L,
    ) -> NetworkResult<DataHandler> {
        if config.request_signature_size == 0 || config.max_data_size == 0 {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        Ok(DataHandler {
            config,
            provider,
            compressor,
            events,
            config_take,
            tables: Mutex::new(Tables {
                pending: HashMap::new(),
                unidentified: HashMap::new(),
                active: HashMap::new(),
                active_index: HashMap::new(),
            }),
            metrics,
            log: logging::child(log),
        })
    }

    #[inline]
    fn assembler(&self) -> MessageAssembler {
        // Sealed and suffixed messages carry some overhead past the payload.
        MessageAssembler::new(self.config.max_data_size + 1024)
    }

    fn crypto_for(&self, config: &PendingDataConfig) -> Arc<SymmetricCrypto> {
        Arc::new(SymmetricCrypto::new(
            self.provider.clone(),
            config.cipher,
            config.mode,
            config.key.clone(),
            config.iv.clone(),
        ))
    }

    /// Starts the initiator-side handshake with pre-registered parameters.
    pub fn manage_local(&self, conn: &SharedConnection, config: Arc<PendingDataConfig>) {
        logging::debug!(self.log, "managing local data connection";
                        "connection_id" => conn.id(),
                        "device" => %config.device.id,
                        "transient_id" => config.transient_id);

        Metrics::bump(&self.metrics.setups_started);

        let device_id = config.device.id;
        let transient = config.transient_id;

        match self.start_local(conn, config) {
            Ok(message) => {
                conn.enable_data_events();
                if conn.send(&message).is_err() {
                    self.fail_connection(conn, ErrorType::Shutdown, Some((device_id, transient)));
                }
            }
            Err(_) => {
                self.fail_connection(conn, ErrorType::Crypto, Some((device_id, transient)));
            }
        }
    }

    fn start_local(
        &self,
        conn: &SharedConnection,
        config: Arc<PendingDataConfig>,
    ) -> NetworkResult<Vec<u8>> {
        let crypto = self.crypto_for(&config);

        let mut nonce = vec![0u8; self.config.request_signature_size];
        self.provider.random_bytes(&mut nonce);

        let secret = DataRequestSecret {
            nonce: nonce.clone(),
            transient_id: config.transient_id,
        };

        let encrypted = crypto.seal_message(&packets::to_vec(&secret)?)?;
        let signature = self
            .provider
            .sign(&encrypted)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

        let request = DataSetupRequest {
            device_id: self.config.local_peer_id,
            transient_id: config.transient_id,
            encrypted,
            signature,
        };

        let message = packets::to_vec(&request)?;

        self.tables.lock().expect("Data tables lock poisoned").pending.insert(
            conn.id(),
            PendingSetup {
                state: SetupState::RequestSent,
                config,
                crypto,
                nonce,
                conn: Arc::downgrade(conn),
                assembler: self.assembler(),
                created: Instant::now(),
            },
        );

        Ok(message)
    }

    /// Parks an inbound connection until its first message carries the
    /// routing ids.
    pub fn manage_remote(&self, conn: &SharedConnection) {
        logging::debug!(self.log, "managing remote data connection";
                        "connection_id" => conn.id());

        Metrics::bump(&self.metrics.setups_started);

        self.tables
            .lock()
            .expect("Data tables lock poisoned")
            .unidentified
            .insert(
                conn.id(),
                UnidentifiedSetup {
                    conn: Arc::downgrade(conn),
                    assembler: self.assembler(),
                    created: Instant::now(),
                },
            );

        conn.enable_data_events();
    }

    pub fn handle_data(&self, conn: &SharedConnection, data: Vec<u8>, remaining: u64) {
        let conn_id = conn.id();
        let mut emits = Vec::new();

        let outcome = {
            let mut tables = self.tables.lock().expect("Data tables lock poisoned");

            if tables.pending.contains_key(&conn_id) {
                self.pending_data(&mut tables, conn_id, data, remaining, &mut emits)
            } else if tables.unidentified.contains_key(&conn_id) {
                self.unidentified_data(&mut tables, conn_id, data, remaining, &mut emits)
            } else if let Some(device_id) = tables.active_index.get(&conn_id).copied() {
                self.active_data(&mut tables, device_id, conn_id, data, remaining, &mut emits)
            } else {
                Outcome::None
            }
        };

        self.apply(conn, outcome, emits);
    }

    /// Initiator side: the handshake response.
    fn pending_data(
        &self,
        tables: &mut Tables,
        conn_id: ConnectionId,
        data: Vec<u8>,
        remaining: u64,
        emits: &mut Vec<Emit>,
    ) -> Outcome {
        let setup = match tables.pending.get_mut(&conn_id) {
            Some(setup) => setup,
            None => return Outcome::None,
        };

        let message = match setup.assembler.push(data, remaining) {
            Ok(Some(message)) => message,
            Ok(None) => return Outcome::None,
            Err(NetworkError::Fatal(err)) => return Outcome::Fail(err),
            Err(NetworkError::Wait) => return Outcome::None,
        };

        match setup.state {
            SetupState::RequestSent | SetupState::RequestSentConfirmed => {}
            _ => return Outcome::Fail(ErrorType::InvalidSetupState),
        }

        let response: DataSetupResponse = match setup
            .crypto
            .open_message(&message)
            .and_then(|plain| packets::from_slice(&plain))
        {
            Ok(response) => response,
            Err(_) => return Outcome::Fail(ErrorType::Crypto),
        };

        if response.nonce_echo != setup.nonce {
            return Outcome::Fail(ErrorType::SignatureMismatch);
        }

        if !response.ok {
            return Outcome::Fail(ErrorType::InvalidSetupState);
        }

        let setup = tables.pending.remove(&conn_id).expect("Pending setup must exist");
        let device_id = setup.config.device.id;
        let transient = setup.config.transient_id;

        self.activate(tables, conn_id, device_id, setup.config, setup.crypto, setup.conn);

        Metrics::bump(&self.metrics.setups_completed);
        emits.push(Emit::Established(device_id, conn_id, transient));

        Outcome::None
    }

    /// Responder side: the first message identifies the peer and transfer.
    fn unidentified_data(
        &self,
        tables: &mut Tables,
        conn_id: ConnectionId,
        data: Vec<u8>,
        remaining: u64,
        emits: &mut Vec<Emit>,
    ) -> Outcome {
        let setup = match tables.unidentified.get_mut(&conn_id) {
            Some(setup) => setup,
            None => return Outcome::None,
        };

        let message = match setup.assembler.push(data, remaining) {
            Ok(Some(message)) => message,
            Ok(None) => return Outcome::None,
            Err(NetworkError::Fatal(err)) => return Outcome::Fail(err),
            Err(NetworkError::Wait) => return Outcome::None,
        };

        let request: DataSetupRequest = match packets::from_slice(&message) {
            Ok(request) => request,
            Err(_) => return Outcome::Fail(ErrorType::Serialization),
        };

        let config = match (self.config_take)(&request.device_id, request.transient_id) {
            Some(config) => config,
            None => {
                logging::debug!(self.log, "no pending parameters for data request";
                                "connection_id" => conn_id,
                                "device" => %request.device_id,
                                "transient_id" => request.transient_id);
                return Outcome::Fail(ErrorType::NotFound);
            }
        };

        if self
            .provider
            .verify(&config.device.public_key, &request.encrypted, &request.signature)
            .is_err()
        {
            return Outcome::Fail(ErrorType::Crypto);
        }

        let crypto = self.crypto_for(&config);

        let secret: DataRequestSecret = match crypto
            .open_message(&request.encrypted)
            .and_then(|plain| packets::from_slice(&plain))
        {
            Ok(secret) => secret,
            Err(_) => return Outcome::Fail(ErrorType::Crypto),
        };

        if secret.transient_id != request.transient_id {
            return Outcome::Fail(ErrorType::SignatureMismatch);
        }

        let response = DataSetupResponse {
            nonce_echo: secret.nonce,
            ok: true,
        };

        let message = match packets::to_vec(&response)
            .and_then(|plain| crypto.seal_message(&plain))
        {
            Ok(message) => message,
            Err(_) => return Outcome::Fail(ErrorType::Crypto),
        };

        let setup = tables
            .unidentified
            .remove(&conn_id)
            .expect("Unidentified setup must exist");

        let device_id = config.device.id;
        let transient = config.transient_id;

        self.activate(tables, conn_id, device_id, config, crypto, setup.conn);

        Metrics::bump(&self.metrics.setups_completed);
        emits.push(Emit::Established(device_id, conn_id, transient));

        logging::info!(self.log, "data connection established";
                       "connection_id" => conn_id,
                       "device" => %device_id,
                       "transient_id" => transient);

        Outcome::Send(message)
    }

    fn activate(
        &self,
        tables: &mut Tables,
        conn_id: ConnectionId,
        device_id: DeviceId,
        config: Arc<PendingDataConfig>,
        crypto: Arc<SymmetricCrypto>,
        conn: Weak<Connection>,
    ) {
        tables.active_index.insert(conn_id, device_id);
        tables.active.entry(device_id).or_insert_with(HashMap::new).insert(
            conn_id,
            ActiveConnection {
                config,
                crypto,
                conn,
                assembler: self.assembler(),
                last_events_count: 0,
                last_activity: Instant::now(),
            },
        );
    }

    /// Steady state: AEAD and/or compression framed payloads.
    fn active_data(
        &self,
        tables: &mut Tables,
        device_id: DeviceId,
        conn_id: ConnectionId,
        data: Vec<u8>,
        remaining: u64,
        emits: &mut Vec<Emit>,
    ) -> Outcome {
        let entry = match tables
            .active
            .get_mut(&device_id)
            .and_then(|connections| connections.get_mut(&conn_id))
        {
            Some(entry) => entry,
            None => return Outcome::None,
        };

        let message = match entry.assembler.push(data, remaining) {
            Ok(Some(message)) => message,
            Ok(None) => return Outcome::None,
            Err(NetworkError::Fatal(err)) => return Outcome::Fail(err),
            Err(NetworkError::Wait) => return Outcome::None,
        };

        let payload = if entry.config.encrypt {
            match entry.crypto.open_message(&message) {
                Ok(payload) => payload,
                Err(_) => return Outcome::Fail(ErrorType::Crypto),
            }
        } else {
            message
        };

        let plain = if entry.config.compress {
            if payload.len() < SIZE_SUFFIX {
                return Outcome::Fail(ErrorType::Serialization);
            }

            let (compressed, suffix) = payload.split_at(payload.len() - SIZE_SUFFIX);
            let uncompressed_size = BigEndian::read_u64(suffix) as usize;

            if uncompressed_size > self.config.max_data_size {
                return Outcome::Fail(ErrorType::PayloadTooLarge);
            }

            match self.compressor.decompress(compressed, uncompressed_size) {
                Ok(plain) => plain,
                Err(_) => return Outcome::Fail(ErrorType::Serialization),
            }
        } else {
            payload
        };

        entry.last_activity = Instant::now();
        Metrics::bump(&self.metrics.data_received);
        emits.push(Emit::Received(device_id, conn_id, plain));

        Outcome::None
    }

    /// Sends a payload on an established data connection, applying the
    /// connection's compression and encryption flags.
    pub fn send_data(
        &self,
        device: &DeviceId,
        conn_id: ConnectionId,
        plaintext: &[u8],
    ) -> NetworkResult<()> {
        if plaintext.len() > self.config.max_data_size {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        let (conn, message) = {
            let tables = self.tables.lock().expect("Data tables lock poisoned");
            let entry = tables
                .active
                .get(device)
                .and_then(|connections| connections.get(&conn_id))
                .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

            let payload = if entry.config.compress {
                let compressed = self
                    .compressor
                    .compress(plaintext, self.config.compression_acceleration)
                    .map_err(|_| NetworkError::Fatal(ErrorType::Serialization))?;

                let mut framed = compressed;
                let mut suffix = [0u8; SIZE_SUFFIX];
                BigEndian::write_u64(&mut suffix, plaintext.len() as u64);
                framed.extend_from_slice(&suffix);
                framed
            } else {
                plaintext.to_vec()
            };

            let message = if entry.config.encrypt {
                entry.crypto.seal_message(&payload)?
            } else {
                payload
            };

            let conn = entry
                .conn
                .upgrade()
                .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

            (conn, message)
        };

        conn.send(&message)?;
        Metrics::bump(&self.metrics.data_sent);
        Ok(())
    }

    pub fn handle_write_result(&self, conn: &SharedConnection, sent: bool) {
        if !sent {
            self.handle_disconnect(conn);
            return;
        }

        let mut tables = self.tables.lock().expect("Data tables lock poisoned");
        if let Some(setup) = tables.pending.get_mut(&conn.id()) {
            if setup.state == SetupState::RequestSent {
                setup.state = SetupState::RequestSentConfirmed;
            }
        }
    }

    pub fn handle_disconnect(&self, conn: &SharedConnection) {
        let conn_id = conn.id();
        let mut emits = Vec::new();

        {
            let mut tables = self.tables.lock().expect("Data tables lock poisoned");

            if let Some(setup) = tables.pending.remove(&conn_id) {
                Metrics::bump(&self.metrics.setups_failed);
                emits.push(Emit::Failed(
                    setup.config.device.id,
                    conn_id,
                    setup.config.transient_id,
                ));
            } else if tables.unidentified.remove(&conn_id).is_some() {
                Metrics::bump(&self.metrics.setups_failed);
            } else if let Some(device_id) = tables.active_index.remove(&conn_id) {
                let drained = match tables.active.get_mut(&device_id) {
                    Some(connections) => {
                        let removed = connections.remove(&conn_id);
                        if connections.is_empty() {
                            tables.active.remove(&device_id);
                        }
                        removed
                    }
                    None => None,
                };

                if drained.is_some() {
                    emits.push(Emit::Closed(device_id, conn_id));
                }
            }
        }

        self.emit_all(emits);
    }

    /// Closes one data connection of a device.
    pub fn close_connection(&self, device: &DeviceId, conn_id: ConnectionId) -> NetworkResult<()> {
        let conn = {
            let tables = self.tables.lock().expect("Data tables lock poisoned");
            tables
                .active
                .get(device)
                .and_then(|connections| connections.get(&conn_id))
                .and_then(|entry| entry.conn.upgrade())
                .ok_or(NetworkError::Fatal(ErrorType::NotFound))?
        };

        conn.close();
        Ok(())
    }

    pub fn active_count(&self, device: &DeviceId) -> usize {
        self.tables
            .lock()
            .expect("Data tables lock poisoned")
            .active
            .get(device)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    fn apply(&self, conn: &SharedConnection, outcome: Outcome, emits: Vec<Emit>) {
        match outcome {
            Outcome::None => {}
            Outcome::Send(message) => {
                if conn.send(&message).is_err() {
                    self.fail_connection(conn, ErrorType::Shutdown, None);
                }
            }
            Outcome::Fail(err) => self.fail_connection(conn, err, None),
        }

        self.emit_all(emits);
    }

    fn emit_all(&self, emits: Vec<Emit>) {
        for emit in emits {
            match emit {
                Emit::Established(device, conn_id, transient) => {
                    self.events.on_connection_established(device, conn_id, transient)
                }
                Emit::Failed(device, conn_id, transient) => {
                    self.events.on_connection_failed(device, conn_id, transient)
                }
                Emit::Received(device, conn_id, payload) => {
                    self.events.on_data_received(device, conn_id, payload)
                }
                Emit::Closed(device, conn_id) => self.events.on_connection_closed(device, conn_id),
            }
        }
    }

    fn fail_connection(
        &self,
        conn: &SharedConnection,
        err: ErrorType,
        identity: Option<(DeviceId, TransientConnectionId)>,
    ) {
        let conn_id = conn.id();
        let mut emits = Vec::new();

        {
            let mut tables = self.tables.lock().expect("Data tables lock poisoned");

            if let Some(setup) = tables.pending.remove(&conn_id) {
                Metrics::bump(&self.metrics.setups_failed);
                emits.push(Emit::Failed(
                    setup.config.device.id,
                    conn_id,
                    setup.config.transient_id,
                ));
            } else if tables.unidentified.remove(&conn_id).is_some() {
                Metrics::bump(&self.metrics.setups_failed);
            } else if let Some((device, transient)) = identity {
                Metrics::bump(&self.metrics.setups_failed);
                emits.push(Emit::Failed(device, conn_id, transient));
            }
        }

        logging::debug!(self.log, "data connection failed";
                        "connection_id" => conn_id,
                        "error" => ?err);

        self.emit_all(emits);
        conn.fail(err);
    }

    /// Fails pending setups older than the deadline.
    pub fn sweep_pending(&self, max_age: Duration) {
        let now = Instant::now();

        let expired: Vec<Weak<Connection>> = {
            let tables = self.tables.lock().expect("Data tables lock poisoned");
            tables
                .pending
                .values()
                .filter(|setup| now.duration_since(setup.created) >= max_age)
                .map(|setup| setup.conn.clone())
                .chain(
                    tables
                        .unidentified
                        .values()
                        .filter(|setup| now.duration_since(setup.created) >= max_age)
                        .map(|setup| setup.conn.clone()),
                )
                .collect()
        };

        for conn in expired {
            if let Some(conn) = conn.upgrade() {
                self.fail_connection(&conn, ErrorType::Expired, None);
            }
        }
    }

    /// Closes active connections whose events counter did not advance since
    /// the previous pass.
    pub fn sweep_idle(&self, max_idle: Duration) {
        let now = Instant::now();

        let idle: Vec<Weak<Connection>> = {
            let mut tables = self.tables.lock().expect("Data tables lock poisoned");
            let mut idle = Vec::new();

            for connections in tables.active.values_mut() {
                for entry in connections.values_mut() {
                    let count = entry.conn.upgrade().map(|conn| conn.events_count()).unwrap_or(0);

                    if count != entry.last_events_count {
                        entry.last_events_count = count;
                        entry.last_activity = now;
                    } else if now.duration_since(entry.last_activity) >= max_idle {
                        idle.push(entry.conn.clone());
                    }
                }
            }

            idle
        };

        for conn in idle {
            if let Some(conn) = conn.upgrade() {
                logging::debug!(self.log, "closing idle data connection";
                                "connection_id" => conn.id());
                conn.close();
            }
        }
    }

    /// Drops all state, failing pending setups.
    pub fn clear(&self) {
        let mut emits = Vec::new();

        {
            let mut tables = self.tables.lock().expect("Data tables lock poisoned");

            let pending: Vec<(ConnectionId, Arc<PendingDataConfig>)> = tables
                .pending
                .drain()
                .map(|(conn_id, setup)| (conn_id, setup.config))
                .collect();

            for (conn_id, config) in pending {
                Metrics::bump(&self.metrics.setups_failed);
                emits.push(Emit::Failed(config.device.id, conn_id, config.transient_id));
            }

            tables.unidentified.clear();

            let active: Vec<(DeviceId, ConnectionId)> = tables
                .active
                .iter()
                .flat_map(|(device_id, connections)| {
                    connections.keys().map(move |conn_id| (*device_id, *conn_id))
                })
                .collect();

            tables.active.clear();
            tables.active_index.clear();

            for (device_id, conn_id) in active {
                emits.push(Emit::Closed(device_id, conn_id));
            }
        }

        self.emit_all(emits);
    }
}
