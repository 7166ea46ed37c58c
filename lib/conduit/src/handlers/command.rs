//! COMMAND-role protocol: the long-lived control channel to a peer already
//! known from a previous INIT. A two-message handshake keyed through the
//! peer's asymmetric material opens a session; steady-state traffic is
//! AEAD-sealed instruction envelopes with per-message IV roll.

use crate::handlers::packets::{
    self, CommandRequestSecret, CommandSetupRequest, CommandSetupResponse, EnvelopeKind,
    InstructionEnvelope,
};
use crate::handlers::MessageAssembler;
use crate::metrics::Metrics;
use crate::net::connection::{Connection, SharedConnection};
use crate::net::support::{
    CommandId, ConnectionId, ErrorType, NetworkError, NetworkResult, SetupState,
};
use crate::secure::SymmetricCrypto;
use hashbrown::{HashMap, HashSet};
use solder::crypto::{CipherMode, CryptoProvider, KeyExchange, SymmetricCipher};
use solder::device::{DeviceDirectory, DeviceId, DeviceRecord};
use solder::logging;
use solder::session::{SessionAccess, SessionId, SessionType};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Upward events of the COMMAND handler.
pub trait CommandEvents: Send + Sync {
    fn on_connection_established(&self, device: DeviceId, conn: ConnectionId);
    fn on_connection_failed(&self, device: DeviceId, conn: ConnectionId);
    fn on_message_received(&self, device: DeviceId, command: CommandId, plaintext: Vec<u8>);
    fn on_connection_closed(&self, device: DeviceId, conn: ConnectionId);
    fn on_instruction_response(&self, device: DeviceId, command: CommandId, payload: Vec<u8>);
    fn on_instruction_failed(&self, device: DeviceId, command: CommandId);
}

#[derive(Clone)]
pub struct CommandHandlerConfig {
    pub request_signature_size: usize,
    pub local_peer_id: DeviceId,
    pub cipher: SymmetricCipher,
    pub mode: CipherMode,
    pub max_message_size: usize,
}

struct PendingSetup {
    state: SetupState,
    crypto: Arc<SymmetricCrypto>,
    nonce: Vec<u8>,
    conn: Weak<Connection>,
    conn_id: ConnectionId,
    assembler: MessageAssembler,
    created: Instant,
}

struct UnknownSetup {
    conn: Weak<Connection>,
    assembler: MessageAssembler,
    created: Instant,
}

struct EstablishedConnection {
    session: SessionId,
    crypto: Arc<SymmetricCrypto>,
    conn: Weak<Connection>,
    conn_id: ConnectionId,
    assembler: MessageAssembler,
    next_command: CommandId,
    pending_instructions: HashMap<CommandId, Instant>,
    last_events_count: u64,
    last_activity: Instant,
}

struct Tables {
    pending: HashMap<DeviceId, PendingSetup>,
    pending_index: HashMap<ConnectionId, DeviceId>,
    unknown: HashMap<ConnectionId, UnknownSetup>,
    established: HashMap<DeviceId, EstablishedConnection>,
    established_index: HashMap<ConnectionId, DeviceId>,
    /// Connections to close once their final write flushes.
    close_after_write: HashSet<ConnectionId>,
}

enum Emit {
    Established(DeviceId, ConnectionId),
    Failed(DeviceId, ConnectionId),
    Message(DeviceId, CommandId, Vec<u8>),
    Closed(DeviceId, ConnectionId),
    InstructionResponse(DeviceId, CommandId, Vec<u8>),
    InstructionFailed(DeviceId, CommandId),
}

enum Outcome {
    None,
    Send(Vec<u8>),
    SendThenClose(Vec<u8>),
    Fail(ErrorType),
}

/// Manages command connections: handshake, session opening, encrypted
/// instruction traffic and pending-instruction correlation.
pub struct CommandHandler {
    config: CommandHandlerConfig,
    provider: Arc<dyn CryptoProvider>,
    directory: Arc<dyn DeviceDirectory>,
    sessions: Arc<dyn SessionAccess>,
    events: Arc<dyn CommandEvents>,
    tables: Mutex<Tables>,
    metrics: Arc<Metrics>,
    log: logging::Logger,
}

impl CommandHandler {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: CommandHandlerConfig,
        provider: Arc<dyn CryptoProvider>,
        directory: Arc<dyn DeviceDirectory>,
        sessions: Arc<dyn SessionAccess>,
        events: Arc<dyn CommandEvents>,
        metrics: Arc<Metrics>,
        log: L,
    ) -> NetworkResult<CommandHandler> {
        if config.request_signature_size == 0 {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        Ok(CommandHandler {
            config,
            provider,
            directory,
            sessions,
            events,
            tables: Mutex::new(Tables {
                pending: HashMap::new(),
                pending_index: HashMap::new(),
                unknown: HashMap::new(),
                established: HashMap::new(),
                established_index: HashMap::new(),
                close_after_write: HashSet::new(),
            }),
            metrics,
            log: logging::child(log),
        })
    }

    /// Derives the session key for a device record, per its expected key
    /// exchange mechanism.
    fn session_key(&self, device: &DeviceRecord) -> NetworkResult<Vec<u8>> {
        match device.expected_key_exchange {
            KeyExchange::Rsa => {
                let mut key = vec![0u8; self.provider.key_size(self.config.cipher)];
                self.provider.random_bytes(&mut key);
                Ok(key)
            }
            KeyExchange::Ecdh => self
                .provider
                .agree(&device.agreement_private_key, &device.agreement_public_key)
                .map_err(|_| NetworkError::Fatal(ErrorType::Crypto)),
        }
    }

    /// Starts the initiator-side handshake towards a known device.
    pub fn manage_local(&self, conn: &SharedConnection, device: DeviceRecord) {
        logging::debug!(self.log, "managing local command connection";
                        "connection_id" => conn.id(),
                        "device" => %device.id);

        Metrics::bump(&self.metrics.setups_started);

        let device_id = device.id;
        let outcome = self.start_local(conn, device);

        match outcome {
            Ok(message) => {
                conn.enable_data_events();
                if conn.send(&message).is_err() {
                    self.fail_setup(conn, Some(device_id), ErrorType::Shutdown);
                }
            }
            Err(NetworkError::Fatal(err)) => self.fail_setup(conn, Some(device_id), err),
            Err(NetworkError::Wait) => {}
        }
    }

    fn start_local(&self, conn: &SharedConnection, device: DeviceRecord) -> NetworkResult<Vec<u8>> {
        let key = self.session_key(&device)?;

        let mut iv = vec![0u8; self.provider.iv_size(self.config.cipher, self.config.mode)];
        self.provider.random_bytes(&mut iv);

        let mut nonce = vec![0u8; self.config.request_signature_size];
        self.provider.random_bytes(&mut nonce);

        let key_material = match device.expected_key_exchange {
            KeyExchange::Rsa => key.clone(),
            KeyExchange::Ecdh => device.agreement_public_key.clone(),
        };

        let secret = CommandRequestSecret {
            peer_id: self.config.local_peer_id,
            nonce: nonce.clone(),
            key_material,
            iv: iv.clone(),
            cipher: self.config.cipher,
            mode: self.config.mode,
        };

        let encrypted = self
            .provider
            .asym_encrypt(&device.public_key, &packets::to_vec(&secret)?)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

        let signature = self
            .provider
            .sign(&encrypted)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

        let request = CommandSetupRequest {
            peer_id: self.config.local_peer_id,
            encrypted,
            signature,
        };

        let message = packets::to_vec(&request)?;

        let crypto = Arc::new(SymmetricCrypto::new(
            self.provider.clone(),
            self.config.cipher,
            self.config.mode,
            key,
            iv,
        ));

        let mut tables = self.tables.lock().expect("Command tables lock poisoned");

        if tables.pending.contains_key(&device.id) || tables.established.contains_key(&device.id) {
            return Err(NetworkError::Fatal(ErrorType::Duplicate));
        }

        tables.pending_index.insert(conn.id(), device.id);
        let device_id = device.id;
        tables.pending.insert(
            device_id,
            PendingSetup {
                state: SetupState::RequestSent,
                crypto,
                nonce,
                conn: Arc::downgrade(conn),
                conn_id: conn.id(),
                assembler: MessageAssembler::new(self.config.max_message_size),
                created: Instant::now(),
            },
        );

        Ok(message)
    }

    /// Parks an inbound connection until its first message identifies the
    /// remote device.
    pub fn manage_remote(&self, conn: &SharedConnection) {
        logging::debug!(self.log, "managing remote command connection";
                        "connection_id" => conn.id());

        Metrics::bump(&self.metrics.setups_started);

        self.tables
            .lock()
            .expect("Command tables lock poisoned")
            .unknown
            .insert(
                conn.id(),
                UnknownSetup {
                    conn: Arc::downgrade(conn),
                    assembler: MessageAssembler::new(self.config.max_message_size),
                    created: Instant::now(),
                },
            );

        conn.enable_data_events();
    }

    pub fn handle_data(&self, conn: &SharedConnection, data: Vec<u8>, remaining: u64) {
        let conn_id = conn.id();
        let mut emits = Vec::new();

        let outcome = {
            let mut tables = self.tables.lock().expect("Command tables lock poisoned");

            if let Some(device_id) = tables.pending_index.get(&conn_id).copied() {
                self.pending_data(&mut tables, device_id, data, remaining, &mut emits)
            } else if tables.unknown.contains_key(&conn_id) {
                self.unknown_data(&mut tables, conn_id, data, remaining, &mut emits)
            } else if let Some(device_id) = tables.established_index.get(&conn_id).copied() {
                self.established_data(&mut tables, device_id, data, remaining, &mut emits)
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
        device_id: DeviceId,
        data: Vec<u8>,
        remaining: u64,
        emits: &mut Vec<Emit>,
    ) -> Outcome {
        let setup = match tables.pending.get_mut(&device_id) {
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

        let response: CommandSetupResponse = match setup
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

        // Promote to established.
        let setup = tables.pending.remove(&device_id).expect("Pending setup must exist");
        tables.pending_index.remove(&setup.conn_id);
        tables.established_index.insert(setup.conn_id, device_id);
        tables.established.insert(
            device_id,
            EstablishedConnection {
                session: response.session,
                crypto: setup.crypto,
                conn: setup.conn,
                conn_id: setup.conn_id,
                assembler: MessageAssembler::new(self.config.max_message_size),
                next_command: 1,
                pending_instructions: HashMap::new(),
                last_events_count: 0,
                last_activity: Instant::now(),
            },
        );

        Metrics::bump(&self.metrics.setups_completed);
        emits.push(Emit::Established(device_id, setup.conn_id));

        logging::info!(self.log, "command connection established";
                       "connection_id" => setup.conn_id,
                       "device" => %device_id,
                       "session" => response.session);

        Outcome::None
    }

    /// Responder side: the first message from an unknown peer.
    fn unknown_data(
        &self,
        tables: &mut Tables,
        conn_id: ConnectionId,
        data: Vec<u8>,
        remaining: u64,
        emits: &mut Vec<Emit>,
    ) -> Outcome {
        let setup = match tables.unknown.get_mut(&conn_id) {
            Some(setup) => setup,
            None => return Outcome::None,
        };

        let message = match setup.assembler.push(data, remaining) {
            Ok(Some(message)) => message,
            Ok(None) => return Outcome::None,
            Err(NetworkError::Fatal(err)) => return Outcome::Fail(err),
            Err(NetworkError::Wait) => return Outcome::None,
        };

        let request: CommandSetupRequest = match packets::from_slice(&message) {
            Ok(request) => request,
            Err(_) => return Outcome::Fail(ErrorType::Serialization),
        };

        let device = match self.directory.lookup_device(&request.peer_id) {
            Some(device) => device,
            None => {
                logging::debug!(self.log, "command request from unknown device";
                                "connection_id" => conn_id,
                                "device" => %request.peer_id);
                return Outcome::Fail(ErrorType::NotFound);
            }
        };

        if self
            .provider
            .verify(&device.public_key, &request.encrypted, &request.signature)
            .is_err()
        {
            return Outcome::Fail(ErrorType::Crypto);
        }

        let secret: CommandRequestSecret = match self
            .provider
            .asym_decrypt(&request.encrypted)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))
            .and_then(|plain| packets::from_slice(&plain))
        {
            Ok(secret) => secret,
            Err(_) => return Outcome::Fail(ErrorType::Crypto),
        };

        if secret.peer_id != request.peer_id {
            return Outcome::Fail(ErrorType::SignatureMismatch);
        }

        let key = match device.expected_key_exchange {
            KeyExchange::Rsa => secret.key_material.clone(),
            KeyExchange::Ecdh => match self
                .provider
                .agree(&device.agreement_private_key, &device.agreement_public_key)
            {
                Ok(key) => key,
                Err(_) => return Outcome::Fail(ErrorType::Crypto),
            },
        };

        let crypto = Arc::new(SymmetricCrypto::new(
            self.provider.clone(),
            secret.cipher,
            secret.mode,
            key,
            secret.iv.clone(),
        ));

        // Authenticate the peer with its stored secret and open a session.
        let session = self
            .sessions
            .open_session(&device.id, &device.password, SessionType::Command);

        let (ok, session_id) = match session {
            Ok(session_id) => (true, session_id),
            Err(err) => {
                logging::debug!(self.log, "session open refused";
                                "connection_id" => conn_id,
                                "device" => %device.id,
                                "error" => %err);
                (false, 0)
            }
        };

        let response = CommandSetupResponse {
            nonce_echo: secret.nonce,
            ok,
            session: session_id,
        };

        let message = match packets::to_vec(&response)
            .and_then(|plain| crypto.seal_message(&plain))
        {
            Ok(message) => message,
            Err(_) => return Outcome::Fail(ErrorType::Crypto),
        };

        let setup = tables.unknown.remove(&conn_id).expect("Unknown setup must exist");

        if !ok {
            Metrics::bump(&self.metrics.setups_failed);
            return Outcome::SendThenClose(message);
        }

        let device_id = device.id;

        if tables.established.contains_key(&device_id) {
            logging::debug!(self.log, "duplicate command connection for device";
                            "connection_id" => conn_id,
                            "device" => %device_id);
            return Outcome::Fail(ErrorType::Duplicate);
        }

        tables.established_index.insert(conn_id, device_id);
        tables.established.insert(
            device_id,
            EstablishedConnection {
                session: session_id,
                crypto,
                conn: setup.conn,
                conn_id,
                assembler: MessageAssembler::new(self.config.max_message_size),
                next_command: 1,
                pending_instructions: HashMap::new(),
                last_events_count: 0,
                last_activity: Instant::now(),
            },
        );

        Metrics::bump(&self.metrics.setups_completed);
        emits.push(Emit::Established(device_id, conn_id));

        logging::info!(self.log, "command connection established";
                       "connection_id" => conn_id,
                       "device" => %device_id,
                       "session" => session_id);

        Outcome::Send(message)
    }

    /// Steady state: sealed instruction envelopes.
    fn established_data(
        &self,
        tables: &mut Tables,
        device_id: DeviceId,
        data: Vec<u8>,
        remaining: u64,
        emits: &mut Vec<Emit>,
    ) -> Outcome {
        let entry = match tables.established.get_mut(&device_id) {
            Some(entry) => entry,
            None => return Outcome::None,
        };

        let message = match entry.assembler.push(data, remaining) {
            Ok(Some(message)) => message,
            Ok(None) => return Outcome::None,
            Err(NetworkError::Fatal(err)) => return Outcome::Fail(err),
            Err(NetworkError::Wait) => return Outcome::None,
        };

        // Any authentication failure is fatal for the connection.
        let envelope: InstructionEnvelope = match entry
            .crypto
            .open_message(&message)
            .and_then(|plain| packets::from_slice(&plain))
        {
            Ok(envelope) => envelope,
            Err(_) => return Outcome::Fail(ErrorType::Crypto),
        };

        entry.last_activity = Instant::now();
        Metrics::bump(&self.metrics.commands_received);

        match envelope.kind {
            EnvelopeKind::Request => {
                emits.push(Emit::Message(device_id, envelope.command_id, envelope.payload));
            }
            EnvelopeKind::Response => {
                if entry.pending_instructions.remove(&envelope.command_id).is_some() {
                    emits.push(Emit::InstructionResponse(
                        device_id,
                        envelope.command_id,
                        envelope.payload,
                    ));
                } else {
                    logging::debug!(self.log, "response for unknown instruction";
                                    "device" => %device_id,
                                    "command_id" => envelope.command_id);
                }
            }
        }

        Outcome::None
    }

    /// Sends an instruction request; the response resolves through
    /// `on_instruction_response`.
    pub fn send_instruction(&self, device: &DeviceId, payload: &[u8]) -> NetworkResult<CommandId> {
        let (conn, message, command_id) = {
            let mut tables = self.tables.lock().expect("Command tables lock poisoned");
            let entry = tables
                .established
                .get_mut(device)
                .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

            let command_id = entry.next_command;
            entry.next_command = entry.next_command.wrapping_add(1);

            let envelope = InstructionEnvelope {
                command_id,
                kind: EnvelopeKind::Request,
                payload: payload.to_vec(),
            };

            let message = entry.crypto.seal_message(&packets::to_vec(&envelope)?)?;
            let conn = entry
                .conn
                .upgrade()
                .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

            entry.pending_instructions.insert(command_id, Instant::now());

            (conn, message, command_id)
        };

        conn.send(&message)?;
        Metrics::bump(&self.metrics.commands_sent);
        Ok(command_id)
    }

    /// Sends a response to an instruction previously received from the peer.
    pub fn send_response(
        &self,
        device: &DeviceId,
        command_id: CommandId,
        payload: &[u8],
    ) -> NetworkResult<()> {
        let (conn, message) = {
            let tables = self.tables.lock().expect("Command tables lock poisoned");
            let entry = tables
                .established
                .get(device)
                .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

            let envelope = InstructionEnvelope {
                command_id,
                kind: EnvelopeKind::Response,
                payload: payload.to_vec(),
            };

            let message = entry.crypto.seal_message(&packets::to_vec(&envelope)?)?;
            let conn = entry
                .conn
                .upgrade()
                .ok_or(NetworkError::Fatal(ErrorType::NotFound))?;

            (conn, message)
        };

        conn.send(&message)?;
        Metrics::bump(&self.metrics.commands_sent);
        Ok(())
    }

    pub fn handle_write_result(&self, conn: &SharedConnection, sent: bool) {
        let conn_id = conn.id();

        if !sent {
            self.handle_disconnect(conn);
            return;
        }

        let close_now = {
            let mut tables = self.tables.lock().expect("Command tables lock poisoned");

            if let Some(device_id) = tables.pending_index.get(&conn_id).copied() {
                if let Some(setup) = tables.pending.get_mut(&device_id) {
                    if setup.state == SetupState::RequestSent {
                        setup.state = SetupState::RequestSentConfirmed;
                    }
                }
            }

            tables.close_after_write.remove(&conn_id)
        };

        if close_now {
            conn.close();
        }
    }

    pub fn handle_disconnect(&self, conn: &SharedConnection) {
        let conn_id = conn.id();
        let mut emits = Vec::new();

        {
            let mut tables = self.tables.lock().expect("Command tables lock poisoned");
            tables.close_after_write.remove(&conn_id);

            if let Some(device_id) = tables.pending_index.remove(&conn_id) {
                if tables.pending.remove(&device_id).is_some() {
                    Metrics::bump(&self.metrics.setups_failed);
                    emits.push(Emit::Failed(device_id, conn_id));
                }
            } else if tables.unknown.remove(&conn_id).is_some() {
                Metrics::bump(&self.metrics.setups_failed);
            } else if let Some(device_id) = tables.established_index.remove(&conn_id) {
                if let Some(entry) = tables.established.remove(&device_id) {
                    for (command_id, _) in entry.pending_instructions {
                        emits.push(Emit::InstructionFailed(device_id, command_id));
                    }
                    emits.push(Emit::Closed(device_id, conn_id));
                }
            }
        }

        self.emit_all(emits);
    }

    /// Closes the command connection to a device.
    pub fn close_connection(&self, device: &DeviceId) -> NetworkResult<()> {
        let conn = {
            let tables = self.tables.lock().expect("Command tables lock poisoned");
            tables
                .established
                .get(device)
                .and_then(|entry| entry.conn.upgrade())
                .ok_or(NetworkError::Fatal(ErrorType::NotFound))?
        };

        conn.close();
        Ok(())
    }

    /// The session id issued for an established device connection.
    pub fn session_of(&self, device: &DeviceId) -> Option<SessionId> {
        self.tables
            .lock()
            .expect("Command tables lock poisoned")
            .established
            .get(device)
            .map(|entry| entry.session)
    }

    pub fn is_established(&self, device: &DeviceId) -> bool {
        self.tables
            .lock()
            .expect("Command tables lock poisoned")
            .established
            .contains_key(device)
    }

    fn apply(&self, conn: &SharedConnection, outcome: Outcome, emits: Vec<Emit>) {
        match outcome {
            Outcome::None => {}
            Outcome::Send(message) => {
                if conn.send(&message).is_err() {
                    self.fail_setup(conn, None, ErrorType::Shutdown);
                }
            }
            Outcome::SendThenClose(message) => {
                let sent = conn.send(&message).is_ok();
                if sent {
                    self.tables
                        .lock()
                        .expect("Command tables lock poisoned")
                        .close_after_write
                        .insert(conn.id());
                } else {
                    conn.close();
                }
            }
            Outcome::Fail(err) => {
                self.fail_setup(conn, None, err);
            }
        }

        self.emit_all(emits);
    }

    fn emit_all(&self, emits: Vec<Emit>) {
        for emit in emits {
            match emit {
                Emit::Established(device, conn_id) => {
                    self.events.on_connection_established(device, conn_id)
                }
                Emit::Failed(device, conn_id) => self.events.on_connection_failed(device, conn_id),
                Emit::Message(device, command, payload) => {
                    self.events.on_message_received(device, command, payload)
                }
                Emit::Closed(device, conn_id) => self.events.on_connection_closed(device, conn_id),
                Emit::InstructionResponse(device, command, payload) => {
                    self.events.on_instruction_response(device, command, payload)
                }
                Emit::InstructionFailed(device, command) => {
                    self.events.on_instruction_failed(device, command)
                }
            }
        }
    }

    /// Tears a connection down during setup and reports the failure.
    fn fail_setup(&self, conn: &SharedConnection, device_hint: Option<DeviceId>, err: ErrorType) {
        let conn_id = conn.id();
        let mut emits = Vec::new();

        {
            let mut tables = self.tables.lock().expect("Command tables lock poisoned");

            let device_id = device_hint.or_else(|| tables.pending_index.get(&conn_id).copied());

            if let Some(device_id) = device_id {
                // Only this connection's own setup entry may be torn down;
                // a duplicate dial must not disturb the original.
                let owned = tables
                    .pending
                    .get(&device_id)
                    .map(|setup| setup.conn_id == conn_id)
                    .unwrap_or(false);

                if owned {
                    tables.pending.remove(&device_id);
                    tables.pending_index.remove(&conn_id);
                    Metrics::bump(&self.metrics.setups_failed);
                    emits.push(Emit::Failed(device_id, conn_id));
                } else if device_hint.is_some() {
                    Metrics::bump(&self.metrics.setups_failed);
                    emits.push(Emit::Failed(device_id, conn_id));
                }
            }

            if tables.unknown.remove(&conn_id).is_some() {
                Metrics::bump(&self.metrics.setups_failed);
            }
        }

        logging::debug!(self.log, "command setup failed";
                        "connection_id" => conn_id,
                        "error" => ?err);

        self.emit_all(emits);
        conn.fail(err);
    }

    /// Fails pending setups older than the deadline.
    pub fn sweep_pending(&self, max_age: Duration) {
        let now = Instant::now();

        let expired: Vec<Weak<Connection>> = {
            let tables = self.tables.lock().expect("Command tables lock poisoned");
            tables
                .pending
                .values()
                .filter(|setup| now.duration_since(setup.created) >= max_age)
                .map(|setup| setup.conn.clone())
                .chain(
                    tables
                        .unknown
                        .values()
                        .filter(|setup| now.duration_since(setup.created) >= max_age)
                        .map(|setup| setup.conn.clone()),
                )
                .collect()
        };

        for conn in expired {
            if let Some(conn) = conn.upgrade() {
                self.fail_setup(&conn, None, ErrorType::Expired);
            }
        }
    }

    /// Resolves pending instructions older than the deadline with a local
    /// failure.
    pub fn sweep_instructions(&self, max_age: Duration) {
        let now = Instant::now();
        let mut emits = Vec::new();

        {
            let mut tables = self.tables.lock().expect("Command tables lock poisoned");

            for (device_id, entry) in tables.established.iter_mut() {
                let expired: Vec<CommandId> = entry
                    .pending_instructions
                    .iter()
                    .filter(|(_, created)| now.duration_since(**created) >= max_age)
                    .map(|(command_id, _)| *command_id)
                    .collect();

                for command_id in expired {
                    entry.pending_instructions.remove(&command_id);
                    emits.push(Emit::InstructionFailed(*device_id, command_id));
                }
            }
        }

        self.emit_all(emits);
    }

    /// Closes established connections whose events counter did not advance
    /// since the previous pass.
    pub fn sweep_idle(&self, max_idle: Duration) {
        let now = Instant::now();

        let idle: Vec<Weak<Connection>> = {
            let mut tables = self.tables.lock().expect("Command tables lock poisoned");
            let mut idle = Vec::new();

            for entry in tables.established.values_mut() {
                let count = entry.conn.upgrade().map(|conn| conn.events_count()).unwrap_or(0);

                if count != entry.last_events_count {
                    entry.last_events_count = count;
                    entry.last_activity = now;
                } else if now.duration_since(entry.last_activity) >= max_idle {
                    idle.push(entry.conn.clone());
                }
            }

            idle
        };

        for conn in idle {
            if let Some(conn) = conn.upgrade() {
                logging::debug!(self.log, "closing idle command connection";
                                "connection_id" => conn.id());
                conn.close();
            }
        }
    }

    /// Drops all state, failing pending setups and instructions.
    pub fn clear(&self) {
        let mut emits = Vec::new();

        {
            let mut tables = self.tables.lock().expect("Command tables lock poisoned");

            let pending: Vec<(DeviceId, ConnectionId)> = tables
                .pending
                .drain()
                .map(|(device_id, setup)| (device_id, setup.conn_id))
                .collect();
            tables.pending_index.clear();
            tables.unknown.clear();

            for (device_id, conn_id) in pending {
                Metrics::bump(&self.metrics.setups_failed);
                emits.push(Emit::Failed(device_id, conn_id));
            }

            let established: Vec<(DeviceId, EstablishedConnection)> =
                tables.established.drain().collect();
            tables.established_index.clear();

            for (device_id, entry) in established {
                for (command_id, _) in entry.pending_instructions {
                    emits.push(Emit::InstructionFailed(device_id, command_id));
                }
                emits.push(Emit::Closed(device_id, entry.conn_id));
            }
        }

        self.emit_all(emits);
    }
}
