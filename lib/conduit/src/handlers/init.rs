//! INIT-role protocol: bootstraps a peer we share no keys with yet, using a
//! short out-of-band password and a transient id. Four messages bring both
//! sides to a completed setup carrying the other peer's connection
//! parameters.

use crate::handlers::packets::{
    self, InitConfirmSecret, InitRequestSecret, InitResponseSecret, InitSetupRequest,
};
use crate::handlers::{MessageAssembler, NewDeviceParams};
use crate::metrics::Metrics;
use crate::net::connection::{Connection, SharedConnection};
use crate::net::support::{
    ConnectionId, ErrorType, NetworkError, NetworkResult, SetupState, TransientConnectionId,
};
use crate::secure::SymmetricCrypto;
use crate::store::PendingInitConfig;
use hashbrown::HashMap;
use solder::crypto::{CipherMode, CryptoProvider, KeyExchange, PbkdfVariant, SymmetricCipher};
use solder::device::{DeviceDirectory, DeviceId, DeviceIpSettings, LocalPeerAuthEntry, PeerRole};
use solder::logging;
use solder::time::timestamp_secs;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Characters used for generated server passwords.
const PASSWORD_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Upward events of the INIT handler.
pub trait InitEvents: Send + Sync {
    fn on_setup_completed(
        &self,
        conn: ConnectionId,
        device: DeviceId,
        transient: TransientConnectionId,
        params: &NewDeviceParams,
    );

    fn on_setup_failed(&self, conn: ConnectionId, transient: TransientConnectionId);
}

#[derive(Clone)]
pub struct InitHandlerConfig {
    pub request_signature_size: usize,
    pub key_exchange: KeyExchange,
    pub default_random_password_size: usize,
    pub max_random_password_attempts: usize,
    pub pbkdf: PbkdfVariant,
    pub pbkdf_iterations: u32,
    pub pbkdf_salt_size: usize,
    pub cipher: SymmetricCipher,
    pub mode: CipherMode,
    pub local_peer_id: DeviceId,
    pub local_peer_role: PeerRole,
    pub local_ip_settings: DeviceIpSettings,
    pub max_message_size: usize,
}

struct LocalSetup {
    state: SetupState,
    config: Arc<PendingInitConfig>,
    crypto: Arc<SymmetricCrypto>,
    nonce: Vec<u8>,
    assembler: MessageAssembler,
    remote_peer: Option<(DeviceId, PeerRole)>,
    params: Option<NewDeviceParams>,
    conn: Weak<Connection>,
    created: Instant,
}

struct RemoteSetup {
    state: SetupState,
    config: Option<Arc<PendingInitConfig>>,
    crypto: Option<Arc<SymmetricCrypto>>,
    nonce: Vec<u8>,
    remote_peer_role: Option<PeerRole>,
    assembler: MessageAssembler,
    conn: Weak<Connection>,
    created: Instant,
}

enum Outcome {
    None,
    Send(Vec<u8>),
    Complete {
        device: DeviceId,
        transient: TransientConnectionId,
        params: NewDeviceParams,
        auth: Option<(DeviceId, LocalPeerAuthEntry)>,
    },
    Fail(TransientConnectionId, ErrorType),
}

type ConfigTake = Box<dyn Fn(TransientConnectionId) -> Option<Arc<PendingInitConfig>> + Send + Sync>;

/// Manages initial connections: key derivation from the shared password, the
/// sealed parameter exchange and emission of new-peer records.
pub struct InitHandler {
    config: InitHandlerConfig,
    provider: Arc<dyn CryptoProvider>,
    directory: Arc<dyn DeviceDirectory>,
    events: Arc<dyn InitEvents>,
    config_take: ConfigTake,
    local: Mutex<HashMap<ConnectionId, LocalSetup>>,
    remote: Mutex<HashMap<ConnectionId, RemoteSetup>>,
    metrics: Arc<Metrics>,
    log: logging::Logger,
}

impl InitHandler {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: InitHandlerConfig,
        provider: Arc<dyn CryptoProvider>,
        directory: Arc<dyn DeviceDirectory>,
        events: Arc<dyn InitEvents>,
        config_take: ConfigTake,
        metrics: Arc<Metrics>,
        log: L,
    ) -> NetworkResult<InitHandler> {
        if !config.pbkdf.is_supported() {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        if config.request_signature_size == 0 || config.pbkdf_salt_size == 0 {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }

        Ok(InitHandler {
            config,
            provider,
            directory,
            events,
            config_take,
            local: Mutex::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
            metrics,
            log: logging::child(log),
        })
    }

    fn derive_crypto(
        &self,
        password: &str,
        salt: &[u8],
        iterations: u32,
        pbkdf: PbkdfVariant,
        cipher: SymmetricCipher,
        mode: CipherMode,
    ) -> NetworkResult<SymmetricCrypto> {
        let key_size = self.provider.key_size(cipher);
        let iv_size = self.provider.iv_size(cipher, mode);

        let mut material = self
            .provider
            .derive_key(pbkdf, password.as_bytes(), salt, iterations, key_size + iv_size)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

        let iv = material.split_off(key_size);

        Ok(SymmetricCrypto::new(self.provider.clone(), cipher, mode, material, iv))
    }

    fn random_nonce(&self) -> Vec<u8> {
        let mut nonce = vec![0u8; self.config.request_signature_size];
        self.provider.random_bytes(&mut nonce);
        nonce
    }

    /// Generates a random password for a remote server peer, retrying on
    /// collision with already assigned ones.
    fn generate_server_password(&self) -> NetworkResult<String> {
        for _ in 0..self.config.max_random_password_attempts {
            let mut raw = vec![0u8; self.config.default_random_password_size];
            self.provider.random_bytes(&mut raw);

            let password: String = raw
                .iter()
                .map(|byte| PASSWORD_ALPHABET[usize::from(*byte) % PASSWORD_ALPHABET.len()] as char)
                .collect();

            if !self.directory.local_peer_password_exists(&password) {
                return Ok(password);
            }
        }

        Err(NetworkError::Fatal(ErrorType::Crypto))
    }

    /// Starts the initiator-side setup on a freshly connected socket.
    pub fn manage_local(&self, conn: &SharedConnection, config: Arc<PendingInitConfig>) {
        logging::debug!(self.log, "managing local init connection";
                        "connection_id" => conn.id(),
                        "transient_id" => config.transient_id);

        Metrics::bump(&self.metrics.setups_started);

        let transient = config.transient_id;
        let outcome = self.start_local(conn, config);
        self.apply(conn, outcome, Some(transient));
    }

    fn start_local(&self, conn: &SharedConnection, config: Arc<PendingInitConfig>) -> Outcome {
        let mut salt = vec![0u8; self.config.pbkdf_salt_size];
        self.provider.random_bytes(&mut salt);

        let crypto = match self.derive_crypto(
            &config.init_password,
            &salt,
            self.config.pbkdf_iterations,
            self.config.pbkdf,
            self.config.cipher,
            self.config.mode,
        ) {
            Ok(crypto) => Arc::new(crypto),
            Err(_) => return Outcome::Fail(config.transient_id, ErrorType::Crypto),
        };

        let nonce = self.random_nonce();

        let secret = InitRequestSecret {
            nonce: nonce.clone(),
            transient_id: config.transient_id,
            peer_role: self.config.local_peer_role,
        };

        let sealed = match packets::to_vec(&secret).and_then(|plain| crypto.seal_message(&plain)) {
            Ok(sealed) => sealed,
            Err(_) => return Outcome::Fail(config.transient_id, ErrorType::Crypto),
        };

        let request = InitSetupRequest {
            transient_id: config.transient_id,
            salt,
            iterations: self.config.pbkdf_iterations,
            pbkdf: self.config.pbkdf,
            cipher: self.config.cipher,
            mode: self.config.mode,
            sealed,
        };

        let message = match packets::to_vec(&request) {
            Ok(message) => message,
            Err(_) => return Outcome::Fail(config.transient_id, ErrorType::Serialization),
        };

        let transient = config.transient_id;

        self.local.lock().expect("Local table lock poisoned").insert(
            conn.id(),
            LocalSetup {
                state: SetupState::RequestSent,
                config,
                crypto,
                nonce,
                assembler: MessageAssembler::new(self.config.max_message_size),
                remote_peer: None,
                params: None,
                conn: Arc::downgrade(conn),
                created: Instant::now(),
            },
        );

        conn.enable_data_events();

        logging::debug!(self.log, "init request prepared";
                        "connection_id" => conn.id(),
                        "transient_id" => transient);

        Outcome::Send(message)
    }

    /// Starts the responder-side setup on an accepted socket. The pending
    /// configuration is located once the first message arrives.
    pub fn manage_remote(&self, conn: &SharedConnection) {
        logging::debug!(self.log, "managing remote init connection";
                        "connection_id" => conn.id());

        Metrics::bump(&self.metrics.setups_started);

        self.remote.lock().expect("Remote table lock poisoned").insert(
            conn.id(),
            RemoteSetup {
                state: SetupState::Initiated,
                config: None,
                crypto: None,
                nonce: Vec::new(),
                remote_peer_role: None,
                assembler: MessageAssembler::new(self.config.max_message_size),
                conn: Arc::downgrade(conn),
                created: Instant::now(),
            },
        );

        conn.enable_data_events();
    }

    /// Routes a received message chunk into the side-specific state machine.
    pub fn handle_data(&self, conn: &SharedConnection, data: Vec<u8>, remaining: u64) {
        let conn_id = conn.id();

        if self.local.lock().expect("Local table lock poisoned").contains_key(&conn_id) {
            let outcome = self.local_data(conn_id, data, remaining);
            self.apply(conn, outcome, None);
            return;
        }

        if self.remote.lock().expect("Remote table lock poisoned").contains_key(&conn_id) {
            let outcome = self.remote_data(conn, data, remaining);
            self.apply(conn, outcome, None);
        }
    }

    fn local_data(&self, conn_id: ConnectionId, data: Vec<u8>, remaining: u64) -> Outcome {
        let mut table = self.local.lock().expect("Local table lock poisoned");
        let setup = match table.get_mut(&conn_id) {
            Some(setup) => setup,
            None => return Outcome::None,
        };

        let message = match setup.assembler.push(data, remaining) {
            Ok(Some(message)) => message,
            Ok(None) => return Outcome::None,
            Err(NetworkError::Fatal(err)) => return Outcome::Fail(setup.config.transient_id, err),
            Err(NetworkError::Wait) => return Outcome::None,
        };

        match setup.state {
            SetupState::RequestSent | SetupState::RequestSentConfirmed => {}
            _ => return Outcome::Fail(setup.config.transient_id, ErrorType::InvalidSetupState),
        }

        // Message 2: the responder's identity, sealed with the derived key.
        let response: InitResponseSecret = match setup
            .crypto
            .open_message(&message)
            .and_then(|plain| packets::from_slice(&plain))
        {
            Ok(response) => response,
            Err(_) => return Outcome::Fail(setup.config.transient_id, ErrorType::Crypto),
        };

        if response.nonce_echo != setup.nonce {
            return Outcome::Fail(setup.config.transient_id, ErrorType::SignatureMismatch);
        }

        if response.peer_role != setup.config.remote_peer_role {
            return Outcome::Fail(setup.config.transient_id, ErrorType::InvalidSetupState);
        }

        // A server peer gets a dedicated generated password for future
        // COMMAND connections; it travels in the confirmation message.
        let server_password = if response.peer_role == PeerRole::Server {
            match self.generate_server_password() {
                Ok(password) => Some(password),
                Err(_) => return Outcome::Fail(setup.config.transient_id, ErrorType::Crypto),
            }
        } else {
            None
        };

        let confirm = InitConfirmSecret {
            nonce_echo: response.nonce,
            device_id: self.config.local_peer_id,
            public_key: self.provider.local_public_key(),
            ip_settings: self.config.local_ip_settings.clone(),
            server_password: server_password.clone(),
        };

        let message = match packets::to_vec(&confirm)
            .and_then(|plain| setup.crypto.seal_message(&plain))
        {
            Ok(message) => message,
            Err(_) => return Outcome::Fail(setup.config.transient_id, ErrorType::Crypto),
        };

        setup.state = SetupState::ResponseReceived;
        setup.remote_peer = Some((response.device_id, response.peer_role));
        setup.params = Some(NewDeviceParams {
            ip_settings: response.ip_settings,
            raw_password: server_password
                .unwrap_or_else(|| setup.config.init_password.clone()),
            public_key: response.public_key,
            expected_key_exchange: self.config.key_exchange,
            peer_role: response.peer_role,
        });

        Outcome::Send(message)
    }

    fn remote_data(&self, conn: &SharedConnection, data: Vec<u8>, remaining: u64) -> Outcome {
        let conn_id = conn.id();
        let mut table = self.remote.lock().expect("Remote table lock poisoned");
        let setup = match table.get_mut(&conn_id) {
            Some(setup) => setup,
            None => return Outcome::None,
        };

        let message = match setup.assembler.push(data, remaining) {
            Ok(Some(message)) => message,
            Ok(None) => return Outcome::None,
            Err(NetworkError::Fatal(err)) => return Outcome::Fail(0, err),
            Err(NetworkError::Wait) => return Outcome::None,
        };

        match setup.state {
            // Message 1: locate the pending configuration, derive the key
            // and answer with our identity.
            SetupState::Initiated => {
                let request: InitSetupRequest = match packets::from_slice(&message) {
                    Ok(request) => request,
                    Err(_) => return Outcome::Fail(0, ErrorType::Serialization),
                };

                if !request.pbkdf.is_supported() {
                    return Outcome::Fail(request.transient_id, ErrorType::Crypto);
                }

                if request.iterations < self.provider.min_pbkdf_iterations() {
                    return Outcome::Fail(request.transient_id, ErrorType::Crypto);
                }

                let config = match (self.config_take)(request.transient_id) {
                    Some(config) => config,
                    None => return Outcome::Fail(request.transient_id, ErrorType::NotFound),
                };

                let crypto = match self.derive_crypto(
                    &config.init_password,
                    &request.salt,
                    request.iterations,
                    request.pbkdf,
                    request.cipher,
                    request.mode,
                ) {
                    Ok(crypto) => Arc::new(crypto),
                    Err(_) => return Outcome::Fail(request.transient_id, ErrorType::Crypto),
                };

                let secret: InitRequestSecret = match crypto
                    .open_message(&request.sealed)
                    .and_then(|plain| packets::from_slice(&plain))
                {
                    Ok(secret) => secret,
                    Err(_) => return Outcome::Fail(request.transient_id, ErrorType::Crypto),
                };

                if secret.transient_id != request.transient_id {
                    return Outcome::Fail(request.transient_id, ErrorType::SignatureMismatch);
                }

                if secret.peer_role != config.remote_peer_role {
                    return Outcome::Fail(request.transient_id, ErrorType::InvalidSetupState);
                }

                let nonce = self.random_nonce();

                let response = InitResponseSecret {
                    nonce_echo: secret.nonce,
                    nonce: nonce.clone(),
                    device_id: self.config.local_peer_id,
                    public_key: self.provider.local_public_key(),
                    ip_settings: self.config.local_ip_settings.clone(),
                    peer_role: self.config.local_peer_role,
                };

                let message = match packets::to_vec(&response)
                    .and_then(|plain| crypto.seal_message(&plain))
                {
                    Ok(message) => message,
                    Err(_) => return Outcome::Fail(request.transient_id, ErrorType::Crypto),
                };

                setup.state = SetupState::ResponseSent;
                setup.config = Some(config);
                setup.crypto = Some(crypto);
                setup.nonce = nonce;
                setup.remote_peer_role = Some(secret.peer_role);

                Outcome::Send(message)
            }
            // Message 3: the initiator's identity; completes the setup.
            SetupState::ResponseSent | SetupState::ResponseSentConfirmed => {
                let config = setup.config.clone().expect("Responder config must be set");
                let crypto = setup.crypto.clone().expect("Responder crypto must be set");

                let confirm: InitConfirmSecret = match crypto
                    .open_message(&message)
                    .and_then(|plain| packets::from_slice(&plain))
                {
                    Ok(confirm) => confirm,
                    Err(_) => return Outcome::Fail(config.transient_id, ErrorType::Crypto),
                };

                if confirm.nonce_echo != setup.nonce {
                    return Outcome::Fail(config.transient_id, ErrorType::SignatureMismatch);
                }

                let remote_peer_role = setup
                    .remote_peer_role
                    .expect("Remote peer role must be recorded");

                let auth = confirm.server_password.as_ref().map(|password| {
                    (
                        confirm.device_id,
                        LocalPeerAuthEntry {
                            password: password.clone(),
                            created: timestamp_secs(),
                        },
                    )
                });

                let params = NewDeviceParams {
                    ip_settings: confirm.ip_settings,
                    raw_password: confirm
                        .server_password
                        .unwrap_or_else(|| config.init_password.clone()),
                    public_key: confirm.public_key,
                    expected_key_exchange: self.config.key_exchange,
                    peer_role: remote_peer_role,
                };

                setup.state = SetupState::Completed;

                Outcome::Complete {
                    device: confirm.device_id,
                    transient: config.transient_id,
                    params,
                    auth,
                }
            }
            _ => Outcome::Fail(
                setup.config.as_ref().map(|config| config.transient_id).unwrap_or(0),
                ErrorType::InvalidSetupState,
            ),
        }
    }

    /// Advances the write confirmation states. The initiator completes once
    /// its confirmation message is on the wire.
    pub fn handle_write_result(&self, conn: &SharedConnection, sent: bool) {
        let conn_id = conn.id();

        if !sent {
            self.handle_disconnect(conn);
            return;
        }

        let (known_local, completed) = {
            let mut table = self.local.lock().expect("Local table lock poisoned");
            match table.get_mut(&conn_id) {
                Some(setup) => match setup.state {
                    SetupState::RequestSent => {
                        setup.state = SetupState::RequestSentConfirmed;
                        (true, None)
                    }
                    SetupState::ResponseReceived => {
                        setup.state = SetupState::Completed;
                        let (device, _) = setup.remote_peer.expect("Remote peer must be recorded");
                        let params = setup.params.clone().expect("Params must be recorded");
                        (true, Some((device, setup.config.transient_id, params)))
                    }
                    _ => (true, None),
                },
                None => (false, None),
            }
        };

        if !known_local {
            let mut table = self.remote.lock().expect("Remote table lock poisoned");
            if let Some(setup) = table.get_mut(&conn_id) {
                if setup.state == SetupState::ResponseSent {
                    setup.state = SetupState::ResponseSentConfirmed;
                }
            }
        }

        if let Some((device, transient, params)) = completed {
            let auth = params_auth_entry(&device, &params);
            self.finish(conn, device, transient, params, auth);
        }
    }

    /// A disconnect before completion fails the setup.
    pub fn handle_disconnect(&self, conn: &SharedConnection) {
        let conn_id = conn.id();

        let local = {
            let mut table = self.local.lock().expect("Local table lock poisoned");
            table.remove(&conn_id)
        };

        let failed = match local {
            Some(setup) if setup.state != SetupState::Completed => Some(setup.config.transient_id),
            Some(_) => None,
            None => {
                let removed = {
                    let mut table = self.remote.lock().expect("Remote table lock poisoned");
                    table.remove(&conn_id)
                };

                match removed {
                    Some(setup) if setup.state != SetupState::Completed => Some(
                        setup
                            .config
                            .as_ref()
                            .map(|config| config.transient_id)
                            .unwrap_or(0),
                    ),
                    _ => None,
                }
            }
        };

        if let Some(transient) = failed {
            logging::debug!(self.log, "init setup failed on disconnect";
                            "connection_id" => conn_id,
                            "transient_id" => transient);
            Metrics::bump(&self.metrics.setups_failed);
            self.events.on_setup_failed(conn_id, transient);
        }
    }

    fn apply(&self, conn: &SharedConnection, outcome: Outcome, fallback_transient: Option<TransientConnectionId>) {
        match outcome {
            Outcome::None => {}
            Outcome::Send(message) => {
                if conn.send(&message).is_err() {
                    let transient = fallback_transient.unwrap_or_else(|| self.transient_of(conn.id()));
                    self.fail_connection(conn, transient, ErrorType::Shutdown);
                }
            }
            Outcome::Complete {
                device,
                transient,
                params,
                auth,
            } => self.finish(conn, device, transient, params, auth),
            Outcome::Fail(transient, err) => self.fail_connection(conn, transient, err),
        }
    }

    fn transient_of(&self, conn_id: ConnectionId) -> TransientConnectionId {
        if let Some(setup) = self.local.lock().expect("Local table lock poisoned").get(&conn_id) {
            return setup.config.transient_id;
        }

        self.remote
            .lock()
            .expect("Remote table lock poisoned")
            .get(&conn_id)
            .and_then(|setup| setup.config.as_ref().map(|config| config.transient_id))
            .unwrap_or(0)
    }

    fn finish(
        &self,
        conn: &SharedConnection,
        device: DeviceId,
        transient: TransientConnectionId,
        params: NewDeviceParams,
        auth: Option<(DeviceId, LocalPeerAuthEntry)>,
    ) {
        let conn_id = conn.id();

        self.local.lock().expect("Local table lock poisoned").remove(&conn_id);
        self.remote.lock().expect("Remote table lock poisoned").remove(&conn_id);

        if let Some((auth_device, entry)) = auth {
            self.directory.add_local_peer_auth(auth_device, entry);
        }

        logging::info!(self.log, "init setup completed";
                       "connection_id" => conn_id,
                       "device" => %device,
                       "transient_id" => transient,
                       "peer_role" => %params.peer_role);

        Metrics::bump(&self.metrics.setups_completed);
        self.events.on_setup_completed(conn_id, device, transient, &params);

        // The bootstrap channel has served its purpose.
        conn.close();
    }

    fn fail_connection(&self, conn: &SharedConnection, transient: TransientConnectionId, err: ErrorType) {
        let conn_id = conn.id();

        logging::debug!(self.log, "init setup failed";
                        "connection_id" => conn_id,
                        "transient_id" => transient,
                        "error" => ?err);

        self.local.lock().expect("Local table lock poisoned").remove(&conn_id);
        self.remote.lock().expect("Remote table lock poisoned").remove(&conn_id);

        Metrics::bump(&self.metrics.setups_failed);
        self.events.on_setup_failed(conn_id, transient);
        conn.fail(err);
    }

    /// Fails all pending setups older than the deadline. Invoked by the
    /// housekeeping sweep.
    pub fn sweep_pending(&self, max_age: Duration) {
        let now = Instant::now();
        let mut expired: Vec<(ConnectionId, TransientConnectionId, Weak<Connection>)> = Vec::new();

        {
            let table = self.local.lock().expect("Local table lock poisoned");
            expired.extend(
                table
                    .iter()
                    .filter(|(_, setup)| now.duration_since(setup.created) >= max_age)
                    .map(|(conn_id, setup)| {
                        (*conn_id, setup.config.transient_id, setup.conn.clone())
                    }),
            );
        }
        {
            let table = self.remote.lock().expect("Remote table lock poisoned");
            expired.extend(
                table
                    .iter()
                    .filter(|(_, setup)| now.duration_since(setup.created) >= max_age)
                    .map(|(conn_id, setup)| {
                        (
                            *conn_id,
                            setup.config.as_ref().map(|config| config.transient_id).unwrap_or(0),
                            setup.conn.clone(),
                        )
                    }),
            );
        }

        for (conn_id, transient, conn) in expired {
            match conn.upgrade() {
                Some(conn) => self.fail_connection(&conn, transient, ErrorType::Expired),
                None => {
                    self.local.lock().expect("Local table lock poisoned").remove(&conn_id);
                    self.remote.lock().expect("Remote table lock poisoned").remove(&conn_id);
                    Metrics::bump(&self.metrics.setups_failed);
                    self.events.on_setup_failed(conn_id, transient);
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.local.lock().expect("Local table lock poisoned").len()
            + self.remote.lock().expect("Remote table lock poisoned").len()
    }

    /// Drops all pending state, failing the affected setups.
    pub fn clear(&self) {
        let local: Vec<(ConnectionId, TransientConnectionId)> = {
            let mut table = self.local.lock().expect("Local table lock poisoned");
            table
                .drain()
                .map(|(conn_id, setup)| (conn_id, setup.config.transient_id))
                .collect()
        };

        let remote: Vec<(ConnectionId, TransientConnectionId)> = {
            let mut table = self.remote.lock().expect("Remote table lock poisoned");
            table
                .drain()
                .map(|(conn_id, setup)| {
                    (
                        conn_id,
                        setup.config.as_ref().map(|config| config.transient_id).unwrap_or(0),
                    )
                })
                .collect()
        };

        for (conn_id, transient) in local.into_iter().chain(remote) {
            Metrics::bump(&self.metrics.setups_failed);
            self.events.on_setup_failed(conn_id, transient);
        }
    }
}

/// The auth entry the initiator registers when it generated a password for a
/// server peer.
fn params_auth_entry(device: &DeviceId, params: &NewDeviceParams) -> Option<(DeviceId, LocalPeerAuthEntry)> {
    if params.peer_role == PeerRole::Server {
        Some((
            *device,
            LocalPeerAuthEntry {
                password: params.raw_password.clone(),
                created: timestamp_secs(),
            },
        ))
    } else {
        None
    }
}
