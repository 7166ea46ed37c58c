use crate::net::connection::{Connection, ConnectionEvents, ConnectionSettings, SharedConnection};
use crate::net::support::{
    ConnectionInitiation, ConnectionManagerId, ConnectionRole, ConnectionState, ErrorType,
    NetworkError, NetworkResult, RawConnectionId, StatCounter,
};
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use solder::device::PeerRole;
use solder::logging;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: mio::Token = mio::Token(0);
const WAKE_TOKEN: mio::Token = mio::Token(1);
/// Connection tokens start past the reserved ones.
const TOKEN_OFFSET: usize = 2;

/// Poll timeout; also bounds the housekeeping latency.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Interval between destruction reaper passes.
const REAPER_INTERVAL: Duration = Duration::from_secs(5);
/// Back-off while spinning on a contended table lock.
const MUTEX_WAIT_INTERVAL: Duration = Duration::from_millis(5);
/// How long teardown waits for in-flight handlers before force-dropping.
const DESTROY_WAIT_DEADLINE: Duration = Duration::from_secs(5);

/// Cross-thread wakeup for a manager's poll loop. Connections mark
/// themselves dirty when new egress is queued from outside the loop.
pub struct WakeHandle {
    readiness: mio::SetReadiness,
    dirty: Mutex<Vec<RawConnectionId>>,
}

impl WakeHandle {
    fn new(readiness: mio::SetReadiness) -> WakeHandle {
        WakeHandle {
            readiness,
            dirty: Mutex::new(Vec::new()),
        }
    }

    /// Flags a connection for a flush pass and wakes the loop.
    pub(crate) fn mark_dirty(&self, raw_id: RawConnectionId) {
        self.dirty.lock().expect("Dirty list lock poisoned").push(raw_id);
        drop(self.readiness.set_readiness(mio::Ready::readable()));
    }

    /// Wakes the loop without flagging any connection.
    fn wake(&self) {
        drop(self.readiness.set_readiness(mio::Ready::readable()));
    }

    fn drain(&self) -> Vec<RawConnectionId> {
        let mut dirty = self.dirty.lock().expect("Dirty list lock poisoned");
        drop(self.readiness.set_readiness(mio::Ready::empty()));
        dirty.drain(..).collect()
    }
}

/// Per-listener configuration.
#[derive(Clone, Debug)]
pub struct ManagerSettings {
    pub id: ConnectionManagerId,
    pub role: ConnectionRole,
    pub local_peer_role: PeerRole,
    pub bind_addr: String,
    pub bind_port: u16,
    /// `0` means unbounded.
    pub max_active_connections: usize,
    /// Seconds an inbound connection has to deliver its intent frame;
    /// `0` disables the deadline.
    pub request_timeout_secs: u64,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

/// Aggregate per-manager counters.
#[derive(Debug, Default, Copy, Clone)]
pub struct ManagerStats {
    pub connections_initiated: StatCounter,
    pub connections_accepted: StatCounter,
    pub initiations_failed: StatCounter,
}

struct ManagerShared {
    settings: ManagerSettings,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    poll: mio::Poll,
    wake: Arc<WakeHandle>,
    events_sink: Arc<dyn ConnectionEvents>,

    connection_ids: Arc<AtomicU64>,
    raw_ids: AtomicU64,
    stop: AtomicBool,

    incoming: Mutex<HashMap<RawConnectionId, SharedConnection>>,
    outgoing: Mutex<HashMap<RawConnectionId, SharedConnection>>,
    dial_requests: Mutex<Vec<SocketAddr>>,
    request_timers: Mutex<HashMap<RawConnectionId, Instant>>,
    destruction: Mutex<VecDeque<SharedConnection>>,

    initiated: AtomicU64,
    accepted: AtomicU64,
    failed_initiations: AtomicU64,

    log: logging::Logger,
}

/// One listener endpoint: accepts inbound and dials outbound connections of
/// a single role, owns their sockets and drives all their I/O from a
/// dedicated poll-loop thread.
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
    // The wake registration must outlive the poll loop.
    _wake_registration: mio::Registration,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Binds the listener endpoint. The manager does not accept or dial
    /// until `start` is called.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        settings: ManagerSettings,
        events_sink: Arc<dyn ConnectionEvents>,
        connection_ids: Arc<AtomicU64>,
        log: L,
    ) -> NetworkResult<ConnectionManager> {
        let bind_addr: SocketAddr =
            format!("{}:{}", settings.bind_addr, settings.bind_port).parse()?;

        let listener = TcpListener::bind(&bind_addr)?;
        let local_addr = listener.local_addr()?;

        let poll = mio::Poll::new()?;
        poll.register(
            &listener,
            LISTENER_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        let (wake_registration, readiness) = mio::Registration::new2();
        poll.register(
            &wake_registration,
            WAKE_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        let log = logging::child(log);

        logging::debug!(log, "connection manager bound";
                        "manager" => settings.id,
                        "role" => %settings.role,
                        "address" => %local_addr);

        let shared = Arc::new(ManagerShared {
            settings,
            local_addr,
            listener: Mutex::new(Some(listener)),
            poll,
            wake: Arc::new(WakeHandle::new(readiness)),
            events_sink,
            connection_ids,
            raw_ids: AtomicU64::new(1),
            stop: AtomicBool::new(false),
            incoming: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            dial_requests: Mutex::new(Vec::new()),
            request_timers: Mutex::new(HashMap::new()),
            destruction: Mutex::new(VecDeque::new()),
            initiated: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            failed_initiations: AtomicU64::new(0),
            log,
        });

        Ok(ConnectionManager {
            shared,
            _wake_registration: wake_registration,
            worker: Mutex::new(None),
        })
    }

    /// Spawns the poll-loop worker.
    pub fn start(&self) -> NetworkResult<()> {
        let mut worker = self.worker.lock().expect("Worker handle lock poisoned");

        if worker.is_some() {
            return Err(NetworkError::Fatal(ErrorType::Duplicate));
        }

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("conduit-manager-{}", self.shared.settings.id))
            .spawn(move || shared.run())
            .map_err(|err| NetworkError::Fatal(ErrorType::Io(err.kind())))?;

        *worker = Some(handle);
        Ok(())
    }

    /// Stops the manager: closes the acceptor, tears down all connections
    /// and joins the worker thread.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.wake();

        if let Some(handle) = self.worker.lock().expect("Worker handle lock poisoned").take() {
            drop(handle.join());
        }
    }

    /// Requests an outbound connection. Completion is reported through the
    /// event sink as either `on_connect` or `on_initiation_failed`.
    pub fn dial(&self, addr: SocketAddr) -> NetworkResult<()> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(NetworkError::Fatal(ErrorType::Shutdown));
        }

        self.shared
            .dial_requests
            .lock()
            .expect("Dial queue lock poisoned")
            .push(addr);
        self.shared.wake.wake();
        Ok(())
    }

    /// Looks a live connection up by its raw id.
    pub fn connection(&self, raw_id: RawConnectionId) -> Option<SharedConnection> {
        if let Some(conn) = self
            .shared
            .incoming
            .lock()
            .expect("Incoming table lock poisoned")
            .get(&raw_id)
        {
            return Some(conn.clone());
        }

        self.shared
            .outgoing
            .lock()
            .expect("Outgoing table lock poisoned")
            .get(&raw_id)
            .cloned()
    }

    #[inline]
    pub fn id(&self) -> ConnectionManagerId {
        self.shared.settings.id
    }

    #[inline]
    pub fn role(&self) -> ConnectionRole {
        self.shared.settings.role
    }

    /// The bound listener address (useful when binding to port 0).
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            connections_initiated: self.shared.initiated.load(Ordering::Relaxed),
            connections_accepted: self.shared.accepted.load(Ordering::Relaxed),
            initiations_failed: self.shared.failed_initiations.load(Ordering::Relaxed),
        }
    }

    /// Number of live connections across both tables.
    pub fn active_connections(&self) -> usize {
        let incoming = self
            .shared
            .incoming
            .lock()
            .expect("Incoming table lock poisoned")
            .len();
        let outgoing = self
            .shared
            .outgoing
            .lock()
            .expect("Outgoing table lock poisoned")
            .len();
        incoming + outgoing
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ManagerShared {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Acquires a table lock with bounded back-off, giving up when the
    /// manager is stopping so shutdown is never blocked on a table.
    fn lock_with_backoff<'a, T>(&self, mutex: &'a Mutex<T>) -> Option<MutexGuard<'a, T>> {
        loop {
            match mutex.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::WouldBlock) => {
                    if self.stopping() {
                        return None;
                    }
                    thread::sleep(MUTEX_WAIT_INTERVAL);
                }
                Err(TryLockError::Poisoned(_)) => panic!("Table lock poisoned"),
            }
        }
    }

    fn run(self: Arc<Self>) {
        let mut events = mio::Events::with_capacity(1024);
        let mut pending_dials: HashMap<RawConnectionId, (TcpStream, SocketAddr)> = HashMap::new();
        let mut last_reaper_pass = Instant::now();

        logging::debug!(self.log, "manager worker started"; "manager" => self.settings.id);

        while !self.stopping() {
            if self
                .poll
                .poll(&mut events, Some(POLL_INTERVAL))
                .is_err()
            {
                break;
            }

            for event in &events {
                match event.token() {
                    LISTENER_TOKEN => self.accept_loop(),
                    WAKE_TOKEN => {}
                    token => {
                        let raw_id = (token.0 - TOKEN_OFFSET) as RawConnectionId;

                        if let Some((stream, addr)) = pending_dials.remove(&raw_id) {
                            self.complete_dial(raw_id, stream, addr, &mut pending_dials);
                            continue;
                        }

                        if let Some(conn) = self.lookup(raw_id) {
                            if event.readiness().is_readable() {
                                conn.handle_readable();
                            }
                            if event.readiness().is_writable() && !conn.is_closed() {
                                conn.handle_writable();
                            }
                            self.retire_if_closed(raw_id, &conn);
                        }
                    }
                }
            }

            // Flush connections with freshly queued egress.
            for raw_id in self.wake.drain() {
                if let Some(conn) = self.lookup(raw_id) {
                    if !conn.is_closed() {
                        conn.handle_writable();
                    }
                    self.retire_if_closed(raw_id, &conn);
                }
            }

            // Initiate requested dials.
            let requests: Vec<SocketAddr> = {
                let mut queue = self.dial_requests.lock().expect("Dial queue lock poisoned");
                queue.drain(..).collect()
            };
            for addr in requests {
                self.initiate_dial(addr, &mut pending_dials);
            }

            self.expire_request_timers();

            if last_reaper_pass.elapsed() >= REAPER_INTERVAL {
                self.reaper_pass();
                last_reaper_pass = Instant::now();
            }
        }

        self.shutdown_sequence(pending_dials);
    }

    fn lookup(&self, raw_id: RawConnectionId) -> Option<SharedConnection> {
        if let Some(guard) = self.lock_with_backoff(&self.incoming) {
            if let Some(conn) = guard.get(&raw_id) {
                return Some(conn.clone());
            }
        }

        self.lock_with_backoff(&self.outgoing)
            .and_then(|guard| guard.get(&raw_id).cloned())
    }

    fn accept_loop(&self) {
        loop {
            if self.stopping() {
                return;
            }

            let listener = self.listener.lock().expect("Listener lock poisoned");
            let accepted = match listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            drop(listener);

            match accepted {
                Ok((stream, addr)) => {
                    let at_capacity = self.settings.max_active_connections > 0
                        && self.active_count() >= self.settings.max_active_connections;

                    if at_capacity {
                        logging::debug!(self.log, "connection limit reached, dropping accept";
                                        "manager" => self.settings.id,
                                        "remote" => %addr);
                        drop(stream);
                        continue;
                    }

                    self.create_remote_connection(stream, addr);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::error!(self.log, "accept failed";
                                    "manager" => self.settings.id,
                                    "error" => %err);
                    return;
                }
            }
        }
    }

    fn active_count(&self) -> usize {
        let incoming = self
            .lock_with_backoff(&self.incoming)
            .map(|guard| guard.len())
            .unwrap_or(0);
        let outgoing = self
            .lock_with_backoff(&self.outgoing)
            .map(|guard| guard.len())
            .unwrap_or(0);
        incoming + outgoing
    }

    fn next_raw_id(&self) -> RawConnectionId {
        self.raw_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn connection_settings(
        &self,
        raw_id: RawConnectionId,
        initiation: ConnectionInitiation,
        remote_addr: SocketAddr,
    ) -> ConnectionSettings {
        ConnectionSettings {
            id: self.connection_ids.fetch_add(1, Ordering::Relaxed),
            raw_id,
            manager: self.settings.id,
            role: self.settings.role,
            local_peer_role: self.settings.local_peer_role,
            initiation,
            remote_addr,
            read_buffer_size: self.settings.read_buffer_size,
            write_buffer_size: self.settings.write_buffer_size,
        }
    }

    fn create_remote_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let raw_id = self.next_raw_id();
        self.accepted.fetch_add(1, Ordering::Relaxed);

        let conn = Connection::inbound(
            stream,
            self.connection_settings(raw_id, ConnectionInitiation::Remote, addr),
            Some(self.wake.clone()),
            &self.log,
        );

        if conn
            .register(&self.poll, mio::Token(raw_id as usize + TOKEN_OFFSET))
            .is_err()
        {
            logging::error!(self.log, "failed to register accepted connection";
                            "manager" => self.settings.id,
                            "raw_id" => raw_id);
            conn.close();
            return;
        }

        match self.lock_with_backoff(&self.incoming) {
            Some(mut guard) => {
                guard.insert(raw_id, conn.clone());
            }
            None => return,
        }

        if self.settings.request_timeout_secs > 0 {
            let deadline = Instant::now() + Duration::from_secs(self.settings.request_timeout_secs);
            self.request_timers
                .lock()
                .expect("Timer table lock poisoned")
                .insert(raw_id, deadline);
        }

        conn.set_event_sink(self.events_sink.clone());
        conn.enable_lifecycle_events();

        // The intent frame may already be buffered by the kernel.
        conn.handle_readable();
        self.retire_if_closed(raw_id, &conn);
    }

    fn initiate_dial(
        &self,
        addr: SocketAddr,
        pending_dials: &mut HashMap<RawConnectionId, (TcpStream, SocketAddr)>,
    ) {
        if self.stopping() {
            return;
        }

        let raw_id = self.next_raw_id();

        let stream = match TcpStream::connect(&addr) {
            Ok(stream) => stream,
            Err(err) => {
                self.failed_initiations.fetch_add(1, Ordering::Relaxed);
                self.events_sink
                    .on_initiation_failed(self.settings.id, addr, err.kind());
                return;
            }
        };

        let registered = self.poll.register(
            &stream,
            mio::Token(raw_id as usize + TOKEN_OFFSET),
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        );

        if let Err(err) = registered {
            self.failed_initiations.fetch_add(1, Ordering::Relaxed);
            self.events_sink
                .on_initiation_failed(self.settings.id, addr, err.kind());
            return;
        }

        pending_dials.insert(raw_id, (stream, addr));
    }

    fn complete_dial(
        &self,
        raw_id: RawConnectionId,
        stream: TcpStream,
        addr: SocketAddr,
        pending_dials: &mut HashMap<RawConnectionId, (TcpStream, SocketAddr)>,
    ) {
        // A connect error surfaces through take_error once the socket
        // signals readiness.
        let error = match stream.take_error() {
            Ok(error) => error,
            Err(err) => Some(err),
        };

        if let Some(err) = error {
            logging::debug!(self.log, "outbound connection failed";
                            "manager" => self.settings.id,
                            "remote" => %addr,
                            "error" => %err);

            drop(self.poll.deregister(&stream));
            self.failed_initiations.fetch_add(1, Ordering::Relaxed);
            self.events_sink
                .on_initiation_failed(self.settings.id, addr, err.kind());
            return;
        }

        // Not connected yet: peer_addr fails while the connect is still in
        // flight, so put the socket back and wait for the next readiness.
        if stream.peer_addr().is_err() {
            pending_dials.insert(raw_id, (stream, addr));
            return;
        }

        self.initiated.fetch_add(1, Ordering::Relaxed);

        let conn = Connection::outbound(
            stream,
            self.connection_settings(raw_id, ConnectionInitiation::Local, addr),
            Some(self.wake.clone()),
            &self.log,
        );

        match self.lock_with_backoff(&self.outgoing) {
            Some(mut guard) => {
                guard.insert(raw_id, conn.clone());
            }
            None => return,
        }

        conn.set_event_sink(self.events_sink.clone());
        conn.enable_lifecycle_events();

        // The socket is writable: flush the intent frame immediately.
        conn.handle_writable();
        self.retire_if_closed(raw_id, &conn);
    }

    /// Moves a closed connection from the live tables to the destruction
    /// queue. Safe to call repeatedly.
    fn retire_if_closed(&self, raw_id: RawConnectionId, conn: &SharedConnection) {
        if !conn.is_closed() {
            return;
        }

        let removed = match conn.initiation() {
            ConnectionInitiation::Remote => self
                .lock_with_backoff(&self.incoming)
                .and_then(|mut guard| guard.remove(&raw_id)),
            ConnectionInitiation::Local => self
                .lock_with_backoff(&self.outgoing)
                .and_then(|mut guard| guard.remove(&raw_id)),
        };

        if let Some(conn) = removed {
            drop(conn.deregister(&self.poll));
            self.request_timers
                .lock()
                .expect("Timer table lock poisoned")
                .remove(&raw_id);
            self.destruction
                .lock()
                .expect("Destruction queue lock poisoned")
                .push_back(conn);
        }
    }

    /// Tears down inbound connections that did not deliver their intent
    /// frame in time.
    fn expire_request_timers(&self) {
        let now = Instant::now();

        let expired: Vec<RawConnectionId> = {
            let mut timers = self.request_timers.lock().expect("Timer table lock poisoned");
            let expired: Vec<RawConnectionId> = timers
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(raw_id, _)| *raw_id)
                .collect();

            for raw_id in &expired {
                timers.remove(raw_id);
            }

            expired
        };

        for raw_id in expired {
            if let Some(conn) = self.lookup(raw_id) {
                // The timer may race the intent arrival; an established
                // connection is left alone.
                if conn.state() == ConnectionState::Invalid && !conn.is_closed() {
                    logging::debug!(self.log, "intent frame deadline expired";
                                    "manager" => self.settings.id,
                                    "raw_id" => raw_id);
                    conn.fail(ErrorType::Expired);
                }
                self.retire_if_closed(raw_id, &conn);
            }
        }
    }

    /// Drops destroyable connections, retaining any with in-flight handler
    /// callouts for a later pass.
    fn reaper_pass(&self) {
        let mut queue = self.destruction.lock().expect("Destruction queue lock poisoned");
        let retained: VecDeque<SharedConnection> = queue
            .drain(..)
            .filter(|conn| !conn.can_be_dropped())
            .collect();
        *queue = retained;
    }

    /// Shutdown order: acceptor, incoming, outgoing, pending work, queue.
    fn shutdown_sequence(&self, pending_dials: HashMap<RawConnectionId, (TcpStream, SocketAddr)>) {
        logging::debug!(self.log, "manager stopping"; "manager" => self.settings.id);

        drop(self.listener.lock().expect("Listener lock poisoned").take());

        let incoming: Vec<SharedConnection> = {
            let mut guard = self.incoming.lock().expect("Incoming table lock poisoned");
            guard.drain().map(|(_, conn)| conn).collect()
        };
        for conn in incoming {
            conn.close();
            drop(conn.deregister(&self.poll));
        }

        let outgoing: Vec<SharedConnection> = {
            let mut guard = self.outgoing.lock().expect("Outgoing table lock poisoned");
            guard.drain().map(|(_, conn)| conn).collect()
        };
        for conn in outgoing {
            conn.close();
            drop(conn.deregister(&self.poll));
        }

        for (_, (stream, _)) in pending_dials {
            drop(self.poll.deregister(&stream));
        }

        self.request_timers
            .lock()
            .expect("Timer table lock poisoned")
            .clear();

        // Wait for in-flight handlers to drain, then force-drop whatever is
        // left so a stuck handler cannot leak connections.
        let deadline = Instant::now() + DESTROY_WAIT_DEADLINE;
        loop {
            {
                let mut queue = self.destruction.lock().expect("Destruction queue lock poisoned");
                let retained: VecDeque<SharedConnection> = queue
                    .drain(..)
                    .filter(|conn| !conn.can_be_dropped())
                    .collect();
                *queue = retained;

                if queue.is_empty() {
                    break;
                }

                if Instant::now() >= deadline {
                    logging::error!(self.log, "forcing destruction of connections with in-flight handlers";
                                    "manager" => self.settings.id,
                                    "count" => queue.len());
                    queue.clear();
                    break;
                }
            }

            thread::sleep(Duration::from_millis(10));
        }

        logging::debug!(self.log, "manager stopped"; "manager" => self.settings.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{RecordedEvent, RecordingSink};
    use std::time::Duration;

    fn manager_settings(id: ConnectionManagerId, role: ConnectionRole) -> ManagerSettings {
        ManagerSettings {
            id,
            role,
            local_peer_role: PeerRole::Server,
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 0,
            max_active_connections: 0,
            request_timeout_secs: 0,
            read_buffer_size: 4096,
            write_buffer_size: 8192,
        }
    }

    fn start_manager(
        id: ConnectionManagerId,
        role: ConnectionRole,
        sink: Arc<RecordingSink>,
    ) -> ConnectionManager {
        let ids = Arc::new(AtomicU64::new(1));
        let manager = ConnectionManager::new(manager_settings(id, role), sink, ids, None).unwrap();
        manager.start().unwrap();
        manager
    }

    #[test]
    fn test_accept_and_dial_connect() {
        let sink_a = Arc::new(RecordingSink::new());
        let sink_b = Arc::new(RecordingSink::new());

        let manager_a = start_manager(1, ConnectionRole::Command, sink_a.clone());
        let manager_b = start_manager(2, ConnectionRole::Command, sink_b.clone());

        manager_a.dial(manager_b.local_addr()).unwrap();

        assert!(sink_a.wait_for(Duration::from_secs(5), |events| {
            events.iter().any(|event| matches!(event, RecordedEvent::Connect(_)))
        }));
        assert!(sink_b.wait_for(Duration::from_secs(5), |events| {
            events.iter().any(|event| matches!(event, RecordedEvent::Connect(_)))
        }));

        assert_eq!(manager_a.stats().connections_initiated, 1);
        assert_eq!(manager_b.stats().connections_accepted, 1);

        manager_a.stop();
        manager_b.stop();
    }

    #[test]
    fn test_dial_unreachable_reports_initiation_failure() {
        let sink = Arc::new(RecordingSink::new());
        let manager = start_manager(1, ConnectionRole::Command, sink.clone());

        // Port 1 on loopback is assumed closed.
        manager.dial("127.0.0.1:1".parse().unwrap()).unwrap();

        assert!(sink.wait_for(Duration::from_secs(5), |events| {
            events
                .iter()
                .any(|event| matches!(event, RecordedEvent::InitiationFailed(_)))
        }));

        assert!(!sink.contains(|event| matches!(event, RecordedEvent::Connect(_))));
        assert!(!sink.contains(|event| matches!(event, RecordedEvent::Disconnect(_))));

        manager.stop();
    }

    #[test]
    fn test_many_concurrent_dials() {
        let sink_a = Arc::new(RecordingSink::new());
        let sink_b = Arc::new(RecordingSink::new());

        let manager_a = start_manager(1, ConnectionRole::Command, sink_a.clone());
        let manager_b = start_manager(2, ConnectionRole::Command, sink_b.clone());

        let count = 50;
        for _ in 0..count {
            manager_a.dial(manager_b.local_addr()).unwrap();
        }

        assert!(sink_a.wait_for(Duration::from_secs(10), |events| {
            events
                .iter()
                .filter(|event| matches!(event, RecordedEvent::Connect(_)))
                .count()
                == count
        }));
        assert!(sink_b.wait_for(Duration::from_secs(10), |events| {
            events
                .iter()
                .filter(|event| matches!(event, RecordedEvent::Connect(_)))
                .count()
                == count
        }));

        assert_eq!(sink_a.count(|event| matches!(event, RecordedEvent::InitiationFailed(_))), 0);
        assert_eq!(manager_a.stats().connections_initiated, count as u64);
        assert_eq!(manager_b.stats().connections_accepted, count as u64);

        manager_a.stop();
        manager_b.stop();
    }

    #[test]
    fn test_roundtrip_between_managers() {
        let sink_a = Arc::new(RecordingSink::new());
        let sink_b = Arc::new(RecordingSink::new());

        let manager_a = start_manager(1, ConnectionRole::Data, sink_a.clone());
        let manager_b = start_manager(2, ConnectionRole::Data, sink_b.clone());

        manager_a.dial(manager_b.local_addr()).unwrap();

        assert!(sink_a.wait_for(Duration::from_secs(5), |events| {
            events.iter().any(|event| matches!(event, RecordedEvent::Connect(_)))
        }));

        let conn_a = sink_a.first_connection().unwrap();
        conn_a.send(b"over the wire").unwrap();

        assert!(sink_b.wait_for(Duration::from_secs(5), |events| {
            events
                .iter()
                .any(|event| matches!(event, RecordedEvent::Data(_, data, 0) if data == b"over the wire"))
        }));
        assert!(sink_a.wait_for(Duration::from_secs(5), |events| {
            events
                .iter()
                .any(|event| matches!(event, RecordedEvent::WriteResult(_, true)))
        }));

        manager_a.stop();
        manager_b.stop();
    }

    #[test]
    fn test_intent_timeout_closes_connection() {
        let sink = Arc::new(RecordingSink::new());
        let ids = Arc::new(AtomicU64::new(1));

        let mut settings = manager_settings(1, ConnectionRole::Command);
        settings.request_timeout_secs = 1;

        let manager = ConnectionManager::new(settings, sink.clone(), ids, None).unwrap();
        manager.start().unwrap();

        // Connect without ever sending the intent frame.
        let silent = std::net::TcpStream::connect(manager.local_addr()).unwrap();

        assert!(sink.wait_for(Duration::from_secs(5), |events| {
            events.iter().any(|event| matches!(event, RecordedEvent::Disconnect(_)))
        }));
        assert!(!sink.contains(|event| matches!(event, RecordedEvent::Connect(_))));

        drop(silent);
        manager.stop();
    }

    #[test]
    fn test_stop_closes_connections() {
        let sink_a = Arc::new(RecordingSink::new());
        let sink_b = Arc::new(RecordingSink::new());

        let manager_a = start_manager(1, ConnectionRole::Command, sink_a.clone());
        let manager_b = start_manager(2, ConnectionRole::Command, sink_b.clone());

        manager_a.dial(manager_b.local_addr()).unwrap();

        assert!(sink_a.wait_for(Duration::from_secs(5), |events| {
            events.iter().any(|event| matches!(event, RecordedEvent::Connect(_)))
        }));

        manager_a.stop();

        assert!(sink_a.contains(|event| matches!(event, RecordedEvent::Disconnect(_))));
        assert_eq!(manager_a.active_connections(), 0);

        manager_b.stop();
    }
}
