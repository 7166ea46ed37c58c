use crate::net::buffer::Buffer;
use crate::net::frame::{self, IntentFrame, HEADER_SIZE, INTENT_SIZE, MAX_PAYLOAD_SIZE};
use crate::net::manager::WakeHandle;
use crate::net::support::{
    ConnectionId, ConnectionInitiation, ConnectionManagerId, ConnectionRole, ConnectionState,
    ConnectionSubstate, ErrorType, NetworkError, NetworkResult, RawConnectionId,
};
use mio::net::TcpStream;
use solder::device::PeerRole;
use solder::logging;
use std::cmp::min;
use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

pub type SharedConnection = Arc<Connection>;

/// Event surface for connections and their owning managers. Implemented by
/// the routing layer; completions post here and the implementor resolves the
/// connection id to its handler state.
pub trait ConnectionEvents: Send + Sync {
    /// The intent exchange completed and the connection is established.
    fn on_connect(&self, conn: &SharedConnection);

    /// The connection transitioned to closed.
    fn on_disconnect(&self, conn: &SharedConnection);

    /// A message (or a chunk of a streamed message) arrived. `remaining` is
    /// the number of payload bytes still outstanding for the current message.
    fn on_data_received(&self, conn: &SharedConnection, data: Vec<u8>, remaining: u64);

    /// A previously submitted write completed or was abandoned.
    fn on_write_result(&self, conn: &SharedConnection, sent: bool);

    /// All lifecycle events have fired and the owner may drop the connection
    /// once its in-flight handler count drains.
    fn on_can_be_destroyed(&self, conn: &SharedConnection, initiation: ConnectionInitiation);

    /// An outbound dial failed before a connection object existed.
    fn on_initiation_failed(&self, manager: ConnectionManagerId, addr: SocketAddr, kind: io::ErrorKind);
}

/// Construction parameters for a connection.
pub struct ConnectionSettings {
    pub id: ConnectionId,
    pub raw_id: RawConnectionId,
    pub manager: ConnectionManagerId,
    pub role: ConnectionRole,
    pub local_peer_role: PeerRole,
    pub initiation: ConnectionInitiation,
    pub remote_addr: SocketAddr,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

#[derive(Debug)]
enum Event {
    Connect,
    Disconnect,
    CanBeDestroyed,
    DataReceived(Vec<u8>, u64),
    WriteResult(bool),
}

impl Event {
    #[inline]
    fn is_lifecycle(&self) -> bool {
        match self {
            Event::Connect | Event::Disconnect | Event::CanBeDestroyed => true,
            Event::DataReceived(..) | Event::WriteResult(_) => false,
        }
    }
}

/// Deferred-event gate. Events of a blocked class accumulate here in order
/// and fire on enable; nothing fires after `CanBeDestroyed` has been
/// delivered.
struct EventGate {
    lifecycle_enabled: bool,
    data_enabled: bool,
    queue: VecDeque<Event>,
    terminal: bool,
}

enum ReadPhase {
    Intent,
    Header,
    Payload { total: u64, remaining: u64 },
}

struct ReadLane {
    buffer: Buffer,
    phase: ReadPhase,
}

struct FrameProgress {
    remaining: usize,
    payload: usize,
}

struct WriteLane {
    buffer: Buffer,
    /// Unflushed bytes of the opening intent frame (outbound connections).
    intent_remaining: usize,
    /// Frames currently in the buffer, in submission order.
    inflight: VecDeque<FrameProgress>,
    /// Framed messages that did not fit in the buffer yet.
    queued: VecDeque<Vec<u8>>,
}

/// A single TCP socket with serialized read and write lanes, framed message
/// delivery and a deferred-event queue decoupling the transport from the
/// protocol handlers above it.
pub struct Connection {
    id: ConnectionId,
    raw_id: RawConnectionId,
    manager: ConnectionManagerId,
    role: ConnectionRole,
    local_peer_role: PeerRole,
    initiation: ConnectionInitiation,
    remote_addr: SocketAddr,

    stream: TcpStream,

    state: AtomicU8,
    substate: AtomicU8,
    closed: AtomicBool,
    pending_handlers: AtomicUsize,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    events_counter: AtomicU64,

    read: Mutex<ReadLane>,
    write: Mutex<WriteLane>,
    events: Mutex<EventGate>,
    sink: RwLock<Option<Arc<dyn ConnectionEvents>>>,
    remote_intent: Mutex<Option<IntentFrame>>,

    wake: Option<Arc<WakeHandle>>,
    self_ref: Weak<Connection>,

    log: logging::Logger,
}

impl Connection {
    /// Creates a connection for an accepted socket. The first read is the
    /// remote peer's intent frame.
    pub fn inbound<'a, L: Into<Option<&'a logging::Logger>>>(
        stream: TcpStream,
        settings: ConnectionSettings,
        wake: Option<Arc<WakeHandle>>,
        log: L,
    ) -> SharedConnection {
        Self::build(stream, settings, wake, ReadPhase::Intent, 0, logging::child(log))
    }

    /// Creates a connection for a successfully dialed socket. The intent
    /// frame is queued for writing immediately.
    pub fn outbound<'a, L: Into<Option<&'a logging::Logger>>>(
        stream: TcpStream,
        settings: ConnectionSettings,
        wake: Option<Arc<WakeHandle>>,
        log: L,
    ) -> SharedConnection {
        Self::build(stream, settings, wake, ReadPhase::Header, INTENT_SIZE, logging::child(log))
    }

    fn build(
        stream: TcpStream,
        settings: ConnectionSettings,
        wake: Option<Arc<WakeHandle>>,
        phase: ReadPhase,
        intent_remaining: usize,
        log: logging::Logger,
    ) -> SharedConnection {
        let mut write_lane = WriteLane {
            buffer: Buffer::new(settings.write_buffer_size),
            intent_remaining,
            inflight: VecDeque::new(),
            queued: VecDeque::new(),
        };

        if intent_remaining > 0 {
            let intent = IntentFrame::new(settings.local_peer_role, settings.role);
            write_lane.buffer.push_bytes(&intent.to_bytes());
        }

        let conn = Arc::new_cyclic(|self_ref| Connection {
            id: settings.id,
            raw_id: settings.raw_id,
            manager: settings.manager,
            role: settings.role,
            local_peer_role: settings.local_peer_role,
            initiation: settings.initiation,
            remote_addr: settings.remote_addr,
            stream,
            state: AtomicU8::new(Self::state_code(ConnectionState::Invalid)),
            substate: AtomicU8::new(Self::substate_code(ConnectionSubstate::Waiting)),
            closed: AtomicBool::new(false),
            pending_handlers: AtomicUsize::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            events_counter: AtomicU64::new(0),
            read: Mutex::new(ReadLane {
                buffer: Buffer::new(settings.read_buffer_size),
                phase,
            }),
            write: Mutex::new(write_lane),
            events: Mutex::new(EventGate {
                lifecycle_enabled: false,
                data_enabled: false,
                queue: VecDeque::new(),
                terminal: false,
            }),
            sink: RwLock::new(None),
            remote_intent: Mutex::new(None),
            wake,
            self_ref: self_ref.clone(),
            log,
        });

        logging::debug!(conn.log, "connection created";
                        "connection_id" => conn.id,
                        "raw_id" => conn.raw_id,
                        "role" => %conn.role,
                        "initiation" => ?conn.initiation,
                        "remote" => %conn.remote_addr);

        conn
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn raw_id(&self) -> RawConnectionId {
        self.raw_id
    }

    #[inline]
    pub fn manager_id(&self) -> ConnectionManagerId {
        self.manager
    }

    #[inline]
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    #[inline]
    pub fn initiation(&self) -> ConnectionInitiation {
        self.initiation
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[inline]
    pub fn local_peer_role(&self) -> PeerRole {
        self.local_peer_role
    }

    /// The intent frame received from the remote peer, if any.
    #[inline]
    pub fn remote_intent(&self) -> Option<IntentFrame> {
        *self.remote_intent.lock().expect("Intent lock poisoned")
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Invalid,
            1 => ConnectionState::Established,
            _ => ConnectionState::Closed,
        }
    }

    #[inline]
    pub fn substate(&self) -> ConnectionSubstate {
        match self.substate.load(Ordering::Acquire) {
            0 => ConnectionSubstate::None,
            1 => ConnectionSubstate::Reading,
            2 => ConnectionSubstate::Writing,
            3 => ConnectionSubstate::Waiting,
            4 => ConnectionSubstate::Failed,
            _ => ConnectionSubstate::Dropped,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Payload bytes written to the socket. Header bytes are not counted.
    #[inline]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Payload bytes received from the socket. Header bytes are not counted.
    #[inline]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Monotonic count of messages sent and received, used by the
    /// inactivity sweeps.
    #[inline]
    pub fn events_count(&self) -> u64 {
        self.events_counter.load(Ordering::Relaxed)
    }

    /// Number of event callouts currently executing against this connection.
    #[inline]
    pub fn pending_handler_count(&self) -> usize {
        self.pending_handlers.load(Ordering::Acquire)
    }

    /// A connection may be dropped only once it is closed and no handler is
    /// executing against it.
    #[inline]
    pub fn can_be_dropped(&self) -> bool {
        self.is_closed() && self.pending_handler_count() == 0
    }

    /// Installs the event sink. Must be done before any event class is
    /// enabled.
    pub fn set_event_sink(&self, sink: Arc<dyn ConnectionEvents>) {
        *self.sink.write().expect("Sink lock poisoned") = Some(sink);
    }

    #[inline]
    fn state_code(state: ConnectionState) -> u8 {
        match state {
            ConnectionState::Invalid => 0,
            ConnectionState::Established => 1,
            ConnectionState::Closed => 2,
        }
    }

    #[inline]
    fn substate_code(substate: ConnectionSubstate) -> u8 {
        match substate {
            ConnectionSubstate::None => 0,
            ConnectionSubstate::Reading => 1,
            ConnectionSubstate::Writing => 2,
            ConnectionSubstate::Waiting => 3,
            ConnectionSubstate::Failed => 4,
            ConnectionSubstate::Dropped => 5,
        }
    }

    #[inline]
    fn set_substate(&self, substate: ConnectionSubstate) {
        self.substate.store(Self::substate_code(substate), Ordering::Release);
    }

    /// Transitions to established; returns true on the first transition only.
    #[inline]
    fn mark_established(&self) -> bool {
        self.state
            .compare_exchange(
                Self::state_code(ConnectionState::Invalid),
                Self::state_code(ConnectionState::Established),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Connection {
    /// Registers the connection socket on the supplied poll.
    pub(crate) fn register(&self, poll: &mio::Poll, token: mio::Token) -> NetworkResult<()> {
        poll.register(
            &self.stream,
            token,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    /// Deregisters the connection socket from the supplied poll.
    pub(crate) fn deregister(&self, poll: &mio::Poll) -> NetworkResult<()> {
        poll.deregister(&self.stream).map_err(Into::into)
    }
}

impl Connection {
    /// Submits a payload for transmission. Non-blocking: the result arrives
    /// as a `WriteResult` event. Writes submitted while another write is in
    /// flight are processed in submission order.
    pub fn send(&self, data: &[u8]) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::Fatal(ErrorType::Shutdown));
        }

        if data.len() as u64 > u64::from(MAX_PAYLOAD_SIZE) {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        let frame_size = HEADER_SIZE + data.len();

        {
            let mut lane = self.write.lock().expect("Write lane lock poisoned");

            let mut framed = Vec::with_capacity(frame_size);
            framed.extend_from_slice(&frame::encode_header(data.len() as u32));
            framed.extend_from_slice(data);

            if lane.queued.is_empty() && frame_size <= lane.buffer.free_capacity() {
                lane.buffer.push_bytes(&framed);
                lane.inflight.push_back(FrameProgress {
                    remaining: frame_size,
                    payload: data.len(),
                });
            } else {
                lane.queued.push_back(framed);
            }
        }

        logging::trace!(self.log, "write submitted";
                        "connection_id" => self.id,
                        "payload_size" => data.len());

        if let Some(wake) = &self.wake {
            wake.mark_dirty(self.raw_id);
        }

        Ok(())
    }

    /// Closes the connection: shuts the socket down, fails all unflushed
    /// writes and emits `Disconnect` followed by `CanBeDestroyed`.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.state.store(Self::state_code(ConnectionState::Closed), Ordering::Release);

        logging::debug!(self.log, "closing connection";
                        "connection_id" => self.id,
                        "raw_id" => self.raw_id,
                        "substate" => ?self.substate(),
                        "bytes_sent" => self.bytes_sent(),
                        "bytes_received" => self.bytes_received());

        // Socket errors at shutdown are expected when the peer went first.
        drop(self.stream.shutdown(Shutdown::Both));

        let abandoned = {
            let mut lane = self.write.lock().expect("Write lane lock poisoned");
            let count = lane.inflight.len() + lane.queued.len();
            lane.inflight.clear();
            lane.queued.clear();
            lane.buffer.clear();
            count
        };

        for _ in 0..abandoned {
            self.emit(Event::WriteResult(false));
        }

        self.emit(Event::Disconnect);
        self.emit(Event::CanBeDestroyed);

        if let Some(wake) = &self.wake {
            wake.mark_dirty(self.raw_id);
        }
    }

    /// Marks the connection failed with the appropriate sub-state and closes
    /// it.
    pub(crate) fn fail(&self, err: ErrorType) {
        if err.is_peer_termination() {
            logging::debug!(self.log, "connection terminated by remote peer";
                            "connection_id" => self.id,
                            "error" => ?err);
            self.set_substate(ConnectionSubstate::Dropped);
        } else {
            logging::debug!(self.log, "connection failed";
                            "connection_id" => self.id,
                            "error" => ?err);
            self.set_substate(ConnectionSubstate::Failed);
        }

        self.close();
    }
}

impl Connection {
    /// Enables lifecycle event delivery, draining any queued lifecycle
    /// events in enqueue order.
    pub fn enable_lifecycle_events(&self) {
        self.enable_events(true);
    }

    /// Blocks lifecycle event delivery; subsequent lifecycle events queue.
    pub fn disable_lifecycle_events(&self) {
        let mut gate = self.events.lock().expect("Event gate lock poisoned");
        gate.lifecycle_enabled = false;
    }

    /// Enables data event delivery, draining any queued data events in
    /// enqueue order.
    pub fn enable_data_events(&self) {
        self.enable_events(false);
    }

    /// Blocks data event delivery; subsequent data events queue.
    pub fn disable_data_events(&self) {
        let mut gate = self.events.lock().expect("Event gate lock poisoned");
        gate.data_enabled = false;
    }

    fn enable_events(&self, lifecycle: bool) {
        let drained = {
            let mut gate = self.events.lock().expect("Event gate lock poisoned");

            if lifecycle {
                if gate.lifecycle_enabled {
                    return;
                }
                gate.lifecycle_enabled = true;
            } else {
                if gate.data_enabled {
                    return;
                }
                gate.data_enabled = true;
            }

            if gate.terminal {
                return;
            }

            let mut drained = Vec::new();
            let mut retained = VecDeque::new();

            while let Some(event) = gate.queue.pop_front() {
                if event.is_lifecycle() == lifecycle {
                    drained.push(event);
                } else {
                    retained.push_back(event);
                }
            }

            gate.queue = retained;
            drained
        };

        for event in drained {
            self.fire(event);
        }
    }

    /// Emits an event: fires synchronously when its class is enabled,
    /// queues otherwise. Nothing fires after `CanBeDestroyed`.
    fn emit(&self, event: Event) {
        let fire_now = {
            let mut gate = self.events.lock().expect("Event gate lock poisoned");

            if gate.terminal {
                return;
            }

            let enabled = if event.is_lifecycle() {
                gate.lifecycle_enabled
            } else {
                gate.data_enabled
            };

            if enabled {
                true
            } else {
                gate.queue.push_back(event);
                return;
            }
        };

        if fire_now {
            self.fire(event);
        }
    }

    fn fire(&self, event: Event) {
        let sink = match self.sink.read().expect("Sink lock poisoned").clone() {
            Some(sink) => sink,
            None => {
                logging::warn!(self.log, "event dropped, no sink installed";
                               "connection_id" => self.id,
                               "event" => ?event);
                return;
            }
        };

        let conn = match self.self_ref.upgrade() {
            Some(conn) => conn,
            None => return,
        };

        if let Event::CanBeDestroyed = event {
            let mut gate = self.events.lock().expect("Event gate lock poisoned");
            gate.terminal = true;
            gate.queue.clear();
        }

        self.pending_handlers.fetch_add(1, Ordering::AcqRel);

        match event {
            Event::Connect => sink.on_connect(&conn),
            Event::Disconnect => sink.on_disconnect(&conn),
            Event::CanBeDestroyed => sink.on_can_be_destroyed(&conn, self.initiation),
            Event::DataReceived(data, remaining) => sink.on_data_received(&conn, data, remaining),
            Event::WriteResult(sent) => sink.on_write_result(&conn, sent),
        }

        self.pending_handlers.fetch_sub(1, Ordering::AcqRel);
    }
}

enum ReadStep {
    More,
    Blocked,
    Eof,
    Error(NetworkError),
}

impl Connection {
    /// Drives the read lane: pulls bytes off the socket and delivers framed
    /// messages. Invoked by the owning manager on readable readiness; never
    /// concurrently with itself.
    pub(crate) fn handle_readable(&self) {
        if self.is_closed() {
            return;
        }

        loop {
            let (events, step) = {
                let mut lane = self.read.lock().expect("Read lane lock poisoned");
                self.set_substate(ConnectionSubstate::Reading);

                match self.process_frames(&mut lane) {
                    Err(err) => (Vec::new(), ReadStep::Error(err)),
                    Ok(events) => {
                        if lane.buffer.free_capacity() == 0 {
                            // The frame processor is guaranteed to make
                            // progress on a full buffer, so spin once more.
                            (events, ReadStep::More)
                        } else {
                            match lane.buffer.fill_once(&self.stream) {
                                Ok(0) => (events, ReadStep::Eof),
                                Ok(_) => (events, ReadStep::More),
                                Err(err) => match NetworkError::from(err) {
                                    NetworkError::Wait => (events, ReadStep::Blocked),
                                    fatal => (events, ReadStep::Error(fatal)),
                                },
                            }
                        }
                    }
                }
            };

            for event in events {
                self.emit(event);
            }

            if self.is_closed() {
                return;
            }

            match step {
                ReadStep::More => continue,
                ReadStep::Blocked => break,
                ReadStep::Eof => {
                    self.fail(ErrorType::Io(io::ErrorKind::UnexpectedEof));
                    return;
                }
                ReadStep::Error(NetworkError::Wait) => break,
                ReadStep::Error(NetworkError::Fatal(err)) => {
                    self.fail(err);
                    return;
                }
            }
        }

        self.set_substate(ConnectionSubstate::Waiting);
    }

    /// Consumes as many complete frames from the read buffer as possible.
    fn process_frames(&self, lane: &mut ReadLane) -> NetworkResult<Vec<Event>> {
        let mut events = Vec::new();

        loop {
            match lane.phase {
                ReadPhase::Intent => {
                    if lane.buffer.len() < INTENT_SIZE {
                        break;
                    }

                    let intent = IntentFrame::from_bytes(&lane.buffer.read_slice()[..INTENT_SIZE])?;
                    lane.buffer.move_head(INTENT_SIZE);

                    if intent.connection_role != self.role {
                        logging::debug!(self.log, "intent role does not match manager role";
                                        "connection_id" => self.id,
                                        "requested" => %intent.connection_role,
                                        "expected" => %self.role);
                        return Err(NetworkError::Fatal(ErrorType::IncorrectIntent));
                    }

                    *self.remote_intent.lock().expect("Intent lock poisoned") = Some(intent);
                    lane.phase = ReadPhase::Header;

                    if self.mark_established() {
                        events.push(Event::Connect);
                    }
                }
                ReadPhase::Header => {
                    if lane.buffer.len() < HEADER_SIZE {
                        break;
                    }

                    let payload_size = frame::parse_header(&lane.buffer.read_slice()[..HEADER_SIZE]);
                    lane.buffer.move_head(HEADER_SIZE);

                    if payload_size == 0 {
                        logging::debug!(self.log, "header with payload size '0' skipped";
                                        "connection_id" => self.id);
                        continue;
                    }

                    if payload_size > MAX_PAYLOAD_SIZE {
                        return Err(NetworkError::Fatal(ErrorType::HeaderOverflow));
                    }

                    lane.phase = ReadPhase::Payload {
                        total: u64::from(payload_size),
                        remaining: u64::from(payload_size),
                    };
                }
                ReadPhase::Payload { total, remaining } => {
                    let available = lane.buffer.len() as u64;

                    if available == 0 {
                        break;
                    }

                    let streamed = total > lane.buffer.capacity() as u64;

                    if !streamed && available < remaining {
                        // The whole message fits in the buffer; wait for it.
                        break;
                    }

                    let take = min(available, remaining) as usize;
                    let chunk = lane.buffer.read_slice()[..take].to_vec();
                    lane.buffer.move_head(take);

                    let left = remaining - take as u64;
                    self.bytes_received.fetch_add(take as u64, Ordering::Relaxed);

                    if left == 0 {
                        self.events_counter.fetch_add(1, Ordering::Relaxed);
                        lane.phase = ReadPhase::Header;
                    } else {
                        lane.phase = ReadPhase::Payload {
                            total,
                            remaining: left,
                        };
                    }

                    events.push(Event::DataReceived(chunk, left));
                }
            }
        }

        Ok(events)
    }

    /// Drives the write lane: flushes buffered frames and reports their
    /// completion. Invoked by the owning manager on writable readiness or a
    /// wakeup; never concurrently with itself.
    pub(crate) fn handle_writable(&self) {
        if self.is_closed() {
            return;
        }

        let mut connected = false;
        let mut completed = 0usize;
        let mut failure: Option<NetworkError> = None;

        {
            let mut guard = self.write.lock().expect("Write lane lock poisoned");
            let lane = &mut *guard;

            loop {
                // Move queued frames into the buffer as space frees up.
                loop {
                    let fits = match lane.queued.front() {
                        Some(front) => front.len() <= lane.buffer.free_capacity(),
                        None => false,
                    };

                    if !fits {
                        break;
                    }

                    let framed = lane.queued.pop_front().expect("Queued frame must exist");
                    let payload = framed.len() - HEADER_SIZE;
                    lane.buffer.push_bytes(&framed);
                    lane.inflight.push_back(FrameProgress {
                        remaining: framed.len(),
                        payload,
                    });
                }

                if lane.buffer.is_empty() {
                    break;
                }

                self.set_substate(ConnectionSubstate::Writing);

                match lane.buffer.drain_once(&self.stream) {
                    Ok(written) => {
                        let mut left = written;

                        if lane.intent_remaining > 0 {
                            let used = min(left, lane.intent_remaining);
                            lane.intent_remaining -= used;
                            left -= used;

                            if lane.intent_remaining == 0 && self.mark_established() {
                                connected = true;
                            }
                        }

                        while left > 0 {
                            let frame = lane
                                .inflight
                                .front_mut()
                                .expect("Flushed bytes must belong to a frame");
                            let used = min(left, frame.remaining);
                            frame.remaining -= used;
                            left -= used;

                            if frame.remaining == 0 {
                                self.bytes_sent.fetch_add(frame.payload as u64, Ordering::Relaxed);
                                self.events_counter.fetch_add(1, Ordering::Relaxed);
                                lane.inflight.pop_front();
                                completed += 1;
                            }
                        }
                    }
                    Err(err) => {
                        match NetworkError::from(err) {
                            NetworkError::Wait => {}
                            fatal => failure = Some(fatal),
                        }
                        break;
                    }
                }
            }
        }

        if connected {
            logging::debug!(self.log, "intent frame flushed, connection established";
                            "connection_id" => self.id);
            self.emit(Event::Connect);
        }

        for _ in 0..completed {
            self.emit(Event::WriteResult(true));
        }

        match failure {
            Some(NetworkError::Fatal(err)) => self.fail(err),
            _ => self.set_substate(ConnectionSubstate::Waiting),
        }
    }

    /// Returns true while unflushed or queued write data remains.
    pub(crate) fn has_egress(&self) -> bool {
        let lane = self.write.lock().expect("Write lane lock poisoned");
        !lane.buffer.is_empty() || !lane.queued.is_empty()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        logging::debug!(self.log, "connection dropped";
                        "connection_id" => self.id,
                        "raw_id" => self.raw_id);
    }
}
