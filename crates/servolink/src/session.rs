//! The session: state machine, reactor and command/action plumbing.
//!
//! Each session owns a single-threaded tokio runtime. All stream reads,
//! timer ticks, definition refreshes and command completions run on
//! whichever thread is currently driving [`Session::poll`] or
//! [`Session::run_until_state_changes`]. Other threads interact through a
//! control channel (commands, action sends, timers) and oneshot completion
//! channels; those entry points are the only thread-safe surface and never
//! touch the reactor state directly.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bson::Document;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};

use servolink_shm::ShmView;
use servolink_wire::core::SESSION_KEEP_ALIVE_OFFSET;
use servolink_wire::{ResponseCode, SessionDescriptor, TCP_CORE_VERSION};

use crate::action::{ActionResult, ActionStatusCell};
use crate::command::{
    drain_documents, parse_reply, reply_payload_for, CommandError, CommandRequest, CommandResult,
    MIN_DOCUMENT_SIZE,
};
use crate::device_info::{DeviceInfoProvider, FullInfo};
use crate::error::{Error, Result, SessionState};
use crate::events::{Event, EventProducer};
use crate::provider::UpdateOutcome;
use crate::secure::{SecureSession, SecureSessionOptions};
use crate::sim_data::{SimData, SimDataProvider};
use crate::telemetry::{TelemetryDefinitions, TelemetrySystem};
use crate::variables::{VariableDefinitions, VariableStore};

/// Client version advertised in the register command.
pub const CORE_VERSION_MAJOR: i32 = 0;
pub const CORE_VERSION_MINOR: i32 = 3;
pub const CORE_VERSION_PATCH: i32 = 1;

/// Control categories a client can request authority over.
pub mod control_flags {
    /// Drive feedback effect pipelines.
    pub const FFB_EFFECTS: u32 = 1 << 0;
    /// Push telemetry update groups.
    pub const TELEMETRY: u32 = 1 << 1;
    /// Replace or update simulator data.
    pub const SIM_DATA: u32 = 1 << 2;
}

pub(crate) const CONTROL_FLAG_NAMES: [(u32, &str); 3] = [
    (control_flags::FFB_EFFECTS, "ffb"),
    (control_flags::TELEMETRY, "telemetry"),
    (control_flags::SIM_DATA, "sim_data"),
];

const MAX_ID_NAME_LEN: usize = 64;
const REGISTER_DEADLINE: Duration = Duration::from_secs(2);
const UPDATE_TICK: Duration = Duration::from_millis(500);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Metadata about the registering application, echoed into the backend's
/// controller list.
#[derive(Debug, Clone, Default)]
pub struct ApiUserInformation {
    pub display_name: String,
    pub version: String,
    pub author: String,
    pub path: String,
    /// Free-form application kind, e.g. "simulator" or "tool".
    pub kind: String,
}

pub(crate) enum Completion {
    Callback(Box<dyn FnOnce(CommandResult) + Send>),
    Reply(oneshot::Sender<CommandResult>),
}

pub(crate) enum ActionDone {
    Status(Arc<ActionStatusCell>),
    Reply(oneshot::Sender<ActionResult>),
}

pub(crate) enum Ctrl {
    InstallLink {
        tcp: std::net::TcpStream,
        udp: std::net::UdpSocket,
    },
    SendCommand {
        id: i32,
        data: Vec<u8>,
    },
    SendAction {
        data: Vec<u8>,
        done: ActionDone,
    },
    AddTimer {
        id: i32,
        period: Duration,
        callback: Box<dyn FnMut() + Send>,
    },
    RemoveTimer {
        id: i32,
    },
    Shutdown,
}

struct KeepAliveState {
    value: u32,
    changed_at: Instant,
}

/// One attachment to the backend.
///
/// Sessions are shared (`Arc`) between the API, the background runner and
/// user code; all methods take `&self`.
pub struct Session {
    session_id: u32,
    descriptor: SessionDescriptor,
    /// Live mapping of the session descriptor region; only the keep-alive
    /// counter is read from it after rendezvous.
    session_view: ShmView,

    state: Mutex<SessionState>,
    state_epoch: AtomicU64,
    wake: Notify,
    stop_flag: AtomicBool,

    controller_id: AtomicU16,
    control_flags: AtomicU32,
    register_lock: Mutex<()>,

    command_id: AtomicI32,
    pending: Mutex<HashMap<i32, Completion>>,
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
    action_socket: Mutex<Option<std::net::UdpSocket>>,
    secure: Mutex<Option<Arc<SecureSession>>>,
    timer_ids: AtomicI32,

    events: Arc<EventProducer<Event>>,
    keep_alive: Mutex<KeepAliveState>,

    device_info: DeviceInfoProvider,
    sim_data: SimDataProvider,
    variable_store: VariableStore,
    telemetry_system: TelemetrySystem,

    runtime: tokio::runtime::Runtime,
    reactor: Mutex<Reactor>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Everything the rendezvous resolves before a session can exist.
pub(crate) struct SessionResources {
    pub descriptor: SessionDescriptor,
    pub session_view: ShmView,
    pub device_info_view: ShmView,
    pub variable_header_view: ShmView,
    pub variable_data_view: ShmView,
    pub telemetry_view: ShmView,
    pub sim_data_view: ShmView,
}

impl Session {
    pub(crate) fn new(
        resources: SessionResources,
        events: Arc<EventProducer<Event>>,
    ) -> Result<Arc<Session>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|_| Error::CannotConnect)?;

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let session_id = resources.descriptor.session_id;

        Ok(Arc::new(Session {
            session_id,
            descriptor: resources.descriptor,
            session_view: resources.session_view,
            state: Mutex::new(SessionState::ConnectedMonitor),
            state_epoch: AtomicU64::new(0),
            wake: Notify::new(),
            stop_flag: AtomicBool::new(false),
            controller_id: AtomicU16::new(0),
            control_flags: AtomicU32::new(0),
            register_lock: Mutex::new(()),
            command_id: AtomicI32::new(1),
            pending: Mutex::new(HashMap::new()),
            ctrl_tx,
            action_socket: Mutex::new(None),
            secure: Mutex::new(None),
            timer_ids: AtomicI32::new(0),
            events,
            keep_alive: Mutex::new(KeepAliveState {
                value: 0,
                changed_at: Instant::now(),
            }),
            device_info: DeviceInfoProvider::new(resources.device_info_view),
            sim_data: SimDataProvider::new(resources.sim_data_view),
            variable_store: VariableStore::new(
                resources.variable_header_view,
                resources.variable_data_view,
            ),
            telemetry_system: TelemetrySystem::new(resources.telemetry_view),
            runtime,
            reactor: Mutex::new(Reactor::new(ctrl_rx)),
        }))
    }

    // ── identity and state ─────────────────────────────────────────────

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Controller id assigned by the backend; 0 while unregistered.
    pub fn controller_id(&self) -> u16 {
        self.controller_id.load(Ordering::Relaxed)
    }

    /// Control categories granted by the backend.
    pub fn control_flags(&self) -> u32 {
        self.control_flags.load(Ordering::Relaxed)
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    fn set_state(&self, new: SessionState) {
        *self.state.lock() = new;
        self.state_epoch.fetch_add(1, Ordering::Release);
        self.wake.notify_one();
    }

    fn notify_state(self: &Arc<Self>, state: SessionState, controller_id: u16, flags: u32) {
        self.events.notify(Event::SessionStateChanged {
            session: Arc::clone(self),
            state,
            controller_id,
            control_flags: flags,
        });
    }

    // ── shared-memory accessors ────────────────────────────────────────

    /// The latest device info, refreshing the snapshot first.
    pub fn device_info(&self) -> Option<Arc<FullInfo>> {
        self.device_info.update();
        self.device_info.full_info()
    }

    /// The latest simulator data, refreshing the snapshot first.
    pub fn sim_data(&self) -> Option<Arc<SimData>> {
        self.sim_data.update();
        self.sim_data.sim_data()
    }

    /// A point-in-time view of the variable definitions.
    pub fn variables(self: &Arc<Self>) -> VariableDefinitions {
        VariableDefinitions::new(self.variable_store.snapshot(), Arc::clone(self))
    }

    /// A point-in-time view of the telemetry definitions, refreshed first.
    pub fn telemetries(self: &Arc<Self>) -> TelemetryDefinitions {
        self.telemetry_system.refresh();
        TelemetryDefinitions::new(self.telemetry_system.definitions(), Arc::clone(self))
    }

    /// The secure-session offers published by this session.
    pub fn secure_session_options(&self) -> SecureSessionOptions {
        SecureSessionOptions {
            session_id: self.session_id,
            offers: self.descriptor.public_key_offers.clone(),
        }
    }

    /// The secure session installed by a successful secure registration.
    pub fn secure_session(&self) -> Option<Arc<SecureSession>> {
        self.secure.lock().clone()
    }

    // ── registration ───────────────────────────────────────────────────

    /// Register as a controller over the command stream.
    ///
    /// Synchronous; gives up after 2 seconds. On success the session moves
    /// to `ConnectedControl` and a `SessionStateChanged` event carries the
    /// granted control flags.
    pub fn register_to_control(
        self: &Arc<Self>,
        control_flags: u32,
        id_name: &str,
        user_info: &ApiUserInformation,
        secure_session: Option<SecureSession>,
    ) -> Result<()> {
        let _guard = self.register_lock.lock();
        let deadline = Instant::now() + REGISTER_DEADLINE;

        if self.state() == SessionState::Invalid {
            return Err(Error::InvalidState);
        }
        if id_name.len() > MAX_ID_NAME_LEN || control_flags == 0 {
            return Err(Error::InvalidArgument);
        }
        if let Some(secure) = &secure_session {
            if secure.session_id() != self.session_id {
                return Err(Error::InvalidArgument);
            }
            if secure.parameters().controller_public_key.is_empty() {
                return Err(Error::InvalidArgument);
            }
        }

        let packet = self.build_register_packet(control_flags, id_name, user_info, &secure_session);

        // The action socket is opened first and never blocks.
        let udp_target = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(self.descriptor.udp_address),
            self.descriptor.udp_port,
        ));
        let udp = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|s| s.connect(udp_target).map(|_| s))
            .and_then(|s| s.set_nonblocking(true).map(|_| s))
            .map_err(|_| Error::CannotConnect)?;
        let udp_reactor = udp.try_clone().map_err(|_| Error::CannotConnect)?;

        // The command stream is registered with blocking I/O against the
        // remaining deadline, then handed to the reactor.
        let tcp_target = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(self.descriptor.tcp_address),
            self.descriptor.tcp_port,
        ));
        let reply = self.exchange_register(&packet, tcp_target, deadline)?;
        let (tcp, reply_doc) = reply;

        let payload =
            reply_payload_for(&reply_doc, "register").ok_or(Error::Protocol)?;
        let controller_id = payload.get_i32("controller_id").map_err(|_| Error::Protocol)?;
        let mut granted = 0u32;
        if let Ok(names) = payload.get_array("control") {
            for name in names {
                if let bson::Bson::String(name) = name {
                    for (flag, flag_name) in CONTROL_FLAG_NAMES {
                        if name == flag_name {
                            granted |= flag;
                        }
                    }
                }
            }
        }

        tcp.set_nonblocking(true).map_err(|_| Error::CannotConnect)?;
        *self.action_socket.lock() = Some(udp);
        *self.secure.lock() = secure_session.map(Arc::new);
        self.controller_id.store(controller_id as u16, Ordering::Relaxed);
        self.control_flags.store(granted, Ordering::Relaxed);
        let _ = self.ctrl_tx.send(Ctrl::InstallLink {
            tcp,
            udp: udp_reactor,
        });

        self.set_state(SessionState::ConnectedControl);
        self.notify_state(SessionState::ConnectedControl, controller_id as u16, granted);
        Ok(())
    }

    fn build_register_packet(
        &self,
        control_flags: u32,
        id_name: &str,
        user_info: &ApiUserInformation,
        secure_session: &Option<SecureSession>,
    ) -> Vec<u8> {
        let mut register = Document::new();
        register.insert("id", id_name);
        register.insert("name", user_info.display_name.as_str());
        register.insert("protocol_version", TCP_CORE_VERSION as i64);
        register.insert("core_version_major", CORE_VERSION_MAJOR);
        register.insert("core_version_minor", CORE_VERSION_MINOR);
        register.insert("core_version_patch", CORE_VERSION_PATCH);

        let mut metadata = Document::new();
        if !user_info.version.is_empty() {
            metadata.insert("version", user_info.version.as_str());
        }
        if !user_info.author.is_empty() {
            metadata.insert("author", user_info.author.as_str());
        }
        if !user_info.path.is_empty() {
            metadata.insert("filepath", user_info.path.as_str());
        }
        if !user_info.kind.is_empty() {
            metadata.insert("type", user_info.kind.as_str());
        }
        register.insert("metadata", metadata);

        let mut control = bson::Array::new();
        for (flag, name) in CONTROL_FLAG_NAMES {
            if control_flags & flag != 0 {
                control.push(bson::Bson::String(name.to_string()));
            }
        }
        register.insert("control", control);

        if let Some(secure) = secure_session {
            let mut block = Document::new();
            block.insert("method", "x25519-AES128-GCM");
            block.insert(
                "public_key",
                bson::Binary {
                    subtype: bson::spec::BinarySubtype::Generic,
                    bytes: secure.parameters().controller_public_key.clone(),
                },
            );
            register.insert("secure_session", block);
        }

        CommandRequest::with_body("core", "register", register)
            .finalize(self.command_id.fetch_add(1, Ordering::Relaxed))
    }

    fn exchange_register(
        &self,
        packet: &[u8],
        target: SocketAddr,
        deadline: Instant,
    ) -> Result<(std::net::TcpStream, Document)> {
        let remaining = |deadline: Instant| {
            deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::Timeout)
        };

        let mut tcp = std::net::TcpStream::connect_timeout(&target, remaining(deadline)?)
            .map_err(|_| Error::CannotConnect)?;
        tcp.set_nodelay(true).ok();

        let io_err = |e: std::io::Error| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                Error::Timeout
            } else {
                Error::CannotConnect
            }
        };

        tcp.set_write_timeout(Some(remaining(deadline)?)).ok();
        tcp.write_all(packet).map_err(io_err)?;

        // One complete reply document: the first four bytes carry its size.
        let mut size_bytes = [0u8; 4];
        tcp.set_read_timeout(Some(remaining(deadline)?)).ok();
        tcp.read_exact(&mut size_bytes).map_err(io_err)?;
        let size = i32::from_le_bytes(size_bytes);
        if size < MIN_DOCUMENT_SIZE as i32 || size > 1 << 20 {
            return Err(Error::Protocol);
        }

        let mut body = vec![0u8; size as usize];
        body[..4].copy_from_slice(&size_bytes);
        tcp.set_read_timeout(Some(remaining(deadline)?)).ok();
        tcp.read_exact(&mut body[4..]).map_err(io_err)?;

        let doc = Document::from_reader(&mut &body[..]).map_err(|_| Error::Protocol)?;
        let code = ResponseCode::from_raw(doc.get_i32("result").map_err(|_| Error::Protocol)?);
        if !code.is_ok() {
            if let Ok(message) = doc.get_str("error_message") {
                tracing::warn!(%code, message, "registration rejected");
            }
            return Err(Error::from_response_code(code));
        }
        Ok((tcp, doc))
    }

    // ── commands ───────────────────────────────────────────────────────

    /// Queue a command; `callback` runs on the reactor thread with the
    /// reply. Returns false when the session cannot send commands.
    ///
    /// Commands are not fragmented or size-checked locally; the stream has
    /// no datagram limit and the backend polices its own maximum.
    ///
    /// If the session is closed or lost before the reply arrives, the
    /// callback is abandoned without being invoked.
    pub fn async_command(
        &self,
        request: CommandRequest,
        callback: impl FnOnce(CommandResult) + Send + 'static,
    ) -> bool {
        self.submit_command(request, Completion::Callback(Box::new(callback)))
    }

    /// Run a command and wait for its reply.
    ///
    /// Must not be called from reactor callbacks; the reactor cannot make
    /// progress while its own thread is parked here.
    pub fn blocking_command(&self, request: CommandRequest) -> CommandResult {
        let (tx, rx) = oneshot::channel();
        if !self.submit_command(request, Completion::Reply(tx)) {
            return Err(CommandError::Local(Error::NoControl));
        }
        match rx.blocking_recv() {
            Ok(result) => result,
            // The session was closed or lost with the command outstanding.
            Err(_) => Err(CommandError::Local(Error::InvalidState)),
        }
    }

    /// [`blocking_command`](Self::blocking_command) for commands whose
    /// payload does not matter.
    pub fn blocking_simple_command(
        &self,
        request: CommandRequest,
    ) -> std::result::Result<(), CommandError> {
        self.blocking_command(request).map(|_| ())
    }

    fn submit_command(&self, request: CommandRequest, completion: Completion) -> bool {
        if self.state() != SessionState::ConnectedControl {
            return false;
        }
        let id = self.command_id.fetch_add(1, Ordering::Relaxed);
        let data = request.finalize(id);
        self.pending.lock().insert(id, completion);
        if self.ctrl_tx.send(Ctrl::SendCommand { id, data }).is_err() {
            self.pending.lock().remove(&id);
            return false;
        }
        true
    }

    /// Replace the whole simulator data set (`sim_data` control required).
    pub fn blocking_replace_sim_data(&self, body: Document) -> bool {
        self.blocking_simple_command(CommandRequest::with_body("sim_data", "replace", body))
            .is_ok()
    }

    /// Merge updates into the simulator data set.
    pub fn blocking_update_sim_data(&self, body: Document) -> bool {
        self.blocking_simple_command(CommandRequest::with_body("sim_data", "update", body))
            .is_ok()
    }

    pub fn async_replace_sim_data(
        &self,
        body: Document,
        callback: impl FnOnce(CommandResult) + Send + 'static,
    ) -> bool {
        self.async_command(CommandRequest::with_body("sim_data", "replace", body), callback)
    }

    pub fn async_update_sim_data(
        &self,
        body: Document,
        callback: impl FnOnce(CommandResult) + Send + 'static,
    ) -> bool {
        self.async_command(CommandRequest::with_body("sim_data", "update", body), callback)
    }

    // ── actions ────────────────────────────────────────────────────────

    pub(crate) fn try_send_action(&self, datagram: &[u8]) -> ActionResult {
        let guard = self.action_socket.lock();
        let Some(socket) = guard.as_ref() else {
            return ActionResult::Failed;
        };
        match socket.send(datagram) {
            Ok(_) => ActionResult::Complete,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => ActionResult::WouldBlock,
            Err(e) => {
                tracing::debug!("action send failed: {e}");
                ActionResult::Failed
            }
        }
    }

    pub(crate) fn send_action_blocking(&self, datagram: Vec<u8>) -> ActionResult {
        let (tx, rx) = oneshot::channel();
        if self
            .ctrl_tx
            .send(Ctrl::SendAction {
                data: datagram,
                done: ActionDone::Reply(tx),
            })
            .is_err()
        {
            return ActionResult::Failed;
        }
        rx.blocking_recv().unwrap_or(ActionResult::Failed)
    }

    pub(crate) fn send_action_async(&self, datagram: Vec<u8>, status: Arc<ActionStatusCell>) {
        if self
            .ctrl_tx
            .send(Ctrl::SendAction {
                data: datagram,
                done: ActionDone::Status(Arc::clone(&status)),
            })
            .is_err()
        {
            status.set(ActionResult::Failed);
        }
    }

    // ── timers ─────────────────────────────────────────────────────────

    /// Register a callback the reactor fires every `period`. The timer dies
    /// with the returned handle.
    pub fn create_periodic_timer(
        self: &Arc<Self>,
        period: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> PeriodicTimerHandle {
        let id = self.timer_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.ctrl_tx.send(Ctrl::AddTimer {
            id,
            period,
            callback: Box::new(callback),
        });
        PeriodicTimerHandle {
            session: Arc::downgrade(self),
            id,
        }
    }

    // ── reactor entry points ───────────────────────────────────────────

    /// Run everything that is ready without blocking.
    pub fn poll(self: &Arc<Self>) -> SessionState {
        // Another thread inside run_until_state_changes is already driving
        // the reactor; there is nothing for this poll to do.
        let Some(mut reactor) = self.reactor.try_lock() else {
            return self.state();
        };
        // A couple of rounds so work admitted by one arm (a control
        // message, a read) gets acted on within the same poll.
        for _ in 0..4 {
            let completed = self.runtime.block_on(async {
                tokio::time::timeout(Duration::ZERO, reactor.run(self))
                    .await
                    .is_ok()
            });
            if completed {
                break;
            }
        }
        self.state()
    }

    /// Drive the reactor until the state changes or [`stop`](Self::stop)
    /// is called.
    pub fn run_until_state_changes(self: &Arc<Self>) -> SessionState {
        let mut reactor = self.reactor.lock();
        self.runtime.block_on(reactor.run(self))
    }

    /// Wake and stop the reactor. Safe from any thread.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Close the session. Idempotent; outstanding async commands are
    /// abandoned without their callbacks being invoked, and blocked
    /// `blocking_command` callers fail with `InvalidState`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Invalid {
                return;
            }
            *state = SessionState::Invalid;
        }
        self.state_epoch.fetch_add(1, Ordering::Release);
        self.wake.notify_one();

        self.pending.lock().clear();
        *self.action_socket.lock() = None;
        self.controller_id.store(0, Ordering::Relaxed);
        let _ = self.ctrl_tx.send(Ctrl::Shutdown);
    }

    // ── reactor internals ──────────────────────────────────────────────

    fn read_keep_alive(&self) -> u32 {
        // SAFETY: the rendezvous rejected descriptors shorter than the
        // fixed field set, so the counter is inside the mapping.
        unsafe {
            (*(self.session_view.as_ptr().add(SESSION_KEEP_ALIVE_OFFSET) as *const AtomicU32))
                .load(Ordering::Relaxed)
        }
    }

    fn disconnected(self: &Arc<Self>) {
        self.set_state(SessionState::SessionLost);
        // Outstanding commands are abandoned: callbacks are not invoked,
        // blocked callers observe the dropped completion as InvalidState.
        self.pending.lock().clear();
        self.notify_state(SessionState::SessionLost, 0, 0);
    }

    /// Keep-alive supervision plus definition refresh; returns false when
    /// the session should stop running.
    fn periodic_update(self: &Arc<Self>) -> bool {
        let keep_alive = self.read_keep_alive();
        let stale = {
            let mut state = self.keep_alive.lock();
            if state.value != keep_alive {
                state.value = keep_alive;
                state.changed_at = Instant::now();
            }
            state.changed_at + KEEP_ALIVE_TIMEOUT < Instant::now()
        };

        match self.state() {
            SessionState::ConnectedMonitor => {
                if stale {
                    tracing::info!("backend keep-alive stalled, session lost");
                    self.disconnected();
                    return false;
                }
            }
            // With an established command stream, TCP liveness is the
            // authority; the tick only refreshes definitions.
            SessionState::ConnectedControl => {}
            SessionState::SessionLost | SessionState::Invalid => return false,
        }

        self.check_definitions();
        true
    }

    fn check_definitions(self: &Arc<Self>) {
        if self.device_info.update() == UpdateOutcome::NewData {
            self.events
                .notify(Event::DeviceInfoChanged(Arc::clone(self)));
        }
        if self.variable_store.refresh() {
            self.events
                .notify(Event::VariableDefinitionsChanged(Arc::clone(self)));
        }
        if self.telemetry_system.refresh() {
            self.events
                .notify(Event::TelemetryDefinitionsChanged(Arc::clone(self)));
        }
        if self.sim_data.update() == UpdateOutcome::NewData {
            self.events.notify(Event::SimDataChanged(Arc::clone(self)));
        }
    }

    fn dispatch_reply(&self, doc: &Document) {
        let Some(reply) = parse_reply(doc) else {
            tracing::warn!("dropping unexpected stream document");
            return;
        };
        let completion = self.pending.lock().remove(&reply.user_data);
        match completion {
            Some(Completion::Callback(callback)) => callback(reply.result),
            Some(Completion::Reply(tx)) => {
                let _ = tx.send(reply.result);
            }
            None => {
                tracing::debug!(id = reply.user_data, "reply for unknown command id");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // No Arc is left, so there is nothing to emit events to; just make
        // sure waiters cannot hang.
        self.pending.get_mut().clear();
    }
}

/// Handle to a periodic reactor timer; dropping it cancels the timer.
pub struct PeriodicTimerHandle {
    session: Weak<Session>,
    id: i32,
}

impl PeriodicTimerHandle {
    /// Cancel the timer now.
    pub fn cancel(self) {}
}

impl Drop for PeriodicTimerHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            let _ = session.ctrl_tx.send(Ctrl::RemoveTimer { id: self.id });
            session.wake.notify_one();
        }
    }
}

struct TimerEntry {
    id: i32,
    period: Duration,
    next: Instant,
    callback: Box<dyn FnMut() + Send>,
}

enum Step {
    Woken,
    Ctrl(Option<Ctrl>),
    Read(std::io::Result<usize>),
    Wrote(std::io::Result<usize>),
    SentUdp(std::io::Result<usize>),
    Sleep,
}

pub(crate) struct Reactor {
    ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
    tcp: Option<tokio::net::TcpStream>,
    udp: Option<tokio::net::UdpSocket>,
    rx_buf: Vec<u8>,
    /// Outgoing command stream data. The front datagram may be partially
    /// written (`tx_offset`), so a cancelled `run` resumes cleanly without
    /// tearing stream framing.
    tx_queue: std::collections::VecDeque<Vec<u8>>,
    tx_offset: usize,
    udp_queue: std::collections::VecDeque<(Vec<u8>, ActionDone)>,
    timers: Vec<TimerEntry>,
    next_tick: Instant,
}

impl Reactor {
    fn new(ctrl_rx: mpsc::UnboundedReceiver<Ctrl>) -> Reactor {
        Reactor {
            ctrl_rx,
            tcp: None,
            udp: None,
            rx_buf: Vec::new(),
            tx_queue: std::collections::VecDeque::new(),
            tx_offset: 0,
            udp_queue: std::collections::VecDeque::new(),
            timers: Vec::new(),
            // First tick runs immediately so freshly published definitions
            // surface without waiting half a second.
            next_tick: Instant::now(),
        }
    }

    fn drop_link(&mut self) {
        self.tcp = None;
        self.rx_buf.clear();
        self.tx_queue.clear();
        self.tx_offset = 0;
    }

    fn fail_udp_queue(&mut self) {
        for (_, done) in self.udp_queue.drain(..) {
            match done {
                ActionDone::Status(cell) => cell.set(ActionResult::Failed),
                ActionDone::Reply(tx) => {
                    let _ = tx.send(ActionResult::Failed);
                }
            }
        }
    }

    async fn run(&mut self, session: &Arc<Session>) -> SessionState {
        let entry_epoch = session.state_epoch.load(Ordering::Acquire);

        loop {
            // A stop request is consumed by whichever run observes it, so a
            // stop() issued between runs still breaks the next one promptly.
            if session.stop_flag.swap(false, Ordering::AcqRel)
                || session.state_epoch.load(Ordering::Acquire) != entry_epoch
            {
                return session.state();
            }

            if self.udp.is_none() && !self.udp_queue.is_empty() {
                self.fail_udp_queue();
            }

            let mut wake_at = self.next_tick;
            for timer in &self.timers {
                if timer.next < wake_at {
                    wake_at = timer.next;
                }
            }
            let sleep_at = tokio::time::Instant::from_std(wake_at);

            let mut tmp = [0u8; 4096];
            let has_tx = !self.tx_queue.is_empty();
            let has_udp = !self.udp_queue.is_empty() && self.udp.is_some();
            let tx_front = self.tx_queue.front().map(|d| &d[self.tx_offset..]);
            let udp_front = self.udp_queue.front().map(|(d, _)| d.as_slice());
            let udp = &self.udp;

            let step = if let Some(stream) = self.tcp.as_mut() {
                let (mut rd, mut wr) = stream.split();
                tokio::select! {
                    biased;
                    _ = session.wake.notified() => Step::Woken,
                    msg = self.ctrl_rx.recv() => Step::Ctrl(msg),
                    r = async { wr.write(tx_front.unwrap_or(&[])).await }, if has_tx => {
                        Step::Wrote(r)
                    }
                    r = rd.read(&mut tmp) => Step::Read(r),
                    r = async {
                        match udp.as_ref() {
                            Some(socket) => socket.send(udp_front.unwrap_or(&[])).await,
                            None => std::future::pending().await,
                        }
                    }, if has_udp => Step::SentUdp(r),
                    _ = tokio::time::sleep_until(sleep_at) => Step::Sleep,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = session.wake.notified() => Step::Woken,
                    msg = self.ctrl_rx.recv() => Step::Ctrl(msg),
                    r = async {
                        match udp.as_ref() {
                            Some(socket) => socket.send(udp_front.unwrap_or(&[])).await,
                            None => std::future::pending().await,
                        }
                    }, if has_udp => Step::SentUdp(r),
                    _ = tokio::time::sleep_until(sleep_at) => Step::Sleep,
                }
            };

            match step {
                Step::Woken => {}
                Step::Ctrl(None) => return session.state(),
                Step::Ctrl(Some(ctrl)) => self.handle_ctrl(session, ctrl),
                Step::Read(Ok(0)) => {
                    tracing::info!("command stream closed by backend");
                    self.drop_link();
                    session.disconnected();
                }
                Step::Read(Ok(n)) => {
                    self.rx_buf.extend_from_slice(&tmp[..n]);
                    match drain_documents(&mut self.rx_buf) {
                        Ok(docs) => {
                            for doc in docs {
                                session.dispatch_reply(&doc);
                            }
                        }
                        Err(()) => {
                            tracing::warn!("command stream framing lost, dropping link");
                            self.drop_link();
                            session.disconnected();
                        }
                    }
                }
                Step::Read(Err(e)) => {
                    tracing::warn!("command stream read failed: {e}");
                    self.drop_link();
                    session.disconnected();
                }
                Step::Wrote(Ok(n)) => {
                    self.tx_offset += n;
                    if self
                        .tx_queue
                        .front()
                        .is_some_and(|d| self.tx_offset >= d.len())
                    {
                        self.tx_queue.pop_front();
                        self.tx_offset = 0;
                    }
                }
                Step::Wrote(Err(e)) => {
                    tracing::warn!("command stream write failed: {e}");
                    self.drop_link();
                    session.disconnected();
                }
                Step::SentUdp(result) => {
                    if let Some((_, done)) = self.udp_queue.pop_front() {
                        let outcome = match result {
                            Ok(_) => ActionResult::Complete,
                            Err(e) => {
                                tracing::debug!("queued action send failed: {e}");
                                ActionResult::Failed
                            }
                        };
                        match done {
                            ActionDone::Status(cell) => cell.set(outcome),
                            ActionDone::Reply(tx) => {
                                let _ = tx.send(outcome);
                            }
                        }
                    }
                }
                Step::Sleep => {
                    let now = Instant::now();
                    self.fire_timers(now);
                    if now >= self.next_tick {
                        self.next_tick = now + UPDATE_TICK;
                        if !session.periodic_update() {
                            return session.state();
                        }
                    }
                }
            }
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        for timer in &mut self.timers {
            if timer.next <= now {
                (timer.callback)();
                timer.next = now + timer.period;
            }
        }
    }

    fn handle_ctrl(&mut self, session: &Arc<Session>, ctrl: Ctrl) {
        match ctrl {
            Ctrl::InstallLink { tcp, udp } => {
                self.drop_link();
                match tokio::net::TcpStream::from_std(tcp) {
                    Ok(stream) => self.tcp = Some(stream),
                    Err(e) => {
                        tracing::error!("cannot register command stream: {e}");
                        session.disconnected();
                        return;
                    }
                }
                match tokio::net::UdpSocket::from_std(udp) {
                    Ok(socket) => self.udp = Some(socket),
                    Err(e) => tracing::error!("cannot register action socket: {e}"),
                }
            }
            Ctrl::SendCommand { id, data } => {
                if self.tcp.is_some() {
                    self.tx_queue.push_back(data);
                } else {
                    // Abandon: the waiter sees the dropped completion.
                    session.pending.lock().remove(&id);
                }
            }
            Ctrl::SendAction { data, done } => {
                if self.udp.is_some() {
                    self.udp_queue.push_back((data, done));
                } else {
                    match done {
                        ActionDone::Status(cell) => cell.set(ActionResult::Failed),
                        ActionDone::Reply(tx) => {
                            let _ = tx.send(ActionResult::Failed);
                        }
                    }
                }
            }
            Ctrl::AddTimer {
                id,
                period,
                callback,
            } => self.timers.push(TimerEntry {
                id,
                period,
                next: Instant::now() + period,
                callback,
            }),
            Ctrl::RemoveTimer { id } => self.timers.retain(|t| t.id != id),
            Ctrl::Shutdown => {
                self.drop_link();
                self.udp = None;
                self.timers.clear();
                self.fail_udp_queue();
            }
        }
    }
}
