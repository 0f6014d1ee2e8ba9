//! Background session runner.
//!
//! [`Api`] owns a worker thread that keeps a session open: it drives the
//! reactor, reopens after the backend goes away (with a short debounce) and
//! feeds a listener list with state transitions. The control-enabler
//! listeners re-apply a registration policy on every reconnect, so an
//! application keeps its control authority across backend restarts without
//! doing anything.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::SessionState;
use crate::events::{Event, EventQueue};
use crate::rendezvous::ApiCore;
use crate::secure::{try_key_exchange, SecureSession};
use crate::session::{ApiUserInformation, Session};

const RECONNECT_DEBOUNCE: Duration = Duration::from_secs(1);
const DISCONNECTED_PROBE_PERIOD: Duration = Duration::from_secs(4);

/// Callbacks invoked from the runner thread.
///
/// All methods have empty defaults; implement what the policy needs.
#[allow(unused_variables)]
pub trait ApiListener: Send {
    /// The listener was installed; `session` is the currently open session.
    fn listener_added(&mut self, session: Option<&Arc<Session>>) {}
    /// The listener was removed and will not be called again.
    fn listener_removed(&mut self) {}
    fn session_state_changed(&mut self, session: &Arc<Session>, state: SessionState) {}
    fn control_flags_changed(&mut self, session: &Arc<Session>, control_flags: u32) {}
}

/// Identifies a listener for [`Api::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

enum ListenerAction {
    Add(ListenerId, Box<dyn ApiListener>),
    Remove(ListenerId, Sender<()>),
}

struct ApiState {
    running: bool,
    actions: VecDeque<ListenerAction>,
    active: Option<Arc<Session>>,
    next_listener_id: u64,
}

struct ApiShared {
    state: Mutex<ApiState>,
    wake: Condvar,
}

/// Owns the rendezvous core plus the worker thread driving it.
pub struct Api {
    core: Arc<ApiCore>,
    shared: Arc<ApiShared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Api {
    pub fn new() -> Api {
        Api::with_core(ApiCore::new())
    }

    /// Run against an explicit [`ApiCore`] (custom shared-memory root).
    pub fn with_core(core: ApiCore) -> Api {
        let core = Arc::new(core);
        let shared = Arc::new(ApiShared {
            state: Mutex::new(ApiState {
                running: true,
                actions: VecDeque::new(),
                active: None,
                next_listener_id: 1,
            }),
            wake: Condvar::new(),
        });

        let worker = {
            let core = Arc::clone(&core);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("servolink-api".to_string())
                .spawn(move || worker_main(&core, &shared))
                .expect("spawning the api worker thread")
        };

        Api {
            core,
            shared,
            worker: Some(worker),
        }
    }

    /// The currently open session, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.shared.state.lock().active.clone()
    }

    /// Create a consumer queue for session events.
    pub fn create_event_queue(&self) -> EventQueue<Event> {
        self.core.create_event_queue()
    }

    /// Install a listener. Its `listener_added` runs on the worker thread.
    pub fn add_listener(&self, listener: Box<dyn ApiListener>) -> ListenerId {
        let mut state = self.shared.state.lock();
        let id = ListenerId(state.next_listener_id);
        state.next_listener_id += 1;
        state.actions.push_back(ListenerAction::Add(id, listener));
        self.nudge_worker(&mut state);
        id
    }

    /// Remove a listener, blocking until its `listener_removed` ran.
    pub fn remove_listener(&self, id: ListenerId) {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        {
            let mut state = self.shared.state.lock();
            state.actions.push_back(ListenerAction::Remove(id, done_tx));
            self.nudge_worker(&mut state);
        }
        let _ = done_rx.recv();
    }

    /// Install a policy that registers for control (without a secure
    /// session) on every connect.
    pub fn enable_control(
        &self,
        control_flags: u32,
        id_name: impl Into<String>,
        user_info: ApiUserInformation,
    ) -> ListenerId {
        self.add_listener(Box::new(NoAuthControlEnabler {
            control_flags,
            id_name: id_name.into(),
            user_info,
        }))
    }

    /// Install a policy that runs the secure handshake and then registers
    /// on every connect.
    pub fn enable_secure_control(
        &self,
        control_flags: u32,
        id_name: impl Into<String>,
        user_info: ApiUserInformation,
        public_key: Vec<u8>,
        private_key: Vec<u8>,
    ) -> ListenerId {
        self.add_listener(Box::new(SecureControlEnabler {
            control_flags,
            id_name: id_name.into(),
            user_info,
            public_key,
            private_key,
        }))
    }

    fn nudge_worker(&self, state: &mut ApiState) {
        // Break the worker out of run_until_state_changes or its idle wait
        // so the action queue drains promptly.
        if let Some(session) = &state.active {
            session.stop();
        }
        self.wake_worker();
    }

    fn wake_worker(&self) {
        self.shared.wake.notify_all();
    }
}

impl Default for Api {
    fn default() -> Self {
        Api::new()
    }
}

impl Drop for Api {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            if let Some(session) = &state.active {
                session.stop();
            }
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_main(core: &ApiCore, shared: &ApiShared) {
    let mut listeners: Vec<(ListenerId, Box<dyn ApiListener>)> = Vec::new();
    let mut active: Option<Arc<Session>> = None;
    let mut prev_state = SessionState::Invalid;
    let mut active_control_flags = 0u32;

    loop {
        if let Some(session) = &active {
            let state = session.run_until_state_changes();

            if state != prev_state {
                prev_state = state;
                for (_, listener) in &mut listeners {
                    listener.session_state_changed(session, state);
                }
            }

            if state == SessionState::SessionLost {
                session.close();
                {
                    let mut api_state = shared.state.lock();
                    api_state.active = None;
                    // Debounce before reopening so a restarting backend is
                    // not immediately re-attached mid-teardown.
                    if api_state.running {
                        shared
                            .wake
                            .wait_for(&mut api_state, RECONNECT_DEBOUNCE);
                    }
                }
                active = None;
            } else {
                let control_flags = session.control_flags();
                if control_flags != active_control_flags {
                    active_control_flags = control_flags;
                    for (_, listener) in &mut listeners {
                        listener.control_flags_changed(session, control_flags);
                    }
                }
            }
        } else {
            match core.open_session() {
                Ok(session) => {
                    {
                        let mut api_state = shared.state.lock();
                        api_state.active = Some(Arc::clone(&session));
                    }
                    prev_state = SessionState::ConnectedMonitor;
                    active_control_flags = 0;
                    for (_, listener) in &mut listeners {
                        listener.session_state_changed(&session, SessionState::ConnectedMonitor);
                    }
                    active = Some(session);
                }
                Err(e) if e.is_transient() => {}
                Err(e) => {
                    tracing::warn!("session open failed: {e}");
                }
            }
        }

        // Idle wait and listener bookkeeping.
        let (actions, closing) = {
            let mut api_state = shared.state.lock();
            if active.is_none() && api_state.running && api_state.actions.is_empty() {
                shared
                    .wake
                    .wait_for(&mut api_state, DISCONNECTED_PROBE_PERIOD);
            }
            (
                std::mem::take(&mut api_state.actions),
                !api_state.running,
            )
        };

        for action in actions {
            match action {
                ListenerAction::Add(id, mut listener) => {
                    listener.listener_added(active.as_ref());
                    listeners.push((id, listener));
                }
                ListenerAction::Remove(id, done) => {
                    if let Some(at) = listeners.iter().position(|(lid, _)| *lid == id) {
                        let (_, mut listener) = listeners.remove(at);
                        listener.listener_removed();
                    }
                    let _ = done.send(());
                }
            }
        }

        if closing {
            break;
        }
    }

    if let Some(session) = active {
        {
            let mut api_state = shared.state.lock();
            api_state.active = None;
        }
        for (_, listener) in &mut listeners {
            listener.session_state_changed(&session, SessionState::SessionLost);
        }
        session.close();
    }
    for (_, mut listener) in listeners {
        listener.listener_removed();
    }
}

/// Registration policy without a secure session.
struct NoAuthControlEnabler {
    control_flags: u32,
    id_name: String,
    user_info: ApiUserInformation,
}

impl NoAuthControlEnabler {
    fn register(&self, session: &Arc<Session>) {
        if let Err(e) =
            session.register_to_control(self.control_flags, &self.id_name, &self.user_info, None)
        {
            tracing::warn!(id_name = %self.id_name, "control registration failed: {e}");
        }
    }
}

impl ApiListener for NoAuthControlEnabler {
    fn listener_added(&mut self, session: Option<&Arc<Session>>) {
        if let Some(session) = session {
            self.register(session);
        }
    }

    fn session_state_changed(&mut self, session: &Arc<Session>, state: SessionState) {
        if state == SessionState::ConnectedMonitor {
            self.register(session);
        }
    }
}

/// Registration policy that establishes a secure session first.
struct SecureControlEnabler {
    control_flags: u32,
    id_name: String,
    user_info: ApiUserInformation,
    public_key: Vec<u8>,
    private_key: Vec<u8>,
}

impl SecureControlEnabler {
    fn register(&self, session: &Arc<Session>) {
        let options = session.secure_session_options();
        let Some(offer) = options.preferred_offer() else {
            tracing::warn!("backend offers no supported secure-session method");
            return;
        };

        let params = match try_key_exchange(
            options.session_id,
            offer,
            &self.private_key,
            &self.public_key,
        ) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("secure session key exchange failed: {e}");
                return;
            }
        };
        let secure = SecureSession::establish(params, &self.id_name);

        if let Err(e) = session.register_to_control(
            self.control_flags,
            &self.id_name,
            &self.user_info,
            Some(secure),
        ) {
            tracing::warn!(id_name = %self.id_name, "secure control registration failed: {e}");
        }
    }
}

impl ApiListener for SecureControlEnabler {
    fn listener_added(&mut self, session: Option<&Arc<Session>>) {
        if let Some(session) = session {
            self.register(session);
        }
    }

    fn session_state_changed(&mut self, session: &Arc<Session>, state: SessionState) {
        if state == SessionState::ConnectedMonitor {
            self.register(session);
        }
    }
}
