//! Multi-consumer event fan-out.
//!
//! One producer per `ApiCore` pushes session events into every open queue.
//! The producer only holds weak references, so dropping a queue is all it
//! takes to unsubscribe; dead queues are pruned on the next notify.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::SessionState;
use crate::session::Session;

/// Session events delivered through [`EventQueue`].
#[derive(Clone)]
pub enum Event {
    /// The session changed state, or re-registered with different control
    /// flags.
    SessionStateChanged {
        session: Arc<Session>,
        state: SessionState,
        /// 0 until the session registers to control.
        controller_id: u16,
        control_flags: u32,
    },
    /// The device info blob has new content.
    DeviceInfoChanged(Arc<Session>),
    /// New variable definitions were appended.
    VariableDefinitionsChanged(Arc<Session>),
    /// New telemetry definitions were appended.
    TelemetryDefinitionsChanged(Arc<Session>),
    /// The simulator data blob has new content.
    SimDataChanged(Arc<Session>),
}

impl Event {
    /// The session the event belongs to.
    pub fn session(&self) -> &Arc<Session> {
        match self {
            Event::SessionStateChanged { session, .. } => session,
            Event::DeviceInfoChanged(s)
            | Event::VariableDefinitionsChanged(s)
            | Event::TelemetryDefinitionsChanged(s)
            | Event::SimDataChanged(s) => s,
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::SessionStateChanged {
                state,
                controller_id,
                control_flags,
                ..
            } => f
                .debug_struct("SessionStateChanged")
                .field("state", state)
                .field("controller_id", controller_id)
                .field("control_flags", control_flags)
                .finish(),
            Event::DeviceInfoChanged(_) => f.write_str("DeviceInfoChanged"),
            Event::VariableDefinitionsChanged(_) => f.write_str("VariableDefinitionsChanged"),
            Event::TelemetryDefinitionsChanged(_) => f.write_str("TelemetryDefinitionsChanged"),
            Event::SimDataChanged(_) => f.write_str("SimDataChanged"),
        }
    }
}

struct QueueState<T> {
    queue: VecDeque<T>,
    open: bool,
}

struct QueueShared<T> {
    state: Mutex<QueueState<T>>,
    cv: Condvar,
}

/// A thread-safe consumer queue.
///
/// After [`close`](EventQueue::close), already-queued events still drain;
/// once empty every pop reports end-of-stream (`None`) without blocking.
pub struct EventQueue<T = Event> {
    shared: Arc<QueueShared<T>>,
}

impl<T> EventQueue<T> {
    /// Take the first event if one is queued.
    pub fn try_pop(&self) -> Option<T> {
        self.shared.state.lock().queue.pop_front()
    }

    /// Take the first event, waiting up to `timeout` for one to arrive.
    pub fn try_pop_for(&self, timeout: Duration) -> Option<T> {
        self.try_pop_until(Instant::now() + timeout)
    }

    /// Take the first event, waiting until `deadline` for one to arrive.
    pub fn try_pop_until(&self, deadline: Instant) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some(event);
            }
            if !state.open {
                return None;
            }
            if self.shared.cv.wait_until(&mut state, deadline).timed_out() {
                return state.queue.pop_front();
            }
        }
    }

    /// Block until an event arrives. Returns `None` once the queue has been
    /// closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some(event);
            }
            if !state.open {
                return None;
            }
            self.shared.cv.wait(&mut state);
        }
    }

    /// Close the queue: no further events will be delivered and any blocked
    /// consumer wakes up.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.open {
            state.open = false;
            self.shared.cv.notify_all();
        }
    }
}

/// The producing side of the fan-out.
pub struct EventProducer<T = Event> {
    queues: Mutex<Vec<Weak<QueueShared<T>>>>,
}

impl<T: Clone> EventProducer<T> {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Vec::new()),
        }
    }

    /// Create a new open queue attached to this producer.
    pub fn subscribe(&self) -> EventQueue<T> {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                open: true,
            }),
            cv: Condvar::new(),
        });
        self.queues.lock().push(Arc::downgrade(&shared));
        EventQueue { shared }
    }

    /// Push an event into one queue without notifying the rest, used to
    /// seed a fresh queue with the current session state.
    pub fn push_initial(&self, queue: &EventQueue<T>, event: T) {
        let mut state = queue.shared.state.lock();
        if state.open {
            state.queue.push_back(event);
        }
    }

    /// Deliver an event to every open queue, pruning dropped ones.
    pub fn notify(&self, event: T) {
        let mut queues = self.queues.lock();
        queues.retain(|weak| {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            let mut state = shared.state.lock();
            if state.open {
                state.queue.push_back(event.clone());
                shared.cv.notify_one();
            }
            true
        });
    }
}

impl<T: Clone> Default for EventProducer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for EventProducer<T> {
    fn drop(&mut self) {
        for weak in self.queues.lock().drain(..) {
            if let Some(shared) = weak.upgrade() {
                let mut state = shared.state.lock();
                state.open = false;
                shared.cv.notify_all();
            }
        }
    }
}
