//! Session rendezvous.
//!
//! The entry point of the whole client: locate the backend through the
//! well-known core region, copy the active session's descriptor past its
//! revision barrier, validate everything and map the per-session blobs.
//!
//! Region names resolve against a shared-memory root directory, taken from
//! `SERVOLINK_SHM_DIR` or the system temp dir.

use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use servolink_shm::{ShmView, ShmViewError, BLOCK_HEADER_SIZE};
use servolink_wire::core::{
    CORE_REGION_MIN_LEN, CORE_REVISION_COUNTER_OFFSET, CORE_SESSION_ID_OFFSET,
};
use servolink_wire::{
    versions_compatible, CoreRegion, CoreState, SessionShmState, SubBlobId, CORE_SHM_NAME,
    CORE_SHM_SIZE, CORE_SHM_VERSION, SESSION_SHM_VERSION, SessionDescriptor,
};
use servolink_wire::core::{SESSION_DATA_SIZE_OFFSET, SESSION_DESCRIPTOR_MIN_LEN};

use crate::error::{Error, Result, SessionState};
use crate::events::{Event, EventProducer, EventQueue};
use crate::session::{Session, SessionResources};

const RENDEZVOUS_DEADLINE: Duration = Duration::from_millis(500);
const WRITER_BUSY_RETRY: Duration = Duration::from_millis(5);

/// Environment override for the shared-memory root directory.
pub const SHM_DIR_ENV: &str = "SERVOLINK_SHM_DIR";

fn default_shm_root() -> PathBuf {
    std::env::var_os(SHM_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

struct SessionRef {
    id: u32,
    version: u32,
    size: u32,
    path: String,
}

struct CoreShared {
    core_view: Option<ShmView>,
    active: Option<Arc<Session>>,
}

/// The rendezvous engine and session factory.
///
/// Holds at most one active session; `open_session` fails with
/// [`Error::AlreadyOpen`] until the previous one is closed or lost.
pub struct ApiCore {
    shm_root: PathBuf,
    events: Arc<EventProducer<Event>>,
    shared: Mutex<CoreShared>,
}

impl ApiCore {
    pub fn new() -> ApiCore {
        ApiCore::with_shm_root(default_shm_root())
    }

    /// Use an explicit shared-memory root instead of the default.
    pub fn with_shm_root(root: impl Into<PathBuf>) -> ApiCore {
        ApiCore {
            shm_root: root.into(),
            events: Arc::new(EventProducer::new()),
            shared: Mutex::new(CoreShared {
                core_view: None,
                active: None,
            }),
        }
    }

    pub fn shm_root(&self) -> &Path {
        &self.shm_root
    }

    /// The currently open session, if any.
    pub fn open_session_handle(&self) -> Option<Arc<Session>> {
        self.shared.lock().active.clone()
    }

    /// Create a consumer queue for session events.
    ///
    /// When a session is already open the queue starts with a synthetic
    /// `SessionStateChanged` so the consumer's view begins in sync.
    pub fn create_event_queue(&self) -> EventQueue<Event> {
        let queue = self.events.subscribe();
        let shared = self.shared.lock();
        if let Some(session) = &shared.active {
            let state = session.state();
            if state != SessionState::Invalid {
                self.events.push_initial(
                    &queue,
                    Event::SessionStateChanged {
                        session: Arc::clone(session),
                        state,
                        controller_id: session.controller_id(),
                        control_flags: session.control_flags(),
                    },
                );
            }
        }
        queue
    }

    pub(crate) fn events(&self) -> &Arc<EventProducer<Event>> {
        &self.events
    }

    /// Attach to the backend's active session.
    ///
    /// Fails fast on permanent problems; `Busy`, `CannotConnect` and
    /// `Timeout` are worth retrying after a moment.
    pub fn open_session(&self) -> Result<Arc<Session>> {
        let mut guard = self.shared.lock();
        let shared = &mut *guard;

        if let Some(active) = &shared.active {
            match active.state() {
                SessionState::Invalid | SessionState::SessionLost => shared.active = None,
                _ => return Err(Error::AlreadyOpen),
            }
        }

        if shared.core_view.is_none() {
            let path = self.shm_root.join(CORE_SHM_NAME);
            shared.core_view =
                Some(ShmView::open_with_min_len(&path, CORE_SHM_SIZE).map_err(|e| match e {
                    ShmViewError::NotAvailable => Error::CannotConnect,
                    ShmViewError::Io(_) => Error::CannotConnect,
                })?);
        }
        let core_view = shared
            .core_view
            .as_ref()
            .expect("core view installed above");

        // The backend bumps the keep-alive at 10 Hz or faster, so half a
        // second is plenty to catch it between descriptor updates.
        let start = Instant::now();
        let mut resolved = None;
        while start.elapsed() < RENDEZVOUS_DEADLINE {
            let session_ref = match try_copy_session_ref(core_view) {
                Ok(r) => r,
                Err(Error::Busy) => {
                    std::thread::sleep(WRITER_BUSY_RETRY);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let session_view = self.open_session_region(&session_ref)?;
            let descriptor = copy_descriptor(&session_view, &session_ref)?;
            resolved = Some((session_ref, session_view, descriptor));
            break;
        }
        let Some((session_ref, session_view, descriptor)) = resolved else {
            return Err(Error::Timeout);
        };

        if !descriptor.limits_valid() {
            // A bad floor means corrupted shared memory, an unknown UDP
            // major means an incompatible backend.
            return if descriptor.udp_protocol_version >> 16
                != servolink_wire::UDP_PROTOCOL_VERSION_MAJOR
            {
                Err(Error::Incompatible)
            } else {
                Err(Error::Protocol)
            };
        }

        let resources = self.open_sub_blobs(&descriptor, session_view)?;

        // The session may have been replaced while we were validating; the
        // caller retries against the new one.
        let live_session_id = unsafe {
            (*(core_view.as_ptr().add(CORE_SESSION_ID_OFFSET) as *const AtomicU32))
                .load(Ordering::Relaxed)
        };
        if live_session_id != session_ref.id {
            return Err(Error::Busy);
        }

        let session = Session::new(resources, Arc::clone(&self.events))?;
        shared.active = Some(Arc::clone(&session));
        drop(guard);

        self.events.notify(Event::SessionStateChanged {
            session: Arc::clone(&session),
            state: SessionState::ConnectedMonitor,
            controller_id: 0,
            control_flags: 0,
        });
        Ok(session)
    }

    fn open_session_region(&self, session_ref: &SessionRef) -> Result<ShmView> {
        ShmView::open_with_min_len(
            &self.shm_root.join(&session_ref.path),
            SESSION_DESCRIPTOR_MIN_LEN,
        )
        .map_err(|_| Error::CannotConnect)
    }

    fn open_sub_blobs(
        &self,
        descriptor: &SessionDescriptor,
        session_view: ShmView,
    ) -> Result<SessionResources> {
        let mut open_blob = |id: SubBlobId| -> Result<ShmView> {
            let blob = descriptor
                .find_sub_blob(id.id, id.version)
                .ok_or(Error::Incompatible)?;
            ShmView::open_with_min_len(&self.shm_root.join(&blob.path), BLOCK_HEADER_SIZE)
                .map_err(|_| Error::CannotConnect)
        };

        Ok(SessionResources {
            device_info_view: open_blob(SubBlobId::DEVICE_INFO)?,
            variable_header_view: open_blob(SubBlobId::VARIABLE_HEADER)?,
            variable_data_view: open_blob(SubBlobId::VARIABLE_DATA)?,
            telemetry_view: open_blob(SubBlobId::TELEMETRY_DEFINITIONS)?,
            sim_data_view: open_blob(SubBlobId::SIM_DATA)?,
            descriptor: descriptor.clone(),
            session_view,
        })
    }
}

impl Default for ApiCore {
    fn default() -> Self {
        ApiCore::new()
    }
}

/// Copy the session reference out of the core region past its revision
/// counter.
fn try_copy_session_ref(core_view: &ShmView) -> Result<SessionRef> {
    let base = core_view.as_ptr();

    // SAFETY: the view is at least CORE_SHM_SIZE and page aligned.
    let revision = unsafe {
        (*(base.add(CORE_REVISION_COUNTER_OFFSET) as *const AtomicU32)).load(Ordering::Relaxed)
    };
    if revision & 1 != 0 {
        return Err(Error::Busy);
    }
    fence(Ordering::Acquire);

    let mut copy = [0u8; CORE_REGION_MIN_LEN];
    unsafe { std::ptr::copy_nonoverlapping(base, copy.as_mut_ptr(), copy.len()) };
    let core = CoreRegion::parse(&copy).ok_or(Error::Protocol)?;

    if !versions_compatible(CORE_SHM_VERSION, core.version) {
        return Err(Error::Incompatible);
    }
    if core.state != CoreState::Active {
        return Err(Error::CannotConnect);
    }

    fence(Ordering::AcqRel);
    let end_revision = unsafe {
        (*(base.add(CORE_REVISION_COUNTER_OFFSET) as *const AtomicU32)).load(Ordering::Relaxed)
    };
    if end_revision != revision {
        return Err(Error::Busy);
    }

    Ok(SessionRef {
        id: core.session_id,
        version: core.session_version,
        size: core.session_shm_size,
        path: core.session_shm_path,
    })
}

/// Copy the descriptor into an owned buffer and decode it.
///
/// The copy defends against concurrent mutation of the shared region; all
/// validation below runs against the copy only.
fn copy_descriptor(session_view: &ShmView, session_ref: &SessionRef) -> Result<SessionDescriptor> {
    let base = session_view.as_ptr();

    // SAFETY: the view is at least SESSION_DESCRIPTOR_MIN_LEN long.
    let live_size = unsafe {
        (*(base.add(SESSION_DATA_SIZE_OFFSET) as *const AtomicU32)).load(Ordering::Relaxed)
    } as usize;
    fence(Ordering::Acquire);

    if live_size < SESSION_DESCRIPTOR_MIN_LEN
        || live_size > session_view.len()
        || live_size as u64 > u64::from(session_ref.size)
    {
        return Err(Error::CannotConnect);
    }

    let mut copy = vec![0u8; live_size];
    unsafe { std::ptr::copy_nonoverlapping(base, copy.as_mut_ptr(), live_size) };

    let descriptor = SessionDescriptor::parse(&copy).map_err(|_| Error::Protocol)?;

    if descriptor.session_id != session_ref.id
        || descriptor.session_version != session_ref.version
    {
        return Err(Error::CannotConnect);
    }
    if !versions_compatible(SESSION_SHM_VERSION, descriptor.session_version) {
        return Err(Error::Incompatible);
    }
    if descriptor.state != SessionShmState::Active {
        return Err(Error::CannotConnect);
    }
    Ok(descriptor)
}
