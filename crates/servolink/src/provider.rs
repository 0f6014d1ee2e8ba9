//! Cached snapshot provider for BSON-bodied shared blocks.
//!
//! Wraps the seqlock reader for one mapped block: `update()` takes a fresh
//! snapshot when the revision moved, structurally validates it and swaps it
//! into the cache atomically. Readers always get the last good snapshot, so
//! a corrupted write by the backend degrades to stale data plus a `Failed`
//! result, never to a torn read.

use std::sync::Arc;

use parking_lot::RwLock;
use servolink_shm::{read_block_snapshot, ShmView, Snapshot, BLOCK_HEADER_SIZE};
use servolink_wire::blocks::BsonBlockBody;
use servolink_wire::BSON_BLOCK_BODY_SIZE;

use crate::bson_check::validate_document;

/// Result of one provider refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new validated snapshot replaced the cache.
    NewData,
    /// The block revision has not moved; the cache is untouched.
    NoChange,
    /// No consistent snapshot could be taken, or validation failed. The
    /// previous snapshot stays available.
    Failed,
}

struct Cache {
    buf: Option<Arc<[u8]>>,
    revision: u32,
}

/// Snapshot cache over one BSON-bodied block.
pub struct BsonBlockProvider {
    view: ShmView,
    known_version: u32,
    cache: RwLock<Cache>,
}

impl BsonBlockProvider {
    pub fn new(view: ShmView, known_version: u32) -> Self {
        Self {
            view,
            known_version,
            cache: RwLock::new(Cache {
                buf: None,
                revision: 0,
            }),
        }
    }

    /// The latest validated snapshot with its revision, if any.
    pub fn raw(&self) -> Option<(Arc<[u8]>, u32)> {
        let cache = self.cache.read();
        cache.buf.clone().map(|buf| (buf, cache.revision))
    }

    /// Refresh the cache from shared memory.
    pub fn update(&self) -> UpdateOutcome {
        let prev_revision = self.cache.read().revision;
        let base = self.view.as_ptr();
        let mapped_len = self.view.len();

        if mapped_len < BLOCK_HEADER_SIZE + BSON_BLOCK_BODY_SIZE {
            return UpdateOutcome::Failed;
        }

        // SAFETY: `base` is a live mapping of `mapped_len` bytes held by
        // `self.view`; the bounds closure reads only the body prefix, which
        // the length check above guarantees is mapped.
        let snapshot = unsafe {
            read_block_snapshot(
                base,
                mapped_len,
                self.known_version,
                prev_revision,
                |announced| {
                    let mut head = [0u8; BLOCK_HEADER_SIZE + BSON_BLOCK_BODY_SIZE];
                    unsafe {
                        std::ptr::copy_nonoverlapping(base, head.as_mut_ptr(), head.len());
                    }
                    BsonBlockBody::parse(&head)?.payload_bounds(announced)
                },
            )
        };

        match snapshot {
            Snapshot::NoChange => UpdateOutcome::NoChange,
            Snapshot::Failed => UpdateOutcome::Failed,
            Snapshot::NewData { payload, revision } => {
                if !validate_document(&payload) {
                    tracing::warn!(
                        revision,
                        "discarding shared block snapshot with malformed BSON"
                    );
                    return UpdateOutcome::Failed;
                }
                let mut cache = self.cache.write();
                if cache.revision != prev_revision {
                    // Another thread refreshed while we were copying; keep
                    // its (equally or more recent) snapshot.
                    return UpdateOutcome::NewData;
                }
                cache.buf = Some(Arc::from(payload.into_boxed_slice()));
                cache.revision = revision;
                UpdateOutcome::NewData
            }
        }
    }
}
