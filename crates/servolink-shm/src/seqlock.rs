//! Seqlock snapshot reads over backend-written blocks.
//!
//! Every shared block starts with a [`BlockHeader`]: a version word, a
//! revision counter and the announced block size. The backend increments the
//! counter once when it starts modifying the block and once more when it is
//! done, so an odd counter means "writer in progress" and a counter below 2
//! means "never written". Readers copy the data between two counter reads
//! and only accept the copy when both reads observed the same even value.
//!
//! The writer lives in a different process, so a mutex cannot be used here;
//! the fences are what makes the copy well ordered.

use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Size of the common block header prefix in bytes.
pub const BLOCK_HEADER_SIZE: usize = 12;

/// Common prefix of every shared block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub revision_counter: u32,
    pub size: u32,
}

impl BlockHeader {
    /// Read the header fields from the start of a mapped block.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads of [`BLOCK_HEADER_SIZE`] bytes and
    /// 4-byte aligned.
    pub unsafe fn read_from(base: *const u8) -> Self {
        Self {
            version: read_u32(base, 0),
            revision_counter: read_u32(base, 4),
            size: read_u32(base, 8),
        }
    }
}

/// Versions are compatible when their major halves (high 16 bits) match.
#[inline]
pub fn versions_compatible(known: u32, actual: u32) -> bool {
    (known & 0xffff_0000) == (actual & 0xffff_0000)
}

#[inline]
unsafe fn read_u32(base: *const u8, offset: usize) -> u32 {
    (*(base.add(offset) as *const AtomicU32)).load(Ordering::Relaxed)
}

/// Outcome of one snapshot call.
#[derive(Debug, PartialEq, Eq)]
pub enum Snapshot {
    /// A consistent copy of the payload with the revision it was taken at.
    NewData { payload: Vec<u8>, revision: u32 },
    /// The block still carries `prev_revision`; nothing was copied.
    NoChange,
    /// No consistent copy could be taken within the retry budget, or the
    /// block failed validation.
    Failed,
}

/// One attempt at a consistent read of a block.
///
/// `f` is called with the announced block size while the counter is
/// (apparently) stable; it must return `false` to reject the data. The
/// attempt succeeds only when `f` returned `true` and the counter was even,
/// at least 2, and unchanged across the call.
///
/// # Safety
///
/// `base` must point at a mapped block of at least [`BLOCK_HEADER_SIZE`]
/// bytes; `f` must stay within the caller's mapping.
pub unsafe fn try_atomic_block_access(base: *const u8, f: &mut dyn FnMut(u32) -> bool) -> bool {
    let hdr = BlockHeader::read_from(base);
    let start_rev = hdr.revision_counter;
    fence(Ordering::Acquire);

    if start_rev & 1 != 0 || start_rev < 2 {
        return false;
    }

    if !f(hdr.size) {
        return false;
    }

    fence(Ordering::AcqRel);
    let end_rev = read_u32(base, 4);
    start_rev == end_rev
}

const SNAPSHOT_RETRIES: usize = 3;

/// Copy a payload out of a shared block under the seqlock protocol.
///
/// `payload_bounds` receives the announced block size and resolves the
/// `(offset, len)` of the payload to copy, returning `None` to reject the
/// block (for example when an inner offset points outside it). Bounds are
/// additionally clamped against `mapped_len`, the size of the caller's
/// mapping, so a hostile header can never make the copy run off the end.
///
/// Returns [`Snapshot::NoChange`] when the revision still equals
/// `prev_revision` (pass 0 to always copy).
///
/// # Safety
///
/// `base` must be valid for `mapped_len` bytes and 4-byte aligned.
pub unsafe fn read_block_snapshot<F>(
    base: *const u8,
    mapped_len: usize,
    known_version: u32,
    prev_revision: u32,
    mut payload_bounds: F,
) -> Snapshot
where
    F: FnMut(u32) -> Option<(usize, usize)>,
{
    for retry in 0..SNAPSHOT_RETRIES {
        if retry != 0 {
            // Give the writer a moment to finish its update.
            std::thread::yield_now();
        }

        let mut no_change = false;
        let mut valid = false;
        let mut revision = 0u32;
        let mut payload = Vec::new();

        let ok = try_atomic_block_access(base, &mut |announced_size| {
            // SAFETY: `base` is valid per this function's contract.
            let hdr = unsafe { BlockHeader::read_from(base) };
            if !versions_compatible(known_version, hdr.version) {
                return false;
            }
            if announced_size as usize > mapped_len {
                return false;
            }
            if prev_revision != 0 && hdr.revision_counter == prev_revision {
                no_change = true;
                return true;
            }
            revision = hdr.revision_counter;

            let Some((offset, len)) = payload_bounds(announced_size) else {
                return false;
            };
            let end = match offset.checked_add(len) {
                Some(end) if end <= mapped_len => end,
                _ => return false,
            };
            debug_assert!(end <= mapped_len);

            payload.resize(len, 0);
            // SAFETY: offset + len were bounds-checked against mapped_len.
            unsafe {
                std::ptr::copy_nonoverlapping(base.add(offset), payload.as_mut_ptr(), len);
            }
            valid = true;
            true
        });

        if ok {
            if no_change {
                return Snapshot::NoChange;
            }
            if valid {
                return Snapshot::NewData { payload, revision };
            }
            return Snapshot::Failed;
        }
    }

    Snapshot::Failed
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test stand-in for a mapped block; u64 backing keeps the counter
    /// 4-byte aligned the way a page-aligned mapping would.
    struct FakeBlock {
        words: Vec<u64>,
        len: usize,
    }

    impl FakeBlock {
        fn as_ptr(&self) -> *const u8 {
            self.words.as_ptr() as *const u8
        }

        fn len(&self) -> usize {
            self.len
        }

        fn write_u32(&mut self, offset: usize, value: u32) {
            let ptr = self.words.as_mut_ptr() as *mut u8;
            unsafe { std::ptr::write_volatile(ptr.add(offset) as *mut u32, value) };
        }
    }

    fn make_block(version: u32, revision: u32, payload: &[u8]) -> FakeBlock {
        let size = (BLOCK_HEADER_SIZE + payload.len()) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&revision.to_le_bytes());
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(payload);

        let mut words = vec![0u64; bytes.len().div_ceil(8)];
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                words.as_mut_ptr() as *mut u8,
                bytes.len(),
            );
        }
        FakeBlock {
            words,
            len: bytes.len(),
        }
    }

    fn whole_payload(announced: u32) -> Option<(usize, usize)> {
        Some((BLOCK_HEADER_SIZE, announced as usize - BLOCK_HEADER_SIZE))
    }

    #[test]
    fn stable_even_counter_produces_snapshot() {
        let block = make_block(0x0001_0000, 4, b"payload!");
        let snap = unsafe {
            read_block_snapshot(block.as_ptr(), block.len(), 0x0001_0002, 0, whole_payload)
        };
        match snap {
            Snapshot::NewData { payload, revision } => {
                assert_eq!(payload, b"payload!");
                assert_eq!(revision, 4);
            }
            other => panic!("expected NewData, got {other:?}"),
        }
    }

    #[test]
    fn odd_counter_fails() {
        let block = make_block(0x0001_0000, 5, b"payload!");
        let snap = unsafe {
            read_block_snapshot(block.as_ptr(), block.len(), 0x0001_0000, 0, whole_payload)
        };
        assert_eq!(snap, Snapshot::Failed);
    }

    #[test]
    fn never_written_counter_fails() {
        let block = make_block(0x0001_0000, 0, b"payload!");
        let snap = unsafe {
            read_block_snapshot(block.as_ptr(), block.len(), 0x0001_0000, 0, whole_payload)
        };
        assert_eq!(snap, Snapshot::Failed);
    }

    #[test]
    fn incompatible_major_version_fails() {
        let block = make_block(0x0002_0000, 2, b"payload!");
        let snap = unsafe {
            read_block_snapshot(block.as_ptr(), block.len(), 0x0001_0000, 0, whole_payload)
        };
        assert_eq!(snap, Snapshot::Failed);
    }

    #[test]
    fn unchanged_revision_reports_no_change() {
        let block = make_block(0x0001_0000, 6, b"payload!");
        let snap = unsafe {
            read_block_snapshot(block.as_ptr(), block.len(), 0x0001_0000, 6, whole_payload)
        };
        assert_eq!(snap, Snapshot::NoChange);
    }

    #[test]
    fn announced_size_beyond_mapping_fails() {
        let mut block = make_block(0x0001_0000, 2, b"payload!");
        // Rewrite the size field to claim more than is mapped.
        block.write_u32(8, 1024);
        let snap = unsafe {
            read_block_snapshot(block.as_ptr(), block.len(), 0x0001_0000, 0, whole_payload)
        };
        assert_eq!(snap, Snapshot::Failed);
    }

    #[test]
    fn payload_bounds_outside_mapping_fail() {
        let block = make_block(0x0001_0000, 2, b"payload!");
        let snap = unsafe {
            read_block_snapshot(block.as_ptr(), block.len(), 0x0001_0000, 0, |_| {
                Some((BLOCK_HEADER_SIZE, 4096))
            })
        };
        assert_eq!(snap, Snapshot::Failed);
    }

    #[test]
    fn counter_change_during_copy_is_retried() {
        use std::cell::Cell;

        let mut block = make_block(0x0001_0000, 2, b"payload!");
        let writer_ptr = block.words.as_mut_ptr() as *mut u8;
        let calls = Cell::new(0usize);

        let snap = unsafe {
            read_block_snapshot(block.as_ptr(), block.len(), 0x0001_0000, 0, |announced| {
                // Simulate a writer racing the first copy attempt, then
                // settling down.
                if calls.get() == 0 {
                    unsafe { std::ptr::write_volatile(writer_ptr.add(4) as *mut u32, 4) };
                }
                calls.set(calls.get() + 1);
                whole_payload(announced)
            })
        };
        match snap {
            Snapshot::NewData { revision, .. } => assert_eq!(revision, 4),
            other => panic!("expected NewData after retry, got {other:?}"),
        }
        assert!(calls.get() >= 2, "first attempt must have been rejected");
    }
}
