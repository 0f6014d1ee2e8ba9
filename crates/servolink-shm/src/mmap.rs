//! Read-only file-backed memory views.
//!
//! The backend owns and writes every shared region; the client only ever
//! maps them with `PROT_READ`. A missing file is a transient condition (the
//! backend has not published the region yet), which callers are expected to
//! retry.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Errors from opening a shared-memory view.
#[derive(Debug)]
pub enum ShmViewError {
    /// The named region does not exist (yet). Retryable.
    NotAvailable,
    /// The region exists but is empty or could not be mapped.
    Io(io::Error),
}

impl From<io::Error> for ShmViewError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            ShmViewError::NotAvailable
        } else {
            ShmViewError::Io(e)
        }
    }
}

impl std::fmt::Display for ShmViewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShmViewError::NotAvailable => write!(f, "shared memory region not available"),
            ShmViewError::Io(e) => write!(f, "shared memory I/O error: {e}"),
        }
    }
}

impl std::error::Error for ShmViewError {}

/// A read-only mapping of a named shared-memory region.
///
/// The mapping stays valid until the view is dropped; dropping unmaps and is
/// idempotent with respect to the backing file, which is never deleted by
/// the client.
#[derive(Debug)]
pub struct ShmView {
    ptr: *const u8,
    len: usize,
    /// Kept open so the mapping stays backed for its whole lifetime.
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl ShmView {
    /// Map the region at `path` read-only, taking the current file size as
    /// the view length.
    pub fn open(path: &Path) -> Result<Self, ShmViewError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(ShmViewError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared memory file is empty",
            )));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmViewError::Io(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *const u8,
            len,
            file,
            path: path.to_path_buf(),
        })
    }

    /// Map the region at `path` and require it to hold at least `min_len`
    /// bytes.
    pub fn open_with_min_len(path: &Path, min_len: usize) -> Result<Self, ShmViewError> {
        let view = Self::open(path)?;
        if view.len < min_len {
            return Err(ShmViewError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("region is {} bytes, need at least {min_len}", view.len),
            )));
        }
        Ok(view)
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping is zero bytes long (never constructed that way).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the whole region into an owned buffer.
    ///
    /// This is a plain copy with no consistency guarantee; use the seqlock
    /// protocol for data the backend updates in place.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.len];
        unsafe { std::ptr::copy_nonoverlapping(self.ptr, buf.as_mut_ptr(), self.len) };
        buf
    }
}

impl Drop for ShmView {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: the mapping is immutable from this process and stays valid for the
// lifetime of the view; concurrent reads from multiple threads are fine.
unsafe impl Send for ShmView {}
unsafe impl Sync for ShmView {}
