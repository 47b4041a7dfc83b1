//! Shared memory segment management.
//!
//! The master creates one POSIX shared memory object per run, named after a
//! numeric key, before any worker is started. Workers attach to the existing
//! object with the same key and length; a length mismatch is fatal.

pub mod layout;
mod queue;

pub use queue::{FrameQueue, SlotSnapshot};

use crate::error::{PipelineError, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Name of the shm object for a key.
pub fn segment_name(key: u32) -> String {
    format!("/pixelpipe-{:08x}", key)
}

/// A mapped shared memory segment.
///
/// The owner unlinks the object when the segment is detached or dropped; an
/// attached segment only unmaps.
pub struct SharedSegment {
    key: u32,
    name: String,
    ptr: NonNull<c_void>,
    len: usize,
    owner: bool,
    mapped: bool,
}

// Safety: the mapping stays valid until `release`, which needs `&mut self`.
// All cross-process mutation goes through atomics or disjoint pixel ranges
// (see `FrameQueue`).
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create (owner) or attach to (worker) the segment for `key`.
    ///
    /// The owner removes any stale object left by an earlier run, creates a
    /// zero-filled object of exactly `size` bytes and maps it. A non-owner maps
    /// the existing object after checking its length equals `size`.
    pub fn create_or_attach(key: u32, size: usize, is_owner: bool) -> Result<Self> {
        let len = NonZeroUsize::new(size).ok_or_else(|| {
            PipelineError::InvalidConfig("shared segment length must be non-zero".into())
        })?;
        let name = segment_name(key);

        let file = if is_owner {
            match shm_unlink(name.as_str()) {
                Ok(()) => debug!(segment = %name, "Removed stale shared segment"),
                Err(Errno::ENOENT) => {}
                Err(e) => return Err(e.into()),
            }
            let fd = shm_open(
                name.as_str(),
                OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                Mode::S_IRUSR | Mode::S_IWUSR,
            )?;
            let file = File::from(fd);
            file.set_len(size as u64)?;
            file
        } else {
            let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty())?;
            let file = File::from(fd);
            let actual = file.metadata()?.len() as usize;
            if actual != size {
                return Err(PipelineError::SegmentSizeMismatch {
                    key,
                    expected: size,
                    actual,
                });
            }
            file
        };

        // Safety: fresh shared mapping of a file we hold open; no existing Rust
        // references point into it.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        };
        let ptr = match ptr {
            Ok(ptr) => ptr,
            Err(e) => {
                if is_owner {
                    let _ = shm_unlink(name.as_str());
                }
                return Err(e.into());
            }
        };

        debug!(
            segment = %name,
            bytes = size,
            owner = is_owner,
            "Mapped shared segment"
        );

        Ok(Self {
            key,
            name,
            ptr,
            len: size,
            owner: is_owner,
            mapped: true,
        })
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Base address of the mapping (page aligned).
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    /// Unmap now and report failures instead of logging them from `Drop`.
    pub fn detach(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;

        // Safety: `ptr`/`len` describe our own mapping; every borrow into it is
        // tied to `&self` and cannot outlive this `&mut self` call.
        unsafe { munmap(self.ptr, self.len)? };

        if self.owner {
            match shm_unlink(self.name.as_str()) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => return Err(e.into()),
            }
            debug!(segment = %self.name, "Removed shared segment");
        }
        Ok(())
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(segment = %self.name, error = %e, "Failed to release shared segment");
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_keys::unique_key;
    use super::*;

    #[test]
    fn test_segment_name_format() {
        assert_eq!(segment_name(0xfeed_0470), "/pixelpipe-feed0470");
        assert_eq!(segment_name(1), "/pixelpipe-00000001");
    }

    #[test]
    fn test_owner_and_attacher_share_bytes() {
        let key = unique_key();
        let owner = SharedSegment::create_or_attach(key, 4096, true).unwrap();
        let worker = SharedSegment::create_or_attach(key, 4096, false).unwrap();

        unsafe {
            *owner.as_ptr().add(100) = 0xab;
            assert_eq!(*worker.as_ptr().add(100), 0xab);
            *worker.as_ptr().add(200) = 0xcd;
            assert_eq!(*owner.as_ptr().add(200), 0xcd);
        }
    }

    #[test]
    fn test_fresh_segment_is_zeroed() {
        let key = unique_key();
        let owner = SharedSegment::create_or_attach(key, 8192, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(owner.as_ptr(), owner.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_attach_with_wrong_size_is_fatal() {
        let key = unique_key();
        let _owner = SharedSegment::create_or_attach(key, 4096, true).unwrap();
        let err = SharedSegment::create_or_attach(key, 8192, false).unwrap_err();
        match err {
            PipelineError::SegmentSizeMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, 8192);
                assert_eq!(actual, 4096);
            }
            other => panic!("expected size mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_attach_without_owner_fails() {
        let key = unique_key();
        let err = SharedSegment::create_or_attach(key, 4096, false).unwrap_err();
        assert!(matches!(err, PipelineError::Sys(Errno::ENOENT)));
    }

    #[test]
    fn test_owner_detach_unlinks() {
        let key = unique_key();
        let owner = SharedSegment::create_or_attach(key, 4096, true).unwrap();
        owner.detach().unwrap();
        assert!(SharedSegment::create_or_attach(key, 4096, false).is_err());
    }

    #[test]
    fn test_owner_replaces_stale_segment() {
        let key = unique_key();
        let stale = SharedSegment::create_or_attach(key, 4096, true).unwrap();
        std::mem::forget(stale);
        let owner = SharedSegment::create_or_attach(key, 8192, true).unwrap();
        assert_eq!(owner.len(), 8192);
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = SharedSegment::create_or_attach(unique_key(), 0, true).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }
}
