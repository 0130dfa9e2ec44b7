// Named POSIX shared memory mappings.

use log::debug;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use crate::error::{CommError, CommResult};

/// One mapping of a named shared memory object. Unmapped on drop; the object
/// itself survives until [`Segment::unlink`] is called.
pub struct Segment {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
}

impl Segment {
    /// Create a new object of `len` zeroed bytes. Fails with `Os(EEXIST)` if
    /// the name is taken.
    pub fn create(name: &str, len: usize) -> CommResult<Self> {
        let fd = mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let file = File::from(fd);
        if let Err(e) = file.set_len(len as u64) {
            let _ = mman::shm_unlink(name);
            return Err(e.into());
        }
        match Self::map(name, &file, len) {
            Ok(segment) => Ok(segment),
            Err(e) => {
                let _ = mman::shm_unlink(name);
                Err(e)
            }
        }
    }

    /// Map an existing object at its full size.
    pub fn open(name: &str) -> CommResult<Self> {
        let fd = match mman::shm_open(name, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => return Err(CommError::NotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        };
        let file = File::from(fd);
        let len = file.metadata()?.len() as usize;
        Self::map(name, &file, len)
    }

    fn map(name: &str, file: &File, len: usize) -> CommResult<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| CommError::Malformed(format!("shared object {} is empty", name)))?;
        // SAFETY: fresh shared mapping of an fd we own; no existing Rust
        // references alias the returned region.
        let ptr = unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )
        }?;
        debug!("[SHM] Mapped {} ({} bytes)", name, len);
        Ok(Self {
            name: name.to_string(),
            ptr: ptr.cast(),
            len,
        })
    }

    /// Remove the name. Existing mappings stay valid until dropped.
    pub fn unlink(name: &str) -> CommResult<()> {
        match mman::shm_unlink(name) {
            Ok(()) => Ok(()),
            Err(Errno::ENOENT) => Err(CommError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from the successful mmap in `map`.
        if let Err(e) = unsafe { mman::munmap(self.ptr.cast(), self.len) } {
            log::warn!("[SHM] munmap of {} failed: {}", self.name, e);
        }
    }
}

// The mapping is process-shared memory; synchronisation is the job of the
// structures laid over it.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/labctl-test-{}-{}", tag, uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn two_mappings_see_the_same_bytes() {
        let name = unique_name("seg");
        let a = Segment::create(&name, 4096).unwrap();
        let b = Segment::open(&name).unwrap();
        assert_eq!(b.len(), 4096);

        unsafe {
            *a.as_ptr().add(17) = 0xAB;
            assert_eq!(*b.as_ptr().add(17), 0xAB);
        }
        Segment::unlink(&name).unwrap();
    }

    #[test]
    fn create_is_exclusive() {
        let name = unique_name("excl");
        let _a = Segment::create(&name, 64).unwrap();
        assert!(matches!(
            Segment::create(&name, 64),
            Err(CommError::Os(Errno::EEXIST))
        ));
        Segment::unlink(&name).unwrap();
    }

    #[test]
    fn open_missing_is_not_found() {
        let name = unique_name("missing");
        assert!(matches!(Segment::open(&name), Err(CommError::NotFound(_))));
        assert!(matches!(Segment::unlink(&name), Err(CommError::NotFound(_))));
    }
}
