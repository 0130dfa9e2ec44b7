// Process-shared counting semaphore gating the free slots of the message queue.

use log::{debug, warn};
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{CommError, CommResult};

/// POSIX named semaphore. The side that created it also unlinks it on drop.
pub struct FreeSlotSemaphore {
    sem: NonNull<libc::sem_t>,
    name: CString,
    owner: bool,
}

impl FreeSlotSemaphore {
    /// Create a fresh semaphore holding `initial` permits.
    pub fn create(name: &str, initial: u32) -> CommResult<Self> {
        let c_name = to_c_name(name)?;
        // SAFETY: valid NUL-terminated name; mode and value are the variadic
        // arguments sem_open expects with O_CREAT.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        Self::wrap(sem, c_name, true)
    }

    /// Open a semaphore created by the peer.
    pub fn open(name: &str) -> CommResult<Self> {
        let c_name = to_c_name(name)?;
        // SAFETY: valid NUL-terminated name, no O_CREAT.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        Self::wrap(sem, c_name, false)
    }

    fn wrap(sem: *mut libc::sem_t, name: CString, owner: bool) -> CommResult<Self> {
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(CommError::NotFound(name.to_string_lossy().into_owned()));
            }
            return Err(err.into());
        }
        let sem = NonNull::new(sem)
            .ok_or_else(|| CommError::Bootstrap("sem_open returned NULL".to_string()))?;
        debug!("[SEM] Opened {:?} (owner: {})", name, owner);
        Ok(Self { sem, name, owner })
    }

    /// Take one permit, blocking while none is available.
    ///
    /// The wait is sliced into `poll` sized timed waits so that a cancelled
    /// `token` ends it with `Err(Cancelled)`. EINTR is retried after checking
    /// the token.
    pub fn wait(&self, token: &CancelToken, poll: Duration) -> CommResult<()> {
        loop {
            token.check()?;
            let deadline = deadline_after(poll)?;
            // SAFETY: sem is a live semaphore handle from sem_open.
            let rc = unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) | Some(libc::EINTR) => continue,
                _ => return Err(err.into()),
            }
        }
    }

    /// Return one permit.
    pub fn post(&self) -> CommResult<()> {
        // SAFETY: sem is a live semaphore handle from sem_open.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Current permit count.
    pub fn value(&self) -> CommResult<i32> {
        let mut value: libc::c_int = 0;
        // SAFETY: sem is live and value points to a valid c_int.
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(value)
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("<invalid>")
    }
}

impl Drop for FreeSlotSemaphore {
    fn drop(&mut self) {
        // SAFETY: sem came from sem_open and is closed exactly once here.
        unsafe {
            libc::sem_close(self.sem.as_ptr());
            if self.owner && libc::sem_unlink(self.name.as_ptr()) != 0 {
                warn!(
                    "[SEM] Failed to unlink {:?}: {}",
                    self.name,
                    io::Error::last_os_error()
                );
            }
        }
    }
}

// sem_wait/sem_post are thread-safe on a shared handle.
unsafe impl Send for FreeSlotSemaphore {}
unsafe impl Sync for FreeSlotSemaphore {}

fn to_c_name(name: &str) -> CommResult<CString> {
    CString::new(name).map_err(|_| CommError::Bootstrap(format!("bad semaphore name {:?}", name)))
}

fn deadline_after(delta: Duration) -> CommResult<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: now is a valid timespec out-parameter.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let mut nsec = now.tv_nsec as i64 + delta.subsec_nanos() as i64;
    let mut sec = now.tv_sec as i64 + delta.as_secs() as i64;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    Ok(libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as libc::c_long,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn unique_name() -> String {
        format!("/labctl-test-sem-{}", uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn counts_permits() {
        let sem = FreeSlotSemaphore::create(&unique_name(), 2).unwrap();
        let token = CancelToken::new();
        assert_eq!(sem.value().unwrap(), 2);
        sem.wait(&token, Duration::from_millis(10)).unwrap();
        sem.wait(&token, Duration::from_millis(10)).unwrap();
        assert_eq!(sem.value().unwrap(), 0);
        sem.post().unwrap();
        assert_eq!(sem.value().unwrap(), 1);
    }

    #[test]
    fn opener_shares_the_count() {
        let name = unique_name();
        let created = FreeSlotSemaphore::create(&name, 0).unwrap();
        let opened = FreeSlotSemaphore::open(&name).unwrap();
        opened.post().unwrap();
        assert_eq!(created.value().unwrap(), 1);
    }

    #[test]
    fn blocked_wait_is_cancellable() {
        let sem = Arc::new(FreeSlotSemaphore::create(&unique_name(), 0).unwrap());
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            remote.cancel();
        });

        let started = Instant::now();
        let result = sem.wait(&token, Duration::from_millis(10));
        canceller.join().unwrap();

        assert!(matches!(result, Err(CommError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn owner_drop_unlinks() {
        let name = unique_name();
        drop(FreeSlotSemaphore::create(&name, 1).unwrap());
        assert!(matches!(
            FreeSlotSemaphore::open(&name),
            Err(CommError::NotFound(_))
        ));
    }
}
