//! Cancellation of blocking calls.
//!
//! The worker may block on the free-slot semaphore or on the reply pipe. Both
//! waits are sliced into short timed waits that re-check a [`CancelToken`], so a
//! termination request from the controller (SIGTERM) unwinds them promptly.

use log::{debug, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CommError, CommResult};

// Flag flipped by the signal handler. Set once, before the handler is installed.
static TERMINATION_FLAG: OnceCell<Arc<AtomicBool>> = OnceCell::new();

/// Shared flag observed by every cancellable blocking call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> CommResult<()> {
        if self.is_cancelled() {
            Err(CommError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early (with `Err(Cancelled)`) on cancellation.
    pub fn sleep(&self, duration: Duration, slice: Duration) -> CommResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(slice.min(deadline - now));
        }
    }
}

extern "C" fn on_termination(_signal: libc::c_int) {
    if let Some(flag) = TERMINATION_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Route SIGTERM into `token` instead of killing the process.
///
/// Installed without `SA_RESTART` so an in-flight blocking syscall returns
/// `EINTR` and the caller gets to re-check the token. Only the first token
/// passed in is ever wired to the signal.
pub fn install_termination_handler(token: &CancelToken) -> CommResult<CancelToken> {
    let wired = TERMINATION_FLAG.get_or_init(|| Arc::clone(&token.flag));
    if !Arc::ptr_eq(wired, &token.flag) {
        warn!("[CANCEL] Termination handler already bound to another token");
    }

    let action = SigAction::new(
        SigHandler::Handler(on_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only performs an atomic store on a flag that is
    // fully initialised before the handler is installed.
    unsafe { signal::sigaction(Signal::SIGTERM, &action) }?;
    debug!("[CANCEL] SIGTERM handler installed");

    Ok(CancelToken {
        flag: Arc::clone(wired),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(CommError::Cancelled)));
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        let started = Instant::now();
        let result = token.sleep(Duration::from_secs(10), Duration::from_millis(5));
        handle.join().unwrap();

        assert!(matches!(result, Err(CommError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sleep_completes_without_cancel() {
        let token = CancelToken::new();
        assert!(token
            .sleep(Duration::from_millis(10), Duration::from_millis(2))
            .is_ok());
    }
}
