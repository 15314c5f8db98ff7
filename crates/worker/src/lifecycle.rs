//! Stop flag and termination-signal wiring.
//!
//! The signal handler only flips the flag. The worker reads it between
//! dispatches, so a job in flight always finishes its current attempt. A
//! signal that lands while the worker is blocked in `reserve` makes the
//! queue client return `QueueError::Interrupted` instead (handlers are
//! installed without `SA_RESTART`).

use std::io;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use tracing::info;

/// Cooperative shutdown request shared by the signal handler and the loop.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Flag the signal handler stores into. Each installed flag holds one
/// leaked strong count, so the pointer stays valid for the process lifetime
/// even after a later install replaces it.
#[cfg(unix)]
static SIGNAL_FLAG: AtomicPtr<AtomicBool> = AtomicPtr::new(ptr::null_mut());

#[cfg(unix)]
extern "C" fn on_terminate(_signal: libc::c_int) {
    let flag = SIGNAL_FLAG.load(Ordering::SeqCst);
    if !flag.is_null() {
        // SAFETY: non-null values come from `Arc::into_raw` and are never freed.
        unsafe { (*flag).store(true, Ordering::SeqCst) };
    }
}

/// Point the signal handler at `flag`, replacing any earlier flag.
#[cfg(unix)]
fn wire(flag: &StopFlag) {
    let raw = Arc::into_raw(flag.0.clone()).cast_mut();
    let previous = SIGNAL_FLAG.swap(raw, Ordering::SeqCst);
    if previous == raw {
        // SAFETY: `previous` carries its own leaked count and `raw` still
        // holds one, so dropping this one keeps the allocation alive.
        unsafe { drop(Arc::from_raw(previous.cast_const())) };
    } else if !previous.is_null() {
        info!("signal handlers rewired to a new stop flag");
    }
}

/// Route SIGTERM and SIGINT to `flag`.
///
/// The most recently installed flag wins, so a rebuilt worker takes over
/// signal delivery from the one it replaces. Each handler resets to the
/// default disposition after firing once, so a second signal terminates
/// the process.
#[cfg(unix)]
pub fn install_signal_handlers(flag: &StopFlag) -> io::Result<()> {
    wire(flag);

    for signal in [libc::SIGTERM, libc::SIGINT] {
        // SAFETY: `sigaction` is given a zeroed struct with an empty mask and
        // a handler that only performs an atomic store.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESETHAND;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    info!("termination signal handlers installed");
    Ok(())
}

#[cfg(not(unix))]
pub fn install_signal_handlers(_flag: &StopFlag) -> io::Result<()> {
    tracing::warn!("termination signals are not trapped on this platform");
    Ok(())
}
