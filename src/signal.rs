//! Unix signal handling.
//!
//! SIGINT, SIGTERM and SIGHUP request an orderly shutdown: the work loop
//! observes the flag between waits, terminates job process groups, removes
//! partial outputs and re-raises the signal.  SIGUSR1 requests a statistics
//! snapshot without disturbing running jobs.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static TERMINATION: AtomicI32 = AtomicI32::new(0);
static STATS_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn termination_handler(sig: libc::c_int) {
    TERMINATION.store(sig, Ordering::Relaxed);
}

#[cfg(unix)]
extern "C" fn usr1_handler(_sig: libc::c_int) {
    STATS_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(unix)]
pub fn register() {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = termination_handler as libc::sighandler_t;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGHUP, &sa, std::ptr::null_mut());

        let mut sa_usr1: libc::sigaction = std::mem::zeroed();
        sa_usr1.sa_sigaction = usr1_handler as libc::sighandler_t;
        libc::sigaction(libc::SIGUSR1, &sa_usr1, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
pub fn register() {}

/// The terminating signal received, if any.
pub fn termination() -> Option<i32> {
    match TERMINATION.load(Ordering::Relaxed) {
        0 => None,
        sig => Some(sig),
    }
}

/// True once per SIGUSR1 received.
pub fn take_stats_request() -> bool {
    STATS_REQUESTED.swap(false, Ordering::Relaxed)
}

/// Restore the default disposition and re-raise, so the exit status
/// reflects death by signal.
#[cfg(unix)]
pub fn reraise(sig: i32) -> ! {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &sa, std::ptr::null_mut());
        libc::raise(sig);
    }
    std::process::exit(128 + sig);
}

#[cfg(not(unix))]
pub fn reraise(sig: i32) -> ! {
    std::process::exit(128 + sig);
}
