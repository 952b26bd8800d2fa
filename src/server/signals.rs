// src/server/signals.rs

//! Signal-to-flag translation. The handler does nothing but store to the
//! atomics below; the master and worker loops consume them at the top of
//! each iteration, so signal-driven and channel-driven state changes share
//! one code path.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask,
};
use once_cell::sync::Lazy;

use crate::core::errors::PeridotError;

/// A child exited; harvest it.
pub static REAP: AtomicBool = AtomicBool::new(false);
/// Graceful shutdown requested.
pub static QUIT: AtomicBool = AtomicBool::new(false);
/// Forced shutdown requested.
pub static TERMINATE: AtomicBool = AtomicBool::new(false);
/// Configuration reload requested.
pub static RECONFIGURE: AtomicBool = AtomicBool::new(false);
/// Reopen registered files.
pub static REOPEN: AtomicBool = AtomicBool::new(false);
/// Re-exec into a new binary.
pub static CHANGE_BINARY: AtomicBool = AtomicBool::new(false);
/// Stop accepting without exiting the master.
pub static NOACCEPT: AtomicBool = AtomicBool::new(false);
/// The termination-backoff timer fired.
pub static SIGALRM: AtomicBool = AtomicBool::new(false);

/// Consumes a flag: returns its value and clears it.
pub fn take(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::AcqRel)
}

static HANDLED: Lazy<Vec<Signal>> = Lazy::new(|| {
    vec![
        Signal::SIGCHLD,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGWINCH,
        Signal::SIGALRM,
    ]
});

extern "C" fn signal_handler(signo: libc::c_int) {
    // async-signal-safe: plain stores only
    match signo {
        libc::SIGCHLD => REAP.store(true, Ordering::Release),
        libc::SIGQUIT => QUIT.store(true, Ordering::Release),
        libc::SIGTERM | libc::SIGINT => TERMINATE.store(true, Ordering::Release),
        libc::SIGHUP => RECONFIGURE.store(true, Ordering::Release),
        libc::SIGUSR1 => REOPEN.store(true, Ordering::Release),
        libc::SIGUSR2 => CHANGE_BINARY.store(true, Ordering::Release),
        libc::SIGWINCH => NOACCEPT.store(true, Ordering::Release),
        libc::SIGALRM => SIGALRM.store(true, Ordering::Release),
        _ => {}
    }
}

/// Installs the flag-setting handler for every supervised signal and ignores
/// SIGPIPE.
pub fn init() -> Result<(), PeridotError> {
    let action = SigAction::new(
        SigHandler::Handler(signal_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in HANDLED.iter() {
        unsafe { sigaction(*sig, &action) }.map_err(|e| PeridotError::sys("sigaction", e))?;
    }

    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &ignore) }
        .map_err(|e| PeridotError::sys("sigaction", e))?;

    Ok(())
}

/// Blocks the supervised signals; the master only receives them inside
/// `suspend`.
pub fn block() -> Result<(), PeridotError> {
    let mut set = SigSet::empty();
    for sig in HANDLED.iter() {
        set.add(*sig);
    }
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), None)
        .map_err(|e| PeridotError::sys("sigprocmask", e))
}

/// Clears the signal mask a worker inherited from the master.
pub fn unblock_all() -> Result<(), PeridotError> {
    let set = SigSet::empty();
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&set), None)
        .map_err(|e| PeridotError::sys("sigprocmask", e))
}

/// Atomically unblocks everything and waits for a signal. The master parks
/// here between events.
pub fn suspend() {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigsuspend(&set);
    }
}

/// Arms the one-shot real-time timer used by the termination backoff.
pub fn arm_timer(ms: u64) -> Result<(), PeridotError> {
    let itv = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        },
    };
    if unsafe { libc::setitimer(libc::ITIMER_REAL, &itv, std::ptr::null_mut()) } == -1 {
        return Err(PeridotError::sys("setitimer", nix::errno::Errno::last()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_the_flag() {
        RECONFIGURE.store(true, Ordering::Release);
        assert!(take(&RECONFIGURE));
        assert!(!take(&RECONFIGURE));
    }
}
