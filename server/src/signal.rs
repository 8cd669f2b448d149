//! Process-wide signal bookkeeping.
//!
//! Handlers only flip atomics; the master and worker loops poll the flags
//! once per cycle. No `SA_RESTART`, so a signal interrupts the current poll
//! wait and shortens reaction time to one cycle.

use std::sync::atomic::{AtomicBool, Ordering};

use libc::c_int;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{Error, Result};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);
static CHILD: AtomicBool = AtomicBool::new(false);

extern "C" fn flag_signal(signum: c_int) {
    match signum {
        libc::SIGTERM | libc::SIGINT => SHUTDOWN.store(true, Ordering::SeqCst),
        libc::SIGUSR1 => RELOAD.store(true, Ordering::SeqCst),
        libc::SIGCHLD => CHILD.store(true, Ordering::SeqCst),
        _ => {}
    }
}

fn install(signal: Signal) -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(flag_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    // SAFETY: the handler only stores to atomics, which is async-signal-safe
    unsafe { sigaction(signal, &action) }
        .map_err(|errno| Error::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
    Ok(())
}

/// Installs the master dispositions: TERM/INT request shutdown, USR1
/// requests a graceful reload, CHLD marks children for reaping.
pub fn install_master() -> Result<()> {
    clear();
    for signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGUSR1, Signal::SIGCHLD] {
        install(signal)?;
    }
    Ok(())
}

/// Installs the worker dispositions after fork: TERM/INT trigger the
/// in-worker drain. Flags inherited from the master are cleared.
pub fn install_worker() -> Result<()> {
    clear();
    for signal in [Signal::SIGTERM, Signal::SIGINT] {
        install(signal)?;
    }
    Ok(())
}

/// Whether a shutdown signal has arrived. Sticky until [`clear`].
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Consumes a pending reload request.
pub fn take_reload() -> bool {
    RELOAD.swap(false, Ordering::SeqCst)
}

/// Consumes a pending child-exit notification.
pub fn take_child_exit() -> bool {
    CHILD.swap(false, Ordering::SeqCst)
}

/// Resets all pending flags.
pub fn clear() {
    SHUTDOWN.store(false, Ordering::SeqCst);
    RELOAD.store(false, Ordering::SeqCst);
    CHILD.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags_latch_and_clear() {
        clear();
        assert!(!shutdown_requested());

        flag_signal(libc::SIGTERM);
        assert!(shutdown_requested());

        flag_signal(libc::SIGUSR1);
        assert!(take_reload());
        assert!(!take_reload());

        flag_signal(libc::SIGCHLD);
        assert!(take_child_exit());
        assert!(!take_child_exit());

        clear();
        assert!(!shutdown_requested());
    }

    #[test]
    fn unknown_signals_are_ignored() {
        clear();
        flag_signal(libc::SIGPIPE);
        assert!(!shutdown_requested());
        assert!(!take_reload());
        assert!(!take_child_exit());
    }
}
