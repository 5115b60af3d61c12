//! Process-wide signal flags.
//!
//! Handlers only store to atomics. The reader loops poll these flags at
//! every timeout boundary and the owning guards restore the terminal on
//! the way out, so no cleanup runs inside a signal handler.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

static INSTALLED: AtomicBool = AtomicBool::new(false);
static WINDOW_CHANGED: AtomicBool = AtomicBool::new(false);
static TERMINATED_BY: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_sigwinch(_: libc::c_int) {
    WINDOW_CHANGED.store(true, Ordering::Release);
}

extern "C" fn handle_termination(signal: libc::c_int) {
    TERMINATED_BY.store(signal, Ordering::Release);
}

/// Register the SIGWINCH, SIGTERM and SIGHUP handlers. Safe to call repeatedly.
///
/// No `SA_RESTART`: a blocking read is interrupted so its caller can notice
/// a termination request.
pub fn install() -> io::Result<()> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    let winch = SigAction::new(
        SigHandler::Handler(handle_sigwinch),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let terminate = SigAction::new(
        SigHandler::Handler(handle_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handlers only touch atomics.
    unsafe {
        sigaction(Signal::SIGWINCH, &winch)?;
        sigaction(Signal::SIGTERM, &terminate)?;
        sigaction(Signal::SIGHUP, &terminate)?;
    }
    Ok(())
}

/// Consume a pending window-size change.
pub fn take_window_change() -> bool {
    WINDOW_CHANGED.swap(false, Ordering::AcqRel)
}

pub fn termination_requested() -> bool {
    TERMINATED_BY.load(Ordering::Acquire) != 0
}

/// The signal number that requested termination, if any.
pub fn terminating_signal() -> Option<i32> {
    match TERMINATED_BY.load(Ordering::Acquire) {
        0 => None,
        signal => Some(signal),
    }
}
