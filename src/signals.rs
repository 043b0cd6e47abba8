//! Process-global termination state.
//!
//! UNIX signal dispositions are inherently process-wide, so the SIGTERM flag
//! lives here as a single atomic rather than inside any daemon object. The
//! flag is three-valued: -1 until a handler is installed, 0 once installed,
//! 1 after SIGTERM has been caught.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

const NOT_INSTALLED: i32 = -1;
const INSTALLED: i32 = 0;
const TERMINATED: i32 = 1;

static TERM_SIGNAL: AtomicI32 = AtomicI32::new(NOT_INSTALLED);

extern "C" fn flag_term_signal(_signum: libc::c_int) {
    // Async-signal-safe: a single atomic store, nothing else.
    TERM_SIGNAL.store(TERMINATED, Ordering::SeqCst);
}

/// Installs the SIGTERM handler that raises the termination flag.
///
/// # Panics
///
/// Panics when called a second time in the same process; installing the
/// handler twice is a programmer error.
pub fn install_term_handler() {
    if TERM_SIGNAL
        .compare_exchange(NOT_INSTALLED, INSTALLED, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        panic!("SIGTERM handler installed more than once");
    }

    let action = SigAction::new(
        SigHandler::Handler(flag_term_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGTERM, &action) }.expect("failed to install SIGTERM handler");
    debug!("SIGTERM handler installed");
}

/// Whether [`install_term_handler`] has run in this process.
pub fn handler_installed() -> bool {
    TERM_SIGNAL.load(Ordering::SeqCst) >= INSTALLED
}

/// Whether a termination signal has been caught since the handler was
/// installed.
pub fn was_terminated() -> bool {
    TERM_SIGNAL.load(Ordering::SeqCst) == TERMINATED
}

/// Ignores SIGPIPE so a write to a reader-less pipe reports `EPIPE` instead
/// of killing the process. Idempotent.
pub fn ignore_sigpipe() {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &action) }.expect("failed to ignore SIGPIPE");
}
