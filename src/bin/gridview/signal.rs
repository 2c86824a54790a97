//! Ctrl-C / SIGTERM handling so an interactive quit still runs the logout
//! handshake and marker cleanup instead of leaving a fake freeze behind.

use std::sync::atomic::{AtomicBool, Ordering};

static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn handle_signal(_signum: libc::c_int) {
    // Async-signal-safe: only an atomic store.
    EXIT_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
pub(crate) fn install() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    // SAFETY: installing a handler that only touches an atomic flag.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
pub(crate) fn install() {}

pub(crate) fn exit_requested() -> bool {
    EXIT_REQUESTED.load(Ordering::SeqCst)
}
