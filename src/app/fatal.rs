//! Fatal-error routing.
//!
//! Every unrecoverable condition funnels through one exit so platform crash
//! tooling can capture a stack before the process dies. On Unix that means
//! raising `SIGQUIT` (core-dumping, catchable by an external reporter);
//! elsewhere we fall back to an abort.

/// Raise the platform fatal signal and never return.
pub(crate) fn raise_fatal(reason: &str) -> ! {
    tracing::error!(reason, "fatal error; handing off to crash reporting");
    #[cfg(unix)]
    {
        // SAFETY: raising a signal on the current process is always valid.
        unsafe {
            libc::raise(libc::SIGQUIT);
        }
    }
    std::process::abort()
}
