//! Signal-driven shutdown for the server daemon
//!
//! The first SIGINT/SIGTERM raises the shutdown flag the service loop polls
//! while idle. A second one exits immediately, which also ends a rank that
//! is blocked accepting peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static SHUTDOWN_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Install SIGINT/SIGTERM handlers and return the flag they raise
///
/// Repeated calls return the same flag.
///
/// # Example
/// ```ignore
/// let shutdown = install_shutdown_handlers();
/// buffer.set_shutdown_flag(shutdown.clone());
/// buffer.service_loop()?;
/// ```
pub fn install_shutdown_handlers() -> Arc<AtomicBool> {
    let flag = SHUTDOWN_FLAG
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone();

    #[cfg(unix)]
    {
        use libc::{SIGINT, SIGTERM};
        // SAFETY: the handler only touches atomics and calls _exit, both
        // async-signal-safe
        unsafe {
            libc::signal(SIGINT, shutdown_signal_handler as libc::sighandler_t);
            libc::signal(SIGTERM, shutdown_signal_handler as libc::sighandler_t);
        }
        tracing::debug!("Signal handlers registered: SIGINT/SIGTERM stop the service loop");
    }

    flag
}

/// Whether a shutdown signal has been received
pub fn shutdown_requested() -> bool {
    SHUTDOWN_FLAG
        .get()
        .is_some_and(|flag| flag.load(Ordering::Relaxed))
}

#[cfg(unix)]
extern "C" fn shutdown_signal_handler(signal: libc::c_int) {
    if let Some(flag) = SHUTDOWN_FLAG.get() {
        if flag.swap(true, Ordering::Relaxed) {
            // SAFETY: _exit is async-signal-safe
            unsafe { libc::_exit(128 + signal) };
        }
    }
}
