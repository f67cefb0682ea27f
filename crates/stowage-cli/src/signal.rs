use std::sync::atomic::{AtomicBool, Ordering};

/// Raised by SIGINT or SIGTERM. Compaction checks it once per downloaded
/// volume and restore once per file.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
const STOP_SIGNALS: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

/// Route stop signals to [`SHUTDOWN`]. The handler re-arms the default
/// action, so a second signal ends the process.
#[cfg(unix)]
pub fn install_signal_handlers() {
    let handler = on_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for sig in STOP_SIGNALS {
        // Safety: `on_stop_signal` is async-signal-safe (atomic store, signal()).
        unsafe {
            libc::signal(sig, handler);
        }
    }
}

#[cfg(not(unix))]
pub fn install_signal_handlers() {}

#[cfg(unix)]
extern "C" fn on_stop_signal(sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    // Safety: see `install_signal_handlers`.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

/// Whether a stop signal has arrived.
pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
