//! Graceful shutdown between batches via atomic flag

use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag: set by the SIGTERM/SIGINT handler, read at batch barriers
pub fn shutdown_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

/// Check if shutdown was requested
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}
