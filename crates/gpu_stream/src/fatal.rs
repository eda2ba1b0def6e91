//! The single abort path for unrecoverable device failures
//!
//! Allocation failure, device loss and wait timeouts leave the renderer with
//! nothing to recover into. They are logged once and the process is aborted.

use crate::error::{GpuError, GpuResult};

/// Log a fatal device error and abort the process
#[cold]
pub fn abort(context: &str, error: &GpuError) -> ! {
    log::error!("Fatal GPU error while {}: {}", context, error);
    std::process::abort()
}

/// Escalate a device result to the abort path
pub trait OrAbort<T> {
    /// Unwrap the value, aborting the process on error
    fn or_abort(self, context: &str) -> T;
}

impl<T> OrAbort<T> for GpuResult<T> {
    #[track_caller]
    fn or_abort(self, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(error) => abort(context, &error),
        }
    }
}

/// Report misuse of the API: panics in debug builds, logs and continues in release
#[track_caller]
pub(crate) fn programmer_error(message: &str) {
    if cfg!(debug_assertions) {
        panic!("{message}");
    }
    log::error!("API misuse: {}", message);
}
