//! Ctrl-C and SIGTERM handling.
//!
//! Servers and clients run in their own process groups, so a terminal
//! interrupt reaches only the harness. The installed handler raises a flag
//! instead of exiting; the runner checks it between client runs and stops
//! the live server before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Shared "stop now" flag
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
}

impl Interrupt {
    /// A flag nothing will raise except [`Interrupt::raise`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT and SIGTERM to a new flag. Call at most once per process.
    pub fn install() -> Result<Self, ctrlc::Error> {
        let interrupt = Self::new();
        let flag = Arc::clone(&interrupt.raised);
        ctrlc::set_handler(move || {
            if !flag.swap(true, Ordering::SeqCst) {
                warn!("Interrupted, stopping the server and exiting");
            }
        })?;
        Ok(interrupt)
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}
