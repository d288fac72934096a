//! Operator interrupts observed while draining an engine.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::warn;

/// Shared flag consulted by [`QueryEngine::finalize`](crate::QueryEngine::finalize).
///
/// Clones observe the same flag, so a handle can be moved into a signal handler or another
/// thread while the owner keeps draining.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an interrupt raised by Ctrl-C.
    ///
    /// Only one process-wide handler can exist; installing a second one fails.
    pub fn ctrlc() -> Result<Self, ctrlc::Error> {
        let interrupt = Self::new();
        let handle = interrupt.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received, aborting drain");
            handle.raise();
        })?;
        Ok(interrupt)
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
