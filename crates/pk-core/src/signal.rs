//! Interrupt handling for builds (SIGINT/SIGTERM).
//!
//! The first signal raises the cancel flag the build checks between stages,
//! so the staging area still restores the asset root before the process
//! exits. Later signals are reported but otherwise ignored: stopping in the
//! middle of the restore is exactly what the flag exists to avoid.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// What a received signal should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: stop at the next stage boundary
    Cancel,
    /// Cleanup already under way
    AlreadyCancelling,
}

/// Shared between the signal handler and the running build.
#[derive(Debug, Default)]
pub struct SignalState {
    cancel: Arc<AtomicBool>,
    count: AtomicU8,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag to hand to `PassBuilder::with_cancel_flag`.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn handle_signal(&self) -> SignalAction {
        let previous = self.count.fetch_add(1, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
        if previous == 0 {
            SignalAction::Cancel
        } else {
            SignalAction::AlreadyCancelling
        }
    }
}

/// Install the process-wide handler. Can only succeed once per process.
pub fn install(state: Arc<SignalState>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || match state.handle_signal() {
        SignalAction::Cancel => {
            eprintln!("\nInterrupted, restoring assets before exit...");
        }
        SignalAction::AlreadyCancelling => {
            eprintln!("\nStill restoring assets; if forced to stop, run `pkpass recover`.");
        }
    })
}
