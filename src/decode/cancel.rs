use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// User-requested interruption, polled between optimization steps.
///
/// A raised flag ends only the current (example, length) pair; the loop
/// consumes it with [`CancelFlag::take`] so later pairs run normally.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was raised.
    #[must_use]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}
