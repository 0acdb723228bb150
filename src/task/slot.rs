use std::sync::atomic::{AtomicBool, Ordering};

/// Presence flag shared by everyone who may cancel one scheduled task.
///
/// Starts present. Exactly one caller of [`take`](Self::take) observes
/// `true`; that caller owns the cancellation and every other path backs off.
#[derive(Debug)]
pub struct CancellationSlot {
    present: AtomicBool,
}

impl CancellationSlot {
    pub fn new() -> Self {
        Self {
            present: AtomicBool::new(true),
        }
    }

    /// Consume the slot. Returns true only for the first caller.
    pub fn take(&self) -> bool {
        self.present.swap(false, Ordering::AcqRel)
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }
}

impl Default for CancellationSlot {
    fn default() -> Self {
        Self::new()
    }
}
