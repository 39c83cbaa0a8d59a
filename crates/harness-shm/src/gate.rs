use crate::sync::{AtomicBool, Ordering};

/// Exactly-once latch guarding region release.
///
/// The first caller of [`try_enter`](Self::try_enter) wins and must perform
/// the guarded work; every later caller (from any thread) gets `false`.
#[derive(Debug)]
pub struct CleanupGate {
    entered: AtomicBool,
}

impl CleanupGate {
    pub fn new() -> Self {
        Self {
            entered: AtomicBool::new(false),
        }
    }

    /// Returns `true` for exactly one caller over the lifetime of the gate.
    #[inline]
    pub fn try_enter(&self) -> bool {
        !self.entered.swap(true, Ordering::AcqRel)
    }

    /// Whether some caller has already entered.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.entered.load(Ordering::Acquire)
    }
}

impl Default for CleanupGate {
    fn default() -> Self {
        Self::new()
    }
}
