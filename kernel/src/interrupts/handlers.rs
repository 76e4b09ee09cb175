//! IRQ handler helpers shared by drivers
//!
//! Drivers that only need "an interrupt happened" semantics park a flag
//! here; bounded wait loops consume it instead of busy-polling status.

use core::sync::atomic::{AtomicU32, Ordering};

/// Simple latched event counter for one IRQ source
pub struct IrqEvent {
    pending: AtomicU32,
}

impl IrqEvent {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
        }
    }

    /// Called from the ISR
    pub fn signal(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Test without consuming
    pub fn is_signaled(&self) -> bool {
        self.pending.load(Ordering::SeqCst) != 0
    }

    /// Consume any pending signal, reporting whether one was present
    pub fn take(&self) -> bool {
        self.pending.swap(0, Ordering::SeqCst) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_signal() {
        let ev = IrqEvent::new();
        assert!(!ev.is_signaled());
        ev.signal();
        ev.signal();
        assert!(ev.is_signaled());
        assert!(ev.take());
        assert!(!ev.is_signaled());
        assert!(!ev.take());
    }
}
