//! Interrupt handling
//!
//! The IDT routes legacy IRQ vectors 32..47 through a fixed dispatch
//! table of plain function pointers. Which hardware actually delivers
//! them is behind the [`IrqController`] trait: the 8259 PIC pair or the
//! APIC (LAPIC + IO-APIC). Exactly one controller is selected at boot.

pub mod handlers;
pub mod idt;
pub mod pic;

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Once;

/// First vector used for legacy IRQs
pub const IRQ_VECTOR_BASE: u8 = 32;
/// Number of legacy IRQ lines
pub const IRQ_LINES: usize = 16;

/// Uniform interrupt controller interface.
///
/// `register_handler` must be called while the line is masked and is
/// idempotent; `ack` is only legal from interrupt context.
pub trait IrqController: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sanitize hardware state; all lines are masked afterwards
    fn init(&self) -> bool;

    fn enable(&self, irq: u32);
    fn disable(&self, irq: u32);
    fn ack(&self, irq: u32);
    fn is_enabled(&self, irq: u32) -> bool;
    fn register_handler(&self, irq: u32, handler: fn());
    fn unregister_handler(&self, irq: u32);

    // GSI-based variants. The PIC has no GSI space; identity is assumed.
    fn enable_gsi(&self, gsi: u32) {
        self.enable(gsi);
    }
    fn disable_gsi(&self, gsi: u32) {
        self.disable(gsi);
    }
    fn ack_gsi(&self, gsi: u32) {
        self.ack(gsi);
    }
    fn is_enabled_gsi(&self, gsi: u32) -> bool {
        self.is_enabled(gsi)
    }
    fn register_handler_gsi(&self, gsi: u32, handler: fn()) {
        self.register_handler(gsi, handler);
    }
}

static CONTROLLER: Once<&'static dyn IrqController> = Once::new();

/// Publish the selected controller. Called once at boot after `init`.
pub fn set_controller(controller: &'static dyn IrqController) {
    CONTROLLER.call_once(|| controller);
}

/// The active controller, if one has been selected
pub fn controller() -> Option<&'static dyn IrqController> {
    CONTROLLER.get().copied()
}

/// Per-IRQ handler slots. Stored as raw fn addresses; zero means empty.
static IRQ_HANDLERS: [AtomicUsize; IRQ_LINES] = {
    const EMPTY: AtomicUsize = AtomicUsize::new(0);
    [EMPTY; IRQ_LINES]
};

/// Install a handler for an IRQ line (idempotent)
pub fn set_irq_handler(irq: u32, handler: fn()) {
    if (irq as usize) < IRQ_LINES {
        IRQ_HANDLERS[irq as usize].store(handler as usize, Ordering::SeqCst);
    }
}

/// Remove the handler for an IRQ line
pub fn clear_irq_handler(irq: u32) {
    if (irq as usize) < IRQ_LINES {
        IRQ_HANDLERS[irq as usize].store(0, Ordering::SeqCst);
    }
}

/// Common IRQ dispatch, called from the per-vector stubs.
///
/// Installed handlers acknowledge for themselves (the timer fires its
/// callback chain before the ack); a spurious line is acked here so it
/// cannot wedge the controller.
pub(crate) fn dispatch_irq(irq: u32) {
    let slot = IRQ_HANDLERS[irq as usize].load(Ordering::SeqCst);
    if slot != 0 {
        let handler: fn() = unsafe { core::mem::transmute(slot) };
        handler();
        return;
    }

    if let Some(c) = controller() {
        c.ack(irq);
    }
}

/// Set up the IDT. The controller is selected separately.
pub fn init() {
    idt::init();
}
