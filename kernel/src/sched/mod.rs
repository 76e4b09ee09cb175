//! Cooperative kernel threads
//!
//! Single CPU, no preemption of kernel code: threads give up the CPU via
//! `task_yield`/`task_sleep_ms`/`task_exit` only. Hardware ISRs are the
//! only asynchronous source. The scheduler lock nests, saving the
//! interrupt flag on first entry and restoring it on final exit; every
//! queue manipulation and the context switch happen under it.

mod task;

pub use task::{spawn, task_exit, task_sleep_ms, task_yield, Thread, ThreadState};

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

static LOCK_DEPTH: AtomicU32 = AtomicU32::new(0);
static SAVED_IF: AtomicBool = AtomicBool::new(false);

/// Enter the scheduler critical section. Nested calls are counted; the
/// interrupt flag observed at the outermost entry is restored on the
/// matching unlock.
pub fn scheduler_lock() {
    let were_enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    if LOCK_DEPTH.fetch_add(1, Ordering::SeqCst) == 0 {
        SAVED_IF.store(were_enabled, Ordering::SeqCst);
    }
}

/// Leave the scheduler critical section
pub fn scheduler_unlock() {
    let depth = LOCK_DEPTH.load(Ordering::SeqCst);
    if depth == 0 {
        return;
    }
    if LOCK_DEPTH.fetch_sub(1, Ordering::SeqCst) == 1 && SAVED_IF.load(Ordering::SeqCst) {
        x86_64::instructions::interrupts::enable();
    }
}

/// Current nesting depth (informational)
pub fn lock_depth() -> u32 {
    LOCK_DEPTH.load(Ordering::SeqCst)
}

/// Bring up the thread system: bootstrap thread and idle thread
pub fn init() {
    task::init();
}
