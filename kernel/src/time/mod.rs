//! Hardware timers and uptime
//!
//! One hardware timer drives the 1 kHz system tick: the HPET when the
//! ACPI table describes a usable legacy-replacement-capable block, the
//! PIT otherwise. Tick callbacks fire in registration order before the
//! interrupt controller ack; the uptime callback bumps a monotonic
//! millisecond counter that wait loops read without locking.

pub mod hpet;
pub mod pit;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, Once};

/// Default system tick rate
pub const TICK_HZ: u32 = 1000;

/// Monotonic milliseconds since the tick started
static UPTIME_MS: AtomicU64 = AtomicU64::new(0);

/// Uniform hardware timer interface
pub trait HardwareTimer: Send + Sync {
    fn name(&self) -> &'static str;
    fn frequency(&self) -> u32;
    fn set_frequency(&self, hz: u32) -> bool;
    /// Install the ISR, program the hardware, unmask the line
    fn start(&self) -> bool;
    /// Quiesce the hardware and mask the line
    fn stop(&self) -> bool;
    fn add_callback(&self, callback: fn());
    fn remove_callback(&self, callback: fn());
}

static ACTIVE_TIMER: Once<&'static dyn HardwareTimer> = Once::new();

/// Bind the selected timer as the uptime source
pub fn set_active_timer(timer: &'static dyn HardwareTimer) {
    ACTIVE_TIMER.call_once(|| timer);
}

/// The timer driving the system tick
pub fn active_timer() -> Option<&'static dyn HardwareTimer> {
    ACTIVE_TIMER.get().copied()
}

/// Current uptime in milliseconds
pub fn uptime_ms() -> u64 {
    UPTIME_MS.load(Ordering::Relaxed)
}

/// Tick callback bound to exactly one timer; one tick is one millisecond
/// at the 1 kHz system rate.
pub fn uptime_tick() {
    UPTIME_MS.fetch_add(1, Ordering::Relaxed);
}

/// Ordered tick callback list shared by the timer implementations
pub struct TickCallbacks {
    list: Mutex<Vec<fn()>>,
    frequency: AtomicU32,
}

impl TickCallbacks {
    pub const fn new(default_hz: u32) -> Self {
        Self {
            list: Mutex::new(Vec::new()),
            frequency: AtomicU32::new(default_hz),
        }
    }

    pub fn add(&self, callback: fn()) {
        let mut list = self.list.lock();
        if !list.iter().any(|&cb| cb as usize == callback as usize) {
            list.push(callback);
        }
    }

    pub fn remove(&self, callback: fn()) {
        self.list
            .lock()
            .retain(|&cb| cb as usize != callback as usize);
    }

    /// Fire every callback in registration order. Runs in ISR context;
    /// the list lock is only ever contended by registration at boot.
    pub fn fire(&self) {
        let list = self.list.lock();
        for cb in list.iter() {
            cb();
        }
    }

    pub fn frequency(&self) -> u32 {
        self.frequency.load(Ordering::Relaxed)
    }

    pub fn set_frequency(&self, hz: u32) {
        self.frequency.store(hz, Ordering::Relaxed);
    }
}

/// Pick and start the system tick source: HPET when usable, else PIT.
/// Returns the chosen timer.
pub fn init() -> &'static dyn HardwareTimer {
    let timer: &'static dyn HardwareTimer = if hpet::supported() {
        crate::log!("[TIME] HPET usable, driving the system tick");
        &hpet::HPET
    } else {
        crate::log!("[TIME] HPET unavailable, falling back to PIT");
        &pit::PIT
    };

    timer.set_frequency(TICK_HZ);
    timer.add_callback(uptime_tick);
    set_active_timer(timer);
    timer
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its trace buffer; tests run concurrently.

    static ORDER_A: Mutex<Vec<u8>> = Mutex::new(Vec::new());
    fn a_first() {
        ORDER_A.lock().push(1);
    }
    fn a_second() {
        ORDER_A.lock().push(2);
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let cbs = TickCallbacks::new(1000);
        cbs.add(a_first);
        cbs.add(a_second);
        cbs.fire();
        assert_eq!(&*ORDER_A.lock(), &[1, 2]);
    }

    static ORDER_B: Mutex<Vec<u8>> = Mutex::new(Vec::new());
    fn b_tick() {
        ORDER_B.lock().push(1);
    }

    #[test]
    fn duplicate_registration_is_idempotent() {
        let cbs = TickCallbacks::new(1000);
        cbs.add(b_tick);
        cbs.add(b_tick);
        cbs.fire();
        assert_eq!(ORDER_B.lock().len(), 1);
    }

    static ORDER_C: Mutex<Vec<u8>> = Mutex::new(Vec::new());
    fn c_first() {
        ORDER_C.lock().push(1);
    }
    fn c_second() {
        ORDER_C.lock().push(2);
    }

    #[test]
    fn remove_unregisters() {
        let cbs = TickCallbacks::new(1000);
        cbs.add(c_first);
        cbs.add(c_second);
        cbs.remove(c_first);
        cbs.fire();
        assert_eq!(&*ORDER_C.lock(), &[2]);
    }
}
