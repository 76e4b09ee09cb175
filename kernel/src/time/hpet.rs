//! HPET system tick
//!
//! Comparator 0 in periodic mode with legacy replacement routing, which
//! puts the interrupt on the IRQ0 path regardless of controller. The
//! periodic comparator takes the two-write sequence: absolute first
//! deadline, then the accumulator interval under VAL_SET.

use super::{HardwareTimer, TickCallbacks};
use core::sync::atomic::{AtomicU64, Ordering};

const REG_CAP_ID: u64 = 0x000;
const REG_CONFIG: u64 = 0x010;
const REG_ISR: u64 = 0x020;
const REG_MAIN_COUNTER: u64 = 0x0F0;

const fn timer_config(n: u64) -> u64 {
    0x100 + 0x20 * n
}
const fn timer_comparator(n: u64) -> u64 {
    0x108 + 0x20 * n
}

const CFG_ENABLE: u64 = 1 << 0;
const CFG_LEGACY_ROUTE: u64 = 1 << 1;

const TN_INT_ENABLE: u64 = 1 << 2;
const TN_PERIODIC: u64 = 1 << 3;
const TN_VAL_SET: u64 = 1 << 6;
const TN_32BIT_MODE: u64 = 1 << 8;

/// Comparator used for the system tick
const TICK_TIMER: u64 = 0;
/// Legacy replacement routes comparator 0 onto the IRQ0 path
const TICK_IRQ: u32 = 0;

static MMIO_BASE: AtomicU64 = AtomicU64::new(0);
static COUNTER_HZ: AtomicU64 = AtomicU64::new(0);

static CALLBACKS: TickCallbacks = TickCallbacks::new(super::TICK_HZ);

fn read64(offset: u64) -> u64 {
    let base = MMIO_BASE.load(Ordering::Relaxed);
    unsafe { core::ptr::read_volatile((base + offset) as *const u64) }
}

fn write64(offset: u64, value: u64) {
    let base = MMIO_BASE.load(Ordering::Relaxed);
    unsafe { core::ptr::write_volatile((base + offset) as *mut u64, value) };
    // Read back to flush the posted write
    let _ = read64(REG_CAP_ID);
}

/// Rounded counter ticks per interrupt for a target rate
fn ticks_for_hz(hz: u32) -> u64 {
    let counter_hz = COUNTER_HZ.load(Ordering::Relaxed);
    if hz == 0 || counter_hz == 0 {
        return 0;
    }
    (counter_hz + (hz as u64 / 2)) / hz as u64
}

/// Whether the ACPI HPET description is good enough to carry the tick
pub fn supported() -> bool {
    crate::acpi::get_info()
        .and_then(|i| i.hpet.as_ref())
        .map(|h| h.usable())
        .unwrap_or(false)
}

fn program_periodic(hz: u32) {
    let mut ticks = ticks_for_hz(hz);
    if ticks == 0 {
        ticks = 1;
    }

    // Main counter stops while the comparator is reprogrammed
    let mut cfg = read64(REG_CONFIG);
    cfg &= !CFG_ENABLE;
    write64(REG_CONFIG, cfg);

    // Drop any latched comparator-0 status (write one to clear)
    write64(REG_ISR, 1 << TICK_TIMER);

    let mut tcfg = read64(timer_config(TICK_TIMER));
    tcfg |= TN_INT_ENABLE | TN_PERIODIC | TN_VAL_SET;
    tcfg &= !TN_32BIT_MODE;
    write64(timer_config(TICK_TIMER), tcfg);

    // First write arms the absolute deadline; the second, still under
    // VAL_SET, loads the periodic accumulator.
    let now = read64(REG_MAIN_COUNTER);
    write64(timer_comparator(TICK_TIMER), now.wrapping_add(ticks));
    write64(timer_comparator(TICK_TIMER), ticks);

    cfg |= CFG_LEGACY_ROUTE | CFG_ENABLE;
    write64(REG_CONFIG, cfg);
}

/// HPET tick ISR: clear comparator status, callbacks in order, ack
fn hpet_isr() {
    write64(REG_ISR, 1 << TICK_TIMER);
    CALLBACKS.fire();
    if let Some(c) = crate::interrupts::controller() {
        c.ack(TICK_IRQ);
    }
}

/// The HPET behind the [`HardwareTimer`] interface
pub struct HpetTimer;

pub static HPET: HpetTimer = HpetTimer;

impl HpetTimer {
    /// Map the MMIO block and derive the counter frequency
    fn ensure_mapped(&self) -> bool {
        if MMIO_BASE.load(Ordering::Relaxed) != 0 {
            return true;
        }
        let info = match crate::acpi::get_info().and_then(|i| i.hpet.clone()) {
            Some(h) if h.usable() => h,
            _ => return false,
        };
        let virt = match crate::memory::map_mmio(info.base_address, 4096) {
            Ok(v) => v,
            Err(e) => {
                crate::log_warn!("[HPET] MMIO map failed: {}", e);
                return false;
            }
        };
        MMIO_BASE.store(virt, Ordering::SeqCst);
        COUNTER_HZ.store(info.frequency(), Ordering::SeqCst);
        crate::log!(
            "[HPET] base={:#x} counter={} Hz comparators={}",
            info.base_address,
            info.frequency(),
            info.num_comparators
        );
        true
    }
}

impl HardwareTimer for HpetTimer {
    fn name(&self) -> &'static str {
        "HPET"
    }

    fn frequency(&self) -> u32 {
        CALLBACKS.frequency()
    }

    fn set_frequency(&self, hz: u32) -> bool {
        if hz == 0 {
            return false;
        }
        CALLBACKS.set_frequency(hz);
        if MMIO_BASE.load(Ordering::Relaxed) != 0
            && read64(REG_CONFIG) & CFG_ENABLE != 0
        {
            program_periodic(hz);
        }
        true
    }

    fn start(&self) -> bool {
        if !self.ensure_mapped() {
            return false;
        }
        let controller = match crate::interrupts::controller() {
            Some(c) => c,
            None => return false,
        };
        controller.register_handler(TICK_IRQ, hpet_isr);
        program_periodic(CALLBACKS.frequency());
        controller.enable(TICK_IRQ);
        crate::log!("[HPET] started at {} Hz", CALLBACKS.frequency());
        true
    }

    fn stop(&self) -> bool {
        if MMIO_BASE.load(Ordering::Relaxed) == 0 {
            return false;
        }
        let mut cfg = read64(REG_CONFIG);
        cfg &= !CFG_ENABLE;
        write64(REG_CONFIG, cfg);
        if let Some(c) = crate::interrupts::controller() {
            c.disable(TICK_IRQ);
        }
        true
    }

    fn add_callback(&self, callback: fn()) {
        CALLBACKS.add(callback);
    }

    fn remove_callback(&self, callback: fn()) {
        CALLBACKS.remove(callback);
    }
}
