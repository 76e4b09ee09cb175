//! 8253/8254 programmable interval timer
//!
//! Always present; the fallback tick source. Channel 0 in mode 2 (rate
//! generator) with the divisor derived from the 1.193182 MHz input clock.

use super::{HardwareTimer, TickCallbacks};
use x86_64::instructions::port::Port;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 2, binary
const PIT_CMD_RATE_GEN: u8 = 0x34;

const PIT_INPUT_HZ: u32 = 1_193_182;
const PIT_IRQ: u32 = 0;

static CALLBACKS: TickCallbacks = TickCallbacks::new(super::TICK_HZ);

fn program(hz: u32) {
    let divisor = if hz == 0 {
        0
    } else {
        (PIT_INPUT_HZ / hz).clamp(1, 65535)
    };
    unsafe {
        Port::<u8>::new(PIT_COMMAND).write(PIT_CMD_RATE_GEN);
        Port::<u8>::new(PIT_CHANNEL0).write((divisor & 0xFF) as u8);
        Port::<u8>::new(PIT_CHANNEL0).write((divisor >> 8) as u8);
    }
}

/// PIT tick ISR: callbacks in order, then the controller ack
fn pit_isr() {
    CALLBACKS.fire();
    if let Some(c) = crate::interrupts::controller() {
        c.ack(PIT_IRQ);
    }
}

/// The PIT behind the [`HardwareTimer`] interface
pub struct PitTimer;

pub static PIT: PitTimer = PitTimer;

impl HardwareTimer for PitTimer {
    fn name(&self) -> &'static str {
        "PIT"
    }

    fn frequency(&self) -> u32 {
        CALLBACKS.frequency()
    }

    fn set_frequency(&self, hz: u32) -> bool {
        if hz == 0 {
            return false;
        }
        CALLBACKS.set_frequency(hz);
        program(hz);
        true
    }

    fn start(&self) -> bool {
        let controller = match crate::interrupts::controller() {
            Some(c) => c,
            None => return false,
        };
        controller.register_handler(PIT_IRQ, pit_isr);
        program(CALLBACKS.frequency());
        controller.enable(PIT_IRQ);
        crate::log!("[PIT] started at {} Hz", CALLBACKS.frequency());
        true
    }

    fn stop(&self) -> bool {
        if let Some(c) = crate::interrupts::controller() {
            c.disable(PIT_IRQ);
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
