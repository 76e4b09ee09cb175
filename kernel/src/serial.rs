//! Serial console
//!
//! UART 16550 on COM1 backs all kernel logging. The port can be rebased
//! once at boot if the ACPI SPCR table names a different I/O-port UART.

use core::fmt;
use core::sync::atomic::{AtomicU16, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

/// Standard COM1 base
const COM1: u16 = 0x3F8;

/// Active UART base, replaced by SPCR discovery before first use
static UART_BASE: AtomicU16 = AtomicU16::new(COM1);

lazy_static! {
    static ref UART: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(UART_BASE.load(Ordering::Relaxed)) };
        port.init();
        Mutex::new(port)
    };
}

/// Point the console at an SPCR-discovered I/O-port UART.
/// Only effective before the first print touches the port.
pub fn set_base(io_port: u16) {
    UART_BASE.store(io_port, Ordering::Relaxed);
}

/// Force UART initialization
pub fn init() {
    let _ = UART.lock();
}

#[cfg(not(test))]
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    // Interrupts off so an ISR logging mid-line cannot deadlock the port
    interrupts::without_interrupts(|| {
        let _ = UART.lock().write_fmt(args);
    });
}

/// Host test builds have no UART to talk to
#[cfg(test)]
#[doc(hidden)]
pub fn _print(_args: fmt::Arguments) {}

/// Print to the serial console
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print to the serial console with newline
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*
    ));
}
