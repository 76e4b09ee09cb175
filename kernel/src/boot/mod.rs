//! Boot-time firmware handoff
//!
//! The bootloader delivers parsed pointers (memory map, RSDP, HHDM
//! offset, firmware kind, command line); this module normalizes them into
//! the forms the rest of the kernel consumes. A missing memory map is
//! fatal: the machine halts.

pub mod memmap;

use alloc::string::String;
use alloc::vec::Vec;
use spin::Once;

pub use memmap::{MemoryKind, MemoryRegion};

/// Firmware flavor the machine booted from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareKind {
    Bios,
    Uefi,
}

/// Everything the kernel keeps from the firmware handoff
#[derive(Debug)]
pub struct BootInfo {
    pub firmware: FirmwareKind,
    pub memory_map: Vec<MemoryRegion>,
    pub rsdp_addr: u64,
    pub hhdm_offset: u64,
    pub cmdline: Option<String>,
}

static BOOT_INFO: Once<BootInfo> = Once::new();

/// Store the handoff snapshot. Constructed once during boot, never mutated.
pub fn set_info(info: BootInfo) -> &'static BootInfo {
    BOOT_INFO.call_once(|| info)
}

/// Get the handoff snapshot (must be published first)
pub fn info() -> Option<&'static BootInfo> {
    BOOT_INFO.get()
}

/// Halt forever. Used for fatal boot conditions (no memory map).
pub fn halt() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}
