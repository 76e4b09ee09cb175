//! SPCR (Serial Port Console Redirection) parser
//!
//! Only I/O-port UARTs are interesting here; MMIO consoles are left to
//! the legacy COM1 probe.

use super::tables::{GenericAddress, SdtHeader, GAS_SYSTEM_IO};
use core::ptr;

#[repr(C, packed)]
struct SpcrTable {
    header: SdtHeader,
    interface_type: u8,
    _reserved: [u8; 3],
    base_address: GenericAddress,
    interrupt_type: u8,
    irq: u8,
    gsi: u32,
    baud_rate: u8,
    parity: u8,
    stop_bits: u8,
    flow_control: u8,
    terminal_type: u8,
}

/// Parsed serial console endpoint
#[derive(Debug, Clone)]
pub struct SpcrInfo {
    pub interface_type: u8,
    pub io_port: u16,
    pub irq: u8,
    pub baud_rate: u8,
}

/// Parse a mapped SPCR; returns None for MMIO consoles
pub fn parse(spcr_virt: u64) -> Option<SpcrInfo> {
    let table = unsafe { &*(spcr_virt as *const SpcrTable) };
    if &table.header.signature != b"SPCR" {
        return None;
    }

    let base = unsafe { ptr::read_unaligned(ptr::addr_of!(table.base_address)) };
    if base.address_space_id != GAS_SYSTEM_IO || base.address == 0 {
        return None;
    }

    Some(SpcrInfo {
        interface_type: table.interface_type,
        io_port: base.address as u16,
        irq: table.irq,
        baud_rate: table.baud_rate,
    })
}
