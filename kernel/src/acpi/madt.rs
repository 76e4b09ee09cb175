//! MADT (Multiple APIC Description Table) parser
//!
//! Yields the local APIC base (including the 64-bit address override),
//! the I/O APIC list and the ISA interrupt source overrides.

use super::tables::SdtHeader;
use alloc::vec::Vec;
use core::ptr;

#[repr(C, packed)]
struct MadtHeader {
    local_apic_addr: u32,
    flags: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct EntryHeader {
    entry_type: u8,
    length: u8,
}

const ENTRY_IO_APIC: u8 = 1;
const ENTRY_INT_SRC_OVERRIDE: u8 = 2;
const ENTRY_LOCAL_APIC_ADDR_OVERRIDE: u8 = 5;

#[repr(C, packed)]
struct IoApicEntry {
    header: EntryHeader,
    io_apic_id: u8,
    _reserved: u8,
    io_apic_addr: u32,
    gsi_base: u32,
}

#[repr(C, packed)]
struct IntSourceOverrideEntry {
    header: EntryHeader,
    bus: u8,
    source: u8,
    gsi: u32,
    flags: u16,
}

#[repr(C, packed)]
struct LocalApicAddrOverrideEntry {
    header: EntryHeader,
    _reserved: u16,
    local_apic_addr: u64,
}

/// Parsed I/O APIC entry
#[derive(Debug, Clone)]
pub struct IoApic {
    pub id: u8,
    pub address: u64,
    pub gsi_base: u32,
}

/// Parsed interrupt source override.
/// Polarity/trigger use the raw two-bit MADT encodings (3 = low / level).
#[derive(Debug, Clone)]
pub struct IntSourceOverride {
    pub source: u8,
    pub gsi: u32,
    pub polarity: u8,
    pub trigger: u8,
}

/// Everything extracted from one MADT
pub struct ParsedMadt {
    pub local_apic_addr: u64,
    pub io_apics: Vec<IoApic>,
    pub overrides: Vec<IntSourceOverride>,
}

/// Parse a mapped MADT
pub fn parse(madt_virt: u64) -> Option<ParsedMadt> {
    let header = unsafe { &*(madt_virt as *const SdtHeader) };
    if &header.signature != b"APIC" {
        return None;
    }
    let table_len = unsafe { ptr::read_unaligned(ptr::addr_of!(header.length)) } as u64;

    let body = madt_virt + core::mem::size_of::<SdtHeader>() as u64;
    let madt = unsafe { &*(body as *const MadtHeader) };
    let mut local_apic_addr =
        unsafe { ptr::read_unaligned(ptr::addr_of!(madt.local_apic_addr)) } as u64;

    let mut io_apics = Vec::new();
    let mut overrides = Vec::new();

    let mut offset = body + core::mem::size_of::<MadtHeader>() as u64;
    let end = madt_virt + table_len;

    while offset + 2 <= end {
        let entry = unsafe { &*(offset as *const EntryHeader) };
        if entry.length < 2 {
            break;
        }

        match entry.entry_type {
            ENTRY_IO_APIC if entry.length >= 12 => {
                let e = unsafe { &*(offset as *const IoApicEntry) };
                let addr = unsafe { ptr::read_unaligned(ptr::addr_of!(e.io_apic_addr)) };
                let gsi_base = unsafe { ptr::read_unaligned(ptr::addr_of!(e.gsi_base)) };
                io_apics.push(IoApic {
                    id: e.io_apic_id,
                    address: addr as u64,
                    gsi_base,
                });
            }
            ENTRY_INT_SRC_OVERRIDE if entry.length >= 10 => {
                let e = unsafe { &*(offset as *const IntSourceOverrideEntry) };
                let gsi = unsafe { ptr::read_unaligned(ptr::addr_of!(e.gsi)) };
                let flags = unsafe { ptr::read_unaligned(ptr::addr_of!(e.flags)) };
                overrides.push(IntSourceOverride {
                    source: e.source,
                    gsi,
                    polarity: (flags & 0x3) as u8,
                    trigger: ((flags >> 2) & 0x3) as u8,
                });
            }
            ENTRY_LOCAL_APIC_ADDR_OVERRIDE if entry.length >= 12 => {
                let e = unsafe { &*(offset as *const LocalApicAddrOverrideEntry) };
                local_apic_addr =
                    unsafe { ptr::read_unaligned(ptr::addr_of!(e.local_apic_addr)) };
            }
            _ => {}
        }

        offset += entry.length as u64;
    }

    Some(ParsedMadt {
        local_apic_addr,
        io_apics,
        overrides,
    })
}
