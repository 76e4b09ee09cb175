//! HPET ACPI table parser
//!
//! The table carries the event timer block id and a GAS base address.
//! The counter period is read from the capability register once the base
//! is mapped; a period outside (0, 10^8] femtoseconds marks the table
//! unusable.

use super::tables::{GenericAddress, SdtHeader, GAS_SYSTEM_MEMORY};
use core::ptr;

#[repr(C, packed)]
struct HpetTable {
    header: SdtHeader,
    event_timer_block_id: u32,
    base_address: GenericAddress,
    hpet_number: u8,
    minimum_tick: u16,
    page_protection: u8,
}

/// Parsed HPET info
#[derive(Debug, Clone)]
pub struct HpetInfo {
    pub base_address: u64,
    pub base_is_memory: bool,
    pub hpet_number: u8,
    pub min_tick: u16,
    pub num_comparators: u8,
    pub counter_64bit: bool,
    pub legacy_capable: bool,
    pub period_fs: u32,
}

impl HpetInfo {
    /// Derived counter frequency in Hz
    pub fn frequency(&self) -> u64 {
        if self.period_fs == 0 {
            return 0;
        }
        1_000_000_000_000_000u64 / self.period_fs as u64
    }

    /// A usable timer: MMIO in system memory, sane period, legacy routing
    pub fn usable(&self) -> bool {
        self.base_is_memory
            && self.base_address != 0
            && period_plausible(self.period_fs)
            && self.legacy_capable
    }
}

/// Valid period window: nonzero and at most 100 ns
pub fn period_plausible(period_fs: u32) -> bool {
    period_fs != 0 && period_fs <= 100_000_000
}

/// Parse a mapped HPET table, reading capabilities from the hardware
pub fn parse(hpet_virt: u64) -> Option<HpetInfo> {
    let table = unsafe { &*(hpet_virt as *const HpetTable) };
    if &table.header.signature != b"HPET" {
        return None;
    }

    let event_id = unsafe { ptr::read_unaligned(ptr::addr_of!(table.event_timer_block_id)) };
    let base = unsafe { ptr::read_unaligned(ptr::addr_of!(table.base_address)) };
    let min_tick = unsafe { ptr::read_unaligned(ptr::addr_of!(table.minimum_tick)) };

    let base_is_memory = base.address_space_id == GAS_SYSTEM_MEMORY;

    // Capability register (offset 0) carries the authoritative period and
    // feature bits; the table's block id is the fallback.
    let mut num_comparators = (((event_id >> 8) & 0x1F) + 1) as u8;
    let mut counter_64bit = (event_id & (1 << 13)) != 0;
    let mut legacy_capable = (event_id & (1 << 15)) != 0;
    let mut period_fs = 0u32;

    if base_is_memory && base.address != 0 {
        if let Ok(virt) = crate::memory::map_mmio(base.address, 4096) {
            let cap = unsafe { core::ptr::read_volatile(virt as *const u64) };
            period_fs = (cap >> 32) as u32;
            num_comparators = (((cap >> 8) & 0x1F) + 1) as u8;
            counter_64bit = (cap & (1 << 13)) != 0;
            legacy_capable = (cap & (1 << 15)) != 0;
        }
    }

    Some(HpetInfo {
        base_address: base.address,
        base_is_memory,
        hpet_number: table.hpet_number,
        min_tick,
        num_comparators,
        counter_64bit,
        legacy_capable,
        period_fs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_window() {
        assert!(!period_plausible(0));
        assert!(period_plausible(10_000_000)); // 10 ns, typical
        assert!(period_plausible(100_000_000));
        assert!(!period_plausible(100_000_001));
    }

    #[test]
    fn frequency_derivation() {
        let info = HpetInfo {
            base_address: 0xFED0_0000,
            base_is_memory: true,
            hpet_number: 0,
            min_tick: 0,
            num_comparators: 3,
            counter_64bit: true,
            legacy_capable: true,
            period_fs: 69_841_279, // QEMU's 14.318 MHz
        };
        let hz = info.frequency();
        assert!(hz > 14_000_000 && hz < 14_400_000);
    }
}
