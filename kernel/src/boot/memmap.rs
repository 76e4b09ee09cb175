//! Memory map normalization
//!
//! Firmware hands over either a BIOS-style entry list (via the boot
//! protocol) or raw EFI descriptors. Both are folded into one bounded,
//! sorted sequence of typed regions. Overlapping entries resolve toward
//! the more restrictive kind.

use alloc::vec::Vec;

/// Hard cap on normalized entries
pub const MAX_REGIONS: usize = 256;

/// Normalized memory kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Available,
    AcpiReclaim,
    AcpiNvs,
    Reserved,
    BadRam,
}

impl MemoryKind {
    /// Restrictiveness ordering used for overlap resolution
    fn severity(self) -> u8 {
        match self {
            MemoryKind::Available => 0,
            MemoryKind::AcpiReclaim => 1,
            MemoryKind::AcpiNvs => 2,
            MemoryKind::Reserved => 3,
            MemoryKind::BadRam => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::Available => "available",
            MemoryKind::AcpiReclaim => "acpi-reclaim",
            MemoryKind::AcpiNvs => "acpi-nvs",
            MemoryKind::Reserved => "reserved",
            MemoryKind::BadRam => "bad-ram",
        }
    }
}

/// One normalized region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub phys_addr: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    fn end(&self) -> u64 {
        self.phys_addr.saturating_add(self.length)
    }
}

/// Map a boot-protocol entry type onto a normalized kind.
///
/// Bootloader-reclaimable and kernel/module regions stay reserved until an
/// explicit reclaim phase; the framebuffer is device memory.
pub fn kind_from_boot_entry(entry_type: limine::memory_map::EntryType) -> MemoryKind {
    use limine::memory_map::EntryType;
    match entry_type {
        EntryType::USABLE => MemoryKind::Available,
        EntryType::ACPI_RECLAIMABLE => MemoryKind::AcpiReclaim,
        EntryType::ACPI_NVS => MemoryKind::AcpiNvs,
        EntryType::BAD_MEMORY => MemoryKind::BadRam,
        _ => MemoryKind::Reserved,
    }
}

/// Map a raw EFI memory descriptor type onto a normalized kind.
///
/// Loader and boot-services regions become available once boot services
/// have been exited, which is the state the kernel observes them in.
pub fn kind_from_efi_type(efi_type: u32) -> MemoryKind {
    const EFI_LOADER_CODE: u32 = 1;
    const EFI_LOADER_DATA: u32 = 2;
    const EFI_BOOT_SERVICES_CODE: u32 = 3;
    const EFI_BOOT_SERVICES_DATA: u32 = 4;
    const EFI_CONVENTIONAL: u32 = 7;
    const EFI_UNUSABLE: u32 = 8;
    const EFI_ACPI_RECLAIM: u32 = 9;
    const EFI_ACPI_NVS: u32 = 10;

    match efi_type {
        EFI_CONVENTIONAL | EFI_LOADER_CODE | EFI_LOADER_DATA | EFI_BOOT_SERVICES_CODE
        | EFI_BOOT_SERVICES_DATA => MemoryKind::Available,
        EFI_ACPI_RECLAIM => MemoryKind::AcpiReclaim,
        EFI_ACPI_NVS => MemoryKind::AcpiNvs,
        EFI_UNUSABLE => MemoryKind::BadRam,
        _ => MemoryKind::Reserved,
    }
}

/// Normalize a raw region list: drop zero-length entries, cap at
/// [`MAX_REGIONS`], sort by base address, and resolve overlaps by letting
/// the more restrictive kind win inside the overlapped span.
pub fn normalize(raw: &[MemoryRegion]) -> Vec<MemoryRegion> {
    let mut regions: Vec<MemoryRegion> = raw
        .iter()
        .filter(|r| r.length != 0)
        .take(MAX_REGIONS)
        .copied()
        .collect();

    regions.sort_unstable_by_key(|r| (r.phys_addr, r.end()));

    let mut out: Vec<MemoryRegion> = Vec::with_capacity(regions.len());
    for region in regions {
        let last = match out.last().copied() {
            Some(l) => l,
            None => {
                out.push(region);
                continue;
            }
        };

        if region.phys_addr >= last.end() {
            out.push(region);
            continue;
        }

        // Overlap. The more restrictive kind claims the shared span.
        if region.kind.severity() > last.kind.severity() {
            // Trim the earlier, weaker region back to the overlap start
            out.pop();
            let head_len = region.phys_addr - last.phys_addr;
            if head_len != 0 {
                out.push(MemoryRegion {
                    phys_addr: last.phys_addr,
                    length: head_len,
                    kind: last.kind,
                });
            }
            out.push(region);
            // Re-expose any weaker tail past the stronger region
            if last.end() > region.end() {
                out.push(MemoryRegion {
                    phys_addr: region.end(),
                    length: last.end() - region.end(),
                    kind: last.kind,
                });
            }
        } else {
            // The earlier region is at least as restrictive; keep only the
            // part of the new one that extends past it.
            if region.end() > last.end() {
                let start = last.end();
                out.push(MemoryRegion {
                    phys_addr: start,
                    length: region.end() - start,
                    kind: region.kind,
                });
            }
        }
    }

    out.truncate(MAX_REGIONS);
    out
}

/// Total bytes of a given kind
pub fn total_of_kind(regions: &[MemoryRegion], kind: MemoryKind) -> u64 {
    regions
        .iter()
        .filter(|r| r.kind == kind)
        .map(|r| r.length)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: u64, len: u64, kind: MemoryKind) -> MemoryRegion {
        MemoryRegion {
            phys_addr: base,
            length: len,
            kind,
        }
    }

    #[test]
    fn zero_length_entries_are_skipped() {
        let raw = [
            region(0x1000, 0, MemoryKind::Available),
            region(0x2000, 0x1000, MemoryKind::Available),
        ];
        let out = normalize(&raw);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].phys_addr, 0x2000);
    }

    #[test]
    fn result_is_sorted_by_base() {
        let raw = [
            region(0x9000, 0x1000, MemoryKind::Reserved),
            region(0x1000, 0x1000, MemoryKind::Available),
            region(0x5000, 0x1000, MemoryKind::AcpiNvs),
        ];
        let out = normalize(&raw);
        let bases: Vec<u64> = out.iter().map(|r| r.phys_addr).collect();
        assert_eq!(bases, alloc::vec![0x1000, 0x5000, 0x9000]);
    }

    #[test]
    fn overlap_resolves_to_more_restrictive_kind() {
        let raw = [
            region(0x1000, 0x4000, MemoryKind::Available),
            region(0x2000, 0x1000, MemoryKind::Reserved),
        ];
        let out = normalize(&raw);
        // Available head, reserved hole
        assert_eq!(out[0], region(0x1000, 0x1000, MemoryKind::Available));
        assert_eq!(out[1], region(0x2000, 0x1000, MemoryKind::Reserved));
    }

    #[test]
    fn weaker_overlap_is_clipped() {
        let raw = [
            region(0x1000, 0x2000, MemoryKind::BadRam),
            region(0x1000, 0x4000, MemoryKind::Available),
        ];
        let out = normalize(&raw);
        assert_eq!(out[0], region(0x1000, 0x2000, MemoryKind::BadRam));
        assert_eq!(out[1], region(0x3000, 0x2000, MemoryKind::Available));
    }

    #[test]
    fn efi_types_map_per_table() {
        assert_eq!(kind_from_efi_type(7), MemoryKind::Available);
        assert_eq!(kind_from_efi_type(1), MemoryKind::Available);
        assert_eq!(kind_from_efi_type(4), MemoryKind::Available);
        assert_eq!(kind_from_efi_type(9), MemoryKind::AcpiReclaim);
        assert_eq!(kind_from_efi_type(10), MemoryKind::AcpiNvs);
        assert_eq!(kind_from_efi_type(8), MemoryKind::BadRam);
        assert_eq!(kind_from_efi_type(11), MemoryKind::Reserved);
        assert_eq!(kind_from_efi_type(0), MemoryKind::Reserved);
    }

    #[test]
    fn entry_cap_is_enforced() {
        let mut raw = Vec::new();
        for i in 0..400u64 {
            raw.push(region(i * 0x1000, 0x800, MemoryKind::Available));
        }
        let out = normalize(&raw);
        assert!(out.len() <= MAX_REGIONS);
    }
}
