//! ACPI table discovery
//!
//! Walks RSDP -> XSDT/RSDT and parses the tables the kernel consumes:
//! MADT (interrupt routing), FADT (power management ports), HPET (high
//! precision timer), SPCR (serial console). Every table is validated by
//! signature and byte-sum checksum before parsing.

pub mod fadt;
pub mod hpet;
pub mod madt;
pub mod spcr;
pub mod tables;

use alloc::string::String;
use alloc::vec::Vec;
use core::ptr;
use spin::Once;

/// Parsed ACPI state, filled once during boot
#[derive(Debug, Clone)]
pub struct AcpiInfo {
    /// ACPI revision (1 = 1.0, 2+ = 2.0+)
    pub revision: u8,
    /// OEM ID from the RSDP
    pub oem_id: String,
    /// Local APIC physical base
    pub local_apic_addr: u64,
    /// I/O APICs from the MADT
    pub io_apics: Vec<madt::IoApic>,
    /// Interrupt source overrides from the MADT
    pub int_overrides: Vec<madt::IntSourceOverride>,
    /// FADT power management info
    pub fadt: Option<fadt::FadtInfo>,
    /// HPET table info
    pub hpet: Option<hpet::HpetInfo>,
    /// SPCR serial console info
    pub spcr: Option<spcr::SpcrInfo>,
}

impl Default for AcpiInfo {
    fn default() -> Self {
        Self {
            revision: 0,
            oem_id: String::new(),
            local_apic_addr: 0xFEE0_0000,
            io_apics: Vec::new(),
            int_overrides: Vec::new(),
            fadt: None,
            hpet: None,
            spcr: None,
        }
    }
}

static ACPI_INFO: Once<AcpiInfo> = Once::new();

/// Get parsed ACPI information (init must have run)
pub fn get_info() -> Option<&'static AcpiInfo> {
    ACPI_INFO.get()
}

/// Local APIC base, with the architectural default as fallback
pub fn local_apic_address() -> u64 {
    ACPI_INFO
        .get()
        .map(|i| i.local_apic_addr)
        .unwrap_or(0xFEE0_0000)
}

/// Initialize ACPI from the RSDP address handed over at boot. The boot
/// protocol may deliver either a physical address or one already inside
/// the direct map.
pub fn init(rsdp_addr: u64) -> bool {
    if rsdp_addr == 0 {
        crate::log_warn!("[ACPI] no RSDP provided");
        return false;
    }

    let hhdm = crate::memory::hhdm_offset();
    let rsdp_phys = if rsdp_addr >= hhdm {
        rsdp_addr - hhdm
    } else {
        rsdp_addr
    };

    let rsdp_virt = match crate::memory::map_mmio(rsdp_phys, 4096) {
        Ok(v) => v,
        Err(e) => {
            crate::log_warn!("[ACPI] failed to map RSDP at {:#x}: {}", rsdp_phys, e);
            return false;
        }
    };

    let rsdp = unsafe { &*(rsdp_virt as *const tables::Rsdp) };
    if &rsdp.signature != b"RSD PTR " {
        crate::log_warn!("[ACPI] bad RSDP signature");
        return false;
    }
    if !tables::checksum_ok(rsdp_virt, 20) {
        crate::log_warn!("[ACPI] RSDP checksum mismatch");
        return false;
    }

    let mut info = AcpiInfo::default();
    info.revision = rsdp.revision;
    info.oem_id = core::str::from_utf8(&rsdp.oem_id)
        .unwrap_or("??????")
        .trim()
        .into();

    // Prefer the XSDT when the v2 structure validates; fall back to RSDT.
    let table_addrs = if info.revision >= 2 {
        let xsdp = unsafe { &*(rsdp_virt as *const tables::Xsdp) };
        let length = unsafe { ptr::read_unaligned(ptr::addr_of!(xsdp.length)) };
        let xsdt = unsafe { ptr::read_unaligned(ptr::addr_of!(xsdp.xsdt_address)) };
        if tables::checksum_ok(rsdp_virt, length as usize) && xsdt != 0 {
            walk_sdt(xsdt, b"XSDT", 8)
        } else {
            crate::log_warn!("[ACPI] XSDP checksum invalid, using RSDT");
            let rsdt = unsafe { ptr::read_unaligned(ptr::addr_of!(rsdp.rsdt_address)) };
            walk_sdt(rsdt as u64, b"RSDT", 4)
        }
    } else {
        let rsdt = unsafe { ptr::read_unaligned(ptr::addr_of!(rsdp.rsdt_address)) };
        walk_sdt(rsdt as u64, b"RSDT", 4)
    };

    crate::log!(
        "[ACPI] rev {} oem '{}': {} tables",
        info.revision,
        info.oem_id,
        table_addrs.len()
    );

    for &table_phys in &table_addrs {
        let table_virt = match crate::memory::map_mmio(table_phys, 4096) {
            Ok(v) => v,
            Err(e) => {
                crate::log_warn!("[ACPI] cannot map table at {:#x}: {}", table_phys, e);
                continue;
            }
        };

        let header = unsafe { &*(table_virt as *const tables::SdtHeader) };
        let signature = header.signature;
        let length = unsafe { ptr::read_unaligned(ptr::addr_of!(header.length)) };

        if length as usize > 4096 {
            if crate::memory::map_mmio(table_phys + 4096, length as usize - 4096).is_err() {
                crate::log_warn!("[ACPI] cannot map tail of large table");
                continue;
            }
        }

        if !tables::checksum_ok(table_virt, length as usize) {
            crate::log_warn!(
                "[ACPI] table {} checksum mismatch, skipping",
                core::str::from_utf8(&signature).unwrap_or("????")
            );
            continue;
        }

        match &signature {
            b"APIC" => {
                if let Some(parsed) = madt::parse(table_virt) {
                    info.local_apic_addr = parsed.local_apic_addr;
                    info.io_apics = parsed.io_apics;
                    info.int_overrides = parsed.overrides;
                    crate::log!(
                        "[ACPI] MADT: lapic={:#x}, {} ioapics, {} overrides",
                        info.local_apic_addr,
                        info.io_apics.len(),
                        info.int_overrides.len()
                    );
                }
            }
            b"FACP" => {
                if let Some(parsed) = fadt::parse(table_virt) {
                    crate::log!(
                        "[ACPI] FADT: pm1a={:#x} pm1b={:#x}",
                        parsed.pm1a_cnt_blk,
                        parsed.pm1b_cnt_blk
                    );
                    info.fadt = Some(parsed);
                }
            }
            b"HPET" => {
                if let Some(parsed) = hpet::parse(table_virt) {
                    crate::log!(
                        "[ACPI] HPET: base={:#x} period={} fs legacy={}",
                        parsed.base_address,
                        parsed.period_fs,
                        parsed.legacy_capable
                    );
                    info.hpet = Some(parsed);
                }
            }
            b"SPCR" => {
                if let Some(parsed) = spcr::parse(table_virt) {
                    crate::log!("[ACPI] SPCR: io port {:#x}", parsed.io_port);
                    info.spcr = Some(parsed);
                }
            }
            _ => {}
        }
    }

    ACPI_INFO.call_once(|| info);
    true
}

/// Walk an XSDT (8-byte entries) or RSDT (4-byte entries) into a flat
/// list of table addresses.
fn walk_sdt(root_phys: u64, signature: &[u8; 4], entry_size: usize) -> Vec<u64> {
    if root_phys == 0 {
        return Vec::new();
    }
    let root_virt = match crate::memory::map_mmio(root_phys, 4096) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    if !tables::sdt_valid(root_virt, signature) {
        crate::log_warn!(
            "[ACPI] invalid {} at {:#x}",
            core::str::from_utf8(signature).unwrap_or("????"),
            root_phys
        );
        return Vec::new();
    }

    let header = unsafe { &*(root_virt as *const tables::SdtHeader) };
    let length = unsafe { ptr::read_unaligned(ptr::addr_of!(header.length)) } as usize;
    let header_size = core::mem::size_of::<tables::SdtHeader>();
    let count = (length - header_size) / entry_size;

    let mut addrs = Vec::with_capacity(count);
    let entries = root_virt + header_size as u64;
    for i in 0..count {
        let at = entries + (i * entry_size) as u64;
        let addr = if entry_size == 8 {
            unsafe { ptr::read_unaligned(at as *const u64) }
        } else {
            unsafe { ptr::read_unaligned(at as *const u32) as u64 }
        };
        if addr != 0 {
            addrs.push(addr);
        }
    }
    addrs
}
