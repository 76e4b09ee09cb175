//! FADT (Fixed ACPI Description Table) parser
//!
//! Extracts the PM1 control blocks (preferring the extended GAS fields
//! when they name system I/O) and the reset register. Power sequencing
//! itself belongs to a collaborator; discovery stops at the ports.

use super::tables::{GenericAddress, SdtHeader, GAS_SYSTEM_IO};
use core::ptr;

#[repr(C, packed)]
struct Fadt {
    header: SdtHeader,
    firmware_ctrl: u32,
    dsdt: u32,
    _reserved0: u8,
    preferred_pm_profile: u8,
    sci_int: u16,
    smi_cmd: u32,
    acpi_enable: u8,
    acpi_disable: u8,
    s4bios_req: u8,
    pstate_cnt: u8,
    pm1a_evt_blk: u32,
    pm1b_evt_blk: u32,
    pm1a_cnt_blk: u32,
    pm1b_cnt_blk: u32,
    pm2_cnt_blk: u32,
    pm_tmr_blk: u32,
    gpe0_blk: u32,
    gpe1_blk: u32,
    pm1_evt_len: u8,
    pm1_cnt_len: u8,
    pm2_cnt_len: u8,
    pm_tmr_len: u8,
    gpe0_blk_len: u8,
    gpe1_blk_len: u8,
    gpe1_base: u8,
    cst_cnt: u8,
    p_lvl2_lat: u16,
    p_lvl3_lat: u16,
    flush_size: u16,
    flush_stride: u16,
    duty_offset: u8,
    duty_width: u8,
    day_alrm: u8,
    mon_alrm: u8,
    century: u8,
    iapc_boot_arch: u16,
    _reserved1: u8,
    flags: u32,
    reset_reg: GenericAddress,
    reset_value: u8,
    _reserved2: [u8; 3],
    x_firmware_ctrl: u64,
    x_dsdt: u64,
    x_pm1a_evt_blk: GenericAddress,
    x_pm1b_evt_blk: GenericAddress,
    x_pm1a_cnt_blk: GenericAddress,
    x_pm1b_cnt_blk: GenericAddress,
}

/// Parsed power management ports
#[derive(Debug, Clone)]
pub struct FadtInfo {
    pub pm1a_cnt_blk: u16,
    pub pm1b_cnt_blk: u16,
    pub reset_port: u16,
    pub reset_value: u8,
    pub century_reg: u8,
}

/// Parse a mapped FADT
pub fn parse(fadt_virt: u64) -> Option<FadtInfo> {
    let fadt = unsafe { &*(fadt_virt as *const Fadt) };
    let length = unsafe { ptr::read_unaligned(ptr::addr_of!(fadt.header.length)) } as usize;

    let mut pm1a = unsafe { ptr::read_unaligned(ptr::addr_of!(fadt.pm1a_cnt_blk)) } as u16;
    let mut pm1b = unsafe { ptr::read_unaligned(ptr::addr_of!(fadt.pm1b_cnt_blk)) } as u16;

    // ACPI 2.0+ extended blocks win when they name system I/O ports
    if length >= core::mem::size_of::<Fadt>() {
        let xa = unsafe { ptr::read_unaligned(ptr::addr_of!(fadt.x_pm1a_cnt_blk)) };
        if xa.address_space_id == GAS_SYSTEM_IO && xa.address != 0 {
            pm1a = xa.address as u16;
        }
        let xb = unsafe { ptr::read_unaligned(ptr::addr_of!(fadt.x_pm1b_cnt_blk)) };
        if xb.address_space_id == GAS_SYSTEM_IO && xb.address != 0 {
            pm1b = xb.address as u16;
        }
    }

    let reset_reg = unsafe { ptr::read_unaligned(ptr::addr_of!(fadt.reset_reg)) };
    let reset_port = if reset_reg.address_space_id == GAS_SYSTEM_IO {
        reset_reg.address as u16
    } else {
        0
    };

    Some(FadtInfo {
        pm1a_cnt_blk: pm1a,
        pm1b_cnt_blk: pm1b,
        reset_port,
        reset_value: fadt.reset_value,
        century_reg: fadt.century,
    })
}
