//! Ferrite kernel
//!
//! A small x86-64 kernel booted via Limine: hardware discovery (ACPI,
//! PCI), PIC/APIC and PIT/HPET behind uniform abstractions, an AHCI +
//! legacy ATA storage stack, and a VFS with RAM, FAT, NTFS and ISO9660
//! filesystem drivers.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]

extern crate alloc;

mod acpi;
mod apic;
mod block;
mod boot;
mod drivers;
mod gdt;
mod interrupts;
mod logger;
mod memory;
mod pci;
mod sched;
mod serial;
mod time;
mod vfs;
mod volume;

use alloc::format;
use alloc::vec::Vec;
use boot::{BootInfo, FirmwareKind, MemoryRegion};
use interrupts::IrqController;
use limine::request::{
    EfiSystemTableRequest, HhdmRequest, MemoryMapRequest, RequestsEndMarker,
    RequestsStartMarker, RsdpRequest,
};
use limine::BaseRevision;
use time::HardwareTimer;
use vfs::{MountParams, NodeKind, VfsError};

#[used]
#[unsafe(link_section = ".requests_start_marker")]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

/// Protocol handshake; an unsupported revision halts the machine
#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static EFI_SYSTEM_TABLE_REQUEST: EfiSystemTableRequest = EfiSystemTableRequest::new();

#[used]
#[unsafe(link_section = ".requests_end_marker")]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Gather the firmware handoff into the normalized [`BootInfo`] shape.
/// A missing memory map is fatal.
fn collect_boot_info() -> &'static BootInfo {
    let hhdm_offset = HHDM_REQUEST
        .get_response()
        .map(|r| r.offset())
        .unwrap_or(0xFFFF_8000_0000_0000);

    let firmware = if EFI_SYSTEM_TABLE_REQUEST.get_response().is_some() {
        FirmwareKind::Uefi
    } else {
        FirmwareKind::Bios
    };

    let Some(mmap) = MEMORY_MAP_REQUEST.get_response() else {
        serial_println!("[BOOT] FATAL: no memory map from the bootloader");
        boot::halt();
    };

    let raw: Vec<MemoryRegion> = mmap
        .entries()
        .iter()
        .map(|entry| MemoryRegion {
            phys_addr: entry.base,
            length: entry.length,
            kind: boot::memmap::kind_from_boot_entry(entry.entry_type),
        })
        .collect();
    let memory_map = boot::memmap::normalize(&raw);
    if memory_map.is_empty() {
        serial_println!("[BOOT] FATAL: memory map is empty after normalization");
        boot::halt();
    }

    let rsdp_addr = RSDP_REQUEST
        .get_response()
        .map(|r| r.address() as u64)
        .unwrap_or(0);

    boot::set_info(BootInfo {
        firmware,
        memory_map,
        rsdp_addr,
        hhdm_offset,
        cmdline: None,
    })
}

/// Ensure a directory path exists in the VFS
fn ensure_directory(path: &str) -> bool {
    match vfs::create(path, NodeKind::Directory) {
        Ok(()) | Err(VfsError::Exists) => true,
        Err(e) => {
            log_warn!("[BOOT] mkdir '{}' failed: {:?}", path, e);
            false
        }
    }
}

/// Auto-mount every whole block device under /dev/blkN
fn mount_block_devices() {
    ensure_directory("/dev");

    for i in 0..block::count() {
        let Some(device) = block::get_at(i) else {
            continue;
        };
        let mount_path = format!("/dev/blk{}", i);
        if !ensure_directory(&mount_path) {
            continue;
        }
        let params = MountParams::for_device(device.clone());
        match vfs::mount_auto(&mount_path, &params) {
            Ok(_) => log!("[BOOT] device '{}' mounted at {}", device.name, mount_path),
            Err(_) => log!(
                "[BOOT] no filesystem detected on device '{}' ({})",
                device.name,
                mount_path
            ),
        }
    }
}

/// Auto-mount volumes under /mnt/sdN and /mnt/cdN
fn mount_volumes() {
    let mut disk_index = 0usize;
    let mut cd_index = 0usize;

    for i in 0..volume::count() {
        let Some(vol) = volume::get_at(i) else {
            continue;
        };

        let mount_path = if vol.is_cdrom() {
            let p = format!("/mnt/cd{}", cd_index);
            cd_index += 1;
            p
        } else {
            let p = format!("/mnt/sd{}", disk_index);
            disk_index += 1;
            p
        };

        if !ensure_directory(&mount_path) {
            continue;
        }

        let params = MountParams::for_volume(vol.clone());
        match vfs::mount_auto(&mount_path, &params) {
            Ok(_) => log!("[BOOT] volume '{}' mounted at {}", vol.name, mount_path),
            Err(_) => log!(
                "[BOOT] no filesystem matched volume '{}' ({})",
                vol.name,
                mount_path
            ),
        }
    }
}

/// Bring up the VFS: RAMFS at /, filesystem drivers, device mounts
fn init_vfs() {
    vfs::cache_set_capacity(128);

    let _ = vfs::register_filesystem(vfs::ramfs::RamFs::new());
    let _ = vfs::register_filesystem(vfs::fat::FatFs::new());
    let _ = vfs::register_filesystem(vfs::ntfs::NtfsFs::new());
    let _ = vfs::register_filesystem(vfs::iso9660::IsoFs::new());

    if let Some(ramfs) = vfs::get_filesystem("ramfs") {
        match vfs::mount("/", ramfs, &MountParams::empty()) {
            Ok(_) => log!("[BOOT] root filesystem mounted (ramfs)"),
            Err(e) => log_error!("[BOOT] root mount failed: {:?}", e),
        }
    }

    if vfs::get_mount("/").is_none() {
        log_warn!("[BOOT] no root filesystem, skipping device mounts");
        return;
    }

    // No storage, no mount tree
    if block::count() == 0 {
        return;
    }

    if ensure_directory("/mnt") {
        mount_block_devices();
        mount_volumes();
    }
}

#[no_mangle]
pub unsafe extern "C" fn kmain() -> ! {
    if !BASE_REVISION.is_supported() {
        boot::halt();
    }

    serial::init();
    serial_println!("Ferrite kernel v{}", env!("CARGO_PKG_VERSION"));

    // Firmware handoff and heap before anything that allocates.
    // collect_boot_info allocates, so give the allocator a provisional
    // region derived from the raw response first.
    let hhdm = HHDM_REQUEST
        .get_response()
        .map(|r| r.offset())
        .unwrap_or(0xFFFF_8000_0000_0000);
    let heap_phys = {
        let Some(mmap) = MEMORY_MAP_REQUEST.get_response() else {
            serial_println!("[BOOT] FATAL: no memory map from the bootloader");
            boot::halt();
        };
        let mut found = None;
        for entry in mmap.entries() {
            if entry.entry_type != limine::memory_map::EntryType::USABLE {
                continue;
            }
            let start = entry.base.max(0x10_0000);
            if entry.base + entry.length >= start + memory::HEAP_SIZE as u64 {
                found = Some((start + 0xFFF) & !0xFFF);
                break;
            }
        }
        match found {
            Some(base) => base,
            None => {
                serial_println!("[BOOT] FATAL: no usable region fits the heap");
                boot::halt();
            }
        }
    };
    memory::init(hhdm, heap_phys, memory::HEAP_SIZE);

    let info = collect_boot_info();
    log!(
        "[BOOT] firmware: {:?}, {} memory regions ({} MB available), rsdp={:#x}",
        info.firmware,
        info.memory_map.len(),
        boot::memmap::total_of_kind(&info.memory_map, boot::MemoryKind::Available)
            / (1024 * 1024),
        info.rsdp_addr
    );
    for region in &info.memory_map {
        log_debug!(
            "[BOOT]   {:#012x}+{:#x} {}",
            region.phys_addr,
            region.length,
            region.kind.as_str()
        );
    }
    // The verbose part of boot is over
    logger::set_min_level(logger::LogLevel::Info);

    gdt::init();
    interrupts::init();

    // ACPI feeds interrupt routing, timers and the console
    let have_acpi = acpi::init(info.rsdp_addr);
    if let Some(spcr) = acpi::get_info().and_then(|i| i.spcr.as_ref()) {
        serial::set_base(spcr.io_port);
    }

    // Interrupt controller: APIC when the CPU and MADT cooperate, else PIC
    let controller: &'static dyn interrupts::IrqController =
        if have_acpi && apic::supported() && apic::APIC.init() {
            &apic::APIC
        } else {
            log!("[BOOT] falling back to the legacy PIC");
            interrupts::pic::PIC.init();
            &interrupts::pic::PIC
        };
    interrupts::set_controller(controller);
    log!("[BOOT] interrupt controller: {}", controller.name());

    // System tick: HPET when usable, PIT otherwise
    let timer = time::init();
    if !timer.start() {
        log_warn!("[BOOT] {} failed to start, trying the PIT", timer.name());
        time::pit::PIT.set_frequency(time::TICK_HZ);
        time::pit::PIT.add_callback(time::uptime_tick);
        time::pit::PIT.start();
    }

    x86_64::instructions::interrupts::enable();
    log!("[BOOT] interrupts enabled, tick at {} Hz", time::TICK_HZ);

    sched::init();

    // Bus scan, then storage
    pci::init();
    drivers::register_and_enable(&drivers::ahci::AHCI);
    drivers::register_and_enable(&drivers::ata::ATA);

    volume::rebuild();
    init_vfs();

    if sched::spawn("flush", flush_task).is_none() {
        log_warn!("[BOOT] could not start the flush thread");
    }

    let cache = vfs::cache_stats();
    log!(
        "[BOOT] up: {} block devices, {} volumes, vfs cache {}/{} entries, uptime {} ms",
        block::count(),
        volume::count(),
        cache.entries,
        cache.capacity,
        time::uptime_ms()
    );

    loop {
        sched::task_yield();
        x86_64::instructions::hlt();
    }
}

/// Background maintenance: push write-back caches out periodically
fn flush_task() {
    loop {
        sched::task_sleep_ms(2000);
        for i in 0..block::count() {
            if let Some(device) = block::get_at(i) {
                if !device.flush() {
                    log_warn!("[FLUSH] device '{}' flush failed", device.name);
                }
            }
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("KERNEL PANIC: {}", info);
    boot::halt();
}
