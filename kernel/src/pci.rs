//! PCI bus enumeration
//!
//! Recursive depth-first scan over I/O-port configuration space. Bridges
//! without firmware-assigned bus numbers get them from a monotonic
//! counter; rescans carry an epoch so devices that disappeared are
//! dropped while surviving ones keep their identity.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use spin::Mutex;
use x86_64::instructions::port::Port;

const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
const PCI_CONFIG_DATA: u16 = 0xCFC;

const PCI_CMD_IO_SPACE: u16 = 1 << 0;
const PCI_CMD_MEMORY_SPACE: u16 = 1 << 1;
const PCI_CMD_BUS_MASTER: u16 = 1 << 2;

const HEADER_TYPE_PCI_TO_PCI: u8 = 0x01;

/// Device classes the kernel cares about
pub mod class {
    pub const MASS_STORAGE: u8 = 0x01;
    pub const BRIDGE: u8 = 0x06;
}

/// Mass-storage subclasses
pub mod storage {
    pub const IDE: u8 = 0x01;
    pub const ATA: u8 = 0x05;
    pub const SATA: u8 = 0x06;
}

/// BAR flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    Io,
    Mem32,
    Mem64,
}

/// One decoded base address register
#[derive(Debug, Clone, Copy)]
pub struct PciBar {
    /// BAR slot (0..=5)
    pub index: u8,
    pub address: u64,
    pub size: u64,
    pub kind: BarKind,
    pub prefetchable: bool,
}

impl PciBar {
    pub fn is_io(&self) -> bool {
        self.kind == BarKind::Io
    }
}

/// One discovered function
#[derive(Debug, Clone)]
pub struct PciDevice {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub is_bridge: bool,
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
    pub bars: Vec<PciBar>,
    pub last_seen_epoch: u32,
}

static DEVICES: Mutex<Vec<PciDevice>> = Mutex::new(Vec::new());
static EPOCH: AtomicU32 = AtomicU32::new(0);
/// Next bus number handed to an unconfigured bridge during a scan
static NEXT_BUS: AtomicU8 = AtomicU8::new(1);

fn make_address(bus: u8, dev: u8, func: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((dev as u32) << 11)
        | ((func as u32) << 8)
        | (offset as u32 & 0xFC)
}

/// Read a configuration dword
pub fn config_read32(bus: u8, dev: u8, func: u8, offset: u8) -> u32 {
    unsafe {
        Port::<u32>::new(PCI_CONFIG_ADDRESS).write(make_address(bus, dev, func, offset));
        Port::<u32>::new(PCI_CONFIG_DATA).read()
    }
}

/// Write a configuration dword
pub fn config_write32(bus: u8, dev: u8, func: u8, offset: u8, value: u32) {
    unsafe {
        Port::<u32>::new(PCI_CONFIG_ADDRESS).write(make_address(bus, dev, func, offset));
        Port::<u32>::new(PCI_CONFIG_DATA).write(value);
    }
}

pub fn config_read16(bus: u8, dev: u8, func: u8, offset: u8) -> u16 {
    let shift = (offset as u32 & 2) * 8;
    ((config_read32(bus, dev, func, offset) >> shift) & 0xFFFF) as u16
}

pub fn config_read8(bus: u8, dev: u8, func: u8, offset: u8) -> u8 {
    let shift = (offset as u32 & 3) * 8;
    ((config_read32(bus, dev, func, offset) >> shift) & 0xFF) as u8
}

pub fn config_write16(bus: u8, dev: u8, func: u8, offset: u8, value: u16) {
    let aligned = offset & !0x3;
    let shift = (offset as u32 & 2) * 8;
    let mut cur = config_read32(bus, dev, func, aligned);
    cur &= !(0xFFFFu32 << shift);
    cur |= (value as u32) << shift;
    config_write32(bus, dev, func, aligned, cur);
}

pub fn config_write8(bus: u8, dev: u8, func: u8, offset: u8, value: u8) {
    let aligned = offset & !0x3;
    let shift = (offset as u32 & 3) * 8;
    let mut cur = config_read32(bus, dev, func, aligned);
    cur &= !(0xFFu32 << shift);
    cur |= (value as u32) << shift;
    config_write32(bus, dev, func, aligned, cur);
}

/// Classify a raw BAR dword. Returns the kind, prefetch bit, and masked
/// base address bits (without the upper half of a 64-bit BAR).
pub fn decode_bar(raw: u32) -> (BarKind, bool, u64) {
    if raw & 0x1 != 0 {
        (BarKind::Io, false, (raw & !0x3) as u64)
    } else {
        let prefetch = raw & (1 << 3) != 0;
        if (raw >> 1) & 0x3 == 0x2 {
            (BarKind::Mem64, prefetch, (raw & !0xF) as u64)
        } else {
            (BarKind::Mem32, prefetch, (raw & !0xF) as u64)
        }
    }
}

/// Size one BAR by writing all-ones and decoding the readback mask.
/// Decode is disabled around the probe.
fn probe_bar_size(bus: u8, dev: u8, func: u8, bar_offset: u8, kind: BarKind) -> u64 {
    let command = config_read16(bus, dev, func, 0x04);
    config_write16(
        bus,
        dev,
        func,
        0x04,
        command & !(PCI_CMD_IO_SPACE | PCI_CMD_MEMORY_SPACE),
    );

    let original = config_read32(bus, dev, func, bar_offset);
    config_write32(bus, dev, func, bar_offset, 0xFFFF_FFFF);
    let readback = config_read32(bus, dev, func, bar_offset);
    config_write32(bus, dev, func, bar_offset, original);

    let size = match kind {
        BarKind::Io => {
            let mask = readback & !0x3;
            if mask == 0 {
                0
            } else {
                ((!mask).wrapping_add(1) & 0xFFFF) as u64
            }
        }
        BarKind::Mem32 => {
            let mask = readback & !0xF;
            if mask == 0 {
                0
            } else {
                (!mask).wrapping_add(1) as u64
            }
        }
        BarKind::Mem64 => {
            let original_hi = config_read32(bus, dev, func, bar_offset + 4);
            config_write32(bus, dev, func, bar_offset + 4, 0xFFFF_FFFF);
            let readback_hi = config_read32(bus, dev, func, bar_offset + 4);
            config_write32(bus, dev, func, bar_offset + 4, original_hi);

            let full = ((readback_hi as u64) << 32) | (readback & !0xF) as u64;
            if full == 0 {
                0
            } else {
                (!full).wrapping_add(1)
            }
        }
    };

    config_write16(bus, dev, func, 0x04, command);
    size
}

fn parse_bars(dev: &mut PciDevice) {
    dev.bars.clear();
    let max_bars: u8 = if dev.header_type & 0x7F == HEADER_TYPE_PCI_TO_PCI {
        2
    } else {
        6
    };

    let mut i = 0u8;
    while i < max_bars {
        let offset = 0x10 + i * 4;
        let raw = config_read32(dev.bus, dev.device, dev.function, offset);
        if raw == 0 {
            i += 1;
            continue;
        }

        let (kind, prefetchable, low) = decode_bar(raw);
        let mut address = low;
        if kind == BarKind::Mem64 {
            if i + 1 >= max_bars {
                break;
            }
            let high = config_read32(dev.bus, dev.device, dev.function, offset + 4);
            address |= (high as u64) << 32;
        }

        let size = probe_bar_size(dev.bus, dev.device, dev.function, offset, kind);
        dev.bars.push(PciBar {
            index: i,
            address,
            size,
            kind,
            prefetchable,
        });

        // A 64-bit BAR consumes the following slot
        i += if kind == BarKind::Mem64 { 2 } else { 1 };
    }
}

fn enable_bridge_forwarding(bus: u8, dev: u8, func: u8) {
    let command = config_read16(bus, dev, func, 0x04);
    let wanted = command | PCI_CMD_IO_SPACE | PCI_CMD_MEMORY_SPACE | PCI_CMD_BUS_MASTER;
    if wanted != command {
        config_write16(bus, dev, func, 0x04, wanted);
    }
}

fn visit_function(bus: u8, device: u8, function: u8, devices: &mut Vec<PciDevice>) {
    let vendor = config_read16(bus, device, function, 0x00);
    if vendor == 0xFFFF {
        return;
    }

    let epoch = EPOCH.load(Ordering::Relaxed);
    let device_id = config_read16(bus, device, function, 0x02);
    let class_reg = config_read32(bus, device, function, 0x08);
    let header_type = config_read8(bus, device, function, 0x0E);
    let int_reg = config_read32(bus, device, function, 0x3C);

    let index = devices
        .iter()
        .position(|d| d.bus == bus && d.device == device && d.function == function);
    let index = match index {
        Some(i) => i,
        None => {
            devices.push(PciDevice {
                bus,
                device,
                function,
                vendor_id: 0,
                device_id: 0,
                class_code: 0,
                subclass: 0,
                prog_if: 0,
                revision: 0,
                header_type: 0,
                interrupt_line: 0,
                interrupt_pin: 0,
                is_bridge: false,
                secondary_bus: 0,
                subordinate_bus: 0,
                bars: Vec::new(),
                last_seen_epoch: 0,
            });
            devices.len() - 1
        }
    };

    {
        let d = &mut devices[index];
        d.vendor_id = vendor;
        d.device_id = device_id;
        d.revision = (class_reg & 0xFF) as u8;
        d.prog_if = ((class_reg >> 8) & 0xFF) as u8;
        d.subclass = ((class_reg >> 16) & 0xFF) as u8;
        d.class_code = ((class_reg >> 24) & 0xFF) as u8;
        d.header_type = header_type;
        d.interrupt_line = (int_reg & 0xFF) as u8;
        d.interrupt_pin = ((int_reg >> 8) & 0xFF) as u8;
        d.last_seen_epoch = epoch;
        d.is_bridge = header_type & 0x7F == HEADER_TYPE_PCI_TO_PCI;

        if d.is_bridge {
            d.secondary_bus = config_read8(bus, device, function, 0x19);
            d.subordinate_bus = config_read8(bus, device, function, 0x1A);

            enable_bridge_forwarding(bus, device, function);

            // Firmware left the bridge unconfigured: hand it a fresh bus
            if d.secondary_bus == 0 || d.secondary_bus > d.subordinate_bus {
                let new_secondary = NEXT_BUS.fetch_add(1, Ordering::Relaxed);
                config_write8(bus, device, function, 0x18, bus);
                config_write8(bus, device, function, 0x19, new_secondary);
                config_write8(bus, device, function, 0x1A, 0xFF);
                config_write8(bus, device, function, 0x1B, 0x20);
                d.secondary_bus = new_secondary;
                d.subordinate_bus = 0xFF;
            }
        }

        parse_bars(d);
    }

    let (is_bridge, secondary, subordinate) = {
        let d = &devices[index];
        (d.is_bridge, d.secondary_bus, d.subordinate_bus)
    };

    if is_bridge && secondary > 0 && secondary <= subordinate {
        scan_bus(secondary, devices);

        // Tighten the subordinate number to the highest bus handed out.
        // Over-counts with sibling bridges on one bus; fine for chains.
        let last_used = NEXT_BUS.load(Ordering::Relaxed).saturating_sub(1);
        let last_used = last_used.max(secondary);
        if last_used != subordinate {
            config_write8(bus, device, function, 0x1A, last_used);
            if let Some(d) = devices
                .iter_mut()
                .find(|d| d.bus == bus && d.device == device && d.function == function)
            {
                d.subordinate_bus = last_used;
            }
        }
    }
}

fn scan_slot(bus: u8, device: u8, devices: &mut Vec<PciDevice>) {
    let vendor = config_read16(bus, device, 0, 0x00);
    if vendor == 0xFFFF {
        return;
    }
    let header = config_read8(bus, device, 0, 0x0E);
    let functions = if header & 0x80 != 0 { 8 } else { 1 };
    for function in 0..functions {
        visit_function(bus, device, function, devices);
    }
}

fn scan_bus(bus: u8, devices: &mut Vec<PciDevice>) {
    for device in 0..32 {
        scan_slot(bus, device, devices);
    }
}

/// Full (re)scan. Devices not seen this epoch are removed.
pub fn rescan() {
    let epoch = EPOCH.fetch_add(1, Ordering::SeqCst) + 1;
    NEXT_BUS.store(1, Ordering::SeqCst);

    let mut devices = DEVICES.lock();
    scan_bus(0, &mut devices);
    devices.retain(|d| d.last_seen_epoch == epoch);
}

/// Initial scan plus a summary log
pub fn init() {
    rescan();
    let devices = DEVICES.lock();
    crate::log!("[PCI] {} devices:", devices.len());
    for d in devices.iter() {
        crate::log!(
            "[PCI]   {:02x}:{:02x}.{} {:04x}:{:04x} class {:02x}.{:02x}.{:02x}{}",
            d.bus,
            d.device,
            d.function,
            d.vendor_id,
            d.device_id,
            d.class_code,
            d.subclass,
            d.prog_if,
            if d.is_bridge { " (bridge)" } else { "" }
        );
    }
}

/// First device matching class/subclass, optionally prog-if
pub fn find_by_class(class_code: u8, subclass: u8, prog_if: Option<u8>) -> Option<PciDevice> {
    DEVICES
        .lock()
        .iter()
        .find(|d| {
            d.class_code == class_code
                && d.subclass == subclass
                && prog_if.map_or(true, |p| d.prog_if == p)
        })
        .cloned()
}

/// Enable I/O and memory decode
pub fn enable_io_and_memory(dev: &PciDevice) {
    let command = config_read16(dev.bus, dev.device, dev.function, 0x04);
    config_write16(
        dev.bus,
        dev.device,
        dev.function,
        0x04,
        command | PCI_CMD_IO_SPACE | PCI_CMD_MEMORY_SPACE,
    );
}

/// Enable bus mastering (needed before any DMA)
pub fn enable_bus_mastering(dev: &PciDevice) {
    let command = config_read16(dev.bus, dev.device, dev.function, 0x04);
    config_write16(
        dev.bus,
        dev.device,
        dev.function,
        0x04,
        command | PCI_CMD_BUS_MASTER,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_bar_decodes_with_two_bit_mask() {
        let (kind, prefetch, addr) = decode_bar(0x0000_C001);
        assert_eq!(kind, BarKind::Io);
        assert!(!prefetch);
        assert_eq!(addr, 0xC000);
    }

    #[test]
    fn mem32_bar_decodes_with_four_bit_mask() {
        let (kind, prefetch, addr) = decode_bar(0xFEBF_0008);
        assert_eq!(kind, BarKind::Mem32);
        assert!(prefetch);
        assert_eq!(addr, 0xFEBF_0000);
    }

    #[test]
    fn mem64_bar_is_flagged() {
        let (kind, prefetch, addr) = decode_bar(0xE000_000C);
        assert_eq!(kind, BarKind::Mem64);
        assert!(prefetch);
        assert_eq!(addr, 0xE000_0000);
    }

    #[test]
    fn address_dword_layout() {
        let addr = make_address(1, 2, 3, 0x3D);
        assert_eq!(addr, 0x8000_0000 | (1 << 16) | (2 << 11) | (3 << 8) | 0x3C);
    }
}
