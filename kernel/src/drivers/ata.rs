//! Legacy ATA/ATAPI driver
//!
//! Probes the two IDE channels reported by the PCI IDE controller.
//! Disks move data over Bus Master IDE DMA when BAR4 exposes an engine,
//! with PIO (28- and 48-bit) as the fallback; ATAPI drives use PACKET
//! commands over PIO. In compatibility mode IRQ14/IRQ15 latch per-channel
//! event flags that the polling loops honor.

use crate::block::{self, BlockDeviceOps, BlockDeviceType};
use crate::drivers::Driver;
use crate::interrupts::handlers::IrqEvent;
use crate::pci;
use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use spin::Mutex;
use x86_64::instructions::port::Port;

// Task file register offsets from the command block base
const REG_DATA: u16 = 0;
const REG_FEATURES: u16 = 1;
const REG_SECCOUNT: u16 = 2;
const REG_LBA0: u16 = 3;
const REG_LBA1: u16 = 4;
const REG_LBA2: u16 = 5;
const REG_DRIVE: u16 = 6;
const REG_COMMAND: u16 = 7;
const REG_STATUS: u16 = 7;

// Status bits
const SR_ERR: u8 = 1 << 0;
const SR_DRQ: u8 = 1 << 3;
const SR_DF: u8 = 1 << 5;
const SR_BSY: u8 = 1 << 7;

// Device control bits (at the control block base)
const DEVCTRL_NIEN: u8 = 1 << 1;
const DEVCTRL_SRST: u8 = 1 << 2;

// Commands
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_READ_SECTORS_EXT: u8 = 0x24;
const CMD_READ_DMA: u8 = 0xC8;
const CMD_READ_DMA_EXT: u8 = 0x25;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_WRITE_SECTORS_EXT: u8 = 0x34;
const CMD_WRITE_DMA: u8 = 0xCA;
const CMD_WRITE_DMA_EXT: u8 = 0x35;
const CMD_PACKET: u8 = 0xA0;
const CMD_IDENTIFY: u8 = 0xEC;
const CMD_IDENTIFY_PACKET: u8 = 0xA1;
const CMD_FLUSH_CACHE: u8 = 0xE7;
const CMD_FLUSH_CACHE_EXT: u8 = 0xEA;

const ATAPI_CMD_REQUEST_SENSE: u8 = 0x03;
const ATAPI_CMD_READ_CAPACITY10: u8 = 0x25;
const ATAPI_CMD_READ10: u8 = 0x28;
const ATAPI_CMD_READ12: u8 = 0xA8;

// ATAPI signature in LBA1/LBA2 after reset
const SIG_ATAPI_LBA1: u8 = 0x14;
const SIG_ATAPI_LBA2: u8 = 0xEB;

// Compatibility-mode port bases
const PRIMARY_IO: u16 = 0x1F0;
const PRIMARY_CTRL: u16 = 0x3F6;
const SECONDARY_IO: u16 = 0x170;
const SECONDARY_CTRL: u16 = 0x376;

// Bus Master IDE register offsets per channel
const BM_REG_CMD: u16 = 0x00;
const BM_REG_STATUS: u16 = 0x02;
const BM_REG_PRDT: u16 = 0x04;
const BM_CHANNEL_SPAN: u16 = 0x08;

const BM_CMD_START: u8 = 1 << 0;
const BM_CMD_WRITE: u8 = 1 << 3;
const BM_ST_ERR: u8 = 1 << 1;
const BM_ST_IRQ: u8 = 1 << 2;

const BUSY_SPIN: u32 = 1_000_000;
const DMA_SPIN: u32 = 5_000_000;
const MAX_ATAPI_BLOCKS: u32 = 16;

/// PRD entry: physical base, byte count (0 = 64 KiB), EOT flag word
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrdEntry {
    pub base: u32,
    pub byte_count: u16,
    pub flags: u16,
}

const PRD_EOT: u16 = 0x8000;
const PRD_MAX_ENTRIES: usize = 4;

/// PRD table, 16-byte aligned for the BMIDE engine
#[repr(C, align(16))]
struct PrdTable {
    entries: [PrdEntry; PRD_MAX_ENTRIES],
}

/// Split a physical span into PRD entries that never cross a 64 KiB
/// boundary. Returns the number of entries and bytes covered; the final
/// entry carries the EOT flag.
pub fn build_prd_entries(
    phys: u64,
    bytes: u32,
    entries: &mut [PrdEntry; PRD_MAX_ENTRIES],
) -> (usize, u32) {
    let mut built = 0u32;
    let mut remaining = bytes;
    let mut addr = phys;
    let mut used = 0usize;

    while remaining > 0 && used < PRD_MAX_ENTRIES {
        let offset_in_64k = (addr & 0xFFFF) as u32;
        let space = 0x1_0000 - offset_in_64k;
        let chunk = remaining.min(space);

        entries[used] = PrdEntry {
            base: addr as u32,
            byte_count: (chunk & 0xFFFF) as u16,
            flags: 0,
        };
        built += chunk;
        remaining -= chunk;
        addr += chunk as u64;
        used += 1;
    }

    if used > 0 {
        entries[used - 1].flags |= PRD_EOT;
    }
    (used, built)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AtaDeviceType {
    Ata,
    Atapi,
}

/// One probed drive
struct AtaDevice {
    channel: usize,
    drive: u8,
    device_type: AtaDeviceType,
    lba48: bool,
    sector_size: u32,
    total_sectors: u64,
    block_size: u32,
}

/// One IDE channel's port assignment
struct AtaChannel {
    io_base: u16,
    ctrl_base: u16,
    /// 14/15 in compatibility mode, 0xFF when running native/polled
    irq_compat: u8,
    /// BMIDE register base, 0 when DMA is unavailable
    bm_base: u16,
    prdt: Option<Box<PrdTable>>,
}

static CHANNELS: Mutex<[AtaChannel; 2]> = Mutex::new([
    AtaChannel {
        io_base: PRIMARY_IO,
        ctrl_base: PRIMARY_CTRL,
        irq_compat: 14,
        bm_base: 0,
        prdt: None,
    },
    AtaChannel {
        io_base: SECONDARY_IO,
        ctrl_base: SECONDARY_CTRL,
        irq_compat: 15,
        bm_base: 0,
        prdt: None,
    },
]);

static DEVICES: Mutex<[Option<AtaDevice>; 4]> = Mutex::new([None, None, None, None]);

/// Per-channel IRQ event latches (primary, secondary)
static IRQ_EVENTS: [IrqEvent; 2] = [IrqEvent::new(), IrqEvent::new()];

fn inb(port: u16) -> u8 {
    unsafe { Port::<u8>::new(port).read() }
}

fn outb(port: u16, value: u8) {
    unsafe { Port::<u8>::new(port).write(value) }
}

fn inw(port: u16) -> u16 {
    unsafe { Port::<u16>::new(port).read() }
}

fn outw(port: u16, value: u16) {
    unsafe { Port::<u16>::new(port).write(value) }
}

fn outl(port: u16, value: u32) {
    unsafe { Port::<u32>::new(port).write(value) }
}

/// 400 ns settle: four reads of the alternate status port
fn delay_400ns(ctrl_base: u16) {
    for _ in 0..4 {
        let _ = inb(ctrl_base);
    }
}

fn channel_index(io_base: u16) -> Option<usize> {
    match io_base {
        PRIMARY_IO => Some(0),
        SECONDARY_IO => Some(1),
        _ => None,
    }
}

/// Assert SRST, release it, and let the channel settle
fn soft_reset(ctrl_base: u16) {
    outb(ctrl_base, DEVCTRL_SRST | DEVCTRL_NIEN);
    delay_400ns(ctrl_base);
    for _ in 0..100_000 {
        let _ = inb(ctrl_base);
    }
    outb(ctrl_base, 0x00);
    for _ in 0..100_000 {
        let _ = inb(ctrl_base);
    }
}

fn wait_not_busy(io_base: u16, mut spin: u32) -> bool {
    loop {
        let status = inb(io_base + REG_STATUS);
        if status & SR_BSY == 0 {
            return true;
        }
        if spin == 0 {
            return false;
        }
        spin -= 1;
        core::hint::spin_loop();
    }
}

/// Wait for DRQ, honoring a latched channel IRQ event so the loop is not
/// a pure busy spin when interrupts are delivering.
fn wait_drq(io_base: u16, mut spin: u32) -> bool {
    let channel = channel_index(io_base);
    loop {
        let status = inb(io_base + REG_STATUS);
        if status & (SR_ERR | SR_DF) != 0 {
            return false;
        }
        if status & SR_DRQ != 0 {
            return true;
        }
        if let Some(ch) = channel {
            if IRQ_EVENTS[ch].take() {
                let status = inb(io_base + REG_STATUS);
                if status & SR_DRQ != 0 {
                    return true;
                }
            }
        }
        if spin == 0 {
            return false;
        }
        spin -= 1;
        core::hint::spin_loop();
    }
}

/// IRQ14: primary channel event. Reading status acknowledges the drive.
fn irq14_handler() {
    let _ = inb(PRIMARY_IO + REG_STATUS);
    IRQ_EVENTS[0].signal();
    if let Some(c) = crate::interrupts::controller() {
        c.ack(14);
    }
}

/// IRQ15: secondary channel event
fn irq15_handler() {
    let _ = inb(SECONDARY_IO + REG_STATUS);
    IRQ_EVENTS[1].signal();
    if let Some(c) = crate::interrupts::controller() {
        c.ack(15);
    }
}

/// Resolve channel bases from the PCI IDE controller's prog-if. Native
/// channels take their BARs and run polled; BAR4 is the BMIDE engine.
fn setup_channels_from_pci() {
    let Some(ide) = pci::find_by_class(pci::class::MASS_STORAGE, pci::storage::IDE, None) else {
        return; // compatibility-mode defaults stand
    };

    pci::enable_io_and_memory(&ide);
    pci::enable_bus_mastering(&ide);

    let mut channels = CHANNELS.lock();

    let bar = |index: u8| ide.bars.iter().find(|b| b.index == index && b.is_io());

    if ide.prog_if & 0x01 != 0 {
        if let (Some(cmd), Some(ctrl)) = (bar(0), bar(1)) {
            channels[0].io_base = cmd.address as u16;
            channels[0].ctrl_base = ctrl.address as u16;
            channels[0].irq_compat = 0xFF;
            crate::log!(
                "[ATA] primary channel native io={:#x} ctrl={:#x}",
                channels[0].io_base,
                channels[0].ctrl_base
            );
        }
    }
    if ide.prog_if & 0x04 != 0 {
        if let (Some(cmd), Some(ctrl)) = (bar(2), bar(3)) {
            channels[1].io_base = cmd.address as u16;
            channels[1].ctrl_base = ctrl.address as u16;
            channels[1].irq_compat = 0xFF;
            crate::log!(
                "[ATA] secondary channel native io={:#x} ctrl={:#x}",
                channels[1].io_base,
                channels[1].ctrl_base
            );
        }
    }

    if let Some(bm) = bar(4) {
        let base = bm.address as u16;
        channels[0].bm_base = base;
        channels[1].bm_base = base + BM_CHANNEL_SPAN;
        channels[0].prdt = Some(Box::new(PrdTable {
            entries: [PrdEntry {
                base: 0,
                byte_count: 0,
                flags: 0,
            }; PRD_MAX_ENTRIES],
        }));
        channels[1].prdt = Some(Box::new(PrdTable {
            entries: [PrdEntry {
                base: 0,
                byte_count: 0,
                flags: 0,
            }; PRD_MAX_ENTRIES],
        }));
        crate::log!("[ATA] BMIDE at {:#x}", base);
    } else {
        crate::log!("[ATA] no BMIDE (BAR4), PIO only");
    }
}

/// IDENTIFY [PACKET] DEVICE. Detects ATAPI drives by the reset signature
/// and fills geometry for disks.
fn identify_drive(channel: usize, drive: u8) -> Option<AtaDevice> {
    let (io, ctrl) = {
        let channels = CHANNELS.lock();
        (channels[channel].io_base, channels[channel].ctrl_base)
    };

    outb(io + REG_DRIVE, 0xA0 | (drive << 4));
    delay_400ns(ctrl);

    let status = inb(io + REG_STATUS);
    if status == 0xFF {
        return None; // floating bus
    }

    if !wait_not_busy(io, BUSY_SPIN) {
        return None;
    }

    let lba1 = inb(io + REG_LBA1);
    let lba2 = inb(io + REG_LBA2);
    let device_type = if lba1 == SIG_ATAPI_LBA1 && lba2 == SIG_ATAPI_LBA2 {
        outb(io + REG_COMMAND, CMD_IDENTIFY_PACKET);
        AtaDeviceType::Atapi
    } else {
        outb(io + REG_COMMAND, CMD_IDENTIFY);
        AtaDeviceType::Ata
    };

    let status = inb(io + REG_STATUS);
    if status == 0 {
        return None;
    }
    if !wait_not_busy(io, BUSY_SPIN) || !wait_drq(io, BUSY_SPIN) {
        return None;
    }

    let mut words = [0u16; 256];
    for word in words.iter_mut() {
        *word = inw(io + REG_DATA);
    }

    let mut device = AtaDevice {
        channel,
        drive,
        device_type,
        lba48: false,
        sector_size: 512,
        total_sectors: 0,
        block_size: 512,
    };

    if device_type == AtaDeviceType::Ata {
        if words[106] & (1 << 12) != 0 {
            let size = ((words[118] as u32) << 16) | words[117] as u32;
            if size >= 512 && size % 512 == 0 {
                device.sector_size = size;
            }
        }
        device.lba48 = words[83] & (1 << 10) != 0;
        let lba28 = ((words[61] as u64) << 16) | words[60] as u64;
        device.total_sectors = if device.lba48 {
            ((words[103] as u64) << 48)
                | ((words[102] as u64) << 32)
                | ((words[101] as u64) << 16)
                | words[100] as u64
        } else {
            lba28
        };
        device.block_size = device.sector_size;
    }

    Some(device)
}

/// Program the task file for a 28-bit LBA transfer
fn setup_lba28(io: u16, ctrl: u16, drive: u8, lba: u32, count: u8) {
    outb(
        io + REG_DRIVE,
        0xE0 | (drive << 4) | ((lba >> 24) as u8 & 0x0F),
    );
    delay_400ns(ctrl);
    outb(io + REG_SECCOUNT, count);
    outb(io + REG_LBA0, lba as u8);
    outb(io + REG_LBA1, (lba >> 8) as u8);
    outb(io + REG_LBA2, (lba >> 16) as u8);
}

/// Program the task file for a 48-bit LBA transfer: high bytes first
fn setup_lba48(io: u16, ctrl: u16, drive: u8, lba: u64, count: u16) {
    outb(io + REG_DRIVE, 0xE0 | (drive << 4));
    delay_400ns(ctrl);
    outb(io + REG_SECCOUNT, (count >> 8) as u8);
    outb(io + REG_LBA0, (lba >> 24) as u8);
    outb(io + REG_LBA1, (lba >> 32) as u8);
    outb(io + REG_LBA2, (lba >> 40) as u8);
    outb(io + REG_SECCOUNT, count as u8);
    outb(io + REG_LBA0, lba as u8);
    outb(io + REG_LBA1, (lba >> 8) as u8);
    outb(io + REG_LBA2, (lba >> 16) as u8);
}

/// PIO sector loop shared by read and write
fn pio_transfer(io: u16, sectors: u32, buffer: &mut [u8], write: bool) -> bool {
    let mut offset = 0usize;
    for _ in 0..sectors {
        if !wait_not_busy(io, BUSY_SPIN) || !wait_drq(io, BUSY_SPIN) {
            return false;
        }
        for _ in 0..256 {
            if write {
                let word = u16::from_le_bytes([buffer[offset], buffer[offset + 1]]);
                outw(io + REG_DATA, word);
            } else {
                let word = inw(io + REG_DATA);
                buffer[offset..offset + 2].copy_from_slice(&word.to_le_bytes());
            }
            offset += 2;
        }
    }
    true
}

fn pio_rw(device: &AtaDevice, lba: u64, count: u32, buffer: &mut [u8], write: bool) -> bool {
    let (io, ctrl) = {
        let channels = CHANNELS.lock();
        (
            channels[device.channel].io_base,
            channels[device.channel].ctrl_base,
        )
    };

    if device.lba48 {
        setup_lba48(io, ctrl, device.drive, lba, count as u16);
        outb(
            io + REG_COMMAND,
            if write {
                CMD_WRITE_SECTORS_EXT
            } else {
                CMD_READ_SECTORS_EXT
            },
        );
    } else {
        setup_lba28(io, ctrl, device.drive, lba as u32, count as u8);
        outb(
            io + REG_COMMAND,
            if write { CMD_WRITE_SECTORS } else { CMD_READ_SECTORS },
        );
    }

    pio_transfer(io, count, buffer, write)
}

/// One Bus Master IDE DMA transfer
fn dma_rw(device: &AtaDevice, lba: u64, sectors: u16, buffer: &mut [u8], write: bool) -> bool {
    let mut channels = CHANNELS.lock();
    let channel = &mut channels[device.channel];
    if channel.bm_base == 0 {
        return false;
    }
    let Some(prdt) = channel.prdt.as_mut() else {
        return false;
    };

    let bytes = sectors as u32 * 512;
    let buf_phys = crate::memory::virt_to_phys(buffer.as_mut_ptr() as u64);
    let (_, built) = build_prd_entries(buf_phys, bytes, &mut prdt.entries);
    if built != bytes {
        return false;
    }

    let io = channel.io_base;
    let ctrl = channel.ctrl_base;
    let bm = channel.bm_base;
    let prdt_phys = crate::memory::virt_to_phys(&prdt.entries as *const _ as u64);

    // Engine setup: PRDT base, then write-one-to-clear the status bits
    outl(bm + BM_REG_PRDT, prdt_phys as u32);
    let status = inb(bm + BM_REG_STATUS);
    outb(bm + BM_REG_STATUS, status | BM_ST_IRQ | BM_ST_ERR);

    if device.lba48 {
        setup_lba48(io, ctrl, device.drive, lba, sectors);
    } else {
        setup_lba28(io, ctrl, device.drive, lba as u32, sectors as u8);
    }

    let mut cmd = inb(bm + BM_REG_CMD);
    cmd &= !BM_CMD_WRITE;
    if write {
        cmd |= BM_CMD_WRITE;
    }
    outb(bm + BM_REG_CMD, cmd);
    outb(bm + BM_REG_CMD, cmd | BM_CMD_START);

    outb(
        io + REG_COMMAND,
        match (device.lba48, write) {
            (true, false) => CMD_READ_DMA_EXT,
            (true, true) => CMD_WRITE_DMA_EXT,
            (false, false) => CMD_READ_DMA,
            (false, true) => CMD_WRITE_DMA,
        },
    );

    let mut ok = false;
    let mut spin = DMA_SPIN;
    while spin > 0 {
        let status = inb(bm + BM_REG_STATUS);
        if status & BM_ST_ERR != 0 {
            break;
        }
        if status & BM_ST_IRQ != 0 {
            ok = true;
            break;
        }
        spin -= 1;
        core::hint::spin_loop();
    }

    // Stop the engine and clear latched status
    let cmd = inb(bm + BM_REG_CMD);
    outb(bm + BM_REG_CMD, cmd & !BM_CMD_START);
    let status = inb(bm + BM_REG_STATUS);
    outb(bm + BM_REG_STATUS, status | BM_ST_IRQ | BM_ST_ERR);

    let device_status = inb(io + REG_STATUS);
    if device_status & (SR_ERR | SR_DF) != 0 {
        ok = false;
    }
    ok
}

/// ATAPI PACKET with a chunked PIO data phase. Each interrupt reports the
/// chunk size in LBA1/LBA2; zero means 65536 words.
fn atapi_packet(
    device: &AtaDevice,
    cdb: &[u8],
    buffer: &mut [u8],
    byte_count: u32,
    write: bool,
) -> bool {
    if device.device_type != AtaDeviceType::Atapi {
        return false;
    }
    let (io, ctrl) = {
        let channels = CHANNELS.lock();
        (
            channels[device.channel].io_base,
            channels[device.channel].ctrl_base,
        )
    };

    outb(io + REG_DRIVE, 0xA0 | (device.drive << 4));
    delay_400ns(ctrl);

    // Byte count in LBA1/LBA2, clamped; devices read 0 as 65536
    let clamped = if byte_count == 0 || byte_count > 0xFFFF {
        0xFFFFu32
    } else {
        byte_count
    };
    outb(io + REG_FEATURES, 0x00);
    outb(io + REG_LBA1, clamped as u8);
    outb(io + REG_LBA2, (clamped >> 8) as u8);

    outb(io + REG_COMMAND, CMD_PACKET);

    if !wait_not_busy(io, BUSY_SPIN) || !wait_drq(io, 2 * BUSY_SPIN) {
        return false;
    }

    // CDB goes through the data port as words
    let cdb_words = (cdb.len() + 1) / 2;
    for i in 0..cdb_words {
        let lo = cdb[i * 2] as u16;
        let hi = if i * 2 + 1 < cdb.len() {
            (cdb[i * 2 + 1] as u16) << 8
        } else {
            0
        };
        outw(io + REG_DATA, lo | hi);
    }

    // Variable-length data phase
    let mut offset = 0usize;
    let mut remaining = byte_count as usize;
    while remaining > 0 {
        if !wait_not_busy(io, BUSY_SPIN) {
            return false;
        }
        let status = inb(io + REG_STATUS);
        if status & (SR_ERR | SR_DF) != 0 {
            return false;
        }
        if status & SR_DRQ == 0 {
            break; // device finished with a shorter transfer
        }

        let words_lo = inb(io + REG_LBA1) as u32;
        let words_hi = inb(io + REG_LBA2) as u32;
        let mut words = words_lo | (words_hi << 8);
        if words == 0 {
            words = 0x1_0000;
        }
        let mut bytes = (words * 2) as usize;
        if bytes > remaining {
            bytes = remaining;
        }

        for i in 0..bytes / 2 {
            if write {
                let word =
                    u16::from_le_bytes([buffer[offset + i * 2], buffer[offset + i * 2 + 1]]);
                outw(io + REG_DATA, word);
            } else {
                let word = inw(io + REG_DATA);
                buffer[offset + i * 2..offset + i * 2 + 2]
                    .copy_from_slice(&word.to_le_bytes());
            }
        }
        offset += bytes;
        remaining -= bytes;
    }

    if !wait_not_busy(io, BUSY_SPIN) {
        return false;
    }
    inb(io + REG_STATUS) & (SR_ERR | SR_DF) == 0
}

fn atapi_request_sense(device: &AtaDevice) {
    let mut sense = [0u8; 18];
    let mut cdb = [0u8; 12];
    cdb[0] = ATAPI_CMD_REQUEST_SENSE;
    cdb[4] = sense.len() as u8;
    let sense_len = sense.len() as u32;
    if atapi_packet(device, &cdb, &mut sense, sense_len, false) {
        crate::log!(
            "[ATAPI] sense: key={:#x} asc={:#x} ascq={:#x}",
            sense[2] & 0x0F,
            sense[12],
            sense[13]
        );
    } else {
        crate::log_warn!("[ATAPI] REQUEST SENSE failed");
    }
}

fn atapi_read_capacity(device: &AtaDevice) -> Option<(u32, u32)> {
    let mut cap = [0u8; 8];
    let mut cdb = [0u8; 12];
    cdb[0] = ATAPI_CMD_READ_CAPACITY10;
    let cap_len = cap.len() as u32;
    if !atapi_packet(device, &cdb, &mut cap, cap_len, false) {
        return None;
    }
    let last_lba = u32::from_be_bytes([cap[0], cap[1], cap[2], cap[3]]);
    let block_len = u32::from_be_bytes([cap[4], cap[5], cap[6], cap[7]]);
    Some((last_lba, block_len))
}

/// READ(10) with a READ(12) fallback and a sense fetch on failure
fn atapi_read_blocks(device: &AtaDevice, lba: u32, blocks: u32, buffer: &mut [u8]) -> bool {
    if blocks == 0 {
        return true;
    }
    let byte_count = blocks * device.block_size;

    let mut cdb = [0u8; 12];
    cdb[0] = ATAPI_CMD_READ10;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7] = (blocks >> 8) as u8;
    cdb[8] = blocks as u8;
    if atapi_packet(device, &cdb, buffer, byte_count, false) {
        return true;
    }

    let mut cdb = [0u8; 12];
    cdb[0] = ATAPI_CMD_READ12;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[6] = (blocks >> 16) as u8;
    cdb[7] = (blocks >> 8) as u8;
    cdb[8] = blocks as u8;
    if atapi_packet(device, &cdb, buffer, byte_count, false) {
        return true;
    }

    atapi_request_sense(device);
    false
}

/// Block device face over one probed drive slot
struct AtaBlockDevice {
    index: usize,
}

impl AtaBlockDevice {
    fn with_device<R>(&self, f: impl FnOnce(&AtaDevice) -> R) -> Option<R> {
        let devices = DEVICES.lock();
        devices[self.index].as_ref().map(f)
    }
}

impl BlockDeviceOps for AtaBlockDevice {
    fn read(&self, lba: u64, count: u32, buffer: &mut [u8]) -> bool {
        self.with_device(|device| match device.device_type {
            AtaDeviceType::Ata => {
                // The transfer loops move 512-byte sectors
                if device.sector_size != 512 {
                    return false;
                }
                if lba >> 28 != 0 && !device.lba48 {
                    return false;
                }
                let mut lba = lba;
                let mut remaining = count;
                let mut offset = 0usize;
                while remaining > 0 {
                    let max = if device.lba48 { 65535 } else { 255 };
                    let n = remaining.min(max);
                    let chunk = &mut buffer[offset..offset + n as usize * 512];
                    let done = dma_rw(device, lba, n as u16, chunk, false)
                        || pio_rw(device, lba, n, chunk, false);
                    if !done {
                        return false;
                    }
                    lba += n as u64;
                    offset += n as usize * 512;
                    remaining -= n;
                }
                true
            }
            AtaDeviceType::Atapi => {
                let mut lba = lba as u32;
                let mut remaining = count;
                let mut offset = 0usize;
                let block = device.block_size as usize;
                while remaining > 0 {
                    let n = remaining.min(MAX_ATAPI_BLOCKS);
                    let chunk = &mut buffer[offset..offset + n as usize * block];
                    if !atapi_read_blocks(device, lba, n, chunk) {
                        return false;
                    }
                    lba += n;
                    offset += n as usize * block;
                    remaining -= n;
                }
                true
            }
        })
        .unwrap_or(false)
    }

    fn write(&self, lba: u64, count: u32, buffer: &[u8]) -> bool {
        self.with_device(|device| {
            if device.device_type != AtaDeviceType::Ata {
                return false;
            }
            if device.sector_size != 512 {
                return false;
            }
            if lba >> 28 != 0 && !device.lba48 {
                return false;
            }
            let mut lba = lba;
            let mut remaining = count;
            let mut offset = 0usize;
            while remaining > 0 {
                let max = if device.lba48 { 65535 } else { 255 };
                let n = remaining.min(max);
                // The PIO path shares the transfer loop, which wants a
                // mutable view; copy the chunk into a scratch buffer.
                let mut chunk = buffer[offset..offset + n as usize * 512].to_vec();
                let done = dma_rw(device, lba, n as u16, &mut chunk, true)
                    || pio_rw(device, lba, n, &mut chunk, true);
                if !done {
                    return false;
                }
                lba += n as u64;
                offset += n as usize * 512;
                remaining -= n;
            }
            true
        })
        .unwrap_or(false)
    }

    fn flush(&self) -> bool {
        self.with_device(|device| {
            if device.device_type != AtaDeviceType::Ata {
                return true; // nothing to flush on optical media
            }
            let (io, ctrl) = {
                let channels = CHANNELS.lock();
                (
                    channels[device.channel].io_base,
                    channels[device.channel].ctrl_base,
                )
            };
            outb(io + REG_DRIVE, 0xE0 | (device.drive << 4));
            delay_400ns(ctrl);
            outb(
                io + REG_COMMAND,
                if device.lba48 {
                    CMD_FLUSH_CACHE_EXT
                } else {
                    CMD_FLUSH_CACHE
                },
            );
            if !wait_not_busy(io, 2 * BUSY_SPIN) {
                return false;
            }
            inb(io + REG_STATUS) & (SR_ERR | SR_DF) == 0
        })
        .unwrap_or(false)
    }
}

fn probe_and_register() -> bool {
    // A PCI IDE or ATA function must exist before legacy ports are poked
    let ide = pci::find_by_class(pci::class::MASS_STORAGE, pci::storage::IDE, None);
    let ata = pci::find_by_class(pci::class::MASS_STORAGE, pci::storage::ATA, None);
    if ide.is_none() && ata.is_none() {
        crate::log_warn!("[ATA] no PCI IDE/ATA controller, skipping legacy probe");
        return false;
    }

    setup_channels_from_pci();

    // Compat-mode channels get IRQ event handlers; native runs polled
    if let Some(c) = crate::interrupts::controller() {
        let channels = CHANNELS.lock();
        if channels[0].irq_compat != 0xFF {
            c.register_handler(14, irq14_handler);
            c.enable(14);
        }
        if channels[1].irq_compat != 0xFF {
            c.register_handler(15, irq15_handler);
            c.enable(15);
        }
    }

    let bases: [(u16, u16); 2] = {
        let channels = CHANNELS.lock();
        [
            (channels[0].io_base, channels[0].ctrl_base),
            (channels[1].io_base, channels[1].ctrl_base),
        ]
    };

    let mut found = 0usize;
    for (channel, (_, ctrl)) in bases.iter().enumerate() {
        soft_reset(*ctrl);
        for drive in 0..2u8 {
            let slot = channel * 2 + drive as usize;
            let Some(mut device) = identify_drive(channel, drive) else {
                continue;
            };

            match device.device_type {
                AtaDeviceType::Ata => {
                    let name = format!("ata{}", slot);
                    crate::log!(
                        "[ATA] {} {} disk: {} x {} bytes (lba48={})",
                        if channel == 0 { "primary" } else { "secondary" },
                        if drive == 0 { "master" } else { "slave" },
                        device.total_sectors,
                        device.sector_size,
                        device.lba48
                    );
                    let total = device.total_sectors;
                    let block_size = device.sector_size;
                    DEVICES.lock()[slot] = Some(device);
                    block::register(
                        &name,
                        BlockDeviceType::Disk,
                        block_size,
                        total,
                        Arc::new(AtaBlockDevice { index: slot }),
                    );
                }
                AtaDeviceType::Atapi => {
                    device.block_size = 2048;
                    let (last_lba, block_len) = {
                        // The device slot isn't published yet; probe directly
                        atapi_read_capacity(&device).unwrap_or((0, 2048))
                    };
                    let block_len = if block_len == 0 { 2048 } else { block_len };
                    device.block_size = block_len;
                    let name = format!("cd{}", slot);
                    crate::log!(
                        "[ATA] {} {} ATAPI drive: {} x {} bytes",
                        if channel == 0 { "primary" } else { "secondary" },
                        if drive == 0 { "master" } else { "slave" },
                        last_lba as u64 + 1,
                        block_len
                    );
                    DEVICES.lock()[slot] = Some(device);
                    block::register(
                        &name,
                        BlockDeviceType::Cdrom,
                        block_len,
                        last_lba as u64 + 1,
                        Arc::new(AtaBlockDevice { index: slot }),
                    );
                }
            }
            found += 1;
        }
    }

    crate::log!("[ATA] {} drives", found);
    true
}

/// The legacy ATA driver singleton
pub struct AtaDriver;

pub static ATA: AtaDriver = AtaDriver;

impl Driver for AtaDriver {
    fn name(&self) -> &'static str {
        "ATA"
    }

    fn init(&self) -> bool {
        probe_and_register()
    }

    fn enable(&self) {
        // Clear nIEN so the drives may interrupt
        let channels = CHANNELS.lock();
        outb(channels[0].ctrl_base, 0x00);
        outb(channels[1].ctrl_base, 0x00);
    }

    fn disable(&self) {
        let channels = CHANNELS.lock();
        outb(channels[0].ctrl_base, DEVCTRL_NIEN);
        outb(channels[1].ctrl_base, DEVCTRL_NIEN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_entries() -> [PrdEntry; PRD_MAX_ENTRIES] {
        [PrdEntry {
            base: 0,
            byte_count: 0,
            flags: 0,
        }; PRD_MAX_ENTRIES]
    }

    #[test]
    fn single_span_gets_one_entry_with_eot() {
        let mut entries = empty_entries();
        let (used, built) = build_prd_entries(0x10000, 4096, &mut entries);
        assert_eq!(used, 1);
        assert_eq!(built, 4096);
        assert_eq!(entries[0].base, 0x10000);
        assert_eq!(entries[0].byte_count, 4096);
        assert_eq!(entries[0].flags, PRD_EOT);
    }

    #[test]
    fn spans_split_on_64k_boundaries() {
        let mut entries = empty_entries();
        // 8 KiB starting 4 KiB below a 64 KiB boundary
        let (used, built) = build_prd_entries(0x1F000, 8192, &mut entries);
        assert_eq!(used, 2);
        assert_eq!(built, 8192);
        assert_eq!(entries[0].base, 0x1F000);
        assert_eq!(entries[0].byte_count, 4096);
        assert_eq!(entries[0].flags, 0);
        assert_eq!(entries[1].base, 0x20000);
        assert_eq!(entries[1].byte_count, 4096);
        assert_eq!(entries[1].flags, PRD_EOT);
    }

    #[test]
    fn full_64k_span_encodes_as_zero_count() {
        let mut entries = empty_entries();
        let (used, built) = build_prd_entries(0x20000, 0x10000, &mut entries);
        assert_eq!(used, 1);
        assert_eq!(built, 0x10000);
        // Hardware reads a zero byte count as 64 KiB
        assert_eq!(entries[0].byte_count, 0);
        assert_eq!(entries[0].flags, PRD_EOT);
    }

    #[test]
    fn oversized_request_is_truncated_at_four_entries() {
        let mut entries = empty_entries();
        let bytes = 5 * 0x10000;
        let (used, built) = build_prd_entries(0x40000, bytes, &mut entries);
        assert_eq!(used, PRD_MAX_ENTRIES);
        assert!(built < bytes);
        assert_eq!(entries[PRD_MAX_ENTRIES - 1].flags & PRD_EOT, PRD_EOT);
    }
}
