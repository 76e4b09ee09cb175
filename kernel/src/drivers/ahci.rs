//! AHCI storage driver
//!
//! Drives SATA disks and SATAPI optical drives behind an AHCI HBA. Each
//! active port runs command slot 0 with a single PRDT entry; completions
//! are taken from the port interrupt status when the legacy INTx line is
//! wired, with bounded polling as the fallback.

use crate::block::{self, BlockDeviceOps, BlockDeviceType};
use crate::drivers::Driver;
use crate::pci;
use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicU8, Ordering};
use spin::Mutex;

// HBA register offsets (dwords from ABAR)
const HBA_CAP: usize = 0x00;
const HBA_GHC: usize = 0x04;
const HBA_IS: usize = 0x08;
const HBA_PI: usize = 0x0C;
const HBA_VS: usize = 0x10;
const HBA_BOHC: usize = 0x28;
const HBA_PORTS_BASE: usize = 0x100;
const HBA_PORT_SPAN: usize = 0x80;

// Port register offsets (bytes from the port base)
const PORT_CLB: usize = 0x00;
const PORT_CLBU: usize = 0x04;
const PORT_FB: usize = 0x08;
const PORT_FBU: usize = 0x0C;
const PORT_IS: usize = 0x10;
const PORT_IE: usize = 0x14;
const PORT_CMD: usize = 0x18;
const PORT_TFD: usize = 0x20;
const PORT_SIG: usize = 0x24;
const PORT_SSTS: usize = 0x28;
const PORT_SCTL: usize = 0x2C;
const PORT_SERR: usize = 0x30;
const PORT_CI: usize = 0x38;

const GHC_AE: u32 = 1 << 31;
const GHC_IE: u32 = 1 << 1;
const BOHC_BOS: u32 = 1 << 0;
const BOHC_OOS: u32 = 1 << 1;

const CMD_ST: u32 = 1 << 0;
const CMD_SUD: u32 = 1 << 1;
const CMD_POD: u32 = 1 << 2;
const CMD_FRE: u32 = 1 << 4;
const CMD_FR: u32 = 1 << 14;
const CMD_CR: u32 = 1 << 15;

const TFD_BSY: u32 = 1 << 7;
const TFD_DRQ: u32 = 1 << 3;

const IS_TFES: u32 = 1 << 30;

const SSTS_DET_MASK: u32 = 0x0F;
const DET_PRESENT: u32 = 3;

const SIG_ATA: u32 = 0x0000_0101;
const SIG_ATAPI: u32 = 0xEB14_0101;

const FIS_TYPE_REG_H2D: u8 = 0x27;

const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
const ATA_CMD_PACKET: u8 = 0xA0;
const ATA_CMD_IDENTIFY: u8 = 0xEC;
const ATA_CMD_FLUSH_CACHE: u8 = 0xE7;
const ATA_CMD_FLUSH_CACHE_EXT: u8 = 0xEA;

const ATAPI_CMD_REQUEST_SENSE: u8 = 0x03;
const ATAPI_CMD_READ_CAPACITY10: u8 = 0x25;
const ATAPI_CMD_READ10: u8 = 0x28;
const ATAPI_CMD_READ12: u8 = 0xA8;

// Command header DW0 bits
const HDR_ATAPI: u16 = 1 << 5;
const HDR_WRITE: u16 = 1 << 6;
const HDR_CLEAR_BUSY: u16 = 1 << 10;

/// Sectors per READ/WRITE DMA EXT command
const MAX_SECTORS_PER_CMD: u32 = 128;
/// Blocks per ATAPI read
const MAX_ATAPI_BLOCKS: u32 = 16;

/// Spin bound for command completion
const CMD_SPIN: u32 = 5_000_000;
/// Spin bound for BSY/DRQ clearing
const BUSY_SPIN: u32 = 1_000_000;

/// Host-to-device register FIS
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct FisRegH2D {
    fis_type: u8,
    pmport_c: u8,
    command: u8,
    featurel: u8,
    lba0: u8,
    lba1: u8,
    lba2: u8,
    device: u8,
    lba3: u8,
    lba4: u8,
    lba5: u8,
    featureh: u8,
    countl: u8,
    counth: u8,
    icc: u8,
    control: u8,
    _reserved: [u8; 4],
}

impl FisRegH2D {
    fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }

    /// Command FIS with the C bit set
    fn command(command: u8) -> Self {
        let mut fis = Self::zeroed();
        fis.fis_type = FIS_TYPE_REG_H2D;
        fis.pmport_c = 0x80;
        fis.command = command;
        fis
    }

    /// Fill the LBA48 and count fields; device register selects LBA mode
    fn set_lba48(&mut self, lba: u64, count: u16) {
        self.device = 1 << 6;
        self.lba0 = lba as u8;
        self.lba1 = (lba >> 8) as u8;
        self.lba2 = (lba >> 16) as u8;
        self.lba3 = (lba >> 24) as u8;
        self.lba4 = (lba >> 32) as u8;
        self.lba5 = (lba >> 40) as u8;
        self.countl = count as u8;
        self.counth = (count >> 8) as u8;
    }
}

/// Command header, one slot of the command list
#[repr(C)]
#[derive(Clone, Copy)]
struct CmdHeader {
    /// CFL in bits 4:0, ATAPI/WRITE/CLEAR_BUSY bits above
    flags: u16,
    prdtl: u16,
    prdbc: u32,
    ctba: u32,
    ctbau: u32,
    _reserved: [u32; 4],
}

/// Command list: 32 headers, 1 KiB, 1 KiB aligned
#[repr(C, align(1024))]
struct CmdList {
    headers: [CmdHeader; 32],
}

/// Received FIS area: 256 bytes, 256-byte aligned
#[repr(C, align(256))]
struct RxFis {
    bytes: [u8; 256],
}

/// PRDT entry
#[repr(C)]
#[derive(Clone, Copy)]
struct PrdtEntry {
    dba: u32,
    dbau: u32,
    _reserved: u32,
    /// byte count - 1 in bits 21:0, IOC in bit 31
    dbc_i: u32,
}

/// Command table for slot 0 with a single PRDT entry, 128-byte aligned
#[repr(C, align(128))]
struct CmdTable {
    cfis: [u8; 64],
    acmd: [u8; 16],
    _reserved: [u8; 48],
    prdt: [PrdtEntry; 1],
}

/// Raw MMIO window over one port's registers
#[derive(Clone, Copy)]
struct PortMmio {
    base: u64,
}

impl PortMmio {
    fn read(&self, reg: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + reg as u64) as *const u32) }
    }

    fn write(&self, reg: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + reg as u64) as *mut u32, value) }
    }

    fn update(&self, reg: usize, f: impl FnOnce(u32) -> u32) {
        self.write(reg, f(self.read(reg)));
    }
}

/// Raw MMIO window over the HBA generic registers
#[derive(Clone, Copy)]
struct HbaMmio {
    base: u64,
}

impl HbaMmio {
    fn read(&self, reg: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + reg as u64) as *const u32) }
    }

    fn write(&self, reg: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + reg as u64) as *mut u32, value) }
    }

    fn port(&self, index: usize) -> PortMmio {
        PortMmio {
            base: self.base + (HBA_PORTS_BASE + index * HBA_PORT_SPAN) as u64,
        }
    }
}

/// Per-port interrupt events latched by the ISR, read by submitters
static PORT_EVENTS: [AtomicU32; 32] = {
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; 32]
};

/// HBA virtual base for the ISR (zero until initialized)
static HBA_BASE: AtomicU64 = AtomicU64::new(0);
/// Legacy INTx line the ISR acknowledges (0xFF when polling)
static IRQ_LINE: AtomicU8 = AtomicU8::new(0xFF);

/// One configured port with its DMA structures
struct AhciPort {
    mmio: PortMmio,
    port_no: u8,
    cmd_list: Box<CmdList>,
    _fis: Box<RxFis>,
    cmd_table: Box<CmdTable>,
    block_size: u32,
}

// The raw MMIO pointers are only touched under the controller lock
unsafe impl Send for AhciPort {}

struct AhciController {
    ports: [Option<AhciPort>; 32],
}

static CONTROLLER: Mutex<Option<AhciController>> = Mutex::new(None);

/// Read a barrier-forcing flush of posted MMIO writes
fn mmio_flush(hba: &HbaMmio) {
    let _ = hba.read(HBA_IS);
}

/// Legacy INTx handler: fold every signalled port's PxIS into its event
/// word, write both levels back to clear, then EOI.
fn ahci_isr() {
    let base = HBA_BASE.load(Ordering::Relaxed);
    if base != 0 {
        let hba = HbaMmio { base };
        let summary = hba.read(HBA_IS);
        if summary != 0 {
            for port in 0..32 {
                if summary & (1 << port) == 0 {
                    continue;
                }
                let pm = hba.port(port);
                let pis = pm.read(PORT_IS);
                pm.write(PORT_IS, pis);
                PORT_EVENTS[port].fetch_or(pis, Ordering::SeqCst);
            }
            hba.write(HBA_IS, summary);
        }
    }

    let line = IRQ_LINE.load(Ordering::Relaxed);
    if line != 0xFF {
        if let Some(c) = crate::interrupts::controller() {
            c.ack(line as u32);
        }
    }
}

impl AhciPort {
    /// Stop the command engine: clear ST, wait CR; clear FRE, wait FR
    fn stop_engine(&self) {
        self.mmio.update(PORT_CMD, |v| v & !CMD_ST);
        let mut spin = BUSY_SPIN;
        while self.mmio.read(PORT_CMD) & CMD_CR != 0 && spin > 0 {
            spin -= 1;
            core::hint::spin_loop();
        }
        if self.mmio.read(PORT_CMD) & CMD_CR != 0 {
            crate::log_warn!("[AHCI] port {} stop timeout (CR set)", self.port_no);
        }

        self.mmio.update(PORT_CMD, |v| v & !CMD_FRE);
        let mut spin = BUSY_SPIN;
        while self.mmio.read(PORT_CMD) & CMD_FR != 0 && spin > 0 {
            spin -= 1;
            core::hint::spin_loop();
        }
        if self.mmio.read(PORT_CMD) & CMD_FR != 0 {
            crate::log_warn!("[AHCI] port {} stop timeout (FR set)", self.port_no);
        }
    }

    /// Power on, spin up, enable FIS receive, start the engine
    fn start_engine(&self) {
        self.mmio.update(PORT_CMD, |v| v | CMD_POD);
        self.mmio.update(PORT_CMD, |v| v | CMD_SUD);

        self.mmio.update(PORT_CMD, |v| v | CMD_FRE);
        let mut spin = BUSY_SPIN;
        while self.mmio.read(PORT_CMD) & CMD_FR == 0 && spin > 0 {
            spin -= 1;
            core::hint::spin_loop();
        }
        if self.mmio.read(PORT_CMD) & CMD_FR == 0 {
            crate::log_warn!("[AHCI] port {} FR did not assert", self.port_no);
        }

        self.mmio.update(PORT_CMD, |v| v | CMD_ST);
        let mut spin = BUSY_SPIN;
        while self.mmio.read(PORT_CMD) & CMD_CR == 0 && spin > 0 {
            spin -= 1;
            core::hint::spin_loop();
        }
        // Some controllers assert CR lazily; not an error
    }

    /// COMRESET: DET=1, settle, DET=0, settle
    fn comreset(&self) {
        self.mmio.write(PORT_SERR, 0xFFFF_FFFF);
        self.mmio.update(PORT_SCTL, |v| (v & !0x0F) | 0x1);
        for _ in 0..200_000 {
            let _ = self.mmio.read(PORT_SSTS);
        }
        self.mmio.update(PORT_SCTL, |v| v & !0x0F);
        for _ in 0..200_000 {
            let _ = self.mmio.read(PORT_SSTS);
        }
    }

    /// Light recovery after an ATAPI task-file error: clear status, and
    /// restart the engine if it was running.
    fn recover(&self) {
        self.mmio.write(PORT_IS, 0xFFFF_FFFF);
        self.mmio.write(PORT_SERR, 0xFFFF_FFFF);
        for _ in 0..200_000 {
            let _ = self.mmio.read(PORT_SSTS);
        }
        if self.mmio.read(PORT_CMD) & (CMD_ST | CMD_FRE) != 0 {
            self.stop_engine();
            self.mmio.write(PORT_IS, 0xFFFF_FFFF);
            self.mmio.write(PORT_SERR, 0xFFFF_FFFF);
            self.start_engine();
        }
    }

    /// Wait for BSY and DRQ to clear before building a command
    fn wait_not_busy(&self) -> bool {
        let mut spin = BUSY_SPIN;
        while self.mmio.read(PORT_TFD) & (TFD_BSY | TFD_DRQ) != 0 && spin > 0 {
            spin -= 1;
            core::hint::spin_loop();
        }
        self.mmio.read(PORT_TFD) & (TFD_BSY | TFD_DRQ) == 0
    }

    /// Program slot 0's header and table base
    fn prepare_header(&mut self, flags: u16, prdtl: u16) {
        let table_phys = crate::memory::virt_to_phys(&*self.cmd_table as *const _ as u64);
        let header = &mut self.cmd_list.headers[0];
        header.flags = (core::mem::size_of::<FisRegH2D>() / 4) as u16 | flags;
        header.prdtl = prdtl;
        header.prdbc = 0;
        header.ctba = table_phys as u32;
        header.ctbau = (table_phys >> 32) as u32;
    }

    /// Point PRDT entry 0 at a buffer with interrupt-on-completion
    fn prepare_prdt(&mut self, buffer: u64, byte_count: u32) {
        let entry = &mut self.cmd_table.prdt[0];
        entry.dba = buffer as u32;
        entry.dbau = (buffer >> 32) as u32;
        entry._reserved = 0;
        entry.dbc_i = ((byte_count - 1) & 0x003F_FFFF) | (1 << 31);
    }

    /// Issue slot 0 and wait bounded for completion. TFES fails.
    fn issue_and_wait(&self, hba: &HbaMmio) -> Result<(), &'static str> {
        fence(Ordering::SeqCst);
        self.mmio.write(PORT_IS, 0xFFFF_FFFF);
        mmio_flush(hba);
        self.mmio.write(PORT_CI, 1);

        let events = &PORT_EVENTS[self.port_no as usize];
        let mut spin = CMD_SPIN;
        while spin > 0 {
            if self.mmio.read(PORT_CI) & 1 == 0 {
                break;
            }
            if events.load(Ordering::SeqCst) != 0 {
                break;
            }
            if self.mmio.read(PORT_IS) & IS_TFES != 0 {
                crate::log_error!(
                    "[AHCI] port {} task file error (IS={:#x} TFD={:#x})",
                    self.port_no,
                    self.mmio.read(PORT_IS),
                    self.mmio.read(PORT_TFD)
                );
                return Err("task file error");
            }
            spin -= 1;
            core::hint::spin_loop();
        }

        events.store(0, Ordering::SeqCst);
        if self.mmio.read(PORT_CI) & 1 != 0 {
            crate::log_error!(
                "[AHCI] port {} command timeout (IS={:#x} TFD={:#x})",
                self.port_no,
                self.mmio.read(PORT_IS),
                self.mmio.read(PORT_TFD)
            );
            return Err("command timeout");
        }
        Ok(())
    }

    /// One READ/WRITE DMA EXT command, at most 128 sectors
    fn dma_rw(
        &mut self,
        hba: &HbaMmio,
        lba: u64,
        count: u32,
        buffer: u64,
        write: bool,
    ) -> Result<(), &'static str> {
        if count == 0 {
            return Ok(());
        }
        if !self.wait_not_busy() {
            crate::log_error!(
                "[AHCI] port {} busy before DMA (TFD={:#x})",
                self.port_no,
                self.mmio.read(PORT_TFD)
            );
            return Err("port busy");
        }

        self.prepare_header(if write { HDR_WRITE } else { 0 }, 1);
        self.cmd_table.cfis = [0; 64];
        self.cmd_table.acmd = [0; 16];
        self.prepare_prdt(buffer, count * self.block_size);

        let mut fis = FisRegH2D::command(if write {
            ATA_CMD_WRITE_DMA_EXT
        } else {
            ATA_CMD_READ_DMA_EXT
        });
        fis.set_lba48(lba, count as u16);
        self.cmd_table.cfis[..core::mem::size_of::<FisRegH2D>()]
            .copy_from_slice(unsafe { struct_bytes(&fis) });

        self.issue_and_wait(hba)
    }

    /// FLUSH CACHE [EXT], no data phase
    fn flush_cache(&mut self, hba: &HbaMmio, opcode: u8) -> Result<(), &'static str> {
        if !self.wait_not_busy() {
            return Err("port busy");
        }
        self.prepare_header(0, 0);
        self.cmd_table.cfis = [0; 64];
        self.cmd_table.acmd = [0; 16];
        self.cmd_table.prdt[0] = unsafe { core::mem::zeroed() };

        let mut fis = FisRegH2D::command(opcode);
        fis.device = 1 << 6;
        self.cmd_table.cfis[..core::mem::size_of::<FisRegH2D>()]
            .copy_from_slice(unsafe { struct_bytes(&fis) });

        self.issue_and_wait(hba)
    }

    /// ATAPI PACKET: CDB in ACMD, transfer byte count in the FIS features
    fn packet(
        &mut self,
        hba: &HbaMmio,
        cdb: &[u8],
        buffer: u64,
        byte_count: u32,
        write: bool,
    ) -> Result<(), &'static str> {
        if !self.wait_not_busy() {
            return Err("port busy");
        }

        let mut flags = HDR_ATAPI | HDR_CLEAR_BUSY;
        if write {
            flags |= HDR_WRITE;
        }
        self.prepare_header(flags, if byte_count > 0 { 1 } else { 0 });
        self.cmd_table.cfis = [0; 64];
        self.cmd_table.acmd = [0; 16];
        if byte_count > 0 {
            self.prepare_prdt(buffer, byte_count);
        } else {
            self.cmd_table.prdt[0] = unsafe { core::mem::zeroed() };
        }

        let mut fis = FisRegH2D::command(ATA_CMD_PACKET);
        let clamped = byte_count.min(0xFFFF);
        fis.featurel = clamped as u8;
        fis.featureh = (clamped >> 8) as u8;
        self.cmd_table.cfis[..core::mem::size_of::<FisRegH2D>()]
            .copy_from_slice(unsafe { struct_bytes(&fis) });

        let cdb_len = cdb.len().min(16);
        self.cmd_table.acmd[..cdb_len].copy_from_slice(&cdb[..cdb_len]);

        self.issue_and_wait(hba)
    }

    /// REQUEST SENSE for diagnostics after a failed packet command.
    /// DMA targets must live in the direct-mapped heap.
    fn request_sense(&mut self, hba: &HbaMmio) {
        let mut sense = vec![0u8; 18];
        let mut cdb = [0u8; 12];
        cdb[0] = ATAPI_CMD_REQUEST_SENSE;
        cdb[4] = sense.len() as u8;
        let buf_phys = crate::memory::virt_to_phys(sense.as_mut_ptr() as u64);
        match self.packet(hba, &cdb, buf_phys, sense.len() as u32, false) {
            Ok(()) => crate::log!(
                "[AHCI] port {} sense: key={:#x} asc={:#x} ascq={:#x}",
                self.port_no,
                sense[2] & 0x0F,
                sense[12],
                sense[13]
            ),
            Err(_) => crate::log_warn!("[AHCI] port {} REQUEST SENSE failed", self.port_no),
        }
    }

    /// ATAPI block read: READ(10) first, READ(12) as the fallback, with
    /// port recovery and a sense fetch between attempts.
    fn atapi_read(
        &mut self,
        hba: &HbaMmio,
        lba: u32,
        blocks: u32,
        buffer: u64,
    ) -> Result<(), &'static str> {
        if blocks == 0 {
            return Ok(());
        }
        let byte_count = blocks * self.block_size;

        let mut cdb10 = [0u8; 12];
        cdb10[0] = ATAPI_CMD_READ10;
        cdb10[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb10[7] = (blocks >> 8) as u8;
        cdb10[8] = blocks as u8;
        if self.packet(hba, &cdb10, buffer, byte_count, false).is_ok() {
            return Ok(());
        }
        self.recover();
        self.request_sense(hba);

        let mut cdb12 = [0u8; 12];
        cdb12[0] = ATAPI_CMD_READ12;
        cdb12[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb12[6] = (blocks >> 16) as u8;
        cdb12[7] = (blocks >> 8) as u8;
        cdb12[8] = blocks as u8;
        if self.packet(hba, &cdb12, buffer, byte_count, false).is_ok() {
            return Ok(());
        }
        self.recover();
        self.request_sense(hba);
        Err("ATAPI read failed")
    }

    /// READ CAPACITY(10): last LBA and block length, both big-endian
    fn atapi_read_capacity(&mut self, hba: &HbaMmio) -> Option<(u32, u32)> {
        let mut cap = vec![0u8; 8];
        let mut cdb = [0u8; 12];
        cdb[0] = ATAPI_CMD_READ_CAPACITY10;
        let buf_phys = crate::memory::virt_to_phys(cap.as_mut_ptr() as u64);
        self.packet(hba, &cdb, buf_phys, cap.len() as u32, false).ok()?;
        let last_lba = u32::from_be_bytes([cap[0], cap[1], cap[2], cap[3]]);
        let block_len = u32::from_be_bytes([cap[4], cap[5], cap[6], cap[7]]);
        Some((last_lba, block_len))
    }

    /// IDENTIFY DEVICE into a heap buffer (DMA needs direct-mapped memory)
    fn identify(&mut self, hba: &HbaMmio, out: &mut [u16]) -> Result<(), &'static str> {
        if !self.wait_not_busy() {
            return Err("port busy");
        }
        self.prepare_header(HDR_CLEAR_BUSY, 1);
        self.cmd_table.cfis = [0; 64];
        self.cmd_table.acmd = [0; 16];
        let buf_phys = crate::memory::virt_to_phys(out.as_mut_ptr() as u64);
        self.prepare_prdt(buf_phys, 512);

        let mut fis = FisRegH2D::command(ATA_CMD_IDENTIFY);
        fis.device = 1 << 6;
        self.cmd_table.cfis[..core::mem::size_of::<FisRegH2D>()]
            .copy_from_slice(unsafe { struct_bytes(&fis) });

        self.issue_and_wait(hba)
    }
}

unsafe fn struct_bytes<T>(value: &T) -> &[u8] {
    core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
}

/// Decode IDENTIFY geometry: logical sector size and total sectors
fn parse_identify_geometry(words: &[u16]) -> (u32, u64) {
    let mut sector_size = 512u32;
    if words[106] & (1 << 12) != 0 {
        let size = ((words[118] as u32) << 16) | words[117] as u32;
        if size >= 512 && size % 512 == 0 {
            sector_size = size;
        }
    }

    let lba28 = ((words[61] as u64) << 16) | words[60] as u64;
    let total = if words[83] & (1 << 10) != 0 {
        ((words[103] as u64) << 48)
            | ((words[102] as u64) << 32)
            | ((words[101] as u64) << 16)
            | words[100] as u64
    } else {
        lba28
    };
    (sector_size, total)
}

/// Block device face of a SATA disk port
struct AhciDisk {
    port_no: u8,
}

impl BlockDeviceOps for AhciDisk {
    fn read(&self, lba: u64, count: u32, buffer: &mut [u8]) -> bool {
        with_port(self.port_no, |port, hba| {
            let mut lba = lba;
            let mut remaining = count;
            let mut offset = 0usize;
            let block = port.block_size as usize;
            while remaining > 0 {
                let n = remaining.min(MAX_SECTORS_PER_CMD);
                let buf_phys =
                    crate::memory::virt_to_phys(buffer[offset..].as_mut_ptr() as u64);
                if port.dma_rw(hba, lba, n, buf_phys, false).is_err() {
                    return false;
                }
                lba += n as u64;
                offset += n as usize * block;
                remaining -= n;
            }
            true
        })
        .unwrap_or(false)
    }

    fn write(&self, lba: u64, count: u32, buffer: &[u8]) -> bool {
        with_port(self.port_no, |port, hba| {
            let mut lba = lba;
            let mut remaining = count;
            let mut offset = 0usize;
            let block = port.block_size as usize;
            while remaining > 0 {
                let n = remaining.min(MAX_SECTORS_PER_CMD);
                let buf_phys = crate::memory::virt_to_phys(buffer[offset..].as_ptr() as u64);
                if port.dma_rw(hba, lba, n, buf_phys, true).is_err() {
                    return false;
                }
                lba += n as u64;
                offset += n as usize * block;
                remaining -= n;
            }
            true
        })
        .unwrap_or(false)
    }

    fn flush(&self) -> bool {
        with_port(self.port_no, |port, hba| {
            port.flush_cache(hba, ATA_CMD_FLUSH_CACHE_EXT)
                .or_else(|_| port.flush_cache(hba, ATA_CMD_FLUSH_CACHE))
                .is_ok()
        })
        .unwrap_or(false)
    }
}

/// Block device face of a SATAPI optical port (reads only)
struct AhciCdrom {
    port_no: u8,
}

impl BlockDeviceOps for AhciCdrom {
    fn read(&self, lba: u64, count: u32, buffer: &mut [u8]) -> bool {
        with_port(self.port_no, |port, hba| {
            let mut lba = lba as u32;
            let mut remaining = count;
            let mut offset = 0usize;
            let block = port.block_size as usize;
            while remaining > 0 {
                let n = remaining.min(MAX_ATAPI_BLOCKS);
                let buf_phys =
                    crate::memory::virt_to_phys(buffer[offset..].as_mut_ptr() as u64);
                if port.atapi_read(hba, lba, n, buf_phys).is_err() {
                    return false;
                }
                lba += n;
                offset += n as usize * block;
                remaining -= n;
            }
            true
        })
        .unwrap_or(false)
    }
}

/// Run a closure against a configured port under the controller lock
fn with_port<R>(port_no: u8, f: impl FnOnce(&mut AhciPort, &HbaMmio) -> R) -> Option<R> {
    let hba = HbaMmio {
        base: HBA_BASE.load(Ordering::Relaxed),
    };
    if hba.base == 0 {
        return None;
    }
    let mut guard = CONTROLLER.lock();
    let controller = guard.as_mut()?;
    let port = controller.ports[port_no as usize].as_mut()?;
    Some(f(port, &hba))
}

/// Configure one implemented port: stop, allocate DMA structures,
/// program bases, start, reset the link, then classify by signature.
fn configure_port(hba: &HbaMmio, index: usize) -> Option<AhciPort> {
    let mmio = hba.port(index);
    let mut port = AhciPort {
        mmio,
        port_no: index as u8,
        cmd_list: Box::new(CmdList {
            headers: [unsafe { core::mem::zeroed() }; 32],
        }),
        _fis: Box::new(RxFis { bytes: [0; 256] }),
        cmd_table: Box::new(unsafe { core::mem::zeroed() }),
        block_size: 512,
    };

    port.stop_engine();

    let clb_phys = crate::memory::virt_to_phys(&*port.cmd_list as *const _ as u64);
    let fb_phys = crate::memory::virt_to_phys(&*port._fis as *const _ as u64);
    mmio.write(PORT_CLB, clb_phys as u32);
    mmio.write(PORT_CLBU, (clb_phys >> 32) as u32);
    mmio.write(PORT_FB, fb_phys as u32);
    mmio.write(PORT_FBU, (fb_phys >> 32) as u32);

    // Slot 0 always uses a single PRDT entry
    port.prepare_header(0, 1);

    mmio.write(PORT_IS, 0xFFFF_FFFF);
    port.start_engine();

    // Clear and unmask everything the port can signal
    mmio.write(PORT_IS, 0xFFFF_FFFF);
    mmio.write(PORT_IE, 0xFFFF_FFFF);

    port.comreset();
    for _ in 0..100_000 {
        core::hint::spin_loop();
    }

    let ssts = mmio.read(PORT_SSTS);
    if ssts & SSTS_DET_MASK != DET_PRESENT {
        return None;
    }

    Some(port)
}

fn probe_controller() -> bool {
    let Some(dev) = pci::find_by_class(pci::class::MASS_STORAGE, pci::storage::SATA, Some(0x01))
    else {
        crate::log_warn!("[AHCI] no AHCI controller (class 01/06/01)");
        return false;
    };

    pci::enable_io_and_memory(&dev);
    pci::enable_bus_mastering(&dev);

    // ABAR is BAR5 and must be MMIO
    let abar = dev.bars.iter().find(|b| b.index == 5 && !b.is_io());
    let abar_phys = match abar {
        Some(bar) if bar.address != 0 => bar.address,
        _ => {
            crate::log_error!("[AHCI] invalid ABAR at BAR5");
            return false;
        }
    };

    let abar_virt = match crate::memory::map_mmio(abar_phys, 0x2000) {
        Ok(v) => v,
        Err(e) => {
            crate::log_error!("[AHCI] ABAR map failed: {}", e);
            return false;
        }
    };
    let hba = HbaMmio { base: abar_virt };
    HBA_BASE.store(abar_virt, Ordering::SeqCst);

    let vs = hba.read(HBA_VS);
    crate::log!(
        "[AHCI] HBA at {:#x}, version {}.{}",
        abar_phys,
        (vs >> 16) & 0xFFFF,
        vs & 0xFFFF
    );

    // AHCI-enable before anything else touches the registers
    if hba.read(HBA_GHC) & GHC_AE == 0 {
        hba.write(HBA_GHC, hba.read(HBA_GHC) | GHC_AE);
    }

    // BIOS/OS handoff: request ownership, bounded wait, then carry on
    if hba.read(HBA_BOHC) & BOHC_BOS != 0 {
        crate::log!("[AHCI] BIOS owns the HBA, requesting handoff");
        hba.write(HBA_BOHC, hba.read(HBA_BOHC) | BOHC_OOS);
        let mut spin = CMD_SPIN;
        while hba.read(HBA_BOHC) & BOHC_BOS != 0 && spin > 0 {
            spin -= 1;
            core::hint::spin_loop();
        }
        if hba.read(HBA_BOHC) & BOHC_BOS != 0 {
            crate::log_warn!("[AHCI] BIOS kept ownership, continuing anyway");
        }
    }

    hba.write(HBA_IS, 0xFFFF_FFFF);
    hba.write(HBA_GHC, hba.read(HBA_GHC) | GHC_IE);

    // Legacy INTx when the line is wired; polling otherwise
    if dev.interrupt_line != 0xFF && dev.interrupt_line < 16 {
        if let Some(c) = crate::interrupts::controller() {
            IRQ_LINE.store(dev.interrupt_line, Ordering::SeqCst);
            c.register_handler(dev.interrupt_line as u32, ahci_isr);
            c.enable(dev.interrupt_line as u32);
            crate::log!("[AHCI] interrupts on IRQ{}", dev.interrupt_line);
        }
    } else {
        crate::log_warn!("[AHCI] no legacy IRQ line, polling for completion");
    }

    let pi = hba.read(HBA_PI);
    let mut controller = AhciController {
        ports: [const { None }; 32],
    };
    let mut found = 0usize;

    for index in 0..32 {
        if pi & (1 << index) == 0 {
            continue;
        }
        let Some(mut port) = configure_port(&hba, index) else {
            continue;
        };

        let sig = hba.port(index).read(PORT_SIG);
        match sig {
            SIG_ATA => {
                let mut id = vec![0u16; 256];
                let (block_size, total) = match port.identify(&hba, &mut id) {
                    Ok(()) => parse_identify_geometry(&id),
                    Err(_) => {
                        crate::log_warn!("[AHCI] port {} IDENTIFY failed, using defaults", index);
                        (512, 0)
                    }
                };
                port.block_size = block_size;
                let name = format!("ahci{}", index % 10);
                block::register(
                    &name,
                    BlockDeviceType::Disk,
                    block_size,
                    total,
                    Arc::new(AhciDisk {
                        port_no: index as u8,
                    }),
                );
                crate::log!(
                    "[AHCI] port {} SATA disk: {} x {} bytes",
                    index,
                    total,
                    block_size
                );
                controller.ports[index] = Some(port);
                found += 1;
            }
            SIG_ATAPI => {
                port.block_size = 2048;
                let (last_lba, block_len) = port.atapi_read_capacity(&hba).unwrap_or((0, 2048));
                let block_len = if block_len == 0 { 2048 } else { block_len };
                port.block_size = block_len;
                let name = format!("cd{}", index % 10);
                block::register(
                    &name,
                    BlockDeviceType::Cdrom,
                    block_len,
                    last_lba as u64 + 1,
                    Arc::new(AhciCdrom {
                        port_no: index as u8,
                    }),
                );
                crate::log!(
                    "[AHCI] port {} ATAPI drive: {} x {} bytes",
                    index,
                    last_lba as u64 + 1,
                    block_len
                );
                controller.ports[index] = Some(port);
                found += 1;
            }
            other => {
                crate::log!("[AHCI] port {} unknown signature {:#x}, skipped", index, other);
            }
        }
    }

    *CONTROLLER.lock() = Some(controller);
    crate::log!("[AHCI] {} ports with devices", found);
    true
}

/// The AHCI driver singleton
pub struct AhciDriver;

pub static AHCI: AhciDriver = AhciDriver;

impl Driver for AhciDriver {
    fn name(&self) -> &'static str {
        "AHCI"
    }

    fn init(&self) -> bool {
        probe_controller()
    }

    fn enable(&self) {}

    fn disable(&self) {
        let line = IRQ_LINE.load(Ordering::Relaxed);
        if line != 0xFF {
            if let Some(c) = crate::interrupts::controller() {
                c.disable(line as u32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_fis_encodes_lba48_and_count() {
        let mut fis = FisRegH2D::command(ATA_CMD_READ_DMA_EXT);
        fis.set_lba48(0x0123_4567_89AB, 300);
        // Copy packed fields out before comparing
        assert_eq!({ fis.fis_type }, FIS_TYPE_REG_H2D);
        assert_eq!({ fis.pmport_c }, 0x80);
        assert_eq!({ fis.command }, 0x25);
        assert_eq!({ fis.device }, 0x40);
        assert_eq!(
            [fis.lba0, fis.lba1, fis.lba2, fis.lba3, fis.lba4, fis.lba5],
            [0xAB, 0x89, 0x67, 0x45, 0x23, 0x01]
        );
        assert_eq!({ fis.countl }, (300 & 0xFF) as u8);
        assert_eq!({ fis.counth }, 1);
    }

    #[test]
    fn identify_prefers_lba48_when_advertised() {
        let mut words = [0u16; 256];
        words[60] = 0x1000;
        words[83] = 1 << 10;
        words[100] = 0x5678;
        words[101] = 0x1234;
        let (block, total) = parse_identify_geometry(&words);
        assert_eq!(block, 512);
        assert_eq!(total, 0x1234_5678);
    }

    #[test]
    fn identify_falls_back_to_lba28() {
        let mut words = [0u16; 256];
        words[60] = 0x2000;
        words[61] = 0x0001;
        let (_, total) = parse_identify_geometry(&words);
        assert_eq!(total, 0x0001_2000);
    }

    #[test]
    fn identify_large_sector_size() {
        let mut words = [0u16; 256];
        words[106] = 1 << 12;
        words[117] = (4096u32 & 0xFFFF) as u16;
        words[118] = 0;
        let (block, _) = parse_identify_geometry(&words);
        assert_eq!(block, 4096);
    }

    #[test]
    fn dma_alignment_invariants() {
        assert_eq!(core::mem::align_of::<CmdList>(), 1024);
        assert_eq!(core::mem::size_of::<CmdList>(), 1024);
        assert_eq!(core::mem::align_of::<RxFis>(), 256);
        assert_eq!(core::mem::size_of::<RxFis>(), 256);
        assert!(core::mem::align_of::<CmdTable>() >= 128);
        assert_eq!(core::mem::size_of::<FisRegH2D>(), 20);
    }
}
