//! Volume manager
//!
//! Every block device yields one whole-device volume; MBR and GPT
//! partition tables add one volume per partition. All sector I/O is
//! translated by the volume's start LBA and clamped to its extent.

use crate::block::{self, BlockDevice, BlockDeviceType};
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::RwLock;

const MBR_SIGNATURE: u16 = 0xAA55;
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// Where a volume came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    WholeDevice,
    MbrPartition { type_byte: u8 },
    GptPartition,
}

/// One addressable volume
pub struct Volume {
    pub device: Arc<BlockDevice>,
    pub kind: VolumeKind,
    pub name: String,
    pub start_lba: u64,
    pub block_count: u64,
    pub block_size: u32,
    /// GPT type GUID (protective 0xEE volumes keep zeroes)
    pub type_guid: [u8; 16],
    /// GPT unique partition GUID
    pub unique_guid: [u8; 16],
    /// GPT attribute bits
    pub attributes: u64,
}

impl Volume {
    /// Read sectors relative to the volume start; clamped to the extent
    pub fn read_sectors(&self, lba: u64, count: u32, buffer: &mut [u8]) -> bool {
        if count == 0 {
            return false;
        }
        if lba.saturating_add(count as u64) > self.block_count {
            return false;
        }
        self.device.read(self.start_lba + lba, count, buffer)
    }

    /// Write sectors relative to the volume start; clamped to the extent
    pub fn write_sectors(&self, lba: u64, count: u32, buffer: &[u8]) -> bool {
        if count == 0 {
            return false;
        }
        if lba.saturating_add(count as u64) > self.block_count {
            return false;
        }
        self.device.write(self.start_lba + lba, count, buffer)
    }

    pub fn is_cdrom(&self) -> bool {
        self.device.device_type == BlockDeviceType::Cdrom
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MbrPartitionEntry {
    status: u8,
    chs_first: [u8; 3],
    partition_type: u8,
    chs_last: [u8; 3],
    first_lba: u32,
    sector_count: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GptHeader {
    signature: [u8; 8],
    revision: u32,
    header_size: u32,
    header_crc32: u32,
    _reserved: u32,
    current_lba: u64,
    backup_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    partition_entry_lba: u64,
    partition_entry_count: u32,
    partition_entry_size: u32,
    partition_entry_crc32: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GptPartitionEntry {
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    first_lba: u64,
    last_lba: u64,
    attributes: u64,
    name: [u16; 36],
}

static VOLUMES: RwLock<Vec<Arc<Volume>>> = RwLock::new(Vec::new());

fn partition_name(device: &BlockDevice, index: usize) -> String {
    format!("{}p{}", device.name, index)
}

/// Decode a UTF-16LE GPT partition label for logging
fn decode_gpt_name(name_utf16: &[u16]) -> String {
    let mut out = String::new();
    for &ch in name_utf16 {
        if ch == 0 {
            break;
        }
        out.push(if ch < 0x80 { ch as u8 as char } else { '?' });
    }
    out
}

fn scan_gpt(device: &Arc<BlockDevice>, block_size: u32, out: &mut Vec<Arc<Volume>>) {
    let mut header_block = vec![0u8; block_size as usize];
    if !device.read(1, 1, &mut header_block) {
        return;
    }

    let header = unsafe { &*(header_block.as_ptr() as *const GptHeader) };
    if &header.signature != GPT_SIGNATURE {
        return;
    }

    let entry_size = { header.partition_entry_size };
    let entry_count = { header.partition_entry_count };
    let entry_lba = { header.partition_entry_lba };

    if entry_size < core::mem::size_of::<GptPartitionEntry>() as u32 || entry_count == 0 {
        return;
    }

    let table_bytes = entry_size as u64 * entry_count as u64;
    let blocks_to_read = (table_bytes + block_size as u64 - 1) / block_size as u64;
    let mut entries = vec![0u8; (blocks_to_read * block_size as u64) as usize];
    if !device.read(entry_lba, blocks_to_read as u32, &mut entries) {
        return;
    }

    let mut partition_index = 1usize;
    for i in 0..entry_count as usize {
        let entry = unsafe {
            &*(entries.as_ptr().add(i * entry_size as usize) as *const GptPartitionEntry)
        };

        let type_guid = { entry.type_guid };
        if type_guid == [0u8; 16] {
            continue;
        }

        let first_lba = { entry.first_lba };
        let last_lba = { entry.last_lba };
        if last_lba < first_lba {
            continue;
        }
        let blocks = last_lba - first_lba + 1;

        let entry_name = { entry.name };
        let label = decode_gpt_name(&entry_name);
        let name = partition_name(device, partition_index);
        if !label.is_empty() {
            crate::log!("[VOL] GPT partition {} label '{}'", name, label);
        }

        out.push(Arc::new(Volume {
            device: device.clone(),
            kind: VolumeKind::GptPartition,
            name,
            start_lba: first_lba,
            block_count: blocks,
            block_size,
            type_guid,
            unique_guid: { entry.unique_guid },
            attributes: { entry.attributes },
        }));
        partition_index += 1;
    }
}

fn scan_mbr(device: &Arc<BlockDevice>, block_size: u32, out: &mut Vec<Arc<Volume>>) {
    let mut sector = vec![0u8; block_size as usize];
    if !device.read(0, 1, &mut sector) {
        return;
    }
    if sector.len() < 512 {
        return;
    }

    let signature = u16::from_le_bytes([sector[510], sector[511]]);
    if signature != MBR_SIGNATURE {
        return;
    }

    let entries = unsafe { &*(sector.as_ptr().add(446) as *const [MbrPartitionEntry; 4]) };

    if entries
        .iter()
        .any(|e| e.partition_type == MBR_TYPE_GPT_PROTECTIVE)
    {
        scan_gpt(device, block_size, out);
        return;
    }

    // Names count produced volumes, not table slots: an empty slot
    // between two partitions does not leave a hole in the numbering
    let mut partition_index = 1usize;
    for entry in entries.iter() {
        let partition_type = entry.partition_type;
        let first_lba = { entry.first_lba };
        let sector_count = { entry.sector_count };
        if partition_type == 0 || sector_count == 0 {
            continue;
        }

        out.push(Arc::new(Volume {
            device: device.clone(),
            kind: VolumeKind::MbrPartition {
                type_byte: partition_type,
            },
            name: partition_name(device, partition_index),
            start_lba: first_lba as u64,
            block_count: sector_count as u64,
            block_size,
            type_guid: [0; 16],
            unique_guid: [0; 16],
            attributes: 0,
        }));
        partition_index += 1;
    }
}

/// Drop all volumes and rebuild from the block device registry
pub fn rebuild() {
    let mut volumes: Vec<Arc<Volume>> = Vec::new();

    for i in 0..block::count() {
        let Some(device) = block::get_at(i) else {
            continue;
        };
        let block_size = if device.logical_block_size == 0 {
            512
        } else {
            device.logical_block_size
        };

        volumes.push(Arc::new(Volume {
            device: device.clone(),
            kind: VolumeKind::WholeDevice,
            name: device.name.clone(),
            start_lba: 0,
            block_count: device.total_blocks,
            block_size,
            type_guid: [0; 16],
            unique_guid: [0; 16],
            attributes: 0,
        }));

        // Optical media carries no partition table worth scanning
        if device.device_type != BlockDeviceType::Cdrom {
            scan_mbr(&device, block_size, &mut volumes);
        }
    }

    for v in &volumes {
        crate::log!(
            "[VOL] '{}' start={} blocks={} ({:?})",
            v.name,
            v.start_lba,
            v.block_count,
            v.kind
        );
    }

    *VOLUMES.write() = volumes;
}

/// Number of known volumes
pub fn count() -> usize {
    VOLUMES.read().len()
}

/// Volume by index
pub fn get_at(index: usize) -> Option<Arc<Volume>> {
    VOLUMES.read().get(index).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::tests::MemDisk;
    use crate::block::BlockDeviceOps;

    fn mem_device(blocks: usize) -> (Arc<BlockDevice>, Arc<MemDisk>) {
        let disk = Arc::new(MemDisk::new(blocks, 512));
        let ops: Arc<dyn BlockDeviceOps> = disk.clone();
        let device = Arc::new(BlockDevice::new(
            "mem0",
            BlockDeviceType::Disk,
            512,
            blocks as u64,
            ops,
        ));
        (device, disk)
    }

    fn write_mbr_entry(sector: &mut [u8], slot: usize, ptype: u8, first_lba: u32, count: u32) {
        let base = 446 + slot * 16;
        sector[base + 4] = ptype;
        sector[base + 8..base + 12].copy_from_slice(&first_lba.to_le_bytes());
        sector[base + 12..base + 16].copy_from_slice(&count.to_le_bytes());
    }

    #[test]
    fn missing_signature_yields_no_partitions() {
        let (device, _) = mem_device(64);
        let mut out = Vec::new();
        scan_mbr(&device, 512, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn mbr_partition_names_count_produced_volumes() {
        let (device, disk) = mem_device(64);
        {
            let mut data = disk.data.lock();
            // Slot 1 left empty: the second produced volume is still p2
            write_mbr_entry(&mut data[..512], 0, 0x07, 8, 16);
            write_mbr_entry(&mut data[..512], 2, 0x83, 32, 8);
            data[510] = 0x55;
            data[511] = 0xAA;
        }
        let mut out = Vec::new();
        scan_mbr(&device, 512, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, "mem0p1");
        assert_eq!(out[0].start_lba, 8);
        assert_eq!(out[0].block_count, 16);
        assert_eq!(
            out[0].kind,
            VolumeKind::MbrPartition { type_byte: 0x07 }
        );
        assert_eq!(out[1].name, "mem0p2");
        assert_eq!(out[1].start_lba, 32);
    }

    #[test]
    fn protective_mbr_routes_to_gpt() {
        let (device, disk) = mem_device(64);
        {
            let mut data = disk.data.lock();
            // Protective MBR
            write_mbr_entry(&mut data[..512], 0, 0xEE, 1, 63);
            data[510] = 0x55;
            data[511] = 0xAA;
            // GPT header at LBA 1
            let h = 512;
            data[h..h + 8].copy_from_slice(b"EFI PART");
            data[h + 72..h + 80].copy_from_slice(&2u64.to_le_bytes()); // entries at LBA 2
            data[h + 80..h + 84].copy_from_slice(&2u32.to_le_bytes()); // two entries
            data[h + 84..h + 88].copy_from_slice(&128u32.to_le_bytes());
            // Entry 0 at LBA 2: type GUID non-zero, lba 10..29
            let e = 1024;
            data[e] = 0xAF;
            data[e + 32..e + 40].copy_from_slice(&10u64.to_le_bytes());
            data[e + 40..e + 48].copy_from_slice(&29u64.to_le_bytes());
            // Entry 1 left all-zero: skipped
        }
        let mut out = Vec::new();
        scan_mbr(&device, 512, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, VolumeKind::GptPartition);
        assert_eq!(out[0].start_lba, 10);
        assert_eq!(out[0].block_count, 20);
        assert_eq!(out[0].name, "mem0p1");
    }

    #[test]
    fn volume_io_is_translated_and_clamped() {
        let (device, disk) = mem_device(64);
        let volume = Volume {
            device: device.clone(),
            kind: VolumeKind::MbrPartition { type_byte: 0x07 },
            name: String::from("mem0p1"),
            start_lba: 8,
            block_count: 4,
            block_size: 512,
            type_guid: [0; 16],
            unique_guid: [0; 16],
            attributes: 0,
        };

        let payload = [0x5Au8; 512];
        assert!(volume.write_sectors(1, 1, &payload));
        // LBA 1 inside the volume is device LBA 9
        let data = disk.data.lock();
        assert_eq!(&data[9 * 512..9 * 512 + 4], &[0x5A; 4]);
        drop(data);

        let mut back = [0u8; 512];
        assert!(volume.read_sectors(1, 1, &mut back));
        assert_eq!(back, payload);

        // Past the extent
        assert!(!volume.read_sectors(4, 1, &mut back));
        assert!(!volume.read_sectors(3, 2, &mut back));
    }
}
