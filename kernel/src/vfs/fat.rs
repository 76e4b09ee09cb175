//! FAT16/FAT32 filesystem (read-only)
//!
//! Cluster-count thresholds decide the FAT width; FAT12 media is
//! rejected. Long file name entries are skipped and short 8.3 names are
//! folded to lowercase. The FAT chain walker reads one table sector per
//! query rather than caching the table.

use super::{
    DirEntry, FileSystem, MountParams, NodeInfo, NodeKind, VfsError, VfsNode, VfsResult,
};
use crate::block::BlockDevice;
use crate::volume::Volume;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;

const DIR_ENTRY_SIZE: usize = 32;

/// FAT flavor after cluster counting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FatType {
    Fat16,
    Fat32,
}

/// Raw 32-byte directory entry
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RawDirEntry {
    name: [u8; 11],
    attr: u8,
    nt_reserved: u8,
    creation_tenths: u8,
    creation_time: u16,
    creation_date: u16,
    access_date: u16,
    first_cluster_high: u16,
    write_time: u16,
    write_date: u16,
    first_cluster_low: u16,
    file_size: u32,
}

impl RawDirEntry {
    fn is_end(&self) -> bool {
        self.name[0] == 0x00
    }

    fn is_free(&self) -> bool {
        self.name[0] == 0x00 || self.name[0] == 0xE5
    }

    fn is_long_name(&self) -> bool {
        self.attr == ATTR_LONG_NAME
    }

    fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    fn first_cluster(&self) -> u32 {
        ((self.first_cluster_high as u32) << 16) | self.first_cluster_low as u32
    }
}

/// Boot sector accessors over the raw first sector
struct BootSector<'a> {
    bytes: &'a [u8],
}

impl<'a> BootSector<'a> {
    fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < 512 {
            return None;
        }
        Some(Self { bytes })
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    fn u32_at(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ])
    }

    fn jump_byte(&self) -> u8 {
        self.bytes[0]
    }
    fn bytes_per_sector(&self) -> u16 {
        self.u16_at(11)
    }
    fn sectors_per_cluster(&self) -> u8 {
        self.bytes[13]
    }
    fn reserved_sectors(&self) -> u16 {
        self.u16_at(14)
    }
    fn fat_count(&self) -> u8 {
        self.bytes[16]
    }
    fn root_entry_count(&self) -> u16 {
        self.u16_at(17)
    }
    fn total_sectors16(&self) -> u16 {
        self.u16_at(19)
    }
    fn fat_size16(&self) -> u16 {
        self.u16_at(22)
    }
    fn total_sectors32(&self) -> u32 {
        self.u32_at(32)
    }
    fn fat_size32(&self) -> u32 {
        self.u32_at(36)
    }
    fn root_cluster(&self) -> u32 {
        self.u32_at(44)
    }
    fn boot_signature16(&self) -> u8 {
        self.bytes[38]
    }
    fn boot_signature32(&self) -> u8 {
        self.bytes[66]
    }
    fn sector_signature(&self) -> u16 {
        self.u16_at(510)
    }
}

/// Parsed volume geometry
struct FatGeometry {
    fat_type: FatType,
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    cluster_size: u32,
    fat_start_sector: u32,
    root_dir_sector: u32,
    root_dir_sectors: u32,
    first_data_sector: u32,
    root_cluster: u32,
    cluster_count: u32,
}

/// Validate the boot record and compute geometry. Returns None for
/// anything that is not FAT16/FAT32.
fn parse_geometry(boot: &BootSector) -> Option<FatGeometry> {
    if !(boot.jump_byte() == 0xEB || boot.jump_byte() == 0xE9) {
        return None;
    }
    if boot.sector_signature() != 0xAA55 {
        return None;
    }

    let bytes_per_sector = boot.bytes_per_sector() as u32;
    if bytes_per_sector == 0 || !bytes_per_sector.is_power_of_two() {
        return None;
    }
    let sectors_per_cluster = boot.sectors_per_cluster() as u32;
    if sectors_per_cluster == 0
        || !sectors_per_cluster.is_power_of_two()
        || sectors_per_cluster > 128
    {
        return None;
    }
    let fat_count = boot.fat_count() as u32;
    if fat_count == 0 || fat_count > 2 {
        return None;
    }
    let reserved = boot.reserved_sectors() as u32;
    if reserved == 0 {
        return None;
    }

    let total_sectors = if boot.total_sectors16() != 0 {
        boot.total_sectors16() as u32
    } else {
        boot.total_sectors32()
    };
    if total_sectors == 0 {
        return None;
    }

    let fat_size = if boot.fat_size16() != 0 {
        boot.fat_size16() as u32
    } else {
        boot.fat_size32()
    };
    if fat_size == 0 {
        return None;
    }

    let root_entries = boot.root_entry_count() as u32;
    let root_dir_sectors =
        (root_entries * DIR_ENTRY_SIZE as u32 + bytes_per_sector - 1) / bytes_per_sector;
    let data_sectors = total_sectors
        .checked_sub(reserved + fat_count * fat_size + root_dir_sectors)?;
    let cluster_count = data_sectors / sectors_per_cluster;

    let fat_type = if cluster_count < 4085 {
        return None; // FAT12 media
    } else if cluster_count < 65525 {
        FatType::Fat16
    } else {
        FatType::Fat32
    };

    match fat_type {
        FatType::Fat16 if boot.boot_signature16() != 0x29 => return None,
        FatType::Fat32 if boot.boot_signature32() != 0x29 => return None,
        _ => {}
    }

    let fat_start_sector = reserved;
    let root_dir_sector = reserved + fat_count * fat_size;
    let first_data_sector = root_dir_sector + root_dir_sectors;

    Some(FatGeometry {
        fat_type,
        bytes_per_sector,
        sectors_per_cluster,
        cluster_size: bytes_per_sector * sectors_per_cluster,
        fat_start_sector,
        root_dir_sector,
        root_dir_sectors,
        first_data_sector,
        root_cluster: if fat_type == FatType::Fat32 {
            boot.root_cluster()
        } else {
            0
        },
        cluster_count,
    })
}

/// Fold an 8.3 name into lowercase `name.ext` form
fn short_name_to_string(raw: &[u8; 11]) -> String {
    let mut out = String::new();
    for &b in raw[..8].iter() {
        if b == b' ' {
            break;
        }
        out.push((b as char).to_ascii_lowercase());
    }
    if raw[8..].iter().any(|&b| b != b' ') {
        out.push('.');
        for &b in raw[8..].iter() {
            if b == b' ' {
                break;
            }
            out.push((b as char).to_ascii_lowercase());
        }
    }
    out
}

/// Encode a name into the padded 8.3 form. Fails for names that do not
/// fit (the caller falls back to a case-insensitive string compare).
fn string_to_short_name(name: &str) -> Option<[u8; 11]> {
    let mut out = [b' '; 11];
    if name == "." || name == ".." {
        for (i, b) in name.bytes().enumerate() {
            out[i] = b;
        }
        return Some(out);
    }

    let (base, ext) = match name.find('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return None;
    }
    for (i, b) in base.bytes().enumerate() {
        out[i] = if b == b' ' {
            b'_'
        } else {
            b.to_ascii_uppercase()
        };
    }
    for (i, b) in ext.bytes().enumerate() {
        out[8 + i] = if b == b' ' {
            b'_'
        } else {
            b.to_ascii_uppercase()
        };
    }
    Some(out)
}

/// Backing storage: a partition volume or a whole block device
enum Backing {
    Volume(Arc<Volume>),
    Device(Arc<BlockDevice>),
}

impl Backing {
    fn read_sectors(&self, lba: u64, count: u32, buffer: &mut [u8]) -> bool {
        match self {
            Backing::Volume(v) => v.read_sectors(lba, count, buffer),
            Backing::Device(d) => d.read(lba, count, buffer),
        }
    }

    fn from_params(params: &MountParams) -> Option<Self> {
        if let Some(volume) = &params.volume {
            Some(Backing::Volume(volume.clone()))
        } else {
            params.device.clone().map(Backing::Device)
        }
    }
}

/// Per-mount FAT state
struct FatVolume {
    backing: Backing,
    geometry: FatGeometry,
    /// Every node handed out, for unmount teardown accounting
    nodes: Mutex<Vec<Arc<FatNode>>>,
}

impl FatVolume {
    fn read_sector(&self, sector: u32, buffer: &mut [u8]) -> bool {
        self.backing.read_sectors(sector as u64, 1, buffer)
    }

    fn read_cluster(&self, cluster: u32, buffer: &mut [u8]) -> bool {
        if cluster < 2 {
            return false;
        }
        let first = self.geometry.first_data_sector
            + (cluster - 2) * self.geometry.sectors_per_cluster;
        self.backing
            .read_sectors(first as u64, self.geometry.sectors_per_cluster, buffer)
    }

    /// Next cluster in the chain: one FAT sector read per query
    fn next_cluster(&self, cluster: u32) -> u32 {
        let entry_size = if self.geometry.fat_type == FatType::Fat32 {
            4
        } else {
            2
        };
        let fat_offset = cluster * entry_size;
        let sector = self.geometry.fat_start_sector
            + fat_offset / self.geometry.bytes_per_sector;
        let offset = (fat_offset % self.geometry.bytes_per_sector) as usize;

        let mut buffer = vec![0u8; self.geometry.bytes_per_sector as usize];
        if !self.read_sector(sector, &mut buffer) {
            return 0xFFFF_FFFF;
        }

        if self.geometry.fat_type == FatType::Fat32 {
            u32::from_le_bytes([
                buffer[offset],
                buffer[offset + 1],
                buffer[offset + 2],
                buffer[offset + 3],
            ]) & 0x0FFF_FFFF
        } else {
            u16::from_le_bytes([buffer[offset], buffer[offset + 1]]) as u32
        }
    }

    fn is_end(&self, value: u32) -> bool {
        if value < 2 || value == 0xFFFF_FFFF {
            return true;
        }
        match self.geometry.fat_type {
            FatType::Fat32 => value >= 0x0FFF_FFF8,
            FatType::Fat16 => value >= 0xFFF8,
        }
    }

    fn is_bad(&self, value: u32) -> bool {
        match self.geometry.fat_type {
            FatType::Fat32 => value == 0x0FFF_FFF7,
            FatType::Fat16 => value == 0xFFF7,
        }
    }

    fn type_name(&self) -> &'static str {
        match self.geometry.fat_type {
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        }
    }
}

/// Result of scanning a directory region
enum ScanOutcome {
    Found(RawDirEntry, String),
    NotFound,
}

/// What the scan is after: the nth listable entry or a name
enum ScanTarget<'a> {
    Index(usize),
    Name(&'a str, Option<[u8; 11]>),
}

fn entry_matches(
    target: &ScanTarget,
    logical_index: &mut usize,
    raw_name: &[u8; 11],
) -> bool {
    match target {
        ScanTarget::Index(wanted) => {
            let hit = *logical_index == *wanted;
            *logical_index += 1;
            hit
        }
        ScanTarget::Name(name, short) => {
            if let Some(short) = short {
                if raw_name == short {
                    return true;
                }
            }
            short_name_to_string(raw_name).eq_ignore_ascii_case(name)
        }
    }
}

fn scan_block(bytes: &[u8], target: &ScanTarget, logical_index: &mut usize) -> Option<ScanOutcome> {
    let entries = bytes.len() / DIR_ENTRY_SIZE;
    for i in 0..entries {
        // Directory buffers carry no alignment guarantee; copy out
        let entry = unsafe {
            core::ptr::read_unaligned(bytes.as_ptr().add(i * DIR_ENTRY_SIZE) as *const RawDirEntry)
        };
        if entry.is_end() {
            return Some(ScanOutcome::NotFound);
        }
        if entry.is_free() || entry.is_long_name() || entry.attr & ATTR_VOLUME_ID != 0 {
            continue;
        }
        let raw_name = entry.name;
        if entry_matches(target, logical_index, &raw_name) {
            let name = short_name_to_string(&raw_name);
            return Some(ScanOutcome::Found(entry, name));
        }
    }
    None
}

/// Walk a directory (fixed FAT16 root or a cluster chain) for a target
fn scan_directory(
    volume: &FatVolume,
    dir: &FatNode,
    target: ScanTarget,
) -> Option<(RawDirEntry, String)> {
    let mut logical_index = 0usize;

    if dir.is_root && volume.geometry.fat_type == FatType::Fat16 {
        let mut buffer = vec![0u8; volume.geometry.bytes_per_sector as usize];
        for i in 0..volume.geometry.root_dir_sectors {
            if !volume.read_sector(volume.geometry.root_dir_sector + i, &mut buffer) {
                return None;
            }
            match scan_block(&buffer, &target, &mut logical_index) {
                Some(ScanOutcome::Found(entry, name)) => return Some((entry, name)),
                Some(ScanOutcome::NotFound) => return None,
                None => {}
            }
        }
        return None;
    }

    let mut cluster = dir.first_cluster;
    let mut buffer = vec![0u8; volume.geometry.cluster_size as usize];
    while !volume.is_end(cluster) {
        if !volume.read_cluster(cluster, &mut buffer) {
            return None;
        }
        match scan_block(&buffer, &target, &mut logical_index) {
            Some(ScanOutcome::Found(entry, name)) => return Some((entry, name)),
            Some(ScanOutcome::NotFound) => return None,
            None => {}
        }
        let next = volume.next_cluster(cluster);
        if volume.is_bad(next) {
            return None;
        }
        cluster = next;
    }
    None
}

/// One FAT node
struct FatNode {
    volume: Arc<FatVolume>,
    name: String,
    kind: NodeKind,
    parent: Mutex<Option<Weak<FatNode>>>,
    first_cluster: u32,
    size: u32,
    is_root: bool,
}

impl FatNode {
    fn alloc(
        volume: &Arc<FatVolume>,
        parent: Option<&Arc<FatNode>>,
        name: &str,
        kind: NodeKind,
        first_cluster: u32,
        size: u32,
        is_root: bool,
    ) -> Arc<FatNode> {
        let node = Arc::new(FatNode {
            volume: volume.clone(),
            name: String::from(name),
            kind,
            parent: Mutex::new(parent.map(Arc::downgrade)),
            first_cluster,
            size,
            is_root,
        });
        volume.nodes.lock().push(node.clone());
        node
    }
}

impl VfsNode for FatNode {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn parent(&self) -> Option<Arc<dyn VfsNode>> {
        self.parent
            .lock()
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|p| p as Arc<dyn VfsNode>)
    }

    fn open(&self, mode: u32) -> VfsResult<()> {
        if mode & (super::OPEN_WRITE | super::OPEN_APPEND | super::OPEN_TRUNC) != 0 {
            return Err(VfsError::Access);
        }
        Ok(())
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> VfsResult<usize> {
        if self.kind != NodeKind::Regular {
            return Err(VfsError::Invalid);
        }
        if offset >= self.size as u64 {
            return Ok(0);
        }

        let to_read = buffer.len().min((self.size as u64 - offset) as usize);
        if to_read == 0 {
            return Ok(0);
        }

        let cluster_size = self.volume.geometry.cluster_size;
        if self.first_cluster < 2 {
            return Err(VfsError::Io);
        }

        // Skip whole clusters up to the offset
        let mut cluster = self.first_cluster;
        for _ in 0..(offset / cluster_size as u64) {
            cluster = self.volume.next_cluster(cluster);
            if self.volume.is_end(cluster) {
                return Ok(0);
            }
        }

        let mut cluster_offset = (offset % cluster_size as u64) as usize;
        let mut temp = vec![0u8; cluster_size as usize];
        let mut total = 0usize;

        while total < to_read && !self.volume.is_end(cluster) {
            if !self.volume.read_cluster(cluster, &mut temp) {
                break;
            }
            let available = cluster_size as usize - cluster_offset;
            let chunk = (to_read - total).min(available);
            buffer[total..total + chunk]
                .copy_from_slice(&temp[cluster_offset..cluster_offset + chunk]);
            total += chunk;
            cluster_offset = 0;

            let next = self.volume.next_cluster(cluster);
            if self.volume.is_bad(next) {
                break;
            }
            cluster = next;
        }

        Ok(total)
    }

    fn readdir(&self, index: usize) -> VfsResult<DirEntry> {
        if self.kind != NodeKind::Directory {
            return Err(VfsError::Invalid);
        }
        let (entry, name) = scan_directory(&self.volume, self, ScanTarget::Index(index))
            .ok_or(VfsError::NotFound)?;
        Ok(DirEntry {
            name,
            kind: if entry.is_directory() {
                NodeKind::Directory
            } else {
                NodeKind::Regular
            },
        })
    }

    fn lookup(self: Arc<Self>, name: &str) -> VfsResult<Arc<dyn VfsNode>> {
        if self.kind != NodeKind::Directory {
            return Err(VfsError::Invalid);
        }
        let short = string_to_short_name(name);
        let (entry, actual_name) =
            scan_directory(&self.volume, &self, ScanTarget::Name(name, short))
                .ok_or(VfsError::NotFound)?;

        let kind = if entry.is_directory() {
            NodeKind::Directory
        } else {
            NodeKind::Regular
        };
        let child = FatNode::alloc(
            &self.volume,
            Some(&self),
            &actual_name,
            kind,
            entry.first_cluster(),
            entry.file_size,
            false,
        );
        Ok(child as Arc<dyn VfsNode>)
    }

    fn stat(&self) -> VfsResult<NodeInfo> {
        Ok(NodeInfo {
            kind: self.kind,
            size: self.size as u64,
            inode: self.first_cluster as u64,
            readonly: true,
        })
    }
}

/// The FAT driver
pub struct FatFs;

impl FatFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

fn read_boot_sector(params: &MountParams) -> Option<Vec<u8>> {
    let backing = Backing::from_params(params)?;
    let block_size = match &params.volume {
        Some(v) => v.block_size.max(512),
        None => params
            .device
            .as_ref()
            .map(|d| d.logical_block_size.max(512))
            .unwrap_or(512),
    };
    let mut sector = vec![0u8; block_size as usize];
    if !backing.read_sectors(0, 1, &mut sector) {
        return None;
    }
    Some(sector)
}

impl FileSystem for FatFs {
    fn name(&self) -> &'static str {
        "fat"
    }

    fn probe(&self, params: &MountParams) -> bool {
        let Some(sector) = read_boot_sector(params) else {
            return false;
        };
        let Some(boot) = BootSector::new(&sector) else {
            return false;
        };
        parse_geometry(&boot).is_some()
    }

    fn mount(&self, params: &MountParams) -> VfsResult<Arc<dyn VfsNode>> {
        let sector = read_boot_sector(params).ok_or(VfsError::Io)?;
        let boot = BootSector::new(&sector).ok_or(VfsError::Unsupported)?;
        let geometry = parse_geometry(&boot).ok_or(VfsError::Unsupported)?;
        let backing = Backing::from_params(params).ok_or(VfsError::Invalid)?;

        let volume = Arc::new(FatVolume {
            backing,
            geometry,
            nodes: Mutex::new(Vec::new()),
        });

        let root_cluster = match volume.geometry.fat_type {
            FatType::Fat16 => 0,
            FatType::Fat32 => volume.geometry.root_cluster,
        };
        let root = FatNode::alloc(
            &volume,
            None,
            "",
            NodeKind::Directory,
            root_cluster,
            0,
            true,
        );

        crate::log!(
            "[FAT] mounted '{}' ({}, {} clusters)",
            params.source.as_deref().unwrap_or("unnamed"),
            volume.type_name(),
            volume.geometry.cluster_count
        );
        Ok(root as Arc<dyn VfsNode>)
    }

    fn unmount(&self, _root: &Arc<dyn VfsNode>) -> VfsResult<()> {
        // The volume's flat node list is dropped with the root; every
        // node is released exactly once as references go away.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_fold_to_lowercase() {
        assert_eq!(short_name_to_string(b"README  TXT"), "readme.txt");
        assert_eq!(short_name_to_string(b"KERNEL  ELF"), "kernel.elf");
        assert_eq!(short_name_to_string(b"NOEXT      "), "noext");
    }

    #[test]
    fn short_name_encoding_round_trips() {
        let packed = string_to_short_name("readme.txt").unwrap();
        assert_eq!(&packed, b"README  TXT");
        assert_eq!(short_name_to_string(&packed), "readme.txt");
    }

    #[test]
    fn oversized_names_fail_short_encoding() {
        assert!(string_to_short_name("averylongfilename.txt").is_none());
        assert!(string_to_short_name("file.json").is_none());
        assert!(string_to_short_name("").is_none());
    }

    fn synthetic_boot(cluster_count_target: u32) -> Vec<u8> {
        // Build a boot sector whose data region yields the requested
        // cluster count with one sector per cluster.
        let mut sector = vec![0u8; 512];
        sector[0] = 0xEB;
        sector[11..13].copy_from_slice(&512u16.to_le_bytes());
        sector[13] = 1; // sectors per cluster
        sector[14..16].copy_from_slice(&4u16.to_le_bytes()); // reserved
        sector[16] = 2; // fats
        let fat_size = 16u16;
        sector[22..24].copy_from_slice(&fat_size.to_le_bytes());
        let overhead = 4 + 2 * fat_size as u32;
        let total = overhead + cluster_count_target;
        sector[32..36].copy_from_slice(&total.to_le_bytes());
        // FAT16 boot signature
        sector[38] = 0x29;
        // FAT32 boot signature too, for threshold tests that cross over
        sector[66] = 0x29;
        sector[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn cluster_thresholds_choose_width() {
        let fat12 = synthetic_boot(4084);
        assert!(parse_geometry(&BootSector::new(&fat12).unwrap()).is_none());

        let fat16 = synthetic_boot(4085);
        let g = parse_geometry(&BootSector::new(&fat16).unwrap()).unwrap();
        assert_eq!(g.fat_type, FatType::Fat16);

        let fat32 = synthetic_boot(65525);
        let g = parse_geometry(&BootSector::new(&fat32).unwrap()).unwrap();
        assert_eq!(g.fat_type, FatType::Fat32);
    }

    #[test]
    fn probe_rejects_bad_boot_records() {
        let mut bad_jump = synthetic_boot(5000);
        bad_jump[0] = 0x00;
        assert!(parse_geometry(&BootSector::new(&bad_jump).unwrap()).is_none());

        let mut bad_sector_size = synthetic_boot(5000);
        bad_sector_size[11..13].copy_from_slice(&513u16.to_le_bytes());
        assert!(parse_geometry(&BootSector::new(&bad_sector_size).unwrap()).is_none());

        let mut too_many_fats = synthetic_boot(5000);
        too_many_fats[16] = 3;
        assert!(parse_geometry(&BootSector::new(&too_many_fats).unwrap()).is_none());

        let mut no_reserved = synthetic_boot(5000);
        no_reserved[14..16].copy_from_slice(&0u16.to_le_bytes());
        assert!(parse_geometry(&BootSector::new(&no_reserved).unwrap()).is_none());

        let mut no_signature = synthetic_boot(5000);
        no_signature[510] = 0;
        assert!(parse_geometry(&BootSector::new(&no_signature).unwrap()).is_none());
    }

    #[test]
    fn geometry_layout_adds_up() {
        let sector = synthetic_boot(5000);
        let g = parse_geometry(&BootSector::new(&sector).unwrap()).unwrap();
        assert_eq!(g.fat_start_sector, 4);
        assert_eq!(g.root_dir_sector, 4 + 2 * 16);
        assert_eq!(g.first_data_sector, g.root_dir_sector + g.root_dir_sectors);
        assert_eq!(g.cluster_size, 512);
    }
}
