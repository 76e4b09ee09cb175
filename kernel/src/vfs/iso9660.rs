//! ISO9660 filesystem (read-only)
//!
//! The primary volume descriptor is found by scanning LBA 16 onward;
//! directory records are walked block-by-block with a zero length byte
//! meaning "advance to the next block". Identifiers lose their `;n`
//! version suffix and fold to lowercase.

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

const DESCRIPTOR_PRIMARY: u8 = 1;
const DESCRIPTOR_TERMINATOR: u8 = 255;
const STANDARD_ID: &[u8; 5] = b"CD001";

/// Volume descriptor scan window
const DESCRIPTOR_FIRST_LBA: u32 = 16;
const DESCRIPTOR_SCAN_SPAN: u32 = 64;

const FLAG_DIRECTORY: u8 = 0x02;

/// Fixed part of a directory record before the identifier
const DIR_RECORD_HEADER_LEN: usize = 33;

fn u16_lsb(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_lsb(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// One parsed directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedRecord {
    pub extent_lba: u32,
    pub data_length: u32,
    pub flags: u8,
    pub name: String,
}

/// Normalize a raw identifier: cut at `;`, lowercase, trim padding
pub(crate) fn normalize_identifier(raw: &[u8]) -> String {
    let mut out = String::new();
    for &b in raw {
        if b == b';' || b == 0 {
            break;
        }
        out.push((b as char).to_ascii_lowercase());
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Parse the record at `offset` in a directory block. Returns the
/// record's total length and, for listable entries, the parsed record.
/// Length zero means the rest of the block is padding.
pub(crate) fn parse_dir_record(block: &[u8], offset: usize) -> Option<(usize, Option<ParsedRecord>)> {
    if offset >= block.len() {
        return None;
    }
    let length = block[offset] as usize;
    if length == 0 {
        return Some((0, None));
    }
    if offset + length > block.len() || length < DIR_RECORD_HEADER_LEN {
        return None;
    }

    let record = &block[offset..offset + length];
    let identifier_len = record[32] as usize;
    if DIR_RECORD_HEADER_LEN + identifier_len > length {
        return None;
    }
    let identifier = &record[DIR_RECORD_HEADER_LEN..DIR_RECORD_HEADER_LEN + identifier_len];

    // Identifier 0 and 1 are this directory and its parent
    let is_special = identifier_len == 1 && (identifier[0] == 0 || identifier[0] == 1);
    if is_special {
        return Some((length, None));
    }

    let name = normalize_identifier(identifier);
    if name.is_empty() {
        return Some((length, None));
    }

    Some((
        length,
        Some(ParsedRecord {
            extent_lba: u32_lsb(record, 2),
            data_length: u32_lsb(record, 10),
            flags: record[25],
            name,
        }),
    ))
}

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

    fn block_size(&self) -> u32 {
        let size = match self {
            Backing::Volume(v) => v.block_size,
            Backing::Device(d) => d.logical_block_size,
        };
        if size == 0 {
            2048
        } else {
            size
        }
    }
}

struct IsoVolume {
    backing: Backing,
    block_size: u32,
    nodes: Mutex<Vec<Arc<IsoNode>>>,
}

impl IsoVolume {
    fn read_block(&self, lba: u32, buffer: &mut [u8]) -> bool {
        self.backing.read_sectors(lba as u64, 1, buffer)
    }
}

/// Walk a directory extent, calling `visit` per listable record until it
/// returns false. Returns false only on I/O or structural failure.
fn iterate_directory(
    volume: &IsoVolume,
    extent_lba: u32,
    data_length: u32,
    mut visit: impl FnMut(&ParsedRecord) -> bool,
) -> bool {
    if data_length == 0 {
        return true;
    }
    let block_size = volume.block_size as usize;
    let mut block = vec![0u8; block_size];
    let total_blocks = (data_length as usize + block_size - 1) / block_size;

    for block_index in 0..total_blocks {
        if !volume.read_block(extent_lba + block_index as u32, &mut block) {
            return false;
        }

        let mut pos = 0usize;
        while pos < block_size {
            let absolute = block_index * block_size + pos;
            if absolute >= data_length as usize {
                break;
            }
            match parse_dir_record(&block, pos) {
                Some((0, _)) => break, // padding to the next block
                Some((length, record)) => {
                    if absolute + length > data_length as usize {
                        return false; // record overflows the directory
                    }
                    if let Some(record) = record {
                        if !visit(&record) {
                            return true;
                        }
                    }
                    pos += length;
                }
                None => return false,
            }
        }
    }
    true
}

struct IsoNode {
    volume: Arc<IsoVolume>,
    name: String,
    kind: NodeKind,
    parent: Mutex<Option<Weak<IsoNode>>>,
    extent_lba: u32,
    data_length: u32,
}

impl IsoNode {
    fn alloc(
        volume: &Arc<IsoVolume>,
        parent: Option<&Arc<IsoNode>>,
        name: &str,
        kind: NodeKind,
        extent_lba: u32,
        data_length: u32,
    ) -> Arc<IsoNode> {
        let node = Arc::new(IsoNode {
            volume: volume.clone(),
            name: String::from(name),
            kind,
            parent: Mutex::new(parent.map(Arc::downgrade)),
            extent_lba,
            data_length,
        });
        volume.nodes.lock().push(node.clone());
        node
    }
}

impl VfsNode for IsoNode {
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
        if self.kind == NodeKind::Directory {
            return Err(VfsError::Invalid);
        }
        if offset >= self.data_length as u64 {
            return Ok(0);
        }

        let to_read = buffer.len().min((self.data_length as u64 - offset) as usize);
        let block_size = self.volume.block_size as usize;
        let mut temp = vec![0u8; block_size];
        let mut total = 0usize;

        while total < to_read {
            let absolute = offset + total as u64;
            let lba = self.extent_lba + (absolute / block_size as u64) as u32;
            let intra = (absolute % block_size as u64) as usize;
            let chunk = (to_read - total).min(block_size - intra);

            // Aligned whole-block spans go straight into the caller
            if intra == 0 && chunk == block_size && to_read - total >= block_size {
                let blocks = ((to_read - total) / block_size) as u32;
                if !self
                    .volume
                    .backing
                    .read_sectors(lba as u64, blocks, &mut buffer[total..])
                {
                    crate::log_warn!("[ISO9660] bulk read failed at lba {}", lba);
                    break;
                }
                total += blocks as usize * block_size;
                continue;
            }

            if !self.volume.read_block(lba, &mut temp) {
                crate::log_warn!("[ISO9660] read failed at lba {}", lba);
                break;
            }
            buffer[total..total + chunk].copy_from_slice(&temp[intra..intra + chunk]);
            total += chunk;
        }

        Ok(total)
    }

    fn readdir(&self, index: usize) -> VfsResult<DirEntry> {
        if self.kind != NodeKind::Directory {
            return Err(VfsError::Invalid);
        }

        let mut current = 0usize;
        let mut found: Option<ParsedRecord> = None;
        let ok = iterate_directory(&self.volume, self.extent_lba, self.data_length, |record| {
            if current == index {
                found = Some(record.clone());
                return false;
            }
            current += 1;
            true
        });
        if !ok {
            return Err(VfsError::Io);
        }

        let record = found.ok_or(VfsError::NotFound)?;
        Ok(DirEntry {
            name: record.name,
            kind: if record.flags & FLAG_DIRECTORY != 0 {
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

        let mut found: Option<ParsedRecord> = None;
        let ok = iterate_directory(&self.volume, self.extent_lba, self.data_length, |record| {
            if record.name.eq_ignore_ascii_case(name) {
                found = Some(record.clone());
                return false;
            }
            true
        });
        if !ok {
            return Err(VfsError::Io);
        }

        let record = found.ok_or(VfsError::NotFound)?;
        let kind = if record.flags & FLAG_DIRECTORY != 0 {
            NodeKind::Directory
        } else {
            NodeKind::Regular
        };
        let child = IsoNode::alloc(
            &self.volume,
            Some(&self),
            &record.name,
            kind,
            record.extent_lba,
            record.data_length,
        );
        Ok(child as Arc<dyn VfsNode>)
    }

    fn stat(&self) -> VfsResult<NodeInfo> {
        Ok(NodeInfo {
            kind: self.kind,
            size: self.data_length as u64,
            inode: self.extent_lba as u64,
            readonly: true,
        })
    }
}

/// The ISO9660 driver
pub struct IsoFs;

impl IsoFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl FileSystem for IsoFs {
    fn name(&self) -> &'static str {
        "iso9660"
    }

    fn probe(&self, params: &MountParams) -> bool {
        let Some(backing) = Backing::from_params(params) else {
            return false;
        };
        let block_size = backing.block_size();
        let mut sector = vec![0u8; block_size as usize];
        if !backing.read_sectors(DESCRIPTOR_FIRST_LBA as u64, 1, &mut sector) {
            return false;
        }
        &sector[1..6] == STANDARD_ID
            && (sector[0] == DESCRIPTOR_PRIMARY || sector[0] == 0)
    }

    fn mount(&self, params: &MountParams) -> VfsResult<Arc<dyn VfsNode>> {
        let backing = Backing::from_params(params).ok_or(VfsError::Invalid)?;
        let block_size = backing.block_size();
        let mut sector = vec![0u8; block_size as usize];

        // Hunt for the primary volume descriptor
        let mut primary: Option<Vec<u8>> = None;
        for lba in DESCRIPTOR_FIRST_LBA..DESCRIPTOR_FIRST_LBA + DESCRIPTOR_SCAN_SPAN {
            if !backing.read_sectors(lba as u64, 1, &mut sector) {
                return Err(VfsError::Io);
            }
            if &sector[1..6] != STANDARD_ID {
                if sector[0] == DESCRIPTOR_TERMINATOR {
                    break;
                }
                continue;
            }
            if sector[0] == DESCRIPTOR_PRIMARY {
                primary = Some(sector.clone());
                break;
            }
            if sector[0] == DESCRIPTOR_TERMINATOR {
                break;
            }
        }
        let primary = primary.ok_or(VfsError::Unsupported)?;

        let descriptor_block_size = u16_lsb(&primary, 128) as u32;
        if descriptor_block_size != 0 && descriptor_block_size != block_size {
            crate::log!(
                "[ISO9660] descriptor block size {} differs from device {}, using device",
                descriptor_block_size,
                block_size
            );
        }

        let volume = Arc::new(IsoVolume {
            backing,
            block_size,
            nodes: Mutex::new(Vec::new()),
        });

        // Root directory record sits at offset 156 of the PVD
        let root_record = &primary[156..156 + 34];
        let extent_lba = u32_lsb(root_record, 2);
        let data_length = u32_lsb(root_record, 10);

        let root = IsoNode::alloc(&volume, None, "", NodeKind::Directory, extent_lba, data_length);

        crate::log!(
            "[ISO9660] mounted '{}' (root extent={} size={})",
            params.source.as_deref().unwrap_or("cdrom"),
            extent_lba,
            data_length
        );
        Ok(root as Arc<dyn VfsNode>)
    }

    fn unmount(&self, _root: &Arc<dyn VfsNode>) -> VfsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_lose_version_and_case() {
        assert_eq!(normalize_identifier(b"README.TXT;1"), "readme.txt");
        assert_eq!(normalize_identifier(b"BOOT"), "boot");
        assert_eq!(normalize_identifier(b"PAD   "), "pad");
    }

    fn make_record(name: &[u8], extent: u32, length: u32, flags: u8) -> Vec<u8> {
        let total = DIR_RECORD_HEADER_LEN + name.len();
        let total = total + (total & 1); // records are even-padded
        let mut rec = vec![0u8; total];
        rec[0] = total as u8;
        rec[2..6].copy_from_slice(&extent.to_le_bytes());
        rec[6..10].copy_from_slice(&extent.to_be_bytes());
        rec[10..14].copy_from_slice(&length.to_le_bytes());
        rec[14..18].copy_from_slice(&length.to_be_bytes());
        rec[25] = flags;
        rec[32] = name.len() as u8;
        rec[DIR_RECORD_HEADER_LEN..DIR_RECORD_HEADER_LEN + name.len()].copy_from_slice(name);
        rec
    }

    #[test]
    fn directory_records_parse() {
        let rec = make_record(b"HELLO.TXT;1", 0x40, 1234, 0);
        let (len, parsed) = parse_dir_record(&rec, 0).unwrap();
        assert_eq!(len, rec.len());
        let parsed = parsed.unwrap();
        assert_eq!(parsed.name, "hello.txt");
        assert_eq!(parsed.extent_lba, 0x40);
        assert_eq!(parsed.data_length, 1234);
    }

    #[test]
    fn special_identifiers_are_skipped() {
        let this_dir = make_record(&[0], 0x10, 2048, FLAG_DIRECTORY);
        let (_, parsed) = parse_dir_record(&this_dir, 0).unwrap();
        assert!(parsed.is_none());

        let parent_dir = make_record(&[1], 0x10, 2048, FLAG_DIRECTORY);
        let (_, parsed) = parse_dir_record(&parent_dir, 0).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn zero_length_means_block_padding() {
        let block = vec![0u8; 64];
        let (len, parsed) = parse_dir_record(&block, 0).unwrap();
        assert_eq!(len, 0);
        assert!(parsed.is_none());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut rec = make_record(b"FILE", 1, 1, 0);
        let keep = rec.len() - 2;
        rec[0] = (keep + 4) as u8; // length overruns the buffer
        rec.truncate(keep);
        assert!(parse_dir_record(&rec, 0).is_none());
    }
}
