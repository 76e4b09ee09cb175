//! NTFS filesystem (read-mostly)
//!
//! On-disk content is read-only: MFT records with fixup application,
//! resident and non-resident unnamed DATA attributes, and directory
//! listings from the resident INDEX_ROOT. INDEX_ALLOCATION is not
//! traversed, so very large directories list partially; the mount logs
//! that limitation. Nodes created at runtime are overlay nodes with
//! in-memory bytes and children, and those accept writes.

use super::{
    DirEntry, FileSystem, MountParams, NodeInfo, NodeKind, VfsError, VfsNode, VfsResult,
};
use crate::block::BlockDevice;
use crate::volume::Volume;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

const OEM_NTFS: &[u8; 8] = b"NTFS    ";
const RECORD_SIGNATURE: &[u8; 4] = b"FILE";

const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_INDEX_ROOT: u32 = 0x90;
const ATTR_END: u32 = 0xFFFF_FFFF;

const RECORD_FLAG_IN_USE: u16 = 0x0001;
const RECORD_FLAG_DIRECTORY: u16 = 0x0002;

const INDEX_ENTRY_FLAG_LAST: u32 = 0x02;

/// Index header flag: entries continue in INDEX_ALLOCATION sub-nodes
const INDEX_HEADER_FLAG_LARGE: u8 = 0x01;

/// Directory bit in FILE_NAME attribute flags
const FN_FLAG_DIRECTORY: u32 = 0x1000_0000;

/// Root directory's well-known MFT record number
const ROOT_FILE_REFERENCE: u64 = 5;

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Strip the sequence number from a file reference
fn reference_number(reference: u64) -> u64 {
    reference & 0x0000_FFFF_FFFF_FFFF
}

/// MFT record size: positive counts clusters, negative is a power of two
fn record_size(clusters: i8, bytes_per_cluster: u32) -> u32 {
    if clusters > 0 {
        clusters as u32 * bytes_per_cluster
    } else if clusters < 0 {
        let shift = -(clusters as i32);
        if shift >= 31 {
            0
        } else {
            1u32 << shift
        }
    } else {
        0
    }
}

/// One decoded data run: `length` clusters at absolute `lcn`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataRun {
    length: u64,
    lcn: i64,
}

/// Decode the compressed run list. Header byte: low nibble is the length
/// byte count, high nibble the byte count of the signed LCN delta.
fn parse_data_runs(data: &[u8]) -> Option<Vec<DataRun>> {
    let mut runs = Vec::new();
    let mut current_lcn: i64 = 0;
    let mut offset = 0usize;

    while offset < data.len() {
        let header = data[offset];
        offset += 1;
        if header == 0 {
            break;
        }
        let len_size = (header & 0x0F) as usize;
        let off_size = ((header >> 4) & 0x0F) as usize;
        if len_size == 0 || offset + len_size + off_size > data.len() {
            return None;
        }

        let mut run_length: u64 = 0;
        for i in 0..len_size {
            run_length |= (data[offset + i] as u64) << (i * 8);
        }
        offset += len_size;

        if off_size > 0 {
            let mut delta: i64 = 0;
            for i in 0..off_size {
                delta |= (data[offset + i] as i64) << (i * 8);
            }
            // Sign-extend the delta
            let sign_bit = 1i64 << (off_size * 8 - 1);
            if delta & sign_bit != 0 {
                delta |= -1i64 << (off_size * 8);
            }
            offset += off_size;
            current_lcn += delta;
        }

        runs.push(DataRun {
            length: run_length,
            lcn: current_lcn,
        });
    }

    if runs.is_empty() {
        None
    } else {
        Some(runs)
    }
}

/// Undo the update sequence fixups on a record buffer. The last two
/// bytes of each sector must carry the sequence tag.
fn apply_fixups(buffer: &mut [u8], bytes_per_sector: u32) -> bool {
    if buffer.len() < bytes_per_sector as usize {
        return false;
    }
    let fixup_offset = u16_at(buffer, 4) as usize;
    let fixup_entries = u16_at(buffer, 6) as usize;
    if fixup_entries == 0 {
        return true;
    }
    if fixup_offset + fixup_entries * 2 > buffer.len() {
        return false;
    }

    let expected = u16_at(buffer, fixup_offset);
    for i in 0..fixup_entries - 1 {
        let sector_tail = (i + 1) * bytes_per_sector as usize - 2;
        if sector_tail + 2 > buffer.len() {
            return false;
        }
        if u16_at(buffer, sector_tail) != expected {
            return false;
        }
        let replacement = u16_at(buffer, fixup_offset + (i + 1) * 2);
        buffer[sector_tail..sector_tail + 2].copy_from_slice(&replacement.to_le_bytes());
    }
    true
}

/// Decode a UTF-16LE name, transliterating non-ASCII to '?'
fn decode_utf16le(bytes: &[u8], chars: usize) -> String {
    let mut out = String::new();
    for i in 0..chars {
        if (i + 1) * 2 > bytes.len() {
            break;
        }
        let ch = u16_at(bytes, i * 2);
        out.push(if ch < 0x80 { ch as u8 as char } else { '?' });
    }
    out
}

/// Walk the attributes of a record, yielding (type, offset) pairs
struct AttributeIter<'a> {
    record: &'a [u8],
    offset: usize,
}

impl<'a> AttributeIter<'a> {
    fn new(record: &'a [u8]) -> Self {
        let first = u16_at(record, 20) as usize;
        Self {
            record,
            offset: first,
        }
    }
}

impl<'a> Iterator for AttributeIter<'a> {
    type Item = (u32, usize);

    fn next(&mut self) -> Option<(u32, usize)> {
        if self.offset + 8 > self.record.len() {
            return None;
        }
        let attr_type = u32_at(self.record, self.offset);
        if attr_type == ATTR_END {
            return None;
        }
        let length = u32_at(self.record, self.offset + 4) as usize;
        if length == 0 || self.offset + length > self.record.len() {
            return None;
        }
        let current = self.offset;
        self.offset += length;
        Some((attr_type, current))
    }
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
            512
        } else {
            size
        }
    }
}

/// Per-mount NTFS state
struct NtfsVolume {
    backing: Backing,
    block_size: u32,
    bytes_per_sector: u32,
    bytes_per_cluster: u32,
    mft_record_size: u32,
    mft_lcn: u64,
    mft_runs: Vec<DataRun>,
    nodes: Mutex<Vec<Arc<NtfsNode>>>,
    /// Whether the INDEX_ALLOCATION truncation has been reported yet
    partial_listing_logged: AtomicBool,
}

impl NtfsVolume {
    /// Byte-granular read through the block interface
    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> bool {
        if buffer.is_empty() {
            return false;
        }
        let block = self.block_size as u64;
        let start_block = offset / block;
        let end_block = (offset + buffer.len() as u64 + block - 1) / block;
        let count = (end_block - start_block) as u32;

        let mut temp = vec![0u8; (count as u64 * block) as usize];
        if !self.backing.read_sectors(start_block, count, &mut temp) {
            return false;
        }
        let skip = (offset - start_block * block) as usize;
        buffer.copy_from_slice(&temp[skip..skip + buffer.len()]);
        true
    }

    /// Read and validate one MFT record through the $MFT run list
    fn read_mft_record(&self, record_index: u64, buffer: &mut [u8]) -> bool {
        if self.mft_runs.is_empty() {
            let offset = self.mft_lcn * self.bytes_per_cluster as u64
                + record_index * self.mft_record_size as u64;
            if !self.read_bytes(offset, buffer) {
                return false;
            }
        } else {
            let mut relative = record_index * self.mft_record_size as u64;
            let mut remaining = self.mft_record_size as u64;
            let mut written = 0usize;

            for run in &self.mft_runs {
                if remaining == 0 {
                    break;
                }
                let run_bytes = run.length * self.bytes_per_cluster as u64;
                if relative >= run_bytes {
                    relative -= run_bytes;
                    continue;
                }
                let in_run = run_bytes - relative;
                let chunk = in_run.min(remaining) as usize;
                let disk_offset =
                    run.lcn as u64 * self.bytes_per_cluster as u64 + relative;
                if !self.read_bytes(disk_offset, &mut buffer[written..written + chunk]) {
                    return false;
                }
                written += chunk;
                remaining -= chunk as u64;
                relative = 0;
            }
            if remaining > 0 {
                return false;
            }
        }

        if !apply_fixups(buffer, self.bytes_per_sector) {
            return false;
        }
        if &buffer[..4] != RECORD_SIGNATURE {
            return false;
        }
        u16_at(buffer, 22) & RECORD_FLAG_IN_USE != 0
    }
}

/// Metadata extracted from one MFT record
struct RecordInfo {
    name: String,
    is_directory: bool,
    size: u64,
    parent_reference: u64,
}

/// Read name, kind, size and parent from a record's attributes
fn populate_record_info(volume: &NtfsVolume, file_ref: u64) -> Option<RecordInfo> {
    let mut record = vec![0u8; volume.mft_record_size as usize];
    if !volume.read_mft_record(reference_number(file_ref), &mut record) {
        return None;
    }

    let mut info = RecordInfo {
        name: String::new(),
        is_directory: u16_at(&record, 22) & RECORD_FLAG_DIRECTORY != 0,
        size: 0,
        parent_reference: 0,
    };

    for (attr_type, at) in AttributeIter::new(&record) {
        match attr_type {
            ATTR_FILE_NAME => {
                let value_offset = u16_at(&record, at + 20) as usize;
                let value = at + value_offset;
                if value + 66 > record.len() {
                    continue;
                }
                info.parent_reference = reference_number(u64_at(&record, value));
                info.size = u64_at(&record, value + 48);
                let name_len = record[value + 64] as usize;
                info.name = decode_utf16le(&record[value + 66..], name_len);
            }
            ATTR_DATA => {
                let non_resident = record[at + 8] != 0;
                if non_resident {
                    info.size = u64_at(&record, at + 48);
                } else {
                    info.size = u32_at(&record, at + 16) as u64;
                }
            }
            _ => {}
        }
    }

    Some(info)
}

/// The unnamed DATA attribute: either a resident copy of the bytes or a
/// run list with the attribute's data size.
enum DataAttr {
    Resident(Vec<u8>),
    NonResident { runs: Vec<DataRun>, size: u64 },
}

fn fetch_data_attr(volume: &NtfsVolume, file_ref: u64) -> Option<DataAttr> {
    let mut record = vec![0u8; volume.mft_record_size as usize];
    if !volume.read_mft_record(reference_number(file_ref), &mut record) {
        return None;
    }

    for (attr_type, at) in AttributeIter::new(&record) {
        if attr_type != ATTR_DATA {
            continue;
        }
        // Only the unnamed stream
        if record[at + 9] != 0 {
            continue;
        }

        let non_resident = record[at + 8] != 0;
        if non_resident {
            let run_offset = u16_at(&record, at + 32) as usize;
            let length = u32_at(&record, at + 4) as usize;
            let size = u64_at(&record, at + 48);
            let runs = parse_data_runs(&record[at + run_offset..at + length])?;
            return Some(DataAttr::NonResident { runs, size });
        } else {
            let value_length = u32_at(&record, at + 16) as usize;
            let value_offset = u16_at(&record, at + 20) as usize;
            let value = &record[at + value_offset..at + value_offset + value_length];
            return Some(DataAttr::Resident(value.to_vec()));
        }
    }
    None
}

/// One entry surfaced from a directory index
struct IndexHit {
    name: String,
    file_reference: u64,
    is_directory: bool,
}

#[derive(Clone, Copy)]
enum IndexTarget<'a> {
    Nth(usize),
    Named(&'a str),
}

/// Walk the resident INDEX_ROOT of a directory record. Subnodes in
/// INDEX_ALLOCATION are not followed.
fn enumerate_index_root(
    volume: &NtfsVolume,
    dir_ref: u64,
    target: IndexTarget,
) -> Option<IndexHit> {
    let mut record = vec![0u8; volume.mft_record_size as usize];
    if !volume.read_mft_record(reference_number(dir_ref), &mut record) {
        return None;
    }

    for (attr_type, at) in AttributeIter::new(&record) {
        if attr_type != ATTR_INDEX_ROOT {
            continue;
        }
        if record[at + 8] != 0 {
            continue; // INDEX_ROOT is always resident
        }
        let value_offset = u16_at(&record, at + 20) as usize;
        let value = at + value_offset;

        // IndexRootHeader is 16 bytes, then the index header
        let index_header = value + 16;
        if index_header + 16 > record.len() {
            continue;
        }
        let entries_offset = u32_at(&record, index_header) as usize;
        let entries_size = u32_at(&record, index_header + 4) as usize;
        let entries = index_header + entries_offset;

        // Entries spilling into INDEX_ALLOCATION are not followed: the
        // listing below is partial. Say so, once per volume.
        if record[index_header + 12] & INDEX_HEADER_FLAG_LARGE != 0
            && !volume.partial_listing_logged.swap(true, Ordering::SeqCst)
        {
            crate::log_warn!(
                "[NTFS] directory record {} spills into INDEX_ALLOCATION; \
                 listings cover INDEX_ROOT entries only",
                reference_number(dir_ref)
            );
        }

        let mut logical_index = 0usize;
        let mut offset = 0usize;
        while offset < entries_size {
            let entry = entries + offset;
            if entry + 16 > record.len() {
                break;
            }
            let entry_size = u16_at(&record, entry + 8) as usize;
            let stream_size = u16_at(&record, entry + 10) as usize;
            let flags = u32_at(&record, entry + 12);
            if entry_size < 16 {
                break;
            }

            // 66 bytes of FILE_NAME header before the name itself
            if stream_size >= 66 && entry + 16 + stream_size <= record.len() {
                let fname = entry + 16;
                let file_reference = reference_number(u64_at(&record, entry));
                let fn_flags = u32_at(&record, fname + 56);
                let name_len = record[fname + 64] as usize;
                let name = decode_utf16le(&record[fname + 66..], name_len);

                let find_name = matches!(target, IndexTarget::Named(_));
                let skip = name.is_empty()
                    || name == "."
                    || (!find_name && name == "..");

                if !skip {
                    match target {
                        IndexTarget::Named(wanted) => {
                            if name == wanted {
                                return Some(IndexHit {
                                    name,
                                    file_reference,
                                    is_directory: fn_flags & FN_FLAG_DIRECTORY != 0,
                                });
                            }
                        }
                        IndexTarget::Nth(wanted) => {
                            if logical_index == wanted {
                                return Some(IndexHit {
                                    name,
                                    file_reference,
                                    is_directory: fn_flags & FN_FLAG_DIRECTORY != 0,
                                });
                            }
                            logical_index += 1;
                        }
                    }
                }
            }

            if flags & INDEX_ENTRY_FLAG_LAST != 0 {
                break;
            }
            offset += entry_size;
        }
    }
    None
}

/// Count listable INDEX_ROOT entries of a directory
fn index_root_count(volume: &NtfsVolume, dir_ref: u64) -> usize {
    let mut count = 0usize;
    while enumerate_index_root(volume, dir_ref, IndexTarget::Nth(count)).is_some() {
        count += 1;
    }
    count
}

/// One NTFS node. Disk-backed nodes are immutable; overlay nodes keep
/// their bytes and children in memory.
struct NtfsNode {
    volume: Arc<NtfsVolume>,
    name: String,
    is_directory: bool,
    parent: Mutex<Option<Weak<NtfsNode>>>,
    file_reference: u64,
    size: Mutex<u64>,
    overlay: bool,
    overlay_data: Mutex<Vec<u8>>,
    overlay_children: Mutex<Vec<Arc<NtfsNode>>>,
}

impl NtfsNode {
    #[allow(clippy::too_many_arguments)]
    fn alloc(
        volume: &Arc<NtfsVolume>,
        parent: Option<&Arc<NtfsNode>>,
        name: &str,
        is_directory: bool,
        file_reference: u64,
        size: u64,
        overlay: bool,
    ) -> Arc<NtfsNode> {
        let node = Arc::new(NtfsNode {
            volume: volume.clone(),
            name: String::from(name),
            is_directory,
            parent: Mutex::new(parent.map(Arc::downgrade)),
            file_reference,
            size: Mutex::new(size),
            overlay,
            overlay_data: Mutex::new(Vec::new()),
            overlay_children: Mutex::new(Vec::new()),
        });
        volume.nodes.lock().push(node.clone());
        node
    }

    fn overlay_find_child(&self, name: &str) -> Option<Arc<NtfsNode>> {
        self.overlay_children
            .lock()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Find a previously surfaced node for the same record under the
    /// same parent, so repeated lookups share one node.
    fn find_cached(&self, file_reference: u64) -> Option<Arc<NtfsNode>> {
        self.volume
            .nodes
            .lock()
            .iter()
            .find(|n| {
                !n.overlay
                    && n.file_reference == file_reference
                    && n.parent
                        .lock()
                        .as_ref()
                        .and_then(|w| w.upgrade())
                        .map(|p| p.file_reference == self.file_reference)
                        .unwrap_or(false)
            })
            .cloned()
    }
}

impl VfsNode for NtfsNode {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> NodeKind {
        if self.is_directory {
            NodeKind::Directory
        } else {
            NodeKind::Regular
        }
    }

    fn readonly(&self) -> bool {
        !self.overlay
    }

    fn parent(&self) -> Option<Arc<dyn VfsNode>> {
        self.parent
            .lock()
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|p| p as Arc<dyn VfsNode>)
    }

    fn open(&self, mode: u32) -> VfsResult<()> {
        let wants_write =
            mode & (super::OPEN_WRITE | super::OPEN_APPEND | super::OPEN_TRUNC) != 0;
        if !self.overlay && wants_write {
            return Err(VfsError::Access);
        }
        if self.overlay {
            if self.is_directory && wants_write {
                return Err(VfsError::Access);
            }
            if mode & super::OPEN_TRUNC != 0 {
                self.overlay_data.lock().clear();
                *self.size.lock() = 0;
            }
        }
        Ok(())
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> VfsResult<usize> {
        if self.is_directory {
            return Err(VfsError::Invalid);
        }

        if self.overlay {
            let data = self.overlay_data.lock();
            if offset >= data.len() as u64 {
                return Ok(0);
            }
            let start = offset as usize;
            let n = buffer.len().min(data.len() - start);
            buffer[..n].copy_from_slice(&data[start..start + n]);
            return Ok(n);
        }

        let attr = fetch_data_attr(&self.volume, self.file_reference).ok_or(VfsError::Io)?;
        match attr {
            DataAttr::Resident(bytes) => {
                if offset >= bytes.len() as u64 {
                    return Ok(0);
                }
                let start = offset as usize;
                let n = buffer.len().min(bytes.len() - start);
                buffer[..n].copy_from_slice(&bytes[start..start + n]);
                Ok(n)
            }
            DataAttr::NonResident { runs, size } => {
                if offset >= size {
                    return Ok(0);
                }
                let to_read = buffer.len().min((size - offset) as usize);
                let cluster = self.volume.bytes_per_cluster as u64;
                let mut remaining = to_read;
                let mut relative = offset;
                let mut written = 0usize;

                for run in &runs {
                    if remaining == 0 {
                        break;
                    }
                    let run_bytes = run.length * cluster;
                    if relative >= run_bytes {
                        relative -= run_bytes;
                        continue;
                    }
                    let in_run = run_bytes - relative;
                    let chunk = in_run.min(remaining as u64) as usize;
                    let disk_offset = run.lcn as u64 * cluster + relative;
                    if !self
                        .volume
                        .read_bytes(disk_offset, &mut buffer[written..written + chunk])
                    {
                        return Err(VfsError::Io);
                    }
                    written += chunk;
                    remaining -= chunk;
                    relative = 0;
                }
                Ok(written)
            }
        }
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> VfsResult<usize> {
        if self.is_directory {
            return Err(VfsError::Invalid);
        }
        if !self.overlay {
            // Persistent writes are out of this driver's scope
            return Err(VfsError::Access);
        }

        let end = offset as usize + buffer.len();
        let mut data = self.overlay_data.lock();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buffer);
        *self.size.lock() = data.len() as u64;
        Ok(buffer.len())
    }

    fn truncate(&self, length: u64) -> VfsResult<()> {
        if self.is_directory {
            return Err(VfsError::Invalid);
        }
        if !self.overlay {
            return Err(VfsError::Unsupported);
        }
        self.overlay_data.lock().resize(length as usize, 0);
        *self.size.lock() = length;
        Ok(())
    }

    fn readdir(&self, index: usize) -> VfsResult<DirEntry> {
        if !self.is_directory {
            return Err(VfsError::Invalid);
        }

        // "." and ".." lead every listing
        if index == 0 {
            return Ok(DirEntry {
                name: String::from("."),
                kind: NodeKind::Directory,
            });
        }
        if index == 1 {
            return Ok(DirEntry {
                name: String::from(".."),
                kind: NodeKind::Directory,
            });
        }
        let adjusted = index - 2;

        let disk_count = if self.overlay {
            0
        } else {
            if let Some(hit) =
                enumerate_index_root(&self.volume, self.file_reference, IndexTarget::Nth(adjusted))
            {
                return Ok(DirEntry {
                    name: hit.name,
                    kind: if hit.is_directory {
                        NodeKind::Directory
                    } else {
                        NodeKind::Regular
                    },
                });
            }
            index_root_count(&self.volume, self.file_reference)
        };

        let overlay_index = adjusted - disk_count.min(adjusted);
        let children = self.overlay_children.lock();
        let child = children.get(overlay_index).ok_or(VfsError::NotFound)?;
        Ok(DirEntry {
            name: child.name.clone(),
            kind: child.kind(),
        })
    }

    fn lookup(self: Arc<Self>, name: &str) -> VfsResult<Arc<dyn VfsNode>> {
        if !self.is_directory {
            return Err(VfsError::Invalid);
        }

        if let Some(child) = self.overlay_find_child(name) {
            return Ok(child as Arc<dyn VfsNode>);
        }
        if self.overlay {
            return Err(VfsError::NotFound);
        }

        let hit = enumerate_index_root(&self.volume, self.file_reference, IndexTarget::Named(name))
            .ok_or(VfsError::NotFound)?;

        if let Some(existing) = self.find_cached(hit.file_reference) {
            return Ok(existing as Arc<dyn VfsNode>);
        }

        let info =
            populate_record_info(&self.volume, hit.file_reference).ok_or(VfsError::Error)?;
        let child = NtfsNode::alloc(
            &self.volume,
            Some(&self),
            &hit.name,
            info.is_directory,
            hit.file_reference,
            info.size,
            false,
        );
        Ok(child as Arc<dyn VfsNode>)
    }

    fn create(self: Arc<Self>, name: &str, kind: NodeKind) -> VfsResult<Arc<dyn VfsNode>> {
        if !self.is_directory {
            return Err(VfsError::Invalid);
        }
        if name.is_empty() || name.len() > super::NAME_MAX {
            return Err(VfsError::Invalid);
        }
        if !matches!(kind, NodeKind::Regular | NodeKind::Directory) {
            return Err(VfsError::Unsupported);
        }
        if self.overlay_find_child(name).is_some() {
            return Err(VfsError::Exists);
        }
        if !self.overlay
            && enumerate_index_root(&self.volume, self.file_reference, IndexTarget::Named(name))
                .is_some()
        {
            return Err(VfsError::Exists);
        }

        let child = NtfsNode::alloc(
            &self.volume,
            Some(&self),
            name,
            kind == NodeKind::Directory,
            0,
            0,
            true,
        );
        self.overlay_children.lock().push(child.clone());
        Ok(child as Arc<dyn VfsNode>)
    }

    fn remove(&self, _name: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    fn stat(&self) -> VfsResult<NodeInfo> {
        Ok(NodeInfo {
            kind: self.kind(),
            size: *self.size.lock(),
            inode: self.file_reference,
            readonly: !self.overlay,
        })
    }
}

/// Boot sector field accessors
struct NtfsBoot<'a> {
    bytes: &'a [u8],
}

impl<'a> NtfsBoot<'a> {
    fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < 512 {
            return None;
        }
        Some(Self { bytes })
    }

    fn oem(&self) -> &[u8] {
        &self.bytes[3..11]
    }
    fn bytes_per_sector(&self) -> u16 {
        u16_at(self.bytes, 11)
    }
    fn sectors_per_cluster(&self) -> u8 {
        self.bytes[13]
    }
    fn mft_lcn(&self) -> u64 {
        u64_at(self.bytes, 48)
    }
    fn clusters_per_file_record(&self) -> i8 {
        self.bytes[64] as i8
    }
}

/// The NTFS driver
pub struct NtfsFs;

impl NtfsFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

fn read_boot(params: &MountParams) -> Option<Vec<u8>> {
    let backing = Backing::from_params(params)?;
    let block_size = backing.block_size().max(512);
    let mut sector = vec![0u8; block_size as usize];
    if !backing.read_sectors(0, 1, &mut sector) {
        return None;
    }
    Some(sector)
}

impl FileSystem for NtfsFs {
    fn name(&self) -> &'static str {
        "ntfs"
    }

    fn probe(&self, params: &MountParams) -> bool {
        let Some(sector) = read_boot(params) else {
            return false;
        };
        let Some(boot) = NtfsBoot::new(&sector) else {
            return false;
        };
        boot.oem() == OEM_NTFS
            && boot.bytes_per_sector() != 0
            && boot.sectors_per_cluster() != 0
    }

    fn mount(&self, params: &MountParams) -> VfsResult<Arc<dyn VfsNode>> {
        let sector = read_boot(params).ok_or(VfsError::Io)?;
        let boot = NtfsBoot::new(&sector).ok_or(VfsError::Unsupported)?;
        if boot.oem() != OEM_NTFS {
            return Err(VfsError::Unsupported);
        }

        let bytes_per_sector = boot.bytes_per_sector() as u32;
        let sectors_per_cluster = boot.sectors_per_cluster() as u32;
        let bytes_per_cluster = bytes_per_sector * sectors_per_cluster;
        let mft_record_size = record_size(boot.clusters_per_file_record(), bytes_per_cluster);
        if bytes_per_sector == 0 || sectors_per_cluster == 0 || mft_record_size == 0 {
            return Err(VfsError::Unsupported);
        }

        let backing = Backing::from_params(params).ok_or(VfsError::Invalid)?;
        let block_size = backing.block_size();
        let mut volume = NtfsVolume {
            backing,
            block_size,
            bytes_per_sector,
            bytes_per_cluster,
            mft_record_size,
            mft_lcn: boot.mft_lcn(),
            mft_runs: Vec::new(),
            nodes: Mutex::new(Vec::new()),
            partial_listing_logged: AtomicBool::new(false),
        };

        // $MFT's own run list comes from record 0's unnamed DATA
        let mut record = vec![0u8; mft_record_size as usize];
        if volume.read_mft_record(0, &mut record) {
            for (attr_type, at) in AttributeIter::new(&record) {
                if attr_type == ATTR_DATA && record[at + 8] != 0 {
                    let run_offset = u16_at(&record, at + 32) as usize;
                    let length = u32_at(&record, at + 4) as usize;
                    if let Some(runs) = parse_data_runs(&record[at + run_offset..at + length]) {
                        volume.mft_runs = runs;
                    }
                    break;
                }
            }
        }
        if volume.mft_runs.is_empty() {
            // Cover the front of the MFT from the boot sector's LCN
            volume.mft_runs.push(DataRun {
                length: 16,
                lcn: volume.mft_lcn as i64,
            });
        }

        let volume = Arc::new(volume);
        let root = NtfsNode::alloc(
            &volume,
            None,
            "",
            true,
            ROOT_FILE_REFERENCE,
            0,
            false,
        );

        crate::log!(
            "[NTFS] mounted '{}' (sector={} cluster={} record={})",
            params.source.as_deref().unwrap_or("disk"),
            bytes_per_sector,
            bytes_per_cluster,
            mft_record_size
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
    fn record_size_positive_counts_clusters() {
        assert_eq!(record_size(1, 4096), 4096);
        assert_eq!(record_size(2, 4096), 8192);
    }

    #[test]
    fn record_size_negative_is_power_of_two() {
        assert_eq!(record_size(-10, 4096), 1024);
        assert_eq!(record_size(-12, 65536), 4096);
        assert_eq!(record_size(0, 4096), 0);
    }

    #[test]
    fn data_runs_decode_positive_offsets() {
        // len=0x18 clusters, lcn delta = 0x345678 ; then end
        let data = [0x31, 0x18, 0x78, 0x56, 0x34, 0x00];
        let runs = parse_data_runs(&data).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0], DataRun { length: 0x18, lcn: 0x345678 });
    }

    #[test]
    fn data_runs_sign_extend_negative_offsets() {
        // Run 1: 4 clusters at LCN 0x100; run 2: 2 clusters at delta -0x10
        let data = [0x21, 0x04, 0x00, 0x01, 0x11, 0x02, 0xF0, 0x00];
        let runs = parse_data_runs(&data).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], DataRun { length: 4, lcn: 0x100 });
        assert_eq!(runs[1], DataRun { length: 2, lcn: 0x100 - 0x10 });
    }

    #[test]
    fn data_runs_reject_truncated_input() {
        let data = [0x31, 0x18, 0x78];
        assert!(parse_data_runs(&data).is_none());
    }

    #[test]
    fn fixups_restore_sector_tails() {
        let mut record = vec![0u8; 1024];
        // Header: fixup array at 0x30, 3 entries (tag + 2 sectors)
        record[4..6].copy_from_slice(&0x30u16.to_le_bytes());
        record[6..8].copy_from_slice(&3u16.to_le_bytes());
        // Tag and replacements
        record[0x30..0x32].copy_from_slice(&0xBEEFu16.to_le_bytes());
        record[0x32..0x34].copy_from_slice(&0x1111u16.to_le_bytes());
        record[0x34..0x36].copy_from_slice(&0x2222u16.to_le_bytes());
        // Sector tails carry the tag
        record[510..512].copy_from_slice(&0xBEEFu16.to_le_bytes());
        record[1022..1024].copy_from_slice(&0xBEEFu16.to_le_bytes());

        assert!(apply_fixups(&mut record, 512));
        assert_eq!(u16_at(&record, 510), 0x1111);
        assert_eq!(u16_at(&record, 1022), 0x2222);
    }

    #[test]
    fn fixups_detect_torn_sectors() {
        let mut record = vec![0u8; 1024];
        record[4..6].copy_from_slice(&0x30u16.to_le_bytes());
        record[6..8].copy_from_slice(&3u16.to_le_bytes());
        record[0x30..0x32].copy_from_slice(&0xBEEFu16.to_le_bytes());
        // First tail does not match the tag
        record[510..512].copy_from_slice(&0xDEADu16.to_le_bytes());
        record[1022..1024].copy_from_slice(&0xBEEFu16.to_le_bytes());
        assert!(!apply_fixups(&mut record, 512));
    }

    #[test]
    fn utf16_names_transliterate() {
        let bytes: Vec<u8> = "abc"
            .encode_utf16()
            .chain(core::iter::once(0x00E9)) // é
            .flat_map(|c| c.to_le_bytes())
            .collect();
        assert_eq!(decode_utf16le(&bytes, 4), "abc?");
    }

    #[test]
    fn reference_masks_sequence() {
        assert_eq!(reference_number(0x0005_0000_0000_002A), 0x2A);
    }
}
