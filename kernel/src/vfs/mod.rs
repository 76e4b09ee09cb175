//! Virtual file system
//!
//! A path-based namespace over pluggable filesystem drivers. Paths are
//! normalized at every entry point, mounts are chosen by longest prefix,
//! resolution walks the node tree through each filesystem's `lookup`,
//! and an LRU cache short-circuits repeated resolutions. Filesystems own
//! their nodes; the core only keeps shared references.

pub mod fat;
pub mod iso9660;
pub mod ntfs;
pub mod ramfs;

use crate::block::BlockDevice;
use crate::volume::Volume;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::{Mutex, RwLock};

/// Longest single path segment
pub const NAME_MAX: usize = 255;
/// Longest accepted path
pub const PATH_MAX: usize = 4096;

/// Default resolution cache capacity
const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Error taxonomy shared by the core and every driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    /// Bad argument (relative path, wrong node kind, ...)
    Invalid,
    NotFound,
    Exists,
    Busy,
    NoSpace,
    NoMemory,
    /// Write to a read-only node or missing open mode
    Access,
    Unsupported,
    /// Hardware failure underneath the filesystem
    Io,
    Error,
}

pub type VfsResult<T> = Result<T, VfsError>;

/// Node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Regular,
    Directory,
    Symlink,
    Device,
    Unknown,
}

/// Stat payload
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub size: u64,
    pub inode: u64,
    pub readonly: bool,
}

/// One directory listing entry
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// Open modes
pub const OPEN_READ: u32 = 1 << 0;
pub const OPEN_WRITE: u32 = 1 << 1;
pub const OPEN_APPEND: u32 = 1 << 2;
pub const OPEN_TRUNC: u32 = 1 << 3;

/// Seek origins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// Polymorphic node interface. Each filesystem implements this on its
/// own node type, which owns the per-node state; parents are non-owning
/// back-references so the filesystem's flat node list is the single
/// owner.
pub trait VfsNode: Send + Sync {
    fn name(&self) -> String;
    fn kind(&self) -> NodeKind;
    fn readonly(&self) -> bool {
        true
    }
    fn parent(&self) -> Option<Arc<dyn VfsNode>>;

    fn open(&self, _mode: u32) -> VfsResult<()> {
        Ok(())
    }
    fn close(&self) -> VfsResult<()> {
        Ok(())
    }
    fn read(&self, _offset: u64, _buffer: &mut [u8]) -> VfsResult<usize> {
        Err(VfsError::Unsupported)
    }
    fn write(&self, _offset: u64, _buffer: &[u8]) -> VfsResult<usize> {
        Err(VfsError::Access)
    }
    fn truncate(&self, _length: u64) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }
    /// Entry at `index`; `NotFound` terminates a listing
    fn readdir(&self, _index: usize) -> VfsResult<DirEntry> {
        Err(VfsError::Unsupported)
    }
    fn lookup(self: Arc<Self>, _name: &str) -> VfsResult<Arc<dyn VfsNode>> {
        Err(VfsError::Unsupported)
    }
    fn create(self: Arc<Self>, _name: &str, _kind: NodeKind) -> VfsResult<Arc<dyn VfsNode>> {
        Err(VfsError::Unsupported)
    }
    fn remove(&self, _name: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }
    fn stat(&self) -> VfsResult<NodeInfo>;
}

impl fmt::Debug for dyn VfsNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfsNode")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// What a filesystem gets to mount from
pub struct MountParams {
    pub source: Option<String>,
    pub device: Option<Arc<BlockDevice>>,
    pub volume: Option<Arc<Volume>>,
    pub flags: u32,
}

impl MountParams {
    pub fn for_volume(volume: Arc<Volume>) -> Self {
        Self {
            source: Some(volume.name.clone()),
            device: Some(volume.device.clone()),
            volume: Some(volume),
            flags: 0,
        }
    }

    pub fn for_device(device: Arc<BlockDevice>) -> Self {
        Self {
            source: Some(device.name.clone()),
            device: Some(device),
            volume: None,
            flags: 0,
        }
    }

    pub fn empty() -> Self {
        Self {
            source: None,
            device: None,
            volume: None,
            flags: 0,
        }
    }
}

/// Filesystem driver interface
pub trait FileSystem: Send + Sync {
    fn name(&self) -> &'static str;
    /// Cheap content sniff used by auto-mounting
    fn probe(&self, params: &MountParams) -> bool;
    fn mount(&self, params: &MountParams) -> VfsResult<Arc<dyn VfsNode>>;
    /// Teardown walks every node the filesystem allocated exactly once
    fn unmount(&self, root: &Arc<dyn VfsNode>) -> VfsResult<()>;
}

/// An attached mount
pub struct VfsMount {
    pub path: String,
    pub fs: Arc<dyn FileSystem>,
    pub root: Arc<dyn VfsNode>,
    pub flags: u32,
}

impl fmt::Debug for VfsMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfsMount")
            .field("path", &self.path)
            .field("root", &self.root)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
    pub capacity: usize,
}

/// LRU map from normalized path to node. Front of the list is the most
/// recently used entry.
struct VfsCache {
    entries: Vec<(String, Arc<dyn VfsNode>)>,
    capacity: usize,
    hits: usize,
    misses: usize,
}

impl VfsCache {
    const fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    fn lookup(&mut self, path: &str) -> Option<Arc<dyn VfsNode>> {
        if self.capacity == 0 {
            self.misses += 1;
            return None;
        }
        if let Some(index) = self.entries.iter().position(|(p, _)| p == path) {
            let entry = self.entries.remove(index);
            let node = entry.1.clone();
            self.entries.insert(0, entry);
            self.hits += 1;
            Some(node)
        } else {
            self.misses += 1;
            None
        }
    }

    fn insert(&mut self, path: &str, node: Arc<dyn VfsNode>) {
        if self.capacity == 0 {
            return;
        }
        if let Some(index) = self.entries.iter().position(|(p, _)| p == path) {
            self.entries.remove(index);
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop();
        }
        self.entries.insert(0, (path.to_string(), node));
    }

    fn remove_exact(&mut self, path: &str) {
        self.entries.retain(|(p, _)| p != path);
    }

    fn remove_prefix(&mut self, prefix: &str) {
        self.entries.retain(|(p, _)| !path_is_under(p, prefix));
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.entries.len() > capacity {
            self.entries.pop();
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
            capacity: self.capacity,
        }
    }
}

/// Whether `path` equals `prefix` or lives underneath it
fn path_is_under(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    let Some(rest) = path.strip_prefix(prefix) else {
        return false;
    };
    rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/')
}

static FILESYSTEMS: RwLock<Vec<Arc<dyn FileSystem>>> = RwLock::new(Vec::new());
static MOUNTS: RwLock<Vec<Arc<VfsMount>>> = RwLock::new(Vec::new());
static CACHE: Mutex<VfsCache> = Mutex::new(VfsCache::new(DEFAULT_CACHE_CAPACITY));

/// Normalize an absolute path into its canonical form: collapse repeated
/// separators, fold `.`, pop one level per `..`. Empty and relative
/// paths are invalid through this API.
pub fn normalize_path(path: &str) -> VfsResult<String> {
    if path.is_empty() {
        return Err(VfsError::Invalid);
    }
    if !path.starts_with('/') {
        return Err(VfsError::Invalid);
    }
    if path.len() > PATH_MAX {
        return Err(VfsError::NoSpace);
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => {
                if other.len() > NAME_MAX {
                    return Err(VfsError::Invalid);
                }
                segments.push(other);
            }
        }
    }

    if segments.is_empty() {
        return Ok(String::from("/"));
    }

    let mut out = String::with_capacity(path.len());
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    if out.len() > PATH_MAX {
        return Err(VfsError::NoSpace);
    }
    Ok(out)
}

/// Register a filesystem driver. Names are unique.
pub fn register_filesystem(fs: Arc<dyn FileSystem>) -> VfsResult<()> {
    let mut list = FILESYSTEMS.write();
    if list.iter().any(|f| f.name() == fs.name()) {
        return Err(VfsError::Exists);
    }
    crate::log!("[VFS] registered filesystem '{}'", fs.name());
    list.push(fs);
    Ok(())
}

/// Find a registered filesystem by name
pub fn get_filesystem(name: &str) -> Option<Arc<dyn FileSystem>> {
    FILESYSTEMS.read().iter().find(|f| f.name() == name).cloned()
}

/// Choose the mount whose path is the longest prefix of `path` ending at
/// a `/` boundary. `/` always matches.
fn select_mount(path: &str) -> Option<Arc<VfsMount>> {
    let mounts = MOUNTS.read();
    let mut best: Option<Arc<VfsMount>> = None;
    let mut best_len = 0usize;
    for mount in mounts.iter() {
        let mlen = mount.path.len();
        if mlen > path.len() {
            continue;
        }
        if !path.starts_with(mount.path.as_str()) {
            continue;
        }
        if mlen != 1 && path.len() > mlen && path.as_bytes()[mlen] != b'/' {
            continue;
        }
        if best.is_none() || mlen > best_len {
            best_len = mlen;
            best = Some(mount.clone());
        }
    }
    best
}

/// Walk `relative` from `start`, resolving `.`/`..` against the parent
/// chain and delegating everything else to the node's `lookup`.
fn walk(start: Arc<dyn VfsNode>, relative: &str) -> VfsResult<Arc<dyn VfsNode>> {
    let mut current = start;
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if let Some(parent) = current.parent() {
                    current = parent;
                }
            }
            name => {
                if name.len() > NAME_MAX {
                    return Err(VfsError::Invalid);
                }
                if current.kind() != NodeKind::Directory {
                    return Err(VfsError::Invalid);
                }
                current = current.clone().lookup(name)?;
            }
        }
    }
    Ok(current)
}

/// Resolve a normalized-or-raw absolute path to a node
pub fn resolve(path: &str) -> VfsResult<Arc<dyn VfsNode>> {
    let normalized = normalize_path(path)?;

    if let Some(node) = CACHE.lock().lookup(&normalized) {
        return Ok(node);
    }

    let mount = select_mount(&normalized).ok_or(VfsError::NotFound)?;
    let relative = if mount.path == "/" {
        normalized.trim_start_matches('/')
    } else {
        normalized[mount.path.len()..].trim_start_matches('/')
    };

    let node = if relative.is_empty() {
        mount.root.clone()
    } else {
        walk(mount.root.clone(), relative)?
    };

    CACHE.lock().insert(&normalized, node.clone());
    Ok(node)
}

/// Mount a filesystem at `target`
pub fn mount(
    target: &str,
    fs: Arc<dyn FileSystem>,
    params: &MountParams,
) -> VfsResult<Arc<VfsMount>> {
    let normalized = normalize_path(target)?;

    {
        let mounts = MOUNTS.read();
        if mounts.iter().any(|m| m.path == normalized) {
            crate::log_warn!("[VFS] '{}' already mounted", normalized);
            return Err(VfsError::Exists);
        }
    }

    let root = fs.mount(params)?;

    let mount = Arc::new(VfsMount {
        path: normalized.clone(),
        fs: fs.clone(),
        root: root.clone(),
        flags: params.flags,
    });
    MOUNTS.write().push(mount.clone());

    let mut cache = CACHE.lock();
    cache.remove_prefix(&normalized);
    cache.insert(&normalized, root);
    drop(cache);

    crate::log!("[VFS] mounted '{}' at '{}'", fs.name(), normalized);
    Ok(mount)
}

/// Probe registered filesystems in order and mount the first match
pub fn mount_auto(target: &str, params: &MountParams) -> VfsResult<Arc<VfsMount>> {
    let filesystems: Vec<Arc<dyn FileSystem>> = FILESYSTEMS.read().clone();
    for fs in filesystems {
        if !fs.probe(params) {
            continue;
        }
        match mount(target, fs, params) {
            Ok(mount) => return Ok(mount),
            Err(VfsError::Exists) => return Err(VfsError::Exists),
            Err(_) => continue,
        }
    }
    Err(VfsError::NotFound)
}

/// Detach a mount. The root mount is busy by definition.
pub fn unmount(target: &str) -> VfsResult<()> {
    let normalized = normalize_path(target)?;
    if normalized == "/" {
        return Err(VfsError::Busy);
    }

    let mount = {
        let mut mounts = MOUNTS.write();
        let index = mounts
            .iter()
            .position(|m| m.path == normalized)
            .ok_or(VfsError::NotFound)?;
        mounts.remove(index)
    };

    let result = mount.fs.unmount(&mount.root);
    CACHE.lock().remove_prefix(&normalized);
    result
}

/// Look up an attached mount by path
pub fn get_mount(target: &str) -> Option<Arc<VfsMount>> {
    let normalized = normalize_path(target).ok()?;
    MOUNTS.read().iter().find(|m| m.path == normalized).cloned()
}

/// An open file. Offset advances on `read`/`write` only.
pub struct FileHandle {
    node: Arc<dyn VfsNode>,
    mode: u32,
    offset: u64,
}

impl FileHandle {
    fn can_read(&self) -> bool {
        // No explicit mode bits means default read-only
        self.mode & OPEN_READ != 0 || self.mode & (OPEN_READ | OPEN_WRITE) == 0
    }

    fn can_write(&self) -> bool {
        self.mode & OPEN_WRITE != 0
    }

    pub fn node(&self) -> &Arc<dyn VfsNode> {
        &self.node
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Explicit close; dropping the handle does the same
    pub fn close(self) {}

    pub fn read(&mut self, buffer: &mut [u8]) -> VfsResult<usize> {
        if buffer.is_empty() {
            return Err(VfsError::Invalid);
        }
        if !self.can_read() {
            return Err(VfsError::Access);
        }
        let n = self.node.read(self.offset, buffer)?;
        self.offset += n as u64;
        Ok(n)
    }

    pub fn read_at(&self, offset: u64, buffer: &mut [u8]) -> VfsResult<usize> {
        if buffer.is_empty() {
            return Err(VfsError::Invalid);
        }
        if !self.can_read() {
            return Err(VfsError::Access);
        }
        self.node.read(offset, buffer)
    }

    pub fn write(&mut self, buffer: &[u8]) -> VfsResult<usize> {
        if buffer.is_empty() {
            return Err(VfsError::Invalid);
        }
        if !self.can_write() {
            return Err(VfsError::Access);
        }
        let n = self.node.write(self.offset, buffer)?;
        self.offset += n as u64;
        Ok(n)
    }

    pub fn write_at(&self, offset: u64, buffer: &[u8]) -> VfsResult<usize> {
        if buffer.is_empty() {
            return Err(VfsError::Invalid);
        }
        if !self.can_write() {
            return Err(VfsError::Access);
        }
        self.node.write(offset, buffer)
    }

    pub fn truncate(&self, length: u64) -> VfsResult<()> {
        if !self.can_write() {
            return Err(VfsError::Access);
        }
        self.node.truncate(length)
    }

    pub fn seek(&mut self, offset: i64, whence: SeekWhence) -> VfsResult<u64> {
        let new_offset = match whence {
            SeekWhence::Set => {
                if offset < 0 {
                    return Err(VfsError::Invalid);
                }
                offset as u64
            }
            SeekWhence::Cur => {
                if offset < 0 && (-offset) as u64 > self.offset {
                    return Err(VfsError::Invalid);
                }
                self.offset.wrapping_add_signed(offset)
            }
            SeekWhence::End => {
                let size = self.node.stat()?.size;
                if offset < 0 && (-offset) as u64 > size {
                    return Err(VfsError::Invalid);
                }
                size.wrapping_add_signed(offset)
            }
        };
        self.offset = new_offset;
        Ok(self.offset)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let _ = self.node.close();
    }
}

/// Open a path. The node's own `open` hook may refuse the mode.
pub fn open(path: &str, mode: u32) -> VfsResult<FileHandle> {
    let node = resolve(path)?;
    node.open(mode)?;
    Ok(FileHandle {
        node,
        mode,
        offset: 0,
    })
}

/// Create a regular file or directory at an absolute path
pub fn create(path: &str, kind: NodeKind) -> VfsResult<()> {
    if kind == NodeKind::Unknown {
        return Err(VfsError::Invalid);
    }
    let normalized = normalize_path(path)?;
    if normalized == "/" {
        return Err(VfsError::Exists);
    }

    let (parent_path, name) = split_parent(&normalized)?;
    let parent = resolve(parent_path)?;
    CACHE.lock().remove_exact(&normalized);
    parent.create(name, kind).map(|_| ())
}

/// Remove the node at an absolute path
pub fn remove(path: &str) -> VfsResult<()> {
    let normalized = normalize_path(path)?;
    if normalized == "/" {
        return Err(VfsError::Busy);
    }

    let (parent_path, name) = split_parent(&normalized)?;
    let parent = resolve(parent_path)?;
    CACHE.lock().remove_prefix(&normalized);
    parent.remove(name)
}

/// Split a normalized path into parent and final segment
fn split_parent(normalized: &str) -> VfsResult<(&str, &str)> {
    let separator = normalized.rfind('/').ok_or(VfsError::Invalid)?;
    let name = &normalized[separator + 1..];
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(VfsError::Invalid);
    }
    let parent = if separator == 0 {
        "/"
    } else {
        &normalized[..separator]
    };
    Ok((parent, name))
}

/// Whether a directory exists at `path`
pub fn directory_exists(path: &str) -> bool {
    matches!(resolve(path), Ok(node) if node.kind() == NodeKind::Directory)
}

/// Whether a regular file (or symlink) exists at `path`
pub fn file_exists(path: &str) -> bool {
    matches!(
        resolve(path),
        Ok(node) if matches!(node.kind(), NodeKind::Regular | NodeKind::Symlink)
    )
}

/// List a directory by iterating `readdir` until `NotFound`
pub fn get_directory_contents(path: &str) -> VfsResult<Vec<DirEntry>> {
    let node = resolve(path)?;
    if node.kind() != NodeKind::Directory {
        return Err(VfsError::Invalid);
    }
    let mut entries = Vec::new();
    let mut index = 0usize;
    loop {
        match node.readdir(index) {
            Ok(entry) => entries.push(entry),
            Err(VfsError::NotFound) => break,
            Err(e) => return Err(e),
        }
        index += 1;
    }
    Ok(entries)
}

/// Cache statistics snapshot
pub fn cache_stats() -> CacheStats {
    CACHE.lock().stats()
}

/// Resize the resolution cache; zero disables it
pub fn cache_set_capacity(capacity: usize) {
    CACHE.lock().set_capacity(capacity);
}

/// Drop every cached entry
pub fn cache_flush() {
    CACHE.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------- normalization --------

    #[test]
    fn normalize_canonical_examples() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("/a//b").unwrap(), "/a/b");
        assert_eq!(normalize_path("/a/../b").unwrap(), "/b");
        assert_eq!(normalize_path("/../a").unwrap(), "/a");
        assert_eq!(normalize_path("/a/./b/../c//d").unwrap(), "/a/c/d");
    }

    #[test]
    fn normalize_rejects_empty_and_relative() {
        assert_eq!(normalize_path(""), Err(VfsError::Invalid));
        assert_eq!(normalize_path("a"), Err(VfsError::Invalid));
        assert_eq!(normalize_path("relative/path"), Err(VfsError::Invalid));
    }

    #[test]
    fn normalize_is_idempotent() {
        for path in ["/", "/a/b/c", "/a//.././b", "/mnt/sd0/file.txt"] {
            let once = normalize_path(path).unwrap();
            let twice = normalize_path(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn normalize_enforces_name_max() {
        let long = alloc::format!("/{}", "x".repeat(NAME_MAX + 1));
        assert_eq!(normalize_path(&long), Err(VfsError::Invalid));
        let fits = alloc::format!("/{}", "x".repeat(NAME_MAX));
        assert!(normalize_path(&fits).is_ok());
    }

    // -------- prefix predicate --------

    #[test]
    fn path_under_prefix_respects_boundaries() {
        assert!(path_is_under("/mnt/sd0", "/mnt/sd0"));
        assert!(path_is_under("/mnt/sd0/dir", "/mnt/sd0"));
        assert!(!path_is_under("/mnt/sd01", "/mnt/sd0"));
        assert!(path_is_under("/anything", "/"));
        assert!(!path_is_under("/mnt", "/mnt/sd0"));
    }

    // -------- cache --------

    struct StubNode {
        name: &'static str,
    }

    impl VfsNode for StubNode {
        fn name(&self) -> String {
            String::from(self.name)
        }
        fn kind(&self) -> NodeKind {
            NodeKind::Regular
        }
        fn parent(&self) -> Option<Arc<dyn VfsNode>> {
            None
        }
        fn stat(&self) -> VfsResult<NodeInfo> {
            Ok(NodeInfo {
                kind: NodeKind::Regular,
                size: 0,
                inode: 0,
                readonly: true,
            })
        }
    }

    fn stub(name: &'static str) -> Arc<dyn VfsNode> {
        Arc::new(StubNode { name })
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = VfsCache::new(2);
        assert!(cache.lookup("/a").is_none());
        cache.insert("/a", stub("a"));
        assert!(cache.lookup("/b").is_none());
        cache.insert("/b", stub("b"));
        assert!(cache.lookup("/c").is_none());
        cache.insert("/c", stub("c"));

        // Capacity 2: /a fell off the tail; /c and /b remain
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.hits, 0);
        assert!(cache.lookup("/c").is_some());
        assert!(cache.lookup("/b").is_some());
        assert!(cache.lookup("/a").is_none());
    }

    #[test]
    fn cache_hit_moves_entry_to_front() {
        let mut cache = VfsCache::new(2);
        cache.insert("/a", stub("a"));
        cache.insert("/b", stub("b"));
        assert!(cache.lookup("/a").is_some());
        // Insert evicting the tail: /b goes, /a stays
        cache.insert("/c", stub("c"));
        assert!(cache.lookup("/a").is_some());
        assert!(cache.lookup("/b").is_none());
    }

    #[test]
    fn cache_prefix_removal_takes_subtree() {
        let mut cache = VfsCache::new(8);
        cache.insert("/mnt/sd0", stub("root"));
        cache.insert("/mnt/sd0/a", stub("a"));
        cache.insert("/mnt/sd0/a/b", stub("b"));
        cache.insert("/mnt/sd1", stub("other"));
        cache.remove_prefix("/mnt/sd0");
        assert_eq!(cache.stats().entries, 1);
        // Only the sibling survives
        assert!(cache.lookup("/mnt/sd1").is_some());
    }

    #[test]
    fn cache_capacity_zero_disables() {
        let mut cache = VfsCache::new(0);
        cache.insert("/a", stub("a"));
        assert!(cache.lookup("/a").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    // -------- parent splitting --------

    #[test]
    fn split_parent_examples() {
        assert_eq!(split_parent("/a").unwrap(), ("/", "a"));
        assert_eq!(split_parent("/a/b/c").unwrap(), ("/a/b", "c"));
    }

    // -------- whole-namespace lifecycle --------
    //
    // One test drives the global mount table end to end; the global
    // state keeps this as a single function.

    #[test]
    fn root_namespace_lifecycle() {
        let ramfs = super::ramfs::RamFs::new();
        let _ = register_filesystem(ramfs.clone());
        mount("/", ramfs.clone(), &MountParams::empty()).unwrap();

        // Mounting / twice reports Exists
        assert_eq!(
            mount("/", ramfs.clone(), &MountParams::empty()).unwrap_err(),
            VfsError::Exists
        );
        // Unmounting / is Busy
        assert_eq!(unmount("/").unwrap_err(), VfsError::Busy);

        // Empty and relative resolves are Invalid
        assert_eq!(resolve("").unwrap_err(), VfsError::Invalid);
        assert_eq!(resolve("relative").unwrap_err(), VfsError::Invalid);

        assert!(directory_exists("/"));
        assert!(!directory_exists("/mnt"));

        // Build a small tree and push bytes through a handle
        create("/tmp", NodeKind::Directory).unwrap();
        create("/tmp/hello.txt", NodeKind::Regular).unwrap();
        {
            let mut handle = open("/tmp/hello.txt", OPEN_WRITE).unwrap();
            assert_eq!(handle.write(b"hello ferrite").unwrap(), 13);
            // A write-only handle refuses reads
            let mut scratch = [0u8; 4];
            assert_eq!(handle.read_at(0, &mut scratch).unwrap_err(), VfsError::Access);
        }
        {
            let mut handle = open("/tmp/hello.txt", OPEN_READ).unwrap();
            let mut back = [0u8; 32];
            let n = handle.read(&mut back).unwrap();
            assert_eq!(&back[..n], b"hello ferrite");
            assert_eq!(handle.offset(), 13);
            assert_eq!(handle.seek(-13, SeekWhence::Cur).unwrap(), 0);
            assert_eq!(handle.seek(0, SeekWhence::End).unwrap(), 13);
            assert_eq!(handle.seek(-14, SeekWhence::End).unwrap_err(), VfsError::Invalid);
        }

        // Normalized aliases resolve to the same node
        assert!(file_exists("/tmp/../tmp/./hello.txt"));

        // create + remove leaves the namespace as before
        create("/tmp/ephemeral", NodeKind::Regular).unwrap();
        assert!(file_exists("/tmp/ephemeral"));
        remove("/tmp/ephemeral").unwrap();
        assert!(!file_exists("/tmp/ephemeral"));

        let listing = get_directory_contents("/tmp").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "hello.txt");

        remove("/tmp/hello.txt").unwrap();
        remove("/tmp").unwrap();

        cache_flush();
        assert_eq!(cache_stats().entries, 0);
    }
}
