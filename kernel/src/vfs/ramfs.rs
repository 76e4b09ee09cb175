//! RAM filesystem
//!
//! Fully read/write, entirely heap-backed; the default root filesystem.
//! Directories keep an ordered child list, files grow their byte buffer
//! by doubling.

use super::{
    DirEntry, FileSystem, MountParams, NodeInfo, NodeKind, VfsError, VfsNode, VfsResult,
};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

/// One RAMFS node: file bytes or ordered children, never both
pub struct RamNode {
    name: Mutex<String>,
    kind: NodeKind,
    parent: Mutex<Option<Weak<RamNode>>>,
    content: Mutex<Vec<u8>>,
    children: Mutex<Vec<Arc<RamNode>>>,
}

impl RamNode {
    fn new(name: &str, kind: NodeKind) -> Arc<Self> {
        Arc::new(Self {
            name: Mutex::new(String::from(name)),
            kind,
            parent: Mutex::new(None),
            content: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        })
    }

    fn find_child(&self, name: &str) -> Option<Arc<RamNode>> {
        self.children
            .lock()
            .iter()
            .find(|c| *c.name.lock() == name)
            .cloned()
    }
}

impl VfsNode for RamNode {
    fn name(&self) -> String {
        self.name.lock().clone()
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn readonly(&self) -> bool {
        false
    }

    fn parent(&self) -> Option<Arc<dyn VfsNode>> {
        self.parent
            .lock()
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|p| p as Arc<dyn VfsNode>)
    }

    fn open(&self, mode: u32) -> VfsResult<()> {
        if self.kind == NodeKind::Directory && mode & super::OPEN_WRITE != 0 {
            return Err(VfsError::Access);
        }
        if mode & super::OPEN_TRUNC != 0 && self.kind == NodeKind::Regular {
            self.content.lock().clear();
        }
        Ok(())
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> VfsResult<usize> {
        if self.kind != NodeKind::Regular {
            return Err(VfsError::Invalid);
        }
        let content = self.content.lock();
        if offset >= content.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buffer.len().min(content.len() - start);
        buffer[..n].copy_from_slice(&content[start..start + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> VfsResult<usize> {
        if self.kind != NodeKind::Regular {
            return Err(VfsError::Invalid);
        }
        let end = offset as usize + buffer.len();
        let mut content = self.content.lock();
        if end > content.len() {
            // Grow by doubling to keep append sequences cheap
            let mut capacity = content.capacity().max(64);
            while capacity < end {
                capacity *= 2;
            }
            let additional = capacity - content.len();
            content.reserve(additional);
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(buffer);
        Ok(buffer.len())
    }

    fn truncate(&self, length: u64) -> VfsResult<()> {
        if self.kind != NodeKind::Regular {
            return Err(VfsError::Invalid);
        }
        self.content.lock().resize(length as usize, 0);
        Ok(())
    }

    fn readdir(&self, index: usize) -> VfsResult<DirEntry> {
        if self.kind != NodeKind::Directory {
            return Err(VfsError::Invalid);
        }
        let children = self.children.lock();
        let child = children.get(index).ok_or(VfsError::NotFound)?;
        let entry = DirEntry {
            name: child.name.lock().clone(),
            kind: child.kind,
        };
        Ok(entry)
    }

    fn lookup(self: Arc<Self>, name: &str) -> VfsResult<Arc<dyn VfsNode>> {
        if self.kind != NodeKind::Directory {
            return Err(VfsError::Invalid);
        }
        self.find_child(name)
            .map(|c| c as Arc<dyn VfsNode>)
            .ok_or(VfsError::NotFound)
    }

    fn create(self: Arc<Self>, name: &str, kind: NodeKind) -> VfsResult<Arc<dyn VfsNode>> {
        if self.kind != NodeKind::Directory {
            return Err(VfsError::Invalid);
        }
        if !matches!(kind, NodeKind::Regular | NodeKind::Directory) {
            return Err(VfsError::Unsupported);
        }
        if name.is_empty() || name.len() > super::NAME_MAX {
            return Err(VfsError::Invalid);
        }
        if self.find_child(name).is_some() {
            return Err(VfsError::Exists);
        }

        let child = RamNode::new(name, kind);
        *child.parent.lock() = Some(Arc::downgrade(&self));
        self.children.lock().push(child.clone());
        Ok(child as Arc<dyn VfsNode>)
    }

    fn remove(&self, name: &str) -> VfsResult<()> {
        if self.kind != NodeKind::Directory {
            return Err(VfsError::Invalid);
        }
        let mut children = self.children.lock();
        let index = children
            .iter()
            .position(|c| *c.name.lock() == name)
            .ok_or(VfsError::NotFound)?;
        if children[index].kind == NodeKind::Directory
            && !children[index].children.lock().is_empty()
        {
            return Err(VfsError::Busy);
        }
        children.remove(index);
        Ok(())
    }

    fn stat(&self) -> VfsResult<NodeInfo> {
        let size = match self.kind {
            NodeKind::Regular => self.content.lock().len() as u64,
            _ => 0,
        };
        Ok(NodeInfo {
            kind: self.kind,
            size,
            inode: self as *const _ as u64,
            readonly: false,
        })
    }
}

/// The RAMFS driver. Mount state is the root node alone; nodes own
/// their children so unmount drops the whole tree.
pub struct RamFs;

impl RamFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl FileSystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn probe(&self, params: &MountParams) -> bool {
        // Only device-less mounts make sense
        params.device.is_none() && params.volume.is_none()
    }

    fn mount(&self, _params: &MountParams) -> VfsResult<Arc<dyn VfsNode>> {
        Ok(RamNode::new("", NodeKind::Directory) as Arc<dyn VfsNode>)
    }

    fn unmount(&self, _root: &Arc<dyn VfsNode>) -> VfsResult<()> {
        // Dropping the root releases every node through the child lists
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::VfsNode;

    fn root() -> Arc<RamNode> {
        RamNode::new("", NodeKind::Directory)
    }

    #[test]
    fn create_lookup_remove_round_trip() {
        let root = root();
        root.clone().create("file.txt", NodeKind::Regular).unwrap();
        assert!(root.clone().lookup("file.txt").is_ok());
        root.remove("file.txt").unwrap();
        assert_eq!(
            root.clone().lookup("file.txt").unwrap_err(),
            VfsError::NotFound
        );
    }

    #[test]
    fn duplicate_create_is_exists() {
        let root = root();
        root.clone().create("a", NodeKind::Directory).unwrap();
        assert_eq!(
            root.clone().create("a", NodeKind::Regular).unwrap_err(),
            VfsError::Exists
        );
    }

    #[test]
    fn write_read_back_is_byte_exact() {
        let root = root();
        let file = root.clone().create("data", NodeKind::Regular).unwrap();
        let payload = b"the quick brown fox";
        assert_eq!(file.write(0, payload).unwrap(), payload.len());

        let mut back = [0u8; 32];
        let n = file.read(0, &mut back).unwrap();
        assert_eq!(&back[..n], payload);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let root = root();
        let file = root.clone().create("sparse", NodeKind::Regular).unwrap();
        file.write(4, b"x").unwrap();
        let mut back = [0xFFu8; 5];
        assert_eq!(file.read(0, &mut back).unwrap(), 5);
        assert_eq!(&back, &[0, 0, 0, 0, b'x']);
    }

    #[test]
    fn truncate_shrinks_and_grows() {
        let root = root();
        let file = root.clone().create("t", NodeKind::Regular).unwrap();
        file.write(0, b"abcdef").unwrap();
        file.truncate(3).unwrap();
        assert_eq!(file.stat().unwrap().size, 3);
        file.truncate(6).unwrap();
        let mut back = [0xAAu8; 6];
        file.read(0, &mut back).unwrap();
        assert_eq!(&back, b"abc\0\0\0");
    }

    #[test]
    fn non_empty_directory_refuses_removal() {
        let root = root();
        let dir = root.clone().create("d", NodeKind::Directory).unwrap();
        let dir_ram = root.clone().find_child("d").unwrap();
        dir_ram.clone().create("inner", NodeKind::Regular).unwrap();
        let _ = dir;
        assert_eq!(root.remove("d").unwrap_err(), VfsError::Busy);
    }

    #[test]
    fn readdir_walks_in_creation_order() {
        let root = root();
        root.clone().create("one", NodeKind::Regular).unwrap();
        root.clone().create("two", NodeKind::Directory).unwrap();
        assert_eq!(root.readdir(0).unwrap().name, "one");
        assert_eq!(root.readdir(1).unwrap().name, "two");
        assert_eq!(root.readdir(2).unwrap_err(), VfsError::NotFound);
    }

    #[test]
    fn parent_chain_reaches_root() {
        let root = root();
        root.clone().create("d", NodeKind::Directory).unwrap();
        let dir = root.clone().find_child("d").unwrap();
        let file = dir.clone().create("f", NodeKind::Regular).unwrap();
        let up = file.parent().unwrap();
        assert_eq!(up.name(), "d");
        let up2 = up.parent().unwrap();
        assert_eq!(up2.name(), "");
        assert!(up2.parent().is_none());
    }
}
