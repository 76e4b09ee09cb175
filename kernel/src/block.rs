//! Block device registry
//!
//! Storage drivers register named devices here; the volume manager and
//! filesystems only ever see this interface. Requests that reach past
//! the device's capacity fail before touching hardware.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

/// Disk or optical media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDeviceType {
    Disk,
    Cdrom,
}

/// Driver-side operations. `write`/`flush` default to unsupported for
/// read-only media.
pub trait BlockDeviceOps: Send + Sync {
    fn read(&self, lba: u64, count: u32, buffer: &mut [u8]) -> bool;
    fn write(&self, _lba: u64, _count: u32, _buffer: &[u8]) -> bool {
        false
    }
    fn flush(&self) -> bool {
        true
    }
}

/// A registered block device
pub struct BlockDevice {
    pub name: String,
    pub device_type: BlockDeviceType,
    pub logical_block_size: u32,
    pub total_blocks: u64,
    ops: Arc<dyn BlockDeviceOps>,
}

impl BlockDevice {
    /// Build a device without registering it
    pub fn new(
        name: &str,
        device_type: BlockDeviceType,
        logical_block_size: u32,
        total_blocks: u64,
        ops: Arc<dyn BlockDeviceOps>,
    ) -> Self {
        Self {
            name: String::from(name),
            device_type,
            logical_block_size: if logical_block_size == 0 {
                512
            } else {
                logical_block_size
            },
            total_blocks,
            ops,
        }
    }

    /// Read `count` blocks at `lba`. Rejected without hardware I/O when
    /// the range exceeds the device or the buffer is short.
    pub fn read(&self, lba: u64, count: u32, buffer: &mut [u8]) -> bool {
        if count == 0 {
            return false;
        }
        if lba.saturating_add(count as u64) > self.total_blocks {
            return false;
        }
        if buffer.len() < count as usize * self.logical_block_size as usize {
            return false;
        }
        self.ops.read(lba, count, buffer)
    }

    /// Write `count` blocks at `lba`, with the same range policing
    pub fn write(&self, lba: u64, count: u32, buffer: &[u8]) -> bool {
        if count == 0 {
            return false;
        }
        if lba.saturating_add(count as u64) > self.total_blocks {
            return false;
        }
        if buffer.len() < count as usize * self.logical_block_size as usize {
            return false;
        }
        self.ops.write(lba, count, buffer)
    }

    /// Flush any write-back cache
    pub fn flush(&self) -> bool {
        self.ops.flush()
    }
}

static REGISTRY: RwLock<Vec<Arc<BlockDevice>>> = RwLock::new(Vec::new());

/// Register a device. A duplicate name replaces the earlier entry.
pub fn register(
    name: &str,
    device_type: BlockDeviceType,
    logical_block_size: u32,
    total_blocks: u64,
    ops: Arc<dyn BlockDeviceOps>,
) -> Arc<BlockDevice> {
    let device = Arc::new(BlockDevice::new(
        name,
        device_type,
        logical_block_size,
        total_blocks,
        ops,
    ));

    let mut registry = REGISTRY.write();
    if let Some(slot) = registry.iter_mut().find(|d| d.name == name) {
        *slot = device.clone();
    } else {
        registry.push(device.clone());
    }

    crate::log!(
        "[BLK] registered '{}' ({:?}, {} x {} bytes)",
        name,
        device.device_type,
        device.total_blocks,
        device.logical_block_size
    );
    device
}

/// Number of registered devices
pub fn count() -> usize {
    REGISTRY.read().len()
}

/// Device by registration index
pub fn get_at(index: usize) -> Option<Arc<BlockDevice>> {
    REGISTRY.read().get(index).cloned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec;
    use spin::Mutex;

    /// RAM-backed device used across the storage tests
    pub(crate) struct MemDisk {
        pub data: Mutex<Vec<u8>>,
        pub block_size: usize,
    }

    impl MemDisk {
        pub fn new(blocks: usize, block_size: usize) -> Self {
            Self {
                data: Mutex::new(vec![0u8; blocks * block_size]),
                block_size,
            }
        }
    }

    impl BlockDeviceOps for MemDisk {
        fn read(&self, lba: u64, count: u32, buffer: &mut [u8]) -> bool {
            let start = lba as usize * self.block_size;
            let len = count as usize * self.block_size;
            let data = self.data.lock();
            if start + len > data.len() {
                return false;
            }
            buffer[..len].copy_from_slice(&data[start..start + len]);
            true
        }

        fn write(&self, lba: u64, count: u32, buffer: &[u8]) -> bool {
            let start = lba as usize * self.block_size;
            let len = count as usize * self.block_size;
            let mut data = self.data.lock();
            if start + len > data.len() {
                return false;
            }
            data[start..start + len].copy_from_slice(&buffer[..len]);
            true
        }
    }

    fn device(blocks: usize) -> BlockDevice {
        BlockDevice::new(
            "mem0",
            BlockDeviceType::Disk,
            512,
            blocks as u64,
            Arc::new(MemDisk::new(blocks, 512)),
        )
    }

    #[test]
    fn read_past_capacity_is_rejected() {
        let dev = device(8);
        let mut buf = [0u8; 512];
        assert!(!dev.read(8, 1, &mut buf));
        assert!(!dev.read(7, 2, &mut buf));
        assert!(dev.read(7, 1, &mut buf));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dev = device(8);
        let payload = [0xA5u8; 512];
        assert!(dev.write(3, 1, &payload));
        let mut back = [0u8; 512];
        assert!(dev.read(3, 1, &mut back));
        assert_eq!(back, payload);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let dev = device(8);
        let mut buf = [0u8; 256];
        assert!(!dev.read(0, 1, &mut buf));
    }

    #[test]
    fn zero_count_is_rejected() {
        let dev = device(8);
        let mut buf = [0u8; 512];
        assert!(!dev.read(0, 0, &mut buf));
    }
}
