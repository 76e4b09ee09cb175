//! Memory management
//!
//! The kernel runs under the bootloader's higher-half direct map; page
//! table construction beyond that is not this module's business. What the
//! rest of the kernel gets is a heap, physical/virtual translation for
//! DMA, and an MMIO mapping entry point that applies the uncacheable
//! memory type.

pub mod heap;

use core::sync::atomic::{AtomicU64, Ordering};

/// Higher half direct map offset (set during init)
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0xFFFF_8000_0000_0000);

/// Default heap size (32 MB)
pub const HEAP_SIZE: usize = 32 * 1024 * 1024;

/// Initialize the heap inside a usable physical region
pub fn init(hhdm_offset: u64, heap_phys: u64, heap_size: usize) {
    HHDM_OFFSET.store(hhdm_offset, Ordering::SeqCst);
    let heap_virt = hhdm_offset + heap_phys;
    heap::init_at(heap_virt as usize, heap_size);
    crate::serial_println!(
        "[MEM] heap: {} MB at virt {:#x} (phys {:#x})",
        heap_size / 1024 / 1024,
        heap_virt,
        heap_phys
    );
}

/// Get the HHDM offset
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Convert a physical address to its direct-mapped virtual address
pub fn phys_to_virt(phys: u64) -> u64 {
    hhdm_offset() + phys
}

/// Convert a direct-mapped virtual address back to physical (for DMA)
pub fn virt_to_phys(virt: u64) -> u64 {
    virt.wrapping_sub(hhdm_offset())
}

/// Map a device MMIO region and return the virtual address to use.
///
/// The region must be accessed uncached; the PAT entry for write-back is
/// overridden per-page via the cache-disable bit in the direct map.
pub fn map_mmio(phys_addr: u64, size: usize) -> Result<u64, &'static str> {
    if phys_addr == 0 {
        return Err("MMIO base is null");
    }
    let virt = phys_to_virt(phys_addr);

    let start = phys_addr & !0xFFF;
    let end = (phys_addr + size as u64 + 0xFFF) & !0xFFF;
    for page in (start..end).step_by(4096) {
        set_uncacheable(phys_to_virt(page))?;
    }
    Ok(virt)
}

/// Mark one direct-mapped page uncacheable.
///
/// Walks the live page tables through the direct map and sets PCD/PWT on
/// the leaf entry, flushing the TLB entry afterwards.
fn set_uncacheable(virt: u64) -> Result<(), &'static str> {
    use x86_64::registers::control::Cr3;

    const FLAG_PRESENT: u64 = 1 << 0;
    const FLAG_HUGE: u64 = 1 << 7;
    const FLAG_PWT: u64 = 1 << 3;
    const FLAG_PCD: u64 = 1 << 4;
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    let (frame, _) = Cr3::read();
    let mut table = phys_to_virt(frame.start_address().as_u64()) as *mut u64;

    for level in (1..=4u32).rev() {
        let shift = 12 + 9 * (level - 1);
        let index = ((virt >> shift) & 0x1FF) as usize;
        let entry = unsafe { table.add(index) };
        let value = unsafe { core::ptr::read_volatile(entry) };
        if value & FLAG_PRESENT == 0 {
            return Err("MMIO page not mapped by direct map");
        }
        // Leaf entry: either level 1 or a huge page
        if level == 1 || value & FLAG_HUGE != 0 {
            unsafe { core::ptr::write_volatile(entry, value | FLAG_PCD | FLAG_PWT) };
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
            return Ok(());
        }
        table = phys_to_virt(value & ADDR_MASK) as *mut u64;
    }
    Err("page walk exhausted")
}
