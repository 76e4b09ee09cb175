//! Kernel heap allocator

use linked_list_allocator::LockedHeap;

// Host test builds keep the platform allocator
#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the heap at a fixed virtual address
pub fn init_at(heap_start: usize, heap_size: usize) {
    unsafe {
        ALLOCATOR.lock().init(heap_start as *mut u8, heap_size);
    }
}

/// Bytes currently allocated
pub fn used() -> usize {
    ALLOCATOR.lock().used()
}

/// Bytes still free
pub fn free() -> usize {
    ALLOCATOR.lock().free()
}

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("allocation failed: {:?}", layout)
}
