//! Kernel heap.
//!
//! The global allocator on bare metal is a linked-list heap living in the
//! kernel heap window `[KHEAP_START, kheap_break)`. The window is grown
//! through `vm::resize_kernel_heap`, which also propagates the new page
//! tables into every process directory. Hosted builds use the system
//! allocator instead (see the crate root).

/// Initial heap reservation: 4 MiB.
pub const INITIAL_HEAP_BYTES: usize = 4 << 20;

/// Map the initial heap window and hand it to the global allocator.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    let old_break = super::vm::resize_kernel_heap(INITIAL_HEAP_BYTES as i32)
        .expect("kernel heap reservation failed");
    // SAFETY: the window was just mapped and nothing else references it.
    unsafe {
        crate::ALLOCATOR
            .lock()
            .init(old_break as *mut u8, INITIAL_HEAP_BYTES);
    }
    log::info!(
        "[HEAP] kernel heap at {:#010x}, {} KB",
        old_break,
        INITIAL_HEAP_BYTES >> 10
    );
}

/// Grow the heap window and give the new pages to the allocator.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn grow(bytes: usize) -> crate::error::KernelResult<()> {
    super::vm::resize_kernel_heap(bytes as i32)?;
    // SAFETY: the freshly mapped pages extend the existing heap window
    // contiguously.
    unsafe { crate::ALLOCATOR.lock().extend(bytes) };
    Ok(())
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn init() {}
