//! Physical page allocator.
//!
//! 4 KiB frames on a LIFO free list threaded through the frames themselves.
//! Two-phase initialization: the early phase seeds a provisional list with
//! no locking (single CPU, interrupts off); once the other CPUs can run,
//! `enable_locking` turns the spinlock on.
//!
//! The allocator also owns the firmware memory-map bookkeeping: usable
//! ranges are collected from the bootloader, clamped, merged, and released
//! onto the free list after the kernel page directory is live.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use super::layout::{
    self, page_round_down, page_round_up, page_round_up_usize, PhysAddr, KERNBASE, KHEAP_RESERVE,
    MMIOBASE, PGSIZE,
};
use crate::sync::SpinLock;

/// Byte written over freed frames to catch dangling references.
const JUNK_FREED: u8 = 0x01;
/// Byte written over freshly allocated frames.
const JUNK_ALLOCATED: u8 = 0x05;

/// Frames below this physical address are never released to the allocator,
/// protecting firmware structures and the low-memory boot code.
const LOW_RESERVED: u32 = 8 * 1024 * 1024;

static KMEM_LOCK: SpinLock = SpinLock::new("kmem");
static USE_LOCK: AtomicBool = AtomicBool::new(false);
static FREE_HEAD: AtomicUsize = AtomicUsize::new(0);
static FREE_COUNT: AtomicUsize = AtomicUsize::new(0);

struct Guard {
    locked: bool,
}

fn lock() -> Guard {
    if USE_LOCK.load(Ordering::Acquire) {
        KMEM_LOCK.acquire();
        Guard { locked: true }
    } else {
        Guard { locked: false }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.locked {
            KMEM_LOCK.release();
        }
    }
}

/// Switch the allocator to locked operation. Called once the system is
/// ready to run more than one CPU.
pub fn enable_locking() {
    USE_LOCK.store(true, Ordering::Release);
}

/// Free every page in `[vstart, vend)` (kernel virtual addresses).
pub fn free_range(vstart: usize, vend: usize) {
    let mut page = page_round_up_usize(vstart);
    while page + PGSIZE <= vend {
        free_page(page as *mut u8);
        page += PGSIZE;
    }
}

/// Return one frame to the free list. `ptr` must be a page-aligned kernel
/// pointer previously produced by `alloc_page` or covered by a released
/// firmware range.
pub fn free_page(ptr: *mut u8) {
    let va = ptr as usize;
    if va % PGSIZE != 0 {
        panic!("free_page: unaligned {:#x}", va);
    }
    let pa = layout::virt_to_phys(va).0;
    if pa < layout::kernel_end_phys() || pa >= layout::phys_ram_end() {
        panic!("free_page: out of range pa {:#x}", pa);
    }

    // Fill with junk to catch dangling references.
    // SAFETY: the frame is page-aligned, inside released RAM, and owned by
    // the caller at this point.
    unsafe { core::ptr::write_bytes(ptr, JUNK_FREED, PGSIZE) };

    let _guard = lock();
    let head = FREE_HEAD.load(Ordering::Relaxed);
    // SAFETY: the frame is unused; its first word becomes the list link.
    unsafe { (ptr as *mut usize).write(head) };
    FREE_HEAD.store(va, Ordering::Relaxed);
    FREE_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Allocate one 4 KiB frame. Returns a kernel pointer to it, or `None` when
/// physical memory is exhausted.
pub fn alloc_page() -> Option<*mut u8> {
    let ptr = {
        let _guard = lock();
        let head = FREE_HEAD.load(Ordering::Relaxed);
        if head == 0 {
            return None;
        }
        // SAFETY: head is a free frame whose first word is the list link.
        let next = unsafe { (head as *const usize).read() };
        FREE_HEAD.store(next, Ordering::Relaxed);
        FREE_COUNT.fetch_sub(1, Ordering::Relaxed);
        head as *mut u8
    };
    // SAFETY: the frame was just removed from the free list and belongs to
    // the caller.
    unsafe { core::ptr::write_bytes(ptr, JUNK_ALLOCATED, PGSIZE) };
    Some(ptr)
}

/// Allocate a zeroed frame.
pub fn alloc_zeroed_page() -> Option<*mut u8> {
    let ptr = alloc_page()?;
    // SAFETY: the frame belongs to the caller.
    unsafe { core::ptr::write_bytes(ptr, 0, PGSIZE) };
    Some(ptr)
}

/// Number of frames currently on the free list.
pub fn free_page_count() -> usize {
    FREE_COUNT.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Firmware memory ranges
// ---------------------------------------------------------------------------

const MAX_USABLE_RANGES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug)]
struct RangeTable {
    ranges: [PhysRange; MAX_USABLE_RANGES],
    count: usize,
}

impl RangeTable {
    const fn new() -> Self {
        Self {
            ranges: [PhysRange { start: 0, end: 0 }; MAX_USABLE_RANGES],
            count: 0,
        }
    }

    fn record(&mut self, start: u32, end: u32) {
        if start >= end {
            return;
        }
        if self.count >= MAX_USABLE_RANGES {
            log::warn!(
                "[MEM] too many usable memory ranges; dropping {:#x}-{:#x}",
                start,
                end
            );
            return;
        }
        self.ranges[self.count] = PhysRange { start, end };
        self.count += 1;
    }

    /// Insertion-sort by start address, then merge overlapping or adjacent
    /// ranges in place.
    fn sort_and_merge(&mut self) {
        if self.count <= 1 {
            return;
        }
        for i in 1..self.count {
            let key = self.ranges[i];
            let mut j = i;
            while j > 0 && self.ranges[j - 1].start > key.start {
                self.ranges[j] = self.ranges[j - 1];
                j -= 1;
            }
            self.ranges[j] = key;
        }

        let mut write = 0;
        for i in 1..self.count {
            let next = self.ranges[i];
            let cur = &mut self.ranges[write];
            if next.start <= cur.end {
                if next.end > cur.end {
                    cur.end = next.end;
                }
            } else {
                write += 1;
                self.ranges[write] = next;
            }
        }
        self.count = write + 1;
    }
}

static USABLE_RANGES: Mutex<RangeTable> = Mutex::new(RangeTable::new());

/// Rebuild the usable-range table from decoded firmware memory-map entries,
/// clamping each AVAILABLE range to `usable_limit`. With no entries at all,
/// a single default range `[0, usable_limit)` is assumed.
pub fn build_usable_ranges<I>(entries: I, usable_limit: u32)
where
    I: IntoIterator<Item = crate::arch::x86::boot::MemoryRange>,
{
    let mut table = USABLE_RANGES.lock();
    table.count = 0;

    for entry in entries {
        if !entry.available || entry.len == 0 {
            continue;
        }
        let start = entry.addr;
        let end = start + entry.len;
        if start >= usable_limit as u64 {
            continue;
        }
        let end = end.min(usable_limit as u64);
        if end > start {
            table.record(start as u32, end as u32);
        }
    }

    if table.count == 0 && usable_limit > 0 {
        table.record(0, usable_limit);
    }
    table.sort_and_merge();
}

/// Visit every usable physical range in ascending order.
pub fn for_each_usable_range(mut f: impl FnMut(u32, u32)) {
    let table = USABLE_RANGES.lock();
    for range in table.ranges.iter().take(table.count) {
        f(range.start, range.end);
    }
}

/// Release every usable range above `max(kernel_end, 8 MiB)` onto the free
/// list. Runs after the kernel page directory covers all of RAM.
pub fn release_usable_ranges() {
    let kernel_guard = page_round_up(layout::kernel_end_phys());
    let min_free = kernel_guard.max(LOW_RESERVED);

    let mut ranges = [PhysRange { start: 0, end: 0 }; MAX_USABLE_RANGES];
    let mut count = 0;
    for_each_usable_range(|start, end| {
        if count < MAX_USABLE_RANGES {
            ranges[count] = PhysRange { start, end };
            count += 1;
        }
    });

    for range in ranges.iter().take(count) {
        if range.end <= min_free {
            continue;
        }
        let start = range.start.max(min_free);
        let vstart = layout::phys_to_virt(PhysAddr(start)) as usize;
        let vend = layout::phys_to_virt(PhysAddr(range.end)) as usize;
        free_range(vstart, vend);
    }
}

// ---------------------------------------------------------------------------
// Physical memory limits
// ---------------------------------------------------------------------------

/// Where the final physical-memory figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysTopSource {
    MemoryMap,
    BasicInfo,
    Fallback,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    pub total_bytes: u64,
    pub usable_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct PhysTopState {
    source: PhysTopSource,
    reported_total: u64,
    reported_usable: u64,
    final_total: u32,
    final_usable: u32,
    clamped: bool,
    heap_reserved: bool,
}

static PHYSTOP_STATE: Mutex<PhysTopState> = Mutex::new(PhysTopState {
    source: PhysTopSource::Fallback,
    reported_total: 0x2000_0000,
    reported_usable: 0x2000_0000,
    final_total: 0x2000_0000,
    final_usable: 0x2000_0000,
    clamped: false,
    heap_reserved: false,
});

/// Derive memory limits from decoded memory-map entries, ignoring anything
/// at or beyond what the direct map can cover.
pub fn limits_from_memory_map<I>(entries: I) -> MemoryLimits
where
    I: IntoIterator<Item = crate::arch::x86::boot::MemoryRange>,
{
    let max_supported = (MMIOBASE - KERNBASE) as u64;
    let mut limits = MemoryLimits {
        total_bytes: 0,
        usable_bytes: 0,
    };

    for entry in entries {
        if entry.len == 0 || entry.addr >= max_supported {
            continue;
        }
        let len = entry.len.min(max_supported - entry.addr);
        if len == 0 {
            continue;
        }
        let end = entry.addr + len;
        if end > limits.total_bytes {
            limits.total_bytes = end;
        }
        if entry.available && end > limits.usable_bytes {
            limits.usable_bytes = end;
        }
    }
    limits
}

/// Derive memory limits from the multiboot `mem_upper` field (kilobytes of
/// RAM starting at 1 MiB).
pub fn limits_from_basic_info(mem_upper_kb: u32) -> MemoryLimits {
    let total = ((mem_upper_kb as u64) + 1024) << 10;
    MemoryLimits {
        total_bytes: total,
        usable_bytes: total,
    }
}

/// Fix the final physical-memory figures: clamp to the direct-map window
/// minus the kernel-heap VA reservation, page-align, and publish through
/// `layout::set_phys_limits`.
pub fn apply_memory_limits(mut limits: MemoryLimits, source: PhysTopSource) {
    const FALLBACK_LIMIT: u64 = 0x2000_0000;

    let mut source = source;
    if limits.total_bytes == 0 || limits.usable_bytes == 0 {
        limits.total_bytes = FALLBACK_LIMIT;
        limits.usable_bytes = FALLBACK_LIMIT;
        source = PhysTopSource::Fallback;
    }
    if limits.total_bytes < limits.usable_bytes {
        limits.total_bytes = limits.usable_bytes;
    }

    let reported_total = limits.total_bytes;
    let reported_usable = limits.usable_bytes;

    let direct_map_window = (MMIOBASE - KERNBASE) as u64;
    assert!(
        direct_map_window > KHEAP_RESERVE as u64,
        "heap reserve exceeds the direct-map window"
    );
    let max_supported = direct_map_window - KHEAP_RESERVE as u64;

    let mut clamped = false;
    if limits.total_bytes > max_supported {
        limits.total_bytes = max_supported;
        clamped = true;
    }
    if limits.usable_bytes > max_supported {
        limits.usable_bytes = max_supported;
        clamped = true;
    }

    let final_usable = page_round_down(limits.usable_bytes as u32);
    let mut final_total = page_round_up(limits.total_bytes as u32);
    if final_total > max_supported as u32 {
        final_total = max_supported as u32;
    }
    if final_total < final_usable {
        final_total = final_usable;
    }

    let kernel_end = page_round_up(layout::kernel_end_phys());
    if final_usable <= kernel_end {
        panic!(
            "not enough usable RAM ({:#x} bytes); kernel ends at {:#x}",
            final_usable, kernel_end
        );
    }

    layout::set_phys_limits(final_total, final_usable);

    *PHYSTOP_STATE.lock() = PhysTopState {
        source,
        reported_total,
        reported_usable,
        final_total,
        final_usable,
        clamped,
        heap_reserved: clamped,
    };
}

/// Log where the physical-memory figure came from and how it was adjusted.
pub fn report_memory_limits() {
    let state = *PHYSTOP_STATE.lock();
    let reported_mb = state.reported_total >> 20;
    let usable_mb = state.reported_usable >> 20;
    let used_mb = state.final_usable >> 20;
    let mapped_mb = state.final_total >> 20;

    match state.source {
        PhysTopSource::MemoryMap => {
            if reported_mb == usable_mb {
                log::info!(
                    "[MEM] memory map reports {} MB; using {} MB",
                    reported_mb,
                    used_mb
                );
            } else {
                log::info!(
                    "[MEM] memory map reports {} MB total ({} MB usable); using {} MB",
                    reported_mb,
                    usable_mb,
                    used_mb
                );
            }
        }
        PhysTopSource::BasicInfo => {
            log::info!(
                "[MEM] mem_upper reports {} MB; using {} MB",
                reported_mb,
                used_mb
            );
        }
        PhysTopSource::Fallback => {
            log::warn!(
                "[MEM] bootloader did not supply memory info; defaulting to {} MB",
                used_mb
            );
        }
    }

    if mapped_mb > used_mb {
        log::info!(
            "[MEM] mapping {} MB to cover firmware and reserved regions",
            mapped_mb
        );
    }
    if state.clamped {
        log::warn!("[MEM] limiting memory to {} MB to preserve MMIO space", mapped_mb);
    }
    if state.heap_reserved {
        log::info!(
            "[MEM] reserved {} MB of kernel VA space for heap growth",
            KHEAP_RESERVE >> 20
        );
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::arch::x86::boot::MemoryRange;

    fn avail(addr: u64, len: u64) -> MemoryRange {
        MemoryRange {
            addr,
            len,
            available: true,
        }
    }

    fn reserved(addr: u64, len: u64) -> MemoryRange {
        MemoryRange {
            addr,
            len,
            available: false,
        }
    }

    #[test]
    fn ranges_are_clamped_sorted_and_merged() {
        let _guard = crate::hosted::lock();
        let limit = 64 << 20;
        build_usable_ranges(
            [
                avail(32 << 20, 16 << 20),
                reserved(0x9F000, 0x1000),
                avail(0, 0x9F000),
                avail(1 << 20, 31 << 20), // overlaps the 32 MB range
                avail(200 << 20, 16 << 20), // beyond the limit entirely
            ],
            limit,
        );

        let mut seen = std::vec::Vec::new();
        for_each_usable_range(|s, e| seen.push((s, e)));
        assert_eq!(
            seen,
            std::vec![(0, 0x9F000), (1 << 20, 48 << 20)],
            "ranges must come back sorted, merged, and clamped"
        );
    }

    #[test]
    fn empty_map_falls_back_to_single_range() {
        let _guard = crate::hosted::lock();
        build_usable_ranges(core::iter::empty(), 16 << 20);
        let mut seen = std::vec::Vec::new();
        for_each_usable_range(|s, e| seen.push((s, e)));
        assert_eq!(seen, std::vec![(0u32, 16 << 20)]);
    }

    #[test]
    fn limits_prefer_available_entries() {
        let limits = limits_from_memory_map([
            avail(0, 0x9F000),
            reserved(0x9F000, 0x61000),
            avail(1 << 20, 127 << 20),
        ]);
        assert_eq!(limits.usable_bytes, 128 << 20);
        assert_eq!(limits.total_bytes, 128 << 20);
    }

    #[test]
    fn limits_ignore_entries_beyond_direct_map() {
        let window = (MMIOBASE - KERNBASE) as u64;
        let limits = limits_from_memory_map([avail(0, window + (512 << 20))]);
        assert_eq!(limits.total_bytes, window, "len clamps at the window");
        // Entirely out-of-window entries are dropped.
        let limits = limits_from_memory_map([avail(window + 4096, 1 << 20)]);
        assert_eq!(limits.total_bytes, 0);
    }

    #[test]
    fn basic_info_limits_count_from_one_megabyte() {
        let limits = limits_from_basic_info(63 << 10); // 63 MB above 1 MB
        assert_eq!(limits.total_bytes, 64 << 20);
        assert_eq!(limits.usable_bytes, 64 << 20);
    }

    #[test]
    fn apply_limits_clamps_to_heap_reserve() {
        let _guard = crate::hosted::lock();
        let window = (MMIOBASE - KERNBASE) as u64;
        apply_memory_limits(
            MemoryLimits {
                total_bytes: window,
                usable_bytes: window,
            },
            PhysTopSource::MemoryMap,
        );
        let max = (window - KHEAP_RESERVE as u64) as u32;
        assert_eq!(layout::phys_mem_top(), max);
        assert_eq!(layout::phys_ram_end(), max);

        // Restore the hosted default so other tests see sane limits.
        apply_memory_limits(
            MemoryLimits {
                total_bytes: layout::HOSTED_RAM_BYTES as u64,
                usable_bytes: layout::HOSTED_RAM_BYTES as u64,
            },
            PhysTopSource::MemoryMap,
        );
    }
}
