//! Kernel virtual-memory manager.
//!
//! There is one page directory per process, plus a master directory used
//! while a CPU runs no process. Every directory shares the same kernel-range
//! view:
//!
//! - `[KERNBASE, KERNBASE + EXTMEM)`  -> phys `[0, EXTMEM)`    I/O space
//! - `[KERNLINK, data)`               -> kernel text + rodata, read-only
//! - `[data, KERNBASE + phys_top)`    -> kernel data + all usable RAM
//! - `[MMIOBASE, 4 GiB)`              -> identity-mapped device registers
//!
//! The kernel heap window and every MMIO mapping added after boot are
//! replicated into freshly built directories and propagated into all live
//! process directories before the mutating call returns, under the process
//! table lock.

use core::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use super::frame;
use super::layout::{
    self, page_round_down, page_round_up, pdx, PhysAddr, KERNBASE, KHEAP_START, MMIOBASE,
    PDE_SPAN, PGSIZE,
};
use super::page_table::{
    entry_addr, PageDirectory, PteFlags, MMIO_UNCACHED, MMIO_WRITE_COMBINING,
};
use crate::error::{KernelError, KernelResult};
use crate::fs::inode::Inode;
use crate::proc::table::PTABLE;
use crate::proc::ProcState;

const MAX_MMIO_RANGES: usize = 16;

/// End of the 32-bit address space, exclusive.
const ADDRESS_SPACE_END: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MmioRange {
    start: u32,
    end: u64, // exclusive; may be 1 << 32
}

/// The kernel's shared address-space state.
pub struct KernelSpace {
    master: PageDirectory,
    kheap_break: u32,
    mmio_ranges: [MmioRange; MAX_MMIO_RANGES],
    mmio_count: usize,
    propagation_enabled: bool,
}

lazy_static! {
    static ref KERNEL_SPACE: Mutex<KernelSpace> = Mutex::new(KernelSpace::build_master());
}

/// CR3 value of the master directory, cached so the scheduler can reload
/// it while holding the process-table lock without touching the kernel
/// space mutex (the propagation path takes those locks in the other
/// order).
static MASTER_CR3: AtomicU32 = AtomicU32::new(0);

/// One bit per PDE index: set when the entry's page table belongs to the
/// master directory (recorded MMIO ranges). Directory teardown must leave
/// those tables alone. Append-only, so lock-free reads are safe.
static SHARED_KERNEL_PDES: [AtomicU32; layout::NPDENTRIES / 32] =
    [const { AtomicU32::new(0) }; layout::NPDENTRIES / 32];

fn mark_shared_pdes(start: u32, end: u64) {
    let first = pdx(page_round_down(start)) as u64;
    let last = pdx(((end - 1) & 0xFFFF_FFFF) as u32) as u64;
    for index in first..=last {
        SHARED_KERNEL_PDES[(index / 32) as usize]
            .fetch_or(1 << (index % 32), Ordering::Release);
    }
}

/// Whether the page table behind PDE `index` is shared with the master
/// directory.
pub fn is_shared_kernel_pde(index: usize) -> bool {
    SHARED_KERNEL_PDES[index / 32].load(Ordering::Acquire) & (1 << (index % 32)) != 0
}

impl KernelSpace {
    /// Build the master kernel directory. Runs once, before the first
    /// process exists; failure here is fatal.
    fn build_master() -> Self {
        assert!(
            layout::phys_mem_top() as u64 + KERNBASE as u64 <= MMIOBASE as u64,
            "phys_mem_top overlaps the MMIO window"
        );

        let dir = PageDirectory::alloc().expect("kernel page directory: out of memory");
        map_static_ram_ranges(dir).expect("kernel page directory: mapping RAM failed");
        dir.map_range(
            MMIOBASE,
            (ADDRESS_SPACE_END - MMIOBASE as u64) as u32,
            MMIOBASE,
            MMIO_UNCACHED,
        )
        .expect("kernel page directory: mapping MMIO window failed");

        let mut space = Self {
            master: dir,
            kheap_break: KHEAP_START,
            mmio_ranges: [MmioRange { start: 0, end: 0 }; MAX_MMIO_RANGES],
            mmio_count: 0,
            propagation_enabled: false,
        };
        // The boot-time device window behaves like any other recorded MMIO
        // range so new directories inherit it through the same path.
        space.record_mmio_range(MMIOBASE, ADDRESS_SPACE_END);
        space
    }

    fn record_mmio_range(&mut self, start: u32, end: u64) {
        mark_shared_pdes(start, end);
        for range in self.mmio_ranges.iter_mut().take(self.mmio_count) {
            if start >= range.start && end <= range.end {
                return; // fully covered
            }
            if (start as u64) <= range.end && end >= range.start as u64 {
                if start < range.start {
                    range.start = start;
                }
                if end > range.end {
                    range.end = end;
                }
                return;
            }
        }
        if self.mmio_count >= MAX_MMIO_RANGES {
            panic!("kernel_map_mmio: too many ranges");
        }
        self.mmio_ranges[self.mmio_count] = MmioRange { start, end };
        self.mmio_count += 1;
    }

    /// Copy the master's PDEs covering `[start, end)` into `dir`.
    fn replicate_range(&self, dir: PageDirectory, start: u32, end: u64) {
        if end <= start as u64 {
            return;
        }
        let start = page_round_down(start) as u64 & !(PDE_SPAN - 1);
        let end = (end + PDE_SPAN - 1) & !(PDE_SPAN - 1);
        let mut va = start;
        while va < end {
            let index = pdx(va as u32);
            dir.set_pde(index, self.master.pde(index));
            va += PDE_SPAN;
        }
    }

    /// Copy the master's PDEs covering `[start, end)` into every live
    /// process directory, under the process-table lock, then reload CR3 on
    /// the current CPU so the change takes effect locally.
    fn propagate_range(&self, start: u32, end: u64) {
        if end <= start as u64 {
            return;
        }

        PTABLE.lock.acquire();
        for p in PTABLE.procs().iter() {
            if p.state() == ProcState::Unused {
                continue;
            }
            // SAFETY: the process-table lock is held.
            let inner = unsafe { p.inner() };
            if let Some(dir) = inner.pagedir {
                self.replicate_range(dir, start, end);
            }
        }
        PTABLE.lock.release();

        let current_dir = crate::sched::cpu::current_pagedir();
        match current_dir {
            Some(dir) => crate::arch::x86::asm::load_cr3(dir.root_phys().0),
            None => crate::arch::x86::asm::load_cr3(self.master.root_phys().0),
        }
    }

    fn map_mmio_with_flags(&mut self, pa: u32, size: u32, flags: PteFlags) -> KernelResult<usize> {
        if size == 0 {
            return Err(KernelError::InvalidArgument { name: "size" });
        }

        let start = page_round_down(pa);
        let end = ((pa as u64 + size as u64 + PGSIZE as u64 - 1) & !(PGSIZE as u64 - 1))
            .min(ADDRESS_SPACE_END);

        let mut va = start as u64;
        while va < end {
            let already_present = self
                .master
                .walk(va as u32, false)
                // SAFETY: walk returned a valid PTE slot.
                .map(|pte| unsafe { pte.read_volatile() } & PteFlags::PRESENT.bits() != 0)
                .unwrap_or(false);
            if !already_present {
                self.master
                    .map_range(va as u32, PGSIZE as u32, va as u32, flags)?;
            }
            va += PGSIZE as u64;
        }

        if self.propagation_enabled {
            self.propagate_range(start, end);
        } else {
            self.switch_to_master();
        }

        self.record_mmio_range(start, end);
        Ok(start as usize)
    }

    fn switch_to_master(&self) {
        crate::arch::x86::asm::load_cr3(self.master.root_phys().0);
    }
}

/// Map the three static RAM-backed kernel ranges into `dir` with fresh page
/// tables.
fn map_static_ram_ranges(dir: PageDirectory) -> KernelResult<()> {
    let (text_start, text_end) = layout::kernel_text_span();
    let data_start = layout::kernel_data_start();
    let phys_top = layout::phys_mem_top();

    // I/O space below the kernel image.
    dir.map_range(KERNBASE, layout::EXTMEM, 0, PteFlags::WRITABLE)?;
    // Kernel text + rodata, read-only.
    dir.map_range(
        text_start,
        text_end - text_start,
        text_start - KERNBASE,
        PteFlags::empty(),
    )?;
    // Kernel data, heap pages and all remaining usable RAM.
    dir.map_range(
        data_start,
        phys_top - (data_start - KERNBASE),
        data_start - KERNBASE,
        PteFlags::WRITABLE,
    )?;
    Ok(())
}

/// Force construction of the master directory, program the PAT, and switch
/// the boot CPU onto it.
pub fn init() {
    crate::arch::x86::asm::pat_init();
    let space = KERNEL_SPACE.lock();
    MASTER_CR3.store(space.master.root_phys().0, Ordering::Release);
    space.switch_to_master();
    log::info!(
        "[VM] kernel page directory live, direct map covers {} MB",
        layout::phys_mem_top() >> 20
    );
}

/// Enable propagation of kernel-range updates into process directories.
/// Called once the process table is ready.
pub fn enable_mmio_propagation() {
    KERNEL_SPACE.lock().propagation_enabled = true;
}

/// Load the master directory on this CPU (used by the idle scheduler).
/// Lock-free after init: the scheduler calls this with the process-table
/// lock held.
pub fn switch_kernel_page_directory() {
    let cr3 = MASTER_CR3.load(Ordering::Acquire);
    if cr3 != 0 {
        crate::arch::x86::asm::load_cr3(cr3);
        return;
    }
    let space = KERNEL_SPACE.lock();
    MASTER_CR3.store(space.master.root_phys().0, Ordering::Release);
    space.switch_to_master();
}

/// Physical address of the master directory root (for early AP bring-up).
pub fn master_root_phys() -> PhysAddr {
    KERNEL_SPACE.lock().master.root_phys()
}

/// Resolve a kernel virtual address to physical through the master
/// directory. Heap-window addresses are not part of the linear map, so DMA
/// setup goes through here rather than the direct-map arithmetic.
pub fn kernel_resolve(va: usize) -> Option<PhysAddr> {
    if va > u32::MAX as usize {
        return None;
    }
    let space = KERNEL_SPACE.lock();
    space.master.resolve(va as u32).map(|(pa, _)| pa)
}

/// Build the kernel portion of a new page directory: static RAM ranges with
/// fresh page tables, then the kernel heap window and every recorded MMIO
/// range replicated from the master.
pub fn setup_kernel_pagedir() -> KernelResult<PageDirectory> {
    let space = KERNEL_SPACE.lock();
    let dir = PageDirectory::alloc()?;
    if let Err(e) = map_static_ram_ranges(dir) {
        free_user_vm(dir);
        return Err(e);
    }

    space.replicate_range(dir, KHEAP_START, space.kheap_break as u64);
    for range in space.mmio_ranges.iter().take(space.mmio_count) {
        space.replicate_range(dir, range.start, range.end);
    }
    Ok(dir)
}

/// Reserve a strong-uncached kernel MMIO mapping for `[pa, pa + size)`.
/// Returns the kernel virtual address (identity within the window).
pub fn kernel_map_mmio(pa: u32, size: u32) -> KernelResult<usize> {
    KERNEL_SPACE.lock().map_mmio_with_flags(pa, size, MMIO_UNCACHED)
}

/// Reserve a write-combining kernel MMIO mapping (PAT entry 1).
pub fn kernel_map_mmio_wc(pa: u32, size: u32) -> KernelResult<usize> {
    KERNEL_SPACE
        .lock()
        .map_mmio_with_flags(pa, size, MMIO_WRITE_COMBINING)
}

/// Grow or shrink the kernel heap window by `delta` bytes (whole pages).
/// Returns the previous break. The update is propagated to every process
/// directory before returning.
pub fn resize_kernel_heap(delta: i32) -> KernelResult<u32> {
    let mut space = KERNEL_SPACE.lock();
    let old_break = space.kheap_break;

    if delta > 0 {
        let requested = old_break
            .checked_add(delta as u32)
            .ok_or(KernelError::InvalidArgument { name: "delta" })?;
        if requested as u64 > MMIOBASE as u64 {
            return Err(KernelError::OutOfMemory);
        }
        let new_break = alloc_range(space.master, old_break, requested, PteFlags::WRITABLE)?;
        if space.propagation_enabled {
            space.propagate_range(old_break, new_break as u64);
        }
        space.kheap_break = new_break;
    } else if delta < 0 {
        let shrink = delta.unsigned_abs();
        if shrink > old_break - KHEAP_START {
            return Err(KernelError::InvalidArgument { name: "delta" });
        }
        let target = old_break - shrink;
        let new_break = dealloc_range(space.master, old_break, target);
        if space.propagation_enabled {
            space.propagate_range(new_break, old_break as u64);
        }
        space.kheap_break = new_break;
    }

    Ok(old_break)
}

/// Current kernel heap break.
pub fn kernel_heap_break() -> u32 {
    KERNEL_SPACE.lock().kheap_break
}

/// Grow an address range from `oldsz` to `newsz`, allocating zeroed frames.
/// Returns the new size; on failure every page allocated by this call is
/// released.
pub fn alloc_range(dir: PageDirectory, oldsz: u32, newsz: u32, perm: PteFlags) -> KernelResult<u32> {
    if perm.contains(PteFlags::USER) && newsz >= KERNBASE {
        return Err(KernelError::InvalidArgument { name: "newsz" });
    }
    if newsz < oldsz {
        return Ok(oldsz);
    }

    let mut page = page_round_up(oldsz);
    while page < newsz {
        let mem = match frame::alloc_zeroed_page() {
            Some(mem) => mem,
            None => {
                log::warn!("[VM] alloc_range out of memory");
                dealloc_range(dir, page, oldsz);
                return Err(KernelError::OutOfMemory);
            }
        };
        let pa = layout::virt_to_phys(mem as usize);
        if dir.map_range(page, PGSIZE as u32, pa.0, perm).is_err() {
            log::warn!("[VM] alloc_range out of memory (page table)");
            frame::free_page(mem);
            dealloc_range(dir, page, oldsz);
            return Err(KernelError::OutOfMemory);
        }
        page += PGSIZE as u32;
    }
    Ok(newsz)
}

/// Shrink an address range from `oldsz` down to `newsz`, freeing frames.
/// Returns the new size.
pub fn dealloc_range(dir: PageDirectory, oldsz: u32, newsz: u32) -> u32 {
    if newsz >= oldsz {
        return oldsz;
    }

    let mut page = page_round_up(newsz);
    while page < oldsz {
        // Never free through a page table shared with the master
        // directory (a propagated MMIO range).
        if is_shared_kernel_pde(pdx(page)) {
            let next = ((page as u64 & !(PDE_SPAN - 1)) + PDE_SPAN) as u32;
            if next as u64 >= oldsz as u64 || next == 0 {
                break;
            }
            page = next;
            continue;
        }
        match dir.walk(page, false) {
            None => {
                // No page table here; skip to the next directory entry.
                let next = ((page as u64 & !(PDE_SPAN - 1)) + PDE_SPAN) as u32;
                if next as u64 >= oldsz as u64 || next == 0 {
                    break;
                }
                page = next;
                continue;
            }
            Some(pte_ptr) => {
                // SAFETY: walk returned a valid PTE slot.
                let pte = unsafe { pte_ptr.read_volatile() };
                if pte & PteFlags::PRESENT.bits() != 0 {
                    let pa = entry_addr(pte);
                    if pa == 0 {
                        panic!("dealloc_range: zero frame");
                    }
                    frame::free_page(layout::phys_to_virt(PhysAddr(pa)));
                    // SAFETY: clearing the entry we just read.
                    unsafe { pte_ptr.write_volatile(0) };
                }
            }
        }
        page += PGSIZE as u32;
    }
    newsz
}

/// Remove mappings in `[start, end)`. Physical frames are released only
/// when `free_frames` is set and the frame lies in managed RAM; device
/// mappings pass `false`.
pub fn unmap_range(dir: PageDirectory, start: u32, end: u32, free_frames: bool) {
    if start >= end {
        return;
    }
    let mut page = page_round_down(start);
    let last = page_round_down(end + PGSIZE as u32 - 1);
    while page <= last {
        match dir.walk(page, false) {
            None => {
                let next = ((page as u64 & !(PDE_SPAN - 1)) + PDE_SPAN) as u32;
                if next == 0 || next > last {
                    break;
                }
                page = next;
                continue;
            }
            Some(pte_ptr) => {
                // SAFETY: walk returned a valid PTE slot.
                let pte = unsafe { pte_ptr.read_volatile() };
                if pte & PteFlags::PRESENT.bits() != 0 {
                    if free_frames {
                        let pa = entry_addr(pte);
                        if pa == 0 {
                            panic!("unmap_range: zero frame");
                        }
                        if pa < layout::phys_mem_top() {
                            frame::free_page(layout::phys_to_virt(PhysAddr(pa)));
                        }
                    }
                    // SAFETY: clearing the entry we just read.
                    unsafe { pte_ptr.write_volatile(0) };
                }
            }
        }
        if page == last {
            break;
        }
        page += PGSIZE as u32;
    }
}

/// Free a user page directory: every user page, every page-table frame the
/// directory owns, and the root. Page tables at or above `KHEAP_START` or
/// inside a recorded MMIO range are shared with the master directory and
/// must survive.
pub fn free_user_vm(dir: PageDirectory) {
    dealloc_range(dir, KERNBASE, 0);
    for i in 0..layout::NPDENTRIES {
        let pde = dir.pde(i);
        if pde & PteFlags::PRESENT.bits() != 0 {
            let va = (i as u32) << 22;
            if va >= KHEAP_START || is_shared_kernel_pde(i) {
                continue;
            }
            frame::free_page(layout::phys_to_virt(PhysAddr(entry_addr(pde))));
        }
    }
    frame::free_page(dir.root_ptr() as *mut u8);
}

/// Clone `[0, sz)` of `src` into a freshly built directory for fork.
pub fn copy_user_vm(src: PageDirectory, sz: u32) -> KernelResult<PageDirectory> {
    let dir = setup_kernel_pagedir()?;

    let mut va = 0u32;
    while va < sz {
        let pte_ptr = src
            .walk(va, false)
            .unwrap_or_else(|| panic!("copy_user_vm: pte should exist at {:#x}", va));
        // SAFETY: walk returned a valid PTE slot.
        let pte = unsafe { pte_ptr.read_volatile() };
        if pte & PteFlags::PRESENT.bits() == 0 {
            panic!("copy_user_vm: page not present at {:#x}", va);
        }

        let mem = match frame::alloc_page() {
            Some(mem) => mem,
            None => {
                free_user_vm(dir);
                return Err(KernelError::OutOfMemory);
            }
        };
        let src_ptr = layout::phys_to_virt(PhysAddr(entry_addr(pte)));
        // SAFETY: both frames are whole pages owned by the kernel.
        unsafe { core::ptr::copy_nonoverlapping(src_ptr, mem, PGSIZE) };

        let flags = PteFlags::from_bits_truncate(pte & 0xFFF) & !PteFlags::PRESENT;
        let pa = layout::virt_to_phys(mem as usize);
        if dir.map_range(va, PGSIZE as u32, pa.0, flags).is_err() {
            frame::free_page(mem);
            free_user_vm(dir);
            return Err(KernelError::OutOfMemory);
        }
        va += PGSIZE as u32;
    }
    Ok(dir)
}

/// Read `sz` bytes at file `offset` from `ip` into user pages already
/// mapped at `va` in `dir`, page by page.
pub fn load_user_segment(
    dir: PageDirectory,
    va: u32,
    ip: &Inode,
    offset: u32,
    sz: u32,
) -> KernelResult<()> {
    if sz == 0 {
        return Ok(());
    }

    let mut page_base = page_round_down(va);
    let mut page_off = (va - page_base) as usize;
    let mut copied = 0u32;

    while copied < sz {
        let (pa, _) = dir
            .resolve(page_base)
            .unwrap_or_else(|| panic!("load_user_segment: address {:#x} should exist", page_base));
        let dest = layout::phys_to_virt(PhysAddr(entry_addr(pa.0)));

        let chunk = core::cmp::min((PGSIZE - page_off) as u32, sz - copied);
        // SAFETY: dest is a mapped user frame; page_off + chunk <= PGSIZE.
        let dst_slice =
            unsafe { core::slice::from_raw_parts_mut(dest.add(page_off), chunk as usize) };
        let read = ip.readi(dst_slice, offset + copied)?;
        if read != chunk as usize {
            return Err(KernelError::Io);
        }

        copied += chunk;
        page_base += PGSIZE as u32;
        page_off = 0;
    }
    Ok(())
}

/// Translate a user virtual address to a kernel pointer, requiring a
/// present, user-accessible mapping.
pub fn user_to_kernel_ptr(dir: PageDirectory, uva: u32) -> Option<*mut u8> {
    let (pa, flags) = dir.resolve(page_round_down(uva))?;
    if !flags.contains(PteFlags::USER) {
        return None;
    }
    let base = layout::phys_to_virt(PhysAddr(entry_addr(pa.0)));
    // SAFETY: base points at a whole mapped frame; the offset is below
    // PGSIZE.
    Some(unsafe { base.add((uva & 0xFFF) as usize) })
}

/// Copy `src` into user memory at `va`.
pub fn copy_out(dir: PageDirectory, va: u32, src: &[u8]) -> KernelResult<()> {
    let mut va = va;
    let mut src = src;
    while !src.is_empty() {
        let va0 = page_round_down(va);
        let dst = user_to_kernel_ptr(dir, va0).ok_or(KernelError::InvalidAddress {
            addr: va as usize,
        })?;
        let n = core::cmp::min(PGSIZE - (va - va0) as usize, src.len());
        // SAFETY: dst points at a mapped frame and the copy stays within it.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst.add((va - va0) as usize), n);
        }
        src = &src[n..];
        va = va0.wrapping_add(PGSIZE as u32);
    }
    Ok(())
}

/// Copy user memory at `va` into `dst`.
pub fn copy_in(dir: PageDirectory, dst: &mut [u8], va: u32) -> KernelResult<()> {
    let mut va = va;
    let mut dst = dst;
    while !dst.is_empty() {
        let va0 = page_round_down(va);
        let src = user_to_kernel_ptr(dir, va0).ok_or(KernelError::InvalidAddress {
            addr: va as usize,
        })?;
        let n = core::cmp::min(PGSIZE - (va - va0) as usize, dst.len());
        // SAFETY: src points at a mapped frame and the copy stays within it.
        unsafe {
            core::ptr::copy_nonoverlapping(src.add((va - va0) as usize), dst.as_mut_ptr(), n);
        }
        dst = &mut dst[n..];
        va = va0.wrapping_add(PGSIZE as u32);
    }
    Ok(())
}

/// Copy a NUL-terminated user string at `va` into `buf`. Returns the string
/// length, not counting the NUL.
pub fn fetch_str(dir: PageDirectory, va: u32, buf: &mut [u8]) -> KernelResult<usize> {
    for i in 0..buf.len() {
        let mut byte = [0u8; 1];
        copy_in(dir, &mut byte, va.wrapping_add(i as u32))?;
        buf[i] = byte[0];
        if byte[0] == 0 {
            return Ok(i);
        }
    }
    Err(KernelError::InvalidArgument { name: "string" })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn master_directory_has_static_kernel_mappings() {
        let _guard = crate::hosted::bootstrap();
        let space = KERNEL_SPACE.lock();

        // I/O space is writable and linear.
        let (pa, flags) = space.master.resolve(KERNBASE + 0x1000).expect("io space mapped");
        assert_eq!(pa.0, 0x1000);
        assert!(flags.contains(PteFlags::WRITABLE));

        // Kernel text is mapped read-only.
        let (text_start, _) = layout::kernel_text_span();
        let (pa, flags) = space.master.resolve(text_start).expect("text mapped");
        assert_eq!(pa.0, text_start - KERNBASE);
        assert!(!flags.contains(PteFlags::WRITABLE), "text must be read-only");

        // The MMIO window is identity-mapped and uncached.
        let (pa, flags) = space.master.resolve(0xFEE0_0000).expect("mmio window mapped");
        assert_eq!(pa.0, 0xFEE0_0000);
        assert!(flags.contains(PteFlags::PCD | PteFlags::PWT));
    }

    #[test]
    fn process_directory_inherits_kernel_view() {
        let _guard = crate::hosted::bootstrap();
        let dir = setup_kernel_pagedir().expect("process directory should build");

        let (pa, _) = dir.resolve(KERNBASE + 0x2000).expect("io space inherited");
        assert_eq!(pa.0, 0x2000);
        let (pa, flags) = dir.resolve(0xFEC0_0000).expect("mmio window inherited");
        assert_eq!(pa.0, 0xFEC0_0000);
        assert!(flags.contains(PteFlags::PCD | PteFlags::PWT));

        free_user_vm(dir);
    }

    #[test]
    fn alloc_and_dealloc_round_trip_preserves_frames() {
        let _guard = crate::hosted::bootstrap();
        let dir = setup_kernel_pagedir().expect("process directory should build");
        let before = frame::free_page_count();

        let sz = alloc_range(dir, 0, 6 * PGSIZE as u32, PteFlags::WRITABLE | PteFlags::USER)
            .expect("growing six pages should succeed");
        assert_eq!(sz, 6 * PGSIZE as u32);
        assert!(dir.resolve(0).is_some());
        assert!(dir.resolve(5 * PGSIZE as u32).is_some());

        let sz = dealloc_range(dir, sz, 0);
        assert_eq!(sz, 0);
        assert!(dir.resolve(0).is_none());

        // One page table was allocated for the user range and remains; the
        // data frames all came back.
        let after = frame::free_page_count();
        assert_eq!(before - 1, after, "only the user page table stays allocated");

        free_user_vm(dir);
    }

    #[test]
    fn alloc_range_rejects_user_mappings_reaching_kernbase() {
        let _guard = crate::hosted::bootstrap();
        let dir = setup_kernel_pagedir().expect("process directory should build");
        let err = alloc_range(dir, 0, KERNBASE, PteFlags::WRITABLE | PteFlags::USER)
            .expect_err("user range touching KERNBASE must be rejected");
        assert!(matches!(err, KernelError::InvalidArgument { .. }));
        free_user_vm(dir);
    }

    #[test]
    fn copy_user_vm_duplicates_content() {
        let _guard = crate::hosted::bootstrap();
        let src = setup_kernel_pagedir().expect("source directory");
        let sz = alloc_range(src, 0, 2 * PGSIZE as u32, PteFlags::WRITABLE | PteFlags::USER)
            .expect("grow source");

        copy_out(src, 100, b"parent data").expect("copy_out into source");

        let child = copy_user_vm(src, sz).expect("fork-style clone");
        let mut buf = [0u8; 11];
        copy_in(child, &mut buf, 100).expect("copy_in from clone");
        assert_eq!(&buf, b"parent data");

        // The clone owns distinct frames.
        let (src_pa, _) = src.resolve(0).expect("source page mapped");
        let (child_pa, _) = child.resolve(0).expect("child page mapped");
        assert_ne!(src_pa.0, child_pa.0, "fork must copy, not alias");

        free_user_vm(child);
        free_user_vm(src);
    }

    #[test]
    fn free_user_vm_returns_every_frame() {
        let _guard = crate::hosted::bootstrap();
        let before = frame::free_page_count();
        let dir = setup_kernel_pagedir().expect("directory");
        let sz = alloc_range(dir, 0, 8 * PGSIZE as u32, PteFlags::WRITABLE | PteFlags::USER)
            .expect("grow");
        assert_eq!(sz, 8 * PGSIZE as u32);
        free_user_vm(dir);
        assert_eq!(
            frame::free_page_count(),
            before,
            "directory teardown must free every frame it allocated"
        );
    }

    #[test]
    fn mmio_mapping_propagates_to_process_directories() {
        let _guard = crate::hosted::bootstrap();

        // Stand up a fake live process with its own directory.
        let dir = setup_kernel_pagedir().expect("directory");
        let slot = crate::proc::table::alloc_for_test(dir);

        enable_mmio_propagation();
        let pa = 0xF000_0000u32; // inside the unmapped gap below the heap window
        let va = kernel_map_mmio(pa, 2 * PGSIZE as u32).expect("mmio mapping should succeed");
        assert_eq!(va, pa as usize, "identity mapping inside the window");

        let (resolved, flags) = dir
            .resolve(pa + PGSIZE as u32)
            .expect("mapping must be visible in the process directory");
        assert_eq!(resolved.0, pa + PGSIZE as u32);
        assert!(
            flags.contains(PteFlags::PCD | PteFlags::PWT),
            "strong-uncached attributes required"
        );

        // A directory built after the fact inherits the range as well.
        let late = setup_kernel_pagedir().expect("late directory");
        assert!(late.resolve(pa).is_some());

        free_user_vm(late);
        crate::proc::table::release_test_slot(slot);
        free_user_vm(dir);
    }

    #[test]
    fn wc_mapping_uses_pat_entry_one_attributes() {
        let _guard = crate::hosted::bootstrap();
        let pa = 0xF010_0000u32;
        kernel_map_mmio_wc(pa, PGSIZE as u32).expect("wc mapping");
        let space = KERNEL_SPACE.lock();
        let (_, flags) = space.master.resolve(pa).expect("mapped");
        assert!(flags.contains(PteFlags::PWT));
        assert!(!flags.contains(PteFlags::PCD));
    }

    #[test]
    fn heap_resize_round_trip_returns_old_break() {
        let _guard = crate::hosted::bootstrap();
        let base = kernel_heap_break();
        let grow = 3 * PGSIZE as i32;

        let old = resize_kernel_heap(grow).expect("grow should succeed");
        assert_eq!(old, base);
        assert_eq!(kernel_heap_break(), base + grow as u32);

        let old = resize_kernel_heap(-grow).expect("shrink should succeed");
        assert_eq!(old, base + grow as u32);
        assert_eq!(kernel_heap_break(), base);
    }

    #[test]
    fn copy_out_rejects_unmapped_addresses() {
        let _guard = crate::hosted::bootstrap();
        let dir = setup_kernel_pagedir().expect("directory");
        let err = copy_out(dir, 0x7000_0000, b"x").expect_err("unmapped va must fail");
        assert!(matches!(err, KernelError::InvalidAddress { .. }));
        free_user_vm(dir);
    }

    #[test]
    fn fetch_str_reads_until_nul() {
        let _guard = crate::hosted::bootstrap();
        let dir = setup_kernel_pagedir().expect("directory");
        alloc_range(dir, 0, PGSIZE as u32, PteFlags::WRITABLE | PteFlags::USER).expect("grow");
        copy_out(dir, 16, b"/bin/echo\0").expect("write string");

        let mut buf = [0u8; 32];
        let len = fetch_str(dir, 16, &mut buf).expect("fetch");
        assert_eq!(len, 9);
        assert_eq!(&buf[..9], b"/bin/echo");

        free_user_vm(dir);
    }
}
