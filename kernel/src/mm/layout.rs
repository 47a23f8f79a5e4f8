//! Address-space layout.
//!
//! The 32-bit virtual address space is split into a user half and a kernel
//! half:
//!
//! - `[0, KERNBASE)`            user text/data/heap, stack below KERNBASE
//! - `[KERNBASE, MMIOBASE)`     linear map of physical RAM + kernel image
//!                              + kernel heap window
//! - `[MMIOBASE, 4 GiB)`        identity-mapped device registers
//!
//! On the host, the "physical" address space is a page-aligned arena so the
//! same direct-map arithmetic (and therefore the same page-table code)
//! executes under the standard test harness.

use core::sync::atomic::{AtomicU32, Ordering};

/// Size of a page in bytes.
pub const PGSIZE: usize = 4096;

/// Entries per page directory / page table.
pub const NPDENTRIES: usize = 1024;
pub const NPTENTRIES: usize = 1024;

/// Bytes of virtual address space covered by one PDE.
pub const PDE_SPAN: u64 = (PGSIZE * NPTENTRIES) as u64;

/// First kernel virtual address.
pub const KERNBASE: u32 = 0x8000_0000;

/// Start of extended memory; everything below is legacy I/O space.
pub const EXTMEM: u32 = 0x0010_0000;

/// Address the kernel image is linked at.
pub const KERNLINK: u32 = KERNBASE + EXTMEM;

/// Bottom of the identity-mapped MMIO window.
pub const MMIOBASE: u32 = 0xFE00_0000;

/// Kernel virtual-address space reserved for the kernel heap window.
pub const KHEAP_RESERVE: u32 = 128 << 20;

/// Bottom of the kernel heap window.
pub const KHEAP_START: u32 = MMIOBASE - KHEAP_RESERVE;

/// Fixed user virtual address where the framebuffer is mmapped.
pub const FB_MMAP_BASE: u32 = 0x4000_0000;

/// A physical address. Always below 4 GiB on this architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PGSIZE as u32 == 0
    }
}

/// Page-directory index of a virtual address.
#[inline]
pub const fn pdx(va: u32) -> usize {
    (va >> 22) as usize
}

/// Page-table index of a virtual address.
#[inline]
pub const fn ptx(va: u32) -> usize {
    ((va >> 12) & 0x3FF) as usize
}

#[inline]
pub const fn page_round_down(addr: u32) -> u32 {
    addr & !(PGSIZE as u32 - 1)
}

#[inline]
pub const fn page_round_up(addr: u32) -> u32 {
    (addr.wrapping_add(PGSIZE as u32 - 1)) & !(PGSIZE as u32 - 1)
}

#[inline]
pub const fn page_round_down_usize(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

#[inline]
pub const fn page_round_up_usize(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

// ---------------------------------------------------------------------------
// Physical memory bounds (fixed during early boot)
// ---------------------------------------------------------------------------

/// Top of physical memory covered by the direct map. Defaults to 512 MiB
/// until firmware data is parsed.
static PHYS_MEM_TOP: AtomicU32 = AtomicU32::new(0x2000_0000);

/// Highest usable RAM address reported by firmware.
static PHYS_RAM_END: AtomicU32 = AtomicU32::new(0x2000_0000);

pub fn phys_mem_top() -> u32 {
    PHYS_MEM_TOP.load(Ordering::Acquire)
}

pub fn phys_ram_end() -> u32 {
    PHYS_RAM_END.load(Ordering::Acquire)
}

pub fn set_phys_limits(mem_top: u32, ram_end: u32) {
    PHYS_MEM_TOP.store(mem_top, Ordering::Release);
    PHYS_RAM_END.store(ram_end, Ordering::Release);
}

// ---------------------------------------------------------------------------
// Direct map
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod direct {
    use super::{PhysAddr, KERNBASE, KERNLINK};

    extern "C" {
        /// End of kernel text + rodata; provided by the linker script.
        static __data_start: u8;
        /// First address after the loaded kernel image.
        static __kernel_end: u8;
    }

    #[inline]
    pub fn direct_map_base() -> usize {
        KERNBASE as usize
    }

    /// Virtual address where kernel read-write data begins.
    pub fn kernel_data_start() -> u32 {
        // SAFETY: taking the address of a linker symbol.
        unsafe { core::ptr::addr_of!(__data_start) as u32 }
    }

    /// Physical address of the first byte after the kernel image.
    pub fn kernel_end_phys() -> u32 {
        // SAFETY: taking the address of a linker symbol.
        let va = unsafe { core::ptr::addr_of!(__kernel_end) as u32 };
        va - KERNBASE
    }

    pub fn kernel_text_span() -> (u32, u32) {
        (KERNLINK, kernel_data_start())
    }

    pub fn phys_to_virt(pa: PhysAddr) -> *mut u8 {
        (pa.0 as usize + direct_map_base()) as *mut u8
    }

    pub fn virt_to_phys(va: usize) -> PhysAddr {
        PhysAddr((va - direct_map_base()) as u32)
    }
}

#[cfg(not(target_os = "none"))]
mod direct {
    //! Hosted direct map: a page-aligned arena stands in for physical RAM.
    //! "Physical" addresses are offsets into the arena.

    use super::{PhysAddr, EXTMEM, KERNLINK};

    struct Arena {
        base: usize,
        size: usize,
    }

    static ARENA: spin::Once<Arena> = spin::Once::new();

    /// Size of the simulated physical RAM used by hosted builds.
    pub const HOSTED_RAM_BYTES: usize = 64 << 20;

    /// Simulated end of the kernel image: text at 1-2 MiB, data/bss end at
    /// 4 MiB.
    pub const HOSTED_KERNEL_END: u32 = 0x40_0000;

    fn arena() -> &'static Arena {
        ARENA.call_once(|| {
            let layout =
                std::alloc::Layout::from_size_align(HOSTED_RAM_BYTES, super::PGSIZE).unwrap();
            // SAFETY: layout has non-zero size; the arena lives for the
            // remainder of the process.
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null(), "failed to allocate hosted RAM arena");
            Arena {
                base: base as usize,
                size: HOSTED_RAM_BYTES,
            }
        })
    }

    #[inline]
    pub fn direct_map_base() -> usize {
        arena().base
    }

    pub fn kernel_data_start() -> u32 {
        KERNLINK + EXTMEM
    }

    pub fn kernel_end_phys() -> u32 {
        HOSTED_KERNEL_END
    }

    pub fn kernel_text_span() -> (u32, u32) {
        (KERNLINK, kernel_data_start())
    }

    pub fn phys_to_virt(pa: PhysAddr) -> *mut u8 {
        let a = arena();
        debug_assert!((pa.0 as usize) < a.size, "phys address outside arena");
        (pa.0 as usize + a.base) as *mut u8
    }

    pub fn virt_to_phys(va: usize) -> PhysAddr {
        let a = arena();
        debug_assert!(va >= a.base && va < a.base + a.size);
        PhysAddr((va - a.base) as u32)
    }
}

pub use direct::*;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_round_down(0x1FFF), 0x1000);
        assert_eq!(page_round_up(0x1001), 0x2000);
        assert_eq!(page_round_up(0x1000), 0x1000);
        assert_eq!(page_round_down(0), 0);
    }

    #[test]
    fn directory_and_table_indexing() {
        assert_eq!(pdx(0), 0);
        assert_eq!(pdx(KERNBASE), 512);
        assert_eq!(ptx(0x0040_3000), 3);
        assert_eq!(pdx(0xFFFF_F000), 1023);
        assert_eq!(ptx(0xFFFF_F000), 1023);
    }

    #[test]
    fn direct_map_round_trips() {
        let pa = PhysAddr::new(0x80_0000);
        let va = phys_to_virt(pa);
        assert_eq!(virt_to_phys(va as usize), pa);
    }

    #[test]
    fn heap_window_sits_below_mmio() {
        assert!(KHEAP_START < MMIOBASE);
        assert_eq!(MMIOBASE - KHEAP_START, KHEAP_RESERVE);
        assert!(KHEAP_START > KERNBASE);
    }
}
