//! Page-directory and page-table manipulation.
//!
//! Two-level 32-bit paging: 1024 PDEs, each covering 4 MiB through a page
//! table of 1024 PTEs. Page tables are allocated on demand during mapping;
//! mapping over a present entry is an invariant violation and panics.

use bitflags::bitflags;

use super::frame;
use super::layout::{self, page_round_down, pdx, ptx, PhysAddr, NPDENTRIES, PGSIZE};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Page-table/page-directory entry flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT   = 1 << 0;
        const WRITABLE  = 1 << 1;
        const USER      = 1 << 2;
        const PWT       = 1 << 3;
        const PCD       = 1 << 4;
        const ACCESSED  = 1 << 5;
        const DIRTY     = 1 << 6;
        /// PAT bit in a PTE (selects the high half of the PAT).
        const PAT       = 1 << 7;
    }
}

/// Strong-uncached MMIO attribute set.
pub const MMIO_UNCACHED: PteFlags = PteFlags::WRITABLE.union(PteFlags::PCD).union(PteFlags::PWT);

/// Write-combining MMIO attribute set; selects PAT entry 1 (PWT set, PCD and
/// PAT clear), which `pat_init` programs as WC.
pub const MMIO_WRITE_COMBINING: PteFlags = PteFlags::WRITABLE.union(PteFlags::PWT);

/// Physical address bits of an entry.
#[inline]
pub const fn entry_addr(entry: u32) -> u32 {
    entry & !0xFFF
}

/// Flag bits of an entry.
#[inline]
pub const fn entry_flags(entry: u32) -> u32 {
    entry & 0xFFF
}

/// One page directory. The wrapper is a handle to the root frame (held via
/// its kernel direct-map address); ownership is by convention, as the
/// directory is ultimately torn down through `vm::free_user_vm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDirectory {
    root: *mut u32,
}

// SAFETY: `root` is a handle to a physical frame (accessed via its kernel
// direct-map address), not a thread-local resource; all access is through
// volatile reads/writes guarded by callers (e.g. the `KERNEL_SPACE` mutex).
unsafe impl Send for PageDirectory {}
// SAFETY: see above.
unsafe impl Sync for PageDirectory {}

impl PageDirectory {
    /// Allocate an empty page directory.
    pub fn alloc() -> KernelResult<Self> {
        let root = frame::alloc_zeroed_page().ok_or(KernelError::OutOfMemory)? as *mut u32;
        Ok(Self { root })
    }

    /// Wrap an existing root frame.
    ///
    /// # Safety
    /// `root` must point to a 4 KiB frame holding 1024 PDEs.
    pub unsafe fn from_root(root: *mut u32) -> Self {
        Self { root }
    }

    pub fn root_ptr(&self) -> *mut u32 {
        self.root
    }

    /// Physical address of the root frame, for CR3.
    pub fn root_phys(&self) -> PhysAddr {
        layout::virt_to_phys(self.root as usize)
    }

    pub fn pde(&self, index: usize) -> u32 {
        debug_assert!(index < NPDENTRIES);
        // SAFETY: root points to a full directory frame and index is in
        // bounds.
        unsafe { self.root.add(index).read_volatile() }
    }

    pub fn set_pde(&self, index: usize, value: u32) {
        debug_assert!(index < NPDENTRIES);
        // SAFETY: as pde().
        unsafe { self.root.add(index).write_volatile(value) }
    }

    /// Locate the PTE slot for `va`, optionally allocating the intermediate
    /// page table. Returns `None` when the table is absent (and `alloc` is
    /// false) or cannot be allocated.
    pub fn walk(&self, va: u32, alloc: bool) -> Option<*mut u32> {
        let pde = self.pde(pdx(va));
        let table = if pde & PteFlags::PRESENT.bits() != 0 {
            layout::phys_to_virt(PhysAddr(entry_addr(pde))) as *mut u32
        } else {
            if !alloc {
                return None;
            }
            let table = frame::alloc_zeroed_page()? as *mut u32;
            let table_pa = layout::virt_to_phys(table as usize);
            // Permissions here are generous; the PTE level restricts them
            // further where needed.
            self.set_pde(
                pdx(va),
                table_pa.0
                    | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER).bits(),
            );
            table
        };
        // SAFETY: table points to a full page-table frame and ptx(va) < 1024.
        Some(unsafe { table.add(ptx(va)) })
    }

    /// Resolve `va` to the physical address its PTE maps, with the entry's
    /// flags. Present entries only.
    pub fn resolve(&self, va: u32) -> Option<(PhysAddr, PteFlags)> {
        let pte_ptr = self.walk(va, false)?;
        // SAFETY: walk returned a valid PTE slot.
        let pte = unsafe { pte_ptr.read_volatile() };
        if pte & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        let flags = PteFlags::from_bits_truncate(entry_flags(pte));
        Some((PhysAddr(entry_addr(pte) | (va & 0xFFF)), flags))
    }

    /// Map `[va, va + size)` to `[pa, pa + size)` with `perm | PRESENT`.
    /// `va` need not be page-aligned; the mapping covers every touched page.
    /// Mapping over a present PTE panics: no silent remap.
    pub fn map_range(&self, va: u32, size: u32, pa: u32, perm: PteFlags) -> KernelResult<()> {
        debug_assert!(size > 0);
        let mut page = page_round_down(va);
        let last = page_round_down(va.wrapping_add(size - 1));
        let mut pa = pa;
        loop {
            let pte_ptr = self.walk(page, true).ok_or(KernelError::OutOfMemory)?;
            // SAFETY: walk returned a valid PTE slot.
            unsafe {
                if pte_ptr.read_volatile() & PteFlags::PRESENT.bits() != 0 {
                    panic!("map_range: remap at va {:#x}", page);
                }
                pte_ptr.write_volatile(pa | perm.bits() | PteFlags::PRESENT.bits());
            }
            if page == last {
                break;
            }
            page = page.wrapping_add(PGSIZE as u32);
            pa = pa.wrapping_add(PGSIZE as u32);
        }
        Ok(())
    }

    /// Clear the USER bit on the page mapping `va`. Used to create the
    /// inaccessible guard page below the user stack.
    pub fn clear_user(&self, va: u32) {
        let pte_ptr = self
            .walk(va, false)
            .unwrap_or_else(|| panic!("clear_user: no mapping at {:#x}", va));
        // SAFETY: walk returned a valid PTE slot.
        unsafe {
            let pte = pte_ptr.read_volatile();
            pte_ptr.write_volatile(pte & !PteFlags::USER.bits());
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn map_walk_resolve_round_trip() {
        let _guard = crate::hosted::bootstrap();
        let dir = PageDirectory::alloc().expect("page directory allocation should succeed");

        let frame = frame::alloc_page().expect("frame allocation should succeed");
        let pa = layout::virt_to_phys(frame as usize);

        dir.map_range(0x0040_0000, PGSIZE as u32, pa.0, PteFlags::WRITABLE | PteFlags::USER)
            .expect("mapping a single page should succeed");

        let (resolved, flags) = dir
            .resolve(0x0040_0123)
            .expect("resolve should find the mapping");
        assert_eq!(resolved.0, pa.0 | 0x123);
        assert!(flags.contains(PteFlags::WRITABLE | PteFlags::USER));

        assert!(dir.resolve(0x0050_0000).is_none(), "unmapped va resolves to none");
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remapping_a_present_page_panics() {
        let _guard = crate::hosted::bootstrap();
        let dir = PageDirectory::alloc().expect("page directory allocation should succeed");
        let frame = frame::alloc_page().expect("frame allocation should succeed");
        let pa = layout::virt_to_phys(frame as usize);
        dir.map_range(0x0080_0000, PGSIZE as u32, pa.0, PteFlags::WRITABLE)
            .expect("first mapping succeeds");
        // Second mapping of the same page must panic, not silently remap.
        let _ = dir.map_range(0x0080_0000, PGSIZE as u32, pa.0, PteFlags::WRITABLE);
    }

    #[test]
    fn clear_user_strips_the_user_bit() {
        let _guard = crate::hosted::bootstrap();
        let dir = PageDirectory::alloc().expect("page directory allocation should succeed");
        let frame = frame::alloc_page().expect("frame allocation should succeed");
        let pa = layout::virt_to_phys(frame as usize);
        dir.map_range(0x1000, PGSIZE as u32, pa.0, PteFlags::WRITABLE | PteFlags::USER)
            .expect("mapping succeeds");
        dir.clear_user(0x1000);
        let (_, flags) = dir.resolve(0x1000).expect("mapping still present");
        assert!(!flags.contains(PteFlags::USER));
    }

    #[test]
    fn wc_flags_select_pat_entry_one() {
        assert!(MMIO_WRITE_COMBINING.contains(PteFlags::PWT));
        assert!(!MMIO_WRITE_COMBINING.contains(PteFlags::PCD));
        assert!(!MMIO_WRITE_COMBINING.contains(PteFlags::PAT));
        assert!(MMIO_UNCACHED.contains(PteFlags::PCD | PteFlags::PWT));
    }
}
