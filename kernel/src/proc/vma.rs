//! User virtual-memory areas.
//!
//! Each process carries a small list of areas describing its heap and any
//! device mappings (the framebuffer). Fork deep-copies the list and
//! re-establishes device mappings in the child; munmap only accepts exact
//! device ranges.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};
use crate::fs::file::{self, FileHandle};
use crate::mm::page_table::PteFlags;
use crate::mm::{vm, PageDirectory};

/// mmap protection bits, as user space passes them.
pub const PROT_READ: u32 = 1;
pub const PROT_WRITE: u32 = 2;

/// mmap flags.
pub const MAP_SHARED: u32 = 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        /// The process heap, `[0, brk)`.
        const HEAP = 1 << 0;
        /// A physical device range (no frames to free on unmap).
        const DEVICE = 1 << 1;
    }
}

/// One contiguous user mapping.
#[derive(Debug, Clone)]
pub struct VmArea {
    pub start: u32,
    pub end: u32,
    pub prot: u32,
    pub flags: VmaFlags,
    pub file: Option<FileHandle>,
    pub file_offset: u32,
    pub phys_addr: u32,
}

/// The per-process area list.
#[derive(Debug)]
pub struct VmaList {
    areas: Vec<VmArea>,
}

impl VmaList {
    pub const fn new() -> Self {
        Self { areas: Vec::new() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmArea> {
        self.areas.iter()
    }

    pub fn find(&self, flags: VmaFlags) -> Option<&VmArea> {
        self.areas.iter().find(|a| a.flags.intersects(flags))
    }

    /// Make sure a heap area exists, creating one spanning `[0, brk)` if
    /// not, and return its index.
    pub fn ensure_heap(&mut self, brk: u32) -> usize {
        if let Some(i) = self.areas.iter().position(|a| a.flags.contains(VmaFlags::HEAP)) {
            return i;
        }
        self.areas.push(VmArea {
            start: 0,
            end: brk,
            prot: PROT_READ | PROT_WRITE,
            flags: VmaFlags::HEAP,
            file: None,
            file_offset: 0,
            phys_addr: 0,
        });
        self.areas.len() - 1
    }

    /// Track a heap size change.
    pub fn update_heap(&mut self, brk: u32) {
        let i = self.ensure_heap(brk);
        self.areas[i].start = 0;
        self.areas[i].end = brk;
    }

    pub fn push(&mut self, area: VmArea) {
        self.areas.push(area);
    }

    /// Deep-copy `src`, duplicating file references.
    pub fn clone_from_list(&mut self, src: &VmaList) {
        self.clear(None);
        for area in src.areas.iter() {
            let mut copy = area.clone();
            if let Some(f) = copy.file {
                copy.file = Some(file::dup(f));
            }
            self.areas.push(copy);
        }
    }

    /// Install every device area's physical mapping into `dir`. Used by
    /// fork after cloning the chain.
    pub fn map_device_areas(&self, dir: PageDirectory) -> KernelResult<()> {
        for area in self.areas.iter() {
            if !area.flags.contains(VmaFlags::DEVICE) {
                continue;
            }
            let mut perm = PteFlags::USER | PteFlags::PCD | PteFlags::PWT;
            if area.prot & PROT_WRITE != 0 {
                perm |= PteFlags::WRITABLE;
            }
            dir.map_range(area.start, area.end - area.start, area.phys_addr, perm)?;
        }
        Ok(())
    }

    /// Drop every area: unmap device ranges from `dir` (without freeing
    /// device frames) and release file references.
    pub fn clear(&mut self, dir: Option<PageDirectory>) {
        for area in self.areas.drain(..) {
            if area.flags.contains(VmaFlags::DEVICE) {
                if let Some(dir) = dir {
                    vm::unmap_range(dir, area.start, area.end, false);
                }
            }
            if let Some(f) = area.file {
                file::close(f);
            }
        }
    }

    /// Remove a device area exactly covering `[addr, addr + len)`,
    /// unmapping it from `dir`. Anything else is refused.
    pub fn unmap_exact(&mut self, dir: PageDirectory, addr: u32, len: u32) -> KernelResult<()> {
        let end = addr.checked_add(len).ok_or(KernelError::InvalidArgument { name: "length" })?;
        for (i, area) in self.areas.iter().enumerate() {
            if area.start == addr && end >= area.end {
                if !area.flags.contains(VmaFlags::DEVICE) {
                    return Err(KernelError::PermissionDenied);
                }
                vm::unmap_range(dir, area.start, area.end, false);
                let area = self.areas.remove(i);
                if let Some(f) = area.file {
                    file::close(f);
                }
                return Ok(());
            }
        }
        Err(KernelError::NotFound)
    }
}

impl Default for VmaList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn heap_area_is_created_once_and_tracks_brk() {
        let mut list = VmaList::new();
        let i = list.ensure_heap(0x3000);
        assert_eq!(i, list.ensure_heap(0x3000), "heap area must be unique");
        list.update_heap(0x5000);
        let heap = list.find(VmaFlags::HEAP).expect("heap exists");
        assert_eq!(heap.end, 0x5000);
        assert_eq!(heap.start, 0);
    }

    #[test]
    fn unmap_exact_requires_device_area_and_exact_start() {
        let _guard = crate::hosted::bootstrap();
        let dir = vm::setup_kernel_pagedir().expect("dir");
        let mut list = VmaList::new();
        list.ensure_heap(0x1000);
        list.push(VmArea {
            start: 0x4000_0000,
            end: 0x4000_2000,
            prot: PROT_READ | PROT_WRITE,
            flags: VmaFlags::DEVICE,
            file: None,
            file_offset: 0,
            phys_addr: 0xFD00_0000,
        });

        // Heap areas are not unmappable.
        assert!(matches!(
            list.unmap_exact(dir, 0, 0x1000),
            Err(KernelError::PermissionDenied)
        ));
        // Wrong start address.
        assert!(matches!(
            list.unmap_exact(dir, 0x4000_1000, 0x1000),
            Err(KernelError::NotFound)
        ));
        // Exact match removes the area.
        list.unmap_exact(dir, 0x4000_0000, 0x2000)
            .expect("exact device range must unmap");
        assert!(list.find(VmaFlags::DEVICE).is_none());

        list.clear(Some(dir));
        vm::free_user_vm(dir);
    }
}
