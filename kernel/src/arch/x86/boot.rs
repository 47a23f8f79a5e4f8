//! Multiboot v1 boot protocol.
//!
//! The bootloader leaves a physical pointer to a `MultibootInfo` in ebx.
//! The kernel consumes the memory map (AVAILABLE ranges feed the frame
//! allocator), the optional framebuffer descriptor, and the optional
//! configuration-table pointer used as a last-resort RSDP hint.

/// `flags` bit: `mem_lower`/`mem_upper` are valid.
pub const MULTIBOOT_INFO_MEMORY: u32 = 1 << 0;
/// `flags` bit: the memory map is valid.
pub const MULTIBOOT_INFO_MEM_MAP: u32 = 1 << 6;
/// `flags` bit: the framebuffer fields are valid.
pub const MULTIBOOT_INFO_FRAMEBUFFER: u32 = 1 << 12;

/// Memory-map entry type for usable RAM.
pub const MULTIBOOT_MEMORY_AVAILABLE: u32 = 1;

/// The multiboot information record, as laid down by the bootloader.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
    pub drives_length: u32,
    pub drives_addr: u32,
    pub config_table: u32,
    pub boot_loader_name: u32,
    pub apm_table: u32,
    pub vbe_control_info: u32,
    pub vbe_mode_info: u32,
    pub vbe_mode: u16,
    pub vbe_interface_seg: u16,
    pub vbe_interface_off: u16,
    pub vbe_interface_len: u16,
    pub framebuffer_addr: u64,
    pub framebuffer_pitch: u32,
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
    pub framebuffer_bpp: u8,
    pub framebuffer_type: u8,
    pub color_info: [u8; 6],
}

/// One raw memory-map entry. `size` does not include itself, so entries are
/// walked by `size + 4` bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct MmapEntry {
    pub size: u32,
    pub addr: u64,
    pub len: u64,
    pub kind: u32,
}

/// A decoded memory-map range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub addr: u64,
    pub len: u64,
    pub available: bool,
}

/// Iterator over the raw memory-map entries at a kernel-visible address.
pub struct MemoryMapIter {
    cursor: usize,
    end: usize,
}

impl MemoryMapIter {
    /// Walk `len` bytes of memory-map entries starting at `base` (a kernel
    /// virtual address).
    ///
    /// # Safety
    /// `base..base + len` must contain well-formed multiboot memory-map
    /// entries and stay mapped for the iterator's lifetime.
    pub unsafe fn new(base: usize, len: usize) -> Self {
        Self {
            cursor: base,
            end: base + len,
        }
    }
}

impl Iterator for MemoryMapIter {
    type Item = MemoryRange;

    fn next(&mut self) -> Option<MemoryRange> {
        while self.cursor + core::mem::size_of::<MmapEntry>() <= self.end {
            // SAFETY: cursor stays within the bounds handed to new(), and
            // MmapEntry is a packed plain-data struct.
            let entry = unsafe { core::ptr::read_unaligned(self.cursor as *const MmapEntry) };
            self.cursor += entry.size as usize + 4;
            if entry.len == 0 {
                continue;
            }
            return Some(MemoryRange {
                addr: entry.addr,
                len: entry.len,
                available: entry.kind == MULTIBOOT_MEMORY_AVAILABLE,
            });
        }
        None
    }
}

/// Framebuffer description pulled out of the multiboot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
}

/// The boot framebuffer, when the bootloader provided one. Set once during
/// early boot; consumed by the framebuffer ioctls and mmap.
pub static FRAMEBUFFER: spin::Once<FramebufferInfo> = spin::Once::new();

impl MultibootInfo {
    pub fn has_memory_map(&self) -> bool {
        self.flags & MULTIBOOT_INFO_MEM_MAP != 0 && self.mmap_length != 0
    }

    pub fn has_basic_memory(&self) -> bool {
        self.flags & MULTIBOOT_INFO_MEMORY != 0
    }

    /// The framebuffer descriptor, if the bootloader provided one with a
    /// physical address below 4 GiB.
    pub fn framebuffer(&self) -> Option<FramebufferInfo> {
        if self.flags & MULTIBOOT_INFO_FRAMEBUFFER == 0 {
            return None;
        }
        if self.framebuffer_addr == 0 || self.framebuffer_addr >> 32 != 0 {
            return None;
        }
        Some(FramebufferInfo {
            addr: self.framebuffer_addr,
            pitch: self.framebuffer_pitch,
            width: self.framebuffer_width,
            height: self.framebuffer_height,
            bpp: self.framebuffer_bpp,
        })
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod entry {
    //! Boot entry: multiboot header, provisional 4 MiB paging, and the jump
    //! into `kernel_main` on the boot stack.

    use core::arch::global_asm;

    global_asm!(
        r#"
        .set MB_MAGIC, 0x1BADB002
        .set MB_FLAGS, 0x3            # page-align modules + memory info
        .set KERNBASE, 0x80000000
        .set CR0_PG, 0x80000000
        .set CR0_WP, 0x00010000
        .set CR4_PSE, 0x00000010

        .section .multiboot
        .align 4
        .long MB_MAGIC
        .long MB_FLAGS
        .long -(MB_MAGIC + MB_FLAGS)

        .section .text
        .globl _start
        _start = entry - KERNBASE

        .globl entry
        entry:
            # Turn on 4 MiB pages for the provisional identity/high mapping.
            mov eax, cr4
            or eax, CR4_PSE
            mov cr4, eax

            lea eax, [entry_page_dir - KERNBASE]
            mov cr3, eax

            mov eax, cr0
            or eax, (CR0_PG | CR0_WP)
            mov cr0, eax

            lea esp, [boot_stack_top]
            push ebx                  # physical multiboot info pointer
            lea eax, [kernel_main]
            call eax
        1:  hlt
            jmp 1b

        .section .bss
        .align 16
        boot_stack:
            .space 8192
        boot_stack_top:
        "#
    );

    /// Provisional page directory: one 4 MiB page identity-mapping the first
    /// 4 MiB, and the same frame at KERNBASE so the high-half kernel can run
    /// before the real directory exists.
    #[no_mangle]
    #[link_section = ".data"]
    pub static entry_page_dir: EntryPageDir = {
        const PTE_P: u32 = 0x001;
        const PTE_W: u32 = 0x002;
        const PTE_PS: u32 = 0x080;
        let mut dir = [0u32; 1024];
        dir[0] = PTE_P | PTE_W | PTE_PS;
        dir[0x8000_0000usize >> 22] = PTE_P | PTE_W | PTE_PS;
        EntryPageDir(dir)
    };

    /// 4 KiB-aligned wrapper for the provisional directory.
    #[repr(C, align(4096))]
    pub struct EntryPageDir([u32; 1024]);

    // Application-processor trampoline. The startup IPI lands a fresh CPU
    // in real mode at a 4 KiB-aligned address below 1 MiB; this blob walks
    // it up to protected mode with paging and jumps to the Rust entry. The
    // boot CPU copies it to AP_BOOT_PHYS and stores the stack top, entry
    // function, and page-directory address in the three words just below.
    global_asm!(
        r#"
        .section .rodata
        .globl ap_trampoline_start
        .globl ap_trampoline_end
        .code16
        ap_trampoline_start:
            cli
            xorw %ax, %ax
            movw %ax, %ds
            movw %ax, %es
            movw %ax, %ss

            lgdtl (ap_gdt_desc - ap_trampoline_start + 0x7000)
            movl %cr0, %eax
            orl $1, %eax
            movl %eax, %cr0
            ljmpl $(1 << 3), $(ap_start32 - ap_trampoline_start + 0x7000)

        .code32
        ap_start32:
            movw $(2 << 3), %ax
            movw %ax, %ds
            movw %ax, %es
            movw %ax, %ss
            xorw %ax, %ax
            movw %ax, %fs
            movw %ax, %gs

            # 4 MiB pages for the provisional directory, then paging on.
            movl %cr4, %eax
            orl $0x10, %eax
            movl %eax, %cr4
            movl (0x7000 - 12), %eax
            movl %eax, %cr3
            movl %cr0, %eax
            orl $0x80010000, %eax       # PG | WP
            orl $1, %eax
            movl %eax, %cr0

            movl (0x7000 - 4), %esp
            movl (0x7000 - 8), %eax
            call *%eax
        1:  hlt
            jmp 1b

        .p2align 2
        ap_gdt:
            .quad 0
            .quad 0x00CF9A000000FFFF    # 32-bit code, flat
            .quad 0x00CF92000000FFFF    # 32-bit data, flat
        ap_gdt_desc:
            .word (ap_gdt_desc - ap_gdt - 1)
            .long (ap_gdt - ap_trampoline_start + 0x7000)
        ap_trampoline_end:
        "#,
        options(att_syntax)
    );

    extern "C" {
        pub static ap_trampoline_start: u8;
        pub static ap_trampoline_end: u8;
    }

    /// Physical address the trampoline is copied to.
    pub const AP_BOOT_PHYS: u32 = 0x7000;

    /// The assembled trampoline bytes.
    pub fn ap_trampoline() -> &'static [u8] {
        // SAFETY: the symbols delimit the blob above.
        unsafe {
            let start = core::ptr::addr_of!(ap_trampoline_start);
            let end = core::ptr::addr_of!(ap_trampoline_end);
            core::slice::from_raw_parts(start, end as usize - start as usize)
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use entry::{ap_trampoline, AP_BOOT_PHYS};
