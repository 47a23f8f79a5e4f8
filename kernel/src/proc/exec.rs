//! exec: replace the current image with an ELF executable.
//!
//! The new image is built into a fresh page directory first; only after
//! every segment loaded does the process commit to it, so a bad binary
//! leaves the caller untouched.

use crate::config::MAX_ARG;
use crate::elf::{ElfHeader, ProgramHeader, PT_LOAD};
use crate::error::{KernelError, KernelResult};
use crate::fs::{inode, path};
use crate::mm::layout::{page_round_up, KERNBASE, PGSIZE};
use crate::mm::page_table::PteFlags;
use crate::mm::vm;
use crate::sched::cpu;

/// Pages for the user stack: one guard page plus one stack page.
const USER_STACK_PAGES: u32 = 2;

/// Load `path` and enter it with the given arguments. On success the
/// current process's trap frame points at the new entry; the old address
/// space is gone.
pub fn exec(path_str: &str, argv: &[&str]) -> KernelResult<()> {
    if argv.len() > MAX_ARG {
        return Err(KernelError::InvalidArgument { name: "argv" });
    }

    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;

    let ih = path::namei(path_str)?;
    let ip = inode::inode(ih);
    if let Err(e) = ip.ilock() {
        inode::iput(ih);
        return Err(e);
    }

    let result = load_image(ip, argv);
    inode::iunlockput(ih);
    let (dir, sz, entry, sp) = result?;

    // Commit: swap directories, then free the old image.
    // SAFETY: `p` is the running process.
    let inner = unsafe { p.inner() };
    let old_dir = inner.pagedir.replace(dir);
    inner.brk = sz;
    inner.vmas.clear(old_dir);
    inner.vmas.ensure_heap(sz);
    inner.vmas.update_heap(sz);

    // SAFETY: the trap frame lives at the top of the kernel stack.
    unsafe {
        let tf = &mut *inner.trap_frame;
        tf.eip = entry;
        tf.esp = sp;
        tf.eax = 0;
    }

    let name = path_str.rsplit('/').next().unwrap_or(path_str);
    inner.set_name(name);

    crate::sched::activate_process(p);

    if let Some(old) = old_dir {
        vm::free_user_vm(old);
    }
    Ok(())
}

/// Build the new address space: PT_LOAD segments, BSS, guard page, stack
/// with marshalled arguments. Returns `(dir, size, entry, initial esp)`.
fn load_image(
    ip: &inode::Inode,
    argv: &[&str],
) -> KernelResult<(crate::mm::PageDirectory, u32, u32, u32)> {
    let mut header_bytes = [0u8; core::mem::size_of::<ElfHeader>()];
    let n = ip.readi(&mut header_bytes, 0)?;
    if n != header_bytes.len() {
        return Err(KernelError::InvalidArgument { name: "image" });
    }
    let elf = ElfHeader::parse(&header_bytes).ok_or(KernelError::InvalidArgument {
        name: "elf header",
    })?;

    let dir = vm::setup_kernel_pagedir()?;

    let fail = |dir| {
        vm::free_user_vm(dir);
    };

    let mut sz = 0u32;
    for i in 0..elf.phnum {
        let off = elf.phoff + i as u32 * core::mem::size_of::<ProgramHeader>() as u32;
        let mut ph_bytes = [0u8; core::mem::size_of::<ProgramHeader>()];
        match ip.readi(&mut ph_bytes, off) {
            Ok(n) if n == ph_bytes.len() => {}
            _ => {
                fail(dir);
                return Err(KernelError::Io);
            }
        }
        let ph = ProgramHeader::parse(&ph_bytes).ok_or(KernelError::InvalidArgument {
            name: "program header",
        })?;
        if ph.ptype != PT_LOAD {
            continue;
        }

        // Sanity: no kernel-range or wrapping segments, file within memory
        // image, page-aligned start.
        if ph.memsz < ph.filesz
            || ph.vaddr.checked_add(ph.memsz).is_none()
            || ph.vaddr + ph.memsz >= KERNBASE
            || ph.vaddr % PGSIZE as u32 != 0
        {
            fail(dir);
            return Err(KernelError::InvalidArgument { name: "segment" });
        }

        sz = match vm::alloc_range(
            dir,
            sz,
            ph.vaddr + ph.memsz,
            PteFlags::WRITABLE | PteFlags::USER,
        ) {
            Ok(sz) => sz,
            Err(e) => {
                fail(dir);
                return Err(e);
            }
        };
        if let Err(e) = vm::load_user_segment(dir, ph.vaddr, ip, ph.off, ph.filesz) {
            fail(dir);
            return Err(e);
        }
        // BSS (memsz > filesz) is already zero: alloc_range hands out
        // zeroed frames.
    }

    // Guard page + stack page just above the image.
    sz = page_round_up(sz);
    sz = match vm::alloc_range(
        dir,
        sz,
        sz + USER_STACK_PAGES * PGSIZE as u32,
        PteFlags::WRITABLE | PteFlags::USER,
    ) {
        Ok(sz) => sz,
        Err(e) => {
            fail(dir);
            return Err(e);
        }
    };
    dir.clear_user(sz - USER_STACK_PAGES * PGSIZE as u32);

    // Marshal arguments onto the stack: string bytes on top, then the
    // argv array, argc and a fake return address below.
    let mut sp = sz;
    let mut arg_ptrs = [0u32; MAX_ARG + 1];
    for (i, arg) in argv.iter().enumerate() {
        sp = sp - (arg.len() as u32 + 1);
        sp &= !3; // word-align each string
        if let Err(e) = vm::copy_out(dir, sp, arg.as_bytes()) {
            fail(dir);
            return Err(e);
        }
        if let Err(e) = vm::copy_out(dir, sp + arg.len() as u32, &[0u8]) {
            fail(dir);
            return Err(e);
        }
        arg_ptrs[i] = sp;
    }
    arg_ptrs[argv.len()] = 0;

    // argv array.
    let argv_bytes = (argv.len() as u32 + 1) * 4;
    sp -= argv_bytes;
    let argv_base = sp;
    for (i, ptr) in arg_ptrs.iter().take(argv.len() + 1).enumerate() {
        if let Err(e) = vm::copy_out(dir, sp + i as u32 * 4, &ptr.to_le_bytes()) {
            fail(dir);
            return Err(e);
        }
    }

    // argv pointer, argc, fake return PC.
    for value in [argv_base, argv.len() as u32, 0xFFFF_FFFF] {
        sp -= 4;
        if let Err(e) = vm::copy_out(dir, sp, &value.to_le_bytes()) {
            fail(dir);
            return Err(e);
        }
    }

    Ok((dir, sz, elf.entry, sp))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::elf::{ELF_CLASS_32, ELF_MAGIC};
    use crate::mm::frame;
    use crate::proc::table::{self, PTABLE};
    use crate::proc::ProcState;
    use std::vec::Vec;

    /// A minimal valid ELF32 image: one PT_LOAD segment at 0x1000 with 16
    /// code bytes, entry at 0x1000.
    fn build_elf() -> Vec<u8> {
        let mut image = std::vec![0u8; 0x200];
        // ELF header.
        image[0..4].copy_from_slice(&ELF_MAGIC.to_le_bytes());
        image[4] = ELF_CLASS_32;
        image[5] = 1; // little-endian
        image[6] = 1; // version
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        image[24..28].copy_from_slice(&0x1000u32.to_le_bytes()); // entry
        image[28..32].copy_from_slice(&52u32.to_le_bytes()); // phoff
        image[42..44].copy_from_slice(&32u16.to_le_bytes()); // phentsize
        image[44..46].copy_from_slice(&1u16.to_le_bytes()); // phnum
        // Program header at 52.
        let ph = 52;
        image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[ph + 4..ph + 8].copy_from_slice(&0x100u32.to_le_bytes()); // off
        image[ph + 8..ph + 12].copy_from_slice(&0x1000u32.to_le_bytes()); // vaddr
        image[ph + 16..ph + 20].copy_from_slice(&16u32.to_le_bytes()); // filesz
        image[ph + 20..ph + 24].copy_from_slice(&64u32.to_le_bytes()); // memsz
        // Segment payload at 0x100.
        for i in 0..16 {
            image[0x100 + i] = 0xB0 + i as u8;
        }
        image
    }

    #[test]
    fn exec_builds_the_new_image_and_stack() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();
        crate::fs::ramfs::init_for_test();

        let image = build_elf();
        crate::fs::ramfs::populate(&[("/bin", None), ("/bin/true", Some(image.as_slice()))]);

        // A current process to exec in.
        let p = table::alloc_proc().expect("slot");
        // SAFETY: test owns the embryo slot.
        let inner = unsafe { p.inner() };
        let dir = vm::setup_kernel_pagedir().expect("dir");
        inner.pagedir = Some(dir);
        inner.brk = vm::alloc_range(dir, 0, PGSIZE as u32, PteFlags::WRITABLE | PteFlags::USER)
            .expect("old image");
        p.set_state(ProcState::Running);
        cpu::this_cpu().set_current_slot(Some(PTABLE.slot_of(p)));

        exec("/bin/true", &["true", "-v"]).expect("exec must succeed");

        // SAFETY: test owns the running process.
        let inner = unsafe { p.inner() };
        let new_dir = inner.pagedir.expect("new directory installed");
        assert_ne!(new_dir, dir, "exec must install a fresh directory");

        // Segment bytes landed at the right place; BSS is zero.
        let mut buf = [0u8; 16];
        vm::copy_in(new_dir, &mut buf, 0x1000).expect("segment readable");
        for (i, &b) in buf.iter().enumerate() {
            assert_eq!(b, 0xB0 + i as u8);
        }
        let mut bss = [0xFFu8; 8];
        vm::copy_in(new_dir, &mut bss, 0x1010).expect("bss readable");
        assert_eq!(bss, [0u8; 8]);

        // Trap frame enters at the ELF entry with a stack below the top.
        // SAFETY: trap frame belongs to the process.
        let (eip, esp) = unsafe { ((*inner.trap_frame).eip, (*inner.trap_frame).esp) };
        assert_eq!(eip, 0x1000);
        assert!(esp < inner.brk);

        // The stack holds a fake return PC, argc, argv pointer.
        let mut word = [0u8; 4];
        vm::copy_in(new_dir, &mut word, esp).expect("stack readable");
        assert_eq!(u32::from_le_bytes(word), 0xFFFF_FFFF);
        vm::copy_in(new_dir, &mut word, esp + 4).expect("argc");
        assert_eq!(u32::from_le_bytes(word), 2);
        vm::copy_in(new_dir, &mut word, esp + 8).expect("argv ptr");
        let argv_base = u32::from_le_bytes(word);
        vm::copy_in(new_dir, &mut word, argv_base).expect("argv[0]");
        let arg0 = u32::from_le_bytes(word);
        let mut name = [0u8; 4];
        vm::copy_in(new_dir, &mut name, arg0).expect("argv[0] string");
        assert_eq!(&name, b"true");

        // The guard page below the stack is not user-accessible.
        let guard_va = inner.brk - 2 * PGSIZE as u32;
        assert!(
            vm::user_to_kernel_ptr(new_dir, guard_va).is_none(),
            "guard page must not be user-accessible"
        );

        assert_eq!(inner.name_str(), "true");

        // Cleanup.
        cpu::this_cpu().set_current_slot(None);
        let inner = unsafe { p.inner() };
        inner.vmas.clear(None);
        if let Some(d) = inner.pagedir.take() {
            vm::free_user_vm(d);
        }
        frame::free_page(inner.kstack as *mut u8);
        inner.kstack = 0;
        PTABLE.lock.acquire();
        table::free_slot_locked(p);
        PTABLE.lock.release();
    }

    #[test]
    fn exec_of_a_bad_image_leaves_the_process_intact() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();
        crate::fs::ramfs::init_for_test();

        crate::fs::ramfs::populate(&[("/bin", None), ("/bin/junk", Some(b"not an elf".as_slice()))]);

        let p = table::alloc_proc().expect("slot");
        // SAFETY: test owns the slot.
        let inner = unsafe { p.inner() };
        let dir = vm::setup_kernel_pagedir().expect("dir");
        inner.pagedir = Some(dir);
        inner.brk = vm::alloc_range(dir, 0, PGSIZE as u32, PteFlags::WRITABLE | PteFlags::USER)
            .expect("old image");
        p.set_state(ProcState::Running);
        cpu::this_cpu().set_current_slot(Some(PTABLE.slot_of(p)));

        let frames = frame::free_page_count();
        assert!(exec("/bin/junk", &[]).is_err());
        assert!(exec("/bin/missing", &[]).is_err());

        // SAFETY: as above.
        let inner = unsafe { p.inner() };
        assert_eq!(inner.pagedir, Some(dir), "old directory must survive");
        assert_eq!(frame::free_page_count(), frames, "no frames leaked");

        cpu::this_cpu().set_current_slot(None);
        inner.vmas.clear(None);
        vm::free_user_vm(dir);
        inner.pagedir = None;
        frame::free_page(inner.kstack as *mut u8);
        inner.kstack = 0;
        PTABLE.lock.acquire();
        table::free_slot_locked(p);
        PTABLE.lock.release();
    }
}
