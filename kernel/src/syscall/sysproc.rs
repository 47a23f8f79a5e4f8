//! Process-related system calls.

use core::sync::atomic::Ordering;

use super::{arg_int, arg_raw};
use crate::arch::x86::asm::{inb, outb, outw};
use crate::arch::x86::boot::FRAMEBUFFER;
use crate::config::NOFILE;
use crate::error::{KernelError, KernelResult};
use crate::fs::file::FileKind;
use crate::fs::inode::{self, InodeType};
use crate::mm::layout::{page_round_up, FB_MMAP_BASE};
use crate::proc::vma::{VmArea, VmaFlags, MAP_SHARED, PROT_READ, PROT_WRITE};
use crate::proc::lifecycle;
use crate::sched::{self, cpu};
use crate::trap;

pub fn sys_fork() -> KernelResult<i32> {
    lifecycle::fork()
}

pub fn sys_exit() -> KernelResult<i32> {
    lifecycle::exit();
}

pub fn sys_wait() -> KernelResult<i32> {
    lifecycle::wait()
}

pub fn sys_kill() -> KernelResult<i32> {
    let pid = arg_int(0)?;
    lifecycle::kill(pid)?;
    Ok(0)
}

pub fn sys_getpid() -> KernelResult<i32> {
    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    Ok(p.pid.load(Ordering::Acquire))
}

/// Adjust the program break; returns the previous break.
pub fn sys_sbrk() -> KernelResult<i32> {
    let delta = arg_int(0)?;
    let old = lifecycle::resize_current(delta)?;
    Ok(old as i32)
}

/// Sleep for n clock ticks; interrupted by kill.
pub fn sys_sleep() -> KernelResult<i32> {
    let n = arg_int(0)?;
    if n < 0 {
        return Err(KernelError::InvalidArgument { name: "ticks" });
    }

    trap::TICKS_LOCK.acquire();
    let start = trap::ticks();
    while trap::ticks().wrapping_sub(start) < n as u32 {
        let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
        if p.killed.load(Ordering::Acquire) {
            trap::TICKS_LOCK.release();
            return Err(KernelError::Interrupted);
        }
        sched::sleep(trap::ticks_channel(), &trap::TICKS_LOCK);
    }
    trap::TICKS_LOCK.release();
    Ok(0)
}

pub fn sys_uptime() -> KernelResult<i32> {
    trap::TICKS_LOCK.acquire();
    let ticks = trap::ticks();
    trap::TICKS_LOCK.release();
    Ok(ticks as i32)
}

pub fn sys_yield() -> KernelResult<i32> {
    sched::yield_cpu();
    Ok(0)
}

/// Pulse the keyboard controller's reset line.
pub fn sys_reboot() -> KernelResult<i32> {
    let mut good = 0x02;
    while good & 0x02 != 0 {
        good = inb(0x64);
    }
    outb(0x64, 0xFE);
    Ok(0)
}

/// Ask whichever hypervisor is listening to power off.
pub fn sys_shutdown() -> KernelResult<i32> {
    outw(0x604, 0x2000); // QEMU
    outw(0x4004, 0x3400); // VirtualBox
    outw(0xB004, 0x2000); // Bochs
    outw(0x600, 0x34); // Cloud hypervisors

    crate::arch::x86::asm::halt();
    Ok(0)
}

// ---------------------------------------------------------------------------
// mmap / munmap
// ---------------------------------------------------------------------------

/// Map the framebuffer into the caller at the fixed FB_MMAP_BASE address.
/// The framebuffer device is the only accepted mapping target; mapping it
/// twice returns the existing address.
fn mmap_framebuffer(length: u32, prot: u32, flags: u32, fd: usize, offset: u32) -> KernelResult<i32> {
    let fb = *FRAMEBUFFER.get().ok_or(KernelError::NotSupported)?;
    if offset != 0 {
        return Err(KernelError::InvalidArgument { name: "offset" });
    }
    if prot & PROT_WRITE == 0 || prot & PROT_READ == 0 {
        return Err(KernelError::InvalidArgument { name: "prot" });
    }
    if flags & MAP_SHARED == 0 {
        return Err(KernelError::InvalidArgument { name: "flags" });
    }
    let fb_phys = fb.addr as u32;
    if fb_phys % crate::mm::layout::PGSIZE as u32 != 0 {
        return Err(KernelError::InvalidArgument { name: "framebuffer" });
    }

    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    // SAFETY: the running process owns its VMA list.
    let inner = unsafe { p.inner() };
    let dir = inner.pagedir.ok_or(KernelError::NotFound)?;

    // Mapping the framebuffer twice yields the same address.
    if let Some(existing) = inner.vmas.find(VmaFlags::DEVICE) {
        return Ok(existing.start as i32);
    }

    let fb_size = fb.pitch * fb.height;
    let mut length = length;
    if length == 0 || length > fb_size {
        length = fb_size;
    }
    let length = page_round_up(length);

    let file = inner.ofile[fd].map(crate::fs::file::dup);

    let area = VmArea {
        start: FB_MMAP_BASE,
        end: FB_MMAP_BASE + length,
        prot,
        flags: VmaFlags::DEVICE,
        file,
        file_offset: 0,
        phys_addr: fb_phys,
    };

    let mut perm = crate::mm::page_table::PteFlags::USER
        | crate::mm::page_table::PteFlags::PCD
        | crate::mm::page_table::PteFlags::PWT;
    if prot & PROT_WRITE != 0 {
        perm |= crate::mm::page_table::PteFlags::WRITABLE;
    }
    if dir.map_range(area.start, length, fb_phys, perm).is_err() {
        if let Some(f) = area.file {
            crate::fs::file::close(f);
        }
        return Err(KernelError::OutOfMemory);
    }

    let start = area.start as i32;
    inner.vmas.push(area);
    Ok(start)
}

pub fn sys_mmap() -> KernelResult<i32> {
    let addr = arg_raw(0)?;
    let length = arg_int(1)?;
    let prot = arg_raw(2)?;
    let flags = arg_raw(3)?;
    let fd = arg_int(4)?;
    let offset = arg_raw(5)?;

    if addr != 0 && addr != FB_MMAP_BASE {
        return Err(KernelError::InvalidArgument { name: "addr" });
    }
    if length <= 0 {
        return Err(KernelError::InvalidArgument { name: "length" });
    }
    if fd < 0 || fd as usize >= NOFILE {
        return Err(KernelError::BadFileDescriptor);
    }

    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    // SAFETY: reading the caller's own descriptor table.
    let f = unsafe { p.inner() }.ofile[fd as usize].ok_or(KernelError::BadFileDescriptor)?;

    // Only device inodes with the framebuffer major are mappable.
    let ih = crate::fs::file::with_body(f, |body| match body.kind {
        FileKind::Inode(ih) => Some(ih),
        _ => None,
    })
    .ok_or(KernelError::BadFileDescriptor)?;

    let ip = inode::inode(ih);
    ip.ilock()?;
    let (typ, inum, major) = {
        let meta = ip.meta();
        (meta.typ, ip.inum(), meta.major)
    };
    ip.iunlock();
    if typ != InodeType::Dev {
        return Err(KernelError::BadFileDescriptor);
    }

    let major = crate::fs::devtab::lookup_major(inum, major);
    if major != crate::config::FRAMEBUFFER_MAJOR {
        return Err(KernelError::NotSupported);
    }

    mmap_framebuffer(length as u32, prot, flags, fd as usize, offset)
}

pub fn sys_munmap() -> KernelResult<i32> {
    let addr = arg_raw(0)?;
    let length = arg_int(1)?;
    if length <= 0 {
        return Err(KernelError::InvalidArgument { name: "length" });
    }

    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    // SAFETY: the running process owns its VMA list.
    let inner = unsafe { p.inner() };
    let dir = inner.pagedir.ok_or(KernelError::NotFound)?;
    inner.vmas.unmap_exact(dir, addr, length as u32)?;
    sched::activate_process(p);
    Ok(0)
}
