//! System call dispatch.
//!
//! Arguments live on the user stack at `esp + 4 + 4n`; every fetch goes
//! through the caller's page tables, so a bad pointer turns into an error
//! rather than a kernel fault. Handlers return `KernelResult<i32>`; errors
//! become the negative values user space sees.

pub mod sysfile;
pub mod sysproc;

use core::sync::atomic::Ordering;

use crate::error::{KernelError, KernelResult};
use crate::mm::{vm, PageDirectory};
use crate::proc::Proc;
use crate::sched::cpu;
use crate::trap::TrapFrame;

// System call numbers.
pub const SYS_FORK: u32 = 1;
pub const SYS_EXIT: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_PIPE: u32 = 4;
pub const SYS_READ: u32 = 5;
pub const SYS_KILL: u32 = 6;
pub const SYS_EXEC: u32 = 7;
pub const SYS_FSTAT: u32 = 8;
pub const SYS_CHDIR: u32 = 9;
pub const SYS_DUP: u32 = 10;
pub const SYS_GETPID: u32 = 11;
pub const SYS_SBRK: u32 = 12;
pub const SYS_SLEEP: u32 = 13;
pub const SYS_UPTIME: u32 = 14;
pub const SYS_OPEN: u32 = 15;
pub const SYS_WRITE: u32 = 16;
pub const SYS_MKNOD: u32 = 17;
pub const SYS_UNLINK: u32 = 18;
pub const SYS_LINK: u32 = 19;
pub const SYS_MKDIR: u32 = 20;
pub const SYS_CLOSE: u32 = 21;
pub const SYS_LSEEK: u32 = 22;
pub const SYS_GETCWD: u32 = 23;
pub const SYS_IOCTL: u32 = 24;
pub const SYS_MMAP: u32 = 25;
pub const SYS_MUNMAP: u32 = 26;
pub const SYS_YIELD: u32 = 27;
pub const SYS_REBOOT: u32 = 28;
pub const SYS_SHUTDOWN: u32 = 29;

/// The current process and its page directory, for argument access.
fn caller() -> KernelResult<(&'static Proc, PageDirectory)> {
    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    // SAFETY: reading the running process's own fields.
    let dir = unsafe { p.inner() }
        .pagedir
        .ok_or(KernelError::NotFound)?;
    Ok((p, dir))
}

/// Fetch a 32-bit word from the caller's address space.
pub fn fetch_u32(addr: u32) -> KernelResult<u32> {
    let (_, dir) = caller()?;
    let mut bytes = [0u8; 4];
    vm::copy_in(dir, &mut bytes, addr)?;
    Ok(u32::from_le_bytes(bytes))
}

/// The n-th raw syscall argument from the user stack.
pub fn arg_raw(n: usize) -> KernelResult<u32> {
    let (p, _) = caller()?;
    // SAFETY: the running process owns its trap frame.
    let esp = unsafe { (*p.inner().trap_frame).esp };
    fetch_u32(esp.wrapping_add(4 + 4 * n as u32))
}

/// The n-th argument as a signed integer.
pub fn arg_int(n: usize) -> KernelResult<i32> {
    Ok(arg_raw(n)? as i32)
}

/// The n-th argument as a user pointer to `len` accessible bytes. Returns
/// the user virtual address after validating the whole range.
pub fn arg_ptr(n: usize, len: usize) -> KernelResult<u32> {
    let (_, dir) = caller()?;
    let uva = arg_raw(n)?;
    if len == 0 {
        return Ok(uva);
    }
    let end = uva
        .checked_add(len as u32 - 1)
        .ok_or(KernelError::InvalidAddress { addr: uva as usize })?;
    let mut page = crate::mm::layout::page_round_down(uva);
    loop {
        if vm::user_to_kernel_ptr(dir, page).is_none() {
            return Err(KernelError::InvalidAddress { addr: uva as usize });
        }
        if page >= crate::mm::layout::page_round_down(end) {
            break;
        }
        page = page.wrapping_add(crate::mm::layout::PGSIZE as u32);
    }
    Ok(uva)
}

/// The n-th argument as a NUL-terminated user string, copied into `buf`.
/// Returns the string length.
pub fn arg_str(n: usize, buf: &mut [u8]) -> KernelResult<usize> {
    let (_, dir) = caller()?;
    let uva = arg_raw(n)?;
    vm::fetch_str(dir, uva, buf)
}

/// Copy `src` to the n-th argument's pointed-to user memory.
pub fn copy_to_user(uva: u32, src: &[u8]) -> KernelResult<()> {
    let (_, dir) = caller()?;
    vm::copy_out(dir, uva, src)
}

/// Copy user memory at `uva` into `dst`.
pub fn copy_from_user(dst: &mut [u8], uva: u32) -> KernelResult<()> {
    let (_, dir) = caller()?;
    vm::copy_in(dir, dst, uva)
}

fn run(num: u32) -> KernelResult<i32> {
    match num {
        SYS_FORK => sysproc::sys_fork(),
        SYS_EXIT => sysproc::sys_exit(),
        SYS_WAIT => sysproc::sys_wait(),
        SYS_PIPE => sysfile::sys_pipe(),
        SYS_READ => sysfile::sys_read(),
        SYS_KILL => sysproc::sys_kill(),
        SYS_EXEC => sysfile::sys_exec(),
        SYS_FSTAT => sysfile::sys_fstat(),
        SYS_CHDIR => sysfile::sys_chdir(),
        SYS_DUP => sysfile::sys_dup(),
        SYS_GETPID => sysproc::sys_getpid(),
        SYS_SBRK => sysproc::sys_sbrk(),
        SYS_SLEEP => sysproc::sys_sleep(),
        SYS_UPTIME => sysproc::sys_uptime(),
        SYS_OPEN => sysfile::sys_open(),
        SYS_WRITE => sysfile::sys_write(),
        SYS_MKNOD => sysfile::sys_mknod(),
        SYS_UNLINK => sysfile::sys_unlink(),
        SYS_LINK => sysfile::sys_link(),
        SYS_MKDIR => sysfile::sys_mkdir(),
        SYS_CLOSE => sysfile::sys_close(),
        SYS_LSEEK => sysfile::sys_lseek(),
        SYS_GETCWD => sysfile::sys_getcwd(),
        SYS_IOCTL => sysfile::sys_ioctl(),
        SYS_MMAP => sysproc::sys_mmap(),
        SYS_MUNMAP => sysproc::sys_munmap(),
        SYS_YIELD => sysproc::sys_yield(),
        SYS_REBOOT => sysproc::sys_reboot(),
        SYS_SHUTDOWN => sysproc::sys_shutdown(),
        _ => Err(KernelError::NotSupported),
    }
}

/// Dispatch the system call in `tf` and produce its return value.
pub fn dispatch(tf: &TrapFrame) -> i32 {
    let num = tf.eax;
    if num == 0 || num > SYS_SHUTDOWN {
        if let Some(p) = cpu::current_proc() {
            // SAFETY: diagnostic read of our own name.
            let name = unsafe { p.inner() }.name_str();
            log::warn!(
                "[SYSCALL] pid {} ({}): unknown syscall {}",
                p.pid.load(Ordering::Relaxed),
                name,
                num
            );
        }
        return -1;
    }
    match run(num) {
        Ok(value) => value,
        Err(e) => e.to_errno(),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame;
    use crate::mm::layout::PGSIZE;
    use crate::mm::page_table::PteFlags;
    use crate::proc::table::{self, PTABLE};
    use crate::proc::ProcState;

    #[test]
    fn arguments_come_from_the_user_stack() {
        let _guard = crate::hosted::bootstrap();
        cpu::reset_interrupt_state_for_test();

        let p = table::alloc_proc().expect("slot");
        // SAFETY: the test owns the embryo slot.
        let inner = unsafe { p.inner() };
        let dir = vm::setup_kernel_pagedir().expect("dir");
        inner.pagedir = Some(dir);
        vm::alloc_range(dir, 0, 2 * PGSIZE as u32, PteFlags::WRITABLE | PteFlags::USER)
            .expect("user pages");
        inner.brk = 2 * PGSIZE as u32;
        // SAFETY: the trap frame sits on the fresh kernel stack.
        unsafe { (*inner.trap_frame).esp = 0x1000 };
        p.set_state(ProcState::Running);
        cpu::this_cpu().set_current_slot(Some(PTABLE.slot_of(p)));

        // Arguments at esp + 4: an int, a negative int, a string pointer.
        vm::copy_out(dir, 0x1004, &42u32.to_le_bytes()).expect("arg 0");
        vm::copy_out(dir, 0x1008, &(-7i32 as u32).to_le_bytes()).expect("arg 1");
        vm::copy_out(dir, 0x100C, &0x1800u32.to_le_bytes()).expect("arg 2");
        vm::copy_out(dir, 0x1800, b"hi\0").expect("string");

        assert_eq!(arg_raw(0).expect("raw"), 42);
        assert_eq!(arg_int(1).expect("int"), -7);
        let mut buf = [0u8; 8];
        assert_eq!(arg_str(2, &mut buf).expect("str"), 2);
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(arg_ptr(2, 4).expect("ptr"), 0x1800);

        // A pointer range leaving the mapped address space fails cleanly.
        assert!(matches!(
            arg_ptr(2, 8 * PGSIZE),
            Err(KernelError::InvalidAddress { .. })
        ));

        cpu::this_cpu().set_current_slot(None);
        // SAFETY: as above.
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
}
