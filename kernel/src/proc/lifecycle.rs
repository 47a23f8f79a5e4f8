//! Process lifecycle: creation, fork, exit, wait, kill, heap growth.

use core::sync::atomic::Ordering;

use crate::arch::x86::gdt::{DPL_USER, SEG_UCODE, SEG_UDATA};
use crate::config::NPROC;
use crate::error::{KernelError, KernelResult};
use crate::fs::{file, inode, path};
use crate::mm::layout::PGSIZE;
use crate::mm::page_table::PteFlags;
use crate::mm::{frame, vm};
use crate::proc::table::{self, PTABLE, INIT_SLOT};
use crate::proc::{Proc, ProcState};
use crate::sched::{self, cpu};

/// EFLAGS interrupt-enable bit for the initial user frame.
const FL_IF: u32 = 0x200;

/// Sleep channel identifying a process (used by wait/exit).
pub fn proc_channel(p: &Proc) -> usize {
    p as *const Proc as usize
}

/// Release everything a half-built child owns and return the slot.
fn unwind_child(np: &Proc) {
    // SAFETY: the embryo slot is owned by this path.
    let inner = unsafe { np.inner() };
    if let Some(dir) = inner.pagedir.take() {
        inner.vmas.clear(Some(dir));
        vm::free_user_vm(dir);
    } else {
        inner.vmas.clear(None);
    }
    for slot in inner.ofile.iter_mut() {
        if let Some(f) = slot.take() {
            file::close(f);
        }
    }
    if let Some(cwd) = inner.cwd.take() {
        inode::iput(cwd);
    }
    if inner.kstack != 0 {
        frame::free_page(inner.kstack as *mut u8);
        inner.kstack = 0;
    }
    PTABLE.lock.acquire();
    table::free_slot_locked(np);
    PTABLE.lock.release();
}

/// Create a child duplicating the current process. Returns the child pid
/// to the parent; the child wakes up in `forkret` with eax == 0.
pub fn fork() -> KernelResult<i32> {
    let parent = cpu::current_proc().ok_or(KernelError::NotFound)?;
    let np = table::alloc_proc().ok_or(KernelError::ResourceExhausted {
        resource: "process table",
    })?;

    // SAFETY: the parent is the running process; the child slot is EMBRYO
    // and owned here.
    let (p_inner, n_inner) = unsafe { (parent.inner(), np.inner()) };

    let parent_dir = p_inner.pagedir.ok_or(KernelError::NotFound)?;
    let child_dir = match vm::copy_user_vm(parent_dir, p_inner.brk) {
        Ok(dir) => dir,
        Err(e) => {
            unwind_child(np);
            return Err(e);
        }
    };
    n_inner.pagedir = Some(child_dir);
    n_inner.brk = p_inner.brk;

    // Deep-copy the VMA chain and re-map device areas in the child.
    n_inner.vmas.clone_from_list(&p_inner.vmas);
    if n_inner.vmas.map_device_areas(child_dir).is_err() {
        unwind_child(np);
        return Err(KernelError::OutOfMemory);
    }

    np.set_parent_slot(Some(PTABLE.slot_of(parent)));

    // The child resumes from the same trap frame, with fork() == 0.
    // SAFETY: both frames live at the top of their kernel stacks.
    unsafe {
        *n_inner.trap_frame = *p_inner.trap_frame;
        (*n_inner.trap_frame).eax = 0;
    }

    for (i, slot) in p_inner.ofile.iter().enumerate() {
        if let Some(f) = slot {
            n_inner.ofile[i] = Some(file::dup(*f));
        }
    }
    n_inner.cwd = p_inner.cwd.map(inode::idup);
    n_inner.cwd_path = p_inner.cwd_path;
    n_inner.name = p_inner.name;

    let pid = np.pid.load(Ordering::Acquire);

    PTABLE.lock.acquire();
    np.set_state(ProcState::Runnable);
    PTABLE.lock.release();

    Ok(pid)
}

/// Everything `exit` does short of the final context switch: release file
/// and directory references, detach device mappings, hand children to
/// init, wake the parent, and become a zombie. Returns with the process
/// table lock held.
pub(crate) fn exit_impl(p: &Proc) {
    let init_slot = INIT_SLOT.load(Ordering::Acquire);
    if table::PTABLE.slot_of(p) == init_slot {
        panic!("init exiting");
    }

    // SAFETY: `p` is the exiting process.
    let inner = unsafe { p.inner() };

    for slot in inner.ofile.iter_mut() {
        if let Some(f) = slot.take() {
            file::close(f);
        }
    }

    if let Some(cwd) = inner.cwd.take() {
        inode::iput(cwd);
    }
    inner.cwd_path = [0; crate::config::MAX_PATH];

    // Device mappings must leave the page tables before wait() tears the
    // directory down, or their frames would be mistaken for RAM.
    let dir = inner.pagedir;
    inner.vmas.clear(dir);

    PTABLE.lock.acquire();

    // Parent might be sleeping in wait().
    if let Some(parent_slot) = p.parent_slot() {
        sched::wakeup_locked(proc_channel(PTABLE.proc(parent_slot)));
    }

    // Pass abandoned children to init.
    let my_slot = PTABLE.slot_of(p);
    for slot in 0..NPROC {
        let q = PTABLE.proc(slot);
        if q.parent_slot() == Some(my_slot) {
            if init_slot < NPROC {
                q.set_parent_slot(Some(init_slot));
                if q.state() == ProcState::Zombie {
                    sched::wakeup_locked(proc_channel(PTABLE.proc(init_slot)));
                }
            } else {
                q.set_parent_slot(None);
            }
        }
    }

    p.set_state(ProcState::Zombie);
}

/// Terminate the current process. Never returns.
pub fn exit() -> ! {
    let p = cpu::current_proc().expect("exit with no process");
    exit_impl(p);
    // Jump into the scheduler, never to return.
    sched::switch_to_scheduler();
    panic!("zombie exit");
}

/// Reap one exited child: free its kernel stack and page directory, clear
/// the slot, and return its pid. With no children, returns Err; with live
/// children only, sleeps until one exits.
pub fn wait() -> KernelResult<i32> {
    let cur = cpu::current_proc().ok_or(KernelError::NotFound)?;
    let cur_slot = PTABLE.slot_of(cur);

    PTABLE.lock.acquire();
    loop {
        let mut have_kids = false;
        for slot in 0..NPROC {
            let q = PTABLE.proc(slot);
            if q.parent_slot() != Some(cur_slot) {
                continue;
            }
            have_kids = true;
            if q.state() != ProcState::Zombie {
                continue;
            }

            // Found one.
            let pid = q.pid.load(Ordering::Acquire);
            // SAFETY: the table lock is held and the child is a zombie.
            let q_inner = unsafe { q.inner() };
            if q_inner.kstack != 0 {
                frame::free_page(q_inner.kstack as *mut u8);
                q_inner.kstack = 0;
            }
            if let Some(dir) = q_inner.pagedir.take() {
                // Kernel heap and MMIO page tables shared with the master
                // directory survive; free_user_vm skips them.
                vm::free_user_vm(dir);
            }
            q_inner.vmas.clear(None);
            table::free_slot_locked(q);
            PTABLE.lock.release();
            return Ok(pid);
        }

        if !have_kids || cur.killed.load(Ordering::Acquire) {
            PTABLE.lock.release();
            return Err(KernelError::NotFound);
        }

        // Wait for a child to exit. (See the wakeup in exit_impl.)
        sched::sleep(proc_channel(cur), &PTABLE.lock);
    }
}

/// Flag a process for termination. A sleeper becomes runnable so it can
/// observe the flag; the actual exit happens at its next user-mode
/// boundary.
pub fn kill(pid: i32) -> KernelResult<()> {
    PTABLE.lock.acquire();
    for slot in 0..NPROC {
        let q = PTABLE.proc(slot);
        if q.state() != ProcState::Unused && q.pid.load(Ordering::Acquire) == pid {
            q.killed.store(true, Ordering::Release);
            if q.state() == ProcState::Sleeping {
                q.set_state(ProcState::Runnable);
            }
            PTABLE.lock.release();
            return Ok(());
        }
    }
    PTABLE.lock.release();
    Err(KernelError::NotFound)
}

/// Grow or shrink the current process's heap by `delta` bytes. Returns the
/// previous break.
pub fn resize_current(delta: i32) -> KernelResult<u32> {
    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    // SAFETY: `p` is the running process.
    let inner = unsafe { p.inner() };
    let dir = inner.pagedir.ok_or(KernelError::NotFound)?;

    inner.vmas.ensure_heap(inner.brk);
    let old = inner.brk;

    let new = if delta > 0 {
        let target = old
            .checked_add(delta as u32)
            .ok_or(KernelError::InvalidArgument { name: "delta" })?;
        vm::alloc_range(dir, old, target, PteFlags::WRITABLE | PteFlags::USER)?
    } else if delta < 0 {
        let shrink = delta.unsigned_abs();
        if shrink > old {
            return Err(KernelError::InvalidArgument { name: "delta" });
        }
        vm::dealloc_range(dir, old, old - shrink)
    } else {
        old
    };

    inner.brk = new;
    inner.vmas.update_heap(new);

    // Reload the address space so the TLB drops stale translations.
    sched::activate_process(p);
    Ok(old)
}

// ---------------------------------------------------------------------------
// First process
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod initcode {
    //! The embedded first user program: exec("/init", argv).

    use core::arch::global_asm;

    global_asm!(
        r#"
        .section .rodata
        .globl initcode_start
        .globl initcode_end
        initcode_start:
            pushl $(2f - initcode_start)      # argv
            pushl $(1f - initcode_start)      # "/init"
            pushl $0                          # fake return pc
            movl $7, %eax                     # SYS_exec
            int $64
        3:  jmp 3b
        1:  .asciz "/init"
            .p2align 2
        2:  .long 1b - initcode_start
            .long 0
        initcode_end:
        "#,
        options(att_syntax)
    );

    extern "C" {
        static initcode_start: u8;
        static initcode_end: u8;
    }

    pub fn bytes() -> &'static [u8] {
        // SAFETY: the symbols delimit the assembled blob above.
        unsafe {
            let start = core::ptr::addr_of!(initcode_start);
            let end = core::ptr::addr_of!(initcode_end);
            core::slice::from_raw_parts(start, end as usize - start as usize)
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod initcode {
    /// Hosted stand-in; never executed.
    pub fn bytes() -> &'static [u8] {
        &[0x90, 0x90, 0x90, 0x90]
    }
}

/// Create the first user process from the embedded initcode image.
pub fn user_init() {
    log::info!("[PROC] creating initial user process");

    let p = table::alloc_proc().expect("user_init: no process slots");
    INIT_SLOT.store(PTABLE.slot_of(p), Ordering::Release);

    let dir = vm::setup_kernel_pagedir().expect("user_init: out of memory");
    // SAFETY: the embryo slot is owned by this path.
    let inner = unsafe { p.inner() };
    inner.pagedir = Some(dir);

    // One page at virtual 0 holding the initcode image.
    let code = initcode::bytes();
    assert!(code.len() < PGSIZE, "initcode exceeds a page");
    let mem = frame::alloc_zeroed_page().expect("user_init: out of memory");
    let pa = crate::mm::layout::virt_to_phys(mem as usize);
    dir.map_range(
        0,
        PGSIZE as u32,
        pa.0,
        PteFlags::WRITABLE | PteFlags::USER,
    )
    .expect("user_init: mapping initcode failed");
    // SAFETY: mem is a fresh frame.
    unsafe { core::ptr::copy_nonoverlapping(code.as_ptr(), mem, code.len()) };

    inner.brk = PGSIZE as u32;

    // SAFETY: the trap frame sits on the fresh kernel stack.
    unsafe {
        let tf = &mut *inner.trap_frame;
        *tf = crate::trap::TrapFrame::zero();
        tf.cs = ((SEG_UCODE as u16) << 3) | DPL_USER;
        tf.ds = ((SEG_UDATA as u16) << 3) | DPL_USER;
        tf.es = tf.ds;
        tf.ss = tf.ds;
        tf.eflags = FL_IF;
        tf.esp = PGSIZE as u32;
        tf.eip = 0; // start of initcode
    }

    inner.set_name("initcode");
    if inode::is_filesystem_registered() {
        inner.cwd = path::namei("/").ok();
    }
    inner.set_cwd_path("/");
    inner.vmas.ensure_heap(inner.brk);

    PTABLE.lock.acquire();
    p.set_state(ProcState::Runnable);
    PTABLE.lock.release();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::file::FileKind;

    /// Build a runnable parent process with an address space and make it
    /// current on the emulated CPU.
    fn make_current_proc(user_pages: u32) -> &'static Proc {
        let p = table::alloc_proc().expect("proc slot");
        // SAFETY: embryo slot owned by the test.
        let inner = unsafe { p.inner() };
        let dir = vm::setup_kernel_pagedir().expect("dir");
        inner.pagedir = Some(dir);
        inner.brk = vm::alloc_range(
            dir,
            0,
            user_pages * PGSIZE as u32,
            PteFlags::WRITABLE | PteFlags::USER,
        )
        .expect("user pages");
        inner.vmas.ensure_heap(inner.brk);
        inner.set_name("test");
        p.set_state(ProcState::Running);
        cpu::this_cpu().set_current_slot(Some(PTABLE.slot_of(p)));
        p
    }

    fn teardown_current(p: &'static Proc) {
        cpu::this_cpu().set_current_slot(None);
        // SAFETY: test owns the slot.
        let inner = unsafe { p.inner() };
        inner.vmas.clear(None);
        for slot in inner.ofile.iter_mut() {
            if let Some(f) = slot.take() {
                file::close(f);
            }
        }
        if let Some(dir) = inner.pagedir.take() {
            vm::free_user_vm(dir);
        }
        if inner.kstack != 0 {
            frame::free_page(inner.kstack as *mut u8);
            inner.kstack = 0;
        }
        PTABLE.lock.acquire();
        table::free_slot_locked(p);
        PTABLE.lock.release();
    }

    #[test]
    fn fork_clones_memory_files_and_returns_child_pid() {
        let _guard = crate::hosted::bootstrap();
        cpu::reset_interrupt_state_for_test();

        let parent = make_current_proc(2);
        // Give the parent an open file and write a marker into its memory.
        let f = file::alloc(FileKind::None, true, false).expect("file");
        // SAFETY: test owns the running process.
        unsafe { parent.inner() }.ofile[3] = Some(f);
        let parent_dir = unsafe { parent.inner() }.pagedir.unwrap();
        vm::copy_out(parent_dir, 64, b"marker").expect("copy_out");

        let child_pid = fork().expect("fork should succeed");
        assert!(child_pid > 0);

        // Find the child and check it.
        let mut child = None;
        for slot in 0..NPROC {
            let q = PTABLE.proc(slot);
            if q.pid.load(Ordering::Relaxed) == child_pid {
                child = Some(q);
            }
        }
        let child = child.expect("child in table");
        assert_eq!(child.state(), ProcState::Runnable);
        assert_eq!(child.parent_slot(), Some(PTABLE.slot_of(parent)));

        // SAFETY: child is runnable but not scheduled; the test inspects it.
        let c_inner = unsafe { child.inner() };
        assert_eq!(c_inner.brk, unsafe { parent.inner() }.brk);
        let mut buf = [0u8; 6];
        vm::copy_in(c_inner.pagedir.unwrap(), &mut buf, 64).expect("child memory");
        assert_eq!(&buf, b"marker");
        // fork returns 0 in the child's frame.
        assert_eq!(unsafe { (*c_inner.trap_frame).eax }, 0);
        assert!(c_inner.ofile[3].is_some(), "open files are duplicated");

        // Reap the child via exit_impl + wait.
        cpu::this_cpu().set_current_slot(Some(PTABLE.slot_of(child)));
        exit_impl(child);
        PTABLE.lock.release();
        cpu::this_cpu().set_current_slot(Some(PTABLE.slot_of(parent)));
        let reaped = wait().expect("wait reaps the zombie");
        assert_eq!(reaped, child_pid);
        assert_eq!(child.state(), ProcState::Unused);

        teardown_current(parent);
    }

    #[test]
    fn fork_exit_wait_preserves_free_frames() {
        let _guard = crate::hosted::bootstrap();
        cpu::reset_interrupt_state_for_test();

        let parent = make_current_proc(4);
        let frames_before = frame::free_page_count();

        let child_pid = fork().expect("fork");
        let mut child = None;
        for slot in 0..NPROC {
            let q = PTABLE.proc(slot);
            if q.pid.load(Ordering::Relaxed) == child_pid {
                child = Some(q);
            }
        }
        let child = child.expect("child");

        cpu::this_cpu().set_current_slot(Some(PTABLE.slot_of(child)));
        exit_impl(child);
        PTABLE.lock.release();
        cpu::this_cpu().set_current_slot(Some(PTABLE.slot_of(parent)));
        wait().expect("reap");

        assert_eq!(
            frame::free_page_count(),
            frames_before,
            "fork/exit/wait must not leak frames"
        );

        teardown_current(parent);
    }

    #[test]
    fn wait_without_children_fails() {
        let _guard = crate::hosted::bootstrap();
        cpu::reset_interrupt_state_for_test();
        let p = make_current_proc(1);
        assert!(matches!(wait(), Err(KernelError::NotFound)));
        teardown_current(p);
    }

    #[test]
    fn kill_wakes_a_sleeping_process() {
        let _guard = crate::hosted::bootstrap();
        cpu::reset_interrupt_state_for_test();

        let p = make_current_proc(1);
        let pid = p.pid.load(Ordering::Relaxed);
        PTABLE.lock.acquire();
        p.set_channel(0xABCD);
        p.set_state(ProcState::Sleeping);
        PTABLE.lock.release();

        kill(pid).expect("kill by pid");
        assert!(p.killed.load(Ordering::Relaxed));
        assert_eq!(
            p.state(),
            ProcState::Runnable,
            "a sleeping target becomes runnable to observe the flag"
        );

        assert!(matches!(kill(999_999), Err(KernelError::NotFound)));

        p.set_state(ProcState::Running);
        teardown_current(p);
    }

    #[test]
    fn sbrk_round_trip_restores_the_break() {
        let _guard = crate::hosted::bootstrap();
        cpu::reset_interrupt_state_for_test();

        let p = make_current_proc(1);
        let base = unsafe { p.inner() }.brk;

        let old = resize_current(100_000).expect("grow");
        assert_eq!(old, base);
        let grown = unsafe { p.inner() }.brk;
        assert_eq!(grown, base + 100_000);

        let old = resize_current(-100_000).expect("shrink");
        assert_eq!(old, grown);
        assert_eq!(unsafe { p.inner() }.brk, base);

        // The heap VMA tracks the break.
        let heap_end = unsafe { p.inner() }
            .vmas
            .find(crate::proc::vma::VmaFlags::HEAP)
            .expect("heap vma")
            .end;
        assert_eq!(heap_end, base);

        teardown_current(p);
    }

    #[test]
    fn fork_with_full_table_unwinds_cleanly() {
        let _guard = crate::hosted::bootstrap();
        cpu::reset_interrupt_state_for_test();

        let parent = make_current_proc(1);
        let frames_before = frame::free_page_count();

        // Exhaust the table.
        let mut slots = std::vec::Vec::new();
        while let Some(q) = table::alloc_proc() {
            slots.push(PTABLE.slot_of(q));
        }
        let frames_held = frame::free_page_count();

        assert!(matches!(
            fork(),
            Err(KernelError::ResourceExhausted { .. })
        ));
        assert_eq!(
            frame::free_page_count(),
            frames_held,
            "failed fork must not leak frames"
        );

        for slot in slots {
            table::release_test_slot(slot);
        }
        assert_eq!(frame::free_page_count(), frames_before);
        teardown_current(parent);
    }
}
