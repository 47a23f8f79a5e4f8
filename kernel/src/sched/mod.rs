//! Scheduling: the per-CPU scheduler loop, context switching, and the
//! sleep/wakeup primitive.
//!
//! Each CPU runs `scheduler` forever: scan the process table for a Runnable
//! process, switch into it, and when it comes back keep scanning; with
//! nothing runnable, halt until the next interrupt. A process leaves the
//! CPU only through `switch_to_scheduler`, which requires the process-table
//! lock — that single lock is what makes sleep/wakeup race-free across
//! CPUs.

pub mod context;
pub mod cpu;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::x86::asm;
use crate::arch::x86::gdt::{self, SegDesc};
use crate::config::KSTACK_SIZE;
use crate::proc::table::PTABLE;
use crate::proc::{Proc, ProcState};
use crate::sync::spinlock::{pop_interrupt_disable, push_interrupt_disable};
use crate::sync::SpinLock;

/// Per-CPU scheduler loop. Never returns.
pub fn scheduler() -> ! {
    let cpu = cpu::this_cpu();
    cpu.set_current_slot(None);
    cpu.started.store(true, Ordering::Release);

    loop {
        // Enable interrupts on this processor.
        asm::irq_enable();

        let mut active = 0usize;
        PTABLE.lock.acquire();
        for slot in 0..crate::config::NPROC {
            let p = PTABLE.proc(slot);
            if p.state() != ProcState::Runnable {
                continue;
            }
            active += 1;

            // Switch to the chosen process. It is the process's job to
            // release the table lock and reacquire it before jumping back.
            cpu.set_current_slot(Some(slot));
            activate_process(p);
            p.set_state(ProcState::Running);

            // SAFETY: the table lock is held, interrupts are off, and the
            // scheduler context slot belongs to this CPU.
            unsafe {
                let inner = p.inner();
                context::switch_context(cpu.scheduler_ctx_slot(), inner.context);
            }
            crate::mm::vm::switch_kernel_page_directory();

            // The process is done for now; it changed its own state before
            // switching back.
            cpu.set_current_slot(None);
        }
        PTABLE.active_count.store(active, Ordering::Relaxed);
        PTABLE.lock.release();

        if active == 0 {
            // Idle: wait for the next interrupt with interrupts enabled,
            // or hlt never wakes up.
            asm::irq_enable();
            asm::halt();
        }
    }
}

/// Enter the scheduler after the current process moved itself out of
/// Running. Verifies the lock discipline that keeps wakeups from being
/// lost: exactly the process-table lock is held, interrupts are off.
pub fn switch_to_scheduler() {
    let p = cpu::current_proc().expect("switch_to_scheduler: no process");
    let cpu = cpu::this_cpu();

    if !PTABLE.lock.holding() {
        panic!("switch_to_scheduler: ptable lock not held");
    }
    if cpu.ncli.load(Ordering::Relaxed) != 1 {
        panic!("switch_to_scheduler: locks held");
    }
    if p.state() == ProcState::Running {
        panic!("switch_to_scheduler: process still running");
    }
    if asm::irq_enabled() {
        panic!("switch_to_scheduler: interruptible");
    }

    let interrupts_enabled = cpu.interrupts_enabled.load(Ordering::Relaxed);
    // SAFETY: lock discipline verified above; the context pointers belong
    // to this process and this CPU.
    unsafe {
        let inner = p.inner();
        context::switch_context(&mut inner.context, *cpu.scheduler_ctx_slot());
    }
    cpu::this_cpu()
        .interrupts_enabled
        .store(interrupts_enabled, Ordering::Relaxed);
}

/// Give up the CPU for one scheduling round.
pub fn yield_cpu() {
    PTABLE.lock.acquire();
    cpu::current_proc()
        .expect("yield with no process")
        .set_state(ProcState::Runnable);
    switch_to_scheduler();
    PTABLE.lock.release();
}

/// Atomically release `lk` and sleep on `chan`, reacquiring `lk` on wake.
///
/// The caller must hold `lk`. Taking the process-table lock before
/// releasing `lk` closes the window in which another CPU's `wakeup` could
/// run after we decide to sleep but before our state says so: `wakeup`
/// needs the same table lock to move sleepers to Runnable.
pub fn sleep(chan: usize, lk: &SpinLock) {
    let p = match cpu::current_proc() {
        Some(p) => p,
        None => {
            // Early boot, nothing to suspend.
            asm::irq_enable();
            return;
        }
    };

    let on_ptable = core::ptr::eq(lk, &PTABLE.lock);
    if !on_ptable {
        PTABLE.lock.acquire();
        lk.release();
    }

    p.set_channel(chan);
    p.set_state(ProcState::Sleeping);

    switch_to_scheduler();

    p.set_channel(0);

    if !on_ptable {
        PTABLE.lock.release();
        lk.acquire();
    }
}

/// Wake every process sleeping on `chan`. Caller holds the table lock.
pub fn wakeup_locked(chan: usize) {
    for p in PTABLE.procs().iter() {
        if p.state() == ProcState::Sleeping && p.channel() == chan {
            p.set_state(ProcState::Runnable);
        }
    }
}

/// Wake every process sleeping on `chan`.
pub fn wakeup(chan: usize) {
    PTABLE.lock.acquire();
    wakeup_locked(chan);
    PTABLE.lock.release();
}

// ---------------------------------------------------------------------------
// First return of a new process
// ---------------------------------------------------------------------------

static FIRST_RUN: AtomicBool = AtomicBool::new(true);
static FIRST_RUN_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Register work that must run once, in process context, before the first
/// process reaches user space (filesystem init sleeps, so it cannot run
/// from early boot).
pub fn set_first_run_hook(hook: fn()) {
    FIRST_RUN_HOOK.store(hook as usize, Ordering::Release);
}

/// Entry point for new processes on their first scheduled run. The
/// scheduler switched here with the table lock held; release it, run
/// one-time initialization, then fall through to the trap-return stub that
/// the kernel stack was seeded with.
pub extern "C" fn forkret() {
    // Still holding ptable.lock from the scheduler.
    PTABLE.lock.release();

    if FIRST_RUN.swap(false, Ordering::AcqRel) {
        let hook = FIRST_RUN_HOOK.load(Ordering::Acquire);
        if hook != 0 {
            // SAFETY: the value was stored from a fn() in set_first_run_hook.
            let hook: fn() = unsafe { core::mem::transmute(hook) };
            hook();
        }
    }
    // Returns to trapret (see alloc_proc), which enters user mode.
}

pub fn forkret_address() -> usize {
    forkret as usize
}

/// Load a process's address space and task state onto the calling CPU:
/// TSS.esp0 points at the kernel stack top, the task register is reloaded,
/// and CR3 switches to the process page directory.
pub fn activate_process(p: &Proc) {
    // SAFETY: caller guarantees the process is being scheduled on this CPU
    // (table lock held or self).
    let inner = unsafe { p.inner() };
    if inner.kstack == 0 {
        panic!("activate_process: no kernel stack");
    }
    let pagedir = inner.pagedir.expect("activate_process: no page directory");

    push_interrupt_disable();
    let cpu = cpu::this_cpu();
    // SAFETY: this CPU's segmentation state, interrupts disabled.
    let seg = unsafe { cpu.seg_state() };
    let tss_base = core::ptr::addr_of!(seg.task_state) as usize as u32;
    let tss_limit = (core::mem::size_of_val(&seg.task_state) - 1) as u32;
    seg.gdt[gdt::SEG_TSS] = SegDesc::system(gdt::STS_T32A, tss_base, tss_limit, 0);
    seg.task_state.ss0 = (gdt::SEG_KDATA as u16) << 3;
    seg.task_state.esp0 = (inner.kstack + KSTACK_SIZE) as u32;
    // An I/O map base beyond the TSS limit (with IOPL 0) forbids user-mode
    // port I/O.
    seg.task_state.iomb = 0xFFFF;
    asm::ltr((gdt::SEG_TSS as u16) << 3);
    asm::load_cr3(pagedir.root_phys().0);
    pop_interrupt_disable();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::vm;
    use crate::proc::table;

    #[test]
    fn wakeup_moves_exactly_matching_sleepers() {
        let _guard = crate::hosted::bootstrap();
        cpu::reset_interrupt_state_for_test();

        let dir_a = vm::setup_kernel_pagedir().expect("dir");
        let dir_b = vm::setup_kernel_pagedir().expect("dir");
        let a = table::alloc_for_test(dir_a);
        let b = table::alloc_for_test(dir_b);

        let chan_a = 0x1000usize;
        let chan_b = 0x2000usize;
        PTABLE.lock.acquire();
        PTABLE.proc(a).set_channel(chan_a);
        PTABLE.proc(a).set_state(ProcState::Sleeping);
        PTABLE.proc(b).set_channel(chan_b);
        PTABLE.proc(b).set_state(ProcState::Sleeping);
        PTABLE.lock.release();

        wakeup(chan_a);

        assert_eq!(
            PTABLE.proc(a).state(),
            ProcState::Runnable,
            "sleeper on the woken channel becomes runnable"
        );
        assert_eq!(
            PTABLE.proc(b).state(),
            ProcState::Sleeping,
            "sleeper on another channel stays asleep"
        );

        table::release_test_slot(a);
        table::release_test_slot(b);
        vm::free_user_vm(dir_a);
        vm::free_user_vm(dir_b);
    }

    #[test]
    fn wakeup_with_no_sleepers_is_harmless() {
        let _guard = crate::hosted::bootstrap();
        cpu::reset_interrupt_state_for_test();
        wakeup(0xDEAD_0000);
    }

    #[test]
    fn first_run_hook_runs_once() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        let _guard = crate::hosted::bootstrap();
        cpu::reset_interrupt_state_for_test();

        fn hook() {
            RAN.fetch_add(1, Ordering::Relaxed);
        }
        set_first_run_hook(hook);

        // Simulate two children reaching forkret; the hook must fire once.
        FIRST_RUN.store(true, Ordering::Release);
        PTABLE.lock.acquire();
        forkret();
        PTABLE.lock.acquire();
        forkret();
        assert_eq!(RAN.load(Ordering::Relaxed), 1);
    }
}
