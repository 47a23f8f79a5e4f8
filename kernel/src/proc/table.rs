//! The process table.
//!
//! A fixed arena of `NPROC` slots under a single spinlock. Allocation scans
//! for an Unused slot; teardown happens in `wait` (normal reaping) or on
//! allocation failure paths.

use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::config::{KSTACK_SIZE, NPROC};
use crate::mm::frame;
use crate::proc::{Proc, ProcState};
use crate::sched::context::Context;
use crate::sync::SpinLock;
use crate::trap::TrapFrame;

/// The global process table.
pub struct ProcTable {
    pub lock: SpinLock,
    procs: [Proc; NPROC],
    /// Runnable processes seen in the last scheduler scan; idle detection.
    pub active_count: AtomicUsize,
}

pub static PTABLE: ProcTable = ProcTable {
    lock: SpinLock::new("ptable"),
    procs: [const { Proc::new() }; NPROC],
    active_count: AtomicUsize::new(0),
};

/// Next PID to assign.
static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// Slot index of the init process, once created.
pub static INIT_SLOT: AtomicUsize = AtomicUsize::new(usize::MAX);

impl ProcTable {
    pub fn procs(&self) -> &[Proc; NPROC] {
        &self.procs
    }

    pub fn proc(&'static self, slot: usize) -> &'static Proc {
        &self.procs[slot]
    }

    /// Slot index of a process record.
    pub fn slot_of(&self, p: &Proc) -> usize {
        let base = self.procs.as_ptr() as usize;
        let addr = p as *const Proc as usize;
        (addr - base) / core::mem::size_of::<Proc>()
    }
}

/// Allocate a process slot in EMBRYO state with a fresh pid and an
/// initialized kernel stack, ready to be scheduled through `forkret`.
/// Returns `None` when the table or memory is exhausted.
pub fn alloc_proc() -> Option<&'static Proc> {
    PTABLE.lock.acquire();

    let mut found = None;
    for p in PTABLE.procs().iter() {
        if p.state() == ProcState::Unused {
            found = Some(p);
            break;
        }
    }

    let p = match found {
        Some(p) => p,
        None => {
            PTABLE.lock.release();
            return None;
        }
    };

    p.set_state(ProcState::Embryo);
    p.pid.store(NEXT_PID.fetch_add(1, Ordering::Relaxed), Ordering::Release);
    PTABLE.lock.release();

    // Allocate and lay out the kernel stack outside the lock.
    let kstack = match frame::alloc_page() {
        Some(ptr) => ptr as usize,
        None => {
            p.set_state(ProcState::Unused);
            return None;
        }
    };

    // SAFETY: the slot is EMBRYO and owned by this path.
    let inner = unsafe { p.inner() };
    inner.kstack = kstack;
    inner.vmas.clear(None);

    let mut sp = kstack + KSTACK_SIZE;

    // Room for the trap frame.
    sp -= core::mem::size_of::<TrapFrame>();
    inner.trap_frame = sp as *mut TrapFrame;

    // Return address for forkret: the trap-return stub.
    sp -= 4;
    // SAFETY: sp stays within the fresh kernel stack page.
    unsafe { (sp as *mut u32).write(trapret_address() as u32) };

    // Initial context: start executing at forkret.
    sp -= core::mem::size_of::<Context>();
    let ctx = sp as *mut Context;
    // SAFETY: as above.
    unsafe {
        ctx.write(Context::zero());
        (*ctx).eip = crate::sched::forkret_address() as u32;
    }
    inner.context = ctx;

    Some(p)
}

fn trapret_address() -> usize {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        crate::arch::x86::trap_entry::trapret as usize
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        0
    }
}

/// Reset a slot to UNUSED. Caller holds the process-table lock and has
/// already released the kernel stack and page directory.
pub fn free_slot_locked(p: &Proc) {
    // SAFETY: the process-table lock is held.
    let inner = unsafe { p.inner() };
    inner.pagedir = None;
    inner.kstack = 0;
    inner.brk = 0;
    inner.trap_frame = core::ptr::null_mut();
    inner.context = core::ptr::null_mut();
    inner.name = [0; crate::config::PROC_NAME_LEN];
    inner.cwd = None;
    inner.cwd_path = [0; crate::config::MAX_PATH];
    p.pid.store(0, Ordering::Release);
    p.set_parent_slot(None);
    p.killed.store(false, Ordering::Release);
    p.set_channel(0);
    p.set_state(ProcState::Unused);
}

/// Emit a process listing for debugging. Takes no locks so it stays usable
/// on a wedged system.
pub fn procdump() {
    for p in PTABLE.procs().iter() {
        let state = p.state();
        if state == ProcState::Unused {
            continue;
        }
        // SAFETY: lock-free diagnostic read; the name may be mid-update but
        // is always NUL-padded.
        let name = unsafe { p.inner() }.name_str();
        crate::println!(
            "{} pid: {}, state: {}",
            name,
            p.pid.load(Ordering::Relaxed),
            state.name()
        );
    }
}

/// Test support: claim a slot as a fake live process owning `dir`.
#[cfg(not(target_os = "none"))]
pub fn alloc_for_test(dir: crate::mm::PageDirectory) -> usize {
    let p = alloc_proc().expect("test process slot");
    // SAFETY: the slot is EMBRYO and owned by the test.
    unsafe { p.inner() }.pagedir = Some(dir);
    p.set_state(ProcState::Runnable);
    PTABLE.slot_of(p)
}

/// Test support: release a slot claimed by `alloc_for_test`. The caller
/// frees the page directory itself.
#[cfg(not(target_os = "none"))]
pub fn release_test_slot(slot: usize) {
    let p = PTABLE.proc(slot);
    // SAFETY: the test owns the slot.
    let inner = unsafe { p.inner() };
    if inner.kstack != 0 {
        frame::free_page(inner.kstack as *mut u8);
    }
    PTABLE.lock.acquire();
    free_slot_locked(p);
    PTABLE.lock.release();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn alloc_assigns_unique_pids_and_kernel_stacks() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();

        let a = alloc_proc().expect("first slot");
        let b = alloc_proc().expect("second slot");

        assert_eq!(a.state(), ProcState::Embryo);
        assert_ne!(
            a.pid.load(Ordering::Relaxed),
            b.pid.load(Ordering::Relaxed),
            "pids must be unique"
        );
        // SAFETY: test owns both embryo slots.
        let (ia, ib) = unsafe { (a.inner(), b.inner()) };
        assert_ne!(ia.kstack, 0);
        assert_ne!(ia.kstack, ib.kstack);
        assert!(!ia.context.is_null());
        assert!(!ia.trap_frame.is_null());

        // The context sits below the trap frame on the same page.
        assert!((ia.context as usize) < (ia.trap_frame as usize));
        assert!(ia.trap_frame as usize + core::mem::size_of::<TrapFrame>() <= ia.kstack + KSTACK_SIZE);

        release_test_slot(PTABLE.slot_of(a));
        release_test_slot(PTABLE.slot_of(b));
    }

    #[test]
    fn table_exhaustion_returns_none_without_leaking_frames() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();
        let frames_before = frame::free_page_count();

        let mut slots = std::vec::Vec::new();
        while let Some(p) = alloc_proc() {
            slots.push(PTABLE.slot_of(p));
        }
        assert!(slots.len() <= NPROC);
        assert!(alloc_proc().is_none(), "full table must refuse allocation");

        for slot in slots {
            release_test_slot(slot);
        }
        assert_eq!(
            frame::free_page_count(),
            frames_before,
            "slot churn must not leak kernel stacks"
        );
    }
}
