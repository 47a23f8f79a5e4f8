//! Per-CPU state.
//!
//! A fixed array of CPU records, indexed by position in the discovery
//! order. On bare metal the current CPU is found by matching the LAPIC id;
//! hosted builds resolve it from a thread-local index, so the lock and
//! scheduler state machines run under the test harness unchanged.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::arch::x86::asm;
use crate::arch::x86::gdt::SegState;
use crate::config::NCPU;
use crate::mm::PageDirectory;
use crate::proc::table::PTABLE;
use crate::proc::Proc;
use crate::sched::context::Context;

/// Per-CPU record.
pub struct Cpu {
    /// Local APIC id of this CPU.
    pub apic_id: AtomicU32,
    /// Has this CPU entered its scheduler loop?
    pub started: AtomicBool,
    /// Depth of push_interrupt_disable nesting.
    pub ncli: AtomicI32,
    /// Were interrupts enabled before the outermost push?
    pub interrupts_enabled: AtomicBool,
    /// Where switch_context saves the scheduler's context; written by the
    /// context-switch machinery on this CPU only.
    scheduler_ctx: UnsafeCell<*mut Context>,
    /// Slot index + 1 of the running process; 0 when idle.
    current: AtomicUsize,
    /// GDT and TSS, touched only by this CPU with interrupts disabled.
    seg: UnsafeCell<SegState>,
}

// SAFETY: all fields are atomics except `seg` and `scheduler_ctx`, which
// are only accessed by the owning CPU while interrupts are disabled.
unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new() -> Self {
        Self {
            apic_id: AtomicU32::new(0),
            started: AtomicBool::new(false),
            ncli: AtomicI32::new(0),
            interrupts_enabled: AtomicBool::new(false),
            scheduler_ctx: UnsafeCell::new(core::ptr::null_mut()),
            current: AtomicUsize::new(0),
            seg: UnsafeCell::new(SegState::new()),
        }
    }

    /// This CPU's segmentation state.
    ///
    /// # Safety
    /// Only the owning CPU may call this, with interrupts disabled.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn seg_state(&self) -> &mut SegState {
        // SAFETY: per the function contract.
        unsafe { &mut *self.seg.get() }
    }

    /// Storage slot for the scheduler context pointer.
    ///
    /// # Safety
    /// Only the owning CPU may use this, with interrupts disabled.
    pub unsafe fn scheduler_ctx_slot(&self) -> *mut *mut Context {
        self.scheduler_ctx.get()
    }

    /// Slot index of the running process, if any.
    pub fn current_slot(&self) -> Option<usize> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            n => Some(n - 1),
        }
    }

    pub fn set_current_slot(&self, slot: Option<usize>) {
        self.current
            .store(slot.map_or(0, |s| s + 1), Ordering::Release);
    }
}

static CPUS: [Cpu; NCPU] = [const { Cpu::new() }; NCPU];

/// Number of CPUs discovered at boot.
static CPU_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Record a CPU found during SMP discovery. Returns false when the table is
/// full or the APIC id is already present.
pub fn record_cpu(apic_id: u32) -> bool {
    let count = CPU_COUNT.load(Ordering::Acquire);
    for cpu in CPUS.iter().take(count) {
        if cpu.apic_id.load(Ordering::Relaxed) == apic_id {
            return false;
        }
    }
    if count >= NCPU {
        return false;
    }
    CPUS[count].apic_id.store(apic_id, Ordering::Relaxed);
    CPU_COUNT.store(count + 1, Ordering::Release);
    true
}

/// Number of CPUs known to the kernel. At least 1 once discovery ran.
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire).max(1)
}

/// The calling CPU's index.
///
/// On bare metal the APIC ids are not guaranteed contiguous, so the CPU
/// array is searched. Interrupts must be disabled so the answer cannot go
/// stale under migration.
pub fn cpu_index() -> usize {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        if asm::irq_enabled() {
            panic!("cpu_index called with interrupts enabled");
        }
        let apic_id = crate::irq::lapic::id();
        let count = cpu_count();
        for (i, cpu) in CPUS.iter().enumerate().take(count) {
            if cpu.apic_id.load(Ordering::Relaxed) == apic_id {
                return i;
            }
        }
        panic!("cpu_index: unknown apic id {}", apic_id);
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        asm::hosted_cpu_index()
    }
}

/// The calling CPU's record.
pub fn this_cpu() -> &'static Cpu {
    &CPUS[cpu_index()]
}

/// CPU record by index.
pub fn cpu(index: usize) -> &'static Cpu {
    &CPUS[index]
}

/// The process running on the calling CPU, if any. Wraps the lookup in an
/// interrupt-disable pair so a timer interrupt cannot migrate the caller
/// mid-read.
pub fn current_proc() -> Option<&'static Proc> {
    crate::sync::push_interrupt_disable();
    let slot = this_cpu().current_slot();
    crate::sync::pop_interrupt_disable();
    slot.map(|s| PTABLE.proc(s))
}

/// Page directory of the running process, if any. Used by the MMIO
/// propagation path to decide which directory to reload into CR3.
pub fn current_pagedir() -> Option<PageDirectory> {
    crate::sync::push_interrupt_disable();
    let slot = this_cpu().current_slot();
    let dir = slot.and_then(|s| {
        let p = PTABLE.proc(s);
        // SAFETY: reading the running process's own directory field; it
        // cannot be torn down while the process runs.
        unsafe { p.inner() }.pagedir
    });
    crate::sync::pop_interrupt_disable();
    dir
}

/// Reset the calling CPU's interrupt bookkeeping. Test support: a panicking
/// test can leak interrupt-disable depth, which would poison later tests.
#[cfg(not(target_os = "none"))]
pub fn reset_interrupt_state_for_test() {
    let cpu = this_cpu();
    cpu.ncli.store(0, Ordering::Relaxed);
    cpu.interrupts_enabled.store(false, Ordering::Relaxed);
    cpu.set_current_slot(None);
    asm::irq_enable();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn record_cpu_deduplicates_apic_ids() {
        let _guard = crate::hosted::lock();
        let before = CPU_COUNT.load(Ordering::Relaxed);
        assert!(record_cpu(0xA0));
        assert!(!record_cpu(0xA0), "duplicate APIC id must be ignored");
        assert_eq!(CPU_COUNT.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn current_slot_round_trips() {
        let _guard = crate::hosted::lock();
        reset_interrupt_state_for_test();
        let cpu = this_cpu();
        assert_eq!(cpu.current_slot(), None);
        cpu.set_current_slot(Some(3));
        assert_eq!(cpu.current_slot(), Some(3));
        cpu.set_current_slot(None);
        assert_eq!(cpu.current_slot(), None);
    }
}
