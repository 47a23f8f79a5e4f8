//! Spinlocks and the per-CPU interrupt-disable depth.
//!
//! Acquiring a spinlock disables interrupts on the calling CPU via
//! `push_interrupt_disable` and spins on an atomic lock word. The depth
//! counter nests: the first push saves whether interrupts were enabled, the
//! matching pop restores that state. Holding any spinlock forbids sleeping.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::arch::x86::asm;
use crate::sched::cpu;

/// No CPU holds the lock.
const NO_CPU: usize = usize::MAX;

/// Mutual-exclusion spinlock.
///
/// This is a raw lock: it guards arenas and driver state whose ownership
/// rules span context switches, which a scoped guard cannot express.
pub struct SpinLock {
    locked: AtomicU32,
    /// Debug: name for panic messages.
    name: &'static str,
    /// Debug: index of the CPU holding the lock.
    cpu: AtomicUsize,
    /// Debug: program counter of the acquirer.
    pc: AtomicUsize,
}

impl SpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicU32::new(0),
            name,
            cpu: AtomicUsize::new(NO_CPU),
            pc: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock, disabling interrupts first to avoid deadlock with
    /// an interrupt handler taking the same lock.
    pub fn acquire(&self) {
        push_interrupt_disable();
        if self.holding() {
            panic!("spinlock {}: re-acquire", self.name);
        }

        while self
            .locked
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        self.cpu.store(cpu::cpu_index(), Ordering::Relaxed);
        self.pc
            .store(asm::read_ebp() as usize, Ordering::Relaxed);
    }

    /// Release the lock and pop the interrupt-disable level.
    pub fn release(&self) {
        if !self.holding() {
            panic!("spinlock {}: release while not holding", self.name);
        }
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        self.pc.store(0, Ordering::Relaxed);
        self.locked.store(0, Ordering::Release);
        pop_interrupt_disable();
    }

    /// Whether the calling CPU holds this lock. Interrupts must be off for
    /// the answer to stay valid.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) != 0
            && self.cpu.load(Ordering::Relaxed) == cpu::cpu_index()
    }
}

/// Disable interrupts and bump this CPU's nesting depth. The first push
/// records whether interrupts were enabled so the last pop can restore
/// them.
pub fn push_interrupt_disable() {
    let were_enabled = asm::irq_enabled();
    asm::irq_disable();
    let cpu = cpu::this_cpu();
    if cpu.ncli.load(Ordering::Relaxed) == 0 {
        cpu.interrupts_enabled.store(were_enabled, Ordering::Relaxed);
    }
    cpu.ncli.fetch_add(1, Ordering::Relaxed);
}

/// Drop one interrupt-disable level; re-enable interrupts when the depth
/// reaches zero and they were enabled at the first push.
pub fn pop_interrupt_disable() {
    if asm::irq_enabled() {
        panic!("pop_interrupt_disable: interrupts enabled");
    }
    let cpu = cpu::this_cpu();
    let prev = cpu.ncli.fetch_sub(1, Ordering::Relaxed);
    if prev <= 0 {
        panic!("pop_interrupt_disable: unbalanced");
    }
    if prev == 1 && cpu.interrupts_enabled.load(Ordering::Relaxed) {
        asm::irq_enable();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trip() {
        let _guard = crate::hosted::lock();
        cpu::reset_interrupt_state_for_test();
        let lock = SpinLock::new("test");
        assert!(!lock.holding());
        lock.acquire();
        assert!(lock.holding());
        lock.release();
        assert!(!lock.holding());
    }

    #[test]
    fn interrupt_depth_nests_and_restores() {
        let _guard = crate::hosted::lock();
        cpu::reset_interrupt_state_for_test();
        asm::irq_enable();

        let a = SpinLock::new("a");
        let b = SpinLock::new("b");
        a.acquire();
        assert!(!asm::irq_enabled(), "interrupts off while holding a lock");
        b.acquire();
        b.release();
        assert!(
            !asm::irq_enabled(),
            "inner release must not re-enable interrupts"
        );
        a.release();
        assert!(
            asm::irq_enabled(),
            "outer release restores the saved interrupt state"
        );
    }

    #[test]
    fn interrupts_stay_off_if_they_started_off() {
        let _guard = crate::hosted::lock();
        cpu::reset_interrupt_state_for_test();
        asm::irq_disable();
        let lock = SpinLock::new("test");
        lock.acquire();
        lock.release();
        assert!(!asm::irq_enabled(), "pop must restore the disabled state");
        asm::irq_enable();
    }

    #[test]
    #[should_panic(expected = "re-acquire")]
    fn reacquiring_on_the_same_cpu_panics() {
        let _guard = crate::hosted::lock();
        cpu::reset_interrupt_state_for_test();
        // A panic unwinds out of this test with the lock held; build a local
        // lock so no other test can observe the poisoned state.
        let lock = SpinLock::new("test");
        lock.acquire();
        lock.acquire();
    }
}
