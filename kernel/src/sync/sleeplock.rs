//! Sleepable locks.
//!
//! Long-term locks for objects held across disk I/O. An inner spinlock
//! guards the flag; a contended acquire sleeps on the lock's address
//! instead of spinning, so the CPU goes back to the scheduler.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use super::spinlock::SpinLock;
use crate::sched;

pub struct SleepLock {
    locked: AtomicBool,
    lk: SpinLock,
    name: &'static str,
    /// PID of the holder, for debugging.
    pid: AtomicI32,
}

impl SleepLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            lk: SpinLock::new("sleep lock"),
            name,
            pid: AtomicI32::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire, sleeping while another process holds the lock.
    pub fn acquire(&self) {
        self.lk.acquire();
        while self.locked.load(Ordering::Relaxed) {
            sched::sleep(self as *const _ as usize, &self.lk);
        }
        self.locked.store(true, Ordering::Relaxed);
        self.pid.store(current_pid(), Ordering::Relaxed);
        self.lk.release();
    }

    /// Release and wake any sleepers.
    pub fn release(&self) {
        self.lk.acquire();
        self.locked.store(false, Ordering::Relaxed);
        self.pid.store(0, Ordering::Relaxed);
        sched::wakeup(self as *const _ as usize);
        self.lk.release();
    }

    /// Whether the calling process holds this lock.
    pub fn holding(&self) -> bool {
        self.lk.acquire();
        let held =
            self.locked.load(Ordering::Relaxed) && self.pid.load(Ordering::Relaxed) == current_pid();
        self.lk.release();
        held
    }
}

fn current_pid() -> i32 {
    sched::cpu::current_proc().map_or(0, |p| p.pid.load(Ordering::Relaxed))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn uncontended_acquire_and_release() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();
        let lock = SleepLock::new("test");
        assert!(!lock.holding());
        lock.acquire();
        assert!(lock.holding());
        lock.release();
        assert!(!lock.holding());
    }
}
