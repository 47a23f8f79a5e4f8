//! Hosted test support.
//!
//! The kernel's global state (frame pool, master page directory, process
//! table) is process-wide, while the standard test harness runs tests on
//! multiple threads. Tests that touch that state serialize through `lock`,
//! and `bootstrap` performs the one-time bring-up of the simulated machine:
//! memory limits, frame pool, and the master kernel page directory.

use std::sync::{Mutex, MutexGuard, Once};

use crate::arch::x86::boot::MemoryRange;
use crate::mm::{frame, layout, vm};

static GLOBAL: Mutex<()> = Mutex::new(());
static INIT: Once = Once::new();

/// Serialize access to global kernel state.
pub fn lock() -> MutexGuard<'static, ()> {
    GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bring up the hosted kernel once and return the global-state guard.
pub fn bootstrap() -> MutexGuard<'static, ()> {
    let guard = lock();
    INIT.call_once(|| {
        crate::logger::init();

        let ram = layout::HOSTED_RAM_BYTES as u64;
        frame::apply_memory_limits(
            frame::MemoryLimits {
                total_bytes: ram,
                usable_bytes: ram,
            },
            frame::PhysTopSource::MemoryMap,
        );
        frame::build_usable_ranges(
            [MemoryRange {
                addr: 0,
                len: ram,
                available: true,
            }],
            layout::phys_ram_end(),
        );
        frame::release_usable_ranges();
        frame::enable_locking();

        vm::init();
    });
    guard
}
