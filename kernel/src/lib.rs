//! Ferrite kernel library.
//!
//! A 32-bit protected-mode x86 kernel: per-CPU scheduler over a fixed
//! process table, two-level paging with a propagated kernel range, a
//! buffer cache over AHCI DMA (PIO IDE fallback), ACPI/MP SMP discovery,
//! and a trait-based filesystem boundary.
//!
//! The crate builds for two worlds: the bare-metal target, and the host,
//! where it links `std`, uses the system allocator, and runs its unit
//! tests under the standard harness with emulated CPU/interrupt state.

#![no_std]

extern crate alloc;

#[cfg(not(target_os = "none"))]
extern crate std;

// Bare metal: the kernel heap window backs the global allocator.
#[cfg(all(target_arch = "x86", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host: the system allocator, so tests can allocate normally.
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod proc;
pub mod sched;
pub mod smp;
pub mod sync;
pub mod syscall;
pub mod trap;

#[cfg(not(target_os = "none"))]
pub mod hosted;

// Re-exports for the boot binary and tests.
pub use error::{KernelError, KernelResult};

/// Fatal error handler: report the failure and halt this CPU with
/// interrupts disabled.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::x86::asm::irq_disable();
    println!("kernel panic: {}", info);
    loop {
        arch::x86::asm::halt();
    }
}
