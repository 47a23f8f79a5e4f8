//! I/O APIC.
//!
//! Routes external interrupts to CPUs. After mapping, every redirection
//! entry is masked; drivers opt in through `enable_irq`.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::arch::x86::T_IRQ0;
use crate::mm::layout::PGSIZE;

/// Default physical address of the I/O APIC.
pub const IOAPIC_DEFAULT_PHYS: u32 = 0xFEC0_0000;

const REG_ID: u32 = 0x00;
const REG_VER: u32 = 0x01;
const REG_TABLE: u32 = 0x10;

/// Redirection entry: interrupt masked.
const INT_DISABLED: u32 = 0x0001_0000;

/// Kernel VA of the I/O APIC register window; 0 until mapped.
static IOAPIC_VA: AtomicUsize = AtomicUsize::new(0);

/// I/O APIC id reported by firmware tables; checked against the hardware.
pub static EXPECTED_ID: AtomicU32 = AtomicU32::new(0);

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod regs {
    use super::*;

    fn base() -> *mut u32 {
        let base = IOAPIC_VA.load(Ordering::Acquire);
        debug_assert!(base != 0, "IOAPIC not mapped");
        base as *mut u32
    }

    pub fn read(reg: u32) -> u32 {
        // SAFETY: the window was mapped before use; index register at +0,
        // data register at +0x10.
        unsafe {
            base().write_volatile(reg);
            base().add(4).read_volatile()
        }
    }

    pub fn write(reg: u32, data: u32) {
        // SAFETY: as read().
        unsafe {
            base().write_volatile(reg);
            base().add(4).write_volatile(data);
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod regs {
    pub fn read(_reg: u32) -> u32 {
        0
    }

    pub fn write(_reg: u32, _data: u32) {}
}

/// Map the I/O APIC and mask every redirection entry.
pub fn init(phys: u32) {
    let phys = if phys == 0 { IOAPIC_DEFAULT_PHYS } else { phys };
    match crate::mm::vm::kernel_map_mmio(phys, PGSIZE as u32) {
        Ok(va) => IOAPIC_VA.store(va, Ordering::Release),
        Err(_) => {
            log::error!("[IOAPIC] failed to map I/O APIC at {:#010x}", phys);
            return;
        }
    }

    let max_intr = (regs::read(REG_VER) >> 16) & 0xFF;
    let id = regs::read(REG_ID) >> 24;
    let expected = EXPECTED_ID.load(Ordering::Acquire);
    if id != expected {
        log::warn!(
            "[IOAPIC] expected id {} got {}; continuing anyway",
            expected,
            id
        );
    }

    // Mask everything: edge-triggered, active high, not routed anywhere.
    for i in 0..=max_intr {
        regs::write(REG_TABLE + 2 * i, INT_DISABLED | (T_IRQ0 + i));
        regs::write(REG_TABLE + 2 * i + 1, 0);
    }
}

/// Route `irq` to the CPU at index `cpu`, edge-triggered and active-high.
pub fn enable_irq(irq: u32, cpu: usize) {
    let count = crate::sched::cpu::cpu_count();
    if cpu >= count {
        panic!("ioapic enable_irq: invalid cpu {}", cpu);
    }
    let apic_id = crate::sched::cpu::cpu(cpu).apic_id.load(Ordering::Acquire);

    regs::write(REG_TABLE + 2 * irq, T_IRQ0 + irq);
    regs::write(REG_TABLE + 2 * irq + 1, apic_id << 24);
}
