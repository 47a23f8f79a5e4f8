//! Trap dispatch.
//!
//! The assembly entry stubs build a `TrapFrame` at the top of the kernel
//! stack and call `trap_dispatch` with a pointer to it. System calls,
//! device interrupts and faults all arrive here.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::x86::{asm, IRQ_COM1, IRQ_ERROR, IRQ_IDE, IRQ_KBD, IRQ_SPURIOUS, IRQ_TIMER, T_IRQ0, T_PGFLT, T_SYSCALL};
use crate::proc::ProcState;
use crate::sched;
use crate::sync::SpinLock;

/// Register snapshot pushed by the trap entry stubs. Layout matches the
/// push order in `arch::x86::trap_entry` exactly; the last five fields are
/// pushed by the CPU itself (esp/ss only on privilege changes).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    // pushad, lowest address first
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32, // ignored
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    // segment pushes
    pub gs: u16,
    pub padding1: u16,
    pub fs: u16,
    pub padding2: u16,
    pub es: u16,
    pub padding3: u16,
    pub ds: u16,
    pub padding4: u16,

    pub trapno: u32,

    // pushed by the CPU (or a zero placeholder from the stub)
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub padding5: u16,
    pub eflags: u32,

    // only present on ring transitions
    pub esp: u32,
    pub ss: u16,
    pub padding6: u16,
}

impl TrapFrame {
    pub const fn zero() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebp: 0,
            oesp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            gs: 0,
            padding1: 0,
            fs: 0,
            padding2: 0,
            es: 0,
            padding3: 0,
            ds: 0,
            padding4: 0,
            trapno: 0,
            err: 0,
            eip: 0,
            cs: 0,
            padding5: 0,
            eflags: 0,
            esp: 0,
            ss: 0,
            padding6: 0,
        }
    }

    /// Whether the trap arrived from user mode.
    pub fn from_user(&self) -> bool {
        self.cs & 3 != 0
    }
}

// ---------------------------------------------------------------------------
// Clock ticks
// ---------------------------------------------------------------------------

pub static TICKS_LOCK: SpinLock = SpinLock::new("time");
static TICKS: AtomicU32 = AtomicU32::new(0);

/// Ticks since boot. Snapshot without the lock; callers that need a
/// consistent wait loop take `TICKS_LOCK` themselves.
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Acquire)
}

/// The channel timers sleep on.
pub fn ticks_channel() -> usize {
    core::ptr::addr_of!(TICKS) as usize
}

/// Advance the clock by one tick and wake sleepers. Called from the timer
/// interrupt on the boot CPU.
pub fn timer_tick() {
    TICKS_LOCK.acquire();
    TICKS.fetch_add(1, Ordering::Release);
    sched::wakeup(ticks_channel());
    TICKS_LOCK.release();
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Central trap dispatcher. `tf` points into the current kernel stack.
///
/// # Safety
/// Called from the trap entry stub with a fully built frame.
#[no_mangle]
pub unsafe extern "C" fn trap_dispatch(tf: *mut TrapFrame) {
    if tf.is_null() {
        panic!("trap_dispatch: null trap frame");
    }
    let tf_ptr = tf;
    // SAFETY: the stub passes a frame on the current kernel stack.
    let tf = unsafe { &mut *tf_ptr };

    if tf.trapno == T_SYSCALL {
        let p = sched::cpu::current_proc().expect("syscall with no process");
        if p.killed.load(Ordering::Acquire) {
            crate::proc::lifecycle::exit();
        }
        // SAFETY: the running process owns its trap frame.
        unsafe { p.inner() }.trap_frame = tf_ptr;
        tf.eax = crate::syscall::dispatch(tf) as u32;
        if p.killed.load(Ordering::Acquire) {
            crate::proc::lifecycle::exit();
        }
        return;
    }

    match tf.trapno {
        n if n == T_IRQ0 + IRQ_TIMER => {
            if sched::cpu::cpu_index() == 0 {
                timer_tick();
            }
            crate::irq::lapic::eoi();
        }
        n if n == T_IRQ0 + IRQ_IDE => {
            crate::drivers::ide::interrupt();
            crate::irq::lapic::eoi();
        }
        n if n == T_IRQ0 + IRQ_KBD || n == T_IRQ0 + IRQ_COM1 => {
            // Input drivers are outside the core; drop with an EOI.
            crate::irq::lapic::eoi();
        }
        n if n == T_IRQ0 + IRQ_SPURIOUS => {
            log::warn!(
                "[TRAP] spurious interrupt on cpu {} eip {:#x}",
                sched::cpu::cpu_index(),
                tf.eip
            );
            // No EOI for spurious vectors.
        }
        n if n == T_IRQ0 + IRQ_ERROR => {
            log::error!("[TRAP] APIC error interrupt");
            crate::irq::lapic::eoi();
        }
        _ => {
            let current = sched::cpu::current_proc();
            match current {
                None => {
                    panic!(
                        "unexpected trap {} from kernel, cr2 {:#x}, frame: {:#x?}",
                        tf.trapno,
                        asm::read_cr2(),
                        tf
                    );
                }
                Some(p) if !tf.from_user() => {
                    panic!(
                        "unexpected trap {} in kernel for pid {}, cr2 {:#x}, frame: {:#x?}",
                        tf.trapno,
                        p.pid.load(Ordering::Relaxed),
                        asm::read_cr2(),
                        tf
                    );
                }
                Some(p) => {
                    if tf.trapno == T_PGFLT {
                        log::warn!(
                            "[TRAP] pid {} page fault at {:#x} eip {:#x} -- killing",
                            p.pid.load(Ordering::Relaxed),
                            asm::read_cr2(),
                            tf.eip
                        );
                    } else {
                        log::warn!(
                            "[TRAP] pid {} trap {} err {} eip {:#x} -- killing",
                            p.pid.load(Ordering::Relaxed),
                            tf.trapno,
                            tf.err,
                            tf.eip
                        );
                    }
                    p.killed.store(true, Ordering::Release);
                }
            }
        }
    }

    // A killed process leaves through exit once it is back at the user
    // boundary.
    if let Some(p) = sched::cpu::current_proc() {
        if p.killed.load(Ordering::Acquire) && tf.from_user() {
            crate::proc::lifecycle::exit();
        }

        // Preempt on timer ticks.
        if p.state() == ProcState::Running && tf.trapno == T_IRQ0 + IRQ_TIMER {
            sched::yield_cpu();
        }

        if p.killed.load(Ordering::Acquire) && tf.from_user() {
            crate::proc::lifecycle::exit();
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_layout_is_stable() {
        // The assembly stub depends on this exact size: 8 pushad words,
        // 4 segment words, trapno, err, then the CPU frame.
        assert_eq!(core::mem::size_of::<TrapFrame>(), 76);
        let tf = TrapFrame::zero();
        assert!(!tf.from_user());
        let mut tf = tf;
        tf.cs = (3 << 3) | 3;
        assert!(tf.from_user());
    }

    #[test]
    fn timer_tick_advances_and_wakes() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();
        let before = ticks();
        timer_tick();
        assert_eq!(ticks(), before + 1);
    }
}
