//! Trap entry glue.
//!
//! 256 vector stubs push the trap number (and a zero error code where the
//! CPU does not supply one), then funnel into a common entry that builds the
//! trap frame on the kernel stack and calls the Rust dispatcher. The layout
//! built here must match `trap::TrapFrame` field for field.

use core::arch::global_asm;

// Vectors with a CPU-pushed error code: 8, 10-14, 17.
global_asm!(
    r#"
    .section .text

    .macro TRAP_VECTOR num
    vector\num:
        .if (\num == 8) || (\num >= 10 && \num <= 14) || (\num == 17)
        .else
        push 0
        .endif
        push \num
        jmp alltraps
    .endm

    .macro VECTOR_PTR num
        .long vector\num
    .endm

    .altmacro
    .set i, 0
    .rept 256
        TRAP_VECTOR %i
        .set i, i + 1
    .endr

    # Table of vector entry points, consumed by idt_init.
    .data
    .globl trap_vectors
    trap_vectors:
    .set i, 0
    .rept 256
        VECTOR_PTR %i
        .set i, i + 1
    .endr
    "#
);

global_asm!(
    r#"
    .section .text
    .globl alltraps
    alltraps:
        # Build the trap frame.
        push ds
        push es
        push fs
        push gs
        pushad

        # Enter kernel data segments.
        mov ax, (2 << 3)        # SEG_KDATA selector
        mov ds, ax
        mov es, ax

        push esp                # TrapFrame argument
        call trap_dispatch
        add esp, 4

    .globl trapret
    trapret:
        popad
        pop gs
        pop fs
        pop es
        pop ds
        add esp, 8              # trapno and errcode
        iretd
    "#
);

extern "C" {
    /// The 256 vector entry points, for IDT construction.
    pub static trap_vectors: [u32; 256];

    /// Return path that restores a trap frame and resumes the interrupted
    /// context. New processes point their first kernel stack frame here.
    pub fn trapret();
}

/// Gate descriptor in the hardware IDT layout.
#[derive(Clone, Copy)]
#[repr(C)]
struct GateDesc {
    off_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    off_high: u16,
}

impl GateDesc {
    const fn missing() -> Self {
        Self {
            off_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            off_high: 0,
        }
    }

    fn interrupt(handler: u32, dpl: u8) -> Self {
        Self {
            off_low: (handler & 0xFFFF) as u16,
            selector: (super::gdt::SEG_KCODE as u16) << 3,
            zero: 0,
            type_attr: 0x8E | (dpl << 5), // present, 32-bit interrupt gate
            off_high: (handler >> 16) as u16,
        }
    }

    fn trap(handler: u32, dpl: u8) -> Self {
        Self {
            off_low: (handler & 0xFFFF) as u16,
            selector: (super::gdt::SEG_KCODE as u16) << 3,
            zero: 0,
            type_attr: 0x8F | (dpl << 5), // present, 32-bit trap gate
            off_high: (handler >> 16) as u16,
        }
    }
}

static mut IDT: [GateDesc; 256] = [GateDesc::missing(); 256];

/// Build the IDT from the vector table. Called once on the boot CPU; the
/// per-CPU `idt_load` installs it everywhere.
pub fn idt_init() {
    // SAFETY: runs single-threaded during boot, before other CPUs start;
    // access goes through raw pointers, never references to the static.
    unsafe {
        let idt = core::ptr::addr_of_mut!(IDT);
        for i in 0..256 {
            (*idt)[i] = GateDesc::interrupt(trap_vectors[i], 0);
        }
        // System calls arrive from ring 3 and keep interrupts enabled.
        (*idt)[super::T_SYSCALL as usize] =
            GateDesc::trap(trap_vectors[super::T_SYSCALL as usize], 3);
    }
}

/// Load the IDT on the calling CPU.
pub fn idt_load() {
    #[repr(C, packed)]
    struct Descriptor {
        limit: u16,
        base: u32,
    }
    // SAFETY: IDT is fully initialized by idt_init before any CPU loads it
    // and is never written afterwards.
    unsafe {
        let desc = Descriptor {
            limit: (core::mem::size_of::<[GateDesc; 256]>() - 1) as u16,
            base: core::ptr::addr_of!(IDT) as u32,
        };
        core::arch::asm!("lidt [{}]", in(reg) &desc as *const Descriptor, options(nostack));
    }
}
