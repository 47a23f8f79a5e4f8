//! Architecture support.
//!
//! The kernel targets 32-bit protected-mode x86. Everything that touches
//! privileged instructions lives under `x86`; the rest of the kernel calls
//! through the safe wrappers exported there.

pub mod x86;
