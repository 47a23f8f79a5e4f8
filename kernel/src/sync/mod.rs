//! Synchronization primitives.

pub mod sleeplock;
pub mod spinlock;

pub use sleeplock::SleepLock;
pub use spinlock::{pop_interrupt_disable, push_interrupt_disable, SpinLock};
