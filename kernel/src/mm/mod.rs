//! Memory management.
//!
//! `layout` fixes the address-space contract, `frame` owns physical frames,
//! `page_table` manipulates page directories, `vm` implements the kernel
//! virtual-memory manager on top, and `heap` wires the kernel heap window
//! into the global allocator.

pub mod frame;
pub mod heap;
pub mod layout;
pub mod page_table;
pub mod vm;

pub use frame::{alloc_page, free_page, free_page_count};
pub use layout::PhysAddr;
pub use page_table::{PageDirectory, PteFlags};
