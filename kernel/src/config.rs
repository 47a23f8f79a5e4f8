//! Kernel-wide tunables.
//!
//! Fixed table sizes and limits. These are compile-time constants; changing
//! them changes the static footprint of the kernel image.

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files in the whole system.
pub const NFILE: usize = 100;

/// In-memory inode cache entries.
pub const NINODE: usize = 50;

/// Device-table entries (major numbers).
pub const NDEV: usize = 10;

/// Buffer-cache entries.
pub const NBUF: usize = 30;

/// Filesystem block size in bytes.
pub const BSIZE: usize = 1024;

/// Disk sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sectors per filesystem block.
pub const SECTORS_PER_BLOCK: usize = BSIZE / SECTOR_SIZE;

/// Size of a per-process kernel stack.
pub const KSTACK_SIZE: usize = 4096;

/// Maximum path length, including the terminating NUL.
pub const MAX_PATH: usize = 128;

/// Maximum exec arguments.
pub const MAX_ARG: usize = 32;

/// Process name length.
pub const PROC_NAME_LEN: usize = 16;

/// Device number of the root filesystem.
pub const ROOT_DEV: u32 = 1;

/// Major number of the console device.
pub const CONSOLE_MAJOR: u16 = 1;

/// Major number of the framebuffer device.
pub const FRAMEBUFFER_MAJOR: u16 = 2;
