//! Processes.
//!
//! Process records live in a fixed arena (`table::PTABLE`) guarded by one
//! spinlock; subsystems refer to processes by slot index, never by pointer.
//! The hot state-machine fields are atomics so diagnostic paths can read
//! them without the lock; everything else sits behind `inner()`, which is
//! only valid to touch while holding the table lock or from the process
//! itself.

pub mod exec;
pub mod lifecycle;
pub mod table;
pub mod vma;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use crate::config::{MAX_PATH, NOFILE, PROC_NAME_LEN};
use crate::fs::file::FileHandle;
use crate::fs::inode::InodeHandle;
use crate::mm::PageDirectory;
use crate::sched::context::Context;
use crate::trap::TrapFrame;
use vma::VmaList;

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcState {
    Unused = 0,
    Embryo = 1,
    Sleeping = 2,
    Runnable = 3,
    Running = 4,
    Zombie = 5,
}

impl ProcState {
    pub fn name(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep",
            ProcState::Runnable => "runnable",
            ProcState::Running => "running",
            ProcState::Zombie => "zombie",
        }
    }
}

/// State owned by the process (or by whoever holds the table lock during
/// setup and teardown).
pub struct ProcInner {
    /// User address space; `None` until the slot is fully set up.
    pub pagedir: Option<PageDirectory>,
    /// Bottom of the kernel stack (kernel VA); 0 when absent.
    pub kstack: usize,
    /// Program break: size of the user address space in bytes.
    pub brk: u32,
    /// Trap frame at the top of the kernel stack.
    pub trap_frame: *mut TrapFrame,
    /// Saved kernel context for switch_context.
    pub context: *mut Context,
    /// Process name, NUL-padded.
    pub name: [u8; PROC_NAME_LEN],
    /// Current working directory.
    pub cwd: Option<InodeHandle>,
    /// Current working directory as a path string, NUL-padded.
    pub cwd_path: [u8; MAX_PATH],
    /// Open files.
    pub ofile: [Option<FileHandle>; NOFILE],
    /// User memory areas (heap and device mappings).
    pub vmas: VmaList,
}

impl ProcInner {
    pub const fn new() -> Self {
        Self {
            pagedir: None,
            kstack: 0,
            brk: 0,
            trap_frame: core::ptr::null_mut(),
            context: core::ptr::null_mut(),
            name: [0; PROC_NAME_LEN],
            cwd: None,
            cwd_path: [0; MAX_PATH],
            ofile: [None; NOFILE],
            vmas: VmaList::new(),
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; PROC_NAME_LEN];
        let n = name.len().min(PROC_NAME_LEN - 1);
        self.name[..n].copy_from_slice(&name.as_bytes()[..n]);
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    pub fn set_cwd_path(&mut self, path: &str) {
        self.cwd_path = [0; MAX_PATH];
        let n = path.len().min(MAX_PATH - 1);
        self.cwd_path[..n].copy_from_slice(&path.as_bytes()[..n]);
    }

    pub fn cwd_path_str(&self) -> &str {
        let len = self.cwd_path.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.cwd_path[..len]).unwrap_or("/")
    }
}

/// One process slot.
pub struct Proc {
    state: AtomicU8,
    pub pid: AtomicI32,
    /// Parent slot index + 1; 0 means no parent (init, or unused slot).
    parent: AtomicUsize,
    pub killed: AtomicBool,
    /// Sleep channel; 0 when not sleeping on anything.
    chan: AtomicUsize,
    inner: UnsafeCell<ProcInner>,
}

// SAFETY: the atomic fields are safe to share; `inner` is guarded by the
// process-table lock (or exclusive ownership by the running process).
unsafe impl Sync for Proc {}

impl Proc {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(ProcState::Unused as u8),
            pid: AtomicI32::new(0),
            parent: AtomicUsize::new(0),
            killed: AtomicBool::new(false),
            chan: AtomicUsize::new(0),
            inner: UnsafeCell::new(ProcInner::new()),
        }
    }

    pub fn state(&self) -> ProcState {
        match self.state.load(Ordering::Acquire) {
            1 => ProcState::Embryo,
            2 => ProcState::Sleeping,
            3 => ProcState::Runnable,
            4 => ProcState::Running,
            5 => ProcState::Zombie,
            _ => ProcState::Unused,
        }
    }

    /// Set the state. Transitions are ordered by the process-table lock.
    pub fn set_state(&self, state: ProcState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn parent_slot(&self) -> Option<usize> {
        match self.parent.load(Ordering::Acquire) {
            0 => None,
            n => Some(n - 1),
        }
    }

    pub fn set_parent_slot(&self, slot: Option<usize>) {
        self.parent
            .store(slot.map_or(0, |s| s + 1), Ordering::Release);
    }

    pub fn channel(&self) -> usize {
        self.chan.load(Ordering::Acquire)
    }

    pub fn set_channel(&self, chan: usize) {
        self.chan.store(chan, Ordering::Release);
    }

    /// The mutable process body.
    ///
    /// # Safety
    /// The caller must hold the process-table lock, or be the process
    /// itself running on its own CPU.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn inner(&self) -> &mut ProcInner {
        // SAFETY: per the function contract.
        unsafe { &mut *self.inner.get() }
    }
}

impl Default for Proc {
    fn default() -> Self {
        Self::new()
    }
}
