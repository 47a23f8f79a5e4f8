//! In-memory inodes.
//!
//! Reference-counted, `(dev, inum)`-keyed records in a fixed cache. Each
//! carries the operations table of the filesystem that owns it; the table
//! is a trait object, so the concrete filesystem stays out of the core.
//! Contents are protected by a per-inode sleeplock; the cache itself by one
//! spinlock.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::config::{NDEV, NINODE};
use crate::error::{KernelError, KernelResult};
use crate::fs::Stat;
use crate::sync::{SleepLock, SpinLock};

/// Inode types, as stored in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeType {
    Free = 0,
    Dir = 1,
    File = 2,
    Dev = 3,
}

/// Filesystem operations table. One implementation per mounted filesystem;
/// device I/O is routed separately through `devsw`.
pub trait InodeOps: Sync {
    /// One-time initialization that may sleep; runs in process context on
    /// first use.
    fn iinit(&self, _dev: u32) {}

    /// Inode number of the filesystem root.
    fn root_inum(&self) -> u32;

    /// Fill `ip`'s metadata from the backing store. Called with the inode
    /// sleeplock held when the cached copy is not yet valid.
    fn iload(&self, ip: &Inode) -> KernelResult<()>;

    /// Write `ip`'s metadata back to the backing store.
    fn iupdate(&self, ip: &Inode) -> KernelResult<()>;

    /// Release the data of an unlinked inode. Called when the last
    /// reference drops with `nlink == 0`.
    fn itrunc(&self, ip: &Inode) -> KernelResult<()>;

    /// Read at `off` into `dst`; returns bytes read (short at EOF).
    fn readi(&self, ip: &Inode, dst: &mut [u8], off: u32) -> KernelResult<usize>;

    /// Write at `off` from `src`; returns bytes written.
    fn writei(&self, ip: &Inode, src: &[u8], off: u32) -> KernelResult<usize>;

    /// Look `name` up in directory `dir`.
    fn dirlookup(&self, dir: &Inode, name: &str) -> Option<u32>;

    /// Add a `name -> inum` entry to directory `dir`.
    fn dirlink(&self, dir: &Inode, name: &str, inum: u32) -> KernelResult<()>;

    /// Remove the entry `name` from directory `dir`.
    fn dirunlink(&self, dir: &Inode, name: &str) -> KernelResult<()>;

    /// Whether a directory holds nothing beyond "." and "..".
    fn dir_is_empty(&self, dir: &Inode) -> bool;

    /// Allocate a fresh inode of `typ` on `dev`, returning its number. The
    /// new inode has no directory entries; for directories, the caller
    /// links "." and ".." through `dirlink`.
    fn ialloc(&self, dev: u32, typ: InodeType) -> KernelResult<u32>;
}

/// Metadata mirrored from the backing store while the inode is valid.
#[derive(Debug, Clone, Copy)]
pub struct InodeMeta {
    pub valid: bool,
    pub typ: InodeType,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
}

impl InodeMeta {
    const fn empty() -> Self {
        Self {
            valid: false,
            typ: InodeType::Free,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
        }
    }
}

/// One in-memory inode.
pub struct Inode {
    dev: AtomicU32,
    inum: AtomicU32,
    refs: AtomicU32,
    /// Serializes content access; holders may sleep.
    pub lock: SleepLock,
    meta: Mutex<InodeMeta>,
}

impl Inode {
    const fn new() -> Self {
        Self {
            dev: AtomicU32::new(0),
            inum: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            lock: SleepLock::new("inode"),
            meta: Mutex::new(InodeMeta::empty()),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev.load(Ordering::Acquire)
    }

    pub fn inum(&self) -> u32 {
        self.inum.load(Ordering::Acquire)
    }

    pub fn meta(&self) -> spin::MutexGuard<'_, InodeMeta> {
        self.meta.lock()
    }

    /// Lock the inode and make its metadata valid.
    pub fn ilock(&self) -> KernelResult<()> {
        if self.refs.load(Ordering::Acquire) == 0 {
            panic!("ilock: no references");
        }
        self.lock.acquire();
        if !self.meta.lock().valid {
            let ops = filesystem();
            if let Err(e) = ops.iload(self) {
                self.lock.release();
                return Err(e);
            }
            let mut meta = self.meta.lock();
            meta.valid = true;
            if meta.typ == InodeType::Free {
                drop(meta);
                self.lock.release();
                panic!("ilock: no type");
            }
        }
        Ok(())
    }

    pub fn iunlock(&self) {
        if !self.lock.holding() {
            panic!("iunlock: not holding");
        }
        self.lock.release();
    }

    /// Read from the inode with the sleeplock held. Device inodes route to
    /// the registered device operations.
    pub fn readi(&self, dst: &mut [u8], off: u32) -> KernelResult<usize> {
        let (typ, major) = {
            let meta = self.meta.lock();
            (meta.typ, meta.major)
        };
        if typ == InodeType::Dev {
            return super::devsw::read(major, dst);
        }
        filesystem().readi(self, dst, off)
    }

    /// Write to the inode with the sleeplock held.
    pub fn writei(&self, src: &[u8], off: u32) -> KernelResult<usize> {
        let (typ, major) = {
            let meta = self.meta.lock();
            (meta.typ, meta.major)
        };
        if typ == InodeType::Dev {
            return super::devsw::write(major, src);
        }
        filesystem().writei(self, src, off)
    }

    /// Copy metadata into a `Stat`.
    pub fn stati(&self) -> Stat {
        let meta = self.meta.lock();
        Stat {
            dev: self.dev(),
            inum: self.inum(),
            typ: meta.typ as u16,
            nlink: meta.nlink,
            size: meta.size,
        }
    }

    /// Persist metadata through the filesystem.
    pub fn iupdate(&self) -> KernelResult<()> {
        filesystem().iupdate(self)
    }
}

/// Cache slot index; the currency other subsystems hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeHandle(usize);

struct InodeCache {
    lock: SpinLock,
    inodes: [Inode; NINODE],
}

static ICACHE: InodeCache = InodeCache {
    lock: SpinLock::new("icache"),
    inodes: [const { Inode::new() }; NINODE],
};

/// The registered filesystem operations.
static FS_OPS: spin::Once<&'static dyn InodeOps> = spin::Once::new();

/// Register the filesystem that owns the root device. One registration per
/// boot.
pub fn register_filesystem(ops: &'static dyn InodeOps) {
    FS_OPS.call_once(|| ops);
}

/// The registered filesystem, panicking when none is mounted yet.
pub fn filesystem() -> &'static dyn InodeOps {
    *FS_OPS.get().expect("no filesystem registered")
}

pub fn is_filesystem_registered() -> bool {
    FS_OPS.get().is_some()
}

/// The inode record behind a handle.
pub fn inode(h: InodeHandle) -> &'static Inode {
    &ICACHE.inodes[h.0]
}

/// Find or create a cache entry for `(dev, inum)` and take a reference.
/// The returned inode is not locked and its metadata may be stale.
pub fn iget(dev: u32, inum: u32) -> KernelResult<InodeHandle> {
    ICACHE.lock.acquire();

    let mut empty = None;
    for (i, ip) in ICACHE.inodes.iter().enumerate() {
        let refs = ip.refs.load(Ordering::Relaxed);
        if refs > 0 && ip.dev() == dev && ip.inum() == inum {
            ip.refs.fetch_add(1, Ordering::Relaxed);
            ICACHE.lock.release();
            return Ok(InodeHandle(i));
        }
        if empty.is_none() && refs == 0 {
            empty = Some(i);
        }
    }

    let i = match empty {
        Some(i) => i,
        None => {
            ICACHE.lock.release();
            return Err(KernelError::ResourceExhausted { resource: "inode cache" });
        }
    };

    let ip = &ICACHE.inodes[i];
    ip.dev.store(dev, Ordering::Relaxed);
    ip.inum.store(inum, Ordering::Relaxed);
    ip.refs.store(1, Ordering::Relaxed);
    *ip.meta.lock() = InodeMeta::empty();
    ICACHE.lock.release();
    Ok(InodeHandle(i))
}

/// Take an additional reference.
pub fn idup(h: InodeHandle) -> InodeHandle {
    ICACHE.lock.acquire();
    ICACHE.inodes[h.0].refs.fetch_add(1, Ordering::Relaxed);
    ICACHE.lock.release();
    h
}

/// Drop a reference. The last reference to an unlinked inode releases its
/// data through the filesystem.
pub fn iput(h: InodeHandle) {
    let ip = &ICACHE.inodes[h.0];

    ICACHE.lock.acquire();
    let last = ip.refs.load(Ordering::Relaxed) == 1;
    let truncate = last && {
        let meta = ip.meta.lock();
        meta.valid && meta.nlink == 0
    };
    ICACHE.lock.release();

    if truncate {
        let ops = filesystem();
        ip.lock.acquire();
        ops.itrunc(ip).ok();
        {
            let mut meta = ip.meta.lock();
            meta.typ = InodeType::Free;
        }
        ops.iupdate(ip).ok();
        {
            let mut meta = ip.meta.lock();
            meta.valid = false;
        }
        ip.lock.release();
    }

    ICACHE.lock.acquire();
    ip.refs.fetch_sub(1, Ordering::Relaxed);
    ICACHE.lock.release();
}

/// Unlock then drop a reference; the common tail of path operations.
pub fn iunlockput(h: InodeHandle) {
    inode(h).iunlock();
    iput(h);
}

/// Device-operation majors are bounded by the device table size.
pub fn valid_major(major: u16) -> bool {
    (major as usize) < NDEV
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn iget_returns_the_same_slot_for_the_same_key() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();

        let a = iget(7, 42).expect("first iget");
        let b = iget(7, 42).expect("second iget");
        assert_eq!(a, b, "same (dev, inum) must share the cache slot");
        assert_eq!(inode(a).refs.load(Ordering::Relaxed), 2);

        let c = iget(7, 43).expect("different inum");
        assert_ne!(a, c);

        iput(a);
        iput(b);
        iput(c);
        assert_eq!(inode(a).refs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn idup_increments_the_reference_count() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();

        let h = iget(9, 5).expect("iget");
        let h2 = idup(h);
        assert_eq!(h, h2);
        assert_eq!(inode(h).refs.load(Ordering::Relaxed), 2);
        iput(h);
        iput(h2);
    }
}
