//! Open files.
//!
//! A global table of `NFILE` slots, each a ref-counted descriptor over a
//! pipe end or an inode with an offset. Process file-descriptor tables hold
//! `FileHandle`s into this arena.

use alloc::sync::Arc;

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::config::NFILE;
use crate::error::{KernelError, KernelResult};
use crate::fs::inode::{self, InodeHandle};
use crate::fs::pipe::{Pipe, PipeEnd};
use crate::fs::Stat;
use crate::sync::SpinLock;

/// What a file descriptor refers to.
#[derive(Clone)]
pub enum FileKind {
    None,
    Pipe(Arc<Pipe>, PipeEnd),
    Inode(InodeHandle),
}

/// Mutable body of an open file.
pub struct FileBody {
    pub kind: FileKind,
    pub readable: bool,
    pub writable: bool,
    pub off: u32,
}

struct FileSlot {
    refs: AtomicU32,
    body: Mutex<FileBody>,
}

impl FileSlot {
    const fn new() -> Self {
        Self {
            refs: AtomicU32::new(0),
            body: Mutex::new(FileBody {
                kind: FileKind::None,
                readable: false,
                writable: false,
                off: 0,
            }),
        }
    }
}

/// Index into the global file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(usize);

struct FileTable {
    lock: SpinLock,
    files: [FileSlot; NFILE],
}

static FTABLE: FileTable = FileTable {
    lock: SpinLock::new("ftable"),
    files: [const { FileSlot::new() }; NFILE],
};

/// Allocate a file slot.
pub fn alloc(kind: FileKind, readable: bool, writable: bool) -> KernelResult<FileHandle> {
    FTABLE.lock.acquire();
    for (i, slot) in FTABLE.files.iter().enumerate() {
        if slot.refs.load(Ordering::Relaxed) == 0 {
            slot.refs.store(1, Ordering::Relaxed);
            FTABLE.lock.release();
            *slot.body.lock() = FileBody {
                kind,
                readable,
                writable,
                off: 0,
            };
            return Ok(FileHandle(i));
        }
    }
    FTABLE.lock.release();
    Err(KernelError::ResourceExhausted { resource: "file table" })
}

/// Take another reference to an open file.
pub fn dup(h: FileHandle) -> FileHandle {
    FTABLE.lock.acquire();
    let refs = FTABLE.files[h.0].refs.fetch_add(1, Ordering::Relaxed);
    FTABLE.lock.release();
    if refs == 0 {
        panic!("file dup: closed file");
    }
    h
}

/// Drop a reference; the last close releases the pipe end or inode.
pub fn close(h: FileHandle) {
    FTABLE.lock.acquire();
    let slot = &FTABLE.files[h.0];
    let refs = slot.refs.load(Ordering::Relaxed);
    if refs == 0 {
        panic!("file close: closed file");
    }
    if refs > 1 {
        slot.refs.store(refs - 1, Ordering::Relaxed);
        FTABLE.lock.release();
        return;
    }
    // Last reference: take the body out, then release the table lock
    // before any operation that can sleep.
    let kind = {
        let mut body = slot.body.lock();
        let kind = core::mem::replace(&mut body.kind, FileKind::None);
        body.readable = false;
        body.writable = false;
        body.off = 0;
        kind
    };
    slot.refs.store(0, Ordering::Relaxed);
    FTABLE.lock.release();

    match kind {
        FileKind::None => {}
        FileKind::Pipe(pipe, end) => pipe.close(end),
        FileKind::Inode(ih) => inode::iput(ih),
    }
}

/// Run `f` with the file body locked.
pub fn with_body<R>(h: FileHandle, f: impl FnOnce(&mut FileBody) -> R) -> R {
    let mut body = FTABLE.files[h.0].body.lock();
    f(&mut body)
}

/// File metadata; inode-backed files only.
pub fn stat(h: FileHandle) -> KernelResult<Stat> {
    let ih = match &FTABLE.files[h.0].body.lock().kind {
        FileKind::Inode(ih) => *ih,
        _ => return Err(KernelError::BadFileDescriptor),
    };
    let ip = inode::inode(ih);
    ip.ilock()?;
    let st = ip.stati();
    ip.iunlock();
    Ok(st)
}

/// Read from an open file into `dst`.
pub fn read(h: FileHandle, dst: &mut [u8]) -> KernelResult<usize> {
    let (kind, readable, off) = {
        let body = FTABLE.files[h.0].body.lock();
        (body.kind.clone(), body.readable, body.off)
    };
    if !readable {
        return Err(KernelError::BadFileDescriptor);
    }

    match kind {
        FileKind::None => Err(KernelError::BadFileDescriptor),
        FileKind::Pipe(pipe, _) => pipe.read(dst),
        FileKind::Inode(ih) => {
            let ip = inode::inode(ih);
            ip.ilock()?;
            let result = ip.readi(dst, off);
            if let Ok(n) = result {
                FTABLE.files[h.0].body.lock().off = off + n as u32;
            }
            ip.iunlock();
            result
        }
    }
}

/// Write `src` to an open file.
pub fn write(h: FileHandle, src: &[u8]) -> KernelResult<usize> {
    let (kind, writable, off) = {
        let body = FTABLE.files[h.0].body.lock();
        (body.kind.clone(), body.writable, body.off)
    };
    if !writable {
        return Err(KernelError::BadFileDescriptor);
    }

    match kind {
        FileKind::None => Err(KernelError::BadFileDescriptor),
        FileKind::Pipe(pipe, _) => pipe.write(src),
        FileKind::Inode(ih) => {
            let ip = inode::inode(ih);
            ip.ilock()?;
            let result = ip.writei(src, off);
            if let Ok(n) = result {
                FTABLE.files[h.0].body.lock().off = off + n as u32;
            }
            ip.iunlock();
            result
        }
    }
}

/// lseek whence values.
pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

/// Reposition the file offset; inode-backed files only.
pub fn lseek(h: FileHandle, offset: i32, whence: u32) -> KernelResult<u32> {
    let ih = match &FTABLE.files[h.0].body.lock().kind {
        FileKind::Inode(ih) => *ih,
        _ => return Err(KernelError::BadFileDescriptor),
    };
    let size = {
        let ip = inode::inode(ih);
        ip.ilock()?;
        let size = ip.meta().size;
        ip.iunlock();
        size
    };

    let mut body = FTABLE.files[h.0].body.lock();
    let base = match whence {
        SEEK_SET => 0i64,
        SEEK_CUR => body.off as i64,
        SEEK_END => size as i64,
        _ => return Err(KernelError::InvalidArgument { name: "whence" }),
    };
    let target = base + offset as i64;
    if target < 0 || target > u32::MAX as i64 {
        return Err(KernelError::InvalidArgument { name: "offset" });
    }
    body.off = target as u32;
    Ok(body.off)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn alloc_dup_close_reference_counting() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();

        let h = alloc(FileKind::None, true, false).expect("file slot");
        assert_eq!(FTABLE.files[h.0].refs.load(Ordering::Relaxed), 1);
        let h2 = dup(h);
        assert_eq!(h, h2);
        assert_eq!(FTABLE.files[h.0].refs.load(Ordering::Relaxed), 2);
        close(h);
        assert_eq!(FTABLE.files[h.0].refs.load(Ordering::Relaxed), 1);
        close(h2);
        assert_eq!(FTABLE.files[h.0].refs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn read_requires_the_readable_flag() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();

        let h = alloc(FileKind::None, false, true).expect("file slot");
        let mut buf = [0u8; 4];
        assert!(matches!(
            read(h, &mut buf),
            Err(KernelError::BadFileDescriptor)
        ));
        close(h);
    }
}
