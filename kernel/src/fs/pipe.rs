//! Pipes.
//!
//! A bounded byte ring with blocking read/write built on sleep/wakeup. The
//! read and write cursors only ever grow; their difference is the fill
//! level. Each side's open flag drops when its last file reference closes.

use alloc::sync::Arc;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::fs::file::{self, FileHandle, FileKind};
use crate::sched;
use crate::sync::SpinLock;

pub const PIPE_SIZE: usize = 512;

/// Which end of the pipe a file descriptor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

pub struct Pipe {
    lock: SpinLock,
    data: UnsafeCell<[u8; PIPE_SIZE]>,
    /// Bytes read so far.
    nread: AtomicU32,
    /// Bytes written so far.
    nwrite: AtomicU32,
    readopen: AtomicBool,
    writeopen: AtomicBool,
}

// SAFETY: `data` is only accessed while `lock` is held.
unsafe impl Send for Pipe {}
unsafe impl Sync for Pipe {}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: SpinLock::new("pipe"),
            data: UnsafeCell::new([0; PIPE_SIZE]),
            nread: AtomicU32::new(0),
            nwrite: AtomicU32::new(0),
            readopen: AtomicBool::new(true),
            writeopen: AtomicBool::new(true),
        })
    }

    fn read_channel(&self) -> usize {
        core::ptr::addr_of!(self.nread) as usize
    }

    fn write_channel(&self) -> usize {
        core::ptr::addr_of!(self.nwrite) as usize
    }

    /// Write all of `src`, sleeping while the ring is full. Fails with
    /// `BrokenPipe` once the read side is gone.
    pub fn write(&self, src: &[u8]) -> KernelResult<usize> {
        self.lock.acquire();
        for &byte in src.iter() {
            loop {
                if !self.readopen.load(Ordering::Acquire) || current_killed() {
                    self.lock.release();
                    return Err(KernelError::BrokenPipe);
                }
                let nread = self.nread.load(Ordering::Relaxed);
                let nwrite = self.nwrite.load(Ordering::Relaxed);
                if nwrite != nread.wrapping_add(PIPE_SIZE as u32) {
                    break;
                }
                // Ring full: let readers drain, then wait.
                sched::wakeup(self.read_channel());
                sched::sleep(self.write_channel(), &self.lock);
            }
            let nwrite = self.nwrite.load(Ordering::Relaxed);
            // SAFETY: the pipe lock is held.
            unsafe {
                (*self.data.get())[nwrite as usize % PIPE_SIZE] = byte;
            }
            self.nwrite.store(nwrite.wrapping_add(1), Ordering::Relaxed);
        }
        sched::wakeup(self.read_channel());
        self.lock.release();
        Ok(src.len())
    }

    /// Read up to `dst.len()` bytes, sleeping while the ring is empty and
    /// the write side remains open. Returns 0 at end of stream.
    pub fn read(&self, dst: &mut [u8]) -> KernelResult<usize> {
        self.lock.acquire();
        while self.nread.load(Ordering::Relaxed) == self.nwrite.load(Ordering::Relaxed)
            && self.writeopen.load(Ordering::Acquire)
        {
            if current_killed() {
                self.lock.release();
                return Err(KernelError::Interrupted);
            }
            sched::sleep(self.read_channel(), &self.lock);
        }

        let mut copied = 0;
        while copied < dst.len() {
            let nread = self.nread.load(Ordering::Relaxed);
            if nread == self.nwrite.load(Ordering::Relaxed) {
                break;
            }
            // SAFETY: the pipe lock is held.
            dst[copied] = unsafe { (*self.data.get())[nread as usize % PIPE_SIZE] };
            self.nread.store(nread.wrapping_add(1), Ordering::Relaxed);
            copied += 1;
        }
        sched::wakeup(self.write_channel());
        self.lock.release();
        Ok(copied)
    }

    /// Drop one side. Wakes the other side so it can observe the closure.
    pub fn close(&self, end: PipeEnd) {
        self.lock.acquire();
        match end {
            PipeEnd::Read => {
                self.readopen.store(false, Ordering::Release);
                sched::wakeup(self.write_channel());
            }
            PipeEnd::Write => {
                self.writeopen.store(false, Ordering::Release);
                sched::wakeup(self.read_channel());
            }
        }
        self.lock.release();
    }
}

fn current_killed() -> bool {
    sched::cpu::current_proc().is_some_and(|p| p.killed.load(Ordering::Acquire))
}

/// Create a pipe and the two files wrapping its ends.
pub fn alloc() -> KernelResult<(FileHandle, FileHandle)> {
    let pipe = Pipe::new();
    let read_end = file::alloc(FileKind::Pipe(pipe.clone(), PipeEnd::Read), true, false)?;
    let write_end = match file::alloc(FileKind::Pipe(pipe, PipeEnd::Write), false, true) {
        Ok(h) => h,
        Err(e) => {
            file::close(read_end);
            return Err(e);
        }
    };
    Ok((read_end, write_end))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_bytes() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();

        let pipe = Pipe::new();
        let n = pipe.write(b"hello, pipe").expect("write should fit the ring");
        assert_eq!(n, 11);

        let mut buf = [0u8; 32];
        let n = pipe.read(&mut buf).expect("read should return the data");
        assert_eq!(&buf[..n], b"hello, pipe");
    }

    #[test]
    fn read_after_writer_closes_returns_zero() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();

        let pipe = Pipe::new();
        pipe.write(b"tail").expect("write");
        pipe.close(PipeEnd::Write);

        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf).expect("drain"), 4);
        assert_eq!(pipe.read(&mut buf).expect("eof"), 0, "closed and drained pipe reads 0");
    }

    #[test]
    fn write_after_reader_closes_is_broken_pipe() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();

        let pipe = Pipe::new();
        pipe.close(PipeEnd::Read);
        assert!(matches!(pipe.write(b"x"), Err(KernelError::BrokenPipe)));
    }

    #[test]
    fn pipe_alloc_builds_matched_file_pair() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();

        let (r, w) = alloc().expect("pipe files");
        assert_eq!(file::write(w, b"through the table").expect("write end"), 17);
        let mut buf = [0u8; 32];
        assert_eq!(file::read(r, &mut buf).expect("read end"), 17);
        assert_eq!(&buf[..17], b"through the table");

        // Reading from the write end must fail.
        assert!(file::read(w, &mut buf).is_err());

        file::close(w);
        assert_eq!(file::read(r, &mut buf).expect("eof after close"), 0);
        file::close(r);
    }
}
