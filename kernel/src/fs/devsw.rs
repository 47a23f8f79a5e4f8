//! Device operation dispatch.
//!
//! `read`/`write` on a device inode index this table by major number. The
//! console and framebuffer drivers register their operations at boot; the
//! core only routes.

use spin::Mutex;

use crate::config::NDEV;
use crate::error::{KernelError, KernelResult};

/// Operations a character device driver provides.
pub trait DevOps: Sync {
    fn read(&self, dst: &mut [u8]) -> KernelResult<usize>;
    fn write(&self, src: &[u8]) -> KernelResult<usize>;
    /// Driver-specific control; returns the bytes written into `out`.
    /// Default: unsupported.
    fn ioctl(&self, _request: u32, _out: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }
}

static DEVSW: Mutex<[Option<&'static dyn DevOps>; NDEV]> = Mutex::new([None; NDEV]);

/// Register a driver under a major number.
pub fn register(major: u16, ops: &'static dyn DevOps) {
    let mut table = DEVSW.lock();
    if (major as usize) < NDEV {
        table[major as usize] = Some(ops);
    }
}

fn lookup(major: u16) -> KernelResult<&'static dyn DevOps> {
    DEVSW
        .lock()
        .get(major as usize)
        .copied()
        .flatten()
        .ok_or(KernelError::BadFileDescriptor)
}

pub fn read(major: u16, dst: &mut [u8]) -> KernelResult<usize> {
    lookup(major)?.read(dst)
}

pub fn write(major: u16, src: &[u8]) -> KernelResult<usize> {
    lookup(major)?.write(src)
}

pub fn ioctl(major: u16, request: u32, out: &mut [u8]) -> KernelResult<usize> {
    lookup(major)?.ioctl(request, out)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    struct Echo;

    impl DevOps for Echo {
        fn read(&self, dst: &mut [u8]) -> KernelResult<usize> {
            for b in dst.iter_mut() {
                *b = b'e';
            }
            Ok(dst.len())
        }

        fn write(&self, src: &[u8]) -> KernelResult<usize> {
            Ok(src.len())
        }
    }

    static ECHO: Echo = Echo;

    #[test]
    fn registered_major_routes_and_unknown_fails() {
        let _guard = crate::hosted::lock();
        register(5, &ECHO);

        let mut buf = [0u8; 4];
        assert_eq!(read(5, &mut buf).expect("registered major"), 4);
        assert_eq!(&buf, b"eeee");
        assert_eq!(write(5, b"xy").expect("registered major"), 2);

        assert!(matches!(
            read(9, &mut buf),
            Err(KernelError::BadFileDescriptor)
        ));
        let mut out = [0u8; 4];
        assert!(matches!(
            ioctl(5, 1, &mut out),
            Err(KernelError::NotSupported)
        ));
    }
}
