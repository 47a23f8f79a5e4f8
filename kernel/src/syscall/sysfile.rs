//! File-related system calls.
//!
//! Everything here works through the inode operations table and the global
//! file table; the concrete filesystem never appears.

use alloc::vec;

use super::{arg_int, arg_ptr, arg_raw, arg_str, copy_from_user, copy_to_user};
use crate::config::{FRAMEBUFFER_MAJOR, CONSOLE_MAJOR, MAX_PATH, NOFILE};
use crate::error::{KernelError, KernelResult};
use crate::fs::file::{self, FileHandle, FileKind};
use crate::fs::inode::{self, InodeHandle, InodeType};
use crate::fs::{devsw, devtab, path, pipe, Stat};
use crate::mm::layout::FB_MMAP_BASE;
use crate::sched::cpu;

// Open flags.
pub const O_RDONLY: u32 = 0x000;
pub const O_WRONLY: u32 = 0x001;
pub const O_RDWR: u32 = 0x002;
pub const O_CREATE: u32 = 0x200;
pub const O_TRUNC: u32 = 0x400;

// ioctl requests.
pub const TIOCGWINSZ: u32 = 0x5413;
pub const FB_IOCTL_GET_WIDTH: u32 = 0x4600;
pub const FB_IOCTL_GET_HEIGHT: u32 = 0x4601;
pub const FB_IOCTL_GET_PITCH: u32 = 0x4602;
pub const FB_IOCTL_GET_FBADDR: u32 = 0x4603;

/// Largest single read/write the kernel stages at once.
const IO_CHUNK: usize = 4096;

/// The n-th argument as an open file descriptor.
fn arg_fd(n: usize) -> KernelResult<(usize, FileHandle)> {
    let fd = arg_int(n)?;
    if fd < 0 || fd as usize >= NOFILE {
        return Err(KernelError::BadFileDescriptor);
    }
    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    // SAFETY: reading the caller's own descriptor table.
    let f = unsafe { p.inner() }.ofile[fd as usize].ok_or(KernelError::BadFileDescriptor)?;
    Ok((fd as usize, f))
}

/// Install a file handle in the first free descriptor slot.
fn fd_alloc(f: FileHandle) -> KernelResult<usize> {
    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    // SAFETY: the running process owns its descriptor table.
    let inner = unsafe { p.inner() };
    for (fd, slot) in inner.ofile.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(f);
            return Ok(fd);
        }
    }
    Err(KernelError::ResourceExhausted {
        resource: "file descriptors",
    })
}

/// Create `path` as `typ`, returning a referenced, unlocked inode handle.
/// An existing file satisfies an O_CREATE of the same type.
fn create(path_str: &str, typ: InodeType, major: u16, minor: u16) -> KernelResult<InodeHandle> {
    let (parent, name) = path::namei_parent(path_str)?;
    let dp = inode::inode(parent);
    dp.ilock()?;

    let ops = inode::filesystem();
    if let Some(inum) = ops.dirlookup(dp, name) {
        let dev = dp.dev();
        inode::iunlockput(parent);
        let ih = inode::iget(dev, inum)?;
        let ip = inode::inode(ih);
        if let Err(e) = ip.ilock() {
            inode::iput(ih);
            return Err(e);
        }
        let existing_typ = ip.meta().typ;
        ip.iunlock();
        if typ == InodeType::File && existing_typ == InodeType::File {
            return Ok(ih);
        }
        inode::iput(ih);
        return Err(KernelError::AlreadyExists);
    }

    let dev = dp.dev();
    let inum = match ops.ialloc(dev, typ) {
        Ok(inum) => inum,
        Err(e) => {
            inode::iunlockput(parent);
            return Err(e);
        }
    };

    let ih = match inode::iget(dev, inum) {
        Ok(ih) => ih,
        Err(e) => {
            inode::iunlockput(parent);
            return Err(e);
        }
    };
    let ip = inode::inode(ih);
    if let Err(e) = ip.ilock() {
        inode::iput(ih);
        inode::iunlockput(parent);
        return Err(e);
    }
    {
        let mut meta = ip.meta();
        meta.typ = typ;
        meta.major = major;
        meta.minor = minor;
        meta.nlink = 1;
    }
    ip.iupdate().ok();

    if typ == InodeType::Dir {
        // "." and ".." live in the new directory; ".." references the
        // parent. A failure here means the directory cannot be wired into
        // the namespace at all.
        {
            let mut meta = dp.meta();
            meta.nlink += 1;
        }
        dp.iupdate().ok();
        if let Err(e) = ops
            .dirlink(ip, ".", inum)
            .and_then(|()| ops.dirlink(ip, "..", dp.inum()))
        {
            {
                let mut meta = dp.meta();
                meta.nlink -= 1;
            }
            dp.iupdate().ok();
            ip.iunlock();
            inode::iput(ih);
            inode::iunlockput(parent);
            return Err(e);
        }
    }

    let link = ops.dirlink(dp, name, inum);
    ip.iunlock();
    inode::iunlockput(parent);
    if let Err(e) = link {
        inode::iput(ih);
        return Err(e);
    }
    Ok(ih)
}

pub fn sys_open() -> KernelResult<i32> {
    let mut path_buf = [0u8; MAX_PATH];
    let len = arg_str(0, &mut path_buf)?;
    let path_str = core::str::from_utf8(&path_buf[..len])
        .map_err(|_| KernelError::InvalidArgument { name: "path" })?;
    let flags = arg_raw(1)?;

    let ih = if flags & O_CREATE != 0 {
        create(path_str, InodeType::File, 0, 0)?
    } else {
        let ih = path::namei(path_str)?;
        let ip = inode::inode(ih);
        ip.ilock()?;
        let typ = ip.meta().typ;
        ip.iunlock();
        // Directories open read-only.
        if typ == InodeType::Dir && flags & (O_WRONLY | O_RDWR) != 0 {
            inode::iput(ih);
            return Err(KernelError::PermissionDenied);
        }
        ih
    };

    if flags & O_TRUNC != 0 {
        let ip = inode::inode(ih);
        ip.ilock()?;
        inode::filesystem().itrunc(ip).ok();
        ip.iunlock();
    }

    let readable = flags & O_WRONLY == 0;
    let writable = flags & (O_WRONLY | O_RDWR) != 0;
    let f = match file::alloc(FileKind::Inode(ih), readable, writable) {
        Ok(f) => f,
        Err(e) => {
            inode::iput(ih);
            return Err(e);
        }
    };
    match fd_alloc(f) {
        Ok(fd) => Ok(fd as i32),
        Err(e) => {
            file::close(f);
            Err(e)
        }
    }
}

pub fn sys_close() -> KernelResult<i32> {
    let (fd, f) = arg_fd(0)?;
    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    // SAFETY: the running process owns its descriptor table.
    unsafe { p.inner() }.ofile[fd] = None;
    file::close(f);
    Ok(0)
}

pub fn sys_read() -> KernelResult<i32> {
    let (_, f) = arg_fd(0)?;
    let n = arg_int(2)?;
    if n < 0 {
        return Err(KernelError::InvalidArgument { name: "count" });
    }
    let uva = arg_ptr(1, n as usize)?;

    let mut remaining = n as usize;
    let mut total = 0usize;
    let mut staging = vec![0u8; remaining.min(IO_CHUNK)];
    while remaining > 0 {
        let chunk = remaining.min(IO_CHUNK);
        let got = file::read(f, &mut staging[..chunk])?;
        if got == 0 {
            break;
        }
        copy_to_user(uva + total as u32, &staging[..got])?;
        total += got;
        remaining -= got;
        if got < chunk {
            break;
        }
    }
    Ok(total as i32)
}

pub fn sys_write() -> KernelResult<i32> {
    let (_, f) = arg_fd(0)?;
    let n = arg_int(2)?;
    if n < 0 {
        return Err(KernelError::InvalidArgument { name: "count" });
    }
    let uva = arg_ptr(1, n as usize)?;

    let mut remaining = n as usize;
    let mut total = 0usize;
    let mut staging = vec![0u8; remaining.min(IO_CHUNK)];
    while remaining > 0 {
        let chunk = remaining.min(IO_CHUNK);
        copy_from_user(&mut staging[..chunk], uva + total as u32)?;
        let put = file::write(f, &staging[..chunk])?;
        total += put;
        remaining -= put;
        if put < chunk {
            break;
        }
    }
    Ok(total as i32)
}

pub fn sys_lseek() -> KernelResult<i32> {
    let (_, f) = arg_fd(0)?;
    let offset = arg_int(1)?;
    let whence = arg_raw(2)?;
    let pos = file::lseek(f, offset, whence)?;
    Ok(pos as i32)
}

pub fn sys_dup() -> KernelResult<i32> {
    let (_, f) = arg_fd(0)?;
    let fd = fd_alloc(f)?;
    file::dup(f);
    Ok(fd as i32)
}

pub fn sys_fstat() -> KernelResult<i32> {
    let (_, f) = arg_fd(0)?;
    let uva = arg_ptr(1, core::mem::size_of::<Stat>())?;
    let st = file::stat(f)?;
    // SAFETY: Stat is plain data; viewing it as bytes for the user copy.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &st as *const Stat as *const u8,
            core::mem::size_of::<Stat>(),
        )
    };
    copy_to_user(uva, bytes)?;
    Ok(0)
}

pub fn sys_pipe() -> KernelResult<i32> {
    let uva = arg_ptr(0, 8)?;
    let (read_end, write_end) = pipe::alloc()?;

    let rfd = match fd_alloc(read_end) {
        Ok(fd) => fd,
        Err(e) => {
            file::close(read_end);
            file::close(write_end);
            return Err(e);
        }
    };
    let wfd = match fd_alloc(write_end) {
        Ok(fd) => fd,
        Err(e) => {
            let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
            // SAFETY: the running process owns its descriptor table.
            unsafe { p.inner() }.ofile[rfd] = None;
            file::close(read_end);
            file::close(write_end);
            return Err(e);
        }
    };

    let fds = [rfd as u32, wfd as u32];
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&fds[0].to_le_bytes());
    bytes[4..].copy_from_slice(&fds[1].to_le_bytes());
    copy_to_user(uva, &bytes)?;
    Ok(0)
}

pub fn sys_mknod() -> KernelResult<i32> {
    let mut path_buf = [0u8; MAX_PATH];
    let len = arg_str(0, &mut path_buf)?;
    let path_str = core::str::from_utf8(&path_buf[..len])
        .map_err(|_| KernelError::InvalidArgument { name: "path" })?;
    let major = arg_int(1)?;
    let minor = arg_int(2)?;
    if major < 0 || !inode::valid_major(major as u16) {
        return Err(KernelError::InvalidArgument { name: "major" });
    }

    let ih = create(path_str, InodeType::Dev, major as u16, minor as u16)?;
    let ip = inode::inode(ih);
    devtab::add_entry(ip.inum(), ip.dev(), major as u16, minor as u16, path_str);
    inode::iput(ih);
    Ok(0)
}

pub fn sys_mkdir() -> KernelResult<i32> {
    let mut path_buf = [0u8; MAX_PATH];
    let len = arg_str(0, &mut path_buf)?;
    let path_str = core::str::from_utf8(&path_buf[..len])
        .map_err(|_| KernelError::InvalidArgument { name: "path" })?;
    let ih = create(path_str, InodeType::Dir, 0, 0)?;
    inode::iput(ih);
    Ok(0)
}

pub fn sys_link() -> KernelResult<i32> {
    let mut old_buf = [0u8; MAX_PATH];
    let mut new_buf = [0u8; MAX_PATH];
    let old_len = arg_str(0, &mut old_buf)?;
    let new_len = arg_str(1, &mut new_buf)?;
    let old_path = core::str::from_utf8(&old_buf[..old_len])
        .map_err(|_| KernelError::InvalidArgument { name: "path" })?;
    let new_path = core::str::from_utf8(&new_buf[..new_len])
        .map_err(|_| KernelError::InvalidArgument { name: "path" })?;

    let ih = path::namei(old_path)?;
    let ip = inode::inode(ih);
    ip.ilock()?;
    if ip.meta().typ == InodeType::Dir {
        ip.iunlock();
        inode::iput(ih);
        return Err(KernelError::PermissionDenied);
    }
    ip.meta().nlink += 1;
    ip.iupdate().ok();
    ip.iunlock();

    let result = (|| {
        let (parent, name) = path::namei_parent(new_path)?;
        let dp = inode::inode(parent);
        dp.ilock()?;
        if dp.dev() != ip.dev() {
            inode::iunlockput(parent);
            return Err(KernelError::PermissionDenied);
        }
        let link = inode::filesystem().dirlink(dp, name, ip.inum());
        inode::iunlockput(parent);
        link
    })();

    if result.is_err() {
        if ip.ilock().is_ok() {
            ip.meta().nlink -= 1;
            ip.iupdate().ok();
            ip.iunlock();
        }
    }
    inode::iput(ih);
    result.map(|_| 0)
}

pub fn sys_unlink() -> KernelResult<i32> {
    let mut path_buf = [0u8; MAX_PATH];
    let len = arg_str(0, &mut path_buf)?;
    let path_str = core::str::from_utf8(&path_buf[..len])
        .map_err(|_| KernelError::InvalidArgument { name: "path" })?;

    let (parent, name) = path::namei_parent(path_str)?;
    if name == "." || name == ".." {
        inode::iput(parent);
        return Err(KernelError::InvalidArgument { name: "path" });
    }

    let dp = inode::inode(parent);
    dp.ilock()?;
    let ops = inode::filesystem();

    let inum = match ops.dirlookup(dp, name) {
        Some(inum) => inum,
        None => {
            inode::iunlockput(parent);
            return Err(KernelError::NotFound);
        }
    };
    let ih = inode::iget(dp.dev(), inum)?;
    let ip = inode::inode(ih);
    ip.ilock()?;

    if ip.meta().typ == InodeType::Dir && !ops.dir_is_empty(ip) {
        ip.iunlock();
        inode::iput(ih);
        inode::iunlockput(parent);
        return Err(KernelError::PermissionDenied);
    }

    if let Err(e) = ops.dirunlink(dp, name) {
        ip.iunlock();
        inode::iput(ih);
        inode::iunlockput(parent);
        return Err(e);
    }

    if ip.meta().typ == InodeType::Dir {
        dp.meta().nlink -= 1;
        dp.iupdate().ok();
    }
    inode::iunlockput(parent);

    ip.meta().nlink -= 1;
    ip.iupdate().ok();
    ip.iunlock();
    inode::iput(ih);
    Ok(0)
}

pub fn sys_chdir() -> KernelResult<i32> {
    let mut path_buf = [0u8; MAX_PATH];
    let len = arg_str(0, &mut path_buf)?;
    let path_str = core::str::from_utf8(&path_buf[..len])
        .map_err(|_| KernelError::InvalidArgument { name: "path" })?;

    let ih = path::namei(path_str)?;
    let ip = inode::inode(ih);
    ip.ilock()?;
    if ip.meta().typ != InodeType::Dir {
        ip.iunlock();
        inode::iput(ih);
        return Err(KernelError::NotFound);
    }
    ip.iunlock();

    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    // SAFETY: the running process owns its cwd.
    let inner = unsafe { p.inner() };
    if let Some(old) = inner.cwd.replace(ih) {
        inode::iput(old);
    }
    inner.set_cwd_path(path_str);
    Ok(0)
}

pub fn sys_getcwd() -> KernelResult<i32> {
    let n = arg_int(1)?;
    if n <= 0 {
        return Err(KernelError::InvalidArgument { name: "size" });
    }
    let uva = arg_ptr(0, n as usize)?;

    let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
    // SAFETY: reading the caller's own cwd path.
    let inner = unsafe { p.inner() };
    let cwd = inner.cwd_path_str();
    let cwd = if cwd.is_empty() { "/" } else { cwd };

    let copy_len = cwd.len().min(n as usize - 1);
    copy_to_user(uva, &cwd.as_bytes()[..copy_len])?;
    copy_to_user(uva + copy_len as u32, &[0u8])?;
    Ok(0)
}

pub fn sys_exec() -> KernelResult<i32> {
    let mut path_buf = [0u8; MAX_PATH];
    let len = arg_str(0, &mut path_buf)?;
    let path_str = core::str::from_utf8(&path_buf[..len])
        .map_err(|_| KernelError::InvalidArgument { name: "path" })?;
    let argv_uva = arg_raw(1)?;

    // Gather argv: a NULL-terminated array of user string pointers. The
    // strings are staged on the heap; the kernel stack is one page.
    let mut args: alloc::vec::Vec<alloc::string::String> = alloc::vec::Vec::new();
    while args.len() < crate::config::MAX_ARG {
        let ptr = super::fetch_u32(argv_uva + 4 * args.len() as u32)?;
        if ptr == 0 {
            break;
        }
        let p = cpu::current_proc().ok_or(KernelError::NotFound)?;
        // SAFETY: reading the caller's own page directory.
        let dir = unsafe { p.inner() }.pagedir.ok_or(KernelError::NotFound)?;
        let mut buf = [0u8; MAX_PATH];
        let len = crate::mm::vm::fetch_str(dir, ptr, &mut buf)?;
        let s = core::str::from_utf8(&buf[..len])
            .map_err(|_| KernelError::InvalidArgument { name: "argv" })?;
        args.push(alloc::string::String::from(s));
    }

    let argv: alloc::vec::Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    crate::proc::exec::exec(path_str, &argv)?;
    // On success the return value is overwritten when the new frame's eax
    // is restored anyway.
    Ok(0)
}

pub fn sys_ioctl() -> KernelResult<i32> {
    let (_, f) = arg_fd(0)?;
    let request = arg_raw(1)?;

    let ih = file::with_body(f, |body| match body.kind {
        FileKind::Inode(ih) => Some(ih),
        _ => None,
    })
    .ok_or(KernelError::BadFileDescriptor)?;

    let ip = inode::inode(ih);
    ip.ilock()?;
    let (typ, inum, inode_major) = {
        let meta = ip.meta();
        (meta.typ, ip.inum(), meta.major)
    };
    ip.iunlock();
    if typ != InodeType::Dev {
        return Err(KernelError::BadFileDescriptor);
    }
    let major = devtab::lookup_major(inum, inode_major);

    match request {
        TIOCGWINSZ => {
            if major != CONSOLE_MAJOR {
                return Err(KernelError::NotSupported);
            }
            let uva = arg_ptr(2, 8)?;
            let mut winsize = [0u8; 8];
            let n = devsw::ioctl(major, request, &mut winsize)?;
            copy_to_user(uva, &winsize[..n])?;
            Ok(0)
        }
        FB_IOCTL_GET_WIDTH | FB_IOCTL_GET_HEIGHT | FB_IOCTL_GET_PITCH | FB_IOCTL_GET_FBADDR => {
            if major != FRAMEBUFFER_MAJOR {
                return Err(KernelError::NotSupported);
            }
            let fb = *crate::arch::x86::boot::FRAMEBUFFER
                .get()
                .ok_or(KernelError::NotSupported)?;
            let value = match request {
                FB_IOCTL_GET_WIDTH => fb.width,
                FB_IOCTL_GET_HEIGHT => fb.height,
                FB_IOCTL_GET_PITCH => fb.pitch,
                _ => FB_MMAP_BASE,
            };
            let uva = arg_ptr(2, 4)?;
            copy_to_user(uva, &value.to_le_bytes())?;
            Ok(0)
        }
        _ => Err(KernelError::NotSupported),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::ramfs;

    #[test]
    fn nested_mkdir_links_dot_dot_to_the_real_parent() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();
        ramfs::init_for_test();

        let a = create("/dira", InodeType::Dir, 0, 0).expect("mkdir /dira");
        let a_inum = inode::inode(a).inum();
        let b = create("/dira/dirb", InodeType::Dir, 0, 0).expect("mkdir /dira/dirb");
        let b_inum = inode::inode(b).inum();
        assert_ne!(a_inum, b_inum);

        // ".." in the nested directory must resolve to its real parent,
        // not to the root.
        let dotdot = path::namei("/dira/dirb/..").expect("walk through dot-dot");
        assert_eq!(inode::inode(dotdot).inum(), a_inum);
        assert_ne!(
            inode::inode(dotdot).inum(),
            inode::filesystem().root_inum(),
            "dot-dot of a nested directory must not point at the root"
        );

        // "." resolves to the directory itself.
        let dot = path::namei("/dira/dirb/.").expect("walk through dot");
        assert_eq!(inode::inode(dot).inum(), b_inum);

        inode::iput(dotdot);
        inode::iput(dot);
        inode::iput(b);
        inode::iput(a);
    }
}
