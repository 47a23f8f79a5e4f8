//! Path resolution.
//!
//! Generic over the registered filesystem: walking only needs `dirlookup`
//! from the operations table. Absolute paths start at the filesystem root,
//! relative paths at the current process's working directory.

use crate::config::ROOT_DEV;
use crate::error::{KernelError, KernelResult};
use crate::fs::inode::{self, InodeHandle, InodeType};

/// Longest single path component.
pub const MAX_NAME: usize = 60;

/// Split the first component off `path`, returning `(name, rest)`. Empty
/// components (duplicate slashes) are skipped.
pub fn skip_element(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    match path.find('/') {
        Some(pos) => Some((&path[..pos], path[pos..].trim_start_matches('/'))),
        None => Some((path, "")),
    }
}

fn start_inode(path: &str) -> KernelResult<InodeHandle> {
    if path.starts_with('/') {
        inode::iget(ROOT_DEV, inode::filesystem().root_inum())
    } else {
        let p = crate::sched::cpu::current_proc().ok_or(KernelError::NotFound)?;
        // SAFETY: reading the current process's own cwd.
        let cwd = unsafe { p.inner() }.cwd.ok_or(KernelError::NotFound)?;
        Ok(inode::idup(cwd))
    }
}

/// Resolve `path` to an inode reference.
pub fn namei(path: &str) -> KernelResult<InodeHandle> {
    walk(path, false).map(|(ih, _)| ih)
}

/// Resolve `path` to its parent directory, returning the final component.
pub fn namei_parent(path: &str) -> KernelResult<(InodeHandle, &str)> {
    walk(path, true)
}

fn walk(path: &str, stop_at_parent: bool) -> KernelResult<(InodeHandle, &str)> {
    let mut current = start_inode(path)?;
    let mut rest = path;

    loop {
        let (name, remainder) = match skip_element(rest) {
            Some(parts) => parts,
            None => {
                // Ran out of components: "/" or an empty relative path.
                if stop_at_parent {
                    inode::iput(current);
                    return Err(KernelError::NotFound);
                }
                return Ok((current, ""));
            }
        };
        if name.len() > MAX_NAME {
            inode::iput(current);
            return Err(KernelError::InvalidArgument { name: "path" });
        }

        let ip = inode::inode(current);
        ip.ilock()?;
        if ip.meta().typ != InodeType::Dir {
            inode::iunlockput(current);
            return Err(KernelError::NotFound);
        }

        if stop_at_parent && remainder.is_empty() {
            ip.iunlock();
            return Ok((current, name));
        }

        let next_inum = inode::filesystem().dirlookup(ip, name);
        match next_inum {
            Some(inum) => {
                let dev = ip.dev();
                inode::iunlockput(current);
                current = inode::iget(dev, inum)?;
                rest = remainder;
            }
            None => {
                inode::iunlockput(current);
                return Err(KernelError::NotFound);
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn skip_element_handles_slashes() {
        assert_eq!(skip_element("a/bb/c"), Some(("a", "bb/c")));
        assert_eq!(skip_element("///a//bb"), Some(("a", "bb")));
        assert_eq!(skip_element("a"), Some(("a", "")));
        assert_eq!(skip_element("a/"), Some(("a", "")));
        assert_eq!(skip_element("/"), None);
        assert_eq!(skip_element(""), None);
    }

    #[test]
    fn namei_resolves_nested_paths_on_ramfs() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();
        crate::fs::ramfs::init_for_test();

        crate::fs::ramfs::populate(&[
            ("/bin", None),
            ("/bin/echo", Some(b"fake elf".as_slice())),
            ("/etc", None),
        ]);

        let ih = namei("/bin/echo").expect("nested path must resolve");
        let ip = inode::inode(ih);
        ip.ilock().expect("ilock");
        assert_eq!(ip.meta().typ, InodeType::File);
        assert_eq!(ip.meta().size, 8);
        inode::iunlockput(ih);

        assert!(matches!(
            namei("/bin/missing"),
            Err(KernelError::NotFound)
        ));

        let (parent, name) = namei_parent("/bin/echo").expect("parent resolution");
        let pp = inode::inode(parent);
        pp.ilock().expect("ilock parent");
        assert_eq!(pp.meta().typ, InodeType::Dir);
        inode::iunlockput(parent);
        assert_eq!(name, "echo");
    }

    #[test]
    fn namei_root_resolves_to_a_directory() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();
        crate::fs::ramfs::init_for_test();

        let ih = namei("/").expect("root must resolve");
        let ip = inode::inode(ih);
        ip.ilock().expect("ilock");
        assert_eq!(ip.meta().typ, InodeType::Dir);
        inode::iunlockput(ih);
    }
}
