//! RAM-backed filesystem.
//!
//! A small in-memory filesystem implementing the inode operations table.
//! It backs early boot (before the real root filesystem is up) and the
//! hosted test environment; the disk filesystem replaces it by registering
//! first on bare metal.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::fs::inode::{self, Inode, InodeOps, InodeType};

const ROOT_INUM: u32 = 1;

struct RamNode {
    typ: InodeType,
    major: u16,
    minor: u16,
    nlink: u16,
    data: Vec<u8>,
    entries: Vec<(String, u32)>,
}

impl RamNode {
    fn dir(parent: u32, own: u32) -> Self {
        Self {
            typ: InodeType::Dir,
            major: 0,
            minor: 0,
            nlink: 1,
            data: Vec::new(),
            entries: alloc::vec![(".".to_string(), own), ("..".to_string(), parent)],
        }
    }

    fn file() -> Self {
        Self {
            typ: InodeType::File,
            major: 0,
            minor: 0,
            nlink: 1,
            data: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// A freshly allocated node with no links and no entries; the caller
    /// wires it into the namespace.
    fn empty(typ: InodeType) -> Self {
        Self {
            typ,
            major: 0,
            minor: 0,
            nlink: 0,
            data: Vec::new(),
            entries: Vec::new(),
        }
    }
}

pub struct RamFs {
    nodes: Mutex<BTreeMap<u32, RamNode>>,
    next_inum: AtomicU32,
}

static RAMFS: RamFs = RamFs {
    nodes: Mutex::new(BTreeMap::new()),
    next_inum: AtomicU32::new(2),
};

impl RamFs {
    fn ensure_root(&self) {
        let mut nodes = self.nodes.lock();
        nodes
            .entry(ROOT_INUM)
            .or_insert_with(|| RamNode::dir(ROOT_INUM, ROOT_INUM));
    }
}

impl InodeOps for RamFs {
    fn root_inum(&self) -> u32 {
        ROOT_INUM
    }

    fn iload(&self, ip: &Inode) -> KernelResult<()> {
        let nodes = self.nodes.lock();
        let node = nodes.get(&ip.inum()).ok_or(KernelError::NotFound)?;
        let mut meta = ip.meta();
        meta.typ = node.typ;
        meta.major = node.major;
        meta.minor = node.minor;
        meta.nlink = node.nlink;
        meta.size = node.data.len() as u32;
        Ok(())
    }

    fn iupdate(&self, ip: &Inode) -> KernelResult<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&ip.inum()).ok_or(KernelError::NotFound)?;
        let meta = ip.meta();
        node.typ = meta.typ;
        node.major = meta.major;
        node.minor = meta.minor;
        node.nlink = meta.nlink;
        Ok(())
    }

    fn itrunc(&self, ip: &Inode) -> KernelResult<()> {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get_mut(&ip.inum()) {
            node.data.clear();
        }
        ip.meta().size = 0;
        Ok(())
    }

    fn readi(&self, ip: &Inode, dst: &mut [u8], off: u32) -> KernelResult<usize> {
        let nodes = self.nodes.lock();
        let node = nodes.get(&ip.inum()).ok_or(KernelError::NotFound)?;
        let off = off as usize;
        if off >= node.data.len() {
            return Ok(0);
        }
        let n = dst.len().min(node.data.len() - off);
        dst[..n].copy_from_slice(&node.data[off..off + n]);
        Ok(n)
    }

    fn writei(&self, ip: &Inode, src: &[u8], off: u32) -> KernelResult<usize> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&ip.inum()).ok_or(KernelError::NotFound)?;
        let off = off as usize;
        let end = off + src.len();
        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[off..end].copy_from_slice(src);
        ip.meta().size = node.data.len() as u32;
        Ok(src.len())
    }

    fn dirlookup(&self, dir: &Inode, name: &str) -> Option<u32> {
        let nodes = self.nodes.lock();
        let node = nodes.get(&dir.inum())?;
        node.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, inum)| *inum)
    }

    fn dirlink(&self, dir: &Inode, name: &str, inum: u32) -> KernelResult<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&dir.inum()).ok_or(KernelError::NotFound)?;
        if node.entries.iter().any(|(n, _)| n == name) {
            return Err(KernelError::AlreadyExists);
        }
        node.entries.push((name.to_string(), inum));
        Ok(())
    }

    fn dirunlink(&self, dir: &Inode, name: &str) -> KernelResult<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&dir.inum()).ok_or(KernelError::NotFound)?;
        let pos = node
            .entries
            .iter()
            .position(|(n, _)| n == name)
            .ok_or(KernelError::NotFound)?;
        node.entries.remove(pos);
        Ok(())
    }

    fn dir_is_empty(&self, dir: &Inode) -> bool {
        let nodes = self.nodes.lock();
        match nodes.get(&dir.inum()) {
            Some(node) => node.entries.iter().all(|(n, _)| n == "." || n == ".."),
            None => true,
        }
    }

    fn ialloc(&self, _dev: u32, typ: InodeType) -> KernelResult<u32> {
        let inum = self.next_inum.fetch_add(1, Ordering::Relaxed);
        // No namespace entries yet: "." and ".." in a new directory come
        // from the caller's dirlink calls, which know the real parent.
        self.nodes.lock().insert(inum, RamNode::empty(typ));
        Ok(inum)
    }
}

/// Register the RAM filesystem as the root filesystem and make sure the
/// root directory exists.
pub fn init() {
    RAMFS.ensure_root();
    inode::register_filesystem(&RAMFS);
}

/// Hosted alias for `init`, named for what tests use it as.
#[cfg(not(target_os = "none"))]
pub fn init_for_test() {
    init();
}

/// Seed the filesystem with paths: `None` content creates a directory,
/// `Some(bytes)` a file. Parent directories must be listed first.
pub fn populate(paths: &[(&str, Option<&[u8]>)]) {
    RAMFS.ensure_root();
    for (path, content) in paths {
        let mut nodes = RAMFS.nodes.lock();

        // Walk to the parent, component by component.
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let mut parent = ROOT_INUM;
        let components: Vec<&str> = trimmed.split('/').collect();
        let (leaf, dirs) = components.split_last().expect("non-empty path");

        for dir in dirs {
            let found = nodes
                .get(&parent)
                .and_then(|n| n.entries.iter().find(|(name, _)| name == dir).map(|(_, i)| *i));
            parent = match found {
                Some(inum) => inum,
                None => {
                    let inum = RAMFS.next_inum.fetch_add(1, Ordering::Relaxed);
                    nodes.insert(inum, RamNode::dir(parent, inum));
                    nodes
                        .get_mut(&parent)
                        .expect("parent exists")
                        .entries
                        .push((dir.to_string(), inum));
                    inum
                }
            };
        }

        let already = nodes
            .get(&parent)
            .map(|n| n.entries.iter().any(|(name, _)| name == leaf))
            .unwrap_or(false);
        if already {
            continue;
        }

        let inum = RAMFS.next_inum.fetch_add(1, Ordering::Relaxed);
        let node = match content {
            None => RamNode::dir(parent, inum),
            Some(bytes) => {
                let mut node = RamNode::file();
                node.data = bytes.to_vec();
                node
            }
        };
        nodes.insert(inum, node);
        nodes
            .get_mut(&parent)
            .expect("parent exists")
            .entries
            .push((leaf.to_string(), inum));
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn read_write_through_the_ops_table() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();
        init_for_test();

        let inum = RAMFS.ialloc(1, InodeType::File).expect("ialloc");
        let ih = inode::iget(1, inum).expect("iget");
        let ip = inode::inode(ih);
        ip.ilock().expect("ilock");

        assert_eq!(RAMFS.writei(ip, b"hello world", 0).expect("write"), 11);
        assert_eq!(ip.meta().size, 11);

        let mut buf = [0u8; 5];
        assert_eq!(RAMFS.readi(ip, &mut buf, 6).expect("read"), 5);
        assert_eq!(&buf, b"world");

        // Reads past the end are short.
        assert_eq!(RAMFS.readi(ip, &mut buf, 100).expect("read past end"), 0);

        inode::iunlockput(ih);
    }

    #[test]
    fn dirlink_rejects_duplicates() {
        let _guard = crate::hosted::bootstrap();
        crate::sched::cpu::reset_interrupt_state_for_test();
        init_for_test();

        let dir_inum = RAMFS.ialloc(1, InodeType::Dir).expect("ialloc dir");
        let dh = inode::iget(1, dir_inum).expect("iget");
        let dp = inode::inode(dh);
        dp.ilock().expect("ilock");

        RAMFS.dirlink(dp, "a", 42).expect("first link");
        assert!(matches!(
            RAMFS.dirlink(dp, "a", 43),
            Err(KernelError::AlreadyExists)
        ));
        assert_eq!(RAMFS.dirlookup(dp, "a"), Some(42));
        assert!(!RAMFS.dir_is_empty(dp));
        RAMFS.dirunlink(dp, "a").expect("unlink");
        assert!(RAMFS.dir_is_empty(dp));

        inode::iunlockput(dh);
    }
}
