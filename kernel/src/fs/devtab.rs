//! The device-file table.
//!
//! Maps an inode number to its device identity `(major, minor)` so device
//! nodes keep working across filesystems that do not store major/minor
//! natively. The on-disk form is one ASCII line per device:
//!
//! ```text
//! <inum>\tchar\t<major>\t<minor>\t# <path>\n
//! ```
//!
//! Persistence to `/etc/devtab` is performed by userland tooling; the
//! kernel parses and formats the lines.

use core::fmt::Write;

use alloc::string::String;

use spin::Mutex;

use crate::config::{MAX_PATH, NDEV};

#[derive(Debug, Clone, Copy)]
pub struct DevtabEntry {
    pub inum: u32,
    pub dev: u32,
    pub major: u16,
    pub minor: u16,
    pub path: [u8; MAX_PATH],
}

impl DevtabEntry {
    const fn empty() -> Self {
        Self {
            inum: 0,
            dev: 0,
            major: 0,
            minor: 0,
            path: [0; MAX_PATH],
        }
    }

    pub fn path_str(&self) -> &str {
        let len = self.path.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.path[..len]).unwrap_or("")
    }
}

static DEVTAB: Mutex<[DevtabEntry; NDEV]> = Mutex::new([DevtabEntry::empty(); NDEV]);

/// The major number for an inode: the table entry when one exists, the
/// caller's fallback (the inode's own field) otherwise.
pub fn lookup_major(inum: u32, fallback: u16) -> u16 {
    let table = DEVTAB.lock();
    for entry in table.iter() {
        if entry.inum == inum && entry.inum != 0 {
            return entry.major;
        }
    }
    fallback
}

/// Add or update a device entry. An existing inum updates in place; a new
/// one takes the first free slot. Silently drops the entry when the table
/// is full.
pub fn add_entry(inum: u32, dev: u32, major: u16, minor: u16, path: &str) {
    let mut table = DEVTAB.lock();

    let mut path_buf = [0u8; MAX_PATH];
    let n = path.len().min(MAX_PATH - 1);
    path_buf[..n].copy_from_slice(&path.as_bytes()[..n]);

    let slot = table
        .iter()
        .position(|e| e.inum == inum && e.inum != 0)
        .or_else(|| table.iter().position(|e| e.inum == 0));

    if let Some(i) = slot {
        table[i] = DevtabEntry {
            inum,
            dev,
            major,
            minor,
            path: path_buf,
        };
    }
}

/// Visit every populated entry.
pub fn for_each(mut f: impl FnMut(&DevtabEntry)) {
    let table = DEVTAB.lock();
    for entry in table.iter() {
        if entry.inum != 0 {
            f(entry);
        }
    }
}

/// Format one entry in the devtab line format.
pub fn format_entry(entry: &DevtabEntry) -> String {
    let mut line = String::new();
    let _ = write!(
        line,
        "{}\tchar\t{}\t{}\t# {}\n",
        entry.inum,
        entry.major,
        entry.minor,
        entry.path_str()
    );
    line
}

/// Parse one devtab line into `(inum, major, minor)`. The trailing comment
/// carries the path and is ignored here.
pub fn parse_line(line: &str) -> Option<(u32, u16, u16)> {
    let mut fields = line.split('\t');
    let inum: u32 = fields.next()?.trim().parse().ok()?;
    let kind = fields.next()?.trim();
    if kind != "char" {
        return None;
    }
    let major: u16 = fields.next()?.trim().parse().ok()?;
    let minor: u16 = fields.next()?.trim().parse().ok()?;
    Some((inum, major, minor))
}

/// Load entries from the textual table contents (the parsed form of
/// `/etc/devtab`).
pub fn load_from_str(contents: &str) {
    for line in contents.lines() {
        if let Some((inum, major, minor)) = parse_line(line) {
            add_entry(inum, 0, major, minor, "");
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn format_and_parse_round_trip() {
        let mut entry = DevtabEntry::empty();
        entry.inum = 12;
        entry.major = 1;
        entry.minor = 0;
        entry.path[..12].copy_from_slice(b"/dev/console");

        let line = format_entry(&entry);
        assert_eq!(line, "12\tchar\t1\t0\t# /dev/console\n");

        let (inum, major, minor) = parse_line(&line).expect("formatted line must parse");
        assert_eq!((inum, major, minor), (12, 1, 0));
    }

    #[test]
    fn parse_rejects_non_char_and_garbage() {
        assert!(parse_line("12\tblock\t1\t0\t# x").is_none());
        assert!(parse_line("nonsense").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn duplicate_inum_updates_in_place() {
        let _guard = crate::hosted::lock();
        add_entry(40, 0, 1, 0, "/dev/console");
        add_entry(40, 0, 2, 3, "/dev/fb0");

        assert_eq!(lookup_major(40, 99), 2, "last write for an inum wins");

        let mut count = 0;
        for_each(|e| {
            if e.inum == 40 {
                count += 1;
            }
        });
        assert_eq!(count, 1, "no duplicate rows for one inum");
    }

    #[test]
    fn lookup_falls_back_to_the_inode_major() {
        let _guard = crate::hosted::lock();
        assert_eq!(lookup_major(0xFFFF_0001, 7), 7);
    }

    #[test]
    fn load_from_str_populates_the_table() {
        let _guard = crate::hosted::lock();
        load_from_str("90\tchar\t1\t0\t# /dev/console\n91\tchar\t2\t0\t# /dev/fb0\n");
        assert_eq!(lookup_major(90, 0), 1);
        assert_eq!(lookup_major(91, 0), 2);
    }
}
