//! Block-I/O dispatch.
//!
//! A buffer headed for the disk goes to whichever engine is available:
//! AHCI DMA when a port came up, otherwise the legacy PIO IDE queue. A
//! RAM-backed device can stand in for real hardware (boot ramdisk, hosted
//! tests); with nothing registered at all, block I/O is a fatal
//! configuration error.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::config::{BSIZE, SECTORS_PER_BLOCK};
use crate::error::{KernelError, KernelResult};
use crate::fs::bio::Buf;

use super::{ahci, ide};

/// A linearly addressed block device.
pub trait BlockDevice: Sync {
    fn name(&self) -> &str;

    /// Number of `BSIZE` blocks.
    fn block_count(&self) -> u32;

    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]) -> KernelResult<()>;

    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]) -> KernelResult<()>;
}

/// Fallback device used when no disk controller is present.
static AUX_DISK: Once<&'static dyn BlockDevice> = Once::new();

/// Register a device to serve block I/O when neither AHCI nor IDE is
/// available.
pub fn register_aux_disk(dev: &'static dyn BlockDevice) {
    AUX_DISK.call_once(|| {
        log::info!("[BLOCK] using {} ({} blocks)", dev.name(), dev.block_count());
        dev
    });
}

/// Synchronize a buffer with the disk: write it out when DIRTY, fill it
/// when not yet VALID. The caller holds the buffer's sleeplock.
pub fn disk_rw(b: &Buf) {
    if !b.lock.holding() {
        panic!("disk_rw: buffer not locked");
    }
    if b.valid() && !b.dirty() {
        panic!("disk_rw: nothing to do");
    }

    if ahci::port_ready() {
        let lba = b.blockno() as u64 * SECTORS_PER_BLOCK as u64;
        // SAFETY: the sleeplock is held.
        let data = unsafe { b.data_mut() };
        let result = if b.dirty() {
            ahci::write(lba, SECTORS_PER_BLOCK as u32, data)
        } else {
            ahci::read(lba, SECTORS_PER_BLOCK as u32, data)
        };
        if let Err(e) = result {
            panic!(
                "ahci {} failed for block {}: {}",
                if b.dirty() { "write" } else { "read" },
                b.blockno(),
                e
            );
        }
        b.set_clean_valid();
        return;
    }

    if ide::controller_present() {
        ide::queue_rw(b);
        return;
    }

    if let Some(dev) = AUX_DISK.get() {
        // SAFETY: the sleeplock is held.
        let data = unsafe { b.data_mut() };
        let result = if b.dirty() {
            dev.write_block(b.blockno(), data)
        } else {
            dev.read_block(b.blockno(), data)
        };
        if let Err(e) = result {
            panic!(
                "{} {} failed for block {}: {}",
                dev.name(),
                if b.dirty() { "write" } else { "read" },
                b.blockno(),
                e
            );
        }
        b.set_clean_valid();
        return;
    }

    panic!("disk_rw: no disk controller");
}

// ---------------------------------------------------------------------------
// RAM-backed block device
// ---------------------------------------------------------------------------

/// A block device over an in-memory byte vector.
pub struct RamDisk {
    name: String,
    blocks: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(name: String, block_count: u32) -> Self {
        Self {
            name,
            blocks: Mutex::new(vec![0u8; block_count as usize * BSIZE]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_count(&self) -> u32 {
        (self.blocks.lock().len() / BSIZE) as u32
    }

    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]) -> KernelResult<()> {
        let blocks = self.blocks.lock();
        let start = blockno as usize * BSIZE;
        let end = start + BSIZE;
        if end > blocks.len() {
            return Err(KernelError::InvalidArgument { name: "blockno" });
        }
        buf.copy_from_slice(&blocks[start..end]);
        Ok(())
    }

    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]) -> KernelResult<()> {
        let mut blocks = self.blocks.lock();
        let start = blockno as usize * BSIZE;
        let end = start + BSIZE;
        if end > blocks.len() {
            return Err(KernelError::InvalidArgument { name: "blockno" });
        }
        blocks[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Install a RAM disk as the fallback device. Idempotent.
#[cfg(not(target_os = "none"))]
pub fn register_ramdisk_for_test(block_count: u32) {
    use alloc::boxed::Box;
    use alloc::string::ToString;
    AUX_DISK.call_once(|| {
        let disk: &'static RamDisk =
            Box::leak(Box::new(RamDisk::new("ramdisk".to_string(), block_count)));
        log::info!("[BLOCK] using {} ({} blocks)", disk.name(), disk.block_count());
        disk
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ramdisk_round_trips_blocks() {
        let disk = RamDisk::new(String::from("test"), 64);
        assert_eq!(disk.block_count(), 64);

        let mut block = [0u8; BSIZE];
        block[0] = 0xAB;
        block[BSIZE - 1] = 0xCD;
        disk.write_block(7, &block).expect("write in range");

        let mut readback = [0u8; BSIZE];
        disk.read_block(7, &mut readback).expect("read in range");
        assert_eq!(readback[0], 0xAB);
        assert_eq!(readback[BSIZE - 1], 0xCD);
    }

    #[test]
    fn ramdisk_rejects_out_of_range_blocks() {
        let disk = RamDisk::new(String::from("test"), 8);
        let mut block = [0u8; BSIZE];
        assert!(disk.read_block(8, &mut block).is_err());
        assert!(disk.write_block(9, &block).is_err());
    }
}
