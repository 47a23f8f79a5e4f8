//! Legacy PIO IDE driver.
//!
//! The fallback path when no AHCI port comes up. Requests queue on a
//! singly linked list of buffers; the head is the command in flight. The
//! interrupt handler completes the head, wakes its sleeper, and starts the
//! next request.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::x86::asm::{inb, insl, microdelay, outb, outsl};
use crate::arch::x86::IRQ_IDE;
use crate::config::{BSIZE, SECTORS_PER_BLOCK};
use crate::fs::bio::{self, Buf};
use crate::sched;
use crate::sync::SpinLock;

const STATUS_BSY: u8 = 0x80;
const STATUS_DRDY: u8 = 0x40;
const STATUS_DF: u8 = 0x20;
const STATUS_DRQ: u8 = 0x08;
const STATUS_ERR: u8 = 0x01;

const CMD_READ: u8 = 0x20;
const CMD_WRITE: u8 = 0x30;
const CMD_READ_MULTIPLE: u8 = 0xC4;
const CMD_WRITE_MULTIPLE: u8 = 0xC5;
const CMD_SET_MULTIPLE: u8 = 0xC6;

const IO_BASE: u16 = 0x1F0;
const IO_CONTROL: u16 = 0x3F6;

static IDE_LOCK: SpinLock = SpinLock::new("ide");
/// Head of the request queue: buffer index + 1, 0 = empty.
static QUEUE_HEAD: AtomicUsize = AtomicUsize::new(0);

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static CONTROLLER_PRESENT: AtomicBool = AtomicBool::new(false);
static HAVE_DISK1: AtomicBool = AtomicBool::new(false);

/// Whether the legacy controller answered the probe.
pub fn controller_present() -> bool {
    CONTROLLER_PRESENT.load(Ordering::Acquire)
}

/// Busy-wait until the controller is ready; with `check_err`, also fail on
/// fault/error status.
fn ide_wait(check_err: bool) -> Result<(), ()> {
    let mut timeout = 100_000;
    let mut status = 0;
    while timeout >= 0 {
        status = inb(IO_BASE + 7);
        if status == 0xFF {
            return Err(()); // floating bus, no controller
        }
        if status & (STATUS_BSY | STATUS_DRDY) == STATUS_DRDY {
            break;
        }
        microdelay(1);
        timeout -= 1;
    }
    if timeout < 0 {
        return Err(());
    }
    if check_err && status & (STATUS_DF | STATUS_ERR) != 0 {
        return Err(());
    }
    Ok(())
}

/// Wait for the data-request phase before a PIO data transfer.
fn ide_wait_drq() -> Result<(), ()> {
    loop {
        let status = inb(IO_BASE + 7);
        if status & (STATUS_BSY | STATUS_DRDY | STATUS_DRQ) == (STATUS_DRDY | STATUS_DRQ) {
            if status & (STATUS_DF | STATUS_ERR) != 0 {
                return Err(());
            }
            return Ok(());
        }
    }
}

/// Probe the controller, route its interrupt, and program multi-sector
/// transfers. Safe to call more than once; only the first call probes.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }

    if ide_wait(false).is_err() {
        log::info!("[IDE] controller not responding; skipping legacy driver");
        return;
    }
    CONTROLLER_PRESENT.store(true, Ordering::Release);

    let last_cpu = crate::sched::cpu::cpu_count() - 1;
    crate::irq::ioapic::enable_irq(IRQ_IDE, last_cpu);

    // Probe for a second disk.
    outb(IO_BASE + 6, 0xE0 | (1 << 4));
    for _ in 0..1000 {
        if inb(IO_BASE + 7) != 0 {
            HAVE_DISK1.store(true, Ordering::Release);
            break;
        }
    }
    // Back to disk 0.
    outb(IO_BASE + 6, 0xE0);

    if SECTORS_PER_BLOCK > 1 {
        if ide_wait(false).is_err() {
            log::warn!("[IDE] controller not ready for SET MULTIPLE; keeping single-sector PIO");
            return;
        }
        outb(IO_BASE + 2, SECTORS_PER_BLOCK as u8);
        outb(IO_BASE + 7, CMD_SET_MULTIPLE);
        if ide_wait(true).is_err() {
            log::warn!("[IDE] SET MULTIPLE failed");
        }
    }

    log::info!(
        "[IDE] legacy controller ready{}",
        if HAVE_DISK1.load(Ordering::Relaxed) {
            ", disk 1 present"
        } else {
            ""
        }
    );
}

/// Issue the command for the buffer at the head of the queue. Caller holds
/// the IDE lock.
fn start_request(b: &Buf) {
    let sector = b.blockno() as u32 * SECTORS_PER_BLOCK as u32;
    let read_cmd = if SECTORS_PER_BLOCK == 1 {
        CMD_READ
    } else {
        CMD_READ_MULTIPLE
    };
    let write_cmd = if SECTORS_PER_BLOCK == 1 {
        CMD_WRITE
    } else {
        CMD_WRITE_MULTIPLE
    };
    const { assert!(SECTORS_PER_BLOCK <= 7, "block size exceeds the PIO transfer limit") };

    if ide_wait(false).is_err() {
        panic!("ide: controller not ready");
    }
    outb(IO_CONTROL, 0); // generate interrupts
    outb(IO_BASE + 2, SECTORS_PER_BLOCK as u8);
    outb(IO_BASE + 3, (sector & 0xFF) as u8);
    outb(IO_BASE + 4, ((sector >> 8) & 0xFF) as u8);
    outb(IO_BASE + 5, ((sector >> 16) & 0xFF) as u8);
    outb(
        IO_BASE + 6,
        0xE0 | (((b.dev() & 1) as u8) << 4) | (((sector >> 24) & 0x0F) as u8),
    );

    if b.dirty() {
        outb(IO_BASE + 7, write_cmd);
        if ide_wait_drq().is_err() {
            log::error!("[IDE] write error before data transfer");
        }
        // SAFETY: the caller holds the buffer's sleeplock; the transfer
        // covers exactly one block.
        unsafe { outsl(IO_BASE, b.data_mut().as_ptr() as *const u32, BSIZE / 4) };
    } else {
        outb(IO_BASE + 7, read_cmd);
    }
}

/// Interrupt handler: complete the request at the head of the queue and
/// start the next one.
pub fn interrupt() {
    IDE_LOCK.acquire();

    let head = QUEUE_HEAD.load(Ordering::Relaxed);
    if head == 0 {
        IDE_LOCK.release();
        return;
    }
    let b = bio::buf_at(head - 1);
    QUEUE_HEAD.store(b.qnext.load(Ordering::Relaxed), Ordering::Relaxed);

    // Pull in the data for a completed read.
    if !b.dirty() && ide_wait(true).is_ok() {
        // SAFETY: the sleeping requester holds the buffer's sleeplock; the
        // transfer covers exactly one block.
        unsafe { insl(IO_BASE, b.data_mut().as_mut_ptr() as *mut u32, BSIZE / 4) };
    }

    b.set_clean_valid();
    sched::wakeup(b.channel());

    let next = QUEUE_HEAD.load(Ordering::Relaxed);
    if next != 0 {
        start_request(bio::buf_at(next - 1));
    }

    IDE_LOCK.release();
}

/// Queue a buffer for PIO transfer and sleep until the interrupt handler
/// completes it. The caller holds the buffer's sleeplock.
pub fn queue_rw(b: &Buf) {
    if !b.lock.holding() {
        panic!("ide queue_rw: buffer not locked");
    }
    if b.valid() && !b.dirty() {
        panic!("ide queue_rw: nothing to do");
    }
    if !controller_present() {
        panic!("ide queue_rw: no legacy IDE controller");
    }

    IDE_LOCK.acquire();

    // Append to the queue.
    b.qnext.store(0, Ordering::Relaxed);
    let index_plus_one = bio::buf_index(b) + 1;
    let mut slot = QUEUE_HEAD.load(Ordering::Relaxed);
    if slot == 0 {
        QUEUE_HEAD.store(index_plus_one, Ordering::Relaxed);
    } else {
        loop {
            let cur = bio::buf_at(slot - 1);
            let next = cur.qnext.load(Ordering::Relaxed);
            if next == 0 {
                cur.qnext.store(index_plus_one, Ordering::Relaxed);
                break;
            }
            slot = next;
        }
    }

    // Start the disk when this request is at the head.
    if QUEUE_HEAD.load(Ordering::Relaxed) == index_plus_one {
        start_request(b);
    }

    // Wait for the interrupt handler to finish it.
    while !(b.valid() && !b.dirty()) {
        sched::sleep(b.channel(), &IDE_LOCK);
    }

    IDE_LOCK.release();
}
