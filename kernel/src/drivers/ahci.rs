//! AHCI DMA engine.
//!
//! One SATA port is configured for the whole system. Transfers go through
//! command slot 0 with a single-entry PRDT; buffers that cross a page
//! boundary with less than a sector available are staged through a
//! one-sector bounce buffer. Commands are READ/WRITE DMA EXT with LBA48
//! addressing.

use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use crate::config::SECTOR_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::mm::layout::PGSIZE;
use crate::sync::SpinLock;

/// A memory-mapped 32-bit register. Reads and writes always hit memory.
#[repr(transparent)]
pub struct Reg(core::cell::UnsafeCell<u32>);

impl Reg {
    pub fn read(&self) -> u32 {
        // SAFETY: the cell maps a device register; volatile read only.
        unsafe { self.0.get().read_volatile() }
    }

    pub fn write(&self, value: u32) {
        // SAFETY: as read(); device semantics are the caller's concern.
        unsafe { self.0.get().write_volatile(value) }
    }

    pub fn update(&self, f: impl FnOnce(u32) -> u32) {
        self.write(f(self.read()));
    }
}

// SAFETY: concurrent access is serialized by the AHCI lock; the hardware
// tolerates torn observation of independent registers.
unsafe impl Sync for Reg {}

/// HBA global control: AHCI enable.
const GHC_AHCI_ENABLE: u32 = 1 << 31;

/// Device-detection values from PxSSTS.
const DET_NO_DEVICE: u8 = 0x0;
const DET_PRESENT: u8 = 0x1;
const DET_PRESENT_ACTIVE: u8 = 0x3;

/// Interface power-management values from PxSSTS.
const IPM_NOT_PRESENT: u8 = 0x0;
const IPM_ACTIVE: u8 = 0x1;
const IPM_PARTIAL: u8 = 0x2;
const IPM_SLUMBER: u8 = 0x6;

bitflags! {
    /// PxCMD bits involved in stopping/starting the command engine.
    #[derive(Debug, Clone, Copy)]
    pub struct PortCmd: u32 {
        const START        = 1 << 0;  // ST
        const FIS_RX_EN    = 1 << 4;  // FRE
        const FIS_RX_RUN   = 1 << 14; // FR
        const CMD_LIST_RUN = 1 << 15; // CR
    }
}

/// PxIS: task-file error status.
const IS_TFES: u32 = 1 << 30;

/// PxTFD status bits.
const TFD_ERR: u32 = 0x01;
const TFD_DRQ: u32 = 0x08;
const TFD_BUSY: u32 = 0x80;

const COMMAND_LIST_BYTES: usize = 1024;
const RECEIVED_FIS_BYTES: usize = 256;
const COMMAND_TABLE_ALIGN: usize = 128;

/// A PRDT entry addresses at most 4 MiB.
const PRDT_MAX_BYTES: usize = 4 * 1024 * 1024;
const MAX_SECTORS_PER_CMD: u32 = (PRDT_MAX_BYTES / SECTOR_SIZE) as u32;

/// Only command slot 0 is used.
const CMD_SLOT: u32 = 0;

/// Busy-wait iteration bound for every port handshake.
const GENERIC_TIMEOUT: u32 = 1_000_000;

/// Bytes of ABAR register space to map.
const MMIO_BYTES: u32 = 0x1100;

/// FIS type: register, host to device.
const FIS_TYPE_REG_H2D: u8 = 0x27;
const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;

// ---------------------------------------------------------------------------
// Hardware structures
// ---------------------------------------------------------------------------

/// Port register block within the HBA.
#[repr(C)]
pub struct PortRegs {
    pub clb: Reg,
    pub clbu: Reg,
    pub fb: Reg,
    pub fbu: Reg,
    pub is: Reg,
    pub ie: Reg,
    pub cmd: Reg,
    _reserved0: u32,
    pub tfd: Reg,
    pub sig: Reg,
    pub ssts: Reg,
    pub sctl: Reg,
    pub serr: Reg,
    pub sact: Reg,
    pub ci: Reg,
    pub sntf: Reg,
    pub fbs: Reg,
    _reserved1: [u32; 11],
    _vendor: [u32; 4],
}

/// HBA memory registers at ABAR.
#[repr(C)]
pub struct HbaRegs {
    pub cap: Reg,
    pub ghc: Reg,
    pub is: Reg,
    pub pi: Reg,
    pub vs: Reg,
    pub ccc_ctl: Reg,
    pub ccc_pts: Reg,
    pub em_loc: Reg,
    pub em_ctl: Reg,
    pub cap2: Reg,
    pub bohc: Reg,
    _reserved: [u8; 0xA0 - 0x2C],
    _vendor: [u8; 0x100 - 0xA0],
    pub ports: [PortRegs; 32],
}

/// Command-list entry (command header).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CommandHeader {
    pub flags: u16,
    pub prdtl: u16,
    pub prdbc: u32,
    pub ctba: u32,
    pub ctbau: u32,
    _reserved: [u32; 4],
}

/// Physical region descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PrdtEntry {
    pub dba: u32,
    pub dbau: u32,
    _reserved: u32,
    /// Byte count - 1, with bit 31 = interrupt on completion.
    pub dbc: u32,
}

/// Command table: command FIS + ATAPI command + one PRDT entry.
#[repr(C)]
pub struct CommandTable {
    pub cfis: [u8; 64],
    pub acmd: [u8; 16],
    _reserved: [u8; 48],
    pub prdt: [PrdtEntry; 1],
}

// ---------------------------------------------------------------------------
// Driver state
// ---------------------------------------------------------------------------

struct PortState {
    port: &'static PortRegs,
    command_list: *mut CommandHeader,
    command_table: *mut CommandTable,
    bounce_buffer: *mut u8,
    bounce_phys: u32,
    port_index: u8,
}

// SAFETY: the raw pointers reference MMIO registers and DMA buffers that
// are only touched under AHCI_LOCK.
unsafe impl Send for PortState {}
unsafe impl Sync for PortState {}

static AHCI_LOCK: SpinLock = SpinLock::new("ahci");
static PORT_CONFIGURED: AtomicBool = AtomicBool::new(false);
static ACTIVE_PORT: spin::Once<PortState> = spin::Once::new();

/// Whether a SATA port is configured for DMA.
pub fn port_ready() -> bool {
    PORT_CONFIGURED.load(Ordering::Acquire)
}

/// Index of the configured port, if any.
pub fn active_port_index() -> Option<u8> {
    ACTIVE_PORT.get().map(|s| s.port_index)
}

fn det_to_str(det: u8) -> &'static str {
    match det {
        DET_NO_DEVICE => "no device",
        DET_PRESENT => "device present",
        DET_PRESENT_ACTIVE => "device active",
        _ => "reserved",
    }
}

fn ipm_to_str(ipm: u8) -> &'static str {
    match ipm {
        IPM_NOT_PRESENT => "not present",
        IPM_ACTIVE => "active",
        IPM_PARTIAL => "partial",
        IPM_SLUMBER => "slumber",
        _ => "reserved",
    }
}

fn device_present(det: u8) -> bool {
    det == DET_PRESENT || det == DET_PRESENT_ACTIVE
}

/// Translate a kernel virtual address to physical through the master page
/// directory. DMA engines see physical addresses only, and heap addresses
/// are not part of the linear map, so this must walk the page tables.
fn virt_to_phys_checked(ptr: *const u8) -> Option<u32> {
    if ptr.is_null() {
        return None;
    }
    crate::mm::vm::kernel_resolve(ptr as usize).map(|pa| pa.0)
}

// ---------------------------------------------------------------------------
// Transfer chunking
// ---------------------------------------------------------------------------

/// How the next chunk of a transfer reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Sectors covered by this chunk.
    pub sectors: u32,
    /// Physical DMA target.
    pub phys: u32,
    /// Whether the chunk is staged through the bounce buffer.
    pub bounce: bool,
}

/// Work out the largest DMA chunk starting at `buffer`: the contiguous
/// span within the current page, capped by the request and the PRDT limit.
/// When the page crossing leaves less than one sector, the transfer falls
/// back to a single bounced sector.
fn calculate_chunk(
    phys: Option<u32>,
    bounce_phys: u32,
    requested_sectors: u32,
) -> Chunk {
    let phys = match phys {
        None | Some(0) => {
            return Chunk {
                sectors: 1,
                phys: bounce_phys,
                bounce: true,
            }
        }
        Some(p) => p,
    };

    let offset = (phys as usize) & (PGSIZE - 1);
    let mut contiguous = PGSIZE - offset;
    if contiguous > PRDT_MAX_BYTES {
        contiguous = PRDT_MAX_BYTES;
    }

    let requested_bytes = requested_sectors as usize * SECTOR_SIZE;

    if contiguous >= SECTOR_SIZE {
        if contiguous > requested_bytes {
            contiguous = requested_bytes;
        }
        let sectors = ((contiguous / SECTOR_SIZE) as u32)
            .max(1)
            .min(MAX_SECTORS_PER_CMD);
        return Chunk {
            sectors,
            phys,
            bounce: false,
        };
    }

    // Page crossing with less than a sector available.
    Chunk {
        sectors: 1,
        phys: bounce_phys,
        bounce: true,
    }
}

/// Fill a host-to-device command FIS for READ/WRITE DMA EXT.
fn build_dma_fis(cfis: &mut [u8; 64], lba: u64, sector_count: u32, write: bool) {
    cfis.fill(0);
    cfis[0] = FIS_TYPE_REG_H2D;
    cfis[1] = 1 << 7; // command, not control
    cfis[2] = if write {
        ATA_CMD_WRITE_DMA_EXT
    } else {
        ATA_CMD_READ_DMA_EXT
    };
    cfis[4] = (lba & 0xFF) as u8;
    cfis[5] = ((lba >> 8) & 0xFF) as u8;
    cfis[6] = ((lba >> 16) & 0xFF) as u8;
    cfis[7] = 0x40 | (((lba >> 24) & 0x0F) as u8); // LBA mode
    cfis[8] = ((lba >> 24) & 0xFF) as u8;
    cfis[9] = ((lba >> 32) & 0xFF) as u8;
    cfis[10] = ((lba >> 40) & 0xFF) as u8;
    cfis[12] = (sector_count & 0xFF) as u8;
    cfis[13] = ((sector_count >> 8) & 0xFF) as u8;
}

// ---------------------------------------------------------------------------
// Port bring-up
// ---------------------------------------------------------------------------

/// Wait for the given task-file bits to clear.
fn port_wait_tfd(port: &PortRegs, mask: u32) -> KernelResult<()> {
    let mut timeout = GENERIC_TIMEOUT;
    while port.tfd.read() & mask != 0 && timeout > 0 {
        timeout -= 1;
    }
    if timeout == 0 {
        return Err(KernelError::Io);
    }
    Ok(())
}

/// Stop the port's command engine and FIS receive, waiting for CR/FR to
/// settle.
fn port_stop(port: &PortRegs) -> KernelResult<()> {
    port.cmd.update(|v| v & !PortCmd::START.bits());
    let mut timeout = GENERIC_TIMEOUT;
    while port.cmd.read() & PortCmd::CMD_LIST_RUN.bits() != 0 && timeout > 0 {
        timeout -= 1;
    }
    if timeout == 0 {
        return Err(KernelError::Io);
    }

    port.cmd.update(|v| v & !PortCmd::FIS_RX_EN.bits());
    let mut timeout = GENERIC_TIMEOUT;
    while port.cmd.read() & PortCmd::FIS_RX_RUN.bits() != 0 && timeout > 0 {
        timeout -= 1;
    }
    if timeout == 0 {
        return Err(KernelError::Io);
    }
    Ok(())
}

fn port_start(port: &PortRegs) -> KernelResult<()> {
    let mut timeout = GENERIC_TIMEOUT;
    while port.cmd.read() & (PortCmd::CMD_LIST_RUN.bits() | PortCmd::FIS_RX_RUN.bits()) != 0
        && timeout > 0
    {
        timeout -= 1;
    }
    if timeout == 0 {
        return Err(KernelError::Io);
    }
    port.cmd.update(|v| v | PortCmd::FIS_RX_EN.bits());
    port.cmd.update(|v| v | PortCmd::START.bits());
    Ok(())
}

fn alloc_aligned(size: usize, align: usize) -> KernelResult<*mut u8> {
    use alloc::alloc::{alloc_zeroed, Layout};
    let layout = Layout::from_size_align(size, align)
        .map_err(|_| KernelError::InvalidArgument { name: "layout" })?;
    // SAFETY: layout has non-zero size.
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(KernelError::OutOfMemory);
    }
    Ok(ptr)
}

/// Configure one port for DMA: allocate the aligned command structures,
/// point CLB/FB at them, clear error/interrupt state, restart the engine.
fn configure_port(hba: *const HbaRegs, port_index: u32) -> KernelResult<()> {
    // SAFETY: hba points at mapped ABAR registers.
    let port: &'static PortRegs = unsafe { &(*hba).ports[port_index as usize] };

    if port_stop(port).is_err() {
        log::error!("[AHCI] failed to stop command engine on port {}", port_index);
        return Err(KernelError::Io);
    }

    let command_list = alloc_aligned(COMMAND_LIST_BYTES, 1024)? as *mut CommandHeader;
    let fis = alloc_aligned(RECEIVED_FIS_BYTES, 256)?;
    let command_table =
        alloc_aligned(core::mem::size_of::<CommandTable>(), COMMAND_TABLE_ALIGN)?
            as *mut CommandTable;
    let bounce_buffer = alloc_aligned(SECTOR_SIZE, SECTOR_SIZE)?;

    let clb_phys = virt_to_phys_checked(command_list as *const u8);
    let fb_phys = virt_to_phys_checked(fis);
    let ct_phys = virt_to_phys_checked(command_table as *const u8);
    let bounce_phys = virt_to_phys_checked(bounce_buffer);
    let (clb_phys, fb_phys, ct_phys, bounce_phys) = match (clb_phys, fb_phys, ct_phys, bounce_phys)
    {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => {
            log::error!("[AHCI] failed to resolve physical addresses for command buffers");
            return Err(KernelError::InvalidAddress { addr: 0 });
        }
    };

    port.clb.write(clb_phys);
    port.clbu.write(0);
    port.fb.write(fb_phys);
    port.fbu.write(0);

    // SAFETY: command_list points at the freshly allocated, zeroed list.
    unsafe {
        let header = &mut *command_list.add(CMD_SLOT as usize);
        header.ctba = ct_phys;
        header.ctbau = 0;
        header.prdtl = 1;
    }

    port.serr.write(0xFFFF_FFFF);
    port.is.write(0xFFFF_FFFF);

    if port_start(port).is_err() {
        log::error!("[AHCI] failed to start command engine on port {}", port_index);
        return Err(KernelError::Io);
    }

    ACTIVE_PORT.call_once(|| PortState {
        port,
        command_list,
        command_table,
        bounce_buffer,
        bounce_phys,
        port_index: port_index as u8,
    });
    PORT_CONFIGURED.store(true, Ordering::Release);

    log::info!("[AHCI] using port {} for DMA transfers", port_index);
    Ok(())
}

/// Probe an AHCI controller whose ABAR is at `abar_phys`. Maps the register
/// space, reports every implemented port, and configures the first port
/// with an active link.
pub fn init(abar_phys: u32) {
    if abar_phys == 0 {
        log::error!("[AHCI] controller missing ABAR; cannot continue");
        return;
    }

    let abar_va = match crate::mm::vm::kernel_map_mmio(abar_phys, MMIO_BYTES) {
        Ok(va) => va,
        Err(_) => {
            log::error!("[AHCI] failed to map ABAR {:#010x}", abar_phys);
            return;
        }
    };
    let hba = abar_va as *const HbaRegs;
    // SAFETY: hba points at the mapped ABAR register block.
    let hba_regs: &'static HbaRegs = unsafe { &*hba };

    // Make sure AHCI mode is enabled before touching anything else.
    hba_regs.ghc.update(|v| v | GHC_AHCI_ENABLE);

    let cap = hba_regs.cap.read();
    let version = hba_regs.vs.read();
    let ports_mask = hba_regs.pi.read();

    let port_count = (cap & 0x1F) + 1;
    log::info!(
        "[AHCI] ABAR={:#010x} version {}.{} cap={:#010x} ports mask={:#010x}",
        abar_phys,
        (version >> 16) & 0xFFFF,
        version & 0xFFFF,
        cap,
        ports_mask
    );

    let mut port_mask = ports_mask;
    if port_mask == 0 {
        if port_count == 0 || port_count > 32 {
            log::error!("[AHCI] invalid port count reported in CAP (NP={})", port_count);
            return;
        }
        port_mask = if port_count == 32 {
            0xFFFF_FFFF
        } else {
            (1u32 << port_count) - 1
        };
        log::error!(
            "[AHCI] controller reports empty PI; using CAP.NP derived mask={:#010x}",
            port_mask
        );
    }

    let mut device_present_found = false;
    let mut link_active_found = false;

    for i in 0..32 {
        if port_mask & (1 << i) == 0 {
            continue;
        }
        let ssts = hba_regs.ports[i as usize].ssts.read();
        let sig = hba_regs.ports[i as usize].sig.read();
        let det = (ssts & 0x0F) as u8;
        let ipm = ((ssts >> 8) & 0x0F) as u8;

        let present = device_present(det);
        let link_active = det == DET_PRESENT_ACTIVE && ipm == IPM_ACTIVE;
        device_present_found |= present;
        link_active_found |= link_active;

        log::info!(
            "[AHCI] port {}: det={}({}) ipm={}({}) sig={:#010x}{}{}",
            i,
            det_to_str(det),
            det,
            ipm_to_str(ipm),
            ipm,
            sig,
            if link_active { " [link-up]" } else { "" },
            if present && !link_active { " [present]" } else { "" }
        );

        if !port_ready() && link_active && configure_port(hba, i).is_err() {
            log::error!("[AHCI] failed to configure port {} for DMA", i);
        }
    }

    if !device_present_found {
        log::warn!("[AHCI] no SATA devices detected on implemented ports");
    } else if !link_active_found {
        log::warn!("[AHCI] SATA device presence detected but links are not active");
    }
}

// ---------------------------------------------------------------------------
// Command issue
// ---------------------------------------------------------------------------

/// Issue one DMA command for `sector_count` sectors at `lba` to/from the
/// physical buffer. Caller holds the AHCI lock.
fn issue_dma(state: &PortState, lba: u64, buffer_phys: u32, sector_count: u32, write: bool) -> KernelResult<()> {
    let port = state.port;

    port_wait_tfd(port, TFD_BUSY | TFD_DRQ)?;

    port.serr.write(0xFFFF_FFFF);
    port.is.write(0xFFFF_FFFF);

    // SAFETY: the command structures belong to this driver and the AHCI
    // lock is held.
    unsafe {
        let header = &mut *state.command_list.add(CMD_SLOT as usize);
        header.flags = 5; // CFL: FIS length in dwords (20 bytes)
        if write {
            header.flags |= 1 << 6;
        }
        header.prdtl = 1;
        header.prdbc = 0;

        let table = &mut *state.command_table;
        table.acmd.fill(0);
        let bytes = sector_count * SECTOR_SIZE as u32;
        table.prdt[0] = PrdtEntry {
            dba: buffer_phys,
            dbau: 0,
            _reserved: 0,
            dbc: (bytes - 1) | (1 << 31), // interrupt on completion
        };
        build_dma_fis(&mut table.cfis, lba, sector_count, write);
    }

    port.ci.write(1 << CMD_SLOT);

    let mut timeout = GENERIC_TIMEOUT;
    while port.ci.read() & (1 << CMD_SLOT) != 0 && timeout > 0 {
        if port.is.read() & IS_TFES != 0 {
            log::error!(
                "[AHCI] DMA taskfile error during {}: LBA={} count={} IS={:#010x} SERR={:#010x} TFD={:#010x}",
                if write { "write" } else { "read" },
                lba,
                sector_count,
                port.is.read(),
                port.serr.read(),
                port.tfd.read()
            );
            port.is.write(IS_TFES);
            return Err(KernelError::Io);
        }
        timeout -= 1;
    }

    if timeout == 0 {
        log::error!(
            "[AHCI] DMA timeout during {}: LBA={} count={} IS={:#010x} SERR={:#010x} TFD={:#010x}",
            if write { "write" } else { "read" },
            lba,
            sector_count,
            port.is.read(),
            port.serr.read(),
            port.tfd.read()
        );
        port.is.write(0xFFFF_FFFF);
        return Err(KernelError::Io);
    }

    if port.tfd.read() & TFD_ERR != 0 {
        log::error!(
            "[AHCI] DMA taskfile status error during {}: LBA={} count={} IS={:#010x} SERR={:#010x} TFD={:#010x}",
            if write { "write" } else { "read" },
            lba,
            sector_count,
            port.is.read(),
            port.serr.read(),
            port.tfd.read()
        );
        port.is.write(0xFFFF_FFFF);
        return Err(KernelError::Io);
    }

    Ok(())
}

/// Read `sector_count` sectors starting at `lba` into `buffer`.
pub fn read(lba: u64, sector_count: u32, buffer: &mut [u8]) -> KernelResult<()> {
    if sector_count == 0 || buffer.len() < sector_count as usize * SECTOR_SIZE {
        return Err(KernelError::InvalidArgument { name: "buffer" });
    }
    if !port_ready() {
        return Err(KernelError::NotSupported);
    }
    let state = ACTIVE_PORT.get().expect("port marked ready but absent");

    AHCI_LOCK.acquire();
    let mut lba = lba;
    let mut cursor = 0usize;
    let mut remaining = sector_count;
    let mut result = Ok(());

    while remaining > 0 {
        let phys = virt_to_phys_checked(buffer[cursor..].as_ptr());
        let chunk = calculate_chunk(phys, state.bounce_phys, remaining);

        result = issue_dma(state, lba, chunk.phys, chunk.sectors, false);
        if result.is_err() {
            break;
        }

        if chunk.bounce {
            // SAFETY: the bounce buffer is one sector, owned by the driver,
            // and the AHCI lock is held.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    state.bounce_buffer,
                    buffer[cursor..].as_mut_ptr(),
                    SECTOR_SIZE,
                );
            }
        }

        lba += chunk.sectors as u64;
        cursor += chunk.sectors as usize * SECTOR_SIZE;
        remaining -= chunk.sectors;
    }

    AHCI_LOCK.release();
    result
}

/// Write `sector_count` sectors starting at `lba` from `buffer`.
pub fn write(lba: u64, sector_count: u32, buffer: &[u8]) -> KernelResult<()> {
    if sector_count == 0 || buffer.len() < sector_count as usize * SECTOR_SIZE {
        return Err(KernelError::InvalidArgument { name: "buffer" });
    }
    if !port_ready() {
        return Err(KernelError::NotSupported);
    }
    let state = ACTIVE_PORT.get().expect("port marked ready but absent");

    AHCI_LOCK.acquire();
    let mut lba = lba;
    let mut cursor = 0usize;
    let mut remaining = sector_count;
    let mut result = Ok(());

    while remaining > 0 {
        let phys = virt_to_phys_checked(buffer[cursor..].as_ptr());
        let chunk = calculate_chunk(phys, state.bounce_phys, remaining);

        if chunk.bounce {
            // SAFETY: as in read; the source sector is staged first.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    buffer[cursor..].as_ptr(),
                    state.bounce_buffer,
                    SECTOR_SIZE,
                );
            }
        }

        result = issue_dma(state, lba, chunk.phys, chunk.sectors, true);
        if result.is_err() {
            break;
        }

        lba += chunk.sectors as u64;
        cursor += chunk.sectors as usize * SECTOR_SIZE;
        remaining -= chunk.sectors;
    }

    AHCI_LOCK.release();
    result
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    const BOUNCE: u32 = 0x9000;

    #[test]
    fn chunk_spans_rest_of_page_for_aligned_buffers() {
        // 4 KiB-aligned buffer, 16 sectors requested: one page = 8 sectors.
        let c = calculate_chunk(Some(0x10000), BOUNCE, 16);
        assert_eq!(c.sectors, 8);
        assert_eq!(c.phys, 0x10000);
        assert!(!c.bounce);
    }

    #[test]
    fn chunk_is_capped_by_the_request() {
        let c = calculate_chunk(Some(0x10000), BOUNCE, 2);
        assert_eq!(c.sectors, 2, "never transfer more than requested");
        assert!(!c.bounce);
    }

    #[test]
    fn chunk_uses_partial_page_when_a_sector_fits() {
        // 1 KiB left in the page: two sectors fit.
        let c = calculate_chunk(Some(0x10C00), BOUNCE, 8);
        assert_eq!(c.sectors, 2);
        assert!(!c.bounce);
    }

    #[test]
    fn page_crossing_with_less_than_a_sector_bounces() {
        // 256 bytes left before the page boundary.
        let c = calculate_chunk(Some(0x10F00), BOUNCE, 8);
        assert_eq!(c.sectors, 1);
        assert_eq!(c.phys, BOUNCE);
        assert!(c.bounce, "sub-sector page remainder must use the bounce buffer");
    }

    #[test]
    fn unmapped_buffer_bounces() {
        let c = calculate_chunk(None, BOUNCE, 4);
        assert!(c.bounce);
        assert_eq!(c.sectors, 1);
    }

    #[test]
    fn dma_fis_encodes_lba48_and_count() {
        let mut cfis = [0u8; 64];
        let lba = 0x0000_00AB_CDEF_1234u64;
        build_dma_fis(&mut cfis, lba, 0x0180, true);

        assert_eq!(cfis[0], FIS_TYPE_REG_H2D);
        assert_eq!(cfis[1], 0x80, "command bit set");
        assert_eq!(cfis[2], ATA_CMD_WRITE_DMA_EXT);
        assert_eq!(cfis[4], 0x34);
        assert_eq!(cfis[5], 0x12);
        assert_eq!(cfis[6], 0xEF);
        assert_eq!(cfis[7], 0x40 | 0x0D, "LBA mode + bits 24-27");
        assert_eq!(cfis[8], 0xCD);
        assert_eq!(cfis[9], 0xAB);
        assert_eq!(cfis[10], 0x00);
        assert_eq!(cfis[12], 0x80);
        assert_eq!(cfis[13], 0x01);

        build_dma_fis(&mut cfis, 0, 1, false);
        assert_eq!(cfis[2], ATA_CMD_READ_DMA_EXT);
        assert_eq!(cfis[12], 1);
    }

    #[test]
    fn io_on_an_unconfigured_controller_is_not_supported() {
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(matches!(
            read(0, 1, &mut buf),
            Err(KernelError::NotSupported)
        ));
        assert!(matches!(write(0, 1, &buf), Err(KernelError::NotSupported)));
    }

    #[test]
    fn zero_sector_requests_are_invalid() {
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(matches!(
            read(0, 0, &mut buf),
            Err(KernelError::InvalidArgument { .. })
        ));
        let small = [0u8; 16];
        assert!(matches!(
            write(0, 1, &small),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn hardware_struct_layouts() {
        assert_eq!(core::mem::size_of::<CommandHeader>(), 32);
        assert_eq!(core::mem::size_of::<PrdtEntry>(), 16);
        assert_eq!(core::mem::size_of::<CommandTable>(), 64 + 16 + 48 + 16);
        assert_eq!(core::mem::size_of::<PortRegs>(), 0x80);
        assert_eq!(core::mem::offset_of!(HbaRegs, ports), 0x100);
    }
}
