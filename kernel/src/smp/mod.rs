//! SMP discovery.
//!
//! Finds the CPUs and interrupt controllers. ACPI is authoritative: locate
//! the RSDP, walk the RSDT (or XSDT), and parse the MADT. When ACPI is
//! absent or reports at most one CPU, fall back to the legacy MP Floating
//! Pointer structure. Zero CPUs after both attempts is fatal.
//!
//! Parsing works on kernel-visible addresses handed in by a mapper
//! callback, so the walkers run against firmware tables on bare metal and
//! against in-memory images under test.

use core::sync::atomic::Ordering;

use crate::config::NCPU;
#[cfg(target_os = "none")]
use crate::mm::layout::{self, PhysAddr};

/// Where the CPU list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpSource {
    None,
    Acpi,
    Legacy,
    AcpiAndLegacy,
}

/// Everything discovery learns about the platform.
#[derive(Debug)]
pub struct Discovery {
    pub apic_ids: [u32; NCPU],
    pub cpu_count: usize,
    pub lapic_phys: Option<u32>,
    pub ioapic_id: u8,
    pub source: MpSource,
    pub acpi_cpus: usize,
    pub legacy_cpus: usize,
    // ACPI footprint, for the boot report.
    pub rsdp_phys: u32,
    pub rsdp_revision: u8,
    pub rsdt_length: u32,
    pub xsdt_length: u32,
    pub madt_found: bool,
}

impl Discovery {
    pub const fn new() -> Self {
        Self {
            apic_ids: [0; NCPU],
            cpu_count: 0,
            lapic_phys: None,
            ioapic_id: 0,
            source: MpSource::None,
            acpi_cpus: 0,
            legacy_cpus: 0,
            rsdp_phys: 0,
            rsdp_revision: 0,
            rsdt_length: 0,
            xsdt_length: 0,
            madt_found: false,
        }
    }

    /// Record an APIC id, ignoring duplicates and overflow.
    fn record_cpu(&mut self, apic_id: u32, legacy: bool) {
        for id in self.apic_ids.iter().take(self.cpu_count) {
            if *id == apic_id {
                return;
            }
        }
        if self.cpu_count >= NCPU {
            return;
        }
        self.apic_ids[self.cpu_count] = apic_id;
        self.cpu_count += 1;
        if legacy {
            self.legacy_cpus += 1;
        } else {
            self.acpi_cpus += 1;
        }
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps `(phys, len)` to a kernel-visible address, or fails.
pub type TableMapper<'a> = &'a dyn Fn(u32, u32) -> Option<usize>;

fn checksum(addr: usize, len: usize) -> u8 {
    let mut sum = 0u8;
    for i in 0..len {
        // SAFETY: the caller established addr..addr+len is readable.
        sum = sum.wrapping_add(unsafe { ((addr + i) as *const u8).read() });
    }
    sum
}

// ---------------------------------------------------------------------------
// ACPI structures
// ---------------------------------------------------------------------------

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_addr: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct Rsdp2 {
    base: Rsdp,
    length: u32,
    xsdt_addr: u64,
    extended_checksum: u8,
    _reserved: [u8; 3],
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MadtHeader {
    sdt: SdtHeader,
    lapic_addr: u32,
    flags: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MadtEntryHeader {
    entry_type: u8,
    length: u8,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MadtLapicEntry {
    header: MadtEntryHeader,
    acpi_processor_id: u8,
    apic_id: u8,
    flags: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MadtIoApicEntry {
    header: MadtEntryHeader,
    ioapic_id: u8,
    _reserved: u8,
    ioapic_addr: u32,
    gsi_base: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MadtLapicOverrideEntry {
    header: MadtEntryHeader,
    _reserved: u16,
    lapic_addr: u64,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MadtX2ApicEntry {
    header: MadtEntryHeader,
    _reserved: u16,
    x2apic_id: u32,
    flags: u32,
    acpi_processor_uid: u32,
}

const MADT_ENTRY_LAPIC: u8 = 0;
const MADT_ENTRY_IOAPIC: u8 = 1;
const MADT_ENTRY_LAPIC_OVERRIDE: u8 = 5;
const MADT_ENTRY_X2APIC: u8 = 9;

/// Validated RSDP contents.
#[derive(Debug, Clone, Copy)]
pub struct RsdpInfo {
    pub phys: u32,
    pub revision: u8,
    pub rsdt_addr: u32,
    pub xsdt_addr: u64,
}

/// Scan `len` bytes at kernel address `vaddr` (physical base `phys`) for a
/// valid RSDP on 16-byte boundaries.
pub fn scan_for_rsdp(vaddr: usize, phys: u32, len: usize) -> Option<RsdpInfo> {
    let mut offset = 0;
    while offset + core::mem::size_of::<Rsdp>() <= len {
        let p = vaddr + offset;
        // SAFETY: p stays within the caller-provided window.
        let sig_ok =
            unsafe { core::slice::from_raw_parts(p as *const u8, 8) } == &RSDP_SIGNATURE[..];
        if sig_ok {
            // SAFETY: packed read within the window.
            let rsdp = unsafe { core::ptr::read_unaligned(p as *const Rsdp) };
            let mut check_len = core::mem::size_of::<Rsdp>();
            if rsdp.revision >= 2 && offset + core::mem::size_of::<Rsdp2>() <= len {
                // SAFETY: as above.
                let rsdp2 = unsafe { core::ptr::read_unaligned(p as *const Rsdp2) };
                if rsdp2.length as usize >= core::mem::size_of::<Rsdp>() {
                    check_len = rsdp2.length as usize;
                }
            }
            if offset + check_len <= len && checksum(p, check_len) == 0 {
                let xsdt_addr = if rsdp.revision >= 2 {
                    // SAFETY: as above.
                    let rsdp2 = unsafe { core::ptr::read_unaligned(p as *const Rsdp2) };
                    rsdp2.xsdt_addr
                } else {
                    0
                };
                return Some(RsdpInfo {
                    phys: phys + offset as u32,
                    revision: rsdp.revision,
                    rsdt_addr: rsdp.rsdt_addr,
                    xsdt_addr,
                });
            }
        }
        offset += 16;
    }
    None
}

/// Parse a MADT at `vaddr`, recording CPUs and controller addresses.
/// Returns true when at least one CPU was found.
pub fn parse_madt(vaddr: usize, disco: &mut Discovery) -> bool {
    // SAFETY: the caller mapped the full table.
    let madt = unsafe { core::ptr::read_unaligned(vaddr as *const MadtHeader) };
    let table_len = madt.sdt.length as usize;
    if table_len < core::mem::size_of::<MadtHeader>() {
        return false;
    }

    disco.madt_found = true;
    disco.lapic_phys = Some(madt.lapic_addr);
    log::info!(
        "[ACPI] parsing MADT lapic={:#010x} flags={:#x} length={}",
        { madt.lapic_addr },
        { madt.flags },
        table_len
    );

    let mut offset = core::mem::size_of::<MadtHeader>();
    while offset + core::mem::size_of::<MadtEntryHeader>() <= table_len {
        let entry_addr = vaddr + offset;
        // SAFETY: offset stays within the table bounds.
        let header = unsafe { core::ptr::read_unaligned(entry_addr as *const MadtEntryHeader) };
        let entry_len = header.length as usize;
        if entry_len < core::mem::size_of::<MadtEntryHeader>() || offset + entry_len > table_len {
            break;
        }

        match header.entry_type {
            MADT_ENTRY_LAPIC if entry_len >= core::mem::size_of::<MadtLapicEntry>() => {
                // SAFETY: length checked.
                let e = unsafe { core::ptr::read_unaligned(entry_addr as *const MadtLapicEntry) };
                if e.flags & 0x01 != 0 {
                    log::info!(
                        "[ACPI] MADT LAPIC id={} flags={:#x}",
                        e.apic_id,
                        { e.flags }
                    );
                    disco.record_cpu(e.apic_id as u32, false);
                }
            }
            MADT_ENTRY_IOAPIC if entry_len >= core::mem::size_of::<MadtIoApicEntry>() => {
                // SAFETY: length checked.
                let e = unsafe { core::ptr::read_unaligned(entry_addr as *const MadtIoApicEntry) };
                disco.ioapic_id = e.ioapic_id;
            }
            MADT_ENTRY_LAPIC_OVERRIDE
                if entry_len >= core::mem::size_of::<MadtLapicOverrideEntry>() =>
            {
                // SAFETY: length checked.
                let e = unsafe {
                    core::ptr::read_unaligned(entry_addr as *const MadtLapicOverrideEntry)
                };
                disco.lapic_phys = Some(e.lapic_addr as u32);
            }
            MADT_ENTRY_X2APIC if entry_len >= core::mem::size_of::<MadtX2ApicEntry>() => {
                // SAFETY: length checked.
                let e = unsafe { core::ptr::read_unaligned(entry_addr as *const MadtX2ApicEntry) };
                if e.flags & 0x01 != 0 {
                    disco.record_cpu(e.x2apic_id, false);
                }
            }
            _ => {}
        }

        offset += entry_len;
    }

    disco.cpu_count > 0 && disco.lapic_phys.is_some()
}

/// Walk an RSDT/XSDT at `vaddr` with `entry_size`-byte child pointers,
/// mapping each child and parsing any MADT found. Returns true once a MADT
/// produced CPUs.
pub fn visit_sdt(
    vaddr: usize,
    entry_size: usize,
    disco: &mut Discovery,
    mapper: TableMapper,
) -> bool {
    // SAFETY: the caller mapped at least the header.
    let sdt = unsafe { core::ptr::read_unaligned(vaddr as *const SdtHeader) };
    let len = sdt.length as usize;
    if len < core::mem::size_of::<SdtHeader>() {
        return false;
    }
    if checksum(vaddr, len) != 0 {
        return false;
    }

    let header_size = core::mem::size_of::<SdtHeader>();
    let count = (len - header_size) / entry_size;

    for i in 0..count {
        let entry_addr = vaddr + header_size + i * entry_size;
        let child_phys = if entry_size == 8 {
            // SAFETY: within the table per count calculation.
            let raw = unsafe { core::ptr::read_unaligned(entry_addr as *const u64) };
            if raw == 0 {
                continue;
            }
            if raw >> 32 != 0 {
                log::warn!("[ACPI] ignoring 64-bit table above 4GiB ({:#x})", raw);
                continue;
            }
            raw as u32
        } else {
            // SAFETY: as above.
            let raw = unsafe { core::ptr::read_unaligned(entry_addr as *const u32) };
            if raw == 0 {
                continue;
            }
            raw
        };

        let child_vaddr = match map_table(child_phys, mapper) {
            Some(va) => va,
            None => continue,
        };

        // SAFETY: map_table mapped the full child table.
        let child = unsafe { core::ptr::read_unaligned(child_vaddr as *const SdtHeader) };
        let signature = child.signature;
        let length = child.length;
        log::info!(
            "[ACPI] found table {} at {:#010x} length {}",
            core::str::from_utf8(&signature).unwrap_or("????"),
            child_phys,
            length
        );

        if signature == *b"APIC" {
            if checksum(child_vaddr, length as usize) != 0 {
                log::warn!("[ACPI] MADT checksum mismatch");
                continue;
            }
            if parse_madt(child_vaddr, disco) {
                return true;
            }
        }
    }
    false
}

/// Map a table: header first to learn the length, then the whole body.
fn map_table(phys: u32, mapper: TableMapper) -> Option<usize> {
    let header_va = mapper(phys, core::mem::size_of::<SdtHeader>() as u32)?;
    // SAFETY: mapper returned a mapping covering the header.
    let header = unsafe { core::ptr::read_unaligned(header_va as *const SdtHeader) };
    let full = mapper(phys, header.length);
    if full.is_none() {
        log::warn!(
            "[ACPI] failed to map table body at {:#010x} length={}",
            phys,
            { header.length }
        );
    }
    full
}

// ---------------------------------------------------------------------------
// Legacy MP tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MpFloatingPointer {
    signature: [u8; 4], // "_MP_"
    physaddr: u32,
    length: u8,
    spec_rev: u8,
    checksum: u8,
    mp_type: u8,
    imcrp: u8,
    _reserved: [u8; 3],
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MpConfigHeader {
    signature: [u8; 4], // "PCMP"
    length: u16,
    version: u8,
    checksum: u8,
    product: [u8; 20],
    oem_table: u32,
    oem_length: u16,
    entry_count: u16,
    lapic_addr: u32,
    xlength: u16,
    xchecksum: u8,
    _reserved: u8,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MpProcessorEntry {
    entry_type: u8, // 0
    apic_id: u8,
    version: u8,
    flags: u8,
    signature: [u8; 4],
    feature: u32,
    _reserved: [u32; 2],
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MpIoApicEntry {
    entry_type: u8, // 2
    apic_no: u8,
    version: u8,
    flags: u8,
    addr: u32,
}

const MP_ENTRY_PROCESSOR: u8 = 0;
const MP_ENTRY_BUS: u8 = 1;
const MP_ENTRY_IOAPIC: u8 = 2;
const MP_ENTRY_IOINTR: u8 = 3;
const MP_ENTRY_LINTR: u8 = 4;

/// Scan for the `_MP_` floating pointer in `len` bytes at `vaddr`.
pub fn scan_for_mp(vaddr: usize, len: usize) -> Option<usize> {
    let step = core::mem::size_of::<MpFloatingPointer>();
    let mut offset = 0;
    while offset + step <= len {
        let p = vaddr + offset;
        // SAFETY: within the caller-provided window.
        let sig = unsafe { core::slice::from_raw_parts(p as *const u8, 4) };
        if sig == &b"_MP_"[..] && checksum(p, step) == 0 {
            return Some(p);
        }
        offset += step;
    }
    None
}

/// Parse an MP configuration table at `vaddr` (already mapped). Returns
/// true when at least one processor was recorded.
pub fn parse_mp_config(vaddr: usize, disco: &mut Discovery) -> bool {
    // SAFETY: the caller mapped the table.
    let conf = unsafe { core::ptr::read_unaligned(vaddr as *const MpConfigHeader) };
    let signature = conf.signature;
    if signature != *b"PCMP" {
        return false;
    }
    if conf.version != 1 && conf.version != 4 {
        return false;
    }
    if checksum(vaddr, conf.length as usize) != 0 {
        return false;
    }

    log::info!(
        "[MP] config table at {:#x} version {} entries {}",
        vaddr,
        conf.version,
        { conf.entry_count }
    );

    if disco.lapic_phys.is_none() {
        disco.lapic_phys = Some(conf.lapic_addr);
    }

    let end = vaddr + conf.length as usize;
    let mut p = vaddr + core::mem::size_of::<MpConfigHeader>();
    while p < end {
        // SAFETY: p stays below end; every entry begins with its type byte.
        let entry_type = unsafe { (p as *const u8).read() };
        match entry_type {
            MP_ENTRY_PROCESSOR => {
                // SAFETY: processor entries are 20 bytes.
                let e = unsafe { core::ptr::read_unaligned(p as *const MpProcessorEntry) };
                log::info!("[MP] PROC apicid={} flags={:#x}", e.apic_id, e.flags);
                if e.flags & 0x01 != 0 {
                    // enabled
                    disco.record_cpu(e.apic_id as u32, true);
                }
                p += core::mem::size_of::<MpProcessorEntry>();
            }
            MP_ENTRY_IOAPIC => {
                // SAFETY: I/O APIC entries are 8 bytes.
                let e = unsafe { core::ptr::read_unaligned(p as *const MpIoApicEntry) };
                disco.ioapic_id = e.apic_no;
                p += core::mem::size_of::<MpIoApicEntry>();
            }
            MP_ENTRY_BUS | MP_ENTRY_IOINTR | MP_ENTRY_LINTR => {
                p += 8;
            }
            _ => return false,
        }
    }

    disco.legacy_cpus > 0
}

// ---------------------------------------------------------------------------
// Bare-metal discovery driver
// ---------------------------------------------------------------------------

/// Map an ACPI physical range: through the linear map when it fits, as an
/// MMIO mapping otherwise.
#[cfg(target_os = "none")]
fn acpi_map_range(phys: u32, length: u32) -> Option<usize> {
    if length == 0 {
        return None;
    }
    let end = phys as u64 + length as u64;
    if end <= layout::phys_mem_top() as u64 {
        return Some(layout::phys_to_virt(PhysAddr(phys)) as usize);
    }
    crate::mm::vm::kernel_map_mmio(phys, length).ok()
}

#[cfg(target_os = "none")]
fn find_rsdp(config_table_hint: u32) -> Option<RsdpInfo> {
    let bda = layout::phys_to_virt(PhysAddr(0x400));
    // SAFETY: the BIOS data area is inside the linear map.
    let (ebda_segment, base_mem_kb) = unsafe {
        let ebda = ((bda.add(0x0F).read() as u32) << 8) | bda.add(0x0E).read() as u32;
        let base = ((bda.add(0x14).read() as u32) << 8) | bda.add(0x13).read() as u32;
        (ebda, base)
    };

    if ebda_segment != 0 {
        let phys = ebda_segment << 4;
        log::info!("[ACPI] scanning EBDA at {:#x}", phys);
        let va = layout::phys_to_virt(PhysAddr(phys)) as usize;
        if let Some(info) = scan_for_rsdp(va, phys, 1024) {
            return Some(info);
        }
    }

    if base_mem_kb >= 1024 {
        let phys = base_mem_kb * 1024 - 1024;
        log::info!("[ACPI] scanning top of base memory at {:#x}", phys);
        let va = layout::phys_to_virt(PhysAddr(phys)) as usize;
        if let Some(info) = scan_for_rsdp(va, phys, 1024) {
            return Some(info);
        }
    }

    // Bootloader-provided configuration table, as a last resort before the
    // ROM scan.
    if config_table_hint != 0 {
        let va = layout::phys_to_virt(PhysAddr(config_table_hint)) as usize;
        if let Some(info) = scan_for_rsdp(va, config_table_hint, 64) {
            return Some(info);
        }
        log::warn!(
            "[ACPI] config table pointer {:#x} did not look like an RSDP",
            config_table_hint
        );
    }

    log::info!("[ACPI] scanning BIOS ROM 0xE0000-0xFFFFF");
    let va = layout::phys_to_virt(PhysAddr(0xE0000)) as usize;
    scan_for_rsdp(va, 0xE0000, 0x20000)
}

/// Run the ACPI side of discovery. Returns true when a MADT yielded CPUs.
#[cfg(target_os = "none")]
fn acpi_init(disco: &mut Discovery, config_table_hint: u32) -> bool {
    let rsdp = match find_rsdp(config_table_hint) {
        Some(rsdp) => rsdp,
        None => {
            log::warn!("[ACPI] RSDP not found");
            return false;
        }
    };
    disco.rsdp_phys = rsdp.phys;
    disco.rsdp_revision = rsdp.revision;
    log::info!(
        "[ACPI] RSDP at {:#x} revision {} rsdt={:#x} xsdt={:#x}",
        rsdp.phys,
        rsdp.revision,
        rsdp.rsdt_addr,
        rsdp.xsdt_addr
    );

    let mapper: TableMapper = &acpi_map_range;

    if rsdp.rsdt_addr != 0 {
        if let Some(rsdt_va) = map_table(rsdp.rsdt_addr, mapper) {
            // SAFETY: map_table mapped the header.
            let sdt = unsafe { core::ptr::read_unaligned(rsdt_va as *const SdtHeader) };
            let signature = sdt.signature;
            if signature == *b"RSDT" {
                disco.rsdt_length = sdt.length;
                if visit_sdt(rsdt_va, 4, disco, mapper) {
                    return true;
                }
            }
        } else {
            log::warn!("[ACPI] failed to map RSDT at {:#x}", rsdp.rsdt_addr);
        }
    }

    // XSDT only when the revision supports it and the pointer fits below
    // 4 GiB.
    if rsdp.revision >= 2 && rsdp.xsdt_addr != 0 && rsdp.xsdt_addr >> 32 == 0 {
        let xsdt_phys = rsdp.xsdt_addr as u32;
        if let Some(xsdt_va) = map_table(xsdt_phys, mapper) {
            // SAFETY: map_table mapped the header.
            let sdt = unsafe { core::ptr::read_unaligned(xsdt_va as *const SdtHeader) };
            let signature = sdt.signature;
            if signature == *b"XSDT" {
                disco.xsdt_length = sdt.length;
                if visit_sdt(xsdt_va, 8, disco, mapper) {
                    return true;
                }
            }
        } else {
            log::warn!("[ACPI] failed to map XSDT at {:#x}", xsdt_phys);
        }
    }

    false
}

/// Legacy MP fallback: scan EBDA, top of base memory, then the BIOS ROM.
#[cfg(target_os = "none")]
fn legacy_init(disco: &mut Discovery) -> bool {
    let bda = layout::phys_to_virt(PhysAddr(0x400));
    // SAFETY: the BIOS data area is inside the linear map.
    let (ebda_segment, base_mem_kb) = unsafe {
        let ebda = ((bda.add(0x0F).read() as u32) << 8) | bda.add(0x0E).read() as u32;
        let base = ((bda.add(0x14).read() as u32) << 8) | bda.add(0x13).read() as u32;
        (ebda, base)
    };

    let fp = if ebda_segment != 0 {
        let va = layout::phys_to_virt(PhysAddr(ebda_segment << 4)) as usize;
        scan_for_mp(va, 1024)
    } else {
        let phys = base_mem_kb * 1024 - 1024;
        let va = layout::phys_to_virt(PhysAddr(phys)) as usize;
        scan_for_mp(va, 1024)
    }
    .or_else(|| {
        let va = layout::phys_to_virt(PhysAddr(0xF0000)) as usize;
        scan_for_mp(va, 0x10000)
    });

    let fp_addr = match fp {
        Some(addr) => addr,
        None => return false,
    };
    // SAFETY: scan_for_mp validated the structure.
    let fp = unsafe { core::ptr::read_unaligned(fp_addr as *const MpFloatingPointer) };
    if fp.physaddr == 0 {
        return false;
    }

    let conf_va = layout::phys_to_virt(PhysAddr(fp.physaddr)) as usize;
    let found = parse_mp_config(conf_va, disco);

    if found && fp.imcrp != 0 {
        // Switch the IMCR to APIC pass-through mode.
        use crate::arch::x86::asm::{inb, outb};
        outb(0x22, 0x70);
        outb(0x23, inb(0x23) | 1);
    }

    found
}

/// Full discovery: ACPI first, legacy MP fallback, publish the results.
/// Panics with zero CPUs.
#[cfg(target_os = "none")]
pub fn init(config_table_hint: u32) {
    let mut disco = Discovery::new();

    let acpi_ok = acpi_init(&mut disco, config_table_hint);
    let mut legacy_ok = false;

    if !acpi_ok || disco.cpu_count <= 1 {
        if !acpi_ok {
            log::warn!("[MP] ACPI discovery failed, falling back to legacy MP tables");
        } else {
            log::warn!(
                "[MP] ACPI reported only {} CPU(s); attempting legacy MP tables",
                disco.cpu_count
            );
        }
        legacy_ok = legacy_init(&mut disco);
    }

    if disco.cpu_count == 0 {
        panic!("failed to initialize multiprocessor support");
    }

    disco.source = match (acpi_ok, legacy_ok) {
        (true, true) => MpSource::AcpiAndLegacy,
        (true, false) => MpSource::Acpi,
        (false, true) => MpSource::Legacy,
        (false, false) => MpSource::None,
    };

    publish(&disco);
    report(&disco);
}

/// Publish discovery results: CPU records, LAPIC mapping, expected I/O
/// APIC id.
pub fn publish(disco: &Discovery) {
    for &apic_id in disco.apic_ids.iter().take(disco.cpu_count) {
        crate::sched::cpu::record_cpu(apic_id);
    }
    if let Some(lapic_phys) = disco.lapic_phys {
        crate::irq::lapic::set_base(lapic_phys);
    }
    crate::irq::ioapic::EXPECTED_ID.store(disco.ioapic_id as u32, Ordering::Release);
}

/// Boot report: how many CPUs, found where.
pub fn report(disco: &Discovery) {
    let source = match disco.source {
        MpSource::Acpi => "ACPI",
        MpSource::Legacy => "legacy MP",
        MpSource::AcpiAndLegacy => "ACPI + legacy MP",
        MpSource::None => "unknown",
    };
    log::info!("[MP] detected {} CPU(s) via {}", disco.cpu_count, source);
    if disco.rsdp_phys != 0 {
        log::info!(
            "[MP] ACPI RSDP rev {} at {:#x}",
            disco.rsdp_revision,
            disco.rsdp_phys
        );
    } else {
        log::warn!("[MP] ACPI RSDP not located via standard scan");
    }
    if disco.acpi_cpus > 0 {
        log::info!("[MP] ACPI enumerated {} CPU(s)", disco.acpi_cpus);
    } else if disco.rsdp_phys != 0 {
        log::warn!("[MP] ACPI did not enumerate any CPUs");
    }
    if disco.legacy_cpus > 0 {
        log::info!("[MP] legacy MP enumerated {} CPU(s)", disco.legacy_cpus);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn fix_checksum(bytes: &mut [u8], at: usize) {
        bytes[at] = 0;
        let sum: u8 = bytes.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        bytes[at] = 0u8.wrapping_sub(sum);
    }

    /// Build a MADT with the given entries appended after the header.
    fn build_madt(lapic_addr: u32, entries: &[u8]) -> Vec<u8> {
        let mut t = Vec::new();
        t.extend_from_slice(b"APIC"); // signature
        let total = 44 + entries.len() as u32;
        t.extend_from_slice(&total.to_le_bytes()); // length
        t.push(3); // revision
        t.push(0); // checksum placeholder
        t.extend_from_slice(b"FERAIT"); // oem id
        t.extend_from_slice(b"FERRITE "); // oem table id
        t.extend_from_slice(&1u32.to_le_bytes());
        t.extend_from_slice(b"FRRT");
        t.extend_from_slice(&1u32.to_le_bytes());
        t.extend_from_slice(&lapic_addr.to_le_bytes());
        t.extend_from_slice(&1u32.to_le_bytes()); // flags: PCAT_COMPAT
        t.extend_from_slice(entries);
        fix_checksum(&mut t, 9);
        t
    }

    fn lapic_entry(proc_id: u8, apic_id: u8, flags: u32) -> Vec<u8> {
        let mut e = std::vec![0u8, 8, proc_id, apic_id];
        e.extend_from_slice(&flags.to_le_bytes());
        e
    }

    fn ioapic_entry(id: u8, addr: u32, gsi: u32) -> Vec<u8> {
        let mut e = std::vec![1u8, 12, id, 0];
        e.extend_from_slice(&addr.to_le_bytes());
        e.extend_from_slice(&gsi.to_le_bytes());
        e
    }

    fn override_entry(addr: u64) -> Vec<u8> {
        let mut e = std::vec![5u8, 12, 0, 0];
        e.extend_from_slice(&addr.to_le_bytes());
        e
    }

    #[test]
    fn madt_records_enabled_cpus_and_ioapic() {
        let mut entries = Vec::new();
        entries.extend(lapic_entry(0, 0, 1));
        entries.extend(lapic_entry(1, 1, 1));
        entries.extend(lapic_entry(2, 2, 0)); // disabled
        entries.extend(lapic_entry(3, 1, 1)); // duplicate id
        entries.extend(ioapic_entry(9, 0xFEC0_0000, 0));
        let madt = build_madt(0xFEE0_0000, &entries);

        let mut disco = Discovery::new();
        assert!(parse_madt(madt.as_ptr() as usize, &mut disco));
        assert_eq!(disco.cpu_count, 2, "only enabled, unique CPUs count");
        assert_eq!(&disco.apic_ids[..2], &[0, 1]);
        assert_eq!(disco.ioapic_id, 9);
        assert_eq!(disco.lapic_phys, Some(0xFEE0_0000));
    }

    #[test]
    fn madt_lapic_override_wins() {
        let mut entries = Vec::new();
        entries.extend(lapic_entry(0, 0, 1));
        entries.extend(override_entry(0xFEE0_1000));
        let madt = build_madt(0xFEE0_0000, &entries);

        let mut disco = Discovery::new();
        assert!(parse_madt(madt.as_ptr() as usize, &mut disco));
        assert_eq!(disco.lapic_phys, Some(0xFEE0_1000));
    }

    #[test]
    fn x2apic_entries_are_recorded() {
        let mut entries = Vec::new();
        let mut e = std::vec![9u8, 16, 0, 0];
        e.extend_from_slice(&7u32.to_le_bytes()); // x2apic id
        e.extend_from_slice(&1u32.to_le_bytes()); // enabled
        e.extend_from_slice(&7u32.to_le_bytes()); // uid
        entries.extend(e);
        let madt = build_madt(0xFEE0_0000, &entries);

        let mut disco = Discovery::new();
        assert!(parse_madt(madt.as_ptr() as usize, &mut disco));
        assert_eq!(disco.cpu_count, 1);
        assert_eq!(disco.apic_ids[0], 7);
    }

    #[test]
    fn rsdp_scan_validates_signature_and_checksum() {
        let mut area = std::vec![0u8; 512];
        // Place an RSDP at offset 64 (16-aligned).
        area[64..72].copy_from_slice(b"RSD PTR ");
        area[72] = 0; // checksum placeholder
        area[73..79].copy_from_slice(b"FERAIT");
        area[79] = 0; // revision 0
        area[80..84].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        // Fix the v1 checksum over 20 bytes.
        let sum: u8 = area[64..84].iter().fold(0u8, |a, &b| a.wrapping_add(b));
        area[72] = 0u8.wrapping_sub(sum);

        let info = scan_for_rsdp(area.as_ptr() as usize, 0x9_0000, area.len())
            .expect("valid RSDP must be found");
        assert_eq!(info.phys, 0x9_0000 + 64);
        assert_eq!(info.revision, 0);
        assert_eq!(info.rsdt_addr, 0x1234_5678);

        // Corrupt the checksum: the scan must reject it.
        area[72] ^= 0xFF;
        assert!(scan_for_rsdp(area.as_ptr() as usize, 0x9_0000, area.len()).is_none());
    }

    #[test]
    fn rsdt_walk_finds_the_madt() {
        // MADT with one CPU.
        let madt = build_madt(0xFEE0_0000, &lapic_entry(0, 4, 1));
        let madt_addr = madt.as_ptr() as usize;

        // RSDT with one 32-bit pointer; the mapper translates the fake
        // physical value to the MADT's host address.
        let mut rsdt = Vec::new();
        rsdt.extend_from_slice(b"RSDT");
        rsdt.extend_from_slice(&40u32.to_le_bytes()); // 36 header + 1 ptr
        rsdt.push(1);
        rsdt.push(0);
        rsdt.extend_from_slice(b"FERAIT");
        rsdt.extend_from_slice(b"FERRITE ");
        rsdt.extend_from_slice(&1u32.to_le_bytes());
        rsdt.extend_from_slice(b"FRRT");
        rsdt.extend_from_slice(&1u32.to_le_bytes());
        rsdt.extend_from_slice(&0xCAFE_0000u32.to_le_bytes());
        fix_checksum(&mut rsdt, 9);

        let mapper = move |phys: u32, _len: u32| -> Option<usize> {
            (phys == 0xCAFE_0000).then_some(madt_addr)
        };
        let mut disco = Discovery::new();
        assert!(visit_sdt(rsdt.as_ptr() as usize, 4, &mut disco, &mapper));
        assert_eq!(disco.cpu_count, 1);
        assert_eq!(disco.apic_ids[0], 4);
    }

    #[test]
    fn corrupted_rsdt_checksum_is_rejected() {
        let mut rsdt = Vec::new();
        rsdt.extend_from_slice(b"RSDT");
        rsdt.extend_from_slice(&36u32.to_le_bytes());
        rsdt.push(1);
        rsdt.push(0xAA); // bad checksum
        rsdt.extend_from_slice(&[0u8; 26]);

        let mapper = |_: u32, _: u32| -> Option<usize> { None };
        let mut disco = Discovery::new();
        assert!(!visit_sdt(rsdt.as_ptr() as usize, 4, &mut disco, &mapper));
    }

    #[test]
    fn mp_config_table_parses_processors_and_ioapic() {
        // Config table: header + 2 processors + 1 I/O APIC.
        let mut conf = std::vec![0u8; 44 + 20 * 2 + 8];
        conf[0..4].copy_from_slice(b"PCMP");
        let len = conf.len() as u16;
        conf[4..6].copy_from_slice(&len.to_le_bytes());
        conf[6] = 4; // version 1.4
        conf[8..28].copy_from_slice(b"FERRITE MP TEST     ");
        conf[34..36].copy_from_slice(&3u16.to_le_bytes()); // entry count
        conf[36..40].copy_from_slice(&0xFEE0_0000u32.to_le_bytes());

        // Processor entries.
        let p0 = 44;
        conf[p0] = 0; // type
        conf[p0 + 1] = 0; // apic id
        conf[p0 + 3] = 0x01; // enabled
        let p1 = p0 + 20;
        conf[p1] = 0;
        conf[p1 + 1] = 1;
        conf[p1 + 3] = 0x01;
        // I/O APIC entry.
        let io = p1 + 20;
        conf[io] = 2;
        conf[io + 1] = 11;
        conf[io + 4..io + 8].copy_from_slice(&0xFEC0_0000u32.to_le_bytes());

        fix_checksum(&mut conf, 7);

        let mut disco = Discovery::new();
        assert!(parse_mp_config(conf.as_ptr() as usize, &mut disco));
        assert_eq!(disco.cpu_count, 2);
        assert_eq!(disco.legacy_cpus, 2);
        assert_eq!(disco.ioapic_id, 11);
        assert_eq!(disco.lapic_phys, Some(0xFEE0_0000));
    }

    #[test]
    fn mp_floating_pointer_scan_checks_checksum() {
        let mut area = std::vec![0u8; 256];
        area[32..36].copy_from_slice(b"_MP_");
        area[36..40].copy_from_slice(&0x0009_F000u32.to_le_bytes());
        area[40] = 1; // length in 16-byte units
        area[41] = 4; // spec rev
        let sum: u8 = area[32..48].iter().fold(0u8, |a, &b| a.wrapping_add(b));
        area[42] = 0u8.wrapping_sub(sum);

        let found = scan_for_mp(area.as_ptr() as usize, area.len())
            .expect("valid floating pointer must be found");
        assert_eq!(found, area.as_ptr() as usize + 32);

        area[42] ^= 0x55;
        assert!(scan_for_mp(area.as_ptr() as usize, area.len()).is_none());
    }

    #[test]
    fn legacy_fallback_merges_with_acpi_results() {
        // ACPI found one CPU; the MP table knows about two.
        let mut disco = Discovery::new();
        let madt = build_madt(0xFEE0_0000, &lapic_entry(0, 0, 1));
        assert!(parse_madt(madt.as_ptr() as usize, &mut disco));
        assert_eq!(disco.cpu_count, 1);

        let mut conf = std::vec![0u8; 44 + 20 * 2];
        conf[0..4].copy_from_slice(b"PCMP");
        let len = conf.len() as u16;
        conf[4..6].copy_from_slice(&len.to_le_bytes());
        conf[6] = 1;
        conf[34..36].copy_from_slice(&2u16.to_le_bytes());
        conf[36..40].copy_from_slice(&0xFEE0_0000u32.to_le_bytes());
        conf[44] = 0;
        conf[45] = 0; // apic id 0: duplicate of the ACPI CPU
        conf[47] = 0x01;
        conf[64] = 0;
        conf[65] = 1; // apic id 1: new
        conf[67] = 0x01;
        fix_checksum(&mut conf, 7);

        assert!(parse_mp_config(conf.as_ptr() as usize, &mut disco));
        assert_eq!(disco.cpu_count, 2, "duplicate from ACPI is not re-added");
        assert_eq!(disco.acpi_cpus, 1);
        assert_eq!(disco.legacy_cpus, 1);
    }
}
