//! Boot binary.
//!
//! The multiboot entry (in `arch::x86::boot`) lands in `kernel_main` on the
//! boot CPU with paging provisionally enabled. From there: memory limits,
//! the frame pool, the kernel address space, SMP discovery, interrupt
//! controllers, drivers, the first process, and finally the scheduler loop
//! this CPU never leaves.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use core::sync::atomic::Ordering;

    use ferrite_kernel::arch::x86::boot::{
        ap_trampoline, MemoryMapIter, MultibootInfo, AP_BOOT_PHYS, FRAMEBUFFER,
    };
    use ferrite_kernel::arch::x86::trap_entry;
    use ferrite_kernel::config::{KSTACK_SIZE, ROOT_DEV};
    use ferrite_kernel::mm::layout::{self, PhysAddr};
    use ferrite_kernel::mm::{frame, heap, vm};
    use ferrite_kernel::proc::lifecycle;
    use ferrite_kernel::sched::{self, cpu};
    use ferrite_kernel::{drivers, fs, irq, smp};

    /// End of the provisional 4 MiB boot mapping.
    const EARLY_MAP_END: u32 = 4 << 20;

    #[no_mangle]
    pub extern "C" fn kernel_main(multiboot_phys: u32) -> ! {
        ferrite_kernel::logger::init();
        log::info!("[BOOT] ferrite kernel starting");

        // SAFETY: the bootloader placed the info record in low memory,
        // which the provisional mapping covers.
        let mb: &MultibootInfo =
            unsafe { &*(layout::phys_to_virt(PhysAddr(multiboot_phys)) as *const MultibootInfo) };

        init_memory(mb);
        vm::init();

        // SAFETY: boot CPU, interrupts off.
        unsafe { cpu::this_cpu().seg_state().init() };

        if let Some(fb) = mb.framebuffer() {
            log::info!(
                "[BOOT] framebuffer {}x{}x{} at {:#x}",
                fb.width,
                fb.height,
                fb.bpp,
                fb.addr
            );
            FRAMEBUFFER.call_once(|| fb);
        }

        // CPUs and interrupt controllers.
        smp::init(mb.config_table);
        irq::lapic::init();
        irq::ioapic::init(irq::ioapic::IOAPIC_DEFAULT_PHYS);
        trap_entry::idt_init();
        trap_entry::idt_load();

        // The rest of RAM, then locked allocation and the kernel heap.
        frame::release_usable_ranges();
        frame::enable_locking();
        heap::init();
        vm::enable_mmio_propagation();

        // The boot filesystem; the disk filesystem replaces it when its
        // driver registers first-run init.
        fs::ramfs::init();
        sched::set_first_run_hook(first_run_fs_init);

        // Disk controllers: AHCI preferred, PIO IDE as fallback.
        drivers::pci::probe_storage();
        drivers::ide::init();

        start_other_cpus();

        lifecycle::user_init();
        sched::scheduler();
    }

    fn first_run_fs_init() {
        fs::inode::filesystem().iinit(ROOT_DEV);
    }

    /// Derive and publish the physical-memory limits, collect the usable
    /// ranges, and seed the early frame pool from the provisional mapping.
    fn init_memory(mb: &MultibootInfo) {
        let (limits, source) = if mb.has_memory_map() {
            // SAFETY: the memory map lives in low memory; the iterator
            // stays within mmap_length.
            let iter = unsafe {
                MemoryMapIter::new(
                    layout::phys_to_virt(PhysAddr(mb.mmap_addr)) as usize,
                    mb.mmap_length as usize,
                )
            };
            (
                frame::limits_from_memory_map(iter),
                frame::PhysTopSource::MemoryMap,
            )
        } else if mb.has_basic_memory() {
            (
                frame::limits_from_basic_info(mb.mem_upper),
                frame::PhysTopSource::BasicInfo,
            )
        } else {
            (
                frame::MemoryLimits {
                    total_bytes: 0,
                    usable_bytes: 0,
                },
                frame::PhysTopSource::Fallback,
            )
        };
        frame::apply_memory_limits(limits, source);
        frame::report_memory_limits();

        if mb.has_memory_map() {
            // SAFETY: as above.
            let iter = unsafe {
                MemoryMapIter::new(
                    layout::phys_to_virt(PhysAddr(mb.mmap_addr)) as usize,
                    mb.mmap_length as usize,
                )
            };
            frame::build_usable_ranges(iter, layout::phys_ram_end());
        } else {
            frame::build_usable_ranges(core::iter::empty(), layout::phys_ram_end());
        }

        // Early pool: everything between the kernel image and the end of
        // the provisional mapping. The remaining RAM is released once the
        // full kernel directory is live.
        let early_start =
            layout::phys_to_virt(PhysAddr(layout::page_round_up(layout::kernel_end_phys())));
        let early_end = layout::phys_to_virt(PhysAddr(EARLY_MAP_END));
        frame::free_range(early_start as usize, early_end as usize);
    }

    /// Start every application processor: copy the trampoline to low
    /// memory, hand each AP a fresh stack, and wait for it to check in.
    fn start_other_cpus() {
        let boot_index = cpu::cpu_index();
        let code = layout::phys_to_virt(PhysAddr(AP_BOOT_PHYS));
        let blob = ap_trampoline();
        // SAFETY: low memory below 0x7000 + blob len is reserved and
        // covered by the linear map.
        unsafe { core::ptr::copy_nonoverlapping(blob.as_ptr(), code, blob.len()) };

        for index in 0..cpu::cpu_count() {
            if index == boot_index {
                continue;
            }
            let c = cpu::cpu(index);

            let stack = frame::alloc_page().expect("AP stack allocation failed");
            // Argument slots just below the trampoline: stack top, entry,
            // provisional page directory.
            // SAFETY: the slots sit inside the reserved low-memory page.
            unsafe {
                let args = code as *mut u32;
                args.sub(1).write(stack as u32 + KSTACK_SIZE as u32);
                args.sub(2).write(ap_main as usize as u32);
                args.sub(3)
                    .write(layout::virt_to_phys(entry_page_dir_addr()).0);
            }

            irq::lapic::start_ap(c.apic_id.load(Ordering::Acquire), AP_BOOT_PHYS);

            while !c.started.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
        }
    }

    fn entry_page_dir_addr() -> usize {
        extern "C" {
            static entry_page_dir: u8;
        }
        // SAFETY: address of the boot page directory symbol.
        unsafe { core::ptr::addr_of!(entry_page_dir) as usize }
    }

    /// First Rust code on an application processor.
    extern "C" fn ap_main() -> ! {
        vm::switch_kernel_page_directory();
        // SAFETY: this CPU's own segmentation state, interrupts off.
        unsafe { cpu::this_cpu().seg_state().init() };
        irq::lapic::init();
        trap_entry::idt_load();
        log::info!("[BOOT] cpu {} online", cpu::cpu_index());
        sched::scheduler();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!("ferrite-kernel: hosted build; boot the bare-metal image to run the kernel");
}
