//! Ferrox kernel library.
//!
//! A 32-bit x86 SMP kernel: Multiboot-1 boot, bitmap physical frame
//! allocator, recursive-self-map paging with a copy-on-write hook, a
//! linked-block kernel heap, ACPI/APIC interrupt plumbing, INIT/SIPI
//! multiprocessor bring-up, and timer-driven round-robin kernel processes.
//!
//! Everything that does not touch hardware compiles for the host as well,
//! which is where the unit tests run.

#![no_std]

extern crate alloc;

// Host target (unit tests, tooling): the standard library exists and
// provides the allocator and test harness.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod error;
pub mod klog;
pub mod layout;
pub mod mm;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod timer;

// On bare metal the kernel heap is the allocator behind `alloc::`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

/// Kernel entry, called from the boot shim with the Multiboot info
/// address, the kernel image span, and the initial stack pointer.
///
/// The order below is load-bearing: the frame allocator must see the
/// memory map before anything allocates, the APIC discovery must run while
/// firmware tables are identity-addressed, paging comes after every
/// physical-address consumer has run, and the heap (plus the refcount
/// table) must exist before the first fork.
#[cfg(target_arch = "x86")]
#[no_mangle]
pub extern "C" fn kmain(
    mboot: *const arch::x86::multiboot::BootInfo,
    mem_start: u32,
    mem_end: u32,
    _initial_stack: u32,
) -> ! {
    use arch::x86::{acpi, idt, ioapic, isr, lapic, pic, serial, smp, vga};
    use mm::{heap, page_fault, page_table::PageFlags, vmm, PhysicalAddress, VirtualAddress};

    if mem_end > layout::MAX_KERNEL_MEM {
        panic!("kernel image too large for its address-space budget");
    }

    vga::init();
    klog::init();
    log::info!("console up");

    // SAFETY: the bootloader hands a valid info record in EBX.
    let mboot = unsafe { &*mboot };
    mboot.check_required_flags();

    {
        let mut pmm = mm::FRAME_ALLOCATOR.lock();
        // SAFETY: paging is off and the map describes real RAM.
        let max = unsafe { pmm.init(mboot.memory_map().map(|r| r.region())) }
            .expect("no usable memory in the firmware map");
        pmm.mark_taken(mem_start, mem_end);
        log::info!(
            "physical memory manager: {} MiB managed",
            max / (1024 * 1024)
        );
    }

    // Boot modules: the AP trampoline is mandatory, the scan-code table is
    // only needed once a keyboard driver claims it. Both staging pages are
    // reserved before anything else can allocate them.
    mm::FRAME_ALLOCATOR
        .lock()
        .mark_taken(layout::SCANCODE_TABLE_ADDR, layout::TRAMPOLINE_ADDR + 0x1000);
    mboot
        .move_module("bootap.bin", layout::TRAMPOLINE_ADDR)
        .expect("bootap.bin module is required to start the other CPUs");
    match mboot.move_module("sc2.bin", layout::SCANCODE_TABLE_ADDR) {
        Ok(_) => log::info!("scan-code table staged"),
        Err(_) => log::warn!("sc2.bin missing; keyboard translation unavailable"),
    }

    if !arch::x86::cpu_supported() {
        panic!("CPU lacks the features this kernel needs");
    }

    let madt = acpi::discover().expect("APIC is required hardware");
    smp::init_cpus(&madt);
    log::info!("found {} CPUs", smp::cpu_count());

    lapic::install().expect("local APIC install failed");
    let version = lapic::version();
    log::info!(
        "lapic version {}, max LVT {}",
        version & 0xFF,
        lapic::max_lvt()
    );

    smp::gdt_install();
    log::info!("GDT installed");

    pic::init();
    log::info!("legacy PIC remapped and masked");

    ioapic::init(madt.ioapic.expect("MADT carries no I/O APIC"))
        .expect("I/O APIC init failed");

    idt::install();
    idt::enable();
    isr::install();
    log::info!("IDT and ISR dispatch installed");

    if let Err(err) = serial::init() {
        log::warn!("UART not initialized: {}", err);
    }

    syscall::init();

    // SAFETY: runs once, before any high address is touched.
    unsafe { vmm::init() }.expect("paging bring-up failed");
    log::info!("paging enabled");

    // Back the per-CPU kernel stack region so the trampoline stacks (and
    // eventual privilege transitions) have memory under them.
    {
        let stacks_base =
            layout::KERNEL_STACK_TOP - config::MAX_CPUS as u32 * layout::KERNEL_STACK_SZ;
        mm::FRAME_ALLOCATOR
            .lock()
            .mark_taken(stacks_base, layout::KERNEL_STACK_TOP);
        for addr in (stacks_base..layout::KERNEL_STACK_TOP).step_by(mm::FRAME_SIZE) {
            match vmm::map(
                PhysicalAddress::new(addr),
                VirtualAddress::new(addr),
                PageFlags::WRITABLE,
            ) {
                Ok(()) | Err(error::KernelError::PageInUse { .. }) => {}
                Err(err) => panic!("cannot back CPU stacks: {err}"),
            }
        }
        log::info!("per-CPU kernel stacks mapped below {:#x}", layout::KERNEL_STACK_TOP);
    }

    heap::init().expect("kernel heap init failed");
    log::info!("kernel heap at {:#x}", layout::HEAP_START);

    page_fault::init_refcounts(mm::FRAME_ALLOCATOR.lock().frame_count());

    let pid = process::init().expect("bootstrap process init failed");
    log::info!("bootstrap kernel process: pid {}", pid);

    timer::init();

    log::info!("starting application processors");
    smp::start_aps();
}
