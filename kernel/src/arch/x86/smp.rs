//! CPU descriptors and multiprocessor bring-up.
//!
//! One descriptor per possible CPU, populated from the MADT walk. The boot
//! CPU starts the others one at a time: trampoline parameters, INIT/SIPI,
//! then a spin on the target's `started` flag before moving on. Every CPU,
//! boot or AP, funnels into [`common_main`].
//!
//! "Which CPU am I" is answered by reading the local APIC id and indexing
//! the array, not by segment-register tricks. The interrupt-nesting counter
//! that conceptually belongs to the CPU lives with the spinlock code in
//! `sync::spinlock`, which owns the only code paths that touch it.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use crate::{
    arch::x86::{acpi::MadtInfo, gdt::Gdt},
    config::MAX_CPUS,
};

/// Per-CPU record: identity, bring-up state, and the CPU's private
/// descriptor tables.
pub struct CpuDescriptor {
    /// Local APIC id, from the MADT.
    pub lapic_id: AtomicU32,
    /// Populated from a MADT record.
    pub present: AtomicBool,
    /// The first MADT processor record is the boot CPU.
    pub boot_cpu: AtomicBool,
    /// 0 until the CPU reaches [`common_main`]; flipped exactly once with
    /// a bus-locked exchange.
    pub started: AtomicU32,
    /// This CPU's GDT and TSS. Written only by the owning CPU.
    gdt: UnsafeCell<Gdt>,
}

// SAFETY: `gdt` is only ever touched by the CPU the descriptor belongs
// to (install and TSS updates run on that CPU with interrupts off); all
// other fields are atomics.
unsafe impl Sync for CpuDescriptor {}

impl CpuDescriptor {
    const fn new() -> Self {
        Self {
            lapic_id: AtomicU32::new(0),
            present: AtomicBool::new(false),
            boot_cpu: AtomicBool::new(false),
            started: AtomicU32::new(0),
            gdt: UnsafeCell::new(Gdt::new()),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire) == 1
    }

    /// Flip the started flag, returning its previous value.
    pub fn mark_started(&self) -> u32 {
        self.started.swap(1, Ordering::SeqCst)
    }
}

pub static CPUS: [CpuDescriptor; MAX_CPUS] = [const { CpuDescriptor::new() }; MAX_CPUS];

static NUM_CPUS: AtomicUsize = AtomicUsize::new(0);

/// CPUs recorded from the MADT (clamped to `MAX_CPUS`).
pub fn cpu_count() -> usize {
    NUM_CPUS.load(Ordering::Acquire)
}

/// Record the MADT's processors into the CPU array. The boot CPU is
/// already running, so its `started` flag begins at 1.
pub fn init_cpus(info: &MadtInfo) {
    let mut count = 0;
    for (i, record) in info.cpus.iter().flatten().enumerate() {
        let cpu = &CPUS[i];
        cpu.lapic_id.store(record.apic_id as u32, Ordering::Relaxed);
        cpu.present.store(true, Ordering::Relaxed);
        cpu.boot_cpu.store(i == 0, Ordering::Relaxed);
        cpu.started.store(u32::from(i == 0), Ordering::Release);
        count = i + 1;
    }
    NUM_CPUS.store(count, Ordering::Release);

    super::lapic::set_base(info.lapic_addr);
    if info.cpu_count > count {
        log::warn!(
            "MADT reports {} processors, capped at {}",
            info.cpu_count,
            MAX_CPUS
        );
    }
}

/// Index of the CPU with the given APIC id, if it was recorded.
pub fn index_of_lapic(apic_id: u32) -> Option<usize> {
    CPUS.iter()
        .take(cpu_count())
        .position(|c| c.lapic_id.load(Ordering::Relaxed) == apic_id)
}

/// Index of the executing CPU. Before the MADT walk (or on the host test
/// harness) there is only CPU 0.
pub fn current_cpu_index() -> usize {
    #[cfg(target_arch = "x86")]
    {
        if cpu_count() == 0 || !super::lapic::present() {
            return 0;
        }
        index_of_lapic(super::lapic::cpu_id() as u32).unwrap_or(0)
    }
    #[cfg(not(target_arch = "x86"))]
    {
        0
    }
}

/// The executing CPU's descriptor.
pub fn current_cpu() -> &'static CpuDescriptor {
    &CPUS[current_cpu_index()]
}

// ---------------------------------------------------------------------------
// Bring-up (bare metal)
// ---------------------------------------------------------------------------

/// Build and load this CPU's GDT (TSS starts with an empty `esp0`; the
/// process layer points it at a kernel stack right after).
#[cfg(target_arch = "x86")]
pub fn gdt_install() {
    let cpu = current_cpu();
    // SAFETY: only the owning CPU touches its `gdt`, and the descriptor is
    // a static so the loaded table never moves.
    unsafe {
        let gdt = &mut *cpu.gdt.get();
        gdt.build(0);
        super::gdt::load(gdt);
    }
}

/// Point this CPU's TSS at a new kernel stack top. Loaded on the next
/// privilege transition.
#[cfg(target_arch = "x86")]
pub fn change_tss(esp0: u32) {
    let cpu = current_cpu();
    // SAFETY: owning-CPU access, as in `gdt_install`.
    unsafe {
        (*cpu.gdt.get()).tss.esp0 = esp0;
    }
}

/// Trampoline parameter slots, in 32-bit words from the trampoline base:
/// the blob's first word is its entry jump, then stack pointer, protected
/// mode entry point, and page directory.
#[cfg(target_arch = "x86")]
const TRAMPOLINE_STACK_SLOT: usize = 1;
#[cfg(target_arch = "x86")]
const TRAMPOLINE_ENTRY_SLOT: usize = 2;
#[cfg(target_arch = "x86")]
const TRAMPOLINE_PDIR_SLOT: usize = 3;

/// Start every application processor, one at a time, then join them in
/// the common idle loop.
///
/// Preconditions: paging on, heap up, the boot CPU through `gdt_install`
/// and `lapic::install`, and the trampoline blob already copied to
/// `layout::TRAMPOLINE_ADDR`.
#[cfg(target_arch = "x86")]
pub fn start_aps() -> ! {
    use crate::layout::{KERNEL_STACK_SZ, KERNEL_STACK_TOP, TRAMPOLINE_ADDR};

    let trampoline = TRAMPOLINE_ADDR as usize as *mut u32;

    for i in 0..cpu_count() {
        let cpu = &CPUS[i];
        if cpu.boot_cpu.load(Ordering::Relaxed) {
            continue;
        }

        let stack_top = KERNEL_STACK_TOP - i as u32 * KERNEL_STACK_SZ;
        // SAFETY: the trampoline page is reserved, identity-mapped, and
        // the AP is not running yet.
        unsafe {
            core::ptr::write_volatile(trampoline.add(TRAMPOLINE_STACK_SLOT), stack_top);
            core::ptr::write_volatile(
                trampoline.add(TRAMPOLINE_ENTRY_SLOT),
                cpu_ap_enter as usize as u32,
            );
            core::ptr::write_volatile(
                trampoline.add(TRAMPOLINE_PDIR_SLOT),
                crate::mm::vmm::kernel_directory().as_u32(),
            );
        }

        super::lapic::start_ap(cpu.lapic_id.load(Ordering::Relaxed) as u8, TRAMPOLINE_ADDR);

        while !cpu.is_started() {
            core::hint::spin_loop();
        }
        log::info!("cpu {} online", i);
    }

    common_main();
}

/// First Rust code an AP executes: same local installers as the boot CPU,
/// then the common idle.
#[cfg(target_arch = "x86")]
#[no_mangle]
pub extern "C" fn cpu_ap_enter() -> ! {
    gdt_install();
    super::lapic::install().expect("AP lapic install cannot fail after BSP did");
    common_main();
}

/// Where every CPU ends up: IDT loaded, started flag published, interrupts
/// on, halt loop.
#[cfg(target_arch = "x86")]
pub fn common_main() -> ! {
    super::idt::enable();
    let index = current_cpu_index();
    CPUS[index].mark_started();
    log::info!("cpu {} in main loop", index);

    // SAFETY: IDT and LAPIC are installed on this CPU.
    unsafe { crate::arch::x86::enable_interrupts() };
    loop {
        crate::arch::x86::halt();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::arch::x86::acpi::{MadtInfo, MadtLocalApic};

    // CPUS/NUM_CPUS are process globals; keep these tests serialized.
    static TEST_GATE: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn fake_madt(ids: &[u8]) -> MadtInfo {
        let mut cpus = [None; MAX_CPUS];
        for (i, id) in ids.iter().take(MAX_CPUS).enumerate() {
            cpus[i] = Some(MadtLocalApic {
                acpi_processor_id: i as u8,
                apic_id: *id,
                flags: 1,
            });
        }
        MadtInfo {
            lapic_addr: 0xFEE0_0000,
            cpus,
            cpu_count: ids.len(),
            ioapic: None,
            ioapic_count: 0,
        }
    }

    #[test]
    fn madt_records_populate_the_cpu_array() {
        let _gate = TEST_GATE.lock().unwrap();
        init_cpus(&fake_madt(&[4, 7]));
        assert_eq!(cpu_count(), 2);
        assert!(CPUS[0].boot_cpu.load(Ordering::Relaxed));
        assert!(CPUS[0].is_started(), "boot CPU is already running");
        assert!(!CPUS[1].boot_cpu.load(Ordering::Relaxed));
        assert!(!CPUS[1].is_started());
        assert_eq!(index_of_lapic(7), Some(1));
        assert_eq!(index_of_lapic(9), None);
    }

    #[test]
    fn started_flips_exactly_once() {
        let _gate = TEST_GATE.lock().unwrap();
        init_cpus(&fake_madt(&[0, 1]));
        assert_eq!(CPUS[1].mark_started(), 0, "first exchange sees 0");
        assert_eq!(CPUS[1].mark_started(), 1, "subsequent exchanges see 1");
        assert!(CPUS[1].is_started());
    }
}
