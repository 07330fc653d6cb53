//! 32-bit x86 support: descriptor tables, interrupt controllers, paging
//! control registers, multiprocessor bring-up, and the boot entry.

pub mod acpi;
pub mod gdt;
pub mod idt;
pub mod ioapic;
pub mod isr;
pub mod lapic;
pub mod multiboot;
pub mod pic;
pub mod smp;

#[cfg(target_arch = "x86")]
pub mod entry;
#[cfg(target_arch = "x86")]
pub mod mmu;
#[cfg(target_arch = "x86")]
pub mod serial;
#[cfg(target_arch = "x86")]
pub mod vga;

/// Enable interrupts on this CPU.
///
/// # Safety
///
/// The IDT and the local APIC must be installed first.
#[cfg(target_arch = "x86")]
pub unsafe fn enable_interrupts() {
    // SAFETY: caller contract.
    unsafe { x86::irq::enable() };
}

/// Disable interrupts on this CPU.
#[cfg(target_arch = "x86")]
pub fn disable_interrupts() {
    // SAFETY: masking interrupts is always sound.
    unsafe { x86::irq::disable() };
}

/// Halt until the next interrupt.
#[cfg(target_arch = "x86")]
pub fn halt() {
    // SAFETY: hlt with interrupts enabled resumes on the next interrupt.
    unsafe { x86::halt() };
}

/// Park the CPU forever, interrupts off. The panic path ends here.
#[cfg(target_arch = "x86")]
pub fn halt_forever() -> ! {
    loop {
        disable_interrupts();
        // SAFETY: with IF clear only NMI/SMI can wake us; looping covers
        // that.
        unsafe { x86::halt() };
    }
}

/// Verify the processor is something this kernel can run on, and log the
/// vendor while at it. Requires cpuid, which every CPU with an APIC has.
#[cfg(target_arch = "x86")]
pub fn cpu_supported() -> bool {
    let cpuid = raw_cpuid::CpuId::new();
    let Some(vendor) = cpuid.get_vendor_info() else {
        return false;
    };
    let has_apic = cpuid
        .get_feature_info()
        .map(|f| f.has_apic())
        .unwrap_or(false);
    log::info!("CPU vendor: {}", vendor.as_str());
    has_apic
}
