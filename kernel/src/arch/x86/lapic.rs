//! Local APIC: the per-CPU interrupt controller.
//!
//! Accessed as 32-bit MMIO at a base the MADT reports (0xFEE00000 by
//! convention). Before paging the physical base is used directly; once the
//! VMM has installed the high alias, [`relocate`] switches every CPU to
//! it. Each register write is followed by a read of the ID register so the
//! write has reached the APIC before the next one is issued; IPI delivery
//! depends on this.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[cfg(target_arch = "x86")]
use crate::error::{KernelError, KernelResult};

// Register byte offsets.
const REG_ID: usize = 0x020;
const REG_VERSION: usize = 0x030;
const REG_TPR: usize = 0x080;
const REG_EOI: usize = 0x0B0;
const REG_SPURIOUS: usize = 0x0F0;
const REG_ERROR_STATUS: usize = 0x280;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_LVT_LINT0: usize = 0x350;
const REG_LVT_LINT1: usize = 0x360;
const REG_LVT_ERROR: usize = 0x370;
const REG_TIMER_INITIAL: usize = 0x380;
const REG_TIMER_DIVIDE: usize = 0x3E0;

/// Spurious register: software-enable bit.
const SPURIOUS_ENABLE: u32 = 1 << 8;
/// LVT mask bit.
const LVT_MASKED: u32 = 1 << 16;
/// LVT timer periodic mode.
const LVT_TIMER_PERIODIC: u32 = 1 << 17;
/// Timer divide configuration for divide-by-1 (0b1011).
const TIMER_DIVIDE_BY_1: u32 = 0xB;

// ICR command bits.
const ICR_DELIVERY_INIT: u32 = 5 << 8;
const ICR_DELIVERY_STARTUP: u32 = 6 << 8;
/// Delivery-status: set while the IPI is still in flight.
pub const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_TRIGGER_LEVEL: u32 = 1 << 15;
/// Destination shorthand: all CPUs including self.
const ICR_BROADCAST: u32 = 2 << 18;

/// MMIO base currently in use (physical before paging, the high alias
/// after). Zero means no APIC was discovered.
static LAPIC_BASE: AtomicUsize = AtomicUsize::new(0);

/// `max LVT` from the version register, recorded at install.
static MAX_LVT: AtomicU32 = AtomicU32::new(0);

/// Record the MMIO base reported by the MADT.
pub fn set_base(phys: u32) {
    LAPIC_BASE.store(phys as usize, Ordering::Release);
}

/// Switch register access to the virtual alias the VMM installed.
pub fn relocate(virt: crate::mm::VirtualAddress) {
    LAPIC_BASE.store(virt.as_u32() as usize, Ordering::Release);
}

pub fn present() -> bool {
    LAPIC_BASE.load(Ordering::Acquire) != 0
}

/// ICR high half: destination APIC id in bits 24..31.
pub fn icr_destination(apic_id: u8) -> u32 {
    (apic_id as u32) << 24
}

/// ICR low half for a STARTUP IPI: the vector is the trampoline's page
/// number.
pub fn icr_startup(trampoline: u32) -> u32 {
    ICR_DELIVERY_STARTUP | (trampoline >> 12)
}

#[cfg(target_arch = "x86")]
fn base() -> usize {
    LAPIC_BASE.load(Ordering::Acquire)
}

#[cfg(target_arch = "x86")]
fn read(reg: usize) -> u32 {
    // SAFETY: `base` is the LAPIC MMIO block; volatile keeps the access.
    unsafe { core::ptr::read_volatile((base() + reg) as *const u32) }
}

#[cfg(target_arch = "x86")]
fn write(reg: usize, value: u32) {
    // SAFETY: as in `read`. The ID read after the store serializes the
    // write against the APIC.
    unsafe {
        core::ptr::write_volatile((base() + reg) as *mut u32, value);
        core::ptr::read_volatile((base() + REG_ID) as *const u32);
    }
}

/// This CPU's APIC id (top byte of the ID register).
#[cfg(target_arch = "x86")]
pub fn cpu_id() -> u8 {
    if !present() {
        return 0;
    }
    (read(REG_ID) >> 24) as u8
}

#[cfg(target_arch = "x86")]
pub fn version() -> u32 {
    read(REG_VERSION)
}

pub fn max_lvt() -> u32 {
    MAX_LVT.load(Ordering::Relaxed)
}

/// Acknowledge the in-service interrupt.
#[cfg(target_arch = "x86")]
pub fn eoi() {
    write(REG_EOI, 0);
}

/// Program this CPU's local APIC: spurious vector + enable, the periodic
/// timer, masked LINT lines, the error vector, and a clean slate of error
/// status and task priority. Runs on every CPU, boot and AP alike.
#[cfg(target_arch = "x86")]
pub fn install() -> KernelResult<()> {
    use crate::arch::x86::isr;

    if !present() {
        return Err(KernelError::NotPresent { device: "lapic" });
    }

    write(
        REG_SPURIOUS,
        SPURIOUS_ENABLE | isr::IRQ_SPURIOUS as u32,
    );

    write(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_1);
    write(REG_LVT_TIMER, LVT_TIMER_PERIODIC | isr::IRQ_TIMER as u32);
    write(REG_TIMER_INITIAL, crate::config::LAPIC_TIMER_INITIAL);

    write(REG_LVT_LINT0, LVT_MASKED);
    write(REG_LVT_LINT1, LVT_MASKED);
    write(REG_LVT_ERROR, isr::IRQ_ERROR as u32);

    // The error status register latches; it must be written twice to
    // clear.
    write(REG_ERROR_STATUS, 0);
    write(REG_ERROR_STATUS, 0);

    eoi();

    // Synchronize arbitration ids: broadcast INIT level de-assert and wait
    // for delivery.
    write(REG_ICR_HIGH, 0);
    write(
        REG_ICR_LOW,
        ICR_BROADCAST | ICR_DELIVERY_INIT | ICR_TRIGGER_LEVEL,
    );
    wait_delivery();

    write(REG_TPR, 0);

    MAX_LVT.store((version() >> 16) & 0xFF, Ordering::Relaxed);
    Ok(())
}

/// Spin until the previous IPI has left the ICR.
#[cfg(target_arch = "x86")]
fn wait_delivery() {
    while read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        core::hint::spin_loop();
    }
}

/// Start the application processor with APIC id `apic_id` executing the
/// real-mode trampoline at physical `trampoline` (page-aligned, below
/// 1 MiB).
///
/// Protocol per the MP specification: program the BIOS warm-reset vector
/// so an INIT lands in the trampoline, send INIT assert then de-assert,
/// then two STARTUP IPIs carrying the trampoline page number.
#[cfg(target_arch = "x86")]
pub fn start_ap(apic_id: u8, trampoline: u32) {
    use crate::layout::WARM_RESET_VECTOR;
    use x86::io::outb;

    // CMOS shutdown code 0x0A: warm reset jumps through 0x467.
    // SAFETY: CMOS index/data port protocol; the warm-reset vector words
    // are identity-addressed.
    unsafe {
        outb(0x70, 0x0F);
        outb(0x71, 0x0A);
        let vector = WARM_RESET_VECTOR as usize as *mut u16;
        core::ptr::write_volatile(vector, 0);
        core::ptr::write_volatile(vector.add(1), (trampoline >> 4) as u16);
    }

    write(REG_ICR_HIGH, icr_destination(apic_id));
    write(
        REG_ICR_LOW,
        ICR_DELIVERY_INIT | ICR_TRIGGER_LEVEL | ICR_LEVEL_ASSERT,
    );
    wait_delivery();

    write(REG_ICR_HIGH, icr_destination(apic_id));
    write(REG_ICR_LOW, ICR_DELIVERY_INIT | ICR_TRIGGER_LEVEL);
    wait_delivery();

    // The MP spec wants the STARTUP IPI sent twice.
    for _ in 0..2 {
        write(REG_ICR_HIGH, icr_destination(apic_id));
        write(REG_ICR_LOW, icr_startup(trampoline));
        wait_delivery();
    }
}
