//! I/O APIC: routes device IRQs to CPU-local APICs.
//!
//! Programmed indirectly: write a register index to IOREGSEL (offset 0x00
//! from the MMIO base), then read or write the value through IOWIN (offset
//! 0x10). Each redirection-table entry is 64 bits accessed as two 32-bit
//! registers:
//!
//! - 0..7    interrupt vector
//! - 8..10   delivery mode
//! - 11      destination mode
//! - 12      delivery status (read-only)
//! - 13      pin polarity
//! - 14      remote IRR (read-only)
//! - 15      trigger mode
//! - 16      mask
//! - 56..63  destination APIC id

#[cfg(target_arch = "x86")]
use spin::Mutex;

#[cfg(target_arch = "x86")]
use crate::{
    arch::x86::{acpi::MadtIoApic, isr},
    error::{KernelError, KernelResult},
};

const IOREGSEL: usize = 0x00;
const IOWIN: usize = 0x10;

const REG_ID: u32 = 0x00;
const REG_VERSION: u32 = 0x01;
const REG_REDIRECT_BASE: u32 = 0x10;

/// Redirection entry low-half mask bit.
pub const REDIRECT_MASKED: u32 = 1 << 16;

/// What the kernel keeps about the (single) I/O APIC.
#[derive(Debug, Clone, Copy)]
pub struct IoApic {
    pub id: u8,
    pub base: u32,
    pub gsi_base: u32,
    /// Number of redirection entries, from the version register.
    pub redirect_entries: u32,
}

#[cfg(target_arch = "x86")]
static IOAPIC: Mutex<Option<IoApic>> = Mutex::new(None);

/// Low half of a redirection entry: the vector, masked or not.
pub fn redirect_low(vector: u8, masked: bool) -> u32 {
    let mut value = vector as u32;
    if masked {
        value |= REDIRECT_MASKED;
    }
    value
}

/// High half of a redirection entry: destination APIC id in bits 56..63.
pub fn redirect_high(apic_id: u8) -> u32 {
    (apic_id as u32) << 24
}

/// Redirection-entry count from a version-register value. The hardware
/// field (bits 16..23) holds the highest entry index, so one more than it.
pub fn entries_from_version(version: u32) -> u32 {
    ((version >> 16) & 0xFF) + 1
}

#[cfg(target_arch = "x86")]
fn mmio_read(base: u32, reg: u32) -> u32 {
    // SAFETY: register-select/window protocol on the I/O APIC MMIO block,
    // which firmware reports at `base`.
    unsafe {
        core::ptr::write_volatile((base as usize + IOREGSEL) as *mut u32, reg & 0xFF);
        core::ptr::read_volatile((base as usize + IOWIN) as *const u32)
    }
}

#[cfg(target_arch = "x86")]
fn mmio_write(base: u32, reg: u32, value: u32) {
    // SAFETY: as in `mmio_read`.
    unsafe {
        core::ptr::write_volatile((base as usize + IOREGSEL) as *mut u32, reg & 0xFF);
        core::ptr::write_volatile((base as usize + IOWIN) as *mut u32, value);
    }
}

/// Program the I/O APIC found in the MADT: every redirection entry masked
/// with its vector pre-assigned to `IRQ0 + entry`.
#[cfg(target_arch = "x86")]
pub fn init(record: MadtIoApic) -> KernelResult<()> {
    let version = mmio_read(record.address, REG_VERSION);
    let entries = entries_from_version(version);

    let reported_id = (mmio_read(record.address, REG_ID) >> 24) as u8;
    if reported_id != record.id {
        log::warn!(
            "ioapic id mismatch: MADT says {}, hardware says {}",
            record.id,
            reported_id
        );
    }

    for i in 0..entries {
        mmio_write(
            record.address,
            REG_REDIRECT_BASE + 2 * i,
            redirect_low(isr::IRQ0 + i as u8, true),
        );
        mmio_write(record.address, REG_REDIRECT_BASE + 2 * i + 1, 0);
    }

    *IOAPIC.lock() = Some(IoApic {
        id: record.id,
        base: record.address,
        gsi_base: record.gsi_base,
        redirect_entries: entries,
    });
    log::info!("ioapic {}: {} redirection entries", record.id, entries);
    Ok(())
}

/// Route legacy IRQ `irq` (0-based) to the CPU with the given APIC id and
/// unmask it.
#[cfg(target_arch = "x86")]
pub fn enable_irq(irq: u8, apic_id: u8) -> KernelResult<()> {
    let ioapic = (*IOAPIC.lock())
        .ok_or(KernelError::NotInitialized { subsystem: "ioapic" })?;
    if irq as u32 >= ioapic.redirect_entries {
        return Err(KernelError::InvalidArgument { what: "irq line" });
    }
    mmio_write(
        ioapic.base,
        REG_REDIRECT_BASE + 2 * irq as u32,
        redirect_low(isr::IRQ0 + irq, false),
    );
    mmio_write(
        ioapic.base,
        REG_REDIRECT_BASE + 2 * irq as u32 + 1,
        redirect_high(apic_id),
    );
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::arch::x86::isr;

    #[test]
    fn redirect_halves_encode_vector_mask_and_destination() {
        assert_eq!(redirect_low(isr::IRQ0, true), 0x0001_0020);
        assert_eq!(redirect_low(isr::IRQ0 + 1, false), 0x21);
        assert_eq!(redirect_high(3), 0x0300_0000);
        assert_eq!(redirect_high(0), 0);
    }

    #[test]
    fn version_register_count_is_one_based() {
        // Typical value: version 0x11, max redirection entry 23.
        assert_eq!(entries_from_version(0x0017_0011), 24);
        assert_eq!(entries_from_version(0x0000_0011), 1);
    }
}
