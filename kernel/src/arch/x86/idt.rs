//! Interrupt Descriptor Table.
//!
//! 256 gates, all through the kernel code segment. Gates are installed
//! with DPL 3 so `int 0x80` from (eventual) user mode can enter; the
//! 32-bit gate type keeps interrupts disabled on entry.
//!
//! Vector assignment:
//! - 0..=31   CPU exceptions
//! - 32..=47  legacy IRQ range, also what the I/O APIC redirects to
//! - 63       local APIC spurious
//! - 64       local APIC timer (the scheduler tick)
//! - 65       local APIC error
//! - 128      system-call trap
//!
//! Vectors with no assembled stub point at a bare handler that reports the
//! unhandled vector and halts.

#[cfg(target_arch = "x86")]
use spin::Mutex;

/// Interrupt gate, present, DPL 3: type 0xE with P and DPL bits.
pub const GATE_FLAGS: u8 = 0x8E | 0x60;

/// One IDT gate in hardware format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct IdtEntry {
    pub base_low: u16,
    pub selector: u16,
    pub zero: u8,
    pub flags: u8,
    pub base_high: u16,
}

impl IdtEntry {
    pub const fn missing() -> Self {
        Self {
            base_low: 0,
            selector: 0,
            zero: 0,
            flags: 0,
            base_high: 0,
        }
    }

    /// Pack a handler address into gate format.
    pub const fn pack(base: u32, selector: u16, flags: u8) -> Self {
        Self {
            base_low: (base & 0xFFFF) as u16,
            selector,
            zero: 0,
            flags,
            base_high: ((base >> 16) & 0xFFFF) as u16,
        }
    }
}

/// The table itself. Lives in a static so `lidt` has a stable address.
pub struct Idt {
    pub entries: [IdtEntry; 256],
}

impl Idt {
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::missing(); 256],
        }
    }

    pub fn set_gate(&mut self, vector: u8, handler: u32) {
        self.entries[vector as usize] = IdtEntry::pack(
            handler,
            super::gdt::KERNEL_CODE_SELECTOR,
            GATE_FLAGS,
        );
    }
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86")]
static IDT: Mutex<Idt> = Mutex::new(Idt::new());

/// Build the gate table from the assembled stubs. Runs once on the boot
/// CPU; every CPU then points its IDTR at the same table via [`enable`].
#[cfg(target_arch = "x86")]
pub fn install() {
    use super::isr;

    let mut idt = IDT.lock();

    // Default everything to the unhandled trap first.
    for vector in 0..=255u8 {
        idt.set_gate(vector, isr::unhandled_vector_entry());
    }

    for (vector, stub) in isr::exception_stubs() {
        idt.set_gate(vector, stub);
    }
    for (vector, stub) in isr::irq_stubs() {
        idt.set_gate(vector, stub);
    }
    idt.set_gate(isr::IRQ_SPURIOUS, isr::spurious_stub());
    idt.set_gate(isr::IRQ_TIMER, isr::timer_stub());
    idt.set_gate(isr::IRQ_ERROR, isr::error_stub());
    idt.set_gate(isr::VECTOR_SYSCALL, isr::syscall_stub());
}

/// Point this CPU's IDTR at the shared table.
#[cfg(target_arch = "x86")]
pub fn enable() {
    use x86::dtables;

    let idt = IDT.lock();
    let pointer = dtables::DescriptorTablePointer {
        limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: idt.entries.as_ptr(),
    };
    // SAFETY: the table is a static whose gates were filled by `install`.
    unsafe { dtables::lidt(&pointer) };
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn gate_is_eight_bytes() {
        assert_eq!(core::mem::size_of::<IdtEntry>(), 8);
        assert_eq!(core::mem::size_of::<[IdtEntry; 256]>(), 2048);
    }

    #[test]
    fn gate_flags_are_trap_with_dpl3() {
        assert_eq!(GATE_FLAGS, 0xEE);
    }

    #[test]
    fn pack_splits_the_handler_address() {
        let gate = IdtEntry::pack(0x0012_3456, 0x08, GATE_FLAGS);
        assert_eq!({ gate.base_low }, 0x3456);
        assert_eq!({ gate.base_high }, 0x0012);
        assert_eq!({ gate.selector }, 0x08);
        assert_eq!({ gate.zero }, 0);
        assert_eq!({ gate.flags }, 0xEE);
    }

    #[test]
    fn set_gate_uses_the_kernel_code_selector() {
        let mut idt = Idt::new();
        idt.set_gate(14, 0xDEAD_BEEF);
        let gate = idt.entries[14];
        assert_eq!({ gate.selector }, super::super::gdt::KERNEL_CODE_SELECTOR);
        assert_eq!({ gate.base_low }, 0xBEEF);
        assert_eq!({ gate.base_high }, 0xDEAD);
    }
}
