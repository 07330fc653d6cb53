//! The fixed physical and virtual memory plan.
//!
//! All regions are declared in one place so they provably do not overlap.
//! Addresses are `u32`: this kernel runs in 32-bit protected mode without
//! PAE, so 4 GiB is the whole world.

use crate::config::MAX_CPUS;

pub const KB4: u32 = 0x1000;
pub const MB1: u32 = 0x0010_0000;
pub const MB4: u32 = 0x0040_0000;
pub const MB256: u32 = 0x1000_0000;
pub const GB1: u32 = 0x4000_0000;

// --- Fixed physical addresses ----------------------------------------------

/// BIOS data area; word at +0x0E is the EBDA segment.
pub const BIOS_DATA_ADDR: u32 = 0x400;

/// Start of the upper BIOS ROM region scanned for the RSDP.
pub const MAIN_BIOS_START: u32 = 0xE_0000;

/// Exclusive end of the BIOS ROM scan region.
pub const MAIN_BIOS_END: u32 = 0x10_0000;

/// Physical page the AP trampoline blob is copied to. Must be below 1 MiB
/// and page-aligned so it can double as a STARTUP-IPI vector.
pub const TRAMPOLINE_ADDR: u32 = 0x7000;

/// Staging page for the keyboard scan-code table module, one page below
/// the trampoline.
pub const SCANCODE_TABLE_ADDR: u32 = 0x6000;

/// BIOS warm-reset vector (segment:offset word pair).
pub const WARM_RESET_VECTOR: u32 = 0x467;

/// Default I/O APIC MMIO base.
pub const IOAPIC_PHYS_ADDR: u32 = 0xFEC0_0000;

/// Default local APIC MMIO base (also reported by the MADT).
pub const LAPIC_PHYS_ADDR: u32 = 0xFEE0_0000;

// --- Fixed virtual layout ---------------------------------------------------

/// Top of the boot CPU's kernel stack; AP stacks descend below it.
pub const KERNEL_STACK_TOP: u32 = MB4;

/// Per-CPU kernel stack size (two frames).
pub const KERNEL_STACK_SZ: u32 = KB4 * 2;

/// One page aliasing the local APIC MMIO frame, just below the per-CPU
/// kernel stacks.
pub const LAPIC_VIRT_ADDR: u32 = KERNEL_STACK_TOP - KERNEL_STACK_SZ * MAX_CPUS as u32 - KB4;

/// Everything of the kernel image and its data must fit below the LAPIC
/// alias page.
pub const MAX_KERNEL_MEM: u32 = LAPIC_VIRT_ADDR - KB4;

/// Scratch page the VMM maps transiently (zeroing fresh directories,
/// copy-on-write duplication).
pub const SCRATCH_VIRT_ADDR: u32 = 0x00FF_0000;

/// Virtual region holding per-process kernel stacks, one frame per PID.
pub const PROC_VMM_START: u32 = MB256;
pub const PROC_VMM_SIZE: u32 = MB256;
pub const PROC_VMM_END: u32 = PROC_VMM_START + PROC_VMM_SIZE;

/// The kernel heap: virtual range reserved up front, frames mapped on
/// demand.
pub const HEAP_START: u32 = PROC_VMM_END;
pub const HEAP_SIZE: u32 = MB256;
pub const HEAP_END: u32 = HEAP_START + HEAP_SIZE;

/// First virtual address reserved for user mode.
pub const USERMODE_START: u32 = GB1;

/// Recursive self-map window: page table `i` is visible at
/// `PAGEDIR_WINDOW + i * 4096` while its directory is active.
pub const PAGEDIR_WINDOW: u32 = 0xFFC0_0000;

/// The active page directory itself, through the recursive slot.
pub const PAGEDIR_VIRT: u32 = 0xFFFF_F000;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn kernel_regions_do_not_overlap_user_space() {
        assert!(HEAP_END <= USERMODE_START);
        assert!(PROC_VMM_END == HEAP_START);
    }

    #[test]
    fn lapic_alias_sits_below_the_cpu_stacks() {
        assert_eq!(LAPIC_VIRT_ADDR % KB4, 0);
        assert!(LAPIC_VIRT_ADDR < KERNEL_STACK_TOP - KERNEL_STACK_SZ * MAX_CPUS as u32);
    }
}
