//! Compile-time kernel configuration.
//!
//! Everything here is a constant; changing a value means recompiling. The
//! fixed virtual-memory plan lives in [`crate::layout`].

/// Upper bound on CPUs the kernel will manage. Sizes the CPU descriptor
/// array; extra processors reported by the MADT are ignored.
pub const MAX_CPUS: usize = 8;

/// Assumed local APIC timer input frequency. The bus clock is not
/// calibrated; this matches the emulators the kernel is brought up on.
pub const LAPIC_BUS_HZ: u32 = 100_000_000;

/// Timer interrupts per second programmed into the local APIC timer.
pub const INTR_PER_SEC: u32 = 10;

/// Local APIC timer initial count for the divide-by-1 configuration.
pub const LAPIC_TIMER_INITIAL: u32 = LAPIC_BUS_HZ / INTR_PER_SEC;

/// The scheduler rotates the ready ring once every this many timer ticks.
pub const TICKS_PER_SWITCH: u64 = 32;

/// Number of 4 KiB frames the heap requests from the frame allocator each
/// time it grows.
pub const HEAP_GROUP_FRAMES: usize = 1024;

/// Highest PID the kernel will hand out. Sizes the in-use PID bitmap.
pub const PROC_MAX_PID: u32 = 1024;

/// Serial console baud rate.
pub const UART_BAUD_RATE: u32 = 9600;
