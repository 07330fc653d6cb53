//! Architecture-specific code.
//!
//! This kernel targets 32-bit x86 in protected mode. Table parsing and
//! descriptor packing are plain data manipulation and compile everywhere
//! (the host test harness exercises them); anything that touches ports,
//! MMIO, or privileged registers is gated on the real target.

pub mod x86;
