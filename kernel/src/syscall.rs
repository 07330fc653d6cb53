//! System-call trap staging.
//!
//! Vector 128 is wired so the gate and dispatch path exist end to end; the
//! handler just records the attempt. Real system calls arrive with user
//! mode, which is out of scope for now.

use crate::arch::x86::isr::{self, Registers};

fn handle_syscall(regs: &mut Registers) -> u32 {
    log::debug!("syscall {} from eip {:#010x}", regs.eax, regs.eip);
    regs as *mut Registers as u32
}

pub fn init() {
    isr::register_interrupt_handler(isr::VECTOR_SYSCALL, handle_syscall);
}
