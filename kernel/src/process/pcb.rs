//! The process control block.

use crate::{
    arch::x86::isr::{Registers, REGISTERS_FRAME_SIZE},
    mm::{PhysicalAddress, VirtualAddress},
};

/// Kernel stack size per process: one frame.
pub const KSTACK_SIZE: u32 = 4096;

/// Process identifier. PID 0 is never allocated; the bootstrap process is
/// PID 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcState {
    Running = 1,
    Ready = 2,
    Blocked = 3,
}

/// Callee-saved subset, kept for explicit (non-interrupt) switches.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

/// One kernel-mode process.
///
/// Created by the bootstrapper or by fork; never destroyed (teardown is an
/// open design question, recorded in DESIGN.md). `next` closes the
/// round-robin ring.
pub struct Pcb {
    pub pid: Pid,
    /// Physical address of this process's page directory.
    pub dirtable: PhysicalAddress,
    /// Base of the 4 KiB kernel stack, one mapped frame.
    pub kstack: VirtualAddress,
    /// The saved register frame near the top of the kernel stack.
    pub regs: *mut Registers,
    pub context: Context,
    pub state: ProcState,
    pub next: *mut Pcb,
}

impl Pcb {
    pub fn kstack_top(&self) -> u32 {
        self.kstack.as_u32() + KSTACK_SIZE
    }

    /// The stack pointer the ISR stub resumes this process with: the
    /// saved frame sits below the two return words at the stack top.
    pub fn resume_esp(&self) -> u32 {
        self.kstack_top() - REGISTERS_FRAME_SIZE - 8
    }
}

/// Byte offset of the saved frame within a fresh kernel stack.
pub const INITIAL_FRAME_OFFSET: usize =
    KSTACK_SIZE as usize - REGISTERS_FRAME_SIZE as usize - 8;

/// Lay out a fresh kernel stack.
///
/// From the top down: `ret_after` (where the entry function returns to),
/// `ret_stack` (the word the entry function sees on its stack), then a
/// zeroed register frame whose EIP is `entry`. Returns the frame's offset
/// from the region base.
pub fn layout_initial_stack(
    region: &mut [u8; KSTACK_SIZE as usize],
    entry: u32,
    ret_after: u32,
    ret_stack: u32,
) -> usize {
    let top = KSTACK_SIZE as usize;
    region[top - 4..top].copy_from_slice(&ret_after.to_le_bytes());
    region[top - 8..top - 4].copy_from_slice(&ret_stack.to_le_bytes());

    let frame_off = INITIAL_FRAME_OFFSET;
    region[frame_off..frame_off + REGISTERS_FRAME_SIZE as usize].fill(0);
    // SAFETY: the frame span was just zeroed and is properly aligned (the
    // region is page-aligned on metal, and Registers is 4-byte aligned).
    let frame = unsafe { &mut *(region.as_mut_ptr().add(frame_off) as *mut Registers) };
    frame.eip = entry;
    frame_off
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    #[test]
    fn resume_esp_sits_below_the_return_words() {
        let pcb = Pcb {
            pid: Pid(3),
            dirtable: PhysicalAddress::new(0x1000),
            kstack: VirtualAddress::new(0x1000_3000),
            regs: core::ptr::null_mut(),
            context: Context::default(),
            state: ProcState::Ready,
            next: core::ptr::null_mut(),
        };
        assert_eq!(pcb.kstack_top(), 0x1000_4000);
        assert_eq!(pcb.resume_esp(), 0x1000_4000 - 68 - 8);
        assert_eq!(
            pcb.resume_esp() - pcb.kstack.as_u32(),
            INITIAL_FRAME_OFFSET as u32
        );
    }

    #[test]
    fn initial_stack_carries_entry_and_return_chain() {
        let mut region = Box::new([0xA5u8; KSTACK_SIZE as usize]);
        let frame_off = layout_initial_stack(&mut region, 0x11223344, 0x600D_C0DE, 0x0BAD_F00D);
        assert_eq!(frame_off, INITIAL_FRAME_OFFSET);

        let top = KSTACK_SIZE as usize;
        assert_eq!(&region[top - 4..top], &0x600D_C0DEu32.to_le_bytes());
        assert_eq!(&region[top - 8..top - 4], &0x0BAD_F00Du32.to_le_bytes());

        let frame =
            unsafe { &*(region.as_ptr().add(frame_off) as *const Registers) };
        assert_eq!(frame.eip, 0x11223344);
        assert_eq!(frame.eax, 0);
        assert_eq!(frame.cs, 0, "selectors are the caller's to fill");
    }
}
