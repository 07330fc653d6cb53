//! Kernel-mode processes.
//!
//! [`init`] fabricates PCB #1 around the boot CPU's current execution
//! context; [`fork`] clones the running process with copy-on-write memory;
//! the scheduler rotates the ring on timer ticks. Everything here is
//! kernel-mode only; the user-mode transition is staged but out of scope,
//! and the in-force contract is that the TSS `esp0` always names the top
//! of the current PCB's kernel stack.

pub mod pcb;
pub mod pid;
pub mod scheduler;

pub use pcb::{Pcb, Pid, ProcState, KSTACK_SIZE};
pub use scheduler::switch_task;

use spin::Mutex;

use crate::arch::x86::isr::Registers;

/// The in-use PID bitmap.
pub static PIDS: Mutex<pid::PidAllocator> = Mutex::new(pid::PidAllocator::new());

/// User-fault path: hand off to the scheduler's unlink-and-resume. Split
/// out so the page-fault handler has one portable entry point.
pub fn terminate_current(regs: &mut Registers) -> u32 {
    scheduler::terminate_current(regs)
}

// ---------------------------------------------------------------------------
// Bare-metal process construction
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86")]
mod bringup {
    use core::ptr::NonNull;

    use alloc::boxed::Box;

    use super::{pcb, scheduler, PIDS};
    use crate::{
        arch::x86::{gdt, smp},
        error::KernelResult,
        layout,
        mm::{self, page_table::PageFlags, vmm, VirtualAddress},
        process::pcb::{Context, Pcb, Pid, ProcState, KSTACK_SIZE},
        sync::spinlock,
    };

    /// The bootstrap process body: the boot CPU parks here when nothing
    /// else is runnable.
    extern "C" fn process_idle() {
        log::debug!("bootstrap process idle");
        loop {
            crate::arch::x86::halt();
        }
    }

    /// Where a forked child lands after its trampoline returns: there is
    /// no caller stack to unwind into until user mode exists.
    extern "C" fn fork_child_main() {
        log::debug!("forked child running");
        loop {
            crate::arch::x86::halt();
        }
    }

    core::arch::global_asm!(
        r#"
.global return_fork
return_fork:
    xor eax, eax
    ret
"#
    );

    fn fork_trampoline() -> u32 {
        extern "C" {
            fn return_fork();
        }
        return_fork as usize as u32
    }

    /// Allocate a PCB: a PID, one frame of kernel stack mapped at the
    /// per-PID slot in the process region, and an initial saved frame that
    /// irets into `entry`.
    pub fn alloc_proc(entry: u32, ret_after: u32, ret_stack: u32) -> KernelResult<NonNull<Pcb>> {
        let pid = PIDS.lock().alloc()?;

        let kstack = VirtualAddress::new(layout::PROC_VMM_START + pid.0 * KSTACK_SIZE);
        let phys = mm::FRAME_ALLOCATOR.lock().alloc_first()?;
        vmm::map(phys, kstack, PageFlags::WRITABLE)?;

        // SAFETY: the stack frame was just mapped writable at `kstack`.
        let region = unsafe { &mut *(kstack.as_u32() as usize as *mut [u8; 4096]) };
        let frame_off = pcb::layout_initial_stack(region, entry, ret_after, ret_stack);

        let pcb = Box::leak(Box::new(Pcb {
            pid,
            dirtable: vmm::current_directory(),
            kstack,
            regs: (kstack.as_u32() as usize + frame_off) as *mut _,
            context: Context::default(),
            state: ProcState::Ready,
            next: core::ptr::null_mut(),
        }));
        pcb.next = pcb as *mut Pcb;
        Ok(NonNull::from(pcb))
    }

    /// Create PCB #1 for the context the boot CPU is already executing,
    /// install it as current, and point the TSS at its kernel stack.
    pub fn init() -> KernelResult<Pid> {
        let mut pcb_ptr = alloc_proc(process_idle as usize as u32, 0, 0)?;
        // SAFETY: just allocated, nothing else references it yet.
        let pcb = unsafe { pcb_ptr.as_mut() };
        pcb.state = ProcState::Running;

        // SAFETY: `regs` names the frame slot alloc_proc laid out.
        let regs = unsafe { &mut *pcb.regs };
        let data = gdt::KERNEL_DATA_SELECTOR as u32;
        regs.ds = data;
        regs.es = data;
        regs.fs = data;
        regs.gs = data;
        regs.cs = gdt::KERNEL_CODE_SELECTOR as u32;
        // IF plus the always-one reserved bit.
        regs.eflags = 0x202;

        pcb.dirtable = vmm::current_directory();
        pcb.next = pcb as *mut Pcb;

        scheduler::adopt(pcb_ptr);
        smp::change_tss(pcb.kstack_top());
        Ok(pcb.pid)
    }

    /// Clone the running process. The child gets a copy-on-write view of
    /// the parent's user mappings and first runs the fork trampoline,
    /// which hands it 0 where the parent got the child's PID.
    pub fn fork() -> KernelResult<Pid> {
        spinlock::push_cli();
        let result = fork_locked();
        spinlock::pop_cli();
        result
    }

    fn fork_locked() -> KernelResult<Pid> {
        let mut child_ptr = alloc_proc(
            fork_trampoline(),
            fork_child_main as usize as u32,
            0,
        )?;
        // SAFETY: freshly allocated, unshared until ring insertion below.
        let child = unsafe { child_ptr.as_mut() };

        // The child starts from an image of the parent's saved frame, with
        // its own entry point and EAX forced to zero by the trampoline.
        {
            let parent_regs = {
                let table = scheduler::PROC_TABLE.lock();
                table.current.map(|p| {
                    // SAFETY: ring PCBs live forever; the frame slot is the
                    // fixed save area in the parent's kernel stack.
                    unsafe { *p.as_ref().regs }
                })
            };
            let entry = fork_trampoline();
            // SAFETY: frame slot laid out by alloc_proc.
            let regs = unsafe { &mut *child.regs };
            if let Some(parent) = parent_regs {
                *regs = parent;
            }
            regs.eip = entry;
            regs.eax = 0;
            let data = gdt::KERNEL_DATA_SELECTOR as u32;
            regs.ds = data;
            regs.es = data;
            regs.fs = data;
            regs.gs = data;
            regs.cs = gdt::KERNEL_CODE_SELECTOR as u32;
            regs.eflags = 0x202;
        }

        // Duplicate the address space and mark user pages copy-on-write in
        // both parent and child.
        let scratch = VirtualAddress::new(layout::SCRATCH_VIRT_ADDR);
        let child_dir = vmm::create_address_space(scratch)?;
        vmm::map(child_dir, scratch, PageFlags::WRITABLE)?;
        {
            let mut refcounts = crate::mm::page_fault::REFCOUNTS.lock();
            let refcounts = refcounts
                .as_mut()
                .ok_or(crate::error::KernelError::NotInitialized {
                    subsystem: "cow refcounts",
                })?;
            let mut pmm = mm::FRAME_ALLOCATOR.lock();
            vmm::PageMapper::new(&vmm::RecursiveWindow, &mut *pmm).clone_address_space(
                scratch,
                |frame, newly| {
                    refcounts.retain(frame);
                    if newly {
                        refcounts.retain(frame);
                    }
                },
            );
        }
        vmm::unmap(scratch)?;
        child.dirtable = child_dir;

        // The parent's PTEs just lost their writable bits; drop the stale
        // translations.
        vmm::switch_pdir(vmm::current_directory());

        let pid = child.pid;
        let mut table = scheduler::PROC_TABLE.lock();
        if let Some(mut current) = table.current {
            // SAFETY: ring PCBs live forever; the process lock is held.
            scheduler::insert_after(unsafe { current.as_mut() }, child);
        }
        drop(table);

        Ok(pid)
    }
}

#[cfg(target_arch = "x86")]
pub use bringup::{alloc_proc, fork, init};
