//! The ready ring and the context switch.
//!
//! Cooperative round-robin over a circular singly linked ring of PCBs.
//! There are no priorities and no sleep queues; preemption happens only
//! when the timer handler decides a tick is a switch tick.
//!
//! The ring and the current pointer are one shared object guarded by the
//! process lock. Per-CPU currents and cross-CPU TLB shoot-down are the
//! recorded SMP gap (DESIGN.md).

use core::ptr::NonNull;

use crate::{
    arch::x86::isr::Registers,
    process::pcb::{Pcb, ProcState},
    sync::spinlock::{LockResource, SpinLock},
};

pub struct ProcTable {
    /// The PCB executing on this CPU, if the process subsystem is up.
    pub current: Option<NonNull<Pcb>>,
}

// SAFETY: the PCBs behind these pointers are leaked allocations that live
// forever, and every access goes through the process spinlock.
unsafe impl Send for ProcTable {}

/// The process table, lowest lock in the ordering.
pub static PROC_TABLE: SpinLock<ProcTable> =
    SpinLock::new(LockResource::Process, ProcTable { current: None });

/// Install the bootstrap PCB as the running process.
pub fn adopt(pcb: NonNull<Pcb>) {
    PROC_TABLE.lock().current = Some(pcb);
}

/// Splice `new` into the ring right after `cur`.
pub fn insert_after(cur: &mut Pcb, new: &mut Pcb) {
    new.next = cur.next;
    cur.next = new as *mut Pcb;
}

/// Timer-driven switch. Saves the live frame into the current PCB,
/// advances the ring, points the TSS and page directory at the next
/// process, and returns the stack pointer to resume with. With no second
/// runnable process the incoming frame is returned unchanged.
pub fn switch_task(regs: &mut Registers) -> u32 {
    let mut table = PROC_TABLE.lock();
    let Some(mut current_ptr) = table.current else {
        return regs as *mut Registers as u32;
    };

    // SAFETY: ring PCBs are leaked statics; the process lock is held.
    let current = unsafe { current_ptr.as_mut() };
    if core::ptr::eq(current.next, current as *mut Pcb) {
        return regs as *mut Registers as u32;
    }

    // SAFETY: `regs` is the live frame for the running process and
    // `current.regs` is the fixed save slot in its kernel stack.
    unsafe { *current.regs = *regs };
    current.state = ProcState::Ready;

    // SAFETY: ring pointers only ever name live PCBs.
    let next = unsafe { &mut *current.next };
    table.current = NonNull::new(next as *mut Pcb);

    #[cfg(target_arch = "x86")]
    crate::arch::x86::smp::change_tss(next.kstack_top());
    crate::mm::vmm::switch_pdir(next.dirtable);

    next.state = ProcState::Running;
    next.resume_esp()
}

/// Drop the faulting process out of the ring and resume its successor.
/// The PCB stays allocated (destruction is the recorded open question);
/// its frames are reclaimed with it.
pub fn terminate_current(regs: &mut Registers) -> u32 {
    let mut table = PROC_TABLE.lock();
    let Some(mut current_ptr) = table.current else {
        panic!("user fault with no process subsystem");
    };

    // SAFETY: as in switch_task.
    let current = unsafe { current_ptr.as_mut() };
    if core::ptr::eq(current.next, current as *mut Pcb) {
        panic!("terminating the last runnable process");
    }

    log::warn!("terminating process {}", current.pid);
    current.state = ProcState::Blocked;

    // Unlink: find the predecessor around the ring.
    // SAFETY: the ring is circular and finite.
    let mut prev = unsafe { &mut *current.next };
    while !core::ptr::eq(prev.next, current as *mut Pcb) {
        prev = unsafe { &mut *prev.next };
    }
    prev.next = current.next;

    let next = unsafe { &mut *current.next };
    table.current = NonNull::new(next as *mut Pcb);

    #[cfg(target_arch = "x86")]
    crate::arch::x86::smp::change_tss(next.kstack_top());
    crate::mm::vmm::switch_pdir(next.dirtable);

    next.state = ProcState::Running;
    next.resume_esp()
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod tests {
    use super::*;
    use crate::{
        arch::x86::isr::REGISTERS_FRAME_SIZE,
        mm::{PhysicalAddress, VirtualAddress},
        process::pcb::{Context, Pid, KSTACK_SIZE},
    };
    use alloc::boxed::Box;

    // PROC_TABLE is a process global; these tests (and the timer test,
    // which can reach switch_task) must not interleave.
    pub(crate) static TEST_GATE: std::sync::Mutex<()> = std::sync::Mutex::new(());

    pub(crate) struct TestProc {
        pub pcb: &'static mut Pcb,
        pub frame: &'static mut Registers,
    }

    pub(crate) fn make_proc(pid: u32, kstack: u32) -> TestProc {
        let frame: &'static mut Registers =
            Box::leak(Box::new(unsafe { core::mem::zeroed() }));
        let pcb = Box::leak(Box::new(Pcb {
            pid: Pid(pid),
            dirtable: PhysicalAddress::new(pid * 0x1000),
            kstack: VirtualAddress::new(kstack),
            regs: frame as *mut Registers,
            context: Context::default(),
            state: ProcState::Ready,
            next: core::ptr::null_mut(),
        }));
        pcb.next = pcb as *mut Pcb;
        // The frame reference stays usable: the PCB only stores the raw
        // pointer.
        let frame = unsafe { &mut *pcb.regs };
        TestProc { pcb, frame }
    }

    fn live_frame(eax: u32) -> Registers {
        let mut regs: Registers = unsafe { core::mem::zeroed() };
        regs.eax = eax;
        regs.eip = 0x400000 + eax;
        regs
    }

    #[test]
    fn lone_process_keeps_the_cpu() {
        let _gate = TEST_GATE.lock().unwrap();
        let a = make_proc(1, 0x1000_1000);
        a.pcb.state = ProcState::Running;
        adopt(NonNull::from(&mut *a.pcb));

        let mut frame = live_frame(7);
        let resumed = switch_task(&mut frame);
        assert_eq!(resumed, &mut frame as *mut Registers as u32);
        assert_eq!(a.pcb.state, ProcState::Running);

        PROC_TABLE.lock().current = None;
    }

    #[test]
    fn two_processes_rotate_and_save_state() {
        let _gate = TEST_GATE.lock().unwrap();
        let a = make_proc(1, 0x1000_1000);
        let b = make_proc(2, 0x1000_2000);
        a.pcb.state = ProcState::Running;
        insert_after(a.pcb, b.pcb);
        adopt(NonNull::from(&mut *a.pcb));

        let mut frame = live_frame(41);
        let resumed = switch_task(&mut frame);

        assert_eq!(a.frame.eax, 41, "live frame saved into A's slot");
        assert_eq!(a.pcb.state, ProcState::Ready);
        assert_eq!(b.pcb.state, ProcState::Running);
        assert_eq!(
            resumed,
            0x1000_2000 + KSTACK_SIZE - REGISTERS_FRAME_SIZE - 8,
            "resume inside B's kernel stack"
        );
        assert_eq!(
            crate::mm::vmm::current_directory(),
            b.pcb.dirtable,
            "address space followed the switch"
        );

        // And back again.
        let mut frame2 = live_frame(42);
        let resumed2 = switch_task(&mut frame2);
        assert_eq!(b.frame.eax, 42);
        assert_eq!(a.pcb.state, ProcState::Running);
        assert_eq!(resumed2, a.pcb.resume_esp());

        PROC_TABLE.lock().current = None;
    }

    #[test]
    fn termination_unlinks_the_faulting_process() {
        let _gate = TEST_GATE.lock().unwrap();
        let a = make_proc(1, 0x1000_1000);
        let b = make_proc(2, 0x1000_2000);
        let c = make_proc(3, 0x1000_3000);
        a.pcb.state = ProcState::Running;
        insert_after(a.pcb, b.pcb);
        insert_after(b.pcb, c.pcb);
        // Ring is now a -> b -> c -> a.
        assert!(core::ptr::eq(a.pcb.next, b.pcb as *const Pcb as *mut Pcb));

        adopt(NonNull::from(&mut *a.pcb));
        let mut frame = live_frame(1);
        let resumed = switch_task(&mut frame);
        assert_eq!(resumed, b.pcb.resume_esp(), "b runs");

        let mut fault = live_frame(2);
        let resumed = terminate_current(&mut fault);
        assert_eq!(resumed, c.pcb.resume_esp(), "c takes over from b");
        assert_eq!(b.pcb.state, ProcState::Blocked);
        assert!(
            core::ptr::eq(a.pcb.next, c.pcb as *const Pcb as *mut Pcb),
            "b is out of the ring"
        );

        PROC_TABLE.lock().current = None;
    }
}
