//! Page-fault handling and copy-on-write recovery.
//!
//! A write fault on a `CLONED` entry is the signal that a shared page (or a
//! whole shared table) needs its private copy. Everything else is an error:
//! kernel faults halt the machine, user faults terminate the offending
//! process.
//!
//! Frame sharing is tracked in [`CowRefCounts`], a byte per physical frame.
//! The table lives in the kernel heap and is installed after `heap::init`;
//! fork is refused until then.

use bitflags::bitflags;
use spin::Mutex;

use crate::{
    error::KernelResult,
    mm::{
        page_table::{directory_index, table_index, FramePool, PageFlags},
        vmm::{PageMapper, TableResolver},
        PhysicalAddress, VirtualAddress, FRAME_SIZE,
    },
};

bitflags! {
    /// Hardware page-fault error code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// Set: protection violation. Clear: page not present.
        const PROTECTION  = 1 << 0;
        /// Set: the access was a write.
        const WRITE       = 1 << 1;
        /// Set: the access came from user mode.
        const USER        = 1 << 2;
        /// Set: a reserved bit was set in a paging entry.
        const RESERVED    = 1 << 3;
        /// Set: instruction fetch.
        const INSTRUCTION = 1 << 4;
    }
}

/// One shared-frame refcount per physical frame.
pub struct CowRefCounts {
    counts: alloc::vec::Vec<u8>,
}

impl CowRefCounts {
    pub fn new(frames: u32) -> Self {
        Self {
            counts: alloc::vec![0; frames as usize],
        }
    }

    pub fn count(&self, frame: PhysicalAddress) -> u8 {
        self.counts
            .get(frame.frame_index() as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Another address space now references `frame`.
    pub fn retain(&mut self, frame: PhysicalAddress) {
        if let Some(c) = self.counts.get_mut(frame.frame_index() as usize) {
            *c = c.saturating_add(1);
        }
    }

    /// One reference to `frame` went away; returns how many remain.
    pub fn release(&mut self, frame: PhysicalAddress) -> u8 {
        match self.counts.get_mut(frame.frame_index() as usize) {
            Some(c) => {
                *c = c.saturating_sub(1);
                *c
            }
            None => 0,
        }
    }
}

/// Shared-frame refcounts; `None` until [`init_refcounts`] runs after the
/// heap is up.
pub static REFCOUNTS: Mutex<Option<CowRefCounts>> = Mutex::new(None);

/// Allocate the refcount table (one byte per managed frame) from the kernel
/// heap. Must run after `heap::init`; fork depends on it.
pub fn init_refcounts(frames: u32) {
    *REFCOUNTS.lock() = Some(CowRefCounts::new(frames));
}

/// Attempt copy-on-write recovery for a write fault at `fault`.
///
/// A `CLONED` directory entry gets its table duplicated into a fresh frame;
/// a `CLONED` page entry gets a private frame copy when other references
/// remain, or is simply made writable again when this was the last one.
/// Returns `Ok(false)` when the fault is not COW-recoverable.
pub fn recover_cow<R: TableResolver, P: FramePool>(
    fault: VirtualAddress,
    resolver: &R,
    pool: &mut P,
    refcounts: &mut CowRefCounts,
    scratch: VirtualAddress,
) -> KernelResult<bool> {
    let d = directory_index(fault);
    let p = table_index(fault);

    // SAFETY (here and below): the resolver contract guarantees the
    // directory view, and table views while the slot is present. References
    // are re-derived after every mapper call so no two live at once.
    let pde = unsafe { (*resolver.directory()).entry(d) };
    if !pde.is_present() {
        return Ok(false);
    }

    if pde.flags().contains(PageFlags::CLONED) {
        // The whole table is shared: duplicate it, then repoint this
        // directory privately at the copy.
        let new_table = pool.alloc_frame()?;
        PageMapper::new(resolver, pool).map(new_table, scratch, PageFlags::WRITABLE)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                resolver.table(d) as *const u8,
                resolver.page(scratch),
                FRAME_SIZE,
            );
        }
        PageMapper::new(resolver, pool).unmap(scratch)?;

        let mut flags = pde.flags();
        flags.remove(PageFlags::CLONED);
        flags.insert(PageFlags::WRITABLE);
        unsafe { (*resolver.directory()).entry_mut(d).set(new_table, flags) };
        resolver.invalidate_table_view(d);
    }

    let pte = unsafe { (*resolver.table(d)).entry(p) };
    if !pte.is_present() || !pte.flags().contains(PageFlags::CLONED) {
        return Ok(false);
    }

    let shared_frame = pte.frame();
    if refcounts.count(shared_frame) > 1 {
        // Still shared elsewhere: copy the page, drop our reference.
        let private = pool.alloc_frame()?;
        PageMapper::new(resolver, pool).map(private, scratch, PageFlags::WRITABLE)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                resolver.page(fault.page_base()),
                resolver.page(scratch),
                FRAME_SIZE,
            );
        }
        PageMapper::new(resolver, pool).unmap(scratch)?;
        refcounts.release(shared_frame);

        let mut flags = pte.flags();
        flags.remove(PageFlags::CLONED);
        flags.insert(PageFlags::WRITABLE);
        unsafe { (*resolver.table(d)).entry_mut(p).set(private, flags) };
    } else {
        // Last reference: the page is simply ours again.
        refcounts.release(shared_frame);
        unsafe { (*resolver.table(d)).entry_mut(p).mark_private() };
    }
    Ok(true)
}

/// The vector-14 handler: decode, try COW recovery, otherwise fall over.
#[cfg(target_arch = "x86")]
pub fn handle_page_fault(regs: &mut crate::arch::x86::isr::Registers) -> u32 {
    use crate::arch::x86::{isr, mmu};
    use crate::layout::SCRATCH_VIRT_ADDR;
    use crate::mm::{frame_allocator::FRAME_ALLOCATOR, vmm::RecursiveWindow};

    let fault = VirtualAddress::new(mmu::read_cr2());
    let code = FaultCode::from_bits_truncate(regs.err_code);

    if code.contains(FaultCode::PROTECTION) && code.contains(FaultCode::WRITE) {
        let recovered = {
            let mut pmm = FRAME_ALLOCATOR.lock();
            let mut refcounts = REFCOUNTS.lock();
            match refcounts.as_mut() {
                Some(rc) => recover_cow(
                    fault,
                    &RecursiveWindow,
                    &mut *pmm,
                    rc,
                    VirtualAddress::new(SCRATCH_VIRT_ADDR),
                )
                .unwrap_or(false),
                None => false,
            }
        };
        if recovered {
            mmu::flush_tlb_entry(fault.page_base().as_u32());
            return regs as *mut _ as u32;
        }
    }

    log::error!(
        "page fault ({}{}{}{}{}) at {}",
        if code.contains(FaultCode::PROTECTION) {
            "protection "
        } else {
            "not-present "
        },
        if code.contains(FaultCode::WRITE) {
            "write "
        } else {
            "read "
        },
        if code.contains(FaultCode::USER) {
            "user "
        } else {
            "kernel "
        },
        if code.contains(FaultCode::RESERVED) {
            "reserved "
        } else {
            ""
        },
        if code.contains(FaultCode::INSTRUCTION) {
            "ifetch"
        } else {
            ""
        },
        fault
    );
    isr::print_registers(regs);

    if code.contains(FaultCode::USER) {
        return crate::process::terminate_current(regs);
    }
    panic!("unrecoverable kernel page fault at {fault}");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::layout;
    use crate::mm::vmm::tests::{TestArena, TestPool};
    use crate::mm::vmm::TableResolver as _;

    const USER_PAGE: VirtualAddress = VirtualAddress::new(layout::USERMODE_START);
    const SCRATCH: VirtualAddress = VirtualAddress::new(layout::SCRATCH_VIRT_ADDR);

    fn user_flags() -> PageFlags {
        PageFlags::WRITABLE | PageFlags::USER
    }

    #[test]
    fn refcounts_saturate_and_release() {
        let mut rc = CowRefCounts::new(16);
        let frame = PhysicalAddress::new(3 * FRAME_SIZE as u32);
        assert_eq!(rc.count(frame), 0);
        rc.retain(frame);
        rc.retain(frame);
        assert_eq!(rc.count(frame), 2);
        assert_eq!(rc.release(frame), 1);
        assert_eq!(rc.release(frame), 0);
        assert_eq!(rc.release(frame), 0, "release never underflows");
    }

    #[test]
    fn fault_code_decodes_hardware_bits() {
        let code = FaultCode::from_bits_truncate(0b111);
        assert!(code.contains(FaultCode::PROTECTION));
        assert!(code.contains(FaultCode::WRITE));
        assert!(code.contains(FaultCode::USER));
        assert!(!code.contains(FaultCode::RESERVED));
    }

    #[test]
    fn shared_pte_gets_a_private_copy() {
        let arena = TestArena::new(16);
        let mut pool = TestPool::new(16);
        let page_frame = pool.alloc_frame().expect("page frame");

        PageMapper::new(&arena, &mut pool)
            .map(page_frame, USER_PAGE, user_flags())
            .expect("map user page");

        // Fill the shared page with a recognizable pattern.
        unsafe {
            core::ptr::write_bytes(arena.page(USER_PAGE), 0xAB, FRAME_SIZE);
        }

        // Fork-style sharing: two spaces reference the frame.
        let mut rc = CowRefCounts::new(32);
        rc.retain(page_frame);
        rc.retain(page_frame);
        unsafe {
            (*arena.table(directory_index(USER_PAGE)))
                .entry_mut(table_index(USER_PAGE))
                .mark_cloned();
        }

        let recovered =
            recover_cow(USER_PAGE, &arena, &mut pool, &mut rc, SCRATCH).expect("recover");
        assert!(recovered);

        let pte =
            unsafe { (*arena.table(directory_index(USER_PAGE))).entry(table_index(USER_PAGE)) };
        assert_ne!(pte.frame(), page_frame, "page was copied");
        assert!(pte.flags().contains(PageFlags::WRITABLE));
        assert!(!pte.flags().contains(PageFlags::CLONED));
        assert_eq!(rc.count(page_frame), 1, "one reference released");

        // The copy carries the original bytes.
        let copied = unsafe { *arena.page(USER_PAGE) };
        assert_eq!(copied, 0xAB);
    }

    #[test]
    fn last_reference_is_made_private_without_copying() {
        let arena = TestArena::new(16);
        let mut pool = TestPool::new(16);
        let page_frame = pool.alloc_frame().expect("page frame");

        PageMapper::new(&arena, &mut pool)
            .map(page_frame, USER_PAGE, user_flags())
            .expect("map");

        let mut rc = CowRefCounts::new(32);
        rc.retain(page_frame);
        unsafe {
            (*arena.table(directory_index(USER_PAGE)))
                .entry_mut(table_index(USER_PAGE))
                .mark_cloned();
        }

        let allocated_before = pool.next;
        let recovered =
            recover_cow(USER_PAGE, &arena, &mut pool, &mut rc, SCRATCH).expect("recover");
        assert!(recovered);
        assert_eq!(pool.next, allocated_before, "no frame allocated");

        let pte =
            unsafe { (*arena.table(directory_index(USER_PAGE))).entry(table_index(USER_PAGE)) };
        assert_eq!(pte.frame(), page_frame);
        assert!(pte.flags().contains(PageFlags::WRITABLE));
    }

    #[test]
    fn cloned_directory_entry_duplicates_the_table() {
        let arena = TestArena::new(16);
        let mut pool = TestPool::new(16);
        let page_frame = pool.alloc_frame().expect("page frame");

        PageMapper::new(&arena, &mut pool)
            .map(page_frame, USER_PAGE, user_flags())
            .expect("map");

        let d = directory_index(USER_PAGE);
        let old_table = arena.dir.entry(d).frame();
        let mut rc = CowRefCounts::new(32);
        rc.retain(page_frame);
        rc.retain(page_frame);
        unsafe {
            (*arena.table(d))
                .entry_mut(table_index(USER_PAGE))
                .mark_cloned();
            (*arena.directory()).entry_mut(d).mark_cloned();
        }

        let recovered =
            recover_cow(USER_PAGE, &arena, &mut pool, &mut rc, SCRATCH).expect("recover");
        assert!(recovered);

        let pde = arena.dir.entry(d);
        assert_ne!(pde.frame(), old_table, "table was duplicated");
        assert!(pde.flags().contains(PageFlags::WRITABLE));
        assert!(!pde.flags().contains(PageFlags::CLONED));
    }

    #[test]
    fn non_cloned_faults_are_not_recovered() {
        let arena = TestArena::new(16);
        let mut pool = TestPool::new(16);
        let page_frame = pool.alloc_frame().expect("page frame");
        PageMapper::new(&arena, &mut pool)
            .map(page_frame, USER_PAGE, user_flags())
            .expect("map");

        let mut rc = CowRefCounts::new(32);
        let recovered =
            recover_cow(USER_PAGE, &arena, &mut pool, &mut rc, SCRATCH).expect("no error");
        assert!(!recovered, "plain writable page is not a COW fault");

        let recovered = recover_cow(
            VirtualAddress::new(0x7FC0_0000),
            &arena,
            &mut pool,
            &mut rc,
            SCRATCH,
        )
        .expect("no error");
        assert!(!recovered, "unmapped region is not recoverable");
    }
}
