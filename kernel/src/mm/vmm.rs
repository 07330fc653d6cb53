//! Virtual memory manager.
//!
//! Owns the kernel page directory and the recursive self-map. Slot 1023 of
//! every directory points back at the directory's own frame, which makes
//! the directory visible at [`layout::PAGEDIR_VIRT`] and page table `i`
//! visible at `layout::PAGEDIR_WINDOW + i * 4096` while that directory is
//! active.
//!
//! The mapping algorithms are written against two small seams,
//! [`TableResolver`] for "where do I touch table N" and
//! [`page_table::FramePool`] for frame allocation, so the recursive-window
//! address arithmetic stays in one place and the algorithms themselves run
//! under the host test harness.

use crate::{
    error::{KernelError, KernelResult},
    layout,
    mm::{
        page_table::{
            directory_index, table_index, FramePool, PageFlags, PageTable, PageTableEntry,
            ENTRIES_PER_TABLE,
        },
        PhysicalAddress, VirtualAddress, FRAME_SIZE,
    },
};

/// Resolves paging structures to dereferenceable pointers.
///
/// The bare-metal implementation is [`RecursiveWindow`]; tests provide an
/// arena that owns its tables outright.
pub trait TableResolver {
    /// The active page directory.
    fn directory(&self) -> *mut PageTable;

    /// The page table installed in directory slot `index`. Only valid while
    /// that slot is present.
    fn table(&self, index: usize) -> *mut PageTable;

    /// A pointer through which the (mapped) virtual page at `virt` can be
    /// read and written.
    fn page(&self, virt: VirtualAddress) -> *mut u8;

    /// Drop any cached translation for the view of table `index`. Only
    /// meaningful where a TLB exists.
    fn invalidate_table_view(&self, _index: usize) {}
}

/// The recursive self-map views of the *current* directory. All the unsafe
/// address arithmetic for slot 1023 lives here and nowhere else.
pub struct RecursiveWindow;

impl TableResolver for RecursiveWindow {
    fn directory(&self) -> *mut PageTable {
        layout::PAGEDIR_VIRT as usize as *mut PageTable
    }

    fn table(&self, index: usize) -> *mut PageTable {
        debug_assert!(index < ENTRIES_PER_TABLE);
        (layout::PAGEDIR_WINDOW as usize + index * FRAME_SIZE) as *mut PageTable
    }

    fn page(&self, virt: VirtualAddress) -> *mut u8 {
        virt.as_u32() as usize as *mut u8
    }

    fn invalidate_table_view(&self, _index: usize) {
        #[cfg(target_arch = "x86")]
        crate::arch::x86::mmu::flush_tlb_entry(
            layout::PAGEDIR_WINDOW + _index as u32 * FRAME_SIZE as u32,
        );
    }
}

/// Mapping operations over one address space.
pub struct PageMapper<'a, R: TableResolver, P: FramePool> {
    resolver: &'a R,
    pool: &'a mut P,
}

impl<'a, R: TableResolver, P: FramePool> PageMapper<'a, R, P> {
    pub fn new(resolver: &'a R, pool: &'a mut P) -> Self {
        Self { resolver, pool }
    }

    /// Install `virt -> phys`. Allocates the covering page table on demand;
    /// refuses to touch a page that is already present.
    pub fn map(
        &mut self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let d = directory_index(virt);
        let p = table_index(virt);

        // SAFETY: the resolver contract says these pointers are valid views
        // of the active directory and (once present) its tables.
        let dir = unsafe { &mut *self.resolver.directory() };

        if dir.entry(d).is_present() {
            let table = unsafe { &mut *self.resolver.table(d) };
            if table.entry(p).is_present() {
                return Err(KernelError::PageInUse {
                    virt: virt.as_u32(),
                });
            }
            table.entry_mut(p).set(phys, flags | PageFlags::PRESENT);
        } else {
            let table_frame = self.pool.alloc_frame()?;
            let mut pde_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
            if flags.contains(PageFlags::USER) {
                pde_flags |= PageFlags::USER;
            }
            dir.entry_mut(d).set(table_frame, pde_flags);
            self.resolver.invalidate_table_view(d);

            let table = unsafe { &mut *self.resolver.table(d) };
            table.zero();
            table.entry_mut(p).set(phys, flags | PageFlags::PRESENT);
        }
        Ok(())
    }

    /// Remove the mapping for `virt`. Frees the covering table once its
    /// last entry goes away. The caller flushes the TLB.
    pub fn unmap(&mut self, virt: VirtualAddress) -> KernelResult<()> {
        let d = directory_index(virt);
        let p = table_index(virt);

        // SAFETY: resolver contract, as in `map`.
        let dir = unsafe { &mut *self.resolver.directory() };
        if !dir.entry(d).is_present() {
            return Err(KernelError::NoDirEntry {
                virt: virt.as_u32(),
            });
        }

        let table = unsafe { &mut *self.resolver.table(d) };
        table.entry_mut(p).clear();

        if table.is_empty() {
            self.pool.free_frame(dir.entry(d).frame());
            dir.entry_mut(d).clear();
            self.resolver.invalidate_table_view(d);
        }
        Ok(())
    }

    /// Build a fresh address space: a new directory frame carrying the
    /// current directory's mappings, self-mapped at slot 1023. `scratch` is
    /// a kernel virtual page used transiently to reach the new frame;
    /// returns the directory's physical address. Switching is separate.
    pub fn create_address_space(
        &mut self,
        scratch: VirtualAddress,
    ) -> KernelResult<PhysicalAddress> {
        let dir_frame = self.pool.alloc_frame()?;
        self.map(dir_frame, scratch, PageFlags::WRITABLE)?;

        // SAFETY: scratch was just mapped to the fresh frame.
        let new_dir = unsafe { &mut *(self.resolver.page(scratch) as *mut PageTable) };
        new_dir.zero();

        // SAFETY: resolver contract; the current directory is active.
        let cur_dir = unsafe { &*self.resolver.directory() };
        for i in 0..ENTRIES_PER_TABLE - 1 {
            *new_dir.entry_mut(i) = cur_dir.entry(i);
        }
        // The slot covering the scratch window holds only transient
        // mappings; a copy of it would go stale the moment scratch is
        // unmapped below.
        new_dir.entry_mut(directory_index(scratch)).clear();
        *new_dir.entry_mut(ENTRIES_PER_TABLE - 1) =
            PageTableEntry::new(dir_frame, PageFlags::PRESENT | PageFlags::WRITABLE);

        self.unmap(scratch)?;
        Ok(dir_frame)
    }

    /// Copy-on-write marking for fork: every present, writable, user-level
    /// PTE in the current space is downgraded to CLONED + read-only and the
    /// covering directory entries of both parent and child are downgraded
    /// the same way. Kernel mappings (non-USER) stay shared and untouched.
    ///
    /// `retain_frame(frame, newly_cloned)` is invoked for every shared
    /// frame so the caller can keep refcounts: a newly cloned frame gains
    /// two referencing spaces at once (parent and child), an already-cloned
    /// one gains only the child.
    ///
    /// `child_dir_scratch` must already map the child directory frame.
    pub fn clone_address_space<F>(
        &mut self,
        child_dir_scratch: VirtualAddress,
        mut retain_frame: F,
    ) where
        F: FnMut(PhysicalAddress, bool),
    {
        // SAFETY: resolver contract; caller mapped the child directory at
        // the scratch page.
        let cur_dir = unsafe { &mut *self.resolver.directory() };
        let child_dir =
            unsafe { &mut *(self.resolver.page(child_dir_scratch) as *mut PageTable) };

        for d in 0..ENTRIES_PER_TABLE - 1 {
            let pde = cur_dir.entry(d);
            if !pde.is_present() || !pde.flags().contains(PageFlags::USER) {
                continue;
            }
            // SAFETY: the PDE is present, so the table view is valid.
            let table = unsafe { &mut *self.resolver.table(d) };
            for p in 0..ENTRIES_PER_TABLE {
                let pte = table.entry(p);
                if !pte.is_present() || !pte.flags().contains(PageFlags::USER) {
                    continue;
                }
                if pte.flags().contains(PageFlags::WRITABLE) {
                    table.entry_mut(p).mark_cloned();
                    retain_frame(pte.frame(), true);
                } else if pte.flags().contains(PageFlags::CLONED) {
                    retain_frame(pte.frame(), false);
                }
            }
            if pde.flags().contains(PageFlags::WRITABLE) {
                cur_dir.entry_mut(d).mark_cloned();
            }
            *child_dir.entry_mut(d) = cur_dir.entry(d);
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel address-space bring-up and the global mapping API
// ---------------------------------------------------------------------------

use core::sync::atomic::{AtomicU32, Ordering};

/// Physical address of the kernel page directory.
static KERNEL_PDIR: AtomicU32 = AtomicU32::new(0);

/// Physical address of the directory currently loaded on this CPU.
/// (Shared across CPUs; see DESIGN.md on the SMP gap.)
static CURRENT_PDIR: AtomicU32 = AtomicU32::new(0);

/// The kernel directory's physical address, for the AP trampoline and for
/// new address spaces.
pub fn kernel_directory() -> PhysicalAddress {
    PhysicalAddress::new(KERNEL_PDIR.load(Ordering::Acquire))
}

pub fn current_directory() -> PhysicalAddress {
    PhysicalAddress::new(CURRENT_PDIR.load(Ordering::Acquire))
}

/// Build the kernel page tables and switch paging on.
///
/// Layout afterwards: entry 0 identity-maps [0, 4 MiB) with one PTE
/// repointed at the local APIC MMIO frame, entry 1023 recurses into the
/// directory itself. Frames the allocator reports taken are mapped present;
/// the rest stay not-present so stray identity dereferences fault.
///
/// # Safety
///
/// Must run exactly once on the boot CPU, before any address above 4 MiB is
/// touched, with the frame allocator initialized.
#[cfg(target_arch = "x86")]
pub unsafe fn init() -> KernelResult<()> {
    use crate::arch::x86::{isr, lapic, mmu};
    use crate::mm::frame_allocator::FRAME_ALLOCATOR;

    let mut pmm = FRAME_ALLOCATOR.lock();

    let dir_frame = pmm.alloc_first()?;
    let table_frame = pmm.alloc_first()?;

    // Paging is off; physical addresses are the pointers.
    // SAFETY: both frames came from the allocator and are below 4 MiB on
    // any machine this kernel boots on (first-fit from the bottom).
    let dir = unsafe { &mut *(dir_frame.as_u32() as usize as *mut PageTable) };
    let table = unsafe { &mut *(table_frame.as_u32() as usize as *mut PageTable) };
    dir.zero();
    table.zero();

    let tracked = pmm.frame_count();
    for i in 0..ENTRIES_PER_TABLE {
        let phys = PhysicalAddress::new((i * FRAME_SIZE) as u32);
        let mut flags = PageFlags::WRITABLE;
        if (i as u32) < tracked && pmm.is_taken(i as u32) {
            flags |= PageFlags::PRESENT;
        }
        table.entry_mut(i).set(phys, flags);
    }

    // The LAPIC alias: one identity slot repointed at MMIO, uncached.
    let lapic_slot = table_index(VirtualAddress::new(layout::LAPIC_VIRT_ADDR));
    table.entry_mut(lapic_slot).set(
        PhysicalAddress::new(layout::LAPIC_PHYS_ADDR),
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::CACHE_DISABLE,
    );

    dir.entry_mut(0)
        .set(table_frame, PageFlags::PRESENT | PageFlags::WRITABLE);
    dir.entry_mut(ENTRIES_PER_TABLE - 1)
        .set(dir_frame, PageFlags::PRESENT | PageFlags::WRITABLE);

    drop(pmm);

    isr::register_interrupt_handler(
        crate::arch::x86::isr::VECTOR_PAGE_FAULT,
        super::page_fault::handle_page_fault,
    );

    KERNEL_PDIR.store(dir_frame.as_u32(), Ordering::Release);
    CURRENT_PDIR.store(dir_frame.as_u32(), Ordering::Release);

    // From here the LAPIC must be reached through its high alias.
    lapic::relocate(VirtualAddress::new(layout::LAPIC_VIRT_ADDR));

    // SAFETY: the tables above identity-map everything the kernel is
    // currently executing from.
    unsafe {
        mmu::write_cr3(dir_frame);
        mmu::enable_paging();
    }
    Ok(())
}

/// Map one page in the active address space.
pub fn map(phys: PhysicalAddress, virt: VirtualAddress, flags: PageFlags) -> KernelResult<()> {
    let mut pmm = super::frame_allocator::FRAME_ALLOCATOR.lock();
    PageMapper::new(&RecursiveWindow, &mut *pmm).map(phys, virt, flags)
}

/// Unmap one page in the active address space and invalidate its TLB entry
/// on this CPU.
pub fn unmap(virt: VirtualAddress) -> KernelResult<()> {
    let mut pmm = super::frame_allocator::FRAME_ALLOCATOR.lock();
    PageMapper::new(&RecursiveWindow, &mut *pmm).unmap(virt)?;
    drop(pmm);
    #[cfg(target_arch = "x86")]
    crate::arch::x86::mmu::flush_tlb_entry(virt.as_u32());
    Ok(())
}

/// Create a fresh address space sharing the kernel mappings.
pub fn create_address_space(scratch: VirtualAddress) -> KernelResult<PhysicalAddress> {
    let mut pmm = super::frame_allocator::FRAME_ALLOCATOR.lock();
    PageMapper::new(&RecursiveWindow, &mut *pmm).create_address_space(scratch)
}

/// Load a new page directory. The TLB is flushed by the hardware as part
/// of the CR3 write.
pub fn switch_pdir(dir: PhysicalAddress) {
    CURRENT_PDIR.store(dir.as_u32(), Ordering::Release);
    #[cfg(target_arch = "x86")]
    // SAFETY: callers hand in a directory built by `create_address_space`
    // or `init`, which always carries the kernel mappings.
    unsafe {
        crate::arch::x86::mmu::write_cr3(dir)
    };
}
