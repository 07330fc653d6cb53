//! Physical frame allocator.
//!
//! One bit per 4 KiB frame, stored in a bitmap that itself lives in the
//! first firmware-reported region large enough to hold it. The allocator is
//! the single source of truth for physical memory: every frame the kernel
//! ever touches is either below the identity-mapped region or came out of
//! here.
//!
//! Invariants maintained from initialization onward:
//! - frame 0 is permanently taken (the null physical address is never
//!   handed out),
//! - the bitmap's own frames are taken,
//! - every non-available memory-map record, and every *gap* between
//!   consecutive records, is taken.

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::{align_down, align_up, MemoryRegion, PhysicalAddress, FRAME_SIZE},
};

/// Where the bitmap will live and how much it covers. Computed without
/// touching memory so placement decisions are testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapPlacement {
    /// Number of frames tracked (one bit each).
    pub bits: u32,
    /// Bytes of storage the bitmap needs.
    pub bytes: u32,
    /// Frame-aligned physical address chosen for the storage.
    pub base: u32,
}

pub struct FrameAllocator {
    /// Bitmap storage; set bits are taken frames.
    bitmap: *mut u8,
    /// Number of frames tracked.
    bits: u32,
    /// Physical address of the storage (for the self-marking invariant).
    bitmap_base: u32,
}

// SAFETY: the allocator is only reachable through the global mutex, and the
// bitmap storage it points at is exclusively ours from init onward.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: core::ptr::null_mut(),
            bits: 0,
            bitmap_base: 0,
        }
    }

    /// Decide the bitmap size and placement from the firmware memory map.
    ///
    /// The bitmap covers everything up to the highest address any available
    /// record reaches, and is placed at the start (aligned up) of the first
    /// available record with enough contiguous room.
    pub fn plan(
        regions: impl Iterator<Item = MemoryRegion> + Clone,
    ) -> KernelResult<BitmapPlacement> {
        let frame = FRAME_SIZE as u32;

        let max = regions
            .clone()
            .filter(|r| r.available)
            .map(|r| r.end())
            .max()
            .unwrap_or(0);
        if max == 0 {
            return Err(KernelError::OutOfMemory);
        }

        let bits = max / frame;
        let bytes = bits.div_ceil(8);
        let storage_frames = bytes.div_ceil(frame);

        for region in regions.filter(|r| r.available) {
            let base = align_up(region.base, frame);
            let end = align_down(region.end(), frame);
            if end > base && (end - base) / frame >= storage_frames {
                return Ok(BitmapPlacement { bits, bytes, base });
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Populate the allocator over `storage`, which must provide
    /// `plan.bytes` writable bytes representing the memory at `plan.base`.
    ///
    /// # Safety
    ///
    /// `storage` must be valid for writes of `plan.bytes` bytes and must not
    /// alias any frame the allocator will hand out.
    pub unsafe fn init_with_storage(
        &mut self,
        plan: BitmapPlacement,
        storage: *mut u8,
        regions: impl Iterator<Item = MemoryRegion>,
    ) -> u32 {
        let frame = FRAME_SIZE as u32;
        let max = plan.bits * frame;

        self.bitmap = storage;
        self.bits = plan.bits;
        self.bitmap_base = plan.base;

        // SAFETY: caller guarantees `plan.bytes` writable bytes.
        unsafe { core::ptr::write_bytes(storage, 0, plan.bytes as usize) };

        // The bitmap's own frames can never be allocated.
        let storage_frames = plan.bytes.div_ceil(frame);
        for i in 0..storage_frames {
            self.set_bit(plan.base / frame + i);
        }

        // Reserved records and un-enumerated gaps are taken. `expected`
        // tracks where the previous record ended; anything the firmware
        // skipped over is not RAM we may use.
        let mut expected: u32 = 0;
        for region in regions {
            if region.base >= max {
                break;
            }
            if region.base > expected {
                let mut gap = align_down(expected, frame);
                while gap < region.base {
                    self.set_bit(gap / frame);
                    gap += frame;
                }
            }
            if !region.available && region.end() < max {
                let mut addr = align_down(region.base, frame);
                while addr < region.end() {
                    self.set_bit(addr / frame);
                    addr += frame;
                }
            }
            expected = region.end();
        }

        // Frame 0 doubles as the failure sentinel.
        self.set_bit(0);

        max
    }

    /// Bring up the allocator on real physical memory: the storage is the
    /// planned physical address itself (identity addressing; paging is not
    /// on yet).
    ///
    /// # Safety
    ///
    /// Must run before paging is enabled, with the memory map describing
    /// real RAM. Returns the highest managed address.
    pub unsafe fn init(
        &mut self,
        regions: impl Iterator<Item = MemoryRegion> + Clone,
    ) -> KernelResult<u32> {
        let plan = Self::plan(regions.clone())?;
        // SAFETY: the planned base points at available RAM not yet handed
        // out to anyone, and identity addressing is in effect.
        Ok(unsafe { self.init_with_storage(plan, plan.base as usize as *mut u8, regions) })
    }

    /// Number of frames under management.
    pub fn frame_count(&self) -> u32 {
        self.bits
    }

    /// First-fit single frame allocation.
    pub fn alloc_first(&mut self) -> KernelResult<PhysicalAddress> {
        for i in 1..self.bits {
            if !self.bit(i) {
                self.set_bit(i);
                return Ok(PhysicalAddress::new(i * FRAME_SIZE as u32));
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// First run of `n` consecutive free frames, earliest start wins.
    pub fn alloc_first_n(&mut self, n: u32) -> KernelResult<PhysicalAddress> {
        if n == 0 {
            return Err(KernelError::InvalidArgument { what: "n == 0" });
        }
        let mut found = 0;
        for i in 1..self.bits {
            if self.bit(i) {
                found = 0;
                continue;
            }
            found += 1;
            if found == n {
                let start = i - (n - 1);
                for j in start..=i {
                    self.set_bit(j);
                }
                return Ok(PhysicalAddress::new(start * FRAME_SIZE as u32));
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Release a frame. The address is aligned down; freeing an already
    /// free frame is a no-op.
    pub fn free(&mut self, addr: PhysicalAddress) {
        let index = addr.frame_index();
        if index > 0 && index < self.bits {
            self.clear_bit(index);
        }
    }

    /// Mark `[start, end)` taken, aligning start down and end up.
    /// Idempotent.
    pub fn mark_taken(&mut self, start: u32, end: u32) {
        let frame = FRAME_SIZE as u32;
        let first = align_down(start, frame) / frame;
        let last = align_up(end, frame) / frame;
        for i in first..last.min(self.bits) {
            self.set_bit(i);
        }
    }

    pub fn is_taken(&self, frame_index: u32) -> bool {
        self.bit(frame_index)
    }

    fn bit(&self, index: u32) -> bool {
        debug_assert!(index < self.bits);
        // SAFETY: index is below `bits`, so the byte is inside the storage.
        unsafe { *self.bitmap.add(index as usize / 8) & (1 << (index % 8)) != 0 }
    }

    fn set_bit(&mut self, index: u32) {
        if index >= self.bits {
            return;
        }
        // SAFETY: bounds-checked above.
        unsafe { *self.bitmap.add(index as usize / 8) |= 1 << (index % 8) };
    }

    fn clear_bit(&mut self, index: u32) {
        debug_assert!(index < self.bits);
        // SAFETY: bounds-checked by the caller.
        unsafe { *self.bitmap.add(index as usize / 8) &= !(1 << (index % 8)) };
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The system frame allocator. Shared by every CPU; all access goes through
/// the mutex.
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::{vec, vec::Vec};

    const MIB: u32 = 0x10_0000;

    /// A 64 MiB machine: low megabyte reserved, the rest available,
    /// kernel at [1 MiB, 2 MiB).
    fn boot_64mib() -> Vec<MemoryRegion> {
        vec![
            MemoryRegion {
                base: 0,
                length: MIB,
                available: false,
            },
            MemoryRegion {
                base: MIB,
                length: 63 * MIB,
                available: true,
            },
        ]
    }

    fn init_allocator(regions: &[MemoryRegion]) -> (FrameAllocator, Vec<u8>, u32) {
        let plan = FrameAllocator::plan(regions.iter().copied()).expect("plan should succeed");
        let mut storage = vec![0u8; plan.bytes as usize];
        let mut alloc = FrameAllocator::new();
        let max = unsafe {
            alloc.init_with_storage(plan, storage.as_mut_ptr(), regions.iter().copied())
        };
        (alloc, storage, max)
    }

    #[test]
    fn plan_places_bitmap_in_first_available_region() {
        let plan = FrameAllocator::plan(boot_64mib().into_iter()).expect("plan");
        assert_eq!(plan.bits, 64 * MIB / 4096);
        assert_eq!(plan.bytes, 2048);
        assert_eq!(plan.base, MIB);
    }

    #[test]
    fn boot_scenario_marks_the_right_frames() {
        let regions = boot_64mib();
        let (mut alloc, _storage, max) = init_allocator(&regions);
        assert_eq!(max, 64 * MIB);

        // Kernel span is marked by the caller, as at boot.
        alloc.mark_taken(MIB, 2 * MIB);

        assert!(alloc.is_taken(0));
        assert!(alloc.is_taken(256), "kernel frame at 1 MiB");
        assert!(!alloc.is_taken(1024), "frame at 4 MiB is free");

        let first = alloc.alloc_first().expect("memory available");
        assert!(first.as_u32() >= 2 * MIB && first.as_u32() < 4 * MIB);
    }

    #[test]
    fn reserved_records_and_gaps_are_taken() {
        // A hole between 2 MiB and 3 MiB that the firmware never described.
        let regions = vec![
            MemoryRegion {
                base: 0,
                length: MIB,
                available: false,
            },
            MemoryRegion {
                base: MIB,
                length: MIB,
                available: true,
            },
            MemoryRegion {
                base: 3 * MIB,
                length: 13 * MIB,
                available: true,
            },
        ];
        let (alloc, _storage, _) = init_allocator(&regions);
        assert!(alloc.is_taken(0), "reserved low memory");
        assert!(alloc.is_taken(2 * MIB / 4096), "gap frame");
        assert!(alloc.is_taken((3 * MIB - 4096) / 4096), "last gap frame");
        assert!(!alloc.is_taken(3 * MIB / 4096 + 1));
    }

    #[test]
    fn alloc_free_realloc_returns_the_same_frame() {
        let regions = boot_64mib();
        let (mut alloc, _storage, _) = init_allocator(&regions);
        let a = alloc.alloc_first().expect("first alloc");
        alloc.free(a);
        let b = alloc.alloc_first().expect("realloc");
        assert_eq!(a, b);
    }

    #[test]
    fn free_is_idempotent_and_aligns_down() {
        let regions = boot_64mib();
        let (mut alloc, _storage, _) = init_allocator(&regions);
        let a = alloc.alloc_first().expect("alloc");
        // Free through an interior address; second free is a no-op.
        alloc.free(PhysicalAddress::new(a.as_u32() + 123));
        assert!(!alloc.is_taken(a.frame_index()));
        alloc.free(a);
        assert!(!alloc.is_taken(a.frame_index()));
    }

    #[test]
    fn mark_taken_is_idempotent() {
        let regions = boot_64mib();
        let (mut alloc, storage, _) = init_allocator(&regions);
        alloc.mark_taken(5 * MIB, 6 * MIB);
        let snapshot = storage.clone();
        alloc.mark_taken(5 * MIB, 6 * MIB);
        assert_eq!(snapshot, storage);
    }

    #[test]
    fn alloc_first_n_finds_runs_and_respects_boundaries() {
        let regions = boot_64mib();
        let (mut alloc, _storage, _) = init_allocator(&regions);

        let run = alloc.alloc_first_n(4).expect("run of 4");
        for i in 0..4 {
            assert!(alloc.is_taken(run.frame_index() + i));
        }

        // Leave exactly one free frame at the top of managed memory.
        alloc.mark_taken(0, 64 * MIB - 4096);
        assert_eq!(
            alloc.alloc_first_n(2).expect_err("no run of 2 left"),
            KernelError::OutOfMemory
        );
        let last = alloc.alloc_first_n(1).expect("single top frame");
        assert_eq!(last.as_u32(), 64 * MIB - 4096);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let regions = boot_64mib();
        let (mut alloc, _storage, _) = init_allocator(&regions);
        alloc.mark_taken(0, 64 * MIB);
        assert_eq!(
            alloc.alloc_first().expect_err("everything taken"),
            KernelError::OutOfMemory
        );
    }
}
