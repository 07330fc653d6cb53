//! PID allocation.
//!
//! A bitmap of in-use PIDs sized by `config::PROC_MAX_PID`. Freed PIDs are
//! reusable, so long-running systems do not walk off the end of the space
//! the way a bump counter would. PID 0 is reserved as "no process".

use crate::{
    config::PROC_MAX_PID,
    error::{KernelError, KernelResult},
    process::pcb::Pid,
};

pub struct PidAllocator {
    bitmap: [u8; (PROC_MAX_PID as usize).div_ceil(8)],
}

impl PidAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; (PROC_MAX_PID as usize).div_ceil(8)],
        }
    }

    fn bit(&self, pid: u32) -> bool {
        self.bitmap[pid as usize / 8] & (1 << (pid % 8)) != 0
    }

    fn set_bit(&mut self, pid: u32) {
        self.bitmap[pid as usize / 8] |= 1 << (pid % 8);
    }

    fn clear_bit(&mut self, pid: u32) {
        self.bitmap[pid as usize / 8] &= !(1 << (pid % 8));
    }

    /// Lowest unused PID, starting from 1.
    pub fn alloc(&mut self) -> KernelResult<Pid> {
        for pid in 1..PROC_MAX_PID {
            if !self.bit(pid) {
                self.set_bit(pid);
                return Ok(Pid(pid));
            }
        }
        Err(KernelError::PidExhausted)
    }

    /// Return a PID to the pool. Freeing a free PID is a no-op.
    pub fn free(&mut self, pid: Pid) {
        if pid.0 > 0 && pid.0 < PROC_MAX_PID {
            self.clear_bit(pid.0);
        }
    }

    pub fn is_used(&self, pid: Pid) -> bool {
        pid.0 < PROC_MAX_PID && self.bit(pid.0)
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn pids_start_at_one_and_ascend() {
        let mut pids = PidAllocator::new();
        assert_eq!(pids.alloc().expect("pid 1"), Pid(1));
        assert_eq!(pids.alloc().expect("pid 2"), Pid(2));
        assert_eq!(pids.alloc().expect("pid 3"), Pid(3));
    }

    #[test]
    fn freed_pids_are_reused_lowest_first() {
        let mut pids = PidAllocator::new();
        let a = pids.alloc().expect("a");
        let _b = pids.alloc().expect("b");
        pids.free(a);
        assert!(!pids.is_used(a));
        assert_eq!(pids.alloc().expect("a again"), a);
    }

    #[test]
    fn exhaustion_is_reported_not_fatal() {
        let mut pids = PidAllocator::new();
        for _ in 1..PROC_MAX_PID {
            pids.alloc().expect("fill the space");
        }
        assert_eq!(
            pids.alloc().expect_err("space is full"),
            KernelError::PidExhausted
        );
    }

    #[test]
    fn pid_zero_is_never_handed_out() {
        let mut pids = PidAllocator::new();
        assert!(!pids.is_used(Pid(0)));
        assert_eq!(pids.alloc().expect("first"), Pid(1));
        pids.free(Pid(0));
        assert_eq!(pids.alloc().expect("second"), Pid(2));
    }
}
