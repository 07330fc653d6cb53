//! Synchronization primitives.
//!
//! One coarse spinlock per shared subsystem, ordered to rule out deadlock.
//! Per-CPU state (descriptor tables, the interrupt-nesting counter) is
//! CPU-owned and needs no lock.

pub mod spinlock;

pub use spinlock::{LockResource, SpinLock, SpinLockGuard};
