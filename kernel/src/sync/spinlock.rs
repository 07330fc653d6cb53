//! Ordered spinlocks with interrupt discipline.
//!
//! Every lockable subsystem has a fixed place in [`LockResource`]. A CPU may
//! acquire lock `B` while holding `A` only when `B`'s id is greater than
//! `A`'s; the ordering is a convention checked at runtime in debug builds.
//!
//! Acquisition disables interrupts on the calling CPU and release restores
//! them only on the outermost release, so lock-protected sections are also
//! interrupt-free. The nesting counter and the saved interrupt flag are
//! per-CPU; taking a lock is the only suspension point kernel code is
//! allowed besides the timer interrupt itself.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering},
};

use crate::config::MAX_CPUS;

/// Every shared resource the kernel locks, in acquisition order. Trying to
/// take a lower-numbered lock while holding a higher-numbered one is fatal.
///
/// Informal placement rules (inherited with the taxonomy): resources close
/// to system entry points go first, leaf resources that never take further
/// locks (console, heap) go last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockResource {
    Process = 0,
    Vfs = 1,
    Ata = 2,
    Console = 3,
    Heap = 4,
}

/// Per-CPU interrupt-nesting bookkeeping.
///
/// `ncli` counts outstanding disables; `int_enabled` remembers whether
/// interrupts were on when the first disable happened; `held` is a bitmask
/// of [`LockResource`] ids this CPU currently holds, used by the debug
/// ordering check.
struct CpuLockState {
    ncli: AtomicI32,
    int_enabled: AtomicBool,
    held: AtomicU8,
}

impl CpuLockState {
    const fn new() -> Self {
        Self {
            ncli: AtomicI32::new(0),
            int_enabled: AtomicBool::new(false),
            held: AtomicU8::new(0),
        }
    }
}

/// One slot per CPU on the real machine. The host test harness runs many
/// threads at once, so it gets enough slots for each test thread to have
/// its own nesting state.
const LOCK_SLOTS: usize = if cfg!(target_arch = "x86") { MAX_CPUS } else { 64 };

static CPU_LOCK_STATE: [CpuLockState; LOCK_SLOTS] = [const { CpuLockState::new() }; LOCK_SLOTS];

fn cpu_index() -> usize {
    #[cfg(target_arch = "x86")]
    {
        crate::arch::x86::smp::current_cpu_index()
    }
    #[cfg(not(target_arch = "x86"))]
    {
        use core::sync::atomic::AtomicUsize;

        static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);
        std::thread_local! {
            static SLOT: usize = NEXT_SLOT.fetch_add(1, Ordering::Relaxed) % LOCK_SLOTS;
        }
        SLOT.with(|slot| *slot)
    }
}

/// EFLAGS.IF: interrupts enabled.
#[cfg(target_arch = "x86")]
const EFLAGS_IF: u32 = 1 << 9;

/// Disable interrupts, returning whether they were enabled beforehand.
fn irq_save_and_disable() -> bool {
    #[cfg(target_arch = "x86")]
    {
        let flags: u32;
        // SAFETY: reading EFLAGS off the stack and masking interrupts on
        // the local CPU are always sound; the matching pop restores the
        // prior state.
        unsafe {
            core::arch::asm!("pushfd", "pop {}", out(reg) flags, options(preserves_flags));
            x86::irq::disable();
        }
        flags & EFLAGS_IF != 0
    }
    #[cfg(not(target_arch = "x86"))]
    {
        true
    }
}

fn irq_enable() {
    #[cfg(target_arch = "x86")]
    // SAFETY: only reached on the outermost release, when the saved state
    // says interrupts were enabled before the first disable.
    unsafe {
        x86::irq::enable()
    };
}

/// First half of the xv6 discipline: disable interrupts and remember the
/// prior state on the outermost call.
pub fn push_cli() {
    let was_enabled = irq_save_and_disable();
    let state = &CPU_LOCK_STATE[cpu_index()];
    if state.ncli.load(Ordering::Relaxed) == 0 {
        state.int_enabled.store(was_enabled, Ordering::Relaxed);
    }
    state.ncli.fetch_add(1, Ordering::Relaxed);
}

/// Second half: re-enable interrupts only when the outermost disable is
/// popped and they were enabled to begin with.
pub fn pop_cli() {
    let state = &CPU_LOCK_STATE[cpu_index()];
    let prev = state.ncli.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev > 0, "pop_cli without matching push_cli");
    if prev == 1 && state.int_enabled.load(Ordering::Relaxed) {
        irq_enable();
    }
}

/// A spinlock guarding one [`LockResource`].
///
/// The lock owns nothing except its word and id; the data it guards lives in
/// the embedded cell and is reachable only through the RAII guard.
pub struct SpinLock<T> {
    resource: LockResource,
    locked: AtomicU32,
    /// Holding CPU index + 1, or 0 when free. Diagnostic only.
    owner: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the lock word serializes all access to the cell, and the guard
// borrows the lock, so the contained value moves between CPUs only while
// the lock is held.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(resource: LockResource, data: T) -> Self {
        Self {
            resource,
            locked: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Which resource this lock guards.
    pub fn resource(&self) -> LockResource {
        self.resource
    }

    /// CPU currently holding the lock, if any. Diagnostic only; the answer
    /// can be stale by the time the caller looks at it.
    pub fn holder(&self) -> Option<usize> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    /// Acquire the lock, spinning until it is free. Interrupts stay off on
    /// this CPU until the returned guard (and every enclosing one) drops.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let id = self.resource as u8;
        let state = &CPU_LOCK_STATE[cpu_index()];

        // Ordering violations are programming errors; catch them before
        // touching the interrupt state so the panic path stays clean.
        #[cfg(debug_assertions)]
        {
            let held = state.held.load(Ordering::Relaxed);
            assert!(
                held >> id == 0,
                "lock ordering violation: acquiring {:?} while holding mask {:#x}",
                self.resource,
                held
            );
        }

        push_cli();
        while self.locked.swap(1, Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
        state.held.fetch_or(1 << id, Ordering::Relaxed);
        self.owner
            .store(cpu_index() as u32 + 1, Ordering::Relaxed);

        SpinLockGuard { lock: self }
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held, so no other CPU can
        // reach the cell.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, plus the exclusive borrow of the guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        let state = &CPU_LOCK_STATE[cpu_index()];
        state
            .held
            .fetch_and(!(1 << self.lock.resource as u8), Ordering::Relaxed);
        self.lock.owner.store(0, Ordering::Relaxed);
        self.lock.locked.store(0, Ordering::Release);
        pop_cli();
    }
}
