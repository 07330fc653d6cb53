//! The scheduler tick.
//!
//! The local APIC timer fires on vector 64; every tick bumps the global
//! counter and every `TICKS_PER_SWITCH`th tick rotates the ready ring.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    arch::x86::isr::{self, Registers},
    config::TICKS_PER_SWITCH,
    process,
};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Timer ticks since the timer ISR was installed (uptime, in ticks).
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// The vector-64 handler. Returns the frame to resume with, which is a
/// different task's frame once per switch interval.
pub fn tick(regs: &mut Registers) -> u32 {
    let count = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if count % TICKS_PER_SWITCH == 0 {
        process::switch_task(regs)
    } else {
        regs as *mut Registers as u32
    }
}

/// Install the tick handler as the scheduler driver.
pub fn init() {
    isr::register_interrupt_handler(isr::IRQ_TIMER, tick);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ticks_count_and_only_switch_ticks_touch_the_scheduler() {
        // Shares the scheduler's gate: switch ticks reach the process
        // table.
        let _gate = crate::process::scheduler::tests::TEST_GATE
            .lock()
            .unwrap();
        // With no process table, every tick must hand back the incoming
        // frame untouched, switch tick or not.
        let mut regs: Registers = unsafe { core::mem::zeroed() };
        let before = ticks();
        for _ in 0..(2 * TICKS_PER_SWITCH) {
            let resumed = tick(&mut regs);
            assert_eq!(resumed, &mut regs as *mut Registers as u32);
        }
        assert_eq!(ticks() - before, 2 * TICKS_PER_SWITCH);
    }
}
