//! Kernel logger behind the `log` facade.
//!
//! Bring-up progress and diagnostics go through `log::info!` and friends;
//! this sink renders each record as a level-tagged line on the VGA console
//! and mirrors it to the serial port. The sink owns no buffers and never
//! allocates, so it is safe from the earliest point after the console is up.

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::sync::spinlock::{LockResource, SpinLock};

struct KernelLog;

/// Serializes whole lines so interleaved CPUs do not shred each other's
/// output. Console sits below Heap in the lock order, so logging is legal
/// anywhere except under the console lock itself.
static CONSOLE_LOCK: SpinLock<()> = SpinLock::new(LockResource::Console, ());

static LOGGER: KernelLog = KernelLog;

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let _guard = CONSOLE_LOCK.lock();
        crate::println!("[{}] {}", tag, record.args());
        crate::serial_println!("[{}] {}", tag, record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Called once, right after the VGA console is
/// cleared; a second call is a no-op.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
        // With the logger installed the facade reports our level ceiling.
        assert_eq!(log::max_level(), LevelFilter::Debug);
    }
}
