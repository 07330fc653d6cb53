//! Kernel-wide error types.
//!
//! Every fallible kernel API returns [`KernelResult`] with one of the
//! variants below. The taxonomy mirrors the subsystems: hardware discovery,
//! resource exhaustion, paging programmer errors, and transient device
//! conditions. Unrecoverable conditions never surface here; they go through
//! `panic!`.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No physical frames left, or the heap could not grow.
    OutOfMemory,

    /// `map` was asked to map a virtual page that already has a present PTE.
    PageInUse { virt: u32 },

    /// `unmap` was asked to touch a virtual page whose page-directory entry
    /// is not present.
    NoDirEntry { virt: u32 },

    /// A required hardware unit was not discovered during bring-up.
    NotPresent { device: &'static str },

    /// A device did not become ready within its bounded poll budget. The
    /// caller may retry.
    DeviceNotReady { device: &'static str },

    /// Every PID in the configured PID space is in use.
    PidExhausted,

    /// A named Multiboot module was not passed in by the bootloader.
    ModuleNotFound { name: &'static str },

    /// An operation ran before the subsystem it depends on was initialized.
    NotInitialized { subsystem: &'static str },

    /// An argument was outside the range the callee supports.
    InvalidArgument { what: &'static str },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::PageInUse { virt } => {
                write!(f, "virtual page {virt:#010x} is already mapped")
            }
            Self::NoDirEntry { virt } => {
                write!(f, "no page-directory entry covers {virt:#010x}")
            }
            Self::NotPresent { device } => write!(f, "{device} not present"),
            Self::DeviceNotReady { device } => write!(f, "{device} not ready"),
            Self::PidExhausted => write!(f, "PID space exhausted"),
            Self::ModuleNotFound { name } => {
                write!(f, "bootloader module {name:?} not found")
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "{subsystem} used before initialization")
            }
            Self::InvalidArgument { what } => write!(f, "invalid argument: {what}"),
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_faulting_page() {
        let err = KernelError::PageInUse { virt: 0x2000_0000 };
        let rendered = alloc::format!("{err}");
        assert!(rendered.contains("0x20000000"), "got {rendered}");
    }

    #[test]
    fn errors_compare_by_payload() {
        assert_eq!(
            KernelError::NoDirEntry { virt: 0x1000 },
            KernelError::NoDirEntry { virt: 0x1000 }
        );
        assert_ne!(
            KernelError::NoDirEntry { virt: 0x1000 },
            KernelError::NoDirEntry { virt: 0x2000 }
        );
    }
}
