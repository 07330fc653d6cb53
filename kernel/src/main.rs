//! Ferrox kernel binary.
//!
//! The boot entry, `kmain`, and all subsystems live in the library; this
//! crate supplies the bare-metal glue around them (the panic handler,
//! chiefly). On a hosted target it degrades to a stub so workspace-wide
//! builds and test runs stay green.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod metal {
    use core::panic::PanicInfo;

    // Pulls in the Multiboot header, `_start`, and `kmain`.
    use ferrox_kernel as kernel;

    /// `PANIC`: interrupts off, message and source location to both
    /// consoles, halt. No recovery.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        #[cfg(target_arch = "x86")]
        {
            kernel::arch::x86::disable_interrupts();
            kernel::println!("KERNEL PANIC: {}", info);
            kernel::serial_println!("KERNEL PANIC: {}", info);
            kernel::arch::x86::halt_forever();
        }
        #[cfg(not(target_arch = "x86"))]
        loop {}
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("ferrox-kernel is a bare-metal image; build it for the x86-ferrox target");
}
