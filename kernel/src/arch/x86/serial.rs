//! 8250 UART on COM1.
//!
//! Serial output is the kernel's second console and the only one visible
//! from the emulator command line. Transmit polls the line-status register
//! with a bounded iteration count; a port that never drains reports
//! [`KernelError::DeviceNotReady`] instead of hanging the caller.

use core::fmt;

use spin::Mutex;
use x86::io::{inb, outb};

use crate::{
    config::UART_BAUD_RATE,
    error::{KernelError, KernelResult},
};

const COM1: u16 = 0x3F8;

// Register offsets from the port base. DLAB=1 repurposes offsets 0 and 1 as
// the divisor latch.
const THR: u16 = 0; // transmitter holding (write)
const RBR: u16 = 0; // receiver buffer (read)
const DLL: u16 = 0; // divisor latch low (DLAB)
const IER: u16 = 1;
const DLH: u16 = 1; // divisor latch high (DLAB)
const IIR: u16 = 2; // read
const FCR: u16 = 2; // write
const LCR: u16 = 3;
const MCR: u16 = 4;
const LSR: u16 = 5;

const LCR_DLAB: u8 = 1 << 7;
const LCR_WORD_LEN8: u8 = 0b11;

const FCR_ENABLE: u8 = 1 << 0;
const FCR_CLR_RECV: u8 = 1 << 1;
const FCR_CLR_TRANS: u8 = 1 << 2;
const FCR_TRIGGER_14: u8 = 0b11 << 6;

const MCR_TERMINAL_READY: u8 = 1 << 0;
const MCR_REQUEST_SEND: u8 = 1 << 1;
const MCR_AUX2: u8 = 1 << 3;

const IER_RECV_DATA: u8 = 1 << 0;

const LSR_DATA_READY: u8 = 1 << 0;
const LSR_THR_EMPTY: u8 = 1 << 5;
/// A floating bus reads back all ones; no UART is wired to the port.
const LSR_NO_UART: u8 = 0xFF;

/// 8250 input clock over the divisor gives the baud rate.
const UART_CLOCK: u32 = 115_200;

/// Transmit poll budget before giving up on the THR-empty bit.
const PUTC_POLL_LIMIT: u32 = 1024 * 16;

pub struct SerialPort {
    present: bool,
}

impl SerialPort {
    const fn new() -> Self {
        Self { present: false }
    }

    fn init(&mut self) -> KernelResult<()> {
        // SAFETY: fixed ISA port I/O on COM1; the init sequence is the
        // standard 8250 programming order (interrupts off, divisor latch,
        // FIFO, modem control, receive interrupt).
        unsafe {
            outb(COM1 + IER, 0x00);

            let divisor = (UART_CLOCK / UART_BAUD_RATE) as u16;
            outb(COM1 + LCR, LCR_DLAB);
            outb(COM1 + DLL, (divisor & 0xFF) as u8);
            outb(COM1 + DLH, (divisor >> 8) as u8);
            outb(COM1 + LCR, 0);

            outb(
                COM1 + FCR,
                FCR_ENABLE | FCR_CLR_RECV | FCR_CLR_TRANS | FCR_TRIGGER_14,
            );
            outb(COM1 + MCR, MCR_TERMINAL_READY | MCR_REQUEST_SEND | MCR_AUX2);
            outb(COM1 + IER, IER_RECV_DATA);

            if inb(COM1 + LSR) == LSR_NO_UART {
                self.present = false;
                return Err(KernelError::NotPresent { device: "uart" });
            }

            let lcr = inb(COM1 + LCR);
            outb(COM1 + LCR, lcr | LCR_WORD_LEN8);

            // Drain any interrupt state left over from the firmware.
            inb(COM1 + IIR);
            inb(COM1 + RBR);
        }
        self.present = true;
        Ok(())
    }

    pub fn putc(&mut self, c: u8) -> KernelResult<()> {
        if !self.present {
            return Err(KernelError::NotPresent { device: "uart" });
        }
        let mut polls = 0;
        // SAFETY: LSR read and THR write on the probed COM1 port.
        unsafe {
            while inb(COM1 + LSR) & LSR_THR_EMPTY == 0 {
                polls += 1;
                if polls >= PUTC_POLL_LIMIT {
                    return Err(KernelError::DeviceNotReady { device: "uart" });
                }
            }
            outb(COM1 + THR, c);
        }
        Ok(())
    }

    pub fn getc(&mut self) -> KernelResult<u8> {
        if !self.present {
            return Err(KernelError::NotPresent { device: "uart" });
        }
        // SAFETY: LSR/RBR reads on the probed COM1 port.
        unsafe {
            if inb(COM1 + LSR) & LSR_DATA_READY != 0 {
                Ok(inb(COM1 + RBR))
            } else {
                Err(KernelError::DeviceNotReady { device: "uart" })
            }
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r').map_err(|_| fmt::Error)?;
            }
            self.putc(byte).map_err(|_| fmt::Error)?;
        }
        Ok(())
    }
}

pub static SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::new());

/// Probe and program COM1. Returns `NotPresent` when the line status
/// register reads back floating.
pub fn init() -> KernelResult<()> {
    SERIAL1.lock().init()
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // A missing or wedged UART must not take the kernel down with it.
    SERIAL1.lock().write_fmt(args).ok();
}
