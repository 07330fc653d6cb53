//! VGA text-mode console.
//!
//! 80x25 cells of `color << 8 | ascii` words at physical 0xB8000 (inside
//! the identity-mapped first 4 MiB, so the same pointer works before and
//! after paging). The writer tracks an (x, y) cursor across the grid,
//! expands tabs, honors carriage returns and backspace, scrolls when the
//! bottom line overflows, and keeps the hardware cursor in step through
//! the CRTC register pair.

use core::{fmt, ptr::write_volatile};

use lazy_static::lazy_static;
use spin::Mutex;
use x86::io::outb;

/// Foreground and background palette, per the VGA specification. Not every
/// variant is referenced.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Pink = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    LightPink = 13,
    Yellow = 14,
    White = 15,
}

/// Default foreground color for kernel output.
pub const DEFAULT_FG: Color = Color::White;
/// Default background color for kernel output.
pub const DEFAULT_BG: Color = Color::Black;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ColorCode(u8);

impl ColorCode {
    const fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode(((background as u8) << 4) | (foreground as u8))
    }

    /// The full cell word for one character in this color.
    const fn cell(self, ascii: u8) -> u16 {
        ((self.0 as u16) << 8) | ascii as u16
    }
}

const SCREEN_WIDTH: usize = 80;
const SCREEN_HEIGHT: usize = 25;
const VGA_BUFFER_ADDR: usize = 0xB8000;

/// Spaces per tab stop.
const TAB_SIZE: usize = 4;

/// CRTC register-select / data port pair.
const CRTC_INDEX: u16 = 0x3D4;
const CRTC_DATA: u16 = 0x3D5;
/// Cursor location registers, high and low byte.
const CRTC_CURSOR_HIGH: u8 = 14;
const CRTC_CURSOR_LOW: u8 = 15;

pub struct Writer {
    x: usize,
    y: usize,
    color: ColorCode,
    mem: *mut u16,
}

// SAFETY: the writer is the sole owner of the VGA cell buffer and is only
// reachable through the mutex below.
unsafe impl Send for Writer {}

impl Writer {
    /// Place one cell on the grid.
    fn write_cell(&mut self, x: usize, y: usize, ascii: u8) {
        debug_assert!(x < SCREEN_WIDTH && y < SCREEN_HEIGHT);
        // SAFETY: the VGA buffer is memory-mapped I/O covering the whole
        // 80x25 grid; volatile keeps the store, and x/y are in bounds.
        unsafe {
            write_volatile(self.mem.add(y * SCREEN_WIDTH + x), self.color.cell(ascii));
        }
    }

    /// Put one character, driving the cursor the way a terminal would:
    /// backspace retreats, tab advances to the next stop, `\r` returns to
    /// column zero, `\n` opens a new line, printable ASCII lands on the
    /// grid, and anything else is dropped.
    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            0x08 => {
                if self.x > 0 {
                    self.x -= 1;
                    let (x, y) = (self.x, self.y);
                    self.write_cell(x, y, b' ');
                }
            }
            b'\t' => {
                self.x += TAB_SIZE - ((self.x + TAB_SIZE) % TAB_SIZE);
            }
            b'\r' => {
                self.x = 0;
            }
            b'\n' => {
                self.x = 0;
                self.y += 1;
                self.scroll();
            }
            b' '..=b'~' => {
                let (x, y) = (self.x, self.y);
                self.write_cell(x, y, byte);
                self.x += 1;
            }
            _ => return,
        }

        if self.x >= SCREEN_WIDTH {
            self.x = 0;
            self.y += 1;
            self.scroll();
        }
        self.update_cursor();
    }

    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
    }

    /// Shift everything up one line once the cursor passes the bottom.
    fn scroll(&mut self) {
        if self.y < SCREEN_HEIGHT {
            return;
        }
        for i in 0..(SCREEN_HEIGHT - 1) * SCREEN_WIDTH {
            // SAFETY: both indices are inside the grid; volatile keeps the
            // MMIO traffic.
            unsafe {
                let cell = core::ptr::read_volatile(self.mem.add(i + SCREEN_WIDTH));
                write_volatile(self.mem.add(i), cell);
            }
        }
        let y = SCREEN_HEIGHT - 1;
        for x in 0..SCREEN_WIDTH {
            self.write_cell(x, y, b' ');
        }
        self.y -= 1;
    }

    /// Paint the whole screen with the background color. The cursor is
    /// left where it was.
    fn clear(&mut self) {
        for y in 0..SCREEN_HEIGHT {
            for x in 0..SCREEN_WIDTH {
                self.write_cell(x, y, b' ');
            }
        }
    }

    /// Move the blinking hardware cursor to (x, y) through the CRTC
    /// location registers.
    fn update_cursor(&self) {
        let location = (self.y * SCREEN_WIDTH + self.x) as u16;
        // SAFETY: CRTC index/data port protocol on the standard color
        // text-mode ports.
        unsafe {
            outb(CRTC_INDEX, CRTC_CURSOR_HIGH);
            outb(CRTC_DATA, (location >> 8) as u8);
            outb(CRTC_INDEX, CRTC_CURSOR_LOW);
            outb(CRTC_DATA, location as u8);
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        x: 0,
        y: 0,
        color: ColorCode::new(DEFAULT_FG, DEFAULT_BG),
        mem: VGA_BUFFER_ADDR as *mut u16,
    });
}

/// Clear the screen, home the cursor, and claim the console for kernel
/// output.
pub fn init() {
    let mut writer = WRITER.lock();
    writer.x = 0;
    writer.y = 0;
    writer.clear();
    writer.update_cursor();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    WRITER.lock().write_fmt(args).ok();
}
