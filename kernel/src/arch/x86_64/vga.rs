// VGA text-mode console at 0xB8000

use core::{fmt, ptr::write_volatile};

use lazy_static::lazy_static;
use spin::Mutex;

/// VGA text-mode color palette. Not all variants are used but the full
/// 16-color palette is defined per the VGA specification.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ColorCode(u8);

impl ColorCode {
    fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode(((background as u8) << 4) | (foreground as u8))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

pub const BUFFER_HEIGHT: usize = 25;
pub const BUFFER_WIDTH: usize = 80;

/// Physical address of the VGA text buffer.
pub const VGA_BUFFER: usize = 0xB8000;

#[repr(transparent)]
struct Buffer {
    chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

pub struct Writer {
    column_position: usize,
    color_code: ColorCode,
    buffer: &'static mut Buffer,
}

impl Writer {
    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            0x08 => self.backspace(),
            byte => {
                if self.column_position >= BUFFER_WIDTH {
                    self.new_line();
                }

                let row = BUFFER_HEIGHT - 1;
                let col = self.column_position;

                let color_code = self.color_code;
                // SAFETY: The VGA buffer at 0xb8000 is memory-mapped I/O.
                // write_volatile ensures the write is not optimized away.
                // Row/col are bounds-checked by the new_line logic above.
                unsafe {
                    write_volatile(
                        &mut self.buffer.chars[row][col],
                        ScreenChar {
                            ascii_character: byte,
                            color_code,
                        },
                    );
                }
                self.column_position += 1;
            }
        }
    }

    fn backspace(&mut self) {
        if self.column_position == 0 {
            return;
        }
        self.column_position -= 1;
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        // SAFETY: write_volatile to the VGA text buffer; column_position is
        // bounded by BUFFER_WIDTH and was just decremented past 0 check.
        unsafe {
            write_volatile(
                &mut self.buffer.chars[BUFFER_HEIGHT - 1][self.column_position],
                blank,
            );
        }
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                // SAFETY: read_volatile and write_volatile access the VGA
                // text buffer. Row indices are bounded by BUFFER_HEIGHT
                // (loop range 1..25) and col by BUFFER_WIDTH (0..80).
                let character = unsafe { core::ptr::read_volatile(&self.buffer.chars[row][col]) };
                unsafe {
                    write_volatile(&mut self.buffer.chars[row - 1][col], character);
                }
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.column_position = 0;
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            // SAFETY: write_volatile to the VGA text buffer; row comes from
            // new_line or clear and is bounded by BUFFER_HEIGHT.
            unsafe {
                write_volatile(&mut self.buffer.chars[row][col], blank);
            }
        }
    }

    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' | 0x08 => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }

    /// Clear the whole screen.
    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.column_position = 0;
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
        column_position: 0,
        color_code: ColorCode::new(Color::White, Color::Black),
        // SAFETY: 0xb8000 is the well-known physical address of the VGA text
        // buffer, identity-mapped in kernel space. The cast to &'static mut
        // Buffer is valid because the VGA buffer has static lifetime and is
        // protected by the enclosing Mutex<Writer>.
        buffer: unsafe { &mut *(VGA_BUFFER as *mut Buffer) },
    });
}

/// Write a single character cell directly, bypassing the scrolling console.
///
/// Used by the demo tasks and the shell's status line. Out-of-range
/// coordinates are ignored.
pub fn write_cell(row: usize, col: usize, byte: u8, fg: Color, bg: Color) {
    if row >= BUFFER_HEIGHT || col >= BUFFER_WIDTH {
        return;
    }
    let cell = VGA_BUFFER + (row * BUFFER_WIDTH + col) * 2;
    let value = ((bg as u16) << 12) | ((fg as u16) << 8) | byte as u16;
    // SAFETY: cell is inside the 4000-byte VGA text buffer (bounds checked
    // above) and the buffer is identity-mapped in every address space.
    unsafe {
        write_volatile(cell as *mut u16, value);
    }
}

/// Clear the scrolling console.
pub fn clear_screen() {
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        WRITER.lock().clear();
    });
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        WRITER.lock().write_fmt(args).expect("VGA write_fmt failed");
    });
}
