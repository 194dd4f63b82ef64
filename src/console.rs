//! Console input and output.
//!
//! Output goes to both the serial line and the CGA display. Input is a
//! line discipline over bytes fed in by the keyboard and UART interrupt
//! handlers:
//!   newline  -- end of line
//!   ctrl-c   -- send the line as it stands
//!   ctrl-d   -- end of file
//!   ctrl-h   -- backspace
//!   ctrl-u   -- kill line
//!   ctrl-p   -- process listing (debugging aid)
//! Other control characters are dropped.

use crate::arch;
use crate::file::Devsw;
use crate::kernel::kernel;
use crate::param::{CONSOLE_MAJOR, INPUT_BUF};
use crate::proc;

const fn ctrl(c: u8) -> u8 {
    c - b'@'
}

/// Line-discipline state; the buffer between interrupt and reader.
pub struct Console {
    buf: [u8; INPUT_BUF],

    /// Read index.
    r: u32,

    /// Write index: input before this is ready for readers.
    w: u32,

    /// Edit index: input before this has been typed.
    e: u32,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF],
            r: 0,
            w: 0,
            e: 0,
        }
    }
}

/// Send one character to the screen and serial line. After a panic,
/// CPUs that come through here park; the panicking CPU printed its
/// message before raising the flag.
pub fn consputc(c: u8) {
    if kernel().is_panicked() {
        unsafe { arch::intr_off() };
        loop {
            core::hint::spin_loop();
        }
    }
    arch::console_putc(c);
}

/// Visually erase the last character.
fn erase() {
    consputc(8);
    consputc(b' ');
    consputc(8);
}

/// Register the console as a character device.
pub fn init() {
    kernel().devsw.lock()[CONSOLE_MAJOR as usize] = Devsw {
        read: Some(console_read),
        write: Some(console_write),
    };
}

/// The console device's write half: serialize whole writes under the
/// console lock.
fn console_write(src: &[u8]) -> i32 {
    let _guard = kernel().console.lock();
    for &c in src {
        consputc(c);
    }
    src.len() as i32
}

/// The console device's read half: block until a line (or EOF) arrives.
fn console_read(dst: &mut [u8]) -> i32 {
    let mut cons = kernel().console.lock();
    let mut n = 0;
    while n < dst.len() {
        // Wait for the interrupt handler to hand over some input.
        while cons.r == cons.w {
            if proc::current_killed() {
                return -1;
            }
            cons.sleep();
        }

        let c = cons.buf[cons.r as usize % INPUT_BUF];
        cons.r = cons.r.wrapping_add(1);

        if c == ctrl(b'D') {
            // End of file. Save it for next time if the caller already
            // got bytes, so they still see a 0-byte read.
            if n > 0 {
                cons.r = cons.r.wrapping_sub(1);
            }
            break;
        }

        dst[n] = c;
        n += 1;
        if c == b'\n' {
            break;
        }
    }
    n as i32
}

/// Feed pending input bytes from a device's interrupt handler. `getc`
/// returns the next byte or a negative value when drained.
pub fn intr(getc: fn() -> i32) {
    let mut cons = kernel().console.lock();
    loop {
        let c = getc();
        if c < 0 {
            break;
        }
        let c = c as u8;

        match c {
            // Process listing. Intentionally lockless: it is a debugging
            // aid for a possibly wedged machine.
            c if c == ctrl(b'P') => kernel().procs.dump(),

            // Kill line.
            c if c == ctrl(b'U') => {
                while cons.e != cons.w
                    && cons.buf[cons.e.wrapping_sub(1) as usize % INPUT_BUF] != b'\n'
                {
                    cons.e = cons.e.wrapping_sub(1);
                    erase();
                }
            }

            // Backspace.
            c if c == ctrl(b'H') || c == 0x7f => {
                if cons.e != cons.w {
                    cons.e = cons.e.wrapping_sub(1);
                    erase();
                }
            }

            // Send the line as it stands.
            c if c == ctrl(b'C') => {
                consputc(b'\n');
                cons.w = cons.e;
                cons.wakeup();
            }

            // Drop other control characters.
            c if c < 0x20 && c != b'\n' && c != b'\r' && c != ctrl(b'D') => {}

            _ => {
                if cons.e.wrapping_sub(cons.r) < INPUT_BUF as u32 {
                    let c = if c == b'\r' { b'\n' } else { c };

                    // Echo back to the user.
                    consputc(c);

                    let e = cons.e;
                    cons.buf[e as usize % INPUT_BUF] = c;
                    cons.e = e.wrapping_add(1);

                    if c == b'\n'
                        || c == ctrl(b'D')
                        || cons.e == cons.r.wrapping_add(INPUT_BUF as u32)
                    {
                        // A whole line (or EOF) has arrived; wake readers.
                        cons.w = cons.e;
                        cons.wakeup();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_maps_to_low_codes() {
        assert_eq!(ctrl(b'P'), 0x10);
        assert_eq!(ctrl(b'D'), 0x04);
        assert_eq!(ctrl(b'C'), 0x03);
        assert_eq!(ctrl(b'H'), 0x08);
        assert_eq!(ctrl(b'U'), 0x15);
    }
}
