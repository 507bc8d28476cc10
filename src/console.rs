// Console device: line discipline on top of the UART. Input is buffered
// a line at a time with ^U (kill line) and ^H/DEL (backspace) editing;
// ^P dumps the process table for debugging a wedged kernel.

use core::fmt::{Error, Write};

use crate::error::{KError, KResult};
use crate::file::{Devsw, CONSOLE, DEVSW};
use crate::param::INPUT_BUF_SIZE;
use crate::proc::{either_copyin, either_copyout, myproc, procdump, sleep, wakeup};
use crate::spinlock::Spinlock;
use crate::uart::UART_INSTANCE;

pub(crate) static mut CONSOLE_INSTANCE: Console = Console::create();

const BACKSPACE: u16 = 0x100;

pub struct Console {
    lock: Spinlock,
    buf: [u8; INPUT_BUF_SIZE],
    r: usize, // next unread index
    w: usize, // next index the interrupt handler will wake readers at
    e: usize, // next index the interrupt handler will fill
}

impl Console {
    pub const fn create() -> Self {
        Self {
            lock: Spinlock::init_lock("cons"),
            buf: [0; INPUT_BUF_SIZE],
            r: 0,
            w: 0,
            e: 0,
        }
    }

    pub fn init() {
        unsafe {
            DEVSW[CONSOLE] = Some(&CONSOLE_INSTANCE as &dyn Devsw);
        }
    }

    fn read_chan(&self) -> usize {
        &self.r as *const usize as usize
    }

    pub fn putc(&mut self, c: u16) {
        unsafe {
            if c == BACKSPACE {
                UART_INSTANCE.putc_sync(0x08);
                UART_INSTANCE.putc_sync(0x20);
                UART_INSTANCE.putc_sync(0x08);
            } else {
                UART_INSTANCE.putc_sync(c as u8);
            }
        }
    }

    /// Called by the UART driver's interrupt handler for each input
    /// character. Handles editing and wakes `consoleread` on a newline.
    pub(crate) fn consoleintr(&mut self, c: u8) {
        self.lock.acquire();

        match c {
            val if val == b'P' - b'A' + 1 => crate::proc::procdump(),
            val if val == b'U' - b'A' + 1 => {
                while self.e != self.w && self.buf[(self.e - 1) % INPUT_BUF_SIZE] != b'\n' {
                    self.e -= 1;
                    self.putc(BACKSPACE);
                }
            }
            0x08 | 0x7f => {
                if self.e != self.w {
                    self.e -= 1;
                    self.putc(BACKSPACE);
                }
            }
            _ => {
                if c != 0 && self.e - self.r < INPUT_BUF_SIZE {
                    let c = if c == b'\r' { b'\n' } else { c };
                    self.putc(c as u16);

                    self.buf[self.e % INPUT_BUF_SIZE] = c;
                    self.e += 1;

                    if c == b'\n' || c == (b'D' - b'A' + 1) || self.e - self.r == INPUT_BUF_SIZE {
                        self.w = self.e;
                        wakeup(self.read_chan());
                    }
                }
            }
        }

        self.lock.release();
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        for c in s.bytes() {
            self.putc(c as u16);
        }
        Ok(())
    }
}

impl Devsw for Console {
    /// Copy up to one buffered line to `dst`.
    fn read(&self, is_user_dst: bool, dst: usize, n: usize) -> KResult<usize> {
        #[allow(invalid_reference_casting)]
        let me = unsafe { &mut *(self as *const Console as *mut Console) };
        let target = n;
        let mut dst = dst;
        let mut remaining = n;

        me.lock.acquire();
        while remaining > 0 {
            while me.r == me.w {
                if myproc().killed {
                    me.lock.release();
                    return Err(KError::BadAddr);
                }
                sleep(me.read_chan(), &me.lock);
            }

            let c = me.buf[me.r % INPUT_BUF_SIZE];
            me.r += 1;

            if c == (b'D' - b'A' + 1) {
                if remaining < target {
                    me.r -= 1;
                }
                break;
            }

            if either_copyout(is_user_dst, dst, core::slice::from_ref(&c)).is_err() {
                break;
            }

            dst += 1;
            remaining -= 1;

            if c == b'\n' {
                break;
            }
        }
        me.lock.release();
        Ok(target - remaining)
    }

    fn write(&self, is_user_src: bool, src: usize, n: usize) -> KResult<usize> {
        #[allow(invalid_reference_casting)]
        let me = unsafe { &mut *(self as *const Console as *mut Console) };
        let mut c = 0u8;
        let mut written = 0usize;
        for i in 0..n {
            if either_copyin(core::slice::from_mut(&mut c), is_user_src, src + i).is_err() {
                break;
            }
            me.putc(c as u16);
            written = i + 1;
        }
        Ok(written)
    }
}
