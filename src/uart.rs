// Thin wrapper around the platform UART driver (hardware I/O, interrupt
// wiring, and baud/FIFO setup live outside this crate).

pub static mut UART_INSTANCE: Uart = Uart;

pub struct Uart;

extern "C" {
    fn uart_init();
    fn uart_putc_sync(c: u8);
    fn uart_getc() -> i32;
}

impl Uart {
    pub fn init(&self) {
        unsafe { uart_init() }
    }

    /// Send one character, busy-waiting for transmit-ready.
    pub fn putc_sync(&self, c: u8) {
        unsafe { uart_putc_sync(c) }
    }

    /// Poll for one input character. Returns `None` if there is none
    /// waiting.
    pub fn getc(&self) -> Option<u8> {
        let c = unsafe { uart_getc() };
        if c < 0 {
            None
        } else {
            Some(c as u8)
        }
    }
}

/// Called by the external UART interrupt handler for each received byte.
pub fn uartintr() {
    unsafe {
        while let Some(c) = UART_INSTANCE.getc() {
            crate::console::CONSOLE_INSTANCE.consoleintr(c);
        }
    }
}
