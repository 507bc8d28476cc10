// Thin wrapper around the platform PS/2 keyboard driver (scancode
// translation and controller I/O live outside this crate).

extern "C" {
    fn kbd_getc() -> i32;
}

/// Called by the keyboard IRQ handler; feeds decoded characters into the
/// console line discipline the same way uartintr() does.
pub fn kbdintr() {
    unsafe {
        loop {
            let c = kbd_getc();
            if c < 0 {
                break;
            }
            crate::console::CONSOLE_INSTANCE.consoleintr(c as u8);
        }
    }
}
