// Trap dispatch: every exception, hardware interrupt, and syscall lands
// here after the assembly stub (alltraps, vectors.S -- outside this
// crate) builds a Trapframe and calls trap(tf). Syscalls and user-mode
// faults never crash the kernel; kernel-mode faults always do.

use core::sync::atomic::Ordering;

use crate::idt::T_SYSCALL;
use crate::mp;
use crate::proc::{cpuid, exit, mycpu, myproc, wakeup, yield_, Trapframe, TICKS};

/// Dispatch one trap. Called with interrupts still disabled; re-enables
/// them only on the syscall path, after `killed` has been checked once.
#[no_mangle]
pub extern "C" fn trap(tf: &mut Trapframe) {
    if tf.trapno == T_SYSCALL as u32 {
        if mycpu().proc.is_some() && myproc().killed {
            exit(-1);
        }

        myproc().tf = core::ptr::NonNull::new(tf as *mut Trapframe);
        crate::x86::intr_on();
        crate::syscall::syscall();

        if mycpu().proc.is_some() && myproc().killed {
            exit(-1);
        }
        return;
    }

    match tf.trapno {
        n if n == (mp::IRQ_OFFSET as u32 + mp::IRQ_TIMER as u32) => {
            if cpuid() == 0 {
                TICKS.fetch_add(1, Ordering::Relaxed);
                wakeup(&TICKS as *const _ as usize);
            }
            mp::eoi();
            let running_user = (tf.cs & 3) == 3;
            if running_user {
                yield_();
            }
        }
        n if n == (mp::IRQ_OFFSET as u32 + mp::IRQ_IDE as u32) => {
            crate::ide::ide_intr();
            mp::eoi();
        }
        n if n == (mp::IRQ_OFFSET as u32 + mp::IRQ_KBD as u32) => {
            crate::kbd::kbdintr();
            mp::eoi();
        }
        n if n == (mp::IRQ_OFFSET as u32 + 4) => {
            crate::uart::uartintr();
            mp::eoi();
        }
        n if n == (mp::IRQ_OFFSET as u32 + mp::IRQ_ERROR as u32) => {
            log::warn!("apic error, cpu {}", cpuid());
            mp::eoi();
        }
        n if n == (mp::IRQ_OFFSET as u32 + mp::IRQ_SPURIOUS as u32) => {
            log::warn!("spurious interrupt, cpu {}", cpuid());
        }
        _ => {
            let from_user = (tf.cs & 3) == 3;
            if from_user {
                log::warn!(
                    "pid {}: trap {} eip {:#x} (killed)",
                    myproc().pid(),
                    tf.trapno,
                    tf.eip
                );
                myproc().killed = true;
            } else {
                panic!(
                    "kernel trap {} eip {:#x} cr2 {:#x}",
                    tf.trapno,
                    tf.eip,
                    crate::x86::read_cr2()
                );
            }
        }
    }

    // A CPU idling in the scheduler's hlt loop (no current process) takes
    // the timer/disk/uart/kbd IRQs above just like any other CPU; myproc()
    // would panic on that path, so only consult killed when there's a
    // process to kill.
    if mycpu().proc.is_some() && myproc().killed && (tf.cs & 3) == 3 {
        exit(-1);
    }
}

/// Install the IDT vectors, route external hardware lines through the
/// IOAPIC to the BSP, and arm the local timer. Called once by the BSP.
pub fn trapinit(vectors: &[u32; 256]) {
    crate::idt::init(vectors);
    mp::ioapic_route(mp::IRQ_TIMER, 0, true);
    mp::ioapic_route(mp::IRQ_KBD, 0, true);
    mp::ioapic_route(4, 0, true);
    mp::ioapic_route(mp::IRQ_IDE, 0, true);
}

pub fn trapinithart() {
    crate::idt::load();
}
