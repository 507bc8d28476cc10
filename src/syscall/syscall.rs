// Syscall argument fetch and dispatch.
//
// x86 int-based syscalls pass arguments the way a C call would: pushed
// onto the user stack below the return address, which sits at tf.esp by
// the time trap() runs. argint(n) reads the n'th argument at user
// virtual address esp + 4 + 4*n; argaddr/argstr build on top of that.

use crate::printf;
use crate::proc::myproc;
use crate::string::strlen;
use crate::syscall::sysfile::{
    sys_chdir, sys_close, sys_dup, sys_exec, sys_fstat, sys_link, sys_mkdir, sys_mknod, sys_open,
    sys_pipe, sys_read, sys_unlink, sys_write,
};
use crate::syscall::sysproc::{
    sys_exit, sys_fork, sys_getpid, sys_kill, sys_sbrk, sys_sleep, sys_uptime, sys_wait,
};
use crate::syscall::{
    SYS_CHDIR, SYS_CLOSE, SYS_DUP, SYS_EXEC, SYS_EXIT, SYS_FORK, SYS_FSTAT, SYS_GETPID, SYS_KILL,
    SYS_LINK, SYS_MKDIR, SYS_MKNOD, SYS_OPEN, SYS_PIPE, SYS_READ, SYS_SBRK, SYS_SLEEP, SYS_UNLINK,
    SYS_UPTIME, SYS_WAIT, SYS_WRITE,
};
use crate::vm::{copyin, copyinstr};

/// Fetch the 32-bit word at user virtual address `addr`.
fn fetchint(addr: usize) -> Option<i32> {
    let p = myproc();
    if addr >= p.sz || addr + 4 > p.sz {
        // both tests needed, in case of overflow
        return None;
    }
    let mut buf = [0u8; 4];
    copyin(p.pgdir_mut(), &mut buf, addr).ok()?;
    Some(i32::from_le_bytes(buf))
}

/// Fetch the n'th integer/pointer argument off the user stack.
pub(super) fn argint(n: u8) -> i32 {
    let p = myproc();
    let esp = unsafe { p.tf.unwrap().as_ref() }.esp as usize;
    fetchint(esp + 4 + 4 * n as usize).unwrap_or(-1)
}

pub(super) fn argaddr(n: u8) -> usize {
    argint(n) as u32 as usize
}

/// Fetch the nul-terminated string at user virtual address `addr` into
/// `buf`. Returns the string length excluding the NUL, or -1 on error.
pub(super) fn fetchstr(addr: usize, buf: &mut [u8]) -> i32 {
    let p = myproc();
    let len = buf.len();
    match copyinstr(p.pgdir_mut(), buf, addr, len) {
        Ok(_) => strlen(buf) as i32,
        Err(_) => -1,
    }
}

/// Fetch the n'th argument as a pointer, then copy the string it refers
/// to into `buf`.
pub(super) fn argstr(n: u8, buf: &mut [u8]) -> i32 {
    let addr = argaddr(n);
    fetchstr(addr, buf)
}

const NSYSCALL: usize = 22;
type Handler = fn() -> i32;

const SYSCALLS: [Option<Handler>; NSYSCALL] = {
    let mut t: [Option<Handler>; NSYSCALL] = [None; NSYSCALL];
    t[SYS_FORK as usize] = Some(sys_fork);
    t[SYS_EXIT as usize] = Some(sys_exit);
    t[SYS_WAIT as usize] = Some(sys_wait);
    t[SYS_PIPE as usize] = Some(sys_pipe);
    t[SYS_READ as usize] = Some(sys_read);
    t[SYS_KILL as usize] = Some(sys_kill);
    t[SYS_EXEC as usize] = Some(sys_exec);
    t[SYS_FSTAT as usize] = Some(sys_fstat);
    t[SYS_CHDIR as usize] = Some(sys_chdir);
    t[SYS_DUP as usize] = Some(sys_dup);
    t[SYS_GETPID as usize] = Some(sys_getpid);
    t[SYS_SBRK as usize] = Some(sys_sbrk);
    t[SYS_SLEEP as usize] = Some(sys_sleep);
    t[SYS_UPTIME as usize] = Some(sys_uptime);
    t[SYS_OPEN as usize] = Some(sys_open);
    t[SYS_WRITE as usize] = Some(sys_write);
    t[SYS_MKNOD as usize] = Some(sys_mknod);
    t[SYS_UNLINK as usize] = Some(sys_unlink);
    t[SYS_LINK as usize] = Some(sys_link);
    t[SYS_MKDIR as usize] = Some(sys_mkdir);
    t[SYS_CLOSE as usize] = Some(sys_close);
    t
};

/// Dispatch the syscall named by the current process's trap frame. The
/// user places the number in `eax` before `int T_SYSCALL`; the result
/// goes back in the same register.
pub fn syscall() {
    let p = myproc();
    let num = unsafe { p.tf.unwrap().as_ref() }.eax as usize;

    let handler = if num > 0 && num < NSYSCALL {
        SYSCALLS[num]
    } else {
        None
    };

    let ret = match handler {
        Some(f) => f(),
        None => {
            printf!(
                "{} {}: unknown sys call {}\n",
                p.pid,
                core::str::from_utf8(&p.name).unwrap_or("?"),
                num
            );
            -1
        }
    };

    unsafe { p.tf.unwrap().as_mut() }.eax = ret as u32;
}
