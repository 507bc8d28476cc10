// Process-management syscall wrappers: thin argument-fetching shims over
// proc.rs's actual implementations.

use core::sync::atomic::Ordering;

use crate::proc::{self, fork, kill, myproc, sleep, wait, PTABLE_LOCK, TICKS};
use crate::syscall::syscall::argint;
use crate::vm::{allocuvm, deallocuvm};

pub(crate) fn sys_fork() -> i32 {
    match fork() {
        Some(pid) => pid as i32,
        None => -1,
    }
}

pub(crate) fn sys_exit() -> i32 {
    let status = argint(0);
    proc::exit(status);
}

pub(crate) fn sys_wait() -> i32 {
    wait()
}

pub(crate) fn sys_kill() -> i32 {
    let pid = argint(0);
    if pid < 0 || !kill(pid as u32) {
        return -1;
    }
    0
}

pub(crate) fn sys_getpid() -> i32 {
    myproc().pid() as i32
}

/// Grow or shrink the calling process's heap by `n` bytes. Returns the
/// address the heap used to end at, or -1 on failure.
pub(crate) fn sys_sbrk() -> i32 {
    let n = argint(0);
    let p = myproc();
    let old_sz = p.sz;

    if n >= 0 {
        match allocuvm(p.pgdir_mut(), old_sz, old_sz + n as usize) {
            Some(new_sz) => p.sz = new_sz,
            None => return -1,
        }
    } else {
        let shrink = (-n) as usize;
        if shrink > old_sz {
            return -1;
        }
        p.sz = deallocuvm(p.pgdir_mut(), old_sz, old_sz - shrink);
    }

    old_sz as i32
}

/// Block for `n` ticks, waking early (and returning -1) if killed.
pub(crate) fn sys_sleep() -> i32 {
    let n = argint(0);
    if n < 0 {
        return 0;
    }
    let n = n as u32;

    unsafe {
        PTABLE_LOCK.acquire();
        let start = TICKS.load(Ordering::Relaxed);
        while TICKS.load(Ordering::Relaxed).wrapping_sub(start) < n {
            if myproc().killed {
                PTABLE_LOCK.release();
                return -1;
            }
            sleep(&TICKS as *const _ as usize, &PTABLE_LOCK);
        }
        PTABLE_LOCK.release();
    }
    0
}

pub(crate) fn sys_uptime() -> i32 {
    TICKS.load(Ordering::Relaxed) as i32
}
