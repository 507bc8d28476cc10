// Long-term locks for processes: held across calls that might sleep (disk
// I/O, waiting for a pipe), unlike Spinlock which must never be held across
// a sleep. Built out of a Spinlock plus a condition-variable style wait on
// the lock's own address.

use crate::proc::{myproc, sleep, wakeup};
use crate::spinlock::Spinlock;
use core::cell::UnsafeCell;

pub struct Sleeplock {
    locked: UnsafeCell<bool>,
    lk: Spinlock,
    name: &'static str,
    pid: UnsafeCell<i32>,
}

unsafe impl Sync for Sleeplock {}

impl Sleeplock {
    pub const fn init_lock(name: &'static str) -> Self {
        Sleeplock {
            locked: UnsafeCell::new(false),
            lk: Spinlock::init_lock("sleep lock"),
            name,
            pid: UnsafeCell::new(0),
        }
    }

    pub fn acquire_sleep(&self) {
        self.lk.acquire();
        while unsafe { *self.locked.get() } {
            sleep(self as *const Sleeplock as usize, &self.lk);
        }
        unsafe {
            *self.locked.get() = true;
            *self.pid.get() = myproc().pid() as i32;
        }
        self.lk.release();
    }

    pub fn release_sleep(&self) {
        self.lk.acquire();
        unsafe {
            *self.locked.get() = false;
            *self.pid.get() = 0;
        }
        wakeup(self as *const Sleeplock as usize);
        self.lk.release();
    }

    pub fn holding_sleep(&self) -> bool {
        self.lk.acquire();
        let r = unsafe { *self.locked.get() && *self.pid.get() == myproc().pid() as i32 };
        self.lk.release();
        r
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
