// Physical page allocator: a free list of 4KB pages threaded through the
// pages themselves, protected by a spinlock so kalloc/kfree are safe to
// call from any CPU concurrently.

use core::cell::UnsafeCell;
use core::ptr;

use crate::memlayout::{p2v, PHYSTOP};
use crate::mmu::PGSIZE;
use crate::spinlock::Spinlock;
use crate::string::memset;
use crate::PGROUNDUP;

extern "C" {
    // First address after the kernel image, defined by the linker script.
    static mut end: u8;
}

struct Run {
    next: *mut Run,
}

pub struct KMem {
    lock: Spinlock,
    freelist: UnsafeCell<*mut Run>,
}

unsafe impl Sync for KMem {}

pub static KMEM: KMem = KMem::create();

impl KMem {
    const fn create() -> Self {
        Self {
            lock: Spinlock::init_lock("kmem"),
            freelist: UnsafeCell::new(ptr::null_mut()),
        }
    }

    pub fn kinit(&self) {
        unsafe {
            self.freerange((&mut end) as *mut u8, p2v(PHYSTOP) as *mut u8);
        }
    }

    fn freerange<T: Sized>(&self, pa_start: *mut T, pa_end: *mut T) {
        let mut p = PGROUNDUP!(pa_start as usize);
        while p + PGSIZE <= pa_end as usize {
            self.kfree(p as *mut T);
            p += PGSIZE;
        }
    }

    /// Free the page of physical memory pointed at by pa, which must have
    /// come from kalloc() (or freerange() during boot).
    pub fn kfree<T: Sized>(&self, pa: *mut T) {
        let pa_usize = pa as usize;
        unsafe {
            if pa_usize % PGSIZE != 0
                || pa_usize < ((&end) as *const u8) as usize
                || pa_usize >= p2v(PHYSTOP)
            {
                panic!("kfree");
            }
        }

        // Fill with junk to catch dangling refs.
        memset(pa as *mut u8, 1, PGSIZE);

        let r = pa as *mut Run;

        self.lock.acquire();
        unsafe {
            (*r).next = *self.freelist.get();
            *self.freelist.get() = r;
        }
        self.lock.release();
    }

    /// Allocate one 4096-byte page of physical memory. Returns a null
    /// pointer if none is free.
    pub fn kalloc<T: Sized>(&self) -> *mut T {
        self.lock.acquire();
        let r = unsafe { *self.freelist.get() };
        if !r.is_null() {
            unsafe {
                *self.freelist.get() = (*r).next;
            }
        }
        self.lock.release();

        if !r.is_null() {
            memset(r as *mut u8, 5, PGSIZE); // fill with junk
        }
        r as *mut T
    }
}
