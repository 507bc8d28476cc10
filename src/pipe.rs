// Pipes: a byte ring shared between a read and a write file descriptor.

use crate::kalloc::KMEM;
use crate::proc::{myproc, sleep, wakeup};
use crate::spinlock::Spinlock;

const PIPESIZE: usize = crate::param::PIPESIZE;

pub struct Pipe {
    lock: Spinlock,
    data: [u8; PIPESIZE],
    nread: u32,  // bytes consumed by the reader
    nwrite: u32, // bytes produced by the writer
    readopen: bool,
    writeopen: bool,
}

impl Pipe {
    const fn create() -> Self {
        Pipe {
            lock: Spinlock::init_lock("pipe"),
            data: [0; PIPESIZE],
            nread: 0,
            nwrite: 0,
            readopen: true,
            writeopen: true,
        }
    }

    fn read_chan(&self) -> usize {
        &self.nread as *const u32 as usize
    }

    fn write_chan(&self) -> usize {
        &self.nwrite as *const u32 as usize
    }

    /// Copy up to `n` bytes from `data` into the ring, blocking whenever
    /// it's full. Returns -1 if the read side closed mid-write.
    pub fn write(&mut self, data: &[u8], n: usize) -> isize {
        let mut i = 0usize;
        self.lock.acquire();
        while i < n {
            if !self.readopen || myproc().killed {
                self.lock.release();
                return -1;
            }
            if self.nwrite == self.nread + PIPESIZE as u32 {
                wakeup(self.read_chan());
                sleep(self.write_chan(), &self.lock);
                continue;
            }
            let idx = (self.nwrite as usize) % PIPESIZE;
            self.data[idx] = data[i];
            self.nwrite += 1;
            i += 1;
        }
        wakeup(self.read_chan());
        self.lock.release();
        i as isize
    }

    /// Copy up to `n` bytes out of the ring into `buf`. Blocks while the
    /// ring is empty and the write side is still open.
    pub fn read(&mut self, buf: &mut [u8], n: usize) -> isize {
        self.lock.acquire();
        while self.nread == self.nwrite && self.writeopen {
            if myproc().killed {
                self.lock.release();
                return -1;
            }
            sleep(self.read_chan(), &self.lock);
        }

        let mut i = 0usize;
        while i < n && self.nread != self.nwrite {
            let idx = (self.nread as usize) % PIPESIZE;
            buf[i] = self.data[idx];
            self.nread += 1;
            i += 1;
        }
        wakeup(self.write_chan());
        self.lock.release();
        i as isize
    }

    pub fn close(&mut self, writable: bool) {
        self.lock.acquire();
        if writable {
            self.writeopen = false;
            wakeup(self.read_chan());
        } else {
            self.readopen = false;
            wakeup(self.write_chan());
        }

        if !self.readopen && !self.writeopen {
            self.lock.release();
            unsafe {
                KMEM.kfree(self as *mut Pipe);
            }
        } else {
            self.lock.release();
        }
    }
}

/// Allocate a fresh pipe. Returns `None` if the page allocator is out of
/// memory.
pub fn pipealloc() -> Option<*mut Pipe> {
    let p: *mut Pipe = KMEM.kalloc();
    if p.is_null() {
        return None;
    }
    unsafe {
        p.write(Pipe::create());
    }
    Some(p)
}
