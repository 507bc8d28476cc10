// Block I/O gateway: the single choke point between the buffer cache and
// the disk hardware driver. The IDE controller, DMA/PIO wiring, and
// interrupt routing live outside this crate (an external collaborator);
// this module only defines the narrow contract bio.rs calls through.

use crate::buf::Buf;
use crate::spinlock::Spinlock;

static IDE_LOCK: Spinlock = Spinlock::init_lock("ide");

extern "C" {
    /// Hands a disk transfer to the real IDE driver. `write` selects
    /// direction; `dev`/`blockno` address the sector, `data` is the 1KB
    /// buffer. Provided by the platform's block driver, outside this crate.
    fn disk_sync(dev: u32, blockno: u32, data: *mut u8, write: bool);
}

/// Issue b's transfer (read if `write` is false, write otherwise). Caller
/// must hold b's sleeplock.
pub fn ide_rw(b: &mut Buf, write: bool) {
    if !b.lock.holding_sleep() {
        panic!("ide_rw: buf not locked");
    }

    IDE_LOCK.acquire();
    b.disk = true;
    unsafe {
        disk_sync(b.dev, b.blockno, b.data.as_mut_ptr(), write);
    }
    b.disk = false;
    IDE_LOCK.release();
}

/// Read block `blockno` on `dev` into `data`. Used by code that runs
/// before the buffer cache is usable (superblock read at mount time).
pub fn read_block(dev: u32, blockno: u32, data: &mut [u8]) {
    IDE_LOCK.acquire();
    unsafe {
        disk_sync(dev, blockno, data.as_mut_ptr(), false);
    }
    IDE_LOCK.release();
}

pub fn write_block(dev: u32, blockno: u32, data: &mut [u8]) {
    IDE_LOCK.acquire();
    unsafe {
        disk_sync(dev, blockno, data.as_mut_ptr(), true);
    }
    IDE_LOCK.release();
}

/// Acknowledge the IDE IRQ. `disk_sync` is synchronous, so transfers
/// never wait on this interrupt; it still needs routing and EOI.
pub fn ide_intr() {}
