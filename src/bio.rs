// Cache of ext2 block contents, sitting between fs.rs's block-group-aware
// allocator/`bmap` walk and the IDE gateway. Caching means a directory
// scan or a chain of indirect-block lookups during the same syscall hits
// memory instead of re-issuing IDE requests, and gives concurrent
// processes touching the same block a single synchronization point (the
// buffer's sleeplock) instead of one per caller.
//
// Interface:
// * bread() to get a locked buffer for a block, reading it if not cached.
// * bwrite() after changing its data, to push the change to disk.
// * brelse() when done; never touch the buffer again after that.
// * Only one process at a time may hold a buffer locked.

use core::ptr::NonNull;

use crate::buf::Buf;
use crate::ide::ide_rw;
use crate::param::NBUF;
use crate::spinlock::Spinlock;

const BUF_INIT: Buf = Buf::new();

struct BCache {
    lock: Spinlock,
    buf: [Buf; NBUF],
    // Circular list of all buffers through prev/next, sorted by recency.
    // head.next is most recently used, head.prev is least.
    head: NonNull<Buf>,
}

unsafe impl Sync for BCache {}

static mut DUMMY_HEAD: Buf = Buf::new();
static mut BCACHE: BCache = BCache {
    lock: Spinlock::init_lock("bcache"),
    buf: [BUF_INIT; NBUF],
    head: unsafe { NonNull::new_unchecked((&mut DUMMY_HEAD) as *mut Buf) },
};

pub fn binit() {
    unsafe {
        let head = BCACHE.head.as_ptr().as_mut().unwrap();
        head.prev = Some(BCACHE.head);
        head.next = Some(BCACHE.head);
        for b in &mut BCACHE.buf {
            b.next = head.next;
            b.prev = Some(BCACHE.head);

            let head_next = head.next.unwrap().as_mut();
            head_next.prev = NonNull::new(b as *mut Buf);
            head.next = NonNull::new(b as *mut Buf);
        }
    }
}

/// Walk the circular buffer list starting from `head.next` (most- to
/// least-recently-used) or `head.prev` (the reverse, used for recycling)
/// and return the first buffer for which `pred` holds.
unsafe fn find(head: NonNull<Buf>, forward: bool, pred: impl Fn(&Buf) -> bool) -> Option<&'static mut Buf> {
    let head_ptr = head.as_ptr();
    let mut b_ptr = if forward {
        (*head_ptr).next.unwrap().as_ptr()
    } else {
        (*head_ptr).prev.unwrap().as_ptr()
    };
    while b_ptr != head_ptr {
        let b = &mut *b_ptr;
        if pred(b) {
            return Some(b);
        }
        b_ptr = if forward {
            b.next.unwrap().as_ptr()
        } else {
            b.prev.unwrap().as_ptr()
        };
    }
    None
}

/// Look through the buffer cache for block `blockno` on `dev`. If not
/// found, recycle the least-recently-used unused buffer. Either way,
/// return it locked.
fn bget(dev: u32, blockno: u32) -> &'static mut Buf {
    unsafe {
        BCACHE.lock.acquire();

        if let Some(b) = find(BCACHE.head, true, |b| b.dev == dev && b.blockno == blockno) {
            b.refcnt += 1;
            BCACHE.lock.release();
            b.lock.acquire_sleep();
            return b;
        }

        if let Some(b) = find(BCACHE.head, false, |b| b.refcnt == 0) {
            b.dev = dev;
            b.blockno = blockno;
            b.valid = false;
            b.refcnt = 1;
            BCACHE.lock.release();
            b.lock.acquire_sleep();
            return b;
        }

        BCACHE.lock.release();
    }

    log::error!("bget: no free buffers for dev {} block {}", dev, blockno);
    panic!("bget: no free buffers");
}

/// Return a locked buffer holding the contents of the given block.
pub fn bread(dev: u32, blockno: u32) -> &'static mut Buf {
    let b = bget(dev, blockno);
    if !b.valid {
        ide_rw(b, false);
        b.valid = true;
    }
    b
}

/// Write b's contents to disk. Must be locked.
pub fn bwrite(b: &mut Buf) {
    if !b.lock.holding_sleep() {
        panic!("bwrite");
    }
    ide_rw(b, true);
}

/// Release a locked buffer, moving it to the front of the recency list.
pub fn brelse(b: &mut Buf) {
    if !b.lock.holding_sleep() {
        panic!("brelse");
    }

    b.lock.release_sleep();
    unsafe {
        BCACHE.lock.acquire();
        b.refcnt -= 1;
        if b.refcnt == 0 {
            b.next.unwrap().as_mut().prev = b.prev;
            b.prev.unwrap().as_mut().next = b.next;

            let head = BCACHE.head.as_mut();
            b.next = head.next;
            b.prev = Some(BCACHE.head);

            let bp = NonNull::new_unchecked(b as *mut Buf);
            head.next.unwrap().as_mut().prev = Some(bp);
            head.next = Some(bp);
        }
        BCACHE.lock.release();
    }
}

pub fn bpin(b: &mut Buf) {
    unsafe {
        BCACHE.lock.acquire();
        b.refcnt += 1;
        BCACHE.lock.release();
    }
}

pub fn bunpin(b: &mut Buf) {
    unsafe {
        BCACHE.lock.acquire();
        b.refcnt -= 1;
        BCACHE.lock.release();
    }
}
