// File table: a fixed-size array of file objects shared by every open
// file descriptor in the system, guarded by one spinlock.

use crate::error::{KError, KResult};
use crate::ext2::fs;
use crate::file::{FDType, File};
use crate::param::NFILE;
use crate::proc::{either_copyin, either_copyout};
use crate::spinlock::Spinlock;

struct FTable {
    lock: Spinlock,
    file: [File; NFILE],
}

const FTABLE_ENTRY: File = File::create();
static mut FTABLE: FTable = FTable {
    lock: Spinlock::init_lock("ftable"),
    file: [FTABLE_ENTRY; NFILE],
};

pub fn fileinit() {
    // FTABLE is already fully initialized as a static.
}

/// Return the first zero-ref slot, marked with ref_cnt 1.
pub fn filealloc() -> Option<&'static mut File> {
    unsafe {
        FTABLE.lock.acquire();
        for f in FTABLE.file.iter_mut() {
            if f.ref_cnt == 0 {
                f.ref_cnt = 1;
                FTABLE.lock.release();
                return Some(f);
            }
        }
        FTABLE.lock.release();
        None
    }
}

pub(crate) fn filedup(f: *mut File) {
    unsafe {
        FTABLE.lock.acquire();
        let f = f.as_mut().unwrap();
        if f.ref_cnt < 1 {
            panic!("filedup: already closed");
        }
        f.ref_cnt += 1;
        FTABLE.lock.release();
    }
}

/// Decrement ref_cnt; on reaching zero, release the underlying endpoint
/// (the matching pipe half, or the inode reference).
pub(crate) fn fileclose(f: &mut File) {
    unsafe {
        FTABLE.lock.acquire();
        if f.ref_cnt < 1 {
            panic!("fileclose: already closed");
        }
        f.ref_cnt -= 1;
        if f.ref_cnt > 0 {
            FTABLE.lock.release();
            return;
        }

        let file_type = f.file_type;
        let pipe = f.pipe;
        let writable = f.writable;
        let ip = f.ip;

        f.ref_cnt = 0;
        f.file_type = FDType::FdNone;
        FTABLE.lock.release();

        match file_type {
            FDType::FdPipe => {
                if let Some(mut p) = pipe {
                    p.as_mut().close(writable);
                }
            }
            FDType::FdInode | FDType::FdDevice => {
                if let Some(mut ip) = ip {
                    fs::iput(ip.as_mut());
                }
            }
            FDType::FdNone => {}
        }
    }
}

/// Populate `st` from `f`'s inode. Fails for pipe-backed descriptors.
pub fn filestat(f: &File, st: &mut crate::stat::Stat) -> KResult<()> {
    match f.file_type {
        FDType::FdInode | FDType::FdDevice => unsafe {
            let mut ip = f.ip.unwrap();
            fs::ilock(ip.as_mut());
            crate::stat::stati(ip.as_ref(), st);
            fs::iunlock(ip.as_mut());
            Ok(())
        },
        _ => Err(KError::BadAddr),
    }
}

/// Read up to `n` bytes from `f` into the calling process's address
/// space at user virtual address `dst`.
pub fn fileread(f: &mut File, dst: usize, n: usize) -> KResult<usize> {
    if !f.readable {
        return Err(KError::BadAddr);
    }

    match f.file_type {
        FDType::FdPipe => {
            let mut p = f.pipe.unwrap();
            let mut buf = [0u8; 512];
            let mut total = 0usize;
            while total < n {
                let chunk = core::cmp::min(n - total, buf.len());
                let got = unsafe { p.as_mut().read(&mut buf[..chunk], chunk) };
                if got <= 0 {
                    break;
                }
                either_copyout(true, dst + total, &buf[..got as usize])?;
                total += got as usize;
                if (got as usize) < chunk {
                    break;
                }
            }
            Ok(total)
        }
        FDType::FdDevice | FDType::FdInode => unsafe {
            let mut ip = f.ip.unwrap();
            fs::ilock(ip.as_mut());
            let r = fs::readi(ip.as_mut(), true, dst, f.off, n);
            f.off += r as u32;
            fs::iunlock(ip.as_mut());
            Ok(r)
        },
        FDType::FdNone => Err(KError::BadAddr),
    }
}

/// Write `n` bytes from user virtual address `src` to `f`. Inode writes
/// are chunked so a single call never holds more than a handful of
/// blocks' worth of log/transaction state.
pub fn filewrite(f: &mut File, src: usize, n: usize) -> KResult<usize> {
    if !f.writable {
        return Err(KError::BadAddr);
    }

    match f.file_type {
        FDType::FdPipe => {
            let mut p = f.pipe.unwrap();
            let mut buf = [0u8; 512];
            let mut total = 0usize;
            while total < n {
                let chunk = core::cmp::min(n - total, buf.len());
                either_copyin(&mut buf[..chunk], true, src + total)?;
                let w = unsafe { p.as_mut().write(&buf[..chunk], chunk) };
                if w < 0 {
                    return Err(KError::IoFault);
                }
                total += w as usize;
            }
            Ok(total)
        }
        FDType::FdDevice => unsafe {
            let mut ip = f.ip.unwrap();
            fs::ilock(ip.as_mut());
            let w = fs::writei(ip.as_mut(), true, src, f.off, n);
            fs::iunlock(ip.as_mut());
            if w < 0 {
                Err(KError::IoFault)
            } else {
                Ok(w as usize)
            }
        },
        FDType::FdInode => {
            // Break large writes into chunks that each touch a bounded
            // number of blocks, matching how the rest of the kernel
            // keeps any single operation's working set small.
            const MAX: usize = 1024 * 8;
            let mut total = 0usize;
            let mut off = src;
            while total < n {
                let chunk = core::cmp::min(n - total, MAX);
                unsafe {
                    let mut ip = f.ip.unwrap();
                    fs::ilock(ip.as_mut());
                    let w = fs::writei(ip.as_mut(), true, off, f.off, chunk);
                    fs::iunlock(ip.as_mut());
                    if w < 0 || w as usize != chunk {
                        return if total > 0 { Ok(total) } else { Err(KError::IoFault) };
                    }
                    f.off += w as u32;
                }
                total += chunk;
                off += chunk;
            }
            Ok(total)
        }
        FDType::FdNone => Err(KError::BadAddr),
    }
}
