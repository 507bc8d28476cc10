// File-system and file-descriptor syscall wrappers.

use core::ptr::NonNull;

use crate::ext2::fs::{
    dirlink, dirlookup, dirunlink, file_type_for, ialloc, ilock, iput, itrunc, iunlock,
    iunlockput, iupdate, namei, nameiparent,
};
use crate::fcntl::{O_CREATE, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
use crate::file::file::{filealloc, fileclose, filedup, fileread, filestat, filewrite};
use crate::file::FDType;
use crate::file::{File, INode, InodeType};
use crate::kalloc::KMEM;
use crate::mmu::PGSIZE;
use crate::param::{MAXARG, MAXPATH, NDEV, NOFILE};
use crate::pipe::pipealloc;
use crate::proc::{either_copyout, myproc};
use crate::syscall::syscall::{argaddr, argint, argstr, fetchstr};

/// Fetch the n'th argument as a file descriptor; returns its slot index
/// and a live reference into that slot's file.
fn argfd(n: u8) -> Option<(usize, &'static mut File)> {
    let fd = argint(n);
    if fd < 0 || fd as usize >= NOFILE {
        return None;
    }
    let fd = fd as usize;
    let f = myproc().ofile[fd]?;
    Some((fd, unsafe { &mut *f.as_ptr() }))
}

/// Install `f` in the first free descriptor slot of the calling process.
fn fdalloc(f: *mut File) -> Option<usize> {
    let p = myproc();
    for fd in 0..NOFILE {
        if p.ofile[fd].is_none() {
            p.ofile[fd] = NonNull::new(f);
            return Some(fd);
        }
    }
    None
}

/// Fetch the n'th argument as a path string, trimmed to its real length
/// (the fixed buffer is zero-padded past the NUL, which would otherwise
/// read as bogus path components to namei's byte-slice walk).
fn argpath(n: u8, buf: &mut [u8; MAXPATH]) -> Option<usize> {
    let len = argstr(n, buf);
    if len < 0 {
        None
    } else {
        Some(len as usize)
    }
}

pub(crate) fn sys_dup() -> i32 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return -1,
    };
    let fp = f as *mut File;
    let fd = match fdalloc(fp) {
        Some(fd) => fd,
        None => return -1,
    };
    filedup(fp);
    fd as i32
}

pub(crate) fn sys_read() -> i32 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return -1,
    };
    let dst = argaddr(1);
    let n = argint(2);
    if n < 0 {
        return -1;
    }
    match fileread(f, dst, n as usize) {
        Ok(r) => r as i32,
        Err(_) => -1,
    }
}

pub(crate) fn sys_write() -> i32 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return -1,
    };
    let src = argaddr(1);
    let n = argint(2);
    if n < 0 {
        return -1;
    }
    match filewrite(f, src, n as usize) {
        Ok(w) => w as i32,
        Err(_) => -1,
    }
}

pub(crate) fn sys_close() -> i32 {
    let (fd, f) = match argfd(0) {
        Some(v) => v,
        None => return -1,
    };
    myproc().ofile[fd] = None;
    fileclose(f);
    0
}

pub(crate) fn sys_fstat() -> i32 {
    let (_, f) = match argfd(0) {
        Some(v) => v,
        None => return -1,
    };
    let st_addr = argaddr(1);
    let mut st = crate::stat::Stat {
        dev: 0,
        ino: 0,
        type_: 0,
        nlink: 0,
        size: 0,
    };
    if filestat(f, &mut st).is_err() {
        return -1;
    }
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &st as *const crate::stat::Stat as *const u8,
            core::mem::size_of::<crate::stat::Stat>(),
        )
    };
    if either_copyout(true, st_addr, bytes).is_err() {
        return -1;
    }
    0
}

/// Create a hard link: `new` -> the inode that `old` resolves to. Files
/// only; directories cannot be hard-linked.
pub(crate) fn sys_link() -> i32 {
    let mut old_buf = [0u8; MAXPATH];
    let mut new_buf = [0u8; MAXPATH];
    let old_len = match argpath(0, &mut old_buf) {
        Some(l) => l,
        None => return -1,
    };
    let new_len = match argpath(1, &mut new_buf) {
        Some(l) => l,
        None => return -1,
    };

    let mut ip = match namei(&old_buf[..old_len]) {
        Some(ip) => ip,
        None => return -1,
    };
    let ip_ref = unsafe { ip.as_mut() };
    ilock(ip_ref);
    if ip_ref.is_dir() {
        iunlockput(ip_ref);
        return -1;
    }
    ip_ref.nlink += 1;
    iupdate(ip_ref);
    iunlock(ip_ref);

    let linked = (|| -> Option<()> {
        let (mut dp, name) = nameiparent(&new_buf[..new_len])?;
        let dp_ref = unsafe { dp.as_mut() };
        ilock(dp_ref);
        let ok = dp_ref.dev == ip_ref.dev
            && dirlink(dp_ref, name, ip_ref.inum, file_type_for(ip_ref.file_type)).is_ok();
        iunlockput(dp_ref);
        if ok {
            Some(())
        } else {
            None
        }
    })();

    if linked.is_none() {
        ilock(ip_ref);
        ip_ref.nlink -= 1;
        iupdate(ip_ref);
        iunlockput(ip_ref);
        return -1;
    }

    iput(ip_ref);
    0
}

pub(crate) fn sys_unlink() -> i32 {
    let mut buf = [0u8; MAXPATH];
    let len = match argpath(0, &mut buf) {
        Some(l) => l,
        None => return -1,
    };

    let (mut dp, name) = match nameiparent(&buf[..len]) {
        Some(v) => v,
        None => return -1,
    };
    let dp_ref = unsafe { dp.as_mut() };
    ilock(dp_ref);

    if name == b"." || name == b".." {
        iunlockput(dp_ref);
        return -1;
    }

    let (mut ip, off) = match dirlookup(dp_ref, name) {
        Some(v) => v,
        None => {
            iunlockput(dp_ref);
            return -1;
        }
    };
    let ip_ref = unsafe { ip.as_mut() };
    ilock(ip_ref);

    if ip_ref.nlink < 1 {
        panic!("sys_unlink: inode with no links");
    }
    if ip_ref.is_dir() && !crate::ext2::fs::dir_is_empty(ip_ref) {
        iunlockput(ip_ref);
        iunlockput(dp_ref);
        return -1;
    }

    dirunlink(dp_ref, off);
    if ip_ref.is_dir() {
        dp_ref.nlink -= 1;
        iupdate(dp_ref);
    }
    iunlockput(dp_ref);

    ip_ref.nlink -= 1;
    iupdate(ip_ref);
    iunlockput(ip_ref);
    0
}

/// Shared by sys_open's O_CREATE path, sys_mknod, and sys_mkdir: resolve
/// the parent, bail if the name already exists as an incompatible type,
/// otherwise allocate a fresh inode and link it in.
fn create(path: &[u8], file_type: InodeType, major: u16, minor: u16) -> Option<NonNull<INode>> {
    let (mut dp, name) = nameiparent(path)?;
    let dp_ref = unsafe { dp.as_mut() };
    ilock(dp_ref);

    if let Some((mut ip, _off)) = dirlookup(dp_ref, name) {
        iunlockput(dp_ref);
        let ip_ref = unsafe { ip.as_mut() };
        ilock(ip_ref);
        if file_type == InodeType::File
            && (ip_ref.file_type == InodeType::File || ip_ref.file_type == InodeType::Device)
        {
            return Some(ip);
        }
        iunlockput(ip_ref);
        return None;
    }

    let mut ip = ialloc(dp_ref.dev, file_type)?;
    let ip_ref = unsafe { ip.as_mut() };
    ilock(ip_ref);
    ip_ref.major = major;
    ip_ref.minor = minor;
    ip_ref.nlink = 1;
    iupdate(ip_ref);

    if file_type == InodeType::Dir {
        // No nlink bump for "." -- avoid a self-reference cycle.
        if dirlink(ip_ref, b".", ip_ref.inum, file_type_for(InodeType::Dir)).is_err()
            || dirlink(dp_ref, b"..", dp_ref.inum, file_type_for(InodeType::Dir)).is_err()
        {
            ip_ref.nlink = 0;
            iupdate(ip_ref);
            iunlockput(ip_ref);
            iunlockput(dp_ref);
            return None;
        }
    }

    if dirlink(dp_ref, name, ip_ref.inum, file_type_for(file_type)).is_err() {
        ip_ref.nlink = 0;
        iupdate(ip_ref);
        iunlockput(ip_ref);
        iunlockput(dp_ref);
        return None;
    }

    if file_type == InodeType::Dir {
        dp_ref.nlink += 1; // for ".."
        iupdate(dp_ref);
    }

    iunlockput(dp_ref);
    Some(ip)
}

pub(crate) fn sys_open() -> i32 {
    let mut buf = [0u8; MAXPATH];
    let len = match argpath(0, &mut buf) {
        Some(l) => l,
        None => return -1,
    };
    let omode = argint(1);

    let mut ip = if omode & O_CREATE != 0 {
        match create(&buf[..len], InodeType::File, 0, 0) {
            Some(ip) => ip,
            None => return -1,
        }
    } else {
        let mut ip = match namei(&buf[..len]) {
            Some(ip) => ip,
            None => return -1,
        };
        let ip_ref = unsafe { ip.as_mut() };
        ilock(ip_ref);
        if ip_ref.is_dir() && omode != O_RDONLY {
            iunlockput(ip_ref);
            return -1;
        }
        ip
    };

    let ip_ref = unsafe { ip.as_mut() };
    if ip_ref.file_type == InodeType::Device && ip_ref.major as usize >= NDEV {
        iunlockput(ip_ref);
        return -1;
    }

    let f = match filealloc() {
        Some(f) => f,
        None => {
            iunlockput(ip_ref);
            return -1;
        }
    };
    let fp = f as *mut File;
    let fd = match fdalloc(fp) {
        Some(fd) => fd,
        None => {
            fileclose(unsafe { &mut *fp });
            iunlockput(ip_ref);
            return -1;
        }
    };

    if ip_ref.file_type == InodeType::Device {
        unsafe {
            (*fp).file_type = FDType::FdDevice;
            (*fp).major = ip_ref.major;
        }
    } else {
        unsafe {
            (*fp).file_type = FDType::FdInode;
            (*fp).off = 0;
        }
    }
    unsafe {
        (*fp).ip = Some(ip);
        (*fp).readable = omode & O_WRONLY == 0;
        (*fp).writable = (omode & O_WRONLY) != 0 || (omode & O_RDWR) != 0;
    }

    if (omode & O_TRUNC) != 0 && ip_ref.file_type == InodeType::File {
        itrunc(ip_ref);
    }

    iunlock(ip_ref);
    fd as i32
}

pub(crate) fn sys_mkdir() -> i32 {
    let mut buf = [0u8; MAXPATH];
    let len = match argpath(0, &mut buf) {
        Some(l) => l,
        None => return -1,
    };
    match create(&buf[..len], InodeType::Dir, 0, 0) {
        Some(mut ip) => {
            iunlockput(unsafe { ip.as_mut() });
            0
        }
        None => -1,
    }
}

pub(crate) fn sys_mknod() -> i32 {
    let mut buf = [0u8; MAXPATH];
    let len = match argpath(0, &mut buf) {
        Some(l) => l,
        None => return -1,
    };
    let major = argint(1) as u16;
    let minor = argint(2) as u16;
    match create(&buf[..len], InodeType::Device, major, minor) {
        Some(mut ip) => {
            iunlockput(unsafe { ip.as_mut() });
            0
        }
        None => -1,
    }
}

pub(crate) fn sys_chdir() -> i32 {
    let mut buf = [0u8; MAXPATH];
    let len = match argpath(0, &mut buf) {
        Some(l) => l,
        None => return -1,
    };
    let mut ip = match namei(&buf[..len]) {
        Some(ip) => ip,
        None => return -1,
    };
    let ip_ref = unsafe { ip.as_mut() };
    ilock(ip_ref);
    if !ip_ref.is_dir() {
        iunlockput(ip_ref);
        return -1;
    }
    iunlock(ip_ref);

    let p = myproc();
    if let Some(mut old) = p.cwd.take() {
        iput(unsafe { old.as_mut() });
    }
    p.cwd = Some(ip);
    0
}

pub(crate) fn sys_pipe() -> i32 {
    let fdarray_addr = argaddr(0);
    let p = myproc();

    let pp = match pipealloc() {
        Some(pp) => pp,
        None => return -1,
    };

    let rf = match filealloc() {
        Some(f) => f as *mut File,
        None => {
            unsafe {
                (&mut *pp).close(true);
                (&mut *pp).close(false);
            }
            return -1;
        }
    };
    let wf = match filealloc() {
        Some(f) => f as *mut File,
        None => {
            fileclose(unsafe { &mut *rf });
            unsafe {
                (&mut *pp).close(true);
                (&mut *pp).close(false);
            }
            return -1;
        }
    };

    let fd0 = match fdalloc(rf) {
        Some(fd) => fd,
        None => {
            fileclose(unsafe { &mut *rf });
            fileclose(unsafe { &mut *wf });
            unsafe {
                (&mut *pp).close(true);
                (&mut *pp).close(false);
            }
            return -1;
        }
    };
    let fd1 = match fdalloc(wf) {
        Some(fd) => fd,
        None => {
            p.ofile[fd0] = None;
            fileclose(unsafe { &mut *rf });
            fileclose(unsafe { &mut *wf });
            unsafe {
                (&mut *pp).close(true);
                (&mut *pp).close(false);
            }
            return -1;
        }
    };

    unsafe {
        (*rf).file_type = FDType::FdPipe;
        (*rf).pipe = NonNull::new(pp);
        (*rf).readable = true;
        (*rf).writable = false;

        (*wf).file_type = FDType::FdPipe;
        (*wf).pipe = NonNull::new(pp);
        (*wf).readable = false;
        (*wf).writable = true;
    }

    let fds = [fd0 as u32, fd1 as u32];
    let bytes = unsafe {
        core::slice::from_raw_parts(fds.as_ptr() as *const u8, core::mem::size_of_val(&fds))
    };
    if either_copyout(true, fdarray_addr, bytes).is_err() {
        // The two files now own the pipe; closing them is enough.
        p.ofile[fd0] = None;
        p.ofile[fd1] = None;
        fileclose(unsafe { &mut *rf });
        fileclose(unsafe { &mut *wf });
        return -1;
    }

    0
}

/// Build the kernel-side argv (one kalloc'd page per argument, copied
/// from the caller's array of user pointers) and hand off to exec.rs.
pub(crate) fn sys_exec() -> i32 {
    let mut path_buf = [0u8; MAXPATH];
    let path_len = match argpath(0, &mut path_buf) {
        Some(l) => l,
        None => return -1,
    };
    let uargv = argaddr(1);

    let mut argv: [Option<*mut u8>; MAXARG] = [None; MAXARG];
    let mut bad = false;
    let mut argc = 0usize;

    while argc < MAXARG {
        let p = myproc();
        let ptr_addr = uargv + core::mem::size_of::<u32>() * argc;
        if ptr_addr >= p.sz || ptr_addr + 4 > p.sz {
            bad = true;
            break;
        }
        let mut raw = [0u8; 4];
        if crate::vm::copyin(p.pgdir_mut(), &mut raw, ptr_addr).is_err() {
            bad = true;
            break;
        }
        let uarg = u32::from_le_bytes(raw) as usize;
        if uarg == 0 {
            break;
        }

        let page: *mut u8 = unsafe { KMEM.kalloc() };
        if page.is_null() {
            bad = true;
            break;
        }
        argv[argc] = Some(page);

        let buf = unsafe { core::slice::from_raw_parts_mut(page, PGSIZE) };
        if fetchstr(uarg, buf) < 0 {
            bad = true;
            break;
        }
        argc += 1;
    }

    let ret = if bad {
        -1
    } else {
        crate::exec::exec(&path_buf[..path_len], &argv[..argc])
    };

    for slot in argv.iter() {
        match slot {
            Some(p) => unsafe { KMEM.kfree(*p) },
            None => break,
        }
    }

    ret
}
