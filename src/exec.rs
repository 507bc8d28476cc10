// Replace the calling process's image with a fresh ELF32 binary.

use core::mem;

use crate::elf::{ElfHeader, ProgramHeader, ELF_MAGIC, ELF_PROG_LOAD};
use crate::error::{KError, KResult};
use crate::ext2::fs::{ilock, iunlockput, namei, readi};
use crate::file::INode;
use crate::mmu::PGSIZE;
use crate::param::MAXARG;
use crate::proc::myproc;
use crate::vm::{allocuvm, clearpteu, copyout, loaduvm, uvmcreate, uvmfree};
use crate::PGROUNDUP;

/// `path` and the live prefix of `argv` are both kernel-resident: the
/// caller (sys_exec) has already copied the path and each argument
/// string out of user memory.
pub fn exec(path: &[u8], argv: &[Option<*mut u8>]) -> i32 {
    let ip = match namei(path) {
        Some(mut ip) => {
            let ip_ref = unsafe { ip.as_mut() };
            ilock(ip_ref);
            ip
        }
        None => return -1,
    };
    let ip_ref = unsafe { &mut *ip.as_ptr() };

    let mut elf = ElfHeader::create();
    if read_header(ip_ref, &mut elf).is_err() || elf.magic != ELF_MAGIC {
        iunlockput(ip_ref);
        return -1;
    }

    let pgdir_ptr = match uvmcreate() {
        Some(pg) => pg,
        None => {
            iunlockput(ip_ref);
            return -1;
        }
    };
    let pgdir = unsafe { &mut *pgdir_ptr };

    let mut sz = 0usize;
    let mut off = elf.phoff;
    for _ in 0..elf.phnum {
        let mut ph = ProgramHeader::create();
        if read_phdr(ip_ref, off, &mut ph).is_err() {
            uvmfree(pgdir, sz);
            iunlockput(ip_ref);
            return -1;
        }
        off += mem::size_of::<ProgramHeader>() as u32;

        if ph.hdr_type != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            uvmfree(pgdir, sz);
            iunlockput(ip_ref);
            return -1;
        }
        if ph.vaddr.checked_add(ph.memsz).is_none() {
            uvmfree(pgdir, sz);
            iunlockput(ip_ref);
            return -1;
        }
        if ph.vaddr as usize % PGSIZE != 0 {
            uvmfree(pgdir, sz);
            iunlockput(ip_ref);
            return -1;
        }

        sz = match allocuvm(pgdir, sz, (ph.vaddr + ph.memsz) as usize) {
            Some(s) => s,
            None => {
                uvmfree(pgdir, sz);
                iunlockput(ip_ref);
                return -1;
            }
        };

        let offset = ph.off as usize;
        let filesz = ph.filesz as usize;
        let ok = loaduvm(
            pgdir,
            ph.vaddr as usize,
            |buf, file_off| {
                let n = readi(ip_ref, false, buf.as_mut_ptr() as usize, file_off as u32, buf.len());
                if n == buf.len() {
                    Ok(n)
                } else {
                    Err(KError::BadAddr)
                }
            },
            offset,
            filesz,
        );
        if ok.is_err() {
            uvmfree(pgdir, sz);
            iunlockput(ip_ref);
            return -1;
        }
    }
    iunlockput(ip_ref);

    // Allocate two pages past the next page boundary: a guard page the
    // user can't touch, then the stack itself.
    sz = PGROUNDUP!(sz);
    sz = match allocuvm(pgdir, sz, sz + 2 * PGSIZE) {
        Some(s) => s,
        None => {
            uvmfree(pgdir, sz);
            return -1;
        }
    };
    clearpteu(pgdir, sz - 2 * PGSIZE);

    let mut sp = sz;
    let stackbase = sp - PGSIZE;
    let mut ustack: [u32; MAXARG + 1] = [0; MAXARG + 1];
    let mut argc = 0usize;

    while argc < argv.len() {
        let arg = match argv[argc] {
            Some(a) => a,
            None => break,
        };
        let len = unsafe { strlen_raw(arg) };
        sp -= len + 1;
        sp &= !3; // word align
        if sp < stackbase {
            uvmfree(pgdir, sz);
            return -1;
        }
        let bytes = unsafe { core::slice::from_raw_parts(arg, len + 1) };
        if copyout(pgdir, sp, bytes).is_err() {
            uvmfree(pgdir, sz);
            return -1;
        }
        ustack[argc] = sp as u32;
        argc += 1;
    }
    ustack[argc] = 0;

    // Push argv[] itself, then argc, then a fake return address -- this
    // is exactly the stack frame a call to main(argc, argv) expects.
    sp -= (argc + 1) * mem::size_of::<u32>();
    sp &= !3;
    if sp < stackbase {
        uvmfree(pgdir, sz);
        return -1;
    }
    let argv_bytes = unsafe {
        core::slice::from_raw_parts(ustack.as_ptr() as *const u8, (argc + 1) * mem::size_of::<u32>())
    };
    if copyout(pgdir, sp, argv_bytes).is_err() {
        uvmfree(pgdir, sz);
        return -1;
    }
    let argv_addr = sp as u32;

    sp -= mem::size_of::<u32>();
    if copyout(pgdir, sp, &argv_addr.to_le_bytes()).is_err() {
        uvmfree(pgdir, sz);
        return -1;
    }

    sp -= mem::size_of::<u32>();
    if copyout(pgdir, sp, &(argc as u32).to_le_bytes()).is_err() {
        uvmfree(pgdir, sz);
        return -1;
    }

    // Fake return PC: user main() is never supposed to return, so a jump
    // here is a sure sign something went wrong.
    sp -= mem::size_of::<u32>();
    if copyout(pgdir, sp, &0xFFFF_FFFFu32.to_le_bytes()).is_err() {
        uvmfree(pgdir, sz);
        return -1;
    }

    let p = myproc();
    let mut name = [0u8; 16];
    let basename_start = path
        .iter()
        .rposition(|&b| b == b'/')
        .map(|i| i + 1)
        .unwrap_or(0);
    let base = &path[basename_start..];
    let take = base.len().min(name.len());
    name[..take].copy_from_slice(&base[..take]);
    p.name = name;

    let oldpgdir = p.pgdir.unwrap();
    let oldsz = p.sz;
    p.pgdir = core::ptr::NonNull::new(pgdir_ptr);
    p.sz = sz;
    let tf = unsafe { p.tf.unwrap().as_mut() };
    tf.eip = elf.entry;
    tf.esp = sp as u32;

    uvmfree(unsafe { &mut *oldpgdir.as_ptr() }, oldsz);

    // argc -- mirrors the value main(argc, argv) expects; the syscall
    // layer writes this straight into eax as the exec() return value.
    argc as i32
}

fn read_header(ip: &mut INode, elf: &mut ElfHeader) -> KResult<()> {
    let n = readi(
        ip,
        false,
        elf as *mut ElfHeader as usize,
        0,
        mem::size_of::<ElfHeader>(),
    );
    if n == mem::size_of::<ElfHeader>() {
        Ok(())
    } else {
        Err(KError::BadAddr)
    }
}

fn read_phdr(ip: &mut INode, off: u32, ph: &mut ProgramHeader) -> KResult<()> {
    let n = readi(
        ip,
        false,
        ph as *mut ProgramHeader as usize,
        off,
        mem::size_of::<ProgramHeader>(),
    );
    if n == mem::size_of::<ProgramHeader>() {
        Ok(())
    } else {
        Err(KError::BadAddr)
    }
}

unsafe fn strlen_raw(p: *const u8) -> usize {
    let mut n = 0;
    while *p.add(n) != 0 {
        n += 1;
    }
    n
}
