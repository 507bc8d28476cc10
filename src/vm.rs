// Virtual memory: building and walking x86 two-level page tables.
//
// The kernel page directory maps physical memory [0, PHYSTOP) at two
// places: identity below EXTMEM (needed for the handful of real-mode/BIOS
// era addresses) and again at KERNBASE..KERNBASE+PHYSTOP-EXTMEM, which is
// where the kernel itself actually runs once paging is live. Every user
// process page table is a full copy of that kernel mapping plus its own
// user-space entries below KERNBASE, so a syscall trap never needs to
// switch page tables to reach kernel code or data.

use crate::kalloc::KMEM;
use crate::memlayout::{p2v, v2p, DEVSPACE, EXTMEM, KERNBASE, KERNLINK, PHYSTOP};
use crate::mmu::{pdx, ptx, PageTable, Pte, PteFlags, NPTENTRIES, PGSIZE};
use crate::string::{memmove, memset};
use crate::x86::{invlpg, lcr3};
use crate::{PGROUNDDOWN, PGROUNDUP};
use core::sync::atomic::{AtomicPtr, Ordering};

pub static KERNEL_PAGETABLE: AtomicPtr<PageTable> = AtomicPtr::new(core::ptr::null_mut());

extern "C" {
    static etext: u8; // kernel.ld: end of kernel text
}

struct Kmap {
    virt: usize,
    phys_start: usize,
    phys_end: usize,
    flags: PteFlags,
}

fn kmap() -> [Kmap; 4] {
    let etext_va = unsafe { (&etext as *const u8) as usize };
    [
        Kmap {
            virt: KERNBASE,
            phys_start: 0,
            phys_end: EXTMEM,
            flags: PteFlags::W,
        },
        Kmap {
            virt: KERNLINK,
            phys_start: v2p(KERNLINK),
            phys_end: v2p(etext_va),
            flags: PteFlags::empty(),
        },
        Kmap {
            virt: etext_va,
            phys_start: v2p(etext_va),
            phys_end: PHYSTOP,
            flags: PteFlags::W,
        },
        Kmap {
            virt: DEVSPACE,
            phys_start: DEVSPACE,
            phys_end: 0xFFFF_FFFF,
            flags: PteFlags::W,
        },
    ]
}

fn kvmmake() -> *mut PageTable {
    let pg: *mut PageTable = KMEM.kalloc();
    if pg.is_null() {
        panic!("kvmmake: out of memory for root page directory");
    }
    unsafe {
        memset(pg as *mut u8, 0, PGSIZE);
    }
    let pgdir = unsafe { &mut *pg };

    for k in kmap().iter() {
        let size = k.phys_end - k.phys_start;
        if mappages(pgdir, k.virt, k.phys_start, size, k.flags) != 0 {
            panic!("kvmmake: out of memory mapping kernel");
        }
    }

    pg
}

/// Initialize the single shared kernel page directory.
pub fn kvminit() {
    let pg = kvmmake();
    KERNEL_PAGETABLE.store(pg, Ordering::Release);
}

/// Load %cr3 with the shared kernel page directory. The scheduler calls
/// this the moment it regains the CPU from a process, so %cr3 is never
/// left pointing at a pgdir that a concurrent wait()/freeproc() could
/// uvmfree() out from under this CPU.
pub fn switchkvm() {
    let pg = KERNEL_PAGETABLE.load(Ordering::Acquire);
    lcr3(v2p(pg as usize));
}

/// Switch this CPU's %cr3 to the kernel page directory and turn paging on.
/// Called once per CPU during boot.
pub fn kvminithart() {
    switchkvm();
}

/// Add a mapping to the given page table; panics on failure. Only used
/// while constructing the initial kernel page table.
pub fn kvmmap(pgdir: &mut PageTable, va: usize, pa: usize, sz: usize, perm: PteFlags) {
    if mappages(pgdir, va, pa, sz, perm) != 0 {
        panic!("kvmmap");
    }
}

/// Return a pointer to the PTE for virtual address `va`, allocating
/// intermediate page table pages on the way down if `alloc` is set.
fn walk(pgdir: &mut PageTable, va: usize, alloc: bool) -> Option<*mut Pte> {
    let pde = &mut pgdir.0[pdx(va)];
    let pgtab: *mut PageTable = if pde.present() {
        p2v(pde.addr()) as *mut PageTable
    } else {
        if !alloc {
            return None;
        }
        let pg: *mut PageTable = KMEM.kalloc();
        if pg.is_null() {
            return None;
        }
        unsafe {
            memset(pg as *mut u8, 0, PGSIZE);
        }
        *pde = Pte::new(v2p(pg as usize), PteFlags::P | PteFlags::W | PteFlags::U);
        pg
    };

    unsafe { Some(&mut (*pgtab).0[ptx(va)] as *mut Pte) }
}

/// Map [va, va+size) to [pa, pa+size), rounding to page boundaries.
/// Returns 0 on success, -1 if a page table page could not be allocated.
pub fn mappages(pgdir: &mut PageTable, va: usize, pa: usize, size: usize, perm: PteFlags) -> i32 {
    if size == 0 {
        return 0;
    }

    let mut a = PGROUNDDOWN!(va);
    let last = PGROUNDDOWN!(va + size - 1);
    let mut p = pa;

    loop {
        let pte = match walk(pgdir, a, true) {
            Some(pte) => pte,
            None => return -1,
        };
        unsafe {
            if (*pte).present() {
                panic!("mappages: remap");
            }
            *pte = Pte::new(p, perm | PteFlags::P);
        }

        if a == last {
            break;
        }
        a += PGSIZE;
        p += PGSIZE;
    }
    0
}

/// Remove npages mappings starting at va, optionally freeing the backing
/// physical pages. va must be page-aligned and the mappings must exist.
pub fn uvmunmap(pgdir: &mut PageTable, va: usize, npages: usize, do_free: bool) {
    if va % PGSIZE != 0 {
        panic!("uvmunmap: not aligned");
    }

    for i in 0..npages {
        let a = va + i * PGSIZE;
        match walk(pgdir, a, false) {
            None => continue,
            Some(pte) => unsafe {
                if !(*pte).present() {
                    continue;
                }
                if do_free {
                    let pa = p2v((*pte).addr());
                    KMEM.kfree(pa as *mut PageTable);
                }
                *pte = Pte::absent();
            },
        }
    }
}

/// Create a blank user page table with no mappings.
pub fn uvmcreate() -> Option<*mut PageTable> {
    let pg: *mut PageTable = KMEM.kalloc();
    if pg.is_null() {
        return None;
    }
    unsafe {
        memset(pg as *mut u8, 0, PGSIZE);
    }
    Some(pg)
}

/// Load the user initcode at virtual address 0. sz must be less than a page.
pub fn uvmfirst(pgdir: &mut PageTable, src: *const u8, sz: usize) {
    if sz >= PGSIZE {
        panic!("uvmfirst: more than a page");
    }
    let mem: *mut u8 = KMEM.kalloc();
    unsafe {
        memset(mem, 0, PGSIZE);
    }
    mappages(
        pgdir,
        0,
        v2p(mem as usize),
        PGSIZE,
        PteFlags::W | PteFlags::U,
    );
    memmove(mem, src, sz);
}

/// Grow or shrink a process's user address space from oldsz to newsz.
/// Returns the new size, or None on out-of-memory (in which case the
/// address space is left unchanged from the caller's perspective, any
/// pages allocated during the failed attempt having been freed).
pub fn allocuvm(pgdir: &mut PageTable, oldsz: usize, newsz: usize) -> Option<usize> {
    if newsz < oldsz {
        return Some(oldsz);
    }
    if newsz >= KERNBASE {
        return None;
    }

    let mut a = PGROUNDUP!(oldsz);
    while a < newsz {
        let mem: *mut u8 = KMEM.kalloc();
        if mem.is_null() {
            deallocuvm(pgdir, newsz, oldsz);
            return None;
        }
        unsafe {
            memset(mem, 0, PGSIZE);
        }
        if mappages(
            pgdir,
            a,
            v2p(mem as usize),
            PGSIZE,
            PteFlags::W | PteFlags::U,
        ) != 0
        {
            unsafe {
                KMEM.kfree(mem);
            }
            deallocuvm(pgdir, newsz, oldsz);
            return None;
        }
        a += PGSIZE;
    }
    Some(newsz)
}

/// Shrink a process's address space from oldsz to newsz, freeing pages.
pub fn deallocuvm(pgdir: &mut PageTable, oldsz: usize, newsz: usize) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }

    let newpg = PGROUNDUP!(newsz);
    if newpg < oldsz {
        let npages = (oldsz - newpg) / PGSIZE;
        uvmunmap(pgdir, newpg, npages, true);
    }
    newsz
}

/// Recursively free page-table pages; the leaf mappings must already be gone.
fn freewalk(pgdir: *mut PageTable) {
    let pgdir_ref = unsafe { &mut *pgdir };
    for pte in pgdir_ref.0.iter_mut() {
        if pte.present() {
            let child = p2v(pte.addr()) as *mut PageTable;
            freewalk(child);
            *pte = Pte::absent();
        }
    }
    unsafe { KMEM.kfree(pgdir) };
}

/// Free a user page table and all the user memory pages it maps.
pub fn uvmfree(pgdir: &mut PageTable, sz: usize) {
    if sz > 0 {
        uvmunmap(pgdir, 0, PGROUNDUP!(sz) / PGSIZE, true);
    }
    freewalk(pgdir as *mut PageTable);
}

/// Clear the PTE_U bit for the page at va, so user code can no longer
/// reach it. Used to mark the guard page below a process's user stack.
pub fn clearpteu(pgdir: &mut PageTable, va: usize) {
    match walk(pgdir, va, false) {
        None => panic!("clearpteu"),
        Some(pte) => unsafe {
            let flags = (*pte).flags() & !PteFlags::U;
            let addr = (*pte).addr();
            *pte = Pte::new(addr, flags);
        },
    }
}

/// Duplicate a user page table and all its physical pages. Returns the
/// new page table, or None on allocation failure (nothing is leaked).
pub fn copyuvm(pgdir: &mut PageTable, sz: usize) -> Option<*mut PageTable> {
    let d = uvmcreate()?;
    let dref = unsafe { &mut *d };

    for k in kmap().iter() {
        let size = k.phys_end - k.phys_start;
        mappages(dref, k.virt, k.phys_start, size, k.flags);
    }

    let mut i = 0;
    while i < sz {
        let pte = match walk(pgdir, i, false) {
            Some(pte) => pte,
            None => panic!("copyuvm: pte should exist"),
        };
        let (pa, flags) = unsafe {
            if !(*pte).present() {
                panic!("copyuvm: page not present");
            }
            ((*pte).addr(), (*pte).flags())
        };

        let mem: *mut u8 = KMEM.kalloc();
        if mem.is_null() {
            uvmfree(dref, i);
            return None;
        }
        memmove(mem, p2v(pa) as *const u8, PGSIZE);
        if mappages(dref, i, v2p(mem as usize), PGSIZE, flags) != 0 {
            unsafe {
                KMEM.kfree(mem);
            }
            uvmfree(dref, i);
            return None;
        }
        i += PGSIZE;
    }
    Some(d)
}

/// Load `sz` bytes at virtual address `addr` into the page table from an
/// external source (the ELF loader reading file data via readi). addr
/// must be page-aligned and already allocated.
pub fn loaduvm(
    pgdir: &mut PageTable,
    addr: usize,
    mut read: impl FnMut(&mut [u8], usize) -> crate::error::KResult<usize>,
    offset: usize,
    sz: usize,
) -> crate::error::KResult<()> {
    if addr % PGSIZE != 0 {
        panic!("loaduvm: addr must be page aligned");
    }

    let mut i = 0;
    while i < sz {
        let pte = walk(pgdir, addr + i, false).expect("loaduvm: address should exist");
        let pa = unsafe { p2v((*pte).addr()) };
        let n = if sz - i < PGSIZE { sz - i } else { PGSIZE };
        let buf = unsafe { core::slice::from_raw_parts_mut(pa as *mut u8, n) };
        read(buf, offset + i)?;
        i += PGSIZE;
    }
    Ok(())
}

/// Switch %cr3 to this process's page table and point the per-CPU TSS at
/// its kernel stack, so the next ring3->ring0 transition lands correctly.
pub fn switchuvm(pgdir: &PageTable, kstack_top: usize) {
    use crate::proc::mycpu;
    let cpu = mycpu();
    cpu.tss.ss0 = crate::mmu::SEG_KDATA as u16 * 8;
    cpu.tss.esp0 = kstack_top as u32;
    lcr3(v2p(pgdir as *const PageTable as usize));
}

/// Copy `len` bytes from kernel memory at `src` into user virtual address
/// `dst_va` within `pgdir`. Used by syscalls that write results back to
/// the caller's buffers.
pub fn copyout(pgdir: &mut PageTable, dst_va: usize, src: &[u8]) -> crate::error::KResult<()> {
    let mut n = src.len();
    let mut off = 0usize;
    let mut va = dst_va;
    while n > 0 {
        let va0 = PGROUNDDOWN!(va);
        let pte = walk(pgdir, va0, false).ok_or(crate::error::KError::BadAddr)?;
        let pa0 = unsafe {
            if !(*pte).present() {
                return Err(crate::error::KError::BadAddr);
            }
            p2v((*pte).addr())
        };
        let page_off = va - va0;
        let n1 = (PGSIZE - page_off).min(n);
        unsafe {
            memmove(
                (pa0 + page_off) as *mut u8,
                src[off..off + n1].as_ptr(),
                n1,
            );
        }
        n -= n1;
        off += n1;
        va = va0 + PGSIZE;
    }
    Ok(())
}

/// Copy `dst.len()` bytes from user virtual address `src_va` into kernel
/// buffer `dst`.
pub fn copyin(pgdir: &mut PageTable, dst: &mut [u8], src_va: usize) -> crate::error::KResult<()> {
    let mut n = dst.len();
    let mut off = 0usize;
    let mut va = src_va;
    while n > 0 {
        let va0 = PGROUNDDOWN!(va);
        let pte = walk(pgdir, va0, false).ok_or(crate::error::KError::BadAddr)?;
        let pa0 = unsafe {
            if !(*pte).present() {
                return Err(crate::error::KError::BadAddr);
            }
            p2v((*pte).addr())
        };
        let page_off = va - va0;
        let n1 = (PGSIZE - page_off).min(n);
        unsafe {
            memmove(
                dst[off..off + n1].as_mut_ptr(),
                (pa0 + page_off) as *const u8,
                n1,
            );
        }
        n -= n1;
        off += n1;
        va = va0 + PGSIZE;
    }
    Ok(())
}

/// Copy a NUL-terminated string of at most `max` bytes from user virtual
/// address `src_va` into `dst`. Returns the string length excluding NUL.
pub fn copyinstr(
    pgdir: &mut PageTable,
    dst: &mut [u8],
    src_va: usize,
    max: usize,
) -> crate::error::KResult<usize> {
    let mut va = src_va;
    let mut got = 0usize;
    let cap = max.min(dst.len());

    while got < cap {
        let va0 = PGROUNDDOWN!(va);
        let pte = walk(pgdir, va0, false).ok_or(crate::error::KError::BadAddr)?;
        let pa0 = unsafe {
            if !(*pte).present() {
                return Err(crate::error::KError::BadAddr);
            }
            p2v((*pte).addr())
        };
        let page_off = va - va0;
        let avail = PGSIZE - page_off;
        let p = (pa0 + page_off) as *const u8;

        for i in 0..avail {
            if got >= cap {
                break;
            }
            let c = unsafe { p.add(i).read() };
            dst[got] = c;
            if c == 0 {
                return Ok(got);
            }
            got += 1;
        }
        va = va0 + PGSIZE;
    }
    Err(crate::error::KError::BadAddr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clearpteu_masks_only_the_user_bit() {
        let pte = Pte::new(0x1000, PteFlags::P | PteFlags::W | PteFlags::U);
        let cleared = Pte::new(pte.addr(), pte.flags() & !PteFlags::U);
        assert!(!cleared.flags().contains(PteFlags::U));
        assert!(cleared.flags().contains(PteFlags::W));
    }
}
