// Physical and virtual memory layout for 32-bit x86.
//
// The boot loader (out of scope) loads the kernel at 1MB physical and
// leaves paging off; start.rs turns on paging with a page directory that
// maps both [0, 4MB) identity and [KERNBASE, KERNBASE+4MB) to the same
// physical range, so the kernel can keep executing once %cr0.PG flips.
// Everything above EXTMEM through PHYSTOP is free physical memory handed
// to kalloc.rs. DEVSPACE is where LAPIC/IOAPIC registers get mapped
// (memlayout only reserves the virtual range; mp.rs owns the MMIO).

pub const EXTMEM: usize = 0x0010_0000; // start of extended memory
pub const PHYSTOP: usize = 0x0E00_0000; // top of usable physical memory (224MB)
pub const DEVSPACE: usize = 0xFE00_0000; // other devices are at high addresses

pub const KERNBASE: usize = 0x8000_0000; // first kernel virtual address
pub const KERNLINK: usize = KERNBASE + EXTMEM; // address where kernel is linked

#[inline(always)]
pub const fn v2p(a: usize) -> usize {
    a - KERNBASE
}

#[inline(always)]
pub const fn p2v(a: usize) -> usize {
    a + KERNBASE
}
