#![no_std]
#![no_main]
#![feature(panic_info_message)]

extern crate alloc;

mod console;
mod elf;
mod error;
mod exec;
mod ext2;
mod fcntl;
mod file;
mod idt;
mod ide;
mod kalloc;
mod kbd;
mod klog;
mod memlayout;
mod mmu;
mod mp;
mod param;
mod pipe;
mod printf;
mod proc;
mod sleeplock;
mod spinlock;
mod stat;
mod string;
mod syscall;
mod uart;
mod vm;
mod x86;

mod bio;
mod buf;
mod trap;

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::kalloc::KMem;
use crate::kalloc::KMEM;
use crate::param::ROOTDEV;
use crate::proc::cpuid;

// ///////////////////////////////////
// / LANGUAGE STRUCTURES / FUNCTIONS
// ///////////////////////////////////
#[no_mangle]
extern "C" fn eh_personality() {}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    printf!("Aborting: \n");
    if let Some(p) = info.location() {
        printf!(
            "line {}, file {}: {}\n",
            p.line(),
            p.file(),
            info.message()
        );
    } else {
        printf!("no information available.\n");
    }
    abort();
}

#[no_mangle]
extern "C" fn abort() -> ! {
    loop {
        crate::x86::hlt();
    }
}

struct NoopAllocator {}
unsafe impl Sync for NoopAllocator {}
unsafe impl GlobalAlloc for NoopAllocator {
    unsafe fn alloc(&self, _layout: Layout) -> *mut u8 {
        todo!()
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
        todo!()
    }
}
#[global_allocator]
static ALLOCATOR: NoopAllocator = NoopAllocator {};

static STARTED: AtomicBool = AtomicBool::new(false);

extern "C" {
    // IDT entry stubs, one per vector, emitted by vectors.S (outside
    // this crate) and pointed at by idt::init.
    static vectors: [u32; 256];
}

/// Per-CPU entry point. The bootloader/MP glue (outside this crate, per
/// the narrow mp.rs interface) brings every application processor up and
/// lands it here exactly like the bootstrap processor; cpuid() tells the
/// two branches apart. AP discovery and the INIT/STARTUP IPI sequence
/// itself stay on the external side of mp::start_ap -- this crate only
/// consumes cpunum/ioapic_route/timer_init/eoi once a CPU is alive.
#[no_mangle]
pub extern "C" fn kmain() {
    proc::mycpu().init_gdt();

    if cpuid() == 0 {
        unsafe { uart::UART_INSTANCE.init() };
        klog::init();
        printf!("\nkernel is booting...\n\n");

        KMEM.kinit(); // physical page allocator
        log::info!("physical memory initialized");

        vm::kvminit(); // build the kernel page table
        vm::kvminithart(); // turn on paging
        log::info!("virtual memory initialized");

        proc::procinit(); // process table
        trap::trapinit(unsafe { &vectors }); // IDT + IOAPIC routing
        trap::trapinithart();
        mp::timer_init(10000);
        log::info!("traps and timer initialized");

        console::Console::init();
        bio::binit(); // buffer cache
        ext2::fs::iinit(); // inode table
        ext2::fs::fsinit(ROOTDEV); // mount the root ext2 volume
        file::file::fileinit(); // file table
        ext2::devtab::init(); // wire /etc/devtab into file::DEVSW
        log::info!("filesystem mounted");

        proc::userinit(); // first user process
        log::info!("first user process created");

        STARTED.store(true, Ordering::Release);
        printf!("\nboot complete\n");
    } else {
        while !STARTED.load(Ordering::Acquire) {}

        printf!("cpu {} starting\n", cpuid());
        vm::kvminithart();
        trap::trapinithart();
        mp::timer_init(10000);
    }

    proc::scheduler();
}
