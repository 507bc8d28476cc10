// Processes and the scheduler.
//
// One process table, one spinlock (PTABLE_LOCK) protecting state/chan/
// killed/parent for every slot. A process that wants to give up the CPU
// (yield, sleep, exit) acquires PTABLE_LOCK itself before calling sched();
// the baton passes to scheduler()'s loop, which releases it once swtch()
// returns control there. Each CPU additionally owns a scheduler context
// and TSS, entirely private (no lock needed).

use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::ext2::fs::ROOT_DEV;
use crate::file::{File, INode};
use crate::kalloc::KMEM;
use crate::mmu::{
    PageTable, SegDesc, TaskState, DPL_KERNEL, DPL_USER, NSEGS, SEG_KCODE, SEG_KDATA, SEG_TSS,
    SEG_UCODE, SEG_UDATA, STA_CODE, STA_DATA,
};
use crate::mp;
use crate::param::{NCPU, NOFILE, NPROC};
use crate::spinlock::{pop_off, push_off, Spinlock};
use crate::string::memset;
use crate::vm::{copyuvm, uvmcreate, uvmfirst, uvmfree};
use crate::x86::{lgdt, ltr};

extern "C" {
    /// Assembly stub (trapasm.S, outside this crate): restores the saved
    /// register state from the trap frame at the top of the kernel stack
    /// and `iret`s to user mode. The first thing a freshly forked process
    /// runs on its way back to user space.
    fn trapret();
    /// Assembly context switch (swtch.S, outside this crate): saves the
    /// caller's callee-saved registers into `*old`, loads them from `*new`,
    /// and jumps to `new.eip`.
    fn swtch(old: *mut Context, new: *mut Context);
}

/// Saved kernel registers across a context switch.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

impl Context {
    const fn zeroed() -> Self {
        Context { edi: 0, esi: 0, ebx: 0, ebp: 0, eip: 0 }
    }
}

/// Trap frame: x86 `pushal` plus the hardware-pushed interrupt frame, the
/// shape the assembly trap stub builds on the kernel stack.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Trapframe {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    pub gs: u16,
    padding1: u16,
    pub fs: u16,
    padding2: u16,
    pub es: u16,
    padding3: u16,
    pub ds: u16,
    padding4: u16,

    pub trapno: u32,
    pub err: u32,

    pub eip: u32,
    pub cs: u16,
    padding5: u16,
    pub eflags: u32,

    pub esp: u32,
    pub ss: u16,
    padding6: u16,
}

// ---- Per-CPU state ---------------------------------------------------

#[derive(Copy, Clone)]
pub struct Cpu {
    pub apicid: u8,
    pub scheduler: Context,
    pub tss: TaskState,
    pub gdt: [SegDesc; NSEGS],
    pub proc: Option<NonNull<Proc>>,
    pub noff: u8,
    pub intena: bool,
}

impl Cpu {
    const fn default() -> Self {
        Cpu {
            apicid: 0,
            scheduler: Context::zeroed(),
            tss: TaskState::zeroed(),
            gdt: [SegDesc::null(); NSEGS],
            proc: None,
            noff: 0,
            intena: false,
        }
    }

    /// Build this CPU's GDT (kernel/user code+data, plus its private TSS
    /// selector) and load it. Called once by every CPU during boot.
    pub fn init_gdt(&mut self) {
        self.gdt[SEG_KCODE] = SegDesc::flat(STA_CODE, DPL_KERNEL);
        self.gdt[SEG_KDATA] = SegDesc::flat(STA_DATA, DPL_KERNEL);
        self.gdt[SEG_UCODE] = SegDesc::flat(STA_CODE, DPL_USER);
        self.gdt[SEG_UDATA] = SegDesc::flat(STA_DATA, DPL_USER);

        let ts_base = (&self.tss as *const TaskState) as u32;
        let ts_limit = (size_of::<TaskState>() - 1) as u32;
        self.gdt[SEG_TSS] = SegDesc::system(ts_base, ts_limit, DPL_KERNEL);
        self.tss.ss0 = (SEG_KDATA as u16) * 8;

        lgdt(&self.gdt);
        ltr((SEG_TSS as u16) * 8);
    }
}

static mut CPUS: [Cpu; NCPU] = [Cpu::default(); NCPU];

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Procstate {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

#[derive(Copy, Clone)]
pub struct Proc {
    // every field below is protected by PTABLE_LOCK
    pub state: Procstate,
    pub chan: Option<usize>,
    pub killed: bool,
    pub xstate: i32,
    pub pid: u32,
    pub parent: Option<NonNull<Proc>>,

    // private to the owning process; safe to touch without the lock
    pub kstack: usize,
    pub sz: usize,
    pub pgdir: Option<NonNull<PageTable>>,
    pub tf: Option<NonNull<Trapframe>>,
    pub context: Context,
    pub ofile: [Option<NonNull<File>>; NOFILE],
    pub cwd: Option<NonNull<INode>>,
    pub name: [u8; 16],
}

impl Proc {
    const fn default() -> Self {
        Proc {
            state: Procstate::Unused,
            chan: None,
            killed: false,
            xstate: 0,
            pid: 0,
            parent: None,
            kstack: 0,
            sz: 0,
            pgdir: None,
            tf: None,
            context: Context::zeroed(),
            ofile: [None; NOFILE],
            cwd: None,
            name: [0; 16],
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgdir_mut(&mut self) -> &mut PageTable {
        unsafe { self.pgdir.unwrap().as_mut() }
    }
}

static mut PROCS: [Proc; NPROC] = [Proc::default(); NPROC];
static mut INIT_PROC: Option<NonNull<Proc>> = None;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
/// The single lock protecting `state`/`chan`/`killed`/`parent` across the
/// whole process table (spec.md's "process-table lock").
pub static mut PTABLE_LOCK: Spinlock = Spinlock::init_lock("ptable");

pub static TICKS: AtomicU32 = AtomicU32::new(0);

pub fn cpuid() -> usize {
    mp::cpunum()
}

pub fn mycpu() -> &'static mut Cpu {
    unsafe { &mut CPUS[cpuid()] }
}

pub fn myproc() -> &'static mut Proc {
    push_off();
    let c = mycpu();
    let p = c.proc;
    pop_off();
    unsafe { &mut *p.expect("myproc: no current process").as_ptr() }
}

fn allocpid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

pub fn procinit() {
    // PROCS/PTABLE_LOCK are already initialized as statics.
}

/// A built-in "init code" blob mapped at user virtual address 0, which
/// invokes `exec("/init", ["/init", 0])`. The exact bytes are produced by
/// the boot image builder (outside this crate, alongside mkfs); this is
/// sized the same way a minimal exec-then-exit stub would be.
const INITCODE: [u8; 48] = [
    0xeb, 0x16, // jmp start (skip over the embedded string)
    b'/', b'i', b'n', b'i', b't', 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

fn alloc_kstack() -> Option<usize> {
    let p: *mut u8 = KMEM.kalloc();
    if p.is_null() {
        None
    } else {
        Some(p as usize)
    }
}

/// Look in the process table for an UNUSED slot. Marks it EMBRYO, assigns
/// a PID, carves a trap frame off the top of a fresh kernel stack, and
/// points a fresh kernel context at `forkret`. Returns with PTABLE_LOCK
/// held (the caller must release it, per the baton-pass convention).
fn allocproc() -> Option<&'static mut Proc> {
    unsafe {
        PTABLE_LOCK.acquire();
    }

    let mut found: Option<&'static mut Proc> = None;
    unsafe {
        for i in 0..NPROC {
            if PROCS[i].state == Procstate::Unused {
                found = Some(&mut PROCS[i]);
                break;
            }
        }
    }
    let p = match found {
        Some(p) => p,
        None => {
            unsafe {
                PTABLE_LOCK.release();
            }
            return None;
        }
    };

    p.pid = allocpid();
    p.state = Procstate::Embryo;

    let kstack = match alloc_kstack() {
        Some(k) => k,
        None => {
            p.state = Procstate::Unused;
            unsafe {
                PTABLE_LOCK.release();
            }
            return None;
        }
    };
    p.kstack = kstack;

    let tf_addr = kstack + crate::mmu::PGSIZE - size_of::<Trapframe>();
    p.tf = NonNull::new(tf_addr as *mut Trapframe);
    unsafe {
        memset(tf_addr as *mut u8, 0, size_of::<Trapframe>());
    }

    p.context = Context::zeroed();
    p.context.eip = forkret as usize as u32;

    Some(p)
}

/// Caller must hold PTABLE_LOCK and have `p.state != Running`.
fn freeproc(p: &mut Proc) {
    if p.kstack != 0 {
        unsafe {
            KMEM.kfree(p.kstack as *mut u8);
        }
    }
    p.kstack = 0;
    p.tf = None;

    if let Some(mut pgdir) = p.pgdir.take() {
        unsafe {
            uvmfree(pgdir.as_mut(), p.sz);
        }
    }

    p.sz = 0;
    p.pid = 0;
    p.parent = None;
    p.name = [0; 16];
    p.chan = None;
    p.killed = false;
    p.xstate = 0;
    p.state = Procstate::Unused;
}

/// Set up the first user process: map the init-code blob at virtual
/// address 0, fabricate a trap frame that "returns" to user address 0
/// with interrupts enabled, and mark it RUNNABLE.
pub fn userinit() {
    let p = allocproc().expect("userinit: allocproc failed");

    let pgdir = uvmcreate().expect("userinit: out of memory for page directory");
    p.pgdir = NonNull::new(pgdir);

    unsafe {
        uvmfirst(p.pgdir_mut(), INITCODE.as_ptr(), INITCODE.len());
    }
    p.sz = crate::mmu::PGSIZE;

    let tf = unsafe { p.tf.unwrap().as_mut() };
    let tf_bytes = unsafe {
        core::slice::from_raw_parts_mut(tf as *mut Trapframe as *mut u8, size_of::<Trapframe>())
    };
    tf_bytes.fill(0);
    tf.cs = ((SEG_UCODE as u16) << 3) | (DPL_USER as u16);
    tf.ds = ((SEG_UDATA as u16) << 3) | (DPL_USER as u16);
    tf.es = tf.ds;
    tf.ss = tf.ds;
    tf.eflags = crate::x86::FL_IF;
    tf.esp = crate::mmu::PGSIZE as u32;
    tf.eip = 0;

    let name = b"initcode\0";
    p.name[..name.len()].copy_from_slice(name);

    unsafe {
        INIT_PROC = NonNull::new(p as *mut Proc);
    }

    p.state = Procstate::Runnable;
    unsafe {
        PTABLE_LOCK.release();
    }
}

/// Where a freshly scheduled process (forked or the initial one) starts
/// running, still holding PTABLE_LOCK from whoever called sched() to get
/// here (allocproc's caller, in this case scheduler() itself).
fn forkret() {
    unsafe {
        PTABLE_LOCK.release();
    }

    static FIRST: AtomicBool = AtomicBool::new(true);
    if FIRST.swap(false, Ordering::AcqRel) {
        crate::ext2::fs::fsinit(ROOT_DEV);
    }

    unsafe { trapret() }
}

/// Duplicate the calling process into a new child. Returns the child's
/// PID in the parent; the child's trap frame is set up to see 0.
pub fn fork() -> Option<u32> {
    let curr = myproc();

    let np = allocproc()?;

    let curr_sz = curr.sz;
    let new_pgdir = match copyuvm(curr.pgdir_mut(), curr_sz) {
        Some(pd) => pd,
        None => {
            freeproc(np);
            unsafe {
                PTABLE_LOCK.release();
            }
            return None;
        }
    };
    np.pgdir = NonNull::new(new_pgdir);
    np.sz = curr.sz;
    np.parent = NonNull::new(curr as *mut Proc);

    unsafe {
        *np.tf.unwrap().as_mut() = *curr.tf.unwrap().as_ref();
        np.tf.unwrap().as_mut().eax = 0;
    }

    for i in 0..NOFILE {
        if let Some(f) = curr.ofile[i] {
            crate::file::file::filedup(unsafe { &mut *f.as_ptr() });
            np.ofile[i] = Some(f);
        }
    }
    np.cwd = curr.cwd.map(|mut ip| unsafe {
        crate::ext2::fs::idup(ip.as_mut());
        ip
    });
    np.name = curr.name;

    let pid = np.pid;
    np.state = Procstate::Runnable;
    unsafe {
        PTABLE_LOCK.release();
    }

    Some(pid)
}

/// Close all open files, drop the cwd reference, reparent children to
/// init (waking it if a child was already ZOMBIE), mark ZOMBIE, and hand
/// off to the scheduler. Never returns.
pub fn exit(status: i32) -> ! {
    let p = myproc();

    for i in 0..NOFILE {
        if let Some(f) = p.ofile[i].take() {
            crate::file::file::fileclose(unsafe { &mut *f.as_ptr() });
        }
    }

    if let Some(mut ip) = p.cwd.take() {
        crate::ext2::fs::iput(unsafe { ip.as_mut() });
    }

    unsafe {
        PTABLE_LOCK.acquire();

        if let Some(mut parent) = p.parent {
            wakeup_no_lock(parent.as_mut() as *mut Proc as usize);
        }

        let me = p as *const Proc as *const ();
        let init = INIT_PROC;
        for i in 0..NPROC {
            let child = &mut PROCS[i];
            if child.parent.map(|pp| pp.as_ptr() as *const ()) == Some(me) {
                child.parent = init;
                if child.state == Procstate::Zombie {
                    if let Some(mut ip) = init {
                        wakeup_no_lock(ip.as_mut() as *mut Proc as usize);
                    }
                }
            }
        }

        p.xstate = status;
        p.state = Procstate::Zombie;

        sched();
    }
    unreachable!("exit: zombie returned");
}

/// Wake every SLEEPING process whose `chan` matches. Caller must already
/// hold PTABLE_LOCK.
fn wakeup_no_lock(chan: usize) {
    unsafe {
        for i in 0..NPROC {
            let p = &mut PROCS[i];
            if p.state == Procstate::Sleeping && p.chan == Some(chan) {
                p.state = Procstate::Runnable;
            }
        }
    }
}

/// Wait for a child to exit; reap it and return its PID, or -1 if the
/// caller has no children or has been killed.
pub fn wait() -> i32 {
    let p = myproc();
    let me = p as *const Proc as *const ();

    unsafe {
        PTABLE_LOCK.acquire();
        loop {
            let mut have_kids = false;
            for i in 0..NPROC {
                let child = &mut PROCS[i];
                if child.parent.map(|pp| pp.as_ptr() as *const ()) != Some(me) {
                    continue;
                }
                have_kids = true;

                if child.state == Procstate::Zombie {
                    let pid = child.pid;
                    freeproc(child);
                    PTABLE_LOCK.release();
                    return pid as i32;
                }
            }

            if !have_kids || p.killed {
                PTABLE_LOCK.release();
                return -1;
            }

            sleep(me as usize, &PTABLE_LOCK);
        }
    }
}

/// Per-CPU scheduler loop: enable interrupts, scan for a RUNNABLE
/// process, run it, repeat. Never returns.
pub fn scheduler() -> ! {
    loop {
        crate::x86::intr_on();

        unsafe {
            PTABLE_LOCK.acquire();
            let mut ran = false;
            for i in 0..NPROC {
                let p = &mut PROCS[i];
                if p.state != Procstate::Runnable {
                    continue;
                }

                mycpu().proc = NonNull::new(p as *mut Proc);
                crate::vm::switchuvm(p.pgdir.unwrap().as_ref(), p.kstack + crate::mmu::PGSIZE);
                p.state = Procstate::Running;
                ran = true;

                swtch(
                    &mut mycpu().scheduler as *mut Context,
                    &mut p.context as *mut Context,
                );

                // Back from swtch: p may already be a reaped ZOMBIE by the
                // time another CPU's wait() runs, so get off its pgdir
                // before touching anything else.
                crate::vm::switchkvm();
                mycpu().proc = None;
            }
            PTABLE_LOCK.release();

            if !ran {
                crate::x86::hlt();
            }
        }
    }
}

/// Give up the CPU. Precondition: PTABLE_LOCK held, `noff == 1`, current
/// process not RUNNING, interrupts disabled.
pub fn sched() {
    let p = myproc();
    unsafe {
        if !PTABLE_LOCK.holding() {
            panic!("sched: ptable lock not held");
        }
        if mycpu().noff != 1 {
            panic!("sched: locks held");
        }
        if p.state == Procstate::Running {
            panic!("sched: process still running");
        }
        if crate::x86::intr_get() {
            panic!("sched: interruptible");
        }

        let intena = mycpu().intena;
        swtch(
            &mut p.context as *mut Context,
            &mut mycpu().scheduler as *mut Context,
        );
        mycpu().intena = intena;
    }
}

pub fn yield_() {
    unsafe {
        PTABLE_LOCK.acquire();
        myproc().state = Procstate::Runnable;
        sched();
        PTABLE_LOCK.release();
    }
}

/// Atomically release `lk` and sleep on `chan`; reacquire `lk` before
/// returning. If `lk` is already PTABLE_LOCK, skip the release/reacquire
/// dance (the lock is just baton-passed through sched() instead).
pub fn sleep(chan: usize, lk: &Spinlock) {
    let p = myproc();

    unsafe {
        let is_ptable = core::ptr::eq(lk, &PTABLE_LOCK as &Spinlock);
        if !is_ptable {
            PTABLE_LOCK.acquire();
            lk.release();
        }

        p.chan = Some(chan);
        p.state = Procstate::Sleeping;

        sched();

        p.chan = None;

        if !is_ptable {
            PTABLE_LOCK.release();
            lk.acquire();
        }
    }
}

pub fn wakeup(chan: usize) {
    unsafe {
        PTABLE_LOCK.acquire();
        wakeup_no_lock(chan);
        PTABLE_LOCK.release();
    }
}

/// Mark the process with the given PID killed, waking it if SLEEPING.
pub fn kill(pid: u32) -> bool {
    unsafe {
        PTABLE_LOCK.acquire();
        for i in 0..NPROC {
            let p = &mut PROCS[i];
            if p.pid == pid {
                p.killed = true;
                if p.state == Procstate::Sleeping {
                    p.state = Procstate::Runnable;
                }
                PTABLE_LOCK.release();
                return true;
            }
        }
        PTABLE_LOCK.release();
    }
    false
}

/// Lockless process dump for `^P`: deliberately does not take
/// PTABLE_LOCK, since it exists to debug a wedged kernel.
pub fn procdump() {
    let names = ["UNUSED", "EMBRYO", "SLEEP", "RUNNABLE", "RUNNING", "ZOMBIE"];
    unsafe {
        for i in 0..NPROC {
            let p = &PROCS[i];
            if p.state == Procstate::Unused {
                continue;
            }
            let idx = match p.state {
                Procstate::Unused => 0,
                Procstate::Embryo => 1,
                Procstate::Sleeping => 2,
                Procstate::Runnable => 3,
                Procstate::Running => 4,
                Procstate::Zombie => 5,
            };
            crate::printf!(
                "{} {} {}\n",
                p.pid,
                names[idx],
                core::str::from_utf8(&p.name).unwrap_or("?")
            );
        }
    }
}

/// Copy `src` either to a user virtual address or a plain kernel pointer,
/// depending on `is_user_dst`.
pub fn either_copyout(is_user_dst: bool, dst: usize, src: &[u8]) -> crate::error::KResult<()> {
    if is_user_dst {
        let p = myproc();
        crate::vm::copyout(p.pgdir_mut(), dst, src)
    } else {
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
        }
        Ok(())
    }
}

pub fn either_copyin(dst: &mut [u8], is_user_src: bool, src: usize) -> crate::error::KResult<()> {
    if is_user_src {
        let p = myproc();
        crate::vm::copyin(p.pgdir_mut(), dst, src)
    } else {
        unsafe {
            core::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}
