// Compile-time kernel tunables. Mirrors the teacher's declared-but-missing
// param.rs: every NPROC/NOFILE/NCPU knob the rest of the kernel closes over.

pub const NCPU: usize = 8; // maximum number of CPUs
pub const NPROC: usize = 64; // maximum number of processes
pub const NOFILE: usize = 16; // open files per process
pub const NFILE: usize = 100; // open files per system
pub const NINODE: usize = 50; // maximum number of active i-nodes
pub const NDEV: usize = 10; // maximum major device number
pub const ROOTDEV: u32 = 1; // device number of file system root disk
pub const MAXARG: usize = 32; // max exec arguments
pub const MAXPATH: usize = 128; // maximum file path name length
pub const MAXOPBLOCKS: usize = 10; // max # of blocks any single fs op writes
pub const NBUF: usize = 30; // size of disk block cache
pub const PIPESIZE: usize = 512; // pipe ring buffer size, bytes
pub const INPUT_BUF_SIZE: usize = 128; // console input ring buffer size
