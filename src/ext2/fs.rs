// Ext2 inode cache, block mapping, and pathname resolution.
//
// The in-memory inode table is a fixed-size array guarded by one spinlock
// that protects only `dev`/`inum`/`ref_cnt`; every other field requires the
// inode's own sleeplock (see file::INode). Block numbers returned by bmap()
// are absolute disk blocks -- every caller below goes through bmap() rather
// than adding the partition offset itself.

use core::cmp::min;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::bio::{bread, brelse};
use crate::ext2::{
    GroupDesc, SuperBlock, BSIZE, DIND, DIRENT_HEADER, DIRSIZ_MAX, EXT2_FT_CHRDEV,
    EXT2_FT_DIR, EXT2_FT_REG_FILE, EXT2_MAGIC, IND, MBR_SIGNATURE, NADDRS, NDIRECT,
    PTRS_PER_BLOCK, S_IFCHR, S_IFDIR, S_IFMT, S_IFREG, SECTOR_SIZE, TIND,
};
use crate::file::{INode, InodeType, DEVSW};
use crate::ide::read_block;
use crate::param::{NINODE, ROOTDEV};
use crate::proc::{either_copyin, either_copyout, myproc};
use crate::spinlock::Spinlock;
use crate::string::memset;

pub const ROOT_DEV: u32 = ROOTDEV;
pub const ROOT_INO: u32 = crate::ext2::ROOTINO;

const MAX_GROUPS: usize = 16;

struct ITable {
    lock: Spinlock,
    inode: [INode; NINODE],
}

const ITABLE_ENTRY: INode = INode::create("inode");
static mut ITABLE: ITable = ITable {
    lock: Spinlock::init_lock("itable"),
    inode: [ITABLE_ENTRY; NINODE],
};

static mut SB: SuperBlock = SuperBlock::zeroed();
static mut GROUPS: [GroupDesc; MAX_GROUPS] = [GroupDesc::zeroed(); MAX_GROUPS];
static mut NGROUPS: u32 = 0;
/// First ext2 block of the mounted partition, in BSIZE (1 KiB) units.
static mut PARTITION_START: u32 = 0;

pub fn iinit() {
    // ITABLE is already fully initialized as a static.
}

/// Mount the ext2 volume on `dev`: locate the first partition from the
/// MBR, read the superblock and group descriptor table.
pub fn fsinit(dev: u32) {
    unsafe {
        let mut mbr_block = [0u8; BSIZE];
        read_block(dev, 0, &mut mbr_block);

        let sig = u16::from_le_bytes([mbr_block[510], mbr_block[511]]);
        if sig != MBR_SIGNATURE {
            panic!("fsinit: no MBR signature");
        }
        let entry_off = 446;
        let lba_first = u32::from_le_bytes([
            mbr_block[entry_off + 8],
            mbr_block[entry_off + 9],
            mbr_block[entry_off + 10],
            mbr_block[entry_off + 11],
        ]);
        PARTITION_START = lba_first * SECTOR_SIZE as u32 / BSIZE as u32;

        let mut sb_block = [0u8; BSIZE];
        read_block(dev, PARTITION_START + 1, &mut sb_block);
        let sb_ptr = sb_block.as_ptr() as *const SuperBlock;
        SB = sb_ptr.read_unaligned();

        if SB.s_magic != EXT2_MAGIC {
            panic!("fsinit: bad ext2 magic");
        }

        NGROUPS = SB.groups_count();
        if NGROUPS as usize > MAX_GROUPS {
            panic!("fsinit: too many block groups");
        }

        let gdt_block = PARTITION_START + 2;
        let descs_per_block = BSIZE / size_of::<GroupDesc>();
        let nblocks = (NGROUPS as usize + descs_per_block - 1) / descs_per_block;
        for b in 0..nblocks {
            let mut raw = [0u8; BSIZE];
            read_block(dev, gdt_block + b as u32, &mut raw);
            for i in 0..descs_per_block {
                let g = b * descs_per_block + i;
                if g >= NGROUPS as usize {
                    break;
                }
                let off = i * size_of::<GroupDesc>();
                let gp = raw[off..off + size_of::<GroupDesc>()].as_ptr() as *const GroupDesc;
                GROUPS[g] = gp.read_unaligned();
            }
        }
    }
}

fn abs_block(fsblk: u32) -> u32 {
    unsafe { PARTITION_START + fsblk }
}

fn sb_blocks_per_group() -> u32 {
    unsafe { SB.s_blocks_per_group }
}

fn sb_inodes_per_group() -> u32 {
    unsafe { SB.s_inodes_per_group }
}

fn sb_first_data_block() -> u32 {
    unsafe { SB.s_first_data_block }
}

fn sb_inode_size() -> usize {
    unsafe { SB.s_inode_size as usize }
}

// ---- Bitmap-based allocation -------------------------------------------

fn bitmap_test_and_set(dev: u32, bitmap_block: u32, bit: u32) -> bool {
    let bp = bread(dev, abs_block(bitmap_block));
    let byte = (bit / 8) as usize;
    let mask = 1u8 << (bit % 8);
    let was_free = bp.data[byte] & mask == 0;
    if was_free {
        bp.data[byte] |= mask;
        crate::bio::bwrite(bp);
    }
    brelse(bp);
    was_free
}

fn bitmap_clear(dev: u32, bitmap_block: u32, bit: u32) {
    let bp = bread(dev, abs_block(bitmap_block));
    let byte = (bit / 8) as usize;
    let mask = 1u8 << (bit % 8);
    if bp.data[byte] & mask == 0 {
        panic!("bitmap_clear: already free");
    }
    bp.data[byte] &= !mask;
    crate::bio::bwrite(bp);
    brelse(bp);
}

/// Allocate a zeroed block, returning its filesystem-relative block
/// number (the numbering `i_block` entries and bitmaps use).
fn balloc(dev: u32) -> Option<u32> {
    unsafe {
        for g in 0..NGROUPS {
            let group = &GROUPS[g as usize];
            if group.bg_free_blocks_count == 0 {
                continue;
            }
            for bit in 0..sb_blocks_per_group() {
                if bitmap_test_and_set(dev, group.bg_block_bitmap, bit) {
                    GROUPS[g as usize].bg_free_blocks_count -= 1;
                    let fsblk = sb_first_data_block() + g * sb_blocks_per_group() + bit;
                    let bp = bread(dev, abs_block(fsblk));
                    memset(bp.data.as_mut_ptr(), 0, BSIZE);
                    crate::bio::bwrite(bp);
                    brelse(bp);
                    return Some(fsblk);
                }
            }
        }
    }
    None
}

fn bfree(dev: u32, fsblk: u32) {
    unsafe {
        let rel = fsblk - sb_first_data_block();
        let g = rel / sb_blocks_per_group();
        let bit = rel % sb_blocks_per_group();
        bitmap_clear(dev, GROUPS[g as usize].bg_block_bitmap, bit);
        GROUPS[g as usize].bg_free_blocks_count += 1;
    }
}

fn mode_for(file_type: InodeType) -> u16 {
    match file_type {
        InodeType::Dir => S_IFDIR | 0o755,
        InodeType::File => S_IFREG | 0o644,
        InodeType::Device => S_IFCHR | 0o644,
        InodeType::None => 0,
    }
}

fn type_from_mode(mode: u16) -> InodeType {
    match mode & S_IFMT {
        S_IFDIR => InodeType::Dir,
        S_IFREG => InodeType::File,
        S_IFCHR => InodeType::Device,
        _ => InodeType::None,
    }
}

/// Allocate an inode on disk, install it (unlocked, ref 1) in the cache.
pub fn ialloc(dev: u32, file_type: InodeType) -> Option<NonNull<INode>> {
    unsafe {
        for g in 0..NGROUPS {
            let group = &GROUPS[g as usize];
            if group.bg_free_inodes_count == 0 {
                continue;
            }
            for bit in 0..sb_inodes_per_group() {
                if bitmap_test_and_set(dev, group.bg_inode_bitmap, bit) {
                    GROUPS[g as usize].bg_free_inodes_count -= 1;
                    let inum = g * sb_inodes_per_group() + bit + 1;

                    let block = inode_block(inum);
                    let bp = bread(dev, block);
                    let off = inode_offset_in_block(inum);
                    memset(bp.data[off..].as_mut_ptr(), 0, sb_inode_size());
                    bp.data[off] = (mode_for(file_type) & 0xFF) as u8;
                    bp.data[off + 1] = (mode_for(file_type) >> 8) as u8;
                    crate::bio::bwrite(bp);
                    brelse(bp);

                    return Some(iget(dev, inum));
                }
            }
        }
    }
    None
}

pub fn ifree(dev: u32, inum: u32) {
    unsafe {
        let rel = inum - 1;
        let g = rel / sb_inodes_per_group();
        let bit = rel % sb_inodes_per_group();
        bitmap_clear(dev, GROUPS[g as usize].bg_inode_bitmap, bit);
        GROUPS[g as usize].bg_free_inodes_count += 1;
    }
}

fn inode_block(inum: u32) -> u32 {
    unsafe {
        let rel = inum - 1;
        let g = rel / sb_inodes_per_group();
        let idx_in_group = rel % sb_inodes_per_group();
        let per_block = (BSIZE / sb_inode_size()) as u32;
        abs_block(GROUPS[g as usize].bg_inode_table + idx_in_group / per_block)
    }
}

fn inode_offset_in_block(inum: u32) -> usize {
    let rel = (inum - 1) as usize;
    let per_block = BSIZE / sb_inode_size();
    (rel % per_block) * sb_inode_size()
}

// ---- In-memory inode cache ----------------------------------------------

/// Find or create a cache slot for (dev, inum); does not lock or populate
/// it. Mirrors real ext2's lazy-read design.
pub fn iget(dev: u32, inum: u32) -> NonNull<INode> {
    unsafe {
        ITABLE.lock.acquire();

        let mut empty: Option<*mut INode> = None;
        for ip in ITABLE.inode.iter_mut() {
            if ip.ref_cnt > 0 && ip.dev == dev && ip.inum == inum {
                ip.ref_cnt += 1;
                ITABLE.lock.release();
                return NonNull::new_unchecked(ip as *mut INode);
            }
            if empty.is_none() && ip.ref_cnt == 0 {
                empty = Some(ip as *mut INode);
            }
        }

        let slot = empty.expect("iget: no free inode slots").as_mut().unwrap();
        slot.dev = dev;
        slot.inum = inum;
        slot.ref_cnt = 1;
        slot.valid = false;

        ITABLE.lock.release();
        NonNull::new_unchecked(slot as *mut INode)
    }
}

pub fn idup(ip: &mut INode) {
    unsafe {
        ITABLE.lock.acquire();
        ip.ref_cnt += 1;
        ITABLE.lock.release();
    }
}

/// Lock ip and read it from disk the first time it is used.
pub fn ilock(ip: &mut INode) {
    if ip.ref_cnt < 1 {
        panic!("ilock: no references");
    }
    ip.lock.acquire_sleep();

    if !ip.valid {
        let block = inode_block(ip.inum);
        let off = inode_offset_in_block(ip.inum);
        let bp = bread(ip.dev, block);

        let mode = u16::from_le_bytes([bp.data[off], bp.data[off + 1]]);
        let size = u32::from_le_bytes([
            bp.data[off + 4],
            bp.data[off + 5],
            bp.data[off + 6],
            bp.data[off + 7],
        ]);
        let links = u16::from_le_bytes([bp.data[off + 26], bp.data[off + 27]]);

        let block_field_off = off + 40; // i_block starts after i_osd1 (offset 28+4+4+4=... see DInode layout)
        let mut addrs = [0u32; NADDRS];
        for i in 0..NADDRS {
            let p = block_field_off + i * 4;
            addrs[i] = u32::from_le_bytes([
                bp.data[p],
                bp.data[p + 1],
                bp.data[p + 2],
                bp.data[p + 3],
            ]);
        }

        ip.file_type = type_from_mode(mode);
        ip.nlink = links;
        ip.size = size;
        ip.addrs = addrs;

        if mode & S_IFMT == S_IFCHR {
            // device major/minor are stashed in the first two direct
            // block slots, which a character device never uses for data.
            ip.major = (addrs[0] & 0xFFFF) as u16;
            ip.minor = (addrs[1] & 0xFFFF) as u16;
        }

        brelse(bp);
        ip.valid = true;

        if ip.file_type == InodeType::None {
            panic!("ilock: inode has no type");
        }
    }
}

pub fn iunlock(ip: &mut INode) {
    if !ip.lock.holding_sleep() || ip.ref_cnt < 1 {
        panic!("iunlock");
    }
    ip.lock.release_sleep();
}

/// Drop a reference; truncate and free on disk if this was the last
/// reference and the link count has already dropped to zero.
pub fn iput(ip: &mut INode) {
    unsafe {
        ITABLE.lock.acquire();

        if ip.ref_cnt == 1 && ip.valid && ip.nlink == 0 {
            ip.lock.acquire_sleep();
            ITABLE.lock.release();

            itrunc(ip);
            ifree(ip.dev, ip.inum);
            ip.file_type = InodeType::None;
            ip.valid = false;

            ip.lock.release_sleep();
            ITABLE.lock.acquire();
        }

        ip.ref_cnt -= 1;
        ITABLE.lock.release();
    }
}

pub fn iunlockput(ip: &mut INode) {
    iunlock(ip);
    iput(ip);
}

pub fn iupdate(ip: &mut INode) {
    let block = inode_block(ip.inum);
    let off = inode_offset_in_block(ip.inum);
    let bp = bread(ip.dev, block);

    let mode = mode_for(ip.file_type);
    bp.data[off] = (mode & 0xFF) as u8;
    bp.data[off + 1] = (mode >> 8) as u8;
    let size = ip.size.to_le_bytes();
    bp.data[off + 4..off + 8].copy_from_slice(&size);
    let links = ip.nlink.to_le_bytes();
    bp.data[off + 26] = links[0];
    bp.data[off + 27] = links[1];

    let mut addrs = ip.addrs;
    if ip.file_type == InodeType::Device {
        addrs[0] = ip.major as u32;
        addrs[1] = ip.minor as u32;
    }
    let block_field_off = off + 40;
    for i in 0..NADDRS {
        let bytes = addrs[i].to_le_bytes();
        let p = block_field_off + i * 4;
        bp.data[p..p + 4].copy_from_slice(&bytes);
    }

    crate::bio::bwrite(bp);
    brelse(bp);
}

/// Free every block referenced by ip (direct, and recursively through
/// the indirect tiers), then mark the inode empty.
pub fn itrunc(ip: &mut INode) {
    for i in 0..NDIRECT {
        if ip.addrs[i] != 0 {
            bfree(ip.dev, ip.addrs[i]);
            ip.addrs[i] = 0;
        }
    }

    if ip.addrs[IND] != 0 {
        free_indirect(ip.dev, ip.addrs[IND], 0);
        ip.addrs[IND] = 0;
    }
    if ip.addrs[DIND] != 0 {
        free_indirect(ip.dev, ip.addrs[DIND], 1);
        ip.addrs[DIND] = 0;
    }
    if ip.addrs[TIND] != 0 {
        free_indirect(ip.dev, ip.addrs[TIND], 2);
        ip.addrs[TIND] = 0;
    }

    ip.size = 0;
    iupdate(ip);
}

/// Free the block tree rooted at `block`, `depth` indirection levels deep
/// (0 = block itself is data... but here `block` is always an indirect
/// block, so depth 0 means its pointers are data blocks).
fn free_indirect(dev: u32, block: u32, depth: u32) {
    let bp = bread(dev, abs_block(block));
    let mut ptrs = [0u32; PTRS_PER_BLOCK];
    for i in 0..PTRS_PER_BLOCK {
        let p = i * 4;
        ptrs[i] = u32::from_le_bytes([
            bp.data[p],
            bp.data[p + 1],
            bp.data[p + 2],
            bp.data[p + 3],
        ]);
    }
    brelse(bp);

    for &child in ptrs.iter() {
        if child == 0 {
            continue;
        }
        if depth == 0 {
            bfree(dev, child);
        } else {
            free_indirect(dev, child, depth - 1);
        }
    }
    bfree(dev, block);
}

/// Translate a file-relative block index into an absolute disk block,
/// allocating indirect blocks (and the addressed block itself) lazily.
/// Returns 0 on allocation failure.
fn bmap(ip: &mut INode, bn: u32) -> u32 {
    let mut bn = bn as usize;

    if bn < NDIRECT {
        let mut a = ip.addrs[bn];
        if a == 0 {
            a = match balloc(ip.dev) {
                Some(b) => b,
                None => return 0,
            };
            ip.addrs[bn] = a;
        }
        return abs_block(a);
    }
    bn -= NDIRECT;

    if bn < PTRS_PER_BLOCK {
        return bmap_indirect(ip, IND, bn);
    }
    bn -= PTRS_PER_BLOCK;

    if bn < PTRS_PER_BLOCK * PTRS_PER_BLOCK {
        let outer = bn / PTRS_PER_BLOCK;
        let inner = bn % PTRS_PER_BLOCK;
        return bmap_double(ip, DIND, outer, inner);
    }
    bn -= PTRS_PER_BLOCK * PTRS_PER_BLOCK;

    if bn < PTRS_PER_BLOCK * PTRS_PER_BLOCK * PTRS_PER_BLOCK {
        let l2 = bn / (PTRS_PER_BLOCK * PTRS_PER_BLOCK);
        let rem = bn % (PTRS_PER_BLOCK * PTRS_PER_BLOCK);
        let l1 = rem / PTRS_PER_BLOCK;
        let l0 = rem % PTRS_PER_BLOCK;
        return bmap_triple(ip, TIND, l2, l1, l0);
    }

    panic!("bmap: file offset beyond triple indirect range");
}

fn read_ptr(dev: u32, block: u32, idx: usize) -> u32 {
    let bp = bread(dev, abs_block(block));
    let p = idx * 4;
    let v = u32::from_le_bytes([bp.data[p], bp.data[p + 1], bp.data[p + 2], bp.data[p + 3]]);
    brelse(bp);
    v
}

fn write_ptr(dev: u32, block: u32, idx: usize, val: u32) {
    let bp = bread(dev, abs_block(block));
    let p = idx * 4;
    bp.data[p..p + 4].copy_from_slice(&val.to_le_bytes());
    crate::bio::bwrite(bp);
    brelse(bp);
}

fn ensure_block(ip: &mut INode, slot: usize) -> u32 {
    let mut a = ip.addrs[slot];
    if a == 0 {
        a = balloc(ip.dev).unwrap_or(0);
        if a != 0 {
            ip.addrs[slot] = a;
        }
    }
    a
}

fn bmap_indirect(ip: &mut INode, slot: usize, idx: usize) -> u32 {
    let ind = ensure_block(ip, slot);
    if ind == 0 {
        return 0;
    }
    let mut leaf = read_ptr(ip.dev, ind, idx);
    if leaf == 0 {
        leaf = match balloc(ip.dev) {
            Some(b) => b,
            None => return 0,
        };
        write_ptr(ip.dev, ind, idx, leaf);
    }
    abs_block(leaf)
}

fn bmap_double(ip: &mut INode, slot: usize, outer: usize, inner: usize) -> u32 {
    let dind = ensure_block(ip, slot);
    if dind == 0 {
        return 0;
    }
    let mut ind = read_ptr(ip.dev, dind, outer);
    if ind == 0 {
        ind = match balloc(ip.dev) {
            Some(b) => b,
            None => return 0,
        };
        write_ptr(ip.dev, dind, outer, ind);
    }
    let mut leaf = read_ptr(ip.dev, ind, inner);
    if leaf == 0 {
        leaf = match balloc(ip.dev) {
            Some(b) => b,
            None => return 0,
        };
        write_ptr(ip.dev, ind, inner, leaf);
    }
    abs_block(leaf)
}

fn bmap_triple(ip: &mut INode, slot: usize, l2: usize, l1: usize, l0: usize) -> u32 {
    let tind = ensure_block(ip, slot);
    if tind == 0 {
        return 0;
    }
    let mut dind = read_ptr(ip.dev, tind, l2);
    if dind == 0 {
        dind = match balloc(ip.dev) {
            Some(b) => b,
            None => return 0,
        };
        write_ptr(ip.dev, tind, l2, dind);
    }
    let mut ind = read_ptr(ip.dev, dind, l1);
    if ind == 0 {
        ind = match balloc(ip.dev) {
            Some(b) => b,
            None => return 0,
        };
        write_ptr(ip.dev, dind, l1, ind);
    }
    let mut leaf = read_ptr(ip.dev, ind, l0);
    if leaf == 0 {
        leaf = match balloc(ip.dev) {
            Some(b) => b,
            None => return 0,
        };
        write_ptr(ip.dev, ind, l0, leaf);
    }
    abs_block(leaf)
}

/// Read up to `n` bytes starting at `off` into `dst` (a user virtual
/// address if `is_user_dst`, a kernel pointer otherwise). Device inodes
/// dispatch to the registered driver instead of touching blocks.
pub fn readi(ip: &mut INode, is_user_dst: bool, dst: usize, off: u32, n: usize) -> usize {
    if ip.file_type == InodeType::Device {
        unsafe {
            let major = ip.major as usize;
            return match DEVSW[major] {
                Some(dev) => dev.read(is_user_dst, dst, n).unwrap_or(0),
                None => 0,
            };
        }
    }

    let mut n = n as u32;
    if off > ip.size || off.checked_add(n).is_none() {
        return 0;
    }
    if off + n > ip.size {
        n = ip.size - off;
    }

    let mut tot = 0u32;
    let mut off = off;
    let mut dst = dst;
    while tot < n {
        let block = bmap(ip, off / BSIZE as u32);
        if block == 0 {
            break;
        }
        let bp = bread(ip.dev, block);
        let boff = off as usize % BSIZE;
        let m = min(n - tot, (BSIZE - boff) as u32);

        if either_copyout(is_user_dst, dst, &bp.data[boff..boff + m as usize]).is_err() {
            brelse(bp);
            break;
        }
        brelse(bp);

        tot += m;
        off += m;
        dst += m as usize;
    }
    tot as usize
}

/// Write up to `n` bytes from `src` at `off`, extending size if the
/// write crosses the current end. Returns the number of bytes written.
pub fn writei(ip: &mut INode, is_user_src: bool, src: usize, off: u32, n: usize) -> isize {
    if ip.file_type == InodeType::Device {
        unsafe {
            let major = ip.major as usize;
            return match DEVSW[major] {
                Some(dev) => dev.write(is_user_src, src, n).map(|w| w as isize).unwrap_or(-1),
                None => -1,
            };
        }
    }

    let n = n as u32;
    if off.checked_add(n).is_none() {
        return -1;
    }

    let mut tot = 0u32;
    let mut off = off;
    let mut src = src;
    while tot < n {
        let block = bmap(ip, off / BSIZE as u32);
        if block == 0 {
            break;
        }
        let bp = bread(ip.dev, block);
        let boff = off as usize % BSIZE;
        let m = min(n - tot, (BSIZE - boff) as u32);

        if either_copyin(&mut bp.data[boff..boff + m as usize], is_user_src, src).is_err() {
            brelse(bp);
            break;
        }
        crate::bio::bwrite(bp);
        brelse(bp);

        tot += m;
        off += m;
        src += m as usize;
    }

    if off > ip.size {
        ip.size = off;
    }
    iupdate(ip);
    tot as isize
}

// ---- Directories ---------------------------------------------------------

fn rec_len_for(name_len: usize) -> u16 {
    (((DIRENT_HEADER + name_len) + 3) & !3) as u16
}

/// Look up `name` in directory `dp`. Returns the referenced inode (via
/// `iget`) and the byte offset of its directory entry.
pub fn dirlookup(dp: &mut INode, name: &[u8]) -> Option<(NonNull<INode>, u32)> {
    if !dp.is_dir() {
        panic!("dirlookup: not a directory");
    }
    if name.len() > DIRSIZ_MAX {
        return None;
    }

    let mut off = 0u32;
    let mut hdr = [0u8; DIRENT_HEADER];
    while (off as usize) < dp.size as usize {
        if readi(dp, false, hdr.as_mut_ptr() as usize, off, DIRENT_HEADER) != DIRENT_HEADER {
            panic!("dirlookup: short read");
        }
        let inum = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let rec_len = u16::from_le_bytes([hdr[4], hdr[5]]) as u32;
        let name_len = hdr[6] as usize;

        if rec_len == 0 {
            break;
        }

        if inum != 0 && name_len == name.len() {
            let mut namebuf = [0u8; DIRSIZ_MAX];
            readi(
                dp,
                false,
                namebuf.as_mut_ptr() as usize,
                off + DIRENT_HEADER as u32,
                name_len,
            );
            if &namebuf[..name_len] == name {
                return Some((iget(dp.dev, inum), off));
            }
        }

        off += rec_len;
    }
    None
}

/// Append a new directory entry for `name` -> `inum` at the tail of
/// `dp`, after confirming the name does not already exist.
pub fn dirlink(dp: &mut INode, name: &[u8], inum: u32, file_type: u8) -> crate::error::KResult<()> {
    if name.len() > DIRSIZ_MAX {
        return Err(crate::error::KError::BadPath);
    }
    if dirlookup(dp, name).is_some() {
        return Err(crate::error::KError::Exists);
    }

    let rec_len = rec_len_for(name.len());
    let mut entry = [0u8; DIRENT_HEADER + DIRSIZ_MAX];
    entry[0..4].copy_from_slice(&inum.to_le_bytes());
    entry[4..6].copy_from_slice(&rec_len.to_le_bytes());
    entry[6] = name.len() as u8;
    entry[7] = file_type;
    entry[8..8 + name.len()].copy_from_slice(name);

    let off = dp.size;
    let total = DIRENT_HEADER + name.len();
    if writei(dp, false, entry.as_ptr() as usize, off, total) as usize != total {
        return Err(crate::error::KError::NoBlock);
    }
    Ok(())
}

/// Clear the entry at byte offset `off` in `dp` by zeroing its inum field,
/// the same "inum 0 means free" convention dirlookup/dir_is_empty rely on.
pub fn dirunlink(dp: &mut INode, off: u32) {
    let zero = [0u8; 4];
    writei(dp, false, zero.as_ptr() as usize, off, zero.len());
}

/// A directory is empty iff it has no valid entries beyond `.`/`..`.
pub fn dir_is_empty(dp: &mut INode) -> bool {
    let mut off = 0u32;
    let mut hdr = [0u8; DIRENT_HEADER];
    let mut namebuf = [0u8; DIRSIZ_MAX];
    while (off as usize) < dp.size as usize {
        if readi(dp, false, hdr.as_mut_ptr() as usize, off, DIRENT_HEADER) != DIRENT_HEADER {
            panic!("dir_is_empty: short read");
        }
        let inum = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let rec_len = u16::from_le_bytes([hdr[4], hdr[5]]) as u32;
        let name_len = hdr[6] as usize;
        if rec_len == 0 {
            break;
        }
        if inum != 0 {
            readi(
                dp,
                false,
                namebuf.as_mut_ptr() as usize,
                off + DIRENT_HEADER as u32,
                name_len,
            );
            let is_dot = name_len == 1 && &namebuf[..1] == b".";
            let is_dotdot = name_len == 2 && &namebuf[..2] == b"..";
            if !is_dot && !is_dotdot {
                return false;
            }
        }
        off += rec_len;
    }
    true
}

pub fn file_type_for(t: InodeType) -> u8 {
    match t {
        InodeType::Dir => EXT2_FT_DIR,
        InodeType::File => EXT2_FT_REG_FILE,
        InodeType::Device => EXT2_FT_CHRDEV,
        InodeType::None => 0,
    }
}

// ---- Pathname resolution -------------------------------------------------

/// Copy the next `/`-separated path element starting at `path[idx]`.
/// Returns `(name_start, name_end, next_idx)`, or `None` if there is no
/// further element.
fn skipelem(path: &[u8], mut idx: usize) -> Option<(usize, usize, usize)> {
    while idx < path.len() && path[idx] == b'/' {
        idx += 1;
    }
    if idx == path.len() {
        return None;
    }
    let start = idx;
    while idx < path.len() && path[idx] != b'/' {
        idx += 1;
    }
    let end = idx;
    while idx < path.len() && path[idx] == b'/' {
        idx += 1;
    }
    Some((start, end, idx))
}

/// Walk `path`, starting at the root for an absolute path or the caller's
/// cwd otherwise. When `want_parent` is set, stops one component early
/// and returns the (unlocked) parent plus the unresolved leaf name;
/// otherwise returns the (unlocked) target inode.
fn namex<'a>(path: &'a [u8], want_parent: bool) -> (Option<NonNull<INode>>, &'a [u8]) {
    let mut ip = if !path.is_empty() && path[0] == b'/' {
        iget(ROOT_DEV, ROOT_INO)
    } else {
        let mut cwd = myproc().cwd.expect("namex: no cwd");
        idup(unsafe { cwd.as_mut() });
        cwd
    };

    let mut idx = 0usize;
    loop {
        let (start, end, next_idx) = match skipelem(path, idx) {
            Some(t) => t,
            None => break,
        };
        let name = &path[start..end];

        ilock(unsafe { ip.as_mut() });
        if !unsafe { ip.as_ref() }.is_dir() {
            iunlockput(unsafe { ip.as_mut() });
            return (None, &path[0..0]);
        }

        if want_parent && next_idx >= path.len() {
            iunlock(unsafe { ip.as_mut() });
            return (Some(ip), &path[start..end]);
        }

        let next = match dirlookup(unsafe { ip.as_mut() }, name) {
            Some((next_ip, _off)) => next_ip,
            None => {
                iunlockput(unsafe { ip.as_mut() });
                return (None, &path[0..0]);
            }
        };
        iunlockput(unsafe { ip.as_mut() });
        ip = next;
        idx = next_idx;
    }

    if want_parent {
        iput(unsafe { ip.as_mut() });
        return (None, &path[0..0]);
    }
    (Some(ip), &path[0..0])
}

pub fn namei(path: &[u8]) -> Option<NonNull<INode>> {
    namex(path, false).0
}

pub fn nameiparent<'a>(path: &'a [u8]) -> Option<(NonNull<INode>, &'a [u8])> {
    let (ip, name) = namex(path, true);
    ip.map(|ip| (ip, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rec_len_rounds_up_to_four() {
        assert_eq!(rec_len_for(1), 12); // 8 + 1 -> 9 -> 12
        assert_eq!(rec_len_for(4), 12); // 8 + 4 -> 12
        assert_eq!(rec_len_for(5), 16); // 8 + 5 -> 13 -> 16
    }

    #[test]
    fn skipelem_splits_components() {
        let path = b"a/bb/c";
        let (s0, e0, i0) = skipelem(path, 0).unwrap();
        assert_eq!(&path[s0..e0], b"a");
        let (s1, e1, i1) = skipelem(path, i0).unwrap();
        assert_eq!(&path[s1..e1], b"bb");
        let (s2, e2, _) = skipelem(path, i1).unwrap();
        assert_eq!(&path[s2..e2], b"c");
    }

    #[test]
    fn skipelem_collapses_repeated_slashes() {
        let path = b"///a//bb";
        let (s, e, next) = skipelem(path, 0).unwrap();
        assert_eq!(&path[s..e], b"a");
        let (s2, e2, _) = skipelem(path, next).unwrap();
        assert_eq!(&path[s2..e2], b"bb");
    }
}
