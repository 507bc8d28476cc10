// File status, returned by fstat/stat and consulted by namei callers that
// need to know whether a path resolved to a directory.

pub const T_DIR: u16 = 1; // directory
pub const T_FILE: u16 = 2; // regular file
pub const T_DEVICE: u16 = 3; // device

#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct Stat {
    pub dev: u32,   // device number
    pub ino: u32,   // inode number
    pub type_: u16, // one of T_DIR/T_FILE/T_DEVICE
    pub nlink: u16, // number of links
    pub size: u64,  // size in bytes
}

/// Fill `st` from a locked inode.
pub fn stati(ip: &crate::file::INode, st: &mut Stat) {
    use crate::file::InodeType;

    st.dev = ip.dev;
    st.ino = ip.inum;
    st.type_ = match ip.file_type {
        InodeType::Dir => T_DIR,
        InodeType::File => T_FILE,
        InodeType::Device => T_DEVICE,
        InodeType::None => 0,
    };
    st.nlink = ip.nlink;
    st.size = ip.size as u64;
}
