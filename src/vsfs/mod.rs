pub mod bitmap;
pub mod device;
pub mod error;
pub mod fs;
pub mod journal;
pub mod replay;
pub mod transaction;
pub mod types;
pub mod util;

pub use error::{Error, ErrorKind, Result};

const VSFS_MAGIC: u32 = 0x5653_4653;
const JOURNAL_MAGIC: u32 = 0x4A52_4E4C;

pub const BLOCK_SIZE: usize = 4096;
pub const SUPERBLOCK_SIZE: usize = 128;
pub const INODE_SIZE: usize = 128;
pub const INODES_PER_BLOCK: u32 = (BLOCK_SIZE / INODE_SIZE) as u32;
pub const DIRECT_POINTERS: usize = 8;
pub const DIRENT_SIZE: usize = 32;
pub const NAME_LEN: usize = 28;

pub const ROOT_INODE: u32 = 0;
pub const INODE_TYPE_FILE: u16 = 1;
pub const INODE_TYPE_DIR: u16 = 2;

/// One full block, as transferred to and from a [`device::BlockDevice`].
pub type Block = [u8; BLOCK_SIZE];

pub fn zeroed_block() -> Box<Block> {
    Box::new([0u8; BLOCK_SIZE])
}
