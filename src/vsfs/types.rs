use super::{
    device::BlockDevice, util, Block, Error, Result, BLOCK_SIZE, DIRECT_POINTERS, DIRENT_SIZE,
    INODES_PER_BLOCK, INODE_SIZE, NAME_LEN, SUPERBLOCK_SIZE, VSFS_MAGIC,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub inode_count: u32,
    pub journal_block: u32,
    pub inode_bitmap: u32,
    pub data_bitmap: u32,
    pub inode_start: u32,
    pub data_start: u32,
}

impl Superblock {
    /// Lays out the regions back to back after block 0.
    pub fn new(journal_blocks: u32, inode_count: u32, data_blocks: u32) -> Self {
        let journal_block = 1;
        let inode_bitmap = journal_block + journal_blocks;
        let data_bitmap = inode_bitmap + 1;
        let inode_start = data_bitmap + 1;
        let inode_blocks = (inode_count + INODES_PER_BLOCK - 1) / INODES_PER_BLOCK;
        let data_start = inode_start + inode_blocks;

        Self {
            magic: VSFS_MAGIC,
            block_size: BLOCK_SIZE as u32,
            total_blocks: data_start + data_blocks,
            inode_count,
            journal_block,
            inode_bitmap,
            data_bitmap,
            inode_start,
            data_start,
        }
    }

    pub fn load<D: BlockDevice>(dev: &D) -> Result<Self> {
        let block = dev.read_block(0)?;
        let sb = Self::deserialize_from(&block[..SUPERBLOCK_SIZE])?;
        if sb.total_blocks > dev.block_count() {
            return Err(Error::InvalidImage(format!(
                "superblock declares {} blocks but the image holds {}",
                sb.total_blocks,
                dev.block_count()
            )));
        }

        Ok(sb)
    }

    pub fn serialize_into(&self, block: &mut Block) -> Result<()> {
        block[..SUPERBLOCK_SIZE].fill(0);
        bincode::serialize_into(&mut block[..SUPERBLOCK_SIZE], self)?;

        Ok(())
    }

    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        let sb: Self = bincode::deserialize(buf)?;
        sb.validate()?;

        Ok(sb)
    }

    fn validate(&self) -> Result<()> {
        if self.magic != VSFS_MAGIC {
            return Err(Error::InvalidImage(format!(
                "bad magic {:#010x}",
                self.magic
            )));
        }
        if self.block_size != BLOCK_SIZE as u32 {
            return Err(Error::InvalidImage(format!(
                "unsupported block size {}",
                self.block_size
            )));
        }

        let ordered = 0 < self.journal_block
            && self.journal_block < self.inode_bitmap
            && self.inode_bitmap < self.data_bitmap
            && self.data_bitmap < self.inode_start
            && self.inode_start < self.data_start
            && self.data_start <= self.total_blocks;
        if !ordered {
            return Err(Error::InvalidImage(format!("inconsistent layout {:?}", self)));
        }

        Ok(())
    }

    pub fn journal_blocks(&self) -> u32 {
        self.inode_bitmap - self.journal_block
    }

    pub fn inode_table_blocks(&self) -> u32 {
        self.data_start - self.inode_start
    }

    pub fn data_blocks(&self) -> u32 {
        self.total_blocks - self.data_start
    }

    /// Number of inode numbers that are both declared and backed by table space.
    pub fn inode_capacity(&self) -> u32 {
        self.inode_count
            .min(self.inode_table_blocks() * INODES_PER_BLOCK)
            .min(BLOCK_SIZE as u32 * 8)
    }

    pub fn data_capacity(&self) -> u32 {
        self.data_blocks().min(BLOCK_SIZE as u32 * 8)
    }

    /// First block past the journal; everything from here on is live filesystem state.
    pub fn fs_start(&self) -> u32 {
        self.inode_bitmap
    }

    // (table block, byte offset within it)
    pub fn inode_position(&self, ino: u32) -> (u32, usize) {
        (
            self.inode_start + ino / INODES_PER_BLOCK,
            (ino % INODES_PER_BLOCK) as usize * INODE_SIZE,
        )
    }

    pub fn is_data_block(&self, block: u32) -> bool {
        block >= self.data_start && block < self.total_blocks
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Inode {
    pub kind: u16,
    pub links: u16,
    pub size: u32,
    pub direct: [u32; DIRECT_POINTERS],
    pub created_at: u32,
    pub modified_at: u32,
}

impl Inode {
    pub fn new(kind: u16, links: u16, now: u32) -> Self {
        Self {
            kind,
            links,
            created_at: now,
            modified_at: now,
            ..Self::default()
        }
    }

    /// Writes this inode into its slot, zeroing the slot's padding.
    pub fn serialize_into(&self, block: &mut Block, offset: usize) -> Result<()> {
        let slot = &mut block[offset..offset + INODE_SIZE];
        slot.fill(0);
        bincode::serialize_into(slot, self)?;

        Ok(())
    }

    pub fn deserialize_from(block: &Block, offset: usize) -> Result<Self> {
        Ok(bincode::deserialize(&block[offset..offset + INODE_SIZE])?)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: [u8; NAME_LEN],
}

impl DirEntry {
    pub fn new(inode: u32, name: &str) -> Self {
        Self {
            inode,
            name: util::encode_name(name),
        }
    }

    pub fn name(&self) -> String {
        util::decode_name(&self.name)
    }

    pub fn serialize_into(&self, block: &mut Block, index: usize) -> Result<()> {
        let offset = index * DIRENT_SIZE;
        bincode::serialize_into(&mut block[offset..offset + DIRENT_SIZE], self)?;

        Ok(())
    }

    pub fn deserialize_from(block: &Block, index: usize) -> Result<Self> {
        let offset = index * DIRENT_SIZE;
        Ok(bincode::deserialize(&block[offset..offset + DIRENT_SIZE])?)
    }
}
