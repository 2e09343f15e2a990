use crate::vsfs::{
    bitmap::Allocator,
    device::{BlockDevice, ImageFile},
    journal::Journal,
    types::{Inode, Superblock},
    util, zeroed_block, BLOCK_SIZE, INODES_PER_BLOCK, INODE_TYPE_DIR, ROOT_INODE,
};
use anyhow::anyhow;
use std::{
    fs::{File, OpenOptions},
    path::Path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub journal_blocks: u32,
    pub inode_count: u32,
    pub data_blocks: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            journal_blocks: 16,
            inode_count: 2 * INODES_PER_BLOCK,
            data_blocks: 64,
        }
    }
}

impl Geometry {
    fn validate(&self) -> anyhow::Result<()> {
        let max = BLOCK_SIZE as u32 * 8;
        if self.journal_blocks == 0 || self.journal_blocks > 1 << 16 {
            return Err(anyhow!(
                "Journal must span between 1 and {} blocks",
                1 << 16
            ));
        }
        if self.inode_count == 0 || self.inode_count > max {
            return Err(anyhow!("Inode count must be between 1 and {}", max));
        }
        if self.data_blocks == 0 || self.data_blocks > max {
            return Err(anyhow!("Data block count must be between 1 and {}", max));
        }

        Ok(())
    }
}

/// Creates a new image at `path` and formats it.
pub fn make<P>(path: P, geometry: &Geometry) -> anyhow::Result<Superblock>
where
    P: AsRef<Path>,
{
    geometry.validate()?;
    let sb = Superblock::new(
        geometry.journal_blocks,
        geometry.inode_count,
        geometry.data_blocks,
    );

    let file = create_file(path.as_ref())?;
    file.set_len(sb.total_blocks as u64 * BLOCK_SIZE as u64)?;
    drop(file);

    let mut dev = ImageFile::open(path)?;
    format(&mut dev, geometry)
}

/// Lays out an empty filesystem: superblock, empty journal, root directory.
pub fn format<D: BlockDevice>(dev: &mut D, geometry: &Geometry) -> anyhow::Result<Superblock> {
    geometry.validate()?;
    let sb = Superblock::new(
        geometry.journal_blocks,
        geometry.inode_count,
        geometry.data_blocks,
    );
    if sb.total_blocks > dev.block_count() {
        return Err(anyhow!(
            "Image holds {} blocks but the layout needs {}",
            dev.block_count(),
            sb.total_blocks
        ));
    }

    let zero = zeroed_block();
    for index in 0..sb.total_blocks {
        dev.write_block(index, &zero)?;
    }

    let mut block = zeroed_block();
    sb.serialize_into(&mut block)?;
    dev.write_block(0, &block)?;

    Journal::ensure_initialized(dev, &sb)?;

    let root_dir_block = sb.data_start;

    let mut bitmap = zeroed_block();
    Allocator::new(sb.inode_capacity()).mark(&mut bitmap, ROOT_INODE);
    dev.write_block(sb.inode_bitmap, &bitmap)?;

    let mut bitmap = zeroed_block();
    Allocator::new(sb.data_capacity()).mark(&mut bitmap, root_dir_block - sb.data_start);
    dev.write_block(sb.data_bitmap, &bitmap)?;

    let mut root = Inode::new(INODE_TYPE_DIR, 2, util::now());
    root.direct[0] = root_dir_block;
    let (table_block, offset) = sb.inode_position(ROOT_INODE);
    let mut block = zeroed_block();
    root.serialize_into(&mut block, offset)?;
    dev.write_block(table_block, &block)?;

    dev.sync()?;

    Ok(sb)
}

fn create_file<P: AsRef<Path>>(name: P) -> anyhow::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(name)?;

    Ok(file)
}
