use super::{Block, Error, Result, BLOCK_SIZE};
use log::debug;
use memmap::MmapMut;
use std::{fs::OpenOptions, io, path::Path};

/// Fixed-size block access to the medium holding an image.
pub trait BlockDevice {
    fn block_count(&self) -> u32;

    fn read_block(&self, index: u32) -> Result<Box<Block>>;

    fn write_block(&mut self, index: u32, block: &Block) -> Result<()>;

    /// Makes every preceding write durable.
    fn sync(&mut self) -> Result<()>;

    fn check_range(&self, index: u32) -> Result<()> {
        if index >= self.block_count() {
            return Err(Error::BlockOutOfRange {
                index,
                count: self.block_count(),
            });
        }

        Ok(())
    }
}

/// An image file mapped read/write into memory.
#[derive(Debug)]
pub struct ImageFile {
    mmap: MmapMut,
}

impl ImageFile {
    pub fn open<P>(image_path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(image_path.as_ref())?;
        if file.metadata()?.len() < BLOCK_SIZE as u64 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "image is smaller than one block",
            )));
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        debug!(
            "mapped {} ({} bytes)",
            image_path.as_ref().display(),
            mmap.len()
        );

        Ok(Self { mmap })
    }

    fn offset(index: u32) -> usize {
        index as usize * BLOCK_SIZE
    }
}

impl BlockDevice for ImageFile {
    fn block_count(&self) -> u32 {
        (self.mmap.len() / BLOCK_SIZE) as u32
    }

    fn read_block(&self, index: u32) -> Result<Box<Block>> {
        self.check_range(index)?;
        let offset = Self::offset(index);
        let mut block = Box::new([0u8; BLOCK_SIZE]);
        block.copy_from_slice(&self.mmap[offset..offset + BLOCK_SIZE]);

        Ok(block)
    }

    fn write_block(&mut self, index: u32, block: &Block) -> Result<()> {
        self.check_range(index)?;
        let offset = Self::offset(index);
        self.mmap[offset..offset + BLOCK_SIZE].copy_from_slice(block);

        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(self.mmap.flush()?)
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Write(u32),
    Sync,
}

/// Blocks held in memory. Counts writes and logs every write and sync in
/// order, so tests can check whether and in what order an operation touched
/// the medium.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MemDevice {
    blocks: Vec<Box<Block>>,
    pub writes: usize,
    pub events: Vec<Event>,
}

#[cfg(test)]
impl MemDevice {
    pub fn new(count: u32) -> Self {
        Self {
            blocks: (0..count).map(|_| super::zeroed_block()).collect(),
            writes: 0,
            events: Vec::new(),
        }
    }

    pub fn block(&self, index: u32) -> &Block {
        &self.blocks[index as usize]
    }
}

#[cfg(test)]
impl BlockDevice for MemDevice {
    fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn read_block(&self, index: u32) -> Result<Box<Block>> {
        self.check_range(index)?;
        Ok(self.blocks[index as usize].clone())
    }

    fn write_block(&mut self, index: u32, block: &Block) -> Result<()> {
        self.check_range(index)?;
        self.blocks[index as usize].copy_from_slice(block);
        self.writes += 1;
        self.events.push(Event::Write(index));

        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.events.push(Event::Sync);
        Ok(())
    }
}
