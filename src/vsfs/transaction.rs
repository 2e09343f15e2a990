use super::{
    bitmap::Allocator,
    device::BlockDevice,
    journal::{Journal, Record},
    replay::{BlockWrite, Replayer},
    types::{DirEntry, Inode, Superblock},
    util, Block, Error, Result, BLOCK_SIZE, DIRENT_SIZE, INODE_TYPE_FILE, ROOT_INODE,
};
use log::{debug, info, warn};
use std::collections::HashMap;

/// An ordered list of full-block writes that reach the journal as one unit.
///
/// Reads go through the transaction: a block already written in it reads back
/// as written, a block changed by a committed but not yet installed journal
/// transaction reads back as journaled, anything else comes from the device.
#[derive(Debug, Default)]
pub struct Transaction {
    journaled: HashMap<u32, Box<Block>>,
    writes: Vec<BlockWrite>,
    /// End of the last committed journal transaction seen by `begin`.
    committed_end: Option<u32>,
}

impl Transaction {
    pub fn begin<D: BlockDevice>(journal: &Journal, dev: &D, sb: &Superblock) -> Result<Self> {
        let mut replayer = Replayer::new(sb);
        let mut journaled = HashMap::new();
        for item in journal.scan(dev) {
            let (offset, record) = item?;
            if let Some(writes) = replayer.feed(offset, record)? {
                journaled.extend(writes);
            }
        }

        let summary = replayer.finish();
        if summary.transactions > 0 {
            debug!(
                "{} committed transaction(s) pending install, {} block(s)",
                summary.transactions,
                journaled.len()
            );
        }

        Ok(Self {
            journaled,
            writes: Vec::new(),
            committed_end: Some(summary.committed_end),
        })
    }

    pub fn read<D: BlockDevice>(&self, dev: &D, index: u32) -> Result<Box<Block>> {
        if let Some((_, block)) = self.writes.iter().rev().find(|(i, _)| *i == index) {
            return Ok(block.clone());
        }
        if let Some(block) = self.journaled.get(&index) {
            return Ok(block.clone());
        }

        dev.read_block(index)
    }

    pub fn write(&mut self, index: u32, block: Box<Block>) {
        self.writes.push((index, block));
    }

    /// One data record per write, in order, closed by a commit record.
    pub fn records(&self) -> Vec<Record> {
        self.writes
            .iter()
            .map(|(block, payload)| Record::Data {
                block: *block,
                payload: payload.clone(),
            })
            .chain(std::iter::once(Record::Commit))
            .collect()
    }

    /// Appends the writes and a commit record. Records past the last commit
    /// are left over from an interrupted append and get overwritten.
    pub fn commit<D: BlockDevice>(self, journal: &mut Journal, dev: &mut D) -> Result<()> {
        if let Some(end) = self.committed_end {
            if end < journal.bytes_used() {
                warn!(
                    "overwriting {} uncommitted journal bytes at offset {}",
                    journal.bytes_used() - end,
                    end
                );
                journal.truncate_to(dev, end)?;
            }
        }
        journal.append_all(dev, &self.records())?;
        debug!("committed {} block write(s)", self.writes.len());

        Ok(())
    }
}

/// Journals the creation of an empty file called `name` in the root directory
/// and returns its inode number. Nothing outside the journal is modified.
pub fn create_file<D: BlockDevice>(dev: &mut D, sb: &Superblock, name: &str) -> Result<u32> {
    util::validate_name(name)?;
    let mut journal = Journal::ensure_initialized(dev, sb)?;
    let mut tx = Transaction::begin(&journal, &*dev, sb)?;

    let inodes = Allocator::new(sb.inode_capacity());
    let mut inode_bitmap = tx.read(&*dev, sb.inode_bitmap)?;
    let data_bitmap = tx.read(&*dev, sb.data_bitmap)?;
    debug!(
        "{} of {} inodes and {} of {} data blocks in use",
        inodes.allocated(&inode_bitmap),
        inodes.capacity(),
        Allocator::new(sb.data_capacity()).allocated(&data_bitmap),
        sb.data_capacity()
    );
    if !inodes.is_allocated(&inode_bitmap, ROOT_INODE) {
        return Err(Error::InvalidImage("root inode is not allocated".into()));
    }

    let (root_block_no, root_offset) = sb.inode_position(ROOT_INODE);
    let mut root = Inode::deserialize_from(&*tx.read(&*dev, root_block_no)?, root_offset)?;
    let dir_block_no = root.direct[0];
    if !sb.is_data_block(dir_block_no) {
        return Err(Error::InvalidImage(format!(
            "root directory block {} is outside the data region",
            dir_block_no
        )));
    }
    let mut dir_block = tx.read(&*dev, dir_block_no)?;

    let entries = root.size as usize / DIRENT_SIZE;
    if (entries + 1) * DIRENT_SIZE > BLOCK_SIZE {
        return Err(Error::DirectoryFull {
            entries: entries as u32,
        });
    }
    let entry_name = util::encode_name(name);
    for i in 0..entries {
        if DirEntry::deserialize_from(&dir_block, i)?.name == entry_name {
            return Err(Error::AlreadyExists(util::decode_name(&entry_name)));
        }
    }

    let ino = inodes.find_free(&inode_bitmap).ok_or(Error::NoFreeInode)?;
    let now = util::now();

    inodes.mark(&mut inode_bitmap, ino);
    tx.write(sb.inode_bitmap, inode_bitmap);

    let (inode_block_no, inode_offset) = sb.inode_position(ino);
    let mut inode_block = tx.read(&*dev, inode_block_no)?;
    Inode::new(INODE_TYPE_FILE, 1, now).serialize_into(&mut inode_block, inode_offset)?;
    tx.write(inode_block_no, inode_block);

    DirEntry::new(ino, name).serialize_into(&mut dir_block, entries)?;
    tx.write(dir_block_no, dir_block);

    // Read again: the new inode may share a table block with the root.
    let mut root_block = tx.read(&*dev, root_block_no)?;
    root.size += DIRENT_SIZE as u32;
    root.modified_at = now;
    root.serialize_into(&mut root_block, root_offset)?;
    tx.write(root_block_no, root_block);

    tx.commit(&mut journal, dev)?;
    info!(
        "journaled creation of {:?} as inode {} (entry {})",
        util::decode_name(&entry_name),
        ino,
        entries
    );

    Ok(ino)
}
