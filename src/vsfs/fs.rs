use super::{
    bitmap::Allocator,
    device::{BlockDevice, ImageFile},
    journal::Journal,
    replay::{self, ReplaySummary, Replayer},
    transaction,
    types::{DirEntry, Inode, Superblock},
    Result, DIRENT_SIZE, ROOT_INODE,
};
use std::path::Path;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JournalStatus {
    pub bytes_used: u32,
    pub capacity: u32,
    pub transactions: u32,
    pub pending_blocks: u32,
    pub uncommitted_bytes: u32,
    pub inodes_allocated: u32,
    pub inode_capacity: u32,
}

/// A formatted image and its validated layout.
#[derive(Debug)]
pub struct Vsfs<D> {
    dev: D,
    sb: Superblock,
}

impl Vsfs<ImageFile> {
    pub fn open_image<P>(image_path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        Self::open(ImageFile::open(image_path)?)
    }
}

impl<D: BlockDevice> Vsfs<D> {
    pub fn open(dev: D) -> Result<Self> {
        let sb = Superblock::load(&dev)?;
        Ok(Self { dev, sb })
    }

    pub fn create(&mut self, name: &str) -> Result<u32> {
        transaction::create_file(&mut self.dev, &self.sb, name)
    }

    pub fn install(&mut self) -> Result<ReplaySummary> {
        replay::install(&mut self.dev, &self.sb)
    }

    /// Journal usage and pending work, without modifying anything.
    pub fn status(&self) -> Result<JournalStatus> {
        let journal = Journal::load(&self.dev, &self.sb)?;
        let mut replayer = Replayer::new(&self.sb);
        for item in journal.scan(&self.dev) {
            let (offset, record) = item?;
            replayer.feed(offset, record)?;
        }
        let summary = replayer.finish();

        let inodes = Allocator::new(self.sb.inode_capacity());
        let bitmap = self.dev.read_block(self.sb.inode_bitmap)?;

        Ok(JournalStatus {
            bytes_used: journal.bytes_used(),
            capacity: journal.capacity(),
            transactions: summary.transactions,
            pending_blocks: summary.blocks,
            uncommitted_bytes: journal.bytes_used() - summary.committed_end,
            inodes_allocated: inodes.allocated(&bitmap),
            inode_capacity: inodes.capacity(),
        })
    }

    /// Entries of the root directory as currently installed.
    pub fn list(&self) -> Result<Vec<(u32, String)>> {
        let (block_no, offset) = self.sb.inode_position(ROOT_INODE);
        let root = Inode::deserialize_from(&*self.dev.read_block(block_no)?, offset)?;
        if !self.sb.is_data_block(root.direct[0]) {
            return Ok(Vec::new());
        }

        let dir_block = self.dev.read_block(root.direct[0])?;
        let entries = (root.size as usize / DIRENT_SIZE).min(dir_block.len() / DIRENT_SIZE);
        (0..entries)
            .map(|i| DirEntry::deserialize_from(&dir_block, i).map(|e| (e.inode, e.name())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mkfs::{self, Geometry},
        vsfs::{
            device::MemDevice,
            journal::{Record, HEADER_SIZE},
            util, Error, BLOCK_SIZE, INODE_TYPE_DIR, INODE_TYPE_FILE,
        },
    };

    fn make_fs(geometry: &Geometry) -> anyhow::Result<Vsfs<MemDevice>> {
        let sb = Superblock::new(
            geometry.journal_blocks,
            geometry.inode_count,
            geometry.data_blocks,
        );
        let mut dev = MemDevice::new(sb.total_blocks);
        mkfs::format(&mut dev, geometry)?;

        Ok(Vsfs::open(dev)?)
    }

    fn live_region(fs: &Vsfs<MemDevice>) -> Vec<Vec<u8>> {
        (fs.sb.fs_start()..fs.sb.total_blocks)
            .map(|i| fs.dev.block(i).to_vec())
            .collect()
    }

    fn root(fs: &Vsfs<MemDevice>) -> anyhow::Result<Inode> {
        let (block, offset) = fs.sb.inode_position(ROOT_INODE);
        Ok(Inode::deserialize_from(fs.dev.block(block), offset)?)
    }

    #[test]
    fn fresh_image() -> anyhow::Result<()> {
        let fs = make_fs(&Geometry::default())?;
        let root = root(&fs)?;

        assert_eq!(root.kind, INODE_TYPE_DIR);
        assert_eq!(root.links, 2);
        assert_eq!(root.size, 0);
        assert_eq!(root.direct[0], 21);
        assert!(fs.list()?.is_empty());

        let status = fs.status()?;
        assert_eq!(status.bytes_used, HEADER_SIZE);
        assert_eq!(status.capacity, 16 * 4096);
        assert_eq!(status.transactions, 0);
        assert_eq!(status.inodes_allocated, 1);
        assert_eq!(status.inode_capacity, 64);

        Ok(())
    }

    #[test]
    fn create_touches_only_the_journal() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        let before = live_region(&fs);
        let superblock = fs.dev.block(0).to_vec();

        fs.create("foo.txt")?;

        assert_eq!(live_region(&fs), before);
        assert_eq!(fs.dev.block(0).to_vec(), superblock);
        assert!(fs.list()?.is_empty());

        let status = fs.status()?;
        assert_eq!(status.transactions, 1);
        assert_eq!(status.pending_blocks, 4);
        assert_eq!(status.bytes_used, 8 + 4 * 4104 + 4);
        assert_eq!(status.uncommitted_bytes, 0);

        Ok(())
    }

    #[test]
    fn journal_holds_four_images_and_a_commit() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        fs.create("foo.txt")?;

        let journal = Journal::load(&fs.dev, &fs.sb)?;
        let targets = journal
            .scan(&fs.dev)
            .map(|item| {
                item.map(|(_, record)| match record {
                    Record::Data { block, .. } => Some(block),
                    Record::Commit => None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // inode bitmap, new inode's table block, directory block, root's table block
        assert_eq!(targets, vec![Some(17), Some(19), Some(21), Some(19), None]);

        Ok(())
    }

    #[test]
    fn create_then_install() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        let old_root = root(&fs)?;
        let before = util::now();

        let ino = fs.create("foo.txt")?;
        let summary = fs.install()?;
        let after = util::now();

        assert_eq!(ino, 1);
        assert_eq!(summary.transactions, 1);
        assert_eq!(summary.blocks, 4);

        assert!(Allocator::new(64).is_allocated(fs.dev.block(17), ino));

        let (block, offset) = fs.sb.inode_position(ino);
        let inode = Inode::deserialize_from(fs.dev.block(block), offset)?;
        assert_eq!(inode.kind, INODE_TYPE_FILE);
        assert_eq!(inode.links, 1);
        assert_eq!(inode.size, 0);
        assert_eq!(inode.created_at, inode.modified_at);
        assert!(inode.created_at >= before && inode.created_at <= after);

        let entry = DirEntry::deserialize_from(fs.dev.block(21), old_root.size as usize / 32)?;
        assert_eq!(entry.inode, ino);
        assert_eq!(entry.name(), "foo.txt");

        let new_root = root(&fs)?;
        assert_eq!(new_root.size, old_root.size + 32);
        assert!(new_root.modified_at >= before && new_root.modified_at <= after);
        assert_eq!(new_root.kind, INODE_TYPE_DIR);

        assert_eq!(Journal::load(&fs.dev, &fs.sb)?.bytes_used(), 8);
        assert_eq!(fs.list()?, vec![(1, "foo.txt".to_string())]);

        Ok(())
    }

    #[test]
    fn second_install_writes_nothing() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        fs.create("foo.txt")?;
        fs.install()?;

        let writes = fs.dev.writes;
        let region = live_region(&fs);
        assert_eq!(fs.install()?, ReplaySummary::default());
        assert_eq!(fs.dev.writes, writes);
        assert_eq!(live_region(&fs), region);

        Ok(())
    }

    #[test]
    fn creates_before_install_compose() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;

        assert_eq!(fs.create("a")?, 1);
        assert_eq!(fs.create("b")?, 2);
        assert!(matches!(fs.create("a"), Err(Error::AlreadyExists(_))));
        fs.install()?;

        assert_eq!(
            fs.list()?,
            vec![(1, "a".to_string()), (2, "b".to_string())]
        );
        assert_eq!(root(&fs)?.size, 64);

        Ok(())
    }

    #[test]
    fn long_names_are_truncated() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        let name = "a-rather-long-file-name-that-does-not-fit.txt";
        fs.create(name)?;
        fs.install()?;

        let entry = DirEntry::deserialize_from(fs.dev.block(21), 0)?;
        assert_eq!(&entry.name[..27], &name.as_bytes()[..27]);
        assert_eq!(entry.name[27], 0);
        assert_eq!(fs.list()?[0].1, &name[..27]);

        Ok(())
    }

    #[test]
    fn crash_before_commit_is_discarded() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        let before = live_region(&fs);

        // what a create interrupted after two of its records would leave behind
        let mut journal = Journal::load(&fs.dev, &fs.sb)?;
        let mut bitmap = fs.dev.read_block(17)?;
        bitmap[0] |= 0b10;
        journal.append(
            &mut fs.dev,
            &Record::Data {
                block: 17,
                payload: bitmap,
            },
        )?;
        journal.append(
            &mut fs.dev,
            &Record::Data {
                block: 21,
                payload: Box::new([0xee; BLOCK_SIZE]),
            },
        )?;

        let summary = fs.install()?;
        assert_eq!(summary.transactions, 0);
        assert_eq!(summary.discarded, 2);
        assert_eq!(live_region(&fs), before);
        assert!(Journal::load(&fs.dev, &fs.sb)?.is_empty());

        Ok(())
    }

    #[test]
    fn next_create_overwrites_uncommitted_tail() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        fs.create("a")?;
        let mut journal = Journal::load(&fs.dev, &fs.sb)?;
        journal.append(
            &mut fs.dev,
            &Record::Data {
                block: 40,
                payload: Box::new([0xee; BLOCK_SIZE]),
            },
        )?;
        assert_eq!(fs.status()?.uncommitted_bytes, 4104);

        fs.create("b")?;
        let status = fs.status()?;
        assert_eq!(status.transactions, 2);
        assert_eq!(status.pending_blocks, 8);
        assert_eq!(status.uncommitted_bytes, 0);
        assert_eq!(status.bytes_used, 8 + 2 * (4 * 4104 + 4));

        let summary = fs.install()?;
        assert_eq!(summary.blocks, 8);
        assert_eq!(summary.discarded, 0);
        assert!(fs.dev.block(40).iter().all(|&b| b == 0));
        assert_eq!(
            fs.list()?,
            vec![(1, "a".to_string()), (2, "b".to_string())]
        );

        Ok(())
    }

    #[test]
    fn journal_fills_up() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        for name in &["one", "two", "three"] {
            fs.create(name)?;
        }
        let used = fs.status()?.bytes_used;
        assert_eq!(used, 8 + 3 * (4 * 4104 + 4));

        let writes = fs.dev.writes;
        assert!(matches!(
            fs.create("four"),
            Err(Error::JournalFull { .. })
        ));
        assert_eq!(fs.status()?.bytes_used, used);
        assert_eq!(fs.dev.writes, writes);

        fs.install()?;
        fs.create("four")?;
        fs.install()?;
        assert_eq!(fs.list()?.len(), 4);

        Ok(())
    }

    #[test]
    fn runs_out_of_inodes() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry {
            inode_count: 3,
            ..Geometry::default()
        })?;
        fs.create("a")?;
        fs.create("b")?;
        let used = fs.status()?.bytes_used;

        assert!(matches!(fs.create("c"), Err(Error::NoFreeInode)));
        assert_eq!(fs.status()?.bytes_used, used);

        Ok(())
    }

    #[test]
    fn new_inode_in_second_table_block() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        let mut bitmap = [0u8; BLOCK_SIZE];
        bitmap[..4].fill(0xff);
        fs.dev.write_block(17, &bitmap)?;

        let ino = fs.create("far")?;
        fs.install()?;

        assert_eq!(ino, 32);
        let inode = Inode::deserialize_from(fs.dev.block(20), 0)?;
        assert_eq!(inode.kind, INODE_TYPE_FILE);
        assert_eq!(root(&fs)?.size, 32);

        Ok(())
    }

    #[test]
    fn full_directory_is_rejected() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        let mut table = fs.dev.read_block(19)?;
        let mut dir = Inode::deserialize_from(&table, 0)?;
        dir.size = (BLOCK_SIZE - DIRENT_SIZE) as u32;
        dir.serialize_into(&mut table, 0)?;
        fs.dev.write_block(19, &table)?;

        // room for exactly one more entry, in the last slot
        fs.create("last")?;
        fs.install()?;
        let entry = DirEntry::deserialize_from(fs.dev.block(21), 127)?;
        assert_eq!(entry.name(), "last");
        assert_eq!(root(&fs)?.size as usize, BLOCK_SIZE);

        let used = fs.status()?.bytes_used;
        assert!(matches!(
            fs.create("overflow"),
            Err(Error::DirectoryFull { entries: 128 })
        ));
        assert_eq!(fs.status()?.bytes_used, used);

        Ok(())
    }

    #[test]
    fn corrupt_journal_blocks_create() -> anyhow::Result<()> {
        let mut fs = make_fs(&Geometry::default())?;
        fs.create("a")?;

        let mut block = fs.dev.read_block(1)?;
        block[8] = 0;
        block[9] = 0;
        fs.dev.write_block(1, &block)?;

        assert!(matches!(
            fs.create("b"),
            Err(Error::UnknownRecord { offset: 8, kind: 0 })
        ));
        assert!(matches!(fs.status(), Err(Error::UnknownRecord { .. })));

        Ok(())
    }
}
