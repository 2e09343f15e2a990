use super::{
    device::BlockDevice,
    journal::{Journal, Record, COMMIT_RECORD_SIZE, HEADER_SIZE},
    types::Superblock,
    Block, Error, Result,
};
use log::{debug, info, warn};

/// One staged block write: target block and its full new content.
pub type BlockWrite = (u32, Box<Block>);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub transactions: u32,
    pub blocks: u32,
    /// Data records left without a commit at the end of the journal.
    pub discarded: u32,
    /// Offset just past the last commit record.
    pub committed_end: u32,
}

/// Groups journal records into transactions. Data records accumulate until
/// their own commit record arrives, at which point the whole group is handed
/// back to be applied.
#[derive(Debug)]
pub struct Replayer {
    fs_start: u32,
    total_blocks: u32,
    pending: Vec<BlockWrite>,
    summary: ReplaySummary,
}

impl Replayer {
    pub fn new(sb: &Superblock) -> Self {
        Self {
            fs_start: sb.fs_start(),
            total_blocks: sb.total_blocks,
            pending: Vec::new(),
            summary: ReplaySummary {
                committed_end: HEADER_SIZE,
                ..ReplaySummary::default()
            },
        }
    }

    /// Feeds the record found at `offset`. Returns the finished transaction
    /// when `record` is a commit.
    pub fn feed(&mut self, offset: u32, record: Record) -> Result<Option<Vec<BlockWrite>>> {
        match record {
            Record::Data { block, payload } => {
                if block < self.fs_start || block >= self.total_blocks {
                    return Err(Error::InvalidTarget { offset, block });
                }
                self.pending.push((block, payload));

                Ok(None)
            }
            Record::Commit => {
                let writes = std::mem::take(&mut self.pending);
                self.summary.transactions += 1;
                self.summary.blocks += writes.len() as u32;
                self.summary.committed_end = offset + COMMIT_RECORD_SIZE;

                Ok(Some(writes))
            }
        }
    }

    /// Ends the scan, dropping any transaction that never saw its commit.
    pub fn finish(mut self) -> ReplaySummary {
        self.summary.discarded = self.pending.len() as u32;
        self.summary
    }
}

/// Applies every committed transaction in the journal to the filesystem
/// region, then empties the journal.
///
/// On a malformed record the journal is left as it is; transactions applied
/// before that point stay applied.
pub fn install<D: BlockDevice>(dev: &mut D, sb: &Superblock) -> Result<ReplaySummary> {
    let mut journal = Journal::load(&*dev, sb)?;
    if journal.is_empty() {
        info!("journal is empty");
        return Ok(ReplaySummary::default());
    }

    let mut replayer = Replayer::new(sb);
    let mut offset = HEADER_SIZE;
    while let Some((record, next)) = journal.read_record(&*dev, offset)? {
        if let Some(writes) = replayer.feed(offset, record)? {
            apply(dev, &writes)?;
            debug!(
                "applied transaction ending at offset {} ({} blocks)",
                offset,
                writes.len()
            );
        }
        offset = next;
    }

    let summary = replayer.finish();
    if summary.discarded > 0 {
        warn!(
            "discarding {} uncommitted record(s) after offset {}",
            summary.discarded, summary.committed_end
        );
    }

    journal.reset(dev)?;
    info!(
        "replayed {} transaction(s), {} block(s)",
        summary.transactions, summary.blocks
    );

    Ok(summary)
}

fn apply<D: BlockDevice>(dev: &mut D, writes: &[BlockWrite]) -> Result<()> {
    for (block, payload) in writes {
        dev.write_block(*block, payload)?;
        debug!("wrote block {}", block);
    }

    dev.sync()
}
