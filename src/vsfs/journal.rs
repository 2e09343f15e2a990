//! Append-only redo log kept in the journal region.
//!
//! The region starts with an 8 byte header (magic, bytes used) followed by
//! back-to-back records. Only bytes below `bytes_used` are ever interpreted,
//! and `bytes_used` is advanced only after the record it covers is durable.

use super::{
    device::BlockDevice, types::Superblock, zeroed_block, Block, Error, Result, BLOCK_SIZE,
    JOURNAL_MAGIC,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};

pub const HEADER_SIZE: u32 = 8;
pub const RECORD_HEADER_SIZE: u32 = 4;
pub const DATA_RECORD_SIZE: u32 = RECORD_HEADER_SIZE + 4 + BLOCK_SIZE as u32;
pub const COMMIT_RECORD_SIZE: u32 = RECORD_HEADER_SIZE;

const REC_DATA: u16 = 0xD0DA;
const REC_COMMIT: u16 = 0xC0DE;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
struct JournalHeader {
    magic: u32,
    bytes_used: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct RecordHeader {
    kind: u16,
    size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Full after-image of `block`.
    Data { block: u32, payload: Box<Block> },
    /// Closes the transaction made of the data records before it.
    Commit,
}

impl Record {
    pub fn encoded_len(&self) -> u32 {
        match self {
            Record::Data { .. } => DATA_RECORD_SIZE,
            Record::Commit => COMMIT_RECORD_SIZE,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        match self {
            Record::Data { block, payload } => {
                let header = RecordHeader {
                    kind: REC_DATA,
                    size: DATA_RECORD_SIZE as u16,
                };
                bincode::serialize_into(&mut buf, &header)?;
                bincode::serialize_into(&mut buf, block)?;
                buf.extend_from_slice(&payload[..]);
            }
            Record::Commit => {
                let header = RecordHeader {
                    kind: REC_COMMIT,
                    size: COMMIT_RECORD_SIZE as u16,
                };
                bincode::serialize_into(&mut buf, &header)?;
            }
        }

        Ok(buf)
    }
}

#[derive(Debug, Clone)]
pub struct Journal {
    start: u32,
    blocks: u32,
    header: JournalHeader,
}

impl Journal {
    /// Opens an existing journal. Fails if the header was never written or is
    /// damaged.
    pub fn load<D: BlockDevice>(dev: &D, sb: &Superblock) -> Result<Self> {
        let journal = Self::read(dev, sb)?;
        if journal.header.magic != JOURNAL_MAGIC {
            return Err(Error::InvalidJournal(format!(
                "bad magic {:#010x}",
                journal.header.magic
            )));
        }
        journal.check_bounds()?;

        Ok(journal)
    }

    /// Opens the journal, writing an empty header first if none is present.
    pub fn ensure_initialized<D: BlockDevice>(dev: &mut D, sb: &Superblock) -> Result<Self> {
        let mut journal = Self::read(&*dev, sb)?;
        if journal.header.magic == JOURNAL_MAGIC {
            journal.check_bounds()?;
            return Ok(journal);
        }

        info!(
            "initializing journal at block {} ({} blocks)",
            journal.start, journal.blocks
        );
        journal.persist(
            dev,
            JournalHeader {
                magic: JOURNAL_MAGIC,
                bytes_used: HEADER_SIZE,
            },
        )?;

        Ok(journal)
    }

    fn read<D: BlockDevice>(dev: &D, sb: &Superblock) -> Result<Self> {
        let start = sb.journal_block;
        let block = dev.read_block(start)?;
        let header = bincode::deserialize(&block[..HEADER_SIZE as usize])?;

        Ok(Self {
            start,
            blocks: sb.journal_blocks(),
            header,
        })
    }

    fn check_bounds(&self) -> Result<()> {
        let used = self.header.bytes_used;
        if used < HEADER_SIZE || used > self.capacity() {
            return Err(Error::InvalidJournal(format!(
                "{} bytes used in a {} byte journal",
                used,
                self.capacity()
            )));
        }

        Ok(())
    }

    pub fn capacity(&self) -> u32 {
        self.blocks * BLOCK_SIZE as u32
    }

    pub fn bytes_used(&self) -> u32 {
        self.header.bytes_used
    }

    pub fn available(&self) -> u32 {
        self.capacity() - self.bytes_used()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_used() == HEADER_SIZE
    }

    pub fn append<D: BlockDevice>(&mut self, dev: &mut D, record: &Record) -> Result<()> {
        self.reserve(record.encoded_len())?;
        let bytes = record.encode()?;
        self.write_record(dev, &bytes)
    }

    /// Appends `records` in order, or nothing at all if they do not all fit.
    pub fn append_all<D: BlockDevice>(&mut self, dev: &mut D, records: &[Record]) -> Result<()> {
        let needed: u32 = records.iter().map(Record::encoded_len).sum();
        self.reserve(needed)?;

        for record in records {
            self.append(dev, record)?;
        }

        Ok(())
    }

    /// Drops every record at or past `offset`. The next append overwrites them.
    pub fn truncate_to<D: BlockDevice>(&mut self, dev: &mut D, offset: u32) -> Result<()> {
        let used = self.bytes_used();
        if offset < HEADER_SIZE || offset > used {
            return Err(Error::InvalidJournal(format!(
                "cannot truncate {} used bytes to {}",
                used, offset
            )));
        }
        if offset == used {
            return Ok(());
        }

        self.persist(
            dev,
            JournalHeader {
                bytes_used: offset,
                ..self.header
            },
        )?;
        debug!("dropped {} bytes past offset {}", used - offset, offset);

        Ok(())
    }

    /// Forgets every record. Old bytes stay on disk but fall past `bytes_used`.
    pub fn reset<D: BlockDevice>(&mut self, dev: &mut D) -> Result<()> {
        self.truncate_to(dev, HEADER_SIZE)?;
        debug!("journal reset");

        Ok(())
    }

    pub fn scan<'a, D: BlockDevice>(&'a self, dev: &'a D) -> Scan<'a, D> {
        Scan {
            journal: self,
            dev,
            offset: HEADER_SIZE,
            done: false,
        }
    }

    /// Decodes the record at `offset`, returning it with the offset of the next
    /// one, or `None` once `offset` reaches `bytes_used`.
    pub fn read_record<D: BlockDevice>(
        &self,
        dev: &D,
        offset: u32,
    ) -> Result<Option<(Record, u32)>> {
        let end = self.bytes_used();
        if offset >= end {
            return Ok(None);
        }
        if offset + RECORD_HEADER_SIZE > end {
            return Err(corrupt(offset, "truncated record header"));
        }

        let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
        self.read_at(dev, offset, &mut buf)?;
        let header: RecordHeader = bincode::deserialize(&buf)?;

        let expected = match header.kind {
            REC_DATA => DATA_RECORD_SIZE,
            REC_COMMIT => COMMIT_RECORD_SIZE,
            kind => return Err(Error::UnknownRecord { offset, kind }),
        };
        if header.size as u32 != expected {
            return Err(corrupt(
                offset,
                format!("size {} does not match type {:#06x}", header.size, header.kind),
            ));
        }
        if offset + expected > end {
            return Err(corrupt(offset, "record runs past the end of the journal"));
        }

        let record = match header.kind {
            REC_DATA => {
                let mut buf = vec![0u8; (DATA_RECORD_SIZE - RECORD_HEADER_SIZE) as usize];
                self.read_at(dev, offset + RECORD_HEADER_SIZE, &mut buf)?;
                let block = bincode::deserialize(&buf[..4])?;
                let mut payload = zeroed_block();
                payload.copy_from_slice(&buf[4..]);

                Record::Data { block, payload }
            }
            _ => Record::Commit,
        };

        Ok(Some((record, offset + expected)))
    }

    fn reserve(&self, needed: u32) -> Result<()> {
        if needed > self.available() {
            return Err(Error::JournalFull {
                needed,
                available: self.available(),
            });
        }

        Ok(())
    }

    fn write_record<D: BlockDevice>(&mut self, dev: &mut D, bytes: &[u8]) -> Result<()> {
        let offset = self.bytes_used();
        self.write_at(dev, offset, bytes)?;
        // The record must be durable before the header points past it.
        dev.sync()?;
        self.persist(
            dev,
            JournalHeader {
                bytes_used: offset + bytes.len() as u32,
                ..self.header
            },
        )?;
        debug!("appended {} byte record at offset {}", bytes.len(), offset);

        Ok(())
    }

    fn persist<D: BlockDevice>(&mut self, dev: &mut D, header: JournalHeader) -> Result<()> {
        let mut block = dev.read_block(self.start)?;
        bincode::serialize_into(&mut block[..HEADER_SIZE as usize], &header)?;
        dev.write_block(self.start, &block)?;
        dev.sync()?;
        self.header = header;

        Ok(())
    }

    fn read_at<D: BlockDevice>(&self, dev: &D, offset: u32, buf: &mut [u8]) -> Result<()> {
        let mut pos = offset as usize;
        let mut done = 0;
        while done < buf.len() {
            let index = self.start + (pos / BLOCK_SIZE) as u32;
            let within = pos % BLOCK_SIZE;
            let len = (buf.len() - done).min(BLOCK_SIZE - within);
            let block = dev.read_block(index)?;
            buf[done..done + len].copy_from_slice(&block[within..within + len]);
            pos += len;
            done += len;
        }

        Ok(())
    }

    fn write_at<D: BlockDevice>(&self, dev: &mut D, offset: u32, bytes: &[u8]) -> Result<()> {
        let mut pos = offset as usize;
        let mut rest = bytes;
        while !rest.is_empty() {
            let index = self.start + (pos / BLOCK_SIZE) as u32;
            let within = pos % BLOCK_SIZE;
            let len = rest.len().min(BLOCK_SIZE - within);
            let mut block = dev.read_block(index)?;
            block[within..within + len].copy_from_slice(&rest[..len]);
            dev.write_block(index, &block)?;
            pos += len;
            rest = &rest[len..];
        }

        Ok(())
    }
}

fn corrupt<S: Into<String>>(offset: u32, reason: S) -> Error {
    Error::CorruptRecord {
        offset,
        reason: reason.into(),
    }
}

/// Records between the header and `bytes_used`, each with its offset. Stops
/// after the first error.
pub struct Scan<'a, D> {
    journal: &'a Journal,
    dev: &'a D,
    offset: u32,
    done: bool,
}

impl<'a, D: BlockDevice> Iterator for Scan<'a, D> {
    type Item = Result<(u32, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.journal.read_record(self.dev, self.offset) {
            Ok(Some((record, next))) => {
                let offset = self.offset;
                self.offset = next;
                Some(Ok((offset, record)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
