use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of failure, used by the command boundary to report errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Validation,
    Capacity,
    Corruption,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("block {index} is outside the image ({count} blocks)")]
    BlockOutOfRange { index: u32, count: u32 },
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("journal not initialized or corrupted: {0}")]
    InvalidJournal(String),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("{0:?} already exists in the root directory")]
    AlreadyExists(String),
    #[error("journal full: {needed} bytes needed, {available} available")]
    JournalFull { needed: u32, available: u32 },
    #[error("no free inode")]
    NoFreeInode,
    #[error("root directory is full ({entries} entries)")]
    DirectoryFull { entries: u32 },
    #[error("unknown journal record type {kind:#06x} at offset {offset}")]
    UnknownRecord { offset: u32, kind: u16 },
    #[error("malformed journal record at offset {offset}: {reason}")]
    CorruptRecord { offset: u32, reason: String },
    #[error("journal record at offset {offset} targets block {block} outside the filesystem region")]
    InvalidTarget { offset: u32, block: u32 },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::BlockOutOfRange { .. } => ErrorKind::Io,
            Error::InvalidImage(_)
            | Error::InvalidJournal(_)
            | Error::Encoding(_)
            | Error::InvalidName(_)
            | Error::AlreadyExists(_) => ErrorKind::Validation,
            Error::JournalFull { .. } | Error::NoFreeInode | Error::DirectoryFull { .. } => {
                ErrorKind::Capacity
            }
            Error::UnknownRecord { .. }
            | Error::CorruptRecord { .. }
            | Error::InvalidTarget { .. } => ErrorKind::Corruption,
        }
    }

    /// Process exit status for a command that failed with this error. Every
    /// kind currently maps to 1; `kind()` is what tells them apart.
    pub fn exit_code(&self) -> i32 {
        1
    }
}
