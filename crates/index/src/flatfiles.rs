//! Flat block files and positions inside them.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// A length-prefixed record inside the numbered block files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub const LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        Some(Self {
            file_id: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            offset: u64::from_le_bytes(bytes[4..12].try_into().ok()?),
            len: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
        })
    }
}

/// Position of one transaction inside a stored block.
///
/// `tx_offset` counts from the end of the block header, so for the first
/// transaction it equals the CompactSize width of the transaction count.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskTxPos {
    pub block: FileLocation,
    pub tx_offset: u32,
}

impl DiskTxPos {
    pub const LEN: usize = FileLocation::LEN + 4;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..FileLocation::LEN].copy_from_slice(&self.block.encode());
        out[FileLocation::LEN..].copy_from_slice(&self.tx_offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        Some(Self {
            block: FileLocation::decode(&bytes[..FileLocation::LEN])?,
            tx_offset: u32::from_le_bytes(bytes[FileLocation::LEN..].try_into().ok()?),
        })
    }
}

#[derive(Debug)]
pub enum BlockFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch,
}

impl std::fmt::Display for BlockFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockFileError::Io(err) => write!(f, "{err}"),
            BlockFileError::InvalidLocation => write!(f, "invalid block file location"),
            BlockFileError::LengthMismatch => write!(f, "block file length mismatch"),
        }
    }
}

impl std::error::Error for BlockFileError {}

impl From<std::io::Error> for BlockFileError {
    fn from(err: std::io::Error) -> Self {
        BlockFileError::Io(err)
    }
}

/// What the lookup engine needs from the block storage layer.
pub trait BlockStore: Send + Sync {
    fn read_block(&self, location: FileLocation) -> Result<Vec<u8>, BlockFileError>;
}

/// Append-only `blk*.dat` files with size-based rotation. Records carry
/// their length so a stale location cannot read garbage silently.
pub struct BlockFileStore {
    dir: PathBuf,
    max_file_size: u64,
    tail: Mutex<Tail>,
}

#[derive(Debug)]
struct Tail {
    file_id: u32,
    len: u64,
}

impl BlockFileStore {
    pub fn open(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, BlockFileError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut tail = Tail { file_id: 0, len: 0 };
        loop {
            let path = block_file_path(&dir, tail.file_id);
            if !path.exists() {
                break;
            }
            tail.len = std::fs::metadata(&path)?.len();
            if tail.len >= max_file_size {
                tail.file_id += 1;
                tail.len = 0;
                continue;
            }
            let next = block_file_path(&dir, tail.file_id + 1);
            if !next.exists() {
                break;
            }
            tail.file_id += 1;
        }

        Ok(Self {
            dir,
            max_file_size,
            tail: Mutex::new(tail),
        })
    }

    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, BlockFileError> {
        let mut tail = self.tail.lock().expect("block file lock");
        let record_len = 4u64 + bytes.len() as u64;
        if tail.len + record_len > self.max_file_size && tail.len > 0 {
            tail.file_id += 1;
            tail.len = 0;
        }
        let location = FileLocation {
            file_id: tail.file_id,
            offset: tail.len,
            len: bytes.len() as u32,
        };
        let path = block_file_path(&self.dir, tail.file_id);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&location.len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        tail.len += record_len;
        Ok(location)
    }
}

impl BlockStore for BlockFileStore {
    fn read_block(&self, location: FileLocation) -> Result<Vec<u8>, BlockFileError> {
        if location.len == 0 {
            return Err(BlockFileError::InvalidLocation);
        }
        let mut file = File::open(block_file_path(&self.dir, location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        if u32::from_le_bytes(len_bytes) != location.len {
            return Err(BlockFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; location.len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

fn block_file_path(dir: &std::path::Path, file_id: u32) -> PathBuf {
    dir.join(format!("blk{file_id:05}.dat"))
}
