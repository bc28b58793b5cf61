//! A single on-disk mutation log file and its block reader.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use super::block::{LogBlockHeader, LOG_BLOCK_HEADER_SIZE, LOG_BLOCK_MAGIC};

use crate::mutation::Decree;
use crate::utils::ReplogError;

use bytes::Bytes;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader};

/// Magic number leading the file header.
pub const LOG_FILE_MAGIC: u32 = 0xdeadbeef;

/// Current file format version.
pub const LOG_FILE_VERSION: u32 = 1;

/// Size of the file header embedded in a file's first block.
pub const LOG_FILE_HEADER_SIZE: usize = 24;

/// Per-file header, embedded in the first block right after its block
/// header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct LogFileHeader {
    pub magic: u32,
    pub version: u32,

    /// Global offset of the file's first byte.
    pub start_global_offset: i64,

    /// Largest decree written into all previous files.
    pub previous_max_decree: Decree,
}

impl LogFileHeader {
    pub fn new(start_global_offset: i64, previous_max_decree: Decree) -> Self {
        LogFileHeader {
            magic: LOG_FILE_MAGIC,
            version: LOG_FILE_VERSION,
            start_global_offset,
            previous_max_decree,
        }
    }

    pub fn to_bytes(&self) -> [u8; LOG_FILE_HEADER_SIZE] {
        let mut buf = [0u8; LOG_FILE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.start_global_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.previous_max_decree.to_le_bytes());
        buf
    }

    /// Parses and validates a header from the front of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ReplogError> {
        if buf.len() < LOG_FILE_HEADER_SIZE {
            return Err(ReplogError::msg(format!(
                "file header needs {} bytes, got {}",
                LOG_FILE_HEADER_SIZE,
                buf.len()
            )));
        }
        let mut u32_bytes = [0u8; 4];
        let mut i64_bytes = [0u8; 8];

        u32_bytes.copy_from_slice(&buf[0..4]);
        let magic = u32::from_le_bytes(u32_bytes);
        u32_bytes.copy_from_slice(&buf[4..8]);
        let version = u32::from_le_bytes(u32_bytes);
        i64_bytes.copy_from_slice(&buf[8..16]);
        let start_global_offset = i64::from_le_bytes(i64_bytes);
        i64_bytes.copy_from_slice(&buf[16..24]);
        let previous_max_decree = i64::from_le_bytes(i64_bytes);

        if magic != LOG_FILE_MAGIC {
            return Err(ReplogError::msg(format!(
                "file header magic mismatch: {:#x}",
                magic
            )));
        }
        if version != LOG_FILE_VERSION {
            return Err(ReplogError::msg(format!(
                "unsupported log file version {}",
                version
            )));
        }
        Ok(LogFileHeader {
            magic,
            version,
            start_global_offset,
            previous_max_decree,
        })
    }
}

/// Outcome of reading one block.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockRead {
    /// A whole block that passed the magic, offset and CRC checks.
    Block { header: LogBlockHeader, body: Bytes },

    /// Clean end of file on a block boundary.
    Eof,

    /// Truncated block, bad magic or checksum failure; data is valid up to
    /// its start. Only a torn tail of the last file is recoverable, so
    /// replay treats this as fatal (`InvalidData`) in any earlier file,
    /// where every block must be whole.
    Corrupted(String),

    /// Block whose recorded position disagrees with where it was read.
    Invalid(String),
}

/// Reads until `buf` is full or EOF. Returns the number of bytes read.
async fn read_up_to<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, ReplogError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// One `log.{index}.{start_offset}` file opened for reading.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    index: u32,

    /// Global offset of the first byte of this file.
    start_offset: i64,

    /// Global offset right after the last byte of this file.
    end_offset: i64,

    /// File header, once it has been read by replay.
    header: Option<LogFileHeader>,

    reader: BufReader<File>,

    /// Global offset of the reader cursor.
    read_offset: i64,
}

impl LogFile {
    /// File name for the given index and global start offset.
    pub fn file_name(index: u32, start_offset: i64) -> String {
        format!("log.{}.{}", index, start_offset)
    }

    /// Parses a `log.{index}.{start_offset}` file name.
    pub fn parse_file_name(name: &str) -> Option<(u32, i64)> {
        let mut parts = name.split('.');
        if parts.next() != Some("log") {
            return None;
        }
        let index = parts.next()?.parse().ok()?;
        let start_offset: i64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || start_offset < 0 {
            return None;
        }
        Some((index, start_offset))
    }

    /// Opens an existing log file for reading, cursor at its start.
    pub async fn open_read(path: &Path) -> Result<Self, ReplogError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let (index, start_offset) =
            Self::parse_file_name(name).ok_or_else(|| {
                ReplogError::msg(format!(
                    "invalid log file name '{}'",
                    path.display()
                ))
            })?;

        let file = OpenOptions::new().read(true).open(path).await?;
        let file_size = file.metadata().await?.len() as i64;

        Ok(LogFile {
            path: path.to_path_buf(),
            index,
            start_offset,
            end_offset: start_offset + file_size,
            header: None,
            reader: BufReader::new(file),
            read_offset: start_offset,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    #[inline]
    pub fn end_offset(&self) -> i64 {
        self.end_offset
    }

    #[inline]
    pub fn header(&self) -> Option<&LogFileHeader> {
        self.header.as_ref()
    }

    pub(crate) fn set_header(&mut self, header: LogFileHeader) {
        self.header = Some(header);
    }

    /// Repositions the reader at the given global offset.
    pub async fn reset_stream(&mut self, offset: i64) -> Result<(), ReplogError> {
        if offset < self.start_offset || offset > self.end_offset {
            return Err(ReplogError::msg(format!(
                "reset offset {} outside file range [{}, {}]",
                offset, self.start_offset, self.end_offset
            )));
        }
        self.reader
            .seek(SeekFrom::Start((offset - self.start_offset) as u64))
            .await?;
        self.read_offset = offset;
        Ok(())
    }

    /// Reads the block at the cursor. Only I/O failures are `Err`.
    pub async fn read_next_log_block(
        &mut self,
    ) -> Result<BlockRead, ReplogError> {
        let block_offset = self.read_offset;

        let mut header_buf = [0u8; LOG_BLOCK_HEADER_SIZE];
        let n = read_up_to(&mut self.reader, &mut header_buf).await?;
        if n == 0 {
            return Ok(BlockRead::Eof);
        }
        if n < LOG_BLOCK_HEADER_SIZE {
            return Ok(BlockRead::Corrupted(format!(
                "truncated block header at {}: {} bytes",
                block_offset, n
            )));
        }

        let header = LogBlockHeader::from_bytes(&header_buf);
        if header.magic != LOG_BLOCK_MAGIC {
            return Ok(BlockRead::Corrupted(format!(
                "block magic mismatch at {}: {:#x}",
                block_offset, header.magic
            )));
        }
        if header.local_offset as i64 != block_offset - self.start_offset {
            return Ok(BlockRead::Invalid(format!(
                "block at {} records local_offset {}, expected {}",
                block_offset,
                header.local_offset,
                block_offset - self.start_offset
            )));
        }

        let body_end =
            block_offset + (LOG_BLOCK_HEADER_SIZE as i64) + header.length as i64;
        if body_end > self.end_offset {
            return Ok(BlockRead::Corrupted(format!(
                "truncated block at {}: body ends at {} beyond file end {}",
                block_offset, body_end, self.end_offset
            )));
        }

        let mut body = vec![0u8; header.length as usize];
        let n = read_up_to(&mut self.reader, &mut body).await?;
        if n < body.len() {
            return Ok(BlockRead::Corrupted(format!(
                "truncated block body at {}: {} of {} bytes",
                block_offset,
                n,
                body.len()
            )));
        }
        let crc = crc32c::crc32c(&body);
        if crc != header.body_crc {
            return Ok(BlockRead::Corrupted(format!(
                "block crc mismatch at {}: {:#x} != {:#x}",
                block_offset, crc, header.body_crc
            )));
        }

        self.read_offset = body_end;
        Ok(BlockRead::Block {
            header,
            body: Bytes::from(body),
        })
    }

    /// Cuts the file at the given global offset, dropping a damaged tail.
    pub async fn truncate_at(&mut self, offset: i64) -> Result<(), ReplogError> {
        if offset < self.start_offset || offset > self.end_offset {
            return Err(ReplogError::msg(format!(
                "truncate offset {} outside file range [{}, {}]",
                offset, self.start_offset, self.end_offset
            )));
        }
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len((offset - self.start_offset) as u64).await?;
        file.sync_all().await?;
        self.end_offset = offset;
        if self.read_offset > offset {
            self.reset_stream(offset).await?;
        }
        Ok(())
    }
}
