//! Log block framing and the appender that batches mutations into blocks.

use super::file::{LogFileHeader, LOG_FILE_HEADER_SIZE};

use crate::mutation::{Decree, MutationData};
use crate::utils::ReplogError;

use bytes::Bytes;

/// Magic number leading every block header.
pub const LOG_BLOCK_MAGIC: u32 = 0xdeadbeef;

/// Size of the fixed block header: magic, length, body CRC, local offset.
pub const LOG_BLOCK_HEADER_SIZE: usize = 16;

/// Default soft limit of a block's size; a new block is started once the
/// current one goes beyond this.
pub const DEFAULT_MAX_BLOCK_BYTES: usize = 1024 * 1024;

/// Fixed-size header prefixed to every physical block in a log file.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct LogBlockHeader {
    pub magic: u32,

    /// Body length in bytes, header excluded.
    pub length: u32,

    /// CRC32C of the body.
    pub body_crc: u32,

    /// Offset of the block's first byte relative to the file start.
    pub local_offset: u32,
}

impl LogBlockHeader {
    /// Header with only the magic set, as it sits in a block under
    /// construction.
    pub fn placeholder() -> Self {
        LogBlockHeader {
            magic: LOG_BLOCK_MAGIC,
            length: 0,
            body_crc: 0,
            local_offset: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; LOG_BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; LOG_BLOCK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.body_crc.to_le_bytes());
        buf[12..16].copy_from_slice(&self.local_offset.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; LOG_BLOCK_HEADER_SIZE]) -> Self {
        let field = |i: usize| {
            u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
        };
        LogBlockHeader {
            magic: field(0),
            length: field(4),
            body_crc: field(8),
            local_offset: field(12),
        }
    }
}

/// CRC32C over a sequence of blobs, as if they were one buffer.
pub(crate) fn blobs_crc<'a>(blobs: impl IntoIterator<Item = &'a Bytes>) -> u32 {
    blobs
        .into_iter()
        .fold(0, |crc, blob| crc32c::crc32c_append(crc, blob))
}

/// A physical log block under construction: an ordered list of blobs whose
/// first one is always the block header.
#[derive(Debug, Clone)]
pub struct LogBlock {
    /// Header blob followed by body blobs.
    data: Vec<Bytes>,

    /// Total bytes of all blobs, header included.
    size: usize,

    /// Global log offset of the block's first byte.
    start_offset: i64,
}

impl LogBlock {
    pub fn new(start_offset: i64) -> Self {
        LogBlock {
            data: vec![Bytes::copy_from_slice(
                &LogBlockHeader::placeholder().to_bytes(),
            )],
            size: LOG_BLOCK_HEADER_SIZE,
            start_offset,
        }
    }

    /// Appends a body blob.
    pub fn add(&mut self, blob: Bytes) {
        self.size += blob.len();
        self.data.push(blob);
    }

    #[inline]
    pub fn data(&self) -> &[Bytes] {
        &self.data
    }

    /// The header blob.
    #[inline]
    pub fn front(&self) -> &Bytes {
        &self.data[0]
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    #[inline]
    pub fn end_offset(&self) -> i64 {
        self.start_offset + self.size as i64
    }

    /// Fills in the header now that the body is final. `file_start_offset`
    /// is the global start offset of the file the block goes into.
    pub fn seal(
        &mut self,
        file_start_offset: i64,
    ) -> Result<LogBlockHeader, ReplogError> {
        let local_offset = u32::try_from(self.start_offset - file_start_offset)
            .map_err(|_| {
                ReplogError::msg(format!(
                    "block at {} does not fit in file starting at {}",
                    self.start_offset, file_start_offset
                ))
            })?;
        let length =
            u32::try_from(self.size - LOG_BLOCK_HEADER_SIZE).map_err(|_| {
                ReplogError::msg(format!("block body too large: {}", self.size))
            })?;

        let header = LogBlockHeader {
            magic: LOG_BLOCK_MAGIC,
            length,
            body_crc: blobs_crc(&self.data[1..]),
            local_offset,
        };
        self.data[0] = Bytes::copy_from_slice(&header.to_bytes());
        Ok(header)
    }
}

/// Batches serialized mutations into blocks, assigning each mutation its
/// global log offset.
#[derive(Debug, Clone)]
pub struct LogAppender {
    blocks: Vec<LogBlock>,

    /// Soft limit of each block's size.
    max_block_bytes: usize,

    /// Decrees appended, in order.
    decrees: Vec<Decree>,
}

impl LogAppender {
    pub fn new(start_offset: i64, max_block_bytes: usize) -> Self {
        LogAppender {
            blocks: vec![LogBlock::new(start_offset)],
            max_block_bytes,
            decrees: vec![],
        }
    }

    /// Appender whose first block opens a new log file, embedding the file
    /// header right after the block header.
    pub fn with_file_header(
        file_header: &LogFileHeader,
        max_block_bytes: usize,
    ) -> Self {
        let mut block = LogBlock::new(file_header.start_global_offset);
        let header_blob = Bytes::copy_from_slice(&file_header.to_bytes());
        debug_assert_eq!(header_blob.len(), LOG_FILE_HEADER_SIZE);
        block.add(header_blob);
        LogAppender {
            blocks: vec![block],
            max_block_bytes,
            decrees: vec![],
        }
    }

    /// Adds a mutation as two blobs (record length and body). Sets the
    /// mutation's `log_offset` to where its record will land.
    pub fn append_mutation(
        &mut self,
        data: &mut MutationData,
    ) -> Result<(), ReplogError> {
        let end = self.end_offset();
        if self.blocks.last().map_or(true, |b| b.size() > self.max_block_bytes)
        {
            self.blocks.push(LogBlock::new(end));
        }

        data.header.log_offset = end;
        let (len_blob, body_blob) = data.write_to()?;
        if let Some(block) = self.blocks.last_mut() {
            block.add(len_blob);
            block.add(body_blob);
        }
        self.decrees.push(data.header.decree);
        Ok(())
    }

    /// Number of blobs over all blocks, headers included.
    pub fn blob_count(&self) -> usize {
        self.blocks.iter().map(|b| b.data().len()).sum()
    }

    #[inline]
    pub fn all_blocks(&self) -> &[LogBlock] {
        &self.blocks
    }

    #[inline]
    pub fn decrees(&self) -> &[Decree] {
        &self.decrees
    }

    /// Total bytes over all blocks.
    pub fn size(&self) -> usize {
        self.blocks.iter().map(|b| b.size()).sum()
    }

    pub fn start_offset(&self) -> i64 {
        self.blocks.first().map_or(0, |b| b.start_offset())
    }

    pub fn end_offset(&self) -> i64 {
        self.blocks.last().map_or(0, |b| b.end_offset())
    }

    /// Seals every block against the given file start and hands them out
    /// together with the appended decrees.
    pub fn seal_all(
        mut self,
        file_start_offset: i64,
    ) -> Result<(Vec<LogBlock>, Vec<Decree>), ReplogError> {
        for block in self.blocks.iter_mut() {
            block.seal(file_start_offset)?;
        }
        Ok((self.blocks, self.decrees))
    }
}

#[cfg(test)]
mod block_tests {
    use super::*;
    use crate::mutation::{make_test_mutation, RECORD_HEADER_SIZE};

    #[test]
    fn header_bytes_layout() {
        let header = LogBlockHeader {
            magic: LOG_BLOCK_MAGIC,
            length: 0x0102,
            body_crc: 0xaabbccdd,
            local_offset: 7,
        };
        let buf = header.to_bytes();
        assert_eq!(&buf[0..4], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(&buf[4..8], &[0x02, 0x01, 0, 0]);
        assert_eq!(LogBlockHeader::from_bytes(&buf), header);
    }

    #[test]
    fn block_add_and_seal() -> Result<(), ReplogError> {
        let mut block = LogBlock::new(100);
        assert_eq!(block.size(), LOG_BLOCK_HEADER_SIZE);
        assert_eq!(block.data().len(), 1);

        block.add(Bytes::from_static(b"hello"));
        block.add(Bytes::from_static(b"world"));
        assert_eq!(block.size(), LOG_BLOCK_HEADER_SIZE + 10);

        let header = block.seal(60)?;
        assert_eq!(header.length, 10);
        assert_eq!(header.local_offset, 40);
        assert_eq!(header.body_crc, crc32c::crc32c(b"helloworld"));
        assert_eq!(block.front().as_ref(), &header.to_bytes()[..]);

        // block cannot start before its file
        assert!(LogBlock::new(10).seal(20).is_err());
        Ok(())
    }

    #[test]
    fn appender_one_block() -> Result<(), ReplogError> {
        let mut appender = LogAppender::new(0, DEFAULT_MAX_BLOCK_BYTES);
        let mut expect_offset = LOG_BLOCK_HEADER_SIZE as i64;
        for d in 1..=10 {
            let mut data = make_test_mutation(1, d, d - 1, "some payload");
            appender.append_mutation(&mut data)?;
            assert_eq!(data.header.log_offset, expect_offset);
            let (_, body) = data.write_to()?;
            expect_offset += (RECORD_HEADER_SIZE + body.len()) as i64;
        }
        assert_eq!(appender.all_blocks().len(), 1);
        assert_eq!(appender.blob_count(), 1 + 2 * 10);
        assert_eq!(appender.end_offset(), expect_offset);
        assert_eq!(appender.size() as i64, expect_offset);
        assert_eq!(appender.decrees(), &(1..=10).collect::<Vec<_>>()[..]);
        Ok(())
    }

    #[test]
    fn appender_new_block_when_full() -> Result<(), ReplogError> {
        let max_block_bytes = 256;
        let payload = "x".repeat(100);
        let mut appender = LogAppender::new(1000, max_block_bytes);
        for d in 1..=8 {
            let mut data = make_test_mutation(1, d, 0, &payload);
            appender.append_mutation(&mut data)?;
        }

        let blocks = appender.all_blocks();
        assert!(blocks.len() > 1);
        assert_eq!(blocks[0].start_offset(), 1000);
        for pair in blocks.windows(2) {
            // a block only closes after going over the limit
            assert!(pair[0].size() > max_block_bytes);
            assert_eq!(pair[0].end_offset(), pair[1].start_offset());
        }
        // header blob per block plus two blobs per mutation
        assert_eq!(appender.blob_count(), blocks.len() + 2 * 8);
        Ok(())
    }

    #[test]
    fn appender_with_file_header() -> Result<(), ReplogError> {
        let file_header = LogFileHeader::new(4096, 41);
        let mut appender =
            LogAppender::with_file_header(&file_header, DEFAULT_MAX_BLOCK_BYTES);
        let mut data = make_test_mutation(2, 42, 41, "v");
        appender.append_mutation(&mut data)?;
        assert_eq!(
            data.header.log_offset,
            4096 + (LOG_BLOCK_HEADER_SIZE + LOG_FILE_HEADER_SIZE) as i64
        );

        let (blocks, decrees) = appender.seal_all(4096)?;
        assert_eq!(decrees, vec![42]);
        let mut raw = [0u8; LOG_BLOCK_HEADER_SIZE];
        raw.copy_from_slice(blocks[0].front());
        let header = LogBlockHeader::from_bytes(&raw);
        assert_eq!(header.local_offset, 0);
        assert_eq!(header.body_crc, blobs_crc(&blocks[0].data()[1..]));
        Ok(())
    }
}
