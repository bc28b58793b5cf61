//! Mutation log: an ordered set of append-only `log.{index}.{start_offset}`
//! files. Appends are batched into blocks on the caller's side and written
//! by a dedicated logger task; results come back through an ack channel.

mod block;
mod file;
mod replay;
mod utils;

pub use block::{
    LogAppender, LogBlock, LogBlockHeader, DEFAULT_MAX_BLOCK_BYTES,
    LOG_BLOCK_HEADER_SIZE, LOG_BLOCK_MAGIC,
};
pub use file::{BlockRead, LogFile, LogFileHeader, LOG_FILE_HEADER_SIZE};
pub use replay::{replay, replay_from, ReplayEnd};
pub use utils::{check_log_files_continuity, list_log_files};

use std::cmp;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::mutation::{Decree, MutationData, MutationPtr};
use crate::utils::{ErrorCode, ReplogError};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Log action ID type.
pub type LogActionId = u64;

/// Tunables of a mutation log.
#[derive(Debug, Clone)]
pub struct MutationLogOptions {
    /// Soft limit of a block's size.
    pub max_block_bytes: usize,

    /// A new file is started once the current one reaches this size.
    pub max_log_file_bytes: u64,

    /// Whether to `fdatasync()` after every write.
    pub sync: bool,
}

impl Default for MutationLogOptions {
    fn default() -> Self {
        MutationLogOptions {
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
            max_log_file_bytes: 32 * 1024 * 1024,
            sync: false,
        }
    }
}

/// A batch of sealed blocks handed to the logger.
#[derive(Debug)]
struct LogWrite {
    /// Create this file and switch to it before writing.
    new_file: Option<PathBuf>,

    blocks: Vec<LogBlock>,
    decrees: Vec<Decree>,
}

/// Write result returned by the logger.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LogResult {
    /// All blocks of the batch are written; `end_offset` is the global
    /// offset right after them.
    Written {
        decrees: Vec<Decree>,
        end_offset: i64,
    },

    /// The batch could not be written. The current file is unusable from
    /// here on.
    Failed { decrees: Vec<Decree>, reason: String },
}

/// Bookkeeping of one file in the set.
#[derive(Debug, Clone)]
struct LogFileMeta {
    path: PathBuf,
    start_offset: i64,

    /// Largest decree in all files before this one.
    previous_max_decree: Decree,

    /// Largest decree in this file and all files before it.
    max_decree: Decree,
}

/// Durable mutation log of one replica.
pub struct MutationLog {
    /// Log prefix.
    name: String,

    dir: PathBuf,
    options: MutationLogOptions,

    /// All files on disk (and the one about to be created), by index.
    files: BTreeMap<u32, LogFileMeta>,

    /// Index of the file currently written to; `None` right after open, so
    /// that writing resumes in a fresh file.
    writing: Option<u32>,

    /// Global offset the next append goes to.
    end_offset: i64,

    /// Global offset up to which the logger has acknowledged writes.
    durable_offset: i64,

    /// Largest decree appended so far.
    max_decree: Decree,

    /// Appends not yet flushed.
    pending: Option<LogAppender>,

    /// File to create on the next flush.
    pending_new_file: Option<PathBuf>,

    /// Sender side of the log channel.
    tx_log: mpsc::UnboundedSender<(LogActionId, LogWrite)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(LogActionId, LogResult)>,

    /// Join handle of the logger task.
    _logger_handle: JoinHandle<()>,
}

// MutationLog public API implementation
impl MutationLog {
    /// Opens the log under `dir`, replaying every existing file in order
    /// through `replay_callback(record_length, mutation)`, then spawns the
    /// logger task. Corruption in the last file truncates it at the last
    /// good block; corruption anywhere else is an error.
    pub async fn open<F>(
        name: impl ToString,
        dir: &Path,
        options: MutationLogOptions,
        mut replay_callback: F,
    ) -> Result<Self, ReplogError>
    where
        F: FnMut(usize, MutationPtr) -> Result<(), ReplogError>,
    {
        let name = name.to_string();
        if options.max_block_bytes == 0 {
            return logged_err!(
                name;
                "invalid max_block_bytes {}",
                options.max_block_bytes
            );
        }
        if options.max_log_file_bytes == 0 {
            return logged_err!(
                name;
                "invalid max_log_file_bytes {}",
                options.max_log_file_bytes
            );
        }

        fs::create_dir_all(dir).await?;
        let mut logs = vec![];
        for (_, _, path) in list_log_files(dir).await? {
            logs.push(LogFile::open_read(&path).await?);
        }
        if let Err(e) = check_log_files_continuity(&logs) {
            return logged_err!(name; "log files not continuous: {}", e);
        }

        let num_logs = logs.len();
        let mut files = BTreeMap::new();
        let mut end_offset = logs.first().map_or(0, |l| l.start_offset());
        let mut max_decree: Decree = 0;

        for (i, mut log) in logs.into_iter().enumerate() {
            let mut file_max = max_decree;
            let end = replay(&mut log, |len, mu| {
                file_max = cmp::max(file_max, mu.decree());
                replay_callback(len, mu)
            })
            .await?;

            match end.code {
                ErrorCode::HandleEof => {}
                ErrorCode::IncompleteData if i + 1 == num_logs => {
                    pf_warn!(
                        name;
                        "truncating damaged tail of '{}' at {} (was {})",
                        log.path().display(), end.end_offset, log.end_offset()
                    );
                    log.truncate_at(end.end_offset).await?;
                }
                code => {
                    return logged_err!(
                        name;
                        "replay of '{}' failed with {} at offset {}",
                        log.path().display(), code, end.end_offset
                    );
                }
            }

            let previous_max_decree =
                log.header().map_or(max_decree, |h| h.previous_max_decree);
            max_decree = file_max;
            end_offset = end.end_offset;
            files.insert(
                log.index(),
                LogFileMeta {
                    path: log.path().to_path_buf(),
                    start_offset: log.start_offset(),
                    previous_max_decree,
                    max_decree: file_max,
                },
            );
        }
        pf_info!(
            name;
            "opened mutation log '{}': {} files, end_offset {}, max_decree {}",
            dir.display(), files.len(), end_offset, max_decree
        );

        let (tx_log, rx_log) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();
        let logger_handle = tokio::spawn(Self::logger_thread(
            name.clone(),
            options.sync,
            rx_log,
            tx_ack,
        ));

        Ok(MutationLog {
            name,
            dir: dir.to_path_buf(),
            options,
            files,
            writing: None,
            end_offset,
            durable_offset: end_offset,
            max_decree,
            pending: None,
            pending_new_file: None,
            tx_log,
            rx_ack,
            _logger_handle: logger_handle,
        })
    }

    /// Adds a mutation to the pending batch, assigning its `log_offset`.
    /// Nothing is written until [`flush`](Self::flush).
    pub fn append(
        &mut self,
        data: &mut MutationData,
    ) -> Result<i64, ReplogError> {
        let mut appender = match self.pending.take() {
            Some(appender) => appender,
            None => self.new_appender(),
        };
        let res = appender.append_mutation(data);
        self.end_offset = appender.end_offset();
        self.pending = Some(appender);
        res?;

        self.max_decree = cmp::max(self.max_decree, data.header.decree);
        if let Some(meta) =
            self.writing.and_then(|index| self.files.get_mut(&index))
        {
            meta.max_decree = self.max_decree;
        }
        Ok(data.header.log_offset)
    }

    /// Hands the pending batch to the logger under the given action ID.
    /// Returns false if there was nothing to flush.
    pub fn flush(&mut self, id: LogActionId) -> Result<bool, ReplogError> {
        let appender = match self.pending.take() {
            Some(appender) if !appender.decrees().is_empty() => appender,
            other => {
                self.pending = other;
                return Ok(false);
            }
        };

        let file_start = match self.writing.and_then(|i| self.files.get(&i)) {
            Some(meta) => meta.start_offset,
            None => {
                return logged_err!(self.name; "no log file to flush into");
            }
        };
        let (blocks, decrees) = appender.seal_all(file_start)?;
        pf_trace!(
            self.name;
            "flush {} blocks with {} mutations up to {}",
            blocks.len(), decrees.len(), self.end_offset
        );

        self.tx_log.send((
            id,
            LogWrite {
                new_file: self.pending_new_file.take(),
                blocks,
                decrees,
            },
        ))?;
        Ok(true)
    }

    /// Waits for the next write result from the logger.
    pub async fn get_result(
        &mut self,
    ) -> Result<(LogActionId, LogResult), ReplogError> {
        match self.rx_ack.recv().await {
            Some((id, result)) => {
                if let LogResult::Written { end_offset, .. } = result {
                    self.durable_offset =
                        cmp::max(self.durable_offset, end_offset);
                }
                Ok((id, result))
            }
            None => logged_err!(self.name; "ack channel has been closed"),
        }
    }

    /// Deletes the oldest files whose decrees are all covered by
    /// `durable_decree`. The newest file is never deleted. Returns the number
    /// of files removed.
    pub async fn garbage_collect(
        &mut self,
        durable_decree: Decree,
    ) -> Result<usize, ReplogError> {
        let mut removed = 0;
        loop {
            let mut iter = self.files.iter();
            let (index, path) = match (iter.next(), iter.next()) {
                (Some((&index, first)), Some((_, next)))
                    if next.previous_max_decree <= durable_decree
                        && next.start_offset <= self.durable_offset =>
                {
                    (index, first.path.clone())
                }
                _ => break,
            };

            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.files.remove(&index);
            removed += 1;
            pf_debug!(
                self.name;
                "removed log file '{}' covered by durable decree {}",
                path.display(), durable_decree
            );
        }
        Ok(removed)
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[inline]
    pub fn end_offset(&self) -> i64 {
        self.end_offset
    }

    #[inline]
    pub fn durable_offset(&self) -> i64 {
        self.durable_offset
    }

    #[inline]
    pub fn max_decree(&self) -> Decree {
        self.max_decree
    }

    #[inline]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Largest decree written before the file of the given index.
    pub fn previous_max_decree(&self, index: u32) -> Option<Decree> {
        self.files.get(&index).map(|meta| meta.previous_max_decree)
    }

    /// Indices of all files currently in the set.
    pub fn file_indices(&self) -> Vec<u32> {
        self.files.keys().copied().collect()
    }
}

// MutationLog file rotation and logger task implementation
impl MutationLog {
    /// Starts a new batch, opening a new file first if none is being written
    /// or the current one is full.
    fn new_appender(&mut self) -> LogAppender {
        let current_full = match self.writing.and_then(|i| self.files.get(&i))
        {
            Some(meta) => {
                (self.end_offset - meta.start_offset) as u64
                    >= self.options.max_log_file_bytes
            }
            None => true,
        };
        if !current_full {
            return LogAppender::new(
                self.end_offset,
                self.options.max_block_bytes,
            );
        }

        let index = self.files.keys().next_back().map_or(1, |i| i + 1);
        let path = self.dir.join(LogFile::file_name(index, self.end_offset));
        pf_debug!(
            self.name;
            "starting log file '{}' after max_decree {}",
            path.display(), self.max_decree
        );
        self.files.insert(
            index,
            LogFileMeta {
                path: path.clone(),
                start_offset: self.end_offset,
                previous_max_decree: self.max_decree,
                max_decree: self.max_decree,
            },
        );
        self.writing = Some(index);
        self.pending_new_file = Some(path);

        let header = LogFileHeader::new(self.end_offset, self.max_decree);
        LogAppender::with_file_header(&header, self.options.max_block_bytes)
    }

    /// Writes one batch, switching files first if asked to. Returns the
    /// global offset after the batch.
    async fn write_batch(
        writer: &mut Option<File>,
        sync: bool,
        new_file: Option<PathBuf>,
        blocks: &[LogBlock],
    ) -> Result<i64, ReplogError> {
        if let Some(path) = new_file {
            if let Some(old) = writer.take() {
                old.sync_all().await?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await?;
            *writer = Some(file);
        }

        let file = match writer.as_mut() {
            Some(file) => file,
            None => return Err(ReplogError::msg("no log file open for writing")),
        };
        for block in blocks {
            for blob in block.data() {
                file.write_all(blob).await?;
            }
        }
        file.flush().await?;
        if sync {
            file.sync_data().await?;
        }

        Ok(blocks.last().map_or(0, |b| b.end_offset()))
    }

    /// Logger task function.
    async fn logger_thread(
        name: String,
        sync: bool,
        mut rx_log: mpsc::UnboundedReceiver<(LogActionId, LogWrite)>,
        tx_ack: mpsc::UnboundedSender<(LogActionId, LogResult)>,
    ) {
        pf_debug!(name; "logger thread spawned");

        let mut writer: Option<File> = None;
        let mut broken: Option<String> = None;

        while let Some((id, write)) = rx_log.recv().await {
            let LogWrite {
                new_file,
                blocks,
                decrees,
            } = write;

            let res = match broken {
                Some(ref reason) => Err(ReplogError::msg(format!(
                    "log file unusable after earlier failure: {}",
                    reason
                ))),
                None => {
                    Self::write_batch(&mut writer, sync, new_file, &blocks)
                        .await
                }
            };
            let result = match res {
                Ok(end_offset) => LogResult::Written {
                    decrees,
                    end_offset,
                },
                Err(e) => {
                    pf_error!(name; "error during logging: {}", e);
                    broken.get_or_insert_with(|| e.to_string());
                    LogResult::Failed {
                        decrees,
                        reason: e.to_string(),
                    }
                }
            };

            if let Err(e) = tx_ack.send((id, result)) {
                pf_error!(name; "error sending to tx_ack: {}", e);
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(name; "logger thread exitted");
    }
}
