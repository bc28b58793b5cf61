//! Deterministic replay of a single log file.

use std::sync::Arc;

use super::block::LOG_BLOCK_HEADER_SIZE;
use super::file::{BlockRead, LogFile, LogFileHeader, LOG_FILE_HEADER_SIZE};

use crate::mutation::{Mutation, MutationData, MutationPtr};
use crate::utils::{ErrorCode, ReplogError};

/// How a replay ended and how far it got.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ReplayEnd {
    /// `HandleEof` for a clean end, `IncompleteData` when stopped at a
    /// damaged block, `InvalidData` on a position or header violation.
    pub code: ErrorCode,

    /// Global offset right after the last record accepted.
    pub end_offset: i64,
}

/// Replays a whole log file from its start. See [`replay_from`].
pub async fn replay<F>(
    log: &mut LogFile,
    callback: F,
) -> Result<ReplayEnd, ReplogError>
where
    F: FnMut(usize, MutationPtr) -> Result<(), ReplogError>,
{
    let start = log.start_offset();
    replay_from(log, start, callback).await
}

/// Replays a log file from the block starting at global offset `start`,
/// calling `callback(record_length, mutation)` for every mutation in file
/// order with the mutation marked logged. Damaged blocks end the replay with
/// a non-`Ok` code; only I/O failures and callback errors are `Err`.
pub async fn replay_from<F>(
    log: &mut LogFile,
    start: i64,
    mut callback: F,
) -> Result<ReplayEnd, ReplogError>
where
    F: FnMut(usize, MutationPtr) -> Result<(), ReplogError>,
{
    let name = format!("replay {}", log.path().display());
    log.reset_stream(start).await?;
    let mut end_offset = start;

    loop {
        let block_start = end_offset;
        let body = match log.read_next_log_block().await? {
            BlockRead::Block { body, .. } => body,
            BlockRead::Eof => {
                return Ok(ReplayEnd {
                    code: ErrorCode::HandleEof,
                    end_offset,
                });
            }
            BlockRead::Corrupted(reason) => {
                pf_warn!(name; "stopped at {}: {}", end_offset, reason);
                return Ok(ReplayEnd {
                    code: ErrorCode::IncompleteData,
                    end_offset,
                });
            }
            BlockRead::Invalid(reason) => {
                pf_error!(name; "invalid block at {}: {}", end_offset, reason);
                return Ok(ReplayEnd {
                    code: ErrorCode::InvalidData,
                    end_offset,
                });
            }
        };
        end_offset += LOG_BLOCK_HEADER_SIZE as i64;

        let mut pos = 0;
        if block_start == log.start_offset() {
            // first block of the file carries the file header
            let header = match LogFileHeader::from_bytes(&body) {
                Ok(header) if header.start_global_offset == log.start_offset() => {
                    header
                }
                Ok(header) => {
                    pf_error!(
                        name;
                        "file header start {} mismatches file name start {}",
                        header.start_global_offset, log.start_offset()
                    );
                    return Ok(ReplayEnd {
                        code: ErrorCode::InvalidData,
                        end_offset: block_start,
                    });
                }
                Err(e) => {
                    pf_error!(name; "bad file header: {}", e);
                    return Ok(ReplayEnd {
                        code: ErrorCode::InvalidData,
                        end_offset: block_start,
                    });
                }
            };
            log.set_header(header);
            pos = LOG_FILE_HEADER_SIZE;
            end_offset += LOG_FILE_HEADER_SIZE as i64;
        }

        while pos < body.len() {
            let (data, used) = match MutationData::read_from(&body[pos..]) {
                Ok(res) => res,
                Err(e) => {
                    // passed the CRC, so the writer produced this
                    pf_error!(name; "undecodable record at {}: {}", end_offset, e);
                    return Ok(ReplayEnd {
                        code: ErrorCode::InvalidData,
                        end_offset,
                    });
                }
            };
            if data.header.log_offset != end_offset {
                pf_error!(
                    name;
                    "mutation {}.{}.{} log_offset {} mismatches replay offset {}",
                    data.header.pid, data.header.ballot, data.header.decree,
                    data.header.log_offset, end_offset
                );
                return Ok(ReplayEnd {
                    code: ErrorCode::InvalidData,
                    end_offset,
                });
            }

            let mu = Arc::new(Mutation::new(data));
            mu.set_logged();
            callback(used, mu)?;

            pos += used;
            end_offset += used as i64;
        }
    }
}
