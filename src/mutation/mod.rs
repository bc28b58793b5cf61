//! Mutations and the in-memory decree window they move through.

mod cache;
mod prepare_list;

pub use cache::MutationCache;
pub use prepare_list::{CommitType, Committer, PrepareList};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::utils::ReplogError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

/// Position of a mutation in a partition's totally ordered write sequence.
pub type Decree = i64;

/// Term number, bumped on every primary (re-)election.
pub type Ballot = i64;

pub const INVALID_DECREE: Decree = -1;
pub const INVALID_BALLOT: Ballot = -1;
pub const INVALID_OFFSET: i64 = -1;

/// Size of the length prefix in front of every serialized mutation record.
pub const RECORD_HEADER_SIZE: usize = 4;

/// Global partition ID: table (app) ID plus partition index.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct Gpid {
    pub app_id: i32,
    pub partition_index: i32,
}

impl Gpid {
    pub fn new(app_id: i32, partition_index: i32) -> Self {
        Gpid {
            app_id,
            partition_index,
        }
    }
}

impl fmt::Display for Gpid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.app_id, self.partition_index)
    }
}

/// Ordering metadata of a mutation.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MutationHeader {
    pub pid: Gpid,
    pub ballot: Ballot,
    pub decree: Decree,

    /// Global offset of this record in the mutation log; assigned when the
    /// mutation is appended.
    pub log_offset: i64,

    /// Committed horizon of the primary at the time of prepare.
    pub last_committed_decree: Decree,

    /// Microseconds since UNIX epoch.
    pub timestamp: u64,
}

/// Serializable body of a mutation: header plus opaque client updates.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MutationData {
    pub header: MutationHeader,
    pub updates: Vec<Bytes>,
}

impl MutationData {
    /// Creates mutation data with a fresh timestamp and no log offset yet.
    pub fn new(
        pid: Gpid,
        ballot: Ballot,
        decree: Decree,
        last_committed_decree: Decree,
        updates: Vec<Bytes>,
    ) -> Self {
        MutationData {
            header: MutationHeader {
                pid,
                ballot,
                decree,
                log_offset: INVALID_OFFSET,
                last_committed_decree,
                timestamp: now_micros(),
            },
            updates,
        }
    }

    /// Serializes into the two blobs of an on-log record: a little-endian
    /// `u32` length prefix and the body.
    pub fn write_to(&self) -> Result<(Bytes, Bytes), ReplogError> {
        let body = encode_to_vec(self)?;
        let len = u32::try_from(body.len()).map_err(|_| {
            ReplogError::msg(format!(
                "mutation record too large: {} bytes",
                body.len()
            ))
        })?;
        Ok((
            Bytes::copy_from_slice(&len.to_le_bytes()),
            Bytes::from(body),
        ))
    }

    /// Deserializes one record from the front of `buf`. Returns the data and
    /// the number of bytes the record occupied.
    pub fn read_from(buf: &[u8]) -> Result<(MutationData, usize), ReplogError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(ReplogError::msg(format!(
                "record header needs {} bytes, only {} left",
                RECORD_HEADER_SIZE,
                buf.len()
            )));
        }
        let mut len_bytes = [0u8; RECORD_HEADER_SIZE];
        len_bytes.copy_from_slice(&buf[..RECORD_HEADER_SIZE]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let end = RECORD_HEADER_SIZE + len;
        if buf.len() < end {
            return Err(ReplogError::msg(format!(
                "record body needs {} bytes, only {} left",
                len,
                buf.len() - RECORD_HEADER_SIZE
            )));
        }
        let data = decode_from_slice(&buf[RECORD_HEADER_SIZE..end])?;
        Ok((data, end))
    }
}

/// A client write together with its ordering metadata, shared between the
/// prepare list, the committer and the replica's bookkeeping. The data is
/// immutable once shared; progress flags are atomics.
#[derive(Debug)]
pub struct Mutation {
    pub data: MutationData,

    /// Durable in the local mutation log.
    logged: AtomicBool,

    /// Number of secondary acks the primary still waits for.
    left_secondary_acks: AtomicUsize,

    /// `gpid.ballot.decree`, for diagnostics.
    name: String,
}

/// Reference-counted mutation handle.
pub type MutationPtr = Arc<Mutation>;

impl Mutation {
    pub fn new(data: MutationData) -> Self {
        let name = format!(
            "{}.{}.{}",
            data.header.pid, data.header.ballot, data.header.decree
        );
        Mutation {
            data,
            logged: AtomicBool::new(false),
            left_secondary_acks: AtomicUsize::new(0),
            name,
        }
    }

    #[inline]
    pub fn decree(&self) -> Decree {
        self.data.header.decree
    }

    #[inline]
    pub fn ballot(&self) -> Ballot {
        self.data.header.ballot
    }

    #[inline]
    pub fn last_committed_decree(&self) -> Decree {
        self.data.header.last_committed_decree
    }

    #[inline]
    pub fn log_offset(&self) -> i64 {
        self.data.header.log_offset
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// An empty write carries no client updates; primaries issue these to
    /// push the committed horizon forward when idle.
    #[inline]
    pub fn is_empty_write(&self) -> bool {
        self.data.updates.is_empty()
    }

    #[inline]
    pub fn is_logged(&self) -> bool {
        self.logged.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_logged(&self) {
        self.logged.store(true, Ordering::Release);
    }

    #[inline]
    pub fn left_secondary_acks(&self) -> usize {
        self.left_secondary_acks.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_left_secondary_acks(&self, cnt: usize) {
        self.left_secondary_acks.store(cnt, Ordering::Release);
    }

    /// Records one secondary ack. Returns the number still outstanding.
    pub fn ack_secondary(&self) -> usize {
        let prev = self
            .left_secondary_acks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    /// Logged locally and acknowledged by every secondary.
    #[inline]
    pub fn is_ready_for_commit(&self) -> bool {
        self.is_logged() && self.left_secondary_acks() == 0
    }
}

/// Current wall-clock time in microseconds since UNIX epoch.
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn make_test_mutation(
    ballot: Ballot,
    decree: Decree,
    last_committed_decree: Decree,
    payload: &str,
) -> MutationData {
    MutationData::new(
        Gpid::new(1, 0),
        ballot,
        decree,
        last_committed_decree,
        vec![Bytes::copy_from_slice(payload.as_bytes())],
    )
}

#[cfg(test)]
mod mutation_tests {
    use super::*;

    #[test]
    fn record_write_read() -> Result<(), ReplogError> {
        let mut data = make_test_mutation(3, 17, 15, "hello");
        data.header.log_offset = 4096;
        let (len_blob, body_blob) = data.write_to()?;
        assert_eq!(len_blob.len(), RECORD_HEADER_SIZE);

        let mut buf = len_blob.to_vec();
        buf.extend_from_slice(&body_blob);
        buf.extend_from_slice(b"trailing");
        let (decoded, used) = MutationData::read_from(&buf)?;
        assert_eq!(decoded, data);
        assert_eq!(used, RECORD_HEADER_SIZE + body_blob.len());
        Ok(())
    }

    #[test]
    fn record_read_short() -> Result<(), ReplogError> {
        let data = make_test_mutation(1, 1, 0, "abc");
        let (len_blob, body_blob) = data.write_to()?;
        assert!(MutationData::read_from(&len_blob[..2]).is_err());
        let mut buf = len_blob.to_vec();
        buf.extend_from_slice(&body_blob[..body_blob.len() - 1]);
        assert!(MutationData::read_from(&buf).is_err());
        Ok(())
    }

    #[test]
    fn readiness_flags() {
        let mu = Mutation::new(make_test_mutation(1, 5, 4, "x"));
        assert_eq!(mu.name(), "1.0.1.5");
        assert!(!mu.is_ready_for_commit());
        mu.set_left_secondary_acks(2);
        mu.set_logged();
        assert!(!mu.is_ready_for_commit());
        assert_eq!(mu.ack_secondary(), 1);
        assert_eq!(mu.ack_secondary(), 0);
        assert_eq!(mu.ack_secondary(), 0);
        assert!(mu.is_ready_for_commit());
    }
}
