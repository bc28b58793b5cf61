//! Replication core of a partitioned storage runtime: the prepare list decree
//! window, the durable mutation log with replay, and per-partition replicas
//! running two-phase writes, group checks and learning.

#[macro_use]
mod utils;

pub mod mutation;
pub mod mutlog;
pub mod replica;
pub mod server;

pub use crate::utils::{logger_init, ErrorCode, ReplogError};

pub use crate::mutation::{
    Ballot, CommitType, Decree, Gpid, Mutation, MutationData, MutationPtr,
    PrepareList, INVALID_BALLOT, INVALID_DECREE,
};
pub use crate::mutlog::{MutationLog, MutationLogOptions};
pub use crate::replica::{PeerMsg, Replica, ReplicaConfig, ReplicaEvent};
pub use crate::server::{
    ChannelMembership, ChannelTransport, MemStorage, MembershipHandler,
    PartitionConfiguration, PartitionStatus, ReplicaId, StorageEngine,
    Transport,
};
