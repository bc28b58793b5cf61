//! Partition membership as decided by meta, and one replica's view of it.

use crate::mutation::{Ballot, Gpid};

use serde::{Deserialize, Serialize};

/// Server node ID type.
pub type ReplicaId = u8;

/// Role of a replica within its partition.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum PartitionStatus {
    /// Not serving; after restart or after stepping down.
    Inactive,

    /// Hit a fatal error; needs a restart to participate again.
    Error,

    Primary,
    Secondary,

    /// Being added to the group; catching up through learning.
    PotentialSecondary,
}

/// Membership of one partition under one ballot.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PartitionConfiguration {
    pub pid: Gpid,
    pub ballot: Ballot,
    pub primary: Option<ReplicaId>,
    pub secondaries: Vec<ReplicaId>,

    /// Nodes being added as potential secondaries.
    pub learners: Vec<ReplicaId>,
}

impl PartitionConfiguration {
    pub fn new(pid: Gpid, ballot: Ballot) -> Self {
        PartitionConfiguration {
            pid,
            ballot,
            primary: None,
            secondaries: vec![],
            learners: vec![],
        }
    }

    /// Status of the given node under this configuration.
    pub fn status_of(&self, node: ReplicaId) -> PartitionStatus {
        if self.primary == Some(node) {
            PartitionStatus::Primary
        } else if self.secondaries.contains(&node) {
            PartitionStatus::Secondary
        } else if self.learners.contains(&node) {
            PartitionStatus::PotentialSecondary
        } else {
            PartitionStatus::Inactive
        }
    }
}

/// One replica's view of the partition, sent along with prepares and group
/// checks so the receiver knows which role the primary expects of it.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ReplicaConfiguration {
    pub pid: Gpid,
    pub ballot: Ballot,
    pub primary: ReplicaId,
    pub status: PartitionStatus,

    /// Identifies the learning session of a potential secondary; 0 if none.
    pub learner_signature: u64,
}

#[cfg(test)]
mod partition_tests {
    use super::*;

    #[test]
    fn status_by_membership() {
        let mut config = PartitionConfiguration::new(Gpid::new(1, 2), 3);
        config.primary = Some(0);
        config.secondaries = vec![1, 2];
        config.learners = vec![3];
        assert_eq!(config.status_of(0), PartitionStatus::Primary);
        assert_eq!(config.status_of(2), PartitionStatus::Secondary);
        assert_eq!(config.status_of(3), PartitionStatus::PotentialSecondary);
        assert_eq!(config.status_of(4), PartitionStatus::Inactive);
    }
}
