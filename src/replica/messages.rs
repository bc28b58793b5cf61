//! Replica -- peer-peer messaging and event dispatch.

use super::*;

use serde::Serialize;

use tokio::sync::oneshot;

/// Progress of a potential secondary's learning session.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum LearnerStatus {
    Idle,
    Learning,
    Succeeded,
    Failed,
}

/// Peer-peer message type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerMsg {
    /// Primary asks a member to log and prepare a mutation.
    Prepare {
        config: ReplicaConfiguration,
        mutation: MutationData,
    },

    PrepareReply {
        ballot: Ballot,
        decree: Decree,
        err: ErrorCode,
        status: PartitionStatus,
    },

    /// Primary's periodic check of a member, carrying its committed horizon.
    GroupCheck {
        config: ReplicaConfiguration,
        last_committed_decree: Decree,
    },

    GroupCheckReply {
        ballot: Ballot,
        err: ErrorCode,
        status: PartitionStatus,
        last_committed_decree: Decree,
        learner_signature: u64,
        learner_status: LearnerStatus,
    },

    /// Potential secondary asks for the mutations above its applied state.
    Learn {
        signature: u64,
        ballot: Ballot,
        last_committed_decree_in_app: Decree,
    },

    LearnReply {
        ballot: Ballot,
        err: ErrorCode,
        last_committed_decree: Decree,
        mutations: Vec<MutationData>,
    },
}

/// Input to a replica's event loop.
#[derive(Debug)]
pub enum ReplicaEvent {
    /// Request from a peer, to be replied to under `handle`.
    Request {
        from: ReplicaId,
        handle: RpcHandle,
        msg: PeerMsg,
    },

    /// Reply to a request this replica sent.
    Reply {
        from: ReplicaId,
        handle: RpcHandle,
        msg: PeerMsg,
    },

    /// A request this replica sent could not be completed.
    RpcFailed {
        to: ReplicaId,
        handle: RpcHandle,
        err: ErrorCode,
    },

    /// Client write, optionally answered with its admission outcome.
    ClientWrite {
        updates: Vec<Bytes>,
        tx_reply: Option<oneshot::Sender<ErrorCode>>,
    },

    /// New partition configuration from meta.
    ConfigUpdate { config: PartitionConfiguration },

    /// Request to checkpoint the storage engine now.
    Checkpoint,
}

// Replica peer-peer messages dispatch
impl Replica {
    /// Routes a peer request to its handler.
    pub(super) fn handle_request(
        &mut self,
        from: ReplicaId,
        handle: RpcHandle,
        msg: PeerMsg,
    ) -> Result<(), ReplogError> {
        match msg {
            PeerMsg::Prepare { config, mutation } => {
                self.on_prepare(from, handle, config, mutation)
            }
            PeerMsg::GroupCheck {
                config,
                last_committed_decree,
            } => self.on_group_check(from, handle, config, last_committed_decree),
            PeerMsg::Learn {
                signature,
                ballot,
                last_committed_decree_in_app,
            } => self.on_learn(
                from,
                handle,
                signature,
                ballot,
                last_committed_decree_in_app,
            ),
            other => {
                pf_warn!(self.name; "unexpected request <- {}: {:?}", from, other);
                Ok(())
            }
        }
    }

    /// Routes a peer reply to its handler.
    pub(super) fn handle_reply(
        &mut self,
        from: ReplicaId,
        handle: RpcHandle,
        msg: PeerMsg,
    ) -> Result<(), ReplogError> {
        match msg {
            PeerMsg::PrepareReply {
                ballot,
                decree,
                err,
                status,
            } => self.on_prepare_reply(from, handle, ballot, decree, err, status),
            PeerMsg::GroupCheckReply {
                ballot,
                err,
                status,
                last_committed_decree,
                learner_signature,
                learner_status,
            } => self.on_group_check_reply(
                from,
                handle,
                ballot,
                err,
                status,
                last_committed_decree,
                learner_signature,
                learner_status,
            ),
            PeerMsg::LearnReply {
                ballot,
                err,
                last_committed_decree,
                mutations,
            } => self.on_learn_reply(
                from,
                handle,
                ballot,
                err,
                last_committed_decree,
                mutations,
            ),
            other => {
                pf_warn!(self.name; "unexpected reply <- {}: {:?}", from, other);
                Ok(())
            }
        }
    }

    /// Handles a request this replica sent that will never be answered.
    pub(super) fn handle_rpc_failed(
        &mut self,
        to: ReplicaId,
        handle: RpcHandle,
        err: ErrorCode,
    ) {
        if self.prepare_pending.remove(&handle).is_some() {
            self.handle_remote_failure(to, err);
        } else if self.group_check_pending.get(&to) == Some(&handle) {
            self.group_check_pending.remove(&to);
            self.handle_remote_failure(to, err);
        } else if let Some(session) = self.learning.as_mut() {
            if session.handle == Some(handle) {
                pf_warn!(self.name; "learn request to {} failed: {}", to, err);
                session.handle = None;
                session.status = LearnerStatus::Failed;
            }
        }
    }
}
