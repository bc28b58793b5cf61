//! Notifications from a replica to whoever manages partition membership.

use super::ReplicaId;
use crate::mutation::{Ballot, Gpid};
use crate::utils::ErrorCode;

use tokio::sync::mpsc;

/// Membership manager as seen by a replica. Configuration changes flow the
/// other way, through `Replica::update_configuration`.
pub trait MembershipHandler: Send {
    /// A member failed to answer a prepare or group check.
    fn remote_failure(&mut self, pid: Gpid, node: ReplicaId, err: ErrorCode);

    /// A potential secondary finished learning under the given ballot and can
    /// be promoted.
    fn learning_succeeded(
        &mut self,
        pid: Gpid,
        learner: ReplicaId,
        ballot: Ballot,
    );

    /// The replica itself hit a fatal error and entered `Error` status.
    fn local_failure(&mut self, pid: Gpid, node: ReplicaId, reason: &str);
}

/// A notification recorded by [`ChannelMembership`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MembershipEvent {
    RemoteFailure {
        pid: Gpid,
        node: ReplicaId,
        err: ErrorCode,
    },
    LearningSucceeded {
        pid: Gpid,
        learner: ReplicaId,
        ballot: Ballot,
    },
    LocalFailure {
        pid: Gpid,
        node: ReplicaId,
        reason: String,
    },
}

/// Forwards every notification into a channel.
pub struct ChannelMembership {
    tx: mpsc::UnboundedSender<MembershipEvent>,
}

impl ChannelMembership {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MembershipEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelMembership { tx }, rx)
    }

    fn notify(&self, event: MembershipEvent) {
        if let Err(e) = self.tx.send(event) {
            pf_warn!("membership"; "channel closed, dropping {:?}", e.0);
        }
    }
}

impl MembershipHandler for ChannelMembership {
    fn remote_failure(&mut self, pid: Gpid, node: ReplicaId, err: ErrorCode) {
        self.notify(MembershipEvent::RemoteFailure { pid, node, err });
    }

    fn learning_succeeded(
        &mut self,
        pid: Gpid,
        learner: ReplicaId,
        ballot: Ballot,
    ) {
        self.notify(MembershipEvent::LearningSucceeded {
            pid,
            learner,
            ballot,
        });
    }

    fn local_failure(&mut self, pid: Gpid, node: ReplicaId, reason: &str) {
        self.notify(MembershipEvent::LocalFailure {
            pid,
            node,
            reason: reason.into(),
        });
    }
}
