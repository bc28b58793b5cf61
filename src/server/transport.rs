//! Peer-to-peer messaging seam. The replica only sees `Transport`; requests,
//! replies and delivery failures come back to it as `ReplicaEvent`s.

use std::collections::HashMap;

use super::ReplicaId;
use crate::replica::{PeerMsg, ReplicaEvent};
use crate::utils::{ErrorCode, ReplogError};

use tokio::sync::mpsc;

/// Identifies one outstanding request of a sender.
pub type RpcHandle = u64;

/// Outbound side of peer messaging.
pub trait Transport: Send {
    /// Sends a request. Its reply, or a delivery failure, is delivered later
    /// as an event carrying the returned handle.
    fn send(
        &mut self,
        to: ReplicaId,
        msg: PeerMsg,
    ) -> Result<RpcHandle, ReplogError>;

    /// Replies to a request received under `handle`.
    fn reply(
        &mut self,
        to: ReplicaId,
        handle: RpcHandle,
        msg: PeerMsg,
    ) -> Result<(), ReplogError>;

    /// Gives up on an outstanding request.
    fn cancel(&mut self, handle: RpcHandle);
}

/// In-process transport connecting replicas through their event channels.
pub struct ChannelTransport {
    /// Log prefix.
    name: String,

    me: ReplicaId,

    /// Event channels of all reachable replicas, self included.
    peers: HashMap<ReplicaId, mpsc::UnboundedSender<ReplicaEvent>>,

    next_handle: RpcHandle,
}

impl ChannelTransport {
    /// Creates fully connected transports for the given replicas, each paired
    /// with the receiving end of that replica's event channel.
    pub fn new_group(
        ids: &[ReplicaId],
    ) -> Vec<(ChannelTransport, mpsc::UnboundedReceiver<ReplicaEvent>)> {
        let mut senders = HashMap::new();
        let mut receivers = vec![];
        for &id in ids {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(id, tx);
            receivers.push((id, rx));
        }

        receivers
            .into_iter()
            .map(|(id, rx)| {
                let transport = ChannelTransport {
                    name: format!("transport@{}", id),
                    me: id,
                    peers: senders.clone(),
                    next_handle: 0,
                };
                (transport, rx)
            })
            .collect()
    }

    /// Sender into the event channel of the given replica.
    pub fn sender(
        &self,
        id: ReplicaId,
    ) -> Option<mpsc::UnboundedSender<ReplicaEvent>> {
        self.peers.get(&id).cloned()
    }

    /// Makes `peer` unreachable from this replica.
    pub fn disconnect(&mut self, peer: ReplicaId) {
        if peer != self.me {
            self.peers.remove(&peer);
        }
    }

    fn deliver(&self, to: ReplicaId, event: ReplicaEvent) -> bool {
        match self.peers.get(&to) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

impl Transport for ChannelTransport {
    fn send(
        &mut self,
        to: ReplicaId,
        msg: PeerMsg,
    ) -> Result<RpcHandle, ReplogError> {
        self.next_handle += 1;
        let handle = self.next_handle;
        let event = ReplicaEvent::Request {
            from: self.me,
            handle,
            msg,
        };
        if !self.deliver(to, event) {
            pf_debug!(self.name; "request {} to {} undeliverable", handle, to);
            let failure = ReplicaEvent::RpcFailed {
                to,
                handle,
                err: ErrorCode::NetworkFailure,
            };
            if !self.deliver(self.me, failure) {
                return logged_err!(self.name; "own event channel closed");
            }
        }
        Ok(handle)
    }

    fn reply(
        &mut self,
        to: ReplicaId,
        handle: RpcHandle,
        msg: PeerMsg,
    ) -> Result<(), ReplogError> {
        let event = ReplicaEvent::Reply {
            from: self.me,
            handle,
            msg,
        };
        if !self.deliver(to, event) {
            // lost replies look like a silent peer to the requester
            pf_debug!(self.name; "reply {} to {} undeliverable", handle, to);
        }
        Ok(())
    }

    fn cancel(&mut self, handle: RpcHandle) {
        // replies to cancelled handles still arrive; receivers drop them
        pf_trace!(self.name; "cancelled request {}", handle);
    }
}
