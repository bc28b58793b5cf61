//! Collaborators of a replica: partition membership, the storage engine
//! behind an executor task, and peer transport.

mod membership;
mod partition;
mod statemach;
mod transport;

pub use membership::{ChannelMembership, MembershipEvent, MembershipHandler};
pub use partition::{
    PartitionConfiguration, PartitionStatus, ReplicaConfiguration, ReplicaId,
};
pub use statemach::{
    ExecAction, ExecActionId, ExecResult, MemStorage, StateMachine,
    StorageEngine,
};
pub use transport::{ChannelTransport, RpcHandle, Transport};
