//! Replica of one partition: drives the two-phase write path, commits in
//! decree order, checks the group, and learns when joining.
//!
//! All state of a replica is owned by the task running [`Replica::run`].
//! Log writes and state machine execution happen on their own tasks and
//! report back through channels polled by the run loop.

mod check;
mod configuration;
mod durability;
mod execution;
mod learning;
mod messages;
mod prepare;
mod recovery;

pub use messages::{LearnerStatus, PeerMsg, ReplicaEvent};

use std::cmp;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::mutation::{
    Ballot, CommitType, Committer, Decree, Gpid, Mutation, MutationData,
    MutationPtr, PrepareList,
};
use crate::mutlog::{LogActionId, LogResult, MutationLog, MutationLogOptions};
use crate::server::{
    ExecAction, ExecActionId, ExecResult, MembershipHandler,
    PartitionConfiguration, PartitionStatus, ReplicaConfiguration, ReplicaId,
    RpcHandle, StateMachine, StorageEngine, Transport,
};
use crate::utils::{ErrorCode, ReplogError};

use bytes::Bytes;

use serde::Deserialize;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Directory of the mutation log files.
    pub log_dir: String,

    /// Whether to call `fdatasync()` after every log write.
    pub log_sync: bool,

    /// A new log file is started once the current one reaches this size.
    pub max_log_file_mb: u64,

    /// Soft limit of a log block's size.
    pub max_block_bytes: usize,

    /// Width of the prepare list window in decrees.
    pub max_mutation_count_in_prepare_list: usize,

    /// Interval of primary group checks in millisecs.
    pub group_check_interval_ms: u64,

    /// Disable the group check timer (to drive rounds by hand during tests).
    pub group_check_disabled: bool,

    /// Disable empty writes from an idle primary.
    pub empty_write_disabled: bool,

    /// Directory of storage engine checkpoints.
    pub checkpoint_dir: String,

    /// Checkpoint self-triggering interval in secs. 0 means never trigger
    /// automatically.
    pub checkpoint_interval_s: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            log_dir: "/tmp/replog.log".into(),
            log_sync: false,
            max_log_file_mb: 32,
            max_block_bytes: 1024 * 1024,
            max_mutation_count_in_prepare_list: 110,
            group_check_interval_ms: 10000,
            group_check_disabled: false,
            empty_write_disabled: false,
            checkpoint_dir: "/tmp/replog.ckpt".into(),
            checkpoint_interval_s: 0,
        }
    }
}

/// Mutations of one log flush, and the prepare acks waiting on it.
#[derive(Debug, Default)]
struct PendingLog {
    mutations: Vec<MutationPtr>,
    replies: Vec<(ReplicaId, RpcHandle, Decree)>,
}

/// Primary-side bookkeeping of a potential secondary.
#[derive(Debug, Clone, Copy)]
struct LearnerProgress {
    signature: u64,

    /// Membership already told about this learner's success.
    notified: bool,
}

/// Learner-side state of the current learning session.
#[derive(Debug, Clone, Copy)]
struct LearningSession {
    signature: u64,
    status: LearnerStatus,

    /// Outstanding learn request, if any.
    handle: Option<RpcHandle>,

    /// Primary's committed decree from the learn reply; learning succeeds
    /// once this replica has logged and committed up to it.
    target: Option<Decree>,
}

/// Replica of one partition.
pub struct Replica {
    /// Log prefix, `gpid@me`.
    name: String,

    /// My replica ID.
    me: ReplicaId,

    pid: Gpid,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    status: PartitionStatus,

    /// Highest ballot known; never decreases.
    ballot: Ballot,

    primary: Option<ReplicaId>,

    /// Latest membership from meta.
    partition: PartitionConfiguration,

    /// Window of prepared mutations.
    prepare_list: PrepareList,

    /// Mutations committed by the prepare list, in decree order.
    rx_committed: mpsc::UnboundedReceiver<MutationPtr>,

    /// Durable mutation log.
    log: MutationLog,

    next_log_action: LogActionId,
    pending_log: HashMap<LogActionId, PendingLog>,

    /// State machine executor.
    state_machine: StateMachine,

    next_exec_action: ExecActionId,

    /// Highest decree handed to the executor.
    app_submitted_decree: Decree,

    /// Highest decree the storage engine has applied.
    app_committed_decree: Decree,

    /// Highest decree covered by a checkpoint.
    app_durable_decree: Decree,

    transport: Box<dyn Transport>,
    membership: Box<dyn MembershipHandler>,

    /// Outstanding group check per member (primary only).
    group_check_pending: HashMap<ReplicaId, RpcHandle>,

    /// Outstanding prepares to secondaries (primary only).
    prepare_pending: HashMap<RpcHandle, (ReplicaId, Decree)>,

    /// Potential secondaries being added (primary only).
    learners: HashMap<ReplicaId, LearnerProgress>,

    next_learner_signature: u64,

    /// When this replica last prepared anything as primary.
    last_prepare_at: Instant,

    /// Learning session (potential secondary only).
    learning: Option<LearningSession>,

    /// Highest committed decree heard from the primary (potential secondary
    /// only).
    primary_committed_decree: Decree,

    /// Set once a fatal error was hit.
    failure: Option<String>,
}

// Replica public API implementation
impl Replica {
    /// Creates a replica, replaying its mutation log on top of the engine's
    /// committed state. Starts in `Inactive` status with the highest ballot
    /// found in the log.
    pub async fn new_and_setup(
        me: ReplicaId,
        pid: Gpid,
        config_str: Option<&str>,
        engine: Box<dyn StorageEngine>,
        transport: Box<dyn Transport>,
        membership: Box<dyn MembershipHandler>,
    ) -> Result<Self, ReplogError> {
        let name = format!("{}@{}", pid, me);

        // parse protocol-specific configs
        let config = parsed_config!(config_str => ReplicaConfig;
                                    log_dir, log_sync, max_log_file_mb,
                                    max_block_bytes,
                                    max_mutation_count_in_prepare_list,
                                    group_check_interval_ms,
                                    group_check_disabled,
                                    empty_write_disabled, checkpoint_dir,
                                    checkpoint_interval_s)?;
        if config.max_mutation_count_in_prepare_list == 0 {
            return logged_err!(
                name;
                "invalid config.max_mutation_count_in_prepare_list '{}'",
                config.max_mutation_count_in_prepare_list
            );
        }
        if config.group_check_interval_ms == 0 {
            return logged_err!(
                name;
                "invalid config.group_check_interval_ms '{}'",
                config.group_check_interval_ms
            );
        }
        if config.max_log_file_mb == 0 {
            return logged_err!(
                name;
                "invalid config.max_log_file_mb '{}'",
                config.max_log_file_mb
            );
        }
        if config.max_block_bytes == 0 {
            return logged_err!(
                name;
                "invalid config.max_block_bytes '{}'",
                config.max_block_bytes
            );
        }

        let state_machine = StateMachine::new_and_setup(&name, engine).await?;
        let app_decree = state_machine.init_committed_decree();

        let (tx_committed, rx_committed) = mpsc::unbounded_channel();
        let committer_name = name.clone();
        let committer: Committer = Box::new(move |mu: &MutationPtr| {
            if tx_committed.send(mu.clone()).is_err() {
                pf_error!(committer_name; "committed channel closed at {}",
                                          mu.name());
            }
        });
        let mut prepare_list = PrepareList::new(
            &name,
            app_decree,
            config.max_mutation_count_in_prepare_list,
            committer,
        );

        let (log, ballot) =
            Self::recover_from_log(&name, &config, &mut prepare_list).await?;

        let mut replica = Replica {
            name,
            me,
            pid,
            status: PartitionStatus::Inactive,
            ballot,
            primary: None,
            partition: PartitionConfiguration::new(pid, ballot),
            prepare_list,
            rx_committed,
            log,
            next_log_action: 0,
            pending_log: HashMap::new(),
            next_exec_action: 0,
            app_submitted_decree: app_decree,
            app_committed_decree: app_decree,
            app_durable_decree: state_machine.init_durable_decree(),
            state_machine,
            transport,
            membership,
            group_check_pending: HashMap::new(),
            prepare_pending: HashMap::new(),
            learners: HashMap::new(),
            next_learner_signature: 0,
            last_prepare_at: Instant::now(),
            learning: None,
            primary_committed_decree: 0,
            failure: None,
            config,
        };
        replica.drain_committed()?;

        pf_info!(
            replica.name;
            "replica ready: ballot {}, last_committed_decree {}, max_decree {}",
            replica.ballot, replica.last_committed_decree(),
            replica.max_decree()
        );
        Ok(replica)
    }

    /// Main event loop. Returns `Ok` on termination signal or when the event
    /// channel closes, and `Err` once the replica entered `Error` status.
    pub async fn run(
        &mut self,
        mut rx_event: mpsc::UnboundedReceiver<ReplicaEvent>,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), ReplogError> {
        let mut group_check_interval = time::interval(Duration::from_millis(
            self.config.group_check_interval_ms,
        ));
        group_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let checkpoint_enabled = self.config.checkpoint_interval_s > 0;
        let mut checkpoint_interval = time::interval(Duration::from_secs(
            cmp::max(self.config.checkpoint_interval_s, 1),
        ));
        checkpoint_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        checkpoint_interval.tick().await;

        loop {
            let checking = self.status == PartitionStatus::Primary
                && !self.config.group_check_disabled;

            tokio::select! {
                // event from peers, clients or meta
                event = rx_event.recv() => {
                    let event = match event {
                        Some(event) => event,
                        None => {
                            pf_info!(self.name; "event channel closed");
                            return Ok(());
                        }
                    };
                    if let Err(e) = self.handle_event(event) {
                        self.handle_local_failure(e.to_string());
                    }
                },

                // durable logging result
                log_result = self.log.get_result() => {
                    match log_result {
                        Ok((action_id, log_result)) => {
                            if let Err(e) =
                                self.handle_log_result(action_id, log_result)
                            {
                                self.handle_local_failure(e.to_string());
                            }
                        }
                        Err(e) => self.handle_local_failure(e.to_string()),
                    }
                },

                // state machine execution result
                exec_result = self.state_machine.get_result() => {
                    match exec_result {
                        Ok((action_id, exec_result)) => {
                            if let Err(e) = self
                                .handle_exec_result(action_id, exec_result)
                                .await
                            {
                                self.handle_local_failure(e.to_string());
                            }
                        }
                        Err(e) => self.handle_local_failure(e.to_string()),
                    }
                },

                // primary group check round
                _ = group_check_interval.tick(), if checking => {
                    if let Err(e) = self.broadcast_group_check() {
                        self.handle_local_failure(e.to_string());
                    }
                },

                // self-triggered checkpoint
                _ = checkpoint_interval.tick(), if checkpoint_enabled => {
                    if let Err(e) = self.trigger_checkpoint() {
                        pf_warn!(self.name; "error triggering checkpoint: {}", e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.name; "replica caught termination signal");
                    return Ok(());
                }
            }

            if let Some(reason) = &self.failure {
                return logged_err!(self.name; "replica failed: {}", reason);
            }
        }
    }

    /// Handles one event; an `Err` means a fatal error on this replica.
    pub fn handle_event(
        &mut self,
        event: ReplicaEvent,
    ) -> Result<(), ReplogError> {
        if self.status == PartitionStatus::Error {
            pf_debug!(self.name; "dropping event in error status");
            return Ok(());
        }

        match event {
            ReplicaEvent::Request { from, handle, msg } => {
                self.handle_request(from, handle, msg)
            }
            ReplicaEvent::Reply { from, handle, msg } => {
                self.handle_reply(from, handle, msg)
            }
            ReplicaEvent::RpcFailed { to, handle, err } => {
                self.handle_rpc_failed(to, handle, err);
                Ok(())
            }
            ReplicaEvent::ClientWrite { updates, tx_reply } => {
                let code = self.client_write(updates)?;
                if let Some(tx) = tx_reply {
                    if tx.send(code).is_err() {
                        pf_debug!(self.name; "client write reply dropped");
                    }
                }
                Ok(())
            }
            ReplicaEvent::ConfigUpdate { config } => {
                self.update_configuration(config).map(|_| ())
            }
            ReplicaEvent::Checkpoint => self.trigger_checkpoint(),
        }
    }

    #[inline]
    pub fn me(&self) -> ReplicaId {
        self.me
    }

    #[inline]
    pub fn status(&self) -> PartitionStatus {
        self.status
    }

    #[inline]
    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    #[inline]
    pub fn last_committed_decree(&self) -> Decree {
        self.prepare_list.last_committed_decree()
    }

    #[inline]
    pub fn max_decree(&self) -> Decree {
        self.prepare_list.max_decree()
    }

    #[inline]
    pub fn app_committed_decree(&self) -> Decree {
        self.app_committed_decree
    }

    #[inline]
    pub fn app_durable_decree(&self) -> Decree {
        self.app_durable_decree
    }

    /// Fatal error hit by this replica, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

#[cfg(test)]
impl Replica {
    /// Waits for one log result and handles it.
    async fn poll_log(&mut self) -> Result<(), ReplogError> {
        let (id, result) = self.log.get_result().await?;
        self.handle_log_result(id, result)
    }

    /// Waits for one execution result and handles it.
    async fn poll_exec(&mut self) -> Result<(), ReplogError> {
        let (id, result) = self.state_machine.get_result().await?;
        self.handle_exec_result(id, result).await
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use crate::server::{
        ChannelMembership, ChannelTransport, MemStorage, MembershipEvent,
    };
    use std::path::Path;
    use tokio::sync::oneshot;

    type Node = (Replica, mpsc::UnboundedReceiver<ReplicaEvent>);

    fn test_pid() -> Gpid {
        Gpid::new(1, 0)
    }

    fn config_str(dir: &str, id: ReplicaId, extra: &str) -> String {
        format!(
            "log_dir = '{}/log.{}'\ncheckpoint_dir = '{}/ckpt.{}'\n\
             group_check_disabled = true\n{}",
            dir, id, dir, id, extra
        )
    }

    fn scratch_dir(dir: &str) -> Result<(), ReplogError> {
        if Path::new(dir).exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Sets up a group of replicas over channel transports.
    async fn setup_group(
        dir: &str,
        ids: &[ReplicaId],
        extra: &str,
    ) -> Result<
        (Vec<Node>, mpsc::UnboundedReceiver<MembershipEvent>),
        ReplogError,
    > {
        scratch_dir(dir)?;
        let (membership, rx_membership) = ChannelMembership::new();
        let mut membership = Some(membership);
        let mut nodes = vec![];
        for (transport, rx) in ChannelTransport::new_group(ids) {
            let id = ids[nodes.len()];
            let handler: Box<dyn MembershipHandler> = match membership.take() {
                Some(m) => Box::new(m),
                None => Box::new(ChannelMembership::new().0),
            };
            let replica = Replica::new_and_setup(
                id,
                test_pid(),
                Some(config_str(dir, id, extra).as_str()),
                Box::new(MemStorage::new()),
                Box::new(transport),
                handler,
            )
            .await?;
            nodes.push((replica, rx));
        }
        Ok((nodes, rx_membership))
    }

    fn partition(
        ballot: Ballot,
        primary: ReplicaId,
        secondaries: &[ReplicaId],
        learners: &[ReplicaId],
    ) -> PartitionConfiguration {
        let mut config = PartitionConfiguration::new(test_pid(), ballot);
        config.primary = Some(primary);
        config.secondaries = secondaries.to_vec();
        config.learners = learners.to_vec();
        config
    }

    /// Handles every event currently queued for the node.
    fn deliver(node: &mut Node) -> Result<usize, ReplogError> {
        let mut cnt = 0;
        while let Ok(event) = node.1.try_recv() {
            node.0.handle_event(event)?;
            cnt += 1;
        }
        Ok(cnt)
    }

    fn write(s: &str) -> Vec<Bytes> {
        vec![Bytes::copy_from_slice(s.as_bytes())]
    }

    #[test]
    fn config_defaults_and_overrides() -> Result<(), ReplogError> {
        let config_str = Some("max_mutation_count_in_prepare_list = 3");
        let config = parsed_config!(config_str => ReplicaConfig;
                                    max_mutation_count_in_prepare_list)?;
        assert_eq!(config.max_mutation_count_in_prepare_list, 3);
        assert_eq!(config.group_check_interval_ms, 10000);
        let config_str = Some("no_such_field = 1");
        assert!(parsed_config!(config_str => ReplicaConfig; log_dir).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reject_invalid_config() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-0";
        let res = setup_group(
            dir,
            &[0],
            "max_mutation_count_in_prepare_list = 0",
        )
        .await;
        assert!(res.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_phase_write() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-1";
        let (mut nodes, _) = setup_group(dir, &[0, 1, 2], "").await?;
        let config = partition(1, 0, &[1, 2], &[]);
        for node in nodes.iter_mut() {
            assert!(node.0.update_configuration(config.clone())?);
        }
        assert_eq!(nodes[0].0.status(), PartitionStatus::Primary);
        assert_eq!(nodes[1].0.status(), PartitionStatus::Secondary);

        assert_eq!(nodes[0].0.client_write(write("a"))?, ErrorCode::Ok);
        nodes[0].0.poll_log().await?;
        assert_eq!(nodes[0].0.last_committed_decree(), 0);

        for i in [1, 2] {
            assert_eq!(deliver(&mut nodes[i])?, 1);
            nodes[i].0.poll_log().await?;
        }
        assert_eq!(deliver(&mut nodes[0])?, 2);
        assert_eq!(nodes[0].0.last_committed_decree(), 1);
        nodes[0].0.poll_exec().await?;
        assert_eq!(nodes[0].0.app_committed_decree(), 1);

        // secondaries learn the committed horizon from the group check
        assert_eq!(nodes[1].0.last_committed_decree(), 0);
        nodes[0].0.broadcast_group_check()?;
        for i in [1, 2] {
            deliver(&mut nodes[i])?;
            assert_eq!(nodes[i].0.last_committed_decree(), 1);
            nodes[i].0.poll_exec().await?;
            assert_eq!(nodes[i].0.app_committed_decree(), 1);
        }
        assert_eq!(deliver(&mut nodes[0])?, 2);
        assert!(nodes[0].0.group_check_pending.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_primary_steps_down() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-2";
        let (mut nodes, _) = setup_group(dir, &[0, 1], "").await?;
        nodes[0].0.update_configuration(partition(1, 0, &[1], &[]))?;
        nodes[1].0.update_configuration(partition(2, 1, &[0], &[]))?;

        assert_eq!(nodes[0].0.client_write(write("a"))?, ErrorCode::Ok);
        deliver(&mut nodes[1])?;
        assert_eq!(nodes[1].0.max_decree(), 0);
        deliver(&mut nodes[0])?;
        assert_eq!(nodes[0].0.status(), PartitionStatus::Inactive);
        assert_eq!(nodes[0].0.ballot(), 1);

        // a stale configuration from meta changes nothing
        assert!(!nodes[1].0.update_configuration(partition(1, 0, &[1], &[]))?);
        assert_eq!(nodes[1].0.status(), PartitionStatus::Primary);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capacity_exceeded_without_acks() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-3";
        let (mut nodes, mut rx_membership) = setup_group(
            dir,
            &[0, 1],
            "max_mutation_count_in_prepare_list = 3",
        )
        .await?;
        nodes[0].0.update_configuration(partition(1, 0, &[1], &[]))?;
        nodes[1].0.update_configuration(partition(1, 1, &[0], &[]))?;
        for s in ["a", "b", "c"] {
            assert_eq!(nodes[0].0.client_write(write(s))?, ErrorCode::Ok);
        }
        assert_eq!(
            nodes[0].0.client_write(write("d"))?,
            ErrorCode::CapacityExceeded
        );
        assert_eq!(nodes[0].0.max_decree(), 3);

        // conflicting primary under the same ballot refuses the prepares
        deliver(&mut nodes[1])?;
        assert_eq!(nodes[1].0.max_decree(), 0);
        deliver(&mut nodes[0])?;
        assert_eq!(
            rx_membership.try_recv()?,
            MembershipEvent::RemoteFailure {
                pid: test_pid(),
                node: 1,
                err: ErrorCode::InvalidState
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn learner_catches_up() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-4";
        let (mut nodes, mut rx_membership) =
            setup_group(dir, &[0, 1], "").await?;
        let config = partition(1, 0, &[], &[1]);
        for node in nodes.iter_mut() {
            node.0.update_configuration(config.clone())?;
        }
        assert_eq!(nodes[1].0.status(), PartitionStatus::PotentialSecondary);

        for s in ["a", "b", "c"] {
            nodes[0].0.client_write(write(s))?;
        }
        for _ in 0..3 {
            nodes[0].0.poll_log().await?;
        }
        assert_eq!(nodes[0].0.last_committed_decree(), 3);

        // prepares reaching the learner before learning starts
        assert_eq!(deliver(&mut nodes[1])?, 3);
        assert_eq!(nodes[1].0.last_committed_decree(), 0);

        nodes[0].0.broadcast_group_check()?;
        deliver(&mut nodes[1])?; // group check; learner asks to learn
        deliver(&mut nodes[0])?; // group check reply and learn request
        deliver(&mut nodes[1])?; // learn reply

        // learned mutations commit only after they are durably logged
        assert_eq!(nodes[1].0.last_committed_decree(), 0);
        assert_eq!(
            nodes[1].0.learning.map(|session| session.status),
            Some(LearnerStatus::Learning)
        );
        for _ in 0..3 {
            nodes[1].0.poll_log().await?; // earlier prepares
        }
        assert_eq!(nodes[1].0.last_committed_decree(), 0);
        nodes[1].0.poll_log().await?; // learned mutations
        assert_eq!(nodes[1].0.last_committed_decree(), 3);
        assert_eq!(
            nodes[1].0.learning.map(|session| session.status),
            Some(LearnerStatus::Succeeded)
        );
        for _ in 0..3 {
            nodes[1].0.poll_exec().await?;
        }
        assert_eq!(nodes[1].0.app_committed_decree(), 3);

        nodes[0].0.broadcast_group_check()?;
        deliver(&mut nodes[1])?;
        deliver(&mut nodes[0])?;
        assert_eq!(
            rx_membership.try_recv()?,
            MembershipEvent::LearningSucceeded {
                pid: test_pid(),
                learner: 1,
                ballot: 1
            }
        );

        // success is reported once per learning session
        nodes[0].0.broadcast_group_check()?;
        deliver(&mut nodes[1])?;
        deliver(&mut nodes[0])?;
        assert!(rx_membership.try_recv().is_err());

        // promotion by meta
        let config = partition(2, 0, &[1], &[]);
        for node in nodes.iter_mut() {
            node.0.update_configuration(config.clone())?;
        }
        assert_eq!(nodes[1].0.status(), PartitionStatus::Secondary);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn learner_prepare_before_log_result() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-8";
        let (mut nodes, _) = setup_group(dir, &[0, 1], "").await?;
        let config = partition(1, 0, &[], &[1]);
        for node in nodes.iter_mut() {
            node.0.update_configuration(config.clone())?;
        }

        nodes[0].0.client_write(write("a"))?;
        nodes[0].0.poll_log().await?;
        assert_eq!(nodes[0].0.last_committed_decree(), 1);
        nodes[0].0.client_write(write("b"))?;

        // decree 2 claims decree 1 committed before the learner logged it
        assert_eq!(deliver(&mut nodes[1])?, 2);
        assert_eq!(nodes[1].0.status(), PartitionStatus::PotentialSecondary);
        assert_eq!(nodes[1].0.last_committed_decree(), 0);
        assert_eq!(nodes[1].0.max_decree(), 2);

        nodes[1].0.poll_log().await?;
        assert_eq!(nodes[1].0.last_committed_decree(), 1);
        nodes[1].0.poll_log().await?;
        assert_eq!(nodes[1].0.last_committed_decree(), 1);
        nodes[1].0.poll_exec().await?;
        assert_eq!(nodes[1].0.app_committed_decree(), 1);
        assert!(nodes[1].0.failure().is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn group_check_round_cancellation() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-9";
        let (mut nodes, mut rx_membership) =
            setup_group(dir, &[0, 1], "").await?;
        let config = partition(1, 0, &[1], &[]);
        for node in nodes.iter_mut() {
            node.0.update_configuration(config.clone())?;
        }

        nodes[0].0.broadcast_group_check()?;
        assert_eq!(nodes[0].0.group_check_pending.len(), 1);
        let first = nodes[0].0.group_check_pending.get(&1).copied();
        nodes[0].0.broadcast_group_check()?;
        assert_eq!(nodes[0].0.group_check_pending.len(), 1);
        let second = nodes[0].0.group_check_pending.get(&1).copied();
        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);

        assert_eq!(deliver(&mut nodes[1])?, 2);

        // reply to the cancelled round is dropped
        let event = nodes[0].1.try_recv()?;
        nodes[0].0.handle_event(event)?;
        assert_eq!(nodes[0].0.group_check_pending.get(&1).copied(), second);

        let event = nodes[0].1.try_recv()?;
        nodes[0].0.handle_event(event)?;
        assert!(nodes[0].0.group_check_pending.is_empty());
        assert_eq!(nodes[0].0.status(), PartitionStatus::Primary);
        assert!(rx_membership.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn group_check_newer_ballot_steps_down() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-10";
        let (mut nodes, mut rx_membership) =
            setup_group(dir, &[0, 1], "").await?;
        nodes[0].0.update_configuration(partition(1, 0, &[1], &[]))?;
        nodes[1].0.update_configuration(partition(2, 1, &[0], &[]))?;

        nodes[0].0.broadcast_group_check()?;
        assert_eq!(deliver(&mut nodes[1])?, 1);
        assert_eq!(nodes[1].0.status(), PartitionStatus::Primary);
        assert_eq!(deliver(&mut nodes[0])?, 1);
        assert_eq!(nodes[0].0.status(), PartitionStatus::Inactive);
        assert_eq!(nodes[0].0.ballot(), 1);
        assert!(nodes[0].0.group_check_pending.is_empty());
        assert!(rx_membership.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_replays_and_reconciles() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-5";
        let (mut nodes, _) = setup_group(dir, &[0], "").await?;
        nodes[0].0.update_configuration(partition(1, 0, &[], &[]))?;
        for s in ["a", "b", "c"] {
            nodes[0].0.client_write(write(s))?;
            nodes[0].0.poll_log().await?;
        }
        assert_eq!(nodes[0].0.last_committed_decree(), 3);
        drop(nodes);

        let (transport, _rx) = ChannelTransport::new_group(&[0]).remove(0);
        let mut replica = Replica::new_and_setup(
            0,
            test_pid(),
            Some(config_str(dir, 0, "").as_str()),
            Box::new(MemStorage::new()),
            Box::new(transport),
            Box::new(ChannelMembership::new().0),
        )
        .await?;
        assert_eq!(replica.status(), PartitionStatus::Inactive);
        assert_eq!(replica.ballot(), 1);
        assert_eq!(replica.max_decree(), 3);
        assert_eq!(replica.last_committed_decree(), 2);
        for _ in 0..2 {
            replica.poll_exec().await?;
        }
        assert_eq!(replica.app_committed_decree(), 2);

        // new primary term re-prepares the uncommitted tail
        replica.update_configuration(partition(2, 0, &[], &[]))?;
        let mu = replica
            .prepare_list
            .get_mutation_by_decree(3)
            .cloned()
            .ok_or(ReplogError::msg("decree 3 missing"))?;
        assert_eq!(mu.ballot(), 2);
        assert_eq!(mu.data.updates, write("c"));
        replica.poll_log().await?;
        assert_eq!(replica.last_committed_decree(), 3);
        replica.poll_exec().await?;
        assert_eq!(replica.app_committed_decree(), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_primary_empty_write() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-6";
        let (mut nodes, _) =
            setup_group(dir, &[0], "group_check_interval_ms = 50").await?;
        nodes[0].0.update_configuration(partition(1, 0, &[], &[]))?;
        assert_eq!(nodes[0].0.max_decree(), 0);
        time::sleep(Duration::from_millis(80)).await;
        nodes[0].0.broadcast_group_check()?;
        let mu = nodes[0]
            .0
            .prepare_list
            .get_mutation_by_decree(1)
            .cloned()
            .ok_or(ReplogError::msg("no empty write"))?;
        assert!(mu.is_empty_write());

        // nothing more while recently active
        nodes[0].0.broadcast_group_check()?;
        assert_eq!(nodes[0].0.max_decree(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_loop_serves_and_terminates() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-replica-7";
        scratch_dir(dir)?;
        let (transport, rx_event) = ChannelTransport::new_group(&[0]).remove(0);
        let tx_event = transport
            .sender(0)
            .ok_or(ReplogError::msg("no own sender"))?;
        let mut replica = Replica::new_and_setup(
            0,
            test_pid(),
            Some(config_str(dir, 0, "").as_str()),
            Box::new(MemStorage::new()),
            Box::new(transport),
            Box::new(ChannelMembership::new().0),
        )
        .await?;
        let (tx_term, rx_term) = watch::channel(false);
        let runner = tokio::spawn(async move {
            let res = replica.run(rx_event, rx_term).await;
            (replica, res)
        });

        tx_event.send(ReplicaEvent::ConfigUpdate {
            config: partition(1, 0, &[], &[]),
        })?;
        let (tx_reply, rx_reply) = oneshot::channel();
        tx_event.send(ReplicaEvent::ClientWrite {
            updates: write("x"),
            tx_reply: Some(tx_reply),
        })?;
        assert_eq!(rx_reply.await.ok(), Some(ErrorCode::Ok));
        time::sleep(Duration::from_millis(100)).await;

        tx_term.send(true)?;
        let (replica, res) = runner
            .await
            .map_err(|e| ReplogError::msg(e.to_string()))?;
        res?;
        assert_eq!(replica.last_committed_decree(), 1);
        assert_eq!(replica.app_committed_decree(), 1);
        Ok(())
    }
}
