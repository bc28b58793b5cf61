//! State machine module: a storage engine owned by an executor task that
//! applies committed mutations and takes checkpoints.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::mutation::{Decree, MutationData, MutationPtr};
use crate::utils::ReplogError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs as async_fs;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

/// The apply target of committed mutations.
pub trait StorageEngine: Send + 'static {
    /// Applies a committed mutation; its decree must be exactly
    /// `last_committed_decree() + 1`.
    fn apply(&mut self, data: &MutationData) -> Result<(), ReplogError>;

    /// Decree of the last applied mutation.
    fn last_committed_decree(&self) -> Decree;

    /// Decree covered by the latest durable checkpoint.
    fn last_durable_decree(&self) -> Decree;

    /// Persists current state under `dir`. Returns the new durable decree.
    /// May block on file I/O; the executor calls it off the async workers.
    fn checkpoint(&mut self, dir: &Path) -> Result<Decree, ReplogError>;
}

/// Applied state of [`MemStorage`].
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
struct MemState {
    last_committed_decree: Decree,

    /// Client updates applied at each decree.
    applied: BTreeMap<Decree, Vec<Bytes>>,
}

/// In-memory storage engine that checkpoints to `checkpoint.{decree}` files.
#[derive(Debug, Default)]
pub struct MemStorage {
    state: MemState,
    last_durable_decree: Decree,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores from the latest checkpoint under `dir`, or starts empty if
    /// there is none.
    pub async fn recover(dir: &Path) -> Result<Self, ReplogError> {
        let mut entries = match async_fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut latest: Option<(Decree, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let decree = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("checkpoint."))
                .and_then(|d| d.parse::<Decree>().ok());
            if let Some(d) = decree {
                if latest.as_ref().map_or(true, |(ld, _)| d > *ld) {
                    latest = Some((d, entry.path()));
                }
            }
        }

        match latest {
            Some((decree, path)) => {
                let state: MemState =
                    decode_from_slice(&async_fs::read(&path).await?)?;
                if state.last_committed_decree != decree {
                    return Err(ReplogError::msg(format!(
                        "checkpoint '{}' holds decree {}",
                        path.display(),
                        state.last_committed_decree
                    )));
                }
                Ok(MemStorage {
                    state,
                    last_durable_decree: decree,
                })
            }
            None => Ok(Self::new()),
        }
    }

    /// Updates applied at the given decree.
    pub fn updates_at(&self, decree: Decree) -> Option<&[Bytes]> {
        self.state.applied.get(&decree).map(|u| u.as_slice())
    }
}

impl StorageEngine for MemStorage {
    fn apply(&mut self, data: &MutationData) -> Result<(), ReplogError> {
        let decree = data.header.decree;
        if decree != self.state.last_committed_decree + 1 {
            return Err(ReplogError::msg(format!(
                "apply decree {} after last_committed_decree {}",
                decree, self.state.last_committed_decree
            )));
        }
        self.state.applied.insert(decree, data.updates.clone());
        self.state.last_committed_decree = decree;
        Ok(())
    }

    fn last_committed_decree(&self) -> Decree {
        self.state.last_committed_decree
    }

    fn last_durable_decree(&self) -> Decree {
        self.last_durable_decree
    }

    fn checkpoint(&mut self, dir: &Path) -> Result<Decree, ReplogError> {
        fs::create_dir_all(dir)?;
        let decree = self.state.last_committed_decree;
        let path = dir.join(format!("checkpoint.{}", decree));
        let tmp = dir.join(format!("checkpoint.{}.tmp", decree));
        fs::write(&tmp, encode_to_vec(&self.state)?)?;
        fs::rename(&tmp, &path)?;
        self.last_durable_decree = decree;
        Ok(decree)
    }
}

/// Execution action ID type.
pub type ExecActionId = u64;

/// Action to the executor.
#[derive(Debug)]
pub enum ExecAction {
    /// Apply a committed mutation.
    Apply { mutation: MutationPtr },

    /// Take a checkpoint into the given directory.
    Checkpoint { dir: PathBuf },
}

/// Action result returned by the executor.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ExecResult {
    Applied { decree: Decree },
    ApplyFailed { decree: Decree, reason: String },
    Checkpointed { durable_decree: Decree },
    CheckpointFailed { reason: String },
}

/// The state machine module.
pub struct StateMachine {
    /// Log prefix.
    name: String,

    /// Engine's committed decree at setup time.
    init_committed_decree: Decree,

    /// Engine's durable decree at setup time.
    init_durable_decree: Decree,

    /// Sender side of the exec channel.
    tx_exec: mpsc::UnboundedSender<(ExecActionId, ExecAction)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(ExecActionId, ExecResult)>,

    /// Join handle of the executor task. The engine is owned by this task.
    _executor_handle: JoinHandle<()>,
}

// StateMachine public API implementation
impl StateMachine {
    /// Creates a new state machine around the given engine and spawns the
    /// executor task.
    pub async fn new_and_setup(
        name: impl ToString,
        engine: Box<dyn StorageEngine>,
    ) -> Result<Self, ReplogError> {
        let name = name.to_string();
        let init_committed_decree = engine.last_committed_decree();
        let init_durable_decree = engine.last_durable_decree();
        if init_durable_decree > init_committed_decree {
            return logged_err!(
                name;
                "engine durable decree {} beyond committed decree {}",
                init_durable_decree, init_committed_decree
            );
        }

        let (tx_exec, rx_exec) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();
        let executor_handle = tokio::spawn(Self::executor_thread(
            name.clone(),
            engine,
            rx_exec,
            tx_ack,
        ));

        Ok(StateMachine {
            name,
            init_committed_decree,
            init_durable_decree,
            tx_exec,
            rx_ack,
            _executor_handle: executor_handle,
        })
    }

    #[inline]
    pub fn init_committed_decree(&self) -> Decree {
        self.init_committed_decree
    }

    #[inline]
    pub fn init_durable_decree(&self) -> Decree {
        self.init_durable_decree
    }

    /// Submits an action by sending it to the exec channel.
    pub fn submit_action(
        &mut self,
        id: ExecActionId,
        action: ExecAction,
    ) -> Result<(), ReplogError> {
        self.tx_exec
            .send((id, action))
            .map_err(|e| ReplogError::msg(e.to_string()))
    }

    /// Waits for the next execution result by receiving from the ack
    /// channel.
    pub async fn get_result(
        &mut self,
    ) -> Result<(ExecActionId, ExecResult), ReplogError> {
        match self.rx_ack.recv().await {
            Some((id, result)) => Ok((id, result)),
            None => logged_err!(self.name; "ack channel has been closed"),
        }
    }
}

// StateMachine executor task implementation
impl StateMachine {
    /// Carries out the given action on the engine.
    fn execute(engine: &mut dyn StorageEngine, action: ExecAction) -> ExecResult {
        match action {
            ExecAction::Apply { mutation } => {
                let decree = mutation.decree();
                match engine.apply(&mutation.data) {
                    Ok(()) => ExecResult::Applied { decree },
                    Err(e) => ExecResult::ApplyFailed {
                        decree,
                        reason: e.to_string(),
                    },
                }
            }
            ExecAction::Checkpoint { dir } => match engine.checkpoint(&dir) {
                Ok(durable_decree) => ExecResult::Checkpointed { durable_decree },
                Err(e) => ExecResult::CheckpointFailed {
                    reason: e.to_string(),
                },
            },
        }
    }

    /// Executor task function.
    async fn executor_thread(
        name: String,
        mut engine: Box<dyn StorageEngine>,
        mut rx_exec: mpsc::UnboundedReceiver<(ExecActionId, ExecAction)>,
        tx_ack: mpsc::UnboundedSender<(ExecActionId, ExecResult)>,
    ) {
        pf_debug!(name; "executor thread spawned");

        while let Some((id, action)) = rx_exec.recv().await {
            let res = if let ExecAction::Checkpoint { .. } = action {
                // checkpoint file I/O goes to the blocking pool
                let checkpoint = task::spawn_blocking(move || {
                    let res = Self::execute(engine.as_mut(), action);
                    (engine, res)
                });
                match checkpoint.await {
                    Ok((returned, res)) => {
                        engine = returned;
                        res
                    }
                    Err(e) => {
                        pf_error!(name; "checkpoint task failed: {}", e);
                        break;
                    }
                }
            } else {
                Self::execute(engine.as_mut(), action)
            };
            pf_trace!(name; "executed action {}: {:?}", id, res);

            if let Err(e) = tx_ack.send((id, res)) {
                pf_error!(name; "error sending to tx_ack: {}", e);
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(name; "executor thread exitted");
    }
}

#[cfg(test)]
mod statemach_tests {
    use super::*;
    use crate::mutation::{make_test_mutation, Mutation};
    use std::sync::Arc;

    fn scratch_dir(dir: &str) -> Result<PathBuf, ReplogError> {
        if Path::new(dir).exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(PathBuf::from(dir))
    }

    #[test]
    fn apply_in_order() -> Result<(), ReplogError> {
        let mut engine = MemStorage::new();
        engine.apply(&make_test_mutation(1, 1, 0, "a"))?;
        engine.apply(&make_test_mutation(1, 2, 1, "b"))?;
        assert_eq!(engine.last_committed_decree(), 2);
        assert_eq!(
            engine.updates_at(2),
            Some(&[Bytes::from_static(b"b")][..])
        );
        assert!(engine.apply(&make_test_mutation(1, 4, 2, "d")).is_err());
        assert!(engine.apply(&make_test_mutation(1, 2, 1, "b")).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn checkpoint_and_recover() -> Result<(), ReplogError> {
        let dir = scratch_dir("/tmp/test-replog-ckpt-0")?;
        assert_eq!(MemStorage::recover(&dir).await?.last_committed_decree(), 0);

        let mut engine = MemStorage::new();
        for d in 1..=3 {
            engine.apply(&make_test_mutation(1, d, d - 1, "x"))?;
        }
        assert_eq!(engine.checkpoint(&dir)?, 3);
        engine.apply(&make_test_mutation(1, 4, 3, "y"))?;
        assert_eq!(engine.checkpoint(&dir)?, 4);
        assert_eq!(engine.last_durable_decree(), 4);

        let recovered = MemStorage::recover(&dir).await?;
        assert_eq!(recovered.last_committed_decree(), 4);
        assert_eq!(recovered.last_durable_decree(), 4);
        assert_eq!(
            recovered.updates_at(4),
            Some(&[Bytes::from_static(b"y")][..])
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn executor_results() -> Result<(), ReplogError> {
        let dir = scratch_dir("/tmp/test-replog-ckpt-1")?;
        let mut sm =
            StateMachine::new_and_setup("test", Box::new(MemStorage::new()))
                .await?;
        assert_eq!(sm.init_committed_decree(), 0);

        for d in [1, 2, 4] {
            let mu = Arc::new(Mutation::new(make_test_mutation(1, d, 0, "v")));
            sm.submit_action(d as ExecActionId, ExecAction::Apply { mutation: mu })?;
        }
        assert_eq!(sm.get_result().await?, (1, ExecResult::Applied { decree: 1 }));
        assert_eq!(sm.get_result().await?, (2, ExecResult::Applied { decree: 2 }));
        match sm.get_result().await? {
            (4, ExecResult::ApplyFailed { decree: 4, .. }) => {}
            other => panic!("unexpected {:?}", other),
        }

        sm.submit_action(9, ExecAction::Checkpoint { dir })?;
        assert_eq!(
            sm.get_result().await?,
            (9, ExecResult::Checkpointed { durable_decree: 2 })
        );
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn checkpoint_keeps_action_order() -> Result<(), ReplogError> {
        let dir = scratch_dir("/tmp/test-replog-ckpt-2")?;
        let mut sm =
            StateMachine::new_and_setup("test", Box::new(MemStorage::new()))
                .await?;

        let apply = |d: Decree| ExecAction::Apply {
            mutation: Arc::new(Mutation::new(make_test_mutation(1, d, d - 1, "v"))),
        };
        sm.submit_action(0, apply(1))?;
        sm.submit_action(1, ExecAction::Checkpoint { dir: dir.clone() })?;
        sm.submit_action(2, apply(2))?;

        // the engine comes back from the blocking pool for later actions
        assert_eq!(sm.get_result().await?, (0, ExecResult::Applied { decree: 1 }));
        assert_eq!(
            sm.get_result().await?,
            (1, ExecResult::Checkpointed { durable_decree: 1 })
        );
        assert_eq!(sm.get_result().await?, (2, ExecResult::Applied { decree: 2 }));

        let recovered = MemStorage::recover(&dir).await?;
        assert_eq!(recovered.last_durable_decree(), 1);
        Ok(())
    }
}
