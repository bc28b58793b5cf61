//! Replica -- state machine execution and checkpointing.

use super::*;

// Replica state machine execution
impl Replica {
    /// Submits every mutation committed since the last call.
    pub(super) fn drain_committed(&mut self) -> Result<(), ReplogError> {
        while let Ok(mu) = self.rx_committed.try_recv() {
            self.execute_mutation(mu)?;
        }
        Ok(())
    }

    /// Hands a committed mutation to the state machine. Members in the group
    /// must apply without gaps; inactive replicas and learners skip what the
    /// engine already has and what learning will bring.
    fn execute_mutation(&mut self, mu: MutationPtr) -> Result<(), ReplogError> {
        let decree = mu.decree();
        match self.status {
            PartitionStatus::Primary | PartitionStatus::Secondary => {
                if decree != self.app_submitted_decree + 1 {
                    return logged_err!(
                        self.name;
                        "execution gap at {} ({:?}): last submitted decree {}",
                        mu.name(), self.status, self.app_submitted_decree
                    );
                }
            }
            PartitionStatus::Inactive | PartitionStatus::PotentialSecondary => {
                if decree != self.app_submitted_decree + 1 {
                    pf_debug!(
                        self.name;
                        "skipping execution of {}: last submitted decree {}",
                        mu.name(), self.app_submitted_decree
                    );
                    return Ok(());
                }
            }
            PartitionStatus::Error => return Ok(()),
        }

        self.state_machine.submit_action(
            self.next_exec_action,
            ExecAction::Apply { mutation: mu },
        )?;
        self.next_exec_action += 1;
        self.app_submitted_decree = decree;
        Ok(())
    }

    /// Handler of state machine exec result chan recv.
    pub(super) async fn handle_exec_result(
        &mut self,
        action_id: ExecActionId,
        exec_result: ExecResult,
    ) -> Result<(), ReplogError> {
        match exec_result {
            ExecResult::Applied { decree } => {
                self.app_committed_decree =
                    cmp::max(self.app_committed_decree, decree);
                Ok(())
            }

            ExecResult::ApplyFailed { decree, reason } => {
                logged_err!(
                    self.name;
                    "apply of decree {} (action {}) failed: {}",
                    decree, action_id, reason
                )
            }

            ExecResult::Checkpointed { durable_decree } => {
                self.app_durable_decree =
                    cmp::max(self.app_durable_decree, durable_decree);
                let removed =
                    self.log.garbage_collect(self.app_durable_decree).await?;
                pf_info!(
                    self.name;
                    "checkpointed at decree {}, removed {} log files",
                    durable_decree, removed
                );
                Ok(())
            }

            ExecResult::CheckpointFailed { reason } => {
                pf_warn!(self.name; "checkpoint failed: {}", reason);
                Ok(())
            }
        }
    }

    /// Asks the state machine to checkpoint into the configured directory.
    pub fn trigger_checkpoint(&mut self) -> Result<(), ReplogError> {
        if self.status == PartitionStatus::Error {
            return Ok(());
        }
        self.state_machine.submit_action(
            self.next_exec_action,
            ExecAction::Checkpoint {
                dir: PathBuf::from(&self.config.checkpoint_dir),
            },
        )?;
        self.next_exec_action += 1;
        Ok(())
    }
}

#[cfg(test)]
mod execution_tests {
    use super::*;
    use crate::server::{ChannelMembership, ChannelTransport, MemStorage};
    use std::path::Path;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn checkpoint_collects_log() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-exec-0";
        if Path::new(dir).exists() {
            std::fs::remove_dir_all(dir)?;
        }
        let config_str = format!(
            "log_dir = '{}/log'\ncheckpoint_dir = '{}/ckpt'\n\
             max_log_file_mb = 1\nmax_block_bytes = 64",
            dir, dir
        );
        let (transport, _rx) = ChannelTransport::new_group(&[0]).remove(0);
        let mut replica = Replica::new_and_setup(
            0,
            Gpid::new(1, 0),
            Some(config_str.as_str()),
            Box::new(MemStorage::new()),
            Box::new(transport),
            Box::new(ChannelMembership::new().0),
        )
        .await?;
        let mut config = PartitionConfiguration::new(Gpid::new(1, 0), 1);
        config.primary = Some(0);
        replica.update_configuration(config)?;

        let payload = vec![Bytes::from(vec![7u8; 300 * 1024])];
        for _ in 0..8 {
            replica.client_write(payload.clone())?;
            replica.poll_log().await?;
            replica.poll_exec().await?;
        }
        assert_eq!(replica.app_committed_decree(), 8);
        let files_before = replica.log.file_count();
        assert!(files_before > 1);

        replica.trigger_checkpoint()?;
        replica.poll_exec().await?;
        assert_eq!(replica.app_durable_decree(), 8);
        assert!(replica.log.file_count() < files_before);
        assert!(Path::new(dir).join("ckpt").join("checkpoint.8").exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_from_checkpoint() -> Result<(), ReplogError> {
        let dir = "/tmp/test-replog-exec-1";
        if Path::new(dir).exists() {
            std::fs::remove_dir_all(dir)?;
        }
        let config_str =
            format!("log_dir = '{}/log'\ncheckpoint_dir = '{}/ckpt'", dir, dir);
        let mut config = PartitionConfiguration::new(Gpid::new(1, 0), 1);
        config.primary = Some(0);

        let (transport, _rx) = ChannelTransport::new_group(&[0]).remove(0);
        let mut replica = Replica::new_and_setup(
            0,
            Gpid::new(1, 0),
            Some(config_str.as_str()),
            Box::new(MemStorage::new()),
            Box::new(transport),
            Box::new(ChannelMembership::new().0),
        )
        .await?;
        replica.update_configuration(config)?;
        for _ in 0..4 {
            replica.client_write(vec![Bytes::from_static(b"v")])?;
            replica.poll_log().await?;
            replica.poll_exec().await?;
        }
        replica.trigger_checkpoint()?;
        replica.poll_exec().await?;
        drop(replica);

        let engine = MemStorage::recover(&Path::new(dir).join("ckpt")).await?;
        let (transport, _rx) = ChannelTransport::new_group(&[0]).remove(0);
        let replica = Replica::new_and_setup(
            0,
            Gpid::new(1, 0),
            Some(config_str.as_str()),
            Box::new(engine),
            Box::new(transport),
            Box::new(ChannelMembership::new().0),
        )
        .await?;
        assert_eq!(replica.app_committed_decree(), 4);
        assert_eq!(replica.app_durable_decree(), 4);
        assert_eq!(replica.last_committed_decree(), 4);
        Ok(())
    }
}
