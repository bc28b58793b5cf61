//! Replica -- group check.

use super::*;

// Replica group check protocol
impl Replica {
    /// Starts a group check round: cancels the previous round, then checks
    /// every secondary and learner. An idle primary also issues an empty
    /// write so members' committed horizons keep moving.
    pub fn broadcast_group_check(&mut self) -> Result<(), ReplogError> {
        if self.status != PartitionStatus::Primary {
            return Ok(());
        }

        for (_, handle) in self.group_check_pending.drain() {
            self.transport.cancel(handle);
        }

        let mut targets: Vec<(ReplicaId, PartitionStatus, u64)> = self
            .partition
            .secondaries
            .iter()
            .filter(|&&node| node != self.me)
            .map(|&node| (node, PartitionStatus::Secondary, 0))
            .collect();
        targets.extend(self.learners.iter().map(|(&node, progress)| {
            (node, PartitionStatus::PotentialSecondary, progress.signature)
        }));

        let last_committed_decree = self.prepare_list.last_committed_decree();
        for (node, status, signature) in targets {
            let msg = PeerMsg::GroupCheck {
                config: self.replica_config_for(status, signature),
                last_committed_decree,
            };
            match self.transport.send(node, msg) {
                Ok(handle) => {
                    self.group_check_pending.insert(node, handle);
                }
                Err(e) => {
                    pf_warn!(self.name; "error sending group check -> {}: {}",
                                        node, e);
                    self.handle_remote_failure(
                        node,
                        ErrorCode::NetworkFailure,
                    );
                }
            }
        }
        pf_trace!(self.name; "group check at last_committed_decree {}",
                             last_committed_decree);

        let interval =
            Duration::from_millis(self.config.group_check_interval_ms);
        if !self.config.empty_write_disabled
            && self.last_prepare_at.elapsed() >= interval
        {
            let decree = self.prepare_list.max_decree() + 1;
            if decree
                <= last_committed_decree
                    + self.prepare_list.capacity() as Decree
            {
                pf_debug!(self.name; "empty write at decree {}", decree);
                self.init_prepare(decree, vec![])?;
            }
        }
        Ok(())
    }

    /// Handler of GroupCheck from the primary.
    pub(super) fn on_group_check(
        &mut self,
        from: ReplicaId,
        handle: RpcHandle,
        config: ReplicaConfiguration,
        last_committed_decree: Decree,
    ) -> Result<(), ReplogError> {
        pf_trace!(self.name; "received GroupCheck <- {} bal {} lcd {}",
                             from, config.ballot, last_committed_decree);

        let mut err = self.check_incoming_config(&config)?;
        if err.is_ok() {
            match self.status {
                PartitionStatus::Secondary => {
                    if last_committed_decree
                        > self.prepare_list.last_committed_decree()
                    {
                        self.prepare_list.commit(
                            last_committed_decree,
                            CommitType::ToDecreeHard,
                        )?;
                        self.drain_committed()?;
                    }
                }
                PartitionStatus::PotentialSecondary => {
                    self.primary_committed_decree = cmp::max(
                        self.primary_committed_decree,
                        last_committed_decree,
                    );
                    self.maybe_init_learn(from, config.learner_signature)?;
                }
                _ => err = ErrorCode::InvalidState,
            }
        }

        let (learner_signature, learner_status) = match self.learning {
            Some(session) => (session.signature, session.status),
            None => (0, LearnerStatus::Idle),
        };
        let msg = PeerMsg::GroupCheckReply {
            ballot: self.ballot,
            err,
            status: self.status,
            last_committed_decree: self.prepare_list.last_committed_decree(),
            learner_signature,
            learner_status,
        };
        self.transport.reply(from, handle, msg)
    }

    /// Handler of GroupCheckReply from a member.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn on_group_check_reply(
        &mut self,
        from: ReplicaId,
        handle: RpcHandle,
        ballot: Ballot,
        err: ErrorCode,
        status: PartitionStatus,
        last_committed_decree: Decree,
        learner_signature: u64,
        learner_status: LearnerStatus,
    ) -> Result<(), ReplogError> {
        if self.status != PartitionStatus::Primary {
            return Ok(());
        }
        match self.group_check_pending.get(&from) {
            Some(&pending) if pending == handle => {
                self.group_check_pending.remove(&from);
            }
            _ => return Ok(()), // reply to a cancelled round
        }
        pf_trace!(self.name; "received GroupCheckReply <- {} {:?} lcd {}",
                             from, status, last_committed_decree);

        if !err.is_ok() {
            if ballot > self.ballot {
                pf_warn!(
                    self.name;
                    "stepping down: {} ({:?}) is at ballot {} > {}",
                    from, status, ballot, self.ballot
                );
                return self.change_status(PartitionStatus::Inactive);
            }
            self.handle_remote_failure(from, err);
            return Ok(());
        }

        if learner_status == LearnerStatus::Succeeded {
            if let Some(progress) = self.learners.get_mut(&from) {
                if progress.signature == learner_signature
                    && !progress.notified
                {
                    progress.notified = true;
                    pf_info!(self.name; "learner {} succeeded", from);
                    self.membership
                        .learning_succeeded(self.pid, from, self.ballot);
                }
            }
        }
        Ok(())
    }

    /// Reports a member that failed a request to membership.
    pub(super) fn handle_remote_failure(
        &mut self,
        node: ReplicaId,
        err: ErrorCode,
    ) {
        pf_warn!(self.name; "remote failure of {}: {}", node, err);
        if self.status != PartitionStatus::Primary {
            return;
        }
        if let Some(handle) = self.group_check_pending.remove(&node) {
            self.transport.cancel(handle);
        }
        self.membership.remote_failure(self.pid, node, err);
    }
}
