//! Replica -- two-phase write path.

use super::*;

// Replica prepare phase
impl Replica {
    /// Admits a client write on the primary. Returns `InvalidState` if not
    /// primary and `CapacityExceeded` if the window is full of uncommitted
    /// mutations.
    pub fn client_write(
        &mut self,
        updates: Vec<Bytes>,
    ) -> Result<ErrorCode, ReplogError> {
        if self.status != PartitionStatus::Primary {
            return Ok(ErrorCode::InvalidState);
        }

        let decree = self.prepare_list.max_decree() + 1;
        let limit = self.prepare_list.last_committed_decree()
            + self.prepare_list.capacity() as Decree;
        if decree > limit {
            pf_debug!(
                self.name;
                "rejecting write at decree {}: window full up to {}",
                decree, limit
            );
            return Ok(ErrorCode::CapacityExceeded);
        }

        self.init_prepare(decree, updates)?;
        Ok(ErrorCode::Ok)
    }

    /// Logs and prepares a mutation at `decree` under the current ballot,
    /// then sends it to all members. Secondaries must ack it before commit;
    /// learners get it without being waited on.
    pub(super) fn init_prepare(
        &mut self,
        decree: Decree,
        updates: Vec<Bytes>,
    ) -> Result<(), ReplogError> {
        let mut data = MutationData::new(
            self.pid,
            self.ballot,
            decree,
            self.prepare_list.last_committed_decree(),
            updates,
        );
        self.log.append(&mut data)?;

        let mu = Arc::new(Mutation::new(data));
        let secondaries: Vec<ReplicaId> = self
            .partition
            .secondaries
            .iter()
            .copied()
            .filter(|&node| node != self.me)
            .collect();
        mu.set_left_secondary_acks(secondaries.len());

        let err = self
            .prepare_list
            .prepare(mu.clone(), PartitionStatus::Primary)?;
        if !err.is_ok() {
            return logged_err!(
                self.name;
                "prepare of {} as primary failed: {}",
                mu.name(), err
            );
        }
        self.flush_log(vec![mu.clone()], vec![])?;
        pf_trace!(self.name; "prepared {} at log offset {}", mu.name(),
                             mu.log_offset());

        for node in secondaries {
            let msg = PeerMsg::Prepare {
                config: self.replica_config_for(PartitionStatus::Secondary, 0),
                mutation: mu.data.clone(),
            };
            match self.transport.send(node, msg) {
                Ok(handle) => {
                    self.prepare_pending.insert(handle, (node, decree));
                }
                Err(e) => {
                    pf_warn!(self.name; "error sending prepare -> {}: {}", node, e);
                    self.handle_remote_failure(node, ErrorCode::NetworkFailure);
                }
            }
        }

        let learners: Vec<(ReplicaId, u64)> = self
            .learners
            .iter()
            .map(|(&node, progress)| (node, progress.signature))
            .collect();
        for (node, signature) in learners {
            let msg = PeerMsg::Prepare {
                config: self.replica_config_for(
                    PartitionStatus::PotentialSecondary,
                    signature,
                ),
                mutation: mu.data.clone(),
            };
            if let Err(e) = self.transport.send(node, msg) {
                pf_debug!(self.name; "error sending prepare -> {}: {}", node, e);
            }
        }

        self.last_prepare_at = Instant::now();
        Ok(())
    }

    /// Handler of Prepare from the primary.
    pub(super) fn on_prepare(
        &mut self,
        from: ReplicaId,
        handle: RpcHandle,
        config: ReplicaConfiguration,
        mut data: MutationData,
    ) -> Result<(), ReplogError> {
        let decree = data.header.decree;
        pf_trace!(self.name; "received Prepare <- {} for decree {} bal {}",
                             from, decree, data.header.ballot);

        let err = self.check_incoming_config(&config)?;
        if !err.is_ok() {
            return self.reply_prepare(from, handle, decree, err);
        }
        if data.header.ballot < self.ballot {
            return self.reply_prepare(
                from,
                handle,
                decree,
                ErrorCode::VersionOutdated,
            );
        }
        if !matches!(
            self.status,
            PartitionStatus::Secondary | PartitionStatus::PotentialSecondary
        ) {
            return self.reply_prepare(
                from,
                handle,
                decree,
                ErrorCode::InvalidState,
            );
        }
        if decree <= self.prepare_list.last_committed_decree() {
            // already committed here; nothing left to make durable
            return self.reply_prepare(from, handle, decree, ErrorCode::Ok);
        }

        if self.status == PartitionStatus::PotentialSecondary {
            self.primary_committed_decree = cmp::max(
                self.primary_committed_decree,
                data.header.last_committed_decree,
            );
        }
        self.log.append(&mut data)?;
        let mu = Arc::new(Mutation::new(data));
        let err = self.prepare_list.prepare(mu.clone(), self.status)?;
        self.drain_committed()?;
        if !err.is_ok() {
            return self.reply_prepare(from, handle, decree, err);
        }

        // ack once the log write completes
        self.flush_log(vec![mu], vec![(from, handle, decree)])
    }

    /// Sends a PrepareReply carrying this replica's ballot and status.
    pub(super) fn reply_prepare(
        &mut self,
        to: ReplicaId,
        handle: RpcHandle,
        decree: Decree,
        err: ErrorCode,
    ) -> Result<(), ReplogError> {
        let msg = PeerMsg::PrepareReply {
            ballot: self.ballot,
            decree,
            err,
            status: self.status,
        };
        self.transport.reply(to, handle, msg)
    }

    /// Handler of PrepareReply from a secondary.
    pub(super) fn on_prepare_reply(
        &mut self,
        from: ReplicaId,
        handle: RpcHandle,
        ballot: Ballot,
        decree: Decree,
        err: ErrorCode,
        status: PartitionStatus,
    ) -> Result<(), ReplogError> {
        let (node, pending_decree) = match self.prepare_pending.remove(&handle)
        {
            Some(pending) => pending,
            None => return Ok(()), // cancelled, or from a learner
        };
        if node != from || pending_decree != decree {
            return logged_err!(
                self.name;
                "prepare reply <- {} for decree {} under handle {} sent to {} for {}",
                from, decree, handle, node, pending_decree
            );
        }
        if self.status != PartitionStatus::Primary {
            return Ok(());
        }

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

        let mu = match self.prepare_list.get_mutation_by_decree(decree) {
            Some(mu) if mu.ballot() == self.ballot => mu.clone(),
            _ => return Ok(()), // replaced or already evicted
        };
        if mu.ack_secondary() == 0 && mu.is_ready_for_commit() {
            self.prepare_list.commit(decree, CommitType::AllReady)?;
            self.drain_committed()?;
        }
        Ok(())
    }
}
