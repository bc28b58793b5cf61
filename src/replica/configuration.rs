//! Replica -- ballots, status transitions and membership.

use super::*;

// Replica configuration management
impl Replica {
    /// Applies a partition configuration from meta. A stale ballot is
    /// ignored. Returns whether ballot or status changed.
    pub fn update_configuration(
        &mut self,
        config: PartitionConfiguration,
    ) -> Result<bool, ReplogError> {
        if config.pid != self.pid {
            return logged_err!(
                self.name;
                "configuration of partition {} delivered to {}",
                config.pid, self.pid
            );
        }
        if self.status == PartitionStatus::Error {
            pf_warn!(self.name; "ignoring configuration in error status");
            return Ok(false);
        }
        if config.ballot < self.ballot {
            pf_debug!(
                self.name;
                "ignoring stale configuration: ballot {} < {}",
                config.ballot, self.ballot
            );
            return Ok(false);
        }

        let status = config.status_of(self.me);
        let unchanged = config.ballot == self.ballot
            && status == self.status
            && config.primary == self.primary;
        self.partition = config;
        if unchanged {
            if self.status == PartitionStatus::Primary {
                self.refresh_learners();
            }
            return Ok(false);
        }

        self.ballot = self.partition.ballot;
        self.primary = self.partition.primary;
        self.change_status(status)?;
        Ok(true)
    }

    /// Moves to a new status under the current ballot, dropping state tied
    /// to the old role.
    pub(super) fn change_status(
        &mut self,
        status: PartitionStatus,
    ) -> Result<(), ReplogError> {
        pf_info!(
            self.name;
            "status {:?} -> {:?} at ballot {}, last_committed_decree {}",
            self.status, status, self.ballot,
            self.prepare_list.last_committed_decree()
        );
        self.clear_primary_state();
        self.learning = None;
        self.primary_committed_decree = 0;
        self.status = status;

        if status == PartitionStatus::Primary {
            self.primary = Some(self.me);
            self.refresh_learners();
            self.reconcile_uncommitted()?;
        }
        Ok(())
    }

    /// Cancels outstanding primary requests and forgets learners.
    fn clear_primary_state(&mut self) {
        for (_, handle) in self.group_check_pending.drain() {
            self.transport.cancel(handle);
        }
        for (handle, _) in self.prepare_pending.drain() {
            self.transport.cancel(handle);
        }
        self.learners.clear();
    }

    /// Syncs learner bookkeeping with the membership, assigning a fresh
    /// signature to each newly added learner.
    pub(super) fn refresh_learners(&mut self) {
        let learners = self.partition.learners.clone();
        self.learners.retain(|node, _| learners.contains(node));
        for node in learners {
            if node == self.me || self.learners.contains_key(&node) {
                continue;
            }
            self.next_learner_signature += 1;
            let signature =
                ((self.ballot as u64) << 32) | self.next_learner_signature;
            self.learners.insert(
                node,
                LearnerProgress {
                    signature,
                    notified: false,
                },
            );
            pf_debug!(self.name; "learner {} signature {:#x}", node, signature);
        }
    }

    /// Re-prepares every uncommitted decree of the window under the current
    /// ballot; decrees never received become empty writes.
    fn reconcile_uncommitted(&mut self) -> Result<(), ReplogError> {
        let first = self.prepare_list.last_committed_decree() + 1;
        let last = self.prepare_list.max_decree();
        for d in first..=last {
            let updates = self
                .prepare_list
                .get_mutation_by_decree(d)
                .map_or(vec![], |mu| mu.data.updates.clone());
            self.init_prepare(d, updates)?;
        }
        if last >= first {
            pf_info!(
                self.name;
                "reconciled decrees {}..={} under ballot {}",
                first, last, self.ballot
            );
        }
        Ok(())
    }

    /// Adopts the role a primary assigns in a prepare or group check.
    /// Returns false if this replica cannot take that role.
    fn update_local_configuration(
        &mut self,
        config: &ReplicaConfiguration,
    ) -> Result<bool, ReplogError> {
        if config.pid != self.pid
            || config.ballot < self.ballot
            || self.status == PartitionStatus::Error
        {
            return Ok(false);
        }
        if !matches!(
            config.status,
            PartitionStatus::Secondary | PartitionStatus::PotentialSecondary
        ) {
            return Ok(false);
        }
        if config.ballot == self.ballot
            && self.status == PartitionStatus::Primary
        {
            // two primaries under one ballot
            return Ok(false);
        }

        self.ballot = config.ballot;
        self.primary = Some(config.primary);
        self.change_status(config.status)?;
        Ok(true)
    }

    /// Checks the configuration attached to a primary's request, adopting it
    /// if newer. Returns the code to reply with on refusal.
    pub(super) fn check_incoming_config(
        &mut self,
        config: &ReplicaConfiguration,
    ) -> Result<ErrorCode, ReplogError> {
        if config.ballot < self.ballot {
            pf_debug!(
                self.name;
                "stale request from {} ballot {} < {}",
                config.primary, config.ballot, self.ballot
            );
            return Ok(ErrorCode::VersionOutdated);
        }
        if config.ballot > self.ballot
            || config.status != self.status
            || self.primary != Some(config.primary)
        {
            if !self.update_local_configuration(config)? {
                pf_warn!(
                    self.name;
                    "cannot adopt {:?} at ballot {} from {} in status {:?}",
                    config.status, config.ballot, config.primary, self.status
                );
                return Ok(ErrorCode::InvalidState);
            }
        }
        Ok(ErrorCode::Ok)
    }

    /// Configuration this primary attaches to requests sent to a member.
    pub(super) fn replica_config_for(
        &self,
        status: PartitionStatus,
        learner_signature: u64,
    ) -> ReplicaConfiguration {
        ReplicaConfiguration {
            pid: self.pid,
            ballot: self.ballot,
            primary: self.me,
            status,
            learner_signature,
        }
    }

    /// Enters `Error` status after a fatal error, telling membership.
    pub(super) fn handle_local_failure(&mut self, reason: String) {
        if self.status == PartitionStatus::Error {
            return;
        }
        pf_error!(self.name; "local failure: {}", reason);
        self.clear_primary_state();
        self.learning = None;
        self.status = PartitionStatus::Error;
        self.membership.local_failure(self.pid, self.me, &reason);
        self.failure = Some(reason);
    }
}
