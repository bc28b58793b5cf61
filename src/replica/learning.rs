//! Replica -- learning from the primary's prepare list.

use super::*;

// Replica learning
impl Replica {
    /// Starts learning unless a session under the same signature is already
    /// running or done.
    pub(super) fn maybe_init_learn(
        &mut self,
        primary: ReplicaId,
        signature: u64,
    ) -> Result<(), ReplogError> {
        if let Some(session) = self.learning {
            if session.signature == signature
                && session.status != LearnerStatus::Failed
            {
                return Ok(());
            }
        }
        self.init_learn(primary, signature)
    }

    /// Asks the primary for every mutation after what the engine has.
    fn init_learn(
        &mut self,
        primary: ReplicaId,
        signature: u64,
    ) -> Result<(), ReplogError> {
        let msg = PeerMsg::Learn {
            signature,
            ballot: self.ballot,
            last_committed_decree_in_app: self.app_submitted_decree,
        };
        let handle = self.transport.send(primary, msg)?;
        self.learning = Some(LearningSession {
            signature,
            status: LearnerStatus::Learning,
            handle: Some(handle),
            target: None,
        });
        pf_info!(
            self.name;
            "learning from {} after decree {}, signature {:#x}",
            primary, self.app_submitted_decree, signature
        );
        Ok(())
    }

    /// Handler of Learn from a potential secondary.
    pub(super) fn on_learn(
        &mut self,
        from: ReplicaId,
        handle: RpcHandle,
        signature: u64,
        ballot: Ballot,
        app_decree: Decree,
    ) -> Result<(), ReplogError> {
        let mut mutations = vec![];
        let err = if self.status != PartitionStatus::Primary {
            ErrorCode::InvalidState
        } else if ballot != self.ballot {
            ErrorCode::VersionOutdated
        } else if self
            .learners
            .get(&from)
            .map_or(true, |progress| progress.signature != signature)
        {
            ErrorCode::InvalidState
        } else if app_decree < self.prepare_list.max_decree()
            && self.prepare_list.min_decree() > app_decree + 1
        {
            // needs a checkpoint to catch up
            ErrorCode::ObjectNotFound
        } else {
            for d in (app_decree + 1)..=self.prepare_list.max_decree() {
                match self.prepare_list.get_mutation_by_decree(d) {
                    Some(mu) => mutations.push(mu.data.clone()),
                    None => break,
                }
            }
            ErrorCode::Ok
        };

        pf_debug!(
            self.name;
            "learn <- {} after decree {}: {} with {} mutations",
            from, app_decree, err, mutations.len()
        );
        let msg = PeerMsg::LearnReply {
            ballot: self.ballot,
            err,
            last_committed_decree: self.prepare_list.last_committed_decree(),
            mutations,
        };
        self.transport.reply(from, handle, msg)
    }

    /// Handler of LearnReply from the primary.
    pub(super) fn on_learn_reply(
        &mut self,
        from: ReplicaId,
        handle: RpcHandle,
        ballot: Ballot,
        err: ErrorCode,
        last_committed_decree: Decree,
        mutations: Vec<MutationData>,
    ) -> Result<(), ReplogError> {
        match self.learning {
            Some(session)
                if session.handle == Some(handle)
                    && session.status == LearnerStatus::Learning => {}
            _ => return Ok(()),
        }
        if self.status != PartitionStatus::PotentialSecondary
            || ballot != self.ballot
        {
            return Ok(());
        }
        if !err.is_ok() {
            pf_warn!(self.name; "learning from {} failed: {}", from, err);
            self.set_learner_status(LearnerStatus::Failed);
            return Ok(());
        }

        // restart the window from what the engine has
        if self.prepare_list.min_decree() > self.app_submitted_decree + 1 {
            self.prepare_list.reset(self.app_submitted_decree);
        } else {
            self.prepare_list.truncate(self.app_submitted_decree);
        }
        self.primary_committed_decree =
            cmp::max(self.primary_committed_decree, last_committed_decree);

        let mut learned = vec![];
        for mut data in mutations {
            if data.header.decree <= self.prepare_list.last_committed_decree() {
                continue;
            }
            self.log.append(&mut data)?;
            let mu = Arc::new(Mutation::new(data));
            let err = self
                .prepare_list
                .prepare(mu.clone(), PartitionStatus::PotentialSecondary)?;
            if err.is_ok() {
                learned.push(mu);
            }
        }
        let cnt = learned.len();
        self.flush_log(learned, vec![])?;

        let target =
            cmp::min(last_committed_decree, self.prepare_list.max_decree());
        if let Some(session) = self.learning.as_mut() {
            session.handle = None;
            session.target = Some(target);
        }
        pf_info!(
            self.name;
            "learned {} mutations from {}, committing up to {} once logged",
            cnt, from, target
        );

        // nothing new to log means it may already be done
        self.advance_learner_commit()
    }

    /// Commits logged mutations up to the primary's committed decree, and
    /// completes learning once its target is reached.
    pub(super) fn advance_learner_commit(&mut self) -> Result<(), ReplogError> {
        let horizon = cmp::min(
            self.primary_committed_decree,
            self.prepare_list.max_decree(),
        );
        if horizon > self.prepare_list.last_committed_decree() {
            self.prepare_list.commit(horizon, CommitType::ToDecreeSoft)?;
        }
        self.drain_committed()?;

        let lcd = self.prepare_list.last_committed_decree();
        if let Some(session) = self.learning {
            if session.status == LearnerStatus::Learning
                && session.target.map_or(false, |target| lcd >= target)
            {
                self.set_learner_status(LearnerStatus::Succeeded);
                pf_info!(
                    self.name;
                    "learning succeeded at last_committed_decree {}",
                    lcd
                );
            }
        }
        Ok(())
    }

    fn set_learner_status(&mut self, status: LearnerStatus) {
        if let Some(session) = self.learning.as_mut() {
            session.status = status;
            session.handle = None;
            session.target = None;
        }
    }
}
