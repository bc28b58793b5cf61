//! Replica -- durable logging.

use super::*;

// Replica durable logging
impl Replica {
    /// Hands everything appended so far to the logger, remembering which
    /// mutations become logged and which prepare acks wait on the write.
    pub(super) fn flush_log(
        &mut self,
        mutations: Vec<MutationPtr>,
        replies: Vec<(ReplicaId, RpcHandle, Decree)>,
    ) -> Result<(), ReplogError> {
        let id = self.next_log_action;
        if !self.log.flush(id)? {
            if mutations.is_empty() && replies.is_empty() {
                return Ok(());
            }
            return logged_err!(
                self.name;
                "nothing to flush for {} mutations",
                mutations.len()
            );
        }
        self.next_log_action += 1;
        self.pending_log
            .insert(id, PendingLog { mutations, replies });
        Ok(())
    }

    /// Handler of durable logging result chan recv.
    pub(super) fn handle_log_result(
        &mut self,
        action_id: LogActionId,
        log_result: LogResult,
    ) -> Result<(), ReplogError> {
        let pending = match self.pending_log.remove(&action_id) {
            Some(pending) => pending,
            None => {
                return logged_err!(
                    self.name;
                    "unknown log action id {}",
                    action_id
                );
            }
        };

        match log_result {
            LogResult::Written { end_offset, .. } => {
                pf_trace!(
                    self.name;
                    "logged {} mutations up to offset {}",
                    pending.mutations.len(), end_offset
                );
                for mu in &pending.mutations {
                    mu.set_logged();
                }

                match self.status {
                    PartitionStatus::Primary => {
                        for mu in &pending.mutations {
                            if mu.ballot() == self.ballot
                                && mu.is_ready_for_commit()
                            {
                                self.prepare_list
                                    .commit(mu.decree(), CommitType::AllReady)?;
                            }
                        }
                        self.drain_committed()?;
                    }
                    PartitionStatus::PotentialSecondary => {
                        self.advance_learner_commit()?;
                    }
                    _ => {}
                }

                for (to, handle, decree) in pending.replies {
                    self.reply_prepare(to, handle, decree, ErrorCode::Ok)?;
                }
                Ok(())
            }

            LogResult::Failed { decrees, reason } => {
                logged_err!(
                    self.name;
                    "log write of decrees {:?} failed: {}",
                    decrees, reason
                )
            }
        }
    }
}
