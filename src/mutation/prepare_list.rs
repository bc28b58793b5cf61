//! Prepare list: the decree window plus the per-role commit state machine.

use super::{Ballot, Decree, MutationCache, MutationPtr};
use crate::server::PartitionStatus;
use crate::utils::{ErrorCode, ReplogError};

/// Callback invoked exactly once per committed mutation, in decree order.
pub type Committer = Box<dyn FnMut(&MutationPtr) + Send>;

/// How far a commit request may go.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommitType {
    /// Every decree up to the target must be present and logged; anything
    /// else is an invariant violation.
    ToDecreeHard,

    /// Commit up to the target, stopping at the first mutation that is not
    /// ready for commit.
    ToDecreeSoft,

    /// Only when the target is the next decree to commit: commit as many
    /// contiguous ready mutations as available from there.
    AllReady,
}

/// Prepared-but-not-committed mutations of one partition, and the
/// `last_committed_decree` they are committed against.
pub struct PrepareList {
    /// Log prefix.
    name: String,

    /// Underlying decree window.
    cache: MutationCache,

    /// Highest decree handed to the committer.
    last_committed_decree: Decree,

    /// Committed mutations go here.
    committer: Committer,
}

impl PrepareList {
    /// Creates an empty prepare list whose committed horizon is
    /// `init_decree`.
    pub fn new(
        name: impl ToString,
        init_decree: Decree,
        max_count: usize,
        committer: Committer,
    ) -> Self {
        PrepareList {
            name: name.to_string(),
            cache: MutationCache::new(init_decree, max_count),
            last_committed_decree: init_decree,
            committer,
        }
    }

    #[inline]
    pub fn last_committed_decree(&self) -> Decree {
        self.last_committed_decree
    }

    #[inline]
    pub fn min_decree(&self) -> Decree {
        self.cache.min_decree()
    }

    #[inline]
    pub fn max_decree(&self) -> Decree {
        self.cache.max_decree()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.cache.count()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    #[inline]
    pub fn get_mutation_by_decree(&self, d: Decree) -> Option<&MutationPtr> {
        self.cache.get_mutation_by_decree(d)
    }

    /// Drops the whole window and jumps the committed horizon to
    /// `init_decree` without committing anything.
    pub fn reset(&mut self, init_decree: Decree) {
        self.last_committed_decree = init_decree;
        self.cache.reset(init_decree);
    }

    /// Discards every cached mutation at or below `init_decree` and moves the
    /// committed horizon there; used when a durable baseline (checkpoint or
    /// learned state) supersedes those decrees.
    ///
    /// This repositions the window and is not a commit: nothing reaches the
    /// committer, and `last_committed_decree` may move backward (a learner
    /// that reset to the primary's horizon truncates back to what its
    /// storage engine actually holds).
    pub fn truncate(&mut self, init_decree: Decree) {
        while self.cache.min_decree() <= init_decree && self.cache.count() > 0
        {
            self.cache.pop_min();
        }
        if self.cache.count() == 0 {
            self.cache.reset(init_decree);
        }
        self.last_committed_decree = init_decree;
    }

    /// Pops committed slots off the low end until decree `d` fits in the
    /// window. Uncommitted slots are never evicted.
    fn evict_committed_for(&mut self, d: Decree) {
        while d - self.cache.min_decree() >= self.cache.capacity() as Decree
            && self.last_committed_decree > self.cache.min_decree()
        {
            self.cache.pop_min();
        }
    }

    /// Inserts a prepared mutation, first catching up commits as the given
    /// role requires. Returns the insertion outcome; `Err` means an invariant
    /// was broken upstream.
    pub fn prepare(
        &mut self,
        mu: MutationPtr,
        status: PartitionStatus,
    ) -> Result<ErrorCode, ReplogError> {
        let d = mu.decree();
        if d <= self.last_committed_decree {
            return logged_err!(
                self.name;
                "prepare of already committed mutation {}: decree {} <= last_committed_decree {}",
                mu.name(), d, self.last_committed_decree
            );
        }

        match status {
            PartitionStatus::Primary => {}

            PartitionStatus::Secondary => {
                // everything the primary says is committed must be ready here
                self.commit(mu.last_committed_decree(), CommitType::ToDecreeHard)?;
            }

            PartitionStatus::PotentialSecondary | PartitionStatus::Inactive => {
                let horizon = mu.last_committed_decree();
                if horizon > self.cache.max_decree() {
                    // too far behind to catch up from the window
                    pf_debug!(
                        self.name;
                        "reset prepare list to {} on {} (max_decree {})",
                        horizon, mu.name(), self.cache.max_decree()
                    );
                    self.reset(horizon);
                } else if horizon > self.last_committed_decree {
                    // the primary does not wait for learners to log, so a
                    // learner only commits what it has logged so far
                    let ct = if status == PartitionStatus::PotentialSecondary {
                        CommitType::ToDecreeSoft
                    } else {
                        CommitType::ToDecreeHard
                    };
                    self.commit(horizon, ct)?;
                }
            }

            PartitionStatus::Error => {
                return logged_err!(
                    self.name;
                    "prepare of {} in invalid status {:?}",
                    mu.name(), status
                );
            }
        }

        self.evict_committed_for(d);
        let name = mu.name().to_string();
        let err = self.cache.put(mu);
        if !err.is_ok() {
            pf_warn!(
                self.name;
                "put {} into prepare list failed: {} (window [{}, {}], capacity {}, last_committed {})",
                name, err, self.cache.min_decree(), self.cache.max_decree(),
                self.cache.capacity(), self.last_committed_decree
            );
        }
        Ok(err)
    }

    /// Commits in decree order according to `ct`. Returns whether the
    /// committed horizon advanced (for `ToDecreeHard`, whether the target was
    /// above it).
    pub fn commit(
        &mut self,
        d: Decree,
        ct: CommitType,
    ) -> Result<bool, ReplogError> {
        if d <= self.last_committed_decree {
            return Ok(false);
        }

        let mut last_bt: Ballot = 0;
        match ct {
            CommitType::ToDecreeHard => {
                for d0 in (self.last_committed_decree + 1)..=d {
                    let mu = match self.cache.get_mutation_by_decree(d0) {
                        Some(mu) => mu.clone(),
                        None => {
                            return logged_err!(
                                self.name;
                                "mutation {} is missing in prepare list: commit to {}, last_committed_decree {}",
                                d0, d, self.last_committed_decree
                            );
                        }
                    };
                    if !mu.is_logged() {
                        return logged_err!(
                            self.name;
                            "mutation {} not logged when committing to {}: log_offset {}",
                            mu.name(), d, mu.log_offset()
                        );
                    }
                    if mu.ballot() < last_bt {
                        return logged_err!(
                            self.name;
                            "ballot regression at decree {}: ballot {} < previous {}",
                            d0, mu.ballot(), last_bt
                        );
                    }

                    self.last_committed_decree += 1;
                    last_bt = mu.ballot();
                    (self.committer)(&mu);
                }
                Ok(true)
            }

            CommitType::ToDecreeSoft => {
                let mut count = 0;
                for d0 in (self.last_committed_decree + 1)..=d {
                    match self.cache.get_mutation_by_decree(d0) {
                        Some(mu)
                            if mu.is_ready_for_commit()
                                && mu.ballot() >= last_bt =>
                        {
                            let mu = mu.clone();
                            self.last_committed_decree += 1;
                            last_bt = mu.ballot();
                            (self.committer)(&mu);
                            count += 1;
                        }
                        _ => break,
                    }
                }
                Ok(count > 0)
            }

            CommitType::AllReady => {
                if d != self.last_committed_decree + 1 {
                    return Ok(false);
                }

                let mut count = 0;
                while let Some(mu) = self
                    .cache
                    .get_mutation_by_decree(self.last_committed_decree + 1)
                {
                    if !mu.is_ready_for_commit() || mu.ballot() < last_bt {
                        break;
                    }
                    let mu = mu.clone();
                    self.last_committed_decree += 1;
                    last_bt = mu.ballot();
                    (self.committer)(&mu);
                    count += 1;
                }
                Ok(count > 0)
            }
        }
    }
}
