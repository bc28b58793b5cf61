//! Decree-indexed bounded window of mutations.

use std::collections::VecDeque;

use super::{Decree, MutationPtr};
use crate::utils::ErrorCode;

/// Sliding window holding mutations `min_decree()..=max_decree()`, at most
/// `capacity()` decrees wide. Slots for decrees not yet received are `None`.
#[derive(Debug)]
pub struct MutationCache {
    /// Slot `i` holds decree `start_decree + i`.
    window: VecDeque<Option<MutationPtr>>,

    /// Decree of the first slot; when the window is empty, the decree the
    /// next slot would take.
    start_decree: Decree,

    /// Maximum window width in decrees.
    max_count: usize,
}

impl MutationCache {
    /// Creates an empty window positioned right after `init_decree`.
    pub fn new(init_decree: Decree, max_count: usize) -> Self {
        MutationCache {
            window: VecDeque::with_capacity(max_count),
            start_decree: init_decree + 1,
            max_count,
        }
    }

    /// Drops every cached mutation and repositions the window right after
    /// `init_decree`.
    pub fn reset(&mut self, init_decree: Decree) {
        self.window.clear();
        self.start_decree = init_decree + 1;
    }

    /// Inserts a mutation at its decree slot, growing the window on either
    /// end. Returns `CapacityExceeded` if the window would become wider than
    /// its capacity, and `VersionOutdated` if the slot already holds a
    /// mutation with a higher ballot.
    pub fn put(&mut self, mu: MutationPtr) -> ErrorCode {
        let d = mu.decree();

        if self.window.is_empty() {
            self.start_decree = d;
            self.window.push_back(Some(mu));
            return ErrorCode::Ok;
        }

        if d < self.start_decree {
            let delta = (self.start_decree - d) as usize;
            if self.window.len() + delta > self.max_count {
                return ErrorCode::CapacityExceeded;
            }
            for _ in 1..delta {
                self.window.push_front(None);
            }
            self.window.push_front(Some(mu));
            self.start_decree = d;
        } else if d > self.max_decree() {
            let delta = (d - self.max_decree()) as usize;
            if self.window.len() + delta > self.max_count {
                return ErrorCode::CapacityExceeded;
            }
            for _ in 1..delta {
                self.window.push_back(None);
            }
            self.window.push_back(Some(mu));
        } else {
            let slot = &mut self.window[(d - self.start_decree) as usize];
            if let Some(old) = slot {
                if old.ballot() > mu.ballot() {
                    return ErrorCode::VersionOutdated;
                }
            }
            *slot = Some(mu);
        }

        ErrorCode::Ok
    }

    /// Removes the lowest slot of the window, returning its mutation if the
    /// slot was filled.
    pub fn pop_min(&mut self) -> Option<MutationPtr> {
        let front = self.window.pop_front()?;
        self.start_decree += 1;
        front
    }

    /// Looks up the mutation cached for decree `d`.
    pub fn get_mutation_by_decree(&self, d: Decree) -> Option<&MutationPtr> {
        if d < self.start_decree || d > self.max_decree() {
            return None;
        }
        self.window[(d - self.start_decree) as usize].as_ref()
    }

    #[inline]
    pub fn min_decree(&self) -> Decree {
        self.start_decree
    }

    #[inline]
    pub fn max_decree(&self) -> Decree {
        self.start_decree + self.window.len() as Decree - 1
    }

    /// Width of the window in decrees, holes included.
    #[inline]
    pub fn count(&self) -> usize {
        self.window.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_count
    }
}
