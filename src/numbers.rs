use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::identifier::TransactionNumber;

/// Identifies the guard (and thus the request) managing a set of numbers.
pub type GuardId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NumberError {
    #[error("Requested {requested} transaction numbers, only {available} available")]
    Exhausted { requested: usize, available: usize },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: Vec<TransactionNumber>,
    pub duplicates: Vec<TransactionNumber>,
}

/// Bookkeeping of every transaction number the server has granted.
///
/// A number is in exactly one of `available`, `managed` or `consumed`.
/// Returned numbers go back to `available`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberPool {
    available: BTreeSet<TransactionNumber>,
    managed: BTreeMap<TransactionNumber, GuardId>,
    consumed: BTreeSet<TransactionNumber>,
    next_guard: GuardId,
}

impl NumberPool {
    pub fn with_available(numbers: impl IntoIterator<Item = TransactionNumber>) -> Self {
        Self {
            available: numbers.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn available(&self) -> &BTreeSet<TransactionNumber> {
        &self.available
    }

    pub fn consumed(&self) -> &BTreeSet<TransactionNumber> {
        &self.consumed
    }

    pub fn managed_len(&self) -> usize {
        self.managed.len()
    }

    pub fn owner_of(&self, number: TransactionNumber) -> Option<GuardId> {
        self.managed.get(&number).copied()
    }

    pub fn managed_by(&self, guard: GuardId) -> Vec<TransactionNumber> {
        self.managed
            .iter()
            .filter(|(_, owner)| **owner == guard)
            .map(|(number, _)| *number)
            .collect()
    }

    pub fn is_known(&self, number: TransactionNumber) -> bool {
        self.available.contains(&number)
            || self.managed.contains_key(&number)
            || self.consumed.contains(&number)
    }

    /// Moves the `count` lowest available numbers under a fresh guard.
    pub fn reserve(
        &mut self,
        count: usize,
    ) -> Result<(GuardId, Vec<TransactionNumber>), NumberError> {
        if self.available.len() < count {
            return Err(NumberError::Exhausted {
                requested: count,
                available: self.available.len(),
            });
        }
        self.next_guard += 1;
        let guard = self.next_guard;
        let numbers: Vec<_> = self.available.iter().take(count).copied().collect();
        for number in &numbers {
            self.available.remove(number);
            self.managed.insert(*number, guard);
        }
        Ok((guard, numbers))
    }

    /// Marks the guard's numbers consumed. A second call finds nothing.
    pub fn commit(&mut self, guard: GuardId) -> Vec<TransactionNumber> {
        let numbers = self.release(guard);
        self.consumed.extend(numbers.iter().copied());
        numbers
    }

    /// Returns the guard's numbers to the available pool. A second call
    /// finds nothing.
    pub fn abort(&mut self, guard: GuardId) -> Vec<TransactionNumber> {
        let numbers = self.release(guard);
        self.available.extend(numbers.iter().copied());
        numbers
    }

    fn release(&mut self, guard: GuardId) -> Vec<TransactionNumber> {
        let numbers = self.managed_by(guard);
        for number in &numbers {
            self.managed.remove(number);
        }
        numbers
    }

    /// Adds server-granted numbers. Numbers this pool already knows about,
    /// in any state, are skipped.
    pub fn merge_issued(
        &mut self,
        numbers: impl IntoIterator<Item = TransactionNumber>,
    ) -> MergeSummary {
        let mut summary = MergeSummary::default();
        for number in numbers {
            if self.is_known(number) {
                summary.duplicates.push(number);
            } else {
                self.available.insert(number);
                summary.added.push(number);
            }
        }
        if !summary.duplicates.is_empty() {
            warn!(duplicates = ?summary.duplicates, "ignoring already issued transaction numbers");
        }
        summary
    }

    /// Copy suitable for persisting: in-flight numbers are recorded as
    /// available, since their requests do not survive a restart.
    pub fn snapshot(&self) -> NumberPool {
        let mut available = self.available.clone();
        available.extend(self.managed.keys().copied());
        NumberPool {
            available,
            managed: BTreeMap::new(),
            consumed: self.consumed.clone(),
            next_guard: self.next_guard,
        }
    }
}
