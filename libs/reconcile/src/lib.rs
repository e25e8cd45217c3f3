//! Reconciliation loop primitives.
//!
//! This library provides the small building blocks the fleet agent uses to
//! converge running backends toward a declarative specification:
//!
//! - **Keyed diffing**: split an old and a new keyed collection into the
//!   entries to remove, add and update.
//! - **Bounded waits**: poll a condition at a fixed interval until it
//!   converges, aborts, or a deadline elapses.
//!
//! # Invariants
//!
//! - Diffs are deterministic given the same inputs (keys come out ordered)
//! - Every wait is bounded by an explicit timeout
//! - A wait never sleeps past its deadline before reporting a timeout

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError<E = String> {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    /// The condition reported a terminal failure before converging.
    #[error("{0}")]
    Aborted(E),
}

impl<E> ReconcileError<E> {
    /// Returns true if the wait ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result of a single poll of a convergence condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T, E> {
    /// Current state matches desired state.
    Ready(T),

    /// Still converging, poll again after the interval.
    Pending,

    /// Diverged in a way that waiting will not fix.
    Abort(E),
}

/// Poll `check` every `interval` until it converges, aborts, or `timeout` elapses.
///
/// The deadline is checked before every poll, so a zero timeout fails without
/// polling at all.
pub async fn wait_until<T, E, F, Fut>(
    resource: impl fmt::Display,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<T, ReconcileError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Poll<T, E>>,
{
    let started = Instant::now();

    loop {
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(ReconcileError::Timeout {
                resource: resource.to_string(),
                elapsed,
            });
        }

        match check().await {
            Poll::Ready(value) => return Ok(value),
            Poll::Abort(e) => return Err(ReconcileError::Aborted(e)),
            Poll::Pending => {}
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        tokio::time::sleep(interval.min(remaining)).await;
    }
}

/// The three buckets produced by diffing two keyed collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedDiff<K: Ord> {
    /// Keys present only in the old collection.
    pub to_remove: BTreeSet<K>,

    /// Keys present only in the new collection.
    pub to_add: BTreeSet<K>,

    /// Keys present in both collections.
    pub to_update: BTreeSet<K>,
}

impl<K: Ord> KeyedDiff<K> {
    /// Returns true if the diff contains no work of any kind.
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty() && self.to_update.is_empty()
    }
}

/// Diff two key sets.
///
/// Duplicate keys within one side collapse into a single entry.
pub fn diff_keys<K, I, J>(old: I, new: J) -> KeyedDiff<K>
where
    K: Ord + Clone,
    I: IntoIterator<Item = K>,
    J: IntoIterator<Item = K>,
{
    let old: BTreeSet<K> = old.into_iter().collect();
    let new: BTreeSet<K> = new.into_iter().collect();

    KeyedDiff {
        to_remove: old.difference(&new).cloned().collect(),
        to_add: new.difference(&old).cloned().collect(),
        to_update: old.intersection(&new).cloned().collect(),
    }
}

/// Index a collection by key. Later entries win on duplicate keys.
pub fn index_by<K, V, F>(items: impl IntoIterator<Item = V>, mut key: F) -> BTreeMap<K, V>
where
    K: Ord,
    F: FnMut(&V) -> K,
{
    items.into_iter().map(|item| (key(&item), item)).collect()
}
