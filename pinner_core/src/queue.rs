//! Storage contracts for the pin manager.
//!
//! Two seams back the scheduler: a durable FIFO queue of not-yet-dispatched
//! operations, and a persistent set of claimed operation keys that suppresses
//! redundant enqueues. Implementations may use embedded databases, plain
//! memory, etc.; `pinner_queue_redb` is the production backend and
//! `pinner_queue_memory` the test/local one.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;

use crate::op::{PinKey, PinningOperation};

pub type QueueResult<T> = anyhow::Result<T>;

/// Durable FIFO queue of pinning operations.
///
/// Survives restart with the full backlog of not-yet-dispatched operations,
/// preserving enqueue order. Entries are removed when popped (commit-on-pop):
/// an operation handed out by [`next`](PinQueue::next) is gone from the store
/// whether or not it ever completes.
#[async_trait]
pub trait PinQueue: Send + Sync + fmt::Debug + 'static {
    /// Persists `op` at the tail. Returns only after durability is ensured;
    /// failure is surfaced to the caller.
    async fn enqueue(&self, op: &PinningOperation) -> QueueResult<()>;

    /// Removes and returns the head, or `None` if the queue is empty.
    /// Does not block waiting for entries.
    async fn next(&self) -> QueueResult<Option<PinningOperation>>;

    /// Count of currently persisted entries.
    async fn len(&self) -> QueueResult<u64>;

    /// Keys of all persisted entries, in queue order.
    ///
    /// Used once at startup to reconcile the duplicate guard against the
    /// replayed backlog; see [`DuplicateGuard::retain_only`].
    async fn replay_keys(&self) -> QueueResult<Vec<PinKey>>;

    /// Flushes and releases the underlying store.
    async fn close(&self) -> QueueResult<()>;
}

/// Persistent one-shot gate over operation keys.
///
/// `try_claim` is an atomic test-and-set: the first caller wins, and the key
/// stays claimed until [`release`](DuplicateGuard::release). The manager
/// claims a key when it accepts an operation into the durable queue and
/// releases it on terminal completion, so re-adds of a tracked operation
/// become no-ops.
#[async_trait]
pub trait DuplicateGuard: Send + Sync + fmt::Debug + 'static {
    /// Claims `key`. Returns `true` iff the key was previously absent.
    async fn try_claim(&self, key: PinKey) -> QueueResult<bool>;

    /// Removes the claim on `key`. Missing keys are tolerated.
    async fn release(&self, key: PinKey) -> QueueResult<()>;

    /// Count of currently claimed keys.
    async fn len(&self) -> QueueResult<u64>;

    /// Drops every claim whose key is not in `live`.
    ///
    /// Run once at startup against the replayed queue keys: claims without a
    /// surviving queue entry belonged to operations that were popped but
    /// never completed before a crash, and would otherwise block re-adds of
    /// those pins forever.
    async fn retain_only(&self, live: &HashSet<PinKey>) -> QueueResult<()>;

    /// Flushes and releases the underlying store.
    async fn close(&self) -> QueueResult<()>;
}
