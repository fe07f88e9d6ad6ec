//! Test utilities for queue backends and for the manager's seams.
//!
//! This module provides a conformance suite that can be run against any
//! `PinQueue`/`DuplicateGuard` pair to verify the storage contracts, plus
//! counting/recording stubs for the executor and status sink.
//!
//! # Usage
//!
//! In your backend crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! pinner_core = { workspace = true, features = ["testutil"] }
//! ```
//!
//! In your test file:
//!
//! ```ignore
//! use pinner_core::testutil::QueueTests;
//!
//! #[tokio::test]
//! async fn conformance() {
//!     let queue = MyQueue::open(...)?;
//!     let guard = MyGuard::open(...)?;
//!     QueueTests::new(&queue, &guard).run_all().await.unwrap();
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::exec::{PinExecutor, PinStatusSink, ProgressFn};
use crate::hash::Hash;
use crate::op::{PinKey, PinningOperation};
use crate::queue::{DuplicateGuard, PinQueue, QueueResult};
use crate::status::PinStatus;

/// Conformance suite for the storage contracts.
///
/// Expects freshly opened, empty stores; the suite leaves them empty again
/// on success.
pub struct QueueTests<'a, Q, G> {
    queue: &'a Q,
    guard: &'a G,
}

impl<'a, Q: PinQueue, G: DuplicateGuard> QueueTests<'a, Q, G> {
    pub fn new(queue: &'a Q, guard: &'a G) -> Self {
        Self { queue, guard }
    }

    fn op(&self, user_id: u64, cont_id: u64) -> PinningOperation {
        let name = format!("test-{user_id}-{cont_id}");
        PinningOperation::new(user_id, cont_id, Hash::new(name.as_bytes()), name)
    }

    /// Run all tests.
    pub async fn run_all(&self) -> QueueResult<()> {
        self.test_next_on_empty().await?;
        self.test_fifo_order().await?;
        self.test_len_tracks_entries().await?;
        self.test_fields_survive_queue().await?;
        self.test_replay_keys_in_order().await?;
        self.test_claim_is_one_shot().await?;
        self.test_release_is_idempotent().await?;
        self.test_retain_only().await?;
        Ok(())
    }

    /// An empty queue returns `None` without blocking.
    pub async fn test_next_on_empty(&self) -> QueueResult<()> {
        assert!(
            self.queue.next().await?.is_none(),
            "empty queue should yield None"
        );
        assert_eq!(self.queue.len().await?, 0, "empty queue should have len 0");
        Ok(())
    }

    /// Entries come back in enqueue order.
    pub async fn test_fifo_order(&self) -> QueueResult<()> {
        for cont in 0..5u64 {
            self.queue.enqueue(&self.op(1, cont)).await?;
        }
        for cont in 0..5u64 {
            let popped = self
                .queue
                .next()
                .await?
                .expect("queue should hold an entry");
            assert_eq!(
                popped.cont_id, cont,
                "entries must pop in enqueue order (FIFO)"
            );
        }
        assert!(self.queue.next().await?.is_none(), "queue should be drained");
        Ok(())
    }

    /// Length counts persisted entries only.
    pub async fn test_len_tracks_entries(&self) -> QueueResult<()> {
        assert_eq!(self.queue.len().await?, 0);
        self.queue.enqueue(&self.op(2, 10)).await?;
        self.queue.enqueue(&self.op(2, 11)).await?;
        assert_eq!(self.queue.len().await?, 2, "len should count both entries");
        self.queue.next().await?;
        assert_eq!(self.queue.len().await?, 1, "pop should shrink len");
        self.queue.next().await?;
        assert_eq!(self.queue.len().await?, 0);
        Ok(())
    }

    /// Every field survives a trip through the queue.
    pub async fn test_fields_survive_queue(&self) -> QueueResult<()> {
        let op = self
            .op(9, 99)
            .with_peers(vec!["/dns4/gateway.example/tcp/4001".to_string()])
            .with_skip_limiter(true)
            .with_replace(42);
        self.queue.enqueue(&op).await?;
        let popped = self
            .queue
            .next()
            .await?
            .expect("queue should hold the entry");
        assert_eq!(popped.key(), op.key());
        assert_eq!(popped.obj, op.obj, "obj hash must survive the queue");
        assert_eq!(popped.name, op.name);
        assert_eq!(popped.peers, op.peers);
        assert_eq!(popped.status, PinStatus::Queued);
        assert!(popped.skip_limiter);
        assert_eq!(popped.replace, Some(42));
        assert_eq!(popped.created_at, op.created_at);
        Ok(())
    }

    /// `replay_keys` lists the keys of persisted entries in queue order.
    pub async fn test_replay_keys_in_order(&self) -> QueueResult<()> {
        let keys = [PinKey::new(1, 100), PinKey::new(2, 200), PinKey::new(1, 101)];
        for key in keys {
            self.queue.enqueue(&self.op(key.user_id, key.cont_id)).await?;
        }
        assert_eq!(
            self.queue.replay_keys().await?,
            keys.to_vec(),
            "replay_keys must preserve queue order"
        );
        while self.queue.next().await?.is_some() {}
        assert!(self.queue.replay_keys().await?.is_empty());
        Ok(())
    }

    /// The first claim wins; the second loses until release.
    pub async fn test_claim_is_one_shot(&self) -> QueueResult<()> {
        let key = PinKey::new(5, 50);
        assert!(
            self.guard.try_claim(key).await?,
            "first claim should succeed"
        );
        assert!(
            !self.guard.try_claim(key).await?,
            "second claim should fail while held"
        );
        assert_eq!(self.guard.len().await?, 1);
        self.guard.release(key).await?;
        assert!(
            self.guard.try_claim(key).await?,
            "claim should succeed again after release"
        );
        self.guard.release(key).await?;
        Ok(())
    }

    /// Releasing an unclaimed key is a no-op.
    pub async fn test_release_is_idempotent(&self) -> QueueResult<()> {
        let key = PinKey::new(6, 60);
        self.guard.release(key).await?;
        self.guard.try_claim(key).await?;
        self.guard.release(key).await?;
        self.guard.release(key).await?;
        assert_eq!(self.guard.len().await?, 0);
        Ok(())
    }

    /// `retain_only` drops exactly the claims outside the live set.
    pub async fn test_retain_only(&self) -> QueueResult<()> {
        let live_key = PinKey::new(7, 70);
        let stale_key = PinKey::new(7, 71);
        self.guard.try_claim(live_key).await?;
        self.guard.try_claim(stale_key).await?;

        let live: HashSet<PinKey> = [live_key].into_iter().collect();
        self.guard.retain_only(&live).await?;

        assert!(
            !self.guard.try_claim(live_key).await?,
            "live claim must survive retain_only"
        );
        assert!(
            self.guard.try_claim(stale_key).await?,
            "stale claim must be dropped by retain_only"
        );
        self.guard.release(live_key).await?;
        self.guard.release(stale_key).await?;
        Ok(())
    }
}

/// Executor stub that records every invocation.
///
/// Counts calls, remembers dispatch order, and tracks a per-user concurrency
/// high-water mark. An optional hold keeps each call running for a while so
/// tests can create overlap windows; the hold is cancelled promptly on
/// shutdown.
#[derive(Debug, Default)]
pub struct CountingExecutor {
    hold: Option<Duration>,
    fail: bool,
    count: AtomicUsize,
    order: Mutex<Vec<PinKey>>,
    active: Mutex<HashMap<u64, usize>>,
    high_water: Mutex<HashMap<u64, usize>>,
}

impl CountingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep each call running for `hold` before returning.
    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }

    /// Make every call return an error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Number of completed invocations.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Keys in the order they were dispatched.
    pub fn dispatch_order(&self) -> Vec<PinKey> {
        self.order.lock().unwrap().clone()
    }

    /// Highest number of concurrently running calls observed for `user_id`.
    pub fn high_water(&self, user_id: u64) -> usize {
        self.high_water
            .lock()
            .unwrap()
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PinExecutor for CountingExecutor {
    async fn pin(
        &self,
        cancel: CancellationToken,
        op: &PinningOperation,
        progress: ProgressFn,
    ) -> anyhow::Result<()> {
        {
            let mut active = self.active.lock().unwrap();
            let running = active.entry(op.user_id).or_insert(0);
            *running += 1;
            let mut high = self.high_water.lock().unwrap();
            let mark = high.entry(op.user_id).or_insert(0);
            *mark = (*mark).max(*running);
        }
        self.order.lock().unwrap().push(op.key());
        progress(1);

        let mut cancelled = false;
        if let Some(hold) = self.hold {
            tokio::select! {
                _ = tokio::time::sleep(hold) => {}
                _ = cancel.cancelled() => cancelled = true,
            }
        }

        {
            let mut active = self.active.lock().unwrap();
            if let Some(running) = active.get_mut(&op.user_id) {
                *running -= 1;
            }
        }

        if cancelled {
            anyhow::bail!("cancelled while pinning {}", op.key());
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("refusing to pin {}", op.key());
        }
        Ok(())
    }
}

/// Sink stub that records every transition and progress report.
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    updates: Mutex<Vec<(u64, PinStatus)>>,
    progress: Mutex<Vec<(u64, u64)>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(cont_id, status)` transitions, in arrival order.
    pub fn updates(&self) -> Vec<(u64, PinStatus)> {
        self.updates.lock().unwrap().clone()
    }

    /// Transitions observed for one content id.
    pub fn statuses_for(&self, cont_id: u64) -> Vec<PinStatus> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(cont, _)| *cont == cont_id)
            .map(|(_, status)| *status)
            .collect()
    }

    /// All `(cont_id, blocks)` progress reports.
    pub fn progress_reports(&self) -> Vec<(u64, u64)> {
        self.progress.lock().unwrap().clone()
    }
}

impl PinStatusSink for RecordingStatusSink {
    fn pin_status_update(
        &self,
        cont_id: u64,
        _location: &str,
        status: PinStatus,
    ) -> anyhow::Result<()> {
        self.updates.lock().unwrap().push((cont_id, status));
        Ok(())
    }

    fn pin_progress(&self, cont_id: u64, _location: &str, blocks: u64) {
        self.progress.lock().unwrap().push((cont_id, blocks));
    }
}
