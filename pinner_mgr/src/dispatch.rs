//! The dispatcher: single owner of all scheduling state.
//!
//! One event loop multiplexes three sources (shutdown, worker completions,
//! incoming adds) and drives every scheduling decision. No other task
//! touches the running table, the head slot, or the pending map.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use pinner_core::{PinKey, PinStatus, PinningOperation};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::manager::{AddReceiver, AddRequest, Done, PinManager};
use crate::pending::PendingQueues;
use crate::worker;

/// Scheduling state owned by the dispatcher loop.
pub(crate) struct DispatchState {
    /// The popped queue head awaiting a free worker slot. Every dispatch
    /// pass refills it from the durable queue first, so between events
    /// `head == None` implies the queue is empty; the fast-path check in
    /// `accept` depends on this.
    head: Option<PinningOperation>,
    /// Running operations per user. Skip-limiter ops are counted here too;
    /// they only bypass the cap check.
    running: HashMap<u64, usize>,
    /// Keys currently executing, to keep one key from running twice at once.
    running_keys: HashSet<PinKey>,
    pending: PendingQueues,
    /// Free worker slots; the pool size fixed at `run`.
    free_slots: usize,
}

impl DispatchState {
    fn new(workers: usize) -> Self {
        Self {
            head: None,
            running: HashMap::new(),
            running_keys: HashSet::new(),
            pending: PendingQueues::new(),
            free_slots: workers,
        }
    }

    fn is_runnable(&self, op: &PinningOperation, cap: usize) -> bool {
        let active = self.running.get(&op.user_id).copied().unwrap_or(0);
        (active < cap || op.skip_limiter) && !self.running_keys.contains(&op.key())
    }

    fn take_runnable_pending(&mut self, cap: usize) -> Option<PinningOperation> {
        let running = &self.running;
        let running_keys = &self.running_keys;
        self.pending.take_runnable(|op| {
            let active = running.get(&op.user_id).copied().unwrap_or(0);
            (active < cap || op.skip_limiter) && !running_keys.contains(&op.key())
        })
    }
}

impl PinManager {
    pub(crate) async fn run_dispatcher(
        &self,
        mut add_rx: AddReceiver,
        workers: usize,
    ) -> Result<()> {
        let inner = &self.inner;

        // Replay: reconcile the guard with the surviving backlog before
        // anything dispatches. Claims without a queue entry belonged to ops
        // that were in flight at a crash; dropping them unblocks re-adds.
        let keys = inner
            .queue
            .replay_keys()
            .await
            .context("replaying durable pin queue")?;
        let backlog = keys.len();
        let live: HashSet<PinKey> = keys.into_iter().collect();
        inner
            .guard
            .retain_only(&live)
            .await
            .context("reconciling duplicate guard")?;
        debug!("pin dispatcher starting: {backlog} replayed entries, {workers} workers");

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Done>();
        let mut state = DispatchState::new(workers);
        self.try_dispatch(&mut state, &done_tx).await?;

        loop {
            tokio::select! {
                biased;

                _ = inner.cancel.cancelled() => break,

                Some(done) = done_rx.recv() => {
                    self.handle_done(&mut state, done).await;
                }

                req = add_rx.recv() => match req {
                    Some(req) => self.handle_add(&mut state, req).await,
                    None => break,
                },
            }

            self.try_dispatch(&mut state, &done_tx).await?;
        }

        debug!("pin dispatcher stopped");
        Ok(())
    }

    async fn handle_add(&self, state: &mut DispatchState, req: AddRequest) {
        let AddRequest { op, ack } = req;
        let key = op.key();
        let result = self.accept(state, op).await;
        if let Err(err) = &result {
            warn!("failed to accept pin {key}: {err:#}");
        }
        let _ = ack.send(result);
    }

    /// Accepts one incoming operation: head-slot fast path, dedup claim,
    /// durable enqueue.
    async fn accept(&self, state: &mut DispatchState, op: PinningOperation) -> Result<()> {
        let inner = &self.inner;
        let key = op.key();

        if state.head.is_none()
            && !state.running_keys.contains(&key)
            && !state.pending.contains(&key)
        {
            // The queue is empty and the key is not tracked elsewhere: take
            // the op straight into the head slot. Under commit-on-pop it is
            // already "popped", so it gets no durable write and no guard
            // claim.
            debug!("pin {key} taken directly as queue head");
            self.emit_status_off_loop(key.cont_id, PinStatus::Queued);
            state.head = Some(op);
            return Ok(());
        }

        if !inner.guard.try_claim(key).await? {
            debug!("dropping duplicate pin request {key}");
            return Ok(());
        }

        if let Err(err) = inner.queue.enqueue(&op).await {
            // The claim must not outlive the failed enqueue, or the key
            // could never be re-added.
            if let Err(release_err) = inner.guard.release(key).await {
                error!("failed to release claim for {key} after enqueue failure: {release_err:#}");
            }
            return Err(err);
        }

        self.emit_status_off_loop(key.cont_id, PinStatus::Queued);
        Ok(())
    }

    async fn handle_done(&self, state: &mut DispatchState, done: Done) {
        let Done { key, ok } = done;

        if let Some(active) = state.running.get_mut(&key.user_id) {
            *active -= 1;
            if *active == 0 {
                state.running.remove(&key.user_id);
            }
        }
        state.running_keys.remove(&key);
        state.free_slots += 1;

        // Release the dedup claim so the caller may re-add (e.g. to retry a
        // failure). Tolerates ops that were never claimed (head fast path).
        if let Err(err) = self.inner.guard.release(key).await {
            error!("failed to release duplicate guard claim for {key}: {err:#}");
        }

        debug!("pin {key} finished (ok={ok})");

        // The freed slot services this user's deferred ops first.
        state.pending.prefer_user(key.user_id);
    }

    /// Hands runnable operations to workers while free slots last.
    ///
    /// The pending map wins over the queue head, so users deferred earlier
    /// are not starved by fresh arrivals. A blocked head is moved to the
    /// pending map under its user and the next head is considered.
    async fn try_dispatch(
        &self,
        state: &mut DispatchState,
        done_tx: &mpsc::UnboundedSender<Done>,
    ) -> Result<()> {
        let cap = self.inner.opts.max_active_per_user;

        loop {
            // Refill first: `accept` may have enqueued behind an empty head
            // slot (a duplicate of a running or deferred key), and the head
            // must mirror the queue even while no slot is free.
            self.fill_head(state).await?;

            if state.free_slots == 0 {
                break;
            }

            if let Some(op) = state.take_runnable_pending(cap) {
                self.dispatch(state, op, done_tx);
                continue;
            }

            let Some(op) = state.head.take() else {
                break;
            };

            if state.is_runnable(&op, cap) {
                self.dispatch(state, op, done_tx);
            } else {
                debug!(
                    "user {} at cap, deferring pin {} ({} pending)",
                    op.user_id,
                    op.key(),
                    state.pending.len() + 1
                );
                state.pending.push(op);
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        state: &mut DispatchState,
        op: PinningOperation,
        done_tx: &mpsc::UnboundedSender<Done>,
    ) {
        let key = op.key();
        state.free_slots -= 1;
        *state.running.entry(key.user_id).or_insert(0) += 1;
        state.running_keys.insert(key);
        debug!("dispatching pin {key} ({} slots left)", state.free_slots);
        worker::spawn_pin_task(self.inner.clone(), op, done_tx.clone());
    }

    /// Refills the head slot from the durable queue, maintaining the
    /// invariant that an empty head slot means an empty queue.
    async fn fill_head(&self, state: &mut DispatchState) -> Result<()> {
        if state.head.is_none() {
            state.head = self
                .inner
                .queue
                .next()
                .await
                .context("popping durable queue head")?;
        }
        Ok(())
    }

    /// Emits a status transition without running the sink on the dispatcher
    /// task.
    fn emit_status_off_loop(&self, cont_id: u64, status: PinStatus) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.emit_status(cont_id, status);
        });
    }
}
