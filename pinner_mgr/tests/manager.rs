//! End-to-end tests for the pin manager.
//!
//! The scheduling-heavy scenarios run over the in-memory backends; the
//! durability scenarios run over redb in a temp directory. Workloads follow
//! the shape of the service's original test suite: floods of adds across
//! users and contents, with and without duplicates, with worker counts from
//! zero up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pinner_core::testutil::{CountingExecutor, RecordingStatusSink};
use pinner_core::{Hash, PinExecutor, PinStatus, PinningOperation, ProgressFn};
use pinner_mgr::{PinManager, PinManagerOpts};
use pinner_queue_memory::{MemoryDuplicateGuard, MemoryPinQueue};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const N: u64 = 20;

fn pin(user_id: u64, cont_id: u64) -> PinningOperation {
    let name = format!("name{cont_id}");
    PinningOperation::new(user_id, cont_id, Hash::new(name.as_bytes()), name)
}

fn memory_manager(
    executor: Arc<CountingExecutor>,
    max_active_per_user: usize,
) -> (PinManager, Arc<RecordingStatusSink>) {
    let sink = Arc::new(RecordingStatusSink::new());
    let mgr = PinManager::with_backends(
        executor,
        sink.clone(),
        Arc::new(MemoryPinQueue::new()),
        Arc::new(MemoryDuplicateGuard::new()),
        PinManagerOpts::new(max_active_per_user, ""),
    )
    .unwrap();
    (mgr, sink)
}

fn spawn_run(mgr: &PinManager, workers: usize) -> JoinHandle<anyhow::Result<()>> {
    let mgr = mgr.clone();
    tokio::spawn(async move { mgr.run(workers).await })
}

async fn wait_for_count(executor: &CountingExecutor, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while executor.count() < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {expected} executor calls, saw {}",
            executor.count()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until the durable queue is empty and the executor call count has
/// been quiet for several polls (deferred and running ops included).
async fn drain(mgr: &PinManager, executor: &CountingExecutor) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let mut last = usize::MAX;
    let mut quiet_polls = 0;
    loop {
        let size = mgr.pin_queue_size().await.unwrap();
        let count = executor.count();
        if size == 0 && count == last {
            quiet_polls += 1;
            if quiet_polls >= 3 {
                return;
            }
        } else {
            quiet_polls = 0;
        }
        last = count;
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out draining the manager (queue={size}, count={count})"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_status(sink: &RecordingStatusSink, cont_id: u64, status: PinStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !sink.statuses_for(cont_id).contains(&status) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {status} on content {cont_id}; saw {:?}",
            sink.statuses_for(cont_id)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_op_single_worker() {
    let executor = Arc::new(CountingExecutor::new());
    let (mgr, sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 1);

    mgr.add(pin(1, 1)).await.unwrap();
    wait_for_count(&executor, 1).await;

    assert_eq!(mgr.pin_queue_size().await.unwrap(), 0);
    assert_eq!(executor.count(), 1, "executor should run exactly once");

    wait_for_status(&sink, 1, PinStatus::Pinned).await;
    let statuses = sink.statuses_for(1);
    assert!(statuses.contains(&PinStatus::Queued));
    assert!(statuses.contains(&PinStatus::Pinning));
    assert_eq!(statuses.last(), Some(&PinStatus::Pinned));
    assert!(
        sink.progress_reports().contains(&(1, 1)),
        "executor progress should reach the sink"
    );

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn single_op_zero_workers() {
    let executor = Arc::new(CountingExecutor::new());
    let (mgr, _sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 0);

    mgr.add(pin(1, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The single op occupies the head slot, not the queue.
    assert_eq!(mgr.pin_queue_size().await.unwrap(), 0);
    assert_eq!(executor.count(), 0, "no workers, no work");

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unique_ops_zero_workers_accumulate() {
    let executor = Arc::new(CountingExecutor::new());
    let (mgr, _sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 0);

    for i in 0..N {
        mgr.add(pin(i, i)).await.unwrap();
    }

    // The first op was popped into the head slot and is not counted.
    assert_eq!(mgr.pin_queue_size().await.unwrap(), N - 1);
    assert_eq!(executor.count(), 0);

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unique_ops_five_workers_all_run() {
    let executor = Arc::new(CountingExecutor::new());
    let (mgr, _sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 5);

    for i in 0..N {
        mgr.add(pin(i, i)).await.unwrap();
    }
    wait_for_count(&executor, N as usize).await;
    drain(&mgr, &executor).await;

    assert_eq!(mgr.pin_queue_size().await.unwrap(), 0, "queue should empty");
    assert_eq!(executor.count(), N as usize, "every op should run once");

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn duplicate_ops_zero_workers_keep_one_queued() {
    let executor = Arc::new(CountingExecutor::new());
    let (mgr, _sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 0);

    for _ in 0..N {
        mgr.add(pin(0, 0)).await.unwrap();
    }

    // First copy holds the head slot without a claim; the second claims and
    // enqueues; the rest are duplicates.
    assert_eq!(mgr.pin_queue_size().await.unwrap(), 1);
    assert_eq!(executor.count(), 0);

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn duplicate_flood_runs_fewer_than_add_count() {
    let executor = Arc::new(CountingExecutor::new().with_hold(Duration::from_millis(300)));
    let (mgr, _sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 8);

    mgr.add(pin(0, 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..N {
        mgr.add(pin(0, 0)).await.unwrap();
    }
    drain(&mgr, &executor).await;

    assert_eq!(mgr.pin_queue_size().await.unwrap(), 0);
    let count = executor.count();
    assert!(count >= 1, "the first copy must run");
    assert!(
        count < N as usize,
        "dedup must suppress most duplicates, ran {count} of {N}"
    );

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn flood_across_users_bounded_by_dedup() {
    let executor = Arc::new(CountingExecutor::new().with_hold(Duration::from_millis(5)));
    let (mgr, _sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 1);

    // N rounds over N users of N contents each: N^2 distinct keys, each
    // added N times.
    for _ in 0..N {
        for j in 0..N {
            for i in 0..N {
                mgr.add(pin(j, i * N + j)).await.unwrap();
            }
        }
    }
    drain(&mgr, &executor).await;

    assert_eq!(mgr.pin_queue_size().await.unwrap(), 0);
    let count = executor.count();
    assert!(
        count >= (N * N) as usize,
        "every distinct key must run at least once, ran {count}"
    );
    assert!(
        count < (N * N * N) as usize,
        "dedup must suppress re-adds of outstanding keys, ran {count}"
    );

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn per_user_cap_is_enforced() {
    let executor = Arc::new(CountingExecutor::new().with_hold(Duration::from_millis(200)));
    let (mgr, _sink) = memory_manager(executor.clone(), 2);
    let handle = spawn_run(&mgr, 8);

    for i in 0..10 {
        mgr.add(pin(1, i)).await.unwrap();
    }
    wait_for_count(&executor, 10).await;

    assert_eq!(
        executor.high_water(1),
        2,
        "user must peak at exactly the cap"
    );

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn skip_limiter_bypasses_cap() {
    let executor = Arc::new(CountingExecutor::new().with_hold(Duration::from_millis(200)));
    let (mgr, _sink) = memory_manager(executor.clone(), 1);
    let handle = spawn_run(&mgr, 8);

    for i in 0..6 {
        mgr.add(pin(1, i).with_skip_limiter(true)).await.unwrap();
    }
    wait_for_count(&executor, 6).await;

    assert!(
        executor.high_water(1) >= 2,
        "skip-limiter ops must overlap beyond the cap, peaked at {}",
        executor.high_water(1)
    );

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn fifo_per_user() {
    let executor = Arc::new(CountingExecutor::new().with_hold(Duration::from_millis(1)));
    let (mgr, _sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 1);

    for i in 0..10 {
        mgr.add(pin(7, i)).await.unwrap();
    }
    wait_for_count(&executor, 10).await;

    let user_order: Vec<u64> = executor
        .dispatch_order()
        .into_iter()
        .filter(|key| key.user_id == 7)
        .map(|key| key.cont_id)
        .collect();
    assert_eq!(
        user_order,
        (0..10).collect::<Vec<_>>(),
        "a user's ops must dispatch in add order"
    );

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn capped_users_all_make_progress() {
    let executor = Arc::new(CountingExecutor::new().with_hold(Duration::from_millis(20)));
    let (mgr, _sink) = memory_manager(executor.clone(), 1);
    let handle = spawn_run(&mgr, 4);

    for i in 0..5 {
        for user in 1..=4 {
            mgr.add(pin(user, user * 100 + i)).await.unwrap();
        }
    }
    wait_for_count(&executor, 20).await;

    for user in 1..=4u64 {
        assert!(
            executor.high_water(user) <= 1,
            "cap of one must hold for user {user}"
        );
        let conts: Vec<u64> = executor
            .dispatch_order()
            .into_iter()
            .filter(|key| key.user_id == user)
            .map(|key| key.cont_id)
            .collect();
        assert_eq!(
            conts,
            (0..5).map(|i| user * 100 + i).collect::<Vec<_>>(),
            "deferred ops must stay FIFO for user {user}"
        );
    }

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_pin_can_be_added_again() {
    let executor = Arc::new(CountingExecutor::new().failing());
    let (mgr, sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 1);

    mgr.add(pin(1, 5)).await.unwrap();
    wait_for_status(&sink, 5, PinStatus::Failed).await;

    // The failure released the dedup claim, so a retry is accepted and runs.
    mgr.add(pin(1, 5)).await.unwrap();
    wait_for_count(&executor, 2).await;

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

/// Executor whose calls park until the test releases their content id.
#[derive(Default)]
struct GatedExecutor {
    gates: Mutex<HashMap<u64, Arc<Semaphore>>>,
    starts: Mutex<Vec<u64>>,
}

impl GatedExecutor {
    fn gate(&self, cont_id: u64) -> Arc<Semaphore> {
        self.gates
            .lock()
            .unwrap()
            .entry(cont_id)
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    fn release(&self, cont_id: u64) {
        self.gate(cont_id).add_permits(1);
    }

    fn starts_for(&self, cont_id: u64) -> usize {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|&&cont| cont == cont_id)
            .count()
    }
}

#[async_trait]
impl PinExecutor for GatedExecutor {
    async fn pin(
        &self,
        cancel: CancellationToken,
        op: &PinningOperation,
        _progress: ProgressFn,
    ) -> anyhow::Result<()> {
        self.starts.lock().unwrap().push(op.cont_id);
        let gate = self.gate(op.cont_id);
        tokio::select! {
            permit = gate.acquire() => {
                permit?.forget();
                Ok(())
            }
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
        }
    }
}

#[tokio::test]
async fn duplicate_of_deferred_pin_is_not_accepted_twice() {
    let executor = Arc::new(GatedExecutor::default());
    let mgr = PinManager::with_backends(
        executor.clone(),
        Arc::new(RecordingStatusSink::new()),
        Arc::new(MemoryPinQueue::new()),
        Arc::new(MemoryDuplicateGuard::new()),
        PinManagerOpts::new(1, ""),
    )
    .unwrap();
    let handle = spawn_run(&mgr, 2);

    // User 1 runs op 1 and user 2 runs op 20; both worker slots are busy.
    mgr.add(pin(1, 1)).await.unwrap();
    mgr.add(pin(2, 20)).await.unwrap();
    // Op 2 parks in the head slot (no free slot); op 3 is claimed and
    // durably enqueued behind it.
    mgr.add(pin(1, 2)).await.unwrap();
    mgr.add(pin(1, 3)).await.unwrap();
    assert_eq!(mgr.pin_queue_size().await.unwrap(), 1);

    // Finishing user 2 frees a slot; user 1 is at its cap, so ops 2 and 3
    // move to the pending map and the queue drains.
    executor.release(20);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while mgr.pin_queue_size().await.unwrap() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for deferral"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A duplicate of the deferred, claimed op must hit the guard and be
    // dropped, not slip into the empty head slot.
    mgr.add(pin(1, 3)).await.unwrap();

    executor.release(1);
    executor.release(2);
    executor.release(3);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while executor.starts_for(3) == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the deferred op to run"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        executor.starts_for(3),
        1,
        "the deferred op must run exactly once"
    );
    assert_eq!(mgr.pin_queue_size().await.unwrap(), 0);

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

struct PanickingExecutor;

#[async_trait]
impl PinExecutor for PanickingExecutor {
    async fn pin(
        &self,
        _cancel: CancellationToken,
        op: &PinningOperation,
        _progress: ProgressFn,
    ) -> anyhow::Result<()> {
        panic!("executor blew up on {}", op.key());
    }
}

#[tokio::test]
async fn panicking_executor_becomes_failed() {
    let sink = Arc::new(RecordingStatusSink::new());
    let mgr = PinManager::with_backends(
        Arc::new(PanickingExecutor),
        sink.clone(),
        Arc::new(MemoryPinQueue::new()),
        Arc::new(MemoryDuplicateGuard::new()),
        PinManagerOpts::new(30, ""),
    )
    .unwrap();
    let handle = spawn_run(&mgr, 2);

    mgr.add(pin(1, 1)).await.unwrap();
    wait_for_status(&sink, 1, PinStatus::Failed).await;

    // The dispatcher survives the panic and keeps serving.
    mgr.add(pin(2, 2)).await.unwrap();
    wait_for_status(&sink, 2, PinStatus::Failed).await;

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_fails_running_pins() {
    let executor = Arc::new(CountingExecutor::new().with_hold(Duration::from_secs(30)));
    let (mgr, sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 2);

    mgr.add(pin(1, 1)).await.unwrap();
    mgr.add(pin(2, 2)).await.unwrap();

    // Wait until both are in the executor's hold, then pull the plug.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while executor.dispatch_order().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    mgr.close().await;
    handle.await.unwrap().unwrap();

    wait_for_status(&sink, 1, PinStatus::Failed).await;
    wait_for_status(&sink, 2, PinStatus::Failed).await;
    assert_eq!(executor.count(), 0, "cancelled pins must not count as done");
}

#[tokio::test]
async fn run_twice_is_rejected() {
    let executor = Arc::new(CountingExecutor::new());
    let (mgr, _sink) = memory_manager(executor.clone(), 30);
    let handle = spawn_run(&mgr, 1);

    // Give the first run the receiver, then a second run must refuse.
    mgr.add(pin(1, 1)).await.unwrap();
    assert!(mgr.run(1).await.is_err());

    mgr.close().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn zero_cap_is_rejected() {
    let executor: Arc<CountingExecutor> = Arc::new(CountingExecutor::new());
    let result = PinManager::with_backends(
        executor,
        Arc::new(RecordingStatusSink::new()),
        Arc::new(MemoryPinQueue::new()),
        Arc::new(MemoryDuplicateGuard::new()),
        PinManagerOpts::new(0, ""),
    );
    assert!(result.is_err(), "a zero per-user cap must be rejected");
}

#[tokio::test]
async fn durable_restart_resumes_backlog() {
    const M: u64 = 10;
    let dir = tempfile::tempdir().expect("failed to create temp directory");
    let executor = Arc::new(CountingExecutor::new());

    // Phase 1: accumulate in pass-through mode. M rounds over M users of M
    // contents: M^2 distinct keys. The very first key rides the head slot
    // unclaimed, so its round-two duplicate lands in the queue; every other
    // duplicate is suppressed. The durable queue settles at exactly M^2.
    {
        let sink = Arc::new(RecordingStatusSink::new());
        let mgr = PinManager::open(
            executor.clone(),
            sink,
            PinManagerOpts::new(30, dir.path()),
        )
        .unwrap();
        let handle = spawn_run(&mgr, 0);

        for _ in 0..M {
            for j in 0..M {
                for i in 0..M {
                    mgr.add(pin(j, j * M + i)).await.unwrap();
                }
            }
        }
        assert_eq!(mgr.pin_queue_size().await.unwrap(), M * M);
        assert_eq!(executor.count(), 0);

        mgr.close().await;
        handle.await.unwrap().unwrap();
        drop(mgr);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Phase 2: reopen without running; the backlog must be intact.
    {
        let sink = Arc::new(RecordingStatusSink::new());
        let mgr = PinManager::open(
            executor.clone(),
            sink,
            PinManagerOpts::new(30, dir.path()),
        )
        .unwrap();
        assert_eq!(mgr.pin_queue_size().await.unwrap(), M * M);
        assert_eq!(executor.count(), 0);
        mgr.close().await;
        drop(mgr);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Phase 3: reopen with workers and drain everything.
    {
        let sink = Arc::new(RecordingStatusSink::new());
        let mgr = PinManager::open(
            executor.clone(),
            sink,
            PinManagerOpts::new(30, dir.path()),
        )
        .unwrap();
        assert_eq!(mgr.pin_queue_size().await.unwrap(), M * M);

        let handle = spawn_run(&mgr, M as usize);
        wait_for_count(&executor, (M * M) as usize).await;
        drain(&mgr, &executor).await;

        assert_eq!(mgr.pin_queue_size().await.unwrap(), 0);
        assert_eq!(
            executor.count(),
            (M * M) as usize,
            "every persisted entry must run exactly once"
        );

        mgr.close().await;
        handle.await.unwrap().unwrap();
    }
}
