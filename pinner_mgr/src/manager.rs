//! The public pin manager API.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, ensure};
use pinner_core::{
    CONTENT_LOCATION_LOCAL, DuplicateGuard, PinExecutor, PinKey, PinQueue, PinStatus,
    PinStatusSink, PinningOperation,
};
use pinner_queue_redb::{RedbDuplicateGuard, RedbPinQueue};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Options for [`PinManager`].
#[derive(Debug, Clone)]
pub struct PinManagerOpts {
    /// Maximum concurrently running operations per user. Required, positive;
    /// operations with `skip_limiter` bypass the check but are still counted.
    pub max_active_per_user: usize,
    /// Directory holding the durable queue and duplicate guard stores.
    /// Created if missing.
    pub queue_data_dir: PathBuf,
    /// Location string reported through the status callback.
    pub location: String,
    /// Capacity of the add channel. `None` (the default) keeps it unbounded
    /// so callers never block on a slow dispatcher; bounding it trades that
    /// for backpressure.
    pub add_channel_capacity: Option<usize>,
}

impl PinManagerOpts {
    pub fn new(max_active_per_user: usize, queue_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_active_per_user,
            queue_data_dir: queue_data_dir.into(),
            location: CONTENT_LOCATION_LOCAL.to_string(),
            add_channel_capacity: None,
        }
    }
}

pub(crate) struct AddRequest {
    pub op: PinningOperation,
    pub ack: oneshot::Sender<Result<()>>,
}

pub(crate) enum AddSender {
    Bounded(mpsc::Sender<AddRequest>),
    Unbounded(mpsc::UnboundedSender<AddRequest>),
}

impl AddSender {
    async fn send(&self, req: AddRequest) -> Result<(), AddRequest> {
        match self {
            AddSender::Bounded(tx) => tx.send(req).await.map_err(|err| err.0),
            AddSender::Unbounded(tx) => tx.send(req).map_err(|err| err.0),
        }
    }
}

pub(crate) enum AddReceiver {
    Bounded(mpsc::Receiver<AddRequest>),
    Unbounded(mpsc::UnboundedReceiver<AddRequest>),
}

impl AddReceiver {
    pub async fn recv(&mut self) -> Option<AddRequest> {
        match self {
            AddReceiver::Bounded(rx) => rx.recv().await,
            AddReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// A worker's completion report back to the dispatcher.
pub(crate) struct Done {
    pub key: PinKey,
    pub ok: bool,
}

pub(crate) struct Inner {
    pub executor: Arc<dyn PinExecutor>,
    pub sink: Arc<dyn PinStatusSink>,
    pub queue: Arc<dyn PinQueue>,
    pub guard: Arc<dyn DuplicateGuard>,
    pub opts: PinManagerOpts,
    pub add_tx: AddSender,
    pub add_rx: Mutex<Option<AddReceiver>>,
    pub cancel: CancellationToken,
}

impl Inner {
    /// Reports a state transition, swallowing (but logging) sink errors.
    pub fn emit_status(&self, cont_id: u64, status: PinStatus) {
        if let Err(err) = self
            .sink
            .pin_status_update(cont_id, &self.opts.location, status)
        {
            warn!("pin status callback failed for {cont_id} ({status}): {err:#}");
        }
    }
}

/// Durable, fair, concurrency-limited scheduler for pinning operations.
///
/// Cheap to clone; all clones share the same state. Typical usage:
///
/// ```ignore
/// let mgr = PinManager::open(executor, sink, PinManagerOpts::new(30, data_dir))?;
/// let runner = tokio::spawn({
///     let mgr = mgr.clone();
///     async move { mgr.run(5).await }
/// });
/// mgr.add(op).await?;
/// // ...
/// mgr.close().await;
/// ```
#[derive(Clone)]
pub struct PinManager {
    pub(crate) inner: Arc<Inner>,
}

impl PinManager {
    /// Creates a manager over the durable redb backends in
    /// `opts.queue_data_dir`.
    pub fn open(
        executor: Arc<dyn PinExecutor>,
        sink: Arc<dyn PinStatusSink>,
        opts: PinManagerOpts,
    ) -> Result<Self> {
        let queue = Arc::new(RedbPinQueue::open(&opts.queue_data_dir)?);
        let guard = Arc::new(RedbDuplicateGuard::open(&opts.queue_data_dir)?);
        Self::with_backends(executor, sink, queue, guard, opts)
    }

    /// Creates a manager over caller-supplied backends.
    pub fn with_backends(
        executor: Arc<dyn PinExecutor>,
        sink: Arc<dyn PinStatusSink>,
        queue: Arc<dyn PinQueue>,
        guard: Arc<dyn DuplicateGuard>,
        opts: PinManagerOpts,
    ) -> Result<Self> {
        ensure!(
            opts.max_active_per_user > 0,
            "max_active_per_user must be positive"
        );

        let (add_tx, add_rx) = match opts.add_channel_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (AddSender::Bounded(tx), AddReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (AddSender::Unbounded(tx), AddReceiver::Unbounded(rx))
            }
        };

        Ok(Self {
            inner: Arc::new(Inner {
                executor,
                sink,
                queue,
                guard,
                opts,
                add_tx,
                add_rx: Mutex::new(Some(add_rx)),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Starts the dispatcher and worker pool; blocks until [`close`].
    ///
    /// `workers` may be zero: nothing is dispatched and enqueued items
    /// accumulate in the durable queue (pass-through mode, used by tests and
    /// passive replicas). A durable-store failure during the startup replay
    /// or during dispatch is fatal and ends `run` with the error.
    pub async fn run(&self, workers: usize) -> Result<()> {
        let add_rx = self
            .inner
            .add_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("run may only be called once"))?;
        self.run_dispatcher(add_rx, workers).await
    }

    /// Enqueues an operation, subject to dedup.
    ///
    /// Returns after the operation is durably persisted (or recognized as a
    /// duplicate, which is success). Blocks while the dispatcher performs
    /// the durability write; durable-store failures surface here. Note that
    /// the ack only arrives once [`run`] has started the dispatcher.
    pub async fn add(&self, op: PinningOperation) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .add_tx
            .send(AddRequest { op, ack: ack_tx })
            .await
            .map_err(|_| anyhow!("pin manager is closed"))?;
        ack_rx.await.map_err(|_| anyhow!("pin manager is closed"))?
    }

    /// Length of the durable queue. Does not count the head slot, the
    /// pending map, or running operations.
    pub async fn pin_queue_size(&self) -> Result<u64> {
        self.inner.queue.len().await
    }

    /// Stops dispatch, cancels workers, and flushes the stores.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        if let Err(err) = self.inner.queue.close().await {
            warn!("failed to close pin queue: {err:#}");
        }
        if let Err(err) = self.inner.guard.close().await {
            warn!("failed to close duplicate guard: {err:#}");
        }
        debug!("pin manager closed");
    }
}
