//! Execution seams supplied by the host.
//!
//! The manager schedules work but performs none of it: the actual pinning
//! (block fetch, DAG walk, blockstore writes, provider announce) is behind
//! [`PinExecutor`], and every observed state transition is reported through
//! [`PinStatusSink`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::op::PinningOperation;
use crate::status::PinStatus;

/// The location string reported for pins held by this process.
pub const CONTENT_LOCATION_LOCAL: &str = "local";

/// Incremental progress callback handed to the executor; the argument is the
/// number of blocks fetched since the last call.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Performs the actual pinning work for one operation.
///
/// Implementations must observe `cancel` and return promptly once it fires.
/// Errors are not retried by the manager (retry policy belongs to the
/// caller); a `Failed` status is always emitted for them. Panics are caught
/// by the worker and converted to `Failed`. The manager imposes no timeout.
#[async_trait]
pub trait PinExecutor: Send + Sync + 'static {
    async fn pin(
        &self,
        cancel: CancellationToken,
        op: &PinningOperation,
        progress: ProgressFn,
    ) -> anyhow::Result<()>;
}

/// Observer for pin state transitions.
///
/// Invoked off the dispatcher task, possibly from several workers at once;
/// implementations must be safe to call concurrently. The dispatcher never
/// waits on a sink call, so a sink may call back into the manager, but a
/// sink that blocks indefinitely stalls the worker that reported the
/// transition.
pub trait PinStatusSink: Send + Sync + 'static {
    /// Called on every state transition of a tracked operation.
    fn pin_status_update(
        &self,
        cont_id: u64,
        location: &str,
        status: PinStatus,
    ) -> anyhow::Result<()>;

    /// Called when the executor reports incremental progress.
    fn pin_progress(&self, _cont_id: u64, _location: &str, _blocks: u64) {}
}

/// A sink that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatusSink;

impl PinStatusSink for NullStatusSink {
    fn pin_status_update(
        &self,
        _cont_id: u64,
        _location: &str,
        _status: PinStatus,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Adapts a plain closure into a [`PinStatusSink`].
pub struct FnStatusSink<F>(F);

impl<F> FnStatusSink<F>
where
    F: Fn(u64, &str, PinStatus) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> PinStatusSink for FnStatusSink<F>
where
    F: Fn(u64, &str, PinStatus) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn pin_status_update(
        &self,
        cont_id: u64,
        location: &str,
        status: PinStatus,
    ) -> anyhow::Result<()> {
        (self.0)(cont_id, location, status)
    }
}
