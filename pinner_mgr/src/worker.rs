//! Worker tasks: run the executor for one operation and report back.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use futures::FutureExt;
use pinner_core::{PinStatus, PinningOperation, ProgressFn};
use tokio::sync::mpsc;
use tracing::warn;

use crate::manager::{Done, Inner};

/// Executes `op` on a fresh task and reports completion to the dispatcher.
///
/// The task races the executor against the manager's cancellation token, so
/// shutdown is observed even by an executor that ignores its token. Panics
/// in the executor become `Failed`. The terminal status is emitted here,
/// off the dispatcher task; sink errors are logged, never propagated.
pub(crate) fn spawn_pin_task(
    inner: Arc<Inner>,
    mut op: PinningOperation,
    done_tx: mpsc::UnboundedSender<Done>,
) {
    let cancel = inner.cancel.child_token();

    tokio::spawn(async move {
        let key = op.key();
        op.status = PinStatus::Pinning;
        op.started_at = Some(Utc::now().timestamp_millis());
        inner.emit_status(key.cont_id, PinStatus::Pinning);

        let progress: ProgressFn = {
            let inner = inner.clone();
            Arc::new(move |blocks| {
                inner
                    .sink
                    .pin_progress(key.cont_id, &inner.opts.location, blocks);
            })
        };

        let run = {
            let inner = inner.clone();
            let cancel = cancel.clone();
            let op = op.clone();
            async move { inner.executor.pin(cancel, &op, progress).await }
        };

        let result = tokio::select! {
            res = AssertUnwindSafe(run).catch_unwind() => match res {
                Ok(res) => res,
                Err(_) => Err(anyhow!("pin executor panicked")),
            },
            _ = cancel.cancelled() => Err(anyhow!("pin cancelled during shutdown")),
        };

        let (status, ok) = match result {
            Ok(()) => (PinStatus::Pinned, true),
            Err(err) => {
                warn!("pin {key} failed: {err:#}");
                (PinStatus::Failed, false)
            }
        };
        inner.emit_status(key.cont_id, status);

        // The dispatcher may already be gone during shutdown.
        let _ = done_tx.send(Done { key, ok });
    });
}
