//! The pin manager: a durable, fair, concurrency-limited work scheduler.
//!
//! [`PinManager`] accepts pin requests ([`pinner_core::PinningOperation`]),
//! persists them, and dispatches them to a pluggable
//! [`pinner_core::PinExecutor`] under two limits: a fixed worker pool and a
//! per-user concurrency cap. Four coupled concerns shape the design:
//!
//! - **Durability**: accepted work lives in a durable FIFO queue
//!   (`pinner_queue_redb`) and survives process restarts.
//! - **Deduplication**: a persistent guard keyed by `(user, content)`
//!   suppresses re-enqueues of an operation that is already tracked.
//! - **Per-user fairness**: operations blocked by their user's cap wait in
//!   an in-memory pending map; freed slots go to the least-recently-serviced
//!   user first.
//! - **Bounded concurrency**: `run(n)` grants `n` worker slots; `run(0)` is
//!   a pass-through mode in which enqueued items simply accumulate.
//!
//! A single dispatcher task owns all scheduling state. Adds and completions
//! reach it over channels; the dispatcher never blocks on the executor or
//! the status callback.
//!
//! The durable queue is commit-on-pop: an operation handed to the head slot
//! or a worker is already gone from the store, and a crash loses it. The
//! layer above (which tracks pin rows of its own) is expected to re-request
//! pins whose state says "in flight"; the startup replay drops their stale
//! guard claims so those re-adds are accepted.

mod dispatch;
mod manager;
mod pending;
mod worker;

pub use manager::{PinManager, PinManagerOpts};
