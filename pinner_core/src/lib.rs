//! Core pinner types and traits.
//!
//! This crate defines the shared types and traits used by all pinner crates.
//!
//! ## Persisted types (encoding-stable)
//!
//! The following types are written to durable storage and their encodings are
//! intended to be stable across versions:
//!
//! - Content hashes (`hash::Hash`)
//! - Pin statuses (`status::PinStatus`)
//! - Pinning operations (`op::PinningOperation`) and their identity keys
//!   (`op::PinKey`)
//!
//! Fields are minicbor-indexed and append-only; unknown indices are ignored
//! on read, so older entries remain readable after the set grows.
//!
//! ## Contracts
//!
//! - Storage seams (`PinQueue`, `DuplicateGuard`); implementations in
//!   `pinner_queue_memory` and `pinner_queue_redb`
//! - Execution seams (`PinExecutor`, `PinStatusSink`), supplied by the host
//!   and driven by the manager in `pinner_mgr`

pub mod exec;
pub mod hash;
pub mod op;
pub mod queue;
pub mod status;

// Test utilities (behind feature flag)
#[cfg(feature = "testutil")]
pub mod testutil;

// --- Core Public Surface ---

pub use exec::{
    CONTENT_LOCATION_LOCAL, FnStatusSink, NullStatusSink, PinExecutor, PinStatusSink, ProgressFn,
};
pub use hash::Hash;
pub use op::{PinKey, PinningOperation};
pub use queue::{DuplicateGuard, PinQueue};
pub use status::PinStatus;
