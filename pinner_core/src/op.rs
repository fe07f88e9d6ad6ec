//! The pinning operation: the unit of work accepted by the manager.
//!
//! Durable queue entries are minicbor encodings of [`PinningOperation`].
//! The field indices below are append-only: new fields get fresh indices,
//! removed fields leave their index retired, and unknown indices are ignored
//! on read. This keeps queue entries written by older versions readable.
//!
//! | Index | Field | Type |
//! |---|---|---|
//! | 0 | `user_id` | u64 |
//! | 1 | `cont_id` | u64 |
//! | 2 | `obj` | 32-byte hash |
//! | 3 | `name` | string |
//! | 4 | `peers` | array of strings |
//! | 5 | `status` | status index |
//! | 6 | `skip_limiter` | bool |
//! | 7 | `replace` | optional u64 |
//! | 8 | `created_at` | unix millis |
//! | 9 | `started_at` | optional unix millis |

use std::fmt;

use bytes::Bytes;
use chrono::Utc;
use minicbor::{Decode, Encode};

use crate::Hash;
use crate::status::PinStatus;

/// Identity of an outstanding operation: the dedup and fairness key.
///
/// While an operation with this key is tracked (queued, pending, or
/// running), another add with the same key is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
#[cbor(map)]
pub struct PinKey {
    #[n(0)]
    pub user_id: u64,
    #[n(1)]
    pub cont_id: u64,
}

impl PinKey {
    pub fn new(user_id: u64, cont_id: u64) -> Self {
        Self { user_id, cont_id }
    }

    /// The canonical `"userId:contId"` form used as the duplicate-guard
    /// storage key.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.user_id, self.cont_id)
    }

    /// Parses the canonical `"userId:contId"` form back into a key.
    pub fn from_canonical(s: &str) -> Option<Self> {
        let (user, cont) = s.split_once(':')?;
        Some(Self {
            user_id: user.parse().ok()?,
            cont_id: cont.parse().ok()?,
        })
    }
}

impl fmt::Display for PinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.cont_id)
    }
}

/// A request to retain a content-addressed object and announce availability.
///
/// Created by the host, persisted into the durable queue, and eventually
/// handed to the [`crate::PinExecutor`]. The manager reads `user_id`,
/// `cont_id` and `skip_limiter` for scheduling; everything else rides
/// through to the executor untouched.
#[derive(Debug, Clone, Encode, Decode)]
#[cbor(map)]
pub struct PinningOperation {
    #[n(0)]
    pub user_id: u64,
    #[n(1)]
    pub cont_id: u64,
    /// Root object to pin.
    #[n(2)]
    pub obj: Hash,
    /// Human label.
    #[n(3)]
    pub name: String,
    /// Optional peer-address hints for block sources.
    #[n(4)]
    pub peers: Vec<String>,
    /// Latest observed state.
    #[n(5)]
    pub status: PinStatus,
    /// Bypasses the per-user concurrency cap. Used for system-internal
    /// consolidation moves, never for user traffic.
    #[n(6)]
    pub skip_limiter: bool,
    /// Prior content id to evict once this pin succeeds. A hint to the
    /// executor; the manager does not interpret it.
    #[n(7)]
    pub replace: Option<u64>,
    /// Unix millis at creation.
    #[n(8)]
    pub created_at: i64,
    /// Unix millis at dispatch, if the operation has been dispatched.
    #[n(9)]
    pub started_at: Option<i64>,
}

impl PinningOperation {
    pub fn new(user_id: u64, cont_id: u64, obj: Hash, name: impl Into<String>) -> Self {
        Self {
            user_id,
            cont_id,
            obj,
            name: name.into(),
            peers: Vec::new(),
            status: PinStatus::Queued,
            skip_limiter: false,
            replace: None,
            created_at: Utc::now().timestamp_millis(),
            started_at: None,
        }
    }

    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_skip_limiter(mut self, skip: bool) -> Self {
        self.skip_limiter = skip;
        self
    }

    pub fn with_replace(mut self, replace: u64) -> Self {
        self.replace = Some(replace);
        self
    }

    pub fn key(&self) -> PinKey {
        PinKey::new(self.user_id, self.cont_id)
    }

    /// Encodes the operation for durable storage.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::new();
        // Writing CBOR into a Vec cannot fail.
        minicbor::encode(self, &mut buf).expect("infallible encode into Vec");
        buf.into()
    }

    /// Decodes an operation from its durable encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, minicbor::decode::Error> {
        minicbor::decode(bytes)
    }
}
