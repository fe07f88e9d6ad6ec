//! Pin status enumeration.

use std::fmt;
use std::str::FromStr;

use minicbor::{Decode, Encode};

/// Lifecycle state of a pinning operation.
///
/// The string forms are stable and shared with other subsystems over the
/// wire; the minicbor indices are stable in durable queue entries. Neither
/// may be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
#[cbor(index_only)]
pub enum PinStatus {
    /// Accepted and waiting for a worker slot.
    #[n(0)]
    Queued,
    /// Handed to a worker; the executor is running.
    #[n(1)]
    Pinning,
    /// The executor finished successfully.
    #[n(2)]
    Pinned,
    /// The executor returned an error, panicked, or was cancelled.
    #[n(3)]
    Failed,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown pin status: {0:?}")]
pub struct PinStatusParseError(String);

impl PinStatus {
    /// The wire string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            PinStatus::Queued => "queued",
            PinStatus::Pinning => "pinning",
            PinStatus::Pinned => "pinned",
            PinStatus::Failed => "failed",
        }
    }

    /// True for the states that end an operation's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PinStatus::Pinned | PinStatus::Failed)
    }
}

impl fmt::Display for PinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PinStatus {
    type Err = PinStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(PinStatus::Queued),
            "pinning" => Ok(PinStatus::Pinning),
            "pinned" => Ok(PinStatus::Pinned),
            "failed" => Ok(PinStatus::Failed),
            other => Err(PinStatusParseError(other.to_string())),
        }
    }
}
