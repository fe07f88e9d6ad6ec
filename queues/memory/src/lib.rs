//! In-memory implementations of the pinner storage contracts.
//!
//! `MemoryPinQueue` and `MemoryDuplicateGuard` satisfy the same contracts as
//! the durable backends but keep everything in process memory. They back the
//! scheduling-heavy tests and are usable for deployments that accept losing
//! the backlog on restart.
//!
//! The queue stores the encoded form of each operation rather than the
//! struct itself, so the encoding path is exercised exactly as it is by the
//! durable backend.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;
use dashmap::DashMap;
use pinner_core::{DuplicateGuard, PinKey, PinQueue, PinningOperation};
use pinner_core::queue::QueueResult;

#[derive(Debug, Default)]
pub struct MemoryPinQueue {
    entries: Mutex<VecDeque<Bytes>>,
}

impl MemoryPinQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PinQueue for MemoryPinQueue {
    async fn enqueue(&self, op: &PinningOperation) -> QueueResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(op.to_bytes());
        Ok(())
    }

    async fn next(&self) -> QueueResult<Option<PinningOperation>> {
        let mut entries = self.entries.lock().unwrap();
        while let Some(bytes) = entries.pop_front() {
            match PinningOperation::from_bytes(&bytes) {
                Ok(op) => return Ok(Some(op)),
                Err(err) => {
                    tracing::warn!("skipping undecodable pin queue entry: {err}");
                }
            }
        }
        Ok(None)
    }

    async fn len(&self) -> QueueResult<u64> {
        Ok(self.entries.lock().unwrap().len() as u64)
    }

    async fn replay_keys(&self) -> QueueResult<Vec<PinKey>> {
        let entries = self.entries.lock().unwrap();
        let mut keys = Vec::with_capacity(entries.len());
        for bytes in entries.iter() {
            match PinningOperation::from_bytes(bytes) {
                Ok(op) => keys.push(op.key()),
                Err(err) => {
                    tracing::warn!("skipping undecodable pin queue entry: {err}");
                }
            }
        }
        Ok(keys)
    }

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDuplicateGuard {
    claims: DashMap<PinKey, ()>,
}

impl MemoryDuplicateGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DuplicateGuard for MemoryDuplicateGuard {
    async fn try_claim(&self, key: PinKey) -> QueueResult<bool> {
        Ok(self.claims.insert(key, ()).is_none())
    }

    async fn release(&self, key: PinKey) -> QueueResult<()> {
        self.claims.remove(&key);
        Ok(())
    }

    async fn len(&self) -> QueueResult<u64> {
        Ok(self.claims.len() as u64)
    }

    async fn retain_only(&self, live: &HashSet<PinKey>) -> QueueResult<()> {
        self.claims.retain(|key, _| live.contains(key));
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}
