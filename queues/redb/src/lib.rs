//! Durable pin queue and duplicate guard backed by redb.
//!
//! Each store gets its own namespace under the queue data directory:
//!
//! ```text
//! <dir>/pinQueue/queue.redb        the FIFO queue
//! <dir>/duplicateGuard/guard.redb  the claimed-key set
//! ```
//!
//! Queue entries are keyed by a 16-byte big-endian sequence number (a
//! monotonically increasing `u64` widened to 16 bytes), so redb's key order
//! is enqueue order and replay is a plain scan. The tail cursor lives in a
//! meta table in the same database and is never decremented, so sequence
//! numbers do not regress across restarts. Guard claims are keyed by the
//! canonical `"userId:contId"` string.
//!
//! All access goes through `spawn_blocking`; every write commits its own
//! transaction, which is what makes `enqueue` and `try_claim` durable by the
//! time they return.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use pinner_core::queue::QueueResult;
use pinner_core::{DuplicateGuard, PinKey, PinQueue, PinningOperation};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::warn;

const OPS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("pin_queue");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("pin_queue_meta");
const GUARD_TABLE: TableDefinition<&str, ()> = TableDefinition::new("duplicate_guard");

const NEXT_SEQ: &str = "next_seq";

fn seq_key(seq: u64) -> [u8; 16] {
    (seq as u128).to_be_bytes()
}

/// Durable FIFO queue over a redb database.
#[derive(Clone)]
pub struct RedbPinQueue {
    db: Arc<Database>,
}

impl RedbPinQueue {
    /// Opens (or creates) the queue database under `dir/pinQueue/`.
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().join("pinQueue");
        std::fs::create_dir_all(&dir)?;
        let db = Database::create(dir.join("queue.redb"))?;

        // Ensure both tables exist before returning, so the first access may
        // be a read (e.g. a length probe before `run`) on a fresh DB.
        {
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(OPS_TABLE)?;
                let _ = write_txn.open_table(META_TABLE)?;
            }
            write_txn.commit()?;
        }

        Ok(Self { db: Arc::new(db) })
    }
}

impl std::fmt::Debug for RedbPinQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbPinQueue").finish()
    }
}

#[async_trait::async_trait]
impl PinQueue for RedbPinQueue {
    async fn enqueue(&self, op: &PinningOperation) -> QueueResult<()> {
        let db = self.db.clone();
        let bytes = op.to_bytes();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let write_txn = db.begin_write()?;
            {
                let mut meta = write_txn.open_table(META_TABLE)?;
                let seq = meta.get(NEXT_SEQ)?.map(|g| g.value()).unwrap_or(0);
                meta.insert(NEXT_SEQ, seq + 1)?;
                drop(meta);

                let mut ops = write_txn.open_table(OPS_TABLE)?;
                ops.insert(seq_key(seq).as_slice(), bytes.as_ref())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb write task failed: {}", e))?
    }

    async fn next(&self) -> QueueResult<Option<PinningOperation>> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<PinningOperation>> {
            loop {
                let write_txn = db.begin_write()?;
                let head = {
                    let ops = write_txn.open_table(OPS_TABLE)?;
                    ops.first()?
                        .map(|(key, value)| (key.value().to_vec(), value.value().to_vec()))
                };

                let Some((key, value)) = head else {
                    write_txn.abort()?;
                    return Ok(None);
                };

                {
                    let mut ops = write_txn.open_table(OPS_TABLE)?;
                    ops.remove(key.as_slice())?;
                }
                write_txn.commit()?;

                match PinningOperation::from_bytes(&value) {
                    Ok(op) => return Ok(Some(op)),
                    Err(err) => {
                        // Corruption isolation: drop the bad entry, keep going.
                        warn!("skipping undecodable pin queue entry: {err}");
                    }
                }
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb write task failed: {}", e))?
    }

    async fn len(&self) -> QueueResult<u64> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let read_txn = db.begin_read()?;
            let ops = read_txn.open_table(OPS_TABLE)?;
            Ok(ops.len()?)
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb read task failed: {}", e))?
    }

    async fn replay_keys(&self) -> QueueResult<Vec<PinKey>> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<PinKey>> {
            let read_txn = db.begin_read()?;
            let ops = read_txn.open_table(OPS_TABLE)?;

            let mut keys = Vec::new();
            for entry in ops.iter()? {
                let (_, value) = entry?;
                match PinningOperation::from_bytes(value.value()) {
                    Ok(op) => keys.push(op.key()),
                    Err(err) => {
                        warn!("skipping undecodable pin queue entry during replay: {err}");
                    }
                }
            }
            Ok(keys)
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb read task failed: {}", e))?
    }

    async fn close(&self) -> QueueResult<()> {
        // Every write committed its own transaction, so there is nothing
        // buffered to flush; the file handle is released when the last
        // clone drops.
        Ok(())
    }
}

/// Persistent duplicate guard over a redb database.
#[derive(Clone)]
pub struct RedbDuplicateGuard {
    db: Arc<Database>,
}

impl RedbDuplicateGuard {
    /// Opens (or creates) the guard database under `dir/duplicateGuard/`.
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().join("duplicateGuard");
        std::fs::create_dir_all(&dir)?;
        let db = Database::create(dir.join("guard.redb"))?;

        {
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(GUARD_TABLE)?;
            }
            write_txn.commit()?;
        }

        Ok(Self { db: Arc::new(db) })
    }
}

impl std::fmt::Debug for RedbDuplicateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbDuplicateGuard").finish()
    }
}

#[async_trait::async_trait]
impl DuplicateGuard for RedbDuplicateGuard {
    async fn try_claim(&self, key: PinKey) -> QueueResult<bool> {
        let db = self.db.clone();
        let canonical = key.canonical();

        tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let write_txn = db.begin_write()?;
            let already_claimed = {
                let table = write_txn.open_table(GUARD_TABLE)?;
                table.get(canonical.as_str())?.is_some()
            };
            if already_claimed {
                // Nothing written; skip the commit fsync.
                write_txn.abort()?;
                return Ok(false);
            }
            {
                let mut table = write_txn.open_table(GUARD_TABLE)?;
                table.insert(canonical.as_str(), ())?;
            }
            write_txn.commit()?;
            Ok(true)
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb write task failed: {}", e))?
    }

    async fn release(&self, key: PinKey) -> QueueResult<()> {
        let db = self.db.clone();
        let canonical = key.canonical();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(GUARD_TABLE)?;
                table.remove(canonical.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb write task failed: {}", e))?
    }

    async fn len(&self) -> QueueResult<u64> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(GUARD_TABLE)?;
            Ok(table.len()?)
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb read task failed: {}", e))?
    }

    async fn retain_only(&self, live: &HashSet<PinKey>) -> QueueResult<()> {
        let db = self.db.clone();
        let live = live.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(GUARD_TABLE)?;
                let stale: Vec<String> = {
                    let mut stale = Vec::new();
                    for entry in table.iter()? {
                        let (key, _) = entry?;
                        let canonical = key.value().to_string();
                        let keep = PinKey::from_canonical(&canonical)
                            .is_some_and(|key| live.contains(&key));
                        if !keep {
                            stale.push(canonical);
                        }
                    }
                    stale
                };
                for canonical in stale {
                    warn!("dropping stale duplicate guard claim {canonical}");
                    table.remove(canonical.as_str())?;
                }
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb write task failed: {}", e))?
    }

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}
