//! Per-user pending map with explicit round-robin fairness.

use std::collections::{HashMap, VecDeque};

use pinner_core::{PinKey, PinningOperation};

/// Operations popped from the durable queue but blocked by their user's
/// concurrency cap.
///
/// Within a user the order is FIFO. Across users, `rotation` keeps user ids
/// in least-recently-serviced order, so a flood from one user cannot starve
/// the others; map iteration order is never relied on. Invariant: a user id
/// is in `rotation` exactly when it has a non-empty list in `by_user`.
#[derive(Debug, Default)]
pub(crate) struct PendingQueues {
    by_user: HashMap<u64, VecDeque<PinningOperation>>,
    rotation: VecDeque<u64>,
}

impl PendingQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defers `op` behind the user's earlier deferred operations.
    pub fn push(&mut self, op: PinningOperation) {
        let ops = self.by_user.entry(op.user_id).or_default();
        if ops.is_empty() {
            self.rotation.push_back(op.user_id);
        }
        ops.push_back(op);
    }

    /// Pops the front operation of the least-recently-serviced user whose
    /// front passes `is_runnable`; that user rotates to the back.
    ///
    /// Only fronts are considered: skipping deeper into a user's list would
    /// break the per-user FIFO guarantee.
    pub fn take_runnable(
        &mut self,
        is_runnable: impl Fn(&PinningOperation) -> bool,
    ) -> Option<PinningOperation> {
        for idx in 0..self.rotation.len() {
            let user = self.rotation[idx];
            let Some(ops) = self.by_user.get_mut(&user) else {
                continue;
            };
            if !ops.front().is_some_and(&is_runnable) {
                continue;
            }
            let op = ops.pop_front()?;
            self.rotation.remove(idx);
            if ops.is_empty() {
                self.by_user.remove(&user);
            } else {
                self.rotation.push_back(user);
            }
            return Some(op);
        }
        None
    }

    /// True if an operation with `key` is currently deferred.
    pub fn contains(&self, key: &PinKey) -> bool {
        self.by_user
            .get(&key.user_id)
            .is_some_and(|ops| ops.iter().any(|op| op.cont_id == key.cont_id))
    }

    /// Moves `user` to the front of the rotation, so a slot freed by that
    /// user services their deferred operations first.
    pub fn prefer_user(&mut self, user: u64) {
        if let Some(idx) = self.rotation.iter().position(|&u| u == user) {
            self.rotation.remove(idx);
            self.rotation.push_front(user);
        }
    }

    /// Total deferred operations across all users.
    pub fn len(&self) -> usize {
        self.by_user.values().map(|ops| ops.len()).sum()
    }
}
