//! Allocation table -- node IDs observed as in use on the network.
//!
//! Shared by every allocator and by the conflict detector on the receive
//! path. Guarded by its own mutex; callers holding an identity record lock
//! take this one second.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;

use cyphal_protocol::NodeId;

use crate::{IdentityError, Result, DEFAULT_LOCK_TIMEOUT};

#[derive(Debug)]
pub struct AllocationTable {
    in_use: Mutex<BTreeSet<u8>>,
    lock_timeout: Duration,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            in_use: Mutex::new(BTreeSet::new()),
            lock_timeout,
        }
    }

    fn guard(&self) -> Result<parking_lot::MutexGuard<'_, BTreeSet<u8>>> {
        self.in_use
            .try_lock_for(self.lock_timeout)
            .ok_or(IdentityError::Timeout { what: "allocation table" })
    }

    pub fn contains(&self, id: u8) -> Result<bool> {
        Ok(self.guard()?.contains(&id))
    }

    /// Record `id` as in use. Returns true if it was not recorded before.
    pub fn mark_in_use(&self, id: NodeId) -> Result<bool> {
        if !id.is_assigned() {
            return Err(IdentityError::InvalidNodeId(id.get()));
        }
        Ok(self.guard()?.insert(id.get()))
    }

    /// Forget `id`. Returns true if it was recorded.
    pub fn release(&self, id: NodeId) -> Result<bool> {
        Ok(self.guard()?.remove(&id.get()))
    }

    /// Claim the first candidate not yet in use, atomically.
    pub fn claim_first<I>(&self, candidates: I) -> Result<Option<NodeId>>
    where
        I: IntoIterator<Item = u8>,
    {
        let mut in_use = self.guard()?;
        let winner = candidates
            .into_iter()
            .filter(|id| NodeId::from_raw(*id).is_assigned())
            .find(|id| !in_use.contains(id));
        if let Some(id) = winner {
            in_use.insert(id);
        }
        Ok(winner.map(NodeId::from_raw))
    }

    /// `len`, `is_empty`, `snapshot` and `clear` lock without a timeout; they
    /// serve status output and tests, not the allocation path.
    pub fn len(&self) -> usize {
        self.in_use.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use.lock().is_empty()
    }

    /// Sorted copy of every id in use.
    pub fn snapshot(&self) -> Vec<u8> {
        self.in_use.lock().iter().copied().collect()
    }

    pub fn clear(&self) {
        self.in_use.lock().clear();
    }
}

impl Default for AllocationTable {
    fn default() -> Self {
        Self::new()
    }
}
