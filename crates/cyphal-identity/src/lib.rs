//! Cyphal Identity -- node identity record and dynamic node-ID allocation.
//!
//! The record (id, health, mode, uptime, allocator bookkeeping) sits behind
//! one mutex. The process-wide allocation table has its own. Lock order when
//! both are needed: record first, then table. Completion callbacks fire with
//! neither held.

pub mod allocator;
pub mod table;

pub use allocator::{AllocState, AllocatorConfig};
pub use table::AllocationTable;

use cyphal_protocol::{Clock, ErrorKind, Health, Mode, NodeId};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on any mutex acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Invoked when allocation concludes: `(id, true)` on success,
/// `(NodeId::UNSET, false)` once every fallback is exhausted.
///
/// Runs on the caller of `process()`/`handle_response()` with no identity
/// lock held, so it may read the identity. It must not block for long.
///
/// Completions decided before a `stop()`/`reset()` are dropped. A stop that
/// lands after the epoch check but before the call still sees this one
/// callback.
pub type AllocationCallback = Arc<dyn Fn(NodeId, bool) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid node id {0}")]
    InvalidNodeId(u8),
    #[error("invalid preferred node id {0} (expected 0 or 1..=127)")]
    InvalidPreferredId(u8),
    #[error("{what} lock not acquired within timeout")]
    Timeout { what: &'static str },
    #[error("allocation response ignored in state {0}")]
    NotRequesting(AllocState),
}

impl IdentityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdentityError::InvalidNodeId(_) | IdentityError::InvalidPreferredId(_) => {
                ErrorKind::InvalidParameter
            }
            IdentityError::Timeout { .. } => ErrorKind::Timeout,
            IdentityError::NotRequesting(_) => ErrorKind::Failure,
        }
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// Mutable identity state, including allocator bookkeeping.
#[derive(Debug)]
pub(crate) struct IdentityRecord {
    pub id: NodeId,
    pub preferred_id: u8,
    pub health: Health,
    pub mode: Mode,
    pub uptime_sec: u32,
    pub alloc_state: AllocState,
    pub alloc_start_ms: u64,
    pub last_request_ms: Option<u64>,
    pub retry_count: u8,
    /// Ids lost to a conflict during the current allocation round.
    pub lost: BTreeSet<u8>,
    /// Candidate tried ahead of `preferred_id` after a conflict.
    pub hint: Option<u8>,
    /// Set once FAILED has found no fallback and reported it.
    pub exhausted: bool,
    /// Bumped by stop/reset so in-flight completions are dropped.
    pub epoch: u64,
}

impl IdentityRecord {
    fn new(preferred_id: u8) -> Self {
        Self {
            id: NodeId::UNSET,
            preferred_id,
            health: Health::Nominal,
            mode: Mode::Initialization,
            uptime_sec: 0,
            alloc_state: AllocState::Idle,
            alloc_start_ms: 0,
            last_request_ms: None,
            retry_count: 0,
            lost: BTreeSet::new(),
            hint: None,
            exhausted: false,
            epoch: 0,
        }
    }
}

/// Point-in-time copy of the identity, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySnapshot {
    pub id: NodeId,
    pub preferred_id: u8,
    pub health: Health,
    pub mode: Mode,
    pub uptime_sec: u32,
    pub alloc_state: AllocState,
    pub retry_count: u8,
}

/// The node's identity on the bus.
pub struct NodeIdentity {
    record: Mutex<IdentityRecord>,
    table: Arc<AllocationTable>,
    clock: Arc<dyn Clock>,
    config: AllocatorConfig,
    callback: Mutex<Option<AllocationCallback>>,
}

impl NodeIdentity {
    /// `preferred_id` 0 means no preference.
    pub fn new(preferred_id: u8, table: Arc<AllocationTable>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_config(preferred_id, table, clock, AllocatorConfig::default())
    }

    pub fn with_config(
        preferred_id: u8,
        table: Arc<AllocationTable>,
        clock: Arc<dyn Clock>,
        config: AllocatorConfig,
    ) -> Result<Self> {
        validate_preferred(preferred_id)?;
        Ok(Self {
            record: Mutex::new(IdentityRecord::new(preferred_id)),
            table,
            clock,
            config,
            callback: Mutex::new(None),
        })
    }

    pub(crate) fn lock_record(&self) -> Result<MutexGuard<'_, IdentityRecord>> {
        self.record
            .try_lock_for(self.config.lock_timeout)
            .ok_or(IdentityError::Timeout { what: "identity" })
    }

    pub(crate) fn table(&self) -> &AllocationTable {
        &self.table
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub(crate) fn callback(&self) -> Option<AllocationCallback> {
        self.callback.lock().clone()
    }

    /// Register the allocation completion callback, replacing any previous one.
    pub fn on_allocation<F>(&self, callback: F)
    where
        F: Fn(NodeId, bool) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(callback));
    }

    pub fn allocation_table(&self) -> &Arc<AllocationTable> {
        &self.table
    }

    /// Read accessors wait on the record lock without a timeout. The lock is
    /// only held for field updates, never across a callback.
    pub fn id(&self) -> NodeId {
        self.record.lock().id
    }

    /// Assign an id directly (1..=127), or clear it with 255.
    ///
    /// The table follows: the old id is released and the new one recorded.
    pub fn set_id(&self, raw: u8) -> Result<()> {
        let id = NodeId::new(raw).ok_or(IdentityError::InvalidNodeId(raw))?;
        let mut record = self.lock_record()?;
        let old = record.id;
        if old.is_assigned() && old != id {
            self.table.release(old)?;
        }
        if id.is_assigned() {
            self.table.mark_in_use(id)?;
        }
        record.id = id;
        tracing::info!(old = %old, new = %id, "identity: node id set");
        Ok(())
    }

    pub fn preferred_id(&self) -> u8 {
        self.record.lock().preferred_id
    }

    pub fn set_preferred_id(&self, preferred_id: u8) -> Result<()> {
        validate_preferred(preferred_id)?;
        self.lock_record()?.preferred_id = preferred_id;
        Ok(())
    }

    pub fn health(&self) -> Health {
        self.record.lock().health
    }

    pub fn set_health(&self, health: Health) -> Result<()> {
        self.lock_record()?.health = health;
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        self.record.lock().mode
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.lock_record()?.mode = mode;
        Ok(())
    }

    pub fn uptime_sec(&self) -> u32 {
        self.record.lock().uptime_sec
    }

    /// Derive uptime from a millisecond counter.
    pub fn update_uptime(&self, current_ms: u64) -> Result<()> {
        let secs = u32::try_from(current_ms / 1000).unwrap_or(u32::MAX);
        self.lock_record()?.uptime_sec = secs;
        Ok(())
    }

    /// Add one second of uptime, saturating at `u32::MAX`.
    pub fn increment_uptime(&self) -> Result<u32> {
        let mut record = self.lock_record()?;
        record.uptime_sec = record.uptime_sec.saturating_add(1);
        Ok(record.uptime_sec)
    }

    pub fn alloc_state(&self) -> AllocState {
        self.record.lock().alloc_state
    }

    pub fn retry_count(&self) -> u8 {
        self.record.lock().retry_count
    }

    /// Untimed lock, like the other read accessors.
    pub fn snapshot(&self) -> IdentitySnapshot {
        let record = self.record.lock();
        IdentitySnapshot {
            id: record.id,
            preferred_id: record.preferred_id,
            health: record.health,
            mode: record.mode,
            uptime_sec: record.uptime_sec,
            alloc_state: record.alloc_state,
            retry_count: record.retry_count,
        }
    }

    pub fn status_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.snapshot();
        write!(
            f,
            "node id={} preferred={} health={} mode={} uptime={}s alloc={} retries={}",
            s.id, s.preferred_id, s.health, s.mode, s.uptime_sec, s.alloc_state, s.retry_count
        )
    }
}

fn validate_preferred(preferred_id: u8) -> Result<()> {
    if preferred_id == 0 || NodeId::from_raw(preferred_id).is_assigned() {
        Ok(())
    } else {
        Err(IdentityError::InvalidPreferredId(preferred_id))
    }
}
