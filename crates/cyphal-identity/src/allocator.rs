//! Dynamic node-ID allocation state machine.
//!
//! ```text
//! IDLE --start--> REQUESTING --free id--> ALLOCATED --conflict--> CONFLICT_DETECTED
//!                     |                                                  |
//!                     +--deadline / retries--> FAILED --fallback--> ALLOCATED
//!                                                 |
//!                                                 +--none--> terminal, callback(UNSET, false)
//! ```
//!
//! Driven by `process()` from a single task. `handle_response()` and
//! `detect_conflict()` come from the receive path.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use cyphal_protocol::NodeId;

use crate::{IdentityError, IdentityRecord, NodeIdentity, Result, DEFAULT_LOCK_TIMEOUT};

/// Minimum spacing between allocation requests.
pub const REQUEST_INTERVAL_MS: u64 = 1000;

/// Allocation must conclude within this long of `start()`.
pub const ALLOCATION_DEADLINE_MS: u64 = 10_000;

/// Failed attempts before REQUESTING gives up.
pub const MAX_RETRIES: u8 = 3;

/// Upper bound of the preferred dynamic band.
pub const PREFERRED_BAND_MAX: u8 = 100;

/// Lower bound of the fallback band (scanned from the top down).
pub const FALLBACK_BAND_MIN: u8 = 117;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocState {
    Idle,
    Requesting,
    Allocated,
    ConflictDetected,
    Failed,
}

impl AllocState {
    pub fn name(&self) -> &'static str {
        match self {
            AllocState::Idle => "idle",
            AllocState::Requesting => "requesting",
            AllocState::Allocated => "allocated",
            AllocState::ConflictDetected => "conflict_detected",
            AllocState::Failed => "failed",
        }
    }

    /// ALLOCATED or FAILED.
    pub fn is_concluded(&self) -> bool {
        matches!(self, AllocState::Allocated | AllocState::Failed)
    }
}

impl fmt::Display for AllocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub request_interval_ms: u64,
    pub deadline_ms: u64,
    pub max_retries: u8,
    pub lock_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            request_interval_ms: REQUEST_INTERVAL_MS,
            deadline_ms: ALLOCATION_DEADLINE_MS,
            max_retries: MAX_RETRIES,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Candidate order: conflict hint, preferred id, the preferred band
/// ascending, then the whole range ascending. Ids lost to a conflict in
/// this round are skipped.
fn candidates(record: &IdentityRecord) -> Vec<u8> {
    let mut order = Vec::with_capacity(256);
    order.extend(record.hint);
    if record.preferred_id != 0 {
        order.push(record.preferred_id);
    }
    order.extend(NodeId::MIN..=PREFERRED_BAND_MAX);
    order.extend(NodeId::MIN..=NodeId::MAX);
    order.retain(|id| !record.lost.contains(id));
    order
}

/// Fallback order: the top band descending, then the whole range ascending.
fn fallback_candidates(record: &IdentityRecord) -> Vec<u8> {
    let mut order: Vec<u8> = (FALLBACK_BAND_MIN..=NodeId::MAX).rev().collect();
    order.extend(NodeId::MIN..=NodeId::MAX);
    order.retain(|id| !record.lost.contains(id));
    order
}

/// Next id after `id`, wrapping within 1..=127.
fn next_id(id: u8) -> u8 {
    if id >= NodeId::MAX {
        NodeId::MIN
    } else {
        id + 1
    }
}

/// Completion decided under the record lock, delivered after release.
struct Completion {
    epoch: u64,
    id: NodeId,
    success: bool,
}

impl NodeIdentity {
    /// Begin allocation. Only acts from IDLE.
    pub fn start(&self) -> Result<AllocState> {
        let now = self.clock().now_ms();
        let mut record = self.lock_record()?;
        if record.alloc_state != AllocState::Idle {
            tracing::debug!(state = %record.alloc_state, "allocator: start ignored");
            return Ok(record.alloc_state);
        }
        record.alloc_state = AllocState::Requesting;
        record.alloc_start_ms = now;
        record.last_request_ms = None;
        record.retry_count = 0;
        record.lost.clear();
        record.hint = None;
        record.exhausted = false;
        tracing::info!(preferred = record.preferred_id, "allocator: requesting node id");
        Ok(record.alloc_state)
    }

    /// Halt allocation and return to IDLE. A held id is kept.
    /// Completions still in flight from a concurrent `process()` are dropped.
    pub fn stop(&self) -> Result<()> {
        let mut record = self.lock_record()?;
        record.alloc_state = AllocState::Idle;
        record.epoch = record.epoch.wrapping_add(1);
        tracing::debug!("allocator: stopped");
        Ok(())
    }

    /// Return to IDLE, releasing any held id and clearing retry state.
    pub fn reset(&self) -> Result<()> {
        let mut record = self.lock_record()?;
        if record.id.is_assigned() {
            self.table().release(record.id)?;
        }
        record.id = NodeId::UNSET;
        record.alloc_state = AllocState::Idle;
        record.last_request_ms = None;
        record.retry_count = 0;
        record.lost.clear();
        record.hint = None;
        record.exhausted = false;
        record.epoch = record.epoch.wrapping_add(1);
        tracing::debug!("allocator: reset");
        Ok(())
    }

    /// Advance the state machine by one step. Returns the resulting state.
    pub fn process(&self) -> Result<AllocState> {
        let (state, completion) = self.step()?;
        if let Some(completion) = completion {
            self.deliver(completion);
        }
        Ok(state)
    }

    /// One transition under the record lock. The completion, if any, is
    /// delivered by the caller once the lock is gone.
    fn step(&self) -> Result<(AllocState, Option<Completion>)> {
        let now = self.clock().now_ms();
        let mut record = self.lock_record()?;
        let current = record.alloc_state;
        let completion = match current {
            AllocState::Idle | AllocState::Allocated => None,
            AllocState::ConflictDetected => self.reenter_after_conflict(&mut record, now)?,
            AllocState::Requesting => self.step_requesting(&mut record, now)?,
            AllocState::Failed => self.step_failed(&mut record)?,
        };
        Ok((record.alloc_state, completion))
    }

    /// A conflict opens a fresh request round, paced from now. With the
    /// retry budget already spent it goes straight to FAILED.
    fn reenter_after_conflict(
        &self,
        record: &mut IdentityRecord,
        now: u64,
    ) -> Result<Option<Completion>> {
        if record.retry_count >= self.config().max_retries {
            tracing::warn!(
                retries = record.retry_count,
                "allocator: conflict with retry budget spent"
            );
            record.alloc_state = AllocState::Failed;
            return Ok(None);
        }
        record.retry_count += 1;
        record.alloc_state = AllocState::Requesting;
        record.alloc_start_ms = now;
        record.last_request_ms = None;
        tracing::info!(retry = record.retry_count, "allocator: re-requesting after conflict");
        self.step_requesting(record, now)
    }

    fn step_requesting(&self, record: &mut IdentityRecord, now: u64) -> Result<Option<Completion>> {
        let config = self.config();
        let elapsed = now.saturating_sub(record.alloc_start_ms);
        if elapsed >= config.deadline_ms {
            tracing::warn!(elapsed_ms = elapsed, "allocator: deadline passed");
            record.alloc_state = AllocState::Failed;
            return Ok(None);
        }
        if record.retry_count >= config.max_retries {
            tracing::warn!(retries = record.retry_count, "allocator: retry budget spent");
            record.alloc_state = AllocState::Failed;
            return Ok(None);
        }
        if let Some(last) = record.last_request_ms {
            if now.saturating_sub(last) < config.request_interval_ms {
                return Ok(None);
            }
        }
        record.last_request_ms = Some(now);

        match self.table().claim_first(candidates(record))? {
            Some(id) => Ok(Some(self.conclude(record, id))),
            None => {
                record.retry_count = record.retry_count.saturating_add(1);
                tracing::debug!(
                    retry = record.retry_count,
                    "allocator: no free node id in this round"
                );
                if record.retry_count >= config.max_retries {
                    record.alloc_state = AllocState::Failed;
                }
                Ok(None)
            }
        }
    }

    fn step_failed(&self, record: &mut IdentityRecord) -> Result<Option<Completion>> {
        if record.exhausted {
            return Ok(None);
        }
        match self.table().claim_first(fallback_candidates(record))? {
            Some(id) => {
                tracing::warn!(node_id = id.get(), "allocator: using fallback node id");
                Ok(Some(self.conclude(record, id)))
            }
            None => {
                tracing::error!("allocator: no fallback node id available");
                record.exhausted = true;
                Ok(Some(Completion {
                    epoch: record.epoch,
                    id: NodeId::UNSET,
                    success: false,
                }))
            }
        }
    }

    fn conclude(&self, record: &mut IdentityRecord, id: NodeId) -> Completion {
        record.id = id;
        record.alloc_state = AllocState::Allocated;
        record.hint = None;
        tracing::info!(node_id = id.get(), retries = record.retry_count, "allocator: allocated");
        Completion {
            epoch: record.epoch,
            id,
            success: true,
        }
    }

    /// Fire the callback unless stop/reset happened since the decision.
    ///
    /// The epoch check and the callback lookup share one critical section.
    fn deliver(&self, completion: Completion) {
        let callback = match self.lock_record() {
            Ok(record) if record.epoch != completion.epoch => {
                tracing::debug!("allocator: completion superseded by stop");
                return;
            }
            Ok(_record) => self.callback(),
            Err(e) => {
                tracing::warn!("allocator: completion dropped: {e}");
                return;
            }
        };
        if let Some(callback) = callback {
            callback(completion.id, completion.success);
        }
    }

    /// Reply to an outstanding allocation request. Accepted only in REQUESTING.
    pub fn handle_response(&self, raw_id: u8, success: bool) -> Result<AllocState> {
        let (state, completion) = {
            let mut record = self.lock_record()?;
            if record.alloc_state != AllocState::Requesting {
                return Err(IdentityError::NotRequesting(record.alloc_state));
            }
            let completion = if success {
                let id = NodeId::from_raw(raw_id);
                if !id.is_assigned() {
                    return Err(IdentityError::InvalidNodeId(raw_id));
                }
                self.table().mark_in_use(id)?;
                Some(self.conclude(&mut record, id))
            } else {
                record.retry_count = record.retry_count.saturating_add(1);
                tracing::debug!(retry = record.retry_count, "allocator: request refused");
                if record.retry_count >= self.config().max_retries {
                    record.alloc_state = AllocState::Failed;
                }
                None
            };
            (record.alloc_state, completion)
        };
        if let Some(completion) = completion {
            self.deliver(completion);
        }
        Ok(state)
    }

    /// Another node claims `raw_id`. Acts only if it is the id we hold.
    ///
    /// Returns true when a conflict was recorded.
    pub fn detect_conflict(&self, raw_id: u8) -> Result<bool> {
        let mut record = self.lock_record()?;
        let held = record.id;
        if !held.is_assigned() || held.get() != raw_id {
            return Ok(false);
        }
        self.table().release(held)?;
        record.id = NodeId::UNSET;
        record.lost.insert(raw_id);
        record.hint = Some(next_id(raw_id));
        record.alloc_state = AllocState::ConflictDetected;
        tracing::warn!(node_id = raw_id, "allocator: node id conflict");
        Ok(true)
    }
}
