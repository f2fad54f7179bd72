//! Heartbeat service -- periodic `node.Heartbeat` publication.
//!
//! On `start()` a driver task sleeps until `previous_wake + interval`,
//! emits one heartbeat, and credits the node's uptime. The deadline chain
//! never accumulates scheduling latency. `stop()` only flips a flag; the
//! driver notices at its next wake.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cyphal_identity::NodeIdentity;
use cyphal_protocol::{Envelope, ErrorKind, ProtocolError};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::tx_queue::{QueueError, TxQueue};

pub const DEFAULT_INTERVAL_MS: u32 = 1000;
pub const MIN_INTERVAL_MS: u32 = 100;
pub const MAX_INTERVAL_MS: u32 = 60_000;

pub fn validate_interval(interval_ms: u32) -> bool {
    (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms)
}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("heartbeat interval {0} ms out of range ({MIN_INTERVAL_MS}..={MAX_INTERVAL_MS})")]
    InvalidInterval(u32),
    #[error("no transmit queue attached")]
    NoQueue,
    #[error("heartbeat dropped: {0}")]
    Enqueue(QueueError),
    #[error("heartbeat driver needs a running tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HeartbeatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeartbeatError::InvalidInterval(_) => ErrorKind::InvalidParameter,
            HeartbeatError::Enqueue(QueueError::Timeout(_)) => ErrorKind::Timeout,
            HeartbeatError::Enqueue(_) | HeartbeatError::NoQueue | HeartbeatError::NoRuntime => {
                ErrorKind::Failure
            }
            HeartbeatError::Protocol(e) => e.kind(),
        }
    }
}

struct Inner {
    node: Arc<NodeIdentity>,
    queue: Option<TxQueue>,
    interval_ms: AtomicU32,
    enabled: AtomicBool,
    /// Bumped by every start; a driver from an older start exits.
    generation: AtomicU64,
    interval_changed: Notify,
    driver: Mutex<Option<JoinHandle<()>>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.enabled.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.interval_ms.load(Ordering::Relaxed)))
    }

    async fn emit(&self) -> Result<(), HeartbeatError> {
        let snapshot = self.node.snapshot();
        let mut envelope =
            Envelope::create_heartbeat(snapshot.health, snapshot.mode, snapshot.uptime_sec)?;
        envelope.source_node_id = snapshot.id;

        let queue = self.queue.as_ref().ok_or(HeartbeatError::NoQueue)?;
        match queue.push(envelope).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(rejected) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(HeartbeatError::Enqueue(rejected.error))
            }
        }
    }
}

/// Publishes the node's heartbeat. Cloning yields another handle to the
/// same service.
#[derive(Clone)]
pub struct HeartbeatService {
    inner: Arc<Inner>,
}

impl HeartbeatService {
    pub fn new(node: Arc<NodeIdentity>, queue: Option<TxQueue>) -> Self {
        Self {
            inner: Arc::new(Inner {
                node,
                queue,
                interval_ms: AtomicU32::new(DEFAULT_INTERVAL_MS),
                enabled: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                interval_changed: Notify::new(),
                driver: Mutex::new(None),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the driver. Starting a running service is a no-op.
    pub fn start(&self) -> Result<(), HeartbeatError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| HeartbeatError::NoRuntime)?;
        let mut driver = self.inner.driver.lock();
        if self.inner.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.enabled.store(true, Ordering::Release);
        let inner = self.inner.clone();
        *driver = Some(runtime.spawn(drive(inner, generation)));
        tracing::info!(
            interval_ms = self.get_interval(),
            node_id = %self.inner.node.id(),
            "heartbeat: started"
        );
        Ok(())
    }

    /// Stop emitting. The driver exits at its next wake, without emitting.
    pub fn stop(&self) {
        let mut driver = self.inner.driver.lock();
        if !self.inner.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        // Detached; it observes the flag and returns on its own.
        driver.take();
        tracing::info!("heartbeat: stopped");
    }

    /// Change the cadence. A running driver picks it up immediately and
    /// schedules the next emission one new interval after its last wake.
    pub fn set_interval(&self, interval_ms: u32) -> Result<(), HeartbeatError> {
        if !validate_interval(interval_ms) {
            return Err(HeartbeatError::InvalidInterval(interval_ms));
        }
        self.inner.interval_ms.store(interval_ms, Ordering::Relaxed);
        self.inner.interval_changed.notify_waiters();
        tracing::debug!(interval_ms, "heartbeat: interval changed");
        Ok(())
    }

    pub fn get_interval(&self) -> u32 {
        self.inner.interval_ms.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Emit one heartbeat right now, independent of the schedule.
    pub async fn send_now(&self) -> Result<(), HeartbeatError> {
        self.inner.emit().await
    }

    /// Stop and restore the default interval and counters.
    pub fn reset(&self) {
        self.stop();
        self.inner.interval_ms.store(DEFAULT_INTERVAL_MS, Ordering::Relaxed);
        self.inner.sent.store(0, Ordering::Relaxed);
        self.inner.dropped.store(0, Ordering::Relaxed);
    }

    /// Heartbeats accepted by the queue since the last reset.
    pub fn sent_count(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    /// Heartbeats refused by the queue since the last reset.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn status_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for HeartbeatService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heartbeat {} interval={}ms sent={} dropped={}",
            if self.is_enabled() { "enabled" } else { "disabled" },
            self.get_interval(),
            self.sent_count(),
            self.dropped_count(),
        )
    }
}

async fn drive(inner: Arc<Inner>, generation: u64) {
    let mut last_wake = Instant::now();
    let mut uptime_carry_ms: u64 = 0;

    loop {
        let interval = inner.interval();
        let (deadline, missed) = next_deadline(last_wake, interval, Instant::now());
        if missed > 0 {
            tracing::debug!(missed, "heartbeat: skipped missed ticks");
            uptime_carry_ms += u64::from(missed) * interval.as_millis() as u64;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = inner.interval_changed.notified() => continue,
        }
        if !inner.is_current(generation) {
            break;
        }
        last_wake = deadline;

        if let Err(e) = inner.emit().await {
            tracing::warn!(kind = %e.kind(), "heartbeat: emit failed: {e}");
        }

        uptime_carry_ms += interval.as_millis() as u64;
        while uptime_carry_ms >= 1000 {
            uptime_carry_ms -= 1000;
            if let Err(e) = inner.node.increment_uptime() {
                tracing::warn!("heartbeat: uptime update failed: {e}");
            }
        }
    }
    tracing::debug!(generation, "heartbeat: driver exited");
}

/// Next wake on the `last_wake + k * interval` grid that is not in the past,
/// with the number of grid points skipped to reach it.
fn next_deadline(last_wake: Instant, interval: Duration, now: Instant) -> (Instant, u32) {
    let deadline = last_wake + interval;
    if deadline >= now || interval.is_zero() {
        return (deadline, 0);
    }
    let behind = (now - deadline).as_nanos() / interval.as_nanos();
    let missed = u32::try_from(behind + 1).unwrap_or(u32::MAX);
    (deadline + interval * missed, missed)
}
