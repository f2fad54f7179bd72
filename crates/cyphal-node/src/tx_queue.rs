//! Transmit queue -- bounded, priority-ordered staging between producers
//! and the transmitter task.
//!
//! Order is (priority ascending, insertion sequence ascending). The sequence
//! counter wraps; entries compare by modular distance, which is exact while
//! fewer than 2^31 entries separate the oldest and newest.

use cyphal_protocol::{Envelope, ErrorKind, Priority};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};

/// Default transmit queue capacity.
pub const TX_QUEUE_CAPACITY: usize = 64;

/// Default bound on lock acquisition for every queue operation.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Queue with the default capacity.
pub type TxQueue = PriorityQueue<TX_QUEUE_CAPACITY>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("transmit queue full (capacity {capacity})")]
    Full { capacity: usize },
    #[error("transmit queue locked; non-blocking push refused")]
    Busy,
    #[error("transmit queue lock not acquired within {0:?}")]
    Timeout(Duration),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Full { .. } | QueueError::Busy => ErrorKind::QueueFull,
            QueueError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// A refused push. The envelope goes back to the caller untouched.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PushError {
    pub error: QueueError,
    pub envelope: Envelope,
}

impl PushError {
    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

struct Entry {
    priority: Priority,
    seq: u32,
    envelope: Envelope,
}

/// `Less` when `a` was enqueued before `b`.
fn seq_order(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}

// BinaryHeap pops the greatest entry: greatest = most urgent, then oldest.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| seq_order(other.seq, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u32,
}

/// Thread-safe priority queue of owned envelopes with capacity `N`.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct PriorityQueue<const N: usize> {
    inner: Arc<Mutex<Inner>>,
    ready: Arc<Notify>,
    lock_timeout: Duration,
}

impl<const N: usize> PriorityQueue<N> {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(N),
                next_seq: 0,
            })),
            ready: Arc::new(Notify::new()),
            lock_timeout,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        tokio::time::timeout(self.lock_timeout, self.inner.lock())
            .await
            .map_err(|_| QueueError::Timeout(self.lock_timeout))
    }

    fn insert(&self, inner: &mut Inner, envelope: Envelope) -> Result<(), PushError> {
        if inner.heap.len() >= N {
            return Err(PushError {
                error: QueueError::Full { capacity: N },
                envelope,
            });
        }
        let seq = inner.next_seq;
        inner.next_seq = seq.wrapping_add(1);
        inner.heap.push(Entry {
            priority: envelope.priority,
            seq,
            envelope,
        });
        self.ready.notify_one();
        Ok(())
    }

    /// Take ownership of `envelope`. On failure it is handed back.
    pub async fn push(&self, envelope: Envelope) -> Result<(), PushError> {
        let mut inner = match self.lock().await {
            Ok(inner) => inner,
            Err(error) => return Err(PushError { error, envelope }),
        };
        self.insert(&mut inner, envelope)
    }

    /// Non-blocking push for deferred-interrupt contexts: refuses with
    /// [`QueueError::Busy`] instead of waiting for the lock.
    pub fn try_push(&self, envelope: Envelope) -> Result<(), PushError> {
        let mut inner = match self.inner.try_lock() {
            Ok(inner) => inner,
            Err(_) => {
                return Err(PushError {
                    error: QueueError::Busy,
                    envelope,
                })
            }
        };
        self.insert(&mut inner, envelope)
    }

    /// Remove the most urgent, oldest envelope.
    pub async fn pop(&self) -> Result<Option<Envelope>, QueueError> {
        let mut inner = self.lock().await?;
        Ok(inner.heap.pop().map(|entry| entry.envelope))
    }

    /// Wait until an envelope is available and pop it.
    pub async fn pop_wait(&self) -> Result<Envelope, QueueError> {
        loop {
            if let Some(envelope) = self.pop().await? {
                return Ok(envelope);
            }
            self.ready.notified().await;
        }
    }

    pub async fn peek_priority(&self) -> Result<Option<Priority>, QueueError> {
        let inner = self.lock().await?;
        Ok(inner.heap.peek().map(|entry| entry.priority))
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.lock().await?.heap.len())
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.lock().await?.heap.is_empty())
    }

    /// Drop every staged envelope. Returns how many were released.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let mut inner = self.lock().await?;
        let dropped = inner.heap.len();
        inner.heap.clear();
        Ok(dropped)
    }

    pub async fn status_string(&self) -> String {
        match self.lock().await {
            Ok(inner) => QueueStatus {
                len: inner.heap.len(),
                capacity: N,
                next: inner.heap.peek().map(|entry| entry.priority),
            }
            .to_string(),
            Err(e) => format!("queue unavailable: {e}"),
        }
    }
}

impl<const N: usize> Default for PriorityQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

struct QueueStatus {
    len: usize,
    capacity: usize,
    next: Option<Priority>,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue {}/{}", self.len, self.capacity)?;
        match self.next {
            Some(priority) => write!(f, " next={priority}"),
            None => f.write_str(" empty"),
        }
    }
}
