//! Cyphal Node -- library crate for the Cyphal/UDP node runtime.
//!
//! Re-exports the transmit queue, heartbeat service, background tasks,
//! transport and config so integration tests and main.rs share them.

pub mod allocator_task;
pub mod config;
pub mod heartbeat;
pub mod receive_task;
pub mod transmit_task;
pub mod transport;
pub mod tx_queue;

pub use heartbeat::{HeartbeatError, HeartbeatService};
pub use tx_queue::{PriorityQueue, PushError, QueueError, TxQueue};

use std::path::PathBuf;

/// Expand a leading `~/` to $HOME.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
