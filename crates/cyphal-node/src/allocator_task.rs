//! Allocator background task -- drives the node-ID state machine.
//!
//! On startup the allocator is started; then every tick:
//!   1. node.process() -> AllocState
//!   2. transitions are logged (INFO for a conclusion)
//!
//! Also hosts the node-info announcer fed by the allocation callback.

use std::sync::Arc;
use std::time::Duration;

use cyphal_identity::{AllocState, NodeIdentity};
use cyphal_protocol::{Envelope, NodeId};
use tokio::sync::{broadcast, mpsc};

use crate::tx_queue::TxQueue;

/// Run the allocator loop until shutdown. The allocator is stopped on exit.
pub async fn run_allocator_loop(
    node: Arc<NodeIdentity>,
    tick: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut last = match node.start() {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(kind = %e.kind(), "allocator: start failed: {e}");
            node.alloc_state()
        }
    };
    tracing::info!(preferred = node.preferred_id(), state = %last, "allocator: started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {
                match node.process() {
                    Ok(state) if state != last => {
                        log_transition(&node, last, state);
                        last = state;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(kind = %e.kind(), "allocator: process skipped: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                if let Err(e) = node.stop() {
                    tracing::warn!("allocator: stop failed: {e}");
                }
                tracing::info!("allocator: shutting down");
                return;
            }
        }
    }
}

fn log_transition(node: &NodeIdentity, from: AllocState, to: AllocState) {
    match to {
        AllocState::Allocated => {
            tracing::info!(node_id = %node.id(), %from, retries = node.retry_count(), "allocator: allocated");
        }
        AllocState::Failed | AllocState::ConflictDetected => {
            tracing::warn!(%from, %to, retries = node.retry_count(), "allocator: transition");
        }
        _ => {
            tracing::debug!(%from, %to, "allocator: transition");
        }
    }
}

/// Wire the allocation callback to an announcement channel. Successes are
/// forwarded; exhaustion is only logged.
pub fn announce_on_allocation(node: &NodeIdentity) -> mpsc::UnboundedReceiver<NodeId> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.on_allocation(move |id, success| {
        if !success {
            tracing::warn!("allocator: no node id available; staying anonymous");
            return;
        }
        if tx.send(id).is_err() {
            tracing::debug!(node_id = %id, "allocator: announcer gone");
        }
    });
    rx
}

/// Node identity advertised after each successful allocation.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub sw_version: u32,
    pub hw_version: u32,
}

impl NodeInfo {
    pub fn envelope(&self, source: NodeId) -> cyphal_protocol::Result<Envelope> {
        let mut envelope = Envelope::create_node_info(&self.name, self.sw_version, self.hw_version)?;
        envelope.source_node_id = source;
        Ok(envelope)
    }
}

/// Queue one node-info envelope per allocated id until shutdown.
pub async fn run_announce_loop(
    info: NodeInfo,
    queue: TxQueue,
    mut allocated: mpsc::UnboundedReceiver<NodeId>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            id = allocated.recv() => {
                let Some(id) = id else { return };
                let envelope = match info.envelope(id) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(kind = %e.kind(), "announce: node info rejected: {e}");
                        continue;
                    }
                };
                match queue.push(envelope).await {
                    Ok(()) => tracing::info!(node_id = %id, name = %info.name, "announce: node info queued"),
                    Err(e) => tracing::warn!(node_id = %id, kind = %e.error.kind(), "announce: node info dropped: {e}"),
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}
