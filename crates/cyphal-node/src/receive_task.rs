//! Receiver task -- feeds the allocation table and the conflict detector.
//!
//! For every decoded datagram:
//!   1. invalid envelopes and our own loopback are dropped
//!   2. heartbeats from an assigned node id mark that id in use
//!   3. a heartbeat carrying our id from another sender is a conflict
//!   4. node-info announcements are decoded and logged

use std::net::SocketAddr;
use std::sync::Arc;

use cyphal_identity::NodeIdentity;
use cyphal_protocol::{
    decode_heartbeat, decode_node_info, Envelope, ProtocolError, HEARTBEAT_SUBJECT_ID,
    NODE_INFO_SUBJECT_ID,
};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;

use crate::transport::is_own_datagram;

/// What the receiver did with one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Ignored,
    Own,
    PeerHeartbeat { new_peer: bool },
    Conflict,
    NodeInfo,
}

pub struct Receiver {
    node: Arc<NodeIdentity>,
    /// Address of our publishing socket, if known.
    local: Option<SocketAddr>,
}

impl Receiver {
    pub fn new(node: Arc<NodeIdentity>, local: Option<SocketAddr>) -> Self {
        Self { node, local }
    }

    pub fn handle(&self, envelope: &Envelope, from: SocketAddr) -> Received {
        if !envelope.validate() {
            tracing::debug!(%from, "receive: invalid envelope dropped");
            return Received::Ignored;
        }
        if self.local.is_some_and(|local| is_own_datagram(local, from)) {
            return Received::Own;
        }
        match envelope.subject_id {
            HEARTBEAT_SUBJECT_ID => self.on_heartbeat(envelope, from),
            NODE_INFO_SUBJECT_ID => {
                match decode_node_info(envelope.payload()) {
                    Ok(info) => tracing::debug!(
                        source = %envelope.source_node_id,
                        name = %info.name,
                        sw = info.sw_version,
                        hw = info.hw_version,
                        "receive: node info"
                    ),
                    Err(e) => tracing::debug!(%from, "receive: bad node info: {e}"),
                }
                Received::NodeInfo
            }
            subject => {
                tracing::trace!(subject, %from, "receive: unhandled subject");
                Received::Ignored
            }
        }
    }

    fn on_heartbeat(&self, envelope: &Envelope, from: SocketAddr) -> Received {
        let source = envelope.source_node_id;
        if !source.is_assigned() {
            return Received::Ignored;
        }
        if let Err(e) = decode_heartbeat(envelope.payload()) {
            tracing::debug!(%from, source = %source, "receive: bad heartbeat: {e}");
            return Received::Ignored;
        }

        // Conflict first: it releases the id, which the peer then holds.
        let conflict = match self.node.detect_conflict(source.get()) {
            Ok(conflict) => conflict,
            Err(e) => {
                tracing::warn!(kind = %e.kind(), "receive: conflict check failed: {e}");
                false
            }
        };
        let new_peer = match self.node.allocation_table().mark_in_use(source) {
            Ok(new_peer) => new_peer,
            Err(e) => {
                tracing::warn!(kind = %e.kind(), "receive: allocation table update failed: {e}");
                false
            }
        };

        if conflict {
            tracing::warn!(node_id = %source, %from, "receive: node id conflict detected");
            Received::Conflict
        } else {
            if new_peer {
                tracing::info!(node_id = %source, %from, "receive: peer discovered");
            }
            Received::PeerHeartbeat { new_peer }
        }
    }
}

/// Run the receive loop until shutdown or the stream ends.
pub async fn run_receive_loop<St>(
    receiver: Receiver,
    mut datagrams: St,
    mut shutdown: broadcast::Receiver<()>,
) where
    St: Stream<Item = Result<(Envelope, SocketAddr), ProtocolError>> + Unpin,
{
    loop {
        tokio::select! {
            next = datagrams.next() => match next {
                Some(Ok((envelope, from))) => {
                    receiver.handle(&envelope, from);
                }
                Some(Err(e)) => tracing::debug!(kind = %e.kind(), "receive: datagram dropped: {e}"),
                None => {
                    tracing::info!("receive: stream closed");
                    return;
                }
            },
            _ = shutdown.recv() => {
                tracing::info!("receive: shutting down");
                return;
            }
        }
    }
}
