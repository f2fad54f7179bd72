//! Transmitter task -- sole consumer of the transmit queue.
//!
//! Pops envelopes in priority order and sends each to its subject's
//! multicast group. The queue lock is released before the send starts.

use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr};

use cyphal_protocol::Envelope;
use futures::{Sink, SinkExt};
use tokio::sync::broadcast;

use crate::transport::subject_multicast_addr;
use crate::tx_queue::TxQueue;

/// Where envelopes are addressed: `base | subject_id` on `port`.
#[derive(Debug, Clone, Copy)]
pub struct Destination {
    pub multicast_base: Ipv4Addr,
    pub port: u16,
}

impl Destination {
    pub fn for_envelope(&self, envelope: &Envelope) -> SocketAddr {
        subject_multicast_addr(self.multicast_base, envelope.subject_id, self.port).into()
    }
}

/// Run the transmit loop until shutdown.
pub async fn run_transmit_loop<S>(
    queue: TxQueue,
    mut sink: S,
    destination: Destination,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: Sink<(Envelope, SocketAddr)> + Unpin,
    S::Error: Display,
{
    let mut sent: u64 = 0;
    loop {
        tokio::select! {
            popped = queue.pop_wait() => {
                let envelope = match popped {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::debug!(kind = %e.kind(), "transmit: pop failed: {e}");
                        continue;
                    }
                };
                let addr = destination.for_envelope(&envelope);
                let subject = envelope.subject_id;
                let priority = envelope.priority;
                match sink.send((envelope, addr)).await {
                    Ok(()) => {
                        sent += 1;
                        tracing::trace!(subject, %priority, %addr, "transmit: sent");
                    }
                    Err(e) => tracing::warn!(subject, %addr, "transmit: send failed: {e}"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!(sent, "transmit: shutting down");
                return;
            }
        }
    }
}
