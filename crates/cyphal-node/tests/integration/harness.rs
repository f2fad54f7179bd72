//! Test harness for in-process cyphal-node integration tests.
//!
//! Provides TestNode (single node), TestNodeBuilder (config) and `connect`
//! for wiring nodes together. Every node runs the same tasks as main.rs
//! (allocator, announcer, transmitter, receiver, heartbeat) over an
//! in-memory wire instead of multicast sockets. Each datagram still passes
//! through `EnvelopeCodec` on its way out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use cyphal_identity::{AllocationTable, AllocatorConfig, NodeIdentity};
use cyphal_node::allocator_task::{self, NodeInfo};
use cyphal_node::receive_task::{self, Receiver};
use cyphal_node::transmit_task::{self, Destination};
use cyphal_node::{HeartbeatService, TxQueue};
use cyphal_protocol::{
    decode_heartbeat, Clock, Envelope, EnvelopeCodec, HeartbeatPayload, ProtocolError,
    HEARTBEAT_SUBJECT_ID, NODE_INFO_SUBJECT_ID,
};
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

/// Clock driven by tokio time, so paused-time tests move it too.
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_usec(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

pub type Datagram = Result<(Envelope, SocketAddr), ProtocolError>;

/// One envelope as it left a node.
#[derive(Debug, Clone)]
pub struct Captured {
    pub at: Instant,
    pub envelope: Envelope,
    pub dest: SocketAddr,
}

pub struct TestNodeBuilder {
    preferred_id: u8,
    name: String,
    interval_ms: u32,
    heartbeat: bool,
    table: Option<Arc<AllocationTable>>,
    addr: SocketAddr,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(preferred_id: u8) -> Self {
        Self {
            preferred_id,
            name: format!("test-node-{preferred_id}"),
            interval_ms: 1000,
            heartbeat: true,
            table: None,
            addr: SocketAddr::from(([10, 0, 0, preferred_id], 9382)),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    pub fn interval_ms(mut self, interval_ms: u32) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = false;
        self
    }

    /// Share an allocation table, as nodes in one process do.
    pub fn table(mut self, table: Arc<AllocationTable>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn addr(mut self, addr: &str) -> Self {
        self.addr = addr.parse().expect("test address");
        self
    }

    /// Spawn every task. Must be called inside a tokio runtime.
    pub fn build(self) -> TestNode {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let table = self.table.unwrap_or_default();
        let node = Arc::new(
            NodeIdentity::with_config(self.preferred_id, table, clock, AllocatorConfig::default())
                .expect("node identity"),
        );
        let queue = TxQueue::new();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let wire = Arc::new(Mutex::new(Vec::new()));
        let peers: Arc<Mutex<Vec<mpsc::UnboundedSender<Datagram>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let (inject, inbound) = mpsc::unbounded::<Datagram>();
        let (outbound, mut sent) = mpsc::unbounded::<(Envelope, SocketAddr)>();
        let mut handles = Vec::new();

        // Wire: encode, decode, record, fan out to peers.
        {
            let wire = wire.clone();
            let peers = peers.clone();
            let from = self.addr;
            handles.push(tokio::spawn(async move {
                let mut codec = EnvelopeCodec;
                while let Some((envelope, dest)) = sent.next().await {
                    let mut buf = BytesMut::new();
                    codec.encode(&envelope, &mut buf).expect("encode");
                    let decoded = codec.decode(&mut buf).expect("decode").expect("frame");
                    wire.lock().push(Captured {
                        at: Instant::now(),
                        envelope: decoded.clone(),
                        dest,
                    });
                    for peer in peers.lock().iter() {
                        let _ = peer.unbounded_send(Ok((decoded.clone(), from)));
                    }
                }
            }));
        }

        let destination = Destination {
            multicast_base: [239, 0, 0, 0].into(),
            port: 9382,
        };
        handles.push(tokio::spawn(transmit_task::run_transmit_loop(
            queue.clone(),
            outbound,
            destination,
            shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(receive_task::run_receive_loop(
            Receiver::new(node.clone(), Some(self.addr)),
            inbound,
            shutdown_tx.subscribe(),
        )));

        let allocated = allocator_task::announce_on_allocation(&node);
        let info = NodeInfo {
            name: self.name.clone(),
            sw_version: 1,
            hw_version: 1,
        };
        handles.push(tokio::spawn(allocator_task::run_announce_loop(
            info,
            queue.clone(),
            allocated,
            shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(allocator_task::run_allocator_loop(
            node.clone(),
            Duration::from_millis(100),
            shutdown_tx.subscribe(),
        )));

        let heartbeat = HeartbeatService::new(node.clone(), Some(queue.clone()));
        heartbeat.set_interval(self.interval_ms).expect("interval");
        if self.heartbeat {
            heartbeat.start().expect("heartbeat start");
        }

        TestNode {
            node,
            queue,
            heartbeat,
            addr: self.addr,
            name: self.name,
            wire,
            inject,
            peers,
            shutdown_tx,
            _handles: handles,
        }
    }
}

/// A running in-process node.
pub struct TestNode {
    pub node: Arc<NodeIdentity>,
    pub queue: TxQueue,
    pub heartbeat: HeartbeatService,
    pub addr: SocketAddr,
    pub name: String,
    wire: Arc<Mutex<Vec<Captured>>>,
    inject: mpsc::UnboundedSender<Datagram>,
    peers: Arc<Mutex<Vec<mpsc::UnboundedSender<Datagram>>>>,
    shutdown_tx: broadcast::Sender<()>,
    _handles: Vec<tokio::task::JoinHandle<()>>,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn shutdown(self) {
        self.heartbeat.stop();
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    /// Deliver a datagram as if it arrived from `from`.
    pub fn inject(&self, envelope: Envelope, from: &str) {
        let from: SocketAddr = from.parse().expect("sender address");
        self.inject
            .unbounded_send(Ok((envelope, from)))
            .expect("receiver alive");
    }

    pub fn sent(&self) -> Vec<Captured> {
        self.wire.lock().clone()
    }

    pub fn sent_on(&self, subject_id: u16) -> Vec<Captured> {
        self.sent()
            .into_iter()
            .filter(|c| c.envelope.subject_id == subject_id)
            .collect()
    }

    pub fn heartbeats(&self) -> Vec<Captured> {
        self.sent_on(HEARTBEAT_SUBJECT_ID)
    }

    pub fn heartbeat_payloads(&self) -> Vec<HeartbeatPayload> {
        self.heartbeats()
            .iter()
            .map(|c| decode_heartbeat(c.envelope.payload()).expect("heartbeat payload"))
            .collect()
    }

    pub fn node_infos(&self) -> Vec<Captured> {
        self.sent_on(NODE_INFO_SUBJECT_ID)
    }

    /// Poll `check` every 10 ms until it holds, or fail after `timeout`.
    pub async fn wait_until<F>(&self, timeout: Duration, mut check: F) -> anyhow::Result<()>
    where
        F: FnMut(&TestNode) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if check(self) {
                return Ok(());
            }
            if Instant::now() > deadline {
                anyhow::bail!("timeout after {:?}: {}", timeout, self.node.status_string());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Let `a` and `b` hear each other's datagrams.
pub fn connect(a: &TestNode, b: &TestNode) {
    a.peers.lock().push(b.inject.clone());
    b.peers.lock().push(a.inject.clone());
}
