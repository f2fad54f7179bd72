//! Dynamic node-ID allocation over the wire -- preferred ids, conflicts,
//! peer discovery.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cyphal_identity::{AllocState, AllocationTable};
use cyphal_protocol::{decode_node_info, Envelope, Health, Mode, NodeId};

use crate::harness::{connect, TestNodeBuilder};

fn foreign_heartbeat(id: u8) -> Envelope {
    let mut envelope = Envelope::create_heartbeat(Health::Nominal, Mode::Operational, 42).unwrap();
    envelope.source_node_id = NodeId::new(id).unwrap();
    envelope
}

#[tokio::test(start_paused = true)]
async fn test_preferred_id_allocated_and_announced() {
    let tn = TestNodeBuilder::new(50).name("gps-rear").build();
    tn.wait_until(Duration::from_secs(1), |tn| tn.node_infos().len() == 1)
        .await
        .unwrap();

    assert_eq!(tn.node.alloc_state(), AllocState::Allocated);
    assert_eq!(tn.node.id(), NodeId::new(50).unwrap());
    assert!(tn.node.allocation_table().contains(50).unwrap());

    let info = &tn.node_infos()[0];
    assert_eq!(info.envelope.source_node_id, NodeId::new(50).unwrap());
    let payload = decode_node_info(info.envelope.payload()).unwrap();
    assert_eq!(payload.name, "gps-rear");

    tn.shutdown().await;
}

/// Another node publishes our id: we give it up, move to the next free id,
/// announce again, and later heartbeats carry the new id.
#[tokio::test(start_paused = true)]
async fn test_conflict_moves_to_next_id() {
    let tn = TestNodeBuilder::new(50).build();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(tn.node.id(), NodeId::new(50).unwrap());

    tn.inject(foreign_heartbeat(50), "10.9.9.9:40000");
    tn.wait_until(Duration::from_secs(1), |tn| tn.node.id().is_unset())
        .await
        .unwrap();

    tn.wait_until(Duration::from_secs(3), |tn| {
        tn.node.alloc_state() == AllocState::Allocated
    })
    .await
    .unwrap();
    assert_eq!(tn.node.id(), NodeId::new(51).unwrap());
    assert_eq!(tn.node.retry_count(), 1);
    // The peer keeps 50 in our table.
    assert!(tn.node.allocation_table().contains(50).unwrap());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let infos = tn.node_infos();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[1].envelope.source_node_id, NodeId::new(51).unwrap());

    let last = tn.heartbeats().pop().unwrap();
    assert_eq!(last.envelope.source_node_id, NodeId::new(51).unwrap());

    tn.shutdown().await;
}

/// Heartbeats echoed back from our own socket are not conflicts.
#[tokio::test(start_paused = true)]
async fn test_own_echo_is_not_a_conflict() {
    let tn = TestNodeBuilder::new(60).addr("10.0.0.60:9382").build();
    tokio::time::sleep(Duration::from_millis(500)).await;

    tn.inject(foreign_heartbeat(60), "10.0.0.60:9382");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(tn.node.alloc_state(), AllocState::Allocated);
    assert_eq!(tn.node.id(), NodeId::new(60).unwrap());

    tn.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_nodes_discover_each_other() {
    let a = TestNodeBuilder::new(10).build();
    let b = TestNodeBuilder::new(20).build();
    connect(&a, &b);

    a.wait_until(Duration::from_secs(3), |a| {
        a.node.allocation_table().contains(20).unwrap_or(false)
    })
    .await
    .unwrap();
    b.wait_until(Duration::from_secs(3), |b| {
        b.node.allocation_table().contains(10).unwrap_or(false)
    })
    .await
    .unwrap();

    assert_eq!(a.node.id(), NodeId::new(10).unwrap());
    assert_eq!(b.node.id(), NodeId::new(20).unwrap());
    assert_eq!(a.node.allocation_table().snapshot(), vec![10, 20]);

    a.shutdown().await;
    b.shutdown().await;
}

/// Two nodes in one process share a table and never collide.
#[tokio::test(start_paused = true)]
async fn test_shared_table_avoids_collision() {
    let table = Arc::new(AllocationTable::new());
    let a = TestNodeBuilder::new(30).table(table.clone()).build();
    let b = TestNodeBuilder::new(30)
        .addr("10.0.1.30:9382")
        .table(table.clone())
        .build();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let ids: BTreeSet<u8> = [a.node.id().get(), b.node.id().get()].into_iter().collect();
    assert_eq!(ids, BTreeSet::from([1, 30]));
    assert_eq!(table.snapshot(), vec![1, 30]);

    a.shutdown().await;
    b.shutdown().await;
}
