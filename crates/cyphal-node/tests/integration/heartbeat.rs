//! Heartbeat publication -- cadence, interval changes, anonymous nodes.

use std::sync::Arc;
use std::time::Duration;

use cyphal_identity::{AllocState, AllocationTable};
use cyphal_protocol::{Health, Mode, NodeId, Priority, HEARTBEAT_SUBJECT_ID};

use crate::harness::TestNodeBuilder;

/// Ten seconds at 1 Hz: ten heartbeats, exactly one interval apart, uptime
/// counting up from zero.
#[tokio::test(start_paused = true)]
async fn test_heartbeat_cadence_has_no_drift() {
    let tn = TestNodeBuilder::new(10).build();
    tokio::time::sleep(Duration::from_millis(10_500)).await;

    let beats = tn.heartbeats();
    assert_eq!(beats.len(), 10, "expected 10 heartbeats, got {}", beats.len());
    for pair in beats.windows(2) {
        assert_eq!(pair[1].at - pair[0].at, Duration::from_millis(1000));
    }
    for beat in &beats {
        assert_eq!(beat.envelope.source_node_id, NodeId::new(10).unwrap());
        assert_eq!(beat.envelope.priority, Priority::Nominal);
        assert_eq!(beat.dest, "239.0.29.85:9382".parse::<std::net::SocketAddr>().unwrap());
    }

    let uptimes: Vec<u32> = tn.heartbeat_payloads().iter().map(|p| p.uptime_sec).collect();
    assert_eq!(uptimes, (0..10).collect::<Vec<u32>>());
    assert_eq!(tn.node.uptime_sec(), 10);

    tn.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_reports_current_state() {
    let tn = TestNodeBuilder::new(11).build();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    tn.node.set_health(Health::Warning).unwrap();
    tn.node.set_mode(Mode::Maintenance).unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let payloads = tn.heartbeat_payloads();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[0].mode, Mode::Initialization);
    assert_eq!(payloads[0].health, Health::Nominal);
    assert_eq!(payloads[1].mode, Mode::Maintenance);
    assert_eq!(payloads[1].health, Health::Warning);

    tn.shutdown().await;
}

/// A shorter interval takes effect on the running driver without a restart.
#[tokio::test(start_paused = true)]
async fn test_interval_change_while_running() {
    let tn = TestNodeBuilder::new(12).build();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(tn.heartbeats().len(), 2);

    tn.heartbeat.set_interval(200).unwrap();
    assert!(tn.heartbeat.is_enabled());
    tokio::time::sleep(Duration::from_millis(950)).await;

    let beats = tn.heartbeats();
    assert_eq!(beats.len(), 7, "got {} heartbeats", beats.len());
    let tail = &beats[2..];
    for pair in tail.windows(2) {
        assert_eq!(pair[1].at - pair[0].at, Duration::from_millis(200));
    }

    assert!(tn.heartbeat.set_interval(60_001).is_err());
    assert_eq!(tn.heartbeat.get_interval(), 200);

    tn.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_halts_publication() {
    let tn = TestNodeBuilder::new(13).build();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    tn.heartbeat.stop();
    tn.heartbeat.stop();
    assert!(!tn.heartbeat.is_enabled());
    let before = tn.heartbeats().len();

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(tn.heartbeats().len(), before);

    tn.heartbeat.start().unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(tn.heartbeats().len(), before + 1);

    tn.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_heartbeat_still_sends_on_demand() {
    let tn = TestNodeBuilder::new(14).without_heartbeat().build();
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert!(tn.heartbeats().is_empty());

    tn.heartbeat.send_now().await.unwrap();
    tn.wait_until(Duration::from_secs(1), |tn| tn.heartbeats().len() == 1)
        .await
        .unwrap();
    assert_eq!(
        tn.heartbeats()[0].envelope.subject_id,
        HEARTBEAT_SUBJECT_ID
    );

    tn.shutdown().await;
}

/// Every node id is taken: allocation fails and the node stays anonymous,
/// publishing heartbeats without a source id.
#[tokio::test(start_paused = true)]
async fn test_anonymous_heartbeat_when_ids_exhausted() {
    let table = Arc::new(AllocationTable::new());
    for raw in 1..=127 {
        table.mark_in_use(NodeId::new(raw).unwrap()).unwrap();
    }
    let tn = TestNodeBuilder::new(5).table(table).build();
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(tn.node.alloc_state(), AllocState::Failed);
    assert!(tn.node.id().is_unset());
    assert!(tn.node_infos().is_empty());

    let beats = tn.heartbeats();
    assert_eq!(beats.len(), 3);
    assert!(beats.iter().all(|b| b.envelope.source_node_id.is_unset()));

    tn.shutdown().await;
}
