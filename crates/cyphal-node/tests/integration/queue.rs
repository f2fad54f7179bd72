//! Transmit queue under concurrent producers, and its drain order on the wire.

use std::time::Duration;

use cyphal_node::{QueueError, TxQueue};
use cyphal_protocol::{Envelope, ErrorKind, Priority};

use crate::harness::TestNodeBuilder;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_keep_order() {
    let queue = TxQueue::new();
    let mut producers = Vec::new();
    for producer in 0..4u16 {
        let queue = queue.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..16u16 {
                let priority = Priority::ALL[usize::from(i % 8)];
                let envelope = Envelope::create(producer * 100 + i, priority, &[]).unwrap();
                queue.push(envelope).await.unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    assert_eq!(queue.len().await.unwrap(), 64);

    let overflow = Envelope::create(999, Priority::Exceptional, b"late").unwrap();
    let rejected = queue.push(overflow.clone()).await.unwrap_err();
    assert_eq!(rejected.error, QueueError::Full { capacity: 64 });
    assert_eq!(rejected.error.kind(), ErrorKind::QueueFull);
    assert!(rejected.into_envelope().same_content(&overflow));

    let mut drained = Vec::new();
    while let Some(envelope) = queue.pop().await.unwrap() {
        drained.push(envelope);
    }
    assert_eq!(drained.len(), 64);
    for pair in drained.windows(2) {
        assert!(pair[0].priority <= pair[1].priority);
    }
    // Within one priority, each producer's envelopes stay in push order.
    for priority in Priority::ALL {
        for producer in 0..4u16 {
            let subjects: Vec<u16> = drained
                .iter()
                .filter(|e| e.priority == priority && e.subject_id / 100 == producer)
                .map(|e| e.subject_id)
                .collect();
            let mut sorted = subjects.clone();
            sorted.sort_unstable();
            assert_eq!(subjects, sorted);
        }
    }
}

/// A burst staged before the transmitter runs leaves in priority order,
/// FIFO within a priority.
#[tokio::test(start_paused = true)]
async fn test_transmitter_drains_by_priority() {
    let tn = TestNodeBuilder::new(70).without_heartbeat().build();
    for (subject, priority) in [
        (1, Priority::Low),
        (2, Priority::Exceptional),
        (3, Priority::Nominal),
        (4, Priority::Exceptional),
    ] {
        tn.queue
            .push(Envelope::create(subject, priority, &[subject as u8]).unwrap())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let order: Vec<u16> = tn.sent().iter().map(|c| c.envelope.subject_id).collect();
    assert_eq!(order, vec![2, 4, 3, 1]);
    assert!(tn.queue.is_empty().await.unwrap());

    tn.shutdown().await;
}

#[tokio::test]
async fn test_clear_then_reuse() {
    let queue = TxQueue::new();
    for i in 0..10 {
        queue
            .push(Envelope::create(i, Priority::Slow, &[]).unwrap())
            .await
            .unwrap();
    }
    assert_eq!(queue.clear().await.unwrap(), 10);
    assert_eq!(queue.peek_priority().await.unwrap(), None);

    queue
        .push(Envelope::create(7, Priority::Fast, &[]).unwrap())
        .await
        .unwrap();
    assert_eq!(queue.peek_priority().await.unwrap(), Some(Priority::Fast));
    assert_eq!(queue.pop().await.unwrap().unwrap().subject_id, 7);
}
