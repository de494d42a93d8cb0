use std::time::Duration;

use anyhow::Result;

use fedmesh_core::wire::{PacketType, Parameters};
use fedmeshd::NodeEvent;

use crate::*;

/// Two participants contribute [3, 4] and [5, 10]; both end up with [4, 7].
#[tokio::test]
async fn test_two_participants_average() -> Result<()> {
    let coordinator = plain_node().await?;
    let a = plain_node().await?;
    let b = plain_node().await?;

    let params = enroll(&a, coordinator.address()).await?;
    assert_eq!(params, Parameters::default());
    enroll(&b, coordinator.address()).await?;
    assert_eq!(coordinator.participants().await, [a.address(), b.address()]);

    let mut coordinator_events = coordinator.subscribe();
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.contribute(coordinator.address(), &[3.0, 4.0]).await?;
    wait_for(&mut coordinator_events, "first contribution", |e| {
        matches!(e, NodeEvent::ContributionRecorded { .. })
    })
    .await?;
    assert_eq!(coordinator.round().await, 0, "one chunk must not close the round");

    b.contribute(coordinator.address(), &[5.0, 10.0]).await?;
    let aggregated = wait_for(&mut coordinator_events, "aggregation", |e| {
        matches!(e, NodeEvent::RoundAggregated { .. })
    })
    .await?;
    assert_eq!(
        aggregated,
        NodeEvent::RoundAggregated {
            round: 0,
            participants: 2
        }
    );

    let a_weights = applied_weights(&mut a_events).await?;
    let b_weights = applied_weights(&mut b_events).await?;
    assert!(approx_eq(&a_weights, &[4.0, 7.0]), "A got {a_weights:?}");
    assert!(approx_eq(&b_weights, &[4.0, 7.0]), "B got {b_weights:?}");
    assert!(approx_eq(&a.weights().await, &[4.0, 7.0]));

    assert_eq!(coordinator.round().await, 1);
    assert_eq!(
        coordinator.history_by_type(PacketType::EncryptedChunk).await.len(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn test_join_is_idempotent() -> Result<()> {
    let coordinator = plain_node().await?;
    let a = plain_node().await?;
    let mut events = coordinator.subscribe();

    enroll(&a, coordinator.address()).await?;
    enroll(&a, coordinator.address()).await?;

    let first = wait_for(&mut events, "first join", |e| {
        matches!(e, NodeEvent::ParticipantJoined { .. })
    })
    .await?;
    let second = wait_for(&mut events, "second join", |e| {
        matches!(e, NodeEvent::ParticipantJoined { .. })
    })
    .await?;
    assert!(matches!(first, NodeEvent::ParticipantJoined { newly_registered: true, .. }));
    assert!(matches!(second, NodeEvent::ParticipantJoined { newly_registered: false, .. }));

    assert_eq!(coordinator.participants().await.len(), 1);
    assert_eq!(coordinator.history_by_type(PacketType::Join).await.len(), 2);
    Ok(())
}

/// Quorum counts participants, not chunks: a late second chunk from one
/// participant opens the next round instead of re-firing the last one.
#[tokio::test]
async fn test_late_chunk_does_not_retrigger() -> Result<()> {
    let coordinator = plain_node().await?;
    let a = plain_node().await?;
    let b = plain_node().await?;
    enroll(&a, coordinator.address()).await?;
    enroll(&b, coordinator.address()).await?;

    let mut events = coordinator.subscribe();
    let mut a_events = a.subscribe();
    a.contribute(coordinator.address(), &[1.0]).await?;
    b.contribute(coordinator.address(), &[3.0]).await?;
    wait_for(&mut events, "round 0", |e| {
        matches!(e, NodeEvent::RoundAggregated { round: 0, .. })
    })
    .await?;
    assert!(approx_eq(&applied_weights(&mut a_events).await?, &[2.0]));

    a.contribute(coordinator.address(), &[9.0]).await?;
    a.contribute(coordinator.address(), &[11.0]).await?;
    assert!(
        quiet_for(&mut events, Duration::from_millis(400), |e| {
            matches!(e, NodeEvent::RoundAggregated { .. })
        })
        .await,
        "round re-fired without B"
    );
    assert_eq!(coordinator.round().await, 1);

    // B closes round 1 with A's latest contribution.
    b.contribute(coordinator.address(), &[1.0]).await?;
    let weights = applied_weights(&mut a_events).await?;
    assert!(approx_eq(&weights, &[6.0]), "A got {weights:?}");
    Ok(())
}

/// Vectors long enough that every chunk and result is fragmented.
#[tokio::test]
async fn test_three_participants_large_vectors() -> Result<()> {
    let coordinator = plain_node().await?;
    let nodes = [plain_node().await?, plain_node().await?, plain_node().await?];
    for node in &nodes {
        enroll(node, coordinator.address()).await?;
    }

    // 8 000 values encode to 128 000 hex characters: three fragments.
    let len = 8_000;
    let mut receivers: Vec<_> = nodes.iter().map(|n| n.subscribe()).collect();
    for (i, node) in nodes.iter().enumerate() {
        let values: Vec<f64> = (0..len).map(|j| (i * len + j) as f64).collect();
        node.contribute(coordinator.address(), &values).await?;
    }

    let expected: Vec<f64> = (0..len).map(|j| (len + j) as f64).collect();
    for events in &mut receivers {
        let weights = applied_weights(events).await?;
        assert!(approx_eq(&weights, &expected));
    }
    Ok(())
}

#[tokio::test]
async fn test_free_text_is_logged() -> Result<()> {
    let a = plain_node().await?;
    let b = plain_node().await?;
    let mut events = b.subscribe();

    a.send_text(b.address(), "tweet tweet").await?;
    let event = wait_for(&mut events, "text", |e| {
        matches!(e, NodeEvent::TextReceived { .. })
    })
    .await?;
    assert_eq!(
        event,
        NodeEvent::TextReceived {
            source: a.address().to_string(),
            message: "tweet tweet".into(),
        }
    );

    let logged = b.history_by_type(PacketType::Unspecified).await;
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].message, "tweet tweet");
    Ok(())
}
