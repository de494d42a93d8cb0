//! Full training loop with the reference network under masking.

use anyhow::Result;

use fedmesh_core::{FeedForward, Model, SharedMaskAlgebra};
use fedmeshd::{Node, NodeEvent};

use crate::*;

type MaskedNode = Node<SharedMaskAlgebra, FeedForward>;

async fn masked_node(seed: u64) -> Result<MaskedNode> {
    Ok(Node::bind(&config(), SharedMaskAlgebra::new(seed), FeedForward::default()).await?)
}

#[tokio::test]
async fn test_start_learning_syncs_participants() -> Result<()> {
    let coordinator = masked_node(42).await?;
    let a = masked_node(42).await?;
    let b = masked_node(42).await?;

    assert_eq!(coordinator.start_learning().await?, 0);

    enroll(&a, coordinator.address()).await?;
    enroll(&b, coordinator.address()).await?;
    assert_ne!(a.weights().await, b.weights().await, "fresh models should differ");

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    assert_eq!(coordinator.start_learning().await?, 2);

    let reference = coordinator.coordinator_weights().await;
    assert!(approx_eq(&applied_weights(&mut a_events).await?, &reference));
    assert!(approx_eq(&applied_weights(&mut b_events).await?, &reference));
    assert!(approx_eq(&a.weights().await, &b.weights().await));
    Ok(())
}

/// Each participant trains on its own sample, then the round averages them.
#[tokio::test]
async fn test_masked_round_averages_trained_weights() -> Result<()> {
    let coordinator = masked_node(7).await?;
    let a = masked_node(7).await?;
    let b = masked_node(7).await?;
    enroll(&a, coordinator.address()).await?;
    enroll(&b, coordinator.address()).await?;

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    coordinator.start_learning().await?;
    applied_weights(&mut a_events).await?;
    applied_weights(&mut b_events).await?;

    let loss_a = a
        .with_model(|m| m.train_step(&[1.0, 0.0, 0.0, 0.0], &[1.0]))
        .await?;
    let loss_b = b
        .with_model(|m| m.train_step(&[0.0, 0.0, 0.0, 1.0], &[0.0]))
        .await?;
    assert!(loss_a.is_finite() && loss_b.is_finite());

    let trained_a = a.weights().await;
    let trained_b = b.weights().await;
    let expected: Vec<f64> = trained_a
        .iter()
        .zip(&trained_b)
        .map(|(x, y)| (x + y) / 2.0)
        .collect();

    let mut coordinator_events = coordinator.subscribe();
    a.send_weights(coordinator.address()).await?;
    b.send_weights(coordinator.address()).await?;
    wait_for(&mut coordinator_events, "aggregation", |e| {
        matches!(e, NodeEvent::RoundAggregated { round: 0, participants: 2 })
    })
    .await?;

    let averaged_a = applied_weights(&mut a_events).await?;
    let averaged_b = applied_weights(&mut b_events).await?;
    assert!(approx_eq(&averaged_a, &expected), "A got {averaged_a:?}");
    assert!(approx_eq(&averaged_b, &expected), "B got {averaged_b:?}");

    // The model itself carries the averaged weights, not just the event.
    assert_eq!(a.with_model(|m| m.weights()).await, averaged_a);
    Ok(())
}

/// Contributions sealed under a different seed decrypt to garbage, but the
/// round still closes and the result is applied.
#[tokio::test]
async fn test_mismatched_seed_garbles_result() -> Result<()> {
    let coordinator = masked_node(1).await?;
    let a = masked_node(1).await?;
    let b = masked_node(2).await?;
    enroll(&a, coordinator.address()).await?;
    enroll(&b, coordinator.address()).await?;

    let mut a_events = a.subscribe();
    a.contribute(coordinator.address(), &[1.0; 25]).await?;
    b.contribute(coordinator.address(), &[1.0; 25]).await?;

    let weights = applied_weights(&mut a_events).await?;
    assert_eq!(weights.len(), 25);
    assert!(!approx_eq(&weights, &[1.0; 25]));
    Ok(())
}
