//! fedmeshd — federated averaging node.
//!
//! `fedmeshd` runs a coordinator until Ctrl-C.
//! `fedmeshd <coordinator-addr>` joins that coordinator, contributes its
//! encrypted weights once, applies the aggregate and exits.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};

use fedmesh_core::config::FedmeshConfig;
use fedmesh_core::{FeedForward, SharedMaskAlgebra};
use fedmeshd::{Node, NodeEvent};

type DaemonNode = Node<SharedMaskAlgebra, FeedForward>;

/// How long to wait for Parameters before re-sending Join.
const JOIN_RETRY: Duration = Duration::from_secs(3);
const JOIN_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = FedmeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FedmeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FedmeshConfig::default()
    });

    let algebra = SharedMaskAlgebra::new(config.algebra.mask_seed);
    let node = Node::bind(&config, algebra, FeedForward::default())
        .await
        .context("failed to start node")?;

    let result = match std::env::args().nth(1) {
        None => run_coordinator(&node).await,
        Some(coordinator) => run_participant(&node, &coordinator).await,
    };
    node.shutdown();
    result
}

async fn run_coordinator(node: &DaemonNode) -> Result<()> {
    tracing::info!(address = %node.address(), "coordinator ready");
    let mut events = node.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(NodeEvent::RoundAggregated { round, participants }) => {
                    tracing::info!(round, participants, "round complete");
                }
                Ok(event) => tracing::debug!(?event, "node event"),
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "event stream lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn run_participant(node: &DaemonNode, coordinator: &str) -> Result<()> {
    tracing::info!(address = %node.address(), %coordinator, "participant starting");
    let mut events = node.subscribe();

    // Join has no acknowledgment; repeat it until Parameters arrive.
    let mut joined = false;
    for attempt in 1..=JOIN_ATTEMPTS {
        node.join(coordinator).await.context("failed to send join")?;
        let wait = wait_for(&mut events, |e| matches!(e, NodeEvent::ParametersApplied(_)));
        if tokio::time::timeout(JOIN_RETRY, wait).await.is_ok() {
            joined = true;
            break;
        }
        tracing::warn!(attempt, "no parameters yet, retrying join");
    }
    if !joined {
        bail!("coordinator {coordinator} did not answer {JOIN_ATTEMPTS} join attempts");
    }

    node.send_weights(coordinator)
        .await
        .context("failed to contribute weights")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted before the round closed");
        }
        event = wait_for(&mut events, |e| matches!(e, NodeEvent::ResultApplied { .. })) => {
            if let Some(NodeEvent::ResultApplied { weights, .. }) = event {
                tracing::info!(?weights, "round complete, model updated");
            }
        }
    }
    Ok(())
}

/// Next event matching `pred`, or `None` once the stream closes.
async fn wait_for(
    events: &mut broadcast::Receiver<NodeEvent>,
    pred: impl Fn(&NodeEvent) -> bool,
) -> Option<NodeEvent> {
    loop {
        match events.recv().await {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}
