//! fedmesh integration test harness.
//!
//! Every test runs real nodes on 127.0.0.1 with OS-assigned ports, so tests
//! can run in parallel without stepping on each other:
//!
//!   cargo test --test integration
//!
//! Nodes are observed through their event streams; every wait is bounded by
//! [`EVENT_TIMEOUT`].

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};

use fedmesh_core::config::FedmeshConfig;
use fedmesh_core::model::{Model, ModelError};
use fedmesh_core::wire::Parameters;
use fedmesh_core::PlainAlgebra;
use fedmeshd::{Node, NodeEvent};

mod scenario;
mod training;
mod wire;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Model double: a bare weight vector of any length.
#[derive(Debug, Clone, Default)]
pub struct VectorModel {
    weights: Vec<f64>,
}

impl Model for VectorModel {
    fn initialize(&mut self, params: &Parameters) {
        self.weights = vec![0.0; params.input_dimensions];
    }

    fn weights(&self) -> Vec<f64> {
        self.weights.clone()
    }

    fn set_weights(&mut self, weights: &[f64]) -> Result<(), ModelError> {
        self.weights = weights.to_vec();
        Ok(())
    }
}

pub type PlainNode = Node<PlainAlgebra, VectorModel>;

/// Defaults, bound to loopback.
pub fn config() -> FedmeshConfig {
    let mut config = FedmeshConfig::default();
    config.network.bind_addr = "127.0.0.1:0".into();
    config
}

pub async fn plain_node() -> Result<PlainNode> {
    plain_node_with(&config()).await
}

pub async fn plain_node_with(config: &FedmeshConfig) -> Result<PlainNode> {
    Node::bind(config, PlainAlgebra, VectorModel::default())
        .await
        .context("failed to bind node")
}

/// Next event matching `pred`, failing after [`EVENT_TIMEOUT`].
pub async fn wait_for(
    events: &mut broadcast::Receiver<NodeEvent>,
    what: &str,
    pred: impl Fn(&NodeEvent) -> bool,
) -> Result<NodeEvent> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => bail!("event stream closed waiting for {what}"),
            }
        }
    };
    tokio::time::timeout(EVENT_TIMEOUT, wait)
        .await
        .with_context(|| format!("timed out waiting for {what}"))?
}

/// True if no event matching `pred` shows up within `window`.
pub async fn quiet_for(
    events: &mut broadcast::Receiver<NodeEvent>,
    window: Duration,
    pred: impl Fn(&NodeEvent) -> bool,
) -> bool {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    };
    tokio::time::timeout(window, wait).await.is_err()
}

/// Join `participant` to `coordinator` and wait until it has applied the
/// returned Parameters.
pub async fn enroll<A, M>(participant: &Node<A, M>, coordinator: &str) -> Result<Parameters>
where
    A: fedmesh_core::CiphertextAlgebra,
    M: Model + Clone,
{
    let mut events = participant.subscribe();
    participant.join(coordinator).await?;
    match wait_for(&mut events, "parameters", |e| {
        matches!(e, NodeEvent::ParametersApplied(_))
    })
    .await?
    {
        NodeEvent::ParametersApplied(params) => Ok(params),
        other => bail!("unexpected event {other:?}"),
    }
}

/// Wait for a Result to be applied and return the new weights.
pub async fn applied_weights(events: &mut broadcast::Receiver<NodeEvent>) -> Result<Vec<f64>> {
    match wait_for(events, "result", |e| matches!(e, NodeEvent::ResultApplied { .. })).await? {
        NodeEvent::ResultApplied { weights, .. } => Ok(weights),
        other => bail!("unexpected event {other:?}"),
    }
}

pub fn approx_eq(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
}
