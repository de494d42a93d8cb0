//! Node — one UDP endpoint playing coordinator, participant, or both.
//!
//! A single listen task pulls envelopes off the transport and dispatches them
//! to the role state machines. Replies and the Result multicast go out on
//! their own tasks so a slow peer never stalls the listener.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{broadcast, Mutex};

use fedmesh_core::algebra::CiphertextAlgebra;
use fedmesh_core::config::FedmeshConfig;
use fedmesh_core::model::Model;
use fedmesh_core::wire::{Envelope, PacketType, Parameters};
use fedmesh_services::{Client, Coordinator, Fanout, Recorded, RoleError};

use crate::endpoint::{Endpoint, EndpointError};
use crate::transport::{Inbound, Transport, TransportError};

const EVENT_CAPACITY: usize = 256;

// ── Events ───────────────────────────────────────────────────────────────────

/// State transitions observable through [`Node::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    ParticipantJoined {
        address: String,
        newly_registered: bool,
    },
    ParametersApplied(Parameters),
    ContributionRecorded {
        source: String,
        round: u64,
        replaced: bool,
    },
    RoundAggregated {
        round: u64,
        participants: usize,
    },
    ResultApplied {
        source: String,
        weights: Vec<f64>,
    },
    TextReceived {
        source: String,
        message: String,
    },
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Role(#[from] RoleError),
}

// ── Node ─────────────────────────────────────────────────────────────────────

pub struct Node<A: CiphertextAlgebra, M: Model + Clone> {
    shared: Arc<Shared<A, M>>,
    shutdown: broadcast::Sender<()>,
}

impl<A: CiphertextAlgebra, M: Model + Clone> Clone for Node<A, M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

struct Shared<A: CiphertextAlgebra, M: Model> {
    transport: Transport,
    client: Mutex<Client<A, M>>,
    coordinator: Mutex<Coordinator<A, M>>,
    events: broadcast::Sender<NodeEvent>,
}

impl<A: CiphertextAlgebra, M: Model + Clone> Node<A, M> {
    /// Bind the endpoint and start listening.
    ///
    /// The coordinator role gets a clone of `model`; the participant role
    /// keeps the original.
    pub async fn bind(config: &FedmeshConfig, algebra: A, model: M) -> Result<Self, NodeError> {
        let endpoint = Endpoint::bind(&config.network).await?;
        let transport = Transport::new(endpoint, config.transport.clone());

        let algebra = Arc::new(algebra);
        let coordinator = Coordinator::new(algebra.clone(), model.clone(), config.training.clone());
        let client = Client::new(algebra, model);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);

        let inbound = transport.inbound();
        let shared = Arc::new(Shared {
            transport,
            client: Mutex::new(client),
            coordinator: Mutex::new(coordinator),
            events,
        });

        tokio::spawn(listen_loop(shared.clone(), inbound, shutdown.subscribe()));
        tracing::info!(address = %shared.transport.address(), "node listening");

        Ok(Self { shared, shutdown })
    }

    pub fn address(&self) -> &str {
        self.shared.transport.address()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.events.subscribe()
    }

    /// Stop the listen task. In-flight sends finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    // ── Participant operations ───────────────────────────────────────────────

    pub async fn join(&self, coordinator: &str) -> Result<(), NodeError> {
        let envelope = Envelope::join(self.address(), coordinator);
        self.shared.transport.send(envelope).await?;
        tracing::info!(%coordinator, "join sent");
        Ok(())
    }

    /// Encrypt the local model's weights and contribute them.
    pub async fn send_weights(&self, coordinator: &str) -> Result<(), NodeError> {
        let ciphertext = self.shared.client.lock().await.seal_weights()?;
        self.send_chunk(coordinator, ciphertext).await
    }

    /// Encrypt `values` and contribute them, bypassing the local model.
    pub async fn contribute(&self, coordinator: &str, values: &[f64]) -> Result<(), NodeError> {
        let ciphertext = self.shared.client.lock().await.seal(values)?;
        self.send_chunk(coordinator, ciphertext).await
    }

    async fn send_chunk(&self, coordinator: &str, ciphertext: String) -> Result<(), NodeError> {
        let len = ciphertext.len();
        let envelope = Envelope::new(self.address(), coordinator, PacketType::EncryptedChunk, ciphertext);
        self.shared.transport.send(envelope).await?;
        tracing::info!(%coordinator, ciphertext_len = len, "contribution sent");
        Ok(())
    }

    pub async fn send_text(&self, destination: &str, text: &str) -> Result<(), NodeError> {
        let envelope = Envelope::new(self.address(), destination, PacketType::Unspecified, text);
        self.shared.transport.send(envelope).await?;
        Ok(())
    }

    /// Run `f` against the local model, e.g. to train between rounds.
    pub async fn with_model<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        f(self.shared.client.lock().await.model_mut())
    }

    pub async fn weights(&self) -> Vec<f64> {
        self.shared.client.lock().await.model().weights()
    }

    /// Hyperparameters received from a coordinator, if any.
    pub async fn parameters(&self) -> Option<Parameters> {
        self.shared.client.lock().await.parameters().cloned()
    }

    // ── Coordinator operations ───────────────────────────────────────────────

    /// Send the coordinator's own initialized weights to every participant,
    /// so the first round starts from a common model. Returns how many
    /// participants were reached.
    pub async fn start_learning(&self) -> Result<usize, NodeError> {
        let fanout = self.shared.coordinator.lock().await.model_broadcast()?;
        let Some(fanout) = fanout else {
            tracing::warn!("start_learning with no registered participants");
            return Ok(0);
        };

        let sends = fanout.recipients.iter().map(|recipient| {
            let envelope = Envelope::new(
                self.address(),
                recipient.as_str(),
                PacketType::Result,
                fanout.ciphertext.clone(),
            );
            self.shared.transport.send(envelope)
        });
        let results = join_all(sends).await;

        let mut reached = 0;
        for (recipient, result) in fanout.recipients.iter().zip(results) {
            match result {
                Ok(()) => reached += 1,
                Err(e) => tracing::warn!(peer = %recipient, error = %e, "model broadcast failed"),
            }
        }
        tracing::info!(reached, participants = fanout.recipients.len(), "learning started");
        Ok(reached)
    }

    pub async fn participants(&self) -> Vec<String> {
        self.shared
            .coordinator
            .lock()
            .await
            .registry()
            .addresses()
            .to_vec()
    }

    /// Every processed envelope of one type, oldest first.
    pub async fn history_by_type(&self, kind: PacketType) -> Vec<Envelope> {
        self.shared
            .coordinator
            .lock()
            .await
            .log()
            .by_type(kind)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Round currently collecting contributions.
    pub async fn round(&self) -> u64 {
        self.shared.coordinator.lock().await.log().round()
    }

    pub async fn coordinator_weights(&self) -> Vec<f64> {
        self.shared.coordinator.lock().await.model().weights()
    }
}

// ── Listen loop ──────────────────────────────────────────────────────────────

async fn listen_loop<A: CiphertextAlgebra, M: Model>(
    shared: Arc<Shared<A, M>>,
    mut inbound: Inbound,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(address = %shared.transport.address(), "listener stopped");
                break;
            }
            received = inbound.recv() => match received {
                Ok(envelope) => shared.dispatch(envelope).await,
                Err(e) => tracing::warn!(error = %e, "receive failed"),
            },
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

impl<A: CiphertextAlgebra, M: Model> Shared<A, M> {
    async fn dispatch(&self, envelope: Envelope) {
        tracing::debug!(source = %envelope.source, kind = %envelope.kind, "envelope received");

        match envelope.kind {
            PacketType::Join => self.on_join(envelope).await,
            PacketType::Parameters => self.on_parameters(envelope).await,
            PacketType::EncryptedChunk => self.on_contribution(envelope).await,
            PacketType::Result => self.on_result(envelope).await,
            PacketType::Unspecified => self.on_text(envelope).await,
            PacketType::Acknowledgment => {
                tracing::trace!(source = %envelope.source, "stray acknowledgment");
                return;
            }
        }

        self.aggregate().await;
    }

    async fn on_join(&self, envelope: Envelope) {
        let address = envelope.source.clone();
        let reply = self.coordinator.lock().await.on_join(envelope);
        if reply.newly_registered {
            tracing::info!(participant = %address, "participant registered");
        }

        let parameters = Envelope::parameters(self.transport.address(), address.as_str(), reply.parameters);
        self.spawn_send(parameters);
        self.emit(NodeEvent::ParticipantJoined {
            address,
            newly_registered: reply.newly_registered,
        });
    }

    async fn on_parameters(&self, envelope: Envelope) {
        let applied = self.client.lock().await.on_parameters(&envelope).cloned();
        self.coordinator.lock().await.record(envelope);
        if let Some(parameters) = applied {
            self.emit(NodeEvent::ParametersApplied(parameters));
        }
    }

    async fn on_contribution(&self, envelope: Envelope) {
        let source = envelope.source.clone();
        let (recorded, round) = {
            let mut coordinator = self.coordinator.lock().await;
            let recorded = coordinator.record(envelope);
            (recorded, coordinator.log().round())
        };
        tracing::debug!(%source, round, ?recorded, "contribution recorded");
        self.emit(NodeEvent::ContributionRecorded {
            source,
            round,
            replaced: recorded == Recorded::Replaced,
        });
    }

    async fn on_result(&self, envelope: Envelope) {
        let source = envelope.source.clone();
        let applied = self.client.lock().await.on_result(&envelope.message);
        self.coordinator.lock().await.record(envelope);
        match applied {
            Ok(weights) => {
                tracing::info!(%source, weights = weights.len(), "aggregated weights applied");
                self.emit(NodeEvent::ResultApplied { source, weights });
            }
            Err(e) => tracing::warn!(%source, error = %e, "failed to apply result"),
        }
    }

    async fn on_text(&self, envelope: Envelope) {
        tracing::info!(source = %envelope.source, message = %envelope.message, "text received");
        let event = NodeEvent::TextReceived {
            source: envelope.source.clone(),
            message: envelope.message.clone(),
        };
        self.coordinator.lock().await.record(envelope);
        self.emit(event);
    }

    async fn aggregate(&self) {
        let outcome = self.coordinator.lock().await.try_aggregate();
        match outcome {
            Ok(Some(fanout)) => self.multicast(fanout),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "aggregation failed, round dropped"),
        }
    }

    /// One Result per contributor, each on its own task.
    fn multicast(&self, fanout: Fanout) {
        let participants = fanout.recipients.len();
        for recipient in &fanout.recipients {
            let envelope = Envelope::new(
                self.transport.address(),
                recipient.as_str(),
                PacketType::Result,
                fanout.ciphertext.clone(),
            );
            self.spawn_send(envelope);
        }
        if let Some(round) = fanout.round {
            self.emit(NodeEvent::RoundAggregated { round, participants });
        }
    }

    fn spawn_send(&self, envelope: Envelope) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let peer = envelope.destination.clone();
            let kind = envelope.kind;
            if let Err(e) = transport.send(envelope).await {
                tracing::warn!(%peer, %kind, error = %e, "send failed");
            }
        });
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
