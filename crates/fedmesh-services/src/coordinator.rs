//! Coordinator role — membership, contribution collection, aggregation.
//!
//! Purely local state. The node owning a `Coordinator` decides how outbound
//! envelopes (the Parameters reply, the Result fan-out) reach the network.

use std::sync::Arc;

use fedmesh_core::algebra::{self, CiphertextAlgebra};
use fedmesh_core::model::Model;
use fedmesh_core::wire::{Envelope, Parameters};

use crate::contributions::{ContributionLog, Recorded};
use crate::registry::ParticipantRegistry;
use crate::RoleError;

/// A ciphertext to deliver, as a Result, to each recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct Fanout {
    /// Round the ciphertext closes, or `None` for a model broadcast.
    pub round: Option<u64>,
    pub ciphertext: String,
    pub recipients: Vec<String>,
}

/// Outcome of a Join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinReply {
    pub newly_registered: bool,
    /// The hyperparameters to send back to the joiner.
    pub parameters: Parameters,
}

pub struct Coordinator<A: CiphertextAlgebra, M: Model> {
    algebra: Arc<A>,
    model: M,
    parameters: Parameters,
    registry: ParticipantRegistry,
    log: ContributionLog,
}

impl<A: CiphertextAlgebra, M: Model> Coordinator<A, M> {
    pub fn new(algebra: Arc<A>, model: M, parameters: Parameters) -> Self {
        Self {
            algebra,
            model,
            parameters,
            registry: ParticipantRegistry::new(),
            log: ContributionLog::new(),
        }
    }

    /// Register the sender of a Join. The first Join builds the coordinator's
    /// own model from the configured topology.
    pub fn on_join(&mut self, envelope: Envelope) -> JoinReply {
        if self.registry.is_empty() {
            self.model.initialize(&self.parameters);
            tracing::info!(
                inputs = self.parameters.input_dimensions,
                layers = self.parameters.nb_layers,
                neurons = self.parameters.nb_neurons,
                "coordinator model initialized"
            );
        }
        let newly_registered = self.registry.register(&envelope.source);
        self.log.record(envelope);
        JoinReply {
            newly_registered,
            parameters: self.parameters.clone(),
        }
    }

    /// Store an EncryptedChunk (or any other envelope) in the log.
    pub fn record(&mut self, envelope: Envelope) -> Recorded {
        self.log.record(envelope)
    }

    /// Aggregate the current round if every participant has contributed.
    ///
    /// The round is closed before the ciphertexts are combined, so a failure
    /// here loses the round rather than leaving it half-open.
    pub fn try_aggregate(&mut self) -> Result<Option<Fanout>, RoleError> {
        let Some(closed) = self.log.close_round(&self.registry) else {
            return Ok(None);
        };

        let texts: Vec<&str> = closed
            .contributions
            .iter()
            .map(|c| c.ciphertext.as_str())
            .collect();
        let ciphertext = algebra::mean(self.algebra.as_ref(), &texts)?;

        tracing::info!(
            round = closed.round,
            participants = texts.len(),
            "round aggregated"
        );

        Ok(Some(Fanout {
            round: Some(closed.round),
            ciphertext,
            recipients: closed.contributions.into_iter().map(|c| c.source).collect(),
        }))
    }

    /// Encrypt the coordinator's own weights for every registered participant,
    /// so all of them start from the same model.
    pub fn model_broadcast(&self) -> Result<Option<Fanout>, RoleError> {
        if self.registry.is_empty() {
            return Ok(None);
        }
        let weights = self.model.weights();
        if weights.is_empty() {
            return Err(RoleError::NoWeights);
        }
        Ok(Some(Fanout {
            round: None,
            ciphertext: self.algebra.seal(&weights)?,
            recipients: self.registry.addresses().to_vec(),
        }))
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn log(&self) -> &ContributionLog {
        &self.log
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}
