//! Participant role — adopts hyperparameters, seals weights, applies results.

use std::sync::Arc;

use fedmesh_core::algebra::CiphertextAlgebra;
use fedmesh_core::model::Model;
use fedmesh_core::wire::{Envelope, Parameters};

use crate::RoleError;

pub struct Client<A: CiphertextAlgebra, M: Model> {
    algebra: Arc<A>,
    model: M,
    parameters: Option<Parameters>,
}

impl<A: CiphertextAlgebra, M: Model> Client<A, M> {
    pub fn new(algebra: Arc<A>, model: M) -> Self {
        Self {
            algebra,
            model,
            parameters: None,
        }
    }

    /// Adopt the hyperparameters carried by a Parameters envelope and rebuild
    /// the local model. An envelope without params, or with params that fail
    /// [`Parameters::validate`], is ignored.
    pub fn on_parameters(&mut self, envelope: &Envelope) -> Option<&Parameters> {
        let Some(params) = envelope.params.clone() else {
            tracing::warn!(source = %envelope.source, "parameters envelope without params");
            return None;
        };
        if let Err(e) = params.validate() {
            tracing::warn!(source = %envelope.source, error = %e, "rejecting coordinator parameters");
            return None;
        }
        self.model.initialize(&params);
        tracing::info!(
            source = %envelope.source,
            weights = self.model.weights().len(),
            "model initialized from coordinator parameters"
        );
        self.parameters = Some(params);
        self.parameters.as_ref()
    }

    /// Encrypt the current weights for contribution.
    pub fn seal_weights(&self) -> Result<String, RoleError> {
        let weights = self.model.weights();
        if weights.is_empty() {
            return Err(RoleError::NoWeights);
        }
        Ok(self.algebra.seal(&weights)?)
    }

    /// Encrypt an arbitrary vector, bypassing the model.
    pub fn seal(&self, values: &[f64]) -> Result<String, RoleError> {
        Ok(self.algebra.seal(values)?)
    }

    /// Decrypt an aggregated ciphertext and overwrite the model's weights.
    pub fn on_result(&mut self, ciphertext: &str) -> Result<Vec<f64>, RoleError> {
        let weights = self.algebra.open(ciphertext)?;
        self.model.set_weights(&weights)?;
        Ok(weights)
    }

    pub fn parameters(&self) -> Option<&Parameters> {
        self.parameters.as_ref()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }
}
