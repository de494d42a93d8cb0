//! fedmesh-services — coordinator and participant state machines.
//!
//! Nothing here touches the network. The daemon feeds envelopes in and turns
//! the returned values into outbound traffic.

pub mod client;
pub mod contributions;
pub mod coordinator;
pub mod registry;

pub use client::Client;
pub use contributions::{ClosedRound, Contribution, ContributionLog, Recorded};
pub use coordinator::{Coordinator, Fanout, JoinReply};
pub use registry::ParticipantRegistry;

use fedmesh_core::algebra::AlgebraError;
use fedmesh_core::model::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error(transparent)]
    Algebra(#[from] AlgebraError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("model has no weights to contribute")]
    NoWeights,
}
