//! Contribution log — every envelope the coordinator processed, plus the
//! batch of encrypted contributions for the round in progress.
//!
//! The history is append-only and never pruned. The batch is tagged with a
//! round counter and emptied when the round closes, so a chunk arriving after
//! aggregation starts the next round instead of re-triggering the last one.

use fedmesh_core::wire::{Envelope, PacketType};

use crate::registry::ParticipantRegistry;

/// One participant's serialized ciphertext for the current round.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub source: String,
    pub ciphertext: String,
}

/// What [`ContributionLog::record`] did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Stored in the history only (not an EncryptedChunk).
    History,
    /// First contribution from this source in the current round.
    Contribution,
    /// This source had already contributed this round; the newer ciphertext
    /// replaced the older one.
    Replaced,
}

/// A closed round, ready to aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedRound {
    pub round: u64,
    /// In registry (join) order.
    pub contributions: Vec<Contribution>,
}

#[derive(Debug, Default)]
pub struct ContributionLog {
    history: Vec<Envelope>,
    round: u64,
    batch: Vec<Contribution>,
}

impl ContributionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, envelope: Envelope) -> Recorded {
        let outcome = if envelope.kind == PacketType::EncryptedChunk {
            let contribution = Contribution {
                source: envelope.source.clone(),
                ciphertext: envelope.message.clone(),
            };
            match self.batch.iter_mut().find(|c| c.source == contribution.source) {
                Some(existing) => {
                    *existing = contribution;
                    Recorded::Replaced
                }
                None => {
                    self.batch.push(contribution);
                    Recorded::Contribution
                }
            }
        } else {
            Recorded::History
        };
        self.history.push(envelope);
        outcome
    }

    pub fn history(&self) -> &[Envelope] {
        &self.history
    }

    pub fn by_type(&self, kind: PacketType) -> Vec<&Envelope> {
        self.history.iter().filter(|e| e.kind == kind).collect()
    }

    /// Index of the round currently collecting contributions.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn batch(&self) -> &[Contribution] {
        &self.batch
    }

    /// True once every registered participant has contributed to the current
    /// round. Never true with an empty registry.
    pub fn quorum_reached(&self, registry: &ParticipantRegistry) -> bool {
        !registry.is_empty()
            && registry
                .addresses()
                .iter()
                .all(|p| self.batch.iter().any(|c| &c.source == p))
    }

    /// Close the current round if quorum is reached.
    ///
    /// Contributions from unregistered sources do not count toward quorum and
    /// are discarded with the batch.
    pub fn close_round(&mut self, registry: &ParticipantRegistry) -> Option<ClosedRound> {
        if !self.quorum_reached(registry) {
            return None;
        }

        let mut batch = std::mem::take(&mut self.batch);
        let contributions: Vec<Contribution> = registry
            .addresses()
            .iter()
            .filter_map(|p| {
                let pos = batch.iter().position(|c| &c.source == p)?;
                Some(batch.swap_remove(pos))
            })
            .collect();
        if !batch.is_empty() {
            tracing::debug!(
                round = self.round,
                dropped = batch.len(),
                "discarding contributions from unregistered sources"
            );
        }

        let closed = ClosedRound {
            round: self.round,
            contributions,
        };
        self.round += 1;
        Some(closed)
    }
}
