//! Fragmentation and reassembly of oversized envelopes.
//!
//! A payload longer than the fragment limit is cut into consecutive slices on
//! UTF-8 character boundaries. Every slice travels in its own [`Frame`] with a
//! [`FragmentHeader`] naming its position and the total count, so the
//! receiver never has to infer the end of a message from a slice's length.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::wire::{Envelope, Frame, FragmentHeader};

/// Hex BLAKE3 digest of a complete payload.
pub fn digest(payload: &str) -> String {
    hex::encode(blake3::hash(payload.as_bytes()).as_bytes())
}

/// Split `envelope` into frames carrying at most `max_len` bytes of payload.
///
/// An empty payload still yields one (terminal) frame. `max_len` of zero is
/// treated as one.
pub fn split(envelope: &Envelope, message_id: &str, max_len: usize) -> Vec<Frame> {
    let payload = envelope.message.as_str();
    let slices = slice_on_boundaries(payload, max_len.max(1));
    let count = slices.len() as u32;
    let digest = digest(payload);

    slices
        .into_iter()
        .enumerate()
        .map(|(index, slice)| Frame {
            source: envelope.source.clone(),
            destination: envelope.destination.clone(),
            kind: envelope.kind,
            message: slice.to_string(),
            params: envelope.params.clone(),
            fragment: Some(FragmentHeader {
                message_id: message_id.to_string(),
                index: index as u32,
                count,
                digest: digest.clone(),
            }),
        })
        .collect()
}

fn slice_on_boundaries(payload: &str, max_len: usize) -> Vec<&str> {
    if payload.is_empty() {
        return vec![""];
    }

    let mut slices = Vec::with_capacity(payload.len() / max_len + 1);
    let mut start = 0;
    while start < payload.len() {
        let mut end = (start + max_len).min(payload.len());
        while !payload.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // max_len is narrower than this character; take the whole character.
            end = start + 1;
            while !payload.is_char_boundary(end) {
                end += 1;
            }
        }
        slices.push(&payload[start..end]);
        start = end;
    }
    slices
}

// ── Reassembly ───────────────────────────────────────────────────────────────

/// Outcome of feeding one fragment into a [`Reassembly`].
#[derive(Debug, PartialEq)]
pub enum Progress {
    /// Fragment stored; more are outstanding.
    Accepted { received: u32, count: u32 },
    /// This index was already stored (a retransmission). Nothing changed.
    Duplicate,
    /// Terminal state reached; the logical envelope is rebuilt.
    Complete(Envelope),
}

/// Collects the fragments of one message from one sender. Storage grows
/// with the fragments actually received, never with the announced count.
#[derive(Debug)]
pub struct Reassembly {
    source: String,
    destination: String,
    message_id: String,
    template: Frame,
    count: u32,
    digest: String,
    slots: BTreeMap<u32, String>,
    last_activity: Instant,
}

impl Reassembly {
    /// Open a session from its first observed fragment. The fragment itself is
    /// not stored; pass it to [`Reassembly::add`] afterwards.
    ///
    /// A header announcing more than `max_count` fragments is refused.
    pub fn open(
        frame: &Frame,
        header: &FragmentHeader,
        max_count: u32,
    ) -> Result<Self, ReassemblyError> {
        if header.count > max_count {
            return Err(ReassemblyError::TooManyFragments {
                count: header.count,
                limit: max_count,
            });
        }
        Ok(Self {
            source: frame.source.clone(),
            destination: frame.destination.clone(),
            message_id: header.message_id.clone(),
            template: Frame {
                message: String::new(),
                fragment: None,
                ..frame.clone()
            },
            count: header.count.max(1),
            digest: header.digest.clone(),
            slots: BTreeMap::new(),
            last_activity: Instant::now(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn add(&mut self, frame: Frame) -> Result<Progress, ReassemblyError> {
        let header = frame.fragment.as_ref().ok_or(ReassemblyError::MissingHeader)?;

        if header.count.max(1) != self.count {
            return Err(ReassemblyError::CountChanged {
                expected: self.count,
                got: header.count,
            });
        }
        let index = header.index;
        if index >= self.count {
            return Err(ReassemblyError::IndexOutOfRange {
                index,
                count: self.count,
            });
        }

        self.last_activity = Instant::now();
        if self.slots.contains_key(&index) {
            return Ok(Progress::Duplicate);
        }
        self.slots.insert(index, frame.message);

        let received = self.slots.len() as u32;
        if received < self.count {
            return Ok(Progress::Accepted {
                received,
                count: self.count,
            });
        }

        let payload: String = std::mem::take(&mut self.slots).into_values().collect();
        let actual = digest(&payload);
        if actual != self.digest {
            return Err(ReassemblyError::DigestMismatch {
                expected: self.digest.clone(),
                actual,
            });
        }

        let mut envelope = self.template.clone().into_envelope();
        envelope.source = self.source.clone();
        envelope.destination = self.destination.clone();
        envelope.message = payload;
        Ok(Progress::Complete(envelope))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("fragment carries no fragment header")]
    MissingHeader,

    #[error("fragment index {index} outside message of {count} fragments")]
    IndexOutOfRange { index: u32, count: u32 },

    #[error("fragment count changed mid-message: expected {expected}, got {got}")]
    CountChanged { expected: u32, got: u32 },

    #[error("message announces {count} fragments, limit is {limit}")]
    TooManyFragments { count: u32, limit: u32 },

    #[error("reassembled payload digest {actual} does not match {expected}")]
    DigestMismatch { expected: String, actual: String },
}

// ── Tests ────────────────────────────────────────────────────────────────────
