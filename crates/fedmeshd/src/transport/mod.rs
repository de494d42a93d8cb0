//! Reliable transport over an [`Endpoint`].
//!
//! Large EncryptedChunk and Result payloads are split into fragments. Every
//! fragment but the last waits for its acknowledgment before the next one
//! goes out (one frame outstanding per message). Everything else is a single
//! fire-and-forget frame.
//!
//! Sending is [`Transport::send`] and may run from any number of tasks at
//! once. Receiving goes through one [`Inbound`], owned by the listen loop; it
//! routes acknowledgments to waiting senders and reassembles fragments.

mod receive;
mod send;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::oneshot;

use fedmesh_core::config::TransportConfig;

use crate::endpoint::{Endpoint, EndpointError};

pub use receive::Inbound;

/// `(message_id, fragment index)` of a fragment awaiting acknowledgment.
type AckKey = (String, u32);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {peer} did not acknowledge fragment {index} of {message_id} after {attempts} attempts")]
    PeerUnresponsive {
        peer: String,
        message_id: String,
        index: u32,
        attempts: u32,
    },

    #[error("message of {len} bytes exceeds the {limit}-byte limit")]
    MessageTooLarge { len: usize, limit: usize },

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Endpoint,
    settings: TransportConfig,
    pending: DashMap<AckKey, oneshot::Sender<()>>,
    /// Distinguishes message ids across restarts on the same address.
    epoch: u64,
    next_message: AtomicU64,
}

impl Transport {
    pub fn new(endpoint: Endpoint, settings: TransportConfig) -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                endpoint,
                settings,
                pending: DashMap::new(),
                epoch,
                next_message: AtomicU64::new(0),
            }),
        }
    }

    /// The address peers use to reach this node, and the `source` of every
    /// envelope it sends.
    pub fn address(&self) -> &str {
        self.inner.endpoint.address()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.endpoint.local_addr()
    }

    pub fn settings(&self) -> &TransportConfig {
        &self.inner.settings
    }

    /// The receive side. Create exactly one per transport.
    pub fn inbound(&self) -> Inbound {
        Inbound::new(self.clone())
    }

    fn next_message_id(&self) -> String {
        let n = self.inner.next_message.fetch_add(1, Ordering::Relaxed);
        format!("{:x}-{n}", self.inner.epoch)
    }

    /// Number of fragments currently waiting for an acknowledgment.
    pub fn pending_acks(&self) -> usize {
        self.inner.pending.len()
    }
}
