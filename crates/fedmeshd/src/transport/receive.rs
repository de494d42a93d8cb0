//! Receive path — ACK routing and fragment reassembly.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;

use fedmesh_core::fragment::{Progress, Reassembly, ReassemblyError};
use fedmesh_core::wire::{Envelope, FragmentHeader, Frame, PacketType};

use super::{Transport, TransportError};

/// Single reader of a transport's socket.
pub struct Inbound {
    transport: Transport,
    /// Open reassembly sessions, keyed by `(source, message_id)`.
    sessions: HashMap<(String, String), Reassembly>,
}

impl Inbound {
    pub(super) fn new(transport: Transport) -> Self {
        Self {
            transport,
            sessions: HashMap::new(),
        }
    }

    /// Wait for the next complete envelope.
    ///
    /// Acknowledgments are consumed here and never returned. An error covers
    /// one datagram only; callers may keep calling `recv`.
    pub async fn recv(&mut self) -> Result<Envelope, TransportError> {
        loop {
            let (frame, peer) = self.transport.inner.endpoint.recv().await?;

            match frame.kind {
                PacketType::Acknowledgment => self.route_ack(&frame),
                kind if kind.is_chunked() => {
                    let Some(header) = frame.fragment.clone() else {
                        return Ok(frame.into_envelope());
                    };
                    let source = frame.source.clone();
                    match self.reassemble(frame, &header) {
                        Ok(complete) => {
                            self.acknowledge(peer, &source, &header).await;
                            if let Some(envelope) = complete {
                                return Ok(envelope);
                            }
                        }
                        Err(e) => tracing::warn!(
                            %source,
                            message_id = %header.message_id,
                            index = header.index,
                            error = %e,
                            "discarding message"
                        ),
                    }
                }
                _ => return Ok(frame.into_envelope()),
            }
        }
    }

    /// Number of partially received messages.
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn route_ack(&self, frame: &Frame) {
        let Some(header) = frame.fragment.as_ref() else {
            tracing::debug!(source = %frame.source, "acknowledgment without fragment header");
            return;
        };
        let key = (header.message_id.clone(), header.index);
        match self.transport.inner.pending.remove(&key) {
            Some((_, waiter)) => {
                let _ = waiter.send(());
            }
            None => tracing::trace!(
                message_id = %header.message_id,
                index = header.index,
                "stale acknowledgment"
            ),
        }
    }

    /// Best effort. The ACK goes to the address the fragment arrived from.
    async fn acknowledge(&self, peer: SocketAddr, source: &str, header: &FragmentHeader) {
        let ack = Frame::ack(self.transport.address(), source, header);
        if let Err(e) = self.transport.inner.endpoint.send(&peer.to_string(), &ack).await {
            tracing::warn!(%peer, message_id = %header.message_id, index = header.index, error = %e, "failed to send acknowledgment");
        }
    }

    /// Store one fragment. `Ok` means the fragment was accepted or is a
    /// duplicate and should be acknowledged; an error drops the whole message.
    fn reassemble(
        &mut self,
        frame: Frame,
        header: &FragmentHeader,
    ) -> Result<Option<Envelope>, ReassemblyError> {
        self.evict_idle();

        let key = (frame.source.clone(), header.message_id.clone());
        let session = match self.sessions.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let limit = self.transport.inner.settings.max_fragments();
                entry.insert(Reassembly::open(&frame, header, limit)?)
            }
        };

        match session.add(frame) {
            Ok(Progress::Accepted { received, count }) => {
                tracing::trace!(source = %key.0, message_id = %key.1, received, count, "fragment stored");
                Ok(None)
            }
            Ok(Progress::Duplicate) => {
                tracing::debug!(source = %key.0, message_id = %key.1, index = header.index, "duplicate fragment");
                Ok(None)
            }
            Ok(Progress::Complete(envelope)) => {
                self.sessions.remove(&key);
                tracing::debug!(
                    source = %key.0,
                    message_id = %key.1,
                    kind = %envelope.kind,
                    payload_len = envelope.message.len(),
                    "message reassembled"
                );
                Ok(Some(envelope))
            }
            Err(e) => {
                self.sessions.remove(&key);
                Err(e)
            }
        }
    }

    fn evict_idle(&mut self) {
        let ttl = self.transport.inner.settings.reassembly_ttl();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.idle_for() < ttl);
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted, "expired incomplete messages");
        }
    }
}
