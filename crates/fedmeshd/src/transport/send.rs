//! Send path — fragment, transmit, wait for acknowledgments.

use tokio::sync::oneshot;

use fedmesh_core::fragment;
use fedmesh_core::wire::{Envelope, Frame};

use super::{AckKey, Transport, TransportError};

impl Transport {
    /// Deliver one envelope to `envelope.destination`.
    ///
    /// Returns once the final frame is written. For fragmented messages that
    /// means every earlier fragment has been acknowledged; the final one is
    /// not waited on.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let destination = envelope.destination.clone();
        if !envelope.kind.is_chunked() {
            self.inner
                .endpoint
                .send(&destination, &envelope.into_frame())
                .await?;
            return Ok(());
        }

        let limit = self.inner.settings.max_message_len;
        if envelope.message.len() > limit {
            return Err(TransportError::MessageTooLarge {
                len: envelope.message.len(),
                limit,
            });
        }

        let message_id = self.next_message_id();
        let frames = fragment::split(&envelope, &message_id, self.inner.settings.max_fragment_len);
        let count = frames.len();

        for frame in frames {
            match frame.fragment.as_ref() {
                Some(header) if !header.is_terminal() => {
                    let key = (message_id.clone(), header.index);
                    self.send_acked(&destination, key, &frame).await?;
                }
                _ => self.inner.endpoint.send(&destination, &frame).await?,
            }
        }

        tracing::debug!(
            peer = %destination,
            kind = %envelope.kind,
            message_id = %message_id,
            fragments = count,
            payload_len = envelope.message.len(),
            "message sent"
        );
        Ok(())
    }

    /// Write `frame` and wait for its acknowledgment, retransmitting on
    /// timeout until the retry budget is spent.
    async fn send_acked(
        &self,
        destination: &str,
        key: AckKey,
        frame: &Frame,
    ) -> Result<(), TransportError> {
        let timeout = self.inner.settings.ack_timeout();
        let attempts = self.inner.settings.max_retries + 1;

        let (tx, mut rx) = oneshot::channel();
        // Registered before the first write so a fast ACK cannot be missed.
        self.inner.pending.insert(key.clone(), tx);
        let _slot = PendingSlot {
            transport: self,
            key: &key,
        };

        for attempt in 1..=attempts {
            self.inner.endpoint.send(destination, frame).await?;
            match tokio::time::timeout(timeout, &mut rx).await {
                Ok(Ok(())) => {
                    tracing::trace!(message_id = %key.0, index = key.1, attempt, "fragment acknowledged");
                    return Ok(());
                }
                // Slot dropped without an ACK; nothing will ever arrive.
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::debug!(
                        peer = %destination,
                        message_id = %key.0,
                        index = key.1,
                        attempt,
                        "ack timeout"
                    );
                }
            }
        }

        tracing::warn!(peer = %destination, message_id = %key.0, index = key.1, "peer unresponsive");
        Err(TransportError::PeerUnresponsive {
            peer: destination.to_string(),
            message_id: key.0.clone(),
            index: key.1,
            attempts,
        })
    }
}

/// Removes a pending-ACK slot when the send finishes or is cancelled.
struct PendingSlot<'a> {
    transport: &'a Transport,
    key: &'a AckKey,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.transport.inner.pending.remove(self.key);
    }
}
