//! Signaling transport over the backend's signaling rows

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::{SignalingEnvelope, SignalingMessage};
use crate::error::{CallError, Result};
use crate::store::{SignalingChannel, SignalingRecord};

/// Delivers signaling payloads for one local identity
///
/// There is at most one live subscription: subscribing again tears the
/// previous listener down, so a message is never delivered twice.
pub struct SignalingTransport {
    local_id: String,
    channel: Arc<dyn SignalingChannel>,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingTransport {
    pub fn new(local_id: impl Into<String>, channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            local_id: local_id.into(),
            channel,
            subscription: Mutex::new(None),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Send a payload to `receiver_id`. Fire-and-forget: no acknowledgment
    /// and no retry.
    pub async fn send(
        &self,
        receiver_id: &str,
        call_id: &str,
        message: &SignalingMessage,
    ) -> Result<()> {
        let signal_data = serde_json::to_value(message)?;
        let record = SignalingRecord {
            sender_id: self.local_id.clone(),
            receiver_id: receiver_id.to_string(),
            session_id: call_id.to_string(),
            signal_data,
        };

        self.channel
            .insert_signal(record)
            .await
            .map_err(|e| CallError::Delivery(e.to_string()))?;

        debug!(
            "Signaling {} sent {} -> {} (call {})",
            message.kind(),
            self.local_id,
            receiver_id,
            call_id
        );
        Ok(())
    }

    /// Start receiving payloads addressed to the local identity
    ///
    /// Replaces any previous subscription; the previous receiver is closed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalingEnvelope> {
        // Take the feed before spawning so nothing inserted from now on is missed
        let mut feed = self.channel.subscribe_signals();
        let (tx, rx) = mpsc::unbounded_channel();
        let local_id = self.local_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    _ = tx.closed() => break,
                    received = feed.recv() => match received {
                        Ok(record) => record,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Signaling feed for {} lagged, {} rows skipped", local_id, n);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if record.receiver_id != local_id {
                    continue;
                }

                match decode_record(record) {
                    Ok(envelope) => {
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping undecodable signaling row for {}: {}", local_id, e),
                }
            }
            debug!("Signaling listener for {} stopped", local_id);
        });

        if let Some(previous) = self.subscription.lock().replace(handle) {
            previous.abort();
            info!("Signaling subscription for {} replaced", self.local_id);
        } else {
            info!("Signaling subscription for {} started", self.local_id);
        }

        rx
    }

    /// Stop the active subscription, if any
    pub fn unsubscribe(&self) {
        if let Some(handle) = self.subscription.lock().take() {
            handle.abort();
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn decode_record(record: SignalingRecord) -> Result<SignalingEnvelope> {
    let message: SignalingMessage = serde_json::from_value(record.signal_data)
        .map_err(|e| CallError::ProtocolViolation(format!("invalid payload: {}", e)))?;

    Ok(SignalingEnvelope {
        sender_id: record.sender_id,
        receiver_id: record.receiver_id,
        call_id: record.session_id,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{IceCandidate, SessionDescription};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn offer() -> SignalingMessage {
        SignalingMessage::Offer {
            sdp: SessionDescription::offer("v=0"),
        }
    }

    #[tokio::test]
    async fn test_delivers_only_to_receiver() {
        let store = Arc::new(MemoryStore::new());
        let alice = SignalingTransport::new("alice", store.clone());
        let bob = SignalingTransport::new("bob", store.clone());
        let carol = SignalingTransport::new("carol", store.clone());

        let mut bob_rx = bob.subscribe();
        let mut carol_rx = carol.subscribe();

        alice.send("bob", "call-1", &offer()).await.unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.sender_id, "alice");
        assert_eq!(envelope.call_id, "call-1");
        assert_eq!(envelope.message, offer());

        assert!(
            tokio::time::timeout(Duration::from_millis(50), carol_rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_listener() {
        let store = Arc::new(MemoryStore::new());
        let alice = SignalingTransport::new("alice", store.clone());
        let bob = SignalingTransport::new("bob", store.clone());

        let mut first = bob.subscribe();
        let mut second = bob.subscribe();

        // The first receiver is closed once its listener is aborted
        let closed = tokio::time::timeout(Duration::from_secs(1), first.recv())
            .await
            .unwrap();
        assert!(closed.is_none());

        let candidate = SignalingMessage::Candidate {
            candidate: IceCandidate::new("candidate:1"),
        };
        alice.send("bob", "call-1", &candidate).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), second.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message, candidate);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), second.recv())
                .await
                .is_err()
        );
        assert!(bob.is_subscribed());
    }

    #[tokio::test]
    async fn test_send_failure_is_delivery_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_signaling_offline(true);
        let alice = SignalingTransport::new("alice", store);

        let err = alice.send("bob", "call-1", &offer()).await.unwrap_err();
        assert!(matches!(err, CallError::Delivery(_)));
    }

    #[tokio::test]
    async fn test_invalid_payload_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let bob = SignalingTransport::new("bob", store.clone());
        let mut rx = bob.subscribe();

        store
            .insert_signal(SignalingRecord {
                sender_id: "mallory".into(),
                receiver_id: "bob".into(),
                session_id: "call-1".into(),
                signal_data: serde_json::json!({"type": "bye"}),
            })
            .await
            .unwrap();
        let alice = SignalingTransport::new("alice", store.clone());
        alice.send("bob", "call-1", &offer()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.sender_id, "alice");
    }
}
