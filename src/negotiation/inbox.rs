//! Holding area for signaling that arrives before the call is answered

use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::signaling::SignalingEnvelope;

/// Calls tracked at once; the oldest is evicted beyond this
pub const MAX_PENDING_CALLS: usize = 8;

/// Bounded per-call FIFO of early signaling messages
pub struct EarlyInbox {
    per_call_limit: usize,
    calls: VecDeque<(String, Vec<SignalingEnvelope>)>,
}

impl EarlyInbox {
    pub fn new(per_call_limit: usize) -> Self {
        Self {
            per_call_limit,
            calls: VecDeque::new(),
        }
    }

    /// Keep `envelope` until its call is answered; returns false if dropped
    pub fn stash(&mut self, envelope: SignalingEnvelope) -> bool {
        if let Some((_, messages)) = self
            .calls
            .iter_mut()
            .find(|(id, _)| *id == envelope.call_id)
        {
            if messages.len() >= self.per_call_limit {
                warn!(
                    "Early message limit reached for call {}, dropping {}",
                    envelope.call_id,
                    envelope.message.kind()
                );
                return false;
            }
            messages.push(envelope);
            return true;
        }

        if self.calls.len() >= MAX_PENDING_CALLS {
            if let Some((evicted, messages)) = self.calls.pop_front() {
                debug!(
                    "Evicting {} early messages of call {}",
                    messages.len(),
                    evicted
                );
            }
        }
        if self.per_call_limit == 0 {
            return false;
        }
        self.calls.push_back((envelope.call_id.clone(), vec![envelope]));
        true
    }

    /// Remove and return the messages held for `call_id`, oldest first
    pub fn take(&mut self, call_id: &str) -> Vec<SignalingEnvelope> {
        match self.calls.iter().position(|(id, _)| id == call_id) {
            Some(index) => self
                .calls
                .remove(index)
                .map(|(_, messages)| messages)
                .unwrap_or_default(),
            None => vec![],
        }
    }

    pub fn discard(&mut self, call_id: &str) {
        let dropped = self.take(call_id);
        if !dropped.is_empty() {
            debug!("Discarded {} early messages of call {}", dropped.len(), call_id);
        }
    }

    pub fn pending(&self, call_id: &str) -> usize {
        self.calls
            .iter()
            .find(|(id, _)| id == call_id)
            .map(|(_, m)| m.len())
            .unwrap_or(0)
    }
}
