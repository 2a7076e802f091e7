//! Bounded FIFO of recent signaling messages for one call.

use chrono::{DateTime, Utc};
use common::types::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Replay depth per call.
pub const DEFAULT_SIGNAL_QUEUE_CAPACITY: usize = 100;

/// Routing class of a signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Session descriptions (offer, answer, renegotiation).
    OfferAnswer,
    /// ICE candidates; always addressed to one user.
    IceCandidate,
    /// Media toggles broadcast alongside a persisted update.
    Media,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignalKind::OfferAnswer => "offer_answer",
            SignalKind::IceCandidate => "ice_candidate",
            SignalKind::Media => "media",
        }
    }
}

/// A queued signaling message. `to == None` means broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub seq: u64,
    pub from: UserId,
    pub to: Option<UserId>,
    pub kind: SignalKind,
    pub signal_type: String,
    pub payload: Value,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SignalQueue {
    entries: VecDeque<SignalEnvelope>,
    capacity: usize,
    next_seq: u64,
}

impl SignalQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
        }
    }

    /// Append, dropping the oldest entries once full. Returns the stored copy.
    pub fn push(
        &mut self,
        from: UserId,
        to: Option<UserId>,
        kind: SignalKind,
        signal_type: String,
        payload: Value,
    ) -> SignalEnvelope {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.next_seq += 1;
        let envelope = SignalEnvelope {
            seq: self.next_seq,
            from,
            to,
            kind,
            signal_type,
            payload,
            queued_at: Utc::now(),
        };
        self.entries.push_back(envelope.clone());
        envelope
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignalEnvelope> {
        self.entries.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn push_n(queue: &mut SignalQueue, n: usize) {
        for _ in 0..n {
            queue.push(
                UserId(1),
                Some(UserId(2)),
                SignalKind::OfferAnswer,
                "offer".to_string(),
                Value::Null,
            );
        }
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut queue = SignalQueue::new(3);
        push_n(&mut queue, 5);
        assert_eq!(queue.len(), 3);
        let seqs: Vec<u64> = queue.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn test_sequence_keeps_growing_after_eviction() {
        let mut queue = SignalQueue::new(2);
        push_n(&mut queue, 2);
        let third = queue.push(UserId(2), None, SignalKind::Media, "media".into(), Value::Null);
        assert_eq!(third.seq, 3);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut queue = SignalQueue::new(0);
        push_n(&mut queue, 2);
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
    }
}
