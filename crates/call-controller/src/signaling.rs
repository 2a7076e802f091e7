//! Signaling Relay.
//!
//! Forwards session descriptions, ICE candidates and media toggles between
//! members of the same call without looking inside them. Participation is
//! checked against Session Cache membership before anything is queued, so a
//! rejected signal never reaches the replay queue.
//!
//! Delivery is fire-and-forget through the [`NotificationSink`]. A signal
//! that is lost in transit is recovered by the peers renegotiating.

use crate::errors::CcError;
use crate::models::MediaUpdate;
use crate::notifications::{Notification, NotificationSink, Recipient};
use crate::observability::metrics;
use crate::session::{SessionCache, SignalEnvelope, SignalKind};
use common::types::{CallId, UserId};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stateless relay over the shared Session Cache.
#[derive(Clone)]
pub struct SignalingRelay {
    cache: Arc<SessionCache>,
    sink: Arc<dyn NotificationSink>,
}

impl SignalingRelay {
    #[must_use]
    pub fn new(cache: Arc<SessionCache>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { cache, sink }
    }

    /// Queue a signal and deliver it to `to`, or to every other member of
    /// the call when `to` is `None`.
    ///
    /// # Errors
    ///
    /// - `Unauthorized` if the sender, or a named target, is not a live
    ///   member of the call.
    /// - `Validation` for an ICE candidate without a target or an empty
    ///   signal type.
    pub fn relay(
        &self,
        call_id: &CallId,
        from: UserId,
        to: Option<UserId>,
        kind: SignalKind,
        signal_type: &str,
        payload: Value,
    ) -> Result<SignalEnvelope, CcError> {
        let result = self.relay_inner(call_id, from, to, kind, signal_type, payload);
        let outcome = match &result {
            Ok(_) => "relayed",
            Err(CcError::Unauthorized(_)) => "rejected",
            Err(_) => "error",
        };
        metrics::record_signal(kind.as_str(), outcome);
        result
    }

    fn relay_inner(
        &self,
        call_id: &CallId,
        from: UserId,
        to: Option<UserId>,
        kind: SignalKind,
        signal_type: &str,
        payload: Value,
    ) -> Result<SignalEnvelope, CcError> {
        if signal_type.trim().is_empty() {
            return Err(CcError::Validation("signal type is required".to_string()));
        }
        if kind == SignalKind::IceCandidate && to.is_none() {
            return Err(CcError::Validation(
                "ICE candidates need a target user".to_string(),
            ));
        }
        let envelope = self
            .cache
            .push_signal_from_member(
                call_id,
                from,
                to,
                kind,
                signal_type.to_string(),
                payload.clone(),
            )
            .map_err(|e| {
                warn!(
                    target: "cc.signaling",
                    call_id = %call_id,
                    from = %from,
                    to = ?to,
                    error = %e,
                    "Signal rejected"
                );
                e
            })?;

        let recipient = match to {
            Some(target) => Recipient::User(target),
            None => Recipient::call_group(call_id, Some(from)),
        };
        let notification = match kind {
            SignalKind::IceCandidate => Notification::IceCandidateReceived {
                call_id: call_id.clone(),
                from_user_id: from,
                candidate: payload,
            },
            SignalKind::OfferAnswer | SignalKind::Media => Notification::SignalReceived {
                call_id: call_id.clone(),
                from_user_id: from,
                signal_type: signal_type.to_string(),
                signal_data: payload,
            },
        };
        self.sink.deliver(recipient, notification);

        debug!(
            target: "cc.signaling",
            call_id = %call_id,
            from = %from,
            to = ?to,
            kind = kind.as_str(),
            seq = envelope.seq,
            "Signal relayed"
        );
        Ok(envelope)
    }

    /// Broadcast a persisted media change to the rest of the call. The
    /// change is also queued for replay when the call has a live entry.
    pub fn announce_media(&self, call_id: &CallId, user_id: UserId, changes: MediaUpdate) {
        if changes.is_empty() {
            return;
        }
        match serde_json::to_value(changes) {
            Ok(payload) => {
                if let Err(e) = self.cache.push_signal(
                    call_id,
                    user_id,
                    None,
                    SignalKind::Media,
                    "media_toggled".to_string(),
                    payload,
                ) {
                    debug!(target: "cc.signaling", call_id = %call_id, error = %e, "Media change not queued");
                }
            }
            Err(e) => {
                warn!(target: "cc.signaling", call_id = %call_id, error = %e, "Media change not serializable");
            }
        }
        self.sink.deliver(
            Recipient::call_group(call_id, Some(user_id)),
            Notification::MediaToggled {
                call_id: call_id.clone(),
                user_id,
                changes,
            },
        );
        metrics::record_signal(SignalKind::Media.as_str(), "relayed");
    }

    /// Signals a reconnecting user missed, oldest first.
    #[must_use]
    pub fn recent_signals(&self, call_id: &CallId, user_id: UserId) -> Vec<SignalEnvelope> {
        self.cache.recent_signals(call_id, user_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::notifications::testing::CapturingSink;
    use common::types::PeerId;
    use serde_json::json;

    fn relay_with_members(members: &[i64]) -> (SignalingRelay, Arc<SessionCache>, Arc<CapturingSink>, CallId) {
        let cache = Arc::new(SessionCache::default());
        let sink = Arc::new(CapturingSink::default());
        let call_id = CallId::from("call_signal");
        cache.activate(&call_id);
        for id in members {
            cache.record_member(&call_id, UserId(*id), PeerId::from(format!("peer_{id}")));
        }
        let relay = SignalingRelay::new(Arc::clone(&cache), sink.clone());
        (relay, cache, sink, call_id)
    }

    #[test]
    fn test_directed_offer_reaches_target_only() {
        let (relay, cache, sink, call_id) = relay_with_members(&[1, 2, 3]);
        let envelope = relay
            .relay(
                &call_id,
                UserId(1),
                Some(UserId(2)),
                SignalKind::OfferAnswer,
                "offer",
                json!({"sdp": "v=0"}),
            )
            .unwrap();
        assert_eq!(envelope.to, Some(UserId(2)));
        assert_eq!(cache.queued_signals(&call_id), 1);

        let delivered = sink.take();
        assert_eq!(delivered.len(), 1);
        let (recipient, notification) = delivered.first().unwrap();
        assert_eq!(*recipient, Recipient::User(UserId(2)));
        assert_eq!(notification.name(), "signal_received");
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let (relay, _cache, sink, call_id) = relay_with_members(&[1, 2]);
        relay
            .relay(&call_id, UserId(1), None, SignalKind::OfferAnswer, "renegotiate", json!({}))
            .unwrap();
        let delivered = sink.take();
        assert_eq!(
            delivered.first().unwrap().0,
            Recipient::call_group(&call_id, Some(UserId(1)))
        );
    }

    #[test]
    fn test_non_participant_is_rejected_and_not_queued() {
        let (relay, cache, sink, call_id) = relay_with_members(&[1, 2]);
        let err = relay
            .relay(&call_id, UserId(9), Some(UserId(1)), SignalKind::OfferAnswer, "offer", json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), "authorization");
        assert_eq!(cache.queued_signals(&call_id), 0);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_target_must_be_member() {
        let (relay, cache, _sink, call_id) = relay_with_members(&[1]);
        let err = relay
            .relay(&call_id, UserId(1), Some(UserId(2)), SignalKind::OfferAnswer, "offer", json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), "authorization");
        assert_eq!(cache.queued_signals(&call_id), 0);
    }

    #[test]
    fn test_departed_member_cannot_queue_signals() {
        let (relay, cache, sink, call_id) = relay_with_members(&[1, 2]);
        cache.remove_member(&call_id, UserId(1));
        let err = relay
            .relay(&call_id, UserId(1), None, SignalKind::OfferAnswer, "renegotiate", json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), "authorization");
        assert_eq!(cache.queued_signals(&call_id), 0);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_ice_candidate_needs_target() {
        let (relay, _cache, _sink, call_id) = relay_with_members(&[1, 2]);
        let err = relay
            .relay(&call_id, UserId(1), None, SignalKind::IceCandidate, "candidate", json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        relay
            .relay(
                &call_id,
                UserId(1),
                Some(UserId(2)),
                SignalKind::IceCandidate,
                "candidate",
                json!({"candidate": "candidate:1 1 udp"}),
            )
            .unwrap();
    }

    #[test]
    fn test_ice_candidate_notification_kind() {
        let (relay, _cache, sink, call_id) = relay_with_members(&[1, 2]);
        relay
            .relay(&call_id, UserId(2), Some(UserId(1)), SignalKind::IceCandidate, "candidate", json!({}))
            .unwrap();
        assert_eq!(sink.names(), vec!["ice_candidate_received"]);
    }

    #[test]
    fn test_replay_queue_is_bounded() {
        let (relay, cache, _sink, call_id) = relay_with_members(&[1, 2]);
        for n in 0..130 {
            relay
                .relay(&call_id, UserId(1), Some(UserId(2)), SignalKind::OfferAnswer, "offer", json!({ "n": n }))
                .unwrap();
        }
        assert_eq!(cache.queued_signals(&call_id), 100);

        let replay = relay.recent_signals(&call_id, UserId(2));
        assert_eq!(replay.len(), 100);
        assert_eq!(replay.first().unwrap().payload, json!({ "n": 30 }));
        assert!(relay.recent_signals(&call_id, UserId(1)).is_empty());
    }

    #[test]
    fn test_announce_media_broadcasts_change() {
        let (relay, cache, sink, call_id) = relay_with_members(&[1, 2]);
        relay.announce_media(&call_id, UserId(1), MediaUpdate::default());
        assert!(sink.take().is_empty());

        let update = MediaUpdate {
            audio_enabled: Some(false),
            ..MediaUpdate::default()
        };
        relay.announce_media(&call_id, UserId(1), update);
        assert_eq!(sink.names(), vec!["media_toggled"]);
        assert_eq!(cache.recent_signals(&call_id, UserId(2)).len(), 1);
    }
}
