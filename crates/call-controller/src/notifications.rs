//! Outbound notifications the core hands to the transport gateway.
//!
//! Delivery is fire-and-forget: a sink must not block and must not report
//! failure back into lifecycle code. A lost notification never rolls back
//! the registry change that produced it.

use crate::models::{
    CallKind, CallStatus, ConnectionQuality, EndReason, LeaveReason, MediaUpdate,
};
use chrono::{DateTime, Utc};
use common::types::{CallId, InvitationId, PeerId, UserId};
use serde::Serialize;
use serde_json::Value;

/// Who a notification is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// One user's channel.
    User(UserId),
    /// Several users' channels (e.g. a call's moderators).
    Users(Vec<UserId>),
    /// Every socket subscribed to the call's broadcast group, optionally
    /// skipping the user who caused it.
    Call {
        call_id: CallId,
        except: Option<UserId>,
    },
}

impl Recipient {
    #[must_use]
    pub fn call_group(call_id: &CallId, except: Option<UserId>) -> Self {
        Recipient::Call {
            call_id: call_id.clone(),
            except,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    UserJoined {
        call_id: CallId,
        user_id: UserId,
        peer_id: PeerId,
        joined_at: DateTime<Utc>,
    },
    UserLeft {
        call_id: CallId,
        user_id: UserId,
        reason: LeaveReason,
    },
    SignalReceived {
        call_id: CallId,
        from_user_id: UserId,
        signal_type: String,
        signal_data: Value,
    },
    IceCandidateReceived {
        call_id: CallId,
        from_user_id: UserId,
        candidate: Value,
    },
    MediaToggled {
        call_id: CallId,
        user_id: UserId,
        changes: MediaUpdate,
    },
    IncomingCall {
        call_id: CallId,
        kind: CallKind,
        title: Option<String>,
        initiated_by: UserId,
        invitation_id: InvitationId,
        message: Option<String>,
        expires_at: DateTime<Utc>,
    },
    CallEnded {
        call_id: CallId,
        reason: EndReason,
        duration_seconds: i64,
    },
    CallStatusChanged {
        call_id: CallId,
        status: CallStatus,
    },
    QualityUpdate {
        call_id: CallId,
        user_id: UserId,
        quality: ConnectionQuality,
        stats: Value,
    },
}

impl Notification {
    /// Wire name, matching the serialized `type` tag.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Notification::UserJoined { .. } => "user_joined",
            Notification::UserLeft { .. } => "user_left",
            Notification::SignalReceived { .. } => "signal_received",
            Notification::IceCandidateReceived { .. } => "ice_candidate_received",
            Notification::MediaToggled { .. } => "media_toggled",
            Notification::IncomingCall { .. } => "incoming_call",
            Notification::CallEnded { .. } => "call_ended",
            Notification::CallStatusChanged { .. } => "call_status_changed",
            Notification::QualityUpdate { .. } => "quality_update",
        }
    }
}

/// Receives notifications for delivery. Implemented by the gateway.
pub trait NotificationSink: Send + Sync + 'static {
    fn deliver(&self, recipient: Recipient, notification: Notification);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Notification, NotificationSink, Recipient};
    use std::sync::Mutex;

    /// Captures everything delivered, for unit tests inside the crate.
    #[derive(Debug, Default)]
    pub(crate) struct CapturingSink {
        delivered: Mutex<Vec<(Recipient, Notification)>>,
    }

    #[allow(clippy::unwrap_used)]
    impl CapturingSink {
        pub(crate) fn take(&self) -> Vec<(Recipient, Notification)> {
            std::mem::take(&mut *self.delivered.lock().unwrap())
        }

        pub(crate) fn names(&self) -> Vec<&'static str> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(_, n)| n.name())
                .collect()
        }
    }

    #[allow(clippy::unwrap_used)]
    impl NotificationSink for CapturingSink {
        fn deliver(&self, recipient: Recipient, notification: Notification) {
            self.delivered.lock().unwrap().push((recipient, notification));
        }
    }
}
