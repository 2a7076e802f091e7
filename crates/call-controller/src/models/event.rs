//! Append-only call audit log.

use chrono::{DateTime, Utc};
use common::types::{CallId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event kinds written by the lifecycle engine.
pub mod kinds {
    pub const CALL_INITIATED: &str = "call_initiated";
    pub const CALL_RINGING: &str = "call_ringing";
    pub const CALL_CONNECTED: &str = "call_connected";
    pub const CALL_ON_HOLD: &str = "call_on_hold";
    pub const CALL_RESUMED: &str = "call_resumed";
    pub const CALL_ENDED: &str = "call_ended";
    pub const USER_INVITED: &str = "user_invited";
    pub const USER_JOINING: &str = "user_joining";
    pub const USER_CONNECTED: &str = "user_connected";
    pub const USER_LEFT: &str = "user_left";
    pub const USER_KICKED: &str = "user_kicked";
    pub const MEDIA_CHANGED: &str = "media_changed";
    pub const INVITATION_ACCEPTED: &str = "invitation_accepted";
    pub const INVITATION_DECLINED: &str = "invitation_declined";
    pub const INVITATION_EXPIRED: &str = "invitation_expired";
    pub const QUALITY_CHANGED: &str = "quality_changed";
    pub const QUALITY_REPORT: &str = "quality_report";
    pub const RECORDING_STARTED: &str = "recording_started";
    pub const RECORDING_STOPPED: &str = "recording_stopped";
}

/// A stored audit entry. `event_id` orders entries within a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub event_id: i64,
    pub call_id: CallId,
    pub user_id: Option<UserId>,
    pub event_type: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

/// An audit entry waiting to be written. `user_id` is `None` for
/// system-originated events (sweeper, auto-end).
#[derive(Debug, Clone, PartialEq)]
pub struct NewCallEvent {
    pub call_id: CallId,
    pub user_id: Option<UserId>,
    pub event_type: &'static str,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl NewCallEvent {
    #[must_use]
    pub fn new(
        call_id: &CallId,
        user_id: Option<UserId>,
        event_type: &'static str,
        payload: Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: call_id.clone(),
            user_id,
            event_type,
            payload,
            occurred_at,
        }
    }
}
