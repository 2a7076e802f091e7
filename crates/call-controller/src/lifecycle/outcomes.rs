//! Results returned by lifecycle operations.

use crate::models::{
    Call, CallEvent, CallInvitation, IceServer, MediaUpdate, Participant, ParticipantStatus,
};
use chrono::{DateTime, Utc};
use common::types::UserId;
use serde::Serialize;

/// A successful join: what the gateway hands back to the joiner.
#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    pub call: Call,
    pub participant: Participant,
    /// Other members currently active in the call.
    pub others: Vec<Participant>,
    pub ice_servers: Vec<IceServer>,
    /// The user already held an active row; only the peer id was refreshed.
    pub rejoined: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaveOutcome {
    pub call: Call,
    /// `None` when the user had already left.
    pub participant: Option<Participant>,
    /// This departure ended the call.
    pub call_ended: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndOutcome {
    pub call: Call,
    /// The call was already terminal; nothing changed.
    pub already_ended: bool,
    /// Rows moved to `left` by this end.
    pub participants_left: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaOutcome {
    pub participant: Participant,
    /// Only the fields whose value actually changed.
    pub changes: MediaUpdate,
}

/// Result of answering an invitation. The response is persisted even when
/// an accept could not be turned into a join.
#[derive(Debug, Clone, Serialize)]
pub struct InvitationOutcome {
    pub invitation: CallInvitation,
    pub call: Call,
    pub joined: Option<JoinOutcome>,
    /// Client-safe reason the accept did not result in a join.
    pub join_error: Option<String>,
    /// Declining the last pending invitation ended the call as `declined`.
    pub call_ended: bool,
}

impl InvitationOutcome {
    /// Accepted and joined.
    #[must_use]
    pub fn accepted(&self) -> bool {
        self.joined.is_some()
    }
}

/// Per-participant line of a call summary.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub status: ParticipantStatus,
    pub is_moderator: bool,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
}

/// Post-hoc view of a call for analytics.
#[derive(Debug, Clone, Serialize)]
pub struct CallAnalytics {
    pub call: Call,
    pub total_invited: usize,
    pub total_joined: usize,
    pub average_duration_seconds: i64,
    pub participants: Vec<ParticipantSummary>,
    pub timeline: Vec<CallEvent>,
}

/// A call with all of its participant rows.
#[derive(Debug, Clone, Serialize)]
pub struct CallDetails {
    pub call: Call,
    pub participants: Vec<Participant>,
}
