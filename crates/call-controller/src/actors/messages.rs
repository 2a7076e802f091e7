//! Message types for call actor communication.
//!
//! Every mutating lifecycle operation on an existing call becomes one
//! `CallMessage`. The call's actor handles them one at a time, which is what
//! serializes concurrent requests against the same call.

use crate::errors::CcError;
use crate::lifecycle::{EndOutcome, InvitationOutcome, JoinOutcome, LeaveOutcome, MediaOutcome};
use crate::models::{
    Call, CallInvitation, CallRecording, ConnectionQuality, EndReason, InvitationResponse,
    LeaveReason, MediaUpdate, Participant, RecordingArtifact, RecordingQuality,
};
use chrono::{DateTime, Utc};
use common::types::{InvitationId, PeerId, RecordingId, UserId};
use serde_json::Value;
use tokio::sync::oneshot;

/// Reply channel carried by each message.
pub type Reply<T> = oneshot::Sender<Result<T, CcError>>;

/// Messages sent to a `CallActor`.
#[derive(Debug)]
pub enum CallMessage {
    Join {
        user_id: UserId,
        peer_id: PeerId,
        respond_to: Reply<JoinOutcome>,
    },

    Leave {
        user_id: UserId,
        reason: LeaveReason,
        respond_to: Reply<LeaveOutcome>,
    },

    /// End the call. `ended_by` is `None` for system-initiated ends.
    End {
        ended_by: Option<UserId>,
        reason: EndReason,
        respond_to: Reply<EndOutcome>,
    },

    UpdateMedia {
        user_id: UserId,
        update: MediaUpdate,
        respond_to: Reply<MediaOutcome>,
    },

    RespondInvitation {
        invitation_id: InvitationId,
        user_id: UserId,
        response: InvitationResponse,
        peer_id: PeerId,
        respond_to: Reply<InvitationOutcome>,
    },

    /// Sweeper: mark an unanswered invitation expired.
    ExpireInvitation {
        invitation_id: InvitationId,
        respond_to: Reply<bool>,
    },

    /// Sweeper: end the call if it never connected and was created at or
    /// before `cutoff`.
    TimeoutStale {
        cutoff: DateTime<Utc>,
        respond_to: Reply<bool>,
    },

    MarkRinging {
        user_id: UserId,
        respond_to: Reply<Call>,
    },

    MarkConnected {
        user_id: UserId,
        respond_to: Reply<Participant>,
    },

    SetHold {
        actor: UserId,
        on_hold: bool,
        respond_to: Reply<Call>,
    },

    Invite {
        inviter: UserId,
        invitee: UserId,
        message: Option<String>,
        respond_to: Reply<CallInvitation>,
    },

    Kick {
        moderator: UserId,
        target: UserId,
        respond_to: Reply<LeaveOutcome>,
    },

    ReportQuality {
        user_id: UserId,
        quality: ConnectionQuality,
        stats: Value,
        respond_to: Reply<()>,
    },

    StartRecording {
        user_id: UserId,
        quality: RecordingQuality,
        respond_to: Reply<CallRecording>,
    },

    StopRecording {
        recording_id: RecordingId,
        artifact: RecordingArtifact,
        respond_to: Reply<CallRecording>,
    },
}

impl CallMessage {
    /// Message name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            CallMessage::Join { .. } => "join",
            CallMessage::Leave { .. } => "leave",
            CallMessage::End { .. } => "end",
            CallMessage::UpdateMedia { .. } => "update_media",
            CallMessage::RespondInvitation { .. } => "respond_invitation",
            CallMessage::ExpireInvitation { .. } => "expire_invitation",
            CallMessage::TimeoutStale { .. } => "timeout_stale",
            CallMessage::MarkRinging { .. } => "mark_ringing",
            CallMessage::MarkConnected { .. } => "mark_connected",
            CallMessage::SetHold { .. } => "set_hold",
            CallMessage::Invite { .. } => "invite",
            CallMessage::Kick { .. } => "kick",
            CallMessage::ReportQuality { .. } => "report_quality",
            CallMessage::StartRecording { .. } => "start_recording",
            CallMessage::StopRecording { .. } => "stop_recording",
        }
    }

    /// Answer the message with `err` without handling it.
    pub fn reject(self, err: CcError) {
        match self {
            CallMessage::Join { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            CallMessage::Leave { respond_to, .. } | CallMessage::Kick { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            CallMessage::End { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            CallMessage::UpdateMedia { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            CallMessage::RespondInvitation { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            CallMessage::ExpireInvitation { respond_to, .. }
            | CallMessage::TimeoutStale { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            CallMessage::MarkRinging { respond_to, .. }
            | CallMessage::SetHold { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            CallMessage::MarkConnected { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            CallMessage::Invite { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            CallMessage::ReportQuality { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            CallMessage::StartRecording { respond_to, .. }
            | CallMessage::StopRecording { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
        }
    }
}

/// Controller status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Call actors currently running.
    pub call_actors: usize,
    /// Calls with a live session-cache entry.
    pub active_calls: usize,
    /// True once shutdown has begun.
    pub is_draining: bool,
}
