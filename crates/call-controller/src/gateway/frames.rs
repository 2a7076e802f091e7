//! JSON frames exchanged over the call socket.
//!
//! Client → server frames carry a `type` tag and an optional `request_id`
//! that is echoed on the reply:
//!
//! ```json
//! {"type": "join_call", "request_id": "7", "call_id": "call_ab12"}
//! {"type": "signal", "call_id": "call_ab12", "to": 4, "signal_type": "offer", "payload": {"sdp": "..."}}
//! ```
//!
//! Server → client frames are either a reply to a request
//! (`{"type": "reply", "op": "join_call", "result": {...}}`), an error
//! (`{"type": "error", "op": "join_call", "code": "capacity", "message": "..."}`)
//! or one of the core's notifications (`user_joined`, `signal_received`, ...).

use crate::errors::CcError;
use crate::models::{
    CallKind, CallRequest, ConnectionQuality, InvitationResponse, MediaField, RecordingArtifact,
    RecordingQuality,
};
use common::types::{CallId, InvitationId, PeerId, RecordingId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Calls returned by a history request when the client gives no limit.
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Largest history page a client may ask for.
pub const MAX_HISTORY_LIMIT: i64 = 200;

/// A client frame with its correlation id.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub frame: ClientFrame,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    InitiateCall {
        request: CallRequest,
    },
    JoinCall {
        call_id: CallId,
        #[serde(default)]
        peer_id: Option<PeerId>,
    },
    LeaveCall {
        call_id: CallId,
    },
    EndCall {
        call_id: CallId,
    },
    RespondInvitation {
        invitation_id: InvitationId,
        response: InvitationResponse,
        #[serde(default)]
        peer_id: Option<PeerId>,
    },
    /// Session description or other opaque negotiation payload.
    Signal {
        call_id: CallId,
        #[serde(default)]
        to: Option<UserId>,
        signal_type: String,
        #[serde(default)]
        payload: Value,
    },
    IceCandidate {
        call_id: CallId,
        to: UserId,
        candidate: Value,
    },
    ToggleMedia {
        call_id: CallId,
        field: MediaField,
        enabled: bool,
    },
    Ringing {
        call_id: CallId,
    },
    Connected {
        call_id: CallId,
    },
    Hold {
        call_id: CallId,
        on_hold: bool,
    },
    Invite {
        call_id: CallId,
        user_id: UserId,
        #[serde(default)]
        message: Option<String>,
    },
    Kick {
        call_id: CallId,
        user_id: UserId,
    },
    QualityReport {
        call_id: CallId,
        quality: ConnectionQuality,
        #[serde(default)]
        stats: Value,
    },
    StartRecording {
        call_id: CallId,
        #[serde(default)]
        quality: RecordingQuality,
    },
    StopRecording {
        call_id: CallId,
        recording_id: RecordingId,
        artifact: RecordingArtifact,
    },
    /// Signals queued for this user while they were away.
    RecentSignals {
        call_id: CallId,
    },
    CallHistory {
        #[serde(default)]
        limit: Option<i64>,
        #[serde(default)]
        kind: Option<CallKind>,
    },
    ActiveCalls,
    CallAnalytics {
        call_id: CallId,
    },
    Ping,
}

impl ClientFrame {
    /// Frame type, used for replies, logs and metric labels.
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            ClientFrame::InitiateCall { .. } => "initiate_call",
            ClientFrame::JoinCall { .. } => "join_call",
            ClientFrame::LeaveCall { .. } => "leave_call",
            ClientFrame::EndCall { .. } => "end_call",
            ClientFrame::RespondInvitation { .. } => "respond_invitation",
            ClientFrame::Signal { .. } => "signal",
            ClientFrame::IceCandidate { .. } => "ice_candidate",
            ClientFrame::ToggleMedia { .. } => "toggle_media",
            ClientFrame::Ringing { .. } => "ringing",
            ClientFrame::Connected { .. } => "connected",
            ClientFrame::Hold { .. } => "hold",
            ClientFrame::Invite { .. } => "invite",
            ClientFrame::Kick { .. } => "kick",
            ClientFrame::QualityReport { .. } => "quality_report",
            ClientFrame::StartRecording { .. } => "start_recording",
            ClientFrame::StopRecording { .. } => "stop_recording",
            ClientFrame::RecentSignals { .. } => "recent_signals",
            ClientFrame::CallHistory { .. } => "call_history",
            ClientFrame::ActiveCalls => "active_calls",
            ClientFrame::CallAnalytics { .. } => "call_analytics",
            ClientFrame::Ping => "ping",
        }
    }
}

/// Frames the gateway writes in answer to a client frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        op: &'static str,
        result: Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        op: &'static str,
        code: &'static str,
        message: String,
    },
}

impl ServerFrame {
    #[must_use]
    pub fn reply(request_id: Option<String>, op: &'static str, result: Value) -> Self {
        ServerFrame::Reply {
            request_id,
            op,
            result,
        }
    }

    /// Error frame with the client-safe rendering of `err`.
    #[must_use]
    pub fn error(request_id: Option<String>, op: &'static str, err: &CcError) -> Self {
        ServerFrame::Error {
            request_id,
            op,
            code: err.kind(),
            message: err.client_message(),
        }
    }

    /// Error frame for input that could not be parsed as a client frame.
    #[must_use]
    pub fn malformed(detail: &str) -> Self {
        ServerFrame::Error {
            request_id: None,
            op: "unknown",
            code: "validation",
            message: format!("malformed frame: {detail}"),
        }
    }
}
