//! Transport Gateway.
//!
//! The WebSocket edge of the service. Callers arrive already authenticated
//! (see [`ws::AUTHENTICATED_USER_HEADER`]); each socket is served by one task
//! that reads [`frames::ClientFrame`]s in arrival order and answers each with
//! a reply or an error frame. Notifications from the core reach sockets
//! through the [`GatewayHub`], which also owns the per-call broadcast groups.
//!
//! Group membership rules:
//!
//! - initiating or joining a call subscribes the caller, a failed join does not
//! - leaving unsubscribes before the leave runs
//! - a `user_left` unsubscribes that user after it is delivered
//! - a `call_ended` dissolves the group
//! - when a user's last socket closes, the call they last joined is left
//!   with reason `disconnected`

pub mod frames;
mod hub;
mod ws;

pub use frames::{ClientEnvelope, ClientFrame, ServerFrame};
pub use hub::{ConnectionId, GatewayHub, SOCKET_OUTBOUND_BUFFER};
pub use ws::{authenticated_user, gateway_router, AUTHENTICATED_USER_HEADER};

use crate::actors::CallControllerHandle;
use crate::errors::CcError;
use crate::lifecycle::{InvitationOutcome, LeaveOutcome, MediaOutcome};
use crate::models::{
    Call, CallRequest, EndReason, IceServer, InvitationResponse, LeaveReason, MediaField,
    Participant,
};
use crate::observability::metrics;
use crate::session::{SignalEnvelope, SignalKind};
use common::types::{CallId, InvitationId, PeerId, UserId};
use frames::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// What a caller receives after joining a call room.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub call: Call,
    pub participant: Participant,
    pub participants: Vec<Participant>,
    pub ice_servers: Vec<IceServer>,
    pub rejoined: bool,
    /// Signals queued for this user before they (re)joined.
    pub missed_signals: Vec<SignalEnvelope>,
}

/// Gateway operations over the controller and the socket hub.
pub struct Gateway {
    controller: CallControllerHandle,
    hub: Arc<GatewayHub>,
}

impl Gateway {
    /// `hub` must be the notification sink the controller's engine was
    /// built with.
    #[must_use]
    pub fn new(controller: CallControllerHandle, hub: Arc<GatewayHub>) -> Self {
        Self { controller, hub }
    }

    #[must_use]
    pub fn controller(&self) -> &CallControllerHandle {
        &self.controller
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<GatewayHub> {
        &self.hub
    }

    /// Create a call and subscribe the initiator to it.
    ///
    /// # Errors
    ///
    /// See [`CallControllerHandle::initiate`].
    pub async fn initiate_call(&self, user_id: UserId, request: CallRequest) -> Result<Call, CcError> {
        let call = self.controller.initiate(user_id, request).await?;
        self.hub.subscribe(&call.call_id, user_id);
        Ok(call)
    }

    /// Join a call and subscribe to its broadcast group. Nothing is
    /// subscribed when the join fails.
    ///
    /// # Errors
    ///
    /// See [`CallControllerHandle::join`].
    pub async fn join_call_room(
        &self,
        call_id: &CallId,
        user_id: UserId,
        peer_id: Option<PeerId>,
    ) -> Result<RoomSnapshot, CcError> {
        let peer_id = peer_id.unwrap_or_else(PeerId::generate);
        let outcome = self.controller.join(call_id, user_id, peer_id).await?;
        self.hub.subscribe(call_id, user_id);
        let missed_signals = self.controller.recent_signals(call_id, user_id);
        Ok(RoomSnapshot {
            call: outcome.call,
            participant: outcome.participant,
            participants: outcome.others,
            ice_servers: outcome.ice_servers,
            rejoined: outcome.rejoined,
            missed_signals,
        })
    }

    /// Unsubscribe, then leave.
    ///
    /// # Errors
    ///
    /// See [`CallControllerHandle::leave`].
    pub async fn leave_call_room(
        &self,
        call_id: &CallId,
        user_id: UserId,
    ) -> Result<LeaveOutcome, CcError> {
        self.hub.unsubscribe(call_id, user_id);
        self.controller
            .leave(call_id, user_id, LeaveReason::UserLeft)
            .await
    }

    /// Answer an invitation. An accept that turned into a join subscribes
    /// the invitee.
    ///
    /// # Errors
    ///
    /// See [`CallControllerHandle::respond_invitation`].
    pub async fn respond_invitation(
        &self,
        user_id: UserId,
        invitation_id: InvitationId,
        response: InvitationResponse,
        peer_id: Option<PeerId>,
    ) -> Result<InvitationOutcome, CcError> {
        let peer_id = peer_id.unwrap_or_else(PeerId::generate);
        let outcome = self
            .controller
            .respond_invitation(invitation_id, user_id, response, peer_id)
            .await?;
        if outcome.accepted() {
            self.hub.subscribe(&outcome.call.call_id, user_id);
        }
        Ok(outcome)
    }

    /// # Errors
    ///
    /// See [`CallControllerHandle::relay_signal`].
    pub fn relay_signal(
        &self,
        call_id: &CallId,
        from: UserId,
        to: Option<UserId>,
        kind: SignalKind,
        signal_type: &str,
        payload: Value,
    ) -> Result<SignalEnvelope, CcError> {
        self.controller
            .relay_signal(call_id, from, to, kind, signal_type, payload)
    }

    /// # Errors
    ///
    /// See [`CallControllerHandle::toggle_media`].
    pub async fn toggle_media(
        &self,
        call_id: &CallId,
        user_id: UserId,
        field: MediaField,
        enabled: bool,
    ) -> Result<MediaOutcome, CcError> {
        self.controller
            .toggle_media(call_id, user_id, field, enabled)
            .await
    }

    /// A user's last socket closed: leave the call they last joined. Errors
    /// are logged, since there is no one left to tell.
    pub async fn disconnect(&self, user_id: UserId) {
        let Some(call_id) = self.hub.tracked_call(user_id) else {
            return;
        };
        self.hub.unsubscribe(&call_id, user_id);
        match self
            .controller
            .leave(&call_id, user_id, LeaveReason::Disconnected)
            .await
        {
            Ok(outcome) => {
                info!(
                    target: "cc.gateway",
                    call_id = %call_id,
                    user_id = %user_id,
                    call_ended = outcome.call_ended,
                    "Disconnected user left call"
                );
            }
            Err(e) => {
                debug!(
                    target: "cc.gateway",
                    call_id = %call_id,
                    user_id = %user_id,
                    error = %e,
                    "Leave on disconnect failed"
                );
            }
        }
    }

    /// Run one client frame and build the frame that answers it.
    pub async fn handle_frame(&self, user_id: UserId, envelope: ClientEnvelope) -> ServerFrame {
        let ClientEnvelope { request_id, frame } = envelope;
        let op = frame.op();
        match self.execute(user_id, frame).await {
            Ok(result) => {
                metrics::record_gateway_frame(op, "ok");
                ServerFrame::reply(request_id, op, result)
            }
            Err(e) => {
                metrics::record_gateway_frame(op, "error");
                debug!(
                    target: "cc.gateway",
                    user_id = %user_id,
                    op,
                    error = %e,
                    "Client frame failed"
                );
                ServerFrame::error(request_id, op, &e)
            }
        }
    }

    async fn execute(&self, user_id: UserId, frame: ClientFrame) -> Result<Value, CcError> {
        let controller = &self.controller;
        match frame {
            ClientFrame::InitiateCall { request } => {
                to_json(&self.initiate_call(user_id, request).await?)
            }
            ClientFrame::JoinCall { call_id, peer_id } => {
                to_json(&self.join_call_room(&call_id, user_id, peer_id).await?)
            }
            ClientFrame::LeaveCall { call_id } => {
                to_json(&self.leave_call_room(&call_id, user_id).await?)
            }
            ClientFrame::EndCall { call_id } => to_json(
                &controller
                    .end(&call_id, Some(user_id), EndReason::Normal)
                    .await?,
            ),
            ClientFrame::RespondInvitation {
                invitation_id,
                response,
                peer_id,
            } => to_json(
                &self
                    .respond_invitation(user_id, invitation_id, response, peer_id)
                    .await?,
            ),
            ClientFrame::Signal {
                call_id,
                to,
                signal_type,
                payload,
            } => to_json(&self.relay_signal(
                &call_id,
                user_id,
                to,
                SignalKind::OfferAnswer,
                &signal_type,
                payload,
            )?),
            ClientFrame::IceCandidate {
                call_id,
                to,
                candidate,
            } => to_json(&self.relay_signal(
                &call_id,
                user_id,
                Some(to),
                SignalKind::IceCandidate,
                "candidate",
                candidate,
            )?),
            ClientFrame::ToggleMedia {
                call_id,
                field,
                enabled,
            } => to_json(&self.toggle_media(&call_id, user_id, field, enabled).await?),
            ClientFrame::Ringing { call_id } => {
                to_json(&controller.mark_ringing(&call_id, user_id).await?)
            }
            ClientFrame::Connected { call_id } => {
                to_json(&controller.mark_connected(&call_id, user_id).await?)
            }
            ClientFrame::Hold { call_id, on_hold } => {
                to_json(&controller.set_hold(&call_id, user_id, on_hold).await?)
            }
            ClientFrame::Invite {
                call_id,
                user_id: invitee,
                message,
            } => to_json(&controller.invite(&call_id, user_id, invitee, message).await?),
            ClientFrame::Kick {
                call_id,
                user_id: target,
            } => to_json(&controller.kick(&call_id, user_id, target).await?),
            ClientFrame::QualityReport {
                call_id,
                quality,
                stats,
            } => {
                controller
                    .report_quality(&call_id, user_id, quality, stats)
                    .await?;
                Ok(json!({}))
            }
            ClientFrame::StartRecording { call_id, quality } => to_json(
                &controller
                    .start_recording(&call_id, user_id, quality)
                    .await?,
            ),
            ClientFrame::StopRecording {
                call_id,
                recording_id,
                artifact,
            } => {
                self.require_member(&call_id, user_id)?;
                to_json(
                    &controller
                        .stop_recording(&call_id, recording_id, artifact)
                        .await?,
                )
            }
            ClientFrame::RecentSignals { call_id } => {
                self.require_member(&call_id, user_id)?;
                to_json(&controller.recent_signals(&call_id, user_id))
            }
            ClientFrame::CallHistory { limit, kind } => {
                let limit = limit
                    .unwrap_or(DEFAULT_HISTORY_LIMIT)
                    .clamp(1, MAX_HISTORY_LIMIT);
                to_json(&controller.call_history(user_id, limit, kind).await?)
            }
            ClientFrame::ActiveCalls => to_json(&controller.active_calls_for_user(user_id).await?),
            ClientFrame::CallAnalytics { call_id } => {
                let analytics = controller.call_analytics(&call_id).await?;
                if !analytics.participants.iter().any(|p| p.user_id == user_id) {
                    return Err(CcError::Unauthorized(
                        "only participants can view call analytics".to_string(),
                    ));
                }
                to_json(&analytics)
            }
            ClientFrame::Ping => Ok(json!({ "pong": true })),
        }
    }

    fn require_member(&self, call_id: &CallId, user_id: UserId) -> Result<(), CcError> {
        if self.controller.engine().cache().is_member(call_id, user_id) {
            Ok(())
        } else {
            Err(CcError::Unauthorized(format!(
                "user {user_id} is not in call {call_id}"
            )))
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, CcError> {
    serde_json::to_value(value)
        .map_err(|e| CcError::Internal(format!("reply not serializable: {e}")))
}
