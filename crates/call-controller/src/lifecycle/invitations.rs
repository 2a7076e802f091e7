//! Invitation answers, expiry and invitations sent after creation.

use super::membership::plan_join;
use super::{incoming_call, CallState, EndPlan, InvitationOutcome, LifecycleEngine};
use crate::errors::CcError;
use crate::models::{
    event_kinds, CallInvitation, CallStatus, EndReason, InvitationResponse, NewCallEvent,
    Participant, ParticipantStatus,
};
use crate::notifications::Recipient;
use crate::repositories::CallChangeset;
use chrono::{DateTime, Utc};
use common::types::{CallId, InvitationId, PeerId, UserId};
use serde_json::json;
use tracing::{debug, info};

impl LifecycleEngine {
    /// Record the invitee's answer.
    ///
    /// Accepting also joins the call. If the join is refused (the call has
    /// ended, or is full) the answer is still stored and the outcome carries
    /// the reason instead of a join. Declining the last pending invitation
    /// of a call nobody else picked up ends the call as `declined`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown invitation, `Unauthorized` if `user_id` is
    /// not the invitee, `Expired` past the deadline, `InvalidState` if it was
    /// already answered.
    pub async fn respond_invitation(
        &self,
        invitation_id: InvitationId,
        user_id: UserId,
        response: InvitationResponse,
        peer_id: PeerId,
    ) -> Result<InvitationOutcome, CcError> {
        let mut invitation = self.find_invitation(invitation_id).await?;
        let call_id = invitation.call_id.clone();
        let mut state = self.load(&call_id).await?;
        let now = Utc::now();
        invitation.respond(user_id, response, now)?;

        let mut changeset = CallChangeset::default();
        changeset.put_invitation(invitation.clone());
        let event_type = if response == InvitationResponse::Accepted {
            event_kinds::INVITATION_ACCEPTED
        } else {
            event_kinds::INVITATION_DECLINED
        };
        changeset.push_event(NewCallEvent::new(
            &call_id,
            Some(user_id),
            event_type,
            json!({ "invitation_id": invitation.invitation_id }),
            now,
        ));

        let mut join_plan = None;
        let mut join_error = None;
        let mut ended = None;
        match response {
            InvitationResponse::Accepted => match plan_join(&state, user_id, peer_id, now) {
                Ok(plan) => {
                    plan.write_into(&mut changeset);
                    join_plan = Some(plan);
                }
                Err(err) => join_error = Some(err.client_message()),
            },
            InvitationResponse::Declined => {
                if let Some(row) = state
                    .live_row(user_id)
                    .filter(|p| p.status == ParticipantStatus::Invited)
                    .cloned()
                {
                    let mut row = row;
                    row.depart(ParticipantStatus::Left, now)?;
                    state.replace(&row);
                    changeset.put_participant(row);
                }
                if self.declined_by_everyone(&state, &invitation, now).await? {
                    let plan = EndPlan::build(
                        &state.call,
                        &state.participants,
                        Some(user_id),
                        CallStatus::Declined,
                        EndReason::UserDeclined,
                        now,
                    )?;
                    ended = Some(plan.call.clone());
                    plan.write_into(&mut changeset);
                }
            }
            InvitationResponse::Expired => {}
        }
        self.registry.commit(changeset).await?;

        info!(
            target: "cc.lifecycle",
            call_id = %call_id,
            user_id = %user_id,
            response = %response,
            joined = join_plan.is_some(),
            "Invitation answered"
        );

        let joined = join_plan.map(|plan| self.after_join(&state, plan));
        let call_ended = ended.is_some();
        let call = if let Some(call) = ended {
            self.after_end(&call);
            call
        } else if let Some(join) = &joined {
            join.call.clone()
        } else {
            state.call
        };
        Ok(InvitationOutcome {
            invitation,
            call,
            joined,
            join_error,
            call_ended,
        })
    }

    /// Persist `expired` on an overdue, unanswered invitation. Returns false
    /// if it was answered or is not due yet.
    ///
    /// # Errors
    ///
    /// `NotFound` if the invitation does not exist or belongs to another
    /// call.
    pub async fn expire_invitation(
        &self,
        call_id: &CallId,
        invitation_id: InvitationId,
    ) -> Result<bool, CcError> {
        let mut invitation = self.find_invitation(invitation_id).await?;
        if invitation.call_id != *call_id {
            return Err(CcError::NotFound(format!(
                "invitation {invitation_id} not found in {call_id}"
            )));
        }
        let now = Utc::now();
        if !invitation.expire(now) {
            return Ok(false);
        }

        let mut changeset = CallChangeset::default();
        changeset.push_event(NewCallEvent::new(
            call_id,
            None,
            event_kinds::INVITATION_EXPIRED,
            json!({
                "invitation_id": invitation.invitation_id,
                "invited_user": invitation.invited_user,
            }),
            now,
        ));
        changeset.put_invitation(invitation);
        self.registry.commit(changeset).await?;

        debug!(
            target: "cc.lifecycle",
            call_id = %call_id,
            invitation_id = %invitation_id,
            "Invitation expired"
        );
        Ok(true)
    }

    /// Invite another user into a running call.
    ///
    /// # Errors
    ///
    /// `Unauthorized` unless the inviter is an active participant (a
    /// moderator, for approval-only calls); `InvalidState` if the invitee is
    /// already in the call or already has a pending invitation;
    /// `CapacityExceeded` when full.
    pub async fn invite(
        &self,
        call_id: &CallId,
        inviter: UserId,
        invitee: UserId,
        message: Option<String>,
    ) -> Result<CallInvitation, CcError> {
        let state = self.load(call_id).await?;
        state.ensure_open()?;
        let inviter_row = state
            .live_row(inviter)
            .filter(|p| p.status.is_active())
            .ok_or_else(|| {
                CcError::Unauthorized("only participants in the call can invite".to_string())
            })?;
        if state.call.settings.require_moderator_approval && !inviter_row.is_moderator {
            return Err(CcError::Unauthorized(
                "only a moderator can invite to this call".to_string(),
            ));
        }
        if invitee == inviter {
            return Err(CcError::Validation("cannot invite yourself".to_string()));
        }
        let invitee_row = state.live_row(invitee);
        if invitee_row.is_some_and(|p| p.status.is_active()) {
            return Err(CcError::InvalidState(format!(
                "user {invitee} is already in the call"
            )));
        }
        let capacity = usize::try_from(state.call.settings.max_participants).unwrap_or(0);
        if state.active_count() >= capacity {
            return Err(CcError::CapacityExceeded(format!(
                "call is full ({capacity} participants)"
            )));
        }

        let now = Utc::now();
        let pending = self
            .registry
            .invitations(call_id)
            .await?
            .into_iter()
            .any(|i| i.invited_user == invitee && i.is_pending(now));
        if pending {
            return Err(CcError::InvalidState(format!(
                "user {invitee} already has a pending invitation"
            )));
        }

        let invitation = CallInvitation::new(
            call_id.clone(),
            invitee,
            inviter,
            message,
            now,
            self.settings.invitation_ttl,
        );
        let mut changeset = CallChangeset::default();
        if invitee_row.is_none() {
            changeset.put_participant(Participant::invited(
                call_id.clone(),
                invitee,
                state.call.kind,
                now,
            ));
        }
        let mut call = state.call.clone();
        if !call.is_group_call {
            call.is_group_call = true;
            changeset.call = Some(call.clone());
        }
        changeset.put_invitation(invitation.clone());
        changeset.push_event(NewCallEvent::new(
            call_id,
            Some(inviter),
            event_kinds::USER_INVITED,
            json!({
                "invitation_id": invitation.invitation_id,
                "invited_user": invitee,
            }),
            now,
        ));
        self.registry.commit(changeset).await?;

        self.sink
            .deliver(Recipient::User(invitee), incoming_call(&call, &invitation));
        info!(
            target: "cc.lifecycle",
            call_id = %call_id,
            inviter = %inviter,
            invitee = %invitee,
            "User invited"
        );
        Ok(invitation)
    }

    async fn find_invitation(&self, invitation_id: InvitationId) -> Result<CallInvitation, CcError> {
        self.registry
            .find_invitation(invitation_id)
            .await?
            .ok_or_else(|| CcError::NotFound(format!("invitation {invitation_id} not found")))
    }

    /// A pre-connect call whose last pending invitation was just declined
    /// and that nobody except the initiator ever joined.
    async fn declined_by_everyone(
        &self,
        state: &CallState,
        answered: &CallInvitation,
        now: DateTime<Utc>,
    ) -> Result<bool, CcError> {
        if !state.call.status.is_pre_connect() {
            return Ok(false);
        }
        let someone_joined = state
            .participants
            .iter()
            .any(|p| p.user_id != state.call.initiated_by && p.joined_at.is_some());
        if someone_joined {
            return Ok(false);
        }
        let still_pending = self
            .registry
            .invitations(&state.call.call_id)
            .await?
            .into_iter()
            .any(|i| i.invitation_id != answered.invitation_id && i.is_pending(now));
        Ok(!still_pending)
    }
}
