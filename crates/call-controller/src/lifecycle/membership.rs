//! Joining, leaving and removal of participants.

use super::{CallState, EndPlan, JoinOutcome, LeaveOutcome, LifecycleEngine};
use crate::errors::CcError;
use crate::models::{
    event_kinds, Call, CallStatus, EndReason, LeaveReason, NewCallEvent, Participant,
    ParticipantStatus,
};
use crate::notifications::{Notification, Recipient};
use crate::observability::metrics;
use crate::repositories::CallChangeset;
use chrono::{DateTime, Utc};
use common::types::{CallId, PeerId, UserId};
use serde_json::json;
use tracing::info;

/// Every change that makes up one join.
#[derive(Debug, Clone)]
pub(super) struct JoinPlan {
    pub(super) call: Call,
    call_changed: bool,
    status_changed: bool,
    pub(super) participant: Participant,
    rejoined: bool,
    event: NewCallEvent,
}

impl JoinPlan {
    pub(super) fn write_into(&self, changeset: &mut CallChangeset) {
        if self.call_changed {
            changeset.call = Some(self.call.clone());
        }
        changeset.put_participant(self.participant.clone());
        changeset.push_event(self.event.clone());
    }
}

/// Check whether `user_id` may join and compute the resulting rows.
///
/// A user with a non-terminal row reuses it; an already active row only has
/// its peer id refreshed and does not count against capacity again. Users
/// without a row are admitted as walk-ins unless the call requires approval.
pub(super) fn plan_join(
    state: &CallState,
    user_id: UserId,
    peer_id: PeerId,
    now: DateTime<Utc>,
) -> Result<JoinPlan, CcError> {
    state.ensure_open()?;
    let existing = state.live_row(user_id);
    let rejoined = existing.is_some_and(|p| p.status.is_active());
    let active = state.active_count();

    if !rejoined {
        let capacity = usize::try_from(state.call.settings.max_participants).unwrap_or(0);
        if active >= capacity {
            return Err(CcError::CapacityExceeded(format!(
                "call is full ({capacity} participants)"
            )));
        }
        if existing.is_none() && state.call.settings.require_moderator_approval {
            return Err(CcError::Unauthorized(
                "this call only admits invited users".to_string(),
            ));
        }
    }

    let mut participant = existing.cloned().unwrap_or_else(|| {
        Participant::invited(state.call.call_id.clone(), user_id, state.call.kind, now)
    });
    participant.begin_join(peer_id.clone(), now)?;

    let mut call = state.call.clone();
    if call.status.is_pre_connect() {
        call.advance(CallStatus::Connecting, now)?;
    }
    call.note_concurrency(if rejoined { active } else { active + 1 });
    let status_changed = call.status != state.call.status;
    let call_changed = call != state.call;

    let event = NewCallEvent::new(
        &call.call_id,
        Some(user_id),
        event_kinds::USER_JOINING,
        json!({
            "peer_id": peer_id,
            "rejoined": rejoined,
            "call_status": call.status,
        }),
        now,
    );
    Ok(JoinPlan {
        call,
        call_changed,
        status_changed,
        participant,
        rejoined,
        event,
    })
}

impl LifecycleEngine {
    /// Admit a user to a call as `connecting`.
    ///
    /// The first join of a call that has not connected yet moves it to
    /// `connecting` and stamps `started_at`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown call, `InvalidState` once the call is
    /// terminal, `CapacityExceeded` when full, `Unauthorized` for uninvited
    /// users of an approval-only call.
    pub async fn join(
        &self,
        call_id: &CallId,
        user_id: UserId,
        peer_id: PeerId,
    ) -> Result<JoinOutcome, CcError> {
        let state = self.load(call_id).await?;
        let plan = plan_join(&state, user_id, peer_id, Utc::now())?;

        let mut changeset = CallChangeset::default();
        plan.write_into(&mut changeset);
        self.registry.commit(changeset).await?;

        Ok(self.after_join(&state, plan))
    }

    /// Post-commit effects of a join, and the outcome handed to the joiner.
    pub(super) fn after_join(&self, state: &CallState, plan: JoinPlan) -> JoinOutcome {
        let call_id = &plan.call.call_id;
        let user_id = plan.participant.user_id;
        if let Some(peer_id) = plan.participant.peer_id.clone() {
            self.cache.record_member(call_id, user_id, peer_id.clone());
            self.sink.deliver(
                Recipient::call_group(call_id, Some(user_id)),
                Notification::UserJoined {
                    call_id: call_id.clone(),
                    user_id,
                    peer_id,
                    joined_at: plan.participant.joined_at.unwrap_or_else(Utc::now),
                },
            );
        }
        metrics::set_calls_active(self.cache.active_calls());
        if plan.status_changed {
            self.announce_status(&plan.call);
        }

        info!(
            target: "cc.lifecycle",
            call_id = %call_id,
            user_id = %user_id,
            rejoined = plan.rejoined,
            call_status = %plan.call.status,
            "User joined call"
        );

        let others = state
            .participants
            .iter()
            .filter(|p| p.status.is_active() && p.user_id != user_id)
            .cloned()
            .collect();
        JoinOutcome {
            ice_servers: plan.call.ice_servers.clone(),
            call: plan.call,
            participant: plan.participant,
            others,
            rejoined: plan.rejoined,
        }
    }

    /// Leave a call. If that drops the active count to one or zero the call
    /// ends with reason `no_participants` in the same commit.
    ///
    /// Leaving again after the user's row is already terminal succeeds
    /// without changes.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown call or a user who never had a row.
    pub async fn leave(
        &self,
        call_id: &CallId,
        user_id: UserId,
        reason: LeaveReason,
    ) -> Result<LeaveOutcome, CcError> {
        let state = self.load(call_id).await?;
        let Some(row) = state.live_row(user_id).cloned() else {
            if state.participants.iter().any(|p| p.user_id == user_id) {
                return Ok(LeaveOutcome {
                    call: state.call,
                    participant: None,
                    call_ended: false,
                });
            }
            return Err(CcError::NotFound(format!(
                "user {user_id} is not a participant of {call_id}"
            )));
        };
        self.depart(state, row, ParticipantStatus::Left, reason, None)
            .await
    }

    /// Remove another participant. Moderator only; the same auto-end rule as
    /// [`LifecycleEngine::leave`] applies.
    ///
    /// # Errors
    ///
    /// `Unauthorized` unless `moderator` holds a live moderator row,
    /// `Validation` for kicking oneself, `NotFound` for an unknown target.
    pub async fn kick(
        &self,
        call_id: &CallId,
        moderator: UserId,
        target: UserId,
    ) -> Result<LeaveOutcome, CcError> {
        let state = self.load(call_id).await?;
        state.ensure_open()?;
        state.require_moderator(moderator)?;
        if target == moderator {
            return Err(CcError::Validation(
                "use leave to exit a call yourself".to_string(),
            ));
        }
        let row = state.require_row(target)?.clone();
        self.depart(
            state,
            row,
            ParticipantStatus::Kicked,
            LeaveReason::Kicked,
            Some(moderator),
        )
        .await
    }

    async fn depart(
        &self,
        mut state: CallState,
        mut row: Participant,
        status: ParticipantStatus,
        reason: LeaveReason,
        by: Option<UserId>,
    ) -> Result<LeaveOutcome, CcError> {
        let now = Utc::now();
        let call_id = state.call.call_id.clone();
        let was_active = row.status.is_active();
        row.depart(status, now)?;
        state.replace(&row);

        let event_type = if status == ParticipantStatus::Kicked {
            event_kinds::USER_KICKED
        } else {
            event_kinds::USER_LEFT
        };
        let mut changeset = CallChangeset::default();
        changeset.put_participant(row.clone());
        changeset.push_event(NewCallEvent::new(
            &call_id,
            Some(row.user_id),
            event_type,
            json!({
                "reason": reason,
                "by": by,
                "duration_seconds": row.duration_in_call(now),
            }),
            now,
        ));

        let remaining = state.active_count();
        let mut ended = None;
        if was_active && !state.call.status.is_terminal() && remaining <= 1 {
            let plan = EndPlan::build(
                &state.call,
                &state.participants,
                None,
                CallStatus::Ended,
                EndReason::NoParticipants,
                now,
            )?;
            ended = Some(plan.call.clone());
            plan.write_into(&mut changeset);
        }
        self.registry.commit(changeset).await?;

        self.cache.remove_member(&call_id, row.user_id);
        // A kicked user is told too; someone leaving already knows.
        let except = (status != ParticipantStatus::Kicked).then_some(row.user_id);
        self.sink.deliver(
            Recipient::call_group(&call_id, except),
            Notification::UserLeft {
                call_id: call_id.clone(),
                user_id: row.user_id,
                reason,
            },
        );
        info!(
            target: "cc.lifecycle",
            call_id = %call_id,
            user_id = %row.user_id,
            reason = %reason,
            remaining,
            "User left call"
        );

        let call_ended = ended.is_some();
        let call = match ended {
            Some(call) => {
                self.after_end(&call);
                info!(
                    target: "cc.lifecycle",
                    call_id = %call_id,
                    duration_seconds = call.duration_seconds,
                    "Call ended, not enough participants left"
                );
                call
            }
            None => state.call,
        };
        Ok(LeaveOutcome {
            call,
            participant: Some(row),
            call_ended,
        })
    }
}
