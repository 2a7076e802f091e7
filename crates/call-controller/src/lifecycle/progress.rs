//! Call progress reported by clients: ringing, connected, hold.

use super::LifecycleEngine;
use crate::errors::CcError;
use crate::models::{event_kinds, Call, CallStatus, NewCallEvent, Participant};
use crate::repositories::CallChangeset;
use chrono::Utc;
use common::types::{CallId, UserId};
use serde_json::json;
use tracing::{debug, info};

impl LifecycleEngine {
    /// An invitee's client is presenting the incoming call. Moves an
    /// `initiated` call to `ringing`; later statuses are left alone.
    ///
    /// # Errors
    ///
    /// `InvalidState` for a terminal call, `NotFound` if the user has no
    /// live row.
    pub async fn mark_ringing(&self, call_id: &CallId, user_id: UserId) -> Result<Call, CcError> {
        let state = self.load(call_id).await?;
        state.ensure_open()?;
        state.require_row(user_id)?;
        if state.call.status != CallStatus::Initiated {
            return Ok(state.call);
        }

        let now = Utc::now();
        let mut call = state.call;
        call.advance(CallStatus::Ringing, now)?;
        let mut changeset = CallChangeset::default();
        changeset.call = Some(call.clone());
        changeset.push_event(NewCallEvent::new(
            call_id,
            Some(user_id),
            event_kinds::CALL_RINGING,
            json!({}),
            now,
        ));
        self.registry.commit(changeset).await?;

        self.announce_status(&call);
        debug!(target: "cc.lifecycle", call_id = %call_id, user_id = %user_id, "Call ringing");
        Ok(call)
    }

    /// The user's peer connection is up. The first such report on a
    /// `connecting` call moves the call to `connected`.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the call is terminal or the user never joined,
    /// `NotFound` if the user has no live row.
    pub async fn mark_connected(
        &self,
        call_id: &CallId,
        user_id: UserId,
    ) -> Result<Participant, CcError> {
        let state = self.load(call_id).await?;
        state.ensure_open()?;
        let mut row = state.require_row(user_id)?.clone();

        let now = Utc::now();
        let row_changed = row.mark_connected()?;
        let mut call = state.call.clone();
        if call.status == CallStatus::Connecting {
            call.advance(CallStatus::Connected, now)?;
        }
        let status_changed = call.status != state.call.status;
        if !row_changed && !status_changed {
            return Ok(row);
        }

        let mut changeset = CallChangeset::default();
        if row_changed {
            changeset.put_participant(row.clone());
            changeset.push_event(NewCallEvent::new(
                call_id,
                Some(user_id),
                event_kinds::USER_CONNECTED,
                json!({ "peer_id": row.peer_id }),
                now,
            ));
        }
        if status_changed {
            changeset.call = Some(call.clone());
            changeset.push_event(NewCallEvent::new(
                call_id,
                Some(user_id),
                event_kinds::CALL_CONNECTED,
                json!({ "started_at": call.started_at }),
                now,
            ));
        }
        self.registry.commit(changeset).await?;

        if status_changed {
            self.announce_status(&call);
            info!(target: "cc.lifecycle", call_id = %call_id, "Call connected");
        }
        Ok(row)
    }

    /// Put a connected call on hold or resume it. Moderator only. Asking for
    /// the status the call is already in changes nothing.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for non-moderators, `InvalidState` if the call is not
    /// `connected` or `on_hold`.
    pub async fn set_hold(
        &self,
        call_id: &CallId,
        actor: UserId,
        on_hold: bool,
    ) -> Result<Call, CcError> {
        let state = self.load(call_id).await?;
        state.ensure_open()?;
        state.require_moderator(actor)?;

        let target = if on_hold {
            CallStatus::OnHold
        } else {
            CallStatus::Connected
        };
        if state.call.status == target {
            return Ok(state.call);
        }

        let now = Utc::now();
        let mut call = state.call;
        call.advance(target, now)?;
        let event_type = if on_hold {
            event_kinds::CALL_ON_HOLD
        } else {
            event_kinds::CALL_RESUMED
        };
        let mut changeset = CallChangeset::default();
        changeset.call = Some(call.clone());
        changeset.push_event(NewCallEvent::new(call_id, Some(actor), event_type, json!({}), now));
        self.registry.commit(changeset).await?;

        self.announce_status(&call);
        info!(target: "cc.lifecycle", call_id = %call_id, status = %call.status, "Hold changed");
        Ok(call)
    }
}
