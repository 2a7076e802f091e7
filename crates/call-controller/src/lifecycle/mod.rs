//! Call Lifecycle Engine.
//!
//! Owns the call state machine. Every mutating operation loads the call from
//! the registry, plans the complete set of row changes and audit events,
//! commits them as one [`CallChangeset`], and only then updates the Session
//! Cache and emits notifications. A failed commit leaves the cache and the
//! clients untouched.
//!
//! Apart from [`LifecycleEngine::initiate`], which creates a call nobody else
//! can see yet, mutating operations must be driven from the call's actor so
//! that changes to one call never interleave.

mod invitations;
mod media;
mod membership;
mod outcomes;
mod progress;
mod queries;

pub use outcomes::{
    CallAnalytics, CallDetails, EndOutcome, InvitationOutcome, JoinOutcome, LeaveOutcome, MediaOutcome,
    ParticipantSummary,
};

use crate::errors::CcError;
use crate::models::{
    event_kinds, Call, CallInvitation, CallRequest, CallSettings, CallStatus, EndReason,
    IceServer, NewCallEvent, Participant, ParticipantStatus, DEFAULT_INVITATION_TTL_SECONDS,
    DEFAULT_MAX_PARTICIPANTS,
};
use crate::notifications::{Notification, NotificationSink, Recipient};
use crate::observability::metrics;
use crate::repositories::{CallChangeset, CallRegistry};
use crate::session::SessionCache;
use chrono::{DateTime, Duration, Utc};
use common::types::{CallId, PeerId, UserId};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};

/// Public STUN servers handed out when none are configured.
pub const DEFAULT_ICE_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Tunables the engine applies to new calls and invitations.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub ice_servers: Vec<IceServer>,
    pub invitation_ttl: Duration,
    /// Capacity for calls created without explicit settings.
    pub default_max_participants: i32,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|u| IceServer::stun(*u)).collect(),
            invitation_ttl: Duration::seconds(DEFAULT_INVITATION_TTL_SECONDS),
            default_max_participants: DEFAULT_MAX_PARTICIPANTS,
        }
    }
}

/// The state machine driver shared by every call actor.
pub struct LifecycleEngine {
    registry: Arc<dyn CallRegistry>,
    cache: Arc<SessionCache>,
    sink: Arc<dyn NotificationSink>,
    settings: LifecycleSettings,
}

impl LifecycleEngine {
    #[must_use]
    pub fn new(
        registry: Arc<dyn CallRegistry>,
        cache: Arc<SessionCache>,
        sink: Arc<dyn NotificationSink>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            cache,
            sink,
            settings,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<dyn CallRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.sink
    }

    #[must_use]
    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Create a call with the initiator as moderator and one invitation per
    /// target, then ring the targets.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed request; `Database` if the write fails,
    /// in which case nothing was created.
    #[instrument(skip_all, name = "cc.lifecycle.initiate", fields(initiator = %initiator))]
    pub async fn initiate(&self, initiator: UserId, request: CallRequest) -> Result<Call, CcError> {
        let now = Utc::now();
        let settings = request.settings.unwrap_or(CallSettings {
            max_participants: self.settings.default_max_participants,
            ..CallSettings::default()
        });
        request.validate(initiator, &settings)?;

        let call = Call::new(
            initiator,
            &request,
            settings,
            self.settings.ice_servers.clone(),
            now,
        );
        let call_id = call.call_id.clone();
        let initiator_peer = request.peer_id.clone().unwrap_or_else(PeerId::generate);

        let mut changeset = CallChangeset::default();
        changeset.put_participant(Participant::initiator(
            call_id.clone(),
            initiator,
            call.kind,
            initiator_peer.clone(),
            now,
        ));
        let mut invitations = Vec::with_capacity(request.targets.len());
        for target in &request.targets {
            changeset.put_participant(Participant::invited(
                call_id.clone(),
                *target,
                call.kind,
                now,
            ));
            let invitation = CallInvitation::new(
                call_id.clone(),
                *target,
                initiator,
                request.invitation_message.clone(),
                now,
                self.settings.invitation_ttl,
            );
            changeset.put_invitation(invitation.clone());
            invitations.push(invitation);
        }
        changeset.push_event(NewCallEvent::new(
            &call_id,
            Some(initiator),
            event_kinds::CALL_INITIATED,
            json!({
                "kind": call.kind,
                "targets": request.targets,
                "is_group_call": call.is_group_call,
            }),
            now,
        ));
        changeset.call = Some(call.clone());
        self.registry.create_call(changeset).await?;

        self.cache.activate(&call_id);
        // The initiator is joined from creation and may signal right away.
        self.cache.record_member(&call_id, initiator, initiator_peer);
        metrics::record_call_transition(call.status.as_str());
        metrics::set_calls_active(self.cache.active_calls());

        for invitation in invitations {
            self.sink.deliver(
                Recipient::User(invitation.invited_user),
                incoming_call(&call, &invitation),
            );
        }

        info!(
            target: "cc.lifecycle",
            call_id = %call_id,
            initiator = %initiator,
            kind = %call.kind,
            targets = request.targets.len(),
            "Call initiated"
        );
        Ok(call)
    }

    /// End a call, moving every remaining participant to `left`.
    ///
    /// Ending a call that is already terminal is a successful no-op. When
    /// `ended_by` is given, that user must hold a row in the call.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown call, `Unauthorized` if `ended_by` never
    /// took part, `Database` on write failure.
    pub async fn end(
        &self,
        call_id: &CallId,
        ended_by: Option<UserId>,
        reason: EndReason,
    ) -> Result<EndOutcome, CcError> {
        let state = self.load(call_id).await?;
        if state.call.status.is_terminal() {
            return Ok(EndOutcome {
                call: state.call,
                already_ended: true,
                participants_left: 0,
            });
        }
        if let Some(user) = ended_by {
            if !state.participants.iter().any(|p| p.user_id == user) {
                return Err(CcError::Unauthorized(
                    "only participants can end a call".to_string(),
                ));
            }
        }

        let now = Utc::now();
        let plan = EndPlan::build(
            &state.call,
            &state.participants,
            ended_by,
            CallStatus::Ended,
            reason,
            now,
        )?;
        let call = plan.call.clone();
        let participants_left = plan.departed.len();

        let mut changeset = CallChangeset::default();
        plan.write_into(&mut changeset);
        self.registry.commit(changeset).await?;

        self.after_end(&call);
        info!(
            target: "cc.lifecycle",
            call_id = %call_id,
            reason = %reason,
            duration_seconds = call.duration_seconds,
            "Call ended"
        );
        Ok(EndOutcome {
            call,
            already_ended: false,
            participants_left,
        })
    }

    /// End a call that never connected, if it is still pre-connect and was
    /// created at or before `cutoff`. Returns whether the call was ended.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown call, `Database` on registry failure.
    pub async fn timeout_stale_call(
        &self,
        call_id: &CallId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, CcError> {
        let state = self.load(call_id).await?;
        if !state.call.status.is_pre_connect() || state.call.created_at > cutoff {
            return Ok(false);
        }

        let plan = EndPlan::build(
            &state.call,
            &state.participants,
            None,
            CallStatus::Ended,
            EndReason::Timeout,
            Utc::now(),
        )?;
        let call = plan.call.clone();
        let mut changeset = CallChangeset::default();
        plan.write_into(&mut changeset);
        self.registry.commit(changeset).await?;

        self.after_end(&call);
        info!(
            target: "cc.lifecycle",
            call_id = %call_id,
            created_at = %call.created_at,
            "Stale call timed out"
        );
        Ok(true)
    }

    /// Load a call and all of its participant rows.
    async fn load(&self, call_id: &CallId) -> Result<CallState, CcError> {
        let call = self
            .registry
            .find_call(call_id)
            .await?
            .ok_or_else(|| CcError::NotFound(format!("call {call_id} not found")))?;
        let participants = self.registry.participants(call_id).await?;
        Ok(CallState { call, participants })
    }

    /// Post-commit effects of a call reaching a terminal status.
    fn after_end(&self, call: &Call) {
        self.cache.deactivate(&call.call_id);
        metrics::record_call_transition(call.status.as_str());
        metrics::set_calls_active(self.cache.active_calls());
        self.sink.deliver(
            Recipient::call_group(&call.call_id, None),
            Notification::CallEnded {
                call_id: call.call_id.clone(),
                reason: call.end_reason.unwrap_or(EndReason::Normal),
                duration_seconds: call.duration_seconds,
            },
        );
    }

    /// Tell the call group about a non-terminal status change.
    fn announce_status(&self, call: &Call) {
        metrics::record_call_transition(call.status.as_str());
        self.sink.deliver(
            Recipient::call_group(&call.call_id, None),
            Notification::CallStatusChanged {
                call_id: call.call_id.clone(),
                status: call.status,
            },
        );
    }
}

fn incoming_call(call: &Call, invitation: &CallInvitation) -> Notification {
    Notification::IncomingCall {
        call_id: call.call_id.clone(),
        kind: call.kind,
        title: call.title.clone(),
        initiated_by: call.initiated_by,
        invitation_id: invitation.invitation_id,
        message: invitation.message.clone(),
        expires_at: invitation.expires_at,
    }
}

/// A call as loaded from the registry at the start of an operation.
#[derive(Debug, Clone)]
struct CallState {
    call: Call,
    participants: Vec<Participant>,
}

impl CallState {
    /// The user's non-terminal row, if any.
    fn live_row(&self, user_id: UserId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.user_id == user_id && !p.status.is_terminal())
    }

    fn active_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.status.is_active())
            .count()
    }

    fn ensure_open(&self) -> Result<(), CcError> {
        if self.call.status.is_terminal() {
            return Err(CcError::InvalidState(format!(
                "call is already {}",
                self.call.status
            )));
        }
        Ok(())
    }

    /// The user's live row, required to exist.
    fn require_row(&self, user_id: UserId) -> Result<&Participant, CcError> {
        self.live_row(user_id).ok_or_else(|| {
            CcError::NotFound(format!(
                "user {user_id} is not a participant of {}",
                self.call.call_id
            ))
        })
    }

    /// The user's live row, required to be a moderator's.
    fn require_moderator(&self, user_id: UserId) -> Result<&Participant, CcError> {
        match self.live_row(user_id) {
            Some(row) if row.is_moderator => Ok(row),
            _ => Err(CcError::Unauthorized(
                "only a moderator can do that".to_string(),
            )),
        }
    }

    /// Replace a row in the working copy after it was changed.
    fn replace(&mut self, participant: &Participant) {
        if let Some(slot) = self
            .participants
            .iter_mut()
            .find(|p| p.participant_id == participant.participant_id)
        {
            slot.clone_from(participant);
        }
    }
}

/// Every change that makes up ending a call.
#[derive(Debug)]
struct EndPlan {
    call: Call,
    departed: Vec<Participant>,
    event: NewCallEvent,
}

impl EndPlan {
    /// Finish the call with `outcome` and move every non-terminal row to
    /// `left`. `participants` must already reflect earlier changes in the
    /// same operation.
    fn build(
        call: &Call,
        participants: &[Participant],
        ended_by: Option<UserId>,
        outcome: CallStatus,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<Self, CcError> {
        let mut call = call.clone();
        let active_before = participants
            .iter()
            .filter(|p| p.status.is_active())
            .count();
        call.finish(outcome, reason, now)?;

        let mut departed = Vec::new();
        for participant in participants.iter().filter(|p| !p.status.is_terminal()) {
            let mut participant = participant.clone();
            participant.depart(ParticipantStatus::Left, now)?;
            departed.push(participant);
        }

        let event = NewCallEvent::new(
            &call.call_id,
            ended_by,
            event_kinds::CALL_ENDED,
            json!({
                "status": call.status,
                "reason": reason,
                "participant_count": active_before,
                "duration_seconds": call.duration_seconds,
            }),
            now,
        );
        Ok(Self {
            call,
            departed,
            event,
        })
    }

    fn write_into(self, changeset: &mut CallChangeset) {
        changeset.call = Some(self.call);
        for participant in self.departed {
            changeset.put_participant(participant);
        }
        changeset.push_event(self.event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod test_support {
    use super::*;
    use crate::notifications::testing::CapturingSink;
    use crate::repositories::InMemoryCallRegistry;
    use crate::models::CallKind;

    pub(crate) struct Fixture {
        pub(crate) engine: LifecycleEngine,
        pub(crate) registry: Arc<InMemoryCallRegistry>,
        pub(crate) cache: Arc<SessionCache>,
        pub(crate) sink: Arc<CapturingSink>,
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(LifecycleSettings::default())
    }

    pub(crate) fn fixture_with(settings: LifecycleSettings) -> Fixture {
        let registry = Arc::new(InMemoryCallRegistry::new());
        let cache = Arc::new(SessionCache::default());
        let sink = Arc::new(CapturingSink::default());
        let engine = LifecycleEngine::new(
            Arc::clone(&registry) as Arc<dyn CallRegistry>,
            Arc::clone(&cache),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
            settings,
        );
        Fixture {
            engine,
            registry,
            cache,
            sink,
        }
    }

    impl Fixture {
        /// A video call from user 1 to the given targets.
        pub(crate) async fn call_to(&self, targets: &[i64]) -> Call {
            let request =
                CallRequest::new(CallKind::Video, targets.iter().copied().map(UserId).collect());
            self.engine.initiate(UserId(1), request).await.unwrap()
        }

        pub(crate) async fn row(&self, call_id: &CallId, user: i64) -> Participant {
            self.registry
                .participants(call_id)
                .await
                .unwrap()
                .into_iter()
                .rev()
                .find(|p| p.user_id == UserId(user))
                .unwrap()
        }

        pub(crate) async fn call(&self, call_id: &CallId) -> Call {
            self.registry.find_call(call_id).await.unwrap().unwrap()
        }

        pub(crate) async fn event_types(&self, call_id: &CallId) -> Vec<String> {
            self.registry
                .events(call_id)
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.event_type)
                .collect()
        }
    }
}
