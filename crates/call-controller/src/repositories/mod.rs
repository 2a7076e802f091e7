//! Call Registry: durable storage for calls and everything hanging off them.
//!
//! Writes go through [`CallChangeset`]s so that a status change and the audit
//! events describing it commit together or not at all. Two implementations:
//! [`PgCallRegistry`] for production and [`InMemoryCallRegistry`] for tests and
//! single-process deployments.

mod memory;
mod postgres;

pub use memory::InMemoryCallRegistry;
pub use postgres::PgCallRegistry;

use crate::errors::CcError;
use crate::models::{Call, CallEvent, CallInvitation, CallKind, CallRecording, NewCallEvent, Participant};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CallId, InvitationId, RecordingId, UserId};

/// A set of registry writes applied atomically.
///
/// Participants, invitations and recordings are upserted by id; events are
/// appended in order.
#[derive(Debug, Default, Clone)]
pub struct CallChangeset {
    pub call: Option<Call>,
    pub participants: Vec<Participant>,
    pub invitations: Vec<CallInvitation>,
    pub recordings: Vec<CallRecording>,
    pub events: Vec<NewCallEvent>,
}

impl CallChangeset {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.call.is_none()
            && self.participants.is_empty()
            && self.invitations.is_empty()
            && self.recordings.is_empty()
            && self.events.is_empty()
    }

    /// Upsert a participant, replacing an earlier entry for the same row.
    pub fn put_participant(&mut self, participant: Participant) {
        self.participants
            .retain(|p| p.participant_id != participant.participant_id);
        self.participants.push(participant);
    }

    /// Upsert an invitation, replacing an earlier entry for the same row.
    pub fn put_invitation(&mut self, invitation: CallInvitation) {
        self.invitations
            .retain(|i| i.invitation_id != invitation.invitation_id);
        self.invitations.push(invitation);
    }

    pub fn push_event(&mut self, event: NewCallEvent) {
        self.events.push(event);
    }
}

/// Durable call storage.
///
/// Implementations must be safe to share across tasks. Lifecycle code
/// serializes writes per call, so implementations only need to keep each
/// changeset atomic and enforce the one-live-row-per-user constraint.
#[async_trait]
pub trait CallRegistry: Send + Sync + 'static {
    /// Insert a new call (`changeset.call` is required) together with its
    /// initial participants, invitations and events.
    async fn create_call(&self, changeset: CallChangeset) -> Result<(), CcError>;

    /// Apply updates to an existing call in one transaction.
    async fn commit(&self, changeset: CallChangeset) -> Result<(), CcError>;

    async fn find_call(&self, call_id: &CallId) -> Result<Option<Call>, CcError>;

    /// All participant rows of a call, oldest first.
    async fn participants(&self, call_id: &CallId) -> Result<Vec<Participant>, CcError>;

    async fn find_invitation(
        &self,
        invitation_id: InvitationId,
    ) -> Result<Option<CallInvitation>, CcError>;

    async fn invitations(&self, call_id: &CallId) -> Result<Vec<CallInvitation>, CcError>;

    async fn find_recording(
        &self,
        recording_id: RecordingId,
    ) -> Result<Option<CallRecording>, CcError>;

    /// Append a standalone audit entry.
    async fn record_event(&self, event: NewCallEvent) -> Result<(), CcError>;

    /// Events of a call in the order they were written.
    async fn events(&self, call_id: &CallId) -> Result<Vec<CallEvent>, CcError>;

    /// Calls still `initiated` or `ringing` that were created at or before
    /// `created_before`.
    async fn stale_calls(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CallId>, CcError>;

    /// Unanswered invitations whose expiry is at or before `now`.
    async fn overdue_invitations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CallInvitation>, CcError>;

    /// Calls the user has a participant row in, newest first.
    async fn call_history(
        &self,
        user_id: UserId,
        limit: i64,
        kind: Option<CallKind>,
    ) -> Result<Vec<Call>, CcError>;

    /// Non-terminal calls in which the user is an active participant.
    async fn active_calls_for_user(&self, user_id: UserId) -> Result<Vec<Call>, CcError>;
}
