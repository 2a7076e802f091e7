//! In-process registry backend.
//!
//! Holds everything behind one mutex, keyed by call. Each changeset is staged
//! against a copy of the affected call's records and swapped in only after
//! the live-row constraint holds, so a rejected changeset leaves no trace.

use super::{CallChangeset, CallRegistry};
use crate::errors::CcError;
use crate::models::{
    Call, CallEvent, CallInvitation, CallKind, CallRecording, NewCallEvent, Participant,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CallId, InvitationId, RecordingId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct CallRecord {
    call: Call,
    participants: Vec<Participant>,
    invitations: Vec<CallInvitation>,
    recordings: Vec<CallRecording>,
    events: Vec<CallEvent>,
}

impl CallRecord {
    fn new(call: Call) -> Self {
        Self {
            call,
            participants: Vec::new(),
            invitations: Vec::new(),
            recordings: Vec::new(),
            events: Vec::new(),
        }
    }

    fn upsert_participant(&mut self, participant: Participant) {
        match self
            .participants
            .iter_mut()
            .find(|p| p.participant_id == participant.participant_id)
        {
            Some(slot) => *slot = participant,
            None => self.participants.push(participant),
        }
    }

    fn upsert_invitation(&mut self, invitation: CallInvitation) {
        match self
            .invitations
            .iter_mut()
            .find(|i| i.invitation_id == invitation.invitation_id)
        {
            Some(slot) => *slot = invitation,
            None => self.invitations.push(invitation),
        }
    }

    fn upsert_recording(&mut self, recording: CallRecording) {
        match self
            .recordings
            .iter_mut()
            .find(|r| r.recording_id == recording.recording_id)
        {
            Some(slot) => *slot = recording,
            None => self.recordings.push(recording),
        }
    }

    fn check_live_rows(&self) -> Result<(), CcError> {
        let mut live = HashSet::new();
        for p in self.participants.iter().filter(|p| !p.status.is_terminal()) {
            if !live.insert(p.user_id) {
                return Err(CcError::Database(format!(
                    "duplicate live participant row for user {} in {}",
                    p.user_id, p.call_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    calls: HashMap<CallId, CallRecord>,
    invitation_index: HashMap<InvitationId, CallId>,
    recording_index: HashMap<RecordingId, CallId>,
    next_event_id: i64,
}

impl Inner {
    fn append_event(&mut self, record_call: &CallId, event: NewCallEvent) -> CallEvent {
        self.next_event_id += 1;
        CallEvent {
            event_id: self.next_event_id,
            call_id: record_call.clone(),
            user_id: event.user_id,
            event_type: event.event_type.to_string(),
            payload: event.payload,
            occurred_at: event.occurred_at,
        }
    }
}

/// Registry backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryCallRegistry {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl InMemoryCallRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a database error until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, CcError> {
        self.inner
            .lock()
            .map_err(|_| CcError::Internal("registry lock poisoned".to_string()))
    }

    fn check_write(&self) -> Result<(), CcError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CcError::Database("injected write failure".to_string()));
        }
        Ok(())
    }

    fn apply(&self, changeset: CallChangeset, create: bool) -> Result<(), CcError> {
        self.check_write()?;
        let call_id = changeset_call_id(&changeset)?;
        let mut inner = self.lock()?;

        let mut staged = match (create, inner.calls.get(&call_id)) {
            (true, Some(_)) => {
                return Err(CcError::Database(format!("call {call_id} already exists")));
            }
            (true, None) => match &changeset.call {
                Some(call) => CallRecord::new(call.clone()),
                None => {
                    return Err(CcError::Internal(
                        "create_call requires a call".to_string(),
                    ));
                }
            },
            (false, Some(record)) => record.clone(),
            (false, None) => return Err(CcError::NotFound(format!("call {call_id}"))),
        };

        let CallChangeset {
            call,
            participants,
            invitations,
            recordings,
            events,
        } = changeset;

        if let Some(call) = call {
            staged.call = call;
        }
        for participant in participants {
            staged.upsert_participant(participant);
        }
        let invitation_ids: Vec<InvitationId> =
            invitations.iter().map(|i| i.invitation_id).collect();
        for invitation in invitations {
            staged.upsert_invitation(invitation);
        }
        let recording_ids: Vec<RecordingId> =
            recordings.iter().map(|r| r.recording_id).collect();
        for recording in recordings {
            staged.upsert_recording(recording);
        }
        staged.check_live_rows()?;

        for event in events {
            let stored = inner.append_event(&call_id, event);
            staged.events.push(stored);
        }
        for id in invitation_ids {
            inner.invitation_index.insert(id, call_id.clone());
        }
        for id in recording_ids {
            inner.recording_index.insert(id, call_id.clone());
        }
        inner.calls.insert(call_id, staged);
        Ok(())
    }
}

/// Every item in a changeset must belong to the same call.
fn changeset_call_id(changeset: &CallChangeset) -> Result<CallId, CcError> {
    let ids: Vec<&CallId> = changeset
        .call
        .iter()
        .map(|c| &c.call_id)
        .chain(changeset.participants.iter().map(|p| &p.call_id))
        .chain(changeset.invitations.iter().map(|i| &i.call_id))
        .chain(changeset.recordings.iter().map(|r| &r.call_id))
        .chain(changeset.events.iter().map(|e| &e.call_id))
        .collect();

    let first = ids
        .first()
        .copied()
        .ok_or_else(|| CcError::Internal("empty changeset".to_string()))?;
    if ids.iter().any(|id| *id != first) {
        return Err(CcError::Internal("changeset spans calls".to_string()));
    }
    Ok(first.clone())
}

#[async_trait]
impl CallRegistry for InMemoryCallRegistry {
    async fn create_call(&self, changeset: CallChangeset) -> Result<(), CcError> {
        self.apply(changeset, true)
    }

    async fn commit(&self, changeset: CallChangeset) -> Result<(), CcError> {
        self.apply(changeset, false)
    }

    async fn find_call(&self, call_id: &CallId) -> Result<Option<Call>, CcError> {
        Ok(self.lock()?.calls.get(call_id).map(|r| r.call.clone()))
    }

    async fn participants(&self, call_id: &CallId) -> Result<Vec<Participant>, CcError> {
        Ok(self
            .lock()?
            .calls
            .get(call_id)
            .map(|r| r.participants.clone())
            .unwrap_or_default())
    }

    async fn find_invitation(
        &self,
        invitation_id: InvitationId,
    ) -> Result<Option<CallInvitation>, CcError> {
        let inner = self.lock()?;
        Ok(inner
            .invitation_index
            .get(&invitation_id)
            .and_then(|call_id| inner.calls.get(call_id))
            .and_then(|r| {
                r.invitations
                    .iter()
                    .find(|i| i.invitation_id == invitation_id)
                    .cloned()
            }))
    }

    async fn invitations(&self, call_id: &CallId) -> Result<Vec<CallInvitation>, CcError> {
        Ok(self
            .lock()?
            .calls
            .get(call_id)
            .map(|r| r.invitations.clone())
            .unwrap_or_default())
    }

    async fn find_recording(
        &self,
        recording_id: RecordingId,
    ) -> Result<Option<CallRecording>, CcError> {
        let inner = self.lock()?;
        Ok(inner
            .recording_index
            .get(&recording_id)
            .and_then(|call_id| inner.calls.get(call_id))
            .and_then(|r| {
                r.recordings
                    .iter()
                    .find(|rec| rec.recording_id == recording_id)
                    .cloned()
            }))
    }

    async fn record_event(&self, event: NewCallEvent) -> Result<(), CcError> {
        self.check_write()?;
        let mut inner = self.lock()?;
        let call_id = event.call_id.clone();
        if !inner.calls.contains_key(&call_id) {
            return Err(CcError::NotFound(format!("call {call_id}")));
        }
        let stored = inner.append_event(&call_id, event);
        if let Some(record) = inner.calls.get_mut(&call_id) {
            record.events.push(stored);
        }
        Ok(())
    }

    async fn events(&self, call_id: &CallId) -> Result<Vec<CallEvent>, CcError> {
        Ok(self
            .lock()?
            .calls
            .get(call_id)
            .map(|r| r.events.clone())
            .unwrap_or_default())
    }

    async fn stale_calls(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CallId>, CcError> {
        let inner = self.lock()?;
        let mut stale: Vec<&Call> = inner
            .calls
            .values()
            .map(|r| &r.call)
            .filter(|c| c.status.is_pre_connect() && c.created_at <= created_before)
            .collect();
        stale.sort_by_key(|c| c.created_at);
        Ok(stale
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|c| c.call_id.clone())
            .collect())
    }

    async fn overdue_invitations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CallInvitation>, CcError> {
        let inner = self.lock()?;
        let mut overdue: Vec<&CallInvitation> = inner
            .calls
            .values()
            .flat_map(|r| r.invitations.iter())
            .filter(|i| i.response.is_none() && i.expires_at < now)
            .collect();
        overdue.sort_by_key(|i| i.expires_at);
        Ok(overdue
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn call_history(
        &self,
        user_id: UserId,
        limit: i64,
        kind: Option<CallKind>,
    ) -> Result<Vec<Call>, CcError> {
        let inner = self.lock()?;
        let mut calls: Vec<&Call> = inner
            .calls
            .values()
            .filter(|r| r.participants.iter().any(|p| p.user_id == user_id))
            .map(|r| &r.call)
            .filter(|c| kind.map_or(true, |k| c.kind == k))
            .collect();
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(calls
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn active_calls_for_user(&self, user_id: UserId) -> Result<Vec<Call>, CcError> {
        let inner = self.lock()?;
        Ok(inner
            .calls
            .values()
            .filter(|r| !r.call.status.is_terminal())
            .filter(|r| {
                r.participants
                    .iter()
                    .any(|p| p.user_id == user_id && p.status.is_active())
            })
            .map(|r| r.call.clone())
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{event_kinds, CallRequest, CallSettings, CallStatus};
    use chrono::Duration;
    use common::types::PeerId;

    fn new_call(now: DateTime<Utc>) -> (Call, Participant) {
        let call = Call::new(
            UserId(1),
            &CallRequest::new(CallKind::Video, vec![UserId(2)]),
            CallSettings::default(),
            Vec::new(),
            now,
        );
        let initiator = Participant::initiator(
            call.call_id.clone(),
            UserId(1),
            call.kind,
            PeerId::from("peer_1"),
            now,
        );
        (call, initiator)
    }

    async fn seeded(registry: &InMemoryCallRegistry, now: DateTime<Utc>) -> (Call, Participant) {
        let (call, initiator) = new_call(now);
        registry
            .create_call(CallChangeset {
                call: Some(call.clone()),
                participants: vec![initiator.clone()],
                events: vec![NewCallEvent::new(
                    &call.call_id,
                    Some(UserId(1)),
                    event_kinds::CALL_INITIATED,
                    serde_json::json!({}),
                    now,
                )],
                ..CallChangeset::default()
            })
            .await
            .unwrap();
        (call, initiator)
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let registry = InMemoryCallRegistry::new();
        let (call, _) = seeded(&registry, Utc::now()).await;

        let found = registry.find_call(&call.call_id).await.unwrap().unwrap();
        assert_eq!(found.status, CallStatus::Initiated);
        assert_eq!(registry.participants(&call.call_id).await.unwrap().len(), 1);
        assert_eq!(registry.events(&call.call_id).await.unwrap().len(), 1);
        assert!(registry
            .find_call(&CallId::from("call_missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_live_row_rejects_whole_changeset() {
        let registry = InMemoryCallRegistry::new();
        let now = Utc::now();
        let (mut call, _) = seeded(&registry, now).await;

        call.advance(CallStatus::Connecting, now).unwrap();
        let duplicate = Participant::initiator(
            call.call_id.clone(),
            UserId(1),
            call.kind,
            PeerId::from("peer_1"),
            now,
        );
        let err = registry
            .commit(CallChangeset {
                call: Some(call.clone()),
                participants: vec![duplicate],
                events: vec![NewCallEvent::new(
                    &call.call_id,
                    None,
                    event_kinds::USER_JOINING,
                    serde_json::json!({}),
                    now,
                )],
                ..CallChangeset::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "internal");

        let stored = registry.find_call(&call.call_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Initiated);
        assert_eq!(registry.events(&call.call_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_departed_row_allows_new_live_row() {
        let registry = InMemoryCallRegistry::new();
        let now = Utc::now();
        let (call, mut initiator) = seeded(&registry, now).await;

        initiator
            .depart(crate::models::ParticipantStatus::Left, now)
            .unwrap();
        let rejoin = Participant::initiator(
            call.call_id.clone(),
            UserId(1),
            call.kind,
            PeerId::from("peer_1"),
            now,
        );
        registry
            .commit(CallChangeset {
                participants: vec![initiator, rejoin],
                ..CallChangeset::default()
            })
            .await
            .unwrap();
        assert_eq!(registry.participants(&call.call_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_writes_nothing() {
        let registry = InMemoryCallRegistry::new();
        registry.fail_writes(true);
        let (call, initiator) = new_call(Utc::now());
        let err = registry
            .create_call(CallChangeset {
                call: Some(call.clone()),
                participants: vec![initiator],
                ..CallChangeset::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CcError::Database(_)));
        assert!(registry.find_call(&call.call_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_unknown_call_is_not_found() {
        let registry = InMemoryCallRegistry::new();
        let (call, _) = new_call(Utc::now());
        let err = registry
            .commit(CallChangeset {
                call: Some(call),
                ..CallChangeset::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_stale_and_overdue_queries() {
        let registry = InMemoryCallRegistry::new();
        let old = Utc::now() - Duration::hours(3);
        let (call, _) = seeded(&registry, old).await;
        let invitation = CallInvitation::new(
            call.call_id.clone(),
            UserId(2),
            UserId(1),
            None,
            old,
            Duration::minutes(5),
        );
        registry
            .commit(CallChangeset {
                invitations: vec![invitation.clone()],
                ..CallChangeset::default()
            })
            .await
            .unwrap();

        let now = Utc::now();
        let stale = registry
            .stale_calls(now - Duration::hours(2), 10)
            .await
            .unwrap();
        assert_eq!(stale, vec![call.call_id.clone()]);
        assert!(registry
            .stale_calls(now - Duration::hours(4), 10)
            .await
            .unwrap()
            .is_empty());

        let overdue = registry.overdue_invitations(now, 10).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(
            registry
                .find_invitation(invitation.invitation_id)
                .await
                .unwrap()
                .unwrap()
                .invited_user,
            UserId(2)
        );
    }

    #[tokio::test]
    async fn test_history_and_active_calls() {
        let registry = InMemoryCallRegistry::new();
        let (call, _) = seeded(&registry, Utc::now()).await;

        let history = registry.call_history(UserId(1), 10, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(registry
            .call_history(UserId(1), 10, Some(CallKind::Audio))
            .await
            .unwrap()
            .is_empty());

        let active = registry.active_calls_for_user(UserId(1)).await.unwrap();
        assert_eq!(active.first().map(|c| &c.call_id), Some(&call.call_id));
        assert!(registry
            .active_calls_for_user(UserId(2))
            .await
            .unwrap()
            .is_empty());
    }
}
