//! The `Call` record and its creation request.

use super::status::{CallKind, CallStatus, EndReason};
use crate::errors::CcError;
use chrono::{DateTime, Utc};
use common::types::{CallId, PeerId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default participant limit for a call.
pub const DEFAULT_MAX_PARTICIPANTS: i32 = 50;

/// Longest accepted call title.
pub const MAX_TITLE_LEN: usize = 200;

/// An ICE server handed to joiners verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    #[must_use]
    pub fn stun(urls: impl Into<String>) -> Self {
        Self {
            urls: urls.into(),
            username: None,
            credential: None,
        }
    }
}

/// Per-call feature flags and capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    pub max_participants: i32,
    pub recording_enabled: bool,
    pub screen_share_enabled: bool,
    pub require_moderator_approval: bool,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            recording_enabled: false,
            screen_share_enabled: true,
            require_moderator_approval: false,
        }
    }
}

/// Input to `initiate`.
#[derive(Debug, Clone, Deserialize)]
pub struct CallRequest {
    pub kind: CallKind,
    #[serde(default)]
    pub targets: Vec<UserId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub event_id: Option<i64>,
    #[serde(default)]
    pub chat_room_id: Option<i64>,
    #[serde(default)]
    pub settings: Option<CallSettings>,
    #[serde(default)]
    pub invitation_message: Option<String>,
    /// Transport peer of the initiating client; generated when absent.
    #[serde(default)]
    pub peer_id: Option<PeerId>,
}

impl CallRequest {
    #[must_use]
    pub fn new(kind: CallKind, targets: Vec<UserId>) -> Self {
        Self {
            kind,
            targets,
            title: None,
            description: None,
            event_id: None,
            chat_room_id: None,
            settings: None,
            invitation_message: None,
            peer_id: None,
        }
    }

    /// Reject malformed requests before anything is written.
    pub fn validate(&self, initiator: UserId, settings: &CallSettings) -> Result<(), CcError> {
        if settings.max_participants < 2 {
            return Err(CcError::Validation(
                "max_participants must be at least 2".to_string(),
            ));
        }
        if self.title.as_deref().map_or(0, str::len) > MAX_TITLE_LEN {
            return Err(CcError::Validation(format!(
                "title must be at most {MAX_TITLE_LEN} characters"
            )));
        }

        let mut seen = HashSet::with_capacity(self.targets.len());
        for target in &self.targets {
            if *target == initiator {
                return Err(CcError::Validation(
                    "initiator cannot be a call target".to_string(),
                ));
            }
            if !seen.insert(*target) {
                return Err(CcError::Validation(format!("duplicate target {target}")));
            }
        }

        let invited = i64::try_from(self.targets.len()).unwrap_or(i64::MAX);
        if invited.saturating_add(1) > i64::from(settings.max_participants) {
            return Err(CcError::Validation(
                "more targets than the call can hold".to_string(),
            ));
        }
        Ok(())
    }
}

/// A call. Created on initiation, moved only through [`Call::advance`] and
/// [`Call::finish`], never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub call_id: CallId,
    pub kind: CallKind,
    pub status: CallStatus,
    pub initiated_by: UserId,
    pub title: Option<String>,
    pub description: Option<String>,
    pub event_id: Option<i64>,
    pub chat_room_id: Option<i64>,
    pub is_group_call: bool,
    pub settings: CallSettings,
    pub ice_servers: Vec<IceServer>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub end_reason: Option<EndReason>,
    pub max_concurrent_participants: i32,
}

impl Call {
    /// Build a fresh `initiated` call with a newly allocated id.
    #[must_use]
    pub fn new(
        initiator: UserId,
        request: &CallRequest,
        settings: CallSettings,
        ice_servers: Vec<IceServer>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: CallId::generate(),
            kind: request.kind,
            status: CallStatus::Initiated,
            initiated_by: initiator,
            title: request.title.clone(),
            description: request.description.clone(),
            event_id: request.event_id,
            chat_room_id: request.chat_room_id,
            is_group_call: request.targets.len() > 1,
            settings,
            ice_servers,
            created_at: now,
            started_at: None,
            ended_at: None,
            duration_seconds: 0,
            end_reason: None,
            max_concurrent_participants: 1,
        }
    }

    /// Move to a non-terminal status. Entering `connecting` for the first
    /// time stamps `started_at`.
    pub fn advance(&mut self, next: CallStatus, now: DateTime<Utc>) -> Result<(), CcError> {
        if next.is_terminal() {
            return Err(CcError::Internal(format!(
                "terminal status {next} must go through finish"
            )));
        }
        self.status.transition(next)?;
        if next == CallStatus::Connecting && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        Ok(())
    }

    /// Move to a terminal status and settle `ended_at`, `end_reason` and
    /// `duration_seconds`.
    pub fn finish(
        &mut self,
        outcome: CallStatus,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<(), CcError> {
        if !outcome.is_terminal() {
            return Err(CcError::Internal(format!(
                "{outcome} is not a terminal status"
            )));
        }
        self.status.transition(outcome)?;
        self.ended_at = Some(now);
        self.end_reason = Some(reason);
        self.duration_seconds = self.computed_duration();
        Ok(())
    }

    /// `ended_at - started_at` in whole seconds, or 0 if either is unset.
    #[must_use]
    pub fn computed_duration(&self) -> i64 {
        match (self.started_at, self.ended_at) {
            (Some(started), Some(ended)) => (ended - started).num_seconds().max(0),
            _ => 0,
        }
    }

    pub fn note_concurrency(&mut self, active: usize) {
        let active = i32::try_from(active).unwrap_or(i32::MAX);
        if active > self.max_concurrent_participants {
            self.max_concurrent_participants = active;
        }
    }
}
