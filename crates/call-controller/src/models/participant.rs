//! Participant rows and media state.

use super::status::{CallKind, ConnectionQuality, ParticipantStatus};
use crate::errors::CcError;
use chrono::{DateTime, Utc};
use common::types::{CallId, ParticipantId, PeerId, UserId};
use serde::{Deserialize, Serialize};

/// Per-medium enablement of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_share_enabled: bool,
}

impl MediaState {
    /// Starting media for a member of a call of this kind.
    #[must_use]
    pub fn for_kind(kind: CallKind) -> Self {
        Self {
            audio_enabled: true,
            video_enabled: kind != CallKind::Audio,
            screen_share_enabled: false,
        }
    }
}

/// A single medium, as named by the gateway's toggle frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaField {
    Audio,
    Video,
    ScreenShare,
}

/// Partial media update. Absent fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_share_enabled: Option<bool>,
}

impl MediaUpdate {
    #[must_use]
    pub fn single(field: MediaField, enabled: bool) -> Self {
        let mut update = Self::default();
        match field {
            MediaField::Audio => update.audio_enabled = Some(enabled),
            MediaField::Video => update.video_enabled = Some(enabled),
            MediaField::ScreenShare => update.screen_share_enabled = Some(enabled),
        }
        update
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.audio_enabled.is_none()
            && self.video_enabled.is_none()
            && self.screen_share_enabled.is_none()
    }
}

/// A user's membership record within one call.
///
/// Rows are never removed. A user holds at most one non-terminal row per
/// call; once a row is `left` or `kicked`, coming back creates a new row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub call_id: CallId,
    pub user_id: UserId,
    pub status: ParticipantStatus,
    pub is_moderator: bool,
    pub is_presenter: bool,
    pub media: MediaState,
    pub connection_quality: ConnectionQuality,
    pub peer_id: Option<PeerId>,
    pub invited_at: DateTime<Utc>,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    /// The initiator's row: moderator, already `connecting` on `peer_id`.
    #[must_use]
    pub fn initiator(
        call_id: CallId,
        user_id: UserId,
        kind: CallKind,
        peer_id: PeerId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: ParticipantStatus::Connecting,
            is_moderator: true,
            peer_id: Some(peer_id),
            joined_at: Some(now),
            ..Self::invited(call_id, user_id, kind, now)
        }
    }

    /// A row for an invited (or walk-in) user who has not joined yet.
    #[must_use]
    pub fn invited(call_id: CallId, user_id: UserId, kind: CallKind, now: DateTime<Utc>) -> Self {
        Self {
            participant_id: ParticipantId::new(),
            call_id,
            user_id,
            status: ParticipantStatus::Invited,
            is_moderator: false,
            is_presenter: false,
            media: MediaState::for_kind(kind),
            connection_quality: ConnectionQuality::Good,
            peer_id: None,
            invited_at: now,
            joined_at: None,
            left_at: None,
        }
    }

    /// Enter the call as `connecting`. A row that is already active only
    /// refreshes its peer id; `joined_at` keeps the original join time.
    pub fn begin_join(&mut self, peer_id: PeerId, now: DateTime<Utc>) -> Result<(), CcError> {
        if !self.status.is_active() {
            self.status.transition(ParticipantStatus::Connecting)?;
            self.joined_at = Some(now);
            self.left_at = None;
        }
        self.peer_id = Some(peer_id);
        Ok(())
    }

    /// Client reports its peer connection is up.
    pub fn mark_connected(&mut self) -> Result<bool, CcError> {
        if self.status == ParticipantStatus::Connected {
            return Ok(false);
        }
        self.status.transition(ParticipantStatus::Connected)?;
        Ok(true)
    }

    /// Leave for good (`left` or `kicked`), stamping `left_at`.
    pub fn depart(&mut self, status: ParticipantStatus, now: DateTime<Utc>) -> Result<(), CcError> {
        if !status.is_terminal() {
            return Err(CcError::Internal(format!(
                "{status} is not a departure status"
            )));
        }
        self.status.transition(status)?;
        self.left_at = Some(now);
        Ok(())
    }

    /// Seconds spent in the call, up to `left_at` or `now`.
    #[must_use]
    pub fn duration_in_call(&self, now: DateTime<Utc>) -> i64 {
        match self.joined_at {
            Some(joined) => (self.left_at.unwrap_or(now) - joined).num_seconds().max(0),
            None => 0,
        }
    }

    /// Apply a partial update and return only the fields whose value changed.
    pub fn apply_media(&mut self, update: &MediaUpdate) -> MediaUpdate {
        fn apply(slot: &mut bool, wanted: Option<bool>) -> Option<bool> {
            match wanted {
                Some(value) if *slot != value => {
                    *slot = value;
                    Some(value)
                }
                _ => None,
            }
        }

        MediaUpdate {
            audio_enabled: apply(&mut self.media.audio_enabled, update.audio_enabled),
            video_enabled: apply(&mut self.media.video_enabled, update.video_enabled),
            screen_share_enabled: apply(
                &mut self.media.screen_share_enabled,
                update.screen_share_enabled,
            ),
        }
    }
}
