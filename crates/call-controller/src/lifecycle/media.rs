//! Media flags, quality reports and recording metadata.

use super::{LifecycleEngine, MediaOutcome};
use crate::errors::CcError;
use crate::models::{
    event_kinds, CallRecording, ConnectionQuality, MediaUpdate, NewCallEvent, RecordingArtifact,
    RecordingQuality,
};
use crate::notifications::{Notification, Recipient};
use crate::repositories::CallChangeset;
use chrono::Utc;
use common::types::{CallId, RecordingId, UserId};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

impl LifecycleEngine {
    /// Apply a partial media update to the user's row. Only fields whose
    /// value changes are stored and logged; an update that changes nothing
    /// writes nothing.
    ///
    /// Broadcasting the change is the caller's concern, so a lost
    /// notification never undoes the stored flags.
    ///
    /// # Errors
    ///
    /// `InvalidState` for a terminal call, `NotFound` without a live row,
    /// `Unauthorized` when enabling screen share on a call that disallows it.
    pub async fn update_media(
        &self,
        call_id: &CallId,
        user_id: UserId,
        update: MediaUpdate,
    ) -> Result<MediaOutcome, CcError> {
        let state = self.load(call_id).await?;
        state.ensure_open()?;
        let mut row = state.require_row(user_id)?.clone();
        if update.screen_share_enabled == Some(true) && !state.call.settings.screen_share_enabled
        {
            return Err(CcError::Unauthorized(
                "screen sharing is disabled for this call".to_string(),
            ));
        }

        let changes = row.apply_media(&update);
        if changes.is_empty() {
            return Ok(MediaOutcome {
                participant: row,
                changes,
            });
        }
        if let Some(sharing) = changes.screen_share_enabled {
            row.is_presenter = sharing;
        }

        let now = Utc::now();
        let mut changeset = CallChangeset::default();
        changeset.put_participant(row.clone());
        changeset.push_event(NewCallEvent::new(
            call_id,
            Some(user_id),
            event_kinds::MEDIA_CHANGED,
            json!({ "changes": changes }),
            now,
        ));
        self.registry.commit(changeset).await?;

        debug!(
            target: "cc.lifecycle",
            call_id = %call_id,
            user_id = %user_id,
            ?changes,
            "Media updated"
        );
        Ok(MediaOutcome {
            participant: row,
            changes,
        })
    }

    /// Record a client's connection quality report.
    ///
    /// A changed label is stored on the row together with a
    /// `quality_changed` event. An unchanged label only appends the raw
    /// stats, best-effort. Moderators other than the reporter are told either
    /// way.
    ///
    /// # Errors
    ///
    /// `NotFound` without a live row; `Database` if storing a changed label
    /// fails.
    pub async fn report_quality(
        &self,
        call_id: &CallId,
        user_id: UserId,
        quality: ConnectionQuality,
        stats: Value,
    ) -> Result<(), CcError> {
        let state = self.load(call_id).await?;
        let mut row = state.require_row(user_id)?.clone();
        let now = Utc::now();

        if row.connection_quality == quality {
            let report = NewCallEvent::new(
                call_id,
                Some(user_id),
                event_kinds::QUALITY_REPORT,
                json!({ "quality": quality, "stats": stats }),
                now,
            );
            if let Err(e) = self.registry.record_event(report).await {
                warn!(
                    target: "cc.lifecycle",
                    call_id = %call_id,
                    user_id = %user_id,
                    error = %e,
                    "Failed to store quality report"
                );
            }
        } else {
            let previous = row.connection_quality;
            row.connection_quality = quality;
            let mut changeset = CallChangeset::default();
            changeset.put_participant(row);
            changeset.push_event(NewCallEvent::new(
                call_id,
                Some(user_id),
                event_kinds::QUALITY_CHANGED,
                json!({ "from": previous, "to": quality, "stats": stats }),
                now,
            ));
            self.registry.commit(changeset).await?;
            info!(
                target: "cc.lifecycle",
                call_id = %call_id,
                user_id = %user_id,
                from = %previous,
                to = %quality,
                "Connection quality changed"
            );
        }

        let moderators: Vec<UserId> = state
            .participants
            .iter()
            .filter(|p| p.is_moderator && p.status.is_active() && p.user_id != user_id)
            .map(|p| p.user_id)
            .collect();
        if !moderators.is_empty() {
            self.sink.deliver(
                Recipient::Users(moderators),
                Notification::QualityUpdate {
                    call_id: call_id.clone(),
                    user_id,
                    quality,
                    stats,
                },
            );
        }
        Ok(())
    }

    /// Start tracking a recording. Moderator only, and only on calls with
    /// recording enabled.
    ///
    /// # Errors
    ///
    /// `InvalidState` for a terminal call or when recording is disabled,
    /// `Unauthorized` for non-moderators.
    pub async fn start_recording(
        &self,
        call_id: &CallId,
        user_id: UserId,
        quality: RecordingQuality,
    ) -> Result<CallRecording, CcError> {
        let state = self.load(call_id).await?;
        state.ensure_open()?;
        if !state.call.settings.recording_enabled {
            return Err(CcError::InvalidState(
                "recording is not enabled for this call".to_string(),
            ));
        }
        state.require_moderator(user_id)?;

        let now = Utc::now();
        let recording = CallRecording::start(call_id.clone(), user_id, quality, now);
        let mut changeset = CallChangeset::default();
        changeset.push_event(NewCallEvent::new(
            call_id,
            Some(user_id),
            event_kinds::RECORDING_STARTED,
            json!({
                "recording_id": recording.recording_id,
                "quality": recording.quality,
            }),
            now,
        ));
        changeset.recordings.push(recording.clone());
        self.registry.commit(changeset).await?;

        info!(
            target: "cc.lifecycle",
            call_id = %call_id,
            recording_id = %recording.recording_id,
            "Recording started"
        );
        Ok(recording)
    }

    /// Close a running recording with the artifact produced for it. Works on
    /// ended calls too, since artifacts arrive after the fact.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown recording or one of another call,
    /// `InvalidState` if it was already stopped.
    pub async fn stop_recording(
        &self,
        call_id: &CallId,
        recording_id: RecordingId,
        artifact: RecordingArtifact,
    ) -> Result<CallRecording, CcError> {
        let mut recording = self
            .registry
            .find_recording(recording_id)
            .await?
            .filter(|r| r.call_id == *call_id)
            .ok_or_else(|| {
                CcError::NotFound(format!("recording {recording_id} not found in {call_id}"))
            })?;
        if !recording.is_running() {
            return Err(CcError::InvalidState(
                "recording already stopped".to_string(),
            ));
        }

        let now = Utc::now();
        recording.stop(artifact, now);
        let mut changeset = CallChangeset::default();
        changeset.push_event(NewCallEvent::new(
            call_id,
            None,
            event_kinds::RECORDING_STOPPED,
            json!({
                "recording_id": recording_id,
                "duration_seconds": recording.duration_seconds,
                "file_size": recording.artifact.as_ref().map(|a| a.file_size),
            }),
            now,
        ));
        changeset.recordings.push(recording.clone());
        self.registry.commit(changeset).await?;

        info!(
            target: "cc.lifecycle",
            call_id = %call_id,
            recording_id = %recording_id,
            duration_seconds = recording.duration_seconds,
            "Recording stopped"
        );
        Ok(recording)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::test_support::fixture;
    use super::*;
    use crate::models::{CallKind, CallRequest, CallSettings, EndReason, MediaField};
    use crate::repositories::CallRegistry;
    use common::types::PeerId;

    #[tokio::test]
    async fn test_update_media_logs_only_changed_keys() {
        let fx = fixture();
        let call = fx.call_to(&[2]).await;
        let outcome = fx
            .engine
            .update_media(
                &call.call_id,
                UserId(1),
                MediaUpdate {
                    audio_enabled: Some(true),
                    video_enabled: Some(false),
                    screen_share_enabled: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.changes, MediaUpdate::single(MediaField::Video, false));
        assert!(!fx.row(&call.call_id, 1).await.media.video_enabled);

        let events = fx.registry.events(&call.call_id).await.unwrap();
        let changed = events.last().unwrap();
        assert_eq!(changed.event_type, "media_changed");
        assert_eq!(changed.payload["changes"], json!({ "video_enabled": false }));
    }

    #[tokio::test]
    async fn test_noop_media_update_writes_nothing() {
        let fx = fixture();
        let call = fx.call_to(&[2]).await;
        let outcome = fx
            .engine
            .update_media(
                &call.call_id,
                UserId(1),
                MediaUpdate::single(MediaField::Audio, true),
            )
            .await
            .unwrap();
        assert!(outcome.changes.is_empty());
        assert_eq!(fx.event_types(&call.call_id).await, vec!["call_initiated"]);
    }

    #[tokio::test]
    async fn test_screen_share_follows_call_setting() {
        let fx = fixture();
        let mut request = CallRequest::new(CallKind::Video, vec![UserId(2)]);
        request.settings = Some(CallSettings {
            screen_share_enabled: false,
            ..CallSettings::default()
        });
        let call = fx.engine.initiate(UserId(1), request).await.unwrap();
        let err = fx
            .engine
            .update_media(
                &call.call_id,
                UserId(1),
                MediaUpdate::single(MediaField::ScreenShare, true),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "authorization");

        let open = fx.call_to(&[2]).await;
        let outcome = fx
            .engine
            .update_media(
                &open.call_id,
                UserId(1),
                MediaUpdate::single(MediaField::ScreenShare, true),
            )
            .await
            .unwrap();
        assert!(outcome.participant.is_presenter);
    }

    #[tokio::test]
    async fn test_update_media_on_ended_call() {
        let fx = fixture();
        let call = fx.call_to(&[2]).await;
        fx.engine
            .end(&call.call_id, None, EndReason::Normal)
            .await
            .unwrap();
        let err = fx
            .engine
            .update_media(
                &call.call_id,
                UserId(1),
                MediaUpdate::single(MediaField::Audio, false),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test]
    async fn test_quality_change_updates_row_and_tells_moderators() {
        let fx = fixture();
        let call = fx.call_to(&[2]).await;
        fx.engine
            .join(&call.call_id, UserId(2), PeerId::from("peer_2"))
            .await
            .unwrap();
        fx.sink.take();

        fx.engine
            .report_quality(
                &call.call_id,
                UserId(2),
                ConnectionQuality::Poor,
                json!({ "rtt_ms": 480 }),
            )
            .await
            .unwrap();
        assert_eq!(
            fx.row(&call.call_id, 2).await.connection_quality,
            ConnectionQuality::Poor
        );
        let delivered = fx.sink.take();
        let (recipient, notification) = delivered.first().unwrap();
        assert_eq!(*recipient, Recipient::Users(vec![UserId(1)]));
        assert_eq!(notification.name(), "quality_update");

        fx.engine
            .report_quality(
                &call.call_id,
                UserId(2),
                ConnectionQuality::Poor,
                json!({ "rtt_ms": 510 }),
            )
            .await
            .unwrap();
        let events = fx.event_types(&call.call_id).await;
        assert_eq!(
            events.iter().rev().take(2).map(String::as_str).collect::<Vec<_>>(),
            vec!["quality_report", "quality_changed"]
        );
    }

    #[tokio::test]
    async fn test_recording_lifecycle() {
        let fx = fixture();
        let mut request = CallRequest::new(CallKind::Video, vec![UserId(2)]);
        request.settings = Some(CallSettings {
            recording_enabled: true,
            ..CallSettings::default()
        });
        let call = fx.engine.initiate(UserId(1), request).await.unwrap();
        fx.engine
            .join(&call.call_id, UserId(2), PeerId::from("peer_2"))
            .await
            .unwrap();

        let err = fx
            .engine
            .start_recording(&call.call_id, UserId(2), RecordingQuality::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "authorization");

        let recording = fx
            .engine
            .start_recording(&call.call_id, UserId(1), RecordingQuality::default())
            .await
            .unwrap();
        assert!(recording.is_running());

        let artifact = RecordingArtifact {
            filename: "call.webm".to_string(),
            file_path: "/recordings/call.webm".to_string(),
            file_size: 1024,
        };
        let stopped = fx
            .engine
            .stop_recording(&call.call_id, recording.recording_id, artifact.clone())
            .await
            .unwrap();
        assert!(!stopped.is_running());
        assert_eq!(stopped.artifact, Some(artifact.clone()));

        let err = fx
            .engine
            .stop_recording(&call.call_id, recording.recording_id, artifact)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test]
    async fn test_recording_requires_setting() {
        let fx = fixture();
        let call = fx.call_to(&[2]).await;
        let err = fx
            .engine
            .start_recording(&call.call_id, UserId(1), RecordingQuality::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }
}
