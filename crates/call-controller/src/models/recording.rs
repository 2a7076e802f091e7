//! Recording metadata. The controller only tracks the artifact; capture
//! happens elsewhere.

use chrono::{DateTime, Utc};
use common::types::{CallId, RecordingId, UserId};
use serde::{Deserialize, Serialize};

/// Quality settings requested when a recording starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingQuality {
    pub audio: String,
    pub video: String,
}

impl Default for RecordingQuality {
    fn default() -> Self {
        Self {
            audio: "high".to_string(),
            video: "720p".to_string(),
        }
    }
}

/// Where the finished artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingArtifact {
    pub filename: String,
    pub file_path: String,
    pub file_size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecording {
    pub recording_id: RecordingId,
    pub call_id: CallId,
    pub started_by: UserId,
    pub quality: RecordingQuality,
    pub artifact: Option<RecordingArtifact>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
}

impl CallRecording {
    #[must_use]
    pub fn start(
        call_id: CallId,
        started_by: UserId,
        quality: RecordingQuality,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            recording_id: RecordingId::new(),
            call_id,
            started_by,
            quality,
            artifact: None,
            started_at: now,
            ended_at: None,
            duration_seconds: 0,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn stop(&mut self, artifact: RecordingArtifact, now: DateTime<Utc>) {
        self.duration_seconds = (now - self.started_at).num_seconds().max(0);
        self.artifact = Some(artifact);
        self.ended_at = Some(now);
    }
}
