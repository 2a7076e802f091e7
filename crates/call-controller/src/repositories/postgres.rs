//! PostgreSQL registry backend.
//!
//! All queries are parameterized. A changeset runs in one transaction; the
//! partial unique index on `call_participants (call_id, user_id)` enforces the
//! one-live-row-per-user rule at the database level.

use super::{CallChangeset, CallRegistry};
use crate::errors::CcError;
use crate::models::{
    Call, CallEvent, CallInvitation, CallKind, CallRecording, CallSettings, IceServer,
    MediaState, NewCallEvent, Participant, RecordingArtifact, RecordingQuality,
};
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CallId, InvitationId, ParticipantId, PeerId, RecordingId, UserId};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use std::future::Future;
use std::time::Instant;
use tracing::instrument;

const CALL_COLUMNS: &str = r#"
    call_id, kind, status, initiated_by, title, description, event_id,
    chat_room_id, is_group_call, max_participants, recording_enabled,
    screen_share_enabled, require_moderator_approval, ice_servers, created_at,
    started_at, ended_at, duration_seconds, end_reason, max_concurrent_participants
"#;

const PARTICIPANT_COLUMNS: &str = r#"
    participant_id, call_id, user_id, status, is_moderator, is_presenter,
    audio_enabled, video_enabled, screen_share_enabled, connection_quality,
    peer_id, invited_at, joined_at, left_at
"#;

const INVITATION_COLUMNS: &str = r#"
    invitation_id, call_id, invited_user, invited_by, message, invited_at,
    expires_at, responded_at, response
"#;

const RECORDING_COLUMNS: &str = r#"
    recording_id, call_id, started_by, audio_quality, video_quality, filename,
    file_path, file_size, started_at, ended_at, duration_seconds
"#;

/// Registry backed by a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgCallRegistry {
    pool: PgPool,
}

impl PgCallRegistry {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Round-trip to the database; used for readiness.
    pub async fn ping(&self) -> Result<(), CcError> {
        timed("ping", sqlx::query("SELECT 1").execute(&self.pool)).await?;
        Ok(())
    }

    async fn write(&self, operation: &'static str, changeset: CallChangeset, insert: bool) -> Result<(), CcError> {
        let start = Instant::now();
        let result = async {
            let mut tx = self.pool.begin().await?;
            write_changeset(&mut *tx, changeset, insert).await?;
            tx.commit().await
        }
        .await;

        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_db_query(operation, status, start.elapsed());

        result.map_err(|e| match e {
            sqlx::Error::RowNotFound => CcError::NotFound("call".to_string()),
            other => CcError::Database(other.to_string()),
        })
    }
}

/// Run a query future, recording its duration and outcome.
async fn timed<T, F>(operation: &'static str, query: F) -> Result<T, CcError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    let start = Instant::now();
    let result = query.await;
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_db_query(operation, status, start.elapsed());
    result.map_err(|e| CcError::Database(e.to_string()))
}

async fn write_changeset(
    conn: &mut PgConnection,
    changeset: CallChangeset,
    insert: bool,
) -> Result<(), sqlx::Error> {
    if let Some(call) = &changeset.call {
        if insert {
            insert_call(conn, call).await?;
        } else {
            update_call(conn, call).await?;
        }
    }
    for participant in &changeset.participants {
        upsert_participant(conn, participant).await?;
    }
    for invitation in &changeset.invitations {
        upsert_invitation(conn, invitation).await?;
    }
    for recording in &changeset.recordings {
        upsert_recording(conn, recording).await?;
    }
    for event in &changeset.events {
        insert_event(conn, event).await?;
    }
    Ok(())
}

async fn insert_call(conn: &mut PgConnection, call: &Call) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO calls (
            call_id, kind, status, initiated_by, title, description, event_id,
            chat_room_id, is_group_call, max_participants, recording_enabled,
            screen_share_enabled, require_moderator_approval, ice_servers,
            created_at, started_at, ended_at, duration_seconds, end_reason,
            max_concurrent_participants
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20)
        "#,
    )
    .bind(call.call_id.as_str()) // $1
    .bind(call.kind.as_str()) // $2
    .bind(call.status.as_str()) // $3
    .bind(call.initiated_by.0) // $4
    .bind(call.title.as_deref()) // $5
    .bind(call.description.as_deref()) // $6
    .bind(call.event_id) // $7
    .bind(call.chat_room_id) // $8
    .bind(call.is_group_call) // $9
    .bind(call.settings.max_participants) // $10
    .bind(call.settings.recording_enabled) // $11
    .bind(call.settings.screen_share_enabled) // $12
    .bind(call.settings.require_moderator_approval) // $13
    .bind(Json(&call.ice_servers)) // $14
    .bind(call.created_at) // $15
    .bind(call.started_at) // $16
    .bind(call.ended_at) // $17
    .bind(call.duration_seconds) // $18
    .bind(call.end_reason.map(|r| r.as_str())) // $19
    .bind(call.max_concurrent_participants) // $20
    .execute(conn)
    .await?;
    Ok(())
}

async fn update_call(conn: &mut PgConnection, call: &Call) -> Result<(), sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE calls
        SET status = $2,
            started_at = $3,
            ended_at = $4,
            duration_seconds = $5,
            end_reason = $6,
            max_concurrent_participants = $7,
            recording_enabled = $8
        WHERE call_id = $1
        "#,
    )
    .bind(call.call_id.as_str())
    .bind(call.status.as_str())
    .bind(call.started_at)
    .bind(call.ended_at)
    .bind(call.duration_seconds)
    .bind(call.end_reason.map(|r| r.as_str()))
    .bind(call.max_concurrent_participants)
    .bind(call.settings.recording_enabled)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

async fn upsert_participant(conn: &mut PgConnection, p: &Participant) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO call_participants (
            participant_id, call_id, user_id, status, is_moderator, is_presenter,
            audio_enabled, video_enabled, screen_share_enabled, connection_quality,
            peer_id, invited_at, joined_at, left_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (participant_id) DO UPDATE SET
            status = EXCLUDED.status,
            is_moderator = EXCLUDED.is_moderator,
            is_presenter = EXCLUDED.is_presenter,
            audio_enabled = EXCLUDED.audio_enabled,
            video_enabled = EXCLUDED.video_enabled,
            screen_share_enabled = EXCLUDED.screen_share_enabled,
            connection_quality = EXCLUDED.connection_quality,
            peer_id = EXCLUDED.peer_id,
            joined_at = EXCLUDED.joined_at,
            left_at = EXCLUDED.left_at
        "#,
    )
    .bind(p.participant_id.0)
    .bind(p.call_id.as_str())
    .bind(p.user_id.0)
    .bind(p.status.as_str())
    .bind(p.is_moderator)
    .bind(p.is_presenter)
    .bind(p.media.audio_enabled)
    .bind(p.media.video_enabled)
    .bind(p.media.screen_share_enabled)
    .bind(p.connection_quality.as_str())
    .bind(p.peer_id.as_ref().map(PeerId::as_str))
    .bind(p.invited_at)
    .bind(p.joined_at)
    .bind(p.left_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_invitation(
    conn: &mut PgConnection,
    inv: &CallInvitation,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO call_invitations (
            invitation_id, call_id, invited_user, invited_by, message,
            invited_at, expires_at, responded_at, response
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (invitation_id) DO UPDATE SET
            responded_at = EXCLUDED.responded_at,
            response = EXCLUDED.response
        "#,
    )
    .bind(inv.invitation_id.0)
    .bind(inv.call_id.as_str())
    .bind(inv.invited_user.0)
    .bind(inv.invited_by.0)
    .bind(inv.message.as_deref())
    .bind(inv.invited_at)
    .bind(inv.expires_at)
    .bind(inv.responded_at)
    .bind(inv.response.map(|r| r.as_str()))
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_recording(
    conn: &mut PgConnection,
    rec: &CallRecording,
) -> Result<(), sqlx::Error> {
    let artifact = rec.artifact.as_ref();
    sqlx::query(
        r#"
        INSERT INTO call_recordings (
            recording_id, call_id, started_by, audio_quality, video_quality,
            filename, file_path, file_size, started_at, ended_at, duration_seconds
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (recording_id) DO UPDATE SET
            filename = EXCLUDED.filename,
            file_path = EXCLUDED.file_path,
            file_size = EXCLUDED.file_size,
            ended_at = EXCLUDED.ended_at,
            duration_seconds = EXCLUDED.duration_seconds
        "#,
    )
    .bind(rec.recording_id.0)
    .bind(rec.call_id.as_str())
    .bind(rec.started_by.0)
    .bind(rec.quality.audio.as_str())
    .bind(rec.quality.video.as_str())
    .bind(artifact.map(|a| a.filename.as_str()))
    .bind(artifact.map(|a| a.file_path.as_str()))
    .bind(artifact.map(|a| a.file_size))
    .bind(rec.started_at)
    .bind(rec.ended_at)
    .bind(rec.duration_seconds)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_event(conn: &mut PgConnection, event: &NewCallEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO call_events (call_id, user_id, event_type, payload, occurred_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(event.call_id.as_str())
    .bind(event.user_id.map(|u| u.0))
    .bind(event.event_type)
    .bind(&event.payload)
    .bind(event.occurred_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn map_row_to_call(row: &PgRow) -> Result<Call, CcError> {
    let Json(ice_servers): Json<Vec<IceServer>> = row.try_get("ice_servers")?;
    let end_reason: Option<String> = row.try_get("end_reason")?;
    Ok(Call {
        call_id: CallId::from(row.try_get::<String, _>("call_id")?),
        kind: row.try_get::<String, _>("kind")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        initiated_by: UserId(row.try_get("initiated_by")?),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        event_id: row.try_get("event_id")?,
        chat_room_id: row.try_get("chat_room_id")?,
        is_group_call: row.try_get("is_group_call")?,
        settings: CallSettings {
            max_participants: row.try_get("max_participants")?,
            recording_enabled: row.try_get("recording_enabled")?,
            screen_share_enabled: row.try_get("screen_share_enabled")?,
            require_moderator_approval: row.try_get("require_moderator_approval")?,
        },
        ice_servers,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        end_reason: end_reason.map(|r| r.parse()).transpose()?,
        max_concurrent_participants: row.try_get("max_concurrent_participants")?,
    })
}

fn map_row_to_participant(row: &PgRow) -> Result<Participant, CcError> {
    let peer_id: Option<String> = row.try_get("peer_id")?;
    Ok(Participant {
        participant_id: ParticipantId(row.try_get("participant_id")?),
        call_id: CallId::from(row.try_get::<String, _>("call_id")?),
        user_id: UserId(row.try_get("user_id")?),
        status: row.try_get::<String, _>("status")?.parse()?,
        is_moderator: row.try_get("is_moderator")?,
        is_presenter: row.try_get("is_presenter")?,
        media: MediaState {
            audio_enabled: row.try_get("audio_enabled")?,
            video_enabled: row.try_get("video_enabled")?,
            screen_share_enabled: row.try_get("screen_share_enabled")?,
        },
        connection_quality: row.try_get::<String, _>("connection_quality")?.parse()?,
        peer_id: peer_id.map(PeerId::from),
        invited_at: row.try_get("invited_at")?,
        joined_at: row.try_get("joined_at")?,
        left_at: row.try_get("left_at")?,
    })
}

fn map_row_to_invitation(row: &PgRow) -> Result<CallInvitation, CcError> {
    let response: Option<String> = row.try_get("response")?;
    Ok(CallInvitation {
        invitation_id: InvitationId(row.try_get("invitation_id")?),
        call_id: CallId::from(row.try_get::<String, _>("call_id")?),
        invited_user: UserId(row.try_get("invited_user")?),
        invited_by: UserId(row.try_get("invited_by")?),
        message: row.try_get("message")?,
        invited_at: row.try_get("invited_at")?,
        expires_at: row.try_get("expires_at")?,
        responded_at: row.try_get("responded_at")?,
        response: response.map(|r| r.parse()).transpose()?,
    })
}

fn map_row_to_recording(row: &PgRow) -> Result<CallRecording, CcError> {
    let filename: Option<String> = row.try_get("filename")?;
    let file_path: Option<String> = row.try_get("file_path")?;
    let file_size: Option<i64> = row.try_get("file_size")?;
    let artifact = match (filename, file_path) {
        (Some(filename), Some(file_path)) => Some(RecordingArtifact {
            filename,
            file_path,
            file_size: file_size.unwrap_or(0),
        }),
        _ => None,
    };
    Ok(CallRecording {
        recording_id: RecordingId(row.try_get("recording_id")?),
        call_id: CallId::from(row.try_get::<String, _>("call_id")?),
        started_by: UserId(row.try_get("started_by")?),
        quality: RecordingQuality {
            audio: row.try_get("audio_quality")?,
            video: row.try_get("video_quality")?,
        },
        artifact,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
    })
}

fn map_row_to_event(row: &PgRow) -> Result<CallEvent, CcError> {
    let user_id: Option<i64> = row.try_get("user_id")?;
    Ok(CallEvent {
        event_id: row.try_get("event_id")?,
        call_id: CallId::from(row.try_get::<String, _>("call_id")?),
        user_id: user_id.map(UserId),
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

fn map_rows<T>(rows: &[PgRow], f: fn(&PgRow) -> Result<T, CcError>) -> Result<Vec<T>, CcError> {
    rows.iter().map(f).collect()
}

#[async_trait]
impl CallRegistry for PgCallRegistry {
    #[instrument(skip_all, name = "cc.repo.create_call")]
    async fn create_call(&self, changeset: CallChangeset) -> Result<(), CcError> {
        self.write("create_call", changeset, true).await
    }

    #[instrument(skip_all, name = "cc.repo.commit")]
    async fn commit(&self, changeset: CallChangeset) -> Result<(), CcError> {
        self.write("commit", changeset, false).await
    }

    #[instrument(skip_all, name = "cc.repo.find_call", fields(call_id = %call_id))]
    async fn find_call(&self, call_id: &CallId) -> Result<Option<Call>, CcError> {
        let sql = format!("SELECT {CALL_COLUMNS} FROM calls WHERE call_id = $1");
        let row = timed(
            "find_call",
            sqlx::query(&sql)
                .bind(call_id.as_str())
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(map_row_to_call).transpose()
    }

    async fn participants(&self, call_id: &CallId) -> Result<Vec<Participant>, CcError> {
        let sql = format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM call_participants \
             WHERE call_id = $1 ORDER BY invited_at, participant_id"
        );
        let rows = timed(
            "participants",
            sqlx::query(&sql).bind(call_id.as_str()).fetch_all(&self.pool),
        )
        .await?;
        map_rows(&rows, map_row_to_participant)
    }

    async fn find_invitation(
        &self,
        invitation_id: InvitationId,
    ) -> Result<Option<CallInvitation>, CcError> {
        let sql = format!("SELECT {INVITATION_COLUMNS} FROM call_invitations WHERE invitation_id = $1");
        let row = timed(
            "find_invitation",
            sqlx::query(&sql)
                .bind(invitation_id.0)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(map_row_to_invitation).transpose()
    }

    async fn invitations(&self, call_id: &CallId) -> Result<Vec<CallInvitation>, CcError> {
        let sql = format!(
            "SELECT {INVITATION_COLUMNS} FROM call_invitations \
             WHERE call_id = $1 ORDER BY invited_at"
        );
        let rows = timed(
            "invitations",
            sqlx::query(&sql).bind(call_id.as_str()).fetch_all(&self.pool),
        )
        .await?;
        map_rows(&rows, map_row_to_invitation)
    }

    async fn find_recording(
        &self,
        recording_id: RecordingId,
    ) -> Result<Option<CallRecording>, CcError> {
        let sql = format!("SELECT {RECORDING_COLUMNS} FROM call_recordings WHERE recording_id = $1");
        let row = timed(
            "find_recording",
            sqlx::query(&sql)
                .bind(recording_id.0)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(map_row_to_recording).transpose()
    }

    #[instrument(skip_all, name = "cc.repo.record_event", fields(call_id = %event.call_id))]
    async fn record_event(&self, event: NewCallEvent) -> Result<(), CcError> {
        let start = Instant::now();
        let result = match self.pool.acquire().await {
            Ok(mut conn) => insert_event(&mut conn, &event).await,
            Err(e) => Err(e),
        };
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_db_query("record_event", status, start.elapsed());
        result.map_err(|e| CcError::Database(e.to_string()))
    }

    async fn events(&self, call_id: &CallId) -> Result<Vec<CallEvent>, CcError> {
        let rows = timed(
            "events",
            sqlx::query(
                r#"
                SELECT event_id, call_id, user_id, event_type, payload, occurred_at
                FROM call_events
                WHERE call_id = $1
                ORDER BY event_id
                "#,
            )
            .bind(call_id.as_str())
            .fetch_all(&self.pool),
        )
        .await?;
        map_rows(&rows, map_row_to_event)
    }

    #[instrument(skip_all, name = "cc.repo.stale_calls")]
    async fn stale_calls(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CallId>, CcError> {
        let rows = timed(
            "stale_calls",
            sqlx::query(
                r#"
                SELECT call_id
                FROM calls
                WHERE status IN ('initiated', 'ringing')
                  AND created_at <= $1
                ORDER BY created_at
                LIMIT $2
                "#,
            )
            .bind(created_before)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;
        rows.iter()
            .map(|row| Ok(CallId::from(row.try_get::<String, _>("call_id")?)))
            .collect()
    }

    #[instrument(skip_all, name = "cc.repo.overdue_invitations")]
    async fn overdue_invitations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CallInvitation>, CcError> {
        let sql = format!(
            "SELECT {INVITATION_COLUMNS} FROM call_invitations \
             WHERE response IS NULL AND expires_at < $1 \
             ORDER BY expires_at LIMIT $2"
        );
        let rows = timed(
            "overdue_invitations",
            sqlx::query(&sql).bind(now).bind(limit).fetch_all(&self.pool),
        )
        .await?;
        map_rows(&rows, map_row_to_invitation)
    }

    async fn call_history(
        &self,
        user_id: UserId,
        limit: i64,
        kind: Option<CallKind>,
    ) -> Result<Vec<Call>, CcError> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM calls c \
             WHERE EXISTS (SELECT 1 FROM call_participants p \
                           WHERE p.call_id = c.call_id AND p.user_id = $1) \
               AND ($2::TEXT IS NULL OR c.kind = $2) \
             ORDER BY c.created_at DESC LIMIT $3"
        );
        let rows = timed(
            "call_history",
            sqlx::query(&sql)
                .bind(user_id.0)
                .bind(kind.map(|k| k.as_str()))
                .bind(limit)
                .fetch_all(&self.pool),
        )
        .await?;
        map_rows(&rows, map_row_to_call)
    }

    async fn active_calls_for_user(&self, user_id: UserId) -> Result<Vec<Call>, CcError> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM calls c \
             WHERE c.status IN ('initiated', 'ringing', 'connecting', 'connected', 'on_hold') \
               AND EXISTS (SELECT 1 FROM call_participants p \
                           WHERE p.call_id = c.call_id AND p.user_id = $1 \
                             AND p.status IN ('connecting', 'connected')) \
             ORDER BY c.created_at DESC"
        );
        let rows = timed(
            "active_calls_for_user",
            sqlx::query(&sql).bind(user_id.0).fetch_all(&self.pool),
        )
        .await?;
        map_rows(&rows, map_row_to_call)
    }
}
