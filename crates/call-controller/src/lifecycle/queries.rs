//! Read-only views over the registry. These need no per-call ordering and
//! are served without going through a call actor.

use super::{CallAnalytics, CallDetails, LifecycleEngine, ParticipantSummary};
use crate::errors::CcError;
use crate::models::{Call, CallKind};
use chrono::Utc;
use common::types::{CallId, UserId};
use std::collections::HashSet;

/// Upper bound on a history page.
pub const MAX_HISTORY_LIMIT: i64 = 200;

impl LifecycleEngine {
    /// # Errors
    ///
    /// `NotFound` for an unknown call.
    pub async fn call_details(&self, call_id: &CallId) -> Result<CallDetails, CcError> {
        let state = self.load(call_id).await?;
        Ok(CallDetails {
            call: state.call,
            participants: state.participants,
        })
    }

    /// Calls the user took part in, newest first. `limit` is clamped to
    /// `1..=200`.
    ///
    /// # Errors
    ///
    /// `Database` on registry failure.
    pub async fn call_history(
        &self,
        user_id: UserId,
        limit: i64,
        kind: Option<CallKind>,
    ) -> Result<Vec<Call>, CcError> {
        self.registry
            .call_history(user_id, limit.clamp(1, MAX_HISTORY_LIMIT), kind)
            .await
    }

    /// # Errors
    ///
    /// `Database` on registry failure.
    pub async fn active_calls_for_user(&self, user_id: UserId) -> Result<Vec<Call>, CcError> {
        self.registry.active_calls_for_user(user_id).await
    }

    /// # Errors
    ///
    /// `Database` on registry failure.
    pub async fn is_user_in_call(&self, user_id: UserId) -> Result<bool, CcError> {
        Ok(!self.registry.active_calls_for_user(user_id).await?.is_empty())
    }

    /// Participation summary and ordered event timeline of a call.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown call.
    pub async fn call_analytics(&self, call_id: &CallId) -> Result<CallAnalytics, CcError> {
        let state = self.load(call_id).await?;
        let invitations = self.registry.invitations(call_id).await?;
        let timeline = self.registry.events(call_id).await?;
        let until = state.call.ended_at.unwrap_or_else(Utc::now);

        let participants: Vec<ParticipantSummary> = state
            .participants
            .iter()
            .map(|p| ParticipantSummary {
                user_id: p.user_id,
                status: p.status,
                is_moderator: p.is_moderator,
                joined_at: p.joined_at,
                left_at: p.left_at,
                duration_seconds: p.duration_in_call(until),
            })
            .collect();

        let joined: Vec<&ParticipantSummary> = participants
            .iter()
            .filter(|p| p.joined_at.is_some())
            .collect();
        let total_joined = joined
            .iter()
            .map(|p| p.user_id)
            .collect::<HashSet<_>>()
            .len();
        let average_duration_seconds = match i64::try_from(joined.len()) {
            Ok(n) if n > 0 => joined.iter().map(|p| p.duration_seconds).sum::<i64>() / n,
            _ => 0,
        };

        Ok(CallAnalytics {
            call: state.call,
            total_invited: invitations.len(),
            total_joined,
            average_duration_seconds,
            participants,
            timeline,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::test_support::fixture;
    use super::*;
    use crate::models::{EndReason, LeaveReason};
    use common::types::PeerId;

    #[tokio::test]
    async fn test_history_and_active_calls() {
        let fx = fixture();
        let first = fx.call_to(&[2]).await;
        let second = fx.call_to(&[3]).await;
        fx.engine
            .join(&second.call_id, UserId(3), PeerId::from("peer_3"))
            .await
            .unwrap();
        fx.engine
            .end(&first.call_id, None, EndReason::Normal)
            .await
            .unwrap();

        let history = fx.engine.call_history(UserId(1), 10, None).await.unwrap();
        assert_eq!(history.len(), 2);

        let active = fx.engine.active_calls_for_user(UserId(3)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(fx.engine.is_user_in_call(UserId(3)).await.unwrap());
        assert!(!fx.engine.is_user_in_call(UserId(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_analytics_summarises_participation() {
        let fx = fixture();
        let call = fx.call_to(&[2, 3]).await;
        fx.engine
            .join(&call.call_id, UserId(2), PeerId::from("peer_2"))
            .await
            .unwrap();
        fx.engine
            .leave(&call.call_id, UserId(2), LeaveReason::UserLeft)
            .await
            .unwrap();

        let analytics = fx.engine.call_analytics(&call.call_id).await.unwrap();
        assert_eq!(analytics.total_invited, 2);
        assert_eq!(analytics.total_joined, 2);
        assert_eq!(analytics.participants.len(), 3);
        assert!(analytics.average_duration_seconds >= 0);
        let ids: Vec<i64> = analytics.timeline.iter().map(|e| e.event_id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(analytics.call.end_reason, Some(EndReason::NoParticipants));
    }

    #[tokio::test]
    async fn test_details_of_unknown_call() {
        let fx = fixture();
        let err = fx
            .engine
            .call_details(&CallId::from("call_none"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
