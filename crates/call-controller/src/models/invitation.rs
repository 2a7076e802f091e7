//! Call invitations with timestamp-based expiry.

use super::status::InvitationResponse;
use crate::errors::CcError;
use chrono::{DateTime, Duration, Utc};
use common::types::{CallId, InvitationId, UserId};
use serde::{Deserialize, Serialize};

/// Default time an invitee has to answer.
pub const DEFAULT_INVITATION_TTL_SECONDS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInvitation {
    pub invitation_id: InvitationId,
    pub call_id: CallId,
    pub invited_user: UserId,
    pub invited_by: UserId,
    pub message: Option<String>,
    pub invited_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub response: Option<InvitationResponse>,
}

impl CallInvitation {
    #[must_use]
    pub fn new(
        call_id: CallId,
        invited_user: UserId,
        invited_by: UserId,
        message: Option<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            invitation_id: InvitationId::new(),
            call_id,
            invited_user,
            invited_by,
            message,
            invited_at: now,
            expires_at: now + ttl,
            responded_at: None,
            response: None,
        }
    }

    /// Expired either explicitly or because it went unanswered past
    /// `expires_at`. Consumers must check this before acting.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.response {
            Some(InvitationResponse::Expired) => true,
            Some(_) => false,
            None => self.expires_at < now,
        }
    }

    /// The response as observed at `now`: unanswered invitations past their
    /// expiry read as `expired`.
    #[must_use]
    pub fn effective_response(&self, now: DateTime<Utc>) -> Option<InvitationResponse> {
        match self.response {
            None if self.expires_at < now => Some(InvitationResponse::Expired),
            other => other,
        }
    }

    /// Still waiting on the invitee.
    #[must_use]
    pub fn is_pending(&self, now: DateTime<Utc>) -> bool {
        self.effective_response(now).is_none()
    }

    /// Record the invitee's answer. Checks run in order: the answer itself,
    /// the responder, expiry, then whether it was already answered.
    pub fn respond(
        &mut self,
        responder: UserId,
        response: InvitationResponse,
        now: DateTime<Utc>,
    ) -> Result<(), CcError> {
        if response == InvitationResponse::Expired {
            return Err(CcError::Validation(
                "an invitation cannot be answered with expired".to_string(),
            ));
        }
        if responder != self.invited_user {
            return Err(CcError::Unauthorized(
                "invitation belongs to another user".to_string(),
            ));
        }
        if self.is_expired(now) {
            return Err(CcError::Expired);
        }
        if self.response.is_some() {
            return Err(CcError::InvalidState(
                "invitation already answered".to_string(),
            ));
        }
        self.response = Some(response);
        self.responded_at = Some(now);
        Ok(())
    }

    /// Persistently mark an unanswered, overdue invitation as expired.
    /// Returns false if there was nothing to do.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.response.is_some() || self.expires_at >= now {
            return false;
        }
        self.response = Some(InvitationResponse::Expired);
        self.responded_at = Some(now);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn invitation(now: DateTime<Utc>) -> CallInvitation {
        CallInvitation::new(
            CallId::from("call_test"),
            UserId(2),
            UserId(1),
            None,
            now,
            Duration::seconds(DEFAULT_INVITATION_TTL_SECONDS),
        )
    }

    #[test]
    fn test_expires_five_minutes_out() {
        let now = Utc::now();
        let inv = invitation(now);
        assert_eq!(inv.expires_at - inv.invited_at, Duration::minutes(5));
        assert!(!inv.is_expired(now));
        assert!(inv.is_pending(now));
    }

    #[test]
    fn test_unanswered_past_expiry_reads_expired() {
        let now = Utc::now();
        let inv = invitation(now);
        let later = now + Duration::minutes(6);
        assert!(inv.is_expired(later));
        assert_eq!(
            inv.effective_response(later),
            Some(InvitationResponse::Expired)
        );
        assert!(inv.response.is_none());
    }

    #[test]
    fn test_expired_invitation_cannot_be_accepted() {
        let now = Utc::now();
        let mut inv = invitation(now);
        let err = inv
            .respond(UserId(2), InvitationResponse::Accepted, now + Duration::minutes(10))
            .unwrap_err();
        assert!(matches!(err, CcError::Expired));
        assert!(inv.response.is_none());
    }

    #[test]
    fn test_answer_at_exact_expiry_is_accepted() {
        let now = Utc::now();
        let mut inv = invitation(now);
        let deadline = inv.expires_at;
        assert!(!inv.is_expired(deadline));
        assert!(inv.is_pending(deadline));
        inv.respond(UserId(2), InvitationResponse::Accepted, deadline)
            .unwrap();
        assert_eq!(inv.response, Some(InvitationResponse::Accepted));

        let mut late = invitation(now);
        let err = late
            .respond(
                UserId(2),
                InvitationResponse::Accepted,
                deadline + Duration::milliseconds(1),
            )
            .unwrap_err();
        assert!(matches!(err, CcError::Expired));
    }

    #[test]
    fn test_responder_must_be_invitee() {
        let now = Utc::now();
        let mut inv = invitation(now);
        let err = inv
            .respond(UserId(3), InvitationResponse::Accepted, now)
            .unwrap_err();
        assert_eq!(err.kind(), "authorization");
    }

    #[test]
    fn test_respond_once() {
        let now = Utc::now();
        let mut inv = invitation(now);
        inv.respond(UserId(2), InvitationResponse::Declined, now)
            .unwrap();
        assert_eq!(inv.response, Some(InvitationResponse::Declined));
        assert!(!inv.is_expired(now + Duration::hours(1)));
        let err = inv
            .respond(UserId(2), InvitationResponse::Accepted, now)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[test]
    fn test_expire_only_overdue_unanswered() {
        let now = Utc::now();
        let mut inv = invitation(now);
        assert!(!inv.expire(now));
        assert!(!inv.expire(inv.expires_at));
        assert!(inv.expire(now + Duration::minutes(6)));
        assert_eq!(inv.response, Some(InvitationResponse::Expired));
        assert!(!inv.expire(now + Duration::minutes(7)));
    }
}
