//! Closed status types for calls, participants and invitations.
//!
//! Each status type owns its transition table. `transition` is the only way
//! lifecycle code moves an entity between states; an invalid move is an
//! `InvalidState` error and leaves the value untouched.

use crate::errors::CcError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            /// Wire and storage representation.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CcError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($name::$variant),)+
                    other => Err(CcError::Validation(format!(
                        "unrecognized {}: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

/// Media kind of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
    ScreenShare,
}

string_enum!(CallKind {
    Audio => "audio",
    Video => "video",
    ScreenShare => "screen_share",
});

/// Lifecycle status of a call.
///
/// ```text
/// initiated -> ringing | connecting
/// ringing   -> connecting
/// connecting -> connected
/// connected <-> on_hold
/// any non-terminal -> ended
/// initiated | ringing -> failed | missed | declined | busy
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Connecting,
    Connected,
    OnHold,
    Ended,
    Failed,
    Missed,
    Declined,
    Busy,
}

string_enum!(CallStatus {
    Initiated => "initiated",
    Ringing => "ringing",
    Connecting => "connecting",
    Connected => "connected",
    OnHold => "on_hold",
    Ended => "ended",
    Failed => "failed",
    Missed => "missed",
    Declined => "declined",
    Busy => "busy",
});

impl CallStatus {
    /// No transition leaves a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended
                | CallStatus::Failed
                | CallStatus::Missed
                | CallStatus::Declined
                | CallStatus::Busy
        )
    }

    /// Nobody has joined yet.
    #[must_use]
    pub const fn is_pre_connect(&self) -> bool {
        matches!(self, CallStatus::Initiated | CallStatus::Ringing)
    }

    #[must_use]
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Ended) => true,
            (Initiated, Ringing | Connecting) => true,
            (Initiated | Ringing, Failed | Missed | Declined | Busy) => true,
            (Ringing, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, OnHold) | (OnHold, Connected) => true,
            _ => false,
        }
    }

    /// Move to `next`, or fail without changing `self`.
    pub fn transition(&mut self, next: CallStatus) -> Result<(), CcError> {
        if !self.can_transition_to(next) {
            return Err(CcError::InvalidState(format!(
                "call cannot move from {self} to {next}"
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Membership status of a participant row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    Connecting,
    Connected,
    Disconnected,
    Left,
    Kicked,
}

string_enum!(ParticipantStatus {
    Invited => "invited",
    Connecting => "connecting",
    Connected => "connected",
    Disconnected => "disconnected",
    Left => "left",
    Kicked => "kicked",
});

impl ParticipantStatus {
    /// `left` and `kicked` rows are history; a user who comes back gets a new row.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, ParticipantStatus::Left | ParticipantStatus::Kicked)
    }

    /// Counts toward the call's active-participant total.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            ParticipantStatus::Connecting | ParticipantStatus::Connected
        )
    }

    #[must_use]
    pub fn can_transition_to(&self, next: ParticipantStatus) -> bool {
        use ParticipantStatus::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (Invited | Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting | Connected, Disconnected) => true,
            (_, Left | Kicked) => true,
            _ => false,
        }
    }

    /// Move to `next`, or fail without changing `self`.
    pub fn transition(&mut self, next: ParticipantStatus) -> Result<(), CcError> {
        if !self.can_transition_to(next) {
            return Err(CcError::InvalidState(format!(
                "participant cannot move from {self} to {next}"
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Why a call reached a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Normal,
    Timeout,
    Error,
    NetworkIssue,
    UserDeclined,
    UserBusy,
    ModeratorEnded,
    NoParticipants,
}

string_enum!(EndReason {
    Normal => "normal",
    Timeout => "timeout",
    Error => "error",
    NetworkIssue => "network_issue",
    UserDeclined => "user_declined",
    UserBusy => "user_busy",
    ModeratorEnded => "moderator_ended",
    NoParticipants => "no_participants",
});

/// Why a participant stopped being part of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Explicit leave from the client.
    UserLeft,
    /// Socket went away.
    Disconnected,
    /// Removed by a moderator.
    Kicked,
    /// Swept up by the end of the call.
    CallEnded,
}

string_enum!(LeaveReason {
    UserLeft => "user_left",
    Disconnected => "disconnected",
    Kicked => "kicked",
    CallEnded => "call_ended",
});

/// Resolution of an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationResponse {
    Accepted,
    Declined,
    Expired,
}

string_enum!(InvitationResponse {
    Accepted => "accepted",
    Declined => "declined",
    Expired => "expired",
});

/// Connection quality label reported by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Good,
    Fair,
    Poor,
}

string_enum!(ConnectionQuality {
    Good => "good",
    Fair => "fair",
    Poor => "poor",
});
