//! Call data model.
//!
//! Status fields are closed enums; every status change goes through the
//! entity's transition method so an invalid write is an error rather than a
//! silently stored string.

mod call;
mod event;
mod invitation;
mod participant;
mod recording;
mod status;

pub use call::{Call, CallRequest, CallSettings, IceServer, DEFAULT_MAX_PARTICIPANTS, MAX_TITLE_LEN};
pub use event::{kinds as event_kinds, CallEvent, NewCallEvent};
pub use invitation::{CallInvitation, DEFAULT_INVITATION_TTL_SECONDS};
pub use participant::{MediaField, MediaState, MediaUpdate, Participant};
pub use recording::{CallRecording, RecordingArtifact, RecordingQuality};
pub use status::{
    CallKind, CallStatus, ConnectionQuality, EndReason, InvitationResponse, LeaveReason,
    ParticipantStatus,
};
