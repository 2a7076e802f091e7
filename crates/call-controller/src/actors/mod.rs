//! Actor model for call coordination.
//!
//! - [`CallControllerHandle`]: routes operations by call id, owns the actor
//!   table and supervises it.
//! - `CallActor`: one per call with traffic; applies lifecycle operations
//!   to its call one at a time.
//!
//! Handles talk to actors over bounded `mpsc` mailboxes and get answers on
//! `oneshot` channels. Cancellation flows from the controller's token to a
//! child token per actor.

mod call;
mod controller;
mod messages;
pub mod metrics;

pub use call::{CallActorHandle, CALL_ACTOR_IDLE_TIMEOUT, CALL_CHANNEL_BUFFER};
pub use controller::{CallControllerHandle, ControllerSettings, SUPERVISOR_INTERVAL};
pub use messages::{CallMessage, ControllerStatus};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
