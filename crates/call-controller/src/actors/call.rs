//! `CallActor` - one per call that currently has traffic.
//!
//! The actor owns the call's mailbox and applies lifecycle operations to it
//! strictly one after another. It exits when:
//!
//! - the call reaches a terminal status,
//! - its mailbox has been idle for the idle timeout,
//! - the controller shuts down (remaining messages are answered `Draining`).
//!
//! On exit the actor closes its mailbox, handles whatever was already
//! queued, and only then removes itself from the controller's table. A
//! dispatcher whose send fails waits on the actor's `done` token before
//! spawning a successor, so two actors never run for the same call at once.

use super::controller::CallTable;
use super::messages::{CallMessage, Reply};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::errors::CcError;
use crate::lifecycle::LifecycleEngine;
use common::types::CallId;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default channel buffer size for a call actor mailbox.
pub const CALL_CHANNEL_BUFFER: usize = 500;

/// Mailbox idle time after which a call actor exits.
pub const CALL_ACTOR_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a call actor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActorExit {
    CallEnded,
    Idle,
    Shutdown,
    ChannelClosed,
}

impl ActorExit {
    const fn as_str(self) -> &'static str {
        match self {
            ActorExit::CallEnded => "call_ended",
            ActorExit::Idle => "idle",
            ActorExit::Shutdown => "shutdown",
            ActorExit::ChannelClosed => "channel_closed",
        }
    }
}

/// Dependencies every call actor shares.
#[derive(Clone)]
pub(crate) struct ActorShared {
    pub engine: Arc<LifecycleEngine>,
    pub metrics: Arc<ActorMetrics>,
    pub table: Weak<CallTable>,
    pub idle_timeout: Duration,
}

/// Handle to a `CallActor`.
#[derive(Clone, Debug)]
pub struct CallActorHandle {
    sender: mpsc::Sender<CallMessage>,
    cancel_token: CancellationToken,
    done: CancellationToken,
    call_id: CallId,
    mailbox: Arc<MailboxMonitor>,
}

impl CallActorHandle {
    /// Spawn a call actor. `cancel_token` should be a child of the
    /// controller's token.
    pub(crate) fn spawn(
        call_id: CallId,
        generation: u64,
        shared: ActorShared,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CALL_CHANNEL_BUFFER);
        let done = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Call, call_id.as_str()));

        let actor = CallActor {
            call_id: call_id.clone(),
            generation,
            receiver,
            cancel_token: cancel_token.clone(),
            done: done.clone(),
            mailbox: Arc::clone(&mailbox),
            shared,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = Self {
            sender,
            cancel_token,
            done,
            call_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Queue a message. A closed mailbox hands the message back so the
    /// caller can route it to a successor actor.
    pub(crate) async fn send(&self, message: CallMessage) -> Result<(), CallMessage> {
        self.mailbox.record_enqueue();
        match self.sender.send(message).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(message)) => {
                self.mailbox.record_drop();
                Err(message)
            }
        }
    }

    /// Resolves once the actor task has finished, however it finished.
    pub async fn stopped(&self) {
        self.done.cancelled().await;
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.done.is_cancelled()
    }

    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.current_depth()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// The call actor implementation.
struct CallActor {
    call_id: CallId,
    generation: u64,
    receiver: mpsc::Receiver<CallMessage>,
    cancel_token: CancellationToken,
    done: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    shared: ActorShared,
}

impl CallActor {
    #[instrument(skip_all, name = "cc.actor.call", fields(call_id = %self.call_id, generation = self.generation))]
    async fn run(mut self) {
        // Cancels `done` on every exit path, unwinding included.
        let _done = self.done.clone().drop_guard();
        self.shared.metrics.call_actor_spawned();
        debug!(target: "cc.actor.call", "CallActor started");

        let exit = loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    break ActorExit::Shutdown;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break ActorExit::ChannelClosed;
                    };
                    let finished = self.handle_message(message).await;
                    self.mailbox.record_dequeue();
                    self.shared.metrics.record_message_processed();
                    if finished {
                        break ActorExit::CallEnded;
                    }
                }

                () = tokio::time::sleep(self.shared.idle_timeout) => {
                    break ActorExit::Idle;
                }
            }
        };

        self.retire(exit).await;
        self.shared.metrics.call_actor_stopped();

        info!(
            target: "cc.actor.call",
            reason = exit.as_str(),
            messages_processed = self.mailbox.messages_processed(),
            "CallActor stopped"
        );
    }

    /// Close the mailbox, settle whatever is still queued, then leave the
    /// controller's table.
    async fn retire(&mut self, exit: ActorExit) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            if exit == ActorExit::Shutdown {
                message.reject(CcError::Draining);
            } else {
                self.handle_message(message).await;
            }
            self.mailbox.record_dequeue();
        }

        if let Some(table) = self.shared.table.upgrade() {
            let generation = self.generation;
            table.remove_if(&self.call_id, |_, managed| managed.generation == generation);
        }
    }

    /// Handle one message. Returns true when the call is now terminal.
    async fn handle_message(&self, message: CallMessage) -> bool {
        let engine = &self.shared.engine;
        let call_id = &self.call_id;
        debug!(target: "cc.actor.call", message = message.name(), "Handling message");

        match message {
            CallMessage::Join {
                user_id,
                peer_id,
                respond_to,
            } => reply(respond_to, engine.join(call_id, user_id, peer_id).await, |_| false),

            CallMessage::Leave {
                user_id,
                reason,
                respond_to,
            } => reply(respond_to, engine.leave(call_id, user_id, reason).await, |o| {
                o.call_ended
            }),

            CallMessage::End {
                ended_by,
                reason,
                respond_to,
            } => reply(respond_to, engine.end(call_id, ended_by, reason).await, |_| true),

            CallMessage::UpdateMedia {
                user_id,
                update,
                respond_to,
            } => reply(
                respond_to,
                engine.update_media(call_id, user_id, update).await,
                |_| false,
            ),

            CallMessage::RespondInvitation {
                invitation_id,
                user_id,
                response,
                peer_id,
                respond_to,
            } => reply(
                respond_to,
                engine
                    .respond_invitation(invitation_id, user_id, response, peer_id)
                    .await,
                |o| o.call_ended,
            ),

            CallMessage::ExpireInvitation {
                invitation_id,
                respond_to,
            } => reply(
                respond_to,
                engine.expire_invitation(call_id, invitation_id).await,
                |_| false,
            ),

            CallMessage::TimeoutStale { cutoff, respond_to } => reply(
                respond_to,
                engine.timeout_stale_call(call_id, cutoff).await,
                |timed_out| *timed_out,
            ),

            CallMessage::MarkRinging {
                user_id,
                respond_to,
            } => reply(respond_to, engine.mark_ringing(call_id, user_id).await, |_| false),

            CallMessage::MarkConnected {
                user_id,
                respond_to,
            } => reply(
                respond_to,
                engine.mark_connected(call_id, user_id).await,
                |_| false,
            ),

            CallMessage::SetHold {
                actor,
                on_hold,
                respond_to,
            } => reply(
                respond_to,
                engine.set_hold(call_id, actor, on_hold).await,
                |_| false,
            ),

            CallMessage::Invite {
                inviter,
                invitee,
                message,
                respond_to,
            } => reply(
                respond_to,
                engine.invite(call_id, inviter, invitee, message).await,
                |_| false,
            ),

            CallMessage::Kick {
                moderator,
                target,
                respond_to,
            } => reply(respond_to, engine.kick(call_id, moderator, target).await, |o| {
                o.call_ended
            }),

            CallMessage::ReportQuality {
                user_id,
                quality,
                stats,
                respond_to,
            } => reply(
                respond_to,
                engine.report_quality(call_id, user_id, quality, stats).await,
                |_| false,
            ),

            CallMessage::StartRecording {
                user_id,
                quality,
                respond_to,
            } => reply(
                respond_to,
                engine.start_recording(call_id, user_id, quality).await,
                |_| false,
            ),

            CallMessage::StopRecording {
                recording_id,
                artifact,
                respond_to,
            } => reply(
                respond_to,
                engine.stop_recording(call_id, recording_id, artifact).await,
                |_| false,
            ),
        }
    }
}

/// Send `result` back and report whether it left the call terminal.
fn reply<T>(
    respond_to: Reply<T>,
    result: Result<T, CcError>,
    ends_call: impl FnOnce(&T) -> bool,
) -> bool {
    let finished = result.as_ref().is_ok_and(ends_call);
    let _ = respond_to.send(result);
    finished
}
