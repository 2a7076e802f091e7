//! `CallControllerHandle` - routes call operations to per-call actors.
//!
//! The controller keeps a table of running [`CallActor`](super::call)s keyed
//! by call id. Operations on an existing call are sent to that call's actor,
//! which is spawned on first use; operations on different calls never wait on
//! each other. Operations that create a call or only read the registry go
//! straight to the [`LifecycleEngine`].
//!
//! A supervisor task checks actor health on a fixed tick: panicked actors are
//! removed and counted, and mailbox depth is exported.

use super::call::{ActorShared, CallActorHandle, CALL_ACTOR_IDLE_TIMEOUT};
use super::messages::{CallMessage, ControllerStatus, Reply};
use super::metrics::{ActorMetrics, ActorType};
use crate::errors::CcError;
use crate::lifecycle::{
    CallAnalytics, CallDetails, EndOutcome, InvitationOutcome, JoinOutcome, LeaveOutcome,
    LifecycleEngine, MediaOutcome,
};
use crate::models::{
    Call, CallInvitation, CallKind, CallRecording, CallRequest, ConnectionQuality, EndReason,
    InvitationResponse, LeaveReason, MediaField, MediaUpdate, Participant, RecordingArtifact,
    RecordingQuality,
};
use crate::observability::metrics;
use crate::signaling::SignalingRelay;
use crate::session::{SignalEnvelope, SignalKind};
use chrono::{DateTime, Utc};
use common::types::{CallId, InvitationId, PeerId, RecordingId, UserId};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Times a message is re-routed after finding its actor's mailbox closed.
const DISPATCH_ATTEMPTS: usize = 3;

/// Default supervisor tick.
pub const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(5);

/// Running call actors by call id.
pub(crate) type CallTable = DashMap<CallId, ManagedCall>;

/// A call actor the controller is tracking.
pub(crate) struct ManagedCall {
    pub handle: CallActorHandle,
    pub task_handle: JoinHandle<()>,
    /// Distinguishes successive actors for the same call.
    pub generation: u64,
}

/// Controller tunables.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub controller_id: String,
    pub actor_idle_timeout: Duration,
    pub supervisor_interval: Duration,
}

impl ControllerSettings {
    #[must_use]
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            controller_id: controller_id.into(),
            actor_idle_timeout: CALL_ACTOR_IDLE_TIMEOUT,
            supervisor_interval: SUPERVISOR_INTERVAL,
        }
    }
}

/// Entry point for every call operation.
///
/// Cheap to clone; all clones share one actor table.
#[derive(Clone)]
pub struct CallControllerHandle {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    controller_id: String,
    engine: Arc<LifecycleEngine>,
    relay: SignalingRelay,
    calls: Arc<CallTable>,
    next_generation: AtomicU64,
    accepting: AtomicBool,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    idle_timeout: Duration,
}

impl CallControllerHandle {
    /// Create the controller and start its supervisor. Must be called from
    /// within a Tokio runtime.
    pub fn new(
        settings: ControllerSettings,
        engine: Arc<LifecycleEngine>,
        cancel_token: CancellationToken,
    ) -> Self {
        let relay = SignalingRelay::new(Arc::clone(engine.cache()), Arc::clone(engine.sink()));
        let inner = Arc::new(ControllerInner {
            controller_id: settings.controller_id,
            engine,
            relay,
            calls: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            cancel_token,
            metrics: ActorMetrics::new(),
            idle_timeout: settings.actor_idle_timeout,
        });

        tokio::spawn(supervise(
            Arc::downgrade(&inner),
            inner.cancel_token.child_token(),
            settings.supervisor_interval,
        ));

        info!(
            target: "cc.actor.controller",
            controller_id = %inner.controller_id,
            "CallController started"
        );

        Self { inner }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<LifecycleEngine> {
        &self.inner.engine
    }

    #[must_use]
    pub fn relay(&self) -> &SignalingRelay {
        &self.inner.relay
    }

    #[must_use]
    pub fn actor_metrics(&self) -> &Arc<ActorMetrics> {
        &self.inner.metrics
    }

    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            call_actors: self.inner.calls.len(),
            active_calls: self.inner.engine.cache().active_calls(),
            is_draining: !self.inner.accepting.load(Ordering::SeqCst),
        }
    }

    // --- Call lifecycle ---

    /// Create a call. No actor is involved: nothing else can reference the
    /// call until this returns.
    ///
    /// # Errors
    ///
    /// `Draining` during shutdown, otherwise as [`LifecycleEngine::initiate`].
    pub async fn initiate(&self, initiator: UserId, request: CallRequest) -> Result<Call, CcError> {
        self.ensure_accepting()?;
        let result = self.inner.engine.initiate(initiator, request).await;
        observe("initiate", result)
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::join`].
    pub async fn join(
        &self,
        call_id: &CallId,
        user_id: UserId,
        peer_id: PeerId,
    ) -> Result<JoinOutcome, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::Join {
            user_id,
            peer_id,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::leave`].
    pub async fn leave(
        &self,
        call_id: &CallId,
        user_id: UserId,
        reason: LeaveReason,
    ) -> Result<LeaveOutcome, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::Leave {
            user_id,
            reason,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::end`].
    pub async fn end(
        &self,
        call_id: &CallId,
        ended_by: Option<UserId>,
        reason: EndReason,
    ) -> Result<EndOutcome, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::End {
            ended_by,
            reason,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::update_media`].
    pub async fn update_media(
        &self,
        call_id: &CallId,
        user_id: UserId,
        update: MediaUpdate,
    ) -> Result<MediaOutcome, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::UpdateMedia {
            user_id,
            update,
            respond_to,
        })
        .await
    }

    /// Persist one media flag, then tell the rest of the call. The broadcast
    /// happens only after the update committed and never undoes it.
    ///
    /// # Errors
    ///
    /// See [`LifecycleEngine::update_media`].
    pub async fn toggle_media(
        &self,
        call_id: &CallId,
        user_id: UserId,
        field: MediaField,
        enabled: bool,
    ) -> Result<MediaOutcome, CcError> {
        let outcome = self
            .update_media(call_id, user_id, MediaUpdate::single(field, enabled))
            .await?;
        self.inner
            .relay
            .announce_media(call_id, user_id, outcome.changes);
        Ok(outcome)
    }

    /// Answer an invitation. The invitation is looked up first to find the
    /// call whose actor must handle it.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown invitation, otherwise see
    /// [`LifecycleEngine::respond_invitation`].
    pub async fn respond_invitation(
        &self,
        invitation_id: InvitationId,
        user_id: UserId,
        response: InvitationResponse,
        peer_id: PeerId,
    ) -> Result<InvitationOutcome, CcError> {
        let found = self
            .inner
            .engine
            .registry()
            .find_invitation(invitation_id)
            .await
            .and_then(|invitation| {
                invitation.ok_or_else(|| {
                    CcError::NotFound(format!("invitation {invitation_id} not found"))
                })
            });
        let invitation = observe("respond_invitation", found)?;

        self.dispatch(&invitation.call_id, |respond_to| {
            CallMessage::RespondInvitation {
                invitation_id,
                user_id,
                response,
                peer_id,
                respond_to,
            }
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::expire_invitation`].
    pub async fn expire_invitation(
        &self,
        call_id: &CallId,
        invitation_id: InvitationId,
    ) -> Result<bool, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::ExpireInvitation {
            invitation_id,
            respond_to,
        })
        .await
    }

    /// End a call that never connected and was created at or before
    /// `cutoff`. Returns whether it was ended.
    ///
    /// # Errors
    ///
    /// See [`LifecycleEngine::timeout_stale_call`].
    pub async fn timeout_stale_call(
        &self,
        call_id: &CallId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::TimeoutStale {
            cutoff,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::mark_ringing`].
    pub async fn mark_ringing(&self, call_id: &CallId, user_id: UserId) -> Result<Call, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::MarkRinging {
            user_id,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::mark_connected`].
    pub async fn mark_connected(
        &self,
        call_id: &CallId,
        user_id: UserId,
    ) -> Result<Participant, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::MarkConnected {
            user_id,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::set_hold`].
    pub async fn set_hold(
        &self,
        call_id: &CallId,
        actor: UserId,
        on_hold: bool,
    ) -> Result<Call, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::SetHold {
            actor,
            on_hold,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::invite`].
    pub async fn invite(
        &self,
        call_id: &CallId,
        inviter: UserId,
        invitee: UserId,
        message: Option<String>,
    ) -> Result<CallInvitation, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::Invite {
            inviter,
            invitee,
            message,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::kick`].
    pub async fn kick(
        &self,
        call_id: &CallId,
        moderator: UserId,
        target: UserId,
    ) -> Result<LeaveOutcome, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::Kick {
            moderator,
            target,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::report_quality`].
    pub async fn report_quality(
        &self,
        call_id: &CallId,
        user_id: UserId,
        quality: ConnectionQuality,
        stats: Value,
    ) -> Result<(), CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::ReportQuality {
            user_id,
            quality,
            stats,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::start_recording`].
    pub async fn start_recording(
        &self,
        call_id: &CallId,
        user_id: UserId,
        quality: RecordingQuality,
    ) -> Result<CallRecording, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::StartRecording {
            user_id,
            quality,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// See [`LifecycleEngine::stop_recording`].
    pub async fn stop_recording(
        &self,
        call_id: &CallId,
        recording_id: RecordingId,
        artifact: RecordingArtifact,
    ) -> Result<CallRecording, CcError> {
        self.dispatch(call_id, |respond_to| CallMessage::StopRecording {
            recording_id,
            artifact,
            respond_to,
        })
        .await
    }

    // --- Signaling ---

    /// # Errors
    ///
    /// See [`SignalingRelay::relay`].
    pub fn relay_signal(
        &self,
        call_id: &CallId,
        from: UserId,
        to: Option<UserId>,
        kind: SignalKind,
        signal_type: &str,
        payload: Value,
    ) -> Result<SignalEnvelope, CcError> {
        observe(
            "relay_signal",
            self.inner
                .relay
                .relay(call_id, from, to, kind, signal_type, payload),
        )
    }

    #[must_use]
    pub fn recent_signals(&self, call_id: &CallId, user_id: UserId) -> Vec<SignalEnvelope> {
        self.inner.relay.recent_signals(call_id, user_id)
    }

    // --- Queries ---

    /// # Errors
    ///
    /// `NotFound` for an unknown call.
    pub async fn call_details(&self, call_id: &CallId) -> Result<CallDetails, CcError> {
        observe("call_details", self.inner.engine.call_details(call_id).await)
    }

    /// # Errors
    ///
    /// `Database` on registry failure.
    pub async fn call_history(
        &self,
        user_id: UserId,
        limit: i64,
        kind: Option<CallKind>,
    ) -> Result<Vec<Call>, CcError> {
        observe(
            "call_history",
            self.inner.engine.call_history(user_id, limit, kind).await,
        )
    }

    /// # Errors
    ///
    /// `Database` on registry failure.
    pub async fn active_calls_for_user(&self, user_id: UserId) -> Result<Vec<Call>, CcError> {
        observe(
            "active_calls_for_user",
            self.inner.engine.active_calls_for_user(user_id).await,
        )
    }

    /// # Errors
    ///
    /// `Database` on registry failure.
    pub async fn is_user_in_call(&self, user_id: UserId) -> Result<bool, CcError> {
        observe(
            "is_user_in_call",
            self.inner.engine.is_user_in_call(user_id).await,
        )
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown call.
    pub async fn call_analytics(&self, call_id: &CallId) -> Result<CallAnalytics, CcError> {
        observe(
            "call_analytics",
            self.inner.engine.call_analytics(call_id).await,
        )
    }

    // --- Shutdown ---

    /// Stop accepting work, cancel every call actor and wait up to
    /// `deadline` for them to finish. Messages still queued are answered
    /// with `Draining`.
    pub async fn shutdown(&self, deadline: Duration) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        info!(
            target: "cc.actor.controller",
            controller_id = %self.inner.controller_id,
            call_actors = self.inner.calls.len(),
            "CallController shutting down"
        );
        self.inner.cancel_token.cancel();

        let call_ids: Vec<CallId> = self.inner.calls.iter().map(|e| e.key().clone()).collect();
        let mut tasks = Vec::with_capacity(call_ids.len());
        for call_id in call_ids {
            if let Some((_, managed)) = self.inner.calls.remove(&call_id) {
                tasks.push((call_id, managed.task_handle));
            }
        }

        let join_all = async {
            for (call_id, task_handle) in tasks {
                if let Err(e) = task_handle.await {
                    if e.is_panic() {
                        self.inner.metrics.record_panic(ActorType::Call);
                    }
                    warn!(
                        target: "cc.actor.controller",
                        call_id = %call_id,
                        error = %e,
                        "Call actor did not stop cleanly"
                    );
                }
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!(
                target: "cc.actor.controller",
                controller_id = %self.inner.controller_id,
                "Shutdown deadline passed with call actors still running"
            );
        }

        info!(
            target: "cc.actor.controller",
            controller_id = %self.inner.controller_id,
            messages_processed = self
                .inner
                .metrics
                .total_messages_processed
                .load(Ordering::Relaxed),
            "CallController stopped"
        );
    }

    // --- Routing ---

    fn ensure_accepting(&self) -> Result<(), CcError> {
        if self.inner.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CcError::Draining)
        }
    }

    /// Send a message to the call's actor and wait for its reply.
    async fn dispatch<T>(
        &self,
        call_id: &CallId,
        build: impl FnOnce(Reply<T>) -> CallMessage,
    ) -> Result<T, CcError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = Some(build(tx));
        let name = pending.as_ref().map_or("unknown", CallMessage::name);

        for _ in 0..DISPATCH_ATTEMPTS {
            let Some(message) = pending.take() else {
                break;
            };
            let (handle, generation) = match self.actor_for(call_id) {
                Ok(found) => found,
                Err(e) => {
                    message.reject(e);
                    break;
                }
            };
            if let Err(returned) = handle.send(message).await {
                // The actor is retiring. Wait for it to finish so its
                // successor never overlaps with it.
                pending = Some(returned);
                handle.stopped().await;
                self.inner
                    .calls
                    .remove_if(call_id, |_, managed| managed.generation == generation);
                debug!(
                    target: "cc.actor.controller",
                    call_id = %call_id,
                    message = name,
                    "Re-routing message after actor exit"
                );
            }
        }
        if let Some(message) = pending {
            message.reject(CcError::Internal(format!(
                "no call actor accepted {name} for {call_id}"
            )));
        }

        let result = match rx.await {
            Ok(result) => result,
            Err(e) => Err(CcError::Internal(format!("response receive failed: {e}"))),
        };
        observe(name, result)
    }

    /// The running actor for `call_id`, spawning one if needed.
    fn actor_for(&self, call_id: &CallId) -> Result<(CallActorHandle, u64), CcError> {
        if let Some(managed) = self.inner.calls.get(call_id) {
            return Ok((managed.handle.clone(), managed.generation));
        }
        self.ensure_accepting()?;

        let managed = self
            .inner
            .calls
            .entry(call_id.clone())
            .or_insert_with(|| self.spawn_actor(call_id));
        Ok((managed.handle.clone(), managed.generation))
    }

    fn spawn_actor(&self, call_id: &CallId) -> ManagedCall {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let shared = ActorShared {
            engine: Arc::clone(&self.inner.engine),
            metrics: Arc::clone(&self.inner.metrics),
            table: Arc::downgrade(&self.inner.calls),
            idle_timeout: self.inner.idle_timeout,
        };
        let (handle, task_handle) = CallActorHandle::spawn(
            call_id.clone(),
            generation,
            shared,
            self.inner.cancel_token.child_token(),
        );
        debug!(
            target: "cc.actor.controller",
            call_id = %call_id,
            generation,
            "Spawned call actor"
        );
        ManagedCall {
            handle,
            task_handle,
            generation,
        }
    }
}

/// Count and log a failed operation, passing the result through.
fn observe<T>(operation: &'static str, result: Result<T, CcError>) -> Result<T, CcError> {
    if let Err(e) = &result {
        metrics::record_error(e.kind());
        match e {
            CcError::Database(_) | CcError::Internal(_) => {
                error!(target: "cc.actor.controller", operation, error = %e, "Operation failed");
            }
            _ => {
                debug!(target: "cc.actor.controller", operation, error = %e, "Operation rejected");
            }
        }
    }
    result
}

/// Periodic health check over the actor table.
#[instrument(skip_all, name = "cc.actor.controller")]
async fn supervise(
    inner: Weak<ControllerInner>,
    cancel_token: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                check_call_health(&inner).await;
            }
        }
    }
    debug!(target: "cc.actor.controller", "Supervisor stopped");
}

/// Remove finished actors still in the table and report panics.
async fn check_call_health(inner: &ControllerInner) {
    let finished: Vec<(CallId, u64)> = inner
        .calls
        .iter()
        .filter(|entry| entry.task_handle.is_finished())
        .map(|entry| (entry.key().clone(), entry.generation))
        .collect();

    for (call_id, generation) in finished {
        let Some((_, managed)) = inner
            .calls
            .remove_if(&call_id, |_, managed| managed.generation == generation)
        else {
            continue;
        };
        match managed.task_handle.await {
            Ok(()) => {
                debug!(target: "cc.actor.controller", call_id = %call_id, "Removed finished call actor");
            }
            Err(join_error) if join_error.is_panic() => {
                inner.metrics.record_panic(ActorType::Call);
                inner.metrics.call_actor_stopped();
                error!(
                    target: "cc.actor.controller",
                    call_id = %call_id,
                    "Call actor panicked"
                );
            }
            Err(join_error) => {
                warn!(
                    target: "cc.actor.controller",
                    call_id = %call_id,
                    error = %join_error,
                    "Call actor cancelled"
                );
            }
        }
    }

    let deepest = inner
        .calls
        .iter()
        .map(|entry| entry.handle.mailbox_depth())
        .max()
        .unwrap_or(0);
    metrics::set_actor_mailbox_depth(ActorType::Call.as_str(), deepest);
    metrics::set_calls_active(inner.engine.cache().active_calls());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleSettings;
    use crate::models::{CallStatus, ParticipantStatus};
    use crate::notifications::testing::CapturingSink;
    use crate::repositories::{CallRegistry, InMemoryCallRegistry};
    use crate::session::SessionCache;

    struct Harness {
        controller: CallControllerHandle,
        registry: Arc<InMemoryCallRegistry>,
        sink: Arc<CapturingSink>,
    }

    fn harness_with(settings: ControllerSettings) -> Harness {
        let registry = Arc::new(InMemoryCallRegistry::new());
        let sink = Arc::new(CapturingSink::default());
        let engine = Arc::new(LifecycleEngine::new(
            registry.clone(),
            Arc::new(SessionCache::default()),
            sink.clone(),
            LifecycleSettings::default(),
        ));
        let controller =
            CallControllerHandle::new(settings, engine, CancellationToken::new());
        Harness {
            controller,
            registry,
            sink,
        }
    }

    fn harness() -> Harness {
        harness_with(ControllerSettings::new("cc-test"))
    }

    fn request_to(targets: &[i64]) -> CallRequest {
        CallRequest::new(CallKind::Video, targets.iter().map(|t| UserId(*t)).collect())
    }

    #[tokio::test]
    async fn test_join_routes_through_call_actor() {
        let h = harness();
        let call = h
            .controller
            .initiate(UserId(1), request_to(&[2]))
            .await
            .unwrap();
        assert_eq!(h.controller.status().call_actors, 0);

        let joined = h
            .controller
            .join(&call.call_id, UserId(2), PeerId::from("peer_2"))
            .await
            .unwrap();
        assert_eq!(joined.call.status, CallStatus::Connecting);
        assert_eq!(h.controller.status().call_actors, 1);
        assert_eq!(h.controller.status().active_calls, 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_are_serialized() {
        let h = harness();
        let mut request = request_to(&[2]);
        request.settings = Some(crate::models::CallSettings {
            max_participants: 3,
            ..crate::models::CallSettings::default()
        });
        let call = h.controller.initiate(UserId(1), request).await.unwrap();

        let mut joins = Vec::new();
        for user in 2..=6 {
            let controller = h.controller.clone();
            let call_id = call.call_id.clone();
            joins.push(tokio::spawn(async move {
                controller
                    .join(&call_id, UserId(user), PeerId::from(format!("peer_{user}")))
                    .await
            }));
        }
        let mut admitted = 0;
        let mut full = 0;
        for join in joins {
            match join.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(e) => {
                    assert_eq!(e.kind(), "capacity");
                    full += 1;
                }
            }
        }
        assert_eq!(admitted, 2);
        assert_eq!(full, 3);

        let details = h.controller.call_details(&call.call_id).await.unwrap();
        let active = details
            .participants
            .iter()
            .filter(|p| p.status.is_active())
            .count();
        assert_eq!(active, 3);
    }

    #[tokio::test]
    async fn test_actor_retires_when_call_ends() {
        let h = harness();
        let call = h
            .controller
            .initiate(UserId(1), request_to(&[2]))
            .await
            .unwrap();
        h.controller
            .join(&call.call_id, UserId(2), PeerId::from("peer_2"))
            .await
            .unwrap();
        let left = h
            .controller
            .leave(&call.call_id, UserId(2), LeaveReason::UserLeft)
            .await
            .unwrap();
        assert!(left.call_ended);

        // A follow-up on the ended call is served by a fresh actor.
        let again = h
            .controller
            .end(&call.call_id, Some(UserId(1)), EndReason::Normal)
            .await
            .unwrap();
        assert!(again.already_ended);
        assert_eq!(again.call.end_reason, Some(EndReason::NoParticipants));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_actor_exits_and_respawns() {
        let mut settings = ControllerSettings::new("cc-test");
        settings.actor_idle_timeout = Duration::from_secs(10);
        let h = harness_with(settings);
        let call = h
            .controller
            .initiate(UserId(1), request_to(&[2]))
            .await
            .unwrap();
        h.controller.mark_ringing(&call.call_id, UserId(2)).await.unwrap();
        assert_eq!(h.controller.status().call_actors, 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.controller.status().call_actors, 0);

        let joined = h
            .controller
            .join(&call.call_id, UserId(2), PeerId::from("peer_2"))
            .await
            .unwrap();
        assert_eq!(joined.participant.status, ParticipantStatus::Connecting);
        assert_eq!(h.controller.status().call_actors, 1);
    }

    #[tokio::test]
    async fn test_toggle_media_persists_then_broadcasts() {
        let h = harness();
        let call = h
            .controller
            .initiate(UserId(1), request_to(&[2]))
            .await
            .unwrap();
        h.controller
            .join(&call.call_id, UserId(2), PeerId::from("peer_2"))
            .await
            .unwrap();
        h.sink.take();

        let outcome = h
            .controller
            .toggle_media(&call.call_id, UserId(2), MediaField::Video, false)
            .await
            .unwrap();
        assert!(!outcome.participant.media.video_enabled);
        assert_eq!(h.sink.names(), vec!["media_toggled"]);

        // Unchanged value: nothing persisted, nothing broadcast.
        h.sink.take();
        h.controller
            .toggle_media(&call.call_id, UserId(2), MediaField::Video, false)
            .await
            .unwrap();
        assert!(h.sink.names().is_empty());
    }

    #[tokio::test]
    async fn test_respond_to_unknown_invitation() {
        let h = harness();
        let err = h
            .controller
            .respond_invitation(
                InvitationId::new(),
                UserId(2),
                InvitationResponse::Accepted,
                PeerId::from("peer_2"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let h = harness();
        let call = h
            .controller
            .initiate(UserId(1), request_to(&[2]))
            .await
            .unwrap();
        h.controller.mark_ringing(&call.call_id, UserId(2)).await.unwrap();

        h.controller.shutdown(Duration::from_secs(5)).await;
        assert!(h.controller.status().is_draining);
        assert_eq!(h.controller.status().call_actors, 0);

        let err = h
            .controller
            .join(&call.call_id, UserId(2), PeerId::from("peer_2"))
            .await
            .unwrap_err();
        assert!(matches!(err, CcError::Draining));
        let err = h
            .controller
            .initiate(UserId(3), request_to(&[4]))
            .await
            .unwrap_err();
        assert!(matches!(err, CcError::Draining));

        // Nothing reached the registry after draining began.
        assert!(h
            .registry
            .participants(&call.call_id)
            .await
            .unwrap()
            .iter()
            .all(|p| p.user_id != UserId(2) || !p.status.is_active()));
    }
}
