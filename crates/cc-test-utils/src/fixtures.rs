//! Pre-wired in-memory Call Controller stack for integration tests.

use crate::recording_sink::RecordingSink;
use call_controller::actors::{CallControllerHandle, ControllerSettings};
use call_controller::lifecycle::{LifecycleEngine, LifecycleSettings};
use call_controller::models::{
    Call, CallInvitation, CallKind, CallRequest, CallSettings, Participant,
};
use call_controller::notifications::NotificationSink;
use call_controller::repositories::{CallRegistry, InMemoryCallRegistry};
use call_controller::session::SessionCache;
use call_controller::tasks::SweeperConfig;
use common::types::{CallId, PeerId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Registry, cache, sink and controller wired together the way `main` does,
/// with the in-memory registry and a [`RecordingSink`].
pub struct TestStack {
    pub registry: Arc<InMemoryCallRegistry>,
    pub cache: Arc<SessionCache>,
    pub sink: Arc<RecordingSink>,
    pub controller: CallControllerHandle,
    pub cancel_token: CancellationToken,
}

impl Default for TestStack {
    fn default() -> Self {
        Self::new()
    }
}

impl TestStack {
    /// Stack with default settings. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(LifecycleSettings::default())
    }

    #[must_use]
    pub fn with_settings(settings: LifecycleSettings) -> Self {
        Self::build(settings, ControllerSettings::new("cc-test"))
    }

    /// Stack whose invitations are already overdue when created.
    #[must_use]
    pub fn with_instant_invitation_expiry() -> Self {
        Self::with_settings(LifecycleSettings {
            invitation_ttl: chrono::Duration::zero(),
            ..LifecycleSettings::default()
        })
    }

    #[must_use]
    pub fn build(settings: LifecycleSettings, controller_settings: ControllerSettings) -> Self {
        let registry = Arc::new(InMemoryCallRegistry::new());
        let cache = Arc::new(SessionCache::default());
        let sink = Arc::new(RecordingSink::new());
        let engine = Arc::new(LifecycleEngine::new(
            Arc::clone(&registry) as Arc<dyn CallRegistry>,
            Arc::clone(&cache),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
            settings,
        ));
        let cancel_token = CancellationToken::new();
        let controller =
            CallControllerHandle::new(controller_settings, engine, cancel_token.clone());
        Self {
            registry,
            cache,
            sink,
            controller,
            cancel_token,
        }
    }

    /// A video call from `initiator` to `targets`.
    pub async fn start_call(&self, initiator: i64, targets: &[i64]) -> Call {
        self.controller
            .initiate(UserId(initiator), video_request(targets))
            .await
            .expect("initiate should succeed")
    }

    /// A call with explicit settings.
    pub async fn start_call_with(
        &self,
        initiator: i64,
        targets: &[i64],
        settings: CallSettings,
    ) -> Call {
        let mut request = video_request(targets);
        request.settings = Some(settings);
        self.controller
            .initiate(UserId(initiator), request)
            .await
            .expect("initiate should succeed")
    }

    /// Join `user` with a peer id derived from the user id.
    pub async fn join(&self, call_id: &CallId, user: i64) {
        self.controller
            .join(call_id, UserId(user), peer(user))
            .await
            .expect("join should succeed");
    }

    pub async fn call(&self, call_id: &CallId) -> Call {
        self.registry
            .find_call(call_id)
            .await
            .unwrap()
            .expect("call exists")
    }

    /// All of the user's rows in the call, oldest first.
    pub async fn rows(&self, call_id: &CallId, user: i64) -> Vec<Participant> {
        self.registry
            .participants(call_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.user_id == UserId(user))
            .collect()
    }

    /// The user's latest row.
    pub async fn participant(&self, call_id: &CallId, user: i64) -> Participant {
        self.rows(call_id, user)
            .await
            .pop()
            .expect("user has a participant row")
    }

    pub async fn invitation_for(&self, call_id: &CallId, user: i64) -> CallInvitation {
        self.registry
            .invitations(call_id)
            .await
            .unwrap()
            .into_iter()
            .rev()
            .find(|i| i.invited_user == UserId(user))
            .expect("user was invited")
    }

    pub async fn event_types(&self, call_id: &CallId) -> Vec<String> {
        self.registry
            .events(call_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

/// A video call request to `targets`.
#[must_use]
pub fn video_request(targets: &[i64]) -> CallRequest {
    CallRequest::new(CallKind::Video, targets.iter().copied().map(UserId).collect())
}

#[must_use]
pub fn peer(user: i64) -> PeerId {
    PeerId::from(format!("peer_{user}"))
}

/// Sweeper settings that treat every unconnected call as stale.
#[must_use]
pub fn sweep_everything() -> SweeperConfig {
    SweeperConfig {
        interval: Duration::from_millis(20),
        stale_after: Duration::ZERO,
        batch_size: 100,
    }
}
