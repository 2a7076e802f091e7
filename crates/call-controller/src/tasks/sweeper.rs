//! Presence/cleanup sweeper background task.
//!
//! Periodically:
//! 1. Ends calls stuck in `initiated`/`ringing` longer than the staleness
//!    threshold, with reason `timeout`
//! 2. Marks unanswered invitations past their expiry as `expired`
//!
//! Every item goes through the call's actor, so the state is re-checked
//! under the same serialization as live traffic and items that moved on in
//! the meantime are skipped. A failure on one item is logged and counted and
//! the sweep carries on.
//!
//! # Graceful Shutdown
//!
//! The task exits when its cancellation token is cancelled. A sweep in
//! progress is finished first.

use crate::actors::CallControllerHandle;
use crate::observability::metrics;
use crate::repositories::CallRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default sweep interval in seconds (5 minutes).
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 300;

/// Default age in seconds after which an unconnected call is stale (2 hours).
pub const DEFAULT_STALE_CALL_SECONDS: u64 = 7200;

/// Default number of items fetched per category per sweep.
pub const DEFAULT_SWEEP_BATCH_SIZE: i64 = 500;

/// Configuration for the sweeper task.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Calls created longer ago than this and still unconnected are ended.
    pub stale_after: Duration,
    pub batch_size: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
            stale_after: Duration::from_secs(DEFAULT_STALE_CALL_SECONDS),
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub calls_timed_out: usize,
    /// Candidates that had connected or ended by the time they were checked.
    pub calls_skipped: usize,
    pub invitations_expired: usize,
    pub invitations_skipped: usize,
    pub failures: usize,
}

/// Start the sweeper background task.
///
/// Runs a sweep every `config.interval` (the first immediately) until
/// `cancel_token` is cancelled.
#[instrument(skip_all, name = "cc.task.sweeper")]
pub async fn start_sweeper(
    controller: CallControllerHandle,
    registry: Arc<dyn CallRegistry>,
    config: SweeperConfig,
    cancel_token: CancellationToken,
) {
    info!(
        target: "cc.task.sweeper",
        interval_seconds = config.interval.as_secs(),
        stale_after_seconds = config.stale_after.as_secs(),
        "Starting sweeper task"
    );

    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_sweep(&controller, registry.as_ref(), &config).await;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "cc.task.sweeper",
                    "Sweeper task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "cc.task.sweeper", "Sweeper task stopped");
}

/// Run a single sweep.
pub async fn run_sweep(
    controller: &CallControllerHandle,
    registry: &dyn CallRegistry,
    config: &SweeperConfig,
) -> SweepReport {
    let started = Instant::now();
    let mut report = SweepReport::default();

    // Step 1: time out stale calls
    let cutoff = chrono::Duration::from_std(config.stale_after)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    match registry.stale_calls(cutoff, config.batch_size).await {
        Ok(call_ids) => {
            for call_id in call_ids {
                match controller.timeout_stale_call(&call_id, cutoff).await {
                    Ok(true) => {
                        report.calls_timed_out += 1;
                        metrics::record_sweeper_item("stale_call", "timed_out");
                    }
                    Ok(false) => {
                        report.calls_skipped += 1;
                        metrics::record_sweeper_item("stale_call", "skipped");
                    }
                    Err(e) => {
                        report.failures += 1;
                        metrics::record_sweeper_item("stale_call", "error");
                        warn!(
                            target: "cc.task.sweeper",
                            call_id = %call_id,
                            error = %e,
                            "Failed to time out stale call"
                        );
                    }
                }
            }
        }
        Err(e) => {
            report.failures += 1;
            error!(target: "cc.task.sweeper", error = %e, "Failed to list stale calls");
        }
    }

    // Step 2: expire overdue invitations
    match registry
        .overdue_invitations(Utc::now(), config.batch_size)
        .await
    {
        Ok(invitations) => {
            for invitation in invitations {
                match controller
                    .expire_invitation(&invitation.call_id, invitation.invitation_id)
                    .await
                {
                    Ok(true) => {
                        report.invitations_expired += 1;
                        metrics::record_sweeper_item("invitation", "expired");
                    }
                    Ok(false) => {
                        report.invitations_skipped += 1;
                        metrics::record_sweeper_item("invitation", "skipped");
                    }
                    Err(e) => {
                        report.failures += 1;
                        metrics::record_sweeper_item("invitation", "error");
                        warn!(
                            target: "cc.task.sweeper",
                            call_id = %invitation.call_id,
                            invitation_id = %invitation.invitation_id,
                            error = %e,
                            "Failed to expire invitation"
                        );
                    }
                }
            }
        }
        Err(e) => {
            report.failures += 1;
            error!(target: "cc.task.sweeper", error = %e, "Failed to list overdue invitations");
        }
    }

    metrics::record_sweep_duration(started.elapsed());
    if report.calls_timed_out > 0 || report.invitations_expired > 0 || report.failures > 0 {
        info!(
            target: "cc.task.sweeper",
            calls_timed_out = report.calls_timed_out,
            invitations_expired = report.invitations_expired,
            failures = report.failures,
            "Sweep finished"
        );
    } else {
        debug!(target: "cc.task.sweeper", "Sweep found nothing to do");
    }
    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::ControllerSettings;
    use crate::lifecycle::{LifecycleEngine, LifecycleSettings};
    use crate::models::{CallKind, CallRequest, CallStatus, EndReason, InvitationResponse};
    use crate::notifications::testing::CapturingSink;
    use crate::repositories::InMemoryCallRegistry;
    use crate::session::SessionCache;
    use common::types::{PeerId, UserId};

    struct Harness {
        controller: CallControllerHandle,
        registry: Arc<InMemoryCallRegistry>,
    }

    fn harness(settings: LifecycleSettings) -> Harness {
        let registry = Arc::new(InMemoryCallRegistry::new());
        let engine = Arc::new(LifecycleEngine::new(
            registry.clone(),
            Arc::new(SessionCache::default()),
            Arc::new(CapturingSink::default()),
            settings,
        ));
        let controller = CallControllerHandle::new(
            ControllerSettings::new("cc-test"),
            engine,
            CancellationToken::new(),
        );
        Harness {
            controller,
            registry,
        }
    }

    fn immediate() -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(1),
            stale_after: Duration::ZERO,
            batch_size: 100,
        }
    }

    #[test]
    fn test_default_config() {
        let config = SweeperConfig::default();
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.stale_after, Duration::from_secs(7200));
        assert_eq!(config.batch_size, DEFAULT_SWEEP_BATCH_SIZE);
    }

    #[tokio::test]
    async fn test_stale_call_times_out_and_invitations_expire() {
        let h = harness(LifecycleSettings {
            invitation_ttl: chrono::Duration::zero(),
            ..LifecycleSettings::default()
        });
        let call = h
            .controller
            .initiate(UserId(1), CallRequest::new(CallKind::Video, vec![UserId(2)]))
            .await
            .unwrap();

        let report = run_sweep(&h.controller, h.registry.as_ref(), &immediate()).await;
        assert_eq!(report.calls_timed_out, 1);
        assert_eq!(report.invitations_expired, 1);
        assert_eq!(report.failures, 0);

        let details = h.controller.call_details(&call.call_id).await.unwrap();
        assert_eq!(details.call.status, CallStatus::Ended);
        assert_eq!(details.call.end_reason, Some(EndReason::Timeout));
        let invitations = h.registry.invitations(&call.call_id).await.unwrap();
        assert_eq!(
            invitations.first().unwrap().response,
            Some(InvitationResponse::Expired)
        );

        // Second sweep finds nothing.
        let again = run_sweep(&h.controller, h.registry.as_ref(), &immediate()).await;
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn test_connected_calls_are_left_alone() {
        let h = harness(LifecycleSettings::default());
        let call = h
            .controller
            .initiate(UserId(1), CallRequest::new(CallKind::Audio, vec![UserId(2)]))
            .await
            .unwrap();
        h.controller
            .join(&call.call_id, UserId(2), PeerId::from("peer_2"))
            .await
            .unwrap();

        let report = run_sweep(&h.controller, h.registry.as_ref(), &immediate()).await;
        assert_eq!(report.calls_timed_out, 0);
        let details = h.controller.call_details(&call.call_id).await.unwrap();
        assert_eq!(details.call.status, CallStatus::Connecting);
    }

    #[tokio::test]
    async fn test_fresh_calls_are_not_stale() {
        let h = harness(LifecycleSettings::default());
        h.controller
            .initiate(UserId(1), CallRequest::new(CallKind::Video, vec![UserId(2)]))
            .await
            .unwrap();
        let report = run_sweep(&h.controller, h.registry.as_ref(), &SweeperConfig::default()).await;
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_registry_failure_is_counted_not_fatal() {
        let h = harness(LifecycleSettings {
            invitation_ttl: chrono::Duration::zero(),
            ..LifecycleSettings::default()
        });
        h.controller
            .initiate(UserId(1), CallRequest::new(CallKind::Video, vec![UserId(2), UserId(3)]))
            .await
            .unwrap();
        h.registry.fail_writes(true);

        let report = run_sweep(&h.controller, h.registry.as_ref(), &immediate()).await;
        assert_eq!(report.calls_timed_out, 0);
        assert_eq!(report.invitations_expired, 0);
        // One stale call and two invitations, each failing on its own.
        assert_eq!(report.failures, 3);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let h = harness(LifecycleSettings::default());
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(start_sweeper(
            h.controller.clone(),
            h.registry.clone(),
            immediate(),
            cancel_token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok(), "Sweeper should stop after cancellation");
        result.unwrap().expect("Task should not panic");
    }
}
