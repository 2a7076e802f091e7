//! Sweeper integration tests.
//!
//! Runs the sweeper against a full `TestStack` and checks what it leaves
//! behind in the registry, the Session Cache and the notification stream.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use call_controller::models::{CallStatus, EndReason, InvitationResponse, ParticipantStatus};
use call_controller::repositories::CallRegistry;
use call_controller::tasks::{run_sweep, start_sweeper, SweepReport, SweeperConfig};
use cc_test_utils::{sweep_everything, TestStack};
use common::types::{CallId, PeerId, UserId};
use tokio_util::sync::CancellationToken;

/// Poll until the call reaches a terminal status or the deadline passes.
async fn wait_for_end(stack: &TestStack, call_id: &CallId) -> CallStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let status = stack.call(call_id).await.status;
        if status.is_terminal() || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_background_sweeper_times_out_unanswered_call() {
    let stack = TestStack::with_instant_invitation_expiry();
    let call = stack.start_call(1, &[2]).await;
    stack.sink.clear();

    let cancel_token = CancellationToken::new();
    let handle = tokio::spawn(start_sweeper(
        stack.controller.clone(),
        Arc::clone(&stack.registry) as Arc<dyn CallRegistry>,
        sweep_everything(),
        cancel_token.clone(),
    ));

    assert_eq!(wait_for_end(&stack, &call.call_id).await, CallStatus::Ended);
    cancel_token.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sweeper should stop after cancellation")
        .expect("sweeper task should not panic");

    let stored = stack.call(&call.call_id).await;
    assert_eq!(stored.end_reason, Some(EndReason::Timeout));
    assert_eq!(stored.duration_seconds, 0);
    assert_eq!(
        stack.invitation_for(&call.call_id, 2).await.response,
        Some(InvitationResponse::Expired)
    );
    assert_eq!(
        stack.participant(&call.call_id, 1).await.status,
        ParticipantStatus::Left
    );
    assert!(!stack.cache.is_active(&call.call_id));
    assert_eq!(stack.sink.count("call_ended"), 1);

    let events = stack.event_types(&call.call_id).await;
    assert!(events.contains(&"call_ended".to_string()));
    assert!(events.contains(&"invitation_expired".to_string()));
}

#[tokio::test]
async fn test_sweep_spares_calls_that_connected() {
    let stack = TestStack::with_instant_invitation_expiry();
    let joined = stack.start_call(1, &[2]).await;
    stack.join(&joined.call_id, 2).await;
    let waiting = stack.start_call(3, &[4]).await;

    let report = run_sweep(
        &stack.controller,
        stack.registry.as_ref(),
        &sweep_everything(),
    )
    .await;

    assert_eq!(report.calls_timed_out, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(
        stack.call(&joined.call_id).await.status,
        CallStatus::Connecting
    );
    assert_eq!(stack.call(&waiting.call_id).await.status, CallStatus::Ended);
    assert!(stack.cache.is_active(&joined.call_id));
}

#[tokio::test]
async fn test_answered_invitations_are_not_expired() {
    let stack = TestStack::new();
    let call = stack.start_call(1, &[2, 3]).await;
    let invitation = stack.invitation_for(&call.call_id, 2).await;
    stack
        .controller
        .respond_invitation(
            invitation.invitation_id,
            UserId(2),
            InvitationResponse::Declined,
            PeerId::from("peer_2"),
        )
        .await
        .unwrap();

    // Default TTL: nothing is overdue yet.
    let report = run_sweep(
        &stack.controller,
        stack.registry.as_ref(),
        &SweeperConfig::default(),
    )
    .await;
    assert_eq!(report, SweepReport::default());
    assert_eq!(
        stack.invitation_for(&call.call_id, 2).await.response,
        Some(InvitationResponse::Declined)
    );
    assert_eq!(stack.invitation_for(&call.call_id, 3).await.response, None);
}

#[tokio::test]
async fn test_repeated_sweeps_settle() {
    let stack = TestStack::with_instant_invitation_expiry();
    stack.start_call(1, &[2, 3]).await;
    stack.start_call(4, &[5]).await;

    let first = run_sweep(
        &stack.controller,
        stack.registry.as_ref(),
        &sweep_everything(),
    )
    .await;
    assert_eq!(first.calls_timed_out, 2);
    assert_eq!(first.invitations_expired, 3);

    let second = run_sweep(
        &stack.controller,
        stack.registry.as_ref(),
        &sweep_everything(),
    )
    .await;
    assert_eq!(second, SweepReport::default());
    assert_eq!(stack.cache.active_calls(), 0);
}
