//! Gateway integration tests.
//!
//! Plays whole calls through `Gateway::handle_frame` with the hub as the
//! engine's notification sink, reading what each user's socket queue
//! receives. No network: sockets are plain channels registered with the hub.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use call_controller::actors::{CallControllerHandle, ControllerSettings};
use call_controller::gateway::{ClientEnvelope, Gateway, GatewayHub, SOCKET_OUTBOUND_BUFFER};
use call_controller::lifecycle::{LifecycleEngine, LifecycleSettings};
use call_controller::models::{CallStatus, EndReason};
use call_controller::notifications::NotificationSink;
use call_controller::repositories::{CallRegistry, InMemoryCallRegistry};
use call_controller::session::SessionCache;
use common::types::{CallId, UserId};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Client {
    user_id: UserId,
    rx: mpsc::Receiver<String>,
}

impl Client {
    /// Everything queued for this socket so far, parsed.
    fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn drain_types(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .map(|f| f["type"].as_str().unwrap().to_string())
            .collect()
    }
}

struct TestGateway {
    gateway: Gateway,
    registry: Arc<InMemoryCallRegistry>,
}

impl TestGateway {
    fn new() -> Self {
        let registry = Arc::new(InMemoryCallRegistry::new());
        let hub = Arc::new(GatewayHub::new());
        let engine = Arc::new(LifecycleEngine::new(
            Arc::clone(&registry) as Arc<dyn CallRegistry>,
            Arc::new(SessionCache::default()),
            Arc::clone(&hub) as Arc<dyn NotificationSink>,
            LifecycleSettings::default(),
        ));
        let controller = CallControllerHandle::new(
            ControllerSettings::new("cc-gateway-it"),
            engine,
            CancellationToken::new(),
        );
        Self {
            gateway: Gateway::new(controller, hub),
            registry,
        }
    }

    fn connect(&self, user: i64) -> Client {
        let (tx, rx) = mpsc::channel(SOCKET_OUTBOUND_BUFFER);
        self.gateway.hub().connect(UserId(user), tx);
        Client {
            user_id: UserId(user),
            rx,
        }
    }

    /// Send one frame as `client` and return the reply frame as JSON.
    async fn send(&self, client: &Client, frame: Value) -> Value {
        let envelope: ClientEnvelope = serde_json::from_value(frame).unwrap();
        let reply = self.gateway.handle_frame(client.user_id, envelope).await;
        serde_json::to_value(&reply).unwrap()
    }

    async fn status(&self, call_id: &CallId) -> CallStatus {
        self.registry
            .find_call(call_id)
            .await
            .unwrap()
            .expect("call exists")
            .status
    }
}

/// Initiate 1 -> 2 and accept. Both sides are live afterwards.
async fn connected_pair(t: &TestGateway, alice: &mut Client, bob: &mut Client) -> CallId {
    let reply = t
        .send(
            alice,
            json!({
                "type": "initiate_call",
                "request_id": "init",
                "request": { "kind": "video", "targets": [2], "peer_id": "peer_alice" }
            }),
        )
        .await;
    assert_eq!(reply["type"], "reply");
    assert_eq!(reply["request_id"], "init");
    let call_id = CallId::from(reply["result"]["call_id"].as_str().unwrap());

    let incoming = bob.drain();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0]["type"], "incoming_call");
    let invitation_id = incoming[0]["invitation_id"].clone();

    let reply = t
        .send(
            bob,
            json!({
                "type": "respond_invitation",
                "invitation_id": invitation_id,
                "response": "accepted",
                "peer_id": "peer_bob"
            }),
        )
        .await;
    assert_eq!(reply["type"], "reply");
    assert!(reply["result"]["joined"].is_object());


    alice.drain();
    bob.drain();
    call_id
}

#[tokio::test]
async fn test_call_setup_notifies_initiator() {
    let t = TestGateway::new();
    let mut alice = t.connect(1);
    let mut bob = t.connect(2);

    let reply = t
        .send(
            &alice,
            json!({ "type": "initiate_call", "request": { "kind": "audio", "targets": [2] } }),
        )
        .await;
    let call_id = CallId::from(reply["result"]["call_id"].as_str().unwrap());
    let invitation_id = bob.drain()[0]["invitation_id"].clone();

    t.send(
        &bob,
        json!({
            "type": "respond_invitation",
            "invitation_id": invitation_id,
            "response": "accepted"
        }),
    )
    .await;

    let seen = alice.drain_types();
    assert!(seen.contains(&"user_joined".to_string()));
    assert!(seen.contains(&"call_status_changed".to_string()));
    assert_eq!(t.status(&call_id).await, CallStatus::Connecting);
    assert!(t.gateway.hub().is_subscribed(&call_id, UserId(2)));
}

#[tokio::test]
async fn test_offer_answer_and_candidates_reach_the_peer() {
    let t = TestGateway::new();
    let mut alice = t.connect(1);
    let mut bob = t.connect(2);
    let call_id = connected_pair(&t, &mut alice, &mut bob).await;

    let reply = t
        .send(
            &alice,
            json!({
                "type": "signal",
                "call_id": call_id,
                "to": 2,
                "signal_type": "offer",
                "payload": { "sdp": "v=0 alice" }
            }),
        )
        .await;
    assert_eq!(reply["type"], "reply");

    let at_bob = bob.drain();
    assert_eq!(at_bob.len(), 1);
    assert_eq!(at_bob[0]["type"], "signal_received");
    assert_eq!(at_bob[0]["from_user_id"], 1);
    assert_eq!(at_bob[0]["signal_type"], "offer");
    assert_eq!(at_bob[0]["signal_data"]["sdp"], "v=0 alice");

    t.send(
        &bob,
        json!({
            "type": "ice_candidate",
            "call_id": call_id,
            "to": 1,
            "candidate": { "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host" }
        }),
    )
    .await;
    let at_alice = alice.drain();
    assert_eq!(at_alice.len(), 1);
    assert_eq!(at_alice[0]["type"], "ice_candidate_received");
    assert_eq!(at_alice[0]["from_user_id"], 2);

    t.send(
        &alice,
        json!({ "type": "connected", "call_id": call_id }),
    )
    .await;
    assert_eq!(t.status(&call_id).await, CallStatus::Connected);
}

#[tokio::test]
async fn test_outsider_cannot_signal_into_call() {
    let t = TestGateway::new();
    let mut alice = t.connect(1);
    let mut bob = t.connect(2);
    let mallory = t.connect(3);
    let call_id = connected_pair(&t, &mut alice, &mut bob).await;
    let queued_before = t
        .gateway
        .controller()
        .engine()
        .cache()
        .queued_signals(&call_id);

    let reply = t
        .send(
            &mallory,
            json!({
                "type": "signal",
                "request_id": "m1",
                "call_id": call_id,
                "to": 2,
                "signal_type": "offer",
                "payload": {}
            }),
        )
        .await;

    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "authorization");
    assert_eq!(reply["request_id"], "m1");
    assert!(bob.drain().is_empty());
    assert_eq!(
        t.gateway
            .controller()
            .engine()
            .cache()
            .queued_signals(&call_id),
        queued_before
    );
}

#[tokio::test]
async fn test_rejoin_replays_missed_signals() {
    let t = TestGateway::new();
    let mut alice = t.connect(1);
    let mut bob = t.connect(2);
    let call_id = connected_pair(&t, &mut alice, &mut bob).await;

    t.send(
        &alice,
        json!({
            "type": "signal",
            "call_id": call_id,
            "to": 2,
            "signal_type": "offer",
            "payload": { "sdp": "renegotiate" }
        }),
    )
    .await;

    let reply = t
        .send(
            &bob,
            json!({ "type": "join_call", "call_id": call_id, "peer_id": "peer_bob_2" }),
        )
        .await;
    assert_eq!(reply["result"]["rejoined"], true);
    let missed = reply["result"]["missed_signals"].as_array().unwrap();
    assert_eq!(missed.len(), 1);
    assert_eq!(missed[0]["signal_type"], "offer");
    assert_eq!(missed[0]["payload"]["sdp"], "renegotiate");

    let reply = t
        .send(&bob, json!({ "type": "recent_signals", "call_id": call_id }))
        .await;
    assert_eq!(reply["result"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_media_toggle_is_broadcast_to_the_call() {
    let t = TestGateway::new();
    let mut alice = t.connect(1);
    let mut bob = t.connect(2);
    let call_id = connected_pair(&t, &mut alice, &mut bob).await;

    let reply = t
        .send(
            &bob,
            json!({
                "type": "toggle_media",
                "call_id": call_id,
                "field": "audio",
                "enabled": false
            }),
        )
        .await;
    assert_eq!(reply["result"]["participant"]["media"]["audio_enabled"], false);

    let at_alice = alice.drain();
    assert_eq!(at_alice.len(), 1);
    assert_eq!(at_alice[0]["type"], "media_toggled");
    assert_eq!(at_alice[0]["user_id"], 2);
    assert_eq!(at_alice[0]["changes"]["audio_enabled"], false);
    assert!(bob.drain().is_empty());
}

#[tokio::test]
async fn test_leave_ends_two_party_call() {
    let t = TestGateway::new();
    let mut alice = t.connect(1);
    let mut bob = t.connect(2);
    let call_id = connected_pair(&t, &mut alice, &mut bob).await;

    let reply = t
        .send(&alice, json!({ "type": "leave_call", "call_id": call_id }))
        .await;
    assert_eq!(reply["result"]["call_ended"], true);

    let at_bob = bob.drain();
    let types: Vec<&str> = at_bob.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(types, vec!["user_left", "call_ended"]);
    assert_eq!(at_bob[1]["reason"], EndReason::NoParticipants.as_str());
    assert!(alice.drain().is_empty());

    assert_eq!(t.status(&call_id).await, CallStatus::Ended);
    assert!(!t.gateway.hub().is_subscribed(&call_id, UserId(2)));
    assert_eq!(t.gateway.hub().tracked_call(UserId(2)), None);
}

#[tokio::test]
async fn test_socket_loss_leaves_call_as_disconnected() {
    let t = TestGateway::new();
    let mut alice = t.connect(1);
    let mut bob = t.connect(2);
    let call_id = connected_pair(&t, &mut alice, &mut bob).await;

    t.gateway.disconnect(UserId(2)).await;

    let at_alice = alice.drain();
    assert_eq!(at_alice[0]["type"], "user_left");
    assert_eq!(at_alice[0]["reason"], "disconnected");
    assert_eq!(t.status(&call_id).await, CallStatus::Ended);

    // Nothing tracked any more, so a second disconnect is a no-op.
    t.gateway.disconnect(UserId(2)).await;
    assert!(alice.drain().is_empty());
}

#[tokio::test]
async fn test_queries_over_frames() {
    let t = TestGateway::new();
    let mut alice = t.connect(1);
    let mut bob = t.connect(2);
    let call_id = connected_pair(&t, &mut alice, &mut bob).await;

    let reply = t.send(&bob, json!({ "type": "active_calls" })).await;
    let active = reply["result"].as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["call_id"], call_id.as_str());

    t.send(&alice, json!({ "type": "end_call", "call_id": call_id }))
        .await;

    let reply = t
        .send(&bob, json!({ "type": "call_history", "limit": 10 }))
        .await;
    assert_eq!(reply["result"].as_array().unwrap().len(), 1);

    let reply = t
        .send(&bob, json!({ "type": "call_analytics", "call_id": call_id }))
        .await;
    assert_eq!(reply["type"], "reply");
    assert_eq!(reply["result"]["total_joined"], 2);

    let stranger = t.connect(9);
    let reply = t
        .send(&stranger, json!({ "type": "call_analytics", "call_id": call_id }))
        .await;
    assert_eq!(reply["code"], "authorization");
}
