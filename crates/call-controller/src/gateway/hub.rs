//! Socket registry and call broadcast groups.
//!
//! The hub is the gateway's [`NotificationSink`]. It maps users to their
//! open sockets and calls to the users subscribed to them, and performs the
//! actual fan-out. Writes never block: a socket whose outbound queue is full
//! loses the frame.

use crate::notifications::{Notification, NotificationSink, Recipient};
use crate::observability::metrics;
use common::types::{CallId, UserId};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound frames queued per socket before new ones are dropped.
pub const SOCKET_OUTBOUND_BUFFER: usize = 256;

/// Identifies one socket of a user.
pub type ConnectionId = u64;

/// Open sockets and broadcast groups.
#[derive(Debug, Default)]
pub struct GatewayHub {
    sockets: DashMap<UserId, HashMap<ConnectionId, mpsc::Sender<String>>>,
    groups: DashMap<CallId, HashSet<UserId>>,
    /// The call each user last joined, for cleanup when their sockets close.
    tracked: DashMap<UserId, CallId>,
    next_connection: AtomicU64,
}

impl GatewayHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket for `user_id`.
    pub fn connect(&self, user_id: UserId, sender: mpsc::Sender<String>) -> ConnectionId {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        self.sockets
            .entry(user_id)
            .or_default()
            .insert(connection_id, sender);
        metrics::set_gateway_connections(self.connection_count());
        debug!(target: "cc.gateway", user_id = %user_id, connection_id, "Socket connected");
        connection_id
    }

    /// Forget a socket. Returns true when it was the user's last one.
    pub fn disconnect(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let last = match self.sockets.get_mut(&user_id) {
            Some(mut sockets) => {
                sockets.remove(&connection_id);
                sockets.is_empty()
            }
            None => true,
        };
        if last {
            self.sockets.remove_if(&user_id, |_, sockets| sockets.is_empty());
        }
        metrics::set_gateway_connections(self.connection_count());
        debug!(target: "cc.gateway", user_id = %user_id, connection_id, last, "Socket disconnected");
        last
    }

    #[must_use]
    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.sockets.contains_key(&user_id)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sockets.iter().map(|entry| entry.value().len()).sum()
    }

    /// Add a user to a call's broadcast group and remember the call as
    /// theirs.
    pub fn subscribe(&self, call_id: &CallId, user_id: UserId) {
        self.groups.entry(call_id.clone()).or_default().insert(user_id);
        self.tracked.insert(user_id, call_id.clone());
    }

    /// Remove a user from a call's broadcast group.
    pub fn unsubscribe(&self, call_id: &CallId, user_id: UserId) {
        if let Some(mut members) = self.groups.get_mut(call_id) {
            members.remove(&user_id);
        }
        self.groups.remove_if(call_id, |_, members| members.is_empty());
        self.tracked
            .remove_if(&user_id, |_, tracked| tracked == call_id);
    }

    #[must_use]
    pub fn is_subscribed(&self, call_id: &CallId, user_id: UserId) -> bool {
        self.groups
            .get(call_id)
            .is_some_and(|members| members.contains(&user_id))
    }

    /// The call `user_id` last joined and has not left.
    #[must_use]
    pub fn tracked_call(&self, user_id: UserId) -> Option<CallId> {
        self.tracked.get(&user_id).map(|call| call.value().clone())
    }

    /// Queue a serialized frame on every socket of `user_id`.
    pub fn send_to_user(&self, user_id: UserId, frame: &str) {
        let Some(sockets) = self.sockets.get(&user_id) else {
            return;
        };
        for (connection_id, sender) in sockets.iter() {
            if sender.try_send(frame.to_string()).is_err() {
                metrics::record_gateway_drop();
                debug!(
                    target: "cc.gateway",
                    user_id = %user_id,
                    connection_id,
                    "Outbound frame dropped"
                );
            }
        }
    }

    fn resolve(&self, recipient: &Recipient) -> Vec<UserId> {
        match recipient {
            Recipient::User(user_id) => vec![*user_id],
            Recipient::Users(users) => users.clone(),
            Recipient::Call { call_id, except } => self
                .groups
                .get(call_id)
                .map(|members| {
                    members
                        .iter()
                        .copied()
                        .filter(|user| Some(*user) != *except)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Group bookkeeping that follows from a notification once it has been
    /// delivered: departed users stop receiving the call's traffic and an
    /// ended call's group is dissolved.
    fn apply_membership(&self, notification: &Notification) {
        match notification {
            Notification::UserLeft {
                call_id, user_id, ..
            } => self.unsubscribe(call_id, *user_id),
            Notification::CallEnded { call_id, .. } => {
                if let Some((_, members)) = self.groups.remove(call_id) {
                    for user_id in members {
                        self.tracked.remove_if(&user_id, |_, tracked| tracked == call_id);
                    }
                }
            }
            _ => {}
        }
    }
}

impl NotificationSink for GatewayHub {
    fn deliver(&self, recipient: Recipient, notification: Notification) {
        match serde_json::to_string(&notification) {
            Ok(frame) => {
                for user_id in self.resolve(&recipient) {
                    self.send_to_user(user_id, &frame);
                }
            }
            Err(e) => {
                warn!(
                    target: "cc.gateway",
                    notification = notification.name(),
                    error = %e,
                    "Notification not serializable"
                );
            }
        }
        self.apply_membership(&notification);
    }
}
