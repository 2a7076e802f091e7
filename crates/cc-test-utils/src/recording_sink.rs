//! Notification sink that records deliveries for assertions.

use call_controller::notifications::{Notification, NotificationSink, Recipient};
use common::types::UserId;
use std::sync::Mutex;

/// Records every `(recipient, notification)` pair handed to it.
///
/// Group recipients are recorded as addressed; use [`RecordingSink::names_for`]
/// with care for call-group deliveries, which name no users.
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(Recipient, Notification)>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<(Recipient, Notification)> {
        self.delivered.lock().unwrap().clone()
    }

    /// Remove and return everything delivered so far.
    pub fn take(&self) -> Vec<(Recipient, Notification)> {
        std::mem::take(&mut *self.delivered.lock().unwrap())
    }

    pub fn clear(&self) {
        self.delivered.lock().unwrap().clear();
    }

    /// Notification names in delivery order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, n)| n.name())
            .collect()
    }

    /// Names of notifications addressed to `user` directly or in a user list.
    #[must_use]
    pub fn names_for(&self, user: i64) -> Vec<&'static str> {
        let user = UserId(user);
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(recipient, _)| match recipient {
                Recipient::User(id) => *id == user,
                Recipient::Users(ids) => ids.contains(&user),
                Recipient::Call { .. } => false,
            })
            .map(|(_, n)| n.name())
            .collect()
    }

    /// How many notifications named `name` were delivered.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }

    /// The most recent notification named `name`.
    #[must_use]
    pub fn last(&self, name: &str) -> Option<(Recipient, Notification)> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, n)| n.name() == name)
            .cloned()
    }
}

impl NotificationSink for RecordingSink {
    fn deliver(&self, recipient: Recipient, notification: Notification) {
        self.delivered.lock().unwrap().push((recipient, notification));
    }
}
