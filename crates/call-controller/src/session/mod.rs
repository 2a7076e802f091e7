//! Session Cache: process-local view of who is live in each call.
//!
//! One entry per active call holding the joined members and a bounded FIFO
//! of recent signaling messages for reconnect replay. The cache is never
//! written back to the registry; after a restart it starts empty and refills
//! as users rejoin.
//!
//! Entries live in a `DashMap`, so work on different calls proceeds in
//! parallel and each call's entry is mutated under its shard lock. Lifecycle
//! changes additionally arrive serialized per call from the call's actor.

mod queue;

pub use queue::{SignalEnvelope, SignalKind, SignalQueue, DEFAULT_SIGNAL_QUEUE_CAPACITY};

use crate::errors::CcError;
use chrono::{DateTime, Utc};
use common::types::{CallId, PeerId, UserId};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// A member currently joined to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMember {
    pub peer_id: PeerId,
    pub joined_at: DateTime<Utc>,
}

/// Live state of one call.
#[derive(Debug)]
pub struct SessionEntry {
    members: HashMap<UserId, LiveMember>,
    signals: SignalQueue,
    activated_at: DateTime<Utc>,
}

impl SessionEntry {
    fn new(signal_capacity: usize) -> Self {
        Self {
            members: HashMap::new(),
            signals: SignalQueue::new(signal_capacity),
            activated_at: Utc::now(),
        }
    }
}

/// Process-wide map from call id to live state.
#[derive(Debug)]
pub struct SessionCache {
    entries: DashMap<CallId, SessionEntry>,
    signal_capacity: usize,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNAL_QUEUE_CAPACITY)
    }
}

impl SessionCache {
    #[must_use]
    pub fn new(signal_capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            signal_capacity: signal_capacity.max(1),
        }
    }

    /// Create the entry for a call. Returns false if it already existed.
    pub fn activate(&self, call_id: &CallId) -> bool {
        let mut created = false;
        self.entries.entry(call_id.clone()).or_insert_with(|| {
            created = true;
            SessionEntry::new(self.signal_capacity)
        });
        if created {
            debug!(target: "cc.session", call_id = %call_id, "Session entry activated");
        }
        created
    }

    /// Drop the entry for a call. Returns false if there was none.
    pub fn deactivate(&self, call_id: &CallId) -> bool {
        match self.entries.remove(call_id) {
            Some((_, entry)) => {
                debug!(
                    target: "cc.session",
                    call_id = %call_id,
                    members = entry.members.len(),
                    queued_signals = entry.signals.len(),
                    lived_seconds = (Utc::now() - entry.activated_at).num_seconds(),
                    "Session entry deactivated"
                );
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_active(&self, call_id: &CallId) -> bool {
        self.entries.contains_key(call_id)
    }

    /// Number of calls with a live entry.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.entries.len()
    }

    /// Add or refresh a member. An entry is created if the cache lost it
    /// (restart), since a successful join proves the call is live.
    pub fn record_member(&self, call_id: &CallId, user_id: UserId, peer_id: PeerId) {
        let mut entry = self
            .entries
            .entry(call_id.clone())
            .or_insert_with(|| SessionEntry::new(self.signal_capacity));
        let joined_at = entry
            .members
            .get(&user_id)
            .map_or_else(Utc::now, |m| m.joined_at);
        entry.members.insert(user_id, LiveMember { peer_id, joined_at });
    }

    /// Remove a member. Returns false if the user was not live.
    pub fn remove_member(&self, call_id: &CallId, user_id: UserId) -> bool {
        self.entries
            .get_mut(call_id)
            .is_some_and(|mut entry| entry.members.remove(&user_id).is_some())
    }

    #[must_use]
    pub fn is_member(&self, call_id: &CallId, user_id: UserId) -> bool {
        self.entries
            .get(call_id)
            .is_some_and(|entry| entry.members.contains_key(&user_id))
    }

    /// Snapshot of a call's live members.
    #[must_use]
    pub fn members(&self, call_id: &CallId) -> Vec<(UserId, LiveMember)> {
        self.entries
            .get(call_id)
            .map(|entry| {
                entry
                    .members
                    .iter()
                    .map(|(user, member)| (*user, member.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Append a signal to the call's replay queue, evicting the oldest entry
    /// beyond capacity. Fails with `NotFound` if the call has no live entry.
    pub fn push_signal(
        &self,
        call_id: &CallId,
        from: UserId,
        to: Option<UserId>,
        kind: SignalKind,
        signal_type: String,
        payload: Value,
    ) -> Result<SignalEnvelope, CcError> {
        let mut entry = self
            .entries
            .get_mut(call_id)
            .ok_or_else(|| CcError::NotFound(format!("no live session for {call_id}")))?;
        Ok(entry.signals.push(from, to, kind, signal_type, payload))
    }

    /// Append a signal only if `from`, and `to` when given, are members.
    /// The check and the push happen under the same entry guard, so a
    /// concurrent leave cannot slip a departed user's signal into the queue.
    ///
    /// # Errors
    ///
    /// `Unauthorized` naming the first user who is not a member. A call with
    /// no live entry has no members.
    pub fn push_signal_from_member(
        &self,
        call_id: &CallId,
        from: UserId,
        to: Option<UserId>,
        kind: SignalKind,
        signal_type: String,
        payload: Value,
    ) -> Result<SignalEnvelope, CcError> {
        let not_in_call =
            |user: UserId| CcError::Unauthorized(format!("user {user} is not in call {call_id}"));
        let mut entry = self.entries.get_mut(call_id).ok_or_else(|| not_in_call(from))?;
        if !entry.members.contains_key(&from) {
            return Err(not_in_call(from));
        }
        if let Some(target) = to {
            if !entry.members.contains_key(&target) {
                return Err(not_in_call(target));
            }
        }
        Ok(entry.signals.push(from, to, kind, signal_type, payload))
    }

    /// Queued signals a reconnecting user should see: addressed to them, or
    /// broadcast by someone else. Oldest first.
    #[must_use]
    pub fn recent_signals(&self, call_id: &CallId, user_id: UserId) -> Vec<SignalEnvelope> {
        self.entries
            .get(call_id)
            .map(|entry| {
                entry
                    .signals
                    .iter()
                    .filter(|s| match s.to {
                        Some(to) => to == user_id,
                        None => s.from != user_id,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of queued signals for a call.
    #[must_use]
    pub fn queued_signals(&self, call_id: &CallId) -> usize {
        self.entries
            .get(call_id)
            .map_or(0, |entry| entry.signals.len())
    }
}
