//! In-process counters for the actor system.
//!
//! A call actor's mailbox is considered backed up past 50 queued messages
//! and critical past 200. The controller reports the deepest call mailbox
//! as `cc_actor_mailbox_depth{actor_type="call"}` on every supervisor tick;
//! the monitors here only feed that gauge and the mailbox log lines.

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Queue depth bands for one kind of actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthBands {
    /// Highest depth still considered healthy.
    pub healthy_max: usize,
    /// Highest depth before the backlog is critical.
    pub backlog_max: usize,
}

const CALL_BANDS: DepthBands = DepthBands {
    healthy_max: 50,
    backlog_max: 200,
};

const CONTROLLER_BANDS: DepthBands = DepthBands {
    healthy_max: 100,
    backlog_max: 500,
};

/// Which actor a counter or log line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Controller,
    Call,
}

impl ActorType {
    /// Metric label value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Call => "call",
        }
    }

    #[must_use]
    pub const fn bands(&self) -> DepthBands {
        match self {
            Self::Controller => CONTROLLER_BANDS,
            Self::Call => CALL_BANDS,
        }
    }
}

/// Where a mailbox depth falls within its actor's [`DepthBands`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

impl DepthBands {
    #[must_use]
    pub const fn classify(&self, depth: usize) -> MailboxLevel {
        if depth > self.backlog_max {
            MailboxLevel::Critical
        } else if depth > self.healthy_max {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

fn decrement(counter: &AtomicUsize) {
    // A message sent before the monitor was shared was never counted in.
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
        Some(n.saturating_sub(1))
    });
}

/// Depth of one call actor's mailbox.
///
/// The handle counts a message in when it sends; the actor counts it out
/// once handled. A send that finds the mailbox closed counts it out as a
/// drop instead.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    owner: String,
    queued: AtomicUsize,
    high_water: AtomicUsize,
    handled: AtomicU64,
    dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, owner: impl Into<String>) -> Self {
        Self {
            actor_type,
            owner: owner.into(),
            queued: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            handled: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn record_enqueue(&self) {
        let depth = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_water.fetch_max(depth, Ordering::Relaxed);

        let bands = self.actor_type.bands();
        match bands.classify(depth) {
            MailboxLevel::Critical => warn!(
                target: "cc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                owner = %self.owner,
                depth,
                limit = bands.backlog_max,
                "Call mailbox backlog is critical"
            ),
            // Logged on the crossing only.
            MailboxLevel::Warning if depth == bands.healthy_max + 1 => debug!(
                target: "cc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                owner = %self.owner,
                depth,
                "Call mailbox backing up"
            ),
            _ => {}
        }
    }

    pub fn record_dequeue(&self) {
        decrement(&self.queued);
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        decrement(&self.queued);
        self.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "cc.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            owner = %self.owner,
            "Mailbox closed before the message was handled"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.actor_type.bands().classify(self.current_depth())
    }
}

/// Counters shared by the controller and every call actor it spawns.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub live_call_actors: AtomicUsize,
    pub panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn call_actor_spawned(&self) {
        self.live_call_actors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_actor_stopped(&self) {
        decrement(&self.live_call_actors);
    }

    /// A call actor task panicked. The call itself is left to the sweeper.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.panics.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "cc.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor task panicked"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn call_actor_count(&self) -> usize {
        self.live_call_actors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_label_values() {
        assert_eq!(ActorType::Controller.as_str(), "controller");
        assert_eq!(ActorType::Call.as_str(), "call");
    }

    #[test]
    fn test_band_boundaries() {
        let bands = ActorType::Call.bands();
        assert_eq!(bands.classify(50), MailboxLevel::Normal);
        assert_eq!(bands.classify(51), MailboxLevel::Warning);
        assert_eq!(bands.classify(200), MailboxLevel::Warning);
        assert_eq!(bands.classify(201), MailboxLevel::Critical);
        assert_eq!(ActorType::Controller.bands().classify(201), MailboxLevel::Warning);
    }

    #[test]
    fn test_depth_tracks_sends_and_handling() {
        let monitor = MailboxMonitor::new(ActorType::Call, "call_abc");
        for _ in 0..4 {
            monitor.record_enqueue();
        }
        monitor.record_dequeue();
        monitor.record_dequeue();

        assert_eq!(monitor.current_depth(), 2);
        assert_eq!(monitor.peak_depth(), 4);
        assert_eq!(monitor.messages_processed(), 2);
    }

    #[test]
    fn test_closed_mailbox_counts_drop_not_processed() {
        let monitor = MailboxMonitor::new(ActorType::Call, "call_abc");
        monitor.record_enqueue();
        monitor.record_drop();
        assert_eq!(monitor.current_depth(), 0);
        assert_eq!(monitor.messages_dropped(), 1);
        assert_eq!(monitor.messages_processed(), 0);
    }

    #[test]
    fn test_uncounted_dequeue_stays_at_zero() {
        let monitor = MailboxMonitor::new(ActorType::Call, "call_abc");
        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
    }

    #[test]
    fn test_level_follows_backlog() {
        let monitor = MailboxMonitor::new(ActorType::Call, "call_abc");
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);
        (0..120).for_each(|_| monitor.record_enqueue());
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);
        (0..120).for_each(|_| monitor.record_enqueue());
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_live_actor_count_and_panics() {
        let metrics = ActorMetrics::new();
        metrics.call_actor_spawned();
        metrics.call_actor_spawned();
        metrics.call_actor_stopped();
        assert_eq!(metrics.call_actor_count(), 1);
        metrics.call_actor_stopped();
        metrics.call_actor_stopped();
        assert_eq!(metrics.call_actor_count(), 0);

        metrics.record_panic(ActorType::Call);
        metrics.record_panic(ActorType::Call);
        assert_eq!(metrics.panic_count(), 2);
    }
}
