//! Suspicious-activity tracking and temporary client blocks.
//!
//! - **Activity log** (`ActivityLog`): global, time-ordered record of
//!   suspicious events. Only events younger than the block duration count
//!   toward a client's threshold, and every append prunes older events for
//!   all clients.
//! - **Block list** (`BlockList`): clients rejected outright until their
//!   deadline. Deadlines are checked lazily on every lookup; the periodic
//!   sweep only reclaims memory.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// One suspicious event
#[derive(Debug, Clone)]
pub struct SuspiciousActivity {
    /// Client the event is attributed to
    pub client: String,
    /// Human-readable description
    pub reason: String,
    /// Monotonic time used for windowing
    pub at: Instant,
    /// Wall-clock time for display
    pub recorded_at: DateTime<Utc>,
}

/// Append-only (except pruning) log of suspicious events
#[derive(Debug)]
pub(crate) struct ActivityLog {
    events: Mutex<VecDeque<SuspiciousActivity>>,
    recent_window: Duration,
}

impl ActivityLog {
    pub(crate) fn new(recent_window: Duration) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            recent_window,
        }
    }

    /// Append an event and return how many recent events `client` now has.
    ///
    /// Prunes every client's events older than the recent window.
    pub(crate) fn record_at(&self, client: &str, reason: String, now: Instant) -> usize {
        let mut events = self.events.lock();
        events.push_back(SuspiciousActivity {
            client: client.to_string(),
            reason,
            at: now,
            recorded_at: Utc::now(),
        });

        let recent = events
            .iter()
            .filter(|event| event.client == client && self.is_recent(event, now))
            .count();

        events.retain(|event| self.is_recent(event, now));
        recent
    }

    fn is_recent(&self, event: &SuspiciousActivity, now: Instant) -> bool {
        now.saturating_duration_since(event.at) < self.recent_window
    }

    /// Drop events outside the recent window
    pub(crate) fn prune_at(&self, now: Instant) -> usize {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|event| self.is_recent(event, now));
        before - events.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Snapshot of events attributed to `client`, oldest first
    pub(crate) fn for_client(&self, client: &str) -> Vec<SuspiciousActivity> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.client == client)
            .cloned()
            .collect()
    }
}

/// A currently blocked client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedClient {
    /// Client identifier (usually an IP address)
    pub client: String,
    /// Whole seconds until the block lifts, rounded up
    pub remaining_secs: u64,
}

/// Clients rejected until a deadline
#[derive(Debug)]
pub(crate) struct BlockList {
    /// Client -> instant the block lifts
    blocked: DashMap<String, Instant>,
    duration: Duration,
}

impl BlockList {
    pub(crate) fn new(duration: Duration) -> Self {
        Self {
            blocked: DashMap::new(),
            duration,
        }
    }

    /// Block `client` until `now + duration`.
    ///
    /// Idempotent while the block is active: the original deadline stands.
    /// Returns `true` when this call started a new block.
    pub(crate) fn block_at(&self, client: &str, now: Instant) -> bool {
        let until = now + self.duration;
        let started = match self.blocked.entry(client.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(until);
                true
            }
            Entry::Occupied(mut slot) if *slot.get() <= now => {
                slot.insert(until);
                true
            }
            Entry::Occupied(_) => false,
        };

        if started {
            warn!(
                client,
                duration_secs = self.duration.as_secs(),
                "Client blocked due to suspicious activity"
            );
        }
        started
    }

    /// Whether `client` is blocked at `now`; an elapsed block is removed
    pub(crate) fn is_blocked_at(&self, client: &str, now: Instant) -> bool {
        let Some(deadline) = self.blocked.get(client).map(|d| *d) else {
            return false;
        };
        if now < deadline {
            return true;
        }
        if self
            .blocked
            .remove_if(client, |_, deadline| *deadline <= now)
            .is_some()
        {
            info!(client, "Client unblocked");
        }
        false
    }

    /// Lift a block early. Returns `true` if one was active.
    pub(crate) fn unblock(&self, client: &str) -> bool {
        let removed = self.blocked.remove(client).is_some();
        if removed {
            info!(client, "Client unblocked by operator");
        }
        removed
    }

    /// Drop elapsed blocks
    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let before = self.blocked.len();
        self.blocked.retain(|_, deadline| now < *deadline);
        before.saturating_sub(self.blocked.len())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.blocked.len()
    }

    /// Number of blocks active at `now`
    pub(crate) fn active_at(&self, now: Instant) -> usize {
        self.blocked.iter().filter(|entry| now < *entry.value()).count()
    }

    /// Snapshot of active blocks, sorted by client
    pub(crate) fn snapshot_at(&self, now: Instant) -> Vec<BlockedClient> {
        let mut clients: Vec<BlockedClient> = self
            .blocked
            .iter()
            .filter(|entry| now < *entry.value())
            .map(|entry| {
                let remaining = entry.value().saturating_duration_since(now);
                BlockedClient {
                    client: entry.key().clone(),
                    remaining_secs: ceil_secs(remaining),
                }
            })
            .collect();
        clients.sort_by(|a, b| a.client.cmp(&b.client));
        clients
    }
}

/// Whole seconds, rounded up
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    #[test]
    fn record_counts_only_this_clients_recent_events() {
        let log = ActivityLog::new(WINDOW);
        let t0 = Instant::now();

        assert_eq!(log.record_at("a", "x".into(), t0), 1);
        assert_eq!(log.record_at("b", "x".into(), t0), 1);
        assert_eq!(log.record_at("a", "y".into(), t0 + Duration::from_secs(1)), 2);
        assert_eq!(log.for_client("a").len(), 2);
    }

    #[test]
    fn record_prunes_old_events_of_every_client() {
        let log = ActivityLog::new(WINDOW);
        let t0 = Instant::now();
        log.record_at("a", "old".into(), t0);
        log.record_at("b", "old".into(), t0);

        let later = t0 + WINDOW;
        assert_eq!(log.record_at("c", "new".into(), later), 1);
        assert_eq!(log.len(), 1);
        assert!(log.for_client("a").is_empty());
    }

    #[test]
    fn prune_keeps_events_inside_window() {
        let log = ActivityLog::new(WINDOW);
        let t0 = Instant::now();
        log.record_at("a", "one".into(), t0);
        log.record_at("a", "two".into(), t0 + Duration::from_secs(60));

        assert_eq!(log.prune_at(t0 + WINDOW), 1);
        assert_eq!(log.for_client("a")[0].reason, "two");
    }

    #[test]
    fn block_lifts_at_deadline() {
        let blocks = BlockList::new(WINDOW);
        let t0 = Instant::now();

        assert!(blocks.block_at("a", t0));
        assert!(blocks.is_blocked_at("a", t0 + WINDOW - Duration::from_millis(1)));
        assert!(!blocks.is_blocked_at("a", t0 + WINDOW));
        assert_eq!(blocks.active_at(t0), 0);
    }

    #[test]
    fn reblocking_active_client_keeps_deadline() {
        let blocks = BlockList::new(WINDOW);
        let t0 = Instant::now();
        blocks.block_at("a", t0);

        assert!(!blocks.block_at("a", t0 + Duration::from_secs(600)));
        assert!(!blocks.is_blocked_at("a", t0 + WINDOW));
    }

    #[test]
    fn expired_block_can_be_renewed() {
        let blocks = BlockList::new(WINDOW);
        let t0 = Instant::now();
        blocks.block_at("a", t0);

        let later = t0 + WINDOW + Duration::from_secs(1);
        assert!(blocks.block_at("a", later));
        assert!(blocks.is_blocked_at("a", later + Duration::from_secs(1)));
    }

    #[test]
    fn snapshot_rounds_remaining_up() {
        let blocks = BlockList::new(Duration::from_secs(10));
        let t0 = Instant::now();
        blocks.block_at("b", t0);
        blocks.block_at("a", t0);

        let snapshot = blocks.snapshot_at(t0 + Duration::from_millis(500));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].client, "a");
        assert_eq!(snapshot[0].remaining_secs, 10);
    }

    #[test]
    fn sweep_and_unblock_remove_entries() {
        let blocks = BlockList::new(Duration::from_secs(10));
        let t0 = Instant::now();
        blocks.block_at("a", t0);
        blocks.block_at("b", t0 + Duration::from_secs(5));

        assert_eq!(blocks.sweep_at(t0 + Duration::from_secs(10)), 1);
        assert!(blocks.unblock("b"));
        assert!(!blocks.unblock("b"));
    }

    #[test]
    fn ceil_secs_rounds_partial_seconds_up() {
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::from_millis(2001)), 3);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }
}
