//! Suppression memory for canceled and timed-out call ids
//!
//! Decline/timeout may arrive before the matching incoming notification
//! because the two travel different delivery paths. Without a short memory of
//! abandoned call ids the UI would ring for an invitation the caller already
//! gave up on, with no later event to dismiss it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::CallId;

/// How long an abandoned call id keeps suppressing incoming events
const SUPPRESS_TTL: Duration = Duration::from_secs(10);

/// Short-lived memory of canceled and timed-out call ids
///
/// Entries older than [`SUPPRESS_TTL`] are evicted lazily on every call; there
/// is no background timer.
#[derive(Debug, Default)]
pub struct RaceGuard {
    inner: Mutex<GuardMaps>,
}

#[derive(Debug, Default)]
struct GuardMaps {
    canceled: HashMap<CallId, Instant>,
    timed_out: HashMap<CallId, Instant>,
}

impl RaceGuard {
    /// Create an empty guard
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that the caller canceled this id before it was answered
    pub fn mark_canceled(&self, call_id: &CallId) {
        let now = Instant::now();
        let mut maps = self.inner.lock();
        evict_expired(&mut maps.canceled, now, SUPPRESS_TTL);
        evict_expired(&mut maps.timed_out, now, SUPPRESS_TTL);
        maps.canceled.insert(call_id.clone(), now);
        tracing::debug!(call_id = %call_id, "marked call id canceled");
    }

    /// Remember that this id rang out without an answer
    pub fn mark_timed_out(&self, call_id: &CallId) {
        let now = Instant::now();
        let mut maps = self.inner.lock();
        evict_expired(&mut maps.canceled, now, SUPPRESS_TTL);
        evict_expired(&mut maps.timed_out, now, SUPPRESS_TTL);
        maps.timed_out.insert(call_id.clone(), now);
        tracing::debug!(call_id = %call_id, "marked call id timed out");
    }

    /// Whether events referencing this id must be dropped
    pub fn is_suppressed(&self, call_id: &CallId) -> bool {
        let now = Instant::now();
        let mut maps = self.inner.lock();
        evict_expired(&mut maps.canceled, now, SUPPRESS_TTL);
        evict_expired(&mut maps.timed_out, now, SUPPRESS_TTL);
        let suppressed =
            maps.canceled.contains_key(call_id) || maps.timed_out.contains_key(call_id);
        if suppressed {
            tracing::trace!(call_id = %call_id, "call id is suppressed");
        }
        suppressed
    }

    /// Number of live entries across both maps, after eviction
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut maps = self.inner.lock();
        evict_expired(&mut maps.canceled, now, SUPPRESS_TTL);
        evict_expired(&mut maps.timed_out, now, SUPPRESS_TTL);
        maps.canceled.len() + maps.timed_out.len()
    }

    /// True when no id is currently suppressed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_expired(map: &mut HashMap<CallId, Instant>, now: Instant, ttl: Duration) {
    map.retain(|_, marked_at| now.duration_since(*marked_at) <= ttl);
}
