//! Exclusive signaling-handler ownership between session types
//!
//! Direct and matchmaking sessions share one set of offer/answer/ICE events.
//! Exactly one session holds the routing slot at a time; a session constructed
//! while the slot is held stays unbound and never steals the handlers. The
//! holder releases on cleanup, or at the latest when its token drops.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::SessionType;

/// Central registry for the single offer/answer/ICE routing slot
#[derive(Debug, Default)]
pub struct SignalingOwnership {
    slot: Mutex<Option<SessionType>>,
}

impl SignalingOwnership {
    /// Create a registry with a free slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to bind the slot to a session type
    ///
    /// Returns `None` when the slot is already held; the current holder stays
    /// authoritative until it releases.
    pub fn acquire(self: &Arc<Self>, session_type: SessionType) -> Option<OwnershipToken> {
        let mut slot = self.slot.lock();
        if let Some(holder) = *slot {
            tracing::warn!(
                requested = %session_type,
                holder = %holder,
                "signaling ownership already bound, not stealing"
            );
            return None;
        }
        *slot = Some(session_type);
        tracing::debug!(session_type = %session_type, "signaling ownership bound");
        Some(OwnershipToken {
            registry: Arc::clone(self),
            owner: session_type,
            released: AtomicBool::new(false),
        })
    }

    /// Session type currently bound, if any
    pub fn bound(&self) -> Option<SessionType> {
        *self.slot.lock()
    }

    /// Number of bound handler sets, 0 or 1
    pub fn handler_count(&self) -> usize {
        usize::from(self.slot.lock().is_some())
    }

    fn release(&self, owner: SessionType) {
        let mut slot = self.slot.lock();
        if *slot == Some(owner) {
            *slot = None;
            tracing::debug!(session_type = %owner, "signaling ownership released");
        }
    }
}

/// Releasable proof of holding the routing slot
#[derive(Debug)]
pub struct OwnershipToken {
    registry: Arc<SignalingOwnership>,
    owner: SessionType,
    released: AtomicBool,
}

impl OwnershipToken {
    /// Session type this token binds
    #[must_use]
    pub fn owner(&self) -> SessionType {
        self.owner
    }

    /// Release the slot; idempotent
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.registry.release(self.owner);
        }
    }
}

impl Drop for OwnershipToken {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_second_session_type_does_not_steal() {
        let registry = Arc::new(SignalingOwnership::new());

        let direct = registry.acquire(SessionType::Direct);
        assert!(direct.is_some());
        assert_eq!(registry.handler_count(), 1);
        assert_eq!(registry.bound(), Some(SessionType::Direct));

        let matchmaking = registry.acquire(SessionType::Matchmaking);
        assert!(matchmaking.is_none());
        assert_eq!(registry.handler_count(), 1);
        assert_eq!(registry.bound(), Some(SessionType::Direct));

        direct.unwrap().release();
        assert_eq!(registry.handler_count(), 0);
        assert_eq!(registry.bound(), None);
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = Arc::new(SignalingOwnership::new());
        let token = registry.acquire(SessionType::Matchmaking).unwrap();

        token.release();
        token.release();
        assert_eq!(registry.handler_count(), 0);

        // A stale double-release must not evict a fresh holder.
        let fresh = registry.acquire(SessionType::Direct).unwrap();
        token.release();
        assert_eq!(registry.bound(), Some(SessionType::Direct));
        fresh.release();
    }

    #[test]
    fn test_drop_releases_slot() {
        let registry = Arc::new(SignalingOwnership::new());
        {
            let _token = registry.acquire(SessionType::Direct).unwrap();
            assert_eq!(registry.handler_count(), 1);
        }
        assert_eq!(registry.handler_count(), 0);
        assert!(registry.acquire(SessionType::Matchmaking).is_some());
    }

    #[test]
    fn test_same_type_is_still_exclusive() {
        let registry = Arc::new(SignalingOwnership::new());
        let first = registry.acquire(SessionType::Direct).unwrap();
        assert!(registry.acquire(SessionType::Direct).is_none());
        first.release();
        assert!(registry.acquire(SessionType::Direct).is_some());
    }
}
