//! Missed-call accounting backed by the host's key-value store
//!
//! Cancel, relay timeout, and the local ring fallback can all try to record
//! the same missed occurrence. A single in-memory resolution marker per call
//! id is consumed exactly once; whoever consumes it performs the increment,
//! everyone else sees an already-resolved occurrence.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{CallId, PeerId};

const COUNT_KEY_PREFIX: &str = "missed:count:";
const LAST_PEER_KEY: &str = "missed:last_peer";

/// Key-value store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// The host backend failed
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored counter is not a number
    #[error("stored value for {key} is not a counter: {value}")]
    Corrupt {
        /// Key holding the value
        key: String,
        /// Offending value
        value: String,
    },
}

/// Host-provided persistent key-value store
#[async_trait]
pub trait KvStore: Send + Sync + fmt::Debug {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a value
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Per-peer missed-call counters with at-most-once occurrence resolution
#[derive(Debug)]
pub struct MissedCallLedger {
    store: Arc<dyn KvStore>,
    pending: Mutex<HashMap<CallId, PeerId>>,
}

impl MissedCallLedger {
    /// Create a ledger over the host store
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Arm the resolution marker when an invitation starts ringing
    pub fn arm(&self, call_id: CallId, peer: PeerId) {
        tracing::debug!(call_id = %call_id, peer = %peer, "armed missed-call marker");
        self.pending.lock().insert(call_id, peer);
    }

    /// Consume the marker without counting (accept or explicit decline)
    pub fn disarm(&self, call_id: &CallId) -> Option<PeerId> {
        let peer = self.pending.lock().remove(call_id);
        if let Some(peer) = &peer {
            tracing::debug!(call_id = %call_id, peer = %peer, "disarmed missed-call marker");
        }
        peer
    }

    /// Resolve the occurrence as missed, incrementing the peer's count
    ///
    /// Returns `None` when the marker was already consumed; the marker is
    /// consumed even if persistence then fails, keeping the occurrence
    /// at-most-once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the host store fails
    pub async fn resolve_missed(
        &self,
        call_id: &CallId,
    ) -> Result<Option<(PeerId, u32)>, StoreError> {
        let Some(peer) = self.pending.lock().remove(call_id) else {
            tracing::trace!(call_id = %call_id, "missed occurrence already resolved");
            return Ok(None);
        };

        let count = self.count_for(&peer).await?.saturating_add(1);
        self.store
            .put(&count_key(&peer), &count.to_string())
            .await?;
        self.store.put(LAST_PEER_KEY, peer.as_str()).await?;
        tracing::info!(call_id = %call_id, peer = %peer, count, "recorded missed call");
        Ok(Some((peer, count)))
    }

    /// Current persisted count for a peer
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the host store fails or holds a non-counter
    pub async fn count_for(&self, peer: &PeerId) -> Result<u32, StoreError> {
        let key = count_key(peer);
        match self.store.get(&key).await? {
            None => Ok(0),
            Some(value) => value.parse().map_err(|_| StoreError::Corrupt { key, value }),
        }
    }

    /// Reset a peer's count to zero, used when a call with them connects
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the host store fails
    pub async fn reset(&self, peer: &PeerId) -> Result<(), StoreError> {
        self.store.remove(&count_key(peer)).await
    }

    /// Peer recorded by the most recent missed occurrence
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the host store fails
    pub async fn last_missed_from(&self) -> Result<Option<PeerId>, StoreError> {
        Ok(self.store.get(LAST_PEER_KEY).await?.map(PeerId::from))
    }

    /// Whether a marker is currently armed for this call id
    pub fn is_armed(&self, call_id: &CallId) -> bool {
        self.pending.lock().contains_key(call_id)
    }
}

fn count_key(peer: &PeerId) -> String {
    format!("{COUNT_KEY_PREFIX}{peer}")
}
