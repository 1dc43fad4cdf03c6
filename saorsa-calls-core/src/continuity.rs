//! Picture-in-picture continuity for an active call
//!
//! The bridge is an explicit registry owned by the composition root, not an
//! ambient global. While the call screen is unmounted it keeps the call
//! controllable through weak handles: a `Weak<PeerSession>` for the toggles
//! and a `Weak<CallSessionManager>` for hangup, so tearing the bridge or its
//! slot down can never destroy the call itself.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, trace};

use crate::media::MediaError;
use crate::peer_session::PeerSession;
use crate::session::{CallError, CallSessionManager};
use crate::types::PartnerMeta;

/// Continuity errors
#[derive(Error, Debug)]
pub enum ContinuityError {
    /// No call is in picture-in-picture
    #[error("no call in picture-in-picture")]
    NotEntered,

    /// The call ended underneath the bridge
    #[error("the call is gone")]
    CallGone,

    /// A delegated media operation failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// A delegated call intent failed
    #[error(transparent)]
    Call(#[from] CallError),
}

struct PipSlot {
    partner: PartnerMeta,
    session: Weak<PeerSession>,
    entered_at: DateTime<Utc>,
}

/// Keeps an active call controllable while its UI is unmounted
#[derive(Default)]
pub struct ContinuityBridge {
    manager: Mutex<Weak<CallSessionManager>>,
    slot: Mutex<Option<PipSlot>>,
}

impl ContinuityBridge {
    /// Create a bridge with an empty slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the bridge to its manager; called once by the composition root
    pub fn bind(&self, manager: &Arc<CallSessionManager>) {
        *self.manager.lock() = Arc::downgrade(manager);
    }

    /// Park an active call in the slot as the call screen unmounts
    pub fn enter(&self, partner: PartnerMeta, session: &Arc<PeerSession>) {
        debug!(peer = %partner.peer, "entering picture-in-picture");
        *self.slot.lock() = Some(PipSlot {
            partner,
            session: Arc::downgrade(session),
            entered_at: Utc::now(),
        });
    }

    /// Clear the slot; idempotent, never touches the call
    pub fn exit(&self) {
        if self.slot.lock().take().is_some() {
            debug!("left picture-in-picture");
        }
    }

    /// Whether a call is currently parked here
    pub fn is_active(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// The parked call's partner and entry time
    pub fn snapshot(&self) -> Option<(PartnerMeta, DateTime<Utc>)> {
        self.slot
            .lock()
            .as_ref()
            .map(|slot| (slot.partner.clone(), slot.entered_at))
    }

    /// Flip the microphone on the parked call
    ///
    /// # Errors
    ///
    /// Returns [`ContinuityError::NotEntered`] with an empty slot,
    /// [`ContinuityError::CallGone`] when the session was torn down
    pub fn toggle_mic(&self) -> Result<bool, ContinuityError> {
        Ok(self.session()?.toggle_mic()?)
    }

    /// Flip local playback of remote audio on the parked call
    ///
    /// # Errors
    ///
    /// Returns [`ContinuityError::NotEntered`] with an empty slot,
    /// [`ContinuityError::CallGone`] when the session was torn down
    pub fn toggle_remote_audio(&self) -> Result<bool, ContinuityError> {
        Ok(self.session()?.toggle_remote_audio()?)
    }

    /// Leave the slot and hand the partner back for remounting the screen
    ///
    /// # Errors
    ///
    /// Returns [`ContinuityError::NotEntered`] with an empty slot
    pub fn return_to_call(&self) -> Result<PartnerMeta, ContinuityError> {
        let slot = self.slot.lock().take().ok_or(ContinuityError::NotEntered)?;
        debug!(peer = %slot.partner.peer, "returning to call screen");
        Ok(slot.partner)
    }

    /// End the parked call through the manager
    ///
    /// # Errors
    ///
    /// Returns [`ContinuityError::NotEntered`] with an empty slot,
    /// [`ContinuityError::CallGone`] when the manager is gone, or the
    /// delegated hangup failure
    pub async fn end_call(&self) -> Result<(), ContinuityError> {
        if !self.is_active() {
            return Err(ContinuityError::NotEntered);
        }
        let manager = self
            .manager
            .lock()
            .upgrade()
            .ok_or(ContinuityError::CallGone)?;
        // hangup() calls back into exit(); the slot clears either way.
        let result = manager.hangup().await;
        self.exit();
        result.map_err(ContinuityError::from)
    }

    fn session(&self) -> Result<Arc<PeerSession>, ContinuityError> {
        let slot = self.slot.lock();
        let slot = slot.as_ref().ok_or(ContinuityError::NotEntered)?;
        match slot.session.upgrade() {
            Some(session) => Ok(session),
            None => {
                trace!("parked session already dropped");
                Err(ContinuityError::CallGone)
            }
        }
    }
}
