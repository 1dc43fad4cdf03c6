//! Identity attachment and re-authentication
//!
//! A device attaches once per install id and receives a relay-assigned user
//! id. Concurrent attach calls coalesce onto a single in-flight request and
//! all observe the same outcome. After every reconnect the manager replays a
//! lightweight re-authentication before call control is trusted again.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelError, LinkStatus, SignalingChannel};
use crate::wire::{ClientEvent, ProfileFields};

/// Identity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The relay refused the attach
    #[error("identity attach rejected: {0}")]
    Rejected(String),

    /// The signaling channel failed underneath us
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Result of a successful attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachGrant {
    /// Relay-assigned user id for this install
    pub user_id: String,
}

/// Authentication state of the current link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No attach has succeeded yet, or the last reauth was refused
    Unauthenticated,
    /// The link came back and re-authentication is in flight
    Reauthenticating,
    /// The relay trusts this connection
    Authenticated,
}

impl AuthState {
    /// True when call control may be used
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

type AttachFuture = Shared<BoxFuture<'static, Result<AttachGrant, IdentityError>>>;

/// Manages the install identity and its per-connection trust
pub struct IdentityManager {
    channel: Arc<SignalingChannel>,
    install_id: String,
    user_id: Mutex<Option<String>>,
    in_flight: Mutex<Option<AttachFuture>>,
    auth_tx: watch::Sender<AuthState>,
    started: AtomicBool,
}

impl IdentityManager {
    /// Create a manager for one install id
    #[must_use]
    pub fn new(channel: Arc<SignalingChannel>, install_id: impl Into<String>) -> Arc<Self> {
        let (auth_tx, _) = watch::channel(AuthState::Unauthenticated);
        Arc::new(Self {
            channel,
            install_id: install_id.into(),
            user_id: Mutex::new(None),
            in_flight: Mutex::new(None),
            auth_tx,
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the reconnect watcher; calling again is a no-op
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let mut status = self.channel.subscribe_status();
        tokio::spawn(async move {
            loop {
                if status.changed().await.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                match current {
                    LinkStatus::Connected => manager.reauthenticate().await,
                    LinkStatus::Offline | LinkStatus::Connecting => {
                        manager.suspend_trust();
                    }
                }
            }
        });
    }

    /// Attach this install to the relay and obtain a user id
    ///
    /// Concurrent calls join the request already in flight and resolve with
    /// identical results; the joining call's profile delta is not merged
    /// into the running request. A call made after the flight completed
    /// starts a fresh request.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Rejected`] when the relay refuses the
    /// attach, or a wrapped [`ChannelError`] when signaling fails
    pub async fn attach(
        self: &Arc<Self>,
        profile: ProfileFields,
    ) -> Result<AttachGrant, IdentityError> {
        let flight = {
            let mut slot = self.in_flight.lock();
            if let Some(flight) = slot.as_ref() {
                trace!("joining in-flight identity attach");
                flight.clone()
            } else {
                let flight = self.begin_attach(profile);
                *slot = Some(flight.clone());
                flight
            }
        };
        flight.await
    }

    /// Relay-assigned user id from the last successful attach
    pub fn user_id(&self) -> Option<String> {
        self.user_id.lock().clone()
    }

    /// Current authentication state
    pub fn auth_state(&self) -> AuthState {
        *self.auth_tx.borrow()
    }

    /// True when call control may be used on the current link
    pub fn is_authenticated(&self) -> bool {
        self.auth_state().is_authenticated()
    }

    /// Subscribe to authentication transitions
    pub fn subscribe_auth(&self) -> watch::Receiver<AuthState> {
        self.auth_tx.subscribe()
    }

    fn begin_attach(self: &Arc<Self>, profile: ProfileFields) -> AttachFuture {
        let manager = Arc::clone(self);
        async move {
            let result = manager.perform_attach(profile).await;
            *manager.in_flight.lock() = None;
            result
        }
        .boxed()
        .shared()
    }

    async fn perform_attach(&self, profile: ProfileFields) -> Result<AttachGrant, IdentityError> {
        debug!(install_id = %self.install_id, "attaching identity");
        let ack = self
            .channel
            .request(
                ClientEvent::IdentityAttach {
                    install_id: self.install_id.clone(),
                    profile,
                },
                None,
                None,
            )
            .await?;
        if !ack.ok {
            let reason = ack.error_text().to_string();
            warn!(reason = %reason, "identity attach rejected");
            self.auth_tx.send_replace(AuthState::Unauthenticated);
            return Err(IdentityError::Rejected(reason));
        }
        let Some(user_id) = ack.user_id else {
            return Err(IdentityError::Rejected(
                "attach acknowledgement carried no user id".to_string(),
            ));
        };
        *self.user_id.lock() = Some(user_id.clone());
        self.auth_tx.send_replace(AuthState::Authenticated);
        info!(user_id = %user_id, "identity attached");
        Ok(AttachGrant { user_id })
    }

    async fn reauthenticate(&self) {
        let Some(user_id) = self.user_id.lock().clone() else {
            // First connect, nothing to replay until attach runs.
            return;
        };
        self.auth_tx.send_replace(AuthState::Reauthenticating);
        debug!(user_id = %user_id, "re-authenticating after reconnect");
        match self
            .channel
            .request(ClientEvent::Reauth { user_id }, None, None)
            .await
        {
            Ok(ack) if ack.ok => {
                self.auth_tx.send_replace(AuthState::Authenticated);
                info!("re-authentication accepted");
            }
            Ok(ack) => {
                warn!(reason = ack.error_text(), "re-authentication rejected");
                self.auth_tx.send_replace(AuthState::Unauthenticated);
            }
            Err(e) => {
                warn!(error = %e, "re-authentication failed");
                self.auth_tx.send_replace(AuthState::Unauthenticated);
            }
        }
    }

    fn suspend_trust(&self) {
        if self.auth_tx.borrow().is_authenticated() {
            self.auth_tx.send_replace(AuthState::Reauthenticating);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::memory::MemoryRelay;
    use crate::types::PeerId;
    use pretty_assertions::assert_eq;

    fn harness(relay: &MemoryRelay, peer: &str) -> (Arc<SignalingChannel>, Arc<IdentityManager>) {
        let transport = relay.transport(PeerId::new(peer));
        let channel = SignalingChannel::new(transport, ChannelConfig::default());
        channel.connect();
        let identity = IdentityManager::new(Arc::clone(&channel), format!("install-{peer}"));
        identity.start();
        (channel, identity)
    }

    fn attach_count(relay: &MemoryRelay, peer: &str) -> usize {
        relay
            .sent_by(&PeerId::new(peer))
            .iter()
            .filter(|e| e.name() == "identity:attach")
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_attaches_coalesce_to_one_request() {
        let relay = MemoryRelay::new();
        let (_channel, identity) = harness(&relay, "alice");

        let (a, b, c, d) = tokio::join!(
            identity.attach(ProfileFields::default()),
            identity.attach(ProfileFields::default()),
            identity.attach(ProfileFields::default()),
            identity.attach(ProfileFields::default()),
        );
        let grant = a.unwrap();
        assert_eq!(b.unwrap(), grant);
        assert_eq!(c.unwrap(), grant);
        assert_eq!(d.unwrap(), grant);
        assert_eq!(attach_count(&relay, "alice"), 1);
        assert!(identity.is_authenticated());
        assert_eq!(identity.user_id(), Some(grant.user_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_attaches_start_fresh_requests() {
        let relay = MemoryRelay::new();
        let (_channel, identity) = harness(&relay, "alice");

        identity.attach(ProfileFields::default()).await.unwrap();
        identity.attach(ProfileFields::default()).await.unwrap();
        assert_eq!(attach_count(&relay, "alice"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_attach_leaves_unauthenticated() {
        let relay = MemoryRelay::new();
        relay.refuse_attach(&PeerId::new("alice"), true);
        let (_channel, identity) = harness(&relay, "alice");

        let err = identity.attach(ProfileFields::default()).await.unwrap_err();
        assert!(matches!(err, IdentityError::Rejected(_)));
        assert!(!identity.is_authenticated());
        assert_eq!(identity.user_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reauth_replayed_after_reconnect() {
        let relay = MemoryRelay::new();
        let alice = PeerId::new("alice");
        let (channel, identity) = harness(&relay, "alice");

        let grant = identity.attach(ProfileFields::default()).await.unwrap();
        let mut auth = identity.subscribe_auth();

        relay.sever(&alice);
        auth.wait_for(|s| *s == AuthState::Reauthenticating)
            .await
            .unwrap();
        assert!(!identity.is_authenticated());

        auth.wait_for(AuthState::is_authenticated).await.unwrap();
        assert!(channel.status().is_connected());

        let reauths: Vec<_> = relay
            .sent_by(&alice)
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::Reauth { user_id } => Some(user_id),
                _ => None,
            })
            .collect();
        assert_eq!(reauths, vec![grant.user_id]);
    }
}
