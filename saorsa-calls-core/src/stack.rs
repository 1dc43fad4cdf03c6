//! Composition root wiring the call stack together

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use crate::channel::{ChannelConfig, LinkTransport, SignalingChannel};
use crate::continuity::ContinuityBridge;
use crate::identity::{AttachGrant, IdentityError, IdentityManager};
use crate::media::MediaRuntime;
use crate::missed::{KvStore, MissedCallLedger};
use crate::ownership::SignalingOwnership;
use crate::session::{CallError, CallSessionManager, NavigationHook, SessionConfig};
use crate::types::SessionEvent;
use crate::wire::ProfileFields;

/// Stack construction errors
#[derive(Error, Debug)]
pub enum StackError {
    /// A required collaborator was not provided
    #[error("missing collaborator: {0}")]
    Missing(&'static str),

    /// Starting the manager failed
    #[error(transparent)]
    Call(#[from] CallError),
}

/// Builder for [`CallStack`]
///
/// The host provides the outward seams (link transport, key-value store,
/// media runtime) and optionally a navigation hook and tuned configs.
#[derive(Default)]
pub struct CallStackBuilder {
    transport: Option<Arc<dyn LinkTransport>>,
    store: Option<Arc<dyn KvStore>>,
    runtime: Option<Arc<dyn MediaRuntime>>,
    navigation: Option<Arc<dyn NavigationHook>>,
    install_id: Option<String>,
    channel_config: ChannelConfig,
    session_config: SessionConfig,
}

impl CallStackBuilder {
    /// Start an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self {
            channel_config: ChannelConfig::default(),
            session_config: SessionConfig::default(),
            ..Self::default()
        }
    }

    /// Link transport to the relay
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn LinkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Persistent key-value store for the missed-call ledger
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Media capture and transport factory
    #[must_use]
    pub fn media_runtime(mut self, runtime: Arc<dyn MediaRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Navigation hook notified on call-screen transitions
    #[must_use]
    pub fn navigation(mut self, hook: Arc<dyn NavigationHook>) -> Self {
        self.navigation = Some(hook);
        self
    }

    /// Stable installation identifier for identity attachment
    #[must_use]
    pub fn install_id(mut self, install_id: impl Into<String>) -> Self {
        self.install_id = Some(install_id.into());
        self
    }

    /// Override the channel configuration
    #[must_use]
    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    /// Override the session configuration
    #[must_use]
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Wire everything together
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Missing`] when a required collaborator was not
    /// provided
    pub fn build(self) -> Result<CallStack, StackError> {
        let transport = self.transport.ok_or(StackError::Missing("transport"))?;
        let store = self.store.ok_or(StackError::Missing("store"))?;
        let runtime = self.runtime.ok_or(StackError::Missing("media runtime"))?;
        let install_id = self.install_id.ok_or(StackError::Missing("install id"))?;

        let channel = SignalingChannel::new(transport, self.channel_config);
        let identity = IdentityManager::new(Arc::clone(&channel), install_id);
        let ledger = Arc::new(MissedCallLedger::new(store));
        let ownership = Arc::new(SignalingOwnership::new());
        let continuity = Arc::new(ContinuityBridge::new());
        let manager = CallSessionManager::new(
            Arc::clone(&channel),
            Arc::clone(&identity),
            runtime,
            Arc::clone(&ledger),
            Arc::clone(&ownership),
            Arc::clone(&continuity),
            self.navigation,
            self.session_config,
        );

        Ok(CallStack {
            channel,
            identity,
            ledger,
            ownership,
            continuity,
            manager,
        })
    }
}

/// The assembled call stack
pub struct CallStack {
    channel: Arc<SignalingChannel>,
    identity: Arc<IdentityManager>,
    ledger: Arc<MissedCallLedger>,
    ownership: Arc<SignalingOwnership>,
    continuity: Arc<ContinuityBridge>,
    manager: Arc<CallSessionManager>,
}

impl std::fmt::Debug for CallStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStack").finish_non_exhaustive()
    }
}

impl CallStack {
    /// Start a builder
    #[must_use]
    pub fn builder() -> CallStackBuilder {
        CallStackBuilder::new()
    }

    /// Connect the channel and start identity and dispatch
    ///
    /// # Errors
    ///
    /// Returns [`StackError`] when the manager was already started
    pub fn start(&self) -> Result<(), StackError> {
        info!("starting call stack");
        self.channel.connect();
        self.identity.start();
        self.manager.start()?;
        Ok(())
    }

    /// Attach this install's identity to the relay
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] when the relay refuses or signaling fails
    pub async fn attach(&self, profile: ProfileFields) -> Result<AttachGrant, IdentityError> {
        self.identity.attach(profile).await
    }

    /// Subscribe to the typed UI event bus
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.manager.subscribe_events()
    }

    /// The signaling channel
    #[must_use]
    pub fn channel(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    /// The identity manager
    #[must_use]
    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.identity
    }

    /// The missed-call ledger
    #[must_use]
    pub fn ledger(&self) -> &Arc<MissedCallLedger> {
        &self.ledger
    }

    /// The signaling ownership registry
    #[must_use]
    pub fn ownership(&self) -> &Arc<SignalingOwnership> {
        &self.ownership
    }

    /// The continuity bridge
    #[must_use]
    pub fn continuity(&self) -> &Arc<ContinuityBridge> {
        &self.continuity
    }

    /// The session manager
    #[must_use]
    pub fn manager(&self) -> &Arc<CallSessionManager> {
        &self.manager
    }

    /// Stop the channel driver; live calls end with the link
    pub fn shutdown(&self) {
        info!("shutting down call stack");
        self.channel.shutdown();
    }
}
