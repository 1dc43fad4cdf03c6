//! Saorsa Calls - call-session orchestration over a relayed signaling channel
//!
//! This library coordinates one-to-one calls between parties reachable only
//! through a relay. It provides:
//!
//! - **Race-resistant lifecycle**: a single state machine absorbs
//!   out-of-order and duplicate call-control events
//! - **Auto-reconnecting signaling**: acknowledged requests with retry and
//!   backoff over a pluggable duplex link
//! - **Identity reattachment**: coalesced attach and automatic reauth after
//!   every reconnect, gating call control
//! - **Exclusive handler ownership**: direct and matchmaking sessions share
//!   one set of negotiation events without double-handling
//! - **Picture-in-picture continuity**: an active call stays controllable
//!   while its UI is unmounted
//!
//! # Examples
//!
//! ```rust,no_run
//! use saorsa_calls_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     transport: Arc<dyn LinkTransport>,
//! #     store: Arc<dyn KvStore>,
//! #     runtime: Arc<dyn MediaRuntime>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let stack = CallStack::builder()
//!     .transport(transport)
//!     .store(store)
//!     .media_runtime(runtime)
//!     .install_id("install-1234")
//!     .build()?;
//! stack.start()?;
//!
//! stack.attach(ProfileFields::default()).await?;
//!
//! let mut events = stack.subscribe_events();
//! let call_id = stack
//!     .manager()
//!     .initiate_call(PeerId::new("friend"), None)
//!     .await?;
//! # let _ = (events.recv().await, call_id);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Wire protocol for the relayed signaling channel
pub mod wire;

/// Auto-reconnecting signaling channel
pub mod channel;

/// Identity attachment and re-authentication
pub mod identity;

/// Suppression memory for abandoned call ids
pub mod race_guard;

/// Exclusive signaling-handler ownership
pub mod ownership;

/// Black-box media capture and transport seams
pub mod media;

/// Per-call media session
pub mod peer_session;

/// Call lifecycle state machine
pub mod session;

/// Picture-in-picture continuity
pub mod continuity;

/// Missed-call accounting
pub mod missed;

/// In-process relay, store, and media harness
pub mod memory;

/// Composition root
pub mod stack;

pub use channel::{ChannelConfig, ChannelError, LinkStatus, LinkTransport, SignalingChannel};
pub use continuity::{ContinuityBridge, ContinuityError};
pub use identity::{AttachGrant, AuthState, IdentityError, IdentityManager};
pub use media::{MediaError, MediaRuntime, MediaSession};
pub use missed::{KvStore, MissedCallLedger, StoreError};
pub use ownership::{OwnershipToken, SignalingOwnership};
pub use peer_session::PeerSession;
pub use race_guard::RaceGuard;
pub use session::{CallError, CallSessionManager, NavigationHook, SessionConfig};
pub use stack::{CallStack, CallStackBuilder, StackError};
pub use types::{
    CallDirection, CallId, CallPhase, CallSnapshot, EndReason, MediaConstraints, PartnerMeta,
    PeerId, RoomId, SessionEvent, SessionType,
};
pub use wire::{ClientEvent, ProfileFields, ServerEvent};

/// Commonly used types
pub mod prelude {
    pub use crate::channel::{ChannelConfig, LinkStatus, LinkTransport, SignalingChannel};
    pub use crate::continuity::ContinuityBridge;
    pub use crate::media::{MediaRuntime, MediaSession};
    pub use crate::missed::KvStore;
    pub use crate::session::{CallError, CallSessionManager, SessionConfig};
    pub use crate::stack::{CallStack, CallStackBuilder};
    pub use crate::types::{
        CallId, CallPhase, EndReason, MediaConstraints, PartnerMeta, PeerId, SessionEvent,
        SessionType,
    };
    pub use crate::wire::ProfileFields;
}
