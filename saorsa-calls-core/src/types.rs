//! Core call types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::media::RemoteMedia;

/// Opaque call identifier, minted by the relay on initiate
///
/// At most one call id is live per session at a time. The relay guarantees
/// uniqueness per attempt; this layer never inspects the contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Create a call id from its wire representation
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Relay-assigned peer identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a peer id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Room identifier used for negotiation-adjacent signals
///
/// Direct calls reuse the call id as the room id; matchmaking rooms carry
/// their own id assigned by the matchmaking flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    /// Create a room id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&CallId> for RoomId {
    fn from(id: &CallId) -> Self {
        Self(id.0.clone())
    }
}

/// Call lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call in progress
    Idle,
    /// Outgoing initiate sent, awaiting the relay ack
    Dialing,
    /// Remote party is being rung
    RingingOut,
    /// An incoming invitation is being shown
    RingingIn,
    /// Offer/answer/ICE exchange in progress
    Negotiating,
    /// Media session established
    Active,
    /// Teardown in progress
    Ending,
}

impl CallPhase {
    /// True when no call occupies the session
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// True while an invitation or dial is unresolved
    #[must_use]
    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Dialing | Self::RingingOut | Self::RingingIn)
    }

    /// True once media negotiation has begun
    #[must_use]
    pub fn is_in_call(&self) -> bool {
        matches!(self, Self::Negotiating | Self::Active)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::RingingOut => "ringing-out",
            Self::RingingIn => "ringing-in",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Ending => "ending",
        };
        write!(f, "{}", s)
    }
}

/// Direction of the current call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We initiated
    Outgoing,
    /// The remote party initiated
    Incoming,
}

/// Concrete session type competing for signaling-handler ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    /// Direct friend call
    Direct,
    /// Anonymous matchmaking call
    Matchmaking,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Matchmaking => write!(f, "matchmaking"),
        }
    }
}

/// Displayable facts about the remote party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerMeta {
    /// Relay id of the partner
    pub peer: PeerId,
    /// Display nickname, when the relay supplied one
    pub nick: Option<String>,
}

impl PartnerMeta {
    /// Create partner metadata
    pub fn new(peer: PeerId, nick: Option<String>) -> Self {
        Self { peer, nick }
    }
}

/// Opaque session description produced and consumed by the media transport
///
/// The orchestration layer relays this blob between the signaling channel and
/// the transport without interpreting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription(pub serde_json::Value);

impl SessionDescription {
    /// Wrap a transport-produced description
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Opaque ICE candidate, relayed without interpretation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate(pub serde_json::Value);

impl IceCandidate {
    /// Wrap a transport-produced candidate
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Requested local capture configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone audio
    pub audio: bool,
    /// Capture camera video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Audio and video call
    #[must_use]
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Why a call attempt left the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Torn down locally
    HungUp,
    /// The call was declined, by us or by the remote party
    Declined,
    /// The remote party canceled before we answered
    Canceled,
    /// Ring timeout, local fallback or relay notification
    TimedOut,
    /// The remote party is busy
    Busy,
    /// The relay refused the initiate
    InitiateFailed(String),
    /// Transport disconnect without an end event, grace elapsed
    TransportLost,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HungUp => write!(f, "hung up"),
            Self::Declined => write!(f, "declined"),
            Self::Canceled => write!(f, "canceled"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Busy => write!(f, "busy"),
            Self::InitiateFailed(e) => write!(f, "initiate failed: {}", e),
            Self::TransportLost => write!(f, "transport lost"),
        }
    }
}

/// Point-in-time view of the current call
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    /// Relay call id, absent while Dialing awaits the ack
    pub call_id: Option<CallId>,
    /// Remote party
    pub partner: PartnerMeta,
    /// Attempt direction
    pub direction: CallDirection,
    /// Current lifecycle phase
    pub phase: CallPhase,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When media was established, if it was
    pub connected_at: Option<DateTime<Utc>>,
}

/// Typed session events broadcast to the UI layer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The lifecycle phase changed
    PhaseChanged {
        /// Phase before the transition
        previous: CallPhase,
        /// Phase after the transition
        current: CallPhase,
    },
    /// An incoming invitation is being shown
    IncomingCall {
        /// Relay call id
        call_id: CallId,
        /// Calling peer
        from: PeerId,
        /// Caller nickname, when supplied
        nick: Option<String>,
    },
    /// The relay acked our initiate and the remote side is ringing
    OutgoingRinging {
        /// Relay call id
        call_id: CallId,
        /// Called peer
        to: PeerId,
    },
    /// Media negotiation completed
    CallConnected {
        /// Relay call id
        call_id: CallId,
        /// Remote party
        partner: PartnerMeta,
    },
    /// The call attempt left the session
    CallEnded {
        /// Relay call id, when one was assigned
        call_id: Option<CallId>,
        /// Terminal cause
        reason: EndReason,
    },
    /// A missed occurrence was recorded for a peer
    MissedCall {
        /// Peer whose count changed
        peer: PeerId,
        /// New persisted count
        count: u32,
    },
    /// The remote party toggled their camera
    RemoteCameraToggled {
        /// Room the signal applies to
        room_id: RoomId,
        /// New camera state
        enabled: bool,
    },
    /// The transport surfaced a remote stream
    RemoteStreamAdded {
        /// Playable remote stream handle
        stream: Arc<dyn RemoteMedia>,
    },
    /// The called peer is busy
    PeerBusy {
        /// Busy peer
        from: PeerId,
    },
    /// The matchmaking room is full, surfaced verbatim
    RoomFull {
        /// Relay-reported user id, when present
        user_id: Option<String>,
    },
}
