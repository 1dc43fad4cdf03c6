//! Wire protocol for the relayed signaling channel
//!
//! Events are typed tagged enums rather than string-keyed handler maps, so a
//! mis-registered handler is a compile error. Names and payload keys match the
//! relay protocol exactly; frames carry an optional correlation id when the
//! sender expects an acknowledgement.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CallId, IceCandidate, PeerId, RoomId, SessionDescription};

/// Wire encode/decode errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame could not be serialized
    #[error("failed to encode frame: {0}")]
    Encode(String),

    /// Frame could not be parsed
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

/// Profile fields carried by identity:attach
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    /// Display nickname
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nick: Option<String>,
    /// Avatar reference understood by the host
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub avatar: Option<String>,
}

/// Events sent from the client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Start a call to a peer; acked with {ok, callId} or {ok:false, error}
    #[serde(rename = "call:initiate")]
    CallInitiate {
        /// Peer to ring
        to: PeerId,
    },

    /// Accept the invitation (fire-and-forget)
    #[serde(rename = "call:accept", rename_all = "camelCase")]
    CallAccept {
        /// Call being accepted
        call_id: CallId,
    },

    /// Decline the invitation (fire-and-forget)
    #[serde(rename = "call:decline", rename_all = "camelCase")]
    CallDecline {
        /// Call being declined
        call_id: CallId,
    },

    /// Abort our unanswered outgoing call (fire-and-forget)
    #[serde(rename = "call:cancel", rename_all = "camelCase")]
    CallCancel {
        /// Call being canceled
        call_id: CallId,
    },

    /// Relay a session description offer to the remote party
    #[serde(rename = "offer")]
    Offer {
        /// Destination peer
        to: PeerId,
        /// Opaque transport offer
        offer: SessionDescription,
    },

    /// Relay a session description answer to the remote party
    #[serde(rename = "answer")]
    Answer {
        /// Destination peer
        to: PeerId,
        /// Opaque transport answer
        answer: SessionDescription,
    },

    /// Relay an ICE candidate to the remote party
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Destination peer
        to: PeerId,
        /// Opaque transport candidate
        candidate: IceCandidate,
    },

    /// Out-of-band camera state, no renegotiation
    #[serde(rename = "cam-toggle", rename_all = "camelCase")]
    CamToggle {
        /// Room the signal applies to
        room_id: RoomId,
        /// New camera state
        enabled: bool,
    },

    /// Bind this connection to an installation; acked with {ok, userId}
    #[serde(rename = "identity:attach", rename_all = "camelCase")]
    IdentityAttach {
        /// Stable installation identifier from the host
        install_id: String,
        /// Profile fields to upsert
        profile: ProfileFields,
    },

    /// Lightweight re-authentication after reconnect; acked with {ok}
    #[serde(rename = "reauth", rename_all = "camelCase")]
    Reauth {
        /// Previously assigned user id
        user_id: String,
    },
}

impl ClientEvent {
    /// Wire name of the event, for logs and error messages
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallInitiate { .. } => "call:initiate",
            Self::CallAccept { .. } => "call:accept",
            Self::CallDecline { .. } => "call:decline",
            Self::CallCancel { .. } => "call:cancel",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CamToggle { .. } => "cam-toggle",
            Self::IdentityAttach { .. } => "identity:attach",
            Self::Reauth { .. } => "reauth",
        }
    }
}

/// Events pushed from the relay to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// A peer is calling us
    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    CallIncoming {
        /// Relay-minted call id
        call_id: CallId,
        /// Calling peer
        from: PeerId,
        /// Caller nickname, when the relay knows one
        #[serde(skip_serializing_if = "Option::is_none", default)]
        from_nick: Option<String>,
    },

    /// The callee accepted our call
    #[serde(rename = "call:accepted", rename_all = "camelCase")]
    CallAccepted {
        /// Call that was accepted
        call_id: CallId,
        /// Accepting peer
        from: PeerId,
    },

    /// The callee declined our call
    #[serde(rename = "call:declined", rename_all = "camelCase")]
    CallDeclined {
        /// Call that was declined
        call_id: CallId,
        /// Declining peer
        from: PeerId,
    },

    /// Relay-side ring timeout, delivered to both parties
    #[serde(rename = "call:timeout", rename_all = "camelCase")]
    CallTimeout {
        /// Call that timed out
        call_id: CallId,
    },

    /// The caller canceled before we answered
    #[serde(rename = "call:cancel", rename_all = "camelCase")]
    CallCancel {
        /// Call that was canceled
        call_id: CallId,
        /// Canceling peer
        from: PeerId,
    },

    /// The called peer is busy
    #[serde(rename = "call:busy")]
    CallBusy {
        /// Busy peer
        from: PeerId,
    },

    /// The matchmaking room is full
    #[serde(rename = "call:room_full", rename_all = "camelCase")]
    RoomFull {
        /// Relay-reported user id, when present
        #[serde(skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
    },

    /// A session description offer from the remote party
    #[serde(rename = "offer")]
    Offer {
        /// Originating peer
        from: PeerId,
        /// Opaque transport offer
        offer: SessionDescription,
    },

    /// A session description answer from the remote party
    #[serde(rename = "answer")]
    Answer {
        /// Originating peer
        from: PeerId,
        /// Opaque transport answer
        answer: SessionDescription,
    },

    /// An ICE candidate from the remote party
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Originating peer
        from: PeerId,
        /// Opaque transport candidate
        candidate: IceCandidate,
    },

    /// The remote party toggled their camera
    #[serde(rename = "cam-toggle", rename_all = "camelCase")]
    CamToggle {
        /// Room the signal applies to
        room_id: RoomId,
        /// New camera state
        enabled: bool,
    },
}

impl ServerEvent {
    /// Wire name of the event, for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallIncoming { .. } => "call:incoming",
            Self::CallAccepted { .. } => "call:accepted",
            Self::CallDeclined { .. } => "call:declined",
            Self::CallTimeout { .. } => "call:timeout",
            Self::CallCancel { .. } => "call:cancel",
            Self::CallBusy { .. } => "call:busy",
            Self::RoomFull { .. } => "call:room_full",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CamToggle { .. } => "cam-toggle",
        }
    }

    /// Call id the event refers to, when it carries one
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::CallIncoming { call_id, .. }
            | Self::CallAccepted { call_id, .. }
            | Self::CallDeclined { call_id, .. }
            | Self::CallTimeout { call_id }
            | Self::CallCancel { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// Acknowledgement payload answering a requested frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckBody {
    /// Whether the relay applied the request
    pub ok: bool,
    /// Call id minted for call:initiate
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub call_id: Option<CallId>,
    /// User id assigned by identity:attach
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
    /// Relay error string when ok is false
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl AckBody {
    /// Plain positive acknowledgement
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    /// Positive acknowledgement carrying a minted call id
    #[must_use]
    pub fn with_call_id(call_id: CallId) -> Self {
        Self {
            ok: true,
            call_id: Some(call_id),
            ..Self::default()
        }
    }

    /// Positive acknowledgement carrying the assigned user id
    #[must_use]
    pub fn with_user_id(user_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Negative acknowledgement with a relay error string
    #[must_use]
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Relay error string, or a placeholder when the relay sent none
    #[must_use]
    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or("unspecified relay error")
    }
}

/// Envelope for client-to-relay traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Correlation id, present when the sender awaits an acknowledgement
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ack: Option<u64>,
    /// The event being sent
    #[serde(flatten)]
    pub event: ClientEvent,
}

impl ClientFrame {
    /// Fire-and-forget frame
    #[must_use]
    pub fn fire(event: ClientEvent) -> Self {
        Self { ack: None, event }
    }

    /// Frame expecting an acknowledgement under the given correlation id
    #[must_use]
    pub fn requested(ack: u64, event: ClientEvent) -> Self {
        Self {
            ack: Some(ack),
            event,
        }
    }

    /// Serialize for the link
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if serialization fails
    pub fn to_bytes(&self) -> Result<Bytes, WireError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Parse from link bytes
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Decode`] if the bytes are not a valid frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(data).map_err(|e| WireError::Decode(e.to_string()))
    }
}

/// Envelope for relay-to-client traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Acknowledgement of a requested frame
    Ack(AckFrame),
    /// Pushed event
    Event(ServerEvent),
}

/// Acknowledgement envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    /// Correlation id being answered
    pub ack: u64,
    /// Acknowledgement payload
    #[serde(flatten)]
    pub body: AckBody,
}

impl ServerFrame {
    /// Acknowledgement frame
    #[must_use]
    pub fn ack(ack: u64, body: AckBody) -> Self {
        Self::Ack(AckFrame { ack, body })
    }

    /// Serialize for the link
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if serialization fails
    pub fn to_bytes(&self) -> Result<Bytes, WireError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Parse from link bytes
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Decode`] if the bytes are not a valid frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(data).map_err(|e| WireError::Decode(e.to_string()))
    }
}
