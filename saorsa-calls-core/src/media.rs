//! Black-box seams for media capture and transport
//!
//! The concrete transport (codecs, ICE, SDP internals) lives in the host. This
//! layer only relays opaque descriptions and candidates, swaps tracks, and
//! reacts to transport signals.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{IceCandidate, MediaConstraints, SessionDescription};

/// Media capture/transport errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Device capture failed
    #[error("capture failed: {0}")]
    Capture(String),

    /// A transport operation failed
    #[error("transport operation failed: {0}")]
    Transport(String),

    /// The transport was already closed
    #[error("transport is closed")]
    Closed,

    /// No local stream has been attached yet
    #[error("no local stream attached")]
    NoLocalStream,

    /// No remote stream has arrived yet
    #[error("no remote stream available")]
    NoRemoteStream,
}

/// Signals surfaced by a media transport instance
#[derive(Debug, Clone)]
pub enum MediaSignal {
    /// The transport gathered a local candidate to relay to the peer
    LocalCandidate(IceCandidate),
    /// The remote party's stream became playable
    RemoteStream(Arc<dyn RemoteMedia>),
    /// The transport lost connectivity without an end event
    Disconnected,
}

/// Host-provided factory for capture devices and transport instances
#[async_trait]
pub trait MediaRuntime: Send + Sync + fmt::Debug {
    /// Capture a local stream for the given constraints
    async fn capture_local(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, MediaError>;

    /// Construct a fresh transport instance
    async fn create_transport(&self) -> Result<Arc<dyn MediaSession>, MediaError>;
}

/// One negotiated transport instance
///
/// `replace_video_track` swaps the outgoing video in place; implementations
/// must not renegotiate for it; the remote party learns about camera state
/// through the out-of-band signal instead.
#[async_trait]
pub trait MediaSession: Send + Sync + fmt::Debug {
    /// Attach the local stream's tracks to the transport
    async fn attach_local(&self, stream: Arc<dyn LocalMedia>) -> Result<(), MediaError>;

    /// Produce an offer describing the local side
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Produce an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    /// Apply the remote party's description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    /// Apply a remote ICE candidate
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Replace the outgoing video track in place; `None` removes it
    async fn replace_video_track(
        &self,
        track: Option<Arc<dyn MediaTrack>>,
    ) -> Result<(), MediaError>;

    /// Subscribe to transport signals
    fn signals(&self) -> broadcast::Receiver<MediaSignal>;

    /// Close the transport and release its resources
    async fn close(&self);
}

/// A single sendable media track
pub trait MediaTrack: Send + Sync + fmt::Debug {
    /// Track identifier
    fn id(&self) -> &str;

    /// Enable or disable the track without removing it
    fn set_enabled(&self, enabled: bool);

    /// Current enabled state
    fn enabled(&self) -> bool;
}

/// Locally captured stream handle
#[async_trait]
pub trait LocalMedia: Send + Sync + fmt::Debug {
    /// Enable or disable the microphone track
    fn set_mic_enabled(&self, enabled: bool);

    /// Current microphone state
    fn mic_enabled(&self) -> bool;

    /// Current camera state
    fn video_enabled(&self) -> bool;

    /// Capture a fresh camera track for re-enabling video
    async fn renew_video_track(&self) -> Result<Arc<dyn MediaTrack>, MediaError>;

    /// Stop the current camera track
    fn stop_video(&self);

    /// Stop every captured track
    fn stop_all(&self);
}

/// Remote stream handle for local playback control
pub trait RemoteMedia: Send + Sync + fmt::Debug {
    /// Stream identifier
    fn id(&self) -> &str;

    /// Mute or unmute remote audio locally
    fn set_audio_enabled(&self, enabled: bool);

    /// Current remote-audio playback state
    fn audio_enabled(&self) -> bool;
}

// Trait objects cross task boundaries inside the session manager.
const _: () = {
    const fn assert_send_sync<T: Send + Sync + ?Sized>() {}
    assert_send_sync::<dyn MediaSession>();
    assert_send_sync::<dyn LocalMedia>();
    assert_send_sync::<dyn RemoteMedia>();
    assert_send_sync::<MediaSignal>();
};
