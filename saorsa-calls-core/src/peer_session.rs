//! One call's media lifecycle around the black-box transport
//!
//! A peer session owns exactly one transport instance for the whole call.
//! Remote ICE candidates that arrive before the remote description are
//! buffered per sending party and flushed once the description lands.
//! Toggling the camera swaps the outgoing video track in place and tells the
//! remote side out of band; the transport is never renegotiated for it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::channel::SignalingChannel;
use crate::media::{
    LocalMedia, MediaError, MediaRuntime, MediaSession, MediaSignal, RemoteMedia,
};
use crate::ownership::OwnershipToken;
use crate::types::{IceCandidate, MediaConstraints, PeerId, RoomId, SessionDescription, SessionType};
use crate::wire::ClientEvent;

/// Media-side happenings the session manager reacts to
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// The transport gathered a local candidate for the remote party
    LocalCandidate {
        /// Room the candidate belongs to
        room: RoomId,
        /// Candidate to relay
        candidate: IceCandidate,
    },
    /// The remote party's stream became playable
    RemoteStream {
        /// Room the stream belongs to
        room: RoomId,
        /// Playable remote stream
        stream: Arc<dyn RemoteMedia>,
    },
    /// The transport lost connectivity without a signaled end
    TransportLost {
        /// Room whose transport failed
        room: RoomId,
    },
}

/// Media state for a single call
pub struct PeerSession {
    kind: SessionType,
    room_id: RoomId,
    partner: PeerId,
    channel: Arc<SignalingChannel>,
    runtime: Arc<dyn MediaRuntime>,
    transport: Arc<dyn MediaSession>,
    local: Mutex<Option<Arc<dyn LocalMedia>>>,
    remote: Mutex<Option<Arc<dyn RemoteMedia>>>,
    pending_candidates: Mutex<HashMap<PeerId, Vec<IceCandidate>>>,
    remote_ready: AtomicBool,
    camera_enabled: AtomicBool,
    token: Mutex<Option<OwnershipToken>>,
    closed: AtomicBool,
}

impl PeerSession {
    /// Create the session and its transport instance
    ///
    /// `token` is `None` when another session type holds the signaling slot;
    /// the session still runs its transport but negotiation events are never
    /// routed to it. A held token is released again when
    /// [`cleanup`](Self::cleanup) runs. Media signals are forwarded to
    /// `media_tx` tagged with this session's room so stale events from
    /// earlier calls can be discarded.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] when the host cannot construct a transport
    pub async fn open(
        kind: SessionType,
        room_id: RoomId,
        partner: PeerId,
        runtime: Arc<dyn MediaRuntime>,
        channel: Arc<SignalingChannel>,
        token: Option<OwnershipToken>,
        media_tx: mpsc::Sender<MediaEvent>,
    ) -> Result<Arc<Self>, MediaError> {
        let transport = runtime.create_transport().await?;
        let session = Arc::new(Self {
            kind,
            room_id,
            partner,
            channel,
            runtime,
            transport,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            pending_candidates: Mutex::new(HashMap::new()),
            remote_ready: AtomicBool::new(false),
            camera_enabled: AtomicBool::new(false),
            token: Mutex::new(token),
            closed: AtomicBool::new(false),
        });
        session.spawn_signal_forwarder(media_tx);
        Ok(session)
    }

    /// Session kind this call runs under
    #[must_use]
    pub fn kind(&self) -> SessionType {
        self.kind
    }

    /// Room shared with the remote party
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The remote party
    #[must_use]
    pub fn partner(&self) -> &PeerId {
        &self.partner
    }

    /// Whether this session holds the signaling routing slot
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.token.lock().is_some()
    }

    /// Capture local media and attach it to the transport
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] when capture or attachment fails
    pub async fn attach_local_stream(
        &self,
        constraints: MediaConstraints,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        let local = self.runtime.capture_local(constraints).await?;
        self.transport.attach_local(Arc::clone(&local)).await?;
        self.camera_enabled.store(constraints.video, Ordering::SeqCst);
        *self.local.lock() = Some(local);
        debug!(room = %self.room_id, video = constraints.video, "local stream attached");
        Ok(())
    }

    /// Produce an offer describing the local side
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] when the transport refuses
    pub async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        self.transport.create_offer().await
    }

    /// Produce an answer to the applied remote offer
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] when the transport refuses
    pub async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        self.transport.create_answer().await
    }

    /// Apply the remote description and flush candidates buffered for the
    /// partner
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] when the transport rejects the description or
    /// a flushed candidate
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.transport.set_remote_description(description).await?;
        self.remote_ready.store(true, Ordering::SeqCst);
        self.flush_candidates().await
    }

    /// Apply a remote candidate, buffering it while the transport is not
    /// ready or the sender is not this call's partner
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] when the transport rejects the candidate
    pub async fn add_remote_candidate(
        &self,
        from: PeerId,
        candidate: IceCandidate,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        if from == self.partner && self.remote_ready.load(Ordering::SeqCst) {
            self.transport.add_remote_candidate(candidate).await
        } else {
            trace!(%from, "buffering early remote candidate");
            self.pending_candidates
                .lock()
                .entry(from)
                .or_default()
                .push(candidate);
            Ok(())
        }
    }

    /// Set the microphone state
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::NoLocalStream`] before a local stream exists
    pub fn set_mic_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.local_stream()?.set_mic_enabled(enabled);
        Ok(())
    }

    /// Flip the microphone state, returning the new state
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::NoLocalStream`] before a local stream exists
    pub fn toggle_mic(&self) -> Result<bool, MediaError> {
        let local = self.local_stream()?;
        let enabled = !local.mic_enabled();
        local.set_mic_enabled(enabled);
        debug!(enabled, "microphone toggled");
        Ok(enabled)
    }

    /// Current microphone state
    #[must_use]
    pub fn mic_enabled(&self) -> bool {
        self.local
            .lock()
            .as_ref()
            .is_some_and(|local| local.mic_enabled())
    }

    /// Flip the camera, swapping the video track in place
    ///
    /// Re-enabling captures a fresh camera track; disabling stops the current
    /// one. Either way the same transport instance keeps running and the
    /// remote side is told through the out-of-band camera signal.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] when capture or the track swap fails
    pub async fn toggle_camera(&self) -> Result<bool, MediaError> {
        self.ensure_open()?;
        let local = self.local_stream()?;
        let enabling = !self.camera_enabled.load(Ordering::SeqCst);
        if enabling {
            let track = local.renew_video_track().await?;
            self.transport.replace_video_track(Some(track)).await?;
        } else {
            self.transport.replace_video_track(None).await?;
            local.stop_video();
        }
        self.camera_enabled.store(enabling, Ordering::SeqCst);
        debug!(enabled = enabling, room = %self.room_id, "camera toggled");
        let signal = ClientEvent::CamToggle {
            room_id: self.room_id.clone(),
            enabled: enabling,
        };
        if let Err(e) = self.channel.send(signal).await {
            warn!(error = %e, "failed to send camera toggle signal");
        }
        Ok(enabling)
    }

    /// Current camera state
    #[must_use]
    pub fn camera_enabled(&self) -> bool {
        self.camera_enabled.load(Ordering::SeqCst)
    }

    /// Set local playback of the remote party's audio
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::NoRemoteStream`] before the remote stream exists
    pub fn set_remote_audio_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.remote_stream_handle()?.set_audio_enabled(enabled);
        Ok(())
    }

    /// Flip local playback of the remote party's audio, returning the new
    /// state
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::NoRemoteStream`] before the remote stream exists
    pub fn toggle_remote_audio(&self) -> Result<bool, MediaError> {
        let remote = self.remote_stream_handle()?;
        let enabled = !remote.audio_enabled();
        remote.set_audio_enabled(enabled);
        debug!(enabled, "remote audio toggled");
        Ok(enabled)
    }

    /// The remote stream, once it has arrived
    #[must_use]
    pub fn remote_stream(&self) -> Option<Arc<dyn RemoteMedia>> {
        self.remote.lock().clone()
    }

    /// Tear the session down; safe to call more than once
    pub async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            trace!(room = %self.room_id, "cleanup already ran");
            return;
        }
        debug!(room = %self.room_id, "tearing down peer session");
        if let Some(local) = self.local.lock().take() {
            local.stop_all();
        }
        *self.remote.lock() = None;
        self.pending_candidates.lock().clear();
        self.transport.close().await;
        if let Some(token) = self.token.lock().take() {
            token.release();
        }
    }

    fn spawn_signal_forwarder(self: &Arc<Self>, media_tx: mpsc::Sender<MediaEvent>) {
        let mut signals = self.transport.signals();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let signal = match signals.recv().await {
                    Ok(signal) => signal,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "dropped media signals");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(session) = weak.upgrade() else { break };
                if session.closed.load(Ordering::SeqCst) {
                    break;
                }
                let event = match signal {
                    MediaSignal::LocalCandidate(candidate) => MediaEvent::LocalCandidate {
                        room: session.room_id.clone(),
                        candidate,
                    },
                    MediaSignal::RemoteStream(stream) => {
                        *session.remote.lock() = Some(Arc::clone(&stream));
                        MediaEvent::RemoteStream {
                            room: session.room_id.clone(),
                            stream,
                        }
                    }
                    MediaSignal::Disconnected => MediaEvent::TransportLost {
                        room: session.room_id.clone(),
                    },
                };
                if media_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn flush_candidates(&self) -> Result<(), MediaError> {
        let buffered = self.pending_candidates.lock().remove(&self.partner);
        let Some(buffered) = buffered else {
            return Ok(());
        };
        debug!(count = buffered.len(), "flushing buffered remote candidates");
        for candidate in buffered {
            self.transport.add_remote_candidate(candidate).await?;
        }
        Ok(())
    }

    fn local_stream(&self) -> Result<Arc<dyn LocalMedia>, MediaError> {
        self.local.lock().clone().ok_or(MediaError::NoLocalStream)
    }

    fn remote_stream_handle(&self) -> Result<Arc<dyn RemoteMedia>, MediaError> {
        self.remote.lock().clone().ok_or(MediaError::NoRemoteStream)
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::memory::{FakeMediaRuntime, MemoryRelay};
    use crate::ownership::SignalingOwnership;
    use crate::types::CallId;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        relay: MemoryRelay,
        runtime: Arc<FakeMediaRuntime>,
        ownership: Arc<SignalingOwnership>,
        session: Arc<PeerSession>,
        media_rx: mpsc::Receiver<MediaEvent>,
    }

    async fn fixture() -> Fixture {
        let relay = MemoryRelay::new();
        let channel = SignalingChannel::new(
            relay.transport(PeerId::new("alice")),
            ChannelConfig::default(),
        );
        channel.connect();
        let runtime = FakeMediaRuntime::new();
        let ownership = Arc::new(SignalingOwnership::new());
        let token = ownership.acquire(SessionType::Direct).unwrap();
        let (media_tx, media_rx) = mpsc::channel(16);
        let session = PeerSession::open(
            SessionType::Direct,
            RoomId::from(&CallId::new("c-1")),
            PeerId::new("bob"),
            runtime.clone(),
            channel,
            Some(token),
            media_tx,
        )
        .await
        .unwrap();
        Fixture {
            relay,
            runtime,
            ownership,
            session,
            media_rx,
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(json!({ "candidate": format!("cand-{n}"), "sdpMLineIndex": 0 }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidates_buffer_until_remote_description() {
        let fx = fixture().await;
        let bob = PeerId::new("bob");

        fx.session
            .add_remote_candidate(bob.clone(), candidate(1))
            .await
            .unwrap();
        fx.session
            .add_remote_candidate(bob.clone(), candidate(2))
            .await
            .unwrap();
        let transport = fx.runtime.last_transport().unwrap();
        assert!(transport.applied_candidates().is_empty());

        fx.session
            .set_remote_description(SessionDescription::new(json!({ "type": "offer" })))
            .await
            .unwrap();
        assert_eq!(
            transport.applied_candidates(),
            vec![candidate(1), candidate(2)]
        );

        // Ready now, so further candidates apply immediately.
        fx.session
            .add_remote_candidate(bob, candidate(3))
            .await
            .unwrap();
        assert_eq!(transport.applied_candidates().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_party_candidates_never_reach_transport() {
        let fx = fixture().await;

        fx.session
            .set_remote_description(SessionDescription::new(json!({ "type": "offer" })))
            .await
            .unwrap();
        fx.session
            .add_remote_candidate(PeerId::new("mallory"), candidate(9))
            .await
            .unwrap();
        let transport = fx.runtime.last_transport().unwrap();
        assert!(transport.applied_candidates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_toggle_swaps_track_on_same_transport() {
        let fx = fixture().await;
        fx.session
            .attach_local_stream(MediaConstraints::video_call())
            .await
            .unwrap();
        assert!(fx.session.camera_enabled());

        let before = Arc::clone(&fx.session.transport);
        assert!(!fx.session.toggle_camera().await.unwrap());
        assert!(fx.session.toggle_camera().await.unwrap());
        assert!(Arc::ptr_eq(&before, &fx.session.transport));

        // One transport for the whole call and no renegotiation.
        assert_eq!(fx.runtime.transports_created(), 1);
        let transport = fx.runtime.last_transport().unwrap();
        assert_eq!(transport.offers_created(), 0);
        assert_eq!(
            transport.video_replacements(),
            vec![None, Some("video-1".to_string())]
        );

        let toggles: Vec<_> = fx
            .relay
            .sent_by(&PeerId::new("alice"))
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::CamToggle { enabled, .. } => Some(enabled),
                _ => None,
            })
            .collect();
        assert_eq!(toggles, vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mic_toggle_requires_and_flips_local_stream() {
        let fx = fixture().await;
        assert!(matches!(
            fx.session.toggle_mic(),
            Err(MediaError::NoLocalStream)
        ));

        fx.session
            .attach_local_stream(MediaConstraints::audio_only())
            .await
            .unwrap();
        assert!(fx.session.mic_enabled());
        assert!(!fx.session.toggle_mic().unwrap());
        assert!(!fx.session.mic_enabled());
        assert!(fx.session.toggle_mic().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_stream_arrival_enables_audio_control() {
        let mut fx = fixture().await;
        assert!(matches!(
            fx.session.toggle_remote_audio(),
            Err(MediaError::NoRemoteStream)
        ));

        let transport = fx.runtime.last_transport().unwrap();
        transport.emit_remote_stream("stream-bob");
        let event = fx.media_rx.recv().await.unwrap();
        match event {
            MediaEvent::RemoteStream { room, stream } => {
                assert_eq!(room, *fx.session.room_id());
                assert_eq!(stream.id(), "stream-bob");
            }
            other => panic!("unexpected media event: {other:?}"),
        }

        assert!(!fx.session.toggle_remote_audio().unwrap());
        assert!(!fx.session.remote_stream().unwrap().audio_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_is_forwarded() {
        let mut fx = fixture().await;
        let transport = fx.runtime.last_transport().unwrap();
        transport.emit_disconnected();
        let event = fx.media_rx.recv().await.unwrap();
        assert!(matches!(event, MediaEvent::TransportLost { room } if room == *fx.session.room_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_is_idempotent_and_releases_ownership() {
        let fx = fixture().await;
        fx.session
            .attach_local_stream(MediaConstraints::video_call())
            .await
            .unwrap();
        assert_eq!(fx.ownership.handler_count(), 1);

        fx.session.cleanup().await;
        fx.session.cleanup().await;

        let transport = fx.runtime.last_transport().unwrap();
        assert_eq!(transport.close_calls(), 1);
        assert_eq!(fx.ownership.handler_count(), 0);
        assert!(matches!(
            fx.session.create_offer().await,
            Err(MediaError::Closed)
        ));
    }
}
