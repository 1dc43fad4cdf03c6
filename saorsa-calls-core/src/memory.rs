//! In-process relay, store, and media harness
//!
//! A [`MemoryRelay`] speaks the full signaling protocol over in-memory links:
//! it answers identity attach/reauth, mints call ids, and routes call-control
//! and negotiation frames between its endpoints. Together with [`MemoryKv`]
//! and [`FakeMediaRuntime`] it lets the CLI demo and the test suites drive
//! complete call flows without a network or real devices.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::channel::{LinkError, LinkReceiver, LinkSender, LinkTransport};
use crate::media::{
    LocalMedia, MediaError, MediaRuntime, MediaSession, MediaSignal, MediaTrack, RemoteMedia,
};
use crate::missed::{KvStore, StoreError};
use crate::types::{CallId, IceCandidate, MediaConstraints, PeerId, SessionDescription};
use crate::wire::{AckBody, ClientEvent, ClientFrame, ServerEvent, ServerFrame};

/// In-process signaling relay for demos and tests
///
/// Clone-cheap handle over shared relay state. Each peer gets its own
/// [`LinkTransport`] from [`transport`](Self::transport); reconnecting through
/// it replaces the peer's previous link, and [`sever`](Self::sever) drops the
/// current one to simulate a connectivity gap.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    state: Arc<RelayState>,
}

#[derive(Debug, Default)]
struct RelayState {
    endpoints: Mutex<HashMap<PeerId, Endpoint>>,
    calls: Mutex<HashMap<CallId, CallRoute>>,
}

#[derive(Debug, Default)]
struct Endpoint {
    to_client: Option<mpsc::UnboundedSender<Bytes>>,
    sent: Vec<ClientEvent>,
    user_id: Option<String>,
    nick: Option<String>,
    refuse_attach: bool,
    refuse_initiate: Option<String>,
    busy: bool,
    silence_acks: bool,
}

#[derive(Debug, Clone)]
struct CallRoute {
    caller: PeerId,
    callee: PeerId,
}

impl CallRoute {
    fn counterpart(&self, peer: &PeerId) -> Option<PeerId> {
        if &self.caller == peer {
            Some(self.callee.clone())
        } else if &self.callee == peer {
            Some(self.caller.clone())
        } else {
            None
        }
    }
}

impl MemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Link transport for one peer; every connect replaces the peer's link
    #[must_use]
    pub fn transport(&self, peer: PeerId) -> Arc<dyn LinkTransport> {
        Arc::new(MemoryLink {
            peer,
            state: Arc::clone(&self.state),
        })
    }

    /// Every client event this peer has sent, in order
    #[must_use]
    pub fn sent_by(&self, peer: &PeerId) -> Vec<ClientEvent> {
        self.state
            .endpoints
            .lock()
            .get(peer)
            .map(|e| e.sent.clone())
            .unwrap_or_default()
    }

    /// Refuse identity attach requests from this peer
    pub fn refuse_attach(&self, peer: &PeerId, refuse: bool) {
        self.state.endpoint_mut(peer, |e| e.refuse_attach = refuse);
    }

    /// Reject call initiations from this peer with the given relay error
    pub fn refuse_initiate(&self, peer: &PeerId, error: Option<&str>) {
        self.state
            .endpoint_mut(peer, |e| e.refuse_initiate = error.map(str::to_string));
    }

    /// Mark a peer busy; initiations toward them are answered with call:busy
    pub fn set_busy(&self, peer: &PeerId, busy: bool) {
        self.state.endpoint_mut(peer, |e| e.busy = busy);
    }

    /// Swallow acknowledgements for this peer's requests
    pub fn silence_acks(&self, peer: &PeerId, silence: bool) {
        self.state.endpoint_mut(peer, |e| e.silence_acks = silence);
    }

    /// Drop the peer's current link, simulating a connectivity gap
    pub fn sever(&self, peer: &PeerId) {
        debug!(peer = %peer, "severing relay link");
        self.state.endpoint_mut(peer, |e| e.to_client = None);
    }

    /// Push an arbitrary event to a peer, as the relay would
    pub fn inject(&self, peer: &PeerId, event: ServerEvent) {
        self.state.deliver(peer, &ServerFrame::Event(event));
    }

    /// Ring out a pending call: call:timeout to both parties, route dropped
    pub fn fire_timeout(&self, call_id: &CallId) {
        let route = self.state.calls.lock().remove(call_id);
        let Some(route) = route else {
            warn!(call_id = %call_id, "timeout fired for unknown call");
            return;
        };
        for peer in [&route.caller, &route.callee] {
            self.state.deliver(
                peer,
                &ServerFrame::Event(ServerEvent::CallTimeout {
                    call_id: call_id.clone(),
                }),
            );
        }
    }
}

impl RelayState {
    fn endpoint_mut(&self, peer: &PeerId, apply: impl FnOnce(&mut Endpoint)) {
        let mut endpoints = self.endpoints.lock();
        apply(endpoints.entry(peer.clone()).or_default());
    }

    fn deliver(&self, peer: &PeerId, frame: &ServerFrame) {
        let Ok(bytes) = frame.to_bytes() else {
            warn!(peer = %peer, "failed to encode relay frame");
            return;
        };
        let endpoints = self.endpoints.lock();
        let Some(sender) = endpoints.get(peer).and_then(|e| e.to_client.as_ref()) else {
            trace!(peer = %peer, "dropping frame for offline peer");
            return;
        };
        if sender.send(bytes).is_err() {
            trace!(peer = %peer, "peer link receiver dropped");
        }
    }

    fn ack(&self, peer: &PeerId, correlation: Option<u64>, body: AckBody) {
        let silenced = self
            .endpoints
            .lock()
            .get(peer)
            .is_some_and(|e| e.silence_acks);
        if silenced {
            trace!(peer = %peer, "acknowledgement silenced");
            return;
        }
        if let Some(id) = correlation {
            self.deliver(peer, &ServerFrame::ack(id, body));
        }
    }

    fn handle(&self, peer: &PeerId, bytes: &[u8]) {
        let frame = match ClientFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, error = %e, "relay discarding malformed frame");
                return;
            }
        };
        self.endpoint_mut(peer, |e| e.sent.push(frame.event.clone()));
        trace!(peer = %peer, event = frame.event.name(), "relay handling event");

        match frame.event {
            ClientEvent::IdentityAttach { profile, .. } => {
                let refused = self
                    .endpoints
                    .lock()
                    .get(peer)
                    .is_some_and(|e| e.refuse_attach);
                if refused {
                    self.ack(peer, frame.ack, AckBody::rejected("attach refused"));
                    return;
                }
                let user_id = {
                    let mut endpoints = self.endpoints.lock();
                    let endpoint = endpoints.entry(peer.clone()).or_default();
                    if profile.nick.is_some() {
                        endpoint.nick = profile.nick;
                    }
                    endpoint
                        .user_id
                        .get_or_insert_with(|| format!("user-{peer}"))
                        .clone()
                };
                self.ack(peer, frame.ack, AckBody::with_user_id(user_id));
            }
            ClientEvent::Reauth { .. } => {
                self.ack(peer, frame.ack, AckBody::accepted());
            }
            ClientEvent::CallInitiate { to } => self.handle_initiate(peer, frame.ack, &to),
            ClientEvent::CallAccept { call_id } => {
                self.route_control(peer, &call_id, |from| ServerEvent::CallAccepted {
                    call_id: call_id.clone(),
                    from,
                });
            }
            ClientEvent::CallDecline { call_id } => {
                self.route_control(peer, &call_id, |from| ServerEvent::CallDeclined {
                    call_id: call_id.clone(),
                    from,
                });
                self.calls.lock().remove(&call_id);
            }
            ClientEvent::CallCancel { call_id } => {
                self.route_control(peer, &call_id, |from| ServerEvent::CallCancel {
                    call_id: call_id.clone(),
                    from,
                });
                self.calls.lock().remove(&call_id);
            }
            ClientEvent::Offer { to, offer } => {
                self.deliver(
                    &to,
                    &ServerFrame::Event(ServerEvent::Offer {
                        from: peer.clone(),
                        offer,
                    }),
                );
            }
            ClientEvent::Answer { to, answer } => {
                self.deliver(
                    &to,
                    &ServerFrame::Event(ServerEvent::Answer {
                        from: peer.clone(),
                        answer,
                    }),
                );
            }
            ClientEvent::IceCandidate { to, candidate } => {
                self.deliver(
                    &to,
                    &ServerFrame::Event(ServerEvent::IceCandidate {
                        from: peer.clone(),
                        candidate,
                    }),
                );
            }
            ClientEvent::CamToggle { room_id, enabled } => {
                // Direct calls use the call id as the room id.
                let route = self.calls.lock().get(&CallId::new(room_id.as_str())).cloned();
                if let Some(other) = route.and_then(|r| r.counterpart(peer)) {
                    self.deliver(
                        &other,
                        &ServerFrame::Event(ServerEvent::CamToggle { room_id, enabled }),
                    );
                } else {
                    trace!(room = %room_id, "camera toggle for unknown room dropped");
                }
            }
        }
    }

    fn handle_initiate(&self, caller: &PeerId, correlation: Option<u64>, callee: &PeerId) {
        let refusal = self
            .endpoints
            .lock()
            .get(caller)
            .and_then(|e| e.refuse_initiate.clone());
        if let Some(error) = refusal {
            self.ack(caller, correlation, AckBody::rejected(error));
            return;
        }

        let call_id = CallId::new(format!("call-{}", Uuid::new_v4()));
        self.ack(caller, correlation, AckBody::with_call_id(call_id.clone()));

        let (busy, caller_nick) = {
            let endpoints = self.endpoints.lock();
            (
                endpoints.get(callee).is_some_and(|e| e.busy),
                endpoints.get(caller).and_then(|e| e.nick.clone()),
            )
        };
        if busy {
            self.deliver(
                caller,
                &ServerFrame::Event(ServerEvent::CallBusy {
                    from: callee.clone(),
                }),
            );
            return;
        }

        self.calls.lock().insert(
            call_id.clone(),
            CallRoute {
                caller: caller.clone(),
                callee: callee.clone(),
            },
        );
        self.deliver(
            callee,
            &ServerFrame::Event(ServerEvent::CallIncoming {
                call_id,
                from: caller.clone(),
                from_nick: caller_nick,
            }),
        );
    }

    fn route_control(
        &self,
        peer: &PeerId,
        call_id: &CallId,
        event: impl FnOnce(PeerId) -> ServerEvent,
    ) {
        let other = self
            .calls
            .lock()
            .get(call_id)
            .and_then(|route| route.counterpart(peer));
        match other {
            Some(other) => self.deliver(&other, &ServerFrame::Event(event(peer.clone()))),
            None => trace!(call_id = %call_id, "control event for unknown call dropped"),
        }
    }
}

struct MemoryLink {
    peer: PeerId,
    state: Arc<RelayState>,
}

#[async_trait]
impl LinkTransport for MemoryLink {
    async fn connect(&self) -> Result<(Box<dyn LinkSender>, Box<dyn LinkReceiver>), LinkError> {
        let (client_tx, mut relay_rx) = mpsc::unbounded_channel::<Bytes>();
        let (relay_tx, client_rx) = mpsc::unbounded_channel::<Bytes>();

        self.state
            .endpoint_mut(&self.peer, |e| e.to_client = Some(relay_tx));

        let state = Arc::clone(&self.state);
        let peer = self.peer.clone();
        tokio::spawn(async move {
            while let Some(bytes) = relay_rx.recv().await {
                state.handle(&peer, &bytes);
            }
        });

        Ok((
            Box::new(MemorySender(client_tx)),
            Box::new(MemoryReceiver(client_rx)),
        ))
    }
}

struct MemorySender(mpsc::UnboundedSender<Bytes>);

#[async_trait]
impl LinkSender for MemorySender {
    async fn send(&mut self, frame: Bytes) -> Result<(), LinkError> {
        self.0
            .send(frame)
            .map_err(|_| LinkError::Io("relay dropped the link".to_string()))
    }
}

struct MemoryReceiver(mpsc::UnboundedReceiver<Bytes>);

#[async_trait]
impl LinkReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<Option<Bytes>, LinkError> {
        Ok(self.0.recv().await)
    }
}

/// In-memory key-value store
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.map.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.map.lock().remove(key);
        Ok(())
    }
}

/// Scripted media runtime producing fake transports and streams
#[derive(Debug, Default)]
pub struct FakeMediaRuntime {
    transports: Mutex<Vec<Arc<FakeMediaSession>>>,
}

impl FakeMediaRuntime {
    /// Create a runtime with no transports yet
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of transport instances handed out so far
    #[must_use]
    pub fn transports_created(&self) -> usize {
        self.transports.lock().len()
    }

    /// The most recently created transport
    #[must_use]
    pub fn last_transport(&self) -> Option<Arc<FakeMediaSession>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl MediaRuntime for FakeMediaRuntime {
    async fn capture_local(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, MediaError> {
        Ok(Arc::new(FakeLocalMedia::new(constraints)))
    }

    async fn create_transport(&self) -> Result<Arc<dyn MediaSession>, MediaError> {
        let transport = Arc::new(FakeMediaSession::new());
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Fake transport recording every operation and scriptable from tests
#[derive(Debug)]
pub struct FakeMediaSession {
    signals: broadcast::Sender<MediaSignal>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    remote_description: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    replacements: Mutex<Vec<Option<String>>>,
    closes: AtomicUsize,
}

impl FakeMediaSession {
    fn new() -> Self {
        let (signals, _) = broadcast::channel(32);
        Self {
            signals,
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            remote_description: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            replacements: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    /// Offers produced so far
    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    /// Answers produced so far
    #[must_use]
    pub fn answers_created(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    /// Remote description applied to this transport, if any
    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    /// Candidates applied to this transport, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// Video track replacements, in order; `None` is a removal
    #[must_use]
    pub fn video_replacements(&self) -> Vec<Option<String>> {
        self.replacements.lock().clone()
    }

    /// How many times close() ran
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Script a remote stream arriving over this transport
    pub fn emit_remote_stream(&self, id: &str) {
        let stream: Arc<dyn RemoteMedia> = Arc::new(FakeRemoteMedia::new(id));
        let _ = self.signals.send(MediaSignal::RemoteStream(stream));
    }

    /// Script the transport gathering a local candidate
    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.signals.send(MediaSignal::LocalCandidate(candidate));
    }

    /// Script a transport-level disconnect without an end event
    pub fn emit_disconnected(&self) {
        let _ = self.signals.send(MediaSignal::Disconnected);
    }
}

#[async_trait]
impl MediaSession for FakeMediaSession {
    async fn attach_local(&self, _stream: Arc<dyn LocalMedia>) -> Result<(), MediaError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let seq = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::new(serde_json::json!({
            "type": "offer",
            "sdp": format!("fake-offer-{seq}"),
        })))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let seq = self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::new(serde_json::json!({
            "type": "answer",
            "sdp": format!("fake-answer-{seq}"),
        })))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        *self.remote_description.lock() = Some(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn replace_video_track(
        &self,
        track: Option<Arc<dyn MediaTrack>>,
    ) -> Result<(), MediaError> {
        self.replacements
            .lock()
            .push(track.map(|t| t.id().to_string()));
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<MediaSignal> {
        self.signals.subscribe()
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fake local stream whose video tracks are numbered in capture order
#[derive(Debug)]
pub struct FakeLocalMedia {
    mic: AtomicBool,
    video: AtomicBool,
    next_track: AtomicUsize,
}

impl FakeLocalMedia {
    fn new(constraints: MediaConstraints) -> Self {
        Self {
            mic: AtomicBool::new(constraints.audio),
            video: AtomicBool::new(constraints.video),
            next_track: AtomicUsize::new(usize::from(constraints.video)),
        }
    }
}

#[async_trait]
impl LocalMedia for FakeLocalMedia {
    fn set_mic_enabled(&self, enabled: bool) {
        self.mic.store(enabled, Ordering::SeqCst);
    }

    fn mic_enabled(&self) -> bool {
        self.mic.load(Ordering::SeqCst)
    }

    fn video_enabled(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }

    async fn renew_video_track(&self) -> Result<Arc<dyn MediaTrack>, MediaError> {
        let seq = self.next_track.fetch_add(1, Ordering::SeqCst);
        self.video.store(true, Ordering::SeqCst);
        Ok(Arc::new(FakeTrack::new(format!("video-{seq}"))))
    }

    fn stop_video(&self) {
        self.video.store(false, Ordering::SeqCst);
    }

    fn stop_all(&self) {
        self.mic.store(false, Ordering::SeqCst);
        self.video.store(false, Ordering::SeqCst);
    }
}

/// Fake sendable track
#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    enabled: AtomicBool,
}

impl FakeTrack {
    fn new(id: String) -> Self {
        Self {
            id,
            enabled: AtomicBool::new(true),
        }
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Fake remote stream with local playback control
#[derive(Debug)]
pub struct FakeRemoteMedia {
    id: String,
    audio: AtomicBool,
}

impl FakeRemoteMedia {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            audio: AtomicBool::new(true),
        }
    }
}

impl RemoteMedia for FakeRemoteMedia {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio.store(enabled, Ordering::SeqCst);
    }

    fn audio_enabled(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }
}
