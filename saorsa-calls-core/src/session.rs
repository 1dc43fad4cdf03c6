//! Call lifecycle state machine and signaling event dispatch
//!
//! One manager owns at most one direct call record at a time, next to an
//! optional matchmaking media session. All inbound relay events and media
//! signals funnel through a single dispatch task, so transitions are applied
//! in arrival order; ordering races between independently delivered events
//! are absorbed by the race guard and the ledger's one-shot markers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelError, SignalingChannel};
use crate::continuity::ContinuityBridge;
use crate::identity::IdentityManager;
use crate::media::{MediaError, MediaRuntime};
use crate::missed::MissedCallLedger;
use crate::ownership::SignalingOwnership;
use crate::peer_session::{MediaEvent, PeerSession};
use crate::race_guard::RaceGuard;
use crate::types::{
    CallDirection, CallId, CallPhase, CallSnapshot, EndReason, IceCandidate, MediaConstraints,
    PartnerMeta, PeerId, RoomId, SessionDescription, SessionEvent, SessionType,
};
use crate::wire::{ClientEvent, ServerEvent};

/// Call orchestration errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Re-authentication has not completed on the current link
    #[error("not authenticated with the relay")]
    NotAuthenticated,

    /// The relay refused to start the call
    #[error("call initiate failed: {0}")]
    InitiateFailed(String),

    /// The matchmaking room is full; terminal for this attempt
    #[error("room is full")]
    RoomFull,

    /// The call was abandoned locally before the relay answered
    #[error("call canceled while dialing")]
    Canceled,

    /// The intent does not apply in the current phase
    #[error("{intent} is not valid while {phase}")]
    InvalidState {
        /// Intent that was refused
        intent: &'static str,
        /// Phase it was refused in
        phase: CallPhase,
    },

    /// The manager was already started
    #[error("session manager already started")]
    AlreadyStarted,

    /// Signaling failure underneath an intent
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Media failure underneath an intent
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Host hook notified on call-screen transitions; notify-only, never consulted
pub trait NavigationHook: Send + Sync {
    /// The call became active and the call screen should be shown
    fn call_screen_entered(&self, partner: &PartnerMeta);

    /// The call ended and the call screen should be left
    fn call_screen_left(&self);
}

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local bound on an unanswered outgoing ring
    pub dial_timeout: Duration,
    /// Fallback bound on an unresolved incoming invitation
    pub ring_timeout: Duration,
    /// Grace between a transport disconnect and automatic hangup;
    /// `None` leaves the hangup to the host
    pub disconnect_grace: Option<Duration>,
    /// Capture constraints applied to every call
    pub constraints: MediaConstraints,
    /// UI event bus capacity
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(20),
            ring_timeout: Duration::from_millis(20_500),
            disconnect_grace: Some(Duration::from_secs(5)),
            constraints: MediaConstraints::video_call(),
            event_buffer: 256,
        }
    }
}

/// The live call attempt
#[derive(Debug)]
struct CallRecord {
    call_id: Option<CallId>,
    partner: PartnerMeta,
    direction: CallDirection,
    phase: CallPhase,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
}

impl CallRecord {
    fn new(partner: PartnerMeta, direction: CallDirection, phase: CallPhase) -> Self {
        Self {
            call_id: None,
            partner,
            direction,
            phase,
            created_at: Utc::now(),
            connected_at: None,
            cancel_requested: false,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    record: Option<CallRecord>,
    session: Option<Arc<PeerSession>>,
}

impl ManagerState {
    fn phase(&self) -> CallPhase {
        self.record
            .as_ref()
            .map_or(CallPhase::Idle, |record| record.phase)
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Dial,
    RingFallback,
}

/// The call lifecycle state machine
pub struct CallSessionManager {
    channel: Arc<SignalingChannel>,
    identity: Arc<IdentityManager>,
    runtime: Arc<dyn MediaRuntime>,
    ledger: Arc<MissedCallLedger>,
    ownership: Arc<SignalingOwnership>,
    continuity: Arc<ContinuityBridge>,
    navigation: Option<Arc<dyn NavigationHook>>,
    config: SessionConfig,
    guard: RaceGuard,
    state: RwLock<ManagerState>,
    matchmaking: Mutex<Option<Arc<PeerSession>>>,
    pending_candidates: Mutex<Vec<(PeerId, IceCandidate)>>,
    events_tx: broadcast::Sender<SessionEvent>,
    media_tx: mpsc::Sender<MediaEvent>,
    media_rx: Mutex<Option<mpsc::Receiver<MediaEvent>>>,
    call_timer: Mutex<Option<JoinHandle<()>>>,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
}

impl CallSessionManager {
    /// Create a manager; [`start`](Self::start) wires it to the channel
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Arc<SignalingChannel>,
        identity: Arc<IdentityManager>,
        runtime: Arc<dyn MediaRuntime>,
        ledger: Arc<MissedCallLedger>,
        ownership: Arc<SignalingOwnership>,
        continuity: Arc<ContinuityBridge>,
        navigation: Option<Arc<dyn NavigationHook>>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(config.event_buffer);
        let (media_tx, media_rx) = mpsc::channel(config.event_buffer);
        let manager = Arc::new(Self {
            channel,
            identity,
            runtime,
            ledger,
            ownership,
            continuity,
            navigation,
            config,
            guard: RaceGuard::new(),
            state: RwLock::new(ManagerState::default()),
            matchmaking: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            events_tx,
            media_tx,
            media_rx: Mutex::new(None),
            call_timer: Mutex::new(None),
            grace_timer: Mutex::new(None),
        });
        *manager.media_rx.lock() = Some(media_rx);
        manager.continuity.bind(&manager);
        manager
    }

    /// Start the dispatch task consuming relay events and media signals
    ///
    /// # Errors
    ///
    /// Returns [`CallError::AlreadyStarted`] when the channel's event stream
    /// was already taken
    pub fn start(self: &Arc<Self>) -> Result<(), CallError> {
        let Some(mut server_rx) = self.channel.take_events() else {
            return Err(CallError::AlreadyStarted);
        };
        let Some(mut media_rx) = self.media_rx.lock().take() else {
            return Err(CallError::AlreadyStarted);
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = server_rx.recv() => match event {
                        Some(event) => manager.on_server_event(event).await,
                        None => break,
                    },
                    event = media_rx.recv() => match event {
                        Some(event) => manager.on_media_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("session manager dispatch stopped");
        });
        Ok(())
    }

    /// Subscribe to the typed UI event bus
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Current lifecycle phase
    pub async fn current_phase(&self) -> CallPhase {
        self.state.read().await.phase()
    }

    /// Point-in-time view of the live call, if any
    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        let state = self.state.read().await;
        state.record.as_ref().map(|record| CallSnapshot {
            call_id: record.call_id.clone(),
            partner: record.partner.clone(),
            direction: record.direction,
            phase: record.phase,
            created_at: record.created_at,
            connected_at: record.connected_at,
        })
    }

    /// Start an outgoing call to a peer
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotAuthenticated`] while re-authentication is
    /// pending, [`CallError::InvalidState`] outside Idle,
    /// [`CallError::InitiateFailed`] or [`CallError::RoomFull`] on relay
    /// refusal, [`CallError::Canceled`] when hangup raced the relay ack, and
    /// channel errors (Offline, AckTimeout) after the retry budget
    #[tracing::instrument(skip(self, nick), fields(peer = %peer))]
    pub async fn initiate_call(
        self: &Arc<Self>,
        peer: PeerId,
        nick: Option<String>,
    ) -> Result<CallId, CallError> {
        if !self.identity.is_authenticated() {
            return Err(CallError::NotAuthenticated);
        }
        {
            let mut state = self.state.write().await;
            let phase = state.phase();
            if !phase.is_idle() {
                return Err(CallError::InvalidState {
                    intent: "initiate_call",
                    phase,
                });
            }
            state.record = Some(CallRecord::new(
                PartnerMeta::new(peer.clone(), nick),
                CallDirection::Outgoing,
                CallPhase::Dialing,
            ));
        }
        self.emit_phase(CallPhase::Idle, CallPhase::Dialing);
        info!("dialing");

        let ack = match self
            .channel
            .request(ClientEvent::CallInitiate { to: peer.clone() }, None, None)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                self.end_call(EndReason::InitiateFailed(e.to_string())).await;
                return Err(e.into());
            }
        };
        if !ack.ok {
            let reason = ack.error_text().to_string();
            self.end_call(EndReason::InitiateFailed(reason.clone())).await;
            return Err(if reason == "room_full" {
                CallError::RoomFull
            } else {
                CallError::InitiateFailed(reason)
            });
        }
        let Some(call_id) = ack.call_id else {
            let reason = "acknowledgement carried no call id".to_string();
            self.end_call(EndReason::InitiateFailed(reason.clone())).await;
            return Err(CallError::InitiateFailed(reason));
        };

        enum AckOutcome {
            Ringing,
            Canceled,
            // The attempt was resolved by something else while we awaited
            // the ack; the relay still holds a live call id to abandon.
            Orphaned,
        }
        let outcome = {
            let mut state = self.state.write().await;
            match state.record.as_mut() {
                Some(record) if record.phase == CallPhase::Dialing => {
                    record.call_id = Some(call_id.clone());
                    if record.cancel_requested {
                        AckOutcome::Canceled
                    } else {
                        record.phase = CallPhase::RingingOut;
                        AckOutcome::Ringing
                    }
                }
                _ => AckOutcome::Orphaned,
            }
        };
        match outcome {
            AckOutcome::Ringing => {}
            AckOutcome::Canceled => {
                self.send_best_effort(ClientEvent::CallCancel {
                    call_id: call_id.clone(),
                })
                .await;
                self.end_call(EndReason::HungUp).await;
                return Err(CallError::Canceled);
            }
            AckOutcome::Orphaned => {
                self.send_best_effort(ClientEvent::CallCancel { call_id }).await;
                return Err(CallError::Canceled);
            }
        }

        self.emit_phase(CallPhase::Dialing, CallPhase::RingingOut);
        self.emit(SessionEvent::OutgoingRinging {
            call_id: call_id.clone(),
            to: peer,
        });
        self.arm_call_timer(call_id.clone(), self.config.dial_timeout, TimerKind::Dial);
        Ok(call_id)
    }

    /// Accept the ringing invitation
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] outside RingingIn, and media
    /// errors when the transport cannot be brought up
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let (call_id, partner) = {
            let mut state = self.state.write().await;
            let phase = state.phase();
            match state.record.as_mut() {
                Some(record) if record.phase == CallPhase::RingingIn => {
                    record.phase = CallPhase::Negotiating;
                    match record.call_id.clone() {
                        Some(call_id) => (call_id, record.partner.clone()),
                        None => {
                            return Err(CallError::InvalidState {
                                intent: "accept_call",
                                phase,
                            })
                        }
                    }
                }
                _ => {
                    return Err(CallError::InvalidState {
                        intent: "accept_call",
                        phase,
                    })
                }
            }
        };
        self.abort_call_timer();
        self.ledger.disarm(&call_id);
        self.emit_phase(CallPhase::RingingIn, CallPhase::Negotiating);
        info!(call_id = %call_id, "accepting call");

        self.send_best_effort(ClientEvent::CallAccept {
            call_id: call_id.clone(),
        })
        .await;

        if let Err(e) = self.open_direct_session(&call_id, &partner).await {
            warn!(error = %e, "failed to open media session for accepted call");
            self.end_call(EndReason::TransportLost).await;
            return Err(e);
        }
        Ok(())
    }

    /// Decline the ringing invitation; never counts as missed
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] outside RingingIn
    #[tracing::instrument(skip(self))]
    pub async fn decline_call(&self) -> Result<(), CallError> {
        let call_id = {
            let state = self.state.read().await;
            match state.record.as_ref() {
                Some(record) if record.phase == CallPhase::RingingIn => record.call_id.clone(),
                _ => {
                    return Err(CallError::InvalidState {
                        intent: "decline_call",
                        phase: state.phase(),
                    })
                }
            }
        };
        if let Some(call_id) = call_id {
            self.ledger.disarm(&call_id);
            self.send_best_effort(ClientEvent::CallDecline { call_id }).await;
        }
        self.end_call(EndReason::Declined).await;
        Ok(())
    }

    /// End the current attempt, whatever its phase
    ///
    /// While Dialing the cancel is deferred until the relay ack lands (there
    /// is no call id to cancel yet); RingingOut sends cancel, RingingIn
    /// declines, Negotiating/Active tear the media session down. Safe to call
    /// from the continuity bridge after the call screen is gone.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] when no call is in progress
    #[tracing::instrument(skip(self))]
    pub async fn hangup(&self) -> Result<(), CallError> {
        enum Action {
            Defer,
            Cancel(CallId),
            Decline(Option<CallId>),
            Teardown,
        }

        let action = {
            let mut state = self.state.write().await;
            let phase = state.phase();
            match state.record.as_mut() {
                Some(record) => match record.phase {
                    CallPhase::Dialing => {
                        record.cancel_requested = true;
                        Action::Defer
                    }
                    CallPhase::RingingOut => match record.call_id.clone() {
                        Some(call_id) => Action::Cancel(call_id),
                        None => Action::Teardown,
                    },
                    CallPhase::RingingIn => Action::Decline(record.call_id.clone()),
                    CallPhase::Negotiating | CallPhase::Active | CallPhase::Ending => {
                        Action::Teardown
                    }
                    CallPhase::Idle => {
                        return Err(CallError::InvalidState {
                            intent: "hangup",
                            phase,
                        })
                    }
                },
                None => {
                    return Err(CallError::InvalidState {
                        intent: "hangup",
                        phase,
                    })
                }
            }
        };

        match action {
            Action::Defer => {
                debug!("cancel deferred until the initiate ack lands");
                Ok(())
            }
            Action::Cancel(call_id) => {
                self.send_best_effort(ClientEvent::CallCancel { call_id }).await;
                self.end_call(EndReason::HungUp).await;
                Ok(())
            }
            Action::Decline(call_id) => {
                if let Some(call_id) = call_id {
                    self.ledger.disarm(&call_id);
                    self.send_best_effort(ClientEvent::CallDecline { call_id }).await;
                }
                self.end_call(EndReason::Declined).await;
                Ok(())
            }
            Action::Teardown => {
                self.end_call(EndReason::HungUp).await;
                Ok(())
            }
        }
    }

    /// Flip the microphone, returning the new state
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] without a live media session
    pub async fn toggle_mic(&self) -> Result<bool, CallError> {
        let session = self.any_session("toggle_mic").await?;
        Ok(session.toggle_mic()?)
    }

    /// Flip the camera; swaps the video track in place, no renegotiation
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] without a live media session
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        let session = self.any_session("toggle_camera").await?;
        Ok(session.toggle_camera().await?)
    }

    /// Flip local playback of the remote party's audio
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] without a live media session
    pub async fn toggle_remote_audio(&self) -> Result<bool, CallError> {
        let session = self.any_session("toggle_remote_audio").await?;
        Ok(session.toggle_remote_audio()?)
    }

    /// Hand the active call to the continuity bridge as the screen unmounts
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless a call is Active
    pub async fn enter_pip(&self) -> Result<(), CallError> {
        let state = self.state.read().await;
        match (&state.record, &state.session) {
            (Some(record), Some(session)) if record.phase == CallPhase::Active => {
                self.continuity.enter(record.partner.clone(), session);
                Ok(())
            }
            _ => Err(CallError::InvalidState {
                intent: "enter_pip",
                phase: state.phase(),
            }),
        }
    }

    /// Open a matchmaking media session on the shared channel
    ///
    /// The session competes for the signaling slot under the same ownership
    /// arbitration as direct calls: when a direct session is bound,
    /// negotiation events keep routing there and the matchmaking session
    /// stays unbound until the slot frees up. Matchmaking rooms drive their
    /// own negotiation, so no call record is created.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] wrapped in [`CallError`] when the transport
    /// cannot be created
    #[tracing::instrument(skip(self), fields(room = %room_id, partner = %partner))]
    pub async fn open_matchmaking_session(
        self: &Arc<Self>,
        room_id: RoomId,
        partner: PeerId,
    ) -> Result<Arc<PeerSession>, CallError> {
        if let Some(previous) = self.matchmaking.lock().take() {
            warn!("replacing live matchmaking session");
            previous.cleanup().await;
        }
        let token = self.ownership.acquire(SessionType::Matchmaking);
        let session = PeerSession::open(
            SessionType::Matchmaking,
            room_id,
            partner,
            Arc::clone(&self.runtime),
            Arc::clone(&self.channel),
            token,
            self.media_tx.clone(),
        )
        .await?;
        session
            .attach_local_stream(self.config.constraints)
            .await?;
        *self.matchmaking.lock() = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Tear down the matchmaking session, if one is open
    pub async fn close_matchmaking_session(&self) {
        let session = self.matchmaking.lock().take();
        if let Some(session) = session {
            session.cleanup().await;
        }
    }

    async fn on_server_event(self: &Arc<Self>, event: ServerEvent) {
        trace!(event = event.name(), "dispatching relay event");
        match event {
            ServerEvent::CallIncoming {
                call_id,
                from,
                from_nick,
            } => self.on_incoming(call_id, from, from_nick).await,
            ServerEvent::CallAccepted { call_id, from } => {
                self.on_accepted(call_id, from).await;
            }
            ServerEvent::CallDeclined { call_id, .. } => self.on_declined(call_id).await,
            ServerEvent::CallTimeout { call_id } => self.on_remote_timeout(call_id).await,
            ServerEvent::CallCancel { call_id, .. } => self.on_remote_cancel(call_id).await,
            ServerEvent::CallBusy { from } => self.on_busy(from).await,
            ServerEvent::RoomFull { user_id } => {
                self.emit(SessionEvent::RoomFull { user_id });
                self.close_matchmaking_session().await;
            }
            ServerEvent::Offer { from, offer } => self.on_offer(from, offer).await,
            ServerEvent::Answer { from, answer } => self.on_answer(from, answer).await,
            ServerEvent::IceCandidate { from, candidate } => {
                self.on_candidate(from, candidate).await;
            }
            ServerEvent::CamToggle { room_id, enabled } => {
                self.emit(SessionEvent::RemoteCameraToggled { room_id, enabled });
            }
        }
    }

    async fn on_incoming(self: &Arc<Self>, call_id: CallId, from: PeerId, nick: Option<String>) {
        if self.guard.is_suppressed(&call_id) {
            debug!(call_id = %call_id, "incoming call suppressed, already abandoned");
            return;
        }
        {
            let mut state = self.state.write().await;
            let phase = state.phase();
            if !phase.is_idle() {
                debug!(call_id = %call_id, %phase, "dropping incoming call, session busy");
                return;
            }
            let mut record = CallRecord::new(
                PartnerMeta::new(from.clone(), nick.clone()),
                CallDirection::Incoming,
                CallPhase::RingingIn,
            );
            record.call_id = Some(call_id.clone());
            state.record = Some(record);
        }
        self.ledger.arm(call_id.clone(), from.clone());
        self.emit_phase(CallPhase::Idle, CallPhase::RingingIn);
        self.emit(SessionEvent::IncomingCall {
            call_id: call_id.clone(),
            from,
            nick,
        });
        self.arm_call_timer(call_id, self.config.ring_timeout, TimerKind::RingFallback);
    }

    async fn on_accepted(self: &Arc<Self>, call_id: CallId, from: PeerId) {
        let partner = {
            let mut state = self.state.write().await;
            match state.record.as_mut() {
                Some(record)
                    if record.phase == CallPhase::RingingOut
                        && record.call_id.as_ref() == Some(&call_id) =>
                {
                    record.phase = CallPhase::Negotiating;
                    record.partner.clone()
                }
                _ => {
                    debug!(call_id = %call_id, from = %from, "stale accept dropped");
                    return;
                }
            }
        };
        self.abort_call_timer();
        self.emit_phase(CallPhase::RingingOut, CallPhase::Negotiating);
        info!(call_id = %call_id, "call accepted, negotiating");

        // The caller is the offerer.
        let outcome: Result<(), CallError> = async {
            let session = self.open_direct_session(&call_id, &partner).await?;
            let offer = session.create_offer().await?;
            self.channel
                .send(ClientEvent::Offer {
                    to: partner.peer.clone(),
                    offer,
                })
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = outcome {
            warn!(error = %e, "negotiation setup failed");
            self.end_call(EndReason::TransportLost).await;
        }
    }

    async fn on_declined(&self, call_id: CallId) {
        let matches = {
            let state = self.state.read().await;
            state
                .record
                .as_ref()
                .is_some_and(|r| r.phase == CallPhase::RingingOut && r.call_id.as_ref() == Some(&call_id))
        };
        if matches {
            // Caller side never counts a missed call.
            self.end_call(EndReason::Declined).await;
        } else {
            debug!(call_id = %call_id, "stale decline dropped");
        }
    }

    async fn on_remote_timeout(&self, call_id: CallId) {
        // Mark first: a timeout can overtake its own incoming notification.
        self.guard.mark_timed_out(&call_id);
        let phase = {
            let state = self.state.read().await;
            state
                .record
                .as_ref()
                .filter(|r| r.call_id.as_ref() == Some(&call_id))
                .map(|r| r.phase)
        };
        match phase {
            Some(CallPhase::RingingOut) => {
                self.end_call(EndReason::TimedOut).await;
            }
            Some(CallPhase::RingingIn) => {
                self.record_missed(&call_id).await;
                self.end_call(EndReason::TimedOut).await;
            }
            _ => trace!(call_id = %call_id, "timeout for inactive call"),
        }
    }

    async fn on_remote_cancel(&self, call_id: CallId) {
        self.guard.mark_canceled(&call_id);
        let ringing = {
            let state = self.state.read().await;
            state
                .record
                .as_ref()
                .is_some_and(|r| r.phase == CallPhase::RingingIn && r.call_id.as_ref() == Some(&call_id))
        };
        if ringing {
            self.record_missed(&call_id).await;
            self.end_call(EndReason::Canceled).await;
        } else {
            trace!(call_id = %call_id, "cancel for inactive call");
        }
    }

    async fn on_busy(&self, from: PeerId) {
        self.emit(SessionEvent::PeerBusy { from: from.clone() });
        let dialing = {
            let state = self.state.read().await;
            state.record.as_ref().is_some_and(|r| {
                matches!(r.phase, CallPhase::Dialing | CallPhase::RingingOut)
                    && r.partner.peer == from
            })
        };
        if dialing {
            self.end_call(EndReason::Busy).await;
        }
    }

    async fn on_offer(&self, from: PeerId, offer: SessionDescription) {
        let Some(session) = self.bound_session().await else {
            trace!(from = %from, "offer with no bound session dropped");
            return;
        };
        if session.partner() != &from {
            debug!(from = %from, "offer from a foreign party dropped");
            return;
        }
        let outcome: Result<(), CallError> = async {
            session.set_remote_description(offer).await?;
            let answer = session.create_answer().await?;
            self.channel
                .send(ClientEvent::Answer { to: from, answer })
                .await?;
            Ok(())
        }
        .await;
        match outcome {
            // The callee is connected once its answer is on the wire.
            Ok(()) if session.kind() == SessionType::Direct => self.complete_connection().await,
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "failed to answer offer");
                if session.kind() == SessionType::Direct {
                    self.end_call(EndReason::TransportLost).await;
                }
            }
        }
    }

    async fn on_answer(&self, from: PeerId, answer: SessionDescription) {
        let Some(session) = self.bound_session().await else {
            trace!(from = %from, "answer with no bound session dropped");
            return;
        };
        if session.partner() != &from {
            debug!(from = %from, "answer from a foreign party dropped");
            return;
        }
        match session.set_remote_description(answer).await {
            // The caller is connected once the answer is applied.
            Ok(()) if session.kind() == SessionType::Direct => self.complete_connection().await,
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "failed to apply answer");
                if session.kind() == SessionType::Direct {
                    self.end_call(EndReason::TransportLost).await;
                }
            }
        }
    }

    async fn on_candidate(&self, from: PeerId, candidate: IceCandidate) {
        match self.bound_session().await {
            Some(session) => {
                if let Err(e) = session.add_remote_candidate(from, candidate).await {
                    warn!(error = %e, "failed to apply remote candidate");
                }
            }
            None => {
                // Buffer only while a call attempt is in flight; unsolicited
                // candidates with no call would otherwise pile up and replay
                // into the next session.
                let attempt_live = self.state.read().await.record.is_some();
                if attempt_live {
                    trace!(from = %from, "buffering candidate until a session exists");
                    self.pending_candidates.lock().push((from, candidate));
                } else {
                    trace!(from = %from, "unsolicited candidate with no call dropped");
                }
            }
        }
    }

    async fn on_media_event(self: &Arc<Self>, event: MediaEvent) {
        match event {
            MediaEvent::LocalCandidate { room, candidate } => {
                let Some(session) = self.session_for_room(&room).await else {
                    trace!(room = %room, "candidate from stale session dropped");
                    return;
                };
                self.send_best_effort(ClientEvent::IceCandidate {
                    to: session.partner().clone(),
                    candidate,
                })
                .await;
            }
            MediaEvent::RemoteStream { room, stream } => {
                if self.session_for_room(&room).await.is_some() {
                    self.emit(SessionEvent::RemoteStreamAdded { stream });
                }
            }
            MediaEvent::TransportLost { room } => self.on_transport_lost(room).await,
        }
    }

    async fn on_transport_lost(self: &Arc<Self>, room: RoomId) {
        let active = {
            let state = self.state.read().await;
            state.record.as_ref().is_some_and(|r| r.phase == CallPhase::Active)
                && state
                    .session
                    .as_ref()
                    .is_some_and(|s| s.room_id() == &room)
        };
        if !active {
            trace!(room = %room, "transport loss from stale session");
            return;
        }
        match self.config.disconnect_grace {
            Some(grace) => {
                warn!(room = %room, grace_secs = grace.as_secs(), "transport lost, arming grace hangup");
                let weak = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let Some(manager) = weak.upgrade() else { return };
                    let still_lost = {
                        let state = manager.state.read().await;
                        state.record.as_ref().is_some_and(|r| r.phase == CallPhase::Active)
                            && state.session.as_ref().is_some_and(|s| s.room_id() == &room)
                    };
                    if still_lost {
                        manager.end_call(EndReason::TransportLost).await;
                    }
                });
                if let Some(old) = self.grace_timer.lock().replace(handle) {
                    old.abort();
                }
            }
            None => {
                warn!(room = %room, "transport lost, host-driven hangup expected");
            }
        }
    }

    async fn open_direct_session(
        self: &Arc<Self>,
        call_id: &CallId,
        partner: &PartnerMeta,
    ) -> Result<Arc<PeerSession>, CallError> {
        let token = self.ownership.acquire(SessionType::Direct);
        let session = PeerSession::open(
            SessionType::Direct,
            RoomId::from(call_id),
            partner.peer.clone(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.channel),
            token,
            self.media_tx.clone(),
        )
        .await?;
        session
            .attach_local_stream(self.config.constraints)
            .await?;
        self.state.write().await.session = Some(Arc::clone(&session));

        // Candidates that raced ahead of the session; the session still
        // buffers them until the remote description lands.
        let buffered: Vec<_> = {
            let mut pending = self.pending_candidates.lock();
            std::mem::take(&mut *pending)
        };
        for (from, candidate) in buffered {
            if let Err(e) = session.add_remote_candidate(from, candidate).await {
                warn!(error = %e, "failed to replay buffered candidate");
            }
        }
        Ok(session)
    }

    async fn complete_connection(&self) {
        let connected = {
            let mut state = self.state.write().await;
            match state.record.as_mut() {
                Some(record) if record.phase == CallPhase::Negotiating => {
                    record.phase = CallPhase::Active;
                    record.connected_at = Some(Utc::now());
                    record
                        .call_id
                        .clone()
                        .map(|call_id| (call_id, record.partner.clone()))
                }
                _ => None,
            }
        };
        let Some((call_id, partner)) = connected else {
            return;
        };
        self.emit_phase(CallPhase::Negotiating, CallPhase::Active);
        self.emit(SessionEvent::CallConnected {
            call_id: call_id.clone(),
            partner: partner.clone(),
        });
        info!(call_id = %call_id, peer = %partner.peer, "call connected");
        if let Some(navigation) = &self.navigation {
            navigation.call_screen_entered(&partner);
        }
        if let Err(e) = self.ledger.reset(&partner.peer).await {
            warn!(error = %e, "failed to reset missed-call count");
        }
    }

    async fn record_missed(&self, call_id: &CallId) {
        match self.ledger.resolve_missed(call_id).await {
            Ok(Some((peer, count))) => {
                self.emit(SessionEvent::MissedCall { peer, count });
            }
            Ok(None) => trace!(call_id = %call_id, "missed occurrence already resolved"),
            Err(e) => warn!(error = %e, "failed to persist missed call"),
        }
    }

    async fn end_call(&self, reason: EndReason) {
        let (previous, call_id, session, was_in_call) = {
            let mut state = self.state.write().await;
            let Some(record) = state.record.take() else {
                return;
            };
            (
                record.phase,
                record.call_id,
                state.session.take(),
                record.phase.is_in_call(),
            )
        };
        self.abort_call_timer();
        if let Some(handle) = self.grace_timer.lock().take() {
            handle.abort();
        }
        self.pending_candidates.lock().clear();

        if was_in_call {
            self.emit_phase(previous, CallPhase::Ending);
        }
        if let Some(session) = session {
            session.cleanup().await;
        }
        self.continuity.exit();
        if let Some(navigation) = &self.navigation {
            if was_in_call {
                navigation.call_screen_left();
            }
        }
        info!(reason = %reason, "call ended");
        self.emit(SessionEvent::CallEnded {
            call_id,
            reason,
        });
        self.emit_phase(
            if was_in_call { CallPhase::Ending } else { previous },
            CallPhase::Idle,
        );
    }

    fn arm_call_timer(self: &Arc<Self>, call_id: CallId, after: Duration, kind: TimerKind) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(manager) = weak.upgrade() else { return };
            manager.on_timer_fired(kind, call_id).await;
        });
        if let Some(old) = self.call_timer.lock().replace(handle) {
            old.abort();
        }
    }

    fn abort_call_timer(&self) {
        if let Some(handle) = self.call_timer.lock().take() {
            handle.abort();
        }
    }

    async fn on_timer_fired(&self, kind: TimerKind, call_id: CallId) {
        // A stale fire re-checks phase and id; transitions raced ahead win.
        let phase = {
            let state = self.state.read().await;
            state
                .record
                .as_ref()
                .filter(|r| r.call_id.as_ref() == Some(&call_id))
                .map(|r| r.phase)
        };
        match (kind, phase) {
            (TimerKind::Dial, Some(CallPhase::RingingOut)) => {
                info!(call_id = %call_id, "outgoing ring timed out");
                self.guard.mark_timed_out(&call_id);
                self.end_call(EndReason::TimedOut).await;
            }
            (TimerKind::RingFallback, Some(CallPhase::RingingIn)) => {
                info!(call_id = %call_id, "incoming ring fallback fired");
                // Check suppression first: an explicit terminal event for the
                // same id may have resolved the occurrence already.
                if !self.guard.is_suppressed(&call_id) {
                    self.guard.mark_timed_out(&call_id);
                }
                self.record_missed(&call_id).await;
                self.end_call(EndReason::TimedOut).await;
            }
            _ => trace!(call_id = %call_id, "stale timer fire ignored"),
        }
    }

    async fn bound_session(&self) -> Option<Arc<PeerSession>> {
        match self.ownership.bound() {
            Some(SessionType::Direct) => self.state.read().await.session.clone(),
            Some(SessionType::Matchmaking) => self.matchmaking.lock().clone(),
            None => None,
        }
    }

    async fn session_for_room(&self, room: &RoomId) -> Option<Arc<PeerSession>> {
        if let Some(session) = self.state.read().await.session.clone() {
            if session.room_id() == room {
                return Some(session);
            }
        }
        self.matchmaking
            .lock()
            .clone()
            .filter(|s| s.room_id() == room)
    }

    async fn any_session(&self, intent: &'static str) -> Result<Arc<PeerSession>, CallError> {
        if let Some(session) = self.state.read().await.session.clone() {
            return Ok(session);
        }
        if let Some(session) = self.matchmaking.lock().clone() {
            return Ok(session);
        }
        Err(CallError::InvalidState {
            intent,
            phase: self.current_phase().await,
        })
    }

    async fn send_best_effort(&self, event: ClientEvent) {
        if let Err(e) = self.channel.send(event).await {
            warn!(error = %e, "failed to send signaling event");
        }
    }

    fn emit_phase(&self, previous: CallPhase, current: CallPhase) {
        self.emit(SessionEvent::PhaseChanged { previous, current });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("no session event subscribers");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::memory::{FakeMediaRuntime, MemoryKv, MemoryRelay};
    use crate::wire::ProfileFields;

    struct Harness {
        relay: MemoryRelay,
        manager: Arc<CallSessionManager>,
        identity: Arc<IdentityManager>,
    }

    async fn harness(peer: &str) -> Harness {
        let relay = MemoryRelay::new();
        harness_on(&relay, peer).await
    }

    async fn harness_on(relay: &MemoryRelay, peer: &str) -> Harness {
        let channel = SignalingChannel::new(
            relay.transport(PeerId::new(peer)),
            ChannelConfig::default(),
        );
        channel.connect();
        let identity = IdentityManager::new(Arc::clone(&channel), format!("install-{peer}"));
        identity.start();
        let ledger = Arc::new(MissedCallLedger::new(Arc::new(MemoryKv::new())));
        let manager = CallSessionManager::new(
            channel,
            Arc::clone(&identity),
            FakeMediaRuntime::new(),
            ledger,
            Arc::new(SignalingOwnership::new()),
            Arc::new(ContinuityBridge::new()),
            None,
            SessionConfig::default(),
        );
        manager.start().unwrap();
        Harness {
            relay: relay.clone(),
            manager,
            identity,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_refused_while_unauthenticated() {
        let hx = harness("alice").await;
        let err = hx
            .manager
            .initiate_call(PeerId::new("bob"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NotAuthenticated));
        assert_eq!(hx.manager.current_phase().await, CallPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_rejects_second_call() {
        let hx = harness("alice").await;
        hx.identity.attach(ProfileFields::default()).await.unwrap();

        hx.manager
            .initiate_call(PeerId::new("bob"), None)
            .await
            .unwrap();
        let err = hx
            .manager
            .initiate_call(PeerId::new("carol"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::InvalidState {
                intent: "initiate_call",
                phase: CallPhase::RingingOut
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_failure_returns_to_idle() {
        let hx = harness("alice").await;
        hx.identity.attach(ProfileFields::default()).await.unwrap();
        hx.relay
            .refuse_initiate(&PeerId::new("alice"), Some("unknown peer"));

        let err = hx
            .manager
            .initiate_call(PeerId::new("bob"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InitiateFailed(msg) if msg == "unknown peer"));
        assert_eq!(hx.manager.current_phase().await, CallPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_full_rejection_is_typed() {
        let hx = harness("alice").await;
        hx.identity.attach(ProfileFields::default()).await.unwrap();
        hx.relay
            .refuse_initiate(&PeerId::new("alice"), Some("room_full"));

        let err = hx
            .manager
            .initiate_call(PeerId::new("bob"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::RoomFull));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_without_invitation_is_invalid() {
        let hx = harness("alice").await;
        let err = hx.manager.accept_call().await.unwrap_err();
        assert!(matches!(
            err,
            CallError::InvalidState {
                intent: "accept_call",
                phase: CallPhase::Idle
            }
        ));
        assert!(matches!(
            hx.manager.hangup().await.unwrap_err(),
            CallError::InvalidState { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_tracks_outgoing_attempt() {
        let hx = harness("alice").await;
        hx.identity.attach(ProfileFields::default()).await.unwrap();

        assert!(hx.manager.snapshot().await.is_none());
        let call_id = hx
            .manager
            .initiate_call(PeerId::new("bob"), Some("bobby".to_string()))
            .await
            .unwrap();

        let snapshot = hx.manager.snapshot().await.unwrap();
        assert_eq!(snapshot.call_id, Some(call_id));
        assert_eq!(snapshot.partner.peer, PeerId::new("bob"));
        assert_eq!(snapshot.partner.nick.as_deref(), Some("bobby"));
        assert_eq!(snapshot.direction, CallDirection::Outgoing);
        assert_eq!(snapshot.phase, CallPhase::RingingOut);
        assert!(snapshot.connected_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails() {
        let hx = harness("alice").await;
        assert!(matches!(
            hx.manager.start().unwrap_err(),
            CallError::AlreadyStarted
        ));
    }
}
