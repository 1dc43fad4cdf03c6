//! Auto-reconnecting signaling channel with acknowledged requests
//!
//! The channel owns one duplex link to the relay at a time. A driver task
//! reconnects with a capped growing delay and publishes link status through a
//! watch channel. Outbound traffic is either fire-and-forget or a request
//! carrying a correlation id; acknowledgements resolve oneshot waiters, so a
//! request resolves or times out exactly once, never both.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, info, trace, warn};

use crate::wire::{AckBody, ClientEvent, ClientFrame, ServerEvent, ServerFrame};

/// Link-level transport errors
#[derive(Error, Debug)]
pub enum LinkError {
    /// The relay refused or could not be reached
    #[error("link connect failed: {0}")]
    Connect(String),

    /// The established link failed
    #[error("link io error: {0}")]
    Io(String),
}

/// Channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No connection within the connect-wait budget
    #[error("signaling channel offline: no connection within {0:?}")]
    Offline(Duration),

    /// No acknowledgement after all attempts
    #[error("no acknowledgement for {event} after {attempts} attempts")]
    AckTimeout {
        /// Wire name of the requested event
        event: &'static str,
        /// Attempts made, including the first
        attempts: u32,
    },

    /// The channel was shut down
    #[error("signaling channel closed")]
    Closed,

    /// A frame could not be serialized
    #[error("wire encoding failed: {0}")]
    Wire(String),
}

/// Factory for duplex links to the relay
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Establish one link, split into its two directions
    async fn connect(&self) -> Result<(Box<dyn LinkSender>, Box<dyn LinkReceiver>), LinkError>;
}

/// Outbound half of a link
#[async_trait]
pub trait LinkSender: Send {
    /// Send one frame
    async fn send(&mut self, frame: Bytes) -> Result<(), LinkError>;
}

/// Inbound half of a link
#[async_trait]
pub trait LinkReceiver: Send {
    /// Receive the next frame; `None` means the remote closed the link
    async fn recv(&mut self) -> Result<Option<Bytes>, LinkError>;
}

/// Connectivity state published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No link, not currently trying
    Offline,
    /// A connection attempt is in flight
    Connecting,
    /// The link is up
    Connected,
}

impl LinkStatus {
    /// True when traffic can flow
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Budget a suspended request waits for connectivity
    pub connect_wait: Duration,
    /// Per-attempt acknowledgement timeout
    pub ack_timeout: Duration,
    /// Extra request attempts after the first
    pub default_retries: u32,
    /// Lower bound of the jittered retry backoff
    pub backoff_min: Duration,
    /// Upper bound of the jittered retry backoff
    pub backoff_max: Duration,
    /// Cap on the reconnect delay
    pub reconnect_cap: Duration,
    /// Inbound event buffer size
    pub event_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_wait: Duration::from_secs(7),
            ack_timeout: Duration::from_secs(5),
            default_retries: 2,
            backoff_min: Duration::from_millis(250),
            backoff_max: Duration::from_millis(550),
            reconnect_cap: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

/// Persistent duplex event channel to the relay
pub struct SignalingChannel {
    transport: Arc<dyn LinkTransport>,
    config: ChannelConfig,
    status_tx: watch::Sender<LinkStatus>,
    sender: AsyncMutex<Option<Box<dyn LinkSender>>>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<AckBody>>>,
    next_request_id: AtomicU64,
    events_tx: mpsc::Sender<ServerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    reconnect_errors: AtomicU32,
}

impl SignalingChannel {
    /// Create a channel over a link transport
    #[must_use]
    pub fn new(transport: Arc<dyn LinkTransport>, config: ChannelConfig) -> Arc<Self> {
        let (status_tx, _) = watch::channel(LinkStatus::Offline);
        let (shutdown_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        Arc::new(Self {
            transport,
            config,
            status_tx,
            sender: AsyncMutex::new(None),
            waiters: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            started: AtomicBool::new(false),
            shutdown_tx,
            reconnect_errors: AtomicU32::new(0),
        })
    }

    /// Start the reconnect driver; calling again is a no-op
    pub fn connect(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            trace!("signaling channel already started");
            return;
        }
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            channel.run().await;
        });
    }

    /// Stop the driver and drop the current link
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Current link status
    pub fn status(&self) -> LinkStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to connect/disconnect transitions
    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    /// Take the inbound event stream; only the first caller receives it
    pub fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events_rx.lock().take()
    }

    /// Send a fire-and-forget event
    ///
    /// Dropped silently when the link is down; there is no delivery
    /// guarantee on this path.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Wire`] if the event cannot be serialized
    pub async fn send(&self, event: ClientEvent) -> Result<(), ChannelError> {
        let name = event.name();
        let bytes = ClientFrame::fire(event)
            .to_bytes()
            .map_err(|e| ChannelError::Wire(e.to_string()))?;
        if self.send_raw(bytes).await {
            trace!(event = name, "sent fire-and-forget event");
        } else {
            trace!(event = name, "dropped fire-and-forget event while offline");
        }
        Ok(())
    }

    /// Send a request and await its acknowledgement
    ///
    /// Suspends until the link is up (within the connect-wait budget), then
    /// retries on per-attempt ack timeout with jittered backoff. `timeout`
    /// and `retries` override the configured defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Offline`] when no link exists within the
    /// budget, [`ChannelError::AckTimeout`] after all attempts go
    /// unacknowledged, [`ChannelError::Wire`] on serialization failure
    #[tracing::instrument(skip(self, event), fields(event = event.name()))]
    pub async fn request(
        &self,
        event: ClientEvent,
        timeout: Option<Duration>,
        retries: Option<u32>,
    ) -> Result<AckBody, ChannelError> {
        let per_attempt = timeout.unwrap_or(self.config.ack_timeout);
        let attempts = retries.unwrap_or(self.config.default_retries).saturating_add(1);

        for attempt in 1..=attempts {
            self.await_connected().await?;

            let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
            let (ack_tx, ack_rx) = oneshot::channel();
            self.waiters.lock().insert(request_id, ack_tx);

            let frame = ClientFrame::requested(request_id, event.clone());
            let bytes = match frame.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.waiters.lock().remove(&request_id);
                    return Err(ChannelError::Wire(e.to_string()));
                }
            };

            if self.send_raw(bytes).await {
                match tokio::time::timeout(per_attempt, ack_rx).await {
                    Ok(Ok(body)) => return Ok(body),
                    Ok(Err(_)) => {
                        // Waiter dropped by a link loss; the reconnect driver
                        // already cleared the map.
                        debug!(attempt, "request interrupted by link loss");
                    }
                    Err(_) => {
                        self.waiters.lock().remove(&request_id);
                        debug!(attempt, "acknowledgement timed out");
                    }
                }
            } else {
                self.waiters.lock().remove(&request_id);
                debug!(attempt, "link went down before send");
            }

            if attempt < attempts {
                let backoff = self.jittered_backoff();
                trace!(backoff_ms = backoff.as_millis() as u64, "retrying request");
                tokio::time::sleep(backoff).await;
            }
        }

        Err(ChannelError::AckTimeout {
            event: event.name(),
            attempts,
        })
    }

    async fn await_connected(&self) -> Result<(), ChannelError> {
        let mut status = self.status_tx.subscribe();
        if status.borrow().is_connected() {
            return Ok(());
        }
        let budget = self.config.connect_wait;
        let result = match tokio::time::timeout(budget, status.wait_for(LinkStatus::is_connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Offline(budget)),
        };
        result
    }

    async fn send_raw(&self, bytes: Bytes) -> bool {
        let mut sender = self.sender.lock().await;
        match sender.as_mut() {
            Some(link) => match link.send(bytes).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "link send failed, dropping sender half");
                    *sender = None;
                    false
                }
            },
            None => false,
        }
    }

    fn jittered_backoff(&self) -> Duration {
        let min = self.config.backoff_min.as_millis() as u64;
        let max = self.config.backoff_max.as_millis() as u64;
        let millis = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(millis)
    }

    async fn run(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.status_tx.send_replace(LinkStatus::Connecting);
            match self.transport.connect().await {
                Ok((tx_half, rx_half)) => {
                    self.reconnect_errors.store(0, Ordering::SeqCst);
                    *self.sender.lock().await = Some(tx_half);
                    self.status_tx.send_replace(LinkStatus::Connected);
                    info!("signaling link established");

                    let stopped = self.pump(rx_half, &mut shutdown).await;

                    *self.sender.lock().await = None;
                    self.status_tx.send_replace(LinkStatus::Offline);
                    self.fail_waiters();
                    if stopped {
                        break;
                    }
                }
                Err(e) => {
                    self.status_tx.send_replace(LinkStatus::Offline);
                    warn!(error = %e, "signaling link connect failed");
                }
            }

            let errors = self.reconnect_errors.fetch_add(1, Ordering::SeqCst) + 1;
            let delay =
                Duration::from_secs(u64::from(errors) * 2).min(self.config.reconnect_cap);
            debug!(delay_secs = delay.as_secs(), "scheduling signaling reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.status_tx.send_replace(LinkStatus::Offline);
        info!("signaling channel stopped");
    }

    /// Returns true when shut down, false when the link was lost
    async fn pump(
        &self,
        mut rx_half: Box<dyn LinkReceiver>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return true;
                    }
                }
                frame = rx_half.recv() => match frame {
                    Ok(Some(bytes)) => self.handle_frame(&bytes).await,
                    Ok(None) => {
                        warn!("signaling link closed by remote");
                        return false;
                    }
                    Err(e) => {
                        warn!(error = %e, "signaling link receive failed");
                        return false;
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        match ServerFrame::from_bytes(bytes) {
            Ok(ServerFrame::Ack(frame)) => {
                let waiter = self.waiters.lock().remove(&frame.ack);
                match waiter {
                    Some(tx) => {
                        if tx.send(frame.body).is_err() {
                            trace!(ack = frame.ack, "ack arrived after request gave up");
                        }
                    }
                    None => trace!(ack = frame.ack, "dropping ack with no waiter"),
                }
            }
            Ok(ServerFrame::Event(event)) => {
                trace!(event = event.name(), "inbound relay event");
                if self.events_tx.send(event).await.is_err() {
                    warn!("event consumer dropped, discarding inbound event");
                }
            }
            Err(e) => warn!(error = %e, "discarding malformed relay frame"),
        }
    }

    fn fail_waiters(&self) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock();
            waiters.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing in-flight requests on disconnect");
        }
        // Dropping the senders wakes every waiter with a recv error; the
        // request loop treats that as a failed attempt.
        drop(drained);
    }
}
