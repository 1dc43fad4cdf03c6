//! Scripted call flows over the in-process relay
//!
//! Two complete stacks share one [`MemoryRelay`] with scripted media
//! runtimes, so the whole signaling and lifecycle path runs for real while
//! capture and transport are simulated.

use anyhow::{Context, Result};
use saorsa_calls_core::memory::{FakeMediaRuntime, MemoryKv, MemoryRelay};
use saorsa_calls_core::types::{MediaConstraints, PeerId, SessionEvent};
use saorsa_calls_core::wire::ProfileFields;
use saorsa_calls_core::{CallStack, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Party {
    name: &'static str,
    stack: CallStack,
    runtime: Arc<FakeMediaRuntime>,
    events: broadcast::Receiver<SessionEvent>,
}

async fn join_relay(relay: &MemoryRelay, name: &'static str, video: bool) -> Result<Party> {
    let runtime = FakeMediaRuntime::new();
    let config = SessionConfig {
        constraints: if video {
            MediaConstraints::video_call()
        } else {
            MediaConstraints::audio_only()
        },
        ..SessionConfig::default()
    };
    let stack = CallStack::builder()
        .transport(relay.transport(PeerId::new(name)))
        .store(Arc::new(MemoryKv::new()))
        .media_runtime(Arc::clone(&runtime) as Arc<_>)
        .install_id(format!("install-{name}"))
        .session_config(config)
        .build()?;
    stack.start()?;
    let events = stack.subscribe_events();

    let grant = stack
        .attach(ProfileFields {
            nick: Some(name.to_string()),
            avatar: None,
        })
        .await?;
    println!("🔗 {name} attached as {}", grant.user_id);

    Ok(Party {
        name,
        stack,
        runtime,
        events,
    })
}

impl Party {
    /// Print events as they pass until the predicate picks one out.
    async fn wait_for<T>(&mut self, pick: impl Fn(&SessionEvent) -> Option<T>) -> Result<T> {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let event = self.events.recv().await.context("event bus closed")?;
                describe(self.name, &event);
                if let Some(found) = pick(&event) {
                    return Ok(found);
                }
            }
        })
        .await
        .context("timed out waiting for a session event")?
    }
}

fn describe(name: &str, event: &SessionEvent) {
    match event {
        SessionEvent::PhaseChanged { previous, current } => {
            println!("   {name}: {previous} -> {current}");
        }
        SessionEvent::IncomingCall { from, nick, .. } => {
            let caller = nick.as_deref().unwrap_or(from.as_str());
            println!("🔔 {name}: incoming call from {caller}");
        }
        SessionEvent::OutgoingRinging { to, .. } => {
            println!("📞 {name}: ringing {to}");
        }
        SessionEvent::CallConnected { partner, .. } => {
            println!("✅ {name}: connected to {}", partner.peer);
        }
        SessionEvent::CallEnded { reason, .. } => {
            println!("📴 {name}: call ended ({reason})");
        }
        SessionEvent::MissedCall { peer, count } => {
            println!("☎️  {name}: missed call from {peer} ({count} total)");
        }
        SessionEvent::RemoteCameraToggled { enabled, .. } => {
            let state = if *enabled { "on" } else { "off" };
            println!("🎥 {name}: remote camera {state}");
        }
        SessionEvent::RemoteStreamAdded { stream } => {
            println!("🎬 {name}: remote stream {} playing", stream.id());
        }
        SessionEvent::PeerBusy { from } => {
            println!("⛔ {name}: {from} is busy");
        }
        SessionEvent::RoomFull { .. } => {
            println!("⛔ {name}: room is full");
        }
    }
}

/// Accepted call with a camera toggle, optional picture-in-picture, hangup.
pub async fn run_call(video: bool, pip: bool) -> Result<()> {
    let relay = MemoryRelay::new();
    let mut alice = join_relay(&relay, "alice", video).await?;
    let mut bob = join_relay(&relay, "bob", video).await?;

    let call_id = alice
        .stack
        .manager()
        .initiate_call(PeerId::new("bob"), Some("bob".to_string()))
        .await?;
    println!("📞 alice: initiated {call_id}");

    bob.wait_for(|event| match event {
        SessionEvent::IncomingCall { .. } => Some(()),
        _ => None,
    })
    .await?;
    bob.stack.manager().accept_call().await?;

    alice
        .wait_for(|event| match event {
            SessionEvent::CallConnected { .. } => Some(()),
            _ => None,
        })
        .await?;
    bob.wait_for(|event| match event {
        SessionEvent::CallConnected { .. } => Some(()),
        _ => None,
    })
    .await?;

    // The scripted transport surfaces a remote stream on demand.
    if let Some(transport) = bob.runtime.last_transport() {
        transport.emit_remote_stream("alice-av");
    }
    bob.wait_for(|event| match event {
        SessionEvent::RemoteStreamAdded { .. } => Some(()),
        _ => None,
    })
    .await?;

    if video {
        let on = alice.stack.manager().toggle_camera().await?;
        println!("🎥 alice: camera {}", if on { "on" } else { "off" });
        bob.wait_for(|event| match event {
            SessionEvent::RemoteCameraToggled { enabled, .. } => Some(*enabled),
            _ => None,
        })
        .await?;
        let on = alice.stack.manager().toggle_camera().await?;
        println!("🎥 alice: camera {}", if on { "on" } else { "off" });
        bob.wait_for(|event| match event {
            SessionEvent::RemoteCameraToggled { enabled, .. } => Some(*enabled),
            _ => None,
        })
        .await?;
    }

    if pip {
        alice.stack.manager().enter_pip().await?;
        let bridge = alice.stack.continuity();
        if let Some((partner, entered_at)) = bridge.snapshot() {
            println!("🪟 alice: call with {} in pip since {entered_at}", partner.peer);
        }
        let muted = !bridge.toggle_mic()?;
        println!("🎙️ alice: mic {} from pip", if muted { "muted" } else { "live" });
        let partner = bridge.return_to_call()?;
        println!("🪟 alice: returned to the call with {}", partner.peer);
    }

    alice.stack.manager().hangup().await?;
    alice
        .wait_for(|event| match event {
            SessionEvent::CallEnded { .. } => Some(()),
            _ => None,
        })
        .await?;

    alice.stack.shutdown();
    bob.stack.shutdown();
    println!("👋 done");
    Ok(())
}

/// Cancel an outgoing call before it is answered and show the ledger.
pub async fn run_missed() -> Result<()> {
    let relay = MemoryRelay::new();
    let mut alice = join_relay(&relay, "alice", false).await?;
    let mut bob = join_relay(&relay, "bob", false).await?;

    alice
        .stack
        .manager()
        .initiate_call(PeerId::new("bob"), None)
        .await?;
    bob.wait_for(|event| match event {
        SessionEvent::IncomingCall { .. } => Some(()),
        _ => None,
    })
    .await?;

    println!("🤔 alice: hanging up before bob answers");
    alice.stack.manager().hangup().await?;

    let (peer, count) = bob
        .wait_for(|event| match event {
            SessionEvent::MissedCall { peer, count } => Some((peer.clone(), *count)),
            _ => None,
        })
        .await?;
    println!("📇 bob: ledger shows {count} missed from {peer}");
    let last = bob.stack.ledger().last_missed_from().await?;
    println!("📇 bob: most recent missed caller: {last:?}");

    alice.stack.shutdown();
    bob.stack.shutdown();
    Ok(())
}
