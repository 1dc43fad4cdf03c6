//! Ordering races, ring timeouts, and handler ownership
//!
//! Exercises the suppression of invitations whose terminal event arrived
//! first, the local bounds on unanswered rings under a paused clock, the
//! at-most-once missed accounting, and the single-slot signaling ownership
//! between direct and matchmaking sessions.

#![allow(clippy::unwrap_used, clippy::panic)]

use saorsa_calls_core::memory::{FakeMediaRuntime, MemoryKv, MemoryRelay};
use saorsa_calls_core::types::{
    CallId, CallPhase, EndReason, PeerId, RoomId, SessionEvent, SessionType,
};
use saorsa_calls_core::wire::{ProfileFields, ServerEvent};
use saorsa_calls_core::CallStack;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct TestStack {
    stack: CallStack,
    events: broadcast::Receiver<SessionEvent>,
}

async fn spawn_stack(relay: &MemoryRelay, name: &'static str) -> TestStack {
    let stack = CallStack::builder()
        .transport(relay.transport(PeerId::new(name)))
        .store(Arc::new(MemoryKv::new()))
        .media_runtime(FakeMediaRuntime::new())
        .install_id(format!("install-{name}"))
        .build()
        .unwrap();
    stack.start().unwrap();
    let events = stack.subscribe_events();
    stack.attach(ProfileFields::default()).await.unwrap();
    TestStack { stack, events }
}

impl TestStack {
    async fn wait_for<T>(&mut self, pick: impl Fn(&SessionEvent) -> Option<T>) -> T {
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                let event = self.events.recv().await.unwrap();
                if let Some(found) = pick(&event) {
                    return found;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn wait_for_ended(&mut self) -> EndReason {
        self.wait_for(|event| match event {
            SessionEvent::CallEnded { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .await
    }

    async fn phase(&self) -> CallPhase {
        self.stack.manager().current_phase().await
    }

    /// Let in-flight dispatch settle, then pull everything off the bus.
    async fn settle_and_drain(&mut self) -> Vec<SessionEvent> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

fn incoming(call_id: &str, from: &str) -> ServerEvent {
    ServerEvent::CallIncoming {
        call_id: CallId::new(call_id),
        from: PeerId::new(from),
        from_nick: None,
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_arriving_first_suppresses_the_invitation() {
    let relay = MemoryRelay::new();
    let mut bob = spawn_stack(&relay, "bob").await;
    let bob_id = PeerId::new("bob");
    let alice = PeerId::new("alice");

    // The cancel overtook its own invitation in delivery order.
    relay.inject(
        &bob_id,
        ServerEvent::CallCancel {
            call_id: CallId::new("call-race"),
            from: alice.clone(),
        },
    );
    relay.inject(&bob_id, incoming("call-race", "alice"));

    let drained = bob.settle_and_drain().await;
    assert!(
        !drained
            .iter()
            .any(|e| matches!(e, SessionEvent::IncomingCall { .. })),
        "suppressed invitation must never ring: {drained:?}"
    );
    assert_eq!(bob.phase().await, CallPhase::Idle);
    assert_eq!(bob.stack.ledger().count_for(&alice).await.unwrap(), 0);

    // A fresh invitation with its own id still rings.
    relay.inject(&bob_id, incoming("call-fresh", "alice"));
    let ringing_id = bob
        .wait_for(|event| match event {
            SessionEvent::IncomingCall { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .await;
    assert_eq!(ringing_id, CallId::new("call-fresh"));
}

#[tokio::test(start_paused = true)]
async fn timeout_arriving_first_suppresses_the_invitation() {
    let relay = MemoryRelay::new();
    let mut bob = spawn_stack(&relay, "bob").await;
    let bob_id = PeerId::new("bob");

    relay.inject(
        &bob_id,
        ServerEvent::CallTimeout {
            call_id: CallId::new("call-late"),
        },
    );
    relay.inject(&bob_id, incoming("call-late", "alice"));

    let drained = bob.settle_and_drain().await;
    assert!(!drained
        .iter()
        .any(|e| matches!(e, SessionEvent::IncomingCall { .. })));
    assert_eq!(bob.phase().await, CallPhase::Idle);
    // The ring never started, so nothing was armed and nothing is missed.
    assert_eq!(
        bob.stack
            .ledger()
            .count_for(&PeerId::new("alice"))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_outgoing_call_times_out_locally() {
    let relay = MemoryRelay::new();
    let mut alice = spawn_stack(&relay, "alice").await;

    // The callee never connects, so nothing will ever answer.
    alice
        .stack
        .manager()
        .initiate_call(PeerId::new("bob"), None)
        .await
        .unwrap();
    alice
        .wait_for(|event| match event {
            SessionEvent::OutgoingRinging { .. } => Some(()),
            _ => None,
        })
        .await;
    assert_eq!(alice.phase().await, CallPhase::RingingOut);

    // The paused clock jumps straight to the 20s dial bound.
    assert_eq!(alice.wait_for_ended().await, EndReason::TimedOut);
    assert_eq!(alice.phase().await, CallPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn unanswered_incoming_ring_falls_back_and_counts_one_miss() {
    let relay = MemoryRelay::new();
    let mut bob = spawn_stack(&relay, "bob").await;
    let carol = PeerId::new("carol");

    relay.inject(&PeerId::new("bob"), incoming("call-fallback", "carol"));
    bob.wait_for(|event| match event {
        SessionEvent::IncomingCall { .. } => Some(()),
        _ => None,
    })
    .await;

    // The relay never sends its own timeout; the local fallback resolves it.
    let (peer, count) = bob
        .wait_for(|event| match event {
            SessionEvent::MissedCall { peer, count } => Some((peer.clone(), *count)),
            _ => None,
        })
        .await;
    assert_eq!(peer, carol);
    assert_eq!(count, 1);
    assert_eq!(bob.wait_for_ended().await, EndReason::TimedOut);

    assert_eq!(bob.stack.ledger().count_for(&carol).await.unwrap(), 1);
    assert_eq!(
        bob.stack.ledger().last_missed_from().await.unwrap(),
        Some(carol)
    );
}

#[tokio::test(start_paused = true)]
async fn explicit_timeout_and_fallback_never_double_count() {
    let relay = MemoryRelay::new();
    let mut bob = spawn_stack(&relay, "bob").await;
    let bob_id = PeerId::new("bob");
    let carol = PeerId::new("carol");

    relay.inject(&bob_id, incoming("call-both", "carol"));
    bob.wait_for(|event| match event {
        SessionEvent::IncomingCall { .. } => Some(()),
        _ => None,
    })
    .await;

    // The relay's explicit timeout lands before the local fallback would.
    relay.inject(
        &bob_id,
        ServerEvent::CallTimeout {
            call_id: CallId::new("call-both"),
        },
    );
    assert_eq!(bob.wait_for_ended().await, EndReason::TimedOut);
    assert_eq!(bob.stack.ledger().count_for(&carol).await.unwrap(), 1);

    // Sail past the fallback deadline; the occurrence stays counted once.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let drained = bob.settle_and_drain().await;
    assert!(!drained
        .iter()
        .any(|e| matches!(e, SessionEvent::MissedCall { .. })));
    assert_eq!(bob.stack.ledger().count_for(&carol).await.unwrap(), 1);
    assert_eq!(bob.phase().await, CallPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn invitation_is_dropped_while_another_attempt_is_live() {
    let relay = MemoryRelay::new();
    let mut bob = spawn_stack(&relay, "bob").await;
    let bob_id = PeerId::new("bob");
    let carol = PeerId::new("carol");

    // Ring out toward a peer that never answers, then get rung ourselves.
    bob.stack
        .manager()
        .initiate_call(PeerId::new("zed"), None)
        .await
        .unwrap();
    bob.wait_for(|event| match event {
        SessionEvent::OutgoingRinging { .. } => Some(()),
        _ => None,
    })
    .await;

    relay.inject(&bob_id, incoming("call-second", "carol"));
    let drained = bob.settle_and_drain().await;
    assert!(
        !drained
            .iter()
            .any(|e| matches!(e, SessionEvent::IncomingCall { .. })),
        "a busy session must not surface a second invitation"
    );
    assert_eq!(bob.phase().await, CallPhase::RingingOut);
    // Dropped silently: the caller's side attributes the miss, not ours.
    assert_eq!(bob.stack.ledger().count_for(&carol).await.unwrap(), 0);

    // The original attempt is still the live one and can be abandoned.
    bob.stack.manager().hangup().await.unwrap();
    assert_eq!(bob.wait_for_ended().await, EndReason::HungUp);
    assert!(relay
        .sent_by(&bob_id)
        .iter()
        .any(|e| matches!(e, saorsa_calls_core::wire::ClientEvent::CallCancel { .. })));
}

#[tokio::test(start_paused = true)]
async fn matchmaking_session_holds_the_slot_without_being_stolen() {
    let relay = MemoryRelay::new();
    let mut bob = spawn_stack(&relay, "bob").await;
    let bob_id = PeerId::new("bob");

    let session = bob
        .stack
        .manager()
        .open_matchmaking_session(RoomId::new("lobby-7"), PeerId::new("carol"))
        .await
        .unwrap();
    assert!(session.is_bound());
    assert_eq!(bob.stack.ownership().handler_count(), 1);
    assert_eq!(
        bob.stack.ownership().bound(),
        Some(SessionType::Matchmaking)
    );

    // Accepting a direct call while the room holds the slot brings the
    // media session up, but routing stays with the current holder.
    relay.inject(&bob_id, incoming("call-direct", "dave"));
    bob.wait_for(|event| match event {
        SessionEvent::IncomingCall { .. } => Some(()),
        _ => None,
    })
    .await;
    bob.stack.manager().accept_call().await.unwrap();
    assert_eq!(bob.phase().await, CallPhase::Negotiating);
    assert_eq!(
        bob.stack.ownership().bound(),
        Some(SessionType::Matchmaking)
    );
    assert_eq!(bob.stack.ownership().handler_count(), 1);

    // Releasing the holder frees the slot for the next session.
    bob.stack.manager().close_matchmaking_session().await;
    assert_eq!(bob.stack.ownership().handler_count(), 0);
    assert_eq!(bob.stack.ownership().bound(), None);

    bob.stack.manager().hangup().await.unwrap();
    assert_eq!(bob.wait_for_ended().await, EndReason::HungUp);
}

#[tokio::test(start_paused = true)]
async fn replacing_a_matchmaking_session_reuses_the_slot() {
    let relay = MemoryRelay::new();
    let bob = spawn_stack(&relay, "bob").await;

    let first = bob
        .stack
        .manager()
        .open_matchmaking_session(RoomId::new("lobby-1"), PeerId::new("carol"))
        .await
        .unwrap();
    let second = bob
        .stack
        .manager()
        .open_matchmaking_session(RoomId::new("lobby-2"), PeerId::new("dave"))
        .await
        .unwrap();

    // The first session was cleaned up and released before the second bound.
    assert!(!first.is_bound());
    assert!(second.is_bound());
    assert_eq!(bob.stack.ownership().handler_count(), 1);

    bob.stack.manager().close_matchmaking_session().await;
    assert_eq!(bob.stack.ownership().handler_count(), 0);
}
