//! Link loss, re-authentication gating, and request budgets
//!
//! Drives a full stack over the in-process relay while severing links and
//! swallowing acknowledgements, checking that trust is suspended during the
//! gap, call control is refused until reauth completes, and requests fail
//! with typed errors once their budgets run out.

#![allow(clippy::unwrap_used, clippy::panic)]

use saorsa_calls_core::channel::ChannelError;
use saorsa_calls_core::memory::{FakeMediaRuntime, MemoryKv, MemoryRelay};
use saorsa_calls_core::session::CallError;
use saorsa_calls_core::types::{CallPhase, EndReason, PeerId, SessionEvent};
use saorsa_calls_core::wire::{ClientEvent, ProfileFields};
use saorsa_calls_core::{CallStack, IdentityError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct TestStack {
    stack: CallStack,
    events: broadcast::Receiver<SessionEvent>,
}

fn build_stack(relay: &MemoryRelay, name: &'static str) -> TestStack {
    let stack = CallStack::builder()
        .transport(relay.transport(PeerId::new(name)))
        .store(Arc::new(MemoryKv::new()))
        .media_runtime(FakeMediaRuntime::new())
        .install_id(format!("install-{name}"))
        .build()
        .unwrap();
    stack.start().unwrap();
    let events = stack.subscribe_events();
    TestStack { stack, events }
}

async fn spawn_stack(relay: &MemoryRelay, name: &'static str) -> TestStack {
    let stack = build_stack(relay, name);
    stack.stack.attach(ProfileFields::default()).await.unwrap();
    stack
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
}

#[tokio::test(start_paused = true)]
async fn attach_refusal_is_a_typed_rejection() {
    let relay = MemoryRelay::new();
    relay.refuse_attach(&PeerId::new("alice"), true);
    let alice = build_stack(&relay, "alice");

    let err = alice
        .stack
        .attach(ProfileFields::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::Rejected(reason) if reason == "attach refused"));
    assert!(!alice.stack.identity().is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn swallowed_acks_exhaust_the_retry_budget() {
    let relay = MemoryRelay::new();
    let alice_id = PeerId::new("alice");
    let mut alice = spawn_stack(&relay, "alice").await;
    relay.silence_acks(&alice_id, true);

    let err = alice
        .stack
        .manager()
        .initiate_call(PeerId::new("bob"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::Channel(ChannelError::AckTimeout { attempts: 3, .. })
    ));

    // Every attempt went out on the wire before the budget ran out.
    let initiates = relay
        .sent_by(&alice_id)
        .iter()
        .filter(|e| matches!(e, ClientEvent::CallInitiate { .. }))
        .count();
    assert_eq!(initiates, 3);

    let reason = alice
        .wait_for(|event| match event {
            SessionEvent::CallEnded { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .await;
    assert!(matches!(reason, EndReason::InitiateFailed(_)));
    assert_eq!(
        alice.stack.manager().current_phase().await,
        CallPhase::Idle
    );
}

#[tokio::test(start_paused = true)]
async fn link_gap_suspends_trust_until_reauth_completes() {
    let relay = MemoryRelay::new();
    let alice_id = PeerId::new("alice");
    let mut alice = spawn_stack(&relay, "alice").await;
    let mut bob = spawn_stack(&relay, "bob").await;
    assert!(alice.stack.identity().is_authenticated());

    let mut auth = alice.stack.identity().subscribe_auth();
    relay.sever(&alice_id);
    auth.wait_for(|state| !state.is_authenticated())
        .await
        .unwrap();

    // Call control is gated while the new link is still untrusted.
    let err = alice
        .stack
        .manager()
        .initiate_call(PeerId::new("bob"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotAuthenticated));

    // The channel reconnects on its own and reauth restores trust.
    auth.wait_for(|state| state.is_authenticated())
        .await
        .unwrap();

    // Calls flow again over the fresh link.
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
    let from = bob
        .wait_for(|event| match event {
            SessionEvent::IncomingCall { from, .. } => Some(from.clone()),
            _ => None,
        })
        .await;
    assert_eq!(from, alice_id);
}

#[tokio::test(start_paused = true)]
async fn requests_after_shutdown_report_offline() {
    let relay = MemoryRelay::new();
    let alice = spawn_stack(&relay, "alice").await;

    alice.stack.shutdown();
    let err = alice
        .stack
        .channel()
        .request(
            ClientEvent::CallInitiate {
                to: PeerId::new("bob"),
            },
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Offline(_) | ChannelError::Closed
    ));
}
