//! Restart recovery, de-duplication and teardown
//!
//! Timer-driven tests run on a paused clock: awaiting the next mesh event lets
//! tokio jump straight to the next armed timer.

mod harness;

use harness::{
    exchange, init_logging, introduced_pair, joined, joined_self, peer_left, MeshNode,
    MockBehavior,
};
use meshcall::media::{MediaKind, RemoteTrack};
use meshcall::peer::{MeshEvent, PeerConnectionState, PeerEvent, RecoveryPhase, TimerKind};
use meshcall::signaling::{SignalType, SignalingMessage};
use std::time::Duration;
use tokio::time::Instant;

fn offer_from(sender: &str, target: &str) -> SignalingMessage {
    SignalingMessage {
        sender_id: Some(sender.to_string()),
        ..SignalingMessage::offer(target, "v=0 remote offer")
    }
}

fn remote_audio(peer_id: &str) -> PeerEvent {
    PeerEvent::RemoteTrack(RemoteTrack {
        id: format!("{}-audio", peer_id),
        stream_id: format!("{}-stream", peer_id),
        kind: MediaKind::Audio,
        remote: None,
    })
}

/// b2 answers a1's offer; a1 never offers again since b2 does not initiate
async fn answering_node(behavior: MockBehavior, user_id: Option<&str>) -> MeshNode {
    let mut b = MeshNode::new("b2", behavior);
    b.start_media().await;
    b.receive(joined_self("b2")).await;
    b.receive(joined("a1", user_id, "Alice")).await;
    b.receive(offer_from("a1", "b2")).await;
    b.drain_events().await;
    b
}

// ============================================================================
// Bounded restarts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_peer_is_restarted_exactly_three_times() {
    init_logging();

    let start = Instant::now();
    let mut b = answering_node(MockBehavior::Fails, None).await;

    assert_eq!(
        b.manager.recovery_state("a1").unwrap().phase,
        RecoveryPhase::RestartScheduled
    );

    while let Some(event) = b.next_event().await {
        b.manager.handle_event(event).await;
    }

    // One original connection plus three restarts
    assert_eq!(b.factory.created("a1"), 4);

    let recovery = b.manager.recovery_state("a1").unwrap();
    assert_eq!(recovery.phase, RecoveryPhase::Exhausted);
    assert_eq!(recovery.attempts, 3);
    assert_eq!(b.manager.pending_timers(), 0);

    // Given up silently: still listed, still has a context
    assert!(b.manager.roster().contains("a1"));
    assert!(b.manager.has_peer("a1"));
    assert!(b.manager.snapshot().error.is_none());

    // 3 x (2s restart delay + 8s watchdog)
    assert!(start.elapsed() >= Duration::from_secs(30));

    let history = b.factory.history("a1");
    assert!(history[..3].iter().all(|peer| peer.is_closed()));
    assert!(!history[3].is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_silent_connection_is_restarted_by_watchdog() {
    let mut b = answering_node(MockBehavior::ConnectsSilently, None).await;

    assert_eq!(
        b.manager.connection_state("a1"),
        Some(PeerConnectionState::Connected)
    );
    assert_eq!(b.manager.pending_timers(), 1);

    let start = Instant::now();
    let watchdog = b.next_event().await.unwrap();
    assert!(matches!(
        watchdog,
        MeshEvent::Timer {
            kind: TimerKind::Watchdog,
            ..
        }
    ));
    assert!(start.elapsed() >= Duration::from_secs(8));
    b.manager.handle_event(watchdog).await;
    assert_eq!(
        b.manager.recovery_state("a1").unwrap().phase,
        RecoveryPhase::RestartScheduled
    );

    let restart = b.next_event().await.unwrap();
    b.manager.handle_event(restart).await;

    assert_eq!(b.factory.created("a1"), 2);
    assert_eq!(b.manager.connection_state("a1"), Some(PeerConnectionState::New));
    assert_eq!(b.manager.recovery_state("a1").unwrap().attempts, 1);

    // Late events from the replaced connection change nothing
    let old = b.factory.history("a1").remove(0);
    old.emit(PeerEvent::StateChanged(PeerConnectionState::Failed));
    b.drain_events().await;
    assert_eq!(b.manager.connection_state("a1"), Some(PeerConnectionState::New));
    assert_eq!(
        b.manager.recovery_state("a1").unwrap().phase,
        RecoveryPhase::AwaitingStream
    );

    // Media on the new connection clears the recovery cycle
    b.peer("a1").emit(remote_audio("a1"));
    b.drain_events().await;

    let recovery = b.manager.recovery_state("a1").unwrap();
    assert_eq!(recovery.phase, RecoveryPhase::Idle);
    assert_eq!(recovery.attempts, 0);
    assert_eq!(b.manager.pending_timers(), 0);
    assert!(b.manager.remote_stream("a1").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_before_restart_cancels_it() {
    let mut b = answering_node(MockBehavior::Fails, None).await;
    assert_eq!(b.manager.pending_timers(), 1);

    let peer = b.peer("a1");
    peer.emit(remote_audio("a1"));
    peer.emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
    b.drain_events().await;

    assert_eq!(b.manager.pending_timers(), 0);
    assert!(b.next_event().await.is_none());
    assert_eq!(b.factory.created("a1"), 1);
    assert!(b.manager.snapshot().call_active);
}

#[tokio::test(start_paused = true)]
async fn test_initiator_offers_again_after_restart() {
    let (mut a, mut b) = introduced_pair("a1", "b2", MockBehavior::Fails).await;
    exchange(&mut a, &mut b).await;
    a.sink.take();

    let restart = a.next_event().await.unwrap();
    a.manager.handle_event(restart).await;

    assert_eq!(a.factory.created("b2"), 2);
    assert_eq!(a.peer("b2").offers(), 1);
    assert_eq!(a.sent_of(SignalType::Offer).len(), 1);
}

// ============================================================================
// De-duplication
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stale_session_leaves_no_dangling_timers() {
    let mut b = answering_node(MockBehavior::Fails, Some("user-a")).await;
    assert_eq!(b.manager.pending_timers(), 1);
    let stale = b.peer("a1");

    b.receive(joined("a7", Some("user-a"), "Alice")).await;

    assert_eq!(b.manager.roster().peer_ids(), vec!["a7"]);
    assert!(stale.is_closed());
    assert!(!b.manager.has_peer("a1"));
    assert!(b.manager.recovery_state("a1").is_none());
    assert_eq!(b.manager.pending_timers(), 0);

    // Nothing left to fire
    assert!(b.next_event().await.is_none());
    assert_eq!(b.factory.created("a1"), 1);
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_end_call_tears_everything_down() {
    let (mut a, mut b) = introduced_pair("a1", "b2", MockBehavior::Connects).await;
    exchange(&mut a, &mut b).await;

    // A third participant whose connection is waiting on a restart
    a.factory.set_behavior(MockBehavior::Fails);
    a.receive(joined("c3", None, "Carol")).await;
    a.peer("c3").emit(PeerEvent::StateChanged(PeerConnectionState::Failed));
    a.drain_events().await;
    assert_eq!(a.manager.pending_timers(), 1);
    a.sink.take();

    a.manager.end_call().await;

    let leaves = a.sent_of(SignalType::Leave);
    assert_eq!(leaves.len(), 1);
    assert!(leaves[0].target_id.is_none());

    assert_eq!(a.manager.peer_count(), 0);
    assert!(a.manager.roster().is_empty());
    assert_eq!(a.manager.remote_stream_count(), 0);
    assert_eq!(a.manager.pending_timers(), 0);
    assert!(a.manager.self_id().is_none());
    assert!(a.factory.all().iter().all(|peer| peer.is_closed()));

    let snapshot = a.manager.snapshot();
    assert!(!snapshot.call_active);
    assert!(snapshot.participants.is_empty());

    // Idempotent
    a.manager.end_call().await;
    assert_eq!(a.manager.peer_count(), 0);
    assert!(a.next_event().await.is_none());

    // The broadcast leave removes a1 on the other side
    exchange(&mut a, &mut b).await;
    assert!(b.manager.roster().is_empty());
    assert!(!b.manager.has_peer("a1"));
    assert!(b.peer("a1").is_closed());
}

#[tokio::test]
async fn test_server_peer_left_removes_participant() {
    let (mut a, mut b) = introduced_pair("a1", "b2", MockBehavior::Connects).await;
    exchange(&mut a, &mut b).await;

    b.receive(peer_left("a1")).await;

    assert!(b.manager.roster().is_empty());
    assert_eq!(b.manager.peer_count(), 0);
    assert_eq!(b.manager.remote_stream_count(), 0);
    assert!(b.manager.connection_state("a1").is_none());

    // A second notice is harmless
    b.receive(peer_left("a1")).await;
}
