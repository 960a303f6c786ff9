use std::sync::Arc;
use std::time::Duration;

use callrelay::calls::CallManager;
use callrelay::config::{CallConfig, IceServer, NegotiationConfig};
use callrelay::negotiation::loopback::{LoopbackMedia, LoopbackPeer, LoopbackPeerFactory};
use callrelay::negotiation::{
    NegotiationClient, NegotiationError, NegotiationEvent, NegotiationHandle, NegotiationOutcome,
    PeerConnectionState,
};
use callrelay::{CallId, CallStatus, ConversationId, IceCandidate, Role, UserId};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(3);

struct Endpoint {
    user: UserId,
    media: Arc<LoopbackMedia>,
    peers: Arc<LoopbackPeerFactory>,
}

impl Endpoint {
    fn new(name: &str) -> Self {
        Self {
            user: UserId::new(name),
            media: Arc::new(LoopbackMedia::new()),
            peers: Arc::new(LoopbackPeerFactory::default()),
        }
    }

    fn spawn(
        &self,
        manager: &Arc<CallManager>,
        call_id: &CallId,
    ) -> (NegotiationHandle, mpsc::UnboundedReceiver<NegotiationEvent>) {
        self.spawn_with(manager, call_id, NegotiationConfig::default())
    }

    fn spawn_with(
        &self,
        manager: &Arc<CallManager>,
        call_id: &CallId,
        config: NegotiationConfig,
    ) -> (NegotiationHandle, mpsc::UnboundedReceiver<NegotiationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = NegotiationClient::new(
            manager.clone(),
            call_id.clone(),
            self.user.clone(),
            self.media.clone(),
            self.peers.clone(),
            config,
        )
        .with_events(tx)
        .spawn();
        (handle, rx)
    }

    fn peer(&self) -> Arc<LoopbackPeer> {
        self.peers
            .peers()
            .into_iter()
            .next()
            .expect("peer connection created")
    }
}

async fn setup() -> (Arc<CallManager>, CallId, Endpoint, Endpoint) {
    let _ = env_logger::builder().is_test(true).try_init();
    let manager = CallManager::new(CallConfig::default());
    let alice = Endpoint::new("alice");
    let bob = Endpoint::new("bob");
    let call = manager
        .start_call(&alice.user, &bob.user, &ConversationId::new("conv-ab"))
        .await
        .unwrap();
    (manager, call.id, alice, bob)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn connected(endpoint: &Endpoint) -> bool {
    endpoint
        .peers
        .peers()
        .first()
        .is_some_and(|peer| peer.state() == PeerConnectionState::Connected)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<NegotiationEvent>) -> Vec<NegotiationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn join(handle: NegotiationHandle) -> Result<NegotiationOutcome, NegotiationError> {
    tokio::time::timeout(WAIT, handle.join())
        .await
        .expect("negotiation finished")
}

#[tokio::test]
async fn test_accepted_call_connects_and_releases_media_on_hang_up() {
    let (manager, id, alice, bob) = setup().await;
    let (alice_handle, mut alice_events) = alice.spawn(&manager, &id);
    let (bob_handle, mut bob_events) = bob.spawn(&manager, &id);

    manager.answer_call(&id, &bob.user, true).await.unwrap();
    eventually("both peers connected", || connected(&alice) && connected(&bob)).await;

    // Each side applied exactly the candidates the other side gathered.
    eventually("caller applied receiver candidates", || {
        alice.peer().remote_candidates().len() == 2
    })
    .await;
    eventually("receiver applied caller candidates", || {
        bob.peer().remote_candidates().len() == 2
    })
    .await;
    let snapshot = manager.relay().get_signaling(&id, &alice.user).await.unwrap();
    assert_eq!(alice.peer().remote_candidates(), snapshot.receiver_candidates);
    assert_eq!(bob.peer().remote_candidates(), snapshot.caller_candidates);
    assert_eq!(bob.peer().remote_description(), snapshot.offer);
    assert_eq!(alice.peer().remote_description(), snapshot.answer);

    let duration = alice_handle.hang_up().await.unwrap();
    assert!(matches!(
        join(alice_handle).await.unwrap(),
        NegotiationOutcome::Ended { duration_secs } if duration_secs == duration
    ));
    assert!(matches!(
        join(bob_handle).await.unwrap(),
        NegotiationOutcome::Ended { .. }
    ));

    for endpoint in [&alice, &bob] {
        assert_eq!(endpoint.media.acquired(), 1);
        assert_eq!(endpoint.media.live_streams(), 0);
        assert!(endpoint.peer().is_closed());
    }

    let alice_seen = drain(&mut alice_events);
    assert!(alice_seen.contains(&NegotiationEvent::OfferPublished));
    assert!(alice_seen.contains(&NegotiationEvent::RemoteDescriptionApplied));
    // The demo binary waits on this event.
    let connected_event = NegotiationEvent::ConnectionState(PeerConnectionState::Connected);
    assert!(alice_seen.contains(&connected_event));
    let bob_seen = drain(&mut bob_events);
    assert!(bob_seen.contains(&NegotiationEvent::AnswerPublished));
    assert!(bob_seen.contains(&connected_event));
    assert!(
        bob_seen
            .iter()
            .any(|e| matches!(e, NegotiationEvent::RemoteCandidatesApplied(n) if *n > 0))
    );
}

#[tokio::test]
async fn test_configured_ice_servers_reach_the_peer_connection() {
    let (manager, id, alice, bob) = setup().await;
    let turn = IceServer {
        urls: vec!["turn:turn.example.org:3478?transport=udp".to_string()],
        username: Some("alice".to_string()),
        credential: Some("s3cret".to_string()),
    };
    let config = NegotiationConfig {
        ice_servers: vec![IceServer::stun("stun:stun.example.org:3478"), turn],
        ..Default::default()
    };
    let (alice_handle, _alice_events) = alice.spawn_with(&manager, &id, config.clone());
    let (bob_handle, _bob_events) = bob.spawn(&manager, &id);

    manager.answer_call(&id, &bob.user, true).await.unwrap();
    eventually("both peers connected", || connected(&alice) && connected(&bob)).await;

    assert_eq!(alice.peer().ice_servers(), config.ice_servers.as_slice());
    assert_eq!(
        bob.peer().ice_servers(),
        NegotiationConfig::default().ice_servers.as_slice()
    );

    alice_handle.hang_up().await.unwrap();
    join(alice_handle).await.unwrap();
    join(bob_handle).await.unwrap();
}

#[tokio::test]
async fn test_receiver_waits_for_accept_before_touching_media() {
    let (manager, id, alice, bob) = setup().await;
    let (alice_handle, _alice_events) = alice.spawn(&manager, &id);
    let (bob_handle, _bob_events) = bob.spawn(&manager, &id);

    manager.mark_ringing(&id, &bob.user).await.unwrap();
    eventually("offer published", || {
        alice.peers.peers().len() == 1 && alice.peer().local_description().is_some()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.media.acquired(), 0);
    assert!(bob.peers.peers().is_empty());

    manager.answer_call(&id, &bob.user, true).await.unwrap();
    eventually("receiver media acquired", || bob.media.acquired() == 1).await;

    alice_handle.hang_up().await.unwrap();
    join(alice_handle).await.unwrap();
    join(bob_handle).await.unwrap();
}

#[tokio::test]
async fn test_rejected_call_stops_both_clients() {
    let (manager, id, alice, bob) = setup().await;
    let (alice_handle, _alice_events) = alice.spawn(&manager, &id);
    let (bob_handle, _bob_events) = bob.spawn(&manager, &id);

    manager.answer_call(&id, &bob.user, false).await.unwrap();

    assert_eq!(
        join(alice_handle).await.unwrap(),
        NegotiationOutcome::Rejected
    );
    assert_eq!(join(bob_handle).await.unwrap(), NegotiationOutcome::Rejected);
    assert_eq!(alice.media.live_streams(), 0);
    assert_eq!(bob.media.acquired(), 0);
}

#[tokio::test]
async fn test_caller_media_denied_leaves_session_calling() {
    let (manager, id, alice, _bob) = setup().await;
    alice.media.deny_permission(true);
    let (alice_handle, mut alice_events) = alice.spawn(&manager, &id);

    let err = join(alice_handle).await.unwrap_err();
    assert!(matches!(err, NegotiationError::MediaDenied(_)));
    assert!(
        drain(&mut alice_events)
            .iter()
            .any(|e| matches!(e, NegotiationEvent::Error(_)))
    );

    let session = manager.get_call(&id).await.unwrap();
    assert_eq!(session.status, CallStatus::Calling);
    assert!(session.offer.is_none());
    assert_eq!(alice.media.live_streams(), 0);
    assert!(alice.peers.peers().is_empty());
}

#[tokio::test]
async fn test_receiver_media_denied_keeps_call_accepted() {
    let (manager, id, alice, bob) = setup().await;
    bob.media.deny_permission(true);
    let (alice_handle, _alice_events) = alice.spawn(&manager, &id);
    let (bob_handle, _bob_events) = bob.spawn(&manager, &id);

    manager.answer_call(&id, &bob.user, true).await.unwrap();
    let err = join(bob_handle).await.unwrap_err();
    assert!(matches!(err, NegotiationError::MediaDenied(_)));

    let session = manager.get_call(&id).await.unwrap();
    assert_eq!(session.status, CallStatus::Accepted);
    assert!(session.answer.is_none());
    assert!(!alice_handle.is_finished());

    alice_handle.hang_up().await.unwrap();
    join(alice_handle).await.unwrap();
    assert_eq!(alice.media.live_streams(), 0);
}

#[tokio::test]
async fn test_detach_releases_resources_without_ending_call() {
    let (manager, id, alice, bob) = setup().await;
    let (mut alice_handle, _alice_events) = alice.spawn(&manager, &id);
    let (bob_handle, _bob_events) = bob.spawn(&manager, &id);

    manager.answer_call(&id, &bob.user, true).await.unwrap();
    eventually("both peers connected", || connected(&alice) && connected(&bob)).await;

    alice_handle.detach();
    assert_eq!(
        join(alice_handle).await.unwrap(),
        NegotiationOutcome::Detached
    );
    assert_eq!(alice.media.live_streams(), 0);
    assert!(alice.peer().is_closed());

    assert_eq!(
        manager.get_call(&id).await.unwrap().status,
        CallStatus::Accepted
    );
    assert!(!bob_handle.is_finished());

    bob_handle.hang_up().await.unwrap();
    join(bob_handle).await.unwrap();
    assert_eq!(bob.media.live_streams(), 0);
}

#[tokio::test]
async fn test_dropped_handle_releases_resources() {
    let (manager, id, alice, _bob) = setup().await;
    let (alice_handle, _alice_events) = alice.spawn(&manager, &id);
    eventually("caller media acquired", || alice.media.live_streams() == 1).await;

    drop(alice_handle);
    eventually("caller media released", || alice.media.live_streams() == 0).await;
    assert_eq!(
        manager.get_call(&id).await.unwrap().status,
        CallStatus::Calling
    );
}

#[tokio::test]
async fn test_connection_trouble_does_not_end_call() {
    let (manager, id, alice, bob) = setup().await;
    let (alice_handle, mut alice_events) = alice.spawn(&manager, &id);
    let (bob_handle, _bob_events) = bob.spawn(&manager, &id);

    manager.answer_call(&id, &bob.user, true).await.unwrap();
    eventually("both peers connected", || connected(&alice) && connected(&bob)).await;

    alice.peer().simulate_state(PeerConnectionState::Failed);
    let mut seen = Vec::new();
    eventually("trouble reported", || {
        seen.extend(drain(&mut alice_events));
        seen.contains(&NegotiationEvent::ConnectionTrouble(
            PeerConnectionState::Failed,
        ))
    })
    .await;

    assert_eq!(
        manager.get_call(&id).await.unwrap().status,
        CallStatus::Accepted
    );
    assert!(!alice_handle.is_finished());

    bob_handle.hang_up().await.unwrap();
    join(alice_handle).await.unwrap();
    join(bob_handle).await.unwrap();
}

#[tokio::test]
async fn test_late_receiver_catches_up_without_reapplying_candidates() {
    let (manager, id, alice, bob) = setup().await;
    let relay = manager.relay();
    let (alice_handle, _alice_events) = alice.spawn(&manager, &id);

    eventually("caller candidates published", || {
        alice.peers.peers().len() == 1
    })
    .await;
    let mut feed = relay.subscribe(&id, &bob.user).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while feed.current().signaling.caller_candidates.len() < 2 {
            if feed.changed().await.is_none() {
                break;
            }
        }
    })
    .await
    .unwrap();

    // Accepted before the receiver's client even starts.
    manager.answer_call(&id, &bob.user, true).await.unwrap();
    let (bob_handle, _bob_events) = bob.spawn(&manager, &id);
    eventually("receiver applied caller history", || {
        connected(&bob) && bob.peer().remote_candidates().len() == 2
    })
    .await;

    // A re-sent candidate is relayed again but applied only once.
    let history = relay.get_signaling(&id, &bob.user).await.unwrap();
    let resent = history.caller_candidates[0].clone();
    relay
        .add_ice_candidate(&id, &alice.user, resent, Role::Caller)
        .await
        .unwrap();
    let extra = IceCandidate::new("candidate:99 1 udp 2122260223 10.0.0.9 59999 typ host");
    relay
        .add_ice_candidate(&id, &alice.user, extra.clone(), Role::Caller)
        .await
        .unwrap();

    eventually("new candidate applied", || {
        bob.peer().remote_candidates().contains(&extra)
    })
    .await;
    assert_eq!(bob.peer().remote_candidates().len(), 3);

    alice_handle.hang_up().await.unwrap();
    join(alice_handle).await.unwrap();
    join(bob_handle).await.unwrap();
}

#[tokio::test]
async fn test_expired_call_reports_expiry() {
    let (manager, id, alice, _bob) = setup().await;
    let (alice_handle, _alice_events) = alice.spawn(&manager, &id);
    eventually("caller media acquired", || alice.media.acquired() == 1).await;

    let expired = manager.expire_unanswered(chrono::Duration::zero()).await;
    assert_eq!(expired, vec![id.clone()]);

    assert_eq!(join(alice_handle).await.unwrap(), NegotiationOutcome::Expired);
    assert_eq!(alice.media.live_streams(), 0);
}
