//! Per-endpoint negotiation driver.
//!
//! One [`NegotiationClient`] runs on each participant's device. It owns the
//! local media and peer connection for the duration of the call and reacts
//! to three inputs: relay updates, peer-connection events and local teardown.
//!
//! Session state is only ever changed by explicit user actions (answering or
//! hanging up). Media failures and transport trouble are reported through
//! [`NegotiationEvent`]s and never end the call by themselves.

use callcore::{
    CallError, CallId, CallStatus, CandidateTracker, EndReason, ErrorKind, Role,
    SessionDescription, UserId,
};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::error::NegotiationError;
use super::media::{
    MediaConstraints, MediaDevices, MediaStream, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent,
};
use crate::calls::{CallManager, SessionFeed, SignalingFeed, SignalingRelay};
use crate::config::NegotiationConfig;

/// Progress and trouble reports for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    LocalMediaReady { tracks: usize },
    OfferPublished,
    AnswerPublished,
    RemoteDescriptionApplied,
    /// A local candidate reached the relay; carries the sender list length.
    LocalCandidatePublished(usize),
    RemoteCandidatesApplied(usize),
    ConnectionState(PeerConnectionState),
    /// Transport trouble. Recoverable; the session is left as it is.
    ConnectionTrouble(PeerConnectionState),
    /// Something failed locally. The session is left as it is.
    Error(String),
}

/// How a negotiation run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Ended { duration_secs: u64 },
    Rejected,
    /// Ended by the unanswered-call reaper.
    Expired,
    /// Local teardown (the handle was dropped or detached) or the session
    /// was pruned. The session itself was not touched.
    Detached,
}

/// Local media and peer connection, released on every exit path.
#[derive(Default)]
struct LocalResources {
    stream: Option<Arc<dyn MediaStream>>,
    peer: Option<Arc<dyn PeerConnection>>,
}

impl LocalResources {
    fn release(self) {
        if let Some(peer) = self.peer {
            peer.close();
        }
        if let Some(stream) = self.stream {
            stream.stop();
        }
    }
}

enum Step {
    Feed(Option<SessionFeed>),
    Peer(Option<PeerEvent>),
    Teardown,
}

pub struct NegotiationClient {
    call_id: CallId,
    user: UserId,
    manager: Arc<CallManager>,
    relay: SignalingRelay,
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    config: NegotiationConfig,
    events: Option<mpsc::UnboundedSender<NegotiationEvent>>,
}

impl NegotiationClient {
    pub fn new(
        manager: Arc<CallManager>,
        call_id: CallId,
        user: UserId,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        config: NegotiationConfig,
    ) -> Self {
        let relay = manager.relay();
        Self {
            call_id,
            user,
            manager,
            relay,
            media,
            peers,
            config,
            events: None,
        }
    }

    /// Report progress to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<NegotiationEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn spawn(self) -> NegotiationHandle {
        let (teardown_tx, teardown_rx) = oneshot::channel();
        let call_id = self.call_id.clone();
        let user = self.user.clone();
        let manager = self.manager.clone();
        let task = tokio::spawn(self.run(teardown_rx));
        NegotiationHandle {
            call_id,
            user,
            manager,
            teardown: Some(teardown_tx),
            task,
        }
    }

    /// Drive the negotiation until the call reaches a terminal status or
    /// `teardown` fires (or its sender is dropped).
    pub async fn run(
        self,
        teardown: oneshot::Receiver<()>,
    ) -> Result<NegotiationOutcome, NegotiationError> {
        let result = self.drive(teardown).await;
        match &result {
            Ok(outcome) => info!(
                target: "Negotiation",
                "{} left call {}: {:?}", self.user, self.call_id, outcome
            ),
            Err(e) => {
                warn!(
                    target: "Negotiation",
                    "{} negotiation for call {} failed: {e}", self.user, self.call_id
                );
                self.emit(NegotiationEvent::Error(e.to_string()));
            }
        }
        result
    }

    async fn drive(
        &self,
        mut teardown: oneshot::Receiver<()>,
    ) -> Result<NegotiationOutcome, NegotiationError> {
        let mut feed = self.relay.subscribe(&self.call_id, &self.user).await?;
        let role = feed.role();
        let mut resources = scopeguard::guard(LocalResources::default(), LocalResources::release);
        let mut peer_events: Option<mpsc::Receiver<PeerEvent>> = None;
        let mut tracker = CandidateTracker::new();

        info!(
            target: "Negotiation",
            "{} joining call {} as {role}", self.user, self.call_id
        );

        let mut state = feed.current();
        if let Some(outcome) = outcome_of(&state) {
            return Ok(outcome);
        }
        if role == Role::Caller {
            match self.start_as_caller(&mut resources).await {
                Ok(events) => peer_events = Some(events),
                Err(e) => return settle(&mut feed, e),
            }
        }

        let mut feed_dirty = true;
        loop {
            if let Some(outcome) = outcome_of(&state) {
                return Ok(outcome);
            }
            if feed_dirty {
                match self
                    .apply_feed(role, &state, &mut resources, &mut tracker)
                    .await
                {
                    Ok(Some(events)) => peer_events = Some(events),
                    Ok(None) => {}
                    Err(e) => return settle(&mut feed, e),
                }
                feed_dirty = false;
            }

            let step = tokio::select! {
                changed = feed.changed() => Step::Feed(changed),
                event = next_peer_event(&mut peer_events) => Step::Peer(event),
                _ = &mut teardown => Step::Teardown,
            };

            match step {
                Step::Feed(Some(next)) => {
                    state = next;
                    feed_dirty = true;
                }
                Step::Feed(None) => {
                    debug!(target: "Negotiation", "Call {} left the relay", self.call_id);
                    return Ok(NegotiationOutcome::Detached);
                }
                Step::Peer(Some(event)) => self.handle_peer_event(role, event).await,
                Step::Peer(None) => peer_events = None,
                Step::Teardown => return Ok(NegotiationOutcome::Detached),
            }
        }
    }

    /// Acquire media and build the peer connection, recording both in
    /// `resources` as soon as they exist.
    async fn open_local(
        &self,
        resources: &mut LocalResources,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), NegotiationError> {
        let constraints = MediaConstraints {
            audio: self.config.audio,
            video: self.config.video,
        };
        let stream = self.media.acquire(constraints).await?;
        resources.stream = Some(stream.clone());
        self.emit(NegotiationEvent::LocalMediaReady {
            tracks: stream.track_count(),
        });

        let (peer, events) = self.peers.create(&self.config.ice_servers).await?;
        resources.peer = Some(peer.clone());
        peer.add_stream(stream).await?;
        Ok((peer, events))
    }

    async fn start_as_caller(
        &self,
        resources: &mut LocalResources,
    ) -> Result<mpsc::Receiver<PeerEvent>, NegotiationError> {
        let (peer, events) = self.open_local(resources).await?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.relay.set_offer(&self.call_id, &self.user, offer).await?;
        self.emit(NegotiationEvent::OfferPublished);
        Ok(events)
    }

    async fn start_as_receiver(
        &self,
        offer: SessionDescription,
        resources: &mut LocalResources,
    ) -> Result<mpsc::Receiver<PeerEvent>, NegotiationError> {
        let (peer, events) = self.open_local(resources).await?;
        peer.set_remote_description(offer).await?;
        self.emit(NegotiationEvent::RemoteDescriptionApplied);
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.relay
            .set_answer(&self.call_id, &self.user, answer)
            .await?;
        self.emit(NegotiationEvent::AnswerPublished);
        Ok(events)
    }

    /// React to a relay snapshot. Returns the peer event channel when this
    /// snapshot caused the peer connection to be created.
    async fn apply_feed(
        &self,
        role: Role,
        state: &SessionFeed,
        resources: &mut LocalResources,
        tracker: &mut CandidateTracker,
    ) -> Result<Option<mpsc::Receiver<PeerEvent>>, NegotiationError> {
        let signaling = &state.signaling;
        let mut new_events = None;

        match role {
            // The receiver only touches the camera once it has accepted.
            Role::Receiver => {
                if resources.peer.is_none()
                    && state.status == CallStatus::Accepted
                    && let Some(offer) = signaling.offer.clone()
                {
                    new_events = Some(self.start_as_receiver(offer, resources).await?);
                }
            }
            Role::Caller => {
                if let (Some(peer), Some(answer)) = (&resources.peer, &signaling.answer)
                    && !peer.has_remote_description()
                {
                    peer.set_remote_description(answer.clone()).await?;
                    self.emit(NegotiationEvent::RemoteDescriptionApplied);
                }
            }
        }

        // Candidates are only usable after the remote description; until
        // then they stay unseen and are picked up from history later.
        let Some(peer) = &resources.peer else {
            return Ok(new_events);
        };
        if !peer.has_remote_description() {
            return Ok(new_events);
        }

        let mut applied = 0;
        for candidate in tracker.fresh(signaling.candidates_from(role.peer())) {
            if let Err(e) = peer.add_ice_candidate(candidate.clone()).await {
                warn!(
                    target: "Negotiation",
                    "Call {}: dropping remote candidate: {e}", self.call_id
                );
            } else {
                applied += 1;
            }
            // A candidate the peer connection refused would be refused again.
            tracker.mark_applied(candidate);
        }
        if applied > 0 {
            debug!(
                target: "Negotiation",
                "Call {}: applied {applied} remote candidate(s)", self.call_id
            );
            self.emit(NegotiationEvent::RemoteCandidatesApplied(applied));
        }
        Ok(new_events)
    }

    async fn handle_peer_event(&self, role: Role, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                match self
                    .relay
                    .add_ice_candidate(&self.call_id, &self.user, candidate, role)
                    .await
                {
                    Ok(len) => self.emit(NegotiationEvent::LocalCandidatePublished(len)),
                    Err(e) => self.report_relay_error(e),
                }
            }
            PeerEvent::StateChanged(state) => {
                self.emit(NegotiationEvent::ConnectionState(state));
                if state.is_trouble() {
                    warn!(
                        target: "Negotiation",
                        "Call {}: peer connection {:?}", self.call_id, state
                    );
                    self.emit(NegotiationEvent::ConnectionTrouble(state));
                }
            }
        }
    }

    fn report_relay_error(&self, err: CallError) {
        if err.kind() == ErrorKind::Conflict {
            // Session already over or candidate cap reached.
            debug!(target: "Negotiation", "Call {}: candidate not relayed: {err}", self.call_id);
        } else {
            warn!(target: "Negotiation", "Call {}: candidate not relayed: {err}", self.call_id);
        }
        self.emit(NegotiationEvent::Error(err.to_string()));
    }

    fn emit(&self, event: NegotiationEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn outcome_of(state: &SessionFeed) -> Option<NegotiationOutcome> {
    match state.status {
        CallStatus::Ended if state.end_reason == Some(EndReason::Unanswered) => {
            Some(NegotiationOutcome::Expired)
        }
        CallStatus::Ended => Some(NegotiationOutcome::Ended {
            duration_secs: state.duration_secs.unwrap_or(0),
        }),
        CallStatus::Rejected => Some(NegotiationOutcome::Rejected),
        CallStatus::Calling | CallStatus::Ringing | CallStatus::Accepted => None,
    }
}

/// A signaling write can fail because the call finished underneath it;
/// report that as the call's outcome rather than as a failure.
fn settle(
    feed: &mut SignalingFeed,
    err: NegotiationError,
) -> Result<NegotiationOutcome, NegotiationError> {
    if let NegotiationError::Signaling(e) = &err
        && e.is_conflict()
        && let Some(outcome) = outcome_of(&feed.current())
    {
        return Ok(outcome);
    }
    Err(err)
}

async fn next_peer_event(events: &mut Option<mpsc::Receiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle to a spawned [`NegotiationClient`].
///
/// Dropping the handle tears the local side down (media released, peer
/// connection closed) without changing the session; use
/// [`hang_up`](Self::hang_up) to end the call for both sides.
pub struct NegotiationHandle {
    call_id: CallId,
    user: UserId,
    manager: Arc<CallManager>,
    teardown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<NegotiationOutcome, NegotiationError>>,
}

impl NegotiationHandle {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// End the call. The client observes the ended session and cleans up.
    pub async fn hang_up(&self) -> Result<u64, CallError> {
        self.manager.end_call(&self.call_id, &self.user).await
    }

    /// Stop the local side without touching the session.
    pub fn detach(&mut self) {
        if let Some(tx) = self.teardown.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the client to finish.
    pub async fn join(self) -> Result<NegotiationOutcome, NegotiationError> {
        let Self { teardown, task, .. } = self;
        let result = task.await;
        drop(teardown);
        result.map_err(|e| NegotiationError::Task(e.to_string()))?
    }
}
