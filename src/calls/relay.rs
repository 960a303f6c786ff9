//! Signaling relay: the shared offer/answer/candidate store both endpoints
//! read and write instead of talking to each other directly.
//!
//! The relay is not a queue. Offer and answer are single-assignment, the two
//! candidate lists only grow, and readers always get the whole current state.
//! A client that joins late or re-reads a snapshot catches up from history
//! and relies on its own [`CandidateTracker`](callcore::CandidateTracker) to
//! skip what it already applied.

use callcore::{
    CallError, CallId, CallStatus, IceCandidate, Role, SessionDescription, SignalingSnapshot,
    UserId,
};
use log::{debug, trace};
use std::sync::Arc;
use tokio::sync::watch;

use super::registry::{CallRegistry, SessionFeed};

/// Cheap, cloneable handle to the relay side of a [`CallManager`](super::CallManager).
#[derive(Clone)]
pub struct SignalingRelay {
    registry: Arc<CallRegistry>,
}

impl SignalingRelay {
    pub(crate) fn new(registry: Arc<CallRegistry>) -> Self {
        Self { registry }
    }

    /// Publish the caller's SDP offer.
    pub async fn set_offer(
        &self,
        call_id: &CallId,
        actor: &UserId,
        sdp: SessionDescription,
    ) -> Result<(), CallError> {
        self.set_description(call_id, actor, sdp, Role::Caller).await
    }

    /// Publish the receiver's SDP answer.
    pub async fn set_answer(
        &self,
        call_id: &CallId,
        actor: &UserId,
        sdp: SessionDescription,
    ) -> Result<(), CallError> {
        self.set_description(call_id, actor, sdp, Role::Receiver).await
    }

    async fn set_description(
        &self,
        call_id: &CallId,
        actor: &UserId,
        sdp: SessionDescription,
        writer: Role,
    ) -> Result<(), CallError> {
        let what = match writer {
            Role::Caller => "offer",
            Role::Receiver => "answer",
        };
        if sdp.is_empty() {
            return Err(CallError::BadRequest(format!("empty {what}")));
        }

        let mut state = self.registry.write().await;
        let entry = state.get_mut(call_id)?;
        if entry.require_participant(actor)? != writer {
            return Err(CallError::Forbidden(format!(
                "only the {writer} writes the {what} of call {call_id}"
            )));
        }
        match writer {
            Role::Caller => entry.session.set_offer(sdp)?,
            Role::Receiver => entry.session.set_answer(sdp)?,
        }
        entry.publish();
        drop(state);

        debug!("Call {call_id}: {what} published by {actor}");
        Ok(())
    }

    /// Append a candidate to `sender`'s list. Returns that list's new length.
    ///
    /// The relay keeps duplicates; pushing the same candidate twice after a
    /// retry is harmless because readers deduplicate by content.
    pub async fn add_ice_candidate(
        &self,
        call_id: &CallId,
        actor: &UserId,
        candidate: IceCandidate,
        sender: Role,
    ) -> Result<usize, CallError> {
        if candidate.is_empty() {
            return Err(CallError::BadRequest("empty ice candidate".into()));
        }

        let max = self.registry.config.max_ice_candidates;
        let mut state = self.registry.write().await;
        let entry = state.get_mut(call_id)?;
        if entry.require_participant(actor)? != sender {
            return Err(CallError::Forbidden(format!(
                "{actor} cannot publish candidates as {sender} on call {call_id}"
            )));
        }
        let len = entry.session.push_candidate(sender, candidate, max)?;
        entry.publish();
        drop(state);

        trace!(target: "Calls/Relay", "Call {call_id}: {sender} candidate #{len}");
        Ok(len)
    }

    /// Current signaling state of a call. Participants only.
    pub async fn get_signaling(
        &self,
        call_id: &CallId,
        actor: &UserId,
    ) -> Result<SignalingSnapshot, CallError> {
        let state = self.registry.read().await;
        let entry = state.get(call_id)?;
        entry.require_participant(actor)?;
        Ok(entry.session.signaling())
    }

    /// Watch a call. The returned feed starts at the current state and
    /// yields again after every write to the session.
    pub async fn subscribe(
        &self,
        call_id: &CallId,
        actor: &UserId,
    ) -> Result<SignalingFeed, CallError> {
        let state = self.registry.read().await;
        let entry = state.get(call_id)?;
        let role = entry.require_participant(actor)?;
        Ok(SignalingFeed {
            role,
            rx: entry.subscribe(),
        })
    }
}

/// A participant's subscription to one call.
#[derive(Debug)]
pub struct SignalingFeed {
    role: Role,
    rx: watch::Receiver<SessionFeed>,
}

impl SignalingFeed {
    /// The subscriber's role in the call.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Latest state, marking it as seen.
    pub fn current(&mut self) -> SessionFeed {
        self.rx.borrow_and_update().clone()
    }

    /// Wait until the session changes. Returns `None` once the session is
    /// gone from the relay.
    pub async fn changed(&mut self) -> Option<SessionFeed> {
        self.rx.changed().await.ok()?;
        Some(self.current())
    }

    /// Wait until the status satisfies `pred`, returning that state.
    pub async fn wait_for_status(
        &mut self,
        mut pred: impl FnMut(CallStatus) -> bool,
    ) -> Option<SessionFeed> {
        let feed = self.rx.wait_for(|feed| pred(feed.status)).await.ok()?;
        Some(feed.clone())
    }
}
