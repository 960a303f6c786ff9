//! Call manager for orchestrating call lifecycle.

use callcore::{
    CallError, CallId, CallSession, CallStatus, CallTransition, Clock, ConversationId, EndReason,
    SystemClock, UserId,
};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::events::{CallAnswered, CallEnded, CallRinging, EventBus, IncomingCall};
use super::registry::{CallRegistry, SessionEntry};
use super::relay::SignalingRelay;
use crate::config::CallConfig;

/// Owns call session records and enforces the status state machine.
///
/// All methods take an already-authenticated acting user; identity and
/// conversation membership are checked one layer up in
/// [`CallService`](crate::calls::CallService).
pub struct CallManager {
    registry: Arc<CallRegistry>,
}

impl CallManager {
    /// Create a new call manager backed by the system clock.
    pub fn new(config: CallConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CallConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(CallRegistry::new(config, clock)),
        })
    }

    /// Relay handle sharing this manager's session table.
    pub fn relay(&self) -> SignalingRelay {
        SignalingRelay::new(self.registry.clone())
    }

    pub fn config(&self) -> &CallConfig {
        &self.registry.config
    }

    pub fn events(&self) -> &EventBus {
        &self.registry.events
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.registry.clock.now()
    }

    /// Start an outgoing call in `calling`.
    ///
    /// Fails with a conflict if the conversation already has a non-terminal
    /// call; the check and the insert happen under one write lock.
    pub async fn start_call(
        &self,
        caller: &UserId,
        receiver: &UserId,
        conversation: &ConversationId,
    ) -> Result<CallSession, CallError> {
        if caller.is_empty() || receiver.is_empty() || conversation.is_empty() {
            return Err(CallError::BadRequest(
                "caller, receiver and conversation are required".into(),
            ));
        }
        if caller == receiver {
            return Err(CallError::BadRequest("cannot call yourself".into()));
        }

        let mut state = self.registry.write().await;
        if let Some(existing) = state.active_call_id(conversation) {
            return Err(CallError::Conflict(format!(
                "conversation {conversation} already has active call {existing}"
            )));
        }

        let session = CallSession::new(
            CallId::generate(),
            caller.clone(),
            receiver.clone(),
            conversation.clone(),
            self.now(),
        );
        let entry = state.insert_active(session);
        let session = entry.session.clone();
        drop(state);

        info!(
            "Call {} started: {} -> {} in {}",
            session.id, session.caller_id, session.receiver_id, session.conversation_id
        );
        let _ = self.registry.events.incoming.send(Arc::new(IncomingCall {
            call_id: session.id.clone(),
            caller_id: session.caller_id.clone(),
            receiver_id: session.receiver_id.clone(),
            conversation_id: session.conversation_id.clone(),
            created_at: session.created_at,
        }));
        Ok(session)
    }

    /// Record that the receiver's device surfaced the call (`calling` → `ringing`).
    /// Repeating it while already ringing is a no-op.
    pub async fn mark_ringing(&self, call_id: &CallId, actor: &UserId) -> Result<(), CallError> {
        let mut state = self.registry.write().await;
        let entry = state.get_mut(call_id)?;
        require_receiver(entry, actor)?;

        if entry.session.status == CallStatus::Ringing {
            return Ok(());
        }
        entry
            .session
            .apply_transition(CallTransition::Ring, self.now())?;
        entry.publish();
        drop(state);

        debug!("Call {call_id} ringing on {actor}");
        let _ = self.registry.events.ringing.send(Arc::new(CallRinging {
            call_id: call_id.clone(),
            receiver_id: actor.clone(),
        }));
        Ok(())
    }

    /// Accept or decline a call. Only the receiver may answer, and only once:
    /// a second answer, whatever its `accept` value, is a conflict.
    pub async fn answer_call(
        &self,
        call_id: &CallId,
        actor: &UserId,
        accept: bool,
    ) -> Result<CallSession, CallError> {
        let mut state = self.registry.write().await;
        let entry = state.get_mut(call_id)?;
        require_receiver(entry, actor)?;

        let transition = if accept {
            CallTransition::Accept
        } else {
            CallTransition::Reject
        };
        entry.session.apply_transition(transition, self.now())?;
        entry.publish();
        let session = entry.session.clone();
        if !accept {
            state.release_conversation(&session.conversation_id, call_id);
        }
        drop(state);

        info!(
            "Call {} {} by {}",
            call_id,
            if accept { "accepted" } else { "rejected" },
            actor
        );
        let _ = self.registry.events.answered.send(Arc::new(CallAnswered {
            call_id: call_id.clone(),
            receiver_id: actor.clone(),
            accepted: accept,
        }));
        Ok(session)
    }

    /// Hang up. Either participant may end the call; ending an already ended
    /// call returns the recorded duration again.
    pub async fn end_call(&self, call_id: &CallId, actor: &UserId) -> Result<u64, CallError> {
        let mut state = self.registry.write().await;
        let entry = state.get_mut(call_id)?;
        entry.require_participant(actor)?;

        if entry.session.status == CallStatus::Ended {
            return Ok(entry.session.duration_secs.unwrap_or(0));
        }
        let duration = entry
            .session
            .end(self.now(), EndReason::Hangup, Some(actor.clone()))?;
        let ended = ended_event(entry);
        state.release_conversation(&ended.conversation_id, call_id);
        drop(state);

        info!("Call {call_id} ended by {actor} after {duration}s");
        let _ = self.registry.events.ended.send(Arc::new(ended.event));
        Ok(duration)
    }

    /// The conversation's non-terminal call, if any.
    pub async fn get_active_call(&self, conversation: &ConversationId) -> Option<CallSession> {
        let state = self.registry.read().await;
        let call_id = state.active_call_id(conversation)?;
        state.get(call_id).ok().map(|entry| entry.session.clone())
    }

    /// Calls waiting on `user`, most recent first, capped by
    /// [`CallConfig::incoming_calls_limit`].
    pub async fn get_incoming_calls(&self, user: &UserId) -> Vec<CallSession> {
        let state = self.registry.read().await;
        let mut pending: Vec<&SessionEntry> = state
            .entries()
            .filter(|e| e.session.receiver_id == *user && e.session.status.is_pending())
            .collect();
        pending.sort_by(|a, b| {
            b.session
                .created_at
                .cmp(&a.session.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        pending
            .into_iter()
            .take(self.registry.config.incoming_calls_limit)
            .map(|e| e.session.clone())
            .collect()
    }

    /// Every call still waiting on its receiver, oldest first.
    pub async fn pending_calls(&self) -> Vec<CallSession> {
        let state = self.registry.read().await;
        let mut pending: Vec<&SessionEntry> = state
            .entries()
            .filter(|e| e.session.status.is_pending())
            .collect();
        pending.sort_by_key(|e| e.seq);
        pending.into_iter().map(|e| e.session.clone()).collect()
    }

    pub async fn get_call(&self, call_id: &CallId) -> Result<CallSession, CallError> {
        let state = self.registry.read().await;
        Ok(state.get(call_id)?.session.clone())
    }

    /// End every call still waiting on its receiver after `max_age`.
    /// Returns the ids of the calls that were expired.
    pub async fn expire_unanswered(&self, max_age: chrono::Duration) -> Vec<CallId> {
        let now = self.now();
        let cutoff = now - max_age;
        let mut state = self.registry.write().await;

        let stale: Vec<CallId> = state
            .entries()
            .filter(|e| e.session.status.is_pending() && e.session.created_at <= cutoff)
            .map(|e| e.session.id.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for call_id in stale {
            let Ok(entry) = state.get_mut(&call_id) else {
                continue;
            };
            if entry.session.end(now, EndReason::Unanswered, None).is_err() {
                continue;
            }
            let ended = ended_event(entry);
            state.release_conversation(&ended.conversation_id, &call_id);
            let _ = self.registry.events.ended.send(Arc::new(ended.event));
            expired.push(call_id);
        }
        drop(state);

        if !expired.is_empty() {
            info!("Expired {} unanswered call(s)", expired.len());
        }
        expired
    }

    /// Drop terminal sessions that ended before `older_than`. Subscribers of
    /// a pruned session see their feed close.
    pub async fn prune_finished(&self, older_than: DateTime<Utc>) -> usize {
        let mut state = self.registry.write().await;
        let removed = state.retain(|entry| {
            !(entry.session.is_terminal()
                && entry.session.ended_at.is_some_and(|ended| ended < older_than))
        });
        if removed > 0 {
            debug!("Pruned {removed} finished call(s)");
        }
        removed
    }

    pub fn subscribe_incoming(&self) -> broadcast::Receiver<Arc<IncomingCall>> {
        self.registry.events.incoming.subscribe()
    }

    pub fn subscribe_ended(&self) -> broadcast::Receiver<Arc<CallEnded>> {
        self.registry.events.ended.subscribe()
    }
}

fn require_receiver(entry: &SessionEntry, actor: &UserId) -> Result<(), CallError> {
    if entry.session.receiver_id != *actor {
        return Err(CallError::Forbidden(format!(
            "only the receiver can answer call {}",
            entry.session.id
        )));
    }
    Ok(())
}

struct Ended {
    conversation_id: ConversationId,
    event: CallEnded,
}

/// Publish the ended record to subscribers and build the lifecycle event.
fn ended_event(entry: &SessionEntry) -> Ended {
    entry.publish();
    let session = &entry.session;
    Ended {
        conversation_id: session.conversation_id.clone(),
        event: CallEnded {
            call_id: session.id.clone(),
            caller_id: session.caller_id.clone(),
            receiver_id: session.receiver_id.clone(),
            duration_secs: session.duration_secs.unwrap_or(0),
            reason: session.end_reason.unwrap_or(EndReason::Hangup),
            ended_by: session.ended_by.clone(),
        },
    }
}
