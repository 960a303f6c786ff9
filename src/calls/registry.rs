//! Shared session table behind the manager and the relay.
//!
//! Every status check-then-transition and every relay write runs under a
//! single acquisition of the write lock, so the conversation index, the
//! session record and the published feed never disagree.

use callcore::{
    CallError, CallId, CallSession, CallStatus, Clock, ConversationId, EndReason,
    SignalingSnapshot, UserId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, watch};

use super::events::EventBus;
use crate::config::CallConfig;

/// What subscribers of a session observe after every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFeed {
    pub status: CallStatus,
    pub signaling: SignalingSnapshot,
    pub duration_secs: Option<u64>,
    pub end_reason: Option<EndReason>,
}

impl From<&CallSession> for SessionFeed {
    fn from(session: &CallSession) -> Self {
        Self {
            status: session.status,
            signaling: session.signaling(),
            duration_secs: session.duration_secs,
            end_reason: session.end_reason,
        }
    }
}

pub(crate) struct SessionEntry {
    pub(crate) session: CallSession,
    /// Insertion order, used to break ties between equal timestamps.
    pub(crate) seq: u64,
    feed: watch::Sender<SessionFeed>,
}

impl SessionEntry {
    /// Push the current record to every subscriber.
    pub(crate) fn publish(&self) {
        self.feed.send_replace(SessionFeed::from(&self.session));
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionFeed> {
        self.feed.subscribe()
    }

    pub(crate) fn require_participant(
        &self,
        actor: &UserId,
    ) -> Result<callcore::Role, CallError> {
        self.session.role_of(actor).ok_or_else(|| {
            CallError::Forbidden(format!(
                "{} is not a participant of call {}",
                actor, self.session.id
            ))
        })
    }
}

#[derive(Default)]
pub(crate) struct RegistryState {
    sessions: HashMap<CallId, SessionEntry>,
    /// Conversation → its single non-terminal call.
    active: HashMap<ConversationId, CallId>,
    next_seq: u64,
}

impl RegistryState {
    pub(crate) fn get(&self, call_id: &CallId) -> Result<&SessionEntry, CallError> {
        self.sessions
            .get(call_id)
            .ok_or_else(|| CallError::NotFound(format!("call {call_id}")))
    }

    pub(crate) fn get_mut(&mut self, call_id: &CallId) -> Result<&mut SessionEntry, CallError> {
        self.sessions
            .get_mut(call_id)
            .ok_or_else(|| CallError::NotFound(format!("call {call_id}")))
    }

    pub(crate) fn active_call_id(&self, conversation: &ConversationId) -> Option<&CallId> {
        self.active.get(conversation)
    }

    /// Insert a freshly created session and index it as its conversation's
    /// active call.
    pub(crate) fn insert_active(&mut self, session: CallSession) -> &SessionEntry {
        let seq = self.next_seq;
        self.next_seq += 1;
        let (feed, _) = watch::channel(SessionFeed::from(&session));
        let call_id = session.id.clone();
        self.active
            .insert(session.conversation_id.clone(), call_id.clone());
        self.sessions.entry(call_id).or_insert(SessionEntry {
            session,
            seq,
            feed,
        })
    }

    /// Drop the conversation index entry if it still points at this call.
    pub(crate) fn release_conversation(&mut self, conversation: &ConversationId, call_id: &CallId) {
        if self.active.get(conversation) == Some(call_id) {
            self.active.remove(conversation);
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &SessionEntry> {
        self.sessions.values()
    }

    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&SessionEntry) -> bool) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| keep(entry));
        before - self.sessions.len()
    }
}

pub(crate) struct CallRegistry {
    pub(crate) config: CallConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventBus,
    state: RwLock<RegistryState>,
}

impl CallRegistry {
    pub(crate) fn new(config: CallConfig, clock: Arc<dyn Clock>) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            clock,
            events,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().await
    }
}
