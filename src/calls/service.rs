//! Request/response surface exposed to application clients.
//!
//! Each operation resolves the acting user from the request credentials,
//! checks conversation membership where the operation names a conversation,
//! and then delegates to [`CallManager`] or [`SignalingRelay`].

use callcore::{
    CallError, CallId, CallSession, ConversationId, IceCandidate, Role, SessionDescription,
    SignalingSnapshot, UserId,
};
use std::sync::Arc;

use super::manager::CallManager;
use super::relay::{SignalingFeed, SignalingRelay};
use crate::collaborators::{ConversationDirectory, IdentityResolver};

pub struct CallService {
    manager: Arc<CallManager>,
    relay: SignalingRelay,
    identity: Arc<dyn IdentityResolver>,
    directory: Arc<dyn ConversationDirectory>,
}

impl CallService {
    pub fn new(
        manager: Arc<CallManager>,
        identity: Arc<dyn IdentityResolver>,
        directory: Arc<dyn ConversationDirectory>,
    ) -> Self {
        let relay = manager.relay();
        Self {
            manager,
            relay,
            identity,
            directory,
        }
    }

    pub fn manager(&self) -> &Arc<CallManager> {
        &self.manager
    }

    pub async fn authenticate(&self, token: &str) -> Result<UserId, CallError> {
        if token.is_empty() {
            return Err(CallError::Unauthenticated);
        }
        self.identity
            .resolve(token)
            .await
            .ok_or(CallError::Unauthenticated)
    }

    /// Conversation members, requiring `actor` to be one of them.
    async fn require_member(
        &self,
        conversation: &ConversationId,
        actor: &UserId,
    ) -> Result<Vec<UserId>, CallError> {
        let members = self
            .directory
            .members(conversation)
            .await
            .ok_or_else(|| CallError::NotFound(format!("conversation {conversation}")))?;
        if !members.contains(actor) {
            return Err(CallError::Forbidden(format!(
                "{actor} is not a member of {conversation}"
            )));
        }
        Ok(members)
    }

    pub async fn start_call(
        &self,
        token: &str,
        receiver: &UserId,
        conversation: &ConversationId,
    ) -> Result<CallSession, CallError> {
        let caller = self.authenticate(token).await?;
        if receiver.is_empty() || conversation.is_empty() {
            return Err(CallError::BadRequest(
                "receiver and conversation are required".into(),
            ));
        }
        let members = self.require_member(conversation, &caller).await?;
        if !self.directory.user_exists(receiver).await {
            return Err(CallError::NotFound(format!("user {receiver}")));
        }
        if !members.contains(receiver) {
            return Err(CallError::BadRequest(format!(
                "{receiver} is not a member of {conversation}"
            )));
        }
        self.manager.start_call(&caller, receiver, conversation).await
    }

    pub async fn answer_call(
        &self,
        token: &str,
        call_id: &CallId,
        accept: bool,
    ) -> Result<CallSession, CallError> {
        let actor = self.authenticate(token).await?;
        self.manager.answer_call(call_id, &actor, accept).await
    }

    pub async fn end_call(&self, token: &str, call_id: &CallId) -> Result<u64, CallError> {
        let actor = self.authenticate(token).await?;
        self.manager.end_call(call_id, &actor).await
    }

    pub async fn mark_ringing(&self, token: &str, call_id: &CallId) -> Result<(), CallError> {
        let actor = self.authenticate(token).await?;
        self.manager.mark_ringing(call_id, &actor).await
    }

    pub async fn get_active_call(
        &self,
        token: &str,
        conversation: &ConversationId,
    ) -> Result<Option<CallSession>, CallError> {
        let actor = self.authenticate(token).await?;
        self.require_member(conversation, &actor).await?;
        Ok(self.manager.get_active_call(conversation).await)
    }

    /// Pending calls for `user`. Users may only list their own.
    pub async fn get_incoming_calls(
        &self,
        token: &str,
        user: &UserId,
    ) -> Result<Vec<CallSession>, CallError> {
        let actor = self.authenticate(token).await?;
        if actor != *user {
            return Err(CallError::Forbidden(format!(
                "{actor} cannot list incoming calls of {user}"
            )));
        }
        Ok(self.manager.get_incoming_calls(user).await)
    }

    pub async fn get_call(&self, token: &str, call_id: &CallId) -> Result<CallSession, CallError> {
        let actor = self.authenticate(token).await?;
        let session = self.manager.get_call(call_id).await?;
        if session.role_of(&actor).is_none() {
            return Err(CallError::Forbidden(format!(
                "{actor} is not a participant of call {call_id}"
            )));
        }
        Ok(session)
    }

    pub async fn set_offer(
        &self,
        token: &str,
        call_id: &CallId,
        sdp: SessionDescription,
    ) -> Result<(), CallError> {
        let actor = self.authenticate(token).await?;
        self.relay.set_offer(call_id, &actor, sdp).await
    }

    pub async fn set_answer(
        &self,
        token: &str,
        call_id: &CallId,
        sdp: SessionDescription,
    ) -> Result<(), CallError> {
        let actor = self.authenticate(token).await?;
        self.relay.set_answer(call_id, &actor, sdp).await
    }

    pub async fn add_ice_candidate(
        &self,
        token: &str,
        call_id: &CallId,
        candidate: IceCandidate,
        sender: Role,
    ) -> Result<usize, CallError> {
        let actor = self.authenticate(token).await?;
        self.relay
            .add_ice_candidate(call_id, &actor, candidate, sender)
            .await
    }

    pub async fn get_signaling(
        &self,
        token: &str,
        call_id: &CallId,
    ) -> Result<SignalingSnapshot, CallError> {
        let actor = self.authenticate(token).await?;
        self.relay.get_signaling(call_id, &actor).await
    }

    pub async fn subscribe(&self, token: &str, call_id: &CallId) -> Result<SignalingFeed, CallError> {
        let actor = self.authenticate(token).await?;
        self.relay.subscribe(call_id, &actor).await
    }
}
