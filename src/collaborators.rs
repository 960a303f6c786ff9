//! Narrow interfaces to the systems this crate depends on but does not own:
//! authentication, conversation membership and push notification delivery.
//!
//! The in-memory implementations back the tests and the demo binary.

use async_trait::async_trait;
use callcore::{CallId, ConversationId, UserId};
use dashmap::DashMap;
use log::info;
use tokio::sync::mpsc;

use crate::calls::events::IncomingCall;

/// Resolves the acting user of a request.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `None` when the credentials do not map to a user.
    async fn resolve(&self, token: &str) -> Option<UserId>;
}

/// Answers conversation existence and membership questions.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    /// Members of a conversation, or `None` if it does not exist.
    async fn members(&self, conversation: &ConversationId) -> Option<Vec<UserId>>;

    async fn user_exists(&self, user: &UserId) -> bool;
}

/// Surfaces incoming calls on the receiver's devices.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver an incoming-call notification. `Ok` means the receiver's
    /// device has shown it.
    async fn notify_incoming(&self, call: &IncomingCall) -> anyhow::Result<()>;

    /// Withdraw the notification once the call was answered or ended.
    async fn dismiss(&self, call_id: &CallId, receiver: &UserId) -> anyhow::Result<()>;
}

/// Bearer-token identity table.
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    tokens: DashMap<String, UserId>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, user: UserId) {
        self.tokens.insert(token.into(), user);
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, token: &str) -> Option<UserId> {
        self.tokens.get(token).map(|user| user.value().clone())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: DashMap<UserId, ()>,
    conversations: DashMap<ConversationId, Vec<UserId>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: UserId) {
        self.users.insert(user, ());
    }

    /// Register a conversation; its members are registered as users too.
    pub fn add_conversation(&self, conversation: ConversationId, members: Vec<UserId>) {
        for member in &members {
            self.users.insert(member.clone(), ());
        }
        self.conversations.insert(conversation, members);
    }
}

#[async_trait]
impl ConversationDirectory for InMemoryDirectory {
    async fn members(&self, conversation: &ConversationId) -> Option<Vec<UserId>> {
        self.conversations
            .get(conversation)
            .map(|members| members.value().clone())
    }

    async fn user_exists(&self, user: &UserId) -> bool {
        self.users.contains_key(user)
    }
}

/// Writes notifications to the log. Used by the demo binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify_incoming(&self, call: &IncomingCall) -> anyhow::Result<()> {
        info!(
            target: "Notify",
            "{}: incoming call {} from {}",
            call.receiver_id, call.call_id, call.caller_id
        );
        Ok(())
    }

    async fn dismiss(&self, call_id: &CallId, receiver: &UserId) -> anyhow::Result<()> {
        info!(target: "Notify", "{receiver}: dismissed call {call_id}");
        Ok(())
    }
}

/// What a [`ChannelNotificationSink`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Incoming { call_id: CallId, receiver: UserId },
    Dismissed { call_id: CallId, receiver: UserId },
}

/// Forwards notifications into a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotificationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotificationSink {
    async fn notify_incoming(&self, call: &IncomingCall) -> anyhow::Result<()> {
        self.tx
            .send(Notification::Incoming {
                call_id: call.call_id.clone(),
                receiver: call.receiver_id.clone(),
            })
            .map_err(|_| anyhow::anyhow!("notification receiver dropped"))
    }

    async fn dismiss(&self, call_id: &CallId, receiver: &UserId) -> anyhow::Result<()> {
        self.tx
            .send(Notification::Dismissed {
                call_id: call_id.clone(),
                receiver: receiver.clone(),
            })
            .map_err(|_| anyhow::anyhow!("notification receiver dropped"))
    }
}
