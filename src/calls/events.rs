//! Call lifecycle events published for the notification hook and other
//! observers.

use callcore::{CallId, ConversationId, EndReason, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A new call is waiting for its receiver.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
}

/// The receiver's device surfaced the call.
#[derive(Debug, Clone, Serialize)]
pub struct CallRinging {
    pub call_id: CallId,
    pub receiver_id: UserId,
}

/// The receiver accepted or declined.
#[derive(Debug, Clone, Serialize)]
pub struct CallAnswered {
    pub call_id: CallId,
    pub receiver_id: UserId,
    pub accepted: bool,
}

/// The call moved into `ended`.
#[derive(Debug, Clone, Serialize)]
pub struct CallEnded {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub duration_secs: u64,
    pub reason: EndReason,
    pub ended_by: Option<UserId>,
}

macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new(capacity: usize) -> Self {
                let capacity = capacity.max(1);
                Self {
                    $(
                        $field: broadcast::channel(capacity).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (incoming, Arc<IncomingCall>),
    (ringing, Arc<CallRinging>),
    (answered, Arc<CallAnswered>),
    (ended, Arc<CallEnded>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}
