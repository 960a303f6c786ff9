//! Bridges lifecycle events to the external notification sink.
//!
//! New calls are pushed to the receiver; once the sink reports the call was
//! shown, the session moves to `ringing`. Answered and ended calls withdraw
//! the notification again.
//!
//! If the notifier falls behind the event bus, it re-reads the pending calls
//! from the manager: undelivered calls are delivered and notifications for
//! calls that are no longer pending are withdrawn.

use callcore::{CallId, CallStatus, UserId};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::events::{CallAnswered, CallEnded, IncomingCall};
use super::manager::CallManager;
use crate::collaborators::NotificationSink;

enum Signal {
    Incoming(Arc<IncomingCall>),
    Answered(Arc<CallAnswered>),
    Ended(Arc<CallEnded>),
    Lagged,
    Closed,
}

pub struct IncomingCallNotifier {
    manager: Weak<CallManager>,
    sink: Arc<dyn NotificationSink>,
    incoming: broadcast::Receiver<Arc<IncomingCall>>,
    answered: broadcast::Receiver<Arc<CallAnswered>>,
    ended: broadcast::Receiver<Arc<CallEnded>>,
    /// Notifications currently on screen, by call.
    shown: HashMap<CallId, UserId>,
}

impl IncomingCallNotifier {
    /// Subscribe to the manager's events. Subscribing happens here, so no
    /// call started after this returns can be missed.
    ///
    /// Only a weak reference to the manager is kept: the notifier exits once
    /// the manager and its relay handles are dropped.
    pub fn new(manager: &Arc<CallManager>, sink: Arc<dyn NotificationSink>) -> Self {
        let events = manager.events();
        let incoming = events.incoming.subscribe();
        let answered = events.answered.subscribe();
        let ended = events.ended.subscribe();
        Self {
            manager: Arc::downgrade(manager),
            sink,
            incoming,
            answered,
            ended,
            shown: HashMap::new(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the manager's event bus is gone.
    pub async fn run(mut self) {
        loop {
            let signal = tokio::select! {
                r = self.incoming.recv() => lift(r, Signal::Incoming),
                r = self.answered.recv() => lift(r, Signal::Answered),
                r = self.ended.recv() => lift(r, Signal::Ended),
            };

            match signal {
                Signal::Incoming(call) => self.deliver(&call).await,
                Signal::Answered(answer) => {
                    self.dismiss(&answer.call_id, &answer.receiver_id).await
                }
                Signal::Ended(ended) => self.dismiss(&ended.call_id, &ended.receiver_id).await,
                Signal::Lagged => self.catch_up().await,
                Signal::Closed => {
                    debug!(target: "Calls/Notify", "Event bus closed, notifier exiting");
                    return;
                }
            }
        }
    }

    async fn deliver(&mut self, call: &IncomingCall) {
        if self.shown.contains_key(&call.call_id) {
            return;
        }
        if let Err(e) = self.sink.notify_incoming(call).await {
            warn!(
                target: "Calls/Notify",
                "Failed to notify {} of call {}: {e:#}",
                call.receiver_id, call.call_id
            );
            return;
        }
        self.shown
            .insert(call.call_id.clone(), call.receiver_id.clone());

        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        // The call may already be answered or ended by the time the
        // notification lands; that is not an error.
        if let Err(e) = manager.mark_ringing(&call.call_id, &call.receiver_id).await {
            debug!(target: "Calls/Notify", "Call {} not marked ringing: {e}", call.call_id);
        }
    }

    async fn dismiss(&mut self, call_id: &CallId, receiver: &UserId) {
        if self.shown.remove(call_id).is_none() {
            return;
        }
        if let Err(e) = self.sink.dismiss(call_id, receiver).await {
            warn!(
                target: "Calls/Notify",
                "Failed to dismiss call {call_id} for {receiver}: {e:#}"
            );
        }
    }

    /// Rebuild the sink's view from the manager after missed events.
    async fn catch_up(&mut self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let pending = manager.pending_calls().await;
        drop(manager);

        let live: HashSet<&CallId> = pending.iter().map(|s| &s.id).collect();
        let stale: Vec<(CallId, UserId)> = self
            .shown
            .iter()
            .filter(|(id, _)| !live.contains(id))
            .map(|(id, receiver)| (id.clone(), receiver.clone()))
            .collect();
        for (call_id, receiver) in stale {
            self.dismiss(&call_id, &receiver).await;
        }

        for session in pending {
            if session.status != CallStatus::Calling {
                continue;
            }
            self.deliver(&IncomingCall {
                call_id: session.id,
                caller_id: session.caller_id,
                receiver_id: session.receiver_id,
                conversation_id: session.conversation_id,
                created_at: session.created_at,
            })
            .await;
        }
    }
}

fn lift<T>(result: Result<T, RecvError>, wrap: fn(T) -> Signal) -> Signal {
    match result {
        Ok(value) => wrap(value),
        Err(RecvError::Lagged(skipped)) => {
            warn!(
                target: "Calls/Notify",
                "Notifier lagged, skipped {skipped} event(s); resyncing from the manager"
            );
            Signal::Lagged
        }
        Err(RecvError::Closed) => Signal::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ChannelNotificationSink, Notification};
    use crate::config::CallConfig;
    use callcore::ConversationId;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn small_bus() -> Arc<CallManager> {
        let _ = env_logger::builder().is_test(true).try_init();
        CallManager::new(CallConfig {
            event_capacity: 2,
            ..Default::default()
        })
    }

    async fn start_many(manager: &CallManager, n: usize) -> Vec<CallId> {
        let mut ids = Vec::new();
        for i in 0..n {
            let session = manager
                .start_call(
                    &UserId::new(format!("caller-{i}")),
                    &UserId::new("bob"),
                    &ConversationId::new(format!("conv-{i}")),
                )
                .await
                .unwrap();
            ids.push(session.id);
        }
        ids
    }

    async fn collect(
        rx: &mut mpsc::UnboundedReceiver<Notification>,
        n: usize,
    ) -> Vec<Notification> {
        let mut out = Vec::new();
        while out.len() < n {
            let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("notification delivered")
                .expect("sink open");
            out.push(next);
        }
        out
    }

    #[tokio::test]
    async fn test_overflowed_incoming_calls_are_still_delivered() {
        let manager = small_bus();
        let (sink, mut rx) = ChannelNotificationSink::new();
        let notifier = IncomingCallNotifier::new(&manager, Arc::new(sink));

        // Six calls into a bus that holds two, before the notifier runs.
        let ids = start_many(&manager, 6).await;
        let task = notifier.spawn();

        let delivered: HashSet<CallId> = collect(&mut rx, 6)
            .await
            .into_iter()
            .map(|n| match n {
                Notification::Incoming { call_id, .. } => call_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(delivered, ids.iter().cloned().collect());

        for id in &ids {
            assert_eq!(
                manager.get_call(id).await.unwrap().status,
                CallStatus::Ringing
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "a call was notified twice");

        task.abort();
    }

    #[tokio::test]
    async fn test_overflowed_endings_still_dismiss() {
        let manager = small_bus();
        let (sink, mut rx) = ChannelNotificationSink::new();
        let task = IncomingCallNotifier::new(&manager, Arc::new(sink)).spawn();

        let ids = start_many(&manager, 2).await;
        collect(&mut rx, 2).await;

        // Three endings for a bus that holds two, without yielding to the
        // notifier in between.
        for id in &ids {
            manager.end_call(id, &UserId::new("bob")).await.unwrap();
        }
        let extra = manager
            .start_call(
                &UserId::new("carol"),
                &UserId::new("dave"),
                &ConversationId::new("conv-cd"),
            )
            .await
            .unwrap();
        manager.end_call(&extra.id, &UserId::new("dave")).await.unwrap();

        let mut dismissed = HashSet::new();
        while !ids.iter().all(|id| dismissed.contains(id)) {
            if let Notification::Dismissed { call_id, .. } = collect(&mut rx, 1).await.remove(0) {
                assert!(dismissed.insert(call_id), "a call was dismissed twice");
            }
        }

        task.abort();
    }
}
