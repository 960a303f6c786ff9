use log::{debug, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::manager::CallManager;

impl CallManager {
    /// Spawn the unanswered-call watchdog if
    /// [`CallConfig::unanswered_timeout_secs`](crate::config::CallConfig) is set.
    ///
    /// The task holds a weak reference and stops once the manager is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let timeout = self.config().unanswered_timeout()?;
        let max_age = match chrono::Duration::from_std(timeout) {
            Ok(max_age) => max_age,
            Err(e) => {
                warn!(
                    target: "Calls/Reaper",
                    "Unanswered timeout of {}s is out of range ({e}), reaper disabled",
                    timeout.as_secs()
                );
                return None;
            }
        };
        let mut ticker = tokio::time::interval(self.config().reaper_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let manager = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    debug!(target: "Calls/Reaper", "Manager dropped, reaper exiting");
                    return;
                };
                manager.expire_unanswered(max_age).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::calls::CallManager;
    use crate::config::CallConfig;
    use callcore::{CallStatus, ConversationId, EndReason, ManualClock, UserId};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_reaper_ends_abandoned_call() {
        let clock = Arc::new(ManualClock::default());
        let manager = CallManager::with_clock(
            CallConfig {
                unanswered_timeout_secs: Some(30),
                reaper_interval_secs: 1,
                ..Default::default()
            },
            clock.clone(),
        );
        let mut ended = manager.subscribe_ended();
        let reaper = manager.spawn_reaper().expect("reaper enabled");

        let session = manager
            .start_call(
                &UserId::new("alice"),
                &UserId::new("bob"),
                &ConversationId::new("conv-ab"),
            )
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(31));

        let event = ended.recv().await.unwrap();
        assert_eq!(event.call_id, session.id);
        assert_eq!(event.reason, EndReason::Unanswered);
        assert_eq!(
            manager.get_call(&session.id).await.unwrap().status,
            CallStatus::Ended
        );

        reaper.abort();
    }

    #[tokio::test]
    async fn test_reaper_disabled_without_timeout() {
        let manager = CallManager::new(CallConfig::default());
        assert!(manager.spawn_reaper().is_none());
    }

    #[tokio::test]
    async fn test_reaper_disabled_when_timeout_out_of_range() {
        let _ = env_logger::builder().is_test(true).try_init();
        let manager = CallManager::new(CallConfig {
            unanswered_timeout_secs: Some(u64::MAX),
            ..Default::default()
        });
        assert!(manager.spawn_reaper().is_none());
    }
}
