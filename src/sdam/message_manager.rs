//! Wakes sleeping monitors early when a dispatch failure suggests the topology is stale
//! (spec §4.3 "requestImmediateCheck" / §9's generation-counter design).

use tokio::sync::watch;

/// A cheap broadcast of "please re-check now", built on a [`watch`] channel so that many monitor
/// tasks can observe the same generation counter without a mailbox per subscriber.
#[derive(Debug, Clone)]
pub(crate) struct TopologyMessageManager {
    sender: watch::Sender<u64>,
}

impl TopologyMessageManager {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(0);
        Self { sender }
    }

    /// Bumps the generation counter, waking every [`Self::subscribe`]r that's currently
    /// `wait_for_change`ing.
    pub(crate) fn request_immediate_check(&self) {
        self.sender.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub(crate) fn subscribe(&self) -> MessageSubscriber {
        MessageSubscriber {
            receiver: self.sender.subscribe(),
        }
    }
}

pub(crate) struct MessageSubscriber {
    receiver: watch::Receiver<u64>,
}

impl MessageSubscriber {
    /// Returns as soon as [`TopologyMessageManager::request_immediate_check`] is next called.
    /// A monitor races this against its heartbeat-interval sleep and whichever finishes first
    /// wins (spec §4.2).
    pub(crate) async fn wait_for_check_request(&mut self) {
        let _ = self.receiver.changed().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn request_immediate_check_wakes_a_waiting_subscriber() {
        let manager = TopologyMessageManager::new();
        let mut subscriber = manager.subscribe();

        let waiter = tokio::spawn(async move {
            subscriber.wait_for_check_request().await;
        });

        // Give the spawned task a chance to start waiting before we wake it.
        tokio::task::yield_now().await;
        manager.request_immediate_check();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("subscriber should have woken")
            .unwrap();
    }
}
