//! Fan-out from source groups to destination queues.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::events::AlarmEvent;
use super::queue::BatchQueue;

/// Routes events of a group to every destination subscribed to it.
///
/// Built once at startup by inverting each destination's group list.
/// Routing never waits: a full destination queue drops the event.
pub struct FanoutRouter {
    routes: HashMap<String, Vec<Arc<BatchQueue<AlarmEvent>>>>,
}

impl FanoutRouter {
    /// Build the router from `(destination queue, subscribed groups)` pairs.
    pub fn new<'a, I>(subscriptions: I) -> Self
    where
        I: IntoIterator<Item = (Arc<BatchQueue<AlarmEvent>>, &'a [String])>,
    {
        let mut routes: HashMap<String, Vec<Arc<BatchQueue<AlarmEvent>>>> = HashMap::new();
        for (queue, groups) in subscriptions {
            for group in groups {
                let subscribers = routes.entry(group.clone()).or_default();
                if !subscribers.iter().any(|q| Arc::ptr_eq(q, &queue)) {
                    subscribers.push(Arc::clone(&queue));
                }
            }
        }
        Self { routes }
    }

    /// Number of destinations subscribed to `group`.
    pub fn subscriber_count(&self, group: &str) -> usize {
        self.routes.get(group).map_or(0, Vec::len)
    }

    /// Forward `event` to every subscriber of `group`.
    ///
    /// Returns whether all subscribers accepted it.
    pub fn route(&self, group: &str, event: &AlarmEvent) -> bool {
        let Some(subscribers) = self.routes.get(group) else {
            warn!(group, "No destinations subscribed, dropping {}", event);
            return true;
        };

        let mut all_accepted = true;
        for queue in subscribers {
            if !queue.add(event.clone()) {
                debug!(group, destination = queue.name(), "destination rejected event");
                all_accepted = false;
            }
        }
        all_accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::events::AlarmReason;
    use crate::notification::queue::{BatchProcessor, BatchQueueConfig};
    use crate::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Discard;

    #[async_trait]
    impl BatchProcessor<AlarmEvent> for Discard {
        async fn process(&self, _batch: Vec<AlarmEvent>, _overflowed: bool) -> Result<()> {
            Ok(())
        }
    }

    fn queue(name: &str, size: usize) -> Arc<BatchQueue<AlarmEvent>> {
        Arc::new(BatchQueue::spawn(
            name,
            BatchQueueConfig::new(Duration::from_secs(60), Duration::from_secs(60), size),
            Arc::new(Discard),
        ))
    }

    #[tokio::test]
    async fn test_routes_to_every_subscriber() {
        let ops = queue("ops", 10);
        let vac = queue("vacuum-team", 10);
        let ops_groups = vec!["vacuum".to_string(), "rf".to_string()];
        let vac_groups = vec!["vacuum".to_string()];

        let router = FanoutRouter::new([
            (Arc::clone(&ops), ops_groups.as_slice()),
            (Arc::clone(&vac), vac_groups.as_slice()),
        ]);
        assert_eq!(router.subscriber_count("vacuum"), 2);
        assert_eq!(router.subscriber_count("rf"), 1);
        assert_eq!(router.subscriber_count("cryo"), 0);

        let event = AlarmEvent::internal(AlarmReason::Raised);
        assert!(router.route("vacuum", &event));
        assert!(router.route("rf", &event));
        assert_eq!(ops.pending_len(), 2);
        assert_eq!(vac.pending_len(), 1);

        ops.close().await;
        vac.close().await;
    }

    #[tokio::test]
    async fn test_unsubscribed_group_is_not_an_error() {
        let router = FanoutRouter::new(std::iter::empty());
        assert!(router.route("orphan", &AlarmEvent::internal(AlarmReason::Raised)));
    }

    #[tokio::test]
    async fn test_full_destination_does_not_block_others() {
        let small = queue("small", 0);
        let large = queue("large", 10);
        let groups = vec!["vacuum".to_string()];
        let router = FanoutRouter::new([
            (Arc::clone(&small), groups.as_slice()),
            (Arc::clone(&large), groups.as_slice()),
        ]);

        let event = AlarmEvent::internal(AlarmReason::Raised);
        assert!(router.route("vacuum", &event));
        assert!(!router.route("vacuum", &event));
        assert!(!router.route("vacuum", &event));
        assert_eq!(large.pending_len(), 3);
        assert_eq!(small.pending_len(), 2);

        small.close().await;
        large.close().await;
    }
}
