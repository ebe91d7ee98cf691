//! The run state-transition event bus.
//!
//! Every transition the control plane performs is published here. Consumers
//! (audit sinks, notification fan-out) are external; a bus with no
//! subscribers drops events, which is the intended behavior.

use chrono::Utc;
use hive_types::event::RunEvent;
use hive_types::run::RunStatus;
use tokio::sync::broadcast;

/// A broadcast bus of [`RunEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes one transition. Lagging or absent subscribers never block
    /// the control plane.
    pub fn publish(
        &self,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
        node_id: Option<&str>,
    ) {
        let event = RunEvent {
            run_id: run_id.to_string(),
            from,
            to,
            node_id: node_id.map(str::to_string),
            at: Utc::now(),
        };
        tracing::debug!(
            target: "events",
            run_id,
            from = %from,
            to = %to,
            node_id = node_id.unwrap_or("-"),
            "run transition"
        );
        let _ = self.tx.send(event);
    }

    /// Opens a new subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_transitions_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish("run-1", RunStatus::Pending, RunStatus::Assigned, Some("n1"));
        bus.publish("run-1", RunStatus::Assigned, RunStatus::Running, Some("n1"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.to, RunStatus::Assigned);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.to, RunStatus::Running);
        assert_eq!(second.node_id.as_deref(), Some("n1"));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish("run-1", RunStatus::Pending, RunStatus::Cancelled, None);
    }
}
