//! The input-queue connector contract and the in-memory broker.
//!
//! The contract mirrors peek-lock broker semantics: `receive` hands out a
//! locked message and bumps its delivery count; the caller must `complete`,
//! `abandon`, or `dead_letter` it. Delivery is at-least-once; redelivery
//! after abandon (or a crashed worker) is the broker's retry mechanism.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hive_types::error::{DeadLetterReason, PipelineError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// One locked input message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    /// Broker-assigned message identifier.
    pub message_id: String,
    /// JSON body, passed through to the agent unmodified.
    pub body: serde_json::Value,
    /// How many times this message has been delivered, including this one.
    pub delivery_count: u32,
    /// When the message was first enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// The input connector contract. The production broker client is an external
/// collaborator; [`MemoryQueue`] implements the same contract in-process.
#[async_trait]
pub trait QueueConnector: Send + Sync + std::fmt::Debug {
    /// Waits up to `max_wait` for one message. `Ok(None)` means the queue
    /// stayed empty for the whole window.
    async fn receive(&self, max_wait: Duration) -> Result<Option<QueueMessage>, PipelineError>;

    /// Settles the message permanently; it will not be redelivered.
    async fn complete(&self, message: &QueueMessage) -> Result<(), PipelineError>;

    /// Releases the lock so the broker redelivers the message with an
    /// incremented delivery count.
    async fn abandon(&self, message: &QueueMessage) -> Result<(), PipelineError>;

    /// Routes the message to the dead-letter destination with a reason.
    async fn dead_letter(
        &self,
        message: &QueueMessage,
        reason: DeadLetterReason,
        description: &str,
    ) -> Result<(), PipelineError>;
}

/// A dead-lettered message with its routing reason.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLettered {
    /// The routed message.
    pub message: QueueMessage,
    /// Why it was routed.
    pub reason: DeadLetterReason,
    /// Free-text description recorded alongside the reason.
    pub description: String,
}

/// An in-process broker with peek-lock semantics, used for development and
/// tests.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queue: Mutex<VecDeque<QueueMessage>>,
    inflight: Mutex<HashMap<String, QueueMessage>>,
    dead: Mutex<Vec<DeadLettered>>,
    arrival: Notify,
}

impl MemoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueues a message body and returns its id. `delivery_count` starts
    /// at zero and is bumped on each receive.
    pub fn enqueue(&self, body: serde_json::Value) -> String {
        let message_id = format!("msg-{}", uuid::Uuid::new_v4());
        self.enqueue_with_id(&message_id, body, 0);
        message_id
    }

    /// Enqueues with an explicit id and prior delivery count. Used by tests
    /// to simulate messages that were already redelivered elsewhere.
    pub fn enqueue_with_id(&self, message_id: &str, body: serde_json::Value, delivery_count: u32) {
        self.queue.lock().push_back(QueueMessage {
            message_id: message_id.to_string(),
            body,
            delivery_count,
            enqueued_at: Utc::now(),
        });
        self.arrival.notify_waiters();
    }

    /// Snapshot of the dead-letter destination.
    pub fn dead_letters(&self) -> Vec<DeadLettered> {
        self.dead.lock().clone()
    }

    /// Messages waiting for delivery (not counting locked ones).
    pub fn backlog(&self) -> usize {
        self.queue.lock().len()
    }

    fn take_locked(&self, message_id: &str) -> Result<QueueMessage, PipelineError> {
        self.inflight.lock().remove(message_id).ok_or_else(|| {
            PipelineError::Broker(format!("message '{message_id}' is not locked by this receiver"))
        })
    }
}

#[async_trait]
impl QueueConnector for MemoryQueue {
    async fn receive(&self, max_wait: Duration) -> Result<Option<QueueMessage>, PipelineError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(mut message) = self.queue.lock().pop_front() {
                message.delivery_count += 1;
                self.inflight
                    .lock()
                    .insert(message.message_id.clone(), message.clone());
                return Ok(Some(message));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Wake on arrival or when the window lapses.
            let _ = tokio::time::timeout(remaining, self.arrival.notified()).await;
        }
    }

    async fn complete(&self, message: &QueueMessage) -> Result<(), PipelineError> {
        self.take_locked(&message.message_id).map(|_| ())
    }

    async fn abandon(&self, message: &QueueMessage) -> Result<(), PipelineError> {
        let locked = self.take_locked(&message.message_id)?;
        self.queue.lock().push_back(locked);
        self.arrival.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        message: &QueueMessage,
        reason: DeadLetterReason,
        description: &str,
    ) -> Result<(), PipelineError> {
        let locked = self.take_locked(&message.message_id)?;
        tracing::warn!(
            target: "connector",
            message_id = %locked.message_id,
            reason = %reason,
            description,
            "dead-lettered message"
        );
        self.dead.lock().push(DeadLettered {
            message: locked,
            reason,
            description: description.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_bumps_delivery_count_each_time() {
        let queue = MemoryQueue::new();
        queue.enqueue(serde_json::json!({"n": 1}));

        let first = queue.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        queue.abandon(&first).await.unwrap();

        let second = queue.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(second.delivery_count, 2);
        assert_eq!(second.message_id, first.message_id);
    }

    #[tokio::test]
    async fn empty_queue_times_out_with_none() {
        let queue = MemoryQueue::new();
        let started = std::time::Instant::now();
        let got = queue.receive(Duration::from_millis(80)).await.unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn completed_messages_are_gone() {
        let queue = MemoryQueue::new();
        queue.enqueue(serde_json::json!("x"));
        let msg = queue.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        queue.complete(&msg).await.unwrap();
        assert_eq!(queue.backlog(), 0);
        assert!(queue.receive(Duration::from_millis(20)).await.unwrap().is_none());
        // Settling twice is a broker error.
        assert!(queue.complete(&msg).await.is_err());
    }

    #[tokio::test]
    async fn dead_letter_records_reason_and_description() {
        let queue = MemoryQueue::new();
        queue.enqueue(serde_json::json!("x"));
        let msg = queue.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        queue
            .dead_letter(&msg, DeadLetterReason::PoisonMessage, "delivery count 4 > 3")
            .await
            .unwrap();
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::PoisonMessage);
        assert!(dead[0].description.contains("4 > 3"));
    }

    #[tokio::test]
    async fn receive_wakes_on_arrival() {
        let queue = MemoryQueue::new();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.receive(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.enqueue(serde_json::json!("late arrival"));
        let got = waiter.await.unwrap().unwrap();
        assert!(got.is_some());
    }
}
