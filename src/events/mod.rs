//! Typed action broadcast for batch lifecycle events.
//!
//! The message bus delivers typed action records to downstream subscribers
//! over std::sync::mpsc channels. Delivery semantics are at-least-once:
//! several detection paths can broadcast the same logical failure, so
//! handlers must be idempotent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors that can occur within the message bus
#[derive(Error, Debug)]
pub enum MessageBusError {
    /// Failed to send a message to subscribers
    #[error("Failed to send message: {reason}")]
    SendFailed { reason: String },
}

/// Result type for message bus operations
pub type MessageBusResult<T> = Result<T, MessageBusError>;

/// Trait for types that can be used as events in the message bus
pub trait EventType: Clone + Send + 'static {
    /// Get the unique type identifier for this event type
    fn type_id() -> &'static str;
}

/// Broadcast when the canonical pod-failure path runs for a pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchProcessFailed {
    pub pod_name: String,
    pub bucket: String,
    pub filename: String,
    pub reason: String,
}

impl BatchProcessFailed {
    pub fn new(pod_name: &str, bucket: &str, filename: &str, reason: &str) -> Self {
        Self {
            pod_name: pod_name.to_string(),
            bucket: bucket.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Broadcast when a conversion pod reaches a successful terminal phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchProcessSucceeded {
    pub pod_name: String,
    pub bucket: String,
    pub filename: String,
}

impl BatchProcessSucceeded {
    pub fn new(pod_name: &str, bucket: &str, filename: &str) -> Self {
        Self {
            pod_name: pod_name.to_string(),
            bucket: bucket.to_string(),
            filename: filename.to_string(),
        }
    }
}

/// Broadcast when a pod is registered with the lifecycle tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodRegistered {
    pub pod_name: String,
    pub pod_type: String,
}

impl PodRegistered {
    pub fn new(pod_name: &str, pod_type: &str) -> Self {
        Self {
            pod_name: pod_name.to_string(),
            pod_type: pod_type.to_string(),
        }
    }
}

/// Broadcast when a delivery-ensured mutation exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryExhausted {
    pub table: String,
    pub key: String,
    pub detail: String,
}

impl DeliveryExhausted {
    pub fn new(table: &str, key: &str, detail: &str) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            detail: detail.to_string(),
        }
    }
}

impl EventType for BatchProcessFailed {
    fn type_id() -> &'static str {
        "BatchProcessFailed"
    }
}

impl EventType for BatchProcessSucceeded {
    fn type_id() -> &'static str {
        "BatchProcessSucceeded"
    }
}

impl EventType for PodRegistered {
    fn type_id() -> &'static str {
        "PodRegistered"
    }
}

impl EventType for DeliveryExhausted {
    fn type_id() -> &'static str {
        "DeliveryExhausted"
    }
}

/// Unified event enumeration for callers that route events generically
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    BatchProcessFailed(BatchProcessFailed),
    BatchProcessSucceeded(BatchProcessSucceeded),
    PodRegistered(PodRegistered),
    DeliveryExhausted(DeliveryExhausted),
}

impl Event {
    /// Get the event type as a string identifier
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::BatchProcessFailed(_) => "BatchProcessFailed",
            Event::BatchProcessSucceeded(_) => "BatchProcessSucceeded",
            Event::PodRegistered(_) => "PodRegistered",
            Event::DeliveryExhausted(_) => "DeliveryExhausted",
        }
    }
}

/// Consumer handle for receiving events of a specific type
pub struct Consumer<T: EventType> {
    receiver: Receiver<T>,
}

impl<T: EventType> Consumer<T> {
    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<T, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive an event, blocking until one is available
    pub fn recv(&mut self) -> Result<T, mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event with a timeout
    pub fn recv_timeout(&mut self, timeout: std::time::Duration) -> Result<T, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Internal registry for managing event subscribers
struct SubscriberRegistry {
    // Type erasure so differently typed senders share one map.
    // Key: event type name, Value: list of boxed senders
    subscribers: HashMap<String, Vec<Box<dyn std::any::Any + Send>>>,
}

impl SubscriberRegistry {
    fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
        }
    }

    fn add_subscriber<T: EventType>(&mut self, sender: Sender<T>) {
        self.subscribers
            .entry(T::type_id().to_string())
            .or_default()
            .push(Box::new(sender));
    }

    fn get_subscribers<T: EventType>(&self) -> Vec<&Sender<T>> {
        self.subscribers
            .get(T::type_id())
            .map(|senders| {
                senders
                    .iter()
                    .filter_map(|boxed| boxed.downcast_ref::<Sender<T>>())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Main message bus for event-driven communication between the batch
/// services and downstream subscribers.
pub struct MessageBus {
    registry: Arc<Mutex<SubscriberRegistry>>,
}

impl MessageBus {
    /// Create a new message bus instance
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(SubscriberRegistry::new())),
        }
    }

    /// Subscribe to events of a specific type
    /// Returns a Consumer that can be used to receive events
    pub fn subscribe<T: EventType>(&self) -> Consumer<T> {
        let (sender, receiver) = mpsc::channel();

        let mut registry = self.registry.lock().unwrap();
        registry.add_subscriber(sender);

        Consumer { receiver }
    }

    /// Publish an event to all subscribers of that event type
    pub fn publish<T: EventType>(&self, event: T) -> MessageBusResult<()> {
        let registry = self.registry.lock().unwrap();
        let subscribers = registry.get_subscribers::<T>();

        if subscribers.is_empty() {
            // No subscribers for this event type - this is not an error
            return Ok(());
        }

        let total_subscribers = subscribers.len();
        let mut failed_sends = 0;

        for subscriber in subscribers {
            if subscriber.send(event.clone()).is_err() {
                failed_sends += 1;
            }
        }

        if failed_sends > 0 {
            return Err(MessageBusError::SendFailed {
                reason: format!(
                    "{} of {} subscribers failed to receive event",
                    failed_sends, total_subscribers
                ),
            });
        }

        Ok(())
    }

    /// Convenience method to publish a unified Event
    pub fn publish_event(&self, event: Event) -> MessageBusResult<()> {
        match event {
            Event::BatchProcessFailed(e) => self.publish(e),
            Event::BatchProcessSucceeded(e) => self.publish(e),
            Event::PodRegistered(e) => self.publish(e),
            Event::DeliveryExhausted(e) => self.publish(e),
        }
    }

    /// Get the number of subscribers for a given event type
    pub fn subscriber_count<T: EventType>(&self) -> usize {
        let registry = self.registry.lock().unwrap();
        registry.get_subscribers::<T>().len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_basic_pubsub() {
        let bus = MessageBus::new();
        let mut consumer = bus.subscribe::<BatchProcessFailed>();

        assert!(consumer.try_recv().is_err());

        let event = BatchProcessFailed::new("conv-abc", "models", "part.step", "exit code 2");
        bus.publish(event.clone()).unwrap();

        assert_eq!(consumer.try_recv().unwrap(), event);
    }

    #[test]
    fn test_multiple_consumers_same_event_type() {
        let bus = MessageBus::new();
        let mut consumer1 = bus.subscribe::<PodRegistered>();
        let mut consumer2 = bus.subscribe::<PodRegistered>();

        assert_eq!(bus.subscriber_count::<PodRegistered>(), 2);

        let event = PodRegistered::new("conv-abc", "process");
        bus.publish(event.clone()).unwrap();

        assert_eq!(consumer1.try_recv().unwrap(), event);
        assert_eq!(consumer2.try_recv().unwrap(), event);
    }

    #[test]
    fn test_different_event_types_are_isolated() {
        let bus = MessageBus::new();
        let mut failed_consumer = bus.subscribe::<BatchProcessFailed>();
        let mut succeeded_consumer = bus.subscribe::<BatchProcessSucceeded>();

        bus.publish(BatchProcessSucceeded::new("conv-abc", "models", "part.step"))
            .unwrap();

        assert!(failed_consumer.try_recv().is_err());
        assert!(succeeded_consumer.try_recv().is_ok());
    }

    #[test]
    fn test_no_subscribers_is_not_an_error() {
        let bus = MessageBus::new();
        bus.publish(DeliveryExhausted::new("attr_by_key", "color", "gave up"))
            .unwrap();
    }

    #[test]
    fn test_publish_event_unified() {
        let bus = MessageBus::new();
        let mut consumer = bus.subscribe::<BatchProcessFailed>();

        let event = BatchProcessFailed::new("conv-abc", "models", "part.step", "probe failed");
        bus.publish_event(Event::BatchProcessFailed(event.clone())).unwrap();

        assert_eq!(consumer.try_recv().unwrap(), event);
    }

    #[test]
    fn test_consumer_recv_timeout() {
        let bus = MessageBus::new();
        let mut consumer = bus.subscribe::<PodRegistered>();

        let result = consumer.recv_timeout(Duration::from_millis(10));
        assert!(matches!(result, Err(mpsc::RecvTimeoutError::Timeout)));
    }

    #[test]
    fn test_event_serialization() {
        let event = BatchProcessFailed::new("conv-abc", "models", "part.step", "unreachable");
        let serialized = serde_json::to_string(&event).unwrap();
        let deserialized: BatchProcessFailed = serde_json::from_str(&serialized).unwrap();
        assert_eq!(event, deserialized);
    }
}
