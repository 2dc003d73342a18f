//! In-process event bus.
//!
//! Decoded events are delivered to every subscriber as JSON strings over
//! bounded channels. Delivery is awaited synchronously with the decode loop,
//! so a slow subscriber slows decoding, which in turn delays status feedback
//! upstream. That is the intended flow-control path: WAL accumulates on the
//! server instead of events accumulating in memory here.

use tokio::sync::mpsc;
use tracing::debug;

use crate::{Error, Result};

pub struct EventBus {
    capacity: usize,
    subscribers: Vec<mpsc::Sender<String>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subscribers: Vec::new(),
        }
    }

    /// Registers a subscriber and returns its receiving end.
    ///
    /// Subscriptions are made before the ingester starts; the bus is moved
    /// into the session loop afterwards.
    pub fn subscribe(&mut self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.push(tx);
        debug!("subscriber registered, total: {}", self.subscribers.len());
        rx
    }

    /// Delivers one event to every subscriber, waiting for channel space.
    ///
    /// A dropped subscriber is an error: the caller's failure handling will
    /// eventually rebuild the stream, re-announcing relation state to any
    /// replacement consumer.
    pub async fn publish(&self, event: String) -> Result<()> {
        for subscriber in &self.subscribers {
            subscriber
                .send(event.clone())
                .await
                .map_err(|_| Error::Bus("subscriber channel closed".to_string()))?;
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let mut bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish("event-1".to_string()).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), "event-1");
        assert_eq!(rx2.recv().await.unwrap(), "event-1");
    }

    #[tokio::test]
    async fn preserves_order() {
        let mut bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        for i in 0..3 {
            bus.publish(format!("event-{i}")).await.unwrap();
        }

        assert_eq!(rx.recv().await.unwrap(), "event-0");
        assert_eq!(rx.recv().await.unwrap(), "event-1");
        assert_eq!(rx.recv().await.unwrap(), "event-2");
    }

    #[tokio::test]
    async fn dropped_subscriber_is_an_error() {
        let mut bus = EventBus::new(8);
        let rx = bus.subscribe();
        drop(rx);

        let result = bus.publish("event".to_string()).await;
        assert!(matches!(result, Err(Error::Bus(_))));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(8);
        bus.publish("event".to_string()).await.unwrap();
    }
}
