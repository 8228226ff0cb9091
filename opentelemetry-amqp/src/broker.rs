//! # Broker seam
//!
//! [`BrokerChannel`] is the only thing the [`Publisher`] needs from a broker
//! client: hand one message to a named exchange and report whether the broker
//! took it. Consumers read a [`Deliveries`] stream instead.
//!
//! [`Publisher`]: crate::Publisher
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::Stream;
use opentelemetry::otel_debug;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::BrokerError;
use crate::message::Message;

/// Stream of messages delivered to a consumer.
///
/// The stream ends when the broker closes the delivery channel.
pub type Deliveries = Pin<Box<dyn Stream<Item = Result<Message, BrokerError>> + Send>>;

/// A minimal interface for handing messages to a broker.
///
/// A single channel is shared by every publish call, so implementations must
/// be safe to use from concurrent tasks. [`Publisher`] adds no locking of its
/// own.
///
/// [`Publisher`]: crate::Publisher
#[async_trait]
pub trait BrokerChannel: Debug + Send + Sync {
    /// Send `message` to `exchange`, routed by its routing key.
    ///
    /// Returns once the broker client has taken the message. It does not wait
    /// for any consumer.
    async fn publish(&self, exchange: &str, message: &Message) -> Result<(), BrokerError>;
}

#[async_trait]
impl<T: BrokerChannel + ?Sized> BrokerChannel for Arc<T> {
    async fn publish(&self, exchange: &str, message: &Message) -> Result<(), BrokerError> {
        self.as_ref().publish(exchange, message).await
    }
}

/// A broker that lives in process memory.
///
/// Every accepted message is recorded and forwarded to all subscribers,
/// whatever its exchange or routing key. The broker can be switched into a
/// failing state to simulate an unusable channel, and closed to end all
/// subscriber streams.
///
/// It is meant for tests and short local runs. The record of published
/// messages grows until [`InMemoryBroker::reset`] is called.
///
/// # Example
///
/// ```
/// # use opentelemetry_amqp::{BrokerChannel, InMemoryBroker, Message};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let broker = InMemoryBroker::new();
/// broker
///     .publish("food", &Message::new("greens", "spinach"))
///     .await
///     .unwrap();
///
/// assert_eq!(broker.published().len(), 1);
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    published: Mutex<Vec<(String, Message)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Result<Message, BrokerError>>>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryBroker {
    /// Create an open broker with no subscribers.
    pub fn new() -> Self {
        InMemoryBroker::default()
    }

    /// Open a delivery stream that receives every message published from now on.
    ///
    /// Subscribing to a closed broker returns a stream that ends immediately.
    pub fn subscribe(&self) -> Deliveries {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.inner.closed.load(Ordering::Acquire) {
            if let Ok(mut subscribers) = self.inner.subscribers.lock() {
                subscribers.push(tx);
            }
        }
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    /// Messages accepted so far, with the exchange they were sent to.
    pub fn published(&self) -> Vec<(String, Message)> {
        self.inner
            .published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    /// Forget the messages published so far. Subscribers are kept.
    pub fn reset(&self) {
        if let Ok(mut published) = self.inner.published.lock() {
            published.clear();
        }
    }

    /// Make every following publish fail, or recover from that state.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::Release);
    }

    /// Close the broker. Subscriber streams end and publishing fails.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.clear();
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn publish(&self, exchange: &str, message: &Message) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ChannelClosed);
        }
        if self.inner.failing.load(Ordering::Acquire) {
            return Err(BrokerError::Rejected("in-memory broker is failing".into()));
        }

        self.inner
            .published
            .lock()
            .map_err(|err| BrokerError::Other(err.to_string()))?
            .push((exchange.to_string(), message.clone()));

        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.retain(|tx| tx.send(Ok(message.clone())).is_ok());
            otel_debug!(
                name: "InMemoryBroker.Publish",
                exchange = exchange.to_string(),
                routing_key = message.routing_key.clone(),
                subscribers = subscribers.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn fans_out_to_subscribers() {
        let broker = InMemoryBroker::new();
        let mut first = broker.subscribe();
        let mut second = broker.subscribe();

        broker
            .publish("food", &Message::new("fruit", "kiwi"))
            .await
            .unwrap();

        for deliveries in [&mut first, &mut second] {
            let message = deliveries.next().await.unwrap().unwrap();
            assert_eq!(message.routing_key, "fruit");
            assert_eq!(message.body_lossy(), "kiwi");
        }
        assert_eq!(broker.published()[0].0, "food");
    }

    #[tokio::test]
    async fn failing_broker_rejects() {
        let broker = InMemoryBroker::new();
        broker.set_failing(true);

        let result = broker.publish("food", &Message::new("fruit", "kiwi")).await;

        assert!(matches!(result, Err(BrokerError::Rejected(_))));
        assert!(broker.published().is_empty());

        broker.set_failing(false);
        assert!(broker
            .publish("food", &Message::new("fruit", "kiwi"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let broker = InMemoryBroker::new();
        let mut deliveries = broker.subscribe();

        broker.close();

        assert!(deliveries.next().await.is_none());
        assert!(broker.subscribe().next().await.is_none());
        assert!(matches!(
            broker.publish("food", &Message::new("fruit", "kiwi")).await,
            Err(BrokerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn reset_clears_the_record() {
        let broker = InMemoryBroker::new();
        let mut deliveries = broker.subscribe();
        broker
            .publish("food", &Message::new("fruit", "kiwi"))
            .await
            .unwrap();

        broker.reset();
        assert!(broker.published().is_empty());

        broker
            .publish("food", &Message::new("greens", "kale"))
            .await
            .unwrap();
        assert_eq!(broker.published().len(), 1);
        assert_eq!(deliveries.next().await.unwrap().unwrap().routing_key, "fruit");
        assert_eq!(deliveries.next().await.unwrap().unwrap().routing_key, "greens");
    }

    #[tokio::test]
    async fn shared_handle_publishes() {
        let broker = InMemoryBroker::new();
        let channel: Arc<dyn BrokerChannel> = Arc::new(broker.clone());

        channel
            .publish("food", &Message::new("greens", "kale"))
            .await
            .unwrap();

        assert_eq!(broker.published().len(), 1);
    }
}
