//! AMQP 0-9-1 transport built on [`lapin`].
//!
//! AMQP header tables can hold integers, booleans, nested tables and raw
//! bytes. Only text values are carried over into [`MessageHeaders`]; anything
//! else is dropped on the way in, so a non-string value under a propagation
//! key reads as absent.
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Consumer, ExchangeKind};
use opentelemetry::{otel_debug, otel_info};

use crate::broker::{BrokerChannel, Deliveries};
use crate::carrier::MessageHeaders;
use crate::error::BrokerError;
use crate::message::Message;

const CONTENT_TYPE: &str = "text/plain";

impl From<&FieldTable> for MessageHeaders {
    fn from(table: &FieldTable) -> Self {
        let mut headers = MessageHeaders::new();
        for (key, value) in table.inner() {
            match header_text(value) {
                Some(text) => {
                    headers.insert(key.as_str(), text);
                }
                None => {
                    otel_debug!(
                        name: "AmqpHeaders.NonStringValueDropped",
                        key = key.as_str().to_string()
                    );
                }
            }
        }
        headers
    }
}

impl From<&MessageHeaders> for FieldTable {
    fn from(headers: &MessageHeaders) -> Self {
        let mut table = FieldTable::default();
        for (key, value) in headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(value.clone().into()),
            );
        }
        table
    }
}

fn header_text(value: &AMQPValue) -> Option<&str> {
    match value {
        AMQPValue::LongString(text) => std::str::from_utf8(text.as_bytes()).ok(),
        AMQPValue::ShortString(text) => Some(text.as_str()),
        _ => None,
    }
}

fn message_properties(message: &Message) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE))
        .with_headers(FieldTable::from(&message.headers));
    match &message.correlation_id {
        Some(correlation_id) => {
            properties.with_correlation_id(ShortString::from(correlation_id.as_str()))
        }
        None => properties,
    }
}

fn message_from_parts(routing_key: &str, properties: &BasicProperties, data: Vec<u8>) -> Message {
    Message {
        routing_key: routing_key.to_string(),
        body: Bytes::from(data),
        headers: properties
            .headers()
            .as_ref()
            .map(MessageHeaders::from)
            .unwrap_or_default(),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
    }
}

impl From<Delivery> for Message {
    fn from(delivery: Delivery) -> Self {
        message_from_parts(
            delivery.routing_key.as_str(),
            &delivery.properties,
            delivery.data,
        )
    }
}

/// [`BrokerChannel`] backed by a [`lapin::Channel`].
///
/// Each publish waits for the broker's publisher confirm when confirms are
/// enabled on the channel; a negative acknowledgement is reported as
/// [`BrokerError::Rejected`].
#[derive(Clone, Debug)]
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    /// Wrap an open channel.
    pub fn new(channel: Channel) -> Self {
        LapinChannel { channel }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl From<Channel> for LapinChannel {
    fn from(channel: Channel) -> Self {
        LapinChannel::new(channel)
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn publish(&self, exchange: &str, message: &Message) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                message_properties(message),
            )
            .await?;

        match confirm.await? {
            Confirmation::Nack(_) => Err(BrokerError::Rejected(format!(
                "exchange `{exchange}` nacked routing key `{}`",
                message.routing_key
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }
}

/// Turn a lapin consumer into a delivery stream.
pub fn deliveries(consumer: Consumer) -> Deliveries {
    Box::pin(consumer.map(|delivery| {
        delivery
            .map(Message::from)
            .map_err(BrokerError::from)
    }))
}

/// Declare `exchange` as a durable direct exchange.
///
/// Declaring an exchange that already exists with the same settings is a
/// no-op on the broker.
pub async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<(), BrokerError> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// A queue bound to one routing key of an exchange, consumed with automatic
/// acknowledgement.
///
/// The queue is exclusive and not durable: it lives as long as the
/// connection that declared it.
#[derive(Clone, Debug)]
pub struct Subscription {
    exchange: String,
    queue: String,
    binding_key: String,
    consumer_tag: String,
}

impl Subscription {
    /// Subscribe `queue` to messages on `exchange` routed with `binding_key`.
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        binding_key: impl Into<String>,
    ) -> Self {
        Subscription {
            exchange: exchange.into(),
            queue: queue.into(),
            binding_key: binding_key.into(),
            consumer_tag: String::new(),
        }
    }

    /// Consumer tag to register with. Empty lets the broker pick one.
    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    /// Declare the exchange, queue and binding, then start consuming.
    ///
    /// Messages are acknowledged as soon as they are delivered.
    pub async fn start(&self, channel: &Channel) -> Result<Deliveries, BrokerError> {
        declare_exchange(channel, &self.exchange).await?;

        let queue = channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        otel_info!(
            name: "Subscription.Bind",
            queue = queue.name().as_str().to_string(),
            exchange = self.exchange.clone(),
            binding_key = self.binding_key.clone()
        );
        channel
            .queue_bind(
                queue.name().as_str(),
                &self.exchange,
                &self.binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(deliveries(consumer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::ContextCarrier;
    use lapin::types::LongString;
    use opentelemetry::trace::{SpanId, TraceContextExt, TraceId};

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn field_table_keeps_text_values() {
        let mut table = FieldTable::default();
        table.insert(
            "traceparent".into(),
            AMQPValue::LongString(LongString::from(TRACEPARENT)),
        );
        table.insert(
            "Baggage".into(),
            AMQPValue::ShortString(ShortString::from("producer=green")),
        );

        let headers = MessageHeaders::from(&table);

        assert_eq!(headers.get("traceparent"), Some(TRACEPARENT));
        assert_eq!(headers.get("baggage"), Some("producer=green"));
    }

    #[test]
    fn field_table_keys_fold_case() {
        let mut table = FieldTable::default();
        table.insert("X-Id".into(), AMQPValue::LongString(LongString::from("upper")));
        table.insert("x-id".into(), AMQPValue::LongString(LongString::from("lower")));

        let headers = MessageHeaders::from(&table);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-ID"), Some("lower"));
    }

    #[test]
    fn non_string_values_read_as_absent() {
        let mut table = FieldTable::default();
        table.insert("traceparent".into(), AMQPValue::LongLongInt(42));
        table.insert("tracestate".into(), AMQPValue::Boolean(true));
        table.insert(
            "baggage".into(),
            AMQPValue::FieldTable(FieldTable::default()),
        );

        let headers = MessageHeaders::from(&table);
        let cx = ContextCarrier::default().extract(&headers);

        assert!(headers.is_empty());
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn properties_round_trip_through_message() {
        let headers: MessageHeaders = [("traceparent", TRACEPARENT)].into_iter().collect();
        let message = Message::new("greens", "spinach")
            .with_headers(headers)
            .with_correlation_id("abc");

        let properties = message_properties(&message);
        let received = message_from_parts("greens", &properties, b"spinach".to_vec());

        assert_eq!(received, message);
        assert_eq!(
            properties.content_type().as_ref().map(|ct| ct.as_str()),
            Some(CONTENT_TYPE)
        );

        let cx = ContextCarrier::default().extract(&received.headers);
        let span = cx.span();
        assert_eq!(
            span.span_context().trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
        assert_eq!(
            span.span_context().span_id(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap()
        );
    }

    #[test]
    fn missing_properties_give_empty_message_headers() {
        let received = message_from_parts("fruit", &BasicProperties::default(), b"kiwi".to_vec());

        assert!(received.headers.is_empty());
        assert_eq!(received.correlation_id, None);
        assert_eq!(received.body_lossy(), "kiwi");
    }
}
