//! # Publisher
//!
//! Wraps every send in a producer span and stamps the span's context onto the
//! outgoing message, so the consumer can continue the same trace.
use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use opentelemetry::otel_debug;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_semantic_conventions::attribute::{
    MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_BODY_SIZE, MESSAGING_MESSAGE_CONVERSATION_ID,
    MESSAGING_OPERATION_NAME, MESSAGING_OPERATION_TYPE, MESSAGING_RABBITMQ_DESTINATION_ROUTING_KEY,
    MESSAGING_SYSTEM,
};

use crate::broker::BrokerChannel;
use crate::carrier::ContextCarrier;
use crate::error::{Error, Result};
use crate::message::Message;

/// Value of `messaging.system` on every span this crate starts.
pub(crate) const MESSAGING_SYSTEM_NAME: &str = "rabbitmq";

const PUBLISH_OPERATION: &str = "publish";
const SENDING_EVENT: &str = "sending message";

/// Publishes messages with the current trace context attached.
///
/// The broker channel is shared: clone the `Arc` into as many publishers as
/// needed, or share one publisher between request handlers.
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use opentelemetry::{trace::TracerProvider as _, Context};
/// # use opentelemetry_amqp::{InMemoryBroker, Publisher};
/// # use opentelemetry_sdk::trace::SdkTracerProvider;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> opentelemetry_amqp::Result<()> {
/// let provider = SdkTracerProvider::builder().build();
/// let broker = InMemoryBroker::new();
/// let publisher = Publisher::builder(Arc::new(broker.clone()), provider.tracer("producer"))
///     .with_exchange("food")
///     .build();
///
/// publisher.publish(&Context::current(), "greens", "spinach").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Publisher<T> {
    channel: Arc<dyn BrokerChannel>,
    tracer: T,
    carrier: ContextCarrier,
    exchange: String,
    span_name: Cow<'static, str>,
    correlation_id: Option<String>,
}

impl<T> Publisher<T>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    /// Start building a publisher that sends through `channel`.
    pub fn builder(channel: Arc<dyn BrokerChannel>, tracer: T) -> PublisherBuilder<T> {
        PublisherBuilder {
            channel,
            tracer,
            carrier: None,
            exchange: String::new(),
            correlation_id: None,
        }
    }

    /// Exchange every message is sent to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish `body` under `routing_key`.
    ///
    /// A producer span is started as a child of `parent_cx`, which is usually
    /// the context of the request being served (`Context::current()` or one
    /// rebuilt from inbound headers). The span's context and any baggage in
    /// `parent_cx` are injected into the message headers. The span ends once
    /// the broker channel has answered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Publish`] if the broker channel reports a failure. The
    /// message is not retried or kept.
    pub async fn publish(
        &self,
        parent_cx: &Context,
        routing_key: &str,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        let body = body.into();
        let mut attributes = vec![
            KeyValue::new(MESSAGING_SYSTEM, MESSAGING_SYSTEM_NAME),
            KeyValue::new(MESSAGING_OPERATION_NAME, PUBLISH_OPERATION),
            KeyValue::new(MESSAGING_OPERATION_TYPE, "send"),
            KeyValue::new(MESSAGING_DESTINATION_NAME, self.exchange.clone()),
            KeyValue::new(
                MESSAGING_RABBITMQ_DESTINATION_ROUTING_KEY,
                routing_key.to_string(),
            ),
            KeyValue::new(MESSAGING_MESSAGE_BODY_SIZE, body.len() as i64),
        ];
        if let Some(correlation_id) = &self.correlation_id {
            attributes.push(KeyValue::new(
                MESSAGING_MESSAGE_CONVERSATION_ID,
                correlation_id.clone(),
            ));
        }

        let span = self
            .tracer
            .span_builder(self.span_name.clone())
            .with_kind(SpanKind::Producer)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, parent_cx);
        let cx = parent_cx.with_span(span);

        let message = Message {
            routing_key: routing_key.to_string(),
            body,
            headers: self.carrier.inject(&cx),
            correlation_id: self.correlation_id.clone(),
        };

        cx.span().add_event(
            SENDING_EVENT,
            vec![
                KeyValue::new("routing_key", message.routing_key.clone()),
                KeyValue::new("message", message.body_lossy()),
            ],
        );

        let result = self.channel.publish(&self.exchange, &message).await;
        let span = cx.span();
        match result {
            Ok(()) => {
                otel_debug!(
                    name: "Publisher.Sent",
                    exchange = self.exchange.clone(),
                    routing_key = message.routing_key.clone(),
                    body = message.body_lossy()
                );
                span.end();
                Ok(())
            }
            Err(source) => {
                otel_debug!(
                    name: "Publisher.SendFailed",
                    exchange = self.exchange.clone(),
                    routing_key = message.routing_key.clone(),
                    reason = source.to_string()
                );
                span.set_status(Status::error(source.to_string()));
                span.end();
                Err(Error::Publish {
                    routing_key: message.routing_key,
                    source,
                })
            }
        }
    }
}

/// Builder for [`Publisher`].
#[derive(Debug)]
pub struct PublisherBuilder<T> {
    channel: Arc<dyn BrokerChannel>,
    tracer: T,
    carrier: Option<ContextCarrier>,
    exchange: String,
    correlation_id: Option<String>,
}

impl<T> PublisherBuilder<T>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    /// Exchange to publish to. Defaults to the broker's default exchange (`""`).
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Carrier used to write the propagation headers.
    pub fn with_carrier(mut self, carrier: ContextCarrier) -> Self {
        self.carrier = Some(carrier);
        self
    }

    /// Correlation id stamped on every message.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Create the publisher.
    pub fn build(self) -> Publisher<T> {
        let span_name = if self.exchange.is_empty() {
            Cow::Borrowed(PUBLISH_OPERATION)
        } else {
            Cow::Owned(format!("{} {}", PUBLISH_OPERATION, self.exchange))
        };
        Publisher {
            channel: self.channel,
            tracer: self.tracer,
            carrier: self.carrier.unwrap_or_default(),
            exchange: self.exchange,
            span_name,
            correlation_id: self.correlation_id,
        }
    }
}
