//! # Consumer loop
//!
//! Pulls messages off a delivery stream and processes each one under its own
//! consumer span. The span's parent is the context extracted from the
//! message headers, which links it to the producer's publish span. A message
//! without usable headers still gets a span; it just starts a new trace.
//!
//! Deliveries are acknowledged by the broker on receipt, so nothing here ever
//! asks for a redelivery. Processing failures are recorded on the span and
//! logged.
use std::borrow::Cow;
use std::fmt;
use std::future::Future;

use futures_util::{Stream, StreamExt};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{otel_debug, otel_info, otel_warn, Context, KeyValue};
use opentelemetry_semantic_conventions::attribute::{
    MESSAGING_MESSAGE_BODY_SIZE, MESSAGING_MESSAGE_CONVERSATION_ID, MESSAGING_OPERATION_NAME,
    MESSAGING_OPERATION_TYPE, MESSAGING_RABBITMQ_DESTINATION_ROUTING_KEY, MESSAGING_SYSTEM,
};

use crate::carrier::ContextCarrier;
use crate::error::BrokerError;
use crate::message::Message;
use crate::publisher::MESSAGING_SYSTEM_NAME;

const DEFAULT_SPAN_NAME: &str = "process";
const DEFAULT_EVENT_NAME: &str = "message received";

/// Error returned by a [`MessageHandler`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Processing step run for every delivered message.
///
/// `cx` holds the consumer span; handlers may add events or attributes to it
/// through [`TraceContextExt::span`]. An error marks the span as failed. The
/// message is not redelivered either way.
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    fn handle(&self, cx: &Context, message: &Message) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Context, &Message) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, cx: &Context, message: &Message) -> Result<(), HandlerError> {
        self(cx, message)
    }
}

/// Handler that only logs the message.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogHandler;

impl MessageHandler for LogHandler {
    fn handle(&self, _cx: &Context, message: &Message) -> Result<(), HandlerError> {
        otel_info!(
            name: "ConsumerLoop.MessageReceived",
            routing_key = message.routing_key.clone(),
            body = message.body_lossy()
        );
        Ok(())
    }
}

/// Receives messages and processes each one under a linked consumer span.
///
/// The loop has a single receiving state. It returns when the delivery stream
/// ends, which happens when the broker closes the channel, or when the stop
/// signal passed to [`ConsumerLoop::run_until`] fires.
pub struct ConsumerLoop<T, H = LogHandler> {
    tracer: T,
    carrier: ContextCarrier,
    handler: H,
    span_name: Cow<'static, str>,
    event_name: Cow<'static, str>,
    attributes: Vec<KeyValue>,
}

impl<T> ConsumerLoop<T>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    /// Start building a consumer loop that records spans with `tracer`.
    pub fn builder(tracer: T) -> ConsumerLoopBuilder<T> {
        ConsumerLoopBuilder {
            tracer,
            carrier: None,
            handler: LogHandler,
            span_name: Cow::Borrowed(DEFAULT_SPAN_NAME),
            event_name: Cow::Borrowed(DEFAULT_EVENT_NAME),
            attributes: Vec::new(),
        }
    }
}

impl<T, H> ConsumerLoop<T, H>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
    H: MessageHandler,
{
    /// Process messages until the delivery stream ends.
    ///
    /// Returns the number of messages processed.
    pub async fn run<S>(&self, deliveries: S) -> usize
    where
        S: Stream<Item = Result<Message, BrokerError>> + Unpin,
    {
        self.run_until(deliveries, std::future::pending()).await
    }

    /// Process messages until the delivery stream ends or `stop` completes.
    ///
    /// Errors reported by the stream are logged and skipped. Returns the
    /// number of messages processed.
    pub async fn run_until<S, F>(&self, mut deliveries: S, stop: F) -> usize
    where
        S: Stream<Item = Result<Message, BrokerError>> + Unpin,
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        let mut processed = 0;
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    otel_debug!(name: "ConsumerLoop.Stopped", processed = processed);
                    break;
                }
                delivery = deliveries.next() => match delivery {
                    Some(Ok(message)) => {
                        self.process(message);
                        processed += 1;
                    }
                    Some(Err(err)) => {
                        otel_warn!(name: "ConsumerLoop.DeliveryError", reason = err.to_string());
                    }
                    None => {
                        otel_debug!(name: "ConsumerLoop.ChannelClosed", processed = processed);
                        break;
                    }
                }
            }
        }
        processed
    }

    /// Process one message under a new consumer span.
    pub fn process(&self, message: Message) {
        let parent_cx = self.carrier.extract(&message.headers);

        let mut attributes = self.attributes.clone();
        attributes.extend([
            KeyValue::new(MESSAGING_SYSTEM, MESSAGING_SYSTEM_NAME),
            KeyValue::new(MESSAGING_OPERATION_NAME, "process"),
            KeyValue::new(MESSAGING_OPERATION_TYPE, "process"),
            KeyValue::new(
                MESSAGING_RABBITMQ_DESTINATION_ROUTING_KEY,
                message.routing_key.clone(),
            ),
            KeyValue::new(MESSAGING_MESSAGE_BODY_SIZE, message.body.len() as i64),
        ]);
        if let Some(correlation_id) = &message.correlation_id {
            attributes.push(KeyValue::new(
                MESSAGING_MESSAGE_CONVERSATION_ID,
                correlation_id.clone(),
            ));
        }

        let span = self
            .tracer
            .span_builder(self.span_name.clone())
            .with_kind(SpanKind::Consumer)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &parent_cx);
        let cx = parent_cx.with_span(span);
        let span = cx.span();
        span.add_event(
            self.event_name.clone(),
            vec![KeyValue::new("message", message.body_lossy())],
        );

        if let Err(err) = self.handler.handle(&cx, &message) {
            otel_warn!(
                name: "ConsumerLoop.HandlerFailed",
                routing_key = message.routing_key.clone(),
                reason = err.to_string()
            );
            span.set_status(Status::error(err.to_string()));
        }
        span.end();
    }
}

impl<T: fmt::Debug, H: fmt::Debug> fmt::Debug for ConsumerLoop<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerLoop")
            .field("tracer", &self.tracer)
            .field("carrier", &self.carrier)
            .field("handler", &self.handler)
            .field("span_name", &self.span_name)
            .field("event_name", &self.event_name)
            .finish()
    }
}

/// Builder for [`ConsumerLoop`].
#[derive(Debug)]
pub struct ConsumerLoopBuilder<T, H = LogHandler> {
    tracer: T,
    carrier: Option<ContextCarrier>,
    handler: H,
    span_name: Cow<'static, str>,
    event_name: Cow<'static, str>,
    attributes: Vec<KeyValue>,
}

impl<T, H> ConsumerLoopBuilder<T, H>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
    H: MessageHandler,
{
    /// Name of the span started for each message. Defaults to `process`.
    pub fn with_span_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.span_name = name.into();
        self
    }

    /// Name of the event that records the message body. Defaults to
    /// `message received`.
    pub fn with_event_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.event_name = name.into();
        self
    }

    /// Extra attributes set on every consumer span.
    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Carrier used to read the propagation headers.
    pub fn with_carrier(mut self, carrier: ContextCarrier) -> Self {
        self.carrier = Some(carrier);
        self
    }

    /// Replace the processing step. Defaults to [`LogHandler`].
    pub fn with_handler<H2: MessageHandler>(self, handler: H2) -> ConsumerLoopBuilder<T, H2> {
        ConsumerLoopBuilder {
            tracer: self.tracer,
            carrier: self.carrier,
            handler,
            span_name: self.span_name,
            event_name: self.event_name,
            attributes: self.attributes,
        }
    }

    /// Create the consumer loop.
    pub fn build(self) -> ConsumerLoop<T, H> {
        ConsumerLoop {
            tracer: self.tracer,
            carrier: self.carrier.unwrap_or_default(),
            handler: self.handler,
            span_name: self.span_name,
            event_name: self.event_name,
            attributes: self.attributes,
        }
    }
}
