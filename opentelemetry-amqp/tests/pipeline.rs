use std::sync::{Arc, Mutex};

use opentelemetry::baggage::BaggageExt;
use opentelemetry::trace::{
    SpanId, SpanKind, Status, TraceContextExt, Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_amqp::{
    BrokerChannel, ConsumerLoop, ContextCarrier, Error, HandlerError, InMemoryBroker, Message,
    Publisher,
};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracer, SdkTracerProvider, SpanData};

struct Pipeline {
    broker: InMemoryBroker,
    exporter: InMemorySpanExporter,
    provider: SdkTracerProvider,
}

impl Pipeline {
    fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        Pipeline {
            broker: InMemoryBroker::new(),
            exporter,
            provider,
        }
    }

    fn publisher(&self) -> Publisher<SdkTracer> {
        Publisher::builder(Arc::new(self.broker.clone()), self.provider.tracer("producer"))
            .with_exchange("food")
            .with_correlation_id("abc")
            .build()
    }

    fn spans(&self) -> Vec<SpanData> {
        self.exporter.get_finished_spans().unwrap()
    }

    fn span(&self, kind: SpanKind) -> SpanData {
        self.spans()
            .into_iter()
            .find(|span| span.span_kind == kind)
            .unwrap()
    }
}

#[tokio::test]
async fn consumer_span_continues_publish_span() {
    let pipeline = Pipeline::new();
    let deliveries = pipeline.broker.subscribe();
    let consumer = ConsumerLoop::builder(pipeline.provider.tracer("consumer_veggies"))
        .with_span_name("Vegetables")
        .with_event_name("green veggie")
        .with_attributes([KeyValue::new("Green", "Grass")])
        .build();

    pipeline
        .publisher()
        .publish(&Context::new(), "greens", "spinach")
        .await
        .unwrap();
    pipeline.broker.close();

    assert_eq!(consumer.run(deliveries).await, 1);

    let producer = pipeline.span(SpanKind::Producer);
    let consumer = pipeline.span(SpanKind::Consumer);
    assert_eq!(producer.parent_span_id, SpanId::INVALID);
    assert_eq!(
        consumer.span_context.trace_id(),
        producer.span_context.trace_id()
    );
    assert_eq!(consumer.parent_span_id, producer.span_context.span_id());
    assert_eq!(consumer.name, "Vegetables");
    assert!(consumer
        .attributes
        .contains(&KeyValue::new("Green", "Grass")));
    assert_eq!(consumer.events.len(), 1);
    assert_eq!(consumer.events[0].name, "green veggie");
    assert!(consumer.events[0]
        .attributes
        .contains(&KeyValue::new("message", "spinach")));
}

#[tokio::test]
async fn trace_spans_three_hops() {
    let pipeline = Pipeline::new();
    let deliveries = pipeline.broker.subscribe();

    let ingress = pipeline
        .provider
        .tracer("ingress")
        .start_with_context("event received", &Context::new());
    let ingress_cx = Context::new()
        .with_span(ingress)
        .with_baggage(vec![KeyValue::new("producer", "fruit")]);
    let ingress_span_id = ingress_cx.span().span_context().span_id();

    let seen_baggage = Arc::new(Mutex::new(None));
    let seen = seen_baggage.clone();
    let consumer = ConsumerLoop::builder(pipeline.provider.tracer("consumer"))
        .with_handler(move |cx: &Context, _message: &Message| -> Result<(), HandlerError> {
            *seen.lock().unwrap() = cx.baggage().get("producer").map(|v| v.to_string());
            Ok(())
        })
        .build();

    pipeline
        .publisher()
        .publish(&ingress_cx, "fruit", "kiwi")
        .await
        .unwrap();
    ingress_cx.span().end();
    pipeline.broker.close();
    consumer.run(deliveries).await;

    let spans = pipeline.spans();
    let producer = pipeline.span(SpanKind::Producer);
    let received = pipeline.span(SpanKind::Consumer);
    assert_eq!(spans.len(), 3);
    assert_eq!(producer.parent_span_id, ingress_span_id);
    assert_eq!(received.parent_span_id, producer.span_context.span_id());
    assert!(spans
        .iter()
        .all(|span| span.span_context.trace_id() == producer.span_context.trace_id()));
    assert_eq!(*seen_baggage.lock().unwrap(), Some("fruit".to_string()));
}

#[tokio::test]
async fn concurrent_publishes_stay_isolated() {
    let pipeline = Pipeline::new();
    let publisher = pipeline.publisher();
    let tracer = pipeline.provider.tracer("ingress");

    let first_cx = Context::new().with_span(tracer.start_with_context("first", &Context::new()));
    let second_cx = Context::new().with_span(tracer.start_with_context("second", &Context::new()));

    let (first, second) = tokio::join!(
        publisher.publish(&first_cx, "fruit", "apple"),
        publisher.publish(&second_cx, "greens", "kale"),
    );
    first.unwrap();
    second.unwrap();

    let carrier = ContextCarrier::default();
    let published = pipeline.broker.published();
    assert_eq!(published.len(), 2);
    for (_, message) in published {
        let expected = if message.routing_key == "fruit" {
            &first_cx
        } else {
            &second_cx
        };
        let extracted = carrier.extract(&message.headers);
        assert_eq!(
            extracted.span().span_context().trace_id(),
            expected.span().span_context().trace_id()
        );
        assert_ne!(
            extracted.span().span_context().span_id(),
            expected.span().span_context().span_id()
        );
    }
}

#[tokio::test]
async fn unreachable_broker_fails_publish_and_delivers_nothing() {
    let pipeline = Pipeline::new();
    let deliveries = pipeline.broker.subscribe();
    pipeline.broker.set_failing(true);

    let result = pipeline
        .publisher()
        .publish(&Context::new(), "greens", "spinach")
        .await;

    assert!(matches!(
        result,
        Err(Error::Publish { ref routing_key, .. }) if routing_key == "greens"
    ));
    let producer = pipeline.span(SpanKind::Producer);
    assert!(matches!(producer.status, Status::Error { .. }));

    pipeline.broker.close();
    let consumer = ConsumerLoop::builder(pipeline.provider.tracer("consumer")).build();
    assert_eq!(consumer.run(deliveries).await, 0);
    assert!(pipeline
        .spans()
        .iter()
        .all(|span| span.span_kind != SpanKind::Consumer));
}

#[tokio::test]
async fn message_without_headers_starts_new_trace() {
    let pipeline = Pipeline::new();
    let deliveries = pipeline.broker.subscribe();

    // Sent straight to the broker, with no publish span.
    pipeline
        .broker
        .publish("food", &Message::new("greens", "lettuce"))
        .await
        .unwrap();
    pipeline.broker.close();

    let consumer = ConsumerLoop::builder(pipeline.provider.tracer("consumer")).build();
    assert_eq!(consumer.run(deliveries).await, 1);

    let span = pipeline.span(SpanKind::Consumer);
    assert_eq!(span.parent_span_id, SpanId::INVALID);
    assert!(span.span_context.is_valid());
}
