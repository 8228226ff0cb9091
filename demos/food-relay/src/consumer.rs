use anyhow::Result;
use clap::Parser;
use food_relay::config::ConsumerConfig;
use food_relay::telemetry;
use lapin::{Connection, ConnectionProperties};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_amqp::lapin::Subscription;
use opentelemetry_amqp::ConsumerLoop;
use tracing::{info, warn};

const TRACER_NAME: &str = "consumer_veggies";
const SPAN_NAME: &str = "Vegetables";
const EVENT_NAME: &str = "green veggie";

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C, running until the channel closes");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConsumerConfig::parse();
    let provider = telemetry::init(&config.telemetry, "food-consumer")?;

    let connection =
        Connection::connect(&config.broker.amqp_addr, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    let deliveries = Subscription::new(
        config.broker.exchange.clone(),
        config.queue.clone(),
        config.binding_key.clone(),
    )
    .with_consumer_tag(config.consumer_tag.clone())
    .start(&channel)
    .await?;
    info!(
        queue = %config.queue,
        binding_key = %config.binding_key,
        "waiting for messages, press Ctrl-C to exit"
    );

    let consumer = ConsumerLoop::builder(provider.tracer(TRACER_NAME))
        .with_span_name(SPAN_NAME)
        .with_event_name(EVENT_NAME)
        .with_attributes([KeyValue::new("Green", "Grass")])
        .build();
    let processed = consumer.run_until(deliveries, shutdown_signal()).await;
    info!(processed, "consumer stopped");

    connection.close(200, "consumer shutting down").await?;
    telemetry::shutdown(provider)
}
