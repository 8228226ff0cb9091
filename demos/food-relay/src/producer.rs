use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use food_relay::config::ProducerConfig;
use food_relay::{telemetry, Category};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use lapin::options::ConfirmSelectOptions;
use lapin::{Connection, ConnectionProperties};
use opentelemetry::baggage::BaggageExt;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer, TracerProvider as _};
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_amqp::lapin::{declare_exchange, LapinChannel};
use opentelemetry_amqp::Publisher;
use opentelemetry_http::HeaderExtractor;
use opentelemetry_sdk::trace::SdkTracer;
use opentelemetry_semantic_conventions::trace::HTTP_RESPONSE_STATUS_CODE;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

struct AppState {
    tracer: SdkTracer,
    publisher: Publisher<SdkTracer>,
}

fn extract_context_from_request(req: &Request<Incoming>) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(req.headers())))
}

fn respond(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

async fn router(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let Some(category) = Category::from_path(req.uri().path()) else {
        return Ok(respond(StatusCode::NOT_FOUND, "not found\n"));
    };

    let parent_cx = extract_context_from_request(&req)
        .with_baggage(vec![KeyValue::new("producer", category.producer())]);
    let span = state
        .tracer
        .span_builder(category.span_name())
        .with_kind(SpanKind::Server)
        .with_attributes([KeyValue::new("type", category.span_type())])
        .start_with_context(&state.tracer, &parent_cx);
    let cx = parent_cx.with_span(span);

    let response = match req.into_body().collect().await {
        Ok(body) => {
            let body = body.to_bytes();
            match state
                .publisher
                .publish(&cx, category.routing_key(), body.clone())
                .await
            {
                Ok(()) => {
                    info!(
                        routing_key = category.routing_key(),
                        body = %String::from_utf8_lossy(&body),
                        "sent message"
                    );
                    respond(StatusCode::OK, "sent\n")
                }
                Err(err) => {
                    error!(error = %err, "publish failed");
                    cx.span().set_status(Status::error(err.to_string()));
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "publish failed\n")
                }
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to read request body");
            cx.span().set_status(Status::error(err.to_string()));
            respond(StatusCode::BAD_REQUEST, "unreadable body\n")
        }
    };

    cx.span().set_attribute(KeyValue::new(
        HTTP_RESPONSE_STATUS_CODE,
        i64::from(response.status().as_u16()),
    ));
    cx.span().end();
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ProducerConfig::parse();
    let provider = telemetry::init(&config.telemetry, "food-producer")?;

    let connection =
        Connection::connect(&config.broker.amqp_addr, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    declare_exchange(&channel, &config.broker.exchange).await?;

    let publisher = Publisher::builder(
        Arc::new(LapinChannel::new(channel)),
        provider.tracer("producer"),
    )
    .with_exchange(config.broker.exchange.clone())
    .with_correlation_id(config.correlation_id.clone())
    .build();
    let state = Arc::new(AppState {
        tracer: provider.tracer("producer"),
        publisher,
    });

    let listener = TcpListener::bind(config.listen).await?;
    info!(listen = %config.listen, exchange = %config.broker.exchange, "routes set up, starting server");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "failed to accept connection");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| router(state.clone(), req));
                    if let Err(err) = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        warn!(%peer, error = %err, "connection failed");
                    }
                });
            }
        }
    }

    connection.close(200, "producer shutting down").await?;
    telemetry::shutdown(provider)
}
