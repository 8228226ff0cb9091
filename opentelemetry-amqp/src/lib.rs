//! Trace context propagation across an AMQP broker.
//!
//! A [`Publisher`] wraps each send in a producer span and writes that span's
//! context into the message headers. A [`ConsumerLoop`] reads the headers
//! back, so the consumer span becomes a child of the publish span even though
//! the two run in different processes.
//!
//! The [`ContextCarrier`] does the header work. By default it uses the W3C
//! TraceContext and Baggage formats, and any [`TextMapPropagator`] can stand
//! in for them.
//!
//! Broker access goes through the [`BrokerChannel`] trait and the
//! [`Deliveries`] stream. [`InMemoryBroker`] implements both in process memory;
//! the `lapin` feature (enabled by default) adds a RabbitMQ transport.
//!
//! [`TextMapPropagator`]: opentelemetry::propagation::TextMapPropagator
#![cfg_attr(docsrs, feature(doc_cfg))]

mod broker;
mod carrier;
mod consumer;
mod error;
mod message;
mod publisher;

#[cfg(feature = "lapin")]
#[cfg_attr(docsrs, doc(cfg(feature = "lapin")))]
pub mod lapin;

#[doc(no_inline)]
pub use bytes::Bytes;

pub use broker::{BrokerChannel, Deliveries, InMemoryBroker};
pub use carrier::{ContextCarrier, MessageHeaders};
pub use consumer::{ConsumerLoop, ConsumerLoopBuilder, HandlerError, LogHandler, MessageHandler};
pub use error::{BrokerError, Error, Result};
pub use message::Message;
pub use publisher::{Publisher, PublisherBuilder};
