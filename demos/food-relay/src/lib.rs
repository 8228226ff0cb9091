//! Shared setup for the `food-producer` and `food-consumer` binaries.
//!
//! The producer accepts HTTP requests on `/fruits` and `/greens` and publishes
//! their bodies to the `food` exchange. The consumer binds a queue to the
//! `greens` routing key and records a span per message, continuing the trace
//! started by the HTTP request.

mod category;
pub mod config;
pub mod telemetry;

pub use category::Category;
