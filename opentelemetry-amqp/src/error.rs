//! Errors surfaced by the publish path.
//!
//! Only broker failures are errors. Missing or malformed propagation headers
//! are handled by falling back to an empty context, and processing failures on
//! the consumer side are recorded on the span rather than returned.
use thiserror::Error;

/// Failures reported by a [`BrokerChannel`].
///
/// [`BrokerChannel`]: crate::BrokerChannel
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokerError {
    /// The channel or its connection can no longer be used.
    #[error("broker channel is closed")]
    ChannelClosed,

    /// The broker refused the message.
    #[error("broker rejected the message: {0}")]
    Rejected(String),

    #[cfg(feature = "lapin")]
    #[cfg_attr(docsrs, doc(cfg(feature = "lapin")))]
    #[error(transparent)]
    /// Error returned by the AMQP client.
    Amqp(#[from] lapin::Error),

    #[error("{0}")]
    /// Other types of failures not covered by the variants above.
    Other(String),
}

/// Errors returned by [`Publisher::publish`].
///
/// A publish error is final for the caller: the message is neither retried
/// nor buffered.
///
/// [`Publisher::publish`]: crate::Publisher::publish
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The broker did not accept the message.
    #[error("failed to publish message with routing key `{routing_key}`")]
    Publish {
        /// Routing key of the message that was not delivered.
        routing_key: String,
        /// Reason reported by the broker channel.
        #[source]
        source: BrokerError,
    },
}

/// Result type of the publish path.
pub type Result<T> = std::result::Result<T, Error>;
