use bytes::Bytes;

use crate::carrier::MessageHeaders;

/// A message in transit between a [`Publisher`] and a [`ConsumerLoop`].
///
/// The body is opaque. The headers hold propagation data only; they are never
/// treated as part of the payload.
///
/// [`Publisher`]: crate::Publisher
/// [`ConsumerLoop`]: crate::ConsumerLoop
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// Category that selects the delivery path on the exchange.
    pub routing_key: String,
    /// Opaque payload.
    pub body: Bytes,
    /// Propagation headers.
    pub headers: MessageHeaders,
    /// Request correlation token set by the producer, unrelated to tracing.
    pub correlation_id: Option<String>,
}

impl Message {
    /// Create a message without headers or correlation id.
    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Message {
            routing_key: routing_key.into(),
            body: body.into(),
            headers: MessageHeaders::new(),
            correlation_id: None,
        }
    }

    /// Replace the headers.
    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_message() {
        let headers: MessageHeaders = [("traceparent", "x")].into_iter().collect();
        let message = Message::new("greens", "spinach")
            .with_headers(headers.clone())
            .with_correlation_id("abc");

        assert_eq!(message.routing_key, "greens");
        assert_eq!(message.body, Bytes::from_static(b"spinach"));
        assert_eq!(message.headers, headers);
        assert_eq!(message.correlation_id.as_deref(), Some("abc"));
    }

    #[test]
    fn body_lossy_replaces_invalid_utf8() {
        let message = Message::new("fruit", vec![b'k', b'i', 0xff, b'w', b'i']);

        assert_eq!(message.body_lossy(), "ki\u{fffd}wi");
    }
}
