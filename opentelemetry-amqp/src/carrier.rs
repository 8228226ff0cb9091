//! # Context carrier
//!
//! Moves a [`Context`] in and out of the string headers attached to a
//! [`Message`]. The header names are fixed by the propagators in use; with the
//! default [`ContextCarrier`] they are the W3C `traceparent`, `tracestate` and
//! `baggage` keys.
//!
//! [`Message`]: crate::Message
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use opentelemetry::otel_debug;
use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};

/// String-only header map carried by every [`Message`].
///
/// Keys are stored lower-cased, so lookups are case insensitive. Two keys that
/// differ only in case are the same header here: inserting `X-Id` after
/// `x-id` replaces the earlier value. Values are always text; transports with
/// richer header types drop anything that is not a string when converting
/// into this map.
///
/// [`Message`]: crate::Message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageHeaders(BTreeMap<String, String>);

impl MessageHeaders {
    /// Create an empty header map.
    pub fn new() -> Self {
        MessageHeaders(BTreeMap::new())
    }

    /// Get the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_lowercase()).map(String::as_str)
    }

    /// Insert a value, returning the previous one stored under the same key.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.as_ref().to_lowercase(), value.into())
    }

    /// Returns `true` if no headers are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the headers in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }
}

impl Injector for MessageHeaders {
    /// Set a key and value in the headers.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key, value);
    }
}

impl Extractor for MessageHeaders {
    /// Get a value for a key from the headers.
    fn get(&self, key: &str) -> Option<&str> {
        MessageHeaders::get(self, key)
    }

    /// Collect all the keys from the headers.
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

impl<K, V> FromIterator<(K, V)> for MessageHeaders
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = MessageHeaders::new();
        for (key, value) in iter {
            headers.insert(key, value);
        }
        headers
    }
}

impl<'a> IntoIterator for &'a MessageHeaders {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Serializes a [`Context`] into [`MessageHeaders`] and back.
///
/// The default carrier writes the span context in [W3C TraceContext] format
/// and baggage in [W3C Baggage] format. Any other [`TextMapPropagator`] can be
/// supplied with [`ContextCarrier::new`]; the publisher and the consumer must
/// use the same one for the link to survive the broker.
///
/// [W3C TraceContext]: https://www.w3.org/TR/trace-context/
/// [W3C Baggage]: https://www.w3.org/TR/baggage/
#[derive(Clone)]
pub struct ContextCarrier {
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
}

impl ContextCarrier {
    /// Create a carrier backed by the given propagator.
    pub fn new<P>(propagator: P) -> Self
    where
        P: TextMapPropagator + Send + Sync + 'static,
    {
        ContextCarrier {
            propagator: Arc::new(propagator),
        }
    }

    /// Write the span context and baggage of `cx` into a fresh header map.
    ///
    /// Nothing is written for a context without a valid span, and the baggage
    /// header is omitted when the context carries no baggage.
    pub fn inject(&self, cx: &Context) -> MessageHeaders {
        let mut headers = MessageHeaders::new();
        self.propagator.inject_context(cx, &mut headers);
        headers
    }

    /// Rebuild a context from `headers`.
    ///
    /// Missing or malformed propagation headers are not an error: the parts
    /// that cannot be parsed are left unset, so a message from an
    /// uninstrumented producer yields an empty [`Context`].
    ///
    /// A `traceparent` that is not `version-traceid-spanid-flags` in
    /// lower-case hex of widths 2, 32, 16 and 2 is treated as absent. Baggage
    /// is still read from the same headers.
    pub fn extract(&self, headers: &MessageHeaders) -> Context {
        match headers.get(TRACEPARENT_HEADER) {
            Some(value) if !is_well_formed_traceparent(value) => {
                otel_debug!(
                    name: "ContextCarrier.MalformedTraceparent",
                    traceparent = value.to_string()
                );
                self.propagator.extract_with_context(
                    &Context::new(),
                    &WithoutHeader {
                        headers,
                        hidden: TRACEPARENT_HEADER,
                    },
                )
            }
            _ => self.propagator.extract_with_context(&Context::new(), headers),
        }
    }

    /// Header names this carrier reads and writes.
    pub fn fields(&self) -> impl Iterator<Item = &str> + '_ {
        self.propagator.fields()
    }
}

const TRACEPARENT_HEADER: &str = "traceparent";

fn is_lower_hex(field: &str, width: usize) -> bool {
    field.len() == width && field.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn is_well_formed_traceparent(value: &str) -> bool {
    let mut parts = value.trim().split('-');
    let (Some(version), Some(trace_id), Some(span_id), Some(flags)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    // Later versions may append fields; version 00 has exactly four.
    if version == "00" && parts.next().is_some() {
        return false;
    }
    is_lower_hex(version, 2)
        && is_lower_hex(trace_id, 32)
        && is_lower_hex(span_id, 16)
        && is_lower_hex(flags, 2)
}

/// Read view of [`MessageHeaders`] with one key hidden.
struct WithoutHeader<'a> {
    headers: &'a MessageHeaders,
    hidden: &'static str,
}

impl Extractor for WithoutHeader<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        if key.eq_ignore_ascii_case(self.hidden) {
            None
        } else {
            self.headers.get(key)
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers
            .0
            .keys()
            .map(String::as_str)
            .filter(|key| *key != self.hidden)
            .collect()
    }
}

impl Default for ContextCarrier {
    fn default() -> Self {
        ContextCarrier::new(TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]))
    }
}

impl fmt::Debug for ContextCarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextCarrier")
            .field("fields", &self.fields().collect::<Vec<_>>())
            .finish()
    }
}
