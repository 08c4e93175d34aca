//! The message envelope carried along edges.
//!
//! A [`Message`] pairs a type-erased, cheaply cloneable payload with a kind
//! (data, control, or error) and a set of headers. Messages are immutable
//! once enqueued; header enrichment yields a new instance.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Type-erased, shareable message payload.
///
/// Payloads are reference-counted so that fan-out and coalescing never copy
/// user data.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Classifies the delivery semantics of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Ordinary payload-bearing traffic.
    Data,
    /// Control-plane traffic (shutdown, reconfiguration), eligible for
    /// preferential scheduling on control-band edges.
    Control,
    /// An error report travelling through the graph as data.
    Error,
}

/// Well-known and user-defined message headers.
///
/// Every message carries a non-empty trace id and a positive wall-clock
/// timestamp (seconds); arbitrary string pairs ride along in `extra`.
#[derive(Clone, Debug, PartialEq)]
pub struct Headers {
    trace_id: String,
    timestamp: f64,
    extra: BTreeMap<String, String>,
}

impl Headers {
    /// Creates headers with a fresh trace id and the current time.
    pub fn generate() -> Self {
        Headers {
            trace_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_seconds(),
            extra: BTreeMap::new(),
        }
    }

    /// Creates headers from explicit parts.
    ///
    /// Fails with [`RuntimeError::InvalidArgument`] when the trace id is
    /// empty or the timestamp is not a positive finite number.
    pub fn new(trace_id: impl Into<String>, timestamp: f64) -> Result<Self, RuntimeError> {
        let trace_id = trace_id.into();
        if trace_id.is_empty() {
            return Err(RuntimeError::invalid("header trace_id must be non-empty"));
        }
        if !timestamp.is_finite() || timestamp <= 0.0 {
            return Err(RuntimeError::invalid(
                "header timestamp must be a positive number of seconds",
            ));
        }
        Ok(Headers {
            trace_id,
            timestamp,
            extra: BTreeMap::new(),
        })
    }

    /// The trace id, never empty.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Wall-clock creation time in seconds, always positive.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Looks up a user-defined header.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    /// Iterates over the user-defined headers in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extra.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Adds or replaces a user-defined header.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Merges `incoming` over `self`: the incoming trace id and timestamp
    /// win, incoming extras override same-keyed extras, everything else is
    /// preserved.
    fn merged(&self, incoming: &Headers) -> Headers {
        let mut extra = self.extra.clone();
        for (k, v) in &incoming.extra {
            extra.insert(k.clone(), v.clone());
        }
        Headers {
            trace_id: incoming.trace_id.clone(),
            timestamp: incoming.timestamp,
            extra,
        }
    }
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(f64::MIN_POSITIVE)
}

/// An immutable envelope travelling along edges.
#[derive(Clone)]
pub struct Message {
    kind: MessageKind,
    payload: Payload,
    payload_type: &'static str,
    headers: Headers,
}

impl Message {
    /// Creates a message, generating a trace id and timestamp.
    pub fn new<T: Any + Send + Sync>(kind: MessageKind, payload: T) -> Self {
        Message {
            kind,
            payload: Arc::new(payload),
            payload_type: std::any::type_name::<T>(),
            headers: Headers::generate(),
        }
    }

    /// Creates a message with caller-supplied headers.
    pub fn from_parts<T: Any + Send + Sync>(kind: MessageKind, payload: T, headers: Headers) -> Self {
        Message {
            kind,
            payload: Arc::new(payload),
            payload_type: std::any::type_name::<T>(),
            headers,
        }
    }

    /// Shorthand for a [`MessageKind::Data`] message.
    ///
    /// # Examples
    ///
    /// ```
    /// use meridian::Message;
    ///
    /// let msg = Message::data(42u64);
    /// assert!(msg.is_data());
    /// assert_eq!(msg.downcast_ref::<u64>(), Some(&42));
    /// assert!(!msg.headers().trace_id().is_empty());
    /// ```
    pub fn data<T: Any + Send + Sync>(payload: T) -> Self {
        Message::new(MessageKind::Data, payload)
    }

    /// Shorthand for a [`MessageKind::Control`] message.
    pub fn control<T: Any + Send + Sync>(payload: T) -> Self {
        Message::new(MessageKind::Control, payload)
    }

    /// Shorthand for a [`MessageKind::Error`] message.
    pub fn error<T: Any + Send + Sync>(payload: T) -> Self {
        Message::new(MessageKind::Error, payload)
    }

    /// The message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// True when the kind is [`MessageKind::Data`].
    pub fn is_data(&self) -> bool {
        self.kind == MessageKind::Data
    }

    /// True when the kind is [`MessageKind::Control`].
    pub fn is_control(&self) -> bool {
        self.kind == MessageKind::Control
    }

    /// True when the kind is [`MessageKind::Error`].
    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    /// The message headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Borrows the type-erased payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// A shared handle to the payload, for merge functions.
    pub fn payload_arc(&self) -> Payload {
        Arc::clone(&self.payload)
    }

    /// The concrete type name of the payload, for diagnostics.
    pub fn payload_type(&self) -> &'static str {
        self.payload_type
    }

    /// Downcasts the payload to a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Returns a new message with `incoming` merged over the current
    /// headers. Incoming values win; headers they do not mention are
    /// preserved. The original message is unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use meridian::{Headers, Message};
    ///
    /// let first = Message::data(1u32);
    /// let enriched = first.with_headers(
    ///     Headers::new("trace-7", 12.5).unwrap().with("tenant", "acme"),
    /// );
    /// assert_eq!(enriched.headers().trace_id(), "trace-7");
    /// assert_eq!(enriched.headers().get("tenant"), Some("acme"));
    /// // The original keeps its generated headers.
    /// assert_ne!(first.headers().trace_id(), "trace-7");
    /// ```
    pub fn with_headers(&self, incoming: Headers) -> Message {
        Message {
            kind: self.kind,
            payload: Arc::clone(&self.payload),
            payload_type: self.payload_type,
            headers: self.headers.merged(&incoming),
        }
    }

    /// Returns a new message with one user-defined header added.
    pub fn with_header(&self, key: impl Into<String>, value: impl Into<String>) -> Message {
        let mut headers = self.headers.clone();
        headers.extra.insert(key.into(), value.into());
        Message {
            kind: self.kind,
            payload: Arc::clone(&self.payload),
            payload_type: self.payload_type,
            headers,
        }
    }

    /// Rebuilds this message around a merged payload, keeping kind and
    /// headers. Used by coalescing edges.
    pub(crate) fn with_payload(&self, payload: Payload) -> Message {
        Message {
            kind: self.kind,
            payload,
            payload_type: self.payload_type,
            headers: self.headers.clone(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("payload", &self.payload_type)
            .field("trace_id", &self.headers.trace_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn generated_headers_are_well_formed() {
        let msg = Message::data("hello");
        assert!(!msg.headers().trace_id().is_empty());
        assert!(msg.headers().timestamp() > 0.0);
    }

    #[test]
    fn trace_ids_are_distinct() {
        let a = Message::data(1u8);
        let b = Message::data(1u8);
        assert_ne!(a.headers().trace_id(), b.headers().trace_id());
    }

    #[test]
    fn malformed_headers_rejected() {
        assert!(Headers::new("", 1.0).is_err());
        assert!(Headers::new("t", 0.0).is_err());
        assert!(Headers::new("t", f64::NAN).is_err());
        assert!(Headers::new("t", -3.0).is_err());
    }

    #[test]
    fn with_headers_merges_and_preserves() {
        let base = Message::data(0u8)
            .with_header("keep", "old")
            .with_header("shared", "old");
        let incoming = Headers::new("new-trace", 99.0).unwrap().with("shared", "new");
        let merged = base.with_headers(incoming);

        assert_eq!(merged.headers().trace_id(), "new-trace");
        assert_eq!(merged.headers().timestamp(), 99.0);
        assert_eq!(merged.headers().get("shared"), Some("new"));
        assert_eq!(merged.headers().get("keep"), Some("old"));
        // Original untouched.
        assert_eq!(base.headers().get("shared"), Some("old"));
    }

    #[test]
    fn kind_predicates() {
        assert!(Message::data(()).is_data());
        assert!(Message::control(()).is_control());
        assert!(Message::error(()).is_error());
    }
}
