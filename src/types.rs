//! Core value types shared by the broker components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis.saturating_mul(1_000))
    }

    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    pub fn as_millis(&self) -> i64 {
        self.0 / 1_000
    }

    /// This timestamp shifted forward by `d`.
    pub fn plus(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_micros() as i64))
    }

    /// This timestamp shifted backward by `d`.
    pub fn minus(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_sub(d.as_micros() as i64))
    }

    /// Time remaining from `now` until `self`, or `None` if `self` is not in the future.
    pub fn remaining_since(&self, now: Timestamp) -> Option<Duration> {
        let delta = self.0.saturating_sub(now.0);
        if delta > 0 {
            Some(Duration::from_micros(delta as u64))
        } else {
            None
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            micros: AtomicI64::new(start.0),
        }
    }

    pub fn set(&self, to: Timestamp) {
        self.micros.store(to.0, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.micros.load(Ordering::SeqCst))
    }
}

/// A transport-specific parameter attached to a delivery definition.
///
/// Parameters may nest, mirroring the element tree they were decoded from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryParameter {
    pub namespace: String,
    pub element_name: String,
    pub value: String,
    pub children: Vec<DeliveryParameter>,
}

impl DeliveryParameter {
    pub fn new(
        namespace: impl Into<String>,
        element_name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            element_name: element_name.into(),
            value: value.into(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: DeliveryParameter) -> Self {
        self.children.push(child);
        self
    }
}

/// Where and how matching events are delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryDefinition {
    /// Selects the delivery provider (exact, case-sensitive).
    pub identifier: String,

    /// Transport-specific address.
    pub location: String,

    pub publication_id: String,

    pub parameters: Vec<DeliveryParameter>,

    /// Deliver the original object instead of its serialized textual form.
    #[serde(default)]
    pub use_raw: bool,
}

impl DeliveryDefinition {
    pub fn new(
        identifier: impl Into<String>,
        location: impl Into<String>,
        publication_id: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            location: location.into(),
            publication_id: publication_id.into(),
            parameters: Vec::new(),
            use_raw: false,
        }
    }

    pub fn with_parameter(mut self, parameter: DeliveryParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_raw(mut self, use_raw: bool) -> Self {
        self.use_raw = use_raw;
        self
    }

    /// Value of the first top-level parameter with the given element name.
    pub fn parameter(&self, element_name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.element_name == element_name)
            .map(|p| p.value.as_str())
    }
}

/// Options supplied with a subscribe request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    pub publication_identifier: String,

    /// When the subscription ends (None = never).
    pub termination_time: Option<Timestamp>,

    pub filter_expression: Option<String>,

    pub filter_language_id: Option<String>,

    pub delivery_definition: Option<DeliveryDefinition>,

    pub delivery_parameters: HashMap<String, String>,

    pub content_type: Option<String>,
}

impl SubscribeOptions {
    pub fn new(publication_identifier: impl Into<String>) -> Self {
        Self {
            publication_identifier: publication_identifier.into(),
            termination_time: None,
            filter_expression: None,
            filter_language_id: None,
            delivery_definition: None,
            delivery_parameters: HashMap::new(),
            content_type: None,
        }
    }

    pub fn with_termination_time(mut self, at: Timestamp) -> Self {
        self.termination_time = Some(at);
        self
    }

    pub fn with_filter(mut self, expression: impl Into<String>, language: Option<&str>) -> Self {
        self.filter_expression = Some(expression.into());
        self.filter_language_id = language.map(str::to_string);
        self
    }

    pub fn with_delivery(mut self, definition: DeliveryDefinition) -> Self {
        self.delivery_definition = Some(definition);
        self
    }

    pub fn with_delivery_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.delivery_parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Message bodies accepted from transport listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum RawMessage {
    Text(String),
    Bytes(Vec<u8>),
    Document(serde_json::Value),
}

impl RawMessage {
    pub fn content_type(&self) -> &'static str {
        match self {
            RawMessage::Text(_) => "text/plain",
            RawMessage::Bytes(_) => "application/octet-stream",
            RawMessage::Document(_) => "application/json",
        }
    }

    /// The message in its original encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            RawMessage::Text(s) => s.as_bytes().to_vec(),
            RawMessage::Bytes(b) => b.clone(),
            RawMessage::Document(v) => v.to_string().into_bytes(),
        }
    }

    /// Textual form; non-UTF-8 bytes are replaced lossily.
    pub fn to_text(&self) -> String {
        match self {
            RawMessage::Text(s) => s.clone(),
            RawMessage::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            RawMessage::Document(v) => v.to_string(),
        }
    }
}

impl From<&str> for RawMessage {
    fn from(s: &str) -> Self {
        RawMessage::Text(s.to_string())
    }
}

impl From<String> for RawMessage {
    fn from(s: String) -> Self {
        RawMessage::Text(s)
    }
}

impl From<Vec<u8>> for RawMessage {
    fn from(b: Vec<u8>) -> Self {
        RawMessage::Bytes(b)
    }
}

impl From<serde_json::Value> for RawMessage {
    fn from(v: serde_json::Value) -> Self {
        RawMessage::Document(v)
    }
}

/// Transport-agnostic event evaluated by filter rules.
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalEvent {
    /// The message as received.
    pub original: RawMessage,

    /// Textual form used by text predicates.
    pub text: String,

    /// Structured form, when the message is (or parses as) a JSON document.
    pub document: Option<serde_json::Value>,

    pub received: Timestamp,
}

/// What a delivery endpoint is handed for one matching event.
#[derive(Clone, Debug, PartialEq)]
pub struct Payload {
    original: RawMessage,
    text: String,
}

impl Payload {
    pub fn from_event(event: &CanonicalEvent) -> Self {
        Self {
            original: event.original.clone(),
            text: event.text.clone(),
        }
    }

    pub fn original(&self) -> &RawMessage {
        &self.original
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Content type of the body produced by [`Payload::body`].
    pub fn content_type(&self, raw: bool) -> &'static str {
        if raw {
            self.original.content_type()
        } else {
            "text/plain"
        }
    }

    /// Raw selects the original object; otherwise the serialized text.
    pub fn body(&self, raw: bool) -> Vec<u8> {
        if raw {
            self.original.to_bytes()
        } else {
            self.text.as_bytes().to_vec()
        }
    }
}
