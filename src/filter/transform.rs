//! Raw message canonicalization.

use crate::error::{BrokerError, Result};
use crate::types::{CanonicalEvent, Clock, RawMessage, SystemClock};
use std::sync::Arc;

/// Turns transport message bodies into [`CanonicalEvent`]s.
pub trait EventTransformer: Send + Sync {
    fn supports_input(&self, raw: &RawMessage) -> bool;

    /// Fails with `Transformation` when the input cannot be canonicalized.
    fn transform(&self, raw: RawMessage) -> Result<CanonicalEvent>;
}

/// Accepts text, UTF-8 bytes and JSON documents.
///
/// Text that parses as a JSON object or array also gets a structured form.
pub struct DefaultTransformer {
    clock: Arc<dyn Clock>,
}

impl DefaultTransformer {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn parse_document(text: &str) -> Option<serde_json::Value> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            serde_json::from_str(trimmed).ok()
        } else {
            None
        }
    }
}

impl Default for DefaultTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTransformer for DefaultTransformer {
    fn supports_input(&self, raw: &RawMessage) -> bool {
        match raw {
            RawMessage::Text(_) | RawMessage::Document(_) => true,
            RawMessage::Bytes(bytes) => std::str::from_utf8(bytes).is_ok(),
        }
    }

    fn transform(&self, raw: RawMessage) -> Result<CanonicalEvent> {
        let (text, document) = match &raw {
            RawMessage::Text(text) => (text.clone(), Self::parse_document(text)),
            RawMessage::Document(value) => (value.to_string(), Some(value.clone())),
            RawMessage::Bytes(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| BrokerError::Transformation(e.to_string()))?;
                (text.to_string(), Self::parse_document(text))
            }
        };

        Ok(CanonicalEvent {
            original: raw,
            text,
            document,
            received: self.clock.now(),
        })
    }
}
