//! HTTP push delivery (WS-Notification consumers and plain webhooks).

use super::endpoint::{DeliveryEndpoint, DeliveryProvider, OutboundMessage, Transport};
use crate::error::{BrokerError, Result};
use crate::types::{DeliveryDefinition, Payload};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Plain HTTP callback delivery.
pub const HTTP_PUSH_IDENTIFIER: &str = "http-push";

/// WS-BaseNotification consumer delivery.
pub const WSN_CONSUMER_IDENTIFIER: &str = "http://docs.oasis-open.org/wsn/b-2/NotificationConsumer";

/// Creates [`PushDeliveryEndpoint`]s for http(s) callback locations.
pub struct PushDeliveryProvider {
    identifier: String,
    description: String,
    transport: Arc<dyn Transport>,
}

impl PushDeliveryProvider {
    pub fn new(identifier: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            identifier: identifier.into(),
            description: "HTTP POST to a consumer-supplied callback URL".to_string(),
            transport,
        }
    }

    /// Provider answering to [`HTTP_PUSH_IDENTIFIER`].
    pub fn http(transport: Arc<dyn Transport>) -> Self {
        Self::new(HTTP_PUSH_IDENTIFIER, transport)
    }

    /// Provider answering to [`WSN_CONSUMER_IDENTIFIER`].
    pub fn wsn(transport: Arc<dyn Transport>) -> Self {
        let mut provider = Self::new(WSN_CONSUMER_IDENTIFIER, transport);
        provider.description =
            "WS-BaseNotification consumer receiving raw or Notify-wrapped messages".to_string();
        provider
    }
}

impl DeliveryProvider for PushDeliveryProvider {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn create_endpoint(&self, definition: &DeliveryDefinition) -> Result<Arc<dyn DeliveryEndpoint>> {
        let target = Url::parse(definition.location.trim()).map_err(|e| {
            BrokerError::UnsupportedDeliveryDefinition(format!(
                "Illegal URL provided '{}': {}",
                definition.location, e
            ))
        })?;

        if !matches!(target.scheme(), "http" | "https") {
            return Err(BrokerError::UnsupportedDeliveryDefinition(format!(
                "Push delivery requires an http(s) URL, got '{}'",
                definition.location
            )));
        }

        debug!(target = %target, "Created push endpoint");

        Ok(Arc::new(PushDeliveryEndpoint {
            target,
            transport: Arc::clone(&self.transport),
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// POSTs each payload to one URL.
pub struct PushDeliveryEndpoint {
    target: Url,
    transport: Arc<dyn Transport>,
    destroyed: AtomicBool,
}

impl DeliveryEndpoint for PushDeliveryEndpoint {
    fn deliver(&self, payload: &Payload, raw: bool) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(BrokerError::EndpointDestroyed(self.target.to_string()));
        }

        debug!(target = %self.target, raw, "Delivering payload");

        self.transport.send(OutboundMessage {
            address: self.target.to_string(),
            subject: None,
            content_type: payload.content_type(raw).to_string(),
            body: payload.body(raw),
        })
    }

    fn effective_location(&self) -> String {
        self.target.to_string()
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}
