//! Delivery endpoint and provider abstractions.

use crate::error::{BrokerError, Result};
use crate::types::{DeliveryDefinition, Payload};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// A transport-bound publish action owned by exactly one subscription.
pub trait DeliveryEndpoint: Send + Sync {
    /// Publish one payload. `raw` selects the original object over its
    /// serialized textual form.
    fn deliver(&self, payload: &Payload, raw: bool) -> Result<()>;

    /// The resolved transport address.
    fn effective_location(&self) -> String;

    /// Release transport resources. Must be idempotent.
    fn destroy(&self);
}

/// Builds endpoints for one delivery-definition identifier.
pub trait DeliveryProvider: Send + Sync {
    fn identifier(&self) -> &str;

    /// Human readable summary for capabilities listings.
    fn description(&self) -> &str {
        ""
    }

    /// Exact, case-sensitive identifier match.
    fn supports(&self, identifier: &str) -> bool {
        self.identifier() == identifier
    }

    fn create_endpoint(&self, definition: &DeliveryDefinition) -> Result<Arc<dyn DeliveryEndpoint>>;
}

/// A message handed to a transport client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub address: String,
    pub subject: Option<String>,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// The wire-level client a provider publishes through (AMQP sender, HTTP
/// client, ...). Implementations bound their own latency.
pub trait Transport: Send + Sync {
    fn send(&self, message: OutboundMessage) -> Result<()>;
}

/// Randomness used when synthesizing addresses.
pub trait RandomSource: Send + Sync {
    fn suffix(&self) -> String;
}

/// Eight hex characters from the thread-local RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRngSource;

impl RandomSource for ThreadRngSource {
    fn suffix(&self) -> String {
        hex::encode(rand::random::<[u8; 4]>())
    }
}

/// Resolves delivery-definition identifiers to providers.
#[derive(Default)]
pub struct DeliveryProviderRegistry {
    providers: RwLock<Vec<Arc<dyn DeliveryProvider>>>,
}

impl DeliveryProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider. Earlier registrations win on identifier clashes.
    pub fn register(&self, provider: Arc<dyn DeliveryProvider>) {
        debug!(identifier = provider.identifier(), "Registered delivery provider");
        self.providers.write().push(provider);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_provider(self, provider: Arc<dyn DeliveryProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Identifiers of all registered providers, in registration order.
    pub fn identifiers(&self) -> Vec<String> {
        self.providers
            .read()
            .iter()
            .map(|p| p.identifier().to_string())
            .collect()
    }

    pub fn resolve(&self, identifier: &str) -> Result<Arc<dyn DeliveryProvider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.supports(identifier))
            .cloned()
            .ok_or_else(|| {
                BrokerError::UnsupportedDeliveryDefinition(format!(
                    "No provider for the delivery definition is available: {}",
                    identifier
                ))
            })
    }

    /// Resolve the provider and build the endpoint. Every failure surfaces
    /// as `UnsupportedDeliveryDefinition`.
    pub fn create_endpoint(
        &self,
        definition: &DeliveryDefinition,
    ) -> Result<Arc<dyn DeliveryEndpoint>> {
        let provider = self.resolve(&definition.identifier)?;
        provider.create_endpoint(definition).map_err(|e| match e {
            BrokerError::UnsupportedDeliveryDefinition(_) => e,
            other => {
                warn!(identifier = %definition.identifier, error = %other, "Endpoint construction failed");
                BrokerError::UnsupportedDeliveryDefinition(other.to_string())
            }
        })
    }
}

/// Stand-in endpoint for a subscription read back from storage before it
/// has been re-activated. Only reports the persisted location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetachedEndpoint {
    location: String,
}

impl DetachedEndpoint {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

impl DeliveryEndpoint for DetachedEndpoint {
    fn deliver(&self, _payload: &Payload, _raw: bool) -> Result<()> {
        Err(BrokerError::Delivery(format!(
            "endpoint {} is not attached to a transport",
            self.location
        )))
    }

    fn effective_location(&self) -> String {
        self.location.clone()
    }

    fn destroy(&self) {}
}
