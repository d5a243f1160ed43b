//! AMQP topic delivery.

use super::endpoint::{
    DeliveryEndpoint, DeliveryProvider, OutboundMessage, RandomSource, ThreadRngSource, Transport,
};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::types::{DeliveryDefinition, Payload};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Delivery-definition identifier served by [`AmqpDeliveryProvider`].
pub const AMQP_IDENTIFIER: &str = "amqp";

/// Parameter selecting the message subject.
pub const SUBJECT_PARAMETER: &str = "amqp.subject";

const DEFAULT_SUBJECT: &str = "herald";

const SCHEMES: &[&str] = &["amqp", "amqps", "topic", "queue"];

/// Compute the publish address for a delivery location.
///
/// - no path after the host: `{location}/{base}.{publication}.{suffix}`
/// - path ending in `/`: `{location}{base}.{publication}.{suffix}`
/// - any other path is kept as is
///
/// A location without a scheme gets `amqp://`; an empty one falls back to
/// `default_broker`. `suffix` is only consulted when a topic is synthesized.
pub fn normalize_address(
    location: &str,
    default_broker: &str,
    base_prefix: &str,
    publication_id: &str,
    suffix: impl FnOnce() -> String,
) -> Result<String> {
    let location = match location.trim() {
        "" => default_broker.trim(),
        l => l,
    };

    let (scheme, rest) = match location.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("amqp", location),
    };

    if !SCHEMES.contains(&scheme) {
        return Err(unsupported(location, "unknown scheme"));
    }

    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() || rest.chars().any(char::is_whitespace) {
        return Err(unsupported(location, "missing or malformed host"));
    }

    let address = if !rest.contains('/') {
        format!(
            "{}://{}/{}.{}.{}",
            scheme,
            rest,
            base_prefix,
            publication_id,
            suffix()
        )
    } else if rest.ends_with('/') {
        format!(
            "{}://{}{}.{}.{}",
            scheme,
            rest,
            base_prefix,
            publication_id,
            suffix()
        )
    } else {
        format!("{}://{}", scheme, rest)
    };

    url::Url::parse(&address).map_err(|e| unsupported(&address, &e.to_string()))?;

    Ok(address)
}

fn unsupported(location: &str, reason: &str) -> BrokerError {
    BrokerError::UnsupportedDeliveryDefinition(format!(
        "Invalid AMQP location '{}': {}",
        location, reason
    ))
}

/// Creates [`AmqpDeliveryEndpoint`]s publishing through a shared transport.
pub struct AmqpDeliveryProvider {
    transport: Arc<dyn Transport>,
    random: Arc<dyn RandomSource>,
    base_prefix: String,
    default_broker: String,
}

impl AmqpDeliveryProvider {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            random: Arc::new(ThreadRngSource),
            base_prefix: "herald".to_string(),
            default_broker: "localhost".to_string(),
        }
    }

    /// Provider using the AMQP naming settings of `config`.
    pub fn from_config(transport: Arc<dyn Transport>, config: &BrokerConfig) -> Self {
        Self::new(transport)
            .with_base_prefix(config.amqp_base_prefix.clone())
            .with_default_broker(config.amqp_default_broker.clone())
    }

    pub fn with_random_source(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_base_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.base_prefix = prefix.into();
        self
    }

    pub fn with_default_broker(mut self, broker: impl Into<String>) -> Self {
        self.default_broker = broker.into();
        self
    }
}

impl DeliveryProvider for AmqpDeliveryProvider {
    fn identifier(&self) -> &str {
        AMQP_IDENTIFIER
    }

    fn description(&self) -> &str {
        "Advanced Message Queuing Protocol 1.0"
    }

    fn create_endpoint(&self, definition: &DeliveryDefinition) -> Result<Arc<dyn DeliveryEndpoint>> {
        let address = normalize_address(
            &definition.location,
            &self.default_broker,
            &self.base_prefix,
            &definition.publication_id,
            || self.random.suffix(),
        )?;

        let subject = definition
            .parameter(SUBJECT_PARAMETER)
            .unwrap_or(DEFAULT_SUBJECT)
            .to_string();

        debug!(%address, %subject, "Created AMQP endpoint");

        Ok(Arc::new(AmqpDeliveryEndpoint {
            address,
            subject,
            transport: Arc::clone(&self.transport),
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// Publishes to one AMQP address.
pub struct AmqpDeliveryEndpoint {
    address: String,
    subject: String,
    transport: Arc<dyn Transport>,
    destroyed: AtomicBool,
}

impl DeliveryEndpoint for AmqpDeliveryEndpoint {
    fn deliver(&self, payload: &Payload, raw: bool) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(BrokerError::EndpointDestroyed(self.address.clone()));
        }

        self.transport.send(OutboundMessage {
            address: self.address.clone(),
            subject: Some(self.subject.clone()),
            content_type: payload.content_type(raw).to_string(),
            body: payload.body(raw),
        })
    }

    fn effective_location(&self) -> String {
        self.address.clone()
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            debug!(address = %self.address, "Destroyed AMQP endpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanonicalEvent, DeliveryParameter, RawMessage, Timestamp};
    use parking_lot::Mutex;
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl Transport for RecordingTransport {
        fn send(&self, message: OutboundMessage) -> Result<()> {
            self.sent.lock().push(message);
            Ok(())
        }
    }

    struct FixedSuffix(&'static str);

    impl RandomSource for FixedSuffix {
        fn suffix(&self) -> String {
            self.0.to_string()
        }
    }

    fn provider(transport: Arc<RecordingTransport>) -> AmqpDeliveryProvider {
        AmqpDeliveryProvider::new(transport).with_random_source(Arc::new(FixedSuffix("abcd1234")))
    }

    fn normalize(location: &str) -> Result<String> {
        normalize_address(location, "localhost", "herald", "pubId", || "r4nd".to_string())
    }

    #[test]
    fn test_synthesizes_topic_without_path() {
        assert_eq!(
            normalize("localhost").unwrap(),
            "amqp://localhost/herald.pubId.r4nd"
        );
        assert_eq!(
            normalize("amqp://broker:5672").unwrap(),
            "amqp://broker:5672/herald.pubId.r4nd"
        );
    }

    #[test]
    fn test_appends_topic_to_trailing_slash() {
        assert_eq!(
            normalize("topic://broker/exchange/").unwrap(),
            "topic://broker/exchange/herald.pubId.r4nd"
        );
    }

    #[test]
    fn test_keeps_explicit_path() {
        assert_eq!(
            normalize("remote-host/trying-to-path").unwrap(),
            "amqp://remote-host/trying-to-path"
        );
        assert_eq!(
            normalize("queue://defaulthost/q1").unwrap(),
            "queue://defaulthost/q1"
        );
    }

    #[test]
    fn test_empty_location_uses_default_broker() {
        assert_eq!(normalize("  ").unwrap(), "amqp://localhost/herald.pubId.r4nd");
    }

    #[test]
    fn test_config_naming() {
        let config = BrokerConfig {
            amqp_base_prefix: "events".to_string(),
            amqp_default_broker: "mq.internal".to_string(),
            ..Default::default()
        };
        let endpoint = AmqpDeliveryProvider::from_config(Arc::new(RecordingTransport::default()), &config)
            .with_random_source(Arc::new(FixedSuffix("0f0f")))
            .create_endpoint(&DeliveryDefinition::new(AMQP_IDENTIFIER, "", "p1"))
            .unwrap();

        assert_eq!(endpoint.effective_location(), "amqp://mq.internal/events.p1.0f0f");
    }

    #[test]
    fn test_rejects_malformed_locations() {
        assert!(matches!(
            normalize("http://web/x"),
            Err(BrokerError::UnsupportedDeliveryDefinition(_))
        ));
        assert!(normalize("amqp:///path").is_err());
        assert!(normalize("bad host/x").is_err());
    }

    #[test]
    fn test_suffix_only_drawn_when_needed() {
        let address = normalize_address("broker/fixed", "localhost", "herald", "p", || {
            panic!("suffix should not be drawn")
        })
        .unwrap();
        assert_eq!(address, "amqp://broker/fixed");
    }

    #[test]
    fn test_endpoint_publishes_with_subject() {
        let transport = Arc::new(RecordingTransport::default());
        let def = DeliveryDefinition::new(AMQP_IDENTIFIER, "broker", "weather")
            .with_parameter(DeliveryParameter::new("urn:herald", SUBJECT_PARAMETER, "alerts"));
        let endpoint = provider(Arc::clone(&transport)).create_endpoint(&def).unwrap();

        assert_eq!(
            endpoint.effective_location(),
            "amqp://broker/herald.weather.abcd1234"
        );

        let event = CanonicalEvent {
            original: RawMessage::Text("storm".into()),
            text: "storm".into(),
            document: None,
            received: Timestamp::from_secs(1),
        };
        endpoint.deliver(&Payload::from_event(&event), false).unwrap();

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject.as_deref(), Some("alerts"));
        assert_eq!(sent[0].body, b"storm".to_vec());
    }

    #[test]
    fn test_destroyed_endpoint_rejects_delivery() {
        let transport = Arc::new(RecordingTransport::default());
        let endpoint = provider(Arc::clone(&transport))
            .create_endpoint(&DeliveryDefinition::new(AMQP_IDENTIFIER, "broker", "p"))
            .unwrap();

        endpoint.destroy();
        endpoint.destroy();

        let event = CanonicalEvent {
            original: RawMessage::Text("x".into()),
            text: "x".into(),
            document: None,
            received: Timestamp::from_secs(1),
        };
        assert!(matches!(
            endpoint.deliver(&Payload::from_event(&event), true),
            Err(BrokerError::EndpointDestroyed(_))
        ));
        assert!(transport.sent.lock().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_normalization_is_deterministic(
            host in "[a-z][a-z0-9-]{0,12}",
            path in proptest::option::of("[a-z0-9]{1,8}"),
            trailing in any::<bool>(),
            suffix in "[0-9a-f]{8}",
        ) {
            let location = match (&path, trailing) {
                (Some(p), true) => format!("{}/{}/", host, p),
                (Some(p), false) => format!("{}/{}", host, p),
                (None, _) => host.clone(),
            };

            let first = normalize_address(&location, "localhost", "herald", "pub", || suffix.clone()).unwrap();
            let second = normalize_address(&location, "localhost", "herald", "pub", || suffix.clone()).unwrap();
            prop_assert_eq!(&first, &second);

            match (&path, trailing) {
                (Some(p), false) => prop_assert_eq!(first, format!("amqp://{}/{}", host, p)),
                _ => {
                    let expected = format!("herald.pub.{}", suffix);
                    prop_assert!(first.ends_with(&expected));
                }
            }
        }
    }
}
