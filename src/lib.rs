//! # Herald
//!
//! Core of a publish/subscribe notification broker: subscription lifecycle
//! management and event dispatch.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: a publication, an optional filter, a delivery
//!   endpoint and an optional termination time
//! - **Filter engine**: one compiled rule per active subscription, evaluated
//!   against every inbound event
//! - **Delivery providers**: turn a delivery definition into a
//!   transport-bound endpoint (AMQP, HTTP push, local queues)
//! - **Termination**: subscriptions expire at their termination time
//! - **Storage**: subscriptions persist in memory or one file per subscription
//!
//! ## Example
//!
//! ```ignore
//! use herald::*;
//!
//! let local = Arc::new(ChannelDeliveryProvider::default());
//! let inbox = local.open_queue("alerts");
//! let registry = Arc::new(DeliveryProviderRegistry::new().with_provider(local));
//!
//! let manager = SubscriptionManager::open(
//!     &BrokerConfig::default(),
//!     registry,
//!     Arc::new(RegexPredicateCompiler),
//!     Arc::new(DefaultTransformer::new()),
//! )?;
//!
//! let sub = manager.subscribe(
//!     SubscribeOptions::new("weather")
//!         .with_filter("storm", None)
//!         .with_delivery(DeliveryDefinition::new("local", "alerts", "weather")),
//! )?;
//!
//! manager.receive("storm warning".into());
//! manager.renew(&sub.id, Timestamp::now().plus(Duration::from_secs(3600)))?;
//! manager.unsubscribe(&sub.id)?;
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod storage;
pub mod subscriptions;
pub mod termination;
pub mod types;

// Re-exports
pub use config::{BrokerConfig, StorageConfig};
pub use delivery::{
    normalize_address, AmqpDeliveryEndpoint, AmqpDeliveryProvider, ChannelDeliveryProvider,
    DeliveredMessage, DeliveryEndpoint, DeliveryProvider, DeliveryProviderRegistry,
    DeliveryReceiver, DetachedEndpoint, OutboundMessage, PushDeliveryEndpoint,
    PushDeliveryProvider, RandomSource, ThreadRngSource, Transport, AMQP_IDENTIFIER,
    HTTP_PUSH_IDENTIFIER, LOCAL_IDENTIFIER, SUBJECT_PARAMETER, WSN_CONSUMER_IDENTIFIER,
};
pub use error::{BrokerError, Result};
pub use filter::{
    DefaultTransformer, EventTransformer, FilterEngine, MatchAll, Predicate, PredicateCompiler,
    RegexPredicateCompiler, Rule, REGEX_LANGUAGE,
};
pub use ingest::{CancellationToken, IngestPool, IngestStats};
pub use storage::{FileSubscriptionStore, MemorySubscriptionStore, SubscriptionStore};
pub use subscriptions::{Subscription, SubscriptionManager, SubscriptionRecord};
pub use termination::{Terminatable, TerminationScheduler};
pub use types::*;
