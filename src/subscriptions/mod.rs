//! Subscription lifecycle.
//!
//! The [`SubscriptionManager`] is the only writer of cross-component state:
//! - the [`SubscriptionStore`](crate::storage::SubscriptionStore) record
//! - the [`FilterEngine`](crate::filter::FilterEngine) rule
//! - the pending [`TerminationScheduler`](crate::termination::TerminationScheduler) job
//!
//! # Example
//!
//! ```ignore
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
//! let message = inbox.recv()?;
//!
//! manager.unsubscribe(&sub.id)?;
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{Subscription, SubscriptionRecord};
