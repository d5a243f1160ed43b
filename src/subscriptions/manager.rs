//! Subscription lifecycle orchestration.

use super::types::Subscription;
use crate::config::{BrokerConfig, StorageConfig};
use crate::delivery::{DeliveryEndpoint, DeliveryProviderRegistry};
use crate::error::{panic_message, BrokerError, Result};
use crate::filter::{EventTransformer, FilterEngine, PredicateCompiler};
use crate::storage::{FileSubscriptionStore, MemorySubscriptionStore, SubscriptionStore};
use crate::termination::{Terminatable, TerminationScheduler};
use crate::types::{Clock, RawMessage, SubscribeOptions, SystemClock, Timestamp};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Keeps the store, the filter engine and the termination scheduler in
/// agreement about which subscriptions are active.
///
/// Request-path operations (`subscribe`, `renew`, `unsubscribe`) and
/// scheduled expiry are serialized by a single manager lock. Event ingestion
/// via [`receive`](Self::receive) does not take it.
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn SubscriptionStore>,
    registry: Arc<DeliveryProviderRegistry>,
    engine: Arc<FilterEngine>,
    scheduler: TerminationScheduler,
    /// Serializes cross-component mutations.
    op_lock: Mutex<()>,
}

impl SubscriptionManager {
    /// Assemble a manager from explicitly constructed components.
    ///
    /// Records already in `store` stay dormant until [`restore`](Self::restore).
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        registry: Arc<DeliveryProviderRegistry>,
        engine: Arc<FilterEngine>,
        scheduler: TerminationScheduler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                engine,
                scheduler,
                op_lock: Mutex::new(()),
            }),
        }
    }

    /// Build the store, engine and scheduler described by `config`, then
    /// re-activate every persisted subscription.
    pub fn open(
        config: &BrokerConfig,
        registry: Arc<DeliveryProviderRegistry>,
        compiler: Arc<dyn PredicateCompiler>,
        transformer: Arc<dyn EventTransformer>,
    ) -> Result<Self> {
        Self::open_with_clock(config, registry, compiler, transformer, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        config: &BrokerConfig,
        registry: Arc<DeliveryProviderRegistry>,
        compiler: Arc<dyn PredicateCompiler>,
        transformer: Arc<dyn EventTransformer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store: Arc<dyn SubscriptionStore> = match &config.storage {
            StorageConfig::Memory => Arc::new(MemorySubscriptionStore::new()),
            StorageConfig::FileSystem { path } => {
                Arc::new(FileSubscriptionStore::open(path, config.store_cache_size)?)
            }
        };

        let engine = Arc::new(FilterEngine::new(compiler, transformer));
        let scheduler = TerminationScheduler::start(clock, config.scheduler_workers)?;

        let manager = Self::new(store, registry, engine, scheduler);
        let restored = manager.restore();
        info!(restored, storage = ?config.storage, "Subscription manager opened");

        Ok(manager)
    }

    /// Create a subscription and activate it in every component.
    ///
    /// Nothing is left behind on failure: endpoint resolution fails before
    /// any state changes, a failed store write destroys the endpoint, and a
    /// filter that does not compile rolls back the store write too. Fails
    /// with `SchedulerShutdown` after [`shutdown`](Self::shutdown).
    pub fn subscribe(&self, options: SubscribeOptions) -> Result<Subscription> {
        let definition = options.delivery_definition.as_ref().ok_or_else(|| {
            BrokerError::UnsupportedDeliveryDefinition("no delivery definition given".to_string())
        })?;
        let endpoint = self.inner.registry.create_endpoint(definition)?;

        let _guard = self.inner.op_lock.lock();

        if let Err(e) = self.inner.ensure_running() {
            let _ = destroy_endpoint("-", endpoint.as_ref());
            return Err(e);
        }

        let id = self.inner.generate_id();
        let subscription = Subscription::new(id, options, Arc::clone(&endpoint));

        if let Err(e) = self.inner.store.store_subscription(&subscription) {
            let _ = destroy_endpoint(&subscription.id, endpoint.as_ref());
            return Err(e);
        }

        if let Err(e) = self.inner.engine.register(&subscription, Arc::clone(&endpoint)) {
            warn!(subscription_id = %subscription.id, error = %e, "Rolling back subscription");
            if let Err(delete_err) = self.inner.store.delete_subscription(&subscription.id) {
                warn!(subscription_id = %subscription.id, error = %delete_err, "Rollback could not delete record");
            }
            let _ = destroy_endpoint(&subscription.id, endpoint.as_ref());
            return Err(e);
        }

        self.inner.schedule(&subscription);

        info!(
            subscription_id = %subscription.id,
            publication = %subscription.options.publication_identifier,
            location = %endpoint.effective_location(),
            "Subscribed"
        );
        Ok(subscription)
    }

    /// Move the termination time of `id` and reschedule its expiry. Fails
    /// with `SchedulerShutdown` after [`shutdown`](Self::shutdown).
    pub fn renew(&self, id: &str, termination_time: Timestamp) -> Result<Timestamp> {
        let _guard = self.inner.op_lock.lock();
        self.inner.ensure_running()?;

        let updated = self.inner.store.update_termination_time(id, termination_time)?;
        // Replaces the pending job in one step.
        self.inner.schedule(&updated);

        info!(subscription_id = %id, %termination_time, "Renewed");
        Ok(termination_time)
    }

    /// Remove `id` from every component.
    ///
    /// All four teardown steps run even if some fail; their errors are
    /// returned together as `Unsubscribe`.
    pub fn unsubscribe(&self, id: &str) -> Result<()> {
        let _guard = self.inner.op_lock.lock();

        let stored = self.inner.store.get_subscription(id);
        if stored.is_none() && !self.inner.engine.contains(id) {
            return Err(BrokerError::UnknownSubscription(id.to_string()));
        }

        let result = self.inner.teardown(id, stored);
        match &result {
            Ok(()) => info!(subscription_id = %id, "Unsubscribed"),
            Err(e) => warn!(subscription_id = %id, error = %e, "Unsubscribed with errors"),
        }
        result
    }

    /// The stored subscription, bound to its live endpoint when active.
    pub fn get_subscription(&self, id: &str) -> Option<Subscription> {
        self.inner
            .store
            .get_subscription(id)
            .map(|s| self.inner.attach_live_endpoint(s))
    }

    pub fn get_subscriptions(&self) -> Vec<Subscription> {
        self.inner
            .store
            .get_all_subscriptions()
            .into_iter()
            .map(|s| self.inner.attach_live_endpoint(s))
            .collect()
    }

    /// Route an inbound message to every matching subscription. Returns
    /// the number of successful deliveries.
    pub fn receive(&self, raw: RawMessage) -> usize {
        self.inner.engine.filter_message(raw)
    }

    pub fn engine(&self) -> &Arc<FilterEngine> {
        &self.inner.engine
    }

    pub fn registry(&self) -> &Arc<DeliveryProviderRegistry> {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &TerminationScheduler {
        &self.inner.scheduler
    }

    /// Re-activate every persisted subscription that is not active yet.
    ///
    /// Records that cannot be re-activated are deleted. Subscriptions whose
    /// termination time has passed expire right away. Returns the number
    /// re-activated.
    pub fn restore(&self) -> usize {
        let _guard = self.inner.op_lock.lock();

        let mut restored = 0;
        for subscription in self.inner.store.get_all_subscriptions() {
            if self.inner.engine.contains(&subscription.id) {
                continue;
            }

            match self.inner.activate(subscription.clone()) {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(subscription_id = %subscription.id, error = %e, "Dropping subscription that could not be restored");
                    if let Err(delete_err) = self.inner.store.delete_subscription(&subscription.id) {
                        warn!(subscription_id = %subscription.id, error = %delete_err, "Could not delete unrestorable record");
                    }
                }
            }
        }

        if restored > 0 {
            info!(restored, "Restored subscriptions");
        }
        restored
    }

    /// Stop expiring subscriptions and release every live endpoint.
    /// Store records are kept for the next [`restore`](Self::restore).
    pub fn shutdown(&self) {
        // Not under the manager lock: a running expiry may be waiting for it.
        self.inner.scheduler.shutdown();

        let _guard = self.inner.op_lock.lock();
        let rules = self.inner.engine.drain();
        for rule in &rules {
            let _ = destroy_endpoint(rule.subscription_id(), rule.endpoint().as_ref());
        }

        info!(released = rules.len(), "Subscription manager shut down");
    }
}

impl Inner {
    /// New or renewed subscriptions could never expire once the scheduler
    /// has stopped.
    fn ensure_running(&self) -> Result<()> {
        if self.scheduler.is_shut_down() {
            Err(BrokerError::SchedulerShutdown)
        } else {
            Ok(())
        }
    }

    /// A fresh v4 UUID not used by any stored or active subscription.
    fn generate_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if self.store.get_subscription(&id).is_none() && !self.engine.contains(&id) {
                return id;
            }
            debug!(%id, "Generated subscription id collided, retrying");
        }
    }

    /// Schedule expiry if `subscription` has a termination time. Never fails
    /// the caller.
    fn schedule(self: &Arc<Self>, subscription: &Subscription) {
        let Some(end_of_life) = subscription.termination_time() else {
            return;
        };

        let job = Arc::new(SubscriptionExpiry {
            id: subscription.id.clone(),
            end_of_life,
            manager: Arc::downgrade(self),
        });

        if let Err(e) = self.scheduler.schedule_termination(job) {
            warn!(subscription_id = %subscription.id, error = %e, "Could not schedule termination");
        }
    }

    /// Bind a dormant record to a new endpoint, register its rule and
    /// schedule its expiry. Called with the manager lock held.
    fn activate(self: &Arc<Self>, subscription: Subscription) -> Result<()> {
        let definition = subscription.options.delivery_definition.as_ref().ok_or_else(|| {
            BrokerError::UnsupportedDeliveryDefinition("no delivery definition stored".to_string())
        })?;
        let endpoint = self.registry.create_endpoint(definition)?;
        let live = Subscription::new(subscription.id, subscription.options, Arc::clone(&endpoint));

        if let Err(e) = self.engine.register(&live, Arc::clone(&endpoint)) {
            let _ = destroy_endpoint(&live.id, endpoint.as_ref());
            return Err(e);
        }

        if let Err(e) = self.store.store_subscription(&live) {
            let _ = self.engine.remove_subscription(&live.id);
            let _ = destroy_endpoint(&live.id, endpoint.as_ref());
            return Err(e);
        }

        self.schedule(&live);
        debug!(subscription_id = %live.id, location = %endpoint.effective_location(), "Restored subscription");
        Ok(())
    }

    /// Remove `id` everywhere, attempting every step. Called with the
    /// manager lock held.
    fn teardown(&self, id: &str, stored: Option<Subscription>) -> Result<()> {
        let mut errors = Vec::new();

        let endpoint = match self.engine.remove_subscription(id) {
            Ok(rule) => Some(Arc::clone(rule.endpoint())),
            Err(e) => {
                errors.push(e);
                stored.map(|s| s.endpoint)
            }
        };

        if let Some(endpoint) = endpoint {
            if let Err(e) = destroy_endpoint(id, endpoint.as_ref()) {
                errors.push(e);
            }
        }

        match self.scheduler.cancel_termination(id) {
            Ok(()) | Err(BrokerError::UnknownTerminatable(_)) => {}
            Err(e) => errors.push(e),
        }

        if let Err(e) = self.store.delete_subscription(id) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::Unsubscribe(errors))
        }
    }

    /// Scheduled expiry. Skipped when the subscription is gone or was
    /// renewed after this job was scheduled.
    fn expire(&self, id: &str, end_of_life: Timestamp) -> Result<()> {
        let _guard = self.op_lock.lock();

        let Some(stored) = self.store.get_subscription(id) else {
            debug!(subscription_id = %id, "Expired subscription already removed");
            return Ok(());
        };

        if stored.termination_time() != Some(end_of_life) {
            debug!(subscription_id = %id, %end_of_life, "Ignoring stale expiry");
            return Ok(());
        }

        self.teardown(id, Some(stored))?;
        info!(subscription_id = %id, %end_of_life, "Subscription expired");
        Ok(())
    }

    fn attach_live_endpoint(&self, subscription: Subscription) -> Subscription {
        match self.engine.endpoint(&subscription.id) {
            Some(endpoint) => Subscription {
                endpoint,
                ..subscription
            },
            None => subscription,
        }
    }
}

/// Releases an endpoint, containing any panic from a provider.
fn destroy_endpoint(id: &str, endpoint: &dyn DeliveryEndpoint) -> Result<()> {
    std::panic::catch_unwind(AssertUnwindSafe(|| endpoint.destroy())).map_err(|panic| {
        let message = panic_message(panic.as_ref());
        warn!(subscription_id = %id, panic = %message, "Endpoint destroy panicked");
        BrokerError::Delivery(format!("destroying endpoint panicked: {}", message))
    })
}

/// Expiry job for one subscription.
struct SubscriptionExpiry {
    id: String,
    end_of_life: Timestamp,
    manager: Weak<Inner>,
}

impl Terminatable for SubscriptionExpiry {
    fn identity(&self) -> &str {
        &self.id
    }

    fn end_of_life(&self) -> Timestamp {
        self.end_of_life
    }

    fn terminate(&self) -> Result<()> {
        match self.manager.upgrade() {
            Some(inner) => inner.expire(&self.id, self.end_of_life),
            None => Ok(()),
        }
    }
}
