//! In-memory subscription store.

use super::SubscriptionStore;
use crate::error::{BrokerError, Result};
use crate::subscriptions::Subscription;
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Subscriptions held in a map guarded by one mutex.
#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }
}

impl SubscriptionStore for MemorySubscriptionStore {
    fn store_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions
            .lock()
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    fn get_subscription(&self, id: &str) -> Option<Subscription> {
        self.subscriptions.lock().get(id).cloned()
    }

    fn get_all_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.lock().values().cloned().collect()
    }

    fn delete_subscription(&self, id: &str) -> Result<Subscription> {
        self.subscriptions
            .lock()
            .remove(id)
            .ok_or_else(|| BrokerError::UnknownSubscription(id.to_string()))
    }

    fn update_termination_time(
        &self,
        id: &str,
        termination_time: Timestamp,
    ) -> Result<Subscription> {
        let mut subscriptions = self.subscriptions.lock();
        let entry = subscriptions
            .get_mut(id)
            .ok_or_else(|| BrokerError::UnknownSubscription(id.to_string()))?;
        *entry = entry.renewed(termination_time);
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DetachedEndpoint;
    use crate::types::SubscribeOptions;
    use std::sync::Arc;

    fn subscription(id: &str) -> Subscription {
        Subscription::new(
            id,
            SubscribeOptions::new("p1").with_content_type("application/json"),
            Arc::new(DetachedEndpoint::new("local:q")),
        )
    }

    #[test]
    fn test_store_and_get() {
        let store = MemorySubscriptionStore::new();
        let sub = subscription("s1");

        store.store_subscription(&sub).unwrap();

        assert_eq!(store.get_subscription("s1"), Some(sub));
        assert_eq!(store.get_subscription("s2"), None);
    }

    #[test]
    fn test_store_is_upsert() {
        let store = MemorySubscriptionStore::new();
        let sub = subscription("s1");
        store.store_subscription(&sub).unwrap();
        store
            .store_subscription(&sub.renewed(Timestamp::from_secs(5)))
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get_subscription("s1").unwrap().termination_time(),
            Some(Timestamp::from_secs(5))
        );
    }

    #[test]
    fn test_delete_unknown() {
        let store = MemorySubscriptionStore::new();
        assert!(matches!(
            store.delete_subscription("nope"),
            Err(BrokerError::UnknownSubscription(_))
        ));
    }

    #[test]
    fn test_delete_returns_record() {
        let store = MemorySubscriptionStore::new();
        let sub = subscription("s1");
        store.store_subscription(&sub).unwrap();

        assert_eq!(store.delete_subscription("s1").unwrap(), sub);
        assert!(store.is_empty());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_writes() {
        let store = MemorySubscriptionStore::new();
        store.store_subscription(&subscription("a")).unwrap();

        let snapshot = store.get_all_subscriptions();
        store.store_subscription(&subscription("b")).unwrap();
        store.delete_subscription("a").unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "a");
    }

    #[test]
    fn test_update_termination_time() {
        let store = MemorySubscriptionStore::new();
        store.store_subscription(&subscription("s1")).unwrap();

        let updated = store
            .update_termination_time("s1", Timestamp::from_secs(42))
            .unwrap();
        assert_eq!(updated.termination_time(), Some(Timestamp::from_secs(42)));
        assert!(matches!(
            store.update_termination_time("s2", Timestamp::from_secs(1)),
            Err(BrokerError::UnknownSubscription(_))
        ));
    }
}
