//! Subscription persistence.
//!
//! Two implementations share the [`SubscriptionStore`] contract:
//! - [`MemorySubscriptionStore`]: a map behind a single mutex
//! - [`FileSubscriptionStore`]: one `<id>.sub` file per subscription,
//!   replaced atomically on every write

mod fs;
mod memory;

pub use fs::FileSubscriptionStore;
pub use memory::MemorySubscriptionStore;

use crate::error::Result;
use crate::subscriptions::Subscription;
use crate::types::Timestamp;

/// Keyed storage for subscription records.
///
/// Reads degrade instead of failing: an unreadable record is reported as
/// absent and skipped during enumeration.
pub trait SubscriptionStore: Send + Sync {
    /// Insert or replace the record for `subscription.id`.
    fn store_subscription(&self, subscription: &Subscription) -> Result<()>;

    fn get_subscription(&self, id: &str) -> Option<Subscription>;

    /// Snapshot of every readable record.
    fn get_all_subscriptions(&self) -> Vec<Subscription>;

    /// Remove and return the record; `UnknownSubscription` if absent.
    fn delete_subscription(&self, id: &str) -> Result<Subscription>;

    /// Replace the stored termination time in one step and return the
    /// updated record; `UnknownSubscription` if absent.
    fn update_termination_time(&self, id: &str, termination_time: Timestamp)
        -> Result<Subscription>;
}
