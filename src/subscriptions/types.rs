//! Subscription value types.

use crate::delivery::{DeliveryEndpoint, DetachedEndpoint};
use crate::types::{SubscribeOptions, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A subscription bound to its delivery endpoint.
///
/// Equality compares the id, the options and the endpoint's effective
/// location, so a record read back from storage equals the live value it
/// was written from.
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub options: SubscribeOptions,
    pub endpoint: Arc<dyn DeliveryEndpoint>,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        options: SubscribeOptions,
        endpoint: Arc<dyn DeliveryEndpoint>,
    ) -> Self {
        Self {
            id: id.into(),
            options,
            endpoint,
        }
    }

    pub fn termination_time(&self) -> Option<Timestamp> {
        self.options.termination_time
    }

    pub fn effective_location(&self) -> String {
        self.endpoint.effective_location()
    }

    /// Copy with a new termination time; the endpoint is shared.
    pub fn renewed(&self, termination_time: Timestamp) -> Self {
        let mut options = self.options.clone();
        options.termination_time = Some(termination_time);
        Self {
            id: self.id.clone(),
            options,
            endpoint: Arc::clone(&self.endpoint),
        }
    }

    /// Serializable snapshot.
    pub fn to_record(&self) -> SubscriptionRecord {
        SubscriptionRecord {
            id: self.id.clone(),
            options: self.options.clone(),
            endpoint_location: self.effective_location(),
        }
    }

    /// Rebuild from a snapshot. The endpoint is detached until the
    /// subscription is re-activated.
    pub fn from_record(record: SubscriptionRecord) -> Self {
        Self {
            id: record.id,
            options: record.options,
            endpoint: Arc::new(DetachedEndpoint::new(record.endpoint_location)),
        }
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.options == other.options
            && self.effective_location() == other.effective_location()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("endpoint", &self.effective_location())
            .finish()
    }
}

/// Persisted form of a [`Subscription`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: String,
    pub options: SubscribeOptions,
    pub endpoint_location: String,
}
