//! Error types for the broker core.

use thiserror::Error;

/// Main error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("Unknown terminatable: {0}")]
    UnknownTerminatable(String),

    #[error("Unsupported delivery definition: {0}")]
    UnsupportedDeliveryDefinition(String),

    #[error("Could not instantiate filter: {0}")]
    FilterInstantiation(String),

    #[error("Could not transform message: {0}")]
    Transformation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid record format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Storage directory is locked by another process")]
    Locked,

    #[error("Invalid subscription id: {0:?}")]
    InvalidSubscriptionId(String),

    #[error("A rule is already registered for subscription {0}")]
    RuleAlreadyRegistered(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Endpoint {0} has been destroyed")]
    EndpointDestroyed(String),

    #[error("Termination scheduler has been shut down")]
    SchedulerShutdown,

    #[error("Could not start worker thread: {0}")]
    Spawn(String),

    #[error("Ingestion pool is closed")]
    IngestClosed,

    #[error("Unsubscribe finished with {} error(s): {}", .0.len(), join_errors(.0))]
    Unsubscribe(Vec<BrokerError>),
}

impl BrokerError {
    /// True for the "id not tracked" family of errors.
    pub fn is_unknown(&self) -> bool {
        matches!(
            self,
            BrokerError::UnknownSubscription(_) | BrokerError::UnknownTerminatable(_)
        )
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn join_errors(errors: &[BrokerError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BrokerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BrokerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BrokerError::Deserialization(e.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
