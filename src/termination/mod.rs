//! Scheduled termination of expiring subscriptions.

mod scheduler;

pub use scheduler::{Terminatable, TerminationScheduler};
