//! In-process delivery through bounded channels.
//!
//! A consumer opens a named queue and receives every payload delivered to a
//! subscription whose location names that queue:
//!
//! ```ignore
//! let local = Arc::new(ChannelDeliveryProvider::new(256));
//! let inbox = local.open_queue("alerts");
//! registry.register(local.clone());
//!
//! manager.subscribe(
//!     SubscribeOptions::new("weather")
//!         .with_delivery(DeliveryDefinition::new(LOCAL_IDENTIFIER, "alerts", "weather")),
//! )?;
//!
//! while let Ok(message) = inbox.recv() {
//!     println!("{}", String::from_utf8_lossy(&message.body));
//! }
//! ```

use super::endpoint::{DeliveryEndpoint, DeliveryProvider};
use crate::error::{BrokerError, Result};
use crate::types::{DeliveryDefinition, Payload};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delivery-definition identifier served by [`ChannelDeliveryProvider`].
pub const LOCAL_IDENTIFIER: &str = "local";

/// One delivered message.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveredMessage {
    pub content_type: String,
    pub body: Vec<u8>,
    pub payload: Payload,
}

/// Receiving side of a named local queue.
pub struct DeliveryReceiver {
    pub name: String,
    receiver: Receiver<DeliveredMessage>,
}

impl DeliveryReceiver {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> std::result::Result<DeliveredMessage, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<DeliveredMessage, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<DeliveredMessage, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Messages currently buffered.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Provider for [`LOCAL_IDENTIFIER`] locations.
pub struct ChannelDeliveryProvider {
    queues: Mutex<HashMap<String, Sender<DeliveredMessage>>>,
    /// Max buffered messages per queue before new ones are dropped.
    buffer_size: usize,
}

impl ChannelDeliveryProvider {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Create (or replace) the queue `name` and return its receiver.
    pub fn open_queue(&self, name: impl Into<String>) -> DeliveryReceiver {
        let name = name.into();
        let (sender, receiver) = bounded(self.buffer_size);
        self.queues.lock().insert(name.clone(), sender);
        DeliveryReceiver { name, receiver }
    }

    /// Stop accepting new endpoints for `name`. Existing endpoints keep
    /// their sender until destroyed.
    pub fn close_queue(&self, name: &str) -> bool {
        self.queues.lock().remove(name).is_some()
    }
}

impl Default for ChannelDeliveryProvider {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl DeliveryProvider for ChannelDeliveryProvider {
    fn identifier(&self) -> &str {
        LOCAL_IDENTIFIER
    }

    fn description(&self) -> &str {
        "In-process bounded queue"
    }

    fn create_endpoint(&self, definition: &DeliveryDefinition) -> Result<Arc<dyn DeliveryEndpoint>> {
        let sender = self
            .queues
            .lock()
            .get(&definition.location)
            .cloned()
            .ok_or_else(|| {
                BrokerError::UnsupportedDeliveryDefinition(format!(
                    "No local queue named '{}'",
                    definition.location
                ))
            })?;

        Ok(Arc::new(ChannelEndpoint {
            name: definition.location.clone(),
            sender: Mutex::new(Some(sender)),
        }))
    }
}

/// Sends into one local queue.
struct ChannelEndpoint {
    name: String,
    sender: Mutex<Option<Sender<DeliveredMessage>>>,
}

impl DeliveryEndpoint for ChannelEndpoint {
    fn deliver(&self, payload: &Payload, raw: bool) -> Result<()> {
        let guard = self.sender.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| BrokerError::EndpointDestroyed(self.effective_location()))?;

        let message = DeliveredMessage {
            content_type: payload.content_type(raw).to_string(),
            body: payload.body(raw),
            payload: payload.clone(),
        };

        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(queue = %self.name, "Local queue full, dropping message");
                Err(BrokerError::Delivery(format!("queue {} is full", self.name)))
            }
            Err(TrySendError::Disconnected(_)) => Err(BrokerError::Delivery(format!(
                "queue {} has no receiver",
                self.name
            ))),
        }
    }

    fn effective_location(&self) -> String {
        format!("{}:{}", LOCAL_IDENTIFIER, self.name)
    }

    fn destroy(&self) {
        if self.sender.lock().take().is_some() {
            debug!(queue = %self.name, "Destroyed local endpoint");
        }
    }
}
