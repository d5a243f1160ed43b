//! Pluggable delivery endpoints.
//!
//! A [`DeliveryProvider`] turns a [`DeliveryDefinition`](crate::DeliveryDefinition)
//! into a transport-bound [`DeliveryEndpoint`]. The
//! [`DeliveryProviderRegistry`] picks the provider by exact identifier match.
//! Wire clients sit behind the [`Transport`] trait.

mod amqp;
mod channel;
mod endpoint;
mod push;

pub use amqp::{
    normalize_address, AmqpDeliveryEndpoint, AmqpDeliveryProvider, AMQP_IDENTIFIER,
    SUBJECT_PARAMETER,
};
pub use channel::{ChannelDeliveryProvider, DeliveredMessage, DeliveryReceiver, LOCAL_IDENTIFIER};
pub use endpoint::{
    DeliveryEndpoint, DeliveryProvider, DeliveryProviderRegistry, DetachedEndpoint,
    OutboundMessage, RandomSource, ThreadRngSource, Transport,
};
pub use push::{
    PushDeliveryEndpoint, PushDeliveryProvider, HTTP_PUSH_IDENTIFIER, WSN_CONSUMER_IDENTIFIER,
};
