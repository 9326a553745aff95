//! AMQP plumbing for rateway: topology, publishing and consuming.

pub mod client;
pub mod consumer;
pub mod publish;

pub use client::{AmqpClient, Topology, CACHE_ROUTING_KEY, GATEWAY_ROUTING_KEY};
pub use consumer::{ConsumerService, DeliveryHandler};
pub use publish::{ExchangePublisher, Publish};

// Re-exported so dependents name the same lapin types.
pub use lapin::{
    message::Delivery,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
