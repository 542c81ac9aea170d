//! Broker client seam.
//!
//! The channel talks to the message broker only through the traits in this
//! module:
//!
//! - [`Connector`] opens the single long-lived [`Connection`] of a node.
//! - [`Connection`] multiplexes [`SubChannel`]s over that session.
//! - [`SubChannel`] carries the AMQP-style operations the bus needs: declare a
//!   fanout exchange, declare an anonymous queue, bind, publish, consume.
//!
//! A sub-channel must only ever be driven by one owner. The traits hand out
//! owned `Box<dyn SubChannel>` values so that ownership, not a lock, keeps two
//! writers off the same channel.
//!
//! Two implementations live here: [`amqp`] (RabbitMQ through `lapin`) and
//! [`memory`] (an in-process fanout broker used by tests and the demo).

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::utils::error::Result;

pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, MemoryConnector};

/// Stream of message bodies delivered to a consumer.
///
/// The stream ends when the consumer is cancelled or its sub-channel closes;
/// an `Err` item reports an abnormal shutdown.
pub type DeliveryStream = BoxStream<'static, Result<Vec<u8>>>;

/// Callback invoked with errors the broker client raises outside of any
/// request, e.g. from its own I/O loop.
pub type ErrorObserver = Box<dyn Fn(&crate::utils::error::BusError) + Send + Sync>;

/// Callback invoked once when a connection is shut down, with the cause.
pub type ShutdownObserver = Box<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes a new session with the broker at `uri`.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a new sub-channel on this connection.
    async fn create_channel(&self) -> Result<Box<dyn SubChannel>>;

    /// Closes the connection. Closing an already closed connection is `Ok`.
    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn on_error(&self, observer: ErrorObserver);

    fn on_shutdown(&self, observer: ShutdownObserver);
}

#[async_trait]
pub trait SubChannel: Send + Sync {
    /// Identifier of the sub-channel, unique within its connection.
    fn id(&self) -> u64;

    fn on_error(&self, observer: ErrorObserver);

    /// Declares a non-durable fanout exchange; a no-op if it already exists
    /// with the same type.
    async fn declare_fanout_exchange(&self, exchange: &str) -> Result<()>;

    /// Declares a server-named, exclusive, auto-deleted queue and returns
    /// its name.
    async fn declare_anonymous_queue(&self) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Starts an auto-acknowledged consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Closes the sub-channel. Returns `ChannelClosed` if it was already
    /// closed, by us or by the broker.
    async fn close(&self) -> Result<()>;
}
