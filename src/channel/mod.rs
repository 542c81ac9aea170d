//! Broker-backed cluster channel.
//!
//! A [`FanoutChannel`] gives one node its place on the bus:
//!
//! - `connection`: opens and closes the node's single broker connection.
//! - `topology`: declares the fanout exchange and binds a private queue to it.
//! - `pump`: consumes that queue and hands each message to the host.
//! - `sender`: publishes each outgoing message on its own short-lived
//!   sub-channel, in the background.
//! - `lifecycle`: the [`FanoutChannel`] state machine tying them together.
//!
//! Every node receives every broadcast on the exchange, its own included.
//! Telling them apart is up to the host (see [`crate::message`]).

pub mod connection;
pub mod endpoint;
pub mod lifecycle;
pub mod pump;
pub mod sender;
pub mod topology;

use std::fmt;

pub use endpoint::BrokerEndpoint;
pub use lifecycle::{FanoutChannel, RECEIVER_NAME};
pub use pump::ReceivePump;

/// Receives the raw body of every non-empty message delivered to this node.
///
/// Called synchronously from the receive pump, so a slow handler holds up the
/// deliveries behind it. It runs on a runtime worker thread, not on the
/// thread that started the channel.
pub trait MessageHandler: Send + Sync {
    fn on_message_received(&self, body: Vec<u8>);
}

impl<F> MessageHandler for F
where
    F: Fn(Vec<u8>) + Send + Sync,
{
    fn on_message_received(&self, body: Vec<u8>) {
        self(body)
    }
}

/// Where a [`FanoutChannel`] is in its life.
///
/// `Failed` is terminal: a channel that could not connect or set up its
/// topology stays unusable until its owner builds a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Connecting,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
