//! # fanbus
//!
//! `fanbus` connects one node of a multi-process deployment to a cluster-wide
//! broadcast bus backed by a RabbitMQ fanout exchange. Whatever one node
//! sends, every running node receives: cache invalidations, coordination
//! signals and similar best-effort notifications.
//!
//! ## Core Modules
//!
//! - `channel`: the [`FanoutChannel`] lifecycle, topology setup, receive pump
//!   and send path.
//! - `broker`: the broker client seam, with a `lapin` backed AMQP adapter and
//!   an in-process broker.
//! - `message`: the envelope hosts wrap their payloads in, and its formatter.
//! - `config`: loading settings from files and the environment.
//! - `utils`: error type and logging setup.
//!
//! Delivery is best effort: no ordering across nodes, no persistence, no
//! redelivery.

pub mod broker;
pub mod channel;
pub mod config;
pub mod message;
pub mod utils;

pub use channel::{BrokerEndpoint, FanoutChannel, LifecycleState, MessageHandler};
pub use utils::error::{BusError, Result};
