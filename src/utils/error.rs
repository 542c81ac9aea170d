//! The `error` module defines the error type shared by every layer of
//! `fanbus`.
//!
//! Broker adapters translate their client library errors into [`BusError`];
//! the channel decides which of them are fatal (connect, topology) and which
//! are only logged (consumer shutdown, send failures).

use thiserror::Error;

use crate::channel::LifecycleState;

/// Errors produced while talking to the message broker or preparing to.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached or refused the session.
    #[error("failed to connect to broker at {uri}: {reason}")]
    Connect { uri: String, reason: String },

    /// Exchange, queue or binding setup failed.
    #[error("topology setup failed for exchange '{exchange}': {reason}")]
    Topology { exchange: String, reason: String },

    /// The sub-channel was already closed by us or by the broker.
    #[error("sub-channel closed: {0}")]
    ChannelClosed(String),

    /// There is no open connection to work with.
    #[error("broker connection is not open")]
    NotConnected,

    /// Any other broker-side failure.
    #[error("broker error: {0}")]
    Broker(String),

    #[error("invalid broker endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("operation not allowed while channel is {0}")]
    InvalidState(LifecycleState),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Format(#[from] serde_json::Error),
}

impl BusError {
    /// Returns true for failures caused by a sub-channel or connection that
    /// is already gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, BusError::ChannelClosed(_) | BusError::NotConnected)
    }
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
