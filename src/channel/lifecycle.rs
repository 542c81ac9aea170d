//! Lifecycle controller
//!
//! `FanoutChannel` walks a node through
//! `Stopped → Connecting → Starting → Running → Stopping → Stopped`:
//!
//! - a connect failure is logged, `start` still returns `Ok` and the channel
//!   ends up `Failed`;
//! - a topology or consumer failure is logged and returned from `start`, and
//!   the channel ends up `Failed`;
//! - `stop` closes the receiver sub-channel, then the connection, and can be
//!   called any number of times in any state.
//!
//! There is no reconnect. Losing the connection while starting or running
//! moves the channel to `Failed`, where it stays until its owner replaces it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use super::endpoint::BrokerEndpoint;
use super::pump::ReceivePump;
use super::{LifecycleState, MessageHandler, connection, sender, topology};
use crate::broker::{Connection, Connector};
use crate::message::{ClusterMessage, MessageFormatter};
use crate::utils::error::{BusError, Result};

/// Label identifying this channel implementation.
pub const RECEIVER_NAME: &str = "RabbitMQ";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FanoutChannel {
    endpoint: BrokerEndpoint,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn MessageHandler>,
    state: Arc<Mutex<LifecycleState>>,
    /// Runtime `start` ran on; sends from outside any runtime spawn here.
    runtime: Mutex<Option<Handle>>,
    /// Shared with every in-flight send; sub-channels never are.
    connection: Mutex<Option<Arc<dyn Connection>>>,
    /// Also serializes `start` and `stop`.
    pump: tokio::sync::Mutex<Option<ReceivePump>>,
}

impl FanoutChannel {
    pub fn new(
        endpoint: BrokerEndpoint,
        connector: Arc<dyn Connector>,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        Self {
            endpoint,
            connector,
            handler: Arc::new(handler),
            state: Arc::new(Mutex::new(LifecycleState::Stopped)),
            runtime: Mutex::new(None),
            connection: Mutex::new(None),
            pump: tokio::sync::Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    pub fn receiver_name(&self) -> &'static str {
        RECEIVER_NAME
    }

    /// Always `false`: one connection carries everything, so there is no
    /// individual channel to restart.
    pub fn restart_capability_supported(&self) -> bool {
        false
    }

    /// Does nothing; see [`FanoutChannel::restart_capability_supported`].
    pub async fn restart_all(&self) {
        trace!("restart all channels does nothing");
    }

    /// Connects, sets up the exchange and queue, and starts listening.
    ///
    /// `cancel` is checked once, before connecting.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut pump = self.pump.lock().await;

        {
            let mut state = lock(&self.state);
            if *state != LifecycleState::Stopped {
                return Err(BusError::InvalidState(*state));
            }
            if cancel.is_cancelled() {
                trace!("start cancelled before connecting");
                return Ok(());
            }
            *state = LifecycleState::Connecting;
        }
        *lock(&self.runtime) = Some(Handle::current());

        let connection = match connection::open(self.connector.as_ref(), &self.endpoint).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "error opening connection in RabbitMQ message provider");
                self.set_state(LifecycleState::Failed);
                return Ok(());
            }
        };
        self.watch_for_loss(connection.as_ref());
        *lock(&self.connection) = Some(connection.clone());
        self.set_state(LifecycleState::Starting);

        let exchange = self.endpoint.exchange_name();
        let queue = match topology::initialize(connection.as_ref(), exchange).await {
            Ok(queue) => queue,
            Err(e) => {
                error!(
                    service_url = self.endpoint.service_url(),
                    error = %e,
                    "RabbitMQ message provider connection error"
                );
                self.abort_start().await;
                return Err(e);
            }
        };

        match ReceivePump::start(connection.as_ref(), &queue, self.handler.clone()).await {
            Ok(started) => *pump = Some(started),
            Err(e) => {
                error!(queue = %queue, error = %e, "could not start consuming");
                self.abort_start().await;
                return Err(e);
            }
        }

        info!(
            service_url = self.endpoint.service_url(),
            exchange = self.endpoint.exchange_name(),
            queue = %queue,
            "RabbitMQ message provider connected"
        );
        let mut state = lock(&self.state);
        if *state == LifecycleState::Starting {
            *state = LifecycleState::Running;
        }
        Ok(())
    }

    /// Stops listening and closes the connection.
    ///
    /// Safe in any state, including when `start` never ran or failed. A
    /// `Failed` channel stays `Failed`.
    pub async fn stop(&self) {
        let mut pump = self.pump.lock().await;

        let failed = match self.state() {
            LifecycleState::Stopped => {
                trace!("channel already stopped");
                return;
            }
            LifecycleState::Failed => true,
            _ => false,
        };
        if !failed {
            self.set_state(LifecycleState::Stopping);
        }

        if let Some(pump) = pump.take() {
            pump.stop().await;
        }

        let connection = lock(&self.connection).take();
        connection::close(connection.as_deref()).await;

        if !failed {
            self.set_state(LifecycleState::Stopped);
        }
    }

    /// Broadcasts `payload` to every node on the exchange, this one included.
    ///
    /// Returns immediately; the publish happens in the background. Empty
    /// payloads are dropped and yield `None`. Failures are only logged.
    pub fn send(
        &self,
        payload: impl Into<Vec<u8>>,
        is_debug: bool,
        cancel: &CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let runtime = lock(&self.runtime).clone();
        let connection = lock(&self.connection).clone();
        sender::dispatch(
            runtime,
            connection,
            self.endpoint.exchange_name().to_string(),
            payload.into(),
            is_debug,
            cancel.clone(),
        )
    }

    /// Formats `message` and sends it like [`FanoutChannel::send`].
    pub fn send_message(
        &self,
        formatter: &dyn MessageFormatter,
        message: &ClusterMessage,
        cancel: &CancellationToken,
    ) -> Result<Option<JoinHandle<()>>> {
        let body = formatter.serialize(message)?;
        Ok(self.send(body, message.is_debug, cancel))
    }

    /// A connection lost while starting or running leaves the channel
    /// `Failed`. A close requested by `stop` does not report an error.
    fn watch_for_loss(&self, connection: &dyn Connection) {
        let state = self.state.clone();
        connection.on_error(Box::new(move |err: &BusError| {
            let mut state = lock(&state);
            if matches!(*state, LifecycleState::Starting | LifecycleState::Running) {
                error!(error = %err, "broker connection lost, channel is now failed");
                *state = LifecycleState::Failed;
            }
        }));
    }

    fn set_state(&self, state: LifecycleState) {
        *lock(&self.state) = state;
    }

    async fn abort_start(&self) {
        let connection = lock(&self.connection).take();
        connection::close(connection.as_deref()).await;
        self.set_state(LifecycleState::Failed);
    }
}
