//! RabbitMQ adapter built on `lapin` (AMQP 0-9-1).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties, ExchangeKind};
use tracing::trace;

use super::{Connection, Connector, DeliveryStream, ErrorObserver, ShutdownObserver, SubChannel};
use crate::utils::error::{BusError, Result};

const REPLY_SUCCESS: u16 = 200;

impl From<lapin::Error> for BusError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(state) => {
                BusError::ChannelClosed(format!("invalid channel state: {state:?}"))
            }
            lapin::Error::InvalidConnectionState(_) => BusError::NotConnected,
            other => BusError::Broker(other.to_string()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens connections to a RabbitMQ broker.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector {
    connection_name: Option<String>,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.as_str().into());
        }

        let inner = lapin::Connection::connect(uri, properties)
            .await
            .map_err(|e| BusError::Connect {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;

        let connection = AmqpConnection {
            inner,
            observers: Arc::new(Observers::default()),
        };
        connection.install_error_hook();
        Ok(Arc::new(connection))
    }
}

#[derive(Default)]
struct Observers {
    errors: Mutex<Vec<ErrorObserver>>,
    shutdowns: Mutex<Vec<ShutdownObserver>>,
}

pub struct AmqpConnection {
    inner: lapin::Connection,
    observers: Arc<Observers>,
}

impl AmqpConnection {
    /// lapin keeps a single error handler per connection and calls it when
    /// the connection is lost, so that one hook feeds both observer lists.
    fn install_error_hook(&self) {
        let observers = self.observers.clone();
        self.inner.on_error(move |err| {
            let err = BusError::from(err);
            for observer in lock(&observers.errors).iter() {
                observer(&err);
            }
            let cause = format!("connection lost: {err}");
            for observer in lock(&observers.shutdowns).iter() {
                observer(&cause);
            }
        });
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Box<dyn SubChannel>> {
        let inner = self.inner.create_channel().await?;
        Ok(Box::new(AmqpChannel { inner }))
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        match self.inner.close(REPLY_SUCCESS, "OK").await {
            Ok(()) => Ok(()),
            // Lost the race with the broker or the network.
            Err(lapin::Error::InvalidConnectionState(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_error(&self, observer: ErrorObserver) {
        lock(&self.observers.errors).push(observer);
    }

    fn on_shutdown(&self, observer: ShutdownObserver) {
        lock(&self.observers.shutdowns).push(observer);
    }
}

pub struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl SubChannel for AmqpChannel {
    fn id(&self) -> u64 {
        u64::from(self.inner.id())
    }

    fn on_error(&self, observer: ErrorObserver) {
        self.inner.on_error(move |err| observer(&BusError::from(err)));
    }

    async fn declare_fanout_exchange(&self, exchange: &str) -> Result<()> {
        self.inner
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_anonymous_queue(&self) -> Result<String> {
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .inner
            .queue_declare("", options, FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, "", options, FieldTable::default())
            .await?;
        trace!(queue, channel_id = self.inner.id(), "amqp consumer registered");

        Ok(consumer
            .map(|delivery| delivery.map(|d| d.data).map_err(BusError::from))
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Err(BusError::ChannelClosed(format!(
                "channel {} is not connected",
                self.inner.id()
            )));
        }
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}
