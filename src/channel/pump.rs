//! Receive pump
//!
//! Owns the long-lived receiver sub-channel of a node. Deliveries are
//! auto-acknowledged: a message counts as delivered the moment it reaches the
//! host handler, and nothing is redelivered if the node dies. That is fine
//! for notifications, not for work items.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::MessageHandler;
use super::connection::open_sub_channel;
use crate::broker::{Connection, DeliveryStream, SubChannel};
use crate::utils::error::Result;

/// How long `stop` waits for the delivery loop to notice its channel closed.
const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct ReceivePump {
    channel: Box<dyn SubChannel>,
    queue: String,
    task: JoinHandle<()>,
}

impl ReceivePump {
    /// Opens the receiver sub-channel and starts consuming `queue`.
    ///
    /// Returns once the consumer is registered with the broker.
    pub async fn start(
        connection: &dyn Connection,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        let channel = open_sub_channel(Some(connection)).await?;

        let deliveries = match channel.consume(queue).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "could not close receiver channel");
                }
                return Err(e);
            }
        };

        let task = tokio::spawn(deliver(deliveries, handler, queue.to_string()));

        Ok(Self {
            channel,
            queue: queue.to_string(),
            task,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Closes the receiver sub-channel. A channel the broker already closed
    /// is logged and otherwise ignored.
    pub async fn stop(mut self) {
        match self.channel.close().await {
            Ok(()) => trace!(queue = %self.queue, "receiver channel closed"),
            Err(e) if e.is_closed() => {
                trace!(queue = %self.queue, error = %e, "receiver channel closed with an exception")
            }
            Err(e) => warn!(queue = %self.queue, error = %e, "could not close receiver channel"),
        }

        if tokio::time::timeout(STOP_GRACE, &mut self.task).await.is_err() {
            self.task.abort();
        }
    }
}

impl Drop for ReceivePump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn deliver(mut deliveries: DeliveryStream, handler: Arc<dyn MessageHandler>, queue: String) {
    while let Some(delivery) = deliveries.next().await {
        let body = match delivery {
            Ok(body) => body,
            Err(e) => {
                warn!(queue = %queue, error = %e, "consumer shut down abnormally");
                return;
            }
        };

        trace!(len = body.len(), "message received");
        if body.is_empty() {
            continue;
        }

        // this is the main entry point for received messages
        let handled = catch_unwind(AssertUnwindSafe(|| handler.on_message_received(body)));
        if handled.is_err() {
            error!(queue = %queue, "message handler panicked");
        }
    }

    trace!(queue = %queue, "consumer shutdown");
}
