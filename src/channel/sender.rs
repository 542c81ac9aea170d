//! Send path
//!
//! Every outgoing message gets a sub-channel of its own: opened right before
//! the publish and closed right after, never shared. Concurrent sends can't
//! interleave frames on one channel, and a failed publish takes down only
//! its own channel.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::connection::open_sub_channel;
use crate::broker::Connection;
use crate::utils::error::Result;

/// Publishes `payload` on `exchange` in a background task.
///
/// Returns `None` without touching the broker when `payload` is empty.
/// Otherwise the returned handle may be dropped; the send runs regardless.
/// Failures are logged, never returned. `cancel` only stops a send that
/// has not started yet.
///
/// The task runs on `runtime`, or on the caller's runtime when that is
/// `None`. With neither available the send is dropped and logged.
pub fn dispatch(
    runtime: Option<Handle>,
    connection: Option<Arc<dyn Connection>>,
    exchange: String,
    payload: Vec<u8>,
    is_debug: bool,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if payload.is_empty() {
        trace!("empty message body, nothing to send");
        return None;
    }

    let Some(runtime) = runtime.or_else(|| Handle::try_current().ok()) else {
        error!(exchange = %exchange, "no tokio runtime to send on, message dropped");
        return None;
    };

    Some(runtime.spawn(async move {
        if cancel.is_cancelled() {
            trace!(len = payload.len(), "send cancelled before it started");
            return;
        }

        if let Err(e) = publish_once(connection.as_deref(), &exchange, &payload, is_debug).await {
            error!(exchange = %exchange, error = %e, "error when sending message");
        }
    }))
}

async fn publish_once(
    connection: Option<&dyn Connection>,
    exchange: &str,
    body: &[u8],
    is_debug: bool,
) -> Result<()> {
    trace!(len = body.len(), is_debug, "publishing message");

    let channel = open_sub_channel(connection).await?;
    let published = channel.publish(exchange, "", body).await;
    let closed = channel.close().await;

    published?;
    if let Err(e) = closed {
        debug!(channel_id = channel.id(), error = %e, "could not close sender channel");
    }
    Ok(())
}
