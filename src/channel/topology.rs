use tracing::{debug, trace};

use super::connection::open_sub_channel;
use crate::broker::{Connection, SubChannel};
use crate::utils::error::{BusError, Result};

/// Declares the fanout `exchange`, creates this node's private queue, binds
/// the two and returns the queue name.
///
/// Uses a throwaway sub-channel. Every failure comes back as
/// [`BusError::Topology`].
pub async fn initialize(connection: &dyn Connection, exchange: &str) -> Result<String> {
    let channel = open_sub_channel(Some(connection))
        .await
        .map_err(|e| topology_error(exchange, e))?;

    let declared = declare_and_bind(channel.as_ref(), exchange).await;

    match channel.close().await {
        Ok(()) => {}
        // A failed declaration has already closed the channel.
        Err(e) if declared.is_err() && e.is_closed() => {}
        Err(e) => debug!(error = %e, "could not close topology sub-channel"),
    }

    declared.map_err(|e| topology_error(exchange, e))
}

async fn declare_and_bind(channel: &dyn SubChannel, exchange: &str) -> Result<String> {
    channel.declare_fanout_exchange(exchange).await?;

    // let the server pick a unique queue name
    let queue = channel.declare_anonymous_queue().await?;
    trace!(queue = %queue, "queue declared");

    // fanout ignores routing keys
    channel.bind_queue(&queue, exchange, "").await?;
    trace!(queue = %queue, exchange, "queue bound to exchange");

    Ok(queue)
}

fn topology_error(exchange: &str, err: BusError) -> BusError {
    match err {
        BusError::Topology { .. } => err,
        other => BusError::Topology {
            exchange: exchange.to_string(),
            reason: other.to_string(),
        },
    }
}
