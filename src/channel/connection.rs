//! Opening and closing the node's broker connection, and the sub-channels
//! on top of it.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use super::endpoint::BrokerEndpoint;
use crate::broker::{Connection, Connector, SubChannel};
use crate::utils::error::{BusError, Result};

/// Connects to the broker named by `endpoint`. No retries: a failure goes
/// straight back to the caller.
///
/// The returned connection logs callback errors and shutdowns; neither
/// closes it.
pub async fn open(
    connector: &dyn Connector,
    endpoint: &BrokerEndpoint,
) -> Result<Arc<dyn Connection>> {
    let connection = connector.connect(endpoint.service_url()).await?;

    connection.on_error(Box::new(|err: &BusError| {
        error!(error = %err, "broker connection callback exception");
    }));
    connection.on_shutdown(Box::new(|cause: &str| {
        trace!(cause, "broker connection shutdown");
    }));

    Ok(connection)
}

/// Closes `connection`. Absent or already closed connections are fine.
pub async fn close(connection: Option<&dyn Connection>) {
    let Some(connection) = connection else {
        return;
    };

    match connection.close().await {
        Ok(()) => debug!("broker connection closed"),
        Err(e) if e.is_closed() => trace!(error = %e, "broker connection was already closed"),
        Err(e) => warn!(error = %e, "error while closing broker connection"),
    }
}

/// Opens a sub-channel that logs its callback errors.
pub async fn open_sub_channel(connection: Option<&dyn Connection>) -> Result<Box<dyn SubChannel>> {
    let Some(connection) = connection else {
        error!("broker connection is null");
        return Err(BusError::NotConnected);
    };

    let channel = connection.create_channel().await?;
    let channel_id = channel.id();
    channel.on_error(Box::new(move |err: &BusError| {
        error!(channel_id, error = %err, "sub-channel callback exception");
    }));

    Ok(channel)
}
