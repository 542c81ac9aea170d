use super::envelope::ClusterMessage;
use crate::utils::error::Result;

/// Converts envelopes to the bytes that travel over the bus and back.
pub trait MessageFormatter: Send + Sync {
    fn serialize(&self, message: &ClusterMessage) -> Result<Vec<u8>>;

    fn deserialize(&self, body: &[u8]) -> Result<ClusterMessage>;
}

/// JSON encoding of [`ClusterMessage`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageFormatter;

impl MessageFormatter for JsonMessageFormatter {
    fn serialize(&self, message: &ClusterMessage) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }

    fn deserialize(&self, body: &[u8]) -> Result<ClusterMessage> {
        Ok(serde_json::from_slice(body)?)
    }
}
