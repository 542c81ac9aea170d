use serde::{Deserialize, Serialize};

use crate::config::ClusterSettings;

/// Identifies one running node of the cluster.
///
/// `instance_id` is unique per process start; the other two fields are
/// operator-assigned and may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMemberInfo {
    pub cluster_id: String,
    pub cluster_member_id: String,
    pub instance_id: String,
}

impl ClusterMemberInfo {
    /// Member info with a fresh random instance id.
    pub fn new() -> Self {
        Self {
            cluster_id: String::new(),
            cluster_member_id: String::new(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for ClusterMemberInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&ClusterSettings> for ClusterMemberInfo {
    fn from(settings: &ClusterSettings) -> Self {
        Self {
            cluster_id: settings.cluster_id.clone(),
            cluster_member_id: settings.cluster_member_id.clone(),
            instance_id: settings.instance_id.clone(),
        }
    }
}

/// A broadcast as the application sees it.
///
/// # Fields
///
/// - `sender` - The node that created the message.
/// - `kind` - Application-defined message type name, e.g. `"CacheInvalidation"`.
/// - `body` - The message content, usually a JSON-encoded string.
/// - `is_debug` - Marks diagnostic traffic.
/// - `timestamp` - Unix timestamp in milliseconds at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMessage {
    pub sender: ClusterMemberInfo,
    pub kind: String,
    pub body: String,
    #[serde(default)]
    pub is_debug: bool,
    pub timestamp: i64,
}

impl ClusterMessage {
    pub fn new(
        sender: ClusterMemberInfo,
        kind: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            kind: kind.into(),
            body: body.into(),
            is_debug: false,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn debug(mut self) -> Self {
        self.is_debug = true;
        self
    }

    /// Whether `member` created this message.
    pub fn is_from(&self, member: &ClusterMemberInfo) -> bool {
        self.sender.instance_id == member.instance_id
    }
}
