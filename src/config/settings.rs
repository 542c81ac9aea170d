use serde::Deserialize;

/// Top-level configuration settings for a bus node.
///
/// Includes the broker connection, the identity of this cluster member and
/// logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rabbitmq: RabbitMqSettings,
    pub cluster: ClusterSettings,
    pub logging: LoggingSettings,
}

/// Where the broker lives and which fanout exchange this deployment uses.
///
/// The exchange name should be unique per application so that unrelated
/// deployments sharing one broker do not receive each other's messages.
#[derive(Debug, Deserialize, Clone)]
pub struct RabbitMqSettings {
    pub service_url: String,
    pub message_exchange: String,
}

/// Identity of this node inside the cluster.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterSettings {
    pub cluster_id: String,
    pub cluster_member_id: String,
    pub instance_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Settings as read from file and environment; missing values come from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub rabbitmq: Option<PartialRabbitMqSettings>,
    pub cluster: Option<PartialClusterSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRabbitMqSettings {
    pub service_url: Option<String>,
    pub message_exchange: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialClusterSettings {
    pub cluster_id: Option<String>,
    pub cluster_member_id: Option<String>,
    pub instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

pub const DEFAULT_SERVICE_URL: &str = "amqp://localhost:5672";
pub const DEFAULT_MESSAGE_EXCHANGE: &str = "snmessaging";

/// Provides default values for `Settings`.
///
/// Every call produces a fresh random instance id.
impl Default for Settings {
    fn default() -> Self {
        Self {
            rabbitmq: RabbitMqSettings::default(),
            cluster: ClusterSettings {
                cluster_id: String::new(),
                cluster_member_id: String::new(),
                instance_id: uuid::Uuid::new_v4().to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for RabbitMqSettings {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            message_exchange: DEFAULT_MESSAGE_EXCHANGE.to_string(),
        }
    }
}
