//! The `config` module loads node settings from an optional configuration
//! file and the environment, falling back to defaults for anything missing.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    ClusterSettings, DEFAULT_MESSAGE_EXCHANGE, DEFAULT_SERVICE_URL, LoggingSettings,
    RabbitMqSettings, Settings,
};

/// Loads the configuration from `config/default` and `FANBUS_*` environment
/// variables, merged over [`Settings::default`].
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit configuration file stem.
///
/// Environment variables use a double underscore between section and key,
/// e.g. `FANBUS_RABBITMQ__SERVICE_URL`.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix("FANBUS")
                .prefix_separator("_")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        rabbitmq: RabbitMqSettings {
            service_url: partial
                .rabbitmq
                .as_ref()
                .and_then(|r| r.service_url.clone())
                .unwrap_or(default.rabbitmq.service_url),
            message_exchange: partial
                .rabbitmq
                .as_ref()
                .and_then(|r| r.message_exchange.clone())
                .unwrap_or(default.rabbitmq.message_exchange),
        },
        cluster: ClusterSettings {
            cluster_id: partial
                .cluster
                .as_ref()
                .and_then(|c| c.cluster_id.clone())
                .unwrap_or(default.cluster.cluster_id),
            cluster_member_id: partial
                .cluster
                .as_ref()
                .and_then(|c| c.cluster_member_id.clone())
                .unwrap_or(default.cluster.cluster_member_id),
            instance_id: partial
                .cluster
                .as_ref()
                .and_then(|c| c.instance_id.clone())
                .unwrap_or(default.cluster.instance_id),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    })
}

#[cfg(test)]
mod tests;
