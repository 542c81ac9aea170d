use crate::config::{DEFAULT_MESSAGE_EXCHANGE, DEFAULT_SERVICE_URL, RabbitMqSettings};
use crate::utils::error::{BusError, Result};

/// Broker address plus the fanout exchange this deployment broadcasts on.
///
/// Immutable once built. The exchange name is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    service_url: String,
    exchange_name: String,
}

impl BrokerEndpoint {
    pub fn new(service_url: impl Into<String>, exchange_name: impl Into<String>) -> Result<Self> {
        let service_url = service_url.into();
        let exchange_name = exchange_name.into();

        if service_url.trim().is_empty() {
            return Err(BusError::InvalidEndpoint(
                "service url must not be empty".to_string(),
            ));
        }
        if exchange_name.trim().is_empty() {
            return Err(BusError::InvalidEndpoint(
                "exchange name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            service_url,
            exchange_name,
        })
    }

    pub fn from_settings(settings: &RabbitMqSettings) -> Result<Self> {
        Self::new(&settings.service_url, &settings.message_exchange)
    }

    pub fn service_url(&self) -> &str {
        &self.service_url
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            exchange_name: DEFAULT_MESSAGE_EXCHANGE.to_string(),
        }
    }
}
