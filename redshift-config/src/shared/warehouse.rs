use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::ValidationError;

/// Connection settings for the Redshift cluster.
///
/// Does not implement `Serialize` so the password cannot leak through a serialized form.
#[derive(Clone, Debug, Deserialize)]
pub struct WarehouseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name.
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Size of the connection pool shared by all flush workers.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl WarehouseConfig {
    pub const DEFAULT_PORT: u16 = 5439;

    pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::MissingField("warehouse.host".to_string()));
        }

        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("warehouse.name".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ValidationError::invalid(
                "warehouse.max_connections",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn default_port() -> u16 {
    WarehouseConfig::DEFAULT_PORT
}

fn default_max_connections() -> u32 {
    WarehouseConfig::DEFAULT_MAX_CONNECTIONS
}

fn default_connect_timeout_ms() -> u64 {
    WarehouseConfig::DEFAULT_CONNECT_TIMEOUT_MS
}
