//! Connection and instance configuration.

use crate::capability::EngineType;
use serde::{Deserialize, Serialize};

/// TLS options shared by connection and instance configs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    pub enabled: bool,
    /// Skip certificate verification. Only honored for non-production
    /// environments; adapters log a warning when it is set.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_path: Option<String>,
}

/// Credentials for one back-end. Which fields matter depends on the engine:
/// user/password for SQL engines, token for HTTP engines, the access-key
/// triple plus region for object stores, a credentials JSON blob for
/// service-account engines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Path-style addressing for S3-compatible stores (MinIO).
    #[serde(default)]
    pub path_style: bool,
}

/// Parameters to open one logical connection scoped to a single
/// database/bucket/dataset. Immutable per connection instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Stable identifier, `db_`-prefixed at the boundary.
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub environment_id: String,
    pub engine: EngineType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Full endpoint URL for engines addressed that way (object stores,
    /// search, vector). Takes precedence over host/port when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Database, dataset, bucket, or keyspace name.
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub tls: TlsOptions,
}

impl ConnectionConfig {
    /// Validate the fields every adapter relies on. Engine-specific
    /// requirements (bucket names, endpoints) are checked by the adapter.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty() {
            return Err(crate::Error::InvalidConfiguration(
                "connection id must not be empty".into(),
            ));
        }
        if self.host.is_empty() && self.endpoint.is_none() {
            return Err(crate::Error::InvalidConfiguration(format!(
                "connection {}: host or endpoint required",
                self.id
            )));
        }
        Ok(())
    }

    /// `host:port` or the endpoint, for error messages.
    pub fn address(&self) -> String {
        match &self.endpoint {
            Some(ep) => ep.clone(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Like [`ConnectionConfig`] but scoped to an engine *instance* (server,
/// project, account) rather than one database; used for database lifecycle
/// operations on that instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub environment_id: String,
    pub engine: EngineType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub tls: TlsOptions,
}

impl InstanceConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty() {
            return Err(crate::Error::InvalidConfiguration(
                "instance id must not be empty".into(),
            ));
        }
        if self.host.is_empty() && self.endpoint.is_none() {
            return Err(crate::Error::InvalidConfiguration(format!(
                "instance {}: host or endpoint required",
                self.id
            )));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        match &self.endpoint {
            Some(ep) => ep.clone(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_host_and_endpoint_is_invalid() {
        let config = ConnectionConfig {
            id: "db_x".into(),
            engine: EngineType::Postgres,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn endpoint_satisfies_address_requirement() {
        let config = ConnectionConfig {
            id: "db_x".into(),
            engine: EngineType::S3,
            endpoint: Some("https://s3.us-east-1.amazonaws.com".into()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.address(), "https://s3.us-east-1.amazonaws.com");
    }

    #[test]
    fn config_serde_round_trip() {
        let config = ConnectionConfig {
            id: "db_1".into(),
            engine: EngineType::MongoDb,
            host: "localhost".into(),
            port: 27017,
            database: "app".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ConnectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
