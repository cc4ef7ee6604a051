//! Connection descriptors.
//!
//! Secrets are accepted on deserialization but never serialized and never
//! printed by `Debug`, so persisted sessions and logs stay clean.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Model used when a descriptor does not name one
pub const DEFAULT_MODEL_ID: &str = "gpt-4-turbo-2024-04-09";

/// TLS negotiation mode, libpq naming
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Never use TLS
    Disable,
    /// Plain first, TLS if required
    Allow,
    /// TLS first, plain if refused
    #[default]
    Prefer,
    /// TLS without certificate checks
    Require,
    /// TLS with CA verification
    VerifyCa,
    /// TLS with CA and host verification
    VerifyFull,
}

/// One database endpoint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Database name (a file path for file-backed engines)
    pub database: String,
    /// Login role
    pub user: String,
    /// Login secret
    #[serde(default, skip_serializing)]
    pub password: String,
    /// TLS mode
    #[serde(default)]
    pub sslmode: SslMode,
}

impl ConnectionDescriptor {
    /// Descriptor without a password
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: String::new(),
            sslmode: SslMode::default(),
        }
    }

    /// Builder: set the password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// `user@host:port/database`, safe to log
    #[must_use]
    pub fn redacted(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("sslmode", &self.sslmode)
            .finish()
    }
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

/// The advisory service endpoint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryDescriptor {
    /// Base URL
    pub endpoint: String,
    /// Bearer token
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Model requested for assessments
    #[serde(default = "default_model_id")]
    pub model_id: String,
}

impl AdvisoryDescriptor {
    /// Descriptor with the default model
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model_id: default_model_id(),
        }
    }

    /// Builder: choose a model
    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }
}

impl fmt::Debug for AdvisoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvisoryDescriptor")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model_id", &self.model_id)
            .finish()
    }
}

/// Everything `configure` needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptors {
    /// Database copied from
    pub source: ConnectionDescriptor,
    /// Database copied into
    pub destination: ConnectionDescriptor,
    /// Advisory service
    pub advisory: AdvisoryDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_never_leaks() {
        let d = ConnectionDescriptor::new("db", 5432, "app", "migrator").with_password("hunter2");
        assert!(!format!("{d:?}").contains("hunter2"));
        assert!(!serde_json::to_string(&d).unwrap().contains("hunter2"));
        assert_eq!(d.redacted(), "migrator@db:5432/app");
    }

    #[test]
    fn test_api_key_accepted_but_not_written() {
        let json = r#"{"endpoint":"http://gpte","api_key":"sk-1"}"#;
        let d: AdvisoryDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.api_key, "sk-1");
        assert_eq!(d.model_id, DEFAULT_MODEL_ID);
        assert!(!serde_json::to_string(&d).unwrap().contains("sk-1"));
        assert!(!format!("{d:?}").contains("sk-1"));
    }

    #[test]
    fn test_sslmode_kebab_case() {
        let mode: SslMode = serde_json::from_str("\"verify-full\"").unwrap();
        assert_eq!(mode, SslMode::VerifyFull);
    }
}
