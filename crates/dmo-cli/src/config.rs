//! `dmo.toml` loading
//!
//! ```toml
//! state_dir = "./dmo-state"
//!
//! [source]
//! host = "localhost"
//! port = 0
//! database = "./source.db"
//! user = "migrator"
//!
//! [destination]
//! host = "localhost"
//! port = 0
//! database = "./destination.db"
//! user = "migrator"
//!
//! [advisory]
//! endpoint = "http://localhost:8080"
//!
//! [settings]
//! schemas = ["main"]
//! batch_size = 500
//! ```
//!
//! Secrets may be left out of the file and supplied through
//! `DMO_SOURCE_PASSWORD`, `DMO_DESTINATION_PASSWORD` and
//! `DMO_ADVISORY_API_KEY`; the environment wins when both are set.

use dmo_core::{AdvisoryDescriptor, ConnectionDescriptor, Descriptors, MigrationSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding the source password
pub(crate) const SOURCE_PASSWORD_ENV: &str = "DMO_SOURCE_PASSWORD";
/// Environment variable overriding the destination password
pub(crate) const DESTINATION_PASSWORD_ENV: &str = "DMO_DESTINATION_PASSWORD";
/// Environment variable overriding the advisory API key
pub(crate) const ADVISORY_API_KEY_ENV: &str = "DMO_ADVISORY_API_KEY";

/// Configuration failures
#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        /// Config path
        path: PathBuf,
        /// I/O failure
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// Config path
        path: PathBuf,
        /// Decoder failure
        #[source]
        source: toml::de::Error,
    },

    /// Settings rejected
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Everything `dmo run` needs
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CliConfig {
    /// Database copied from
    pub(crate) source: ConnectionDescriptor,
    /// Database copied into
    pub(crate) destination: ConnectionDescriptor,
    /// Advisory service
    pub(crate) advisory: AdvisoryDescriptor,
    /// Tunables
    #[serde(default)]
    pub(crate) settings: MigrationSettings,
    /// Session persistence directory
    #[serde(default)]
    pub(crate) state_dir: Option<PathBuf>,
}

impl CliConfig {
    /// Read `path`, then apply secrets from the process environment
    pub(crate) fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env(|key| std::env::var(key).ok());
        config
            .settings
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    /// Decode a TOML document
    pub(crate) fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overlay secrets found by `lookup`; empty values are ignored
    pub(crate) fn apply_env<F>(&mut self, mut lookup: F)
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(password) = get(SOURCE_PASSWORD_ENV) {
            self.source.password = password;
        }
        if let Some(password) = get(DESTINATION_PASSWORD_ENV) {
            self.destination.password = password;
        }
        if let Some(key) = get(ADVISORY_API_KEY_ENV) {
            self.advisory.api_key = key;
        }
    }

    /// Descriptors for `configure`
    #[must_use]
    pub(crate) fn descriptors(&self) -> Descriptors {
        Descriptors {
            source: self.source.clone(),
            destination: self.destination.clone(),
            advisory: self.advisory.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmo_kernel::TableName;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const DOCUMENT: &str = r#"
        state_dir = "/var/lib/dmo"

        [source]
        host = "legacy.internal"
        port = 5432
        database = "shop"
        user = "reader"
        password = "from-file"

        [destination]
        host = "new.internal"
        port = 5433
        database = "shop"
        user = "writer"

        [advisory]
        endpoint = "https://advisor.internal"
        model_id = "review-small"

        [settings]
        batch_size = 250
        exclude_tables = ["public.audit_log"]
        approval_timeout_secs = 600
    "#;

    #[test]
    fn test_parse_fills_defaults() {
        let config = CliConfig::parse(DOCUMENT).unwrap();
        assert_eq!(config.source.redacted(), "reader@legacy.internal:5432/shop");
        assert_eq!(config.source.password, "from-file");
        assert_eq!(config.destination.password, "");
        assert_eq!(config.advisory.model_id, "review-small");
        assert_eq!(config.settings.batch_size, 250);
        assert_eq!(config.settings.max_attempts, 2);
        assert_eq!(config.settings.schemas, vec!["public"]);
        assert_eq!(
            config.settings.exclude_tables,
            vec![TableName::new("public", "audit_log")]
        );
        assert_eq!(config.state_dir, Some(PathBuf::from("/var/lib/dmo")));
    }

    #[test]
    fn test_environment_overrides_secrets() {
        let mut config = CliConfig::parse(DOCUMENT).unwrap();
        let env: HashMap<&str, &str> = [
            (SOURCE_PASSWORD_ENV, "from-env"),
            (DESTINATION_PASSWORD_ENV, ""),
            (ADVISORY_API_KEY_ENV, "sk-test"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(ToString::to_string));

        assert_eq!(config.source.password, "from-env");
        assert_eq!(config.destination.password, "");
        assert_eq!(config.advisory.api_key, "sk-test");
        assert!(!format!("{:?}", config.descriptors()).contains("sk-test"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let text = format!("verbose = true\n{DOCUMENT}");
        assert!(CliConfig::parse(&text).is_err());
    }

    #[test]
    fn test_load_reports_path_and_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = CliConfig::load(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("missing.toml"));

        let path = dir.path().join("dmo.toml");
        std::fs::write(&path, format!("{DOCUMENT}\n")).unwrap();
        assert!(CliConfig::load(&path).is_ok());

        let zero = DOCUMENT.replace("batch_size = 250", "batch_size = 0");
        std::fs::write(&path, zero).unwrap();
        assert!(matches!(
            CliConfig::load(&path).unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }
}
