//! Migration settings with per-field defaults.

use crate::advisory::RetryPolicy;
use crate::error::WorkflowError;
use dmo_kernel::engine::{EngineConfig, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS, DEFAULT_WORKERS};
use dmo_kernel::TableName;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Schemas to inventory
    pub schemas: Vec<String>,
    /// Tables left out of the plan
    pub exclude_tables: Vec<TableName>,
    /// Rows per batch
    pub batch_size: usize,
    /// Attempts per table, the first one included
    pub max_attempts: u32,
    /// Concurrent table workers
    pub workers: usize,
    /// Pause before a table retry
    pub retry_backoff_ms: u64,
    /// Rows copied by the validation sample
    pub sample_rows: usize,
    /// Create source tables missing from the destination once the plan is
    /// approved, instead of reporting them incompatible
    pub create_missing_tables: bool,
    /// Implicit deny after this long at the approval gate
    pub approval_timeout_secs: Option<u64>,
    /// Advisory attempts
    pub advisory_attempts: u32,
    /// First advisory backoff
    pub advisory_backoff_ms: u64,
    /// Deadline for one advisory call
    pub advisory_timeout_secs: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            schemas: vec!["public".to_string()],
            exclude_tables: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            workers: DEFAULT_WORKERS,
            retry_backoff_ms: 200,
            sample_rows: 100,
            create_missing_tables: false,
            approval_timeout_secs: None,
            advisory_attempts: 3,
            advisory_backoff_ms: 2_000,
            advisory_timeout_secs: 120,
        }
    }
}

impl MigrationSettings {
    /// Reject settings the engine cannot work with
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let invalid = |msg: &str| Err(WorkflowError::InvalidSettings(msg.to_string()));
        if self.schemas.is_empty() {
            return invalid("at least one schema is required");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be positive");
        }
        if self.workers == 0 {
            return invalid("workers must be positive");
        }
        if self.advisory_attempts == 0 {
            return invalid("advisory_attempts must be positive");
        }
        Ok(())
    }

    /// Engine configuration
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_batch_size(self.batch_size)
            .with_max_attempts(self.max_attempts)
            .with_workers(self.workers)
            .with_retry_backoff(Duration::from_millis(self.retry_backoff_ms))
    }

    /// Advisory retry policy
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.advisory_attempts,
            initial_backoff: Duration::from_millis(self.advisory_backoff_ms),
            attempt_timeout: Duration::from_secs(self.advisory_timeout_secs),
            ..RetryPolicy::default()
        }
    }

    /// Approval timeout, if any
    #[must_use]
    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let settings: MigrationSettings =
            serde_json::from_str(r#"{"batch_size": 250, "exclude_tables": ["public.audit_log"]}"#)
                .unwrap();
        assert_eq!(settings.batch_size, 250);
        assert_eq!(settings.max_attempts, 2);
        assert_eq!(settings.schemas, vec!["public"]);
        assert!(!settings.create_missing_tables);
        assert_eq!(
            settings.exclude_tables,
            vec![TableName::new("public", "audit_log")]
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let settings = MigrationSettings {
            workers: 0,
            ..MigrationSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_engine_config_mapping() {
        let config = MigrationSettings::default().engine_config();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.retry_backoff, Duration::from_millis(200));
    }
}
