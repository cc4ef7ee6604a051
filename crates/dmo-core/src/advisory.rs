//! Advisory service contract
//!
//! The advisory service reads a structured summary of the planned
//! migration and answers with a risk level, a recommendation and a
//! narrative. It is only advice: the human decision at the approval gate
//! is what moves the workflow.
//!
//! Once execution ends the service is asked once more, for a closing
//! narrative over an [`ExecutionDigest`]. That report is informational and
//! never changes the outcome.
//!
//! [`RetryingAdvisory`] wraps any gateway with bounded retries and
//! exponential backoff, and reports [`AdvisoryError::Unavailable`] once
//! they are used up.

use crate::report::{DiscoveryOutput, Finding, SampleExecution, ValidationOutput};
use async_trait::async_trait;
use dmo_kernel::engine::{ExecutionOutcome, ExecutionReport};
use dmo_kernel::planner::MigrationPlan;
use dmo_kernel::unit::TableStatus;
use dmo_kernel::{ErrorKind, TableName};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Assessed risk of running the migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// Likely to cause harm
    High,
    /// Needs attention
    Medium,
    /// Routine
    Low,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        })
    }
}

/// What the advisory service suggests the human decide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    /// Proceed
    Approve,
    /// Do not proceed
    Deny,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Approve => "APPROVE",
            Self::Deny => "DENY",
        })
    }
}

/// The advisory answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    /// Risk level
    pub risk_level: RiskLevel,
    /// Suggested decision
    pub recommendation: Recommendation,
    /// Free-form reasoning
    pub narrative: String,
}

/// One database as the advisory service sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSummary {
    /// Redacted endpoint
    pub endpoint: String,
    /// Server version
    pub version: String,
    /// Tables discovered
    pub table_count: usize,
    /// Rows across those tables
    pub total_rows: u64,
}

/// The plan as the advisory service sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Table names per level
    pub levels: Vec<Vec<TableName>>,
    /// Tables planned
    pub table_count: usize,
    /// Rows expected to move
    pub estimated_rows: u64,
}

/// Structured input for an assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryContext {
    /// Source database
    pub source: DatabaseSummary,
    /// Destination database
    pub destination: DatabaseSummary,
    /// Execution plan
    pub plan: PlanSummary,
    /// Findings from discovery and validation
    pub findings: Vec<Finding>,
    /// Result of the validation sample copy
    pub sample: Option<SampleExecution>,
}

impl AdvisoryContext {
    /// Summarise the earlier stages for the advisory service
    #[must_use]
    pub fn build(
        discovery: &DiscoveryOutput,
        validation: &ValidationOutput,
        findings: Vec<Finding>,
        plan: &MigrationPlan,
    ) -> Self {
        let summarize = |inventory: &crate::report::DatabaseInventory| DatabaseSummary {
            endpoint: inventory.endpoint.clone(),
            version: inventory.version.clone(),
            table_count: inventory.tables.len(),
            total_rows: inventory.tables.iter().map(|t| t.row_count).sum(),
        };
        Self {
            source: summarize(&discovery.source),
            destination: summarize(&discovery.destination),
            plan: PlanSummary {
                levels: plan
                    .levels()
                    .iter()
                    .map(|level| level.iter().map(|t| t.name().clone()).collect())
                    .collect(),
                table_count: plan.table_count(),
                estimated_rows: plan.total_estimated_rows(),
            },
            findings,
            sample: validation.sample.clone(),
        }
    }
}

/// Per-table line of an [`ExecutionDigest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDigest {
    /// Table
    pub table: TableName,
    /// Final status
    pub status: TableStatus,
    /// Rows committed
    pub rows_copied: u64,
    /// Attempts used
    pub attempts: u32,
    /// Last failure, if any
    pub error: Option<String>,
}

/// What the advisory service is told about a finished execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDigest {
    /// Overall outcome
    pub outcome: ExecutionOutcome,
    /// Whether cancellation was requested
    pub cancelled: bool,
    /// Rows committed across all tables
    pub rows_copied: u64,
    /// Execution time in milliseconds
    pub duration_ms: i64,
    /// One line per planned table
    pub tables: Vec<TableDigest>,
}

impl ExecutionDigest {
    /// Condense an engine report
    #[must_use]
    pub fn from_report(report: &ExecutionReport) -> Self {
        Self {
            outcome: report.outcome,
            cancelled: report.cancelled,
            rows_copied: report.rows_copied(),
            duration_ms: (report.finished_at - report.started_at).num_milliseconds(),
            tables: report
                .tables
                .iter()
                .map(|unit| TableDigest {
                    table: unit.table.clone(),
                    status: unit.status,
                    rows_copied: unit.rows_copied,
                    attempts: unit.attempts,
                    error: unit.last_error.as_ref().map(ToString::to_string),
                })
                .collect(),
        }
    }
}

/// Advisory failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdvisoryError {
    /// A single call exceeded its deadline
    #[error("advisory request timed out after {0:?}")]
    Timeout(Duration),

    /// Network or protocol failure
    #[error("advisory transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status
    #[error("advisory service returned {status}: {body}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// Response could not be understood
    #[error("invalid advisory response: {0}")]
    InvalidResponse(String),

    /// Retries exhausted
    #[error("advisory unavailable after {attempts} attempt(s): {last_error}")]
    Unavailable {
        /// Attempts made
        attempts: u32,
        /// Last underlying error
        last_error: String,
    },
}

impl AdvisoryError {
    /// Whether another attempt may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) | Self::InvalidResponse(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::Unavailable { .. } => false,
        }
    }

    /// Shared classification
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::AdvisoryUnavailable
    }
}

/// Remote advisory service
#[async_trait]
pub trait AdvisoryGateway: Send + Sync {
    /// Prove the service is reachable and the credentials work
    async fn check_health(&self) -> Result<(), AdvisoryError>;

    /// Assess a planned migration
    async fn assess(&self, context: &AdvisoryContext) -> Result<Assessment, AdvisoryError>;

    /// Closing narrative over a finished execution
    async fn summarize(&self, digest: &ExecutionDigest) -> Result<String, AdvisoryError>;
}

/// Retry tuning for [`RetryingAdvisory`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts, the first one included
    pub max_attempts: u32,
    /// Pause after the first failure; doubles after each further failure
    pub initial_backoff: Duration,
    /// Upper bound for a single pause
    pub max_backoff: Duration,
    /// Deadline for one call
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Retrying wrapper around any [`AdvisoryGateway`]
pub struct RetryingAdvisory {
    inner: Arc<dyn AdvisoryGateway>,
    policy: RetryPolicy,
}

impl RetryingAdvisory {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn AdvisoryGateway>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Effective policy
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, AdvisoryError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, AdvisoryError>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts < max_attempts {
            attempts += 1;
            let result = match tokio::time::timeout(self.policy.attempt_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(AdvisoryError::Timeout(self.policy.attempt_timeout)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(
                        "Advisory {} attempt {}/{} failed: {}",
                        operation,
                        attempts,
                        max_attempts,
                        err
                    );
                    let retryable = err.is_retryable();
                    last_error = err.to_string();
                    if !retryable {
                        break;
                    }
                    if attempts < max_attempts {
                        tokio::time::sleep(self.policy.backoff_after(attempts)).await;
                    }
                }
            }
        }

        tracing::error!("Advisory {} unavailable after {} attempt(s)", operation, attempts);
        Err(AdvisoryError::Unavailable {
            attempts,
            last_error,
        })
    }
}

#[async_trait]
impl AdvisoryGateway for RetryingAdvisory {
    async fn check_health(&self) -> Result<(), AdvisoryError> {
        self.call("health check", || self.inner.check_health()).await
    }

    async fn assess(&self, context: &AdvisoryContext) -> Result<Assessment, AdvisoryError> {
        self.call("assessment", || self.inner.assess(context)).await
    }

    async fn summarize(&self, digest: &ExecutionDigest) -> Result<String, AdvisoryError> {
        self.call("final report", || self.inner.summarize(digest)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: AdvisoryError,
    }

    #[async_trait]
    impl AdvisoryGateway for Flaky {
        async fn check_health(&self) -> Result<(), AdvisoryError> {
            Ok(())
        }

        async fn assess(&self, _context: &AdvisoryContext) -> Result<Assessment, AdvisoryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(Assessment {
                    risk_level: RiskLevel::Low,
                    recommendation: Recommendation::Approve,
                    narrative: "fine".into(),
                })
            }
        }

        async fn summarize(&self, _digest: &ExecutionDigest) -> Result<String, AdvisoryError> {
            Err(self.error.clone())
        }
    }

    fn context() -> AdvisoryContext {
        let db = DatabaseSummary {
            endpoint: "u@h:1/d".into(),
            version: "1".into(),
            table_count: 0,
            total_rows: 0,
        };
        AdvisoryContext {
            source: db.clone(),
            destination: db,
            plan: PlanSummary {
                levels: vec![],
                table_count: 0,
                estimated_rows: 0,
            },
            findings: vec![],
            sample: None,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    fn flaky(failures: u32, error: AdvisoryError) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
            error,
        })
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_after(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let inner = flaky(2, AdvisoryError::Transport("reset".into()));
        let client = RetryingAdvisory::new(inner.clone(), fast_policy());
        let assessment = client.assess(&context()).await.unwrap();
        assert_eq!(assessment.recommendation, Recommendation::Approve);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unavailable_after_three_attempts() {
        let inner = flaky(u32::MAX, AdvisoryError::Transport("refused".into()));
        let client = RetryingAdvisory::new(inner.clone(), fast_policy());
        let err = client.assess(&context()).await.unwrap_err();
        assert!(matches!(err, AdvisoryError::Unavailable { attempts: 3, .. }));
        assert_eq!(err.kind(), ErrorKind::AdvisoryUnavailable);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_final_report_shares_the_retry_budget() {
        let inner = flaky(0, AdvisoryError::Transport("reset".into()));
        let client = RetryingAdvisory::new(inner.clone(), fast_policy());
        let digest = ExecutionDigest {
            outcome: ExecutionOutcome::Completed,
            cancelled: false,
            rows_copied: 0,
            duration_ms: 0,
            tables: vec![],
        };
        let err = client.summarize(&digest).await.unwrap_err();
        assert!(matches!(err, AdvisoryError::Unavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let inner = flaky(
            u32::MAX,
            AdvisoryError::Rejected {
                status: 401,
                body: "bad key".into(),
            },
        );
        let client = RetryingAdvisory::new(inner.clone(), fast_policy());
        let err = client.assess(&context()).await.unwrap_err();
        assert!(matches!(err, AdvisoryError::Unavailable { attempts: 1, .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
