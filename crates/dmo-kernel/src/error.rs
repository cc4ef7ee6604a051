//! Error taxonomy for the kernel
//!
//! - [`ErrorKind`]: the stable classification every failure maps to
//! - [`GatewayError`]: what a database gateway can report
//! - [`PlanError`]: dependency planning failures
//! - [`TableError`]: a failed attempt recorded against one table
//! - [`StateMachineError`]: illegal stage or status transitions

use crate::state_machine::WorkflowStage;
use crate::types::TableName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification shared by every error surfaced to an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A database could not be reached or dropped the connection
    Connectivity,
    /// Source and destination structures cannot be reconciled
    SchemaIncompatibility,
    /// Row count or checksum verification failed
    Integrity,
    /// Foreign keys form a cycle
    DependencyCycle,
    /// The advisory service failed after its retries
    AdvisoryUnavailable,
    /// A command arrived in a stage that does not accept it
    InvalidState,
    /// Work stopped because cancellation was requested
    Cancelled,
    /// Any other database error
    Database,
    /// Session persistence failed
    Storage,
    /// A session was found mid-flight after a restart
    Interrupted,
    /// Settings or descriptors are unusable
    Configuration,
}

impl ErrorKind {
    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::SchemaIncompatibility => "schema_incompatibility",
            Self::Integrity => "integrity",
            Self::DependencyCycle => "dependency_cycle",
            Self::AdvisoryUnavailable => "advisory_unavailable",
            Self::InvalidState => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::Database => "database",
            Self::Storage => "storage",
            Self::Interrupted => "interrupted",
            Self::Configuration => "configuration",
        }
    }

    /// Whether a table attempt failing with this kind may be retried
    #[inline]
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Connectivity | Self::Integrity | Self::Database)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by a [`crate::gateway::DbGateway`] or its writers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The database is unreachable or the connection broke
    #[error("connectivity: {0}")]
    Connectivity(String),

    /// Destination cannot accept the source structure
    #[error("schema incompatibility on {table}: {reason}")]
    SchemaIncompatible {
        /// Table being checked
        table: TableName,
        /// Human readable reason
        reason: String,
    },

    /// Table does not exist
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    /// Statement failed
    #[error("database error: {0}")]
    Database(String),
}

impl GatewayError {
    /// Map to the shared classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::SchemaIncompatible { .. } | Self::TableNotFound(_) => {
                ErrorKind::SchemaIncompatibility
            }
            Self::Database(_) => ErrorKind::Database,
        }
    }

    /// Whether retrying the same operation may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Dependency planning failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum PlanError {
    /// Foreign keys among the named tables form at least one cycle
    #[error("dependency cycle among tables: {}", join_names(tables))]
    DependencyCycle {
        /// Every table that sits on a cycle, sorted
        tables: Vec<TableName>,
    },
}

impl PlanError {
    /// Map to the shared classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DependencyCycle { .. } => ErrorKind::DependencyCycle,
        }
    }
}

fn join_names(tables: &[TableName]) -> String {
    tables
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure of one attempt at one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{table} (attempt {attempt}): {kind}: {message}")]
pub struct TableError {
    /// Table the attempt belonged to
    pub table: TableName,
    /// 1-based attempt number
    pub attempt: u32,
    /// Classification
    pub kind: ErrorKind,
    /// Detail
    pub message: String,
}

impl TableError {
    /// Create a table error
    pub fn new(table: TableName, attempt: u32, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            table,
            attempt,
            kind,
            message: message.into(),
        }
    }

    /// Wrap a gateway error raised during `attempt`
    #[must_use]
    pub fn from_gateway(table: TableName, attempt: u32, err: &GatewayError) -> Self {
        Self::new(table, attempt, err.kind(), err.to_string())
    }
}

/// Illegal transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Workflow stage change not in the transition table
    #[error("illegal workflow transition {from} -> {to}")]
    IllegalTransition {
        /// Current stage
        from: WorkflowStage,
        /// Requested stage
        to: WorkflowStage,
    },
}

/// Log chain verification failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// Entry `seq` does not link to its predecessor or its hash is wrong
    #[error("log integrity violation at entry {seq}")]
    IntegrityViolation {
        /// Sequence number of the first bad entry
        seq: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_kinds() {
        let t = TableName::new("public", "users");
        assert_eq!(
            GatewayError::Connectivity("reset".into()).kind(),
            ErrorKind::Connectivity
        );
        assert_eq!(
            GatewayError::TableNotFound(t.clone()).kind(),
            ErrorKind::SchemaIncompatibility
        );
        assert!(!GatewayError::SchemaIncompatible {
            table: t,
            reason: "x".into()
        }
        .is_retryable());
        assert!(GatewayError::Database("deadlock".into()).is_retryable());
    }

    #[test]
    fn test_cycle_message_lists_tables() {
        let err = PlanError::DependencyCycle {
            tables: vec![TableName::new("s", "a"), TableName::new("s", "b")],
        };
        assert_eq!(err.to_string(), "dependency cycle among tables: s.a, s.b");
        assert_eq!(err.kind(), ErrorKind::DependencyCycle);
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AdvisoryUnavailable).unwrap();
        assert_eq!(json, "\"advisory_unavailable\"");
    }
}
