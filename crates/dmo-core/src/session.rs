//! The workflow session and its read-only views.

use crate::descriptor::{AdvisoryDescriptor, ConnectionDescriptor, Descriptors};
use crate::report::{StageFailure, StageReports};
use chrono::{DateTime, Utc};
use dmo_kernel::logging::LogEntry;
use dmo_kernel::state_machine::WorkflowStage;
use dmo_kernel::unit::{TableMigrationUnit, TableStatus};
use dmo_kernel::TableName;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The human decision at the approval gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Execution allowed
    Approved {
        /// When
        at: DateTime<Utc>,
    },
    /// Execution refused
    Denied {
        /// When
        at: DateTime<Utc>,
        /// Operator-supplied reason
        reason: Option<String>,
    },
}

/// A single migration workflow, from configuration to its terminal stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    /// Identifier
    pub id: SessionId,
    /// Current stage
    pub stage: WorkflowStage,
    /// Source database
    pub source: ConnectionDescriptor,
    /// Destination database
    pub destination: ConnectionDescriptor,
    /// Advisory service
    pub advisory: AdvisoryDescriptor,
    /// Stage reports
    pub reports: StageReports,
    /// Decision at the gate
    pub approval: Option<ApprovalDecision>,
    /// Whether `cancel` was called
    pub cancel_requested: bool,
    /// Failure that ended the session
    pub failure: Option<StageFailure>,
    /// Advisory narrative over the finished execution
    #[serde(default)]
    pub final_report: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSession {
    /// Fresh idle session
    #[must_use]
    pub fn new(descriptors: &Descriptors) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            stage: WorkflowStage::Idle,
            source: descriptors.source.clone(),
            destination: descriptors.destination.clone(),
            advisory: descriptors.advisory.clone(),
            reports: StageReports::default(),
            approval: None,
            cancel_requested: false,
            failure: None,
            final_report: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Descriptors the session was created with (secrets included only if
    /// the session was never persisted)
    #[must_use]
    pub fn descriptors(&self) -> Descriptors {
        Descriptors {
            source: self.source.clone(),
            destination: self.destination.clone(),
            advisory: self.advisory.clone(),
        }
    }
}

/// A session together with its log, the unit of persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session state
    pub session: WorkflowSession,
    /// Append-only log
    pub logs: Vec<LogEntry>,
}

/// Live progress of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProgress {
    /// Table
    pub table: TableName,
    /// Plan level
    pub level: usize,
    /// Status
    pub status: TableStatus,
    /// Attempts started
    pub attempts: u32,
    /// Rows written by the current attempt
    pub rows_copied: u64,
    /// Discovery estimate
    pub estimated_rows: u64,
    /// Last error message
    pub last_error: Option<String>,
}

impl From<&TableMigrationUnit> for TableProgress {
    fn from(unit: &TableMigrationUnit) -> Self {
        Self {
            table: unit.table.clone(),
            level: unit.level,
            status: unit.status,
            attempts: unit.attempts,
            rows_copied: unit.rows_copied,
            estimated_rows: unit.estimated_rows,
            last_error: unit.last_error.as_ref().map(ToString::to_string),
        }
    }
}

/// Pull-based view of the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Current session, if configured
    pub session_id: Option<SessionId>,
    /// Current stage
    pub stage: WorkflowStage,
    /// Whether live connections are held
    pub configured: bool,
    /// Decision at the gate
    pub approval: Option<ApprovalDecision>,
    /// Failure that ended the session
    pub failure: Option<StageFailure>,
    /// Per-table progress, plan order
    pub tables: Vec<TableProgress>,
    /// Log entries so far
    pub log_entries: usize,
}

impl StatusSnapshot {
    /// Progress of one table
    #[must_use]
    pub fn table(&self, table: &TableName) -> Option<&TableProgress> {
        self.tables.iter().find(|t| &t.table == table)
    }
}
