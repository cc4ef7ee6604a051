//! Stage reports
//!
//! Each working stage produces exactly one immutable report: timestamps,
//! findings, and either the stage's output or the failure that halted the
//! workflow. [`StageReports`] refuses to replace a report once attached.

use crate::advisory::Assessment;
use chrono::{DateTime, Utc};
use dmo_kernel::engine::ExecutionReport;
use dmo_kernel::planner::MigrationPlan;
use dmo_kernel::state_machine::WorkflowStage;
use dmo_kernel::{DiscoveredTable, ErrorKind, Row, TableName};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How much attention a finding deserves
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// For the record
    Info,
    /// May cause a table to fail
    Warning,
    /// Will cause a table to fail
    Error,
}

/// An observation recorded by a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Severity
    pub severity: Severity,
    /// Table concerned, if any
    pub table: Option<TableName>,
    /// Description
    pub message: String,
}

impl Finding {
    /// Informational finding
    pub fn info(table: Option<&TableName>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, table, message)
    }

    /// Warning finding
    pub fn warning(table: Option<&TableName>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, table, message)
    }

    /// Error finding
    pub fn error(table: Option<&TableName>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, table, message)
    }

    fn new(severity: Severity, table: Option<&TableName>, message: impl Into<String>) -> Self {
        Self {
            severity,
            table: table.cloned(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "[{:?}] {table}: {}", self.severity, self.message),
            None => write!(f, "[{:?}] {}", self.severity, self.message),
        }
    }
}

/// Why a stage halted the workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{stage} failed ({kind}): {message}")]
pub struct StageFailure {
    /// Stage that failed
    pub stage: WorkflowStage,
    /// Classification
    pub kind: ErrorKind,
    /// Detail
    pub message: String,
}

impl StageFailure {
    /// Create a failure
    pub fn new(stage: WorkflowStage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    /// Cancellation observed while `stage` was running
    #[must_use]
    pub fn cancelled(stage: WorkflowStage) -> Self {
        Self::new(stage, ErrorKind::Cancelled, "Cancelled")
    }
}

/// Timestamps, findings and outcome of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord<T> {
    /// Start
    pub started_at: DateTime<Utc>,
    /// End
    pub finished_at: DateTime<Utc>,
    /// Observations
    pub findings: Vec<Finding>,
    /// Output or failure
    pub result: Result<T, StageFailure>,
}

impl<T> StageRecord<T> {
    /// Output, if the stage succeeded
    pub fn output(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    /// Failure, if the stage failed
    pub fn failure(&self) -> Option<&StageFailure> {
        self.result.as_ref().err()
    }
}

/// One database's inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInventory {
    /// Redacted endpoint
    pub endpoint: String,
    /// Server version
    pub version: String,
    /// Every schema visible
    pub schemas: Vec<String>,
    /// Tables of the configured schemas
    pub tables: Vec<DiscoveredTable>,
}

impl DatabaseInventory {
    /// Look up a table
    #[must_use]
    pub fn table(&self, name: &TableName) -> Option<&DiscoveredTable> {
        self.tables.iter().find(|t| t.name() == name)
    }
}

/// Output of discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryOutput {
    /// Source inventory
    pub source: DatabaseInventory,
    /// Destination inventory
    pub destination: DatabaseInventory,
    /// Source tables with no destination counterpart
    pub missing_in_destination: Vec<TableName>,
}

/// Compatibility verdict for one source table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCompatibility {
    /// Table
    pub table: TableName,
    /// Whether rows can be written
    pub compatible: bool,
    /// Differences that may still work
    pub warnings: Vec<String>,
    /// Why the table is incompatible
    pub reason: Option<String>,
    /// Rows already present in the destination
    pub destination_rows: u64,
    /// Missing from the destination; created once the plan is approved
    #[serde(default)]
    pub create_on_approval: bool,
}

/// The rolled-back trial copy run during validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleExecution {
    /// Table sampled
    pub table: TableName,
    /// Rows written inside the trial transaction
    pub rows_written: u64,
    /// Whether the destination count matched inside the transaction
    pub verified: bool,
    /// First rows of the sample, for comparison
    pub preview: Vec<Row>,
}

/// Output of validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutput {
    /// Per-table verdicts, in name order
    pub tables: Vec<TableCompatibility>,
    /// Trial copy, absent when no table qualified
    pub sample: Option<SampleExecution>,
}

impl ValidationOutput {
    /// Tables that cannot be written
    pub fn incompatible(&self) -> impl Iterator<Item = &TableCompatibility> {
        self.tables.iter().filter(|t| !t.compatible)
    }

    /// Tables to create in the destination before the copy starts
    pub fn to_create(&self) -> impl Iterator<Item = &TableName> {
        self.tables
            .iter()
            .filter(|t| t.create_on_approval)
            .map(|t| &t.table)
    }
}

/// Output of generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Execution plan awaiting approval
    pub plan: MigrationPlan,
    /// Advisory answer
    pub assessment: Assessment,
}

/// Which stage a report belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Inventory
    Discovery,
    /// Compatibility and sample
    Validation,
    /// Plan and assessment
    Generation,
    /// Engine run
    Execution,
}

impl StageKind {
    /// All kinds in workflow order
    pub const ALL: [StageKind; 4] = [
        Self::Discovery,
        Self::Validation,
        Self::Generation,
        Self::Execution,
    ];

    /// Workflow stage that produces this report
    #[must_use]
    pub fn stage(self) -> WorkflowStage {
        match self {
            Self::Discovery => WorkflowStage::Discovering,
            Self::Validation => WorkflowStage::Validating,
            Self::Generation => WorkflowStage::Generating,
            Self::Execution => WorkflowStage::Executing,
        }
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Validation => "validation",
            Self::Generation => "generation",
            Self::Execution => "execution",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown stage `{s}`"))
    }
}

/// A stage's report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageReport {
    /// Discovery
    Discovery(StageRecord<DiscoveryOutput>),
    /// Validation
    Validation(StageRecord<ValidationOutput>),
    /// Generation
    Generation(StageRecord<GenerationOutput>),
    /// Execution
    Execution(StageRecord<ExecutionReport>),
}

impl StageReport {
    /// Which stage produced the report
    #[must_use]
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Discovery(_) => StageKind::Discovery,
            Self::Validation(_) => StageKind::Validation,
            Self::Generation(_) => StageKind::Generation,
            Self::Execution(_) => StageKind::Execution,
        }
    }

    /// Findings of the stage
    #[must_use]
    pub fn findings(&self) -> &[Finding] {
        match self {
            Self::Discovery(r) => &r.findings,
            Self::Validation(r) => &r.findings,
            Self::Generation(r) => &r.findings,
            Self::Execution(r) => &r.findings,
        }
    }

    /// Failure, if the stage failed
    #[must_use]
    pub fn failure(&self) -> Option<&StageFailure> {
        match self {
            Self::Discovery(r) => r.failure(),
            Self::Validation(r) => r.failure(),
            Self::Generation(r) => r.failure(),
            Self::Execution(r) => r.failure(),
        }
    }

    /// Start and end times
    #[must_use]
    pub fn period(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            Self::Discovery(r) => (r.started_at, r.finished_at),
            Self::Validation(r) => (r.started_at, r.finished_at),
            Self::Generation(r) => (r.started_at, r.finished_at),
            Self::Execution(r) => (r.started_at, r.finished_at),
        }
    }
}

/// Attaching a second report for the same stage
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} report already attached")]
pub struct ReportAlreadyAttached(pub StageKind);

/// The four report slots of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReports {
    discovery: Option<StageReport>,
    validation: Option<StageReport>,
    generation: Option<StageReport>,
    execution: Option<StageReport>,
}

impl StageReports {
    fn slot(&mut self, kind: StageKind) -> &mut Option<StageReport> {
        match kind {
            StageKind::Discovery => &mut self.discovery,
            StageKind::Validation => &mut self.validation,
            StageKind::Generation => &mut self.generation,
            StageKind::Execution => &mut self.execution,
        }
    }

    /// Store a report; each slot is written once
    pub fn attach(&mut self, report: StageReport) -> Result<(), ReportAlreadyAttached> {
        let kind = report.kind();
        let slot = self.slot(kind);
        if slot.is_some() {
            return Err(ReportAlreadyAttached(kind));
        }
        *slot = Some(report);
        Ok(())
    }

    /// Report of `kind`
    #[must_use]
    pub fn get(&self, kind: StageKind) -> Option<&StageReport> {
        match kind {
            StageKind::Discovery => self.discovery.as_ref(),
            StageKind::Validation => self.validation.as_ref(),
            StageKind::Generation => self.generation.as_ref(),
            StageKind::Execution => self.execution.as_ref(),
        }
    }

    /// Attached reports in workflow order
    pub fn iter(&self) -> impl Iterator<Item = &StageReport> {
        [
            &self.discovery,
            &self.validation,
            &self.generation,
            &self.execution,
        ]
        .into_iter()
        .flatten()
    }

    /// Number of attached reports
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether nothing is attached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validation output, when validation succeeded
    #[must_use]
    pub fn validation(&self) -> Option<&ValidationOutput> {
        match &self.validation {
            Some(StageReport::Validation(record)) => record.output(),
            _ => None,
        }
    }

    /// Generation output, when generation succeeded
    #[must_use]
    pub fn generation(&self) -> Option<&GenerationOutput> {
        match &self.generation {
            Some(StageReport::Generation(record)) => record.output(),
            _ => None,
        }
    }

    /// Execution report, when execution ran
    #[must_use]
    pub fn execution(&self) -> Option<&ExecutionReport> {
        match &self.execution {
            Some(StageReport::Execution(record)) => record.output(),
            _ => None,
        }
    }
}
