//! Stage runners
//!
//! Each working stage is an async function that takes a [`StageContext`]
//! and returns a finished [`StageRecord`]. Runners never touch the session;
//! the controller attaches their records and decides the next stage.
//!
//! - `discovery`: inventories of both databases
//! - `validation`: compatibility verdicts and a rolled-back sample copy
//! - `generation`: dependency plan and advisory assessment

mod discovery;
mod generation;
mod validation;

pub(crate) use discovery::discover;
pub(crate) use generation::generate;
pub(crate) use validation::validate;

use crate::advisory::AdvisoryGateway;
use crate::report::{Finding, Severity, StageFailure, StageRecord};
use crate::settings::MigrationSettings;
use chrono::{DateTime, Utc};
use dmo_kernel::gateway::DbGateway;
use dmo_kernel::logging::{LogLevel, SessionLog};
use dmo_kernel::state_machine::WorkflowStage;
use dmo_kernel::{GatewayError, TableName};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a stage runner may use
pub(crate) struct StageContext {
    pub(crate) source: Arc<dyn DbGateway>,
    pub(crate) destination: Arc<dyn DbGateway>,
    pub(crate) advisory: Arc<dyn AdvisoryGateway>,
    pub(crate) settings: MigrationSettings,
    pub(crate) source_endpoint: String,
    pub(crate) destination_endpoint: String,
    pub(crate) log: Arc<SessionLog>,
    pub(crate) cancel: CancellationToken,
}

/// Book-keeping for one stage run
pub(crate) struct StageRun {
    stage: WorkflowStage,
    log: Arc<SessionLog>,
    started_at: DateTime<Utc>,
    findings: Vec<Finding>,
}

impl StageRun {
    pub(crate) fn new(ctx: &StageContext, stage: WorkflowStage) -> Self {
        ctx.log
            .append(LogLevel::Info, stage, None, format!("{stage} started"));
        Self {
            stage,
            log: Arc::clone(&ctx.log),
            started_at: Utc::now(),
            findings: Vec::new(),
        }
    }

    /// Record a finding and mirror it into the session log
    pub(crate) fn note(&mut self, finding: Finding) {
        let level = match finding.severity {
            Severity::Info => LogLevel::Info,
            Severity::Warning => LogLevel::Warn,
            Severity::Error => LogLevel::Error,
        };
        self.log
            .append(level, self.stage, finding.table.as_ref(), finding.message.clone());
        self.findings.push(finding);
    }

    /// Progress entry that is not a finding
    pub(crate) fn progress(&self, table: Option<&TableName>, message: impl Into<String>) {
        self.log.append(LogLevel::Info, self.stage, table, message);
    }

    pub(crate) fn gateway_failure(&self, context: &str, err: &GatewayError) -> StageFailure {
        StageFailure::new(self.stage, err.kind(), format!("{context}: {err}"))
    }

    pub(crate) fn finish<T>(self, result: Result<T, StageFailure>) -> StageRecord<T> {
        match &result {
            Ok(_) => self
                .log
                .append(LogLevel::Info, self.stage, None, format!("{} finished", self.stage)),
            Err(failure) => self
                .log
                .append(LogLevel::Error, self.stage, None, failure.to_string()),
        };
        StageRecord {
            started_at: self.started_at,
            finished_at: Utc::now(),
            findings: self.findings,
            result,
        }
    }
}

/// Run `work` unless `cancel` fires first
pub(crate) async fn cancellable<T, F>(
    cancel: &CancellationToken,
    stage: WorkflowStage,
    work: F,
) -> Result<T, StageFailure>
where
    F: Future<Output = Result<T, StageFailure>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StageFailure::cancelled(stage)),
        result = work => result,
    }
}
