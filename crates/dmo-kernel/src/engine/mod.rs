//! Execution engine
//!
//! Runs a [`MigrationPlan`] level by level:
//! - every table of a level is handed to a worker, at most
//!   [`EngineConfig::workers`] copying at once
//! - the next level starts only after the whole level is terminal
//! - a table whose dependency did not succeed is cancelled, never attempted
//! - cancellation stops workers at their next batch boundary and cancels
//!   everything not yet started

mod observer;
mod worker;

pub use observer::{EngineEvent, EngineObserver, NoopObserver};

use crate::error::{ErrorKind, PlanError, TableError};
use crate::gateway::DbGateway;
use crate::planner::{DependencyPlanner, MigrationPlan};
use crate::types::{DiscoveredTable, TableName};
use crate::unit::{TableMigrationUnit, TableStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use worker::TableWorker;

/// Default rows per batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Default attempts per table, the first one included
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
/// Default concurrent table workers
pub const DEFAULT_WORKERS: usize = 4;

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rows per keyset batch
    pub batch_size: usize,
    /// Attempts per table, the first one included
    pub max_attempts: u32,
    /// Tables copied concurrently within a level
    pub workers: usize,
    /// Pause before a retry
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            workers: DEFAULT_WORKERS,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl EngineConfig {
    /// Builder: rows per batch
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder: attempts per table
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builder: worker pool size
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Builder: pause before a retry
    #[must_use]
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    fn normalized(&self) -> Self {
        Self {
            batch_size: self.batch_size.max(1),
            max_attempts: self.max_attempts.max(1),
            workers: self.workers.max(1),
            retry_backoff: self.retry_backoff,
        }
    }
}

/// Overall result of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Every table succeeded
    Completed,
    /// Some tables succeeded, some failed or were cancelled
    PartialFailure,
    /// No table succeeded, or planning failed
    Failed,
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
        })
    }
}

/// Final state of every table, in plan order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Overall result
    pub outcome: ExecutionOutcome,
    /// Whether cancellation was requested while running
    pub cancelled: bool,
    /// Every planned table with its terminal status
    pub tables: Vec<TableMigrationUnit>,
    /// Planning failure that prevented any copy
    pub plan_error: Option<PlanError>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    /// Look up a table
    #[must_use]
    pub fn unit(&self, table: &TableName) -> Option<&TableMigrationUnit> {
        self.tables.iter().find(|u| &u.table == table)
    }

    /// Number of tables with `status`
    #[must_use]
    pub fn count(&self, status: TableStatus) -> usize {
        self.tables.iter().filter(|u| u.status == status).count()
    }

    /// Rows committed by succeeded tables
    #[must_use]
    pub fn rows_copied(&self) -> u64 {
        self.tables
            .iter()
            .filter(|u| u.succeeded())
            .map(|u| u.rows_copied)
            .sum()
    }

    /// First failed table's error, in plan order
    #[must_use]
    pub fn first_failure(&self) -> Option<&TableError> {
        self.tables
            .iter()
            .filter(|u| u.status == TableStatus::Failed)
            .find_map(|u| u.last_error.as_ref())
    }

    fn outcome_of(tables: &[TableMigrationUnit]) -> ExecutionOutcome {
        let succeeded = tables.iter().filter(|u| u.succeeded()).count();
        if succeeded == tables.len() {
            ExecutionOutcome::Completed
        } else if succeeded > 0 {
            ExecutionOutcome::PartialFailure
        } else {
            ExecutionOutcome::Failed
        }
    }
}

/// Copies tables between two gateways according to a plan
pub struct ExecutionEngine {
    source: Arc<dyn DbGateway>,
    destination: Arc<dyn DbGateway>,
    config: EngineConfig,
    observer: Arc<dyn EngineObserver>,
}

impl ExecutionEngine {
    /// Create an engine
    pub fn new(
        source: Arc<dyn DbGateway>,
        destination: Arc<dyn DbGateway>,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            destination,
            config: config.normalized(),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Builder: receive progress events
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Effective configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Plan `tables` and run the plan. A planning failure yields a `Failed`
    /// report without touching either database.
    pub async fn plan_and_run(
        &self,
        planner: &DependencyPlanner,
        tables: &[DiscoveredTable],
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        match planner.plan(tables) {
            Ok(plan) => self.run(&plan, cancel).await,
            Err(err) => {
                tracing::error!("Execution refused: {}", err);
                let now = Utc::now();
                ExecutionReport {
                    outcome: ExecutionOutcome::Failed,
                    cancelled: false,
                    tables: Vec::new(),
                    plan_error: Some(err),
                    started_at: now,
                    finished_at: now,
                }
            }
        }
    }

    /// Run `plan` to completion or cancellation
    pub async fn run(&self, plan: &MigrationPlan, cancel: &CancellationToken) -> ExecutionReport {
        let started_at = Utc::now();
        tracing::info!(
            "Execution started: {} tables in {} levels",
            plan.table_count(),
            plan.levels().len()
        );

        let mut units: BTreeMap<TableName, TableMigrationUnit> = plan
            .levels()
            .iter()
            .enumerate()
            .flat_map(|(level, tables)| {
                tables
                    .iter()
                    .map(move |t| (t.name().clone(), TableMigrationUnit::from_planned(t, level)))
            })
            .collect();
        let pool = Arc::new(Semaphore::new(self.config.workers));

        for (level, tables) in plan.levels().iter().enumerate() {
            self.observer.on_event(&EngineEvent::LevelStarted {
                level,
                tables: tables.iter().map(|t| t.name().clone()).collect(),
            });
            tracing::info!("Level {} started: {} tables", level, tables.len());

            let mut workers = JoinSet::new();
            let mut in_flight: BTreeMap<TableName, TableMigrationUnit> = BTreeMap::new();
            for planned in tables {
                let Some(mut unit) = units.remove(planned.name()) else {
                    continue;
                };
                if cancel.is_cancelled() {
                    self.cancel_unit(&mut unit, "migration cancelled before the table started".to_string());
                    units.insert(unit.table.clone(), unit);
                    continue;
                }
                let blocker = unit
                    .depends_on
                    .iter()
                    .find(|dep| units.get(*dep).is_some_and(|u| !u.succeeded()))
                    .cloned();
                if let Some(blocker) = blocker {
                    self.cancel_unit(&mut unit, format!("dependency {blocker} did not succeed"));
                    units.insert(unit.table.clone(), unit);
                    continue;
                }

                in_flight.insert(unit.table.clone(), unit.clone());
                let worker = TableWorker {
                    source: Arc::clone(&self.source),
                    destination: Arc::clone(&self.destination),
                    config: self.config.clone(),
                    observer: Arc::clone(&self.observer),
                    cancel: cancel.clone(),
                    schema: planned.schema.clone(),
                };
                workers.spawn(worker.run(unit, Arc::clone(&pool)));
            }

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(unit) => {
                        in_flight.remove(&unit.table);
                        units.insert(unit.table.clone(), unit);
                    }
                    Err(err) => tracing::error!("Table worker aborted: {}", err),
                }
            }
            // Anything still in flight lost its worker to a panic
            for (name, mut unit) in in_flight {
                let error = TableError::new(
                    name.clone(),
                    unit.attempts.max(1),
                    ErrorKind::Database,
                    "table worker aborted",
                );
                unit.status = TableStatus::Failed;
                unit.finished_at = Some(Utc::now());
                unit.last_error = Some(error.clone());
                self.observer.on_event(&EngineEvent::TableFailed { error });
                self.observer.on_unit(&unit);
                units.insert(name, unit);
            }

            self.observer.on_event(&EngineEvent::LevelFinished { level });
            tracing::info!("Level {} finished", level);
        }

        let tables: Vec<TableMigrationUnit> = plan
            .order()
            .iter()
            .filter_map(|name| units.remove(name))
            .collect();
        let outcome = ExecutionReport::outcome_of(&tables);
        tracing::info!("Execution finished: {}", outcome);
        ExecutionReport {
            outcome,
            cancelled: cancel.is_cancelled(),
            tables,
            plan_error: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn cancel_unit(&self, unit: &mut TableMigrationUnit, reason: String) {
        tracing::info!("Table {} cancelled: {}", unit.table, reason);
        unit.cancel(reason.clone());
        self.observer.on_event(&EngineEvent::TableCancelled {
            table: unit.table.clone(),
            reason,
        });
        self.observer.on_unit(unit);
    }
}
