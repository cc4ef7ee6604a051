//! Per-table progress board and the engine observer that feeds it.

use crate::session::TableProgress;
use dashmap::DashMap;
use dmo_kernel::engine::{EngineEvent, EngineObserver};
use dmo_kernel::logging::{LogLevel, SessionLog};
use dmo_kernel::state_machine::WorkflowStage;
use dmo_kernel::unit::TableMigrationUnit;
use dmo_kernel::TableName;
use std::sync::Arc;

/// Latest progress of every table, written by engine workers and read by
/// `status()`
#[derive(Debug, Default)]
pub struct ProgressBoard {
    tables: DashMap<TableName, TableProgress>,
}

impl ProgressBoard {
    /// Empty board
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a unit snapshot
    pub fn update(&self, unit: &TableMigrationUnit) {
        self.tables.insert(unit.table.clone(), TableProgress::from(unit));
    }

    /// Snapshot sorted by level, then name
    #[must_use]
    pub fn snapshot(&self) -> Vec<TableProgress> {
        let mut tables: Vec<TableProgress> =
            self.tables.iter().map(|entry| entry.value().clone()).collect();
        tables.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.table.cmp(&b.table)));
        tables
    }

    /// Number of tables tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Mirrors engine progress into the session log and the progress board
pub(crate) struct SessionObserver {
    log: Arc<SessionLog>,
    board: Arc<ProgressBoard>,
}

impl SessionObserver {
    pub(crate) fn new(log: Arc<SessionLog>, board: Arc<ProgressBoard>) -> Self {
        Self { log, board }
    }
}

impl EngineObserver for SessionObserver {
    fn on_event(&self, event: &EngineEvent) {
        let level = match event {
            EngineEvent::BatchWritten { .. } | EngineEvent::Verifying { .. } => LogLevel::Debug,
            EngineEvent::AttemptFailed { .. } | EngineEvent::TableCancelled { .. } => {
                LogLevel::Warn
            }
            EngineEvent::TableFailed { .. } => LogLevel::Error,
            _ => LogLevel::Info,
        };
        self.log
            .append(level, WorkflowStage::Executing, event.table(), event.to_string());
    }

    fn on_unit(&self, unit: &TableMigrationUnit) {
        self.board.update(unit);
    }
}
