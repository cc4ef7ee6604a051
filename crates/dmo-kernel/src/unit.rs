//! Per-table unit of migration work.

use crate::checksum::TableChecksum;
use crate::error::{ErrorKind, TableError};
use crate::planner::PlannedTable;
use crate::types::TableName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle of one table inside an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    /// Waiting for a worker (or for a retry)
    Pending,
    /// Copying batches
    Running,
    /// Comparing counts and checksums
    Verifying,
    /// Committed and verified
    Succeeded,
    /// Out of attempts or non-retryable failure
    Failed,
    /// Never attempted, or aborted by cancellation
    Cancelled,
}

impl TableStatus {
    /// Terminal statuses are never left
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Statuses reachable from `self`
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [TableStatus] {
        use TableStatus::{Cancelled, Failed, Pending, Running, Succeeded, Verifying};
        match self {
            Pending => &[Running, Cancelled],
            Running => &[Verifying, Pending, Failed, Cancelled],
            Verifying => &[Succeeded, Pending, Failed, Cancelled],
            Succeeded | Failed | Cancelled => &[],
        }
    }

    /// Whether `self -> to` is legal
    #[must_use]
    pub fn can_transition_to(self, to: TableStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Verifying => "verifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One table's migration state, owned by exactly one engine worker at a time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMigrationUnit {
    /// Qualified table name
    pub table: TableName,
    /// Tables that must succeed first
    pub depends_on: BTreeSet<TableName>,
    /// Plan level, 0-based
    pub level: usize,
    /// Discovery-time row count
    pub estimated_rows: u64,
    /// Current status
    pub status: TableStatus,
    /// Attempts started so far
    pub attempts: u32,
    /// Most recent failure
    pub last_error: Option<TableError>,
    /// Rows written by the current (or final) attempt
    pub rows_copied: u64,
    /// Source checksum of the last verification
    pub source_checksum: Option<TableChecksum>,
    /// Destination checksum of the last verification
    pub dest_checksum: Option<TableChecksum>,
    /// When the first attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the unit reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

impl TableMigrationUnit {
    /// Fresh pending unit for a planned table
    #[must_use]
    pub fn from_planned(planned: &PlannedTable, level: usize) -> Self {
        Self {
            table: planned.name().clone(),
            depends_on: planned.depends_on.clone(),
            level,
            estimated_rows: planned.estimated_rows,
            status: TableStatus::Pending,
            attempts: 0,
            last_error: None,
            rows_copied: 0,
            source_checksum: None,
            dest_checksum: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `to`; a transition outside the table is a bug in the engine
    pub fn advance(&mut self, to: TableStatus) {
        debug_assert!(
            self.status.can_transition_to(to),
            "illegal table transition {} -> {} for {}",
            self.status,
            to,
            self.table
        );
        if !self.status.can_transition_to(to) {
            tracing::warn!(
                "Ignoring illegal table transition {} -> {} for {}",
                self.status,
                to,
                self.table
            );
            return;
        }
        self.status = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Mark cancelled with a reason recorded as the last error
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.last_error = Some(TableError::new(
            self.table.clone(),
            self.attempts,
            ErrorKind::Cancelled,
            reason,
        ));
        self.advance(TableStatus::Cancelled);
    }

    /// Whether the unit ended successfully
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == TableStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for status in [TableStatus::Succeeded, TableStatus::Failed, TableStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(status.allowed_transitions().is_empty());
        }
    }

    #[test]
    fn test_retry_path_returns_to_pending() {
        assert!(TableStatus::Running.can_transition_to(TableStatus::Pending));
        assert!(TableStatus::Verifying.can_transition_to(TableStatus::Pending));
        assert!(!TableStatus::Pending.can_transition_to(TableStatus::Succeeded));
    }
}
