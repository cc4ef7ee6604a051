//! Progress notifications emitted by the engine.

use crate::error::TableError;
use crate::types::TableName;
use crate::unit::TableMigrationUnit;
use std::fmt;

/// Something the engine did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Level workers scheduled
    LevelStarted {
        /// 0-based level
        level: usize,
        /// Tables of the level in name order
        tables: Vec<TableName>,
    },
    /// Every table of the level reached a terminal status
    LevelFinished {
        /// 0-based level
        level: usize,
    },
    /// A worker began an attempt
    TableStarted {
        /// Table
        table: TableName,
        /// 1-based attempt
        attempt: u32,
    },
    /// One batch landed in the destination transaction
    BatchWritten {
        /// Table
        table: TableName,
        /// 1-based attempt
        attempt: u32,
        /// 1-based batch number within the attempt
        batch: u64,
        /// Rows in this batch
        rows: usize,
        /// Rows copied so far in this attempt
        rows_copied: u64,
    },
    /// Counts and checksums are being compared
    Verifying {
        /// Table
        table: TableName,
        /// 1-based attempt
        attempt: u32,
    },
    /// An attempt failed and was rolled back
    AttemptFailed {
        /// The failure
        error: TableError,
        /// Whether another attempt follows
        will_retry: bool,
    },
    /// Table committed and verified
    TableSucceeded {
        /// Table
        table: TableName,
        /// Attempts used
        attempts: u32,
        /// Rows copied
        rows_copied: u64,
    },
    /// Table gave up
    TableFailed {
        /// Final failure
        error: TableError,
    },
    /// Table never ran or was aborted
    TableCancelled {
        /// Table
        table: TableName,
        /// Why
        reason: String,
    },
}

impl EngineEvent {
    /// Table the event concerns, if any
    #[must_use]
    pub fn table(&self) -> Option<&TableName> {
        match self {
            Self::LevelStarted { .. } | Self::LevelFinished { .. } => None,
            Self::TableStarted { table, .. }
            | Self::BatchWritten { table, .. }
            | Self::Verifying { table, .. }
            | Self::TableSucceeded { table, .. }
            | Self::TableCancelled { table, .. } => Some(table),
            Self::AttemptFailed { error, .. } | Self::TableFailed { error } => Some(&error.table),
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LevelStarted { level, tables } => {
                write!(f, "level {level} started with {} tables", tables.len())
            }
            Self::LevelFinished { level } => write!(f, "level {level} finished"),
            Self::TableStarted { attempt, .. } => write!(f, "attempt {attempt} started"),
            Self::BatchWritten {
                attempt,
                batch,
                rows,
                rows_copied,
                ..
            } => write!(
                f,
                "attempt {attempt}: batch {batch} wrote {rows} rows ({rows_copied} total)"
            ),
            Self::Verifying { attempt, .. } => {
                write!(f, "attempt {attempt}: verifying row count and checksum")
            }
            Self::AttemptFailed { error, will_retry } => write!(
                f,
                "attempt {} failed ({}): {}; rolled back{}",
                error.attempt,
                error.kind,
                error.message,
                if *will_retry { ", retrying" } else { "" }
            ),
            Self::TableSucceeded {
                attempts,
                rows_copied,
                ..
            } => write!(
                f,
                "succeeded after {attempts} attempt(s), {rows_copied} rows copied"
            ),
            Self::TableFailed { error } => write!(
                f,
                "failed after {} attempt(s): {}: {}",
                error.attempt, error.kind, error.message
            ),
            Self::TableCancelled { reason, .. } => write!(f, "cancelled: {reason}"),
        }
    }
}

/// Receives engine progress. Both hooks are called from worker tasks and
/// must not block.
pub trait EngineObserver: Send + Sync {
    /// Called for every event
    fn on_event(&self, event: &EngineEvent) {
        let _ = event;
    }

    /// Called with a snapshot whenever a unit changes status or progress
    fn on_unit(&self, unit: &TableMigrationUnit) {
        let _ = unit;
    }
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl EngineObserver for NoopObserver {}
