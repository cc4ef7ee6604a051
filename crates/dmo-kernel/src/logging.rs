//! Append-only session log.
//!
//! Every entry is chained to its predecessor by SHA-256 so a persisted log
//! can be checked for tampering after a restart. Appends are mirrored to
//! `tracing` at the matching level.

use crate::error::LogError;
use crate::state_machine::WorkflowStage;
use crate::types::TableName;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Batch-level detail
    Debug,
    /// Transitions and outcomes
    Info,
    /// Retries and findings
    Warn,
    /// Failures
    Error,
}

impl LogLevel {
    fn as_u8(self) -> u8 {
        match self {
            Self::Debug => 0,
            Self::Info => 1,
            Self::Warn => 2,
            Self::Error => 3,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

/// One line of the session log, chained to the entry before it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 0
    pub seq: u64,
    /// When the entry was appended
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Stage the session was in
    pub stage: WorkflowStage,
    /// Table the entry concerns, if any
    pub table: Option<TableName>,
    /// Free text
    pub message: String,
    /// `hash` of the previous entry, zeroes for the first
    pub prev_hash: [u8; 32],
    /// SHA-256 over `prev_hash` and this entry's content
    pub hash: [u8; 32],
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<5} [{}]",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.level,
            self.stage
        )?;
        if let Some(table) = &self.table {
            write!(f, " {table}:")?;
        }
        write!(f, " {}", self.message)
    }
}

/// Hash-chained log shared by every stage of one session.
///
/// Appends take an internal lock, so a `&SessionLog` can be handed to
/// concurrent workers.
#[derive(Debug, Default)]
pub struct SessionLog {
    inner: Mutex<Vec<LogEntry>>,
}

impl SessionLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries. Integrity is not checked here; call
    /// [`SessionLog::verify_integrity`].
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            inner: Mutex::new(entries),
        }
    }

    /// Append an entry and return its sequence number
    pub fn append(
        &self,
        level: LogLevel,
        stage: WorkflowStage,
        table: Option<&TableName>,
        message: impl Into<String>,
    ) -> u64 {
        let message = message.into();
        let table_name = table.map(TableName::qualified);
        match level {
            LogLevel::Debug => tracing::debug!(stage = %stage, table = ?table_name, "{message}"),
            LogLevel::Info => tracing::info!(stage = %stage, table = ?table_name, "{message}"),
            LogLevel::Warn => tracing::warn!(stage = %stage, table = ?table_name, "{message}"),
            LogLevel::Error => tracing::error!(stage = %stage, table = ?table_name, "{message}"),
        }

        let mut guard = self.inner.lock();
        let (seq, prev_hash) = guard
            .last()
            .map_or((0, [0u8; 32]), |e| (e.seq + 1, e.hash));
        let mut entry = LogEntry {
            seq,
            timestamp: Utc::now(),
            level,
            stage,
            table: table.cloned(),
            message,
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);
        guard.push(entry);
        seq
    }

    /// Copy of every entry
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().clone()
    }

    /// Entries with `seq >= from`
    pub fn since(&self, from: u64) -> Vec<LogEntry> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.seq >= from)
            .cloned()
            .collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// No entries yet
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Check the whole chain, see [`verify_chain`]
    pub fn verify_integrity(&self) -> Result<(), LogError> {
        verify_chain(&self.inner.lock())
    }
}

/// Check a sequence of entries, e.g. one loaded from disk
pub fn verify_chain(entries: &[LogEntry]) -> Result<(), LogError> {
    let mut prev = [0u8; 32];
    for (expected_seq, e) in (0u64..).zip(entries) {
        if e.seq != expected_seq || e.prev_hash != prev || e.hash != compute_hash(e) {
            return Err(LogError::IntegrityViolation { seq: e.seq });
        }
        prev = e.hash;
    }
    Ok(())
}

fn compute_hash(entry: &LogEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.timestamp.timestamp().to_le_bytes());
    hasher.update(entry.timestamp.timestamp_subsec_nanos().to_le_bytes());
    hasher.update([entry.level.as_u8()]);
    hasher.update(entry.stage.as_str().as_bytes());
    hasher.update([0]);
    if let Some(table) = &entry.table {
        hasher.update(table.qualified().as_bytes());
    }
    hasher.update([0]);
    hasher.update(entry.message.as_bytes());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}
