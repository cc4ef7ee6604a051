//! Workflow controller
//!
//! [`WorkflowController`] owns the single live session behind one lock and
//! sequences the stages on background tasks:
//!
//! - `configure` checks the descriptors and prepares an idle session
//! - `start` runs discovery, validation and generation, then suspends at
//!   `AwaitingApproval` without holding a task
//! - `approve` launches execution; `deny` (or the approval timeout) ends the
//!   session
//! - `cancel` trips the session's token; the running stage fails with kind
//!   `Cancelled` once it notices
//!
//! Every transition is appended to the session log, persisted when a store
//! is configured, and then published on a watch channel. The session is
//! snapshotted under the state lock; saving and publishing happen after the
//! lock is released, in snapshot order.

use crate::advisory::{AdvisoryGateway, ExecutionDigest, RetryingAdvisory};
use crate::connector::{AdvisoryConnector, DatabaseConnector};
use crate::descriptor::Descriptors;
use crate::error::WorkflowError;
use crate::progress::{ProgressBoard, SessionObserver};
use crate::report::{Finding, StageFailure, StageKind, StageRecord, StageReport};
use crate::session::{
    ApprovalDecision, SessionId, SessionRecord, StatusSnapshot, WorkflowSession,
};
use crate::settings::MigrationSettings;
use crate::stages::{self, StageContext};
use crate::store::SessionStore;
use chrono::Utc;
use dmo_kernel::engine::{ExecutionEngine, ExecutionOutcome, ExecutionReport};
use dmo_kernel::gateway::DbGateway;
use dmo_kernel::logging::{LogEntry, LogLevel, SessionLog};
use dmo_kernel::planner::MigrationPlan;
use dmo_kernel::state_machine::{validate_transition, WorkflowStage};
use dmo_kernel::unit::{TableMigrationUnit, TableStatus};
use dmo_kernel::{ErrorKind, LogError, StateMachineError, TableName};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Live connections of a configured session
#[derive(Clone)]
struct Wiring {
    source: Arc<dyn DbGateway>,
    destination: Arc<dyn DbGateway>,
    advisory: Arc<dyn AdvisoryGateway>,
}

/// Snapshots waiting to be saved and published once the lock is released
struct Pending {
    revision: u64,
    stage: WorkflowStage,
    records: Vec<SessionRecord>,
}

struct State {
    session: Option<WorkflowSession>,
    wiring: Option<Wiring>,
    log: Arc<SessionLog>,
    board: Arc<ProgressBoard>,
    cancel: CancellationToken,
    approval_timer: Option<CancellationToken>,
    revision: u64,
    pending: Option<Pending>,
}

impl State {
    fn empty() -> Self {
        Self {
            session: None,
            wiring: None,
            log: Arc::new(SessionLog::new()),
            board: Arc::new(ProgressBoard::new()),
            cancel: CancellationToken::new(),
            approval_timer: None,
            revision: 0,
            pending: None,
        }
    }

    fn stage(&self) -> WorkflowStage {
        self.session
            .as_ref()
            .map_or(WorkflowStage::Idle, |s| s.stage)
    }

    fn is_current(&self, id: SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == id)
    }

    /// Swap in a new session with a clean log, board and token
    fn replace_session(&mut self, session: WorkflowSession) {
        self.disarm_approval_timer();
        self.cancel.cancel();
        self.session = Some(session);
        self.log = Arc::new(SessionLog::new());
        self.board = Arc::new(ProgressBoard::new());
        self.cancel = CancellationToken::new();
    }

    fn disarm_approval_timer(&mut self) {
        if let Some(timer) = self.approval_timer.take() {
            timer.cancel();
        }
    }
}

/// Highest revision already flushed, overall and per session
#[derive(Default)]
struct Flushed {
    published: u64,
    saved: HashMap<SessionId, u64>,
}

struct Inner {
    databases: Arc<dyn DatabaseConnector>,
    advisories: Arc<dyn AdvisoryConnector>,
    settings: MigrationSettings,
    store: Option<Arc<dyn SessionStore>>,
    state: Mutex<State>,
    flushed: Mutex<Flushed>,
    stage_tx: watch::Sender<WorkflowStage>,
}

/// Lock on the session state for changes. Dropping it releases the lock
/// first, then saves and publishes whatever [`Inner::publish`] queued.
struct StateGuard<'a> {
    inner: &'a Inner,
    guard: MutexGuard<'a, State>,
}

impl Deref for StateGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        &mut self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let Some(pending) = self.guard.pending.take() else {
            return;
        };
        let inner = self.inner;
        MutexGuard::unlocked(&mut self.guard, || inner.flush(pending));
    }
}

impl Inner {
    fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            inner: self,
            guard: self.state.lock(),
        }
    }

    /// Move the session to `to`, log it, persist it and publish it
    fn advance(&self, state: &mut State, to: WorkflowStage) -> Result<(), StateMachineError> {
        let from = state.stage();
        validate_transition(from, to)?;
        if let Some(session) = state.session.as_mut() {
            session.stage = to;
            session.updated_at = Utc::now();
        }
        let level = if to == WorkflowStage::Failed {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        state.log.append(level, to, None, format!("Stage {from} -> {to}"));
        self.publish(state);
        Ok(())
    }

    fn fail(&self, state: &mut State, failure: StageFailure) {
        if let Some(session) = state.session.as_mut() {
            session.failure = Some(failure);
        }
        if let Err(err) = self.advance(state, WorkflowStage::Failed) {
            tracing::error!("Could not fail the session: {}", err);
        }
    }

    /// Snapshot the session for saving and publish its stage once the lock
    /// is released
    fn publish(&self, state: &mut State) {
        state.revision += 1;
        let record = match (&self.store, &state.session) {
            (Some(_), Some(session)) => Some(SessionRecord {
                session: session.clone(),
                logs: state.log.entries(),
            }),
            _ => None,
        };
        let stage = state.stage();
        let pending = state.pending.get_or_insert_with(|| Pending {
            revision: 0,
            stage,
            records: Vec::new(),
        });
        pending.revision = state.revision;
        pending.stage = stage;
        if let Some(record) = record {
            // A later snapshot of the same session supersedes an earlier one
            if pending
                .records
                .last()
                .is_some_and(|last| last.session.id == record.session.id)
            {
                pending.records.pop();
            }
            pending.records.push(record);
        }
    }

    /// Save and publish a snapshot unless a newer one got there first
    fn flush(&self, pending: Pending) {
        let mut flushed = self.flushed.lock();
        if let Some(store) = &self.store {
            for record in &pending.records {
                let id = record.session.id;
                if flushed.saved.get(&id).is_some_and(|&rev| rev >= pending.revision) {
                    continue;
                }
                match store.save(record) {
                    Ok(()) => {
                        flushed.saved.insert(id, pending.revision);
                    }
                    Err(err) => tracing::error!("Failed to persist session {}: {}", id, err),
                }
            }
        }
        if pending.revision > flushed.published {
            flushed.published = pending.revision;
            self.stage_tx.send_replace(pending.stage);
        }
    }

    /// Attach a stage record and advance to `next` on success. Returns the
    /// stage output when the workflow should continue.
    fn conclude<T: Clone>(
        &self,
        id: SessionId,
        cancel: &CancellationToken,
        record: StageRecord<T>,
        wrap: fn(StageRecord<T>) -> StageReport,
        next: WorkflowStage,
    ) -> Option<T> {
        let mut state = self.lock();
        if !state.is_current(id) {
            tracing::warn!("Session {} was replaced; dropping its stage result", id);
            return None;
        }
        let current = state.stage();
        let result = match record.result.clone() {
            Ok(_) if cancel.is_cancelled() => Err(StageFailure::cancelled(current)),
            other => other,
        };
        if let Some(session) = state.session.as_mut() {
            if let Err(err) = session.reports.attach(wrap(record)) {
                tracing::error!("Session {}: {}", id, err);
            }
        }

        match result {
            Ok(output) => match self.advance(&mut state, next) {
                Ok(()) => Some(output),
                Err(err) => {
                    tracing::error!("Session {}: {}", id, err);
                    None
                }
            },
            Err(failure) => {
                self.fail(&mut state, failure);
                None
            }
        }
    }

    fn deny(
        &self,
        state: &mut State,
        command: &'static str,
        reason: Option<String>,
    ) -> Result<(), WorkflowError> {
        let stage = state.stage();
        if stage != WorkflowStage::AwaitingApproval {
            return Err(WorkflowError::InvalidState { command, stage });
        }
        state.disarm_approval_timer();
        let message = match &reason {
            Some(reason) => format!("Plan denied: {reason}"),
            None => "Plan denied".to_string(),
        };
        state.log.append(LogLevel::Warn, stage, None, message);
        if let Some(session) = state.session.as_mut() {
            session.approval = Some(ApprovalDecision::Denied {
                at: Utc::now(),
                reason,
            });
        }
        self.advance(state, WorkflowStage::Denied)?;
        Ok(())
    }

    fn expire_approval(&self, id: SessionId, timeout: Duration) {
        let mut state = self.lock();
        if !state.is_current(id) || state.stage() != WorkflowStage::AwaitingApproval {
            return;
        }
        tracing::warn!("Approval of session {} timed out after {:?}", id, timeout);
        if let Err(err) = self.deny(&mut state, "deny", Some("approval timed out".to_string())) {
            tracing::error!("Session {}: {}", id, err);
        }
    }

    fn finish_execution(
        &self,
        id: SessionId,
        report: ExecutionReport,
        mut findings: Vec<Finding>,
        final_report: Option<String>,
    ) {
        let mut state = self.lock();
        if !state.is_current(id) {
            tracing::warn!("Session {} was replaced; dropping its execution report", id);
            return;
        }

        for unit in &report.tables {
            let detail = || {
                unit.last_error
                    .as_ref()
                    .map_or_else(|| unit.status.to_string(), ToString::to_string)
            };
            match unit.status {
                TableStatus::Failed => findings.push(Finding::error(Some(&unit.table), detail())),
                TableStatus::Cancelled => {
                    findings.push(Finding::warning(Some(&unit.table), detail()));
                }
                _ => {}
            }
        }
        let summary = format!(
            "execution {}: {} succeeded, {} failed, {} cancelled, {} rows copied",
            report.outcome,
            report.count(TableStatus::Succeeded),
            report.count(TableStatus::Failed),
            report.count(TableStatus::Cancelled),
            report.rows_copied()
        );
        state
            .log
            .append(LogLevel::Info, WorkflowStage::Executing, None, summary.clone());
        findings.push(Finding::info(None, summary));

        let failure = if report.cancelled && report.outcome != ExecutionOutcome::Completed {
            Some(StageFailure::cancelled(WorkflowStage::Executing))
        } else if report.outcome == ExecutionOutcome::Failed {
            Some(match report.first_failure() {
                Some(err) => StageFailure::new(
                    WorkflowStage::Executing,
                    err.kind,
                    format!("no table succeeded; first failure: {err}"),
                ),
                None => StageFailure::new(
                    WorkflowStage::Executing,
                    ErrorKind::Database,
                    "no table succeeded",
                ),
            })
        } else {
            None
        };

        let record = StageRecord {
            started_at: report.started_at,
            finished_at: report.finished_at,
            findings,
            result: Ok(report),
        };
        if let Some(session) = state.session.as_mut() {
            if let Err(err) = session.reports.attach(StageReport::Execution(record)) {
                tracing::error!("Session {}: {}", id, err);
            }
            session.final_report = final_report;
        }

        match failure {
            Some(failure) => self.fail(&mut state, failure),
            None => {
                if let Err(err) = self.advance(&mut state, WorkflowStage::Completed) {
                    tracing::error!("Session {}: {}", id, err);
                }
            }
        }
    }
}

/// Builder for [`WorkflowController`]
pub struct ControllerBuilder {
    databases: Arc<dyn DatabaseConnector>,
    advisories: Arc<dyn AdvisoryConnector>,
    settings: MigrationSettings,
    store: Option<Arc<dyn SessionStore>>,
}

impl ControllerBuilder {
    /// Builder: migration settings
    #[must_use]
    pub fn with_settings(mut self, settings: MigrationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Builder: persist sessions and restore the latest one on build
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate settings and restore the latest persisted session, if any.
    ///
    /// A restored session is read-only until `configure` replaces it. One
    /// that was persisted in a live stage is marked `Failed` with kind
    /// `Interrupted`.
    pub fn build(self) -> Result<WorkflowController, WorkflowError> {
        self.settings.validate()?;

        let mut state = State::empty();
        let mut interrupted = false;
        if let Some(store) = &self.store {
            if let Some(record) = store.load_latest()? {
                interrupted = restore(&mut state, record);
            }
        }

        let (stage_tx, _) = watch::channel(state.stage());
        let inner = Arc::new(Inner {
            databases: self.databases,
            advisories: self.advisories,
            settings: self.settings,
            store: self.store,
            state: Mutex::new(state),
            flushed: Mutex::new(Flushed::default()),
            stage_tx,
        });
        if interrupted {
            inner.publish(&mut inner.lock());
        }
        Ok(WorkflowController { inner })
    }
}

/// Load `record` into `state`; returns whether it had to be interrupted
fn restore(state: &mut State, record: SessionRecord) -> bool {
    let SessionRecord { mut session, logs } = record;
    let log = SessionLog::from_entries(logs);
    if let Err(err) = log.verify_integrity() {
        tracing::warn!("Restored log of session {} failed verification: {}", session.id, err);
    }

    let interrupted = session.stage.is_live();
    if interrupted {
        let failure = StageFailure::new(
            session.stage,
            ErrorKind::Interrupted,
            format!("process stopped while the session was {}", session.stage),
        );
        log.append(LogLevel::Warn, WorkflowStage::Failed, None, failure.message.clone());
        session.failure = Some(failure);
        session.stage = WorkflowStage::Failed;
        session.updated_at = Utc::now();
    }

    let board = ProgressBoard::new();
    if let Some(report) = session.reports.execution() {
        for unit in &report.tables {
            board.update(unit);
        }
    }
    tracing::info!("Restored session {} ({})", session.id, session.stage);

    state.session = Some(session);
    state.log = Arc::new(log);
    state.board = Arc::new(board);
    interrupted
}

/// Owner of the live migration session.
///
/// Cheap to clone; clones share the session. `start` and `approve` spawn
/// onto the ambient tokio runtime.
#[derive(Clone)]
pub struct WorkflowController {
    inner: Arc<Inner>,
}

impl WorkflowController {
    /// Start building a controller
    pub fn builder(
        databases: Arc<dyn DatabaseConnector>,
        advisories: Arc<dyn AdvisoryConnector>,
    ) -> ControllerBuilder {
        ControllerBuilder {
            databases,
            advisories,
            settings: MigrationSettings::default(),
            store: None,
        }
    }

    /// Effective settings
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &MigrationSettings {
        &self.inner.settings
    }

    /// Open and check both databases and the advisory service, then prepare
    /// a fresh idle session. Nothing changes if a check fails.
    pub async fn configure(&self, descriptors: Descriptors) -> Result<SessionId, WorkflowError> {
        self.ensure_not_live("configure")?;

        let source = self
            .inner
            .databases
            .connect(&descriptors.source)
            .await
            .map_err(|source| WorkflowError::Connectivity {
                endpoint: "source",
                source,
            })?;
        source
            .test_connection()
            .await
            .map_err(|source| WorkflowError::Connectivity {
                endpoint: "source",
                source,
            })?;
        let destination = self
            .inner
            .databases
            .connect(&descriptors.destination)
            .await
            .map_err(|source| WorkflowError::Connectivity {
                endpoint: "destination",
                source,
            })?;
        destination
            .test_connection()
            .await
            .map_err(|source| WorkflowError::Connectivity {
                endpoint: "destination",
                source,
            })?;
        let advisory: Arc<dyn AdvisoryGateway> = Arc::new(RetryingAdvisory::new(
            self.inner.advisories.connect(&descriptors.advisory)?,
            self.inner.settings.retry_policy(),
        ));
        advisory.check_health().await?;

        let mut state = self.inner.lock();
        let stage = state.stage();
        if stage.is_live() {
            return Err(WorkflowError::InvalidState {
                command: "configure",
                stage,
            });
        }
        let session = WorkflowSession::new(&descriptors);
        let id = session.id;
        state.replace_session(session);
        state.wiring = Some(Wiring {
            source,
            destination,
            advisory,
        });
        state.log.append(
            LogLevel::Info,
            WorkflowStage::Idle,
            None,
            format!(
                "Session configured: source {}, destination {}, advisory {}",
                descriptors.source.redacted(),
                descriptors.destination.redacted(),
                descriptors.advisory.endpoint
            ),
        );
        self.inner.publish(&mut state);
        drop(state);
        tracing::info!("Session {} configured", id);
        Ok(id)
    }

    /// Begin a run. From a terminal stage a fresh session is created with
    /// the same connections.
    pub fn start(&self) -> Result<SessionId, WorkflowError> {
        let mut state = self.inner.lock();
        let stage = state.stage();
        if !stage.accepts_start() {
            return Err(WorkflowError::InvalidState {
                command: "start",
                stage,
            });
        }
        let (Some(wiring), Some(session)) = (state.wiring.clone(), state.session.as_ref()) else {
            return Err(WorkflowError::NotConfigured);
        };
        if stage != WorkflowStage::Idle {
            let previous = session.id;
            let fresh = WorkflowSession::new(&session.descriptors());
            state.replace_session(fresh);
            state.log.append(
                LogLevel::Info,
                WorkflowStage::Idle,
                None,
                format!("Session created after {previous}"),
            );
        }

        let Some(session) = state.session.as_ref() else {
            return Err(WorkflowError::NotConfigured);
        };
        let id = session.id;
        let ctx = StageContext {
            source: wiring.source,
            destination: wiring.destination,
            advisory: wiring.advisory,
            settings: self.inner.settings.clone(),
            source_endpoint: session.source.redacted(),
            destination_endpoint: session.destination.redacted(),
            log: Arc::clone(&state.log),
            cancel: state.cancel.clone(),
        };
        self.inner.advance(&mut state, WorkflowStage::Discovering)?;
        drop(state);

        tracing::info!("Session {} started", id);
        tokio::spawn(prepare(Arc::clone(&self.inner), id, ctx));
        Ok(id)
    }

    /// Release the approval gate and launch execution
    pub fn approve(&self) -> Result<(), WorkflowError> {
        let mut state = self.inner.lock();
        let stage = state.stage();
        if stage != WorkflowStage::AwaitingApproval {
            return Err(WorkflowError::InvalidState {
                command: "approve",
                stage,
            });
        }
        let plan = state
            .session
            .as_ref()
            .and_then(|s| s.reports.generation())
            .map(|g| g.plan.clone());
        let to_create: BTreeSet<TableName> = state
            .session
            .as_ref()
            .and_then(|s| s.reports.validation())
            .map(|v| v.to_create().cloned().collect())
            .unwrap_or_default();
        let (Some(plan), Some(wiring), Some(id)) = (
            plan,
            state.wiring.clone(),
            state.session.as_ref().map(|s| s.id),
        ) else {
            return Err(WorkflowError::NotConfigured);
        };

        state.disarm_approval_timer();
        state
            .log
            .append(LogLevel::Info, stage, None, "Plan approved");
        if let Some(session) = state.session.as_mut() {
            session.approval = Some(ApprovalDecision::Approved { at: Utc::now() });
        }
        self.inner.advance(&mut state, WorkflowStage::Approved)?;
        let log = Arc::clone(&state.log);
        let board = Arc::clone(&state.board);
        let cancel = state.cancel.clone();
        drop(state);

        tokio::spawn(execute(
            Arc::clone(&self.inner),
            id,
            wiring,
            Approved {
                plan,
                to_create,
            },
            log,
            board,
            cancel,
        ));
        Ok(())
    }

    /// Refuse the plan; the engine never runs
    pub fn deny(&self, reason: Option<String>) -> Result<(), WorkflowError> {
        let mut state = self.inner.lock();
        self.inner.deny(&mut state, "deny", reason)
    }

    /// Request cooperative cancellation of the running stage
    pub fn cancel(&self) -> Result<(), WorkflowError> {
        let mut state = self.inner.lock();
        let stage = state.stage();
        if !stage.is_working() {
            return Err(WorkflowError::InvalidState {
                command: "cancel",
                stage,
            });
        }
        if let Some(session) = state.session.as_mut() {
            session.cancel_requested = true;
            session.updated_at = Utc::now();
        }
        state
            .log
            .append(LogLevel::Warn, stage, None, "Cancellation requested");
        state.cancel.cancel();
        self.inner.publish(&mut state);
        Ok(())
    }

    /// Archive the current session. Running work is cancelled and its
    /// results are discarded; a configured controller gets a fresh idle
    /// session with the same connections.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        state.cancel.cancel();
        state.disarm_approval_timer();
        let Some(session) = state.session.as_ref() else {
            return;
        };
        let (archived, stage, descriptors) = (session.id, session.stage, session.descriptors());
        state
            .log
            .append(LogLevel::Info, stage, None, "Session archived");
        self.inner.publish(&mut state);

        if state.wiring.is_some() {
            state.replace_session(WorkflowSession::new(&descriptors));
            state.log.append(
                LogLevel::Info,
                WorkflowStage::Idle,
                None,
                format!("Session created after reset of {archived}"),
            );
        } else {
            state.session = None;
            state.log = Arc::new(SessionLog::new());
            state.board = Arc::new(ProgressBoard::new());
            state.cancel = CancellationToken::new();
        }
        self.inner.publish(&mut state);
        drop(state);
        tracing::info!("Session {} archived", archived);
    }

    /// Current stage
    #[must_use]
    pub fn stage(&self) -> WorkflowStage {
        self.inner.state.lock().stage()
    }

    /// Pull-based snapshot of stage and per-table progress
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let state = self.inner.state.lock();
        let session = state.session.as_ref();
        StatusSnapshot {
            session_id: session.map(|s| s.id),
            stage: state.stage(),
            configured: state.wiring.is_some(),
            approval: session.and_then(|s| s.approval.clone()),
            failure: session.and_then(|s| s.failure.clone()),
            tables: state.board.snapshot(),
            log_entries: state.log.len(),
        }
    }

    /// Copy of the current session
    #[must_use]
    pub fn session(&self) -> Option<WorkflowSession> {
        self.inner.state.lock().session.clone()
    }

    /// Every log entry of the current session
    #[must_use]
    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.state.lock().log.entries()
    }

    /// Log entries from sequence number `seq` on
    #[must_use]
    pub fn logs_since(&self, seq: u64) -> Vec<LogEntry> {
        self.inner.state.lock().log.since(seq)
    }

    /// Check the hash chain of the current session log
    pub fn verify_log(&self) -> Result<(), LogError> {
        self.inner.state.lock().log.verify_integrity()
    }

    /// Report of one stage, if produced
    #[must_use]
    pub fn report(&self, kind: StageKind) -> Option<StageReport> {
        let state = self.inner.state.lock();
        state
            .session
            .as_ref()
            .and_then(|s| s.reports.get(kind))
            .cloned()
    }

    /// Every report produced so far, in workflow order
    #[must_use]
    pub fn all_reports(&self) -> Vec<StageReport> {
        let state = self.inner.state.lock();
        state
            .session
            .as_ref()
            .map(|s| s.reports.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Push-based stage changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WorkflowStage> {
        self.inner.stage_tx.subscribe()
    }

    /// Wait until the stage satisfies `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> WorkflowStage
    where
        F: FnMut(WorkflowStage) -> bool,
    {
        let mut rx = self.subscribe();
        let reached = rx.wait_for(|stage| predicate(*stage)).await.map(|stage| *stage);
        match reached {
            Ok(stage) => stage,
            Err(_) => self.stage(),
        }
    }

    /// Wait until no background work is running: the approval gate, a
    /// terminal stage, or idle
    pub async fn wait_until_settled(&self) -> WorkflowStage {
        self.wait_for(|stage| !stage.is_working()).await
    }

    fn ensure_not_live(&self, command: &'static str) -> Result<(), WorkflowError> {
        let stage = self.stage();
        if stage.is_live() {
            return Err(WorkflowError::InvalidState { command, stage });
        }
        Ok(())
    }
}

/// Discovery, validation and generation, up to the approval gate
async fn prepare(inner: Arc<Inner>, id: SessionId, ctx: StageContext) {
    let record = stages::discover(&ctx).await;
    let mut findings = record.findings.clone();
    let Some(discovery) = inner.conclude(
        id,
        &ctx.cancel,
        record,
        StageReport::Discovery,
        WorkflowStage::Validating,
    ) else {
        return;
    };

    let record = stages::validate(&ctx, &discovery).await;
    findings.extend(record.findings.iter().cloned());
    let Some(validation) = inner.conclude(
        id,
        &ctx.cancel,
        record,
        StageReport::Validation,
        WorkflowStage::Generating,
    ) else {
        return;
    };

    let record = stages::generate(&ctx, &discovery, &validation, findings).await;
    if inner
        .conclude(
            id,
            &ctx.cancel,
            record,
            StageReport::Generation,
            WorkflowStage::AwaitingApproval,
        )
        .is_some()
    {
        arm_approval_timeout(&inner, id);
    }
}

fn arm_approval_timeout(inner: &Arc<Inner>, id: SessionId) {
    let Some(timeout) = inner.settings.approval_timeout() else {
        return;
    };
    let timer = CancellationToken::new();
    {
        let mut state = inner.state.lock();
        if !state.is_current(id) || state.stage() != WorkflowStage::AwaitingApproval {
            return;
        }
        state.disarm_approval_timer();
        state.approval_timer = Some(timer.clone());
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::select! {
            () = timer.cancelled() => {}
            () = tokio::time::sleep(timeout) => inner.expire_approval(id, timeout),
        }
    });
}

/// What the operator approved
struct Approved {
    plan: MigrationPlan,
    /// Destination tables to create before the copy
    to_create: BTreeSet<TableName>,
}

async fn execute(
    inner: Arc<Inner>,
    id: SessionId,
    wiring: Wiring,
    approved: Approved,
    log: Arc<SessionLog>,
    board: Arc<ProgressBoard>,
    cancel: CancellationToken,
) {
    {
        let mut state = inner.lock();
        if !state.is_current(id) {
            return;
        }
        if cancel.is_cancelled() {
            inner.fail(&mut state, StageFailure::cancelled(WorkflowStage::Approved));
            return;
        }
        if let Err(err) = inner.advance(&mut state, WorkflowStage::Executing) {
            tracing::error!("Session {}: {}", id, err);
            return;
        }
    }

    let Approved { plan, to_create } = approved;
    for (level, tables) in plan.levels().iter().enumerate() {
        for planned in tables {
            board.update(&TableMigrationUnit::from_planned(planned, level));
        }
    }
    let findings =
        create_tables(wiring.destination.as_ref(), &plan, &to_create, &log, &cancel).await;

    let engine = ExecutionEngine::new(
        Arc::clone(&wiring.source),
        Arc::clone(&wiring.destination),
        inner.settings.engine_config(),
    )
    .with_observer(Arc::new(SessionObserver::new(Arc::clone(&log), board)));
    let report = engine.run(&plan, &cancel).await;

    let final_report = final_report(wiring.advisory.as_ref(), &report, &log, &cancel).await;
    inner.finish_execution(id, report, findings, final_report);
}

/// Create the approved missing tables, parents first. A table that cannot
/// be created is left for the engine to fail.
async fn create_tables(
    destination: &dyn DbGateway,
    plan: &MigrationPlan,
    to_create: &BTreeSet<TableName>,
    log: &SessionLog,
    cancel: &CancellationToken,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    let planned = plan
        .levels()
        .iter()
        .flatten()
        .filter(|t| to_create.contains(t.name()));
    for table in planned {
        if cancel.is_cancelled() {
            break;
        }
        let name = table.name();
        match destination.create_table(&table.schema).await {
            Ok(()) => {
                let message = "created in the destination";
                log.append(LogLevel::Info, WorkflowStage::Executing, Some(name), message);
                findings.push(Finding::info(Some(name), message));
            }
            Err(err) => {
                let message = format!("could not create the table: {err}");
                log.append(
                    LogLevel::Error,
                    WorkflowStage::Executing,
                    Some(name),
                    message.clone(),
                );
                findings.push(Finding::error(Some(name), message));
            }
        }
    }
    findings
}

/// Closing narrative from the advisory service. Skipped after a cancel;
/// a failure is logged and never changes the outcome.
async fn final_report(
    advisory: &dyn AdvisoryGateway,
    report: &ExecutionReport,
    log: &SessionLog,
    cancel: &CancellationToken,
) -> Option<String> {
    if cancel.is_cancelled() {
        return None;
    }
    let digest = ExecutionDigest::from_report(report);
    let answer = tokio::select! {
        () = cancel.cancelled() => return None,
        answer = advisory.summarize(&digest) => answer,
    };
    match answer {
        Ok(text) => {
            log.append(
                LogLevel::Info,
                WorkflowStage::Executing,
                None,
                "advisory final report received",
            );
            Some(text)
        }
        Err(err) => {
            log.append(
                LogLevel::Warn,
                WorkflowStage::Executing,
                None,
                format!("advisory final report unavailable: {err}"),
            );
            None
        }
    }
}
