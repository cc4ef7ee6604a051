//! Session persistence and restore.
//!
//! Core guarantees exercised here:
//! - Every transition is persisted and the latest session survives a restart.
//! - A session persisted mid-flight is restored as failed with kind
//!   `Interrupted`.
//! - Secrets never reach disk.
//! - A slow save never holds up readers of the session.

use dmo_core::prelude::*;
use dmo_core::session::{SessionId, SessionRecord, WorkflowSession};
use dmo_core::store::{FileSessionStore, MemorySessionStore, SessionStore, StoreError};
use dmo_kernel::logging::{LogLevel, SessionLog};
use dmo_kernel::ErrorKind;
use dmo_test_utils::{
    customers_schema, descriptors, fast_settings, orders_schema, source_and_destination,
    InMemoryConnector, ScriptedAdvisory, StaticAdvisoryConnector,
};
use pretty_assertions::assert_eq;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Memory store whose first save waits until the test releases it
struct GatedStore {
    inner: MemorySessionStore,
    armed: AtomicBool,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl SessionStore for GatedStore {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
        self.inner.save(record)
    }

    fn load(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.load(id)
    }

    fn load_latest(&self) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.load_latest()
    }

    fn list(&self) -> Result<Vec<SessionId>, StoreError> {
        self.inner.list()
    }
}

fn controller(store: Arc<dyn SessionStore>) -> WorkflowController {
    let (source, destination) =
        source_and_destination(&[(customers_schema(), 25), (orders_schema(), 25)]);
    let connector = InMemoryConnector::new()
        .with_database("source", source)
        .with_database("destination", destination);
    WorkflowController::builder(
        Arc::new(connector),
        Arc::new(StaticAdvisoryConnector(Arc::new(ScriptedAdvisory::approving()))),
    )
    .with_settings(fast_settings())
    .with_store(store)
    .build()
    .unwrap()
}

fn record_at(stage: WorkflowStage) -> SessionRecord {
    let mut session = WorkflowSession::new(&descriptors());
    session.stage = stage;
    let log = SessionLog::new();
    log.append(LogLevel::Info, stage, None, "Stage entered");
    SessionRecord {
        session,
        logs: log.entries(),
    }
}

#[tokio::test]
async fn completed_session_survives_restart() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::open(dir.path()).unwrap());

    let first = controller(Arc::clone(&store));
    first.configure(descriptors()).await.unwrap();
    let id = first.start().unwrap();
    first.wait_until_settled().await;
    first.approve().unwrap();
    assert_eq!(first.wait_until_settled().await, WorkflowStage::Completed);
    let logs = first.logs();

    let restarted = controller(Arc::new(FileSessionStore::open(dir.path()).unwrap()));
    let status = restarted.status();
    assert_eq!(status.session_id, Some(id));
    assert_eq!(status.stage, WorkflowStage::Completed);
    assert!(!status.configured);
    assert_eq!(status.tables.len(), 2);
    let restored_logs = restarted.logs();
    assert!(!restored_logs.is_empty());
    assert!(logs.starts_with(&restored_logs));
    restarted.verify_log().unwrap();
    assert_eq!(restarted.all_reports().len(), 4);

    // Read-only until configured again
    assert!(matches!(restarted.start(), Err(WorkflowError::NotConfigured)));
}

#[tokio::test]
async fn live_session_is_restored_as_interrupted() {
    let store = Arc::new(MemorySessionStore::new());
    let record = record_at(WorkflowStage::Executing);
    let id = record.session.id;
    store.save(&record).unwrap();

    let restored = controller(store.clone());
    assert_eq!(restored.stage(), WorkflowStage::Failed);
    let failure = restored.status().failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::Interrupted);
    assert_eq!(failure.stage, WorkflowStage::Executing);
    restored.verify_log().unwrap();
    assert_eq!(restored.logs().len(), 2);

    // The interruption itself is persisted
    let saved = store.load(id).unwrap().unwrap();
    assert_eq!(saved.session.stage, WorkflowStage::Failed);
}

#[tokio::test]
async fn awaiting_approval_is_not_resumed() {
    let store = Arc::new(MemorySessionStore::new());
    store.save(&record_at(WorkflowStage::AwaitingApproval)).unwrap();

    let restored = controller(store);
    assert_eq!(restored.stage(), WorkflowStage::Failed);
    assert!(restored.approve().is_err());
}

#[tokio::test]
async fn secrets_never_reach_disk() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::open(dir.path()).unwrap());
    let ctl = controller(store);
    let id = ctl.configure(descriptors()).await.unwrap();
    ctl.start().unwrap();
    ctl.wait_until_settled().await;

    let json = fs::read_to_string(dir.path().join(format!("{id}.json"))).unwrap();
    assert!(json.contains("awaiting_approval"));
    for secret in ["source-secret", "destination-secret", "advisory-secret"] {
        assert!(!json.contains(secret), "{secret} leaked to disk");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_save_does_not_block_readers() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let store = Arc::new(GatedStore {
        inner: MemorySessionStore::new(),
        armed: AtomicBool::new(true),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let ctl = controller(store.clone());

    let configuring = tokio::spawn({
        let ctl = ctl.clone();
        async move { ctl.configure(descriptors()).await }
    });
    tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();

    // The save is parked; reading the session must not wait for it
    let reader = ctl.clone();
    let status = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::task::spawn_blocking(move || reader.status()),
    )
    .await;
    release_tx.send(()).unwrap();

    let status = status.expect("status() waited for the store").unwrap();
    assert_eq!(status.stage, WorkflowStage::Idle);
    assert!(status.configured);
    let id = configuring.await.unwrap().unwrap();
    assert_eq!(status.session_id, Some(id));
    let saved = store.inner.load(id).unwrap().unwrap();
    assert_eq!(saved.session.stage, WorkflowStage::Idle);
}

#[test]
fn file_store_lists_and_reloads_sessions() {
    let dir = TempDir::new().unwrap();
    let store = FileSessionStore::open(dir.path().join("state")).unwrap();
    assert!(store.load_latest().unwrap().is_none());

    let a = record_at(WorkflowStage::Completed);
    let b = record_at(WorkflowStage::Denied);
    store.save(&a).unwrap();
    store.save(&b).unwrap();

    let mut expected = vec![a.session.id, b.session.id];
    expected.sort();
    assert_eq!(store.list().unwrap(), expected);
    let latest = store.load_latest().unwrap().unwrap();
    assert_eq!(latest.session.id, b.session.id);
    assert_eq!(latest.session.stage, WorkflowStage::Denied);
    assert_eq!(latest.logs, b.logs);
    // Passwords are not persisted
    assert!(latest.session.source.password.is_empty());

    let reloaded = store.load(a.session.id).unwrap().unwrap();
    assert_eq!(reloaded.session.stage, WorkflowStage::Completed);
}

#[test]
fn dangling_latest_pointer_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let store = FileSessionStore::open(dir.path()).unwrap();
    let record = record_at(WorkflowStage::Completed);
    store.save(&record).unwrap();
    fs::remove_file(dir.path().join(format!("{}.json", record.session.id))).unwrap();

    assert!(matches!(store.load_latest(), Err(StoreError::Corrupt(_))));
}
