//! SQLite gateway against real database files.
//!
//! Core guarantees exercised here:
//! - Introspection yields columns, keys and foreign keys the planner can use.
//! - Keyset paging visits every row exactly once, with or without a key.
//! - Writer transactions are invisible until commit and vanish on rollback.
//! - Concurrent workers writing one destination file take turns instead of
//!   failing on the file lock.
//! - A full approved workflow copies every table between two files.

use dmo_core::prelude::*;
use dmo_kernel::checksum::TableChecksum;
use dmo_kernel::engine::{EngineConfig, ExecutionEngine, ExecutionOutcome};
use dmo_kernel::gateway::{stream_batches, DbGateway};
use dmo_kernel::planner::DependencyPlanner;
use dmo_kernel::unit::TableStatus;
use dmo_kernel::{CancellationToken, DiscoveredTable, GatewayError, TableName};
use dmo_sqlite::{SqliteConnector, SqliteGateway, MAIN_SCHEMA};
use dmo_test_utils::{fast_settings, ScriptedAdvisory, StaticAdvisoryConnector};
use futures::TryStreamExt;
use pretty_assertions::assert_eq;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const SCHEMA: &str = "
    CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE orders (
        id INTEGER PRIMARY KEY,
        customer_id INTEGER NOT NULL REFERENCES customers(id),
        amount REAL
    );
    CREATE TABLE notes (body TEXT);
";

fn create(dir: &Path, name: &str, rows: i64) -> PathBuf {
    let path = dir.join(name);
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    for i in 1..=rows {
        conn.execute(
            "INSERT INTO customers (id, name) VALUES (?1, ?2)",
            (i, format!("customer-{i}")),
        )
        .unwrap();
        conn.execute(
            "INSERT INTO orders (id, customer_id, amount) VALUES (?1, ?2, ?3)",
            (i, i, i as f64 * 2.5),
        )
        .unwrap();
        conn.execute("INSERT INTO notes (body) VALUES (?1)", (format!("note {i}"),))
            .unwrap();
    }
    path
}

fn main_table(name: &str) -> TableName {
    TableName::new(MAIN_SCHEMA, name)
}

#[tokio::test]
async fn introspection_feeds_the_planner() {
    let dir = TempDir::new().unwrap();
    let gateway = SqliteGateway::new(create(dir.path(), "source.db", 3));

    gateway.test_connection().await.unwrap();
    assert!(gateway.server_version().await.unwrap().starts_with("SQLite 3"));
    assert_eq!(gateway.list_schemas().await.unwrap(), vec![MAIN_SCHEMA]);

    let tables = gateway.list_tables(MAIN_SCHEMA).await.unwrap();
    let names: Vec<&str> = tables.iter().map(|t| t.name.table()).collect();
    assert_eq!(names, vec!["customers", "notes", "orders"]);
    let orders = &tables[2];
    assert_eq!(orders.primary_key, vec!["id"]);
    assert_eq!(orders.referenced_tables().into_iter().collect::<Vec<_>>(), vec![main_table("customers")]);
    assert_eq!(gateway.row_count(&main_table("orders")).await.unwrap(), 3);
    assert!(matches!(
        gateway.row_count(&main_table("missing")).await,
        Err(GatewayError::TableNotFound(_))
    ));
}

#[tokio::test]
async fn paging_visits_every_row_once() {
    let dir = TempDir::new().unwrap();
    let gateway = SqliteGateway::new(create(dir.path(), "source.db", 25));
    let tables = gateway.list_tables(MAIN_SCHEMA).await.unwrap();

    for table in &tables {
        let batches: Vec<_> = stream_batches(&gateway, table, 7, None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(batches.len(), 4, "{}", table.name);
        let rows: Vec<_> = batches.into_iter().flat_map(|b| b.rows).collect();
        assert_eq!(rows.len(), 25);
        assert_eq!(
            TableChecksum::of_rows(&rows),
            gateway.checksum(table).await.unwrap()
        );
    }
}

#[tokio::test]
async fn rollback_discards_and_commit_publishes() {
    let dir = TempDir::new().unwrap();
    let source = SqliteGateway::new(create(dir.path(), "source.db", 10));
    let destination = SqliteGateway::new(create(dir.path(), "destination.db", 0));
    let customers = source
        .list_tables(MAIN_SCHEMA)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.name.table() == "customers")
        .unwrap();
    let batch = source.fetch_batch(&customers, 100, None).await.unwrap();

    let mut writer = destination.begin_table(&customers).await.unwrap();
    assert_eq!(writer.write_batch(&batch.rows).await.unwrap(), 10);
    assert_eq!(writer.row_count().await.unwrap(), 10);
    assert_eq!(
        writer.checksum().await.unwrap(),
        source.checksum(&customers).await.unwrap()
    );
    writer.rollback().await.unwrap();
    assert_eq!(destination.row_count(&customers.name).await.unwrap(), 0);

    let mut writer = destination.begin_table(&customers).await.unwrap();
    writer.write_batch(&batch.rows).await.unwrap();
    // Uncommitted rows are invisible to other connections
    assert_eq!(destination.row_count(&customers.name).await.unwrap(), 0);
    writer.commit().await.unwrap();
    assert_eq!(destination.row_count(&customers.name).await.unwrap(), 10);

    let mut writer = destination.begin_table(&customers).await.unwrap();
    let err = writer.write_batch(&batch.rows[..1]).await.unwrap_err();
    assert!(matches!(err, GatewayError::Database(_)));
}

#[tokio::test]
async fn incompatible_destination_is_refused() {
    let dir = TempDir::new().unwrap();
    let source = SqliteGateway::new(create(dir.path(), "source.db", 1));
    let path = dir.path().join("narrow.db");
    Connection::open(&path)
        .unwrap()
        .execute_batch("CREATE TABLE customers (id INTEGER PRIMARY KEY);")
        .unwrap();
    let destination = SqliteGateway::new(path);

    let customers = source
        .list_tables(MAIN_SCHEMA)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.name.table() == "customers")
        .unwrap();
    let err = destination.begin_table(&customers).await.err().unwrap();
    assert!(matches!(err, GatewayError::SchemaIncompatible { .. }));
    assert!(!err.is_retryable());
}

const LEDGERS: &str = "
    CREATE TABLE ledger_a (id INTEGER PRIMARY KEY, memo TEXT NOT NULL);
    CREATE TABLE ledger_b (id INTEGER PRIMARY KEY, memo TEXT NOT NULL);
";

fn ledgers(dir: &Path, name: &str, rows: i64) -> PathBuf {
    let path = dir.join(name);
    let mut conn = Connection::open(&path).unwrap();
    conn.execute_batch(LEDGERS).unwrap();
    let tx = conn.transaction().unwrap();
    for i in 1..=rows {
        for table in ["ledger_a", "ledger_b"] {
            tx.execute(
                &format!("INSERT INTO {table} (id, memo) VALUES (?1, ?2)"),
                (i, format!("{table} entry {i:06}")),
            )
            .unwrap();
        }
    }
    tx.commit().unwrap();
    path
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tables_share_one_destination() {
    let dir = TempDir::new().unwrap();
    let busy_timeout = Duration::from_millis(50);
    let source = SqliteGateway::new(ledgers(dir.path(), "source.db", 4_000))
        .with_busy_timeout(busy_timeout);
    let destination = SqliteGateway::new(ledgers(dir.path(), "destination.db", 0))
        .with_busy_timeout(busy_timeout);

    let mut discovered = Vec::new();
    for schema in source.list_tables(MAIN_SCHEMA).await.unwrap() {
        let row_count = source.row_count(&schema.name).await.unwrap();
        discovered.push(DiscoveredTable { schema, row_count });
    }
    let engine = ExecutionEngine::new(
        Arc::new(source),
        Arc::new(destination.clone()),
        EngineConfig::default()
            .with_workers(2)
            .with_batch_size(50)
            .with_max_attempts(1),
    );
    let report = engine
        .plan_and_run(&DependencyPlanner::new(), &discovered, &CancellationToken::new())
        .await;

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.count(TableStatus::Succeeded), 2);
    for unit in &report.tables {
        assert_eq!(unit.attempts, 1, "{}", unit.table);
        assert_eq!(unit.rows_copied, 4_000, "{}", unit.table);
    }
    for table in ["ledger_a", "ledger_b"] {
        assert_eq!(destination.row_count(&main_table(table)).await.unwrap(), 4_000);
    }
}

#[tokio::test]
async fn approved_workflow_copies_between_files() {
    let dir = TempDir::new().unwrap();
    let source = create(dir.path(), "source.db", 40);
    let destination = create(dir.path(), "destination.db", 0);

    let settings = MigrationSettings {
        schemas: vec![MAIN_SCHEMA.to_string()],
        batch_size: 16,
        ..fast_settings()
    };
    let controller = WorkflowController::builder(
        Arc::new(SqliteConnector::new()),
        Arc::new(StaticAdvisoryConnector(Arc::new(ScriptedAdvisory::approving()))),
    )
    .with_settings(settings)
    .build()
    .unwrap();

    let descriptors = Descriptors {
        source: ConnectionDescriptor::new("localhost", 0, source.to_string_lossy(), "none"),
        destination: ConnectionDescriptor::new(
            "localhost",
            0,
            destination.to_string_lossy(),
            "none",
        ),
        advisory: AdvisoryDescriptor::new("http://advisory.test", "key"),
    };
    controller.configure(descriptors).await.unwrap();
    controller.start().unwrap();
    assert_eq!(
        controller.wait_until_settled().await,
        WorkflowStage::AwaitingApproval
    );
    controller.approve().unwrap();
    assert_eq!(controller.wait_until_settled().await, WorkflowStage::Completed);

    let check = Connection::open(&destination).unwrap();
    for table in ["customers", "orders", "notes"] {
        let count: i64 = check
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 40, "{table}");
    }
    let name: String = check
        .query_row("SELECT name FROM customers WHERE id = 7", [], |r| r.get(0))
        .unwrap();
    assert_eq!(name, "customer-7");
}

#[tokio::test]
async fn missing_file_fails_configuration() {
    let dir = TempDir::new().unwrap();
    let controller = WorkflowController::builder(
        Arc::new(SqliteConnector::new()),
        Arc::new(StaticAdvisoryConnector(Arc::new(ScriptedAdvisory::approving()))),
    )
    .with_settings(fast_settings())
    .build()
    .unwrap();
    let absent = dir.path().join("absent.db");
    let descriptors = Descriptors {
        source: ConnectionDescriptor::new("localhost", 0, absent.to_string_lossy(), "none"),
        destination: ConnectionDescriptor::new("localhost", 0, absent.to_string_lossy(), "none"),
        advisory: AdvisoryDescriptor::new("http://advisory.test", "key"),
    };

    let err = controller.configure(descriptors).await.unwrap_err();
    assert_eq!(err.kind(), dmo_kernel::ErrorKind::Connectivity);
    assert!(!absent.exists());
}
