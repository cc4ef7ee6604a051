//! [`DbGateway`] over a SQLite database file
//!
//! rusqlite is synchronous, so every call runs on tokio's blocking pool.
//! Reads open a short-lived connection each; a [`SqliteWriter`] owns one
//! connection for the lifetime of its transaction.
//!
//! SQLite admits one writer per file. Writers of one gateway take turns on
//! an async semaphore, so concurrent workers queue instead of tripping the
//! busy timeout on `BEGIN IMMEDIATE`.

use crate::schema::{self, column_list, from_sql, map_err, qualified, to_sql};
use async_trait::async_trait;
use dmo_kernel::checksum::TableChecksum;
use dmo_kernel::gateway::{DbGateway, TableWriter};
use dmo_kernel::{GatewayError, Row, RowBatch, RowKey, TableName, TableSchema, Value};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Busy timeout applied to every connection
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `f` on the blocking pool
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, GatewayError>
where
    F: FnOnce() -> Result<T, GatewayError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| GatewayError::Database(format!("sqlite task failed: {err}")))?
}

/// One SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteGateway {
    path: PathBuf,
    busy_timeout: Duration,
    /// Shared by clones; one open write transaction at a time
    writer_turn: Arc<Semaphore>,
}

impl SqliteGateway {
    /// Gateway for an existing database file. Nothing is opened until the
    /// first call.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            writer_turn: Arc::new(Semaphore::new(1)),
        }
    }

    /// Builder: how long to wait on a locked database
    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Database file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until no other writer of this gateway holds the file
    async fn writer_turn(&self) -> Result<OwnedSemaphorePermit, GatewayError> {
        Arc::clone(&self.writer_turn)
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Database("sqlite writer queue closed".to_string()))
    }

    /// Run `f` against a fresh connection on the blocking pool
    async fn with_connection<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce(&Connection) -> Result<T, GatewayError> + Send + 'static,
        T: Send + 'static,
    {
        let (path, busy_timeout) = (self.path.clone(), self.busy_timeout);
        blocking(move || {
            let conn = open(&path, busy_timeout)?;
            f(&conn)
        })
        .await
    }
}

/// Open an existing database file read-write. A missing file is a
/// connectivity failure, never a new empty database.
pub(crate) fn open(path: &Path, busy_timeout: Duration) -> Result<Connection, GatewayError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|err| {
        GatewayError::Connectivity(format!("cannot open {}: {err}", path.display()))
    })?;
    conn.busy_timeout(busy_timeout).map_err(map_err)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(map_err)?;
    Ok(conn)
}

/// `SELECT` of `table`'s columns in keyset order, with the key expression
/// first. Tables without a primary key are paged by `rowid`.
fn batch_query(table: &TableSchema, resume: bool, key_len: usize) -> String {
    let columns = column_list(table.column_names());
    let target = qualified(&table.name);
    if table.primary_key.is_empty() {
        let filter = if resume { "WHERE rowid > ?1 " } else { "" };
        let limit = if resume { "?2" } else { "?1" };
        return format!("SELECT rowid, {columns} FROM {target} {filter}ORDER BY rowid LIMIT {limit}");
    }
    let key = column_list(table.primary_key.iter().map(String::as_str));
    let filter = if resume {
        let placeholders = (1..=key_len)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("WHERE ({key}) > ({placeholders}) ")
    } else {
        String::new()
    };
    let limit = if resume { key_len + 1 } else { 1 };
    format!("SELECT {columns} FROM {target} {filter}ORDER BY {key} LIMIT ?{limit}")
}

fn fetch(
    conn: &Connection,
    table: &TableSchema,
    batch_size: usize,
    after: Option<&RowKey>,
) -> Result<RowBatch, GatewayError> {
    let by_rowid = table.primary_key.is_empty();
    let mut args: Vec<rusqlite::types::Value> =
        after.map(|k| k.0.iter().map(to_sql).collect()).unwrap_or_default();
    let key_len = args.len();
    args.push(rusqlite::types::Value::Integer(
        i64::try_from(batch_size).unwrap_or(i64::MAX),
    ));

    let sql = batch_query(table, after.is_some(), key_len);
    let mut stmt = conn.prepare(&sql).map_err(map_err)?;
    let width = table.columns.len();
    let offset = usize::from(by_rowid);
    let mut rows = Vec::with_capacity(batch_size);
    let mut last_rowid = None;
    let mut cursor = stmt.query(params_from_iter(args)).map_err(map_err)?;
    while let Some(row) = cursor.next().map_err(map_err)? {
        if by_rowid {
            last_rowid = Some(row.get::<_, i64>(0).map_err(map_err)?);
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(from_sql(row.get_ref(i + offset).map_err(map_err)?));
        }
        rows.push(values);
    }

    let last_key = if by_rowid {
        last_rowid.map(|id| RowKey(vec![Value::Int(id)]))
    } else {
        rows.last().map(|r| table.key_of(r))
    };
    Ok(RowBatch { rows, last_key })
}

/// Checksum over `columns` of `table` as visible to `conn`
pub(crate) fn checksum_of(
    conn: &Connection,
    table: &TableName,
    columns: &[&str],
) -> Result<TableChecksum, GatewayError> {
    let sql = format!(
        "SELECT {} FROM {}",
        column_list(columns.iter().copied()),
        qualified(table)
    );
    let mut stmt = conn.prepare(&sql).map_err(map_err)?;
    let mut cursor = stmt.query([]).map_err(map_err)?;
    let mut sum = TableChecksum::new();
    let mut values: Row = Vec::with_capacity(columns.len());
    while let Some(row) = cursor.next().map_err(map_err)? {
        values.clear();
        for i in 0..columns.len() {
            values.push(from_sql(row.get_ref(i).map_err(map_err)?));
        }
        sum.add_row(&values);
    }
    Ok(sum)
}

#[async_trait]
impl DbGateway for SqliteGateway {
    async fn test_connection(&self) -> Result<(), GatewayError> {
        self.with_connection(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(map_err)
        })
        .await
    }

    async fn server_version(&self) -> Result<String, GatewayError> {
        self.with_connection(|conn| {
            conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))
                .map(|v| format!("SQLite {v}"))
                .map_err(map_err)
        })
        .await
    }

    async fn list_schemas(&self) -> Result<Vec<String>, GatewayError> {
        self.with_connection(schema::list_schemas).await
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableSchema>, GatewayError> {
        let name = schema.to_string();
        self.with_connection(move |conn| schema::list_tables(conn, &name))
            .await
    }

    async fn row_count(&self, table: &TableName) -> Result<u64, GatewayError> {
        let table = table.clone();
        self.with_connection(move |conn| {
            schema::describe(conn, &table)?;
            schema::row_count(conn, &table)
        })
        .await
    }

    async fn fetch_batch(
        &self,
        table: &TableSchema,
        batch_size: usize,
        after: Option<&RowKey>,
    ) -> Result<RowBatch, GatewayError> {
        let (table, after) = (table.clone(), after.cloned());
        self.with_connection(move |conn| fetch(conn, &table, batch_size, after.as_ref()))
            .await
    }

    async fn checksum(&self, table: &TableSchema) -> Result<TableChecksum, GatewayError> {
        let table = table.clone();
        self.with_connection(move |conn| {
            let columns: Vec<&str> = table.column_names().collect();
            checksum_of(conn, &table.name, &columns)
        })
        .await
    }

    async fn begin_table(&self, source: &TableSchema) -> Result<Box<dyn TableWriter>, GatewayError> {
        let turn = self.writer_turn().await?;
        let (path, busy_timeout, source) = (self.path.clone(), self.busy_timeout, source.clone());
        let writer = blocking(move || {
            let conn = open(&path, busy_timeout)?;
            let destination = schema::describe(&conn, &source.name)?;
            source
                .check_compatible(&destination)
                .map_err(|reason| GatewayError::SchemaIncompatible {
                    table: source.name.clone(),
                    reason,
                })?;
            conn.execute_batch("BEGIN IMMEDIATE").map_err(map_err)?;
            Ok(SqliteWriter::new(conn, &source, turn))
        })
        .await?;
        tracing::debug!("Opened write transaction on {}", writer.spec.table);
        Ok(Box::new(writer))
    }

    async fn create_table(&self, source: &TableSchema) -> Result<(), GatewayError> {
        let _turn = self.writer_turn().await?;
        let sql = schema::create_table_sql(source);
        self.with_connection(move |conn| conn.execute_batch(&sql).map_err(map_err))
            .await?;
        tracing::info!("Created table {} in {}", source.name, self.path.display());
        Ok(())
    }
}

/// What a writer inserts and where
#[derive(Debug)]
struct InsertSpec {
    table: TableName,
    columns: Vec<String>,
    insert: String,
}

/// One destination table inside one `BEGIN IMMEDIATE` transaction.
///
/// Dropping the writer closes its connection, which rolls the transaction
/// back, and hands the file to the next queued writer.
pub struct SqliteWriter {
    conn: Option<Connection>,
    spec: Arc<InsertSpec>,
    _turn: OwnedSemaphorePermit,
}

impl SqliteWriter {
    fn new(conn: Connection, source: &TableSchema, turn: OwnedSemaphorePermit) -> Self {
        let columns: Vec<String> = source.column_names().map(str::to_string).collect();
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            qualified(&source.name),
            column_list(columns.iter().map(String::as_str))
        );
        Self {
            conn: Some(conn),
            spec: Arc::new(InsertSpec {
                table: source.name.clone(),
                columns,
                insert,
            }),
            _turn: turn,
        }
    }

    /// Move the connection onto the blocking pool for `f` and take it back
    async fn run<T, F>(&mut self, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce(&Connection, &InsertSpec) -> Result<T, GatewayError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.take().ok_or_else(|| {
            GatewayError::Database(format!("writer for {} is closed", self.spec.table))
        })?;
        let spec = Arc::clone(&self.spec);
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&conn, &spec);
            (conn, result)
        })
        .await
        .map_err(|err| GatewayError::Database(format!("sqlite task failed: {err}")))?;
        self.conn = Some(conn);
        result
    }

    async fn finish(mut self: Box<Self>, statement: &'static str) -> Result<(), GatewayError> {
        self.run(move |conn, _| conn.execute_batch(statement).map_err(map_err))
            .await?;
        tracing::debug!("{} on {}", statement, self.spec.table);
        Ok(())
    }
}

#[async_trait]
impl TableWriter for SqliteWriter {
    async fn write_batch(&mut self, rows: &[Row]) -> Result<u64, GatewayError> {
        let rows = rows.to_vec();
        self.run(move |conn, spec| {
            let mut stmt = conn.prepare_cached(&spec.insert).map_err(map_err)?;
            let mut written = 0u64;
            for row in &rows {
                written += stmt
                    .execute(params_from_iter(row.iter().map(to_sql)))
                    .map_err(map_err)? as u64;
            }
            Ok(written)
        })
        .await
    }

    async fn row_count(&mut self) -> Result<u64, GatewayError> {
        self.run(|conn, spec| schema::row_count(conn, &spec.table))
            .await
    }

    async fn checksum(&mut self) -> Result<TableChecksum, GatewayError> {
        self.run(|conn, spec| {
            let columns: Vec<&str> = spec.columns.iter().map(String::as_str).collect();
            checksum_of(conn, &spec.table, &columns)
        })
        .await
    }

    async fn commit(self: Box<Self>) -> Result<(), GatewayError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), GatewayError> {
        self.finish("ROLLBACK").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmo_kernel::ColumnSpec;

    fn keyed() -> TableSchema {
        TableSchema::new(
            TableName::new("main", "lines"),
            vec![
                ColumnSpec::new("order_id", "integer", false),
                ColumnSpec::new("line", "integer", false),
                ColumnSpec::new("sku", "text", true),
            ],
        )
        .with_primary_key(["order_id", "line"])
    }

    #[test]
    fn test_batch_query_by_key() {
        assert_eq!(
            batch_query(&keyed(), false, 0),
            "SELECT \"order_id\", \"line\", \"sku\" FROM \"main\".\"lines\" \
             ORDER BY \"order_id\", \"line\" LIMIT ?1"
        );
        assert_eq!(
            batch_query(&keyed(), true, 2),
            "SELECT \"order_id\", \"line\", \"sku\" FROM \"main\".\"lines\" \
             WHERE (\"order_id\", \"line\") > (?1, ?2) ORDER BY \"order_id\", \"line\" LIMIT ?3"
        );
    }

    #[test]
    fn test_batch_query_by_rowid() {
        let mut table = keyed();
        table.primary_key.clear();
        assert!(batch_query(&table, true, 1).starts_with("SELECT rowid, "));
        assert!(batch_query(&table, true, 1).ends_with("WHERE rowid > ?1 ORDER BY rowid LIMIT ?2"));
    }

    #[test]
    fn test_missing_file_is_connectivity() {
        let dir = tempfile::tempdir().unwrap();
        let err = open(&dir.path().join("absent.db"), DEFAULT_BUSY_TIMEOUT).unwrap_err();
        assert!(matches!(err, GatewayError::Connectivity(_)));
    }
}
