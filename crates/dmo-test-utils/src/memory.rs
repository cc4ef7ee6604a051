//! In-memory database with fault injection

use async_trait::async_trait;
use dmo_kernel::checksum::TableChecksum;
use dmo_kernel::gateway::{DbGateway, TableWriter};
use dmo_kernel::{GatewayError, Row, RowBatch, RowKey, TableName, TableSchema, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    rows: BTreeMap<RowKey, Row>,
}

#[derive(Debug, Clone)]
struct WriteFault {
    batch: u64,
    remaining: u32,
    error: GatewayError,
}

#[derive(Debug, Default)]
struct Faults {
    writes: HashMap<TableName, Vec<WriteFault>>,
    reads: HashMap<TableName, (u32, GatewayError)>,
    corrupt: BTreeSet<TableName>,
    write_delay: Option<Duration>,
    read_delay: Option<Duration>,
}

/// Something a writer did, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEvent {
    Create(TableName),
    Begin(TableName),
    Commit(TableName),
    Rollback(TableName),
}

/// Counters for assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
    pub batches_read: u64,
    pub batches_written: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub max_concurrent_writers: usize,
}

#[derive(Debug)]
struct DbInner {
    name: String,
    version: String,
    tables: Mutex<BTreeMap<TableName, MemTable>>,
    faults: Mutex<Faults>,
    history: Mutex<Vec<WriteEvent>>,
    unreachable: AtomicBool,
    batches_read: AtomicU64,
    batches_written: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    active_writers: AtomicUsize,
    max_writers: AtomicUsize,
}

impl DbInner {
    fn check_reachable(&self) -> Result<(), GatewayError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Connectivity(format!(
                "{} is unreachable",
                self.name
            )));
        }
        Ok(())
    }
}

/// A database held in memory. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryDatabase {
    inner: Arc<DbInner>,
}

impl InMemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DbInner {
                name: name.into(),
                version: "memory 1.0".to_string(),
                tables: Mutex::new(BTreeMap::new()),
                faults: Mutex::new(Faults::default()),
                history: Mutex::new(Vec::new()),
                unreachable: AtomicBool::new(false),
                batches_read: AtomicU64::new(0),
                batches_written: AtomicU64::new(0),
                commits: AtomicU64::new(0),
                rollbacks: AtomicU64::new(0),
                active_writers: AtomicUsize::new(0),
                max_writers: AtomicUsize::new(0),
            }),
        }
    }

    /// Builder: add a table with rows
    #[must_use]
    pub fn with_table(self, schema: TableSchema, rows: Vec<Row>) -> Self {
        self.define_table(schema.clone());
        self.insert_rows(&schema.name, rows);
        self
    }

    /// Create (or replace) an empty table
    pub fn define_table(&self, schema: TableSchema) {
        self.inner.tables.lock().insert(
            schema.name.clone(),
            MemTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Insert rows directly, bypassing transactions and faults
    pub fn insert_rows(&self, table: &TableName, rows: Vec<Row>) {
        let mut tables = self.inner.tables.lock();
        let t = tables.get_mut(table).unwrap_or_else(|| panic!("no table {table}"));
        for row in rows {
            let key = t.schema.key_of(&row);
            t.rows.insert(key, row);
        }
    }

    /// Rows of `table` in key order
    pub fn rows(&self, table: &TableName) -> Vec<Row> {
        self.inner
            .tables
            .lock()
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, table: &TableName) -> usize {
        self.inner.tables.lock().get(table).map_or(0, |t| t.rows.len())
    }

    pub fn checksum_of(&self, table: &TableName) -> TableChecksum {
        self.inner
            .tables
            .lock()
            .get(table)
            .map(|t| TableChecksum::of_rows(t.rows.values()))
            .unwrap_or_default()
    }

    /// Fail write batch number `batch` (1-based, counted per transaction)
    /// of `table`, `times` times
    pub fn fail_writes(&self, table: &TableName, batch: u64, times: u32, error: GatewayError) {
        self.inner
            .faults
            .lock()
            .writes
            .entry(table.clone())
            .or_default()
            .push(WriteFault {
                batch,
                remaining: times,
                error,
            });
    }

    /// Fail the next `times` reads of `table`
    pub fn fail_reads(&self, table: &TableName, times: u32, error: GatewayError) {
        self.inner
            .faults
            .lock()
            .reads
            .insert(table.clone(), (times, error));
    }

    /// Alter every row written to `table`, so checksums never match
    pub fn corrupt_writes(&self, table: &TableName) {
        self.inner.faults.lock().corrupt.insert(table.clone());
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.inner.faults.lock().write_delay = Some(delay);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.inner.faults.lock().read_delay = Some(delay);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            batches_read: self.inner.batches_read.load(Ordering::SeqCst),
            batches_written: self.inner.batches_written.load(Ordering::SeqCst),
            commits: self.inner.commits.load(Ordering::SeqCst),
            rollbacks: self.inner.rollbacks.load(Ordering::SeqCst),
            max_concurrent_writers: self.inner.max_writers.load(Ordering::SeqCst),
        }
    }

    pub fn history(&self) -> Vec<WriteEvent> {
        self.inner.history.lock().clone()
    }

    /// Position of an event in the history
    pub fn position(&self, event: &WriteEvent) -> Option<usize> {
        self.inner.history.lock().iter().position(|e| e == event)
    }

    fn record(&self, event: WriteEvent) {
        self.inner.history.lock().push(event);
    }
}

#[async_trait]
impl DbGateway for InMemoryDatabase {
    async fn test_connection(&self) -> Result<(), GatewayError> {
        self.inner.check_reachable()
    }

    async fn server_version(&self) -> Result<String, GatewayError> {
        self.inner.check_reachable()?;
        Ok(self.inner.version.clone())
    }

    async fn list_schemas(&self) -> Result<Vec<String>, GatewayError> {
        self.inner.check_reachable()?;
        let schemas: BTreeSet<String> = self
            .inner
            .tables
            .lock()
            .keys()
            .map(|t| t.schema().to_string())
            .collect();
        Ok(schemas.into_iter().collect())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableSchema>, GatewayError> {
        self.inner.check_reachable()?;
        Ok(self
            .inner
            .tables
            .lock()
            .values()
            .filter(|t| t.schema.name.schema() == schema)
            .map(|t| t.schema.clone())
            .collect())
    }

    async fn row_count(&self, table: &TableName) -> Result<u64, GatewayError> {
        self.inner.check_reachable()?;
        self.inner
            .tables
            .lock()
            .get(table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| GatewayError::TableNotFound(table.clone()))
    }

    async fn fetch_batch(
        &self,
        table: &TableSchema,
        batch_size: usize,
        after: Option<&RowKey>,
    ) -> Result<RowBatch, GatewayError> {
        self.inner.check_reachable()?;
        let delay = {
            let mut faults = self.inner.faults.lock();
            if let Some((remaining, error)) = faults.reads.get_mut(&table.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
            faults.read_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let tables = self.inner.tables.lock();
        let t = tables
            .get(&table.name)
            .ok_or_else(|| GatewayError::TableNotFound(table.name.clone()))?;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let picked: Vec<(&RowKey, &Row)> = t
            .rows
            .range((lower, Bound::Unbounded))
            .take(batch_size)
            .collect();
        let last_key = picked.last().map(|(k, _)| (*k).clone());
        let rows = picked.into_iter().map(|(_, r)| r.clone()).collect();
        self.inner.batches_read.fetch_add(1, Ordering::SeqCst);
        Ok(RowBatch { rows, last_key })
    }

    async fn checksum(&self, table: &TableSchema) -> Result<TableChecksum, GatewayError> {
        self.inner.check_reachable()?;
        let tables = self.inner.tables.lock();
        let t = tables
            .get(&table.name)
            .ok_or_else(|| GatewayError::TableNotFound(table.name.clone()))?;
        Ok(TableChecksum::of_rows(t.rows.values()))
    }

    async fn begin_table(&self, source: &TableSchema) -> Result<Box<dyn TableWriter>, GatewayError> {
        self.inner.check_reachable()?;
        let destination = self
            .inner
            .tables
            .lock()
            .get(&source.name)
            .map(|t| t.schema.clone())
            .ok_or_else(|| GatewayError::TableNotFound(source.name.clone()))?;
        source
            .check_compatible(&destination)
            .map_err(|reason| GatewayError::SchemaIncompatible {
                table: source.name.clone(),
                reason,
            })?;
        // Destination position of every source column
        let back: Vec<usize> = source
            .columns
            .iter()
            .filter_map(|c| destination.column_index(&c.name))
            .collect();

        let active = self.inner.active_writers.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_writers.fetch_max(active, Ordering::SeqCst);
        self.record(WriteEvent::Begin(source.name.clone()));
        Ok(Box::new(MemoryWriter {
            db: self.clone(),
            positions: source.positions_in(&destination),
            back,
            destination,
            staged: BTreeMap::new(),
            batches: 0,
        }))
    }

    async fn create_table(&self, source: &TableSchema) -> Result<(), GatewayError> {
        self.inner.check_reachable()?;
        let created = {
            let mut tables = self.inner.tables.lock();
            if tables.contains_key(&source.name) {
                false
            } else {
                tables.insert(
                    source.name.clone(),
                    MemTable {
                        schema: source.clone(),
                        rows: BTreeMap::new(),
                    },
                );
                true
            }
        };
        if created {
            self.record(WriteEvent::Create(source.name.clone()));
        }
        Ok(())
    }
}

/// Transaction over one destination table; nothing is visible until commit
pub struct MemoryWriter {
    db: InMemoryDatabase,
    destination: TableSchema,
    positions: Vec<Option<usize>>,
    back: Vec<usize>,
    staged: BTreeMap<RowKey, Row>,
    batches: u64,
}

impl MemoryWriter {
    fn project(&self, row: &[Value]) -> Row {
        self.positions
            .iter()
            .map(|p| p.and_then(|i| row.get(i).cloned()).unwrap_or(Value::Null))
            .collect()
    }

    fn name(&self) -> &TableName {
        &self.destination.name
    }
}

#[async_trait]
impl TableWriter for MemoryWriter {
    async fn write_batch(&mut self, rows: &[Row]) -> Result<u64, GatewayError> {
        self.db.inner.check_reachable()?;
        self.batches += 1;
        let (delay, corrupt) = {
            let mut faults = self.db.inner.faults.lock();
            if let Some(list) = faults.writes.get_mut(self.name()) {
                if let Some(fault) = list
                    .iter_mut()
                    .find(|f| f.batch == self.batches && f.remaining > 0)
                {
                    fault.remaining -= 1;
                    return Err(fault.error.clone());
                }
            }
            (faults.write_delay, faults.corrupt.contains(self.name()))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut batch = BTreeMap::new();
        for row in rows {
            let mut projected = self.project(row);
            let key = self.destination.key_of(&projected);
            if corrupt {
                if let Some(last) = projected.last_mut() {
                    *last = Value::Text("corrupted".to_string());
                }
            }
            let exists = self.staged.contains_key(&key)
                || batch.contains_key(&key)
                || self
                    .db
                    .inner
                    .tables
                    .lock()
                    .get(self.name())
                    .is_some_and(|t| t.rows.contains_key(&key));
            if exists {
                return Err(GatewayError::Database(format!(
                    "duplicate key {:?} in {}",
                    key.0,
                    self.name()
                )));
            }
            batch.insert(key, projected);
        }
        self.staged.extend(batch);
        self.db.inner.batches_written.fetch_add(1, Ordering::SeqCst);
        Ok(rows.len() as u64)
    }

    async fn row_count(&mut self) -> Result<u64, GatewayError> {
        self.db.inner.check_reachable()?;
        Ok((self.db.count(self.name()) + self.staged.len()) as u64)
    }

    async fn checksum(&mut self) -> Result<TableChecksum, GatewayError> {
        self.db.inner.check_reachable()?;
        let committed = self.db.rows(self.name());
        let mut checksum = TableChecksum::new();
        for row in committed.iter().chain(self.staged.values()) {
            let source_order: Row = self.back.iter().map(|&i| row[i].clone()).collect();
            checksum.add_row(&source_order);
        }
        Ok(checksum)
    }

    async fn commit(self: Box<Self>) -> Result<(), GatewayError> {
        self.db.inner.check_reachable()?;
        let mut this = *self;
        let staged = std::mem::take(&mut this.staged);
        {
            let mut tables = this.db.inner.tables.lock();
            if let Some(t) = tables.get_mut(this.name()) {
                t.rows.extend(staged);
            }
        }
        this.db.inner.commits.fetch_add(1, Ordering::SeqCst);
        this.db.record(WriteEvent::Commit(this.name().clone()));
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), GatewayError> {
        self.db.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.db.record(WriteEvent::Rollback(self.name().clone()));
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.db.inner.active_writers.fetch_sub(1, Ordering::SeqCst);
    }
}
