//! Testing utilities for the DMO workspace
//!
//! Shared fakes, fixtures, and observers.

#![allow(missing_docs)]

pub mod advisory;
pub mod memory;

pub use advisory::{low_risk, InMemoryConnector, ScriptedAdvisory, StaticAdvisoryConnector};
pub use memory::{DbStats, InMemoryDatabase, MemoryWriter, WriteEvent};

use dmo_core::descriptor::{AdvisoryDescriptor, ConnectionDescriptor, Descriptors};
use dmo_core::settings::MigrationSettings;
use dmo_kernel::engine::{EngineEvent, EngineObserver};
use dmo_kernel::unit::TableMigrationUnit;
use dmo_kernel::{ColumnSpec, DiscoveredTable, Row, TableName, TableSchema, Value};
use parking_lot::Mutex;

pub fn table(name: &str) -> TableName {
    TableName::new("public", name)
}

pub fn customers_schema() -> TableSchema {
    TableSchema::new(
        table("customers"),
        vec![
            ColumnSpec::new("id", "integer", false),
            ColumnSpec::new("name", "text", false),
            ColumnSpec::new("email", "text", true),
        ],
    )
    .with_primary_key(["id"])
}

pub fn orders_schema() -> TableSchema {
    TableSchema::new(
        table("orders"),
        vec![
            ColumnSpec::new("id", "integer", false),
            ColumnSpec::new("customer_id", "integer", false),
            ColumnSpec::new("amount", "real", false),
        ],
    )
    .with_primary_key(["id"])
    .with_foreign_key(["customer_id"], table("customers"))
}

pub fn payments_schema() -> TableSchema {
    TableSchema::new(
        table("payments"),
        vec![
            ColumnSpec::new("id", "integer", false),
            ColumnSpec::new("order_id", "integer", false),
            ColumnSpec::new("method", "text", false),
        ],
    )
    .with_primary_key(["id"])
    .with_foreign_key(["order_id"], table("orders"))
}

pub fn events_schema() -> TableSchema {
    TableSchema::new(
        table("events"),
        vec![
            ColumnSpec::new("id", "integer", false),
            ColumnSpec::new("kind", "text", false),
            ColumnSpec::new("payload", "text", true),
        ],
    )
    .with_primary_key(["id"])
}

/// Standalone table `name` with an integer key and one text column
pub fn plain_schema(name: &str) -> TableSchema {
    TableSchema::new(
        table(name),
        vec![
            ColumnSpec::new("id", "integer", false),
            ColumnSpec::new("label", "text", true),
        ],
    )
    .with_primary_key(["id"])
}

/// `count` deterministic rows shaped after `schema`. The first column is a
/// 1-based sequence; other integer columns cycle through 1..=50.
pub fn rows_for(schema: &TableSchema, count: usize) -> Vec<Row> {
    (1..=count as i64)
        .map(|i| {
            schema
                .columns
                .iter()
                .enumerate()
                .map(|(c, col)| match (c, col.data_type.as_str()) {
                    (0, _) => Value::Int(i),
                    (_, "integer") => Value::Int((i - 1) % 50 + 1),
                    (_, "real") => Value::Float(i as f64 * 1.25),
                    (_, "boolean") => Value::Bool(i % 2 == 0),
                    (_, "blob") => Value::Bytes(i.to_le_bytes().to_vec()),
                    _ => Value::Text(format!("{}-{i}", col.name)),
                })
                .collect()
        })
        .collect()
}

/// Source holding `tables` with generated rows, destination with the same
/// tables empty
pub fn source_and_destination(tables: &[(TableSchema, usize)]) -> (InMemoryDatabase, InMemoryDatabase) {
    let mut source = InMemoryDatabase::new("source");
    let mut destination = InMemoryDatabase::new("destination");
    for (schema, count) in tables {
        source = source.with_table(schema.clone(), rows_for(schema, *count));
        destination = destination.with_table(schema.clone(), Vec::new());
    }
    (source, destination)
}

pub fn discovered(tables: &[(TableSchema, usize)]) -> Vec<DiscoveredTable> {
    tables
        .iter()
        .map(|(schema, count)| DiscoveredTable {
            schema: schema.clone(),
            row_count: *count as u64,
        })
        .collect()
}

/// Descriptors naming the `source` and `destination` databases of an
/// [`InMemoryConnector`]
pub fn descriptors() -> Descriptors {
    Descriptors {
        source: ConnectionDescriptor::new("localhost", 5432, "source", "migrator")
            .with_password("source-secret"),
        destination: ConnectionDescriptor::new("localhost", 5433, "destination", "migrator")
            .with_password("destination-secret"),
        advisory: AdvisoryDescriptor::new("http://advisory.test", "advisory-secret"),
    }
}

/// Default settings with millisecond backoffs
pub fn fast_settings() -> MigrationSettings {
    MigrationSettings {
        retry_backoff_ms: 1,
        advisory_backoff_ms: 1,
        advisory_timeout_secs: 5,
        ..MigrationSettings::default()
    }
}

/// Collects every engine event and unit update
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<EngineEvent>>,
    units: Mutex<Vec<TableMigrationUnit>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn units(&self) -> Vec<TableMigrationUnit> {
        self.units.lock().clone()
    }

    /// Index of the first event matching `predicate`
    pub fn position<F>(&self, predicate: F) -> Option<usize>
    where
        F: Fn(&EngineEvent) -> bool,
    {
        self.events.lock().iter().position(predicate)
    }

    pub fn saw<F>(&self, predicate: F) -> bool
    where
        F: Fn(&EngineEvent) -> bool,
    {
        self.position(predicate).is_some()
    }
}

impl EngineObserver for RecordingObserver {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }

    fn on_unit(&self, unit: &TableMigrationUnit) {
        self.units.lock().push(unit.clone());
    }
}
