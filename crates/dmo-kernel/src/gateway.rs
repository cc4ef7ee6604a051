//! Database gateway contracts
//!
//! A [`DbGateway`] is one database endpoint. Reads happen directly on the
//! gateway; every write goes through a [`TableWriter`], which scopes one
//! destination transaction to one table.

use crate::checksum::TableChecksum;
use crate::error::GatewayError;
use crate::types::{Row, RowBatch, RowKey, TableName, TableSchema};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

/// Lazy, finite sequence of batches
pub type BatchStream<'a> = BoxStream<'a, Result<RowBatch, GatewayError>>;

/// One database endpoint.
#[async_trait]
pub trait DbGateway: Send + Sync {
    /// Cheap round trip proving the endpoint is reachable
    async fn test_connection(&self) -> Result<(), GatewayError>;

    /// Server product and version string
    async fn server_version(&self) -> Result<String, GatewayError>;

    /// Schema names visible to the connection
    async fn list_schemas(&self) -> Result<Vec<String>, GatewayError>;

    /// Tables of `schema` with columns, primary and foreign keys, sorted by name
    async fn list_tables(&self, schema: &str) -> Result<Vec<TableSchema>, GatewayError>;

    /// Current row count
    async fn row_count(&self, table: &TableName) -> Result<u64, GatewayError>;

    /// Up to `batch_size` rows ordered by key, strictly after `after`
    async fn fetch_batch(
        &self,
        table: &TableSchema,
        batch_size: usize,
        after: Option<&RowKey>,
    ) -> Result<RowBatch, GatewayError>;

    /// Checksum over the columns of `table`, in `table`'s column order
    async fn checksum(&self, table: &TableSchema) -> Result<TableChecksum, GatewayError>;

    /// Open a transactional writer for rows shaped like `source`.
    ///
    /// Fails with [`GatewayError::SchemaIncompatible`] when the destination
    /// table is missing or cannot hold the source columns.
    async fn begin_table(&self, source: &TableSchema) -> Result<Box<dyn TableWriter>, GatewayError>;

    /// Create an empty table shaped like `source` unless one with that name
    /// already exists. Gateways that cannot issue DDL keep this default.
    async fn create_table(&self, source: &TableSchema) -> Result<(), GatewayError> {
        Err(GatewayError::Database(format!(
            "creating {} is not supported by this gateway",
            source.name
        )))
    }
}

/// Writes into one destination table inside one transaction.
///
/// Dropping a writer without calling [`TableWriter::commit`] discards
/// everything it wrote.
#[async_trait]
pub trait TableWriter: Send {
    /// Insert rows given in source column order; returns rows written
    async fn write_batch(&mut self, rows: &[Row]) -> Result<u64, GatewayError>;

    /// Row count as seen inside the transaction
    async fn row_count(&mut self) -> Result<u64, GatewayError>;

    /// Checksum over the source columns as seen inside the transaction
    async fn checksum(&mut self) -> Result<TableChecksum, GatewayError>;

    /// Make the writes durable
    async fn commit(self: Box<Self>) -> Result<(), GatewayError>;

    /// Discard the writes
    async fn rollback(self: Box<Self>) -> Result<(), GatewayError>;
}

/// Stream `table` from `gateway` in keyset batches, starting after `after`.
///
/// The stream ends after the first short or empty batch. Re-creating it
/// from a key resumes where that key left off.
pub fn stream_batches<'a>(
    gateway: &'a dyn DbGateway,
    table: &'a TableSchema,
    batch_size: usize,
    after: Option<RowKey>,
) -> BatchStream<'a> {
    stream::try_unfold(Some(after), move |cursor| {
        next_batch(gateway, table, batch_size, cursor)
    })
    .boxed()
}

/// `cursor` is `None` once the table is exhausted.
async fn next_batch(
    gateway: &dyn DbGateway,
    table: &TableSchema,
    batch_size: usize,
    cursor: Option<Option<RowKey>>,
) -> Result<Option<(RowBatch, Option<Option<RowKey>>)>, GatewayError> {
    let Some(after) = cursor else {
        return Ok(None);
    };
    let batch = gateway.fetch_batch(table, batch_size, after.as_ref()).await?;
    if batch.is_empty() {
        return Ok(None);
    }
    let next = match &batch.last_key {
        Some(key) if batch.len() >= batch_size => Some(Some(key.clone())),
        _ => None,
    };
    Ok(Some((batch, next)))
}
