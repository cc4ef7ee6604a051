//! One table, one worker.
//!
//! An attempt opens a destination transaction, streams the source in keyset
//! batches into it, then compares row counts and checksums before
//! committing. Any failure rolls the whole transaction back, so a retry
//! always starts from batch 1 against an untouched destination table.

use super::observer::{EngineEvent, EngineObserver};
use super::EngineConfig;
use crate::error::{ErrorKind, GatewayError, TableError};
use crate::gateway::{stream_batches, DbGateway, TableWriter};
use crate::types::TableSchema;
use crate::unit::{TableMigrationUnit, TableStatus};
use chrono::Utc;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

enum AttemptError {
    Cancelled,
    Failed(TableError),
}

pub(super) struct TableWorker {
    pub(super) source: Arc<dyn DbGateway>,
    pub(super) destination: Arc<dyn DbGateway>,
    pub(super) config: EngineConfig,
    pub(super) observer: Arc<dyn EngineObserver>,
    pub(super) cancel: CancellationToken,
    pub(super) schema: TableSchema,
}

impl TableWorker {
    /// Drive `unit` to a terminal status
    pub(super) async fn run(
        self,
        mut unit: TableMigrationUnit,
        pool: Arc<Semaphore>,
    ) -> TableMigrationUnit {
        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            permit = pool.acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            self.cancel_unit(&mut unit, "cancelled before the table started".to_string());
            return unit;
        };
        unit.started_at = Some(Utc::now());

        loop {
            unit.attempts += 1;
            let attempt = unit.attempts;
            unit.rows_copied = 0;
            unit.advance(TableStatus::Running);
            self.emit(
                &unit,
                EngineEvent::TableStarted {
                    table: unit.table.clone(),
                    attempt,
                },
            );

            match self.attempt(&mut unit, attempt).await {
                Ok(()) => {
                    unit.advance(TableStatus::Succeeded);
                    tracing::info!(
                        "Table {} succeeded: {} rows in {} attempt(s)",
                        unit.table,
                        unit.rows_copied,
                        attempt
                    );
                    self.emit(
                        &unit,
                        EngineEvent::TableSucceeded {
                            table: unit.table.clone(),
                            attempts: attempt,
                            rows_copied: unit.rows_copied,
                        },
                    );
                    return unit;
                }
                Err(AttemptError::Cancelled) => {
                    self.cancel_unit(&mut unit, format!("cancelled during attempt {attempt}"));
                    return unit;
                }
                Err(AttemptError::Failed(error)) => {
                    if self.cancel.is_cancelled() {
                        self.cancel_unit(
                            &mut unit,
                            format!("cancelled after attempt {attempt} failed: {}", error.message),
                        );
                        return unit;
                    }
                    let will_retry =
                        error.kind.is_retryable() && attempt < self.config.max_attempts;
                    unit.last_error = Some(error.clone());
                    self.observer.on_event(&EngineEvent::AttemptFailed {
                        error: error.clone(),
                        will_retry,
                    });

                    if !will_retry {
                        unit.advance(TableStatus::Failed);
                        tracing::error!("Table {} failed: {}", unit.table, error);
                        self.emit(&unit, EngineEvent::TableFailed { error });
                        return unit;
                    }

                    tracing::warn!("Retrying table {} after: {}", unit.table, error);
                    unit.advance(TableStatus::Pending);
                    self.observer.on_unit(&unit);
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => {
                            self.cancel_unit(&mut unit, "cancelled while waiting to retry".to_string());
                            return unit;
                        }
                        () = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        unit: &mut TableMigrationUnit,
        attempt: u32,
    ) -> Result<(), AttemptError> {
        let mut writer = self
            .guard(attempt, self.destination.begin_table(&self.schema))
            .await?;

        let copied = self.copy_and_verify(unit, attempt, writer.as_mut()).await;
        match copied {
            // Once verified the commit runs to completion even if a cancel
            // arrives meanwhile.
            Ok(()) => writer
                .commit()
                .await
                .map_err(|e| self.failure(attempt, &e)),
            Err(err) => {
                if let Err(rollback) = writer.rollback().await {
                    tracing::warn!("Rollback of {} failed: {}", unit.table, rollback);
                }
                Err(err)
            }
        }
    }

    async fn copy_and_verify(
        &self,
        unit: &mut TableMigrationUnit,
        attempt: u32,
        writer: &mut dyn TableWriter,
    ) -> Result<(), AttemptError> {
        let mut batches = stream_batches(
            self.source.as_ref(),
            &self.schema,
            self.config.batch_size,
            None,
        );
        let mut batch_no = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
                next = batches.next() => next,
            };
            let Some(batch) = next else {
                break;
            };
            let batch = batch.map_err(|e| self.failure(attempt, &e))?;
            batch_no += 1;

            let written = self.guard(attempt, writer.write_batch(&batch.rows)).await?;
            unit.rows_copied += written;
            tracing::debug!(
                "Table {} attempt {}: batch {} wrote {} rows",
                unit.table,
                attempt,
                batch_no,
                written
            );
            self.emit(
                unit,
                EngineEvent::BatchWritten {
                    table: unit.table.clone(),
                    attempt,
                    batch: batch_no,
                    rows: batch.rows.len(),
                    rows_copied: unit.rows_copied,
                },
            );
        }

        unit.advance(TableStatus::Verifying);
        self.emit(
            unit,
            EngineEvent::Verifying {
                table: unit.table.clone(),
                attempt,
            },
        );

        let source_rows = self
            .guard(attempt, self.source.row_count(&self.schema.name))
            .await?;
        let source_checksum = self.guard(attempt, self.source.checksum(&self.schema)).await?;
        let dest_rows = self.guard(attempt, writer.row_count()).await?;
        let dest_checksum = self.guard(attempt, writer.checksum()).await?;
        unit.source_checksum = Some(source_checksum);
        unit.dest_checksum = Some(dest_checksum);

        if source_rows != dest_rows {
            return Err(self.integrity(
                attempt,
                format!("row count mismatch: source {source_rows}, destination {dest_rows}"),
            ));
        }
        if source_checksum != dest_checksum {
            return Err(self.integrity(
                attempt,
                format!("checksum mismatch: source {source_checksum}, destination {dest_checksum}"),
            ));
        }
        Ok(())
    }

    /// Race a gateway call against cancellation
    async fn guard<T, F>(&self, attempt: u32, operation: F) -> Result<T, AttemptError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AttemptError::Cancelled),
            result = operation => result.map_err(|e| self.failure(attempt, &e)),
        }
    }

    fn failure(&self, attempt: u32, err: &GatewayError) -> AttemptError {
        AttemptError::Failed(TableError::from_gateway(
            self.schema.name.clone(),
            attempt,
            err,
        ))
    }

    fn integrity(&self, attempt: u32, message: String) -> AttemptError {
        AttemptError::Failed(TableError::new(
            self.schema.name.clone(),
            attempt,
            ErrorKind::Integrity,
            message,
        ))
    }

    fn cancel_unit(&self, unit: &mut TableMigrationUnit, reason: String) {
        tracing::info!("Table {} cancelled: {}", unit.table, reason);
        unit.cancel(reason.clone());
        self.emit(
            unit,
            EngineEvent::TableCancelled {
                table: unit.table.clone(),
                reason,
            },
        );
    }

    fn emit(&self, unit: &TableMigrationUnit, event: EngineEvent) {
        self.observer.on_event(&event);
        self.observer.on_unit(unit);
    }
}
