use super::{cancellable, StageContext, StageRun};
use crate::report::{
    DiscoveryOutput, Finding, SampleExecution, StageFailure, StageRecord, TableCompatibility,
    ValidationOutput,
};
use dmo_kernel::planner::DependencyPlanner;
use dmo_kernel::state_machine::WorkflowStage;
use dmo_kernel::{DiscoveredTable, ErrorKind, TableSchema};

/// Rows of the sample kept in the report
const PREVIEW_ROWS: usize = 5;

/// Check every source table against the destination, then run a trial copy
/// that is always rolled back
pub(crate) async fn validate(
    ctx: &StageContext,
    discovery: &DiscoveryOutput,
) -> StageRecord<ValidationOutput> {
    let mut run = StageRun::new(ctx, WorkflowStage::Validating);
    let result = cancellable(&ctx.cancel, WorkflowStage::Validating, async {
        let excluded =
            DependencyPlanner::new().with_excluded(ctx.settings.exclude_tables.iter().cloned());
        let mut tables = Vec::new();
        for source in &discovery.source.tables {
            if excluded.is_excluded(source.name()) {
                run.note(Finding::info(Some(source.name()), "excluded by configuration"));
                continue;
            }
            tables.push(compatibility(
                &mut run,
                source,
                discovery,
                ctx.settings.create_missing_tables,
            ));
        }

        let candidate = tables
            .iter()
            .filter(|t| t.compatible && !t.create_on_approval && t.destination_rows == 0)
            .filter_map(|t| discovery.source.table(&t.table))
            .filter(|t| t.row_count > 0)
            .min_by(|a, b| a.row_count.cmp(&b.row_count).then_with(|| a.name().cmp(b.name())));
        let sample = match candidate {
            Some(table) => Some(sample_copy(ctx, &mut run, &table.schema).await?),
            None => {
                run.note(Finding::info(None, "no table qualifies for a sample execution"));
                None
            }
        };

        Ok::<_, StageFailure>(ValidationOutput { tables, sample })
    })
    .await;
    run.finish(result)
}

fn compatibility(
    run: &mut StageRun,
    source: &DiscoveredTable,
    discovery: &DiscoveryOutput,
    create_missing: bool,
) -> TableCompatibility {
    let name = source.name();
    let Some(destination) = discovery.destination.table(name) else {
        if create_missing {
            run.note(Finding::warning(
                Some(name),
                "table does not exist in the destination; it will be created on approval",
            ));
            return TableCompatibility {
                table: name.clone(),
                compatible: true,
                warnings: Vec::new(),
                reason: None,
                destination_rows: 0,
                create_on_approval: true,
            };
        }
        let reason = "table does not exist in the destination".to_string();
        run.note(Finding::error(Some(name), reason.clone()));
        return TableCompatibility {
            table: name.clone(),
            compatible: false,
            warnings: Vec::new(),
            reason: Some(reason),
            destination_rows: 0,
            create_on_approval: false,
        };
    };

    match source.schema.check_compatible(&destination.schema) {
        Ok(warnings) => {
            for warning in &warnings {
                run.note(Finding::warning(Some(name), warning.clone()));
            }
            if destination.row_count > 0 {
                run.note(Finding::warning(
                    Some(name),
                    format!(
                        "destination already holds {} rows; duplicate keys may fail the copy",
                        destination.row_count
                    ),
                ));
            }
            TableCompatibility {
                table: name.clone(),
                compatible: true,
                warnings,
                reason: None,
                destination_rows: destination.row_count,
                create_on_approval: false,
            }
        }
        Err(reason) => {
            run.note(Finding::error(Some(name), reason.clone()));
            TableCompatibility {
                table: name.clone(),
                compatible: false,
                warnings: Vec::new(),
                reason: Some(reason),
                destination_rows: destination.row_count,
                create_on_approval: false,
            }
        }
    }
}

async fn sample_copy(
    ctx: &StageContext,
    run: &mut StageRun,
    schema: &TableSchema,
) -> Result<SampleExecution, StageFailure> {
    let table = &schema.name;
    run.progress(
        Some(table),
        format!("sample execution of up to {} rows", ctx.settings.sample_rows),
    );
    let batch = ctx
        .source
        .fetch_batch(schema, ctx.settings.sample_rows.max(1), None)
        .await
        .map_err(|e| run.gateway_failure(&format!("sample read of {table}"), &e))?;

    let mut writer = ctx
        .destination
        .begin_table(schema)
        .await
        .map_err(|e| run.gateway_failure(&format!("sample transaction on {table}"), &e))?;
    let trial = async {
        let written = writer.write_batch(&batch.rows).await?;
        let counted = writer.row_count().await?;
        Ok::<_, dmo_kernel::GatewayError>((written, counted))
    }
    .await;
    if let Err(err) = writer.rollback().await {
        tracing::warn!("Sample rollback on {} failed: {}", table, err);
    }
    let (written, counted) =
        trial.map_err(|e| run.gateway_failure(&format!("sample write to {table}"), &e))?;

    let expected = batch.len() as u64;
    let verified = written == expected && counted == expected;
    if !verified {
        return Err(StageFailure::new(
            WorkflowStage::Validating,
            ErrorKind::Integrity,
            format!(
                "sample of {table}: read {expected} rows, wrote {written}, destination counted {counted}"
            ),
        ));
    }
    run.note(Finding::info(
        Some(table),
        format!("sample execution wrote and verified {written} rows, rolled back"),
    ));

    Ok(SampleExecution {
        table: table.clone(),
        rows_written: written,
        verified,
        preview: batch.rows.into_iter().take(PREVIEW_ROWS).collect(),
    })
}
