use super::{cancellable, StageContext, StageRun};
use crate::report::{DatabaseInventory, DiscoveryOutput, Finding, StageFailure, StageRecord};
use dmo_kernel::gateway::DbGateway;
use dmo_kernel::state_machine::WorkflowStage;
use dmo_kernel::DiscoveredTable;

/// Inventory both databases
pub(crate) async fn discover(ctx: &StageContext) -> StageRecord<DiscoveryOutput> {
    let mut run = StageRun::new(ctx, WorkflowStage::Discovering);
    let result = cancellable(&ctx.cancel, WorkflowStage::Discovering, async {
        let source = inventory(
            ctx,
            &mut run,
            ctx.source.as_ref(),
            "source",
            &ctx.source_endpoint,
        )
        .await?;
        let destination = inventory(
            ctx,
            &mut run,
            ctx.destination.as_ref(),
            "destination",
            &ctx.destination_endpoint,
        )
        .await?;

        let missing_in_destination: Vec<_> = source
            .tables
            .iter()
            .map(|t| t.name().clone())
            .filter(|name| destination.table(name).is_none())
            .collect();
        for name in &missing_in_destination {
            run.note(Finding::warning(Some(name), "table is missing in the destination"));
        }

        Ok::<_, StageFailure>(DiscoveryOutput {
            source,
            destination,
            missing_in_destination,
        })
    })
    .await;
    run.finish(result)
}

async fn inventory(
    ctx: &StageContext,
    run: &mut StageRun,
    gateway: &dyn DbGateway,
    label: &str,
    endpoint: &str,
) -> Result<DatabaseInventory, StageFailure> {
    gateway
        .test_connection()
        .await
        .map_err(|e| run.gateway_failure(&format!("{label} connection test"), &e))?;
    let version = gateway
        .server_version()
        .await
        .map_err(|e| run.gateway_failure(&format!("{label} server version"), &e))?;
    let schemas = gateway
        .list_schemas()
        .await
        .map_err(|e| run.gateway_failure(&format!("{label} schema listing"), &e))?;

    let mut tables = Vec::new();
    for schema in &ctx.settings.schemas {
        if !schemas.iter().any(|s| s == schema) {
            run.note(Finding::warning(
                None,
                format!("schema `{schema}` does not exist in the {label}"),
            ));
            continue;
        }
        let listed = gateway
            .list_tables(schema)
            .await
            .map_err(|e| run.gateway_failure(&format!("{label} table listing"), &e))?;
        for table in listed {
            let row_count = gateway
                .row_count(&table.name)
                .await
                .map_err(|e| run.gateway_failure(&format!("{label} row count of {}", table.name), &e))?;
            tables.push(DiscoveredTable {
                schema: table,
                row_count,
            });
        }
    }
    tables.sort_by(|a, b| a.name().cmp(b.name()));

    let rows: u64 = tables.iter().map(|t| t.row_count).sum();
    run.note(Finding::info(
        None,
        format!(
            "{label} {endpoint} ({version}): {} tables, {rows} rows",
            tables.len()
        ),
    ));
    Ok(DatabaseInventory {
        endpoint: endpoint.to_string(),
        version,
        schemas,
        tables,
    })
}
