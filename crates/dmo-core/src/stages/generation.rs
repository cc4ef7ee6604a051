use super::{cancellable, StageContext, StageRun};
use crate::advisory::AdvisoryContext;
use crate::report::{
    DiscoveryOutput, Finding, GenerationOutput, StageFailure, StageRecord, ValidationOutput,
};
use dmo_kernel::planner::DependencyPlanner;
use dmo_kernel::state_machine::WorkflowStage;

/// Build the plan and ask the advisory service about it.
///
/// `findings` are the observations of the earlier stages, forwarded to the
/// advisory service verbatim.
pub(crate) async fn generate(
    ctx: &StageContext,
    discovery: &DiscoveryOutput,
    validation: &ValidationOutput,
    findings: Vec<Finding>,
) -> StageRecord<GenerationOutput> {
    let mut run = StageRun::new(ctx, WorkflowStage::Generating);
    let result = cancellable(&ctx.cancel, WorkflowStage::Generating, async {
        let planner =
            DependencyPlanner::new().with_excluded(ctx.settings.exclude_tables.iter().cloned());
        let plan = planner.plan(&discovery.source.tables).map_err(|e| {
            StageFailure::new(WorkflowStage::Generating, e.kind(), e.to_string())
        })?;
        for (level, tables) in plan.levels().iter().enumerate() {
            run.progress(
                None,
                format!(
                    "level {level}: {}",
                    tables
                        .iter()
                        .map(|t| t.name().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            );
        }
        run.note(Finding::info(
            None,
            format!(
                "plan: {} tables in {} levels, about {} rows",
                plan.table_count(),
                plan.levels().len(),
                plan.total_estimated_rows()
            ),
        ));

        let context = AdvisoryContext::build(discovery, validation, findings, &plan);
        run.progress(None, "requesting advisory assessment");
        let assessment = ctx.advisory.assess(&context).await.map_err(|e| {
            StageFailure::new(WorkflowStage::Generating, e.kind(), e.to_string())
        })?;
        run.note(Finding::info(
            None,
            format!(
                "advisory assessment: risk {}, recommends {}",
                assessment.risk_level, assessment.recommendation
            ),
        ));

        Ok::<_, StageFailure>(GenerationOutput { plan, assessment })
    })
    .await;
    run.finish(result)
}
