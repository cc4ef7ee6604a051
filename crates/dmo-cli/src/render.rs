//! Plain-text views for the terminal

use dmo_core::report::{GenerationOutput, ValidationOutput};
use dmo_core::{ApprovalDecision, SessionRecord, Severity, StageReport};
use dmo_kernel::engine::ExecutionReport;
use dmo_kernel::unit::TableStatus;
use std::fmt::Write as _;

/// Plan levels and the advisory verdict shown at the approval gate
pub(crate) fn approval_gate(
    generation: &GenerationOutput,
    validation: Option<&ValidationOutput>,
) -> String {
    let mut out = String::new();
    let plan = &generation.plan;
    let _ = writeln!(
        out,
        "Migration plan: {} tables, ~{} rows, {} levels",
        plan.table_count(),
        plan.total_estimated_rows(),
        plan.levels().len()
    );
    for (level, tables) in plan.levels().iter().enumerate() {
        let _ = writeln!(out, "  level {level}");
        for table in tables {
            let _ = write!(out, "    {} (~{} rows)", table.name(), table.estimated_rows);
            if !table.depends_on.is_empty() {
                let deps: Vec<String> = table.depends_on.iter().map(ToString::to_string).collect();
                let _ = write!(out, " after {}", deps.join(", "));
            }
            out.push('\n');
        }
    }

    if let Some(validation) = validation {
        for table in validation.incompatible() {
            let _ = writeln!(
                out,
                "  ! {} will fail: {}",
                table.table,
                table.reason.as_deref().unwrap_or("incompatible")
            );
        }
        if let Some(sample) = &validation.sample {
            let _ = writeln!(
                out,
                "Sample copy: {} rows of {} ({})",
                sample.rows_written,
                sample.table,
                if sample.verified { "verified, rolled back" } else { "NOT verified" }
            );
        }
    }

    let assessment = &generation.assessment;
    let _ = writeln!(
        out,
        "Advisory: risk {}, recommends {}",
        assessment.risk_level, assessment.recommendation
    );
    for line in assessment.narrative.lines() {
        let _ = writeln!(out, "  {line}");
    }
    out
}

/// Per-table outcome of an execution
pub(crate) fn execution_summary(report: &ExecutionReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Execution {}: {} succeeded, {} failed, {} cancelled, {} rows copied{}",
        report.outcome,
        report.count(TableStatus::Succeeded),
        report.count(TableStatus::Failed),
        report.count(TableStatus::Cancelled),
        report.rows_copied(),
        if report.cancelled { " (cancel requested)" } else { "" }
    );
    if let Some(err) = &report.plan_error {
        let _ = writeln!(out, "  plan error: {err}");
    }
    for unit in &report.tables {
        let _ = write!(
            out,
            "  [{}] {:<40} {:<10} rows={} attempts={}",
            unit.level,
            unit.table.to_string(),
            unit.status.as_str(),
            unit.rows_copied,
            unit.attempts
        );
        if let Some(err) = &unit.last_error {
            let _ = write!(out, "  {err}");
        }
        out.push('\n');
    }
    out
}

/// Advisory write-up of a finished execution, indented under a heading
pub(crate) fn final_report(text: &str) -> String {
    let mut out = String::from("Final report:\n");
    for line in text.lines() {
        let _ = writeln!(out, "  {line}");
    }
    out
}

/// Everything persisted about one session
pub(crate) fn session_record(record: &SessionRecord) -> String {
    let session = &record.session;
    let mut out = String::new();
    let _ = writeln!(out, "Session {} ({})", session.id, session.stage);
    let _ = writeln!(out, "  source:      {}", session.source.redacted());
    let _ = writeln!(out, "  destination: {}", session.destination.redacted());
    let _ = writeln!(
        out,
        "  created {}  updated {}",
        session.created_at.to_rfc3339(),
        session.updated_at.to_rfc3339()
    );
    match &session.approval {
        Some(ApprovalDecision::Approved { at }) => {
            let _ = writeln!(out, "  approved at {}", at.to_rfc3339());
        }
        Some(ApprovalDecision::Denied { at, reason }) => {
            let _ = writeln!(
                out,
                "  denied at {}: {}",
                at.to_rfc3339(),
                reason.as_deref().unwrap_or("no reason given")
            );
        }
        None => {}
    }
    if let Some(failure) = &session.failure {
        let _ = writeln!(out, "  failure: {failure}");
    }

    for report in session.reports.iter() {
        let errors = report
            .findings()
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count();
        let _ = writeln!(
            out,
            "{} report: {} findings ({} errors){}",
            report.kind(),
            report.findings().len(),
            errors,
            report
                .failure()
                .map(|f| format!(", failed: {}", f.message))
                .unwrap_or_default()
        );
        if let StageReport::Execution(record) = report {
            if let Some(execution) = record.output() {
                out.push_str(&execution_summary(execution));
            }
        }
    }
    if let Some(text) = &session.final_report {
        out.push_str(&final_report(text));
    }
    let _ = writeln!(out, "{} log entries", record.logs.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmo_core::{Assessment, Recommendation, RiskLevel};
    use dmo_kernel::planner::DependencyPlanner;
    use dmo_kernel::types::{ColumnSpec, DiscoveredTable, TableName, TableSchema};

    fn table(name: &str, parent: Option<&str>, rows: u64) -> DiscoveredTable {
        let mut schema = TableSchema::new(
            TableName::new("public", name),
            vec![ColumnSpec::new("id", "integer", false)],
        )
        .with_primary_key(["id"]);
        if let Some(parent) = parent {
            schema = schema.with_foreign_key(["id"], TableName::new("public", parent));
        }
        DiscoveredTable {
            schema,
            row_count: rows,
        }
    }

    #[test]
    fn test_gate_lists_levels_and_verdict() {
        let plan = DependencyPlanner::new()
            .plan(&[table("orders", Some("customers"), 20), table("customers", None, 5)])
            .unwrap();
        let generation = GenerationOutput {
            plan,
            assessment: Assessment {
                risk_level: RiskLevel::Low,
                recommendation: Recommendation::Approve,
                narrative: "Small tables.\nNo conflicts.".to_string(),
            },
        };

        let text = approval_gate(&generation, None);
        assert!(text.starts_with("Migration plan: 2 tables, ~25 rows, 2 levels"));
        assert!(text.contains("  level 0\n    public.customers (~5 rows)\n"));
        assert!(text.contains("public.orders (~20 rows) after public.customers"));
        assert!(text.contains("Advisory: risk LOW, recommends APPROVE"));
        assert!(text.contains("  No conflicts."));
    }

    #[test]
    fn test_final_report_is_indented() {
        assert_eq!(
            final_report("All tables copied.\nNo retries."),
            "Final report:\n  All tables copied.\n  No retries.\n"
        );
    }
}
