use dmo_kernel::planner::DependencyPlanner;
use dmo_kernel::{ColumnSpec, DiscoveredTable, PlanError, TableName, TableSchema};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn name(i: usize) -> TableName {
    TableName::new("public", format!("t{i:02}"))
}

fn table(i: usize, refs: &[usize]) -> DiscoveredTable {
    let mut schema = TableSchema::new(
        name(i),
        vec![
            ColumnSpec::new("id", "integer", false),
            ColumnSpec::new("parent_id", "integer", true),
        ],
    )
    .with_primary_key(["id"]);
    for &r in refs {
        schema = schema.with_foreign_key(["parent_id"], name(r));
    }
    DiscoveredTable {
        schema,
        row_count: i as u64,
    }
}

proptest! {
    #[test]
    fn prop_acyclic_input_respects_dependencies(
        node_count in 1..16usize,
        edges in proptest::collection::vec((0..16usize, 0..16usize), 0..40)
    ) {
        // Only edges from a higher index to a lower one, so the input is acyclic
        let mut refs: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (a, b) in edges {
            if a < node_count && b < a {
                refs.entry(a).or_default().push(b);
            }
        }
        let tables: Vec<DiscoveredTable> = (0..node_count)
            .map(|i| table(i, refs.get(&i).map_or(&[][..], Vec::as_slice)))
            .collect();

        let plan = DependencyPlanner::new().plan(&tables).unwrap();
        prop_assert_eq!(plan.table_count(), node_count);

        for (level, planned) in plan.levels().iter().enumerate() {
            // Ties broken by qualified name
            let names: Vec<String> = planned.iter().map(|t| t.name().qualified()).collect();
            let mut sorted = names.clone();
            sorted.sort();
            prop_assert_eq!(names, sorted);

            for t in planned {
                for dep in &t.depends_on {
                    let dep_level = plan.level_of(dep).unwrap();
                    prop_assert!(dep_level < level, "{} at {} depends on {} at {}", t.name(), level, dep, dep_level);
                }
            }
        }
    }

    #[test]
    fn prop_planning_is_deterministic(
        node_count in 1..12usize,
        edges in proptest::collection::vec((0..12usize, 0..12usize), 0..30)
    ) {
        let mut refs: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (a, b) in edges {
            if a < node_count && b < a {
                refs.entry(a).or_default().push(b);
            }
        }
        let tables: Vec<DiscoveredTable> = (0..node_count)
            .map(|i| table(i, refs.get(&i).map_or(&[][..], Vec::as_slice)))
            .collect();
        let mut reversed = tables.clone();
        reversed.reverse();

        let planner = DependencyPlanner::new();
        prop_assert_eq!(planner.plan(&tables).unwrap(), planner.plan(&reversed).unwrap());
    }
}

#[test]
fn test_three_level_chain() {
    let tables = vec![table(2, &[1]), table(1, &[0]), table(0, &[]), table(3, &[])];
    let plan = DependencyPlanner::new().plan(&tables).unwrap();

    let levels: Vec<Vec<TableName>> = plan
        .levels()
        .iter()
        .map(|l| l.iter().map(|t| t.name().clone()).collect())
        .collect();
    assert_eq!(
        levels,
        vec![vec![name(0), name(3)], vec![name(1)], vec![name(2)]]
    );
    assert_eq!(plan.total_estimated_rows(), 6);
}

#[test]
fn test_cycle_names_only_its_members() {
    // t00 <-> t01 form a cycle; t02 merely depends on it
    let tables = vec![table(0, &[1]), table(1, &[0]), table(2, &[0]), table(3, &[])];
    let err = DependencyPlanner::new().plan(&tables).unwrap_err();
    let PlanError::DependencyCycle { tables } = err;
    assert_eq!(tables, vec![name(0), name(1)]);
}

#[test]
fn test_excluding_a_member_breaks_the_cycle() {
    let tables = vec![table(0, &[1]), table(1, &[0]), table(2, &[1])];
    let plan = DependencyPlanner::new()
        .with_excluded([name(1)])
        .plan(&tables)
        .unwrap();
    assert_eq!(plan.order(), vec![name(0), name(2)]);
    assert!(plan.get(&name(1)).is_none());
}
