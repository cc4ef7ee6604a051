//! Dependency planner
//!
//! Builds the foreign-key graph over discovered tables and layers it with
//! Kahn's algorithm. Level `n` holds every table whose dependencies all sit
//! in levels `< n`; inside a level tables are sorted by qualified name.
//!
//! Edges to tables that are absent or excluded, and self-references, are
//! dropped before layering.

use crate::error::PlanError;
use crate::types::{DiscoveredTable, TableName, TableSchema};
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A table scheduled by the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTable {
    /// Structure used for reads, writes and checksums
    pub schema: TableSchema,
    /// In-plan dependencies
    pub depends_on: BTreeSet<TableName>,
    /// Discovery-time row count
    pub estimated_rows: u64,
}

impl PlannedTable {
    /// Qualified name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &TableName {
        &self.schema.name
    }
}

/// Ordered levels of tables. Read-only once computed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    levels: Vec<Vec<PlannedTable>>,
}

impl MigrationPlan {
    /// Levels in execution order
    #[inline]
    #[must_use]
    pub fn levels(&self) -> &[Vec<PlannedTable>] {
        &self.levels
    }

    /// Tables in total order (level by level, name order within a level)
    pub fn iter(&self) -> impl Iterator<Item = &PlannedTable> {
        self.levels.iter().flatten()
    }

    /// Qualified names in total order
    #[must_use]
    pub fn order(&self) -> Vec<TableName> {
        self.iter().map(|t| t.name().clone()).collect()
    }

    /// Number of tables
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Whether the plan is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table_count() == 0
    }

    /// Sum of estimated rows
    #[must_use]
    pub fn total_estimated_rows(&self) -> u64 {
        self.iter().map(|t| t.estimated_rows).sum()
    }

    /// Level index of a table
    #[must_use]
    pub fn level_of(&self, table: &TableName) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|t| t.name() == table))
    }

    /// Look up a planned table
    #[must_use]
    pub fn get(&self, table: &TableName) -> Option<&PlannedTable> {
        self.iter().find(|t| t.name() == table)
    }
}

/// Plans migration order from foreign-key metadata
#[derive(Debug, Clone, Default)]
pub struct DependencyPlanner {
    excluded: BTreeSet<TableName>,
}

impl DependencyPlanner {
    /// Planner with no exclusions
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: leave these tables out of the plan
    #[must_use]
    pub fn with_excluded<I>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = TableName>,
    {
        self.excluded.extend(tables);
        self
    }

    /// Whether `table` is excluded
    #[must_use]
    pub fn is_excluded(&self, table: &TableName) -> bool {
        self.excluded.contains(table)
    }

    /// Layer `tables` into levels.
    ///
    /// Fails with [`PlanError::DependencyCycle`] naming every table that
    /// sits on a cycle. Tables that only depend on a cycle are not named.
    pub fn plan(&self, tables: &[DiscoveredTable]) -> Result<MigrationPlan, PlanError> {
        let included: BTreeMap<&TableName, &DiscoveredTable> = tables
            .iter()
            .filter(|t| !self.excluded.contains(t.name()))
            .map(|t| (t.name(), t))
            .collect();

        // Node ids are positions in name order, so graph iteration and
        // index order agree.
        let names: Vec<&TableName> = included.keys().copied().collect();
        let index: BTreeMap<&TableName, usize> =
            names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        let mut depends_on: Vec<BTreeSet<TableName>> = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            graph.add_node(i);
            let deps: BTreeSet<TableName> = included[name]
                .schema
                .referenced_tables()
                .into_iter()
                .filter(|dep| index.contains_key(dep))
                .collect();
            for dep in &deps {
                // dependency -> dependent
                graph.add_edge(index[dep], i, ());
            }
            depends_on.push(deps);
        }

        let mut in_degree: Vec<usize> = (0..names.len())
            .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();
        let mut current: Vec<usize> = (0..names.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut levels = Vec::new();
        let mut placed = 0usize;

        while !current.is_empty() {
            current.sort_unstable();
            let mut next = Vec::new();
            for &node in &current {
                for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            placed += current.len();
            levels.push(
                current
                    .iter()
                    .map(|&i| PlannedTable {
                        schema: included[names[i]].schema.clone(),
                        depends_on: depends_on[i].clone(),
                        estimated_rows: included[names[i]].row_count,
                    })
                    .collect(),
            );
            current = next;
        }

        if placed < names.len() {
            let mut cyclic: Vec<TableName> = tarjan_scc(&graph)
                .into_iter()
                .filter(|component| component.len() > 1)
                .flatten()
                .map(|i| names[i].clone())
                .collect();
            cyclic.sort();
            tracing::warn!("Dependency cycle detected among {} tables", cyclic.len());
            return Err(PlanError::DependencyCycle { tables: cyclic });
        }

        tracing::debug!(
            "Planned {} tables in {} levels",
            placed,
            levels.len()
        );
        Ok(MigrationPlan { levels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnSpec;

    fn table(name: &str, deps: &[&str]) -> DiscoveredTable {
        let mut schema = TableSchema::new(
            TableName::new("public", name),
            vec![ColumnSpec::new("id", "integer", false)],
        )
        .with_primary_key(["id"]);
        for dep in deps {
            schema = schema.with_foreign_key([format!("{dep}_id")], TableName::new("public", *dep));
        }
        DiscoveredTable {
            schema,
            row_count: 10,
        }
    }

    fn level_names(plan: &MigrationPlan) -> Vec<Vec<String>> {
        plan.levels()
            .iter()
            .map(|l| l.iter().map(|t| t.name().table().to_string()).collect())
            .collect()
    }

    #[test]
    fn test_levels_and_name_ties() {
        let tables = vec![
            table("orders", &["customers", "products"]),
            table("products", &[]),
            table("customers", &[]),
            table("order_items", &["orders", "products"]),
        ];
        let plan = DependencyPlanner::new().plan(&tables).unwrap();
        assert_eq!(
            level_names(&plan),
            vec![
                vec!["customers", "products"],
                vec!["orders"],
                vec!["order_items"],
            ]
        );
        assert_eq!(plan.total_estimated_rows(), 40);
        assert_eq!(plan.level_of(&TableName::new("public", "orders")), Some(1));
    }

    #[test]
    fn test_self_reference_and_missing_targets_ignored() {
        let tables = vec![table("employees", &["employees", "departments_gone"])];
        let plan = DependencyPlanner::new().plan(&tables).unwrap();
        assert_eq!(level_names(&plan), vec![vec!["employees"]]);
        assert!(plan.levels()[0][0].depends_on.is_empty());
    }

    #[test]
    fn test_cycle_names_only_members() {
        let tables = vec![
            table("a", &["b"]),
            table("b", &["a"]),
            table("c", &["a"]),
            table("d", &[]),
        ];
        let err = DependencyPlanner::new().plan(&tables).unwrap_err();
        assert_eq!(
            err,
            PlanError::DependencyCycle {
                tables: vec![TableName::new("public", "a"), TableName::new("public", "b")],
            }
        );
    }

    #[test]
    fn test_exclusion_breaks_cycle() {
        let tables = vec![table("a", &["b"]), table("b", &["a"])];
        let plan = DependencyPlanner::new()
            .with_excluded([TableName::new("public", "b")])
            .plan(&tables)
            .unwrap();
        assert_eq!(level_names(&plan), vec![vec!["a"]]);
    }

    #[test]
    fn test_empty_input() {
        let plan = DependencyPlanner::new().plan(&[]).unwrap();
        assert!(plan.is_empty());
        assert!(plan.levels().is_empty());
    }
}
