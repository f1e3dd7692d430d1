//! Optimizer / Planner
//!
//! Turns a SELECT AST into an ordered list of [`QueryOperation`]s the
//! executor interprets sequentially. Access-path selection is index-aware;
//! residual predicates are AND-decomposed into filters (OR trees are left
//! unoptimized); join build sides are chosen by estimated cardinality from
//! the statistics manager. Plans are deterministic given the statement and
//! the statistics.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::catalog::Catalog;
use crate::query::ast::{
    AggregateExpr, CompareOp, OrderKey, Predicate, Projection, SelectItem, SelectStatement,
};
use crate::types::Value;

/// Default selectivities used when statistics cannot answer.
const SELECTIVITY_EQ: f64 = 0.3;
const SELECTIVITY_RANGE: f64 = 0.33;

/// One step of a query plan.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOperation {
    Scan {
        db: String,
        table: String,
    },
    IndexLookup {
        db: String,
        table: String,
        column: String,
        op: CompareOp,
        value: Value,
        /// Upper bound for BETWEEN lookups.
        high: Option<Value>,
    },
    Filter {
        predicate: Predicate,
    },
    HashJoin {
        db: String,
        table: String,
        left_column: String,
        right_column: String,
        /// Build the hash table from the joined (right) side.
        build_right: bool,
    },
    IndexJoin {
        db: String,
        table: String,
        left_column: String,
        right_column: String,
    },
    Sort {
        keys: Vec<OrderKey>,
    },
    Limit {
        limit: Option<usize>,
        offset: usize,
    },
    HashAggregate {
        group_by: Vec<String>,
        aggregates: Vec<AggregateExpr>,
    },
    ScalarAggregate {
        aggregates: Vec<AggregateExpr>,
    },
    Project {
        columns: Vec<String>,
    },
}

impl QueryOperation {
    /// Operation name as it appears in plan explains.
    pub fn label(&self) -> String {
        match self {
            QueryOperation::Scan { db, table } => format!("SCAN({db}.{table})"),
            QueryOperation::IndexLookup { column, op, value, high, .. } => match high {
                Some(high) => format!(
                    "INDEX_LOOKUP({column} BETWEEN {} AND {})",
                    value.as_text(),
                    high.as_text()
                ),
                None => format!("INDEX_LOOKUP({column} {} {})", op.symbol(), value.as_text()),
            },
            QueryOperation::Filter { .. } => "FILTER".into(),
            QueryOperation::HashJoin { db, table, .. } => format!("HASH_JOIN({db}.{table})"),
            QueryOperation::IndexJoin { db, table, .. } => format!("INDEX_JOIN({db}.{table})"),
            QueryOperation::Sort { keys } => {
                let columns: Vec<&str> = keys.iter().map(|k| k.column.as_str()).collect();
                format!("SORT({})", columns.join(", "))
            }
            QueryOperation::Limit { limit, offset } => match limit {
                Some(n) => format!("LIMIT({n}, {offset})"),
                None => format!("LIMIT(ALL, {offset})"),
            },
            QueryOperation::HashAggregate { group_by, .. } => {
                format!("HASH_AGGREGATE({})", group_by.join(", "))
            }
            QueryOperation::ScalarAggregate { .. } => "SCALAR_AGGREGATE".into(),
            QueryOperation::Project { columns } => format!("PROJECT({})", columns.join(", ")),
        }
    }
}

/// A finished plan plus the table tags the result cache invalidates on.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub operations: Vec<QueryOperation>,
    /// Every `(db, table)` the plan reads.
    pub tables_read: Vec<(String, String)>,
    pub estimated_rows: u64,
}

impl QueryPlan {
    pub fn explain(&self) -> String {
        let labels: Vec<String> = self.operations.iter().map(|op| op.label()).collect();
        format!("{} [est_rows={}]", labels.join(" -> "), self.estimated_rows)
    }
}

/// The planner. Optimization can be toggled and leveled at runtime through
/// the `optimization` control statements.
pub struct Planner {
    enabled: AtomicBool,
    level: AtomicU32,
}

impl Default for Planner {
    fn default() -> Self {
        Planner {
            enabled: AtomicBool::new(true),
            level: AtomicU32::new(2),
        }
    }
}

impl Planner {
    pub fn new() -> Planner {
        Planner::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_level(&self, level: u32) {
        self.level.store(level, Ordering::SeqCst);
    }

    pub fn level(&self) -> u32 {
        self.level.load(Ordering::SeqCst)
    }

    /// Builds the operation list for a SELECT.
    pub fn plan_select(&self, catalog: &Catalog, statement: &SelectStatement) -> QueryPlan {
        let mut operations = Vec::new();
        let mut tables_read = vec![(statement.db.clone(), statement.table.clone())];

        let base_rows = catalog
            .statistics
            .row_count(&statement.db, &statement.table)
            .max(1);
        let mut estimated_rows = base_rows as f64;

        // 1. Access path: an index on a sargable conjunct beats a scan.
        let mut residual_leaves: Vec<Predicate> = Vec::new();
        let mut access: Option<QueryOperation> = None;

        if let Some(predicate) = &statement.predicate {
            if self.is_enabled() && !predicate.contains_or() {
                let leaves = predicate.and_leaves();
                let mut chosen: Option<usize> = None;
                for (i, leaf) in leaves.iter().enumerate() {
                    if chosen.is_some() {
                        break;
                    }
                    match leaf {
                        Predicate::Compare { column, op, .. }
                            if op.is_sargable() && self.has_index(catalog, statement, column) =>
                        {
                            chosen = Some(i);
                        }
                        Predicate::Between { column, .. }
                            if self.has_index(catalog, statement, column) =>
                        {
                            chosen = Some(i);
                        }
                        _ => {}
                    }
                }
                if let Some(chosen) = chosen {
                    for (i, leaf) in leaves.iter().enumerate() {
                        if i == chosen {
                            access = Some(match leaf {
                                Predicate::Compare { column, op, value } => {
                                    estimated_rows *= selectivity(*op);
                                    QueryOperation::IndexLookup {
                                        db: statement.db.clone(),
                                        table: statement.table.clone(),
                                        column: column.clone(),
                                        op: *op,
                                        value: value.clone(),
                                        high: None,
                                    }
                                }
                                Predicate::Between { column, low, high } => {
                                    estimated_rows *= SELECTIVITY_RANGE;
                                    QueryOperation::IndexLookup {
                                        db: statement.db.clone(),
                                        table: statement.table.clone(),
                                        column: column.clone(),
                                        op: CompareOp::Ge,
                                        value: low.clone(),
                                        high: Some(high.clone()),
                                    }
                                }
                                _ => unreachable!("chosen leaf is sargable"),
                            });
                        } else {
                            residual_leaves.push((*leaf).clone());
                        }
                    }
                } else {
                    residual_leaves = leaves.into_iter().cloned().collect();
                }
            } else {
                // OR anywhere (or optimization off): scan + opaque filter.
                residual_leaves.push(predicate.clone());
            }
        }

        operations.push(access.unwrap_or(QueryOperation::Scan {
            db: statement.db.clone(),
            table: statement.table.clone(),
        }));

        // 2. Residual filters, AND-decomposed.
        for leaf in residual_leaves {
            estimated_rows *= match &leaf {
                Predicate::Compare { op, .. } => selectivity(*op),
                Predicate::Between { .. } => SELECTIVITY_RANGE,
                _ => SELECTIVITY_EQ,
            };
            operations.push(QueryOperation::Filter { predicate: leaf });
        }

        // 3. Join: index-nested-loop when the probe side is indexed on the
        // join key, otherwise hash join with the smaller side as build.
        if let Some(join) = &statement.join {
            tables_read.push((join.db.clone(), join.table.clone()));
            let right_indexed = catalog
                .table(&join.db, &join.table)
                .map(|handle| handle.index_on(&join.right_column).is_some())
                .unwrap_or(false);
            let right_rows = catalog.statistics.row_count(&join.db, &join.table).max(1);
            if right_indexed && self.is_enabled() {
                operations.push(QueryOperation::IndexJoin {
                    db: join.db.clone(),
                    table: join.table.clone(),
                    left_column: join.left_column.clone(),
                    right_column: join.right_column.clone(),
                });
            } else {
                operations.push(QueryOperation::HashJoin {
                    db: join.db.clone(),
                    table: join.table.clone(),
                    left_column: join.left_column.clone(),
                    right_column: join.right_column.clone(),
                    build_right: right_rows <= estimated_rows.ceil() as u64,
                });
            }
            estimated_rows = estimated_rows.max(right_rows as f64);
        }

        // 4. Aggregation reshapes the stream, so it comes before sort/limit.
        let aggregates = collect_aggregates(&statement.projection);
        if !statement.group_by.is_empty() {
            operations.push(QueryOperation::HashAggregate {
                group_by: statement.group_by.clone(),
                aggregates: aggregates.clone(),
            });
            estimated_rows = estimated_rows.sqrt().max(1.0);
        } else if !aggregates.is_empty() {
            operations.push(QueryOperation::ScalarAggregate {
                aggregates: aggregates.clone(),
            });
            estimated_rows = 1.0;
        }

        // 5. Sort, then limit; LIMIT stays above SORT to keep logical order.
        if !statement.order_by.is_empty() {
            operations.push(QueryOperation::Sort {
                keys: statement.order_by.clone(),
            });
        }
        if let Some(limit) = &statement.limit {
            operations.push(QueryOperation::Limit {
                limit: limit.limit,
                offset: limit.offset,
            });
            if let Some(n) = limit.limit {
                estimated_rows = estimated_rows.min(n as f64);
            }
        }

        // 6. Projection for plain column lists; aggregates already shaped
        // the output.
        if aggregates.is_empty() && statement.group_by.is_empty() {
            if let Projection::Items(items) = &statement.projection {
                let columns: Vec<String> = items
                    .iter()
                    .filter_map(|item| match item {
                        SelectItem::Column(name) => Some(name.clone()),
                        SelectItem::Aggregate(_) => None,
                    })
                    .collect();
                if !columns.is_empty() {
                    operations.push(QueryOperation::Project { columns });
                }
            }
        }

        QueryPlan {
            operations,
            tables_read,
            estimated_rows: estimated_rows.ceil() as u64,
        }
    }

    fn has_index(&self, catalog: &Catalog, statement: &SelectStatement, column: &str) -> bool {
        catalog
            .table(&statement.db, &statement.table)
            .map(|handle| handle.index_on(column).is_some())
            .unwrap_or(false)
    }
}

fn selectivity(op: CompareOp) -> f64 {
    match op {
        CompareOp::Eq => SELECTIVITY_EQ,
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => SELECTIVITY_RANGE,
        // Text operators: assume they filter about as much as a range.
        _ => SELECTIVITY_RANGE,
    }
}

fn collect_aggregates(projection: &Projection) -> Vec<AggregateExpr> {
    match projection {
        Projection::All => Vec::new(),
        Projection::Items(items) => items
            .iter()
            .filter_map(|item| match item {
                SelectItem::Aggregate(agg) => Some(agg.clone()),
                SelectItem::Column(_) => None,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::database::TableSchema;
    use crate::catalog::IndexKind;
    use crate::config::StorageConfig;
    use crate::query::parser::parse_statement;
    use crate::query::ast::Statement;

    fn fixture() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path(), StorageConfig::default()).unwrap();
        catalog.create_database("u").unwrap();
        catalog.create_table("u", "c", TableSchema::default()).unwrap();
        catalog.create_table("u", "d", TableSchema::default()).unwrap();
        (dir, catalog)
    }

    fn select(sql: &str) -> SelectStatement {
        match parse_statement(sql).unwrap() {
            Statement::Select(select) => select,
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn indexed_predicate_uses_index_lookup() {
        let (_dir, catalog) = fixture();
        catalog
            .create_index("u", "c", vec!["id".into()], IndexKind::Ordered)
            .unwrap();
        let planner = Planner::new();

        let plan = planner.plan_select(&catalog, &select("SELECT * FROM u.c WHERE id > 30"));
        assert!(plan.explain().contains("INDEX_LOOKUP(id > 30)"));

        // Same predicate without the index scans + filters.
        let plan = planner.plan_select(&catalog, &select("SELECT * FROM u.c WHERE age > 30"));
        assert_eq!(
            plan.operations[0],
            QueryOperation::Scan {
                db: "u".into(),
                table: "c".into()
            }
        );
        assert!(matches!(plan.operations[1], QueryOperation::Filter { .. }));
    }

    #[test]
    fn or_predicates_stay_unoptimized() {
        let (_dir, catalog) = fixture();
        catalog
            .create_index("u", "c", vec!["id".into()], IndexKind::Ordered)
            .unwrap();
        let planner = Planner::new();
        let plan = planner.plan_select(
            &catalog,
            &select("SELECT * FROM u.c WHERE id = 1 OR age = 2"),
        );
        assert!(matches!(plan.operations[0], QueryOperation::Scan { .. }));
        assert_eq!(plan.operations.len(), 2);
    }

    #[test]
    fn residual_conjuncts_become_filters() {
        let (_dir, catalog) = fixture();
        catalog
            .create_index("u", "c", vec!["id".into()], IndexKind::Ordered)
            .unwrap();
        let planner = Planner::new();
        let plan = planner.plan_select(
            &catalog,
            &select("SELECT * FROM u.c WHERE id = 1 AND age > 2 AND name = 'A'"),
        );
        assert!(matches!(
            plan.operations[0],
            QueryOperation::IndexLookup { .. }
        ));
        let filters = plan
            .operations
            .iter()
            .filter(|op| matches!(op, QueryOperation::Filter { .. }))
            .count();
        assert_eq!(filters, 2);
    }

    #[test]
    fn join_picks_index_join_when_probe_side_indexed() {
        let (_dir, catalog) = fixture();
        catalog
            .create_index("u", "d", vec!["owner_id".into()], IndexKind::Ordered)
            .unwrap();
        let planner = Planner::new();
        let plan = planner.plan_select(
            &catalog,
            &select("SELECT * FROM u.c JOIN u.d ON id = owner_id"),
        );
        assert!(plan
            .operations
            .iter()
            .any(|op| matches!(op, QueryOperation::IndexJoin { .. })));

        catalog.drop_index("u", "d", &["owner_id".into()]).unwrap();
        let plan = planner.plan_select(
            &catalog,
            &select("SELECT * FROM u.c JOIN u.d ON id = owner_id"),
        );
        assert!(plan
            .operations
            .iter()
            .any(|op| matches!(op, QueryOperation::HashJoin { .. })));
        assert_eq!(plan.tables_read.len(), 2);
    }

    #[test]
    fn aggregates_sort_and_limit_order() {
        let (_dir, catalog) = fixture();
        let planner = Planner::new();
        let plan = planner.plan_select(
            &catalog,
            &select("SELECT name, COUNT(*) FROM u.c GROUP BY name ORDER BY name ASC LIMIT 5"),
        );
        let labels: Vec<String> = plan.operations.iter().map(|op| op.label()).collect();
        assert_eq!(labels[0], "SCAN(u.c)");
        assert!(labels[1].starts_with("HASH_AGGREGATE"));
        assert!(labels[2].starts_with("SORT"));
        assert!(labels[3].starts_with("LIMIT"));
    }

    #[test]
    fn disabled_optimizer_always_scans() {
        let (_dir, catalog) = fixture();
        catalog
            .create_index("u", "c", vec!["id".into()], IndexKind::Ordered)
            .unwrap();
        let planner = Planner::new();
        planner.set_enabled(false);
        let plan = planner.plan_select(&catalog, &select("SELECT * FROM u.c WHERE id = 1"));
        assert!(matches!(plan.operations[0], QueryOperation::Scan { .. }));
    }
}
