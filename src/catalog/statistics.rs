//! Table Statistics
//!
//! Row counts and per-column distinct-count estimates feeding the planner's
//! cardinality and selectivity math. Counts are kept incrementally on the
//! write path and fully recomputed by `statistics collect`.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::types::{OrdValue, RowData};

/// Statistics for one table.
#[derive(Debug, Clone, Default)]
pub struct TableStatistics {
    pub row_count: u64,
    /// Distinct values per column, estimated from the last full collect.
    pub distinct_counts: HashMap<String, u64>,
}

/// Process-wide statistics registry keyed by `db#table`.
#[derive(Default)]
pub struct StatisticsManager {
    tables: RwLock<HashMap<String, TableStatistics>>,
}

impl StatisticsManager {
    pub fn new() -> StatisticsManager {
        StatisticsManager::default()
    }

    fn key(db: &str, table: &str) -> String {
        format!("{db}#{table}")
    }

    pub fn table(&self, db: &str, table: &str) -> TableStatistics {
        self.tables
            .read()
            .get(&Self::key(db, table))
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_count(&self, db: &str, table: &str) -> u64 {
        self.table(db, table).row_count
    }

    pub fn record_insert(&self, db: &str, table: &str, count: u64) {
        let mut tables = self.tables.write();
        tables.entry(Self::key(db, table)).or_default().row_count += count;
    }

    pub fn record_delete(&self, db: &str, table: &str, count: u64) {
        let mut tables = self.tables.write();
        let stats = tables.entry(Self::key(db, table)).or_default();
        stats.row_count = stats.row_count.saturating_sub(count);
    }

    pub fn forget_table(&self, db: &str, table: &str) {
        self.tables.write().remove(&Self::key(db, table));
    }

    pub fn forget_database(&self, db: &str) {
        let prefix = format!("{db}#");
        self.tables.write().retain(|key, _| !key.starts_with(&prefix));
    }

    /// Full recomputation from materialized rows.
    pub fn collect(&self, db: &str, table: &str, rows: &[RowData]) {
        let mut distinct: HashMap<String, HashSet<OrdValue>> = HashMap::new();
        for row in rows {
            for (column, value) in row {
                distinct
                    .entry(column.clone())
                    .or_default()
                    .insert(OrdValue(value.clone()));
            }
        }
        let stats = TableStatistics {
            row_count: rows.len() as u64,
            distinct_counts: distinct
                .into_iter()
                .map(|(column, values)| (column, values.len() as u64))
                .collect(),
        };
        self.tables.write().insert(Self::key(db, table), stats);
    }

    /// Snapshot for `statistics collect` responses.
    pub fn snapshot(&self) -> Vec<(String, TableStatistics)> {
        self.tables
            .read()
            .iter()
            .map(|(key, stats)| (key.clone(), stats.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn incremental_counts_and_full_collect() {
        let manager = StatisticsManager::new();
        manager.record_insert("u", "c", 3);
        assert_eq!(manager.row_count("u", "c"), 3);
        manager.record_delete("u", "c", 1);
        assert_eq!(manager.row_count("u", "c"), 2);

        let rows: Vec<RowData> = [1, 1, 2]
            .iter()
            .map(|i| {
                let mut row = RowData::new();
                row.insert("id".into(), Value::Int(*i));
                row
            })
            .collect();
        manager.collect("u", "c", &rows);

        let stats = manager.table("u", "c");
        assert_eq!(stats.row_count, 3);
        assert_eq!(stats.distinct_counts["id"], 2);
    }

    #[test]
    fn forget_database_drops_all_its_tables() {
        let manager = StatisticsManager::new();
        manager.record_insert("a", "t1", 1);
        manager.record_insert("a", "t2", 1);
        manager.record_insert("b", "t1", 1);
        manager.forget_database("a");
        assert_eq!(manager.row_count("a", "t1"), 0);
        assert_eq!(manager.row_count("b", "t1"), 1);
    }
}
