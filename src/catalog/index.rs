//! Secondary Indexes
//!
//! In-memory ordered indexes over row columns, maintained on every write and
//! rebuilt from storage when a table is opened. The registry treats indexes
//! as plugins behind [`SecondaryIndex`]; only the ordered kind answers
//! lookups — fulltext/fuzzy/regex definitions are recorded but inert.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::catalog::database::{IndexDef, IndexKind};
use crate::types::{OrdValue, RowData, Value};

/// Comparison operators an index lookup can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Between,
}

/// Pluggable secondary index over one or more columns.
pub trait SecondaryIndex: Send + Sync {
    fn definition(&self) -> &IndexDef;
    fn insert(&self, row_id: Uuid, row: &RowData);
    fn remove(&self, row_id: Uuid, row: &RowData);
    /// Row ids matching the operator against the index's first column;
    /// `None` when this index kind cannot serve lookups.
    fn lookup(&self, op: IndexOp, value: &Value, high: Option<&Value>) -> Option<Vec<Uuid>>;
    fn entry_count(&self) -> usize;
    fn clear(&self);
}

/// Ordered index: `BTreeMap<composite key, row ids>`. Lookups match on the
/// first column; composite keys keep multi-column definitions usable for
/// equality prefixes.
pub struct OrderedIndex {
    definition: IndexDef,
    entries: RwLock<BTreeMap<Vec<OrdValue>, Vec<Uuid>>>,
}

impl OrderedIndex {
    pub fn new(definition: IndexDef) -> OrderedIndex {
        OrderedIndex {
            definition,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn key_of(&self, row: &RowData) -> Option<Vec<OrdValue>> {
        let key: Vec<OrdValue> = self
            .definition
            .columns
            .iter()
            .map(|column| OrdValue(row.get(column).cloned().unwrap_or(Value::Null)))
            .collect();
        if key.iter().all(|v| v.0.is_null()) {
            None
        } else {
            Some(key)
        }
    }
}

impl SecondaryIndex for OrderedIndex {
    fn definition(&self) -> &IndexDef {
        &self.definition
    }

    fn insert(&self, row_id: Uuid, row: &RowData) {
        if let Some(key) = self.key_of(row) {
            let mut entries = self.entries.write();
            let ids = entries.entry(key).or_default();
            if !ids.contains(&row_id) {
                ids.push(row_id);
            }
        }
    }

    fn remove(&self, row_id: Uuid, row: &RowData) {
        if let Some(key) = self.key_of(row) {
            let mut entries = self.entries.write();
            if let Some(ids) = entries.get_mut(&key) {
                ids.retain(|id| *id != row_id);
                if ids.is_empty() {
                    entries.remove(&key);
                }
            }
        }
    }

    fn lookup(&self, op: IndexOp, value: &Value, high: Option<&Value>) -> Option<Vec<Uuid>> {
        let entries = self.entries.read();
        let first = OrdValue(value.clone());
        let matches: Vec<Uuid> = match op {
            IndexOp::Eq => entries
                .range((
                    Bound::Included(vec![first.clone()]),
                    Bound::Unbounded,
                ))
                .take_while(|(key, _)| key.first() == Some(&first))
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect(),
            IndexOp::Lt | IndexOp::Le => entries
                .iter()
                .take_while(|(key, _)| {
                    key.first().map_or(false, |k| {
                        k < &first || (op == IndexOp::Le && k == &first)
                    })
                })
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect(),
            IndexOp::Gt | IndexOp::Ge => entries
                .range((Bound::Included(vec![first.clone()]), Bound::Unbounded))
                .filter(|(key, _)| {
                    key.first().map_or(false, |k| {
                        k > &first || (op == IndexOp::Ge && k == &first)
                    })
                })
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect(),
            IndexOp::Between => {
                let high = OrdValue(high?.clone());
                entries
                    .range((Bound::Included(vec![first.clone()]), Bound::Unbounded))
                    .take_while(|(key, _)| key.first().map_or(false, |k| k <= &high))
                    .flat_map(|(_, ids)| ids.iter().copied())
                    .collect()
            }
        };
        Some(matches)
    }

    fn entry_count(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Inert index for the auxiliary kinds: definition is kept, lookups decline.
pub struct AuxiliaryIndex {
    definition: IndexDef,
}

impl AuxiliaryIndex {
    pub fn new(definition: IndexDef) -> AuxiliaryIndex {
        AuxiliaryIndex { definition }
    }
}

impl SecondaryIndex for AuxiliaryIndex {
    fn definition(&self) -> &IndexDef {
        &self.definition
    }
    fn insert(&self, _row_id: Uuid, _row: &RowData) {}
    fn remove(&self, _row_id: Uuid, _row: &RowData) {}
    fn lookup(&self, _op: IndexOp, _value: &Value, _high: Option<&Value>) -> Option<Vec<Uuid>> {
        None
    }
    fn entry_count(&self) -> usize {
        0
    }
    fn clear(&self) {}
}

/// Builds the right index implementation for a definition.
pub fn build_index(definition: IndexDef) -> std::sync::Arc<dyn SecondaryIndex> {
    match definition.kind {
        IndexKind::Ordered => std::sync::Arc::new(OrderedIndex::new(definition)),
        _ => std::sync::Arc::new(AuxiliaryIndex::new(definition)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64) -> RowData {
        let mut row = RowData::new();
        row.insert("id".into(), Value::Int(id));
        row
    }

    fn index() -> OrderedIndex {
        OrderedIndex::new(IndexDef {
            columns: vec!["id".into()],
            kind: IndexKind::Ordered,
        })
    }

    #[test]
    fn equality_and_range_lookups() {
        let index = index();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for (i, row_id) in ids.iter().enumerate() {
            index.insert(*row_id, &row([25, 30, 35, 40][i]));
        }

        let eq = index.lookup(IndexOp::Eq, &Value::Int(30), None).unwrap();
        assert_eq!(eq, vec![ids[1]]);

        let gt = index.lookup(IndexOp::Gt, &Value::Int(30), None).unwrap();
        assert_eq!(gt.len(), 2);
        assert!(gt.contains(&ids[2]) && gt.contains(&ids[3]));

        let le = index.lookup(IndexOp::Le, &Value::Int(30), None).unwrap();
        assert_eq!(le.len(), 2);

        let between = index
            .lookup(IndexOp::Between, &Value::Int(30), Some(&Value::Int(35)))
            .unwrap();
        assert_eq!(between.len(), 2);
    }

    #[test]
    fn remove_drops_only_the_given_row() {
        let index = index();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.insert(a, &row(7));
        index.insert(b, &row(7));
        index.remove(a, &row(7));

        assert_eq!(index.lookup(IndexOp::Eq, &Value::Int(7), None).unwrap(), vec![b]);
        assert_eq!(index.entry_count(), 1);
    }

    #[test]
    fn auxiliary_kinds_decline_lookups() {
        let aux = build_index(IndexDef {
            columns: vec!["bio".into()],
            kind: IndexKind::FullText,
        });
        aux.insert(Uuid::new_v4(), &row(1));
        assert!(aux.lookup(IndexOp::Eq, &Value::Int(1), None).is_none());
    }
}
