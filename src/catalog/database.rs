//! Database Metadata
//!
//! One `<db>.meta` JSON file per database under the data path, listing the
//! database's tables in creation order together with their schemas and index
//! definitions. The catalog holds the same structure in memory; after a
//! successful persistence pass the two are identical by invariant.

use serde::{Deserialize, Serialize};

use crate::errors::SerengetiResult;
use crate::types::DataType;

/// Column definition carried by `CREATE TABLE` / `ALTER TABLE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
}

/// Table schema. An empty column list means the table is schemaless and
/// accepts any column set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn is_schemaless(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Secondary index kinds. Only `Ordered` serves lookups; the auxiliary
/// kinds are recognized and recorded but treated as inert plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Ordered,
    FullText,
    Fuzzy,
    Regex,
}

/// Persisted index definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub columns: Vec<String>,
    pub kind: IndexKind,
}

/// Per-table metadata stored inside the database meta file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    #[serde(default)]
    pub schema: TableSchema,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    #[serde(default = "chrono::Utc::now")]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The `<db>.meta` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMeta {
    pub name: String,
    pub tables: Vec<TableMeta>,
    #[serde(default = "chrono::Utc::now")]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DatabaseMeta {
    pub fn new(name: &str) -> DatabaseMeta {
        DatabaseMeta {
            name: name.to_string(),
            tables: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableMeta> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut TableMeta> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn to_json(&self) -> SerengetiResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> SerengetiResult<DatabaseMeta> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_serialization_is_identity() {
        let mut meta = DatabaseMeta::new("users");
        meta.tables.push(TableMeta {
            name: "contacts".into(),
            schema: TableSchema {
                columns: vec![
                    ColumnDef {
                        name: "id".into(),
                        data_type: Some(DataType::Int),
                    },
                    ColumnDef {
                        name: "name".into(),
                        data_type: Some(DataType::Varchar),
                    },
                ],
            },
            indexes: vec![IndexDef {
                columns: vec!["id".into()],
                kind: IndexKind::Ordered,
            }],
            created_at: chrono::Utc::now(),
        });

        let round_trip = DatabaseMeta::from_json(&meta.to_json().unwrap()).unwrap();
        assert_eq!(round_trip.name, "users");
        let table = round_trip.table("contacts").unwrap();
        assert_eq!(table.schema, meta.tables[0].schema);
        assert_eq!(table.indexes, meta.tables[0].indexes);
    }
}
