//! Catalog
//!
//! Owns database and table metadata, the per-table storage engines, replica
//! placement maps, secondary indexes, and table statistics. The on-disk
//! layout under the data path:
//!
//! ```text
//! <db>.meta                      serialized {name, tables[]}
//! <db>/<table>/storage.bin/      LSM directory (sstable-*.db + MANIFEST)
//! <db>/<table>/replica.bin       serialized {row_id -> {primary, secondary}}
//! ```
//!
//! After a successful persistence pass the in-memory catalog and the set of
//! persisted meta files are identical; that invariant is what the scheduler
//! re-establishes every interval.

pub mod database;
pub mod index;
pub mod persistence;
pub mod replica;
pub mod statistics;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::node::{NodeId, Placement};
use crate::cluster::reshuffle::{CatalogView, RowLocation};
use crate::config::StorageConfig;
use crate::errors::{SerengetiError, SerengetiResult};
use crate::storage::LsmEngine;
use crate::types::{row_from_json, row_key, row_to_json, RowData, Value};

use database::{ColumnDef, DatabaseMeta, IndexDef, TableMeta, TableSchema};
use index::{build_index, SecondaryIndex};
use replica::ReplicaMap;
use statistics::StatisticsManager;

pub use database::IndexKind;
pub use index::IndexOp;

const STORAGE_DIR: &str = "storage.bin";

/// One open table: storage engine, replica map, schema and indexes.
pub struct TableHandle {
    pub db: String,
    pub name: String,
    pub engine: Arc<LsmEngine>,
    pub replicas: ReplicaMap,
    schema: RwLock<TableSchema>,
    indexes: RwLock<Vec<Arc<dyn SecondaryIndex>>>,
}

impl TableHandle {
    pub fn schema(&self) -> TableSchema {
        self.schema.read().clone()
    }

    pub fn indexes(&self) -> Vec<Arc<dyn SecondaryIndex>> {
        self.indexes.read().clone()
    }

    /// Ordered index whose first column matches, if any.
    pub fn index_on(&self, column: &str) -> Option<Arc<dyn SecondaryIndex>> {
        self.indexes
            .read()
            .iter()
            .find(|idx| idx.definition().columns.first().map(String::as_str) == Some(column))
            .cloned()
    }

    /// Validates a row against the schema: unknown columns are rejected and
    /// values are coerced to the declared types. Schemaless tables accept
    /// anything.
    pub fn validate_row(&self, row: &RowData) -> SerengetiResult<RowData> {
        let schema = self.schema.read();
        if schema.is_schemaless() {
            return Ok(row.clone());
        }
        let mut validated = RowData::with_capacity(row.len());
        for (column, value) in row {
            let def = schema.column(column).ok_or_else(|| {
                SerengetiError::parse(format!(
                    "unknown column '{column}' for table {}.{}",
                    self.db, self.name
                ))
            })?;
            let value = match def.data_type {
                Some(data_type) => value.coerce(data_type)?,
                None => value.clone(),
            };
            validated.insert(column.clone(), value);
        }
        Ok(validated)
    }
}

/// The catalog proper.
pub struct Catalog {
    data_path: PathBuf,
    storage_config: StorageConfig,
    databases: RwLock<HashMap<String, DatabaseMeta>>,
    tables: RwLock<HashMap<String, Arc<TableHandle>>>,
    pub statistics: StatisticsManager,
}

impl Catalog {
    /// Opens the catalog, loading every `<db>.meta` file and reattaching the
    /// table engines, replica maps and indexes they reference.
    pub fn open(data_path: &Path, storage_config: StorageConfig) -> SerengetiResult<Catalog> {
        std::fs::create_dir_all(data_path)?;
        let catalog = Catalog {
            data_path: data_path.to_path_buf(),
            storage_config,
            databases: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            statistics: StatisticsManager::new(),
        };

        for entry in std::fs::read_dir(data_path)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(db_name) = file_name.strip_suffix(".meta") else {
                continue;
            };
            let meta = DatabaseMeta::from_json(&std::fs::read_to_string(entry.path())?)?;
            for table_meta in &meta.tables {
                let handle = catalog.open_table_handle(db_name, table_meta)?;
                catalog.rebuild_table_state(&handle)?;
                catalog
                    .tables
                    .write()
                    .insert(table_key(db_name, &table_meta.name), handle);
            }
            catalog.databases.write().insert(db_name.to_string(), meta);
        }

        let db_count = catalog.databases.read().len();
        info!(path = %data_path.display(), databases = db_count, "catalog opened");
        Ok(catalog)
    }

    fn table_dir(&self, db: &str, table: &str) -> PathBuf {
        self.data_path.join(db).join(table)
    }

    fn meta_path(&self, db: &str) -> PathBuf {
        self.data_path.join(format!("{db}.meta"))
    }

    fn open_table_handle(
        &self,
        db: &str,
        meta: &TableMeta,
    ) -> SerengetiResult<Arc<TableHandle>> {
        let dir = self.table_dir(db, &meta.name);
        std::fs::create_dir_all(&dir)?;
        let engine = LsmEngine::open(&dir.join(STORAGE_DIR), self.storage_config.clone())?;
        let replicas = ReplicaMap::open(&dir)?;
        let indexes = meta
            .indexes
            .iter()
            .cloned()
            .map(build_index)
            .collect::<Vec<_>>();
        Ok(Arc::new(TableHandle {
            db: db.to_string(),
            name: meta.name.clone(),
            engine: Arc::new(engine),
            replicas,
            schema: RwLock::new(meta.schema.clone()),
            indexes: RwLock::new(indexes),
        }))
    }

    /// Rebuilds indexes and row counts from storage after open.
    fn rebuild_table_state(&self, handle: &TableHandle) -> SerengetiResult<()> {
        let rows = self.materialize_local_rows(handle)?;
        for index in handle.indexes() {
            index.clear();
            for (row_id, row) in &rows {
                index.insert(*row_id, row);
            }
        }
        self.statistics
            .record_insert(&handle.db, &handle.name, rows.len() as u64);
        Ok(())
    }

    // ---- database operations ----

    pub fn create_database(&self, name: &str) -> SerengetiResult<()> {
        validate_name(name)?;
        {
            let mut databases = self.databases.write();
            if databases.contains_key(name) {
                return Err(SerengetiError::CatalogConflict(format!(
                    "database '{name}' already exists"
                )));
            }
            databases.insert(name.to_string(), DatabaseMeta::new(name));
        }
        std::fs::create_dir_all(self.data_path.join(name))?;
        self.persist_database(name)?;
        info!(db = name, "created database");
        Ok(())
    }

    pub fn drop_database(&self, name: &str) -> SerengetiResult<()> {
        let meta = self
            .databases
            .write()
            .remove(name)
            .ok_or_else(|| SerengetiError::NotFound(format!("database '{name}'")))?;
        {
            let mut tables = self.tables.write();
            for table in meta.table_names() {
                tables.remove(&table_key(name, &table));
            }
        }
        self.statistics.forget_database(name);
        let _ = std::fs::remove_file(self.meta_path(name));
        let dir = self.data_path.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        info!(db = name, "dropped database");
        Ok(())
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases.read().contains_key(name)
    }

    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ---- table operations ----

    pub fn create_table(
        &self,
        db: &str,
        table: &str,
        schema: TableSchema,
    ) -> SerengetiResult<()> {
        validate_name(table)?;
        let meta = TableMeta {
            name: table.to_string(),
            schema,
            indexes: Vec::new(),
            created_at: chrono::Utc::now(),
        };
        {
            let mut databases = self.databases.write();
            let database = databases
                .get_mut(db)
                .ok_or_else(|| SerengetiError::NotFound(format!("database '{db}'")))?;
            if database.table(table).is_some() {
                return Err(SerengetiError::CatalogConflict(format!(
                    "table '{db}.{table}' already exists"
                )));
            }
            database.tables.push(meta.clone());
        }
        let handle = self.open_table_handle(db, &meta)?;
        // Materialize the empty artifacts so the directory is complete.
        handle.replicas.save_to_disk()?;
        self.tables.write().insert(table_key(db, table), handle);
        self.persist_database(db)?;
        info!(db, table, "created table");
        Ok(())
    }

    /// Drops a table. Idempotent: a missing table returns `false`.
    pub fn drop_table(&self, db: &str, table: &str) -> SerengetiResult<bool> {
        let existed = {
            let mut databases = self.databases.write();
            match databases.get_mut(db) {
                Some(database) => {
                    let before = database.tables.len();
                    database.tables.retain(|t| t.name != table);
                    database.tables.len() != before
                }
                None => false,
            }
        };
        if !existed {
            return Ok(false);
        }
        self.tables.write().remove(&table_key(db, table));
        self.statistics.forget_table(db, table);
        let dir = self.table_dir(db, table);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        self.persist_database(db)?;
        info!(db, table, "dropped table");
        Ok(true)
    }

    pub fn table_exists(&self, db: &str, table: &str) -> bool {
        self.tables.read().contains_key(&table_key(db, table))
    }

    pub fn list_tables(&self, db: &str) -> SerengetiResult<Vec<String>> {
        self.databases
            .read()
            .get(db)
            .map(|meta| meta.table_names())
            .ok_or_else(|| SerengetiError::NotFound(format!("database '{db}'")))
    }

    pub fn table(&self, db: &str, table: &str) -> SerengetiResult<Arc<TableHandle>> {
        self.tables
            .read()
            .get(&table_key(db, table))
            .cloned()
            .ok_or_else(|| SerengetiError::NotFound(format!("table '{db}.{table}'")))
    }

    /// `{db: [table, ...]}` snapshot served by `GET /meta`.
    pub fn meta_snapshot(&self) -> serde_json::Value {
        let databases = self.databases.read();
        let map: serde_json::Map<String, serde_json::Value> = databases
            .iter()
            .map(|(name, meta)| (name.clone(), serde_json::json!(meta.table_names())))
            .collect();
        serde_json::Value::Object(map)
    }

    // ---- schema / index management ----

    pub fn add_column(&self, db: &str, table: &str, column: ColumnDef) -> SerengetiResult<()> {
        let handle = self.table(db, table)?;
        {
            let mut schema = handle.schema.write();
            if schema.column(&column.name).is_some() {
                return Err(SerengetiError::CatalogConflict(format!(
                    "column '{}' already exists on {db}.{table}",
                    column.name
                )));
            }
            schema.columns.push(column.clone());
        }
        self.sync_table_meta(db, table, &handle)?;
        Ok(())
    }

    pub fn drop_column(&self, db: &str, table: &str, column: &str) -> SerengetiResult<()> {
        let handle = self.table(db, table)?;
        {
            let mut schema = handle.schema.write();
            let before = schema.columns.len();
            schema.columns.retain(|c| c.name != column);
            if schema.columns.len() == before {
                return Err(SerengetiError::NotFound(format!(
                    "column '{column}' on {db}.{table}"
                )));
            }
        }
        self.sync_table_meta(db, table, &handle)?;
        Ok(())
    }

    pub fn create_index(
        &self,
        db: &str,
        table: &str,
        columns: Vec<String>,
        kind: IndexKind,
    ) -> SerengetiResult<()> {
        let handle = self.table(db, table)?;
        {
            let indexes = handle.indexes.read();
            if indexes
                .iter()
                .any(|idx| idx.definition().columns == columns)
            {
                return Err(SerengetiError::CatalogConflict(format!(
                    "index on {db}.{table}({}) already exists",
                    columns.join(", ")
                )));
            }
        }
        let index = build_index(IndexDef {
            columns: columns.clone(),
            kind,
        });
        for (row_id, row) in self.materialize_local_rows(&handle)? {
            index.insert(row_id, &row);
        }
        handle.indexes.write().push(index);
        self.sync_table_meta(db, table, &handle)?;
        info!(db, table, columns = %columns.join(","), "created index");
        Ok(())
    }

    pub fn drop_index(
        &self,
        db: &str,
        table: &str,
        columns: &[String],
    ) -> SerengetiResult<bool> {
        let handle = self.table(db, table)?;
        let removed = {
            let mut indexes = handle.indexes.write();
            let before = indexes.len();
            indexes.retain(|idx| idx.definition().columns != columns);
            indexes.len() != before
        };
        if removed {
            self.sync_table_meta(db, table, &handle)?;
        }
        Ok(removed)
    }

    pub fn list_indexes(&self, db: &str, table: Option<&str>) -> SerengetiResult<Vec<serde_json::Value>> {
        let tables = match table {
            Some(t) => vec![t.to_string()],
            None => self.list_tables(db)?,
        };
        let mut listing = Vec::new();
        for table_name in tables {
            let handle = self.table(db, &table_name)?;
            for index in handle.indexes() {
                let def = index.definition();
                listing.push(serde_json::json!({
                    "table": format!("{db}.{table_name}"),
                    "columns": def.columns,
                    "kind": format!("{:?}", def.kind),
                    "entries": index.entry_count(),
                }));
            }
        }
        Ok(listing)
    }

    /// Mirrors a handle's live schema/indexes back into the database meta.
    fn sync_table_meta(
        &self,
        db: &str,
        table: &str,
        handle: &TableHandle,
    ) -> SerengetiResult<()> {
        {
            let mut databases = self.databases.write();
            let database = databases
                .get_mut(db)
                .ok_or_else(|| SerengetiError::NotFound(format!("database '{db}'")))?;
            let meta = database
                .table_mut(table)
                .ok_or_else(|| SerengetiError::NotFound(format!("table '{db}.{table}'")))?;
            meta.schema = handle.schema();
            meta.indexes = handle
                .indexes()
                .iter()
                .map(|idx| idx.definition().clone())
                .collect();
        }
        self.persist_database(db)
    }

    // ---- row operations (local effects only; replication is the caller's) ----

    /// Writes a row locally: LSM put, index maintenance, statistics.
    pub fn write_row_local(
        &self,
        db: &str,
        table: &str,
        row_id: Uuid,
        row: &RowData,
    ) -> SerengetiResult<()> {
        let handle = self.table(db, table)?;
        let previous = self.read_row_local(&handle, row_id)?;
        let payload = serde_json::to_vec(&row_to_json(row))?;
        handle.engine.put(&row_key(row_id), Some(&payload))?;

        for index in handle.indexes() {
            if let Some(ref old) = previous {
                index.remove(row_id, old);
            }
            index.insert(row_id, row);
        }
        if previous.is_none() {
            self.statistics.record_insert(db, table, 1);
        }
        Ok(())
    }

    /// Deletes a row locally. Returns `true` when the row existed.
    pub fn delete_row_local(&self, db: &str, table: &str, row_id: Uuid) -> SerengetiResult<bool> {
        let handle = self.table(db, table)?;
        let previous = self.read_row_local(&handle, row_id)?;
        handle.engine.delete(&row_key(row_id))?;
        handle.replicas.remove(row_id);
        if let Some(ref old) = previous {
            for index in handle.indexes() {
                index.remove(row_id, old);
            }
            self.statistics.record_delete(db, table, 1);
        }
        Ok(previous.is_some())
    }

    /// Reads one locally stored row.
    pub fn read_row_local(
        &self,
        handle: &TableHandle,
        row_id: Uuid,
    ) -> SerengetiResult<Option<RowData>> {
        match handle.engine.get(&row_key(row_id))? {
            Some(payload) => {
                let json: serde_json::Value = serde_json::from_slice(&payload)?;
                Ok(Some(row_from_json(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Every locally stored row of a table.
    pub fn materialize_local_rows(
        &self,
        handle: &TableHandle,
    ) -> SerengetiResult<Vec<(Uuid, RowData)>> {
        let mut rows = Vec::new();
        for (key, payload) in handle.engine.scan()? {
            let Ok(id) = std::str::from_utf8(&key).unwrap_or("").parse::<Uuid>() else {
                warn!(table = %handle.name, "skipping row with unparseable key");
                continue;
            };
            let json: serde_json::Value = serde_json::from_slice(&payload)?;
            rows.push((id, row_from_json(&json)?));
        }
        Ok(rows)
    }

    /// Drops every database. Backs the `delete everything` control command.
    pub fn delete_everything(&self) -> SerengetiResult<usize> {
        let names = self.list_databases();
        let count = names.len();
        for name in names {
            self.drop_database(&name)?;
        }
        Ok(count)
    }

    // ---- persistence ----

    /// Writes one database's meta file atomically.
    pub fn persist_database(&self, db: &str) -> SerengetiResult<()> {
        let serialized = {
            let databases = self.databases.read();
            let meta = databases
                .get(db)
                .ok_or_else(|| SerengetiError::NotFound(format!("database '{db}'")))?;
            meta.to_json()?
        };
        let path = self.meta_path(db);
        let tmp = path.with_extension("meta.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// One full persistence pass: every meta file, every table's storage and
    /// replica artifacts. Returns per-database durations for health.
    pub fn persist_all(&self) -> SerengetiResult<Vec<(String, std::time::Duration)>> {
        let mut durations = Vec::new();
        for db in self.list_databases() {
            let started = std::time::Instant::now();
            self.persist_database(&db)?;
            for table in self.list_tables(&db)? {
                let handle = self.table(&db, &table)?;
                handle.engine.save_to_disk()?;
                handle.replicas.save_to_disk()?;
            }
            durations.push((db, started.elapsed()));
        }
        Ok(durations)
    }
}

impl CatalogView for Catalog {
    fn rows_placed_on(&self, node: NodeId) -> Vec<RowLocation> {
        let handles: Vec<Arc<TableHandle>> = self.tables.read().values().cloned().collect();
        let mut locations = Vec::new();
        for handle in handles {
            for (row_id, placement) in handle.replicas.rows_held_by(node) {
                locations.push(RowLocation {
                    db: handle.db.clone(),
                    table: handle.name.clone(),
                    row_id,
                    placement,
                });
            }
        }
        locations
    }

    fn row_payload(&self, db: &str, table: &str, row_id: Uuid) -> Option<serde_json::Value> {
        let handle = self.table(db, table).ok()?;
        self.read_row_local(&handle, row_id)
            .ok()
            .flatten()
            .map(|row| row_to_json(&row))
    }

    fn update_placement(&self, db: &str, table: &str, row_id: Uuid, placement: Placement) {
        if let Ok(handle) = self.table(db, table) {
            handle.replicas.set(row_id, placement);
        }
    }
}

fn table_key(db: &str, table: &str) -> String {
    format!("{db}#{table}")
}

/// Names become filesystem paths, so they must be non-empty and free of
/// separators.
fn validate_name(name: &str) -> SerengetiResult<()> {
    if name.is_empty() {
        return Err(SerengetiError::parse("name must not be empty"));
    }
    if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
        return Err(SerengetiError::parse(format!("invalid name '{name}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn catalog(dir: &Path) -> Catalog {
        Catalog::open(dir, StorageConfig::default()).unwrap()
    }

    fn schema_id_name() -> TableSchema {
        TableSchema {
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
        }
    }

    #[test]
    fn create_conflicts_and_empty_names_fail() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(dir.path());

        assert!(matches!(
            catalog.create_database(""),
            Err(SerengetiError::Parse { .. })
        ));
        catalog.create_database("u").unwrap();
        assert!(matches!(
            catalog.create_database("u"),
            Err(SerengetiError::CatalogConflict(_))
        ));

        // A very long (but legal) name is fine.
        let long = "d".repeat(200);
        catalog.create_database(&long).unwrap();
        assert!(catalog.database_exists(&long));
    }

    #[test]
    fn drop_table_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(dir.path());
        catalog.create_database("u").unwrap();
        catalog.create_table("u", "c", TableSchema::default()).unwrap();

        assert!(catalog.drop_table("u", "c").unwrap());
        assert!(!catalog.drop_table("u", "c").unwrap());
    }

    #[test]
    fn rows_survive_catalog_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let row_id = Uuid::new_v4();
        {
            let catalog = catalog(dir.path());
            catalog.create_database("u").unwrap();
            catalog.create_table("u", "c", schema_id_name()).unwrap();
            let mut row = RowData::new();
            row.insert("id".into(), Value::Int(1));
            row.insert("name".into(), Value::Str("A".into()));
            catalog.write_row_local("u", "c", row_id, &row).unwrap();
            catalog.persist_all().unwrap();
        }
        let reopened = catalog(dir.path());
        assert!(reopened.table_exists("u", "c"));
        let handle = reopened.table("u", "c").unwrap();
        let row = reopened.read_row_local(&handle, row_id).unwrap().unwrap();
        assert_eq!(row["id"], Value::Int(1));
        assert_eq!(reopened.statistics.row_count("u", "c"), 1);
    }

    #[test]
    fn schema_rejects_unknown_columns() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(dir.path());
        catalog.create_database("u").unwrap();
        catalog.create_table("u", "c", schema_id_name()).unwrap();
        let handle = catalog.table("u", "c").unwrap();

        let mut bad = RowData::new();
        bad.insert("surprise".into(), Value::Int(1));
        assert!(handle.validate_row(&bad).is_err());

        let mut good = RowData::new();
        good.insert("id".into(), Value::Int(1));
        assert_eq!(handle.validate_row(&good).unwrap()["id"], Value::Int(1));
    }

    #[test]
    fn index_is_rebuilt_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let row_id = Uuid::new_v4();
        {
            let catalog = catalog(dir.path());
            catalog.create_database("u").unwrap();
            catalog.create_table("u", "c", schema_id_name()).unwrap();
            catalog
                .create_index("u", "c", vec!["id".into()], IndexKind::Ordered)
                .unwrap();
            let mut row = RowData::new();
            row.insert("id".into(), Value::Int(42));
            catalog.write_row_local("u", "c", row_id, &row).unwrap();
            catalog.persist_all().unwrap();
        }
        let reopened = catalog(dir.path());
        let handle = reopened.table("u", "c").unwrap();
        let index = handle.index_on("id").expect("index should be rebuilt");
        assert_eq!(
            index.lookup(IndexOp::Eq, &Value::Int(42), None).unwrap(),
            vec![row_id]
        );
    }

    #[test]
    fn meta_snapshot_lists_databases_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(dir.path());
        catalog.create_database("u").unwrap();
        catalog.create_table("u", "a", TableSchema::default()).unwrap();
        catalog.create_table("u", "b", TableSchema::default()).unwrap();

        let snapshot = catalog.meta_snapshot();
        assert_eq!(snapshot["u"], serde_json::json!(["a", "b"]));
    }
}
