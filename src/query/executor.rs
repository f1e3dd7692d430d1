//! Plan Executor
//!
//! Interprets a [`QueryPlan`] linearly over a materialized row stream and
//! owns the write paths (insert/update/delete with replication). Any
//! operation error terminates the plan; partial results are never returned,
//! and the query's memory context is released on every exit path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, IndexOp};
use crate::cluster::messages::ClusterMessage;
use crate::cluster::node::{Membership, Placement};
use crate::cluster::transport::Transport;
use crate::config::QueryConfig;
use crate::errors::{SerengetiError, SerengetiResult};
use crate::metrics::Metrics;
use crate::query::ast::*;
use crate::query::cache::QueryCache;
use crate::query::memory::MemoryManager;
use crate::query::parser::parse_request;
use crate::query::planner::{Planner, QueryOperation, QueryPlan};
use crate::query::spill::{HashJoinSpillManager, SortSpillManager};
use crate::types::{row_to_json, OrdValue, RowData, Value};

/// Per-statement response element: `{executed, list?, explain?, error?}`.
#[derive(Debug, Clone, Serialize)]
pub struct StatementOutcome {
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatementOutcome {
    pub fn ok() -> StatementOutcome {
        StatementOutcome {
            executed: true,
            list: None,
            explain: None,
            error: None,
        }
    }

    pub fn ok_list(list: Vec<serde_json::Value>) -> StatementOutcome {
        StatementOutcome {
            executed: true,
            list: Some(list),
            explain: None,
            error: None,
        }
    }

    pub fn ok_explain(explain: impl Into<String>) -> StatementOutcome {
        StatementOutcome {
            executed: true,
            list: None,
            explain: Some(explain.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> StatementOutcome {
        StatementOutcome {
            executed: false,
            list: None,
            explain: None,
            error: Some(error.into()),
        }
    }

    /// NotFound on idempotent operations: `executed: false`, no error text.
    pub fn not_executed() -> StatementOutcome {
        StatementOutcome {
            executed: false,
            list: None,
            explain: None,
            error: None,
        }
    }

    fn with_explain(mut self, explain: impl Into<String>) -> StatementOutcome {
        self.explain = Some(explain.into());
        self
    }
}

pub struct QueryExecutor {
    catalog: Arc<Catalog>,
    membership: Arc<Membership>,
    transport: Arc<Transport>,
    pub planner: Planner,
    pub cache: Arc<QueryCache>,
    memory: Arc<MemoryManager>,
    metrics: Arc<Metrics>,
    config: QueryConfig,
}

impl QueryExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<Catalog>,
        membership: Arc<Membership>,
        transport: Arc<Transport>,
        memory: Arc<MemoryManager>,
        cache: Arc<QueryCache>,
        metrics: Arc<Metrics>,
        config: QueryConfig,
    ) -> QueryExecutor {
        QueryExecutor {
            catalog,
            membership,
            transport,
            planner: Planner::new(),
            cache,
            memory,
            metrics,
            config,
        }
    }

    /// Executes a raw request body: one outcome per `;`-separated statement.
    /// BEGIN/COMMIT/ROLLBACK batch writes locally within this request.
    pub async fn execute_request(&self, input: &str) -> Vec<StatementOutcome> {
        let parsed = parse_request(input);
        Metrics::add(&self.metrics.statements_parsed, parsed.len() as u64);

        let mut outcomes = Vec::with_capacity(parsed.len());
        let mut transaction: Option<Vec<Statement>> = None;

        for statement in parsed {
            let statement = match statement {
                Ok(statement) => statement,
                Err(e) => {
                    Metrics::incr(&self.metrics.query_errors);
                    outcomes.push(StatementOutcome::failed(e.to_string()));
                    continue;
                }
            };

            match statement {
                Statement::Begin => {
                    transaction = Some(Vec::new());
                    outcomes.push(StatementOutcome::ok_explain("transaction started"));
                }
                Statement::Commit => match transaction.take() {
                    Some(batch) => {
                        let mut results = Vec::with_capacity(batch.len());
                        for queued in batch {
                            let outcome = self.execute_statement(&queued).await;
                            results.push(serde_json::to_value(&outcome).unwrap_or_default());
                        }
                        outcomes.push(
                            StatementOutcome::ok_list(results)
                                .with_explain("transaction committed"),
                        );
                    }
                    None => {
                        outcomes.push(StatementOutcome::ok_explain("no open transaction"));
                    }
                },
                Statement::Rollback => {
                    let dropped = transaction.take().map(|batch| batch.len()).unwrap_or(0);
                    outcomes.push(StatementOutcome::ok_explain(format!(
                        "rolled back {dropped} statements"
                    )));
                }
                other if transaction.is_some() && other.write_target().is_some() => {
                    transaction.as_mut().unwrap().push(other);
                    outcomes.push(StatementOutcome::ok_explain("queued until COMMIT"));
                }
                other => {
                    outcomes.push(self.execute_statement(&other).await);
                }
            }
        }

        // An un-committed batch at end of request is discarded, matching
        // ROLLBACK semantics.
        if let Some(batch) = transaction {
            if !batch.is_empty() {
                warn!(dropped = batch.len(), "request ended with an open transaction");
            }
        }
        outcomes
    }

    /// Executes one statement, mapping errors into in-band outcomes.
    pub async fn execute_statement(&self, statement: &Statement) -> StatementOutcome {
        Metrics::incr(&self.metrics.queries_executed);
        match self.dispatch(statement).await {
            Ok(outcome) => outcome,
            Err(SerengetiError::NotFound(what)) => {
                StatementOutcome::failed(format!("not found: {what}"))
            }
            Err(e) => {
                Metrics::incr(&self.metrics.query_errors);
                StatementOutcome::failed(e.to_string())
            }
        }
    }

    async fn dispatch(&self, statement: &Statement) -> SerengetiResult<StatementOutcome> {
        match statement {
            Statement::ShowDatabases => Ok(StatementOutcome::ok_list(
                self.catalog
                    .list_databases()
                    .into_iter()
                    .map(|name| serde_json::json!(name))
                    .collect(),
            )),
            Statement::ShowTables { db } => Ok(StatementOutcome::ok_list(
                self.catalog
                    .list_tables(db)?
                    .into_iter()
                    .map(|name| serde_json::json!(name))
                    .collect(),
            )),
            Statement::ShowIndexes { db, table } => Ok(StatementOutcome::ok_list(
                self.catalog.list_indexes(db, table.as_deref())?,
            )),
            Statement::CreateDatabase { name } => {
                self.catalog.create_database(name)?;
                Ok(StatementOutcome::ok())
            }
            Statement::DropDatabase { name } => {
                self.catalog.drop_database(name)?;
                self.cache.invalidate_database(name);
                Ok(StatementOutcome::ok())
            }
            Statement::CreateTable { db, table, columns } => {
                self.catalog.create_table(
                    db,
                    table,
                    crate::catalog::database::TableSchema {
                        columns: columns.clone(),
                    },
                )?;
                Ok(StatementOutcome::ok())
            }
            Statement::DropTable { db, table } => {
                let dropped = self.catalog.drop_table(db, table)?;
                self.cache.invalidate(db, table);
                if dropped {
                    Ok(StatementOutcome::ok())
                } else {
                    Ok(StatementOutcome::not_executed())
                }
            }
            Statement::AlterTable { db, table, action } => {
                match action {
                    AlterAction::AddColumn(column) => {
                        self.catalog.add_column(db, table, column.clone())?
                    }
                    AlterAction::DropColumn(name) => self.catalog.drop_column(db, table, name)?,
                }
                self.cache.invalidate(db, table);
                Ok(StatementOutcome::ok())
            }
            Statement::CreateIndex {
                db,
                table,
                columns,
                kind,
            } => {
                self.catalog.create_index(db, table, columns.clone(), *kind)?;
                Ok(StatementOutcome::ok())
            }
            Statement::DropIndex { db, table, columns } => {
                if self.catalog.drop_index(db, table, columns)? {
                    Ok(StatementOutcome::ok())
                } else {
                    Ok(StatementOutcome::not_executed())
                }
            }
            Statement::Insert {
                db,
                table,
                columns,
                rows,
            } => self.execute_insert(db, table, columns, rows).await,
            Statement::Select(select) => self.execute_select(select).await,
            Statement::Update {
                db,
                table,
                assignments,
                predicate,
            } => self.execute_update(db, table, assignments, predicate.as_ref()).await,
            Statement::Delete {
                db,
                table,
                predicate,
            } => self.execute_delete(db, table, predicate.as_ref()).await,
            // Reaching here means the statement arrived outside a request
            // context (e.g. replayed from a batch); treat as no-ops.
            Statement::Begin | Statement::Commit | Statement::Rollback => {
                Ok(StatementOutcome::ok())
            }
            Statement::Optimization(command) => Ok(self.execute_optimization(*command)),
            Statement::Cache(command) => Ok(self.execute_cache(*command)),
            Statement::StatisticsCollect => self.execute_statistics_collect(),
            Statement::DeleteEverything => {
                let dropped = self.catalog.delete_everything()?;
                self.cache.clear();
                Ok(StatementOutcome::ok_explain(format!(
                    "dropped {dropped} databases"
                )))
            }
        }
    }

    // ---- control commands ----

    fn execute_optimization(&self, command: OptimizationCommand) -> StatementOutcome {
        match command {
            OptimizationCommand::Enable => {
                self.planner.set_enabled(true);
                StatementOutcome::ok_explain("optimization enabled")
            }
            OptimizationCommand::Disable => {
                self.planner.set_enabled(false);
                StatementOutcome::ok_explain("optimization disabled")
            }
            OptimizationCommand::Status => StatementOutcome::ok_list(vec![serde_json::json!({
                "enabled": self.planner.is_enabled(),
                "level": self.planner.level(),
            })]),
            OptimizationCommand::Level(level) => {
                self.planner.set_level(level);
                StatementOutcome::ok_explain(format!("optimization level set to {level}"))
            }
        }
    }

    fn execute_cache(&self, command: CacheCommand) -> StatementOutcome {
        match command {
            CacheCommand::Enable => {
                self.cache.set_enabled(true);
                StatementOutcome::ok_explain("cache enabled")
            }
            CacheCommand::Disable => {
                self.cache.set_enabled(false);
                StatementOutcome::ok_explain("cache disabled")
            }
            CacheCommand::Clear => {
                self.cache.clear();
                StatementOutcome::ok_explain("cache cleared")
            }
            CacheCommand::Stats => {
                let stats = serde_json::to_value(self.cache.stats()).unwrap_or_default();
                StatementOutcome::ok_list(vec![stats])
            }
        }
    }

    fn execute_statistics_collect(&self) -> SerengetiResult<StatementOutcome> {
        let mut collected = Vec::new();
        for db in self.catalog.list_databases() {
            for table in self.catalog.list_tables(&db)? {
                let handle = self.catalog.table(&db, &table)?;
                let rows: Vec<RowData> = self
                    .catalog
                    .materialize_local_rows(&handle)?
                    .into_iter()
                    .map(|(_, row)| row)
                    .collect();
                self.catalog.statistics.collect(&db, &table, &rows);
                collected.push(serde_json::json!({
                    "table": format!("{db}.{table}"),
                    "rows": rows.len(),
                }));
            }
        }
        Ok(StatementOutcome::ok_list(collected))
    }

    // ---- write paths ----

    async fn execute_insert(
        &self,
        db: &str,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> SerengetiResult<StatementOutcome> {
        let handle = self.catalog.table(db, table)?;
        let mut inserted = 0u64;
        for values in rows {
            let row: RowData = columns.iter().cloned().zip(values.iter().cloned()).collect();
            let row = handle.validate_row(&row)?;
            let row_id = Uuid::new_v4();

            self.catalog.write_row_local(db, table, row_id, &row)?;
            let placement = self.transport.pick_primary_secondary();
            handle.replicas.set(row_id, placement);

            self.replicate_row(
                db,
                table,
                row_id,
                placement,
                ClusterMessage::ReplicateInsertObject {
                    db: db.to_string(),
                    table: table.to_string(),
                    row_id,
                    json: row_to_json(&row),
                },
            )
            .await;
            inserted += 1;
        }
        self.cache.invalidate(db, table);
        Ok(StatementOutcome::ok_list(vec![serde_json::json!({
            "inserted": inserted
        })]))
    }

    async fn execute_update(
        &self,
        db: &str,
        table: &str,
        assignments: &[(String, Value)],
        predicate: Option<&Predicate>,
    ) -> SerengetiResult<StatementOutcome> {
        let handle = self.catalog.table(db, table)?;
        let mut updated = 0u64;
        for (row_id, row) in self.catalog.materialize_local_rows(&handle)? {
            if !matches_opt(predicate, &row)? {
                continue;
            }
            let mut next = row.clone();
            for (column, value) in assignments {
                next.insert(column.clone(), value.clone());
            }
            let next = handle.validate_row(&next)?;
            self.catalog.write_row_local(db, table, row_id, &next)?;

            if let Some(placement) = handle.replicas.get(row_id) {
                self.replicate_row(
                    db,
                    table,
                    row_id,
                    placement,
                    ClusterMessage::ReplicateUpdateObject {
                        db: db.to_string(),
                        table: table.to_string(),
                        row_id,
                        json: row_to_json(&next),
                    },
                )
                .await;
            }
            updated += 1;
        }
        self.cache.invalidate(db, table);
        Ok(StatementOutcome::ok_list(vec![serde_json::json!({
            "updated": updated
        })]))
    }

    async fn execute_delete(
        &self,
        db: &str,
        table: &str,
        predicate: Option<&Predicate>,
    ) -> SerengetiResult<StatementOutcome> {
        let handle = self.catalog.table(db, table)?;
        let mut deleted = 0u64;
        for (row_id, row) in self.catalog.materialize_local_rows(&handle)? {
            if !matches_opt(predicate, &row)? {
                continue;
            }
            let placement = handle.replicas.get(row_id);
            self.catalog.delete_row_local(db, table, row_id)?;
            if let Some(placement) = placement {
                self.replicate_row(
                    db,
                    table,
                    row_id,
                    placement,
                    ClusterMessage::ReplicateDeleteObject {
                        db: db.to_string(),
                        table: table.to_string(),
                        row_id,
                    },
                )
                .await;
            }
            deleted += 1;
        }
        self.cache.invalidate(db, table);
        Ok(StatementOutcome::ok_list(vec![serde_json::json!({
            "deleted": deleted
        })]))
    }

    /// Sends a replication message to both holders (skipping self) and
    /// broadcasts the authoritative placement. Failures are swallowed after
    /// metric recording; local effect already succeeded.
    async fn replicate_row(
        &self,
        db: &str,
        table: &str,
        row_id: Uuid,
        placement: Placement,
        message: ClusterMessage,
    ) {
        let local = self.membership.local_id();
        let mut holders = vec![placement.primary];
        if placement.secondary != placement.primary {
            holders.push(placement.secondary);
        }
        for holder in holders {
            if holder == local {
                continue;
            }
            if let Some(ip) = self.transport.ip_from_node_id(holder) {
                self.transport.send_to_node(holder, ip, &message).await;
            }
        }
        self.transport
            .broadcast_all_nodes(&ClusterMessage::TableReplicaObjectInsertOrReplace {
                db: db.to_string(),
                table: table.to_string(),
                row_id,
                primary: placement.primary,
                secondary: placement.secondary,
            })
            .await;
    }

    // ---- read path ----

    async fn execute_select(&self, select: &SelectStatement) -> SerengetiResult<StatementOutcome> {
        // Table existence is a statement error, not a plan error.
        self.catalog.table(&select.db, &select.table)?;
        if let Some(join) = &select.join {
            self.catalog.table(&join.db, &join.table)?;
        }

        let plan = self.planner.plan_select(&self.catalog, select);
        let explain = plan.explain();
        let fingerprint = QueryCache::fingerprint(&Statement::Select(select.clone()));

        if let Some(rows) = self.cache.get(fingerprint) {
            debug!(fingerprint, "result cache hit");
            return Ok(StatementOutcome::ok_list(
                rows.iter().map(row_to_json).collect(),
            )
            .with_explain(format!("{explain} [cache: hit]")));
        }

        let query_id = self.memory.create_query_context();
        let execution = async { self.run_plan(query_id, &plan).await };
        let result = if self.config.query_timeout_ms > 0 {
            match tokio::time::timeout(
                Duration::from_millis(self.config.query_timeout_ms),
                execution,
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SerengetiError::Cancelled(format!(
                    "query exceeded {}ms",
                    self.config.query_timeout_ms
                ))),
            }
        } else {
            execution.await
        };
        // Spill files and charges go away regardless of the outcome.
        self.memory.release_query_context(query_id);
        let rows = result?;

        self.cache.put(
            fingerprint,
            plan.tables_read.clone(),
            Arc::new(rows.clone()),
        );
        Ok(
            StatementOutcome::ok_list(rows.iter().map(row_to_json).collect())
                .with_explain(format!("{explain} [cache: miss]")),
        )
    }

    /// Runs the operation list sequentially over a materialized stream.
    async fn run_plan(&self, query_id: Uuid, plan: &QueryPlan) -> SerengetiResult<Vec<RowData>> {
        let mut rows: Vec<RowData> = Vec::new();
        for (position, operation) in plan.operations.iter().enumerate() {
            let op_id = format!("op-{position}");
            rows = match operation {
                QueryOperation::Scan { db, table } => self.scan_table(db, table).await?,
                QueryOperation::IndexLookup {
                    db,
                    table,
                    column,
                    op,
                    value,
                    high,
                } => {
                    self.index_lookup(db, table, column, *op, value, high.as_ref())
                        .await?
                }
                QueryOperation::Filter { predicate } => {
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows {
                        if matches(predicate, &row)? {
                            kept.push(row);
                        }
                    }
                    kept
                }
                QueryOperation::Sort { keys } => {
                    self.sort_rows(query_id, &op_id, rows, keys.clone())?
                }
                QueryOperation::Limit { limit, offset } => {
                    let iter = rows.into_iter().skip(*offset);
                    match limit {
                        Some(n) => iter.take(*n).collect(),
                        None => iter.collect(),
                    }
                }
                QueryOperation::HashJoin {
                    db,
                    table,
                    left_column,
                    right_column,
                    build_right,
                } => {
                    self.hash_join(
                        query_id,
                        &op_id,
                        rows,
                        db,
                        table,
                        left_column,
                        right_column,
                        *build_right,
                    )
                    .await?
                }
                QueryOperation::IndexJoin {
                    db,
                    table,
                    left_column,
                    right_column,
                } => {
                    self.index_join(rows, db, table, left_column, right_column)
                        .await?
                }
                QueryOperation::HashAggregate {
                    group_by,
                    aggregates,
                } => hash_aggregate(rows, group_by, aggregates),
                QueryOperation::ScalarAggregate { aggregates } => {
                    vec![scalar_aggregate(&rows, aggregates)]
                }
                QueryOperation::Project { columns } => rows
                    .into_iter()
                    .map(|row| {
                        columns
                            .iter()
                            .map(|column| {
                                (
                                    column.clone(),
                                    row.get(column).cloned().unwrap_or(Value::Null),
                                )
                            })
                            .collect()
                    })
                    .collect(),
            };
        }
        Ok(rows)
    }

    /// Row stream for a table: everything stored locally, plus rows fetched
    /// from replica holders when this node holds no copy. A failed fetch
    /// from the primary retries the secondary.
    async fn scan_table(&self, db: &str, table: &str) -> SerengetiResult<Vec<RowData>> {
        let handle = self.catalog.table(db, table)?;
        let mut by_id: HashMap<Uuid, RowData> = self
            .catalog
            .materialize_local_rows(&handle)?
            .into_iter()
            .collect();

        let missing: Vec<(Uuid, Placement)> = handle
            .replicas
            .all()
            .into_iter()
            .filter(|(row_id, _)| !by_id.contains_key(row_id))
            .collect();
        if missing.is_empty() {
            return Ok(by_id.into_values().collect());
        }

        // Fetch whole-table dumps from holders until every missing row is
        // covered. Primary holders first, then secondaries as the retry.
        let mut holders: Vec<Uuid> = Vec::new();
        for (_, placement) in &missing {
            if !holders.contains(&placement.primary) {
                holders.push(placement.primary);
            }
        }
        for (_, placement) in &missing {
            if !holders.contains(&placement.secondary) {
                holders.push(placement.secondary);
            }
        }

        let local = self.membership.local_id();
        let wanted: Vec<Uuid> = missing.iter().map(|(row_id, _)| *row_id).collect();
        for holder in holders {
            if holder == local {
                continue;
            }
            if wanted.iter().all(|row_id| by_id.contains_key(row_id)) {
                break;
            }
            let Some(ip) = self.transport.ip_from_node_id(holder) else {
                continue;
            };
            let Some(rows) = self.transport.request_table_rows(ip, db, table).await else {
                continue;
            };
            for (row_id, json) in rows {
                if wanted.contains(&row_id) && !by_id.contains_key(&row_id) {
                    if let Ok(row) = crate::types::row_from_json(&json) {
                        by_id.insert(row_id, row);
                    }
                }
            }
        }

        if !wanted.iter().all(|row_id| by_id.contains_key(row_id)) {
            warn!(db = %db, table = %table, "scan is missing rows whose holders are unreachable");
        }
        Ok(by_id.into_values().collect())
    }

    async fn index_lookup(
        &self,
        db: &str,
        table: &str,
        column: &str,
        op: CompareOp,
        value: &Value,
        high: Option<&Value>,
    ) -> SerengetiResult<Vec<RowData>> {
        let handle = self.catalog.table(db, table)?;
        let Some(index) = handle.index_on(column) else {
            // Index dropped between planning and execution: degrade to a
            // scan plus the equivalent filter.
            let rows = self.scan_table(db, table).await?;
            let predicate = match high {
                Some(high) => Predicate::Between {
                    column: column.to_string(),
                    low: value.clone(),
                    high: high.clone(),
                },
                None => Predicate::Compare {
                    column: column.to_string(),
                    op,
                    value: value.clone(),
                },
            };
            let mut kept = Vec::new();
            for row in rows {
                if matches(&predicate, &row)? {
                    kept.push(row);
                }
            }
            return Ok(kept);
        };

        let index_op = match (op, high) {
            (_, Some(_)) => IndexOp::Between,
            (CompareOp::Eq, _) => IndexOp::Eq,
            (CompareOp::Lt, _) => IndexOp::Lt,
            (CompareOp::Le, _) => IndexOp::Le,
            (CompareOp::Gt, _) => IndexOp::Gt,
            (CompareOp::Ge, _) => IndexOp::Ge,
            _ => {
                return Err(SerengetiError::Internal(format!(
                    "planner emitted non-sargable index lookup {op:?}"
                )))
            }
        };
        let Some(row_ids) = index.lookup(index_op, value, high) else {
            return Ok(Vec::new());
        };

        let mut rows = Vec::with_capacity(row_ids.len());
        for row_id in row_ids {
            if let Some(row) = self.catalog.read_row_local(&handle, row_id)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn sort_rows(
        &self,
        query_id: Uuid,
        op_id: &str,
        rows: Vec<RowData>,
        keys: Vec<OrderKey>,
    ) -> SerengetiResult<Vec<RowData>> {
        let manager = Arc::new(Mutex::new(SortSpillManager::new(
            self.memory.spill_dir(),
            query_id,
            op_id,
            keys,
            self.config.sort_chunk_max_rows,
        )));
        self.memory
            .register_spill_manager(query_id, op_id, manager.clone());

        for row in rows {
            let bytes = manager.lock().add_row(row);
            if !self.memory.allocate(query_id, op_id, bytes) {
                return Err(SerengetiError::MemoryExhausted {
                    requested: bytes,
                    available: self
                        .memory
                        .pool_bytes()
                        .saturating_sub(self.memory.used_bytes()),
                });
            }
        }
        let merged = manager.lock().merge_chunks()?;
        Ok(merged)
    }

    #[allow(clippy::too_many_arguments)]
    async fn hash_join(
        &self,
        query_id: Uuid,
        op_id: &str,
        left_rows: Vec<RowData>,
        db: &str,
        table: &str,
        left_column: &str,
        right_column: &str,
        build_right: bool,
    ) -> SerengetiResult<Vec<RowData>> {
        let right_rows = self.scan_table(db, table).await?;
        let (build_rows, probe_rows, build_column, probe_column) = if build_right {
            (right_rows, left_rows, right_column, left_column)
        } else {
            (left_rows, right_rows, left_column, right_column)
        };

        let manager = Arc::new(Mutex::new(HashJoinSpillManager::new(
            self.memory.spill_dir(),
            query_id,
            op_id,
            self.config.join_partitions,
        )));
        self.memory
            .register_spill_manager(query_id, op_id, manager.clone());

        for row in build_rows {
            let Some(key) = join_key(&row, build_column) else {
                continue;
            };
            let bytes = manager.lock().insert(key, row);
            if !self.memory.allocate(query_id, op_id, bytes) {
                return Err(SerengetiError::MemoryExhausted {
                    requested: bytes,
                    available: self
                        .memory
                        .pool_bytes()
                        .saturating_sub(self.memory.used_bytes()),
                });
            }
        }

        // Partition the probe side the same way, then join partition by
        // partition so spilled build partitions are loaded at most once.
        let partition_count = manager.lock().partition_count();
        let mut probe_partitions: Vec<Vec<(String, RowData)>> =
            (0..partition_count).map(|_| Vec::new()).collect();
        for row in probe_rows {
            let Some(key) = join_key(&row, probe_column) else {
                continue;
            };
            let partition = manager.lock().partition_of(&key);
            probe_partitions[partition].push((key, row));
        }

        let mut joined = Vec::new();
        for (partition, probes) in probe_partitions.into_iter().enumerate() {
            let build_partition = manager.lock().take_partition(partition)?;
            if build_partition.is_empty() {
                continue;
            }
            for (key, probe_row) in probes {
                if let Some(matches) = build_partition.get(&key) {
                    for build_row in matches {
                        // Preserve probe input order; ties break by build
                        // insertion order.
                        let (left, right) = if build_right {
                            (&probe_row, build_row)
                        } else {
                            (build_row, &probe_row)
                        };
                        joined.push(merge_joined_row(left, right, table));
                    }
                }
            }
        }
        Ok(joined)
    }

    async fn index_join(
        &self,
        left_rows: Vec<RowData>,
        db: &str,
        table: &str,
        left_column: &str,
        right_column: &str,
    ) -> SerengetiResult<Vec<RowData>> {
        let handle = self.catalog.table(db, table)?;
        let Some(index) = handle.index_on(right_column) else {
            // Index disappeared; degrade to an in-memory hash join.
            return self.fallback_lookup_join(left_rows, db, table, left_column, right_column).await;
        };

        let mut joined = Vec::new();
        for left_row in &left_rows {
            let Some(value) = left_row.get(left_column) else {
                continue;
            };
            let Some(row_ids) = index.lookup(IndexOp::Eq, value, None) else {
                continue;
            };
            for row_id in row_ids {
                if let Some(right_row) = self.catalog.read_row_local(&handle, row_id)? {
                    joined.push(merge_joined_row(left_row, &right_row, table));
                }
            }
        }
        Ok(joined)
    }

    async fn fallback_lookup_join(
        &self,
        left_rows: Vec<RowData>,
        db: &str,
        table: &str,
        left_column: &str,
        right_column: &str,
    ) -> SerengetiResult<Vec<RowData>> {
        let right_rows = self.scan_table(db, table).await?;
        let mut by_key: HashMap<String, Vec<RowData>> = HashMap::new();
        for row in right_rows {
            if let Some(key) = join_key(&row, right_column) {
                by_key.entry(key).or_default().push(row);
            }
        }
        let mut joined = Vec::new();
        for left_row in &left_rows {
            let Some(key) = join_key(left_row, left_column) else {
                continue;
            };
            if let Some(matches) = by_key.get(&key) {
                for right_row in matches {
                    joined.push(merge_joined_row(left_row, right_row, table));
                }
            }
        }
        Ok(joined)
    }
}

/// Canonical join key text; numeric values normalize so `2` and `2.0`
/// join together.
fn join_key(row: &RowData, column: &str) -> Option<String> {
    match row.get(column) {
        None | Some(Value::Null) => None,
        Some(Value::Float(f)) if f.fract() == 0.0 => Some(format!("{}", *f as i64)),
        Some(value) => Some(value.as_text()),
    }
}

/// Merges a joined pair; clashing right-side columns are qualified with the
/// right table's name.
fn merge_joined_row(left: &RowData, right: &RowData, right_table: &str) -> RowData {
    let mut merged = left.clone();
    for (column, value) in right {
        if merged.contains_key(column) {
            merged.insert(format!("{right_table}.{column}"), value.clone());
        } else {
            merged.insert(column.clone(), value.clone());
        }
    }
    merged
}

fn matches_opt(predicate: Option<&Predicate>, row: &RowData) -> SerengetiResult<bool> {
    match predicate {
        Some(predicate) => matches(predicate, row),
        None => Ok(true),
    }
}

/// Predicate evaluation over one row.
pub fn matches(predicate: &Predicate, row: &RowData) -> SerengetiResult<bool> {
    match predicate {
        Predicate::And(left, right) => Ok(matches(left, row)? && matches(right, row)?),
        Predicate::Or(left, right) => Ok(matches(left, row)? || matches(right, row)?),
        Predicate::In { column, values } => {
            let actual = row.get(column).cloned().unwrap_or(Value::Null);
            Ok(values
                .iter()
                .any(|value| actual.compare(value) == Some(std::cmp::Ordering::Equal)))
        }
        Predicate::Between { column, low, high } => {
            let actual = row.get(column).cloned().unwrap_or(Value::Null);
            let above = matches!(
                actual.compare(low),
                Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
            );
            let below = matches!(
                actual.compare(high),
                Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
            );
            Ok(above && below)
        }
        Predicate::Compare { column, op, value } => {
            let actual = row.get(column).cloned().unwrap_or(Value::Null);
            let ordering = actual.compare(value);
            Ok(match op {
                CompareOp::Eq => ordering == Some(std::cmp::Ordering::Equal),
                CompareOp::Ne => ordering != Some(std::cmp::Ordering::Equal),
                CompareOp::Lt => ordering == Some(std::cmp::Ordering::Less),
                CompareOp::Le => matches!(
                    ordering,
                    Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
                ),
                CompareOp::Gt => ordering == Some(std::cmp::Ordering::Greater),
                CompareOp::Ge => matches!(
                    ordering,
                    Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
                ),
                CompareOp::Like => like_match(&actual.as_text(), &value.as_text()),
                CompareOp::Contains => actual.as_text().contains(&value.as_text()),
                CompareOp::Regex => {
                    let pattern = value.as_text();
                    let re = regex::Regex::new(&pattern).map_err(|e| {
                        SerengetiError::parse(format!("invalid regex '{pattern}': {e}"))
                    })?;
                    re.is_match(&actual.as_text())
                }
                CompareOp::Fuzzy => fuzzy_match(&actual.as_text(), &value.as_text()),
            })
        }
    }
}

/// SQL LIKE: `%` matches any run, `_` matches one character.
fn like_match(text: &str, pattern: &str) -> bool {
    let mut regex_pattern = String::with_capacity(pattern.len() + 2);
    regex_pattern.push('^');
    for c in pattern.chars() {
        match c {
            '%' => regex_pattern.push_str(".*"),
            '_' => regex_pattern.push('.'),
            other => regex_pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex_pattern.push('$');
    regex::Regex::new(&regex_pattern)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

/// Edit distance at most 2, case-insensitive.
fn fuzzy_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    if text.len().abs_diff(pattern.len()) > 2 {
        return false;
    }
    let mut previous: Vec<usize> = (0..=pattern.len()).collect();
    for (i, tc) in text.iter().enumerate() {
        let mut current = vec![i + 1];
        for (j, pc) in pattern.iter().enumerate() {
            let substitution = previous[j] + usize::from(tc != pc);
            current.push(substitution.min(previous[j + 1] + 1).min(current[j] + 1));
        }
        previous = current;
    }
    previous[pattern.len()] <= 2
}

// ---- aggregation ----

fn hash_aggregate(
    rows: Vec<RowData>,
    group_by: &[String],
    aggregates: &[AggregateExpr],
) -> Vec<RowData> {
    let mut groups: BTreeMap<Vec<OrdValue>, Vec<RowData>> = BTreeMap::new();
    for row in rows {
        let key: Vec<OrdValue> = group_by
            .iter()
            .map(|column| OrdValue(row.get(column).cloned().unwrap_or(Value::Null)))
            .collect();
        groups.entry(key).or_default().push(row);
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut output = RowData::new();
            for (column, value) in group_by.iter().zip(key) {
                output.insert(column.clone(), value.0);
            }
            for aggregate in aggregates {
                output.insert(aggregate.output_name(), compute_aggregate(&members, aggregate));
            }
            output
        })
        .collect()
}

fn scalar_aggregate(rows: &[RowData], aggregates: &[AggregateExpr]) -> RowData {
    let mut output = RowData::new();
    for aggregate in aggregates {
        output.insert(aggregate.output_name(), compute_aggregate(rows, aggregate));
    }
    output
}

fn compute_aggregate(rows: &[RowData], aggregate: &AggregateExpr) -> Value {
    let values = || {
        rows.iter()
            .filter_map(|row| aggregate.column.as_ref().and_then(|c| row.get(c)))
            .filter(|value| !value.is_null())
    };
    match aggregate.func {
        AggregateFunc::Count => match &aggregate.column {
            None => Value::Int(rows.len() as i64),
            Some(_) => Value::Int(values().count() as i64),
        },
        AggregateFunc::Sum => numeric_fold(values()),
        AggregateFunc::Avg => {
            let count = values().count();
            if count == 0 {
                return Value::Null;
            }
            match numeric_fold(values()) {
                Value::Int(sum) => Value::Float(sum as f64 / count as f64),
                Value::Float(sum) => Value::Float(sum / count as f64),
                other => other,
            }
        }
        AggregateFunc::Min => values()
            .map(|v| OrdValue(v.clone()))
            .min()
            .map(|v| v.0)
            .unwrap_or(Value::Null),
        AggregateFunc::Max => values()
            .map(|v| OrdValue(v.clone()))
            .max()
            .map(|v| v.0)
            .unwrap_or(Value::Null),
    }
}

/// Sums numeric values, staying integral while possible.
fn numeric_fold<'a>(values: impl Iterator<Item = &'a Value>) -> Value {
    let mut int_sum: i64 = 0;
    let mut float_sum: f64 = 0.0;
    let mut is_float = false;
    let mut any = false;
    for value in values {
        any = true;
        match value {
            Value::Int(i) => {
                int_sum = int_sum.wrapping_add(*i);
                float_sum += *i as f64;
            }
            Value::Float(f) => {
                is_float = true;
                float_sum += f;
            }
            _ => {}
        }
    }
    if !any {
        Value::Null
    } else if is_float {
        Value::Float(float_sum)
    } else {
        Value::Int(int_sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> RowData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn predicate_operators() {
        let r = row(&[
            ("age", Value::Int(30)),
            ("name", Value::Str("Alice".into())),
        ]);
        let check = |sql_op: CompareOp, value: Value, expected: bool| {
            let predicate = Predicate::Compare {
                column: "age".into(),
                op: sql_op,
                value,
            };
            assert_eq!(matches(&predicate, &r).unwrap(), expected, "{sql_op:?}");
        };
        check(CompareOp::Eq, Value::Int(30), true);
        check(CompareOp::Ne, Value::Int(30), false);
        check(CompareOp::Gt, Value::Int(29), true);
        check(CompareOp::Le, Value::Float(30.0), true);

        let like = Predicate::Compare {
            column: "name".into(),
            op: CompareOp::Like,
            value: Value::Str("A%ce".into()),
        };
        assert!(matches(&like, &r).unwrap());

        let fuzzy = Predicate::Compare {
            column: "name".into(),
            op: CompareOp::Fuzzy,
            value: Value::Str("alcie".into()),
        };
        assert!(matches(&fuzzy, &r).unwrap());

        let bad_regex = Predicate::Compare {
            column: "name".into(),
            op: CompareOp::Regex,
            value: Value::Str("(".into()),
        };
        assert!(matches(&bad_regex, &r).is_err());
    }

    #[test]
    fn in_and_between() {
        let r = row(&[("id", Value::Int(2))]);
        let in_list = Predicate::In {
            column: "id".into(),
            values: vec![Value::Int(1), Value::Int(2)],
        };
        assert!(matches(&in_list, &r).unwrap());

        let between = Predicate::Between {
            column: "id".into(),
            low: Value::Int(2),
            high: Value::Int(5),
        };
        assert!(matches(&between, &r).unwrap());

        let missing = Predicate::Compare {
            column: "ghost".into(),
            op: CompareOp::Eq,
            value: Value::Int(1),
        };
        assert!(!matches(&missing, &r).unwrap());
    }

    #[test]
    fn aggregates_compute() {
        let rows = vec![
            row(&[("age", Value::Int(10)), ("city", Value::Str("a".into()))]),
            row(&[("age", Value::Int(20)), ("city", Value::Str("a".into()))]),
            row(&[("age", Value::Int(30)), ("city", Value::Str("b".into()))]),
        ];

        let result = scalar_aggregate(
            &rows,
            &[
                AggregateExpr { func: AggregateFunc::Count, column: None },
                AggregateExpr { func: AggregateFunc::Sum, column: Some("age".into()) },
                AggregateExpr { func: AggregateFunc::Avg, column: Some("age".into()) },
                AggregateExpr { func: AggregateFunc::Min, column: Some("age".into()) },
                AggregateExpr { func: AggregateFunc::Max, column: Some("age".into()) },
            ],
        );
        assert_eq!(result["count(*)"], Value::Int(3));
        assert_eq!(result["sum(age)"], Value::Int(60));
        assert_eq!(result["avg(age)"], Value::Float(20.0));
        assert_eq!(result["min(age)"], Value::Int(10));
        assert_eq!(result["max(age)"], Value::Int(30));

        let grouped = hash_aggregate(
            rows,
            &["city".to_string()],
            &[AggregateExpr { func: AggregateFunc::Count, column: None }],
        );
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0]["city"], Value::Str("a".into()));
        assert_eq!(grouped[0]["count(*)"], Value::Int(2));
        assert_eq!(grouped[1]["count(*)"], Value::Int(1));
    }

    #[test]
    fn joined_rows_qualify_clashing_columns() {
        let left = row(&[("id", Value::Int(1)), ("name", Value::Str("l".into()))]);
        let right = row(&[("id", Value::Int(9)), ("owner", Value::Str("r".into()))]);
        let merged = merge_joined_row(&left, &right, "d");
        assert_eq!(merged["id"], Value::Int(1));
        assert_eq!(merged["d.id"], Value::Int(9));
        assert_eq!(merged["owner"], Value::Str("r".into()));
    }

    #[test]
    fn join_keys_normalize_numerics() {
        let a = row(&[("k", Value::Int(2))]);
        let b = row(&[("k", Value::Float(2.0))]);
        assert_eq!(join_key(&a, "k"), join_key(&b, "k"));
        assert_eq!(join_key(&a, "missing"), None);
    }
}
