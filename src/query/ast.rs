//! Query AST
//!
//! Typed statements produced by the parser. `unparse` renders a normalized
//! SQL form (canonical keyword casing and spacing) which doubles as the
//! result cache's fingerprint input.

use crate::catalog::database::ColumnDef;
use crate::catalog::IndexKind;
use crate::types::Value;

/// One parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    ShowDatabases,
    ShowTables {
        db: String,
    },
    ShowIndexes {
        db: String,
        table: Option<String>,
    },
    CreateDatabase {
        name: String,
    },
    DropDatabase {
        name: String,
    },
    CreateTable {
        db: String,
        table: String,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        db: String,
        table: String,
    },
    AlterTable {
        db: String,
        table: String,
        action: AlterAction,
    },
    CreateIndex {
        db: String,
        table: String,
        columns: Vec<String>,
        kind: IndexKind,
    },
    DropIndex {
        db: String,
        table: String,
        columns: Vec<String>,
    },
    Insert {
        db: String,
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Select(SelectStatement),
    Update {
        db: String,
        table: String,
        assignments: Vec<(String, Value)>,
        predicate: Option<Predicate>,
    },
    Delete {
        db: String,
        table: String,
        predicate: Option<Predicate>,
    },
    Begin,
    Commit,
    Rollback,
    Optimization(OptimizationCommand),
    Cache(CacheCommand),
    StatisticsCollect,
    DeleteEverything,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlterAction {
    AddColumn(ColumnDef),
    DropColumn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationCommand {
    Enable,
    Disable,
    Status,
    Level(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCommand {
    Enable,
    Disable,
    Clear,
    Stats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub projection: Projection,
    pub db: String,
    pub table: String,
    pub join: Option<JoinClause>,
    pub predicate: Option<Predicate>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<LimitClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Items(Vec<SelectItem>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Column(String),
    Aggregate(AggregateExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub func: AggregateFunc,
    /// `None` means `COUNT(*)`.
    pub column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

impl AggregateExpr {
    /// Output column name, e.g. `count(*)` or `sum(age)`.
    pub fn output_name(&self) -> String {
        format!(
            "{}({})",
            self.func.name().to_ascii_lowercase(),
            self.column.as_deref().unwrap_or("*")
        )
    }
}

/// Equi-join against a second table.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub db: String,
    pub table: String,
    pub left_column: String,
    pub right_column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub column: String,
    pub direction: SortDirection,
}

/// LIMIT with the lenient semantics the executor honors: a non-numeric
/// count passes every row through, an invalid offset reads as 0.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitClause {
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    Contains,
    Regex,
    Fuzzy,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::Contains => "CONTAINS",
            CompareOp::Regex => "REGEX",
            CompareOp::Fuzzy => "FUZZY",
        }
    }

    /// True for the operators an ordered index can serve.
    pub fn is_sargable(&self) -> bool {
        matches!(
            self,
            CompareOp::Eq | CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// Flattens a conjunction into its leaves; an OR anywhere collapses the
    /// whole tree into one opaque leaf (left unoptimized by design).
    pub fn and_leaves(&self) -> Vec<&Predicate> {
        match self {
            Predicate::And(left, right) => {
                let mut leaves = left.and_leaves();
                leaves.extend(right.and_leaves());
                leaves
            }
            other => vec![other],
        }
    }

    pub fn contains_or(&self) -> bool {
        match self {
            Predicate::Or(_, _) => true,
            Predicate::And(left, right) => left.contains_or() || right.contains_or(),
            _ => false,
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_json().to_string(),
    }
}

fn render_predicate(predicate: &Predicate) -> String {
    match predicate {
        Predicate::Compare { column, op, value } => {
            format!("{column} {} {}", op.symbol(), render_value(value))
        }
        Predicate::In { column, values } => {
            let list: Vec<String> = values.iter().map(render_value).collect();
            format!("{column} IN ({})", list.join(", "))
        }
        Predicate::Between { column, low, high } => format!(
            "{column} BETWEEN {} AND {}",
            render_value(low),
            render_value(high)
        ),
        Predicate::And(left, right) => {
            // Parenthesize OR operands so precedence survives re-parsing.
            let side = |p: &Predicate| match p {
                Predicate::Or(_, _) => format!("({})", render_predicate(p)),
                _ => render_predicate(p),
            };
            format!("{} AND {}", side(left), side(right))
        }
        Predicate::Or(left, right) => {
            format!("{} OR {}", render_predicate(left), render_predicate(right))
        }
    }
}

impl Statement {
    /// Canonical SQL rendering: uppercase keywords, single spacing. Parsing
    /// the output yields an equal AST.
    pub fn unparse(&self) -> String {
        match self {
            Statement::ShowDatabases => "SHOW DATABASES".into(),
            Statement::ShowTables { db } => format!("SHOW TABLES IN {db}"),
            Statement::ShowIndexes { db, table: None } => format!("SHOW INDEXES IN {db}"),
            Statement::ShowIndexes {
                db,
                table: Some(table),
            } => format!("SHOW INDEXES ON {db}.{table}"),
            Statement::CreateDatabase { name } => format!("CREATE DATABASE {name}"),
            Statement::DropDatabase { name } => format!("DROP DATABASE {name}"),
            Statement::CreateTable { db, table, columns } => {
                if columns.is_empty() {
                    format!("CREATE TABLE {db}.{table}")
                } else {
                    let defs: Vec<String> = columns
                        .iter()
                        .map(|c| match c.data_type {
                            Some(t) => format!("{} {t}", c.name),
                            None => c.name.clone(),
                        })
                        .collect();
                    format!("CREATE TABLE {db}.{table} ({})", defs.join(", "))
                }
            }
            Statement::DropTable { db, table } => format!("DROP TABLE {db}.{table}"),
            Statement::AlterTable { db, table, action } => match action {
                AlterAction::AddColumn(column) => match column.data_type {
                    Some(t) => format!(
                        "ALTER TABLE {db}.{table} ADD COLUMN {} {t}",
                        column.name
                    ),
                    None => format!("ALTER TABLE {db}.{table} ADD COLUMN {}", column.name),
                },
                AlterAction::DropColumn(name) => {
                    format!("ALTER TABLE {db}.{table} DROP COLUMN {name}")
                }
            },
            Statement::CreateIndex {
                db,
                table,
                columns,
                kind,
            } => {
                let prefix = if *kind == IndexKind::FullText {
                    "CREATE FULLTEXT INDEX"
                } else {
                    "CREATE INDEX"
                };
                format!("{prefix} ON {db}.{table}({})", columns.join(", "))
            }
            Statement::DropIndex { db, table, columns } => {
                format!("DROP INDEX ON {db}.{table}({})", columns.join(", "))
            }
            Statement::Insert {
                db,
                table,
                columns,
                rows,
            } => {
                let tuples: Vec<String> = rows
                    .iter()
                    .map(|row| {
                        let rendered: Vec<String> = row.iter().map(render_value).collect();
                        format!("({})", rendered.join(", "))
                    })
                    .collect();
                format!(
                    "INSERT INTO {db}.{table} ({}) VALUES {}",
                    columns.join(", "),
                    tuples.join(", ")
                )
            }
            Statement::Select(select) => select.unparse(),
            Statement::Update {
                db,
                table,
                assignments,
                predicate,
            } => {
                let sets: Vec<String> = assignments
                    .iter()
                    .map(|(column, value)| format!("{column} = {}", render_value(value)))
                    .collect();
                let mut sql = format!("UPDATE {db}.{table} SET {}", sets.join(", "));
                if let Some(predicate) = predicate {
                    sql.push_str(&format!(" WHERE {}", render_predicate(predicate)));
                }
                sql
            }
            Statement::Delete {
                db,
                table,
                predicate,
            } => {
                let mut sql = format!("DELETE FROM {db}.{table}");
                if let Some(predicate) = predicate {
                    sql.push_str(&format!(" WHERE {}", render_predicate(predicate)));
                }
                sql
            }
            Statement::Begin => "BEGIN".into(),
            Statement::Commit => "COMMIT".into(),
            Statement::Rollback => "ROLLBACK".into(),
            Statement::Optimization(cmd) => match cmd {
                OptimizationCommand::Enable => "OPTIMIZATION ENABLE".into(),
                OptimizationCommand::Disable => "OPTIMIZATION DISABLE".into(),
                OptimizationCommand::Status => "OPTIMIZATION STATUS".into(),
                OptimizationCommand::Level(level) => format!("OPTIMIZATION LEVEL {level}"),
            },
            Statement::Cache(cmd) => match cmd {
                CacheCommand::Enable => "CACHE ENABLE".into(),
                CacheCommand::Disable => "CACHE DISABLE".into(),
                CacheCommand::Clear => "CACHE CLEAR".into(),
                CacheCommand::Stats => "CACHE STATS".into(),
            },
            Statement::StatisticsCollect => "STATISTICS COLLECT".into(),
            Statement::DeleteEverything => "DELETE EVERYTHING".into(),
        }
    }

    /// True when executing the statement cannot change any state.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Statement::Select(_)
                | Statement::ShowDatabases
                | Statement::ShowTables { .. }
                | Statement::ShowIndexes { .. }
        )
    }

    /// `(db, table)` the statement writes to, for cache invalidation.
    pub fn write_target(&self) -> Option<(String, String)> {
        match self {
            Statement::Insert { db, table, .. }
            | Statement::Update { db, table, .. }
            | Statement::Delete { db, table, .. }
            | Statement::AlterTable { db, table, .. }
            | Statement::DropTable { db, table }
            | Statement::CreateIndex { db, table, .. }
            | Statement::DropIndex { db, table, .. } => Some((db.clone(), table.clone())),
            _ => None,
        }
    }
}

impl SelectStatement {
    pub fn unparse(&self) -> String {
        let projection = match &self.projection {
            Projection::All => "*".to_string(),
            Projection::Items(items) => {
                let rendered: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        SelectItem::Column(name) => name.clone(),
                        SelectItem::Aggregate(agg) => format!(
                            "{}({})",
                            agg.func.name(),
                            agg.column.as_deref().unwrap_or("*")
                        ),
                    })
                    .collect();
                rendered.join(", ")
            }
        };
        let mut sql = format!("SELECT {projection} FROM {}.{}", self.db, self.table);
        if let Some(join) = &self.join {
            sql.push_str(&format!(
                " JOIN {}.{} ON {} = {}",
                join.db, join.table, join.left_column, join.right_column
            ));
        }
        if let Some(predicate) = &self.predicate {
            sql.push_str(&format!(" WHERE {}", render_predicate(predicate)));
        }
        if !self.group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", self.group_by.join(", ")));
        }
        if !self.order_by.is_empty() {
            let keys: Vec<String> = self
                .order_by
                .iter()
                .map(|key| {
                    let dir = match key.direction {
                        SortDirection::Ascending => "ASC",
                        SortDirection::Descending => "DESC",
                    };
                    format!("{} {dir}", key.column)
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        if let Some(limit) = &self.limit {
            match limit.limit {
                Some(n) => sql.push_str(&format!(" LIMIT {n}")),
                None => sql.push_str(" LIMIT ALL"),
            }
            if limit.offset > 0 {
                sql.push_str(&format!(" OFFSET {}", limit.offset));
            }
        }
        sql
    }
}
