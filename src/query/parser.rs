//! Statement Parser
//!
//! Recursive-descent parser over the token stream. Each `;`-separated
//! statement parses independently; a failure in one statement never affects
//! its neighbors — the executor reports it in-band and moves on.

use crate::catalog::database::ColumnDef;
use crate::catalog::IndexKind;
use crate::errors::{SerengetiError, SerengetiResult};
use crate::query::ast::*;
use crate::query::tokenizer::{split_statements, Token, Tokenizer};
use crate::types::{DataType, Value};

/// Parses a raw request body into per-statement results.
pub fn parse_request(input: &str) -> Vec<SerengetiResult<Statement>> {
    split_statements(input)
        .iter()
        .map(|statement| parse_statement(statement))
        .collect()
}

/// Parses exactly one statement.
pub fn parse_statement(input: &str) -> SerengetiResult<Statement> {
    let tokens = Tokenizer::new(input).tokenize()?;
    if tokens.is_empty() {
        return Err(SerengetiError::parse("empty statement"));
    }
    let mut parser = Parser { tokens, position: 0 };
    let statement = parser.parse()?;
    if let Some(extra) = parser.peek() {
        return Err(SerengetiError::parse(format!(
            "unexpected trailing input near {extra:?}"
        )));
    }
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn parse(&mut self) -> SerengetiResult<Statement> {
        let leading = match self.peek() {
            Some(Token::Keyword(kw)) => kw.clone(),
            Some(other) => {
                return Err(SerengetiError::parse(format!(
                    "statement must start with a keyword, found {other:?}"
                )))
            }
            None => return Err(SerengetiError::parse("empty statement")),
        };
        match leading.as_str() {
            "SHOW" => self.parse_show(),
            "CREATE" => self.parse_create(),
            "DROP" => self.parse_drop(),
            "ALTER" => self.parse_alter(),
            "INSERT" => self.parse_insert(),
            "SELECT" => self.parse_select().map(Statement::Select),
            "UPDATE" => self.parse_update(),
            "DELETE" => self.parse_delete(),
            "BEGIN" => {
                self.advance();
                Ok(Statement::Begin)
            }
            "COMMIT" => {
                self.advance();
                Ok(Statement::Commit)
            }
            "ROLLBACK" => {
                self.advance();
                Ok(Statement::Rollback)
            }
            "OPTIMIZATION" => self.parse_optimization(),
            "CACHE" => self.parse_cache(),
            "STATISTICS" => {
                self.advance();
                self.expect_keyword("COLLECT")?;
                Ok(Statement::StatisticsCollect)
            }
            other => Err(SerengetiError::parse(format!(
                "unsupported statement '{other}'"
            ))),
        }
    }

    // ---- statement parsers ----

    fn parse_show(&mut self) -> SerengetiResult<Statement> {
        self.expect_keyword("SHOW")?;
        if self.eat_keyword("DATABASES") {
            return Ok(Statement::ShowDatabases);
        }
        if self.eat_keyword("TABLES") {
            self.expect_keyword("IN")?;
            return Ok(Statement::ShowTables {
                db: self.expect_name()?,
            });
        }
        if self.eat_keyword("INDEXES") {
            if self.eat_keyword("IN") {
                return Ok(Statement::ShowIndexes {
                    db: self.expect_name()?,
                    table: None,
                });
            }
            self.expect_keyword("ON")?;
            let (db, table) = self.expect_qualified()?;
            return Ok(Statement::ShowIndexes {
                db,
                table: Some(table),
            });
        }
        Err(SerengetiError::parse(
            "expected DATABASES, TABLES or INDEXES after SHOW",
        ))
    }

    fn parse_create(&mut self) -> SerengetiResult<Statement> {
        self.expect_keyword("CREATE")?;
        if self.eat_keyword("DATABASE") {
            return Ok(Statement::CreateDatabase {
                name: self.expect_name()?,
            });
        }
        if self.eat_keyword("TABLE") {
            let (db, table) = self.expect_qualified()?;
            let mut columns = Vec::new();
            if self.eat_symbol('(') {
                loop {
                    let name = self.expect_name()?;
                    let data_type = match self.peek() {
                        Some(Token::Keyword(_)) | Some(Token::Ident(_))
                            if !self.peek_is_symbol(',') && !self.peek_is_symbol(')') =>
                        {
                            let raw = self.expect_name()?;
                            Some(DataType::parse(&raw).ok_or_else(|| {
                                SerengetiError::parse(format!("unknown column type '{raw}'"))
                            })?)
                        }
                        _ => None,
                    };
                    columns.push(ColumnDef { name, data_type });
                    if !self.eat_symbol(',') {
                        break;
                    }
                }
                self.expect_symbol(')')?;
            }
            return Ok(Statement::CreateTable { db, table, columns });
        }
        let kind = if self.eat_keyword("FULLTEXT") {
            IndexKind::FullText
        } else {
            IndexKind::Ordered
        };
        if self.eat_keyword("INDEX") {
            self.expect_keyword("ON")?;
            let (db, table) = self.expect_qualified()?;
            let columns = self.expect_column_list()?;
            return Ok(Statement::CreateIndex {
                db,
                table,
                columns,
                kind,
            });
        }
        Err(SerengetiError::parse(
            "expected DATABASE, TABLE or INDEX after CREATE",
        ))
    }

    fn parse_drop(&mut self) -> SerengetiResult<Statement> {
        self.expect_keyword("DROP")?;
        if self.eat_keyword("DATABASE") {
            return Ok(Statement::DropDatabase {
                name: self.expect_name()?,
            });
        }
        if self.eat_keyword("TABLE") {
            let (db, table) = self.expect_qualified()?;
            return Ok(Statement::DropTable { db, table });
        }
        if self.eat_keyword("INDEX") {
            self.expect_keyword("ON")?;
            let (db, table) = self.expect_qualified()?;
            let columns = self.expect_column_list()?;
            return Ok(Statement::DropIndex { db, table, columns });
        }
        Err(SerengetiError::parse(
            "expected DATABASE, TABLE or INDEX after DROP",
        ))
    }

    fn parse_alter(&mut self) -> SerengetiResult<Statement> {
        self.expect_keyword("ALTER")?;
        self.expect_keyword("TABLE")?;
        let (db, table) = self.expect_qualified()?;
        if self.eat_keyword("ADD") {
            self.expect_keyword("COLUMN")?;
            let name = self.expect_name()?;
            let data_type = match self.peek() {
                Some(Token::Keyword(_)) | Some(Token::Ident(_)) => {
                    let raw = self.expect_name()?;
                    Some(DataType::parse(&raw).ok_or_else(|| {
                        SerengetiError::parse(format!("unknown column type '{raw}'"))
                    })?)
                }
                _ => None,
            };
            return Ok(Statement::AlterTable {
                db,
                table,
                action: AlterAction::AddColumn(ColumnDef { name, data_type }),
            });
        }
        if self.eat_keyword("DROP") {
            self.expect_keyword("COLUMN")?;
            return Ok(Statement::AlterTable {
                db,
                table,
                action: AlterAction::DropColumn(self.expect_name()?),
            });
        }
        Err(SerengetiError::parse("expected ADD or DROP after ALTER TABLE"))
    }

    fn parse_insert(&mut self) -> SerengetiResult<Statement> {
        self.expect_keyword("INSERT")?;
        self.expect_keyword("INTO")?;
        let (db, table) = self.expect_qualified()?;
        let columns = self.expect_column_list()?;
        self.expect_keyword("VALUES")?;

        let mut rows = Vec::new();
        loop {
            self.expect_symbol('(')?;
            let mut values = Vec::new();
            loop {
                values.push(self.expect_value()?);
                if !self.eat_symbol(',') {
                    break;
                }
            }
            self.expect_symbol(')')?;
            if values.len() != columns.len() {
                return Err(SerengetiError::parse(format!(
                    "value count {} does not match column count {}",
                    values.len(),
                    columns.len()
                )));
            }
            rows.push(values);
            if !self.eat_symbol(',') {
                break;
            }
        }
        Ok(Statement::Insert {
            db,
            table,
            columns,
            rows,
        })
    }

    fn parse_select(&mut self) -> SerengetiResult<SelectStatement> {
        self.expect_keyword("SELECT")?;

        let projection = if self.eat_symbol('*') {
            Projection::All
        } else {
            let mut items = Vec::new();
            loop {
                items.push(self.parse_select_item()?);
                if !self.eat_symbol(',') {
                    break;
                }
            }
            Projection::Items(items)
        };

        self.expect_keyword("FROM")?;
        let (db, table) = self.expect_qualified()?;

        let join = if self.eat_keyword("INNER") || self.peek_is_keyword("JOIN") {
            self.expect_keyword("JOIN")?;
            let (join_db, join_table) = self.expect_qualified()?;
            self.expect_keyword("ON")?;
            let left_column = self.expect_possibly_qualified_column()?;
            self.expect_op("=")?;
            let right_column = self.expect_possibly_qualified_column()?;
            Some(JoinClause {
                db: join_db,
                table: join_table,
                left_column,
                right_column,
            })
        } else {
            None
        };

        let predicate = if self.eat_keyword("WHERE") {
            Some(self.parse_predicate()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_keyword("GROUP") {
            self.expect_keyword("BY")?;
            loop {
                group_by.push(self.expect_name()?);
                if !self.eat_symbol(',') {
                    break;
                }
            }
        }

        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let column = self.expect_name()?;
                let direction = if self.eat_keyword("DESC") {
                    SortDirection::Descending
                } else {
                    self.eat_keyword("ASC");
                    SortDirection::Ascending
                };
                order_by.push(OrderKey { column, direction });
                if !self.eat_symbol(',') {
                    break;
                }
            }
        }

        let limit = if self.eat_keyword("LIMIT") {
            let limit = match self.next() {
                Some(Token::Number(raw)) => raw.parse::<usize>().ok(),
                // Non-numeric LIMIT: pass all rows through.
                Some(_) => None,
                None => None,
            };
            let offset = if self.eat_keyword("OFFSET") {
                match self.next() {
                    Some(Token::Number(raw)) => raw.parse::<usize>().unwrap_or(0),
                    // Invalid offset reads as 0.
                    _ => 0,
                }
            } else {
                0
            };
            Some(LimitClause { limit, offset })
        } else {
            None
        };

        Ok(SelectStatement {
            projection,
            db,
            table,
            join,
            predicate,
            group_by,
            order_by,
            limit,
        })
    }

    fn parse_select_item(&mut self) -> SerengetiResult<SelectItem> {
        if let Some(Token::Keyword(kw)) = self.peek() {
            let func = match kw.as_str() {
                "COUNT" => Some(AggregateFunc::Count),
                "SUM" => Some(AggregateFunc::Sum),
                "AVG" => Some(AggregateFunc::Avg),
                "MIN" => Some(AggregateFunc::Min),
                "MAX" => Some(AggregateFunc::Max),
                _ => None,
            };
            if let Some(func) = func {
                self.advance();
                self.expect_symbol('(')?;
                let column = if self.eat_symbol('*') {
                    None
                } else {
                    Some(self.expect_name()?)
                };
                self.expect_symbol(')')?;
                return Ok(SelectItem::Aggregate(AggregateExpr { func, column }));
            }
        }
        Ok(SelectItem::Column(self.expect_name()?))
    }

    fn parse_update(&mut self) -> SerengetiResult<Statement> {
        self.expect_keyword("UPDATE")?;
        let (db, table) = self.expect_qualified()?;
        self.expect_keyword("SET")?;

        let mut assignments = Vec::new();
        loop {
            let column = self.expect_name()?;
            self.expect_op("=")?;
            assignments.push((column, self.expect_value()?));
            if !self.eat_symbol(',') {
                break;
            }
        }
        let predicate = if self.eat_keyword("WHERE") {
            Some(self.parse_predicate()?)
        } else {
            None
        };
        Ok(Statement::Update {
            db,
            table,
            assignments,
            predicate,
        })
    }

    fn parse_delete(&mut self) -> SerengetiResult<Statement> {
        self.expect_keyword("DELETE")?;
        if self.eat_keyword("EVERYTHING") {
            return Ok(Statement::DeleteEverything);
        }
        // FROM is optional.
        self.eat_keyword("FROM");
        let (db, table) = self.expect_qualified()?;
        let predicate = if self.eat_keyword("WHERE") {
            Some(self.parse_predicate()?)
        } else {
            None
        };
        Ok(Statement::Delete {
            db,
            table,
            predicate,
        })
    }

    fn parse_optimization(&mut self) -> SerengetiResult<Statement> {
        self.expect_keyword("OPTIMIZATION")?;
        let command = if self.eat_keyword("ENABLE") {
            OptimizationCommand::Enable
        } else if self.eat_keyword("DISABLE") {
            OptimizationCommand::Disable
        } else if self.eat_keyword("STATUS") {
            OptimizationCommand::Status
        } else if self.eat_keyword("LEVEL") {
            match self.next() {
                Some(Token::Number(raw)) => OptimizationCommand::Level(
                    raw.parse()
                        .map_err(|_| SerengetiError::parse("invalid optimization level"))?,
                ),
                _ => return Err(SerengetiError::parse("expected level number")),
            }
        } else {
            return Err(SerengetiError::parse(
                "expected enable, disable, status or level",
            ));
        };
        Ok(Statement::Optimization(command))
    }

    fn parse_cache(&mut self) -> SerengetiResult<Statement> {
        self.expect_keyword("CACHE")?;
        let command = if self.eat_keyword("ENABLE") {
            CacheCommand::Enable
        } else if self.eat_keyword("DISABLE") {
            CacheCommand::Disable
        } else if self.eat_keyword("CLEAR") {
            CacheCommand::Clear
        } else if self.eat_keyword("STATS") {
            CacheCommand::Stats
        } else {
            return Err(SerengetiError::parse(
                "expected enable, disable, clear or stats",
            ));
        };
        Ok(Statement::Cache(command))
    }

    // ---- predicate parsing ----

    fn parse_predicate(&mut self) -> SerengetiResult<Predicate> {
        let mut left = self.parse_and_chain()?;
        while self.eat_keyword("OR") {
            let right = self.parse_and_chain()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and_chain(&mut self) -> SerengetiResult<Predicate> {
        let mut left = self.parse_predicate_leaf()?;
        while self.eat_keyword("AND") {
            let right = self.parse_predicate_leaf()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_predicate_leaf(&mut self) -> SerengetiResult<Predicate> {
        if self.eat_symbol('(') {
            let inner = self.parse_predicate()?;
            self.expect_symbol(')')?;
            return Ok(inner);
        }

        let column = self.expect_possibly_qualified_column()?;
        if self.eat_keyword("IN") {
            self.expect_symbol('(')?;
            let mut values = Vec::new();
            loop {
                values.push(self.expect_value()?);
                if !self.eat_symbol(',') {
                    break;
                }
            }
            self.expect_symbol(')')?;
            return Ok(Predicate::In { column, values });
        }
        if self.eat_keyword("BETWEEN") {
            let low = self.expect_value()?;
            self.expect_keyword("AND")?;
            let high = self.expect_value()?;
            return Ok(Predicate::Between { column, low, high });
        }

        let op = match self.next() {
            Some(Token::Op(op)) => match op.as_str() {
                "=" => CompareOp::Eq,
                "!=" => CompareOp::Ne,
                "<" => CompareOp::Lt,
                "<=" => CompareOp::Le,
                ">" => CompareOp::Gt,
                ">=" => CompareOp::Ge,
                other => {
                    return Err(SerengetiError::parse(format!("unknown operator '{other}'")))
                }
            },
            Some(Token::Keyword(kw)) => match kw.as_str() {
                "LIKE" => CompareOp::Like,
                "CONTAINS" => CompareOp::Contains,
                "REGEX" => CompareOp::Regex,
                "FUZZY" => CompareOp::Fuzzy,
                other => {
                    return Err(SerengetiError::parse(format!(
                        "expected comparison operator, found '{other}'"
                    )))
                }
            },
            other => {
                return Err(SerengetiError::parse(format!(
                    "expected comparison operator, found {other:?}"
                )))
            }
        };
        let value = self.expect_value()?;
        Ok(Predicate::Compare { column, op, value })
    }

    // ---- token helpers ----

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn peek_is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Keyword(kw)) if kw == keyword)
    }

    fn peek_is_symbol(&self, symbol: char) -> bool {
        matches!(self.peek(), Some(Token::Symbol(c)) if *c == symbol)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> SerengetiResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(SerengetiError::parse(format!(
                "expected {keyword}, found {:?}",
                self.peek()
            )))
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        if self.peek_is_symbol(symbol) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> SerengetiResult<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(SerengetiError::parse(format!(
                "expected '{symbol}', found {:?}",
                self.peek()
            )))
        }
    }

    fn expect_op(&mut self, op: &str) -> SerengetiResult<()> {
        match self.next() {
            Some(Token::Op(found)) if found == op => Ok(()),
            other => Err(SerengetiError::parse(format!(
                "expected '{op}', found {other:?}"
            ))),
        }
    }

    /// Identifier or keyword used in a name position.
    fn expect_name(&mut self) -> SerengetiResult<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            Some(Token::Keyword(name)) => Ok(name),
            other => Err(SerengetiError::parse(format!(
                "expected identifier, found {other:?}"
            ))),
        }
    }

    /// `db.table`.
    fn expect_qualified(&mut self) -> SerengetiResult<(String, String)> {
        let db = self.expect_name()?;
        self.expect_symbol('.')?;
        let table = self.expect_name()?;
        Ok((db, table))
    }

    /// A column reference, optionally table-qualified; only the column part
    /// is kept.
    fn expect_possibly_qualified_column(&mut self) -> SerengetiResult<String> {
        let first = self.expect_name()?;
        if self.eat_symbol('.') {
            self.expect_name()
        } else {
            Ok(first)
        }
    }

    /// A parenthesized column name list.
    fn expect_column_list(&mut self) -> SerengetiResult<Vec<String>> {
        self.expect_symbol('(')?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.expect_name()?);
            if !self.eat_symbol(',') {
                break;
            }
        }
        self.expect_symbol(')')?;
        Ok(columns)
    }

    /// A literal value.
    fn expect_value(&mut self) -> SerengetiResult<Value> {
        match self.next() {
            Some(Token::Number(raw)) => {
                if let Ok(i) = raw.parse::<i64>() {
                    Ok(Value::Int(i))
                } else {
                    raw.parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| SerengetiError::parse(format!("bad number '{raw}'")))
                }
            }
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Keyword(kw)) => match kw.as_str() {
                "TRUE" => Ok(Value::Bool(true)),
                "FALSE" => Ok(Value::Bool(false)),
                "NULL" => Ok(Value::Null),
                other => Err(SerengetiError::parse(format!(
                    "expected literal, found '{other}'"
                ))),
            },
            other => Err(SerengetiError::parse(format!(
                "expected literal, found {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_statement_surface_parses() {
        let statements = [
            "SHOW DATABASES",
            "SHOW TABLES IN u",
            "SHOW INDEXES IN u",
            "SHOW INDEXES ON u.c",
            "CREATE DATABASE u",
            "DROP DATABASE u",
            "CREATE TABLE u.c (id INT, name VARCHAR)",
            "CREATE TABLE u.c",
            "DROP TABLE u.c",
            "ALTER TABLE u.c ADD COLUMN age INT",
            "ALTER TABLE u.c DROP COLUMN age",
            "CREATE INDEX ON u.c(id)",
            "CREATE FULLTEXT INDEX ON u.c(bio)",
            "DROP INDEX ON u.c(id)",
            "INSERT INTO u.c (id, name) VALUES (1, 'A'), (2, 'B')",
            "SELECT * FROM u.c WHERE id = 1",
            "SELECT name, COUNT(*) FROM u.c GROUP BY name",
            "SELECT * FROM u.c JOIN u.d ON id = owner_id WHERE age > 3 ORDER BY age DESC LIMIT 5 OFFSET 2",
            "UPDATE u.c SET name = 'B', age = 4 WHERE id = 1",
            "DELETE FROM u.c WHERE id IN (1, 2, 3)",
            "DELETE u.c",
            "BEGIN",
            "COMMIT",
            "ROLLBACK",
            "optimization enable",
            "optimization level 2",
            "cache stats",
            "statistics collect",
            "delete everything",
        ];
        for sql in statements {
            parse_statement(sql).unwrap_or_else(|e| panic!("failed to parse '{sql}': {e}"));
        }
    }

    #[test]
    fn parse_then_unparse_is_identity() {
        let statements = [
            "SELECT * FROM u.c WHERE age BETWEEN 20 AND 30 ORDER BY age ASC LIMIT 10",
            "SELECT id, name FROM u.c WHERE name LIKE 'A%' AND age >= 3 OR id = 9",
            "INSERT INTO u.c (id, name) VALUES (1, 'O''Brien')",
            "UPDATE u.c SET age = 5 WHERE id != 2",
            "CREATE TABLE u.c (id INT, name VARCHAR)",
            "DELETE FROM u.c WHERE name CONTAINS 'x'",
            "SELECT * FROM u.c WHERE (id = 1 OR id = 2) AND age > 3",
        ];
        for sql in statements {
            let first = parse_statement(sql).unwrap();
            let second = parse_statement(&first.unparse()).unwrap();
            assert_eq!(first, second, "round trip diverged for '{sql}'");
        }
    }

    #[test]
    fn keyword_casing_is_insensitive() {
        let lower = parse_statement("select * from u.c where id = 1").unwrap();
        let upper = parse_statement("SELECT * FROM u.c WHERE id = 1").unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn lenient_limit_and_offset() {
        let Statement::Select(select) =
            parse_statement("SELECT * FROM u.c LIMIT abc OFFSET xyz").unwrap()
        else {
            panic!("expected select");
        };
        let limit = select.limit.unwrap();
        assert_eq!(limit.limit, None);
        assert_eq!(limit.offset, 0);

        let Statement::Select(select) = parse_statement("SELECT * FROM u.c LIMIT 3").unwrap()
        else {
            panic!("expected select");
        };
        assert_eq!(select.limit.unwrap().limit, Some(3));
    }

    #[test]
    fn insert_arity_mismatch_is_an_error() {
        let result = parse_statement("INSERT INTO u.c (id, name) VALUES (1)");
        assert!(matches!(result, Err(SerengetiError::Parse { .. })));
    }

    #[test]
    fn multi_statement_request_isolates_errors() {
        let results = parse_request("SELECT * FROM u.c; BOGUS NONSENSE; SHOW DATABASES");
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }
}
