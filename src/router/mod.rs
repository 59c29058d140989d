/// Query classification: statement → target shard
///
/// The relay consults a `QueryRouter` for every routable statement. The
/// built-in `ShardKeyRouter` maps the statement's tables through routing
/// entries: a plain table-to-shard binding or a sharding-column key-range
/// split resolved from equality predicates (or INSERT values). Statements
/// that only touch session state classify as `NoShard`; statements that
/// provably touch two shards are a client-visible error.
use async_trait::async_trait;
use fnv::FnvHashMap;
use sqlparser::ast::{
    visit_expressions, visit_relations, BinaryOperator, Expr, SetExpr, Statement, UnaryOperator,
    Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::ops::ControlFlow;
use tokio::sync::RwLock;

use crate::config::RouteEntryConfig;
use crate::error::{RepartoError, RepartoResult};

/// Router verdict for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Execute on this shard.
    Shard(String),
    /// Touches only session state (BEGIN, COMMIT, SET, SHOW, ...); must
    /// never trigger a binding by itself.
    SessionLocal,
    /// No routing entry covers the statement's tables: stay on the bound
    /// backend, or fall back to the rule's default shard.
    NoShard,
    /// Provably touches more than one shard.
    MultiShard(String),
}

#[async_trait]
pub trait QueryRouter: Send + Sync {
    async fn classify(&self, stmt: &Statement) -> RepartoResult<RouteDecision>;
}

/// Parse SQL text into statements with the PostgreSQL dialect.
pub fn parse_statements(sql: &str) -> RepartoResult<Vec<Statement>> {
    Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| RepartoError::Router(e.to_string()))
}

/// Classify a whole query string: parse, classify each statement, and
/// merge. SQL the parser cannot handle classifies as `NoShard` so the
/// statement still reaches the bound backend verbatim.
pub async fn classify_sql(router: &dyn QueryRouter, sql: &str) -> RepartoResult<RouteDecision> {
    let stmts = match parse_statements(sql) {
        Ok(stmts) => stmts,
        Err(_) => return Ok(RouteDecision::NoShard),
    };

    let mut shards: HashSet<String> = HashSet::new();
    let mut saw_unmapped = false;
    for stmt in &stmts {
        match router.classify(stmt).await? {
            RouteDecision::Shard(shard) => {
                shards.insert(shard);
            }
            RouteDecision::SessionLocal => {}
            RouteDecision::NoShard => saw_unmapped = true,
            multi @ RouteDecision::MultiShard(_) => return Ok(multi),
        }
    }
    match shards.len() {
        0 if saw_unmapped => Ok(RouteDecision::NoShard),
        0 => Ok(RouteDecision::SessionLocal),
        1 => Ok(RouteDecision::Shard(shards.into_iter().next().unwrap())),
        _ => {
            let mut names: Vec<String> = shards.into_iter().collect();
            names.sort();
            Ok(RouteDecision::MultiShard(names.join(", ")))
        }
    }
}

/// Where a routing entry sends a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Shard(String),
    KeyRanges { column: String, ranges: Vec<KeyRange> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub low: i64,
    /// Inclusive.
    pub high: i64,
    pub shard: String,
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteTarget::Shard(shard) => write!(f, "shard {}", shard),
            RouteTarget::KeyRanges { column, ranges } => {
                write!(f, "column {} over {} ranges", column, ranges.len())
            }
        }
    }
}

/// Routing entries keyed by (lower-cased) table name, mutable at runtime
/// through the admin console.
pub struct ShardKeyRouter {
    entries: RwLock<FnvHashMap<String, RouteTarget>>,
}

impl ShardKeyRouter {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn from_config(routes: &[RouteEntryConfig]) -> Self {
        let mut entries = FnvHashMap::default();
        for route in routes {
            let target = if let Some(shard) = &route.shard {
                RouteTarget::Shard(shard.clone())
            } else {
                RouteTarget::KeyRanges {
                    column: route.column.clone().unwrap_or_default().to_lowercase(),
                    ranges: route
                        .ranges
                        .iter()
                        .map(|r| KeyRange {
                            low: r.low,
                            high: r.high,
                            shard: r.shard.clone(),
                        })
                        .collect(),
                }
            };
            entries.insert(route.table.to_lowercase(), target);
        }
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Returns false when an entry for the table already exists.
    pub async fn add_entry(&self, table: &str, target: RouteTarget) -> bool {
        let mut entries = self.entries.write().await;
        let key = table.to_lowercase();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, target);
        true
    }

    pub async fn drop_entry(&self, table: &str) -> bool {
        self.entries.write().await.remove(&table.to_lowercase()).is_some()
    }

    pub async fn entries(&self) -> Vec<(String, RouteTarget)> {
        let entries = self.entries.read().await;
        let mut out: Vec<(String, RouteTarget)> =
            entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl Default for ShardKeyRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryRouter for ShardKeyRouter {
    async fn classify(&self, stmt: &Statement) -> RepartoResult<RouteDecision> {
        if is_session_local(stmt) {
            return Ok(RouteDecision::SessionLocal);
        }

        let tables = collect_relations(stmt);
        if tables.is_empty() {
            return Ok(RouteDecision::NoShard);
        }

        let entries = self.entries.read().await;
        let mut shards: HashSet<String> = HashSet::new();
        for table in &tables {
            let Some(target) = entries.get(table) else {
                continue;
            };
            match target {
                RouteTarget::Shard(shard) => {
                    shards.insert(shard.clone());
                }
                RouteTarget::KeyRanges { column, ranges } => {
                    let values = sharding_key_values(stmt, column);
                    if values.is_empty() {
                        return Ok(RouteDecision::MultiShard(format!(
                            "no condition on sharding column {} of table {}",
                            column, table
                        )));
                    }
                    for value in values {
                        match ranges.iter().find(|r| r.low <= value && value <= r.high) {
                            Some(range) => {
                                shards.insert(range.shard.clone());
                            }
                            None => {
                                return Err(RepartoError::Router(format!(
                                    "no key range of table {} covers {} = {}",
                                    table, column, value
                                )))
                            }
                        }
                    }
                }
            }
        }

        match shards.len() {
            0 => Ok(RouteDecision::NoShard),
            1 => Ok(RouteDecision::Shard(shards.into_iter().next().unwrap())),
            _ => {
                let mut names: Vec<String> = shards.into_iter().collect();
                names.sort();
                Ok(RouteDecision::MultiShard(names.join(", ")))
            }
        }
    }
}

/// Statements that only touch session state and never need a shard.
fn is_session_local(stmt: &Statement) -> bool {
    matches!(
        stmt,
        Statement::StartTransaction { .. }
            | Statement::Commit { .. }
            | Statement::Rollback { .. }
            | Statement::SetVariable { .. }
            | Statement::SetTimeZone { .. }
            | Statement::SetRole { .. }
            | Statement::ShowVariable { .. }
            | Statement::Deallocate { .. }
            | Statement::Discard { .. }
    )
}

/// All table names referenced by a statement, lower-cased.
fn collect_relations(stmt: &Statement) -> Vec<String> {
    let mut tables = Vec::new();
    let _ = visit_relations(stmt, |relation| {
        tables.push(relation.to_string().to_lowercase());
        ControlFlow::<()>::Continue(())
    });
    tables.dedup();
    tables
}

/// Integer values the statement pins the sharding column to: equality
/// predicates anywhere in the statement, plus INSERT VALUES positions.
fn sharding_key_values(stmt: &Statement, column: &str) -> Vec<i64> {
    let mut values = Vec::new();

    let _ = visit_expressions(stmt, |expr| {
        if let Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } = expr
        {
            for (ident, literal) in [(left, right), (right, left)] {
                if ident_matches(ident, column) {
                    if let Some(v) = literal_as_i64(literal) {
                        values.push(v);
                    }
                }
            }
        }
        ControlFlow::<()>::Continue(())
    });

    if let Statement::Insert(insert) = stmt {
        let column_idx = insert
            .columns
            .iter()
            .position(|c| c.value.eq_ignore_ascii_case(column));
        if let (Some(idx), Some(source)) = (column_idx, &insert.source) {
            if let SetExpr::Values(rows) = source.body.as_ref() {
                for row in &rows.rows {
                    if let Some(v) = row.get(idx).and_then(literal_as_i64) {
                        values.push(v);
                    }
                }
            }
        }
    }

    values
}

fn ident_matches(expr: &Expr, column: &str) -> bool {
    match expr {
        Expr::Identifier(ident) => ident.value.eq_ignore_ascii_case(column),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map_or(false, |ident| ident.value.eq_ignore_ascii_case(column)),
        _ => false,
    }
}

fn literal_as_i64(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n.parse().ok(),
        Expr::Value(Value::SingleQuotedString(s)) => s.parse().ok(),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => literal_as_i64(expr).map(|v| -v),
        _ => None,
    }
}
