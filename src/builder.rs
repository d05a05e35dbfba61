//! Statement representation rendered to PostgreSQL text.
//!
//! Compilers never concatenate SQL themselves: they assemble the values in
//! this module and call `to_sql`/`build`. Identifiers are always quoted with
//! [`quote_ident`] and literal values either travel as positional parameters
//! or are escaped by [`format_value`].

use crate::error::{QueryError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comparison operators for WHERE clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    ILike,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOp::Eq => write!(f, "="),
            ComparisonOp::Ne => write!(f, "<>"),
            ComparisonOp::Lt => write!(f, "<"),
            ComparisonOp::Le => write!(f, "<="),
            ComparisonOp::Gt => write!(f, ">"),
            ComparisonOp::Ge => write!(f, ">="),
            ComparisonOp::Like => write!(f, "LIKE"),
            ComparisonOp::ILike => write!(f, "ILIKE"),
            ComparisonOp::NotLike => write!(f, "NOT LIKE"),
            ComparisonOp::In => write!(f, "IN"),
            ComparisonOp::NotIn => write!(f, "NOT IN"),
            ComparisonOp::IsNull => write!(f, "IS NULL"),
            ComparisonOp::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// Logical operators for combining conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "AND"),
            LogicalOp::Or => write!(f, "OR"),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

impl FromStr for SortDirection {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            _ => Err(QueryError::InvalidOperator(format!(
                "Invalid sort direction {}",
                s
            ))),
        }
    }
}

/// Aggregate function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
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
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Avg => "avg",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
        }
    }

    pub fn to_sql(&self, arg: &Expr) -> String {
        format!("{}({})", self.name(), arg.to_sql())
    }
}

impl FromStr for AggregateFunc {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Ok(AggregateFunc::Count),
            "sum" => Ok(AggregateFunc::Sum),
            "avg" => Ok(AggregateFunc::Avg),
            "min" => Ok(AggregateFunc::Min),
            "max" => Ok(AggregateFunc::Max),
            _ => Err(QueryError::InvalidOperator(format!(
                "Invalid aggregate function provided {}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for AggregateFunc {
    type Error = QueryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Scalar expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Star,
    Column { table: String, column: String },
    Ident(String),
    Param(usize),
    /// `<expr>::<type>`
    Cast { expr: Box<Expr>, sql_type: String },
    Literal(Value),
    List(Vec<Expr>),
    Aggregate { func: AggregateFunc, arg: Box<Expr> },
    /// `to_json(<expr>)`
    ToJson(Box<Expr>),
    /// `row_to_json((<query>))`
    RowToJson(Box<SelectBuilder>),
    /// `json_agg` defaulting to `'[]'`, or its first element defaulting to `'null'`.
    JsonAgg {
        expr: Box<Expr>,
        order_by: Vec<OrderBy>,
        first: bool,
    },
}

impl Expr {
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Ident(name.into())
    }

    /// Placeholder typed as the column it is compared with or written to.
    pub fn typed_param(index: usize, sql_type: impl Into<String>) -> Self {
        Expr::Cast {
            expr: Box::new(Expr::Param(index)),
            sql_type: sql_type.into(),
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Expr::Star => "*".to_string(),
            Expr::Column { table, column } => {
                format!("{}.{}", quote_ident(table), quote_ident(column))
            }
            Expr::Ident(name) => quote_ident(name),
            Expr::Param(index) => format!("${}", index),
            Expr::Cast { expr, sql_type } => format!("{}::{}", expr.to_sql(), sql_type),
            Expr::Literal(value) => format_value(value),
            Expr::List(items) => {
                let items = items.iter().map(Expr::to_sql).collect::<Vec<_>>();
                format!("({})", items.join(", "))
            }
            Expr::Aggregate { func, arg } => func.to_sql(arg),
            Expr::ToJson(expr) => format!("to_json({})", expr.to_sql()),
            Expr::RowToJson(query) => format!("row_to_json(({}))", query.to_sql()),
            Expr::JsonAgg {
                expr,
                order_by,
                first,
            } => {
                let mut agg = format!("json_agg({}", expr.to_sql());
                if !order_by.is_empty() {
                    let order = order_by.iter().map(OrderBy::to_sql).collect::<Vec<_>>();
                    agg.push_str(&format!(" ORDER BY {}", order.join(", ")));
                }
                agg.push(')');
                if *first {
                    format!("coalesce(({} -> 0), 'null')", agg)
                } else {
                    format!("coalesce({}, '[]')", agg)
                }
            }
        }
    }
}

/// WHERE condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(bool),
    Compare {
        left: Expr,
        op: ComparisonOp,
        right: Option<Expr>,
    },
    Compound {
        conditions: Vec<Condition>,
        op: LogicalOp,
    },
    Exists(Box<SelectBuilder>),
}

impl Condition {
    pub fn eq(left: Expr, right: Expr) -> Self {
        Condition::Compare {
            left,
            op: ComparisonOp::Eq,
            right: Some(right),
        }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::Compound {
            conditions,
            op: LogicalOp::And,
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Compound {
            conditions,
            op: LogicalOp::Or,
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Condition::Literal(value) => value.to_string(),
            Condition::Compare { left, op, right } => match right {
                Some(right) if !matches!(op, ComparisonOp::IsNull | ComparisonOp::IsNotNull) => {
                    format!("{} {} {}", left.to_sql(), op, right.to_sql())
                }
                _ => format!("{} {}", left.to_sql(), op),
            },
            Condition::Compound { conditions, .. } if conditions.is_empty() => "true".to_string(),
            Condition::Compound {
                conditions,
                op: LogicalOp::And,
            } => conditions
                .iter()
                .map(Condition::to_sql)
                .collect::<Vec<_>>()
                .join(" AND "),
            Condition::Compound {
                conditions,
                op: LogicalOp::Or,
            } => {
                let parts = conditions
                    .iter()
                    .map(|c| format!("({})", c.to_sql()))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                format!("( {} )", parts)
            }
            Condition::Exists(query) => format!("( EXISTS ( {} ) )", query.to_sql()),
        }
    }
}

/// Projected expression with an optional alias
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn to_sql(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} AS {}", self.expr.to_sql(), quote_ident(alias)),
            None => self.expr.to_sql(),
        }
    }
}

/// FROM source
#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table { name: String, alias: Option<String> },
    Subquery { query: Box<SelectBuilder>, alias: String },
}

impl FromItem {
    pub fn to_sql(&self) -> String {
        match self {
            FromItem::Table { name, alias: None } => quote_ident(name),
            FromItem::Table {
                name,
                alias: Some(alias),
            } => format!("{} AS {}", quote_ident(name), quote_ident(alias)),
            FromItem::Subquery { query, alias } => {
                format!("({}) AS {}", query.to_sql(), quote_ident(alias))
            }
        }
    }
}

/// `LEFT JOIN LATERAL (<query>) AS <alias> ON true`
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub query: SelectBuilder,
    pub alias: String,
}

impl Join {
    pub fn to_sql(&self) -> String {
        format!(
            "LEFT JOIN LATERAL ({}) AS {} ON true",
            self.query.to_sql(),
            quote_ident(&self.alias)
        )
    }
}

/// ORDER BY clause
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn to_sql(&self) -> String {
        format!("{} {} NULLS LAST", quote_ident(&self.column), self.direction)
    }
}

/// SELECT query builder
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectBuilder {
    columns: Vec<SelectItem>,
    from: Option<FromItem>,
    joins: Vec<Join>,
    where_clause: Option<Condition>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl SelectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a projected expression
    pub fn column(mut self, expr: Expr) -> Self {
        self.columns.push(SelectItem { expr, alias: None });
        self
    }

    /// Add a projected expression under an alias
    pub fn column_as(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.columns.push(SelectItem {
            expr,
            alias: Some(alias.into()),
        });
        self
    }

    pub fn from_table(mut self, name: impl Into<String>, alias: Option<String>) -> Self {
        self.from = Some(FromItem::Table {
            name: name.into(),
            alias,
        });
        self
    }

    pub fn from_subquery(mut self, query: SelectBuilder, alias: impl Into<String>) -> Self {
        self.from = Some(FromItem::Subquery {
            query: Box::new(query),
            alias: alias.into(),
        });
        self
    }

    pub fn left_join_lateral(mut self, query: SelectBuilder, alias: impl Into<String>) -> Self {
        self.joins.push(Join {
            query,
            alias: alias.into(),
        });
        self
    }

    pub fn where_clause(mut self, condition: Condition) -> Self {
        self.where_clause = Some(condition);
        self
    }

    /// AND a condition onto the existing WHERE
    pub fn and_where(mut self, condition: Condition) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(Condition::Compound {
                mut conditions,
                op: LogicalOp::And,
            }) => {
                conditions.push(condition);
                Condition::and(conditions)
            }
            Some(existing) => Condition::and(vec![existing, condition]),
            None => condition,
        });
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn to_sql(&self) -> String {
        let mut sql = String::from("SELECT");

        if !self.columns.is_empty() {
            sql.push(' ');
            sql.push_str(
                &self
                    .columns
                    .iter()
                    .map(SelectItem::to_sql)
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }

        if let Some(from) = &self.from {
            sql.push_str(" FROM ");
            sql.push_str(&from.to_sql());
        }

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(&join.to_sql());
        }

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.to_sql());
        }

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(
                &self
                    .order_by
                    .iter()
                    .map(OrderBy::to_sql)
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        sql
    }
}

/// INSERT query builder
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<Expr>>,
}

impl InsertBuilder {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Add one row of values, in column order
    pub fn values(mut self, row: Vec<Expr>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn build(self) -> Result<String> {
        if self.columns.is_empty() {
            return Err(QueryError::DataShape(
                "INSERT must have at least one column".to_string(),
            ));
        }
        if self.rows.is_empty() {
            return Err(QueryError::DataShape(
                "INSERT must have at least one row".to_string(),
            ));
        }

        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            if row.len() != self.columns.len() {
                return Err(QueryError::DataShape(format!(
                    "INSERT row has {} values for {} columns",
                    row.len(),
                    self.columns.len()
                )));
            }
            let values = row.iter().map(Expr::to_sql).collect::<Vec<_>>();
            rows.push(format!("({})", values.join(", ")));
        }

        let columns = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>();

        Ok(format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(&self.table),
            columns.join(", "),
            rows.join(", ")
        ))
    }
}

/// UPDATE query builder. The WHERE condition is mandatory; `Condition::Literal(true)`
/// updates every row.
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    set_values: Vec<(String, Expr)>,
    where_clause: Condition,
}

impl UpdateBuilder {
    pub fn new(table: impl Into<String>, where_clause: Condition) -> Self {
        Self {
            table: table.into(),
            set_values: Vec::new(),
            where_clause,
        }
    }

    /// Set a column value
    pub fn set(mut self, column: impl Into<String>, value: Expr) -> Self {
        self.set_values.push((column.into(), value));
        self
    }

    pub fn build(self) -> Result<String> {
        if self.set_values.is_empty() {
            return Err(QueryError::DataShape(
                "UPDATE must have at least one SET value".to_string(),
            ));
        }

        let set_clauses: Vec<String> = self
            .set_values
            .iter()
            .map(|(col, val)| format!("{} = {}", quote_ident(col), val.to_sql()))
            .collect();

        Ok(format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(&self.table),
            set_clauses.join(", "),
            self.where_clause.to_sql()
        ))
    }
}

/// DELETE query builder. The WHERE condition is mandatory.
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    table: String,
    where_clause: Condition,
}

impl DeleteBuilder {
    pub fn new(table: impl Into<String>, where_clause: Condition) -> Self {
        Self {
            table: table.into(),
            where_clause,
        }
    }

    pub fn build(self) -> Result<String> {
        Ok(format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(&self.table),
            self.where_clause.to_sql()
        ))
    }
}

/// Per-prefix monotonic alias counter, scoped to one compilation.
#[derive(Debug, Default)]
pub struct AliasGenerator {
    counters: HashMap<&'static str, usize>,
}

impl AliasGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, prefix: &'static str) -> String {
        let counter = self.counters.entry(prefix).or_insert(0);
        let alias = format!("{}_{}", prefix, counter);
        *counter += 1;
        alias
    }
}

/// Format a JSON value as an inline SQL literal
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Array(_) | Value::Object(_) => {
            format!("'{}'", serde_json::to_string(value).unwrap_or_default().replace('\'', "''"))
        }
    }
}
