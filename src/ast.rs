//! Read requests and filters.
//!
//! [`OutputAst`] is what callers send: a named node listing bare field names
//! or nested nodes, plus read arguments. [`map_output_ast`] validates it
//! against the schema and splits every node into scalar fields, many-to-one
//! and one-to-many children, producing a [`SelectAst`].

use crate::builder::SortDirection;
use crate::error::{QueryError, Result};
use crate::schema::{Member, SchemaRegistry};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Flat insert/update payload keyed by field or relation name
pub type Record = Map<String, Value>;

/// Predicate operators of the filter grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Like,
    ILike,
    NLike,
    In,
    Nin,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "_eq",
            Operator::Neq => "_neq",
            Operator::Like => "_like",
            Operator::ILike => "_ilike",
            Operator::NLike => "_nlike",
            Operator::In => "_in",
            Operator::Nin => "_nin",
            Operator::Gt => "_gt",
            Operator::Gte => "_gte",
            Operator::Lt => "_lt",
            Operator::Lte => "_lte",
            Operator::IsNull => "_isnull",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "_eq" => Ok(Operator::Eq),
            "_neq" => Ok(Operator::Neq),
            "_like" => Ok(Operator::Like),
            "_ilike" => Ok(Operator::ILike),
            "_nlike" => Ok(Operator::NLike),
            "_in" => Ok(Operator::In),
            "_nin" => Ok(Operator::Nin),
            "_gt" => Ok(Operator::Gt),
            "_gte" => Ok(Operator::Gte),
            "_lt" => Ok(Operator::Lt),
            "_lte" => Ok(Operator::Lte),
            "_isnull" => Ok(Operator::IsNull),
            _ => Err(QueryError::InvalidOperator(format!("Invalid operator {}", s))),
        }
    }
}

/// Right-hand side of a predicate. Literal operands become `Param`s once the
/// statement is prepared.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    List(Vec<Value>),
    Flag(bool),
    Param(usize),
    ParamList(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub operator: Operator,
    pub operand: Operand,
}

impl Predicate {
    fn parse(key: &str, value: Value) -> Result<Self> {
        let operator: Operator = key.parse()?;
        let operand = match (operator, value) {
            (Operator::In | Operator::Nin, Value::Array(items)) => Operand::List(items),
            (Operator::In | Operator::Nin, _) => {
                return Err(QueryError::InvalidFilter(format!(
                    "Operator {} expects a list",
                    operator
                )))
            }
            (Operator::IsNull, Value::Bool(flag)) => Operand::Flag(flag),
            (Operator::IsNull, _) => {
                return Err(QueryError::InvalidFilter(
                    "Operator _isnull expects a boolean".to_string(),
                ))
            }
            (_, value) => Operand::Value(value),
        };
        Ok(Self { operator, operand })
    }
}

/// What a filter key maps to: a predicate object for a field, or a nested
/// filter for a relation.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Predicates(Vec<Predicate>),
    Nested(Filter),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterTerm {
    pub name: String,
    pub node: FilterNode,
}

/// Logical filter tree: `{ field: { _op: value }, relation: { ... }, _and: [...], _or: [...] }`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct Filter {
    pub terms: Vec<FilterTerm>,
    pub and: Vec<Filter>,
    pub or: Vec<Filter>,
}

impl Filter {
    pub fn parse(value: Value) -> Result<Self> {
        let entries = match value {
            Value::Object(entries) => entries,
            other => {
                return Err(QueryError::InvalidFilter(format!(
                    "Filter must be an object, got {}",
                    other
                )))
            }
        };

        let mut filter = Filter::default();
        for (key, value) in entries {
            match key.as_str() {
                "_and" => filter.and = parse_group(&key, value)?,
                "_or" => filter.or = parse_group(&key, value)?,
                _ => filter.terms.push(FilterTerm {
                    node: parse_node(&key, value)?,
                    name: key,
                }),
            }
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.and.is_empty() && self.or.is_empty()
    }

    /// First key of the filter as written, used in error messages.
    pub(crate) fn first_key(&self) -> Option<&str> {
        self.terms
            .first()
            .map(|t| t.name.as_str())
            .or_else(|| (!self.and.is_empty()).then_some("_and"))
            .or_else(|| (!self.or.is_empty()).then_some("_or"))
    }
}

impl TryFrom<Value> for Filter {
    type Error = QueryError;

    fn try_from(value: Value) -> Result<Self> {
        Filter::parse(value)
    }
}

fn parse_group(key: &str, value: Value) -> Result<Vec<Filter>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.into_iter().map(Filter::parse).collect(),
        other => Err(QueryError::InvalidFilter(format!(
            "{} expects a list of filters, got {}",
            key, other
        ))),
    }
}

// An object whose keys all start with `_` is a predicate object; anything
// else is a nested filter.
fn parse_node(key: &str, value: Value) -> Result<FilterNode> {
    let entries = match value {
        Value::Object(entries) => entries,
        other => {
            return Err(QueryError::InvalidFilter(format!(
                "Filter for {} must be an object, got {}",
                key, other
            )))
        }
    };

    let is_predicate = entries
        .keys()
        .all(|k| k.starts_with('_') && k != "_and" && k != "_or");
    if is_predicate {
        let predicates = entries
            .into_iter()
            .map(|(k, v)| Predicate::parse(&k, v))
            .collect::<Result<Vec<_>>>()?;
        Ok(FilterNode::Predicates(predicates))
    } else {
        Ok(FilterNode::Nested(Filter::parse(Value::Object(entries))?))
    }
}

/// One flattened order-by entry. `path` walks many-to-one relations down to
/// a field; `alias` is the helper column carrying the sort value.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub path: Vec<String>,
    pub alias: String,
    pub direction: SortDirection,
}

/// `{ field: "asc", relation: { field: "desc" } }`, flattened in key order.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct OrderBy(pub Vec<SortKey>);

impl OrderBy {
    pub fn parse(value: Value) -> Result<Self> {
        let mut keys = Vec::new();
        flatten_order(value, &mut Vec::new(), &mut keys)?;
        Ok(OrderBy(keys))
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.0
    }
}

impl TryFrom<Value> for OrderBy {
    type Error = QueryError;

    fn try_from(value: Value) -> Result<Self> {
        OrderBy::parse(value)
    }
}

fn flatten_order(value: Value, path: &mut Vec<String>, keys: &mut Vec<SortKey>) -> Result<()> {
    let entries = match value {
        Value::Object(entries) => entries,
        other => {
            return Err(QueryError::InvalidFilter(format!(
                "Order by must be an object, got {}",
                other
            )))
        }
    };

    for (key, value) in entries {
        path.push(key);
        match value {
            Value::String(direction) => keys.push(SortKey {
                alias: format!("ob.{}", path.join(".")),
                path: path.clone(),
                direction: direction.parse()?,
            }),
            Value::Object(_) => flatten_order(value, path, keys)?,
            other => {
                return Err(QueryError::InvalidFilter(format!(
                    "Invalid order by value {} for {}",
                    other,
                    path.join(".")
                )))
            }
        }
        path.pop();
    }
    Ok(())
}

/// Read arguments of one node
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SelectArgs {
    #[serde(rename = "where")]
    pub filter: Option<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectArgs {
    pub fn order_keys(&self) -> &[SortKey] {
        self.order_by.as_ref().map(OrderBy::keys).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OutputField {
    Name(String),
    Node(OutputAst),
}

/// Caller-facing read request
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OutputAst {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fields: Vec<OutputField>,
    #[serde(default)]
    pub args: SelectArgs,
}

impl OutputAst {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(OutputField::Name(name.into()));
        self
    }

    pub fn node(mut self, node: OutputAst) -> Self {
        self.fields.push(OutputField::Node(node));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.args.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.args.order_by = Some(order_by);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.args.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.args.offset = Some(offset);
        self
    }
}

/// Validated read tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectAst {
    pub name: String,
    pub fields: Vec<String>,
    pub args: SelectArgs,
    pub many_to_one: Vec<SelectAst>,
    pub one_to_many: Vec<SelectAst>,
}

impl SelectAst {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Validate `ast` against `entity` and split every node's children by kind.
///
/// A bare name resolving to a relation selects that relation with no
/// fields. An empty root name defaults to the entity name.
pub fn map_output_ast(schema: &SchemaRegistry, entity: &str, ast: &OutputAst) -> Result<SelectAst> {
    let name = if ast.name.is_empty() {
        entity.to_string()
    } else {
        ast.name.clone()
    };
    let mut select = SelectAst {
        name,
        args: ast.args.clone(),
        ..Default::default()
    };

    for child in &ast.fields {
        let (name, node) = match child {
            OutputField::Name(name) => (name.as_str(), None),
            OutputField::Node(node) => (node.name.as_str(), Some(node)),
        };

        match schema.resolve(entity, name)? {
            Member::Field(field) => select.fields.push(field.name.clone()),
            Member::ManyToOne(mto) => select.many_to_one.push(map_relation(
                schema,
                &mto.target_entity,
                name,
                node,
            )?),
            Member::OneToMany(otm) => select.one_to_many.push(map_relation(
                schema,
                &otm.target_entity,
                name,
                node,
            )?),
            Member::NotFound => {
                return Err(QueryError::NameResolution(format!(
                    "Field {} not found in entity {}",
                    name, entity
                )))
            }
        }
    }

    Ok(select)
}

fn map_relation(
    schema: &SchemaRegistry,
    target: &str,
    name: &str,
    node: Option<&OutputAst>,
) -> Result<SelectAst> {
    match node {
        Some(node) => map_output_ast(schema, target, node),
        None => Ok(SelectAst::new(name)),
    }
}
