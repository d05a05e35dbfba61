//! Nested reads compiled into a single statement.
//!
//! Each node of a [`SelectAst`] becomes
//!
//! ```text
//! SELECT coalesce(json_agg("node" ORDER BY ...), '[]') AS "node" FROM (
//!   SELECT row_to_json((SELECT "o_n" FROM (SELECT <columns>) AS "o_n")) AS "node", <sort helpers>
//!   FROM (
//!     SELECT * FROM <table> AS "root.base_n"
//!     LEFT JOIN LATERAL (<child>) AS "j_n" ON true ...
//!     WHERE true AND <correlation> AND <filter> LIMIT .. OFFSET ..
//!   ) AS "base_n"
//! ) AS "agg_n"
//! ```
//!
//! where the outer aggregation only wraps list nodes (the root and
//! one-to-many children). A many-to-one child yields at most one JSON object
//! per parent row.

use crate::ast::{Filter, SelectAst, SortKey};
use crate::builder::{AggregateFunc, AliasGenerator, Condition, Expr, OrderBy, SelectBuilder};
use crate::dictionary::NameDictionary;
use crate::error::{QueryError, Result};
use crate::filter::WhereCompiler;
use crate::schema::SchemaRegistry;
use serde::Deserialize;
use serde_json::Value;

/// Argument of an aggregate function
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AggregateTarget {
    Number(i64),
    /// A field name, or `*`
    Name(String),
}

impl From<&str> for AggregateTarget {
    fn from(name: &str) -> Self {
        AggregateTarget::Name(name.to_string())
    }
}

impl From<i64> for AggregateTarget {
    fn from(value: i64) -> Self {
        AggregateTarget::Number(value)
    }
}

// Join column pair a child node is correlated on: its own column, and the
// parent expression it must equal.
struct Correlation {
    column: String,
    parent: Expr,
}

// A many-to-one join of one node. Joins added only to expose sort values
// have no requested AST and are left out of the output shape.
struct RelationJoin<'s> {
    name: String,
    ast: Option<&'s SelectAst>,
    side_fields: Vec<SortKey>,
}

pub struct SelectCompiler<'a> {
    schema: &'a SchemaRegistry,
    dictionary: &'a NameDictionary,
    aliases: AliasGenerator,
    filters: WhereCompiler<'a>,
}

impl<'a> SelectCompiler<'a> {
    pub fn new(schema: &'a SchemaRegistry, dictionary: &'a NameDictionary) -> Self {
        Self {
            schema,
            dictionary,
            aliases: AliasGenerator::new(),
            filters: WhereCompiler::new(schema, dictionary),
        }
    }

    /// Every row of `entity` matching the root arguments, as one JSON array
    /// (`[]` when nothing matches) in the column named after the root node.
    pub fn select(&mut self, entity: &str, ast: &SelectAst) -> Result<String> {
        Ok(self.compile_node(entity, ast, &[], None, true)?.to_sql())
    }

    /// The first row of [`select`](Self::select), or JSON `null`.
    pub fn select_one(&mut self, entity: &str, ast: &SelectAst) -> Result<String> {
        let query = self.compile_node(entity, ast, &[], None, false)?;
        let first = Expr::JsonAgg {
            expr: Box::new(Expr::ident(&ast.name)),
            order_by: order_columns(ast.args.order_keys()),
            first: true,
        };

        Ok(SelectBuilder::new()
            .column_as(first, &ast.name)
            .from_subquery(query, "_final_root")
            .to_sql())
    }

    /// `SELECT fn(arg) AS "fn" FROM <table> WHERE true AND <filter>`.
    pub fn aggregate(
        &mut self,
        entity: &str,
        func: AggregateFunc,
        target: &AggregateTarget,
        filter: Option<&Filter>,
    ) -> Result<String> {
        let dictionary = self.dictionary;
        let table = dictionary.table(entity)?;
        let arg = match target {
            AggregateTarget::Number(value) => Expr::Literal(Value::from(*value)),
            AggregateTarget::Name(name) if name == "*" => Expr::Star,
            AggregateTarget::Name(name) => {
                let field = self.schema.field(entity, name)?;
                Expr::column(table, dictionary.column(entity, &field.name)?)
            }
        };

        let mut conditions = vec![Condition::Literal(true)];
        if let Some(filter) = filter {
            conditions.push(self.filters.compile(entity, filter, None)?);
        }

        // numeric results (avg, sum over bigint) only decode through json
        let aggregate = Expr::Aggregate {
            func,
            arg: Box::new(arg),
        };
        Ok(SelectBuilder::new()
            .column_as(Expr::ToJson(Box::new(aggregate)), func.name())
            .from_table(table, None)
            .where_clause(Condition::and(conditions))
            .to_sql())
    }

    fn compile_node(
        &mut self,
        entity: &str,
        ast: &SelectAst,
        side_fields: &[SortKey],
        correlation: Option<Correlation>,
        list: bool,
    ) -> Result<SelectBuilder> {
        let schema = self.schema;
        let dictionary = self.dictionary;

        let order_keys = ast.args.order_keys();
        let carried: Vec<SortKey> = side_fields.iter().chain(order_keys).cloned().collect();
        let many_to_one = self.plan_many_to_one(entity, ast, &carried)?;

        let root_alias = self.aliases.next("root.base");
        let mut base = SelectBuilder::new()
            .column(Expr::Star)
            .from_table(dictionary.table(entity)?, Some(root_alias.clone()));

        for join in &many_to_one {
            let mto = schema.many_to_one(entity, &join.name)?;
            let relation = dictionary.relation(entity, &join.name)?;
            let correlation = Correlation {
                column: relation.to_column.clone(),
                parent: Expr::column(&root_alias, &relation.from_column),
            };

            let synthetic;
            let child = match join.ast {
                Some(child) => child,
                None => {
                    synthetic = SelectAst::new(&join.name);
                    &synthetic
                }
            };
            let query = self.compile_node(
                &mto.target_entity,
                child,
                &join.side_fields,
                Some(correlation),
                false,
            )?;
            base = base.left_join_lateral(query, self.aliases.next("j"));
        }

        for child in &ast.one_to_many {
            let otm = schema.one_to_many(entity, &child.name)?;
            let relation = dictionary.relation(entity, &child.name)?;
            let correlation = Correlation {
                column: relation.to_column.clone(),
                parent: Expr::column(&root_alias, &relation.from_column),
            };

            let query = self.compile_node(&otm.target_entity, child, &[], Some(correlation), true)?;
            base = base.left_join_lateral(query, self.aliases.next("j"));
        }

        let mut conditions = vec![Condition::Literal(true)];
        if let Some(Correlation { column, parent }) = correlation {
            conditions.push(Condition::eq(Expr::column(&root_alias, column), parent));
        }
        if let Some(filter) = &ast.args.filter {
            conditions.push(self.filters.compile(entity, filter, Some(&root_alias))?);
        }
        base = base.where_clause(Condition::and(conditions));
        if let Some(limit) = ast.args.limit.filter(|&n| n > 0) {
            base = base.limit(limit);
        }
        if let Some(offset) = ast.args.offset.filter(|&n| n > 0) {
            base = base.offset(offset);
        }

        let base_alias = self.aliases.next("base");
        let output = self.output_query(entity, &base_alias, ast, &many_to_one)?;

        let mut shaped = SelectBuilder::new().column_as(Expr::RowToJson(Box::new(output)), &ast.name);
        for key in &carried {
            shaped = match key.path.as_slice() {
                [field] => {
                    let field = schema.field(entity, field)?;
                    let column = dictionary.column(entity, &field.name)?;
                    shaped.column_as(Expr::column(&base_alias, column), &key.alias)
                }
                _ => shaped.column(Expr::column(&base_alias, &key.alias)),
            };
        }
        let shaped = shaped.from_subquery(base, &base_alias);

        if !list {
            return Ok(shaped);
        }

        let aggregated = Expr::JsonAgg {
            expr: Box::new(Expr::ident(&ast.name)),
            order_by: order_columns(order_keys),
            first: false,
        };
        Ok(SelectBuilder::new()
            .column_as(aggregated, &ast.name)
            .from_subquery(shaped, self.aliases.next("agg")))
    }

    // Requested many-to-one children, plus one join per sort path that walks
    // through a relation. Sort paths are handed down with their first step
    // removed and their alias kept.
    fn plan_many_to_one<'s>(
        &self,
        entity: &str,
        ast: &'s SelectAst,
        carried: &[SortKey],
    ) -> Result<Vec<RelationJoin<'s>>> {
        let mut joins: Vec<RelationJoin<'s>> = ast
            .many_to_one
            .iter()
            .map(|child| RelationJoin {
                name: child.name.clone(),
                ast: Some(child),
                side_fields: Vec::new(),
            })
            .collect();

        for key in carried {
            let [relation, rest @ ..] = key.path.as_slice() else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            if self.schema.find_many_to_one(entity, relation).is_none() {
                return Err(QueryError::NameResolution(format!(
                    "Order by {}: {} is not a many-to-one of entity {}",
                    key.path.join("."),
                    relation,
                    entity
                )));
            }

            let truncated = SortKey {
                path: rest.to_vec(),
                alias: key.alias.clone(),
                direction: key.direction,
            };
            match joins.iter_mut().find(|join| &join.name == relation) {
                Some(join) => join.side_fields.push(truncated),
                None => joins.push(RelationJoin {
                    name: relation.clone(),
                    ast: None,
                    side_fields: vec![truncated],
                }),
            }
        }

        Ok(joins)
    }

    // SELECT "o_n" FROM (SELECT <fields>, <relations>) AS "o_n"
    fn output_query(
        &mut self,
        entity: &str,
        base_alias: &str,
        ast: &SelectAst,
        many_to_one: &[RelationJoin<'_>],
    ) -> Result<SelectBuilder> {
        let output_alias = self.aliases.next("o");

        let mut projection = SelectBuilder::new();
        for field in &ast.fields {
            let column = self.dictionary.column(entity, field)?;
            projection = projection.column_as(Expr::column(base_alias, column), field);
        }
        let requested = many_to_one
            .iter()
            .filter(|join| join.ast.is_some())
            .map(|join| &join.name)
            .chain(ast.one_to_many.iter().map(|child| &child.name));
        for name in requested {
            projection = projection.column(Expr::column(base_alias, name));
        }

        Ok(SelectBuilder::new()
            .column(Expr::ident(&output_alias))
            .from_subquery(projection, output_alias))
    }
}

fn order_columns(keys: &[SortKey]) -> Vec<OrderBy> {
    keys.iter()
        .map(|key| OrderBy {
            column: key.alias.clone(),
            direction: key.direction,
        })
        .collect()
}
