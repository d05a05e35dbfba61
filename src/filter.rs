use crate::ast::{Filter, FilterNode, Operand, Operator, Predicate};
use crate::builder::{AliasGenerator, ComparisonOp, Condition, Expr, SelectBuilder};
use crate::dictionary::NameDictionary;
use crate::error::{QueryError, Result};
use crate::schema::{Field, Member, SchemaRegistry};
use serde_json::Value;

impl Operator {
    fn comparison(&self) -> ComparisonOp {
        match self {
            Operator::Eq => ComparisonOp::Eq,
            Operator::Neq => ComparisonOp::Ne,
            Operator::Like => ComparisonOp::Like,
            Operator::ILike => ComparisonOp::ILike,
            Operator::NLike => ComparisonOp::NotLike,
            Operator::In => ComparisonOp::In,
            Operator::Nin => ComparisonOp::NotIn,
            Operator::Gt => ComparisonOp::Gt,
            Operator::Gte => ComparisonOp::Ge,
            Operator::Lt => ComparisonOp::Lt,
            Operator::Lte => ComparisonOp::Le,
            Operator::IsNull => ComparisonOp::IsNull,
        }
    }
}

/// Compiles filter trees into boolean conditions.
///
/// Relation keys become correlated `EXISTS` sub-queries over the target
/// table, each under a fresh `w_n` alias. The alias counter lives as long as
/// the compiler, so every condition built by one compiler can be nested in
/// the same statement.
#[derive(Debug)]
pub struct WhereCompiler<'a> {
    schema: &'a SchemaRegistry,
    dictionary: &'a NameDictionary,
    aliases: AliasGenerator,
}

impl<'a> WhereCompiler<'a> {
    pub fn new(schema: &'a SchemaRegistry, dictionary: &'a NameDictionary) -> Self {
        Self {
            schema,
            dictionary,
            aliases: AliasGenerator::new(),
        }
    }

    /// Compile `filter` on `entity`, qualifying columns with `alias` or, when
    /// absent, the entity's table name.
    pub fn compile(&mut self, entity: &str, filter: &Filter, alias: Option<&str>) -> Result<Condition> {
        let alias = match alias {
            Some(alias) => alias.to_string(),
            None => self.dictionary.table(entity)?.to_string(),
        };
        self.compile_entity(entity, &alias, filter)
    }

    pub fn build(&mut self, entity: &str, filter: &Filter, alias: Option<&str>) -> Result<String> {
        Ok(self.compile(entity, filter, alias)?.to_sql())
    }

    fn compile_entity(&mut self, entity: &str, alias: &str, filter: &Filter) -> Result<Condition> {
        let schema = self.schema;
        let mut conditions = Vec::new();

        for term in &filter.terms {
            match schema.resolve(entity, &term.name)? {
                Member::Field(field) => {
                    conditions.extend(self.compile_field(entity, alias, field, &term.node)?)
                }
                Member::ManyToOne(mto) => conditions.push(self.compile_relation(
                    entity,
                    alias,
                    &mto.name,
                    &mto.target_entity,
                    &term.node,
                )?),
                Member::OneToMany(otm) => conditions.push(self.compile_relation(
                    entity,
                    alias,
                    &otm.name,
                    &otm.target_entity,
                    &term.node,
                )?),
                Member::NotFound => {
                    return Err(QueryError::NameResolution(format!(
                        "Field {} not found in entity {}",
                        term.name, entity
                    )))
                }
            }
        }

        for nested in &filter.and {
            conditions.push(self.compile_entity(entity, alias, nested)?);
        }

        if !filter.or.is_empty() {
            let mut alternatives = Vec::with_capacity(filter.or.len());
            for nested in &filter.or {
                alternatives.push(self.compile_entity(entity, alias, nested)?);
            }
            conditions.push(Condition::or(alternatives));
        }

        Ok(Condition::and(conditions))
    }

    fn compile_field(
        &self,
        entity: &str,
        alias: &str,
        field: &Field,
        node: &FilterNode,
    ) -> Result<Vec<Condition>> {
        let predicates = match node {
            FilterNode::Predicates(predicates) => predicates,
            FilterNode::Nested(nested) => {
                return match nested.first_key() {
                    Some(key) => Err(QueryError::InvalidOperator(format!(
                        "Invalid operator {} on field {}.{}",
                        key, entity, field.name
                    ))),
                    None => Ok(Vec::new()),
                }
            }
        };

        let column = self.dictionary.column(entity, &field.name)?;
        let sql_type = field.sql_type();
        predicates
            .iter()
            .map(|predicate| compile_predicate(Expr::column(alias, column), &sql_type, predicate))
            .collect()
    }

    fn compile_relation(
        &mut self,
        entity: &str,
        alias: &str,
        relation: &str,
        target: &str,
        node: &FilterNode,
    ) -> Result<Condition> {
        let empty = Filter::default();
        let filter = match node {
            FilterNode::Nested(nested) => nested,
            FilterNode::Predicates(predicates) if predicates.is_empty() => &empty,
            FilterNode::Predicates(predicates) => {
                return Err(QueryError::InvalidFilter(format!(
                    "Relation {}.{} expects a nested filter, got operator {}",
                    entity, relation, predicates[0].operator
                )))
            }
        };

        let dictionary = self.dictionary;
        let join = dictionary.relation(entity, relation)?;
        let target_table = dictionary.table(target)?;
        let join_alias = self.aliases.next("w");

        let correlation = Condition::eq(
            Expr::column(&join_alias, &join.to_column),
            Expr::column(alias, &join.from_column),
        );
        let inner = self.compile_entity(target, &join_alias, filter)?;

        let query = SelectBuilder::new()
            .column(Expr::Literal(Value::from(1)))
            .from_table(target_table, Some(join_alias))
            .where_clause(Condition::and(vec![correlation, inner]));

        Ok(Condition::Exists(Box::new(query)))
    }
}

// Bound operands are cast to the column type, since parameters arrive as
// text, bigint, double or json.
fn compile_predicate(left: Expr, sql_type: &str, predicate: &Predicate) -> Result<Condition> {
    let op = predicate.operator.comparison();

    let right = match (&predicate.operator, &predicate.operand) {
        (Operator::IsNull, Operand::Flag(is_null)) => {
            return Ok(Condition::Compare {
                left,
                op: if *is_null {
                    ComparisonOp::IsNull
                } else {
                    ComparisonOp::IsNotNull
                },
                right: None,
            })
        }
        (Operator::In | Operator::Nin, Operand::ParamList(params)) => {
            if params.is_empty() {
                return Ok(Condition::Literal(predicate.operator == Operator::Nin));
            }
            Expr::List(params.iter().map(|&p| Expr::typed_param(p, sql_type)).collect())
        }
        (Operator::In | Operator::Nin, Operand::List(values)) => {
            if values.is_empty() {
                return Ok(Condition::Literal(predicate.operator == Operator::Nin));
            }
            Expr::List(values.iter().cloned().map(Expr::Literal).collect())
        }
        (Operator::IsNull | Operator::In | Operator::Nin, _) => {
            return Err(QueryError::InvalidFilter(format!(
                "Invalid operand for operator {}",
                predicate.operator
            )))
        }
        (_, Operand::Param(param)) => Expr::typed_param(*param, sql_type),
        (_, Operand::Value(value)) => Expr::Literal(value.clone()),
        (_, _) => {
            return Err(QueryError::InvalidFilter(format!(
                "Operator {} expects a single value",
                predicate.operator
            )))
        }
    };

    Ok(Condition::Compare {
        left,
        op,
        right: Some(right),
    })
}
