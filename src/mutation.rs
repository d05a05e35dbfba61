use crate::ast::Filter;
use crate::builder::{Condition, DeleteBuilder, Expr, InsertBuilder, UpdateBuilder};
use crate::dictionary::NameDictionary;
use crate::error::{QueryError, Result};
use crate::filter::WhereCompiler;
use crate::prepare::{PreparedRecord, PreparedValue};
use crate::schema::{Member, SchemaRegistry};

/// Insert, update and delete compilers over prepared records.
///
/// Update and delete always carry a WHERE: a missing or empty filter compiles
/// to `true` and touches every row.
pub struct MutationCompiler<'a> {
    schema: &'a SchemaRegistry,
    dictionary: &'a NameDictionary,
}

impl<'a> MutationCompiler<'a> {
    pub fn new(schema: &'a SchemaRegistry, dictionary: &'a NameDictionary) -> Self {
        Self { schema, dictionary }
    }

    pub fn insert(&self, entity: &str, record: &PreparedRecord) -> Result<String> {
        self.insert_many(entity, std::slice::from_ref(record))
    }

    /// One multi-row INSERT. Every record must set the same fields in the
    /// same order.
    pub fn insert_many(&self, entity: &str, records: &[PreparedRecord]) -> Result<String> {
        let mut rows = Vec::with_capacity(records.len());
        let mut columns: Option<Vec<String>> = None;

        for record in records {
            let (record_columns, values) = self.assignments(entity, record)?;
            match &columns {
                Some(expected) if *expected != record_columns => {
                    return Err(QueryError::DataShape(format!(
                        "Batch insert into {} mixes column sets ({}) and ({})",
                        entity,
                        expected.join(", "),
                        record_columns.join(", ")
                    )))
                }
                Some(_) => {}
                None => columns = Some(record_columns),
            }
            rows.push(values);
        }

        let table = self.dictionary.table(entity)?;
        rows.into_iter()
            .fold(
                InsertBuilder::new(table, columns.unwrap_or_default()),
                InsertBuilder::values,
            )
            .build()
    }

    pub fn update(
        &self,
        entity: &str,
        record: &PreparedRecord,
        filter: Option<&Filter>,
    ) -> Result<String> {
        let (columns, values) = self.assignments(entity, record)?;
        let condition = self.where_condition(entity, filter)?;

        columns
            .into_iter()
            .zip(values)
            .fold(
                UpdateBuilder::new(self.dictionary.table(entity)?, condition),
                |builder, (column, value)| builder.set(column, value),
            )
            .build()
    }

    pub fn delete(&self, entity: &str, filter: Option<&Filter>) -> Result<String> {
        let condition = self.where_condition(entity, filter)?;
        DeleteBuilder::new(self.dictionary.table(entity)?, condition).build()
    }

    fn where_condition(&self, entity: &str, filter: Option<&Filter>) -> Result<Condition> {
        let empty = Filter::default();
        WhereCompiler::new(self.schema, self.dictionary).compile(
            entity,
            filter.unwrap_or(&empty),
            None,
        )
    }

    // Column list and placeholders of one record, in record order. Each
    // placeholder is cast to its column type, foreign keys to the type of
    // the field they reference.
    fn assignments(&self, entity: &str, record: &PreparedRecord) -> Result<(Vec<String>, Vec<Expr>)> {
        let mut columns = Vec::with_capacity(record.entries.len());
        let mut values = Vec::with_capacity(record.entries.len());

        for (name, value) in &record.entries {
            match self.schema.resolve(entity, name)? {
                Member::Field(field) => {
                    let PreparedValue::Param(param) = value else {
                        return Err(QueryError::DataShape(format!(
                            "Field {}.{} expects a scalar value",
                            entity, name
                        )));
                    };
                    columns.push(self.dictionary.column(entity, &field.name)?.to_string());
                    values.push(Expr::typed_param(*param, field.sql_type()));
                }
                Member::ManyToOne(mto) => {
                    let param = match value {
                        PreparedValue::Param(param) => *param,
                        PreparedValue::Record(target) => match target.get(&mto.target_field) {
                            Some(PreparedValue::Param(param)) => *param,
                            _ => {
                                return Err(QueryError::DataShape(format!(
                                    "Invalid data provided. field {}.{} does not have a value",
                                    mto.name, mto.target_field
                                )))
                            }
                        },
                        PreparedValue::List(_) => {
                            return Err(QueryError::DataShape(format!(
                                "Many-to-one {}.{} expects an object",
                                entity, name
                            )))
                        }
                    };
                    let relation = self.dictionary.relation(entity, &mto.name)?;
                    let target = self.schema.field(&mto.target_entity, &mto.target_field)?;
                    columns.push(relation.from_column.clone());
                    values.push(Expr::typed_param(param, target.sql_type()));
                }
                Member::OneToMany(_) | Member::NotFound => {
                    return Err(QueryError::DataShape(format!(
                        "Invalid data provided. {}.{} is neither a field or a many to one",
                        entity, name
                    )))
                }
            }
        }

        Ok((columns, values))
    }
}
