use crate::ast::{Filter, FilterNode, Operand, Record, SelectAst};
use crate::error::{QueryError, Result};
use crate::schema::{Field, FieldType, Member, SchemaRegistry};
use serde_json::Value;

/// SQL text plus its positional parameters, ready for execution
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A record value after preparation
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedValue {
    Param(usize),
    /// Many-to-one target data
    Record(PreparedRecord),
    /// One-to-many target data
    List(Vec<PreparedRecord>),
}

/// Insert/update payload with every scalar replaced by a placeholder index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedRecord {
    pub entries: Vec<(String, PreparedValue)>,
}

impl PreparedRecord {
    pub fn get(&self, name: &str) -> Option<&PreparedValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// Rewrites literals into `$n` placeholders, collecting their values in order.
///
/// Placeholders are 1-indexed and continuous across every call made on one
/// preparer, so a preparer backs exactly one statement.
#[derive(Debug)]
pub struct StatementPreparer<'a> {
    schema: &'a SchemaRegistry,
    values: Vec<Value>,
}

impl<'a> StatementPreparer<'a> {
    pub fn new(schema: &'a SchemaRegistry) -> Self {
        Self {
            schema,
            values: Vec::new(),
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Pair the collected values with the SQL they were prepared for.
    pub fn finish(self, sql: String) -> Statement {
        Statement::new(sql, self.values)
    }

    fn bind(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.values.len()
    }

    /// Bind every predicate operand of `filter`. `_isnull` flags stay inline.
    pub fn prepare_where(&mut self, filter: &mut Filter) {
        for term in &mut filter.terms {
            match &mut term.node {
                FilterNode::Predicates(predicates) => {
                    for predicate in predicates {
                        let operand =
                            std::mem::replace(&mut predicate.operand, Operand::Flag(false));
                        predicate.operand = match operand {
                            Operand::Value(value) => Operand::Param(self.bind(value)),
                            Operand::List(values) => Operand::ParamList(
                                values.into_iter().map(|v| self.bind(v)).collect(),
                            ),
                            other => other,
                        };
                    }
                }
                FilterNode::Nested(nested) => self.prepare_where(nested),
            }
        }
        for nested in filter.and.iter_mut().chain(filter.or.iter_mut()) {
            self.prepare_where(nested);
        }
    }

    /// Bind the `where` of `ast` and of every nested relation, depth first.
    pub fn prepare_select(&mut self, ast: &mut SelectAst) {
        if let Some(filter) = ast.args.filter.as_mut() {
            self.prepare_where(filter);
        }
        for child in ast.many_to_one.iter_mut().chain(ast.one_to_many.iter_mut()) {
            self.prepare_select(child);
        }
    }

    /// Bind a flat insert/update payload of `entity`.
    ///
    /// Many-to-one data only binds the target field, the one value the
    /// foreign-key column needs; `null` binds `NULL`.
    pub fn prepare_record(&mut self, entity: &str, record: &Record) -> Result<PreparedRecord> {
        let schema = self.schema;
        let mut prepared = PreparedRecord::default();

        for (name, value) in record {
            let entry = match schema.resolve(entity, name)? {
                Member::Field(field) => PreparedValue::Param(self.bind(field_value(field, value))),
                Member::ManyToOne(mto) => match value {
                    Value::Null => PreparedValue::Param(self.bind(Value::Null)),
                    Value::Object(target) => {
                        let mut nested = PreparedRecord::default();
                        if let Some(key) = target.get(&mto.target_field) {
                            nested.entries.push((
                                mto.target_field.clone(),
                                PreparedValue::Param(self.bind(key.clone())),
                            ));
                        }
                        PreparedValue::Record(nested)
                    }
                    other => {
                        return Err(QueryError::DataShape(format!(
                            "Many-to-one {}.{} expects an object or null, got {}",
                            entity, name, other
                        )))
                    }
                },
                Member::OneToMany(otm) => match value {
                    Value::Array(items) => {
                        let mut records = Vec::with_capacity(items.len());
                        for item in items {
                            let Value::Object(item) = item else {
                                return Err(QueryError::DataShape(format!(
                                    "One-to-many {}.{} expects a list of objects",
                                    entity, name
                                )));
                            };
                            records.push(self.prepare_record(&otm.target_entity, item)?);
                        }
                        PreparedValue::List(records)
                    }
                    _ => {
                        return Err(QueryError::DataShape(format!(
                            "One-to-many {}.{} expects a list of objects",
                            entity, name
                        )))
                    }
                },
                Member::NotFound => {
                    return Err(QueryError::NameResolution(format!(
                        "Invalid field provided {}.{}",
                        entity, name
                    )))
                }
            };
            prepared.entries.push((name.clone(), entry));
        }

        Ok(prepared)
    }
}

// JSON columns receive their document as text, which the placeholder cast
// parses; a bare string would otherwise be read as JSON source.
fn field_value(field: &Field, value: &Value) -> Value {
    match (&field.field_type, value) {
        (_, Value::Null) => Value::Null,
        (FieldType::Json | FieldType::Jsonb, document) => Value::String(document.to_string()),
        (_, value) => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{map_output_ast, OutputAst};
    use crate::schema::Entity;
    use crate::testing::library;
    use serde_json::json;

    fn operands(filter: &Filter) -> Vec<Operand> {
        let mut collected = Vec::new();
        for term in &filter.terms {
            match &term.node {
                FilterNode::Predicates(predicates) => {
                    collected.extend(predicates.iter().map(|p| p.operand.clone()))
                }
                FilterNode::Nested(nested) => collected.extend(operands(nested)),
            }
        }
        for nested in filter.and.iter().chain(filter.or.iter()) {
            collected.extend(operands(nested));
        }
        collected
    }

    #[test]
    fn test_prepare_where() {
        let (schema, _) = library();
        let mut filter = Filter::parse(json!({
            "title": { "_eq": "The Hobbit" },
            "id": { "_in": ["b1", "b2"], "_isnull": false },
            "writer": { "lastName": { "_like": "Tol%" } },
            "_or": [{ "pages": { "_gt": 100 } }]
        }))
        .unwrap();

        let mut preparer = StatementPreparer::new(&schema);
        preparer.prepare_where(&mut filter);

        assert_eq!(
            operands(&filter),
            vec![
                Operand::Param(1),
                Operand::ParamList(vec![2, 3]),
                Operand::Flag(false),
                Operand::Param(4),
                Operand::Param(5),
            ]
        );
        assert_eq!(
            preparer.into_values(),
            vec![json!("The Hobbit"), json!("b1"), json!("b2"), json!("Tol%"), json!(100)]
        );
    }

    #[test]
    fn test_independent_preparers_start_at_one() {
        let (schema, _) = library();
        let mut first = Filter::parse(json!({ "id": { "_eq": "a" } })).unwrap();
        let mut second = Filter::parse(json!({ "id": { "_eq": "b" } })).unwrap();

        StatementPreparer::new(&schema).prepare_where(&mut first);
        StatementPreparer::new(&schema).prepare_where(&mut second);

        assert_eq!(operands(&first), vec![Operand::Param(1)]);
        assert_eq!(operands(&second), vec![Operand::Param(1)]);
    }

    #[test]
    fn test_prepare_select_walks_children() {
        let (schema, _) = library();
        let ast = OutputAst::new("books")
            .filter(Filter::parse(json!({ "title": { "_eq": "a" } })).unwrap())
            .node(
                OutputAst::new("characters")
                    .field("nickName")
                    .filter(Filter::parse(json!({ "nickName": { "_neq": "b" } })).unwrap()),
            )
            .node(
                OutputAst::new("writer")
                    .field("lastName")
                    .filter(Filter::parse(json!({ "id": { "_eq": "c" } })).unwrap()),
            );
        let mut select = map_output_ast(&schema, "Book", &ast).unwrap();

        let mut preparer = StatementPreparer::new(&schema);
        preparer.prepare_select(&mut select);

        assert_eq!(preparer.values(), &[json!("a"), json!("c"), json!("b")]);
        let writer_filter = select.many_to_one[0].args.filter.as_ref().unwrap();
        assert_eq!(operands(writer_filter), vec![Operand::Param(2)]);
    }

    #[test]
    fn test_prepare_record() {
        let (schema, _) = library();
        let record = json!({
            "id": "b1",
            "title": "The Hobbit",
            "writer": { "id": "w1", "firstName": "John" },
            "sequel": null
        });

        let mut preparer = StatementPreparer::new(&schema);
        let prepared = preparer
            .prepare_record("Book", record.as_object().unwrap())
            .unwrap();

        assert_eq!(prepared.get("id"), Some(&PreparedValue::Param(1)));
        assert_eq!(
            prepared.get("writer"),
            Some(&PreparedValue::Record(PreparedRecord {
                entries: vec![("id".to_string(), PreparedValue::Param(3))],
            }))
        );
        assert_eq!(prepared.get("sequel"), Some(&PreparedValue::Param(4)));
        assert_eq!(
            preparer.into_values(),
            vec![json!("b1"), json!("The Hobbit"), json!("w1"), Value::Null]
        );
    }

    #[test]
    fn test_prepare_record_json_field() {
        let schema = SchemaRegistry::new(vec![Entity::new("Note")
            .field(Field::new("id", FieldType::Integer).primary())
            .field(Field::new("body", FieldType::Jsonb))])
        .unwrap();

        let mut preparer = StatementPreparer::new(&schema);
        preparer
            .prepare_record("Note", json!({ "id": 1, "body": { "tags": ["a"] } }).as_object().unwrap())
            .unwrap();
        preparer
            .prepare_record("Note", json!({ "body": "plain" }).as_object().unwrap())
            .unwrap();
        preparer
            .prepare_record("Note", json!({ "body": null }).as_object().unwrap())
            .unwrap();

        assert_eq!(
            preparer.into_values(),
            vec![json!(1), json!("{\"tags\":[\"a\"]}"), json!("\"plain\""), Value::Null]
        );
    }

    #[test]
    fn test_prepare_record_one_to_many() {
        let (schema, _) = library();
        let record = json!({ "id": "w1", "books": [{ "id": "b1" }, { "id": "b2" }] });

        let mut preparer = StatementPreparer::new(&schema);
        let prepared = preparer
            .prepare_record("Writer", record.as_object().unwrap())
            .unwrap();

        assert!(matches!(prepared.get("books"), Some(PreparedValue::List(items)) if items.len() == 2));
        assert_eq!(preparer.values().len(), 3);
    }

    #[test]
    fn test_prepare_record_unknown_field() {
        let (schema, _) = library();
        let record = json!({ "isbn": "978" });

        let result = StatementPreparer::new(&schema).prepare_record("Book", record.as_object().unwrap());
        assert!(matches!(result, Err(QueryError::NameResolution(_))));
    }

    #[test]
    fn test_finish() {
        let (schema, _) = library();
        let mut preparer = StatementPreparer::new(&schema);
        let mut filter = Filter::parse(json!({ "id": { "_eq": 7 } })).unwrap();
        preparer.prepare_where(&mut filter);

        let statement = preparer.finish("SELECT 1".to_string());
        assert_eq!(statement, Statement::new("SELECT 1", vec![json!(7)]));
    }
}
