//! Library schema and mock backend shared by the unit tests.

use crate::backend::{DatabaseBackend, QueryResult, QueryRow};
use crate::dictionary::NameDictionary;
use crate::error::{QueryError, Result};
use crate::schema::{Entity, Field, FieldType, SchemaRegistry};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;

pub(crate) fn library_entities() -> Vec<Entity> {
    vec![
        Entity::new("Book")
            .field(Field::new("id", FieldType::String).primary())
            .field(Field::new("title", FieldType::String))
            .field(Field::new("pages", FieldType::Integer).default_value(69))
            .many_to_one("writer", "Writer", "id")
            .many_to_one("sequel", "Book", "id")
            .one_to_many("characters", "Character", "book"),
        Entity::new("Writer")
            .field(Field::new("id", FieldType::String).primary())
            .field(Field::new("firstName", FieldType::String))
            .field(Field::new("lastName", FieldType::String))
            .one_to_many("books", "Book", "writer"),
        Entity::new("Character")
            .field(Field::new("id", FieldType::String).primary())
            .field(Field::new("nickName", FieldType::String))
            .many_to_one("book", "Book", "id"),
    ]
}

pub(crate) fn library() -> (SchemaRegistry, NameDictionary) {
    let schema = SchemaRegistry::new(library_entities()).unwrap();
    let dictionary = NameDictionary::new(&schema).unwrap();
    (schema, dictionary)
}

/// In-memory backend recording every statement it is handed.
///
/// Queued results are returned by `query` in order; `execute` reports the
/// queued result's row count, or 1 when the queue is empty. Any statement
/// containing `fail_on` fails with a database error; a `fail_on` of
/// `COMMIT` fails the commit instead.
#[derive(Debug, Default)]
pub(crate) struct MockBackend {
    pub executed: Vec<(String, Vec<Value>)>,
    pub batches: Vec<String>,
    pub events: Vec<&'static str>,
    pub results: VecDeque<QueryResult>,
    pub fail_on: Option<String>,
    pub in_transaction: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(results: Vec<QueryResult>) -> Self {
        Self {
            results: results.into(),
            ..Self::default()
        }
    }

    pub fn failing_on(mut self, fragment: impl Into<String>) -> Self {
        self.fail_on = Some(fragment.into());
        self
    }

    fn record(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        self.executed.push((sql.to_string(), params.to_vec()));
        match &self.fail_on {
            Some(fragment) if sql.contains(fragment.as_str()) => {
                Err(QueryError::Database(format!("statement failed: {}", sql)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DatabaseBackend for MockBackend {
    async fn connect(_url: &str) -> Result<Self> {
        Ok(Self::new())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.record(sql, params)?;
        Ok(self.results.pop_front().map_or(1, |r| r.row_count))
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.record(sql, params)?;
        Ok(self.results.pop_front().unwrap_or_default())
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.batches.push(sql.to_string());
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.in_transaction = true;
        self.events.push("begin");
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.in_transaction = false;
        if self.fail_on.as_deref() == Some("COMMIT") {
            return Err(QueryError::Transaction("commit failed".to_string()));
        }
        self.events.push("commit");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.events.push("rollback");
        Ok(())
    }

    fn abandon_transaction(&mut self) {
        self.in_transaction = false;
        self.events.push("abandon");
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}

/// Result holding a single row.
pub(crate) fn single_row(columns: Vec<(&str, Value)>) -> QueryResult {
    QueryResult::new(vec![columns.into_iter().collect::<QueryRow>()])
}
