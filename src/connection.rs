use crate::ast::{map_output_ast, Filter, OutputAst, Record};
use crate::backend::{DatabaseBackend, QueryResult, Transaction};
use crate::builder::AggregateFunc;
use crate::dictionary::NameDictionary;
use crate::error::{QueryError, Result};
use crate::mutation::MutationCompiler;
use crate::prepare::{Statement, StatementPreparer};
use crate::schema::{Entity, SchemaRegistry};
use crate::select::{AggregateTarget, SelectCompiler};
use crate::sync::SchemaSynchronizer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Configuration for a connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Reconcile the database schema when the connection opens
    pub synchronize: bool,
    /// Physical name overrides, keyed by `Entity`, `Entity.field` or `Entity.relation`
    pub name_overrides: HashMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            synchronize: true,
            name_overrides: HashMap::new(),
        }
    }
}

/// One operation of a transactional batch
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Query {
    Select {
        entity: String,
        ast: OutputAst,
        #[serde(default)]
        one: bool,
    },
    Aggregate {
        entity: String,
        function: AggregateFunc,
        target: AggregateTarget,
        #[serde(default, rename = "where")]
        filter: Option<Filter>,
    },
    Insert {
        entity: String,
        data: Record,
    },
    InsertMany {
        entity: String,
        data: Vec<Record>,
    },
    Update {
        entity: String,
        data: Record,
        #[serde(default, rename = "where")]
        filter: Option<Filter>,
    },
    Delete {
        entity: String,
        #[serde(default, rename = "where")]
        filter: Option<Filter>,
    },
}

/// Result of one [`Query`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutput {
    /// JSON document of a select, or the scalar of an aggregate
    Value(Value),
    /// Rows touched by an insert, update or delete
    RowCount(u64),
}

// A compiled operation and what to read back from its result.
enum Plan {
    Fetch { statement: Statement, column: String },
    Count { statement: Statement },
    Skip,
}

/// Entry point tying the compilers to a backend.
///
/// Every operation compiles to exactly one statement. Compilation happens
/// before the backend lock is taken, so a name or shape error never reaches
/// the database.
pub struct Connection<B: DatabaseBackend> {
    schema: Arc<SchemaRegistry>,
    dictionary: Arc<NameDictionary>,
    backend: Arc<RwLock<B>>,
    config: ConnectionConfig,
}

impl<B: DatabaseBackend> Clone for Connection<B> {
    fn clone(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            dictionary: Arc::clone(&self.dictionary),
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
        }
    }
}

impl<B: DatabaseBackend> Connection<B> {
    /// Connect the backend to `url` and open a connection over it.
    pub async fn connect(url: &str, entities: Vec<Entity>, config: ConnectionConfig) -> Result<Self> {
        let backend = B::connect(url).await?;
        Self::open(backend, entities, config).await
    }

    /// Validate `entities`, derive physical names and, when configured,
    /// synchronize the database schema.
    pub async fn open(backend: B, entities: Vec<Entity>, config: ConnectionConfig) -> Result<Self> {
        let schema = SchemaRegistry::new(entities)?;
        let dictionary = NameDictionary::with_overrides(&schema, &config.name_overrides)?;

        let connection = Self {
            schema: Arc::new(schema),
            dictionary: Arc::new(dictionary),
            backend: Arc::new(RwLock::new(backend)),
            config,
        };

        if connection.config.synchronize {
            connection.synchronize().await?;
        }

        Ok(connection)
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn dictionary(&self) -> &NameDictionary {
        &self.dictionary
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<RwLock<B>> {
        Arc::clone(&self.backend)
    }

    /// Every matching row as one JSON array, `[]` when nothing matches.
    pub async fn select(&self, entity: &str, ast: &OutputAst) -> Result<Value> {
        self.run(self.select_plan(entity, ast, false)?)
            .await
            .map(QueryOutput::into_value)
    }

    /// The first matching row as a JSON object, or `null`.
    pub async fn select_one(&self, entity: &str, ast: &OutputAst) -> Result<Value> {
        self.run(self.select_plan(entity, ast, true)?)
            .await
            .map(QueryOutput::into_value)
    }

    pub async fn aggregate(
        &self,
        entity: &str,
        func: AggregateFunc,
        target: impl Into<AggregateTarget>,
        filter: Option<&Filter>,
    ) -> Result<Value> {
        let plan = self.aggregate_plan(entity, func, &target.into(), filter)?;
        self.run(plan).await.map(QueryOutput::into_value)
    }

    pub async fn insert(&self, entity: &str, data: &Record) -> Result<u64> {
        let plan = self.insert_plan(entity, std::slice::from_ref(data))?;
        self.run(plan).await.map(|output| output.row_count())
    }

    /// Insert every record with one statement. An empty batch is a no-op.
    pub async fn insert_many(&self, entity: &str, data: &[Record]) -> Result<u64> {
        let plan = self.insert_plan(entity, data)?;
        self.run(plan).await.map(|output| output.row_count())
    }

    /// Update the rows matching `filter`. Without a filter, every row is updated.
    pub async fn update(&self, entity: &str, data: &Record, filter: Option<&Filter>) -> Result<u64> {
        let plan = self.update_plan(entity, data, filter)?;
        self.run(plan).await.map(|output| output.row_count())
    }

    /// Delete the rows matching `filter`. Without a filter, every row is deleted.
    pub async fn delete(&self, entity: &str, filter: Option<&Filter>) -> Result<u64> {
        let plan = self.delete_plan(entity, filter)?;
        self.run(plan).await.map(|output| output.row_count())
    }

    /// Execute caller-written SQL as is.
    pub async fn raw(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        tracing::debug!(sql = %sql, params = params.len(), "relquery.statement");
        self.backend.write().await.query(sql, params).await
    }

    /// Run a single [`Query`].
    pub async fn execute(&self, query: &Query) -> Result<QueryOutput> {
        self.run(self.plan(query)?).await
    }

    /// Run `queries` in order on one transaction.
    ///
    /// Every query is compiled before the transaction begins. The first
    /// failing statement rolls the transaction back and its error is returned.
    pub async fn transaction(&self, queries: &[Query]) -> Result<Vec<QueryOutput>> {
        let plans = queries
            .iter()
            .map(|query| self.plan(query))
            .collect::<Result<Vec<_>>>()?;

        let mut backend = self.backend.write().await;
        let mut transaction = Transaction::new(&mut *backend).await?;
        let mut outputs = Vec::with_capacity(plans.len());

        for plan in plans {
            match run_plan(transaction.backend(), plan).await {
                Ok(output) => outputs.push(output),
                Err(error) => {
                    if let Err(rollback) = transaction.rollback().await {
                        tracing::warn!(error = %rollback, "relquery.transaction.rollback_failed");
                    }
                    return Err(error);
                }
            }
        }

        transaction.commit().await?;
        Ok(outputs)
    }

    /// Create missing tables, columns and foreign keys. Returns the number of
    /// DDL statements executed.
    pub async fn synchronize(&self) -> Result<usize> {
        let mut backend = self.backend.write().await;
        SchemaSynchronizer::new(&self.schema, &self.dictionary)
            .synchronize(&mut *backend)
            .await
    }

    /// Close the backend. Fails while clones of this connection are alive.
    pub async fn close(self) -> Result<()> {
        let backend = Arc::try_unwrap(self.backend).map_err(|_| {
            QueryError::Connection("Connection is still shared".to_string())
        })?;
        backend.into_inner().close().await
    }

    async fn run(&self, plan: Plan) -> Result<QueryOutput> {
        if let Plan::Skip = plan {
            return Ok(QueryOutput::RowCount(0));
        }
        let mut backend = self.backend.write().await;
        run_plan(&mut *backend, plan).await
    }

    fn plan(&self, query: &Query) -> Result<Plan> {
        match query {
            Query::Select { entity, ast, one } => self.select_plan(entity, ast, *one),
            Query::Aggregate {
                entity,
                function,
                target,
                filter,
            } => self.aggregate_plan(entity, *function, target, filter.as_ref()),
            Query::Insert { entity, data } => self.insert_plan(entity, std::slice::from_ref(data)),
            Query::InsertMany { entity, data } => self.insert_plan(entity, data),
            Query::Update {
                entity,
                data,
                filter,
            } => self.update_plan(entity, data, filter.as_ref()),
            Query::Delete { entity, filter } => self.delete_plan(entity, filter.as_ref()),
        }
    }

    fn select_plan(&self, entity: &str, ast: &OutputAst, one: bool) -> Result<Plan> {
        let mut select = map_output_ast(&self.schema, entity, ast)?;
        let mut preparer = StatementPreparer::new(&self.schema);
        preparer.prepare_select(&mut select);

        let mut compiler = SelectCompiler::new(&self.schema, &self.dictionary);
        let sql = if one {
            compiler.select_one(entity, &select)?
        } else {
            compiler.select(entity, &select)?
        };

        Ok(Plan::Fetch {
            statement: preparer.finish(sql),
            column: select.name,
        })
    }

    fn aggregate_plan(
        &self,
        entity: &str,
        func: AggregateFunc,
        target: &AggregateTarget,
        filter: Option<&Filter>,
    ) -> Result<Plan> {
        let mut preparer = StatementPreparer::new(&self.schema);
        let filter = prepared_filter(&mut preparer, filter);

        let sql = SelectCompiler::new(&self.schema, &self.dictionary).aggregate(
            entity,
            func,
            target,
            filter.as_ref(),
        )?;

        Ok(Plan::Fetch {
            statement: preparer.finish(sql),
            column: func.name().to_string(),
        })
    }

    fn insert_plan(&self, entity: &str, data: &[Record]) -> Result<Plan> {
        if data.is_empty() {
            return Ok(Plan::Skip);
        }

        let mut preparer = StatementPreparer::new(&self.schema);
        let records = data
            .iter()
            .map(|record| preparer.prepare_record(entity, record))
            .collect::<Result<Vec<_>>>()?;
        let sql = MutationCompiler::new(&self.schema, &self.dictionary).insert_many(entity, &records)?;

        Ok(Plan::Count {
            statement: preparer.finish(sql),
        })
    }

    fn update_plan(&self, entity: &str, data: &Record, filter: Option<&Filter>) -> Result<Plan> {
        let mut preparer = StatementPreparer::new(&self.schema);
        let record = preparer.prepare_record(entity, data)?;
        let filter = prepared_filter(&mut preparer, filter);
        let sql = MutationCompiler::new(&self.schema, &self.dictionary).update(
            entity,
            &record,
            filter.as_ref(),
        )?;

        Ok(Plan::Count {
            statement: preparer.finish(sql),
        })
    }

    fn delete_plan(&self, entity: &str, filter: Option<&Filter>) -> Result<Plan> {
        let mut preparer = StatementPreparer::new(&self.schema);
        let filter = prepared_filter(&mut preparer, filter);
        let sql = MutationCompiler::new(&self.schema, &self.dictionary).delete(entity, filter.as_ref())?;

        Ok(Plan::Count {
            statement: preparer.finish(sql),
        })
    }
}

impl QueryOutput {
    pub fn into_value(self) -> Value {
        match self {
            QueryOutput::Value(value) => value,
            QueryOutput::RowCount(count) => Value::from(count),
        }
    }

    pub fn row_count(&self) -> u64 {
        match self {
            QueryOutput::Value(_) => 0,
            QueryOutput::RowCount(count) => *count,
        }
    }
}

fn prepared_filter(preparer: &mut StatementPreparer<'_>, filter: Option<&Filter>) -> Option<Filter> {
    filter.cloned().map(|mut filter| {
        preparer.prepare_where(&mut filter);
        filter
    })
}

async fn run_plan<B: DatabaseBackend>(backend: &mut B, plan: Plan) -> Result<QueryOutput> {
    match plan {
        Plan::Fetch { statement, column } => {
            tracing::debug!(sql = %statement.sql, params = statement.params.len(), "relquery.statement");
            let mut result = backend.query(&statement.sql, &statement.params).await?;
            let value = result
                .rows
                .first_mut()
                .and_then(|row| row.take(&column))
                .unwrap_or(Value::Null);
            Ok(QueryOutput::Value(value))
        }
        Plan::Count { statement } => {
            tracing::debug!(sql = %statement.sql, params = statement.params.len(), "relquery.statement");
            let count = backend.execute(&statement.sql, &statement.params).await?;
            Ok(QueryOutput::RowCount(count))
        }
        Plan::Skip => Ok(QueryOutput::RowCount(0)),
    }
}
