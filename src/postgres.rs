use crate::backend::{DatabaseBackend, QueryResult, QueryRow};
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};

/// PostgreSQL connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/postgres".to_string(),
            max_connections: 5,
        }
    }
}

/// Pooled PostgreSQL backend.
///
/// Statements run on any pooled connection until a transaction begins; from
/// then on every statement runs on the reserved connection until commit or
/// rollback releases it.
pub struct PostgresBackend {
    pool: PgPool,
    transaction: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresBackend {
    /// Create a new PostgreSQL backend with connection pool
    pub async fn new(url: &str) -> Result<Self> {
        Self::with_config(&PostgresConfig {
            url: url.to_string(),
            ..PostgresConfig::default()
        })
        .await
    }

    pub async fn with_config(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| QueryError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            transaction: None,
        })
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn bind_params<'q>(
        mut query: Query<'q, Postgres, PgArguments>,
        params: &[Value],
    ) -> Query<'q, Postgres, PgArguments> {
        for param in params {
            query = match param {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64()),
                },
                Value::String(s) => query.bind(s.clone()),
                other => query.bind(sqlx::types::Json(other.clone())),
            };
        }
        query
    }

    /// Convert PostgreSQL row to QueryRow.
    ///
    /// Columns of a type with no JSON mapping (numeric, bytea, date/time) are
    /// an error; compiled statements wrap such values in `to_json`.
    fn convert_row(row: &PgRow) -> Result<QueryRow> {
        let mut query_row = QueryRow::new();

        for column in row.columns() {
            let column_name = column.name();

            let value = if let Ok(value) = row.try_get::<Option<Value>, _>(column_name) {
                value.unwrap_or(Value::Null)
            } else if let Ok(value) = row.try_get::<Option<String>, _>(column_name) {
                value.map_or(Value::Null, Value::String)
            } else if let Ok(value) = row.try_get::<Option<i64>, _>(column_name) {
                value.map_or(Value::Null, Value::from)
            } else if let Ok(value) = row.try_get::<Option<i32>, _>(column_name) {
                value.map_or(Value::Null, Value::from)
            } else if let Ok(value) = row.try_get::<Option<i16>, _>(column_name) {
                value.map_or(Value::Null, Value::from)
            } else if let Ok(value) = row.try_get::<Option<f64>, _>(column_name) {
                value.map_or(Value::Null, Value::from)
            } else if let Ok(value) = row.try_get::<Option<f32>, _>(column_name) {
                value.map_or(Value::Null, Value::from)
            } else if let Ok(value) = row.try_get::<Option<bool>, _>(column_name) {
                value.map_or(Value::Null, Value::Bool)
            } else {
                return Err(QueryError::Database(format!(
                    "Cannot decode column {} of type {}, select to_json({}) instead",
                    column_name,
                    column.type_info().name(),
                    column_name
                )));
            };
            query_row.insert(column_name.to_string(), value);
        }

        Ok(query_row)
    }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    async fn connect(url: &str) -> Result<Self> {
        Self::new(url).await
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let query = Self::bind_params(sqlx::query(sql), params);
        let result = match self.transaction.as_mut() {
            Some(transaction) => query.execute(&mut **transaction).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let query = Self::bind_params(sqlx::query(sql), params);
        let rows = match self.transaction.as_mut() {
            Some(transaction) => query.fetch_all(&mut **transaction).await?,
            None => query.fetch_all(&self.pool).await?,
        };

        let rows = rows
            .iter()
            .map(Self::convert_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryResult::new(rows))
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<()> {
        match self.transaction.as_mut() {
            Some(transaction) => {
                sqlx::Executor::execute(&mut **transaction, sqlx::raw_sql(sql)).await?
            }
            None => sqlx::Executor::execute(&self.pool, sqlx::raw_sql(sql)).await?,
        };
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(QueryError::Transaction(
                "Already in transaction".to_string(),
            ));
        }

        self.transaction = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let transaction = self
            .transaction
            .take()
            .ok_or_else(|| QueryError::Transaction("Not in transaction".to_string()))?;

        transaction.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let transaction = self
            .transaction
            .take()
            .ok_or_else(|| QueryError::Transaction("Not in transaction".to_string()))?;

        transaction.rollback().await?;
        Ok(())
    }

    fn abandon_transaction(&mut self) {
        // sqlx queues the ROLLBACK when the transaction is dropped, before
        // the connection goes back to the pool
        self.transaction = None;
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn close(self) -> Result<()> {
        if let Some(transaction) = self.transaction {
            transaction.rollback().await?;
        }
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn database_url() -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgresql://localhost/test".to_string())
    }

    #[test]
    fn test_config_defaults() {
        let config: PostgresConfig =
            serde_json::from_value(json!({ "url": "postgresql://db/app" })).unwrap();
        assert_eq!(config.url, "postgresql://db/app");
        assert_eq!(config.max_connections, 5);
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_connection() {
        let backend = PostgresBackend::connect(&database_url()).await;
        assert!(backend.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_query() {
        let mut backend = PostgresBackend::connect(&database_url()).await.unwrap();
        backend.begin_transaction().await.unwrap();

        // Temporary tables live on the reserved connection
        backend
            .execute_batch("CREATE TEMPORARY TABLE test_table (id BIGINT PRIMARY KEY, name TEXT)")
            .await
            .unwrap();

        let inserted = backend
            .execute(
                "INSERT INTO test_table (id, name) VALUES ($1, $2)",
                &[json!(1), json!("Alice")],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let results = backend
            .query("SELECT * FROM test_table WHERE id = $1", &[json!(1)])
            .await
            .unwrap();

        assert_eq!(results.rows.len(), 1);
        assert_eq!(results.rows[0].get_i64("id"), Some(1));
        assert_eq!(results.rows[0].get_string("name"), Some("Alice".to_string()));

        backend.rollback().await.unwrap();
        assert!(!backend.in_transaction());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_numeric_columns() {
        let mut backend = PostgresBackend::connect(&database_url()).await.unwrap();

        let result = backend.query("SELECT 1.5::numeric AS price", &[]).await;
        assert!(matches!(result, Err(QueryError::Database(message)) if message.contains("price")));

        let results = backend
            .query("SELECT to_json(1.5::numeric) AS price", &[])
            .await
            .unwrap();
        assert_eq!(results.rows[0].value("price"), Some(&json!(1.5)));
    }
}
