use crate::error::Result;
use crate::prepare::Statement;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Row from a query result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRow {
    pub columns: HashMap<String, Value>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: Value) {
        self.columns.insert(key, value);
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.columns.get(key)
    }

    /// Remove and return a column value
    pub fn take(&mut self, key: &str) -> Option<Value> {
        self.columns.remove(key)
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.columns
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.columns
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.columns.get(key).and_then(|v| v.as_i64())
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for QueryRow {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Result of a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<QueryRow>,
    /// Rows returned, or affected for data-modifying statements
    pub row_count: u64,
}

impl QueryResult {
    pub fn new(rows: Vec<QueryRow>) -> Self {
        let row_count = rows.len() as u64;
        Self { rows, row_count }
    }

    pub fn first(&self) -> Option<&QueryRow> {
        self.rows.first()
    }
}

/// Statement execution capability the compilers hand their output to.
///
/// Implementations run every call on the same session while a transaction
/// is open.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Connect to the database
    async fn connect(url: &str) -> Result<Self>
    where
        Self: Sized;

    /// Execute a statement with positional parameters, returning the affected row count
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Query with positional parameters and return the rows
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Execute several `;`-separated statements without parameters
    async fn execute_batch(&mut self, sql: &str) -> Result<()>;

    /// Begin a transaction
    async fn begin_transaction(&mut self) -> Result<()>;

    /// Commit the current transaction
    async fn commit(&mut self) -> Result<()>;

    /// Rollback the current transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Discard the current transaction without waiting on the database.
    ///
    /// Called when a [`Transaction`] guard is dropped before commit or
    /// rollback, e.g. when its future is cancelled. Afterwards statements must
    /// no longer run inside the discarded transaction.
    fn abandon_transaction(&mut self) {}

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Close the connection
    async fn close(self) -> Result<()>;
}

/// Open transaction over a borrowed backend.
///
/// Consumed by [`commit`](Self::commit) or [`rollback`](Self::rollback);
/// dropping it without either abandons the transaction on the backend.
pub struct Transaction<'a, B: DatabaseBackend> {
    backend: &'a mut B,
    finished: bool,
}

impl<'a, B: DatabaseBackend> Transaction<'a, B> {
    pub async fn new(backend: &'a mut B) -> Result<Self> {
        backend.begin_transaction().await?;
        tracing::info!("relquery.transaction.begin");
        Ok(Self {
            backend,
            finished: false,
        })
    }

    pub async fn commit(mut self) -> Result<()> {
        self.backend.commit().await?;
        self.finished = true;
        tracing::info!("relquery.transaction.commit");
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.backend.rollback().await?;
        self.finished = true;
        tracing::info!("relquery.transaction.rollback");
        Ok(())
    }

    pub async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        self.backend
            .execute(&statement.sql, &statement.params)
            .await
    }

    pub async fn query(&mut self, statement: &Statement) -> Result<QueryResult> {
        self.backend.query(&statement.sql, &statement.params).await
    }

    pub fn backend(&mut self) -> &mut B {
        self.backend
    }
}

impl<B: DatabaseBackend> Drop for Transaction<'_, B> {
    fn drop(&mut self) {
        if !self.finished {
            self.backend.abandon_transaction();
            tracing::warn!("relquery.transaction.abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_transaction_commit() {
        let mut backend = MockBackend::new();
        let mut transaction = Transaction::new(&mut backend).await.unwrap();
        transaction
            .execute(&Statement::new("DELETE FROM \"book\"", vec![]))
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        assert_eq!(backend.events, vec!["begin", "commit"]);
        assert!(!backend.in_transaction);
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_abandoned() {
        let mut backend = MockBackend::new();
        {
            let mut transaction = Transaction::new(&mut backend).await.unwrap();
            transaction
                .query(&Statement::new("SELECT $1", vec![json!(1)]))
                .await
                .unwrap();
        }

        assert_eq!(backend.events, vec!["begin", "abandon"]);
        assert!(!backend.in_transaction);
    }

    #[tokio::test]
    async fn test_failed_commit_is_abandoned() {
        let mut backend = MockBackend::new().failing_on("COMMIT");
        let transaction = Transaction::new(&mut backend).await.unwrap();
        assert!(transaction.commit().await.is_err());

        assert_eq!(backend.events, vec!["begin", "abandon"]);
    }
}
