use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    /// Declared entities violate a schema invariant. Raised once, at startup.
    #[error("Schema definition error: {0}")]
    SchemaDefinition(String),

    /// A field or relation name does not exist on the entity it was looked up on.
    #[error("Name resolution error: {0}")]
    NameResolution(String),

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Insert/update payload does not have the shape the entity requires.
    #[error("Data shape error: {0}")]
    DataShape(String),

    /// Registry and dictionary disagree. Always a programming error.
    #[error("Dictionary error: {0}")]
    Dictionary(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}
