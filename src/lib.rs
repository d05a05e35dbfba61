//! relquery - relational-mapping query engine for PostgreSQL
//!
//! relquery turns nested, JSON-shaped read requests and entity-relative
//! writes into parameterized PostgreSQL statements over a declared entity
//! schema. A nested read, however deep, is always one statement built from
//! lateral joins and `json_agg`.
//!
//! # Architecture
//!
//! - **Schema Registry**: validated entities, fields and relations
//! - **Name Dictionary**: logical names to physical tables, columns and join pairs
//! - **Compilers**: where, select, insert, update and delete compilers over an
//!   intermediate SQL representation, with every value bound as `$n`
//! - **Schema Synchronizer**: additive, idempotent DDL from the declared schema
//! - **Connection**: the operation surface tying compilers to a backend
//!
//! # Example
//!
//! ```rust,no_run
//! use relquery::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let entities = vec![
//!         Entity::new("Writer")
//!             .field(Field::new("id", FieldType::Integer).primary())
//!             .field(Field::new("lastName", FieldType::String))
//!             .one_to_many("books", "Book", "writer"),
//!         Entity::new("Book")
//!             .field(Field::new("id", FieldType::Integer).primary())
//!             .field(Field::new("title", FieldType::String))
//!             .many_to_one("writer", "Writer", "id"),
//!     ];
//!
//!     // Connect to database (requires postgres feature)
//!     #[cfg(feature = "postgres")]
//!     {
//!         let connection: Connection<PostgresBackend> = Connection::connect(
//!             "postgresql://localhost/mydb",
//!             entities,
//!             ConnectionConfig::default(),
//!         )
//!         .await?;
//!
//!         let ast = OutputAst::new("books")
//!             .field("title")
//!             .node(OutputAst::new("writer").field("lastName"))
//!             .filter(Filter::parse(json!({ "writer": { "lastName": { "_eq": "Tolkien" } } }))?);
//!
//!         let books = connection.select("Book", &ast).await?;
//!         println!("Books: {}", books);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! The PostgreSQL backend is behind the `postgres` feature:
//!
//! ```toml
//! [dependencies]
//! relquery = { version = "0.1", features = ["postgres"] }
//! ```
//!
//! Any other executor can be plugged in through [`DatabaseBackend`].

pub mod ast;
pub mod backend;
pub mod builder;
pub mod connection;
pub mod dictionary;
pub mod error;
pub mod filter;
pub mod mutation;
pub mod prepare;
pub mod schema;
pub mod select;
pub mod sync;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(test)]
mod testing;

pub use ast::{map_output_ast, Filter, OrderBy, OutputAst, Record, SelectArgs, SelectAst};
pub use backend::{DatabaseBackend, QueryResult, QueryRow, Transaction};
pub use builder::{AggregateFunc, ComparisonOp, Condition, LogicalOp, SortDirection};
pub use connection::{Connection, ConnectionConfig, Query, QueryOutput};
pub use dictionary::{NameDictionary, Relation};
pub use error::{QueryError, Result};
pub use filter::WhereCompiler;
pub use mutation::MutationCompiler;
pub use prepare::{Statement, StatementPreparer};
pub use schema::{Entity, Field, FieldType, Member, SchemaRegistry};
pub use select::{AggregateTarget, SelectCompiler};
pub use sync::{CatalogSnapshot, SchemaSynchronizer};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresBackend, PostgresConfig};

/// Prelude for common imports
pub mod prelude {
    pub use crate::ast::{Filter, OrderBy, OutputAst, Record};
    pub use crate::backend::{DatabaseBackend, QueryResult, QueryRow};
    pub use crate::builder::AggregateFunc;
    pub use crate::connection::{Connection, ConnectionConfig, Query, QueryOutput};
    pub use crate::error::{QueryError, Result};
    pub use crate::schema::{Entity, Field, FieldType};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PostgresBackend;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Ensure all main types are exported
        let _config = ConnectionConfig::default();
        let _field_type = FieldType::String;
        let _comp_op = ComparisonOp::Eq;
        let _log_op = LogicalOp::And;
        let _func = AggregateFunc::Count;
    }
}
