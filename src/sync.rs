use crate::backend::{DatabaseBackend, QueryRow};
use crate::builder::{format_value, quote_ident};
use crate::dictionary::NameDictionary;
use crate::error::{QueryError, Result};
use crate::schema::{Constraints, Entity, SchemaRegistry};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Tables and columns of every user schema, one row per table.
pub const INTROSPECTION_SQL: &str = "SELECT \"tables\".\"table_name\"::text AS \"table\", \
coalesce(\"c\".\"columns\", '[]'::json) AS \"columns\" \
FROM \"information_schema\".\"tables\" AS \"tables\" \
LEFT JOIN LATERAL (SELECT json_agg(json_build_object(\
'name', \"cols\".\"column_name\", \
'type', \"cols\".\"data_type\", \
'length', \"cols\".\"character_maximum_length\", \
'nullable', \"cols\".\"is_nullable\" = 'YES', \
'default', \"cols\".\"column_default\")) AS \"columns\" \
FROM \"information_schema\".\"columns\" AS \"cols\" \
WHERE \"cols\".\"table_name\" = \"tables\".\"table_name\" \
AND \"cols\".\"table_schema\" = \"tables\".\"table_schema\") AS \"c\" ON true \
WHERE \"tables\".\"table_schema\" NOT IN ('information_schema', 'pg_catalog')";

/// Column as reported by the database catalog
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
}

impl CatalogColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            length: None,
            nullable: true,
            default: None,
        }
    }
}

/// Physical tables and columns found in the database, keyed by physical name.
///
/// Only used to decide what DDL is missing; it carries no keys or relations.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    tables: HashMap<String, HashMap<String, CatalogColumn>>,
}

impl CatalogSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from the rows of [`INTROSPECTION_SQL`].
    pub fn from_rows(rows: &[QueryRow]) -> Result<Self> {
        let mut snapshot = Self::new();
        for row in rows {
            let table = row.get_string("table").ok_or_else(|| {
                QueryError::Database("Catalog row without a table name".to_string())
            })?;
            let columns = match row.value("columns") {
                None | Some(Value::Null) => Vec::new(),
                Some(columns) => serde_json::from_value(columns.clone())?,
            };
            snapshot.add_table(table, columns);
        }
        Ok(snapshot)
    }

    /// Register a table. Columns merge into an already known table.
    pub fn add_table(&mut self, table: impl Into<String>, columns: Vec<CatalogColumn>) {
        let known = self.tables.entry(table.into()).or_default();
        for column in columns {
            known.insert(column.name.clone(), column);
        }
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|columns| columns.contains_key(column))
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&CatalogColumn> {
        self.tables.get(table).and_then(|columns| columns.get(column))
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

/// Additive schema reconciliation.
///
/// Creates missing tables, adds missing columns and adds the foreign key of
/// every newly created many-to-one column. Existing columns and constraints
/// are never altered or dropped, so a reconciled database plans no DDL.
pub struct SchemaSynchronizer<'a> {
    schema: &'a SchemaRegistry,
    dictionary: &'a NameDictionary,
}

impl<'a> SchemaSynchronizer<'a> {
    pub fn new(schema: &'a SchemaRegistry, dictionary: &'a NameDictionary) -> Self {
        Self { schema, dictionary }
    }

    /// Introspect the database and execute the missing DDL as one batch.
    ///
    /// Returns the number of DDL statements executed; `0` means the database
    /// already matched and nothing was sent.
    pub async fn synchronize<B: DatabaseBackend>(&self, backend: &mut B) -> Result<usize> {
        let result = backend.query(INTROSPECTION_SQL, &[]).await?;
        let catalog = CatalogSnapshot::from_rows(&result.rows)?;

        let statements = self.plan(&catalog)?;
        if statements.is_empty() {
            tracing::debug!(tables = catalog.table_count(), "relquery.sync.reconciled");
            return Ok(0);
        }

        let batch = statements
            .iter()
            .map(|statement| format!("{};", statement))
            .collect::<Vec<_>>()
            .join("\n");
        tracing::debug!(sql = %batch, "relquery.sync.batch");
        backend.execute_batch(&batch).await?;

        tracing::info!(statements = statements.len(), "relquery.sync.applied");
        Ok(statements.len())
    }

    /// DDL needed to bring `catalog` up to the declared schema: every table
    /// statement first, then the foreign-key constraints.
    pub fn plan(&self, catalog: &CatalogSnapshot) -> Result<Vec<String>> {
        let mut statements = Vec::new();
        let mut constraints = Vec::new();

        for entity in self.schema.entities() {
            let table = self.dictionary.table(&entity.name)?;
            let (columns, foreign_keys) = self.missing_columns(entity, table, catalog)?;

            if !catalog.has_table(table) {
                statements.push(format!(
                    "CREATE TABLE {} ({})",
                    quote_ident(table),
                    columns.join(", ")
                ));
            } else if !columns.is_empty() {
                let additions = columns
                    .iter()
                    .map(|column| format!("ADD COLUMN {}", column))
                    .collect::<Vec<_>>();
                statements.push(format!(
                    "ALTER TABLE {} {}",
                    quote_ident(table),
                    additions.join(", ")
                ));
            }

            if !foreign_keys.is_empty() {
                constraints.push(format!(
                    "ALTER TABLE {} {}",
                    quote_ident(table),
                    foreign_keys.join(", ")
                ));
            }
        }

        statements.extend(constraints);
        Ok(statements)
    }

    // Column clauses absent from the catalog, and the constraint clauses of
    // the foreign-key columns among them.
    fn missing_columns(
        &self,
        entity: &Entity,
        table: &str,
        catalog: &CatalogSnapshot,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut columns = Vec::new();
        let mut foreign_keys = Vec::new();

        for field in &entity.fields {
            let column = self.dictionary.column(&entity.name, &field.name)?;
            if !catalog.has_column(table, column) {
                columns.push(column_clause(column, &field.sql_type(), &field.constraints));
            }
        }

        for mto in &entity.many_to_one {
            let relation = self.dictionary.relation(&entity.name, &mto.name)?;
            if catalog.has_column(&relation.from_table, &relation.from_column) {
                continue;
            }

            // The relation's constraints stay off the column, so it can be
            // added to a populated table.
            let target = self.schema.field(&mto.target_entity, &mto.target_field)?;
            columns.push(column_clause(
                &relation.from_column,
                &target.sql_type(),
                &Constraints::default(),
            ));
            foreign_keys.push(format!(
                "ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE CASCADE",
                quote_ident(&format!(
                    "{}_{}_fkey",
                    relation.from_table, relation.from_column
                )),
                quote_ident(&relation.from_column),
                quote_ident(&relation.to_table),
                quote_ident(&relation.to_column)
            ));
        }

        Ok((columns, foreign_keys))
    }
}

fn column_clause(column: &str, sql_type: &str, constraints: &Constraints) -> String {
    let mut clause = format!("{} {}", quote_ident(column), sql_type);

    if constraints.primary {
        clause.push_str(" PRIMARY KEY");
    }
    if constraints.unique {
        clause.push_str(" UNIQUE");
    }
    if constraints.not_null {
        clause.push_str(" NOT NULL");
    }
    match &constraints.default_value {
        None | Some(Value::Null) => {}
        Some(Value::String(expression)) => {
            clause.push_str(" DEFAULT ");
            clause.push_str(expression);
        }
        Some(value) => {
            clause.push_str(" DEFAULT ");
            clause.push_str(&format_value(value));
        }
    }

    clause
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueryResult;
    use crate::schema::{Field, FieldType};
    use crate::testing::{library, single_row, MockBackend};
    use serde_json::json;

    fn reconciled_catalog() -> CatalogSnapshot {
        let mut catalog = CatalogSnapshot::new();
        catalog.add_table(
            "book",
            ["id", "title", "pages", "writer_id", "sequel_id"]
                .into_iter()
                .map(|c| CatalogColumn::new(c, "character varying"))
                .collect(),
        );
        catalog.add_table(
            "writer",
            ["id", "first_name", "last_name"]
                .into_iter()
                .map(|c| CatalogColumn::new(c, "character varying"))
                .collect(),
        );
        catalog.add_table(
            "character",
            ["id", "nick_name", "book_id"]
                .into_iter()
                .map(|c| CatalogColumn::new(c, "character varying"))
                .collect(),
        );
        catalog
    }

    #[test]
    fn test_plan_empty_database() {
        let (schema, dictionary) = library();
        let statements = SchemaSynchronizer::new(&schema, &dictionary)
            .plan(&CatalogSnapshot::new())
            .unwrap();

        assert_eq!(
            statements,
            vec![
                "CREATE TABLE \"book\" (\"id\" varchar PRIMARY KEY, \"title\" varchar, \"pages\" integer DEFAULT 69, \"writer_id\" varchar, \"sequel_id\" varchar)",
                "CREATE TABLE \"writer\" (\"id\" varchar PRIMARY KEY, \"first_name\" varchar, \"last_name\" varchar)",
                "CREATE TABLE \"character\" (\"id\" varchar PRIMARY KEY, \"nick_name\" varchar, \"book_id\" varchar)",
                "ALTER TABLE \"book\" ADD CONSTRAINT \"book_writer_id_fkey\" FOREIGN KEY (\"writer_id\") REFERENCES \"writer\" (\"id\") ON DELETE CASCADE, ADD CONSTRAINT \"book_sequel_id_fkey\" FOREIGN KEY (\"sequel_id\") REFERENCES \"book\" (\"id\") ON DELETE CASCADE",
                "ALTER TABLE \"character\" ADD CONSTRAINT \"character_book_id_fkey\" FOREIGN KEY (\"book_id\") REFERENCES \"book\" (\"id\") ON DELETE CASCADE",
            ]
        );
    }

    #[test]
    fn test_plan_adds_missing_columns_only() {
        let (schema, dictionary) = library();
        let mut catalog = reconciled_catalog();
        catalog.tables.remove("character");
        catalog.add_table(
            "character",
            vec![CatalogColumn::new("id", "character varying")],
        );

        let statements = SchemaSynchronizer::new(&schema, &dictionary)
            .plan(&catalog)
            .unwrap();

        assert_eq!(
            statements,
            vec![
                "ALTER TABLE \"character\" ADD COLUMN \"nick_name\" varchar, ADD COLUMN \"book_id\" varchar",
                "ALTER TABLE \"character\" ADD CONSTRAINT \"character_book_id_fkey\" FOREIGN KEY (\"book_id\") REFERENCES \"book\" (\"id\") ON DELETE CASCADE",
            ]
        );
    }

    #[test]
    fn test_foreign_key_column_is_bare() {
        let mut essay = Entity::new("Essay")
            .field(Field::new("id", FieldType::Integer).primary())
            .many_to_one("author", "Author", "id");
        essay.many_to_one[0].constraints = Constraints {
            unique: true,
            not_null: true,
            ..Constraints::default()
        };
        let schema = SchemaRegistry::new(vec![
            Entity::new("Author").field(Field::new("id", FieldType::Uuid).primary()),
            essay,
        ])
        .unwrap();
        let dictionary = NameDictionary::new(&schema).unwrap();

        let mut catalog = CatalogSnapshot::new();
        catalog.add_table("author", vec![CatalogColumn::new("id", "uuid")]);
        catalog.add_table("essay", vec![CatalogColumn::new("id", "integer")]);

        let statements = SchemaSynchronizer::new(&schema, &dictionary)
            .plan(&catalog)
            .unwrap();
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE \"essay\" ADD COLUMN \"author_id\" uuid",
                "ALTER TABLE \"essay\" ADD CONSTRAINT \"essay_author_id_fkey\" FOREIGN KEY (\"author_id\") REFERENCES \"author\" (\"id\") ON DELETE CASCADE",
            ]
        );
    }

    #[test]
    fn test_plan_reconciled_database() {
        let (schema, dictionary) = library();
        let statements = SchemaSynchronizer::new(&schema, &dictionary)
            .plan(&reconciled_catalog())
            .unwrap();
        assert!(statements.is_empty());
    }

    #[test]
    fn test_column_clause() {
        let field = Field::new("status", FieldType::String)
            .length(16)
            .unique()
            .not_null()
            .default_value("'draft'");
        assert_eq!(
            column_clause("status", &field.sql_type(), &field.constraints),
            "\"status\" varchar(16) UNIQUE NOT NULL DEFAULT 'draft'"
        );

        let flag = Field::new("active", FieldType::Boolean).default_value(true);
        assert_eq!(
            column_clause("active", &flag.sql_type(), &flag.constraints),
            "\"active\" boolean DEFAULT TRUE"
        );
    }

    #[test]
    fn test_catalog_from_rows() {
        let rows = vec![
            vec![
                ("table", json!("book")),
                (
                    "columns",
                    json!([
                        { "name": "id", "type": "character varying", "length": null, "nullable": false, "default": null },
                        { "name": "pages", "type": "integer", "length": null, "nullable": true, "default": "69" }
                    ]),
                ),
            ]
            .into_iter()
            .collect::<QueryRow>(),
            vec![("table", json!("empty")), ("columns", json!([]))]
                .into_iter()
                .collect::<QueryRow>(),
        ];

        let catalog = CatalogSnapshot::from_rows(&rows).unwrap();

        assert_eq!(catalog.table_count(), 2);
        assert!(catalog.has_table("empty"));
        assert!(catalog.has_column("book", "id"));
        assert!(!catalog.has_column("book", "title"));
        assert_eq!(
            catalog.column("book", "pages").unwrap().default.as_deref(),
            Some("69")
        );
        assert!(!catalog.column("book", "id").unwrap().nullable);
    }

    #[test]
    fn test_catalog_row_without_table() {
        let rows = vec![vec![("columns", json!([]))].into_iter().collect::<QueryRow>()];
        assert!(matches!(
            CatalogSnapshot::from_rows(&rows),
            Err(QueryError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_synchronize_executes_one_batch() {
        let (schema, dictionary) = library();
        let mut backend = MockBackend::with_results(vec![single_row(vec![
            ("table", json!("writer")),
            (
                "columns",
                json!([
                    { "name": "id", "type": "character varying" },
                    { "name": "first_name", "type": "character varying" },
                    { "name": "last_name", "type": "character varying" }
                ]),
            ),
        ])]);

        let applied = SchemaSynchronizer::new(&schema, &dictionary)
            .synchronize(&mut backend)
            .await
            .unwrap();

        assert_eq!(applied, 4);
        assert_eq!(backend.executed.len(), 1);
        assert_eq!(backend.executed[0].0, INTROSPECTION_SQL);
        assert_eq!(backend.batches.len(), 1);

        let batch = &backend.batches[0];
        assert!(batch.starts_with("CREATE TABLE \"book\""));
        assert!(!batch.contains("CREATE TABLE \"writer\""));
        assert!(batch.contains("CREATE TABLE \"character\""));
        assert!(batch.ends_with("ON DELETE CASCADE;"));
    }

    #[tokio::test]
    async fn test_synchronize_is_idempotent() {
        let (schema, dictionary) = library();
        let rows = vec![
            ("book", vec!["id", "title", "pages", "writer_id", "sequel_id"]),
            ("writer", vec!["id", "first_name", "last_name"]),
            ("character", vec!["id", "nick_name", "book_id"]),
        ]
        .into_iter()
        .map(|(table, columns)| {
            let columns = columns
                .into_iter()
                .map(|name| json!({ "name": name, "type": "character varying" }))
                .collect::<Vec<_>>();
            vec![("table", json!(table)), ("columns", Value::Array(columns))]
                .into_iter()
                .collect::<QueryRow>()
        })
        .collect();
        let mut backend = MockBackend::with_results(vec![QueryResult::new(rows)]);

        let applied = SchemaSynchronizer::new(&schema, &dictionary)
            .synchronize(&mut backend)
            .await
            .unwrap();

        assert_eq!(applied, 0);
        assert!(backend.batches.is_empty());
    }
}
