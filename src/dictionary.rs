use crate::error::{QueryError, Result};
use crate::schema::{ManyToOne, OneToMany, SchemaRegistry};
use heck::ToSnakeCase;
use std::collections::HashMap;

/// Physical join pair backing a relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

impl Relation {
    /// The same join seen from the other side.
    pub fn reversed(&self) -> Relation {
        Relation {
            from_table: self.to_table.clone(),
            from_column: self.to_column.clone(),
            to_table: self.from_table.clone(),
            to_column: self.from_column.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct EntityNames {
    table: String,
    columns: HashMap<String, String>,
    relations: HashMap<String, Relation>,
}

/// Logical entity/field names to physical table/column names.
///
/// Names default to the snake case of the logical name. `overrides` replaces
/// them per key: `"Entity"` for a table, `"Entity.field"` for a column and
/// `"Entity.relation"` for a many-to-one foreign-key column.
#[derive(Debug, Clone)]
pub struct NameDictionary {
    entities: HashMap<String, EntityNames>,
}

impl NameDictionary {
    pub fn new(schema: &SchemaRegistry) -> Result<Self> {
        Self::with_overrides(schema, &HashMap::new())
    }

    pub fn with_overrides(
        schema: &SchemaRegistry,
        overrides: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut dictionary = Self {
            entities: HashMap::new(),
        };

        // One-to-many relations are reverses of many-to-one relations, which
        // in turn need every target column: the three passes must stay in order.
        for entity in schema.entities() {
            dictionary.add_entity(&entity.name, overrides.get(&entity.name));
            for field in &entity.fields {
                let key = format!("{}.{}", entity.name, field.name);
                dictionary.add_field(&entity.name, &field.name, overrides.get(&key))?;
            }
        }

        for entity in schema.entities() {
            for mto in &entity.many_to_one {
                let key = format!("{}.{}", entity.name, mto.name);
                dictionary.add_many_to_one(&entity.name, mto, overrides.get(&key))?;
            }
        }

        for entity in schema.entities() {
            for otm in &entity.one_to_many {
                dictionary.add_one_to_many(&entity.name, otm)?;
            }
        }

        Ok(dictionary)
    }

    pub fn table(&self, entity: &str) -> Result<&str> {
        self.names(entity).map(|names| names.table.as_str())
    }

    pub fn column(&self, entity: &str, field: &str) -> Result<&str> {
        self.names(entity)?
            .columns
            .get(field)
            .map(String::as_str)
            .ok_or_else(|| {
                QueryError::Dictionary(format!(
                    "Field {}.{} has no corresponding column in the dictionary",
                    entity, field
                ))
            })
    }

    pub fn relation(&self, entity: &str, relation: &str) -> Result<&Relation> {
        self.names(entity)?.relations.get(relation).ok_or_else(|| {
            QueryError::Dictionary(format!(
                "Relation {}.{} has no corresponding relation in the dictionary",
                entity, relation
            ))
        })
    }

    fn names(&self, entity: &str) -> Result<&EntityNames> {
        self.entities.get(entity).ok_or_else(|| {
            QueryError::Dictionary(format!(
                "Entity {} has no corresponding table in the dictionary",
                entity
            ))
        })
    }

    fn names_mut(&mut self, entity: &str) -> Result<&mut EntityNames> {
        self.entities.get_mut(entity).ok_or_else(|| {
            QueryError::Dictionary(format!(
                "Entity {} has no corresponding table in the dictionary",
                entity
            ))
        })
    }

    fn add_entity(&mut self, entity: &str, custom: Option<&String>) {
        let table = custom.cloned().unwrap_or_else(|| entity.to_snake_case());
        self.entities.insert(
            entity.to_string(),
            EntityNames {
                table,
                columns: HashMap::new(),
                relations: HashMap::new(),
            },
        );
    }

    fn add_field(&mut self, entity: &str, field: &str, custom: Option<&String>) -> Result<()> {
        let column = custom.cloned().unwrap_or_else(|| field.to_snake_case());
        self.names_mut(entity)?
            .columns
            .insert(field.to_string(), column);
        Ok(())
    }

    fn add_many_to_one(
        &mut self,
        entity: &str,
        mto: &ManyToOne,
        custom: Option<&String>,
    ) -> Result<()> {
        let to_column = self.column(&mto.target_entity, &mto.target_field)?.to_string();
        let from_column = match custom {
            Some(custom) => custom.clone(),
            None => format!("{}_{}", mto.name.to_snake_case(), to_column),
        };

        let relation = Relation {
            from_table: self.table(entity)?.to_string(),
            from_column,
            to_table: self.table(&mto.target_entity)?.to_string(),
            to_column,
        };
        self.names_mut(entity)?
            .relations
            .insert(mto.name.clone(), relation);
        Ok(())
    }

    fn add_one_to_many(&mut self, entity: &str, otm: &OneToMany) -> Result<()> {
        let relation = self
            .relation(&otm.target_entity, &otm.target_many_to_one)?
            .reversed();
        self.names_mut(entity)?
            .relations
            .insert(otm.name.clone(), relation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{library, library_entities};

    #[test]
    fn test_default_names() {
        let (_, dictionary) = library();

        assert_eq!(dictionary.table("Book").unwrap(), "book");
        assert_eq!(dictionary.column("Writer", "firstName").unwrap(), "first_name");
        assert_eq!(dictionary.column("Character", "nickName").unwrap(), "nick_name");
    }

    #[test]
    fn test_many_to_one_relation() {
        let (_, dictionary) = library();

        assert_eq!(
            dictionary.relation("Book", "writer").unwrap(),
            &Relation {
                from_table: "book".to_string(),
                from_column: "writer_id".to_string(),
                to_table: "writer".to_string(),
                to_column: "id".to_string(),
            }
        );
        assert_eq!(
            dictionary.relation("Book", "sequel").unwrap().from_column,
            "sequel_id"
        );
    }

    #[test]
    fn test_one_to_many_is_reverse_of_inverse() {
        let (schema, dictionary) = library();

        for entity in schema.entities() {
            for otm in &entity.one_to_many {
                let forward = dictionary.relation(&entity.name, &otm.name).unwrap();
                let inverse = dictionary
                    .relation(&otm.target_entity, &otm.target_many_to_one)
                    .unwrap();
                assert_eq!(forward, &inverse.reversed());
            }
        }
    }

    #[test]
    fn test_overrides() {
        let schema = SchemaRegistry::new(library_entities()).unwrap();
        let overrides = HashMap::from([
            ("Writer".to_string(), "authors".to_string()),
            ("Writer.id".to_string(), "author_uid".to_string()),
            ("Book.writer".to_string(), "author_fk".to_string()),
        ]);
        let dictionary = NameDictionary::with_overrides(&schema, &overrides).unwrap();

        assert_eq!(dictionary.table("Writer").unwrap(), "authors");
        let relation = dictionary.relation("Book", "writer").unwrap();
        assert_eq!(relation.from_column, "author_fk");
        assert_eq!(relation.to_table, "authors");
        assert_eq!(relation.to_column, "author_uid");

        let books = dictionary.relation("Writer", "books").unwrap();
        assert_eq!(books.from_table, "authors");
        assert_eq!(books.to_column, "author_fk");
    }

    #[test]
    fn test_default_foreign_key_uses_target_column() {
        let schema = SchemaRegistry::new(library_entities()).unwrap();
        let overrides = HashMap::from([("Book.id".to_string(), "isbn".to_string())]);
        let dictionary = NameDictionary::with_overrides(&schema, &overrides).unwrap();

        assert_eq!(
            dictionary.relation("Character", "book").unwrap().from_column,
            "book_isbn"
        );
    }

    #[test]
    fn test_columns_are_unique_per_entity() {
        let (schema, dictionary) = library();

        for entity in schema.entities() {
            let mut seen = std::collections::HashSet::new();
            for field in &entity.fields {
                let column = dictionary.column(&entity.name, &field.name).unwrap();
                assert!(!column.is_empty());
                assert!(seen.insert(column.to_string()));
            }
        }
    }

    #[test]
    fn test_missing_entries() {
        let (_, dictionary) = library();

        assert!(matches!(
            dictionary.table("Publisher"),
            Err(QueryError::Dictionary(_))
        ));
        assert!(matches!(
            dictionary.column("Book", "isbn"),
            Err(QueryError::Dictionary(_))
        ));
        assert!(matches!(
            dictionary.relation("Book", "title"),
            Err(QueryError::Dictionary(_))
        ));
    }
}
