use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Scalar field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Text,
    SmallInt,
    #[serde(alias = "int")]
    Integer,
    BigInt,
    Float,
    Double,
    Decimal,
    Boolean,
    Date,
    Time,
    #[serde(alias = "timestamp")]
    DateTime,
    #[serde(alias = "timestamptz")]
    DateTimeTz,
    Uuid,
    Json,
    Jsonb,
    Binary,
    #[serde(rename = "stringArray")]
    StringArray,
    #[serde(rename = "integerArray")]
    IntegerArray,
}

impl FieldType {
    /// PostgreSQL base type, without options or array suffix.
    pub fn to_sql(&self) -> &'static str {
        match self {
            FieldType::String | FieldType::StringArray => "varchar",
            FieldType::Text => "text",
            FieldType::SmallInt => "smallint",
            FieldType::Integer | FieldType::IntegerArray => "integer",
            FieldType::BigInt => "bigint",
            FieldType::Float => "real",
            FieldType::Double => "double precision",
            FieldType::Decimal => "numeric",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Time => "time",
            FieldType::DateTime => "timestamp",
            FieldType::DateTimeTz => "timestamptz",
            FieldType::Uuid => "uuid",
            FieldType::Json => "json",
            FieldType::Jsonb => "jsonb",
            FieldType::Binary => "bytea",
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldType::StringArray | FieldType::IntegerArray)
    }
}

/// Length, numeric precision/scale or datetime precision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeOptions {
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Constraints {
    pub primary: bool,
    pub unique: bool,
    pub not_null: bool,
    /// Emitted verbatim after `DEFAULT`. Strings are SQL expressions
    /// (`'draft'`, `now()`), other values are rendered as literals.
    pub default_value: Option<Value>,
}

/// Scalar attribute of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub type_options: TypeOptions,
    #[serde(default)]
    pub constraints: Constraints,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            type_options: TypeOptions::default(),
            constraints: Constraints::default(),
        }
    }

    pub fn primary(mut self) -> Self {
        self.constraints.primary = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.constraints.unique = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.constraints.not_null = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.constraints.default_value = Some(value.into());
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.type_options.length = Some(length);
        self
    }

    pub fn precision(mut self, precision: u32) -> Self {
        self.type_options.precision = Some(precision);
        self
    }

    pub fn scale(mut self, scale: u32) -> Self {
        self.type_options.scale = Some(scale);
        self
    }

    /// Full column type: base type, options and array suffix, e.g. `varchar(64)[]`.
    pub fn sql_type(&self) -> String {
        let TypeOptions {
            length,
            precision,
            scale,
        } = &self.type_options;

        let options = match self.field_type {
            FieldType::String | FieldType::StringArray => length.map(|l| l.to_string()),
            FieldType::Decimal => match (precision, scale) {
                (Some(p), Some(s)) => Some(format!("{}, {}", p, s)),
                (Some(p), None) => Some(p.to_string()),
                _ => None,
            },
            FieldType::Time | FieldType::DateTime | FieldType::DateTimeTz => {
                precision.map(|p| p.to_string())
            }
            _ => None,
        };

        let mut sql = self.field_type.to_sql().to_string();
        if let Some(options) = options {
            sql.push_str(&format!("({})", options));
        }
        if self.field_type.is_array() {
            sql.push_str("[]");
        }
        sql
    }

    fn is_key(&self) -> bool {
        self.constraints.primary || self.constraints.unique
    }
}

/// Reference to a primary or unique field of another entity, backed by a
/// foreign-key column on the owning table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManyToOne {
    pub name: String,
    pub target_entity: String,
    pub target_field: String,
    #[serde(default)]
    pub constraints: Constraints,
}

/// Virtual inverse of a [`ManyToOne`] declared on the target entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneToMany {
    pub name: String,
    pub target_entity: String,
    pub target_many_to_one: String,
}

/// Logical record type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub many_to_one: Vec<ManyToOne>,
    #[serde(default)]
    pub one_to_many: Vec<OneToMany>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            many_to_one: Vec::new(),
            one_to_many: Vec::new(),
        }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn many_to_one(
        mut self,
        name: impl Into<String>,
        target_entity: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        self.many_to_one.push(ManyToOne {
            name: name.into(),
            target_entity: target_entity.into(),
            target_field: target_field.into(),
            constraints: Constraints::default(),
        });
        self
    }

    pub fn one_to_many(
        mut self,
        name: impl Into<String>,
        target_entity: impl Into<String>,
        target_many_to_one: impl Into<String>,
    ) -> Self {
        self.one_to_many.push(OneToMany {
            name: name.into(),
            target_entity: target_entity.into(),
            target_many_to_one: target_many_to_one.into(),
        });
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn find_many_to_one(&self, name: &str) -> Option<&ManyToOne> {
        self.many_to_one.iter().find(|m| m.name == name)
    }

    pub fn find_one_to_many(&self, name: &str) -> Option<&OneToMany> {
        self.one_to_many.iter().find(|o| o.name == name)
    }

    pub fn primary_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.constraints.primary)
    }
}

/// What a name refers to on an entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Member<'a> {
    Field(&'a Field),
    ManyToOne(&'a ManyToOne),
    OneToMany(&'a OneToMany),
    NotFound,
}

/// Validated, immutable index of declared entities
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
}

impl SchemaRegistry {
    /// Validate and index the declared entities. Fails on the first violation,
    /// nothing is kept from a failed build.
    pub fn new(entities: Vec<Entity>) -> Result<Self> {
        let mut index = HashMap::with_capacity(entities.len());
        for (position, entity) in entities.iter().enumerate() {
            if entity.name.is_empty() {
                return Err(QueryError::SchemaDefinition(
                    "Invalid entity, missing name".to_string(),
                ));
            }
            if index.insert(entity.name.clone(), position).is_some() {
                return Err(QueryError::SchemaDefinition(format!(
                    "Entity {} declared more than once",
                    entity.name
                )));
            }
        }

        let registry = Self { entities, index };
        for entity in &registry.entities {
            registry.validate_entity(entity)?;
        }

        Ok(registry)
    }

    /// Parse entity definitions from their JSON form and validate them.
    pub fn from_json(json: &str) -> Result<Self> {
        let entities: Vec<Entity> = serde_json::from_str(json)?;
        Self::new(entities)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn find_entity(&self, name: &str) -> Option<&Entity> {
        self.index.get(name).map(|&i| &self.entities[i])
    }

    pub fn entity(&self, name: &str) -> Result<&Entity> {
        self.find_entity(name).ok_or_else(|| {
            QueryError::NameResolution(format!("Entity {} not found in schema", name))
        })
    }

    pub fn find_field(&self, entity: &str, name: &str) -> Option<&Field> {
        self.find_entity(entity).and_then(|e| e.find_field(name))
    }

    pub fn field(&self, entity: &str, name: &str) -> Result<&Field> {
        self.entity(entity)?.find_field(name).ok_or_else(|| {
            QueryError::NameResolution(format!(
                "Field {} of entity {} not found in schema",
                name, entity
            ))
        })
    }

    pub fn find_many_to_one(&self, entity: &str, name: &str) -> Option<&ManyToOne> {
        self.find_entity(entity).and_then(|e| e.find_many_to_one(name))
    }

    pub fn many_to_one(&self, entity: &str, name: &str) -> Result<&ManyToOne> {
        self.entity(entity)?.find_many_to_one(name).ok_or_else(|| {
            QueryError::NameResolution(format!(
                "Many-to-one {} of entity {} not found in schema",
                name, entity
            ))
        })
    }

    pub fn find_one_to_many(&self, entity: &str, name: &str) -> Option<&OneToMany> {
        self.find_entity(entity).and_then(|e| e.find_one_to_many(name))
    }

    pub fn one_to_many(&self, entity: &str, name: &str) -> Result<&OneToMany> {
        self.entity(entity)?.find_one_to_many(name).ok_or_else(|| {
            QueryError::NameResolution(format!(
                "One-to-many {} of entity {} not found in schema",
                name, entity
            ))
        })
    }

    /// Single lookup deciding whether `name` is a field, a many-to-one or a
    /// one-to-many of `entity`. Only an unknown entity is an error.
    pub fn resolve(&self, entity: &str, name: &str) -> Result<Member<'_>> {
        let entity = self.entity(entity)?;
        if let Some(field) = entity.find_field(name) {
            return Ok(Member::Field(field));
        }
        if let Some(mto) = entity.find_many_to_one(name) {
            return Ok(Member::ManyToOne(mto));
        }
        if let Some(otm) = entity.find_one_to_many(name) {
            return Ok(Member::OneToMany(otm));
        }
        Ok(Member::NotFound)
    }

    fn validate_entity(&self, entity: &Entity) -> Result<()> {
        let mut names = HashSet::new();

        for field in &entity.fields {
            if field.name.is_empty() {
                return Err(definition(format!(
                    "No name provided for field in {}",
                    entity.name
                )));
            }
            claim_name(&mut names, &entity.name, &field.name)?;
        }
        self.validate_primary(entity)?;

        for mto in &entity.many_to_one {
            if mto.name.is_empty() {
                return Err(definition(format!(
                    "No name provided for many-to-one in {}",
                    entity.name
                )));
            }
            claim_name(&mut names, &entity.name, &mto.name)?;
            self.validate_many_to_one(mto, &entity.name)?;
        }

        for otm in &entity.one_to_many {
            if otm.name.is_empty() {
                return Err(definition(format!(
                    "No name provided for one-to-many in {}",
                    entity.name
                )));
            }
            claim_name(&mut names, &entity.name, &otm.name)?;
            self.validate_one_to_many(otm, &entity.name)?;
        }

        Ok(())
    }

    fn validate_primary(&self, entity: &Entity) -> Result<()> {
        if entity.fields.is_empty() {
            return Ok(());
        }
        match entity.fields.iter().filter(|f| f.constraints.primary).count() {
            0 => Err(definition(format!(
                "Entity {} does not have a primary field",
                entity.name
            ))),
            1 => Ok(()),
            _ => Err(definition(format!(
                "Entity {} has multiple primary fields",
                entity.name
            ))),
        }
    }

    fn validate_many_to_one(&self, mto: &ManyToOne, entity_name: &str) -> Result<()> {
        let ManyToOne {
            name,
            target_entity,
            target_field,
            ..
        } = mto;

        if target_entity.is_empty() {
            return Err(definition(format!(
                "Property targetEntity not provided for many-to-one {} in entity {}",
                name, entity_name
            )));
        }
        if target_field.is_empty() {
            return Err(definition(format!(
                "Property targetField not provided for many-to-one {} in entity {}",
                name, entity_name
            )));
        }

        let target = self.find_entity(target_entity).ok_or_else(|| {
            definition(format!(
                "Many-to-one {}.{}: target entity {} not found in schema",
                entity_name, name, target_entity
            ))
        })?;
        let field = target.find_field(target_field).ok_or_else(|| {
            definition(format!(
                "Many-to-one {}.{}: field {} in entity {} not found in schema",
                entity_name, name, target_field, target_entity
            ))
        })?;
        if !field.is_key() {
            return Err(definition(format!(
                "Many-to-one {}.{}: field {} in entity {} must be primary or unique",
                entity_name, name, target_field, target_entity
            )));
        }

        Ok(())
    }

    fn validate_one_to_many(&self, otm: &OneToMany, entity_name: &str) -> Result<()> {
        let OneToMany {
            name,
            target_entity,
            target_many_to_one,
        } = otm;

        if target_entity.is_empty() {
            return Err(definition(format!(
                "Property targetEntity not provided for one-to-many {} in entity {}",
                name, entity_name
            )));
        }
        if target_many_to_one.is_empty() {
            return Err(definition(format!(
                "Property targetManyToOne not provided for one-to-many {} in entity {}",
                name, entity_name
            )));
        }

        let target = self.find_entity(target_entity).ok_or_else(|| {
            definition(format!(
                "One-to-many {}.{}: target entity {} not found in schema",
                entity_name, name, target_entity
            ))
        })?;
        let inverse = target.find_many_to_one(target_many_to_one).ok_or_else(|| {
            definition(format!(
                "One-to-many {}.{}: many-to-one {} in entity {} not found in schema",
                entity_name, name, target_many_to_one, target_entity
            ))
        })?;
        if inverse.target_entity != entity_name {
            return Err(definition(format!(
                "One-to-many {}.{}: many-to-one {}.{} points to {}, not {}",
                entity_name, name, target_entity, target_many_to_one, inverse.target_entity,
                entity_name
            )));
        }

        Ok(())
    }
}

fn definition(message: String) -> QueryError {
    QueryError::SchemaDefinition(message)
}

// Fields, many-to-one and one-to-many share one namespace per entity.
fn claim_name(names: &mut HashSet<String>, entity: &str, name: &str) -> Result<()> {
    if names.insert(name.to_string()) {
        Ok(())
    } else {
        Err(definition(format!(
            "Entity {} declares {} more than once",
            entity, name
        )))
    }
}
