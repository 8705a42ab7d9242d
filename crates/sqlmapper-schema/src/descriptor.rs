//! Entity, column and relationship descriptors.
//!
//! Descriptors are plain data. They are assembled with small builder methods,
//! validated once by [`SchemaRegistry`](crate::SchemaRegistry) and only read
//! afterwards.

use serde::{Deserialize, Serialize};
use sqlmapper_core::{ConfigErrorKind, Error, Result, Value};
use std::fmt;
use std::str::FromStr;

/// Declared SQL type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    SmallInt,
    #[serde(alias = "int", alias = "int4")]
    Integer,
    #[serde(alias = "int8", alias = "bigserial", alias = "serial")]
    BigInt,
    #[serde(alias = "float", alias = "float4")]
    Real,
    #[serde(alias = "float8")]
    Double,
    #[serde(alias = "numeric")]
    Decimal,
    #[serde(alias = "string", alias = "varchar")]
    Text,
    #[serde(alias = "boolean")]
    Bool,
    #[serde(alias = "blob", alias = "bytea")]
    Bytes,
    Date,
    Time,
    #[serde(alias = "datetime")]
    Timestamp,
    Uuid,
    #[serde(alias = "jsonb")]
    Json,
}

impl ColumnType {
    /// SQL spelling of the type.
    pub const fn sql_name(self) -> &'static str {
        match self {
            ColumnType::SmallInt => "SMALLINT",
            ColumnType::Integer => "INTEGER",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Real => "REAL",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Decimal => "DECIMAL",
            ColumnType::Text => "TEXT",
            ColumnType::Bool => "BOOLEAN",
            ColumnType::Bytes => "BLOB",
            ColumnType::Date => "DATE",
            ColumnType::Time => "TIME",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Uuid => "UUID",
            ColumnType::Json => "JSON",
        }
    }

    /// Whether an integer counter can live in this column.
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            ColumnType::SmallInt | ColumnType::Integer | ColumnType::BigInt
        )
    }
}

/// One column of a mapped table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub nullable: bool,
}

impl ColumnDescriptor {
    /// A non-nullable, non-key column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            primary_key: false,
            nullable: false,
        }
    }

    /// Mark as (part of) the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Allow NULL.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Cardinality of a relationship, seen from the declaring entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipKind {
    /// One-to-one: `User` has one `Profile`.
    OneToOne,
    /// Many-to-one: many `Article`s belong to one `Author`.
    ManyToOne,
    /// One-to-many: one `Author` has many `Article`s.
    OneToMany,
    /// Many-to-many through a join table.
    ManyToMany,
}

/// Which table of a one-to-one relationship holds the foreign key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwningSide {
    /// The declaring entity's table.
    #[default]
    #[serde(rename = "self")]
    Owner,
    /// The target entity's table.
    #[serde(rename = "target")]
    Target,
}

/// Where the key that links two entities is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLocation {
    /// On the owner's row, referencing the target's primary key.
    Owner,
    /// On the target's row, referencing the owner's primary key.
    Target,
    /// In a separate join table.
    JoinTable,
}

/// How an association is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadStrategy {
    /// One statement per owner, on first access.
    #[default]
    Lazy,
    /// Joined into the owner's statement.
    Join,
    /// Second statement re-using the owner query as a sub-select.
    Subquery,
    /// Second statement with an IN list of owner keys.
    BatchedIn,
    /// Loading on access is an error.
    Forbidden,
}

impl LoadStrategy {
    /// Strategies that resolve the association while the owners are loaded.
    pub const fn is_eager(self) -> bool {
        matches!(
            self,
            LoadStrategy::Join | LoadStrategy::Subquery | LoadStrategy::BatchedIn
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LoadStrategy::Lazy => "lazy",
            LoadStrategy::Join => "join",
            LoadStrategy::Subquery => "subquery",
            LoadStrategy::BatchedIn => "batched-in",
            LoadStrategy::Forbidden => "forbidden",
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "lazy" | "select" => Ok(LoadStrategy::Lazy),
            "join" | "joined" => Ok(LoadStrategy::Join),
            "subquery" => Ok(LoadStrategy::Subquery),
            "batched-in" | "batched" | "selectin" => Ok(LoadStrategy::BatchedIn),
            "forbidden" | "raise" => Ok(LoadStrategy::Forbidden),
            other => Err(Error::config(
                ConfigErrorKind::Invalid,
                format!("unknown load strategy '{other}'"),
            )),
        }
    }
}

/// Join table of a many-to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    /// Column referencing the declaring entity's primary key.
    pub owner_column: String,
    /// Column referencing the target entity's primary key.
    pub target_column: String,
}

/// A named association from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub kind: RelationshipKind,
    /// Target entity's table.
    pub target: String,
    /// Foreign-key column. For many-to-many this is the join table's owner
    /// column.
    pub foreign_key: String,
    pub join_table: Option<JoinTable>,
    pub owning_side: OwningSide,
    pub default_strategy: LoadStrategy,
}

impl RelationshipDescriptor {
    fn new(
        name: impl Into<String>,
        kind: RelationshipKind,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            foreign_key: foreign_key.into(),
            join_table: None,
            owning_side: OwningSide::Owner,
            default_strategy: LoadStrategy::Lazy,
        }
    }

    /// `foreign_key` lives on the declaring table.
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, RelationshipKind::ManyToOne, target, foreign_key)
    }

    /// `foreign_key` lives on the target table.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        let mut rel = Self::new(name, RelationshipKind::OneToMany, target, foreign_key);
        rel.owning_side = OwningSide::Target;
        rel
    }

    /// `foreign_key` lives on the declaring table unless
    /// [`owned_by_target`](Self::owned_by_target) is called.
    pub fn one_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, RelationshipKind::OneToOne, target, foreign_key)
    }

    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        join_table: impl Into<String>,
        owner_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        let owner_column = owner_column.into();
        let mut rel = Self::new(
            name,
            RelationshipKind::ManyToMany,
            target,
            owner_column.clone(),
        );
        rel.join_table = Some(JoinTable {
            table: join_table.into(),
            owner_column,
            target_column: target_column.into(),
        });
        rel
    }

    /// Foreign key of a one-to-one lives on the target table.
    pub fn owned_by_target(mut self) -> Self {
        self.owning_side = OwningSide::Target;
        self
    }

    pub fn strategy(mut self, strategy: LoadStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn key_location(&self) -> KeyLocation {
        match self.kind {
            RelationshipKind::ManyToOne => KeyLocation::Owner,
            RelationshipKind::OneToMany => KeyLocation::Target,
            RelationshipKind::OneToOne => match self.owning_side {
                OwningSide::Owner => KeyLocation::Owner,
                OwningSide::Target => KeyLocation::Target,
            },
            RelationshipKind::ManyToMany => KeyLocation::JoinTable,
        }
    }

    /// Whether the association resolves to a collection rather than at most
    /// one target.
    pub fn is_collection(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany
        )
    }
}

/// Table mapping for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    table: String,
    columns: Vec<ColumnDescriptor>,
    relationships: Vec<RelationshipDescriptor>,
    version_column: Option<String>,
}

impl EntityDescriptor {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            relationships: Vec::new(),
            version_column: None,
        }
    }

    pub fn column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Enable optimistic concurrency on an integer column.
    pub fn version_column(mut self, name: impl Into<String>) -> Self {
        self.version_column = Some(name.into());
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn relationships(&self) -> &[RelationshipDescriptor] {
        &self.relationships
    }

    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Like [`find_relationship`](Self::find_relationship), but unknown names
    /// are a configuration error.
    #[allow(clippy::result_large_err)]
    pub fn require_relationship(&self, name: &str) -> Result<&RelationshipDescriptor> {
        self.find_relationship(name).ok_or_else(|| {
            Error::config(
                ConfigErrorKind::InvalidRelationship,
                format!("'{}' has no relationship named '{}'", self.table, name),
            )
        })
    }

    pub fn version(&self) -> Option<&str> {
        self.version_column.as_deref()
    }

    /// Primary key column names, in declaration order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// The single primary key column, if the key is not composite.
    pub fn single_primary_key(&self) -> Option<&str> {
        let mut pk = self.columns.iter().filter(|c| c.primary_key);
        match (pk.next(), pk.next()) {
            (Some(col), None) => Some(col.name.as_str()),
            _ => None,
        }
    }

    /// Arrange mapped `(column, value)` pairs in declaration order.
    ///
    /// Every declared column must be present exactly once and no undeclared
    /// column may appear.
    #[allow(clippy::result_large_err)]
    pub fn project(&self, pairs: Vec<(&str, Value)>) -> Result<Vec<Value>> {
        let mut slots: Vec<Option<Value>> = vec![None; self.columns.len()];
        for (name, value) in pairs {
            let index = self.column_index(name).ok_or_else(|| {
                Error::config(
                    ConfigErrorKind::UnknownColumn,
                    format!("'{}' maps column '{}' that is not registered", self.table, name),
                )
            })?;
            if slots[index].replace(value).is_some() {
                return Err(Error::config(
                    ConfigErrorKind::DuplicateName,
                    format!("'{}' maps column '{}' twice", self.table, name),
                ));
            }
        }
        slots
            .into_iter()
            .zip(&self.columns)
            .map(|(slot, column)| {
                slot.ok_or_else(|| {
                    Error::config(
                        ConfigErrorKind::UnknownColumn,
                        format!(
                            "'{}' mapping does not provide column '{}'",
                            self.table, column.name
                        ),
                    )
                })
            })
            .collect()
    }

    /// Primary key values out of a projected row.
    pub fn key_values(&self, projected: &[Value]) -> Vec<Value> {
        self.columns
            .iter()
            .zip(projected)
            .filter(|(c, _)| c.primary_key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Value of one column out of a projected row.
    pub fn value_of<'v>(&self, projected: &'v [Value], column: &str) -> Option<&'v Value> {
        self.column_index(column).and_then(|i| projected.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn articles() -> EntityDescriptor {
        EntityDescriptor::new("articles")
            .column(ColumnDescriptor::new("id", ColumnType::BigInt).primary_key())
            .column(ColumnDescriptor::new("title", ColumnType::Text))
            .column(ColumnDescriptor::new("author_id", ColumnType::BigInt).nullable())
            .relationship(RelationshipDescriptor::many_to_one("author", "authors", "author_id"))
    }

    #[test]
    fn project_orders_by_declaration() {
        let desc = articles();
        let projected = desc
            .project(vec![
                ("author_id", Value::BigInt(1)),
                ("id", Value::BigInt(10)),
                ("title", Value::Text("T".into())),
            ])
            .unwrap();
        assert_eq!(
            projected,
            vec![Value::BigInt(10), Value::Text("T".into()), Value::BigInt(1)]
        );
        assert_eq!(desc.key_values(&projected), vec![Value::BigInt(10)]);
        assert_eq!(desc.value_of(&projected, "author_id"), Some(&Value::BigInt(1)));
    }

    #[test]
    fn project_rejects_unknown_and_missing_columns() {
        let desc = articles();
        let err = desc
            .project(vec![("id", Value::BigInt(1)), ("body", Value::Null)])
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref c) if c.kind == ConfigErrorKind::UnknownColumn));

        let err = desc.project(vec![("id", Value::BigInt(1))]).unwrap_err();
        assert!(err.to_string().contains("does not provide column 'title'"));
    }

    #[test]
    fn key_location_follows_kind_and_side() {
        let m2o = RelationshipDescriptor::many_to_one("author", "authors", "author_id");
        assert_eq!(m2o.key_location(), KeyLocation::Owner);

        let o2m = RelationshipDescriptor::one_to_many("articles", "articles", "author_id");
        assert_eq!(o2m.key_location(), KeyLocation::Target);
        assert!(o2m.is_collection());

        let o2o = RelationshipDescriptor::one_to_one("profile", "profiles", "user_id")
            .owned_by_target();
        assert_eq!(o2o.key_location(), KeyLocation::Target);
        assert!(!o2o.is_collection());

        let m2m =
            RelationshipDescriptor::many_to_many("tags", "tags", "article_tags", "article_id", "tag_id");
        assert_eq!(m2m.key_location(), KeyLocation::JoinTable);
        assert_eq!(m2m.foreign_key, "article_id");
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!("batched-in".parse::<LoadStrategy>().unwrap(), LoadStrategy::BatchedIn);
        assert_eq!("BATCHED_IN".parse::<LoadStrategy>().unwrap(), LoadStrategy::BatchedIn);
        assert_eq!("joined".parse::<LoadStrategy>().unwrap(), LoadStrategy::Join);
        assert!("eventually".parse::<LoadStrategy>().is_err());
        assert!(LoadStrategy::Subquery.is_eager());
        assert!(!LoadStrategy::Forbidden.is_eager());
        assert_eq!(LoadStrategy::BatchedIn.to_string(), "batched-in");
    }

    #[test]
    fn single_primary_key_rejects_composite() {
        let desc = EntityDescriptor::new("article_tags")
            .column(ColumnDescriptor::new("article_id", ColumnType::BigInt).primary_key())
            .column(ColumnDescriptor::new("tag_id", ColumnType::BigInt).primary_key());
        assert_eq!(desc.primary_key(), vec!["article_id", "tag_id"]);
        assert_eq!(desc.single_primary_key(), None);
        assert_eq!(articles().single_primary_key(), Some("id"));
    }
}
