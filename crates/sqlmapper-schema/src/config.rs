//! JSON schema documents.
//!
//! A document is either a bare list of entities or an object with an
//! `entities` list:
//!
//! ```json
//! {
//!   "entities": [
//!     {
//!       "table": "authors",
//!       "columns": [
//!         { "name": "id", "type": "bigint", "primaryKey": true },
//!         { "name": "name", "type": "text" }
//!       ],
//!       "relationships": [
//!         { "name": "articles", "kind": "one-to-many", "targetTable": "articles",
//!           "foreignKey": "author_id", "defaultStrategy": "batched-in" }
//!       ]
//!     }
//!   ]
//! }
//! ```

use crate::descriptor::{
    ColumnDescriptor, ColumnType, EntityDescriptor, LoadStrategy, OwningSide,
    RelationshipDescriptor, RelationshipKind,
};
use serde::Deserialize;
use sqlmapper_core::{ConfigErrorKind, Error, Result};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum SchemaDocument {
    List(Vec<EntityConfig>),
    Wrapped { entities: Vec<EntityConfig> },
}

impl SchemaDocument {
    pub(crate) fn into_entities(self) -> Vec<EntityConfig> {
        match self {
            SchemaDocument::List(entities) | SchemaDocument::Wrapped { entities } => entities,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct EntityConfig {
    table: String,
    columns: Vec<ColumnConfig>,
    #[serde(default)]
    relationships: Vec<RelationshipConfig>,
    #[serde(default)]
    version_column: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ColumnConfig {
    name: String,
    #[serde(rename = "type")]
    column_type: ColumnType,
    #[serde(default)]
    primary_key: bool,
    #[serde(default)]
    nullable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RelationshipConfig {
    name: String,
    kind: RelationshipKind,
    target_table: String,
    foreign_key: String,
    #[serde(default)]
    join_table: Option<String>,
    /// Join-table column referencing the target (many-to-many only).
    #[serde(default)]
    target_key: Option<String>,
    #[serde(default)]
    owning_side: Option<OwningSide>,
    #[serde(default)]
    default_strategy: LoadStrategy,
}

impl TryFrom<EntityConfig> for EntityDescriptor {
    type Error = Error;

    fn try_from(config: EntityConfig) -> Result<Self> {
        let mut desc = EntityDescriptor::new(config.table);
        for col in config.columns {
            let mut column = ColumnDescriptor::new(col.name, col.column_type);
            column.primary_key = col.primary_key;
            column.nullable = col.nullable;
            desc = desc.column(column);
        }
        for rel in config.relationships {
            let relationship = rel.into_descriptor(desc.table())?;
            desc = desc.relationship(relationship);
        }
        if let Some(version) = config.version_column {
            desc = desc.version_column(version);
        }
        Ok(desc)
    }
}

impl RelationshipConfig {
    #[allow(clippy::result_large_err)]
    fn into_descriptor(self, table: &str) -> Result<RelationshipDescriptor> {
        let rel = match self.kind {
            RelationshipKind::ManyToOne => {
                RelationshipDescriptor::many_to_one(self.name, self.target_table, self.foreign_key)
            }
            RelationshipKind::OneToMany => {
                RelationshipDescriptor::one_to_many(self.name, self.target_table, self.foreign_key)
            }
            RelationshipKind::OneToOne => {
                let rel = RelationshipDescriptor::one_to_one(
                    self.name,
                    self.target_table,
                    self.foreign_key,
                );
                match self.owning_side.unwrap_or_default() {
                    OwningSide::Owner => rel,
                    OwningSide::Target => rel.owned_by_target(),
                }
            }
            RelationshipKind::ManyToMany => {
                let (Some(join_table), Some(target_key)) = (self.join_table, self.target_key)
                else {
                    return Err(Error::config(
                        ConfigErrorKind::InvalidRelationship,
                        format!(
                            "many-to-many relationship '{}.{}' needs joinTable and targetKey",
                            table, self.name
                        ),
                    ));
                };
                RelationshipDescriptor::many_to_many(
                    self.name,
                    self.target_table,
                    join_table,
                    self.foreign_key,
                    target_key,
                )
            }
        };
        Ok(rel.strategy(self.default_strategy))
    }
}

/// Parse a JSON document into unvalidated descriptors.
#[allow(clippy::result_large_err)]
pub(crate) fn parse_document(json: &str) -> Result<Vec<EntityDescriptor>> {
    let document: SchemaDocument = serde_json::from_str(json).map_err(|e| {
        let mut err = sqlmapper_core::ConfigError::new(
            ConfigErrorKind::Parse,
            format!("invalid schema document: {e}"),
        );
        err.source = Some(Box::new(e));
        Error::Config(err)
    })?;
    document
        .into_entities()
        .into_iter()
        .map(EntityDescriptor::try_from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::KeyLocation;

    #[test]
    fn parses_wrapped_document() {
        let json = r#"{
            "entities": [{
                "table": "users",
                "columns": [
                    {"name": "id", "type": "bigint", "primaryKey": true},
                    {"name": "email", "type": "varchar"},
                    {"name": "version", "type": "integer"}
                ],
                "relationships": [{
                    "name": "profile", "kind": "one-to-one", "targetTable": "profiles",
                    "foreignKey": "user_id", "owningSide": "target",
                    "defaultStrategy": "join"
                }],
                "versionColumn": "version"
            }]
        }"#;
        let entities = parse_document(json).unwrap();
        assert_eq!(entities.len(), 1);
        let users = &entities[0];
        assert_eq!(users.table(), "users");
        assert_eq!(users.primary_key(), vec!["id"]);
        assert_eq!(users.find_column("email").unwrap().column_type, ColumnType::Text);
        assert_eq!(users.version(), Some("version"));
        let profile = users.find_relationship("profile").unwrap();
        assert_eq!(profile.key_location(), KeyLocation::Target);
        assert_eq!(profile.default_strategy, LoadStrategy::Join);
    }

    #[test]
    fn parses_bare_list_with_many_to_many() {
        let json = r#"[{
            "table": "articles",
            "columns": [{"name": "id", "type": "int", "primaryKey": true}],
            "relationships": [{
                "name": "tags", "kind": "many-to-many", "targetTable": "tags",
                "foreignKey": "article_id", "joinTable": "article_tags",
                "targetKey": "tag_id", "defaultStrategy": "subquery"
            }]
        }]"#;
        let entities = parse_document(json).unwrap();
        let tags = entities[0].find_relationship("tags").unwrap();
        let join = tags.join_table.as_ref().unwrap();
        assert_eq!(join.table, "article_tags");
        assert_eq!(join.owner_column, "article_id");
        assert_eq!(join.target_column, "tag_id");
        assert_eq!(tags.default_strategy, LoadStrategy::Subquery);
    }

    #[test]
    fn many_to_many_without_join_table_is_rejected() {
        let json = r#"[{
            "table": "articles",
            "columns": [{"name": "id", "type": "int", "primaryKey": true}],
            "relationships": [{
                "name": "tags", "kind": "many-to-many", "targetTable": "tags",
                "foreignKey": "article_id"
            }]
        }]"#;
        match parse_document(json) {
            Err(Error::Config(e)) => assert_eq!(e.kind, ConfigErrorKind::InvalidRelationship),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        match parse_document("{ not json") {
            Err(Error::Config(e)) => {
                assert_eq!(e.kind, ConfigErrorKind::Parse);
                assert!(e.source.is_some());
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_strategy_is_a_parse_error() {
        let json = r#"[{
            "table": "a",
            "columns": [{"name": "id", "type": "int", "primaryKey": true}],
            "relationships": [{
                "name": "b", "kind": "many-to-one", "targetTable": "b",
                "foreignKey": "b_id", "defaultStrategy": "whenever"
            }]
        }]"#;
        assert!(matches!(
            parse_document(json),
            Err(Error::Config(ref e)) if e.kind == ConfigErrorKind::Parse
        ));
    }
}
