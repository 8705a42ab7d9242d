//! Validated, immutable catalog of entity descriptors.

use crate::config::parse_document;
use crate::descriptor::{EntityDescriptor, KeyLocation, RelationshipKind};
use regex::Regex;
use sqlmapper_core::{ConfigErrorKind, Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

/// A foreign-key column on some table, pointing at another table's primary
/// key. Derived from relationships at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    /// Column on the referencing table.
    pub column: String,
    /// Referenced table.
    pub target_table: String,
}

/// Catalog of registered entities.
///
/// Built with [`register`](Self::register) / [`register_all`](Self::register_all)
/// and then shared read-only (usually as `Arc<SchemaRegistry>`) by every
/// session.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entities: HashMap<String, EntityDescriptor>,
    /// Tables in registration order.
    order: Vec<String>,
    foreign_keys: HashMap<String, Vec<ForeignKeyRef>>,
}

fn identifier_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"))
        .as_ref()
        .map_err(|e| Error::config(ConfigErrorKind::Invalid, format!("identifier pattern: {e}")))
}

#[allow(clippy::result_large_err)]
fn check_identifier(what: &str, name: &str) -> Result<()> {
    if identifier_pattern()?.is_match(name) {
        Ok(())
    } else {
        Err(Error::config(
            ConfigErrorKind::InvalidIdentifier,
            format!("{what} '{name}' is not a valid identifier"),
        ))
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and register a JSON schema document.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        let mut registry = Self::new();
        registry.register_all(parse_document(json)?)?;
        Ok(registry)
    }

    /// Read a JSON schema document from disk.
    #[allow(clippy::result_large_err)]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading schema document");
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Register one entity. Its relationships may target itself or any
    /// entity registered before it.
    #[allow(clippy::result_large_err)]
    pub fn register(&mut self, descriptor: EntityDescriptor) -> Result<()> {
        self.register_all(vec![descriptor])
    }

    /// Register a batch of entities that may reference each other.
    ///
    /// Either every descriptor is accepted or the registry is left unchanged.
    #[allow(clippy::result_large_err)]
    pub fn register_all(
        &mut self,
        descriptors: impl IntoIterator<Item = EntityDescriptor>,
    ) -> Result<()> {
        let batch: Vec<EntityDescriptor> = descriptors.into_iter().collect();

        let mut batch_tables = HashSet::new();
        for desc in &batch {
            validate_entity(desc)?;
            if self.entities.contains_key(desc.table()) || !batch_tables.insert(desc.table()) {
                return Err(Error::config(
                    ConfigErrorKind::DuplicateTable,
                    format!("table '{}' is already registered", desc.table()),
                ));
            }
        }

        let mut derived: Vec<(String, ForeignKeyRef)> = Vec::new();
        for desc in &batch {
            derived.extend(validate_relationships(desc, &self.entities, &batch)?);
        }

        for (table, fk) in derived {
            let fks = self.foreign_keys.entry(table).or_default();
            if !fks.contains(&fk) {
                fks.push(fk);
            }
        }
        for desc in batch {
            tracing::debug!(
                table = desc.table(),
                columns = desc.columns().len(),
                relationships = desc.relationships().len(),
                "Registered entity"
            );
            self.order.push(desc.table().to_string());
            self.entities.insert(desc.table().to_string(), desc);
        }
        Ok(())
    }

    pub fn entity(&self, table: &str) -> Option<&EntityDescriptor> {
        self.entities.get(table)
    }

    /// Like [`entity`](Self::entity), but an unknown table is a
    /// configuration error.
    #[allow(clippy::result_large_err)]
    pub fn require(&self, table: &str) -> Result<&EntityDescriptor> {
        self.entity(table).ok_or_else(|| {
            Error::config(
                ConfigErrorKind::UnregisteredEntity,
                format!("entity '{table}' is not registered"),
            )
        })
    }

    pub fn contains(&self, table: &str) -> bool {
        self.entities.contains_key(table)
    }

    /// Registered entities in registration order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.order.iter().filter_map(|t| self.entities.get(t))
    }

    /// Foreign keys held by `table`.
    pub fn foreign_keys(&self, table: &str) -> &[ForeignKeyRef] {
        self.foreign_keys
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Checks that need nothing but the descriptor itself.
#[allow(clippy::result_large_err)]
fn validate_entity(desc: &EntityDescriptor) -> Result<()> {
    let table = desc.table();
    check_identifier("table", table)?;

    let mut names = HashSet::new();
    for col in desc.columns() {
        check_identifier("column", &col.name)?;
        if !names.insert(col.name.as_str()) {
            return Err(Error::config(
                ConfigErrorKind::DuplicateName,
                format!("column '{}' declared twice on '{table}'", col.name),
            ));
        }
    }
    if desc.primary_key().is_empty() {
        return Err(Error::config(
            ConfigErrorKind::MissingPrimaryKey,
            format!("'{table}' has no primary key column"),
        ));
    }

    if let Some(version) = desc.version() {
        let column = desc.find_column(version).ok_or_else(|| {
            Error::config(
                ConfigErrorKind::UnknownColumn,
                format!("version column '{version}' is not a column of '{table}'"),
            )
        })?;
        if column.primary_key || !column.column_type.is_integer() {
            return Err(Error::config(
                ConfigErrorKind::Invalid,
                format!("version column '{table}.{version}' must be a non-key integer column"),
            ));
        }
    }

    for rel in desc.relationships() {
        check_identifier("relationship", &rel.name)?;
        check_identifier("column", &rel.foreign_key)?;
        check_identifier("table", &rel.target)?;
        if !names.insert(rel.name.as_str()) {
            return Err(Error::config(
                ConfigErrorKind::DuplicateName,
                format!("name '{}' declared twice on '{table}'", rel.name),
            ));
        }
        match (&rel.kind, &rel.join_table) {
            (RelationshipKind::ManyToMany, None) => {
                return Err(Error::config(
                    ConfigErrorKind::InvalidRelationship,
                    format!("many-to-many '{table}.{}' has no join table", rel.name),
                ));
            }
            (RelationshipKind::ManyToMany, Some(join)) => {
                check_identifier("table", &join.table)?;
                check_identifier("column", &join.owner_column)?;
                check_identifier("column", &join.target_column)?;
            }
            (_, Some(_)) => {
                return Err(Error::config(
                    ConfigErrorKind::InvalidRelationship,
                    format!("only many-to-many relationships take a join table ('{table}.{}')", rel.name),
                ));
            }
            (_, None) => {}
        }
        if rel.key_location() == KeyLocation::Owner && desc.find_column(&rel.foreign_key).is_none()
        {
            return Err(Error::config(
                ConfigErrorKind::UnknownColumn,
                format!(
                    "relationship '{table}.{}' uses foreign key '{}' which is not a column of '{table}'",
                    rel.name, rel.foreign_key
                ),
            ));
        }
    }
    Ok(())
}

/// Checks against the targets, returning the foreign keys the relationships
/// imply as `(holding table, key)`.
#[allow(clippy::result_large_err)]
fn validate_relationships<'a>(
    desc: &'a EntityDescriptor,
    registered: &'a HashMap<String, EntityDescriptor>,
    batch: &'a [EntityDescriptor],
) -> Result<Vec<(String, ForeignKeyRef)>> {
    let lookup = |name: &str| -> Option<&'a EntityDescriptor> {
        registered
            .get(name)
            .or_else(|| batch.iter().find(|d| d.table() == name))
    };
    let table = desc.table();
    let mut derived = Vec::new();
    for rel in desc.relationships() {
        let target: &EntityDescriptor = if rel.target == table {
            desc
        } else {
            lookup(&rel.target).ok_or_else(|| {
                Error::config(
                    ConfigErrorKind::UnknownTarget,
                    format!(
                        "relationship '{table}.{}' targets unregistered table '{}'",
                        rel.name, rel.target
                    ),
                )
            })?
        };
        let single_key = |side: &EntityDescriptor| -> Result<()> {
            if side.single_primary_key().is_some() {
                Ok(())
            } else {
                Err(Error::config(
                    ConfigErrorKind::InvalidRelationship,
                    format!(
                        "relationship '{table}.{}' references '{}', which has a composite primary key",
                        rel.name,
                        side.table()
                    ),
                ))
            }
        };
        match rel.key_location() {
            KeyLocation::Owner => {
                single_key(target)?;
                derived.push((
                    table.to_string(),
                    ForeignKeyRef {
                        column: rel.foreign_key.clone(),
                        target_table: target.table().to_string(),
                    },
                ));
            }
            KeyLocation::Target => {
                single_key(desc)?;
                if target.find_column(&rel.foreign_key).is_none() {
                    return Err(Error::config(
                        ConfigErrorKind::UnknownColumn,
                        format!(
                            "relationship '{table}.{}' uses foreign key '{}' which is not a column of '{}'",
                            rel.name,
                            rel.foreign_key,
                            target.table()
                        ),
                    ));
                }
                derived.push((
                    target.table().to_string(),
                    ForeignKeyRef {
                        column: rel.foreign_key.clone(),
                        target_table: table.to_string(),
                    },
                ));
            }
            KeyLocation::JoinTable => {
                single_key(desc)?;
                single_key(target)?;
            }
        }
    }
    Ok(derived)
}
