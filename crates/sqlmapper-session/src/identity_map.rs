//! Identity Map pattern for tracking unique object instances per primary key.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! object instance within a session. This provides:
//!
//! - **Uniqueness**: Same key always yields the same `EntityRef`
//! - **Cache**: `get` on a tracked key issues no statement
//! - **Consistency**: Changes to an object are visible everywhere it's used
//!
//! Keys compare primary-key values structurally after canonicalization, so
//! `1_i32` and `1_i64` address the same row.

use crate::entity::ManagedEntity;
use sqlmapper_core::{ConfigErrorKind, Error, Result, Value};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Whether two values are the same key component.
///
/// Like `==` on canonical forms, except that floats compare by bit pattern so
/// equality stays consistent with hashing.
pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    match (a.canonical(), b.canonical()) {
        (Value::Double(x), Value::Double(y)) => x.to_bits() == y.to_bits(),
        (x, y) => x == y,
    }
}

/// (table, primary-key values) for one logical row.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    table: String,
    values: Vec<Value>,
}

impl IdentityKey {
    pub fn new(table: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            table: table.into(),
            values,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// A key with a NULL component addresses no row.
    pub fn has_null(&self) -> bool {
        self.values.iter().any(Value::is_null)
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| same_value(a, b))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        self.values.len().hash(state);
        for value in &self.values {
            value.hash_canonical(state);
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.values.iter().map(Value::to_string).collect();
        write!(f, "{}({})", self.table, parts.join(", "))
    }
}

/// Per-session map from [`IdentityKey`] to the one live instance.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, ManagedEntity>,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &IdentityKey) -> Option<ManagedEntity> {
        self.entries.get(key).cloned()
    }

    /// Track `entity` under `key`.
    ///
    /// Registering the same instance again is a no-op. A different instance
    /// under an occupied key is an `IdentityConflict`.
    pub fn register(&mut self, key: IdentityKey, entity: ManagedEntity) -> Result<()> {
        self.check(&key, &entity)?;
        self.insert(key, entity);
        Ok(())
    }

    /// Whether `entity` could be registered under `key`.
    pub fn check(&self, key: &IdentityKey, entity: &ManagedEntity) -> Result<()> {
        match self.entries.get(key) {
            Some(existing) if !existing.ptr_eq(entity) => Err(Error::config(
                ConfigErrorKind::IdentityConflict,
                format!("identity map already holds a different instance for {key}"),
            )),
            _ => Ok(()),
        }
    }

    /// Register after a successful [`check`](Self::check).
    pub(crate) fn insert(&mut self, key: IdentityKey, entity: ManagedEntity) {
        if let Entry::Vacant(slot) = self.entries.entry(key) {
            tracing::trace!(key = %slot.key(), "Registered identity");
            slot.insert(entity);
        }
    }

    pub fn evict(&mut self, key: &IdentityKey) -> Option<ManagedEntity> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, &ManagedEntity)> {
        self.entries.iter()
    }

    /// Tracked entities of one table.
    pub fn entities_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ManagedEntity> {
        self.entries
            .iter()
            .filter(move |(key, _)| key.table == table)
            .map(|(_, entity)| entity)
    }
}
