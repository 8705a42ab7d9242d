//! Managed entities and relationship proxies.
//!
//! Every object a session tracks lives behind an [`EntityRef`]: a shared
//! handle around the application value plus the session's bookkeeping for
//! it (state, identity, last persisted snapshot, resolved relationships).
//! Within one session, two handles to the same row are always clones of the
//! same `EntityRef`, so [`EntityRef::ptr_eq`] is the identity test.
//!
//! [`ManagedEntity`] is the type-erased form used by the identity map and
//! the unit of work, which handle entities of every mapped type at once.

use crate::Session;
use crate::identity_map::IdentityKey;
use asupersync::{Cx, Outcome};
use sqlmapper_core::{Connection, Error, Model, Result, Row, Value};
use sqlmapper_schema::EntityDescriptor;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

/// Lifecycle state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Constructed but never handed to a session.
    Transient,
    /// Added to a session, INSERT pending.
    New,
    /// Loaded or flushed; matches its snapshot as far as the session knows.
    Persistent,
    /// Persistent and opened for writing since the last flush.
    Dirty,
    /// Marked for deletion, DELETE pending.
    Removed,
    /// Persistent, but the row must be re-read on the next load.
    Expired,
    /// No longer managed. Every access fails.
    Detached,
}

impl EntityState {
    /// Whether a session currently manages the entity.
    pub const fn is_attached(self) -> bool {
        !matches!(self, EntityState::Transient | EntityState::Detached)
    }

    /// Whether the row is known to exist in storage (or will after flush).
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            EntityState::New | EntityState::Persistent | EntityState::Dirty
        )
    }
}

/// Session bookkeeping for one entity.
#[derive(Debug)]
pub(crate) struct EntityMeta {
    pub(crate) state: EntityState,
    pub(crate) key: Option<IdentityKey>,
    /// Column values as last read from or written to storage, in descriptor
    /// order. `None` until the entity is loaded or inserted.
    pub(crate) snapshot: Option<Vec<Value>>,
    pub(crate) session: Option<u64>,
    /// Registration order within the session; breaks flush-order ties.
    pub(crate) seq: u64,
    pub(crate) relations: HashMap<String, Vec<ManagedEntity>>,
}

impl EntityMeta {
    fn transient() -> Self {
        Self {
            state: EntityState::Transient,
            key: None,
            snapshot: None,
            session: None,
            seq: 0,
            relations: HashMap::new(),
        }
    }

    pub(crate) fn attach(&mut self, state: EntityState, session: u64, seq: u64) {
        self.state = state;
        self.session = Some(session);
        self.seq = seq;
    }

    pub(crate) fn detach(&mut self) {
        self.state = EntityState::Detached;
        self.session = None;
        self.relations.clear();
    }

    /// Back to an untracked object, as if it had never been added.
    pub(crate) fn reset(&mut self) {
        *self = Self::transient();
    }
}

/// Object-safe view of an [`EntityCell`] of any model type.
pub(crate) trait Tracked: Send + Sync {
    fn table(&self) -> &'static str;
    fn row_values(&self) -> Vec<(&'static str, Value)>;
    fn hydrate(&self, row: &Row) -> Result<()>;
    fn decode(&self, row: &Row) -> Result<Decoded>;
    fn install(&self, decoded: Decoded);
    fn meta(&self) -> MutexGuard<'_, EntityMeta>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Application value built from a row, not yet stored in its entity.
pub(crate) struct Decoded {
    value: Box<dyn Any + Send>,
    columns: Vec<(&'static str, Value)>,
}

impl Decoded {
    /// Column values of the decoded value in descriptor order.
    pub(crate) fn project(&self, desc: &EntityDescriptor) -> Result<Vec<Value>> {
        desc.project(self.columns.clone())
    }
}

struct EntityCell<M> {
    value: RwLock<M>,
    meta: Mutex<EntityMeta>,
}

impl<M: Model> Tracked for EntityCell<M> {
    fn table(&self) -> &'static str {
        M::TABLE_NAME
    }

    fn row_values(&self) -> Vec<(&'static str, Value)> {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_row()
    }

    fn hydrate(&self, row: &Row) -> Result<()> {
        let fresh = M::from_row(row)?;
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    fn decode(&self, row: &Row) -> Result<Decoded> {
        let fresh = M::from_row(row)?;
        Ok(Decoded {
            columns: fresh.to_row(),
            value: Box::new(fresh),
        })
    }

    fn install(&self, decoded: Decoded) {
        if let Ok(fresh) = decoded.value.downcast::<M>() {
            *self.value.write().unwrap_or_else(PoisonError::into_inner) = *fresh;
        }
    }

    fn meta(&self) -> MutexGuard<'_, EntityMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Type-erased handle to a managed entity.
#[derive(Clone)]
pub struct ManagedEntity {
    inner: Arc<dyn Tracked>,
}

impl ManagedEntity {
    pub fn table(&self) -> &'static str {
        self.inner.table()
    }

    pub fn state(&self) -> EntityState {
        self.inner.meta().state
    }

    /// Primary key values, once known.
    pub fn key(&self) -> Option<Vec<Value>> {
        self.inner
            .meta()
            .key
            .as_ref()
            .map(|k| k.values().to_vec())
    }

    /// Whether both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &ManagedEntity) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }

    /// Recover the typed handle. `None` if the entity is not an `M`.
    pub fn downcast<M: Model>(&self) -> Option<EntityRef<M>> {
        Arc::clone(&self.inner)
            .into_any()
            .downcast::<EntityCell<M>>()
            .ok()
            .map(|cell| EntityRef { cell })
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner).cast::<()>().addr()
    }

    pub(crate) fn meta(&self) -> MutexGuard<'_, EntityMeta> {
        self.inner.meta()
    }

    /// Current column values in descriptor order.
    pub(crate) fn project(&self, desc: &EntityDescriptor) -> Result<Vec<Value>> {
        desc.project(self.inner.row_values())
    }

    /// Replace the application value with one built from `row`.
    pub(crate) fn hydrate(&self, row: &Row) -> Result<()> {
        self.inner.hydrate(row)
    }

    /// Build a replacement value from `row` without touching the entity.
    pub(crate) fn decode(&self, row: &Row) -> Result<Decoded> {
        self.inner.decode(row)
    }

    /// Store a value produced by [`decode`](Self::decode) on this entity.
    pub(crate) fn install(&self, decoded: Decoded) {
        self.inner.install(decoded);
    }

    pub(crate) fn loaded(&self, relationship: &str) -> Option<Vec<ManagedEntity>> {
        self.inner.meta().relations.get(relationship).cloned()
    }

    pub(crate) fn set_loaded(&self, relationship: &str, targets: Vec<ManagedEntity>) {
        self.inner
            .meta()
            .relations
            .insert(relationship.to_string(), targets);
    }
}

impl fmt::Debug for ManagedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.inner.meta();
        f.debug_struct("ManagedEntity")
            .field("table", &self.inner.table())
            .field("state", &meta.state)
            .field("key", &meta.key)
            .finish_non_exhaustive()
    }
}

/// Shared handle to an entity of type `M`.
///
/// Cloning is cheap and yields another handle to the same instance. Values
/// are reached through [`read`](Self::read) and [`write`](Self::write);
/// guards must be released before the owning session flushes.
pub struct EntityRef<M> {
    cell: Arc<EntityCell<M>>,
}

impl<M> Clone for EntityRef<M> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<M: Model> EntityRef<M> {
    pub(crate) fn new(value: M) -> Self {
        Self {
            cell: Arc::new(EntityCell {
                value: RwLock::new(value),
                meta: Mutex::new(EntityMeta::transient()),
            }),
        }
    }

    /// Whether two handles refer to the same instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }

    pub fn as_managed(&self) -> ManagedEntity {
        let inner: Arc<dyn Tracked> = self.cell.clone();
        ManagedEntity { inner }
    }

    pub fn state(&self) -> EntityState {
        self.cell.meta().state
    }

    pub fn key(&self) -> Option<Vec<Value>> {
        self.as_managed().key()
    }

    fn detached_error(&self) -> Error {
        let meta = self.cell.meta();
        Error::detached(
            Some(M::TABLE_NAME),
            meta.key.as_ref().map(IdentityKey::values),
            "entity is detached from its session",
        )
    }

    /// Shared access to the value.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, M>> {
        if self.state() == EntityState::Detached {
            return Err(self.detached_error());
        }
        Ok(self.cell.value.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Exclusive access to the value.
    ///
    /// A persistent entity becomes [`EntityState::Dirty`]; whether an UPDATE
    /// is issued is still decided by comparing against the snapshot at flush.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, M>> {
        let detached = {
            let mut meta = self.cell.meta();
            if meta.state == EntityState::Persistent {
                meta.state = EntityState::Dirty;
            }
            meta.state == EntityState::Detached
        };
        if detached {
            return Err(self.detached_error());
        }
        Ok(self.cell.value.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Proxy for the relationship `name`, resolving to entities of type `T`.
    pub fn related<T: Model>(&self, name: &str) -> Related<T> {
        Related {
            owner: self.as_managed(),
            name: name.to_string(),
            _target: PhantomData,
        }
    }
}

impl<M: Model> fmt::Debug for EntityRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.as_managed(), f)
    }
}

/// An association of an entity, resolved explicitly.
///
/// [`get`](Self::get) never performs I/O. [`ensure_loaded`](Self::ensure_loaded)
/// is the suspension point: it resolves the association through the
/// session per the relationship's load strategy, or fails with
/// `LazyLoadForbidden` when the strategy forbids loading on access.
pub struct Related<T> {
    owner: ManagedEntity,
    name: String,
    _target: PhantomData<fn() -> T>,
}

impl<T: Model> Related<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.owner.meta().relations.contains_key(&self.name)
    }

    /// Resolved targets, or `None` if the association was never loaded.
    pub fn get(&self) -> Option<Vec<EntityRef<T>>> {
        self.owner.loaded(&self.name).map(|targets| {
            targets
                .iter()
                .filter_map(ManagedEntity::downcast::<T>)
                .collect()
        })
    }

    /// Resolved target of a to-one association.
    pub fn get_one(&self) -> Option<Option<EntityRef<T>>> {
        self.get().map(|targets| targets.into_iter().next())
    }

    /// Resolve the association if needed and return its targets.
    ///
    /// The caller's location is what N+1 detection reports for this load.
    #[track_caller]
    pub fn ensure_loaded<'a, C: Connection>(
        &'a self,
        cx: &'a Cx,
        session: &'a mut Session<C>,
    ) -> impl Future<Output = Outcome<Vec<EntityRef<T>>, Error>> + 'a {
        let site = Location::caller();
        session.load_related::<T>(cx, &self.owner, &self.name, site)
    }

    /// Resolve a to-one association.
    #[track_caller]
    pub fn ensure_one<'a, C: Connection>(
        &'a self,
        cx: &'a Cx,
        session: &'a mut Session<C>,
    ) -> impl Future<Output = Outcome<Option<EntityRef<T>>, Error>> + 'a {
        let site = Location::caller();
        async move {
            match session.load_related::<T>(cx, &self.owner, &self.name, site).await {
                Outcome::Ok(targets) => Outcome::Ok(targets.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Tag {
        id: i64,
        label: String,
    }

    impl Model for Tag {
        const TABLE_NAME: &'static str = "tags";

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into()), ("label", self.label.clone().into())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                label: row.get_named("label")?,
            })
        }
    }

    fn tag(id: i64) -> EntityRef<Tag> {
        EntityRef::new(Tag {
            id,
            label: format!("tag-{id}"),
        })
    }

    #[test]
    fn test_new_ref_is_transient() {
        let t = tag(1);
        assert_eq!(t.state(), EntityState::Transient);
        assert!(t.key().is_none());
        assert_eq!(t.read().unwrap().id, 1);
    }

    #[test]
    fn test_clone_shares_instance() {
        let a = tag(1);
        let b = a.clone();
        let other = tag(1);
        assert!(EntityRef::ptr_eq(&a, &b));
        assert!(!EntityRef::ptr_eq(&a, &other));

        b.write().unwrap().label = "changed".into();
        assert_eq!(a.read().unwrap().label, "changed");
    }

    #[test]
    fn test_write_marks_persistent_dirty() {
        let t = tag(1);
        t.as_managed()
            .meta()
            .attach(EntityState::Persistent, 1, 0);
        drop(t.write().unwrap());
        assert_eq!(t.state(), EntityState::Dirty);

        let n = tag(2);
        n.as_managed().meta().attach(EntityState::New, 1, 1);
        drop(n.write().unwrap());
        assert_eq!(n.state(), EntityState::New);
    }

    #[test]
    fn test_detached_access_fails() {
        let t = tag(1);
        t.as_managed().meta().detach();
        assert!(matches!(t.read(), Err(Error::Detached(_))));
        assert!(matches!(t.write(), Err(Error::Detached(_))));
    }

    #[test]
    fn test_downcast_round_trip() {
        let t = tag(3);
        let managed = t.as_managed();
        assert_eq!(managed.table(), "tags");
        let back = managed.downcast::<Tag>().unwrap();
        assert!(EntityRef::ptr_eq(&t, &back));
        assert!(managed.ptr_eq(&back.as_managed()));
    }

    #[test]
    fn test_hydrate_replaces_value() {
        let t = tag(4);
        let row = Row::from_pairs([
            ("id", Value::BigInt(4)),
            ("label", Value::Text("fresh".into())),
        ]);
        t.as_managed().hydrate(&row).unwrap();
        assert_eq!(t.read().unwrap().label, "fresh");
    }

    #[test]
    fn test_related_proxy_without_io() {
        let owner = tag(1);
        let rel = owner.related::<Tag>("children");
        assert!(!rel.is_loaded());
        assert!(rel.get().is_none());

        let child = tag(2);
        owner
            .as_managed()
            .set_loaded("children", vec![child.as_managed()]);
        assert!(rel.is_loaded());
        let loaded = rel.get().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(EntityRef::ptr_eq(&loaded[0], &child));
        assert!(EntityRef::ptr_eq(&rel.get_one().unwrap().unwrap(), &child));
    }
}
