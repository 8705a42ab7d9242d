//! Session, Identity Map and Unit of Work for sqlmapper.
//!
//! `sqlmapper-session` is the **persistence layer** application code talks
//! to. A [`Session`] keeps an in-memory object graph consistent with the
//! rows behind it:
//!
//! - **Identity map**: one live instance per (table, primary key).
//! - **Unit of work**: added, changed and removed entities are written in
//!   one dependency-ordered flush, inside one transaction.
//! - **Relationship loading**: associations resolve lazily, by join, by
//!   sub-select or by batched IN list, or refuse to load on access.
//!
//! # Design
//!
//! - **Data mapper**: entity types only implement `Model`. All metadata lives
//!   in the shared `SchemaRegistry`.
//! - **Explicit loading**: associations are reached through [`Related`]
//!   proxies; `ensure_loaded` is the only place that performs I/O.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome`; a
//!   cancelled or interrupted flush leaves its transaction rolled back.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(conn, Arc::new(registry));
//!
//! let author = session.add(Author { id: 1, name: "A".into() })?;
//! session.add(Article { id: 10, title: "T".into(), author_id: Some(1) })?;
//! session.commit(&cx).await?;
//!
//! let article = session.get::<Article>(&cx, 10_i64).await?;
//! let same = article.related::<Author>("author").ensure_one(&cx, &mut session).await?;
//! assert!(EntityRef::ptr_eq(&author, &same.unwrap()));
//! ```

// Error type is defined in sqlmapper-core
#![allow(clippy::result_large_err)]

pub mod entity;
pub mod flush;
pub mod identity_map;
mod loader;
pub mod n1_detection;
pub mod unit_of_work;

pub use entity::{EntityRef, EntityState, ManagedEntity, Related};
pub use flush::{FlushResult, LinkAction};
pub use identity_map::{IdentityKey, IdentityMap};
pub use n1_detection::{CallSite, N1QueryTracker, N1Stats};
pub use unit_of_work::PendingCounts;

use crate::flush::FlushExecution;
use crate::unit_of_work::{UnitOfWork, link_op};
use asupersync::{Cx, Outcome};
use serde::Deserialize;
use sqlmapper_core::{
    ConfigErrorKind, Connection, Error, IsolationLevel, Model, NotFoundError, Result, Row,
    TransactionError, TransactionErrorKind, TransactionHandle, Value,
};
use sqlmapper_query::{Expr, OrderBy, Select, entity as statements};
use sqlmapper_schema::{EntityDescriptor, LoadStrategy, RelationshipKind, SchemaRegistry};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether to begin a transaction on the first statement.
    pub auto_begin: bool,
    /// Isolation level for transactions the session begins.
    pub isolation: IsolationLevel,
    /// Whether to expire entities after commit (reload on next access).
    pub expire_on_commit: bool,
    /// Lazy loads per relationship before an N+1 warning; `None` disables
    /// detection.
    pub n1_threshold: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            isolation: IsolationLevel::ReadCommitted,
            expire_on_commit: false,
            n1_threshold: Some(3),
        }
    }
}

/// Builds a managed entity of a concrete model type from a row.
type Hydrator = fn(&Row) -> Result<ManagedEntity>;

fn hydrate_model<M: Model>(row: &Row) -> Result<ManagedEntity> {
    Ok(EntityRef::new(M::from_row(row)?).as_managed())
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Session
// ============================================================================

/// One transactional scope over a connection.
///
/// A session is confined to one task at a time. Concurrent work opens
/// independent sessions; entities are never shared between them.
pub struct Session<C: Connection> {
    id: u64,
    connection: C,
    registry: Arc<SchemaRegistry>,
    config: SessionConfig,
    identity_map: IdentityMap,
    uow: UnitOfWork,
    transaction: Option<TransactionHandle>,
    /// Model types seen by this session, by table.
    hydrators: HashMap<&'static str, Hydrator>,
    n1_tracker: Option<N1QueryTracker>,
    next_seq: u64,
    /// Set while flush statements run; still set if the flush future was
    /// dropped.
    flush_in_progress: bool,
    /// A flush was applied in the current transaction.
    flushed_in_transaction: bool,
    closed: bool,
}

impl<C: Connection> Session<C> {
    /// Create a session with the default configuration.
    pub fn new(connection: C, registry: Arc<SchemaRegistry>) -> Self {
        Self::with_config(connection, registry, SessionConfig::default())
    }

    pub fn with_config(connection: C, registry: Arc<SchemaRegistry>, config: SessionConfig) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, "Opened session");
        Self {
            id,
            connection,
            registry,
            n1_tracker: config.n1_threshold.map(N1QueryTracker::new),
            config,
            identity_map: IdentityMap::new(),
            uow: UnitOfWork::default(),
            transaction: None,
            hydrators: HashMap::new(),
            next_seq: 0,
            flush_in_progress: false,
            flushed_in_transaction: false,
            closed: false,
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Make `M` known as the model type of its table.
    ///
    /// Typed calls (`get`, `query`, `add`, `related`) do this on their own.
    /// Mapping up front is only needed for types first reached through an
    /// eager load.
    pub fn map<M: Model>(&mut self) -> Result<()> {
        self.learn::<M>()
    }

    fn learn<M: Model>(&mut self) -> Result<()> {
        self.registry.require(M::TABLE_NAME)?;
        self.hydrators
            .entry(M::TABLE_NAME)
            .or_insert(hydrate_model::<M> as Hydrator);
        Ok(())
    }

    fn hydrator(&self, table: &str) -> Result<Hydrator> {
        self.hydrators.get(table).copied().ok_or_else(|| {
            Error::config(
                ConfigErrorKind::UnregisteredEntity,
                format!("no model type is mapped to '{table}'; call Session::map first"),
            )
        })
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::detached(None, None, "session is closed"));
        }
        Ok(())
    }

    /// The entity must be attached to this session.
    fn check_owned(&self, entity: &ManagedEntity) -> Result<()> {
        let (state, session, key) = {
            let meta = entity.meta();
            (meta.state, meta.session, meta.key.clone())
        };
        if state.is_attached() && session == Some(self.id) {
            return Ok(());
        }
        Err(Error::detached(
            Some(entity.table()),
            key.as_ref().map(IdentityKey::values),
            "entity is not attached to this session",
        ))
    }

    /// Default eager strategies of `desc` whose targets can be hydrated.
    fn default_eager(&self, desc: &EntityDescriptor) -> Vec<(String, LoadStrategy)> {
        desc.relationships()
            .iter()
            .filter(|rel| rel.default_strategy.is_eager())
            .filter(|rel| {
                let known = self.hydrators.contains_key(rel.target.as_str());
                if !known {
                    tracing::debug!(
                        relationship = %rel.name,
                        target = %rel.target,
                        "Skipping eager load of unmapped target"
                    );
                }
                known
            })
            .map(|rel| (rel.name.clone(), rel.default_strategy))
            .collect()
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction. A no-op if one is already open.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        match self.recover_interrupted(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if self.transaction.is_some() {
            return Outcome::Ok(());
        }
        match self.connection.begin(cx, self.config.isolation).await {
            Outcome::Ok(tx) => {
                tracing::debug!(session = self.id, tx = tx.id(), "Began transaction");
                self.transaction = Some(tx);
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Open a transaction before the first statement, if configured to.
    async fn ensure_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.recover_interrupted(cx).await {
            Outcome::Ok(()) => {}
            other => return other,
        }
        if self.transaction.is_none() && self.config.auto_begin {
            return self.begin(cx).await;
        }
        Outcome::Ok(())
    }

    /// Roll back the transaction of a flush whose future was dropped.
    async fn recover_interrupted(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.flush_in_progress {
            return Outcome::Ok(());
        }
        self.flush_in_progress = false;
        tracing::warn!(
            session = self.id,
            "Previous flush was interrupted; rolling back its transaction"
        );
        self.abort_transaction(cx).await
    }

    /// Roll back the open transaction without touching entity state.
    async fn abort_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.flushed_in_transaction {
            tracing::warn!(
                session = self.id,
                "Changes from earlier flushes in this transaction were rolled back as well"
            );
        }
        self.flushed_in_transaction = false;
        self.reset_n1_tracking();
        match self.transaction.take() {
            Some(tx) => self.connection.rollback(cx, tx).await,
            None => Outcome::Ok(()),
        }
    }

    /// Access-time loads are counted per transaction.
    fn reset_n1_tracking(&mut self) {
        if let Some(tracker) = &mut self.n1_tracker {
            tracker.reset();
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Get an entity by primary key, or `NotFound`.
    ///
    /// A tracked entity is returned without issuing a statement, so two
    /// calls for the same key return the same instance.
    #[tracing::instrument(level = "debug", skip_all, fields(table = M::TABLE_NAME))]
    pub async fn get<M: Model>(
        &mut self,
        cx: &Cx,
        key: impl Into<Value>,
    ) -> Outcome<EntityRef<M>, Error> {
        self.get_by_key(cx, vec![key.into()]).await
    }

    /// [`get`](Self::get) for composite keys, values in key column order.
    pub async fn get_by_key<M: Model>(
        &mut self,
        cx: &Cx,
        key: Vec<Value>,
    ) -> Outcome<EntityRef<M>, Error> {
        match self.find_by_key::<M>(cx, key.clone()).await {
            Outcome::Ok(Some(entity)) => Outcome::Ok(entity),
            Outcome::Ok(None) => Outcome::Err(Error::NotFound(NotFoundError {
                table: M::TABLE_NAME.to_string(),
                key,
            })),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Like [`get`](Self::get), but an absent row is `None`.
    pub async fn find<M: Model>(
        &mut self,
        cx: &Cx,
        key: impl Into<Value>,
    ) -> Outcome<Option<EntityRef<M>>, Error> {
        self.find_by_key(cx, vec![key.into()]).await
    }

    pub async fn find_by_key<M: Model>(
        &mut self,
        cx: &Cx,
        key: Vec<Value>,
    ) -> Outcome<Option<EntityRef<M>>, Error> {
        if let Err(e) = self.ensure_open().and_then(|()| self.learn::<M>()) {
            return Outcome::Err(e);
        }
        let registry = Arc::clone(&self.registry);
        let desc = match registry.require(M::TABLE_NAME) {
            Ok(desc) => desc,
            Err(e) => return Outcome::Err(e),
        };
        if key.len() != desc.primary_key().len() || key.iter().any(Value::is_null) {
            return Outcome::Err(Error::config(
                ConfigErrorKind::Invalid,
                format!(
                    "'{}' is keyed by ({}); got {} non-NULL value(s)",
                    desc.table(),
                    desc.primary_key().join(", "),
                    key.iter().filter(|v| !v.is_null()).count()
                ),
            ));
        }

        let identity = IdentityKey::new(M::TABLE_NAME, key.clone());
        if let Some(entity) = self.identity_map.lookup(&identity) {
            match entity.state() {
                EntityState::Removed => return Outcome::Ok(None),
                // Reloaded below; the row refreshes this instance
                EntityState::Expired => {}
                _ => {
                    tracing::trace!(key = %identity, "Identity map hit");
                    return match entity.downcast::<M>() {
                        Some(entity) => Outcome::Ok(Some(entity)),
                        None => Outcome::Err(Error::config(
                            ConfigErrorKind::Invalid,
                            format!("{identity} is tracked as a different model type"),
                        )),
                    };
                }
            }
        }

        let select = statements::select_by_key(desc, &key);
        let eager = self.default_eager(desc);
        match self.load_owners(cx, M::TABLE_NAME, select, eager).await {
            Outcome::Ok(owners) => {
                Outcome::Ok(owners.iter().find_map(ManagedEntity::downcast::<M>))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Start a query over entities of type `M`.
    pub fn query<M: Model>(&mut self) -> Query<'_, C, M> {
        let error = self.ensure_open().and_then(|()| self.learn::<M>()).err();
        let select = match self.registry.entity(M::TABLE_NAME) {
            Some(desc) => statements::select_all(desc),
            None => Select::from(M::TABLE_NAME),
        };
        Query {
            session: self,
            select,
            strategies: Vec::new(),
            error,
            _model: PhantomData,
        }
    }

    // ========================================================================
    // Change Registration
    // ========================================================================

    /// Track a new entity; it is inserted on the next flush.
    ///
    /// An all-NULL primary key is left to the database, which requires a
    /// dialect with `RETURNING`.
    ///
    /// A key already tracked by this session is an `IdentityConflict`. That
    /// includes an entity marked for removal whose DELETE has not been
    /// flushed yet; flush first to reuse its key.
    pub fn add<M: Model>(&mut self, value: M) -> Result<EntityRef<M>> {
        self.ensure_open()?;
        self.learn::<M>()?;
        let registry = Arc::clone(&self.registry);
        let desc = registry.require(M::TABLE_NAME)?;

        let handle = EntityRef::new(value);
        let entity = handle.as_managed();
        let values = entity.project(desc)?;
        let key = desc.key_values(&values);

        let identity = if key.iter().all(Value::is_null) {
            let dialect = self.connection.dialect();
            if !dialect.supports_returning() {
                return Err(Error::config(
                    ConfigErrorKind::Invalid,
                    format!(
                        "'{}' added without a primary key, but {dialect:?} cannot return generated keys",
                        desc.table()
                    ),
                ));
            }
            None
        } else if key.iter().any(Value::is_null) {
            return Err(Error::config(
                ConfigErrorKind::Invalid,
                format!("'{}' added with a partially NULL primary key", desc.table()),
            ));
        } else {
            let identity = IdentityKey::new(desc.table(), key);
            if self.identity_map.contains(&identity) {
                return Err(Error::config(
                    ConfigErrorKind::IdentityConflict,
                    format!("{identity} is already tracked by this session"),
                ));
            }
            self.identity_map.register(identity.clone(), entity.clone())?;
            Some(identity)
        };

        let seq = self.next_seq();
        {
            let mut meta = entity.meta();
            meta.attach(EntityState::New, self.id, seq);
            meta.key = identity;
        }
        tracing::debug!(table = desc.table(), seq, "Added entity");
        self.uow.track_new(entity);
        Ok(handle)
    }

    /// Mark an entity for deletion on the next flush.
    ///
    /// A new entity that was never flushed is simply forgotten and becomes
    /// transient again.
    pub fn remove<M: Model>(&mut self, entity: &EntityRef<M>) -> Result<()> {
        self.ensure_open()?;
        let managed = entity.as_managed();
        self.check_owned(&managed)?;

        match managed.state() {
            EntityState::New => {
                self.uow.forget_new(&managed);
                let key = managed.meta().key.clone();
                if let Some(key) = key {
                    self.identity_map.evict(&key);
                }
                managed.meta().reset();
                tracing::debug!(table = M::TABLE_NAME, "Expunged pending entity");
            }
            EntityState::Persistent | EntityState::Dirty | EntityState::Expired => {
                managed.meta().state = EntityState::Removed;
                tracing::debug!(table = M::TABLE_NAME, key = ?managed.key(), "Marked entity for deletion");
                self.uow.track_removed(managed);
            }
            EntityState::Removed | EntityState::Transient | EntityState::Detached => {}
        }
        Ok(())
    }

    /// Add `target` to the many-to-many relationship `relationship` of
    /// `owner`. The link row is inserted on the next flush.
    pub fn link<M: Model, T: Model>(
        &mut self,
        owner: &EntityRef<M>,
        relationship: &str,
        target: &EntityRef<T>,
    ) -> Result<()> {
        self.change_link(LinkAction::Link, &owner.as_managed(), relationship, &target.as_managed())
    }

    /// Remove `target` from a many-to-many relationship of `owner`.
    pub fn unlink<M: Model, T: Model>(
        &mut self,
        owner: &EntityRef<M>,
        relationship: &str,
        target: &EntityRef<T>,
    ) -> Result<()> {
        self.change_link(LinkAction::Unlink, &owner.as_managed(), relationship, &target.as_managed())
    }

    fn change_link(
        &mut self,
        action: LinkAction,
        owner: &ManagedEntity,
        relationship: &str,
        target: &ManagedEntity,
    ) -> Result<()> {
        self.ensure_open()?;
        self.check_owned(owner)?;
        self.check_owned(target)?;

        let registry = Arc::clone(&self.registry);
        let rel = registry.require(owner.table())?.require_relationship(relationship)?;
        let join = match (&rel.kind, &rel.join_table) {
            (RelationshipKind::ManyToMany, Some(join)) => join.clone(),
            _ => {
                return Err(Error::config(
                    ConfigErrorKind::InvalidRelationship,
                    format!("'{}.{relationship}' is not a many-to-many relationship", owner.table()),
                ));
            }
        };
        if rel.target != target.table() {
            return Err(Error::config(
                ConfigErrorKind::InvalidRelationship,
                format!(
                    "'{}.{relationship}' links to '{}', not '{}'",
                    owner.table(),
                    rel.target,
                    target.table()
                ),
            ));
        }
        for side in [owner, target] {
            if side.state() == EntityState::Removed {
                return Err(Error::config(
                    ConfigErrorKind::Invalid,
                    format!("cannot change links of a removed '{}'", side.table()),
                ));
            }
        }

        self.uow
            .track_link(link_op(action, relationship, join, owner, target));

        // Keep a resolved collection in step
        let current = match owner.loaded(relationship) {
            Some(current) => Some(current),
            None if owner.state() == EntityState::New => Some(Vec::new()),
            None => None,
        };
        if let Some(mut current) = current {
            match action {
                LinkAction::Link => {
                    if !current.iter().any(|e| e.ptr_eq(target)) {
                        current.push(target.clone());
                    }
                }
                LinkAction::Unlink => current.retain(|e| !e.ptr_eq(target)),
            }
            owner.set_loaded(relationship, current);
        }
        Ok(())
    }

    /// Whether flushing would write anything for this entity.
    pub fn is_modified<M: Model>(&self, entity: &EntityRef<M>) -> Result<bool> {
        self.ensure_open()?;
        let managed = entity.as_managed();
        self.check_owned(&managed)?;
        match managed.state() {
            EntityState::New | EntityState::Removed => Ok(true),
            EntityState::Dirty => {
                let desc = self.registry.require(M::TABLE_NAME)?;
                let snapshot = managed.meta().snapshot.clone();
                let current = managed.project(desc)?;
                Ok(snapshot.is_none_or(|snapshot| {
                    current
                        .iter()
                        .zip(&snapshot)
                        .any(|(a, b)| !identity_map::same_value(a, b))
                }))
            }
            _ => Ok(false),
        }
    }

    pub fn state_of<M: Model>(&self, entity: &EntityRef<M>) -> EntityState {
        entity.state()
    }

    // ========================================================================
    // Flush / Commit / Rollback
    // ========================================================================

    /// Write pending changes inside the current transaction.
    ///
    /// On any failure the transaction is rolled back and no entity state
    /// changes: new entities stay new and dirty entities stay dirty, so the
    /// flush can be retried once the cause is fixed.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        match self.recover_interrupted(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let registry = Arc::clone(&self.registry);
        let plan = match self.uow.plan(&registry, &self.identity_map) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        if plan.is_empty() {
            // Nothing to write; entities opened for writing are clean again
            if let Err(e) = self.uow.apply(
                &plan,
                &FlushExecution::default(),
                &registry,
                &mut self.identity_map,
            ) {
                return Outcome::Err(e);
            }
            return Outcome::Ok(FlushResult::default());
        }

        if self.transaction.is_none() {
            if !self.config.auto_begin {
                return Outcome::Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::NotActive,
                    message: "flush requires an open transaction; call begin() first".into(),
                }));
            }
            match self.begin(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::info!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            links = plan.links.len(),
            deletes = plan.deletes.len(),
            "Executing flush plan"
        );
        let start = Instant::now();

        self.flush_in_progress = true;
        let outcome = plan.execute(cx, &self.connection, &registry).await;
        self.flush_in_progress = false;

        match outcome {
            Outcome::Ok(execution) => {
                if let Err(e) =
                    self.uow
                        .apply(&plan, &execution, &registry, &mut self.identity_map)
                {
                    self.fail_flush(cx, &e.to_string()).await;
                    return Outcome::Err(e);
                }
                self.flushed_in_transaction = true;
                let result = execution.result;
                tracing::info!(
                    inserted = result.inserted,
                    updated = result.updated,
                    deleted = result.deleted,
                    linked = result.linked,
                    unlinked = result.unlinked,
                    elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Flush complete"
                );
                Outcome::Ok(result)
            }
            Outcome::Err(e) => {
                self.fail_flush(cx, &e.to_string()).await;
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.fail_flush(cx, "cancelled").await;
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.fail_flush(cx, "panicked").await;
                Outcome::Panicked(p)
            }
        }
    }

    async fn fail_flush(&mut self, cx: &Cx, reason: &str) {
        tracing::warn!(session = self.id, reason, "Flush failed; rolling back transaction");
        match self.abort_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                tracing::warn!(session = self.id, error = %e, "Rollback after failed flush failed");
            }
            Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                tracing::warn!(session = self.id, "Rollback after failed flush did not complete");
            }
        }
    }

    /// Flush, then commit the transaction.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let result = match self.flush(cx).await {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        if let Some(tx) = self.transaction.take() {
            self.flushed_in_transaction = false;
            match self.connection.commit(cx, tx).await {
                Outcome::Ok(()) => {
                    tracing::debug!(session = self.id, "Committed transaction");
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.reset_n1_tracking();

        if self.config.expire_on_commit {
            for (_, entity) in self.identity_map.iter() {
                let mut meta = entity.meta();
                if meta.state == EntityState::Persistent {
                    meta.state = EntityState::Expired;
                    meta.relations.clear();
                }
            }
        }
        Outcome::Ok(result)
    }

    /// Roll back the transaction and discard pending changes.
    ///
    /// Never-flushed new entities become transient again. Every other
    /// tracked entity is expired and refreshed on its next load.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        self.flush_in_progress = false;
        self.flushed_in_transaction = false;
        self.reset_n1_tracking();
        let outcome = match self.transaction.take() {
            Some(tx) => self.connection.rollback(cx, tx).await,
            None => Outcome::Ok(()),
        };

        for entity in self.uow.new_entities() {
            let key = entity.meta().key.clone();
            if let Some(key) = key {
                self.identity_map.evict(&key);
            }
            entity.meta().reset();
        }
        for (_, entity) in self.identity_map.iter() {
            let mut meta = entity.meta();
            meta.state = EntityState::Expired;
            meta.relations.clear();
        }
        let counts = self.uow.counts();
        self.uow.clear();
        tracing::debug!(
            session = self.id,
            discarded_new = counts.new,
            discarded_removed = counts.removed,
            discarded_links = counts.links,
            "Rolled back"
        );
        outcome
    }

    /// Roll back any open transaction and detach every entity.
    ///
    /// Further operations on the session or its entities fail with
    /// `Detached`.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Ok(());
        }
        let outcome = match self.transaction.take() {
            Some(tx) => {
                tracing::warn!(session = self.id, "Closing session with an open transaction; rolling back");
                self.connection.rollback(cx, tx).await
            }
            None => Outcome::Ok(()),
        };

        for (_, entity) in self.identity_map.iter() {
            entity.meta().detach();
        }
        for entity in self.uow.new_entities() {
            entity.meta().detach();
        }
        self.identity_map.clear();
        self.uow.clear();
        self.flush_in_progress = false;
        self.flushed_in_transaction = false;
        self.closed = true;
        tracing::debug!(session = self.id, "Closed session");
        outcome
    }

    // ========================================================================
    // N+1 Query Detection
    // ========================================================================

    pub fn enable_n1_detection(&mut self, threshold: usize) {
        self.n1_tracker = Some(N1QueryTracker::new(threshold));
    }

    pub fn disable_n1_detection(&mut self) {
        self.n1_tracker = None;
    }

    pub fn n1_stats(&self) -> Option<N1Stats> {
        self.n1_tracker.as_ref().map(N1QueryTracker::stats)
    }

    pub fn n1_tracker(&self) -> Option<&N1QueryTracker> {
        self.n1_tracker.as_ref()
    }

    // ========================================================================
    // Debug
    // ========================================================================

    pub fn pending_counts(&self) -> PendingCounts {
        self.uow.counts()
    }

    pub fn debug_info(&self) -> SessionDebugInfo {
        let counts = self.uow.counts();
        SessionDebugInfo {
            tracked: self.identity_map.len(),
            pending_new: counts.new,
            pending_delete: counts.removed,
            pending_dirty: self
                .identity_map
                .iter()
                .filter(|(_, e)| e.state() == EntityState::Dirty)
                .count(),
            pending_links: counts.links,
            in_transaction: self.transaction.is_some(),
            closed: self.closed,
        }
    }
}

impl<C: Connection> Drop for Session<C> {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            tracing::warn!(
                session = self.id,
                "Session dropped with an open transaction; the driver must discard it"
            );
        }
        // Resolved associations can form reference cycles between entities
        for (_, entity) in self.identity_map.iter() {
            entity.meta().relations.clear();
        }
        for entity in self
            .uow
            .new_entities()
            .iter()
            .chain(self.uow.removed_entities())
        {
            entity.meta().relations.clear();
        }
    }
}

// ============================================================================
// Query
// ============================================================================

/// A query over entities of type `M`, built by [`Session::query`].
pub struct Query<'s, C: Connection, M: Model> {
    session: &'s mut Session<C>,
    select: Select,
    strategies: Vec<(String, LoadStrategy)>,
    /// First error hit while building; reported on execution.
    error: Option<Error>,
    _model: PhantomData<fn() -> M>,
}

impl<C: Connection, M: Model> Query<'_, C, M> {
    /// Add a WHERE condition, ANDed with earlier ones.
    #[must_use]
    pub fn filter(mut self, expr: Expr) -> Self {
        self.select = self.select.filter(expr);
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.select = self.select.order_by(order);
        self
    }

    #[must_use]
    pub fn limit(mut self, n: u64) -> Self {
        self.select = self.select.limit(n);
        self
    }

    #[must_use]
    pub fn offset(mut self, n: u64) -> Self {
        self.select = self.select.offset(n);
        self
    }

    /// Load `relationship` with `strategy` instead of its default.
    #[must_use]
    pub fn with_strategy(mut self, relationship: &str, strategy: LoadStrategy) -> Self {
        let known = self
            .session
            .registry
            .require(M::TABLE_NAME)
            .and_then(|desc| desc.require_relationship(relationship).map(|_| ()));
        match known {
            Ok(()) => {
                self.strategies.retain(|(name, _)| name != relationship);
                self.strategies.push((relationship.to_string(), strategy));
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// [`with_strategy`](Self::with_strategy) with the strategy given by
    /// name (`"join"`, `"batched-in"`, ...).
    #[must_use]
    pub fn with_strategy_named(self, relationship: &str, strategy: &str) -> Self {
        match strategy.parse::<LoadStrategy>() {
            Ok(strategy) => self.with_strategy(relationship, strategy),
            Err(e) => {
                let mut query = self;
                query.error.get_or_insert(e);
                query
            }
        }
    }

    /// Run the query.
    #[tracing::instrument(level = "debug", skip_all, fields(table = M::TABLE_NAME))]
    pub async fn all(self, cx: &Cx) -> Outcome<Vec<EntityRef<M>>, Error> {
        let Query {
            session,
            select,
            strategies,
            error,
            ..
        } = self;
        if let Some(e) = error {
            return Outcome::Err(e);
        }
        let registry = Arc::clone(&session.registry);
        let desc = match registry.require(M::TABLE_NAME) {
            Ok(desc) => desc,
            Err(e) => return Outcome::Err(e),
        };
        let mut eager = session.default_eager(desc);
        for (name, strategy) in strategies {
            eager.retain(|(n, _)| *n != name);
            if strategy.is_eager() {
                eager.push((name, strategy));
            }
        }
        match session.load_owners(cx, M::TABLE_NAME, select, eager).await {
            Outcome::Ok(owners) => Outcome::Ok(
                owners
                    .iter()
                    .filter_map(ManagedEntity::downcast::<M>)
                    .collect(),
            ),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// First match, if any.
    pub async fn first(self, cx: &Cx) -> Outcome<Option<EntityRef<M>>, Error> {
        match self.limit(1).all(cx).await {
            Outcome::Ok(found) => Outcome::Ok(found.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Exactly one match; none is `NotFound`, more than one is an error.
    pub async fn one(self, cx: &Cx) -> Outcome<EntityRef<M>, Error> {
        match self.limit(2).all(cx).await {
            Outcome::Ok(found) => {
                let mut found = found.into_iter();
                match (found.next(), found.next()) {
                    (Some(entity), None) => Outcome::Ok(entity),
                    (None, _) => Outcome::Err(Error::NotFound(NotFoundError {
                        table: M::TABLE_NAME.to_string(),
                        key: Vec::new(),
                    })),
                    (Some(_), Some(_)) => Outcome::Err(Error::Custom(format!(
                        "query on '{}' returned more than one row",
                        M::TABLE_NAME
                    ))),
                }
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDebugInfo {
    /// Entities in the identity map.
    pub tracked: usize,
    /// Entities pending INSERT.
    pub pending_new: usize,
    /// Entities pending DELETE.
    pub pending_delete: usize,
    /// Entities opened for writing since the last flush.
    pub pending_dirty: usize,
    /// Pending many-to-many link changes.
    pub pending_links: usize,
    pub in_transaction: bool,
    pub closed: bool,
}

// ============================================================================
// Unit Tests
// ============================================================================
