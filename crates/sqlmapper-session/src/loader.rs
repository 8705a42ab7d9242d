//! Relationship loading.
//!
//! Owners are loaded with one statement; each eager association then costs
//! at most one more:
//!
//! | strategy     | statements for N owners                         |
//! |--------------|-------------------------------------------------|
//! | `join`       | folded into the owner statement (LEFT JOIN)     |
//! | `subquery`   | 1, `IN (SELECT ...)` repeating the owner query  |
//! | `batched-in` | 1, `IN (...)` over the loaded owner keys        |
//! | `lazy`       | 1 per owner, on access                          |
//! | `forbidden`  | 0; access fails                                 |
//!
//! Every row passes through the identity map before it is attached, so a
//! target reached from several owners is one instance.

use crate::Session;
use crate::entity::{EntityRef, EntityState, ManagedEntity};
use crate::identity_map::IdentityKey;
use asupersync::{Cx, Outcome};
use sqlmapper_core::{ConfigErrorKind, Connection, Error, LazyLoadForbiddenError, Model, Result, Row, Value};
use sqlmapper_query::{Expr, Join, Select, SelectItem, Statement, entity};
use sqlmapper_schema::{EntityDescriptor, KeyLocation, LoadStrategy, RelationshipDescriptor};
use std::collections::{HashMap, HashSet};
use std::panic::Location;
use std::sync::Arc;

/// Column carrying the owner key in many-to-many result rows.
const OWNER_KEY_COLUMN: &str = "__owner_key";

/// Which owners a secondary statement covers.
#[derive(Clone, Copy)]
enum OwnerScope<'a> {
    /// The given owners, by key.
    Keys,
    /// Every owner the statement selects, as a sub-select.
    Subquery(&'a Select),
}

fn referenced_key(desc: &EntityDescriptor) -> Result<&str> {
    desc.single_primary_key().ok_or_else(|| {
        Error::config(
            ConfigErrorKind::InvalidRelationship,
            format!("'{}' has a composite primary key and cannot be referenced", desc.table()),
        )
    })
}

fn push_unique(targets: &mut Vec<ManagedEntity>, entity: ManagedEntity) {
    if !targets.iter().any(|t| t.ptr_eq(&entity)) {
        targets.push(entity);
    }
}

impl<C: Connection> Session<C> {
    /// Run a SELECT inside the session's transaction.
    pub(crate) async fn fetch(&mut self, cx: &Cx, select: Select) -> Outcome<Vec<Row>, Error> {
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let statement = Statement::from(select);
        statement.fetch(cx, &self.connection).await
    }

    /// Resolve a row to its managed entity.
    ///
    /// A tracked identity wins over the row, except that an expired entity
    /// is refreshed from it. Returns `None` for rows with a NULL key, such
    /// as the unmatched side of a LEFT JOIN.
    pub(crate) fn hydrate_row(&mut self, table: &str, row: &Row) -> Result<Option<ManagedEntity>> {
        let registry = Arc::clone(&self.registry);
        let desc = registry.require(table)?;
        let key: Vec<Value> = desc
            .primary_key()
            .into_iter()
            .map(|col| row.get_by_name(col).cloned().unwrap_or(Value::Null))
            .collect();
        if key.iter().any(Value::is_null) {
            return Ok(None);
        }
        let identity = IdentityKey::new(desc.table(), key);

        if let Some(existing) = self.identity_map.lookup(&identity) {
            if existing.state() == EntityState::Expired {
                existing.hydrate(row)?;
                let snapshot = existing.project(desc)?;
                let mut meta = existing.meta();
                meta.snapshot = Some(snapshot);
                meta.state = EntityState::Persistent;
            }
            return Ok(Some(existing));
        }

        let hydrator = self.hydrator(desc.table())?;
        let entity = hydrator(row)?;
        let snapshot = entity.project(desc)?;
        let seq = self.next_seq();
        {
            let mut meta = entity.meta();
            meta.attach(EntityState::Persistent, self.id, seq);
            meta.key = Some(identity.clone());
            meta.snapshot = Some(snapshot);
        }
        self.identity_map.register(identity, entity.clone())?;
        Ok(Some(entity))
    }

    /// Load the owners selected by `select`, then resolve `eager`
    /// associations on them.
    #[tracing::instrument(level = "debug", skip(self, cx, select, eager))]
    pub(crate) async fn load_owners(
        &mut self,
        cx: &Cx,
        table: &str,
        select: Select,
        eager: Vec<(String, LoadStrategy)>,
    ) -> Outcome<Vec<ManagedEntity>, Error> {
        let registry = Arc::clone(&self.registry);
        let desc = match registry.require(table) {
            Ok(desc) => desc,
            Err(e) => return Outcome::Err(e),
        };

        let mut joined = Vec::new();
        let mut secondary = Vec::new();
        for (name, strategy) in &eager {
            let rel = match desc.require_relationship(name) {
                Ok(rel) => rel,
                Err(e) => return Outcome::Err(e),
            };
            // Fail before any statement if a target cannot be hydrated
            if let Err(e) = self.hydrator(&rel.target) {
                return Outcome::Err(e);
            }
            match strategy {
                LoadStrategy::Join => joined.push(rel),
                LoadStrategy::Subquery | LoadStrategy::BatchedIn => secondary.push((rel, *strategy)),
                LoadStrategy::Lazy | LoadStrategy::Forbidden => {}
            }
        }

        let scope_select = if secondary.iter().any(|(_, s)| *s == LoadStrategy::Subquery) {
            Some(select.clone())
        } else {
            None
        };

        let owners = if joined.is_empty() {
            let rows = match self.fetch(cx, select).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let mut owners = Vec::with_capacity(rows.len());
            for row in &rows {
                match self.hydrate_row(desc.table(), row) {
                    Ok(Some(owner)) => push_unique(&mut owners, owner),
                    Ok(None) => {}
                    Err(e) => return Outcome::Err(e),
                }
            }
            owners
        } else {
            match self.load_joined(cx, desc, select, &joined).await {
                Outcome::Ok(owners) => owners,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        for (rel, strategy) in secondary {
            let scope = match (strategy, &scope_select) {
                (LoadStrategy::Subquery, Some(select)) => OwnerScope::Subquery(select),
                _ => OwnerScope::Keys,
            };
            match self.resolve_for_owners(cx, desc, rel, &owners, scope).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::debug!(table, owners = owners.len(), "Loaded entities");
        Outcome::Ok(
            owners
                .into_iter()
                .filter(|o| o.state() != EntityState::Removed)
                .collect(),
        )
    }

    /// One statement for the owners and every joined association.
    async fn load_joined(
        &mut self,
        cx: &Cx,
        desc: &EntityDescriptor,
        select: Select,
        joined: &[&RelationshipDescriptor],
    ) -> Outcome<Vec<ManagedEntity>, Error> {
        const BASE: &str = "t0";
        let registry = Arc::clone(&self.registry);

        // A windowed owner query becomes a derived table so LIMIT counts
        // owners, not joined rows.
        let mut statement = if select.is_windowed() {
            let ordering = select.ordering().to_vec();
            let mut outer = Select::from_derived(select, BASE);
            for order in ordering {
                outer = outer.order_by(order);
            }
            outer
        } else {
            select.alias(BASE)
        };
        let mut items = entity::aliased_columns(desc, BASE);

        let mut aliases = Vec::with_capacity(joined.len());
        for (i, rel) in joined.iter().enumerate() {
            let alias = format!("t{}", i + 1);
            let target = match registry.require(&rel.target) {
                Ok(target) => target,
                Err(e) => return Outcome::Err(e),
            };
            let target_pk = match referenced_key(target) {
                Ok(pk) => pk,
                Err(e) => return Outcome::Err(e),
            };
            match rel.key_location() {
                KeyLocation::Owner => {
                    statement = statement.join(
                        Join::left(
                            target.table(),
                            Expr::qualified(&alias, target_pk)
                                .eq(Expr::qualified(BASE, &rel.foreign_key)),
                        )
                        .alias(&alias),
                    );
                }
                KeyLocation::Target => {
                    let owner_pk = match referenced_key(desc) {
                        Ok(pk) => pk,
                        Err(e) => return Outcome::Err(e),
                    };
                    statement = statement.join(
                        Join::left(
                            target.table(),
                            Expr::qualified(&alias, &rel.foreign_key)
                                .eq(Expr::qualified(BASE, owner_pk)),
                        )
                        .alias(&alias),
                    );
                }
                KeyLocation::JoinTable => {
                    let (Some(jt), Ok(owner_pk)) = (&rel.join_table, referenced_key(desc)) else {
                        return Outcome::Err(Error::config(
                            ConfigErrorKind::InvalidRelationship,
                            format!("'{}' cannot be joined", rel.name),
                        ));
                    };
                    let link = format!("j{}", i + 1);
                    statement = statement
                        .join(
                            Join::left(
                                jt.table.as_str(),
                                Expr::qualified(&link, &jt.owner_column)
                                    .eq(Expr::qualified(BASE, owner_pk)),
                            )
                            .alias(&link),
                        )
                        .join(
                            Join::left(
                                target.table(),
                                Expr::qualified(&alias, target_pk)
                                    .eq(Expr::qualified(&link, &jt.target_column)),
                            )
                            .alias(&alias),
                        );
                }
            }
            items.extend(entity::aliased_columns(target, &alias));
            aliases.push(alias);
        }
        let statement = statement.project(items);

        let rows = match self.fetch(cx, statement).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let base_prefix = entity::column_prefix(BASE);
        let mut owners: Vec<ManagedEntity> = Vec::new();
        let mut collected: HashMap<usize, Vec<Vec<ManagedEntity>>> = HashMap::new();
        for row in &rows {
            let owner = match self.hydrate_row(desc.table(), &row.sub_row(&base_prefix)) {
                Ok(Some(owner)) => owner,
                Ok(None) => continue,
                Err(e) => return Outcome::Err(e),
            };
            let groups = collected
                .entry(owner.addr())
                .or_insert_with(|| vec![Vec::new(); joined.len()]);
            for (i, rel) in joined.iter().enumerate() {
                let sub = row.sub_row(&entity::column_prefix(&aliases[i]));
                match self.hydrate_row(&rel.target, &sub) {
                    Ok(Some(target)) if target.state() != EntityState::Removed => {
                        push_unique(&mut groups[i], target);
                    }
                    Ok(_) => {}
                    Err(e) => return Outcome::Err(e),
                }
            }
            push_unique(&mut owners, owner);
        }

        for owner in &owners {
            let Some(groups) = collected.remove(&owner.addr()) else {
                continue;
            };
            for (rel, targets) in joined.iter().zip(groups) {
                if owner.loaded(&rel.name).is_none() {
                    owner.set_loaded(&rel.name, targets);
                }
            }
        }
        tracing::debug!(
            table = desc.table(),
            rows = rows.len(),
            owners = owners.len(),
            relationships = joined.len(),
            "Loaded joined associations"
        );
        Outcome::Ok(owners)
    }

    /// Resolve `rel` on every owner in `owners` that has not resolved it
    /// yet, with at most one statement.
    async fn resolve_for_owners(
        &mut self,
        cx: &Cx,
        desc: &EntityDescriptor,
        rel: &RelationshipDescriptor,
        owners: &[ManagedEntity],
        scope: OwnerScope<'_>,
    ) -> Outcome<(), Error> {
        let pending: Vec<ManagedEntity> = owners
            .iter()
            .filter(|o| o.loaded(&rel.name).is_none())
            .cloned()
            .collect();
        if pending.is_empty() {
            return Outcome::Ok(());
        }
        let registry = Arc::clone(&self.registry);
        let target = match registry.require(&rel.target) {
            Ok(target) => target,
            Err(e) => return Outcome::Err(e),
        };
        let target_pk = match referenced_key(target) {
            Ok(pk) => pk,
            Err(e) => return Outcome::Err(e),
        };

        match rel.key_location() {
            KeyLocation::Owner => {
                // Foreign key values held by each owner
                let mut references = Vec::with_capacity(pending.len());
                let mut missing: Vec<Value> = Vec::new();
                for owner in &pending {
                    let value = match owner.project(desc) {
                        Ok(values) => desc
                            .value_of(&values, &rel.foreign_key)
                            .cloned()
                            .unwrap_or(Value::Null),
                        Err(e) => return Outcome::Err(e),
                    };
                    if !value.is_null() {
                        let identity = IdentityKey::new(target.table(), vec![value.clone()]);
                        let tracked = self
                            .identity_map
                            .lookup(&identity)
                            .is_some_and(|t| t.state().is_live());
                        if !tracked && !missing.iter().any(|m| crate::identity_map::same_value(m, &value)) {
                            missing.push(value.clone());
                        }
                    }
                    references.push(value);
                }

                if !missing.is_empty() {
                    let statement = match scope {
                        OwnerScope::Keys => entity::select_where_in(target, target_pk, missing),
                        OwnerScope::Subquery(owner_select) => entity::select_all(target).filter(
                            Expr::col(target_pk).in_subquery(owner_select.project(vec![SelectItem {
                                expr: Expr::col(&rel.foreign_key),
                                alias: None,
                            }])),
                        ),
                    };
                    let rows = match self.fetch(cx, statement).await {
                        Outcome::Ok(rows) => rows,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    for row in &rows {
                        if let Err(e) = self.hydrate_row(target.table(), row) {
                            return Outcome::Err(e);
                        }
                    }
                }

                for (owner, value) in pending.iter().zip(references) {
                    let resolved = if value.is_null() {
                        None
                    } else {
                        self.identity_map
                            .lookup(&IdentityKey::new(target.table(), vec![value]))
                            .filter(|t| t.state().is_live())
                    };
                    owner.set_loaded(&rel.name, resolved.into_iter().collect());
                }
            }

            KeyLocation::Target | KeyLocation::JoinTable => {
                let owner_pk = match referenced_key(desc) {
                    Ok(pk) => pk,
                    Err(e) => return Outcome::Err(e),
                };
                // Owners without a persisted key have nothing stored yet
                let mut by_key: HashMap<IdentityKey, usize> = HashMap::new();
                let mut keys = Vec::new();
                for (i, owner) in pending.iter().enumerate() {
                    if owner.state() == EntityState::New {
                        continue;
                    }
                    if let Some(key) = owner.key() {
                        by_key.insert(IdentityKey::new(desc.table(), key.clone()), i);
                        keys.extend(key);
                    }
                }
                let mut groups: Vec<Vec<ManagedEntity>> = vec![Vec::new(); pending.len()];

                if !keys.is_empty() {
                    let (statement, group_column) = match rel.key_location() {
                        KeyLocation::Target => {
                            let filter = match scope {
                                OwnerScope::Keys => Expr::col(&rel.foreign_key).in_list(keys),
                                OwnerScope::Subquery(owner_select) => Expr::col(&rel.foreign_key)
                                    .in_subquery(owner_select.project(vec![SelectItem {
                                        expr: Expr::col(owner_pk),
                                        alias: None,
                                    }])),
                            };
                            (
                                entity::select_all(target).filter(filter),
                                rel.foreign_key.as_str(),
                            )
                        }
                        _ => {
                            let Some(jt) = &rel.join_table else {
                                return Outcome::Err(Error::config(
                                    ConfigErrorKind::InvalidRelationship,
                                    format!("'{}' has no join table", rel.name),
                                ));
                            };
                            let owner_column = Expr::qualified("j", &jt.owner_column);
                            let filter = match scope {
                                OwnerScope::Keys => owner_column.clone().in_list(keys),
                                OwnerScope::Subquery(owner_select) => owner_column
                                    .clone()
                                    .in_subquery(owner_select.project(vec![SelectItem {
                                        expr: Expr::col(owner_pk),
                                        alias: None,
                                    }])),
                            };
                            let statement = Select::from(target.table())
                                .alias("t")
                                .columns(target.column_names())
                                .column_as(owner_column, OWNER_KEY_COLUMN)
                                .join(
                                    Join::inner(
                                        jt.table.as_str(),
                                        Expr::qualified("j", &jt.target_column)
                                            .eq(Expr::qualified("t", target_pk)),
                                    )
                                    .alias("j"),
                                )
                                .filter(filter);
                            (statement, OWNER_KEY_COLUMN)
                        }
                    };

                    let rows = match self.fetch(cx, statement).await {
                        Outcome::Ok(rows) => rows,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    for row in &rows {
                        let entity = match self.hydrate_row(target.table(), row) {
                            Ok(Some(entity)) => entity,
                            Ok(None) => continue,
                            Err(e) => return Outcome::Err(e),
                        };
                        if entity.state() == EntityState::Removed {
                            continue;
                        }
                        let Some(owner_key) = row.get_by_name(group_column) else {
                            continue;
                        };
                        let identity = IdentityKey::new(desc.table(), vec![owner_key.clone()]);
                        if let Some(&i) = by_key.get(&identity) {
                            push_unique(&mut groups[i], entity);
                        }
                    }
                }

                for (owner, targets) in pending.iter().zip(groups) {
                    owner.set_loaded(&rel.name, targets);
                }
            }
        }

        tracing::debug!(
            table = desc.table(),
            relationship = %rel.name,
            owners = pending.len(),
            "Resolved association"
        );
        Outcome::Ok(())
    }

    /// Resolve one association of one owner on access.
    #[tracing::instrument(level = "debug", skip(self, cx, owner, site), fields(table = owner.table()))]
    pub(crate) async fn load_relation(
        &mut self,
        cx: &Cx,
        owner: &ManagedEntity,
        name: &str,
        site: &'static Location<'static>,
    ) -> Outcome<Vec<ManagedEntity>, Error> {
        if let Err(e) = self.ensure_open().and_then(|()| self.check_owned(owner)) {
            return Outcome::Err(e);
        }
        if let Some(targets) = owner.loaded(name) {
            return Outcome::Ok(targets);
        }
        let registry = Arc::clone(&self.registry);
        let desc = match registry.require(owner.table()) {
            Ok(desc) => desc,
            Err(e) => return Outcome::Err(e),
        };
        let rel = match desc.require_relationship(name) {
            Ok(rel) => rel,
            Err(e) => return Outcome::Err(e),
        };
        if let Err(e) = self.hydrator(&rel.target) {
            return Outcome::Err(e);
        }

        let outcome = match rel.default_strategy {
            LoadStrategy::Forbidden => {
                return Outcome::Err(Error::LazyLoadForbidden(LazyLoadForbiddenError {
                    table: desc.table().to_string(),
                    relationship: rel.name.clone(),
                }));
            }
            LoadStrategy::Lazy => {
                if let Some(tracker) = &mut self.n1_tracker {
                    tracker.record_load_at(desc.table(), &rel.name, site);
                }
                self.resolve_for_owners(cx, desc, rel, std::slice::from_ref(owner), OwnerScope::Keys)
                    .await
            }
            LoadStrategy::Join => match owner.key() {
                Some(key) if owner.state() != EntityState::New => {
                    let select = entity::select_by_key(desc, &key);
                    match self
                        .load_owners(cx, desc.table(), select, vec![(rel.name.clone(), LoadStrategy::Join)])
                        .await
                    {
                        Outcome::Ok(_) => Outcome::Ok(()),
                        Outcome::Err(e) => Outcome::Err(e),
                        Outcome::Cancelled(r) => Outcome::Cancelled(r),
                        Outcome::Panicked(p) => Outcome::Panicked(p),
                    }
                }
                _ => Outcome::Ok(()),
            },
            LoadStrategy::Subquery | LoadStrategy::BatchedIn => {
                // Batch with every sibling still unresolved, in registration order
                let mut siblings: Vec<ManagedEntity> = self
                    .identity_map
                    .entities_of(desc.table())
                    .filter(|o| {
                        !o.ptr_eq(owner)
                            && matches!(
                                o.state(),
                                EntityState::Persistent | EntityState::Dirty | EntityState::Expired
                            )
                            && o.loaded(&rel.name).is_none()
                    })
                    .cloned()
                    .collect();
                siblings.sort_by_key(|o| o.meta().seq);
                let mut owners = vec![owner.clone()];
                owners.extend(siblings);
                self.resolve_for_owners(cx, desc, rel, &owners, OwnerScope::Keys)
                    .await
            }
        };
        match outcome {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let targets = owner.loaded(name).unwrap_or_default();
        if owner.loaded(name).is_none() {
            owner.set_loaded(name, targets.clone());
        }
        Outcome::Ok(targets)
    }

    /// Typed access-time load, used by [`Related::ensure_loaded`](crate::Related::ensure_loaded).
    pub(crate) async fn load_related<T: Model>(
        &mut self,
        cx: &Cx,
        owner: &ManagedEntity,
        name: &str,
        site: &'static Location<'static>,
    ) -> Outcome<Vec<EntityRef<T>>, Error> {
        if let Err(e) = self.learn::<T>() {
            return Outcome::Err(e);
        }
        let target = self
            .registry
            .require(owner.table())
            .and_then(|desc| desc.require_relationship(name).map(|rel| rel.target.clone()));
        match target {
            Ok(target) if target == T::TABLE_NAME => {}
            Ok(target) => {
                return Outcome::Err(Error::config(
                    ConfigErrorKind::InvalidRelationship,
                    format!(
                        "'{}.{name}' targets '{target}', not '{}'",
                        owner.table(),
                        T::TABLE_NAME
                    ),
                ));
            }
            Err(e) => return Outcome::Err(e),
        }
        match self.load_relation(cx, owner, name, site).await {
            Outcome::Ok(targets) => Outcome::Ok(
                targets
                    .iter()
                    .filter_map(ManagedEntity::downcast::<T>)
                    .collect(),
            ),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}
