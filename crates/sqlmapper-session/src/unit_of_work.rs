//! Unit of Work: pending changes and the flush plan computed from them.
//!
//! The unit of work tracks:
//! - entities added to the session (INSERT)
//! - entities marked for removal (DELETE)
//! - many-to-many membership changes (join-table rows)
//!
//! Updates are not queued. At flush time every entity opened for writing is
//! compared with the snapshot taken when it was loaded or last flushed, and
//! only columns whose values differ are written.
//!
//! Inserts are ordered so that a row whose foreign key references another
//! pending row comes after it; ties keep registration order. Deletes use the
//! same ordering, reversed.

use crate::entity::{EntityState, ManagedEntity};
use crate::flush::{
    DeleteOp, FlushExecution, FlushPlan, InsertOp, LinkAction, LinkOp, UpdateOp, VersionStamp,
};
use crate::identity_map::{IdentityKey, IdentityMap, same_value};
use sqlmapper_core::{ConfigErrorKind, Error, Result, Row, Value};
use sqlmapper_schema::{EntityDescriptor, SchemaRegistry};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Pending work, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub new: usize,
    pub removed: usize,
    pub links: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.removed + self.links
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Entities and memberships waiting for the next flush.
#[derive(Debug, Default)]
pub(crate) struct UnitOfWork {
    new: Vec<ManagedEntity>,
    removed: Vec<ManagedEntity>,
    links: Vec<LinkOp>,
}

/// One row taking part in dependency ordering.
struct Node<'a> {
    table: &'static str,
    values: &'a [Value],
    seq: u64,
}

impl UnitOfWork {
    pub(crate) fn track_new(&mut self, entity: ManagedEntity) {
        self.new.push(entity);
    }

    /// Drop a pending insert. Returns whether it was pending.
    pub(crate) fn forget_new(&mut self, entity: &ManagedEntity) -> bool {
        let before = self.new.len();
        self.new.retain(|e| !e.ptr_eq(entity));
        self.links
            .retain(|op| !op.owner.ptr_eq(entity) && !op.target.ptr_eq(entity));
        before != self.new.len()
    }

    pub(crate) fn track_removed(&mut self, entity: ManagedEntity) {
        if !self.removed.iter().any(|e| e.ptr_eq(&entity)) {
            self.removed.push(entity);
        }
    }

    /// Queue a membership change. A pending change in the opposite direction
    /// for the same pair cancels out instead.
    pub(crate) fn track_link(&mut self, op: LinkOp) {
        if let Some(pos) = self.links.iter().position(|p| p.same_pair(&op)) {
            if self.links[pos].action != op.action {
                self.links.remove(pos);
            }
            return;
        }
        self.links.push(op);
    }

    pub(crate) fn counts(&self) -> PendingCounts {
        PendingCounts {
            new: self.new.len(),
            removed: self.removed.len(),
            links: self.links.len(),
        }
    }

    pub(crate) fn new_entities(&self) -> &[ManagedEntity] {
        &self.new
    }

    pub(crate) fn removed_entities(&self) -> &[ManagedEntity] {
        &self.removed
    }

    pub(crate) fn clear(&mut self) {
        self.new.clear();
        self.removed.clear();
        self.links.clear();
    }

    /// Compute the statements the next flush must run.
    ///
    /// Nothing is modified; a failed flush can be planned again.
    #[allow(clippy::result_large_err)]
    pub(crate) fn plan(
        &self,
        registry: &SchemaRegistry,
        identity_map: &IdentityMap,
    ) -> Result<FlushPlan> {
        let mut plan = FlushPlan::default();

        // Inserts
        let mut pending = Vec::with_capacity(self.new.len());
        for entity in &self.new {
            let desc = registry.require(entity.table())?;
            let mut values = entity.project(desc)?;
            if let Some(index) = desc.version().and_then(|v| desc.column_index(v)) {
                if values[index].is_null() {
                    values[index] = Value::Null.incremented()?;
                }
            }
            let generated = desc.key_values(&values).iter().all(Value::is_null);
            let seq = entity.meta().seq;
            pending.push((entity.clone(), values, generated, seq));
        }
        let nodes: Vec<Node<'_>> = pending
            .iter()
            .map(|(entity, values, _, seq)| Node {
                table: entity.table(),
                values,
                seq: *seq,
            })
            .collect();
        let order = dependency_order(registry, &nodes)?;
        let mut slots: Vec<Option<_>> = pending.into_iter().map(Some).collect();
        for i in order {
            if let Some((entity, values, generated, _)) = slots[i].take() {
                plan.inserts.push(InsertOp {
                    entity,
                    values,
                    generated,
                });
            }
        }

        // Updates
        let mut updates = Vec::new();
        for (key, entity) in identity_map.iter() {
            if entity.state() != EntityState::Dirty {
                continue;
            }
            let desc = registry.require(entity.table())?;
            let (snapshot, seq) = {
                let meta = entity.meta();
                (meta.snapshot.clone(), meta.seq)
            };
            let Some(snapshot) = snapshot else {
                continue;
            };
            let current = entity.project(desc)?;
            if let Some(op) = diff(desc, key, entity, &snapshot, current)? {
                updates.push((seq, op));
            }
        }
        updates.sort_by_key(|(seq, _)| *seq);
        plan.updates = updates.into_iter().map(|(_, op)| op).collect();

        // Links
        plan.links.clone_from(&self.links);

        // Deletes
        let mut doomed = Vec::with_capacity(self.removed.len());
        for entity in &self.removed {
            let desc = registry.require(entity.table())?;
            let (snapshot, key, seq) = {
                let meta = entity.meta();
                (
                    meta.snapshot.clone(),
                    meta.key.as_ref().map(|k| k.values().to_vec()),
                    meta.seq,
                )
            };
            let values = match snapshot {
                Some(values) => values,
                None => entity.project(desc)?,
            };
            let key = key.unwrap_or_else(|| desc.key_values(&values));
            let version = desc.version().and_then(|column| {
                desc.value_of(&values, column)
                    .map(|v| (column.to_string(), v.clone()))
            });
            doomed.push((entity.clone(), values, key, version, seq));
        }
        let nodes: Vec<Node<'_>> = doomed
            .iter()
            .map(|(entity, values, _, _, seq)| Node {
                table: entity.table(),
                values,
                seq: *seq,
            })
            .collect();
        let order = dependency_order(registry, &nodes)?;
        let mut slots: Vec<Option<_>> = doomed.into_iter().map(Some).collect();
        for i in order.into_iter().rev() {
            if let Some((entity, _, key, version, _)) = slots[i].take() {
                plan.deletes.push(DeleteOp {
                    entity,
                    key,
                    version,
                });
            }
        }

        tracing::debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            links = plan.links.len(),
            deletes = plan.deletes.len(),
            "Computed flush plan"
        );
        Ok(plan)
    }

    /// Bring entity state in line with a successfully executed plan.
    ///
    /// Returned rows are decoded and identity keys checked before any entity
    /// is touched. On error nothing has changed.
    #[allow(clippy::result_large_err)]
    pub(crate) fn apply(
        &mut self,
        plan: &FlushPlan,
        execution: &FlushExecution,
        registry: &SchemaRegistry,
        identity_map: &mut IdentityMap,
    ) -> Result<()> {
        let mut inserted = Vec::with_capacity(plan.inserts.len());
        let mut claimed: HashSet<IdentityKey> = HashSet::new();
        for op in &plan.inserts {
            let desc = registry.require(op.entity.table())?;
            let (fresh, snapshot) = if let Some(row) = execution.returned.get(&op.entity.addr()) {
                let decoded = op.entity.decode(row)?;
                let snapshot = decoded.project(desc)?;
                (Some(decoded), snapshot)
            } else if desc.version().is_some() {
                (
                    Some(op.entity.decode(&row_of(desc, &op.values))?),
                    op.values.clone(),
                )
            } else {
                (None, op.values.clone())
            };
            let key = IdentityKey::new(desc.table(), desc.key_values(&snapshot));
            identity_map.check(&key, &op.entity)?;
            if !claimed.insert(key.clone()) {
                return Err(Error::config(
                    ConfigErrorKind::IdentityConflict,
                    format!("flush inserted two instances for {key}"),
                ));
            }
            inserted.push((&op.entity, fresh, key, snapshot));
        }

        let mut updated = Vec::with_capacity(plan.updates.len());
        for op in &plan.updates {
            let fresh = match op.version {
                Some(_) => {
                    let desc = registry.require(op.entity.table())?;
                    Some(op.entity.decode(&row_of(desc, &op.values))?)
                }
                None => None,
            };
            updated.push((op, fresh));
        }

        for (entity, fresh, key, snapshot) in inserted {
            if let Some(fresh) = fresh {
                entity.install(fresh);
            }
            identity_map.insert(key.clone(), entity.clone());
            let mut meta = entity.meta();
            meta.key = Some(key);
            meta.snapshot = Some(snapshot);
            meta.state = EntityState::Persistent;
        }

        for (op, fresh) in updated {
            if let Some(fresh) = fresh {
                op.entity.install(fresh);
            }
            let mut meta = op.entity.meta();
            meta.snapshot = Some(op.values.clone());
            meta.state = EntityState::Persistent;
        }

        // Opened for writing but unchanged
        for (_, entity) in identity_map.iter() {
            let mut meta = entity.meta();
            if meta.state == EntityState::Dirty {
                meta.state = EntityState::Persistent;
            }
        }

        for op in &plan.deletes {
            let key = op.entity.meta().key.clone();
            if let Some(key) = key {
                identity_map.evict(&key);
            }
            op.entity.meta().detach();
        }

        self.clear();
        Ok(())
    }
}

/// Changed columns of one entity, or `None` if nothing changed.
#[allow(clippy::result_large_err)]
fn diff(
    desc: &EntityDescriptor,
    key: &IdentityKey,
    entity: &ManagedEntity,
    snapshot: &[Value],
    mut current: Vec<Value>,
) -> Result<Option<UpdateOp>> {
    let version_index = desc.version().and_then(|v| desc.column_index(v));
    let columns: Vec<usize> = current
        .iter()
        .zip(snapshot)
        .enumerate()
        .filter(|&(i, (now, then))| Some(i) != version_index && !same_value(now, then))
        .map(|(i, _)| i)
        .collect();
    if columns.is_empty() {
        return Ok(None);
    }
    if let Some(&i) = columns.iter().find(|&&i| desc.columns()[i].primary_key) {
        return Err(Error::config(
            ConfigErrorKind::Invalid,
            format!(
                "primary key column '{}' of {key} was modified",
                desc.columns()[i].name
            ),
        ));
    }

    let version = match (desc.version(), version_index) {
        (Some(column), Some(index)) => {
            let expected = snapshot[index].clone();
            let next = expected.incremented()?;
            current[index] = next.clone();
            Some(VersionStamp {
                column: column.to_string(),
                expected,
                next,
            })
        }
        _ => None,
    };

    tracing::trace!(key = %key, changed = columns.len(), "Entity changed");
    Ok(Some(UpdateOp {
        entity: entity.clone(),
        key: key.values().to_vec(),
        columns,
        values: current,
        version,
    }))
}

fn row_of(desc: &EntityDescriptor, values: &[Value]) -> Row {
    Row::new(
        desc.column_names().map(str::to_string).collect(),
        values.to_vec(),
    )
}

/// Indexes of `nodes`, referenced rows before the rows referencing them.
///
/// Edges come from foreign keys whose value matches the primary key of
/// another node. Ties are broken by `seq`.
#[allow(clippy::result_large_err)]
fn dependency_order(registry: &SchemaRegistry, nodes: &[Node<'_>]) -> Result<Vec<usize>> {
    let mut by_key: HashMap<IdentityKey, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        let desc = registry.require(node.table)?;
        let key = IdentityKey::new(node.table, desc.key_values(node.values));
        if !key.has_null() {
            by_key.insert(key, i);
        }
    }

    let mut indegree = vec![0_usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let desc = registry.require(node.table)?;
        for fk in registry.foreign_keys(node.table) {
            let Some(value) = desc.value_of(node.values, &fk.column) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let target = IdentityKey::new(fk.target_table.as_str(), vec![value.clone()]);
            if let Some(&j) = by_key.get(&target) {
                if j != i {
                    indegree[i] += 1;
                    dependents[j].push(i);
                }
            }
        }
    }

    let mut ready: BTreeSet<(u64, usize)> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| (nodes[i].seq, i))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some((_, i)) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.insert((nodes[d].seq, d));
            }
        }
    }

    if order.len() < nodes.len() {
        let mut tables: Vec<&str> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| nodes[i].table)
            .collect();
        tables.sort_unstable();
        tables.dedup();
        return Err(Error::config(
            ConfigErrorKind::DependencyCycle,
            format!("Dependency cycle detected: {}", tables.join(" -> ")),
        ));
    }
    Ok(order)
}

/// Membership change queued by `link` / `unlink`.
pub(crate) fn link_op(
    action: LinkAction,
    relationship: &str,
    join: sqlmapper_schema::JoinTable,
    owner: &ManagedEntity,
    target: &ManagedEntity,
) -> LinkOp {
    LinkOp {
        action,
        relationship: relationship.to_string(),
        join,
        owner: owner.clone(),
        target: target.clone(),
    }
}
