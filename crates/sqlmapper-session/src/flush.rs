//! Flush plan execution.
//!
//! A [`FlushPlan`] is computed by the unit of work and executed here, one
//! statement at a time, in this order:
//!
//! 1. INSERT, referenced rows before the rows referencing them
//! 2. UPDATE of changed columns only, with a version predicate when the
//!    entity is versioned
//! 3. many-to-many link rows: inserts, then deletes
//! 4. DELETE, dependents before the rows they reference
//!
//! Execution stops at the first failure. The caller owns the transaction
//! and rolls it back; no entity state is touched here.

use crate::entity::ManagedEntity;
use asupersync::{Cx, Outcome};
use sqlmapper_core::{
    ConcurrencyConflictError, Connection, ConstraintViolationError, Error, Row, Value,
};
use sqlmapper_query::{Delete, Expr, Insert, Statement, entity};
use sqlmapper_schema::{EntityDescriptor, JoinTable, SchemaRegistry};
use std::collections::HashMap;

/// A row to insert.
#[derive(Debug)]
pub(crate) struct InsertOp {
    pub(crate) entity: ManagedEntity,
    /// Values in descriptor order, version column already stamped.
    pub(crate) values: Vec<Value>,
    /// Primary key left to the database; the row comes back via RETURNING.
    pub(crate) generated: bool,
}

/// Version predicate and bump for a versioned entity.
#[derive(Debug, Clone)]
pub(crate) struct VersionStamp {
    pub(crate) column: String,
    pub(crate) expected: Value,
    pub(crate) next: Value,
}

/// Changed columns of one persistent entity.
#[derive(Debug)]
pub(crate) struct UpdateOp {
    pub(crate) entity: ManagedEntity,
    pub(crate) key: Vec<Value>,
    /// Indexes of changed columns, in descriptor order.
    pub(crate) columns: Vec<usize>,
    /// Full row after the update, version bumped.
    pub(crate) values: Vec<Value>,
    pub(crate) version: Option<VersionStamp>,
}

/// A row to delete.
#[derive(Debug)]
pub(crate) struct DeleteOp {
    pub(crate) entity: ManagedEntity,
    pub(crate) key: Vec<Value>,
    pub(crate) version: Option<(String, Value)>,
}

/// Direction of a many-to-many membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Link,
    Unlink,
}

/// A pending join-table row insert or delete.
///
/// Keys are resolved at execution time so that links to entities inserted
/// in the same flush (including generated keys) work.
#[derive(Debug, Clone)]
pub(crate) struct LinkOp {
    pub(crate) action: LinkAction,
    pub(crate) relationship: String,
    pub(crate) join: JoinTable,
    pub(crate) owner: ManagedEntity,
    pub(crate) target: ManagedEntity,
}

impl LinkOp {
    /// Same membership row, regardless of direction.
    pub(crate) fn same_pair(&self, other: &LinkOp) -> bool {
        self.relationship == other.relationship
            && self.join.table == other.join.table
            && self.owner.ptr_eq(&other.owner)
            && self.target.ptr_eq(&other.target)
    }
}

/// Statements issued by one flush, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Join-table rows inserted.
    pub linked: usize,
    /// Join-table rows deleted.
    pub unlinked: usize,
}

impl FlushResult {
    /// Total number of statements executed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.linked + self.unlinked
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// What a successful execution hands back to the unit of work.
#[derive(Debug, Default)]
pub(crate) struct FlushExecution {
    pub(crate) result: FlushResult,
    /// Rows returned for generated-key inserts, by entity address.
    pub(crate) returned: HashMap<usize, Row>,
}

/// Ordered statements for one flush.
#[derive(Debug, Default)]
pub(crate) struct FlushPlan {
    pub(crate) inserts: Vec<InsertOp>,
    pub(crate) updates: Vec<UpdateOp>,
    pub(crate) links: Vec<LinkOp>,
    pub(crate) deletes: Vec<DeleteOp>,
}

/// Attach identity context to driver constraint errors.
pub(crate) fn wrap_constraint(err: Error, table: &str, key: &[Value]) -> Error {
    match err {
        Error::Query(q) => match q.constraint_kind() {
            Some(kind) => Error::Constraint(ConstraintViolationError {
                kind,
                table: table.to_string(),
                key: key.to_vec(),
                source: q,
            }),
            None => Error::Query(q),
        },
        other => other,
    }
}

fn key_from_row(desc: &EntityDescriptor, row: &Row) -> Vec<Value> {
    desc.primary_key()
        .into_iter()
        .map(|col| row.get_by_name(col).cloned().unwrap_or(Value::Null))
        .collect()
}

impl FlushPlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.links.is_empty()
            && self.deletes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.links.len() + self.deletes.len()
    }

    /// Run one statement, returning rows affected.
    async fn run<C: Connection>(
        cx: &Cx,
        conn: &C,
        statement: Statement,
        table: &str,
        key: &[Value],
    ) -> Outcome<u64, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        match statement.execute(cx, conn).await {
            Outcome::Ok(n) => Outcome::Ok(n),
            Outcome::Err(e) => Outcome::Err(wrap_constraint(e, table, key)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Key of a link endpoint: its identity, or the key generated earlier in
    /// this flush.
    fn link_key(
        entity: &ManagedEntity,
        generated: &HashMap<usize, Vec<Value>>,
    ) -> Result<Value, Error> {
        let key = generated
            .get(&entity.addr())
            .cloned()
            .or_else(|| entity.key())
            .unwrap_or_default();
        match key.as_slice() {
            [value] if !value.is_null() => Ok(value.clone()),
            _ => Err(Error::detached(
                Some(entity.table()),
                None,
                "many-to-many endpoint has no persisted key",
            )),
        }
    }

    /// Execute every statement of the plan in order.
    #[tracing::instrument(level = "debug", skip_all, fields(statements = self.len()))]
    pub(crate) async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        registry: &SchemaRegistry,
    ) -> Outcome<FlushExecution, Error> {
        let mut execution = FlushExecution::default();
        let mut generated: HashMap<usize, Vec<Value>> = HashMap::new();

        // 1. Inserts, dependencies first
        for op in &self.inserts {
            let desc = match registry.require(op.entity.table()) {
                Ok(desc) => desc,
                Err(e) => return Outcome::Err(e),
            };
            let key = desc.key_values(&op.values);
            let statement = Statement::from(entity::insert(desc, &op.values, op.generated));

            if op.generated {
                if let Some(reason) = cx.cancel_reason() {
                    return Outcome::Cancelled(reason);
                }
                let rows = match statement.fetch(cx, conn).await {
                    Outcome::Ok(rows) => rows,
                    Outcome::Err(e) => return Outcome::Err(wrap_constraint(e, desc.table(), &key)),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                let Some(row) = rows.into_iter().next() else {
                    return Outcome::Err(Error::Custom(format!(
                        "INSERT into '{}' returned no row",
                        desc.table()
                    )));
                };
                generated.insert(op.entity.addr(), key_from_row(desc, &row));
                execution.returned.insert(op.entity.addr(), row);
            } else {
                match Self::run(cx, conn, statement, desc.table(), &key).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            execution.result.inserted += 1;
        }

        // 2. Updates
        for op in &self.updates {
            let desc = match registry.require(op.entity.table()) {
                Ok(desc) => desc,
                Err(e) => return Outcome::Err(e),
            };
            let changes: Vec<(&str, Value)> = op
                .columns
                .iter()
                .map(|&i| (desc.columns()[i].name.as_str(), op.values[i].clone()))
                .collect();
            let version = op.version.as_ref().map(|v| {
                (
                    entity::VersionCheck {
                        column: &v.column,
                        expected: &v.expected,
                    },
                    v.next.clone(),
                )
            });
            let statement = Statement::from(entity::update(desc, &op.key, &changes, version));

            let affected = match Self::run(cx, conn, statement, desc.table(), &op.key).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let (0, Some(v)) = (affected, &op.version) {
                return Outcome::Err(Error::Concurrency(ConcurrencyConflictError {
                    table: desc.table().to_string(),
                    key: op.key.clone(),
                    expected_version: v.expected.clone(),
                }));
            }
            execution.result.updated += 1;
        }

        // 3. Link rows: inserts, then deletes
        for action in [LinkAction::Link, LinkAction::Unlink] {
            for op in self.links.iter().filter(|op| op.action == action) {
                let owner = match Self::link_key(&op.owner, &generated) {
                    Ok(v) => v,
                    Err(e) => return Outcome::Err(e),
                };
                let target = match Self::link_key(&op.target, &generated) {
                    Ok(v) => v,
                    Err(e) => return Outcome::Err(e),
                };
                let key = [owner.clone(), target.clone()];
                let statement = match action {
                    LinkAction::Link => Statement::from(
                        Insert::into(op.join.table.as_str())
                            .value(op.join.owner_column.as_str(), owner)
                            .value(op.join.target_column.as_str(), target),
                    ),
                    LinkAction::Unlink => Statement::from(
                        Delete::from(op.join.table.as_str())
                            .filter(Expr::col(op.join.owner_column.as_str()).eq(owner))
                            .filter(Expr::col(op.join.target_column.as_str()).eq(target)),
                    ),
                };
                match Self::run(cx, conn, statement, &op.join.table, &key).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                match action {
                    LinkAction::Link => execution.result.linked += 1,
                    LinkAction::Unlink => execution.result.unlinked += 1,
                }
            }
        }

        // 4. Deletes, dependents first
        for op in &self.deletes {
            let desc = match registry.require(op.entity.table()) {
                Ok(desc) => desc,
                Err(e) => return Outcome::Err(e),
            };
            let check = op.version.as_ref().map(|(column, expected)| entity::VersionCheck {
                column,
                expected,
            });
            let statement = Statement::from(entity::delete(desc, &op.key, check));

            let affected = match Self::run(cx, conn, statement, desc.table(), &op.key).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let (0, Some((_, expected))) = (affected, &op.version) {
                return Outcome::Err(Error::Concurrency(ConcurrencyConflictError {
                    table: desc.table().to_string(),
                    key: op.key.clone(),
                    expected_version: expected.clone(),
                }));
            }
            execution.result.deleted += 1;
        }

        Outcome::Ok(execution)
    }
}
