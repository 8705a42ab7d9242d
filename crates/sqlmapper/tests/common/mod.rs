//! Shared fixtures for the scenario tests: a scripted storage driver and a
//! small blog schema (authors, articles, tags).

#![allow(dead_code, clippy::manual_async_fn)]

use sqlmapper::{
    ColumnDescriptor, ColumnType, Connection, Cx, Dialect, EntityDescriptor, Error,
    IsolationLevel, LoadStrategy, Model, Outcome, QueryError, QueryErrorKind,
    RelationshipDescriptor, Result, Row, SchemaRegistry, Session, TransactionHandle, Value,
};
use asupersync::types::CancelKind;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

// ==================== Mock driver ====================

#[derive(Debug, Default)]
pub struct MockState {
    /// Every statement run, in order.
    pub executed: Vec<(String, Vec<Value>)>,
    pub query_calls: usize,
    pub execute_calls: usize,
    /// Result sets handed out by `query`; an empty set once exhausted.
    pub rows: VecDeque<Vec<Row>>,
    /// Statements containing this text fail with a unique violation.
    pub fail_on: Option<String>,
    /// Statements containing this text suspend once before completing.
    pub stall_on: Option<String>,
    /// Once a statement containing this text runs, cancel the given context.
    pub cancel_after: Option<(String, Cx)>,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

impl MockState {
    pub fn statements(&self) -> Vec<&str> {
        self.executed.iter().map(|(sql, _)| sql.as_str()).collect()
    }

    pub fn statements_starting_with(&self, prefix: &str) -> Vec<&str> {
        self.statements()
            .into_iter()
            .filter(|sql| sql.starts_with(prefix))
            .collect()
    }

    fn record(&mut self, sql: &str, params: Vec<Value>) -> (Option<Error>, bool) {
        self.executed.push((sql.to_string(), params));
        let failure = self
            .fail_on
            .as_deref()
            .filter(|needle| sql.contains(needle))
            .map(|_| {
                Error::Query(QueryError {
                    kind: QueryErrorKind::Constraint,
                    sql: Some(sql.to_string()),
                    sqlstate: Some("23505".into()),
                    message: "duplicate key value violates unique constraint".into(),
                    detail: None,
                    source: None,
                })
            });
        let stall = self.stall_on.as_deref().is_some_and(|needle| sql.contains(needle));
        if let Some((needle, cx)) = &self.cancel_after {
            if sql.contains(needle.as_str()) {
                cx.cancel_with(CancelKind::User, Some("cancelled by test"));
            }
        }
        (failure, stall)
    }
}

/// Completes on its second poll.
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockConnection {
    pub state: Arc<Mutex<MockState>>,
    pub dialect: Dialect,
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let (failure, stall) = {
                let mut guard = state.lock().expect("lock poisoned");
                guard.query_calls += 1;
                guard.record(&sql, params)
            };
            if stall {
                YieldOnce(false).await;
            }
            if let Some(err) = failure {
                return Outcome::Err(err);
            }
            let mut guard = state.lock().expect("lock poisoned");
            Outcome::Ok(guard.rows.pop_front().unwrap_or_default())
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let (failure, stall) = {
                let mut guard = state.lock().expect("lock poisoned");
                guard.execute_calls += 1;
                guard.record(&sql, params)
            };
            if stall {
                YieldOnce(false).await;
            }
            match failure {
                Some(err) => Outcome::Err(err),
                None => Outcome::Ok(1),
            }
        }
    }

    fn begin(
        &self,
        _cx: &Cx,
        _isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<TransactionHandle, Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.begins += 1;
            Outcome::Ok(TransactionHandle::new(guard.begins as u64))
        }
    }

    fn commit(
        &self,
        _cx: &Cx,
        _tx: TransactionHandle,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").commits += 1;
            Outcome::Ok(())
        }
    }

    fn rollback(
        &self,
        _cx: &Cx,
        _tx: TransactionHandle,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").rollbacks += 1;
            Outcome::Ok(())
        }
    }
}

pub fn open(registry: SchemaRegistry) -> (Arc<Mutex<MockState>>, Session<MockConnection>) {
    let state = Arc::new(Mutex::new(MockState::default()));
    let conn = MockConnection {
        state: Arc::clone(&state),
        dialect: Dialect::Postgres,
    };
    (state, Session::new(conn, Arc::new(registry)))
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

// ==================== Models ====================

#[derive(Debug, Clone, PartialEq)]
pub struct Author {
    pub id: Option<i64>,
    pub name: String,
}

impl Author {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id: Some(id),
            name: name.to_string(),
        }
    }
}

impl Model for Author {
    const TABLE_NAME: &'static str = "authors";

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub author_id: Option<i64>,
}

impl Article {
    pub fn new(id: i64, title: &str, author_id: i64) -> Self {
        Self {
            id,
            title: title.to_string(),
            author_id: Some(author_id),
        }
    }
}

impl Model for Article {
    const TABLE_NAME: &'static str = "articles";

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("title", self.title.clone().into()),
            ("author_id", self.author_id.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            title: row.get_named("title")?,
            author_id: row.get_named("author_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub id: i64,
    pub label: String,
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

/// authors 1-* articles *-* tags, with `articles` loaded by `strategy`.
pub fn blog_registry(strategy: LoadStrategy) -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register_all(vec![
            EntityDescriptor::new("authors")
                .column(ColumnDescriptor::new("id", ColumnType::BigInt).primary_key())
                .column(ColumnDescriptor::new("name", ColumnType::Text))
                .relationship(
                    RelationshipDescriptor::one_to_many("articles", "articles", "author_id")
                        .strategy(strategy),
                ),
            EntityDescriptor::new("articles")
                .column(ColumnDescriptor::new("id", ColumnType::BigInt).primary_key())
                .column(ColumnDescriptor::new("title", ColumnType::Text))
                .column(ColumnDescriptor::new("author_id", ColumnType::BigInt).nullable())
                .relationship(RelationshipDescriptor::many_to_one(
                    "author", "authors", "author_id",
                ))
                .relationship(RelationshipDescriptor::many_to_many(
                    "tags",
                    "tags",
                    "article_tags",
                    "article_id",
                    "tag_id",
                )),
            EntityDescriptor::new("tags")
                .column(ColumnDescriptor::new("id", ColumnType::BigInt).primary_key())
                .column(ColumnDescriptor::new("label", ColumnType::Text)),
        ])
        .expect("valid blog schema");
    registry
}

// ==================== Rows ====================

pub fn author_row(id: i64, name: &str) -> Row {
    Row::new(
        vec!["id".into(), "name".into()],
        vec![Value::BigInt(id), Value::Text(name.into())],
    )
}

pub fn article_row(id: i64, author_id: i64) -> Row {
    Row::new(
        vec!["id".into(), "title".into(), "author_id".into()],
        vec![
            Value::BigInt(id),
            Value::Text(format!("Article {id}")),
            Value::BigInt(author_id),
        ],
    )
}

pub fn tag_row(id: i64, label: &str) -> Row {
    Row::new(
        vec!["id".into(), "label".into()],
        vec![Value::BigInt(id), Value::Text(label.into())],
    )
}

/// One row of `authors AS t0 LEFT JOIN articles AS t1`.
pub fn author_article_row(author: (i64, &str), article: Option<(i64, &str)>) -> Row {
    let (article_id, title, author_id) = match article {
        Some((id, title)) => (
            Value::BigInt(id),
            Value::Text(title.into()),
            Value::BigInt(author.0),
        ),
        None => (Value::Null, Value::Null, Value::Null),
    };
    Row::new(
        vec![
            "t0__id".into(),
            "t0__name".into(),
            "t1__id".into(),
            "t1__title".into(),
            "t1__author_id".into(),
        ],
        vec![
            Value::BigInt(author.0),
            Value::Text(author.1.into()),
            article_id,
            title,
            author_id,
        ],
    )
}

/// Ids of the targets of an association, sorted.
pub fn ids<M: Model>(entities: &[sqlmapper::EntityRef<M>], id: impl Fn(&M) -> i64) -> Vec<i64> {
    let mut ids: Vec<i64> = entities
        .iter()
        .map(|e| id(&*e.read().expect("attached entity")))
        .collect();
    ids.sort_unstable();
    ids
}
