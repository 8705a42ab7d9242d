mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{
    Article, Author, article_row, author_row, blog_registry, expect_err, open, unwrap_outcome,
};
use sqlmapper::prelude::*;
use asupersync::types::CancelKind;
use sqlmapper::{ConfigErrorKind, ConstraintKind};
use std::future::Future;
use std::pin::pin;
use std::task::{Context, Poll, Waker};

#[test]
fn dropped_flush_is_rolled_back_before_the_next_operation() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (state, mut session) = open(blog_registry(LoadStrategy::Lazy));
    state.lock().unwrap().stall_on = Some("INSERT INTO \"articles\"".into());

    let author = session.add(Author::new(1, "A")).unwrap();
    let article = session.add(Article::new(10, "T", 1)).unwrap();

    {
        let mut flush = pin!(session.flush(&cx));
        let mut poll_cx = Context::from_waker(Waker::noop());
        assert!(matches!(flush.as_mut().poll(&mut poll_cx), Poll::Pending));
        // Dropped while the article INSERT is in flight
    }
    {
        let guard = state.lock().unwrap();
        assert_eq!(guard.begins, 1);
        assert_eq!(guard.rollbacks, 0);
    }
    assert_eq!(author.state(), EntityState::New);
    assert_eq!(article.state(), EntityState::New);

    state.lock().unwrap().stall_on = None;
    rt.block_on(async {
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.inserted, 2);
    });
    assert_eq!(author.state(), EntityState::Persistent);
    assert_eq!(article.state(), EntityState::Persistent);

    let guard = state.lock().unwrap();
    assert_eq!(guard.rollbacks, 1);
    assert_eq!(guard.begins, 2);
    assert_eq!(guard.commits, 1);
    // Both inserts ran again in the fresh transaction
    assert_eq!(guard.statements_starting_with("INSERT").len(), 4);
}

#[test]
fn constraint_failure_keeps_pending_work_for_a_retry() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (state, mut session) = open(blog_registry(LoadStrategy::Lazy));
    state.lock().unwrap().rows.push_back(vec![article_row(10, 1)]);

    rt.block_on(async {
        let article = unwrap_outcome(session.get::<Article>(&cx, 10_i64).await);
        article.write().unwrap().title = "Edited".into();
        let author = session.add(Author::new(2, "B")).unwrap();

        state.lock().unwrap().fail_on = Some("INSERT INTO \"authors\"".into());
        match expect_err(session.commit(&cx).await) {
            Error::Constraint(e) => {
                assert_eq!(e.kind, ConstraintKind::Unique);
                assert_eq!(e.table, "authors");
                assert_eq!(e.key, vec![Value::BigInt(2)]);
                assert_eq!(e.source.sqlstate.as_deref(), Some("23505"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(author.state(), EntityState::New);
        assert_eq!(article.state(), EntityState::Dirty);
        assert_eq!(session.debug_info().pending_new, 1);
        assert!(!session.in_transaction());

        state.lock().unwrap().fail_on = None;
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.inserted, 1);
        assert_eq!(result.updated, 1);
        assert_eq!(author.state(), EntityState::Persistent);
        assert_eq!(article.state(), EntityState::Persistent);
    });

    let guard = state.lock().unwrap();
    assert_eq!(guard.rollbacks, 1);
    assert_eq!(guard.commits, 1);
}

#[test]
fn generated_key_clash_leaves_every_insert_pending() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (state, mut session) = open(blog_registry(LoadStrategy::Lazy));
    state.lock().unwrap().rows.push_back(vec![author_row(5, "A")]);

    rt.block_on(async {
        let existing = unwrap_outcome(session.get::<Author>(&cx, 5_i64).await);
        let explicit = session.add(Author::new(7, "B")).unwrap();
        let generated = session
            .add(Author {
                id: None,
                name: "C".into(),
            })
            .unwrap();

        // The database hands back a key this session already tracks
        state.lock().unwrap().rows.push_back(vec![author_row(5, "C")]);
        match expect_err(session.commit(&cx).await) {
            Error::Config(e) => assert_eq!(e.kind, ConfigErrorKind::IdentityConflict),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(explicit.state(), EntityState::New);
        assert_eq!(generated.state(), EntityState::New);
        assert_eq!(generated.read().unwrap().id, None);
        assert_eq!(existing.read().unwrap().name, "A");
        assert_eq!(session.identity_map().len(), 2);
        assert_eq!(session.debug_info().pending_new, 2);
        assert!(!session.in_transaction());

        state.lock().unwrap().rows.push_back(vec![author_row(8, "C")]);
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.inserted, 2);
        assert_eq!(explicit.state(), EntityState::Persistent);
        assert_eq!(generated.state(), EntityState::Persistent);
        assert_eq!(generated.read().unwrap().id, Some(8));
        assert_eq!(session.identity_map().len(), 3);
    });

    let guard = state.lock().unwrap();
    assert_eq!(guard.rollbacks, 1);
    assert_eq!(guard.commits, 1);
}

#[test]
fn cancelled_flush_rolls_back_and_keeps_entities_new() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (state, mut session) = open(blog_registry(LoadStrategy::Lazy));
    state.lock().unwrap().cancel_after = Some(("INSERT INTO \"authors\"".into(), cx.clone()));

    let author = session.add(Author::new(1, "A")).unwrap();
    let article = session.add(Article::new(10, "T", 1)).unwrap();

    rt.block_on(async {
        match session.commit(&cx).await {
            Outcome::Cancelled(reason) => assert_eq!(reason.kind, CancelKind::User),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(author.state(), EntityState::New);
        assert_eq!(article.state(), EntityState::New);
        assert_eq!(session.debug_info().pending_new, 2);
        assert!(!session.in_transaction());

        state.lock().unwrap().cancel_after = None;
        cx.set_cancel_requested(false);
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.inserted, 2);
    });
    assert_eq!(author.state(), EntityState::Persistent);
    assert_eq!(article.state(), EntityState::Persistent);

    let guard = state.lock().unwrap();
    assert_eq!(guard.rollbacks, 1);
    assert_eq!(guard.commits, 1);
    // The article INSERT never ran in the cancelled flush
    assert_eq!(guard.statements_starting_with("INSERT").len(), 3);
}

#[test]
fn removing_parent_and_child_deletes_child_first() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (state, mut session) = open(blog_registry(LoadStrategy::BatchedIn));
    {
        let mut guard = state.lock().unwrap();
        guard.rows.push_back(vec![author_row(1, "A")]);
        guard
            .rows
            .push_back(vec![article_row(10, 1), article_row(11, 1)]);
    }

    rt.block_on(async {
        session.map::<Article>().unwrap();
        let author = unwrap_outcome(session.get::<Author>(&cx, 1_i64).await);
        let articles = author.related::<Article>("articles").get().unwrap();

        session.remove(&author).unwrap();
        for article in &articles {
            session.remove(article).unwrap();
        }
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.deleted, 3);
        assert!(session.identity_map().is_empty());
    });

    let guard = state.lock().unwrap();
    let deletes = guard.statements_starting_with("DELETE");
    assert_eq!(deletes.len(), 3);
    assert_eq!(deletes[2], "DELETE FROM \"authors\" WHERE \"id\" = $1");
    assert!(deletes[..2].iter().all(|sql| sql.contains("\"articles\"")));
}

#[test]
fn closed_session_detaches_entities() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (state, mut session) = open(blog_registry(LoadStrategy::Lazy));
    state.lock().unwrap().rows.push_back(vec![author_row(1, "A")]);

    rt.block_on(async {
        let author = unwrap_outcome(session.get::<Author>(&cx, 1_i64).await);
        let pending = session.add(Author::new(2, "B")).unwrap();
        unwrap_outcome(session.close(&cx).await);
        assert!(session.is_closed());

        for entity in [&author, &pending] {
            assert_eq!(entity.state(), EntityState::Detached);
            match entity.read() {
                Err(Error::Detached(e)) => assert_eq!(e.table.as_deref(), Some("authors")),
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert!(matches!(
            expect_err(
                author
                    .related::<Article>("articles")
                    .ensure_loaded(&cx, &mut session)
                    .await
            ),
            Error::Detached(_)
        ));
        assert!(matches!(
            expect_err(session.commit(&cx).await),
            Error::Detached(_)
        ));
        assert!(matches!(session.remove(&author), Err(Error::Detached(_))));
    });

    // Pending work was discarded with the transaction
    let guard = state.lock().unwrap();
    assert_eq!(guard.execute_calls, 0);
    assert_eq!(guard.rollbacks, 1);
}

#[test]
fn entities_of_another_session_are_rejected() {
    let (_state_a, mut first) = open(blog_registry(LoadStrategy::Lazy));
    let (_state_b, mut second) = open(blog_registry(LoadStrategy::Lazy));

    let author = first.add(Author::new(1, "A")).unwrap();
    assert!(matches!(second.remove(&author), Err(Error::Detached(_))));
    assert!(matches!(second.is_modified(&author), Err(Error::Detached(_))));
    assert!(first.is_modified(&author).unwrap());
}
