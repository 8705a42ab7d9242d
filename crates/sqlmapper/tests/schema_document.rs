mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{Article, Author, article_row, author_row, open, unwrap_outcome};
use sqlmapper::prelude::*;
use sqlmapper::ConfigErrorKind;

const BLOG: &str = r#"{
    "entities": [
        {
            "table": "authors",
            "columns": [
                { "name": "id", "type": "bigint", "primaryKey": true },
                { "name": "name", "type": "text" }
            ],
            "relationships": [
                { "name": "articles", "kind": "one-to-many", "targetTable": "articles",
                  "foreignKey": "author_id", "defaultStrategy": "batched-in" }
            ]
        },
        {
            "table": "articles",
            "columns": [
                { "name": "id", "type": "bigint", "primaryKey": true },
                { "name": "title", "type": "varchar" },
                { "name": "author_id", "type": "int8", "nullable": true }
            ],
            "relationships": [
                { "name": "author", "kind": "many-to-one", "targetTable": "authors",
                  "foreignKey": "author_id", "defaultStrategy": "forbidden" }
            ]
        }
    ]
}"#;

#[test]
fn session_runs_on_a_registry_loaded_from_json() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let registry = SchemaRegistry::from_json(BLOG).unwrap();
    assert_eq!(
        registry.entities().map(|e| e.table()).collect::<Vec<_>>(),
        vec!["authors", "articles"]
    );

    let (state, mut session) = open(registry);
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
        assert_eq!(articles.len(), 2);

        // The back reference is configured as forbidden
        let err = match articles[0]
            .related::<Author>("author")
            .ensure_one(&cx, &mut session)
            .await
        {
            Outcome::Err(e) => e,
            other => panic!("expected an error, got {other:?}"),
        };
        assert!(matches!(err, Error::LazyLoadForbidden(_)));

        session.add(Article::new(12, "New", 1)).unwrap();
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.inserted, 1);
    });

    let guard = state.lock().unwrap();
    assert_eq!(guard.query_calls, 2);
    assert_eq!(
        guard.executed.last().unwrap().0,
        "INSERT INTO \"articles\" (\"id\", \"title\", \"author_id\") VALUES ($1, $2, $3)"
    );
}

#[test]
fn registry_from_path_reads_the_document() {
    let path = std::env::temp_dir().join(format!("sqlmapper-schema-{}.json", std::process::id()));
    std::fs::write(&path, BLOG).unwrap();
    let registry = SchemaRegistry::from_path(&path);
    std::fs::remove_file(&path).ok();

    let registry = registry.unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(
        registry
            .require("authors")
            .unwrap()
            .find_relationship("articles")
            .unwrap()
            .default_strategy,
        LoadStrategy::BatchedIn
    );
}

#[test]
fn relationship_to_an_unknown_table_is_rejected() {
    let json = r#"[{
        "table": "articles",
        "columns": [
            { "name": "id", "type": "bigint", "primaryKey": true },
            { "name": "author_id", "type": "bigint" }
        ],
        "relationships": [
            { "name": "author", "kind": "many-to-one", "targetTable": "authors",
              "foreignKey": "author_id" }
        ]
    }]"#;
    match SchemaRegistry::from_json(json) {
        Err(Error::Config(e)) => assert_eq!(e.kind, ConfigErrorKind::UnknownTarget),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn entity_without_primary_key_is_rejected() {
    let json = r#"[{ "table": "notes", "columns": [{ "name": "body", "type": "text" }] }]"#;
    match SchemaRegistry::from_json(json) {
        Err(Error::Config(e)) => assert_eq!(e.kind, ConfigErrorKind::MissingPrimaryKey),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn unknown_fields_are_parse_errors() {
    let json = r#"[{ "table": "notes", "colums": [] }]"#;
    match SchemaRegistry::from_json(json) {
        Err(Error::Config(e)) => assert_eq!(e.kind, ConfigErrorKind::Parse),
        other => panic!("unexpected result: {other:?}"),
    }
}
