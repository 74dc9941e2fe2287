mod common;

use common::{author_with_book, block_on, library, session, unwrap_outcome};
use entgraph::prelude::*;
use entgraph::StatementKind;

fn deletes(session: &Session<MemoryExecutor>) -> Vec<&'static str> {
    session
        .executor()
        .statements()
        .iter()
        .filter(|s| s.kind == StatementKind::Delete)
        .map(|s| s.table)
        .collect()
}

#[test]
fn delete_cascades_through_loaded_children() {
    let cx = Cx::for_testing();
    let mut session = session();
    let (author, book, chapters) = author_with_book(&mut session);
    block_on(async { unwrap_outcome(session.save(&cx, author).await) });
    session.executor().clear_log();

    let report = block_on(async { unwrap_outcome(session.delete(&cx, author).await) });

    assert_eq!(report.deleted, 4);
    assert_eq!(deletes(&session), vec!["reviews", "chapters", "books", "authors"]);
    for table in ["authors", "books", "chapters"] {
        assert_eq!(session.executor().row_count(table), 0, "{table} not emptied");
    }
    let graph = session.graph();
    for e in [author, book, chapters[0], chapters[1]] {
        assert!(!graph.is_persisted(e));
    }
    assert_eq!(graph.id(author), None);
}

#[test]
fn set_null_references_are_detached_not_deleted() {
    let cx = Cx::for_testing();
    let mut session = session();
    let graph = session.graph_mut();
    let book = graph.create("Book").unwrap();
    graph.set(book, "title", "Parable of the Sower").unwrap();
    let member = graph.create("Member").unwrap();
    graph.set(member, "name", "Lauren").unwrap();
    graph.set_target(member, "favorite", Some(book)).unwrap();
    block_on(async { unwrap_outcome(session.save(&cx, member).await) });

    let report = block_on(async { unwrap_outcome(session.delete(&cx, book).await) });

    assert_eq!(report.bulk_updated, 1);
    assert_eq!(report.deleted, 1);
    let row = session
        .executor()
        .find("members", "name", &Value::from("Lauren"))
        .unwrap();
    assert_eq!(row.get_by_name("favorite_id"), Some(&Value::Null));
    let graph = session.graph();
    assert_eq!(graph.target(member, "favorite").unwrap(), None);
    assert!(graph.is_persisted(member));
    assert!(!graph.state(member).has_modifications());
}

fn stored_books_with_reviews(db: &MemoryExecutor) -> (Value, Value) {
    let first = db.insert_row("books", &[("title", Value::from("Kindred"))]);
    let second = db.insert_row("books", &[("title", Value::from("Dawn"))]);
    for (book, body) in [(&first, "gripping"), (&first, "dense"), (&second, "strange")] {
        db.insert_row(
            "reviews",
            &[("body", Value::from(body)), ("book_id", book.clone())],
        );
    }
    db.clear_log();
    (first, second)
}

#[test]
fn unreferenced_leaf_rows_are_deleted_without_loading() {
    let cx = Cx::for_testing();
    let mut session = session();
    let (first, second) = stored_books_with_reviews(session.executor());
    let a = session.graph_mut().reference("Book", first).unwrap();
    let b = session.graph_mut().reference("Book", second).unwrap();

    let report = block_on(async { unwrap_outcome(session.delete_all(&cx, [a, b]).await) });

    let db = session.executor();
    assert_eq!(db.count(StatementKind::Select, "reviews"), 0);
    assert_eq!(db.count(StatementKind::Delete, "reviews"), 1);
    assert_eq!(db.count(StatementKind::Select, "books"), 1);
    assert_eq!(db.count(StatementKind::Delete, "books"), 1);
    assert_eq!(report.bulk_deleted, 3);
    assert_eq!(report.deleted, 2);
    assert_eq!(db.row_count("reviews"), 0);
    assert_eq!(db.row_count("books"), 0);
}

#[test]
fn disabling_bulk_delete_loads_referencing_rows() {
    let cx = Cx::for_testing();
    let registry = library();
    let db = MemoryExecutor::new(&registry);
    let mut session =
        Session::with_config(registry, db, OperationConfig::new().bulk_delete(false));
    let (first, second) = stored_books_with_reviews(session.executor());
    let a = session.graph_mut().reference("Book", first).unwrap();
    let b = session.graph_mut().reference("Book", second).unwrap();

    let report = block_on(async { unwrap_outcome(session.delete_all(&cx, [a, b]).await) });

    let db = session.executor();
    assert_eq!(db.count(StatementKind::Select, "reviews"), 1);
    assert_eq!(db.count(StatementKind::Delete, "reviews"), 1);
    assert_eq!(report.bulk_deleted, 0);
    assert_eq!(report.deleted, 5);
    assert_eq!(db.row_count("reviews"), 0);
    assert_eq!(db.row_count("books"), 0);
}

#[test]
fn each_row_is_deleted_by_exactly_one_statement() {
    let cx = Cx::for_testing();
    let mut session = session();
    let (author, book, chapters) = author_with_book(&mut session);
    block_on(async { unwrap_outcome(session.save(&cx, author).await) });
    session.executor().clear_log();

    let report = block_on(async {
        unwrap_outcome(
            session
                .delete_all(&cx, [book, author, chapters[0], book])
                .await,
        )
    });

    assert_eq!(report.deleted, 4);
    let db = session.executor();
    assert_eq!(db.count(StatementKind::Delete, "chapters"), 1);
    assert_eq!(db.count(StatementKind::Delete, "books"), 1);
    assert_eq!(db.count(StatementKind::Delete, "authors"), 1);
    let log = db.statements();
    for (i, statement) in log.iter().enumerate() {
        assert!(
            !log[i + 1..].contains(statement),
            "statement issued twice: {}",
            statement.sql
        );
    }
}

#[test]
fn failed_statement_aborts_without_undoing_earlier_waves() {
    let cx = Cx::for_testing();
    let mut session = session();
    let (author, book, _) = author_with_book(&mut session);
    block_on(async { unwrap_outcome(session.save(&cx, author).await) });
    session.executor().fail_next(StatementKind::Delete, "books");

    let outcome = block_on(async { session.delete(&cx, author).await });

    assert!(matches!(outcome, Outcome::Err(_)));
    let db = session.executor();
    assert_eq!(db.row_count("chapters"), 0);
    assert_eq!(db.row_count("books"), 1);
    assert_eq!(db.row_count("authors"), 1);
    assert_eq!(db.count(StatementKind::Delete, "authors"), 0);
    assert!(session.graph().is_persisted(book));
}

#[test]
fn deleting_a_transient_entity_writes_nothing() {
    let cx = Cx::for_testing();
    let mut session = session();
    let author = session.graph_mut().create("Author").unwrap();

    let report = block_on(async { unwrap_outcome(session.delete(&cx, author).await) });

    assert_eq!(report.statements, 0);
    assert_eq!(report.entities, vec![author]);
    assert!(session.executor().statements().is_empty());
}

#[test]
fn cascading_references_delete_targets_never_handed_in() {
    let cx = Cx::for_testing();
    let mut session = session();
    let db = session.executor();
    let cover = db.insert_row("covers", &[("image", Value::from("eclipse.png"))]);
    let book = db.insert_row(
        "books",
        &[("title", Value::from("Wild Seed")), ("cover_id", cover.clone())],
    );
    db.clear_log();
    let stub = session.graph_mut().reference("Book", book).unwrap();

    let report = block_on(async { unwrap_outcome(session.delete(&cx, stub).await) });

    assert_eq!(report.deleted, 2);
    assert_eq!(session.executor().row_count("covers"), 0);
    assert_eq!(session.executor().row_count("books"), 0);
    let order = deletes(&session);
    let book_at = order.iter().position(|t| *t == "books").unwrap();
    let cover_at = order.iter().position(|t| *t == "covers").unwrap();
    assert!(book_at < cover_at);
    assert_eq!(session.graph().lookup("Cover", cover), None);
}

#[test]
fn deleting_a_row_already_gone_writes_nothing() {
    let cx = Cx::for_testing();
    let mut session = session();
    let stub = session.graph_mut().reference("Book", 404_i64).unwrap();

    let report = block_on(async { unwrap_outcome(session.delete(&cx, stub).await) });

    assert_eq!(report.statements, 0);
    assert_eq!(session.executor().count(StatementKind::Select, "books"), 1);
    assert!(!session.graph().is_persisted(stub));
}

#[test]
fn loaded_children_are_nulled_with_one_update() {
    let cx = Cx::for_testing();
    let registry = Arc::new(
        Registry::builder()
            .entity(
                EntityInfo::new("Club", "clubs")
                    .generated_id("id")
                    .column("name")
                    .inverse("fans", InverseRef::many("Fan", "club")),
            )
            .entity(
                EntityInfo::new("Fan", "fans")
                    .generated_id("id")
                    .column("name")
                    .owning(
                        "club",
                        OwningRef::new("club_id", "Club").on_foreign_deleted(ForeignDeleted::SetNull),
                    ),
            )
            .build()
            .unwrap(),
    );
    let db = MemoryExecutor::new(&registry);
    let club = db.insert_row("clubs", &[("name", Value::from("Chess"))]);
    for name in ["Ada", "Grace", "Barbara"] {
        db.insert_row("fans", &[("name", Value::from(name)), ("club_id", club.clone())]);
    }
    let mut session = Session::new(registry, db);
    let club = block_on(async { unwrap_outcome(session.find(&cx, "Club", club).await) }).unwrap();
    let fans = block_on(async { unwrap_outcome(session.load_relation(&cx, club, "fans").await) });
    session.executor().clear_log();

    let report = block_on(async { unwrap_outcome(session.delete(&cx, club).await) });

    let db = session.executor();
    assert_eq!(db.count(StatementKind::Update, "fans"), 1);
    assert_eq!(db.count_kind(StatementKind::Select), 0);
    assert_eq!(report.bulk_updated, 3);
    assert_eq!(report.deleted, 1);
    assert_eq!(db.row_count("fans"), 3);
    let graph = session.graph();
    for fan in fans {
        assert_eq!(graph.target(fan, "club").unwrap(), None);
        assert!(graph.is_persisted(fan));
        assert!(!graph.state(fan).has_modifications());
    }
}

#[test]
fn zero_in_list_limit_issues_one_value_per_statement() {
    let cx = Cx::for_testing();
    let registry = library();
    let db = MemoryExecutor::new(&registry);
    let config = OperationConfig {
        max_in_values: 0,
        ..OperationConfig::default()
    };
    let mut session = Session::with_config(registry, db, config);
    let (first, second) = stored_books_with_reviews(session.executor());
    let a = session.graph_mut().reference("Book", first).unwrap();
    let b = session.graph_mut().reference("Book", second).unwrap();

    let report = block_on(async { unwrap_outcome(session.delete_all(&cx, [a, b]).await) });

    let db = session.executor();
    assert_eq!(db.count(StatementKind::Delete, "books"), 2);
    assert_eq!(db.count(StatementKind::Delete, "reviews"), 2);
    assert_eq!(report.deleted, 2);
    assert_eq!(report.bulk_deleted, 3);
    assert_eq!(db.row_count("reviews"), 0);
    assert_eq!(db.row_count("books"), 0);
}
