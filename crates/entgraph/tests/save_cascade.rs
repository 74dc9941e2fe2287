mod common;

use common::{author_with_book, block_on, session, unwrap_outcome};
use entgraph::prelude::*;
use entgraph::{ModelingErrorKind, StatementKind};

#[test]
fn save_inserts_parents_before_children() {
    let cx = Cx::for_testing();
    let mut session = session();
    let (author, book, chapters) = author_with_book(&mut session);

    let report = block_on(async { unwrap_outcome(session.save(&cx, author).await) });

    assert_eq!(report.inserted, 4);
    assert_eq!(report.waves, 3);
    let tables: Vec<&str> = session.executor().statements().iter().map(|s| s.table).collect();
    assert_eq!(tables, vec!["authors", "books", "chapters", "chapters"]);

    let graph = session.graph();
    let book_id = graph.id(book).cloned().unwrap();
    for &chapter in &chapters {
        assert!(graph.is_persisted(chapter));
        assert!(!graph.state(chapter).has_modifications());
    }
    let row = session
        .executor()
        .find("chapters", "title", &Value::from("Chapter 1"))
        .unwrap();
    assert_eq!(row.get_by_name("book_id"), Some(&book_id));
    assert_eq!(graph.get(author, "version").unwrap(), &Value::BigInt(1));
}

#[test]
fn saving_unchanged_entities_issues_no_statements() {
    let cx = Cx::for_testing();
    let mut session = session();
    let (author, _, _) = author_with_book(&mut session);
    block_on(async { unwrap_outcome(session.save(&cx, author).await) });
    session.executor().clear_log();

    let report = block_on(async { unwrap_outcome(session.save(&cx, author).await) });

    assert_eq!(report.statements, 0);
    assert_eq!(report.inserted + report.updated, 0);
    assert!(session.executor().statements().is_empty());
}

#[test]
fn only_modified_columns_are_updated() {
    let cx = Cx::for_testing();
    let mut session = session();
    let (author, book, _) = author_with_book(&mut session);
    block_on(async { unwrap_outcome(session.save(&cx, author).await) });
    session.executor().clear_log();

    session.graph_mut().set(book, "title", "The Lathe of Heaven").unwrap();
    let report = block_on(async { unwrap_outcome(session.save(&cx, author).await) });

    assert_eq!(report.updated, 1);
    let log = session.executor().statements();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, StatementKind::Update);
    assert!(log[0].sql.starts_with(r#"UPDATE "books" SET "title" = $1"#));
    assert!(!log[0].sql.contains("author_id"));
    assert!(!session.graph().state(book).has_modifications());
}

#[test]
fn moving_a_child_inserts_the_new_parent_first() {
    let cx = Cx::for_testing();
    let mut session = session();
    let (author, book, _) = author_with_book(&mut session);
    block_on(async { unwrap_outcome(session.save(&cx, author).await) });
    session.executor().clear_log();

    let other = session.graph_mut().create("Author").unwrap();
    session.graph_mut().set(other, "name", "Butler").unwrap();
    session.graph_mut().set_target(book, "author", Some(other)).unwrap();
    let report = block_on(async { unwrap_outcome(session.save(&cx, book).await) });

    assert_eq!(report.inserted, 1);
    assert_eq!(report.updated, 1);
    let kinds: Vec<(StatementKind, &str)> = session
        .executor()
        .statements()
        .iter()
        .map(|s| (s.kind, s.table))
        .collect();
    assert_eq!(
        kinds,
        vec![(StatementKind::Insert, "authors"), (StatementKind::Update, "books")]
    );
    let graph = session.graph();
    assert!(graph.links(author, "books").unwrap().is_empty());
    assert_eq!(graph.links(other, "books").unwrap(), &[book]);
    let row = session
        .executor()
        .find("books", "title", &Value::from("The Dispossessed"))
        .unwrap();
    assert_eq!(row.get_by_name("author_id"), graph.id(other));
}

#[test]
fn many_to_many_from_both_sides_inserts_one_join_row() {
    let cx = Cx::for_testing();
    let mut session = session();
    let graph = session.graph_mut();
    let book = graph.create("Book").unwrap();
    graph.set(book, "title", "Kindred").unwrap();
    let tag = graph.create("Tag").unwrap();
    graph.set(tag, "label", "classic").unwrap();
    graph.add_link(book, "tags", tag).unwrap();
    graph.add_link(tag, "books", book).unwrap();

    let report = block_on(async { unwrap_outcome(session.save_all(&cx, [book, tag]).await) });

    assert_eq!(report.inserted, 3);
    assert_eq!(session.executor().count(StatementKind::Insert, "book_tags"), 1);
    assert_eq!(session.executor().row_count("book_tags"), 1);

    session.graph_mut().remove_link(book, "tags", tag).unwrap();
    let report = block_on(async { unwrap_outcome(session.save(&cx, book).await) });

    assert_eq!(report.deleted, 1);
    assert_eq!(session.executor().row_count("book_tags"), 0);
    assert!(session.graph().links(tag, "books").unwrap().is_empty());
}

#[test]
fn dependency_cycles_are_rejected_before_writing() {
    let cx = Cx::for_testing();
    let mut session = session();
    let graph = session.graph_mut();
    let a = graph.create("Employee").unwrap();
    let b = graph.create("Employee").unwrap();
    graph.set_target(a, "manager", Some(b)).unwrap();
    graph.set_target(b, "manager", Some(a)).unwrap();

    let outcome = block_on(async { session.save(&cx, a).await });

    match outcome {
        Outcome::Err(e) => {
            assert_eq!(e.modeling_kind(), Some(ModelingErrorKind::DependencyCycle));
            assert!(e.to_string().contains("Employee"));
        }
        _ => panic!("expected a dependency cycle"),
    }
    assert!(session.executor().statements().is_empty());
}

#[test]
fn versioned_updates_detect_concurrent_changes() {
    let cx = Cx::for_testing();
    let mut session = session();
    let author = session.graph_mut().create("Author").unwrap();
    session.graph_mut().set(author, "name", "Le Guin").unwrap();
    block_on(async { unwrap_outcome(session.save(&cx, author).await) });

    session.graph_mut().set(author, "name", "Ursula K. Le Guin").unwrap();
    block_on(async { unwrap_outcome(session.save(&cx, author).await) });
    assert_eq!(session.graph().get(author, "version").unwrap(), &Value::BigInt(2));
    let id = session.graph().id(author).cloned().unwrap();
    let row = session.executor().find("authors", "id", &id).unwrap();
    assert_eq!(row.get_by_name("version"), Some(&Value::BigInt(2)));

    // Someone else updates the row
    session
        .executor()
        .update_rows("authors", &Criteria::eq("id", id), "version", Value::BigInt(3));

    session.graph_mut().set(author, "name", "U. K. Le Guin").unwrap();
    let outcome = block_on(async { session.save(&cx, author).await });
    match outcome {
        Outcome::Err(Error::Conflict(conflict)) => {
            assert_eq!(conflict.entity, "Author");
            assert_eq!(conflict.table, "authors");
            assert_eq!(conflict.expected_version, 2);
        }
        _ => panic!("expected a version conflict"),
    }
    assert!(session.graph().state(author).has_modifications());
}

#[test]
fn conflicting_update_stops_dependent_statements() {
    let cx = Cx::for_testing();
    let mut session = session();
    let graph = session.graph_mut();
    let author = graph.create("Author").unwrap();
    graph.set(author, "name", "Jemisin").unwrap();
    let old = graph.create("Portrait").unwrap();
    graph.set(old, "artist", "Leibovitz").unwrap();
    graph.set_target(author, "portrait", Some(old)).unwrap();
    block_on(async { unwrap_outcome(session.save(&cx, author).await) });

    let id = session.graph().id(author).cloned().unwrap();
    session
        .executor()
        .update_rows("authors", &Criteria::eq("id", id), "version", Value::BigInt(2));
    session.executor().clear_log();

    let graph = session.graph_mut();
    let replacement = graph.create("Portrait").unwrap();
    graph.set(replacement, "artist", "Avedon").unwrap();
    graph.set_target(author, "portrait", Some(replacement)).unwrap();
    let outcome = block_on(async { session.save(&cx, author).await });

    assert!(matches!(outcome, Outcome::Err(Error::Conflict(_))));
    let db = session.executor();
    assert_eq!(db.count(StatementKind::Insert, "portraits"), 1);
    assert_eq!(db.count(StatementKind::Update, "authors"), 1);
    assert_eq!(db.count(StatementKind::Delete, "portraits"), 0);
    assert_eq!(db.statements().len(), 2);
    assert_eq!(db.row_count("portraits"), 2);
    assert!(session.graph().is_persisted(old));
}

#[test]
fn saving_a_row_deleted_elsewhere_is_a_conflict() {
    let cx = Cx::for_testing();
    let mut session = session();
    let author = session.graph_mut().reference("Author", 99_i64).unwrap();
    session.graph_mut().set(author, "name", "Tiptree").unwrap();

    let outcome = block_on(async { session.save(&cx, author).await });

    match outcome {
        Outcome::Err(Error::Conflict(conflict)) => {
            assert_eq!(conflict.entity, "Author");
            assert_eq!(conflict.table, "authors");
        }
        _ => panic!("expected a conflict for the missing row"),
    }
    let db = session.executor();
    assert_eq!(db.count(StatementKind::Select, "authors"), 1);
    assert_eq!(db.count_kind(StatementKind::Insert), 0);
    assert_eq!(db.row_count("authors"), 0);
    let graph = session.graph();
    assert!(graph.state(author).is_stub());
    assert_eq!(graph.id(author), Some(&Value::BigInt(99)));
}
