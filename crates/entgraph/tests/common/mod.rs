#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;

use asupersync::runtime::RuntimeBuilder;
use entgraph::prelude::*;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn block_on<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

/// Authors own books, books own chapters. Reviews and members point at books
/// without the book knowing about them; tags are many-to-many. Portraits and
/// covers go away with the author or book holding them.
pub fn library() -> Arc<Registry> {
    Arc::new(
        Registry::builder()
            .entity(
                EntityInfo::new("Author", "authors")
                    .generated_id("id")
                    .column("name")
                    .versioned("version")
                    .owning(
                        "portrait",
                        OwningRef::new("portrait_id", "Portrait").cascade_delete(true),
                    )
                    .inverse("books", InverseRef::many("Book", "author")),
            )
            .entity(
                EntityInfo::new("Portrait", "portraits")
                    .generated_id("id")
                    .column("artist")
                    .inverse("author", InverseRef::one("Author", "portrait")),
            )
            .entity(
                EntityInfo::new("Book", "books")
                    .generated_id("id")
                    .column("title")
                    .owning("author", OwningRef::new("author_id", "Author"))
                    .owning("cover", OwningRef::new("cover_id", "Cover").cascade_delete(true))
                    .inverse("chapters", InverseRef::many("Chapter", "book")),
            )
            .entity(EntityInfo::new("Cover", "covers").generated_id("id").column("image"))
            .entity(
                EntityInfo::new("Chapter", "chapters")
                    .generated_id("id")
                    .column("title")
                    .owning("book", OwningRef::new("book_id", "Book")),
            )
            .entity(
                EntityInfo::new("Review", "reviews")
                    .generated_id("id")
                    .column("body")
                    .owning("book", OwningRef::new("book_id", "Book")),
            )
            .entity(
                EntityInfo::new("Member", "members")
                    .generated_id("id")
                    .column("name")
                    .owning(
                        "favorite",
                        OwningRef::new("favorite_id", "Book")
                            .on_foreign_deleted(ForeignDeleted::SetNull),
                    ),
            )
            .entity(EntityInfo::new("Tag", "tags").generated_id("id").column("label"))
            .entity(
                EntityInfo::new("Employee", "employees")
                    .generated_id("id")
                    .column("name")
                    .owning("manager", OwningRef::new("manager_id", "Employee")),
            )
            .many_to_many(ManyToMany::new(
                "BookTag",
                "book_tags",
                AssociationSide::new("Book", "tags", "book_id"),
                AssociationSide::new("Tag", "books", "tag_id"),
            ))
            .build()
            .expect("valid registry"),
    )
}

pub fn session() -> Session<MemoryExecutor> {
    let registry = library();
    let db = MemoryExecutor::new(&registry);
    Session::new(registry, db)
}

/// An author with one book of two chapters, all new.
pub fn author_with_book(session: &mut Session<MemoryExecutor>) -> (EntityRef, EntityRef, Vec<EntityRef>) {
    let graph = session.graph_mut();
    let author = graph.create("Author").unwrap();
    graph.set(author, "name", "Le Guin").unwrap();
    let book = graph.create("Book").unwrap();
    graph.set(book, "title", "The Dispossessed").unwrap();
    graph.add_link(author, "books", book).unwrap();
    let chapters: Vec<EntityRef> = (1..=2)
        .map(|i| {
            let chapter = graph.create("Chapter").unwrap();
            graph.set(chapter, "title", format!("Chapter {i}")).unwrap();
            graph.add_link(book, "chapters", chapter).unwrap();
            chapter
        })
        .collect();
    (author, book, chapters)
}
