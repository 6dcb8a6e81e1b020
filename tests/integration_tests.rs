//! Integration tests for the data access layer
//!
//! These tests run the engine end to end against a temporary SQLite file:
//! - Query immutability and composition
//! - Cursor lifecycle and sentinel errors
//! - Pagination
//! - Transaction scoping
//! - Cancellation and session shutdown

#[cfg(feature = "sqlite")]
mod sqlite_tests {
    use rust_data_access::core::mapper::{encode, mapping};
    use rust_data_access::core::{CursorState, DatabaseError};
    use rust_data_access::prelude::*;
    use std::time::Duration;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Book {
        id: i64,
        title: String,
        author_id: Option<i64>,
    }

    impl Record for Book {
        fn describe(m: &mut MappingBuilder<Self>) {
            m.field("id,omitempty", |b| &b.id, |b| &mut b.id)
                .field("title", |b| &b.title, |b| &mut b.title)
                .field("author_id", |b| &b.author_id, |b| &mut b.author_id);
        }
    }

    impl Model for Book {
        fn table() -> &'static str {
            "books"
        }

        fn before_insert(&mut self) -> Result<()> {
            if self.title.is_empty() {
                return Err(DatabaseError::invalid_query("a book needs a title"));
            }
            self.title = self.title.trim().to_string();
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct BookWithAuthor {
        book: Book,
        last_name: String,
    }

    impl Record for BookWithAuthor {
        fn describe(m: &mut MappingBuilder<Self>) {
            m.inline(",inline", |r| &r.book, |r| &mut r.book)
                .field("last_name", |r| &r.last_name, |r| &mut r.last_name);
        }
    }

    #[derive(Debug, Default)]
    struct Author {
        id: i64,
        last_name: String,
    }

    impl Record for Author {
        fn describe(m: &mut MappingBuilder<Self>) {
            m.field("id", |a| &a.id, |a| &mut a.id)
                .field("last_name", |a| &a.last_name, |a| &mut a.last_name);
        }
    }

    /// Both inlined records carry an `id` column
    #[derive(Debug, Default)]
    struct BookAndAuthor {
        book: Book,
        author: Author,
    }

    impl Record for BookAndAuthor {
        fn describe(m: &mut MappingBuilder<Self>) {
            m.inline(",inline", |r| &r.book, |r| &mut r.book)
                .inline(",inline", |r| &r.author, |r| &mut r.author);
        }
    }

    async fn booktown() -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let url = format!("sqlite://{}", dir.path().join("booktown.db").display());
        let sess = Session::open_url(&url).await.expect("Failed to open session");
        sess.exec(
            "CREATE TABLE authors (id INTEGER PRIMARY KEY, last_name TEXT NOT NULL)",
            vec![],
        )
        .await
        .expect("Failed to create authors");
        sess.exec(
            "CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT NOT NULL, \
             author_id INTEGER REFERENCES authors(id))",
            vec![],
        )
        .await
        .expect("Failed to create books");
        (dir, sess)
    }

    async fn seed_books(sess: &Session) {
        sess.exec(
            "INSERT INTO authors (id, last_name) VALUES (1809, 'Poe'), (4156, 'King')",
            vec![],
        )
        .await
        .unwrap();
        for (title, author) in [
            ("The Shining", 4156),
            ("Programming Python", 1809),
            ("Perl Cookbook", 1809),
        ] {
            sess.collection("books")
                .insert(&Book {
                    id: 0,
                    title: title.to_string(),
                    author_id: Some(author),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_derived_query_leaves_base_untouched() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        let base = sess.collection("books").find().order_by("title");
        let before = base.count().await.unwrap();
        let p_books: Vec<Book> = base.and(cond("title LIKE", "P%")).all().await.unwrap();

        assert_eq!(before, 3);
        assert_eq!(base.count().await.unwrap(), 3);
        let titles: Vec<_> = p_books.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, ["Perl Cookbook", "Programming Python"]);
    }

    #[tokio::test]
    async fn test_pagination_over_25_rows() {
        let (_dir, sess) = booktown().await;
        let books = sess.collection("books");
        for i in 0..25 {
            books
                .insert(&Book {
                    title: format!("Book {:02}", i),
                    ..Book::default()
                })
                .await
                .unwrap();
        }

        let pages = books.find().order_by("id").paginate(10).unwrap();
        assert_eq!(pages.total_entries().await.unwrap(), 25);
        assert_eq!(pages.total_pages().await.unwrap(), 3);

        let last: Vec<Book> = pages.page(3).all().await.unwrap();
        assert_eq!(last.len(), 5);
        assert_eq!(last[0].title, "Book 20");

        let second: Vec<Book> = pages.page(2).all().await.unwrap();
        assert_eq!(second.first().map(|b| b.id), Some(11));

        let beyond: Vec<Book> = pages.page(4).all().await.unwrap();
        assert!(beyond.is_empty());
    }

    #[tokio::test]
    async fn test_unordered_query_cannot_paginate() {
        let (_dir, sess) = booktown().await;
        let res = sess.collection("books").find().paginate(10);
        assert!(matches!(res, Err(DatabaseError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_failed_transaction_persists_nothing() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;
        let before = sess.collection("books").count().await.unwrap();

        let res: Result<()> = sess
            .with_transaction(|tx| async move {
                let books = tx.collection("books");
                books
                    .insert(&Book {
                        title: "Carrie".to_string(),
                        author_id: Some(4156),
                        ..Book::default()
                    })
                    .await?;
                books.find_where(cond("author_id", 1809)).delete().await?;
                Err(DatabaseError::other("changed my mind"))
            })
            .await;

        assert!(matches!(res, Err(DatabaseError::Other(_))));
        assert_eq!(sess.collection("books").count().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_committed_transaction_returns_value() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        let deleted = sess
            .with_transaction(|tx| async move {
                let res = tx
                    .delete_from("books")
                    .where_(cond("author_id", 1809))
                    .exec()
                    .await?;
                Ok(res.rows_affected)
            })
            .await
            .unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(sess.collection("books").count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_all_closes_cursor() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        let mut cursor = sess.collection("books").find().cursor().await.unwrap();
        assert_eq!(cursor.state(), CursorState::Open);

        let mut books: Vec<Book> = Vec::new();
        cursor.all(&mut books).await.unwrap();
        assert_eq!(books.len(), 3);
        assert!(cursor.is_closed());
        cursor.close().await.unwrap();
        cursor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_next_iterates_then_stops() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        let mut cursor = sess
            .collection("books")
            .find()
            .order_by("-title")
            .cursor()
            .await
            .unwrap();
        let mut book = Book::default();
        let mut titles = Vec::new();
        while cursor.next(&mut book).await {
            titles.push(book.title.clone());
        }
        assert!(cursor.err().is_none());
        assert!(cursor.is_closed());
        assert_eq!(titles, ["The Shining", "Programming Python", "Perl Cookbook"]);
    }

    #[derive(Debug, Default)]
    struct Item {
        id: i64,
        qty: i64,
    }

    impl Record for Item {
        fn describe(m: &mut MappingBuilder<Self>) {
            m.field("id", |i| &i.id, |i| &mut i.id)
                .field("qty", |i| &i.qty, |i| &mut i.qty);
        }
    }

    /// Items 1 and 2 decode; item 3 holds text in its integer column
    async fn items_with_bad_row(sess: &Session) {
        sess.exec("CREATE TABLE items (id INTEGER PRIMARY KEY, qty INTEGER)", vec![])
            .await
            .unwrap();
        sess.exec(
            "INSERT INTO items (id, qty) VALUES (1, 10), (2, 20), (3, 'many'), (4, 40)",
            vec![],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_next_reports_decode_error() {
        let (_dir, sess) = booktown().await;
        items_with_bad_row(&sess).await;

        let mut cursor = sess.collection("items").find().order_by("id").cursor().await.unwrap();
        let mut item = Item::default();
        let mut seen = 0;
        while cursor.next(&mut item).await {
            seen += 1;
        }
        assert_eq!(seen, 2);
        assert!(matches!(cursor.err(), Some(DatabaseError::Mapping { .. })));
        assert!(cursor.is_closed());
        cursor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_all_keeps_records_before_decode_error() {
        let (_dir, sess) = booktown().await;
        items_with_bad_row(&sess).await;

        let mut cursor = sess.collection("items").find().order_by("id").cursor().await.unwrap();
        let mut items: Vec<Item> = Vec::new();
        let res = cursor.all(&mut items).await;
        assert!(matches!(res, Err(DatabaseError::Mapping { .. })));
        let qty: Vec<i64> = items.iter().map(|i| i.qty).collect();
        assert_eq!(qty, [10, 20]);
        assert!(cursor.is_closed());
    }

    #[tokio::test]
    async fn test_omitempty_skips_zero_key() {
        let (_dir, sess) = booktown().await;
        let books = sess.collection("books");

        let fresh = Book {
            title: "It".to_string(),
            ..Book::default()
        };
        let cols: Vec<String> = encode(&fresh).unwrap().into_iter().map(|(c, _)| c).collect();
        assert_eq!(cols, ["title", "author_id"]);

        let res = books.insert(&fresh).await.unwrap();
        assert_eq!(res.id_as::<i64>().unwrap(), 1);

        let explicit = Book {
            id: 42,
            title: "Misery".to_string(),
            author_id: None,
        };
        let cols: Vec<String> = encode(&explicit)
            .unwrap()
            .into_iter()
            .map(|(c, _)| c)
            .collect();
        assert_eq!(cols, ["id", "title", "author_id"]);
        let res = books.insert(&explicit).await.unwrap();
        assert_eq!(res.id_as::<i64>().unwrap(), 42);

        let stored: Book = books.find_by_id(42).await.unwrap().one().await.unwrap();
        assert_eq!(stored, explicit);
    }

    #[tokio::test]
    async fn test_not_found_versus_no_more_rows() {
        let (_dir, sess) = booktown().await;
        let books = sess.collection("books");

        let res: Result<Book> = books.find_where(cond("id", 1)).one().await;
        assert!(matches!(res, Err(DatabaseError::NotFound(_))));

        let mut cursor = books.find_where(cond("id", 1)).cursor().await.unwrap();
        let res: Result<Book> = cursor.one().await;
        assert!(matches!(res, Err(DatabaseError::NoMoreRows)));
        assert!(cursor.is_closed());
    }

    #[tokio::test]
    async fn test_join_into_inline_record() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        let rows: Vec<BookWithAuthor> = sess
            .select(&[
                "books.id",
                "books.title",
                "authors.id AS author_id",
                "authors.last_name",
            ])
            .from("books")
            .join("authors", Condition::raw("books.author_id = authors.id"))
            .where_(cond("authors.last_name", "Poe"))
            .order_by("books.title")
            .all()
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].book.title, "Perl Cookbook");
        assert_eq!(rows[0].book.author_id, Some(1809));
        assert_eq!(rows[0].last_name, "Poe");
    }

    #[tokio::test]
    async fn test_ambiguous_join_columns_take_first() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        let mapping = mapping::<BookAndAuthor>().unwrap();
        assert_eq!(mapping.ambiguous_columns(), ["id"]);

        let row: BookAndAuthor = sess
            .select(&["books.*", "authors.*"])
            .from("books")
            .join("authors", Condition::raw("books.author_id = authors.id"))
            .where_(cond("books.title", "The Shining"))
            .one()
            .await
            .unwrap();
        // The first `id` in the row belongs to books; the author's is lost.
        assert_eq!(row.book.id, 1);
        assert_eq!(row.author.id, 0);
        assert_eq!(row.author.last_name, "King");
    }

    #[tokio::test]
    async fn test_subquery_from_other_session_rejected() {
        let (_dir, sess) = booktown().await;
        let (_other_dir, other) = booktown().await;

        let poe = other
            .select(&["id"])
            .from("authors")
            .where_(cond("last_name", "Poe"));
        let res: Result<Vec<Book>> = sess
            .collection("books")
            .find_where(Condition::in_subquery("author_id", &poe))
            .all()
            .await;
        assert!(matches!(res, Err(DatabaseError::ScopeMismatch(_))));

        let local = sess
            .select(&["id"])
            .from("authors")
            .where_(cond("last_name", "Poe"));
        let books: Vec<Book> = sess
            .collection("books")
            .find_where(Condition::in_subquery("author_id", &local))
            .all()
            .await
            .unwrap();
        assert!(books.is_empty());
    }

    #[tokio::test]
    async fn test_session_query_inside_transaction_scope_rejected() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        let outside = sess.select(&["id"]).from("authors");
        let res: Result<u64> = sess
            .with_transaction(|tx| async move {
                tx.collection("books")
                    .find_where(Condition::in_subquery("author_id", &outside))
                    .count()
                    .await
            })
            .await;
        assert!(matches!(res, Err(DatabaseError::ScopeMismatch(_))));
    }

    #[tokio::test]
    async fn test_transaction_connection_busy_with_open_cursor() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        let res: Result<usize> = sess
            .with_transaction(|tx| async move {
                let mut cursor = tx.collection("books").find().cursor().await?;
                let busy = tx.collection("authors").count().await;
                assert!(matches!(busy, Err(DatabaseError::ConnectionBusy(_))));
                let mut books: Vec<Book> = Vec::new();
                cursor.all(&mut books).await?;
                tx.collection("authors").count().await?;
                Ok(books.len())
            })
            .await;
        assert_eq!(res.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cursor_update_and_delete() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;
        let books = sess.collection("books");

        let mut cursor = books.find_where(cond("id", 1)).cursor().await.unwrap();
        let mut book: Book = books.find_where(cond("id", 1)).one().await.unwrap();
        book.title = "The Stand".to_string();
        let res = cursor.update(&book).await.unwrap();
        assert_eq!(res.rows_affected, 1);
        assert!(cursor.is_closed());

        let stored: Book = books.find_where(cond("id", 1)).one().await.unwrap();
        assert_eq!(stored.title, "The Stand");

        let mut cursor = books
            .find_where(cond("author_id", 1809))
            .cursor()
            .await
            .unwrap();
        assert_eq!(cursor.delete().await.unwrap().rows_affected, 2);
        assert_eq!(books.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_context() {
        let (_dir, sess) = booktown().await;
        let (ctx, cancel) = Context::with_cancel();
        cancel.cancel();

        let res = sess.collection("books").with_context(ctx).count().await;
        assert!(matches!(res, Err(DatabaseError::Cancelled)));
    }

    const SLOW_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                              WHERE x < 5000000) SELECT count(*) FROM c";

    #[tokio::test]
    async fn test_deadline_interrupts_slow_query() {
        let (_dir, sess) = booktown().await;
        let ctx = Context::background().with_timeout(Duration::from_millis(20));

        let res = sess.with_context(ctx).exec(SLOW_QUERY, vec![]).await;
        assert!(matches!(res, Err(DatabaseError::QueryTimeout { .. })));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_query() {
        let (_dir, sess) = booktown().await;
        let (ctx, cancel) = Context::with_cancel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let res = sess.with_context(ctx).exec(SLOW_QUERY, vec![]).await;
        assert!(matches!(res, Err(DatabaseError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_transaction_rolls_back() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;
        let before = sess.collection("books").count().await.unwrap();
        let (ctx, cancel) = Context::with_cancel();

        let res: Result<()> = sess
            .with_transaction_ctx(&ctx, |tx| async move {
                let books = tx.collection("books");
                books
                    .insert(&Book {
                        title: "Christine".to_string(),
                        author_id: Some(4156),
                        ..Book::default()
                    })
                    .await?;
                cancel.cancel();
                books.count().await?;
                Ok(())
            })
            .await;

        assert!(matches!(res, Err(DatabaseError::Cancelled)));
        assert_eq!(sess.collection("books").count().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_work() {
        let (_dir, sess) = booktown().await;
        let books = sess.collection("books");
        sess.close().await.unwrap();
        sess.close().await.unwrap();

        assert!(sess.is_closed());
        assert!(matches!(
            books.count().await,
            Err(DatabaseError::SessionClosed)
        ));
        assert!(matches!(sess.begin().await, Err(DatabaseError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_model_lifecycle() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        let mut book = Book {
            title: "  Cujo ".to_string(),
            author_id: Some(4156),
            ..Book::default()
        };
        sess.save(&mut book).await.unwrap();
        assert_eq!(book.id, 4);
        assert_eq!(book.title, "Cujo");

        book.title = "Cujo (1981)".to_string();
        sess.save(&mut book).await.unwrap();
        let stored: Book = sess.get(cond("id", 4)).await.unwrap();
        assert_eq!(stored.title, "Cujo (1981)");

        sess.delete(&stored).await.unwrap();
        assert!(matches!(
            sess.get::<Book>(cond("id", 4)).await,
            Err(DatabaseError::NotFound(_))
        ));
        assert!(matches!(
            sess.delete(&stored).await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_model_hook_aborts_write() {
        let (_dir, sess) = booktown().await;
        let mut untitled = Book::default();

        let res = sess.save(&mut untitled).await;
        assert!(matches!(res, Err(DatabaseError::InvalidQuery(_))));
        assert_eq!(sess.collection("books").count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_collections_and_truncate() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        assert_eq!(sess.collections().await.unwrap(), ["authors", "books"]);
        assert!(sess.collection("books").exists().await.unwrap());
        assert!(!sess.collection("shelves").exists().await.unwrap());

        let books = sess.collection("books");
        books.truncate().await.unwrap();
        assert_eq!(books.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_named_statement() {
        let (_dir, sess) = booktown().await;
        seed_books(&sess).await;

        let stmt = Statement::named(
            "SELECT title FROM books WHERE author_id = :author AND title LIKE :prefix \
             ORDER BY title",
            &[("author", 1809.into()), ("prefix", "P%".into())],
        )
        .unwrap();
        let mut cursor = sess.query_statement(stmt).await.unwrap();
        let mut titles = Vec::new();
        while let Some(row) = cursor.next_row().await.unwrap() {
            titles.push(row.get_as::<String>("title").unwrap());
        }
        assert_eq!(titles, ["Perl Cookbook", "Programming Python"]);
        assert!(cursor.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_inserts() {
        let (_dir, sess) = booktown().await;

        let mut handles = vec![];
        for i in 0..10 {
            let books = sess.collection("books");
            handles.push(tokio::spawn(async move {
                books
                    .insert(&Book {
                        title: format!("Volume {}", i),
                        ..Book::default()
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("Task panicked").expect("Insert failed");
        }

        assert_eq!(sess.collection("books").count().await.unwrap(), 10);
    }
}

#[cfg(feature = "postgres")]
mod postgres_tests {
    use rust_data_access::prelude::*;

    #[derive(Debug, Default, PartialEq)]
    struct Note {
        id: i32,
        body: String,
    }

    impl Record for Note {
        fn describe(m: &mut MappingBuilder<Self>) {
            m.field("id,omitempty", |n| &n.id, |n| &mut n.id)
                .field("body", |n| &n.body, |n| &mut n.body);
        }
    }

    #[tokio::test]
    #[ignore = "requires POSTGRES_URL"]
    async fn test_postgres_session() -> Result<()> {
        let url = std::env::var("POSTGRES_URL").expect("POSTGRES_URL not set");
        let sess = Session::open_url(&url).await?;
        sess.exec("DROP TABLE IF EXISTS rda_notes", vec![]).await?;
        sess.exec(
            "CREATE TABLE rda_notes (id SERIAL PRIMARY KEY, body TEXT NOT NULL)",
            vec![],
        )
        .await?;

        let notes = sess.collection("rda_notes");
        let res = notes
            .insert(&Note {
                body: "first".to_string(),
                ..Note::default()
            })
            .await?;
        assert_eq!(res.id_as::<i32>()?, 1);

        let failed: Result<()> = sess
            .with_transaction(|tx| async move {
                tx.collection("rda_notes")
                    .insert(&Note {
                        body: "second".to_string(),
                        ..Note::default()
                    })
                    .await?;
                Err(DatabaseError::other("abort"))
            })
            .await;
        assert!(failed.is_err());

        let all: Vec<Note> = notes.find().order_by("id").limit(10).all().await?;
        assert_eq!(
            all,
            [Note {
                id: 1,
                body: "first".to_string()
            }]
        );

        sess.exec("DROP TABLE rda_notes", vec![]).await?;
        sess.close().await
    }
}
