//! Criterion benchmarks for rust_data_access

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_data_access::core::mapper::{decode, encode, mapping};
use rust_data_access::prelude::*;
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct Author {
    id: i64,
    first_name: String,
    last_name: String,
}

impl Record for Author {
    fn describe(m: &mut MappingBuilder<Self>) {
        m.field("author_id", |a| &a.id, |a| &mut a.id)
            .field("first_name", |a| &a.first_name, |a| &mut a.first_name)
            .field("last_name", |a| &a.last_name, |a| &mut a.last_name);
    }
}

#[derive(Debug, Default, Clone)]
struct BookDetail {
    id: i64,
    title: String,
    subject_id: Option<i64>,
    author: Author,
}

impl Record for BookDetail {
    fn describe(m: &mut MappingBuilder<Self>) {
        m.field("id,omitempty", |b| &b.id, |b| &mut b.id)
            .field("title", |b| &b.title, |b| &mut b.title)
            .field("subject_id", |b| &b.subject_id, |b| &mut b.subject_id)
            .inline(",inline", |b| &b.author, |b| &mut b.author);
    }
}

fn sample() -> BookDetail {
    BookDetail {
        id: 7808,
        title: "The Shining".to_string(),
        subject_id: Some(9),
        author: Author {
            id: 4156,
            first_name: "Stephen".to_string(),
            last_name: "King".to_string(),
        },
    }
}

// ============================================================================
// Statement Compilation Benchmarks
// ============================================================================

fn bench_statement_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("statement_compile");
    group.throughput(Throughput::Elements(1));

    let simple = Selector::new()
        .from("books")
        .where_(cond("id", 7808))
        .order_by("title");

    let joined = Selector::new()
        .columns(&["b.id", "b.title", "a.id AS author_id", "a.last_name"])
        .from("books AS b")
        .join("authors AS a", Condition::raw("b.author_id = a.id"))
        .where_(cond("a.last_name", "King"))
        .and(cond("b.title LIKE", "T%").or(Condition::is_null("b.subject_id")))
        .order_by("-b.title")
        .limit(10)
        .offset(20);

    group.bench_function("select_simple", |b| {
        b.iter(|| black_box(simple.to_statement().unwrap()));
    });

    group.bench_function("select_join", |b| {
        b.iter(|| black_box(joined.to_statement().unwrap()));
    });

    group.bench_function("select_join_postgres", |b| {
        b.iter(|| black_box(joined.compile(Dialect::Postgres).unwrap()));
    });

    group.bench_function("count", |b| {
        b.iter(|| black_box(joined.count_statement().unwrap()));
    });

    group.bench_function("derive_and_compile", |b| {
        b.iter(|| {
            let q = simple.and(cond("subject_id", black_box(9)));
            black_box(q.to_statement().unwrap())
        });
    });

    let update = Updater::new("books")
        .set("title", "The Stand")
        .set_raw("edition = edition + ?", vec![1.into()])
        .where_(cond("id", 7808));
    group.bench_function("update", |b| {
        b.iter(|| black_box(update.to_statement().unwrap()));
    });

    group.finish();
}

fn bench_in_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_list");

    for size in [10usize, 100, 1000] {
        let ids: Vec<i64> = (0..size as i64).collect();
        let q = Selector::new()
            .from("books")
            .where_(Condition::is_in("id", ids));
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &q, |b, q| {
            b.iter(|| black_box(q.compile(Dialect::Postgres).unwrap()));
        });
    }

    group.finish();
}

fn bench_named_statement(c: &mut Criterion) {
    c.bench_function("named_statement", |b| {
        b.iter(|| {
            let stmt = Statement::named(
                "SELECT * FROM books WHERE author_id = :author AND title LIKE :title",
                &[("author", 4156.into()), ("title", "T%".into())],
            );
            black_box(stmt.unwrap())
        });
    });
}

// ============================================================================
// Record Mapping Benchmarks
// ============================================================================

fn bench_record_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_mapping");
    group.throughput(Throughput::Elements(1));

    let book = sample();
    let pairs = encode(&book).unwrap();
    let (columns, values): (Vec<String>, Vec<DatabaseValue>) = pairs.into_iter().unzip();
    let row = DatabaseRow::new(Arc::from(columns), values);

    group.bench_function("mapping_lookup", |b| {
        b.iter(|| black_box(mapping::<BookDetail>().unwrap()));
    });

    group.bench_function("encode", |b| {
        b.iter(|| black_box(encode(black_box(&book)).unwrap()));
    });

    group.bench_function("decode", |b| {
        b.iter(|| {
            let decoded: BookDetail = decode(black_box(&row)).unwrap();
            black_box(decoded)
        });
    });

    let m = mapping::<BookDetail>().unwrap();
    group.bench_function("decode_into", |b| {
        let mut target = BookDetail::default();
        b.iter(|| {
            m.decode_into(black_box(&row), &mut target).unwrap();
            black_box(&target);
        });
    });

    group.finish();
}

// ============================================================================
// Criterion Configuration
// ============================================================================

criterion_group!(
    benches,
    bench_statement_compile,
    bench_in_list,
    bench_named_statement,
    bench_record_mapping
);

criterion_main!(benches);
