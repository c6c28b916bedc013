//! Benchmark: commit throughput with subscription fan-out.
//!
//! Measures:
//! - A single-event commit with N subscribers over the written table
//! - A batched commit against one subscriber
//! - Thunk recomputation along a chain of derived values

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde::{Deserialize, Serialize};

use tessera_core::prelude::*;

#[derive(Serialize, Deserialize)]
struct TodoCreated {
    id: i64,
    text: String,
}

fn todo_created() -> EventDef<TodoCreated> {
    EventDef::new("todo_created")
}

fn store() -> Store {
    let schema = Schema::new()
        .table(TableDef::new("todos", "create table todos (id integer primary key, text text not null)"))
        .materializer(&todo_created(), |args: &TodoCreated, _| {
            Ok(vec![SqlStatement::new("insert into todos (id, text) values (?, ?)")
                .bind(args.id)
                .bind(args.text.as_str())])
        });
    let config = StoreConfig {
        verify_materializer_hashes: false,
        ..StoreConfig::default()
    };
    Store::builder(schema, tessera_core::sql::SqliteEngine::open_in_memory().unwrap())
        .config(config)
        .build()
        .unwrap()
}

fn event(id: i64) -> PartialEvent {
    todo_created()
        .make(&TodoCreated {
            id,
            text: format!("todo {id}"),
        })
        .unwrap()
}

fn benchmark_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_fan_out");

    for subscribers in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(subscribers), &subscribers, |b, &n| {
            let store = store();
            // Distinct SQL per subscriber so each one owns a live query
            let subs: Vec<_> = (0..n)
                .map(|i| {
                    let def = query_db(
                        QueryInput::new("select count(*) from todos where id > ?").bind(i as i64),
                        Scalar::<i64>::new(),
                    );
                    store
                        .subscribe(&def, |n| {
                            black_box(*n);
                        }, SubscribeOptions::default())
                        .unwrap()
                })
                .collect();

            let mut next = 0;
            b.iter(|| {
                next += 1;
                store.commit([event(next)]).unwrap();
            });
            drop(subs);
        });
    }

    group.finish();
}

fn benchmark_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_batch");

    for size in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let store = store();
            let count = query_db("select count(*) from todos", Scalar::<i64>::new());
            let _sub = store
                .subscribe(&count, |n| {
                    black_box(*n);
                }, SubscribeOptions::default())
                .unwrap();

            let mut next = 0i64;
            b.iter(|| {
                let events: Vec<_> = (0..size)
                    .map(|_| {
                        next += 1;
                        event(next)
                    })
                    .collect();
                store.commit(events).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_thunk_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("thunk_chain");

    for depth in [10usize, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let runtime = Runtime::new();
            let source = runtime.make_ref(0i64, AtomOptions::new());
            let mut last = runtime.make_thunk(move |get| Ok(*get.get(&source)? + 1), AtomOptions::new());
            for _ in 1..depth {
                let prev = last;
                last = runtime.make_thunk(move |get| Ok(*get.get(&prev)? + 1), AtomOptions::new());
            }

            let mut value = 0;
            b.iter(|| {
                value += 1;
                runtime.set_ref(&source, value).unwrap();
                black_box(runtime.compute(&last).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_fan_out, benchmark_batch, benchmark_thunk_chain);
criterion_main!(benches);
