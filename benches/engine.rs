//! Throughput of local writes and cross-peer patch exchange.

use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use patch_sync::{Config, Engine, Migration, Value};

const USERS_SCHEMA: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT);";

fn new_engine(peer: i64) -> Engine {
    let mut engine = Engine::open_in_memory(peer, Config::default()).unwrap();
    engine
        .migrate(&[Migration::new(USERS_SCHEMA, "DROP TABLE users;")])
        .unwrap();
    engine
}

fn user_row(id: i64) -> HashMap<String, Value> {
    let mut row = HashMap::new();
    row.insert("id".to_string(), Value::Integer(id));
    row.insert("name".to_string(), Value::Text(format!("user_{id}")));
    row.insert("email".to_string(), Value::Text(format!("u{id}@example.com")));
    row
}

fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("Upsert");

    for rows in [100, 1_000] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, &rows| {
            b.iter(|| {
                let mut engine = new_engine(1);
                for id in 0..rows {
                    engine.upsert("users", user_row(id)).unwrap();
                }
                black_box(engine)
            })
        });
    }
    group.finish();
}

fn bench_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("Exchange");

    for rows in [100, 1_000] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, &rows| {
            b.iter(|| {
                let mut source = new_engine(1);
                for id in 0..rows {
                    source.upsert("users", user_row(id)).unwrap();
                }
                let mut sink = new_engine(2);
                for message in source.take_outbox() {
                    sink.handle_message(&message).unwrap();
                }
                black_box(sink)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_upsert, bench_exchange);
criterion_main!(benches);
