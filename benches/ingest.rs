use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parquedb::config::ParqueDbConfig;
use parquedb::query::QueryOptions;
use parquedb::ParqueDb;
use serde_json::json;
use tempfile::TempDir;

fn bench_create(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let mut config = ParqueDbConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.event_log.sync_on_write = false;
    config.snapshot.auto_snapshot = false;
    let db = runtime.block_on(ParqueDb::open_in_memory(config)).unwrap();

    let mut i = 0u64;
    c.bench_function("create_document", |b| {
        b.iter(|| {
            i += 1;
            runtime
                .block_on(db.create(
                    "bench",
                    &format!("doc-{i}"),
                    json!({"title": "benchmark", "n": i}),
                    None,
                ))
                .unwrap();
        })
    });
}

fn bench_get_cached(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let mut config = ParqueDbConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.event_log.sync_on_write = false;
    let db = runtime.block_on(ParqueDb::open_in_memory(config)).unwrap();

    runtime
        .block_on(db.create("bench", "hot", json!({"title": "cached"}), None))
        .unwrap();

    c.bench_function("get_cached_entity", |b| {
        b.iter(|| {
            let doc = runtime
                .block_on(db.get("bench", "hot", &Default::default()))
                .unwrap();
            black_box(doc);
        })
    });
}

fn bench_find_live(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let mut config = ParqueDbConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.event_log.sync_on_write = false;
    config.snapshot.auto_snapshot = false;
    let db = runtime.block_on(ParqueDb::open_in_memory(config)).unwrap();

    runtime.block_on(async {
        for i in 0..1000 {
            db.create("bench", &format!("doc-{i:04}"), json!({"n": i}), None)
                .await
                .unwrap();
        }
    });

    c.bench_function("find_limit_10_over_1k", |b| {
        b.iter(|| {
            let page = runtime
                .block_on(db.find(
                    "bench",
                    &json!({"n": {"$gte": 500}}),
                    QueryOptions {
                        limit: Some(10),
                        ..Default::default()
                    },
                ))
                .unwrap();
            black_box(page);
        })
    });
}

criterion_group!(benches, bench_create, bench_get_cached, bench_find_live);
criterion_main!(benches);
