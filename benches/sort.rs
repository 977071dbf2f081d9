use criterion::{Criterion, black_box, criterion_group, criterion_main};
use schemata::catalog::schema::ColumnDef;
use schemata::catalog::types::{ColumnType, Row, Value};
use schemata::config::SchemataConfig;
use schemata::declarative::TableSpec;
use schemata::manager::SchemaManager;
use schemata::permission::{AllowAll, CallerContext};
use schemata::session::{ExecutionContext, Session};
use schemata::sort::{ExternalSorter, SortColumn, SortOption, SortStorage};
use schemata::storage::engine::StorageEngine;
use schemata::storage::mapping::StorageMapping;
use schemata::storage::memory::MemoryEngine;
use schemata::storage::row_codec::RowCodec;
use std::sync::Arc;

const SORT_ROWS: i64 = 10_000;

fn fields() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("id", ColumnType::Integer, false),
        ColumnDef::new("name", ColumnType::Text, false),
        ColumnDef::new("age", ColumnType::Integer, false),
    ]
}

fn input() -> Vec<Row> {
    (0..SORT_ROWS)
        .map(|i| {
            // Scatter the keys so the tree sees out-of-order inserts.
            let id = (i * 7_919) % SORT_ROWS;
            Row::from_values(vec![
                Value::Integer(id),
                Value::Text(format!("user-{id}").into()),
                Value::Integer(18 + id % 60),
            ])
        })
        .collect()
}

fn sort_once(
    mapping: &StorageMapping,
    config: &SchemataConfig,
    storage: SortStorage,
    option: SortOption,
    rows: &[Row],
) -> usize {
    let mut session = Session::system();
    let sorted = ExternalSorter::new(
        mapping,
        config,
        fields(),
        vec![SortColumn::asc(2), SortColumn::desc(0)],
        option,
    )
    .expect("sorter")
    .with_storage(storage)
    .sort(
        &mut session,
        rows.iter().cloned().map(Ok),
        &ExecutionContext::new(),
    )
    .expect("sort");
    sorted.map(|row| row.expect("row")).count()
}

fn bench_external_sort(c: &mut Criterion) {
    let config = SchemataConfig::default();
    let engine: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new());
    let mapping = StorageMapping::new(&config, engine).expect("mapping");
    let rows = input();

    c.bench_function("sort_10k_rows_temp_volume", |b| {
        b.iter(|| {
            black_box(sort_once(
                &mapping,
                &config,
                SortStorage::TempVolume,
                SortOption::PreserveDuplicates,
                black_box(&rows),
            ))
        })
    });

    c.bench_function("sort_10k_rows_dedicated_tree", |b| {
        b.iter(|| {
            black_box(sort_once(
                &mapping,
                &config,
                SortStorage::DedicatedTree,
                SortOption::PreserveDuplicates,
                black_box(&rows),
            ))
        })
    });

    c.bench_function("sort_10k_rows_suppress_duplicates", |b| {
        b.iter(|| {
            black_box(sort_once(
                &mapping,
                &config,
                SortStorage::TempVolume,
                SortOption::SuppressDuplicates,
                black_box(&rows),
            ))
        })
    });
}

fn bench_row_codec(c: &mut Criterion) {
    let engine: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new());
    let manager = SchemaManager::open(SchemataConfig::default(), engine, Arc::new(AllowAll))
        .expect("open");
    let mut session = Session::new(CallerContext::new("bench"));
    let id = manager
        .create_table(
            &session,
            TableSpec::new("app", "users")
                .column("id", ColumnType::Integer, false)
                .column("name", ColumnType::Text, false)
                .column("age", ColumnType::Integer, false)
                .primary_key(&["id"]),
        )
        .expect("table");
    let catalog = manager.catalog();
    let table = catalog.table(id).expect("table def");
    let rows = input();

    c.bench_function("encode_decode_row", |b| {
        let row = &rows[0];
        b.iter(|| {
            let key = RowCodec::primary_key(black_box(row), table).expect("key");
            let bytes = RowCodec::encode(black_box(row), table).expect("encode");
            black_box(RowCodec::decode(key.as_slice(), &bytes, table).expect("decode"))
        })
    });

    let mut next = 0usize;
    c.bench_function("write_then_read_row", |b| {
        b.iter(|| {
            let row = &rows[next % rows.len()];
            next += 1;
            let key = RowCodec::write_row(manager.mapping(), &mut session, table, row).expect("write");
            black_box(
                RowCodec::read_row(manager.mapping(), &mut session, table, &key).expect("read"),
            )
        })
    });
}

criterion_group!(benches, bench_external_sort, bench_row_codec);
criterion_main!(benches);
