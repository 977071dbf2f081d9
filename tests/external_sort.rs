use schemata::catalog::types::{ColumnType, Row, Value};
use schemata::config::SchemataConfig;
use schemata::declarative::TableSpec;
use schemata::error::ErrorCode;
use schemata::manager::SchemaManager;
use schemata::permission::{AllowAll, CallerContext};
use schemata::session::{ExecutionContext, Session};
use schemata::sort::{ExternalSorter, SortColumn, SortOption, SortState, SortStorage};
use schemata::storage::engine::StorageEngine;
use schemata::storage::memory::MemoryEngine;
use std::sync::Arc;
use std::time::Duration;

fn open(engine: &Arc<MemoryEngine>, config: SchemataConfig) -> SchemaManager {
    SchemaManager::open(
        config,
        Arc::clone(engine) as Arc<dyn StorageEngine>,
        Arc::new(AllowAll),
    )
    .expect("open")
}

fn scores() -> TableSpec {
    TableSpec::new("game", "scores")
        .column("player", ColumnType::Text, false)
        .column("points", ColumnType::Integer, true)
        .column("ratio", ColumnType::Float, true)
        .primary_key(&["player"])
}

fn score(player: &str, points: Option<i64>, ratio: f64) -> Row {
    Row::from_values(vec![
        Value::Text(player.into()),
        points.map_or(Value::Null, Value::Integer),
        Value::Float(ratio),
    ])
}

#[test]
fn dedicated_sort_tree_lives_in_the_sort_schema_volume_until_drained() {
    let engine = Arc::new(MemoryEngine::new());
    let config = SchemataConfig::default()
        .with_tree_space("system", "sys", "scratch")
        .with_sort_in_temp_volume(false);
    let manager = open(&engine, config.clone());
    let mut session = Session::new(CallerContext::new("app"));
    let id = manager.create_table(&session, scores()).expect("create");
    let catalog = manager.catalog();
    let table = catalog.table(id).expect("table");

    let input = vec![
        score("cat", Some(10), 0.5),
        score("ant", None, 0.1),
        score("bee", Some(30), 0.9),
        score("dog", Some(10), 0.7),
    ];
    let mut sorted = ExternalSorter::new(
        manager.mapping(),
        &config,
        table.columns.clone(),
        vec![SortColumn::desc(1), SortColumn::asc(0)],
        SortOption::PreserveDuplicates,
    )
    .expect("sorter")
    .sort(&mut session, input.into_iter().map(Ok), &ExecutionContext::new())
    .expect("sort");
    assert_eq!(sorted.state(), SortState::Draining);
    assert_eq!(sorted.rows_loaded(), 4);

    let scratch = engine.load_volume("scratch").expect("scratch volume");
    let tree = sorted.tree_name().to_string();
    assert!(engine.tree_names(scratch).expect("names").contains(&tree));
    assert!(!catalog.tree_names().contains(&tree));

    let mut players = Vec::new();
    for row in sorted.by_ref() {
        let row = row.expect("row");
        players.push(row.values[0].clone());
    }
    // Nulls sort low, so a descending column puts them last.
    assert_eq!(
        players,
        vec![
            Value::Text("bee".into()),
            Value::Text("cat".into()),
            Value::Text("dog".into()),
            Value::Text("ant".into()),
        ]
    );
    assert_eq!(sorted.state(), SortState::Closed);
    assert!(!engine.tree_names(scratch).expect("names").contains(&tree));
}

#[test]
fn sorts_in_separate_sessions_use_separate_temp_volumes() {
    let engine = Arc::new(MemoryEngine::new());
    let config = SchemataConfig::default();
    let manager = open(&engine, config.clone());
    let setup = Session::new(CallerContext::new("app"));
    let id = manager.create_table(&setup, scores()).expect("create");
    let catalog = manager.catalog();
    let columns = catalog.table(id).expect("table").columns.clone();

    let sorter = || {
        ExternalSorter::new(
            manager.mapping(),
            &config,
            columns.clone(),
            vec![SortColumn::asc(2)],
            SortOption::PreserveDuplicates,
        )
        .expect("sorter")
        .with_storage(SortStorage::TempVolume)
    };
    let mut alice = Session::new(CallerContext::new("alice"));
    let mut bob = Session::new(CallerContext::new("bob"));
    let ctx = ExecutionContext::new();
    let mut first = sorter()
        .sort(&mut alice, vec![Ok(score("a", Some(1), 0.3))], &ctx)
        .expect("alice sort");
    let second = sorter()
        .sort(&mut bob, vec![Ok(score("b", Some(2), 0.2))], &ctx)
        .expect("bob sort");
    assert_eq!(engine.temporary_volume_count(), 2);

    first.close().expect("close");
    first.close().expect("second close is a no-op");
    assert_eq!(engine.temporary_volume_count(), 1);
    drop(second);
    assert_eq!(engine.temporary_volume_count(), 0);
    assert!(!alice.has_temp_volume());
    assert!(!bob.has_temp_volume());
}

#[test]
fn configured_query_timeout_applies_when_the_context_has_none() {
    let engine = Arc::new(MemoryEngine::new());
    let config = SchemataConfig::default()
        .with_sort_in_temp_volume(false)
        .with_query_timeout(Duration::ZERO);
    let manager = open(&engine, config.clone());
    let mut session = Session::new(CallerContext::new("app"));
    let id = manager.create_table(&session, scores()).expect("create");
    let columns = manager.catalog().table(id).expect("table").columns.clone();
    let before = engine
        .tree_names(engine.load_volume("default").expect("volume"))
        .expect("names");

    let err = ExternalSorter::new(
        manager.mapping(),
        &config,
        columns,
        vec![SortColumn::asc(0)],
        SortOption::SuppressDuplicates,
    )
    .expect("sorter")
    .sort(
        &mut session,
        vec![Ok(score("a", Some(1), 0.1))],
        &ExecutionContext::new(),
    )
    .expect_err("timed out");
    assert_eq!(err.code(), ErrorCode::QueryTimeout);
    let after = engine
        .tree_names(engine.load_volume("default").expect("volume"))
        .expect("names");
    assert_eq!(before, after);
}

#[test]
fn input_errors_abort_the_sort() {
    let engine = Arc::new(MemoryEngine::new());
    let config = SchemataConfig::default();
    let manager = open(&engine, config.clone());
    let mut session = Session::new(CallerContext::new("app"));
    let id = manager.create_table(&session, scores()).expect("create");
    let columns = manager.catalog().table(id).expect("table").columns.clone();

    let input = vec![
        Ok(score("a", Some(1), 0.1)),
        Err(schemata::error::SchemataError::Validation("bad upstream row".into())),
        Ok(score("b", Some(2), 0.2)),
    ];
    let err = ExternalSorter::new(
        manager.mapping(),
        &config,
        columns,
        vec![SortColumn::asc(0)],
        SortOption::PreserveDuplicates,
    )
    .expect("sorter")
    .sort(&mut session, input, &ExecutionContext::new())
    .expect_err("upstream failure");
    assert_eq!(err.code(), ErrorCode::Validation);
    assert_eq!(engine.temporary_volume_count(), 0);
    assert!(!session.has_temp_volume());
}
