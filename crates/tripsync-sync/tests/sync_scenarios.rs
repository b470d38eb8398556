use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use tripsync_core::{ColumnSpec, ColumnType, EntitySpec, FieldValue, Ident};
use tripsync_storage::{derive_surrogate_key, derive_surrogate_key_from_fields, MemoryStore};
use tripsync_sync::{
    EntityRegistry, MergeMode, NoopObserver, RecordingObserver, SchemaChange, SyncEngine, SyncError,
    SyncEvent, SyncRequest, SyncStage,
};

const STAGING: &str = "_stg_trips";
const FINAL: &str = "trips";

fn ident(name: &str) -> Ident {
    Ident::new(name).expect("ident")
}

fn entity() -> EntitySpec {
    EntitySpec {
        entity_type: "trips".to_string(),
        staging_relation: ident(STAGING),
        final_relation: ident(FINAL),
        business_key: vec![ident("vendor_id"), ident("pickup")],
        tie_break: ident("total_amount"),
        columns: [
            ("vendor_id", ColumnType::Integer),
            ("pickup", ColumnType::Timestamp),
            ("total_amount", ColumnType::Double),
            ("y", ColumnType::Text),
        ]
        .into_iter()
        .map(|(name, column_type)| ColumnSpec {
            name: ident(name),
            column_type,
        })
        .collect(),
    }
}

fn engine() -> SyncEngine {
    let registry = EntityRegistry::new(vec![entity()]).expect("registry");
    SyncEngine::new(registry).with_observer(Box::new(NoopObserver))
}

fn request() -> SyncRequest {
    SyncRequest::for_entity(&entity())
}

fn pickup() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(8, 0, 0))
        .expect("timestamp")
}

fn base_columns() -> Vec<(&'static str, ColumnType)> {
    vec![
        ("vendor_id", ColumnType::Integer),
        ("pickup", ColumnType::Timestamp),
        ("total_amount", ColumnType::Double),
        ("y", ColumnType::Text),
    ]
}

fn trip(vendor: i64, total: f64, y: &str) -> Vec<FieldValue> {
    vec![
        FieldValue::Int(vendor),
        FieldValue::Timestamp(pickup()),
        FieldValue::Float(total),
        FieldValue::Text(y.to_string()),
    ]
}

/// Staging with one duplicated business key: (1, pickup) appears with totals
/// 10.0 and 25.0.
fn seeded_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    store
        .load_relation(
            STAGING,
            &base_columns(),
            vec![trip(1, 10.0, "a"), trip(1, 25.0, "b"), trip(2, 5.0, "c")],
        )
        .expect("load staging");
    store
}

#[tokio::test]
async fn first_run_creates_final_and_keeps_highest_tie_break() {
    let mut store = seeded_store();
    let result = engine().synchronize(&mut store, &request()).await.expect("sync");

    assert!(result.final_created);
    assert_eq!(result.rows_deduplicated, 1);
    assert_eq!(result.rows_inserted, 2);
    assert_eq!(store.row_count(STAGING), 2);
    assert_eq!(store.row_count(FINAL), 2);
    assert_eq!(
        store.column_values(FINAL, "total_amount"),
        vec![FieldValue::Float(25.0), FieldValue::Float(5.0)]
    );
    assert_eq!(
        store.column_values(FINAL, "y"),
        vec![FieldValue::Text("b".into()), FieldValue::Text("c".into())]
    );
}

#[tokio::test]
async fn rerun_is_a_no_op() {
    let mut store = seeded_store();
    let engine = engine();
    engine.synchronize(&mut store, &request()).await.expect("first run");
    let applied = store.statements().len();

    let result = engine.synchronize(&mut store, &request()).await.expect("second run");
    assert!(!result.final_created);
    assert_eq!(result.rows_deduplicated, 0);
    assert_eq!(result.rows_inserted, 0);
    assert!(result.columns_added.is_empty());
    assert!(result.columns_archived.is_empty());
    assert_eq!(store.row_count(FINAL), 2);

    let rerun = &store.statements()[applied..];
    assert!(rerun.iter().all(|s| !s.starts_with("ALTER") && !s.starts_with("CREATE")), "{rerun:?}");
}

#[tokio::test]
async fn final_rows_carry_the_standalone_surrogate_key() {
    let mut store = seeded_store();
    engine().synchronize(&mut store, &request()).await.expect("sync");

    let expected = derive_surrogate_key([Some("1"), Some("2024-01-01 08:00:00")]);
    assert_eq!(
        derive_surrogate_key_from_fields(&[FieldValue::Int(1), FieldValue::Timestamp(pickup())]),
        expected
    );
    let keys = store.column_values(FINAL, "surrogate_key");
    assert_eq!(keys[0], FieldValue::Text(expected));

    let distinct = keys
        .iter()
        .filter_map(|k| match k {
            FieldValue::Text(k) => Some(k.as_str()),
            _ => None,
        })
        .collect::<HashSet<_>>();
    assert_eq!(distinct.len(), keys.len());
}

#[tokio::test]
async fn new_staging_column_is_added_with_nulls_for_old_rows() {
    let mut store = seeded_store();
    let engine = engine();
    engine.synchronize(&mut store, &request()).await.expect("first run");

    let mut columns = base_columns();
    columns.push(("x", ColumnType::Double));
    let mut row = trip(3, 8.0, "d");
    row.push(FieldValue::Float(1.5));
    store.load_relation(STAGING, &columns, vec![row]).expect("reload");

    let result = engine.synchronize(&mut store, &request()).await.expect("second run");
    assert_eq!(result.columns_added, vec!["x".to_string()]);
    assert_eq!(result.rows_inserted, 1);
    assert_eq!(
        store.column_values(FINAL, "x"),
        vec![FieldValue::Null, FieldValue::Null, FieldValue::Float(1.5)]
    );
}

#[tokio::test]
async fn staging_column_ending_in_archived_is_added_and_merged() {
    let mut store = seeded_store();
    let engine = engine();
    engine.synchronize(&mut store, &request()).await.expect("first run");

    let mut columns = base_columns();
    columns.push(("is_archived", ColumnType::Boolean));
    let mut row = trip(3, 8.0, "d");
    row.push(FieldValue::Bool(true));
    store.load_relation(STAGING, &columns, vec![row]).expect("reload");

    let result = engine.synchronize(&mut store, &request()).await.expect("second run");
    assert_eq!(result.columns_added, vec!["is_archived".to_string()]);
    assert_eq!(result.rows_inserted, 1);
    assert_eq!(
        store.column_values(FINAL, "is_archived"),
        vec![FieldValue::Null, FieldValue::Null, FieldValue::Bool(true)]
    );

    let rerun = engine.synchronize(&mut store, &request()).await.expect("third run");
    assert!(rerun.columns_added.is_empty());
    assert!(rerun.columns_archived.is_empty());
    assert_eq!(rerun.rows_inserted, 0);
}

#[tokio::test]
async fn dropped_staging_column_is_archived_with_its_data() {
    let mut store = seeded_store();
    let engine = engine();
    engine.synchronize(&mut store, &request()).await.expect("first run");

    let columns = base_columns().into_iter().filter(|(c, _)| *c != "y").collect::<Vec<_>>();
    let mut row = trip(3, 8.0, "unused");
    row.pop();
    store.load_relation(STAGING, &columns, vec![row]).expect("reload");

    let result = engine.synchronize(&mut store, &request()).await.expect("second run");
    assert_eq!(result.columns_archived, vec!["y".to_string()]);
    assert!(store.column_values(FINAL, "y").is_empty());
    assert_eq!(
        store.column_values(FINAL, "y_archived"),
        vec![
            FieldValue::Text("b".into()),
            FieldValue::Text("c".into()),
            FieldValue::Null
        ]
    );
}

#[tokio::test]
async fn retyped_column_keeps_old_values_in_archive() {
    let mut store = seeded_store();
    let engine = engine();
    engine.synchronize(&mut store, &request()).await.expect("first run");

    let columns = base_columns()
        .into_iter()
        .map(|(c, t)| if c == "y" { (c, ColumnType::Integer) } else { (c, t) })
        .collect::<Vec<_>>();
    let mut row = trip(3, 8.0, "");
    row[3] = FieldValue::Int(42);
    store.load_relation(STAGING, &columns, vec![row]).expect("reload");

    let result = engine.synchronize(&mut store, &request()).await.expect("second run");
    assert_eq!(result.columns_retyped, vec!["y".to_string()]);

    let final_relation = store.relation(FINAL).expect("final");
    assert!(final_relation
        .columns
        .iter()
        .any(|(name, ty)| name.as_str() == "y" && *ty == ColumnType::Integer));
    assert_eq!(
        store.column_values(FINAL, "y"),
        vec![FieldValue::Null, FieldValue::Null, FieldValue::Int(42)]
    );
    assert_eq!(
        store.column_values(FINAL, "y_archived"),
        vec![
            FieldValue::Text("b".into()),
            FieldValue::Text("c".into()),
            FieldValue::Null
        ]
    );
}

#[tokio::test]
async fn taken_archive_name_is_a_schema_conflict() {
    let mut store = seeded_store();
    let engine = engine();
    engine.synchronize(&mut store, &request()).await.expect("first run");

    let without_y = base_columns().into_iter().filter(|(c, _)| *c != "y").collect::<Vec<_>>();
    store.load_relation(STAGING, &without_y, Vec::new()).expect("drop y");
    engine.synchronize(&mut store, &request()).await.expect("archive y");

    store.load_relation(STAGING, &base_columns(), Vec::new()).expect("y returns");
    engine.synchronize(&mut store, &request()).await.expect("re-add y");

    store.load_relation(STAGING, &without_y, Vec::new()).expect("drop y again");
    let applied = store.statements().len();
    let err = engine.synchronize(&mut store, &request()).await.unwrap_err();
    assert!(matches!(err, SyncError::SchemaConflict { .. }), "{err}");
    assert_eq!(store.statements().len(), applied, "no DDL after a planned conflict");
}

#[tokio::test]
async fn upsert_rewrites_changed_rows_and_insert_only_does_not() {
    let mut store = seeded_store();
    let engine = engine();
    engine.synchronize(&mut store, &request()).await.expect("first run");

    store
        .load_relation(STAGING, &base_columns(), vec![trip(2, 7.0, "c")])
        .expect("reload");
    let result = engine.synchronize(&mut store, &request()).await.expect("insert-only");
    assert_eq!(result.rows_updated, 0);
    assert_eq!(result.rows_inserted, 0);
    assert_eq!(store.column_values(FINAL, "total_amount")[1], FieldValue::Float(5.0));

    let upsert = request().with_mode(MergeMode::Upsert);
    let result = engine.synchronize(&mut store, &upsert).await.expect("upsert");
    assert_eq!(result.rows_updated, 1);
    assert_eq!(result.rows_inserted, 0);
    assert_eq!(store.column_values(FINAL, "total_amount")[1], FieldValue::Float(7.0));
    assert!(!store.column_values(FINAL, "update_time")[1].is_null());
    assert!(store.column_values(FINAL, "update_time")[0].is_null());
}

#[tokio::test]
async fn unknown_entity_is_rejected_before_any_statement() {
    let mut store = seeded_store();
    let mut request = request();
    request.entity_type = "fhv_trips".into();

    let err = engine().synchronize(&mut store, &request).await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownEntityType { .. }), "{err}");
    assert!(store.statements().is_empty());
}

#[tokio::test]
async fn missing_staging_or_key_column_aborts_early() {
    let mut store = MemoryStore::new();
    let err = engine().synchronize(&mut store, &request()).await.unwrap_err();
    assert!(matches!(err, SyncError::RelationNotFound(_)), "{err}");

    let columns = base_columns().into_iter().filter(|(c, _)| *c != "pickup").collect::<Vec<_>>();
    store.load_relation(STAGING, &columns, Vec::new()).expect("load");
    let err = engine().synchronize(&mut store, &request()).await.unwrap_err();
    assert!(matches!(err, SyncError::MissingColumn { .. }), "{err}");
    assert!(store.statements().is_empty());
}

#[tokio::test]
async fn stages_are_reported_in_order() {
    let observer = Arc::new(RecordingObserver::default());
    let registry = EntityRegistry::new(vec![entity()]).expect("registry");
    let engine = SyncEngine::new(registry).with_observer(Box::new(observer.clone()));

    let mut store = seeded_store();
    engine.synchronize(&mut store, &request()).await.expect("sync");

    assert_eq!(
        observer.stages(),
        vec![
            SyncStage::Start,
            SyncStage::SchemaReconciled,
            SyncStage::StageDeduped,
            SyncStage::IdentitiesDerived,
            SyncStage::Merged,
            SyncStage::Done,
        ]
    );
    let events = observer.events();
    assert!(matches!(events.first(), Some(SyncEvent::RunStarted { .. })));
    assert!(events.iter().any(|e| matches!(e, SyncEvent::FinalCreated { .. })));
}

#[tokio::test]
async fn failed_merge_keeps_earlier_effects_and_rerun_recovers() {
    let observer = Arc::new(RecordingObserver::default());
    let registry = EntityRegistry::new(vec![entity()]).expect("registry");
    let engine = SyncEngine::new(registry).with_observer(Box::new(observer.clone()));

    let mut store = seeded_store();
    store.fail_on("INSERT INTO");
    let err = engine.synchronize(&mut store, &request()).await.unwrap_err();
    assert!(matches!(err, SyncError::StoreUnavailable(_)), "{err}");

    assert!(store.relation(FINAL).is_some(), "final creation is not rolled back");
    assert_eq!(store.row_count(STAGING), 2, "dedup is not rolled back");
    assert_eq!(store.row_count(FINAL), 0);
    assert!(matches!(
        observer.events().last(),
        Some(SyncEvent::RunFailed {
            stage: SyncStage::IdentitiesDerived,
            ..
        })
    ));

    let result = engine.synchronize(&mut store, &request()).await.expect("rerun");
    assert_eq!(result.rows_inserted, 2);
}

#[tokio::test]
async fn plan_reports_changes_without_applying_them() {
    let mut store = seeded_store();
    let engine = engine();

    let plan = engine.plan(&mut store, &request()).await.expect("plan");
    assert_eq!(plan.changes, vec![SchemaChange::CreateFinal { relation: ident(FINAL) }]);
    assert!(store.statements().is_empty());

    engine.synchronize(&mut store, &request()).await.expect("sync");
    let mut columns = base_columns();
    columns.push(("x", ColumnType::Double));
    store.load_relation(STAGING, &columns, Vec::new()).expect("reload");
    let applied = store.statements().len();

    let plan = engine.plan(&mut store, &request()).await.expect("plan");
    assert_eq!(
        plan.changes,
        vec![SchemaChange::AddColumn {
            column: ident("x"),
            column_type: ColumnType::Double,
        }]
    );
    assert_eq!(store.statements().len(), applied);
}

#[test]
fn events_serialize_with_a_tag() {
    let event = SyncEvent::StageReached {
        stage: SyncStage::SchemaReconciled,
    };
    let json = serde_json::to_value(&event).expect("json");
    assert_eq!(json["event"], "stage_reached");
    assert_eq!(json["stage"], "SCHEMA_RECONCILED");
}
